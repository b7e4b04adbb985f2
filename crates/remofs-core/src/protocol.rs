//! Wire Protocol - length-prefixed binary frames
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! [u32 length][u8 opcode][u32 correlation id][payload ...]
//! ```
//!
//! `length` counts opcode + correlation id + payload. Correlation id 0 is
//! reserved for the auth exchange and unsolicited change notifications.
//! Every `*Response` payload starts with a [`Status`] byte.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{RemoteFsError, Result};

pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
const HEADER_LEN: usize = 5;

/// Correlation id carried by unsolicited frames
pub const PUSH_CORRELATION: u32 = 0;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    AuthChallenge = 0x01,
    AuthResponse = 0x02,
    Exists = 0x03,
    ReadFile = 0x04,
    Search = 0x05,
    Watch = 0x06,
    Unwatch = 0x07,
    Shutdown = 0x08,
    ExistsResponse = 0x83,
    ReadFileResponse = 0x84,
    SearchResponse = 0x85,
    WatchResponse = 0x86,
    UnwatchResponse = 0x87,
    ShutdownResponse = 0x88,
    ChangeNotification = 0x90,
}

impl Opcode {
    /// Response opcode paired with a request opcode
    pub fn response(self) -> Option<Opcode> {
        match self {
            Opcode::Exists => Some(Opcode::ExistsResponse),
            Opcode::ReadFile => Some(Opcode::ReadFileResponse),
            Opcode::Search => Some(Opcode::SearchResponse),
            Opcode::Watch => Some(Opcode::WatchResponse),
            Opcode::Unwatch => Some(Opcode::UnwatchResponse),
            Opcode::Shutdown => Some(Opcode::ShutdownResponse),
            _ => None,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = RemoteFsError;

    fn try_from(byte: u8) -> Result<Self> {
        let opcode = match byte {
            0x01 => Opcode::AuthChallenge,
            0x02 => Opcode::AuthResponse,
            0x03 => Opcode::Exists,
            0x04 => Opcode::ReadFile,
            0x05 => Opcode::Search,
            0x06 => Opcode::Watch,
            0x07 => Opcode::Unwatch,
            0x08 => Opcode::Shutdown,
            0x83 => Opcode::ExistsResponse,
            0x84 => Opcode::ReadFileResponse,
            0x85 => Opcode::SearchResponse,
            0x86 => Opcode::WatchResponse,
            0x87 => Opcode::UnwatchResponse,
            0x88 => Opcode::ShutdownResponse,
            0x90 => Opcode::ChangeNotification,
            other => return Err(RemoteFsError::violation(format!("unknown opcode 0x{other:02x}"))),
        };
        Ok(opcode)
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: Opcode,
    pub correlation_id: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(opcode: Opcode, correlation_id: u32, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            correlation_id,
            payload,
        }
    }

    /// Response frame: status byte followed by the body or error detail
    pub fn response(opcode: Opcode, correlation_id: u32, result: Result<Vec<u8>>) -> Self {
        Self::new(opcode, correlation_id, encode_status(result))
    }

    pub fn notification(change: &ChangeNotification) -> Result<Self> {
        Ok(Self::new(Opcode::ChangeNotification, PUSH_CORRELATION, to_json(change)?))
    }
}

/// Read one frame, suspending until it is complete
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let len = reader.read_u32().await? as usize;
    if !(HEADER_LEN..=MAX_FRAME_LEN).contains(&len) {
        return Err(RemoteFsError::violation(format!("frame length {len} out of range")));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    let opcode = Opcode::try_from(buf[0])?;
    let correlation_id = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    buf.drain(..HEADER_LEN);

    Ok(Frame::new(opcode, correlation_id, buf))
}

/// Write one frame and flush it through
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let len = HEADER_LEN + frame.payload.len();
    if len > MAX_FRAME_LEN {
        return Err(RemoteFsError::Failed(format!("frame of {len} bytes exceeds limit")));
    }

    let mut buf = Vec::with_capacity(4 + len);
    buf.extend_from_slice(&(len as u32).to_be_bytes());
    buf.push(frame.opcode as u8);
    buf.extend_from_slice(&frame.correlation_id.to_be_bytes());
    buf.extend_from_slice(&frame.payload);

    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Leading byte of every response payload
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok = 0,
    NotFound = 1,
    Unauthorized = 2,
    Failed = 3,
}

fn encode_status(result: Result<Vec<u8>>) -> Vec<u8> {
    let (status, mut body) = match result {
        Ok(body) => (Status::Ok, body),
        Err(RemoteFsError::NotFound(path)) => (Status::NotFound, path.into_bytes()),
        Err(RemoteFsError::Unauthorized) => (Status::Unauthorized, Vec::new()),
        Err(e) => (Status::Failed, e.to_string().into_bytes()),
    };
    body.insert(0, status as u8);
    body
}

/// Split a response payload into its body, or the error it carries
pub fn decode_status(payload: &[u8]) -> Result<&[u8]> {
    let (&status, body) = payload
        .split_first()
        .ok_or_else(|| RemoteFsError::violation("empty response payload"))?;
    let detail = || String::from_utf8_lossy(body).into_owned();
    match status {
        0 => Ok(body),
        1 => Err(RemoteFsError::NotFound(detail())),
        2 => Err(RemoteFsError::Unauthorized),
        3 => Err(RemoteFsError::Failed(detail())),
        other => Err(RemoteFsError::violation(format!("unknown status {other}"))),
    }
}

/// File content body: `u64` length then the raw bytes
pub fn encode_file_body(content: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(8 + content.len());
    body.extend_from_slice(&(content.len() as u64).to_be_bytes());
    body.extend_from_slice(content);
    body
}

pub fn decode_file_body(body: &[u8]) -> Result<Vec<u8>> {
    if body.len() < 8 {
        return Err(RemoteFsError::violation("truncated file body"));
    }
    let (len, content) = body.split_at(8);
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(len);
    if u64::from_be_bytes(len_bytes) != content.len() as u64 {
        return Err(RemoteFsError::violation("file body length mismatch"));
    }
    Ok(content.to_vec())
}

pub fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| RemoteFsError::Failed(e.to_string()))
}

pub fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| RemoteFsError::violation(format!("malformed body: {e}")))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRequest {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub root: String,
    #[serde(default)]
    pub pattern: String,
    /// Non-positive means unlimited
    #[serde(default)]
    pub depth: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchRequest {
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// Push payload for `ChangeNotification`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub path: String,
    pub kind: ChangeKind,
}

/// Requests accepted once a session is authenticated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Exists(PathRequest),
    ReadFile(PathRequest),
    Search(SearchRequest),
    Watch(WatchRequest),
    Unwatch(PathRequest),
    Shutdown,
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Exists(_) => Opcode::Exists,
            Request::ReadFile(_) => Opcode::ReadFile,
            Request::Search(_) => Opcode::Search,
            Request::Watch(_) => Opcode::Watch,
            Request::Unwatch(_) => Opcode::Unwatch,
            Request::Shutdown => Opcode::Shutdown,
        }
    }

    pub fn decode(frame: &Frame) -> Result<Self> {
        let body = &frame.payload;
        let request = match frame.opcode {
            Opcode::Exists => Request::Exists(from_json(body)?),
            Opcode::ReadFile => Request::ReadFile(from_json(body)?),
            Opcode::Search => Request::Search(from_json(body)?),
            Opcode::Watch => Request::Watch(from_json(body)?),
            Opcode::Unwatch => Request::Unwatch(from_json(body)?),
            Opcode::Shutdown => Request::Shutdown,
            other => return Err(RemoteFsError::violation(format!("{other:?} is not a request"))),
        };
        Ok(request)
    }

    pub fn encode(&self, correlation_id: u32) -> Result<Frame> {
        let payload = match self {
            Request::Exists(body) | Request::ReadFile(body) | Request::Unwatch(body) => to_json(body)?,
            Request::Search(body) => to_json(body)?,
            Request::Watch(body) => to_json(body)?,
            Request::Shutdown => Vec::new(),
        };
        Ok(Frame::new(self.opcode(), correlation_id, payload))
    }
}
