//! Remote FS Client
//!
//! Multiplexes requests over one connection: each request gets a fresh
//! correlation id and waits for the matching response, while change
//! notifications are queued for `next_change`.

use remofs_core::protocol::{
    decode_file_body, decode_status, from_json, read_frame, write_frame, PathRequest, SearchRequest,
    WatchRequest, PUSH_CORRELATION,
};
use remofs_core::{ChangeNotification, FileSystemState, Frame, Opcode, RemoteFsError, Request, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::auth::answer_challenge;
use crate::tls;

/// `None` once the connection is gone
type Pending = Arc<Mutex<Option<HashMap<u32, oneshot::Sender<Frame>>>>>;

pub struct RemoteFsClient {
    next_id: AtomicU32,
    pending: Pending,
    requests: mpsc::UnboundedSender<Frame>,
    changes: mpsc::UnboundedReceiver<ChangeNotification>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl RemoteFsClient {
    /// Connect over TLS and authenticate
    pub async fn connect(addr: impl ToSocketAddrs, secret: &[u8]) -> Result<Self> {
        let tcp = TcpStream::connect(addr).await?;
        let connector = tls::connector().map_err(|e| RemoteFsError::Failed(format!("TLS setup: {e}")))?;
        let name = tls::server_name().map_err(|e| RemoteFsError::Failed(format!("TLS server name: {e}")))?;
        let stream = connector.connect(name, tcp).await?;
        Self::handshake(stream, secret).await
    }

    /// Authenticate over an already established stream
    pub async fn handshake<S>(stream: S, secret: &[u8]) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        answer_challenge(&mut reader, &mut writer, secret).await?;

        let pending: Pending = Arc::new(Mutex::new(Some(HashMap::new())));
        let (requests, mut outgoing) = mpsc::unbounded_channel::<Frame>();
        let (changes_tx, changes) = mpsc::unbounded_channel();

        let writer = tokio::spawn(async move {
            while let Some(frame) = outgoing.recv().await {
                if let Err(e) = write_frame(&mut writer, &frame).await {
                    debug!("Request write failed: {}", e);
                    return;
                }
            }
            let _ = writer.shutdown().await;
        });
        let reader = tokio::spawn(route_incoming(reader, Arc::clone(&pending), changes_tx));

        Ok(Self {
            next_id: AtomicU32::new(1),
            pending,
            requests,
            changes,
            reader,
            writer,
        })
    }

    fn correlation_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != PUSH_CORRELATION {
                return id;
            }
        }
    }

    /// Send a request and return the response body
    pub async fn request(&self, request: Request) -> Result<Vec<u8>> {
        let id = self.correlation_id();
        let frame = request.encode(id)?;
        let expected = request
            .opcode()
            .response()
            .ok_or_else(|| RemoteFsError::violation("not a request opcode"))?;

        let (tx, rx) = oneshot::channel();
        match lock(&self.pending).as_mut() {
            Some(waiting) => waiting.insert(id, tx),
            None => return Err(RemoteFsError::ConnectionReset),
        };
        if self.requests.send(frame).is_err() {
            if let Some(waiting) = lock(&self.pending).as_mut() {
                waiting.remove(&id);
            }
            return Err(RemoteFsError::ConnectionReset);
        }

        let response = rx.await.map_err(|_| RemoteFsError::ConnectionReset)?;
        if response.opcode != expected {
            return Err(RemoteFsError::violation(format!(
                "expected {:?}, got {:?}",
                expected, response.opcode
            )));
        }
        decode_status(&response.payload).map(<[u8]>::to_vec)
    }

    pub async fn exists(&self, path: &str) -> Result<FileSystemState> {
        let body = self.request(Request::Exists(path_request(path))).await?;
        from_json(&body)
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let body = self.request(Request::ReadFile(path_request(path))).await?;
        decode_file_body(&body)
    }

    pub async fn search(&self, root: &str, pattern: &str, depth: i64) -> Result<Vec<FileSystemState>> {
        let body = self
            .request(Request::Search(SearchRequest {
                root: root.to_string(),
                pattern: pattern.to_string(),
                depth,
            }))
            .await?;
        from_json(&body)
    }

    pub async fn watch(&self, path: &str, recursive: bool) -> Result<()> {
        self.request(Request::Watch(WatchRequest {
            path: path.to_string(),
            recursive,
        }))
        .await?;
        Ok(())
    }

    pub async fn unwatch(&self, path: &str) -> Result<()> {
        self.request(Request::Unwatch(path_request(path))).await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(Request::Shutdown).await?;
        Ok(())
    }

    /// Next pushed change, or `None` once the connection is closed
    pub async fn next_change(&mut self) -> Option<ChangeNotification> {
        self.changes.recv().await
    }

    /// Flush outstanding requests and close the connection
    pub async fn close(self) {
        drop(self.requests);
        let _ = self.writer.await;
        self.reader.abort();
    }
}

fn path_request(path: &str) -> PathRequest {
    PathRequest {
        path: path.to_string(),
    }
}

fn lock(pending: &Pending) -> std::sync::MutexGuard<'_, Option<HashMap<u32, oneshot::Sender<Frame>>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn route_incoming<R>(mut reader: R, pending: Pending, changes: mpsc::UnboundedSender<ChangeNotification>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Connection closed: {}", e);
                break;
            }
        };

        if frame.opcode == Opcode::ChangeNotification {
            match from_json::<ChangeNotification>(&frame.payload) {
                Ok(change) => {
                    let _ = changes.send(change);
                }
                Err(e) => warn!("Dropping malformed notification: {}", e),
            }
            continue;
        }

        let waiter = lock(&pending)
            .as_mut()
            .and_then(|waiting| waiting.remove(&frame.correlation_id));
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(frame);
            }
            None => warn!("Response for unknown request #{}", frame.correlation_id),
        }
    }
    // Fails every outstanding request
    lock(&pending).take();
}
