//! Error taxonomy shared by server, sessions and client

use std::io;
use thiserror::Error;

/// Every failure the protocol can surface.
///
/// Per-request failures (`NotFound`, `Unauthorized`) travel back to the
/// caller as a response status and leave the session open. Everything else
/// ends the session it happened on.
#[derive(Debug, Error)]
pub enum RemoteFsError {
    #[error("authentication failed")]
    AuthenticationFailure,

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("timed out")]
    Timeout,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("request failed: {0}")]
    Failed(String),

    #[error("i/o failure: {0}")]
    Io(#[source] io::Error),
}

impl RemoteFsError {
    pub fn violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    /// True when the error ends the session rather than a single request
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::NotFound(_) | Self::Unauthorized | Self::Failed(_)
        )
    }
}

impl From<io::Error> for RemoteFsError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::ConnectionReset,
            io::ErrorKind::TimedOut => Self::Timeout,
            _ => Self::Io(err),
        }
    }
}

pub type Result<T, E = RemoteFsError> = std::result::Result<T, E>;
