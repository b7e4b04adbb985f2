//! Remofs Core - Remote File System Building Blocks
//!
//! Features:
//! - FileSystemState snapshots with BLAKE3 content fingerprints
//! - Slash-normalized, root-confined wire paths
//! - Bounded, deterministic directory search (glob patterns)
//! - Length-prefixed binary wire protocol
//! - HMAC-SHA256 shared-secret challenge/response

pub mod auth;
pub mod error;
pub mod hasher;
pub mod path;
pub mod protocol;
pub mod search;
pub mod state;

pub use error::{RemoteFsError, Result};
pub use protocol::{ChangeKind, ChangeNotification, Frame, Opcode, Request, Status};
pub use search::DirectorySearcher;
pub use state::{EntryKind, FileSystemState};
