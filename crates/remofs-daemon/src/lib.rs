//! Remote FS Daemon - secure remote file system server
//!
//! Features:
//! - TLS listener with shared-secret authentication
//! - Exists, ReadFile, Search, Watch/Unwatch and Shutdown requests
//! - Debounced change notifications pushed to watching clients
//! - Idle and remote shutdown policies
//! - Matching async client

pub mod auth;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod notifier;
pub mod server;
pub mod session;
pub mod state;
pub mod tls;
pub mod watcher;

pub use client::RemoteFsClient;
pub use config::ServerConfig;
pub use server::RemoteFsServer;
pub use state::{LifecycleState, Registry, ShutdownReason};
