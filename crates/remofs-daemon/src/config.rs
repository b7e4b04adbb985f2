//! Server Configuration - supplied once at startup, immutable afterwards

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 20158;

/// Raw watcher events for one path are coalesced over this window
pub const DEFAULT_DEBOUNCE_WINDOW: Duration = Duration::from_millis(50);

/// Bound on the TLS handshake and on the auth exchange, each
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ServerConfig {
    pub root: PathBuf,
    pub secret: Vec<u8>,
    pub listen: SocketAddr,
    /// PEM with certificate chain and private key; `None` = ephemeral identity
    pub certificate: Option<PathBuf>,
    /// `<= 0` leaves search depth unbounded
    pub max_search_depth: i64,
    pub allow_shutdown_requests: bool,
    /// `None` disables idle shutdown
    pub idle_timeout: Option<Duration>,
    pub debounce_window: Duration,
    pub handshake_timeout: Duration,
}

impl ServerConfig {
    pub fn new(root: impl Into<PathBuf>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            root: root.into(),
            secret: secret.into(),
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            certificate: None,
            max_search_depth: 0,
            allow_shutdown_requests: false,
            idle_timeout: None,
            debounce_window: DEFAULT_DEBOUNCE_WINDOW,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    pub fn listen(mut self, addr: SocketAddr) -> Self {
        self.listen = addr;
        self
    }

    pub fn certificate(mut self, path: Option<PathBuf>) -> Self {
        self.certificate = path;
        self
    }

    pub fn max_search_depth(mut self, depth: i64) -> Self {
        self.max_search_depth = depth;
        self
    }

    pub fn allow_shutdown_requests(mut self, allowed: bool) -> Self {
        self.allow_shutdown_requests = allowed;
        self
    }

    /// Milliseconds as given on the command line; `<= 0` disables
    pub fn idle_timeout_ms(mut self, ms: i64) -> Self {
        self.idle_timeout = (ms > 0).then(|| Duration::from_millis(ms as u64));
        self
    }

    pub fn debounce_window(mut self, window: Duration) -> Self {
        self.debounce_window = window;
        self
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("root", &self.root)
            .field("secret", &"<redacted>")
            .field("listen", &self.listen)
            .field("certificate", &self.certificate)
            .field("max_search_depth", &self.max_search_depth)
            .field("allow_shutdown_requests", &self.allow_shutdown_requests)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}
