//! Remote FS Server - TLS listener
//!
//! Features:
//! - TLS over TCP with a configured or ephemeral identity
//! - One task per connection, tracked so shutdown can wait for them
//! - Raw watcher events debounced into per-client change notifications
//! - Idle and remote shutdown policies

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_rustls::TlsAcceptor;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::dispatcher::SessionContext;
use crate::notifier::{ChangeNotifier, SubscriptionIndex};
use crate::session;
use crate::state::{Registry, ShutdownReason};
use crate::tls::{IdentitySource, ServerIdentity};
use crate::watcher::{FsWatcher, RawEvent};

/// First pause after a failed accept; doubles per consecutive failure
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

fn accept_backoff(failures: u32) -> Duration {
    let doublings = failures.saturating_sub(1).min(5);
    ACCEPT_BACKOFF.saturating_mul(1 << doublings).min(MAX_ACCEPT_BACKOFF)
}

pub struct RemoteFsServer {
    config: Arc<ServerConfig>,
    acceptor: TlsAcceptor,
    listener: TcpListener,
    registry: Arc<Registry>,
    index: SubscriptionIndex,
    raw_tx: UnboundedSender<RawEvent>,
    raw_rx: UnboundedReceiver<RawEvent>,
}

impl RemoteFsServer {
    /// Resolve the root, load the TLS identity and bind the listener
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let root = config
            .root
            .canonicalize()
            .with_context(|| format!("resolving root {:?}", config.root))?;
        if !root.is_dir() {
            bail!("root {:?} is not a directory", root);
        }
        let config = ServerConfig { root, ..config };

        let identity = ServerIdentity::from_config(config.certificate.as_deref())?;
        match identity.source() {
            IdentitySource::Certificate(path) => info!("Using certificate from {:?}", path),
            IdentitySource::Ephemeral => info!("Using an ephemeral self-signed certificate"),
        }
        let acceptor = identity.acceptor()?;

        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("binding {}", config.listen))?;
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config: Arc::new(config),
            acceptor,
            listener,
            registry: Registry::new(),
            index: SubscriptionIndex::new(),
            raw_tx,
            raw_rx,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn root(&self) -> &std::path::Path {
        &self.config.root
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Feed events into the notifier alongside the file watcher
    pub fn raw_event_sender(&self) -> UnboundedSender<RawEvent> {
        self.raw_tx.clone()
    }

    /// Serve until a shutdown policy fires, then drain every session
    pub async fn run(self) -> Result<ShutdownReason> {
        let Self {
            config,
            acceptor,
            listener,
            registry,
            index,
            raw_tx,
            raw_rx,
        } = self;
        let cancel = registry.cancellation();
        let tracker = TaskTracker::new();

        let mut watcher = FsWatcher::new(&config.root);
        watcher.start(raw_tx)?;

        let mut notifier = ChangeNotifier::new(config.root.clone(), config.debounce_window, index.clone());
        let notifier = tokio::task::spawn_blocking(move || {
            notifier.seed();
            notifier
        })
        .await
        .context("initial scan failed")?;
        tracker.spawn(notifier.run(raw_rx, cancel.clone()));

        if let Some(timeout) = config.idle_timeout {
            info!("Idle timeout: {:?}", timeout);
            tracker.spawn(Arc::clone(&registry).run_idle_monitor(timeout));
        }

        let ctx = Arc::new(SessionContext::new(Arc::clone(&config), Arc::clone(&registry), index));
        info!("Serving {:?} on {}", config.root, listener.local_addr()?);

        let mut accept_failures = 0u32;
        loop {
            let (tcp, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(conn) => {
                        accept_failures = 0;
                        conn
                    }
                    Err(e) => {
                        accept_failures = accept_failures.saturating_add(1);
                        let pause = accept_backoff(accept_failures);
                        error!("Accept error: {} (retrying in {:?})", e, pause);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(pause) => continue,
                        }
                    }
                },
            };
            debug!("Connection from {}", peer);

            let acceptor = acceptor.clone();
            let ctx = Arc::clone(&ctx);
            let cancel = cancel.clone();
            let timeout = config.handshake_timeout;
            tracker.spawn(async move {
                let tls = tokio::select! {
                    _ = cancel.cancelled() => return,
                    tls = tokio::time::timeout(timeout, acceptor.accept(tcp)) => tls,
                };
                match tls {
                    Ok(Ok(stream)) => session::serve(stream, peer, ctx).await,
                    Ok(Err(e)) => warn!("TLS handshake with {} failed: {}", peer, e),
                    Err(_) => warn!("TLS handshake with {} timed out", peer),
                }
            });
        }

        drop(listener);
        info!("Waiting for {} session(s) to close", registry.authenticated_clients());
        tracker.close();
        tracker.wait().await;

        watcher.stop();
        registry.mark_stopped();
        Ok(registry.shutdown_reason().unwrap_or(ShutdownReason::Interrupted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RemoteFsClient;
    use crate::state::LifecycleState;
    use crate::watcher::RawEventKind;
    use remofs_core::{ChangeKind, EntryKind, RemoteFsError};
    use std::fs;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};
    use tokio::task::JoinHandle;

    #[test]
    fn test_accept_backoff_grows_and_caps() {
        assert_eq!(accept_backoff(1), Duration::from_millis(50));
        assert_eq!(accept_backoff(2), Duration::from_millis(100));
        assert_eq!(accept_backoff(4), Duration::from_millis(400));
        assert_eq!(accept_backoff(6), MAX_ACCEPT_BACKOFF);
        assert_eq!(accept_backoff(u32::MAX), MAX_ACCEPT_BACKOFF);
    }

    struct Running {
        _dir: tempfile::TempDir,
        root: PathBuf,
        addr: SocketAddr,
        registry: Arc<Registry>,
        raw_tx: UnboundedSender<RawEvent>,
        handle: JoinHandle<Result<ShutdownReason>>,
    }

    async fn start_server(configure: impl FnOnce(ServerConfig) -> ServerConfig) -> Running {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        fs::write(dir.path().join("empty.txt"), "").unwrap();
        fs::create_dir_all(dir.path().join("src/ui")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}").unwrap();
        fs::write(dir.path().join("src/ui/view.rs"), "").unwrap();

        let config = ServerConfig::new(dir.path(), b"hunter2".to_vec()).listen("127.0.0.1:0".parse().unwrap());
        let server = RemoteFsServer::bind(configure(config)).await.unwrap();
        let root = server.root().to_path_buf();
        let addr = server.local_addr().unwrap();
        let registry = server.registry();
        let raw_tx = server.raw_event_sender();
        let handle = tokio::spawn(server.run());

        Running {
            _dir: dir,
            root,
            addr,
            registry,
            raw_tx,
            handle,
        }
    }

    async fn finish(server: Running) -> ShutdownReason {
        tokio::time::timeout(Duration::from_secs(5), server.handle)
            .await
            .expect("server should stop")
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_exists_and_read() {
        let server = start_server(|c| c).await;
        let client = RemoteFsClient::connect(server.addr, b"hunter2").await.unwrap();

        let state = client.exists("a.txt").await.unwrap();
        assert_eq!(state.kind, EntryKind::File);
        assert_eq!(state.size, Some(5));
        assert_eq!(client.read_file("a.txt").await.unwrap(), b"hello");
        assert!(client.read_file("empty.txt").await.unwrap().is_empty());

        assert_eq!(client.exists("nope").await.unwrap().kind, EntryKind::Missing);
        assert!(matches!(client.read_file("nope").await, Err(RemoteFsError::NotFound(_))));
        assert!(matches!(client.read_file("src").await, Err(RemoteFsError::NotFound(_))));
        assert_eq!(server.registry.authenticated_clients(), 1);

        client.close().await;
        server.registry.begin_drain(ShutdownReason::Interrupted);
        assert_eq!(finish(server).await, ShutdownReason::Interrupted);
    }

    #[tokio::test]
    async fn test_wrong_secret_is_disconnected() {
        let server = start_server(|c| c).await;
        let client = RemoteFsClient::connect(server.addr, b"letmein").await.unwrap();

        assert!(matches!(client.exists("a.txt").await, Err(RemoteFsError::ConnectionReset)));
        assert_eq!(server.registry.authenticated_clients(), 0);

        server.registry.begin_drain(ShutdownReason::Interrupted);
        finish(server).await;
    }

    #[tokio::test]
    async fn test_search_depth_and_order() {
        let server = start_server(|c| c.max_search_depth(1)).await;
        let client = RemoteFsClient::connect(server.addr, b"hunter2").await.unwrap();

        let paths = |states: Vec<remofs_core::FileSystemState>| -> Vec<String> {
            states.into_iter().map(|s| s.path).collect()
        };
        assert_eq!(
            paths(client.search("", "*", 0).await.unwrap()),
            vec!["a.txt", "empty.txt", "src"]
        );
        assert_eq!(
            paths(client.search("src", "*", 5).await.unwrap()),
            vec!["src/main.rs", "src/ui"]
        );
        assert!(matches!(
            client.search("missing", "*", 1).await,
            Err(RemoteFsError::NotFound(_))
        ));

        client.close().await;
        server.registry.begin_drain(ShutdownReason::Interrupted);
        finish(server).await;
    }

    #[tokio::test]
    async fn test_shutdown_denied_by_default() {
        let server = start_server(|c| c).await;
        let client = RemoteFsClient::connect(server.addr, b"hunter2").await.unwrap();

        assert!(matches!(client.shutdown().await, Err(RemoteFsError::Unauthorized)));
        assert!(client.exists("a.txt").await.is_ok());
        assert_eq!(server.registry.lifecycle(), LifecycleState::Listening);

        client.close().await;
        server.registry.begin_drain(ShutdownReason::Interrupted);
        finish(server).await;
    }

    #[tokio::test]
    async fn test_remote_shutdown() {
        let server = start_server(|c| c.allow_shutdown_requests(true)).await;
        let client = RemoteFsClient::connect(server.addr, b"hunter2").await.unwrap();

        client.shutdown().await.unwrap();
        let registry = Arc::clone(&server.registry);
        assert_eq!(finish(server).await, ShutdownReason::Requested);
        assert_eq!(registry.lifecycle(), LifecycleState::Stopped);
        assert_eq!(registry.authenticated_clients(), 0);
    }

    #[tokio::test]
    async fn test_idle_timeout_without_clients() {
        let start = Instant::now();
        let server = start_server(|c| c.idle_timeout_ms(200)).await;
        assert_eq!(finish(server).await, ShutdownReason::IdleTimeout);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn test_client_resets_idle_timer() {
        let server = start_server(|c| c.idle_timeout_ms(200)).await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        let client = RemoteFsClient::connect(server.addr, b"hunter2").await.unwrap();
        client.exists("a.txt").await.unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(server.registry.lifecycle(), LifecycleState::Listening);

        let closed = Instant::now();
        client.close().await;
        assert_eq!(finish(server).await, ShutdownReason::IdleTimeout);
        assert!(closed.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_watch_delivers_changes() {
        let server = start_server(|c| c).await;
        let mut client = RemoteFsClient::connect(server.addr, b"hunter2").await.unwrap();
        client.watch("src", true).await.unwrap();

        let created = server.root.join("src/ui/new.rs");
        fs::write(&created, "pub fn new() {}").unwrap();
        server.raw_tx.send(RawEvent::new(&created, RawEventKind::Create)).unwrap();
        server.raw_tx.send(RawEvent::new(&created, RawEventKind::Modify)).unwrap();

        let change = tokio::time::timeout(Duration::from_secs(5), client.next_change())
            .await
            .expect("change should arrive")
            .unwrap();
        assert_eq!(change.path, "src/ui/new.rs");
        assert_eq!(change.kind, ChangeKind::Added);

        client.unwatch("src").await.unwrap();
        client.close().await;
        server.registry.begin_drain(ShutdownReason::Interrupted);
        finish(server).await;
    }

    #[tokio::test]
    async fn test_unchanged_touch_is_silent() {
        let server = start_server(|c| c).await;
        let mut client = RemoteFsClient::connect(server.addr, b"hunter2").await.unwrap();
        client.watch("", true).await.unwrap();

        let touched = server.root.join("a.txt");
        fs::write(&touched, "hello").unwrap();
        server.raw_tx.send(RawEvent::new(&touched, RawEventKind::Modify)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let created = server.root.join("b.txt");
        fs::write(&created, "new").unwrap();
        server.raw_tx.send(RawEvent::new(&created, RawEventKind::Create)).unwrap();

        let change = tokio::time::timeout(Duration::from_secs(5), client.next_change())
            .await
            .expect("change should arrive")
            .unwrap();
        assert_eq!(change.path, "b.txt");
        assert_eq!(change.kind, ChangeKind::Added);

        client.close().await;
        server.registry.begin_drain(ShutdownReason::Interrupted);
        finish(server).await;
    }

    #[tokio::test]
    async fn test_hello_scenario() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "hello").unwrap();
        let config = ServerConfig::new(dir.path(), b"hunter2".to_vec())
            .listen("127.0.0.1:0".parse().unwrap())
            .allow_shutdown_requests(true);
        let server = RemoteFsServer::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let handle = tokio::spawn(server.run());

        let client = RemoteFsClient::connect(addr, b"hunter2").await.unwrap();
        assert_eq!(client.read_file("a.txt").await.unwrap(), b"hello");
        assert_eq!(client.exists("missing.txt").await.unwrap().kind, EntryKind::Missing);
        let listing: Vec<String> = client
            .search(".", "*", 0)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.path)
            .collect();
        assert_eq!(listing, vec!["a.txt"]);

        client.shutdown().await.unwrap();
        let reason = handle.await.unwrap().unwrap();
        assert_eq!(reason, ShutdownReason::Requested);
    }
}
