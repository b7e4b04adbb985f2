//! Request Dispatcher - authenticated requests to responses
//!
//! Routes to FileSystemState, the directory searcher, the subscription
//! index and the registry. Per-request failures come back as a response
//! status; only malformed traffic is returned as an error.

use remofs_core::path::{clean, is_confined, normalize, resolve};
use remofs_core::protocol::{encode_file_body, to_json, PathRequest, SearchRequest, WatchRequest, PUSH_CORRELATION};
use remofs_core::{DirectorySearcher, FileSystemState, Frame, RemoteFsError, Request, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::notifier::{Outbox, SessionId, SubscriptionIndex};
use crate::state::Registry;

/// Largest file `ReadFile` will send in one frame
pub const MAX_READ_LEN: u64 = (remofs_core::protocol::MAX_FRAME_LEN - 64) as u64;

/// Everything a session needs, shared across sessions
pub struct SessionContext {
    pub root: PathBuf,
    pub config: Arc<ServerConfig>,
    pub registry: Arc<Registry>,
    pub index: SubscriptionIndex,
    pub searcher: DirectorySearcher,
}

impl SessionContext {
    /// `config.root` must already be canonical
    pub fn new(config: Arc<ServerConfig>, registry: Arc<Registry>, index: SubscriptionIndex) -> Self {
        Self {
            root: config.root.clone(),
            searcher: DirectorySearcher::new(config.root.clone(), config.max_search_depth),
            config,
            registry,
            index,
        }
    }
}

pub struct Dispatcher {
    ctx: Arc<SessionContext>,
    session_id: SessionId,
    outbox: Outbox,
}

impl Dispatcher {
    pub fn new(ctx: Arc<SessionContext>, session_id: SessionId, outbox: Outbox) -> Self {
        Self {
            ctx,
            session_id,
            outbox,
        }
    }

    /// Decode, execute and build the tagged response
    pub async fn handle(&self, frame: Frame) -> Result<Frame> {
        if frame.correlation_id == PUSH_CORRELATION {
            return Err(RemoteFsError::violation("request with reserved correlation id 0"));
        }
        let request = Request::decode(&frame)?;
        let reply = request
            .opcode()
            .response()
            .ok_or_else(|| RemoteFsError::violation("request has no response opcode"))?;

        debug!("Session {} request #{}: {:?}", self.session_id, frame.correlation_id, request);
        let result = self.execute(request).await;
        Ok(Frame::response(reply, frame.correlation_id, result))
    }

    pub async fn execute(&self, request: Request) -> Result<Vec<u8>> {
        match request {
            Request::Exists(PathRequest { path }) => self.exists(&path),
            Request::ReadFile(PathRequest { path }) => self.read_file(&path).await,
            Request::Search(search) => self.search(search).await,
            Request::Watch(watch) => self.watch(watch).await,
            Request::Unwatch(PathRequest { path }) => self.unwatch(&path).await,
            Request::Shutdown => self.shutdown(),
        }
    }

    fn exists(&self, path: &str) -> Result<Vec<u8>> {
        let state = match normalize(path) {
            Some(rel) => FileSystemState::observe(&self.ctx.root, &rel),
            None => FileSystemState::missing(clean(path)),
        };
        to_json(&state)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let rel = normalize(path).ok_or_else(|| RemoteFsError::NotFound(clean(path)))?;
        let full = resolve(&self.ctx.root, &rel);
        if !is_confined(&self.ctx.root, &full) {
            debug!("Session {} refused {}: resolves outside the root", self.session_id, rel);
            return Err(RemoteFsError::NotFound(rel));
        }

        match tokio::fs::metadata(&full).await {
            Ok(meta) if meta.is_file() => {
                if meta.len() > MAX_READ_LEN {
                    return Err(RemoteFsError::Failed(format!("{rel} is too large to transfer")));
                }
            }
            _ => return Err(RemoteFsError::NotFound(rel)),
        }

        match tokio::fs::read(&full).await {
            Ok(content) => Ok(encode_file_body(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(RemoteFsError::NotFound(rel)),
            Err(e) => Err(RemoteFsError::Failed(format!("{rel}: {e}"))),
        }
    }

    async fn search(&self, request: SearchRequest) -> Result<Vec<u8>> {
        let searcher = self.ctx.searcher.clone();
        let results = tokio::task::spawn_blocking(move || {
            searcher.search(&request.root, &request.pattern, request.depth)
        })
        .await
        .map_err(|e| RemoteFsError::Failed(format!("search task failed: {e}")))??;
        to_json(&results)
    }

    async fn watch(&self, request: WatchRequest) -> Result<Vec<u8>> {
        let rel = normalize(&request.path).ok_or_else(|| RemoteFsError::NotFound(clean(&request.path)))?;
        debug!("Session {} watching {:?} (recursive: {})", self.session_id, rel, request.recursive);
        self.ctx
            .index
            .watch(self.session_id, rel, request.recursive, self.outbox.clone())
            .await;
        Ok(Vec::new())
    }

    async fn unwatch(&self, path: &str) -> Result<Vec<u8>> {
        if let Some(rel) = normalize(path) {
            self.ctx.index.unwatch(self.session_id, &rel).await;
        }
        Ok(Vec::new())
    }

    fn shutdown(&self) -> Result<Vec<u8>> {
        if !self.ctx.config.allow_shutdown_requests {
            warn!("Session {} requested shutdown, but shutdown requests are disabled", self.session_id);
            return Err(RemoteFsError::Unauthorized);
        }
        info!("Session {} requested shutdown", self.session_id);
        self.ctx.registry.request_shutdown();
        Ok(Vec::new())
    }
}
