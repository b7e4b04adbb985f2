//! Session - one authenticated connection
//!
//! Authenticates, then reads requests in order and answers each through
//! the dispatcher. Responses and change notifications share one bounded
//! outbound queue drained by a writer task, so frames never interleave and
//! a client that stops reading stops being read from.

use remofs_core::protocol::{read_frame, write_frame};
use remofs_core::{Frame, RemoteFsError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::authenticate;
use crate::dispatcher::{Dispatcher, SessionContext};
use crate::notifier::OUTBOX_CAPACITY;

/// How long queued frames may take to flush once the session ends
const FLUSH_GRACE: Duration = Duration::from_secs(5);

/// Serve a connection until the peer leaves, misbehaves or the server drains
pub async fn serve<S>(stream: S, peer: SocketAddr, ctx: Arc<SessionContext>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let session_id = Uuid::new_v4();
    let cancel = ctx.registry.cancellation();
    let (mut reader, mut writer) = tokio::io::split(stream);
    debug!("Session {} opened for {}", session_id, peer);

    let handshake = tokio::time::timeout(
        ctx.config.handshake_timeout,
        authenticate(&mut reader, &mut writer, &ctx.config.secret),
    );
    let outcome = tokio::select! {
        _ = cancel.cancelled() => return,
        outcome = handshake => outcome.unwrap_or(Err(RemoteFsError::Timeout)),
    };
    if let Err(e) = outcome {
        warn!("Authentication failed for {}: {}", peer, e);
        return;
    }

    let guard = ctx.registry.client_authenticated();
    info!(
        "Client {} authenticated (session {}, {} connected)",
        peer,
        session_id,
        ctx.registry.authenticated_clients()
    );

    let (outbox, mut queue) = mpsc::channel::<Frame>(OUTBOX_CAPACITY);
    let mut writer_task = tokio::spawn(async move {
        while let Some(frame) = queue.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!("Write to {} failed: {}", peer, e);
                return;
            }
        }
        let _ = writer.shutdown().await;
    });

    let dispatcher = Dispatcher::new(Arc::clone(&ctx), session_id, outbox.clone());
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Session {} closing for shutdown", session_id);
                break;
            }
            frame = read_frame(&mut reader) => frame,
        };

        let response = match frame {
            Ok(frame) => dispatcher.handle(frame).await,
            Err(e) => Err(e),
        };
        match response {
            Ok(response) => {
                let sent = tokio::select! {
                    biased;
                    sent = outbox.send(response) => sent.is_ok(),
                    _ = cancel.cancelled() => false,
                };
                if !sent {
                    break;
                }
            }
            Err(RemoteFsError::ConnectionReset) => {
                info!("Client {} disconnected", peer);
                break;
            }
            Err(e) => {
                warn!("Closing session with {}: {}", peer, e);
                break;
            }
        }
    }

    ctx.index.remove_session(session_id).await;
    drop(dispatcher);
    drop(outbox);
    if tokio::time::timeout(FLUSH_GRACE, &mut writer_task).await.is_err() {
        writer_task.abort();
    }
    drop(guard);
    debug!("Session {} closed", session_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::answer_challenge;
    use crate::config::ServerConfig;
    use crate::notifier::SubscriptionIndex;
    use crate::state::Registry;
    use remofs_core::protocol::{decode_status, from_json, PathRequest, WatchRequest};
    use remofs_core::{EntryKind, FileSystemState, Opcode, Request};
    use tokio::io::{duplex, split, DuplexStream, ReadHalf, WriteHalf};

    struct Harness {
        _dir: tempfile::TempDir,
        ctx: Arc<SessionContext>,
        session: tokio::task::JoinHandle<()>,
        reader: ReadHalf<DuplexStream>,
        writer: WriteHalf<DuplexStream>,
    }

    fn start(config: impl FnOnce(ServerConfig) -> ServerConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        std::fs::write(root.join("a.txt"), "hello").unwrap();

        let config = config(ServerConfig::new(root, b"hunter2".to_vec()));
        let ctx = Arc::new(SessionContext::new(
            Arc::new(config),
            Registry::new(),
            SubscriptionIndex::new(),
        ));
        let (server, client) = duplex(64 * 1024);
        let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
        let session = tokio::spawn(serve(server, peer, Arc::clone(&ctx)));
        let (reader, writer) = split(client);
        Harness {
            _dir: dir,
            ctx,
            session,
            reader,
            writer,
        }
    }

    #[tokio::test]
    async fn test_authenticated_request() {
        let mut h = start(|c| c);
        answer_challenge(&mut h.reader, &mut h.writer, b"hunter2").await.unwrap();

        let request = Request::Exists(PathRequest { path: "a.txt".into() });
        write_frame(&mut h.writer, &request.encode(7).unwrap()).await.unwrap();
        let response = read_frame(&mut h.reader).await.unwrap();
        assert_eq!(response.opcode, Opcode::ExistsResponse);
        assert_eq!(response.correlation_id, 7);

        let state: FileSystemState = from_json(decode_status(&response.payload).unwrap()).unwrap();
        assert_eq!(state.kind, EntryKind::File);
        assert_eq!(state.size, Some(5));
        assert_eq!(h.ctx.registry.authenticated_clients(), 1);

        h.writer.shutdown().await.unwrap();
        h.session.await.unwrap();
        assert_eq!(h.ctx.registry.authenticated_clients(), 0);
    }

    #[tokio::test]
    async fn test_wrong_secret_closes_silently() {
        let mut h = start(|c| c);
        answer_challenge(&mut h.reader, &mut h.writer, b"letmein").await.unwrap();
        h.session.await.unwrap();

        assert!(matches!(
            read_frame(&mut h.reader).await,
            Err(RemoteFsError::ConnectionReset)
        ));
        assert_eq!(h.ctx.registry.authenticated_clients(), 0);
    }

    #[tokio::test]
    async fn test_handshake_timeout() {
        let mut h = start(|mut c| {
            c.handshake_timeout = Duration::from_millis(100);
            c
        });
        let challenge = read_frame(&mut h.reader).await.unwrap();
        assert_eq!(challenge.opcode, Opcode::AuthChallenge);
        tokio::time::timeout(Duration::from_secs(2), h.session)
            .await
            .expect("session should give up on a silent client")
            .unwrap();
    }

    #[tokio::test]
    async fn test_reserved_correlation_id_closes_session() {
        let mut h = start(|c| c);
        answer_challenge(&mut h.reader, &mut h.writer, b"hunter2").await.unwrap();

        let watch = Request::Watch(WatchRequest {
            path: "".into(),
            recursive: true,
        });
        write_frame(&mut h.writer, &watch.encode(1).unwrap()).await.unwrap();
        read_frame(&mut h.reader).await.unwrap();
        assert_eq!(h.ctx.index.subscriptions().await.len(), 1);

        write_frame(&mut h.writer, &Request::Shutdown.encode(0).unwrap()).await.unwrap();
        h.session.await.unwrap();
        assert!(h.ctx.index.subscriptions().await.is_empty());
        assert_eq!(h.ctx.registry.authenticated_clients(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_response_is_flushed() {
        let mut h = start(|c| c.allow_shutdown_requests(true));
        answer_challenge(&mut h.reader, &mut h.writer, b"hunter2").await.unwrap();

        write_frame(&mut h.writer, &Request::Shutdown.encode(3).unwrap()).await.unwrap();
        let response = read_frame(&mut h.reader).await.unwrap();
        assert_eq!(response.opcode, Opcode::ShutdownResponse);
        assert!(decode_status(&response.payload).is_ok());

        h.session.await.unwrap();
        assert!(h.ctx.registry.shutdown_requested());
    }

    #[tokio::test]
    async fn test_stalled_reader_applies_backpressure() {
        let mut h = start(|c| c);
        std::fs::write(h.ctx.root.join("big.bin"), vec![7u8; 8 * 1024]).unwrap();
        answer_challenge(&mut h.reader, &mut h.writer, b"hunter2").await.unwrap();

        // Never read the responses; the session must stop accepting requests
        let flood = async {
            for id in 1..=10_000u32 {
                let request = Request::ReadFile(PathRequest { path: "big.bin".into() });
                write_frame(&mut h.writer, &request.encode(id).unwrap()).await.unwrap();
            }
        };
        assert!(
            tokio::time::timeout(Duration::from_millis(500), flood).await.is_err(),
            "every request was accepted without the responses being read"
        );

        drop(h.reader);
        drop(h.writer);
        tokio::time::timeout(Duration::from_secs(2), h.session)
            .await
            .expect("session should end once the client goes away")
            .unwrap();
        assert_eq!(h.ctx.registry.authenticated_clients(), 0);
    }
}
