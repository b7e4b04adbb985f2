//! Authenticator - shared-secret handshake on a fresh session
//!
//! 1. Server sends `AuthChallenge` carrying a random nonce
//! 2. Client answers `AuthResponse` with the keyed digest of the nonce
//! 3. Server verifies in constant time; on mismatch the caller drops the
//!    connection without sending anything else

use remofs_core::auth::{compute_digest, generate_nonce, verify_digest};
use remofs_core::protocol::{read_frame, write_frame, PUSH_CORRELATION};
use remofs_core::{Frame, Opcode, RemoteFsError, Result};
use tokio::io::{AsyncRead, AsyncWrite};

/// Minimum nonce a client will accept from a server
const MIN_NONCE_LEN: usize = 16;

/// Server side. Any frame other than `AuthResponse` is a protocol violation.
pub async fn authenticate<R, W>(reader: &mut R, writer: &mut W, secret: &[u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let nonce = generate_nonce();
    let challenge = Frame::new(Opcode::AuthChallenge, PUSH_CORRELATION, nonce.to_vec());
    write_frame(writer, &challenge).await?;

    let frame = read_frame(reader).await?;
    if frame.opcode != Opcode::AuthResponse {
        return Err(RemoteFsError::violation(format!(
            "expected AuthResponse, got {:?}",
            frame.opcode
        )));
    }

    if !verify_digest(secret, &nonce, &frame.payload) {
        return Err(RemoteFsError::AuthenticationFailure);
    }
    Ok(())
}

/// Client side: wait for the challenge and answer it
pub async fn answer_challenge<R, W>(reader: &mut R, writer: &mut W, secret: &[u8]) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let frame = read_frame(reader).await?;
    if frame.opcode != Opcode::AuthChallenge {
        return Err(RemoteFsError::violation(format!(
            "expected AuthChallenge, got {:?}",
            frame.opcode
        )));
    }
    if frame.payload.len() < MIN_NONCE_LEN {
        return Err(RemoteFsError::violation("challenge nonce too short"));
    }

    let digest = compute_digest(secret, &frame.payload)?;
    write_frame(
        writer,
        &Frame::new(Opcode::AuthResponse, PUSH_CORRELATION, digest.to_vec()),
    )
    .await
}
