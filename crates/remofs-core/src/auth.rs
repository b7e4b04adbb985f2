//! Shared-secret challenge/response primitives
//!
//! The server sends a random nonce, the client answers with
//! HMAC-SHA256(secret, label || nonce). Verification is constant-time.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::{RemoteFsError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const NONCE_LEN: usize = 32;
pub const DIGEST_LEN: usize = 32;

const DOMAIN_LABEL: &[u8] = b"remofs-auth-v1";

/// Fresh challenge nonce from the OS-seeded RNG
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

fn keyed(secret: &[u8], nonce: &[u8]) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| RemoteFsError::AuthenticationFailure)?;
    mac.update(DOMAIN_LABEL);
    mac.update(nonce);
    Ok(mac)
}

/// Client side: answer a challenge
pub fn compute_digest(secret: &[u8], nonce: &[u8]) -> Result<[u8; DIGEST_LEN]> {
    let tag = keyed(secret, nonce)?.finalize().into_bytes();
    let mut digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&tag);
    Ok(digest)
}

/// Server side: check a response without leaking where it differs
pub fn verify_digest(secret: &[u8], nonce: &[u8], response: &[u8]) -> bool {
    match keyed(secret, nonce) {
        Ok(mac) => mac.verify_slice(response).is_ok(),
        Err(_) => false,
    }
}
