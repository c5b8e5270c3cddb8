//! Opaque token hashing and random token generation.
//!
//! Every opaque value that ends up as a storage key (refresh tokens, authorization
//! codes, session ids, client secrets) goes through [`hash_token`]. Raw values are
//! only ever handed back to the caller once and never persisted.

use anyhow::{Context, Result};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Bytes of entropy used for refresh tokens, codes and session ids.
pub const TOKEN_BYTES: usize = 32;

/// `base64url_no_pad(sha256(raw))`.
#[must_use]
pub fn hash_token(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Fill `len` bytes from the OS RNG.
///
/// # Errors
/// Returns an error if the OS entropy source fails; callers must fail closed.
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to read from the OS entropy source")?;
    Ok(bytes)
}

/// Create a new opaque token (URL-safe base64 of 32 random bytes).
///
/// # Errors
/// Returns an error if the OS entropy source fails.
pub fn generate_token() -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(random_bytes(TOKEN_BYTES)?))
}

/// Create a new hex token, used for CSRF double-submit values.
///
/// # Errors
/// Returns an error if the OS entropy source fails.
pub fn generate_hex_token() -> Result<String> {
    Ok(hex::encode(random_bytes(TOKEN_BYTES)?))
}

/// Constant-time string equality for secrets and CSRF values.
#[must_use]
pub fn secure_eq(left: &str, right: &str) -> bool {
    left.as_bytes().ct_eq(right.as_bytes()).into()
}
