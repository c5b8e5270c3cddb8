//! Argon2id password hashes (PHC strings) for session login.

use anyhow::{Result, anyhow};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use once_cell::sync::Lazy;
use rand::rngs::OsRng;

// Verified against when the user is unknown so both paths cost one Argon2 run.
static DUMMY_HASH: Lazy<Option<String>> = Lazy::new(|| hash_password("tessera-dummy").ok());

/// Hash a password with a random salt.
///
/// # Errors
/// Returns an error if hashing fails.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|_| anyhow!("failed to hash password"))
}

/// `false` for a wrong password and for anything that is not a PHC string.
#[must_use]
pub fn verify_password(password: &str, hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Verify against the user's hash, or burn the same work on a dummy hash
/// when there is none.
#[must_use]
pub fn verify_or_burn(password: &str, hash: Option<&str>) -> bool {
    match hash {
        Some(hash) => verify_password(password, hash),
        None => {
            if let Some(dummy) = DUMMY_HASH.as_deref() {
                let _ = verify_password(password, dummy);
            }
            false
        }
    }
}
