//! PKCE S256 helpers (RFC 7636).

use crate::hash::{hash_token, secure_eq};

pub const METHOD_S256: &str = "S256";

const VERIFIER_MAX_LEN: usize = 128;
const CHALLENGE_LEN: usize = 43;

fn is_unreserved(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
}

/// Non-empty, at most 128 unreserved characters. The 43 character minimum is
/// not enforced here; a short verifier simply fails the challenge comparison.
#[must_use]
pub fn verifier_is_well_formed(verifier: &str) -> bool {
    !verifier.is_empty()
        && verifier.len() <= VERIFIER_MAX_LEN
        && verifier.chars().all(is_unreserved)
}

/// A S256 challenge is exactly 43 base64url characters.
#[must_use]
pub fn challenge_is_well_formed(challenge: &str) -> bool {
    challenge.len() == CHALLENGE_LEN
        && challenge
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[must_use]
pub fn challenge_s256(verifier: &str) -> String {
    hash_token(verifier)
}

#[must_use]
pub fn verify_s256(verifier: &str, challenge: &str) -> bool {
    secure_eq(&challenge_s256(verifier), challenge)
}
