//! Refresh token revocation (RFC 7009).
//!
//! Unknown, foreign and already revoked tokens are indistinguishable from a
//! successful revoke.

use axum::http::{HeaderMap, header::CONTENT_TYPE};
use serde::Deserialize;
use tracing::{debug, warn};

use super::form::FormParams;
use crate::api::{error::ApiError, extract::bearer_token};
use crate::hash::hash_token;
use crate::store::RefreshTokenRepository;

#[derive(Deserialize)]
struct JsonToken {
    token: Option<String>,
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .map(|value| value.trim().to_ascii_lowercase())
}

/// `true` when the body is a form (explicitly, or untyped and non-empty).
#[must_use]
pub fn is_form(headers: &HeaderMap, body: &[u8]) -> bool {
    match content_type(headers).as_deref() {
        Some("application/x-www-form-urlencoded") => true,
        None => !body.is_empty(),
        Some(_) => false,
    }
}

/// The token to revoke plus the form (for optional client authentication).
/// Looks at the form field, then a Bearer header, then a JSON body.
///
/// # Errors
/// `invalid_request` when no token is present or the body is malformed.
pub fn extract_token(headers: &HeaderMap, body: &[u8]) -> Result<(String, FormParams), ApiError> {
    let form = if is_form(headers, body) {
        FormParams::parse(body)?
    } else {
        FormParams::default()
    };
    if let Some(token) = form.get("token") {
        return Ok((token.to_string(), form));
    }
    if let Some(token) = bearer_token(headers) {
        return Ok((token, form));
    }
    if content_type(headers).as_deref() == Some("application/json") {
        let parsed: JsonToken = serde_json::from_slice(body)
            .map_err(|_| ApiError::invalid_request("malformed JSON body"))?;
        if let Some(token) = parsed.token.filter(|token| !token.is_empty()) {
            return Ok((token, form));
        }
    }
    Err(ApiError::invalid_request("missing token"))
}

/// Revoke `raw` if it exists and, when `owner` is given, belongs to that client.
/// Failures are logged and swallowed.
pub async fn revoke_refresh_token(
    tokens: &dyn RefreshTokenRepository,
    raw: &str,
    owner: Option<&str>,
) {
    let token = match tokens.get_by_hash(&hash_token(raw)).await {
        Ok(Some(token)) => token,
        Ok(None) => {
            debug!("Revocation for unknown token");
            return;
        }
        Err(err) => {
            warn!("Failed to look up token for revocation: {err:#}");
            return;
        }
    };
    if owner.is_some_and(|client_id| client_id != token.client_id) {
        debug!("Revocation by a client that does not own the token");
        return;
    }
    if let Err(err) = tokens.revoke_by_id(token.id).await {
        warn!("Failed to revoke refresh token {}: {err:#}", token.id);
    }
}
