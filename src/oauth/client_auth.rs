//! Client authentication: `client_secret_basic`, `client_secret_post`, or none
//! for public clients.

use axum::http::{HeaderMap, header::AUTHORIZATION};
use base64::{Engine, engine::general_purpose::STANDARD};

use crate::api::error::ApiError;
use crate::hash::{hash_token, secure_eq};
use crate::store::models::Client;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    Basic,
    Post,
    None,
}

/// Credentials presented by the caller; the secret is checked by [`authenticate`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub method: AuthMethod,
}

fn basic_credentials(headers: &HeaderMap) -> Result<Option<(String, String)>, ApiError> {
    let Some(value) = headers.get(AUTHORIZATION) else {
        return Ok(None);
    };
    let Ok(value) = value.to_str() else {
        return Err(ApiError::invalid_client("malformed authorization header"));
    };
    let trimmed = value.trim();
    let Some(encoded) = trimmed
        .strip_prefix("Basic ")
        .or_else(|| trimmed.strip_prefix("basic "))
    else {
        // Bearer and other schemes are not client authentication.
        return Ok(None);
    };
    let decoded = STANDARD
        .decode(encoded.trim())
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .ok_or_else(|| ApiError::invalid_client("malformed basic credentials"))?;
    let (id, secret) = decoded
        .split_once(':')
        .ok_or_else(|| ApiError::invalid_client("malformed basic credentials"))?;
    if id.is_empty() {
        return Err(ApiError::invalid_client("malformed basic credentials"));
    }
    Ok(Some((id.to_string(), secret.to_string())))
}

/// Collect the client credentials from the `Authorization` header and the
/// form. Returns `None` when no client id was presented at all.
///
/// # Errors
/// `invalid_request` when more than one method is used or the ids disagree,
/// `invalid_client` for malformed basic credentials.
pub fn extract(
    headers: &HeaderMap,
    form_client_id: Option<&str>,
    form_client_secret: Option<&str>,
) -> Result<Option<ClientCredentials>, ApiError> {
    let form_client_id = form_client_id.filter(|id| !id.is_empty());
    let form_client_secret = form_client_secret.filter(|secret| !secret.is_empty());

    match basic_credentials(headers)? {
        Some((id, secret)) => {
            if form_client_secret.is_some() {
                return Err(ApiError::invalid_request(
                    "multiple client authentication methods",
                ));
            }
            if form_client_id.is_some_and(|form_id| form_id != id) {
                return Err(ApiError::invalid_request("client_id mismatch"));
            }
            Ok(Some(ClientCredentials {
                client_id: id,
                client_secret: Some(secret),
                method: AuthMethod::Basic,
            }))
        }
        None => Ok(form_client_id.map(|id| ClientCredentials {
            client_id: id.to_string(),
            client_secret: form_client_secret.map(str::to_string),
            method: if form_client_secret.is_some() {
                AuthMethod::Post
            } else {
                AuthMethod::None
            },
        })),
    }
}

/// Confidential clients must prove their secret; public clients pass and any
/// secret they send is ignored.
///
/// # Errors
/// `invalid_client` on a missing or wrong secret.
pub fn authenticate(client: &Client, credentials: &ClientCredentials) -> Result<(), ApiError> {
    if !client.is_confidential() {
        return Ok(());
    }
    let (Some(secret), Some(expected)) = (&credentials.client_secret, &client.secret_hash) else {
        return Err(ApiError::invalid_client("client authentication failed"));
    };
    if secure_eq(&hash_token(secret), expected) {
        Ok(())
    } else {
        Err(ApiError::invalid_client("client authentication failed"))
    }
}
