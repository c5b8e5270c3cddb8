//! Double-submit CSRF token issuance and verification.

use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, Uri, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;
use utoipa::ToSchema;

use crate::api::{
    cookies::request_is_secure,
    error::{ApiError, ErrorBody, no_store_headers},
    extract::bearer_token,
    state::{AppState, CSRF_HEADER},
};
use crate::hash::{generate_hex_token, secure_eq};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct CsrfResponse {
    pub csrf_token: String,
}

#[utoipa::path(
    get,
    path = "/v1/csrf",
    responses(
        (status = 200, description = "CSRF token issued", body = CsrfResponse),
        (status = 500, description = "Entropy source failed", body = ErrorBody)
    ),
    tag = "session"
)]
pub async fn csrf(
    uri: Uri,
    headers: HeaderMap,
    state: Extension<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let token = generate_hex_token()?;
    let cookie = state
        .csrf()
        .cookie()
        .build(&token, request_is_secure(&headers, &uri))
        .map_err(|err| ApiError::Internal(anyhow::Error::new(err)))?;

    let mut response_headers = no_store_headers();
    response_headers.insert(SET_COOKIE, cookie);
    Ok((response_headers, Json(CsrfResponse { csrf_token: token })).into_response())
}

/// Cookie routes must echo the CSRF cookie in `X-CSRF-Token`. Bearer callers
/// are not exposed to ambient cookies and skip the check.
///
/// # Errors
/// `csrf_mismatch` when either value is missing or they differ.
pub fn verify_csrf(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if !state.csrf().enforced() || bearer_token(headers).is_some() {
        return Ok(());
    }
    let cookie = state.csrf().cookie().read(headers);
    let header = headers
        .get(CSRF_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    match (cookie, header) {
        (Some(cookie), Some(header)) if secure_eq(&cookie, header) => Ok(()),
        _ => {
            debug!("CSRF double-submit check failed");
            Err(ApiError::CsrfMismatch)
        }
    }
}
