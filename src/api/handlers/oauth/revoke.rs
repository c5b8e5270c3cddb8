//! `POST /v1/oauth/revoke`

use axum::{
    body::{Body, to_bytes},
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::api::{
    error::{ApiError, ErrorBody, no_store_headers},
    extract::TenantSlug,
    state::AppState,
};
use crate::oauth::{client_auth, revocation};

pub const REVOKE_BODY_LIMIT: usize = 32 * 1024;

#[utoipa::path(
    post,
    path = "/v1/oauth/revoke",
    request_body(content = String, content_type = "application/x-www-form-urlencoded"),
    params(
        ("X-Tenant-Slug" = Option<String>, Header, description = "Tenant slug")
    ),
    responses(
        (status = 200, description = "Token revoked, or unknown"),
        (status = 400, description = "Missing token", body = ErrorBody),
        (status = 401, description = "Client authentication failed", body = ErrorBody)
    ),
    tag = "oauth"
)]
pub async fn revoke(
    headers: HeaderMap,
    slug: TenantSlug,
    state: Extension<Arc<AppState>>,
    body: Body,
) -> Result<Response, ApiError> {
    let body = to_bytes(body, REVOKE_BODY_LIMIT)
        .await
        .map_err(|_| ApiError::invalid_request("request body too large"))?;
    let (raw, form) = revocation::extract_token(&headers, &body)?;
    let credentials =
        client_auth::extract(&headers, form.get("client_id"), form.get("client_secret"))?;

    let tokens = state.tokens();
    let mut active = tokens.selector().select(slug.0.as_deref()).await?;

    let owner = match credentials {
        Some(credentials) => {
            let client = tokens.find_client(&active, &credentials.client_id).await?;
            if state.revoke_require_client_auth() && !client.is_confidential() {
                return Err(ApiError::invalid_client("confidential client required"));
            }
            client_auth::authenticate(&client, &credentials)?;
            active = tokens.selector().reselect(&active, &client.tenant_id).await?;
            Some(client.client_id)
        }
        None if state.revoke_require_client_auth() => {
            return Err(ApiError::invalid_client("client authentication required"));
        }
        None => None,
    };

    revocation::revoke_refresh_token(active.store.refresh_tokens.as_ref(), &raw, owner.as_deref())
        .await;

    Ok((StatusCode::OK, no_store_headers()).into_response())
}
