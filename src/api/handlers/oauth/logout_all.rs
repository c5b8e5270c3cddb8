//! `POST /v1/auth/logout-all`: revoke every refresh token of a subject.
//!
//! Access JWTs already handed out stay valid until they expire.

use axum::{
    body::{Body, to_bytes},
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use utoipa::ToSchema;

use crate::api::{
    error::{ApiError, ErrorBody, no_store_headers},
    extract::{TenantSlug, bearer_token},
    state::AppState,
};
use crate::oauth::{Claims, TokenUse};
use crate::store::BulkRevokeOutcome;
use crate::tenancy::ActiveStore;

const LOGOUT_ALL_BODY_LIMIT: usize = 16 * 1024;
const ADMIN_ROLE: &str = "admin";

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LogoutAllRequest {
    pub user_id: Option<String>,
    pub client_id: Option<String>,
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout-all",
    request_body = LogoutAllRequest,
    params(
        ("Authorization" = String, Header, description = "Bearer access token"),
        ("X-Tenant-Slug" = Option<String>, Header, description = "Tenant slug")
    ),
    responses(
        (status = 204, description = "Refresh tokens revoked"),
        (status = 400, description = "Missing user_id", body = ErrorBody),
        (status = 401, description = "Caller may not log this user out", body = ErrorBody),
        (status = 501, description = "Store does not support bulk revocation", body = ErrorBody)
    ),
    tag = "oauth"
)]
pub async fn logout_all(
    headers: HeaderMap,
    slug: TenantSlug,
    state: Extension<Arc<AppState>>,
    body: Body,
) -> Result<Response, ApiError> {
    let body = to_bytes(body, LOGOUT_ALL_BODY_LIMIT)
        .await
        .map_err(|_| ApiError::invalid_request("request body too large"))?;
    let request: LogoutAllRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::invalid_request("malformed JSON body"))?;
    let user_id = request
        .user_id
        .filter(|user_id| !user_id.is_empty())
        .ok_or_else(|| ApiError::invalid_request("missing user_id"))?;
    let client_id = request.client_id.filter(|client_id| !client_id.is_empty());

    let token =
        bearer_token(&headers).ok_or_else(|| ApiError::access_denied("missing bearer token"))?;
    let claims = state
        .tokens()
        .signer()
        .verify(&token, None, None)
        .map_err(|err| {
            debug!("Rejected logout-all bearer: {err:#}");
            ApiError::access_denied("invalid bearer token")
        })?;
    if claims.token_use() != TokenUse::Access {
        return Err(ApiError::access_denied("access token required"));
    }

    let selector = state.tokens().selector();
    let active = selector.select(slug.0.as_deref()).await?;
    let active = selector.reselect(&active, claims.tid()).await?;
    authorize_caller(&active, &claims, &user_id).await?;

    match active
        .store
        .refresh_tokens
        .revoke_all_for_subject(&user_id, client_id.as_deref())
        .await?
    {
        BulkRevokeOutcome::Revoked(count) => {
            info!("Revoked {count} refresh tokens for {user_id}");
            Ok((StatusCode::NO_CONTENT, no_store_headers()).into_response())
        }
        BulkRevokeOutcome::Unsupported => Err(ApiError::NotSupported(
            "store does not support bulk revocation".to_string(),
        )),
    }
}

/// The subject itself, or an admin of the subject's tenant.
async fn authorize_caller(
    active: &ActiveStore,
    claims: &Claims,
    user_id: &str,
) -> Result<(), ApiError> {
    if claims.sub() == user_id {
        return Ok(());
    }
    if claims.system().has_role(ADMIN_ROLE) {
        let user = active.store.users.get_by_id(user_id).await?;
        if user.is_some_and(|user| user.tenant_id == claims.tid()) {
            return Ok(());
        }
    }
    Err(ApiError::access_denied("not allowed to log out this user"))
}
