//! `POST /v1/session/login`: password login that opens a browser session.

use axum::{
    Json,
    body::{Body, to_bytes},
    extract::Extension,
    http::{HeaderMap, Uri, header::SET_COOKIE},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use utoipa::ToSchema;

use super::csrf::verify_csrf;
use crate::api::{
    cookies::request_is_secure,
    error::{ApiError, ErrorBody, no_store_headers},
    extract::TenantSlug,
    state::AppState,
};
use crate::session::{NewSession, password::verify_or_burn};

const LOGIN_BODY_LIMIT: usize = 16 * 1024;

#[derive(ToSchema, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct LoginResponse {
    pub subject_id: String,
    pub tenant_id: String,
    pub expires_at: DateTime<Utc>,
}

#[utoipa::path(
    post,
    path = "/v1/session/login",
    request_body = LoginRequest,
    params(
        ("X-CSRF-Token" = Option<String>, Header, description = "Echo of the CSRF cookie"),
        ("X-Tenant-Slug" = Option<String>, Header, description = "Tenant slug")
    ),
    responses(
        (status = 200, description = "Session created", body = LoginResponse),
        (status = 400, description = "Malformed request", body = ErrorBody),
        (status = 401, description = "Invalid credentials", body = ErrorBody),
        (status = 403, description = "CSRF check failed", body = ErrorBody),
        (status = 503, description = "Session store unavailable", body = ErrorBody)
    ),
    tag = "session"
)]
pub async fn login(
    uri: Uri,
    headers: HeaderMap,
    slug: TenantSlug,
    state: Extension<Arc<AppState>>,
    body: Body,
) -> Result<Response, ApiError> {
    verify_csrf(&state, &headers)?;

    let body = to_bytes(body, LOGIN_BODY_LIMIT)
        .await
        .map_err(|_| ApiError::invalid_request("request body too large"))?;
    let request: LoginRequest = serde_json::from_slice(&body)
        .map_err(|_| ApiError::invalid_request("malformed JSON body"))?;
    if request.email.trim().is_empty() || request.password.is_empty() {
        return Err(ApiError::invalid_request("email and password are required"));
    }

    let tokens = state.tokens();
    let mut active = tokens.selector().select(slug.0.as_deref()).await?;
    let client_id = request.client_id.filter(|client_id| !client_id.is_empty());
    let tenant_id = match &client_id {
        Some(client_id) => {
            let client = tokens.find_client(&active, client_id).await?;
            active = tokens.selector().reselect(&active, &client.tenant_id).await?;
            client.tenant_id
        }
        None => active
            .tenant
            .as_ref()
            .map(|tenant| tenant.id.clone())
            .or_else(|| active.slug.clone())
            .ok_or_else(|| ApiError::invalid_request("tenant could not be determined"))?,
    };

    let user = active
        .store
        .users
        .get_by_email(&tenant_id, request.email.trim())
        .await?;
    let hash = user.as_ref().and_then(|user| user.password_hash.clone());
    let password = request.password;
    let verified = tokio::task::spawn_blocking(move || verify_or_burn(&password, hash.as_deref()))
        .await
        .map_err(|err| ApiError::Internal(anyhow::Error::new(err)))?;
    let Some(user) = user.filter(|_| verified) else {
        debug!("Login failed for tenant {tenant_id}");
        return Err(ApiError::access_denied("invalid credentials"));
    };

    let (raw, record) = state
        .sessions()
        .create(NewSession {
            subject_id: user.id.clone(),
            tenant_id: user.tenant_id.clone(),
            client_id,
            amr: vec!["pwd".to_string()],
            acr: None,
        })
        .await?;
    let cookie = state
        .session_cookie()
        .build(&raw, request_is_secure(&headers, &uri))
        .map_err(|err| ApiError::Internal(anyhow::Error::new(err)))?;
    info!("Session opened for {}", user.id);

    let mut response_headers = no_store_headers();
    response_headers.insert(SET_COOKIE, cookie);
    Ok((
        response_headers,
        Json(LoginResponse {
            subject_id: record.subject_id,
            tenant_id: record.tenant_id,
            expires_at: record.expires_at,
        }),
    )
        .into_response())
}
