//! `POST /v1/oauth/token`

use axum::{
    Json,
    body::{Body, to_bytes},
    extract::Extension,
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, warn};

use super::has_form_content_type;
use crate::api::{
    error::{ApiError, ErrorBody, no_store_headers},
    extract::TenantSlug,
    state::AppState,
};
use crate::oauth::{TokenResponse, form::FormParams};

pub const TOKEN_BODY_LIMIT: usize = 64 * 1024;

#[utoipa::path(
    post,
    path = "/v1/oauth/token",
    request_body(content = String, content_type = "application/x-www-form-urlencoded"),
    params(
        ("X-Tenant-Slug" = Option<String>, Header, description = "Tenant slug")
    ),
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 400, description = "OAuth2 error", body = ErrorBody),
        (status = 401, description = "Client authentication failed", body = ErrorBody),
        (status = 503, description = "Tenant database unavailable", body = ErrorBody)
    ),
    tag = "oauth"
)]
pub async fn token(
    headers: HeaderMap,
    slug: TenantSlug,
    state: Extension<Arc<AppState>>,
    body: Body,
) -> Result<Response, ApiError> {
    if !has_form_content_type(&headers) {
        return Err(ApiError::invalid_request(
            "content type must be application/x-www-form-urlencoded",
        ));
    }
    let tokens = state.tokens();
    let deadline = tokens.config().deadline();
    // The whole request, body upload included, runs under the deadline.
    let exchange = async {
        let body = to_bytes(body, TOKEN_BODY_LIMIT)
            .await
            .map_err(|_| ApiError::invalid_request("request body too large"))?;
        let form = FormParams::parse(&body)?;
        let active = tokens.selector().select(slug.0.as_deref()).await?;
        let response = tokens.exchange(&active, &headers, &form).await?;
        debug!("Issued tokens for grant {}", form.get("grant_type").unwrap_or_default());
        Ok::<_, ApiError>(response)
    };
    let response = match tokio::time::timeout(deadline, exchange).await {
        Ok(result) => result?,
        Err(_) => {
            warn!("Token request exceeded its {}ms deadline", deadline.as_millis());
            return Err(ApiError::Internal(anyhow::anyhow!("token request deadline exceeded")));
        }
    };

    Ok((no_store_headers(), Json(response)).into_response())
}
