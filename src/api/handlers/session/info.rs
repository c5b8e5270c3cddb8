use axum::{
    Json,
    extract::Extension,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

use crate::api::{error::no_store_headers, state::AppState};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionInfo {
    pub subject_id: String,
    pub tenant_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub amr: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acr: Option<String>,
    pub expires_at: DateTime<Utc>,
}

#[utoipa::path(
    get,
    path = "/v1/session",
    responses(
        (status = 200, description = "Session is active", body = SessionInfo),
        (status = 204, description = "No active session")
    ),
    tag = "session"
)]
pub async fn session(headers: HeaderMap, state: Extension<Arc<AppState>>) -> Response {
    // Missing cookies are treated as "no session" to avoid leaking auth state.
    let Some(raw) = state.session_cookie().read(&headers) else {
        return StatusCode::NO_CONTENT.into_response();
    };
    match state.sessions().load(&raw).await {
        Some(record) => (
            no_store_headers(),
            Json(SessionInfo {
                subject_id: record.subject_id,
                tenant_id: record.tenant_id,
                client_id: record.client_id,
                amr: record.amr,
                acr: record.acr,
                expires_at: record.expires_at,
            }),
        )
            .into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
