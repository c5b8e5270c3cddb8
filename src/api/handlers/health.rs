//! `GET|HEAD /health`: build information and global store status.

use axum::{
    Json,
    body::Body,
    extract::Extension,
    http::{HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgPool};
use std::sync::Arc;
use tracing::{Instrument, debug, error, info_span};
use utoipa::ToSchema;

use crate::{GIT_COMMIT_HASH, api::state::AppState, store::Backend};

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct Health {
    commit: String,
    name: String,
    version: String,
    /// `ok`, `error`, or `memory` when no database is configured.
    database: String,
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Global store is healthy", body = Health),
        (status = 503, description = "Global store is unhealthy", body = Health)
    ),
    tag = "health"
)]
pub async fn health(method: Method, state: Extension<Arc<AppState>>) -> Response {
    let (status, database) = match state.selector().global().backend() {
        Backend::Memory => (StatusCode::OK, "memory"),
        Backend::Postgres(pool) => match ping(pool).await {
            Ok(()) => (StatusCode::OK, "ok"),
            Err(err) => {
                error!("Global store health check failed: {err}");
                (StatusCode::SERVICE_UNAVAILABLE, "error")
            }
        },
    };
    debug!("Health: database={database}");

    let health = Health {
        commit: GIT_COMMIT_HASH.to_string(),
        name: env!("CARGO_PKG_NAME").to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: database.to_string(),
    };

    let headers = app_header(&health);
    if method == Method::HEAD {
        return (status, headers, Body::empty()).into_response();
    }
    (status, headers, Json(health)).into_response()
}

async fn ping(pool: &PgPool) -> Result<(), sqlx::Error> {
    let mut conn = pool
        .acquire()
        .instrument(info_span!(
            "db.acquire",
            db.system = "postgresql",
            db.operation = "ACQUIRE"
        ))
        .await?;
    conn.ping()
        .instrument(info_span!(
            "db.ping",
            db.system = "postgresql",
            db.operation = "PING"
        ))
        .await
}

/// `X-App: name:version:short-commit`
fn app_header(health: &Health) -> HeaderMap {
    let short = health.commit.get(..7).unwrap_or_default();
    let mut headers = HeaderMap::new();
    match HeaderValue::from_str(&format!("{}:{}:{short}", health.name, health.version)) {
        Ok(value) => {
            headers.insert("X-App", value);
        }
        Err(err) => error!("Failed to build X-App header: {err}"),
    }
    headers
}
