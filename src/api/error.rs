//! Error responses shared by every `/v1` handler.
//!
//! Bodies are always `{error, error_description, code}`; `code` is stable and
//! safe for client dashboards to branch on.

use axum::{
    Json,
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{CACHE_CONTROL, PRAGMA, WWW_AUTHENTICATE},
    },
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;
use utoipa::ToSchema;

use crate::session::SessionError;
use crate::tenancy::SelectError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("{0}")]
    InvalidGrant(String),
    #[error("{0}")]
    InvalidClient(String),
    #[error("{0}")]
    InvalidScope(String),
    #[error("{0}")]
    UnauthorizedClient(String),
    #[error("{0}")]
    UnsupportedGrantType(String),
    #[error("{0}")]
    AccessDenied(String),
    #[error("csrf token mismatch")]
    CsrfMismatch,
    #[error("no tenant database configured for {0}")]
    TenantDbMissing(String),
    #[error("session store unavailable")]
    SessionStoreUnavailable(#[source] anyhow::Error),
    #[error("{0}")]
    NotSupported(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct ErrorBody {
    pub error: String,
    pub error_description: String,
    pub code: u16,
}

impl ApiError {
    #[must_use]
    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::InvalidRequest(description.into())
    }

    #[must_use]
    pub fn invalid_grant(description: impl Into<String>) -> Self {
        Self::InvalidGrant(description.into())
    }

    #[must_use]
    pub fn invalid_client(description: impl Into<String>) -> Self {
        Self::InvalidClient(description.into())
    }

    #[must_use]
    pub fn invalid_scope(description: impl Into<String>) -> Self {
        Self::InvalidScope(description.into())
    }

    #[must_use]
    pub fn access_denied(description: impl Into<String>) -> Self {
        Self::AccessDenied(description.into())
    }

    /// OAuth2 error string.
    #[must_use]
    pub const fn error(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidGrant(_) => "invalid_grant",
            Self::InvalidClient(_) => "invalid_client",
            Self::InvalidScope(_) => "invalid_scope",
            Self::UnauthorizedClient(_) => "unauthorized_client",
            Self::UnsupportedGrantType(_) => "unsupported_grant_type",
            Self::AccessDenied(_) => "access_denied",
            Self::CsrfMismatch => "csrf_mismatch",
            Self::TenantDbMissing(_) => "tenant_db_missing",
            Self::SessionStoreUnavailable(_) => "session_store_unavailable",
            Self::NotSupported(_) => "not_supported",
            Self::Internal(_) => "internal",
        }
    }

    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) => 1001,
            Self::InvalidGrant(_) => 1002,
            Self::InvalidClient(_) => 1003,
            Self::InvalidScope(_) => 1004,
            Self::UnauthorizedClient(_) => 1005,
            Self::UnsupportedGrantType(_) => 1006,
            Self::AccessDenied(_) => 1007,
            Self::CsrfMismatch => 1008,
            Self::TenantDbMissing(_) => 2001,
            Self::SessionStoreUnavailable(_) => 2002,
            Self::Internal(_) => 5000,
            Self::NotSupported(_) => 5001,
        }
    }

    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::InvalidGrant(_)
            | Self::InvalidScope(_)
            | Self::UnauthorizedClient(_)
            | Self::UnsupportedGrantType(_) => StatusCode::BAD_REQUEST,
            Self::InvalidClient(_) | Self::AccessDenied(_) => StatusCode::UNAUTHORIZED,
            Self::CsrfMismatch => StatusCode::FORBIDDEN,
            Self::TenantDbMissing(_) | Self::SessionStoreUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::NotSupported(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn description(&self) -> String {
        match self {
            // never leak internals
            Self::Internal(_) => "internal server error".to_string(),
            Self::SessionStoreUnavailable(_) => "session store unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<SelectError> for ApiError {
    fn from(err: SelectError) -> Self {
        match err {
            SelectError::TenantDbMissing(slug) => Self::TenantDbMissing(slug),
            SelectError::Internal(err) => Self::Internal(err),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Unavailable(err) => Self::SessionStoreUnavailable(err),
            SessionError::Internal(err) => Self::Internal(err),
        }
    }
}

/// `Cache-Control: no-store` and `Pragma: no-cache`.
#[must_use]
pub fn no_store_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(PRAGMA, HeaderValue::from_static("no-cache"));
    headers
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            Self::Internal(err) => error!("Internal error: {err:#}"),
            Self::SessionStoreUnavailable(err) => error!("Session store unavailable: {err:#}"),
            Self::TenantDbMissing(slug) => error!("No tenant database for {slug}"),
            _ => {}
        }

        let mut headers = no_store_headers();
        if self.status() == StatusCode::UNAUTHORIZED {
            headers.insert(
                WWW_AUTHENTICATE,
                HeaderValue::from_static("Basic realm=\"tessera\""),
            );
        }
        let body = ErrorBody {
            error: self.error().to_string(),
            error_description: self.description(),
            code: self.code(),
        };
        (self.status(), headers, Json(body)).into_response()
    }
}
