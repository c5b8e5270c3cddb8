//! `POST /v1/session/logout`

use axum::{
    extract::Extension,
    http::{
        HeaderMap, HeaderValue, StatusCode, Uri,
        header::{LOCATION, SET_COOKIE},
    },
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, error};
use url::{Url, form_urlencoded};

use crate::api::{
    cookies::{RedirectAllowlist, request_is_secure},
    error::no_store_headers,
    state::AppState,
};

#[utoipa::path(
    post,
    path = "/v1/session/logout",
    params(
        ("return_to" = Option<String>, Query, description = "Absolute URL on an allowlisted host")
    ),
    responses(
        (status = 204, description = "Session cleared"),
        (status = 303, description = "Session cleared, redirecting to return_to")
    ),
    tag = "session"
)]
pub async fn logout(uri: Uri, headers: HeaderMap, state: Extension<Arc<AppState>>) -> Response {
    if let Some(raw) = state.session_cookie().read(&headers) {
        if let Err(err) = state.sessions().destroy(&raw).await {
            error!("Failed to delete session: {err:#}");
        }
    }

    // Always clear the cookie, even if the session record was missing.
    let mut response_headers = no_store_headers();
    match state
        .session_cookie()
        .deletion(request_is_secure(&headers, &uri))
    {
        Ok(cookie) => {
            response_headers.insert(SET_COOKIE, cookie);
        }
        Err(err) => error!("Failed to build deletion cookie: {err}"),
    }

    let location = uri
        .query()
        .and_then(|query| {
            form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "return_to")
                .map(|(_, value)| value.into_owned())
        })
        .and_then(|return_to| allowed_return_to(state.allowlist(), &return_to));

    match location {
        Some(location) => {
            response_headers.insert(LOCATION, location);
            (StatusCode::SEE_OTHER, response_headers).into_response()
        }
        None => (StatusCode::NO_CONTENT, response_headers).into_response(),
    }
}

/// `return_to` as a `Location` value when it is an absolute URL whose host is
/// allowlisted.
pub(crate) fn allowed_return_to(
    allowlist: &dyn RedirectAllowlist,
    return_to: &str,
) -> Option<HeaderValue> {
    let url = Url::parse(return_to).ok()?;
    let host = url.host_str().filter(|host| !host.is_empty())?;
    if url.scheme().is_empty() {
        return None;
    }
    let candidate = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    if !allowlist.contains(&candidate) {
        debug!("Ignoring return_to on a host outside the allowlist");
        return None;
    }
    HeaderValue::from_str(url.as_str()).ok()
}
