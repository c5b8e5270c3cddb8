//! `GET /v1/oauth/authorize`: authorization code issuance for a logged-in
//! browser session.

use axum::{
    extract::Extension,
    http::{HeaderMap, HeaderValue, StatusCode, Uri, header::LOCATION},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::api::{
    error::{ApiError, ErrorBody, no_store_headers},
    extract::TenantSlug,
    state::AppState,
};
use crate::oauth::{
    AuthorizationCode,
    codes::CodeGrant,
    form::FormParams,
    pkce,
    scope::ScopeSet,
};
use crate::store::models::GrantType;

#[utoipa::path(
    get,
    path = "/v1/oauth/authorize",
    params(
        ("response_type" = String, Query, description = "Must be `code`"),
        ("client_id" = String, Query, description = "Client identifier"),
        ("redirect_uri" = String, Query, description = "One of the client's registered redirect URIs"),
        ("code_challenge" = String, Query, description = "PKCE S256 challenge"),
        ("code_challenge_method" = String, Query, description = "Must be `S256`"),
        ("scope" = Option<String>, Query, description = "Requested scopes, defaults to all allowed"),
        ("state" = Option<String>, Query, description = "Opaque value echoed on redirect"),
        ("nonce" = Option<String>, Query, description = "Copied into the ID token"),
        ("X-Tenant-Slug" = Option<String>, Header, description = "Tenant slug")
    ),
    responses(
        (status = 302, description = "Redirect to the client with an authorization code"),
        (status = 400, description = "Invalid authorization request", body = ErrorBody),
        (status = 401, description = "No live session", body = ErrorBody)
    ),
    tag = "oauth"
)]
pub async fn authorize(
    uri: Uri,
    headers: HeaderMap,
    slug: TenantSlug,
    state: Extension<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let Some(session) = (match state.session_cookie().read(&headers) {
        Some(raw) => state.sessions().load(&raw).await,
        None => None,
    }) else {
        return Err(ApiError::access_denied("login required"));
    };

    let params = FormParams::parse(uri.query().unwrap_or_default().as_bytes())?;
    let client_id = params.require("client_id")?;
    let redirect_uri = params.require("redirect_uri")?;

    let tokens = state.tokens();
    let active = tokens.selector().select(slug.0.as_deref()).await?;
    let client = tokens
        .find_client(&active, client_id)
        .await
        .map_err(|err| match err {
            ApiError::InvalidClient(_) => ApiError::invalid_request("unknown client_id"),
            other => other,
        })?;
    if !client.has_redirect_uri(redirect_uri) {
        return Err(ApiError::invalid_request("redirect_uri is not registered"));
    }

    // From here on the redirect URI is trusted; errors go back to the client.
    let client_state = params.get("state");
    let fail = |error: &str, description: &str| {
        redirect(
            redirect_uri,
            &[("error", error), ("error_description", description)],
            client_state,
        )
    };
    if params.get("response_type") != Some("code") {
        return fail("unsupported_response_type", "response_type must be code");
    }
    if !client.allows_grant(GrantType::AuthorizationCode) {
        return fail("unauthorized_client", "authorization_code grant not allowed");
    }
    if params.get("code_challenge_method") != Some(pkce::METHOD_S256) {
        return fail("invalid_request", "code_challenge_method must be S256");
    }
    let Some(challenge) = params
        .get("code_challenge")
        .filter(|challenge| pkce::challenge_is_well_formed(challenge))
    else {
        return fail("invalid_request", "missing or malformed code_challenge");
    };

    let allowed = client.allowed_scopes();
    let scope = match params.get("scope").map(ScopeSet::parse) {
        None => allowed,
        Some(Ok(scope)) if scope.is_subset_of(&allowed) => scope,
        Some(_) => return fail("invalid_scope", "requested scope is not allowed"),
    };
    if session.tenant_id != client.tenant_id {
        debug!("Session tenant does not match client {}", client.client_id);
        return fail("access_denied", "session belongs to another tenant");
    }

    let (raw, code) = AuthorizationCode::issue(
        CodeGrant {
            client_id: client.client_id.clone(),
            tenant_id: client.tenant_id.clone(),
            subject_id: session.subject_id.clone(),
            redirect_uri: redirect_uri.to_string(),
            scope,
            code_challenge: challenge.to_string(),
            nonce: params.get("nonce").map(str::to_string),
            amr: session.amr.clone(),
            acr: session.acr.clone(),
        },
        tokens.config().auth_code_ttl(),
        Utc::now(),
    )?;
    tokens.codes().put(&code).await?;
    info!("Issued authorization code for client {}", client.client_id);

    redirect(redirect_uri, &[("code", raw.as_str())], client_state)
}

fn redirect(
    redirect_uri: &str,
    pairs: &[(&str, &str)],
    client_state: Option<&str>,
) -> Result<Response, ApiError> {
    let mut location = Url::parse(redirect_uri)
        .map_err(|_| ApiError::invalid_request("redirect_uri is not an absolute URL"))?;
    {
        let mut query = location.query_pairs_mut();
        for (key, value) in pairs {
            query.append_pair(key, value);
        }
        if let Some(client_state) = client_state {
            query.append_pair("state", client_state);
        }
    }
    let location = HeaderValue::from_str(location.as_str())
        .map_err(|err| ApiError::Internal(anyhow::Error::new(err)))?;
    let mut headers = no_store_headers();
    headers.insert(LOCATION, location);
    Ok((StatusCode::FOUND, headers).into_response())
}
