//! Request extractors: tenant slug, active store and bearer token.

use axum::{
    extract::FromRequestParts,
    http::{
        HeaderMap,
        header::{AUTHORIZATION, HOST},
        request::Parts,
    },
};
use std::sync::Arc;
use tracing::error;
use url::form_urlencoded;

use super::{error::ApiError, state::AppState};
use crate::tenancy::{ActiveStore, valid_slug};

pub const TENANT_SLUG_HEADER: &str = "x-tenant-slug";
const TENANT_QUERY_PARAM: &str = "tenant";

/// Token after `Bearer ` (either case), if any.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let trimmed = value.trim();
    let token = trimmed
        .strip_prefix("Bearer ")
        .or_else(|| trimmed.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

fn app_state(parts: &Parts) -> Result<Arc<AppState>, ApiError> {
    parts.extensions.get::<Arc<AppState>>().cloned().ok_or_else(|| {
        error!("AppState not found in extensions");
        ApiError::Internal(anyhow::anyhow!("application state missing"))
    })
}

fn request_host(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(HOST))
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn query_slug(parts: &Parts) -> Option<String> {
    let query = parts.uri.query()?;
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == TENANT_QUERY_PARAM)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Tenant slug named by the request, validated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantSlug(pub Option<String>);

impl TenantSlug {
    /// Header, then query parameter, then (domain issuer mode) the host.
    ///
    /// # Errors
    /// `invalid_request` when the slug found is not `[A-Za-z0-9-]{1,63}`.
    pub fn resolve(parts: &Parts, state: &AppState) -> Result<Self, ApiError> {
        let explicit = parts
            .headers
            .get(TENANT_SLUG_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| query_slug(parts));

        let slug = match explicit {
            Some(slug) => Some(slug),
            None => request_host(&parts.headers)
                .and_then(|host| state.issuer().slug_from_host(host)),
        };

        match slug {
            Some(slug) if !valid_slug(&slug) => {
                Err(ApiError::invalid_request("invalid tenant slug"))
            }
            slug => Ok(Self(slug)),
        }
    }
}

impl<S> FromRequestParts<S> for TenantSlug
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let state = app_state(parts)?;
        Self::resolve(parts, &state)
    }
}

/// The store selected for the request's tenant slug.
pub struct Active(pub ActiveStore);

impl<S> FromRequestParts<S> for Active
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let state = app_state(parts)?;
        let TenantSlug(slug) = TenantSlug::resolve(parts, &state)?;
        let active = state.selector().select(slug.as_deref()).await?;
        Ok(Self(active))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issuer::{IssuerMode, IssuerResolver};
    use crate::oauth::{JwtSigner, MemoryCodeStore, TokenConfig, TokenService};
    use crate::session::{MemorySessionCache, SessionManager};
    use crate::store::StoreHandle;
    use crate::tenancy::StoreSelector;
    use axum::http::{HeaderValue, Request};

    fn state(mode: IssuerMode) -> anyhow::Result<AppState> {
        let tokens = TokenService::new(
            StoreSelector::new(StoreHandle::memory()),
            IssuerResolver::new(mode, "https://auth.example.com")?,
            Arc::new(JwtSigner::generate(None)?),
            Arc::new(MemoryCodeStore::new()),
            TokenConfig::new(),
        );
        let sessions = SessionManager::new(
            Arc::new(MemorySessionCache::new()),
            chrono::Duration::hours(1),
        );
        Ok(AppState::new(tokens, sessions))
    }

    fn parts(uri: &str, headers: &[(&'static str, &'static str)]) -> anyhow::Result<Parts> {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, HeaderValue::from_static(value));
        }
        Ok(builder.body(())?.into_parts().0)
    }

    #[test]
    fn slug_sources_in_order() -> anyhow::Result<()> {
        let state = state(IssuerMode::Domain)?;
        let request = parts(
            "/v1/oauth/token?tenant=fromQuery",
            &[("x-tenant-slug", "fromHeader"), ("host", "acme.auth.example.com")],
        )?;
        assert_eq!(
            TenantSlug::resolve(&request, &state)?,
            TenantSlug(Some("fromHeader".to_string()))
        );

        let request = parts(
            "/v1/oauth/token?tenant=fromQuery",
            &[("host", "acme.auth.example.com")],
        )?;
        assert_eq!(
            TenantSlug::resolve(&request, &state)?,
            TenantSlug(Some("fromQuery".to_string()))
        );

        let request = parts(
            "/v1/oauth/token",
            &[("x-forwarded-host", "acme.auth.example.com:443"), ("host", "internal")],
        )?;
        assert_eq!(
            TenantSlug::resolve(&request, &state)?,
            TenantSlug(Some("acme".to_string()))
        );
        Ok(())
    }

    #[test]
    fn host_is_ignored_outside_domain_mode() -> anyhow::Result<()> {
        let state = state(IssuerMode::Path)?;
        let request = parts("/v1/oauth/token", &[("host", "acme.auth.example.com")])?;
        assert_eq!(TenantSlug::resolve(&request, &state)?, TenantSlug(None));
        Ok(())
    }

    #[test]
    fn invalid_slug_is_invalid_request() -> anyhow::Result<()> {
        let state = state(IssuerMode::Global)?;
        let request = parts("/v1/oauth/token?tenant=a%2Fb", &[])?;
        assert!(matches!(
            TenantSlug::resolve(&request, &state),
            Err(ApiError::InvalidRequest(_))
        ));
        Ok(())
    }

    #[test]
    fn bearer_prefixes() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc".to_string()));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }
}
