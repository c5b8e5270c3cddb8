//! Per-tenant issuer resolution.
//!
//! The issuer computed here is the one written into `iss` by the signer, so it
//! must be stable for a given tenant and mode.

use anyhow::{Context, Result, anyhow};
use std::{fmt, str::FromStr};
use url::Url;

use crate::store::models::Tenant;

const NAMESPACE_SUFFIX: &str = "/sys";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IssuerMode {
    #[default]
    Global,
    Path,
    Domain,
}

impl IssuerMode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Path => "path",
            Self::Domain => "domain",
        }
    }
}

impl fmt::Display for IssuerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssuerMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "global" => Ok(Self::Global),
            "path" => Ok(Self::Path),
            "domain" => Ok(Self::Domain),
            other => Err(anyhow!("unknown issuer mode: {other}")),
        }
    }
}

/// Effective issuer plus the claims namespace derived from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedIssuer {
    pub issuer: String,
    pub namespace: String,
}

impl ResolvedIssuer {
    fn new(issuer: String) -> Self {
        let namespace = format!("{}{NAMESPACE_SUFFIX}", issuer.trim_end_matches('/'));
        Self { issuer, namespace }
    }

    /// Rebuild the pair from an `iss` claim.
    #[must_use]
    pub fn from_issuer(issuer: &str) -> Self {
        Self::new(issuer.to_string())
    }
}

#[derive(Clone, Debug)]
pub struct IssuerResolver {
    mode: IssuerMode,
    base: Url,
    // `base` rendered without a trailing slash
    base_str: String,
}

impl IssuerResolver {
    /// # Errors
    /// Returns an error if `base` is not an absolute http(s) URL with a host.
    pub fn new(mode: IssuerMode, base: &str) -> Result<Self> {
        let parsed = Url::parse(base).with_context(|| format!("Invalid issuer base URL: {base}"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!("Issuer base URL must use http or https: {base}"));
        }
        if parsed.host_str().is_none() {
            return Err(anyhow!("Issuer base URL must include a host: {base}"));
        }
        let base_str = parsed.as_str().trim_end_matches('/').to_string();
        Ok(Self {
            mode,
            base: parsed,
            base_str,
        })
    }

    #[must_use]
    pub const fn mode(&self) -> IssuerMode {
        self.mode
    }

    #[must_use]
    pub fn base(&self) -> &str {
        &self.base_str
    }

    /// Host of the base URL; tenant hosts in domain mode are its subdomains.
    #[must_use]
    pub fn base_host(&self) -> Option<&str> {
        self.base.host_str()
    }

    /// Resolve the issuer for a request. A tenant's own `settings.issuer` wins,
    /// otherwise the slug is applied according to the configured mode.
    #[must_use]
    pub fn resolve(&self, tenant: Option<&Tenant>, slug: Option<&str>) -> ResolvedIssuer {
        if let Some(issuer) = tenant
            .and_then(|tenant| tenant.settings.issuer.as_deref())
            .map(str::trim)
            .filter(|issuer| !issuer.is_empty())
        {
            return ResolvedIssuer::new(issuer.trim_end_matches('/').to_string());
        }

        let slug = tenant.map(|tenant| tenant.slug.as_str()).or(slug);
        let issuer = match (self.mode, slug) {
            (IssuerMode::Global, _) | (_, None) => self.base_str.clone(),
            (IssuerMode::Path, Some(slug)) => format!("{}/{slug}", self.base_str),
            (IssuerMode::Domain, Some(slug)) => self.domain_issuer(slug),
        };
        ResolvedIssuer::new(issuer)
    }

    fn domain_issuer(&self, slug: &str) -> String {
        let Some(host) = self.base.host_str() else {
            return self.base_str.clone();
        };
        let port = self
            .base
            .port()
            .map_or_else(String::new, |port| format!(":{port}"));
        let path = self.base.path().trim_end_matches('/');
        format!(
            "{}://{}.{host}{port}{path}",
            self.base.scheme(),
            slug.to_ascii_lowercase()
        )
    }

    /// In domain mode, the left-most label of `host` when it is a direct
    /// subdomain of the base host.
    #[must_use]
    pub fn slug_from_host(&self, host: &str) -> Option<String> {
        if self.mode != IssuerMode::Domain {
            return None;
        }
        let base_host = self.base.host_str()?.to_ascii_lowercase();
        let host = strip_port(host.trim()).to_ascii_lowercase();
        let label = host.strip_suffix(&base_host)?.strip_suffix('.')?;
        if label.is_empty() || label.contains('.') {
            return None;
        }
        Some(label.to_string())
    }
}

/// `host[:port]` to `host`, keeping bracketed IPv6 literals intact.
pub(crate) fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}
