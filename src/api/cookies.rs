//! Cookie policy for the session and CSRF cookies, plus the logout redirect
//! allowlist.

use anyhow::{Result, anyhow};
use axum::http::{
    HeaderMap, HeaderValue, Uri,
    header::{COOKIE, InvalidHeaderValue},
};
use chrono::{DateTime, Duration, Utc};
use std::{collections::HashSet, fmt, str::FromStr};

use crate::issuer::strip_port;

const EXPIRES_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SameSite {
    Lax,
    Strict,
    None,
}

impl SameSite {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Lax => "Lax",
            Self::Strict => "Strict",
            Self::None => "None",
        }
    }
}

impl FromStr for SameSite {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "lax" => Ok(Self::Lax),
            "strict" => Ok(Self::Strict),
            "none" => Ok(Self::None),
            other => Err(anyhow!("invalid SameSite value: {other}")),
        }
    }
}

impl fmt::Display for SameSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When to set the `Secure` attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecureMode {
    /// Follow the request: TLS or a forwarded `https` proto.
    Auto,
    Always,
    Never,
}

impl FromStr for SecureMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "always" | "true" => Ok(Self::Always),
            "never" | "false" => Ok(Self::Never),
            other => Err(anyhow!("invalid secure mode: {other}")),
        }
    }
}

/// Whether the original client connection used TLS, as far as proxies tell us.
#[must_use]
pub fn request_is_secure(headers: &HeaderMap, uri: &Uri) -> bool {
    if let Some(proto) = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
    {
        return proto.trim().eq_ignore_ascii_case("https");
    }
    if let Some(forwarded) = headers
        .get("forwarded")
        .and_then(|value| value.to_str().ok())
    {
        let first = forwarded.split(',').next().unwrap_or_default();
        for pair in first.split(';') {
            if let Some((key, value)) = pair.trim().split_once('=') {
                if key.trim().eq_ignore_ascii_case("proto") {
                    return value.trim().trim_matches('"').eq_ignore_ascii_case("https");
                }
            }
        }
    }
    uri.scheme_str() == Some("https")
}

/// Attributes shared by every cookie built from the same policy.
#[derive(Clone, Debug)]
pub struct CookiePolicy {
    name: String,
    domain: Option<String>,
    same_site: SameSite,
    secure: SecureMode,
    http_only: bool,
    ttl: Duration,
}

impl CookiePolicy {
    #[must_use]
    pub fn new(name: &str, ttl: Duration) -> Self {
        Self {
            name: name.to_string(),
            domain: None,
            same_site: SameSite::Lax,
            secure: SecureMode::Auto,
            http_only: true,
            ttl,
        }
    }

    #[must_use]
    pub fn with_domain(mut self, domain: Option<String>) -> Self {
        self.domain = domain.filter(|domain| !domain.trim().is_empty());
        self
    }

    #[must_use]
    pub fn with_same_site(mut self, same_site: SameSite) -> Self {
        self.same_site = same_site;
        self
    }

    #[must_use]
    pub fn with_secure(mut self, secure: SecureMode) -> Self {
        self.secure = secure;
        self
    }

    #[must_use]
    pub fn with_http_only(mut self, http_only: bool) -> Self {
        self.http_only = http_only;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn secure(&self, request_secure: bool) -> bool {
        // browsers drop SameSite=None cookies without Secure
        self.same_site == SameSite::None
            || match self.secure {
                SecureMode::Auto => request_secure,
                SecureMode::Always => true,
                SecureMode::Never => false,
            }
    }

    fn render(
        &self,
        value: &str,
        expires: DateTime<Utc>,
        max_age: i64,
        request_secure: bool,
    ) -> String {
        let mut cookie = format!(
            "{}={value}; Path=/; Expires={}; Max-Age={max_age}; SameSite={}",
            self.name,
            expires.format(EXPIRES_FORMAT),
            self.same_site
        );
        if let Some(domain) = &self.domain {
            cookie.push_str("; Domain=");
            cookie.push_str(domain);
        }
        if self.http_only {
            cookie.push_str("; HttpOnly");
        }
        if self.secure(request_secure) {
            cookie.push_str("; Secure");
        }
        cookie
    }

    /// `Set-Cookie` value carrying `value` for the policy TTL.
    ///
    /// # Errors
    /// Returns an error if the value contains bytes not allowed in a header.
    pub fn build(
        &self,
        value: &str,
        request_secure: bool,
    ) -> Result<HeaderValue, InvalidHeaderValue> {
        let expires = Utc::now() + self.ttl;
        HeaderValue::from_str(&self.render(
            value,
            expires,
            self.ttl.num_seconds(),
            request_secure,
        ))
    }

    /// Expired, empty cookie with the same name, domain and path.
    ///
    /// # Errors
    /// Returns an error if the configured name or domain is not header-safe.
    pub fn deletion(&self, request_secure: bool) -> Result<HeaderValue, InvalidHeaderValue> {
        HeaderValue::from_str(&self.render("", DateTime::UNIX_EPOCH, 0, request_secure))
    }

    /// The cookie's value from the request, if present and non-empty.
    #[must_use]
    pub fn read(&self, headers: &HeaderMap) -> Option<String> {
        cookie_value(headers, &self.name)
    }
}

/// First non-empty value of `name` across all `Cookie` headers.
#[must_use]
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    for header in headers.get_all(COOKIE) {
        let Ok(value) = header.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            let mut parts = pair.trim().splitn(2, '=');
            let key = parts.next().unwrap_or_default().trim();
            let val = parts.next().unwrap_or_default().trim();
            if key == name && !val.is_empty() {
                return Some(val.to_string());
            }
        }
    }
    None
}

/// Hosts that logout may redirect to.
pub trait RedirectAllowlist: Send + Sync {
    /// `host` is `name` or `name:port` as found in the `return_to` URL.
    fn contains(&self, host: &str) -> bool;
}

/// Entries are lowercase `host` or `host:port`. A bare host entry matches any
/// port; a `host:port` entry only that port.
#[derive(Clone, Debug, Default)]
pub struct StaticAllowlist {
    hosts: HashSet<String>,
}

impl StaticAllowlist {
    #[must_use]
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            hosts: hosts
                .into_iter()
                .map(|host| host.as_ref().trim().to_ascii_lowercase())
                .filter(|host| !host.is_empty())
                .collect(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

impl RedirectAllowlist for StaticAllowlist {
    fn contains(&self, host: &str) -> bool {
        let host = host.trim().to_ascii_lowercase();
        if host.is_empty() {
            return false;
        }
        self.hosts.contains(&host) || self.hosts.contains(strip_port(&host))
    }
}
