//! Shared state handed to every handler through an `Extension<Arc<AppState>>`.

use chrono::Duration;
use std::sync::Arc;

use super::cookies::{CookiePolicy, RedirectAllowlist, SameSite, StaticAllowlist};
use crate::issuer::IssuerResolver;
use crate::oauth::TokenService;
use crate::session::SessionManager;
use crate::tenancy::StoreSelector;

pub const DEFAULT_CSRF_COOKIE_NAME: &str = "csrf_token";
pub const DEFAULT_CSRF_TTL_SECS: i64 = 30 * 60;
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Double-submit CSRF settings.
#[derive(Clone, Debug)]
pub struct CsrfConfig {
    cookie: CookiePolicy,
    enforced: bool,
}

impl Default for CsrfConfig {
    fn default() -> Self {
        Self::new(DEFAULT_CSRF_COOKIE_NAME, Duration::seconds(DEFAULT_CSRF_TTL_SECS))
    }
}

impl CsrfConfig {
    /// The cookie stays readable by scripts so they can echo it in `X-CSRF-Token`.
    #[must_use]
    pub fn new(cookie_name: &str, ttl: Duration) -> Self {
        Self {
            cookie: CookiePolicy::new(cookie_name, ttl)
                .with_same_site(SameSite::Lax)
                .with_http_only(false),
            enforced: true,
        }
    }

    #[must_use]
    pub fn with_enforced(mut self, enforced: bool) -> Self {
        self.enforced = enforced;
        self
    }

    #[must_use]
    pub fn cookie(&self) -> &CookiePolicy {
        &self.cookie
    }

    #[must_use]
    pub fn enforced(&self) -> bool {
        self.enforced
    }
}

pub struct AppState {
    tokens: TokenService,
    sessions: SessionManager,
    session_cookie: CookiePolicy,
    csrf: CsrfConfig,
    allowlist: Arc<dyn RedirectAllowlist>,
    revoke_require_client_auth: bool,
}

impl AppState {
    /// The session cookie TTL follows the session manager.
    #[must_use]
    pub fn new(tokens: TokenService, sessions: SessionManager) -> Self {
        let session_cookie = CookiePolicy::new("sid", sessions.ttl());
        Self {
            tokens,
            sessions,
            session_cookie,
            csrf: CsrfConfig::default(),
            allowlist: Arc::new(StaticAllowlist::default()),
            revoke_require_client_auth: false,
        }
    }

    #[must_use]
    pub fn with_session_cookie(mut self, policy: CookiePolicy) -> Self {
        self.session_cookie = policy;
        self
    }

    #[must_use]
    pub fn with_csrf(mut self, csrf: CsrfConfig) -> Self {
        self.csrf = csrf;
        self
    }

    #[must_use]
    pub fn with_allowlist(mut self, allowlist: Arc<dyn RedirectAllowlist>) -> Self {
        self.allowlist = allowlist;
        self
    }

    #[must_use]
    pub fn with_revoke_require_client_auth(mut self, required: bool) -> Self {
        self.revoke_require_client_auth = required;
        self
    }

    #[must_use]
    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    #[must_use]
    pub fn selector(&self) -> &StoreSelector {
        self.tokens.selector()
    }

    #[must_use]
    pub fn issuer(&self) -> &IssuerResolver {
        self.tokens.issuer()
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    #[must_use]
    pub fn session_cookie(&self) -> &CookiePolicy {
        &self.session_cookie
    }

    #[must_use]
    pub fn csrf(&self) -> &CsrfConfig {
        &self.csrf
    }

    #[must_use]
    pub fn allowlist(&self) -> &dyn RedirectAllowlist {
        self.allowlist.as_ref()
    }

    #[must_use]
    pub fn revoke_require_client_auth(&self) -> bool {
        self.revoke_require_client_auth
    }
}
