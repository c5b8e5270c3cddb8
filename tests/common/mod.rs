//! Shared fixture: the real router over in-memory stores with one tenant,
//! a public browser client, a confidential service client and one user.

#![allow(dead_code)]

use anyhow::{Context, Result, anyhow};
use axum::{
    Router,
    body::{Body, to_bytes},
    http::{
        HeaderMap, Request, StatusCode,
        header::{CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE},
    },
    response::Response,
};
use chrono::{Duration, Utc};
use serde_json::Value;
use std::sync::Arc;
use tessera::{
    api::{self, AppState, cookies::StaticAllowlist},
    hash::hash_token,
    issuer::{IssuerMode, IssuerResolver},
    oauth::{JwtSigner, MemoryCodeStore, TokenConfig, TokenService, TokenSigner, pkce},
    session::{SessionManager, cache::MemorySessionCache, password::hash_password},
    store::{
        ClientRepository, RbacRepository, StoreHandle, UserRepository,
        memory::MemoryStore,
        models::{Client, ClientType, GrantType, RefreshToken, User},
    },
    tenancy::StoreSelector,
};
use tower::ServiceExt;
use url::{Url, form_urlencoded};

pub const ISSUER: &str = "https://auth.example.com";
pub const TENANT_ID: &str = "tenant-a";
pub const WEB_CLIENT: &str = "web";
pub const SERVICE_CLIENT: &str = "svc";
pub const SERVICE_SECRET: &str = "svc-secret";
pub const REDIRECT_URI: &str = "https://app.example.com/cb";
pub const USER_ID: &str = "u1";
pub const ADMIN_ID: &str = "admin1";
pub const EMAIL: &str = "ada@example.com";
pub const PASSWORD: &str = "correct horse battery staple";
pub const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

pub struct TestApp {
    pub router: Router,
    pub store: Arc<MemoryStore>,
    pub signer: Arc<dyn TokenSigner>,
}

fn client(
    client_id: &str,
    client_type: ClientType,
    scopes: &[&str],
    grant_types: Vec<GrantType>,
    secret: Option<&str>,
) -> Client {
    Client {
        id: format!("id-{client_id}"),
        client_id: client_id.to_string(),
        tenant_id: TENANT_ID.to_string(),
        name: client_id.to_string(),
        client_type,
        providers: vec!["password".to_string()],
        redirect_uris: vec![REDIRECT_URI.to_string()],
        post_logout_redirect_uris: Vec::new(),
        scopes_allowed: scopes.iter().map(ToString::to_string).collect(),
        grant_types,
        secret_hash: secret.map(hash_token),
        require_email_verification: None,
        reset_password_url: None,
        verify_email_url: None,
    }
}

fn user(id: &str, email: &str, password_hash: Option<String>) -> User {
    User {
        id: id.to_string(),
        tenant_id: TENANT_ID.to_string(),
        email: email.to_string(),
        email_verified: true,
        metadata: serde_json::Map::new(),
        password_hash,
        created_at: Utc::now(),
    }
}

impl TestApp {
    pub async fn new() -> Result<Self> {
        Self::with_state(|state| state).await
    }

    /// Build the fixture, letting the caller adjust the `AppState`.
    pub async fn with_state(configure: impl FnOnce(AppState) -> AppState) -> Result<Self> {
        Self::build(|handle| handle, TokenConfig::new(), configure).await
    }

    /// Like [`TestApp::with_state`], but the caller may also swap repositories
    /// on the global store handle and pick the token settings.
    pub async fn build(
        wrap: impl FnOnce(StoreHandle) -> StoreHandle,
        config: TokenConfig,
        configure: impl FnOnce(AppState) -> AppState,
    ) -> Result<Self> {
        let store = Arc::new(MemoryStore::new());

        ClientRepository::create(
            store.as_ref(),
            &client(
                WEB_CLIENT,
                ClientType::Public,
                &["openid", "profile", "email"],
                vec![GrantType::AuthorizationCode, GrantType::RefreshToken],
                None,
            ),
        )
        .await?;
        ClientRepository::create(
            store.as_ref(),
            &client(
                SERVICE_CLIENT,
                ClientType::Confidential,
                &["reports:read", "reports:write"],
                vec![GrantType::ClientCredentials],
                Some(SERVICE_SECRET),
            ),
        )
        .await?;

        let password_hash = hash_password(PASSWORD)?;
        UserRepository::create(store.as_ref(), &user(USER_ID, EMAIL, Some(password_hash)))
            .await?;
        UserRepository::create(store.as_ref(), &user(ADMIN_ID, "root@example.com", None)).await?;
        store.add_user_role(ADMIN_ID, "admin").await?;

        let signer: Arc<dyn TokenSigner> = Arc::new(JwtSigner::generate(Some("test"))?);
        let tokens = TokenService::new(
            StoreSelector::new(wrap(StoreHandle::from_memory(store.clone()))),
            IssuerResolver::new(IssuerMode::Global, ISSUER)?,
            signer.clone(),
            Arc::new(MemoryCodeStore::new()),
            config,
        );
        let sessions =
            SessionManager::new(Arc::new(MemorySessionCache::new()), Duration::hours(12));
        let state = AppState::new(tokens, sessions)
            .with_allowlist(Arc::new(StaticAllowlist::new(["app.example.com"])));

        Ok(Self {
            router: api::app(Arc::new(configure(state))),
            store,
            signer,
        })
    }

    pub async fn send(&self, request: Request<Body>) -> Result<Response> {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .map_err(|err| anyhow!("router failed: {err}"))?;
        Ok(response)
    }

    pub async fn post_form(&self, path: &str, pairs: &[(&str, &str)]) -> Result<Response> {
        let body = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        self.send(
            Request::post(path)
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(body))?,
        )
        .await
    }

    /// `GET /v1/csrf`, returning the token (also the cookie value).
    pub async fn csrf(&self) -> Result<String> {
        let response = self.send(Request::get("/v1/csrf").body(Body::empty())?).await?;
        anyhow::ensure!(response.status() == StatusCode::OK, "csrf failed");
        let body = json(response).await?;
        body["csrf_token"]
            .as_str()
            .map(str::to_string)
            .context("csrf_token missing")
    }

    /// Password login through the CSRF-protected cookie route; returns the raw sid.
    pub async fn login(&self) -> Result<String> {
        let csrf = self.csrf().await?;
        let body = serde_json::json!({
            "email": EMAIL,
            "password": PASSWORD,
            "client_id": WEB_CLIENT,
        });
        let response = self
            .send(
                Request::post("/v1/session/login")
                    .header(CONTENT_TYPE, "application/json")
                    .header(COOKIE, format!("csrf_token={csrf}"))
                    .header("x-csrf-token", csrf.as_str())
                    .body(Body::from(body.to_string()))?,
            )
            .await?;
        anyhow::ensure!(
            response.status() == StatusCode::OK,
            "login failed: {}",
            response.status()
        );
        set_cookie_value(response.headers(), "sid").context("sid cookie missing")
    }

    /// Drive `/authorize` with a live session and return the issued code.
    pub async fn authorize(&self, sid: &str, scope: &str, nonce: &str) -> Result<String> {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("response_type", "code")
            .append_pair("client_id", WEB_CLIENT)
            .append_pair("redirect_uri", REDIRECT_URI)
            .append_pair("code_challenge", &pkce::challenge_s256(VERIFIER))
            .append_pair("code_challenge_method", "S256")
            .append_pair("scope", scope)
            .append_pair("state", "xyz")
            .append_pair("nonce", nonce)
            .finish();
        let response = self
            .send(
                Request::get(format!("/v1/oauth/authorize?{query}"))
                    .header(COOKIE, format!("sid={sid}"))
                    .body(Body::empty())?,
            )
            .await?;
        anyhow::ensure!(
            response.status() == StatusCode::FOUND,
            "authorize failed: {}",
            response.status()
        );
        let location = location(&response)?;
        location
            .query_pairs()
            .find(|(key, _)| key == "code")
            .map(|(_, value)| value.into_owned())
            .context("code missing from redirect")
    }

    /// Login, authorize and exchange the code; returns the token response JSON.
    pub async fn code_flow(&self, scope: &str) -> Result<Value> {
        let sid = self.login().await?;
        let code = self.authorize(&sid, scope, "N1").await?;
        let response = self
            .post_form(
                "/v1/oauth/token",
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code.as_str()),
                    ("redirect_uri", REDIRECT_URI),
                    ("client_id", WEB_CLIENT),
                    ("code_verifier", VERIFIER),
                ],
            )
            .await?;
        anyhow::ensure!(
            response.status() == StatusCode::OK,
            "code exchange failed: {}",
            response.status()
        );
        json(response).await
    }

    pub async fn refresh_rows(&self) -> Vec<RefreshToken> {
        self.store.refresh_tokens().await
    }
}

pub async fn json(response: Response) -> Result<Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub fn location(response: &Response) -> Result<Url> {
    let value = response
        .headers()
        .get(LOCATION)
        .context("Location header missing")?
        .to_str()?;
    Ok(Url::parse(value)?)
}

/// Value of the named cookie in the `Set-Cookie` headers.
pub fn set_cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get_all(SET_COOKIE).iter().find_map(|value| {
        let value = value.to_str().ok()?;
        let (pair, _) = value.split_once(';').unwrap_or((value, ""));
        let (key, value) = pair.split_once('=')?;
        (key.trim() == name).then(|| value.trim().to_string())
    })
}

/// The whole `Set-Cookie` header for the named cookie.
pub fn set_cookie_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get_all(SET_COOKIE).iter().find_map(|value| {
        let value = value.to_str().ok()?;
        value
            .starts_with(&format!("{name}="))
            .then(|| value.to_string())
    })
}
