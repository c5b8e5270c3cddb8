//! Token, authorize, revoke and logout-all endpoints driven through the real
//! router with in-memory stores.

mod common;

use anyhow::{Context, Result};
use axum::{
    body::Body,
    http::{
        Request, StatusCode,
        header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE, COOKIE, WWW_AUTHENTICATE},
    },
};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{Duration, Utc};
use common::{
    REDIRECT_URI, SERVICE_CLIENT, SERVICE_SECRET, TestApp, USER_ID, VERIFIER, WEB_CLIENT, json,
    location,
};
use std::sync::Arc;
use tessera::{
    oauth::{TokenConfig, TokenSigner, TokenUse, pkce, scope::ScopeSet},
    store::{
        BoxFuture, RefreshTokenRepository, RotateOutcome,
        models::{RefreshGrant, RefreshToken},
    },
};
use url::form_urlencoded;
use uuid::Uuid;

fn basic(client_id: &str, secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{client_id}:{secret}")))
}

async fn refresh(app: &TestApp, token: &str) -> Result<axum::response::Response> {
    app.post_form(
        "/v1/oauth/token",
        &[
            ("grant_type", "refresh_token"),
            ("refresh_token", token),
            ("client_id", WEB_CLIENT),
        ],
    )
    .await
}

#[tokio::test]
async fn authorization_code_happy_path() -> Result<()> {
    let app = TestApp::new().await?;
    let sid = app.login().await?;
    let code = app.authorize(&sid, "openid profile", "N1").await?;

    let response = app
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
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(CACHE_CONTROL)
            .and_then(|v| v.to_str().ok()),
        Some("no-store")
    );

    let body = json(response).await?;
    assert_eq!(body["token_type"], "Bearer");
    assert_eq!(body["expires_in"], 600);
    assert_eq!(body["scope"], "openid profile");
    assert!(body["refresh_token"].as_str().is_some_and(|t| !t.is_empty()));

    let access = body["access_token"].as_str().context("access_token")?;
    let claims = app.signer.verify(access, None, Some(WEB_CLIENT))?;
    assert_eq!(claims.sub(), USER_ID);
    assert_eq!(claims.aud(), WEB_CLIENT);
    assert_eq!(claims.tid(), common::TENANT_ID);
    assert_eq!(claims.token_use(), TokenUse::Access);
    assert!(claims.iss().starts_with(common::ISSUER));
    assert_eq!(claims.amr(), ["pwd".to_string()]);

    let id_token = body["id_token"].as_str().context("id_token")?;
    let id_claims = app.signer.verify(id_token, None, Some(WEB_CLIENT))?;
    assert_eq!(id_claims.token_use(), TokenUse::Id);
    assert_eq!(id_claims.nonce(), Some("N1"));

    let rows = app.refresh_rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].subject_id, USER_ID);
    Ok(())
}

#[tokio::test]
async fn pkce_mismatch_burns_the_code() -> Result<()> {
    let app = TestApp::new().await?;
    let sid = app.login().await?;
    let code = app.authorize(&sid, "openid", "N1").await?;
    let wrong = "A".repeat(43);

    for verifier in [wrong.as_str(), VERIFIER] {
        let response = app
            .post_form(
                "/v1/oauth/token",
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code.as_str()),
                    ("redirect_uri", REDIRECT_URI),
                    ("client_id", WEB_CLIENT),
                    ("code_verifier", verifier),
                ],
            )
            .await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json(response).await?;
        assert_eq!(body["error"], "invalid_grant");
        assert_eq!(body["code"], 1002);
    }
    assert!(app.refresh_rows().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn malformed_verifier_keeps_the_code() -> Result<()> {
    let app = TestApp::new().await?;
    let sid = app.login().await?;
    let code = app.authorize(&sid, "openid", "N1").await?;

    let response = app
        .post_form(
            "/v1/oauth/token",
            &[
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("redirect_uri", REDIRECT_URI),
                ("client_id", WEB_CLIENT),
                ("code_verifier", "not valid!"),
            ],
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await?["error"], "invalid_request");

    let response = app
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
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn refresh_rotation_and_reuse_detection() -> Result<()> {
    let app = TestApp::new().await?;
    let tokens = app.code_flow("openid profile").await?;
    let first = tokens["refresh_token"].as_str().context("refresh_token")?;

    let response = refresh(&app, first).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let rotated = json(response).await?;
    let second = rotated["refresh_token"].as_str().context("refresh_token")?;
    assert_ne!(first, second);
    assert_eq!(rotated["scope"], "openid profile");

    // Presenting the rotated token again revokes the whole family.
    let response = refresh(&app, first).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await?["error"], "invalid_grant");

    let response = refresh(&app, second).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let rows = app.refresh_rows().await;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.revoked_at.is_some()));
    assert!(rows.iter().any(|row| row.parent_id.is_some()));
    Ok(())
}

#[tokio::test]
async fn concurrent_refresh_has_one_winner() -> Result<()> {
    let app = TestApp::new().await?;
    let tokens = app.code_flow("openid").await?;
    let raw = tokens["refresh_token"].as_str().context("refresh_token")?;

    let (left, right) = tokio::join!(refresh(&app, raw), refresh(&app, raw));
    let statuses = [left?.status(), right?.status()];
    assert_eq!(
        statuses.iter().filter(|s| **s == StatusCode::OK).count(),
        1,
        "statuses: {statuses:?}"
    );
    assert_eq!(
        statuses
            .iter()
            .filter(|s| **s == StatusCode::BAD_REQUEST)
            .count(),
        1
    );
    Ok(())
}

#[tokio::test]
async fn refresh_cannot_widen_scope() -> Result<()> {
    let app = TestApp::new().await?;
    let tokens = app.code_flow("openid").await?;
    let raw = tokens["refresh_token"].as_str().context("refresh_token")?;

    let response = app
        .post_form(
            "/v1/oauth/token",
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", raw),
                ("client_id", WEB_CLIENT),
                ("scope", "openid email"),
            ],
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await?["error"], "invalid_scope");
    Ok(())
}

#[tokio::test]
async fn client_credentials_grant() -> Result<()> {
    let app = TestApp::new().await?;

    let response = app
        .send(
            Request::post("/v1/oauth/token")
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .header(AUTHORIZATION, basic(SERVICE_CLIENT, SERVICE_SECRET))
                .body(Body::from("grant_type=client_credentials&scope=reports%3Aread"))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json(response).await?;
    assert_eq!(body["scope"], "reports:read");
    assert!(body.get("refresh_token").is_none());
    let claims = app
        .signer
        .verify(body["access_token"].as_str().context("access_token")?, None, None)?;
    assert_eq!(claims.sub(), SERVICE_CLIENT);

    let response = app
        .send(
            Request::post("/v1/oauth/token")
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .header(AUTHORIZATION, basic(SERVICE_CLIENT, "wrong"))
                .body(Body::from("grant_type=client_credentials"))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key(WWW_AUTHENTICATE));
    assert_eq!(json(response).await?["error"], "invalid_client");

    let response = app
        .post_form(
            "/v1/oauth/token",
            &[("grant_type", "client_credentials"), ("client_id", WEB_CLIENT)],
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn token_endpoint_rejects_bad_requests() -> Result<()> {
    let app = TestApp::new().await?;

    let response = app
        .post_form("/v1/oauth/token", &[("grant_type", "password")])
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json(response).await?;
    assert_eq!(body["error"], "unsupported_grant_type");
    assert_eq!(body["code"], 1006);

    let response = app
        .send(
            Request::post("/v1/oauth/token")
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"grant_type":"client_credentials"}"#))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await?["error"], "invalid_request");

    let oversized = format!("grant_type=client_credentials&pad={}", "a".repeat(65 * 1024));
    let response = app
        .send(
            Request::post("/v1/oauth/token")
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(oversized))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await?["error"], "invalid_request");
    Ok(())
}

#[tokio::test]
async fn revoke_is_idempotent() -> Result<()> {
    let app = TestApp::new().await?;
    let tokens = app.code_flow("openid").await?;
    let raw = tokens["refresh_token"].as_str().context("refresh_token")?;

    let response = app.post_form("/v1/oauth/revoke", &[("token", raw)]).await?;
    assert_eq!(response.status(), StatusCode::OK);
    let revoked_at = app.refresh_rows().await[0].revoked_at;
    assert!(revoked_at.is_some());

    let response = app.post_form("/v1/oauth/revoke", &[("token", raw)]).await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(app.refresh_rows().await[0].revoked_at, revoked_at);

    let random = "f".repeat(64);
    let response = app
        .post_form("/v1/oauth/revoke", &[("token", random.as_str())])
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = refresh(&app, raw).await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn revoke_requires_client_auth_when_configured() -> Result<()> {
    let app = TestApp::with_state(|state| state.with_revoke_require_client_auth(true)).await?;

    let response = app
        .post_form("/v1/oauth/revoke", &[("token", "whatever")])
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json(response).await?["error"], "invalid_client");

    let response = app
        .send(
            Request::post("/v1/oauth/revoke")
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .header(AUTHORIZATION, basic(SERVICE_CLIENT, SERVICE_SECRET))
                .body(Body::from("token=whatever"))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn authorize_requires_session_and_registered_redirect() -> Result<()> {
    let app = TestApp::new().await?;
    let challenge = pkce::challenge_s256(VERIFIER);
    let query = |redirect_uri: &str| {
        form_urlencoded::Serializer::new(String::new())
            .append_pair("response_type", "code")
            .append_pair("client_id", WEB_CLIENT)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("code_challenge", &challenge)
            .append_pair("code_challenge_method", "S256")
            .finish()
    };

    let response = app
        .send(
            Request::get(format!("/v1/oauth/authorize?{}", query(REDIRECT_URI)))
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json(response).await?["error"], "access_denied");

    let sid = app.login().await?;
    let response = app
        .send(
            Request::get(format!(
                "/v1/oauth/authorize?{}",
                query("https://evil.example.com/cb")
            ))
            .header(COOKIE, format!("sid={sid}"))
            .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json(response).await?["error"], "invalid_request");

    // Once the redirect URI is trusted, errors travel back to the client.
    let without_pkce = form_urlencoded::Serializer::new(String::new())
        .append_pair("response_type", "code")
        .append_pair("client_id", WEB_CLIENT)
        .append_pair("redirect_uri", REDIRECT_URI)
        .append_pair("state", "s1")
        .finish();
    let response = app
        .send(
            Request::get(format!("/v1/oauth/authorize?{without_pkce}"))
                .header(COOKIE, format!("sid={sid}"))
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::FOUND);
    let location = location(&response)?;
    let pairs: Vec<(String, String)> = location.query_pairs().into_owned().collect();
    assert!(pairs.contains(&("error".to_string(), "invalid_request".to_string())));
    assert!(pairs.contains(&("state".to_string(), "s1".to_string())));
    Ok(())
}

#[tokio::test]
async fn logout_all_revokes_only_the_named_client() -> Result<()> {
    let app = TestApp::new().await?;
    let tokens = app.code_flow("openid").await?;
    let access = tokens["access_token"].as_str().context("access_token")?;

    let (_, other) = RefreshToken::issue(
        RefreshGrant {
            tenant_id: common::TENANT_ID.to_string(),
            client_id: "other".to_string(),
            subject_id: USER_ID.to_string(),
            scope: ScopeSet::default(),
            ttl: Duration::days(1),
            parent_id: None,
        },
        Utc::now(),
    )?;
    app.store.create(&other).await?;

    let response = app
        .send(
            Request::post("/v1/auth/logout-all")
                .header(CONTENT_TYPE, "application/json")
                .header(AUTHORIZATION, format!("Bearer {access}"))
                .body(Body::from(
                    serde_json::json!({"user_id": USER_ID, "client_id": WEB_CLIENT}).to_string(),
                ))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    for row in app.refresh_rows().await {
        if row.client_id == WEB_CLIENT {
            assert!(row.revoked_at.is_some());
        } else {
            assert!(row.revoked_at.is_none());
        }
    }
    Ok(())
}

#[tokio::test]
async fn logout_all_rejects_bad_callers() -> Result<()> {
    let app = TestApp::new().await?;
    let tokens = app.code_flow("openid").await?;
    let access = tokens["access_token"].as_str().context("access_token")?;

    let response = app
        .send(
            Request::post("/v1/auth/logout-all")
                .header(CONTENT_TYPE, "application/json")
                .header(AUTHORIZATION, format!("Bearer {access}"))
                .body(Body::from(r#"{"client_id":"web"}"#))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .send(
            Request::post("/v1/auth/logout-all")
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"user_id":"u1"}"#))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // A plain user may not log somebody else out.
    let response = app
        .send(
            Request::post("/v1/auth/logout-all")
                .header(CONTENT_TYPE, "application/json")
                .header(AUTHORIZATION, format!("Bearer {access}"))
                .body(Body::from(
                    serde_json::json!({"user_id": common::ADMIN_ID}).to_string(),
                ))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json(response).await?["error"], "access_denied");

    let refresh_token = tokens["refresh_token"].as_str().context("refresh_token")?;
    let response = app
        .send(
            Request::post("/v1/auth/logout-all")
                .header(CONTENT_TYPE, "application/json")
                .header(AUTHORIZATION, format!("Bearer {refresh_token}"))
                .body(Body::from(r#"{"user_id":"u1"}"#))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

/// Refresh repository whose writes stall before reaching the store.
struct StalledWrites {
    inner: Arc<dyn RefreshTokenRepository>,
    delay: std::time::Duration,
}

impl RefreshTokenRepository for StalledWrites {
    fn create<'a>(&'a self, token: &'a RefreshToken) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            self.inner.create(token).await
        })
    }

    fn get_by_hash<'a>(
        &'a self,
        hash: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<Option<RefreshToken>>> {
        self.inner.get_by_hash(hash)
    }

    fn revoke_by_id<'a>(&'a self, id: Uuid) -> BoxFuture<'a, anyhow::Result<()>> {
        self.inner.revoke_by_id(id)
    }

    fn rotate<'a>(
        &'a self,
        old_hash: &'a str,
        new_token: &'a RefreshToken,
    ) -> BoxFuture<'a, anyhow::Result<RotateOutcome>> {
        self.inner.rotate(old_hash, new_token)
    }

    fn has_children<'a>(&'a self, id: Uuid) -> BoxFuture<'a, anyhow::Result<bool>> {
        self.inner.has_children(id)
    }
}

#[tokio::test]
async fn token_deadline_is_internal_without_refresh_rows() -> Result<()> {
    let app = TestApp::build(
        |mut handle| {
            handle.refresh_tokens = Arc::new(StalledWrites {
                inner: handle.refresh_tokens.clone(),
                delay: std::time::Duration::from_secs(2),
            });
            handle
        },
        TokenConfig::new().with_deadline(std::time::Duration::from_millis(50)),
        |state| state,
    )
    .await?;

    let sid = app.login().await?;
    let code = app.authorize(&sid, "openid", "N1").await?;
    let response = app
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
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json(response).await?["error"], "internal");

    // The stalled write was dropped with the request.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(app.refresh_rows().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn token_deadline_covers_a_slow_body() -> Result<()> {
    let app = TestApp::build(
        |handle| handle,
        TokenConfig::new().with_deadline(std::time::Duration::from_millis(50)),
        |state| state,
    )
    .await?;

    let chunks = futures_util::stream::unfold(0u8, |sent| async move {
        if sent == 2 {
            return None;
        }
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let chunk = if sent == 0 {
            "grant_type=client_credentials"
        } else {
            "&scope=x"
        };
        Some((Ok::<_, std::io::Error>(chunk.to_string()), sent + 1))
    });
    let response = app
        .send(
            Request::post("/v1/oauth/token")
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from_stream(chunks))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json(response).await?["error"], "internal");
    Ok(())
}
