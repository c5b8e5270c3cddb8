//! Postgres backends against a live database.
//!
//! Skipped unless `TESSERA_TEST_DSN` points at a scratch database; every run
//! uses fresh ids so the schema can be reused between runs.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::sync::Arc;
use tessera::{
    hash::hash_token,
    oauth::{
        AuthorizationCode, AuthorizationCodeStore, PgCodeStore, codes::CodeGrant,
        scope::ScopeSet,
    },
    session::{PgSessionCache, SessionCache},
    store::{
        BulkRevokeOutcome, ClientRepository, RbacRepository, RefreshTokenRepository,
        RotateOutcome, StoreHandle, UserRepository,
        models::{Client, ClientType, GrantType, RefreshGrant, RefreshToken, User},
        postgres::{PgStore, apply_schema},
    },
};
use ulid::Ulid;

const FIVE_MINUTES: std::time::Duration = std::time::Duration::from_secs(300);

async fn pool() -> Result<Option<PgPool>> {
    let Ok(dsn) = std::env::var("TESSERA_TEST_DSN") else {
        eprintln!("TESSERA_TEST_DSN not set, skipping");
        return Ok(None);
    };
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&dsn)
        .await
        .context("connect to TESSERA_TEST_DSN")?;
    apply_schema(&pool).await?;
    // A second run must be a no-op.
    apply_schema(&pool).await?;
    Ok(Some(pool))
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Ulid::new().to_string().to_lowercase())
}

fn refresh_grant(tenant_id: &str, subject_id: &str, client_id: &str) -> RefreshGrant {
    RefreshGrant {
        tenant_id: tenant_id.to_string(),
        client_id: client_id.to_string(),
        subject_id: subject_id.to_string(),
        scope: ScopeSet::from_tokens(["openid", "profile"]),
        ttl: Duration::days(1),
        parent_id: None,
    }
}

#[tokio::test]
async fn clients_and_users() -> Result<()> {
    let Some(pool) = pool().await? else {
        return Ok(());
    };
    let store = PgStore::new(pool);
    let tenant_id = unique("tenant");

    let mut client = Client {
        id: unique("id"),
        client_id: unique("client"),
        tenant_id: tenant_id.clone(),
        name: "Reports".to_string(),
        client_type: ClientType::Confidential,
        providers: vec!["password".to_string()],
        redirect_uris: vec!["https://app.example.com/cb".to_string()],
        post_logout_redirect_uris: Vec::new(),
        scopes_allowed: vec!["reports:read".to_string()],
        grant_types: vec![GrantType::ClientCredentials],
        secret_hash: Some(hash_token("s3cret")),
        require_email_verification: Some(true),
        reset_password_url: None,
        verify_email_url: None,
    };
    ClientRepository::create(&store, &client).await?;
    assert!(ClientRepository::create(&store, &client).await.is_err());

    let loaded = store.get_by_client_id(&client.client_id).await?;
    assert_eq!(loaded.as_ref(), Some(&client));
    assert_eq!(store.list(&tenant_id).await?.len(), 1);

    client.name = "Reports v2".to_string();
    assert!(store.update(&client).await?);
    let loaded = ClientRepository::get_by_id(&store, &client.id).await?;
    assert_eq!(loaded.map(|c| c.name), Some("Reports v2".to_string()));
    assert!(store.delete(&client.id).await?);
    assert!(!store.delete(&client.id).await?);

    let user = User {
        id: unique("user"),
        tenant_id: tenant_id.clone(),
        email: "Grace@Example.com".to_string(),
        email_verified: true,
        metadata: serde_json::Map::from_iter([(
            "name".to_string(),
            serde_json::Value::from("Grace Hopper"),
        )]),
        password_hash: Some("$argon2id$stub".to_string()),
        created_at: Utc::now(),
    };
    UserRepository::create(&store, &user).await?;
    let found = store
        .get_by_email(&tenant_id, "grace@example.com")
        .await?
        .context("case-insensitive email lookup")?;
    assert_eq!(found.id, user.id);
    assert_eq!(found.metadata["name"], "Grace Hopper");
    assert_eq!(found.password_hash, user.password_hash);
    assert!(
        store
            .get_by_email(&unique("other"), "grace@example.com")
            .await?
            .is_none()
    );
    Ok(())
}

#[tokio::test]
async fn rbac_roles_and_permissions() -> Result<()> {
    let Some(pool) = pool().await? else {
        return Ok(());
    };
    let store = PgStore::new(pool);
    let user_id = unique("user");
    let role = unique("role");

    store.add_user_role(&user_id, &role).await?;
    store.add_user_role(&user_id, &role).await?;
    store.add_role_permission(&role, "reports:read").await?;
    store.add_user_permission(&user_id, "reports:write").await?;

    assert_eq!(store.get_user_roles(&user_id).await?, vec![role.clone()]);
    assert_eq!(store.get_role_perms(&role).await?, vec!["reports:read"]);
    let mut perms = store.get_user_permissions(&user_id).await?;
    perms.sort();
    assert!(perms.contains(&"reports:write".to_string()));

    store.remove_user_role(&user_id, &role).await?;
    store.remove_role_permission(&role, "reports:read").await?;
    store.remove_user_permission(&user_id, "reports:write").await?;
    assert!(store.get_user_roles(&user_id).await?.is_empty());
    assert!(store.get_role_perms(&role).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn refresh_rotation_is_single_winner() -> Result<()> {
    let Some(pool) = pool().await? else {
        return Ok(());
    };
    let handle = StoreHandle::postgres(pool);
    let tokens = handle.refresh_tokens.clone();
    let tenant_id = unique("tenant");
    let subject_id = unique("user");
    let now = Utc::now();

    let (raw, root) = RefreshToken::issue(refresh_grant(&tenant_id, &subject_id, "web"), now)?;
    tokens.create(&root).await?;
    let loaded = tokens
        .get_by_hash(&hash_token(&raw))
        .await?
        .context("stored token")?;
    assert_eq!(loaded.scope, root.scope);
    assert!(loaded.is_active(Utc::now()));

    let mut child_grant = refresh_grant(&tenant_id, &subject_id, "web");
    child_grant.parent_id = Some(root.id);
    let (_, first) = RefreshToken::issue(child_grant.clone(), now)?;
    let (_, second) = RefreshToken::issue(child_grant, now)?;

    let (a, b) = tokio::join!(
        tokens.rotate(&root.hash, &first),
        tokens.rotate(&root.hash, &second)
    );
    let outcomes = [a?, b?];
    let winners = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, RotateOutcome::Rotated(_)))
        .count();
    assert_eq!(winners, 1, "{outcomes:?}");
    assert!(outcomes.contains(&RotateOutcome::Conflict));
    assert!(tokens.has_children(root.id).await?);

    let revoked = tokens
        .get_by_hash(&root.hash)
        .await?
        .context("root still readable")?;
    let revoked_at = revoked.revoked_at.context("root revoked")?;

    // Revoking again keeps the first timestamp.
    tokens.revoke_by_id(root.id).await?;
    let again = tokens.get_by_hash(&root.hash).await?.context("root")?;
    assert_eq!(again.revoked_at, Some(revoked_at));
    Ok(())
}

#[tokio::test]
async fn revoke_all_for_subject_scopes_by_client() -> Result<()> {
    let Some(pool) = pool().await? else {
        return Ok(());
    };
    let store = Arc::new(PgStore::new(pool));
    let tenant_id = unique("tenant");
    let subject_id = unique("user");
    let now = Utc::now();

    for client_id in ["web", "web", "cli"] {
        let (_, row) = RefreshToken::issue(refresh_grant(&tenant_id, &subject_id, client_id), now)?;
        RefreshTokenRepository::create(store.as_ref(), &row).await?;
    }

    assert_eq!(
        store.revoke_all_for_subject(&subject_id, Some("web")).await?,
        BulkRevokeOutcome::Revoked(2)
    );
    assert_eq!(
        store.revoke_all_for_subject(&subject_id, None).await?,
        BulkRevokeOutcome::Revoked(1)
    );
    assert_eq!(
        store.revoke_all_for_subject(&subject_id, None).await?,
        BulkRevokeOutcome::Revoked(0)
    );
    Ok(())
}

#[tokio::test]
async fn authorization_codes_are_consumed_once() -> Result<()> {
    let Some(pool) = pool().await? else {
        return Ok(());
    };
    let codes = PgCodeStore::new(pool);
    let grant = CodeGrant {
        client_id: "web".to_string(),
        tenant_id: unique("tenant"),
        subject_id: unique("user"),
        redirect_uri: "https://app.example.com/cb".to_string(),
        scope: ScopeSet::from_tokens(["openid"]),
        code_challenge: "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM".to_string(),
        nonce: Some("n-0S6_WzA2Mj".to_string()),
        amr: vec!["pwd".to_string()],
        acr: None,
    };

    let (raw, code) = AuthorizationCode::issue(grant.clone(), Duration::seconds(60), Utc::now())?;
    codes.put(&code).await?;
    let hash = hash_token(&raw);
    let (first, second) = tokio::join!(codes.consume(&hash), codes.consume(&hash));
    let (first, second) = (first?, second?);
    assert!(first.is_some() != second.is_some());
    let consumed = first.or(second).context("one consumer wins")?;
    assert_eq!(consumed.nonce, grant.nonce);
    assert_eq!(consumed.amr, grant.amr);

    // Expired codes are never handed out.
    let (raw, mut expired) = AuthorizationCode::issue(grant, Duration::seconds(60), Utc::now())?;
    expired.expires_at = Utc::now() - Duration::seconds(1);
    codes.put(&expired).await?;
    assert!(codes.consume(&hash_token(&raw)).await?.is_none());
    assert!(codes.consume("unknown").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn session_cache_honors_ttl() -> Result<()> {
    let Some(pool) = pool().await? else {
        return Ok(());
    };
    let cache = PgSessionCache::new(pool);
    let key = unique("session");

    cache.set(&key, "{\"v\":1}", FIVE_MINUTES).await?;
    assert_eq!(cache.get(&key).await?.as_deref(), Some("{\"v\":1}"));
    cache.set(&key, "{\"v\":2}", FIVE_MINUTES).await?;
    assert_eq!(cache.get(&key).await?.as_deref(), Some("{\"v\":2}"));
    cache.delete(&key).await?;
    assert!(cache.get(&key).await?.is_none());
    cache.delete(&key).await?;

    let stale = unique("session");
    cache.set(&stale, "gone", std::time::Duration::ZERO).await?;
    assert!(cache.get(&stale).await?.is_none());
    Ok(())
}
