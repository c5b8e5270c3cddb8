//! Short-lived, single-use authorization codes.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::Instrument;

use super::scope::ScopeSet;
use crate::hash::{generate_token, hash_token};
use crate::store::{BoxFuture, postgres::query_span};

/// Codes never outlive this, whatever the configuration says.
pub const MAX_CODE_TTL_SECS: i64 = 60;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthorizationCode {
    pub code_hash: String,
    pub client_id: String,
    pub tenant_id: String,
    pub subject_id: String,
    pub redirect_uri: String,
    pub scope: ScopeSet,
    pub code_challenge: String,
    pub nonce: Option<String>,
    pub amr: Vec<String>,
    pub acr: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

/// What the authorization endpoint binds to a new code.
#[derive(Clone, Debug)]
pub struct CodeGrant {
    pub client_id: String,
    pub tenant_id: String,
    pub subject_id: String,
    pub redirect_uri: String,
    pub scope: ScopeSet,
    pub code_challenge: String,
    pub nonce: Option<String>,
    pub amr: Vec<String>,
    pub acr: Option<String>,
}

impl AuthorizationCode {
    /// Returns the raw code (handed to the client once) and the record to store.
    ///
    /// # Errors
    /// Returns an error if the entropy source fails.
    pub fn issue(grant: CodeGrant, ttl: Duration, now: DateTime<Utc>) -> Result<(String, Self)> {
        let raw = generate_token()?;
        let ttl = ttl.clamp(Duration::seconds(1), Duration::seconds(MAX_CODE_TTL_SECS));
        let code = Self {
            code_hash: hash_token(&raw),
            client_id: grant.client_id,
            tenant_id: grant.tenant_id,
            subject_id: grant.subject_id,
            redirect_uri: grant.redirect_uri,
            scope: grant.scope,
            code_challenge: grant.code_challenge,
            nonce: grant.nonce,
            amr: grant.amr,
            acr: grant.acr,
            issued_at: now,
            expires_at: now + ttl,
            consumed: false,
        };
        Ok((raw, code))
    }
}

pub trait AuthorizationCodeStore: Send + Sync {
    fn put<'a>(&'a self, code: &'a AuthorizationCode) -> BoxFuture<'a, Result<()>>;

    /// Mark the code consumed and return it. Across concurrent callers at most
    /// one gets `Some`; expired, consumed and unknown codes are `None`.
    fn consume<'a>(&'a self, code_hash: &'a str)
    -> BoxFuture<'a, Result<Option<AuthorizationCode>>>;
}

#[derive(Default)]
pub struct MemoryCodeStore {
    codes: Mutex<HashMap<String, AuthorizationCode>>,
}

impl MemoryCodeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuthorizationCodeStore for MemoryCodeStore {
    fn put<'a>(&'a self, code: &'a AuthorizationCode) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut codes = self.codes.lock().await;
            let now = Utc::now();
            codes.retain(|_, existing| existing.expires_at > now);
            codes.insert(code.code_hash.clone(), code.clone());
            Ok(())
        })
    }

    fn consume<'a>(
        &'a self,
        code_hash: &'a str,
    ) -> BoxFuture<'a, Result<Option<AuthorizationCode>>> {
        Box::pin(async move {
            let mut codes = self.codes.lock().await;
            let now = Utc::now();
            Ok(codes.get_mut(code_hash).and_then(|code| {
                if code.consumed || code.expires_at <= now {
                    return None;
                }
                code.consumed = true;
                Some(code.clone())
            }))
        })
    }
}

#[derive(Clone, Debug)]
pub struct PgCodeStore {
    pool: PgPool,
}

impl PgCodeStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn code_from_row(row: &PgRow) -> Result<AuthorizationCode> {
    let scope: String = row.try_get("scope")?;
    Ok(AuthorizationCode {
        code_hash: row.try_get("code_hash")?,
        client_id: row.try_get("client_id")?,
        tenant_id: row.try_get("tenant_id")?,
        subject_id: row.try_get("subject_id")?,
        redirect_uri: row.try_get("redirect_uri")?,
        scope: ScopeSet::parse(&scope).context("stored code scope is invalid")?,
        code_challenge: row.try_get("code_challenge")?,
        nonce: row.try_get("nonce")?,
        amr: row.try_get("amr")?,
        acr: row.try_get("acr")?,
        issued_at: row.try_get("issued_at")?,
        expires_at: row.try_get("expires_at")?,
        consumed: row.try_get("consumed")?,
    })
}

impl AuthorizationCodeStore for PgCodeStore {
    fn put<'a>(&'a self, code: &'a AuthorizationCode) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let query = r"
                INSERT INTO authorization_codes
                    (code_hash, client_id, tenant_id, subject_id, redirect_uri, scope,
                     code_challenge, nonce, amr, acr, issued_at, expires_at, consumed)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, FALSE)
            ";
            sqlx::query(query)
                .bind(&code.code_hash)
                .bind(&code.client_id)
                .bind(&code.tenant_id)
                .bind(&code.subject_id)
                .bind(&code.redirect_uri)
                .bind(code.scope.to_string())
                .bind(&code.code_challenge)
                .bind(&code.nonce)
                .bind(&code.amr)
                .bind(&code.acr)
                .bind(code.issued_at)
                .bind(code.expires_at)
                .execute(&self.pool)
                .instrument(query_span("INSERT", query))
                .await
                .context("failed to store authorization code")?;
            Ok(())
        })
    }

    fn consume<'a>(
        &'a self,
        code_hash: &'a str,
    ) -> BoxFuture<'a, Result<Option<AuthorizationCode>>> {
        Box::pin(async move {
            // Single statement compare-and-set; the row lock serializes racing consumers.
            let query = r"
                UPDATE authorization_codes SET consumed = TRUE
                WHERE code_hash = $1 AND consumed = FALSE AND expires_at > NOW()
                RETURNING code_hash, client_id, tenant_id, subject_id, redirect_uri, scope,
                          code_challenge, nonce, amr, acr, issued_at, expires_at, consumed
            ";
            let row = sqlx::query(query)
                .bind(code_hash)
                .fetch_optional(&self.pool)
                .instrument(query_span("UPDATE", query))
                .await
                .context("failed to consume authorization code")?;
            row.as_ref().map(code_from_row).transpose()
        })
    }
}
