//! Postgres repositories (`sqlx`).

use anyhow::{Context, Result};
use sqlx::{PgPool, Row, postgres::PgRow};
use tracing::{Instrument, Span, info_span, warn};
use uuid::Uuid;

use super::{
    BoxFuture, BulkRevokeOutcome, ClientRepository, RbacRepository, RefreshTokenRepository,
    RotateOutcome, UserRepository,
    models::{Client, ClientType, GrantType, RefreshToken, User},
};
use crate::oauth::scope::ScopeSet;

pub const SCHEMA: &str = include_str!("../../sql/schema.sql");

/// Create tables and indexes if they do not exist yet.
///
/// # Errors
/// Returns an error if the schema cannot be applied.
pub async fn apply_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA)
        .execute(pool)
        .instrument(query_span("DDL", "schema.sql"))
        .await
        .context("failed to apply schema")?;
    Ok(())
}

pub(crate) fn query_span(operation: &'static str, statement: &'static str) -> Span {
    info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const CLIENT_COLUMNS: &str = "id, client_id, tenant_id, name, client_type, providers, redirect_uris, \
     post_logout_redirect_uris, scopes_allowed, grant_types, secret_hash, \
     require_email_verification, reset_password_url, verify_email_url";

fn client_from_row(row: &PgRow) -> Result<Client> {
    let client_type: String = row.try_get("client_type")?;
    let grant_types: Vec<String> = row.try_get("grant_types")?;
    Ok(Client {
        id: row.try_get("id")?,
        client_id: row.try_get("client_id")?,
        tenant_id: row.try_get("tenant_id")?,
        name: row.try_get("name")?,
        client_type: ClientType::from_db(&client_type)
            .with_context(|| format!("unknown client_type {client_type}"))?,
        providers: row.try_get("providers")?,
        redirect_uris: row.try_get("redirect_uris")?,
        post_logout_redirect_uris: row.try_get("post_logout_redirect_uris")?,
        scopes_allowed: row.try_get("scopes_allowed")?,
        grant_types: grant_types
            .iter()
            .filter_map(|grant| GrantType::parse(grant))
            .collect(),
        secret_hash: row.try_get("secret_hash")?,
        require_email_verification: row.try_get("require_email_verification")?,
        reset_password_url: row.try_get("reset_password_url")?,
        verify_email_url: row.try_get("verify_email_url")?,
    })
}

fn grant_names(client: &Client) -> Vec<String> {
    client
        .grant_types
        .iter()
        .map(|grant| grant.as_str().to_string())
        .collect()
}

impl ClientRepository for PgStore {
    fn get_by_client_id<'a>(&'a self, client_id: &'a str) -> BoxFuture<'a, Result<Option<Client>>> {
        Box::pin(async move {
            let query =
                format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE client_id = $1 LIMIT 1");
            let row = sqlx::query(&query)
                .bind(client_id)
                .fetch_optional(&self.pool)
                .instrument(query_span("SELECT", "SELECT .. FROM clients WHERE client_id = $1"))
                .await
                .context("failed to lookup client by client_id")?;
            row.as_ref().map(client_from_row).transpose()
        })
    }

    fn get_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Client>>> {
        Box::pin(async move {
            let query = format!("SELECT {CLIENT_COLUMNS} FROM clients WHERE id = $1");
            let row = sqlx::query(&query)
                .bind(id)
                .fetch_optional(&self.pool)
                .instrument(query_span("SELECT", "SELECT .. FROM clients WHERE id = $1"))
                .await
                .context("failed to lookup client by id")?;
            row.as_ref().map(client_from_row).transpose()
        })
    }

    fn list<'a>(&'a self, tenant_id: &'a str) -> BoxFuture<'a, Result<Vec<Client>>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {CLIENT_COLUMNS} FROM clients WHERE tenant_id = $1 ORDER BY client_id"
            );
            let rows = sqlx::query(&query)
                .bind(tenant_id)
                .fetch_all(&self.pool)
                .instrument(query_span("SELECT", "SELECT .. FROM clients WHERE tenant_id = $1"))
                .await
                .context("failed to list clients")?;
            rows.iter().map(client_from_row).collect()
        })
    }

    fn create<'a>(&'a self, client: &'a Client) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let query = r"
                INSERT INTO clients
                    (id, client_id, tenant_id, name, client_type, providers, redirect_uris,
                     post_logout_redirect_uris, scopes_allowed, grant_types, secret_hash,
                     require_email_verification, reset_password_url, verify_email_url)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ";
            sqlx::query(query)
                .bind(&client.id)
                .bind(&client.client_id)
                .bind(&client.tenant_id)
                .bind(&client.name)
                .bind(client.client_type.as_str())
                .bind(&client.providers)
                .bind(&client.redirect_uris)
                .bind(&client.post_logout_redirect_uris)
                .bind(&client.scopes_allowed)
                .bind(grant_names(client))
                .bind(&client.secret_hash)
                .bind(client.require_email_verification)
                .bind(&client.reset_password_url)
                .bind(&client.verify_email_url)
                .execute(&self.pool)
                .instrument(query_span("INSERT", query))
                .await
                .context("failed to insert client")?;
            Ok(())
        })
    }

    fn update<'a>(&'a self, client: &'a Client) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let query = r"
                UPDATE clients SET
                    client_id = $2, tenant_id = $3, name = $4, client_type = $5, providers = $6,
                    redirect_uris = $7, post_logout_redirect_uris = $8, scopes_allowed = $9,
                    grant_types = $10, secret_hash = $11, require_email_verification = $12,
                    reset_password_url = $13, verify_email_url = $14
                WHERE id = $1
            ";
            let result = sqlx::query(query)
                .bind(&client.id)
                .bind(&client.client_id)
                .bind(&client.tenant_id)
                .bind(&client.name)
                .bind(client.client_type.as_str())
                .bind(&client.providers)
                .bind(&client.redirect_uris)
                .bind(&client.post_logout_redirect_uris)
                .bind(&client.scopes_allowed)
                .bind(grant_names(client))
                .bind(&client.secret_hash)
                .bind(client.require_email_verification)
                .bind(&client.reset_password_url)
                .bind(&client.verify_email_url)
                .execute(&self.pool)
                .instrument(query_span("UPDATE", query))
                .await
                .context("failed to update client")?;
            Ok(result.rows_affected() > 0)
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let query = "DELETE FROM clients WHERE id = $1";
            let result = sqlx::query(query)
                .bind(id)
                .execute(&self.pool)
                .instrument(query_span("DELETE", query))
                .await
                .context("failed to delete client")?;
            Ok(result.rows_affected() > 0)
        })
    }
}

fn user_from_row(row: &PgRow) -> Result<User> {
    let metadata: serde_json::Value = row.try_get("metadata")?;
    Ok(User {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        email: row.try_get("email")?,
        email_verified: row.try_get("email_verified")?,
        metadata: match metadata {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        },
        password_hash: row.try_get("password_hash")?,
        created_at: row.try_get("created_at")?,
    })
}

impl UserRepository for PgStore {
    fn get_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<User>>> {
        Box::pin(async move {
            let query = r"
                SELECT id, tenant_id, email, email_verified, metadata, password_hash, created_at
                FROM users WHERE id = $1
            ";
            let row = sqlx::query(query)
                .bind(id)
                .fetch_optional(&self.pool)
                .instrument(query_span("SELECT", query))
                .await
                .context("failed to lookup user")?;
            row.as_ref().map(user_from_row).transpose()
        })
    }

    fn get_by_email<'a>(
        &'a self,
        tenant_id: &'a str,
        email: &'a str,
    ) -> BoxFuture<'a, Result<Option<User>>> {
        Box::pin(async move {
            let query = r"
                SELECT id, tenant_id, email, email_verified, metadata, password_hash, created_at
                FROM users WHERE tenant_id = $1 AND lower(email) = lower($2)
            ";
            let row = sqlx::query(query)
                .bind(tenant_id)
                .bind(email.trim())
                .fetch_optional(&self.pool)
                .instrument(query_span("SELECT", query))
                .await
                .context("failed to lookup user by email")?;
            row.as_ref().map(user_from_row).transpose()
        })
    }

    fn create<'a>(&'a self, user: &'a User) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let query = r"
                INSERT INTO users
                    (id, tenant_id, email, email_verified, metadata, password_hash, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
            ";
            sqlx::query(query)
                .bind(&user.id)
                .bind(&user.tenant_id)
                .bind(&user.email)
                .bind(user.email_verified)
                .bind(serde_json::Value::Object(user.metadata.clone()))
                .bind(&user.password_hash)
                .bind(user.created_at)
                .execute(&self.pool)
                .instrument(query_span("INSERT", query))
                .await
                .context("failed to insert user")?;
            Ok(())
        })
    }
}

impl PgStore {
    async fn fetch_names(&self, query: &'static str, key: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(query)
            .bind(key)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to read rbac rows")?;
        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(anyhow::Error::from))
            .collect()
    }

    async fn execute_pair(
        &self,
        operation: &'static str,
        query: &'static str,
        first: &str,
        second: &str,
    ) -> Result<()> {
        sqlx::query(query)
            .bind(first)
            .bind(second)
            .execute(&self.pool)
            .instrument(query_span(operation, query))
            .await
            .context("failed to write rbac row")?;
        Ok(())
    }
}

impl RbacRepository for PgStore {
    fn get_user_roles<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(self.fetch_names(
            "SELECT role FROM user_roles WHERE user_id = $1 ORDER BY role",
            user_id,
        ))
    }

    fn get_user_permissions<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(self.fetch_names(
            "SELECT perm FROM user_permissions WHERE user_id = $1 ORDER BY perm",
            user_id,
        ))
    }

    fn get_role_perms<'a>(&'a self, role: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(self.fetch_names(
            "SELECT perm FROM role_permissions WHERE role = $1 ORDER BY perm",
            role,
        ))
    }

    fn add_user_role<'a>(&'a self, user_id: &'a str, role: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.execute_pair(
            "INSERT",
            "INSERT INTO user_roles (user_id, role) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            user_id,
            role,
        ))
    }

    fn remove_user_role<'a>(
        &'a self,
        user_id: &'a str,
        role: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.execute_pair(
            "DELETE",
            "DELETE FROM user_roles WHERE user_id = $1 AND role = $2",
            user_id,
            role,
        ))
    }

    fn add_user_permission<'a>(
        &'a self,
        user_id: &'a str,
        perm: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.execute_pair(
            "INSERT",
            "INSERT INTO user_permissions (user_id, perm) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            user_id,
            perm,
        ))
    }

    fn remove_user_permission<'a>(
        &'a self,
        user_id: &'a str,
        perm: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.execute_pair(
            "DELETE",
            "DELETE FROM user_permissions WHERE user_id = $1 AND perm = $2",
            user_id,
            perm,
        ))
    }

    fn add_role_permission<'a>(
        &'a self,
        role: &'a str,
        perm: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.execute_pair(
            "INSERT",
            "INSERT INTO role_permissions (role, perm) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            role,
            perm,
        ))
    }

    fn remove_role_permission<'a>(
        &'a self,
        role: &'a str,
        perm: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.execute_pair(
            "DELETE",
            "DELETE FROM role_permissions WHERE role = $1 AND perm = $2",
            role,
            perm,
        ))
    }
}

fn refresh_from_row(row: &PgRow) -> Result<RefreshToken> {
    let scope: String = row.try_get("scope")?;
    Ok(RefreshToken {
        id: row.try_get("id")?,
        tenant_id: row.try_get("tenant_id")?,
        client_id: row.try_get("client_id")?,
        subject_id: row.try_get("subject_id")?,
        hash: row.try_get("hash")?,
        scope: ScopeSet::parse(&scope).context("stored refresh scope is invalid")?,
        issued_at: row.try_get("issued_at")?,
        expires_at: row.try_get("expires_at")?,
        revoked_at: row.try_get("revoked_at")?,
        parent_id: row.try_get("parent_id")?,
    })
}

const INSERT_REFRESH: &str = r"
    INSERT INTO refresh_tokens
        (id, tenant_id, client_id, subject_id, hash, scope, issued_at, expires_at, parent_id)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
";

async fn insert_refresh<'e, E>(executor: E, token: &RefreshToken) -> Result<()>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    sqlx::query(INSERT_REFRESH)
        .bind(token.id)
        .bind(&token.tenant_id)
        .bind(&token.client_id)
        .bind(&token.subject_id)
        .bind(&token.hash)
        .bind(token.scope.to_string())
        .bind(token.issued_at)
        .bind(token.expires_at)
        .bind(token.parent_id)
        .execute(executor)
        .instrument(query_span("INSERT", INSERT_REFRESH))
        .await
        .context("failed to insert refresh token")?;
    Ok(())
}

impl RefreshTokenRepository for PgStore {
    fn create<'a>(&'a self, token: &'a RefreshToken) -> BoxFuture<'a, Result<()>> {
        Box::pin(insert_refresh(&self.pool, token))
    }

    fn get_by_hash<'a>(&'a self, hash: &'a str) -> BoxFuture<'a, Result<Option<RefreshToken>>> {
        Box::pin(async move {
            let query = r"
                SELECT id, tenant_id, client_id, subject_id, hash, scope, issued_at, expires_at,
                       revoked_at, parent_id
                FROM refresh_tokens WHERE hash = $1
            ";
            let row = sqlx::query(query)
                .bind(hash)
                .fetch_optional(&self.pool)
                .instrument(query_span("SELECT", query))
                .await
                .context("failed to lookup refresh token")?;
            row.as_ref().map(refresh_from_row).transpose()
        })
    }

    fn revoke_by_id<'a>(&'a self, id: Uuid) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let query =
                "UPDATE refresh_tokens SET revoked_at = NOW() WHERE id = $1 AND revoked_at IS NULL";
            sqlx::query(query)
                .bind(id)
                .execute(&self.pool)
                .instrument(query_span("UPDATE", query))
                .await
                .context("failed to revoke refresh token")?;
            Ok(())
        })
    }

    fn rotate<'a>(
        &'a self,
        old_hash: &'a str,
        new_token: &'a RefreshToken,
    ) -> BoxFuture<'a, Result<RotateOutcome>> {
        Box::pin(async move {
            // Dropping the transaction before commit (deadline, error) rolls it back.
            let mut tx = self.pool.begin().await.context("begin rotation transaction")?;

            let query = r"
                UPDATE refresh_tokens SET revoked_at = NOW()
                WHERE hash = $1 AND revoked_at IS NULL AND expires_at > NOW()
                RETURNING id
            ";
            let revoked = sqlx::query(query)
                .bind(old_hash)
                .fetch_optional(&mut *tx)
                .instrument(query_span("UPDATE", query))
                .await
                .context("failed to revoke rotated refresh token")?;

            if revoked.is_none() {
                if let Err(err) = tx.rollback().await {
                    warn!("Failed to roll back refresh rotation: {err}");
                }
                return Ok(RotateOutcome::Conflict);
            }

            insert_refresh(&mut *tx, new_token).await?;
            tx.commit().await.context("commit rotation transaction")?;

            Ok(RotateOutcome::Rotated(new_token.id))
        })
    }

    fn has_children<'a>(&'a self, id: Uuid) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let query = "SELECT EXISTS (SELECT 1 FROM refresh_tokens WHERE parent_id = $1)";
            let row = sqlx::query(query)
                .bind(id)
                .fetch_one(&self.pool)
                .instrument(query_span("SELECT", query))
                .await
                .context("failed to check refresh token children")?;
            Ok(row.try_get::<bool, _>(0)?)
        })
    }

    fn revoke_all_for_subject<'a>(
        &'a self,
        subject_id: &'a str,
        client_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<BulkRevokeOutcome>> {
        Box::pin(async move {
            let query = r"
                UPDATE refresh_tokens SET revoked_at = NOW()
                WHERE subject_id = $1
                  AND ($2::TEXT IS NULL OR client_id = $2)
                  AND revoked_at IS NULL
            ";
            let result = sqlx::query(query)
                .bind(subject_id)
                .bind(client_id)
                .execute(&self.pool)
                .instrument(query_span("UPDATE", query))
                .await
                .context("failed to revoke refresh tokens for subject")?;
            Ok(BulkRevokeOutcome::Revoked(result.rows_affected()))
        })
    }
}
