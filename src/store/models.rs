//! Rows owned by a tenant store: clients, users, refresh tokens, tenants.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::hash::{generate_token, hash_token};
use crate::oauth::scope::ScopeSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    Public,
    Confidential,
}

impl ClientType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Confidential => "confidential",
        }
    }

    #[must_use]
    pub fn from_db(value: &str) -> Option<Self> {
        match value {
            "public" => Some(Self::Public),
            "confidential" => Some(Self::Confidential),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    AuthorizationCode,
    RefreshToken,
    ClientCredentials,
}

impl GrantType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AuthorizationCode => "authorization_code",
            Self::RefreshToken => "refresh_token",
            Self::ClientCredentials => "client_credentials",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "authorization_code" => Some(Self::AuthorizationCode),
            "refresh_token" => Some(Self::RefreshToken),
            "client_credentials" => Some(Self::ClientCredentials),
            _ => None,
        }
    }
}

/// Registered OAuth client. `(tenant_id, client_id)` is unique.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub client_id: String,
    pub tenant_id: String,
    pub name: String,
    pub client_type: ClientType,
    /// Enabled login methods in display order, e.g. `["password"]`.
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub post_logout_redirect_uris: Vec<String>,
    #[serde(default)]
    pub scopes_allowed: Vec<String>,
    #[serde(default = "default_grant_types")]
    pub grant_types: Vec<GrantType>,
    /// `hash_token(client_secret)`; confidential clients only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub require_email_verification: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_password_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_email_url: Option<String>,
}

fn default_grant_types() -> Vec<GrantType> {
    vec![GrantType::AuthorizationCode, GrantType::RefreshToken]
}

impl Client {
    #[must_use]
    pub fn is_confidential(&self) -> bool {
        self.client_type == ClientType::Confidential
    }

    #[must_use]
    pub fn allows_grant(&self, grant: GrantType) -> bool {
        self.grant_types.contains(&grant)
    }

    #[must_use]
    pub fn allowed_scopes(&self) -> ScopeSet {
        ScopeSet::from_tokens(self.scopes_allowed.iter().cloned())
    }

    #[must_use]
    pub fn has_redirect_uri(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|uri| uri == redirect_uri)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Brand {
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub primary_color: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserField {
    pub name: String,
    #[serde(default)]
    pub required: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSettings {
    /// Overrides the issuer computed from `ISSUER_MODE`.
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub brand: Option<Brand>,
    #[serde(default)]
    pub smtp_configured: bool,
    #[serde(default)]
    pub mfa_enabled: bool,
    #[serde(default)]
    pub social_login_enabled: bool,
    #[serde(default)]
    pub user_fields: Vec<UserField>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub settings: TenantSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub tenant_id: String,
    pub email: String,
    pub email_verified: bool,
    /// Free-form profile data, including standard OIDC profile claims.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Argon2 PHC string; `None` for users without a password login.
    #[serde(default, skip_serializing)]
    pub password_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Persisted refresh token. Only `hash` is stored; the raw value is returned once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshToken {
    pub id: Uuid,
    pub tenant_id: String,
    pub client_id: String,
    pub subject_id: String,
    pub hash: String,
    pub scope: ScopeSet,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub parent_id: Option<Uuid>,
}

/// Everything needed to mint a refresh token row.
#[derive(Clone, Debug)]
pub struct RefreshGrant {
    pub tenant_id: String,
    pub client_id: String,
    pub subject_id: String,
    pub scope: ScopeSet,
    pub ttl: Duration,
    pub parent_id: Option<Uuid>,
}

impl RefreshToken {
    /// Generate a new raw token and the row that represents it.
    ///
    /// # Errors
    /// Returns an error if the entropy source fails.
    pub fn issue(grant: RefreshGrant, now: DateTime<Utc>) -> anyhow::Result<(String, Self)> {
        let raw = generate_token()?;
        let row = Self {
            id: Uuid::now_v7(),
            tenant_id: grant.tenant_id,
            client_id: grant.client_id,
            subject_id: grant.subject_id,
            hash: hash_token(&raw),
            scope: grant.scope,
            issued_at: now,
            expires_at: now + grant.ttl,
            revoked_at: None,
            parent_id: grant.parent_id,
        };
        Ok((raw, row))
    }

    /// Active iff not revoked and not yet expired.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && now < self.expires_at
    }
}
