//! Grant handling for the token endpoint.
//!
//! Every grant follows the same shape: resolve and authenticate the client,
//! re-select the active store for the client's tenant, then mint. Store and
//! signer failures surface as `internal`; everything the caller can fix is an
//! OAuth2 error.

use anyhow::Context;
use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::BTreeSet, sync::Arc};
use tracing::{debug, warn};
use utoipa::ToSchema;

use super::{
    claims::{Claims, SystemClaims, TokenUse},
    client_auth::{self, ClientCredentials},
    codes::{AuthorizationCodeStore, MAX_CODE_TTL_SECS},
    form::FormParams,
    pkce,
    scope::ScopeSet,
    signer::{TokenSigner, looks_like_jwt},
};
use crate::api::error::ApiError;
use crate::hash::hash_token;
use crate::issuer::{IssuerResolver, ResolvedIssuer};
use crate::store::{
    BulkRevokeOutcome, RotateOutcome,
    models::{Client, GrantType, RefreshGrant, RefreshToken, User},
};
use crate::tenancy::{ActiveStore, StoreSelector};

pub const DEFAULT_ACCESS_TTL_SECS: i64 = 600;
pub const DEFAULT_REFRESH_TTL_SECS: i64 = 30 * 24 * 3600;
pub const DEFAULT_DEADLINE: std::time::Duration = std::time::Duration::from_secs(3);

#[derive(Clone, Debug)]
pub struct TokenConfig {
    access_ttl: Duration,
    refresh_ttl: Duration,
    auth_code_ttl: Duration,
    deadline: std::time::Duration,
    fs_admin_enabled: bool,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            access_ttl: Duration::seconds(DEFAULT_ACCESS_TTL_SECS),
            refresh_ttl: Duration::seconds(DEFAULT_REFRESH_TTL_SECS),
            auth_code_ttl: Duration::seconds(MAX_CODE_TTL_SECS),
            deadline: DEFAULT_DEADLINE,
            fs_admin_enabled: false,
        }
    }

    #[must_use]
    pub fn with_access_ttl(mut self, ttl: Duration) -> Self {
        self.access_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    /// Capped at 60 seconds.
    #[must_use]
    pub fn with_auth_code_ttl(mut self, ttl: Duration) -> Self {
        self.auth_code_ttl = ttl.min(Duration::seconds(MAX_CODE_TTL_SECS));
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: std::time::Duration) -> Self {
        self.deadline = deadline;
        self
    }

    #[must_use]
    pub fn with_fs_admin_enabled(mut self, enabled: bool) -> Self {
        self.fs_admin_enabled = enabled;
        self
    }

    #[must_use]
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    #[must_use]
    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    #[must_use]
    pub fn auth_code_ttl(&self) -> Duration {
        self.auth_code_ttl
    }

    #[must_use]
    pub fn deadline(&self) -> std::time::Duration {
        self.deadline
    }

    #[must_use]
    pub fn fs_admin_enabled(&self) -> bool {
        self.fs_admin_enabled
    }
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

#[derive(Clone)]
pub struct TokenService {
    selector: StoreSelector,
    issuer: IssuerResolver,
    signer: Arc<dyn TokenSigner>,
    codes: Arc<dyn AuthorizationCodeStore>,
    config: TokenConfig,
}

/// Client after authentication, with the store of its tenant.
struct ResolvedClient {
    client: Client,
    active: ActiveStore,
    issuer: ResolvedIssuer,
}

impl TokenService {
    #[must_use]
    pub fn new(
        selector: StoreSelector,
        issuer: IssuerResolver,
        signer: Arc<dyn TokenSigner>,
        codes: Arc<dyn AuthorizationCodeStore>,
        config: TokenConfig,
    ) -> Self {
        Self {
            selector,
            issuer,
            signer,
            codes,
            config,
        }
    }

    #[must_use]
    pub fn selector(&self) -> &StoreSelector {
        &self.selector
    }

    #[must_use]
    pub fn issuer(&self) -> &IssuerResolver {
        &self.issuer
    }

    #[must_use]
    pub fn signer(&self) -> &Arc<dyn TokenSigner> {
        &self.signer
    }

    #[must_use]
    pub fn codes(&self) -> &Arc<dyn AuthorizationCodeStore> {
        &self.codes
    }

    #[must_use]
    pub fn config(&self) -> &TokenConfig {
        &self.config
    }

    /// Dispatch on `grant_type`.
    ///
    /// # Errors
    /// Any OAuth2 error of the selected grant; `internal` for store and signer failures.
    pub async fn exchange(
        &self,
        active: &ActiveStore,
        headers: &HeaderMap,
        form: &FormParams,
    ) -> Result<TokenResponse, ApiError> {
        let grant_type = form.require("grant_type")?;
        match GrantType::parse(grant_type) {
            Some(GrantType::AuthorizationCode) => {
                self.authorization_code(active, headers, form).await
            }
            Some(GrantType::RefreshToken) => self.refresh_token(active, headers, form).await,
            Some(GrantType::ClientCredentials) => {
                self.client_credentials(active, headers, form).await
            }
            None => Err(ApiError::UnsupportedGrantType(format!(
                "grant_type {grant_type} is not supported"
            ))),
        }
    }

    /// Look up a client in the active store, then in the control plane. A client
    /// of another tenant than the selected one is treated as unknown.
    ///
    /// # Errors
    /// `invalid_client` when no such client exists.
    pub async fn find_client(
        &self,
        active: &ActiveStore,
        client_id: &str,
    ) -> Result<Client, ApiError> {
        let mut client = active.store.clients.get_by_client_id(client_id).await?;
        if client.is_none() {
            if let (Some(control_plane), Some(slug)) =
                (self.selector.control_plane(), active.slug())
            {
                client = control_plane.get_client(slug, client_id).await?;
            }
        }
        let client = client.ok_or_else(|| ApiError::invalid_client("unknown client"))?;
        if active
            .tenant
            .as_ref()
            .is_some_and(|tenant| tenant.id != client.tenant_id)
        {
            debug!("Client {client_id} belongs to another tenant");
            return Err(ApiError::invalid_client("unknown client"));
        }
        Ok(client)
    }

    async fn resolve_client(
        &self,
        active: &ActiveStore,
        credentials: &ClientCredentials,
        grant: GrantType,
    ) -> Result<ResolvedClient, ApiError> {
        let client = self.find_client(active, &credentials.client_id).await?;
        client_auth::authenticate(&client, credentials)?;
        if !client.allows_grant(grant) {
            return Err(ApiError::UnauthorizedClient(format!(
                "client is not allowed to use {}",
                grant.as_str()
            )));
        }

        // Second selection: the client decides which tenant store we write to.
        let active = self.selector.reselect(active, &client.tenant_id).await?;
        let issuer = self.issuer.resolve(active.tenant.as_ref(), active.slug());
        Ok(ResolvedClient {
            client,
            active,
            issuer,
        })
    }

    async fn authorization_code(
        &self,
        active: &ActiveStore,
        headers: &HeaderMap,
        form: &FormParams,
    ) -> Result<TokenResponse, ApiError> {
        let raw_code = form.require("code")?;
        let redirect_uri = form.require("redirect_uri")?;
        let verifier = form.require("code_verifier")?;
        if !pkce::verifier_is_well_formed(verifier) {
            return Err(ApiError::invalid_request("malformed code_verifier"));
        }
        let credentials = client_auth::extract(
            headers,
            form.get("client_id"),
            form.get("client_secret"),
        )?
        .ok_or_else(|| ApiError::invalid_request("missing client_id"))?;

        let resolved = self
            .resolve_client(active, &credentials, GrantType::AuthorizationCode)
            .await?;
        let client = &resolved.client;

        // Consumed before any binding check: a failed exchange still burns the code.
        let code = self
            .codes
            .consume(&hash_token(raw_code))
            .await?
            .ok_or_else(|| ApiError::invalid_grant("authorization code is invalid or expired"))?;

        if code.client_id != client.client_id || code.tenant_id != client.tenant_id {
            return Err(ApiError::invalid_grant("authorization code was issued to another client"));
        }
        if code.redirect_uri != redirect_uri {
            return Err(ApiError::invalid_grant("redirect_uri mismatch"));
        }
        if !pkce::verify_s256(verifier, &code.code_challenge) {
            return Err(ApiError::invalid_grant("PKCE verification failed"));
        }

        let user = self.load_user(&resolved.active, &code.subject_id, client).await?;
        let system = self.system_claims(&resolved.active, &user.id).await?;
        let now = Utc::now();

        let access = Claims::new(
            &resolved.issuer,
            &user.id,
            &client.tenant_id,
            &client.client_id,
            TokenUse::Access,
            now,
            self.config.access_ttl,
        )
        .context("failed to build access token claims")?
        .with_scope(code.scope.clone())
        .with_amr(code.amr.clone())
        .with_acr(code.acr.clone())
        .with_system(system);
        let access_token = self.signer.sign(&access)?;

        let id_token = if code.scope.has_openid() {
            let id = Claims::new(
                &resolved.issuer,
                &user.id,
                &client.tenant_id,
                &client.client_id,
                TokenUse::Id,
                now,
                self.config.access_ttl,
            )
            .context("failed to build id token claims")?
            .with_nonce(code.nonce.clone())
            .with_amr(code.amr.clone())
            .with_acr(code.acr.clone())
            .with_profile(profile_claims(&user, &code.scope));
            Some(self.signer.sign(&id)?)
        } else {
            None
        };

        // Persisted last so a failure above never leaves an orphan row.
        let refresh_token = if client.allows_grant(GrantType::RefreshToken) {
            let (raw, row) = RefreshToken::issue(
                RefreshGrant {
                    tenant_id: client.tenant_id.clone(),
                    client_id: client.client_id.clone(),
                    subject_id: user.id.clone(),
                    scope: code.scope.clone(),
                    ttl: self.config.refresh_ttl,
                    parent_id: None,
                },
                now,
            )?;
            resolved
                .active
                .store
                .refresh_tokens
                .create(&row)
                .await
                .context("failed to persist refresh token")?;
            Some(raw)
        } else {
            None
        };

        debug!("Issued tokens for {} via authorization_code", client.client_id);
        Ok(self.response(access_token, refresh_token, id_token, &code.scope))
    }

    async fn refresh_token(
        &self,
        active: &ActiveStore,
        headers: &HeaderMap,
        form: &FormParams,
    ) -> Result<TokenResponse, ApiError> {
        let raw = form.require("refresh_token")?;
        let requested = form
            .get("scope")
            .map(ScopeSet::parse)
            .transpose()
            .map_err(|err| ApiError::invalid_scope(err.to_string()))?
            .unwrap_or_default();
        let credentials = client_auth::extract(
            headers,
            form.get("client_id"),
            form.get("client_secret"),
        )?
        .ok_or_else(|| ApiError::invalid_request("missing client_id"))?;

        let resolved = self
            .resolve_client(active, &credentials, GrantType::RefreshToken)
            .await?;

        if self.config.fs_admin_enabled && looks_like_jwt(raw) {
            return self.admin_refresh(&resolved, raw, &requested);
        }

        let client = &resolved.client;
        let tokens = &resolved.active.store.refresh_tokens;
        let now = Utc::now();

        let current = tokens
            .get_by_hash(&hash_token(raw))
            .await?
            .ok_or_else(|| ApiError::invalid_grant("refresh token is invalid"))?;

        if current.revoked_at.is_some() {
            if tokens.has_children(current.id).await? {
                warn!(
                    "Refresh token reuse detected for subject {}, revoking family",
                    current.subject_id
                );
                match tokens
                    .revoke_all_for_subject(&current.subject_id, Some(&current.client_id))
                    .await
                {
                    Ok(BulkRevokeOutcome::Revoked(count)) => {
                        debug!("Revoked {count} refresh tokens after reuse");
                    }
                    Ok(BulkRevokeOutcome::Unsupported) => {
                        warn!("Store cannot revoke refresh tokens in bulk");
                    }
                    Err(err) => warn!("Failed to revoke refresh token family: {err:#}"),
                }
            }
            return Err(ApiError::invalid_grant("refresh token is invalid"));
        }
        if !current.is_active(now) {
            return Err(ApiError::invalid_grant("refresh token is invalid"));
        }
        if current.client_id != client.client_id || current.tenant_id != client.tenant_id {
            return Err(ApiError::invalid_grant("refresh token was issued to another client"));
        }

        let scope = if requested.is_empty() {
            current.scope.clone()
        } else if requested.is_subset_of(&current.scope) {
            requested
        } else {
            return Err(ApiError::invalid_scope(
                "requested scope exceeds the original grant",
            ));
        };

        let user = self
            .load_user(&resolved.active, &current.subject_id, client)
            .await?;
        let system = self.system_claims(&resolved.active, &user.id).await?;
        let access = Claims::new(
            &resolved.issuer,
            &user.id,
            &client.tenant_id,
            &client.client_id,
            TokenUse::Access,
            now,
            self.config.access_ttl,
        )
        .context("failed to build access token claims")?
        .with_scope(scope.clone())
        .with_system(system);
        let access_token = self.signer.sign(&access)?;

        // The child keeps the original grant; narrowing only affects this access token.
        let (raw_next, next) = RefreshToken::issue(
            RefreshGrant {
                tenant_id: current.tenant_id.clone(),
                client_id: current.client_id.clone(),
                subject_id: current.subject_id.clone(),
                scope: current.scope.clone(),
                ttl: self.config.refresh_ttl,
                parent_id: Some(current.id),
            },
            now,
        )?;
        match tokens.rotate(&current.hash, &next).await? {
            RotateOutcome::Rotated(id) => debug!("Rotated refresh token {} into {id}", current.id),
            RotateOutcome::Conflict => {
                return Err(ApiError::invalid_grant("refresh token already used"));
            }
        }

        Ok(self.response(access_token, Some(raw_next), None, &scope))
    }

    /// Stateless refresh for global admin tokens: nothing is persisted, so these
    /// refresh JWTs cannot be revoked before they expire.
    fn admin_refresh(
        &self,
        resolved: &ResolvedClient,
        raw: &str,
        requested: &ScopeSet,
    ) -> Result<TokenResponse, ApiError> {
        let client = &resolved.client;
        let claims = self
            .signer
            .verify(raw, Some(self.issuer.base()), Some(&client.client_id))
            .map_err(|err| {
                debug!("Admin refresh token rejected: {err:#}");
                ApiError::invalid_grant("refresh token is invalid")
            })?;
        if claims.token_use() != TokenUse::Refresh || !claims.is_admin() {
            return Err(ApiError::invalid_grant("refresh token is invalid"));
        }
        let scope = if requested.is_empty() {
            claims.scope().clone()
        } else if requested.is_subset_of(claims.scope()) {
            requested.clone()
        } else {
            return Err(ApiError::invalid_scope(
                "requested scope exceeds the original grant",
            ));
        };

        let issuer = ResolvedIssuer::from_issuer(claims.iss());
        let now = Utc::now();
        let mint = |token_use: TokenUse, ttl: Duration, scope: ScopeSet| {
            Claims::new(
                &issuer,
                claims.sub(),
                claims.tid(),
                claims.aud(),
                token_use,
                now,
                ttl,
            )
            .map(|fresh| {
                fresh
                    .with_scope(scope)
                    .with_amr(claims.amr().to_vec())
                    .with_system(claims.system().clone())
                    .with_admin(true)
            })
            .context("failed to build admin claims")
        };
        let access_token = self
            .signer
            .sign(&mint(TokenUse::Access, self.config.access_ttl, scope.clone())?)?;
        let refresh_token = self.signer.sign(&mint(
            TokenUse::Refresh,
            self.config.refresh_ttl,
            claims.scope().clone(),
        )?)?;

        debug!("Re-minted admin tokens for {}", claims.sub());
        Ok(self.response(access_token, Some(refresh_token), None, &scope))
    }

    async fn client_credentials(
        &self,
        active: &ActiveStore,
        headers: &HeaderMap,
        form: &FormParams,
    ) -> Result<TokenResponse, ApiError> {
        let credentials = client_auth::extract(
            headers,
            form.get("client_id"),
            form.get("client_secret"),
        )?
        .ok_or_else(|| ApiError::invalid_client("client authentication required"))?;
        let requested = form
            .get("scope")
            .map(ScopeSet::parse)
            .transpose()
            .map_err(|err| ApiError::invalid_scope(err.to_string()))?
            .unwrap_or_default();

        let client = self.find_client(active, &credentials.client_id).await?;
        if !client.is_confidential() {
            return Err(ApiError::invalid_client(
                "public clients cannot use client_credentials",
            ));
        }
        let resolved = self
            .resolve_client(active, &credentials, GrantType::ClientCredentials)
            .await?;
        let client = &resolved.client;

        let allowed = client.allowed_scopes();
        let scope = if requested.is_empty() {
            allowed
        } else if requested.is_subset_of(&allowed) {
            requested
        } else {
            return Err(ApiError::invalid_scope("requested scope is not allowed"));
        };

        let access = Claims::new(
            &resolved.issuer,
            &client.client_id,
            &client.tenant_id,
            &client.client_id,
            TokenUse::Access,
            Utc::now(),
            self.config.access_ttl,
        )
        .context("failed to build access token claims")?
        .with_scope(scope.clone());
        let access_token = self.signer.sign(&access)?;

        debug!("Issued client_credentials token for {}", client.client_id);
        Ok(self.response(access_token, None, None, &scope))
    }

    async fn load_user(
        &self,
        active: &ActiveStore,
        subject_id: &str,
        client: &Client,
    ) -> Result<User, ApiError> {
        let user = active.store.users.get_by_id(subject_id).await?;
        match user {
            Some(user) if user.tenant_id == client.tenant_id => Ok(user),
            _ => Err(ApiError::invalid_grant("subject is unknown")),
        }
    }

    /// Roles plus the union of direct and role-derived permissions.
    async fn system_claims(
        &self,
        active: &ActiveStore,
        user_id: &str,
    ) -> Result<SystemClaims, ApiError> {
        let rbac = &active.store.rbac;
        let roles: BTreeSet<String> = rbac.get_user_roles(user_id).await?.into_iter().collect();
        let mut perms: BTreeSet<String> = rbac
            .get_user_permissions(user_id)
            .await?
            .into_iter()
            .collect();
        for role in &roles {
            perms.extend(rbac.get_role_perms(role).await?);
        }
        Ok(SystemClaims {
            roles: roles.into_iter().collect(),
            perms: perms.into_iter().collect(),
        })
    }

    fn response(
        &self,
        access_token: String,
        refresh_token: Option<String>,
        id_token: Option<String>,
        scope: &ScopeSet,
    ) -> TokenResponse {
        TokenResponse {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in: self.config.access_ttl.num_seconds(),
            refresh_token,
            id_token,
            scope: (!scope.is_empty()).then(|| scope.to_string()),
        }
    }
}

/// OIDC claims released into the id_token for the granted scopes.
fn profile_claims(user: &User, scope: &ScopeSet) -> Map<String, Value> {
    let mut profile = Map::new();
    if scope.contains("profile") {
        profile.extend(user.metadata.clone());
    }
    if scope.contains("email") {
        profile.insert("email".to_string(), Value::from(user.email.clone()));
        profile.insert("email_verified".to_string(), Value::from(user.email_verified));
    }
    profile
}
