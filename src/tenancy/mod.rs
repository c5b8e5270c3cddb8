//! Tenant database management, slug handling and the control plane.

use anyhow::{Context, anyhow};
use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::PgPoolOptions;
use std::{collections::HashMap, time::Duration};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::store::{BoxFuture, StoreHandle, postgres::apply_schema};

pub mod control_plane;
pub mod selector;

pub use control_plane::{ControlPlaneProvider, StaticControlPlane, TenantCache};
pub use selector::{ActiveStore, SelectError, StoreSelector};

static SLUG_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9-]{1,63}$").ok());

/// Slugs are URL-safe and at most one DNS label long.
#[must_use]
pub fn valid_slug(slug: &str) -> bool {
    SLUG_RE
        .as_ref()
        .is_some_and(|regex| regex.is_match(slug))
}

#[derive(Debug, Error)]
pub enum TenantOpenError {
    #[error("no database configured for tenant {0}")]
    Missing(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Opens (and pools) per-tenant store handles.
pub trait TenantSqlManager: Send + Sync {
    fn open<'a>(&'a self, slug: &'a str) -> BoxFuture<'a, Result<StoreHandle, TenantOpenError>>;
}

/// One `PgPool` per configured slug, created on first use and reused.
pub struct PgTenantManager {
    dsns: HashMap<String, SecretString>,
    handles: RwLock<HashMap<String, StoreHandle>>,
}

impl PgTenantManager {
    #[must_use]
    pub fn new(dsns: HashMap<String, SecretString>) -> Self {
        Self {
            dsns,
            handles: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn slugs(&self) -> Vec<&str> {
        let mut slugs: Vec<&str> = self.dsns.keys().map(String::as_str).collect();
        slugs.sort_unstable();
        slugs
    }

    async fn connect(&self, slug: &str) -> Result<StoreHandle, TenantOpenError> {
        let dsn = self
            .dsns
            .get(slug)
            .ok_or_else(|| TenantOpenError::Missing(slug.to_string()))?;

        let mut handles = self.handles.write().await;
        // another request may have connected while we waited for the lock
        if let Some(handle) = handles.get(slug) {
            return Ok(handle.clone());
        }

        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .max_lifetime(Duration::from_secs(60 * 2))
            .test_before_acquire(true)
            .connect(dsn.expose_secret())
            .await
            .with_context(|| format!("Failed to connect to database for tenant {slug}"))?;
        apply_schema(&pool).await?;

        info!("Opened tenant database pool for {slug}");

        let handle = StoreHandle::postgres(pool);
        handles.insert(slug.to_string(), handle.clone());
        Ok(handle)
    }
}

impl TenantSqlManager for PgTenantManager {
    fn open<'a>(&'a self, slug: &'a str) -> BoxFuture<'a, Result<StoreHandle, TenantOpenError>> {
        Box::pin(async move {
            if let Some(handle) = self.handles.read().await.get(slug) {
                debug!("Reusing tenant pool for {slug}");
                return Ok(handle.clone());
            }
            self.connect(slug).await
        })
    }
}

/// Fixed slug to handle map; used for development and tests.
#[derive(Default)]
pub struct StaticTenantManager {
    handles: HashMap<String, StoreHandle>,
}

impl StaticTenantManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_tenant(mut self, slug: &str, handle: StoreHandle) -> Self {
        self.handles.insert(slug.to_string(), handle);
        self
    }
}

impl TenantSqlManager for StaticTenantManager {
    fn open<'a>(&'a self, slug: &'a str) -> BoxFuture<'a, Result<StoreHandle, TenantOpenError>> {
        Box::pin(async move {
            self.handles
                .get(slug)
                .cloned()
                .ok_or_else(|| TenantOpenError::Missing(slug.to_string()))
        })
    }
}

/// Parse a `slug=dsn` pair as given on the command line.
///
/// # Errors
/// Returns an error if the pair has no `=`, an invalid slug, or an empty DSN.
pub fn parse_tenant_dsn(value: &str) -> anyhow::Result<(String, SecretString)> {
    let (slug, dsn) = value
        .split_once('=')
        .ok_or_else(|| anyhow!("expected slug=dsn"))?;
    let slug = slug.trim();
    if !valid_slug(slug) {
        return Err(anyhow!("invalid tenant slug: {slug}"));
    }
    let dsn = dsn.trim();
    if dsn.is_empty() {
        return Err(anyhow!("empty DSN for tenant {slug}"));
    }
    Ok((slug.to_string(), SecretString::from(dsn.to_string())))
}
