//! Control plane: where tenants (and optionally their clients) are declared.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    collections::HashMap,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::store::{
    BoxFuture,
    models::{Client, Tenant},
};

pub const TENANT_CACHE_CAPACITY: usize = 1024;
pub const TENANT_CACHE_TTL: Duration = Duration::from_secs(60);

pub trait ControlPlaneProvider: Send + Sync {
    fn get_tenant_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Tenant>>>;
    fn get_tenant_by_slug<'a>(&'a self, slug: &'a str) -> BoxFuture<'a, Result<Option<Tenant>>>;
    fn list_tenants(&self) -> BoxFuture<'_, Result<Vec<Tenant>>>;
    fn get_client<'a>(
        &'a self,
        tenant_slug: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Client>>>;
}

/// On-disk tenant document, `DATA_ROOT/tenants/<slug>.json`.
#[derive(Clone, Debug, Deserialize)]
pub struct TenantDocument {
    #[serde(flatten)]
    pub tenant: Tenant,
    #[serde(default)]
    pub clients: Vec<Client>,
}

/// Tenants read once from the filesystem.
#[derive(Clone, Debug, Default)]
pub struct StaticControlPlane {
    documents: Vec<TenantDocument>,
}

impl StaticControlPlane {
    #[must_use]
    pub fn new(documents: Vec<TenantDocument>) -> Self {
        Self { documents }
    }

    /// Read every `*.json` file under `data_root/tenants`.
    ///
    /// # Errors
    /// Returns an error if a file cannot be read or is not a valid tenant document.
    pub async fn load(data_root: &Path) -> Result<Self> {
        let dir = data_root.join("tenants");
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!("Control plane directory {} does not exist", dir.display());
                return Ok(Self::default());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read {}", dir.display()));
            }
        };

        let mut documents = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("Failed to list {}", dir.display()))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let document: TenantDocument = serde_json::from_slice(&raw)
                .with_context(|| format!("Invalid tenant document {}", path.display()))?;
            debug!("Loaded tenant {} from {}", document.tenant.slug, path.display());
            documents.push(document);
        }
        documents.sort_by(|a, b| a.tenant.slug.cmp(&b.tenant.slug));

        info!("Control plane loaded {} tenant(s)", documents.len());

        Ok(Self { documents })
    }

    fn find(&self, predicate: impl Fn(&Tenant) -> bool) -> Option<&TenantDocument> {
        self.documents.iter().find(|doc| predicate(&doc.tenant))
    }
}

impl ControlPlaneProvider for StaticControlPlane {
    fn get_tenant_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Tenant>>> {
        Box::pin(async move { Ok(self.find(|t| t.id == id).map(|doc| doc.tenant.clone())) })
    }

    fn get_tenant_by_slug<'a>(&'a self, slug: &'a str) -> BoxFuture<'a, Result<Option<Tenant>>> {
        Box::pin(async move { Ok(self.find(|t| t.slug == slug).map(|doc| doc.tenant.clone())) })
    }

    fn list_tenants(&self) -> BoxFuture<'_, Result<Vec<Tenant>>> {
        Box::pin(async move {
            Ok(self
                .documents
                .iter()
                .map(|doc| doc.tenant.clone())
                .collect())
        })
    }

    fn get_client<'a>(
        &'a self,
        tenant_slug: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Client>>> {
        Box::pin(async move {
            Ok(self.find(|t| t.slug == tenant_slug).and_then(|doc| {
                doc.clients
                    .iter()
                    .find(|client| client.client_id == client_id)
                    .cloned()
            }))
        })
    }
}

struct CachedTenant {
    tenant: Option<Tenant>,
    fetched_at: Instant,
}

/// Bounded, TTL'd read-through cache in front of a provider. Negative lookups
/// are cached too so unknown slugs do not hammer the provider.
pub struct TenantCache {
    inner: Arc<dyn ControlPlaneProvider>,
    entries: Mutex<HashMap<String, CachedTenant>>,
    capacity: usize,
    ttl: Duration,
}

impl TenantCache {
    #[must_use]
    pub fn new(inner: Arc<dyn ControlPlaneProvider>) -> Self {
        Self {
            inner,
            entries: Mutex::new(HashMap::new()),
            capacity: TENANT_CACHE_CAPACITY,
            ttl: TENANT_CACHE_TTL,
        }
    }

    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    async fn cached(&self, key: &str) -> Option<Option<Tenant>> {
        let entries = self.entries.lock().await;
        entries
            .get(key)
            .filter(|entry| entry.fetched_at.elapsed() < self.ttl)
            .map(|entry| entry.tenant.clone())
    }

    async fn store(&self, key: String, tenant: Option<Tenant>) {
        let mut entries = self.entries.lock().await;
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let ttl = self.ttl;
            entries.retain(|_, entry| entry.fetched_at.elapsed() < ttl);
            if entries.len() >= self.capacity {
                let oldest = entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.fetched_at)
                    .map(|(key, _)| key.clone());
                if let Some(oldest) = oldest {
                    entries.remove(&oldest);
                }
            }
        }
        entries.insert(
            key,
            CachedTenant {
                tenant,
                fetched_at: Instant::now(),
            },
        );
    }
}

impl ControlPlaneProvider for TenantCache {
    fn get_tenant_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Tenant>>> {
        Box::pin(async move {
            let key = format!("id:{id}");
            if let Some(tenant) = self.cached(&key).await {
                return Ok(tenant);
            }
            let tenant = self.inner.get_tenant_by_id(id).await?;
            self.store(key, tenant.clone()).await;
            Ok(tenant)
        })
    }

    fn get_tenant_by_slug<'a>(&'a self, slug: &'a str) -> BoxFuture<'a, Result<Option<Tenant>>> {
        Box::pin(async move {
            let key = format!("slug:{slug}");
            if let Some(tenant) = self.cached(&key).await {
                return Ok(tenant);
            }
            let tenant = self.inner.get_tenant_by_slug(slug).await?;
            self.store(key, tenant.clone()).await;
            Ok(tenant)
        })
    }

    fn list_tenants(&self) -> BoxFuture<'_, Result<Vec<Tenant>>> {
        self.inner.list_tenants()
    }

    fn get_client<'a>(
        &'a self,
        tenant_slug: &'a str,
        client_id: &'a str,
    ) -> BoxFuture<'a, Result<Option<Client>>> {
        self.inner.get_client(tenant_slug, client_id)
    }
}
