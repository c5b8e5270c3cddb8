//! Active store selection: prefer the tenant database, fall back to global.

use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::{ControlPlaneProvider, TenantOpenError, TenantSqlManager};
use crate::store::{StoreHandle, models::Tenant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreScope {
    Tenant,
    Global,
}

/// The store a request works against, plus what is known about its tenant.
#[derive(Clone, Debug)]
pub struct ActiveStore {
    pub store: StoreHandle,
    pub slug: Option<String>,
    pub tenant: Option<Tenant>,
    pub scope: StoreScope,
}

impl ActiveStore {
    /// Tenant slug to use for issuer resolution.
    #[must_use]
    pub fn slug(&self) -> Option<&str> {
        self.tenant
            .as_ref()
            .map(|tenant| tenant.slug.as_str())
            .or(self.slug.as_deref())
    }
}

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("no tenant database configured for {0}")]
    TenantDbMissing(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct StoreSelector {
    global: StoreHandle,
    manager: Option<Arc<dyn TenantSqlManager>>,
    control_plane: Option<Arc<dyn ControlPlaneProvider>>,
}

impl StoreSelector {
    #[must_use]
    pub fn new(global: StoreHandle) -> Self {
        Self {
            global,
            manager: None,
            control_plane: None,
        }
    }

    #[must_use]
    pub fn with_manager(mut self, manager: Arc<dyn TenantSqlManager>) -> Self {
        self.manager = Some(manager);
        self
    }

    #[must_use]
    pub fn with_control_plane(mut self, control_plane: Arc<dyn ControlPlaneProvider>) -> Self {
        self.control_plane = Some(control_plane);
        self
    }

    #[must_use]
    pub fn global(&self) -> &StoreHandle {
        &self.global
    }

    #[must_use]
    pub fn control_plane(&self) -> Option<&Arc<dyn ControlPlaneProvider>> {
        self.control_plane.as_ref()
    }

    /// First selection, from the slug found on the request.
    ///
    /// # Errors
    /// `TenantDbMissing` when a tenant manager exists but has no database for
    /// the slug; `Internal` for any other open or control plane failure.
    pub async fn select(&self, slug: Option<&str>) -> Result<ActiveStore, SelectError> {
        let tenant = match (&self.control_plane, slug) {
            (Some(control_plane), Some(slug)) => control_plane.get_tenant_by_slug(slug).await?,
            _ => None,
        };

        match (&self.manager, slug) {
            (Some(manager), Some(slug)) => match manager.open(slug).await {
                Ok(store) => {
                    debug!("Selected tenant store for {slug}");
                    Ok(ActiveStore {
                        store,
                        slug: Some(slug.to_string()),
                        tenant,
                        scope: StoreScope::Tenant,
                    })
                }
                Err(TenantOpenError::Missing(slug)) => Err(SelectError::TenantDbMissing(slug)),
                Err(TenantOpenError::Other(err)) => Err(SelectError::Internal(err)),
            },
            _ => Ok(ActiveStore {
                store: self.global.clone(),
                slug: slug.map(str::to_string),
                tenant,
                scope: StoreScope::Global,
            }),
        }
    }

    /// Second selection, once the client (or refresh token) names its tenant.
    /// Without a control plane entry for `tenant_id` the current store stays.
    ///
    /// # Errors
    /// Same as [`StoreSelector::select`].
    pub async fn reselect(
        &self,
        current: &ActiveStore,
        tenant_id: &str,
    ) -> Result<ActiveStore, SelectError> {
        if current
            .tenant
            .as_ref()
            .is_some_and(|tenant| tenant.id == tenant_id)
        {
            return Ok(current.clone());
        }
        let Some(control_plane) = &self.control_plane else {
            return Ok(current.clone());
        };
        let Some(tenant) = control_plane.get_tenant_by_id(tenant_id).await? else {
            return Ok(current.clone());
        };
        if current.slug.as_deref() == Some(tenant.slug.as_str()) {
            let mut active = current.clone();
            active.tenant = Some(tenant);
            return Ok(active);
        }
        debug!("Re-selecting store for tenant {}", tenant.slug);
        let mut active = self.select(Some(&tenant.slug)).await?;
        active.tenant = Some(tenant);
        Ok(active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Backend;
    use crate::store::models::TenantSettings;
    use crate::tenancy::{
        StaticControlPlane, control_plane::TenantDocument, StaticTenantManager,
    };

    fn document(id: &str, slug: &str) -> TenantDocument {
        TenantDocument {
            tenant: Tenant {
                id: id.to_string(),
                slug: slug.to_string(),
                name: slug.to_string(),
                settings: TenantSettings::default(),
            },
            clients: Vec::new(),
        }
    }

    #[tokio::test]
    async fn without_manager_uses_global() -> anyhow::Result<()> {
        let selector = StoreSelector::new(StoreHandle::memory());
        let active = selector.select(Some("acme")).await?;
        assert_eq!(active.scope, StoreScope::Global);
        assert_eq!(active.slug(), Some("acme"));

        let active = selector.select(None).await?;
        assert_eq!(active.scope, StoreScope::Global);
        assert_eq!(active.slug(), None);
        Ok(())
    }

    #[tokio::test]
    async fn manager_opens_tenant_store() -> anyhow::Result<()> {
        let manager = StaticTenantManager::new().with_tenant("acme", StoreHandle::memory());
        let selector = StoreSelector::new(StoreHandle::memory()).with_manager(Arc::new(manager));

        let active = selector.select(Some("acme")).await?;
        assert_eq!(active.scope, StoreScope::Tenant);
        assert!(matches!(active.store.backend(), Backend::Memory));

        // no slug on the request: global store
        let active = selector.select(None).await?;
        assert_eq!(active.scope, StoreScope::Global);
        Ok(())
    }

    #[tokio::test]
    async fn manager_without_db_is_tenant_db_missing() {
        let selector = StoreSelector::new(StoreHandle::memory())
            .with_manager(Arc::new(StaticTenantManager::new()));
        assert!(matches!(
            selector.select(Some("ghost")).await,
            Err(SelectError::TenantDbMissing(slug)) if slug == "ghost"
        ));
    }

    #[tokio::test]
    async fn reselect_follows_client_tenant() -> anyhow::Result<()> {
        let manager = StaticTenantManager::new()
            .with_tenant("acme", StoreHandle::memory())
            .with_tenant("globex", StoreHandle::memory());
        let plane = StaticControlPlane::new(vec![document("t1", "acme"), document("t2", "globex")]);
        let selector = StoreSelector::new(StoreHandle::memory())
            .with_manager(Arc::new(manager))
            .with_control_plane(Arc::new(plane));

        let first = selector.select(None).await?;
        assert_eq!(first.scope, StoreScope::Global);

        let second = selector.reselect(&first, "t2").await?;
        assert_eq!(second.scope, StoreScope::Tenant);
        assert_eq!(second.slug(), Some("globex"));
        assert_eq!(second.tenant.as_ref().map(|t| t.id.as_str()), Some("t2"));

        // unknown tenant keeps the current selection
        let third = selector.reselect(&second, "t9").await?;
        assert_eq!(third.slug(), Some("globex"));
        Ok(())
    }
}
