//! Repository seams for tenant-owned data.
//!
//! Every repository has an in-memory backend (tests and development) and a
//! Postgres backend. Handlers never talk to a backend directly; they receive a
//! [`StoreHandle`] picked by the active store selector.

use anyhow::Result;
use sqlx::PgPool;
use std::{future::Future, pin::Pin, sync::Arc};
use uuid::Uuid;

pub mod memory;
pub mod models;
pub mod postgres;

use models::{Client, RefreshToken, User};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of an atomic refresh token rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateOutcome {
    /// The old token was revoked and the new one persisted; carries the new id.
    Rotated(Uuid),
    /// The old token was no longer active (revoked, expired or missing).
    Conflict,
}

/// Result of revoking every refresh token of a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkRevokeOutcome {
    Revoked(u64),
    Unsupported,
}

pub trait ClientRepository: Send + Sync {
    fn get_by_client_id<'a>(&'a self, client_id: &'a str) -> BoxFuture<'a, Result<Option<Client>>>;
    fn get_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Client>>>;
    fn list<'a>(&'a self, tenant_id: &'a str) -> BoxFuture<'a, Result<Vec<Client>>>;
    fn create<'a>(&'a self, client: &'a Client) -> BoxFuture<'a, Result<()>>;
    fn update<'a>(&'a self, client: &'a Client) -> BoxFuture<'a, Result<bool>>;
    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<bool>>;
}

pub trait UserRepository: Send + Sync {
    fn get_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<User>>>;
    /// Case-insensitive lookup inside one tenant.
    fn get_by_email<'a>(
        &'a self,
        tenant_id: &'a str,
        email: &'a str,
    ) -> BoxFuture<'a, Result<Option<User>>>;
    fn create<'a>(&'a self, user: &'a User) -> BoxFuture<'a, Result<()>>;
}

pub trait RbacRepository: Send + Sync {
    fn get_user_roles<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<Vec<String>>>;
    fn get_user_permissions<'a>(&'a self, user_id: &'a str)
    -> BoxFuture<'a, Result<Vec<String>>>;
    fn get_role_perms<'a>(&'a self, role: &'a str) -> BoxFuture<'a, Result<Vec<String>>>;
    fn add_user_role<'a>(&'a self, user_id: &'a str, role: &'a str) -> BoxFuture<'a, Result<()>>;
    fn remove_user_role<'a>(&'a self, user_id: &'a str, role: &'a str)
    -> BoxFuture<'a, Result<()>>;
    fn add_user_permission<'a>(
        &'a self,
        user_id: &'a str,
        perm: &'a str,
    ) -> BoxFuture<'a, Result<()>>;
    fn remove_user_permission<'a>(
        &'a self,
        user_id: &'a str,
        perm: &'a str,
    ) -> BoxFuture<'a, Result<()>>;
    fn add_role_permission<'a>(&'a self, role: &'a str, perm: &'a str)
    -> BoxFuture<'a, Result<()>>;
    fn remove_role_permission<'a>(
        &'a self,
        role: &'a str,
        perm: &'a str,
    ) -> BoxFuture<'a, Result<()>>;
}

pub trait RefreshTokenRepository: Send + Sync {
    fn create<'a>(&'a self, token: &'a RefreshToken) -> BoxFuture<'a, Result<()>>;
    fn get_by_hash<'a>(&'a self, hash: &'a str) -> BoxFuture<'a, Result<Option<RefreshToken>>>;
    /// Idempotent: an already revoked token keeps its original `revoked_at`.
    fn revoke_by_id<'a>(&'a self, id: Uuid) -> BoxFuture<'a, Result<()>>;
    /// Revoke `old_hash` and persist `new_token` as one atomic step.
    fn rotate<'a>(
        &'a self,
        old_hash: &'a str,
        new_token: &'a RefreshToken,
    ) -> BoxFuture<'a, Result<RotateOutcome>>;
    fn has_children<'a>(&'a self, id: Uuid) -> BoxFuture<'a, Result<bool>>;

    fn revoke_all_for_subject<'a>(
        &'a self,
        _subject_id: &'a str,
        _client_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<BulkRevokeOutcome>> {
        Box::pin(async { Ok(BulkRevokeOutcome::Unsupported) })
    }
}

#[derive(Clone, Debug)]
pub enum Backend {
    Memory,
    Postgres(PgPool),
}

/// One tenant's (or the global) set of repositories.
#[derive(Clone)]
pub struct StoreHandle {
    pub clients: Arc<dyn ClientRepository>,
    pub users: Arc<dyn UserRepository>,
    pub rbac: Arc<dyn RbacRepository>,
    pub refresh_tokens: Arc<dyn RefreshTokenRepository>,
    backend: Backend,
}

impl StoreHandle {
    #[must_use]
    pub fn memory() -> Self {
        Self::from_memory(Arc::new(memory::MemoryStore::default()))
    }

    #[must_use]
    pub fn from_memory(store: Arc<memory::MemoryStore>) -> Self {
        Self {
            clients: store.clone(),
            users: store.clone(),
            rbac: store.clone(),
            refresh_tokens: store,
            backend: Backend::Memory,
        }
    }

    #[must_use]
    pub fn postgres(pool: PgPool) -> Self {
        let store = Arc::new(postgres::PgStore::new(pool.clone()));
        Self {
            clients: store.clone(),
            users: store.clone(),
            rbac: store.clone(),
            refresh_tokens: store,
            backend: Backend::Postgres(pool),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &Backend {
        &self.backend
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}
