//! In-memory repositories for development and tests.

use anyhow::{Result, anyhow};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    BoxFuture, BulkRevokeOutcome, ClientRepository, RbacRepository, RefreshTokenRepository,
    RotateOutcome, UserRepository,
    models::{Client, RefreshToken, User},
};

#[derive(Default)]
struct State {
    // keyed by `Client::id`
    clients: HashMap<String, Client>,
    users: HashMap<String, User>,
    user_roles: HashMap<String, BTreeSet<String>>,
    user_perms: HashMap<String, BTreeSet<String>>,
    role_perms: HashMap<String, BTreeSet<String>>,
    // keyed by `RefreshToken::hash`
    refresh_tokens: HashMap<String, RefreshToken>,
}

/// All repositories behind one lock, so rotation is trivially atomic.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every refresh token row, for inspection in tests.
    pub async fn refresh_tokens(&self) -> Vec<RefreshToken> {
        let state = self.state.lock().await;
        state.refresh_tokens.values().cloned().collect()
    }
}

impl ClientRepository for MemoryStore {
    fn get_by_client_id<'a>(&'a self, client_id: &'a str) -> BoxFuture<'a, Result<Option<Client>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .clients
                .values()
                .find(|client| client.client_id == client_id)
                .cloned())
        })
    }

    fn get_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<Client>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.clients.get(id).cloned())
        })
    }

    fn list<'a>(&'a self, tenant_id: &'a str) -> BoxFuture<'a, Result<Vec<Client>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            let mut clients: Vec<Client> = state
                .clients
                .values()
                .filter(|client| client.tenant_id == tenant_id)
                .cloned()
                .collect();
            clients.sort_by(|a, b| a.client_id.cmp(&b.client_id));
            Ok(clients)
        })
    }

    fn create<'a>(&'a self, client: &'a Client) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let duplicate = state.clients.values().any(|existing| {
                existing.tenant_id == client.tenant_id && existing.client_id == client.client_id
            });
            if duplicate || state.clients.contains_key(&client.id) {
                return Err(anyhow!("client {} already exists", client.client_id));
            }
            state.clients.insert(client.id.clone(), client.clone());
            Ok(())
        })
    }

    fn update<'a>(&'a self, client: &'a Client) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            match state.clients.get_mut(&client.id) {
                Some(existing) => {
                    *existing = client.clone();
                    Ok(true)
                }
                None => Ok(false),
            }
        })
    }

    fn delete<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            Ok(state.clients.remove(id).is_some())
        })
    }
}

impl UserRepository for MemoryStore {
    fn get_by_id<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Option<User>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.users.get(id).cloned())
        })
    }

    fn get_by_email<'a>(
        &'a self,
        tenant_id: &'a str,
        email: &'a str,
    ) -> BoxFuture<'a, Result<Option<User>>> {
        Box::pin(async move {
            let email = email.trim().to_lowercase();
            let state = self.state.lock().await;
            Ok(state
                .users
                .values()
                .find(|user| user.tenant_id == tenant_id && user.email.to_lowercase() == email)
                .cloned())
        })
    }

    fn create<'a>(&'a self, user: &'a User) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let email = user.email.to_lowercase();
            let duplicate = state.users.values().any(|existing| {
                existing.tenant_id == user.tenant_id && existing.email.to_lowercase() == email
            });
            if duplicate || state.users.contains_key(&user.id) {
                return Err(anyhow!("user {} already exists", user.id));
            }
            state.users.insert(user.id.clone(), user.clone());
            Ok(())
        })
    }
}

fn sorted(set: Option<&BTreeSet<String>>) -> Vec<String> {
    set.map(|values| values.iter().cloned().collect())
        .unwrap_or_default()
}

impl RbacRepository for MemoryStore {
    fn get_user_roles<'a>(&'a self, user_id: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(sorted(state.user_roles.get(user_id)))
        })
    }

    fn get_user_permissions<'a>(
        &'a self,
        user_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(sorted(state.user_perms.get(user_id)))
        })
    }

    fn get_role_perms<'a>(&'a self, role: &'a str) -> BoxFuture<'a, Result<Vec<String>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(sorted(state.role_perms.get(role)))
        })
    }

    fn add_user_role<'a>(&'a self, user_id: &'a str, role: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state
                .user_roles
                .entry(user_id.to_string())
                .or_default()
                .insert(role.to_string());
            Ok(())
        })
    }

    fn remove_user_role<'a>(
        &'a self,
        user_id: &'a str,
        role: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if let Some(roles) = state.user_roles.get_mut(user_id) {
                roles.remove(role);
            }
            Ok(())
        })
    }

    fn add_user_permission<'a>(
        &'a self,
        user_id: &'a str,
        perm: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state
                .user_perms
                .entry(user_id.to_string())
                .or_default()
                .insert(perm.to_string());
            Ok(())
        })
    }

    fn remove_user_permission<'a>(
        &'a self,
        user_id: &'a str,
        perm: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if let Some(perms) = state.user_perms.get_mut(user_id) {
                perms.remove(perm);
            }
            Ok(())
        })
    }

    fn add_role_permission<'a>(
        &'a self,
        role: &'a str,
        perm: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state
                .role_perms
                .entry(role.to_string())
                .or_default()
                .insert(perm.to_string());
            Ok(())
        })
    }

    fn remove_role_permission<'a>(
        &'a self,
        role: &'a str,
        perm: &'a str,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if let Some(perms) = state.role_perms.get_mut(role) {
                perms.remove(perm);
            }
            Ok(())
        })
    }
}

impl RefreshTokenRepository for MemoryStore {
    fn create<'a>(&'a self, token: &'a RefreshToken) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if state.refresh_tokens.contains_key(&token.hash) {
                return Err(anyhow!("refresh token hash collision"));
            }
            state
                .refresh_tokens
                .insert(token.hash.clone(), token.clone());
            Ok(())
        })
    }

    fn get_by_hash<'a>(&'a self, hash: &'a str) -> BoxFuture<'a, Result<Option<RefreshToken>>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state.refresh_tokens.get(hash).cloned())
        })
    }

    fn revoke_by_id<'a>(&'a self, id: Uuid) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            if let Some(token) = state
                .refresh_tokens
                .values_mut()
                .find(|token| token.id == id)
            {
                if token.revoked_at.is_none() {
                    token.revoked_at = Some(now);
                }
            }
            Ok(())
        })
    }

    fn rotate<'a>(
        &'a self,
        old_hash: &'a str,
        new_token: &'a RefreshToken,
    ) -> BoxFuture<'a, Result<RotateOutcome>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            if state.refresh_tokens.contains_key(&new_token.hash) {
                return Err(anyhow!("refresh token hash collision"));
            }
            let Some(old) = state.refresh_tokens.get_mut(old_hash) else {
                return Ok(RotateOutcome::Conflict);
            };
            if !old.is_active(now) {
                return Ok(RotateOutcome::Conflict);
            }
            old.revoked_at = Some(now);
            state
                .refresh_tokens
                .insert(new_token.hash.clone(), new_token.clone());
            Ok(RotateOutcome::Rotated(new_token.id))
        })
    }

    fn has_children<'a>(&'a self, id: Uuid) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            let state = self.state.lock().await;
            Ok(state
                .refresh_tokens
                .values()
                .any(|token| token.parent_id == Some(id)))
        })
    }

    fn revoke_all_for_subject<'a>(
        &'a self,
        subject_id: &'a str,
        client_id: Option<&'a str>,
    ) -> BoxFuture<'a, Result<BulkRevokeOutcome>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            let mut revoked = 0;
            for token in state.refresh_tokens.values_mut() {
                let matches = token.subject_id == subject_id
                    && client_id.is_none_or(|client_id| token.client_id == client_id);
                if matches && token.revoked_at.is_none() {
                    token.revoked_at = Some(now);
                    revoked += 1;
                }
            }
            Ok(BulkRevokeOutcome::Revoked(revoked))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oauth::scope::ScopeSet;
    use crate::store::models::RefreshGrant;
    use chrono::Duration;
    use std::sync::Arc;

    fn grant(client_id: &str, parent_id: Option<Uuid>) -> RefreshGrant {
        RefreshGrant {
            tenant_id: "t1".to_string(),
            client_id: client_id.to_string(),
            subject_id: "u1".to_string(),
            scope: ScopeSet::from_tokens(["openid"]),
            ttl: Duration::days(1),
            parent_id,
        }
    }

    #[tokio::test]
    async fn revoke_by_id_is_idempotent() -> Result<()> {
        let store = MemoryStore::new();
        let (_, token) = RefreshToken::issue(grant("c1", None), Utc::now())?;
        RefreshTokenRepository::create(&store, &token).await?;

        store.revoke_by_id(token.id).await?;
        let first = store.get_by_hash(&token.hash).await?.and_then(|t| t.revoked_at);
        assert!(first.is_some());

        store.revoke_by_id(token.id).await?;
        let second = store.get_by_hash(&token.hash).await?.and_then(|t| t.revoked_at);
        assert_eq!(first, second);

        // unknown ids are not an error
        store.revoke_by_id(Uuid::new_v4()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn rotate_revokes_parent_and_links_child() -> Result<()> {
        let store = MemoryStore::new();
        let (_, old) = RefreshToken::issue(grant("c1", None), Utc::now())?;
        RefreshTokenRepository::create(&store, &old).await?;
        let (_, new) = RefreshToken::issue(grant("c1", Some(old.id)), Utc::now())?;

        let outcome = store.rotate(&old.hash, &new).await?;
        assert_eq!(outcome, RotateOutcome::Rotated(new.id));
        assert!(store.has_children(old.id).await?);

        let old_row = store.get_by_hash(&old.hash).await?;
        assert!(old_row.is_some_and(|row| row.revoked_at.is_some()));

        let (_, again) = RefreshToken::issue(grant("c1", Some(old.id)), Utc::now())?;
        assert_eq!(store.rotate(&old.hash, &again).await?, RotateOutcome::Conflict);
        assert!(store.get_by_hash(&again.hash).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_rotation_has_one_winner() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let (_, old) = RefreshToken::issue(grant("c1", None), Utc::now())?;
        RefreshTokenRepository::create(store.as_ref(), &old).await?;

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            let old_hash = old.hash.clone();
            let (_, new) = RefreshToken::issue(grant("c1", Some(old.id)), Utc::now())?;
            handles.push(tokio::spawn(async move {
                store.rotate(&old_hash, &new).await
            }));
        }

        let mut rotated = 0;
        for handle in handles {
            if let RotateOutcome::Rotated(_) = handle.await?? {
                rotated += 1;
            }
        }
        assert_eq!(rotated, 1);
        Ok(())
    }

    #[tokio::test]
    async fn bulk_revoke_narrows_by_client() -> Result<()> {
        let store = MemoryStore::new();
        let (_, c1) = RefreshToken::issue(grant("c1", None), Utc::now())?;
        let (_, c2) = RefreshToken::issue(grant("c2", None), Utc::now())?;
        RefreshTokenRepository::create(&store, &c1).await?;
        RefreshTokenRepository::create(&store, &c2).await?;

        let outcome = store.revoke_all_for_subject("u1", Some("c1")).await?;
        assert_eq!(outcome, BulkRevokeOutcome::Revoked(1));

        let now = Utc::now();
        assert!(store
            .get_by_hash(&c1.hash)
            .await?
            .is_some_and(|row| !row.is_active(now)));
        assert!(store
            .get_by_hash(&c2.hash)
            .await?
            .is_some_and(|row| row.is_active(now)));
        Ok(())
    }

    #[tokio::test]
    async fn user_email_lookup_is_case_insensitive() -> Result<()> {
        let store = MemoryStore::new();
        let user = User {
            id: "u1".to_string(),
            tenant_id: "t1".to_string(),
            email: "Alice@Example.com".to_string(),
            email_verified: true,
            metadata: serde_json::Map::new(),
            password_hash: None,
            created_at: Utc::now(),
        };
        UserRepository::create(&store, &user).await?;
        assert!(store.get_by_email("t1", "alice@example.com").await?.is_some());
        assert!(store.get_by_email("t2", "alice@example.com").await?.is_none());

        let mut duplicate = user.clone();
        duplicate.id = "u2".to_string();
        duplicate.email = "ALICE@example.com".to_string();
        assert!(UserRepository::create(&store, &duplicate).await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn rbac_add_and_remove() -> Result<()> {
        let store = MemoryStore::new();
        store.add_user_role("u1", "admin").await?;
        store.add_user_permission("u1", "users:read").await?;
        store.add_role_permission("admin", "users:write").await?;
        assert_eq!(store.get_user_roles("u1").await?, vec!["admin".to_string()]);
        assert_eq!(store.get_role_perms("admin").await?, vec!["users:write".to_string()]);

        store.remove_user_role("u1", "admin").await?;
        store.remove_user_permission("u1", "users:read").await?;
        store.remove_role_permission("admin", "users:write").await?;
        assert!(store.get_user_roles("u1").await?.is_empty());
        assert!(store.get_user_permissions("u1").await?.is_empty());
        assert!(store.get_role_perms("admin").await?.is_empty());
        Ok(())
    }
}
