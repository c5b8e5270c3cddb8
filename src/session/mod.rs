//! Browser sessions backed by the shared session cache.
//!
//! The raw sid only ever lives in the cookie; the cache key is
//! `sid:<hash_token(raw)>`.

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::hash::{generate_token, hash_token};

pub mod cache;
pub mod password;

pub use cache::{MemorySessionCache, PgSessionCache, SessionCache};

#[must_use]
pub fn session_key(raw_sid: &str) -> String {
    format!("sid:{}", hash_token(raw_sid))
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub sid_hash: String,
    pub subject_id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub client_id: Option<String>,
    pub amr: Vec<String>,
    #[serde(default)]
    pub acr: Option<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub idle_expires_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    #[must_use]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at && self.idle_expires_at.is_none_or(|idle| now < idle)
    }
}

/// Who a new session belongs to.
#[derive(Clone, Debug)]
pub struct NewSession {
    pub subject_id: String,
    pub tenant_id: String,
    pub client_id: Option<String>,
    pub amr: Vec<String>,
    pub acr: Option<String>,
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// The cache refused the write.
    #[error("session store unavailable")]
    Unavailable(#[source] anyhow::Error),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Clone)]
pub struct SessionManager {
    cache: Arc<dyn SessionCache>,
    ttl: Duration,
    idle_ttl: Option<Duration>,
}

impl SessionManager {
    #[must_use]
    pub fn new(cache: Arc<dyn SessionCache>, ttl: Duration) -> Self {
        Self {
            cache,
            ttl,
            idle_ttl: None,
        }
    }

    #[must_use]
    pub fn with_idle_ttl(mut self, idle_ttl: Option<Duration>) -> Self {
        self.idle_ttl = idle_ttl;
        self
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<dyn SessionCache> {
        &self.cache
    }

    /// Persist a new session and return the raw sid for the cookie.
    ///
    /// # Errors
    /// `Internal` if entropy fails, `Unavailable` if the cache write fails.
    pub async fn create(
        &self,
        session: NewSession,
    ) -> Result<(String, SessionRecord), SessionError> {
        let raw = generate_token()?;
        let now = Utc::now();
        let record = SessionRecord {
            sid_hash: hash_token(&raw),
            subject_id: session.subject_id,
            tenant_id: session.tenant_id,
            client_id: session.client_id,
            amr: session.amr,
            acr: session.acr,
            issued_at: now,
            expires_at: now + self.ttl,
            idle_expires_at: self.idle_ttl.map(|idle| now + idle),
        };
        self.write(&record, now).await?;
        Ok((raw, record))
    }

    /// Resolve a raw sid. Cache read errors count as a miss; a successful
    /// lookup slides the idle expiry.
    pub async fn load(&self, raw_sid: &str) -> Option<SessionRecord> {
        let key = session_key(raw_sid);
        let value = match self.cache.get(&key).await {
            Ok(Some(value)) => value,
            Ok(None) => return None,
            Err(err) => {
                warn!("Session cache read failed, treating as miss: {err:#}");
                return None;
            }
        };
        let mut record: SessionRecord = match serde_json::from_str(&value) {
            Ok(record) => record,
            Err(err) => {
                warn!("Discarding undecodable session record: {err}");
                return None;
            }
        };

        let now = Utc::now();
        if !record.is_live(now) {
            debug!("Session {} expired", record.sid_hash);
            if let Err(err) = self.cache.delete(&key).await {
                warn!("Failed to delete expired session: {err:#}");
            }
            return None;
        }

        if let Some(idle) = self.idle_ttl {
            record.idle_expires_at = Some((now + idle).min(record.expires_at));
            if let Err(err) = self.write(&record, now).await {
                warn!("Failed to slide session idle expiry: {err}");
            }
        }
        Some(record)
    }

    /// Remove the session; a missing entry is not an error.
    ///
    /// # Errors
    /// Returns an error if the cache delete fails.
    pub async fn destroy(&self, raw_sid: &str) -> anyhow::Result<()> {
        self.cache
            .delete(&session_key(raw_sid))
            .await
            .context("failed to delete session")
    }

    async fn write(&self, record: &SessionRecord, now: DateTime<Utc>) -> Result<(), SessionError> {
        let value = serde_json::to_string(record).context("failed to encode session record")?;
        let ttl = (record.expires_at - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        self.cache
            .set(&format!("sid:{}", record.sid_hash), &value, ttl)
            .await
            .map_err(SessionError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::BoxFuture;

    fn new_session() -> NewSession {
        NewSession {
            subject_id: "u1".to_string(),
            tenant_id: "t1".to_string(),
            client_id: Some("c1".to_string()),
            amr: vec!["pwd".to_string()],
            acr: None,
        }
    }

    struct BrokenCache;

    impl SessionCache for BrokenCache {
        fn set<'a>(
            &'a self,
            _key: &'a str,
            _value: &'a str,
            _ttl: std::time::Duration,
        ) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async { Err(anyhow::anyhow!("cache down")) })
        }

        fn get<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, anyhow::Result<Option<String>>> {
            Box::pin(async { Err(anyhow::anyhow!("cache down")) })
        }

        fn delete<'a>(&'a self, _key: &'a str) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async { Err(anyhow::anyhow!("cache down")) })
        }
    }

    #[test]
    fn session_key_uses_token_hash() {
        assert_eq!(session_key("R"), format!("sid:{}", hash_token("R")));
    }

    #[tokio::test]
    async fn create_load_destroy() -> anyhow::Result<()> {
        let cache = Arc::new(MemorySessionCache::new());
        let manager = SessionManager::new(cache.clone(), Duration::hours(1));
        let (raw, record) = manager.create(new_session()).await?;

        assert_eq!(record.sid_hash, hash_token(&raw));
        assert!(cache.get(&session_key(&raw)).await?.is_some());
        assert_eq!(manager.load(&raw).await, Some(record));

        manager.destroy(&raw).await?;
        assert!(manager.load(&raw).await.is_none());
        assert!(cache.get(&session_key(&raw)).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn idle_expiry_slides() -> anyhow::Result<()> {
        let manager = SessionManager::new(Arc::new(MemorySessionCache::new()), Duration::hours(1))
            .with_idle_ttl(Some(Duration::minutes(5)));
        let (raw, created) = manager.create(new_session()).await?;
        let loaded = manager.load(&raw).await;
        let slid = loaded.and_then(|record| record.idle_expires_at);
        assert!(slid >= created.idle_expires_at);
        Ok(())
    }

    #[tokio::test]
    async fn expired_record_is_absent() -> anyhow::Result<()> {
        let cache = Arc::new(MemorySessionCache::new());
        let manager = SessionManager::new(cache.clone(), Duration::hours(1));
        let now = Utc::now();
        let stale = SessionRecord {
            sid_hash: hash_token("old"),
            subject_id: "u1".to_string(),
            tenant_id: "t1".to_string(),
            client_id: None,
            amr: vec![],
            acr: None,
            issued_at: now - Duration::hours(2),
            expires_at: now + Duration::hours(1),
            idle_expires_at: Some(now - Duration::minutes(1)),
        };
        cache
            .set(
                &session_key("old"),
                &serde_json::to_string(&stale)?,
                std::time::Duration::from_secs(3600),
            )
            .await?;
        assert!(manager.load("old").await.is_none());
        assert!(cache.get(&session_key("old")).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn cache_failures_follow_policy() {
        let manager = SessionManager::new(Arc::new(BrokenCache), Duration::hours(1));
        assert!(matches!(
            manager.create(new_session()).await,
            Err(SessionError::Unavailable(_))
        ));
        // read errors are a miss, not a failure
        assert!(manager.load("anything").await.is_none());
    }
}
