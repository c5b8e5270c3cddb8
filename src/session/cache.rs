//! Key/value cache holding server-side session records.

use anyhow::{Context, Result};
use sqlx::{PgPool, Row};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::Instrument;

use crate::store::{BoxFuture, postgres::query_span};

pub trait SessionCache: Send + Sync {
    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> BoxFuture<'a, Result<()>>;
    /// Expired keys read as absent.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>>;
    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Process-local cache; only suitable for a single instance.
#[derive(Default)]
pub struct MemorySessionCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemorySessionCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionCache for MemorySessionCache {
    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            let now = Instant::now();
            entries.retain(|_, (_, expires_at)| *expires_at > now);
            entries.insert(key.to_string(), (value.to_string(), now + ttl));
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let entries = self.entries.lock().await;
            Ok(entries
                .get(key)
                .filter(|(_, expires_at)| *expires_at > Instant::now())
                .map(|(value, _)| value.clone()))
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.entries.lock().await.remove(key);
            Ok(())
        })
    }
}

/// Cache shared across instances through the `session_cache` table.
#[derive(Clone, Debug)]
pub struct PgSessionCache {
    pool: PgPool,
}

impl PgSessionCache {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl SessionCache for PgSessionCache {
    fn set<'a>(&'a self, key: &'a str, value: &'a str, ttl: Duration) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let query = r"
                INSERT INTO session_cache (key, value, expires_at)
                VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 second'))
                ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
            ";
            let seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
            sqlx::query(query)
                .bind(key)
                .bind(value)
                .bind(seconds)
                .execute(&self.pool)
                .instrument(query_span("INSERT", query))
                .await
                .context("failed to write session cache entry")?;
            Ok(())
        })
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let query = "SELECT value FROM session_cache WHERE key = $1 AND expires_at > NOW()";
            let row = sqlx::query(query)
                .bind(key)
                .fetch_optional(&self.pool)
                .instrument(query_span("SELECT", query))
                .await
                .context("failed to read session cache entry")?;
            row.map(|row| row.try_get::<String, _>("value"))
                .transpose()
                .map_err(anyhow::Error::from)
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let query = "DELETE FROM session_cache WHERE key = $1";
            sqlx::query(query)
                .bind(key)
                .execute(&self.pool)
                .instrument(query_span("DELETE", query))
                .await
                .context("failed to delete session cache entry")?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_cache_set_get_delete() -> Result<()> {
        let cache = MemorySessionCache::new();
        cache.set("sid:abc", "value", Duration::from_secs(60)).await?;
        assert_eq!(cache.get("sid:abc").await?, Some("value".to_string()));
        cache.delete("sid:abc").await?;
        assert_eq!(cache.get("sid:abc").await?, None);
        // deleting twice is fine
        cache.delete("sid:abc").await?;
        Ok(())
    }

    #[tokio::test]
    async fn memory_cache_honors_ttl() -> Result<()> {
        let cache = MemorySessionCache::new();
        cache.set("sid:gone", "value", Duration::ZERO).await?;
        assert_eq!(cache.get("sid:gone").await?, None);
        Ok(())
    }
}
