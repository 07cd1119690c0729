// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::{CacheError, CachePolicy, LogicalEnvelope, NULL_MARKER};
use crate::claim::now_millis;
use crate::lock::{DistributedLock, LockGuard};
use crate::storage::traits::KvStore;

enum Lookup<T> {
    Hit(T),
    Null,
    Miss,
}

/// Cache-aside engine. Cheap to clone; clones share the rebuild pool.
#[derive(Clone)]
pub struct CacheEngine {
    store: Arc<dyn KvStore>,
    lock: DistributedLock,
    policy: CachePolicy,
    rebuilds: Arc<Semaphore>,
}

impl CacheEngine {
    pub fn new(store: Arc<dyn KvStore>, lock: DistributedLock, policy: CachePolicy) -> Self {
        let rebuilds = Arc::new(Semaphore::new(policy.rebuild_concurrency.max(1)));
        Self {
            store,
            lock,
            policy,
            rebuilds,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    fn jittered(&self, ttl: Duration) -> Duration {
        let jitter_ms = u64::try_from(self.policy.ttl_jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return ttl;
        }
        ttl + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    fn encode<T: Serialize>(key: &str, value: &T) -> Result<String, CacheError> {
        serde_json::to_string(value).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<T, CacheError> {
        serde_json::from_str(raw).map_err(|e| CacheError::Serialization {
            key: key.to_string(),
            reason: e.to_string(),
        })
    }

    /// Write `value` with TTL `ttl` plus jitter.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<(), CacheError> {
        let raw = Self::encode(key, value)?;
        self.store.set(key, &raw, Some(self.jittered(ttl))).await?;
        Ok(())
    }

    /// Write `value` wrapped in a [`LogicalEnvelope`] that goes stale after `logical_ttl`.
    pub async fn set_with_logical_expire<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        logical_ttl: Duration,
    ) -> Result<(), CacheError> {
        let expire_at = now_millis() + i64::try_from(logical_ttl.as_millis()).unwrap_or(i64::MAX / 2);
        let raw = Self::encode(key, &LogicalEnvelope::new(value, expire_at))?;
        let physical = self.policy.logical_physical_ttl.map(|ttl| self.jittered(ttl));
        self.store.set(key, &raw, physical).await?;
        Ok(())
    }

    /// Pre-populate a key read through [`get_logical`](Self::get_logical).
    pub async fn warm<T: Serialize>(&self, key: &str, value: &T) -> Result<(), CacheError> {
        self.set_with_logical_expire(key, value, self.policy.logical_expire).await
    }

    /// Drop a cached entry, e.g. right after the backing row was updated.
    pub async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.store.delete(key).await?;
        Ok(())
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Lookup<T>, CacheError> {
        match self.store.get(key).await? {
            None => Ok(Lookup::Miss),
            Some(raw) if raw == NULL_MARKER => Ok(Lookup::Null),
            Some(raw) => Ok(Lookup::Hit(Self::decode(key, &raw)?)),
        }
    }

    async fn load_and_store<T, F, Fut, E>(&self, key: &str, strategy: &str, loader: F) -> Result<Option<T>, CacheError>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: Display,
    {
        let loaded = loader().await.map_err(|e| CacheError::Loader {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        match loaded {
            Some(value) => {
                self.set(key, &value, self.policy.base_ttl).await?;
                crate::metrics::record_cache_lookup(strategy, "loaded");
                Ok(Some(value))
            }
            None => {
                self.store
                    .set(key, NULL_MARKER, Some(self.policy.effective_null_ttl()))
                    .await?;
                debug!(key, "Backing source has no value, null marker stored");
                crate::metrics::record_cache_lookup(strategy, "null_stored");
                Ok(None)
            }
        }
    }

    /// Pass-through read with null caching.
    ///
    /// Hit returns the value, a null marker returns `None` without calling
    /// `loader`, a miss calls `loader` once and caches whatever it returns.
    pub async fn get_or_load<T, F, Fut, E>(&self, key: &str, loader: F) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: Display,
    {
        match self.read(key).await? {
            Lookup::Hit(value) => {
                crate::metrics::record_cache_lookup("pass_through", "hit");
                Ok(Some(value))
            }
            Lookup::Null => {
                crate::metrics::record_cache_lookup("pass_through", "null_hit");
                Ok(None)
            }
            Lookup::Miss => self.load_and_store(key, "pass_through", loader).await,
        }
    }

    /// Like [`get_or_load`](Self::get_or_load), but only one caller at a time
    /// runs the loader for `key`. The others poll the cache every
    /// `lock_retry_delay` and give up with [`CacheError::Contended`] after
    /// `lock_max_retries` failed lock attempts.
    pub async fn get_or_load_exclusive<T, F, Fut, E>(&self, key: &str, loader: F) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: Display,
    {
        let mut attempts = 0u32;
        let guard: LockGuard = loop {
            match self.read(key).await? {
                Lookup::Hit(value) => {
                    crate::metrics::record_cache_lookup("mutex", "hit");
                    return Ok(Some(value));
                }
                Lookup::Null => {
                    crate::metrics::record_cache_lookup("mutex", "null_hit");
                    return Ok(None);
                }
                Lookup::Miss => {}
            }

            if let Some(guard) = self.lock.try_lock(key, self.policy.lock_lease).await? {
                break guard;
            }
            attempts += 1;
            if attempts > self.policy.lock_max_retries {
                warn!(key, attempts, "Rebuild lock still held elsewhere, giving up");
                return Err(CacheError::Contended {
                    key: key.to_string(),
                    attempts,
                });
            }
            tokio::time::sleep(self.policy.lock_retry_delay).await;
        };

        // Another caller may have finished its rebuild between our read and the lock.
        let result = match self.read(key).await {
            Ok(Lookup::Hit(value)) => {
                crate::metrics::record_cache_lookup("mutex", "hit");
                Ok(Some(value))
            }
            Ok(Lookup::Null) => Ok(None),
            Ok(Lookup::Miss) => self.load_and_store(key, "mutex", loader).await,
            Err(e) => Err(e),
        };

        if let Err(e) = guard.release().await {
            warn!(key, error = %e, "Failed to release rebuild lock, lease will expire");
        }
        result
    }

    /// Stale-while-revalidate read for pre-warmed keys.
    ///
    /// Never waits on the loader. A fresh entry is returned as is; a stale one
    /// is returned too, and if this caller wins the rebuild lock a background
    /// task reloads and republishes it. A cold key returns `None`.
    pub async fn get_logical<T, F, Fut, E>(&self, key: &str, loader: F) -> Result<Option<T>, CacheError>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let raw = match self.store.get(key).await? {
            Some(raw) if raw != NULL_MARKER => raw,
            _ => {
                crate::metrics::record_cache_lookup("logical", "miss");
                return Ok(None);
            }
        };
        let envelope: LogicalEnvelope<T> = Self::decode(key, &raw)?;

        if !envelope.is_expired(now_millis()) {
            crate::metrics::record_cache_lookup("logical", "hit");
            return Ok(Some(envelope.data));
        }

        crate::metrics::record_cache_lookup("logical", "stale");
        match self.lock.try_lock(key, self.policy.lock_lease).await {
            Ok(Some(guard)) => self.spawn_rebuild::<T, F, Fut, E>(key, guard, loader),
            Ok(None) => debug!(key, "Rebuild already in progress"),
            // The stale value is still good to serve.
            Err(e) => warn!(key, error = %e, "Could not take rebuild lock"),
        }
        Ok(Some(envelope.data))
    }

    fn spawn_rebuild<T, F, Fut, E>(&self, key: &str, guard: LockGuard, loader: F)
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let this = self.clone();
        let key = key.to_string();
        crate::metrics::record_cache_rebuild("started");

        tokio::spawn(async move {
            let permit = this.rebuilds.clone().acquire_owned().await;
            if permit.is_ok() {
                match this.rebuild::<T, F, Fut, E>(&key, loader).await {
                    Ok(status) => {
                        debug!(key = %key, status, "Logical rebuild finished");
                        crate::metrics::record_cache_rebuild(status);
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Logical rebuild failed, stale value stays");
                        crate::metrics::record_cache_rebuild("failed");
                    }
                }
            }
            drop(permit);
            if let Err(e) = guard.release().await {
                warn!(key = %key, error = %e, "Failed to release rebuild lock, lease will expire");
            }
        });
    }

    async fn rebuild<T, F, Fut, E>(&self, key: &str, loader: F) -> Result<&'static str, CacheError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: Display,
    {
        if let Some(raw) = self.store.get(key).await? {
            if raw != NULL_MARKER {
                let current: LogicalEnvelope<T> = Self::decode(key, &raw)?;
                if !current.is_expired(now_millis()) {
                    return Ok("skipped");
                }
            }
        }

        let loaded = loader().await.map_err(|e| CacheError::Loader {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        match loaded {
            Some(value) => {
                self.set_with_logical_expire(key, &value, self.policy.logical_expire).await?;
                Ok("completed")
            }
            None => {
                // Source row is gone; serving the old copy forever would be wrong.
                self.store.delete(key).await?;
                Ok("removed")
            }
        }
    }
}
