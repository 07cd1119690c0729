// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache-aside reads on the shared store with stampede protection.
//!
//! | Strategy | Call | Protects against |
//! |---|---|---|
//! | pass-through + null marker | [`CacheEngine::get_or_load`] | penetration, avalanche (TTL jitter) |
//! | mutex reload | [`CacheEngine::get_or_load_exclusive`] | breakdown of one hot key |
//! | logical expiry | [`CacheEngine::get_logical`] | breakdown, with zero added read latency |
//!
//! Values are stored as JSON. A null marker (empty string) records "the
//! backing source has nothing here" for a short TTL.

mod engine;
mod envelope;

use std::time::Duration;

use thiserror::Error;

pub use engine::CacheEngine;
pub use envelope::LogicalEnvelope;

use crate::config::ClaimEngineConfig;
use crate::storage::traits::StorageError;

/// Stored in place of a value the loader could not find.
pub const NULL_MARKER: &str = "";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StorageError),

    #[error("cache value for '{key}' could not be (de)serialized: {reason}")]
    Serialization { key: String, reason: String },

    #[error("loader for '{key}' failed: {reason}")]
    Loader { key: String, reason: String },

    /// Mutex reload gave up waiting for another caller's rebuild.
    #[error("gave up on '{key}' after {attempts} lock attempts")]
    Contended { key: String, attempts: u32 },
}

/// TTLs and lock timing for one [`CacheEngine`].
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub base_ttl: Duration,
    /// Random extra TTL, uniform in `0..=ttl_jitter`
    pub ttl_jitter: Duration,
    pub null_ttl: Duration,
    pub logical_expire: Duration,
    /// Physical TTL on logical-expiry entries; `None` keeps them until overwritten
    pub logical_physical_ttl: Option<Duration>,
    pub lock_lease: Duration,
    pub lock_retry_delay: Duration,
    pub lock_max_retries: u32,
    pub rebuild_concurrency: usize,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::from_config(&ClaimEngineConfig::default())
    }
}

impl CachePolicy {
    #[must_use]
    pub fn from_config(config: &ClaimEngineConfig) -> Self {
        Self {
            base_ttl: Duration::from_secs(config.cache_ttl_secs),
            ttl_jitter: Duration::from_secs(config.cache_ttl_jitter_secs),
            null_ttl: Duration::from_secs(config.null_ttl_secs),
            logical_expire: Duration::from_secs(config.logical_expire_secs),
            logical_physical_ttl: config.logical_physical_ttl_secs.map(Duration::from_secs),
            lock_lease: config.lock_lease(),
            lock_retry_delay: Duration::from_millis(config.lock_retry_delay_ms),
            lock_max_retries: config.lock_max_retries,
            rebuild_concurrency: config.rebuild_concurrency.max(1),
        }
    }

    /// Null markers must expire before real entries would.
    #[must_use]
    pub fn effective_null_ttl(&self) -> Duration {
        if self.null_ttl < self.base_ttl {
            self.null_ttl
        } else {
            self.base_ttl / 2
        }
    }
}
