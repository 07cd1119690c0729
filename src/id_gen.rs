// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Globally unique, increasing 64-bit ids.
//!
//! ```text
//!  63                           32 31                            0
//! ┌───────────────────────────────┬───────────────────────────────┐
//! │   seconds since the epoch     │  per-namespace per-day count  │
//! └───────────────────────────────┴───────────────────────────────┘
//! ```
//!
//! The counter lives in the shared store under `inc:{namespace}:{yyyy:mm:dd}`
//! (UTC day), so every process draws from the same sequence and a day's
//! volume can be read straight off the key.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::storage::traits::{KvStore, StorageError};

pub const COUNT_BITS: u32 = 32;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

pub struct IdGenerator {
    store: Arc<dyn KvStore>,
    epoch_secs: i64,
}

impl IdGenerator {
    pub fn new(store: Arc<dyn KvStore>, epoch_secs: i64) -> Self {
        Self { store, epoch_secs }
    }

    /// Next id in `namespace`. Fails with [`StorageError::Unavailable`] if the
    /// store cannot be reached; no id is ever made up locally.
    pub async fn next_id(&self, namespace: &str) -> Result<u64, StorageError> {
        self.next_id_at(namespace, Utc::now()).await
    }

    pub(crate) async fn next_id_at(&self, namespace: &str, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let elapsed = now.timestamp() - self.epoch_secs;
        let elapsed = u64::try_from(elapsed).map_err(|_| {
            StorageError::Backend(format!("clock is before the id epoch ({}s)", self.epoch_secs))
        })?;

        let key = counter_key(namespace, now);
        let count = self.store.incr(&key).await?;
        // INCR only yields a non-positive value if something else wrote the key
        let count = match u64::try_from(count) {
            Ok(count) if count > 0 => count,
            _ => {
                warn!(key = %key, count, "Id counter holds a non-positive value");
                return Err(StorageError::Protocol(format!("counter '{}' returned {}", key, count)));
            }
        };
        if count > COUNT_MASK {
            warn!(key = %key, count, "Id counter exhausted for today");
            return Err(StorageError::CounterOverflow { key });
        }

        crate::metrics::record_id_issued(namespace);
        Ok(compose(elapsed, count))
    }
}

pub fn counter_key(namespace: &str, now: DateTime<Utc>) -> String {
    format!("inc:{}:{}", namespace, now.format("%Y:%m:%d"))
}

#[inline]
#[must_use]
pub fn compose(elapsed_secs: u64, count: u64) -> u64 {
    (elapsed_secs << COUNT_BITS) | (count & COUNT_MASK)
}

/// Split an id back into (seconds since epoch, counter).
#[inline]
#[must_use]
pub fn decompose(id: u64) -> (u64, u64) {
    (id >> COUNT_BITS, id & COUNT_MASK)
}
