// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lease-based mutual exclusion on a single shared-store key.
//!
//! Acquire is `SET lock:{name} {token} PX lease NX`. Release deletes the key
//! only while it still holds the caller's token, so a holder whose lease ran
//! out can never delete the next owner's lock.
//!
//! Contention is a value (`Ok(None)`), not an error. Nothing here blocks or
//! retries; callers decide how to wait.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::storage::traits::{KvStore, StorageError};

pub const LOCK_KEY_PREFIX: &str = "lock:";

/// Proof of one successful acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub resource_name: String,
    /// Unique per acquisition: process instance id plus a sequence number
    pub owner_token: String,
    pub lease: Duration,
}

impl LockHandle {
    fn key(&self) -> String {
        format!("{}{}", LOCK_KEY_PREFIX, self.resource_name)
    }
}

#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KvStore>,
    instance_id: Arc<str>,
    seq: Arc<AtomicU64>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self {
            store,
            instance_id: Uuid::new_v4().to_string().into(),
            seq: Arc::new(AtomicU64::new(0)),
        }
    }

    fn next_token(&self) -> String {
        format!("{}-{}", self.instance_id, self.seq.fetch_add(1, Ordering::Relaxed))
    }

    /// One attempt. `Ok(None)` means someone else holds the lock.
    pub async fn try_acquire(&self, resource_name: &str, lease: Duration) -> Result<Option<LockHandle>, StorageError> {
        let handle = LockHandle {
            resource_name: resource_name.to_string(),
            owner_token: self.next_token(),
            lease,
        };

        if self.store.set_nx(&handle.key(), &handle.owner_token, lease).await? {
            debug!(lock = %resource_name, "Lock acquired");
            crate::metrics::record_lock("acquired");
            Ok(Some(handle))
        } else {
            crate::metrics::record_lock("contended");
            Ok(None)
        }
    }

    /// Release if still owned. Returns whether the key was deleted; a
    /// mismatch (lease expired, someone else owns it now) is a silent no-op.
    pub async fn release(&self, handle: &LockHandle) -> Result<bool, StorageError> {
        let deleted = self.store.delete_if_equals(&handle.key(), &handle.owner_token).await?;
        if deleted {
            crate::metrics::record_lock("released");
        } else {
            debug!(lock = %handle.resource_name, "Lock no longer ours, release skipped");
            crate::metrics::record_lock("stale_release");
        }
        Ok(deleted)
    }

    /// Like [`try_acquire`](Self::try_acquire) but the returned guard
    /// releases the lock when dropped.
    pub async fn try_lock(&self, resource_name: &str, lease: Duration) -> Result<Option<LockGuard>, StorageError> {
        Ok(self
            .try_acquire(resource_name, lease)
            .await?
            .map(|handle| LockGuard { lock: self.clone(), handle: Some(handle) }))
    }
}

/// Scoped lock ownership. Dropping the guard (including on early return,
/// `?` or task cancellation) spawns the release on the current runtime.
pub struct LockGuard {
    lock: DistributedLock,
    handle: Option<LockHandle>,
}

impl LockGuard {
    #[must_use]
    pub fn handle(&self) -> Option<&LockHandle> {
        self.handle.as_ref()
    }

    /// Release now and wait for the result.
    pub async fn release(mut self) -> Result<bool, StorageError> {
        match self.handle.take() {
            Some(handle) => self.lock.release(&handle).await,
            None => Ok(false),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let lock = self.lock.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = lock.release(&handle).await {
                        warn!(lock = %handle.resource_name, error = %e, "Failed to release lock, lease will expire");
                    }
                });
            }
            Err(_) => {
                warn!(lock = %handle.resource_name, "No runtime to release lock, lease will expire");
            }
        }
    }
}
