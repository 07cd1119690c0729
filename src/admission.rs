// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Lock-free admission: one atomic check-and-decrement per attempt.
//!
//! Per resource the shared store holds two hashes:
//!
//! ```text
//! seckill:resource:{id}   stock / begin / end
//! seckill:claimants:{id}  client id -> claim id
//! ```
//!
//! [`AdmissionController::try_admit`] reads both, and only when the window is
//! open, stock is positive and the client has no recorded intent, decrements
//! stock and records the intent, all in one server-side step. Nothing else
//! writes these keys.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::claim::{now_millis, Resource};
use crate::storage::traits::{verdict_code, AdmissionKeys, KvStore, StorageError};

pub const RESOURCE_KEY_PREFIX: &str = "seckill:resource:";
pub const CLAIMANTS_KEY_PREFIX: &str = "seckill:claimants:";

/// Outcome of one admission attempt. Every variant is a normal result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Admitted,
    OutOfStock,
    DuplicateClient,
    NotStarted,
    Ended,
    UnknownResource,
}

impl Verdict {
    fn from_code(code: i64) -> Option<Self> {
        match code {
            verdict_code::ADMITTED => Some(Self::Admitted),
            verdict_code::OUT_OF_STOCK => Some(Self::OutOfStock),
            verdict_code::DUPLICATE_CLIENT => Some(Self::DuplicateClient),
            verdict_code::NOT_STARTED => Some(Self::NotStarted),
            verdict_code::ENDED => Some(Self::Ended),
            verdict_code::UNKNOWN_RESOURCE => Some(Self::UnknownResource),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admitted => "admitted",
            Self::OutOfStock => "out_of_stock",
            Self::DuplicateClient => "duplicate_client",
            Self::NotStarted => "not_started",
            Self::Ended => "ended",
            Self::UnknownResource => "unknown_resource",
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[must_use]
pub fn admission_keys(resource_id: u64) -> AdmissionKeys {
    AdmissionKeys {
        resource: format!("{}{}", RESOURCE_KEY_PREFIX, resource_id),
        claimants: format!("{}{}", CLAIMANTS_KEY_PREFIX, resource_id),
    }
}

pub struct AdmissionController {
    store: Arc<dyn KvStore>,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Seed stock and sale window. Re-registering resets stock but keeps
    /// recorded intents, so a restock never lets a client claim twice.
    pub async fn register(&self, resource: &Resource) -> Result<(), StorageError> {
        let keys = admission_keys(resource.resource_id);
        self.store
            .hset_multiple(
                &keys.resource,
                &[
                    ("stock", resource.stock.to_string()),
                    ("begin", resource.window_start.to_string()),
                    ("end", resource.window_end.to_string()),
                ],
            )
            .await?;
        debug!(resource_id = resource.resource_id, stock = resource.stock, "Resource registered for admission");
        Ok(())
    }

    /// One atomic attempt for `client_id` to take a unit of `resource_id`,
    /// recording `claim_id` as its intent on success.
    ///
    /// A store failure is returned as [`StorageError::Unavailable`] and not retried.
    pub async fn try_admit(&self, resource_id: u64, client_id: u64, claim_id: u64) -> Result<Verdict, StorageError> {
        let _timer = crate::metrics::LatencyTimer::new("admission", "try_admit");
        let keys = admission_keys(resource_id);

        let code = match self
            .store
            .admit(&keys, &client_id.to_string(), &claim_id.to_string(), now_millis())
            .await
        {
            Ok(code) => code,
            Err(e) => {
                warn!(resource_id, client_id, error = %e, "Admission failed, store unavailable");
                crate::metrics::record_admission("store_unavailable");
                return Err(e);
            }
        };

        let verdict = verdict_from_reply(code)?;
        debug!(resource_id, client_id, claim_id, verdict = %verdict, "Admission decided");
        crate::metrics::record_admission(verdict.as_str());
        Ok(verdict)
    }

    /// Units left in the shared store, `None` if never registered.
    pub async fn remaining_stock(&self, resource_id: u64) -> Result<Option<i64>, StorageError> {
        let raw = self.store.hget(&admission_keys(resource_id).resource, "stock").await?;
        Ok(raw.and_then(|s| s.parse().ok()))
    }

    /// Claim id recorded for `client_id`, if admitted.
    pub async fn holder(&self, resource_id: u64, client_id: u64) -> Result<Option<u64>, StorageError> {
        let raw = self
            .store
            .hget(&admission_keys(resource_id).claimants, &client_id.to_string())
            .await?;
        Ok(raw.and_then(|s| s.parse().ok()))
    }
}

/// A code outside the script's contract means script and client disagree;
/// retrying cannot fix that.
fn verdict_from_reply(code: i64) -> Result<Verdict, StorageError> {
    Verdict::from_code(code).ok_or_else(|| {
        error!(code, "Admission script returned an unknown verdict code");
        StorageError::Protocol(format!("unexpected admission code {}", code))
    })
}
