// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Caller-facing operations: claim attempts and resource reads/writes.

use tracing::{debug, error, info};

use super::{ClaimEngine, ClaimOutcome};
use crate::admission::Verdict;
use crate::claim::{Claim, Resource};
use crate::error::EngineError;

/// Cache key for a resource row.
#[must_use]
pub fn resource_cache_key(resource_id: u64) -> String {
    format!("cache:resource:{}", resource_id)
}

impl ClaimEngine {
    /// One claim attempt by `client_id` on `resource_id`.
    ///
    /// Allocates a claim id, runs the atomic admission check and, when
    /// admitted, hands the claim to the persistence pipeline. The result is
    /// returned as soon as the claim is enqueued; the database write happens
    /// in the background.
    ///
    /// If admission succeeds but the hand-off fails, stock has already been
    /// taken. That is reported as [`EngineError::Enqueue`] with the claim id
    /// so it can be reconciled; nothing is rolled back here.
    pub async fn try_admit(&self, resource_id: u64, client_id: u64) -> Result<ClaimOutcome, EngineError> {
        let state = self.state();
        if !self.is_ready() {
            return Err(EngineError::NotRunning { state });
        }

        let claim_id = self.ids.next_id(&self.config.id_prefix).await?;
        let verdict = self.admission.try_admit(resource_id, client_id, claim_id).await?;

        let outcome = match verdict {
            Verdict::Admitted => ClaimOutcome::Claimed(claim_id),
            Verdict::OutOfStock => ClaimOutcome::OutOfStock,
            Verdict::DuplicateClient => ClaimOutcome::DuplicateClient,
            Verdict::NotStarted => ClaimOutcome::NotStarted,
            Verdict::Ended => ClaimOutcome::Ended,
            Verdict::UnknownResource => ClaimOutcome::UnknownResource,
        };
        if verdict != Verdict::Admitted {
            return Ok(outcome);
        }

        let claim = Claim::new(claim_id, resource_id, client_id);
        if let Err(e) = self.pipeline.publish(&claim).await {
            error!(claim_id, resource_id, client_id, error = %e, "Claim admitted but not enqueued");
            crate::metrics::record_enqueue_failure();
            return Err(EngineError::Enqueue { claim_id, source: e });
        }
        debug!(claim_id, resource_id, client_id, "Claim enqueued");
        Ok(outcome)
    }

    /// Resource row through the cache, one loader per key at a time.
    /// A resource that does not exist is cached as absent for the null TTL.
    pub async fn resource(&self, resource_id: u64) -> Result<Option<Resource>, EngineError> {
        let records = self.records.clone();
        let resource = self
            .cache
            .get_or_load_exclusive(&resource_cache_key(resource_id), || async move {
                records.find_resource(resource_id).await
            })
            .await?;
        Ok(resource)
    }

    /// Resource row for hot keys pre-warmed with [`warm_resource()`](Self::warm_resource).
    /// Never waits on the database; a stale entry is served while it is
    /// rebuilt in the background. `None` if the key was never warmed.
    pub async fn hot_resource(&self, resource_id: u64) -> Result<Option<Resource>, EngineError> {
        let records = self.records.clone();
        let resource = self
            .cache
            .get_logical(&resource_cache_key(resource_id), move || async move {
                records.find_resource(resource_id).await
            })
            .await?;
        Ok(resource)
    }

    /// Pre-populate the logical-expiry cache entry for a hot resource.
    pub async fn warm_resource(&self, resource: &Resource) -> Result<(), EngineError> {
        self.cache
            .warm(&resource_cache_key(resource.resource_id), resource)
            .await?;
        Ok(())
    }

    /// Write a resource to the system of record, (re)seed its admission
    /// stock and window, then drop its cache entry.
    ///
    /// Re-publishing resets stock but keeps the clients already admitted.
    pub async fn publish_resource(&self, resource: &Resource) -> Result<(), EngineError> {
        self.records.upsert_resource(resource).await?;
        self.admission.register(resource).await?;
        self.cache.invalidate(&resource_cache_key(resource.resource_id)).await?;
        info!(
            resource_id = resource.resource_id,
            stock = resource.stock,
            "Resource published"
        );
        Ok(())
    }

    /// Persisted claim, if the pipeline has written it yet.
    pub async fn find_claim(&self, claim_id: u64) -> Result<Option<Claim>, EngineError> {
        Ok(self.records.find_claim(claim_id).await?)
    }

    /// Stock left in the admission store (not the system of record).
    pub async fn remaining_stock(&self, resource_id: u64) -> Result<Option<i64>, EngineError> {
        Ok(self.admission.remaining_stock(resource_id).await?)
    }
}
