// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::{ClaimTransport, Delivery, PipelineStats, StockCacheInvalidation};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitError};
use crate::resilience::retry::RetryConfig;
use crate::storage::traits::{ClaimRecordStore, InsertOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handled {
    /// Persisted (or already there) and acknowledged, or quarantined
    Done,
    /// Left unacknowledged for redelivery
    Retry,
}

/// Single consumer loop: backlog first, then the live feed.
pub struct PersistenceWorker {
    consumer: String,
    transport: Arc<dyn ClaimTransport>,
    records: Arc<dyn ClaimRecordStore>,
    breaker: Arc<CircuitBreaker>,
    stats: Arc<PipelineStats>,
    pending_retry_delay: Duration,
    stock_cache: Option<StockCacheInvalidation>,
}

impl PersistenceWorker {
    pub fn new(
        consumer: String,
        transport: Arc<dyn ClaimTransport>,
        records: Arc<dyn ClaimRecordStore>,
        breaker: Arc<CircuitBreaker>,
        stats: Arc<PipelineStats>,
        pending_retry_delay: Duration,
        stock_cache: Option<StockCacheInvalidation>,
    ) -> Self {
        Self {
            consumer,
            transport,
            records,
            breaker,
            stats,
            pending_retry_delay,
            stock_cache,
        }
    }

    #[tracing::instrument(skip_all, fields(consumer = %self.consumer, transport = self.transport.name()))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Persistence worker starting");
        let mut backoff = RetryConfig::worker().backoff();

        self.drain_backlog(&mut shutdown).await;

        while !*shutdown.borrow() {
            let batch = tokio::select! {
                batch = self.transport.receive(&self.consumer) => batch,
                _ = shutdown.changed() => break,
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, "Receive failed, retrying in {:?}", delay);
                    if Self::pause(&mut shutdown, delay).await {
                        break;
                    }
                    continue;
                }
            };

            let mut needs_recovery = false;
            for delivery in batch {
                if self.handle(&delivery).await == Handled::Retry {
                    needs_recovery = true;
                }
            }

            if needs_recovery {
                let delay = backoff.next_delay();
                if Self::pause(&mut shutdown, delay).await {
                    break;
                }
                self.drain_backlog(&mut shutdown).await;
            } else {
                backoff.reset();
            }
        }

        info!("Persistence worker stopped");
    }

    /// Sleep unless shutdown arrives first. Returns true on shutdown.
    async fn pause(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return true;
                }
            }
        }
        *shutdown.borrow()
    }

    /// Persist everything this consumer still owes until the backlog is empty.
    async fn drain_backlog(&self, shutdown: &mut watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                return;
            }
            match self.transport.recover(&self.consumer).await {
                Ok(backlog) if backlog.is_empty() => return,
                Ok(backlog) => {
                    debug!(count = backlog.len(), "Draining backlog");
                    let mut failed = false;
                    for delivery in backlog {
                        if self.handle(&delivery).await == Handled::Retry {
                            failed = true;
                        }
                    }
                    if failed && Self::pause(shutdown, self.pending_retry_delay).await {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Reading backlog failed");
                    if Self::pause(shutdown, self.pending_retry_delay).await {
                        return;
                    }
                }
            }
        }
    }

    async fn handle(&self, delivery: &Delivery) -> Handled {
        let transport = self.transport.name();

        let claim = match delivery.claim() {
            Ok(claim) => claim,
            Err(e) => {
                error!(receipt = %delivery.receipt, error = %e, "Malformed claim quarantined");
                self.stats.incr_quarantined();
                crate::metrics::record_persist(transport, "quarantined");
                if let Err(qe) = self.transport.quarantine(&self.consumer, delivery, &e.to_string()).await {
                    warn!(receipt = %delivery.receipt, error = %qe, "Quarantine failed, message stays pending");
                }
                return Handled::Done;
            }
        };

        if delivery.dead_lettered {
            warn!(claim_id = claim.claim_id, "Persisting dead-lettered claim");
            self.stats.incr_dead_letters();
            crate::metrics::record_dead_letter(transport);
        }

        let resource_id = claim.resource_id;
        let records = self.records.clone();
        let persisted = self
            .breaker
            .call(|| async move { records.persist_claim(&claim).await })
            .await;

        let outcome = match persisted {
            Ok(outcome) => outcome,
            Err(CircuitError::Rejected) => {
                debug!(receipt = %delivery.receipt, "Circuit open, claim left for redelivery");
                self.stats.incr_rejected();
                crate::metrics::record_persist(transport, "rejected");
                self.release(delivery).await;
                return Handled::Retry;
            }
            Err(CircuitError::Inner(e)) => {
                error!(receipt = %delivery.receipt, error = %e, "Persisting claim failed, left for redelivery");
                self.stats.incr_failed();
                crate::metrics::record_persist(transport, "failed");
                self.release(delivery).await;
                return Handled::Retry;
            }
        };

        match outcome {
            InsertOutcome::Inserted => {
                self.stats.incr_persisted();
                crate::metrics::record_persist(transport, "persisted");
                self.invalidate_stock(resource_id).await;
            }
            InsertOutcome::AlreadyExists => {
                debug!(receipt = %delivery.receipt, "Claim already persisted");
                self.stats.incr_duplicates();
                crate::metrics::record_persist(transport, "duplicate");
            }
        }

        // A lost ack only means one more harmless redelivery.
        if let Err(e) = self.transport.ack(&self.consumer, delivery).await {
            warn!(receipt = %delivery.receipt, error = %e, "Ack failed after persisting");
        }
        Handled::Done
    }

    async fn invalidate_stock(&self, resource_id: u64) {
        let Some(stock_cache) = &self.stock_cache else {
            return;
        };
        let key = (stock_cache.key)(resource_id);
        // Entry expires on its own TTL if this fails.
        if let Err(e) = stock_cache.cache.invalidate(&key).await {
            warn!(key = %key, error = %e, "Could not drop cached resource after persist");
        }
    }

    async fn release(&self, delivery: &Delivery) {
        if let Err(e) = self.transport.release(&self.consumer, delivery).await {
            warn!(receipt = %delivery.receipt, error = %e, "Release failed");
        }
    }
}
