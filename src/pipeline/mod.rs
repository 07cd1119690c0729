// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Asynchronous claim persistence.
//!
//! ```text
//!  try_admit ──publish──► ClaimTransport ──receive──► PersistenceWorker ──persist_claim──► system of record
//!                              ▲                             │
//!                              └────────── ack ──────────────┘   (only after the write succeeded)
//! ```
//!
//! A claim that fails to persist is never acknowledged, so the transport hands
//! it out again. Writes are keyed by claim id, so redelivery is harmless.
//!
//! Bindings:
//! - [`queue::QueueTransport`]: in-process bounded queue; no crash survival
//! - [`stream::StreamTransport`]: shared-store stream with a consumer group and pending lists
//! - [`broker::BrokerTransport`]: broker with publisher confirms, message TTL and a dead-letter queue

pub mod broker;
pub mod queue;
pub mod stream;
mod worker;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub use worker::PersistenceWorker;

use crate::cache::CacheEngine;
use crate::claim::{Claim, ClaimParseError};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig};
use crate::storage::traits::{ClaimRecordStore, StorageError};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("in-process queue is full ({capacity} claims)")]
    QueueFull { capacity: usize },

    #[error("malformed claim message: {0}")]
    Malformed(#[from] ClaimParseError),

    #[error("persisting claim failed: {0}")]
    Persistence(StorageError),

    #[error("broker did not confirm claim {claim_id}: {reason}")]
    NotConfirmed { claim_id: u64, reason: String },

    #[error("system of record circuit open")]
    CircuitOpen,
}

/// Message body as it came off the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Fields(BTreeMap<String, String>),
    Json(Vec<u8>),
}

/// One claim handed to a worker, not yet acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Transport-specific handle used to ack or release (entry id, delivery tag, ...)
    pub receipt: String,
    pub payload: Payload,
    /// Came from a dead-letter destination
    pub dead_lettered: bool,
}

impl Delivery {
    pub fn claim(&self) -> Result<Claim, ClaimParseError> {
        match &self.payload {
            Payload::Fields(fields) => Claim::from_fields(fields),
            Payload::Json(body) => Claim::from_json(body),
        }
    }
}

/// The contract every transport binding implements.
#[async_trait]
pub trait ClaimTransport: Send + Sync {
    /// Short label for logs and metrics.
    fn name(&self) -> &'static str;

    async fn publish(&self, claim: &Claim) -> Result<(), PipelineError>;

    /// Next live claims for `consumer`; waits a bounded time and may return none.
    async fn receive(&self, consumer: &str) -> Result<Vec<Delivery>, PipelineError>;

    /// Backlog to drain before (and between) live reads: claims delivered to
    /// this consumer but never acknowledged, plus anything the binding
    /// recovers on its behalf. Empty when there is nothing left.
    async fn recover(&self, consumer: &str) -> Result<Vec<Delivery>, PipelineError>;

    /// Persisted: remove for good.
    async fn ack(&self, consumer: &str, delivery: &Delivery) -> Result<(), PipelineError>;

    /// Not persisted: keep it redeliverable.
    async fn release(&self, consumer: &str, delivery: &Delivery) -> Result<(), PipelineError>;

    /// Unparseable: take it out of the flow for good, keeping a record of it.
    async fn quarantine(&self, consumer: &str, delivery: &Delivery, reason: &str) -> Result<(), PipelineError>;
}

/// Outcome counters for one pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    persisted: AtomicU64,
    duplicates: AtomicU64,
    quarantined: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    dead_letters: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStatsSnapshot {
    pub persisted: u64,
    /// Redeliveries of claims already in the system of record
    pub duplicates: u64,
    pub quarantined: u64,
    pub failed: u64,
    /// Writes skipped because the circuit was open
    pub rejected: u64,
    /// Claims recovered from a dead-letter destination
    pub dead_letters: u64,
}

impl PipelineStats {
    pub(crate) fn incr_persisted(&self) {
        self.persisted.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn incr_duplicates(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn incr_quarantined(&self) {
        self.quarantined.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn incr_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn incr_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }
    pub(crate) fn incr_dead_letters(&self) {
        self.dead_letters.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            persisted: self.persisted.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            quarantined: self.quarantined.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// One worker per name; names must be stable across restarts
    pub consumers: Vec<String>,
    pub pending_retry_delay: Duration,
    pub circuit: CircuitConfig,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            consumers: vec!["c1".to_string()],
            pending_retry_delay: Duration::from_millis(20),
            circuit: CircuitConfig::default(),
        }
    }
}

/// Cached resource rows to drop once a claim has taken stock in the system of record.
#[derive(Clone)]
pub struct StockCacheInvalidation {
    pub cache: CacheEngine,
    /// Cache key of a resource row
    pub key: fn(u64) -> String,
}

/// A transport plus the workers draining it.
pub struct ClaimPipeline {
    transport: Arc<dyn ClaimTransport>,
    records: Arc<dyn ClaimRecordStore>,
    breaker: Arc<CircuitBreaker>,
    stats: Arc<PipelineStats>,
    settings: PipelineSettings,
    stock_cache: Option<StockCacheInvalidation>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl ClaimPipeline {
    pub fn new(
        transport: Arc<dyn ClaimTransport>,
        records: Arc<dyn ClaimRecordStore>,
        settings: PipelineSettings,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let breaker = Arc::new(CircuitBreaker::new("claim_records", settings.circuit.clone()));
        Self {
            transport,
            records,
            breaker,
            stats: Arc::new(PipelineStats::default()),
            settings,
            stock_cache: None,
            shutdown_tx,
            workers: Vec::new(),
        }
    }

    /// Drop the cached row of a resource each time a claim on it is persisted,
    /// so cached reads stop reporting the stock from before the write.
    #[must_use]
    pub fn invalidate_on_persist(mut self, cache: CacheEngine, key: fn(u64) -> String) -> Self {
        self.stock_cache = Some(StockCacheInvalidation { cache, key });
        self
    }

    /// Spawn one worker per configured consumer. Each drains its backlog
    /// before taking live claims. Calling twice is a no-op.
    pub fn start(&mut self) {
        if !self.workers.is_empty() {
            return;
        }
        self.shutdown_tx.send_replace(false);

        for consumer in &self.settings.consumers {
            let worker = PersistenceWorker::new(
                consumer.clone(),
                self.transport.clone(),
                self.records.clone(),
                self.breaker.clone(),
                self.stats.clone(),
                self.settings.pending_retry_delay,
                self.stock_cache.clone(),
            );
            let shutdown = self.shutdown_tx.subscribe();
            self.workers.push(tokio::spawn(worker.run(shutdown)));
        }

        crate::metrics::set_active_workers(self.workers.len());
        info!(transport = self.transport.name(), workers = self.workers.len(), "Claim pipeline started");
    }

    /// Hand an admitted claim to the transport.
    pub async fn publish(&self, claim: &Claim) -> Result<(), PipelineError> {
        let result = self.transport.publish(claim).await;
        let status = match &result {
            Ok(()) => "ok",
            Err(PipelineError::QueueFull { .. }) => "full",
            Err(PipelineError::NotConfirmed { .. }) => "nack",
            Err(_) => "error",
        };
        crate::metrics::record_publish(self.transport.name(), status);
        result
    }

    /// Signal workers to stop and wait for them. Unacknowledged claims stay
    /// with the transport.
    pub async fn shutdown(&mut self) {
        self.shutdown_tx.send_replace(true);
        for handle in self.workers.drain(..) {
            if let Err(e) = handle.await {
                warn!(error = %e, "Persistence worker ended abnormally");
            }
        }
        crate::metrics::set_active_workers(0);
        info!(transport = self.transport.name(), "Claim pipeline stopped");
    }

    #[must_use]
    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn ClaimTransport> {
        &self.transport
    }
}
