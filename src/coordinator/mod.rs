// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Claim engine coordinator.
//!
//! The [`ClaimEngine`] wires the components together:
//! - [`IdGenerator`] for claim ids
//! - [`AdmissionController`] for the atomic stock check
//! - a [`ClaimPipeline`] carrying admitted claims to the system of record
//! - a [`CacheEngine`] for resource reads
//!
//! # Lifecycle
//!
//! ```text
//! Created → Connecting → Ready → Running → ShuttingDown → Stopped
//! ```
//!
//! Claims are accepted from `Ready` on. Workers persist them once `Running`.
//!
//! # Example
//!
//! ```rust,no_run
//! use claim_engine::{Backends, ClaimEngine, ClaimEngineConfig, ClaimOutcome, EngineState, Resource};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), claim_engine::EngineError> {
//! let config = ClaimEngineConfig::default();
//! let mut engine = ClaimEngine::new(config, Backends::in_memory())?;
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.start().await?;
//! engine.publish_resource(&Resource::new(1, "voucher", 100)).await?;
//!
//! if let ClaimOutcome::Claimed(claim_id) = engine.try_admit(1, 42).await? {
//!     println!("claim {} on its way", claim_id);
//! }
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use api::resource_cache_key;
pub use types::{ClaimOutcome, EngineState};

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{info, warn};

use crate::admission::AdmissionController;
use crate::cache::{CacheEngine, CachePolicy};
use crate::config::{ClaimEngineConfig, TransportKind};
use crate::error::EngineError;
use crate::id_gen::IdGenerator;
use crate::lock::DistributedLock;
use crate::pipeline::broker::{Broker, BrokerTransport, MemoryBroker};
use crate::pipeline::queue::QueueTransport;
use crate::pipeline::stream::StreamTransport;
use crate::pipeline::{ClaimPipeline, ClaimTransport, PipelineSettings, PipelineStatsSnapshot};
use crate::storage::memory::{InMemoryRecordStore, InMemoryStore};
use crate::storage::redis::RedisStore;
use crate::storage::sql::SqlRecordStore;
use crate::storage::traits::{ClaimRecordStore, KvStore, StreamLog};

/// The stores an engine runs on.
#[derive(Clone)]
pub struct Backends {
    pub kv: Arc<dyn KvStore>,
    pub streams: Arc<dyn StreamLog>,
    pub records: Arc<dyn ClaimRecordStore>,
    /// Used with [`TransportKind::Broker`]; an in-process broker is declared if absent
    pub broker: Option<Arc<dyn Broker>>,
}

impl Backends {
    /// Everything in process memory.
    #[must_use]
    pub fn in_memory() -> Self {
        let store = Arc::new(InMemoryStore::new());
        Self {
            kv: store.clone(),
            streams: store,
            records: Arc::new(InMemoryRecordStore::new()),
            broker: None,
        }
    }

    /// Connect to the configured Redis and SQL backends, falling back to
    /// in-process ones for whatever is not configured.
    #[tracing::instrument(skip(config), fields(has_redis = config.redis_url.is_some(), has_sql = config.sql_url.is_some()))]
    pub async fn connect(config: &ClaimEngineConfig) -> Result<Self, EngineError> {
        let mut backends = Self::in_memory();

        match &config.redis_url {
            Some(url) => {
                let store = Arc::new(RedisStore::with_prefix(url, config.redis_prefix.as_deref()).await?);
                info!(prefix = store.prefix(), "Shared store connected (Redis)");
                backends.kv = store.clone();
                backends.streams = store;
            }
            None => warn!("No Redis URL configured, shared store is process-local"),
        }

        match &config.sql_url {
            Some(url) => {
                backends.records = Arc::new(SqlRecordStore::new(url).await?);
                info!("System of record connected (SQL)");
            }
            None => warn!("No SQL URL configured, claims are kept in memory only"),
        }

        Ok(backends)
    }
}

/// Flash-sale claim engine.
///
/// `Send + Sync`; share it behind an `Arc` once started. Lifecycle calls
/// take `&mut self`, request-path calls take `&self`.
pub struct ClaimEngine {
    pub(super) config: ClaimEngineConfig,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) ids: IdGenerator,
    pub(super) lock: DistributedLock,
    pub(super) cache: CacheEngine,
    pub(super) admission: AdmissionController,
    pub(super) records: Arc<dyn ClaimRecordStore>,

    /// Present for the stream transport; its consumer group is created on start
    pub(super) stream: Option<Arc<StreamTransport>>,
    pub(super) pipeline: ClaimPipeline,
}

impl ClaimEngine {
    /// Build an engine over `backends`. Nothing is started; the engine is
    /// in `Created` state until [`start()`](Self::start) or [`prepare()`](Self::prepare).
    pub fn new(config: ClaimEngineConfig, backends: Backends) -> Result<Self, EngineError> {
        Self::with_settings(config, backends, PipelineSettings::default())
    }

    /// Like [`new()`](Self::new) with explicit pipeline settings. The consumer
    /// names always come from the config.
    pub fn with_settings(
        config: ClaimEngineConfig,
        backends: Backends,
        settings: PipelineSettings,
    ) -> Result<Self, EngineError> {
        validate(&config)?;
        let (state_tx, state_rx) = watch::channel(EngineState::Created);

        let lock = DistributedLock::new(backends.kv.clone());
        let cache = CacheEngine::new(backends.kv.clone(), lock.clone(), CachePolicy::from_config(&config));
        let (transport, stream) = build_transport(&config, &backends);

        let settings = PipelineSettings {
            consumers: (0..config.worker_count).map(|i| config.consumer_for(i)).collect(),
            pending_retry_delay: config.pending_retry_delay(),
            ..settings
        };
        let pipeline = ClaimPipeline::new(transport, backends.records.clone(), settings)
            .invalidate_on_persist(cache.clone(), resource_cache_key);

        Ok(Self {
            ids: IdGenerator::new(backends.kv.clone(), config.id_epoch_secs),
            admission: AdmissionController::new(backends.kv.clone()),
            records: backends.records,
            lock,
            cache,
            stream,
            pipeline,
            state: state_tx,
            state_rx,
            config,
        })
    }

    /// Connect to the configured backends and build an engine over them.
    pub async fn connect(config: ClaimEngineConfig) -> Result<Self, EngineError> {
        let backends = Backends::connect(&config).await?;
        Self::new(config, backends)
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Accepting claims.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), EngineState::Ready | EngineState::Running)
    }

    #[must_use]
    pub fn config(&self) -> &ClaimEngineConfig {
        &self.config
    }

    #[must_use]
    pub fn cache(&self) -> &CacheEngine {
        &self.cache
    }

    #[must_use]
    pub fn lock(&self) -> &DistributedLock {
        &self.lock
    }

    #[must_use]
    pub fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    #[must_use]
    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    #[must_use]
    pub fn records(&self) -> &Arc<dyn ClaimRecordStore> {
        &self.records
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn ClaimTransport> {
        self.pipeline.transport()
    }

    #[must_use]
    pub fn pipeline_stats(&self) -> PipelineStatsSnapshot {
        self.pipeline.stats()
    }
}

fn validate(config: &ClaimEngineConfig) -> Result<(), EngineError> {
    if config.worker_count == 0 {
        return Err(EngineError::Config("worker_count must be at least 1".into()));
    }
    if config.transport == TransportKind::Queue && config.queue_capacity == 0 {
        return Err(EngineError::Config("queue_capacity must be at least 1".into()));
    }
    if config.id_prefix.is_empty() {
        return Err(EngineError::Config("id_prefix must not be empty".into()));
    }
    Ok(())
}

fn build_transport(
    config: &ClaimEngineConfig,
    backends: &Backends,
) -> (Arc<dyn ClaimTransport>, Option<Arc<StreamTransport>>) {
    match config.transport {
        TransportKind::Queue => {
            let queue: Arc<dyn ClaimTransport> = Arc::new(QueueTransport::new(config.queue_capacity));
            (queue, None)
        }
        TransportKind::Stream => {
            let stream = Arc::new(
                StreamTransport::new(backends.streams.clone(), &config.stream_key, &config.stream_group)
                    .with_block(config.stream_block())
                    .with_batch_size(config.stream_batch_size)
                    .with_claim_idle(config.stream_claim_idle()),
            );
            let transport: Arc<dyn ClaimTransport> = stream.clone();
            (transport, Some(stream))
        }
        TransportKind::Broker => {
            let broker = backends.broker.clone().unwrap_or_else(|| {
                let broker = MemoryBroker::new();
                broker.declare_queue(&config.broker_dead_letter_queue, None, None);
                broker.declare_queue(
                    &config.broker_queue,
                    Some(config.broker_message_ttl()),
                    Some(&config.broker_dead_letter_queue),
                );
                Arc::new(broker) as Arc<dyn Broker>
            });
            let transport = BrokerTransport::new(broker, &config.broker_queue, &config.broker_dead_letter_queue)
                .with_wait(config.stream_block());
            let transport: Arc<dyn ClaimTransport> = Arc::new(transport);
            (transport, None)
        }
    }
}
