//! Chaos Testing for the claim persistence pipeline
//!
//! Failure injection with precise control:
//! 1. **FailingRecordStore** - system of record errors at chosen call counts or while an outage flag is set
//! 2. **Worker restarts** - pipelines shut down with claims still pending
//! 3. **Garbage messages** - unparseable entries on the transport
//!
//! Every scenario checks the same thing: an admitted claim is persisted
//! exactly once, however many times it is delivered.
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use claim_engine::pipeline::broker::{BrokerTransport, MemoryBroker};
use claim_engine::pipeline::queue::QueueTransport;
use claim_engine::pipeline::stream::StreamTransport;
use claim_engine::storage::memory::{InMemoryRecordStore, InMemoryStore};
use claim_engine::storage::traits::{ReadFrom, StockOutcome};
use claim_engine::{
    CircuitConfig, Claim, ClaimPipeline, ClaimRecordStore, ClaimTransport, InsertOutcome, PipelineSettings, Resource, StorageError,
    StreamLog,
};

// =============================================================================
// Failing Store Wrapper - Precise Error Injection
// =============================================================================

/// Wraps a record store and fails `persist_claim` on chosen calls
/// (1-indexed) or for as long as `outage` is set.
pub struct FailingRecordStore {
    inner: Arc<dyn ClaimRecordStore>,
    call_count: AtomicU64,
    fail_on_calls: Vec<u64>,
    outage: AtomicBool,
}

impl FailingRecordStore {
    pub fn new(inner: Arc<dyn ClaimRecordStore>, fail_on_calls: Vec<u64>) -> Self {
        Self {
            inner,
            call_count: AtomicU64::new(0),
            fail_on_calls,
            outage: AtomicBool::new(false),
        }
    }

    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u64 {
        self.call_count.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self) -> Result<(), StorageError> {
        let count = self.call_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.outage.load(Ordering::SeqCst) || self.fail_on_calls.contains(&count) {
            Err(StorageError::Backend(format!("injected failure on call {}", count)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ClaimRecordStore for FailingRecordStore {
    async fn insert_if_absent(&self, claim: &Claim) -> Result<InsertOutcome, StorageError> {
        self.inner.insert_if_absent(claim).await
    }

    async fn decrement_stock_if_positive(&self, resource_id: u64) -> Result<StockOutcome, StorageError> {
        self.inner.decrement_stock_if_positive(resource_id).await
    }

    async fn persist_claim(&self, claim: &Claim) -> Result<InsertOutcome, StorageError> {
        self.maybe_fail()?;
        self.inner.persist_claim(claim).await
    }

    async fn find_claim(&self, claim_id: u64) -> Result<Option<Claim>, StorageError> {
        self.inner.find_claim(claim_id).await
    }

    async fn find_resource(&self, resource_id: u64) -> Result<Option<Resource>, StorageError> {
        self.inner.find_resource(resource_id).await
    }

    async fn upsert_resource(&self, resource: &Resource) -> Result<(), StorageError> {
        self.inner.upsert_resource(resource).await
    }

    async fn count_claims(&self, resource_id: u64) -> Result<u64, StorageError> {
        self.inner.count_claims(resource_id).await
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Breaker that trips quickly and retries soon, so tests stay short.
fn quick_circuit() -> CircuitConfig {
    CircuitConfig {
        window: 4,
        failure_rate: 0.5,
        half_open_calls: 1,
        open_wait: Duration::from_millis(50),
    }
}

fn settings(consumer: &str) -> PipelineSettings {
    PipelineSettings {
        consumers: vec![consumer.to_string()],
        pending_retry_delay: Duration::from_millis(10),
        circuit: quick_circuit(),
    }
}

async fn records_with_resource(stock: u32) -> Arc<InMemoryRecordStore> {
    let records = Arc::new(InMemoryRecordStore::new());
    records.upsert_resource(&Resource::new(1, "voucher", stock)).await.unwrap();
    records
}

async fn stream_transport(store: &Arc<InMemoryStore>) -> Arc<StreamTransport> {
    let transport = Arc::new(
        StreamTransport::new(store.clone(), "stream.orders", "g1").with_block(Duration::from_millis(20)),
    );
    transport.ensure_group().await.unwrap();
    transport
}

/// Poll until `check` holds (up to ~5s).
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..500 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

async fn stock_of(records: &InMemoryRecordStore) -> u32 {
    records.find_resource(1).await.unwrap().unwrap().stock
}

// =============================================================================
// Chaos Tests - Persistence Failures
// =============================================================================

#[tokio::test]
async fn chaos_stream_redelivers_after_failed_writes() {
    let store = Arc::new(InMemoryStore::new());
    let records = records_with_resource(10).await;
    let failing = Arc::new(FailingRecordStore::new(records.clone(), vec![1, 2, 3]));

    let mut pipeline = ClaimPipeline::new(stream_transport(&store).await, failing.clone(), settings("c1"));
    pipeline.start();
    for id in 1..=5 {
        pipeline.publish(&Claim::new(id, 1, 100 + id)).await.unwrap();
    }

    assert!(eventually(|| records.claims().len() == 5).await, "all claims persisted");
    pipeline.shutdown().await;

    let stats = pipeline.stats();
    assert_eq!(stats.persisted, 5);
    assert!(stats.failed + stats.rejected >= 3, "injected failures observed: {:?}", stats);
    assert!(failing.calls() >= 8);
    assert_eq!(store.pending_count("stream.orders", "g1", "c1"), 0);
    assert_eq!(stock_of(&records).await, 5);
}

#[tokio::test]
async fn chaos_queue_redelivers_after_failed_writes() {
    let records = records_with_resource(10).await;
    let failing = Arc::new(FailingRecordStore::new(records.clone(), vec![1, 3]));
    let transport = Arc::new(QueueTransport::new(64).with_poll_interval(Duration::from_millis(20)));

    let mut pipeline = ClaimPipeline::new(transport.clone(), failing, settings("c1"));
    pipeline.start();
    for id in 1..=4 {
        pipeline.publish(&Claim::new(id, 1, 100 + id)).await.unwrap();
    }

    assert!(eventually(|| records.claims().len() == 4).await);
    pipeline.shutdown().await;

    assert_eq!(transport.in_flight(), 0);
    assert_eq!(transport.backlog(), 0);
    assert_eq!(stock_of(&records).await, 6);
}

#[tokio::test]
async fn chaos_outage_opens_circuit_then_recovers() {
    let store = Arc::new(InMemoryStore::new());
    let records = records_with_resource(10).await;
    let failing = Arc::new(FailingRecordStore::new(records.clone(), vec![]));
    failing.set_outage(true);

    let mut pipeline = ClaimPipeline::new(stream_transport(&store).await, failing.clone(), settings("c1"));
    pipeline.start();
    for id in 1..=3 {
        pipeline.publish(&Claim::new(id, 1, 100 + id)).await.unwrap();
    }

    assert!(eventually(|| pipeline.stats().rejected > 0).await, "circuit should open");
    assert!(records.claims().is_empty());
    assert!(store.pending_count("stream.orders", "g1", "c1") > 0);

    failing.set_outage(false);
    assert!(eventually(|| records.claims().len() == 3).await, "backlog drained after recovery");
    pipeline.shutdown().await;

    assert_eq!(store.pending_count("stream.orders", "g1", "c1"), 0);
    assert_eq!(stock_of(&records).await, 7);
}

// =============================================================================
// Chaos Tests - Worker Restarts
// =============================================================================

#[tokio::test]
async fn chaos_restarted_worker_drains_its_pending_list() {
    let store = Arc::new(InMemoryStore::new());
    let records = records_with_resource(10).await;
    let failing = Arc::new(FailingRecordStore::new(records.clone(), vec![]));
    failing.set_outage(true);

    // First life: every write fails, the entry stays in c1's pending list.
    let transport = stream_transport(&store).await;
    let mut first = ClaimPipeline::new(transport.clone(), failing.clone(), settings("c1"));
    first.start();
    for id in 1..=3 {
        first.publish(&Claim::new(id, 1, 100 + id)).await.unwrap();
    }
    assert!(eventually(|| store.pending_count("stream.orders", "g1", "c1") >= 1).await);
    first.shutdown().await;
    assert!(records.claims().is_empty());

    // Second life under the same consumer name with a healthy database.
    let mut second = ClaimPipeline::new(transport, records.clone(), settings("c1"));
    second.start();
    assert!(eventually(|| records.claims().len() == 3).await);
    second.shutdown().await;

    assert_eq!(store.pending_count("stream.orders", "g1", "c1"), 0);
    assert_eq!(stock_of(&records).await, 7);
}

#[tokio::test]
async fn chaos_idle_entries_of_dead_consumer_are_taken_over() {
    let store = Arc::new(InMemoryStore::new());
    let records = records_with_resource(10).await;

    // c1 reads two entries and dies without acknowledging them.
    let transport = stream_transport(&store).await;
    for id in 1..=2 {
        transport.publish(&Claim::new(id, 1, 100 + id)).await.unwrap();
    }
    let read = store
        .read_group("stream.orders", "g1", "c1", 10, ReadFrom::New, None)
        .await
        .unwrap();
    assert_eq!(read.len(), 2);

    // c2 takes them over once they are idle long enough.
    let takeover = Arc::new(
        StreamTransport::new(store.clone(), "stream.orders", "g1")
            .with_block(Duration::from_millis(20))
            .with_claim_idle(Duration::from_millis(10)),
    );
    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut pipeline = ClaimPipeline::new(takeover, records.clone(), settings("c2"));
    pipeline.start();
    assert!(eventually(|| records.claims().len() == 2).await);
    pipeline.shutdown().await;

    assert_eq!(store.pending_count("stream.orders", "g1", "c1"), 0);
    assert_eq!(store.pending_count("stream.orders", "g1", "c2"), 0);
}

// =============================================================================
// Chaos Tests - Redelivery and Garbage
// =============================================================================

#[tokio::test]
async fn chaos_duplicate_delivery_persists_once() {
    let store = Arc::new(InMemoryStore::new());
    let records = records_with_resource(10).await;

    let mut pipeline = ClaimPipeline::new(stream_transport(&store).await, records.clone(), settings("c1"));
    pipeline.start();
    let claim = Claim::new(77, 1, 5);
    pipeline.publish(&claim).await.unwrap();
    pipeline.publish(&claim).await.unwrap();

    assert!(eventually(|| pipeline.stats().persisted + pipeline.stats().duplicates == 2).await);
    pipeline.shutdown().await;

    assert_eq!(records.claims(), vec![claim]);
    assert_eq!(pipeline.stats().duplicates, 1);
    assert_eq!(stock_of(&records).await, 9);
}

#[tokio::test]
async fn chaos_garbage_entry_is_quarantined_not_blocking() {
    let store = Arc::new(InMemoryStore::new());
    let records = records_with_resource(10).await;
    let transport = stream_transport(&store).await;

    store
        .append("stream.orders", &[("claim_id".to_string(), "not-a-number".to_string())])
        .await
        .unwrap();

    let mut pipeline = ClaimPipeline::new(transport, records.clone(), settings("c1"));
    pipeline.start();
    pipeline.publish(&Claim::new(1, 1, 1)).await.unwrap();

    assert!(eventually(|| records.claims().len() == 1).await);
    pipeline.shutdown().await;

    assert_eq!(pipeline.stats().quarantined, 1);
    assert_eq!(store.stream_len("stream.orders.dlq"), 1);
    assert_eq!(store.pending_count("stream.orders", "g1", "c1"), 0);
}

// =============================================================================
// Chaos Tests - Broker Dead Letters
// =============================================================================

#[tokio::test]
async fn chaos_expired_broker_messages_are_still_persisted() {
    let broker = Arc::new(MemoryBroker::new());
    broker.declare_queue("seckill.orders.dlq", None, None);
    broker.declare_queue("seckill.orders", Some(Duration::from_millis(10)), Some("seckill.orders.dlq"));
    let records = records_with_resource(10).await;

    let transport = Arc::new(
        BrokerTransport::new(broker.clone(), "seckill.orders", "seckill.orders.dlq")
            .with_wait(Duration::from_millis(20)),
    );
    let mut pipeline = ClaimPipeline::new(transport, records.clone(), settings("c1"));

    // Published while no consumer is running; they expire into the DLQ.
    for id in 1..=3 {
        pipeline.publish(&Claim::new(id, 1, 100 + id)).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(broker.ready_len("seckill.orders"), 0);
    assert_eq!(broker.ready_len("seckill.orders.dlq"), 3);

    pipeline.start();
    assert!(eventually(|| records.claims().len() == 3).await);
    pipeline.shutdown().await;

    assert_eq!(pipeline.stats().dead_letters, 3);
    assert_eq!(broker.unacked_len(), 0);
    assert_eq!(stock_of(&records).await, 7);
}

#[tokio::test]
async fn chaos_broker_nack_surfaces_to_publisher() {
    let broker = Arc::new(MemoryBroker::new());
    broker.declare_queue("seckill.orders.dlq", None, None);
    broker.declare_queue("seckill.orders", None, Some("seckill.orders.dlq"));
    broker.set_refuse_publishes(true);

    let transport = Arc::new(BrokerTransport::new(broker.clone(), "seckill.orders", "seckill.orders.dlq"));
    let pipeline = ClaimPipeline::new(transport, Arc::new(InMemoryRecordStore::new()), settings("c1"));

    let err = pipeline.publish(&Claim::new(9, 1, 1)).await.unwrap_err();
    assert!(matches!(err, claim_engine::PipelineError::NotConfirmed { claim_id: 9, .. }));
}
