//! Concurrency properties of the claim engine.
//!
//! Everything runs on the multi-threaded runtime against the in-process
//! backends, so the races are real even though no server is involved.
//!
//! Run with: `cargo test --test concurrency`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use claim_engine::storage::memory::{InMemoryRecordStore, InMemoryStore};
use claim_engine::{
    AdmissionController, Backends, CacheEngine, CachePolicy, Claim, ClaimEngine, ClaimEngineConfig, ClaimOutcome,
    ClaimRecordStore, DistributedLock, InsertOutcome, Resource, StorageError, TransportKind, Verdict,
};

fn fast_policy() -> CachePolicy {
    CachePolicy {
        lock_retry_delay: Duration::from_millis(5),
        lock_max_retries: 1_000,
        ..CachePolicy::default()
    }
}

fn cache_over(store: &Arc<InMemoryStore>) -> CacheEngine {
    CacheEngine::new(store.clone(), DistributedLock::new(store.clone()), fast_policy())
}

// =============================================================================
// Admission
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_admissions_never_oversell() {
    const STOCK: u32 = 10;
    const CALLERS: u64 = 200;

    let admission = Arc::new(AdmissionController::new(Arc::new(InMemoryStore::new())));
    admission.register(&Resource::new(1, "voucher", STOCK)).await.unwrap();

    let handles: Vec<_> = (0..CALLERS)
        .map(|client| {
            let admission = admission.clone();
            tokio::spawn(async move { admission.try_admit(1, client, 1_000 + client).await.unwrap() })
        })
        .collect();

    let mut admitted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Verdict::Admitted => admitted += 1,
            Verdict::OutOfStock => {}
            other => panic!("unexpected verdict {other}"),
        }
    }

    assert_eq!(admitted, STOCK);
    assert_eq!(admission.remaining_stock(1).await.unwrap(), Some(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn same_client_racing_is_admitted_once() {
    let admission = Arc::new(AdmissionController::new(Arc::new(InMemoryStore::new())));
    admission.register(&Resource::new(1, "voucher", 100)).await.unwrap();

    let handles: Vec<_> = (0..50u64)
        .map(|attempt| {
            let admission = admission.clone();
            tokio::spawn(async move { admission.try_admit(1, 42, attempt + 1).await.unwrap() })
        })
        .collect();

    let mut verdicts = Vec::new();
    for handle in handles {
        verdicts.push(handle.await.unwrap());
    }

    assert_eq!(verdicts.iter().filter(|v| **v == Verdict::Admitted).count(), 1);
    assert!(verdicts
        .iter()
        .all(|v| matches!(v, Verdict::Admitted | Verdict::DuplicateClient)));
    assert_eq!(admission.remaining_stock(1).await.unwrap(), Some(99));
}

// =============================================================================
// System of record
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_persists_of_one_claim_insert_once() {
    let records = Arc::new(InMemoryRecordStore::new());
    records.upsert_resource(&Resource::new(1, "voucher", 5)).await.unwrap();
    let claim = Claim::new(9, 1, 7);

    let handles: Vec<_> = (0..20)
        .map(|_| {
            let records = records.clone();
            let claim = claim.clone();
            tokio::spawn(async move { records.persist_claim(&claim).await.unwrap() })
        })
        .collect();

    let mut inserted = 0;
    for handle in handles {
        if handle.await.unwrap() == InsertOutcome::Inserted {
            inserted += 1;
        }
    }

    assert_eq!(inserted, 1);
    assert_eq!(records.count_claims(1).await.unwrap(), 1);
    assert_eq!(records.find_resource(1).await.unwrap().unwrap().stock, 4);
}

// =============================================================================
// Cache
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn missing_key_hits_backing_source_once_per_null_window() {
    let store = Arc::new(InMemoryStore::new());
    let cache = cache_over(&store);
    let loads = Arc::new(AtomicUsize::new(0));

    // First miss stores the null marker.
    let l = loads.clone();
    let first: Option<String> = cache
        .get_or_load("shop:404", || async move {
            l.fetch_add(1, Ordering::SeqCst);
            Ok::<_, StorageError>(None)
        })
        .await
        .unwrap();
    assert_eq!(first, None);

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let cache = cache.clone();
            let loads = loads.clone();
            tokio::spawn(async move {
                cache
                    .get_or_load::<String, _, _, _>("shop:404", || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, StorageError>(None)
                    })
                    .await
                    .unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap(), None);
    }

    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn cold_hot_key_is_loaded_by_one_caller() {
    let store = Arc::new(InMemoryStore::new());
    let cache = cache_over(&store);
    let loads = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..50)
        .map(|_| {
            let cache = cache.clone();
            let loads = loads.clone();
            tokio::spawn(async move {
                cache
                    .get_or_load_exclusive("shop:1", || async move {
                        loads.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok::<_, StorageError>(Some("Tea House".to_string()))
                    })
                    .await
                    .unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.await.unwrap().as_deref(), Some("Tea House"));
    }
    assert_eq!(loads.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn stale_logical_entry_is_served_and_rebuilt_once() {
    let store = Arc::new(InMemoryStore::new());
    let cache = cache_over(&store);
    cache
        .set_with_logical_expire("shop:hot", &"v1".to_string(), Duration::ZERO)
        .await
        .unwrap();

    let rebuilds = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..30)
        .map(|_| {
            let cache = cache.clone();
            let rebuilds = rebuilds.clone();
            tokio::spawn(async move {
                cache
                    .get_logical("shop:hot", move || async move {
                        rebuilds.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok::<_, StorageError>(Some("v2".to_string()))
                    })
                    .await
                    .unwrap()
            })
        })
        .collect();

    // Nobody waited on the rebuild: everyone got the stale value.
    for handle in handles {
        assert_eq!(handle.await.unwrap().as_deref(), Some("v1"));
    }

    let mut fresh = None;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let value: Option<String> = cache
            .get_logical("shop:hot", || async { Ok::<_, StorageError>(None) })
            .await
            .unwrap();
        if value.as_deref() == Some("v2") {
            fresh = value;
            break;
        }
    }
    assert_eq!(fresh.as_deref(), Some("v2"));
    assert_eq!(rebuilds.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Lock
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_holder_cannot_release_new_owners_lock() {
    let store = Arc::new(InMemoryStore::new());
    let lock = DistributedLock::new(store.clone());

    let a = lock
        .try_acquire("order:1", Duration::from_millis(100))
        .await
        .unwrap()
        .unwrap();
    assert!(lock.try_acquire("order:1", Duration::from_secs(1)).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(150)).await;
    let b = lock
        .try_acquire("order:1", Duration::from_secs(1))
        .await
        .unwrap()
        .unwrap();

    assert!(!lock.release(&a).await.unwrap());
    assert!(lock.try_acquire("order:1", Duration::from_secs(1)).await.unwrap().is_none());
    assert!(lock.release(&b).await.unwrap());
    assert!(lock.try_acquire("order:1", Duration::from_secs(1)).await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn only_one_of_many_contenders_holds_the_lock() {
    let store = Arc::new(InMemoryStore::new());
    let lock = DistributedLock::new(store);

    let handles: Vec<_> = (0..40)
        .map(|_| {
            let lock = lock.clone();
            tokio::spawn(async move { lock.try_acquire("job", Duration::from_secs(5)).await.unwrap() })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap().is_some() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

// =============================================================================
// End to end
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn last_unit_goes_to_exactly_one_of_two_clients() {
    for transport in [TransportKind::Queue, TransportKind::Stream, TransportKind::Broker] {
        let config = ClaimEngineConfig {
            transport,
            stream_block_ms: 20,
            worker_count: 2,
            ..Default::default()
        };
        let mut engine = ClaimEngine::new(config, Backends::in_memory()).unwrap();
        engine.start().await.unwrap();
        engine.publish_resource(&Resource::new(1, "voucher", 1)).await.unwrap();
        let engine = Arc::new(engine);

        let a = tokio::spawn({
            let engine = engine.clone();
            async move { engine.try_admit(1, 1).await.unwrap() }
        });
        let b = tokio::spawn({
            let engine = engine.clone();
            async move { engine.try_admit(1, 2).await.unwrap() }
        });
        let outcomes = [a.await.unwrap(), b.await.unwrap()];

        let claimed: Vec<u64> = outcomes.iter().filter_map(ClaimOutcome::claim_id).collect();
        assert_eq!(claimed.len(), 1, "{transport}: {outcomes:?}");
        assert!(outcomes.contains(&ClaimOutcome::OutOfStock));

        let claim_id = claimed[0];
        let mut persisted = None;
        for _ in 0..300 {
            persisted = engine.find_claim(claim_id).await.unwrap();
            if persisted.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let persisted = persisted.expect("claim persisted");
        assert_eq!(persisted.claim_id, claim_id);
        assert_eq!(persisted.resource_id, 1);
        assert_eq!(engine.admission().holder(1, persisted.client_id).await.unwrap(), Some(claim_id));
        assert_eq!(engine.records().count_claims(1).await.unwrap(), 1);

        let mut engine = Arc::try_unwrap(engine).ok().expect("no other engine handles");
        engine.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn claim_ids_are_unique_under_contention() {
    let mut engine = ClaimEngine::new(
        ClaimEngineConfig {
            transport: TransportKind::Queue,
            ..Default::default()
        },
        Backends::in_memory(),
    )
    .unwrap();
    engine.prepare().await.unwrap();
    engine.publish_resource(&Resource::new(1, "voucher", 500)).await.unwrap();
    let engine = Arc::new(engine);

    let handles: Vec<_> = (0..200u64)
        .map(|client| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.try_admit(1, client).await.unwrap() })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        ids.push(handle.await.unwrap().claim_id().unwrap());
    }
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 200);
}
