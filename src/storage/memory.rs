// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process backends.
//!
//! [`InMemoryStore`] implements the shared store (key/value, hashes, the
//! admission operation and consumer-group streams) behind one mutex, so each
//! call is as indivisible as a Redis command or script. [`InMemoryRecordStore`]
//! stands in for the relational system of record. Both exist for tests and
//! single-process deployments.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::traits::{
    verdict_code, AdmissionKeys, ClaimRecordStore, InsertOutcome, KvStore, ReadFrom, StockOutcome,
    StorageError, StreamEntry, StreamLog,
};
use crate::claim::{Claim, Resource};

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Default)]
struct PendingEntry {
    consumer: String,
    delivered_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index into `Stream::entries` of the next never-delivered entry
    next_index: usize,
    pending: BTreeMap<u64, PendingEntry>,
}

#[derive(Debug, Default)]
struct Stream {
    next_seq: u64,
    entries: BTreeMap<u64, BTreeMap<String, String>>,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
struct State {
    keys: HashMap<String, Entry>,
    streams: HashMap<String, Stream>,
}

impl State {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let now = Instant::now();
        if self.keys.get(key).is_some_and(|e| !e.is_live(now)) {
            self.keys.remove(key);
        }
        self.keys.get_mut(key)
    }

    fn hash_field(&mut self, key: &str, field: &str) -> Result<Option<String>, StorageError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry { value: Value::Hash(map), .. }) => Ok(map.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        }
    }
}

fn wrong_type(key: &str) -> StorageError {
    StorageError::Unavailable(format!("WRONGTYPE operation against key '{}'", key))
}

fn format_id(seq: u64) -> String {
    format!("{}-0", seq)
}

fn parse_id(id: &str) -> Option<u64> {
    id.split('-').next()?.parse().ok()
}

/// Shared store held in process memory.
pub struct InMemoryStore {
    state: Mutex<State>,
    appended: Notify,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            appended: Notify::new(),
        }
    }

    /// Number of live keys (streams excluded).
    #[must_use]
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.state.lock().keys.values().filter(|e| e.is_live(now)).count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remaining time-to-live of a key, `None` if absent or persistent.
    #[must_use]
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let mut state = self.state.lock();
        let entry = state.live(key)?;
        entry.expires_at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Entries currently in a consumer's pending list.
    #[must_use]
    pub fn pending_count(&self, stream: &str, group: &str, consumer: &str) -> usize {
        let state = self.state.lock();
        state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map_or(0, |g| g.pending.values().filter(|p| p.consumer == consumer).count())
    }

    /// Total entries ever appended to a stream (acknowledged ones included).
    #[must_use]
    pub fn stream_len(&self, stream: &str) -> usize {
        self.state.lock().streams.get(stream).map_or(0, |s| s.entries.len())
    }

    fn read_now(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        from: ReadFrom,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        let mut state = self.state.lock();
        let s = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| StorageError::Unavailable(format!("NOGROUP no such stream '{}'", stream)))?;
        let Stream { entries, groups, .. } = s;
        let g = groups
            .get_mut(group)
            .ok_or_else(|| StorageError::Unavailable(format!("NOGROUP no such group '{}'", group)))?;

        let mut out = Vec::new();
        match from {
            ReadFrom::New => {
                let fresh: Vec<u64> = entries.keys().skip(g.next_index).take(count).copied().collect();
                for seq in fresh {
                    g.next_index += 1;
                    g.pending.insert(
                        seq,
                        PendingEntry {
                            consumer: consumer.to_string(),
                            delivered_at: Some(Instant::now()),
                        },
                    );
                    if let Some(fields) = entries.get(&seq) {
                        out.push(StreamEntry { id: format_id(seq), fields: fields.clone() });
                    }
                }
            }
            ReadFrom::Pending => {
                for (seq, p) in g.pending.iter_mut() {
                    if out.len() >= count {
                        break;
                    }
                    if p.consumer != consumer {
                        continue;
                    }
                    p.delivered_at = Some(Instant::now());
                    let fields = entries.get(seq).cloned().unwrap_or_default();
                    out.push(StreamEntry { id: format_id(*seq), fields });
                }
            }
        }
        Ok(out)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let mut state = self.state.lock();
        match state.live(key) {
            None => Ok(None),
            Some(Entry { value: Value::Str(s), .. }) => Ok(Some(s.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError> {
        let expires_at = ttl.map(|t| Instant::now() + t);
        self.state.lock().keys.insert(
            key.to_string(),
            Entry { value: Value::Str(value.to_string()), expires_at },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError> {
        let mut state = self.state.lock();
        if state.live(key).is_some() {
            return Ok(false);
        }
        state.keys.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.state.lock().keys.remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StorageError> {
        let mut state = self.state.lock();
        let matches = matches!(
            state.live(key),
            Some(Entry { value: Value::Str(s), .. }) if s.as_str() == expected
        );
        if matches {
            state.keys.remove(key);
        }
        Ok(matches)
    }

    async fn incr(&self, key: &str) -> Result<i64, StorageError> {
        let mut state = self.state.lock();
        let (current, expires_at) = match state.live(key) {
            None => (0, None),
            Some(Entry { value: Value::Str(s), expires_at }) => {
                let n = s.parse::<i64>().map_err(|_| {
                    StorageError::Unavailable(format!("value at '{}' is not an integer", key))
                })?;
                (n, *expires_at)
            }
            Some(_) => return Err(wrong_type(key)),
        };
        let next = current + 1;
        state.keys.insert(key.to_string(), Entry { value: Value::Str(next.to_string()), expires_at });
        Ok(next)
    }

    async fn hset_multiple(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        if state.live(key).is_none() {
            state.keys.insert(
                key.to_string(),
                Entry { value: Value::Hash(HashMap::new()), expires_at: None },
            );
        }
        match state.live(key) {
            Some(Entry { value: Value::Hash(map), .. }) => {
                for (field, value) in fields {
                    map.insert((*field).to_string(), value.clone());
                }
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StorageError> {
        self.state.lock().hash_field(key, field)
    }

    async fn admit(
        &self,
        keys: &AdmissionKeys,
        client_id: &str,
        claim_id: &str,
        now_ms: i64,
    ) -> Result<i64, StorageError> {
        let mut state = self.state.lock();

        let stock = match state.hash_field(&keys.resource, "stock")? {
            Some(raw) => raw.parse::<i64>().unwrap_or(0),
            None => return Ok(verdict_code::UNKNOWN_RESOURCE),
        };
        let bound = |raw: Option<String>| raw.and_then(|r| r.parse::<i64>().ok()).unwrap_or(0);
        let begin = bound(state.hash_field(&keys.resource, "begin")?);
        let end = bound(state.hash_field(&keys.resource, "end")?);
        if begin > 0 && now_ms < begin {
            return Ok(verdict_code::NOT_STARTED);
        }
        if end > 0 && now_ms > end {
            return Ok(verdict_code::ENDED);
        }
        if stock <= 0 {
            return Ok(verdict_code::OUT_OF_STOCK);
        }
        if state.hash_field(&keys.claimants, client_id)?.is_some() {
            return Ok(verdict_code::DUPLICATE_CLIENT);
        }

        if let Some(Entry { value: Value::Hash(map), .. }) = state.live(&keys.resource) {
            map.insert("stock".to_string(), (stock - 1).to_string());
        }
        let claimants = state
            .keys
            .entry(keys.claimants.clone())
            .or_insert_with(|| Entry { value: Value::Hash(HashMap::new()), expires_at: None });
        match &mut claimants.value {
            Value::Hash(map) => {
                map.insert(client_id.to_string(), claim_id.to_string());
            }
            Value::Str(_) => return Err(wrong_type(&keys.claimants)),
        }
        Ok(verdict_code::ADMITTED)
    }
}

#[async_trait]
impl StreamLog for InMemoryStore {
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StorageError> {
        let mut state = self.state.lock();
        let s = state.streams.entry(stream.to_string()).or_default();
        s.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String, StorageError> {
        let id = {
            let mut state = self.state.lock();
            let s = state.streams.entry(stream.to_string()).or_default();
            s.next_seq += 1;
            let seq = s.next_seq;
            s.entries.insert(seq, fields.iter().cloned().collect());
            format_id(seq)
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        from: ReadFrom,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        let deadline = block.map(|b| tokio::time::Instant::now() + b);
        loop {
            let notified = self.appended.notified();
            let entries = self.read_now(stream, group, consumer, count, from)?;
            if !entries.is_empty() || from == ReadFrom::Pending {
                return Ok(entries);
            }
            let Some(deadline) = deadline else {
                return Ok(entries);
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StorageError> {
        let mut state = self.state.lock();
        let Some(g) = state.streams.get_mut(stream).and_then(|s| s.groups.get_mut(group)) else {
            return Ok(0);
        };
        let removed = ids
            .iter()
            .filter_map(|id| parse_id(id))
            .filter(|seq| g.pending.remove(seq).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StorageError> {
        let mut state = self.state.lock();
        let Some(s) = state.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Stream { entries, groups, .. } = s;
        let Some(g) = groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut out = Vec::new();
        for (seq, p) in g.pending.iter_mut() {
            if out.len() >= count {
                break;
            }
            let idle = p.delivered_at.map_or(Duration::MAX, |at| now.saturating_duration_since(at));
            if p.consumer == consumer || idle < min_idle {
                continue;
            }
            p.consumer = consumer.to_string();
            p.delivered_at = Some(now);
            out.push(StreamEntry {
                id: format_id(*seq),
                fields: entries.get(seq).cloned().unwrap_or_default(),
            });
        }
        Ok(out)
    }
}

/// System of record held in process memory.
pub struct InMemoryRecordStore {
    claims: DashMap<u64, Claim>,
    resources: Mutex<HashMap<u64, Resource>>,
}

impl InMemoryRecordStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            claims: DashMap::new(),
            resources: Mutex::new(HashMap::new()),
        }
    }

    /// Every stored claim, ordered by claim id.
    #[must_use]
    pub fn claims(&self) -> Vec<Claim> {
        let mut all: Vec<Claim> = self.claims.iter().map(|r| r.value().clone()).collect();
        all.sort_by_key(|c| c.claim_id);
        all
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClaimRecordStore for InMemoryRecordStore {
    async fn insert_if_absent(&self, claim: &Claim) -> Result<InsertOutcome, StorageError> {
        match self.claims.entry(claim.claim_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(InsertOutcome::AlreadyExists),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(claim.clone());
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn decrement_stock_if_positive(&self, resource_id: u64) -> Result<StockOutcome, StorageError> {
        let mut resources = self.resources.lock();
        match resources.get_mut(&resource_id) {
            Some(r) if r.stock > 0 => {
                r.stock -= 1;
                Ok(StockOutcome::Decremented)
            }
            _ => Ok(StockOutcome::InsufficientStock),
        }
    }

    async fn persist_claim(&self, claim: &Claim) -> Result<InsertOutcome, StorageError> {
        // Resource lock first so the insert and the decrement are observed together.
        let mut resources = self.resources.lock();
        let outcome = match self.claims.entry(claim.claim_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => InsertOutcome::AlreadyExists,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(claim.clone());
                InsertOutcome::Inserted
            }
        };
        if outcome == InsertOutcome::Inserted {
            if let Some(r) = resources.get_mut(&claim.resource_id) {
                r.stock = r.stock.saturating_sub(1);
            }
        }
        Ok(outcome)
    }

    async fn find_claim(&self, claim_id: u64) -> Result<Option<Claim>, StorageError> {
        Ok(self.claims.get(&claim_id).map(|r| r.value().clone()))
    }

    async fn find_resource(&self, resource_id: u64) -> Result<Option<Resource>, StorageError> {
        Ok(self.resources.lock().get(&resource_id).cloned())
    }

    async fn upsert_resource(&self, resource: &Resource) -> Result<(), StorageError> {
        self.resources.lock().insert(resource.resource_id, resource.clone());
        Ok(())
    }

    async fn count_claims(&self, resource_id: u64) -> Result<u64, StorageError> {
        Ok(self.claims.iter().filter(|c| c.resource_id == resource_id).count() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn keys() -> AdmissionKeys {
        AdmissionKeys {
            resource: "seckill:resource:1".into(),
            claimants: "seckill:claimants:1".into(),
        }
    }

    #[tokio::test]
    async fn test_set_get_and_expiry() {
        let store = InMemoryStore::new();
        store.set("k", "v", Some(Duration::from_millis(30))).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_set_nx_respects_existing_key() {
        let store = InMemoryStore::new();
        assert!(store.set_nx("lock", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!store.set_nx("lock", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.get("lock").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_set_nx_after_expiry() {
        let store = InMemoryStore::new();
        assert!(store.set_nx("lock", "a", Duration::from_millis(20)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(store.set_nx("lock", "b", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_if_equals() {
        let store = InMemoryStore::new();
        store.set("lock", "owner-1", None).await.unwrap();
        assert!(!store.delete_if_equals("lock", "owner-2").await.unwrap());
        assert!(store.get("lock").await.unwrap().is_some());
        assert!(store.delete_if_equals("lock", "owner-1").await.unwrap());
        assert!(store.get("lock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_incr_starts_at_one() {
        let store = InMemoryStore::new();
        assert_eq!(store.incr("c").await.unwrap(), 1);
        assert_eq!(store.incr("c").await.unwrap(), 2);
        store.set("s", "abc", None).await.unwrap();
        assert!(store.incr("s").await.is_err());
    }

    #[tokio::test]
    async fn test_admit_decrements_and_records() {
        let store = InMemoryStore::new();
        store.hset_multiple("seckill:resource:1", &[("stock", "1".into())]).await.unwrap();

        assert_eq!(store.admit(&keys(), "7", "100", 0).await.unwrap(), verdict_code::ADMITTED);
        assert_eq!(store.hget("seckill:resource:1", "stock").await.unwrap().as_deref(), Some("0"));
        assert_eq!(store.hget("seckill:claimants:1", "7").await.unwrap().as_deref(), Some("100"));
        assert_eq!(store.admit(&keys(), "8", "101", 0).await.unwrap(), verdict_code::OUT_OF_STOCK);
    }

    #[tokio::test]
    async fn test_admit_duplicate_and_unknown() {
        let store = InMemoryStore::new();
        assert_eq!(store.admit(&keys(), "7", "1", 0).await.unwrap(), verdict_code::UNKNOWN_RESOURCE);

        store.hset_multiple("seckill:resource:1", &[("stock", "5".into())]).await.unwrap();
        assert_eq!(store.admit(&keys(), "7", "1", 0).await.unwrap(), verdict_code::ADMITTED);
        assert_eq!(store.admit(&keys(), "7", "2", 0).await.unwrap(), verdict_code::DUPLICATE_CLIENT);
        assert_eq!(store.hget("seckill:resource:1", "stock").await.unwrap().as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_admit_window() {
        let store = InMemoryStore::new();
        store
            .hset_multiple(
                "seckill:resource:1",
                &[("stock", "5".into()), ("begin", "1000".into()), ("end", "2000".into())],
            )
            .await
            .unwrap();
        assert_eq!(store.admit(&keys(), "7", "1", 999).await.unwrap(), verdict_code::NOT_STARTED);
        assert_eq!(store.admit(&keys(), "7", "1", 2001).await.unwrap(), verdict_code::ENDED);
        assert_eq!(store.admit(&keys(), "7", "1", 1500).await.unwrap(), verdict_code::ADMITTED);
    }

    #[tokio::test]
    async fn test_stream_group_delivery_and_ack() {
        let store = InMemoryStore::new();
        store.ensure_group("s", "g").await.unwrap();
        store.append("s", &[("a".into(), "1".into())]).await.unwrap();
        store.append("s", &[("a".into(), "2".into())]).await.unwrap();

        let first = store.read_group("s", "g", "c1", 1, ReadFrom::New, None).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].fields["a"], "1");

        // A second consumer never sees the entry already delivered to c1.
        let second = store.read_group("s", "g", "c2", 10, ReadFrom::New, None).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].fields["a"], "2");

        assert_eq!(store.pending_count("s", "g", "c1"), 1);
        let pending = store.read_group("s", "g", "c1", 10, ReadFrom::Pending, None).await.unwrap();
        assert_eq!(pending, first);

        assert_eq!(store.ack("s", "g", &[first[0].id.clone()]).await.unwrap(), 1);
        assert_eq!(store.pending_count("s", "g", "c1"), 0);
        assert_eq!(store.ack("s", "g", &[first[0].id.clone()]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stream_read_blocks_until_append() {
        let store = Arc::new(InMemoryStore::new());
        store.ensure_group("s", "g").await.unwrap();

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .read_group("s", "g", "c1", 1, ReadFrom::New, Some(Duration::from_secs(2)))
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.append("s", &[("a".into(), "1".into())]).await.unwrap();

        let got = reader.await.unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn test_stream_read_times_out_empty() {
        let store = InMemoryStore::new();
        store.ensure_group("s", "g").await.unwrap();
        let got = store
            .read_group("s", "g", "c1", 1, ReadFrom::New, Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_read_without_group_fails() {
        let store = InMemoryStore::new();
        assert!(store.read_group("s", "g", "c", 1, ReadFrom::New, None).await.is_err());
    }

    #[tokio::test]
    async fn test_claim_idle_moves_ownership() {
        let store = InMemoryStore::new();
        store.ensure_group("s", "g").await.unwrap();
        store.append("s", &[("a".into(), "1".into())]).await.unwrap();
        store.read_group("s", "g", "dead", 1, ReadFrom::New, None).await.unwrap();

        let early = store.claim_idle("s", "g", "alive", Duration::from_secs(60), 10).await.unwrap();
        assert!(early.is_empty());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let taken = store.claim_idle("s", "g", "alive", Duration::from_millis(10), 10).await.unwrap();
        assert_eq!(taken.len(), 1);
        assert_eq!(store.pending_count("s", "g", "dead"), 0);
        assert_eq!(store.pending_count("s", "g", "alive"), 1);
    }

    #[tokio::test]
    async fn test_record_store_insert_is_idempotent() {
        let records = InMemoryRecordStore::new();
        records.upsert_resource(&Resource::new(1, "voucher", 3)).await.unwrap();
        let claim = Claim::new(10, 1, 5);

        assert_eq!(records.persist_claim(&claim).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(records.persist_claim(&claim).await.unwrap(), InsertOutcome::AlreadyExists);
        assert_eq!(records.count_claims(1).await.unwrap(), 1);
        assert_eq!(records.find_resource(1).await.unwrap().unwrap().stock, 2);
    }

    #[tokio::test]
    async fn test_record_store_stock_floor() {
        let records = InMemoryRecordStore::new();
        records.upsert_resource(&Resource::new(1, "voucher", 1)).await.unwrap();
        assert_eq!(records.decrement_stock_if_positive(1).await.unwrap(), StockOutcome::Decremented);
        assert_eq!(records.decrement_stock_if_positive(1).await.unwrap(), StockOutcome::InsufficientStock);
        assert_eq!(records.decrement_stock_if_positive(99).await.unwrap(), StockOutcome::InsufficientStock);
    }
}
