// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::claim::{Claim, Resource};

#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// Shared store unreachable or a command failed. Never retried inside the core.
    #[error("Shared store unavailable: {0}")]
    Unavailable(String),
    /// System of record failure.
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    /// Shared store answered outside the contract of the command or script.
    #[error("Unexpected reply from shared store: {0}")]
    Protocol(String),
    #[error("Counter '{key}' exceeded the 32-bit sequence space")]
    CounterOverflow { key: String },
}

impl StorageError {
    /// Whether the failure is worth redelivering later (not bad data or a protocol mismatch).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Backend(_))
    }
}

/// Keys touched by one admission attempt.
#[derive(Debug, Clone)]
pub struct AdmissionKeys {
    /// Hash holding `stock`, `begin`, `end` for the resource
    pub resource: String,
    /// Hash mapping client id -> claim id for clients already admitted
    pub claimants: String,
}

/// Raw verdict codes returned by the atomic admission operation.
pub mod verdict_code {
    pub const ADMITTED: i64 = 0;
    pub const OUT_OF_STOCK: i64 = 1;
    pub const DUPLICATE_CLIENT: i64 = 2;
    pub const NOT_STARTED: i64 = 3;
    pub const ENDED: i64 = 4;
    pub const UNKNOWN_RESOURCE: i64 = 5;
}

/// The shared in-memory data-structure store.
///
/// Every method is a single atomic step on the server side. Implementations
/// must not retry: a failure surfaces as [`StorageError::Unavailable`].
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Plain write. `ttl = None` keeps the key until deleted.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StorageError>;

    /// Write only if the key is absent, with an expiry. Returns whether the write happened.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Atomically delete `key` only if it currently holds `expected`.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StorageError>;

    /// Atomic increment-and-return, creating the key at 0 first.
    async fn incr(&self, key: &str) -> Result<i64, StorageError>;

    async fn hset_multiple(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StorageError>;

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, StorageError>;

    /// Check-and-decrement for one client, executed indivisibly.
    /// Returns one of the [`verdict_code`] values.
    async fn admit(
        &self,
        keys: &AdmissionKeys,
        client_id: &str,
        claim_id: &str,
        now_ms: i64,
    ) -> Result<i64, StorageError>;
}

/// One entry read from an append-log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: BTreeMap<String, String>,
}

/// Which part of a consumer group's view to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// Entries never delivered to any consumer of the group (`>`)
    New,
    /// Entries delivered to this consumer but not yet acknowledged (`0`)
    Pending,
}

/// Append-log with consumer groups and per-consumer pending lists.
#[async_trait]
pub trait StreamLog: Send + Sync {
    /// Create the group (and the stream) if missing. Idempotent.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), StorageError>;

    async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<String, StorageError>;

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        from: ReadFrom,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, StorageError>;

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, StorageError>;

    /// Take over entries idle for at least `min_idle` in other consumers' pending lists.
    async fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyExists,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockOutcome {
    Decremented,
    InsufficientStock,
}

/// The relational system of record.
#[async_trait]
pub trait ClaimRecordStore: Send + Sync {
    /// Blind insert keyed by `claim_id`; safe to retry.
    async fn insert_if_absent(&self, claim: &Claim) -> Result<InsertOutcome, StorageError>;

    async fn decrement_stock_if_positive(&self, resource_id: u64) -> Result<StockOutcome, StorageError>;

    /// Insert the claim and, when a row was actually inserted, take one unit
    /// of stock. Both happen in one transaction.
    async fn persist_claim(&self, claim: &Claim) -> Result<InsertOutcome, StorageError>;

    async fn find_claim(&self, claim_id: u64) -> Result<Option<Claim>, StorageError>;

    async fn find_resource(&self, resource_id: u64) -> Result<Option<Resource>, StorageError>;

    async fn upsert_resource(&self, resource: &Resource) -> Result<(), StorageError>;

    async fn count_claims(&self, resource_id: u64) -> Result<u64, StorageError>;
}
