// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for claim-engine.
//!
//! Uses the `metrics` crate facade. The host process picks the exporter.
//!
//! # Metric Naming Convention
//! - `claim_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `verdict`: admitted, out_of_stock, duplicate_client, not_started, ended, unknown_resource, store_unavailable
//! - `strategy`: pass_through, mutex, logical
//! - `transport`: queue, stream, broker
//! - `outcome` / `status`: per-metric, listed on each function

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Admission attempt by verdict
pub fn record_admission(verdict: &str) {
    counter!(
        "claim_engine_admissions_total",
        "verdict" => verdict.to_string()
    )
    .increment(1);
}

/// Cache read by strategy and outcome
/// (`hit`, `null_hit`, `loaded`, `null_stored`, `stale`, `error`)
pub fn record_cache_lookup(strategy: &str, outcome: &str) {
    counter!(
        "claim_engine_cache_lookups_total",
        "strategy" => strategy.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Background rebuild of a logically expired entry (`started`, `completed`, `removed`, `failed`)
pub fn record_cache_rebuild(status: &str) {
    counter!(
        "claim_engine_cache_rebuilds_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Lock event (`acquired`, `contended`, `released`, `stale_release`)
pub fn record_lock(outcome: &str) {
    counter!(
        "claim_engine_lock_events_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Claim ids handed out
pub fn record_id_issued(prefix: &str) {
    counter!(
        "claim_engine_ids_issued_total",
        "prefix" => prefix.to_string()
    )
    .increment(1);
}

/// Transport publish (`ok`, `full`, `nack`, `error`)
pub fn record_publish(transport: &str, status: &str) {
    counter!(
        "claim_engine_publishes_total",
        "transport" => transport.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Persistence outcome for one delivery
/// (`persisted`, `duplicate`, `quarantined`, `failed`, `rejected`)
pub fn record_persist(transport: &str, outcome: &str) {
    counter!(
        "claim_engine_persist_total",
        "transport" => transport.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Claim routed to (or consumed from) a dead-letter destination
pub fn record_dead_letter(transport: &str) {
    counter!(
        "claim_engine_dead_letters_total",
        "transport" => transport.to_string()
    )
    .increment(1);
}

/// Admitted claim that could not be handed to the transport
pub fn record_enqueue_failure() {
    counter!("claim_engine_enqueue_failures_total").increment(1);
}

pub fn record_circuit_call(circuit: &str, status: &str) {
    counter!(
        "claim_engine_circuit_calls_total",
        "circuit" => circuit.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Engine lifecycle state (0 = Created .. 5 = Stopped)
pub fn set_engine_state(state: u8) {
    gauge!("claim_engine_state").set(f64::from(state));
}

pub fn set_active_workers(count: usize) {
    gauge!("claim_engine_active_workers").set(count as f64);
}

pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "claim_engine_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Records latency when dropped.
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}
