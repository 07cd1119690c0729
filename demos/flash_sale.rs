// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Flash-sale walkthrough.
//!
//! Demonstrates:
//! 1. Starting an engine on in-process backends (no Docker needed)
//! 2. Publishing a voucher with 10 units
//! 3. Racing 200 clients for it (plus a few double-clickers)
//! 4. Waiting for the persistence pipeline to catch up
//! 5. Reading the voucher through the cache
//! 6. Displaying metrics
//! 7. Clean shutdown
//!
//! Set `CLAIM_REDIS_URL` / `CLAIM_SQL_URL` to run against real backends, and
//! `CLAIM_TRANSPORT` to `queue`, `stream` or `broker` to pick the pipeline.
//!
//! # Run
//!
//! ```bash
//! cargo run --example flash_sale
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use claim_engine::{ClaimEngine, ClaimEngineConfig, ClaimOutcome, EngineState, Resource, TransportKind};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};

const VOUCHER: u64 = 1;
const STOCK: u32 = 10;
const CLIENTS: u64 = 200;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_target(false)
        .compact()
        .init();

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║             claim-engine: Flash Sale Example                  ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and start the engine
    // ─────────────────────────────────────────────────────────────────────────
    let transport = match std::env::var("CLAIM_TRANSPORT").as_deref() {
        Ok("stream") => TransportKind::Stream,
        Ok("broker") => TransportKind::Broker,
        _ => TransportKind::Queue,
    };
    let config = ClaimEngineConfig {
        redis_url: std::env::var("CLAIM_REDIS_URL").ok(),
        sql_url: std::env::var("CLAIM_SQL_URL").ok(),
        transport,
        worker_count: 2,
        stream_block_ms: 200,
        ..Default::default()
    };
    println!("📦 Transport: {:?}", config.transport);

    let mut engine = ClaimEngine::connect(config).await?;
    engine.start().await?;
    assert_eq!(engine.state(), EngineState::Running);
    println!("   ✅ Engine running");

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Publish the voucher
    // ─────────────────────────────────────────────────────────────────────────
    engine
        .publish_resource(&Resource::new(VOUCHER, "50% off, today only", STOCK))
        .await?;
    println!("\n🎟️  Voucher {} published with {} units", VOUCHER, STOCK);

    // ─────────────────────────────────────────────────────────────────────────
    // 3. The race
    // ─────────────────────────────────────────────────────────────────────────
    let engine = Arc::new(engine);
    println!("\n🏁 {} clients racing (every 20th clicks twice)...", CLIENTS);

    let started = Instant::now();
    let handles: Vec<_> = (1..=CLIENTS)
        .map(|client| {
            let engine = engine.clone();
            tokio::spawn(async move {
                let clicks = if client % 20 == 0 { 2 } else { 1 };
                let mut outcomes = Vec::with_capacity(clicks);
                for _ in 0..clicks {
                    outcomes.push(engine.try_admit(VOUCHER, client).await);
                }
                (client, outcomes)
            })
        })
        .collect();

    let mut winners = Vec::new();
    let (mut sold_out, mut duplicates, mut errors) = (0, 0, 0);
    for handle in handles {
        let (client, outcomes) = handle.await?;
        for outcome in outcomes {
            match outcome {
                Ok(ClaimOutcome::Claimed(id)) => winners.push((client, id)),
                Ok(ClaimOutcome::OutOfStock) => sold_out += 1,
                Ok(ClaimOutcome::DuplicateClient) => duplicates += 1,
                Ok(other) => println!("   └─ client {}: {}", client, other),
                Err(e) => {
                    errors += 1;
                    println!("   └─ client {}: error {}", client, e);
                }
            }
        }
    }
    println!("   ⏱️  Race decided in {:?}", started.elapsed());
    println!("   ├─ Winners:      {}", winners.len());
    println!("   ├─ Sold out:     {}", sold_out);
    println!("   ├─ Second click: {}", duplicates);
    println!("   └─ Errors:       {}", errors);
    for (client, id) in &winners {
        println!("      🏆 client {:>3} → claim {}", client, id);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Let the pipeline persist the claims
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n⏳ Waiting for the persistence pipeline...");
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let persisted = engine.records().count_claims(VOUCHER).await?;
        if persisted as usize >= winners.len() || Instant::now() > deadline {
            println!("   └─ {} of {} claims in the system of record", persisted, winners.len());
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let stats = engine.pipeline_stats();
    println!("   └─ Pipeline: {:?}", stats);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Read the voucher back through the cache
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📖 Reading the voucher (first read loads, second read hits)...");
    for attempt in 1..=2 {
        let start = Instant::now();
        let voucher = engine.resource(VOUCHER).await?;
        println!(
            "   └─ read {}: stock={:?} ({:?})",
            attempt,
            voucher.map(|v| v.stock),
            start.elapsed()
        );
    }
    println!("   └─ Admission counter: {:?}", engine.remaining_stock(VOUCHER).await?);

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Dump raw metrics
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n📈 Raw Metrics:");
    dump_metrics(&snapshotter);

    // ─────────────────────────────────────────────────────────────────────────
    // 7. Clean shutdown
    // ─────────────────────────────────────────────────────────────────────────
    println!("\n🛑 Shutting down...");
    match Arc::into_inner(engine) {
        Some(mut engine) => {
            engine.shutdown().await;
            println!("   ✅ Shutdown complete! State: {}", engine.state());
        }
        None => println!("   ⚠️  Engine still shared, skipping shutdown"),
    }

    println!("\n╔═══════════════════════════════════════════════════════════════╗");
    println!("║                    Example complete!                          ║");
    println!("╚═══════════════════════════════════════════════════════════════╝\n");

    Ok(())
}

/// Dump all captured metrics, grouped by kind
fn dump_metrics(snapshotter: &Snapshotter) {
    let snapshot = snapshotter.snapshot();

    let mut counters: Vec<_> = vec![];
    let mut gauges: Vec<_> = vec![];
    let mut histograms: Vec<_> = vec![];

    for (composite_key, _, _, value) in snapshot.into_vec() {
        let (_, key) = composite_key.into_parts();
        let name = key.name().to_string();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let label_str = if labels.is_empty() { String::new() } else { format!("{{{}}}", labels.join(",")) };

        match value {
            DebugValue::Counter(v) => counters.push((name, label_str, v)),
            DebugValue::Gauge(v) => gauges.push((name, label_str, v.into_inner())),
            DebugValue::Histogram(samples) => {
                let count = samples.len();
                let sum: f64 = samples.iter().map(|v| v.into_inner()).sum();
                let max = samples.iter().map(|v| v.into_inner()).fold(0.0, f64::max);
                histograms.push((name, label_str, count, sum, max));
            }
        }
    }

    counters.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    gauges.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
    histograms.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    if !counters.is_empty() {
        println!("   ┌─ Counters (cumulative)");
        for (name, labels, value) in &counters {
            println!("   │  └─ {}{} = {}", name, labels, value);
        }
    }
    if !gauges.is_empty() {
        println!("   ├─ Gauges (current value)");
        for (name, labels, value) in &gauges {
            println!("   │  └─ {}{} = {:.2}", name, labels, value);
        }
    }
    if !histograms.is_empty() {
        println!("   └─ Histograms (seconds)");
        for (name, labels, count, sum, max) in &histograms {
            let avg = if *count > 0 { sum / *count as f64 } else { 0.0 };
            println!("      └─ {}{} count={} avg={:.6} max={:.6}", name, labels, count, avg, max);
        }
    }
    if counters.is_empty() && gauges.is_empty() && histograms.is_empty() {
        println!("   └─ (no metrics recorded)");
    }
}
