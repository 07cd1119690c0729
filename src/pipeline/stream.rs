// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared-store stream binding.
//!
//! Claims are appended to one stream and read through a consumer group.
//! Every delivered entry sits in the reading consumer's pending list until it
//! is acknowledged, so a crashed worker loses nothing: on restart under the
//! same consumer name it reads its own pending list first. Entries left idle
//! by a consumer that never came back are taken over after `claim_idle`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};

use super::{ClaimTransport, Delivery, Payload, PipelineError};
use crate::claim::Claim;
use crate::storage::traits::{ReadFrom, StorageError, StreamEntry, StreamLog};

/// Largest backlog slice read per recovery round.
const RECOVER_BATCH: usize = 64;

pub struct StreamTransport {
    log: Arc<dyn StreamLog>,
    stream: String,
    group: String,
    dead_letter: String,
    block: Duration,
    batch_size: usize,
    claim_idle: Duration,
}

impl StreamTransport {
    pub fn new(log: Arc<dyn StreamLog>, stream: impl Into<String>, group: impl Into<String>) -> Self {
        let stream = stream.into();
        Self {
            log,
            dead_letter: format!("{}.dlq", stream),
            stream,
            group: group.into(),
            block: Duration::from_millis(2000),
            batch_size: 1,
            claim_idle: Duration::from_millis(60_000),
        }
    }

    /// Longest a live read waits for new entries.
    #[must_use]
    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Idle time after which another consumer's pending entries are taken over.
    #[must_use]
    pub fn with_claim_idle(mut self, claim_idle: Duration) -> Self {
        self.claim_idle = claim_idle;
        self
    }

    /// Create the stream and consumer group. Safe to call on every start.
    pub async fn ensure_group(&self) -> Result<(), PipelineError> {
        self.log.ensure_group(&self.stream, &self.group).await.map_err(transport_err)?;
        info!(stream = %self.stream, group = %self.group, "Consumer group ready");
        Ok(())
    }

    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    #[must_use]
    pub fn dead_letter_stream(&self) -> &str {
        &self.dead_letter
    }
}

fn transport_err(e: StorageError) -> PipelineError {
    PipelineError::Transport(e.to_string())
}

fn to_delivery(entry: StreamEntry) -> Delivery {
    Delivery {
        receipt: entry.id,
        payload: Payload::Fields(entry.fields),
        dead_lettered: false,
    }
}

#[async_trait]
impl ClaimTransport for StreamTransport {
    fn name(&self) -> &'static str {
        "stream"
    }

    async fn publish(&self, claim: &Claim) -> Result<(), PipelineError> {
        let id = self
            .log
            .append(&self.stream, &claim.to_fields())
            .await
            .map_err(transport_err)?;
        debug!(claim_id = claim.claim_id, entry_id = %id, "Claim appended");
        Ok(())
    }

    async fn receive(&self, consumer: &str) -> Result<Vec<Delivery>, PipelineError> {
        let entries = self
            .log
            .read_group(
                &self.stream,
                &self.group,
                consumer,
                self.batch_size,
                ReadFrom::New,
                Some(self.block),
            )
            .await
            .map_err(transport_err)?;
        Ok(entries.into_iter().map(to_delivery).collect())
    }

    async fn recover(&self, consumer: &str) -> Result<Vec<Delivery>, PipelineError> {
        let mut entries = self
            .log
            .read_group(&self.stream, &self.group, consumer, RECOVER_BATCH, ReadFrom::Pending, None)
            .await
            .map_err(transport_err)?;

        let taken = self
            .log
            .claim_idle(&self.stream, &self.group, consumer, self.claim_idle, RECOVER_BATCH)
            .await
            .map_err(transport_err)?;
        if !taken.is_empty() {
            info!(consumer, count = taken.len(), "Took over idle entries from other consumers");
        }

        for entry in taken {
            if !entries.iter().any(|e| e.id == entry.id) {
                entries.push(entry);
            }
        }
        Ok(entries.into_iter().map(to_delivery).collect())
    }

    async fn ack(&self, _consumer: &str, delivery: &Delivery) -> Result<(), PipelineError> {
        self.log
            .ack(&self.stream, &self.group, std::slice::from_ref(&delivery.receipt))
            .await
            .map_err(transport_err)?;
        Ok(())
    }

    /// Unacknowledged entries already stay in the pending list.
    async fn release(&self, _consumer: &str, _delivery: &Delivery) -> Result<(), PipelineError> {
        Ok(())
    }

    async fn quarantine(&self, consumer: &str, delivery: &Delivery, reason: &str) -> Result<(), PipelineError> {
        let mut fields: Vec<(String, String)> = match &delivery.payload {
            Payload::Fields(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            Payload::Json(body) => vec![("body".to_string(), String::from_utf8_lossy(body).into_owned())],
        };
        fields.push(("source_id".to_string(), delivery.receipt.clone()));
        fields.push(("reason".to_string(), reason.to_string()));

        self.log
            .append(&self.dead_letter, &fields)
            .await
            .map_err(transport_err)?;
        error!(entry_id = %delivery.receipt, dead_letter = %self.dead_letter, reason, "Entry moved to dead-letter stream");
        self.ack(consumer, delivery).await
    }
}
