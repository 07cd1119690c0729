// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Message-broker binding.
//!
//! Claims are published as JSON with the claim id as correlation id and
//! count as sent only once the broker confirms them. The main queue carries
//! a per-message TTL; anything nobody consumed in time is routed to a
//! dead-letter queue, which the worker also drains, so an expired claim is
//! still persisted rather than lost.
//!
//! [`Broker`] is the seam a networked client plugs into. [`MemoryBroker`]
//! implements the same semantics in process.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::{ClaimTransport, Delivery, Payload, PipelineError};
use crate::claim::Claim;

/// Publisher confirm for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirm {
    Ack,
    Nack { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub delivery_tag: u64,
    pub correlation_id: String,
    pub body: Vec<u8>,
    pub redelivered: bool,
}

#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, queue: &str, correlation_id: &str, body: &[u8]) -> Result<Confirm, PipelineError>;

    /// Next message from `queue`, waiting up to `wait` (not at all if `None`).
    async fn consume(
        &self,
        queue: &str,
        consumer: &str,
        wait: Option<Duration>,
    ) -> Result<Option<BrokerMessage>, PipelineError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), PipelineError>;

    /// Negative acknowledgement. Without requeue the message is dead-lettered
    /// if its queue has a dead-letter target, dropped otherwise.
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), PipelineError>;

    /// Requeue every message delivered to `consumer` and not yet settled.
    async fn recover(&self, consumer: &str) -> Result<usize, PipelineError>;
}

#[derive(Debug, Clone)]
struct Queued {
    correlation_id: String,
    body: Vec<u8>,
    enqueued_at: Instant,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ttl: Option<Duration>,
    dead_letter: Option<String>,
    ready: VecDeque<Queued>,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    consumer: String,
    message: Queued,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
}

impl BrokerState {
    /// Move messages past their TTL to the queue's dead-letter target.
    fn expire(&mut self, now: Instant) {
        let mut moved: Vec<(String, Queued)> = Vec::new();
        for (name, q) in &mut self.queues {
            let Some(ttl) = q.ttl else { continue };
            while q.ready.front().is_some_and(|m| m.enqueued_at + ttl <= now) {
                let Some(message) = q.ready.pop_front() else { break };
                match &q.dead_letter {
                    Some(target) => moved.push((target.clone(), message)),
                    None => debug!(queue = %name, correlation_id = %message.correlation_id, "Expired message dropped"),
                }
            }
        }
        for (target, mut message) in moved {
            if let Some(q) = self.queues.get_mut(&target) {
                message.enqueued_at = now;
                q.ready.push_back(message);
            }
        }
    }

    fn dead_letter(&mut self, queue: &str, mut message: Queued) {
        let target = self.queues.get(queue).and_then(|q| q.dead_letter.clone());
        if let Some(q) = target.and_then(|t| self.queues.get_mut(&t)) {
            message.enqueued_at = Instant::now();
            q.ready.push_back(message);
        }
    }
}

/// In-process broker with confirms, per-queue message TTL and dead-lettering.
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    published: Notify,
    refuse_publishes: AtomicBool,
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            published: Notify::new(),
            refuse_publishes: AtomicBool::new(false),
        }
    }

    /// Declare a queue. Redeclaring keeps its messages and updates its arguments.
    pub fn declare_queue(&self, name: &str, ttl: Option<Duration>, dead_letter: Option<&str>) {
        let mut state = self.state.lock();
        let q = state.queues.entry(name.to_string()).or_default();
        q.ttl = ttl;
        q.dead_letter = dead_letter.map(str::to_string);
    }

    /// Nack every publish while set.
    pub fn set_refuse_publishes(&self, refuse: bool) {
        self.refuse_publishes.store(refuse, Ordering::SeqCst);
    }

    /// Messages waiting in `queue` (expired ones already moved on).
    #[must_use]
    pub fn ready_len(&self, queue: &str) -> usize {
        let mut state = self.state.lock();
        state.expire(Instant::now());
        state.queues.get(queue).map_or(0, |q| q.ready.len())
    }

    #[must_use]
    pub fn unacked_len(&self) -> usize {
        self.state.lock().unacked.len()
    }

    fn try_take(&self, queue: &str, consumer: &str) -> Result<Option<BrokerMessage>, PipelineError> {
        let mut state = self.state.lock();
        state.expire(Instant::now());
        let message = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| PipelineError::Transport(format!("NOT_FOUND - no queue '{}'", queue)))?
            .ready
            .pop_front();
        let Some(message) = message else {
            return Ok(None);
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        let out = BrokerMessage {
            delivery_tag: tag,
            correlation_id: message.correlation_id.clone(),
            body: message.body.clone(),
            redelivered: message.redelivered,
        };
        state.unacked.insert(
            tag,
            Unacked {
                queue: queue.to_string(),
                consumer: consumer.to_string(),
                message,
            },
        );
        Ok(Some(out))
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, queue: &str, correlation_id: &str, body: &[u8]) -> Result<Confirm, PipelineError> {
        if self.refuse_publishes.load(Ordering::SeqCst) {
            return Ok(Confirm::Nack { reason: "publish refused".to_string() });
        }
        {
            let mut state = self.state.lock();
            let Some(q) = state.queues.get_mut(queue) else {
                return Ok(Confirm::Nack { reason: format!("no route to queue '{}'", queue) });
            };
            q.ready.push_back(Queued {
                correlation_id: correlation_id.to_string(),
                body: body.to_vec(),
                enqueued_at: Instant::now(),
                redelivered: false,
            });
        }
        self.published.notify_waiters();
        Ok(Confirm::Ack)
    }

    async fn consume(
        &self,
        queue: &str,
        consumer: &str,
        wait: Option<Duration>,
    ) -> Result<Option<BrokerMessage>, PipelineError> {
        let deadline = wait.map(|w| tokio::time::Instant::now() + w);
        loop {
            let notified = self.published.notified();
            if let Some(message) = self.try_take(queue, consumer)? {
                return Ok(Some(message));
            }
            let Some(deadline) = deadline else {
                return Ok(None);
            };
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // One last look; TTL moves happen lazily on access.
                return self.try_take(queue, consumer);
            }
        }
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), PipelineError> {
        self.state.lock().unacked.remove(&delivery_tag);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), PipelineError> {
        {
            let mut state = self.state.lock();
            let Some(Unacked { queue, mut message, .. }) = state.unacked.remove(&delivery_tag) else {
                return Ok(());
            };
            if requeue {
                message.redelivered = true;
                if let Some(q) = state.queues.get_mut(&queue) {
                    q.ready.push_front(message);
                }
            } else {
                state.dead_letter(&queue, message);
            }
        }
        self.published.notify_waiters();
        Ok(())
    }

    async fn recover(&self, consumer: &str) -> Result<usize, PipelineError> {
        let count = {
            let mut state = self.state.lock();
            let mut tags: Vec<u64> = state
                .unacked
                .iter()
                .filter(|(_, u)| u.consumer == consumer)
                .map(|(tag, _)| *tag)
                .collect();
            // Newest first so push_front restores delivery order.
            tags.sort_unstable_by(|a, b| b.cmp(a));
            for tag in &tags {
                if let Some(Unacked { queue, mut message, .. }) = state.unacked.remove(tag) {
                    message.redelivered = true;
                    if let Some(q) = state.queues.get_mut(&queue) {
                        q.ready.push_front(message);
                    }
                }
            }
            tags.len()
        };
        if count > 0 {
            self.published.notify_waiters();
        }
        Ok(count)
    }
}

/// Largest slice of the dead-letter queue drained per recovery round.
const RECOVER_BATCH: usize = 64;

pub struct BrokerTransport {
    broker: Arc<dyn Broker>,
    queue: String,
    dead_letter: String,
    wait: Duration,
}

impl BrokerTransport {
    pub fn new(broker: Arc<dyn Broker>, queue: impl Into<String>, dead_letter: impl Into<String>) -> Self {
        Self {
            broker,
            queue: queue.into(),
            dead_letter: dead_letter.into(),
            wait: Duration::from_millis(2000),
        }
    }

    /// Longest a live read waits on the main queue.
    #[must_use]
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    #[must_use]
    pub fn dead_letter_queue(&self) -> &str {
        &self.dead_letter
    }

    fn tag(delivery: &Delivery) -> Result<u64, PipelineError> {
        delivery
            .receipt
            .parse()
            .map_err(|_| PipelineError::Transport(format!("invalid delivery tag '{}'", delivery.receipt)))
    }
}

fn to_delivery(message: BrokerMessage, dead_lettered: bool) -> Delivery {
    Delivery {
        receipt: message.delivery_tag.to_string(),
        payload: Payload::Json(message.body),
        dead_lettered,
    }
}

#[async_trait]
impl ClaimTransport for BrokerTransport {
    fn name(&self) -> &'static str {
        "broker"
    }

    async fn publish(&self, claim: &Claim) -> Result<(), PipelineError> {
        let correlation_id = claim.claim_id.to_string();
        match self.broker.publish(&self.queue, &correlation_id, &claim.to_json()).await? {
            Confirm::Ack => {
                debug!(claim_id = claim.claim_id, "Broker confirmed claim");
                Ok(())
            }
            Confirm::Nack { reason } => {
                warn!(claim_id = claim.claim_id, reason = %reason, "Broker refused claim");
                Err(PipelineError::NotConfirmed {
                    claim_id: claim.claim_id,
                    reason,
                })
            }
        }
    }

    async fn receive(&self, consumer: &str) -> Result<Vec<Delivery>, PipelineError> {
        if let Some(message) = self.broker.consume(&self.queue, consumer, Some(self.wait)).await? {
            return Ok(vec![to_delivery(message, false)]);
        }
        let expired = self.broker.consume(&self.dead_letter, consumer, None).await?;
        Ok(expired.map(|m| to_delivery(m, true)).into_iter().collect())
    }

    async fn recover(&self, consumer: &str) -> Result<Vec<Delivery>, PipelineError> {
        let requeued = self.broker.recover(consumer).await?;
        if requeued > 0 {
            info!(consumer, requeued, "Requeued unsettled messages");
        }

        let mut out = Vec::new();
        while out.len() < RECOVER_BATCH {
            match self.broker.consume(&self.dead_letter, consumer, None).await? {
                Some(message) => out.push(to_delivery(message, true)),
                None => break,
            }
        }
        Ok(out)
    }

    async fn ack(&self, _consumer: &str, delivery: &Delivery) -> Result<(), PipelineError> {
        self.broker.ack(Self::tag(delivery)?).await
    }

    async fn release(&self, _consumer: &str, delivery: &Delivery) -> Result<(), PipelineError> {
        self.broker.reject(Self::tag(delivery)?, true).await
    }

    async fn quarantine(&self, consumer: &str, delivery: &Delivery, reason: &str) -> Result<(), PipelineError> {
        let body = match &delivery.payload {
            Payload::Json(body) => String::from_utf8_lossy(body).into_owned(),
            Payload::Fields(fields) => format!("{:?}", fields),
        };
        error!(delivery_tag = %delivery.receipt, body = %body, reason, "Unparseable claim message discarded");
        self.ack(consumer, delivery).await
    }
}
