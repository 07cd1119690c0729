// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process bounded queue.
//!
//! Fastest binding and the least durable: everything queued or in flight is
//! gone if the process dies. Within a process it keeps the full contract:
//! a released claim goes to a redelivery list that is served before new
//! claims, and a worker restarted under the same consumer name picks up
//! whatever it held when it stopped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::error;

use super::{ClaimTransport, Delivery, Payload, PipelineError};
use crate::claim::Claim;

pub struct QueueTransport {
    sender: mpsc::Sender<Claim>,
    /// Only ever drained with `try_recv`; waiting happens on `ready`
    receiver: Mutex<mpsc::Receiver<Claim>>,
    capacity: usize,
    redeliver: Mutex<VecDeque<Claim>>,
    ready: Notify,
    /// receipt -> (consumer, claim)
    in_flight: DashMap<String, (String, Claim)>,
    quarantined: Mutex<Vec<(Delivery, String)>>,
    seq: AtomicU64,
    poll: Duration,
}

impl QueueTransport {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Mutex::new(receiver),
            capacity,
            redeliver: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            in_flight: DashMap::new(),
            quarantined: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            poll: Duration::from_millis(200),
        }
    }

    /// How long `receive` waits for a claim before returning empty.
    #[must_use]
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    /// Claims waiting to be received (new and redelivered).
    #[must_use]
    pub fn backlog(&self) -> usize {
        (self.capacity - self.sender.capacity()) + self.redeliver.lock().len()
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Quarantined deliveries with the reason they were pulled.
    #[must_use]
    pub fn quarantined(&self) -> Vec<(Delivery, String)> {
        self.quarantined.lock().clone()
    }

    /// Several wakeups can collapse into one permit, so whoever takes a
    /// claim hands the wakeup on while work remains.
    fn wake_next(&self) {
        if self.backlog() > 0 {
            self.ready.notify_one();
        }
    }

    fn deliver(&self, consumer: &str, claim: Claim) -> Delivery {
        let receipt = self.seq.fetch_add(1, Ordering::Relaxed).to_string();
        let delivery = Delivery {
            receipt: receipt.clone(),
            payload: Payload::Fields(claim.to_field_map()),
            dead_lettered: false,
        };
        self.in_flight.insert(receipt, (consumer.to_string(), claim));
        delivery
    }
}

#[async_trait]
impl ClaimTransport for QueueTransport {
    fn name(&self) -> &'static str {
        "queue"
    }

    async fn publish(&self, claim: &Claim) -> Result<(), PipelineError> {
        match self.sender.try_send(claim.clone()) {
            Ok(()) => {
                self.ready.notify_one();
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(PipelineError::QueueFull { capacity: self.capacity }),
            Err(TrySendError::Closed(_)) => Err(PipelineError::Transport("queue closed".to_string())),
        }
    }

    async fn receive(&self, consumer: &str) -> Result<Vec<Delivery>, PipelineError> {
        let deadline = Instant::now() + self.poll;
        loop {
            let redelivered = self.redeliver.lock().pop_front();
            if let Some(claim) = redelivered {
                self.wake_next();
                return Ok(vec![self.deliver(consumer, claim)]);
            }

            let next = self.receiver.lock().try_recv();
            match next {
                Ok(claim) => {
                    self.wake_next();
                    return Ok(vec![self.deliver(consumer, claim)]);
                }
                Err(TryRecvError::Disconnected) => {
                    return Err(PipelineError::Transport("queue closed".to_string()))
                }
                Err(TryRecvError::Empty) => {}
            }

            // notify_one keeps a permit when nobody is waiting, so a publish
            // landing between the checks above and this wait is not lost
            if tokio::time::timeout_at(deadline, self.ready.notified()).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn recover(&self, consumer: &str) -> Result<Vec<Delivery>, PipelineError> {
        Ok(self
            .in_flight
            .iter()
            .filter(|entry| entry.value().0 == consumer)
            .map(|entry| Delivery {
                receipt: entry.key().clone(),
                payload: Payload::Fields(entry.value().1.to_field_map()),
                dead_lettered: false,
            })
            .collect())
    }

    async fn ack(&self, _consumer: &str, delivery: &Delivery) -> Result<(), PipelineError> {
        self.in_flight.remove(&delivery.receipt);
        Ok(())
    }

    async fn release(&self, _consumer: &str, delivery: &Delivery) -> Result<(), PipelineError> {
        if let Some((_, (_, claim))) = self.in_flight.remove(&delivery.receipt) {
            self.redeliver.lock().push_back(claim);
            self.ready.notify_one();
        }
        Ok(())
    }

    async fn quarantine(&self, _consumer: &str, delivery: &Delivery, reason: &str) -> Result<(), PipelineError> {
        self.in_flight.remove(&delivery.receipt);
        error!(receipt = %delivery.receipt, reason, "Claim quarantined");
        self.quarantined.lock().push((delivery.clone(), reason.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_full_queue_rejects_publish() {
        let queue = QueueTransport::new(2);
        queue.publish(&Claim::new(1, 1, 1)).await.unwrap();
        queue.publish(&Claim::new(2, 1, 2)).await.unwrap();
        assert!(matches!(
            queue.publish(&Claim::new(3, 1, 3)).await,
            Err(PipelineError::QueueFull { capacity: 2 })
        ));
        assert_eq!(queue.backlog(), 2);
    }

    #[tokio::test]
    async fn test_released_claim_comes_back_first() {
        let queue = QueueTransport::new(8).with_poll_interval(Duration::from_millis(10));
        queue.publish(&Claim::new(1, 1, 1)).await.unwrap();
        queue.publish(&Claim::new(2, 1, 2)).await.unwrap();

        let first = queue.receive("c1").await.unwrap().remove(0);
        assert_eq!(first.claim().unwrap().claim_id, 1);
        queue.release("c1", &first).await.unwrap();
        assert_eq!(queue.in_flight(), 0);

        let again = queue.receive("c1").await.unwrap().remove(0);
        assert_eq!(again.claim().unwrap().claim_id, 1);
        queue.ack("c1", &again).await.unwrap();

        let second = queue.receive("c1").await.unwrap().remove(0);
        assert_eq!(second.claim().unwrap().claim_id, 2);
    }

    #[tokio::test]
    async fn test_recover_returns_own_in_flight_only() {
        let queue = QueueTransport::new(8);
        queue.publish(&Claim::new(1, 1, 1)).await.unwrap();
        queue.publish(&Claim::new(2, 1, 2)).await.unwrap();
        queue.receive("c1").await.unwrap();
        queue.receive("c2").await.unwrap();

        let backlog = queue.recover("c1").await.unwrap();
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog[0].claim().unwrap().claim_id, 1);
    }

    #[tokio::test]
    async fn test_waiting_consumers_are_served_concurrently() {
        use std::sync::Arc;

        let queue = Arc::new(QueueTransport::new(8).with_poll_interval(Duration::from_secs(5)));
        queue.publish(&Claim::new(1, 1, 1)).await.unwrap();
        let held = queue.receive("c0").await.unwrap().remove(0);

        let waiters: Vec<_> = ["c1", "c2"]
            .into_iter()
            .map(|consumer| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.receive(consumer).await.unwrap() })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // One waiter takes the redelivery, the other the fresh claim
        let started = std::time::Instant::now();
        queue.release("c0", &held).await.unwrap();
        queue.publish(&Claim::new(2, 1, 2)).await.unwrap();

        let mut ids = Vec::new();
        for waiter in waiters {
            let got = tokio::time::timeout(Duration::from_secs(2), waiter)
                .await
                .expect("waiter stuck behind another consumer")
                .unwrap();
            assert_eq!(got.len(), 1);
            ids.push(got[0].claim().unwrap().claim_id);
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_empty_receive_times_out() {
        let queue = QueueTransport::new(8).with_poll_interval(Duration::from_millis(10));
        assert!(queue.receive("c1").await.unwrap().is_empty());
    }
}
