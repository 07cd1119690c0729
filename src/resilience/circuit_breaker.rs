// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit breaker around system-of-record writes (recloser).
//!
//! When the database keeps failing, persistence workers stop calling it for
//! a while. A rejected call is not a lost claim: the worker leaves the claim
//! unacknowledged and the transport redelivers it after the breaker closes.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error("circuit breaker open, request rejected")]
    Rejected,

    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

impl<E> From<RecloserError<E>> for CircuitError<E> {
    fn from(err: RecloserError<E>) -> Self {
        match err {
            RecloserError::Rejected => CircuitError::Rejected,
            RecloserError::Inner(e) => CircuitError::Inner(e),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Calls observed while closed before the failure rate is evaluated
    pub window: usize,
    /// Failure rate (0.0 - 1.0) over the window that trips the breaker
    pub failure_rate: f32,
    /// Trial calls allowed while half-open
    pub half_open_calls: usize,
    /// How long the breaker stays open before trying again
    pub open_wait: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            window: 10,
            failure_rate: 0.5,
            half_open_calls: 3,
            open_wait: Duration::from_secs(15),
        }
    }
}

impl CircuitConfig {
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            window: 2,
            failure_rate: 0.5,
            half_open_calls: 1,
            open_wait: Duration::from_millis(50),
        }
    }
}

pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    calls_total: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_rate)
            .closed_len(config.window.max(1))
            .half_open_len(config.half_open_calls.max(1))
            .open_wait(config.open_wait)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            calls_total: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` through the breaker. `f` is always invoked to build the
    /// future, but the future is only polled when the breaker lets the call
    /// through, so any work inside it is skipped while the circuit is open.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        match self.inner.call(f()).await {
            Ok(result) => {
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(result)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                warn!(circuit = %self.name, "Circuit open, call rejected");
                crate::metrics::record_circuit_call(&self.name, "rejected");
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                debug!(circuit = %self.name, "Circuit call failed");
                crate::metrics::record_circuit_call(&self.name, "failure");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}
