// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry with exponential backoff.
//!
//! Only two places back off: connecting to a backend at startup, and a
//! persistence worker whose transport went away. Request-path store commands
//! never retry; a failed admission is reported to the caller as is.
//!
//! # Example
//!
//! ```
//! use claim_engine::RetryConfig;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Worker: keep polling a transport that is down
//! let worker = RetryConfig::worker();
//! assert_eq!(worker.max_retries, None);
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts before giving up; `None` retries forever
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::worker()
    }
}

impl RetryConfig {
    /// Five attempts over roughly five seconds. Wrong URLs surface quickly.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Never gives up, backoff capped at five seconds.
    #[must_use]
    pub fn worker() -> Self {
        Self {
            max_retries: None,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            factor: 2.0,
        }
    }

    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }

    #[must_use]
    pub fn backoff(&self) -> Backoff {
        Backoff {
            next: self.initial_delay,
            max: self.max_delay,
            factor: self.factor,
            initial: self.initial_delay,
        }
    }
}

/// Growing delay sequence, reset after a success.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    factor: f64,
    initial: Duration,
}

impl Backoff {
    /// Delay to wait now; the following call returns a longer one.
    pub fn next_delay(&mut self) -> Duration {
        let current = self.next;
        self.next = self.next.mul_f64(self.factor).min(self.max);
        current
    }

    pub fn reset(&mut self) {
        self.next = self.initial;
    }
}

pub async fn retry<F, Fut, T, E>(operation_name: &str, config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = config.backoff();
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = operation_name, attempts, "Succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;
                if config.max_retries.is_some_and(|max| attempts >= max) {
                    return Err(err);
                }

                let delay = backoff.next_delay();
                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    max = ?config.max_retries,
                    error = %err,
                    "Operation failed, retrying in {:?}",
                    delay
                );
                sleep(delay).await;
            }
        }
    }
}
