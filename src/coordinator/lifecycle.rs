// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle management: prepare, start, shutdown.

use tracing::{error, info, warn};

use super::{ClaimEngine, EngineState};
use crate::error::EngineError;

impl ClaimEngine {
    pub(super) fn set_state(&self, state: EngineState) {
        self.state.send_replace(state);
        crate::metrics::set_engine_state(state.as_u8());
    }

    /// Create transport resources and start accepting claims, without
    /// starting workers. Admitted claims wait in the transport until
    /// [`start()`](Self::start).
    #[tracing::instrument(skip(self), fields(transport = %self.config.transport))]
    pub async fn prepare(&mut self) -> Result<(), EngineError> {
        match self.state() {
            EngineState::Ready | EngineState::Running => return Ok(()),
            EngineState::Connecting | EngineState::ShuttingDown => {
                return Err(EngineError::NotRunning { state: self.state() });
            }
            EngineState::Created | EngineState::Stopped => {}
        }

        let previous = self.state();
        self.set_state(EngineState::Connecting);

        if let Some(stream) = &self.stream {
            if let Err(e) = stream.ensure_group().await {
                error!(error = %e, "Could not create consumer group");
                self.set_state(previous);
                return Err(e.into());
            }
        }

        self.set_state(EngineState::Ready);
        info!("Claim engine ready");
        Ok(())
    }

    /// Prepare if needed, then start one persistence worker per configured
    /// consumer. Each worker drains its own backlog before taking new claims.
    #[tracing::instrument(skip(self), fields(transport = %self.config.transport, workers = self.config.worker_count))]
    pub async fn start(&mut self) -> Result<(), EngineError> {
        if self.state() == EngineState::Running {
            return Ok(());
        }
        self.prepare().await?;

        self.pipeline.start();
        self.set_state(EngineState::Running);
        info!("Claim engine running");
        Ok(())
    }

    /// Stop accepting claims and stop the workers, waiting for each to
    /// finish the claim it is on. Nothing unacknowledged is lost; it is
    /// redelivered on the next start.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&mut self) {
        match self.state() {
            EngineState::Stopped | EngineState::ShuttingDown => return,
            EngineState::Created => {
                warn!("Shutdown called on an engine that never started");
            }
            _ => {}
        }

        self.set_state(EngineState::ShuttingDown);
        if self.pipeline.is_running() {
            self.pipeline.shutdown().await;
        }
        self.set_state(EngineState::Stopped);
        info!("Claim engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::ClaimEngineConfig;
    use crate::coordinator::Backends;

    fn config() -> ClaimEngineConfig {
        ClaimEngineConfig {
            stream_block_ms: 20,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let mut engine = ClaimEngine::new(config(), Backends::in_memory()).unwrap();
        let mut rx = engine.state_receiver();

        engine.prepare().await.unwrap();
        assert_eq!(engine.state(), EngineState::Ready);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();

        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);

        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(*rx.borrow_and_update(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let mut engine = ClaimEngine::new(config(), Backends::in_memory()).unwrap();
        engine.start().await.unwrap();
        engine.shutdown().await;
        engine.start().await.unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        tokio::time::timeout(Duration::from_secs(5), engine.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let mut engine = ClaimEngine::new(config(), Backends::in_memory()).unwrap();
        engine.shutdown().await;
        engine.shutdown().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }
}
