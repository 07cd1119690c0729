// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Top-level error returned by [`crate::ClaimEngine`].
//!
//! Business outcomes (out of stock, duplicate client, window closed) are not
//! errors; they come back as [`crate::ClaimOutcome`].

use thiserror::Error;

use crate::cache::CacheError;
use crate::pipeline::PipelineError;
use crate::storage::traits::StorageError;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("engine is {state}, not accepting claims")]
    NotRunning { state: crate::coordinator::EngineState },

    /// Stock was taken and the intent recorded, but the claim never reached
    /// the transport. The claim id is kept so an operator can reconcile it.
    #[error("claim {claim_id} admitted but not enqueued: {source}")]
    Enqueue {
        claim_id: u64,
        #[source]
        source: PipelineError,
    },
}

impl EngineError {
    /// Worth retrying the same call later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(e) => e.is_transient(),
            Self::Cache(CacheError::Store(e)) => e.is_transient(),
            Self::Cache(CacheError::Contended { .. }) => true,
            Self::Pipeline(PipelineError::Transport(_) | PipelineError::QueueFull { .. }) => true,
            _ => false,
        }
    }
}
