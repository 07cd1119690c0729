// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the claim engine coordinator.

/// Engine lifecycle state.
///
/// Use [`super::ClaimEngine::state()`] to check the current state or
/// [`super::ClaimEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, workers not started
    Created,
    /// Preparing transport resources (consumer group, queues)
    Connecting,
    /// Accepting claims; workers not yet draining
    Ready,
    /// Accepting claims and persisting them
    Running,
    /// Workers stopping
    ShuttingDown,
    /// Workers stopped; unacknowledged claims stay with the transport
    Stopped,
}

impl EngineState {
    /// Numeric form for the state gauge.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Connecting => 1,
            Self::Ready => 2,
            Self::Running => 3,
            Self::ShuttingDown => 4,
            Self::Stopped => 5,
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// What a caller gets back from [`super::ClaimEngine::try_admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Admitted; the claim with this id is on its way to the system of record
    Claimed(u64),
    OutOfStock,
    DuplicateClient,
    NotStarted,
    Ended,
    UnknownResource,
}

impl ClaimOutcome {
    #[must_use]
    pub fn claim_id(&self) -> Option<u64> {
        match self {
            Self::Claimed(id) => Some(*id),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClaimOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Claimed(id) => write!(f, "Claimed({})", id),
            Self::OutOfStock => write!(f, "OutOfStock"),
            Self::DuplicateClient => write!(f, "DuplicateClient"),
            Self::NotStarted => write!(f, "NotStarted"),
            Self::Ended => write!(f, "Ended"),
            Self::UnknownResource => write!(f, "UnknownResource"),
        }
    }
}
