//! Exchange store operation errors.
//!
//! These are local, synchronous failures returned to the control API
//! caller. They are never surfaced to the original HTTP caller.

use thiserror::Error;

use super::state::ExchangeState;
use super::types::ExchangeId;

/// Errors from exchange store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// No exchange with the given id exists (unknown or already evicted).
    #[error("exchange '{id}' not found")]
    NotFound {
        /// The id that was looked up
        id: ExchangeId,
    },

    /// The operation targets a state incompatible with the current state.
    #[error("invalid operation on exchange '{id}': {from} -> {to}")]
    InvalidState {
        /// The exchange id
        id: ExchangeId,
        /// Current state
        from: ExchangeState,
        /// Attempted new state
        to: ExchangeState,
    },

    /// The exchange is already in a terminal state and is immutable.
    #[error("exchange '{id}' is already terminal ({state})")]
    AlreadyTerminal {
        /// The exchange id
        id: ExchangeId,
        /// The current terminal state
        state: ExchangeState,
    },

    /// An edit was submitted outside the stage in which it is valid.
    #[error("exchange '{id}' is in state '{state}', operation requires '{required}'")]
    WrongStage {
        /// The exchange id
        id: ExchangeId,
        /// Current state
        state: ExchangeState,
        /// The state in which the operation is valid
        required: ExchangeState,
    },
}

impl ExchangeError {
    /// Short name for logging and metrics labels.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::InvalidState { .. } | Self::AlreadyTerminal { .. } | Self::WrongStage { .. } => {
                "invalid_state"
            }
        }
    }
}
