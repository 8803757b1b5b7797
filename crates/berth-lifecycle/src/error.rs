//! Lifecycle error types.

use thiserror::Error;

use berth_core::MachineState;

/// Errors raised by lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: MachineState,
        to: MachineState,
    },

    #[error("unknown machine: {0}")]
    UnknownMachine(String),

    #[error("unknown rack: {0}")]
    UnknownRack(String),

    /// The ledger no longer describes a single linear history.
    #[error("ledger corrupt for {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("state store error: {0}")]
    State(#[from] berth_state::StateError),
}

impl LifecycleError {
    /// Whether the error means in-memory state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LifecycleError::Corrupt { .. })
    }
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;
