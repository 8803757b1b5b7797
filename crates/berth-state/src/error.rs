//! Failures of the machine/rack ledger store.
//!
//! redb and serde_json errors are flattened to strings so callers only see
//! which stage failed.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open berth database: {0}")]
    Open(String),

    #[error("berth database transaction failed: {0}")]
    Transaction(String),

    #[error("cannot open berth table: {0}")]
    Table(String),

    #[error("reading berth state failed: {0}")]
    Read(String),

    #[error("writing berth state failed: {0}")]
    Write(String),

    #[error("cannot encode berth record: {0}")]
    Serialize(String),

    #[error("stored berth record is unreadable: {0}")]
    Deserialize(String),

    /// A ledger slot is written once; a second write means two writers
    /// disagree about a machine's history.
    #[error("ledger entry {0} already written")]
    HistoryConflict(String),
}
