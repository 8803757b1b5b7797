//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("task already known to the scheduler: {0}")]
    DuplicateTask(String),

    #[error("task not found: {0}")]
    UnknownTask(String),

    #[error("invalid request for task {task_id}: {reason}")]
    InvalidRequest { task_id: String, reason: String },
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
