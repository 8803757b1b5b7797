//! Remote execution error types.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Remote operation being attempted, used to classify terminal failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Inspect,
    List,
    Pull,
    Start,
    Stop,
    Remove,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Inspect => "inspect",
            OperationKind::List => "list",
            OperationKind::Pull => "pull",
            OperationKind::Start => "start",
            OperationKind::Stop => "stop",
            OperationKind::Remove => "remove",
        }
    }

    /// Reads retry until a deadline; everything else has an attempt ceiling.
    pub fn is_read(self) -> bool {
        matches!(self, OperationKind::Inspect | OperationKind::List)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned by a container runtime for a single call.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    /// Whether another attempt could succeed. A missing container stays missing.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RuntimeError::NotFound(_))
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Why a single attempt failed.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("attempt timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("attempt aborted: {0}")]
    Aborted(String),
}

/// Terminal failure of a remote operation.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{op} failed after {attempts} attempt(s): {source}")]
    Exhausted {
        op: OperationKind,
        attempts: u32,
        #[source]
        source: AttemptError,
    },

    #[error("cannot reach container runtime on {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: RuntimeError,
    },

    #[error("container {name} exited right after start")]
    NotRunning { name: String },
}

impl ExecError {
    pub fn operation(&self) -> Option<OperationKind> {
        match self {
            ExecError::Exhausted { op, .. } => Some(*op),
            ExecError::Connect { .. } => None,
            ExecError::NotRunning { .. } => Some(OperationKind::Start),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ExecError::Exhausted {
                source: AttemptError::Runtime(RuntimeError::NotFound(_)),
                ..
            }
        )
    }

    pub fn attempts(&self) -> u32 {
        match self {
            ExecError::Exhausted { attempts, .. } => *attempts,
            ExecError::Connect { .. } | ExecError::NotRunning { .. } => 0,
        }
    }
}

pub type ExecResult<T> = Result<T, ExecError>;
