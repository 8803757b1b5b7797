//! berth-executor — resilient remote execution against container runtimes.
//!
//! Every call to a machine's container runtime goes through
//! [`retry::call_with_retries`], which runs each attempt on its own spawned
//! task under a fixed per-attempt timeout and stops according to a
//! [`RetryPolicy`]:
//!
//! - reads (inspect, list) retry until an overall deadline passes
//! - mutations (pull, start, stop, remove) stop after an attempt ceiling
//!
//! Transient failures are absorbed by the policy; only the terminal,
//! retry-exhausted failure reaches the caller as [`ExecError::Exhausted`].
//!
//! # Architecture
//!
//! ```text
//! RemoteExecutionClient (one per machine host)
//!   ├── RetryPolicy (read / pull / mutation)
//!   └── Arc<dyn ContainerRuntime>
//!       └── DockerRuntime (bollard, tcp://host:port)
//! ```

pub mod client;
pub mod docker;
pub mod error;
pub mod retry;
pub mod runtime;

pub use client::{RemoteExecutionClient, RuntimeConnector};
pub use docker::{DockerConnector, DockerRuntime};
pub use error::{AttemptError, ExecError, ExecResult, OperationKind, RuntimeError, RuntimeResult};
pub use retry::{RetryPolicy, StopStrategy, call_with_retries};
pub use runtime::{ContainerHandle, ContainerInfo, ContainerRuntime, ContainerSpec, ContainerSummary};
