//! Container runtime abstraction.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use berth_core::{TaskId, TaskRequest};

use crate::error::RuntimeResult;

/// Label carrying the berth task id on every container we create.
pub const TASK_ID_LABEL: &str = "berth.task-id";

/// What to create when starting a task's container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub cpus: f64,
    pub memory_mb: f64,
    pub labels: HashMap<String, String>,
}

impl ContainerSpec {
    /// Container for a placed task.
    pub fn for_task(task: &TaskRequest) -> Self {
        Self {
            name: container_name(&task.task_id),
            image: task.image.clone(),
            env: task.env.clone(),
            cpus: task.resources.cpus,
            memory_mb: task.resources.memory_mb,
            labels: HashMap::from([(TASK_ID_LABEL.to_string(), task.task_id.clone())]),
        }
    }
}

/// Container name derived from a task id.
///
/// Docker names allow `[a-zA-Z0-9][a-zA-Z0-9_.-]`; everything else becomes `_`.
pub fn container_name(task_id: &str) -> String {
    let sanitized: String = task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("berth-{sanitized}")
}

/// Result of inspecting one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: Option<String>,
    /// Host pid of the container's main process; 0 when not running.
    pub pid: u32,
    pub running: bool,
}

/// One row of a container listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    pub image: Option<String>,
    pub state: Option<String>,
}

/// The client-side view of a task's container.
///
/// Only [`crate::RemoteExecutionClient`] creates or updates these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    pub container_id: String,
    pub name: String,
    pub task_id: Option<TaskId>,
    pub pid: u32,
    pub running: bool,
}

impl ContainerHandle {
    pub(crate) fn from_info(info: ContainerInfo, task_id: Option<TaskId>) -> Self {
        Self {
            container_id: info.id,
            name: info.name,
            task_id,
            pid: info.pid,
            running: info.running,
        }
    }

    pub(crate) fn apply(&mut self, info: ContainerInfo) {
        self.container_id = info.id;
        self.pid = info.pid;
        self.running = info.running;
    }
}

/// A single machine's container runtime.
///
/// Implementations perform exactly one call per method; retrying and
/// timeouts belong to the caller.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    async fn inspect(&self, name: &str) -> RuntimeResult<ContainerInfo>;

    async fn pull(&self, image: &str) -> RuntimeResult<()>;

    async fn list(&self) -> RuntimeResult<Vec<ContainerSummary>>;

    /// Create and start a container, returning its id.
    async fn start(&self, spec: &ContainerSpec) -> RuntimeResult<String>;

    async fn stop(&self, id: &str, grace: Duration) -> RuntimeResult<()>;

    async fn remove(&self, id: &str, remove_volumes: bool) -> RuntimeResult<()>;
}
