//! Per-machine remote execution client.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use berth_core::ExecutorConfig;

use crate::error::{ExecError, ExecResult, OperationKind, RuntimeResult};
use crate::retry::{RetryPolicy, call_with_retries};
use crate::runtime::{
    ContainerHandle, ContainerInfo, ContainerRuntime, ContainerSpec, ContainerSummary,
    TASK_ID_LABEL,
};

/// Opens a runtime connection to a machine by host name.
pub trait RuntimeConnector: Send + Sync {
    fn connect(&self, host: &str) -> RuntimeResult<Arc<dyn ContainerRuntime>>;
}

/// Retrying, time-bounded access to one machine's container runtime.
///
/// Every method returns either the requested value or a single
/// [`ExecError`] once the relevant policy has given up.
#[derive(Clone)]
pub struct RemoteExecutionClient {
    host: String,
    runtime: Arc<dyn ContainerRuntime>,
    read: RetryPolicy,
    pull: RetryPolicy,
    mutation: RetryPolicy,
}

impl std::fmt::Debug for RemoteExecutionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteExecutionClient")
            .field("host", &self.host)
            .field("read", &self.read)
            .field("pull", &self.pull)
            .field("mutation", &self.mutation)
            .finish_non_exhaustive()
    }
}

impl RemoteExecutionClient {
    pub fn new(
        host: impl Into<String>,
        runtime: Arc<dyn ContainerRuntime>,
        config: &ExecutorConfig,
    ) -> Self {
        Self {
            host: host.into(),
            runtime,
            read: RetryPolicy::read(config),
            pull: RetryPolicy::pull(config),
            mutation: RetryPolicy::mutation(config),
        }
    }

    /// Connect through `connector`, failing with [`ExecError::Connect`].
    pub fn connect(
        host: &str,
        connector: &dyn RuntimeConnector,
        config: &ExecutorConfig,
    ) -> ExecResult<Self> {
        let runtime = connector.connect(host).map_err(|source| ExecError::Connect {
            host: host.to_string(),
            source,
        })?;
        Ok(Self::new(host, runtime, config))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn inspect(&self, name: &str) -> ExecResult<ContainerInfo> {
        let runtime = self.runtime.clone();
        let name = name.to_string();
        call_with_retries(OperationKind::Inspect, &self.read, move || {
            let runtime = runtime.clone();
            let name = name.clone();
            async move { runtime.inspect(&name).await }
        })
        .await
    }

    /// Pid of the container's main process, or `None` when it is not running.
    pub async fn get_pid(&self, name: &str) -> ExecResult<Option<u32>> {
        let info = self.inspect(name).await?;
        Ok((info.running && info.pid > 0).then_some(info.pid))
    }

    /// A container that does not exist is not running.
    pub async fn is_container_running(&self, name: &str) -> ExecResult<bool> {
        match self.inspect(name).await {
            Ok(info) => Ok(info.running),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn pull(&self, image: &str) -> ExecResult<()> {
        let runtime = self.runtime.clone();
        let image = image.to_string();
        call_with_retries(OperationKind::Pull, &self.pull, move || {
            let runtime = runtime.clone();
            let image = image.clone();
            async move { runtime.pull(&image).await }
        })
        .await
    }

    pub async fn list_containers(&self) -> ExecResult<Vec<ContainerSummary>> {
        let runtime = self.runtime.clone();
        call_with_retries(OperationKind::List, &self.read, move || {
            let runtime = runtime.clone();
            async move { runtime.list().await }
        })
        .await
    }

    /// Create and start the container, then confirm its state by inspecting it.
    #[instrument(skip(self, spec), fields(host = %self.host, name = %spec.name))]
    pub async fn start_container(&self, spec: &ContainerSpec) -> ExecResult<ContainerHandle> {
        let runtime = self.runtime.clone();
        let owned = spec.clone();
        let container_id = call_with_retries(OperationKind::Start, &self.mutation, move || {
            let runtime = runtime.clone();
            let spec = owned.clone();
            async move { runtime.start(&spec).await }
        })
        .await?;

        let info = self.inspect(&container_id).await?;
        if !info.running {
            warn!(container_id = %container_id, "container exited right after start");
        }
        let task_id = spec.labels.get(TASK_ID_LABEL).cloned();
        let mut handle = ContainerHandle::from_info(info, task_id);
        if handle.name.is_empty() {
            handle.name = spec.name.clone();
        }
        info!(container_id = %handle.container_id, pid = handle.pid, "container confirmed");
        Ok(handle)
    }

    /// Re-inspect the container and update `handle` in place.
    pub async fn refresh(&self, handle: &mut ContainerHandle) -> ExecResult<()> {
        match self.inspect(&handle.container_id).await {
            Ok(info) => handle.apply(info),
            Err(e) if e.is_not_found() => {
                handle.running = false;
                handle.pid = 0;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn stop_container(&self, id: &str, timeout: Duration) -> ExecResult<()> {
        let runtime = self.runtime.clone();
        let id = id.to_string();
        call_with_retries(OperationKind::Stop, &self.mutation, move || {
            let runtime = runtime.clone();
            let id = id.clone();
            async move { runtime.stop(&id, timeout).await }
        })
        .await
    }

    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn remove_container(&self, id: &str, remove_volumes: bool) -> ExecResult<()> {
        let runtime = self.runtime.clone();
        let id = id.to_string();
        call_with_retries(OperationKind::Remove, &self.mutation, move || {
            let runtime = runtime.clone();
            let id = id.clone();
            async move { runtime.remove(&id, remove_volumes).await }
        })
        .await
    }
}
