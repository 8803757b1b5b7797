//! Turns assignments into running containers.
//!
//! Each assignment is realized on its own spawned task (pull, start,
//! confirm running) so a slow machine never holds up the coordinator.
//! Results come back on the feedback channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use berth_core::{ExecutorConfig, TaskId};
use berth_executor::runtime::container_name;
use berth_executor::{
    ContainerHandle, ContainerSpec, ExecError, ExecResult, RemoteExecutionClient, RuntimeConnector,
};
use berth_scheduler::Assignment;

/// Grace period given to a replaced task's container before it is killed.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Result of one realization or retirement.
#[derive(Debug)]
pub enum Feedback {
    Running {
        assignment: Assignment,
        handle: ContainerHandle,
    },
    Failed {
        task_id: TaskId,
        reason: String,
    },
    /// A replaced task's container is stopped and removed.
    Retired { task_id: TaskId },
    /// Stopping a replaced task's container failed.
    RetireFailed { task_id: TaskId, reason: String },
}

#[derive(Clone)]
pub struct Realizer {
    connector: Arc<dyn RuntimeConnector>,
    config: ExecutorConfig,
    clients: Arc<Mutex<HashMap<String, RemoteExecutionClient>>>,
    feedback: mpsc::UnboundedSender<Feedback>,
}

impl Realizer {
    pub fn new(
        connector: Arc<dyn RuntimeConnector>,
        config: ExecutorConfig,
        feedback: mpsc::UnboundedSender<Feedback>,
    ) -> Self {
        Self {
            connector,
            config,
            clients: Arc::new(Mutex::new(HashMap::new())),
            feedback,
        }
    }

    /// One cached client per host.
    fn client(&self, host: &str) -> ExecResult<RemoteExecutionClient> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(host) {
            return Ok(client.clone());
        }
        let client = RemoteExecutionClient::connect(host, self.connector.as_ref(), &self.config)?;
        debug!(host, "runtime client created");
        clients.insert(host.to_string(), client.clone());
        Ok(client)
    }

    /// Start the assignment's container in the background.
    pub fn realize(&self, assignment: Assignment) {
        let this = self.clone();
        tokio::spawn(async move {
            let task_id = assignment.task.task_id.clone();
            let feedback = match this.start(&assignment).await {
                Ok(handle) => Feedback::Running { assignment, handle },
                Err(e) => {
                    warn!(task_id = %task_id, host = %assignment.host, error = %e, "realization failed");
                    Feedback::Failed {
                        task_id,
                        reason: e.to_string(),
                    }
                }
            };
            this.send(feedback);
        });
    }

    async fn start(&self, assignment: &Assignment) -> ExecResult<ContainerHandle> {
        let client = self.client(&assignment.host)?;
        let mut spec = ContainerSpec::for_task(&assignment.task);
        spec.env.extend(
            assignment
                .ports
                .iter()
                .enumerate()
                .map(|(i, port)| format!("PORT{i}={port}")),
        );

        client.pull(&spec.image).await?;
        let handle = client.start_container(&spec).await?;
        if !handle.running {
            return Err(ExecError::NotRunning {
                name: handle.name.clone(),
            });
        }
        info!(
            task_id = %assignment.task.task_id,
            host = %assignment.host,
            container_id = %handle.container_id,
            pid = handle.pid,
            "task running"
        );
        Ok(handle)
    }

    /// Stop and remove a replaced task's container in the background.
    pub fn retire(&self, task_id: TaskId, host: String) {
        let this = self.clone();
        tokio::spawn(async move {
            let name = container_name(&task_id);
            let result: ExecResult<()> = async {
                let client = this.client(&host)?;
                client.stop_container(&name, STOP_GRACE).await?;
                client.remove_container(&name, false).await
            }
            .await;

            let feedback = match result {
                Ok(()) => Feedback::Retired { task_id },
                // Already gone counts as retired.
                Err(e) if e.is_not_found() => Feedback::Retired { task_id },
                Err(e) => {
                    warn!(task_id = %task_id, host = %host, error = %e, "could not retire replaced task");
                    Feedback::RetireFailed {
                        task_id,
                        reason: e.to_string(),
                    }
                }
            };
            this.send(feedback);
        });
    }

    fn send(&self, feedback: Feedback) {
        if self.feedback.send(feedback).is_err() {
            debug!("coordinator gone, dropping realization feedback");
        }
    }
}
