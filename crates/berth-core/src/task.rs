//! Task requests and the task-record events emitted to external stores.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::resources::Resources;
use crate::{MachineId, RackId, RequestId, TaskId};

/// Placement constraints for a task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementConstraints {
    /// Every pair must be present on the machine.
    pub required_attributes: BTreeMap<String, String>,
    /// No pair may be present on the machine.
    pub avoided_attributes: BTreeMap<String, String>,
    /// When non-empty, only these racks are acceptable.
    pub allowed_racks: Vec<RackId>,
    /// Pin the task to one machine.
    pub machine: Option<MachineId>,
    /// Spread replicas of the same request across racks.
    pub spread_across_racks: bool,
}

/// Desired task, as submitted to the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub request_id: RequestId,
    pub resources: Resources,
    #[serde(default)]
    pub constraints: PlacementConstraints,
    /// Higher runs first.
    #[serde(default)]
    pub priority: i32,
    /// Container image to run on the chosen machine.
    pub image: String,
    #[serde(default)]
    pub env: Vec<String>,
}

/// Outbound record of a task's fate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEvent {
    /// Container confirmed running on the machine.
    Placed {
        task_id: TaskId,
        request_id: RequestId,
        machine_id: MachineId,
        host: String,
        timestamp: u64,
    },
    Lost {
        task_id: TaskId,
        machine_id: MachineId,
        reason: String,
        timestamp: u64,
    },
    /// No known machine could ever satisfy the task.
    Unschedulable {
        task_id: TaskId,
        request_id: RequestId,
        reason: String,
        timestamp: u64,
    },
    Rescheduled {
        task_id: TaskId,
        replacement_task_id: TaskId,
        request_id: RequestId,
        reason: String,
        timestamp: u64,
    },
}

impl TaskEvent {
    pub fn task_id(&self) -> &str {
        match self {
            TaskEvent::Placed { task_id, .. }
            | TaskEvent::Lost { task_id, .. }
            | TaskEvent::Unschedulable { task_id, .. }
            | TaskEvent::Rescheduled { task_id, .. } => task_id,
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            TaskEvent::Placed { timestamp, .. }
            | TaskEvent::Lost { timestamp, .. }
            | TaskEvent::Unschedulable { timestamp, .. }
            | TaskEvent::Rescheduled { timestamp, .. } => *timestamp,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TaskEvent::Placed { .. } => "placed",
            TaskEvent::Lost { .. } => "lost",
            TaskEvent::Unschedulable { .. } => "unschedulable",
            TaskEvent::Rescheduled { .. } => "rescheduled",
        }
    }
}

/// Destination for task-record events. Durability is the sink's concern.
pub trait TaskRecordSink: Send + Sync {
    fn record(&self, event: &TaskEvent) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_request_defaults_optional_fields() {
        let json = r#"{
            "task_id": "web:1",
            "request_id": "web",
            "resources": { "cpus": 1.0, "memory_mb": 512.0 },
            "image": "nginx:1.27"
        }"#;
        let req: TaskRequest = serde_json::from_str(json).unwrap();

        assert_eq!(req.priority, 0);
        assert_eq!(req.resources.num_ports, 0);
        assert!(!req.constraints.spread_across_racks);
        assert!(req.env.is_empty());
    }

    #[test]
    fn task_event_is_tagged() {
        let event = TaskEvent::Lost {
            task_id: "t1".to_string(),
            machine_id: "m1".to_string(),
            reason: "machine dead".to_string(),
            timestamp: 42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "lost");
        assert_eq!(event.task_id(), "t1");
        assert_eq!(event.kind(), "lost");
        assert_eq!(event.timestamp(), 42);
    }
}
