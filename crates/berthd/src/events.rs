//! Inbound cluster events, one JSON object per line.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use berth_core::{Machine, MachineId, MachineState, Offer, RackId, ResourceBundle, TaskId, TaskRequest};

/// A machine as reported by the resource manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineReport {
    pub machine_id: MachineId,
    pub host: String,
    pub rack_id: RackId,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Option<ResourceBundle>,
}

impl MachineReport {
    pub fn into_machine(self, now: u64) -> Machine {
        Machine::new(
            self.machine_id,
            self.host,
            self.rack_id,
            self.attributes,
            self.resources,
            MachineState::Active,
            now,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterEvent {
    // Resource manager
    Offers {
        offers: Vec<Offer>,
    },
    MachineSeen(MachineReport),
    MachineAttributesChanged(MachineReport),
    MachineLost {
        machine_id: MachineId,
        #[serde(default = "default_lost_reason")]
        reason: String,
    },
    HealthSignal {
        machine_id: MachineId,
    },
    /// Closes one health-check interval.
    HealthTick,

    // Task layer
    TaskSubmitted {
        task: TaskRequest,
    },
    TaskFinished {
        task_id: TaskId,
    },
    TaskFailed {
        task_id: TaskId,
        reason: String,
    },

    // Operator
    Decommission {
        machine_id: MachineId,
        #[serde(default)]
        actor: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
    Freeze {
        machine_id: MachineId,
        #[serde(default)]
        actor: Option<String>,
    },
    Unfreeze {
        machine_id: MachineId,
        #[serde(default)]
        actor: Option<String>,
    },
    DecommissionRack {
        rack_id: RackId,
        #[serde(default)]
        actor: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    },
}

fn default_lost_reason() -> String {
    "reported lost by resource manager".to_string()
}

impl ClusterEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterEvent::Offers { .. } => "offers",
            ClusterEvent::MachineSeen(_) => "machine_seen",
            ClusterEvent::MachineAttributesChanged(_) => "machine_attributes_changed",
            ClusterEvent::MachineLost { .. } => "machine_lost",
            ClusterEvent::HealthSignal { .. } => "health_signal",
            ClusterEvent::HealthTick => "health_tick",
            ClusterEvent::TaskSubmitted { .. } => "task_submitted",
            ClusterEvent::TaskFinished { .. } => "task_finished",
            ClusterEvent::TaskFailed { .. } => "task_failed",
            ClusterEvent::Decommission { .. } => "decommission",
            ClusterEvent::Freeze { .. } => "freeze",
            ClusterEvent::Unfreeze { .. } => "unfreeze",
            ClusterEvent::DecommissionRack { .. } => "decommission_rack",
        }
    }
}

/// An event plus an optional timestamp (Unix epoch milliseconds). Events
/// without one are stamped on arrival.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at: Option<u64>,
    #[serde(flatten)]
    pub event: ClusterEvent,
}

impl Envelope {
    pub fn now(event: ClusterEvent) -> Self {
        Self { at: None, event }
    }

    pub fn at(at: u64, event: ClusterEvent) -> Self {
        Self { at: Some(at), event }
    }
}

/// Parse newline-delimited events from `reader` and forward them.
///
/// Blank lines are skipped and malformed ones logged and dropped. Returns
/// the number of events forwarded; stops early if the receiver is gone.
pub async fn forward_lines<R>(reader: R, tx: mpsc::Sender<Envelope>) -> anyhow::Result<usize>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut line_no = 0usize;
    let mut forwarded = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Envelope>(line) {
            Ok(envelope) => {
                if tx.send(envelope).await.is_err() {
                    debug!(line = line_no, "event receiver closed");
                    break;
                }
                forwarded += 1;
            }
            Err(e) => warn!(line = line_no, error = %e, "skipping malformed event"),
        }
    }
    Ok(forwarded)
}
