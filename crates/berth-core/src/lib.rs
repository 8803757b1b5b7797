//! berth-core — shared types for the berth scheduler framework.
//!
//! Everything that crosses a crate boundary lives here: resource
//! quantities and port ranges, resource offers, the machine/rack
//! snapshot model with its state enum, task requests and the task-record
//! events emitted to external stores, plus the `berth.toml` config model.

pub mod config;
pub mod eligibility;
pub mod machine;
pub mod resources;
pub mod task;

pub use config::{
    BerthConfig, ConfigError, ConfigResult, ExecutorConfig, HumanDuration, LifecycleConfig,
    OrderingPolicy, SchedulerConfig, StateConfig, parse_duration,
};
pub use eligibility::EligibilitySnapshot;
pub use machine::{Machine, MachineAbstraction, MachineState, Rack, StateHistoryUpdate};
pub use resources::{Offer, PortRange, ResourceBundle, Resources};
pub use task::{PlacementConstraints, TaskEvent, TaskRecordSink, TaskRequest};

use std::time::{SystemTime, UNIX_EPOCH};

/// Identifier of a machine (agent) as assigned by the resource manager.
pub type MachineId = String;

/// Identifier of a rack.
pub type RackId = String;

/// Identifier of a single resource offer.
pub type OfferId = String;

/// Identifier of a single task (one replica of a request).
pub type TaskId = String;

/// Identifier of the request a task belongs to.
pub type RequestId = String;

/// Current Unix epoch in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
