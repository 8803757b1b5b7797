//! Machine and rack snapshots.
//!
//! Machines and racks share one shape (id, first-seen time, current
//! state) expressed through [`MachineAbstraction`]. Snapshots are
//! immutable: a state change produces a new value via
//! [`MachineAbstraction::with_state`], never an in-place edit.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::resources::ResourceBundle;
use crate::{MachineId, RackId};

/// Lifecycle state of a machine or rack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MachineState {
    Active,
    StartingDecommission,
    Decommissioning,
    Decommissioned,
    Dead,
    MissingOnStartup,
    Frozen,
}

impl MachineState {
    /// Only `Active` machines receive new placements.
    pub fn is_schedulable(self) -> bool {
        self == MachineState::Active
    }

    pub fn is_terminal(self) -> bool {
        self == MachineState::Decommissioned
    }

    /// Either phase of the drain protocol.
    pub fn is_decommissioning(self) -> bool {
        matches!(
            self,
            MachineState::StartingDecommission | MachineState::Decommissioning
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MachineState::Active => "ACTIVE",
            MachineState::StartingDecommission => "STARTING_DECOMMISSION",
            MachineState::Decommissioning => "DECOMMISSIONING",
            MachineState::Decommissioned => "DECOMMISSIONED",
            MachineState::Dead => "DEAD",
            MachineState::MissingOnStartup => "MISSING_ON_STARTUP",
            MachineState::Frozen => "FROZEN",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a machine's append-only state ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateHistoryUpdate {
    /// Id of the machine or rack this entry belongs to.
    pub object_id: String,
    pub state: MachineState,
    /// Unix epoch milliseconds.
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StateHistoryUpdate {
    pub fn new(object_id: impl Into<String>, state: MachineState, timestamp: u64) -> Self {
        Self {
            object_id: object_id.into(),
            state,
            timestamp,
            actor: None,
            message: None,
        }
    }

    pub fn with_actor(mut self, actor: Option<String>) -> Self {
        self.actor = actor;
        self
    }

    pub fn with_message(mut self, message: Option<String>) -> Self {
        self.message = message;
        self
    }
}

/// Capabilities shared by machines and racks.
pub trait MachineAbstraction: Clone + fmt::Debug + Send + Sync + 'static {
    fn id(&self) -> &str;
    fn first_seen_at(&self) -> u64;
    fn current_state(&self) -> &StateHistoryUpdate;
    /// Human-readable name for logs.
    fn name(&self) -> String;
    fn type_name(&self) -> &'static str;
    /// A new snapshot identical to `self` except for its current state.
    fn with_state(&self, update: StateHistoryUpdate) -> Self;

    fn state(&self) -> MachineState {
        self.current_state().state
    }
}

/// The scheduler's view of a worker node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: MachineId,
    pub host: String,
    pub rack_id: RackId,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    /// Advertised total capacity, when known.
    #[serde(default)]
    pub resources: Option<ResourceBundle>,
    pub first_seen_at: u64,
    pub current_state: StateHistoryUpdate,
}

impl Machine {
    /// A machine first observed at `now` in the given initial state.
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        rack_id: impl Into<String>,
        attributes: BTreeMap<String, String>,
        resources: Option<ResourceBundle>,
        initial: MachineState,
        now: u64,
    ) -> Self {
        let id = id.into();
        Self {
            current_state: StateHistoryUpdate::new(id.clone(), initial, now),
            id,
            host: host.into(),
            rack_id: rack_id.into(),
            attributes,
            resources,
            first_seen_at: now,
        }
    }

    /// A copy with refreshed advertised capacity; the state is unchanged.
    pub fn with_resources(&self, resources: ResourceBundle) -> Self {
        Self {
            resources: Some(resources),
            ..self.clone()
        }
    }

    /// A copy with refreshed attributes; the state is unchanged.
    pub fn with_attributes(&self, attributes: BTreeMap<String, String>) -> Self {
        Self {
            attributes,
            ..self.clone()
        }
    }
}

impl MachineAbstraction for Machine {
    fn id(&self) -> &str {
        &self.id
    }

    fn first_seen_at(&self) -> u64 {
        self.first_seen_at
    }

    fn current_state(&self) -> &StateHistoryUpdate {
        &self.current_state
    }

    fn name(&self) -> String {
        format!("{} ({})", self.host, self.id)
    }

    fn type_name(&self) -> &'static str {
        "Machine"
    }

    fn with_state(&self, update: StateHistoryUpdate) -> Self {
        Self {
            current_state: update,
            ..self.clone()
        }
    }
}

/// A rack, keyed by rack id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rack {
    pub id: RackId,
    pub first_seen_at: u64,
    pub current_state: StateHistoryUpdate,
}

impl Rack {
    pub fn new(id: impl Into<String>, initial: MachineState, now: u64) -> Self {
        let id = id.into();
        Self {
            current_state: StateHistoryUpdate::new(id.clone(), initial, now),
            id,
            first_seen_at: now,
        }
    }
}

impl MachineAbstraction for Rack {
    fn id(&self) -> &str {
        &self.id
    }

    fn first_seen_at(&self) -> u64 {
        self.first_seen_at
    }

    fn current_state(&self) -> &StateHistoryUpdate {
        &self.current_state
    }

    fn name(&self) -> String {
        self.id.clone()
    }

    fn type_name(&self) -> &'static str {
        "Rack"
    }

    fn with_state(&self, update: StateHistoryUpdate) -> Self {
        Self {
            current_state: update,
            ..self.clone()
        }
    }
}
