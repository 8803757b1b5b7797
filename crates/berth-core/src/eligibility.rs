//! Immutable view of machine eligibility handed from the lifecycle manager
//! to the scheduler.

use std::collections::BTreeMap;

use crate::MachineId;
use crate::machine::{Machine, MachineAbstraction, MachineState};

/// Every known machine's current snapshot at one point in time.
///
/// `version` increases with every accepted transition, so a consumer can
/// tell whether it is looking at a newer view.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EligibilitySnapshot {
    pub version: u64,
    pub machines: BTreeMap<MachineId, Machine>,
}

impl EligibilitySnapshot {
    pub fn new(version: u64, machines: impl IntoIterator<Item = Machine>) -> Self {
        Self {
            version,
            machines: machines.into_iter().map(|m| (m.id.clone(), m)).collect(),
        }
    }

    pub fn machine(&self, id: &str) -> Option<&Machine> {
        self.machines.get(id)
    }

    pub fn state(&self, id: &str) -> Option<MachineState> {
        self.machines.get(id).map(|m| m.state())
    }

    /// Unknown machines are never schedulable.
    pub fn is_schedulable(&self, id: &str) -> bool {
        self.state(id).is_some_and(MachineState::is_schedulable)
    }

    pub fn schedulable(&self) -> impl Iterator<Item = &Machine> {
        self.machines.values().filter(|m| m.state().is_schedulable())
    }

    /// Machines whose advertised capacity still counts toward what the
    /// cluster could ever run: anything with a resource snapshot that is
    /// not leaving the cluster.
    pub fn capacity_candidates(&self) -> impl Iterator<Item = &Machine> {
        self.machines.values().filter(|m| {
            let state = m.state();
            m.resources.is_some() && !state.is_decommissioning() && !state.is_terminal()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::StateHistoryUpdate;
    use crate::resources::ResourceBundle;

    fn machine(id: &str, state: MachineState, resources: bool) -> Machine {
        Machine::new(
            id,
            format!("{id}.example"),
            "r1",
            BTreeMap::new(),
            resources.then(|| ResourceBundle::new(4.0, 8192.0)),
            MachineState::Active,
            0,
        )
        .with_state(StateHistoryUpdate::new(id, state, 1))
    }

    #[test]
    fn schedulable_means_known_and_active() {
        let snap = EligibilitySnapshot::new(
            3,
            [
                machine("m1", MachineState::Active, true),
                machine("m2", MachineState::Frozen, true),
            ],
        );

        assert!(snap.is_schedulable("m1"));
        assert!(!snap.is_schedulable("m2"));
        assert!(!snap.is_schedulable("m9"));
        assert_eq!(snap.schedulable().count(), 1);
    }

    #[test]
    fn capacity_candidates_skip_leaving_and_unsized_machines() {
        let snap = EligibilitySnapshot::new(
            1,
            [
                machine("m1", MachineState::Active, true),
                machine("m2", MachineState::Decommissioning, true),
                machine("m3", MachineState::Dead, true),
                machine("m4", MachineState::Active, false),
                machine("m5", MachineState::Decommissioned, true),
            ],
        );

        let ids: Vec<_> = snap.capacity_candidates().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m3"]);
    }
}
