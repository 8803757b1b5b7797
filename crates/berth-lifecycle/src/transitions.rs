//! The machine state graph.

use berth_core::MachineState;
use berth_core::MachineState::*;

/// Whether a machine (or rack) may move from `from` to `to`.
///
/// `MissingOnStartup` is only ever an initial classification, so nothing
/// transitions into it. `Decommissioned` is terminal.
pub fn is_allowed(from: MachineState, to: MachineState) -> bool {
    matches!(
        (from, to),
        (Active, StartingDecommission)
            | (Active, Dead)
            | (Active, Frozen)
            | (Frozen, Active)
            | (Frozen, StartingDecommission)
            | (StartingDecommission, Decommissioning)
            | (Decommissioning, Decommissioned)
            | (Dead, Active)
            | (MissingOnStartup, Active)
            | (MissingOnStartup, Dead)
    )
}

/// States a reloaded machine is reclassified from at startup.
///
/// Operator intent (frozen, draining) and terminal states survive a restart.
pub fn is_reclassified_on_startup(state: MachineState) -> bool {
    matches!(state, Active | Dead | MissingOnStartup)
}

/// States whose machines count missed health signals.
pub fn tracks_health(state: MachineState) -> bool {
    matches!(state, Active | MissingOnStartup)
}
