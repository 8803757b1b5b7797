//! berth-lifecycle — the machine lifecycle state machine.
//!
//! Tracks every machine and rack through `ACTIVE`, `FROZEN`, `DEAD`,
//! `MISSING_ON_STARTUP` and the decommission drain
//! (`STARTING_DECOMMISSION` → `DECOMMISSIONING` → `DECOMMISSIONED`).
//!
//! State is copy-on-transition: each accepted change appends one
//! [`StateHistoryUpdate`](berth_core::StateHistoryUpdate) to an arena-backed
//! ledger and replaces the object's current snapshot with a new value.
//! Rejected changes leave the ledger untouched and return
//! [`LifecycleError::InvalidTransition`].
//!
//! Consumers never share the manager's maps: they read an
//! [`EligibilitySnapshot`](berth_core::EligibilitySnapshot) published on a
//! `tokio::sync::watch` channel after every change.

pub mod error;
pub mod health;
pub mod ledger;
pub mod manager;
pub mod transitions;

pub use error::{LifecycleError, LifecycleResult};
pub use health::MissTracker;
pub use ledger::{Ledger, Registry};
pub use manager::{DecommissionOutcome, LifecycleManager, TransitionNote};
pub use transitions::is_allowed;
