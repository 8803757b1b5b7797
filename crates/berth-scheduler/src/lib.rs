//! berth-scheduler — offer matching and placement bookkeeping.
//!
//! Turns batches of resource offers into accept/decline decisions:
//!
//! - Pending tasks wait in a queue ordered by priority and waiting time
//! - Each offer takes the first tasks that satisfy their constraints and
//!   fit its remaining capacity
//! - Spread requests prefer the rack holding the fewest replicas
//! - Tasks no known machine can hold are reported unschedulable; tasks
//!   that keep losing offers are reported starved
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   ├── PendingQueue (policy-ordered pending tasks)
//!   ├── matcher (constraints, capacity envelope)
//!   └── PlacementRegistry (assigned tasks → machine, rack, replacement)
//! ```
//!
//! The scheduler never performs I/O; its caller realizes assignments and
//! feeds results back.

pub mod error;
pub mod matcher;
pub mod placements;
pub mod queue;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use matcher::{CapacityEnvelope, Rejection};
pub use placements::{Placement, PlacementRegistry};
pub use queue::{PendingQueue, PendingTask};
pub use scheduler::{
    AcceptedOffer, Assignment, DeclineReason, DeclinedOffer, RoundOutcome, Scheduler, StarvedTask,
};
