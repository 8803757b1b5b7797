//! berthd — the berth daemon's building blocks.
//!
//! Wires the three core components to their external collaborators:
//!
//! - [`events`]: inbound cluster events (offers, machine membership and
//!   health, task feedback, operator requests) as JSON lines
//! - [`coordinator`]: the single-writer loop that owns the scheduler
//! - [`realizer`]: per-assignment container realization on spawned tasks
//! - [`driver`]: outbound accept/decline decisions and task records

pub mod coordinator;
pub mod driver;
pub mod events;
pub mod realizer;

pub use coordinator::Coordinator;
pub use driver::{JsonLinesDriver, ResourceManagerDriver};
pub use events::{ClusterEvent, Envelope, MachineReport, forward_lines};
pub use realizer::{Feedback, Realizer};
