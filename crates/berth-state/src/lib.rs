//! berth-state — embedded state store for berth.
//!
//! Backed by [redb](https://docs.rs/redb), persists the latest machine and
//! rack snapshots, the append-only state-history ledger for each of them,
//! and the task-record events the scheduler emits.
//!
//! Ledger keys embed a zero-padded sequence number so a prefix scan returns
//! one object's history in order. History entries are insert-only; writing
//! an existing key is rejected.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::StateStore;
