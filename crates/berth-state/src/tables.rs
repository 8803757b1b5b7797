//! The four berth tables.
//!
//! Snapshots hold only the latest state of a machine or rack; the ledger
//! holds every state it has been in. Keys are plain strings and every value
//! is a JSON document.

use redb::TableDefinition;

pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// `machine_id` → latest `Machine`.
pub const MACHINES: JsonTable = TableDefinition::new("machines");

/// `rack_id` → latest `Rack`.
pub const RACKS: JsonTable = TableDefinition::new("racks");

/// `Machine/{id}:{seq:010}` or `Rack/{id}:{seq:010}` → `StateHistoryUpdate`.
/// Ids may contain `:`; the owner is everything before the last one.
pub const STATE_HISTORY: JsonTable = TableDefinition::new("state_history");

/// `{task_id}:{timestamp:020}:{kind}` → `TaskEvent`. The task id is
/// everything before the last two `:`.
pub const TASK_EVENTS: JsonTable = TableDefinition::new("task_events");
