//! StateStore — redb-backed persistence for berth.
//!
//! Provides typed operations over machine and rack snapshots, their state
//! ledgers, and task-record events. All values are JSON-serialized into
//! redb's `&[u8]` value columns. The store supports both on-disk and
//! in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use berth_core::{Machine, Rack, StateHistoryUpdate, TaskEvent, TaskRecordSink};

use crate::error::{StateError, StateResult};
use crate::tables::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").finish_non_exhaustive()
    }
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(MACHINES).map_err(map_err!(Table))?;
        txn.open_table(RACKS).map_err(map_err!(Table))?;
        txn.open_table(STATE_HISTORY).map_err(map_err!(Table))?;
        txn.open_table(TASK_EVENTS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Machines ───────────────────────────────────────────────────

    /// Insert or replace the latest snapshot of a machine.
    pub fn put_machine(&self, machine: &Machine) -> StateResult<()> {
        self.put_json(MACHINES, &machine.id, machine)?;
        debug!(machine_id = %machine.id, state = %machine.current_state.state, "machine stored");
        Ok(())
    }

    pub fn get_machine(&self, machine_id: &str) -> StateResult<Option<Machine>> {
        self.get_json(MACHINES, machine_id)
    }

    pub fn list_machines(&self) -> StateResult<Vec<Machine>> {
        self.scan_prefix(MACHINES, "")
    }

    // ── Racks ──────────────────────────────────────────────────────

    /// Insert or replace the latest snapshot of a rack.
    pub fn put_rack(&self, rack: &Rack) -> StateResult<()> {
        self.put_json(RACKS, &rack.id, rack)?;
        debug!(rack_id = %rack.id, state = %rack.current_state.state, "rack stored");
        Ok(())
    }

    pub fn get_rack(&self, rack_id: &str) -> StateResult<Option<Rack>> {
        self.get_json(RACKS, rack_id)
    }

    pub fn list_racks(&self) -> StateResult<Vec<Rack>> {
        self.scan_prefix(RACKS, "")
    }

    // ── State ledger ───────────────────────────────────────────────

    /// Append one ledger entry. Fails if the sequence slot is already taken.
    ///
    /// `type_name` separates the machine and rack namespaces.
    pub fn append_history(
        &self,
        type_name: &str,
        seq: u64,
        update: &StateHistoryUpdate,
    ) -> StateResult<()> {
        let key = history_key(type_name, &update.object_id, seq);
        let value = serde_json::to_vec(update).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(STATE_HISTORY).map_err(map_err!(Table))?;
            if table.get(key.as_str()).map_err(map_err!(Read))?.is_some() {
                return Err(StateError::HistoryConflict(key));
            }
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, "history entry appended");
        Ok(())
    }

    /// One object's ledger, oldest first.
    pub fn list_history(
        &self,
        type_name: &str,
        object_id: &str,
    ) -> StateResult<Vec<StateHistoryUpdate>> {
        let owner = format!("{type_name}/{object_id}");
        self.scan_keys(STATE_HISTORY, |key| history_owner(key) == Some(owner.as_str()))
    }

    // ── Task events ────────────────────────────────────────────────

    pub fn put_task_event(&self, event: &TaskEvent) -> StateResult<()> {
        let key = task_event_key(event);
        self.put_json(TASK_EVENTS, &key, event)?;
        debug!(%key, "task event stored");
        Ok(())
    }

    /// Every recorded event for one task, in timestamp order.
    pub fn list_task_events(&self, task_id: &str) -> StateResult<Vec<TaskEvent>> {
        self.scan_keys(TASK_EVENTS, |key| task_event_owner(key) == Some(task_id))
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn put_json<T: Serialize>(
        &self,
        table_def: JsonTable,
        key: &str,
        value: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(table_def).map_err(map_err!(Table))?;
            table
                .insert(key, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(
        &self,
        table_def: JsonTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value: T =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    fn scan_prefix<T: DeserializeOwned>(
        &self,
        table_def: JsonTable,
        prefix: &str,
    ) -> StateResult<Vec<T>> {
        self.scan_keys(table_def, |key| key.starts_with(prefix))
    }

    /// Values whose key passes `keep`, in key order.
    fn scan_keys<T, F>(&self, table_def: JsonTable, keep: F) -> StateResult<Vec<T>>
    where
        T: DeserializeOwned,
        F: Fn(&str) -> bool,
    {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(table_def).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if keep(key.value()) {
                let item: T =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                results.push(item);
            }
        }
        Ok(results)
    }
}

impl TaskRecordSink for StateStore {
    fn record(&self, event: &TaskEvent) -> anyhow::Result<()> {
        self.put_task_event(event)?;
        Ok(())
    }
}

fn history_key(type_name: &str, object_id: &str, seq: u64) -> String {
    format!("{type_name}/{object_id}:{seq:010}")
}

/// `{type}/{object_id}` of a ledger key. Ids may contain `:`, the sequence
/// never does.
fn history_owner(key: &str) -> Option<&str> {
    key.rsplit_once(':').map(|(owner, _seq)| owner)
}

fn task_event_key(event: &TaskEvent) -> String {
    format!(
        "{}:{:020}:{}",
        event.task_id(),
        event.timestamp(),
        event.kind()
    )
}

/// Task id of a task-event key; the timestamp and kind never contain `:`.
fn task_event_owner(key: &str) -> Option<&str> {
    key.rsplitn(3, ':').nth(2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use berth_core::{MachineAbstraction, MachineState, ResourceBundle};

    fn test_machine(id: &str) -> Machine {
        Machine::new(
            id,
            format!("{id}.example"),
            "r1",
            BTreeMap::from([("zone".to_string(), "a".to_string())]),
            Some(ResourceBundle::new(8.0, 16384.0)),
            MachineState::Active,
            1000,
        )
    }

    // ── Machine snapshots ──────────────────────────────────────────

    #[test]
    fn machine_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let machine = test_machine("m1");

        store.put_machine(&machine).unwrap();
        assert_eq!(store.get_machine("m1").unwrap(), Some(machine));
        assert!(store.get_machine("m2").unwrap().is_none());
    }

    #[test]
    fn machine_snapshot_is_replaced() {
        let store = StateStore::open_in_memory().unwrap();
        let machine = test_machine("m1");
        store.put_machine(&machine).unwrap();

        let frozen = machine.with_state(StateHistoryUpdate::new("m1", MachineState::Frozen, 2000));
        store.put_machine(&frozen).unwrap();

        let all = store.list_machines().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].state(), MachineState::Frozen);
    }

    #[test]
    fn rack_put_and_list() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_rack(&Rack::new("r1", MachineState::Active, 1)).unwrap();
        store.put_rack(&Rack::new("r2", MachineState::Active, 1)).unwrap();

        assert_eq!(store.list_racks().unwrap().len(), 2);
        assert!(store.get_rack("r1").unwrap().is_some());
    }

    // ── Ledger ─────────────────────────────────────────────────────

    #[test]
    fn history_is_returned_in_sequence_order() {
        let store = StateStore::open_in_memory().unwrap();
        let states = [
            MachineState::Active,
            MachineState::StartingDecommission,
            MachineState::Decommissioning,
        ];
        // Insert out of order; keys sort by zero-padded sequence.
        for seq in [2u64, 0, 1] {
            let update = StateHistoryUpdate::new("m1", states[seq as usize], 1000 + seq);
            store.append_history("Machine", seq, &update).unwrap();
        }

        let history = store.list_history("Machine", "m1").unwrap();
        let got: Vec<_> = history.iter().map(|u| u.state).collect();
        assert_eq!(got, states);
    }

    #[test]
    fn history_entries_cannot_be_overwritten() {
        let store = StateStore::open_in_memory().unwrap();
        let update = StateHistoryUpdate::new("m1", MachineState::Active, 1000);
        store.append_history("Machine", 0, &update).unwrap();

        let again = StateHistoryUpdate::new("m1", MachineState::Dead, 2000);
        let err = store.append_history("Machine", 0, &again).unwrap_err();
        assert!(matches!(err, StateError::HistoryConflict(_)));

        let history = store.list_history("Machine", "m1").unwrap();
        assert_eq!(history, vec![update]);
    }

    #[test]
    fn machine_and_rack_histories_do_not_mix() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .append_history("Machine", 0, &StateHistoryUpdate::new("x", MachineState::Active, 1))
            .unwrap();
        store
            .append_history("Rack", 0, &StateHistoryUpdate::new("x", MachineState::Dead, 1))
            .unwrap();

        assert_eq!(store.list_history("Machine", "x").unwrap()[0].state, MachineState::Active);
        assert_eq!(store.list_history("Rack", "x").unwrap()[0].state, MachineState::Dead);
    }

    #[test]
    fn history_prefix_does_not_match_longer_ids() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .append_history("Machine", 0, &StateHistoryUpdate::new("m1", MachineState::Active, 1))
            .unwrap();
        store
            .append_history("Machine", 0, &StateHistoryUpdate::new("m10", MachineState::Active, 1))
            .unwrap();

        assert_eq!(store.list_history("Machine", "m1").unwrap().len(), 1);
    }

    #[test]
    fn history_ignores_ids_that_extend_past_a_colon() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .append_history("Machine", 0, &StateHistoryUpdate::new("m1", MachineState::Active, 1))
            .unwrap();
        for (seq, state) in [(0, MachineState::Active), (1, MachineState::Frozen)] {
            store
                .append_history("Machine", seq, &StateHistoryUpdate::new("m1:b", state, 1 + seq))
                .unwrap();
        }

        let m1 = store.list_history("Machine", "m1").unwrap();
        assert_eq!(m1.len(), 1);
        assert_eq!(m1[0].object_id, "m1");

        let m1b = store.list_history("Machine", "m1:b").unwrap();
        let states: Vec<_> = m1b.iter().map(|u| u.state).collect();
        assert_eq!(states, [MachineState::Active, MachineState::Frozen]);
    }

    // ── Task events ────────────────────────────────────────────────

    #[test]
    fn task_events_of_replacements_stay_separate() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_task_event(&TaskEvent::Rescheduled {
                task_id: "web".to_string(),
                replacement_task_id: "web:re1".to_string(),
                request_id: "web".to_string(),
                reason: "machine m1 is decommissioning".to_string(),
                timestamp: 1000,
            })
            .unwrap();
        store
            .put_task_event(&TaskEvent::Placed {
                task_id: "web:re1".to_string(),
                request_id: "web".to_string(),
                machine_id: "m2".to_string(),
                host: "m2.example".to_string(),
                timestamp: 1100,
            })
            .unwrap();

        let original = store.list_task_events("web").unwrap();
        assert_eq!(original.len(), 1);
        assert_eq!(original[0].kind(), "rescheduled");

        let replacement = store.list_task_events("web:re1").unwrap();
        assert_eq!(replacement.len(), 1);
        assert_eq!(replacement[0].task_id(), "web:re1");
    }

    #[test]
    fn task_events_via_sink() {
        let store = StateStore::open_in_memory().unwrap();
        let sink: &dyn TaskRecordSink = &store;

        sink.record(&TaskEvent::Lost {
            task_id: "t1".to_string(),
            machine_id: "m1".to_string(),
            reason: "machine dead".to_string(),
            timestamp: 2000,
        })
        .unwrap();
        sink.record(&TaskEvent::Placed {
            task_id: "t1".to_string(),
            request_id: "web".to_string(),
            machine_id: "m1".to_string(),
            host: "m1.example".to_string(),
            timestamp: 1000,
        })
        .unwrap();

        let events = store.list_task_events("t1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind(), "placed");
        assert_eq!(events[1].kind(), "lost");
        assert!(store.list_task_events("t2").unwrap().is_empty());
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_machine(&test_machine("m1")).unwrap();
            store
                .append_history("Machine", 0, &StateHistoryUpdate::new("m1", MachineState::Active, 1000))
                .unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert_eq!(store.list_machines().unwrap().len(), 1);
        assert_eq!(store.list_history("Machine", "m1").unwrap().len(), 1);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_machines().unwrap().is_empty());
        assert!(store.list_racks().unwrap().is_empty());
        assert!(store.list_history("Machine", "any").unwrap().is_empty());
        assert!(store.list_task_events("any").unwrap().is_empty());
    }
}
