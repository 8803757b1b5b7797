//! Append-only state ledger and the copy-on-transition registry built on it.
//!
//! Every ledger entry lives in one arena; each object keeps the arena
//! positions of its own entries, so `(id, seq)` addresses an entry and the
//! last position is the current state. Entries are never edited or removed.

use std::collections::{BTreeMap, HashMap};

use berth_core::{MachineAbstraction, StateHistoryUpdate};

use crate::error::{LifecycleError, LifecycleResult};
use crate::transitions::is_allowed;

#[derive(Debug, Default)]
pub struct Ledger {
    arena: Vec<StateHistoryUpdate>,
    index: HashMap<String, Vec<usize>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry for `update.object_id`, returning its sequence number.
    pub fn append(&mut self, update: StateHistoryUpdate) -> u64 {
        let slots = self.index.entry(update.object_id.clone()).or_default();
        slots.push(self.arena.len());
        self.arena.push(update);
        (slots.len() - 1) as u64
    }

    pub fn last(&self, id: &str) -> Option<&StateHistoryUpdate> {
        self.index
            .get(id)
            .and_then(|slots| slots.last())
            .map(|&i| &self.arena[i])
    }

    pub fn entry(&self, id: &str, seq: u64) -> Option<&StateHistoryUpdate> {
        let slot = *self.index.get(id)?.get(usize::try_from(seq).ok()?)?;
        self.arena.get(slot)
    }

    /// One object's entries, oldest first.
    pub fn history<'a>(&'a self, id: &str) -> impl Iterator<Item = &'a StateHistoryUpdate> + 'a {
        self.index
            .get(id)
            .into_iter()
            .flatten()
            .map(|&i| &self.arena[i])
    }

    pub fn len_of(&self, id: &str) -> usize {
        self.index.get(id).map_or(0, Vec::len)
    }

    /// Check that `id`'s entries form one linear history ending in `current`.
    pub fn verify(&self, id: &str, current: &StateHistoryUpdate) -> LifecycleResult<()> {
        let corrupt = |reason: String| LifecycleError::Corrupt {
            id: id.to_string(),
            reason,
        };
        let slots = self
            .index
            .get(id)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| corrupt("no ledger entries".to_string()))?;

        for pair in slots.windows(2) {
            if pair[0] >= pair[1] {
                return Err(corrupt(format!("entries out of order at arena {}", pair[1])));
            }
            let (prev, next) = (&self.arena[pair[0]], &self.arena[pair[1]]);
            if next.timestamp < prev.timestamp {
                return Err(corrupt(format!(
                    "timestamp went backwards: {} -> {}",
                    prev.timestamp, next.timestamp
                )));
            }
        }
        if let Some((seq, stray)) = slots
            .iter()
            .enumerate()
            .find(|&(_, &i)| self.arena[i].object_id != id)
        {
            return Err(corrupt(format!(
                "entry {seq} belongs to {}",
                self.arena[*stray].object_id
            )));
        }

        let last = &self.arena[slots[slots.len() - 1]];
        if last != current {
            return Err(corrupt(format!(
                "current state {} differs from last ledger entry {}",
                current.state, last.state
            )));
        }
        Ok(())
    }
}

/// Current snapshots of one kind of object plus their shared ledger.
#[derive(Debug)]
pub struct Registry<T> {
    current: BTreeMap<String, T>,
    ledger: Ledger,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            current: BTreeMap::new(),
            ledger: Ledger::new(),
        }
    }
}

impl<T: MachineAbstraction> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly seen object. Its initial state becomes entry 0.
    pub fn insert(&mut self, snapshot: T) -> u64 {
        let seq = self.ledger.append(snapshot.current_state().clone());
        self.current.insert(snapshot.id().to_string(), snapshot);
        seq
    }

    /// Rebuild an object from persisted history. The last history entry
    /// wins over the stored snapshot's state.
    pub fn restore(&mut self, snapshot: T, history: Vec<StateHistoryUpdate>) {
        if history.is_empty() {
            self.insert(snapshot);
            return;
        }
        let mut last = None;
        for update in history {
            last = Some(update.clone());
            self.ledger.append(update);
        }
        let snapshot = match last {
            Some(update) if &update != snapshot.current_state() => snapshot.with_state(update),
            _ => snapshot,
        };
        self.current.insert(snapshot.id().to_string(), snapshot);
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.current.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.current.contains_key(id)
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.current.values()
    }

    /// Swap in a refreshed snapshot whose state is unchanged.
    pub fn refresh(&mut self, snapshot: T) -> LifecycleResult<()> {
        let id = snapshot.id().to_string();
        let existing = self
            .current
            .get(&id)
            .ok_or_else(|| LifecycleError::UnknownMachine(id.clone()))?;
        if existing.current_state() != snapshot.current_state() {
            return Err(LifecycleError::Corrupt {
                id,
                reason: "refresh would change state outside the ledger".to_string(),
            });
        }
        self.current.insert(id, snapshot);
        Ok(())
    }

    /// Apply an allowed transition, producing a new snapshot.
    ///
    /// The update's timestamp is raised to the previous entry's if the clock
    /// went backwards.
    pub fn transition(&mut self, id: &str, update: StateHistoryUpdate) -> LifecycleResult<(T, u64)> {
        let existing = self
            .current
            .get(id)
            .ok_or_else(|| LifecycleError::UnknownMachine(id.to_string()))?;
        let from = existing.state();
        if !is_allowed(from, update.state) {
            return Err(LifecycleError::InvalidTransition {
                id: id.to_string(),
                from,
                to: update.state,
            });
        }
        let existing = existing.clone();
        Ok(self.append_unchecked(existing, update))
    }

    /// Append without consulting the state graph. Only startup
    /// reclassification goes through here.
    pub(crate) fn reclassify(&mut self, id: &str, update: StateHistoryUpdate) -> LifecycleResult<(T, u64)> {
        let existing = self
            .current
            .get(id)
            .cloned()
            .ok_or_else(|| LifecycleError::UnknownMachine(id.to_string()))?;
        Ok(self.append_unchecked(existing, update))
    }

    fn append_unchecked(&mut self, existing: T, mut update: StateHistoryUpdate) -> (T, u64) {
        let id = existing.id().to_string();
        if let Some(prev) = self.ledger.last(&id) {
            update.timestamp = update.timestamp.max(prev.timestamp);
        }
        update.object_id = id.clone();
        let seq = self.ledger.append(update.clone());
        let next = existing.with_state(update);
        self.current.insert(id, next.clone());
        (next, seq)
    }

    pub fn history(&self, id: &str) -> Vec<StateHistoryUpdate> {
        self.ledger.history(id).cloned().collect()
    }

    pub fn entry(&self, id: &str, seq: u64) -> Option<&StateHistoryUpdate> {
        self.ledger.entry(id, seq)
    }

    pub fn verify(&self, id: &str) -> LifecycleResult<()> {
        let current = self
            .current
            .get(id)
            .ok_or_else(|| LifecycleError::UnknownMachine(id.to_string()))?;
        self.ledger.verify(id, current.current_state())
    }

    pub fn ids(&self) -> Vec<String> {
        self.current.keys().cloned().collect()
    }

    pub fn ledger_len(&self, id: &str) -> usize {
        self.ledger.len_of(id)
    }
}
