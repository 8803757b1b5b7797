//! Lifecycle manager — owns every machine and rack snapshot.
//!
//! All state changes go through [`Registry::transition`], so each accepted
//! change is exactly one new ledger entry. After every accepted change the
//! manager persists the new snapshot and publishes a fresh
//! [`EligibilitySnapshot`] on a watch channel; the scheduler reads the
//! latest one at the start of each round.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use berth_core::{
    EligibilitySnapshot, LifecycleConfig, Machine, MachineAbstraction, MachineId, MachineState,
    Rack, StateHistoryUpdate,
};
use berth_state::{StateResult, StateStore};

use crate::error::{LifecycleError, LifecycleResult};
use crate::health::MissTracker;
use crate::ledger::Registry;
use crate::transitions::{is_reclassified_on_startup, tracks_health};

/// Result of checking one draining machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecommissionOutcome {
    pub machine_id: MachineId,
    /// The deadline passed with tasks still attributed to the machine.
    pub forced: bool,
    /// Tasks still on the machine when it was decommissioned.
    pub undrained: usize,
}

/// Who asked for a transition and why.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionNote {
    pub actor: Option<String>,
    pub message: Option<String>,
}

impl TransitionNote {
    pub fn new(actor: Option<String>, message: Option<String>) -> Self {
        Self { actor, message }
    }

    pub fn message(message: impl Into<String>) -> Self {
        Self {
            actor: None,
            message: Some(message.into()),
        }
    }
}

pub struct LifecycleManager {
    machines: Registry<Machine>,
    racks: Registry<Rack>,
    health: MissTracker,
    config: LifecycleConfig,
    store: Option<StateStore>,
    version: u64,
    snapshot_tx: watch::Sender<Arc<EligibilitySnapshot>>,
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("machines", &self.machines.ids())
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl LifecycleManager {
    pub fn new(config: LifecycleConfig) -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(EligibilitySnapshot::default()));
        Self {
            machines: Registry::new(),
            racks: Registry::new(),
            health: MissTracker::new(config.health_miss_threshold),
            config,
            store: None,
            version: 0,
            snapshot_tx,
        }
    }

    /// Persist every accepted change to `store`.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Rebuild from persisted state.
    ///
    /// Machines that were active or dead when the framework stopped are
    /// reclassified `MISSING_ON_STARTUP` until they are seen again.
    pub fn recover(config: LifecycleConfig, store: StateStore, now: u64) -> LifecycleResult<Self> {
        let mut manager = Self::new(config).with_store(store.clone());

        for rack in store.list_racks()? {
            let history = store.list_history(rack.type_name(), &rack.id)?;
            manager.racks.restore(rack, history);
        }
        for machine in store.list_machines()? {
            let history = store.list_history(machine.type_name(), &machine.id)?;
            manager.machines.restore(machine, history);
        }

        let missing: Vec<MachineId> = manager
            .machines
            .values()
            .filter(|m| {
                is_reclassified_on_startup(m.state()) && m.state() != MachineState::MissingOnStartup
            })
            .map(|m| m.id.clone())
            .collect();

        for id in &missing {
            let update = StateHistoryUpdate::new(id.clone(), MachineState::MissingOnStartup, now)
                .with_message(Some("not yet reconnected after restart".to_string()));
            let (machine, seq) = manager.machines.reclassify(id, update)?;
            manager.persist_machine(&machine, seq);
        }

        for id in manager.machines.ids() {
            manager.machines.verify(&id)?;
        }
        for id in manager.racks.ids() {
            manager.racks.verify(&id)?;
        }

        info!(
            machines = manager.machines.ids().len(),
            racks = manager.racks.ids().len(),
            missing = missing.len(),
            "lifecycle state recovered"
        );
        manager.publish();
        Ok(manager)
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    // ── Eligibility ────────────────────────────────────────────────

    pub fn subscribe(&self) -> watch::Receiver<Arc<EligibilitySnapshot>> {
        self.snapshot_tx.subscribe()
    }

    pub fn snapshot(&self) -> Arc<EligibilitySnapshot> {
        self.snapshot_tx.borrow().clone()
    }

    fn publish(&mut self) {
        self.version += 1;
        let snapshot = EligibilitySnapshot::new(self.version, self.machines.values().cloned());
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }

    // ── Lookups ────────────────────────────────────────────────────

    pub fn machine(&self, id: &str) -> Option<&Machine> {
        self.machines.get(id)
    }

    pub fn rack(&self, id: &str) -> Option<&Rack> {
        self.racks.get(id)
    }

    pub fn machines(&self) -> impl Iterator<Item = &Machine> {
        self.machines.values()
    }

    pub fn machines_in_state(&self, state: MachineState) -> Vec<MachineId> {
        self.machines
            .values()
            .filter(|m| m.state() == state)
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn history(&self, id: &str) -> Vec<StateHistoryUpdate> {
        self.machines.history(id)
    }

    pub fn rack_history(&self, id: &str) -> Vec<StateHistoryUpdate> {
        self.racks.history(id)
    }

    /// Check that a machine's ledger is one linear history ending in its
    /// current state.
    pub fn verify_ledger(&self, id: &str) -> LifecycleResult<()> {
        self.machines.verify(id)
    }

    pub fn verify_all(&self) -> LifecycleResult<()> {
        for id in self.machines.ids() {
            self.machines.verify(&id)?;
        }
        for id in self.racks.ids() {
            self.racks.verify(&id)?;
        }
        Ok(())
    }

    // ── Membership and health ──────────────────────────────────────

    /// A machine was seen by the resource manager.
    ///
    /// New machines start `ACTIVE`. Known machines get their attributes and
    /// advertised resources refreshed, and come back to `ACTIVE` if they were
    /// dead or missing since startup.
    pub fn observe_machine(&mut self, seen: Machine, now: u64) -> LifecycleResult<MachineState> {
        let Some(existing) = self.machines.get(&seen.id).cloned() else {
            let machine = Machine::new(
                seen.id.clone(),
                seen.host,
                seen.rack_id,
                seen.attributes,
                seen.resources,
                MachineState::Active,
                now,
            );
            self.ensure_rack(&machine.rack_id, now);
            let seq = self.machines.insert(machine.clone());
            self.persist_machine(&machine, seq);
            self.health.signal(&machine.id);
            info!(machine = %machine.name(), rack_id = %machine.rack_id, "machine registered");
            self.sync_rack(&machine.rack_id, now)?;
            self.publish();
            return self.follow_rack(&machine.id, now);
        };

        let mut refreshed = existing.with_attributes(seen.attributes);
        if let Some(resources) = seen.resources {
            refreshed = refreshed.with_resources(resources);
        }
        if refreshed != existing {
            debug!(machine_id = %existing.id, "machine attributes refreshed");
            self.machines.refresh(refreshed.clone())?;
            self.persist_snapshot(&refreshed);
            self.publish();
        }
        self.health_signal(&existing.id, now)
    }

    /// A health signal arrived for `id`.
    pub fn health_signal(&mut self, id: &str, now: u64) -> LifecycleResult<MachineState> {
        let state = self
            .machines
            .get(id)
            .map(|m| m.state())
            .ok_or_else(|| LifecycleError::UnknownMachine(id.to_string()))?;
        self.health.signal(id);

        match state {
            MachineState::Dead | MachineState::MissingOnStartup => {
                self.apply(id, MachineState::Active, TransitionNote::message("reconnected"), now)?;
                self.follow_rack(id, now)
            }
            other => Ok(other),
        }
    }

    /// Close one health interval. Returns machines that just became `DEAD`.
    pub fn health_sweep(&mut self, now: u64) -> LifecycleResult<Vec<MachineId>> {
        let tracked: Vec<MachineId> = self
            .machines
            .values()
            .filter(|m| tracks_health(m.state()))
            .map(|m| m.id.clone())
            .collect();

        let expired = self.health.sweep(tracked.iter().map(String::as_str));
        let mut dead = Vec::with_capacity(expired.len());
        for id in expired {
            let note = TransitionNote::message(format!(
                "missed {} consecutive health signals",
                self.config.health_miss_threshold
            ));
            self.apply(&id, MachineState::Dead, note, now)?;
            dead.push(id);
        }
        Ok(dead)
    }

    /// The resource manager reported the machine gone.
    ///
    /// Returns whether the machine moved to `DEAD`. Machines outside the
    /// health-tracked states keep their state; their tasks are still lost.
    pub fn machine_lost(&mut self, id: &str, reason: &str, now: u64) -> LifecycleResult<bool> {
        let state = self
            .machines
            .get(id)
            .map(|m| m.state())
            .ok_or_else(|| LifecycleError::UnknownMachine(id.to_string()))?;
        if !tracks_health(state) {
            debug!(machine_id = %id, %state, "machine lost outside health-tracked state");
            return Ok(false);
        }
        self.apply(id, MachineState::Dead, TransitionNote::message(reason), now)?;
        Ok(true)
    }

    // ── Operator actions ───────────────────────────────────────────

    /// `ACTIVE`/`FROZEN` → `STARTING_DECOMMISSION`.
    pub fn decommission(
        &mut self,
        id: &str,
        actor: Option<String>,
        reason: Option<String>,
        now: u64,
    ) -> LifecycleResult<Machine> {
        self.apply(
            id,
            MachineState::StartingDecommission,
            TransitionNote::new(actor, reason),
            now,
        )
    }

    /// The scheduler has started moving the machine's tasks elsewhere.
    pub fn begin_decommissioning(&mut self, id: &str, now: u64) -> LifecycleResult<Machine> {
        self.apply(
            id,
            MachineState::Decommissioning,
            TransitionNote::message("rescheduling running tasks"),
            now,
        )
    }

    pub fn freeze(&mut self, id: &str, actor: Option<String>, now: u64) -> LifecycleResult<Machine> {
        self.apply(id, MachineState::Frozen, TransitionNote::new(actor, None), now)
    }

    pub fn unfreeze(&mut self, id: &str, actor: Option<String>, now: u64) -> LifecycleResult<Machine> {
        self.apply(id, MachineState::Active, TransitionNote::new(actor, None), now)
    }

    /// Start decommissioning a rack and every active or frozen machine on it.
    ///
    /// Returns the machines moved to `STARTING_DECOMMISSION`.
    pub fn decommission_rack(
        &mut self,
        rack_id: &str,
        actor: Option<String>,
        reason: Option<String>,
        now: u64,
    ) -> LifecycleResult<Vec<MachineId>> {
        if !self.racks.contains(rack_id) {
            return Err(LifecycleError::UnknownRack(rack_id.to_string()));
        }
        let update = StateHistoryUpdate::new(rack_id, MachineState::StartingDecommission, now)
            .with_actor(actor.clone())
            .with_message(reason.clone());
        let (rack, seq) = self.racks.transition(rack_id, update)?;
        self.persist_rack(&rack, seq);
        info!(rack_id, "rack decommission started");

        let targets: Vec<MachineId> = self
            .machines
            .values()
            .filter(|m| {
                m.rack_id == rack_id
                    && matches!(m.state(), MachineState::Active | MachineState::Frozen)
            })
            .map(|m| m.id.clone())
            .collect();

        for id in &targets {
            self.apply(
                id,
                MachineState::StartingDecommission,
                TransitionNote::new(actor.clone(), reason.clone()),
                now,
            )?;
        }
        self.sync_rack(rack_id, now)?;
        self.publish();
        Ok(targets)
    }

    /// Finish draining machines.
    ///
    /// A `DECOMMISSIONING` machine with no tasks left becomes
    /// `DECOMMISSIONED`. One that still has tasks after the decommission
    /// deadline is forced there, and its remaining tasks count as lost.
    pub fn check_decommissions<F>(&mut self, tasks_on: F, now: u64) -> LifecycleResult<Vec<DecommissionOutcome>>
    where
        F: Fn(&str) -> usize,
    {
        let deadline = self.config.decommission_deadline.get().as_millis() as u64;
        let draining: Vec<(MachineId, u64)> = self
            .machines
            .values()
            .filter(|m| m.state() == MachineState::Decommissioning)
            .map(|m| (m.id.clone(), m.current_state.timestamp))
            .collect();

        let mut outcomes = Vec::new();
        for (id, since) in draining {
            let undrained = tasks_on(&id);
            let forced = undrained > 0;
            if forced && now.saturating_sub(since) < deadline {
                continue;
            }

            let note = if forced {
                warn!(machine_id = %id, undrained, "decommission deadline exceeded, forcing");
                TransitionNote::message(format!(
                    "decommission deadline exceeded with {undrained} task(s) undrained"
                ))
            } else {
                TransitionNote::message("all tasks drained")
            };
            self.apply(&id, MachineState::Decommissioned, note, now)?;
            outcomes.push(DecommissionOutcome {
                machine_id: id,
                forced,
                undrained,
            });
        }
        Ok(outcomes)
    }

    // ── Internals ──────────────────────────────────────────────────

    /// Apply one machine transition and everything that follows from it.
    fn apply(
        &mut self,
        id: &str,
        to: MachineState,
        note: TransitionNote,
        now: u64,
    ) -> LifecycleResult<Machine> {
        let update = StateHistoryUpdate::new(id, to, now)
            .with_actor(note.actor)
            .with_message(note.message);
        let (machine, seq) = match self.machines.transition(id, update) {
            Ok(applied) => applied,
            Err(e) => {
                if let LifecycleError::InvalidTransition { from, to, .. } = &e {
                    warn!(machine_id = %id, %from, %to, "transition rejected");
                }
                return Err(e);
            }
        };

        // Entering a tracked state starts a fresh interval.
        if tracks_health(to) {
            self.health.signal(id);
        } else {
            self.health.forget(id);
        }
        self.persist_machine(&machine, seq);

        let current = &machine.current_state;
        info!(
            machine = %machine.name(),
            state = %current.state,
            actor = current.actor.as_deref().unwrap_or("-"),
            message = current.message.as_deref().unwrap_or("-"),
            "machine state changed"
        );

        self.sync_rack(&machine.rack_id, now)?;
        self.publish();
        Ok(machine)
    }

    /// An active machine on a decommissioning or decommissioned rack starts
    /// its own decommission. Returns the machine's resulting state.
    fn follow_rack(&mut self, id: &str, now: u64) -> LifecycleResult<MachineState> {
        let Some((state, rack_id)) = self.machines.get(id).map(|m| (m.state(), m.rack_id.clone()))
        else {
            return Err(LifecycleError::UnknownMachine(id.to_string()));
        };
        let rack_state = self.racks.get(&rack_id).map(|r| r.state());
        let draining = rack_state.is_some_and(|s| {
            matches!(
                s,
                MachineState::StartingDecommission
                    | MachineState::Decommissioning
                    | MachineState::Decommissioned
            )
        });
        if state != MachineState::Active || !draining {
            return Ok(state);
        }

        let note = TransitionNote::message(format!("rack {rack_id} is decommissioning"));
        let machine = self.apply(id, MachineState::StartingDecommission, note, now)?;
        Ok(machine.state())
    }

    fn ensure_rack(&mut self, rack_id: &str, now: u64) {
        if self.racks.contains(rack_id) {
            return;
        }
        let rack = Rack::new(rack_id, MachineState::Active, now);
        let seq = self.racks.insert(rack.clone());
        self.persist_rack(&rack, seq);
        info!(rack_id, "rack registered");
    }

    /// Move a rack along with its machines.
    fn sync_rack(&mut self, rack_id: &str, now: u64) -> LifecycleResult<()> {
        loop {
            let Some(rack_state) = self.racks.get(rack_id).map(|r| r.state()) else {
                return Ok(());
            };
            let states: BTreeSet<MachineState> = self
                .machines
                .values()
                .filter(|m| m.rack_id == rack_id)
                .map(|m| m.state())
                .collect();
            if states.is_empty() {
                return Ok(());
            }
            // Dead machines may still reconnect; only decommissioned ones are done.
            let settled = |s: &MachineState| {
                matches!(s, MachineState::Decommissioned | MachineState::Dead)
            };
            let done = |s: &MachineState| *s == MachineState::Decommissioned;

            let next = match rack_state {
                MachineState::StartingDecommission
                    if states.contains(&MachineState::Decommissioning)
                        || states.iter().all(settled) =>
                {
                    MachineState::Decommissioning
                }
                MachineState::Decommissioning if states.iter().all(done) => {
                    MachineState::Decommissioned
                }
                MachineState::Active if states.iter().all(|s| *s == MachineState::Dead) => {
                    MachineState::Dead
                }
                MachineState::Dead if states.contains(&MachineState::Active) => MachineState::Active,
                _ => return Ok(()),
            };

            let update = StateHistoryUpdate::new(rack_id, next, now)
                .with_message(Some("following its machines".to_string()));
            let (rack, seq) = self.racks.transition(rack_id, update)?;
            self.persist_rack(&rack, seq);
            info!(rack_id, state = %next, "rack state changed");
        }
    }

    fn persist_machine(&self, machine: &Machine, seq: u64) {
        self.persist(machine, seq, |store| store.put_machine(machine));
    }

    fn persist_rack(&self, rack: &Rack, seq: u64) {
        self.persist(rack, seq, |store| store.put_rack(rack));
    }

    fn persist_snapshot(&self, machine: &Machine) {
        if let Some(store) = &self.store {
            if let Err(e) = store.put_machine(machine) {
                error!(machine_id = %machine.id, error = %e, "failed to persist machine");
            }
        }
    }

    /// Store the ledger entry and the snapshot. Failures are logged only.
    fn persist<T, F>(&self, snapshot: &T, seq: u64, put: F)
    where
        T: MachineAbstraction,
        F: FnOnce(&StateStore) -> StateResult<()>,
    {
        let Some(store) = &self.store else {
            return;
        };
        let result = store
            .append_history(snapshot.type_name(), seq, snapshot.current_state())
            .and_then(|()| put(store));
        if let Err(e) = result {
            error!(
                kind = snapshot.type_name(),
                id = %snapshot.id(),
                seq,
                error = %e,
                "failed to persist state change"
            );
        }
    }
}
