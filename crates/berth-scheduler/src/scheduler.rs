//! Offer-matching scheduler.
//!
//! A round takes one batch of offers plus the eligibility snapshot that was
//! current when the round started. Offers are handled in arrival order; for
//! each one the pending queue is scanned in policy order and the first task
//! that passes its constraints and fits what is left of the offer is
//! assigned, until nothing else fits. Offers that received no task are
//! declined with the configured refuse-for duration.
//!
//! The scheduler does no I/O. Assignments are realized by the caller, which
//! reports back through [`Scheduler::task_failed`] and
//! [`Scheduler::task_finished`].

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;
use tracing::{debug, info, warn};

use berth_core::{
    EligibilitySnapshot, HumanDuration, MachineId, Offer, OfferId, RackId, RequestId,
    ResourceBundle, SchedulerConfig, TaskEvent, TaskId, TaskRequest,
};

use crate::error::{SchedulerError, SchedulerResult};
use crate::matcher::{CapacityEnvelope, Rejection, check_constraints, impossible_reason};
use crate::placements::{Placement, PlacementRegistry};
use crate::queue::{PendingQueue, PendingTask};

/// One task bound to one offer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assignment {
    pub offer_id: OfferId,
    pub machine_id: MachineId,
    pub host: String,
    pub rack_id: RackId,
    pub task: TaskRequest,
    pub ports: Vec<u16>,
    /// Task to stop once this one runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaces: Option<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceptedOffer {
    pub offer_id: OfferId,
    pub machine_id: MachineId,
    pub assignments: Vec<Assignment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    /// The offering machine is not schedulable.
    Ineligible,
    NoMatch,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeclinedOffer {
    pub offer_id: OfferId,
    pub machine_id: MachineId,
    pub refuse_for: HumanDuration,
    pub reason: DeclineReason,
}

/// A pending task that keeps fitting offers but losing them to other tasks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StarvedTask {
    pub task_id: TaskId,
    pub request_id: RequestId,
    pub lost_races: u32,
}

/// Everything one round decided.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoundOutcome {
    pub accepted: Vec<AcceptedOffer>,
    pub declined: Vec<DeclinedOffer>,
    pub unschedulable: Vec<TaskId>,
    pub starved: Vec<StarvedTask>,
    /// Task-record events produced by the round (unschedulable tasks).
    pub events: Vec<TaskEvent>,
}

impl RoundOutcome {
    pub fn assignments(&self) -> impl Iterator<Item = &Assignment> {
        self.accepted.iter().flat_map(|a| a.assignments.iter())
    }
}

#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    queue: PendingQueue,
    placements: PlacementRegistry,
    next_replacement: u64,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            queue: PendingQueue::new(config.ordering),
            config,
            placements: PlacementRegistry::new(),
            next_replacement: 0,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Enqueue a new task. Ids must be unique across pending and placed tasks.
    pub fn submit(&mut self, request: TaskRequest, now: u64) -> SchedulerResult<()> {
        if self.placements.contains(&request.task_id) {
            return Err(SchedulerError::DuplicateTask(request.task_id));
        }
        if let Some((field, value)) = request.resources.invalid_quantity() {
            return Err(SchedulerError::InvalidRequest {
                task_id: request.task_id,
                reason: format!("{field} must be a finite non-negative number, got {value}"),
            });
        }
        debug!(
            task_id = %request.task_id,
            request_id = %request.request_id,
            priority = request.priority,
            "task submitted"
        );
        self.queue.push(request, now, None)
    }

    // ── Rounds ─────────────────────────────────────────────────────

    /// Match one batch of offers against the pending queue.
    pub fn run_round(
        &mut self,
        offers: Vec<Offer>,
        snapshot: &EligibilitySnapshot,
        now: u64,
    ) -> RoundOutcome {
        let mut outcome = RoundOutcome::default();
        self.reject_impossible(snapshot, now, &mut outcome);

        let mut seen = HashSet::new();
        let mut eligible: Vec<Offer> = Vec::new();
        for offer in offers {
            if !seen.insert(offer.id.clone()) {
                warn!(offer = %offer.id, "offer repeated within one batch, ignoring");
                continue;
            }
            if snapshot.is_schedulable(&offer.machine_id) {
                eligible.push(offer);
            } else {
                debug!(
                    offer = %offer.id,
                    machine_id = %offer.machine_id,
                    state = ?snapshot.state(&offer.machine_id),
                    "offer from unschedulable machine"
                );
                outcome
                    .declined
                    .push(self.decline(&offer, DeclineReason::Ineligible));
            }
        }

        let mut remaining: Vec<ResourceBundle> =
            eligible.iter().map(|o| o.resources.clone()).collect();
        let mut raced: BTreeSet<TaskId> = BTreeSet::new();

        for idx in 0..eligible.len() {
            let mut assignments = Vec::new();
            while let Some(task_id) = self.pick(idx, &eligible, &remaining) {
                match self.assign(&task_id, &eligible[idx], &mut remaining[idx]) {
                    Some(assignment) => assignments.push(assignment),
                    None => break,
                }
            }

            let offer = &eligible[idx];
            if assignments.is_empty() {
                debug!(offer = %offer.id, machine_id = %offer.machine_id, "no pending task matches offer");
                outcome
                    .declined
                    .push(self.decline(offer, DeclineReason::NoMatch));
                continue;
            }

            for task in self.queue.iter() {
                let req = &task.request;
                if check_constraints(&req.constraints, offer).is_ok()
                    && offer.resources.fits(&req.resources)
                    && !remaining[idx].fits(&req.resources)
                {
                    raced.insert(req.task_id.clone());
                }
            }

            info!(
                offer = %offer.id,
                machine_id = %offer.machine_id,
                tasks = assignments.len(),
                "offer accepted"
            );
            outcome.accepted.push(AcceptedOffer {
                offer_id: offer.id.clone(),
                machine_id: offer.machine_id.clone(),
                assignments,
            });
        }

        self.record_races(raced, &mut outcome);

        info!(
            snapshot_version = snapshot.version,
            accepted = outcome.accepted.len(),
            declined = outcome.declined.len(),
            unschedulable = outcome.unschedulable.len(),
            pending = self.queue.len(),
            "scheduling round complete"
        );
        outcome
    }

    /// First queued task that may take the offer at `idx`.
    fn pick(&self, idx: usize, offers: &[Offer], remaining: &[ResourceBundle]) -> Option<TaskId> {
        let offer = &offers[idx];
        for task in self.queue.iter() {
            match self.admit(task, idx, offers, remaining) {
                Ok(()) => return Some(task.request.task_id.clone()),
                Err(rejection) => {
                    debug!(offer = %offer.id, task_id = %task.task_id(), %rejection, "task skipped");
                }
            }
        }
        None
    }

    fn admit(
        &self,
        task: &PendingTask,
        idx: usize,
        offers: &[Offer],
        remaining: &[ResourceBundle],
    ) -> Result<(), Rejection> {
        let req = &task.request;
        let offer = &offers[idx];
        check_constraints(&req.constraints, offer)?;
        if !remaining[idx].fits(&req.resources) {
            return Err(Rejection::Resources);
        }
        if req.constraints.spread_across_racks {
            if let Some(rack) = self.preferred_rack(req, idx, offers, remaining) {
                if rack != offer.rack_id {
                    return Err(Rejection::RackSpread);
                }
            }
        }
        Ok(())
    }

    /// Among racks of the offers not yet handled that could take `req`, the
    /// one with the fewest placed replicas of its request. Ties go to the
    /// lowest rack id.
    fn preferred_rack<'a>(
        &self,
        req: &TaskRequest,
        idx: usize,
        offers: &'a [Offer],
        remaining: &[ResourceBundle],
    ) -> Option<&'a str> {
        let counts = self.placements.replicas_per_rack(&req.request_id);
        offers
            .iter()
            .zip(remaining)
            .skip(idx)
            .filter(|(o, left)| {
                left.fits(&req.resources) && check_constraints(&req.constraints, o).is_ok()
            })
            .map(|(o, _)| (counts.get(&o.rack_id).copied().unwrap_or(0), o.rack_id.as_str()))
            .min()
            .map(|(_, rack)| rack)
    }

    fn assign(
        &mut self,
        task_id: &str,
        offer: &Offer,
        remaining: &mut ResourceBundle,
    ) -> Option<Assignment> {
        let pending = self.queue.get(task_id)?;
        let ports = remaining.take(&pending.request.resources)?;
        let pending = self.queue.remove(task_id)?;

        info!(
            task_id = %task_id,
            request_id = %pending.request.request_id,
            offer = %offer.id,
            machine_id = %offer.machine_id,
            rack = %offer.rack_id,
            "task assigned"
        );

        self.placements.insert(Placement {
            request: pending.request.clone(),
            machine_id: offer.machine_id.clone(),
            rack_id: offer.rack_id.clone(),
            ports: ports.clone(),
            replaces: pending.replaces.clone(),
            replacement: None,
        });

        Some(Assignment {
            offer_id: offer.id.clone(),
            machine_id: offer.machine_id.clone(),
            host: offer.host.clone(),
            rack_id: offer.rack_id.clone(),
            task: pending.request,
            ports,
            replaces: pending.replaces,
        })
    }

    fn reject_impossible(&mut self, snapshot: &EligibilitySnapshot, now: u64, outcome: &mut RoundOutcome) {
        let envelope = CapacityEnvelope::from_snapshot(snapshot);
        let doomed: Vec<(TaskId, String)> = self
            .queue
            .iter()
            .filter_map(|t| {
                impossible_reason(&t.request, envelope.as_ref(), snapshot)
                    .map(|reason| (t.request.task_id.clone(), reason))
            })
            .collect();

        for (task_id, reason) in doomed {
            let Some(task) = self.queue.remove(&task_id) else {
                continue;
            };
            warn!(
                task_id = %task_id,
                request_id = %task.request.request_id,
                %reason,
                "task is unschedulable"
            );
            if let Some(old) = &task.replaces {
                if let Some(p) = self.placements.get_mut(old) {
                    p.replacement = None;
                }
            }
            outcome.events.push(TaskEvent::Unschedulable {
                task_id: task_id.clone(),
                request_id: task.request.request_id,
                reason,
                timestamp: now,
            });
            outcome.unschedulable.push(task_id);
        }
    }

    fn record_races(&mut self, raced: BTreeSet<TaskId>, outcome: &mut RoundOutcome) {
        let threshold = self.config.starvation_races.max(1);
        for task_id in raced {
            let Some(task) = self.queue.get_mut(&task_id) else {
                continue;
            };
            task.lost_races += 1;
            if task.lost_races < threshold {
                continue;
            }
            warn!(
                task_id = %task_id,
                lost_races = task.lost_races,
                "task starved: keeps losing offers to other tasks"
            );
            outcome.starved.push(StarvedTask {
                task_id: task_id.clone(),
                request_id: task.request.request_id.clone(),
                lost_races: task.lost_races,
            });
            task.lost_races = 0;
        }
    }

    fn decline(&self, offer: &Offer, reason: DeclineReason) -> DeclinedOffer {
        DeclinedOffer {
            offer_id: offer.id.clone(),
            machine_id: offer.machine_id.clone(),
            refuse_for: self.config.offer_refuse_for,
            reason,
        }
    }

    // ── Machine events ─────────────────────────────────────────────

    /// Enqueue a replacement for every task on a decommissioning machine.
    ///
    /// The old tasks stay attributed to the machine until the caller reports
    /// them finished, which it does once their replacements run.
    pub fn drain_machine(&mut self, machine_id: &str, now: u64) -> Vec<TaskEvent> {
        let reason = format!("machine {machine_id} is decommissioning");
        let mut events = Vec::new();
        for task_id in self.placements.on_machine(machine_id) {
            let Some(placement) = self.placements.get(&task_id) else {
                continue;
            };
            if placement.replacement.is_some() {
                continue;
            }
            let request = placement.request.clone();
            if let Some(event) =
                self.enqueue_replacement(&task_id, request, Some(task_id.clone()), &reason, now)
            {
                events.push(event);
            }
        }
        info!(machine_id = %machine_id, rescheduled = events.len(), "draining machine");
        events
    }

    /// Forget every task on a machine that is gone and enqueue replacements.
    pub fn machine_lost(&mut self, machine_id: &str, reason: &str, now: u64) -> Vec<TaskEvent> {
        let mut events = Vec::new();
        for task_id in self.placements.on_machine(machine_id) {
            let Some(lost) = self.placements.remove(&task_id) else {
                continue;
            };
            events.push(TaskEvent::Lost {
                task_id: task_id.clone(),
                machine_id: machine_id.to_string(),
                reason: reason.to_string(),
                timestamp: now,
            });

            if self.release_replacement(&lost) {
                continue;
            }
            // A lost replacement hands its predecessor on to the next one.
            let predecessor = lost.replaces.filter(|old| self.placements.contains(old));
            if let Some(event) =
                self.enqueue_replacement(&task_id, lost.request, predecessor, reason, now)
            {
                events.push(event);
            }
        }
        if !events.is_empty() {
            warn!(machine_id = %machine_id, %reason, events = events.len(), "tasks lost with machine");
        }
        events
    }

    // ── Task feedback ──────────────────────────────────────────────

    /// The task stopped for good, or a pending task was withdrawn.
    pub fn task_finished(&mut self, task_id: &str) -> SchedulerResult<()> {
        if let Some(done) = self.placements.remove(task_id) {
            debug!(task_id = %task_id, machine_id = %done.machine_id, "task finished");
            self.release_replacement(&done);
            return Ok(());
        }
        if self.queue.remove(task_id).is_some() {
            debug!(task_id = %task_id, "pending task withdrawn");
            return Ok(());
        }
        Err(SchedulerError::UnknownTask(task_id.to_string()))
    }

    /// Realization of a placed task failed. The task goes back to the queue
    /// under the same id unless a replacement is already on its way.
    pub fn task_failed(&mut self, task_id: &str, reason: &str, now: u64) -> SchedulerResult<bool> {
        let failed = self
            .placements
            .remove(task_id)
            .ok_or_else(|| SchedulerError::UnknownTask(task_id.to_string()))?;

        if self.release_replacement(&failed) {
            warn!(task_id = %task_id, %reason, "task failed while being replaced");
            return Ok(false);
        }

        warn!(
            task_id = %task_id,
            machine_id = %failed.machine_id,
            %reason,
            "task failed, re-enqueueing"
        );
        let predecessor = failed.replaces.filter(|old| self.placements.contains(old));
        self.queue.push(failed.request, now, predecessor)?;
        Ok(true)
    }

    /// Detach the replacement of a task that is gone. Returns whether one existed.
    fn release_replacement(&mut self, gone: &Placement) -> bool {
        let Some(next) = &gone.replacement else {
            return false;
        };
        if let Some(pending) = self.queue.get_mut(next) {
            pending.replaces = None;
            return true;
        }
        if let Some(placed) = self.placements.get_mut(next) {
            placed.replaces = None;
            return true;
        }
        false
    }

    fn enqueue_replacement(
        &mut self,
        old_task: &str,
        mut request: TaskRequest,
        replaces: Option<TaskId>,
        reason: &str,
        now: u64,
    ) -> Option<TaskEvent> {
        let replacement_id = self.replacement_id(&request.request_id);
        request.task_id = replacement_id.clone();
        let request_id = request.request_id.clone();

        if let Err(e) = self.queue.push(request, now, replaces.clone()) {
            warn!(task_id = %old_task, error = %e, "could not enqueue replacement");
            return None;
        }
        if let Some(p) = replaces.as_deref().and_then(|old| self.placements.get_mut(old)) {
            p.replacement = Some(replacement_id.clone());
        }

        debug!(task_id = %old_task, replacement = %replacement_id, "replacement enqueued");
        Some(TaskEvent::Rescheduled {
            task_id: old_task.to_string(),
            replacement_task_id: replacement_id,
            request_id,
            reason: reason.to_string(),
            timestamp: now,
        })
    }

    fn replacement_id(&mut self, request_id: &str) -> TaskId {
        loop {
            self.next_replacement += 1;
            let id = format!("{request_id}:re{}", self.next_replacement);
            if !self.queue.contains(&id) && !self.placements.contains(&id) {
                return id;
            }
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn tasks_on(&self, machine_id: &str) -> Vec<TaskId> {
        self.placements.on_machine(machine_id)
    }

    pub fn count_on(&self, machine_id: &str) -> usize {
        self.placements.count_on(machine_id)
    }

    pub fn tasks_per_machine(&self) -> BTreeMap<MachineId, usize> {
        self.placements.tasks_per_machine()
    }

    pub fn placement(&self, task_id: &str) -> Option<&Placement> {
        self.placements.get(task_id)
    }

    pub fn pending(&self) -> impl Iterator<Item = &PendingTask> {
        self.queue.iter()
    }

    pub fn pending_task(&self, task_id: &str) -> Option<&PendingTask> {
        self.queue.get(task_id)
    }

    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    pub fn placed_len(&self) -> usize {
        self.placements.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    use berth_core::{
        Machine, MachineAbstraction, MachineState, PlacementConstraints, PortRange, Resources,
        StateHistoryUpdate,
    };

    fn task(id: &str, request: &str, cpus: f64, mem: f64, priority: i32) -> TaskRequest {
        TaskRequest {
            task_id: id.to_string(),
            request_id: request.to_string(),
            resources: Resources::new(cpus, mem),
            constraints: PlacementConstraints::default(),
            priority,
            image: "busybox".to_string(),
            env: vec![],
        }
    }

    fn offer(id: &str, machine: &str, rack: &str, cpus: f64, mem: f64) -> Offer {
        Offer {
            id: id.to_string(),
            machine_id: machine.to_string(),
            host: format!("{machine}.example"),
            rack_id: rack.to_string(),
            resources: ResourceBundle::new(cpus, mem),
            attributes: BTreeMap::new(),
        }
    }

    fn machine(id: &str, rack: &str, state: MachineState, cpus: f64, mem: f64) -> Machine {
        let m = Machine::new(
            id,
            format!("{id}.example"),
            rack,
            BTreeMap::new(),
            Some(ResourceBundle::new(cpus, mem)),
            MachineState::Active,
            0,
        );
        if state == MachineState::Active {
            m
        } else {
            m.with_state(StateHistoryUpdate::new(id, state, 1))
        }
    }

    fn active(ids: &[(&str, &str)]) -> EligibilitySnapshot {
        EligibilitySnapshot::new(
            1,
            ids.iter()
                .map(|(id, rack)| machine(id, rack, MachineState::Active, 16.0, 65536.0)),
        )
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(SchedulerConfig::default())
    }

    #[test]
    fn earlier_task_wins_priority_tie_and_later_stays_pending() {
        let mut s = scheduler();
        s.submit(task("A", "svc", 2.0, 2048.0, 1), 0).unwrap();
        s.submit(task("B", "svc", 3.0, 4096.0, 1), 1).unwrap();

        let snap = active(&[("m1", "r1")]);
        let out = s.run_round(vec![offer("o1", "m1", "r1", 4.0, 8192.0)], &snap, 10);

        assert_eq!(out.accepted.len(), 1);
        assert!(out.declined.is_empty());
        let placed: Vec<_> = out.assignments().map(|a| a.task.task_id.as_str()).collect();
        assert_eq!(placed, vec!["A"]);

        assert_eq!(s.pending_len(), 1);
        let b = s.pending_task("B").unwrap();
        // B fit the whole offer but not what A left of it.
        assert_eq!(b.lost_races, 1);
        assert_eq!(s.tasks_on("m1"), vec!["A".to_string()]);
    }

    #[test]
    fn assignments_never_overcommit_an_offer() {
        let mut s = scheduler();
        for i in 0..6 {
            let mut t = task(&format!("t{i}"), "svc", 1.5, 1000.0, 0);
            t.resources = t.resources.with_ports(2);
            s.submit(t, i).unwrap();
        }

        let mut o = offer("o1", "m1", "r1", 4.0, 8192.0);
        o.resources = o
            .resources
            .with_ports(vec![PortRange::new(31000, 31002), PortRange::new(32000, 32001)]);
        let snap = active(&[("m1", "r1")]);
        let out = s.run_round(vec![o], &snap, 10);

        let assigned: Vec<&Assignment> = out.assignments().collect();
        assert_eq!(assigned.len(), 2);
        let cpus: f64 = assigned.iter().map(|a| a.task.resources.cpus).sum();
        assert!(cpus <= 4.0);

        let mut ports: Vec<u16> = assigned.iter().flat_map(|a| a.ports.clone()).collect();
        assert_eq!(ports.len(), 4);
        ports.sort();
        ports.dedup();
        assert_eq!(ports.len(), 4, "ports allocated twice");
    }

    #[test]
    fn higher_priority_goes_first() {
        let mut s = scheduler();
        s.submit(task("low", "svc", 3.0, 1024.0, 0), 0).unwrap();
        s.submit(task("high", "svc", 3.0, 1024.0, 10), 50).unwrap();

        let snap = active(&[("m1", "r1")]);
        let out = s.run_round(vec![offer("o1", "m1", "r1", 4.0, 8192.0)], &snap, 100);

        let placed: Vec<_> = out.assignments().map(|a| a.task.task_id.clone()).collect();
        assert_eq!(placed, vec!["high".to_string()]);
    }

    #[test]
    fn unmatched_offer_is_declined_with_refuse_for() {
        let mut s = Scheduler::new(SchedulerConfig {
            offer_refuse_for: HumanDuration::from_secs(120),
            ..SchedulerConfig::default()
        });
        s.submit(task("big", "svc", 8.0, 1024.0, 0), 0).unwrap();

        let snap = active(&[("m1", "r1")]);
        let out = s.run_round(vec![offer("o1", "m1", "r1", 4.0, 8192.0)], &snap, 10);

        assert!(out.accepted.is_empty());
        assert_eq!(out.declined.len(), 1);
        assert_eq!(out.declined[0].reason, DeclineReason::NoMatch);
        assert_eq!(out.declined[0].refuse_for.get(), Duration::from_secs(120));
        assert_eq!(s.pending_len(), 1);
    }

    #[test]
    fn offers_from_unschedulable_machines_are_declined() {
        let mut s = scheduler();
        s.submit(task("t1", "svc", 1.0, 128.0, 0), 0).unwrap();

        let snap = EligibilitySnapshot::new(
            3,
            [
                machine("m1", "r1", MachineState::Decommissioning, 8.0, 8192.0),
                machine("m2", "r1", MachineState::Frozen, 8.0, 8192.0),
                machine("m3", "r1", MachineState::Active, 8.0, 8192.0),
            ],
        );
        let out = s.run_round(
            vec![
                offer("o1", "m1", "r1", 8.0, 8192.0),
                offer("o2", "m2", "r1", 8.0, 8192.0),
                offer("o9", "unknown", "r1", 8.0, 8192.0),
            ],
            &snap,
            10,
        );

        assert!(out.accepted.is_empty());
        assert_eq!(out.declined.len(), 3);
        assert!(out
            .declined
            .iter()
            .all(|d| d.reason == DeclineReason::Ineligible));
        assert_eq!(s.pending_len(), 1);
    }

    #[test]
    fn repeated_offer_in_batch_is_used_once() {
        let mut s = scheduler();
        s.submit(task("t1", "svc", 2.0, 128.0, 0), 0).unwrap();
        s.submit(task("t2", "svc", 2.0, 128.0, 0), 1).unwrap();

        let snap = active(&[("m1", "r1")]);
        let o = offer("o1", "m1", "r1", 2.0, 8192.0);
        let out = s.run_round(vec![o.clone(), o], &snap, 10);

        assert_eq!(out.assignments().count(), 1);
        assert!(out.declined.is_empty());
    }

    #[test]
    fn task_bigger_than_every_machine_is_unschedulable() {
        let mut s = scheduler();
        s.submit(task("huge", "svc", 64.0, 1024.0, 0), 0).unwrap();
        s.submit(task("ok", "svc", 1.0, 1024.0, 0), 1).unwrap();

        let snap = active(&[("m1", "r1"), ("m2", "r2")]);
        let out = s.run_round(vec![], &snap, 10);

        assert_eq!(out.unschedulable, vec!["huge".to_string()]);
        assert!(matches!(
            &out.events[0],
            TaskEvent::Unschedulable { task_id, .. } if task_id == "huge"
        ));
        assert_eq!(s.pending_len(), 1);
        assert!(s.pending_task("ok").is_some());
    }

    #[test]
    fn repeated_race_losses_report_starvation() {
        let mut s = Scheduler::new(SchedulerConfig {
            starvation_races: 2,
            ..SchedulerConfig::default()
        });
        s.submit(task("big", "batch", 4.0, 1024.0, 0), 0).unwrap();
        let snap = active(&[("m1", "r1")]);

        s.submit(task("small-1", "web", 3.0, 512.0, 5), 1).unwrap();
        let first = s.run_round(vec![offer("o1", "m1", "r1", 4.0, 8192.0)], &snap, 10);
        assert!(first.starved.is_empty());

        s.submit(task("small-2", "web", 3.0, 512.0, 5), 11).unwrap();
        let second = s.run_round(vec![offer("o2", "m1", "r1", 4.0, 8192.0)], &snap, 20);
        assert_eq!(second.starved.len(), 1);
        assert_eq!(second.starved[0].task_id, "big");
        assert_eq!(second.starved[0].lost_races, 2);

        // Still pending, counter restarted.
        assert_eq!(s.pending_task("big").unwrap().lost_races, 0);
    }

    #[test]
    fn spread_replicas_prefer_emptier_racks() {
        let mut s = scheduler();
        for i in 1..=2 {
            let mut t = task(&format!("web:{i}"), "web", 1.0, 256.0, 0);
            t.constraints.spread_across_racks = true;
            s.submit(t, i).unwrap();
        }

        let snap = active(&[("m1", "r1"), ("m2", "r1"), ("m3", "r2")]);
        let out = s.run_round(
            vec![
                offer("o1", "m1", "r1", 8.0, 8192.0),
                offer("o2", "m2", "r1", 8.0, 8192.0),
                offer("o3", "m3", "r2", 8.0, 8192.0),
            ],
            &snap,
            10,
        );

        let racks: BTreeMap<_, _> = out
            .assignments()
            .map(|a| (a.task.task_id.clone(), a.rack_id.clone()))
            .collect();
        assert_eq!(racks.get("web:1").map(String::as_str), Some("r1"));
        assert_eq!(racks.get("web:2").map(String::as_str), Some("r2"));
        // o2 had room but the replica belonged on r2.
        assert!(out.declined.iter().any(|d| d.offer_id == "o2"));
    }

    #[test]
    fn pinned_task_waits_for_its_machine() {
        let mut s = scheduler();
        let mut t = task("pinned", "svc", 1.0, 128.0, 0);
        t.constraints.machine = Some("m2".to_string());
        s.submit(t, 0).unwrap();

        let snap = active(&[("m1", "r1"), ("m2", "r1")]);
        let first = s.run_round(vec![offer("o1", "m1", "r1", 8.0, 8192.0)], &snap, 10);
        assert!(first.accepted.is_empty());

        let second = s.run_round(vec![offer("o2", "m2", "r1", 8.0, 8192.0)], &snap, 20);
        assert_eq!(second.assignments().count(), 1);
    }

    #[test]
    fn drain_enqueues_replacements_that_name_the_old_task() {
        let mut s = scheduler();
        s.submit(task("T1", "svc", 1.0, 128.0, 0), 0).unwrap();
        s.submit(task("T2", "svc", 1.0, 128.0, 0), 1).unwrap();
        let snap = active(&[("m2", "r1"), ("m3", "r2")]);
        s.run_round(vec![offer("o1", "m2", "r1", 8.0, 8192.0)], &snap, 10);
        assert_eq!(s.count_on("m2"), 2);

        let events = s.drain_machine("m2", 20);
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.kind() == "rescheduled"));
        // Draining again does not duplicate replacements.
        assert!(s.drain_machine("m2", 21).is_empty());
        assert_eq!(s.pending_len(), 2);
        assert_eq!(s.count_on("m2"), 2);

        let out = s.run_round(vec![offer("o2", "m3", "r2", 8.0, 8192.0)], &snap, 30);
        let mut replaced: Vec<String> = out.assignments().filter_map(|a| a.replaces.clone()).collect();
        replaced.sort();
        assert_eq!(replaced, vec!["T1".to_string(), "T2".to_string()]);

        s.task_finished("T1").unwrap();
        s.task_finished("T2").unwrap();
        assert_eq!(s.count_on("m2"), 0);
        assert_eq!(s.count_on("m3"), 2);
    }

    #[test]
    fn lost_machine_reports_and_reschedules_tasks() {
        let mut s = scheduler();
        s.submit(task("T1", "svc", 1.0, 128.0, 0), 0).unwrap();
        let snap = active(&[("m1", "r1")]);
        s.run_round(vec![offer("o1", "m1", "r1", 8.0, 8192.0)], &snap, 10);

        let events = s.machine_lost("m1", "health signals missed", 20);

        let kinds: Vec<_> = events.iter().map(TaskEvent::kind).collect();
        assert_eq!(kinds, vec!["lost", "rescheduled"]);
        assert_eq!(s.count_on("m1"), 0);
        assert_eq!(s.pending_len(), 1);
        assert!(s.pending().all(|p| p.replaces.is_none()));
    }

    #[test]
    fn losing_a_draining_machine_keeps_the_pending_replacement() {
        let mut s = scheduler();
        s.submit(task("T1", "svc", 1.0, 128.0, 0), 0).unwrap();
        let snap = active(&[("m1", "r1")]);
        s.run_round(vec![offer("o1", "m1", "r1", 8.0, 8192.0)], &snap, 10);
        s.drain_machine("m1", 20);

        let events = s.machine_lost("m1", "decommission deadline exceeded", 30);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind(), "lost");
        assert_eq!(s.pending_len(), 1);
        assert!(s.pending().all(|p| p.replaces.is_none()));
    }

    #[test]
    fn failed_task_is_requeued_under_same_id() {
        let mut s = scheduler();
        s.submit(task("T1", "svc", 1.0, 128.0, 0), 0).unwrap();
        let snap = active(&[("m1", "r1")]);
        s.run_round(vec![offer("o1", "m1", "r1", 8.0, 8192.0)], &snap, 10);

        assert!(s.task_failed("T1", "pull failed", 20).unwrap());
        assert!(s.pending_task("T1").is_some());
        assert_eq!(s.count_on("m1"), 0);

        let err = s.task_failed("T1", "again", 21).unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownTask(_)));
    }

    #[test]
    fn duplicate_submit_of_placed_task_is_rejected() {
        let mut s = scheduler();
        s.submit(task("T1", "svc", 1.0, 128.0, 0), 0).unwrap();
        let snap = active(&[("m1", "r1")]);
        s.run_round(vec![offer("o1", "m1", "r1", 8.0, 8192.0)], &snap, 10);

        let err = s.submit(task("T1", "svc", 1.0, 128.0, 0), 20).unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateTask(_)));
    }

    #[test]
    fn negative_request_is_rejected_and_cannot_inflate_an_offer() {
        let mut s = scheduler();
        let err = s.submit(task("neg", "svc", -4.0, 128.0, 0), 0).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest { ref task_id, .. } if task_id == "neg"));
        s.submit(task("big", "svc", 8.0, 128.0, 0), 1).unwrap();

        let snap = active(&[("m1", "r1")]);
        let out = s.run_round(vec![offer("o1", "m1", "r1", 4.0, 8192.0)], &snap, 10);

        assert!(out.assignments().next().is_none());
        assert_eq!(s.pending_len(), 1);
        assert!(s.pending_task("neg").is_none());
    }

    #[test]
    fn nan_request_is_rejected() {
        let mut s = scheduler();
        let err = s.submit(task("nan", "svc", 1.0, f64::NAN, 0), 0).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRequest { .. }));
        assert_eq!(s.pending_len(), 0);
    }

    #[test]
    fn outcome_serializes_for_the_resource_manager() {
        let mut s = scheduler();
        s.submit(task("T1", "svc", 1.0, 128.0, 0), 0).unwrap();
        let snap = active(&[("m1", "r1")]);
        let out = s.run_round(
            vec![
                offer("o1", "m1", "r1", 8.0, 8192.0),
                offer("o2", "m1", "r1", 8.0, 8192.0),
            ],
            &snap,
            10,
        );

        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["accepted"][0]["assignments"][0]["task"]["task_id"], "T1");
        assert_eq!(json["declined"][0]["refuse_for"], "1m");
        assert_eq!(json["declined"][0]["reason"], "no_match");
    }
}
