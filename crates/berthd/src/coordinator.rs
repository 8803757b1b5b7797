//! The single-writer coordinator.
//!
//! Owns the scheduler outright and is the only task that mutates it. The
//! lifecycle manager sits behind an async mutex; every scheduling round
//! reads the latest eligibility snapshot from the manager's watch channel
//! exactly once, so a transition published mid-round applies from the next
//! round on.
//!
//! Event flow:
//!
//! ```text
//! resource manager / operator ──► ClusterEvent ──┐
//!                                                ├──► Coordinator ──► driver (accept/decline)
//! Realizer (spawned per assignment) ──► Feedback ┘          │
//!                                                           └──► task-record sinks
//! ```

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info, warn};

use berth_core::{
    EligibilitySnapshot, ExecutorConfig, MachineId, MachineState, Offer, SchedulerConfig,
    TaskEvent, TaskId, TaskRecordSink, epoch_millis,
};
use berth_executor::RuntimeConnector;
use berth_lifecycle::{LifecycleError, LifecycleManager, LifecycleResult};
use berth_scheduler::{Assignment, Scheduler, SchedulerError};

use crate::driver::ResourceManagerDriver;
use crate::events::{ClusterEvent, Envelope};
use crate::realizer::{Feedback, Realizer};

const DEADLINE_REASON: &str = "decommission deadline exceeded";
const HEALTH_REASON: &str = "missed health signals";

pub struct Coordinator {
    scheduler: Scheduler,
    lifecycle: Arc<Mutex<LifecycleManager>>,
    snapshots: watch::Receiver<Arc<EligibilitySnapshot>>,
    driver: Arc<dyn ResourceManagerDriver>,
    sinks: Vec<Arc<dyn TaskRecordSink>>,
    realizer: Option<Realizer>,
    feedback_tx: mpsc::UnboundedSender<Feedback>,
    feedback_rx: mpsc::UnboundedReceiver<Feedback>,
    in_flight: usize,
}

impl Coordinator {
    /// Placements are confirmed as soon as they are made until a realizer
    /// is attached with [`Coordinator::with_realizer`].
    pub fn new(
        config: SchedulerConfig,
        lifecycle: LifecycleManager,
        driver: Arc<dyn ResourceManagerDriver>,
        sinks: Vec<Arc<dyn TaskRecordSink>>,
    ) -> Self {
        let snapshots = lifecycle.subscribe();
        let (feedback_tx, feedback_rx) = mpsc::unbounded_channel();
        Self {
            scheduler: Scheduler::new(config),
            lifecycle: Arc::new(Mutex::new(lifecycle)),
            snapshots,
            driver,
            sinks,
            realizer: None,
            feedback_tx,
            feedback_rx,
            in_flight: 0,
        }
    }

    pub fn with_realizer(mut self, connector: Arc<dyn RuntimeConnector>, config: ExecutorConfig) -> Self {
        self.realizer = Some(Realizer::new(connector, config, self.feedback_tx.clone()));
        self
    }

    /// Shared handle to the lifecycle manager.
    pub fn lifecycle(&self) -> Arc<Mutex<LifecycleManager>> {
        self.lifecycle.clone()
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Realizations and retirements not yet reported back.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Process events until the event stream ends and all realizations have
    /// reported back, or until shutdown.
    ///
    /// Returns an error only for internal-consistency failures.
    pub async fn run(
        &mut self,
        mut events: mpsc::Receiver<Envelope>,
        mut shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut events_open = true;
        loop {
            if !events_open && self.in_flight == 0 {
                break;
            }
            tokio::select! {
                next = events.recv(), if events_open => match next {
                    Some(envelope) => {
                        let now = envelope.at.unwrap_or_else(epoch_millis);
                        self.handle(envelope.event, now).await?;
                    }
                    None => {
                        debug!(in_flight = self.in_flight, "event stream ended");
                        events_open = false;
                    }
                },
                Some(feedback) = self.feedback_rx.recv() => {
                    self.on_feedback(feedback, epoch_millis()).await?;
                }
                Ok(()) = shutdown.changed() => {
                    info!(in_flight = self.in_flight, "coordinator shutting down");
                    break;
                }
                else => break,
            }
        }
        Ok(())
    }

    /// Apply one event, then settle any decommissions it made possible.
    pub async fn handle(&mut self, event: ClusterEvent, now: u64) -> anyhow::Result<()> {
        debug!(kind = event.kind(), "cluster event");
        self.dispatch(event, now).await?;
        self.check_decommissions(now).await
    }

    /// Wait for one realization result and apply it.
    pub async fn next_feedback(&mut self, now: u64) -> anyhow::Result<bool> {
        if self.in_flight == 0 {
            return Ok(false);
        }
        match self.feedback_rx.recv().await {
            Some(feedback) => {
                self.on_feedback(feedback, now).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn dispatch(&mut self, event: ClusterEvent, now: u64) -> anyhow::Result<()> {
        let lifecycle = self.lifecycle.clone();
        match event {
            ClusterEvent::Offers { offers } => self.round(offers, now).await,

            ClusterEvent::MachineSeen(report) | ClusterEvent::MachineAttributesChanged(report) => {
                let machine_id = report.machine_id.clone();
                let state = {
                    let mut lc = lifecycle.lock().await;
                    tolerate(lc.observe_machine(report.into_machine(now), now))?
                };
                self.drain_if_starting(&machine_id, state, now).await
            }

            ClusterEvent::MachineLost { machine_id, reason } => {
                let known = tolerate(lifecycle.lock().await.machine_lost(&machine_id, &reason, now))?;
                if known.is_some() {
                    let events = self.scheduler.machine_lost(&machine_id, &reason, now);
                    self.record_all(&events);
                }
                Ok(())
            }

            ClusterEvent::HealthSignal { machine_id } => {
                let state = tolerate(lifecycle.lock().await.health_signal(&machine_id, now))?;
                self.drain_if_starting(&machine_id, state, now).await
            }

            ClusterEvent::HealthTick => {
                let dead = tolerate(lifecycle.lock().await.health_sweep(now))?.unwrap_or_default();
                for id in dead {
                    let events = self.scheduler.machine_lost(&id, HEALTH_REASON, now);
                    self.record_all(&events);
                }
                Ok(())
            }

            ClusterEvent::TaskSubmitted { task } => {
                if let Err(e) = self.scheduler.submit(task, now) {
                    warn!(error = %e, "task rejected");
                }
                Ok(())
            }

            ClusterEvent::TaskFinished { task_id } => {
                if let Err(e) = self.scheduler.task_finished(&task_id) {
                    warn!(error = %e, "finish for unknown task");
                }
                Ok(())
            }

            ClusterEvent::TaskFailed { task_id, reason } => {
                self.task_failed(&task_id, &reason, now);
                Ok(())
            }

            ClusterEvent::Decommission {
                machine_id,
                actor,
                reason,
            } => {
                let started = {
                    let mut lc = lifecycle.lock().await;
                    tolerate(lc.decommission(&machine_id, actor, reason, now))?.is_some()
                };
                if started {
                    self.start_drain(&machine_id, now).await?;
                }
                Ok(())
            }

            ClusterEvent::DecommissionRack {
                rack_id,
                actor,
                reason,
            } => {
                let targets = tolerate(
                    lifecycle
                        .lock()
                        .await
                        .decommission_rack(&rack_id, actor, reason, now),
                )?
                .unwrap_or_default();
                for id in targets {
                    self.start_drain(&id, now).await?;
                }
                Ok(())
            }

            ClusterEvent::Freeze { machine_id, actor } => {
                tolerate(lifecycle.lock().await.freeze(&machine_id, actor, now))?;
                Ok(())
            }

            ClusterEvent::Unfreeze { machine_id, actor } => {
                tolerate(lifecycle.lock().await.unfreeze(&machine_id, actor, now))?;
                Ok(())
            }
        }
    }

    // ── Rounds and realization ─────────────────────────────────────

    async fn round(&mut self, offers: Vec<Offer>, now: u64) -> anyhow::Result<()> {
        let snapshot = self.snapshots.borrow_and_update().clone();
        let outcome = self.scheduler.run_round(offers, &snapshot, now);

        for declined in &outcome.declined {
            if let Err(e) = self.driver.decline(declined) {
                error!(offer = %declined.offer_id, error = %e, "failed to send decline");
            }
        }
        for accepted in &outcome.accepted {
            if let Err(e) = self.driver.accept(accepted) {
                error!(offer = %accepted.offer_id, error = %e, "failed to send accept");
            }
        }
        self.record_all(&outcome.events);

        let assignments: Vec<Assignment> = outcome
            .accepted
            .into_iter()
            .flat_map(|a| a.assignments)
            .collect();
        for assignment in assignments {
            if let Some(realizer) = self.realizer.clone() {
                self.in_flight += 1;
                realizer.realize(assignment);
            } else {
                self.confirm_running(assignment, now).await;
            }
        }
        Ok(())
    }

    async fn on_feedback(&mut self, feedback: Feedback, now: u64) -> anyhow::Result<()> {
        self.in_flight = self.in_flight.saturating_sub(1);
        match feedback {
            Feedback::Running { assignment, .. } => {
                if self.scheduler.placement(&assignment.task.task_id).is_none() {
                    warn!(
                        task_id = %assignment.task.task_id,
                        machine_id = %assignment.machine_id,
                        "realized task is no longer placed"
                    );
                    return Ok(());
                }
                self.confirm_running(assignment, now).await;
            }
            Feedback::Failed { task_id, reason } => self.task_failed(&task_id, &reason, now),
            Feedback::Retired { task_id } => match self.scheduler.task_finished(&task_id) {
                Ok(()) => debug!(task_id = %task_id, "replaced task retired"),
                Err(SchedulerError::UnknownTask(_)) => {
                    debug!(task_id = %task_id, "retired task already gone");
                }
                Err(e) => warn!(task_id = %task_id, error = %e, "retire bookkeeping failed"),
            },
            Feedback::RetireFailed { task_id, reason } => {
                // The drain deadline settles it.
                debug!(task_id = %task_id, %reason, "replaced task left running");
            }
        }
        self.check_decommissions(now).await
    }

    /// The assignment's container is running: report it and retire whatever
    /// it replaces.
    async fn confirm_running(&mut self, assignment: Assignment, now: u64) {
        self.record(&TaskEvent::Placed {
            task_id: assignment.task.task_id.clone(),
            request_id: assignment.task.request_id.clone(),
            machine_id: assignment.machine_id.clone(),
            host: assignment.host.clone(),
            timestamp: now,
        });
        if let Some(old) = assignment.replaces {
            self.retire(old).await;
        }
    }

    async fn retire(&mut self, task_id: TaskId) {
        let Some(machine_id) = self
            .scheduler
            .placement(&task_id)
            .map(|p| p.machine_id.clone())
        else {
            return;
        };

        let host = {
            let lc = self.lifecycle.lock().await;
            lc.machine(&machine_id).map(|m| m.host.clone())
        };
        match (&self.realizer, host) {
            (Some(realizer), Some(host)) => {
                self.in_flight += 1;
                realizer.retire(task_id, host);
            }
            _ => {
                if let Err(e) = self.scheduler.task_finished(&task_id) {
                    warn!(task_id = %task_id, error = %e, "could not retire replaced task");
                }
            }
        }
    }

    fn task_failed(&mut self, task_id: &str, reason: &str, now: u64) {
        match self.scheduler.task_failed(task_id, reason, now) {
            Ok(_) => {}
            Err(e) => warn!(task_id = %task_id, error = %e, "failure for unknown task"),
        }
    }

    // ── Decommissioning ────────────────────────────────────────────

    /// Acknowledge a machine's decommission and reschedule its tasks.
    async fn start_drain(&mut self, machine_id: &str, now: u64) -> anyhow::Result<()> {
        let begun = tolerate(self.lifecycle.lock().await.begin_decommissioning(machine_id, now))?;
        if begun.is_none() {
            return Ok(());
        }
        let events = self.scheduler.drain_machine(machine_id, now);
        self.record_all(&events);
        Ok(())
    }

    /// A machine left in `STARTING_DECOMMISSION` (its rack is draining, or
    /// it was recovered mid-decommission) is drained as soon as it reports.
    async fn drain_if_starting(
        &mut self,
        machine_id: &str,
        state: Option<MachineState>,
        now: u64,
    ) -> anyhow::Result<()> {
        if state == Some(MachineState::StartingDecommission) {
            self.start_drain(machine_id, now).await?;
        }
        Ok(())
    }

    async fn check_decommissions(&mut self, now: u64) -> anyhow::Result<()> {
        let outcomes = {
            let mut lc = self.lifecycle.lock().await;
            let scheduler = &self.scheduler;
            tolerate(lc.check_decommissions(|id| scheduler.count_on(id), now))?.unwrap_or_default()
        };

        let forced: Vec<MachineId> = outcomes
            .into_iter()
            .filter(|o| o.forced)
            .map(|o| o.machine_id)
            .collect();
        for id in forced {
            let events = self.scheduler.machine_lost(&id, DEADLINE_REASON, now);
            self.record_all(&events);
        }
        Ok(())
    }

    // ── Task records ───────────────────────────────────────────────

    fn record_all(&self, events: &[TaskEvent]) {
        for event in events {
            self.record(event);
        }
    }

    fn record(&self, event: &TaskEvent) {
        info!(task_id = %event.task_id(), kind = event.kind(), "task event");
        for sink in &self.sinks {
            if let Err(e) = sink.record(event) {
                error!(task_id = %event.task_id(), error = %e, "failed to record task event");
            }
        }
    }
}

/// Rejected lifecycle requests are logged and skipped; ledger corruption
/// stops the coordinator.
fn tolerate<T>(result: LifecycleResult<T>) -> anyhow::Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_fatal() => {
            error!(error = %e, "lifecycle state is inconsistent");
            Err(e.into())
        }
        Err(e) => {
            log_rejection(&e);
            Ok(None)
        }
    }
}

fn log_rejection(e: &LifecycleError) {
    match e {
        LifecycleError::InvalidTransition { .. } => {
            // Already logged where the transition was rejected.
            debug!(error = %e, "lifecycle request rejected");
        }
        _ => warn!(error = %e, "lifecycle request rejected"),
    }
}
