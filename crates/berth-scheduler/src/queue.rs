//! Pending task queue.
//!
//! Kept sorted by the configured [`OrderingPolicy`], so iteration order is
//! the order in which tasks are offered to each resource offer. A
//! monotonically increasing sequence number breaks any remaining tie, which
//! keeps ordering deterministic for tasks enqueued in the same millisecond.

use std::cmp::Ordering;

use berth_core::{OrderingPolicy, TaskId, TaskRequest};

use crate::error::{SchedulerError, SchedulerResult};

/// A task waiting for an offer.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTask {
    pub request: TaskRequest,
    /// Unix epoch milliseconds.
    pub enqueued_at: u64,
    seq: u64,
    /// Rounds in which the task fit an offer but lost it to other tasks.
    pub lost_races: u32,
    /// Task this one replaces, when it was enqueued by a drain.
    pub replaces: Option<TaskId>,
}

impl PendingTask {
    pub fn task_id(&self) -> &str {
        &self.request.task_id
    }

    fn sort_key(&self, policy: OrderingPolicy) -> (i64, i64, u64) {
        let priority = i64::from(self.request.priority);
        let wait = self.enqueued_at as i64;
        match policy {
            OrderingPolicy::PriorityThenWait => (-priority, wait, self.seq),
            OrderingPolicy::WaitThenPriority => (wait, -priority, self.seq),
        }
    }

    fn cmp_with(&self, other: &Self, policy: OrderingPolicy) -> Ordering {
        self.sort_key(policy).cmp(&other.sort_key(policy))
    }
}

#[derive(Debug)]
pub struct PendingQueue {
    tasks: Vec<PendingTask>,
    policy: OrderingPolicy,
    next_seq: u64,
}

impl PendingQueue {
    pub fn new(policy: OrderingPolicy) -> Self {
        Self {
            tasks: Vec::new(),
            policy,
            next_seq: 0,
        }
    }

    /// Enqueue a task. Task ids must be unique within the queue.
    pub fn push(
        &mut self,
        request: TaskRequest,
        enqueued_at: u64,
        replaces: Option<TaskId>,
    ) -> SchedulerResult<()> {
        if self.contains(&request.task_id) {
            return Err(SchedulerError::DuplicateTask(request.task_id));
        }
        let task = PendingTask {
            request,
            enqueued_at,
            seq: self.next_seq,
            lost_races: 0,
            replaces,
        };
        self.next_seq += 1;

        let at = self
            .tasks
            .partition_point(|t| t.cmp_with(&task, self.policy) == Ordering::Less);
        self.tasks.insert(at, task);
        Ok(())
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.tasks.iter().any(|t| t.request.task_id == task_id)
    }

    pub fn get(&self, task_id: &str) -> Option<&PendingTask> {
        self.tasks.iter().find(|t| t.request.task_id == task_id)
    }

    pub fn get_mut(&mut self, task_id: &str) -> Option<&mut PendingTask> {
        self.tasks.iter_mut().find(|t| t.request.task_id == task_id)
    }

    pub fn remove(&mut self, task_id: &str) -> Option<PendingTask> {
        let idx = self.tasks.iter().position(|t| t.request.task_id == task_id)?;
        Some(self.tasks.remove(idx))
    }

    /// Tasks in scheduling order.
    pub fn iter(&self) -> impl Iterator<Item = &PendingTask> {
        self.tasks.iter()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
