//! Registry of tasks the scheduler has assigned and not yet seen finish.

use std::collections::{BTreeMap, HashMap};

use berth_core::{MachineId, RackId, TaskId, TaskRequest};

/// One assigned task.
#[derive(Debug, Clone, PartialEq)]
pub struct Placement {
    pub request: TaskRequest,
    pub machine_id: MachineId,
    pub rack_id: RackId,
    pub ports: Vec<u16>,
    /// Task this placement takes over from.
    pub replaces: Option<TaskId>,
    /// Set once a drain enqueued a replacement for this task.
    pub replacement: Option<TaskId>,
}

impl Placement {
    pub fn task_id(&self) -> &str {
        &self.request.task_id
    }

    pub fn request_id(&self) -> &str {
        &self.request.request_id
    }
}

#[derive(Debug, Default)]
pub struct PlacementRegistry {
    by_task: HashMap<TaskId, Placement>,
}

impl PlacementRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, placement: Placement) {
        self.by_task
            .insert(placement.request.task_id.clone(), placement);
    }

    pub fn remove(&mut self, task_id: &str) -> Option<Placement> {
        self.by_task.remove(task_id)
    }

    pub fn get(&self, task_id: &str) -> Option<&Placement> {
        self.by_task.get(task_id)
    }

    pub fn get_mut(&mut self, task_id: &str) -> Option<&mut Placement> {
        self.by_task.get_mut(task_id)
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.by_task.contains_key(task_id)
    }

    /// Task ids placed on `machine_id`, sorted.
    pub fn on_machine(&self, machine_id: &str) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self
            .by_task
            .values()
            .filter(|p| p.machine_id == machine_id)
            .map(|p| p.request.task_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn count_on(&self, machine_id: &str) -> usize {
        self.by_task
            .values()
            .filter(|p| p.machine_id == machine_id)
            .count()
    }

    pub fn tasks_per_machine(&self) -> BTreeMap<MachineId, usize> {
        let mut counts = BTreeMap::new();
        for p in self.by_task.values() {
            *counts.entry(p.machine_id.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Placed replicas of `request_id` per rack. A task whose replacement
    /// is already enqueued is not counted, since it is on its way out.
    pub fn replicas_per_rack(&self, request_id: &str) -> HashMap<RackId, usize> {
        let mut counts = HashMap::new();
        for p in self.by_task.values() {
            if p.request.request_id == request_id && p.replacement.is_none() {
                *counts.entry(p.rack_id.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.by_task.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_task.is_empty()
    }
}
