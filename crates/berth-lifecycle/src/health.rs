//! Missed health-signal tracking.
//!
//! The resource manager sends a health signal for every live machine;
//! each sweep closes one check interval. A machine that got no signal
//! during an interval accrues a miss, and `threshold` consecutive misses
//! mark it dead. Any signal resets the count.

use std::collections::HashMap;

use tracing::{debug, warn};

use berth_core::MachineId;

#[derive(Debug, Default, Clone, Copy)]
struct MissEntry {
    signalled: bool,
    consecutive_misses: u32,
}

/// Consecutive-miss counters for a set of machines.
#[derive(Debug)]
pub struct MissTracker {
    threshold: u32,
    entries: HashMap<MachineId, MissEntry>,
}

impl MissTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            entries: HashMap::new(),
        }
    }

    /// Record a health signal received during the current interval.
    pub fn signal(&mut self, id: &str) {
        let entry = self.entries.entry(id.to_string()).or_default();
        if entry.consecutive_misses > 0 {
            debug!(machine_id = %id, misses = entry.consecutive_misses, "health signal after misses");
        }
        entry.signalled = true;
        entry.consecutive_misses = 0;
    }

    /// Close the current interval for `ids` and return those that have now
    /// missed `threshold` consecutive intervals.
    pub fn sweep<'a>(&mut self, ids: impl IntoIterator<Item = &'a str>) -> Vec<MachineId> {
        let mut expired = Vec::new();
        for id in ids {
            let entry = self.entries.entry(id.to_string()).or_default();
            if entry.signalled {
                entry.signalled = false;
                entry.consecutive_misses = 0;
                continue;
            }
            entry.consecutive_misses += 1;
            if entry.consecutive_misses >= self.threshold {
                warn!(
                    machine_id = %id,
                    misses = entry.consecutive_misses,
                    threshold = self.threshold,
                    "machine missed too many health signals"
                );
                expired.push(id.to_string());
            } else {
                debug!(machine_id = %id, misses = entry.consecutive_misses, "health signal missed");
            }
        }
        expired
    }

    pub fn forget(&mut self, id: &str) {
        self.entries.remove(id);
    }

    pub fn misses(&self, id: &str) -> u32 {
        self.entries.get(id).map_or(0, |e| e.consecutive_misses)
    }
}
