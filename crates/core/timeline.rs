//! Run-deadline index of in-flight jobs.
//!
//! Jobs are grouped into buckets of `precision` seconds by the deadline of
//! their current run. The index is only a pre-filter: the timeout watcher
//! re-checks every job it takes out against the job record before acting.

use std::collections::{BTreeMap, HashMap};

use crate::bitset::BitSet;
use crate::job::JobId;

/// Time-bucketed set of running jobs.
#[derive(Debug)]
pub struct ExecutionTimeline {
    precision: u64,
    slots: BTreeMap<u64, BitSet>,
    index: HashMap<JobId, u64>,
}

impl ExecutionTimeline {
    pub fn new(precision: u64) -> Self {
        Self {
            precision: precision.max(1),
            slots: BTreeMap::new(),
            index: HashMap::new(),
        }
    }

    pub fn precision(&self) -> u64 {
        self.precision
    }

    /// Change the bucket width. Existing entries keep their buckets.
    pub fn set_precision(&mut self, precision: u64) {
        let precision = precision.max(1);
        if precision == self.precision {
            return;
        }
        let entries: Vec<(JobId, u64)> = self
            .index
            .iter()
            .map(|(id, slot)| (*id, slot * self.precision))
            .collect();
        self.precision = precision;
        self.slots.clear();
        self.index.clear();
        for (id, deadline) in entries {
            self.add_at(id, deadline as i64);
        }
    }

    /// Bucket of a timestamp.
    pub fn slot_of(&self, time: i64) -> u64 {
        time.max(0) as u64 / self.precision
    }

    /// Track `id` as due at `deadline`, replacing any previous entry.
    pub fn add_at(&mut self, id: JobId, deadline: i64) {
        self.remove(id);
        let slot = self.slot_of(deadline);
        self.slots.entry(slot).or_default().insert(id.get());
        self.index.insert(id, slot);
    }

    /// Stop tracking `id`. Returns whether it was tracked.
    pub fn remove(&mut self, id: JobId) -> bool {
        let Some(slot) = self.index.remove(&id) else {
            return false;
        };
        if let Some(set) = self.slots.get_mut(&slot) {
            set.remove(id.get());
            if set.is_empty() {
                self.slots.remove(&slot);
            }
        }
        true
    }

    /// Move `id` to a new deadline.
    pub fn move_to(&mut self, id: JobId, new_deadline: i64) {
        self.add_at(id, new_deadline);
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Jobs in buckets at or before the bucket of `now`, without removing them.
    pub fn expired_before(&self, now: i64) -> Vec<JobId> {
        let current = self.slot_of(now);
        self.slots
            .range(..=current)
            .flat_map(|(_, set)| set.iter().map(JobId))
            .collect()
    }

    /// Take out every job in buckets at or before the bucket of `now`.
    ///
    /// Callers re-insert the ones that turn out to be still running within
    /// their deadline.
    pub fn take_due(&mut self, now: i64) -> Vec<JobId> {
        let current = self.slot_of(now);
        let later = self.slots.split_off(&(current + 1));
        let due = std::mem::replace(&mut self.slots, later);
        let ids: Vec<JobId> = due.values().flat_map(|set| set.iter().map(JobId)).collect();
        for id in &ids {
            self.index.remove(id);
        }
        ids
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.index.clear();
    }
}
