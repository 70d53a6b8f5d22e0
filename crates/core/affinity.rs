//! Affinity dictionary, job reverse index and per-worker preferences.
//!
//! Affinity tokens are interned into stable integer ids that are never
//! reused. For every id the index keeps the set of jobs carrying it; for every
//! worker it keeps the affinities it has recently been handed and a cache of
//! candidate jobs for them. The cache is refilled lazily once exhausted.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

use crate::bitset::BitSet;
use crate::job::{JobId, WorkerNode};

/// Result of interning a token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub id: u32,
    /// The token was seen for the first time and must be persisted.
    pub is_new: bool,
}

#[derive(Debug, Default)]
struct WorkerAffinity {
    affinities: BTreeSet<u32>,
    candidates: BitSet,
    last_seen: i64,
}

#[derive(Default)]
struct AffinityState {
    tokens: HashMap<String, u32>,
    names: HashMap<u32, String>,
    last_id: u32,
    jobs: HashMap<u32, BitSet>,
    workers: HashMap<WorkerNode, WorkerAffinity>,
}

impl AffinityState {
    fn jobs_of(&self, affinities: impl Iterator<Item = u32>) -> BitSet {
        let mut out = BitSet::new();
        for aff in affinities {
            if let Some(jobs) = self.jobs.get(&aff) {
                out.union_with(jobs);
            }
        }
        out
    }
}

/// Worker affinity snapshot for statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerAffinityInfo {
    pub worker: String,
    pub affinities: Vec<String>,
    pub candidates: usize,
    pub last_seen: i64,
}

/// Affinity index for one queue.
#[derive(Default)]
pub struct AffinityIndex {
    state: RwLock<AffinityState>,
}

impl AffinityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Dictionary ==========

    /// Intern `token`, allocating a new id on first use.
    pub fn resolve(&self, token: &str) -> Resolved {
        let mut state = self.state.write();
        if let Some(id) = state.tokens.get(token) {
            return Resolved {
                id: *id,
                is_new: false,
            };
        }
        state.last_id += 1;
        let id = state.last_id;
        state.tokens.insert(token.to_string(), id);
        state.names.insert(id, token.to_string());
        Resolved { id, is_new: true }
    }

    /// Id of an already known token.
    pub fn lookup(&self, token: &str) -> Option<u32> {
        self.state.read().tokens.get(token).copied()
    }

    pub fn token(&self, id: u32) -> Option<String> {
        self.state.read().names.get(&id).cloned()
    }

    /// Restore a persisted dictionary entry.
    pub fn restore_token(&self, id: u32, token: &str) {
        let mut state = self.state.write();
        state.tokens.insert(token.to_string(), id);
        state.names.insert(id, token.to_string());
        state.last_id = state.last_id.max(id);
    }

    /// Forget a freshly allocated id whose persistence failed.
    pub fn forget_token(&self, id: u32) {
        let mut state = self.state.write();
        if let Some(token) = state.names.remove(&id) {
            state.tokens.remove(&token);
        }
    }

    // ========== Reverse index ==========

    pub fn add_job(&self, affinity: u32, id: JobId) {
        if affinity == 0 {
            return;
        }
        self.state
            .write()
            .jobs
            .entry(affinity)
            .or_default()
            .insert(id.get());
    }

    /// Index a contiguous block of jobs sharing one affinity.
    pub fn add_job_range(&self, affinity: u32, first: JobId, last: JobId) {
        if affinity == 0 {
            return;
        }
        self.state
            .write()
            .jobs
            .entry(affinity)
            .or_default()
            .insert_range(first.get(), last.get());
    }

    pub fn remove_job(&self, affinity: u32, id: JobId) {
        let mut state = self.state.write();
        if let Some(jobs) = state.jobs.get_mut(&affinity) {
            jobs.remove(id.get());
        }
        for worker in state.workers.values_mut() {
            worker.candidates.remove(id.get());
        }
    }

    /// Jobs carrying any of `affinities`.
    pub fn candidates_for(&self, affinities: &[u32]) -> BitSet {
        self.state.read().jobs_of(affinities.iter().copied())
    }

    pub fn job_count(&self, affinity: u32) -> usize {
        self.state.read().jobs.get(&affinity).map_or(0, BitSet::len)
    }

    // ========== Workers ==========

    /// Remember that `worker` handles `affinity`.
    pub fn associate_worker(&self, worker: &WorkerNode, affinity: u32, now: i64) {
        let mut state = self.state.write();
        let entry = state.workers.entry(worker.clone()).or_default();
        entry.last_seen = now;
        if affinity != 0 && entry.affinities.insert(affinity) {
            // new preference: force a refill on next dispatch
            entry.candidates.clear();
        }
    }

    /// Record that `worker` asked for work.
    pub fn touch_worker(&self, worker: &WorkerNode, now: i64) {
        let mut state = self.state.write();
        state.workers.entry(worker.clone()).or_default().last_seen = now;
    }

    /// Forget everything about `worker`.
    pub fn clear_worker(&self, worker: &WorkerNode) -> bool {
        self.state.write().workers.remove(worker).is_some()
    }

    pub fn worker_affinities(&self, worker: &WorkerNode) -> Vec<u32> {
        self.state
            .read()
            .workers
            .get(worker)
            .map(|w| w.affinities.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Cached candidate jobs of `worker`.
    pub fn cached_candidates(&self, worker: &WorkerNode) -> BitSet {
        self.state
            .read()
            .workers
            .get(worker)
            .map(|w| w.candidates.clone())
            .unwrap_or_default()
    }

    /// Rebuild the candidate cache of `worker` from its affinities.
    pub fn refill_candidates(&self, worker: &WorkerNode) -> BitSet {
        let mut state = self.state.write();
        let affinities: Vec<u32> = match state.workers.get(worker) {
            Some(w) if !w.affinities.is_empty() => w.affinities.iter().copied().collect(),
            _ => return BitSet::new(),
        };
        let candidates = state.jobs_of(affinities.into_iter());
        if let Some(w) = state.workers.get_mut(worker) {
            w.candidates = candidates.clone();
        }
        candidates
    }

    /// Drop one job from the candidate cache of `worker`.
    pub fn consume_candidate(&self, worker: &WorkerNode, id: JobId) {
        if let Some(w) = self.state.write().workers.get_mut(worker) {
            w.candidates.remove(id.get());
        }
    }

    /// Jobs whose affinity is claimed by some worker other than `worker`.
    pub fn jobs_claimed_by_others(&self, worker: &WorkerNode) -> BitSet {
        let state = self.state.read();
        let claimed: BTreeSet<u32> = state
            .workers
            .iter()
            .filter(|(node, _)| *node != worker)
            .flat_map(|(_, w)| w.affinities.iter().copied())
            .collect();
        state.jobs_of(claimed.into_iter())
    }

    /// Jobs whose affinity no worker has claimed yet.
    pub fn unclaimed_jobs(&self) -> BitSet {
        let state = self.state.read();
        let claimed: BTreeSet<u32> = state
            .workers
            .values()
            .flat_map(|w| w.affinities.iter().copied())
            .collect();
        let unclaimed = state
            .jobs
            .keys()
            .copied()
            .filter(|aff| !claimed.contains(aff))
            .collect::<Vec<_>>();
        state.jobs_of(unclaimed.into_iter())
    }

    /// Forget workers not seen since `cutoff`. Returns how many were dropped.
    pub fn prune_workers(&self, cutoff: i64) -> usize {
        let mut state = self.state.write();
        let before = state.workers.len();
        state.workers.retain(|_, w| w.last_seen >= cutoff);
        before - state.workers.len()
    }

    pub fn workers(&self) -> Vec<WorkerAffinityInfo> {
        let state = self.state.read();
        let mut out: Vec<WorkerAffinityInfo> = state
            .workers
            .iter()
            .map(|(node, w)| WorkerAffinityInfo {
                worker: node.to_string(),
                affinities: w
                    .affinities
                    .iter()
                    .filter_map(|a| state.names.get(a).cloned())
                    .collect(),
                candidates: w.candidates.len(),
                last_seen: w.last_seen,
            })
            .collect();
        out.sort_by(|a, b| a.worker.cmp(&b.worker));
        out
    }

    // ========== Maintenance ==========

    /// Drop references to job ids below `first_live`. Returns the number of
    /// references removed.
    pub fn compact(&self, first_live: JobId) -> usize {
        let mut state = self.state.write();
        let mut removed = 0;
        for jobs in state.jobs.values_mut() {
            removed += jobs.remove_below(first_live.get());
            jobs.shrink_to_fit();
        }
        state.jobs.retain(|_, jobs| !jobs.is_empty());
        for worker in state.workers.values_mut() {
            worker.candidates.remove_below(first_live.get());
        }
        removed
    }

    /// Drop all job references, keeping the dictionary.
    pub fn clear_jobs(&self) {
        let mut state = self.state.write();
        state.jobs.clear();
        for worker in state.workers.values_mut() {
            worker.candidates.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(name: &str) -> WorkerNode {
        WorkerNode::new(name, 9000)
    }

    #[test]
    fn test_resolve_is_stable() {
        let index = AffinityIndex::new();
        let gpu = index.resolve("gpu");
        assert!(gpu.is_new);
        assert_eq!(gpu.id, 1);
        let again = index.resolve("gpu");
        assert!(!again.is_new);
        assert_eq!(again.id, 1);
        assert_eq!(index.resolve("cpu").id, 2);
        assert_eq!(index.lookup("gpu"), Some(1));
        assert_eq!(index.token(2).as_deref(), Some("cpu"));
        assert_eq!(index.lookup("tpu"), None);
    }

    #[test]
    fn test_ids_never_reused_after_restore() {
        let index = AffinityIndex::new();
        index.restore_token(7, "old");
        assert_eq!(index.resolve("new").id, 8);

        let fresh = index.resolve("temp");
        index.forget_token(fresh.id);
        assert_eq!(index.lookup("temp"), None);
        assert_eq!(index.resolve("later").id, fresh.id + 1);
    }

    #[test]
    fn test_reverse_index() {
        let index = AffinityIndex::new();
        index.add_job(1, JobId(10));
        index.add_job(1, JobId(11));
        index.add_job(2, JobId(12));
        index.add_job(0, JobId(13));
        index.add_job_range(3, JobId(20), JobId(22));

        assert_eq!(index.job_count(1), 2);
        assert_eq!(index.job_count(0), 0);
        let both = index.candidates_for(&[1, 3]);
        assert_eq!(both.iter().collect::<Vec<_>>(), vec![10, 11, 20, 21, 22]);

        index.remove_job(1, JobId(10));
        assert_eq!(index.job_count(1), 1);
    }

    #[test]
    fn test_worker_candidates_refill() {
        let index = AffinityIndex::new();
        let w = worker("a");
        index.add_job(1, JobId(5));
        index.add_job(1, JobId(6));

        assert!(index.refill_candidates(&w).is_empty());
        index.associate_worker(&w, 1, 100);
        assert!(index.cached_candidates(&w).is_empty());

        let cands = index.refill_candidates(&w);
        assert_eq!(cands.len(), 2);
        index.consume_candidate(&w, JobId(5));
        assert_eq!(index.cached_candidates(&w).iter().collect::<Vec<_>>(), vec![6]);
        assert_eq!(index.worker_affinities(&w), vec![1]);
    }

    #[test]
    fn test_claimed_and_unclaimed_jobs() {
        let index = AffinityIndex::new();
        let a = worker("a");
        let b = worker("b");
        index.add_job(1, JobId(1));
        index.add_job(2, JobId(2));
        index.add_job(3, JobId(3));
        index.associate_worker(&a, 1, 0);
        index.associate_worker(&b, 2, 0);

        let others = index.jobs_claimed_by_others(&a);
        assert_eq!(others.iter().collect::<Vec<_>>(), vec![2]);
        let free = index.unclaimed_jobs();
        assert_eq!(free.iter().collect::<Vec<_>>(), vec![3]);

        assert!(index.clear_worker(&b));
        assert!(index.jobs_claimed_by_others(&a).is_empty());
    }

    #[test]
    fn test_prune_and_compact() {
        let index = AffinityIndex::new();
        let a = worker("a");
        index.resolve("gpu");
        index.associate_worker(&a, 1, 50);
        index.touch_worker(&worker("b"), 200);
        assert_eq!(index.prune_workers(100), 1);
        assert_eq!(index.workers().len(), 1);

        index.add_job(1, JobId(3));
        index.add_job(1, JobId(8));
        index.add_job(2, JobId(4));
        assert_eq!(index.compact(JobId(5)), 2);
        assert_eq!(index.job_count(1), 1);
        assert_eq!(index.job_count(2), 0);
        assert_eq!(index.lookup("gpu"), Some(1));
    }

    #[test]
    fn test_workers_snapshot_names_affinities() {
        let index = AffinityIndex::new();
        let gpu = index.resolve("gpu").id;
        index.associate_worker(&worker("a"), gpu, 10);
        let info = index.workers();
        assert_eq!(info[0].worker, "a:9000");
        assert_eq!(info[0].affinities, vec!["gpu".to_string()]);
        assert_eq!(info[0].last_seen, 10);
    }
}
