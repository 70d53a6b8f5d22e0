//! In-memory job status index.
//!
//! One [`BitSet`] per status holds the authoritative in-memory view of every
//! job. A separate borrowed set holds jobs that a dispatcher has taken out of
//! Pending/Returned while it decides whether to hand them out; they are
//! invisible to other dispatchers and return to their origin state unless the
//! [`Reservation`] is committed.
//!
//! All operations are bit operations under a single `RwLock` and never touch
//! the store.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::bitset::BitSet;
use crate::job::{JobId, JobStatus};

/// Result of a guarded status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChange {
    /// The job moved from `from` to the requested status.
    Applied { from: JobStatus },
    /// The request is a benign no-op (e.g. canceling a finished job).
    Unchanged { current: JobStatus },
    /// The transition makes no sense for the current status.
    Invalid { current: JobStatus },
}

impl StatusChange {
    pub fn is_applied(&self) -> bool {
        matches!(self, StatusChange::Applied { .. })
    }

    /// Status the job had when the change was requested.
    pub fn previous(&self) -> JobStatus {
        match *self {
            StatusChange::Applied { from } => from,
            StatusChange::Unchanged { current } | StatusChange::Invalid { current } => current,
        }
    }
}

/// Decide whether `from -> to` is allowed.
fn check_transition(from: JobStatus, to: JobStatus) -> StatusChange {
    use JobStatus::*;

    let applied = StatusChange::Applied { from };
    let unchanged = StatusChange::Unchanged { current: from };
    let invalid = StatusChange::Invalid { current: from };

    match (from, to) {
        (_, NotFound) => applied,
        (NotFound, Pending) => applied,
        (NotFound, _) => invalid,
        (a, b) if a == b => unchanged,

        (Running | Returned, Pending) => applied,
        (Canceled | Failed | Done, Pending) => invalid,
        (Pending, Pending) => unchanged,

        (Pending | Returned, Running) => applied,
        (Canceled, Running) => unchanged,
        (_, Running) => invalid,

        (Running, Returned) => applied,
        (Pending, Returned) => invalid,
        (_, Returned) => unchanged,

        (Pending | Running | Returned, Canceled | Failed | Done) => applied,
        (_, Canceled | Failed | Done) => unchanged,
    }
}

/// Per-status job counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub running: usize,
    pub returned: usize,
    pub canceled: usize,
    pub failed: usize,
    pub done: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.pending + self.running + self.returned + self.canceled + self.failed + self.done
    }

    pub fn as_map(&self) -> BTreeMap<String, usize> {
        [
            (JobStatus::Pending, self.pending),
            (JobStatus::Running, self.running),
            (JobStatus::Returned, self.returned),
            (JobStatus::Canceled, self.canceled),
            (JobStatus::Failed, self.failed),
            (JobStatus::Done, self.done),
        ]
        .into_iter()
        .map(|(s, n)| (s.to_string(), n))
        .collect()
    }
}

#[derive(Default)]
struct TrackerState {
    sets: [BitSet; 6],
    borrowed: BitSet,
    // origin status of each borrowed job
    borrowed_returned: BitSet,
}

impl TrackerState {
    fn set(&mut self, status: JobStatus) -> Option<&mut BitSet> {
        status.index().map(|i| &mut self.sets[i])
    }

    fn status(&self, id: u64) -> JobStatus {
        if self.borrowed.contains(id) {
            return if self.borrowed_returned.contains(id) {
                JobStatus::Returned
            } else {
                JobStatus::Pending
            };
        }
        JobStatus::TRACKED
            .iter()
            .zip(self.sets.iter())
            .find(|(_, set)| set.contains(id))
            .map(|(status, _)| *status)
            .unwrap_or(JobStatus::NotFound)
    }

    fn clear_everywhere(&mut self, id: u64) {
        for set in self.sets.iter_mut() {
            set.remove(id);
        }
        self.borrowed.remove(id);
        self.borrowed_returned.remove(id);
    }

    fn put(&mut self, id: u64, status: JobStatus) {
        self.clear_everywhere(id);
        if let Some(set) = self.set(status) {
            set.insert(id);
        }
    }

    fn dispatchable(&self) -> (&BitSet, &BitSet) {
        (
            &self.sets[0], // Pending
            &self.sets[2], // Returned
        )
    }

    fn borrow(&mut self, id: u64) -> Option<JobStatus> {
        let origin = match self.status(id) {
            s @ (JobStatus::Pending | JobStatus::Returned) if !self.borrowed.contains(id) => s,
            _ => return None,
        };
        if let Some(set) = self.set(origin) {
            set.remove(id);
        }
        self.borrowed.insert(id);
        if origin == JobStatus::Returned {
            self.borrowed_returned.insert(id);
        }
        Some(origin)
    }
}

/// Authoritative in-memory job status index for one queue.
#[derive(Default)]
pub struct StatusTracker {
    state: RwLock<TrackerState>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status. Borrowed jobs report their origin status.
    pub fn status(&self, id: JobId) -> JobStatus {
        self.state.read().status(id.get())
    }

    /// Unconditionally set a status. `NotFound` forgets the job.
    pub fn set_status(&self, id: JobId, status: JobStatus) {
        self.state.write().put(id.get(), status);
    }

    /// Apply `to` if the transition table allows it.
    pub fn change_status(&self, id: JobId, to: JobStatus) -> StatusChange {
        let mut state = self.state.write();
        let change = check_transition(state.status(id.get()), to);
        if change.is_applied() {
            state.put(id.get(), to);
        }
        change
    }

    /// Apply `to` and return a guard that restores the previous status when
    /// dropped without [`TransitionGuard::commit`].
    ///
    /// Returns the rejected change when the transition is not applied.
    pub fn begin_transition(
        &self,
        id: JobId,
        to: JobStatus,
    ) -> Result<TransitionGuard<'_>, StatusChange> {
        match self.change_status(id, to) {
            StatusChange::Applied { from } => Ok(TransitionGuard {
                tracker: self,
                id,
                from,
                to,
                armed: true,
            }),
            rejected => Err(rejected),
        }
    }

    pub fn count(&self, status: JobStatus) -> usize {
        let state = self.state.read();
        match status {
            JobStatus::Pending => state.sets[0].len() + state.borrowed.len()
                - state.borrowed_returned.len(),
            JobStatus::Returned => state.sets[2].len() + state.borrowed_returned.len(),
            JobStatus::NotFound => 0,
            other => other.index().map_or(0, |i| state.sets[i].len()),
        }
    }

    pub fn counts(&self) -> StatusCounts {
        StatusCounts {
            pending: self.count(JobStatus::Pending),
            running: self.count(JobStatus::Running),
            returned: self.count(JobStatus::Returned),
            canceled: self.count(JobStatus::Canceled),
            failed: self.count(JobStatus::Failed),
            done: self.count(JobStatus::Done),
        }
    }

    /// Snapshot of ids currently in `status` (borrowed jobs excluded).
    pub fn snapshot(&self, status: JobStatus) -> BitSet {
        let state = self.state.read();
        status
            .index()
            .map(|i| state.sets[i].clone())
            .unwrap_or_default()
    }

    /// Up to `limit` ids in `status` with id `>= from`.
    pub fn ids_from(&self, status: JobStatus, from: u64, limit: usize) -> Vec<JobId> {
        let state = self.state.read();
        match status.index() {
            Some(i) => {
                let set = &state.sets[i];
                let mut ids = Vec::with_capacity(limit.min(set.len()));
                let mut next = set.next_from(from);
                while let (Some(id), true) = (next, ids.len() < limit) {
                    ids.push(JobId(id));
                    next = set.next_from(id + 1);
                }
                ids
            }
            None => Vec::new(),
        }
    }

    /// Whether any job is waiting for dispatch.
    pub fn has_dispatchable(&self) -> bool {
        let state = self.state.read();
        let (pending, returned) = state.dispatchable();
        !pending.is_empty() || !returned.is_empty()
    }

    /// Mark `first..=last` Pending in one step.
    pub fn add_pending_range(&self, first: JobId, last: JobId) {
        let mut state = self.state.write();
        for id in first.get()..=last.get() {
            state.clear_everywhere(id);
        }
        state.sets[0].insert_range(first.get(), last.get());
    }

    /// Move `ids` from Returned to Pending. Ids no longer Returned, or
    /// currently borrowed, are left alone. Returns how many moved.
    pub fn promote_returned(&self, ids: &[JobId]) -> usize {
        let mut state = self.state.write();
        let mut moved = 0;
        for id in ids {
            if state.sets[2].remove(id.get()) {
                state.sets[0].insert(id.get());
                moved += 1;
            }
        }
        moved
    }

    /// Smallest id with any status.
    pub fn first_live_id(&self) -> Option<JobId> {
        let state = self.state.read();
        state
            .sets
            .iter()
            .chain(std::iter::once(&state.borrowed))
            .filter_map(|s| s.first())
            .min()
            .map(JobId)
    }

    /// Largest id with any status.
    pub fn last_live_id(&self) -> Option<JobId> {
        let state = self.state.read();
        state
            .sets
            .iter()
            .chain(std::iter::once(&state.borrowed))
            .filter_map(|s| s.last())
            .max()
            .map(JobId)
    }

    /// Forget every job.
    pub fn clear(&self) {
        let mut state = self.state.write();
        *state = TrackerState::default();
    }

    /// Release memory held by sparse bit vectors.
    pub fn optimize_memory(&self) {
        let mut state = self.state.write();
        for set in state.sets.iter_mut() {
            set.shrink_to_fit();
        }
        state.borrowed.shrink_to_fit();
        state.borrowed_returned.shrink_to_fit();
    }

    // ========== Reservations ==========

    /// Borrow a specific job if it is Pending or Returned.
    pub fn reserve(&self, id: JobId) -> Option<Reservation<'_>> {
        let origin = self.state.write().borrow(id.get())?;
        Some(Reservation::new(self, id, origin))
    }

    /// Borrow the oldest dispatchable job.
    pub fn reserve_next(&self) -> Option<Reservation<'_>> {
        let mut state = self.state.write();
        let (pending, returned) = state.dispatchable();
        let id = min_opt(pending.first(), returned.first())?;
        let origin = state.borrow(id)?;
        Some(Reservation::new(self, JobId(id), origin))
    }

    /// Borrow the oldest dispatchable job contained in `candidates`.
    pub fn reserve_first_of(&self, candidates: &BitSet) -> Option<Reservation<'_>> {
        let mut state = self.state.write();
        let (pending, returned) = state.dispatchable();
        let id = min_opt(candidates.first_common(pending), candidates.first_common(returned))?;
        let origin = state.borrow(id)?;
        Some(Reservation::new(self, JobId(id), origin))
    }

    /// Borrow the oldest dispatchable job not contained in `excluded`.
    pub fn reserve_first_excluding(&self, excluded: &BitSet) -> Option<Reservation<'_>> {
        let mut state = self.state.write();
        let (pending, returned) = state.dispatchable();
        let id = min_opt(pending.first_not_in(excluded), returned.first_not_in(excluded))?;
        let origin = state.borrow(id)?;
        Some(Reservation::new(self, JobId(id), origin))
    }

    fn settle_borrowed(&self, id: JobId, status: JobStatus) -> bool {
        let mut state = self.state.write();
        if !state.borrowed.contains(id.get()) {
            return false;
        }
        state.put(id.get(), status);
        true
    }

    fn restore(&self, id: JobId, from: JobStatus, to: JobStatus) {
        let mut state = self.state.write();
        if state.status(id.get()) == to && !state.borrowed.contains(id.get()) {
            state.put(id.get(), from);
        }
    }
}

fn min_opt(a: Option<u64>, b: Option<u64>) -> Option<u64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

/// A job taken out of Pending/Returned for dispatch evaluation.
///
/// Dropping the reservation puts the job back where it came from, unless
/// someone else changed its status in the meantime.
pub struct Reservation<'a> {
    tracker: &'a StatusTracker,
    id: JobId,
    origin: JobStatus,
    settled: bool,
}

impl<'a> Reservation<'a> {
    fn new(tracker: &'a StatusTracker, id: JobId, origin: JobStatus) -> Self {
        Self {
            tracker,
            id,
            origin,
            settled: false,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn origin(&self) -> JobStatus {
        self.origin
    }

    /// Whether the job is still held by this reservation.
    pub fn is_held(&self) -> bool {
        self.tracker.state.read().borrowed.contains(self.id.get())
    }

    /// Settle the job into `status`. Returns `false` if the job was taken
    /// away (canceled, dropped) while reserved.
    pub fn commit(mut self, status: JobStatus) -> bool {
        self.settled = true;
        self.tracker.settle_borrowed(self.id, status)
    }

    /// Return the job to its origin status.
    pub fn rollback(self) {}
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.tracker.settle_borrowed(self.id, self.origin);
        }
    }
}

/// Scoped status transition; reverts on drop unless committed.
pub struct TransitionGuard<'a> {
    tracker: &'a StatusTracker,
    id: JobId,
    from: JobStatus,
    to: JobStatus,
    armed: bool,
}

impl TransitionGuard<'_> {
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Status the job had before the transition.
    pub fn from(&self) -> JobStatus {
        self.from
    }

    pub fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for TransitionGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.tracker.restore(self.id, self.from, self.to);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with(jobs: &[(u64, JobStatus)]) -> StatusTracker {
        let tracker = StatusTracker::new();
        for (id, status) in jobs {
            tracker.set_status(JobId(*id), *status);
        }
        tracker
    }

    #[test]
    fn test_set_and_get_status() {
        let tracker = tracker_with(&[(1, JobStatus::Pending), (2, JobStatus::Done)]);
        assert_eq!(tracker.status(JobId(1)), JobStatus::Pending);
        assert_eq!(tracker.status(JobId(2)), JobStatus::Done);
        assert_eq!(tracker.status(JobId(3)), JobStatus::NotFound);

        tracker.set_status(JobId(1), JobStatus::Running);
        assert_eq!(tracker.status(JobId(1)), JobStatus::Running);
        assert_eq!(tracker.count(JobStatus::Pending), 0);

        tracker.set_status(JobId(1), JobStatus::NotFound);
        assert_eq!(tracker.status(JobId(1)), JobStatus::NotFound);
        assert_eq!(tracker.counts().total(), 1);
    }

    #[test]
    fn test_transition_table() {
        use JobStatus::*;
        assert!(check_transition(Running, Done).is_applied());
        assert!(check_transition(Pending, Canceled).is_applied());
        assert!(check_transition(Returned, Running).is_applied());
        assert_eq!(
            check_transition(Canceled, Done),
            StatusChange::Unchanged { current: Canceled }
        );
        assert_eq!(
            check_transition(Done, Canceled),
            StatusChange::Unchanged { current: Done }
        );
        assert_eq!(
            check_transition(Running, Running),
            StatusChange::Unchanged { current: Running }
        );
        assert_eq!(
            check_transition(Pending, Pending),
            StatusChange::Unchanged { current: Pending }
        );
        assert_eq!(
            check_transition(Done, Pending),
            StatusChange::Invalid { current: Done }
        );
        assert_eq!(
            check_transition(NotFound, Done),
            StatusChange::Invalid { current: NotFound }
        );
        assert!(check_transition(Failed, NotFound).is_applied());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let tracker = tracker_with(&[(1, JobStatus::Running)]);
        assert!(tracker.change_status(JobId(1), JobStatus::Canceled).is_applied());
        assert_eq!(
            tracker.change_status(JobId(1), JobStatus::Canceled),
            StatusChange::Unchanged {
                current: JobStatus::Canceled
            }
        );
        assert_eq!(
            tracker.change_status(JobId(1), JobStatus::Done),
            StatusChange::Unchanged {
                current: JobStatus::Canceled
            }
        );
    }

    #[test]
    fn test_transition_guard_reverts_on_drop() {
        let tracker = tracker_with(&[(1, JobStatus::Running)]);
        {
            let guard = tracker.begin_transition(JobId(1), JobStatus::Done).unwrap();
            assert_eq!(guard.from(), JobStatus::Running);
            assert_eq!(tracker.status(JobId(1)), JobStatus::Done);
        }
        assert_eq!(tracker.status(JobId(1)), JobStatus::Running);

        let guard = tracker.begin_transition(JobId(1), JobStatus::Done).unwrap();
        guard.commit();
        assert_eq!(tracker.status(JobId(1)), JobStatus::Done);

        assert!(tracker.begin_transition(JobId(1), JobStatus::Done).is_err());
    }

    #[test]
    fn test_reservation_commit_and_rollback() {
        let tracker = tracker_with(&[(1, JobStatus::Pending), (2, JobStatus::Pending)]);

        let r = tracker.reserve_next().unwrap();
        assert_eq!(r.id(), JobId(1));
        // borrowed jobs are invisible to other claimants
        let other = tracker.reserve_next().unwrap();
        assert_eq!(other.id(), JobId(2));
        assert!(tracker.reserve_next().is_none());
        assert_eq!(tracker.status(JobId(1)), JobStatus::Pending);

        assert!(r.commit(JobStatus::Running));
        assert_eq!(tracker.status(JobId(1)), JobStatus::Running);

        other.rollback();
        assert_eq!(tracker.status(JobId(2)), JobStatus::Pending);
        assert_eq!(tracker.count(JobStatus::Pending), 1);
    }

    #[test]
    fn test_reservation_loses_to_cancel() {
        let tracker = tracker_with(&[(1, JobStatus::Pending)]);
        let r = tracker.reserve(JobId(1)).unwrap();
        assert!(tracker.change_status(JobId(1), JobStatus::Canceled).is_applied());
        assert!(!r.is_held());
        assert!(!r.commit(JobStatus::Running));
        assert_eq!(tracker.status(JobId(1)), JobStatus::Canceled);
    }

    #[test]
    fn test_reservation_restores_returned_origin() {
        let tracker = tracker_with(&[(4, JobStatus::Returned)]);
        {
            let r = tracker.reserve_next().unwrap();
            assert_eq!(r.origin(), JobStatus::Returned);
            assert_eq!(tracker.count(JobStatus::Returned), 1);
        }
        assert_eq!(tracker.status(JobId(4)), JobStatus::Returned);
    }

    #[test]
    fn test_reserve_with_candidates_and_exclusions() {
        let tracker = tracker_with(&[
            (1, JobStatus::Pending),
            (2, JobStatus::Running),
            (3, JobStatus::Returned),
            (4, JobStatus::Pending),
        ]);
        let candidates: BitSet = [2, 3, 4].into_iter().collect();
        let r = tracker.reserve_first_of(&candidates).unwrap();
        assert_eq!(r.id(), JobId(3));
        drop(r);

        let excluded: BitSet = [1].into_iter().collect();
        let r = tracker.reserve_first_excluding(&excluded).unwrap();
        assert_eq!(r.id(), JobId(3));
        drop(r);

        assert!(tracker.reserve(JobId(2)).is_none());
    }

    #[test]
    fn test_concurrent_reservations_never_double_dispatch() {
        use std::sync::Arc;

        let tracker = Arc::new(StatusTracker::new());
        tracker.add_pending_range(JobId(1), JobId(200));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Some(r) = tracker.reserve_next() {
                        let id = r.id();
                        if r.commit(JobStatus::Running) {
                            got.push(id.get());
                        }
                    }
                    got
                })
            })
            .collect();

        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (1..=200).collect::<Vec<_>>());
        assert_eq!(tracker.count(JobStatus::Running), 200);
    }

    #[test]
    fn test_batch_range_and_sweep() {
        let tracker = StatusTracker::new();
        tracker.add_pending_range(JobId(10), JobId(14));
        assert_eq!(tracker.count(JobStatus::Pending), 5);
        assert_eq!(tracker.first_live_id(), Some(JobId(10)));
        assert_eq!(tracker.last_live_id(), Some(JobId(14)));

        tracker.set_status(JobId(11), JobStatus::Returned);
        tracker.set_status(JobId(12), JobStatus::Returned);
        let returned: Vec<JobId> = tracker.snapshot(JobStatus::Returned).iter().map(JobId).collect();
        assert_eq!(returned, vec![JobId(11), JobId(12)]);
        assert_eq!(tracker.promote_returned(&[JobId(11), JobId(12), JobId(13)]), 2);
        assert_eq!(tracker.count(JobStatus::Pending), 5);
        assert_eq!(tracker.count(JobStatus::Returned), 0);
    }

    #[test]
    fn test_ids_from_paging() {
        let tracker = StatusTracker::new();
        tracker.add_pending_range(JobId(1), JobId(10));
        assert_eq!(
            tracker.ids_from(JobStatus::Pending, 4, 3),
            vec![JobId(4), JobId(5), JobId(6)]
        );
        assert!(tracker.ids_from(JobStatus::Done, 0, 3).is_empty());
    }

    #[test]
    fn test_clear_and_has_dispatchable() {
        let tracker = tracker_with(&[(1, JobStatus::Returned)]);
        assert!(tracker.has_dispatchable());
        tracker.clear();
        assert!(!tracker.has_dispatchable());
        assert_eq!(tracker.first_live_id(), None);
    }
}
