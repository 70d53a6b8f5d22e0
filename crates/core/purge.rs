//! Reclamation of finished and abandoned jobs.
//!
//! A purge pass walks the status tracker in id order, Failed first, then
//! Canceled, Done and finally Pending, deleting records whose retention
//! window elapsed. Deletions happen in small transactions so the record lock
//! is never held for long. After a pass that deleted anything the affinity
//! index is compacted and the store checkpointed.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{EngineConfig, QueueConfig};
use crate::error::Result;
use crate::job::{secs, Job, JobId, JobStatus};
use crate::queue::Queue;
use crate::registry::QueueRegistry;
use crate::retry::with_retry;
use crate::store::{read_job, PersistentStore};

/// Pending jobs that never ran are kept this many ttls.
const PENDING_TTL_FACTOR: i64 = 10;

const PURGE_ORDER: [JobStatus; 4] = [
    JobStatus::Failed,
    JobStatus::Canceled,
    JobStatus::Done,
    JobStatus::Pending,
];

/// Summary of one purge pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeReport {
    /// Too few new jobs since the last pass; nothing was examined.
    pub skipped: bool,
    pub deleted: usize,
    /// The pass stopped at the deletion limit; more work is likely left.
    pub limit_reached: bool,
}

/// Whether a record's retention window elapsed at `now`.
fn is_purgeable(job: &Job, now: i64, queue_timeout: u64) -> bool {
    let ttl = secs(job.effective_timeout(queue_timeout));
    if ttl == 0 {
        return false;
    }
    match job.status {
        status if status.is_terminal() => {
            let finished = if job.done_time > 0 {
                job.done_time
            } else {
                job.submit_time
            };
            finished.saturating_add(ttl) < now
        }
        JobStatus::Pending => {
            job.done_time == 0
                && job
                    .submit_time
                    .saturating_add(ttl.saturating_mul(PENDING_TTL_FACTOR))
                    < now
        }
        _ => false,
    }
}

impl Queue {
    /// Run one purge pass.
    pub async fn purge_pass(&self) -> Result<PurgeReport> {
        if self.should_skip_purge() {
            return Ok(PurgeReport {
                skipped: true,
                ..Default::default()
            });
        }

        self.prune_expiry();
        let now = self.now();
        let config = self.config();
        let config = &config;
        let batch_size = self.engine.purge_batch_size.max(1);
        let limit = self.engine.purge_pass_limit.max(1);
        let mut report = PurgeReport::default();

        'statuses: for status in PURGE_ORDER {
            let mut from = 0;
            loop {
                let ids = self.status.ids_from(status, from, batch_size);
                let Some(last) = ids.last() else {
                    break;
                };
                from = last.get() + 1;

                let batch = ids.as_slice();
                let deleted = with_retry(&self.engine.retry, "purge", move || {
                    self.purge_batch(batch, status, now, config)
                })
                .await?;
                report.deleted += deleted;

                if report.deleted >= limit {
                    report.limit_reached = true;
                    break 'statuses;
                }
                // pending jobs are scanned oldest first; once a batch keeps
                // everything the rest is younger still
                if status == JobStatus::Pending && deleted == 0 {
                    break;
                }
            }
        }

        if report.deleted > 0 {
            self.compact_after_purge(now, config).await?;
            tracing::info!(
                queue = %self.name,
                deleted = report.deleted,
                limit_reached = report.limit_reached,
                "Purge pass finished"
            );
        }
        Ok(report)
    }

    /// Drop expiration windows of jobs that can no longer expire.
    pub(crate) fn prune_expiry(&self) {
        self.expiry.lock().retain(|id, _| {
            let status = self.status.status(*id);
            status != JobStatus::NotFound && !status.is_terminal()
        });
    }

    fn should_skip_purge(&self) -> bool {
        let last_id = self.last_id.load(Ordering::SeqCst);
        let mut state = self.purge_state.lock();
        let fresh = last_id.saturating_sub(state.last_seen_id);
        if fresh < self.engine.purge_skip_threshold && state.skipped < self.engine.purge_max_skips {
            state.skipped += 1;
            return true;
        }
        state.skipped = 0;
        state.last_seen_id = last_id;
        false
    }

    async fn purge_batch(
        &self,
        ids: &[JobId],
        status: JobStatus,
        now: i64,
        config: &QueueConfig,
    ) -> Result<usize> {
        let _lock = self.record_lock.lock().await;
        let mut tx = self.store.begin().await?;
        let mut removed = Vec::new();
        for id in ids {
            if self.status.status(*id) != status {
                continue;
            }
            match read_job(tx.as_mut(), &self.tables.jobs, *id).await? {
                None => removed.push((*id, 0)),
                Some(job) if is_purgeable(&job, now, config.timeout) => {
                    tx.delete(&self.tables.jobs, id.get()).await?;
                    removed.push((*id, job.affinity_id));
                }
                Some(_) => {}
            }
        }
        if removed.is_empty() {
            return Ok(0);
        }
        tx.commit().await?;

        for (id, affinity_id) in &removed {
            self.forget_job(*id, *affinity_id);
        }
        tracing::debug!(queue = %self.name, status = %status, count = removed.len(), "Purged jobs");
        Ok(removed.len())
    }

    async fn compact_after_purge(&self, now: i64, config: &QueueConfig) -> Result<()> {
        let first_live = self
            .status
            .first_live_id()
            .unwrap_or_else(|| JobId(self.last_id.load(Ordering::SeqCst) + 1));
        let compacted = self.affinity.compact(first_live);
        let workers = self
            .affinity
            .prune_workers(now.saturating_sub(secs(config.timeout)));
        let listeners = self.notifications.prune(now);
        self.store.checkpoint().await?;
        tracing::debug!(
            queue = %self.name,
            first_live = %first_live,
            compacted = compacted,
            workers = workers,
            listeners = listeners,
            "Indexes compacted"
        );
        Ok(())
    }

    /// Release memory held by sparse status sets.
    pub fn optimize_memory(&self) {
        self.status.optimize_memory();
    }
}

/// Runs purge passes over every queue.
pub struct PurgeService {
    registry: Arc<QueueRegistry>,
    busy_pause: Duration,
    idle_pause: Duration,
    optimize_interval: Duration,
    running: Arc<AtomicBool>,
}

impl PurgeService {
    pub fn new(registry: Arc<QueueRegistry>, engine: &EngineConfig, running: Arc<AtomicBool>) -> Self {
        Self {
            registry,
            busy_pause: engine.purge_busy_pause,
            idle_pause: engine.purge_idle_pause,
            optimize_interval: engine.optimize_interval,
            running,
        }
    }

    /// Run the purge loop.
    pub async fn run(&self) -> Result<()> {
        tracing::debug!("Purge service started");
        let mut last_optimize = Instant::now();

        while self.running.load(Ordering::SeqCst) {
            let mut busy = false;
            for queue in self.registry.queues() {
                match queue.purge_pass().await {
                    Ok(report) => busy |= report.limit_reached,
                    Err(e) if e.is_fatal() => {
                        tracing::error!(queue = %queue.name(), error = %e, "Purge service aborted");
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::error!(queue = %queue.name(), error = %e, "Failed to purge jobs");
                    }
                }
            }

            if last_optimize.elapsed() >= self.optimize_interval {
                for queue in self.registry.queues() {
                    queue.optimize_memory();
                }
                last_optimize = Instant::now();
            }

            let pause = if busy { self.busy_pause } else { self.idle_pause };
            tokio::time::sleep(pause).await;
        }

        tracing::debug!("Purge service stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobSubmission, WorkerNode};
    use crate::queue::test_support::harness;

    #[tokio::test]
    async fn test_retention_windows() {
        let h = harness();
        let q = h.queue(QueueConfig::builder("jobs").timeout(100).build()).await;
        let done = q.submit("client", JobSubmission::new("a")).await.unwrap();
        let canceled = q.submit("client", JobSubmission::new("b")).await.unwrap();
        let pending = q.submit("client", JobSubmission::new("c")).await.unwrap();
        q.get_job(&WorkerNode::new("w", 1), &[]).await.unwrap().unwrap();
        q.put("w", done, 0, "").await.unwrap();
        q.cancel("client", canceled).await.unwrap();

        h.clock.advance(100);
        assert_eq!(q.purge_pass().await.unwrap().deleted, 0);

        h.clock.advance(1);
        let report = q.purge_pass().await.unwrap();
        assert_eq!(report.deleted, 2);
        assert_eq!(q.get_status(done).await.unwrap(), JobStatus::NotFound);
        assert_eq!(q.get_status(canceled).await.unwrap(), JobStatus::NotFound);
        assert_eq!(h.store.len("jobs_jobs"), 1);
        assert_eq!(h.store.checkpoint_count(), 1);

        // pending jobs are kept ten ttls
        h.clock.set(1_000 + 1_000);
        assert_eq!(q.purge_pass().await.unwrap().deleted, 0);
        h.clock.set(1_000 + 1_001);
        assert_eq!(q.purge_pass().await.unwrap().deleted, 1);
        assert_eq!(q.status(pending), JobStatus::NotFound);
        assert!(h.store.is_empty("jobs_jobs"));
    }

    #[test]
    fn test_unbounded_ttl_never_elapses() {
        let mut job = Job::from_submission(JobId(1), "jobs", &JobSubmission::new("a"), 0, 1000);
        job.timeout = u64::MAX;
        assert!(!is_purgeable(&job, i64::MAX, 0));

        job.status = JobStatus::Done;
        job.done_time = 2000;
        assert!(!is_purgeable(&job, i64::MAX, 0));
    }

    #[tokio::test]
    async fn test_job_timeout_overrides_queue_ttl() {
        let h = harness();
        let q = h.queue(QueueConfig::builder("jobs").timeout(3600).build()).await;
        let short = q
            .submit("client", JobSubmission::new("a").timeout(10))
            .await
            .unwrap();
        let long = q.submit("client", JobSubmission::new("b")).await.unwrap();
        q.cancel("client", short).await.unwrap();
        q.cancel("client", long).await.unwrap();

        h.clock.advance(11);
        assert_eq!(q.purge_pass().await.unwrap().deleted, 1);
        assert_eq!(q.status(short), JobStatus::NotFound);
        assert_eq!(q.status(long), JobStatus::Canceled);
    }

    #[tokio::test]
    async fn test_running_jobs_are_never_purged() {
        let h = harness();
        let q = h
            .queue(
                QueueConfig::builder("jobs")
                    .timeout(10)
                    .run_timeout(0)
                    .build(),
            )
            .await;
        let id = q.submit("client", JobSubmission::new("a")).await.unwrap();
        q.get_job(&WorkerNode::new("w", 1), &[]).await.unwrap().unwrap();
        h.clock.advance(10_000);
        assert_eq!(q.purge_pass().await.unwrap().deleted, 0);
        assert_eq!(q.status(id), JobStatus::Running);
    }

    #[tokio::test]
    async fn test_pass_limit() {
        let h = harness();
        let mut context = h.context.clone();
        context.engine.purge_batch_size = 2;
        context.engine.purge_pass_limit = 3;
        let q = Queue::mount(QueueConfig::builder("jobs").timeout(10).build(), &context)
            .await
            .unwrap();
        for i in 0..5 {
            let id = q
                .submit("client", JobSubmission::new(format!("{}", i)))
                .await
                .unwrap();
            q.cancel("client", id).await.unwrap();
        }

        h.clock.advance(11);
        let report = q.purge_pass().await.unwrap();
        assert!(report.limit_reached);
        assert_eq!(report.deleted, 4);
        let report = q.purge_pass().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert!(!report.limit_reached);
    }

    #[tokio::test]
    async fn test_pass_skipped_until_enough_new_jobs() {
        let h = harness();
        let mut context = h.context.clone();
        context.engine.purge_skip_threshold = 5;
        context.engine.purge_max_skips = 2;
        let q = Queue::mount(QueueConfig::builder("jobs").build(), &context)
            .await
            .unwrap();
        q.submit("client", JobSubmission::new("a")).await.unwrap();

        assert!(q.purge_pass().await.unwrap().skipped);
        assert!(q.purge_pass().await.unwrap().skipped);
        assert!(!q.purge_pass().await.unwrap().skipped);
        assert!(q.purge_pass().await.unwrap().skipped);
    }

    #[tokio::test]
    async fn test_affinity_compacted_after_purge() {
        let h = harness();
        let q = h.queue(QueueConfig::builder("jobs").timeout(10).build()).await;
        let w = WorkerNode::new("w", 1);
        let old = q
            .submit("client", JobSubmission::new("a").affinity("gpu"))
            .await
            .unwrap();
        q.get_job(&w, &[]).await.unwrap().unwrap();
        q.put("w", old, 0, "").await.unwrap();

        h.clock.advance(11);
        let fresh = q
            .submit("client", JobSubmission::new("b").affinity("gpu"))
            .await
            .unwrap();
        assert_eq!(q.purge_pass().await.unwrap().deleted, 1);
        assert_eq!(q.status(old), JobStatus::NotFound);
        assert_eq!(q.status(fresh), JobStatus::Pending);
        assert_eq!(q.affinity.job_count(q.affinity.lookup("gpu").unwrap()), 1);
        // worker last seen before the retention window is forgotten
        assert!(q.affinity.workers().is_empty());
    }

    #[tokio::test]
    async fn test_purge_service_loop() {
        let h = harness();
        let mut context = h.context.clone();
        context.engine.purge_idle_pause = Duration::from_millis(5);
        let registry = QueueRegistry::open(context.clone(), vec![QueueConfig::builder("jobs").timeout(5).build()])
            .await
            .unwrap();
        let q = registry.get("jobs").unwrap();
        let id = q.submit("client", JobSubmission::new("a")).await.unwrap();
        q.cancel("client", id).await.unwrap();
        h.clock.advance(6);

        let running = Arc::new(AtomicBool::new(true));
        let service = PurgeService::new(registry.clone(), &context.engine, running.clone());
        let handle = tokio::spawn(async move { service.run().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        running.store(false, Ordering::SeqCst);
        handle.await.unwrap().unwrap();
        assert_eq!(q.status(id), JobStatus::NotFound);
    }
}
