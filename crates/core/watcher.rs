//! Execution timeout watcher and Returned sweep.
//!
//! The watcher takes due entries out of each queue's execution timeline,
//! re-checks them against the job record and hands expired runs back for
//! redispatch (or fails them once the run budget is spent). Jobs given back
//! this way are Returned; a separate slower sweep folds them into Pending.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::engine::TOO_MANY_RUNS_MESSAGE;
use crate::error::Result;
use crate::job::{JobId, JobStatus};
use crate::queue::Queue;
use crate::registry::QueueRegistry;
use crate::retry::with_retry;
use crate::store::{read_job, write_job, PersistentStore};

impl Queue {
    /// Expire every run whose deadline passed. Returns how many jobs were
    /// taken away from their workers.
    pub async fn check_execution_timeouts(&self) -> Result<usize> {
        let now = self.now();
        let due = self.timeline.lock().take_due(now);
        if due.is_empty() {
            return Ok(0);
        }

        let mut expired = 0;
        for (index, id) in due.iter().copied().enumerate() {
            match with_retry(&self.engine.retry, "run-timeout", move || self.expire_run(id, now))
                .await
            {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => {
                    let mut timeline = self.timeline.lock();
                    for id in &due[index..] {
                        timeline.add_at(*id, now);
                    }
                    drop(timeline);
                    if expired > 0 {
                        self.notifications.wake_waiters();
                    }
                    return Err(e);
                }
            }
        }

        if expired > 0 {
            self.notifications.wake_waiters();
        }
        Ok(expired)
    }

    async fn expire_run(&self, id: JobId, now: i64) -> Result<bool> {
        let config = self.config();
        let _lock = self.record_lock.lock().await;
        if self.status.status(id) != JobStatus::Running {
            return Ok(false);
        }

        let mut tx = self.store.begin().await?;
        let Some(mut job) = read_job(tx.as_mut(), &self.tables.jobs, id).await? else {
            self.status.set_status(id, JobStatus::NotFound);
            return Ok(false);
        };
        if job.status != JobStatus::Running {
            self.status.set_status(id, job.status);
            return Ok(false);
        }
        match job.run_deadline(config.effective_run_timeout()) {
            None => return Ok(false),
            Some(deadline) if now < deadline => {
                self.timeline.lock().add_at(id, deadline);
                return Ok(false);
            }
            Some(_) => {}
        }

        let worker = job
            .current_worker()
            .map(|w| w.to_string())
            .unwrap_or_default();
        if job.run_counter as usize >= config.max_run_attempts {
            job.status = JobStatus::Failed;
            job.error_message = TOO_MANY_RUNS_MESSAGE.to_string();
            job.done_time = now;
        } else {
            job.status = JobStatus::Returned;
        }
        write_job(tx.as_mut(), &self.tables.jobs, &job).await?;
        tx.commit().await?;

        self.status.set_status(id, job.status);
        if job.status == JobStatus::Failed {
            self.affinity.remove_job(job.affinity_id, id);
        }
        tracing::info!(
            queue = %self.name,
            job_id = %id,
            worker = %worker,
            status = %job.status,
            run = job.run_counter,
            "Job run timed out"
        );
        self.publish(|| format!("timeout job={} worker={} status={}", id, worker, job.status));
        Ok(true)
    }

    /// Fold Returned jobs into Pending. Returns how many moved.
    ///
    /// The tracker follows the store: ids flip only after the records are
    /// committed as Pending.
    pub async fn return_to_pending(&self) -> Result<usize> {
        if self.status.count(JobStatus::Returned) == 0 {
            return Ok(0);
        }
        let moved = with_retry(&self.engine.retry, "return-to-pending", move || {
            self.persist_returned()
        })
        .await?;
        if moved > 0 {
            self.notifications.wake_waiters();
            tracing::debug!(queue = %self.name, count = moved, "Returned jobs moved to Pending");
        }
        Ok(moved)
    }

    async fn persist_returned(&self) -> Result<usize> {
        let _lock = self.record_lock.lock().await;
        let ids: Vec<JobId> = self.status.snapshot(JobStatus::Returned).iter().map(JobId).collect();
        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.store.begin().await?;
        let mut promoted = Vec::with_capacity(ids.len());
        let mut stale = Vec::new();
        for id in ids {
            match read_job(tx.as_mut(), &self.tables.jobs, id).await? {
                Some(mut job) if job.status == JobStatus::Returned => {
                    job.status = JobStatus::Pending;
                    write_job(tx.as_mut(), &self.tables.jobs, &job).await?;
                    promoted.push(id);
                }
                Some(job) => stale.push((id, job.status)),
                None => stale.push((id, JobStatus::NotFound)),
            }
        }
        tx.commit().await?;

        for (id, status) in stale {
            self.status.set_status(id, status);
        }
        Ok(self.status.promote_returned(&promoted))
    }
}

/// Periodically expires overdue runs in every queue.
pub struct TimeoutWatcher {
    registry: Arc<QueueRegistry>,
    interval: Duration,
    running: Arc<AtomicBool>,
}

impl TimeoutWatcher {
    pub fn new(registry: Arc<QueueRegistry>, interval: Duration, running: Arc<AtomicBool>) -> Self {
        Self {
            registry,
            interval,
            running,
        }
    }

    /// Run the watcher loop. Returns early only on an unrecoverable store
    /// error.
    pub async fn run(&self) -> Result<()> {
        tracing::debug!("Timeout watcher started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            for queue in self.registry.queues() {
                match queue.check_execution_timeouts().await {
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => {
                        tracing::error!(queue = %queue.name(), error = %e, "Timeout watcher aborted");
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::error!(queue = %queue.name(), error = %e, "Failed to check run timeouts");
                    }
                }
            }
        }

        tracing::debug!("Timeout watcher stopped");
        Ok(())
    }
}

/// Periodically moves Returned jobs back to Pending in every queue.
pub struct ReturnedSweeper {
    registry: Arc<QueueRegistry>,
    interval: Duration,
    running: Arc<AtomicBool>,
}

impl ReturnedSweeper {
    pub fn new(registry: Arc<QueueRegistry>, interval: Duration, running: Arc<AtomicBool>) -> Self {
        Self {
            registry,
            interval,
            running,
        }
    }

    pub async fn run(&self) -> Result<()> {
        tracing::debug!("Returned sweeper started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            for queue in self.registry.queues() {
                match queue.return_to_pending().await {
                    Ok(_) => {}
                    Err(e) if e.is_fatal() => {
                        tracing::error!(queue = %queue.name(), error = %e, "Returned sweeper aborted");
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::error!(queue = %queue.name(), error = %e, "Failed to sweep returned jobs");
                    }
                }
            }
        }

        tracing::debug!("Returned sweeper stopped");
        Ok(())
    }
}
