//! Job lifecycle operations of a [`Queue`].
//!
//! Every mutation follows the same shape: take the queue's record lock,
//! claim the status transition on the tracker, apply it to the job record in
//! one store transaction, and only then make the in-memory change final.
//! Transitions into a dispatchable state are published to the tracker after
//! the commit so no worker can pick up a job whose record is not yet written.
//!
//! Dispatch is the exception: candidates are reserved on the tracker without
//! the record lock and re-validated against the record once the lock is held.

use std::time::Duration;

use crate::config::QueueConfig;
use crate::error::{NsError, Result};
use crate::job::{
    truncate_message, DispatchedJob, Job, JobDescription, JobId, JobStatus, JobSubmission,
    SubmitterNotify, WorkerNode, MAX_TIMEOUT,
};
use crate::load_balance::LbDecision;
use crate::queue::{Outcome, Queue};
use crate::retry::with_retry;
use crate::status::{Reservation, StatusChange, TransitionGuard};
use crate::store::{fetch_job, read_job, scan_jobs, write_job, PersistentStore, StoreTransaction};

pub(crate) const EXPIRED_MESSAGE: &str = "Job expired and cannot be scheduled.";
pub(crate) const TOO_MANY_RUNS_MESSAGE: &str = "Too many run attempts.";

const DUMP_BATCH: usize = 1000;

/// Terminal transition requested by a caller.
#[derive(Debug, Clone, Copy)]
enum Completion<'a> {
    Done { return_code: i32, output: &'a str },
    Failed { return_code: i32, output: &'a str, error: &'a str },
    Canceled,
}

impl Completion<'_> {
    fn status(&self) -> JobStatus {
        match self {
            Completion::Done { .. } => JobStatus::Done,
            Completion::Failed { .. } => JobStatus::Failed,
            Completion::Canceled => JobStatus::Canceled,
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            Completion::Done { .. } => "put",
            Completion::Failed { .. } => "put-failure",
            Completion::Canceled => "cancel",
        }
    }

    fn apply(&self, job: &mut Job, now: i64, max_message: usize) {
        job.status = self.status();
        job.done_time = now;
        match *self {
            Completion::Done {
                return_code,
                output,
            } => {
                job.return_code = return_code;
                job.output = output.to_string();
            }
            Completion::Failed {
                return_code,
                output,
                error,
            } => {
                job.return_code = return_code;
                job.output = output.to_string();
                job.error_message = truncate_message(error, max_message);
            }
            Completion::Canceled => {}
        }
    }
}

/// What a committed completion still has to do in memory and on the wire.
#[derive(Debug)]
struct CompletionEffects {
    id: JobId,
    status: JobStatus,
    affinity_id: u32,
    run_time: i64,
    submit_time: i64,
    deleted: bool,
    /// Taken from the record before it was rewritten or deleted.
    notify: Option<SubmitterNotify>,
}

enum Staged {
    Ready(CompletionEffects),
    /// The record is gone.
    Missing,
    /// The record is already terminal.
    Settled(JobStatus),
}

enum Claim<'a> {
    Granted(TransitionGuard<'a>),
    Rejected(Outcome),
}

/// Dispatch decision written into the open transaction.
enum DispatchStage {
    Run(Box<Job>),
    Fail(Box<Job>),
    Deny { decision: LbDecision, stall: i64 },
    /// The record is not dispatchable (or missing) after all.
    Vanished(JobStatus),
}

enum Step {
    Granted(DispatchedJob),
    Denied,
    Skipped,
}

impl Queue {
    // ========== Submission ==========

    /// Add one job. Returns its id.
    pub async fn submit(&self, submitter_host: &str, submission: JobSubmission) -> Result<JobId> {
        self.check_submitter(submitter_host)?;
        let config = self.config();
        check_submission(&submission, &config)?;

        let submission = &submission;
        let config = &config;
        let id = with_retry(&self.engine.retry, "submit", move || {
            self.submit_once(submission, config)
        })
        .await?;

        tracing::debug!(queue = %self.name, job_id = %id, "Job submitted");
        self.publish(|| format!("submit job={}", id));
        self.notifications.wake_waiters();
        Ok(id)
    }

    async fn submit_once(&self, submission: &JobSubmission, config: &QueueConfig) -> Result<JobId> {
        let now = self.now();
        let _lock = self.record_lock.lock().await;

        let resolved = submission
            .affinity
            .as_deref()
            .filter(|token| !token.is_empty())
            .map(|token| (token, self.affinity.resolve(token)));
        let id = JobId(self.last_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1);
        let mut job = Job::from_submission(
            id,
            &self.name,
            submission,
            resolved.map_or(0, |(_, r)| r.id),
            now,
        );
        job.progress_message = truncate_message(&job.progress_message, config.max_message_size);

        let written = async {
            let mut tx = self.store.begin().await?;
            if let Some((token, r)) = resolved.filter(|(_, r)| r.is_new) {
                tx.put(&self.tables.affinity, u64::from(r.id), token.as_bytes())
                    .await?;
            }
            write_job(tx.as_mut(), &self.tables.jobs, &job).await?;
            tx.commit().await
        }
        .await;
        if let Err(e) = written {
            if let Some((_, r)) = resolved.filter(|(_, r)| r.is_new) {
                self.affinity.forget_token(r.id);
            }
            return Err(e);
        }

        self.status.set_status(id, JobStatus::Pending);
        self.expiry.lock().insert(id, job.expiry_window());
        self.affinity.add_job(job.affinity_id, id);
        Ok(id)
    }

    /// Add several jobs under one transaction. The returned ids are
    /// contiguous.
    pub async fn submit_batch(
        &self,
        submitter_host: &str,
        submissions: Vec<JobSubmission>,
    ) -> Result<Vec<JobId>> {
        self.check_submitter(submitter_host)?;
        if submissions.is_empty() {
            return Err(NsError::InvalidInput("empty batch".to_string()));
        }
        let config = self.config();
        for submission in &submissions {
            check_submission(submission, &config)?;
        }

        let batch = submissions.as_slice();
        let config = &config;
        let ids = with_retry(&self.engine.retry, "submit-batch", move || {
            self.submit_batch_once(batch, config)
        })
        .await?;

        tracing::debug!(
            queue = %self.name,
            first = %ids[0],
            count = ids.len(),
            "Job batch submitted"
        );
        self.publish(|| format!("batch first={} count={}", ids[0], ids.len()));
        self.notifications.wake_waiters();
        Ok(ids)
    }

    async fn submit_batch_once(
        &self,
        batch: &[JobSubmission],
        config: &QueueConfig,
    ) -> Result<Vec<JobId>> {
        let now = self.now();
        let _lock = self.record_lock.lock().await;

        let mut new_tokens: Vec<(u32, &str)> = Vec::new();
        let affinity_ids: Vec<u32> = batch
            .iter()
            .map(|submission| match submission.affinity.as_deref() {
                Some(token) if !token.is_empty() => {
                    let r = self.affinity.resolve(token);
                    if r.is_new {
                        new_tokens.push((r.id, token));
                    }
                    r.id
                }
                _ => 0,
            })
            .collect();

        let count = batch.len() as u64;
        let first = self
            .last_id
            .fetch_add(count, std::sync::atomic::Ordering::SeqCst)
            + 1;
        let ids: Vec<JobId> = (first..first + count).map(JobId).collect();

        let mut windows = Vec::with_capacity(batch.len());
        let written = async {
            let mut tx = self.store.begin().await?;
            for (aff, token) in &new_tokens {
                tx.put(&self.tables.affinity, u64::from(*aff), token.as_bytes())
                    .await?;
            }
            for ((submission, aff), id) in batch.iter().zip(&affinity_ids).zip(&ids) {
                let mut job = Job::from_submission(*id, &self.name, submission, *aff, now);
                job.progress_message =
                    truncate_message(&job.progress_message, config.max_message_size);
                write_job(tx.as_mut(), &self.tables.jobs, &job).await?;
                windows.push((*id, job.expiry_window()));
            }
            tx.commit().await
        }
        .await;
        if let Err(e) = written {
            for (aff, _) in &new_tokens {
                self.affinity.forget_token(*aff);
            }
            return Err(e);
        }

        let last = JobId(first + count - 1);
        self.status.add_pending_range(JobId(first), last);
        self.expiry.lock().extend(windows);
        match affinity_ids.first() {
            Some(&aff) if aff != 0 && affinity_ids.iter().all(|a| *a == aff) => {
                self.affinity.add_job_range(aff, JobId(first), last);
            }
            _ => {
                for (aff, id) in affinity_ids.iter().zip(&ids) {
                    self.affinity.add_job(*aff, *id);
                }
            }
        }
        Ok(ids)
    }

    // ========== Dispatch ==========

    /// Hand the best eligible job to `worker`, or `None` when there is none.
    ///
    /// `affinity` lists tokens the worker prefers; unknown tokens are ignored.
    pub async fn get_job(
        &self,
        worker: &WorkerNode,
        affinity: &[String],
    ) -> Result<Option<DispatchedJob>> {
        self.check_worker(&worker.host)?;
        self.note_worker(worker, affinity);
        with_retry(&self.engine.retry, "get", move || self.dispatch_once(worker)).await
    }

    /// Like [`get_job`](Self::get_job), but waits up to `timeout` for work
    /// to appear. The worker is registered as a listener on `listener_port`
    /// meanwhile (0 = no datagrams).
    pub async fn wait_get(
        &self,
        worker: &WorkerNode,
        affinity: &[String],
        listener_port: u16,
        timeout: Duration,
    ) -> Result<Option<DispatchedJob>> {
        let notified = self.notifications.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(job) = self.get_job(worker, affinity).await? {
            return Ok(Some(job));
        }
        if listener_port != 0 {
            self.register_listener(&worker.host, listener_port, timeout.as_secs().max(1), "");
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::timeout_at(deadline, notified.as_mut())
                .await
                .is_err()
            {
                return Ok(None);
            }
            notified.set(self.notifications.notified());
            notified.as_mut().enable();
            if let Some(job) = self.get_job(worker, affinity).await? {
                return Ok(Some(job));
            }
        }
    }

    /// Complete `done_id` and fetch the next job in one round trip.
    pub async fn job_exchange(
        &self,
        worker: &WorkerNode,
        done_id: JobId,
        return_code: i32,
        output: &str,
        affinity: &[String],
    ) -> Result<(Outcome, Option<DispatchedJob>)> {
        self.check_worker(&worker.host)?;
        self.check_output(output)?;
        self.note_worker(worker, affinity);

        let completion = Completion::Done {
            return_code,
            output,
        };
        let (outcome, effects, step) = with_retry(&self.engine.retry, "exchange", move || {
            self.exchange_once(worker, done_id, completion)
        })
        .await?;
        if let Some(effects) = &effects {
            self.send_completion(effects).await;
        }

        let next = match step {
            Step::Granted(job) => Some(job),
            Step::Denied => None,
            Step::Skipped => {
                with_retry(&self.engine.retry, "get", move || self.dispatch_once(worker)).await?
            }
        };
        Ok((outcome, next))
    }

    fn note_worker(&self, worker: &WorkerNode, affinity: &[String]) {
        let now = self.now();
        self.affinity.touch_worker(worker, now);
        for token in affinity {
            if let Some(id) = self.affinity.lookup(token) {
                self.affinity.associate_worker(worker, id, now);
            }
        }
    }

    /// Reserve the next candidate for `worker`.
    ///
    /// Order: the worker's cached affinity candidates (refilled once when
    /// exhausted), jobs of affinities nobody claims, jobs outside other
    /// workers' affinities, then anything dispatchable.
    fn pick_candidate(&self, worker: &WorkerNode) -> Option<Reservation<'_>> {
        let cached = self.affinity.cached_candidates(worker);
        if !cached.is_empty() {
            if let Some(r) = self.status.reserve_first_of(&cached) {
                return Some(r);
            }
        }
        let refilled = self.affinity.refill_candidates(worker);
        if !refilled.is_empty() {
            if let Some(r) = self.status.reserve_first_of(&refilled) {
                return Some(r);
            }
        }

        let unclaimed = self.affinity.unclaimed_jobs();
        if !unclaimed.is_empty() {
            if let Some(r) = self.status.reserve_first_of(&unclaimed) {
                return Some(r);
            }
        }
        let claimed_by_others = self.affinity.jobs_claimed_by_others(worker);
        if let Some(r) = self.status.reserve_first_excluding(&claimed_by_others) {
            return Some(r);
        }
        self.status.reserve_next()
    }

    async fn dispatch_once(&self, worker: &WorkerNode) -> Result<Option<DispatchedJob>> {
        let config = self.config();
        for _ in 0..self.engine.max_dispatch_attempts {
            let Some(reservation) = self.pick_candidate(worker) else {
                return Ok(None);
            };
            let now = self.now();
            let _lock = self.record_lock.lock().await;
            if !reservation.is_held() {
                continue;
            }

            let mut tx = self.store.begin().await?;
            let stage = self
                .stage_dispatch(tx.as_mut(), reservation.id(), worker, &config, now)
                .await?;
            tx.commit().await?;

            match self.finish_dispatch(reservation, stage, worker, &config, now) {
                Step::Granted(job) => return Ok(Some(job)),
                Step::Denied => return Ok(None),
                Step::Skipped => continue,
            }
        }
        Ok(None)
    }

    async fn stage_dispatch(
        &self,
        tx: &mut dyn StoreTransaction,
        id: JobId,
        worker: &WorkerNode,
        config: &QueueConfig,
        now: i64,
    ) -> Result<DispatchStage> {
        let Some(mut job) = read_job(tx, &self.tables.jobs, id).await? else {
            return Ok(DispatchStage::Vanished(JobStatus::NotFound));
        };
        if !job.status.is_dispatchable() {
            return Ok(DispatchStage::Vanished(job.status));
        }

        if job.is_expired(now, config.timeout) {
            job.status = JobStatus::Failed;
            job.error_message = EXPIRED_MESSAGE.to_string();
            job.done_time = now;
            write_job(tx, &self.tables.jobs, &job).await?;
            return Ok(DispatchStage::Fail(Box::new(job)));
        }

        if let Some(lb) = self.load_balancer() {
            let avg_run_time = self.stats.lock().avg_run_time();
            let first_eval = job.lb_first_eval;
            let admission = lb.admit(&worker.host, now, &mut job.lb_first_eval, avg_run_time);
            if !admission.granted {
                if job.lb_first_eval != first_eval {
                    write_job(tx, &self.tables.jobs, &job).await?;
                }
                return Ok(DispatchStage::Deny {
                    decision: admission.decision,
                    stall: admission.stall,
                });
            }
            job.lb_first_eval = 0;
        }

        if !job.record_dispatch(worker, config.max_run_attempts) {
            job.status = JobStatus::Failed;
            job.error_message = TOO_MANY_RUNS_MESSAGE.to_string();
            job.done_time = now;
            write_job(tx, &self.tables.jobs, &job).await?;
            return Ok(DispatchStage::Fail(Box::new(job)));
        }

        job.status = JobStatus::Running;
        job.run_time = now;
        job.run_timeout = 0;
        write_job(tx, &self.tables.jobs, &job).await?;
        Ok(DispatchStage::Run(Box::new(job)))
    }

    fn finish_dispatch(
        &self,
        reservation: Reservation<'_>,
        stage: DispatchStage,
        worker: &WorkerNode,
        config: &QueueConfig,
        now: i64,
    ) -> Step {
        match stage {
            DispatchStage::Run(job) => {
                if !reservation.commit(JobStatus::Running) {
                    tracing::warn!(queue = %self.name, job_id = %job.id, "Reservation lost during dispatch");
                    self.status.set_status(job.id, JobStatus::Running);
                }
                self.affinity.consume_candidate(worker, job.id);
                if job.affinity_id != 0 {
                    self.affinity.associate_worker(worker, job.affinity_id, now);
                }
                if let Some(deadline) = job.run_deadline(config.effective_run_timeout()) {
                    self.timeline.lock().add_at(job.id, deadline);
                }

                tracing::debug!(
                    queue = %self.name,
                    job_id = %job.id,
                    worker = %worker,
                    run = job.run_counter,
                    "Job dispatched"
                );
                self.publish(|| format!("get job={} worker={}", job.id, worker));
                let affinity = match job.affinity_id {
                    0 => None,
                    aff => self.affinity.token(aff),
                };
                Step::Granted(DispatchedJob {
                    id: job.id,
                    input: job.input,
                    affinity,
                })
            }
            DispatchStage::Fail(job) => {
                reservation.commit(JobStatus::Failed);
                self.affinity.remove_job(job.affinity_id, job.id);
                tracing::info!(
                    queue = %self.name,
                    job_id = %job.id,
                    reason = %job.error_message,
                    "Job failed at dispatch"
                );
                self.publish(|| format!("fail job={} reason={}", job.id, job.error_message));
                Step::Skipped
            }
            DispatchStage::Deny { decision, stall } => {
                tracing::debug!(
                    queue = %self.name,
                    job_id = %reservation.id(),
                    worker = %worker,
                    decision = ?decision,
                    stall = stall,
                    "Dispatch denied by load balancer"
                );
                reservation.rollback();
                Step::Denied
            }
            DispatchStage::Vanished(status) => {
                tracing::debug!(
                    queue = %self.name,
                    job_id = %reservation.id(),
                    status = %status,
                    "Candidate no longer dispatchable"
                );
                reservation.commit(status);
                Step::Skipped
            }
        }
    }

    async fn exchange_once(
        &self,
        worker: &WorkerNode,
        done_id: JobId,
        completion: Completion<'_>,
    ) -> Result<(Outcome, Option<CompletionEffects>, Step)> {
        let config = self.config();
        let candidate = self.pick_candidate(worker);
        let now = self.now();
        let _lock = self.record_lock.lock().await;

        let guard = match self.claim(done_id, completion.status())? {
            Claim::Granted(guard) => guard,
            Claim::Rejected(outcome) => return Ok((outcome, None, Step::Skipped)),
        };
        let mut tx = self.store.begin().await?;
        let effects = match self
            .stage_completion(tx.as_mut(), done_id, completion, &config, now)
            .await?
        {
            Staged::Ready(effects) => effects,
            Staged::Missing => {
                return self
                    .settle_rejected(guard, done_id, None)
                    .map(|o| (o, None, Step::Skipped))
            }
            Staged::Settled(current) => {
                return self
                    .settle_rejected(guard, done_id, Some(current))
                    .map(|o| (o, None, Step::Skipped))
            }
        };

        let candidate = candidate.filter(|r| r.is_held());
        let stage = match &candidate {
            Some(r) => Some(
                self.stage_dispatch(tx.as_mut(), r.id(), worker, &config, now)
                    .await?,
            ),
            None => None,
        };
        tx.commit().await?;

        self.apply_completion(guard, &effects, now);
        let step = match (candidate, stage) {
            (Some(r), Some(stage)) => self.finish_dispatch(r, stage, worker, &config, now),
            _ => Step::Skipped,
        };
        Ok((Outcome::Applied, Some(effects), step))
    }

    // ========== Completion ==========

    /// Mark a job Done with its result.
    pub async fn put(
        &self,
        worker_host: &str,
        id: JobId,
        return_code: i32,
        output: &str,
    ) -> Result<Outcome> {
        self.check_worker(worker_host)?;
        self.check_output(output)?;
        self.complete(
            id,
            Completion::Done {
                return_code,
                output,
            },
        )
        .await
    }

    /// Mark a job Failed.
    pub async fn put_failure(
        &self,
        worker_host: &str,
        id: JobId,
        error: &str,
        output: &str,
        return_code: i32,
    ) -> Result<Outcome> {
        self.check_worker(worker_host)?;
        self.check_output(output)?;
        self.complete(
            id,
            Completion::Failed {
                return_code,
                output,
                error,
            },
        )
        .await
    }

    /// Cancel a job. Canceling a finished job is a no-op.
    pub async fn cancel(&self, submitter_host: &str, id: JobId) -> Result<Outcome> {
        self.check_submitter(submitter_host)?;
        self.complete(id, Completion::Canceled).await
    }

    /// Cancel every job currently in `status`. Returns how many were
    /// canceled.
    pub async fn cancel_all_with_status(
        &self,
        submitter_host: &str,
        status: JobStatus,
    ) -> Result<usize> {
        self.check_submitter(submitter_host)?;
        if status.is_terminal() || status == JobStatus::NotFound {
            return Ok(0);
        }
        let ids: Vec<JobId> = self.status.snapshot(status).iter().map(JobId).collect();
        let mut canceled = 0;
        for id in ids {
            match self.complete(id, Completion::Canceled).await {
                Ok(Outcome::Applied) => canceled += 1,
                Ok(Outcome::NoOp { .. }) | Err(NsError::JobNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        tracing::info!(queue = %self.name, status = %status, canceled = canceled, "Bulk cancel");
        Ok(canceled)
    }

    async fn complete(&self, id: JobId, completion: Completion<'_>) -> Result<Outcome> {
        let (outcome, effects) = with_retry(&self.engine.retry, completion.operation(), move || {
            self.complete_once(id, completion)
        })
        .await?;
        if let Some(effects) = &effects {
            self.send_completion(effects).await;
        }
        Ok(outcome)
    }

    async fn complete_once(
        &self,
        id: JobId,
        completion: Completion<'_>,
    ) -> Result<(Outcome, Option<CompletionEffects>)> {
        let config = self.config();
        let now = self.now();
        let _lock = self.record_lock.lock().await;

        let guard = match self.claim(id, completion.status())? {
            Claim::Granted(guard) => guard,
            Claim::Rejected(outcome) => return Ok((outcome, None)),
        };
        let mut tx = self.store.begin().await?;
        let effects = match self
            .stage_completion(tx.as_mut(), id, completion, &config, now)
            .await?
        {
            Staged::Ready(effects) => effects,
            Staged::Missing => return self.settle_rejected(guard, id, None).map(|o| (o, None)),
            Staged::Settled(current) => {
                return self
                    .settle_rejected(guard, id, Some(current))
                    .map(|o| (o, None))
            }
        };
        tx.commit().await?;

        self.apply_completion(guard, &effects, now);
        Ok((Outcome::Applied, Some(effects)))
    }

    fn claim(&self, id: JobId, to: JobStatus) -> Result<Claim<'_>> {
        match self.status.begin_transition(id, to) {
            Ok(guard) => Ok(Claim::Granted(guard)),
            Err(StatusChange::Invalid {
                current: JobStatus::NotFound,
            }) => Err(NsError::JobNotFound(id)),
            Err(change) => {
                tracing::debug!(
                    queue = %self.name,
                    job_id = %id,
                    current = %change.previous(),
                    requested = %to,
                    "Transition not applied"
                );
                Ok(Claim::Rejected(Outcome::NoOp {
                    current: change.previous(),
                }))
            }
        }
    }

    async fn stage_completion(
        &self,
        tx: &mut dyn StoreTransaction,
        id: JobId,
        completion: Completion<'_>,
        config: &QueueConfig,
        now: i64,
    ) -> Result<Staged> {
        let Some(mut job) = read_job(tx, &self.tables.jobs, id).await? else {
            return Ok(Staged::Missing);
        };
        if job.status.is_terminal() {
            return Ok(Staged::Settled(job.status));
        }

        let notify = match completion {
            Completion::Canceled => None,
            _ => job.completion_target(now).cloned(),
        };
        completion.apply(&mut job, now, config.max_message_size);
        let deleted = job.status == JobStatus::Done && config.delete_done;
        if deleted {
            tx.delete(&self.tables.jobs, id.get()).await?;
        } else {
            write_job(tx, &self.tables.jobs, &job).await?;
        }

        Ok(Staged::Ready(CompletionEffects {
            id,
            status: job.status,
            affinity_id: job.affinity_id,
            run_time: job.run_time,
            submit_time: job.submit_time,
            deleted,
            notify,
        }))
    }

    /// The tracker and the record disagreed; the record wins.
    fn settle_rejected(
        &self,
        guard: TransitionGuard<'_>,
        id: JobId,
        record: Option<JobStatus>,
    ) -> Result<Outcome> {
        guard.commit();
        self.timeline.lock().remove(id);
        match record {
            None => {
                tracing::warn!(queue = %self.name, job_id = %id, "Tracked job has no record");
                self.status.set_status(id, JobStatus::NotFound);
                Err(NsError::JobNotFound(id))
            }
            Some(current) => {
                tracing::warn!(
                    queue = %self.name,
                    job_id = %id,
                    status = %current,
                    "Status index disagreed with job record"
                );
                self.status.set_status(id, current);
                Ok(Outcome::NoOp { current })
            }
        }
    }

    fn apply_completion(&self, guard: TransitionGuard<'_>, effects: &CompletionEffects, now: i64) {
        guard.commit();
        if effects.deleted {
            self.status.set_status(effects.id, JobStatus::NotFound);
        }
        self.affinity.remove_job(effects.affinity_id, effects.id);
        self.timeline.lock().remove(effects.id);
        if effects.status == JobStatus::Done && effects.run_time > 0 {
            self.stats
                .lock()
                .record(now - effects.run_time, now - effects.submit_time);
        }

        tracing::debug!(
            queue = %self.name,
            job_id = %effects.id,
            status = %effects.status,
            deleted = effects.deleted,
            "Job completed"
        );
        self.publish(|| format!("{} job={}", effects.status.as_str().to_lowercase(), effects.id));
    }

    async fn send_completion(&self, effects: &CompletionEffects) {
        if let Some(target) = &effects.notify {
            self.notifications.notify_submitter(target, effects.id).await;
        }
    }

    // ========== Rescheduling ==========

    /// Give a running job back. The attempt does not count against the run
    /// budget.
    pub async fn return_job(&self, worker_host: &str, id: JobId) -> Result<Outcome> {
        self.check_worker(worker_host)?;
        let outcome =
            with_retry(&self.engine.retry, "return", move || self.return_once(id)).await?;
        if outcome.is_applied() {
            self.notifications.wake_waiters();
        }
        Ok(outcome)
    }

    async fn return_once(&self, id: JobId) -> Result<Outcome> {
        let _lock = self.record_lock.lock().await;
        match self.status.status(id) {
            JobStatus::NotFound => return Err(NsError::JobNotFound(id)),
            JobStatus::Running => {}
            current => return Ok(Outcome::NoOp { current }),
        }

        let mut tx = self.store.begin().await?;
        let mut job = match self.read_tracked(tx.as_mut(), id, JobStatus::Running).await? {
            Ok(job) => job,
            Err(outcome) => return Ok(outcome),
        };
        job.status = JobStatus::Pending;
        job.run_counter = job.run_counter.saturating_sub(1);
        write_job(tx.as_mut(), &self.tables.jobs, &job).await?;
        tx.commit().await?;

        self.status.set_status(id, JobStatus::Pending);
        self.timeline.lock().remove(id);
        tracing::debug!(queue = %self.name, job_id = %id, "Job returned");
        self.publish(|| format!("return job={}", id));
        Ok(Outcome::Applied)
    }

    /// Put any job back to Pending, whatever its state.
    pub async fn force_reschedule(&self, id: JobId) -> Result<Outcome> {
        let outcome =
            with_retry(&self.engine.retry, "reschedule", move || self.reschedule_once(id)).await?;
        if outcome.is_applied() {
            self.notifications.wake_waiters();
        }
        Ok(outcome)
    }

    async fn reschedule_once(&self, id: JobId) -> Result<Outcome> {
        let _lock = self.record_lock.lock().await;
        if self.status.status(id) == JobStatus::NotFound {
            return Err(NsError::JobNotFound(id));
        }

        let mut tx = self.store.begin().await?;
        let Some(mut job) = read_job(tx.as_mut(), &self.tables.jobs, id).await? else {
            self.status.set_status(id, JobStatus::NotFound);
            return Err(NsError::JobNotFound(id));
        };
        if job.status == JobStatus::Pending {
            self.status.set_status(id, JobStatus::Pending);
            return Ok(Outcome::NoOp {
                current: JobStatus::Pending,
            });
        }
        let was_terminal = job.status.is_terminal();
        job.status = JobStatus::Pending;
        job.run_counter = job.run_counter.saturating_sub(1);
        job.done_time = 0;
        write_job(tx.as_mut(), &self.tables.jobs, &job).await?;
        tx.commit().await?;

        self.status.set_status(id, JobStatus::Pending);
        self.expiry.lock().insert(id, job.expiry_window());
        self.timeline.lock().remove(id);
        if was_terminal {
            self.affinity.add_job(job.affinity_id, id);
        }
        tracing::info!(queue = %self.name, job_id = %id, "Job rescheduled");
        self.publish(|| format!("reschedule job={}", id));
        Ok(Outcome::Applied)
    }

    /// Override the run timeout of a running job (0 = queue default).
    pub async fn set_job_run_timeout(&self, id: JobId, secs: u64) -> Result<Outcome> {
        if secs > MAX_TIMEOUT {
            return Err(NsError::InvalidInput(format!(
                "run timeout of {} seconds exceeds the {} second limit",
                secs, MAX_TIMEOUT
            )));
        }
        with_retry(&self.engine.retry, "run-timeout", move || {
            self.run_timeout_once(id, secs)
        })
        .await
    }

    async fn run_timeout_once(&self, id: JobId, secs: u64) -> Result<Outcome> {
        let default_run_timeout = self.config.read().effective_run_timeout();
        let _lock = self.record_lock.lock().await;
        match self.status.status(id) {
            JobStatus::NotFound => return Err(NsError::JobNotFound(id)),
            JobStatus::Running => {}
            current => return Ok(Outcome::NoOp { current }),
        }

        let mut tx = self.store.begin().await?;
        let mut job = match self.read_tracked(tx.as_mut(), id, JobStatus::Running).await? {
            Ok(job) => job,
            Err(outcome) => return Ok(outcome),
        };
        job.run_timeout = secs;
        write_job(tx.as_mut(), &self.tables.jobs, &job).await?;
        tx.commit().await?;

        let mut timeline = self.timeline.lock();
        match job.run_deadline(default_run_timeout) {
            Some(deadline) => timeline.move_to(id, deadline),
            None => {
                timeline.remove(id);
            }
        }
        Ok(Outcome::Applied)
    }

    /// Read a record expected to be in `expected`, resyncing the tracker
    /// when it is not.
    async fn read_tracked(
        &self,
        tx: &mut dyn StoreTransaction,
        id: JobId,
        expected: JobStatus,
    ) -> Result<std::result::Result<Job, Outcome>> {
        match read_job(tx, &self.tables.jobs, id).await? {
            None => {
                self.status.set_status(id, JobStatus::NotFound);
                self.timeline.lock().remove(id);
                Err(NsError::JobNotFound(id))
            }
            Some(job) if job.status != expected => {
                self.status.set_status(id, job.status);
                Ok(Err(Outcome::NoOp {
                    current: job.status,
                }))
            }
            Some(job) => Ok(Ok(job)),
        }
    }

    // ========== Removal ==========

    /// Delete a job record right away, whatever its state.
    pub async fn drop_job(&self, submitter_host: &str, id: JobId) -> Result<()> {
        self.check_submitter(submitter_host)?;
        with_retry(&self.engine.retry, "drop", move || self.drop_once(id)).await?;
        tracing::debug!(queue = %self.name, job_id = %id, "Job dropped");
        self.publish(|| format!("drop job={}", id));
        Ok(())
    }

    async fn drop_once(&self, id: JobId) -> Result<()> {
        let _lock = self.record_lock.lock().await;
        if self.status.status(id) == JobStatus::NotFound {
            return Err(NsError::JobNotFound(id));
        }
        let mut tx = self.store.begin().await?;
        let affinity_id = read_job(tx.as_mut(), &self.tables.jobs, id)
            .await?
            .map_or(0, |job| job.affinity_id);
        tx.delete(&self.tables.jobs, id.get()).await?;
        tx.commit().await?;
        self.forget_job(id, affinity_id);
        Ok(())
    }

    /// Remove a deleted job from every in-memory index.
    pub(crate) fn forget_job(&self, id: JobId, affinity_id: u32) {
        self.status.set_status(id, JobStatus::NotFound);
        self.affinity.remove_job(affinity_id, id);
        self.timeline.lock().remove(id);
        self.expiry.lock().remove(&id);
    }

    /// Delete every job of the queue. Affinity ids stay allocated.
    pub async fn truncate(&self) -> Result<u64> {
        let _lock = self.record_lock.lock().await;
        let removed = self.store.clear_table(&self.tables.jobs).await?;
        self.status.clear();
        self.affinity.clear_jobs();
        self.timeline.lock().clear();
        self.expiry.lock().clear();
        tracing::info!(queue = %self.name, removed = removed, "Queue truncated");
        self.publish(|| format!("truncate removed={}", removed));
        Ok(removed)
    }

    // ========== Queries ==========

    /// Tracked status without touching the store.
    pub fn status(&self, id: JobId) -> JobStatus {
        self.status.status(id)
    }

    /// Status of a job. Dispatchable jobs past their expiration window are
    /// failed on the spot. The store is read only once the window closed.
    pub async fn get_status(&self, id: JobId) -> Result<JobStatus> {
        let status = self.status.status(id);
        if !status.is_dispatchable() {
            return Ok(status);
        }
        let timeout = self.config.read().timeout;
        let window = self.expiry.lock().get(&id).copied();
        if window.is_some_and(|w| !w.is_expired(self.now(), timeout)) {
            return Ok(status);
        }
        let Some(job) = fetch_job(&self.store, &self.tables.jobs, id).await? else {
            return Ok(self.status.status(id));
        };
        if job.status.is_dispatchable() && job.is_expired(self.now(), timeout) {
            with_retry(&self.engine.retry, "expire", move || self.expire_once(id)).await?;
            return Ok(self.status.status(id));
        }
        Ok(status)
    }

    async fn expire_once(&self, id: JobId) -> Result<()> {
        let config = self.config();
        let now = self.now();
        let _lock = self.record_lock.lock().await;
        let Ok(guard) = self.status.begin_transition(id, JobStatus::Failed) else {
            return Ok(());
        };
        let mut tx = self.store.begin().await?;
        let Some(mut job) = read_job(tx.as_mut(), &self.tables.jobs, id).await? else {
            return self.settle_rejected(guard, id, None).map(|_| ());
        };
        if !job.status.is_dispatchable() {
            return self.settle_rejected(guard, id, Some(job.status)).map(|_| ());
        }
        if !job.is_expired(now, config.timeout) {
            return Ok(());
        }

        job.status = JobStatus::Failed;
        job.error_message = EXPIRED_MESSAGE.to_string();
        job.done_time = now;
        write_job(tx.as_mut(), &self.tables.jobs, &job).await?;
        tx.commit().await?;
        guard.commit();
        self.affinity.remove_job(job.affinity_id, id);
        self.expiry.lock().remove(&id);
        tracing::info!(queue = %self.name, job_id = %id, "Job expired before scheduling");
        self.publish(|| format!("expire job={}", id));
        Ok(())
    }

    /// Job record as seen by callers.
    ///
    /// With `expected`, a record in another state is re-read a few times
    /// before the job is reported missing.
    pub async fn job_description(
        &self,
        id: JobId,
        expected: Option<JobStatus>,
    ) -> Result<JobDescription> {
        let attempts = self.engine.describe_attempts.max(1);
        for attempt in 1..=attempts {
            match fetch_job(&self.store, &self.tables.jobs, id).await? {
                Some(job) if expected.map_or(true, |s| s == job.status) => {
                    return Ok(job.description())
                }
                None if expected.is_none() => return Err(NsError::JobNotFound(id)),
                _ => {}
            }
            if attempt < attempts {
                tokio::time::sleep(self.engine.describe_retry_delay).await;
            }
        }
        Err(NsError::JobNotFound(id))
    }

    pub async fn put_progress_message(&self, id: JobId, message: &str) -> Result<()> {
        let max = self.config.read().max_message_size;
        let message = truncate_message(message, max);
        let message = message.as_str();
        with_retry(&self.engine.retry, "progress", move || {
            self.progress_once(id, message)
        })
        .await
    }

    async fn progress_once(&self, id: JobId, message: &str) -> Result<()> {
        let _lock = self.record_lock.lock().await;
        let mut tx = self.store.begin().await?;
        let Some(mut job) = read_job(tx.as_mut(), &self.tables.jobs, id).await? else {
            return Err(NsError::JobNotFound(id));
        };
        job.progress_message = message.to_string();
        write_job(tx.as_mut(), &self.tables.jobs, &job).await?;
        tx.commit().await
    }

    pub async fn get_progress_message(&self, id: JobId) -> Result<String> {
        fetch_job(&self.store, &self.tables.jobs, id)
            .await?
            .map(|job| job.progress_message)
            .ok_or(NsError::JobNotFound(id))
    }

    pub fn count_by_status(&self, status: JobStatus) -> usize {
        self.status.count(status)
    }

    /// Ids currently in `status`, ascending.
    pub fn jobs_with_status(&self, status: JobStatus) -> Vec<JobId> {
        self.status.snapshot(status).iter().map(JobId).collect()
    }

    /// Descriptions of every job, or of the jobs in `status`.
    pub async fn dump(&self, status: Option<JobStatus>) -> Result<Vec<JobDescription>> {
        let mut out = Vec::new();
        let mut from = 0;
        loop {
            let batch = scan_jobs(&self.store, &self.tables.jobs, from, DUMP_BATCH).await?;
            let Some(last) = batch.last() else {
                break;
            };
            from = last.id.get() + 1;
            out.extend(
                batch
                    .iter()
                    .filter(|job| status.map_or(true, |s| s == job.status))
                    .map(Job::description),
            );
        }
        Ok(out)
    }

    // ========== Listeners ==========

    /// Register a wake-up endpoint for `ttl` seconds. A zero ttl registers
    /// nothing.
    pub fn register_listener(&self, host: &str, port: u16, ttl: u64, auth: &str) -> bool {
        self.notifications.register(host, port, ttl, auth, self.now())
    }

    pub fn unregister_listener(&self, host: &str, port: u16) -> bool {
        self.notifications.unregister(host, port)
    }

    /// Send a notification burst if work is pending. Returns the number of
    /// datagrams sent.
    pub async fn notify_listeners(&self) -> usize {
        let interval = self.config.read().notify_interval;
        self.notifications
            .notify_if_pending(self.now(), interval, || self.status.has_dispatchable())
            .await
    }

    pub(crate) fn check_output(&self, output: &str) -> Result<()> {
        let max = self.config.read().max_output_size;
        if output.len() > max {
            return Err(NsError::InvalidInput(format!(
                "output of {} bytes exceeds the {} byte limit",
                output.len(),
                max
            )));
        }
        Ok(())
    }
}

fn check_submission(submission: &JobSubmission, config: &QueueConfig) -> Result<()> {
    if submission.input.len() > config.max_input_size {
        return Err(NsError::InvalidInput(format!(
            "input of {} bytes exceeds the {} byte limit",
            submission.input.len(),
            config.max_input_size
        )));
    }
    let notify_timeout = submission.notify.as_ref().map_or(0, |n| n.timeout);
    if submission.timeout > MAX_TIMEOUT || notify_timeout > MAX_TIMEOUT {
        return Err(NsError::InvalidInput(format!(
            "timeouts are limited to {} seconds",
            MAX_TIMEOUT
        )));
    }
    Ok(())
}
