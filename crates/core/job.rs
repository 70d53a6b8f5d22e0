//! Job record and related types.

use serde::{Deserialize, Serialize};

/// Queue-scoped job identifier. Allocated from a monotonically increasing
/// counter; `0` is never a valid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Waiting to be dispatched.
    Pending,
    /// Held by exactly one worker.
    Running,
    /// Given back by a worker or its run timed out; eligible for dispatch.
    Returned,
    /// Canceled by the submitter.
    Canceled,
    /// Failed permanently.
    Failed,
    /// Completed with a result.
    Done,
    /// No record (never submitted or purged).
    NotFound,
}

impl JobStatus {
    /// Every status that has a backing record.
    pub const TRACKED: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Returned,
        JobStatus::Canceled,
        JobStatus::Failed,
        JobStatus::Done,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Canceled | JobStatus::Failed | JobStatus::Done)
    }

    /// Whether a worker may be given the job.
    pub fn is_dispatchable(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Returned)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "Pending",
            JobStatus::Running => "Running",
            JobStatus::Returned => "Returned",
            JobStatus::Canceled => "Canceled",
            JobStatus::Failed => "Failed",
            JobStatus::Done => "Done",
            JobStatus::NotFound => "NotFound",
        }
    }

    pub(crate) fn index(self) -> Option<usize> {
        Self::TRACKED.iter().position(|s| *s == self)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s.to_ascii_lowercase().as_str() {
            "pending" => JobStatus::Pending,
            "running" => JobStatus::Running,
            "returned" => JobStatus::Returned,
            "canceled" | "cancelled" => JobStatus::Canceled,
            "failed" => JobStatus::Failed,
            "done" => JobStatus::Done,
            "notfound" | "not_found" => JobStatus::NotFound,
            other => return Err(format!("unknown job status '{}'", other)),
        };
        Ok(status)
    }
}

/// Identity of a worker process: its host and its notification port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerNode {
    pub host: String,
    pub port: u16,
}

impl WorkerNode {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for WorkerNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Where to send a completion datagram for a job, and for how long after
/// submission the submitter keeps listening.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitterNotify {
    pub host: String,
    pub port: u16,
    /// Seconds after submission during which notification is wanted.
    pub timeout: u64,
}

/// Everything a submitter provides for one job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSubmission {
    pub input: String,
    #[serde(default)]
    pub affinity: Option<String>,
    #[serde(default)]
    pub notify: Option<SubmitterNotify>,
    #[serde(default)]
    pub progress_message: String,
    /// Expiration override in seconds (0 = queue default).
    #[serde(default)]
    pub timeout: u64,
}

impl JobSubmission {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            ..Default::default()
        }
    }

    /// Tag the job with an affinity token.
    pub fn affinity(mut self, token: impl Into<String>) -> Self {
        self.affinity = Some(token.into());
        self
    }

    /// Request a completion datagram.
    pub fn notify(mut self, host: impl Into<String>, port: u16, timeout: u64) -> Self {
        self.notify = Some(SubmitterNotify {
            host: host.into(),
            port,
            timeout,
        });
        self
    }

    /// Override the queue expiration window.
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout = secs;
        self
    }

    pub fn progress_message(mut self, msg: impl Into<String>) -> Self {
        self.progress_message = msg.into();
        self
    }
}

/// Persistent job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub status: JobStatus,
    pub input: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub error_message: String,
    #[serde(default)]
    pub progress_message: String,
    #[serde(default)]
    pub return_code: i32,
    pub submit_time: i64,
    #[serde(default)]
    pub run_time: i64,
    #[serde(default)]
    pub done_time: i64,
    /// Expiration window override in seconds (0 = queue default).
    #[serde(default)]
    pub timeout: u64,
    /// Run timeout override in seconds (0 = queue default).
    #[serde(default)]
    pub run_timeout: u64,
    #[serde(default)]
    pub run_counter: u32,
    #[serde(default)]
    pub worker_history: Vec<WorkerNode>,
    /// 0 = no affinity.
    #[serde(default)]
    pub affinity_id: u32,
    #[serde(default)]
    pub submitter_notify: Option<SubmitterNotify>,
    /// First load-balancing evaluation, used to compute stall time.
    #[serde(default)]
    pub lb_first_eval: i64,
}

impl Job {
    /// Create a Pending record from a submission.
    pub fn from_submission(
        id: JobId,
        queue: &str,
        submission: &JobSubmission,
        affinity_id: u32,
        now: i64,
    ) -> Self {
        Self {
            id,
            queue: queue.to_string(),
            status: JobStatus::Pending,
            input: submission.input.clone(),
            output: String::new(),
            error_message: String::new(),
            progress_message: submission.progress_message.clone(),
            return_code: 0,
            submit_time: now,
            run_time: 0,
            done_time: 0,
            timeout: submission.timeout,
            run_timeout: 0,
            run_counter: 0,
            worker_history: Vec::new(),
            affinity_id,
            submitter_notify: submission.notify.clone(),
            lb_first_eval: 0,
        }
    }

    pub fn effective_timeout(&self, queue_default: u64) -> u64 {
        if self.timeout == 0 {
            queue_default
        } else {
            self.timeout
        }
    }

    pub fn effective_run_timeout(&self, queue_default: u64) -> u64 {
        if self.run_timeout == 0 {
            queue_default
        } else {
            self.run_timeout
        }
    }

    /// Run deadline, or `None` when the job has no run timeout.
    pub fn run_deadline(&self, queue_default: u64) -> Option<i64> {
        match self.effective_run_timeout(queue_default) {
            0 => None,
            t => Some(self.run_time.saturating_add(secs(t))),
        }
    }

    /// Whether the job outlived its expiration window before being scheduled.
    pub fn is_expired(&self, now: i64, queue_default: u64) -> bool {
        self.expiry_window().is_expired(now, queue_default)
    }

    pub(crate) fn expiry_window(&self) -> ExpiryWindow {
        ExpiryWindow {
            submit_time: self.submit_time,
            timeout: self.timeout,
        }
    }

    /// Record a dispatch to `worker`. Returns `false` when the history is
    /// already at `capacity`; the counter is left unchanged in that case.
    pub fn record_dispatch(&mut self, worker: &WorkerNode, capacity: usize) -> bool {
        if self.run_counter as usize >= capacity {
            return false;
        }
        self.run_counter += 1;
        let slot = self.run_counter as usize - 1;
        if slot < self.worker_history.len() {
            self.worker_history[slot] = worker.clone();
        } else {
            self.worker_history.push(worker.clone());
        }
        true
    }

    /// The worker currently (or most recently) holding the job.
    pub fn current_worker(&self) -> Option<&WorkerNode> {
        match self.run_counter {
            0 => None,
            n => self.worker_history.get(n as usize - 1),
        }
    }

    /// Submitter endpoint that should get a completion datagram at `now`.
    pub fn completion_target(&self, now: i64) -> Option<&SubmitterNotify> {
        self.submitter_notify.as_ref().filter(|n| {
            !n.host.is_empty()
                && n.port != 0
                && self.submit_time.saturating_add(secs(n.timeout)) >= now
        })
    }

    pub fn description(&self) -> JobDescription {
        JobDescription {
            id: self.id,
            status: self.status,
            return_code: self.return_code,
            input: self.input.clone(),
            output: self.output.clone(),
            error_message: self.error_message.clone(),
            progress_message: self.progress_message.clone(),
            run_counter: self.run_counter,
        }
    }

    /// Serialize the job to JSON bytes for the store.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize a job from stored JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Read-only view of a job returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescription {
    pub id: JobId,
    pub status: JobStatus,
    pub return_code: i32,
    pub input: String,
    pub output: String,
    pub error_message: String,
    pub progress_message: String,
    pub run_counter: u32,
}

/// A job handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchedJob {
    pub id: JobId,
    pub input: String,
    pub affinity: Option<String>,
}

/// Cut `msg` to at most `max` bytes on a char boundary.
pub(crate) fn truncate_message(msg: &str, max: usize) -> String {
    if msg.len() <= max {
        return msg.to_string();
    }
    let mut end = max;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    msg[..end].to_string()
}

/// The part of a record that decides expiration, kept in memory so status
/// polls need no store read until the window closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ExpiryWindow {
    submit_time: i64,
    /// Per-job override, 0 = queue default.
    timeout: u64,
}

impl ExpiryWindow {
    pub(crate) fn is_expired(&self, now: i64, queue_default: u64) -> bool {
        let timeout = if self.timeout == 0 {
            queue_default
        } else {
            self.timeout
        };
        timeout != 0 && self.submit_time.saturating_add(secs(timeout)) < now
    }
}

/// Largest timeout, in seconds, accepted from submitters and workers.
pub const MAX_TIMEOUT: u64 = u32::MAX as u64;

/// A duration in seconds as a timestamp offset, clamped to `i64::MAX`.
pub(crate) fn secs(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
