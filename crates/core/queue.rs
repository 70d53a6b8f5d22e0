//! A named job queue: in-memory indexes over a persistent job table.
//!
//! A [`Queue`] owns the status tracker, affinity index, execution timeline,
//! listener list and optional load-balancing policy of one queue. Job
//! operations live in `engine.rs`; background passes in `watcher.rs` and
//! `purge.rs`.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::affinity::{AffinityIndex, WorkerAffinityInfo};
use crate::clock::{DynClock, SystemClock};
use crate::config::{EngineConfig, QueueConfig};
use crate::error::{NsError, Result};
use crate::job::{ExpiryWindow, JobId, JobStatus};
use crate::load_balance::{HostLoadSource, LoadBalanceCoordinator, StaticLoadSource};
use crate::notify::{DynNotifier, Listener, NotificationDispatcher, UdpNotifier};
use crate::status::{StatusCounts, StatusTracker};
use crate::store::{scan_jobs, PersistentStore, QueueTables, SharedStore};
use crate::timeline::ExecutionTimeline;

/// Records read per batch while mounting a queue.
const RECOVERY_BATCH: usize = 1000;

/// Result of a lifecycle call that may lose a race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// The transition took place.
    Applied,
    /// Nothing to do; the job was already in `current`.
    NoOp { current: JobStatus },
}

impl Outcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Outcome::Applied)
    }
}

/// Collaborators shared by every queue of a registry.
#[derive(Clone)]
pub struct QueueContext {
    pub engine: EngineConfig,
    pub store: SharedStore,
    pub clock: DynClock,
    pub notifier: DynNotifier,
    pub load_source: Arc<dyn HostLoadSource>,
}

impl QueueContext {
    /// Create a new builder.
    pub fn builder(store: SharedStore) -> QueueContextBuilder {
        QueueContextBuilder::new(store)
    }
}

/// Builder for QueueContext.
pub struct QueueContextBuilder {
    context: QueueContext,
}

impl QueueContextBuilder {
    /// Create a new builder with a system clock, UDP notifications and an
    /// empty load source.
    pub fn new(store: SharedStore) -> Self {
        Self {
            context: QueueContext {
                engine: EngineConfig::default(),
                store,
                clock: Arc::new(SystemClock),
                notifier: Arc::new(UdpNotifier::new()),
                load_source: Arc::new(StaticLoadSource::new()),
            },
        }
    }

    /// Set the engine configuration.
    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.context.engine = engine;
        self
    }

    /// Set the time source.
    pub fn clock(mut self, clock: DynClock) -> Self {
        self.context.clock = clock;
        self
    }

    /// Set the datagram transport.
    pub fn notifier(mut self, notifier: DynNotifier) -> Self {
        self.context.notifier = notifier;
        self
    }

    /// Set the host load source used by load-balanced queues.
    pub fn load_source(mut self, source: Arc<dyn HostLoadSource>) -> Self {
        self.context.load_source = source;
        self
    }

    /// Build the QueueContext.
    pub fn build(self) -> QueueContext {
        self.context
    }
}

/// Accumulated run statistics of completed jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunStats {
    pub run_count: u64,
    pub total_run_time: i64,
    pub total_turnaround: i64,
}

impl RunStats {
    pub fn record(&mut self, run_time: i64, turnaround: i64) {
        self.run_count += 1;
        self.total_run_time += run_time.max(0);
        self.total_turnaround += turnaround.max(0);
    }

    /// Average run time in seconds.
    pub fn avg_run_time(&self) -> f64 {
        if self.run_count == 0 {
            0.0
        } else {
            self.total_run_time as f64 / self.run_count as f64
        }
    }

    /// Average time from submission to completion in seconds.
    pub fn avg_turnaround(&self) -> f64 {
        if self.run_count == 0 {
            0.0
        } else {
            self.total_turnaround as f64 / self.run_count as f64
        }
    }
}

/// Administrative snapshot of a queue.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatistics {
    pub queue: String,
    pub host: String,
    pub counts: StatusCounts,
    pub records: usize,
    pub last_id: u64,
    pub run_count: u64,
    pub avg_run_time: f64,
    pub avg_turnaround: f64,
    pub timeline_entries: usize,
    pub listeners: Vec<Listener>,
    pub workers: Vec<WorkerAffinityInfo>,
    pub submitter_hosts: Vec<String>,
    pub worker_hosts: Vec<String>,
    pub load_balanced: bool,
}

#[derive(Debug, Default)]
pub(crate) struct PurgeState {
    /// Last issued id seen by the previous pass.
    pub(crate) last_seen_id: u64,
    pub(crate) skipped: u32,
}

/// One named job queue.
pub struct Queue {
    pub(crate) name: String,
    pub(crate) config: RwLock<QueueConfig>,
    pub(crate) engine: EngineConfig,
    pub(crate) store: SharedStore,
    pub(crate) tables: QueueTables,
    pub(crate) clock: DynClock,
    pub(crate) status: StatusTracker,
    pub(crate) affinity: AffinityIndex,
    pub(crate) timeline: Mutex<ExecutionTimeline>,
    /// Expiration windows of live jobs, pruned by the purge pass.
    pub(crate) expiry: Mutex<HashMap<JobId, ExpiryWindow>>,
    /// Serializes record mutations. Never held across a sleep.
    pub(crate) record_lock: tokio::sync::Mutex<()>,
    pub(crate) last_id: AtomicU64,
    pub(crate) load_source: Arc<dyn HostLoadSource>,
    pub(crate) load_balancer: RwLock<Option<Arc<LoadBalanceCoordinator>>>,
    pub(crate) notifications: NotificationDispatcher,
    pub(crate) stats: Mutex<RunStats>,
    pub(crate) purge_state: Mutex<PurgeState>,
    monitor: broadcast::Sender<String>,
}

impl Queue {
    /// Open a queue and rebuild its in-memory state from the store.
    pub async fn mount(config: QueueConfig, context: &QueueContext) -> Result<Arc<Queue>> {
        config.validate()?;
        let (monitor, _) = broadcast::channel(256);
        let queue = Arc::new(Queue {
            name: config.name.clone(),
            tables: QueueTables::new(&config.name),
            timeline: Mutex::new(ExecutionTimeline::new(config.effective_precision())),
            load_balancer: RwLock::new(
                config
                    .load_balance
                    .clone()
                    .map(|lb| Arc::new(LoadBalanceCoordinator::new(lb, context.load_source.clone()))),
            ),
            notifications: NotificationDispatcher::new(config.name.clone(), context.notifier.clone()),
            config: RwLock::new(config),
            engine: context.engine.clone(),
            store: context.store.clone(),
            clock: context.clock.clone(),
            status: StatusTracker::new(),
            affinity: AffinityIndex::new(),
            expiry: Mutex::new(HashMap::new()),
            record_lock: tokio::sync::Mutex::new(()),
            last_id: AtomicU64::new(0),
            load_source: context.load_source.clone(),
            stats: Mutex::new(RunStats::default()),
            purge_state: Mutex::new(PurgeState::default()),
            monitor,
        });
        queue.recover().await?;
        Ok(queue)
    }

    async fn recover(&self) -> Result<()> {
        let mut from = 0;
        loop {
            let batch = self
                .store
                .scan_from(&self.tables.affinity, from, RECOVERY_BATCH)
                .await?;
            let Some((last_key, _)) = batch.last() else {
                break;
            };
            from = last_key + 1;
            for (key, bytes) in &batch {
                let token = std::str::from_utf8(bytes).map_err(|e| {
                    NsError::Corruption(format!("affinity token {} is unreadable: {}", key, e))
                })?;
                let id = u32::try_from(*key).map_err(|_| {
                    NsError::Corruption(format!("affinity id {} out of range", key))
                })?;
                self.affinity.restore_token(id, token);
            }
        }

        let default_run_timeout = self.config.read().effective_run_timeout();
        let mut from = 0;
        let mut jobs = 0usize;
        loop {
            let batch = scan_jobs(&self.store, &self.tables.jobs, from, RECOVERY_BATCH).await?;
            let Some(last) = batch.last() else {
                break;
            };
            from = last.id.get() + 1;
            jobs += batch.len();
            for job in batch {
                self.status.set_status(job.id, job.status);
                if !job.status.is_terminal() {
                    self.expiry.lock().insert(job.id, job.expiry_window());
                    if job.affinity_id != 0 {
                        self.affinity.add_job(job.affinity_id, job.id);
                    }
                }
                if job.status == JobStatus::Running {
                    if let Some(deadline) = job.run_deadline(default_run_timeout) {
                        self.timeline.lock().add_at(job.id, deadline);
                    }
                }
                self.last_id.fetch_max(job.id.get(), Ordering::SeqCst);
            }
        }

        tracing::info!(
            queue = %self.name,
            jobs = jobs,
            last_id = self.last_id.load(Ordering::SeqCst),
            "Queue mounted"
        );
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current parameters.
    pub fn config(&self) -> QueueConfig {
        self.config.read().clone()
    }

    /// Replace the queue parameters. The new timeline precision applies to
    /// jobs dispatched from now on.
    pub fn reconfigure(&self, config: QueueConfig) -> Result<()> {
        config.validate()?;
        if config.name != self.name {
            return Err(NsError::Config(format!(
                "cannot rename queue '{}' to '{}'",
                self.name, config.name
            )));
        }
        self.timeline.lock().set_precision(config.effective_precision());
        *self.load_balancer.write() = config
            .load_balance
            .clone()
            .map(|lb| Arc::new(LoadBalanceCoordinator::new(lb, self.load_source.clone())));
        *self.config.write() = config;
        tracing::info!(queue = %self.name, "Queue reconfigured");
        Ok(())
    }

    /// Highest id issued so far.
    pub fn last_id(&self) -> JobId {
        JobId(self.last_id.load(Ordering::SeqCst))
    }

    pub(crate) fn load_balancer(&self) -> Option<Arc<LoadBalanceCoordinator>> {
        self.load_balancer.read().clone()
    }

    pub(crate) fn now(&self) -> i64 {
        self.clock.now()
    }

    // ========== Access control ==========

    /// Reject hosts missing from a non-empty submitter allow-list.
    pub fn check_submitter(&self, host: &str) -> Result<()> {
        let config = self.config.read();
        check_host(&config.submitter_hosts, host, "submitter", &self.name)
    }

    /// Reject hosts missing from a non-empty worker allow-list.
    pub fn check_worker(&self, host: &str) -> Result<()> {
        let config = self.config.read();
        check_host(&config.worker_hosts, host, "worker", &self.name)
    }

    // ========== Monitoring ==========

    /// Subscribe to human-readable event lines of this queue.
    pub fn subscribe_monitor(&self) -> broadcast::Receiver<String> {
        self.monitor.subscribe()
    }

    pub(crate) fn publish<F>(&self, event: F)
    where
        F: FnOnce() -> String,
    {
        if self.monitor.receiver_count() > 0 {
            let _ = self.monitor.send(format!("{} {}", self.now(), event()));
        }
    }

    pub fn run_stats(&self) -> RunStats {
        *self.stats.lock()
    }

    pub fn statistics(&self) -> QueueStatistics {
        let config = self.config.read().clone();
        let counts = self.status.counts();
        let stats = self.run_stats();
        QueueStatistics {
            queue: self.name.clone(),
            host: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            records: counts.total(),
            counts,
            last_id: self.last_id().get(),
            run_count: stats.run_count,
            avg_run_time: stats.avg_run_time(),
            avg_turnaround: stats.avg_turnaround(),
            timeline_entries: self.timeline.lock().len(),
            listeners: self.notifications.listeners(),
            workers: self.affinity.workers(),
            submitter_hosts: config.submitter_hosts,
            worker_hosts: config.worker_hosts,
            load_balanced: config.load_balance.is_some(),
        }
    }
}

fn check_host(allowed: &[String], host: &str, role: &str, queue: &str) -> Result<()> {
    if allowed.is_empty() || allowed.iter().any(|h| h == host) {
        Ok(())
    } else {
        Err(NsError::AccessDenied(format!(
            "host '{}' is not an allowed {} of queue '{}'",
            host, role, queue
        )))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::clock::ManualClock;
    use crate::memory::MemoryStore;
    use crate::notify::RecordingNotifier;
    use std::time::Duration;

    pub(crate) struct Harness {
        pub store: MemoryStore,
        pub clock: Arc<ManualClock>,
        pub notifier: Arc<RecordingNotifier>,
        pub loads: Arc<StaticLoadSource>,
        pub context: QueueContext,
    }

    pub(crate) fn harness() -> Harness {
        let store = MemoryStore::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let notifier = Arc::new(RecordingNotifier::new());
        let loads = Arc::new(StaticLoadSource::new());
        let engine = EngineConfig::builder()
            .retry(crate::retry::RetryPolicy::new(5, Duration::from_millis(1)))
            .purge_skipping(0, 0)
            .describe_retries(3, Duration::from_millis(5))
            .build();
        let context = QueueContext::builder(SharedStore::new(store.clone()))
            .engine(engine)
            .clock(clock.clone())
            .notifier(notifier.clone())
            .load_source(loads.clone())
            .build();
        Harness {
            store,
            clock,
            notifier,
            loads,
            context,
        }
    }

    impl Harness {
        pub(crate) async fn queue(&self, config: QueueConfig) -> Arc<Queue> {
            Queue::mount(config, &self.context).await.unwrap()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::harness;
    use super::*;
    use crate::job::{JobSubmission, WorkerNode};
    use crate::load_balance::ThresholdCurve;

    #[test]
    fn test_run_stats_averages() {
        let mut stats = RunStats::default();
        assert_eq!(stats.avg_run_time(), 0.0);
        stats.record(10, 20);
        stats.record(20, 40);
        assert_eq!(stats.avg_run_time(), 15.0);
        assert_eq!(stats.avg_turnaround(), 30.0);
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let json = serde_json::to_value(Outcome::NoOp {
            current: JobStatus::Canceled,
        })
        .unwrap();
        assert_eq!(json["outcome"], "no_op");
        assert_eq!(json["current"], "Canceled");
    }

    #[tokio::test]
    async fn test_access_lists() {
        let h = harness();
        let q = h
            .queue(
                QueueConfig::builder("q")
                    .submitter_hosts(["client"])
                    .worker_hosts(["node-a"])
                    .build(),
            )
            .await;
        assert!(q.check_submitter("client").is_ok());
        assert!(matches!(
            q.check_submitter("node-a"),
            Err(NsError::AccessDenied(_))
        ));
        assert!(q.check_worker("node-a").is_ok());
        assert!(q.check_worker("client").is_err());

        let open = h.queue(QueueConfig::builder("open").build()).await;
        assert!(open.check_worker("anyone").is_ok());
    }

    #[tokio::test]
    async fn test_recovery_rebuilds_indexes() {
        let h = harness();
        let config = QueueConfig::builder("jobs").run_timeout(30).build();
        let worker = WorkerNode::new("node-a", 9000);
        {
            let q = h.queue(config.clone()).await;
            q.submit("client", JobSubmission::new("a").affinity("gpu"))
                .await
                .unwrap();
            q.submit("client", JobSubmission::new("b")).await.unwrap();
            q.submit("client", JobSubmission::new("c")).await.unwrap();
            let job = q.get_job(&worker, &[]).await.unwrap().unwrap();
            assert_eq!(job.id, JobId(1));
            q.cancel("client", JobId(3)).await.unwrap();
        }

        let q = h.queue(config).await;
        assert_eq!(q.status(JobId(1)), JobStatus::Running);
        assert_eq!(q.status(JobId(2)), JobStatus::Pending);
        assert_eq!(q.status(JobId(3)), JobStatus::Canceled);
        assert_eq!(q.last_id(), JobId(3));
        assert_eq!(q.affinity.lookup("gpu"), Some(1));
        assert_eq!(q.affinity.job_count(1), 1);
        assert!(q.timeline.lock().contains(JobId(1)));

        let next = q.submit("client", JobSubmission::new("d")).await.unwrap();
        assert_eq!(next, JobId(4));
        assert_eq!(q.affinity.resolve("cpu").id, 2);
    }

    #[tokio::test]
    async fn test_reconfigure() {
        let h = harness();
        let q = h.queue(QueueConfig::builder("q").build()).await;
        assert!(q.load_balancer().is_none());

        let lb = crate::config::LoadBalanceConfig {
            curve: ThresholdCurve::regression(),
            ..Default::default()
        };
        q.reconfigure(
            QueueConfig::builder("q")
                .run_timeout_precision(5)
                .load_balance(lb)
                .build(),
        )
        .unwrap();
        assert!(q.load_balancer().is_some());
        assert_eq!(q.timeline.lock().precision(), 5);
        assert!(q.reconfigure(QueueConfig::builder("other").build()).is_err());
    }

    #[tokio::test]
    async fn test_statistics_snapshot() {
        let h = harness();
        let q = h.queue(QueueConfig::builder("q").worker_hosts(["node-a"]).build()).await;
        q.submit("client", JobSubmission::new("x")).await.unwrap();
        q.register_listener("node-a", 9000, 60, "token");

        let stats = q.statistics();
        assert_eq!(stats.queue, "q");
        assert_eq!(stats.counts.pending, 1);
        assert_eq!(stats.records, 1);
        assert_eq!(stats.last_id, 1);
        assert_eq!(stats.listeners.len(), 1);
        assert_eq!(stats.worker_hosts, vec!["node-a"]);
        assert!(!stats.host.is_empty());
    }

    #[tokio::test]
    async fn test_monitor_stream() {
        let h = harness();
        let q = h.queue(QueueConfig::builder("q").build()).await;
        let mut rx = q.subscribe_monitor();
        q.submit("client", JobSubmission::new("x")).await.unwrap();
        let line = rx.recv().await.unwrap();
        assert!(line.contains("submit"));
        assert!(line.contains("job=1"));
    }
}
