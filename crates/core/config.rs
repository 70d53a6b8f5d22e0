//! Configuration types for queues and the background engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{NsError, Result};
use crate::job::MAX_TIMEOUT;
use crate::load_balance::{DecisionPolicy, ExecDelay, ThresholdCurve, UnknownHostPolicy};
use crate::retry::RetryPolicy;

/// Per-queue parameters. Time values are in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue name.
    pub name: String,
    /// Expiration window for jobs that are never completed.
    pub timeout: u64,
    /// Default run timeout. `None` uses `timeout`.
    pub run_timeout: Option<u64>,
    /// Timeline bucket width. `None` uses the run timeout.
    pub run_timeout_precision: Option<u64>,
    /// Minimum interval between two notification bursts.
    pub notify_interval: u64,
    /// Delete records as soon as they are done.
    pub delete_done: bool,
    /// Hosts allowed to submit and cancel. Empty allows anyone.
    pub submitter_hosts: Vec<String>,
    /// Hosts allowed to fetch and complete jobs. Empty allows anyone.
    pub worker_hosts: Vec<String>,
    /// Worker-history capacity; dispatching past it fails the job.
    pub max_run_attempts: usize,
    pub max_input_size: usize,
    pub max_output_size: usize,
    /// Error and progress messages are truncated to this many bytes.
    pub max_message_size: usize,
    /// Load balancing; disabled when `None`.
    pub load_balance: Option<LoadBalanceConfig>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            timeout: 3600,
            run_timeout: None,
            run_timeout_precision: None,
            notify_interval: 7,
            delete_done: false,
            submitter_hosts: Vec::new(),
            worker_hosts: Vec::new(),
            max_run_attempts: 5,
            max_input_size: 2048,
            max_output_size: 2048,
            max_message_size: 1024,
            load_balance: None,
        }
    }
}

impl QueueConfig {
    /// Create a new builder.
    pub fn builder(name: impl Into<String>) -> QueueConfigBuilder {
        QueueConfigBuilder::new(name)
    }

    pub fn effective_run_timeout(&self) -> u64 {
        self.run_timeout.unwrap_or(self.timeout)
    }

    /// Timeline bucket width, never zero.
    pub fn effective_precision(&self) -> u64 {
        self.run_timeout_precision
            .unwrap_or_else(|| self.effective_run_timeout())
            .max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(NsError::Config("queue name is empty".to_string()));
        }
        if self.max_run_attempts == 0 {
            return Err(NsError::Config(format!(
                "queue '{}': max_run_attempts must be at least 1",
                self.name
            )));
        }
        let timeouts = [Some(self.timeout), self.run_timeout, self.run_timeout_precision];
        if timeouts.into_iter().flatten().any(|t| t > MAX_TIMEOUT) {
            return Err(NsError::Config(format!(
                "queue '{}': timeouts are limited to {} seconds",
                self.name, MAX_TIMEOUT
            )));
        }
        if let Some(lb) = &self.load_balance {
            lb.validate()
                .map_err(|e| NsError::Config(format!("queue '{}': {}", self.name, e)))?;
        }
        Ok(())
    }
}

/// Builder for QueueConfig.
#[derive(Debug)]
pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    /// Create a new builder with default values.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: QueueConfig {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    /// Set the expiration window.
    pub fn timeout(mut self, secs: u64) -> Self {
        self.config.timeout = secs;
        self
    }

    /// Set the default run timeout.
    pub fn run_timeout(mut self, secs: u64) -> Self {
        self.config.run_timeout = Some(secs);
        self
    }

    /// Set the timeline bucket width.
    pub fn run_timeout_precision(mut self, secs: u64) -> Self {
        self.config.run_timeout_precision = Some(secs);
        self
    }

    /// Set the minimum interval between notification bursts.
    pub fn notify_interval(mut self, secs: u64) -> Self {
        self.config.notify_interval = secs;
        self
    }

    /// Delete records as soon as they complete.
    pub fn delete_done(mut self, enabled: bool) -> Self {
        self.config.delete_done = enabled;
        self
    }

    /// Restrict submitters to these hosts.
    pub fn submitter_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.submitter_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict workers to these hosts.
    pub fn worker_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.worker_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }

    /// Set the worker-history capacity.
    pub fn max_run_attempts(mut self, attempts: usize) -> Self {
        self.config.max_run_attempts = attempts;
        self
    }

    /// Enable load balancing.
    pub fn load_balance(mut self, lb: LoadBalanceConfig) -> Self {
        self.config.load_balance = Some(lb);
        self
    }

    /// Build the QueueConfig.
    pub fn build(self) -> QueueConfig {
        self.config
    }
}

/// Load-balancing parameters for one queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalanceConfig {
    pub curve: ThresholdCurve,
    pub exec_delay: ExecDelay,
    pub unknown_host: UnknownHostPolicy,
    pub policy: DecisionPolicy,
    /// Seconds between host load collections.
    pub collect_interval: u64,
}

impl Default for LoadBalanceConfig {
    fn default() -> Self {
        Self {
            curve: ThresholdCurve::default(),
            exec_delay: ExecDelay::default(),
            unknown_host: UnknownHostPolicy::Allow,
            policy: DecisionPolicy::Rate,
            collect_interval: 5,
        }
    }
}

impl LoadBalanceConfig {
    fn validate(&self) -> std::result::Result<(), String> {
        self.curve.validate()?;
        if let ExecDelay::RunTime { mult } = self.exec_delay {
            if !(mult > 0.0) {
                return Err(format!("exec delay multiplier must be positive, got {}", mult));
            }
        }
        Ok(())
    }
}

/// Process-wide engine settings for background services and retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Interval of the execution timeout watcher.
    #[serde(with = "duration_ms")]
    pub watcher_interval: Duration,
    /// Interval of the listener notification loop.
    #[serde(with = "duration_ms")]
    pub notify_interval: Duration,
    /// Interval of the Returned to Pending sweep.
    #[serde(with = "duration_ms")]
    pub return_to_pending_interval: Duration,
    /// Interval of status bitset compaction.
    #[serde(with = "duration_ms")]
    pub optimize_interval: Duration,
    /// Jobs examined per purge batch and status.
    pub purge_batch_size: usize,
    /// Deletions per pass before affinity compaction and checkpoint.
    pub purge_pass_limit: usize,
    /// Pause after a pass that hit its limit.
    #[serde(with = "duration_ms")]
    pub purge_busy_pause: Duration,
    /// Pause after a pass with little or no work.
    #[serde(with = "duration_ms")]
    pub purge_idle_pause: Duration,
    /// A pass is skipped until this many new ids were issued.
    pub purge_skip_threshold: u64,
    /// Upper bound on consecutive skipped passes.
    pub purge_max_skips: u32,
    /// Bounded retry for transient store conflicts.
    pub retry: RetryPolicy,
    /// Maximum candidates examined by one Get.
    pub max_dispatch_attempts: u32,
    /// Re-reads of a job description when its status is not the expected one.
    pub describe_attempts: u32,
    #[serde(with = "duration_ms")]
    pub describe_retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            watcher_interval: Duration::from_secs(1),
            notify_interval: Duration::from_secs(1),
            return_to_pending_interval: Duration::from_secs(7),
            optimize_interval: Duration::from_secs(15 * 60),
            purge_batch_size: 100,
            purge_pass_limit: 1000,
            purge_busy_pause: Duration::from_millis(200),
            purge_idle_pause: Duration::from_secs(2),
            purge_skip_threshold: 3000,
            purge_max_skips: 10,
            retry: RetryPolicy::default(),
            max_dispatch_attempts: 100,
            describe_attempts: 3,
            describe_retry_delay: Duration::from_millis(300),
        }
    }
}

impl EngineConfig {
    /// Create a new builder.
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }
}

/// Builder for EngineConfig.
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout watcher interval.
    pub fn watcher_interval(mut self, interval: Duration) -> Self {
        self.config.watcher_interval = interval;
        self
    }

    /// Set the notification loop interval.
    pub fn notify_interval(mut self, interval: Duration) -> Self {
        self.config.notify_interval = interval;
        self
    }

    /// Set the Returned to Pending sweep interval.
    pub fn return_to_pending_interval(mut self, interval: Duration) -> Self {
        self.config.return_to_pending_interval = interval;
        self
    }

    /// Set the purge batch size.
    pub fn purge_batch_size(mut self, size: usize) -> Self {
        self.config.purge_batch_size = size;
        self
    }

    /// Set the purge pass limit.
    pub fn purge_pass_limit(mut self, limit: usize) -> Self {
        self.config.purge_pass_limit = limit;
        self
    }

    /// Set the pauses between purge passes.
    pub fn purge_pauses(mut self, busy: Duration, idle: Duration) -> Self {
        self.config.purge_busy_pause = busy;
        self.config.purge_idle_pause = idle;
        self
    }

    /// Set the purge skip threshold and maximum consecutive skips.
    pub fn purge_skipping(mut self, threshold: u64, max_skips: u32) -> Self {
        self.config.purge_skip_threshold = threshold;
        self.config.purge_max_skips = max_skips;
        self
    }

    /// Set the store conflict retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Set the job description re-read policy.
    pub fn describe_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.config.describe_attempts = attempts;
        self.config.describe_retry_delay = delay;
        self
    }

    /// Build the EngineConfig.
    pub fn build(self) -> EngineConfig {
        self.config
    }
}

/// Serde module for Duration as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_config_defaults() {
        let config = QueueConfig::default();
        assert_eq!(config.timeout, 3600);
        assert_eq!(config.effective_run_timeout(), 3600);
        assert_eq!(config.effective_precision(), 3600);
        assert_eq!(config.notify_interval, 7);
        assert_eq!(config.max_run_attempts, 5);
        assert!(!config.delete_done);
        assert!(config.load_balance.is_none());
    }

    #[test]
    fn test_queue_config_builder() {
        let config = QueueConfig::builder("gpu")
            .timeout(60)
            .run_timeout(10)
            .run_timeout_precision(2)
            .delete_done(true)
            .worker_hosts(["node-a", "node-b"])
            .max_run_attempts(3)
            .build();

        assert_eq!(config.name, "gpu");
        assert_eq!(config.effective_run_timeout(), 10);
        assert_eq!(config.effective_precision(), 2);
        assert!(config.delete_done);
        assert_eq!(config.worker_hosts, vec!["node-a", "node-b"]);
        assert_eq!(config.max_run_attempts, 3);
    }

    #[test]
    fn test_precision_never_zero() {
        let config = QueueConfig::builder("q").timeout(0).build();
        assert_eq!(config.effective_precision(), 1);
    }

    #[test]
    fn test_queue_config_validate() {
        assert!(QueueConfig::default().validate().is_ok());
        assert!(QueueConfig::builder("").build().validate().is_err());
        assert!(QueueConfig::builder("q")
            .max_run_attempts(0)
            .build()
            .validate()
            .is_err());
        assert!(QueueConfig::builder("q")
            .run_timeout(u64::MAX)
            .build()
            .validate()
            .is_err());
        assert!(QueueConfig::builder("q")
            .timeout(MAX_TIMEOUT)
            .build()
            .validate()
            .is_ok());
    }

    #[test]
    fn test_queue_config_from_json() {
        let json = r#"{"name": "batch", "timeout": 120, "load_balance": {"unknown_host": "deny"}}"#;
        let config: QueueConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.name, "batch");
        assert_eq!(config.timeout, 120);
        assert_eq!(config.notify_interval, 7);
        let lb = config.load_balance.unwrap();
        assert_eq!(lb.unknown_host, UnknownHostPolicy::Deny);
        assert_eq!(lb.collect_interval, 5);
    }

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.watcher_interval, Duration::from_secs(1));
        assert_eq!(config.purge_batch_size, 100);
        assert_eq!(config.purge_pass_limit, 1000);
        assert_eq!(config.retry.max_attempts, 100);
        assert_eq!(config.describe_attempts, 3);
    }

    #[test]
    fn test_engine_config_builder() {
        let config = EngineConfig::builder()
            .watcher_interval(Duration::from_millis(50))
            .purge_batch_size(10)
            .purge_skipping(0, 0)
            .build();
        assert_eq!(config.watcher_interval, Duration::from_millis(50));
        assert_eq!(config.purge_batch_size, 10);
        assert_eq!(config.purge_skip_threshold, 0);
    }

    #[test]
    fn test_engine_config_durations_in_millis() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"watcher_interval": 250}"#).unwrap();
        assert_eq!(config.watcher_interval, Duration::from_millis(250));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["purge_idle_pause"], 2000);
    }
}
