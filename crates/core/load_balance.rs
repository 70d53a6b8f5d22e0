//! Load-balanced dispatch admission.
//!
//! When a queue has load balancing enabled, every dispatch is checked against
//! the load signal of the worker's host. The acceptance threshold relaxes with
//! the time a job has been stalled waiting for admission, and once the stall
//! exceeds the execution delay the job is granted regardless of load.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::LoadBalanceConfig;
use crate::error::Result;

/// Default execution delay in seconds.
const DEFAULT_EXEC_DELAY: f64 = 6.0;

/// Acceptance threshold as a function of stall time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ThresholdCurve {
    /// Decreases linearly from `high` to `low` over the execution delay.
    Linear { high: f64, low: f64 },
    /// `high + a * ln(1 + stall)`, clamped to `[0, 1]`.
    Regression { high: f64, a: f64 },
}

impl Default for ThresholdCurve {
    fn default() -> Self {
        ThresholdCurve::Linear {
            high: 0.6,
            low: 0.15,
        }
    }
}

impl ThresholdCurve {
    pub fn regression() -> Self {
        ThresholdCurve::Regression { high: 0.85, a: -0.2 }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        match *self {
            ThresholdCurve::Linear { high, low } => {
                if !(0.0..=1.0).contains(&low) || !(0.0..=1.0).contains(&high) || low > high {
                    return Err(format!(
                        "linear curve needs 0 <= low <= high <= 1, got low={} high={}",
                        low, high
                    ));
                }
            }
            ThresholdCurve::Regression { high, a } => {
                if !(0.0..=1.0).contains(&high) || a > 0.0 {
                    return Err(format!(
                        "regression curve needs 0 <= high <= 1 and a <= 0, got high={} a={}",
                        high, a
                    ));
                }
            }
        }
        Ok(())
    }

    /// Threshold after `stall` seconds, given the execution delay.
    pub fn value(&self, stall: f64, delay: f64) -> f64 {
        let stall = stall.max(0.0);
        match *self {
            ThresholdCurve::Linear { high, low } => {
                if delay <= 0.0 {
                    return low;
                }
                high - (high - low) * stall.min(delay) / delay
            }
            ThresholdCurve::Regression { high, a } => (high + a * (1.0 + stall).ln()).clamp(0.0, 1.0),
        }
    }
}

/// How long a job may stall before admission is forced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecDelay {
    /// Fixed number of seconds.
    Constant(u64),
    /// Average run time of the queue times `mult`.
    RunTime { mult: f64 },
}

impl Default for ExecDelay {
    fn default() -> Self {
        ExecDelay::Constant(DEFAULT_EXEC_DELAY as u64)
    }
}

/// Treatment of hosts without a load signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownHostPolicy {
    #[default]
    Allow,
    Deny,
    /// Only jobs that stalled past the execution delay.
    Reserve,
}

/// What the load signal is compared against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionPolicy {
    /// Availability must reach the curve threshold.
    #[default]
    Rate,
    /// Any spare CPU is enough.
    CpuAvail,
}

/// Raw decision for one host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LbDecision {
    Grant,
    Deny,
    HostUnknown,
    NoLbInfo,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Admission {
    pub granted: bool,
    pub decision: LbDecision,
    /// Seconds the job has been waiting for admission.
    pub stall: i64,
}

/// Source of per-host load figures, normalised to `[0, 1]` availability.
#[async_trait]
pub trait HostLoadSource: Send + Sync {
    /// Availability of `host`, or `None` if the host reports nothing.
    fn availability(&self, host: &str) -> Option<f64>;

    /// Whether any host has reported at all.
    fn has_data(&self) -> bool;

    /// Pull fresh figures from wherever they come from.
    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

/// Load figures pushed in by the embedding process.
#[derive(Default)]
pub struct StaticLoadSource {
    hosts: RwLock<HashMap<String, f64>>,
}

impl StaticLoadSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, host: impl Into<String>, availability: f64) {
        self.hosts
            .write()
            .insert(host.into(), availability.clamp(0.0, 1.0));
    }

    pub fn remove(&self, host: &str) {
        self.hosts.write().remove(host);
    }
}

#[async_trait]
impl HostLoadSource for StaticLoadSource {
    fn availability(&self, host: &str) -> Option<f64> {
        self.hosts.read().get(host).copied()
    }

    fn has_data(&self) -> bool {
        !self.hosts.read().is_empty()
    }
}

/// Per-queue admission policy.
pub struct LoadBalanceCoordinator {
    config: LoadBalanceConfig,
    source: Arc<dyn HostLoadSource>,
}

impl LoadBalanceCoordinator {
    pub fn new(config: LoadBalanceConfig, source: Arc<dyn HostLoadSource>) -> Self {
        Self { config, source }
    }

    pub fn config(&self) -> &LoadBalanceConfig {
        &self.config
    }

    pub fn source(&self) -> &Arc<dyn HostLoadSource> {
        &self.source
    }

    /// Execution delay for a queue with the given average run time.
    pub fn stall_delay(&self, avg_run_time: f64) -> f64 {
        match self.config.exec_delay {
            ExecDelay::Constant(secs) => secs as f64,
            ExecDelay::RunTime { mult } => {
                let delay = avg_run_time * mult;
                if delay > 0.0 {
                    delay
                } else {
                    DEFAULT_EXEC_DELAY
                }
            }
        }
    }

    /// Decide for `host` after `stall` seconds of waiting.
    pub fn evaluate(&self, host: &str, stall: f64, delay: f64) -> LbDecision {
        if !self.source.has_data() {
            return LbDecision::NoLbInfo;
        }
        let Some(availability) = self.source.availability(host) else {
            return LbDecision::HostUnknown;
        };
        let granted = match self.config.policy {
            DecisionPolicy::Rate => availability >= self.config.curve.value(stall, delay),
            DecisionPolicy::CpuAvail => availability > 0.0,
        };
        if granted {
            LbDecision::Grant
        } else {
            LbDecision::Deny
        }
    }

    /// Admission check for one dispatch.
    ///
    /// `first_eval` is the job's persisted first evaluation time (0 = never
    /// evaluated); it is set on the first call and drives the stall time.
    pub fn admit(&self, host: &str, now: i64, first_eval: &mut i64, avg_run_time: f64) -> Admission {
        let stall = if *first_eval == 0 {
            *first_eval = now;
            0
        } else {
            (now - *first_eval).max(0)
        };
        let delay = self.stall_delay(avg_run_time);
        let decision = self.evaluate(host, stall as f64, delay);

        let granted = match decision {
            LbDecision::Grant | LbDecision::NoLbInfo => true,
            LbDecision::HostUnknown => match self.config.unknown_host {
                UnknownHostPolicy::Allow => true,
                UnknownHostPolicy::Reserve => stall as f64 > delay,
                UnknownHostPolicy::Deny => false,
            },
            LbDecision::Deny => stall as f64 > delay,
        };
        Admission {
            granted,
            decision,
            stall,
        }
    }
}

/// Periodically refreshes a host load source.
pub struct LoadCollector {
    source: Arc<dyn HostLoadSource>,
    interval: Duration,
    running: Arc<AtomicBool>,
}

impl LoadCollector {
    pub fn new(source: Arc<dyn HostLoadSource>, interval: Duration, running: Arc<AtomicBool>) -> Self {
        Self {
            source,
            interval,
            running,
        }
    }

    /// Run the collection loop.
    pub async fn run(&self) -> Result<()> {
        tracing::debug!("Load collector started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;

            if !self.running.load(Ordering::SeqCst) {
                break;
            }

            if let Err(e) = self.source.refresh().await {
                tracing::error!(error = %e, "Failed to refresh host load");
            }
        }

        tracing::debug!("Load collector stopped");
        Ok(())
    }
}
