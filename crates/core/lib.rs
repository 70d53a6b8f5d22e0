//! # netsched-core - Job queue and dispatch engine
//!
//! This crate provides the queue engine of the netsched job broker:
//! - `Queue` with the job lifecycle operations (submit, get, put, cancel, ...)
//! - `QueueRegistry` holding every named queue of a process
//! - `StatusTracker`, `AffinityIndex` and `ExecutionTimeline` in-memory indexes
//! - `LoadBalanceCoordinator` and `NotificationDispatcher` policies
//! - `Maintenance` running the timeout watcher, Returned sweep, listener
//!   notifications and purge in the background
//! - `PersistentStore` trait for storage implementations, and `MemoryStore`

mod affinity;
mod bitset;
mod clock;
mod config;
mod engine;
mod error;
mod job;
mod load_balance;
mod maintenance;
mod memory;
mod notify;
mod purge;
mod queue;
mod registry;
mod retry;
mod status;
mod store;
mod timeline;
mod watcher;

// Re-export main types
pub use affinity::{AffinityIndex, Resolved, WorkerAffinityInfo};
pub use bitset::BitSet;
pub use clock::{Clock, DynClock, ManualClock, SystemClock};
pub use config::{
    EngineConfig, EngineConfigBuilder, LoadBalanceConfig, QueueConfig, QueueConfigBuilder,
};
pub use error::{NsError, Result};
pub use job::{
    DispatchedJob, Job, JobDescription, JobId, JobStatus, JobSubmission, SubmitterNotify,
    WorkerNode, MAX_TIMEOUT,
};
pub use load_balance::{
    Admission, DecisionPolicy, ExecDelay, HostLoadSource, LbDecision, LoadBalanceCoordinator,
    LoadCollector, StaticLoadSource, ThresholdCurve, UnknownHostPolicy,
};
pub use maintenance::Maintenance;
pub use memory::MemoryStore;
pub use notify::{
    Datagram, DynNotifier, Listener, NotificationDispatcher, NotificationService, Notifier,
    RecordingNotifier, UdpNotifier,
};
pub use purge::{PurgeReport, PurgeService};
pub use queue::{
    Outcome, Queue, QueueContext, QueueContextBuilder, QueueStatistics, RunStats,
};
pub use registry::QueueRegistry;
pub use retry::{with_retry, RetryPolicy};
pub use status::{Reservation, StatusChange, StatusCounts, StatusTracker, TransitionGuard};
pub use store::{DynStore, PersistentStore, QueueTables, SharedStore, StoreTransaction};
pub use timeline::ExecutionTimeline;
pub use watcher::{ReturnedSweeper, TimeoutWatcher};
