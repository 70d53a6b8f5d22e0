//! Background maintenance for a queue registry.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};

use crate::error::{NsError, Result};
use crate::load_balance::LoadCollector;
use crate::notify::NotificationService;
use crate::purge::PurgeService;
use crate::registry::QueueRegistry;
use crate::watcher::{ReturnedSweeper, TimeoutWatcher};

/// Runs the timeout watcher, Returned sweep, listener notifications, purge
/// and host load collection for every queue of a registry.
pub struct Maintenance {
    registry: Arc<QueueRegistry>,
    running: Arc<AtomicBool>,
}

impl Maintenance {
    pub fn new(registry: Arc<QueueRegistry>) -> Self {
        Self {
            registry,
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Run until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    /// Run until `shutdown` resolves or a task fails with an unrecoverable
    /// error, which is returned.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()> + Send,
    {
        let engine = self.registry.context().engine.clone();
        self.running.store(true, Ordering::SeqCst);

        let mut tasks = JoinSet::new();

        let watcher = TimeoutWatcher::new(
            self.registry.clone(),
            engine.watcher_interval,
            self.running.clone(),
        );
        tasks.spawn(async move { watcher.run().await });

        let sweeper = ReturnedSweeper::new(
            self.registry.clone(),
            engine.return_to_pending_interval,
            self.running.clone(),
        );
        tasks.spawn(async move { sweeper.run().await });

        let notifications = NotificationService::new(
            self.registry.clone(),
            engine.notify_interval,
            self.running.clone(),
        );
        tasks.spawn(async move { notifications.run().await });

        let purge = PurgeService::new(self.registry.clone(), &engine, self.running.clone());
        tasks.spawn(async move { purge.run().await });

        let collect_interval = self
            .registry
            .queues()
            .iter()
            .filter_map(|q| q.config().load_balance.map(|lb| lb.collect_interval))
            .min();
        if let Some(secs) = collect_interval {
            let collector = LoadCollector::new(
                self.registry.context().load_source.clone(),
                Duration::from_secs(secs.max(1)),
                self.running.clone(),
            );
            tasks.spawn(async move { collector.run().await });
        }

        tracing::info!(
            queues = self.registry.len(),
            tasks = tasks.len(),
            "Maintenance started"
        );

        tokio::pin!(shutdown);
        let mut outcome = Ok(());
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, stopping maintenance...");
                    break;
                }
                Some(joined) = tasks.join_next() => {
                    if let Err(e) = task_result(joined) {
                        tracing::error!(error = %e, "Maintenance task failed, stopping");
                        outcome = Err(e);
                        break;
                    }
                }
            }
        }

        self.shutdown();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = task_result(joined) {
                tracing::error!(error = %e, "Maintenance task failed");
            }
        }

        tracing::info!("Maintenance stopped");
        outcome
    }

    /// Ask every loop to stop after its current tick.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// A panicked loop is as fatal as one that returned an error: its service
/// is gone for good.
fn task_result(joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(NsError::Backend(format!("maintenance task panicked: {}", e))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::job::{JobStatus, JobSubmission, WorkerNode};
    use crate::queue::test_support::harness;
    use crate::store::PersistentStore;

    fn fast(context: &mut crate::queue::QueueContext) {
        context.engine.watcher_interval = Duration::from_millis(10);
        context.engine.notify_interval = Duration::from_millis(10);
        context.engine.return_to_pending_interval = Duration::from_millis(10);
        context.engine.purge_idle_pause = Duration::from_millis(10);
    }

    #[tokio::test]
    async fn test_runs_until_shutdown() {
        let h = harness();
        let mut context = h.context.clone();
        fast(&mut context);
        let registry = QueueRegistry::open(
            context,
            vec![QueueConfig::builder("jobs")
                .run_timeout(1)
                .run_timeout_precision(1)
                .notify_interval(0)
                .build()],
        )
        .await
        .unwrap();
        let q = registry.get("jobs").unwrap();
        let id = q.submit("client", JobSubmission::new("x")).await.unwrap();
        q.get_job(&WorkerNode::new("w", 1), &[]).await.unwrap().unwrap();
        q.register_listener("w", 9000, 60, "");
        h.clock.advance(2);

        let maintenance = Maintenance::new(registry.clone());
        maintenance
            .run_until(tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(!maintenance.is_running());

        // timed out, swept back to Pending, listeners told
        assert_eq!(q.status(id), JobStatus::Pending);
        assert!(h.notifier.messages().contains(&"NCID jobs".to_string()));
    }

    #[tokio::test]
    async fn test_corruption_stops_maintenance() {
        let h = harness();
        let mut context = h.context.clone();
        fast(&mut context);
        let registry = QueueRegistry::open(
            context,
            vec![QueueConfig::builder("jobs")
                .run_timeout(1)
                .run_timeout_precision(1)
                .build()],
        )
        .await
        .unwrap();
        let q = registry.get("jobs").unwrap();
        q.submit("client", JobSubmission::new("x")).await.unwrap();
        q.get_job(&WorkerNode::new("w", 1), &[]).await.unwrap().unwrap();

        let mut tx = h.store.begin().await.unwrap();
        tx.put("jobs_jobs", 1, b"not json").await.unwrap();
        tx.commit().await.unwrap();
        h.clock.advance(2);

        let maintenance = Maintenance::new(registry);
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            maintenance.run_until(std::future::pending()),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(NsError::Corruption(_))));
        assert!(!maintenance.is_running());
    }

    async fn crash() -> Result<()> {
        panic!("loop crashed")
    }

    #[tokio::test]
    async fn test_panicked_task_is_fatal() {
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        tasks.spawn(crash());
        let joined = tasks.join_next().await.unwrap();
        assert!(matches!(task_result(joined), Err(NsError::Backend(_))));

        tasks.spawn(async { Ok(()) });
        let joined = tasks.join_next().await.unwrap();
        assert!(task_result(joined).is_ok());
    }
}
