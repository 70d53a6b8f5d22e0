//! Named queues of one engine instance.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::QueueConfig;
use crate::error::{NsError, Result};
use crate::queue::{Queue, QueueContext};

/// All queues served by one process, sharing a store and collaborators.
pub struct QueueRegistry {
    context: QueueContext,
    queues: RwLock<BTreeMap<String, Arc<Queue>>>,
}

impl QueueRegistry {
    /// Mount every configured queue.
    pub async fn open(context: QueueContext, configs: Vec<QueueConfig>) -> Result<Arc<Self>> {
        let registry = Arc::new(Self {
            context,
            queues: RwLock::new(BTreeMap::new()),
        });
        for config in configs {
            registry.add_queue(config).await?;
        }
        tracing::info!(queues = registry.len(), "Queue registry opened");
        Ok(registry)
    }

    /// Mount a new queue. Fails if the name is taken.
    pub async fn add_queue(&self, config: QueueConfig) -> Result<Arc<Queue>> {
        if self.queues.read().contains_key(&config.name) {
            return Err(NsError::Config(format!(
                "queue '{}' already exists",
                config.name
            )));
        }
        let name = config.name.clone();
        let queue = Queue::mount(config, &self.context).await?;

        let mut queues = self.queues.write();
        if queues.contains_key(&name) {
            return Err(NsError::Config(format!("queue '{}' already exists", name)));
        }
        queues.insert(name, queue.clone());
        Ok(queue)
    }

    pub fn get(&self, name: &str) -> Result<Arc<Queue>> {
        self.queues
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| NsError::QueueNotFound(name.to_string()))
    }

    /// Every queue, ordered by name.
    pub fn queues(&self) -> Vec<Arc<Queue>> {
        self.queues.read().values().cloned().collect()
    }

    pub fn list(&self) -> Vec<String> {
        self.queues.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.queues.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.read().is_empty()
    }

    /// Apply new parameters to an existing queue.
    pub fn reconfigure(&self, config: QueueConfig) -> Result<()> {
        self.get(&config.name)?.reconfigure(config)
    }

    pub fn context(&self) -> &QueueContext {
        &self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSubmission;
    use crate::queue::test_support::harness;

    #[tokio::test]
    async fn test_open_and_lookup() {
        let h = harness();
        let registry = QueueRegistry::open(
            h.context.clone(),
            vec![
                QueueConfig::builder("render").build(),
                QueueConfig::builder("batch").build(),
            ],
        )
        .await
        .unwrap();

        assert_eq!(registry.list(), vec!["batch", "render"]);
        assert_eq!(registry.queues().len(), 2);
        assert_eq!(registry.get("render").unwrap().name(), "render");
        assert!(matches!(
            registry.get("missing"),
            Err(NsError::QueueNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let h = harness();
        let registry = QueueRegistry::open(
            h.context.clone(),
            vec![QueueConfig::builder("a").build(), QueueConfig::builder("b").build()],
        )
        .await
        .unwrap();
        let a = registry.get("a").unwrap();
        let b = registry.get("b").unwrap();

        a.submit("client", JobSubmission::new("x")).await.unwrap();
        let id = b.submit("client", JobSubmission::new("y")).await.unwrap();
        assert_eq!(id.get(), 1);
        assert_eq!(h.store.len("a_jobs"), 1);
        assert_eq!(h.store.len("b_jobs"), 1);
    }

    #[tokio::test]
    async fn test_duplicate_and_reconfigure() {
        let h = harness();
        let registry = QueueRegistry::open(h.context.clone(), vec![QueueConfig::builder("a").build()])
            .await
            .unwrap();
        assert!(registry
            .add_queue(QueueConfig::builder("a").build())
            .await
            .is_err());

        registry
            .reconfigure(QueueConfig::builder("a").timeout(60).build())
            .unwrap();
        assert_eq!(registry.get("a").unwrap().config().timeout, 60);
        assert!(registry
            .reconfigure(QueueConfig::builder("zzz").build())
            .is_err());
    }
}
