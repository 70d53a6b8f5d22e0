//! Persistent store abstraction.
//!
//! The queue engine keeps its authoritative job records in a transactional
//! key-value store supplied by the embedding process. Keys are `u64` and
//! values are opaque bytes grouped into named tables; each queue owns a job
//! table and an affinity dictionary table (see [`QueueTables`]).
//!
//! A committed transaction must survive a process restart. Implementations
//! report transient conflicts (deadlocks, busy databases) as
//! [`NsError::Conflict`] so the engine can replay the transaction.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{NsError, Result};
use crate::job::{Job, JobId};

/// Transactional key-value store consumed by the queue engine.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait PersistentStore: Send + Sync {
    // ========== Transactions ==========

    /// Start a transaction. Dropping it without `commit` aborts it.
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;

    // ========== Reads ==========

    /// Read one value outside of any transaction.
    async fn get(&self, table: &str, key: u64) -> Result<Option<Vec<u8>>>;

    /// Read up to `limit` entries with key `>= from`, in key order.
    async fn scan_from(&self, table: &str, from: u64, limit: usize)
        -> Result<Vec<(u64, Vec<u8>)>>;

    // ========== Maintenance ==========

    /// Flush the write-ahead log and truncate it.
    async fn checkpoint(&self) -> Result<()>;

    /// Remove every entry of a table. Returns the number of entries removed.
    async fn clear_table(&self, table: &str) -> Result<u64>;
}

/// An open store transaction.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Read a value, observing this transaction's own writes.
    async fn get(&mut self, table: &str, key: u64) -> Result<Option<Vec<u8>>>;

    /// Insert or replace a value.
    async fn put(&mut self, table: &str, key: u64, value: &[u8]) -> Result<()>;

    /// Delete a value. Returns whether it existed.
    async fn delete(&mut self, table: &str, key: u64) -> Result<bool>;

    /// Make all writes durable atomically.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discard all writes.
    async fn abort(self: Box<Self>) -> Result<()>;
}

/// Type alias for a dynamic store.
pub type DynStore = Arc<dyn PersistentStore>;

/// A wrapper around `Arc<dyn PersistentStore>` that implements
/// `PersistentStore + Clone`.
#[derive(Clone)]
pub struct SharedStore {
    inner: DynStore,
}

impl SharedStore {
    /// Create a new SharedStore from any store implementation.
    pub fn new<S: PersistentStore + 'static>(store: S) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    /// Create a new SharedStore from an `Arc<dyn PersistentStore>`.
    pub fn from_arc(store: DynStore) -> Self {
        Self { inner: store }
    }

    /// Get a reference to the inner store.
    pub fn inner(&self) -> &DynStore {
        &self.inner
    }
}

#[async_trait]
impl PersistentStore for SharedStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        self.inner.begin().await
    }

    async fn get(&self, table: &str, key: u64) -> Result<Option<Vec<u8>>> {
        self.inner.get(table, key).await
    }

    async fn scan_from(
        &self,
        table: &str,
        from: u64,
        limit: usize,
    ) -> Result<Vec<(u64, Vec<u8>)>> {
        self.inner.scan_from(table, from, limit).await
    }

    async fn checkpoint(&self) -> Result<()> {
        self.inner.checkpoint().await
    }

    async fn clear_table(&self, table: &str) -> Result<u64> {
        self.inner.clear_table(table).await
    }
}

/// Table names owned by one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTables {
    /// Job records keyed by job id.
    pub jobs: String,
    /// Affinity dictionary keyed by affinity id.
    pub affinity: String,
}

impl QueueTables {
    pub fn new(queue: &str) -> Self {
        Self {
            jobs: format!("{}_jobs", queue),
            affinity: format!("{}_affinity", queue),
        }
    }
}

fn decode_job(key: u64, bytes: &[u8]) -> Result<Job> {
    Job::from_bytes(bytes)
        .map_err(|e| NsError::Corruption(format!("job record {} is unreadable: {}", key, e)))
}

/// Read a job record inside a transaction.
pub(crate) async fn read_job(
    tx: &mut dyn StoreTransaction,
    table: &str,
    id: JobId,
) -> Result<Option<Job>> {
    match tx.get(table, id.get()).await? {
        Some(bytes) => decode_job(id.get(), &bytes).map(Some),
        None => Ok(None),
    }
}

/// Write a job record inside a transaction.
pub(crate) async fn write_job(tx: &mut dyn StoreTransaction, table: &str, job: &Job) -> Result<()> {
    tx.put(table, job.id.get(), &job.to_bytes()?).await
}

/// Read a job record outside of any transaction.
pub(crate) async fn fetch_job(store: &dyn PersistentStore, table: &str, id: JobId) -> Result<Option<Job>> {
    match store.get(table, id.get()).await? {
        Some(bytes) => decode_job(id.get(), &bytes).map(Some),
        None => Ok(None),
    }
}

/// Read a batch of job records in id order.
pub(crate) async fn scan_jobs(
    store: &dyn PersistentStore,
    table: &str,
    from: u64,
    limit: usize,
) -> Result<Vec<Job>> {
    store
        .scan_from(table, from, limit)
        .await?
        .into_iter()
        .map(|(key, bytes)| decode_job(key, &bytes))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSubmission;
    use crate::memory::MemoryStore;

    #[test]
    fn test_queue_tables() {
        let tables = QueueTables::new("batch");
        assert_eq!(tables.jobs, "batch_jobs");
        assert_eq!(tables.affinity, "batch_affinity");
    }

    #[tokio::test]
    async fn test_shared_store_delegates() {
        let store = SharedStore::new(MemoryStore::new());
        let job = Job::from_submission(JobId(4), "q", &JobSubmission::new("x"), 0, 10);

        let mut tx = store.begin().await.unwrap();
        write_job(tx.as_mut(), "q_jobs", &job).await.unwrap();
        tx.commit().await.unwrap();

        let loaded = fetch_job(&store, "q_jobs", JobId(4)).await.unwrap();
        assert_eq!(loaded, Some(job));
        assert_eq!(scan_jobs(&store, "q_jobs", 0, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_record_is_corruption() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.put("q_jobs", 1, b"not json").await.unwrap();
        tx.commit().await.unwrap();

        let err = fetch_job(&store, "q_jobs", JobId(1)).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
