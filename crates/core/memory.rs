//! In-process store used by tests and single-node setups without a database.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::{NsError, Result};
use crate::store::{PersistentStore, StoreTransaction};

type Tables = BTreeMap<String, BTreeMap<u64, Vec<u8>>>;

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    checkpoints: AtomicU64,
    commits: AtomicU64,
    injected_conflicts: AtomicU32,
}

/// Transactional in-memory store.
///
/// Transactions buffer their writes and apply them atomically on commit.
/// Cloning shares the same underlying tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with a transient conflict.
    pub fn inject_conflicts(&self, count: u32) {
        self.shared.injected_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn checkpoint_count(&self) -> u64 {
        self.shared.checkpoints.load(Ordering::SeqCst)
    }

    pub fn commit_count(&self) -> u64 {
        self.shared.commits.load(Ordering::SeqCst)
    }

    /// Number of entries in a table.
    pub fn len(&self, table: &str) -> usize {
        self.shared.tables.lock().get(table).map_or(0, |t| t.len())
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction {
            shared: self.shared.clone(),
            writes: BTreeMap::new(),
        }))
    }

    async fn get(&self, table: &str, key: u64) -> Result<Option<Vec<u8>>> {
        Ok(self
            .shared
            .tables
            .lock()
            .get(table)
            .and_then(|t| t.get(&key).cloned()))
    }

    async fn scan_from(
        &self,
        table: &str,
        from: u64,
        limit: usize,
    ) -> Result<Vec<(u64, Vec<u8>)>> {
        let tables = self.shared.tables.lock();
        Ok(tables
            .get(table)
            .map(|t| {
                t.range(from..)
                    .take(limit)
                    .map(|(k, v)| (*k, v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn checkpoint(&self) -> Result<()> {
        self.shared.checkpoints.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear_table(&self, table: &str) -> Result<u64> {
        Ok(self
            .shared
            .tables
            .lock()
            .remove(table)
            .map_or(0, |t| t.len() as u64))
    }
}

struct MemoryTransaction {
    shared: Arc<Shared>,
    writes: BTreeMap<(String, u64), Option<Vec<u8>>>,
}

impl MemoryTransaction {
    fn committed(&self, table: &str, key: u64) -> Option<Vec<u8>> {
        self.shared
            .tables
            .lock()
            .get(table)
            .and_then(|t| t.get(&key).cloned())
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn get(&mut self, table: &str, key: u64) -> Result<Option<Vec<u8>>> {
        match self.writes.get(&(table.to_string(), key)) {
            Some(pending) => Ok(pending.clone()),
            None => Ok(self.committed(table, key)),
        }
    }

    async fn put(&mut self, table: &str, key: u64, value: &[u8]) -> Result<()> {
        self.writes
            .insert((table.to_string(), key), Some(value.to_vec()));
        Ok(())
    }

    async fn delete(&mut self, table: &str, key: u64) -> Result<bool> {
        let existed = self.get(table, key).await?.is_some();
        self.writes.insert((table.to_string(), key), None);
        Ok(existed)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryTransaction { shared, writes } = *self;
        let injected = shared.injected_conflicts.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |n| n.checked_sub(1),
        );
        if injected.is_ok() {
            return Err(NsError::Conflict("injected deadlock".to_string()));
        }

        let mut tables = shared.tables.lock();
        for ((table, key), value) in writes {
            let entries = tables.entry(table).or_default();
            match value {
                Some(bytes) => {
                    entries.insert(key, bytes);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        shared.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commit_applies_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.put("t", 1, b"one").await.unwrap();
        tx.put("t", 2, b"two").await.unwrap();
        assert_eq!(tx.get("t", 1).await.unwrap(), Some(b"one".to_vec()));
        assert_eq!(store.get("t", 1).await.unwrap(), None);
        tx.commit().await.unwrap();

        assert_eq!(store.get("t", 2).await.unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.len("t"), 2);
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_abort_and_drop_discard_writes() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.put("t", 1, b"x").await.unwrap();
        tx.abort().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.put("t", 2, b"y").await.unwrap();
        drop(tx);

        assert!(store.is_empty("t"));
    }

    #[tokio::test]
    async fn test_delete_and_scan_order() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        for key in [5u64, 1, 3, 9] {
            tx.put("t", key, &key.to_le_bytes()).await.unwrap();
        }
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(tx.delete("t", 3).await.unwrap());
        assert!(!tx.delete("t", 4).await.unwrap());
        tx.commit().await.unwrap();

        let keys: Vec<u64> = store
            .scan_from("t", 2, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![5, 9]);
        assert_eq!(store.scan_from("t", 0, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_conflicts() {
        let store = MemoryStore::new();
        store.inject_conflicts(1);

        let mut tx = store.begin().await.unwrap();
        tx.put("t", 1, b"x").await.unwrap();
        assert!(tx.commit().await.unwrap_err().is_retryable());

        let mut tx = store.begin().await.unwrap();
        tx.put("t", 1, b"x").await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.len("t"), 1);
    }

    #[tokio::test]
    async fn test_clear_table_and_checkpoint() {
        let store = MemoryStore::new();
        let mut tx = store.begin().await.unwrap();
        tx.put("t", 1, b"x").await.unwrap();
        tx.put("u", 1, b"y").await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.clear_table("t").await.unwrap(), 1);
        assert!(store.is_empty("t"));
        assert_eq!(store.len("u"), 1);

        store.checkpoint().await.unwrap();
        assert_eq!(store.checkpoint_count(), 1);
    }
}
