//! In-memory object store.

use super::{CollectionHandle, CollectionId, ObjectKey, ObjectStore, Transaction, TxnOp};
use crate::error::{Result, StorageError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::debug;

/// Object store keeping everything in memory.
///
/// Transactions are validated before any op is applied, so a failed
/// transaction leaves no trace. Counters record how often collections were
/// opened-or-created and how many transactions committed, and the next
/// commit can be made to fail.
#[derive(Debug)]
pub struct MemStore {
    collections: RwLock<HashMap<CollectionId, BTreeMap<ObjectKey, Bytes>>>,
    create_calls: DashMap<CollectionId, usize>,
    commits: AtomicU64,
    fail_next_commit: AtomicBool,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    /// A store holding only the empty metadata collection.
    pub fn new() -> Self {
        let mut collections = HashMap::new();
        collections.insert(CollectionId::Meta, BTreeMap::new());
        Self {
            collections: RwLock::new(collections),
            create_calls: DashMap::new(),
            commits: AtomicU64::new(0),
            fail_next_commit: AtomicBool::new(false),
        }
    }

    /// Number of `open_or_create_collection` calls for `cid`.
    pub fn create_calls(&self, cid: &CollectionId) -> usize {
        self.create_calls.get(cid).map(|c| *c).unwrap_or(0)
    }

    /// Number of committed transactions.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Make the next `do_transaction` fail with an I/O error.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Whether an object exists.
    pub fn contains(&self, cid: &CollectionId, key: &ObjectKey) -> bool {
        self.collections
            .read()
            .get(cid)
            .map(|objects| objects.contains_key(key))
            .unwrap_or(false)
    }

    /// Keys stored in a collection.
    pub fn keys(&self, cid: &CollectionId) -> Vec<ObjectKey> {
        self.collections
            .read()
            .get(cid)
            .map(|objects| objects.keys().copied().collect())
            .unwrap_or_default()
    }

    fn apply(&self, txn_ops: Vec<TxnOp>) -> Result<()> {
        let mut collections = self.collections.write();

        let mut known: HashSet<CollectionId> = collections.keys().copied().collect();
        for op in &txn_ops {
            match op {
                TxnOp::CreateCollection { cid } => {
                    known.insert(*cid);
                }
                TxnOp::RemoveCollection { cid } => {
                    known.remove(cid);
                }
                TxnOp::Write { cid, .. } | TxnOp::Remove { cid, .. } => {
                    if !known.contains(cid) {
                        return Err(StorageError::CollectionNotFound(cid.to_string()).into());
                    }
                }
            }
        }

        for op in txn_ops {
            match op {
                TxnOp::CreateCollection { cid } => {
                    collections.entry(cid).or_default();
                }
                TxnOp::RemoveCollection { cid } => {
                    collections.remove(&cid);
                }
                TxnOp::Write { cid, key, data } => {
                    collections.entry(cid).or_default().insert(key, data);
                }
                TxnOp::Remove { cid, key } => {
                    if let Some(objects) = collections.get_mut(&cid) {
                        objects.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemStore {
    async fn read(&self, cid: &CollectionId, key: &ObjectKey) -> Result<Option<Bytes>> {
        let collections = self.collections.read();
        let objects = collections
            .get(cid)
            .ok_or_else(|| StorageError::CollectionNotFound(cid.to_string()))?;
        Ok(objects.get(key).cloned())
    }

    async fn open_or_create_collection(&self, cid: CollectionId) -> Result<CollectionHandle> {
        *self.create_calls.entry(cid).or_insert(0) += 1;
        // Let concurrent callers interleave here.
        tokio::task::yield_now().await;
        self.collections.write().entry(cid).or_default();
        debug!(cid = %cid, "Opened or created collection");
        Ok(CollectionHandle::new(cid))
    }

    async fn open_collection(&self, cid: &CollectionId) -> Result<Option<CollectionHandle>> {
        Ok(self
            .collections
            .read()
            .contains_key(cid)
            .then(|| CollectionHandle::new(*cid)))
    }

    async fn list_collections(&self) -> Result<Vec<CollectionId>> {
        let mut cids: Vec<CollectionId> = self.collections.read().keys().copied().collect();
        cids.sort();
        Ok(cids)
    }

    async fn do_transaction(&self, coll: &CollectionHandle, txn: Transaction) -> Result<()> {
        if self.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StorageError::Io(format!("injected failure on {}", coll.cid())).into());
        }

        let (ops, callbacks) = txn.into_parts();
        let num_ops = ops.len();
        self.apply(ops)?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        debug!(cid = %coll.cid(), num_ops, "Committed transaction");

        for callback in callbacks {
            callback();
        }
        Ok(())
    }

    async fn flush(&self, _coll: &CollectionHandle) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::types::{PgId, SpgId};
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn meta() -> CollectionHandle {
        CollectionHandle::new(CollectionId::Meta)
    }

    #[tokio::test]
    async fn test_commit_and_read() {
        let store = MemStore::new();
        let mut txn = Transaction::new();
        txn.write(CollectionId::Meta, ObjectKey::FullMap(1), Bytes::from_static(b"m1"));
        store.do_transaction(&meta(), txn).await.unwrap();

        let read = store
            .read(&CollectionId::Meta, &ObjectKey::FullMap(1))
            .await
            .unwrap();
        assert_eq!(read, Some(Bytes::from_static(b"m1")));
        assert_eq!(store.commit_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_transaction_applies_nothing() {
        let store = MemStore::new();
        let missing = CollectionId::Pg(SpgId::new(PgId::new(1, 0)));
        let mut txn = Transaction::new();
        txn.write(CollectionId::Meta, ObjectKey::FullMap(1), Bytes::new());
        txn.write(missing, ObjectKey::PgInfo, Bytes::new());

        let result = store.do_transaction(&meta(), txn).await;
        assert!(matches!(
            result,
            Err(Error::Storage(StorageError::CollectionNotFound(_)))
        ));
        assert!(!store.contains(&CollectionId::Meta, &ObjectKey::FullMap(1)));
        assert_eq!(store.commit_count(), 0);
    }

    #[tokio::test]
    async fn test_injected_failure_skips_callbacks() {
        let store = MemStore::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let mut txn = Transaction::new();
        let counter = fired.clone();
        txn.register_on_commit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        store.fail_next_commit();
        assert!(store.do_transaction(&meta(), txn).await.is_err());
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let mut txn = Transaction::new();
        let counter = fired.clone();
        txn.register_on_commit(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        store.do_transaction(&meta(), txn).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_collection_drops_objects() {
        let store = MemStore::new();
        let cid = CollectionId::Pg(SpgId::new(PgId::new(1, 4)));
        let coll = store.open_or_create_collection(cid).await.unwrap();
        let mut txn = Transaction::new();
        txn.write(cid, ObjectKey::PgInfo, Bytes::from_static(b"info"));
        store.do_transaction(&coll, txn).await.unwrap();

        let mut txn = Transaction::new();
        txn.remove_collection(cid);
        store.do_transaction(&coll, txn).await.unwrap();
        assert!(store.open_collection(&cid).await.unwrap().is_none());
        assert!(!store.contains(&cid, &ObjectKey::PgInfo));

        // Writes into a collection removed earlier in the same batch fail.
        let mut txn = Transaction::new();
        txn.create_collection(cid);
        txn.remove_collection(cid);
        txn.write(cid, ObjectKey::PgInfo, Bytes::new());
        assert!(store.do_transaction(&coll, txn).await.is_err());
    }

    #[tokio::test]
    async fn test_create_collection_counts_calls() {
        let store = MemStore::new();
        let cid = CollectionId::Pg(SpgId::new(PgId::new(2, 3)));
        assert!(store.open_collection(&cid).await.unwrap().is_none());

        store.open_or_create_collection(cid).await.unwrap();
        assert_eq!(store.create_calls(&cid), 1);
        assert!(store.open_collection(&cid).await.unwrap().is_some());
        assert_eq!(
            store.list_collections().await.unwrap(),
            vec![CollectionId::Meta, cid]
        );
    }
}
