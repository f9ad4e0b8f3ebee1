//! Object store contract consumed by the core.
//!
//! The core never talks to a disk directly. It stages writes in a
//! [`Transaction`] and hands the batch to an [`ObjectStore`], which applies
//! it atomically and then runs the transaction's on-commit callbacks.

mod memory;
mod meta;

pub use memory::MemStore;
pub use meta::{FinalPoolInfo, MetaCollection};

use crate::error::Result;
use crate::types::{Epoch, PoolId, SpgId};
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

/// A collection of objects: the daemon metadata, or one PG's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CollectionId {
    Meta,
    Pg(SpgId),
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectionId::Meta => write!(f, "meta"),
            CollectionId::Pg(pgid) => write!(f, "{}_head", pgid),
        }
    }
}

/// Key of an object within a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectKey {
    /// Full map encoding of an epoch.
    FullMap(Epoch),
    /// Incremental encoding producing an epoch.
    IncMap(Epoch),
    /// The daemon superblock.
    Superblock,
    /// Last known info of a deleted pool.
    FinalPoolInfo(PoolId),
    /// Persisted PG info, inside the PG's own collection.
    PgInfo,
}

/// An opened collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionHandle {
    cid: CollectionId,
}

impl CollectionHandle {
    pub fn new(cid: CollectionId) -> Self {
        Self { cid }
    }

    pub fn cid(&self) -> CollectionId {
        self.cid
    }
}

/// A single staged mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOp {
    Write {
        cid: CollectionId,
        key: ObjectKey,
        data: Bytes,
    },
    Remove {
        cid: CollectionId,
        key: ObjectKey,
    },
    CreateCollection {
        cid: CollectionId,
    },
    RemoveCollection {
        cid: CollectionId,
    },
}

/// Callback run once a transaction is durable.
pub type OnCommit = Box<dyn FnOnce() + Send + 'static>;

/// An ordered batch of mutations applied atomically.
#[derive(Default)]
pub struct Transaction {
    ops: Vec<TxnOp>,
    on_commit: Vec<OnCommit>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write(&mut self, cid: CollectionId, key: ObjectKey, data: Bytes) {
        self.ops.push(TxnOp::Write { cid, key, data });
    }

    pub fn remove(&mut self, cid: CollectionId, key: ObjectKey) {
        self.ops.push(TxnOp::Remove { cid, key });
    }

    pub fn create_collection(&mut self, cid: CollectionId) {
        self.ops.push(TxnOp::CreateCollection { cid });
    }

    /// Drop a collection and every object in it.
    pub fn remove_collection(&mut self, cid: CollectionId) {
        self.ops.push(TxnOp::RemoveCollection { cid });
    }

    /// Run `f` after the transaction commits.
    pub fn register_on_commit(&mut self, f: impl FnOnce() + Send + 'static) {
        self.on_commit.push(Box::new(f));
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    /// True when there are no ops. Callbacks alone do not count.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[TxnOp] {
        &self.ops
    }

    /// Move the contents out, leaving an empty transaction.
    pub fn take(&mut self) -> Transaction {
        std::mem::take(self)
    }

    /// Remove and return the registered callbacks.
    pub fn collect_on_commit(&mut self) -> Vec<OnCommit> {
        std::mem::take(&mut self.on_commit)
    }

    /// Split into ops and callbacks.
    pub fn into_parts(self) -> (Vec<TxnOp>, Vec<OnCommit>) {
        (self.ops, self.on_commit)
    }

    /// Append another transaction's ops and callbacks.
    pub fn append(&mut self, other: Transaction) {
        let (ops, callbacks) = other.into_parts();
        self.ops.extend(ops);
        self.on_commit.extend(callbacks);
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("ops", &self.ops)
            .field("on_commit", &self.on_commit.len())
            .finish()
    }
}

/// Storage backend contract.
#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Read an object. `None` if it does not exist.
    async fn read(&self, cid: &CollectionId, key: &ObjectKey) -> Result<Option<Bytes>>;

    /// Open a collection, creating it if needed.
    async fn open_or_create_collection(&self, cid: CollectionId) -> Result<CollectionHandle>;

    /// Open an existing collection.
    async fn open_collection(&self, cid: &CollectionId) -> Result<Option<CollectionHandle>>;

    /// All existing collections.
    async fn list_collections(&self) -> Result<Vec<CollectionId>>;

    /// Apply `txn` atomically and run its on-commit callbacks.
    async fn do_transaction(&self, coll: &CollectionHandle, txn: Transaction) -> Result<()>;

    /// Wait until everything previously submitted on `coll` is durable.
    async fn flush(&self, coll: &CollectionHandle) -> Result<()>;
}
