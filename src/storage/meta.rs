//! Typed access to the daemon metadata collection.

use super::{CollectionHandle, CollectionId, ObjectKey, ObjectStore, Transaction};
use crate::error::{Result, StorageError};
use crate::osd::Superblock;
use crate::osdmap::PoolInfo;
use crate::types::{Epoch, PoolId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Last known state of a pool that a newer epoch deleted.
///
/// Kept so PGs of the deleted pool can still be instantiated from disk and
/// cleaned up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalPoolInfo {
    pub pool: PoolInfo,
    pub name: String,
    pub ec_profile: BTreeMap<String, String>,
}

/// Metadata collection: map encodings, superblock and final pool infos.
#[derive(Debug, Clone)]
pub struct MetaCollection {
    store: Arc<dyn ObjectStore>,
    handle: CollectionHandle,
}

impl MetaCollection {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            handle: CollectionHandle::new(CollectionId::Meta),
        }
    }

    pub fn handle(&self) -> &CollectionHandle {
        &self.handle
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn store_map(&self, txn: &mut Transaction, epoch: Epoch, bytes: Bytes) {
        txn.write(CollectionId::Meta, ObjectKey::FullMap(epoch), bytes);
    }

    pub fn store_inc_map(&self, txn: &mut Transaction, epoch: Epoch, bytes: Bytes) {
        txn.write(CollectionId::Meta, ObjectKey::IncMap(epoch), bytes);
    }

    pub fn remove_map(&self, txn: &mut Transaction, epoch: Epoch) {
        txn.remove(CollectionId::Meta, ObjectKey::FullMap(epoch));
    }

    pub fn remove_inc_map(&self, txn: &mut Transaction, epoch: Epoch) {
        txn.remove(CollectionId::Meta, ObjectKey::IncMap(epoch));
    }

    /// Load the full encoding of an epoch.
    pub async fn load_map(&self, epoch: Epoch) -> Result<Bytes> {
        self.store
            .read(&CollectionId::Meta, &ObjectKey::FullMap(epoch))
            .await?
            .ok_or_else(|| StorageError::MapNotFound(epoch).into())
    }

    /// Load the incremental encoding of an epoch, if stored.
    pub async fn load_inc_map(&self, epoch: Epoch) -> Result<Option<Bytes>> {
        self.store
            .read(&CollectionId::Meta, &ObjectKey::IncMap(epoch))
            .await
    }

    pub fn store_superblock(&self, txn: &mut Transaction, superblock: &Superblock) -> Result<()> {
        self.store_record(txn, ObjectKey::Superblock, superblock)
    }

    pub async fn load_superblock(&self) -> Result<Option<Superblock>> {
        self.load_record(ObjectKey::Superblock).await
    }

    pub fn store_final_pool_info(
        &self,
        txn: &mut Transaction,
        pool: PoolId,
        info: &FinalPoolInfo,
    ) -> Result<()> {
        self.store_record(txn, ObjectKey::FinalPoolInfo(pool), info)
    }

    pub async fn load_final_pool_info(&self, pool: PoolId) -> Result<Option<FinalPoolInfo>> {
        self.load_record(ObjectKey::FinalPoolInfo(pool)).await
    }

    fn store_record<T: Serialize>(
        &self,
        txn: &mut Transaction,
        key: ObjectKey,
        value: &T,
    ) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        txn.write(CollectionId::Meta, key, Bytes::from(bytes));
        Ok(())
    }

    async fn load_record<T: for<'de> Deserialize<'de>>(&self, key: ObjectKey) -> Result<Option<T>> {
        match self.store.read(&CollectionId::Meta, &key).await? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }
}
