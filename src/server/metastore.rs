//! Partition map of one metadata server: creates and deletes partitions,
//! dispatches operations to them, tracks per-copyset apply indices, and
//! snapshots the whole store through the KV engine.

use bytes::Bytes;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::meta::types::{
    CopysetId, MetaStatus, PartitionId, PartitionInfo, PartitionStatus,
};
use crate::server::partition::Partition;
use crate::server::trash::TrashCollector;
use crate::storage::codec::{self, TableHandle, TableTag};
use crate::storage::StorageEngine;

pub type Result<T> = std::result::Result<T, MetaStatus>;

/// Size above which inline chunk-info padding switches to streaming when the
/// client supports it.
pub const DEFAULT_CHUNK_META_LIMIT: u64 = 16 << 10;

pub struct MetaStore {
    engine: Arc<StorageEngine>,
    partitions: RwLock<HashMap<PartitionId, Arc<Partition>>>,
    apply_indices: RwLock<HashMap<CopysetId, Arc<AtomicU64>>>,
    trash: TrashCollector,
    pub chunk_meta_limit: u64,
    partition_table: TableHandle,
}

impl MetaStore {
    pub fn new(engine: Arc<StorageEngine>, trash: TrashCollector) -> Arc<Self> {
        Arc::new(Self {
            engine,
            partitions: RwLock::new(HashMap::new()),
            apply_indices: RwLock::new(HashMap::new()),
            trash,
            chunk_meta_limit: DEFAULT_CHUNK_META_LIMIT,
            partition_table: TableHandle::new(TableTag::Partition, 0),
        })
    }

    pub fn engine(&self) -> &Arc<StorageEngine> {
        &self.engine
    }

    /// Idempotent: re-creating an existing partition succeeds and keeps the
    /// existing one.
    pub fn create_partition(&self, info: PartitionInfo) -> Result<()> {
        let mut partitions = self.partitions.write().unwrap();
        if partitions.contains_key(&info.partition_id) {
            return Ok(());
        }
        let id = info.partition_id;
        partitions.insert(id, Arc::new(Partition::new(info, Arc::clone(&self.engine))));
        info!(partition = id, "created partition");
        Ok(())
    }

    pub fn delete_partition(&self, partition_id: PartitionId) -> Result<()> {
        let mut partitions = self.partitions.write().unwrap();
        let partition = partitions
            .get(&partition_id)
            .cloned()
            .ok_or(MetaStatus::PartitionNotFound)?;

        if partition.inode_count() == 0 && partition.dentry_count() == 0 {
            partition.clear_all();
            partitions.remove(&partition_id);
            info!(partition = partition_id, "deleted empty partition");
            return Ok(());
        }

        if partition.status() != PartitionStatus::Deleting {
            info!(partition = partition_id, "partition set to deleting");
            partition.clear_dentries();
            partition.set_status(PartitionStatus::Deleting);
            self.trash.spawn_partition_clean(Arc::clone(&partition));
        }
        Err(MetaStatus::PartitionDeleting)
    }

    pub fn get_partition(&self, partition_id: PartitionId) -> Result<Arc<Partition>> {
        self.partitions
            .read()
            .unwrap()
            .get(&partition_id)
            .cloned()
            .ok_or(MetaStatus::PartitionNotFound)
    }

    pub fn partition_list(&self) -> Vec<PartitionInfo> {
        self.partitions
            .read()
            .unwrap()
            .values()
            .map(|p| p.info())
            .collect()
    }

    pub fn trash(&self) -> &TrashCollector {
        &self.trash
    }

    fn apply_counter(&self, copyset_id: CopysetId) -> Arc<AtomicU64> {
        if let Some(counter) = self.apply_indices.read().unwrap().get(&copyset_id) {
            return Arc::clone(counter);
        }
        let mut indices = self.apply_indices.write().unwrap();
        Arc::clone(
            indices
                .entry(copyset_id)
                .or_insert_with(|| Arc::new(AtomicU64::new(0))),
        )
    }

    /// Every replicated write advances the copyset's apply index; the new
    /// value rides back on the reply.
    pub fn bump_apply_index(&self, copyset_id: CopysetId) -> u64 {
        self.apply_counter(copyset_id).fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current_apply_index(&self, copyset_id: CopysetId) -> u64 {
        self.apply_counter(copyset_id).load(Ordering::SeqCst)
    }

    /// Persist partition infos into the engine's partition table, then
    /// stream the whole engine to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let partitions = self.partitions.read().unwrap();
        self.engine.clear_table(self.partition_table);
        for partition in partitions.values() {
            let info = partition.info();
            let value = bincode::serialize(&info).map_err(|e| {
                warn!("partition info encode failed: {e}");
                MetaStatus::Internal
            })?;
            self.engine
                .put(
                    self.partition_table,
                    &codec::partition_key(info.partition_id),
                    Bytes::from(value),
                )
                .map_err(|_| MetaStatus::ResourceExhausted)?;
        }
        self.engine.save(path).map_err(|e| {
            warn!("metastore snapshot save failed: {e}");
            MetaStatus::Internal
        })
    }

    /// Load a snapshot and rebuild partitions and their in-memory indices.
    /// Partitions found in `Deleting` status resume their trash walk.
    pub fn load(&self, path: &Path) -> Result<()> {
        self.engine.load(path).map_err(|e| {
            warn!("metastore snapshot load failed: {e}");
            MetaStatus::Internal
        })?;

        let mut restored = HashMap::new();
        let mut infos = Vec::new();
        for (_, bytes) in self.engine.scan_table(self.partition_table) {
            let info: PartitionInfo = bincode::deserialize(&bytes).map_err(|e| {
                warn!("partition info decode failed: {e}");
                MetaStatus::Internal
            })?;
            infos.push(info);
        }
        for info in infos {
            let id = info.partition_id;
            let deleting = info.status == PartitionStatus::Deleting;
            let partition = Arc::new(Partition::new(info, Arc::clone(&self.engine)));
            partition.rebuild_indices()?;
            if deleting {
                self.trash.spawn_partition_clean(Arc::clone(&partition));
            }
            restored.insert(id, partition);
        }
        let count = restored.len();
        *self.partitions.write().unwrap() = restored;
        info!(partitions = count, "metastore loaded from snapshot");
        Ok(())
    }

    pub fn clear(&self) {
        let mut partitions = self.partitions.write().unwrap();
        for partition in partitions.values() {
            partition.clear_all();
        }
        partitions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ChunkLayout;
    use crate::meta::types::{Dentry, DentryFlags, FileType, InodeParam};
    use crate::storage::StorageOptions;
    use tokio_util::sync::CancellationToken;

    fn info(id: PartitionId, copyset: CopysetId, start: u64) -> PartitionInfo {
        PartitionInfo {
            pool_id: 1,
            copyset_id: copyset,
            partition_id: id,
            fs_id: 100,
            start,
            end: start + 1000,
            tx_id: 0,
            status: PartitionStatus::ReadWrite,
            next_id: start,
        }
    }

    fn store() -> Arc<MetaStore> {
        let engine = StorageEngine::new(StorageOptions::default());
        let (trash, _) =
            TrashCollector::start(None, ChunkLayout::default(), CancellationToken::new());
        MetaStore::new(engine, trash)
    }

    #[tokio::test]
    async fn test_create_partition_is_idempotent() {
        let store = store();
        store.create_partition(info(1, 1, 1)).unwrap();
        store.create_partition(info(1, 1, 1)).unwrap();
        assert_eq!(store.partition_list().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_partition() {
        let store = store();
        assert_eq!(
            store.get_partition(42).unwrap_err(),
            MetaStatus::PartitionNotFound
        );
    }

    #[tokio::test]
    async fn test_apply_index_monotone_per_copyset() {
        let store = store();
        assert_eq!(store.current_apply_index(1), 0);
        assert_eq!(store.bump_apply_index(1), 1);
        assert_eq!(store.bump_apply_index(1), 2);
        assert_eq!(store.bump_apply_index(2), 1);
        assert_eq!(store.current_apply_index(1), 2);
    }

    #[tokio::test]
    async fn test_delete_partition_paths() {
        let store = store();
        store.create_partition(info(1, 1, 1)).unwrap();

        // Empty partitions delete immediately.
        store.delete_partition(1).unwrap();
        assert!(store.partition_list().is_empty());

        // Non-empty partitions go through deleting status.
        store.create_partition(info(2, 1, 2000)).unwrap();
        let partition = store.get_partition(2).unwrap();
        partition
            .create_inode(&InodeParam {
                fs_id: 100,
                length: 0,
                mode: 0o644,
                uid: 0,
                gid: 0,
                file_type: FileType::Regular,
                rdev: 0,
                symlink_target: None,
                parent: 1,
            })
            .unwrap();
        assert_eq!(
            store.delete_partition(2).unwrap_err(),
            MetaStatus::PartitionDeleting
        );
        assert_eq!(partition.status(), PartitionStatus::Deleting);
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_preserves_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.snap");

        let original = store();
        original.create_partition(info(1, 1, 1)).unwrap();
        let partition = original.get_partition(1).unwrap();
        let inode = partition
            .create_inode(&InodeParam {
                fs_id: 100,
                length: 0,
                mode: 0o644,
                uid: 0,
                gid: 0,
                file_type: FileType::Regular,
                rdev: 0,
                symlink_target: None,
                parent: 1,
            })
            .unwrap();
        partition
            .create_dentry(&Dentry {
                fs_id: 100,
                parent_inode_id: 1,
                name: "f".into(),
                tx_id: 0,
                inode_id: inode.inode_id,
                flags: DentryFlags::FILE_TYPE,
            })
            .unwrap();
        original.save(&path).unwrap();

        let restored = store();
        restored.load(&path).unwrap();
        let partition = restored.get_partition(1).unwrap();
        assert_eq!(partition.inode_count(), 1);
        assert_eq!(partition.dentry_count(), 1);
        let fetched = partition.get_inode(100, inode.inode_id).unwrap();
        assert_eq!(fetched.mode, 0o644);
        assert_eq!(partition.get_dentry(100, 1, "f", 0).unwrap().inode_id, inode.inode_id);
        // The allocator resumes past the restored inodes.
        let next = partition.create_inode(&InodeParam {
            fs_id: 100,
            length: 0,
            mode: 0o600,
            uid: 0,
            gid: 0,
            file_type: FileType::Regular,
            rdev: 0,
            symlink_target: None,
            parent: 1,
        });
        assert!(next.unwrap().inode_id > inode.inode_id);
    }
}
