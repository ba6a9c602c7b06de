//! Routing cache: `(fs, inode) -> partition -> (copyset, leader, tx-id)`
//! plus the per-copyset apply index. Entries refresh from the mapping
//! service on miss and invalidate on hard routing errors.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::meta::types::{
    CopysetId, FsId, InodeId, MetaStatus, PartitionId, PartitionInfo, PartitionStatus, PoolId,
    TxId,
};
use crate::rpc::{MappingService, NodeId};

/// Fully resolved dispatch target for one RPC attempt.
#[derive(Debug, Clone, Copy)]
pub struct Target {
    pub pool_id: PoolId,
    pub copyset_id: CopysetId,
    pub partition_id: PartitionId,
    pub leader: NodeId,
    pub tx_id: TxId,
}

pub struct MetaCache {
    mapping: Arc<dyn MappingService>,
    fs_id: AtomicU32,
    partitions: DashMap<PartitionId, PartitionInfo>,
    apply_indices: DashMap<CopysetId, u64>,
    leaders: DashMap<(PoolId, CopysetId), NodeId>,
    create_cursor: AtomicUsize,
}

impl MetaCache {
    pub fn new(mapping: Arc<dyn MappingService>) -> Arc<Self> {
        Arc::new(Self {
            mapping,
            fs_id: AtomicU32::new(0),
            partitions: DashMap::new(),
            apply_indices: DashMap::new(),
            leaders: DashMap::new(),
            create_cursor: AtomicUsize::new(0),
        })
    }

    pub fn set_fs_id(&self, fs_id: FsId) {
        self.fs_id.store(fs_id, Ordering::Relaxed);
    }

    pub fn fs_id(&self) -> FsId {
        self.fs_id.load(Ordering::Relaxed)
    }

    /// Re-pull the partition list and latest tx ids from the mapping service.
    pub async fn refresh(&self) -> Result<(), MetaStatus> {
        let fs_id = self.fs_id();
        let partitions = self.mapping.list_partitions(fs_id).await?;
        let tx_ids = self.mapping.get_latest_tx_id(fs_id).await?;
        for mut info in partitions {
            if let Some(tx) = tx_ids
                .iter()
                .find(|t| t.partition_id == info.partition_id)
            {
                info.tx_id = tx.tx_id;
            }
            self.partitions.insert(info.partition_id, info);
        }
        debug!(fs_id, partitions = self.partitions.len(), "meta cache refreshed");
        Ok(())
    }

    fn owner_of(&self, inode_id: InodeId) -> Option<PartitionInfo> {
        self.partitions
            .iter()
            .find(|entry| entry.owns(inode_id))
            .map(|entry| entry.clone())
    }

    pub async fn partition_of(&self, inode_id: InodeId) -> Result<PartitionId, MetaStatus> {
        if let Some(info) = self.owner_of(inode_id) {
            return Ok(info.partition_id);
        }
        self.refresh().await?;
        self.owner_of(inode_id)
            .map(|info| info.partition_id)
            .ok_or(MetaStatus::PartitionNotFound)
    }

    /// Resolve the partition owning `inode_id` into a dispatch target.
    pub async fn resolve(&self, inode_id: InodeId) -> Result<Target, MetaStatus> {
        let partition_id = self.partition_of(inode_id).await?;
        self.resolve_partition(partition_id).await
    }

    pub async fn resolve_partition(
        &self,
        partition_id: PartitionId,
    ) -> Result<Target, MetaStatus> {
        let info = match self.partitions.get(&partition_id) {
            Some(entry) => entry.clone(),
            None => {
                self.refresh().await?;
                self.partitions
                    .get(&partition_id)
                    .map(|entry| entry.clone())
                    .ok_or(MetaStatus::PartitionNotFound)?
            }
        };
        let leader = self.leader_of(info.pool_id, info.copyset_id).await?;
        Ok(Target {
            pool_id: info.pool_id,
            copyset_id: info.copyset_id,
            partition_id,
            leader,
            tx_id: info.tx_id,
        })
    }

    /// Pick a writable partition for inode creation, round-robin.
    pub async fn select_create_target(&self) -> Result<Target, MetaStatus> {
        if self.partitions.is_empty() {
            self.refresh().await?;
        }
        let writable: Vec<PartitionId> = self
            .partitions
            .iter()
            .filter(|entry| {
                entry.status == PartitionStatus::ReadWrite && entry.next_id < entry.end
            })
            .map(|entry| entry.partition_id)
            .collect();
        if writable.is_empty() {
            warn!("no writable partition available for create");
            return Err(MetaStatus::PartitionNotFound);
        }
        let cursor = self.create_cursor.fetch_add(1, Ordering::Relaxed);
        self.resolve_partition(writable[cursor % writable.len()])
            .await
    }

    pub async fn get_tx_id(&self, inode_id: InodeId) -> Result<(PartitionId, TxId), MetaStatus> {
        let partition_id = self.partition_of(inode_id).await?;
        let tx_id = self
            .partitions
            .get(&partition_id)
            .map(|entry| entry.tx_id)
            .ok_or(MetaStatus::PartitionNotFound)?;
        Ok((partition_id, tx_id))
    }

    /// Bump the locally known tx id after a commit or a stale-tx reply.
    pub fn set_tx_id(&self, partition_id: PartitionId, tx_id: TxId) {
        if let Some(mut entry) = self.partitions.get_mut(&partition_id) {
            if tx_id > entry.tx_id {
                entry.tx_id = tx_id;
            }
        }
    }

    pub fn get_apply_index(&self, copyset_id: CopysetId) -> u64 {
        self.apply_indices
            .get(&copyset_id)
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Monotone max; retried replies can deliver indices out of order.
    pub fn update_apply_index(&self, copyset_id: CopysetId, applied_index: u64) {
        let mut entry = self.apply_indices.entry(copyset_id).or_insert(0);
        if applied_index > *entry {
            *entry = applied_index;
        }
    }

    async fn leader_of(&self, pool_id: PoolId, copyset_id: CopysetId) -> Result<NodeId, MetaStatus> {
        if let Some(leader) = self.leaders.get(&(pool_id, copyset_id)) {
            return Ok(*leader);
        }
        let leader = self.mapping.get_copyset_leader(pool_id, copyset_id).await?;
        self.leaders.insert((pool_id, copyset_id), leader);
        Ok(leader)
    }

    pub fn set_leader(&self, pool_id: PoolId, copyset_id: CopysetId, leader: NodeId) {
        self.leaders.insert((pool_id, copyset_id), leader);
    }

    /// Drop a cached leader so the next resolve asks the mapping service.
    pub async fn refresh_leader(
        &self,
        pool_id: PoolId,
        copyset_id: CopysetId,
    ) -> Result<NodeId, MetaStatus> {
        self.leaders.remove(&(pool_id, copyset_id));
        self.leader_of(pool_id, copyset_id).await
    }

    pub fn invalidate_partition(&self, partition_id: PartitionId) {
        self.partitions.remove(&partition_id);
    }
}
