//! Interfaces the core consumes from the metadata and mapping services.
//!
//! The real deployment puts a replicated RPC transport behind these traits;
//! here they are plain async traits plus an in-process router (`router`)
//! that delivers requests straight to partition stores. Requests carry the
//! `(pool, copyset, partition, fs, tx, applied-index)` tuple; replies carry a
//! status, the new applied index, and optional redirect / latest-tx hints for
//! the executor's recovery loop.

pub mod router;
pub mod stream;

use async_trait::async_trait;
use thiserror::Error;

use crate::meta::types::{
    ChunkInfoMap, CopysetId, Dentry, FsId, FsInfo, Inode, InodeAttr, InodeId, InodeParam,
    MetaStatus, PartitionId, PartitionInfo, PartitionTxId, PoolId, TxId, UpdateInodeRequest, Xattr,
};
use stream::ChunkInfoStream;

/// Identifies one metadata server process.
pub type NodeId = u64;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("rpc timed out")]
    Timeout,
}

pub type RpcResult<T> = std::result::Result<Reply<T>, RpcError>;

#[derive(Debug, Clone, Copy)]
pub struct RequestContext {
    pub pool_id: PoolId,
    pub copyset_id: CopysetId,
    pub partition_id: PartitionId,
    pub fs_id: FsId,
    pub tx_id: TxId,
    /// The caller's last observed apply index for this copyset; a replica
    /// behind it must not serve the read.
    pub applied_index: u64,
    /// Which node the caller believes is the leader.
    pub leader: NodeId,
}

#[derive(Debug, Clone)]
pub struct Reply<T> {
    pub status: MetaStatus,
    pub applied_index: Option<u64>,
    /// Set alongside `MetaStatus::Redirect`.
    pub redirect: Option<NodeId>,
    /// Set alongside `MetaStatus::StaleTx`.
    pub latest_tx_id: Option<TxId>,
    pub body: Option<T>,
}

impl<T> Reply<T> {
    pub fn ok(applied_index: u64, body: T) -> Self {
        Self {
            status: MetaStatus::Ok,
            applied_index: Some(applied_index),
            redirect: None,
            latest_tx_id: None,
            body: Some(body),
        }
    }

    pub fn status(status: MetaStatus) -> Self {
        Self {
            status,
            applied_index: None,
            redirect: None,
            latest_tx_id: None,
            body: None,
        }
    }

    pub fn redirect(leader: NodeId) -> Self {
        Self {
            status: MetaStatus::Redirect,
            applied_index: None,
            redirect: Some(leader),
            latest_tx_id: None,
            body: None,
        }
    }

    pub fn stale_tx(latest: TxId) -> Self {
        Self {
            status: MetaStatus::StaleTx,
            applied_index: None,
            redirect: None,
            latest_tx_id: Some(latest),
            body: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GetInodeBody {
    pub inode: Inode,
    /// True when chunk metadata was too large to pad inline and must be
    /// fetched through the streaming call.
    pub streaming: bool,
}

#[derive(Debug, Clone)]
pub struct ChunkInfoReply {
    pub map: ChunkInfoMap,
    pub streaming: bool,
}

/// Partition-store RPC surface.
#[async_trait]
pub trait MetaService: Send + Sync {
    async fn create_inode(&self, ctx: RequestContext, param: InodeParam) -> RpcResult<Inode>;

    async fn get_inode(
        &self,
        ctx: RequestContext,
        inode_id: InodeId,
        support_streaming: bool,
    ) -> RpcResult<GetInodeBody>;

    async fn update_inode(&self, ctx: RequestContext, req: UpdateInodeRequest) -> RpcResult<()>;

    async fn delete_inode(&self, ctx: RequestContext, inode_id: InodeId) -> RpcResult<()>;

    async fn batch_get_inode_attr(
        &self,
        ctx: RequestContext,
        inode_ids: Vec<InodeId>,
    ) -> RpcResult<Vec<InodeAttr>>;

    async fn batch_get_xattr(
        &self,
        ctx: RequestContext,
        inode_ids: Vec<InodeId>,
    ) -> RpcResult<Vec<Xattr>>;

    async fn create_dentry(&self, ctx: RequestContext, dentry: Dentry) -> RpcResult<()>;

    async fn get_dentry(
        &self,
        ctx: RequestContext,
        parent: InodeId,
        name: String,
    ) -> RpcResult<Dentry>;

    async fn delete_dentry(
        &self,
        ctx: RequestContext,
        parent: InodeId,
        name: String,
    ) -> RpcResult<()>;

    async fn list_dentry(
        &self,
        ctx: RequestContext,
        parent: InodeId,
        last: Option<String>,
        count: u32,
        only_dir: bool,
    ) -> RpcResult<Vec<Dentry>>;

    /// Atomically stage prepared rename dentries in one partition.
    async fn prepare_rename_tx(&self, ctx: RequestContext, dentries: Vec<Dentry>)
        -> RpcResult<()>;

    async fn get_or_modify_chunk_info(
        &self,
        ctx: RequestContext,
        inode_id: InodeId,
        add: ChunkInfoMap,
        remove: ChunkInfoMap,
        return_map: bool,
        support_streaming: bool,
    ) -> RpcResult<ChunkInfoReply>;

    /// Open the streaming variant of chunk-info delivery: a sequence of
    /// `(chunk_index, list)` frames terminated by EOF.
    async fn stream_chunk_info(
        &self,
        ctx: RequestContext,
        inode_id: InodeId,
    ) -> std::result::Result<ChunkInfoStream, RpcError>;
}

/// Mapping-service RPC surface. `commit_tx` is the linearization point of
/// cross-partition renames.
#[async_trait]
pub trait MappingService: Send + Sync {
    async fn mount_fs(
        &self,
        fs_name: &str,
        mountpoint: &str,
    ) -> std::result::Result<FsInfo, MetaStatus>;

    async fn umount_fs(
        &self,
        fs_name: &str,
        mountpoint: &str,
    ) -> std::result::Result<(), MetaStatus>;

    async fn get_fs_info(&self, fs_name: &str) -> std::result::Result<FsInfo, MetaStatus>;

    /// Reserve `count` chunk ids; returns the first id of the run.
    async fn allocate_chunk_id(
        &self,
        fs_id: FsId,
        count: u32,
    ) -> std::result::Result<u64, MetaStatus>;

    async fn get_latest_tx_id(
        &self,
        fs_id: FsId,
    ) -> std::result::Result<Vec<PartitionTxId>, MetaStatus>;

    /// Atomically advance the tx id of every listed partition. Each entry
    /// must be exactly one ahead of the current value or the whole batch
    /// fails with `StaleTx`.
    async fn commit_tx(
        &self,
        fs_id: FsId,
        tx_ids: Vec<PartitionTxId>,
    ) -> std::result::Result<(), MetaStatus>;

    async fn list_partitions(
        &self,
        fs_id: FsId,
    ) -> std::result::Result<Vec<PartitionInfo>, MetaStatus>;

    async fn get_copyset_leader(
        &self,
        pool_id: PoolId,
        copyset_id: CopysetId,
    ) -> std::result::Result<NodeId, MetaStatus>;
}
