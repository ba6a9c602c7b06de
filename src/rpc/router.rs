//! In-process service implementations: requests are delivered straight to a
//! `MetaStore` and a mapping state table. This is what the single-process
//! binary and the tests run against; a networked deployment swaps these for
//! transport-backed clients without touching the core.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use async_trait::async_trait;

use crate::data::object::ObjectAdapter;
use crate::data::ChunkLayout;
use crate::meta::types::{
    ChunkInfoMap, CopysetId, Dentry, FsId, FsInfo, Inode, InodeAttr, InodeId, InodeParam,
    MetaStatus, PartitionId, PartitionInfo, PartitionTxId, PoolId, TxId, UpdateInodeRequest, Xattr,
};
use crate::rpc::stream::{self, ChunkInfoStream};
use crate::rpc::{
    ChunkInfoReply, GetInodeBody, MappingService, MetaService, NodeId, Reply, RequestContext,
    RpcError, RpcResult,
};
use crate::server::metastore::MetaStore;
use crate::server::partition::Partition;
use crate::server::trash::{TrashCollector, TrashItem};

pub struct LocalMetaService {
    store: Arc<MetaStore>,
    stream_idle: Duration,
}

impl LocalMetaService {
    pub fn new(store: Arc<MetaStore>, stream_idle: Duration) -> Arc<Self> {
        Arc::new(Self { store, stream_idle })
    }

    fn partition(
        &self,
        ctx: &RequestContext,
    ) -> Result<Arc<Partition>, MetaStatus> {
        self.store.get_partition(ctx.partition_id)
    }

    fn read_reply<T>(&self, ctx: &RequestContext, body: T) -> Reply<T> {
        Reply::ok(self.store.current_apply_index(ctx.copyset_id), body)
    }

    fn write_reply<T>(&self, ctx: &RequestContext, body: T) -> Reply<T> {
        Reply::ok(self.store.bump_apply_index(ctx.copyset_id), body)
    }
}

#[async_trait]
impl MetaService for LocalMetaService {
    async fn create_inode(&self, ctx: RequestContext, param: InodeParam) -> RpcResult<Inode> {
        match self.partition(&ctx).and_then(|p| p.create_inode(&param)) {
            Ok(inode) => Ok(self.write_reply(&ctx, inode)),
            Err(status) => Ok(Reply::status(status)),
        }
    }

    async fn get_inode(
        &self,
        ctx: RequestContext,
        inode_id: InodeId,
        support_streaming: bool,
    ) -> RpcResult<GetInodeBody> {
        let partition = match self.partition(&ctx) {
            Ok(p) => p,
            Err(status) => return Ok(Reply::status(status)),
        };
        let mut inode = match partition.get_inode(ctx.fs_id, inode_id) {
            Ok(inode) => inode,
            Err(status) => return Ok(Reply::status(status)),
        };

        // Pad the chunk map exactly once: inline within the limit, or not at
        // all when the caller can stream the remainder.
        let limit = if support_streaming {
            self.store.chunk_meta_limit
        } else {
            0
        };
        let streaming = match partition.padding_chunk_info(inode_id, &mut inode.chunk_map, limit) {
            Ok(()) => false,
            Err(MetaStatus::ChunkMetaTooLarge) if support_streaming => {
                inode.chunk_map.clear();
                true
            }
            Err(status) => return Ok(Reply::status(status)),
        };
        Ok(self.read_reply(&ctx, GetInodeBody { inode, streaming }))
    }

    async fn update_inode(&self, ctx: RequestContext, req: UpdateInodeRequest) -> RpcResult<()> {
        match self.partition(&ctx).and_then(|p| p.update_inode(&req)) {
            Ok(()) => Ok(self.write_reply(&ctx, ())),
            Err(status) => Ok(Reply::status(status)),
        }
    }

    async fn delete_inode(&self, ctx: RequestContext, inode_id: InodeId) -> RpcResult<()> {
        let partition = match self.partition(&ctx) {
            Ok(p) => p,
            Err(status) => return Ok(Reply::status(status)),
        };
        match partition.delete_inode(ctx.fs_id, inode_id) {
            Ok(chunks) => {
                self.store.trash().enqueue(TrashItem {
                    fs_id: ctx.fs_id,
                    inode_id,
                    chunks,
                });
                Ok(self.write_reply(&ctx, ()))
            }
            Err(status) => Ok(Reply::status(status)),
        }
    }

    async fn batch_get_inode_attr(
        &self,
        ctx: RequestContext,
        inode_ids: Vec<InodeId>,
    ) -> RpcResult<Vec<InodeAttr>> {
        let partition = match self.partition(&ctx) {
            Ok(p) => p,
            Err(status) => return Ok(Reply::status(status)),
        };
        let mut attrs = Vec::with_capacity(inode_ids.len());
        for id in inode_ids {
            match partition.get_inode_attr(ctx.fs_id, id) {
                Ok(attr) => attrs.push(attr),
                Err(status) => return Ok(Reply::status(status)),
            }
        }
        Ok(self.read_reply(&ctx, attrs))
    }

    async fn batch_get_xattr(
        &self,
        ctx: RequestContext,
        inode_ids: Vec<InodeId>,
    ) -> RpcResult<Vec<Xattr>> {
        let partition = match self.partition(&ctx) {
            Ok(p) => p,
            Err(status) => return Ok(Reply::status(status)),
        };
        let mut xattrs = Vec::with_capacity(inode_ids.len());
        for id in inode_ids {
            match partition.get_xattr(ctx.fs_id, id) {
                Ok(xattr) => xattrs.push(xattr),
                Err(status) => return Ok(Reply::status(status)),
            }
        }
        Ok(self.read_reply(&ctx, xattrs))
    }

    async fn create_dentry(&self, ctx: RequestContext, dentry: Dentry) -> RpcResult<()> {
        match self.partition(&ctx).and_then(|p| p.create_dentry(&dentry)) {
            Ok(()) => Ok(self.write_reply(&ctx, ())),
            Err(status) => Ok(Reply::status(status)),
        }
    }

    async fn get_dentry(
        &self,
        ctx: RequestContext,
        parent: InodeId,
        name: String,
    ) -> RpcResult<Dentry> {
        match self
            .partition(&ctx)
            .and_then(|p| p.get_dentry(ctx.fs_id, parent, &name, ctx.tx_id))
        {
            Ok(dentry) => Ok(self.read_reply(&ctx, dentry)),
            Err(status) => Ok(Reply::status(status)),
        }
    }

    async fn delete_dentry(
        &self,
        ctx: RequestContext,
        parent: InodeId,
        name: String,
    ) -> RpcResult<()> {
        match self
            .partition(&ctx)
            .and_then(|p| p.delete_dentry(ctx.fs_id, parent, &name, ctx.tx_id))
        {
            Ok(()) => Ok(self.write_reply(&ctx, ())),
            Err(status) => Ok(Reply::status(status)),
        }
    }

    async fn list_dentry(
        &self,
        ctx: RequestContext,
        parent: InodeId,
        last: Option<String>,
        count: u32,
        only_dir: bool,
    ) -> RpcResult<Vec<Dentry>> {
        match self.partition(&ctx).and_then(|p| {
            p.list_dentry(
                ctx.fs_id,
                parent,
                last.as_deref(),
                count,
                only_dir,
                ctx.tx_id,
            )
        }) {
            Ok(dentries) => Ok(self.read_reply(&ctx, dentries)),
            Err(status) => Ok(Reply::status(status)),
        }
    }

    async fn prepare_rename_tx(
        &self,
        ctx: RequestContext,
        dentries: Vec<Dentry>,
    ) -> RpcResult<()> {
        let partition = match self.partition(&ctx) {
            Ok(p) => p,
            Err(status) => return Ok(Reply::status(status)),
        };
        match partition.handle_rename_tx(&dentries) {
            Ok(()) => Ok(self.write_reply(&ctx, ())),
            // Carry the committed tx so the caller can restamp and retry.
            Err(MetaStatus::StaleTx) => Ok(Reply::stale_tx(partition.tx_id())),
            Err(status) => Ok(Reply::status(status)),
        }
    }

    async fn get_or_modify_chunk_info(
        &self,
        ctx: RequestContext,
        inode_id: InodeId,
        add: ChunkInfoMap,
        remove: ChunkInfoMap,
        return_map: bool,
        support_streaming: bool,
    ) -> RpcResult<ChunkInfoReply> {
        let partition = match self.partition(&ctx) {
            Ok(p) => p,
            Err(status) => return Ok(Reply::status(status)),
        };

        let mutated = !add.is_empty() || !remove.is_empty();
        if mutated {
            if let Err(status) =
                partition.modify_chunk_info_list(ctx.fs_id, inode_id, &add, &remove)
            {
                return Ok(Reply::status(status));
            }
        }

        let mut map = ChunkInfoMap::new();
        let mut streaming = false;
        if return_map {
            if support_streaming {
                // The caller opens the stream; nothing is padded inline.
                streaming = true;
            } else if let Err(status) = partition.padding_chunk_info(inode_id, &mut map, 0) {
                return Ok(Reply::status(status));
            }
        }

        let reply = ChunkInfoReply { map, streaming };
        if mutated {
            Ok(self.write_reply(&ctx, reply))
        } else {
            Ok(self.read_reply(&ctx, reply))
        }
    }

    async fn stream_chunk_info(
        &self,
        ctx: RequestContext,
        inode_id: InodeId,
    ) -> Result<ChunkInfoStream, RpcError> {
        let partition = self
            .partition(&ctx)
            .map_err(|s| RpcError::Transport(format!("open stream: {s}")))?;
        let lists = partition
            .chunk_info_lists(inode_id)
            .map_err(|s| RpcError::Transport(format!("open stream: {s}")))?;

        let (sender, receiver) = stream::channel(self.stream_idle);
        crate::task::spawn_named("chunk-info-stream", async move {
            for (index, list) in lists {
                if sender.send(index, list).await.is_err() {
                    return;
                }
            }
            let _ = sender.finish().await;
        });
        Ok(receiver)
    }
}

struct MappingState {
    fs_infos: HashMap<String, FsInfo>,
    tx_ids: HashMap<PartitionId, TxId>,
    leaders: HashMap<(PoolId, CopysetId), NodeId>,
}

/// In-process mapping service. `commit_tx` applies its batch under one lock,
/// which is the linearization point cross-partition renames rely on.
pub struct LocalMappingService {
    state: Mutex<MappingState>,
    store: Arc<MetaStore>,
    next_chunk_id: AtomicU64,
}

impl LocalMappingService {
    pub fn new(store: Arc<MetaStore>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MappingState {
                fs_infos: HashMap::new(),
                tx_ids: HashMap::new(),
                leaders: HashMap::new(),
            }),
            store,
            next_chunk_id: AtomicU64::new(1),
        })
    }

    pub fn register_fs(&self, info: FsInfo, partitions: Vec<PartitionInfo>) {
        let mut state = self.state.lock().unwrap();
        for partition in &partitions {
            state.tx_ids.insert(partition.partition_id, partition.tx_id);
            state
                .leaders
                .entry((partition.pool_id, partition.copyset_id))
                .or_insert(1);
            self.store
                .create_partition(partition.clone())
                .expect("create_partition is idempotent");
        }
        state.fs_infos.insert(info.fs_name.clone(), info);
    }

    pub fn set_leader(&self, pool_id: PoolId, copyset_id: CopysetId, leader: NodeId) {
        self.state
            .lock()
            .unwrap()
            .leaders
            .insert((pool_id, copyset_id), leader);
    }
}

#[async_trait]
impl MappingService for LocalMappingService {
    async fn mount_fs(&self, fs_name: &str, mountpoint: &str) -> Result<FsInfo, MetaStatus> {
        let mut state = self.state.lock().unwrap();
        let info = state
            .fs_infos
            .get_mut(fs_name)
            .ok_or(MetaStatus::NotFound)?;
        if info.mount_points.iter().any(|m| m == mountpoint) {
            return Err(MetaStatus::MountPointExist);
        }
        info.mount_points.push(mountpoint.to_string());
        info!(fs_name, mountpoint, "mounted filesystem");
        Ok(info.clone())
    }

    async fn umount_fs(&self, fs_name: &str, mountpoint: &str) -> Result<(), MetaStatus> {
        let mut state = self.state.lock().unwrap();
        let info = state
            .fs_infos
            .get_mut(fs_name)
            .ok_or(MetaStatus::NotFound)?;
        let before = info.mount_points.len();
        info.mount_points.retain(|m| m != mountpoint);
        if info.mount_points.len() == before {
            return Err(MetaStatus::NotFound);
        }
        info!(fs_name, mountpoint, "unmounted filesystem");
        Ok(())
    }

    async fn get_fs_info(&self, fs_name: &str) -> Result<FsInfo, MetaStatus> {
        self.state
            .lock()
            .unwrap()
            .fs_infos
            .get(fs_name)
            .cloned()
            .ok_or(MetaStatus::NotFound)
    }

    async fn allocate_chunk_id(&self, _fs_id: FsId, count: u32) -> Result<u64, MetaStatus> {
        if count == 0 {
            return Err(MetaStatus::InvalidParam);
        }
        Ok(self
            .next_chunk_id
            .fetch_add(u64::from(count), Ordering::SeqCst))
    }

    async fn get_latest_tx_id(&self, fs_id: FsId) -> Result<Vec<PartitionTxId>, MetaStatus> {
        let state = self.state.lock().unwrap();
        let mut out = Vec::new();
        for info in self.store.partition_list() {
            if info.fs_id != fs_id {
                continue;
            }
            let tx_id = state.tx_ids.get(&info.partition_id).copied().unwrap_or(0);
            out.push(PartitionTxId {
                partition_id: info.partition_id,
                tx_id,
            });
        }
        Ok(out)
    }

    async fn commit_tx(&self, _fs_id: FsId, tx_ids: Vec<PartitionTxId>) -> Result<(), MetaStatus> {
        if tx_ids.is_empty() {
            return Err(MetaStatus::InvalidParam);
        }
        let mut state = self.state.lock().unwrap();
        // Validate the whole batch before applying any of it.
        for entry in &tx_ids {
            let current = state
                .tx_ids
                .get(&entry.partition_id)
                .copied()
                .ok_or(MetaStatus::PartitionNotFound)?;
            if entry.tx_id != current + 1 {
                debug!(
                    partition = entry.partition_id,
                    proposed = entry.tx_id,
                    current,
                    "commit_tx lost the race"
                );
                return Err(MetaStatus::StaleTx);
            }
        }
        for entry in &tx_ids {
            state.tx_ids.insert(entry.partition_id, entry.tx_id);
            // Push the committed tx down to the partition; in a networked
            // deployment this rides the heartbeat instead.
            if let Ok(partition) = self.store.get_partition(entry.partition_id) {
                partition.set_tx_id(entry.tx_id);
            }
        }
        Ok(())
    }

    async fn list_partitions(&self, fs_id: FsId) -> Result<Vec<PartitionInfo>, MetaStatus> {
        let state = self.state.lock().unwrap();
        let mut out: Vec<PartitionInfo> = self
            .store
            .partition_list()
            .into_iter()
            .filter(|p| p.fs_id == fs_id)
            .collect();
        for info in &mut out {
            if let Some(tx) = state.tx_ids.get(&info.partition_id) {
                info.tx_id = *tx;
            }
        }
        if out.is_empty() {
            return Err(MetaStatus::NotFound);
        }
        Ok(out)
    }

    async fn get_copyset_leader(
        &self,
        pool_id: PoolId,
        copyset_id: CopysetId,
    ) -> Result<NodeId, MetaStatus> {
        self.state
            .lock()
            .unwrap()
            .leaders
            .get(&(pool_id, copyset_id))
            .copied()
            .ok_or(MetaStatus::NotFound)
    }
}

/// Everything a single-process deployment needs: engine, metastore, trash
/// collector, and the two services wired to them.
pub struct LocalCluster {
    pub meta: Arc<LocalMetaService>,
    pub mapping: Arc<LocalMappingService>,
    pub store: Arc<MetaStore>,
    pub shutdown: CancellationToken,
    trash_worker: Option<JoinHandle<()>>,
}

impl LocalCluster {
    pub fn new(
        engine: Arc<crate::storage::StorageEngine>,
        objects: Option<ObjectAdapter>,
        layout: ChunkLayout,
        stream_idle: Duration,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let (trash, trash_worker) = TrashCollector::start(objects, layout, shutdown.clone());
        let store = MetaStore::new(engine, trash);
        let meta = LocalMetaService::new(Arc::clone(&store), stream_idle);
        let mapping = LocalMappingService::new(Arc::clone(&store));
        Self {
            meta,
            mapping,
            store,
            shutdown,
            trash_worker: Some(trash_worker),
        }
    }

    /// Create the root directory inode on a fresh filesystem. Idempotent.
    pub fn ensure_root(&self, fs_id: FsId) -> Result<(), MetaStatus> {
        use crate::meta::types::{FileType, InodeParam, ROOT_INODE_ID};

        let owner = self
            .store
            .partition_list()
            .into_iter()
            .find(|p| p.fs_id == fs_id && p.owns(ROOT_INODE_ID))
            .ok_or(MetaStatus::PartitionNotFound)?;
        let partition = self.store.get_partition(owner.partition_id)?;
        match partition.get_inode(fs_id, ROOT_INODE_ID) {
            Ok(_) => return Ok(()),
            Err(MetaStatus::NotFound) => {}
            Err(status) => return Err(status),
        }
        let root = partition.create_inode(&InodeParam {
            fs_id,
            length: 4096,
            mode: 0o755,
            uid: 0,
            gid: 0,
            file_type: FileType::Directory,
            rdev: 0,
            symlink_target: None,
            parent: 0,
        })?;
        if root.inode_id != ROOT_INODE_ID {
            return Err(MetaStatus::Internal);
        }
        Ok(())
    }

    pub async fn stop(mut self) {
        self.shutdown.cancel();
        if let Some(worker) = self.trash_worker.take() {
            let _ = worker.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::types::PartitionStatus;
    use crate::storage::{StorageEngine, StorageOptions};

    fn cluster() -> LocalCluster {
        LocalCluster::new(
            StorageEngine::new(StorageOptions::default()),
            None,
            ChunkLayout::default(),
            Duration::from_secs(1),
        )
    }

    fn fs_info() -> FsInfo {
        FsInfo {
            fs_id: 100,
            fs_name: "testfs".into(),
            block_size: 4096,
            capacity: 1 << 40,
            enable_sum_in_dir: false,
            mount_points: Vec::new(),
        }
    }

    fn partition_info(id: u32, start: u64) -> PartitionInfo {
        PartitionInfo {
            pool_id: 1,
            copyset_id: id,
            partition_id: id,
            fs_id: 100,
            start,
            end: start + (1 << 20),
            tx_id: 0,
            status: PartitionStatus::ReadWrite,
            next_id: start,
        }
    }

    fn ctx(partition_id: u32) -> RequestContext {
        RequestContext {
            pool_id: 1,
            copyset_id: partition_id,
            partition_id,
            fs_id: 100,
            tx_id: 0,
            applied_index: 0,
            leader: 1,
        }
    }

    #[tokio::test]
    async fn test_mount_and_remount() {
        let cluster = cluster();
        cluster
            .mapping
            .register_fs(fs_info(), vec![partition_info(1, 1)]);

        let info = cluster.mapping.mount_fs("testfs", "host:1:/mnt").await.unwrap();
        assert_eq!(info.fs_id, 100);
        assert_eq!(
            cluster
                .mapping
                .mount_fs("testfs", "host:1:/mnt")
                .await
                .unwrap_err(),
            MetaStatus::MountPointExist
        );
        cluster.mapping.umount_fs("testfs", "host:1:/mnt").await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_tx_batch_is_atomic() {
        let cluster = cluster();
        cluster.mapping.register_fs(
            fs_info(),
            vec![partition_info(1, 1), partition_info(2, 1 << 21)],
        );

        cluster
            .mapping
            .commit_tx(
                100,
                vec![
                    PartitionTxId {
                        partition_id: 1,
                        tx_id: 1,
                    },
                    PartitionTxId {
                        partition_id: 2,
                        tx_id: 1,
                    },
                ],
            )
            .await
            .unwrap();

        // A stale proposal for partition 2 rejects the whole batch: the good
        // entry for partition 1 must not be applied.
        assert_eq!(
            cluster
                .mapping
                .commit_tx(
                    100,
                    vec![
                        PartitionTxId {
                            partition_id: 1,
                            tx_id: 2,
                        },
                        PartitionTxId {
                            partition_id: 2,
                            tx_id: 1,
                        },
                    ],
                )
                .await
                .unwrap_err(),
            MetaStatus::StaleTx
        );
        let latest = cluster.mapping.get_latest_tx_id(100).await.unwrap();
        for entry in latest {
            assert_eq!(entry.tx_id, 1, "partition {}", entry.partition_id);
        }
    }

    #[tokio::test]
    async fn test_write_ops_advance_apply_index() {
        let cluster = cluster();
        cluster
            .mapping
            .register_fs(fs_info(), vec![partition_info(1, 1)]);

        let param = InodeParam {
            fs_id: 100,
            length: 0,
            mode: 0o644,
            uid: 0,
            gid: 0,
            file_type: crate::meta::types::FileType::Regular,
            rdev: 0,
            symlink_target: None,
            parent: 1,
        };
        let first = cluster.meta.create_inode(ctx(1), param.clone()).await.unwrap();
        let second = cluster.meta.create_inode(ctx(1), param).await.unwrap();
        assert!(second.applied_index.unwrap() > first.applied_index.unwrap());

        let read = cluster
            .meta
            .get_inode(ctx(1), first.body.as_ref().unwrap().inode_id, true)
            .await
            .unwrap();
        assert_eq!(read.applied_index, second.applied_index);
        assert!(!read.body.unwrap().streaming);
    }

    #[tokio::test]
    async fn test_streaming_decision_and_frames() {
        let cluster = cluster();
        cluster
            .mapping
            .register_fs(fs_info(), vec![partition_info(1, 1)]);

        let inode = cluster
            .meta
            .create_inode(
                ctx(1),
                InodeParam {
                    fs_id: 100,
                    length: 0,
                    mode: 0o644,
                    uid: 0,
                    gid: 0,
                    file_type: crate::meta::types::FileType::Regular,
                    rdev: 0,
                    symlink_target: None,
                    parent: 1,
                },
            )
            .await
            .unwrap()
            .body
            .unwrap();

        // Enough entries to blow past the inline padding limit.
        let mut add = ChunkInfoMap::new();
        for index in 0..2048u64 {
            add.insert(
                index,
                crate::meta::types::ChunkInfoList::new(vec![crate::meta::types::ChunkInfo {
                    chunk_id: index + 1,
                    offset: 0,
                    len: 64,
                    size: 64,
                    zero: false,
                }]),
            );
        }
        cluster
            .meta
            .get_or_modify_chunk_info(
                ctx(1),
                inode.inode_id,
                add,
                ChunkInfoMap::new(),
                false,
                true,
            )
            .await
            .unwrap();

        let got = cluster
            .meta
            .get_inode(ctx(1), inode.inode_id, true)
            .await
            .unwrap()
            .body
            .unwrap();
        assert!(got.streaming);
        assert!(got.inode.chunk_map.is_empty());

        let mut stream = cluster
            .meta
            .stream_chunk_info(ctx(1), inode.inode_id)
            .await
            .unwrap();
        let mut frames = 0;
        while let Some((_, list)) = stream.recv().await.unwrap() {
            assert_eq!(list.entries.len(), 1);
            frames += 1;
        }
        assert_eq!(frames, 2048);

        // Without streaming support the same get pads inline.
        let got = cluster
            .meta
            .get_inode(ctx(1), inode.inode_id, false)
            .await
            .unwrap()
            .body
            .unwrap();
        assert!(!got.streaming);
        assert_eq!(got.inode.chunk_map.len(), 2048);
    }
}
