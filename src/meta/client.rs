//! Typed metadata operations. Every call goes through the task executor for
//! routing, retry, and apply-index bookkeeping; this layer owns request
//! shaping (tx-id stamping, partition grouping, stream assembly).

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::meta::cache::MetaCache;
use crate::meta::executor::{TaskContext, TaskExecutor};
use crate::meta::types::{
    ChunkInfoMap, Dentry, Inode, InodeAttr, InodeId, InodeParam, MetaStatus, PartitionId, TxId,
    UpdateInodeRequest, Xattr,
};
use crate::rpc::{MetaService, RequestContext};

const BATCH_LIMIT: usize = 128;

pub type Result<T> = std::result::Result<T, MetaStatus>;

pub struct MetaClient {
    service: Arc<dyn MetaService>,
    executor: Arc<TaskExecutor>,
}

impl MetaClient {
    pub fn new(service: Arc<dyn MetaService>, executor: Arc<TaskExecutor>) -> Arc<Self> {
        Arc::new(Self { service, executor })
    }

    pub fn cache(&self) -> &Arc<MetaCache> {
        self.executor.cache()
    }

    pub async fn get_tx_id(&self, inode_id: InodeId) -> Result<(PartitionId, TxId)> {
        self.cache().get_tx_id(inode_id).await
    }

    pub fn set_tx_id(&self, partition_id: PartitionId, tx_id: TxId) {
        self.cache().set_tx_id(partition_id, tx_id);
    }

    // ---- inode ----

    pub async fn create_inode(&self, param: InodeParam) -> Result<Inode> {
        let target = self.cache().select_create_target().await?;
        let service = Arc::clone(&self.service);
        self.executor
            .execute(
                TaskContext::routed("CreateInode", target.partition_id),
                move |ctx| {
                    let service = Arc::clone(&service);
                    let param = param.clone();
                    async move { service.create_inode(ctx, param).await }
                },
            )
            .await
    }

    /// Fetch an inode; when the server elects to stream its chunk metadata,
    /// assemble the map from the frame stream before returning.
    pub async fn get_inode(&self, inode_id: InodeId) -> Result<Inode> {
        let service = Arc::clone(&self.service);
        let body = self
            .executor
            .execute(TaskContext::dispatch("GetInode", inode_id), move |ctx| {
                let service = Arc::clone(&service);
                async move { service.get_inode(ctx, inode_id, true).await }
            })
            .await?;

        let mut inode = body.inode;
        if body.streaming {
            debug!(inode_id, "chunk metadata oversized, fetching via stream");
            inode.chunk_map = self.fetch_chunk_map_streamed(inode_id).await?;
        }
        Ok(inode)
    }

    async fn fetch_chunk_map_streamed(&self, inode_id: InodeId) -> Result<ChunkInfoMap> {
        let target = self.cache().resolve(inode_id).await?;
        let ctx = RequestContext {
            pool_id: target.pool_id,
            copyset_id: target.copyset_id,
            partition_id: target.partition_id,
            fs_id: self.cache().fs_id(),
            tx_id: target.tx_id,
            applied_index: self.cache().get_apply_index(target.copyset_id),
            leader: target.leader,
        };
        let mut stream = self
            .service
            .stream_chunk_info(ctx, inode_id)
            .await
            .map_err(|e| {
                warn!(inode_id, "chunk-info stream failed to open: {e}");
                MetaStatus::RpcStreamError
            })?;

        let mut map = ChunkInfoMap::new();
        while let Some((index, list)) = stream.recv().await? {
            map.entry(index).or_default().merge(&list);
        }
        Ok(map)
    }

    pub async fn update_inode(&self, req: UpdateInodeRequest) -> Result<()> {
        let inode_id = req.attr.inode_id;
        let service = Arc::clone(&self.service);
        self.executor
            .execute(TaskContext::dispatch("UpdateInode", inode_id), move |ctx| {
                let service = Arc::clone(&service);
                let req = req.clone();
                async move { service.update_inode(ctx, req).await }
            })
            .await
    }

    pub async fn delete_inode(&self, inode_id: InodeId) -> Result<()> {
        let service = Arc::clone(&self.service);
        self.executor
            .execute(TaskContext::dispatch("DeleteInode", inode_id), move |ctx| {
                let service = Arc::clone(&service);
                async move { service.delete_inode(ctx, inode_id).await }
            })
            .await
    }

    pub async fn get_inode_attr(&self, inode_id: InodeId) -> Result<InodeAttr> {
        let attrs = self.batch_get_inode_attr(vec![inode_id]).await?;
        attrs.into_iter().next().ok_or(MetaStatus::NotFound)
    }

    pub async fn batch_get_inode_attr(&self, inode_ids: Vec<InodeId>) -> Result<Vec<InodeAttr>> {
        let groups = self.group_by_partition(inode_ids).await?;
        let mut out = Vec::new();
        for (partition_id, ids) in groups {
            for chunk in ids.chunks(BATCH_LIMIT) {
                let service = Arc::clone(&self.service);
                let ids = chunk.to_vec();
                let mut attrs = self
                    .executor
                    .execute(
                        TaskContext::routed("BatchGetInodeAttr", partition_id),
                        move |ctx| {
                            let service = Arc::clone(&service);
                            let ids = ids.clone();
                            async move { service.batch_get_inode_attr(ctx, ids).await }
                        },
                    )
                    .await?;
                out.append(&mut attrs);
            }
        }
        Ok(out)
    }

    pub async fn batch_get_xattr(&self, inode_ids: Vec<InodeId>) -> Result<Vec<Xattr>> {
        let groups = self.group_by_partition(inode_ids).await?;
        let mut out = Vec::new();
        for (partition_id, ids) in groups {
            for chunk in ids.chunks(BATCH_LIMIT) {
                let service = Arc::clone(&self.service);
                let ids = chunk.to_vec();
                let mut xattrs = self
                    .executor
                    .execute(
                        TaskContext::routed("BatchGetXattr", partition_id),
                        move |ctx| {
                            let service = Arc::clone(&service);
                            let ids = ids.clone();
                            async move { service.batch_get_xattr(ctx, ids).await }
                        },
                    )
                    .await?;
                out.append(&mut xattrs);
            }
        }
        Ok(out)
    }

    async fn group_by_partition(
        &self,
        inode_ids: Vec<InodeId>,
    ) -> Result<HashMap<PartitionId, Vec<InodeId>>> {
        let mut groups: HashMap<PartitionId, Vec<InodeId>> = HashMap::new();
        for inode_id in inode_ids {
            let partition_id = self.cache().partition_of(inode_id).await?;
            groups.entry(partition_id).or_default().push(inode_id);
        }
        Ok(groups)
    }

    // ---- dentry ----

    /// Create a dentry; the partition's current tx id is stamped at dispatch
    /// time so retries pick up refreshed values.
    pub async fn create_dentry(&self, dentry: Dentry) -> Result<()> {
        let parent = dentry.parent_inode_id;
        let service = Arc::clone(&self.service);
        self.executor
            .execute(TaskContext::dispatch("CreateDentry", parent), move |ctx| {
                let service = Arc::clone(&service);
                let mut dentry = dentry.clone();
                dentry.tx_id = ctx.tx_id;
                async move { service.create_dentry(ctx, dentry).await }
            })
            .await
    }

    pub async fn get_dentry(&self, parent: InodeId, name: &str) -> Result<Dentry> {
        let service = Arc::clone(&self.service);
        let name = name.to_string();
        self.executor
            .execute(TaskContext::dispatch("GetDentry", parent), move |ctx| {
                let service = Arc::clone(&service);
                let name = name.clone();
                async move { service.get_dentry(ctx, parent, name).await }
            })
            .await
    }

    pub async fn delete_dentry(&self, parent: InodeId, name: &str) -> Result<()> {
        let service = Arc::clone(&self.service);
        let name = name.to_string();
        self.executor
            .execute(TaskContext::dispatch("DeleteDentry", parent), move |ctx| {
                let service = Arc::clone(&service);
                let name = name.clone();
                async move { service.delete_dentry(ctx, parent, name).await }
            })
            .await
    }

    pub async fn list_dentry(
        &self,
        parent: InodeId,
        last: Option<String>,
        count: u32,
        only_dir: bool,
    ) -> Result<Vec<Dentry>> {
        let service = Arc::clone(&self.service);
        self.executor
            .execute(TaskContext::dispatch("ListDentry", parent), move |ctx| {
                let service = Arc::clone(&service);
                let last = last.clone();
                async move {
                    service
                        .list_dentry(ctx, parent, last, count, only_dir)
                        .await
                }
            })
            .await
    }

    /// Stage prepared dentries on one partition. The prepare tx id (current
    /// partition tx + 1) is stamped at dispatch time, so a stale-tx reply
    /// retries with a fresh stamp. Rename sub-steps may run in parallel when
    /// the option allows it.
    pub async fn prepare_rename_tx(
        &self,
        partition_id: PartitionId,
        dentries: Vec<Dentry>,
    ) -> Result<TxId> {
        let service = Arc::clone(&self.service);
        let stamped = Arc::new(std::sync::Mutex::new(0));
        let stamped_out = Arc::clone(&stamped);
        self.executor
            .execute(
                TaskContext::routed("PrepareRenameTx", partition_id).with_rename_parallel(true),
                move |ctx| {
                    let service = Arc::clone(&service);
                    let mut dentries = dentries.clone();
                    let tx_id = ctx.tx_id + 1;
                    for dentry in &mut dentries {
                        dentry.tx_id = tx_id;
                    }
                    *stamped.lock().unwrap() = tx_id;
                    async move { service.prepare_rename_tx(ctx, dentries).await }
                },
            )
            .await?;
        let tx_id = *stamped_out.lock().unwrap();
        Ok(tx_id)
    }

    // ---- chunk info ----

    /// Ship chunk-info deltas and optionally read back the full map.
    pub async fn get_or_modify_chunk_info(
        &self,
        inode_id: InodeId,
        add: ChunkInfoMap,
        remove: ChunkInfoMap,
        return_map: bool,
    ) -> Result<ChunkInfoMap> {
        let service = Arc::clone(&self.service);
        let reply = self
            .executor
            .execute(
                TaskContext::dispatch("GetOrModifyChunkInfo", inode_id),
                move |ctx| {
                    let service = Arc::clone(&service);
                    let add = add.clone();
                    let remove = remove.clone();
                    async move {
                        service
                            .get_or_modify_chunk_info(ctx, inode_id, add, remove, return_map, true)
                            .await
                    }
                },
            )
            .await?;

        if return_map && reply.streaming {
            return self.fetch_chunk_map_streamed(inode_id).await;
        }
        Ok(reply.map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ChunkLayout;
    use crate::meta::executor::ExecutorOptions;
    use crate::meta::types::{
        ChunkInfo, ChunkInfoList, DentryFlags, FileType, FsInfo, PartitionInfo, PartitionStatus,
    };
    use crate::rpc::router::LocalCluster;
    use crate::storage::{StorageEngine, StorageOptions};
    use std::time::Duration;

    async fn client() -> (Arc<MetaClient>, LocalCluster) {
        let cluster = LocalCluster::new(
            StorageEngine::new(StorageOptions::default()),
            None,
            ChunkLayout::default(),
            Duration::from_secs(1),
        );
        cluster.mapping.register_fs(
            FsInfo {
                fs_id: 100,
                fs_name: "fs".into(),
                block_size: 4096,
                capacity: 0,
                enable_sum_in_dir: false,
                mount_points: Vec::new(),
            },
            vec![
                PartitionInfo {
                    pool_id: 1,
                    copyset_id: 1,
                    partition_id: 1,
                    fs_id: 100,
                    start: 1,
                    end: 1 << 20,
                    tx_id: 0,
                    status: PartitionStatus::ReadWrite,
                    next_id: 1,
                },
                PartitionInfo {
                    pool_id: 1,
                    copyset_id: 2,
                    partition_id: 2,
                    fs_id: 100,
                    start: 1 << 20,
                    end: 2 << 20,
                    tx_id: 0,
                    status: PartitionStatus::ReadWrite,
                    next_id: 1 << 20,
                },
            ],
        );
        let cache = MetaCache::new(Arc::clone(&cluster.mapping) as _);
        cache.set_fs_id(100);
        let executor = TaskExecutor::new(ExecutorOptions::default(), cache);
        let client = MetaClient::new(Arc::clone(&cluster.meta) as _, executor);
        (client, cluster)
    }

    fn file_param() -> InodeParam {
        InodeParam {
            fs_id: 100,
            length: 0,
            mode: 0o644,
            uid: 0,
            gid: 0,
            file_type: FileType::Regular,
            rdev: 0,
            symlink_target: None,
            parent: 1,
        }
    }

    #[tokio::test]
    async fn test_inode_lifecycle() {
        let (client, _cluster) = client().await;

        let inode = client.create_inode(file_param()).await.unwrap();
        let fetched = client.get_inode(inode.inode_id).await.unwrap();
        assert_eq!(fetched.mode, 0o644);

        let mut req = UpdateInodeRequest::from_inode(&fetched);
        req.attr.length = 9000;
        client.update_inode(req).await.unwrap();
        assert_eq!(client.get_inode(inode.inode_id).await.unwrap().length, 9000);

        client.delete_inode(inode.inode_id).await.unwrap();
        assert_eq!(
            client.get_inode(inode.inode_id).await.unwrap_err(),
            MetaStatus::NotFound
        );
    }

    #[tokio::test]
    async fn test_dentry_roundtrip_and_tx_stamping() {
        let (client, _cluster) = client().await;
        let inode = client.create_inode(file_param()).await.unwrap();

        client
            .create_dentry(Dentry {
                fs_id: 100,
                parent_inode_id: 1,
                name: "hello".into(),
                tx_id: 999, // overwritten at dispatch
                inode_id: inode.inode_id,
                flags: DentryFlags::FILE_TYPE,
            })
            .await
            .unwrap();

        let dentry = client.get_dentry(1, "hello").await.unwrap();
        assert_eq!(dentry.inode_id, inode.inode_id);
        assert_eq!(dentry.tx_id, 0, "stamped with the partition tx id");

        let listed = client.list_dentry(1, None, 0, false).await.unwrap();
        assert_eq!(listed.len(), 1);

        client.delete_dentry(1, "hello").await.unwrap();
        assert_eq!(
            client.get_dentry(1, "hello").await.unwrap_err(),
            MetaStatus::NotFound
        );
    }

    #[tokio::test]
    async fn test_streamed_chunk_map_assembly() {
        let (client, _cluster) = client().await;
        let inode = client.create_inode(file_param()).await.unwrap();

        let mut add = ChunkInfoMap::new();
        for index in 0..2048u64 {
            add.insert(
                index,
                ChunkInfoList::new(vec![ChunkInfo {
                    chunk_id: index + 1,
                    offset: 0,
                    len: 64,
                    size: 64,
                    zero: false,
                }]),
            );
        }
        client
            .get_or_modify_chunk_info(inode.inode_id, add, ChunkInfoMap::new(), false)
            .await
            .unwrap();

        let fetched = client.get_inode(inode.inode_id).await.unwrap();
        assert_eq!(fetched.chunk_map.len(), 2048);

        let map = client
            .get_or_modify_chunk_info(
                inode.inode_id,
                ChunkInfoMap::new(),
                ChunkInfoMap::new(),
                true,
            )
            .await
            .unwrap();
        assert_eq!(map.len(), 2048);
    }

    #[tokio::test]
    async fn test_batch_attr_groups_by_partition() {
        let (client, _cluster) = client().await;
        let a = client.create_inode(file_param()).await.unwrap();
        let b = client.create_inode(file_param()).await.unwrap();

        let attrs = client
            .batch_get_inode_attr(vec![a.inode_id, b.inode_id])
            .await
            .unwrap();
        assert_eq!(attrs.len(), 2);
    }
}
