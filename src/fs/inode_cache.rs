//! Client inode cache: per-inode wrappers with the only lock under which
//! inode fields may change, dirty tracking for attribute write-back, and an
//! LRU that never evicts open or dirty inodes.
//!
//! Mutations mark the wrapper dirty and are shipped to the partition by the
//! background flush loop, which coalesces attribute and chunk-info deltas
//! into at most one update per inode per pass. Flush failures keep the state
//! dirty; nothing is dropped.

use dashmap::{DashMap, DashSet};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::meta::client::MetaClient;
use crate::meta::types::{
    ChunkInfoList, ChunkInfoMap, Inode, InodeId, InodeParam, MetaStatus, UpdateInodeRequest,
    now_pair,
};

pub struct InodeState {
    pub inode: Inode,
    pub open_count: u32,
    dirty_attr: bool,
    dirty_chunks: ChunkInfoMap,
    /// Last link went away while the inode was still open; physical delete
    /// happens when the open count drops to zero.
    deferred_delete: bool,
}

impl InodeState {
    pub fn mark_dirty_attr(&mut self) {
        self.dirty_attr = true;
    }

    pub fn add_chunk_delta(&mut self, chunk_index: u64, list: ChunkInfoList) {
        self.dirty_chunks.entry(chunk_index).or_default().merge(&list);
    }

    pub fn has_dirty_chunks(&self) -> bool {
        !self.dirty_chunks.is_empty()
    }

    /// Committed chunk infos for one chunk index with the pending deltas
    /// appended after them; the full overlay order a reader must apply.
    pub fn effective_chunk_list(&self, chunk_index: u64) -> ChunkInfoList {
        let mut list = ChunkInfoList::default();
        if let Some(committed) = self.inode.chunk_map.get(&chunk_index) {
            list.merge(committed);
        }
        if let Some(pending) = self.dirty_chunks.get(&chunk_index) {
            list.merge(pending);
        }
        list
    }
}

pub struct InodeWrapper {
    inode_id: InodeId,
    state: AsyncMutex<InodeState>,
    dirty: AtomicBool,
    open_count: AtomicU32,
}

impl InodeWrapper {
    fn new(inode: Inode) -> Arc<Self> {
        Arc::new(Self {
            inode_id: inode.inode_id,
            state: AsyncMutex::new(InodeState {
                inode,
                open_count: 0,
                dirty_attr: false,
                dirty_chunks: ChunkInfoMap::new(),
                deferred_delete: false,
            }),
            dirty: AtomicBool::new(false),
            open_count: AtomicU32::new(0),
        })
    }

    pub fn inode_id(&self) -> InodeId {
        self.inode_id
    }

    /// The per-inode lock: the only place field updates may happen.
    pub async fn lock(&self) -> MutexGuard<'_, InodeState> {
        self.state.lock().await
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    fn is_pinned(&self) -> bool {
        self.open_count.load(Ordering::Acquire) > 0 || self.is_dirty()
    }

    /// Snapshot of the attributes without waiting on writers.
    pub async fn attr(&self) -> crate::meta::types::InodeAttr {
        self.state.lock().await.inode.attr()
    }
}

pub struct InodeCache {
    meta: Arc<MetaClient>,
    map: DashMap<InodeId, Arc<InodeWrapper>>,
    lru: Mutex<VecDeque<InodeId>>,
    capacity: usize,
    dirty_set: DashSet<InodeId>,
}

impl InodeCache {
    pub fn new(meta: Arc<MetaClient>, capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            meta,
            map: DashMap::new(),
            lru: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            dirty_set: DashSet::new(),
        })
    }

    pub fn meta(&self) -> &Arc<MetaClient> {
        &self.meta
    }

    /// Fetch from cache or the owning partition.
    pub async fn get(&self, inode_id: InodeId) -> Result<Arc<InodeWrapper>, MetaStatus> {
        if let Some(wrapper) = self.map.get(&inode_id) {
            let wrapper = Arc::clone(&wrapper);
            self.touch(inode_id);
            return Ok(wrapper);
        }

        let inode = self.meta.get_inode(inode_id).await?;
        Ok(self.insert(inode))
    }

    pub async fn create_inode(&self, param: InodeParam) -> Result<Arc<InodeWrapper>, MetaStatus> {
        let inode = self.meta.create_inode(param).await?;
        Ok(self.insert(inode))
    }

    fn insert(&self, inode: Inode) -> Arc<InodeWrapper> {
        let inode_id = inode.inode_id;
        let wrapper = self
            .map
            .entry(inode_id)
            .or_insert_with(|| InodeWrapper::new(inode))
            .clone();
        self.touch(inode_id);
        self.evict_over_capacity();
        wrapper
    }

    fn touch(&self, inode_id: InodeId) {
        let mut lru = self.lru.lock().unwrap();
        if let Some(pos) = lru.iter().position(|id| *id == inode_id) {
            lru.remove(pos);
        }
        lru.push_back(inode_id);
    }

    fn evict_over_capacity(&self) {
        while self.map.len() > self.capacity {
            let candidate = {
                let mut lru = self.lru.lock().unwrap();
                let mut picked = None;
                for (pos, id) in lru.iter().enumerate() {
                    let pinned = self
                        .map
                        .get(id)
                        .map(|w| w.is_pinned())
                        .unwrap_or(false);
                    if !pinned {
                        picked = Some((pos, *id));
                        break;
                    }
                }
                match picked {
                    Some((pos, id)) => {
                        lru.remove(pos);
                        Some(id)
                    }
                    None => None,
                }
            };
            match candidate {
                Some(id) => {
                    self.map.remove(&id);
                    debug!(inode = id, "evicted inode from cache");
                }
                // Everything pinned; let the cache run over capacity.
                None => break,
            }
        }
    }

    /// Forcibly drop an inode from the cache (final unlink path).
    pub fn clear(&self, inode_id: InodeId) {
        self.map.remove(&inode_id);
        self.dirty_set.remove(&inode_id);
        let mut lru = self.lru.lock().unwrap();
        if let Some(pos) = lru.iter().position(|id| *id == inode_id) {
            lru.remove(pos);
        }
    }

    /// Queue the wrapper for the next write-back pass.
    pub fn ship_to_flush(&self, wrapper: &Arc<InodeWrapper>) {
        wrapper.dirty.store(true, Ordering::Release);
        self.dirty_set.insert(wrapper.inode_id());
    }

    pub fn open(&self, wrapper: &Arc<InodeWrapper>, state: &mut InodeState) {
        state.open_count += 1;
        wrapper.open_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Close one handle. Returns true when this was the last close of an
    /// unlinked inode and physical deletion ran.
    pub async fn release(&self, wrapper: &Arc<InodeWrapper>) -> Result<bool, MetaStatus> {
        let reclaim = {
            let mut state = wrapper.lock().await;
            if state.open_count == 0 {
                warn!(inode = wrapper.inode_id(), "release without open");
                return Ok(false);
            }
            state.open_count -= 1;
            wrapper.open_count.fetch_sub(1, Ordering::AcqRel);
            state.open_count == 0 && state.deferred_delete
        };
        if reclaim {
            self.reclaim(wrapper.inode_id()).await?;
        }
        Ok(reclaim)
    }

    /// Drop one link under the wrapper lock. When the link count reaches
    /// zero, deletion is immediate if nobody holds the file open, deferred to
    /// the final release otherwise. Returns true when physical deletion ran.
    pub async fn unlink(
        &self,
        wrapper: &Arc<InodeWrapper>,
        parent: InodeId,
    ) -> Result<bool, MetaStatus> {
        let reclaim = {
            let mut state = wrapper.lock().await;
            state.inode.nlink = state.inode.nlink.saturating_sub(1);
            if state.inode.nlink == 1 && state.inode.is_directory() {
                // An empty directory's last name going away takes "." with it.
                state.inode.nlink = 0;
            }
            if let Some(pos) = state.inode.parents.iter().position(|p| *p == parent) {
                state.inode.parents.remove(pos);
            }
            let (secs, nanos) = now_pair();
            state.inode.ctime = secs;
            state.inode.ctime_nsec = nanos;
            state.mark_dirty_attr();

            if state.inode.nlink == 0 {
                if state.open_count > 0 {
                    state.deferred_delete = true;
                    false
                } else {
                    true
                }
            } else {
                self.ship_to_flush(wrapper);
                false
            }
        };
        if reclaim {
            self.reclaim(wrapper.inode_id()).await?;
        }
        Ok(reclaim)
    }

    /// Bump a directory's link count for a gained or lost child directory.
    pub async fn adjust_nlink(&self, wrapper: &Arc<InodeWrapper>, delta: i32) {
        let mut state = wrapper.lock().await;
        if delta >= 0 {
            state.inode.nlink += delta as u32;
        } else {
            state.inode.nlink = state.inode.nlink.saturating_sub((-delta) as u32);
        }
        let (secs, nanos) = now_pair();
        state.inode.set_times(secs, nanos);
        state.mark_dirty_attr();
        drop(state);
        self.ship_to_flush(wrapper);
    }

    pub async fn link(
        &self,
        wrapper: &Arc<InodeWrapper>,
        new_parent: InodeId,
    ) -> Result<(), MetaStatus> {
        {
            let mut state = wrapper.lock().await;
            state.inode.nlink += 1;
            state.inode.parents.push(new_parent);
            let (secs, nanos) = now_pair();
            state.inode.ctime = secs;
            state.inode.ctime_nsec = nanos;
            state.mark_dirty_attr();
        }
        // Link is visible metadata; write it through.
        self.sync_inode(wrapper).await
    }

    async fn reclaim(&self, inode_id: InodeId) -> Result<(), MetaStatus> {
        debug!(inode = inode_id, "reclaiming unlinked inode");
        match self.meta.delete_inode(inode_id).await {
            Ok(()) | Err(MetaStatus::NotFound) => {
                self.clear(inode_id);
                Ok(())
            }
            Err(status) => Err(status),
        }
    }

    /// Write one inode's dirty state back, holding its lock across the RPCs
    /// so concurrent mutations queue behind the flush.
    pub async fn sync_inode(&self, wrapper: &Arc<InodeWrapper>) -> Result<(), MetaStatus> {
        let mut state = wrapper.lock().await;
        self.sync_locked(wrapper, &mut state).await
    }

    pub async fn sync_locked(
        &self,
        wrapper: &Arc<InodeWrapper>,
        state: &mut InodeState,
    ) -> Result<(), MetaStatus> {
        if !state.dirty_attr && state.dirty_chunks.is_empty() {
            wrapper.dirty.store(false, Ordering::Release);
            self.dirty_set.remove(&wrapper.inode_id());
            return Ok(());
        }

        let chunks = std::mem::take(&mut state.dirty_chunks);
        if !chunks.is_empty() {
            if let Err(status) = self
                .meta
                .get_or_modify_chunk_info(
                    wrapper.inode_id(),
                    chunks.clone(),
                    ChunkInfoMap::new(),
                    false,
                )
                .await
            {
                // Put the deltas back; the next pass retries.
                for (index, list) in chunks {
                    state.add_chunk_delta(index, list);
                }
                return Err(status);
            }
            // The deltas are durable server-side; fold them into the local
            // committed view so readers keep seeing them.
            for (index, list) in chunks {
                state.inode.chunk_map.entry(index).or_default().merge(&list);
            }
        }

        let req = UpdateInodeRequest::from_inode(&state.inode);
        if let Err(status) = self.meta.update_inode(req).await {
            warn!(
                inode = wrapper.inode_id(),
                status = status.name(),
                "inode write-back failed, keeping dirty"
            );
            return Err(status);
        }
        state.dirty_attr = false;
        wrapper.dirty.store(false, Ordering::Release);
        self.dirty_set.remove(&wrapper.inode_id());
        Ok(())
    }

    /// One write-back pass over the dirty set, bounded per pass; leftovers
    /// stay dirty for the next round.
    pub async fn flush_once(&self) {
        const FLUSH_BATCH: usize = 256;
        let dirty: Vec<InodeId> = self
            .dirty_set
            .iter()
            .take(FLUSH_BATCH)
            .map(|id| *id)
            .collect();
        for inode_id in dirty {
            let Some(wrapper) = self.map.get(&inode_id).map(|w| Arc::clone(&w)) else {
                self.dirty_set.remove(&inode_id);
                continue;
            };
            if let Err(status) = self.sync_inode(&wrapper).await {
                warn!(
                    inode = inode_id,
                    status = status.name(),
                    "flush pass failed for inode"
                );
            }
        }
    }

    /// Synchronous drain for shutdown and fsync: retries until the dirty set
    /// is empty.
    pub async fn flush_all(&self) {
        let mut backoff = Duration::from_millis(100);
        loop {
            self.flush_once().await;
            if self.dirty_set.is_empty() {
                return;
            }
            warn!(
                remaining = self.dirty_set.len(),
                "dirty inodes remain after flush pass, retrying"
            );
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_secs(5));
        }
    }

    /// Background write-back loop; exits only on shutdown.
    pub fn start_flush_loop(
        self: &Arc<Self>,
        period: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        crate::task::spawn_named("inode-flush", async move {
            loop {
                if !crate::task::interruptible_sleep(period, &shutdown).await {
                    info!("inode flush loop shutting down");
                    return;
                }
                cache.flush_once().await;
            }
        })
    }

    pub fn cached_count(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ChunkLayout;
    use crate::meta::cache::MetaCache;
    use crate::meta::executor::{ExecutorOptions, TaskExecutor};
    use crate::meta::types::{
        ChunkInfo, FileType, FsInfo, PartitionInfo, PartitionStatus,
    };
    use crate::rpc::router::LocalCluster;
    use crate::storage::{StorageEngine, StorageOptions};

    async fn setup(capacity: usize) -> (Arc<InodeCache>, LocalCluster) {
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
            vec![PartitionInfo {
                pool_id: 1,
                copyset_id: 1,
                partition_id: 1,
                fs_id: 100,
                start: 1,
                end: 1 << 20,
                tx_id: 0,
                status: PartitionStatus::ReadWrite,
                next_id: 1,
            }],
        );
        let cache = MetaCache::new(Arc::clone(&cluster.mapping) as _);
        cache.set_fs_id(100);
        let executor = TaskExecutor::new(ExecutorOptions::default(), cache);
        let meta = MetaClient::new(Arc::clone(&cluster.meta) as _, executor);
        (InodeCache::new(meta, capacity), cluster)
    }

    fn param() -> InodeParam {
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
    async fn test_get_caches_and_touches() {
        let (cache, _cluster) = setup(16).await;
        let created = cache.create_inode(param()).await.unwrap();
        let fetched = cache.get(created.inode_id()).await.unwrap();
        assert!(Arc::ptr_eq(&created, &fetched));
        assert_eq!(cache.cached_count(), 1);
    }

    #[tokio::test]
    async fn test_dirty_attr_written_back_once() {
        let (cache, _cluster) = setup(16).await;
        let wrapper = cache.create_inode(param()).await.unwrap();

        {
            let mut state = wrapper.lock().await;
            state.inode.length = 777;
            state.mark_dirty_attr();
        }
        cache.ship_to_flush(&wrapper);
        assert!(wrapper.is_dirty());

        cache.flush_once().await;
        assert!(!wrapper.is_dirty());

        let remote = cache.meta().get_inode(wrapper.inode_id()).await.unwrap();
        assert_eq!(remote.length, 777);
    }

    #[tokio::test]
    async fn test_flush_coalesces_chunk_deltas() {
        let (cache, _cluster) = setup(16).await;
        let wrapper = cache.create_inode(param()).await.unwrap();

        {
            let mut state = wrapper.lock().await;
            state.inode.length = 128;
            state.mark_dirty_attr();
            state.add_chunk_delta(
                0,
                ChunkInfoList::new(vec![ChunkInfo {
                    chunk_id: 1,
                    offset: 0,
                    len: 64,
                    size: 64,
                    zero: false,
                }]),
            );
            state.add_chunk_delta(
                0,
                ChunkInfoList::new(vec![ChunkInfo {
                    chunk_id: 2,
                    offset: 64,
                    len: 64,
                    size: 64,
                    zero: false,
                }]),
            );
        }
        cache.ship_to_flush(&wrapper);
        cache.flush_once().await;

        let remote = cache.meta().get_inode(wrapper.inode_id()).await.unwrap();
        assert_eq!(remote.length, 128);
        assert_eq!(remote.chunk_map[&0].entries.len(), 2);
        assert!(!wrapper.lock().await.has_dirty_chunks());
    }

    #[tokio::test]
    async fn test_eviction_skips_pinned() {
        let (cache, _cluster) = setup(2).await;
        let first = cache.create_inode(param()).await.unwrap();
        {
            let mut state = first.lock().await;
            cache.open(&first, &mut state);
        }
        let _second = cache.create_inode(param()).await.unwrap();
        let _third = cache.create_inode(param()).await.unwrap();

        // The open inode must have survived eviction.
        assert!(cache.map.contains_key(&first.inode_id()));
        assert!(cache.cached_count() <= 3);
    }

    #[tokio::test]
    async fn test_unlink_open_file_defers_delete() {
        let (cache, _cluster) = setup(16).await;
        let wrapper = cache.create_inode(param()).await.unwrap();
        let inode_id = wrapper.inode_id();

        {
            let mut state = wrapper.lock().await;
            cache.open(&wrapper, &mut state);
        }
        cache.unlink(&wrapper, 1).await.unwrap();

        // Still fetchable from the partition: delete was deferred.
        assert!(cache.meta().get_inode(inode_id).await.is_ok());

        let reclaimed = cache.release(&wrapper).await.unwrap();
        assert!(reclaimed);
        assert_eq!(
            cache.meta().get_inode(inode_id).await.unwrap_err(),
            MetaStatus::NotFound
        );
        assert!(!cache.map.contains_key(&inode_id));
    }

    #[tokio::test]
    async fn test_unlink_closed_file_deletes_immediately() {
        let (cache, _cluster) = setup(16).await;
        let wrapper = cache.create_inode(param()).await.unwrap();
        let inode_id = wrapper.inode_id();

        cache.unlink(&wrapper, 1).await.unwrap();
        assert_eq!(
            cache.meta().get_inode(inode_id).await.unwrap_err(),
            MetaStatus::NotFound
        );
    }
}
