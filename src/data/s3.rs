//! Chunked S3 data adapter.
//!
//! Writes land as slices in the write cache and are published in two steps:
//! slice runs are serialized into block objects (through the disk cache in
//! write-back mode, straight to the object store in close-to-open mode), and
//! the resulting chunk infos ride the inode cache's write-back to the
//! partition. Reads overlay, newest on top: write cache over pending chunk
//! deltas over committed chunk infos over holes.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::data::cache::{ReadCache, WriteCache, WriteSlice};
use crate::data::disk::DiskCache;
use crate::data::object::{ObjectAdapter, object_name};
use crate::data::{ChunkLayout, DataBackend};
use crate::fs::errors::FsError;
use crate::fs::inode_cache::{InodeCache, InodeWrapper};
use crate::meta::types::{
    ChunkInfo, ChunkInfoList, FsId, InodeId, MetaStatus, now_pair,
};
use crate::rpc::MappingService;

#[derive(Debug, Clone)]
pub struct S3AdapterOptions {
    pub layout: ChunkLayout,
    pub write_cache_max_byte: u64,
    pub read_cache_max_byte: u64,
    pub enable_cto: bool,
}

impl Default for S3AdapterOptions {
    fn default() -> Self {
        Self {
            layout: ChunkLayout::default(),
            write_cache_max_byte: 256 << 20,
            read_cache_max_byte: 256 << 20,
            enable_cto: false,
        }
    }
}

pub struct S3DataAdapter {
    options: S3AdapterOptions,
    fs_id: AtomicU32,
    write_cache: WriteCache,
    read_cache: ReadCache,
    disk: Option<Arc<DiskCache>>,
    objects: ObjectAdapter,
    mapping: Arc<dyn MappingService>,
    inode_cache: Arc<InodeCache>,
    flush_locks: DashMap<InodeId, Arc<Mutex<()>>>,
}

impl S3DataAdapter {
    pub fn new(
        options: S3AdapterOptions,
        objects: ObjectAdapter,
        disk: Option<Arc<DiskCache>>,
        mapping: Arc<dyn MappingService>,
        inode_cache: Arc<InodeCache>,
    ) -> Arc<Self> {
        Arc::new(Self {
            write_cache: WriteCache::new(options.write_cache_max_byte),
            read_cache: ReadCache::new(options.read_cache_max_byte),
            options,
            fs_id: AtomicU32::new(0),
            disk,
            objects,
            mapping,
            inode_cache,
            flush_locks: DashMap::new(),
        })
    }

    fn fs(&self) -> FsId {
        self.fs_id.load(Ordering::Relaxed)
    }

    fn flush_lock(&self, inode_id: InodeId) -> Arc<Mutex<()>> {
        self.flush_locks
            .entry(inode_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Fetch one block object through the tiers, filling caches on the way
    /// up. A missing object reads as zeroes (hole).
    async fn fetch_object(&self, name: &str) -> Result<Bytes, FsError> {
        if let Some(data) = self.read_cache.get(name) {
            return Ok(data);
        }
        if let Some(disk) = &self.disk {
            if let Some(data) = disk.read_object(name).await {
                self.read_cache.insert(name.to_string(), data.clone());
                return Ok(data);
            }
        }
        match self.objects.get(name).await? {
            Some(data) => {
                self.read_cache.insert(name.to_string(), data.clone());
                Ok(data)
            }
            None => {
                warn!(name, "block object missing, reading as hole");
                Ok(Bytes::new())
            }
        }
    }

    /// Copy `[rel_start, rel_end)` of one chunk contribution into `dst`.
    async fn read_contribution(
        &self,
        inode_id: InodeId,
        info: &ChunkInfo,
        rel_start: u64,
        dst: &mut [u8],
    ) -> Result<(), FsError> {
        if info.zero {
            dst.fill(0);
            return Ok(());
        }
        let block_size = self.options.layout.block_size;
        let mut copied = 0u64;
        let total = dst.len() as u64;
        while copied < total {
            let rel = rel_start + copied;
            let block = rel / block_size;
            let offset_in_block = rel % block_size;
            let take = (block_size - offset_in_block).min(total - copied);
            let name = object_name(self.fs(), inode_id, info.chunk_id, block);
            let data = self.fetch_object(&name).await?;

            let dst_range =
                &mut dst[copied as usize..(copied + take) as usize];
            let start = offset_in_block as usize;
            let end = ((offset_in_block + take) as usize).min(data.len());
            if start < end {
                let got = end - start;
                dst_range[..got].copy_from_slice(&data[start..end]);
                if got < take as usize {
                    dst_range[got..].fill(0);
                }
            } else {
                dst_range.fill(0);
            }
            copied += take;
        }
        Ok(())
    }

    /// Merge pending write slices into maximal contiguous runs.
    fn coalesce(slices: Vec<WriteSlice>) -> Vec<(u64, Bytes)> {
        if slices.is_empty() {
            return Vec::new();
        }
        let min_start = slices.iter().map(|s| s.offset_in_chunk).min().unwrap();
        let max_end = slices
            .iter()
            .map(|s| s.offset_in_chunk + s.data.len() as u64)
            .max()
            .unwrap();
        let span = (max_end - min_start) as usize;
        let mut buf = vec![0u8; span];

        // Apply in write order, then merge the covered intervals.
        let mut intervals: Vec<(u64, u64)> = Vec::new();
        for slice in &slices {
            let start = slice.offset_in_chunk - min_start;
            buf[start as usize..start as usize + slice.data.len()].copy_from_slice(&slice.data);
            intervals.push((
                slice.offset_in_chunk,
                slice.offset_in_chunk + slice.data.len() as u64,
            ));
        }
        intervals.sort_unstable();
        let mut merged: Vec<(u64, u64)> = Vec::new();
        for (start, end) in intervals {
            match merged.last_mut() {
                Some((_, last_end)) if start <= *last_end => *last_end = (*last_end).max(end),
                _ => merged.push((start, end)),
            }
        }

        merged
            .into_iter()
            .map(|(start, end)| {
                let rel = (start - min_start) as usize;
                (
                    start,
                    Bytes::copy_from_slice(&buf[rel..rel + (end - start) as usize]),
                )
            })
            .collect()
    }

    /// Serialize one chunk's pending slices to block objects and return the
    /// chunk infos describing them.
    async fn persist_chunk(
        &self,
        inode_id: InodeId,
        slices: Vec<WriteSlice>,
        force_upload: bool,
    ) -> Result<ChunkInfoList, FsError> {
        let extents = Self::coalesce(slices);
        if extents.is_empty() {
            return Ok(ChunkInfoList::default());
        }

        let first_chunk_id = self
            .mapping
            .allocate_chunk_id(self.fs(), extents.len() as u32)
            .await
            .map_err(FsError::from)?;

        let mut infos = Vec::with_capacity(extents.len());
        for (i, (offset_in_chunk, data)) in extents.into_iter().enumerate() {
            let chunk_id = first_chunk_id + i as u64;
            let len = data.len() as u64;
            let block_size = self.options.layout.block_size as usize;
            for (block, piece) in data.chunks(block_size).enumerate() {
                let name = object_name(self.fs(), inode_id, chunk_id, block as u64);
                let piece = data.slice_ref(piece);
                let mut direct = force_upload;
                if !direct {
                    match &self.disk {
                        Some(disk) => {
                            if !disk.write_object(&name, &piece).await? {
                                direct = true;
                            }
                        }
                        None => direct = true,
                    }
                }
                if direct {
                    self.objects.put_with_retry(&name, piece.clone()).await;
                }
                self.read_cache.insert(name, piece);
            }
            infos.push(ChunkInfo {
                chunk_id,
                offset: offset_in_chunk,
                len,
                size: len,
                zero: false,
            });
        }
        Ok(ChunkInfoList::new(infos))
    }

    /// Flush one inode's write cache down the tiers and stage the resulting
    /// chunk infos on its wrapper.
    async fn flush_inode(
        &self,
        wrapper: &Arc<InodeWrapper>,
        force_upload: bool,
        sync_meta: bool,
    ) -> Result<(), FsError> {
        let inode_id = wrapper.inode_id();
        let lock = self.flush_lock(inode_id);
        let _guard = lock.lock().await;

        let chunks = self.write_cache.take_inode(inode_id);
        let mut deltas: BTreeMap<u64, ChunkInfoList> = BTreeMap::new();
        for (chunk_index, slices) in chunks {
            let list = self.persist_chunk(inode_id, slices, force_upload).await?;
            if !list.is_empty() {
                deltas.insert(chunk_index, list);
            }
        }

        let mut state = wrapper.lock().await;
        for (index, list) in deltas {
            state.add_chunk_delta(index, list);
        }
        if sync_meta {
            self.inode_cache
                .sync_locked(wrapper, &mut state)
                .await
                .map_err(FsError::from)?;
        } else if state.has_dirty_chunks() {
            drop(state);
            self.inode_cache.ship_to_flush(wrapper);
        }
        Ok(())
    }

    /// Relieve write-cache pressure by flushing the oldest dirty chunk.
    async fn evict_oldest(&self) -> Result<(), FsError> {
        let Some((inode_id, chunk_index)) = self.write_cache.oldest() else {
            return Ok(());
        };
        let Some(slices) = self.write_cache.take_chunk(inode_id, chunk_index) else {
            return Ok(());
        };
        let list = self
            .persist_chunk(inode_id, slices, self.options.enable_cto)
            .await?;
        if list.is_empty() {
            return Ok(());
        }
        let wrapper = self.inode_cache.get(inode_id).await?;
        {
            let mut state = wrapper.lock().await;
            state.add_chunk_delta(chunk_index, list);
        }
        self.inode_cache.ship_to_flush(&wrapper);
        debug!(inode = inode_id, chunk_index, "evicted write-cache chunk");
        Ok(())
    }
}

#[async_trait]
impl DataBackend for S3DataAdapter {
    fn set_fs_id(&self, fs_id: FsId) {
        self.fs_id.store(fs_id, Ordering::Relaxed);
    }

    async fn write(
        &self,
        wrapper: &Arc<InodeWrapper>,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, FsError> {
        if data.is_empty() {
            return Ok(0);
        }
        let inode_id = wrapper.inode_id();
        let layout = self.options.layout;
        let mut cursor = 0usize;
        while cursor < data.len() {
            let abs = offset + cursor as u64;
            let chunk_index = layout.chunk_index(abs);
            let offset_in_chunk = layout.offset_in_chunk(abs);
            let room = (layout.chunk_size - offset_in_chunk) as usize;
            let take = room.min(data.len() - cursor);
            self.write_cache.append(
                inode_id,
                chunk_index,
                WriteSlice {
                    offset_in_chunk,
                    data: Bytes::copy_from_slice(&data[cursor..cursor + take]),
                },
            );
            cursor += take;
        }

        // Publish length and times through the per-inode lock.
        {
            let mut state = wrapper.lock().await;
            let end = offset + data.len() as u64;
            if end > state.inode.length {
                state.inode.length = end;
            }
            let (secs, nanos) = now_pair();
            state.inode.set_times(secs, nanos);
            state.mark_dirty_attr();
        }
        self.inode_cache.ship_to_flush(wrapper);

        while self.write_cache.over_capacity() {
            self.evict_oldest().await?;
        }
        Ok(data.len())
    }

    async fn read(
        &self,
        wrapper: &Arc<InodeWrapper>,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, FsError> {
        let inode_id = wrapper.inode_id();
        let layout = self.options.layout;

        // Clamp to the current length and snapshot the effective chunk
        // lists: committed map first, pending deltas appended after.
        let (length, lists) = {
            let state = wrapper.lock().await;
            let mut lists: BTreeMap<u64, ChunkInfoList> = BTreeMap::new();
            let start_chunk = layout.chunk_index(offset);
            let end_chunk = layout.chunk_index(offset + len.max(1) as u64 - 1);
            for index in start_chunk..=end_chunk {
                lists.insert(index, state.effective_chunk_list(index));
            }
            (state.inode.length, lists)
        };

        if offset >= length || len == 0 {
            return Ok(Bytes::new());
        }
        let len = len.min((length - offset) as usize);
        let mut out = vec![0u8; len];

        let mut cursor = 0usize;
        while cursor < len {
            let abs = offset + cursor as u64;
            let chunk_index = layout.chunk_index(abs);
            let chunk_offset = layout.offset_in_chunk(abs);
            let room = (layout.chunk_size - chunk_offset) as usize;
            let take = room.min(len - cursor);
            let part_start = chunk_offset;
            let part_end = chunk_offset + take as u64;

            if let Some(list) = lists.get(&chunk_index) {
                for info in &list.entries {
                    let info_end = info.offset + info.len;
                    let start = info.offset.max(part_start);
                    let end = info_end.min(part_end);
                    if start >= end {
                        continue;
                    }
                    let rel = start - info.offset;
                    let dst = &mut out[(cursor as u64 + start - part_start) as usize
                        ..(cursor as u64 + end - part_start) as usize];
                    self.read_contribution(inode_id, info, rel, dst).await?;
                }
            }

            // Newest data wins: pending write slices overlay everything.
            self.write_cache.overlay(
                inode_id,
                chunk_index,
                part_start,
                &mut out[cursor..cursor + take],
            );
            cursor += take;
        }
        Ok(Bytes::from(out))
    }

    async fn truncate(&self, wrapper: &Arc<InodeWrapper>, new_len: u64) -> Result<(), FsError> {
        let inode_id = wrapper.inode_id();
        let layout = self.options.layout;
        let mut state = wrapper.lock().await;
        let old_len = state.inode.length;

        if new_len < old_len {
            self.write_cache.truncate(inode_id, new_len, layout.chunk_size);
            // One zero contribution per touched chunk window masks the
            // removed range for every reader, local or remote.
            let start_chunk = layout.chunk_index(new_len);
            let end_chunk = layout.chunk_index(old_len.max(1) - 1);
            for index in start_chunk..=end_chunk {
                let chunk_start = index * layout.chunk_size;
                let zero_from = new_len.max(chunk_start);
                let zero_to = old_len.min(chunk_start + layout.chunk_size);
                if zero_from >= zero_to {
                    continue;
                }
                state.add_chunk_delta(
                    index,
                    ChunkInfoList::new(vec![ChunkInfo {
                        chunk_id: 0,
                        offset: layout.offset_in_chunk(zero_from),
                        len: zero_to - zero_from,
                        size: 0,
                        zero: true,
                    }]),
                );
            }
        }
        state.inode.length = new_len;
        let (secs, nanos) = now_pair();
        state.inode.set_times(secs, nanos);
        state.mark_dirty_attr();
        drop(state);
        self.inode_cache.ship_to_flush(wrapper);
        Ok(())
    }

    async fn flush(&self, wrapper: &Arc<InodeWrapper>) -> Result<(), FsError> {
        if self.options.enable_cto {
            // Close-to-open: data reaches the object store and the inode
            // record is synced before flush returns.
            self.flush_inode(wrapper, true, true).await?;
            if let Some(disk) = &self.disk {
                disk.upload_pending().await;
            }
            Ok(())
        } else {
            // Write-back: reaching the disk cache is enough, the uploader
            // drains it later.
            self.flush_inode(wrapper, false, false).await
        }
    }

    async fn flush_all(&self) -> Result<(), FsError> {
        for inode_id in self.write_cache.inode_ids() {
            let wrapper = match self.inode_cache.get(inode_id).await {
                Ok(wrapper) => wrapper,
                Err(MetaStatus::NotFound) => {
                    self.write_cache.drop_inode(inode_id);
                    continue;
                }
                Err(status) => return Err(status.into()),
            };
            self.flush_inode(&wrapper, self.options.enable_cto, self.options.enable_cto)
                .await?;
        }
        Ok(())
    }

    async fn fs_sync(&self) -> Result<(), FsError> {
        self.flush_all().await?;
        if let Some(disk) = &self.disk {
            // Unmount contract: nothing may remain in the write area.
            loop {
                disk.upload_pending().await;
                if disk.write_area_empty().await {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn invalidate(&self, inode_id: InodeId) {
        self.write_cache.drop_inode(inode_id);
        self.read_cache
            .invalidate_prefix(&format!("{}_{}_", self.fs(), inode_id));
        self.flush_locks.remove(&inode_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ChunkLayout;
    use crate::meta::cache::MetaCache;
    use crate::meta::client::MetaClient;
    use crate::meta::executor::{ExecutorOptions, TaskExecutor};
    use crate::meta::types::{
        FileType, FsInfo, InodeParam, PartitionInfo, PartitionStatus,
    };
    use crate::rpc::router::LocalCluster;
    use crate::storage::{StorageEngine, StorageOptions};
    use object_store::memory::InMemory;
    use std::time::Duration;

    struct Harness {
        adapter: Arc<S3DataAdapter>,
        inode_cache: Arc<InodeCache>,
        cluster: LocalCluster,
        objects: ObjectAdapter,
    }

    async fn harness(options: S3AdapterOptions) -> Harness {
        let cluster = LocalCluster::new(
            StorageEngine::new(StorageOptions::default()),
            None,
            options.layout,
            Duration::from_secs(1),
        );
        cluster.mapping.register_fs(
            FsInfo {
                fs_id: 100,
                fs_name: "fs".into(),
                block_size: options.layout.block_size as u32,
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
        let inode_cache = InodeCache::new(meta, 1024);
        let objects = ObjectAdapter::new(Arc::new(InMemory::new()));
        let adapter = S3DataAdapter::new(
            options,
            objects.clone(),
            None,
            Arc::clone(&cluster.mapping) as _,
            Arc::clone(&inode_cache),
        );
        adapter.set_fs_id(100);
        Harness {
            adapter,
            inode_cache,
            cluster,
            objects,
        }
    }

    fn small_layout() -> ChunkLayout {
        ChunkLayout {
            chunk_size: 64,
            block_size: 16,
        }
    }

    async fn new_file(h: &Harness) -> Arc<InodeWrapper> {
        h.inode_cache
            .create_inode(InodeParam {
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
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_write_then_read_from_cache() {
        let h = harness(S3AdapterOptions {
            layout: small_layout(),
            ..Default::default()
        })
        .await;
        let file = new_file(&h).await;

        h.adapter.write(&file, 0, b"hello world").await.unwrap();
        let got = h.adapter.read(&file, 0, 11).await.unwrap();
        assert_eq!(&got[..], b"hello world");
        assert_eq!(file.attr().await.length, 11);

        // Overwrite in place: newest write wins.
        h.adapter.write(&file, 6, b"tierfs").await.unwrap();
        let got = h.adapter.read(&file, 0, 12).await.unwrap();
        assert_eq!(&got[..], b"hello tierfs");
    }

    #[tokio::test]
    async fn test_write_spanning_chunks_roundtrips_after_flush() {
        let h = harness(S3AdapterOptions {
            layout: small_layout(),
            enable_cto: true,
            ..Default::default()
        })
        .await;
        let file = new_file(&h).await;

        // 200 bytes over 64-byte chunks: four windows.
        let payload: Vec<u8> = (0..200u32).map(|i| (i % 251) as u8).collect();
        h.adapter.write(&file, 0, &payload).await.unwrap();
        h.adapter.flush(&file).await.unwrap();

        // The write cache is drained; reads now come from objects.
        let got = h.adapter.read(&file, 0, 200).await.unwrap();
        assert_eq!(&got[..], &payload[..]);

        // The partition saw the chunk infos and the new length.
        let remote = h.inode_cache.meta().get_inode(file.inode_id()).await.unwrap();
        assert_eq!(remote.length, 200);
        assert!(!remote.chunk_map.is_empty());

        // A second client (fresh caches) reads the same bytes.
        let h2_cache = InodeCache::new(Arc::clone(h.inode_cache.meta()), 64);
        let adapter2 = S3DataAdapter::new(
            S3AdapterOptions {
                layout: small_layout(),
                enable_cto: true,
                ..Default::default()
            },
            h.objects.clone(),
            None,
            Arc::clone(&h.cluster.mapping) as _,
            Arc::clone(&h2_cache),
        );
        adapter2.set_fs_id(100);
        let file2 = h2_cache.get(file.inode_id()).await.unwrap();
        let got = adapter2.read(&file2, 0, 200).await.unwrap();
        assert_eq!(&got[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_shrinking_truncate_zeroes_tail() {
        let h = harness(S3AdapterOptions {
            layout: small_layout(),
            enable_cto: true,
            ..Default::default()
        })
        .await;
        let file = new_file(&h).await;

        h.adapter.write(&file, 0, &[0xAAu8; 100]).await.unwrap();
        h.adapter.flush(&file).await.unwrap();

        h.adapter.truncate(&file, 40).await.unwrap();
        assert_eq!(file.attr().await.length, 40);

        // Growing back exposes zeroes, not stale bytes.
        h.adapter.truncate(&file, 100).await.unwrap();
        let got = h.adapter.read(&file, 0, 100).await.unwrap();
        assert_eq!(&got[..40], &[0xAAu8; 40]);
        assert_eq!(&got[40..], &[0u8; 60]);
    }

    #[tokio::test]
    async fn test_sparse_growing_truncate_reads_zeroes() {
        let h = harness(S3AdapterOptions {
            layout: small_layout(),
            ..Default::default()
        })
        .await;
        let file = new_file(&h).await;

        h.adapter.truncate(&file, 50).await.unwrap();
        let got = h.adapter.read(&file, 0, 50).await.unwrap();
        assert_eq!(&got[..], &[0u8; 50]);
    }

    #[tokio::test]
    async fn test_write_cache_pressure_evicts_oldest() {
        let h = harness(S3AdapterOptions {
            layout: small_layout(),
            write_cache_max_byte: 64,
            ..Default::default()
        })
        .await;
        let file = new_file(&h).await;

        // Each write lands in its own chunk; pressure forces uploads.
        for i in 0..4u64 {
            let data = vec![i as u8; 32];
            h.adapter.write(&file, i * 64, &data).await.unwrap();
        }
        assert!(h.adapter.write_cache.total_bytes() <= 64);

        // Everything is still readable, whether cached or persisted.
        for i in 0..4u64 {
            let got = h.adapter.read(&file, i * 64, 32).await.unwrap();
            assert_eq!(&got[..], &vec![i as u8; 32][..]);
        }
    }

    #[tokio::test]
    async fn test_read_never_passes_eof() {
        let h = harness(S3AdapterOptions {
            layout: small_layout(),
            ..Default::default()
        })
        .await;
        let file = new_file(&h).await;
        h.adapter.write(&file, 0, b"abc").await.unwrap();

        let got = h.adapter.read(&file, 0, 100).await.unwrap();
        assert_eq!(&got[..], b"abc");
        let got = h.adapter.read(&file, 10, 5).await.unwrap();
        assert!(got.is_empty());
    }
}
