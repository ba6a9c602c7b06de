//! Asynchronous reclamation of deleted inodes.
//!
//! When an inode's last link goes away and its open count reaches zero, the
//! client issues `delete_inode`; the partition drops the record and chunk
//! lists and hands the reclaimed chunk infos here. The collector deletes the
//! backing block objects in the background. Partitions in `Deleting` status
//! get a full walk, bounded per round so one huge partition cannot starve
//! the rest.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::data::object::{ObjectAdapter, object_name};
use crate::data::ChunkLayout;
use crate::meta::types::{ChunkInfo, FsId, InodeId};
use crate::server::partition::Partition;

const CLEAN_BATCH: usize = 256;

#[derive(Debug)]
pub struct TrashItem {
    pub fs_id: FsId,
    pub inode_id: InodeId,
    pub chunks: Vec<ChunkInfo>,
}

#[derive(Clone)]
pub struct TrashCollector {
    tx: mpsc::UnboundedSender<TrashItem>,
    objects: Option<ObjectAdapter>,
    layout: ChunkLayout,
    shutdown: CancellationToken,
}

impl TrashCollector {
    /// Start the collector worker. Without an object adapter (metadata-only
    /// deployments and most tests) reclamation is metadata-only.
    pub fn start(
        objects: Option<ObjectAdapter>,
        layout: ChunkLayout,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<TrashItem>();
        let collector = Self {
            tx,
            objects: objects.clone(),
            layout,
            shutdown: shutdown.clone(),
        };

        let worker = {
            let collector = collector.clone();
            crate::task::spawn_named("trash-collector", async move {
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            info!("trash collector shutting down");
                            break;
                        }
                        item = rx.recv() => match item {
                            Some(item) => collector.reclaim(item).await,
                            None => break,
                        },
                    }
                }
            })
        };
        (collector, worker)
    }

    pub fn enqueue(&self, item: TrashItem) {
        if self.tx.send(item).is_err() {
            warn!("trash collector gone; leaking reclaimable objects");
        }
    }

    async fn reclaim(&self, item: TrashItem) {
        let Some(objects) = &self.objects else {
            return;
        };
        let mut deleted = 0u64;
        for chunk in &item.chunks {
            if chunk.zero {
                continue;
            }
            for block in 0..self.layout.block_count(chunk.size) {
                objects
                    .delete(&object_name(item.fs_id, item.inode_id, chunk.chunk_id, block))
                    .await;
                deleted += 1;
            }
        }
        debug!(
            fs_id = item.fs_id,
            inode = item.inode_id,
            objects = deleted,
            "reclaimed deleted inode"
        );
    }

    /// Drain every inode of a partition marked `Deleting`. Returns when the
    /// partition is empty or shutdown is signalled.
    pub fn spawn_partition_clean(&self, partition: Arc<Partition>) -> JoinHandle<()> {
        let collector = self.clone();
        let shutdown = self.shutdown.clone();
        crate::task::spawn_named("partition-cleaner", async move {
            let info = partition.info();
            info!(partition = info.partition_id, "partition cleaner started");
            loop {
                if shutdown.is_cancelled() {
                    return;
                }
                let ids = partition.inode_ids();
                if ids.is_empty() {
                    break;
                }
                for inode_id in ids.into_iter().take(CLEAN_BATCH) {
                    match partition.delete_inode(info.fs_id, inode_id) {
                        Ok(chunks) => collector.enqueue(TrashItem {
                            fs_id: info.fs_id,
                            inode_id,
                            chunks,
                        }),
                        Err(status) => {
                            warn!(
                                partition = info.partition_id,
                                inode_id,
                                status = status.name(),
                                "partition cleaner failed to delete inode"
                            );
                        }
                    }
                }
                tokio::task::yield_now().await;
            }
            partition.clear_all();
            info!(partition = info.partition_id, "partition cleaner finished");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::types::{
        ChunkInfoList, ChunkInfoMap, FileType, InodeParam, PartitionInfo, PartitionStatus,
    };
    use crate::storage::{StorageEngine, StorageOptions};
    use bytes::Bytes;
    use object_store::memory::InMemory;

    fn layout() -> ChunkLayout {
        ChunkLayout {
            chunk_size: 1024,
            block_size: 256,
        }
    }

    #[tokio::test]
    async fn test_reclaim_deletes_block_objects() {
        let store = ObjectAdapter::new(Arc::new(InMemory::new()));
        // Chunk of 600 bytes on a 256-byte block layout: blocks 0..3.
        for block in 0..3 {
            store
                .put(&object_name(1, 7, 42, block), Bytes::from_static(b"x"))
                .await
                .unwrap();
        }

        let shutdown = CancellationToken::new();
        let (trash, worker) = TrashCollector::start(Some(store.clone()), layout(), shutdown.clone());
        trash.enqueue(TrashItem {
            fs_id: 1,
            inode_id: 7,
            chunks: vec![ChunkInfo {
                chunk_id: 42,
                offset: 0,
                len: 600,
                size: 600,
                zero: false,
            }],
        });

        // Give the worker a moment, then stop it.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown.cancel();
        worker.await.unwrap();

        for block in 0..3 {
            assert_eq!(store.get(&object_name(1, 7, 42, block)).await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn test_partition_clean_drains_inodes() {
        let engine = StorageEngine::new(StorageOptions::default());
        let partition = Arc::new(Partition::new(
            PartitionInfo {
                pool_id: 1,
                copyset_id: 1,
                partition_id: 1,
                fs_id: 9,
                start: 1,
                end: 1000,
                tx_id: 0,
                status: PartitionStatus::ReadWrite,
                next_id: 1,
            },
            engine,
        ));
        for _ in 0..5 {
            let mut add = ChunkInfoMap::new();
            add.insert(
                0,
                ChunkInfoList::new(vec![ChunkInfo {
                    chunk_id: 1,
                    offset: 0,
                    len: 10,
                    size: 10,
                    zero: false,
                }]),
            );
            let inode = partition
                .create_inode(&InodeParam {
                    fs_id: 9,
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
                .modify_chunk_info_list(9, inode.inode_id, &add, &ChunkInfoMap::new())
                .unwrap();
        }
        partition.set_status(PartitionStatus::Deleting);

        let shutdown = CancellationToken::new();
        let (trash, worker) = TrashCollector::start(None, layout(), shutdown.clone());
        trash.spawn_partition_clean(Arc::clone(&partition)).await.unwrap();

        assert_eq!(partition.inode_count(), 0);
        assert!(partition.inode_ids().is_empty());

        shutdown.cancel();
        worker.await.unwrap();
    }
}
