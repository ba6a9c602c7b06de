//! Shared fixture: a single-process cluster (engine + metastore + mapping)
//! with an in-memory object store, plus mounted filesystem clients on top.

use object_store::memory::InMemory;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Settings;
use crate::data::object::ObjectAdapter;
use crate::data::s3::S3DataAdapter;
use crate::data::ChunkLayout;
use crate::fs::FileSystem;
use crate::meta::cache::MetaCache;
use crate::meta::client::MetaClient;
use crate::meta::executor::TaskExecutor;
use crate::meta::types::{FsInfo, PartitionInfo, PartitionStatus};
use crate::rpc::router::LocalCluster;
use crate::storage::{StorageEngine, StorageOptions};

pub const TEST_FS_ID: u32 = 100;

pub struct TestCluster {
    pub cluster: LocalCluster,
    pub objects: ObjectAdapter,
    pub settings: Settings,
    mounts: std::sync::atomic::AtomicU32,
}

pub fn small_settings() -> Settings {
    let mut settings = Settings::default();
    settings.s3.chunk_size = 64;
    settings.s3.block_size = 16;
    settings.flush_period_sec = 1;
    settings
}

impl TestCluster {
    /// Two partitions on distinct copysets so cross-partition renames are
    /// exercised: inodes [1, 2^20) and [2^20, 2^21).
    pub async fn start(settings: Settings) -> Self {
        let objects = ObjectAdapter::new(Arc::new(InMemory::new()));
        let cluster = LocalCluster::new(
            StorageEngine::new(StorageOptions::default()),
            Some(objects.clone()),
            ChunkLayout {
                chunk_size: settings.s3.chunk_size,
                block_size: settings.s3.block_size,
            },
            Duration::from_millis(settings.rpc.stream_idle_timeout_ms),
        );
        cluster.mapping.register_fs(
            FsInfo {
                fs_id: TEST_FS_ID,
                fs_name: settings.fs_name.clone(),
                block_size: settings.s3.block_size as u32,
                capacity: 1 << 40,
                enable_sum_in_dir: settings.enable_sum_in_dir,
                mount_points: Vec::new(),
            },
            vec![
                PartitionInfo {
                    pool_id: 1,
                    copyset_id: 1,
                    partition_id: 1,
                    fs_id: TEST_FS_ID,
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
                    fs_id: TEST_FS_ID,
                    start: 1 << 20,
                    end: 2 << 20,
                    tx_id: 0,
                    status: PartitionStatus::ReadWrite,
                    next_id: 1 << 20,
                },
            ],
        );
        cluster.ensure_root(TEST_FS_ID).unwrap();
        Self {
            cluster,
            objects,
            settings,
            mounts: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Build and mount a filesystem client against this cluster.
    pub async fn mount_client(&self) -> Arc<FileSystem> {
        let cache = MetaCache::new(Arc::clone(&self.cluster.mapping) as _);
        let executor = TaskExecutor::new(self.settings.executor_options(), cache);
        let meta = MetaClient::new(Arc::clone(&self.cluster.meta) as _, executor);

        let inode_cache = crate::fs::inode_cache::InodeCache::new(
            Arc::clone(&meta),
            self.settings.i_cache_lru_size,
        );
        let adapter = S3DataAdapter::new(
            self.settings.s3_adapter_options(),
            self.objects.clone(),
            None,
            Arc::clone(&self.cluster.mapping) as _,
            Arc::clone(&inode_cache),
        );

        let fs = FileSystem::new(
            self.settings.clone(),
            Arc::clone(&self.cluster.mapping) as _,
            meta,
            inode_cache,
            adapter,
        );
        let n = self
            .mounts
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        fs.mount(&self.settings.fs_name.clone(), &format!("host:{n}:/mnt"))
            .await
            .unwrap();
        fs
    }
}
