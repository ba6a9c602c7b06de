use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

mod config;
mod data;
mod fs;
mod meta;
mod rpc;
mod server;
mod storage;
mod task;

#[cfg(test)]
mod test_helpers;


use config::Settings;
use data::object::ObjectAdapter;
use data::s3::S3DataAdapter;
use fs::FileSystem;
use meta::cache::MetaCache;
use meta::client::MetaClient;
use meta::executor::TaskExecutor;
use meta::types::{FsInfo, PartitionInfo, PartitionStatus};
use rpc::router::LocalCluster;
use storage::StorageEngine;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(name = "tierfs", about = "Tiered object-store-backed POSIX filesystem client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        #[arg(default_value = "tierfs.toml")]
        path: PathBuf,
    },
    /// Mount a single-process development instance: metadata partitions and
    /// the object store live in this process.
    Mount {
        #[arg(short, long, default_value = "tierfs.toml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init { path } => {
            let path = path.to_string_lossy();
            Settings::write_default_config(&path)
                .with_context(|| format!("writing default config to {path}"))?;
            println!("Configuration written to {path}");
            println!("Edit it and run: tierfs mount -c {path}");
        }
        Commands::Mount { config } => {
            let settings = if config.exists() {
                Settings::from_file(&config.to_string_lossy())
                    .with_context(|| format!("loading config {}", config.display()))?
            } else {
                info!(config = %config.display(), "config not found, using defaults");
                Settings::default()
            };
            run_mount(settings).await?;
        }
    }
    Ok(())
}

const DEV_FS_ID: u32 = 1;

async fn run_mount(settings: Settings) -> Result<()> {
    let objects = ObjectAdapter::new(Arc::new(object_store::memory::InMemory::new()));
    let cluster = LocalCluster::new(
        StorageEngine::new(settings.storage_options()),
        Some(objects.clone()),
        settings.layout(),
        Duration::from_millis(settings.rpc.stream_idle_timeout_ms),
    );
    cluster.mapping.register_fs(
        FsInfo {
            fs_id: DEV_FS_ID,
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
                fs_id: DEV_FS_ID,
                start: 1,
                end: 1 << 24,
                tx_id: 0,
                status: PartitionStatus::ReadWrite,
                next_id: 1,
            },
            PartitionInfo {
                pool_id: 1,
                copyset_id: 2,
                partition_id: 2,
                fs_id: DEV_FS_ID,
                start: 1 << 24,
                end: 1 << 25,
                tx_id: 0,
                status: PartitionStatus::ReadWrite,
                next_id: 1 << 24,
            },
        ],
    );
    cluster
        .ensure_root(DEV_FS_ID)
        .map_err(|s| anyhow::anyhow!("creating root inode: {s}"))?;

    let cache = MetaCache::new(Arc::clone(&cluster.mapping) as _);
    let executor = TaskExecutor::new(settings.executor_options(), cache);
    let meta = MetaClient::new(Arc::clone(&cluster.meta) as _, executor);
    let inode_cache = fs::inode_cache::InodeCache::new(Arc::clone(&meta), settings.i_cache_lru_size);

    let disk = match settings.disk_cache_options() {
        Some(options) => {
            let disk = data::disk::DiskCache::open(
                options,
                DEV_FS_ID,
                objects.clone(),
                cluster.shutdown.clone(),
            )
            .await
            .map_err(|e| anyhow::anyhow!("opening disk cache: {e}"))?;
            disk.start_loops();
            Some(disk)
        }
        None => None,
    };

    let adapter = S3DataAdapter::new(
        settings.s3_adapter_options(),
        objects,
        disk,
        Arc::clone(&cluster.mapping) as _,
        Arc::clone(&inode_cache),
    );
    let filesystem = FileSystem::new(
        settings.clone(),
        Arc::clone(&cluster.mapping) as _,
        meta,
        inode_cache,
        adapter,
    );
    let mountpoint = format!("{}:{}", hostname(), settings.mountpoint);
    filesystem
        .mount(&settings.fs_name, &mountpoint)
        .await
        .map_err(|e| anyhow::anyhow!("mount failed: {e}"))?;

    info!("tierfs mounted; press Ctrl-C to unmount");
    tokio::signal::ctrl_c().await?;

    info!("unmounting");
    filesystem
        .umount()
        .await
        .map_err(|e| anyhow::anyhow!("umount failed: {e}"))?;
    cluster.stop().await;
    Ok(())
}

fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}
