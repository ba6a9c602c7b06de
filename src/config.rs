//! TOML-backed settings. Every knob has a serde default so a minimal config
//! file (or none at all) yields a working client.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::data::disk::DiskCacheOptions;
use crate::data::s3::S3AdapterOptions;
use crate::data::ChunkLayout;
use crate::meta::executor::ExecutorOptions;
use crate::storage::StorageOptions;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub fs_name: String,
    pub mountpoint: String,

    /// Names longer than this fail with `NAMETOOLONG` before any RPC.
    pub max_name_length: usize,
    pub list_dentry_limit: u32,
    pub list_dentry_threads: usize,

    /// Kernel cache hints returned on lookup, in seconds.
    pub attr_timeout: f64,
    pub entry_timeout: f64,

    pub flush_period_sec: u64,
    pub enable_cto: bool,
    pub enable_sum_in_dir: bool,
    /// Off means cross-partition renames fail with `NOTSUP`.
    pub enable_multi_mount_point_rename: bool,

    pub i_cache_lru_size: usize,
    pub d_cache_lru_size: usize,

    pub s3: S3Settings,
    pub rpc: RpcSettings,
    pub kv: KvSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fs_name: "tierfs".to_string(),
            mountpoint: "/mnt/tierfs".to_string(),
            max_name_length: 255,
            list_dentry_limit: 65536,
            list_dentry_threads: 4,
            attr_timeout: 1.0,
            entry_timeout: 1.0,
            flush_period_sec: 5,
            enable_cto: false,
            enable_sum_in_dir: false,
            enable_multi_mount_point_rename: true,
            i_cache_lru_size: 65536,
            d_cache_lru_size: 1_000_000,
            s3: S3Settings::default(),
            rpc: RpcSettings::default(),
            kv: KvSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Settings {
    pub chunk_size: u64,
    pub block_size: u64,
    pub read_cache_max_byte: u64,
    pub write_cache_max_byte: u64,
    pub disk_cache: DiskCacheSettings,
}

impl Default for S3Settings {
    fn default() -> Self {
        Self {
            chunk_size: 64 << 20,
            block_size: 4 << 20,
            read_cache_max_byte: 256 << 20,
            write_cache_max_byte: 256 << 20,
            disk_cache: DiskCacheSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskCacheSettings {
    pub enable: bool,
    pub cache_dir: PathBuf,
    pub full_ratio: f64,
    pub safe_ratio: f64,
    pub max_usable_space_bytes: u64,
    pub trim_check_interval_sec: u64,
    pub async_load_period_ms: u64,
}

impl Default for DiskCacheSettings {
    fn default() -> Self {
        Self {
            enable: false,
            cache_dir: PathBuf::from("/var/cache/tierfs"),
            full_ratio: 0.90,
            safe_ratio: 0.70,
            max_usable_space_bytes: 0,
            trim_check_interval_sec: 5,
            async_load_period_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcSettings {
    pub timeout_ms: u64,
    pub max_retry: u32,
    pub backoff_ms: u64,
    pub stream_idle_timeout_ms: u64,
    pub enable_rename_parallel: bool,
}

impl Default for RpcSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            max_retry: 5,
            backoff_ms: 100,
            stream_idle_timeout_ms: 10_000,
            enable_rename_parallel: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KvSettings {
    pub block_cache_capacity: u64,
    pub write_buffer_size: u64,
    pub max_write_buffer_number: u32,
    pub max_memory_bytes: u64,
    pub max_disk_bytes: u64,
    pub data_dir: PathBuf,
}

impl Default for KvSettings {
    fn default() -> Self {
        Self {
            block_cache_capacity: 8 << 20,
            write_buffer_size: 64 << 20,
            max_write_buffer_number: 4,
            max_memory_bytes: 0,
            max_disk_bytes: 0,
            data_dir: PathBuf::from("/var/lib/tierfs"),
        }
    }
}

impl Settings {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    pub fn write_default_config(path: &str) -> anyhow::Result<()> {
        let rendered = toml::to_string_pretty(&Settings::default())?;
        std::fs::write(path, rendered)?;
        Ok(())
    }

    pub fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            timeout: Duration::from_millis(self.rpc.timeout_ms),
            max_retry: self.rpc.max_retry,
            backoff: Duration::from_millis(self.rpc.backoff_ms),
            stream_idle_timeout: Duration::from_millis(self.rpc.stream_idle_timeout_ms),
            enable_rename_parallel: self.rpc.enable_rename_parallel,
        }
    }

    pub fn layout(&self) -> ChunkLayout {
        ChunkLayout {
            chunk_size: self.s3.chunk_size,
            block_size: self.s3.block_size,
        }
    }

    pub fn s3_adapter_options(&self) -> S3AdapterOptions {
        S3AdapterOptions {
            layout: self.layout(),
            write_cache_max_byte: self.s3.write_cache_max_byte,
            read_cache_max_byte: self.s3.read_cache_max_byte,
            enable_cto: self.enable_cto,
        }
    }

    pub fn disk_cache_options(&self) -> Option<DiskCacheOptions> {
        if !self.s3.disk_cache.enable {
            return None;
        }
        Some(DiskCacheOptions {
            cache_dir: self.s3.disk_cache.cache_dir.clone(),
            full_ratio: self.s3.disk_cache.full_ratio,
            safe_ratio: self.s3.disk_cache.safe_ratio,
            max_usable_space_bytes: self.s3.disk_cache.max_usable_space_bytes,
            trim_check_interval: Duration::from_secs(self.s3.disk_cache.trim_check_interval_sec),
            async_load_period: Duration::from_millis(self.s3.disk_cache.async_load_period_ms),
        })
    }

    pub fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            block_cache_capacity: self.kv.block_cache_capacity,
            write_buffer_size: self.kv.write_buffer_size,
            max_write_buffer_number: self.kv.max_write_buffer_number,
            max_memory_bytes: self.kv.max_memory_bytes,
            max_disk_bytes: self.kv.max_disk_bytes,
            data_dir: self.kv.data_dir.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_roundtrip_through_toml() {
        let rendered = toml::to_string_pretty(&Settings::default()).unwrap();
        let parsed: Settings = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed.max_name_length, 255);
        assert_eq!(parsed.s3.chunk_size, 64 << 20);
        assert!(!parsed.enable_cto);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: Settings = toml::from_str(
            r#"
            fs_name = "prod"
            enable_cto = true

            [s3]
            chunk_size = 1048576
            "#,
        )
        .unwrap();
        assert_eq!(parsed.fs_name, "prod");
        assert!(parsed.enable_cto);
        assert_eq!(parsed.s3.chunk_size, 1 << 20);
        // Untouched sections keep their defaults.
        assert_eq!(parsed.rpc.max_retry, 5);
        assert_eq!(parsed.s3.block_size, 4 << 20);
    }

    #[test]
    fn test_write_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tierfs.toml");
        Settings::write_default_config(path.to_str().unwrap()).unwrap();
        let loaded = Settings::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded.fs_name, "tierfs");
    }
}
