//! Second-tier cache on a local disk.
//!
//! Layout under one mount point: `<root>/<fs_id>/write/` holds objects not
//! yet uploaded, `<root>/<fs_id>/read/` holds cached copies. A persisted
//! write object is hard-linked into the read area so later reads hit
//! locally; the async uploader drains the write side and unlinks it after a
//! successful upload, leaving the read link until the trimmer evicts it.
//! Watermarks: above `full_ratio` new inserts are refused (callers go
//! straight to the object store), and a background trimmer evicts read-side
//! files in LRU order until usage drops under `safe_ratio`.

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::data::object::ObjectAdapter;
use crate::fs::errors::FsError;
use crate::meta::types::FsId;

#[derive(Debug, Clone)]
pub struct DiskCacheOptions {
    pub cache_dir: PathBuf,
    /// Fraction of the filesystem (or of `max_usable_space_bytes`) above
    /// which inserts are refused.
    pub full_ratio: f64,
    /// Fraction under which inserts resume.
    pub safe_ratio: f64,
    /// Absolute cap on cache usage; 0 means "whole filesystem".
    pub max_usable_space_bytes: u64,
    pub trim_check_interval: Duration,
    pub async_load_period: Duration,
}

impl Default for DiskCacheOptions {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("/var/cache/tierfs"),
            full_ratio: 0.90,
            safe_ratio: 0.70,
            max_usable_space_bytes: 0,
            trim_check_interval: Duration::from_secs(5),
            async_load_period: Duration::from_millis(500),
        }
    }
}

pub struct DiskCache {
    options: DiskCacheOptions,
    write_dir: PathBuf,
    read_dir: PathBuf,
    objects: ObjectAdapter,
    suspended: AtomicBool,
    shutdown: CancellationToken,
}

impl DiskCache {
    pub async fn open(
        options: DiskCacheOptions,
        fs_id: FsId,
        objects: ObjectAdapter,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, FsError> {
        let fs_dir = options.cache_dir.join(fs_id.to_string());
        let write_dir = fs_dir.join("write");
        let read_dir = fs_dir.join("read");
        tokio::fs::create_dir_all(&write_dir)
            .await
            .map_err(|_| FsError::IoError)?;
        tokio::fs::create_dir_all(&read_dir)
            .await
            .map_err(|_| FsError::IoError)?;

        let cache = Arc::new(Self {
            options,
            write_dir,
            read_dir,
            objects,
            suspended: AtomicBool::new(false),
            shutdown,
        });
        Ok(cache)
    }

    pub fn start_loops(self: &Arc<Self>) -> (JoinHandle<()>, JoinHandle<()>) {
        let uploader = {
            let cache = Arc::clone(self);
            crate::task::spawn_named("disk-cache-uploader", async move {
                loop {
                    if !crate::task::interruptible_sleep(
                        cache.options.async_load_period,
                        &cache.shutdown,
                    )
                    .await
                    {
                        info!("disk cache uploader shutting down");
                        return;
                    }
                    cache.upload_pending().await;
                }
            })
        };
        let trimmer = {
            let cache = Arc::clone(self);
            crate::task::spawn_named("disk-cache-trim", async move {
                loop {
                    if !crate::task::interruptible_sleep(
                        cache.options.trim_check_interval,
                        &cache.shutdown,
                    )
                    .await
                    {
                        info!("disk cache trimmer shutting down");
                        return;
                    }
                    cache.trim().await;
                }
            })
        };
        (uploader, trimmer)
    }

    /// True when inserts are currently refused.
    pub fn suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Persist an object into the write area and link it into the read area.
    /// Returns false (without writing) when the cache is over its full
    /// watermark; the caller then uploads directly.
    pub async fn write_object(&self, name: &str, data: &Bytes) -> Result<bool, FsError> {
        if self.suspended() {
            return Ok(false);
        }
        let final_path = self.write_dir.join(name);
        let tmp_path = self.write_dir.join(format!("{name}.tmp"));
        tokio::fs::write(&tmp_path, data)
            .await
            .map_err(|_| FsError::IoError)?;
        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|_| FsError::IoError)?;
        self.link_to_read(&final_path, name).await;
        debug!(name, bytes = data.len(), "cached object on disk");
        Ok(true)
    }

    async fn link_to_read(&self, write_path: &Path, name: &str) {
        let read_path = self.read_dir.join(name);
        match tokio::fs::hard_link(write_path, &read_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => warn!(name, "hard link into read cache failed: {e}"),
        }
    }

    /// Read-side lookup.
    pub async fn read_object(&self, name: &str) -> Option<Bytes> {
        match tokio::fs::read(self.read_dir.join(name)).await {
            Ok(data) => Some(Bytes::from(data)),
            Err(_) => None,
        }
    }

    /// Upload everything in the write area, unlinking each write copy after
    /// its upload succeeds.
    pub async fn upload_pending(&self) {
        let mut entries = match tokio::fs::read_dir(&self.write_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("write area scan failed: {e}");
                return;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            if name.ends_with(".tmp") {
                continue;
            }
            let data = match tokio::fs::read(&path).await {
                Ok(data) => Bytes::from(data),
                Err(e) => {
                    warn!(name, "pending object read failed: {e}");
                    continue;
                }
            };
            self.objects.put_with_retry(&name, data).await;
            self.link_to_read(&path, &name).await;
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(name, "removing uploaded write copy failed: {e}");
            }
            debug!(name, "uploaded cached object");
        }
    }

    /// True when no objects are waiting for upload.
    pub async fn write_area_empty(&self) -> bool {
        let Ok(mut entries) = tokio::fs::read_dir(&self.write_dir).await else {
            return true;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_tmp = entry
                .path()
                .extension()
                .map(|e| e == "tmp")
                .unwrap_or(false);
            if !is_tmp {
                return false;
            }
        }
        true
    }

    async fn usage_ratio(&self) -> f64 {
        if self.options.max_usable_space_bytes > 0 {
            let used = self.dir_bytes(&self.read_dir).await + self.dir_bytes(&self.write_dir).await;
            return used as f64 / self.options.max_usable_space_bytes as f64;
        }
        match statvfs(&self.read_dir) {
            Some((total, available)) if total > 0 => {
                (total.saturating_sub(available)) as f64 / total as f64
            }
            _ => 0.0,
        }
    }

    async fn dir_bytes(&self, dir: &Path) -> u64 {
        let mut total = 0;
        if let Ok(mut entries) = tokio::fs::read_dir(dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Ok(meta) = entry.metadata().await {
                    total += meta.len();
                }
            }
        }
        total
    }

    /// Check watermarks; evict read-side files oldest-first while above the
    /// safe ratio. Write-side files are never trimmed, they hold data not
    /// yet uploaded.
    pub async fn trim(&self) {
        let ratio = self.usage_ratio().await;
        if ratio >= self.options.full_ratio && !self.suspended() {
            warn!(ratio, "disk cache over full watermark, suspending inserts");
            self.suspended.store(true, Ordering::Release);
        }
        if ratio < self.options.safe_ratio {
            if self.suspended() {
                info!(ratio, "disk cache back under safe watermark");
                self.suspended.store(false, Ordering::Release);
            }
            return;
        }

        // Gather read-side entries oldest-first by modification time.
        let mut candidates: Vec<(std::time::SystemTime, PathBuf, u64)> = Vec::new();
        if let Ok(mut entries) = tokio::fs::read_dir(&self.read_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                if let Ok(meta) = entry.metadata().await {
                    let mtime = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
                    candidates.push((mtime, entry.path(), meta.len()));
                }
            }
        }
        candidates.sort_by_key(|(mtime, _, _)| *mtime);

        for (_, path, _) in candidates {
            if self.usage_ratio().await < self.options.safe_ratio {
                break;
            }
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), "trim failed: {e}");
            } else {
                debug!(path = %path.display(), "trimmed cached object");
            }
        }

        if self.usage_ratio().await < self.options.safe_ratio && self.suspended() {
            self.suspended.store(false, Ordering::Release);
        }
    }
}

fn statvfs(path: &Path) -> Option<(u64, u64)> {
    let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) } != 0 {
        return None;
    }
    let total = stat.f_blocks as u64 * stat.f_frsize as u64;
    let available = stat.f_bavail as u64 * stat.f_frsize as u64;
    Some((total, available))
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    async fn cache_with(options: DiskCacheOptions) -> (Arc<DiskCache>, ObjectAdapter) {
        let objects = ObjectAdapter::new(Arc::new(InMemory::new()));
        let cache = DiskCache::open(options, 1, objects.clone(), CancellationToken::new())
            .await
            .unwrap();
        (cache, objects)
    }

    fn options(dir: &Path) -> DiskCacheOptions {
        DiskCacheOptions {
            cache_dir: dir.to_path_buf(),
            full_ratio: 0.9,
            safe_ratio: 0.7,
            max_usable_space_bytes: 0,
            trim_check_interval: Duration::from_millis(10),
            async_load_period: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_write_links_into_read_area() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _objects) = cache_with(options(dir.path())).await;

        let accepted = cache
            .write_object("1_2_3_0", &Bytes::from_static(b"payload"))
            .await
            .unwrap();
        assert!(accepted);
        assert_eq!(
            cache.read_object("1_2_3_0").await,
            Some(Bytes::from_static(b"payload"))
        );
        assert!(!cache.write_area_empty().await);
    }

    #[tokio::test]
    async fn test_upload_drains_write_area_and_keeps_read_link() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, objects) = cache_with(options(dir.path())).await;

        cache
            .write_object("1_2_3_0", &Bytes::from_static(b"payload"))
            .await
            .unwrap();
        cache.upload_pending().await;

        assert!(cache.write_area_empty().await);
        assert_eq!(
            objects.get("1_2_3_0").await.unwrap(),
            Some(Bytes::from_static(b"payload"))
        );
        // Read copy survives the upload.
        assert_eq!(
            cache.read_object("1_2_3_0").await,
            Some(Bytes::from_static(b"payload"))
        );
    }

    #[tokio::test]
    async fn test_watermarks_suspend_and_trim() {
        let dir = tempfile::tempdir().unwrap();
        let mut options = options(dir.path());
        options.max_usable_space_bytes = 100;
        let (cache, objects) = cache_with(options).await;

        // Two objects pending upload: each is counted on both sides of the
        // cache (write copy + read link), 190 bytes against a 100 budget.
        cache
            .write_object("a", &Bytes::from(vec![0u8; 40]))
            .await
            .unwrap();
        cache
            .write_object("b", &Bytes::from(vec![0u8; 55]))
            .await
            .unwrap();

        // Trim can only evict read links; the un-uploaded write copies keep
        // usage over the full watermark, so inserts stay suspended.
        cache.trim().await;
        assert!(cache.suspended());
        assert!(cache.read_object("a").await.is_none());

        // Draining the uploader moves both to the object store and relinks
        // them read-side; now trimming can reach the safe watermark.
        cache.upload_pending().await;
        assert!(cache.write_area_empty().await);
        assert_eq!(objects.get("a").await.unwrap().unwrap().len(), 40);
        cache.trim().await;
        assert!(!cache.suspended());
        assert!(cache.usage_ratio().await < 0.7);
    }

    #[tokio::test]
    async fn test_suspended_cache_refuses_inserts() {
        let dir = tempfile::tempdir().unwrap();
        let (cache, _objects) = cache_with(options(dir.path())).await;
        cache.suspended.store(true, Ordering::Release);
        let accepted = cache
            .write_object("x", &Bytes::from_static(b"data"))
            .await
            .unwrap();
        assert!(!accepted);
        assert!(cache.read_object("x").await.is_none());
    }
}
