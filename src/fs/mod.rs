//! The POSIX operation surface.
//!
//! Translates shim calls into metadata RPCs (through the caches) and data
//! path operations. Attribute mutations happen under the per-inode wrapper
//! lock and ride the write-back loop; renames run the four-phase protocol
//! under a client-wide mutex.

pub mod dentry_cache;
pub mod errors;
pub mod inode_cache;
pub mod rename;
pub mod summary;
pub mod types;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::data::DataBackend;
use crate::fs::dentry_cache::DentryCache;
use crate::fs::errors::FsError;
use crate::fs::inode_cache::{InodeCache, InodeWrapper};
use crate::fs::rename::RenameOperator;
use crate::fs::summary::{SummaryDelta, SummaryManager};
use crate::fs::types::{DirEntry, EntryOut, OpenFlags, SetAttrRequest, SetTime, StatFs};
use crate::meta::client::MetaClient;
use crate::meta::types::{
    Dentry, DentryFlags, FileType, FsInfo, InodeAttr, InodeId, InodeParam, MetaStatus,
    ROOT_INODE_ID, now_pair,
};
use crate::rpc::MappingService;

const MAX_XATTR_LENGTH: usize = 8192;

pub type Result<T> = std::result::Result<T, FsError>;

/// A post-commit rename step: log, retry once, tolerate.
macro_rules! post_phase {
    ($op:ident, $phase:ident) => {
        if let Err(e) = $op.$phase().await {
            warn!(
                concat!("rename post step ", stringify!($phase), " failed, retrying: {}"),
                e
            );
            if let Err(e) = $op.$phase().await {
                warn!(
                    concat!("rename post step ", stringify!($phase), " failed again: {}"),
                    e
                );
            }
        }
    };
}

pub struct FileSystem {
    settings: Settings,
    mapping: Arc<dyn MappingService>,
    meta: Arc<MetaClient>,
    inode_cache: Arc<InodeCache>,
    dentry_cache: Arc<DentryCache>,
    summary: Arc<SummaryManager>,
    data: Arc<dyn DataBackend>,
    fs_info: RwLock<Option<FsInfo>>,
    enable_sum_in_dir: AtomicBool,
    rename_lock: Mutex<()>,
    shutdown: CancellationToken,
    flush_task: StdMutex<Option<JoinHandle<()>>>,
    mounted_at: StdMutex<Option<String>>,
}

impl FileSystem {
    /// The data backend shares the inode cache (it publishes lengths and
    /// chunk infos through it), so the caller builds both and hands them in.
    pub fn new(
        settings: Settings,
        mapping: Arc<dyn MappingService>,
        meta: Arc<MetaClient>,
        inode_cache: Arc<InodeCache>,
        data: Arc<dyn DataBackend>,
    ) -> Arc<Self> {
        let dentry_cache = DentryCache::new(
            Arc::clone(&meta),
            settings.d_cache_lru_size,
            settings.max_name_length,
        );
        let summary = SummaryManager::new(
            Arc::clone(&meta),
            Arc::clone(&inode_cache),
            Arc::clone(&dentry_cache),
            settings.list_dentry_limit,
            settings.list_dentry_threads,
        );
        Arc::new(Self {
            settings,
            mapping,
            meta,
            inode_cache,
            dentry_cache,
            summary,
            data,
            fs_info: RwLock::new(None),
            enable_sum_in_dir: AtomicBool::new(false),
            rename_lock: Mutex::new(()),
            shutdown: CancellationToken::new(),
            flush_task: StdMutex::new(None),
            mounted_at: StdMutex::new(None),
        })
    }

    pub fn inode_cache(&self) -> &Arc<InodeCache> {
        &self.inode_cache
    }

    pub fn meta(&self) -> &Arc<MetaClient> {
        &self.meta
    }

    fn sum_enabled(&self) -> bool {
        self.enable_sum_in_dir.load(Ordering::Relaxed)
    }

    fn fs_id(&self) -> u32 {
        self.meta.cache().fs_id()
    }

    fn check_name(&self, name: &str) -> Result<()> {
        if name.len() > self.settings.max_name_length {
            return Err(FsError::NameTooLong);
        }
        Ok(())
    }

    // ---- mount / umount ----

    pub async fn mount(self: &Arc<Self>, fs_name: &str, mountpoint: &str) -> Result<()> {
        let info = match self.mapping.mount_fs(fs_name, mountpoint).await {
            Ok(info) => info,
            Err(MetaStatus::MountPointExist) => return Err(FsError::Exists),
            Err(status) => {
                warn!(
                    fs_name,
                    mountpoint,
                    status = status.name(),
                    "mount_fs failed"
                );
                return Err(FsError::IoError);
            }
        };

        self.meta.cache().set_fs_id(info.fs_id);
        self.meta.cache().refresh().await?;
        self.data.set_fs_id(info.fs_id);
        // Incremental summaries are incompatible with close-to-open mode:
        // write-extend accounting would race remote flushes.
        let enable_sum = info.enable_sum_in_dir
            && self.settings.enable_sum_in_dir
            && !self.settings.enable_cto;
        self.enable_sum_in_dir.store(enable_sum, Ordering::Relaxed);
        info!(
            fs_name,
            mountpoint,
            fs_id = info.fs_id,
            enable_sum_in_dir = enable_sum,
            "mounted"
        );
        *self.fs_info.write().unwrap() = Some(info);
        *self.mounted_at.lock().unwrap() = Some(mountpoint.to_string());

        let task = self.inode_cache.start_flush_loop(
            Duration::from_secs(self.settings.flush_period_sec.max(1)),
            self.shutdown.clone(),
        );
        *self.flush_task.lock().unwrap() = Some(task);
        Ok(())
    }

    pub async fn umount(&self) -> Result<()> {
        self.flush_all().await?;

        let fs_name = self
            .fs_info
            .read()
            .unwrap()
            .as_ref()
            .map(|i| i.fs_name.clone());
        let mountpoint = self.mounted_at.lock().unwrap().take();
        if let (Some(fs_name), Some(mountpoint)) = (fs_name, mountpoint) {
            if let Err(status) = self.mapping.umount_fs(&fs_name, &mountpoint).await {
                warn!(status = status.name(), "umount_fs failed");
            }
        }

        self.shutdown.cancel();
        let task = self.flush_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        info!("unmounted");
        Ok(())
    }

    /// Drain data tiers and the inode write-back queue.
    pub async fn flush_all(&self) -> Result<()> {
        self.data.fs_sync().await?;
        self.inode_cache.flush_all().await;
        Ok(())
    }

    fn entry_out(&self, attr: InodeAttr) -> EntryOut {
        EntryOut {
            inode_id: attr.inode_id,
            attr,
            attr_timeout: self.settings.attr_timeout,
            entry_timeout: self.settings.entry_timeout,
        }
    }

    // ---- namespace operations ----

    pub async fn lookup(&self, parent: InodeId, name: &str) -> Result<EntryOut> {
        self.check_name(name)?;
        let dentry = self.dentry_cache.get(parent, name).await?;
        let wrapper = self.inode_cache.get(dentry.inode_id).await?;
        Ok(self.entry_out(wrapper.attr().await))
    }

    async fn make_node(
        &self,
        parent: InodeId,
        name: &str,
        mode: u32,
        file_type: FileType,
        rdev: u64,
        symlink_target: Option<Vec<u8>>,
        uid: u32,
        gid: u32,
    ) -> Result<EntryOut> {
        self.check_name(name)?;
        let is_dir = file_type.is_directory();
        let param = InodeParam {
            fs_id: self.fs_id(),
            length: match (&symlink_target, is_dir) {
                (Some(target), _) => target.len() as u64,
                (None, true) => 4096,
                (None, false) => 0,
            },
            mode,
            uid,
            gid,
            file_type,
            rdev,
            symlink_target,
            parent,
        };

        let wrapper = self.inode_cache.create_inode(param).await?;
        let inode_id = wrapper.inode_id();

        let mut flags = DentryFlags::empty();
        if !is_dir {
            flags = flags.with(DentryFlags::FILE_TYPE);
        }
        let dentry = Dentry {
            fs_id: self.fs_id(),
            parent_inode_id: parent,
            name: name.to_string(),
            tx_id: 0,
            inode_id,
            flags,
        };
        if let Err(status) = self.dentry_cache.create(dentry).await {
            // Unwind the inode; a half-created node must not leak.
            if let Err(e) = self.meta.delete_inode(inode_id).await {
                warn!(inode = inode_id, "cleanup of orphaned inode failed: {e}");
            }
            self.inode_cache.clear(inode_id);
            return Err(status.into());
        }

        if is_dir {
            let parent_wrapper = self.inode_cache.get(parent).await?;
            self.inode_cache.adjust_nlink(&parent_wrapper, 1).await;
        }

        if self.sum_enabled() {
            let attr = wrapper.attr().await;
            let delta = if is_dir {
                SummaryDelta::dir()
            } else {
                SummaryDelta::file(attr.length)
            };
            if let Err(e) = self.summary.update_parent_xattr(parent, delta, true).await {
                warn!(parent, "summary credit failed: {e}");
            }
        }

        debug!(parent, name, inode = inode_id, "created node");
        Ok(self.entry_out(wrapper.attr().await))
    }

    pub async fn mknod(
        &self,
        parent: InodeId,
        name: &str,
        mode: u32,
        rdev: u64,
        uid: u32,
        gid: u32,
    ) -> Result<EntryOut> {
        let file_type = if rdev != 0 {
            FileType::Special
        } else {
            FileType::Regular
        };
        self.make_node(parent, name, mode, file_type, rdev, None, uid, gid)
            .await
    }

    pub async fn mkdir(
        &self,
        parent: InodeId,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
    ) -> Result<EntryOut> {
        self.make_node(
            parent,
            name,
            libc::S_IFDIR as u32 | mode,
            FileType::Directory,
            0,
            None,
            uid,
            gid,
        )
        .await
    }

    pub async fn symlink(
        &self,
        target: &[u8],
        parent: InodeId,
        name: &str,
        uid: u32,
        gid: u32,
    ) -> Result<EntryOut> {
        if target.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        self.make_node(
            parent,
            name,
            libc::S_IFLNK as u32 | 0o777,
            FileType::Symlink,
            0,
            Some(target.to_vec()),
            uid,
            gid,
        )
        .await
    }

    pub async fn create(
        &self,
        parent: InodeId,
        name: &str,
        mode: u32,
        flags: OpenFlags,
        uid: u32,
        gid: u32,
    ) -> Result<EntryOut> {
        let entry = self
            .make_node(parent, name, mode, FileType::Regular, 0, None, uid, gid)
            .await?;
        self.open(entry.inode_id, flags).await?;
        Ok(entry)
    }

    async fn remove_node(&self, parent: InodeId, name: &str, is_dir: bool) -> Result<()> {
        self.check_name(name)?;
        let dentry = self.dentry_cache.get(parent, name).await?;
        let inode_id = dentry.inode_id;
        let wrapper = self.inode_cache.get(inode_id).await?;
        let attr = wrapper.attr().await;

        if is_dir {
            if !attr.file_type.is_directory() {
                return Err(FsError::NotDir);
            }
            let children = self.dentry_cache.list(inode_id, None, 1, false).await?;
            if !children.is_empty() {
                return Err(FsError::NotEmpty);
            }
        } else if attr.file_type.is_directory() {
            return Err(FsError::IsDir);
        }

        self.dentry_cache.delete(parent, name).await?;

        if is_dir {
            let parent_wrapper = self.inode_cache.get(parent).await?;
            self.inode_cache.adjust_nlink(&parent_wrapper, -1).await;
        }

        let reclaimed = self.inode_cache.unlink(&wrapper, parent).await?;
        if reclaimed {
            self.data.invalidate(inode_id).await;
        }

        if self.sum_enabled() {
            let delta = if is_dir {
                SummaryDelta::dir()
            } else {
                SummaryDelta::file(attr.length)
            };
            if let Err(e) = self.summary.update_parent_xattr(parent, delta, false).await {
                warn!(parent, "summary debit failed: {e}");
            }
        }
        Ok(())
    }

    pub async fn unlink(&self, parent: InodeId, name: &str) -> Result<()> {
        self.remove_node(parent, name, false).await
    }

    pub async fn rmdir(&self, parent: InodeId, name: &str) -> Result<()> {
        self.remove_node(parent, name, true).await
    }

    pub async fn link(
        &self,
        inode_id: InodeId,
        new_parent: InodeId,
        new_name: &str,
    ) -> Result<EntryOut> {
        self.check_name(new_name)?;
        let wrapper = self.inode_cache.get(inode_id).await?;
        if wrapper.attr().await.file_type.is_directory() {
            return Err(FsError::IsDir);
        }

        self.inode_cache.link(&wrapper, new_parent).await?;
        let dentry = Dentry {
            fs_id: self.fs_id(),
            parent_inode_id: new_parent,
            name: new_name.to_string(),
            tx_id: 0,
            inode_id,
            flags: DentryFlags::FILE_TYPE,
        };
        if let Err(status) = self.dentry_cache.create(dentry).await {
            if let Err(e) = self.inode_cache.unlink(&wrapper, new_parent).await {
                warn!(inode = inode_id, "link rollback failed: {e}");
            }
            return Err(status.into());
        }

        if self.sum_enabled() {
            let length = wrapper.attr().await.length;
            if let Err(e) = self
                .summary
                .update_parent_xattr(new_parent, SummaryDelta::file(length), true)
                .await
            {
                warn!(new_parent, "summary credit failed: {e}");
            }
        }
        Ok(self.entry_out(wrapper.attr().await))
    }

    pub async fn readlink(&self, inode_id: InodeId) -> Result<Vec<u8>> {
        let wrapper = self.inode_cache.get(inode_id).await?;
        let state = wrapper.lock().await;
        state
            .inode
            .symlink_target
            .clone()
            .ok_or(FsError::InvalidArgument)
    }

    pub async fn rename(
        &self,
        parent: InodeId,
        name: &str,
        new_parent: InodeId,
        new_name: &str,
    ) -> Result<()> {
        self.check_name(name)?;
        self.check_name(new_name)?;
        info!(parent, name, new_parent, new_name, "rename");

        // One rename at a time per client bounds protocol interleavings;
        // different clients serialize at the mapping service commit.
        let _guard = self.rename_lock.lock().await;

        const COMMIT_RACE_RETRIES: u32 = 3;
        let mut attempts = 0u32;
        let mut op = loop {
            attempts += 1;
            let mut op = RenameOperator::new(
                self.fs_id(),
                parent,
                name,
                new_parent,
                new_name,
                self.settings.enable_multi_mount_point_rename,
                Arc::clone(&self.meta),
                Arc::clone(&self.mapping),
                Arc::clone(&self.inode_cache),
                Arc::clone(&self.dentry_cache),
            );
            op.get_tx_id().await?;
            op.precheck().await?;
            if op.is_same_path() {
                return Ok(());
            }
            op.record_old_inode_info().await?;
            op.link_dest_parent_inode().await?;
            op.prepare_tx().await?;
            match op.commit_tx().await {
                Ok(()) => break op,
                Err(MetaStatus::StaleTx) if attempts < COMMIT_RACE_RETRIES => {
                    // Lost the race against another client's commit: refresh
                    // the tx view and rerun the whole protocol.
                    self.meta.cache().refresh().await?;
                    continue;
                }
                Err(status) => return Err(status.into()),
            }
        };

        post_phase!(op, unlink_src_parent_inode);
        post_phase!(op, unlink_old_inode);
        post_phase!(op, update_inode_parent);
        post_phase!(op, update_cache);

        if self.sum_enabled() {
            if let (Some(moved), moved_is_dir) = (op.source_inode_id(), op.source_is_dir()) {
                if let Err(e) = self
                    .summary
                    .update_after_rename(
                        parent,
                        new_parent,
                        moved,
                        moved_is_dir,
                        op.overwritten_inode_id(),
                        true,
                    )
                    .await
                {
                    warn!("rename summary fix-up failed: {e}");
                }
            }
        }
        Ok(())
    }

    // ---- attributes ----

    pub async fn getattr(&self, inode_id: InodeId) -> Result<InodeAttr> {
        let wrapper = self.inode_cache.get(inode_id).await?;
        Ok(wrapper.attr().await)
    }

    pub async fn setattr(&self, inode_id: InodeId, request: SetAttrRequest) -> Result<InodeAttr> {
        let wrapper = self.inode_cache.get(inode_id).await?;
        let size_change = {
            let mut state = wrapper.lock().await;
            let (now_secs, now_nanos) = now_pair();
            if let Some(mode) = request.mode {
                state.inode.mode = mode;
            }
            if let Some(uid) = request.uid {
                state.inode.uid = uid;
            }
            if let Some(gid) = request.gid {
                state.inode.gid = gid;
            }
            match request.atime {
                SetTime::Set { secs, nanos } => {
                    state.inode.atime = secs;
                    state.inode.atime_nsec = nanos;
                }
                SetTime::Now => {
                    state.inode.atime = now_secs;
                    state.inode.atime_nsec = now_nanos;
                }
                SetTime::NoChange => {}
            }
            match request.mtime {
                SetTime::Set { secs, nanos } => {
                    state.inode.mtime = secs;
                    state.inode.mtime_nsec = nanos;
                }
                SetTime::Now => {
                    state.inode.mtime = now_secs;
                    state.inode.mtime_nsec = now_nanos;
                }
                SetTime::NoChange => {}
            }
            match request.ctime {
                SetTime::Set { secs, nanos } => {
                    state.inode.ctime = secs;
                    state.inode.ctime_nsec = nanos;
                }
                _ => {
                    state.inode.ctime = now_secs;
                    state.inode.ctime_nsec = now_nanos;
                }
            }
            state.mark_dirty_attr();
            let old_length = state.inode.length;
            request.size.map(|size| (old_length, size))
        };

        if let Some((_, new_size)) = size_change {
            self.data.truncate(&wrapper, new_size).await?;
        }
        self.inode_cache.sync_inode(&wrapper).await?;

        if self.sum_enabled() {
            if let Some((old, new)) = size_change {
                if old != new {
                    let delta = SummaryDelta::bytes(old.abs_diff(new));
                    let parents = { wrapper.lock().await.inode.parents.clone() };
                    for parent in parents {
                        if let Err(e) = self
                            .summary
                            .update_parent_xattr(parent, delta, new > old)
                            .await
                        {
                            warn!(parent, "summary size update failed: {e}");
                        }
                    }
                }
            }
        }
        Ok(wrapper.attr().await)
    }

    // ---- directories ----

    pub async fn opendir(&self, inode_id: InodeId) -> Result<()> {
        let wrapper = self.inode_cache.get(inode_id).await?;
        if !wrapper.attr().await.file_type.is_directory() {
            return Err(FsError::NotDir);
        }
        Ok(())
    }

    /// Page through a directory. `last` is the final name of the previous
    /// page; `None` starts from the beginning.
    pub async fn readdir(
        &self,
        inode_id: InodeId,
        last: Option<String>,
        count: u32,
    ) -> Result<Vec<DirEntry>> {
        let limit = if count == 0 {
            self.settings.list_dentry_limit
        } else {
            count.min(self.settings.list_dentry_limit)
        };
        let dentries = self.dentry_cache.list(inode_id, last, limit, false).await?;
        Ok(dentries
            .into_iter()
            .map(|d| DirEntry {
                file_type: if d.is_file() {
                    FileType::Regular
                } else {
                    FileType::Directory
                },
                name: d.name,
                inode_id: d.inode_id,
            })
            .collect())
    }

    pub async fn releasedir(&self, _inode_id: InodeId) -> Result<()> {
        Ok(())
    }

    // ---- file I/O ----

    pub async fn open(&self, inode_id: InodeId, flags: OpenFlags) -> Result<()> {
        let wrapper = self.inode_cache.get(inode_id).await?;
        let old_length = {
            let mut state = wrapper.lock().await;
            self.inode_cache.open(&wrapper, &mut state);
            state.inode.length
        };

        if flags.truncate() {
            if !flags.writable() {
                // Undo the open we just took.
                let _ = self.inode_cache.release(&wrapper).await;
                return Err(FsError::NoPermission);
            }
            self.data.truncate(&wrapper, 0).await?;
            self.inode_cache.sync_inode(&wrapper).await?;
            if self.sum_enabled() && old_length > 0 {
                let parents = { wrapper.lock().await.inode.parents.clone() };
                for parent in parents {
                    if let Err(e) = self
                        .summary
                        .update_parent_xattr(parent, SummaryDelta::bytes(old_length), false)
                        .await
                    {
                        warn!(parent, "summary truncate debit failed: {e}");
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn release(&self, inode_id: InodeId) -> Result<()> {
        let wrapper = self.inode_cache.get(inode_id).await?;
        let reclaimed = self.inode_cache.release(&wrapper).await?;
        if reclaimed {
            self.data.invalidate(inode_id).await;
        }
        Ok(())
    }

    pub async fn write(&self, inode_id: InodeId, offset: u64, data: &[u8]) -> Result<usize> {
        let wrapper = self.inode_cache.get(inode_id).await?;
        let old_length = wrapper.attr().await.length;
        let written = self.data.write(&wrapper, offset, data).await?;

        if self.sum_enabled() {
            let end = offset + written as u64;
            if end > old_length {
                let grown = end - old_length;
                let parents = { wrapper.lock().await.inode.parents.clone() };
                for parent in parents {
                    if let Err(e) = self
                        .summary
                        .update_parent_xattr(parent, SummaryDelta::bytes(grown), true)
                        .await
                    {
                        warn!(parent, "summary write credit failed: {e}");
                    }
                }
            }
        }
        Ok(written)
    }

    pub async fn read(&self, inode_id: InodeId, offset: u64, size: usize) -> Result<bytes::Bytes> {
        let wrapper = self.inode_cache.get(inode_id).await?;
        let data = self.data.read(&wrapper, offset, size).await?;

        // Reads never touch the partition inline; atime rides write-back.
        {
            let mut state = wrapper.lock().await;
            let (secs, nanos) = now_pair();
            state.inode.atime = secs;
            state.inode.atime_nsec = nanos;
            state.mark_dirty_attr();
        }
        self.inode_cache.ship_to_flush(&wrapper);
        Ok(data)
    }

    /// `flush` (close). Close-to-open mode pushes data and metadata all the
    /// way down before returning.
    pub async fn flush(&self, inode_id: InodeId) -> Result<()> {
        let wrapper = self.inode_cache.get(inode_id).await?;
        self.data.flush(&wrapper).await
    }

    pub async fn fsync(&self, inode_id: InodeId, datasync: bool) -> Result<()> {
        let wrapper = self.inode_cache.get(inode_id).await?;
        self.data.flush(&wrapper).await?;
        if !datasync {
            self.inode_cache.sync_inode(&wrapper).await?;
        }
        Ok(())
    }

    // ---- extended attributes ----

    pub async fn getxattr(&self, inode_id: InodeId, name: &str, size: usize) -> Result<Vec<u8>> {
        let wrapper = self.inode_cache.get(inode_id).await?;
        let is_dir = wrapper.attr().await.file_type.is_directory();

        let value = if summary::is_summary_key(name) && is_dir {
            self.summary
                .summary_value(inode_id, name, self.sum_enabled())
                .await?
                .to_string()
        } else {
            let state = wrapper.lock().await;
            state.inode.xattrs.get(name).cloned().unwrap_or_default()
        };

        if value.is_empty() {
            return Err(FsError::NoData);
        }
        if value.len() > MAX_XATTR_LENGTH || (size > 0 && value.len() > size) {
            return Err(FsError::OutOfRange);
        }
        Ok(value.into_bytes())
    }

    pub async fn listxattr(&self, inode_id: InodeId) -> Result<Vec<String>> {
        let wrapper = self.inode_cache.get(inode_id).await?;
        let (mut keys, is_dir) = {
            let state = wrapper.lock().await;
            (
                state.inode.xattrs.keys().cloned().collect::<Vec<_>>(),
                state.inode.is_directory(),
            )
        };
        if is_dir {
            keys.extend(summary::RECURSIVE_KEYS.iter().map(|k| k.to_string()));
        }
        Ok(keys)
    }

    pub async fn statfs(&self, _inode_id: InodeId) -> Result<StatFs> {
        let info = self
            .fs_info
            .read()
            .unwrap()
            .clone()
            .ok_or(FsError::Internal)?;
        let block_size = info.block_size.max(1);
        let blocks = if info.capacity > 0 {
            info.capacity / block_size as u64
        } else {
            10 << 30
        };
        Ok(StatFs {
            block_size,
            blocks,
            blocks_free: blocks.saturating_sub(1),
            blocks_available: blocks.saturating_sub(1),
            files: 1 << 30,
            files_free: (1 << 30) - 1,
            name_max: self.settings.max_name_length as u32,
            fs_id: info.fs_id as u64,
        })
    }

    pub fn root_inode(&self) -> InodeId {
        ROOT_INODE_ID
    }
}
