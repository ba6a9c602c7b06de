//! Directory subtree counters surfaced as extended attributes.
//!
//! Four direct counters per directory (entries, files, subdirs, fbytes) and
//! their recursive variants. With `enable_sum_in_dir` the direct counters
//! are maintained incrementally on every mutating operation and recursive
//! reads only walk directory inodes; otherwise every read walks the subtree
//! and sums real attributes. Updates are best-effort and outside any rename
//! transaction: counters are eventually consistent.

use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;

use crate::fs::dentry_cache::DentryCache;
use crate::fs::errors::FsError;
use crate::fs::inode_cache::InodeCache;
use crate::meta::client::MetaClient;
use crate::meta::types::{Dentry, InodeId, MetaStatus};

pub const XATTR_PREFIX: &str = "tierfs.dir.";
pub const XATTR_ENTRIES: &str = "tierfs.dir.entries";
pub const XATTR_FILES: &str = "tierfs.dir.files";
pub const XATTR_SUBDIRS: &str = "tierfs.dir.subdirs";
pub const XATTR_FBYTES: &str = "tierfs.dir.fbytes";
pub const XATTR_RENTRIES: &str = "tierfs.dir.rentries";
pub const XATTR_RFILES: &str = "tierfs.dir.rfiles";
pub const XATTR_RSUBDIRS: &str = "tierfs.dir.rsubdirs";
pub const XATTR_RFBYTES: &str = "tierfs.dir.rfbytes";

pub const DIRECT_KEYS: [&str; 4] = [XATTR_ENTRIES, XATTR_FILES, XATTR_SUBDIRS, XATTR_FBYTES];
pub const RECURSIVE_KEYS: [&str; 4] = [XATTR_RENTRIES, XATTR_RFILES, XATTR_RSUBDIRS, XATTR_RFBYTES];

pub fn is_summary_key(name: &str) -> bool {
    name.starts_with(XATTR_PREFIX)
}

pub fn is_direct_key(name: &str) -> bool {
    DIRECT_KEYS.contains(&name)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummaryDelta {
    pub entries: u64,
    pub files: u64,
    pub subdirs: u64,
    pub fbytes: u64,
}

impl SummaryDelta {
    pub fn file(length: u64) -> Self {
        Self {
            entries: 1,
            files: 1,
            subdirs: 0,
            fbytes: length,
        }
    }

    pub fn dir() -> Self {
        Self {
            entries: 1,
            files: 0,
            subdirs: 1,
            fbytes: 0,
        }
    }

    pub fn bytes(fbytes: u64) -> Self {
        Self {
            entries: 0,
            files: 0,
            subdirs: 0,
            fbytes,
        }
    }

    fn add(&mut self, other: &SummaryDelta) {
        self.entries += other.entries;
        self.files += other.files;
        self.subdirs += other.subdirs;
        self.fbytes += other.fbytes;
    }

    fn value_of(&self, key: &str) -> u64 {
        match key {
            XATTR_ENTRIES | XATTR_RENTRIES => self.entries,
            XATTR_FILES | XATTR_RFILES => self.files,
            XATTR_SUBDIRS | XATTR_RSUBDIRS => self.subdirs,
            XATTR_FBYTES | XATTR_RFBYTES => self.fbytes,
            _ => 0,
        }
    }
}

fn counter(xattrs: &std::collections::BTreeMap<String, String>, key: &str) -> u64 {
    xattrs.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
}

pub struct SummaryManager {
    meta: Arc<MetaClient>,
    inode_cache: Arc<InodeCache>,
    dentry_cache: Arc<DentryCache>,
    list_limit: u32,
    list_threads: usize,
}

impl SummaryManager {
    pub fn new(
        meta: Arc<MetaClient>,
        inode_cache: Arc<InodeCache>,
        dentry_cache: Arc<DentryCache>,
        list_limit: u32,
        list_threads: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            meta,
            inode_cache,
            dentry_cache,
            list_limit,
            list_threads: list_threads.max(1),
        })
    }

    /// Apply a delta to one directory's direct counters. Best-effort: the
    /// caller logs and moves on if this fails.
    pub async fn update_parent_xattr(
        &self,
        parent: InodeId,
        delta: SummaryDelta,
        add: bool,
    ) -> Result<(), FsError> {
        let wrapper = self.inode_cache.get(parent).await?;
        {
            let mut state = wrapper.lock().await;
            for key in DIRECT_KEYS {
                let amount = delta.value_of(key);
                if amount == 0 {
                    continue;
                }
                let current = counter(&state.inode.xattrs, key);
                let next = if add {
                    current.saturating_add(amount)
                } else {
                    current.saturating_sub(amount)
                };
                state.inode.xattrs.insert(key.to_string(), next.to_string());
            }
            state.mark_dirty_attr();
        }
        self.inode_cache.ship_to_flush(&wrapper);
        Ok(())
    }

    /// Value of one summary key for a directory.
    pub async fn summary_value(
        &self,
        dir: InodeId,
        key: &str,
        enable_sum_in_dir: bool,
    ) -> Result<u64, FsError> {
        let recursive = !is_direct_key(key);
        let totals = if enable_sum_in_dir {
            if recursive {
                self.fast_recursive(dir).await?
            } else {
                self.local_counters(dir).await?
            }
        } else if recursive {
            self.walk_recursive(dir).await?
        } else {
            self.one_layer(dir).await?
        };
        Ok(totals.value_of(key))
    }

    async fn local_counters(&self, dir: InodeId) -> Result<SummaryDelta, FsError> {
        let wrapper = self.inode_cache.get(dir).await?;
        let state = wrapper.lock().await;
        Ok(SummaryDelta {
            entries: counter(&state.inode.xattrs, XATTR_ENTRIES),
            files: counter(&state.inode.xattrs, XATTR_FILES),
            subdirs: counter(&state.inode.xattrs, XATTR_SUBDIRS),
            fbytes: counter(&state.inode.xattrs, XATTR_FBYTES),
        })
    }

    /// One directory level, summed from real child attributes.
    async fn one_layer(&self, dir: InodeId) -> Result<SummaryDelta, FsError> {
        let children = self.dentry_cache.list_all(dir, self.list_limit).await?;
        let mut totals = SummaryDelta::default();
        totals.entries = children.len() as u64;

        let (files, dirs): (Vec<&Dentry>, Vec<&Dentry>) =
            children.iter().partition(|d| d.is_file());
        totals.files = files.len() as u64;
        totals.subdirs = dirs.len() as u64;

        let attrs = self
            .meta
            .batch_get_inode_attr(files.iter().map(|d| d.inode_id).collect())
            .await?;
        totals.fbytes = attrs.iter().map(|a| a.length).sum();
        Ok(totals)
    }

    /// Recursive totals by walking every inode of the subtree.
    async fn walk_recursive(&self, root: InodeId) -> Result<SummaryDelta, FsError> {
        let mut totals = SummaryDelta::default();
        let mut queue = VecDeque::from([root]);
        while !queue.is_empty() {
            let level: Vec<InodeId> = queue.drain(..).collect();
            let listings: Vec<Result<Vec<Dentry>, MetaStatus>> = stream::iter(level)
                .map(|dir| {
                    let cache = Arc::clone(&self.dentry_cache);
                    let limit = self.list_limit;
                    async move { cache.list_all(dir, limit).await }
                })
                .buffer_unordered(self.list_threads)
                .collect()
                .await;

            let mut file_ids = Vec::new();
            for listing in listings {
                for dentry in listing? {
                    totals.entries += 1;
                    if dentry.is_file() {
                        totals.files += 1;
                        file_ids.push(dentry.inode_id);
                    } else {
                        totals.subdirs += 1;
                        queue.push_back(dentry.inode_id);
                    }
                }
            }
            let attrs = self.meta.batch_get_inode_attr(file_ids).await?;
            totals.fbytes += attrs.iter().map(|a| a.length).sum::<u64>();
        }
        Ok(totals)
    }

    /// Recursive totals from maintained per-directory counters: only
    /// directory inodes are touched.
    async fn fast_recursive(&self, root: InodeId) -> Result<SummaryDelta, FsError> {
        let mut totals = SummaryDelta::default();
        let mut queue = VecDeque::from([root]);
        while !queue.is_empty() {
            let level: Vec<InodeId> = queue.drain(..).collect();
            let xattrs = self.meta.batch_get_xattr(level.clone()).await?;
            for xattr in &xattrs {
                totals.add(&SummaryDelta {
                    entries: counter(&xattr.xattrs, XATTR_ENTRIES),
                    files: counter(&xattr.xattrs, XATTR_FILES),
                    subdirs: counter(&xattr.xattrs, XATTR_SUBDIRS),
                    fbytes: counter(&xattr.xattrs, XATTR_FBYTES),
                });
            }

            let listings: Vec<Result<Vec<Dentry>, MetaStatus>> = stream::iter(level)
                .map(|dir| {
                    let cache = Arc::clone(&self.dentry_cache);
                    let limit = self.list_limit;
                    async move { cache.list(dir, None, limit, true).await }
                })
                .buffer_unordered(self.list_threads)
                .collect()
                .await;
            for listing in listings {
                for dentry in listing? {
                    queue.push_back(dentry.inode_id);
                }
            }
        }
        Ok(totals)
    }

    /// Post-commit fix-up for a rename across parents: debit the moved
    /// subtree from the old parent, credit it to the new one, and debit an
    /// overwritten file from the destination.
    pub async fn update_after_rename(
        &self,
        parent: InodeId,
        new_parent: InodeId,
        moved_inode: InodeId,
        moved_is_dir: bool,
        overwritten: Option<InodeId>,
        enable_sum_in_dir: bool,
    ) -> Result<(), FsError> {
        if let Some(old_inode) = overwritten {
            // The old destination entry is gone regardless of parents.
            let length = match self.meta.get_inode_attr(old_inode).await {
                Ok(attr) => attr.length,
                Err(MetaStatus::NotFound) => 0,
                Err(status) => return Err(status.into()),
            };
            self.update_parent_xattr(new_parent, SummaryDelta::file(length), false)
                .await?;
        }

        if parent == new_parent {
            return Ok(());
        }

        let moved = if moved_is_dir {
            let subtree = if enable_sum_in_dir {
                self.fast_recursive(moved_inode).await?
            } else {
                self.walk_recursive(moved_inode).await?
            };
            let mut delta = SummaryDelta::dir();
            delta.add(&subtree);
            delta
        } else {
            let attr = self.meta.get_inode_attr(moved_inode).await?;
            SummaryDelta::file(attr.length)
        };
        if let Err(e) = self.update_parent_xattr(parent, moved, false).await {
            warn!(parent, "rename summary debit failed: {e}");
        }
        if let Err(e) = self.update_parent_xattr(new_parent, moved, true).await {
            warn!(new_parent, "rename summary credit failed: {e}");
        }
        Ok(())
    }
}
