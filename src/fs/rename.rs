//! Cross-shard rename.
//!
//! The operator runs the four-phase protocol: resolve both parents' tx ids,
//! precheck source and destination, pre-link the destination parent, stage
//! prepared dentries on each partition, then commit the tx-id batch at the
//! mapping service — the single linearization point. Prepared dentries are
//! invisible until commit, so a crash in between leaves the old view intact
//! and a later rename overwrites the stale staging. Post-commit steps are
//! best-effort: each is retried once and then tolerated, since correctness
//! rests on the commit alone.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::fs::dentry_cache::DentryCache;
use crate::fs::errors::FsError;
use crate::fs::inode_cache::{InodeCache, InodeWrapper};
use crate::meta::client::MetaClient;
use crate::meta::types::{
    Dentry, DentryFlags, FsId, InodeId, MetaStatus, PartitionId, PartitionTxId, TxId, now_pair,
};
use crate::rpc::MappingService;

pub struct RenameOperator {
    fs_id: FsId,
    parent: InodeId,
    name: String,
    new_parent: InodeId,
    new_name: String,
    enable_cross_partition: bool,

    meta: Arc<MetaClient>,
    mapping: Arc<dyn MappingService>,
    inode_cache: Arc<InodeCache>,
    dentry_cache: Arc<DentryCache>,

    src_route: Option<(PartitionId, TxId)>,
    dst_route: Option<(PartitionId, TxId)>,
    src_dentry: Option<Dentry>,
    src_is_dir: bool,
    dst_dentry: Option<Dentry>,
    old_inode: Option<Arc<InodeWrapper>>,
    same_path: bool,
    /// Tx ids the prepares were actually stamped with; the commit proposes
    /// exactly these.
    prepared_src_tx: TxId,
    prepared_dst_tx: TxId,
}

impl RenameOperator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fs_id: FsId,
        parent: InodeId,
        name: &str,
        new_parent: InodeId,
        new_name: &str,
        enable_cross_partition: bool,
        meta: Arc<MetaClient>,
        mapping: Arc<dyn MappingService>,
        inode_cache: Arc<InodeCache>,
        dentry_cache: Arc<DentryCache>,
    ) -> Self {
        Self {
            fs_id,
            parent,
            name: name.to_string(),
            new_parent,
            new_name: new_name.to_string(),
            enable_cross_partition,
            meta,
            mapping,
            inode_cache,
            dentry_cache,
            src_route: None,
            dst_route: None,
            src_dentry: None,
            src_is_dir: false,
            dst_dentry: None,
            old_inode: None,
            same_path: false,
            prepared_src_tx: 0,
            prepared_dst_tx: 0,
        }
    }

    pub fn is_same_path(&self) -> bool {
        self.same_path
    }

    pub fn crosses_parents(&self) -> bool {
        self.parent != self.new_parent
    }

    pub fn source_inode_id(&self) -> Option<InodeId> {
        self.src_dentry.as_ref().map(|d| d.inode_id)
    }

    pub fn source_is_dir(&self) -> bool {
        self.src_is_dir
    }

    pub fn overwritten_inode_id(&self) -> Option<InodeId> {
        self.dst_dentry.as_ref().map(|d| d.inode_id)
    }

    fn src(&self) -> (PartitionId, TxId) {
        self.src_route.expect("get_tx_id ran")
    }

    fn dst(&self) -> (PartitionId, TxId) {
        self.dst_route.expect("get_tx_id ran")
    }

    fn single_partition(&self) -> bool {
        self.src().0 == self.dst().0
    }

    /// Phase 1: resolve both parents' partitions and current tx ids.
    pub async fn get_tx_id(&mut self) -> Result<(), FsError> {
        let src = self.meta.get_tx_id(self.parent).await?;
        let dst = self.meta.get_tx_id(self.new_parent).await?;
        if src.0 != dst.0 && !self.enable_cross_partition {
            return Err(FsError::NotSupported);
        }
        self.src_route = Some(src);
        self.dst_route = Some(dst);
        Ok(())
    }

    /// Phase 2: source must exist; destination must be absent, an
    /// overwritable file, or an empty directory matching the source type.
    pub async fn precheck(&mut self) -> Result<(), FsError> {
        if self.parent == self.new_parent && self.name == self.new_name {
            self.same_path = true;
            return Ok(());
        }

        let src = self.dentry_cache.get(self.parent, &self.name).await?;
        let src_attr = self.inode_cache.get(src.inode_id).await?.attr().await;
        self.src_is_dir = src_attr.file_type.is_directory();
        self.src_dentry = Some(src);

        match self.dentry_cache.get(self.new_parent, &self.new_name).await {
            Ok(dst) => {
                let dst_attr = self.inode_cache.get(dst.inode_id).await?.attr().await;
                let dst_is_dir = dst_attr.file_type.is_directory();
                if self.src_is_dir && !dst_is_dir {
                    return Err(FsError::NotDir);
                }
                if !self.src_is_dir && dst_is_dir {
                    return Err(FsError::IsDir);
                }
                if dst_is_dir {
                    let children = self
                        .dentry_cache
                        .list(dst.inode_id, None, 1, false)
                        .await?;
                    if !children.is_empty() {
                        return Err(FsError::NotEmpty);
                    }
                }
                self.dst_dentry = Some(dst);
            }
            Err(MetaStatus::NotFound) => {}
            Err(status) => return Err(status.into()),
        }
        Ok(())
    }

    /// Phase 2b: pin the overwritten inode so post-commit unlink can't miss.
    pub async fn record_old_inode_info(&mut self) -> Result<(), FsError> {
        if let Some(dst) = &self.dst_dentry {
            self.old_inode = Some(self.inode_cache.get(dst.inode_id).await?);
        }
        Ok(())
    }

    /// Phase 3: pre-increment the destination parent's link count for a
    /// directory moving in, and persist it before any dentry is staged.
    pub async fn link_dest_parent_inode(&mut self) -> Result<(), FsError> {
        if !self.src_is_dir || !self.crosses_parents() {
            return Ok(());
        }
        let parent = self.inode_cache.get(self.new_parent).await?;
        self.inode_cache.adjust_nlink(&parent, 1).await;
        self.inode_cache.sync_inode(&parent).await?;
        Ok(())
    }

    /// Prepared source copy: delete mark plus prepare flag. The tx id is
    /// stamped at dispatch.
    fn prepared_src_dentry(&self) -> Dentry {
        let src = self.src_dentry.as_ref().expect("precheck ran");
        Dentry {
            fs_id: self.fs_id,
            parent_inode_id: self.parent,
            name: self.name.clone(),
            tx_id: 0,
            inode_id: src.inode_id,
            flags: src
                .flags
                .with(DentryFlags::DELETE_MARK)
                .with(DentryFlags::TX_PREPARE),
        }
    }

    fn prepared_dst_dentry(&self) -> Dentry {
        let src = self.src_dentry.as_ref().expect("precheck ran");
        let mut flags = DentryFlags::TX_PREPARE;
        if !self.src_is_dir {
            flags = flags.with(DentryFlags::FILE_TYPE);
        }
        Dentry {
            fs_id: self.fs_id,
            parent_inode_id: self.new_parent,
            name: self.new_name.clone(),
            tx_id: 0,
            inode_id: src.inode_id,
            flags,
        }
    }

    /// Phase 4: stage prepared dentries on every involved partition. Either
    /// prepare landing alone is harmless; neither is visible until commit.
    /// The client stamps each set one past the partition's committed tx, so
    /// a prepare that raced a foreign commit restamps instead of leaving
    /// visible garbage behind.
    pub async fn prepare_tx(&mut self) -> Result<(), FsError> {
        let src_dentry = self.prepared_src_dentry();
        let dst_dentry = self.prepared_dst_dentry();
        let (src_partition, _) = self.src();
        let (dst_partition, _) = self.dst();

        if self.single_partition() {
            let tx = self
                .meta
                .prepare_rename_tx(src_partition, vec![src_dentry, dst_dentry])
                .await?;
            self.prepared_src_tx = tx;
            self.prepared_dst_tx = tx;
        } else {
            self.prepared_src_tx = self
                .meta
                .prepare_rename_tx(src_partition, vec![src_dentry])
                .await?;
            self.prepared_dst_tx = self
                .meta
                .prepare_rename_tx(dst_partition, vec![dst_dentry])
                .await?;
        }
        debug!(
            fs_id = self.fs_id,
            src = %self.name,
            dst = %self.new_name,
            src_tx = self.prepared_src_tx,
            dst_tx = self.prepared_dst_tx,
            "rename prepared"
        );
        Ok(())
    }

    /// Phase 5: advance both partitions' tx ids in one atomic batch. Success
    /// makes the rename visible everywhere; failure leaves the prepared
    /// dentries invisible forever. Returns the raw status so the driver can
    /// rerun the whole protocol on a lost `StaleTx` race.
    pub async fn commit_tx(&mut self) -> Result<(), MetaStatus> {
        let (src_partition, _) = self.src();
        let (dst_partition, _) = self.dst();
        let mut batch = vec![PartitionTxId {
            partition_id: src_partition,
            tx_id: self.prepared_src_tx,
        }];
        if !self.single_partition() {
            batch.push(PartitionTxId {
                partition_id: dst_partition,
                tx_id: self.prepared_dst_tx,
            });
        }
        self.mapping
            .commit_tx(self.fs_id, batch)
            .await
            .map_err(|status| {
                warn!(
                    fs_id = self.fs_id,
                    src = %self.name,
                    dst = %self.new_name,
                    status = status.name(),
                    "rename commit failed, aborting"
                );
                status
            })?;
        info!(
            fs_id = self.fs_id,
            parent = self.parent,
            name = %self.name,
            new_parent = self.new_parent,
            new_name = %self.new_name,
            "rename committed"
        );
        Ok(())
    }

    // ---- best-effort post-commit steps ----

    pub async fn unlink_src_parent_inode(&mut self) -> Result<(), FsError> {
        if !self.src_is_dir || !self.crosses_parents() {
            return Ok(());
        }
        let parent = self.inode_cache.get(self.parent).await?;
        self.inode_cache.adjust_nlink(&parent, -1).await;
        Ok(())
    }

    pub async fn unlink_old_inode(&mut self) -> Result<(), FsError> {
        if let Some(old) = self.old_inode.clone() {
            self.inode_cache.unlink(&old, self.new_parent).await?;
        }
        Ok(())
    }

    pub async fn update_inode_parent(&mut self) -> Result<(), FsError> {
        if !self.crosses_parents() {
            return Ok(());
        }
        let Some(src) = &self.src_dentry else {
            return Ok(());
        };
        let wrapper = self.inode_cache.get(src.inode_id).await?;
        {
            let mut state = wrapper.lock().await;
            if let Some(pos) = state.inode.parents.iter().position(|p| *p == self.parent) {
                state.inode.parents.remove(pos);
            }
            state.inode.parents.push(self.new_parent);
            let (secs, nanos) = now_pair();
            state.inode.ctime = secs;
            state.inode.ctime_nsec = nanos;
            state.mark_dirty_attr();
        }
        self.inode_cache.sync_inode(&wrapper).await?;
        Ok(())
    }

    pub async fn update_cache(&mut self) -> Result<(), FsError> {
        self.dentry_cache.delete_cache(self.parent, &self.name);
        let committed = Dentry {
            tx_id: self.prepared_dst_tx,
            flags: self
                .prepared_dst_dentry()
                .flags
                .without(DentryFlags::TX_PREPARE),
            ..self.prepared_dst_dentry()
        };
        self.dentry_cache.insert_or_replace(committed);

        let (src_partition, _) = self.src();
        let (dst_partition, _) = self.dst();
        self.meta.set_tx_id(src_partition, self.prepared_src_tx);
        if !self.single_partition() {
            self.meta.set_tx_id(dst_partition, self.prepared_dst_tx);
        }
        Ok(())
    }
}
