//! One metadata shard: the inode, dentry, and chunk-info tables for a range
//! of parent inode ids, rooted in the KV engine.
//!
//! Dentries are versioned by transaction id. A read at tx `T` sees, for each
//! name, the newest version with `tx_id <= T` — unless it carries a delete
//! mark. Prepared rename dentries are written at `T+1` and stay invisible
//! until the mapping service advances the partition tx, which is what makes
//! cross-shard renames atomic from any reader's point of view.

use bytes::Bytes;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, warn};

use crate::meta::types::{
    ChunkInfo, ChunkInfoList, ChunkInfoMap, Dentry, DentryFlags, FileType, FsId, Inode, InodeAttr,
    InodeId, InodeParam, MetaStatus, PartitionId, PartitionInfo, PartitionStatus, TxId,
    UpdateInodeRequest, Xattr, now_pair,
};
use crate::storage::codec::{self, TableHandle, TableTag};
use crate::storage::{JournalEntry, JournalOp, StorageEngine, StorageError};

pub type Result<T> = std::result::Result<T, MetaStatus>;

fn map_storage_err(err: StorageError) -> MetaStatus {
    match err {
        StorageError::ResourceExhausted => MetaStatus::ResourceExhausted,
        other => {
            warn!("storage failure: {other}");
            MetaStatus::Internal
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| {
        warn!("record decode failed: {e}");
        MetaStatus::Internal
    })
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Bytes> {
    bincode::serialize(value).map(Bytes::from).map_err(|e| {
        warn!("record encode failed: {e}");
        MetaStatus::Internal
    })
}

#[derive(Debug)]
pub struct Partition {
    info: RwLock<PartitionInfo>,
    engine: Arc<StorageEngine>,
    inode_table: TableHandle,
    dentry_table: TableHandle,
    chunk_table: TableHandle,
    next_id: AtomicU64,
    chunk_seq: AtomicU64,
    inode_count: AtomicU64,
    dentry_count: AtomicU64,
    /// Serialized bytes of chunk-info lists per inode; consulted before
    /// padding to decide whether a get should stream instead.
    chunk_meta_bytes: DashMap<InodeId, u64>,
    /// Serializes read-modify-write sequences; plain reads go around it.
    mutation_lock: Mutex<()>,
}

impl Partition {
    pub fn new(info: PartitionInfo, engine: Arc<StorageEngine>) -> Self {
        let id = info.partition_id;
        let next_id = info.next_id.max(info.start);
        Self {
            info: RwLock::new(info),
            engine,
            inode_table: TableHandle::new(TableTag::Inode, id),
            dentry_table: TableHandle::new(TableTag::Dentry, id),
            chunk_table: TableHandle::new(TableTag::ChunkInfo, id),
            next_id: AtomicU64::new(next_id),
            chunk_seq: AtomicU64::new(1),
            inode_count: AtomicU64::new(0),
            dentry_count: AtomicU64::new(0),
            chunk_meta_bytes: DashMap::new(),
            mutation_lock: Mutex::new(()),
        }
    }

    /// Rebuild in-memory counters from the engine after a snapshot load.
    pub fn rebuild_indices(&self) -> Result<()> {
        let mut inode_count = 0u64;
        let info = self.info();
        for id in info.start..info.next_id {
            if self
                .engine
                .get(self.inode_table, &codec::inode_key(id))
                .is_some()
            {
                inode_count += 1;
            }
        }
        self.inode_count.store(inode_count, Ordering::Relaxed);
        self.dentry_count.store(
            self.engine.scan_table(self.dentry_table).len() as u64,
            Ordering::Relaxed,
        );

        self.chunk_meta_bytes.clear();
        let mut max_seq = 0u64;
        for (key, value) in self.engine.scan_table(self.chunk_table) {
            if let Some((inode, _, seq)) = codec::parse_chunk_info_key(&key) {
                *self.chunk_meta_bytes.entry(inode).or_insert(0) += value.len() as u64;
                max_seq = max_seq.max(seq);
            }
        }
        self.chunk_seq.store(max_seq + 1, Ordering::Relaxed);
        Ok(())
    }

    pub fn info(&self) -> PartitionInfo {
        let mut info = self.info.read().unwrap().clone();
        info.next_id = self.next_id.load(Ordering::Relaxed);
        info
    }

    pub fn partition_id(&self) -> PartitionId {
        self.info.read().unwrap().partition_id
    }

    pub fn status(&self) -> PartitionStatus {
        self.info.read().unwrap().status
    }

    pub fn set_status(&self, status: PartitionStatus) {
        self.info.write().unwrap().status = status;
    }

    pub fn tx_id(&self) -> TxId {
        self.info.read().unwrap().tx_id
    }

    /// Advance the committed tx id; pushed down from the mapping service
    /// after each successful commit. Never regresses.
    pub fn set_tx_id(&self, tx_id: TxId) {
        let mut info = self.info.write().unwrap();
        if tx_id > info.tx_id {
            info.tx_id = tx_id;
        }
    }

    pub fn inode_count(&self) -> u64 {
        self.inode_count.load(Ordering::Relaxed)
    }

    pub fn dentry_count(&self) -> u64 {
        self.dentry_count.load(Ordering::Relaxed)
    }

    fn check_writable(&self) -> Result<()> {
        match self.status() {
            PartitionStatus::ReadWrite => Ok(()),
            PartitionStatus::Deleting => Err(MetaStatus::PartitionDeleting),
        }
    }

    fn apply_journal(&self, journal: &[JournalEntry]) {
        for entry in journal {
            match (entry.table.tag(), &entry.op) {
                (TableTag::Inode, JournalOp::Put { replaced: false, .. }) => {
                    self.inode_count.fetch_add(1, Ordering::Relaxed);
                }
                (TableTag::Inode, JournalOp::Delete { existed: true }) => {
                    self.inode_count.fetch_sub(1, Ordering::Relaxed);
                }
                (TableTag::Dentry, JournalOp::Put { replaced: false, .. }) => {
                    self.dentry_count.fetch_add(1, Ordering::Relaxed);
                }
                (TableTag::Dentry, JournalOp::Delete { existed: true }) => {
                    self.dentry_count.fetch_sub(1, Ordering::Relaxed);
                }
                _ => {}
            }
        }
    }

    // ---- inode operations ----

    pub fn create_inode(&self, param: &InodeParam) -> Result<Inode> {
        self.check_writable()?;
        let _guard = self.mutation_lock.lock().unwrap();

        let end = self.info.read().unwrap().end;
        let inode_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if inode_id >= end {
            self.next_id.store(end, Ordering::SeqCst);
            warn!(partition = self.partition_id(), "inode id range exhausted");
            return Err(MetaStatus::ResourceExhausted);
        }

        let (secs, nanos) = now_pair();
        let inode = Inode {
            fs_id: param.fs_id,
            inode_id,
            length: param.length,
            mode: param.mode,
            uid: param.uid,
            gid: param.gid,
            atime: secs,
            atime_nsec: nanos,
            mtime: secs,
            mtime_nsec: nanos,
            ctime: secs,
            ctime_nsec: nanos,
            nlink: if param.file_type.is_directory() { 2 } else { 1 },
            file_type: param.file_type,
            rdev: param.rdev,
            symlink_target: param.symlink_target.clone(),
            parents: vec![param.parent],
            xattrs: Default::default(),
            chunk_map: Default::default(),
            volume_extents: Default::default(),
        };

        let key = codec::inode_key(inode_id);
        if self.engine.get(self.inode_table, &key).is_some() {
            return Err(MetaStatus::Exists);
        }
        let mut txn = self.engine.begin_transaction();
        txn.put(self.inode_table, &key, encode(&inode)?)
            .map_err(map_storage_err)?;
        let journal = txn.commit().map_err(map_storage_err)?;
        self.apply_journal(&journal);
        Ok(inode)
    }

    pub fn get_inode(&self, fs_id: FsId, inode_id: InodeId) -> Result<Inode> {
        let bytes = self
            .engine
            .get(self.inode_table, &codec::inode_key(inode_id))
            .ok_or(MetaStatus::NotFound)?;
        let inode: Inode = decode(&bytes)?;
        if inode.fs_id != fs_id {
            return Err(MetaStatus::NotFound);
        }
        Ok(inode)
    }

    pub fn get_inode_attr(&self, fs_id: FsId, inode_id: InodeId) -> Result<InodeAttr> {
        Ok(self.get_inode(fs_id, inode_id)?.attr())
    }

    pub fn get_xattr(&self, fs_id: FsId, inode_id: InodeId) -> Result<Xattr> {
        Ok(self.get_inode(fs_id, inode_id)?.xattr())
    }

    pub fn update_inode(&self, req: &UpdateInodeRequest) -> Result<()> {
        self.check_writable()?;
        let _guard = self.mutation_lock.lock().unwrap();

        let key = codec::inode_key(req.attr.inode_id);
        let bytes = self
            .engine
            .get(self.inode_table, &key)
            .ok_or(MetaStatus::NotFound)?;
        let mut inode: Inode = decode(&bytes)?;
        if inode.fs_id != req.attr.fs_id {
            return Err(MetaStatus::NotFound);
        }

        inode.length = req.attr.length;
        inode.mode = req.attr.mode;
        inode.uid = req.attr.uid;
        inode.gid = req.attr.gid;
        inode.atime = req.attr.atime;
        inode.atime_nsec = req.attr.atime_nsec;
        inode.mtime = req.attr.mtime;
        inode.mtime_nsec = req.attr.mtime_nsec;
        inode.ctime = req.attr.ctime;
        inode.ctime_nsec = req.attr.ctime_nsec;
        inode.nlink = req.attr.nlink;
        inode.parents = req.parents.clone();
        inode.xattrs = req.xattrs.clone();

        let mut txn = self.engine.begin_transaction();
        if let Some(chunk_map) = &req.chunk_map {
            // Whole space-map rewrite: drop the existing lists, then one
            // record per chunk index.
            let mut bytes_after = 0u64;
            for (k, _) in self.engine.scan_prefix(
                self.chunk_table,
                &codec::chunk_info_inode_prefix(inode.inode_id),
            ) {
                txn.delete(self.chunk_table, &k);
            }
            for (index, list) in chunk_map {
                if list.is_empty() {
                    continue;
                }
                let seq = self.chunk_seq.fetch_add(1, Ordering::SeqCst);
                let value = encode(list)?;
                bytes_after += value.len() as u64;
                txn.put(
                    self.chunk_table,
                    &codec::chunk_info_key(inode.inode_id, *index, seq),
                    value,
                )
                .map_err(map_storage_err)?;
            }
            self.chunk_meta_bytes.insert(inode.inode_id, bytes_after);
        }
        txn.put(self.inode_table, &key, encode(&inode)?)
            .map_err(map_storage_err)?;
        let journal = txn.commit().map_err(map_storage_err)?;
        self.apply_journal(&journal);
        Ok(())
    }

    /// Remove the inode and its chunk-info lists, returning the reclaimed
    /// chunk infos so the trash collector can delete the backing objects.
    pub fn delete_inode(&self, fs_id: FsId, inode_id: InodeId) -> Result<Vec<ChunkInfo>> {
        let _guard = self.mutation_lock.lock().unwrap();

        let key = codec::inode_key(inode_id);
        let bytes = self
            .engine
            .get(self.inode_table, &key)
            .ok_or(MetaStatus::NotFound)?;
        let inode: Inode = decode(&bytes)?;
        if inode.fs_id != fs_id {
            return Err(MetaStatus::NotFound);
        }

        let mut reclaimed = Vec::new();
        let mut txn = self.engine.begin_transaction();
        for (k, v) in self
            .engine
            .scan_prefix(self.chunk_table, &codec::chunk_info_inode_prefix(inode_id))
        {
            let list: ChunkInfoList = decode(&v)?;
            reclaimed.extend(list.entries);
            txn.delete(self.chunk_table, &k);
        }
        txn.delete(self.inode_table, &key);
        let journal = txn.commit().map_err(map_storage_err)?;
        self.apply_journal(&journal);
        self.chunk_meta_bytes.remove(&inode_id);
        debug!(
            fs_id,
            inode_id,
            chunks = reclaimed.len(),
            "deleted inode from partition"
        );
        Ok(reclaimed)
    }

    // ---- dentry operations ----

    /// Newest visible version of `(parent, name)` at transaction `tx_id`.
    fn visible_dentry(&self, parent: InodeId, name: &str, tx_id: TxId) -> Result<Option<Dentry>> {
        for (key, value) in self.engine.scan_prefix(
            self.dentry_table,
            &codec::dentry_name_prefix(parent, name),
        ) {
            let (_, _, version) = codec::parse_dentry_key(&key).ok_or(MetaStatus::Internal)?;
            if version > tx_id {
                continue;
            }
            let dentry: Dentry = decode(&value)?;
            if dentry.delete_marked() {
                return Ok(None);
            }
            return Ok(Some(dentry));
        }
        Ok(None)
    }

    pub fn create_dentry(&self, dentry: &Dentry) -> Result<()> {
        self.check_writable()?;
        let _guard = self.mutation_lock.lock().unwrap();

        if let Some(existing) =
            self.visible_dentry(dentry.parent_inode_id, &dentry.name, dentry.tx_id)?
        {
            if existing.inode_id == dentry.inode_id {
                // Retried create; nothing to do.
                return Ok(());
            }
            return Err(MetaStatus::Exists);
        }

        let mut txn = self.engine.begin_transaction();
        txn.put(
            self.dentry_table,
            &codec::dentry_key(dentry.parent_inode_id, &dentry.name, dentry.tx_id),
            encode(dentry)?,
        )
        .map_err(map_storage_err)?;
        let journal = txn.commit().map_err(map_storage_err)?;
        self.apply_journal(&journal);
        Ok(())
    }

    pub fn get_dentry(
        &self,
        fs_id: FsId,
        parent: InodeId,
        name: &str,
        tx_id: TxId,
    ) -> Result<Dentry> {
        let dentry = self
            .visible_dentry(parent, name, tx_id)?
            .ok_or(MetaStatus::NotFound)?;
        if dentry.fs_id != fs_id {
            return Err(MetaStatus::NotFound);
        }
        Ok(dentry)
    }

    /// Delete every committed version of the name. Versions above the request
    /// tx (prepared renames) are left alone.
    pub fn delete_dentry(
        &self,
        fs_id: FsId,
        parent: InodeId,
        name: &str,
        tx_id: TxId,
    ) -> Result<()> {
        self.check_writable()?;
        let _guard = self.mutation_lock.lock().unwrap();

        let visible = self.get_dentry(fs_id, parent, name, tx_id)?;
        let mut txn = self.engine.begin_transaction();
        for (key, _) in self.engine.scan_prefix(
            self.dentry_table,
            &codec::dentry_name_prefix(parent, name),
        ) {
            let (_, _, version) = codec::parse_dentry_key(&key).ok_or(MetaStatus::Internal)?;
            if version <= tx_id {
                txn.delete(self.dentry_table, &key);
            }
        }
        let journal = txn.commit().map_err(map_storage_err)?;
        self.apply_journal(&journal);
        debug!(fs_id, parent, name, inode = visible.inode_id, "deleted dentry");
        Ok(())
    }

    pub fn list_dentry(
        &self,
        fs_id: FsId,
        parent: InodeId,
        last: Option<&str>,
        count: u32,
        only_dir: bool,
        tx_id: TxId,
    ) -> Result<Vec<Dentry>> {
        let rows = match last {
            // Resume after every version of `last`: its name-prefix range end
            // is exactly where the next name begins.
            Some(last) => {
                let (_, end) = self
                    .dentry_table
                    .prefix_range(&codec::dentry_name_prefix(parent, last));
                let user_start = self.dentry_table.user_key(&end).to_vec();
                self.engine.scan_from(self.dentry_table, &user_start, None)
            }
            None => self
                .engine
                .scan_prefix(self.dentry_table, &codec::dentry_parent_prefix(parent)),
        };

        let mut out: Vec<Dentry> = Vec::new();
        let mut current_name: Option<String> = None;
        let mut name_resolved = false;
        for (key, value) in rows {
            if count > 0 && out.len() >= count as usize {
                break;
            }
            let (entry_parent, name, version) =
                codec::parse_dentry_key(&key).ok_or(MetaStatus::Internal)?;
            if entry_parent != parent {
                break;
            }
            if current_name.as_deref() != Some(name.as_str()) {
                current_name = Some(name.clone());
                name_resolved = false;
            }
            if name_resolved || version > tx_id {
                continue;
            }
            name_resolved = true;
            let dentry: Dentry = decode(&value)?;
            if dentry.delete_marked() || dentry.fs_id != fs_id {
                continue;
            }
            if only_dir && dentry.is_file() {
                continue;
            }
            out.push(dentry);
        }
        Ok(out)
    }

    /// Stage the prepared dentries of a rename transaction. Each must be
    /// stamped exactly one past the committed tx id, or the whole set is
    /// refused with `StaleTx` — a stale prepare landing at an already
    /// committed tx would become visible without ever being committed.
    /// Replaying an identical prepared set succeeds and changes nothing,
    /// even after the commit has advanced the tx.
    pub fn handle_rename_tx(&self, dentries: &[Dentry]) -> Result<()> {
        self.check_writable()?;
        if dentries.is_empty() {
            return Err(MetaStatus::InvalidParam);
        }
        let _guard = self.mutation_lock.lock().unwrap();

        let committed = self.tx_id();
        let fresh = dentries.iter().all(|d| d.tx_id == committed + 1);
        if !fresh {
            // Identical replay of an earlier prepare is the only stale form
            // accepted.
            let replay = dentries.iter().all(|d| {
                self.engine
                    .get(
                        self.dentry_table,
                        &codec::dentry_key(d.parent_inode_id, &d.name, d.tx_id),
                    )
                    .and_then(|stored| bincode::deserialize::<Dentry>(&stored).ok())
                    .map(|stored| stored == *d)
                    .unwrap_or(false)
            });
            if replay {
                return Ok(());
            }
            debug!(
                partition = self.partition_id(),
                committed, "refusing stale rename prepare"
            );
            return Err(MetaStatus::StaleTx);
        }

        let mut txn = self.engine.begin_transaction();
        for dentry in dentries {
            txn.put(
                self.dentry_table,
                &codec::dentry_key(dentry.parent_inode_id, &dentry.name, dentry.tx_id),
                encode(dentry)?,
            )
            .map_err(map_storage_err)?;
        }
        let journal = txn.commit().map_err(map_storage_err)?;
        self.apply_journal(&journal);
        debug!(
            partition = self.partition_id(),
            dentries = dentries.len(),
            "staged rename transaction"
        );
        Ok(())
    }

    // ---- chunk-info operations ----

    pub fn modify_chunk_info_list(
        &self,
        fs_id: FsId,
        inode_id: InodeId,
        add: &ChunkInfoMap,
        remove: &ChunkInfoMap,
    ) -> Result<()> {
        self.check_writable()?;
        // The inode must exist; chunk lists of unlinked inodes are trash.
        self.get_inode(fs_id, inode_id)?;
        let _guard = self.mutation_lock.lock().unwrap();

        let mut delta = 0i64;
        let mut txn = self.engine.begin_transaction();

        if !remove.is_empty() {
            let doomed: HashSet<u64> = remove
                .values()
                .flat_map(|list| list.entries.iter().map(|c| c.chunk_id))
                .collect();
            for (key, value) in self
                .engine
                .scan_prefix(self.chunk_table, &codec::chunk_info_inode_prefix(inode_id))
            {
                let mut list: ChunkInfoList = decode(&value)?;
                let before = list.entries.len();
                list.entries.retain(|c| !doomed.contains(&c.chunk_id));
                if list.entries.len() == before {
                    continue;
                }
                delta -= value.len() as i64;
                if list.is_empty() {
                    txn.delete(self.chunk_table, &key);
                } else {
                    let encoded = encode(&list)?;
                    delta += encoded.len() as i64;
                    txn.put(self.chunk_table, &key, encoded)
                        .map_err(map_storage_err)?;
                }
            }
        }

        for (index, list) in add {
            if list.is_empty() {
                continue;
            }
            let seq = self.chunk_seq.fetch_add(1, Ordering::SeqCst);
            let encoded = encode(list)?;
            delta += encoded.len() as i64;
            txn.put(
                self.chunk_table,
                &codec::chunk_info_key(inode_id, *index, seq),
                encoded,
            )
            .map_err(map_storage_err)?;
        }

        txn.commit().map_err(map_storage_err)?;

        let mut counter = self.chunk_meta_bytes.entry(inode_id).or_insert(0);
        if delta >= 0 {
            *counter += delta as u64;
        } else {
            *counter = counter.saturating_sub((-delta) as u64);
        }
        Ok(())
    }

    /// Fill `map` from the list table. With a non-zero `limit`, refuse with
    /// `ChunkMetaTooLarge` when the accumulated metadata would exceed it so
    /// the caller can switch to streaming.
    pub fn padding_chunk_info(
        &self,
        inode_id: InodeId,
        map: &mut ChunkInfoMap,
        limit: u64,
    ) -> Result<()> {
        if limit > 0 {
            let bytes = self
                .chunk_meta_bytes
                .get(&inode_id)
                .map(|v| *v)
                .unwrap_or(0);
            if bytes > limit {
                return Err(MetaStatus::ChunkMetaTooLarge);
            }
        }
        for (index, list) in self.chunk_info_lists(inode_id)? {
            map.entry(index).or_default().merge(&list);
        }
        Ok(())
    }

    /// Lists in key order, one element per stored record; the streaming path
    /// sends these as individual frames.
    pub fn chunk_info_lists(&self, inode_id: InodeId) -> Result<Vec<(u64, ChunkInfoList)>> {
        let mut out = Vec::new();
        for (key, value) in self
            .engine
            .scan_prefix(self.chunk_table, &codec::chunk_info_inode_prefix(inode_id))
        {
            let (_, index, _) = codec::parse_chunk_info_key(&key).ok_or(MetaStatus::Internal)?;
            out.push((index, decode(&value)?));
        }
        Ok(out)
    }

    pub fn chunk_meta_size(&self, inode_id: InodeId) -> u64 {
        self.chunk_meta_bytes
            .get(&inode_id)
            .map(|v| *v)
            .unwrap_or(0)
    }

    /// Inode ids currently present, for the partition cleaner.
    pub fn inode_ids(&self) -> Vec<InodeId> {
        let info = self.info();
        (info.start..info.next_id)
            .filter(|id| {
                self.engine
                    .get(self.inode_table, &codec::inode_key(*id))
                    .is_some()
            })
            .collect()
    }

    /// Drop every table of this partition with range deletes.
    pub fn clear_all(&self) {
        self.engine.clear_table(self.inode_table);
        self.engine.clear_table(self.dentry_table);
        self.engine.clear_table(self.chunk_table);
        self.inode_count.store(0, Ordering::Relaxed);
        self.dentry_count.store(0, Ordering::Relaxed);
        self.chunk_meta_bytes.clear();
    }

    pub fn clear_dentries(&self) {
        self.engine.clear_table(self.dentry_table);
        self.dentry_count.store(0, Ordering::Relaxed);
    }
}
