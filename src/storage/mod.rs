//! Key-value storage engine backing the partition stores.
//!
//! Two column families: an ordered family (lexicographic, used for dentry and
//! chunk-info range scans) and an unordered family (point-keyed). Logical
//! tables are carved out of both via composed key prefixes, so a table clears
//! with one range delete. Writes go through admission control: the engine
//! samples process RSS and filesystem free space and refuses writes near the
//! configured quotas, preferring `ResourceExhausted` over corruption.

pub mod codec;

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::io::{BufReader, BufWriter, Read, Write};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use codec::{TableHandle, TableTag};

const SNAPSHOT_MAGIC: &[u8; 8] = b"TFSSNAP1";
const RECORD_ORDERED: u8 = 0x01;
const RECORD_UNORDERED: u8 = 0x02;
const RECORD_EOF: u8 = 0x00;

const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage quota exhausted")]
    ResourceExhausted,

    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("snapshot corrupted: {0}")]
    Corrupted(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, Clone)]
pub struct StorageOptions {
    /// Advisory block cache size. The in-memory engine keeps everything
    /// resident, so this only feeds capacity accounting.
    pub block_cache_capacity: u64,
    pub write_buffer_size: u64,
    pub max_write_buffer_number: u32,
    /// Refuse writes once the engine holds this many bytes (0 = unlimited).
    pub max_memory_bytes: u64,
    /// Refuse writes once free space under `data_dir` drops below this
    /// (0 = unlimited).
    pub max_disk_bytes: u64,
    /// Directory sampled for free space and used for snapshots.
    pub data_dir: PathBuf,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            block_cache_capacity: 8 << 20,
            write_buffer_size: 64 << 20,
            max_write_buffer_number: 4,
            max_memory_bytes: 0,
            max_disk_bytes: 0,
            data_dir: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub approximate_bytes: u64,
    pub rss_bytes: u64,
    pub disk_free_bytes: u64,
}

#[derive(Debug)]
struct ResourceSample {
    taken_at: Option<Instant>,
    rss_bytes: u64,
    disk_free_bytes: u64,
}

#[derive(Debug)]
struct Inner {
    ordered: BTreeMap<Bytes, Bytes>,
    unordered: HashMap<Bytes, Bytes>,
}

#[derive(Debug)]
pub struct StorageEngine {
    inner: RwLock<Inner>,
    options: StorageOptions,
    approximate_bytes: AtomicU64,
    sample: Mutex<ResourceSample>,
}

fn cf_is_ordered(tag: TableTag) -> bool {
    matches!(
        tag,
        TableTag::Dentry | TableTag::ChunkInfo | TableTag::Partition
    )
}

impl StorageEngine {
    pub fn new(options: StorageOptions) -> Arc<Self> {
        Arc::new(Self {
            inner: RwLock::new(Inner {
                ordered: BTreeMap::new(),
                unordered: HashMap::new(),
            }),
            options,
            approximate_bytes: AtomicU64::new(0),
            sample: Mutex::new(ResourceSample {
                taken_at: None,
                rss_bytes: 0,
                disk_free_bytes: u64::MAX,
            }),
        })
    }

    pub fn options(&self) -> &StorageOptions {
        &self.options
    }

    pub fn get(&self, table: TableHandle, user_key: &[u8]) -> Option<Bytes> {
        let key = table.key(user_key);
        let inner = self.inner.read().unwrap();
        if cf_is_ordered(table.tag()) {
            inner.ordered.get(&key).cloned()
        } else {
            inner.unordered.get(&key).cloned()
        }
    }

    pub fn put(&self, table: TableHandle, user_key: &[u8], value: Bytes) -> Result<()> {
        self.check_admission(user_key.len() + value.len())?;
        let key = table.key(user_key);
        let added = (key.len() + value.len()) as u64;
        let mut inner = self.inner.write().unwrap();
        let old = if cf_is_ordered(table.tag()) {
            inner.ordered.insert(key, value)
        } else {
            inner.unordered.insert(key, value)
        };
        drop(inner);
        self.adjust_bytes(added as i64 - old.map_or(0, |v| v.len() as i64));
        Ok(())
    }

    pub fn delete(&self, table: TableHandle, user_key: &[u8]) {
        let key = table.key(user_key);
        let mut inner = self.inner.write().unwrap();
        let old = if cf_is_ordered(table.tag()) {
            inner.ordered.remove(&key)
        } else {
            inner.unordered.remove(&key)
        };
        drop(inner);
        if let Some(v) = old {
            self.adjust_bytes(-((key_overhead(user_key) + v.len()) as i64));
        }
    }

    /// Forward scan over an ordered table, bounded to keys starting with
    /// `user_prefix`. Panics in debug builds if used on an unordered table.
    pub fn scan_prefix(&self, table: TableHandle, user_prefix: &[u8]) -> Vec<(Vec<u8>, Bytes)> {
        debug_assert!(cf_is_ordered(table.tag()));
        let (start, end) = table.prefix_range(user_prefix);
        self.scan_raw(table, start, end, None)
    }

    /// Forward scan starting at `user_start` (inclusive), bounded to the
    /// table, returning at most `limit` entries.
    pub fn scan_from(
        &self,
        table: TableHandle,
        user_start: &[u8],
        limit: Option<usize>,
    ) -> Vec<(Vec<u8>, Bytes)> {
        debug_assert!(cf_is_ordered(table.tag()));
        let start = table.key(user_start);
        let (_, end) = table.range();
        self.scan_raw(table, start, end, limit)
    }

    pub fn scan_table(&self, table: TableHandle) -> Vec<(Vec<u8>, Bytes)> {
        debug_assert!(cf_is_ordered(table.tag()));
        let (start, end) = table.range();
        self.scan_raw(table, start, end, None)
    }

    fn scan_raw(
        &self,
        table: TableHandle,
        start: Bytes,
        end: Bytes,
        limit: Option<usize>,
    ) -> Vec<(Vec<u8>, Bytes)> {
        let inner = self.inner.read().unwrap();
        let iter = inner
            .ordered
            .range((Bound::Included(start), Bound::Excluded(end)));
        let mut out = Vec::new();
        for (k, v) in iter {
            if let Some(limit) = limit {
                if out.len() >= limit {
                    break;
                }
            }
            out.push((table.user_key(k).to_vec(), v.clone()));
        }
        out
    }

    /// Drop every key of one logical table with a single range delete.
    pub fn clear_table(&self, table: TableHandle) {
        let (start, end) = table.range();
        let mut inner = self.inner.write().unwrap();
        let mut freed = 0i64;
        if cf_is_ordered(table.tag()) {
            let keys: Vec<Bytes> = inner
                .ordered
                .range((Bound::Included(start), Bound::Excluded(end)))
                .map(|(k, _)| k.clone())
                .collect();
            for k in keys {
                if let Some(v) = inner.ordered.remove(&k) {
                    freed += (k.len() + v.len()) as i64;
                }
            }
        } else {
            inner.unordered.retain(|k, v| {
                let inside = *k >= start && *k < end;
                if inside {
                    freed += (k.len() + v.len()) as i64;
                }
                !inside
            });
        }
        drop(inner);
        self.adjust_bytes(-freed);
    }

    pub fn begin_transaction(self: &Arc<Self>) -> StorageTransaction {
        StorageTransaction {
            engine: Arc::clone(self),
            pending: Vec::new(),
        }
    }

    pub fn stats(&self) -> EngineStats {
        let mut sample = self.sample.lock().unwrap();
        self.refresh_sample(&mut sample);
        EngineStats {
            approximate_bytes: self.approximate_bytes.load(Ordering::Relaxed),
            rss_bytes: sample.rss_bytes,
            disk_free_bytes: sample.disk_free_bytes,
        }
    }

    fn adjust_bytes(&self, delta: i64) {
        if delta >= 0 {
            self.approximate_bytes
                .fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            let sub = (-delta) as u64;
            let mut current = self.approximate_bytes.load(Ordering::Relaxed);
            loop {
                let next = current.saturating_sub(sub);
                match self.approximate_bytes.compare_exchange_weak(
                    current,
                    next,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(observed) => current = observed,
                }
            }
        }
    }

    /// Refuse a write near the configured quotas. Memory is judged by the
    /// engine's own byte accounting (process RSS is sampled and surfaced via
    /// `stats`, where operators alert on it); disk by sampled free space
    /// under the data directory.
    fn check_admission(&self, incoming: usize) -> Result<()> {
        let max_memory = self.options.max_memory_bytes;
        if max_memory > 0 {
            let held = self.approximate_bytes.load(Ordering::Relaxed);
            if held + incoming as u64 > max_memory {
                warn!(
                    held,
                    incoming, max_memory, "rejecting write: memory quota reached"
                );
                return Err(StorageError::ResourceExhausted);
            }
        }
        if self.options.max_disk_bytes > 0 {
            let mut sample = self.sample.lock().unwrap();
            self.refresh_sample(&mut sample);
            if sample.disk_free_bytes < self.options.max_disk_bytes {
                warn!(
                    free = sample.disk_free_bytes,
                    reserve = self.options.max_disk_bytes,
                    "rejecting write: filesystem free space under reserve"
                );
                return Err(StorageError::ResourceExhausted);
            }
        }
        Ok(())
    }

    fn refresh_sample(&self, sample: &mut ResourceSample) {
        let stale = sample
            .taken_at
            .map_or(true, |t| t.elapsed() >= SAMPLE_INTERVAL);
        if !stale {
            return;
        }
        sample.taken_at = Some(Instant::now());
        sample.rss_bytes = process_rss_bytes().unwrap_or(0);
        sample.disk_free_bytes =
            filesystem_free_bytes(&self.options.data_dir).unwrap_or(u64::MAX);
    }

    /// Stream every entry of both column families as `(tag, length, bytes)`
    /// tuples. The payload of each tuple is the bincode-encoded (key, value)
    /// pair.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(SNAPSHOT_MAGIC)?;

        let inner = self.inner.read().unwrap();
        for (key, value) in &inner.ordered {
            write_record(&mut writer, RECORD_ORDERED, key, value)?;
        }
        for (key, value) in &inner.unordered {
            write_record(&mut writer, RECORD_UNORDERED, key, value)?;
        }
        drop(inner);

        writer.write_all(&[RECORD_EOF])?;
        writer.flush()?;
        info!(path = %path.display(), "saved storage snapshot");
        Ok(())
    }

    /// Replace the engine contents with a previously saved snapshot.
    pub fn load(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::open(path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        reader.read_exact(&mut magic)?;
        if &magic != SNAPSHOT_MAGIC {
            return Err(StorageError::Corrupted("bad snapshot magic".into()));
        }

        let mut ordered = BTreeMap::new();
        let mut unordered = HashMap::new();
        let mut bytes = 0u64;
        loop {
            let mut tag = [0u8; 1];
            reader.read_exact(&mut tag)?;
            if tag[0] == RECORD_EOF {
                break;
            }
            let mut len_buf = [0u8; 4];
            reader.read_exact(&mut len_buf)?;
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload)?;
            let (key, value): (Vec<u8>, Vec<u8>) = bincode::deserialize(&payload)
                .map_err(|e| StorageError::Corrupted(e.to_string()))?;
            bytes += (key.len() + value.len()) as u64;
            match tag[0] {
                RECORD_ORDERED => {
                    ordered.insert(Bytes::from(key), Bytes::from(value));
                }
                RECORD_UNORDERED => {
                    unordered.insert(Bytes::from(key), Bytes::from(value));
                }
                other => {
                    return Err(StorageError::Corrupted(format!(
                        "unknown record tag {other:#04x}"
                    )));
                }
            }
        }

        let mut inner = self.inner.write().unwrap();
        inner.ordered = ordered;
        inner.unordered = unordered;
        drop(inner);
        self.approximate_bytes.store(bytes, Ordering::Relaxed);
        info!(path = %path.display(), bytes, "loaded storage snapshot");
        Ok(())
    }
}

fn key_overhead(user_key: &[u8]) -> usize {
    // tag byte + hashed prefix
    user_key.len() + 9
}

fn write_record<W: Write>(writer: &mut W, tag: u8, key: &Bytes, value: &Bytes) -> Result<()> {
    let payload = bincode::serialize(&(key.as_ref(), value.as_ref()))
        .map_err(|e| StorageError::Corrupted(e.to_string()))?;
    writer.write_all(&[tag])?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    Ok(())
}

fn process_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some(resident_pages * page_size as u64)
}

fn filesystem_free_bytes(path: &Path) -> Option<u64> {
    let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) };
    if rc != 0 {
        return None;
    }
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[derive(Debug, Clone)]
pub enum JournalOp {
    Put { value_len: usize, replaced: bool },
    Delete { existed: bool },
}

/// One applied mutation, reported back to the caller on commit so in-memory
/// indices (exists-sets, byte counters) can be updated exactly once.
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub table: TableHandle,
    pub user_key: Vec<u8>,
    pub op: JournalOp,
}

enum PendingOp {
    Put {
        table: TableHandle,
        user_key: Vec<u8>,
        value: Bytes,
    },
    Delete {
        table: TableHandle,
        user_key: Vec<u8>,
    },
}

/// Buffered transaction over the engine. Reads observe the transaction's own
/// pending writes first, then the committed state. Commit applies the whole
/// journal under one write lock; rollback discards it. Writers to one
/// partition are serialized above this layer, which is what makes the
/// buffered view snapshot-consistent.
pub struct StorageTransaction {
    engine: Arc<StorageEngine>,
    pending: Vec<PendingOp>,
}

impl StorageTransaction {
    pub fn get(&self, table: TableHandle, user_key: &[u8]) -> Option<Bytes> {
        for op in self.pending.iter().rev() {
            match op {
                PendingOp::Put {
                    table: t,
                    user_key: k,
                    value,
                } if *t == table && k.as_slice() == user_key => return Some(value.clone()),
                PendingOp::Delete {
                    table: t,
                    user_key: k,
                } if *t == table && k.as_slice() == user_key => return None,
                _ => {}
            }
        }
        self.engine.get(table, user_key)
    }

    pub fn put(&mut self, table: TableHandle, user_key: &[u8], value: Bytes) -> Result<()> {
        self.engine.check_admission(user_key.len() + value.len())?;
        self.pending.push(PendingOp::Put {
            table,
            user_key: user_key.to_vec(),
            value,
        });
        Ok(())
    }

    pub fn delete(&mut self, table: TableHandle, user_key: &[u8]) {
        self.pending.push(PendingOp::Delete {
            table,
            user_key: user_key.to_vec(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn commit(self) -> Result<Vec<JournalEntry>> {
        let mut journal = Vec::with_capacity(self.pending.len());
        let mut delta = 0i64;
        {
            let mut inner = self.engine.inner.write().unwrap();
            for op in &self.pending {
                match op {
                    PendingOp::Put {
                        table,
                        user_key,
                        value,
                    } => {
                        let key = table.key(user_key);
                        delta += (key.len() + value.len()) as i64;
                        let old = if cf_is_ordered(table.tag()) {
                            inner.ordered.insert(key, value.clone())
                        } else {
                            inner.unordered.insert(key, value.clone())
                        };
                        let replaced = old.is_some();
                        if let Some(v) = old {
                            delta -= v.len() as i64;
                        }
                        journal.push(JournalEntry {
                            table: *table,
                            user_key: user_key.clone(),
                            op: JournalOp::Put {
                                value_len: value.len(),
                                replaced,
                            },
                        });
                    }
                    PendingOp::Delete { table, user_key } => {
                        let key = table.key(user_key);
                        let old = if cf_is_ordered(table.tag()) {
                            inner.ordered.remove(&key)
                        } else {
                            inner.unordered.remove(&key)
                        };
                        let existed = old.is_some();
                        if let Some(v) = old {
                            delta -= (key.len() + v.len()) as i64;
                        }
                        journal.push(JournalEntry {
                            table: *table,
                            user_key: user_key.clone(),
                            op: JournalOp::Delete { existed },
                        });
                    }
                }
            }
        }
        self.engine.adjust_bytes(delta);
        debug!(ops = journal.len(), "committed storage transaction");
        Ok(journal)
    }

    pub fn rollback(self) {
        // Nothing was applied; dropping the pending journal is the rollback.
    }
}

#[cfg(test)]
mod tests {
    use super::codec::{TableHandle, TableTag};
    use super::*;

    fn engine() -> Arc<StorageEngine> {
        StorageEngine::new(StorageOptions::default())
    }

    #[test]
    fn test_point_roundtrip() {
        let engine = engine();
        let table = TableHandle::new(TableTag::Inode, 1);

        engine
            .put(table, b"k", Bytes::from_static(b"v"))
            .unwrap();
        assert_eq!(engine.get(table, b"k"), Some(Bytes::from_static(b"v")));

        engine.delete(table, b"k");
        assert_eq!(engine.get(table, b"k"), None);
    }

    #[test]
    fn test_scan_is_table_bounded() {
        let engine = engine();
        let t1 = TableHandle::new(TableTag::Dentry, 1);
        let t2 = TableHandle::new(TableTag::Dentry, 2);

        engine.put(t1, b"a", Bytes::from_static(b"1")).unwrap();
        engine.put(t1, b"b", Bytes::from_static(b"2")).unwrap();
        engine.put(t2, b"a", Bytes::from_static(b"3")).unwrap();

        let rows = engine.scan_table(t1);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, b"a");
        assert_eq!(rows[1].0, b"b");
    }

    #[test]
    fn test_clear_table_leaves_siblings() {
        let engine = engine();
        let t1 = TableHandle::new(TableTag::Dentry, 1);
        let t2 = TableHandle::new(TableTag::Dentry, 2);

        engine.put(t1, b"a", Bytes::from_static(b"1")).unwrap();
        engine.put(t2, b"a", Bytes::from_static(b"2")).unwrap();
        engine.clear_table(t1);

        assert!(engine.scan_table(t1).is_empty());
        assert_eq!(engine.scan_table(t2).len(), 1);
    }

    #[test]
    fn test_transaction_commit_and_rollback() {
        let engine = engine();
        let table = TableHandle::new(TableTag::Inode, 7);

        let mut txn = engine.begin_transaction();
        txn.put(table, b"x", Bytes::from_static(b"1")).unwrap();
        assert_eq!(txn.get(table, b"x"), Some(Bytes::from_static(b"1")));
        // Not visible outside until commit.
        assert_eq!(engine.get(table, b"x"), None);
        let journal = txn.commit().unwrap();
        assert_eq!(journal.len(), 1);
        assert_eq!(engine.get(table, b"x"), Some(Bytes::from_static(b"1")));

        let mut txn = engine.begin_transaction();
        txn.delete(table, b"x");
        assert_eq!(txn.get(table, b"x"), None);
        txn.rollback();
        assert_eq!(engine.get(table, b"x"), Some(Bytes::from_static(b"1")));
    }

    #[test]
    fn test_memory_quota_rejects_writes() {
        let engine = StorageEngine::new(StorageOptions {
            max_memory_bytes: 64,
            ..Default::default()
        });
        let table = TableHandle::new(TableTag::Inode, 1);

        engine
            .put(table, b"a", Bytes::from(vec![0u8; 16]))
            .unwrap();
        let err = engine
            .put(table, b"b", Bytes::from(vec![0u8; 128]))
            .unwrap_err();
        assert!(matches!(err, StorageError::ResourceExhausted));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap");

        let engine = engine();
        let inodes = TableHandle::new(TableTag::Inode, 3);
        let dentries = TableHandle::new(TableTag::Dentry, 3);
        engine
            .put(inodes, b"i1", Bytes::from_static(b"inode-1"))
            .unwrap();
        engine
            .put(dentries, b"d1", Bytes::from_static(b"dentry-1"))
            .unwrap();
        engine.save(&path).unwrap();

        let restored = StorageEngine::new(StorageOptions::default());
        restored.load(&path).unwrap();
        assert_eq!(
            restored.get(inodes, b"i1"),
            Some(Bytes::from_static(b"inode-1"))
        );
        assert_eq!(
            restored.get(dentries, b"d1"),
            Some(Bytes::from_static(b"dentry-1"))
        );
        assert_eq!(
            restored.stats().approximate_bytes > 0,
            true,
            "byte accounting restored"
        );
    }
}
