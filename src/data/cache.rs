//! In-memory chunk caches for the S3 data path.
//!
//! The write cache holds pending slices per `(inode, chunk index)`, bounded
//! by total bytes and drained oldest-dirty-first. Readers overlay the slices
//! in write order, so write-after-write ordering on one file is preserved
//! without any extra bookkeeping. The read cache is a byte-bounded LRU of
//! block objects keyed by object name.

use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use crate::meta::types::InodeId;

#[derive(Debug, Clone)]
pub struct WriteSlice {
    pub offset_in_chunk: u64,
    pub data: Bytes,
}

struct WriteChunk {
    slices: Vec<WriteSlice>,
    bytes: u64,
    dirty_since: Instant,
}

pub struct WriteCache {
    chunks: Mutex<HashMap<(InodeId, u64), WriteChunk>>,
    total_bytes: AtomicU64,
    max_bytes: u64,
}

impl WriteCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            chunks: Mutex::new(HashMap::new()),
            total_bytes: AtomicU64::new(0),
            max_bytes,
        }
    }

    pub fn append(&self, inode_id: InodeId, chunk_index: u64, slice: WriteSlice) {
        let len = slice.data.len() as u64;
        let mut chunks = self.chunks.lock().unwrap();
        let chunk = chunks
            .entry((inode_id, chunk_index))
            .or_insert_with(|| WriteChunk {
                slices: Vec::new(),
                bytes: 0,
                dirty_since: Instant::now(),
            });
        chunk.slices.push(slice);
        chunk.bytes += len;
        self.total_bytes.fetch_add(len, Ordering::Relaxed);
    }

    /// Apply pending slices (in write order) on top of `buf`, which covers
    /// `[chunk_offset, chunk_offset + buf.len())` within the chunk.
    pub fn overlay(&self, inode_id: InodeId, chunk_index: u64, chunk_offset: u64, buf: &mut [u8]) {
        let chunks = self.chunks.lock().unwrap();
        let Some(chunk) = chunks.get(&(inode_id, chunk_index)) else {
            return;
        };
        let buf_end = chunk_offset + buf.len() as u64;
        for slice in &chunk.slices {
            let slice_end = slice.offset_in_chunk + slice.data.len() as u64;
            let start = slice.offset_in_chunk.max(chunk_offset);
            let end = slice_end.min(buf_end);
            if start >= end {
                continue;
            }
            let src = &slice.data[(start - slice.offset_in_chunk) as usize
                ..(end - slice.offset_in_chunk) as usize];
            buf[(start - chunk_offset) as usize..(end - chunk_offset) as usize]
                .copy_from_slice(src);
        }
    }

    /// Remove and return one chunk's pending slices.
    pub fn take_chunk(&self, inode_id: InodeId, chunk_index: u64) -> Option<Vec<WriteSlice>> {
        let mut chunks = self.chunks.lock().unwrap();
        let chunk = chunks.remove(&(inode_id, chunk_index))?;
        self.sub_bytes(chunk.bytes);
        Some(chunk.slices)
    }

    /// Remove and return every pending chunk of one inode, oldest first.
    pub fn take_inode(&self, inode_id: InodeId) -> Vec<(u64, Vec<WriteSlice>)> {
        let mut chunks = self.chunks.lock().unwrap();
        let mut taken: Vec<(Instant, u64, WriteChunk)> = Vec::new();
        let keys: Vec<(InodeId, u64)> = chunks
            .keys()
            .filter(|(ino, _)| *ino == inode_id)
            .copied()
            .collect();
        for key in keys {
            if let Some(chunk) = chunks.remove(&key) {
                self.sub_bytes(chunk.bytes);
                taken.push((chunk.dirty_since, key.1, chunk));
            }
        }
        taken.sort_by_key(|(since, _, _)| *since);
        taken
            .into_iter()
            .map(|(_, index, chunk)| (index, chunk.slices))
            .collect()
    }

    /// Oldest dirty chunk across all inodes (FIFO eviction order).
    pub fn oldest(&self) -> Option<(InodeId, u64)> {
        let chunks = self.chunks.lock().unwrap();
        chunks
            .iter()
            .min_by_key(|(_, chunk)| chunk.dirty_since)
            .map(|(key, _)| *key)
    }

    pub fn inode_ids(&self) -> Vec<InodeId> {
        let chunks = self.chunks.lock().unwrap();
        let mut ids: Vec<InodeId> = chunks.keys().map(|(ino, _)| *ino).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Drop pending data past `new_len` on a shrinking truncate. Slices
    /// straddling the boundary are clipped.
    pub fn truncate(&self, inode_id: InodeId, new_len: u64, chunk_size: u64) {
        let mut chunks = self.chunks.lock().unwrap();
        let keys: Vec<(InodeId, u64)> = chunks
            .keys()
            .filter(|(ino, _)| *ino == inode_id)
            .copied()
            .collect();
        for key in keys {
            let chunk_start = key.1 * chunk_size;
            let Some(chunk) = chunks.get_mut(&key) else {
                continue;
            };
            let mut kept = Vec::new();
            let mut kept_bytes = 0u64;
            let old_bytes = chunk.bytes;
            for slice in chunk.slices.drain(..) {
                let abs_start = chunk_start + slice.offset_in_chunk;
                if abs_start >= new_len {
                    continue;
                }
                let keep = (new_len - abs_start).min(slice.data.len() as u64) as usize;
                let data = slice.data.slice(..keep);
                kept_bytes += data.len() as u64;
                kept.push(WriteSlice {
                    offset_in_chunk: slice.offset_in_chunk,
                    data,
                });
            }
            chunk.slices = kept;
            chunk.bytes = kept_bytes;
            self.sub_bytes(old_bytes - kept_bytes);
            if chunk.slices.is_empty() {
                chunks.remove(&key);
            }
        }
    }

    pub fn drop_inode(&self, inode_id: InodeId) {
        let mut chunks = self.chunks.lock().unwrap();
        let keys: Vec<(InodeId, u64)> = chunks
            .keys()
            .filter(|(ino, _)| *ino == inode_id)
            .copied()
            .collect();
        for key in keys {
            if let Some(chunk) = chunks.remove(&key) {
                self.sub_bytes(chunk.bytes);
            }
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn over_capacity(&self) -> bool {
        self.max_bytes > 0 && self.total_bytes() > self.max_bytes
    }

    fn sub_bytes(&self, bytes: u64) {
        let mut current = self.total_bytes.load(Ordering::Relaxed);
        loop {
            let next = current.saturating_sub(bytes);
            match self.total_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

/// LRU of block objects already fetched from lower tiers.
pub struct ReadCache {
    pages: Mutex<ReadCacheInner>,
    max_bytes: u64,
}

struct ReadCacheInner {
    pages: HashMap<String, Bytes>,
    order: VecDeque<String>,
    bytes: u64,
}

impl ReadCache {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            pages: Mutex::new(ReadCacheInner {
                pages: HashMap::new(),
                order: VecDeque::new(),
                bytes: 0,
            }),
            max_bytes,
        }
    }

    pub fn get(&self, name: &str) -> Option<Bytes> {
        let mut inner = self.pages.lock().unwrap();
        let data = inner.pages.get(name).cloned()?;
        if let Some(pos) = inner.order.iter().position(|n| n == name) {
            inner.order.remove(pos);
        }
        inner.order.push_back(name.to_string());
        Some(data)
    }

    pub fn insert(&self, name: String, data: Bytes) {
        if self.max_bytes == 0 {
            return;
        }
        let mut inner = self.pages.lock().unwrap();
        if let Some(old) = inner.pages.insert(name.clone(), data.clone()) {
            inner.bytes -= old.len() as u64;
            if let Some(pos) = inner.order.iter().position(|n| *n == name) {
                inner.order.remove(pos);
            }
        }
        inner.bytes += data.len() as u64;
        inner.order.push_back(name);
        while inner.bytes > self.max_bytes {
            let Some(evicted) = inner.order.pop_front() else {
                break;
            };
            if let Some(old) = inner.pages.remove(&evicted) {
                inner.bytes -= old.len() as u64;
            }
        }
    }

    /// Drop every cached page whose object name carries this prefix.
    pub fn invalidate_prefix(&self, prefix: &str) {
        let mut inner = self.pages.lock().unwrap();
        let doomed: Vec<String> = inner
            .pages
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect();
        for name in doomed {
            if let Some(old) = inner.pages.remove(&name) {
                inner.bytes -= old.len() as u64;
            }
            if let Some(pos) = inner.order.iter().position(|n| *n == name) {
                inner.order.remove(pos);
            }
        }
    }

    pub fn bytes(&self) -> u64 {
        self.pages.lock().unwrap().bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_applies_in_write_order() {
        let cache = WriteCache::new(0);
        cache.append(
            1,
            0,
            WriteSlice {
                offset_in_chunk: 0,
                data: Bytes::from_static(b"aaaa"),
            },
        );
        cache.append(
            1,
            0,
            WriteSlice {
                offset_in_chunk: 2,
                data: Bytes::from_static(b"bb"),
            },
        );

        let mut buf = vec![b'.'; 6];
        cache.overlay(1, 0, 0, &mut buf);
        assert_eq!(&buf, b"aabb..");

        // Offset window into the same chunk.
        let mut buf = vec![b'.'; 2];
        cache.overlay(1, 0, 3, &mut buf);
        assert_eq!(&buf, b"b.");
    }

    #[test]
    fn test_take_inode_orders_by_age_and_drains_bytes() {
        let cache = WriteCache::new(0);
        cache.append(
            1,
            3,
            WriteSlice {
                offset_in_chunk: 0,
                data: Bytes::from_static(b"x"),
            },
        );
        cache.append(
            1,
            0,
            WriteSlice {
                offset_in_chunk: 0,
                data: Bytes::from_static(b"yy"),
            },
        );
        cache.append(
            2,
            0,
            WriteSlice {
                offset_in_chunk: 0,
                data: Bytes::from_static(b"z"),
            },
        );
        assert_eq!(cache.total_bytes(), 4);

        let taken = cache.take_inode(1);
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].0, 3, "oldest chunk first");
        assert_eq!(cache.total_bytes(), 1);
        assert_eq!(cache.inode_ids(), vec![2]);
    }

    #[test]
    fn test_truncate_clips_pending_slices() {
        let cache = WriteCache::new(0);
        // Chunk size 8: chunk 1 covers [8, 16).
        cache.append(
            1,
            1,
            WriteSlice {
                offset_in_chunk: 0,
                data: Bytes::from_static(b"abcdefgh"),
            },
        );
        cache.truncate(1, 12, 8);

        let mut buf = vec![0u8; 8];
        cache.overlay(1, 1, 0, &mut buf);
        assert_eq!(&buf[..4], b"abcd");
        assert_eq!(&buf[4..], &[0, 0, 0, 0]);
        assert_eq!(cache.total_bytes(), 4);

        // Truncating to the chunk start drops the chunk entirely.
        cache.truncate(1, 8, 8);
        assert!(cache.take_chunk(1, 1).is_none());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_capacity_flag() {
        let cache = WriteCache::new(4);
        assert!(!cache.over_capacity());
        cache.append(
            1,
            0,
            WriteSlice {
                offset_in_chunk: 0,
                data: Bytes::from_static(b"hello"),
            },
        );
        assert!(cache.over_capacity());
        assert_eq!(cache.oldest(), Some((1, 0)));
    }

    #[test]
    fn test_read_cache_lru_eviction() {
        let cache = ReadCache::new(8);
        cache.insert("a".into(), Bytes::from_static(b"1234"));
        cache.insert("b".into(), Bytes::from_static(b"5678"));
        assert_eq!(cache.bytes(), 8);

        // Touch "a" so "b" is the LRU victim.
        assert!(cache.get("a").is_some());
        cache.insert("c".into(), Bytes::from_static(b"9999"));
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_read_cache_prefix_invalidation() {
        let cache = ReadCache::new(64);
        cache.insert("1_7_1_0".into(), Bytes::from_static(b"x"));
        cache.insert("1_7_2_0".into(), Bytes::from_static(b"y"));
        cache.insert("1_8_1_0".into(), Bytes::from_static(b"z"));

        cache.invalidate_prefix("1_7_");
        assert!(cache.get("1_7_1_0").is_none());
        assert!(cache.get("1_7_2_0").is_none());
        assert!(cache.get("1_8_1_0").is_some());
    }
}
