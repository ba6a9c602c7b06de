//! Tiered S3-backed data path: an in-memory chunk cache above an optional
//! local-disk cache above the object store.

pub mod cache;
pub mod disk;
pub mod object;
pub mod s3;

use async_trait::async_trait;
use bytes::Bytes;

use crate::fs::errors::FsError;
use crate::fs::inode_cache::InodeWrapper;
use crate::meta::types::{FsId, InodeId};
use std::sync::Arc;

/// How file offsets map onto chunks and object-store blocks. A chunk is a
/// power-of-two window of the file; each chunk is stored as one or more
/// block objects.
#[derive(Debug, Clone, Copy)]
pub struct ChunkLayout {
    pub chunk_size: u64,
    pub block_size: u64,
}

impl Default for ChunkLayout {
    fn default() -> Self {
        Self {
            chunk_size: 64 << 20,
            block_size: 4 << 20,
        }
    }
}

impl ChunkLayout {
    pub fn chunk_index(&self, offset: u64) -> u64 {
        offset / self.chunk_size
    }

    pub fn offset_in_chunk(&self, offset: u64) -> u64 {
        offset % self.chunk_size
    }

    pub fn block_count(&self, bytes: u64) -> u64 {
        bytes.div_ceil(self.block_size).max(1)
    }
}

/// Capability set of a mounted data path. The filesystem core holds one
/// variant chosen at mount; the S3 adapter is the variant this client ships.
#[async_trait]
pub trait DataBackend: Send + Sync {
    fn set_fs_id(&self, fs_id: FsId);

    async fn write(
        &self,
        inode: &Arc<InodeWrapper>,
        offset: u64,
        data: &[u8],
    ) -> Result<usize, FsError>;

    async fn read(
        &self,
        inode: &Arc<InodeWrapper>,
        offset: u64,
        len: usize,
    ) -> Result<Bytes, FsError>;

    /// Truncate bookkeeping under the caller-held inode lock: shrinking
    /// writes a zero chunk covering the removed range, growing only moves
    /// the length.
    async fn truncate(&self, inode: &Arc<InodeWrapper>, new_len: u64) -> Result<(), FsError>;

    /// Push one inode's cached writes down the tiers. In close-to-open mode
    /// this reaches the object store and syncs the inode record before
    /// returning.
    async fn flush(&self, inode: &Arc<InodeWrapper>) -> Result<(), FsError>;

    /// Drain every inode's cached writes.
    async fn flush_all(&self) -> Result<(), FsError>;

    /// Full sync used at unmount: all data plus disk-cache drain.
    async fn fs_sync(&self) -> Result<(), FsError>;

    /// Drop cached pages for an inode whose data is gone.
    async fn invalidate(&self, inode_id: InodeId);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_layout_math() {
        let layout = ChunkLayout {
            chunk_size: 1024,
            block_size: 256,
        };
        assert_eq!(layout.chunk_index(0), 0);
        assert_eq!(layout.chunk_index(1023), 0);
        assert_eq!(layout.chunk_index(1024), 1);
        assert_eq!(layout.offset_in_chunk(1030), 6);
        assert_eq!(layout.block_count(1), 1);
        assert_eq!(layout.block_count(256), 1);
        assert_eq!(layout.block_count(257), 2);
        assert_eq!(layout.block_count(0), 1);
    }
}
