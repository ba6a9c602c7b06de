use bytes::Bytes;

use crate::meta::types::{InodeId, PartitionId, TxId};

const TAG_INODE: u8 = 0x01;
const TAG_DENTRY: u8 = 0x02;
const TAG_CHUNK_INFO: u8 = 0x03;
const TAG_PARTITION: u8 = 0x04;

const U64_SIZE: usize = 8;
/// tag + hashed table-name prefix
const PREFIX_SIZE: usize = 1 + U64_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableTag {
    Inode,
    Dentry,
    ChunkInfo,
    Partition,
}

impl From<TableTag> for u8 {
    fn from(tag: TableTag) -> Self {
        match tag {
            TableTag::Inode => TAG_INODE,
            TableTag::Dentry => TAG_DENTRY,
            TableTag::ChunkInfo => TAG_CHUNK_INFO,
            TableTag::Partition => TAG_PARTITION,
        }
    }
}

impl TryFrom<u8> for TableTag {
    type Error = ();

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            TAG_INODE => Ok(Self::Inode),
            TAG_DENTRY => Ok(Self::Dentry),
            TAG_CHUNK_INFO => Ok(Self::ChunkInfo),
            TAG_PARTITION => Ok(Self::Partition),
            _ => Err(()),
        }
    }
}

/// FNV-1a, stable across runs so snapshots stay readable.
fn fnv64(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in data {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

/// Handle for one logical table inside a column family.
///
/// Keys are composed as `(tag, fnv64(scope), user-key)`. Everything under one
/// handle lives in a single contiguous key range, so a whole table clears with
/// one range delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableHandle {
    tag: TableTag,
    scope: u64,
}

impl TableHandle {
    pub fn new(tag: TableTag, partition_id: PartitionId) -> Self {
        let mut scope = [0u8; 5];
        scope[0] = u8::from(tag);
        scope[1..5].copy_from_slice(&partition_id.to_be_bytes());
        Self {
            tag,
            scope: fnv64(&scope),
        }
    }

    pub fn tag(&self) -> TableTag {
        self.tag
    }

    fn prefix_bytes(&self) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(PREFIX_SIZE);
        prefix.push(u8::from(self.tag));
        prefix.extend_from_slice(&self.scope.to_be_bytes());
        prefix
    }

    pub fn key(&self, user_key: &[u8]) -> Bytes {
        let mut key = Vec::with_capacity(PREFIX_SIZE + user_key.len());
        key.push(u8::from(self.tag));
        key.extend_from_slice(&self.scope.to_be_bytes());
        key.extend_from_slice(user_key);
        Bytes::from(key)
    }

    /// Half-open key range covering the whole table.
    pub fn range(&self) -> (Bytes, Bytes) {
        let start = self.prefix_bytes();
        let end = prefix_successor(&start);
        (Bytes::from(start), end)
    }

    /// Half-open key range covering every key starting with `user_prefix`.
    pub fn prefix_range(&self, user_prefix: &[u8]) -> (Bytes, Bytes) {
        let start = self.key(user_prefix);
        let end = prefix_successor(&start);
        (start, end)
    }

    /// Strip the table prefix off a raw engine key.
    pub fn user_key<'a>(&self, raw: &'a [u8]) -> &'a [u8] {
        &raw[PREFIX_SIZE..]
    }
}

/// Smallest byte string strictly greater than every string with this prefix.
fn prefix_successor(prefix: &[u8]) -> Bytes {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last == 0xFF {
            end.pop();
        } else {
            *last += 1;
            return Bytes::from(end);
        }
    }
    // All 0xFF: unbounded high end.
    Bytes::from_static(&[0xFF; PREFIX_SIZE + 1])
}

pub fn inode_key(inode_id: InodeId) -> Vec<u8> {
    inode_id.to_be_bytes().to_vec()
}

/// Dentry user key: `parent . name \0 !tx_id`.
///
/// Ordered scans walk one parent's entries by name; names never contain NUL,
/// so the separator is unambiguous. The inverted tx-id makes versions of one
/// name sort newest-first, which is what the visibility scan wants.
pub fn dentry_key(parent: InodeId, name: &str, tx_id: TxId) -> Vec<u8> {
    let mut key = Vec::with_capacity(2 * U64_SIZE + name.len() + 1);
    key.extend_from_slice(&parent.to_be_bytes());
    key.extend_from_slice(name.as_bytes());
    key.push(0);
    key.extend_from_slice(&(!tx_id).to_be_bytes());
    key
}

/// Prefix covering every version of one name.
pub fn dentry_name_prefix(parent: InodeId, name: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(U64_SIZE + name.len() + 1);
    key.extend_from_slice(&parent.to_be_bytes());
    key.extend_from_slice(name.as_bytes());
    key.push(0);
    key
}

/// Prefix covering every entry under one parent.
pub fn dentry_parent_prefix(parent: InodeId) -> Vec<u8> {
    parent.to_be_bytes().to_vec()
}

pub fn parse_dentry_key(user_key: &[u8]) -> Option<(InodeId, String, TxId)> {
    if user_key.len() < 2 * U64_SIZE + 1 {
        return None;
    }
    let parent = u64::from_be_bytes(user_key[..U64_SIZE].try_into().ok()?);
    let rest = &user_key[U64_SIZE..];
    let sep = rest.iter().position(|b| *b == 0)?;
    let name = std::str::from_utf8(&rest[..sep]).ok()?.to_string();
    let tx_bytes: [u8; U64_SIZE] = rest[sep + 1..].try_into().ok()?;
    Some((parent, name, !u64::from_be_bytes(tx_bytes)))
}

/// Chunk-info list user key: `inode_id . chunk_index . seq`, all big-endian
/// so one inode's lists scan contiguously in append order.
pub fn chunk_info_key(inode_id: InodeId, chunk_index: u64, seq: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(3 * U64_SIZE);
    key.extend_from_slice(&inode_id.to_be_bytes());
    key.extend_from_slice(&chunk_index.to_be_bytes());
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

pub fn chunk_info_inode_prefix(inode_id: InodeId) -> Vec<u8> {
    inode_id.to_be_bytes().to_vec()
}

pub fn parse_chunk_info_key(user_key: &[u8]) -> Option<(InodeId, u64, u64)> {
    if user_key.len() != 3 * U64_SIZE {
        return None;
    }
    let inode = u64::from_be_bytes(user_key[..U64_SIZE].try_into().ok()?);
    let index = u64::from_be_bytes(user_key[U64_SIZE..2 * U64_SIZE].try_into().ok()?);
    let seq = u64::from_be_bytes(user_key[2 * U64_SIZE..].try_into().ok()?);
    Some((inode, index, seq))
}

pub fn partition_key(partition_id: PartitionId) -> Vec<u8> {
    partition_id.to_be_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_ranges_disjoint() {
        let a = TableHandle::new(TableTag::Inode, 1);
        let b = TableHandle::new(TableTag::Inode, 2);
        let (a_start, a_end) = a.range();
        let (b_start, b_end) = b.range();
        assert!(a_end <= b_start || b_end <= a_start);
    }

    #[test]
    fn test_dentry_key_orders_tx_descending() {
        let newer = dentry_key(5, "file", 7);
        let older = dentry_key(5, "file", 3);
        assert!(newer < older);

        let other_name = dentry_key(5, "g", 1);
        assert!(newer < other_name);
        assert!(older < other_name);

        let other_parent = dentry_key(6, "a", 1);
        assert!(other_name < other_parent);
    }

    #[test]
    fn test_dentry_key_roundtrip() {
        let key = dentry_key(12, "some-name", 42);
        let (parent, name, tx) = parse_dentry_key(&key).unwrap();
        assert_eq!(parent, 12);
        assert_eq!(name, "some-name");
        assert_eq!(tx, 42);
    }

    #[test]
    fn test_chunk_info_key_roundtrip() {
        let key = chunk_info_key(10, 3, 99);
        assert_eq!(parse_chunk_info_key(&key), Some((10, 3, 99)));
    }

    #[test]
    fn test_prefix_successor_carries() {
        assert_eq!(prefix_successor(&[1, 0xFF]), Bytes::from_static(&[2]));
        assert_eq!(prefix_successor(&[1, 2]), Bytes::from_static(&[1, 3]));
    }

    #[test]
    fn test_user_key_strips_prefix() {
        let table = TableHandle::new(TableTag::Dentry, 9);
        let key = table.key(b"abc");
        assert_eq!(table.user_key(&key), b"abc");
    }
}
