use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub type FsId = u32;
pub type InodeId = u64;
pub type PartitionId = u32;
pub type PoolId = u32;
pub type CopysetId = u32;
pub type TxId = u64;
pub type ChunkIndex = u64;

pub const ROOT_INODE_ID: InodeId = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Special,
}

impl FileType {
    pub fn is_directory(self) -> bool {
        matches!(self, FileType::Directory)
    }
}

/// Wire status taxonomy shared by the metadata and mapping services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MetaStatus {
    #[error("ok")]
    Ok,
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    Exists,
    #[error("name too long")]
    NameTooLong,
    #[error("directory not empty")]
    NotEmpty,
    #[error("permission denied")]
    NoPermission,
    #[error("is a directory")]
    IsDir,
    #[error("not a directory")]
    NotDir,
    #[error("out of range")]
    OutOfRange,
    #[error("no data")]
    NoData,
    #[error("invalid parameter")]
    InvalidParam,
    #[error("mount point already exists")]
    MountPointExist,
    #[error("mount failed")]
    MountFailed,
    #[error("stale transaction id")]
    StaleTx,
    #[error("redirected to new leader")]
    Redirect,
    #[error("partition not found")]
    PartitionNotFound,
    #[error("partition is deleting")]
    PartitionDeleting,
    #[error("resource exhausted")]
    ResourceExhausted,
    #[error("rpc stream error")]
    RpcStreamError,
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("inode chunk metadata too large")]
    ChunkMetaTooLarge,
    #[error("internal error")]
    Internal,
}

impl MetaStatus {
    pub fn name(self) -> &'static str {
        match self {
            MetaStatus::Ok => "OK",
            MetaStatus::NotFound => "NOT_FOUND",
            MetaStatus::Exists => "EXISTS",
            MetaStatus::NameTooLong => "NAMETOOLONG",
            MetaStatus::NotEmpty => "NOT_EMPTY",
            MetaStatus::NoPermission => "NO_PERMISSION",
            MetaStatus::IsDir => "IS_DIR",
            MetaStatus::NotDir => "NOT_DIR",
            MetaStatus::OutOfRange => "OUT_OF_RANGE",
            MetaStatus::NoData => "NO_DATA",
            MetaStatus::InvalidParam => "INVALID_PARAM",
            MetaStatus::MountPointExist => "MOUNT_POINT_EXIST",
            MetaStatus::MountFailed => "MOUNT_FAILED",
            MetaStatus::StaleTx => "STALE_TX",
            MetaStatus::Redirect => "REDIRECT",
            MetaStatus::PartitionNotFound => "PARTITION_NOT_FOUND",
            MetaStatus::PartitionDeleting => "PARTITION_DELETING",
            MetaStatus::ResourceExhausted => "RESOURCE_EXHAUSTED",
            MetaStatus::RpcStreamError => "RPC_STREAM_ERROR",
            MetaStatus::DeadlineExceeded => "DEADLINE_EXCEEDED",
            MetaStatus::ChunkMetaTooLarge => "INODE_CHUNK_META_TOO_LARGE",
            MetaStatus::Internal => "INTERNAL",
        }
    }
}

/// One object-store write's contribution to a chunk window.
///
/// `offset` and `len` position the contribution inside the 64-bit file
/// offset space; `size` is the number of bytes actually stored (zero chunks
/// store nothing). Within one chunk index, later entries overlay earlier
/// ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub chunk_id: u64,
    pub offset: u64,
    pub len: u64,
    pub size: u64,
    pub zero: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfoList {
    pub entries: Vec<ChunkInfo>,
}

impl ChunkInfoList {
    pub fn new(entries: Vec<ChunkInfo>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn merge(&mut self, other: &ChunkInfoList) {
        self.entries.extend(other.entries.iter().copied());
    }

    pub fn encoded_len(&self) -> u64 {
        bincode::serialized_size(self).unwrap_or(0)
    }
}

pub type ChunkInfoMap = BTreeMap<ChunkIndex, ChunkInfoList>;

/// One mapped range of a volume-backed file. The volume data path is the
/// alternative space map to `chunk_map`; an inode populates at most one of
/// the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeExtent {
    pub logical_offset: u64,
    pub physical_offset: u64,
    pub len: u64,
    pub is_written: bool,
}

pub type VolumeExtentMap = BTreeMap<u64, Vec<VolumeExtent>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DentryFlags(u32);

impl DentryFlags {
    pub const DELETE_MARK: DentryFlags = DentryFlags(0x1);
    pub const TX_PREPARE: DentryFlags = DentryFlags(0x2);
    pub const FILE_TYPE: DentryFlags = DentryFlags(0x4);

    pub fn empty() -> Self {
        DentryFlags(0)
    }

    pub fn contains(self, other: DentryFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: DentryFlags) -> Self {
        DentryFlags(self.0 | other.0)
    }

    pub fn without(self, other: DentryFlags) -> Self {
        DentryFlags(self.0 & !other.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dentry {
    pub fs_id: FsId,
    pub parent_inode_id: InodeId,
    pub name: String,
    pub tx_id: TxId,
    pub inode_id: InodeId,
    pub flags: DentryFlags,
}

impl Dentry {
    pub fn is_file(&self) -> bool {
        self.flags.contains(DentryFlags::FILE_TYPE)
    }

    pub fn delete_marked(&self) -> bool {
        self.flags.contains(DentryFlags::DELETE_MARK)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inode {
    pub fs_id: FsId,
    pub inode_id: InodeId,
    pub length: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub atime_nsec: u32,
    pub mtime: u64,
    pub mtime_nsec: u32,
    pub ctime: u64,
    pub ctime_nsec: u32,
    pub nlink: u32,
    pub file_type: FileType,
    pub rdev: u64,
    pub symlink_target: Option<Vec<u8>>,
    /// Multiset of parent directories; a multi-linked file lists each parent
    /// once per link.
    pub parents: Vec<InodeId>,
    pub xattrs: BTreeMap<String, String>,
    /// S3 space map, keyed by chunk index. Mutually exclusive with
    /// `volume_extents`.
    pub chunk_map: ChunkInfoMap,
    /// Volume space map; never populated by the S3 data path.
    pub volume_extents: VolumeExtentMap,
}

impl Inode {
    pub fn attr(&self) -> InodeAttr {
        InodeAttr {
            fs_id: self.fs_id,
            inode_id: self.inode_id,
            length: self.length,
            mode: self.mode,
            uid: self.uid,
            gid: self.gid,
            atime: self.atime,
            atime_nsec: self.atime_nsec,
            mtime: self.mtime,
            mtime_nsec: self.mtime_nsec,
            ctime: self.ctime,
            ctime_nsec: self.ctime_nsec,
            nlink: self.nlink,
            file_type: self.file_type,
            rdev: self.rdev,
        }
    }

    pub fn xattr(&self) -> Xattr {
        Xattr {
            fs_id: self.fs_id,
            inode_id: self.inode_id,
            xattrs: self.xattrs.clone(),
        }
    }

    pub fn is_directory(&self) -> bool {
        self.file_type.is_directory()
    }

    pub fn set_times(&mut self, secs: u64, nanos: u32) {
        self.mtime = secs;
        self.mtime_nsec = nanos;
        self.ctime = secs;
        self.ctime_nsec = nanos;
    }
}

/// Header-only projection of an inode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct InodeAttr {
    pub fs_id: FsId,
    pub inode_id: InodeId,
    pub length: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub atime_nsec: u32,
    pub mtime: u64,
    pub mtime_nsec: u32,
    pub ctime: u64,
    pub ctime_nsec: u32,
    pub nlink: u32,
    pub file_type: FileType,
    pub rdev: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Xattr {
    pub fs_id: FsId,
    pub inode_id: InodeId,
    pub xattrs: BTreeMap<String, String>,
}

/// Parameters for inode creation.
#[derive(Debug, Clone)]
pub struct InodeParam {
    pub fs_id: FsId,
    pub length: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub file_type: FileType,
    pub rdev: u64,
    pub symlink_target: Option<Vec<u8>>,
    pub parent: InodeId,
}

/// Whole-record attribute replace, optionally rewriting the space map.
#[derive(Debug, Clone)]
pub struct UpdateInodeRequest {
    pub attr: InodeAttr,
    pub parents: Vec<InodeId>,
    pub xattrs: BTreeMap<String, String>,
    pub chunk_map: Option<ChunkInfoMap>,
}

impl UpdateInodeRequest {
    pub fn from_inode(inode: &Inode) -> Self {
        Self {
            attr: inode.attr(),
            parents: inode.parents.clone(),
            xattrs: inode.xattrs.clone(),
            chunk_map: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionStatus {
    ReadWrite,
    Deleting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub pool_id: PoolId,
    pub copyset_id: CopysetId,
    pub partition_id: PartitionId,
    pub fs_id: FsId,
    /// Inclusive-exclusive inode id range owned by this partition. Directory
    /// entries are owned by the partition of their parent inode.
    pub start: InodeId,
    pub end: InodeId,
    pub tx_id: TxId,
    pub status: PartitionStatus,
    /// Next inode id the allocator will hand out.
    pub next_id: InodeId,
}

impl PartitionInfo {
    pub fn owns(&self, inode_id: InodeId) -> bool {
        inode_id >= self.start && inode_id < self.end
    }
}

/// `(partition, tx)` pair used by `get_latest_tx_id` and `commit_tx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionTxId {
    pub partition_id: PartitionId,
    pub tx_id: TxId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsInfo {
    pub fs_id: FsId,
    pub fs_name: String,
    pub block_size: u32,
    pub capacity: u64,
    pub enable_sum_in_dir: bool,
    pub mount_points: Vec<String>,
}

pub fn now_pair() -> (u64, u32) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    (now.as_secs(), now.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dentry_flags() {
        let flags = DentryFlags::empty()
            .with(DentryFlags::DELETE_MARK)
            .with(DentryFlags::TX_PREPARE);
        assert!(flags.contains(DentryFlags::DELETE_MARK));
        assert!(flags.contains(DentryFlags::TX_PREPARE));
        assert!(!flags.contains(DentryFlags::FILE_TYPE));
        assert!(!flags
            .without(DentryFlags::DELETE_MARK)
            .contains(DentryFlags::DELETE_MARK));
    }

    #[test]
    fn test_inode_serialization() {
        let mut inode = Inode {
            fs_id: 1,
            inode_id: 100,
            length: 4096,
            mode: 0o755,
            uid: 1000,
            gid: 1000,
            atime: 1,
            atime_nsec: 2,
            mtime: 3,
            mtime_nsec: 4,
            ctime: 5,
            ctime_nsec: 6,
            nlink: 2,
            file_type: FileType::Directory,
            rdev: 0,
            symlink_target: None,
            parents: vec![1],
            xattrs: BTreeMap::new(),
            chunk_map: BTreeMap::new(),
            volume_extents: BTreeMap::new(),
        };
        inode.chunk_map.insert(
            0,
            ChunkInfoList::new(vec![ChunkInfo {
                chunk_id: 9,
                offset: 0,
                len: 4096,
                size: 4096,
                zero: false,
            }]),
        );

        let bytes = bincode::serialize(&inode).unwrap();
        let decoded: Inode = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded.inode_id, 100);
        assert_eq!(decoded.chunk_map[&0].entries.len(), 1);
        assert!(decoded.is_directory());
    }

    #[test]
    fn test_partition_owns() {
        let info = PartitionInfo {
            pool_id: 1,
            copyset_id: 1,
            partition_id: 1,
            fs_id: 1,
            start: 100,
            end: 200,
            tx_id: 0,
            status: PartitionStatus::ReadWrite,
            next_id: 100,
        };
        assert!(info.owns(100));
        assert!(info.owns(199));
        assert!(!info.owns(200));
        assert!(!info.owns(99));
    }
}
