use crate::meta::types::{FileType, InodeAttr, InodeId};

/// Attributes handed back to the kernel shim together with cache hints.
#[derive(Debug, Clone)]
pub struct EntryOut {
    pub inode_id: InodeId,
    pub attr: InodeAttr,
    pub attr_timeout: f64,
    pub entry_timeout: f64,
}

#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub inode_id: InodeId,
    pub file_type: FileType,
}

#[derive(Debug, Clone, Copy, Default)]
pub enum SetTime {
    Set { secs: u64, nanos: u32 },
    Now,
    #[default]
    NoChange,
}

/// Which attributes a `setattr` call replaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttrRequest {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: SetTime,
    pub mtime: SetTime,
    pub ctime: SetTime,
}

#[derive(Debug, Clone, Copy)]
pub struct StatFs {
    pub block_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub name_max: u32,
    pub fs_id: u64,
}

/// Open flags as delivered by the shim.
#[derive(Debug, Clone, Copy)]
pub struct OpenFlags(pub i32);

impl OpenFlags {
    pub fn truncate(self) -> bool {
        self.0 & libc::O_TRUNC != 0
    }

    pub fn writable(self) -> bool {
        self.0 & libc::O_ACCMODE == libc::O_WRONLY || self.0 & libc::O_ACCMODE == libc::O_RDWR
    }

    pub fn read_only() -> Self {
        OpenFlags(libc::O_RDONLY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags() {
        assert!(OpenFlags(libc::O_RDWR | libc::O_TRUNC).truncate());
        assert!(OpenFlags(libc::O_RDWR).writable());
        assert!(OpenFlags(libc::O_WRONLY).writable());
        assert!(!OpenFlags(libc::O_RDONLY).writable());
        assert!(!OpenFlags::read_only().truncate());
    }
}
