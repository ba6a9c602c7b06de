use thiserror::Error;

use crate::meta::types::MetaStatus;

/// Errors surfaced to the kernel shim. Each maps to one errno; the shim only
/// ever sees the numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,
    #[error("file exists")]
    Exists,
    #[error("file name too long")]
    NameTooLong,
    #[error("directory not empty")]
    NotEmpty,
    #[error("permission denied")]
    NoPermission,
    #[error("is a directory")]
    IsDir,
    #[error("not a directory")]
    NotDir,
    #[error("result too large")]
    OutOfRange,
    #[error("no data available")]
    NoData,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("operation not supported")]
    NotSupported,
    #[error("no space left")]
    NoSpace,
    #[error("timed out")]
    TimedOut,
    #[error("bad file descriptor")]
    BadHandle,
    #[error("input/output error")]
    IoError,
    #[error("internal error")]
    Internal,
}

impl FsError {
    pub fn to_errno(self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::Exists => libc::EEXIST,
            FsError::NameTooLong => libc::ENAMETOOLONG,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NoPermission => libc::EACCES,
            FsError::IsDir => libc::EISDIR,
            FsError::NotDir => libc::ENOTDIR,
            FsError::OutOfRange => libc::ERANGE,
            FsError::NoData => libc::ENODATA,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::NotSupported => libc::ENOTSUP,
            FsError::NoSpace => libc::ENOSPC,
            FsError::TimedOut => libc::ETIMEDOUT,
            FsError::BadHandle => libc::EBADF,
            FsError::IoError => libc::EIO,
            FsError::Internal => libc::EIO,
        }
    }
}

impl From<MetaStatus> for FsError {
    fn from(status: MetaStatus) -> Self {
        match status {
            MetaStatus::Ok => FsError::Internal,
            MetaStatus::NotFound => FsError::NotFound,
            MetaStatus::Exists => FsError::Exists,
            MetaStatus::NameTooLong => FsError::NameTooLong,
            MetaStatus::NotEmpty => FsError::NotEmpty,
            MetaStatus::NoPermission => FsError::NoPermission,
            MetaStatus::IsDir => FsError::IsDir,
            MetaStatus::NotDir => FsError::NotDir,
            MetaStatus::OutOfRange => FsError::OutOfRange,
            MetaStatus::NoData => FsError::NoData,
            MetaStatus::InvalidParam => FsError::InvalidArgument,
            MetaStatus::MountPointExist
            | MetaStatus::MountFailed
            | MetaStatus::PartitionNotFound
            | MetaStatus::PartitionDeleting => FsError::IoError,
            MetaStatus::ResourceExhausted => FsError::NoSpace,
            MetaStatus::DeadlineExceeded => FsError::TimedOut,
            MetaStatus::StaleTx
            | MetaStatus::Redirect
            | MetaStatus::RpcStreamError
            | MetaStatus::ChunkMetaTooLarge
            | MetaStatus::Internal => FsError::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsError::NotFound.to_errno(), libc::ENOENT);
        assert_eq!(FsError::NameTooLong.to_errno(), libc::ENAMETOOLONG);
        assert_eq!(FsError::from(MetaStatus::NotEmpty), FsError::NotEmpty);
        assert_eq!(FsError::from(MetaStatus::StaleTx), FsError::Internal);
    }
}
