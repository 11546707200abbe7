#![forbid(unsafe_code)]
//! Error types for vramfs.
//!
//! Defines `VramfsError` and a `Result<T>` alias used throughout the
//! workspace. Includes errno mappings for FUSE response codes.

use thiserror::Error;

/// Unified error type for all vramfs operations.
#[derive(Debug, Error)]
pub enum VramfsError {
    #[error("not found")]
    NotFound,

    #[error("file exists")]
    AlreadyExists,

    #[error("not a directory")]
    NotADirectory,

    #[error("is a directory")]
    IsADirectory,

    #[error("directory not empty")]
    DirectoryNotEmpty,

    #[error("operation not permitted")]
    OperationNotPermitted,

    #[error("no block available")]
    NoSpace,

    #[error("try again")]
    TryAgain,

    #[error("device failure: {detail}")]
    DeviceFailure { detail: String },
}

impl VramfsError {
    /// Build a [`VramfsError::DeviceFailure`] from anything printable.
    pub fn device(detail: impl Into<String>) -> Self {
        Self::DeviceFailure {
            detail: detail.into(),
        }
    }

    /// Convert this error into a POSIX errno suitable for FUSE replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::AlreadyExists => libc::EEXIST,
            Self::NotADirectory => libc::ENOTDIR,
            Self::IsADirectory => libc::EISDIR,
            Self::DirectoryNotEmpty => libc::ENOTEMPTY,
            Self::OperationNotPermitted => libc::EPERM,
            Self::NoSpace => libc::ENOSPC,
            Self::TryAgain => libc::EAGAIN,
            Self::DeviceFailure { .. } => libc::EIO,
        }
    }

    /// True for errors that indicate driver misbehavior rather than a
    /// normal filesystem condition.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceFailure { .. })
    }
}

/// Result alias using `VramfsError`.
pub type Result<T> = std::result::Result<T, VramfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(VramfsError::NotFound.to_errno(), libc::ENOENT);
        assert_eq!(VramfsError::AlreadyExists.to_errno(), libc::EEXIST);
        assert_eq!(VramfsError::NotADirectory.to_errno(), libc::ENOTDIR);
        assert_eq!(VramfsError::IsADirectory.to_errno(), libc::EISDIR);
        assert_eq!(VramfsError::DirectoryNotEmpty.to_errno(), libc::ENOTEMPTY);
        assert_eq!(VramfsError::OperationNotPermitted.to_errno(), libc::EPERM);
        assert_eq!(VramfsError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(VramfsError::TryAgain.to_errno(), libc::EAGAIN);
        assert_eq!(VramfsError::device("lost queue").to_errno(), libc::EIO);
    }

    #[test]
    fn only_device_failures_are_fatal() {
        assert!(VramfsError::device("queue gone").is_fatal());
        assert!(!VramfsError::NotFound.is_fatal());
        assert!(!VramfsError::NoSpace.is_fatal());
    }
}
