use std::{fmt, io};

use thiserror::Error;

/// Error code as understood by the kernel protocol: a positive errno value.
///
/// The wire reply carries it negated in the `error` field of the out header.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PosixError(i32);

impl PosixError {
    pub const PERMISSION_DENIED: PosixError = PosixError(libc::EPERM);
    pub const FILE_NOT_FOUND: PosixError = PosixError(libc::ENOENT);
    pub const INTERRUPTED_SYSTEM_CALL: PosixError = PosixError(libc::EINTR);
    pub const INPUT_OUTPUT_ERROR: PosixError = PosixError(libc::EIO);
    pub const BAD_FILE_DESCRIPTOR: PosixError = PosixError(libc::EBADF);
    pub const FILE_EXISTS: PosixError = PosixError(libc::EEXIST);
    pub const NOT_A_DIRECTORY: PosixError = PosixError(libc::ENOTDIR);
    pub const IS_A_DIRECTORY: PosixError = PosixError(libc::EISDIR);
    pub const INVALID_ARGUMENT: PosixError = PosixError(libc::EINVAL);
    pub const DIRECTORY_NOT_EMPTY: PosixError = PosixError(libc::ENOTEMPTY);
    pub const STALE_FILE_HANDLE: PosixError = PosixError(libc::ESTALE);
    pub const FUNCTION_NOT_IMPLEMENTED: PosixError = PosixError(libc::ENOSYS);
    pub const NOT_SUPPORTED: PosixError = PosixError(libc::ENOTSUP);
    pub const NO_DATA_AVAILABLE: PosixError = PosixError(libc::ENODATA);
    pub const PROTOCOL_ERROR: PosixError = PosixError(libc::EPROTO);
    pub const FILE_TOO_LARGE: PosixError = PosixError(libc::EFBIG);

    pub const fn from_raw(errno: i32) -> Self {
        PosixError(errno)
    }

    pub const fn raw_error(self) -> i32 {
        self.0
    }
}

impl From<PosixError> for io::Error {
    fn from(value: PosixError) -> Self {
        Self::from_raw_os_error(value.0)
    }
}

impl From<PosixError> for i32 {
    fn from(value: PosixError) -> Self {
        value.0
    }
}

/// Closed taxonomy of failures produced anywhere in the channel and registry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    StaleInode,
    ProtocolMismatch,
    Cancelled,
    StoreUnavailable,
    GenericError,
    Framing,
    NotSupportedOnPlatform,
    NotImplemented,
    NotADirectory,
    IsADirectory,
    AlreadyExists,
    DirectoryNotEmpty,
    InvalidArgument,
    BadFileHandle,
    NoAttribute,
    DataCorruption,
    FileTooLarge,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::StaleInode => "stale inode",
            ErrorKind::ProtocolMismatch => "protocol mismatch",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::StoreUnavailable => "store unavailable",
            ErrorKind::GenericError => "internal error",
            ErrorKind::Framing => "malformed frame",
            ErrorKind::NotSupportedOnPlatform => "not supported on this platform",
            ErrorKind::NotImplemented => "not implemented",
            ErrorKind::NotADirectory => "not a directory",
            ErrorKind::IsADirectory => "is a directory",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::DirectoryNotEmpty => "directory not empty",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::BadFileHandle => "bad file handle",
            ErrorKind::NoAttribute => "no such attribute",
            ErrorKind::DataCorruption => "data corruption",
            ErrorKind::FileTooLarge => "file too large",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error record: a kind from [`ErrorKind`] plus a human readable detail.
///
/// The detail is for logs only. Only the kind crosses the protocol boundary,
/// through [`translate`](crate::channel::translate).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {detail}")]
pub struct FsError {
    kind: ErrorKind,
    detail: String,
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.detail
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, detail)
    }

    pub fn stale(ino: impl fmt::Display) -> Self {
        Self::new(ErrorKind::StaleInode, format!("inode {} is not allocated", ino))
    }

    pub fn framing(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Framing, detail)
    }

    pub fn cancelled(operation: &str) -> Self {
        Self::new(
            ErrorKind::Cancelled,
            format!("{} interrupted before completion", operation),
        )
    }

    pub fn invalid(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::GenericError, detail)
    }
}

impl From<io::Error> for FsError {
    fn from(value: io::Error) -> Self {
        FsError::internal(value.to_string())
    }
}

/// Failure reported by a [`BackingStore`](crate::store::BackingStore) or an
/// [`OverlayStore`](crate::store::OverlayStore).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("object corrupted: {0}")]
    Corrupted(String),
}

impl From<io::Error> for StoreError {
    fn from(value: io::Error) -> Self {
        StoreError::Unavailable(value.to_string())
    }
}

impl From<StoreError> for FsError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Unavailable(detail) => FsError::new(ErrorKind::StoreUnavailable, detail),
            StoreError::Corrupted(detail) => FsError::new(ErrorKind::DataCorruption, detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_reclassified() {
        let err: FsError = StoreError::Unavailable("timeout".into()).into();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
        assert_eq!(err.detail(), "timeout");

        let err: FsError = StoreError::Corrupted("bad hash".into()).into();
        assert_eq!(err.kind(), ErrorKind::DataCorruption);
    }

    #[test]
    fn test_display_includes_kind() {
        let err = FsError::stale(42);
        assert_eq!(err.to_string(), "stale inode: inode 42 is not allocated");
    }
}
