use crate::types::{ErrorKind, FsError, PosixError};

/// Code sent to the kernel for an error kind. Total over the taxonomy.
pub const fn translate_kind(kind: ErrorKind) -> PosixError {
    match kind {
        ErrorKind::NotFound => PosixError::FILE_NOT_FOUND,
        ErrorKind::StaleInode => PosixError::STALE_FILE_HANDLE,
        ErrorKind::ProtocolMismatch => PosixError::PROTOCOL_ERROR,
        ErrorKind::Cancelled => PosixError::INTERRUPTED_SYSTEM_CALL,
        ErrorKind::NotSupportedOnPlatform => PosixError::NOT_SUPPORTED,
        ErrorKind::NotImplemented => PosixError::FUNCTION_NOT_IMPLEMENTED,
        ErrorKind::NotADirectory => PosixError::NOT_A_DIRECTORY,
        ErrorKind::IsADirectory => PosixError::IS_A_DIRECTORY,
        ErrorKind::AlreadyExists => PosixError::FILE_EXISTS,
        ErrorKind::DirectoryNotEmpty => PosixError::DIRECTORY_NOT_EMPTY,
        ErrorKind::InvalidArgument => PosixError::INVALID_ARGUMENT,
        ErrorKind::BadFileHandle => PosixError::BAD_FILE_DESCRIPTOR,
        ErrorKind::NoAttribute => PosixError::NO_DATA_AVAILABLE,
        ErrorKind::FileTooLarge => PosixError::FILE_TOO_LARGE,
        ErrorKind::StoreUnavailable
        | ErrorKind::GenericError
        | ErrorKind::Framing
        | ErrorKind::DataCorruption => PosixError::INPUT_OUTPUT_ERROR,
    }
}

/// Only the kind matters; the detail never reaches the kernel.
pub fn translate(error: &FsError) -> PosixError {
    translate_kind(error.kind())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_kinds() {
        let cases = [
            (ErrorKind::NotFound, libc::ENOENT),
            (ErrorKind::StaleInode, libc::ESTALE),
            (ErrorKind::ProtocolMismatch, libc::EPROTO),
            (ErrorKind::Cancelled, libc::EINTR),
            (ErrorKind::StoreUnavailable, libc::EIO),
            (ErrorKind::GenericError, libc::EIO),
            (ErrorKind::NotSupportedOnPlatform, libc::ENOTSUP),
            (ErrorKind::NotImplemented, libc::ENOSYS),
            (ErrorKind::DataCorruption, libc::EIO),
            (ErrorKind::FileTooLarge, libc::EFBIG),
        ];
        for (kind, errno) in cases {
            assert_eq!(translate_kind(kind).raw_error(), errno, "{:?}", kind);
        }
    }

    #[test]
    fn test_detail_does_not_change_code() {
        let a = FsError::new(ErrorKind::DirectoryNotEmpty, "first");
        let b = FsError::new(ErrorKind::DirectoryNotEmpty, "a different message");
        assert_eq!(translate(&a), translate(&b));
        assert_eq!(translate(&a), PosixError::DIRECTORY_NOT_EMPTY);
    }
}
