use std::fmt;

use serde::{Deserialize, Serialize};

/// Represents an inode number handed to the kernel.
///
/// Numbers are allocated by the [`InodeMap`](crate::core::InodeMap) from a monotonic
/// counter and stay valid for the whole mount session, including across a takeover:
/// a restored map honors the numbers it was saved with so that file handles held by
/// running processes keep resolving.
///
/// This struct is a wrapper around a u64, providing type safety and
/// semantic meaning to inode numbers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InodeNumber(u64);

/// The mountpoint directory. Its number is fixed by the kernel protocol.
pub const ROOT_INODE: InodeNumber = InodeNumber(1);

impl InodeNumber {
    /// Allow const creation of InodeNumber.
    pub const fn from_raw(value: u64) -> Self {
        InodeNumber(value)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl From<u64> for InodeNumber {
    fn from(value: u64) -> Self {
        InodeNumber(value)
    }
}

impl From<InodeNumber> for u64 {
    fn from(value: InodeNumber) -> Self {
        value.0
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two variants an inode can take.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InodeKind {
    File,
    Directory,
}

impl InodeKind {
    /// File type bits for `st_mode`.
    pub fn mode_bits(self) -> u32 {
        match self {
            InodeKind::File => libc::S_IFREG as u32,
            InodeKind::Directory => libc::S_IFDIR as u32,
        }
    }

    /// File type as reported in a directory entry.
    pub fn dirent_type(self) -> u32 {
        match self {
            InodeKind::File => libc::DT_REG as u32,
            InodeKind::Directory => libc::DT_DIR as u32,
        }
    }
}
