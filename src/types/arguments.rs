use std::ffi::OsString;
use std::time::SystemTime;

use super::{InodeKind, InodeNumber};

/// Represents the file handle of an open file or directory, as handed to the kernel
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct FileHandle(u64);

impl From<u64> for FileHandle {
    fn from(value: u64) -> Self {
        FileHandle(value)
    }
}

impl From<FileHandle> for u64 {
    fn from(value: FileHandle) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestInfo {
    pub unique: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileAttribute {
    pub inode: InodeNumber,
    pub size: u64,
    pub blocks: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub kind: InodeKind,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub blksize: u32,
}

impl FileAttribute {
    /// Full `st_mode`: file type bits and permissions.
    pub fn mode(&self) -> u32 {
        self.kind.mode_bits() | u32::from(self.perm)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeOrNow {
    SpecificTime(SystemTime),
    Now,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetAttrRequest {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
    pub file_handle: Option<FileHandle>,
}

/// One entry of a READDIR reply. `offset` is the cookie of the entry that follows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: InodeNumber,
    pub offset: u64,
    pub kind: InodeKind,
    pub name: OsString,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatFs {
    pub total_blocks: u64,        // Total number of blocks
    pub free_blocks: u64,         // Number of free blocks
    pub available_blocks: u64,    // Number of blocks available to non-root users
    pub total_files: u64,         // Total number of files
    pub free_files: u64,          // Number of free file nodes
    pub block_size: u32,          // Size of a block in bytes
    pub max_filename_length: u32, // Maximum length of a filename
    pub fragment_size: u32,       // Fragment size in bytes
}

impl Default for StatFs {
    /// A virtual working copy has no meaningful capacity; report values tools accept
    fn default() -> Self {
        StatFs {
            total_blocks: u64::MAX,
            free_blocks: u64::MAX,
            available_blocks: u64::MAX,
            total_files: u64::MAX / 2,
            free_files: u64::MAX / 2,
            block_size: 4096,
            max_filename_length: 255,
            fragment_size: 4096,
        }
    }
}
