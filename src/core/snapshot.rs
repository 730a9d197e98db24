//! Durable record of a session, handed from a stopping daemon to its successor.
//!
//! The record must round-trip exactly: same inode numbers, same reference
//! counts, same handle numbers. Processes holding files open across the
//! restart never notice it.

use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use super::handles::SerializedHandle;
use crate::protocol::ConnectionInfo;
use crate::types::*;

pub const TAKEOVER_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedDirEntry {
    pub name: OsString,
    pub kind: InodeKind,
    pub content: Option<ObjectId>,
    pub executable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedInode {
    pub number: InodeNumber,
    /// Absolute path inside the mount; `None` once unlinked.
    pub path: Option<PathBuf>,
    pub kind: InodeKind,
    pub content: Option<ObjectId>,
    pub materialized: bool,
    pub size: Option<u64>,
    pub perm: u16,
    pub mtime: SystemTime,
    pub lookup_count: u64,
    pub open_count: u64,
    /// Listing of a materialized directory, which no backing tree can reproduce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<SerializedDirEntry>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedInodeMap {
    /// Allocation watermark; the restored map never hands out a number below it.
    pub next_inode: u64,
    pub inodes: Vec<SerializedInode>,
}

impl SerializedInodeMap {
    pub fn get(&self, number: InodeNumber) -> Option<&SerializedInode> {
        self.inodes.iter().find(|inode| inode.number == number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeoverData {
    pub version: u32,
    pub generation: u64,
    pub connection: ConnectionInfo,
    pub inode_map: SerializedInodeMap,
    pub handles: Vec<SerializedHandle>,
    pub next_handle: u64,
}

impl TakeoverData {
    pub fn write_to<W: Write>(&self, writer: W) -> FsResult<()> {
        serde_json::to_writer(writer, self)
            .map_err(|e| FsError::internal(format!("serializing takeover data: {}", e)))
    }

    pub fn read_from<R: Read>(reader: R) -> FsResult<Self> {
        let data: TakeoverData = serde_json::from_reader(reader)
            .map_err(|e| FsError::invalid(format!("parsing takeover data: {}", e)))?;
        data.check_version()?;
        Ok(data)
    }

    pub fn to_bytes(&self) -> FsResult<Vec<u8>> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes)?;
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> FsResult<Self> {
        Self::read_from(bytes)
    }

    fn check_version(&self) -> FsResult<()> {
        if self.version != TAKEOVER_VERSION {
            return Err(FsError::new(
                ErrorKind::ProtocolMismatch,
                format!(
                    "takeover data version {} (supported: {})",
                    self.version, TAKEOVER_VERSION
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TakeoverData {
        TakeoverData {
            version: TAKEOVER_VERSION,
            generation: 3,
            connection: ConnectionInfo {
                major: 7,
                minor: 31,
                capabilities: Capabilities::BIG_WRITES,
                max_write: 128 * 1024,
                max_readahead: 64 * 1024,
            },
            inode_map: SerializedInodeMap {
                next_inode: 3,
                inodes: vec![SerializedInode {
                    number: InodeNumber::from(2),
                    path: Some(PathBuf::from("/notes")),
                    kind: InodeKind::File,
                    content: None,
                    materialized: true,
                    size: Some(5),
                    perm: 0o644,
                    mtime: SystemTime::UNIX_EPOCH,
                    lookup_count: 1,
                    open_count: 0,
                    entries: None,
                }],
            },
            handles: Vec::new(),
            next_handle: 1,
        }
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut data = sample();
        data.version = TAKEOVER_VERSION + 1;
        let bytes = data.to_bytes().unwrap();
        let error = TakeoverData::from_bytes(&bytes).unwrap_err();
        assert_eq!(error.kind(), ErrorKind::ProtocolMismatch);
    }

    #[test]
    fn test_rejects_garbage() {
        let error = TakeoverData::from_bytes(b"{\"version\":").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_lookup_by_number() {
        let data = sample();
        assert!(data.inode_map.get(InodeNumber::from(2)).is_some());
        assert!(data.inode_map.get(InodeNumber::from(9)).is_none());
    }
}
