use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::*;

/// State behind a file handle returned by OPEN, OPENDIR or CREATE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenHandle {
    pub inode: InodeNumber,
    pub kind: InodeKind,
    pub flags: OpenFlags,
    /// Children pinned by READDIR on this directory handle.
    pub pinned: Vec<InodeNumber>,
}

/// Durable form of an open handle. Pins are not saved; the restored map has none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedHandle {
    pub handle: u64,
    pub inode: InodeNumber,
    pub kind: InodeKind,
    pub flags: i32,
}

pub struct HandleTable {
    state: Mutex<HandleState>,
}

struct HandleState {
    handles: HashMap<u64, OpenHandle>,
    next_handle: u64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        HandleTable {
            state: Mutex::new(HandleState {
                handles: HashMap::new(),
                next_handle: 1,
            }),
        }
    }

    pub fn insert(&self, inode: InodeNumber, kind: InodeKind, flags: OpenFlags) -> FileHandle {
        let mut state = self.state.lock();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.handles.insert(
            handle,
            OpenHandle {
                inode,
                kind,
                flags,
                pinned: Vec::new(),
            },
        );
        FileHandle::from(handle)
    }

    /// Returns the handle after checking it was opened on `inode`.
    pub fn get(&self, fh: FileHandle, inode: InodeNumber) -> FsResult<OpenHandle> {
        let state = self.state.lock();
        match state.handles.get(&u64::from(fh)) {
            Some(handle) if handle.inode == inode => Ok(handle.clone()),
            Some(handle) => Err(FsError::new(
                ErrorKind::BadFileHandle,
                format!(
                    "handle {} belongs to inode {}, not {}",
                    u64::from(fh),
                    handle.inode,
                    inode
                ),
            )),
            None => Err(FsError::new(
                ErrorKind::BadFileHandle,
                format!("unknown handle {}", u64::from(fh)),
            )),
        }
    }

    pub fn remove(&self, fh: FileHandle, inode: InodeNumber) -> FsResult<OpenHandle> {
        self.get(fh, inode)?;
        self.state
            .lock()
            .handles
            .remove(&u64::from(fh))
            .ok_or_else(|| FsError::new(ErrorKind::BadFileHandle, "handle released twice"))
    }

    /// Records `pins` on a directory handle and returns the ones it already
    /// held. Those carry an extra pin the caller must drop, which keeps a
    /// directory read again from offset 0 at one pin per entry.
    pub fn add_pins(&self, fh: FileHandle, pins: &[InodeNumber]) -> FsResult<Vec<InodeNumber>> {
        let mut state = self.state.lock();
        let handle = state
            .handles
            .get_mut(&u64::from(fh))
            .ok_or_else(|| FsError::new(ErrorKind::BadFileHandle, "unknown handle"))?;
        let mut held: HashSet<InodeNumber> = handle.pinned.iter().copied().collect();
        let mut repeated = Vec::new();
        for &ino in pins {
            if held.insert(ino) {
                handle.pinned.push(ino);
            } else {
                repeated.push(ino);
            }
        }
        Ok(repeated)
    }

    /// Strips every pin from every handle and returns them.
    pub fn take_all_pins(&self) -> Vec<InodeNumber> {
        let mut state = self.state.lock();
        state
            .handles
            .values_mut()
            .flat_map(|handle| std::mem::take(&mut handle.pinned))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> (Vec<SerializedHandle>, u64) {
        let state = self.state.lock();
        let mut handles: Vec<_> = state
            .handles
            .iter()
            .map(|(&handle, open)| SerializedHandle {
                handle,
                inode: open.inode,
                kind: open.kind,
                flags: open.flags.bits(),
            })
            .collect();
        handles.sort_by_key(|h| h.handle);
        (handles, state.next_handle)
    }

    pub fn restore(handles: &[SerializedHandle], next_handle: u64) -> Self {
        let highest = handles.iter().map(|h| h.handle).max().unwrap_or(0);
        let handles = handles
            .iter()
            .map(|h| {
                (
                    h.handle,
                    OpenHandle {
                        inode: h.inode,
                        kind: h.kind,
                        flags: OpenFlags::from_bits_retain(h.flags),
                        pinned: Vec::new(),
                    },
                )
            })
            .collect();
        HandleTable {
            state: Mutex::new(HandleState {
                handles,
                next_handle: next_handle.max(highest + 1),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_bound_to_their_inode() {
        let table = HandleTable::new();
        let ino = InodeNumber::from(5);
        let fh = table.insert(ino, InodeKind::File, OpenFlags::READ_ONLY);
        assert!(table.get(fh, ino).is_ok());
        let err = table.get(fh, InodeNumber::from(6)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadFileHandle);
        table.remove(fh, ino).unwrap();
        assert_eq!(table.remove(fh, ino).unwrap_err().kind(), ErrorKind::BadFileHandle);
    }

    #[test]
    fn test_restore_keeps_numbers_and_watermark() {
        let table = HandleTable::new();
        let a = table.insert(InodeNumber::from(2), InodeKind::File, OpenFlags::READ_WRITE);
        let b = table.insert(InodeNumber::from(3), InodeKind::Directory, OpenFlags::READ_ONLY);
        table.add_pins(b, &[InodeNumber::from(9)]).unwrap();
        table.remove(a, InodeNumber::from(2)).unwrap();

        let (saved, next) = table.snapshot();
        let restored = HandleTable::restore(&saved, next);
        let handle = restored.get(b, InodeNumber::from(3)).unwrap();
        assert!(handle.pinned.is_empty());
        let c = restored.insert(InodeNumber::from(4), InodeKind::File, OpenFlags::READ_ONLY);
        assert!(u64::from(c) > u64::from(b));
        assert_ne!(c, a);
    }

    #[test]
    fn test_repeated_pins_are_returned() {
        let table = HandleTable::new();
        let dir = InodeNumber::from(3);
        let fh = table.insert(dir, InodeKind::Directory, OpenFlags::READ_ONLY);
        let first = [InodeNumber::from(7), InodeNumber::from(8)];
        assert!(table.add_pins(fh, &first).unwrap().is_empty());

        // a second pass from the start pins 7 and 8 again, plus a new entry
        let again = [InodeNumber::from(7), InodeNumber::from(8), InodeNumber::from(9)];
        assert_eq!(table.add_pins(fh, &again).unwrap(), first.to_vec());
        assert_eq!(table.get(fh, dir).unwrap().pinned.len(), 3);
    }
}
