//! Collaborators consulted by request handlers.
//!
//! The channel never assumes these are fast or that they succeed; every
//! failure is surfaced as a failed request.

use std::ffi::OsString;

use crate::types::{InodeKind, InodeNumber, ObjectId, StoreError};

pub mod memory;

/// One child of a tree object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: OsString,
    pub kind: InodeKind,
    pub reference: ObjectId,
    pub executable: bool,
}

/// Source of versioned content, addressed by [`ObjectId`].
pub trait BackingStore: Send + Sync + 'static {
    fn get_tree(&self, reference: &ObjectId) -> Result<Vec<TreeEntry>, StoreError>;

    fn get_blob(&self, reference: &ObjectId) -> Result<Vec<u8>, StoreError>;
}

/// Holds the content of files modified in the working copy, keyed by inode number.
pub trait OverlayStore: Send + Sync + 'static {
    fn read_local(&self, inode: InodeNumber) -> Result<Vec<u8>, StoreError>;

    fn write_local(&self, inode: InodeNumber, content: &[u8]) -> Result<(), StoreError>;

    /// Drops the content of an inode that no longer exists.
    fn remove_local(&self, _inode: InodeNumber) -> Result<(), StoreError> {
        Ok(())
    }
}
