mod blob_cache;
mod blocking;
mod handles;
mod inflight;
mod inode_map;
mod snapshot;

pub use blob_cache::BlobCache;
pub use blocking::{blocking, on_worker, BlockingPool};
pub use handles::{HandleTable, OpenHandle, SerializedHandle};
pub use inflight::InFlight;
pub use inode_map::{Inode, InodeMap, ListedEntry};
pub use snapshot::{
    SerializedDirEntry, SerializedInode, SerializedInodeMap, TakeoverData, TAKEOVER_VERSION,
};
