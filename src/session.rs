use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};

use crate::config::ChannelConfig;
use crate::core::{BlobCache, HandleTable, InodeMap, TakeoverData, TAKEOVER_VERSION};
use crate::protocol::ConnectionInfo;
use crate::store::{BackingStore, OverlayStore};
use crate::types::*;

/// Everything one mount owns. Built once and passed to the channel explicitly.
pub struct Session {
    config: ChannelConfig,
    inodes: InodeMap,
    handles: HandleTable,
    backing: Arc<dyn BackingStore>,
    overlay: Arc<dyn OverlayStore>,
    blobs: BlobCache,
    generation: u64,
}

fn new_generation() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(1)
}

impl Session {
    /// A fresh session whose root directory is `root_tree`.
    pub fn new(
        config: ChannelConfig,
        backing: Arc<dyn BackingStore>,
        overlay: Arc<dyn OverlayStore>,
        root_tree: ObjectId,
    ) -> Self {
        Session {
            blobs: BlobCache::new(config.blob_cache_entries),
            inodes: InodeMap::new(backing.clone(), root_tree),
            handles: HandleTable::new(),
            config,
            backing,
            overlay,
            generation: new_generation(),
        }
    }

    /// Rebuilds the session a previous daemon handed over.
    pub fn restore(
        config: ChannelConfig,
        backing: Arc<dyn BackingStore>,
        overlay: Arc<dyn OverlayStore>,
        data: &TakeoverData,
    ) -> FsResult<Self> {
        let inodes = InodeMap::restore(backing.clone(), &data.inode_map)?;
        for handle in &data.handles {
            if !inodes.contains(handle.inode) {
                return Err(FsError::invalid(format!(
                    "handle {} refers to inode {} missing from the snapshot",
                    handle.handle, handle.inode
                )));
            }
        }
        let handles = HandleTable::restore(&data.handles, data.next_handle);
        info!(
            "restored session: {} inodes, {} open handles",
            inodes.len(),
            handles.len()
        );
        Ok(Session {
            blobs: BlobCache::new(config.blob_cache_entries),
            inodes,
            handles,
            config,
            backing,
            overlay,
            generation: data.generation,
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn inodes(&self) -> &InodeMap {
        &self.inodes
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn backing(&self) -> &dyn BackingStore {
        self.backing.as_ref()
    }

    pub fn overlay(&self) -> &dyn OverlayStore {
        self.overlay.as_ref()
    }

    pub fn blobs(&self) -> &BlobCache {
        &self.blobs
    }

    /// Generation reported with every entry; constant across a takeover.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Drops overlay content of local files that left the map.
    pub fn cleanup(&self) {
        for ino in self.inodes.drain_freed() {
            if let Err(e) = self.overlay.remove_local(ino) {
                warn!("removing local content of inode {}: {}", ino, e);
            }
        }
    }

    /// Captures the state that a successor daemon needs. Directory-listing
    /// pins are released first; they never outlive this process.
    pub fn takeover_data(&self, connection: ConnectionInfo) -> FsResult<TakeoverData> {
        let pins = self.handles.take_all_pins();
        self.inodes.unpin(&pins);
        self.cleanup();
        let inode_map = self.inodes.snapshot()?;
        let (handles, next_handle) = self.handles.snapshot();
        Ok(TakeoverData {
            version: TAKEOVER_VERSION,
            generation: self.generation,
            connection,
            inode_map,
            handles,
            next_handle,
        })
    }
}
