//! Session configuration.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Capabilities, FsError, FsResult};

/// Tunables for one mount session.
///
/// Every field has a default, so a JSON document only needs the keys it overrides:
///
/// ```
/// use lazy_fuser::ChannelConfig;
///
/// let config = ChannelConfig::from_json(r#"{ "worker_count": 2 }"#).unwrap();
/// assert_eq!(config.worker_count, 2);
/// assert_eq!(config.max_write, 128 * 1024);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Number of worker threads dispatching requests.
    pub worker_count: usize,
    /// Largest WRITE payload accepted when big writes are negotiated.
    pub max_write: u32,
    pub max_readahead: u32,
    /// How long the kernel may cache attributes.
    pub attr_ttl: Duration,
    /// How long the kernel may cache name lookups.
    pub entry_ttl: Duration,
    /// Capabilities the daemon is willing to enable, if the kernel offers them.
    pub capabilities: Capabilities,
    /// Upper bound on the number of blobs kept in memory after a fetch.
    pub blob_cache_entries: usize,
    /// Largest size a file may reach through WRITE or truncation.
    pub max_file_size: u64,
    /// Owner reported for every inode.
    pub uid: u32,
    pub gid: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            worker_count: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            max_write: 128 * 1024,
            max_readahead: 128 * 1024,
            attr_ttl: Duration::from_secs(1),
            entry_ttl: Duration::from_secs(1),
            capabilities: Capabilities::ASYNC_READ
                | Capabilities::ATOMIC_O_TRUNC
                | Capabilities::BIG_WRITES
                | Capabilities::DONT_MASK
                | Capabilities::PARALLEL_DIROPS,
            blob_cache_entries: 1024,
            max_file_size: 1 << 32,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }
}

impl ChannelConfig {
    pub fn from_json(text: &str) -> FsResult<Self> {
        let config: ChannelConfig = serde_json::from_str(text)
            .map_err(|e| FsError::invalid(format!("channel config: {}", e)))?;
        if config.worker_count == 0 {
            return Err(FsError::invalid("channel config: worker_count must be positive"));
        }
        Ok(config)
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = max_file_size;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}
