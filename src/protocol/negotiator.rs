use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::reply::InitOut;
use super::wire::WireLayout;
use crate::config::ChannelConfig;
use crate::types::*;

pub const MAX_MAJOR: u32 = 7;
pub const MIN_MAJOR: u32 = 7;
pub const MAX_MINOR: u32 = 31;

/// Write size the kernel uses when large writes were not negotiated.
const SMALL_WRITE_SIZE: u32 = 4096;
const MAX_BACKGROUND: u16 = 12;

/// Protocol parameters agreed at mount. Immutable for the rest of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub major: u32,
    pub minor: u32,
    pub capabilities: Capabilities,
    pub max_write: u32,
    pub max_readahead: u32,
}

impl ConnectionInfo {
    pub fn layout(&self) -> WireLayout {
        WireLayout::for_minor(self.minor)
    }

    pub fn supports(&self, capability: Capabilities) -> bool {
        self.capabilities.contains(capability)
    }
}

pub struct ProtocolNegotiator {
    wanted: Capabilities,
    max_write: u32,
    max_readahead: u32,
}

impl ProtocolNegotiator {
    pub fn new(config: &ChannelConfig) -> Self {
        ProtocolNegotiator {
            wanted: config.capabilities,
            max_write: config.max_write.max(SMALL_WRITE_SIZE),
            max_readahead: config.max_readahead,
        }
    }

    /// Derives the effective parameters for a kernel speaking `major.minor`.
    pub fn negotiate(
        &self,
        major: u32,
        minor: u32,
        requested: Capabilities,
    ) -> FsResult<ConnectionInfo> {
        if !(MIN_MAJOR..=MAX_MAJOR).contains(&major) {
            warn!(
                "refusing protocol {}.{}, supported major is {}",
                major, minor, MAX_MAJOR
            );
            return Err(FsError::new(
                ErrorKind::ProtocolMismatch,
                format!(
                    "kernel protocol {}.{}, supported {}.{}",
                    major, minor, MAX_MAJOR, MAX_MINOR
                ),
            ));
        }

        let minor = minor.min(MAX_MINOR);
        let capabilities = requested & self.wanted & Capabilities::supported_at(minor);
        let max_write = if capabilities.contains(Capabilities::BIG_WRITES) {
            self.max_write
        } else {
            SMALL_WRITE_SIZE
        };
        let connection = ConnectionInfo {
            major,
            minor,
            capabilities,
            max_write,
            max_readahead: self.max_readahead,
        };
        info!(
            "negotiated protocol {}.{} with capabilities {:?}",
            major, minor, capabilities
        );
        Ok(connection)
    }

    /// [`negotiate`](Self::negotiate) for an INIT request, which also fixes read-ahead.
    pub fn handshake(
        &self,
        major: u32,
        minor: u32,
        max_readahead: u32,
        flags: u32,
    ) -> FsResult<ConnectionInfo> {
        let mut connection =
            self.negotiate(major, minor, Capabilities::from_bits_truncate(flags))?;
        connection.max_readahead = connection.max_readahead.min(max_readahead);
        Ok(connection)
    }

    pub fn init_reply(&self, connection: &ConnectionInfo) -> InitOut {
        InitOut {
            major: MAX_MAJOR,
            minor: connection.minor,
            max_readahead: connection.max_readahead,
            flags: connection.capabilities.bits(),
            max_background: MAX_BACKGROUND,
            congestion_threshold: MAX_BACKGROUND * 3 / 4,
            max_write: connection.max_write,
            time_gran: 1,
            max_pages: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn negotiator() -> ProtocolNegotiator {
        ProtocolNegotiator::new(&ChannelConfig::default())
    }

    #[test]
    fn test_major_out_of_range_is_refused() {
        for major in [6, 8, 100] {
            let err = negotiator().negotiate(major, 0, Capabilities::all()).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::ProtocolMismatch);
        }
    }

    #[test]
    fn test_minor_is_clamped() {
        for minor in [0, 9, 31, 32, 200, u32::MAX] {
            let connection = negotiator().negotiate(7, minor, Capabilities::all()).unwrap();
            assert_eq!(connection.minor, minor.min(MAX_MINOR));
        }
    }

    #[test]
    fn test_capabilities_are_intersected() {
        let connection = negotiator()
            .negotiate(7, 31, Capabilities::ASYNC_READ | Capabilities::POSIX_ACL)
            .unwrap();
        // POSIX_ACL is supported at 31 but not wanted by default
        assert_eq!(connection.capabilities, Capabilities::ASYNC_READ);

        let connection = negotiator().negotiate(7, 5, Capabilities::all()).unwrap();
        assert!(connection.capabilities.is_empty());
    }

    #[test]
    fn test_small_writes_without_big_writes() {
        let connection = negotiator().negotiate(7, 8, Capabilities::all()).unwrap();
        assert_eq!(connection.max_write, 4096);
        let connection = negotiator().negotiate(7, 31, Capabilities::all()).unwrap();
        assert_eq!(connection.max_write, 128 * 1024);
    }

    #[test]
    fn test_handshake_clamps_readahead() {
        let connection = negotiator()
            .handshake(7, 31, 4096, Capabilities::ASYNC_READ.bits() | 1 << 31)
            .unwrap();
        assert_eq!(connection.max_readahead, 4096);
        assert_eq!(connection.capabilities, Capabilities::ASYNC_READ);
        let reply = negotiator().init_reply(&connection);
        assert_eq!(reply.major, 7);
        assert_eq!(reply.minor, 31);
        assert_eq!(reply.flags, Capabilities::ASYNC_READ.bits());
    }
}
