use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct OpenFlags: i32 {
        const READ_ONLY = libc::O_RDONLY;
        const WRITE_ONLY = libc::O_WRONLY;
        const READ_WRITE = libc::O_RDWR;
        const CREATE = libc::O_CREAT;
        const CREATE_EXCLUSIVE = libc::O_EXCL;
        const TRUNCATE = libc::O_TRUNC;
        const APPEND_MODE = libc::O_APPEND;
        const MUST_BE_DIRECTORY = libc::O_DIRECTORY;
        const _ = !0;
    }
}

impl OpenFlags {
    pub fn is_writable(self) -> bool {
        self.intersects(OpenFlags::WRITE_ONLY | OpenFlags::READ_WRITE)
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct RenameFlags: u32 {
        const NOREPLACE = 1 << 0;
        const EXCHANGE = 1 << 1;
        const _ = !0;
    }
}

bitflags! {
    /// Which fields of a SETATTR request are meaningful.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct SetattrValid: u32 {
        const MODE = 1 << 0;
        const UID = 1 << 1;
        const GID = 1 << 2;
        const SIZE = 1 << 3;
        const ATIME = 1 << 4;
        const MTIME = 1 << 5;
        const FH = 1 << 6;
        const ATIME_NOW = 1 << 7;
        const MTIME_NOW = 1 << 8;
        const LOCKOWNER = 1 << 9;
        const CTIME = 1 << 10;
        const _ = !0;
    }
}

bitflags! {
    /// INIT capability bits exchanged with the kernel.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Capabilities: u32 {
        const ASYNC_READ = 1 << 0;
        const POSIX_LOCKS = 1 << 1;
        const ATOMIC_O_TRUNC = 1 << 3;
        const EXPORT_SUPPORT = 1 << 4;
        const BIG_WRITES = 1 << 5;
        const DONT_MASK = 1 << 6;
        const AUTO_INVAL_DATA = 1 << 12;
        const PARALLEL_DIROPS = 1 << 18;
        /// Gates extended attribute requests.
        const POSIX_ACL = 1 << 20;
    }
}

impl Capabilities {
    /// Lowest protocol minor version at which each capability exists.
    const MINIMUM_MINOR: [(Capabilities, u32); 9] = [
        (Capabilities::ASYNC_READ, 6),
        (Capabilities::POSIX_LOCKS, 7),
        (Capabilities::ATOMIC_O_TRUNC, 9),
        (Capabilities::BIG_WRITES, 9),
        (Capabilities::EXPORT_SUPPORT, 10),
        (Capabilities::DONT_MASK, 12),
        (Capabilities::AUTO_INVAL_DATA, 20),
        (Capabilities::PARALLEL_DIROPS, 25),
        (Capabilities::POSIX_ACL, 26),
    ];

    /// Every capability defined at the given protocol minor version.
    pub fn supported_at(minor: u32) -> Capabilities {
        Self::MINIMUM_MINOR
            .iter()
            .filter(|(_, min)| minor >= *min)
            .fold(Capabilities::empty(), |acc, (cap, _)| acc | *cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_at_grows_with_minor() {
        assert!(Capabilities::supported_at(5).is_empty());
        assert_eq!(
            Capabilities::supported_at(9),
            Capabilities::ASYNC_READ
                | Capabilities::POSIX_LOCKS
                | Capabilities::ATOMIC_O_TRUNC
                | Capabilities::BIG_WRITES
        );
        assert!(Capabilities::supported_at(31).contains(Capabilities::POSIX_ACL));
        assert!(!Capabilities::supported_at(25).contains(Capabilities::POSIX_ACL));
    }

    #[test]
    fn test_open_flags_writable() {
        assert!(!OpenFlags::from_bits_retain(libc::O_RDONLY).is_writable());
        assert!(OpenFlags::from_bits_retain(libc::O_WRONLY | libc::O_TRUNC).is_writable());
        assert!(OpenFlags::from_bits_retain(libc::O_RDWR).is_writable());
    }
}
