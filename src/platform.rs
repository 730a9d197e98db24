//! Attaching a session to the operating system's mount machinery.

use std::any::Any;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;

use crate::session::Session;
use crate::types::*;

#[cfg(all(target_os = "linux", feature = "fuse"))]
mod fuser_backend;
#[cfg(all(target_os = "linux", feature = "fuse"))]
pub use fuser_backend::FuserBackend;

pub trait MountBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Serves `session` at `mountpoint` until the returned handle is unmounted or dropped.
    fn mount(&self, session: Arc<Session>, mountpoint: &Path) -> FsResult<MountHandle>;
}

/// A live mount. Dropping it unmounts as well.
pub struct MountHandle {
    backend: &'static str,
    mountpoint: PathBuf,
    guard: Box<dyn Any + Send>,
}

impl MountHandle {
    pub fn new(backend: &'static str, mountpoint: &Path, guard: Box<dyn Any + Send>) -> Self {
        info!("{} mounted at {}", backend, mountpoint.display());
        MountHandle {
            backend,
            mountpoint: mountpoint.to_path_buf(),
            guard,
        }
    }

    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    pub fn unmount(self) {
        info!("unmounting {} ({})", self.mountpoint.display(), self.backend);
        drop(self.guard);
    }
}

impl fmt::Debug for MountHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountHandle")
            .field("backend", &self.backend)
            .field("mountpoint", &self.mountpoint)
            .finish()
    }
}

/// Stand-in on platforms (or builds) without a kernel integration.
#[derive(Debug, Default)]
pub struct UnsupportedBackend;

impl MountBackend for UnsupportedBackend {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn mount(&self, _session: Arc<Session>, mountpoint: &Path) -> FsResult<MountHandle> {
        Err(FsError::new(
            ErrorKind::NotSupportedOnPlatform,
            format!(
                "cannot mount {} on {}",
                mountpoint.display(),
                std::env::consts::OS
            ),
        ))
    }
}

/// The backend this build can mount with.
pub fn default_backend() -> Box<dyn MountBackend> {
    #[cfg(all(target_os = "linux", feature = "fuse"))]
    {
        Box::new(FuserBackend::default())
    }
    #[cfg(not(all(target_os = "linux", feature = "fuse")))]
    {
        Box::new(UnsupportedBackend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChannelConfig;
    use crate::store::memory::{MemoryBackingStore, MemoryOverlayStore};

    #[test]
    fn test_unsupported_backend_refuses_mount() {
        let backing = Arc::new(MemoryBackingStore::new());
        let root = backing.build_tree::<&str, &str>(&[]);
        let session = Arc::new(Session::new(
            ChannelConfig::default(),
            backing,
            Arc::new(MemoryOverlayStore::new()),
            root,
        ));
        let error = UnsupportedBackend
            .mount(session, Path::new("/mnt/work"))
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotSupportedOnPlatform);
    }
}
