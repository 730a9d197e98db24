use std::ffi::OsStr;
use std::sync::Arc;
use std::time::SystemTime;

use log::{debug, warn};

use super::cancellation::CancellationToken;
use crate::protocol::{dirent_size, ConnectionInfo, EntryOut, KernelRequest, Operation, Reply};
use crate::session::Session;
use crate::types::*;

const BLOCK_SIZE: u32 = 4096;
const DIRECTORY_SIZE: u64 = 4096;

/// Executes decoded requests against a session.
#[derive(Clone)]
pub struct Handlers {
    session: Arc<Session>,
    connection: ConnectionInfo,
}

fn offset_to_usize(offset: u64) -> FsResult<usize> {
    usize::try_from(offset).map_err(|_| FsError::invalid(format!("offset {} out of range", offset)))
}

fn too_large(ino: InodeNumber, size: u64, limit: u64) -> FsError {
    FsError::new(
        ErrorKind::FileTooLarge,
        format!("inode {} would reach {} bytes, limit is {}", ino, size, limit),
    )
}

/// Zero-extends or cuts `data` to `len`; a failed allocation is an error, not an abort.
fn resize(data: &mut Vec<u8>, len: usize) -> FsResult<()> {
    if len > data.len() {
        data.try_reserve_exact(len - data.len()).map_err(|e| {
            FsError::new(
                ErrorKind::FileTooLarge,
                format!("growing to {} bytes: {}", len, e),
            )
        })?;
    }
    data.resize(len, 0);
    Ok(())
}

fn resolve_time(time: TimeOrNow) -> SystemTime {
    match time {
        TimeOrNow::SpecificTime(time) => time,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl Handlers {
    pub fn new(session: Arc<Session>, connection: ConnectionInfo) -> Self {
        Handlers {
            session,
            connection,
        }
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn handle(&self, request: &KernelRequest, token: &CancellationToken) -> FsResult<Reply> {
        let ino = request.target();
        match &request.operation {
            Operation::Lookup { name } => self.lookup(ino, name),
            Operation::Forget { nlookup } => {
                self.forget(ino, *nlookup);
                Ok(Reply::None)
            }
            Operation::BatchForget { items } => {
                for &(ino, nlookup) in items {
                    self.forget(ino, nlookup);
                }
                Ok(Reply::None)
            }
            Operation::Getattr { fh } => self.getattr(ino, *fh),
            Operation::Setattr { attrs } => self.setattr(ino, attrs, token),
            Operation::Mkdir { name, mode, umask } => self.mkdir(ino, name, *mode, *umask, token),
            Operation::Unlink { name } => {
                token.check("UNLINK")?;
                self.session.inodes().unlink(ino, name)?;
                self.session.cleanup();
                Ok(Reply::Empty)
            }
            Operation::Rmdir { name } => {
                token.check("RMDIR")?;
                self.session.inodes().rmdir(ino, name)?;
                self.session.cleanup();
                Ok(Reply::Empty)
            }
            Operation::Rename {
                name,
                new_parent,
                new_name,
                flags,
            } => {
                token.check("RENAME")?;
                self.session
                    .inodes()
                    .rename(ino, name, *new_parent, new_name, *flags)?;
                self.session.cleanup();
                Ok(Reply::Empty)
            }
            Operation::Open { flags } => self.open(ino, *flags, token),
            Operation::Read { fh, offset, size } => self.read(ino, *fh, *offset, *size),
            Operation::Write { fh, offset, data } => self.write(ino, *fh, *offset, data, token),
            Operation::Statfs => Ok(Reply::Statfs(StatFs::default())),
            Operation::Release { fh, .. } => {
                self.session.handles().remove(*fh, ino)?;
                self.session.inodes().release(ino)?;
                self.session.cleanup();
                Ok(Reply::Empty)
            }
            Operation::Flush { fh } => {
                self.session.handles().get(*fh, ino)?;
                Ok(Reply::Empty)
            }
            Operation::Getxattr { name, .. } => {
                self.require_xattr()?;
                Err(FsError::new(
                    ErrorKind::NoAttribute,
                    format!("{:?} on inode {}", name, ino),
                ))
            }
            Operation::Listxattr { size } => {
                self.require_xattr()?;
                Ok(if *size == 0 {
                    Reply::XattrSize(0)
                } else {
                    Reply::Data(Vec::new())
                })
            }
            Operation::Opendir { flags } => self.opendir(ino, *flags),
            Operation::Readdir { fh, offset, size } => self.readdir(ino, *fh, *offset, *size),
            Operation::Releasedir { fh } => {
                let handle = self.session.handles().remove(*fh, ino)?;
                self.session.inodes().unpin(&handle.pinned);
                self.session.inodes().release(ino)?;
                self.session.cleanup();
                Ok(Reply::Empty)
            }
            Operation::Create {
                name,
                flags,
                mode,
                umask,
            } => self.create(ino, name, *flags, *mode, *umask, token),
            Operation::Init { .. } | Operation::Destroy | Operation::Interrupt { .. } => {
                Err(FsError::internal(format!(
                    "{} must be handled by the channel",
                    request.opcode()
                )))
            }
        }
    }

    fn require_xattr(&self) -> FsResult<()> {
        if self.connection.supports(Capabilities::POSIX_ACL) {
            Ok(())
        } else {
            Err(FsError::new(
                ErrorKind::NotImplemented,
                "extended attributes were not negotiated",
            ))
        }
    }

    /// Current content of a file, from the overlay once materialized.
    fn content(&self, ino: InodeNumber) -> FsResult<Arc<Vec<u8>>> {
        let inode = self.session.inodes().resolve(ino)?;
        if inode.kind == InodeKind::Directory {
            return Err(FsError::new(
                ErrorKind::IsADirectory,
                format!("inode {} is a directory", ino),
            ));
        }
        if inode.materialized {
            return Ok(Arc::new(self.session.overlay().read_local(ino)?));
        }
        let blob = inode
            .content
            .ok_or_else(|| FsError::internal(format!("file {} has no content", ino)))?;
        let data = self.session.blobs().fetch(&blob, self.session.backing())?;
        self.session.inodes().set_size(ino, data.len() as u64)?;
        Ok(data)
    }

    fn attributes(&self, ino: InodeNumber) -> FsResult<FileAttribute> {
        let inode = self.session.inodes().resolve(ino)?;
        let size = match (inode.kind, inode.size) {
            (InodeKind::Directory, _) => DIRECTORY_SIZE,
            (InodeKind::File, Some(size)) => size,
            (InodeKind::File, None) => self.content(ino)?.len() as u64,
        };
        let config = self.session.config();
        Ok(FileAttribute {
            inode: ino,
            size,
            blocks: size.div_ceil(512),
            atime: inode.mtime,
            mtime: inode.mtime,
            ctime: inode.mtime,
            kind: inode.kind,
            perm: inode.perm,
            nlink: match inode.kind {
                InodeKind::Directory => 2,
                InodeKind::File => 1,
            },
            uid: config.uid,
            gid: config.gid,
            blksize: BLOCK_SIZE,
        })
    }

    /// An entry reply for an inode the kernel just gained a reference to. The
    /// reference is dropped again if the reply cannot be built.
    fn entry(&self, ino: InodeNumber) -> FsResult<EntryOut> {
        match self.attributes(ino) {
            Ok(attr) => Ok(EntryOut {
                attr,
                generation: self.session.generation(),
                entry_ttl: self.session.config().entry_ttl,
                attr_ttl: self.session.config().attr_ttl,
            }),
            Err(e) => {
                self.forget(ino, 1);
                Err(e)
            }
        }
    }

    /// Drops kernel references; failures are logged since FORGET has no reply.
    pub(crate) fn forget(&self, ino: InodeNumber, nlookup: u64) {
        match self.session.inodes().forget(ino, nlookup) {
            Ok(()) => self.session.cleanup(),
            Err(e) => warn!("forget {:?} - inode {}", e, ino),
        }
    }

    fn lookup(&self, parent: InodeNumber, name: &OsStr) -> FsResult<Reply> {
        let ino = self.session.inodes().lookup(parent, name)?;
        self.entry(ino).map(Reply::Entry)
    }

    fn getattr(&self, ino: InodeNumber, fh: Option<FileHandle>) -> FsResult<Reply> {
        if let Some(fh) = fh {
            self.session.handles().get(fh, ino)?;
        }
        Ok(Reply::Attr {
            attr: self.attributes(ino)?,
            ttl: self.session.config().attr_ttl,
        })
    }

    fn truncate(&self, ino: InodeNumber, size: u64, token: &CancellationToken) -> FsResult<()> {
        let len = self.file_length(ino, size)?;
        let mut data = if len == 0 {
            Vec::new()
        } else {
            self.content(ino)?.as_ref().clone()
        };
        resize(&mut data, len)?;
        token.check("truncate")?;
        self.session.overlay().write_local(ino, &data)?;
        self.session.inodes().mark_materialized(ino, size)
    }

    /// `size` as an in-memory length, if the file may grow that large.
    fn file_length(&self, ino: InodeNumber, size: u64) -> FsResult<usize> {
        let limit = self.session.config().max_file_size;
        if size > limit {
            return Err(too_large(ino, size, limit));
        }
        usize::try_from(size).map_err(|_| too_large(ino, size, usize::MAX as u64))
    }

    fn setattr(
        &self,
        ino: InodeNumber,
        attrs: &SetAttrRequest,
        token: &CancellationToken,
    ) -> FsResult<Reply> {
        let inodes = self.session.inodes();
        if let Some(fh) = attrs.file_handle {
            self.session.handles().get(fh, ino)?;
        }
        if let Some(size) = attrs.size {
            if inodes.resolve(ino)?.kind == InodeKind::Directory {
                return Err(FsError::new(
                    ErrorKind::IsADirectory,
                    format!("cannot truncate directory {}", ino),
                ));
            }
            self.truncate(ino, size, token)?;
        }
        if let Some(mode) = attrs.mode {
            inodes.set_mode(ino, (mode & 0o7777) as u16)?;
        }
        if let Some(mtime) = attrs.mtime {
            inodes.set_mtime(ino, resolve_time(mtime))?;
        }
        if attrs.uid.is_some() || attrs.gid.is_some() {
            debug!("ignoring ownership change on inode {}", ino);
        }
        Ok(Reply::Attr {
            attr: self.attributes(ino)?,
            ttl: self.session.config().attr_ttl,
        })
    }

    fn mkdir(
        &self,
        parent: InodeNumber,
        name: &OsStr,
        mode: u32,
        umask: u32,
        token: &CancellationToken,
    ) -> FsResult<Reply> {
        token.check("MKDIR")?;
        let inodes = self.session.inodes();
        let ino = inodes.allocate(InodeKind::Directory, parent, name)?;
        inodes.set_mode(ino, (mode & !umask & 0o7777) as u16)?;
        self.entry(ino).map(Reply::Entry)
    }

    fn open(&self, ino: InodeNumber, flags: OpenFlags, token: &CancellationToken) -> FsResult<Reply> {
        let inode = self.session.inodes().resolve(ino)?;
        if inode.kind == InodeKind::Directory {
            return Err(FsError::new(
                ErrorKind::IsADirectory,
                format!("OPEN on directory {}", ino),
            ));
        }
        if flags.contains(OpenFlags::TRUNCATE) && flags.is_writable() {
            self.truncate(ino, 0, token)?;
        }
        self.session.inodes().open(ino)?;
        let fh = self.session.handles().insert(ino, InodeKind::File, flags);
        Ok(Reply::Open { fh, flags: 0 })
    }

    fn read(&self, ino: InodeNumber, fh: FileHandle, offset: u64, size: u32) -> FsResult<Reply> {
        self.session.handles().get(fh, ino)?;
        let data = self.content(ino)?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
        let end = start.saturating_add(size as usize).min(data.len());
        Ok(Reply::Data(data[start..end].to_vec()))
    }

    fn write(
        &self,
        ino: InodeNumber,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
        token: &CancellationToken,
    ) -> FsResult<Reply> {
        let handle = self.session.handles().get(fh, ino)?;
        if !handle.flags.is_writable() {
            return Err(FsError::new(
                ErrorKind::BadFileHandle,
                format!("handle {} is not open for writing", u64::from(fh)),
            ));
        }
        if data.len() > self.connection.max_write as usize {
            return Err(FsError::invalid(format!(
                "write of {} bytes exceeds max_write {}",
                data.len(),
                self.connection.max_write
            )));
        }

        let mut content = self.content(ino)?.as_ref().clone();
        let start = if handle.flags.contains(OpenFlags::APPEND_MODE) {
            content.len() as u64
        } else {
            offset
        };
        let end = start
            .checked_add(data.len() as u64)
            .ok_or_else(|| too_large(ino, u64::MAX, self.session.config().max_file_size))?;
        let end = self.file_length(ino, end)?;
        let start = end - data.len();
        if content.len() < end {
            resize(&mut content, end)?;
        }
        content[start..end].copy_from_slice(data);

        token.check("WRITE")?;
        self.session.overlay().write_local(ino, &content)?;
        self.session
            .inodes()
            .mark_materialized(ino, content.len() as u64)?;
        Ok(Reply::Written(data.len() as u32))
    }

    fn opendir(&self, ino: InodeNumber, flags: OpenFlags) -> FsResult<Reply> {
        let inode = self.session.inodes().resolve(ino)?;
        if inode.kind != InodeKind::Directory {
            return Err(FsError::new(
                ErrorKind::NotADirectory,
                format!("OPENDIR on file {}", ino),
            ));
        }
        self.session.inodes().open(ino)?;
        let fh = self.session.handles().insert(ino, InodeKind::Directory, flags);
        Ok(Reply::Open { fh, flags: 0 })
    }

    /// Offsets are cookies: `.` is entry 0, `..` entry 1, then the listing in
    /// name order. Each returned entry carries the cookie of the one after it.
    fn readdir(&self, ino: InodeNumber, fh: FileHandle, offset: u64, size: u32) -> FsResult<Reply> {
        let handle = self.session.handles().get(fh, ino)?;
        if handle.kind != InodeKind::Directory {
            return Err(FsError::new(
                ErrorKind::NotADirectory,
                format!("READDIR with file handle {}", u64::from(fh)),
            ));
        }
        let inodes = self.session.inodes();
        let budget = size as usize;
        let mut used = 0;
        let mut entries = Vec::new();

        let parent = inodes.resolve(ino)?.parent.unwrap_or(ino);
        for (cookie, name, target) in [(0, ".", ino), (1, "..", parent)] {
            if offset > cookie {
                continue;
            }
            let need = dirent_size(name.len());
            if used + need > budget {
                return Ok(Reply::Directory(entries));
            }
            used += need;
            entries.push(DirEntry {
                inode: target,
                offset: cookie + 1,
                kind: InodeKind::Directory,
                name: name.into(),
            });
        }

        let skip = offset_to_usize(offset.saturating_sub(2))?;
        let listed = inodes.list(ino, skip, |name| {
            let need = dirent_size(name.len());
            if used + need > budget {
                return false;
            }
            used += need;
            true
        })?;

        let pins: Vec<InodeNumber> = listed.iter().map(|entry| entry.inode).collect();
        match self.session.handles().add_pins(fh, &pins) {
            Ok(repeated) => inodes.unpin(&repeated),
            Err(e) => {
                inodes.unpin(&pins);
                return Err(e);
            }
        }
        entries.extend(listed.into_iter().enumerate().map(|(i, entry)| DirEntry {
            inode: entry.inode,
            offset: (skip + i) as u64 + 3,
            kind: entry.kind,
            name: entry.name,
        }));
        Ok(Reply::Directory(entries))
    }

    fn create(
        &self,
        parent: InodeNumber,
        name: &OsStr,
        flags: OpenFlags,
        mode: u32,
        umask: u32,
        token: &CancellationToken,
    ) -> FsResult<Reply> {
        token.check("CREATE")?;
        let inodes = self.session.inodes();
        let ino = inodes.allocate(InodeKind::File, parent, name)?;
        if let Err(e) = self.session.overlay().write_local(ino, &[]) {
            // nothing was handed to the kernel yet; undo the allocation
            let _ = inodes.unlink(parent, name);
            self.forget(ino, 1);
            return Err(e.into());
        }
        inodes.set_mode(ino, (mode & !umask & 0o7777) as u16)?;
        let entry = self.entry(ino)?;
        inodes.open(ino)?;
        let fh = self.session.handles().insert(ino, InodeKind::File, flags);
        Ok(Reply::Create { entry, fh, flags: 0 })
    }
}
