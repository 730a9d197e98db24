use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use fuser::{
    self, FileAttr, FileType, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request,
};
use libc::c_int;
use log::{debug, warn};

use super::{MountBackend, MountHandle};
use crate::channel::{translate, Dispatcher};
use crate::protocol::{ConnectionInfo, KernelRequest, Operation, ProtocolNegotiator, Reply};
use crate::session::Session;
use crate::types::*;

/// Protocol level `fuser` speaks when built without its ABI features.
const FUSER_MINOR: u32 = 8;

/// Mounts through the `fuser` crate, which owns the device and the INIT
/// exchange; requests are fed into the same dispatcher as the raw channel.
#[derive(Debug, Default)]
pub struct FuserBackend {
    options: Vec<MountOption>,
}

impl FuserBackend {
    pub fn with_options(options: Vec<MountOption>) -> Self {
        FuserBackend { options }
    }
}

impl MountBackend for FuserBackend {
    fn name(&self) -> &'static str {
        "fuser"
    }

    fn mount(&self, session: Arc<Session>, mountpoint: &Path) -> FsResult<MountHandle> {
        let config = session.config().clone();
        let connection = ProtocolNegotiator::new(&config).negotiate(
            7,
            FUSER_MINOR,
            config.capabilities,
        )?;
        let adapter = FuserAdapter {
            dispatcher: Dispatcher::new(session, connection),
            connection,
        };
        let mut options = vec![MountOption::FSName("lazy_fuser".to_string())];
        options.extend(self.options.iter().cloned());
        let background = fuser::spawn_mount2(adapter, mountpoint, &options)?;
        Ok(MountHandle::new(self.name(), mountpoint, Box::new(background)))
    }
}

struct FuserAdapter {
    dispatcher: Dispatcher,
    connection: ConnectionInfo,
}

fn file_type(kind: InodeKind) -> FileType {
    match kind {
        InodeKind::File => FileType::RegularFile,
        InodeKind::Directory => FileType::Directory,
    }
}

fn file_attr(attr: &FileAttribute) -> FileAttr {
    FileAttr {
        ino: attr.inode.as_raw(),
        size: attr.size,
        blocks: attr.blocks,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        crtime: attr.ctime,
        kind: file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: attr.uid,
        gid: attr.gid,
        rdev: 0,
        blksize: attr.blksize,
        flags: 0,
    }
}

fn time_or_now(time: fuser::TimeOrNow) -> TimeOrNow {
    match time {
        fuser::TimeOrNow::SpecificTime(time) => TimeOrNow::SpecificTime(time),
        fuser::TimeOrNow::Now => TimeOrNow::Now,
    }
}

fn errno(error: &FsError) -> c_int {
    translate(error).raw_error()
}

/// Any reply shape other than the expected one is a dispatcher bug.
fn unexpected(reply: &Reply) -> c_int {
    warn!("unexpected reply {:?}", reply);
    libc::EIO
}

impl FuserAdapter {
    fn submit<F>(&self, req: &Request, ino: u64, operation: Operation, respond: F)
    where
        F: FnOnce(FsResult<Reply>) + Send + 'static,
    {
        let mut request = KernelRequest::new(req.unique(), InodeNumber::from(ino), operation);
        request.header.uid = req.uid();
        request.header.gid = req.gid();
        request.header.pid = req.pid();
        self.dispatcher.submit(request, Box::new(respond));
    }
}

fn reply_entry(reply: ReplyEntry) -> impl FnOnce(FsResult<Reply>) + Send + 'static {
    move |result| match result {
        Ok(Reply::Entry(entry)) => {
            reply.entry(&entry.entry_ttl, &file_attr(&entry.attr), entry.generation)
        }
        Ok(other) => reply.error(unexpected(&other)),
        Err(e) => reply.error(errno(&e)),
    }
}

fn reply_attr(reply: ReplyAttr) -> impl FnOnce(FsResult<Reply>) + Send + 'static {
    move |result| match result {
        Ok(Reply::Attr { attr, ttl }) => reply.attr(&ttl, &file_attr(&attr)),
        Ok(other) => reply.error(unexpected(&other)),
        Err(e) => reply.error(errno(&e)),
    }
}

fn reply_empty(reply: ReplyEmpty) -> impl FnOnce(FsResult<Reply>) + Send + 'static {
    move |result| match result {
        Ok(Reply::Empty) => reply.ok(),
        Ok(other) => reply.error(unexpected(&other)),
        Err(e) => reply.error(errno(&e)),
    }
}

fn reply_open(reply: ReplyOpen) -> impl FnOnce(FsResult<Reply>) + Send + 'static {
    move |result| match result {
        Ok(Reply::Open { fh, flags }) => reply.opened(fh.into(), flags),
        Ok(other) => reply.error(unexpected(&other)),
        Err(e) => reply.error(errno(&e)),
    }
}

fn reply_xattr(reply: ReplyXattr) -> impl FnOnce(FsResult<Reply>) + Send + 'static {
    move |result| match result {
        Ok(Reply::XattrSize(size)) => reply.size(size),
        Ok(Reply::Data(data)) => reply.data(&data),
        Ok(other) => reply.error(unexpected(&other)),
        Err(e) => reply.error(errno(&e)),
    }
}

impl fuser::Filesystem for FuserAdapter {
    fn init(&mut self, _req: &Request, config: &mut KernelConfig) -> Result<(), c_int> {
        if let Err(nearest) = config.set_max_write(self.connection.max_write) {
            debug!("kernel limits max_write to {}", nearest);
        }
        if let Err(nearest) = config.set_max_readahead(self.connection.max_readahead) {
            debug!("kernel limits max_readahead to {}", nearest);
        }
        Ok(())
    }

    fn destroy(&mut self) {
        self.dispatcher.wait_idle();
    }

    fn lookup(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let operation = Operation::Lookup {
            name: name.to_os_string(),
        };
        self.submit(req, parent, operation, reply_entry(reply));
    }

    fn forget(&mut self, req: &Request, ino: u64, nlookup: u64) {
        self.submit(req, ino, Operation::Forget { nlookup }, |_| {});
    }

    fn getattr(&mut self, req: &Request, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let operation = Operation::Getattr {
            fh: fh.map(FileHandle::from),
        };
        self.submit(req, ino, operation, reply_attr(reply));
    }

    fn setattr(
        &mut self,
        req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<fuser::TimeOrNow>,
        mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let attrs = SetAttrRequest {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(time_or_now),
            mtime: mtime.map(time_or_now),
            file_handle: fh.map(FileHandle::from),
        };
        self.submit(req, ino, Operation::Setattr { attrs }, reply_attr(reply));
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let operation = Operation::Mkdir {
            name: name.to_os_string(),
            mode,
            umask,
        };
        self.submit(req, parent, operation, reply_entry(reply));
    }

    fn unlink(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let operation = Operation::Unlink {
            name: name.to_os_string(),
        };
        self.submit(req, parent, operation, reply_empty(reply));
    }

    fn rmdir(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let operation = Operation::Rmdir {
            name: name.to_os_string(),
        };
        self.submit(req, parent, operation, reply_empty(reply));
    }

    fn rename(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let operation = Operation::Rename {
            name: name.to_os_string(),
            new_parent: InodeNumber::from(newparent),
            new_name: newname.to_os_string(),
            flags: RenameFlags::from_bits_retain(flags),
        };
        self.submit(req, parent, operation, reply_empty(reply));
    }

    fn open(&mut self, req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let operation = Operation::Open {
            flags: OpenFlags::from_bits_retain(flags),
        };
        self.submit(req, ino, operation, reply_open(reply));
    }

    fn read(
        &mut self,
        req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let operation = Operation::Read {
            fh: FileHandle::from(fh),
            offset,
            size,
        };
        self.submit(req, ino, operation, move |result| match result {
            Ok(Reply::Data(data)) => reply.data(&data),
            Ok(other) => reply.error(unexpected(&other)),
            Err(e) => reply.error(errno(&e)),
        });
    }

    fn write(
        &mut self,
        req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        let operation = Operation::Write {
            fh: FileHandle::from(fh),
            offset,
            data: data.to_vec(),
        };
        self.submit(req, ino, operation, move |result| match result {
            Ok(Reply::Written(size)) => reply.written(size),
            Ok(other) => reply.error(unexpected(&other)),
            Err(e) => reply.error(errno(&e)),
        });
    }

    fn flush(&mut self, req: &Request, ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let operation = Operation::Flush {
            fh: FileHandle::from(fh),
        };
        self.submit(req, ino, operation, reply_empty(reply));
    }

    fn release(
        &mut self,
        req: &Request,
        ino: u64,
        fh: u64,
        flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let operation = Operation::Release {
            fh: FileHandle::from(fh),
            flags: OpenFlags::from_bits_retain(flags),
        };
        self.submit(req, ino, operation, reply_empty(reply));
    }

    fn opendir(&mut self, req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        let operation = Operation::Opendir {
            flags: OpenFlags::from_bits_retain(flags),
        };
        self.submit(req, ino, operation, reply_open(reply));
    }

    fn readdir(
        &mut self,
        req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Ok(offset) = u64::try_from(offset) else {
            reply.error(libc::EINVAL);
            return;
        };
        // fuser sizes the buffer itself; ask for a page and let `add` report overflow
        let operation = Operation::Readdir {
            fh: FileHandle::from(fh),
            offset,
            size: 4096,
        };
        self.submit(req, ino, operation, move |result| match result {
            Ok(Reply::Directory(entries)) => {
                for entry in entries {
                    if reply.add(
                        entry.inode.as_raw(),
                        entry.offset as i64,
                        file_type(entry.kind),
                        &entry.name,
                    ) {
                        break;
                    }
                }
                reply.ok();
            }
            Ok(other) => reply.error(unexpected(&other)),
            Err(e) => reply.error(errno(&e)),
        });
    }

    fn releasedir(&mut self, req: &Request, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        let operation = Operation::Releasedir {
            fh: FileHandle::from(fh),
        };
        self.submit(req, ino, operation, reply_empty(reply));
    }

    fn statfs(&mut self, req: &Request, ino: u64, reply: ReplyStatfs) {
        self.submit(req, ino, Operation::Statfs, move |result| match result {
            Ok(Reply::Statfs(stat)) => reply.statfs(
                stat.total_blocks,
                stat.free_blocks,
                stat.available_blocks,
                stat.total_files,
                stat.free_files,
                stat.block_size,
                stat.max_filename_length,
                stat.fragment_size,
            ),
            Ok(other) => reply.error(unexpected(&other)),
            Err(e) => reply.error(errno(&e)),
        });
    }

    fn getxattr(&mut self, req: &Request, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let operation = Operation::Getxattr {
            name: name.to_os_string(),
            size,
        };
        self.submit(req, ino, operation, reply_xattr(reply));
    }

    fn listxattr(&mut self, req: &Request, ino: u64, size: u32, reply: ReplyXattr) {
        self.submit(req, ino, Operation::Listxattr { size }, reply_xattr(reply));
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let operation = Operation::Create {
            name: name.to_os_string(),
            flags: OpenFlags::from_bits_retain(flags),
            mode,
            umask,
        };
        self.submit(req, parent, operation, move |result| match result {
            Ok(Reply::Create { entry, fh, flags }) => reply.created(
                &entry.entry_ttl,
                &file_attr(&entry.attr),
                entry.generation,
                fh.into(),
                flags,
            ),
            Ok(other) => reply.error(unexpected(&other)),
            Err(e) => reply.error(errno(&e)),
        });
    }
}
