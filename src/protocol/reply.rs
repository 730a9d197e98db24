use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::time::Duration;

use super::request::split_time;
use super::wire::{WireLayout, WireReader, WireWriter};
use crate::types::*;

pub const OUT_HEADER_LEN: usize = 16;
const DIRENT_HEADER_LEN: usize = 24;
const OPEN_OUT_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitOut {
    pub major: u32,
    pub minor: u32,
    pub max_readahead: u32,
    pub flags: u32,
    pub max_background: u16,
    pub congestion_threshold: u16,
    pub max_write: u32,
    pub time_gran: u32,
    pub max_pages: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryOut {
    pub attr: FileAttribute,
    pub generation: u64,
    pub entry_ttl: Duration,
    pub attr_ttl: Duration,
}

/// Successful outcome of a request, before encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// FORGET and friends never get an answer.
    None,
    Empty,
    Init(InitOut),
    Entry(EntryOut),
    Attr {
        attr: FileAttribute,
        ttl: Duration,
    },
    Open {
        fh: FileHandle,
        flags: u32,
    },
    Create {
        entry: EntryOut,
        fh: FileHandle,
        flags: u32,
    },
    Data(Vec<u8>),
    Written(u32),
    Statfs(StatFs),
    XattrSize(u32),
    Directory(Vec<DirEntry>),
}

/// Space one entry takes in a READDIR reply.
pub fn dirent_size(name_len: usize) -> usize {
    (DIRENT_HEADER_LEN + name_len).div_ceil(8) * 8
}

fn out_header(w: &mut WireWriter, error: i32, unique: u64) {
    w.u32(0).i32(error).u64(unique);
}

fn encode_attr(w: &mut WireWriter, attr: &FileAttribute, layout: WireLayout) {
    let (atime, atime_nsec) = split_time(attr.atime);
    let (mtime, mtime_nsec) = split_time(attr.mtime);
    let (ctime, ctime_nsec) = split_time(attr.ctime);
    w.u64(attr.inode.as_raw())
        .u64(attr.size)
        .u64(attr.blocks)
        .u64(atime)
        .u64(mtime)
        .u64(ctime)
        .u32(atime_nsec)
        .u32(mtime_nsec)
        .u32(ctime_nsec)
        .u32(attr.mode())
        .u32(attr.nlink)
        .u32(attr.uid)
        .u32(attr.gid)
        .u32(0);
    if layout.attr_size() == 88 {
        w.u32(attr.blksize).u32(0);
    }
}

fn encode_entry(w: &mut WireWriter, entry: &EntryOut, layout: WireLayout) {
    w.u64(entry.attr.inode.as_raw())
        .u64(entry.generation)
        .u64(entry.entry_ttl.as_secs())
        .u64(entry.attr_ttl.as_secs())
        .u32(entry.entry_ttl.subsec_nanos())
        .u32(entry.attr_ttl.subsec_nanos());
    encode_attr(w, &entry.attr, layout);
}

fn encode_init(w: &mut WireWriter, init: &InitOut, layout: WireLayout) {
    w.u32(init.major).u32(init.minor);
    if layout.init_out_size() == 8 {
        return;
    }
    w.u32(init.max_readahead)
        .u32(init.flags)
        .u16(init.max_background)
        .u16(init.congestion_threshold)
        .u32(init.max_write);
    if layout.init_out_size() == 64 {
        w.u32(init.time_gran).u16(init.max_pages).u16(0).zeros(32);
    }
}

/// Encodes a successful reply. `None` for requests the kernel expects no answer to.
pub fn encode_reply(unique: u64, reply: &Reply, layout: WireLayout) -> Option<Vec<u8>> {
    let mut w = WireWriter::with_capacity(OUT_HEADER_LEN + layout.entry_out_size());
    out_header(&mut w, 0, unique);
    match reply {
        Reply::None => return None,
        Reply::Empty => {}
        Reply::Init(init) => encode_init(&mut w, init, layout),
        Reply::Entry(entry) => encode_entry(&mut w, entry, layout),
        Reply::Attr { attr, ttl } => {
            w.u64(ttl.as_secs()).u32(ttl.subsec_nanos()).u32(0);
            encode_attr(&mut w, attr, layout);
        }
        Reply::Open { fh, flags } => {
            w.u64(u64::from(*fh)).u32(*flags).u32(0);
        }
        Reply::Create { entry, fh, flags } => {
            encode_entry(&mut w, entry, layout);
            w.u64(u64::from(*fh)).u32(*flags).u32(0);
        }
        Reply::Data(data) => {
            w.bytes(data);
        }
        Reply::Written(size) | Reply::XattrSize(size) => {
            w.u32(*size).u32(0);
        }
        Reply::Statfs(stat) => {
            w.u64(stat.total_blocks)
                .u64(stat.free_blocks)
                .u64(stat.available_blocks)
                .u64(stat.total_files)
                .u64(stat.free_files)
                .u32(stat.block_size)
                .u32(stat.max_filename_length)
                .u32(stat.fragment_size)
                .u32(0)
                .zeros(24);
        }
        Reply::Directory(entries) => {
            for entry in entries {
                let name = entry.name.as_bytes();
                w.u64(entry.inode.as_raw())
                    .u64(entry.offset)
                    .u32(name.len() as u32)
                    .u32(entry.kind.dirent_type())
                    .bytes(name)
                    .align(8);
            }
        }
    }
    Some(w.finish_frame())
}

pub fn encode_error(unique: u64, error: PosixError) -> Vec<u8> {
    let mut w = WireWriter::with_capacity(OUT_HEADER_LEN);
    out_header(&mut w, -error.raw_error(), unique);
    w.finish_frame()
}

/// Attribute block of a reply, as the kernel reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireAttr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub mtime: u64,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireEntry {
    pub nodeid: u64,
    pub generation: u64,
    pub attr: WireAttr,
}

/// A reply frame decoded from the kernel's side of the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFrame {
    pub unique: u64,
    /// Negated errno, zero on success.
    pub error: i32,
    pub payload: Vec<u8>,
}

impl ReplyFrame {
    pub fn parse(frame: &[u8]) -> FsResult<Self> {
        let mut r = WireReader::new(frame);
        let len = r.u32()? as usize;
        let error = r.i32()?;
        let unique = r.u64()?;
        if len != frame.len() {
            return Err(FsError::framing(format!(
                "reply announces {} bytes, frame has {}",
                len,
                frame.len()
            )));
        }
        Ok(ReplyFrame {
            unique,
            error,
            payload: r.rest().to_vec(),
        })
    }

    /// The errno carried by the frame, if it is an error reply.
    pub fn errno(&self) -> Option<i32> {
        (self.error != 0).then_some(-self.error)
    }

    fn attr(r: &mut WireReader<'_>, layout: WireLayout) -> FsResult<WireAttr> {
        let ino = r.u64()?;
        let size = r.u64()?;
        let blocks = r.u64()?;
        r.skip(8)?;
        let mtime = r.u64()?;
        r.skip(8 + 12)?;
        let attr = WireAttr {
            ino,
            size,
            blocks,
            mtime,
            mode: r.u32()?,
            nlink: r.u32()?,
            uid: r.u32()?,
            gid: r.u32()?,
        };
        r.skip(layout.attr_size() - 76)?;
        Ok(attr)
    }

    fn read_entry(r: &mut WireReader<'_>, layout: WireLayout) -> FsResult<WireEntry> {
        let nodeid = r.u64()?;
        let generation = r.u64()?;
        r.skip(24)?;
        Ok(WireEntry {
            nodeid,
            generation,
            attr: Self::attr(r, layout)?,
        })
    }

    pub fn entry(&self, layout: WireLayout) -> FsResult<WireEntry> {
        Self::read_entry(&mut WireReader::new(&self.payload), layout)
    }

    pub fn attr_out(&self, layout: WireLayout) -> FsResult<WireAttr> {
        let mut r = WireReader::new(&self.payload);
        r.skip(16)?;
        Self::attr(&mut r, layout)
    }

    pub fn open(&self) -> FsResult<FileHandle> {
        WireReader::new(&self.payload).u64().map(FileHandle::from)
    }

    pub fn create(&self, layout: WireLayout) -> FsResult<(WireEntry, FileHandle)> {
        let mut r = WireReader::new(&self.payload);
        let entry = Self::read_entry(&mut r, layout)?;
        let fh = r.u64()?;
        r.skip(OPEN_OUT_LEN - 8)?;
        Ok((entry, FileHandle::from(fh)))
    }

    pub fn written(&self) -> FsResult<u32> {
        WireReader::new(&self.payload).u32()
    }

    /// `(major, minor, max_readahead, flags, max_write)` of an INIT reply.
    pub fn init(&self) -> FsResult<(u32, u32, u32, u32, u32)> {
        let mut r = WireReader::new(&self.payload);
        let major = r.u32()?;
        let minor = r.u32()?;
        let max_readahead = r.u32()?;
        let flags = r.u32()?;
        r.skip(4)?;
        Ok((major, minor, max_readahead, flags, r.u32()?))
    }

    pub fn dirents(&self) -> FsResult<Vec<DirEntry>> {
        let mut r = WireReader::new(&self.payload);
        let mut entries = Vec::new();
        while r.remaining() > 0 {
            let inode = InodeNumber::from(r.u64()?);
            let offset = r.u64()?;
            let name_len = r.u32()? as usize;
            let kind = match r.u32()? {
                t if t == InodeKind::Directory.dirent_type() => InodeKind::Directory,
                _ => InodeKind::File,
            };
            let name = OsStr::from_bytes(r.bytes(name_len)?);
            r.skip(dirent_size(name_len) - DIRENT_HEADER_LEN - name_len)?;
            entries.push(DirEntry {
                inode,
                offset,
                kind,
                name: OsString::from(name),
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    const MODERN: WireLayout = WireLayout::for_minor(31);

    fn attr() -> FileAttribute {
        FileAttribute {
            inode: InodeNumber::from(10),
            size: 5,
            blocks: 1,
            atime: SystemTime::now(),
            mtime: UNIX_EPOCH + Duration::from_secs(1000),
            ctime: SystemTime::now(),
            kind: InodeKind::File,
            perm: 0o644,
            nlink: 1,
            uid: 7,
            gid: 8,
            blksize: 4096,
        }
    }

    #[test]
    fn test_entry_sizes_follow_layout() {
        let entry = Reply::Entry(EntryOut {
            attr: attr(),
            generation: 3,
            entry_ttl: Duration::from_secs(1),
            attr_ttl: Duration::from_secs(1),
        });
        for layout in [WireLayout::for_minor(8), MODERN] {
            let frame = encode_reply(4, &entry, layout).unwrap();
            assert_eq!(frame.len(), OUT_HEADER_LEN + layout.entry_out_size());
            let parsed = ReplyFrame::parse(&frame).unwrap();
            assert_eq!(parsed.unique, 4);
            let wire = parsed.entry(layout).unwrap();
            assert_eq!(wire.nodeid, 10);
            assert_eq!(wire.generation, 3);
            assert_eq!(wire.attr.size, 5);
            assert_eq!(wire.attr.mode, libc::S_IFREG as u32 | 0o644);
            assert_eq!(wire.attr.mtime, 1000);
            assert_eq!(wire.attr.uid, 7);
        }
    }

    #[test]
    fn test_error_frame() {
        let frame = encode_error(12, PosixError::STALE_FILE_HANDLE);
        assert_eq!(frame.len(), OUT_HEADER_LEN);
        let parsed = ReplyFrame::parse(&frame).unwrap();
        assert_eq!(parsed.errno(), Some(libc::ESTALE));
        assert_eq!(parsed.unique, 12);
    }

    #[test]
    fn test_forget_has_no_reply() {
        assert_eq!(encode_reply(1, &Reply::None, MODERN), None);
    }

    #[test]
    fn test_dirents_are_padded() {
        assert_eq!(dirent_size(1), 32);
        assert_eq!(dirent_size(8), 32);
        assert_eq!(dirent_size(9), 40);
        let entries = vec![
            DirEntry {
                inode: ROOT_INODE,
                offset: 1,
                kind: InodeKind::Directory,
                name: ".".into(),
            },
            DirEntry {
                inode: InodeNumber::from(2),
                offset: 2,
                kind: InodeKind::File,
                name: "file.txt".into(),
            },
        ];
        let frame = encode_reply(1, &Reply::Directory(entries.clone()), MODERN).unwrap();
        assert_eq!(frame.len(), OUT_HEADER_LEN + dirent_size(1) + dirent_size(8));
        assert_eq!(ReplyFrame::parse(&frame).unwrap().dirents().unwrap(), entries);
    }

    #[test]
    fn test_init_reply_sizes() {
        let init = InitOut {
            major: 7,
            minor: 31,
            max_readahead: 65536,
            flags: 1,
            max_background: 12,
            congestion_threshold: 9,
            max_write: 131072,
            time_gran: 1,
            max_pages: 0,
        };
        for (minor, size) in [(4, 8), (19, 24), (31, 64)] {
            let frame = encode_reply(1, &Reply::Init(init), WireLayout::for_minor(minor)).unwrap();
            assert_eq!(frame.len(), OUT_HEADER_LEN + size);
        }
        let frame = encode_reply(1, &Reply::Init(init), MODERN).unwrap();
        let parsed = ReplyFrame::parse(&frame).unwrap().init().unwrap();
        assert_eq!(parsed, (7, 31, 65536, 1, 131072));
    }

    #[test]
    fn test_statfs_size() {
        let frame = encode_reply(1, &Reply::Statfs(StatFs::default()), MODERN).unwrap();
        assert_eq!(frame.len(), OUT_HEADER_LEN + 80);
    }
}
