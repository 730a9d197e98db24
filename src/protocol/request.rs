use std::ffi::OsString;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use super::opcode::Opcode;
use super::wire::{WireLayout, WireReader, WireWriter};
use crate::types::*;

pub const IN_HEADER_LEN: usize = 40;

const GETATTR_FH: u32 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InHeader {
    pub len: u32,
    pub opcode: u32,
    pub unique: u64,
    pub nodeid: u64,
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
}

impl InHeader {
    pub fn decode(frame: &[u8]) -> FsResult<Self> {
        let mut reader = WireReader::new(frame);
        let header = InHeader {
            len: reader.u32()?,
            opcode: reader.u32()?,
            unique: reader.u64()?,
            nodeid: reader.u64()?,
            uid: reader.u32()?,
            gid: reader.u32()?,
            pid: reader.u32()?,
        };
        reader.skip(4)?;
        Ok(header)
    }

    fn encode(&self, writer: &mut WireWriter) {
        writer
            .u32(self.len)
            .u32(self.opcode)
            .u64(self.unique)
            .u64(self.nodeid)
            .u32(self.uid)
            .u32(self.gid)
            .u32(self.pid)
            .u32(0);
    }

    pub fn info(&self) -> RequestInfo {
        RequestInfo {
            unique: self.unique,
            uid: self.uid,
            gid: self.gid,
            pid: self.pid,
        }
    }
}

/// Decoded payload of a request.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Init {
        major: u32,
        minor: u32,
        max_readahead: u32,
        flags: u32,
    },
    Destroy,
    Interrupt {
        unique: u64,
    },
    Lookup {
        name: OsString,
    },
    Forget {
        nlookup: u64,
    },
    BatchForget {
        items: Vec<(InodeNumber, u64)>,
    },
    Getattr {
        fh: Option<FileHandle>,
    },
    Setattr {
        attrs: SetAttrRequest,
    },
    Mkdir {
        name: OsString,
        mode: u32,
        umask: u32,
    },
    Unlink {
        name: OsString,
    },
    Rmdir {
        name: OsString,
    },
    Rename {
        name: OsString,
        new_parent: InodeNumber,
        new_name: OsString,
        flags: RenameFlags,
    },
    Open {
        flags: OpenFlags,
    },
    Read {
        fh: FileHandle,
        offset: u64,
        size: u32,
    },
    Write {
        fh: FileHandle,
        offset: u64,
        data: Vec<u8>,
    },
    Statfs,
    Release {
        fh: FileHandle,
        flags: OpenFlags,
    },
    Flush {
        fh: FileHandle,
    },
    Getxattr {
        name: OsString,
        size: u32,
    },
    Listxattr {
        size: u32,
    },
    Opendir {
        flags: OpenFlags,
    },
    Readdir {
        fh: FileHandle,
        offset: u64,
        size: u32,
    },
    Releasedir {
        fh: FileHandle,
    },
    Create {
        name: OsString,
        flags: OpenFlags,
        mode: u32,
        umask: u32,
    },
}

impl Operation {
    pub fn opcode(&self) -> Opcode {
        match self {
            Operation::Init { .. } => Opcode::Init,
            Operation::Destroy => Opcode::Destroy,
            Operation::Interrupt { .. } => Opcode::Interrupt,
            Operation::Lookup { .. } => Opcode::Lookup,
            Operation::Forget { .. } => Opcode::Forget,
            Operation::BatchForget { .. } => Opcode::BatchForget,
            Operation::Getattr { .. } => Opcode::Getattr,
            Operation::Setattr { .. } => Opcode::Setattr,
            Operation::Mkdir { .. } => Opcode::Mkdir,
            Operation::Unlink { .. } => Opcode::Unlink,
            Operation::Rmdir { .. } => Opcode::Rmdir,
            Operation::Rename { flags, .. } if flags.is_empty() => Opcode::Rename,
            Operation::Rename { .. } => Opcode::Rename2,
            Operation::Open { .. } => Opcode::Open,
            Operation::Read { .. } => Opcode::Read,
            Operation::Write { .. } => Opcode::Write,
            Operation::Statfs => Opcode::Statfs,
            Operation::Release { .. } => Opcode::Release,
            Operation::Flush { .. } => Opcode::Flush,
            Operation::Getxattr { .. } => Opcode::Getxattr,
            Operation::Listxattr { .. } => Opcode::Listxattr,
            Operation::Opendir { .. } => Opcode::Opendir,
            Operation::Readdir { .. } => Opcode::Readdir,
            Operation::Releasedir { .. } => Opcode::Releasedir,
            Operation::Create { .. } => Opcode::Create,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KernelRequest {
    pub header: InHeader,
    pub operation: Operation,
}

/// Why a frame could not be turned into a [`KernelRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Not even the header is readable; nothing can be replied to.
    Header(FsError),
    /// The header is valid, so the kernel can be told about the failure.
    Payload { header: InHeader, error: FsError },
}

impl KernelRequest {
    /// A request as the kernel would issue it, with zeroed credentials.
    pub fn new(unique: u64, nodeid: InodeNumber, operation: Operation) -> Self {
        KernelRequest {
            header: InHeader {
                len: 0,
                opcode: operation.opcode() as u32,
                unique,
                nodeid: nodeid.as_raw(),
                uid: 0,
                gid: 0,
                pid: 0,
            },
            operation,
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.operation.opcode()
    }

    pub fn unique(&self) -> u64 {
        self.header.unique
    }

    pub fn target(&self) -> InodeNumber {
        InodeNumber::from(self.header.nodeid)
    }

    pub fn info(&self) -> RequestInfo {
        self.header.info()
    }

    /// Serializes the request the way the kernel writes it to the device.
    pub fn encode(&self, layout: WireLayout) -> Vec<u8> {
        let mut w = WireWriter::with_capacity(IN_HEADER_LEN + 64);
        self.header.encode(&mut w);
        match &self.operation {
            Operation::Init {
                major,
                minor,
                max_readahead,
                flags,
            } => {
                w.u32(*major).u32(*minor).u32(*max_readahead).u32(*flags);
            }
            Operation::Destroy | Operation::Statfs => {}
            Operation::Interrupt { unique } => {
                w.u64(*unique);
            }
            Operation::Lookup { name } | Operation::Unlink { name } | Operation::Rmdir { name } => {
                w.name(name);
            }
            Operation::Forget { nlookup } => {
                w.u64(*nlookup);
            }
            Operation::BatchForget { items } => {
                w.u32(items.len() as u32).u32(0);
                for (ino, nlookup) in items {
                    w.u64(ino.as_raw()).u64(*nlookup);
                }
            }
            Operation::Getattr { fh } => {
                if layout.getattr_in_size() > 0 {
                    let flags = if fh.is_some() { GETATTR_FH } else { 0 };
                    w.u32(flags).u32(0).u64(fh.map(u64::from).unwrap_or(0));
                }
            }
            Operation::Setattr { attrs } => encode_setattr(&mut w, attrs),
            Operation::Mkdir { name, mode, umask } => {
                w.u32(*mode).u32(*umask).name(name);
            }
            Operation::Rename {
                name,
                new_parent,
                new_name,
                flags,
            } => {
                w.u64(new_parent.as_raw());
                if !flags.is_empty() {
                    w.u32(flags.bits()).u32(0);
                }
                w.name(name).name(new_name);
            }
            Operation::Open { flags } | Operation::Opendir { flags } => {
                w.u32(flags.bits() as u32).u32(0);
            }
            Operation::Read { fh, offset, size } | Operation::Readdir { fh, offset, size } => {
                w.u64(u64::from(*fh)).u64(*offset).u32(*size).u32(0);
                w.zeros(layout.read_in_size() - 24);
            }
            Operation::Write { fh, offset, data } => {
                w.u64(u64::from(*fh))
                    .u64(*offset)
                    .u32(data.len() as u32)
                    .u32(0);
                w.zeros(layout.read_in_size() - 24).bytes(data);
            }
            Operation::Release { fh, flags } => {
                w.u64(u64::from(*fh)).u32(flags.bits() as u32).u32(0);
                w.zeros(layout.release_in_size() - 16);
            }
            Operation::Releasedir { fh } => {
                w.u64(u64::from(*fh)).u32(0).u32(0);
                w.zeros(layout.release_in_size() - 16);
            }
            Operation::Flush { fh } => {
                w.u64(u64::from(*fh)).u32(0).u32(0).u64(0);
            }
            Operation::Getxattr { name, size } => {
                w.u32(*size).u32(0).name(name);
            }
            Operation::Listxattr { size } => {
                w.u32(*size).u32(0);
            }
            Operation::Create {
                name,
                flags,
                mode,
                umask,
            } => {
                w.u32(flags.bits() as u32).u32(*mode);
                if layout.create_in_size() == 16 {
                    w.u32(*umask).u32(0);
                }
                w.name(name);
            }
        }
        w.finish_frame()
    }
}

fn encode_setattr(w: &mut WireWriter, attrs: &SetAttrRequest) {
    let mut valid = SetattrValid::empty();
    let mut time = |t: Option<TimeOrNow>, set: SetattrValid, now: SetattrValid| match t {
        Some(TimeOrNow::Now) => {
            valid |= set | now;
            (0, 0)
        }
        Some(TimeOrNow::SpecificTime(t)) => {
            valid |= set;
            let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
            (since.as_secs(), since.subsec_nanos())
        }
        None => (0, 0),
    };
    let atime = time(attrs.atime, SetattrValid::ATIME, SetattrValid::ATIME_NOW);
    let mtime = time(attrs.mtime, SetattrValid::MTIME, SetattrValid::MTIME_NOW);
    for (present, flag) in [
        (attrs.mode.is_some(), SetattrValid::MODE),
        (attrs.uid.is_some(), SetattrValid::UID),
        (attrs.gid.is_some(), SetattrValid::GID),
        (attrs.size.is_some(), SetattrValid::SIZE),
        (attrs.file_handle.is_some(), SetattrValid::FH),
    ] {
        if present {
            valid |= flag;
        }
    }
    w.u32(valid.bits())
        .u32(0)
        .u64(attrs.file_handle.map(u64::from).unwrap_or(0))
        .u64(attrs.size.unwrap_or(0))
        .u64(0)
        .u64(atime.0)
        .u64(mtime.0)
        .u64(0)
        .u32(atime.1)
        .u32(mtime.1)
        .u32(0)
        .u32(attrs.mode.unwrap_or(0))
        .u32(0)
        .u32(attrs.uid.unwrap_or(0))
        .u32(attrs.gid.unwrap_or(0))
        .u32(0);
}

fn decode_setattr(r: &mut WireReader<'_>) -> FsResult<SetAttrRequest> {
    let valid = SetattrValid::from_bits_retain(r.u32()?);
    r.skip(4)?;
    let fh = r.u64()?;
    let size = r.u64()?;
    r.skip(8)?; // lock_owner
    let atime = r.u64()?;
    let mtime = r.u64()?;
    r.skip(8)?; // ctime
    let atime_nsec = r.u32()?;
    let mtime_nsec = r.u32()?;
    r.skip(4)?;
    let mode = r.u32()?;
    r.skip(4)?;
    let uid = r.u32()?;
    let gid = r.u32()?;
    r.skip(4)?;

    let time = |secs: u64, nsec: u32, set: SetattrValid, now: SetattrValid| {
        if valid.contains(now) {
            Some(TimeOrNow::Now)
        } else if valid.contains(set) {
            Some(TimeOrNow::SpecificTime(
                UNIX_EPOCH + Duration::new(secs, nsec.min(999_999_999)),
            ))
        } else {
            None
        }
    };
    Ok(SetAttrRequest {
        mode: valid.contains(SetattrValid::MODE).then_some(mode),
        uid: valid.contains(SetattrValid::UID).then_some(uid),
        gid: valid.contains(SetattrValid::GID).then_some(gid),
        size: valid.contains(SetattrValid::SIZE).then_some(size),
        atime: time(atime, atime_nsec, SetattrValid::ATIME, SetattrValid::ATIME_NOW),
        mtime: time(mtime, mtime_nsec, SetattrValid::MTIME, SetattrValid::MTIME_NOW),
        file_handle: valid
            .contains(SetattrValid::FH)
            .then_some(FileHandle::from(fh)),
    })
}

fn open_flags(raw: u32) -> OpenFlags {
    OpenFlags::from_bits_retain(raw as i32)
}

fn decode_operation(
    opcode: Opcode,
    r: &mut WireReader<'_>,
    layout: WireLayout,
) -> FsResult<Operation> {
    let name = |r: &mut WireReader<'_>| r.name().map(|n| n.to_os_string());
    let operation = match opcode {
        Opcode::Init => {
            let major = r.u32()?;
            let minor = r.u32()?;
            let (max_readahead, flags) = if r.remaining() >= 8 {
                (r.u32()?, r.u32()?)
            } else {
                (0, 0)
            };
            Operation::Init {
                major,
                minor,
                max_readahead,
                flags,
            }
        }
        Opcode::Destroy => Operation::Destroy,
        Opcode::Statfs => Operation::Statfs,
        Opcode::Interrupt => Operation::Interrupt { unique: r.u64()? },
        Opcode::Lookup => Operation::Lookup { name: name(r)? },
        Opcode::Unlink => Operation::Unlink { name: name(r)? },
        Opcode::Rmdir => Operation::Rmdir { name: name(r)? },
        Opcode::Forget => Operation::Forget { nlookup: r.u64()? },
        Opcode::BatchForget => {
            let count = r.u32()? as usize;
            r.skip(4)?;
            if r.remaining() < count.saturating_mul(16) {
                return Err(FsError::framing(format!(
                    "batch forget of {} entries in {} bytes",
                    count,
                    r.remaining()
                )));
            }
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push((InodeNumber::from(r.u64()?), r.u64()?));
            }
            Operation::BatchForget { items }
        }
        Opcode::Getattr => {
            let fh = if layout.getattr_in_size() > 0 {
                let flags = r.u32()?;
                r.skip(4)?;
                let fh = r.u64()?;
                (flags & GETATTR_FH != 0).then_some(FileHandle::from(fh))
            } else {
                None
            };
            Operation::Getattr { fh }
        }
        Opcode::Setattr => Operation::Setattr {
            attrs: decode_setattr(r)?,
        },
        Opcode::Mkdir => {
            let mode = r.u32()?;
            let umask = r.u32()?;
            Operation::Mkdir {
                name: name(r)?,
                mode,
                umask: if layout.minor() >= 12 { umask } else { 0 },
            }
        }
        Opcode::Rename | Opcode::Rename2 => {
            let new_parent = InodeNumber::from(r.u64()?);
            let flags = if opcode == Opcode::Rename2 {
                let flags = r.u32()?;
                r.skip(4)?;
                RenameFlags::from_bits_retain(flags)
            } else {
                RenameFlags::empty()
            };
            Operation::Rename {
                name: name(r)?,
                new_parent,
                new_name: name(r)?,
                flags,
            }
        }
        Opcode::Open | Opcode::Opendir => {
            let flags = open_flags(r.u32()?);
            r.skip(4)?;
            if opcode == Opcode::Open {
                Operation::Open { flags }
            } else {
                Operation::Opendir { flags }
            }
        }
        Opcode::Read | Opcode::Readdir => {
            let fh = FileHandle::from(r.u64()?);
            let offset = r.u64()?;
            let size = r.u32()?;
            r.skip(layout.read_in_size() - 20)?;
            if opcode == Opcode::Read {
                Operation::Read { fh, offset, size }
            } else {
                Operation::Readdir { fh, offset, size }
            }
        }
        Opcode::Write => {
            let fh = FileHandle::from(r.u64()?);
            let offset = r.u64()?;
            let size = r.u32()? as usize;
            r.skip(layout.read_in_size() - 20)?;
            Operation::Write {
                fh,
                offset,
                data: r.bytes(size)?.to_vec(),
            }
        }
        Opcode::Release | Opcode::Releasedir => {
            let fh = FileHandle::from(r.u64()?);
            let flags = open_flags(r.u32()?);
            r.skip(layout.release_in_size() - 12)?;
            if opcode == Opcode::Release {
                Operation::Release { fh, flags }
            } else {
                Operation::Releasedir { fh }
            }
        }
        Opcode::Flush => {
            let fh = FileHandle::from(r.u64()?);
            r.skip(16)?;
            Operation::Flush { fh }
        }
        Opcode::Getxattr => {
            let size = r.u32()?;
            r.skip(4)?;
            Operation::Getxattr {
                name: name(r)?,
                size,
            }
        }
        Opcode::Listxattr => {
            let size = r.u32()?;
            r.skip(4)?;
            Operation::Listxattr { size }
        }
        Opcode::Create => {
            let flags = open_flags(r.u32()?);
            let mode = r.u32()?;
            let umask = if layout.create_in_size() == 16 {
                let umask = r.u32()?;
                r.skip(4)?;
                umask
            } else {
                0
            };
            Operation::Create {
                name: name(r)?,
                flags,
                mode,
                umask,
            }
        }
    };
    Ok(operation)
}

/// Decodes one frame read from the kernel.
pub fn decode(frame: &[u8], layout: WireLayout) -> Result<KernelRequest, DecodeError> {
    let header = InHeader::decode(frame).map_err(DecodeError::Header)?;
    let payload_error = |error| DecodeError::Payload { header, error };

    if header.len as usize != frame.len() {
        return Err(payload_error(FsError::framing(format!(
            "header announces {} bytes, frame has {}",
            header.len,
            frame.len()
        ))));
    }
    let opcode = Opcode::try_from(header.opcode).map_err(|code| {
        payload_error(FsError::new(
            ErrorKind::NotImplemented,
            format!("opcode {}", code),
        ))
    })?;
    if opcode == Opcode::Rename2 && !layout.supports_rename2() {
        return Err(payload_error(FsError::new(
            ErrorKind::NotImplemented,
            format!("RENAME2 at protocol minor {}", layout.minor()),
        )));
    }

    let mut reader = WireReader::new(&frame[IN_HEADER_LEN..]);
    let operation = decode_operation(opcode, &mut reader, layout).map_err(payload_error)?;
    Ok(KernelRequest { header, operation })
}

/// Seconds and nanoseconds since the epoch, clamped at the epoch.
pub(crate) fn split_time(time: SystemTime) -> (u64, u32) {
    let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    (since.as_secs(), since.subsec_nanos())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODERN: WireLayout = WireLayout::for_minor(31);

    fn roundtrip(operation: Operation, layout: WireLayout) -> KernelRequest {
        let request = KernelRequest::new(9, InodeNumber::from(4), operation);
        let frame = request.encode(layout);
        decode(&frame, layout).unwrap()
    }

    #[test]
    fn test_header_fields() {
        let request = roundtrip(
            Operation::Lookup {
                name: "file.txt".into(),
            },
            MODERN,
        );
        assert_eq!(request.unique(), 9);
        assert_eq!(request.target(), InodeNumber::from(4));
        assert_eq!(request.opcode(), Opcode::Lookup);
        assert_eq!(
            request.operation,
            Operation::Lookup {
                name: "file.txt".into()
            }
        );
    }

    #[test]
    fn test_write_payload_depends_on_layout() {
        let op = Operation::Write {
            fh: FileHandle::from(3),
            offset: 10,
            data: b"hello".to_vec(),
        };
        let old = KernelRequest::new(1, InodeNumber::from(2), op.clone()).encode(WireLayout::for_minor(8));
        let new = KernelRequest::new(1, InodeNumber::from(2), op.clone()).encode(MODERN);
        assert_eq!(old.len(), IN_HEADER_LEN + 24 + 5);
        assert_eq!(new.len(), IN_HEADER_LEN + 40 + 5);
        assert_eq!(decode(&old, WireLayout::for_minor(8)).unwrap().operation, op);
        assert_eq!(decode(&new, MODERN).unwrap().operation, op);
    }

    #[test]
    fn test_setattr_fields_survive() {
        let attrs = SetAttrRequest {
            mode: Some(0o600),
            size: Some(12),
            mtime: Some(TimeOrNow::Now),
            atime: Some(TimeOrNow::SpecificTime(UNIX_EPOCH + Duration::from_secs(5))),
            ..Default::default()
        };
        let request = roundtrip(Operation::Setattr { attrs: attrs.clone() }, MODERN);
        assert_eq!(request.operation, Operation::Setattr { attrs });
    }

    #[test]
    fn test_short_header_is_unanswerable() {
        let err = decode(&[0u8; 12], MODERN).unwrap_err();
        assert!(matches!(err, DecodeError::Header(e) if e.kind() == ErrorKind::Framing));
    }

    #[test]
    fn test_truncated_payload_is_framing_error() {
        let mut frame = KernelRequest::new(
            5,
            InodeNumber::from(2),
            Operation::Read {
                fh: FileHandle::from(1),
                offset: 0,
                size: 10,
            },
        )
        .encode(MODERN);
        frame.truncate(IN_HEADER_LEN + 8);
        let frame_len = frame.len() as u32;
        frame[..4].copy_from_slice(&frame_len.to_le_bytes());
        match decode(&frame, MODERN).unwrap_err() {
            DecodeError::Payload { header, error } => {
                assert_eq!(header.unique, 5);
                assert_eq!(error.kind(), ErrorKind::Framing);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_length_mismatch_is_framing_error() {
        let mut frame = KernelRequest::new(5, ROOT_INODE, Operation::Statfs).encode(MODERN);
        frame.push(0);
        assert!(matches!(
            decode(&frame, MODERN).unwrap_err(),
            DecodeError::Payload { error, .. } if error.kind() == ErrorKind::Framing
        ));
    }

    #[test]
    fn test_unknown_opcode_is_not_implemented() {
        let mut frame = KernelRequest::new(5, ROOT_INODE, Operation::Statfs).encode(MODERN);
        frame[4..8].copy_from_slice(&6u32.to_le_bytes()); // SYMLINK
        assert!(matches!(
            decode(&frame, MODERN).unwrap_err(),
            DecodeError::Payload { error, .. } if error.kind() == ErrorKind::NotImplemented
        ));
    }

    #[test]
    fn test_rename2_requires_minor_23() {
        let op = Operation::Rename {
            name: "a".into(),
            new_parent: ROOT_INODE,
            new_name: "b".into(),
            flags: RenameFlags::NOREPLACE,
        };
        assert_eq!(roundtrip(op.clone(), MODERN).operation, op);
        let layout = WireLayout::for_minor(22);
        let frame = KernelRequest::new(1, ROOT_INODE, op).encode(layout);
        assert!(matches!(
            decode(&frame, layout).unwrap_err(),
            DecodeError::Payload { error, .. } if error.kind() == ErrorKind::NotImplemented
        ));
    }

    #[test]
    fn test_create_layout() {
        let op = Operation::Create {
            name: "new".into(),
            flags: OpenFlags::from_bits_retain(libc::O_WRONLY | libc::O_CREAT),
            mode: 0o644,
            umask: 0o022,
        };
        assert_eq!(roundtrip(op.clone(), MODERN).operation, op);
        let old = WireLayout::for_minor(11);
        let request = roundtrip(op, old);
        assert!(matches!(request.operation, Operation::Create { umask: 0, .. }));
    }
}
