use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;

use crate::types::{FsError, FsResult};

/// Sizes of the version-dependent structures, fixed by the negotiated minor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireLayout {
    minor: u32,
}

impl WireLayout {
    pub const fn for_minor(minor: u32) -> Self {
        WireLayout { minor }
    }

    pub const fn minor(&self) -> u32 {
        self.minor
    }

    pub const fn attr_size(&self) -> usize {
        if self.minor >= 9 {
            88
        } else {
            80
        }
    }

    pub const fn entry_out_size(&self) -> usize {
        40 + self.attr_size()
    }

    pub const fn attr_out_size(&self) -> usize {
        16 + self.attr_size()
    }

    /// Shared by READ, WRITE and READDIR.
    pub const fn read_in_size(&self) -> usize {
        if self.minor >= 9 {
            40
        } else {
            24
        }
    }

    pub const fn getattr_in_size(&self) -> usize {
        if self.minor >= 9 {
            16
        } else {
            0
        }
    }

    pub const fn create_in_size(&self) -> usize {
        if self.minor >= 12 {
            16
        } else {
            8
        }
    }

    pub const fn release_in_size(&self) -> usize {
        if self.minor >= 8 {
            24
        } else {
            16
        }
    }

    pub const fn init_out_size(&self) -> usize {
        if self.minor < 5 {
            8
        } else if self.minor < 23 {
            24
        } else {
            64
        }
    }

    pub const fn supports_rename2(&self) -> bool {
        self.minor >= 23
    }
}

/// Little-endian cursor over a received frame. Every short read is a framing error.
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        WireReader { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn bytes(&mut self, len: usize) -> FsResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(FsError::framing(format!(
                "need {} bytes at offset {}, frame has {}",
                len,
                self.pos,
                self.buf.len()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> FsResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn skip(&mut self, len: usize) -> FsResult<()> {
        self.bytes(len).map(|_| ())
    }

    pub fn u16(&mut self) -> FsResult<u16> {
        self.array().map(u16::from_le_bytes)
    }

    pub fn u32(&mut self) -> FsResult<u32> {
        self.array().map(u32::from_le_bytes)
    }

    pub fn i32(&mut self) -> FsResult<i32> {
        self.array().map(i32::from_le_bytes)
    }

    pub fn u64(&mut self) -> FsResult<u64> {
        self.array().map(u64::from_le_bytes)
    }

    /// A NUL-terminated name.
    pub fn name(&mut self) -> FsResult<&'a OsStr> {
        let rest = &self.buf[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| FsError::framing("unterminated name"))?;
        self.pos += end + 1;
        Ok(OsStr::from_bytes(&rest[..end]))
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }
}

#[derive(Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        WireWriter {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn name(&mut self, name: &OsStr) -> &mut Self {
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(0);
        self
    }

    pub fn zeros(&mut self, count: usize) -> &mut Self {
        self.buf.resize(self.buf.len() + count, 0);
        self
    }

    pub fn align(&mut self, alignment: usize) -> &mut Self {
        let padded = self.buf.len().div_ceil(alignment) * alignment;
        self.buf.resize(padded, 0);
        self
    }

    /// Overwrites the leading length field with the final frame size.
    pub fn finish_frame(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        if self.buf.len() >= 4 {
            self.buf[..4].copy_from_slice(&len.to_le_bytes());
        }
        self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ErrorKind;

    #[test]
    fn test_layout_depends_on_minor() {
        let old = WireLayout::for_minor(8);
        let new = WireLayout::for_minor(31);
        assert_eq!(old.attr_size(), 80);
        assert_eq!(new.attr_size(), 88);
        assert_eq!(old.read_in_size(), 24);
        assert_eq!(new.read_in_size(), 40);
        assert_eq!(WireLayout::for_minor(11).create_in_size(), 8);
        assert_eq!(WireLayout::for_minor(12).create_in_size(), 16);
        assert!(!WireLayout::for_minor(22).supports_rename2());
        assert_eq!(WireLayout::for_minor(4).init_out_size(), 8);
        assert_eq!(new.init_out_size(), 64);
    }

    #[test]
    fn test_short_read_is_framing_error() {
        let mut reader = WireReader::new(&[1, 0, 0]);
        assert_eq!(reader.u32().unwrap_err().kind(), ErrorKind::Framing);
        let mut reader = WireReader::new(b"abc");
        assert_eq!(reader.name().unwrap_err().kind(), ErrorKind::Framing);
    }

    #[test]
    fn test_writer_aligns_and_sets_length() {
        let mut writer = WireWriter::new();
        writer.u32(0).name(OsStr::new("abc")).align(8);
        let frame = writer.finish_frame();
        assert_eq!(frame.len(), 8);
        assert_eq!(u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]), 8);

        let mut reader = WireReader::new(&frame);
        assert_eq!(reader.u32().unwrap(), 8);
        assert_eq!(reader.name().unwrap(), "abc");
    }
}
