use byteorder::{BigEndian, ByteOrder};

use crate::status::{PmixResult, Status};

/// Wire mode of a buffer. Fully-described buffers interleave type tags with
/// the payload so they can be unpacked without prior schema knowledge;
/// non-described buffers carry raw payload only.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BufKind {
    FullyDesc = 1,
    NonDesc = 0,
}

impl BufKind {
    pub fn from_u8(raw: u8) -> PmixResult<BufKind> {
        match raw {
            0 => Ok(BufKind::NonDesc),
            1 => Ok(BufKind::FullyDesc),
            _ => Err(Status::UnpackFailure),
        }
    }
}

/// Growable byte buffer with independent pack and unpack cursors. Packing
/// appends at the tail; unpacking consumes from `unpack_pos` forward. The
/// cursors always satisfy `unpack_pos <= used()`.
#[derive(Debug, Clone)]
pub struct Buffer {
    kind: BufKind,
    data: Vec<u8>,
    unpack_pos: usize,
}

impl Buffer {
    #[inline]
    pub fn new(kind: BufKind) -> Buffer {
        Buffer {
            kind,
            data: Vec::new(),
            unpack_pos: 0,
        }
    }

    /// The outer command layer always speaks fully-described buffers.
    #[inline]
    pub fn fully_desc() -> Buffer {
        Buffer::new(BufKind::FullyDesc)
    }

    #[inline]
    pub fn non_desc() -> Buffer {
        Buffer::new(BufKind::NonDesc)
    }

    /// Wraps received payload bytes for unpacking.
    #[inline]
    pub fn from_vec(kind: BufKind, data: Vec<u8>) -> Buffer {
        Buffer {
            kind,
            data,
            unpack_pos: 0,
        }
    }

    #[inline]
    pub fn kind(&self) -> BufKind {
        self.kind
    }

    /// Bytes packed so far (pack cursor offset from base).
    #[inline]
    pub fn used(&self) -> usize {
        self.data.len()
    }

    /// Bytes between the unpack cursor and the pack cursor.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.unpack_pos
    }

    #[inline]
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Resets the unpack cursor to the base.
    #[inline]
    pub fn rewind(&mut self) {
        self.unpack_pos = 0;
    }

    /// Ensures room for `additional` bytes. Grows to double the current
    /// allocation or to the exact required size, whichever is larger.
    fn ensure(&mut self, additional: usize) {
        let needed = self.data.len() + additional;
        if needed > self.data.capacity() {
            let target = std::cmp::max(self.data.capacity() * 2, needed);
            self.data.reserve_exact(target - self.data.len());
        }
    }

    /// Appends raw bytes at the pack cursor.
    #[inline]
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.ensure(bytes.len());
        self.data.extend_from_slice(bytes);
    }

    /// Appends another buffer's full contents verbatim.
    #[inline]
    pub fn append_payload(&mut self, other: &Buffer) {
        self.put_bytes(other.as_slice());
    }

    #[inline]
    pub fn put_u8(&mut self, val: u8) {
        self.put_bytes(&[val]);
    }

    #[inline]
    pub fn put_i8(&mut self, val: i8) {
        self.put_bytes(&[val as u8]);
    }

    #[inline]
    pub fn put_u16(&mut self, val: u16) {
        let mut raw = [0u8; 2];
        BigEndian::write_u16(&mut raw, val);
        self.put_bytes(&raw);
    }

    #[inline]
    pub fn put_i16(&mut self, val: i16) {
        self.put_u16(val as u16);
    }

    #[inline]
    pub fn put_u32(&mut self, val: u32) {
        let mut raw = [0u8; 4];
        BigEndian::write_u32(&mut raw, val);
        self.put_bytes(&raw);
    }

    #[inline]
    pub fn put_i32(&mut self, val: i32) {
        self.put_u32(val as u32);
    }

    #[inline]
    pub fn put_u64(&mut self, val: u64) {
        let mut raw = [0u8; 8];
        BigEndian::write_u64(&mut raw, val);
        self.put_bytes(&raw);
    }

    #[inline]
    pub fn put_i64(&mut self, val: i64) {
        self.put_u64(val as u64);
    }

    /// Consumes `count` bytes at the unpack cursor.
    pub fn get_bytes(&mut self, count: usize) -> PmixResult<&[u8]> {
        if self.remaining() < count {
            return Err(Status::UnpackReadPastEnd);
        }
        let start = self.unpack_pos;
        self.unpack_pos += count;
        Ok(&self.data[start..self.unpack_pos])
    }

    /// Reads one byte without advancing the unpack cursor.
    pub fn peek_u8(&self) -> PmixResult<u8> {
        if self.remaining() < 1 {
            return Err(Status::UnpackReadPastEnd);
        }
        Ok(self.data[self.unpack_pos])
    }

    #[inline]
    pub fn skip(&mut self, count: usize) -> PmixResult<()> {
        self.get_bytes(count).map(|_| ())
    }

    pub fn get_u8(&mut self) -> PmixResult<u8> {
        Ok(self.get_bytes(1)?[0])
    }

    pub fn get_i8(&mut self) -> PmixResult<i8> {
        Ok(self.get_u8()? as i8)
    }

    pub fn get_u16(&mut self) -> PmixResult<u16> {
        Ok(BigEndian::read_u16(self.get_bytes(2)?))
    }

    pub fn get_i16(&mut self) -> PmixResult<i16> {
        Ok(self.get_u16()? as i16)
    }

    pub fn get_u32(&mut self) -> PmixResult<u32> {
        Ok(BigEndian::read_u32(self.get_bytes(4)?))
    }

    pub fn get_i32(&mut self) -> PmixResult<i32> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_u64(&mut self) -> PmixResult<u64> {
        Ok(BigEndian::read_u64(self.get_bytes(8)?))
    }

    pub fn get_i64(&mut self) -> PmixResult<i64> {
        Ok(self.get_u64()? as i64)
    }
}
