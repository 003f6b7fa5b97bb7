//! Positioned byte buffer with SSH wire-type codecs (RFC 4251 Section 5).
//!
//! Every SSH packet and message in this crate is built and parsed through
//! [`Buffer`]: an expandable byte buffer with independent read and write
//! positions and typed accessors for the SSH wire types (`byte`, `boolean`,
//! `uint32`, `uint64`, `string`, `mpint`, raw byte runs).
//!
//! # Positions
//!
//! ```text
//! 0 ........ rpos ........ wpos ........ capacity
//!            |-- available --|
//! ```
//!
//! Reads advance `rpos` and never move past `wpos`; writes advance `wpos`
//! and grow the underlying storage on demand. [`Buffer::compact`] drops the
//! already-consumed prefix and rebases both positions, which keeps the
//! decoder's accumulation buffer bounded.
//!
//! Read underflow is a recoverable error ([`SkiffError::Protocol`]), not a
//! panic: the decoder uses it to detect truncated packets.

use skiff_platform::{SkiffError, SkiffResult};

/// Default initial capacity for a fresh buffer.
const DEFAULT_CAPACITY: usize = 256;

/// Number of bytes reserved in front of a packet payload for the
/// `packet_length` + `padding_length` header written by the encoder.
pub const PACKET_HEADER_LEN: usize = 5;

/// Expandable byte buffer with read/write positions and SSH typed codecs.
#[derive(Debug, Clone, Default)]
pub struct Buffer {
    data: Vec<u8>,
    rpos: usize,
    wpos: usize,
}

impl Buffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(DEFAULT_CAPACITY),
            rpos: 0,
            wpos: 0,
        }
    }

    /// Creates a buffer whose readable content is `data`.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let wpos = data.len();
        Self {
            data,
            rpos: 0,
            wpos,
        }
    }

    /// Creates a buffer prepared for packet encoding: the read and write
    /// positions are placed [`PACKET_HEADER_LEN`] bytes in, leaving room for
    /// the length and padding-length fields, and the opcode is written.
    pub fn packet(cmd: u8) -> Self {
        let mut buffer = Self::new();
        buffer.set_wpos(PACKET_HEADER_LEN);
        buffer.rpos = PACKET_HEADER_LEN;
        buffer.put_u8(cmd);
        buffer
    }

    /// Returns the number of readable bytes (`wpos - rpos`).
    pub fn available(&self) -> usize {
        self.wpos - self.rpos
    }

    /// Returns the current read position.
    pub fn rpos(&self) -> usize {
        self.rpos
    }

    /// Sets the read position.
    ///
    /// The position may be placed anywhere up to the current write position.
    pub fn set_rpos(&mut self, rpos: usize) {
        debug_assert!(rpos <= self.wpos);
        self.rpos = rpos;
    }

    /// Returns the current write position.
    pub fn wpos(&self) -> usize {
        self.wpos
    }

    /// Sets the write position, growing the underlying storage with zero
    /// bytes if the new position is past the end.
    pub fn set_wpos(&mut self, wpos: usize) {
        if wpos > self.data.len() {
            self.data.resize(wpos, 0);
        }
        self.wpos = wpos;
    }

    /// Resets both positions to zero without releasing storage.
    pub fn clear(&mut self) {
        self.rpos = 0;
        self.wpos = 0;
    }

    /// Drops the consumed prefix and rebases positions so that `rpos == 0`.
    pub fn compact(&mut self) {
        if self.rpos > 0 {
            self.data.copy_within(self.rpos..self.wpos, 0);
            self.wpos -= self.rpos;
            self.rpos = 0;
        }
    }

    /// Returns the written storage as a slice (positions ignored).
    pub fn array(&self) -> &[u8] {
        &self.data[..self.wpos]
    }

    /// Returns the written storage as a mutable slice.
    ///
    /// Used by the codec for in-place encryption and MAC computation.
    pub fn array_mut(&mut self) -> &mut [u8] {
        let end = self.wpos;
        &mut self.data[..end]
    }

    /// Returns the readable region (`rpos..wpos`) as a slice.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.rpos..self.wpos]
    }

    /// Copies the readable region into a fresh vector without consuming it.
    pub fn to_payload(&self) -> Vec<u8> {
        self.readable().to_vec()
    }

    fn ensure(&mut self, extra: usize) {
        let needed = self.wpos + extra;
        if needed > self.data.len() {
            self.data.resize(needed, 0);
        }
    }

    fn check_read(&self, len: usize) -> SkiffResult<()> {
        if self.available() < len {
            return Err(SkiffError::Protocol(format!(
                "Buffer underflow: need {} bytes, {} available",
                len,
                self.available()
            )));
        }
        Ok(())
    }

    // --- writers ---

    /// Appends a single byte.
    pub fn put_u8(&mut self, value: u8) {
        self.ensure(1);
        self.data[self.wpos] = value;
        self.wpos += 1;
    }

    /// Appends a boolean (one byte, 0 or 1).
    pub fn put_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    /// Appends a big-endian `uint32`.
    pub fn put_u32(&mut self, value: u32) {
        self.put_raw(&value.to_be_bytes());
    }

    /// Appends a big-endian `uint64`.
    pub fn put_u64(&mut self, value: u64) {
        self.put_raw(&value.to_be_bytes());
    }

    /// Appends a raw byte run without a length prefix.
    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.ensure(bytes.len());
        self.data[self.wpos..self.wpos + bytes.len()].copy_from_slice(bytes);
        self.wpos += bytes.len();
    }

    /// Appends an SSH `string`: `uint32` length followed by the bytes.
    pub fn put_string(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    /// Appends a length-prefixed byte string.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.put_raw(bytes);
    }

    /// Appends an `mpint` (RFC 4251 Section 5): the minimal two's-complement
    /// big-endian representation, with a leading zero byte when the high bit
    /// of the first magnitude byte is set.
    pub fn put_mpint(&mut self, magnitude: &[u8]) {
        let mut start = 0;
        while start < magnitude.len() && magnitude[start] == 0 {
            start += 1;
        }
        let m = &magnitude[start..];
        if m.is_empty() {
            self.put_u32(0);
            return;
        }
        if m[0] & 0x80 != 0 {
            self.put_u32(m.len() as u32 + 1);
            self.put_u8(0);
        } else {
            self.put_u32(m.len() as u32);
        }
        self.put_raw(m);
    }

    /// Appends the readable region of another buffer.
    pub fn put_buffer(&mut self, other: &Buffer) {
        self.put_raw(other.readable());
    }

    // --- readers ---

    /// Reads a single byte.
    pub fn get_u8(&mut self) -> SkiffResult<u8> {
        self.check_read(1)?;
        let value = self.data[self.rpos];
        self.rpos += 1;
        Ok(value)
    }

    /// Returns the next readable byte without consuming it.
    pub fn peek_u8(&self) -> SkiffResult<u8> {
        self.check_read(1)?;
        Ok(self.data[self.rpos])
    }

    /// Reads a boolean (any non-zero byte is `true`).
    pub fn get_bool(&mut self) -> SkiffResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Reads a big-endian `uint32`.
    pub fn get_u32(&mut self) -> SkiffResult<u32> {
        self.check_read(4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.data[self.rpos..self.rpos + 4]);
        self.rpos += 4;
        Ok(u32::from_be_bytes(bytes))
    }

    /// Reads a big-endian `uint64`.
    pub fn get_u64(&mut self) -> SkiffResult<u64> {
        self.check_read(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.data[self.rpos..self.rpos + 8]);
        self.rpos += 8;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Reads `len` raw bytes.
    pub fn get_raw(&mut self, len: usize) -> SkiffResult<Vec<u8>> {
        self.check_read(len)?;
        let bytes = self.data[self.rpos..self.rpos + len].to_vec();
        self.rpos += len;
        Ok(bytes)
    }

    /// Reads a length-prefixed byte string.
    pub fn get_bytes(&mut self) -> SkiffResult<Vec<u8>> {
        let len = self.get_u32()? as usize;
        self.get_raw(len)
    }

    /// Reads an SSH `string` and decodes it as UTF-8.
    pub fn get_string(&mut self) -> SkiffResult<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes)
            .map_err(|_| SkiffError::Protocol("String field contains invalid UTF-8".to_string()))
    }

    /// Reads an `mpint` as its raw big-endian bytes (any leading zero byte
    /// kept as transmitted).
    pub fn get_mpint(&mut self) -> SkiffResult<Vec<u8>> {
        self.get_bytes()
    }
}
