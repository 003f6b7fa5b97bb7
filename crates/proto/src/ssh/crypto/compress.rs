//! Payload compression for the transport codec.
//!
//! SSH compression is a single zlib stream per direction spanning the whole
//! connection, flushed at each packet boundary with a partial flush. The
//! `zlib@openssh.com` variant is "delayed": it stays dormant until the
//! session reports the user as authenticated.

use crate::ssh::buffer::Buffer;
use flate2::{Compress, Decompress, FlushCompress, FlushDecompress, Status};
use skiff_platform::{SkiffError, SkiffResult};

/// A per-direction compression stream.
pub trait Compression: Send {
    /// Whether activation waits for authentication (`zlib@openssh.com`).
    fn is_delayed(&self) -> bool;

    /// Compresses the readable region of `buffer` in place.
    fn compress(&mut self, buffer: &mut Buffer) -> SkiffResult<()>;

    /// Decompresses the readable region of `input`, appending to `output`.
    fn decompress(&mut self, input: &Buffer, output: &mut Buffer) -> SkiffResult<()>;
}

/// Compression algorithms offered in the KEXINIT proposal, in the order
/// listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionAlgorithm {
    /// No compression.
    None,
    /// zlib, active from NEWKEYS (RFC 4253).
    Zlib,
    /// zlib, active only after authentication (OpenSSH extension).
    ZlibDelayed,
}

impl CompressionAlgorithm {
    /// Returns the SSH algorithm name.
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::ZlibDelayed => "zlib@openssh.com",
        }
    }

    /// Parses a compression algorithm from its SSH name.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "none" => Some(CompressionAlgorithm::None),
            "zlib" => Some(CompressionAlgorithm::Zlib),
            "zlib@openssh.com" => Some(CompressionAlgorithm::ZlibDelayed),
            _ => None,
        }
    }

    /// Creates a compression stream, or `None` for the `none` algorithm
    /// (the codec skips the compression stage entirely).
    pub fn create(&self) -> Option<Box<dyn Compression>> {
        match self {
            CompressionAlgorithm::None => None,
            CompressionAlgorithm::Zlib => Some(Box::new(ZlibCompression::new(false))),
            CompressionAlgorithm::ZlibDelayed => Some(Box::new(ZlibCompression::new(true))),
        }
    }
}

struct ZlibCompression {
    delayed: bool,
    deflate: Compress,
    inflate: Decompress,
    scratch: Vec<u8>,
}

impl ZlibCompression {
    fn new(delayed: bool) -> Self {
        Self {
            delayed,
            deflate: Compress::new(flate2::Compression::default(), true),
            inflate: Decompress::new(true),
            scratch: Vec::new(),
        }
    }
}

impl Compression for ZlibCompression {
    fn is_delayed(&self) -> bool {
        self.delayed
    }

    fn compress(&mut self, buffer: &mut Buffer) -> SkiffResult<()> {
        self.scratch.clear();
        let payload = buffer.readable();
        let mut consumed = 0;
        loop {
            // Guarantee spare output room so that "nothing produced" can
            // only mean the flush is complete.
            if self.scratch.len() == self.scratch.capacity() {
                self.scratch.reserve(4096);
            }
            let before_in = self.deflate.total_in();
            let before_out = self.deflate.total_out();
            let status = self
                .deflate
                .compress_vec(&payload[consumed..], &mut self.scratch, FlushCompress::Partial)
                .map_err(|e| SkiffError::Protocol(format!("Compression failed: {}", e)))?;
            consumed += (self.deflate.total_in() - before_in) as usize;
            let produced = self.deflate.total_out() - before_out;
            match status {
                Status::Ok | Status::BufError => {
                    if consumed >= payload.len() && produced == 0 {
                        break;
                    }
                }
                Status::StreamEnd => break,
            }
        }

        let rpos = buffer.rpos();
        buffer.set_wpos(rpos);
        buffer.put_raw(&self.scratch);
        Ok(())
    }

    fn decompress(&mut self, input: &Buffer, output: &mut Buffer) -> SkiffResult<()> {
        let payload = input.readable();
        let mut consumed = 0;
        let mut out = Vec::with_capacity((payload.len() * 2).max(256));
        loop {
            if out.len() == out.capacity() {
                out.reserve(4096);
            }
            let before_in = self.inflate.total_in();
            let before_out = self.inflate.total_out();
            let status = self
                .inflate
                .decompress_vec(&payload[consumed..], &mut out, FlushDecompress::None)
                .map_err(|e| SkiffError::Protocol(format!("Decompression failed: {}", e)))?;
            consumed += (self.inflate.total_in() - before_in) as usize;
            let produced = self.inflate.total_out() - before_out;
            match status {
                Status::Ok | Status::BufError => {
                    if consumed >= payload.len() && produced == 0 {
                        break;
                    }
                }
                Status::StreamEnd => break,
            }
        }
        output.put_raw(&out);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_name() {
        assert_eq!(
            CompressionAlgorithm::from_name("none"),
            Some(CompressionAlgorithm::None)
        );
        assert_eq!(
            CompressionAlgorithm::from_name("zlib@openssh.com"),
            Some(CompressionAlgorithm::ZlibDelayed)
        );
        assert_eq!(CompressionAlgorithm::from_name("lz4"), None);
    }

    #[test]
    fn test_none_creates_nothing() {
        assert!(CompressionAlgorithm::None.create().is_none());
    }

    #[test]
    fn test_delayed_flag() {
        assert!(!CompressionAlgorithm::Zlib.create().unwrap().is_delayed());
        assert!(CompressionAlgorithm::ZlibDelayed
            .create()
            .unwrap()
            .is_delayed());
    }

    #[test]
    fn test_zlib_round_trip() {
        let mut tx = CompressionAlgorithm::Zlib.create().unwrap();
        let mut rx = CompressionAlgorithm::Zlib.create().unwrap();

        let text = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa compressible payload";
        let mut buffer = Buffer::from_vec(text.to_vec());
        tx.compress(&mut buffer).unwrap();
        assert!(buffer.available() < text.len());

        let mut out = Buffer::new();
        rx.decompress(&buffer, &mut out).unwrap();
        assert_eq!(out.readable(), text);
    }

    #[test]
    fn test_zlib_stream_spans_packets() {
        let mut tx = CompressionAlgorithm::Zlib.create().unwrap();
        let mut rx = CompressionAlgorithm::Zlib.create().unwrap();

        for round in 0..3u8 {
            let payload = vec![round; 64];
            let mut buffer = Buffer::from_vec(payload.clone());
            tx.compress(&mut buffer).unwrap();

            let mut out = Buffer::new();
            rx.decompress(&buffer, &mut out).unwrap();
            assert_eq!(out.readable(), &payload[..]);
        }
    }
}
