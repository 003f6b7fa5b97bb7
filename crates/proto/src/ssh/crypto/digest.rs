//! Hash functions used for exchange hashes and key derivation.

use sha2::{Digest as _, Sha256, Sha512};

/// An incremental hash, reset on finalize.
///
/// The key derivation loop re-feeds the same prefix repeatedly, so every
/// finalize leaves the instance ready for the next round.
pub trait Digest: Send {
    /// Digest output length in bytes.
    fn size(&self) -> usize;

    /// Feeds bytes into the hash.
    fn update(&mut self, data: &[u8]);

    /// Returns the digest and resets the instance.
    fn finalize_reset(&mut self) -> Vec<u8>;
}

/// SHA-256.
#[derive(Default)]
pub struct Sha256Digest(Sha256);

impl Digest for Sha256Digest {
    fn size(&self) -> usize {
        32
    }

    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize_reset(&mut self) -> Vec<u8> {
        self.0.finalize_reset().to_vec()
    }
}

/// SHA-512.
#[derive(Default)]
pub struct Sha512Digest(Sha512);

impl Digest for Sha512Digest {
    fn size(&self) -> usize {
        64
    }

    fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    fn finalize_reset(&mut self) -> Vec<u8> {
        self.0.finalize_reset().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_value() {
        let mut digest = Sha256Digest::default();
        digest.update(b"abc");
        let out = digest.finalize_reset();
        assert_eq!(out.len(), 32);
        assert_eq!(
            out[..4],
            [0xba, 0x78, 0x16, 0xbf],
            "SHA-256(\"abc\") prefix mismatch"
        );
    }

    #[test]
    fn test_finalize_resets() {
        let mut digest = Sha256Digest::default();
        digest.update(b"abc");
        let first = digest.finalize_reset();
        digest.update(b"abc");
        let second = digest.finalize_reset();
        assert_eq!(first, second);
    }

    #[test]
    fn test_sha512_size() {
        let mut digest = Sha512Digest::default();
        digest.update(b"x");
        assert_eq!(digest.finalize_reset().len(), 64);
        assert_eq!(digest.size(), 64);
    }
}
