//! Cryptographic building blocks consumed by the transport codec.
//!
//! The session core never names a concrete algorithm: it works against the
//! [`Cipher`], [`Mac`], [`Digest`], [`Compression`], and [`Random`] traits
//! and obtains instances from the factory manager by negotiated name. This
//! module supplies the default set: AES-CTR ciphers, HMAC MACs, SHA-2
//! digests, zlib compression, and an OS-seeded generator.

pub mod cipher;
pub mod compress;
pub mod digest;
pub mod mac;
pub mod random;

pub use cipher::{Cipher, CipherAlgorithm, CipherMode};
pub use compress::{Compression, CompressionAlgorithm};
pub use digest::{Digest, Sha256Digest, Sha512Digest};
pub use mac::{Mac, MacAlgorithm};
pub use random::{Random, RandomFactory, SystemRandomFactory};
