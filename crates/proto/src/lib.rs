//! Protocol implementations for the Skiff SSH stack.
//!
//! This crate provides the SSH-2 transport layer session core: version
//! exchange, algorithm negotiation, the binary packet codec (cipher, MAC,
//! compression, sequence numbering), key exchange coordination and
//! rekeying, pending-write queueing, upstream service dispatch, timeout
//! management, and SSH-compliant disconnect.
//!
//! Key-exchange mathematics, authentication services, and channel
//! multiplexing are consumed through traits ([`ssh::kex::KexFactory`],
//! [`ssh::service::ServiceFactory`]) and registered on the
//! [`ssh::FactoryManager`].
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::Buffer;
//!
//! // SSH wire types round-trip through the positioned buffer.
//! let mut buffer = Buffer::new();
//! buffer.put_string("ssh-userauth");
//! assert_eq!(buffer.get_string().unwrap(), "ssh-userauth");
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
