//! SSH-2 transport layer (RFC 4251, RFC 4253).
//!
//! This module implements the transport-layer session core: everything
//! between an established byte stream and the upper-layer services.
//!
//! # Architecture
//!
//! 1. **Wire buffer** ([`buffer`]) - positioned byte buffer with SSH typed
//!    codecs
//! 2. **Packet codec** ([`codec`]) - framing, MAC, cipher, compression,
//!    sequence numbers
//! 3. **Identification exchange** ([`version`]) - `SSH-2.0-...` banners
//! 4. **Negotiation** ([`negotiation`]) - KEXINIT proposals and agreement
//! 5. **KEX coordination** ([`kex`]) - state machine vocabulary and key
//!    derivation; the exchange math is supplied through factories
//! 6. **Session core** ([`session`]) - dispatch, rekeying, queueing,
//!    timeouts, disconnect
//!
//! Supporting pieces: named factories and configuration ([`factory`]),
//! one-shot futures ([`future`]), listener sets ([`listener`]), the
//! upstream service hook ([`service`]), the byte-stream abstraction
//! ([`io`]), and the default crypto set ([`crypto`]).
//!
//! # Security
//!
//! - Strict packet length bounds (5 to 262144 bytes)
//! - Constant-time MAC comparison (`subtle`)
//! - Key material zeroized on drop (`zeroize`)
//! - No `unsafe` code

pub mod buffer;
pub mod codec;
pub mod crypto;
pub mod factory;
pub mod future;
pub mod io;
pub mod kex;
pub mod listener;
pub mod message;
pub mod negotiation;
pub mod service;
pub mod session;
pub mod version;

pub use buffer::Buffer;
pub use codec::{Decoder, Encoder, MAX_PACKET_LENGTH, MIN_PACKET_LENGTH};
pub use factory::FactoryManager;
pub use future::{KexFuture, SshFuture, WriteFuture};
pub use io::{IoSession, LoopbackIoSession, TcpIoSession};
pub use kex::{KexFactory, KexOutput, KexState, KeyExchange};
pub use listener::{ChannelEvent, ChannelListener, SessionEvent, SessionListener};
pub use message::MessageType;
pub use negotiation::{Proposal, ProposalSlot};
pub use service::{Service, ServiceFactory};
pub use session::{Role, Session, TimeoutStatus};
pub use version::Version;
