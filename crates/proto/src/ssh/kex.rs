//! Key exchange coordination (RFC 4253 Section 7).
//!
//! The actual exchange mathematics (DH, ECDH) live behind the
//! [`KeyExchange`] trait and are supplied through named factories; this
//! module owns the state machine vocabulary and the derivation of session
//! keys from the shared secret `K`, the exchange hash `H`, and the session
//! id.
//!
//! # States
//!
//! ```text
//! UNKNOWN --session start--> INIT --peer KEXINIT--> RUN --kex done--> KEYS --peer NEWKEYS--> DONE
//!                              ^                                                              |
//!                              +--------------------- rekey ----------------------------------+
//! ```
//!
//! While the state is anything but `Done`, only transport-layer messages
//! may be sent; everything else is queued and flushed when `Done` is
//! re-entered.

use crate::ssh::buffer::Buffer;
use crate::ssh::crypto::Digest;
use crate::ssh::session::Role;
use skiff_platform::{SkiffError, SkiffResult};
use zeroize::Zeroize;

/// Key exchange progress, stored atomically on the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum KexState {
    /// No key exchange has started yet.
    Unknown = 0,
    /// Our KEXINIT is on the wire; waiting for the peer's.
    Init = 1,
    /// Both KEXINITs seen; method-specific messages are flowing.
    Run = 2,
    /// The exchange produced keys and our NEWKEYS was sent; waiting for
    /// the peer's NEWKEYS.
    Keys = 3,
    /// Keys are in use; normal traffic flows.
    Done = 4,
}

impl KexState {
    /// Converts the atomic representation back to a state.
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => KexState::Init,
            2 => KexState::Run,
            3 => KexState::Keys,
            4 => KexState::Done,
            _ => KexState::Unknown,
        }
    }
}

/// Packets produced by one step of a key exchange.
#[derive(Debug, Default)]
pub struct KexOutput {
    /// Transport packets to send, in order (opcodes in `[30, 49]`).
    pub packets: Vec<Buffer>,
    /// Whether the exchange has completed and `K`/`H` are available.
    pub done: bool,
}

impl KexOutput {
    /// An in-progress step emitting the given packets.
    pub fn pending(packets: Vec<Buffer>) -> Self {
        Self {
            packets,
            done: false,
        }
    }

    /// A final step emitting the given packets.
    pub fn finished(packets: Vec<Buffer>) -> Self {
        Self {
            packets,
            done: true,
        }
    }
}

/// One key exchange run.
///
/// Created by a [`KexFactory`] when the KEXINIT negotiation picks its
/// algorithm. The session feeds it the method-specific messages (opcodes
/// 30 through 49) and sends whatever packets it returns; once a step
/// reports `done`, the shared secret and exchange hash are read out for
/// key derivation.
pub trait KeyExchange: Send {
    /// Starts the exchange.
    ///
    /// `v_s`/`v_c` are the raw server and client identification strings,
    /// `i_s`/`i_c` the raw KEXINIT payloads, exactly as hashed into `H`.
    /// A client-side exchange typically emits its init packet here.
    fn init(
        &mut self,
        role: Role,
        v_s: &[u8],
        v_c: &[u8],
        i_s: &[u8],
        i_c: &[u8],
    ) -> SkiffResult<KexOutput>;

    /// Processes one method-specific message.
    ///
    /// The buffer's read position is at the opcode byte.
    fn next(&mut self, buffer: &mut Buffer) -> SkiffResult<KexOutput>;

    /// The shared secret `K` as a big-endian magnitude.
    ///
    /// Only valid after a step returned `done`.
    fn shared_secret(&self) -> SkiffResult<&[u8]>;

    /// The exchange hash `H`.
    ///
    /// Only valid after a step returned `done`.
    fn exchange_hash(&self) -> SkiffResult<&[u8]>;

    /// The hash function bound to the negotiated method, used for key
    /// derivation.
    fn digest(&self) -> Box<dyn Digest>;
}

/// Named factory for a key exchange method.
pub trait KexFactory: Send + Sync {
    /// The SSH algorithm name (e.g. `curve25519-sha256`).
    fn name(&self) -> &str;

    /// Creates a fresh exchange run.
    fn create(&self) -> Box<dyn KeyExchange>;
}

/// The six derived-key letters of RFC 4253 Section 7.2.
const KEY_LETTERS: [u8; 6] = [b'A', b'B', b'C', b'D', b'E', b'F'];

/// The full set of per-direction key material derived after an exchange.
///
/// Letters bind to directions as: `A`/`B` the client-to-server and
/// server-to-client IVs, `C`/`D` the encryption keys, `E`/`F` the
/// integrity keys.
pub struct DerivedKeys {
    /// Initial IV, client to server (`A`).
    pub iv_c2s: Vec<u8>,
    /// Initial IV, server to client (`B`).
    pub iv_s2c: Vec<u8>,
    /// Encryption key, client to server (`C`).
    pub enc_c2s: Vec<u8>,
    /// Encryption key, server to client (`D`).
    pub enc_s2c: Vec<u8>,
    /// Integrity key, client to server (`E`).
    pub mac_c2s: Vec<u8>,
    /// Integrity key, server to client (`F`).
    pub mac_s2c: Vec<u8>,
}

impl Drop for DerivedKeys {
    fn drop(&mut self) {
        self.iv_c2s.zeroize();
        self.iv_s2c.zeroize();
        self.enc_c2s.zeroize();
        self.enc_s2c.zeroize();
        self.mac_c2s.zeroize();
        self.mac_s2c.zeroize();
    }
}

/// Derives the six session keys from `K`, `H`, and the session id.
///
/// Each key starts as `HASH(mpint(K) || H || letter || session_id)` and is
/// extended on demand by [`resize_key`].
pub fn derive_keys(
    digest: &mut dyn Digest,
    k: &[u8],
    h: &[u8],
    session_id: &[u8],
) -> SkiffResult<DerivedKeys> {
    let mut keys = Vec::with_capacity(KEY_LETTERS.len());
    for letter in KEY_LETTERS {
        let mut seed = Buffer::new();
        seed.put_mpint(k);
        seed.put_raw(h);
        seed.put_u8(letter);
        seed.put_raw(session_id);
        digest.update(seed.readable());
        keys.push(digest.finalize_reset());
    }

    let mut keys = keys.into_iter();
    Ok(DerivedKeys {
        iv_c2s: keys.next().expect("six letters"),
        iv_s2c: keys.next().expect("six letters"),
        enc_c2s: keys.next().expect("six letters"),
        enc_s2c: keys.next().expect("six letters"),
        mac_c2s: keys.next().expect("six letters"),
        mac_s2c: keys.next().expect("six letters"),
    })
}

/// Extends `key` to at least `needed` bytes by iterated hashing:
/// `key = key || HASH(mpint(K) || H || key)` (RFC 4253 Section 7.2).
pub fn resize_key(
    digest: &mut dyn Digest,
    mut key: Vec<u8>,
    needed: usize,
    k: &[u8],
    h: &[u8],
) -> Vec<u8> {
    while key.len() < needed {
        let mut seed = Buffer::new();
        seed.put_mpint(k);
        seed.put_raw(h);
        seed.put_raw(&key);
        digest.update(seed.readable());
        let extension = digest.finalize_reset();
        key.extend_from_slice(&extension);
    }
    key
}

/// Looks up a key exchange factory by negotiated name.
pub fn create_kex(
    factories: &[std::sync::Arc<dyn KexFactory>],
    name: &str,
) -> SkiffResult<Box<dyn KeyExchange>> {
    factories
        .iter()
        .find(|f| f.name() == name)
        .map(|f| f.create())
        .ok_or_else(|| {
            SkiffError::KeyExchange(format!("Unknown negotiated KEX algorithm: {}", name))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::Sha256Digest;

    #[test]
    fn test_kex_state_round_trip() {
        for state in [
            KexState::Unknown,
            KexState::Init,
            KexState::Run,
            KexState::Keys,
            KexState::Done,
        ] {
            assert_eq!(KexState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_derive_keys_distinct_per_letter() {
        let mut digest = Sha256Digest::default();
        let k = [0x11u8; 32];
        let h = [0x22u8; 32];
        let keys = derive_keys(&mut digest, &k, &h, &h).unwrap();

        assert_eq!(keys.iv_c2s.len(), 32);
        assert_ne!(keys.iv_c2s, keys.iv_s2c);
        assert_ne!(keys.enc_c2s, keys.enc_s2c);
        assert_ne!(keys.mac_c2s, keys.mac_s2c);
        assert_ne!(keys.enc_c2s, keys.iv_c2s);
    }

    #[test]
    fn test_derive_keys_deterministic() {
        let k = [0x33u8; 16];
        let h = [0x44u8; 32];

        let mut d1 = Sha256Digest::default();
        let mut d2 = Sha256Digest::default();
        let a = derive_keys(&mut d1, &k, &h, &h).unwrap();
        let b = derive_keys(&mut d2, &k, &h, &h).unwrap();
        assert_eq!(a.enc_c2s, b.enc_c2s);
        assert_eq!(a.mac_s2c, b.mac_s2c);
    }

    #[test]
    fn test_resize_key_extends_and_preserves_prefix() {
        let mut digest = Sha256Digest::default();
        let k = [0x55u8; 16];
        let h = [0x66u8; 32];
        let short = vec![0xaau8; 32];

        let long = resize_key(&mut digest, short.clone(), 64, &k, &h);
        assert!(long.len() >= 64);
        assert_eq!(&long[..32], &short[..]);

        // Already long enough: unchanged.
        let same = resize_key(&mut digest, short.clone(), 16, &k, &h);
        assert_eq!(same, short);
    }

    #[test]
    fn test_create_kex_unknown_name() {
        let factories: Vec<std::sync::Arc<dyn KexFactory>> = Vec::new();
        let result = create_kex(&factories, "curve25519-sha256");
        assert!(matches!(result, Err(SkiffError::KeyExchange(_))));
    }
}
