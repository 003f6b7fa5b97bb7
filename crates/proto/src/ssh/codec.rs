//! Binary packet protocol codec (RFC 4253 Section 6).
//!
//! One [`Encoder`] and one [`Decoder`] per session, each serialized under
//! its own lock by the session core. The codec is purely synchronous: when
//! the decoder does not yet hold a complete packet it returns `None` and
//! waits for the next byte arrival.
//!
//! # Wire format
//!
//! ```text
//! uint32   packet_length          (excludes the MAC and itself)
//! byte     padding_length         (>= 4)
//! byte[n1] payload                n1 = packet_length - padding_length - 1
//! byte[n2] random padding         n2 = padding_length
//! byte[m]  MAC                    m = 0 before the first NEWKEYS
//! ```
//!
//! Integrity protection is the classical encrypt-and-MAC flavor: the MAC
//! is computed over `uint32 sequence_number || unencrypted packet` and
//! appended after the ciphertext, unencrypted.

use crate::ssh::buffer::{Buffer, PACKET_HEADER_LEN};
use crate::ssh::crypto::{mac, Cipher, Compression, Mac, Random};
use skiff_platform::{SkiffError, SkiffResult};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{trace, warn};

/// Smallest legal value of the `packet_length` field.
pub const MIN_PACKET_LENGTH: usize = 5;

/// Largest accepted value of the `packet_length` field (256 KiB).
pub const MAX_PACKET_LENGTH: usize = 256 * 1024;

/// Minimum cipher block size used for padding alignment.
pub const MIN_BLOCK_SIZE: usize = 8;

/// Per-direction packet and byte counters feeding the rekey triggers.
///
/// Reset when new keys are installed; sequence numbers live in the codec
/// halves and are not reset.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    packets: AtomicU64,
    bytes: AtomicU64,
}

impl TrafficCounters {
    /// Records one packet of `bytes` payload.
    pub fn record(&self, bytes: u64) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Total bytes since the last reset.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Total packets since the last reset.
    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    /// Zeroes both counters (new keys installed).
    pub fn reset(&self) {
        self.packets.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
    }
}

/// Outbound framing state: cipher, MAC, compression, egress sequence.
pub struct Encoder {
    cipher: Option<Box<dyn Cipher>>,
    block_size: usize,
    mac: Option<Box<dyn Mac>>,
    mac_buf: Vec<u8>,
    compression: Option<Box<dyn Compression>>,
    seq: u32,
    random: Box<dyn Random>,
}

impl Encoder {
    /// Creates a cleartext encoder (pre-KEX state).
    pub fn new(random: Box<dyn Random>) -> Self {
        Self {
            cipher: None,
            block_size: MIN_BLOCK_SIZE,
            mac: None,
            mac_buf: Vec::new(),
            compression: None,
            seq: 0,
            random,
        }
    }

    /// Current egress sequence number.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Installs freshly derived outbound algorithms.
    ///
    /// The sequence number deliberately continues; only the session's
    /// byte/packet counters restart.
    pub fn install(
        &mut self,
        cipher: Box<dyn Cipher>,
        mac_: Box<dyn Mac>,
        compression: Option<Box<dyn Compression>>,
    ) {
        self.block_size = cipher.block_size().max(MIN_BLOCK_SIZE);
        self.mac_buf = vec![0u8; mac_.size()];
        self.cipher = Some(cipher);
        self.mac = Some(mac_);
        self.compression = compression;
    }

    /// Encodes one packet in place.
    ///
    /// The buffer must be packet-prepared ([`Buffer::packet`]): its read
    /// position marks the payload start with [`PACKET_HEADER_LEN`] bytes of
    /// headroom in front; if the headroom is missing the payload is copied
    /// into a fresh buffer first. On return the buffer's readable region is
    /// the complete wire packet.
    pub fn encode(
        &mut self,
        buffer: &mut Buffer,
        authed: bool,
        counters: &TrafficCounters,
    ) -> SkiffResult<()> {
        if buffer.rpos() < PACKET_HEADER_LEN {
            warn!("Performance cost: packet buffer lacks the 5 byte header room");
            let mut fresh = Buffer::new();
            fresh.set_wpos(PACKET_HEADER_LEN);
            fresh.set_rpos(PACKET_HEADER_LEN);
            fresh.put_buffer(buffer);
            *buffer = fresh;
        }

        let off = buffer.rpos() - PACKET_HEADER_LEN;
        let mut payload_len = buffer.available();
        trace!(seq = self.seq, len = payload_len, "Sending packet");

        if let Some(compression) = &mut self.compression {
            if authed || !compression.is_delayed() {
                compression.compress(buffer)?;
                payload_len = buffer.available();
            }
        }

        let block = self.block_size;
        let rem = (payload_len + PACKET_HEADER_LEN) % block;
        let pad = block + (block - rem) % block;
        let packet_len = payload_len + pad + 1;

        // Header, then padding filled from the session PRNG.
        buffer.set_wpos(off);
        buffer.put_u32(packet_len as u32);
        buffer.put_u8(pad as u8);
        let pad_start = off + PACKET_HEADER_LEN + payload_len;
        buffer.set_wpos(pad_start + pad);
        self.random.fill(&mut buffer.array_mut()[pad_start..pad_start + pad]);

        let end = off + 4 + packet_len;
        if let Some(mac_) = &mut self.mac {
            mac_.update_u32(self.seq);
            mac_.update(&buffer.array()[off..end]);
            mac_.finalize_into(&mut self.mac_buf)?;
        }
        if let Some(cipher) = &mut self.cipher {
            cipher.process(&mut buffer.array_mut()[off..end])?;
        }
        if self.mac.is_some() {
            buffer.put_raw(&self.mac_buf);
        }

        self.seq = self.seq.wrapping_add(1);
        counters.record(packet_len as u64);
        buffer.set_rpos(off);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for enough bytes to decrypt the first block and read the
    /// length field.
    AwaitHeader,
    /// Length known; waiting for the full packet plus MAC.
    AwaitBody,
}

/// Inbound framing state: accumulation buffer, two-phase state machine,
/// cipher, MAC, compression, ingress sequence.
pub struct Decoder {
    buffer: Buffer,
    state: DecodeState,
    packet_length: usize,
    cipher: Option<Box<dyn Cipher>>,
    block_size: usize,
    mac: Option<Box<dyn Mac>>,
    mac_result: Vec<u8>,
    compression: Option<Box<dyn Compression>>,
    seq: u32,
}

impl Decoder {
    /// Creates a cleartext decoder (pre-KEX state).
    pub fn new() -> Self {
        Self {
            buffer: Buffer::new(),
            state: DecodeState::AwaitHeader,
            packet_length: 0,
            cipher: None,
            block_size: MIN_BLOCK_SIZE,
            mac: None,
            mac_result: Vec::new(),
            compression: None,
            seq: 0,
        }
    }

    /// Current ingress sequence number.
    pub fn seq(&self) -> u32 {
        self.seq
    }

    /// Appends received bytes to the accumulation buffer.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.put_raw(data);
    }

    /// Direct access to the accumulation buffer (identification reading
    /// happens on the same byte stream before packet framing starts).
    pub fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.buffer
    }

    /// Installs freshly derived inbound algorithms.
    pub fn install(
        &mut self,
        cipher: Box<dyn Cipher>,
        mac_: Box<dyn Mac>,
        compression: Option<Box<dyn Compression>>,
    ) {
        self.block_size = cipher.block_size().max(MIN_BLOCK_SIZE);
        self.mac_result = vec![0u8; mac_.size()];
        self.cipher = Some(cipher);
        self.mac = Some(mac_);
        self.compression = compression;
    }

    /// Runs the decode state machine once.
    ///
    /// Returns the next decoded payload, or `None` when more bytes are
    /// needed. The returned buffer's read position is at the opcode byte.
    ///
    /// # Errors
    ///
    /// [`SkiffError::Protocol`] for an out-of-range length field and
    /// [`SkiffError::Mac`] for a MAC mismatch; both are fatal for the
    /// session.
    pub fn decode_step(
        &mut self,
        authed: bool,
        counters: &TrafficCounters,
    ) -> SkiffResult<Option<Buffer>> {
        if self.state == DecodeState::AwaitHeader {
            // The buffer was compacted after the previous packet.
            debug_assert_eq!(self.buffer.rpos(), 0);
            if self.buffer.available() <= self.block_size {
                return Ok(None);
            }
            let block_size = self.block_size;
            if let Some(cipher) = &mut self.cipher {
                cipher.process(&mut self.buffer.array_mut()[..block_size])?;
            }
            let length = self.buffer.get_u32()? as usize;
            if !(MIN_PACKET_LENGTH..=MAX_PACKET_LENGTH).contains(&length) {
                warn!(length, "Error decoding packet (invalid length)");
                return Err(SkiffError::Protocol(format!(
                    "Invalid packet length: {}",
                    length
                )));
            }
            // The sender pads to the block size, so a misaligned length can
            // only be garbage (or an attack).
            if (length + 4) % block_size != 0 {
                return Err(SkiffError::Protocol(format!(
                    "Invalid packet length: {} (not a multiple of the block size {})",
                    length, block_size
                )));
            }
            self.packet_length = length;
            self.state = DecodeState::AwaitBody;
        }

        let mac_size = self.mac.as_ref().map_or(0, |m| m.size());
        if self.buffer.available() < self.packet_length + mac_size {
            return Ok(None);
        }

        // Decrypt the remainder of the packet (the first block was already
        // processed while reading the length).
        let total = self.packet_length + 4;
        let block_size = self.block_size;
        if let Some(cipher) = &mut self.cipher {
            cipher.process(&mut self.buffer.array_mut()[block_size..total])?;
        }

        if let Some(mac_) = &mut self.mac {
            mac_.update_u32(self.seq);
            mac_.update(&self.buffer.array()[..total]);
            mac_.finalize_into(&mut self.mac_result)?;
            mac::verify(
                &self.mac_result,
                &self.buffer.array()[total..total + mac_size],
            )?;
        }
        self.seq = self.seq.wrapping_add(1);

        let pad = self.buffer.get_u8()? as usize;
        if pad + 1 > self.packet_length {
            return Err(SkiffError::Protocol(format!(
                "Invalid padding length: {} (packet length {})",
                pad, self.packet_length
            )));
        }
        let payload_end = total - pad;

        let mut packet = Buffer::new();
        let active_compression = match &mut self.compression {
            Some(compression) if authed || !compression.is_delayed() => Some(compression),
            _ => None,
        };
        if let Some(compression) = active_compression {
            let input = Buffer::from_vec(self.buffer.array()[PACKET_HEADER_LEN..payload_end].to_vec());
            compression.decompress(&input, &mut packet)?;
        } else {
            packet.put_raw(&self.buffer.array()[PACKET_HEADER_LEN..payload_end]);
        }

        trace!(
            seq = self.seq.wrapping_sub(1),
            len = packet.available(),
            "Received packet"
        );
        counters.record(packet.available() as u64);

        self.buffer.set_rpos(total + mac_size);
        self.buffer.compact();
        self.state = DecodeState::AwaitHeader;
        self.packet_length = 0;
        Ok(Some(packet))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::crypto::{CipherAlgorithm, CipherMode, CompressionAlgorithm, MacAlgorithm};

    struct FixedRandom;

    impl Random for FixedRandom {
        fn fill(&mut self, dest: &mut [u8]) {
            dest.fill(0xaa);
        }
    }

    fn encoder() -> Encoder {
        Encoder::new(Box::new(FixedRandom))
    }

    fn paired(cipher_alg: CipherAlgorithm, mac_alg: MacAlgorithm) -> (Encoder, Decoder) {
        let key = vec![0x42u8; 32];
        let iv = vec![0x24u8; 16];
        let mac_key = vec![0x77u8; 64];

        let mut enc = encoder();
        let mut out_cipher = cipher_alg.create();
        out_cipher
            .init(CipherMode::Encrypt, &key[..out_cipher.key_size()], &iv)
            .unwrap();
        let mut out_mac = mac_alg.create();
        out_mac.init(&mac_key).unwrap();
        enc.install(out_cipher, out_mac, None);

        let mut dec = Decoder::new();
        let mut in_cipher = cipher_alg.create();
        in_cipher
            .init(CipherMode::Decrypt, &key[..in_cipher.key_size()], &iv)
            .unwrap();
        let mut in_mac = mac_alg.create();
        in_mac.init(&mac_key).unwrap();
        dec.install(in_cipher, in_mac, None);

        (enc, dec)
    }

    fn payload_packet(payload: &[u8]) -> Buffer {
        let mut buffer = Buffer::packet(payload[0]);
        buffer.put_raw(&payload[1..]);
        buffer
    }

    #[test]
    fn test_cleartext_round_trip() {
        let mut enc = encoder();
        let mut dec = Decoder::new();
        let counters = TrafficCounters::default();

        let payload = b"\x02some ignored data";
        let mut buffer = payload_packet(payload);
        enc.encode(&mut buffer, false, &counters).unwrap();

        // Alignment: 8-byte blocks in the clear.
        assert_eq!(buffer.available() % 8, 0);

        dec.feed(buffer.readable());
        let packet = dec.decode_step(false, &counters).unwrap().unwrap();
        assert_eq!(packet.readable(), payload);

        assert_eq!(enc.seq(), 1);
        assert_eq!(dec.seq(), 1);
        assert_eq!(counters.packets(), 2);
    }

    #[test]
    fn test_encrypted_round_trip() {
        let (mut enc, mut dec) = paired(CipherAlgorithm::Aes128Ctr, MacAlgorithm::HmacSha256);
        let counters = TrafficCounters::default();

        for round in 0u8..3 {
            let payload = vec![50 + round; 100];
            let mut buffer = payload_packet(&payload);
            enc.encode(&mut buffer, false, &counters).unwrap();

            dec.feed(buffer.readable());
            let packet = dec.decode_step(false, &counters).unwrap().unwrap();
            assert_eq!(packet.readable(), &payload[..]);
        }
        assert_eq!(enc.seq(), 3);
        assert_eq!(dec.seq(), 3);
    }

    #[test]
    fn test_partial_packet_waits() {
        let mut enc = encoder();
        let mut dec = Decoder::new();
        let counters = TrafficCounters::default();

        let mut buffer = payload_packet(b"\x04\x00partial delivery test");
        enc.encode(&mut buffer, false, &counters).unwrap();
        let wire = buffer.to_payload();

        // Drip-feed: no packet until the last byte arrives.
        for &byte in &wire[..wire.len() - 1] {
            dec.feed(&[byte]);
            assert!(dec.decode_step(false, &counters).unwrap().is_none());
        }
        dec.feed(&wire[wire.len() - 1..]);
        assert!(dec.decode_step(false, &counters).unwrap().is_some());
        assert!(dec.decode_step(false, &counters).unwrap().is_none());
    }

    #[test]
    fn test_mac_bit_flip_detected() {
        let (mut enc, mut dec) = paired(CipherAlgorithm::Aes128Ctr, MacAlgorithm::HmacSha256);
        let counters = TrafficCounters::default();

        let payload = vec![94u8; 1024];
        let mut buffer = payload_packet(&payload);
        enc.encode(&mut buffer, false, &counters).unwrap();

        let mut wire = buffer.to_payload();
        wire[40] ^= 0x01; // inside the ciphertext, within the MAC-covered region
        dec.feed(&wire);

        let result = dec.decode_step(false, &counters);
        assert!(matches!(result, Err(SkiffError::Mac(_))));
    }

    #[test]
    fn test_length_bounds_rejected() {
        let counters = TrafficCounters::default();

        for bad_len in [0u32, 4, (MAX_PACKET_LENGTH as u32) + 1] {
            let mut dec = Decoder::new();
            let mut wire = bad_len.to_be_bytes().to_vec();
            wire.resize(16, 0);
            dec.feed(&wire);
            let result = dec.decode_step(false, &counters);
            assert!(
                matches!(result, Err(SkiffError::Protocol(_))),
                "length {} must be rejected",
                bad_len
            );
        }
    }

    #[test]
    fn test_padding_minimum() {
        let mut enc = encoder();
        let counters = TrafficCounters::default();

        for extra in 0..16 {
            let payload = vec![2u8; 1 + extra];
            let mut buffer = payload_packet(&payload);
            enc.encode(&mut buffer, false, &counters).unwrap();

            let mut wire = Buffer::from_vec(buffer.to_payload());
            let packet_len = wire.get_u32().unwrap() as usize;
            let pad = wire.get_u8().unwrap() as usize;
            assert!(pad >= 4, "padding {} below minimum", pad);
            assert_eq!((packet_len + 4) % 8, 0);
        }
    }

    #[test]
    fn test_compression_round_trip() {
        let counters = TrafficCounters::default();

        let mut enc = encoder();
        enc.compression = CompressionAlgorithm::Zlib.create();
        let mut dec = Decoder::new();
        dec.compression = CompressionAlgorithm::Zlib.create();

        let payload = [&[94u8][..], &vec![b'x'; 600][..]].concat();
        let mut buffer = payload_packet(&payload);
        enc.encode(&mut buffer, false, &counters).unwrap();
        assert!(buffer.available() < payload.len());

        dec.feed(buffer.readable());
        let packet = dec.decode_step(false, &counters).unwrap().unwrap();
        assert_eq!(packet.readable(), &payload[..]);
    }

    #[test]
    fn test_delayed_compression_waits_for_auth() {
        let counters = TrafficCounters::default();

        let mut enc = encoder();
        enc.compression = CompressionAlgorithm::ZlibDelayed.create();
        let mut dec = Decoder::new();
        dec.compression = CompressionAlgorithm::ZlibDelayed.create();

        // Not authenticated: payload travels uncompressed.
        let payload = [&[94u8][..], &vec![b'y'; 300][..]].concat();
        let mut buffer = payload_packet(&payload);
        enc.encode(&mut buffer, false, &counters).unwrap();
        assert!(buffer.available() > payload.len());

        dec.feed(buffer.readable());
        let packet = dec.decode_step(false, &counters).unwrap().unwrap();
        assert_eq!(packet.readable(), &payload[..]);

        // Authenticated: compression kicks in.
        let mut buffer = payload_packet(&payload);
        enc.encode(&mut buffer, true, &counters).unwrap();
        assert!(buffer.available() < payload.len());

        dec.feed(buffer.readable());
        let packet = dec.decode_step(true, &counters).unwrap().unwrap();
        assert_eq!(packet.readable(), &payload[..]);
    }

    #[test]
    fn test_missing_headroom_is_tolerated() {
        let mut enc = encoder();
        let mut dec = Decoder::new();
        let counters = TrafficCounters::default();

        // A buffer without the 5 byte header room.
        let mut buffer = Buffer::from_vec(b"\x02abc".to_vec());
        enc.encode(&mut buffer, false, &counters).unwrap();

        dec.feed(buffer.readable());
        let packet = dec.decode_step(false, &counters).unwrap().unwrap();
        assert_eq!(packet.readable(), b"\x02abc");
    }

    #[test]
    fn test_counters_reset() {
        let counters = TrafficCounters::default();
        counters.record(100);
        assert_eq!(counters.bytes(), 100);
        assert_eq!(counters.packets(), 1);
        counters.reset();
        assert_eq!(counters.bytes(), 0);
        assert_eq!(counters.packets(), 0);
    }
}
