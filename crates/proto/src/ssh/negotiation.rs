//! Algorithm negotiation (RFC 4253 Section 7.1).
//!
//! Each peer offers an ordered, comma-separated name-list for ten slots in
//! its `SSH_MSG_KEXINIT`. For every slot the negotiated value is the first
//! client candidate that also appears in the server's list (client
//! preference wins). Failing to agree on a cryptographic slot is fatal;
//! failing to agree on a language slot is not, and yields the empty string.
//!
//! The raw KEXINIT payloads of both sides (`I_C`, `I_S`) are retained by
//! the session because the key exchange hashes them verbatim.

use crate::ssh::buffer::Buffer;
use crate::ssh::crypto::Random;
use crate::ssh::message::{MessageType, MSG_KEX_COOKIE_SIZE};
use skiff_platform::{SkiffError, SkiffResult};

/// The ten KEXINIT negotiation slots, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProposalSlot {
    /// kex_algorithms
    KexAlgorithms,
    /// server_host_key_algorithms
    ServerHostKey,
    /// encryption_algorithms_client_to_server
    CipherClientToServer,
    /// encryption_algorithms_server_to_client
    CipherServerToClient,
    /// mac_algorithms_client_to_server
    MacClientToServer,
    /// mac_algorithms_server_to_client
    MacServerToClient,
    /// compression_algorithms_client_to_server
    CompressionClientToServer,
    /// compression_algorithms_server_to_client
    CompressionServerToClient,
    /// languages_client_to_server
    LanguageClientToServer,
    /// languages_server_to_client
    LanguageServerToClient,
}

impl ProposalSlot {
    /// All slots in wire order.
    pub const ALL: [ProposalSlot; 10] = [
        ProposalSlot::KexAlgorithms,
        ProposalSlot::ServerHostKey,
        ProposalSlot::CipherClientToServer,
        ProposalSlot::CipherServerToClient,
        ProposalSlot::MacClientToServer,
        ProposalSlot::MacServerToClient,
        ProposalSlot::CompressionClientToServer,
        ProposalSlot::CompressionServerToClient,
        ProposalSlot::LanguageClientToServer,
        ProposalSlot::LanguageServerToClient,
    ];

    /// Human-readable slot name for diagnostics.
    pub fn description(&self) -> &'static str {
        match self {
            ProposalSlot::KexAlgorithms => "kex algorithms",
            ProposalSlot::ServerHostKey => "server host key algorithms",
            ProposalSlot::CipherClientToServer => "encryption algorithms (client to server)",
            ProposalSlot::CipherServerToClient => "encryption algorithms (server to client)",
            ProposalSlot::MacClientToServer => "mac algorithms (client to server)",
            ProposalSlot::MacServerToClient => "mac algorithms (server to client)",
            ProposalSlot::CompressionClientToServer => "compression algorithms (client to server)",
            ProposalSlot::CompressionServerToClient => "compression algorithms (server to client)",
            ProposalSlot::LanguageClientToServer => "languages (client to server)",
            ProposalSlot::LanguageServerToClient => "languages (server to client)",
        }
    }

    /// Whether a failed agreement on this slot is tolerated.
    fn is_language(&self) -> bool {
        matches!(
            self,
            ProposalSlot::LanguageClientToServer | ProposalSlot::LanguageServerToClient
        )
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// One side's name-lists for the ten slots, or the negotiated result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Proposal {
    values: [String; 10],
}

impl Proposal {
    /// Creates an empty proposal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value of a slot.
    pub fn get(&self, slot: ProposalSlot) -> &str {
        &self.values[slot.index()]
    }

    /// Sets the value of a slot.
    pub fn set(&mut self, slot: ProposalSlot, value: impl Into<String>) {
        self.values[slot.index()] = value.into();
    }
}

/// Builds the `SSH_MSG_KEXINIT` packet for a proposal.
///
/// The returned buffer is packet-prepared (header room reserved); its
/// readable region is the payload to retain for the exchange hash.
pub fn encode_kexinit(proposal: &Proposal, random: &mut dyn Random) -> Buffer {
    let mut buffer = Buffer::packet(MessageType::KexInit as u8);

    let mut cookie = [0u8; MSG_KEX_COOKIE_SIZE];
    random.fill(&mut cookie);
    buffer.put_raw(&cookie);

    for slot in ProposalSlot::ALL {
        buffer.put_string(proposal.get(slot));
    }

    buffer.put_bool(false); // first_kex_packet_follows
    buffer.put_u32(0); // reserved
    buffer
}

/// Parses a received `SSH_MSG_KEXINIT` body.
///
/// The buffer's read position must be just past the opcode byte. Returns
/// the remote proposal together with the reassembled payload (opcode
/// included), which the key exchange needs verbatim.
pub fn decode_kexinit(buffer: &mut Buffer) -> SkiffResult<(Proposal, Vec<u8>)> {
    let mut payload = Vec::with_capacity(buffer.available() + 1);
    payload.push(MessageType::KexInit as u8);
    payload.extend_from_slice(buffer.readable());

    let cookie = buffer.get_raw(MSG_KEX_COOKIE_SIZE)?;
    tracing::trace!(cookie_len = cookie.len(), "Received KEXINIT cookie");

    let mut proposal = Proposal::new();
    for slot in ProposalSlot::ALL {
        let value = buffer.get_string()?;
        tracing::trace!(slot = slot.description(), %value, "Received KEXINIT slot");
        proposal.set(slot, value);
    }

    let first_kex_packet_follows = buffer.get_bool()?;
    if first_kex_packet_follows {
        tracing::debug!("Peer signalled first_kex_packet_follows");
    }
    let reserved = buffer.get_u32()?;
    if reserved != 0 {
        tracing::trace!(reserved, "Non-zero reserved value in KEXINIT");
    }

    Ok((proposal, payload))
}

/// Picks the first of `preferences` that also occurs in `offers`.
///
/// Both arguments are comma-separated name-lists; the empty name matches
/// the empty name, so two empty lists agree on `""`.
pub fn pick_first_common(preferences: &str, offers: &str) -> Option<String> {
    preferences
        .split(',')
        .find(|candidate| offers.split(',').any(|offer| offer == *candidate))
        .map(String::from)
}

/// Computes the negotiated algorithms from the two proposals.
///
/// # Errors
///
/// Returns [`SkiffError::KeyExchange`] when a non-language slot has no
/// common algorithm.
pub fn negotiate(client: &Proposal, server: &Proposal) -> SkiffResult<Proposal> {
    let mut result = Proposal::new();
    for slot in ProposalSlot::ALL {
        let client_list = client.get(slot);
        let server_list = server.get(slot);
        match pick_first_common(client_list, server_list) {
            Some(value) => {
                tracing::trace!(slot = slot.description(), %value, "Negotiated");
                result.set(slot, value);
            }
            None if slot.is_language() => {
                tracing::trace!(slot = slot.description(), "No common language, ignoring");
                result.set(slot, "");
            }
            None => {
                return Err(SkiffError::KeyExchange(format!(
                    "Unable to negotiate {} (client: {} / server: {})",
                    slot.description(),
                    client_list,
                    server_list
                )));
            }
        }
    }

    tracing::debug!(
        cipher_c2s = result.get(ProposalSlot::CipherClientToServer),
        cipher_s2c = result.get(ProposalSlot::CipherServerToClient),
        mac_c2s = result.get(ProposalSlot::MacClientToServer),
        mac_s2c = result.get(ProposalSlot::MacServerToClient),
        kex = result.get(ProposalSlot::KexAlgorithms),
        "Kex negotiation complete"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRandom;

    impl Random for FixedRandom {
        fn fill(&mut self, dest: &mut [u8]) {
            dest.fill(0x5a);
        }
    }

    fn sample_proposal() -> Proposal {
        let mut proposal = Proposal::new();
        proposal.set(ProposalSlot::KexAlgorithms, "curve25519-sha256");
        proposal.set(ProposalSlot::ServerHostKey, "ssh-ed25519");
        proposal.set(ProposalSlot::CipherClientToServer, "aes128-ctr,aes256-ctr");
        proposal.set(ProposalSlot::CipherServerToClient, "aes128-ctr,aes256-ctr");
        proposal.set(ProposalSlot::MacClientToServer, "hmac-sha2-256");
        proposal.set(ProposalSlot::MacServerToClient, "hmac-sha2-256");
        proposal.set(ProposalSlot::CompressionClientToServer, "none");
        proposal.set(ProposalSlot::CompressionServerToClient, "none");
        proposal.set(ProposalSlot::LanguageClientToServer, "");
        proposal.set(ProposalSlot::LanguageServerToClient, "");
        proposal
    }

    #[test]
    fn test_kexinit_round_trip() {
        let proposal = sample_proposal();
        let mut buffer = encode_kexinit(&proposal, &mut FixedRandom);

        // Strip the opcode the dispatcher would have consumed.
        assert_eq!(buffer.get_u8().unwrap(), MessageType::KexInit as u8);
        let (parsed, payload) = decode_kexinit(&mut buffer).unwrap();

        assert_eq!(parsed, proposal);
        assert_eq!(payload[0], MessageType::KexInit as u8);
        // opcode + cookie + lists + flag + reserved
        assert!(payload.len() > 1 + MSG_KEX_COOKIE_SIZE + 5);
        assert_eq!(buffer.available(), 0);
    }

    #[test]
    fn test_pick_first_common_client_preference() {
        let picked = pick_first_common("aes128-ctr,aes256-ctr", "aes256-ctr,aes128-ctr");
        assert_eq!(picked.as_deref(), Some("aes128-ctr"));
    }

    #[test]
    fn test_pick_first_common_no_overlap() {
        assert_eq!(pick_first_common("a,b", "c,d"), None);
    }

    #[test]
    fn test_negotiate_client_preference_wins() {
        let mut client = sample_proposal();
        client.set(ProposalSlot::CipherClientToServer, "aes128-ctr,aes256-ctr");
        let mut server = sample_proposal();
        server.set(ProposalSlot::CipherClientToServer, "aes256-ctr,aes128-ctr");

        let result = negotiate(&client, &server).unwrap();
        assert_eq!(result.get(ProposalSlot::CipherClientToServer), "aes128-ctr");
    }

    #[test]
    fn test_negotiate_empty_languages_tolerated() {
        let client = sample_proposal();
        let server = sample_proposal();

        let result = negotiate(&client, &server).unwrap();
        assert_eq!(result.get(ProposalSlot::LanguageClientToServer), "");
        assert_eq!(result.get(ProposalSlot::LanguageServerToClient), "");
    }

    #[test]
    fn test_negotiate_cipher_mismatch_is_fatal() {
        let mut client = sample_proposal();
        client.set(ProposalSlot::CipherClientToServer, "aes128-ctr");
        let mut server = sample_proposal();
        server.set(ProposalSlot::CipherClientToServer, "aes256-ctr");

        let result = negotiate(&client, &server);
        assert!(matches!(result, Err(SkiffError::KeyExchange(_))));
    }

    #[test]
    fn test_decode_kexinit_truncated() {
        let mut buffer = Buffer::from_vec(vec![0u8; 10]);
        assert!(decode_kexinit(&mut buffer).is_err());
    }
}
