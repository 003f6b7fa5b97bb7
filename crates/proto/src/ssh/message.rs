//! SSH protocol message numbers and disconnect reasons (RFC 4253).
//!
//! The transport layer dispatches on the raw opcode byte; [`MessageType`]
//! names the opcodes this crate knows about, and the `SSH_MSG_KEX_FIRST` /
//! `SSH_MSG_KEX_LAST` range bounds the method-specific key exchange
//! messages that are forwarded to the running [`KeyExchange`] instance.
//!
//! [`KeyExchange`]: crate::ssh::kex::KeyExchange

use skiff_platform::SkiffError;

/// First method-specific key exchange opcode (RFC 4253 Section 12).
pub const SSH_MSG_KEX_FIRST: u8 = 30;

/// Last method-specific key exchange opcode.
///
/// Opcodes at or below this value belong to the transport layer; anything
/// above it is queued while a key exchange is in progress.
pub const SSH_MSG_KEX_LAST: u8 = 49;

/// Size of the random cookie in an `SSH_MSG_KEXINIT` payload.
pub const MSG_KEX_COOKIE_SIZE: usize = 16;

/// SSH message types handled by the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - discarded on receipt.
    Ignore = 2,
    /// Unimplemented message - response to an unknown message type.
    Unimplemented = 3,
    /// Debug message.
    Debug = 4,
    /// Service request (e.g. "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept.
    ServiceAccept = 6,
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - swap to the freshly derived ciphers and MACs.
    NewKeys = 21,
}

impl MessageType {
    /// Converts an opcode byte to a message type, if it is one the
    /// transport layer handles directly.
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(MessageType::Disconnect),
            2 => Some(MessageType::Ignore),
            3 => Some(MessageType::Unimplemented),
            4 => Some(MessageType::Debug),
            5 => Some(MessageType::ServiceRequest),
            6 => Some(MessageType::ServiceAccept),
            20 => Some(MessageType::KexInit),
            21 => Some(MessageType::NewKeys),
            _ => None,
        }
    }

    /// Returns the RFC message name.
    pub fn name(&self) -> &'static str {
        match self {
            MessageType::Disconnect => "SSH_MSG_DISCONNECT",
            MessageType::Ignore => "SSH_MSG_IGNORE",
            MessageType::Unimplemented => "SSH_MSG_UNIMPLEMENTED",
            MessageType::Debug => "SSH_MSG_DEBUG",
            MessageType::ServiceRequest => "SSH_MSG_SERVICE_REQUEST",
            MessageType::ServiceAccept => "SSH_MSG_SERVICE_ACCEPT",
            MessageType::KexInit => "SSH_MSG_KEXINIT",
            MessageType::NewKeys => "SSH_MSG_NEWKEYS",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
pub mod disconnect {
    /// SSH_DISCONNECT_HOST_NOT_ALLOWED_TO_CONNECT
    pub const HOST_NOT_ALLOWED_TO_CONNECT: u32 = 1;
    /// SSH_DISCONNECT_PROTOCOL_ERROR
    pub const PROTOCOL_ERROR: u32 = 2;
    /// SSH_DISCONNECT_KEY_EXCHANGE_FAILED
    pub const KEY_EXCHANGE_FAILED: u32 = 3;
    /// SSH_DISCONNECT_RESERVED
    pub const RESERVED: u32 = 4;
    /// SSH_DISCONNECT_MAC_ERROR
    pub const MAC_ERROR: u32 = 5;
    /// SSH_DISCONNECT_COMPRESSION_ERROR
    pub const COMPRESSION_ERROR: u32 = 6;
    /// SSH_DISCONNECT_SERVICE_NOT_AVAILABLE
    pub const SERVICE_NOT_AVAILABLE: u32 = 7;
    /// SSH_DISCONNECT_PROTOCOL_VERSION_NOT_SUPPORTED
    pub const PROTOCOL_VERSION_NOT_SUPPORTED: u32 = 8;
    /// SSH_DISCONNECT_HOST_KEY_NOT_VERIFIABLE
    pub const HOST_KEY_NOT_VERIFIABLE: u32 = 9;
    /// SSH_DISCONNECT_CONNECTION_LOST
    pub const CONNECTION_LOST: u32 = 10;
    /// SSH_DISCONNECT_BY_APPLICATION
    pub const BY_APPLICATION: u32 = 11;
    /// SSH_DISCONNECT_TOO_MANY_CONNECTIONS
    pub const TOO_MANY_CONNECTIONS: u32 = 12;
    /// SSH_DISCONNECT_AUTH_CANCELLED_BY_USER
    pub const AUTH_CANCELLED_BY_USER: u32 = 13;
    /// SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE
    pub const NO_MORE_AUTH_METHODS_AVAILABLE: u32 = 14;
    /// SSH_DISCONNECT_ILLEGAL_USER_NAME
    pub const ILLEGAL_USER_NAME: u32 = 15;
}

/// Maps an error to the disconnect reason code to send before closing.
///
/// Returns `None` for errors that must not produce a disconnect packet
/// (I/O failures, operations after close).
pub fn disconnect_code(err: &SkiffError) -> Option<u32> {
    match err {
        SkiffError::Protocol(_) | SkiffError::Timeout(_) => Some(disconnect::PROTOCOL_ERROR),
        SkiffError::Mac(_) => Some(disconnect::MAC_ERROR),
        SkiffError::KeyExchange(_) => Some(disconnect::KEY_EXCHANGE_FAILED),
        SkiffError::HostKeyUnverifiable(_) => Some(disconnect::HOST_KEY_NOT_VERIFIABLE),
        SkiffError::ServiceNotAvailable(_) => Some(disconnect::SERVICE_NOT_AVAILABLE),
        SkiffError::Io(_) | SkiffError::Config(_) | SkiffError::Closed(_) | SkiffError::Other(_) => {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_conversion() {
        assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
        assert_eq!(MessageType::from_u8(21), Some(MessageType::NewKeys));
        assert_eq!(MessageType::from_u8(94), None);
    }

    #[test]
    fn test_message_type_display() {
        assert_eq!(format!("{}", MessageType::KexInit), "SSH_MSG_KEXINIT(20)");
    }

    #[test]
    fn test_kex_opcode_range() {
        assert!(SSH_MSG_KEX_FIRST <= SSH_MSG_KEX_LAST);
        assert!((MessageType::NewKeys as u8) < SSH_MSG_KEX_FIRST);
    }

    #[test]
    fn test_disconnect_code_mapping() {
        assert_eq!(
            disconnect_code(&SkiffError::Protocol("bad length".into())),
            Some(disconnect::PROTOCOL_ERROR)
        );
        assert_eq!(
            disconnect_code(&SkiffError::Mac("mismatch".into())),
            Some(disconnect::MAC_ERROR)
        );
        assert_eq!(
            disconnect_code(&SkiffError::KeyExchange("no common cipher".into())),
            Some(disconnect::KEY_EXCHANGE_FAILED)
        );
        assert_eq!(
            disconnect_code(&SkiffError::ServiceNotAvailable("bogus".into())),
            Some(disconnect::SERVICE_NOT_AVAILABLE)
        );
        assert_eq!(disconnect_code(&SkiffError::Closed("closing".into())), None);
    }
}
