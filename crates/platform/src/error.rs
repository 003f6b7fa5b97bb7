//! Error types for Skiff

use std::fmt;

/// Unified error type for all Skiff operations
#[derive(Debug)]
pub enum SkiffError {
    /// I/O error
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol error (malformed framing, bad identification, invalid state)
    Protocol(String),

    /// Message authentication failure
    Mac(String),

    /// Key exchange failure (no common algorithm, bad exchange data)
    KeyExchange(String),

    /// No usable host key signature algorithm
    HostKeyUnverifiable(String),

    /// Requested service is not available
    ServiceNotAvailable(String),

    /// Authentication or idle timeout expired
    Timeout(String),

    /// Operation issued after the session started closing
    Closed(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for SkiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkiffError::Io(e) => write!(f, "IO error: {}", e),
            SkiffError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SkiffError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SkiffError::Mac(msg) => write!(f, "MAC error: {}", msg),
            SkiffError::KeyExchange(msg) => write!(f, "Key exchange error: {}", msg),
            SkiffError::HostKeyUnverifiable(msg) => write!(f, "Host key error: {}", msg),
            SkiffError::ServiceNotAvailable(msg) => write!(f, "Service not available: {}", msg),
            SkiffError::Timeout(msg) => write!(f, "Timeout: {}", msg),
            SkiffError::Closed(msg) => write!(f, "Session closed: {}", msg),
            SkiffError::Other(e) => write!(f, "Error: {}", e),
        }
    }
}

impl std::error::Error for SkiffError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SkiffError::Io(e) => Some(e),
            SkiffError::Other(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SkiffError {
    fn from(err: std::io::Error) -> Self {
        SkiffError::Io(err)
    }
}

/// Result type for Skiff operations
pub type SkiffResult<T> = Result<T, SkiffError>;
