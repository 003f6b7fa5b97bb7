//! SSH identification exchange (RFC 4253 Section 4.2).
//!
//! Each side opens the connection with an identification line:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! The server's first line must be its banner; a server may also send
//! arbitrary pre-banner text, so the client side skips lines until one
//! starts with `SSH-`.
//!
//! # Limits
//!
//! - Each line is at most 255 bytes (DoS prevention)
//! - The client scans at most 16 KiB of pre-banner text
//! - A CR must be followed by LF
//!
//! Violating any limit is a fatal protocol error.

use crate::ssh::buffer::Buffer;
use skiff_platform::{SkiffError, SkiffResult};

/// Identification prefix every SSH-2 banner starts with.
pub const VERSION_PREFIX: &str = "SSH-2.0-";

/// Maximum length of a single identification line.
pub const MAX_IDENT_LINE_LENGTH: usize = 255;

/// Maximum number of bytes scanned for the banner, pre-banner text included.
pub const MAX_IDENT_SCAN_LENGTH: usize = 16 * 1024;

/// SSH identification string.
///
/// Holds the software version and optional comments of one peer's banner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    software_version: String,
    comments: Option<String>,
}

impl Version {
    /// Creates an identification string with protocol version 2.0.
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Returns the default Skiff identification.
    pub fn default_skiff() -> Self {
        Self::new(&format!("Skiff_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an identification line (without the trailing CR LF).
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] if the line does not start with
    /// `SSH-2.0-` or `SSH-1.99-`, is too long, or contains a null byte.
    pub fn parse(line: &str) -> SkiffResult<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() > MAX_IDENT_LINE_LENGTH {
            return Err(SkiffError::Protocol(format!(
                "Identification too long: {} bytes (max {})",
                line.len(),
                MAX_IDENT_LINE_LENGTH
            )));
        }
        if line.contains('\0') {
            return Err(SkiffError::Protocol(
                "Identification contains null byte".to_string(),
            ));
        }

        let rest = line
            .strip_prefix("SSH-2.0-")
            .or_else(|| line.strip_prefix("SSH-1.99-"))
            .ok_or_else(|| {
                SkiffError::Protocol(format!("Unsupported identification: '{}'", line))
            })?;

        let (software_version, comments) = match rest.find(' ') {
            Some(pos) => (rest[..pos].to_string(), Some(rest[pos + 1..].to_string())),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            software_version,
            comments,
        })
    }

    /// Returns the software version (e.g. `OpenSSH_8.9`).
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Returns the banner line including the trailing CR LF.
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", VERSION_PREFIX, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// Reads the peer identification line from the accumulation buffer.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete line;
/// the read position is restored so the caller can retry once more bytes
/// arrive. On success the consumed bytes stay consumed and the banner line
/// (without line ending) is returned.
///
/// The server accepts the first line as the client's banner; the client
/// skips pre-banner lines until one starts with `SSH-`.
///
/// # Errors
///
/// Returns [`SkiffError::Protocol`] on a bare CR, an overlong line, or more
/// than 16 KiB of pre-banner text.
pub fn read_identification(buffer: &mut Buffer, server: bool) -> SkiffResult<Option<String>> {
    loop {
        let line_start = buffer.rpos();
        let mut line = Vec::with_capacity(64);
        let mut need_lf = false;
        loop {
            if buffer.available() == 0 {
                // Partial line: rewind and wait for more data.
                buffer.set_rpos(line_start);
                return Ok(None);
            }
            let b = buffer.get_u8()?;
            if b == b'\r' {
                need_lf = true;
                continue;
            }
            if b == b'\n' {
                break;
            }
            if need_lf {
                return Err(SkiffError::Protocol(
                    "Incorrect identification: bad line ending".to_string(),
                ));
            }
            if line.len() >= MAX_IDENT_LINE_LENGTH {
                return Err(SkiffError::Protocol(
                    "Incorrect identification: line too long".to_string(),
                ));
            }
            line.push(b);
        }

        let line = String::from_utf8(line).map_err(|_| {
            SkiffError::Protocol("Incorrect identification: invalid UTF-8".to_string())
        })?;
        if server || line.starts_with("SSH-") {
            return Ok(Some(line));
        }
        if buffer.rpos() > MAX_IDENT_SCAN_LENGTH {
            return Err(SkiffError::Protocol(
                "Incorrect identification: too many header lines".to_string(),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_of(text: &str) -> Buffer {
        Buffer::from_vec(text.as_bytes().to_vec())
    }

    #[test]
    fn test_version_display() {
        let version = Version::new("Skiff_0.1.0", None);
        assert_eq!(version.to_string(), "SSH-2.0-Skiff_0.1.0");

        let version = Version::new("Skiff_0.1.0", Some("portable"));
        assert_eq!(version.to_string(), "SSH-2.0-Skiff_0.1.0 portable");
    }

    #[test]
    fn test_version_parse() {
        let version = Version::parse("SSH-2.0-OpenSSH_8.9 Ubuntu-3ubuntu0.1\r\n").unwrap();
        assert_eq!(version.software(), "OpenSSH_8.9");
        assert_eq!(version.comments(), Some("Ubuntu-3ubuntu0.1"));
    }

    #[test]
    fn test_version_parse_rejects_ssh1() {
        assert!(Version::parse("SSH-1.5-OldClient").is_err());
    }

    #[test]
    fn test_version_wire_format() {
        let version = Version::new("Skiff_0.1.0", None);
        assert_eq!(version.to_wire_format(), b"SSH-2.0-Skiff_0.1.0\r\n");
    }

    #[test]
    fn test_read_identification_server_takes_first_line() {
        let mut buffer = buffer_of("SSH-2.0-Client_1.0\r\n");
        let line = read_identification(&mut buffer, true).unwrap();
        assert_eq!(line.as_deref(), Some("SSH-2.0-Client_1.0"));
        assert_eq!(buffer.available(), 0);
    }

    #[test]
    fn test_read_identification_client_skips_prebanner() {
        let mut buffer = buffer_of("hello world\r\nSSH-2.0-Foo_1.0\r\n");
        let line = read_identification(&mut buffer, false).unwrap();
        assert_eq!(line.as_deref(), Some("SSH-2.0-Foo_1.0"));
        // Exactly the two lines were consumed.
        assert_eq!(buffer.available(), 0);
    }

    #[test]
    fn test_read_identification_partial_line_rewinds() {
        let mut buffer = buffer_of("SSH-2.0-Trunc");
        assert!(read_identification(&mut buffer, true).unwrap().is_none());
        assert_eq!(buffer.rpos(), 0);

        buffer.put_raw(b"ated\r\n");
        let line = read_identification(&mut buffer, true).unwrap();
        assert_eq!(line.as_deref(), Some("SSH-2.0-Truncated"));
    }

    #[test]
    fn test_read_identification_bare_cr_is_fatal() {
        let mut buffer = buffer_of("SSH-2.0-Bad\rX\n");
        assert!(read_identification(&mut buffer, true).is_err());
    }

    #[test]
    fn test_read_identification_line_too_long() {
        let long = format!("{}\r\n", "x".repeat(MAX_IDENT_LINE_LENGTH + 1));
        let mut buffer = buffer_of(&long);
        assert!(read_identification(&mut buffer, true).is_err());
    }

    #[test]
    fn test_read_identification_scan_limit() {
        let mut text = String::new();
        while text.len() <= MAX_IDENT_SCAN_LENGTH {
            text.push_str("noise line\r\n");
        }
        text.push_str("SSH-2.0-Late\r\n");
        let mut buffer = buffer_of(&text);
        assert!(read_identification(&mut buffer, false).is_err());
    }
}
