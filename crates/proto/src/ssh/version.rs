//! SSH identification exchange (RFC 4253 Section 4.2).
//!
//! Both sides send an identification string before any binary packet:
//!
//! ```text
//! SSH-protoversion-softwareversion SP comments CR LF
//! ```
//!
//! # Security
//!
//! - Maximum line length: 255 characters including CR LF (DoS prevention)
//! - Must start with "SSH-2.0-" or "SSH-1.99-"
//! - No null bytes allowed in version string
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::version::{IdentificationReader, Version};
//!
//! let version = Version::new("Skiff_0.1.0", None);
//! assert_eq!(version.to_string(), "SSH-2.0-Skiff_0.1.0");
//!
//! let mut reader = IdentificationReader::new();
//! assert!(reader.feed(b"SSH-2.0-Open").unwrap().is_none());
//! let peer = reader.feed(b"SSH_8.9\r\n\x00\x00").unwrap().unwrap();
//! assert_eq!(peer.software(), "OpenSSH_8.9");
//! assert_eq!(reader.take_remaining(), vec![0, 0]);
//! ```

use skiff_platform::{SkiffError, SkiffResult};

/// Maximum length of SSH version string (RFC 4253 Section 4.2).
pub const MAX_VERSION_LENGTH: usize = 255;

/// SSH protocol version string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    /// Protocol version (e.g., "2.0")
    proto_version: String,
    /// Software version (e.g., "Skiff_0.1.0")
    software_version: String,
    /// Optional comments
    comments: Option<String>,
}

impl Version {
    /// Creates a new SSH version string with protocol version "2.0".
    ///
    /// ```rust
    /// use skiff_proto::ssh::version::Version;
    ///
    /// let version = Version::new("Skiff_0.1.0", Some("test"));
    /// assert_eq!(version.to_string(), "SSH-2.0-Skiff_0.1.0 test");
    /// ```
    pub fn new(software: &str, comments: Option<&str>) -> Self {
        Self {
            proto_version: "2.0".to_string(),
            software_version: software.to_string(),
            comments: comments.map(String::from),
        }
    }

    /// Returns the identification this crate sends by default.
    pub fn default_skiff() -> Self {
        Self::new(&format!("Skiff_{}", env!("CARGO_PKG_VERSION")), None)
    }

    /// Parses an SSH version string.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Protocol`] if:
    /// - Line is too long (> 255 characters)
    /// - Line doesn't start with "SSH-"
    /// - Protocol version is not "2.0" or "1.99"
    /// - Line contains null bytes
    pub fn parse(line: &str) -> SkiffResult<Self> {
        let line = line.trim_end_matches("\r\n").trim_end_matches('\n');

        if line.len() > MAX_VERSION_LENGTH {
            return Err(SkiffError::Protocol(format!(
                "Version string too long: {} bytes (max {})",
                line.len(),
                MAX_VERSION_LENGTH
            )));
        }

        if line.contains('\0') {
            return Err(SkiffError::Protocol(
                "Version string contains null byte".to_string(),
            ));
        }

        if !line.starts_with("SSH-") {
            return Err(SkiffError::Protocol(format!(
                "Invalid version string: must start with 'SSH-', got '{}'",
                line
            )));
        }

        let parts: Vec<&str> = line.splitn(3, '-').collect();
        if parts.len() < 3 {
            return Err(SkiffError::Protocol(format!(
                "Invalid version string format: '{}'",
                line
            )));
        }

        let proto_version = parts[1];
        let rest = parts[2];

        if proto_version != "2.0" && proto_version != "1.99" {
            return Err(SkiffError::Protocol(format!(
                "Unsupported protocol version: '{}' (expected '2.0' or '1.99')",
                proto_version
            )));
        }

        let (software_version, comments) = match rest.split_once(' ') {
            Some((software, comments)) => (software.to_string(), Some(comments.trim().to_string())),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            proto_version: proto_version.to_string(),
            software_version,
            comments,
        })
    }

    /// Returns the protocol version (e.g., "2.0").
    pub fn proto_version(&self) -> &str {
        &self.proto_version
    }

    /// Returns the software version.
    pub fn software(&self) -> &str {
        &self.software_version
    }

    /// Returns the comments, if any.
    pub fn comments(&self) -> Option<&str> {
        self.comments.as_deref()
    }

    /// Converts to wire format (with CR LF).
    pub fn to_wire_format(&self) -> Vec<u8> {
        format!("{}\r\n", self).into_bytes()
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SSH-{}-{}", self.proto_version, self.software_version)?;
        if let Some(comments) = &self.comments {
            write!(f, " {}", comments)?;
        }
        Ok(())
    }
}

/// The peer's identification as received, with the exact line kept for the
/// exchange hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identification {
    version: Version,
    raw: Vec<u8>,
}

impl Identification {
    /// Parsed version.
    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Software version of the peer.
    pub fn software(&self) -> &str {
        self.version.software()
    }

    /// The identification line without the trailing CR LF.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// Incremental reader for the peer's identification line.
///
/// Partial lines are buffered across calls. Bytes that follow the line in
/// the same read belong to the binary packet stream and are handed back by
/// [`IdentificationReader::take_remaining`].
#[derive(Debug, Default)]
pub struct IdentificationReader {
    buffer: Vec<u8>,
    remaining: Vec<u8>,
    done: bool,
}

impl IdentificationReader {
    /// Creates an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes; returns the identification once a full line is present.
    pub fn feed(&mut self, data: &[u8]) -> SkiffResult<Option<Identification>> {
        if self.done {
            self.remaining.extend_from_slice(data);
            return Ok(None);
        }

        let searched = self.buffer.len();
        self.buffer.extend_from_slice(data);

        let newline = match self.buffer[searched..].iter().position(|&b| b == b'\n') {
            Some(pos) => searched + pos,
            None => {
                if self.buffer.len() > MAX_VERSION_LENGTH {
                    return Err(SkiffError::Protocol(format!(
                        "Identification line exceeds {} bytes",
                        MAX_VERSION_LENGTH
                    )));
                }
                return Ok(None);
            }
        };

        if newline + 1 > MAX_VERSION_LENGTH {
            return Err(SkiffError::Protocol(format!(
                "Identification line exceeds {} bytes",
                MAX_VERSION_LENGTH
            )));
        }

        let mut line = self.buffer[..newline].to_vec();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        self.remaining = self.buffer.split_off(newline + 1);
        self.buffer.clear();
        self.done = true;

        let text = std::str::from_utf8(&line).map_err(|_| {
            SkiffError::Protocol("Identification line is not valid UTF-8".to_string())
        })?;
        if !(text.starts_with("SSH-2.0-") || text.starts_with("SSH-1.99-")) {
            return Err(SkiffError::Protocol(format!(
                "Unsupported identification: '{}'",
                text
            )));
        }
        let version = Version::parse(text)?;

        Ok(Some(Identification { version, raw: line }))
    }

    /// Returns true once the identification line has been consumed.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Takes the bytes received after the identification line.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.remaining)
    }
}
