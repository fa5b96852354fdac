//! Error types for skiff

use std::fmt;

/// SSH disconnect reason: protocol error (RFC 4253 Section 11.1).
pub const DISCONNECT_PROTOCOL_ERROR: u32 = 2;

/// SSH disconnect reason: MAC error (RFC 4253 Section 11.1).
pub const DISCONNECT_MAC_ERROR: u32 = 5;

/// SSH disconnect reason: connection lost (RFC 4253 Section 11.1).
pub const DISCONNECT_CONNECTION_LOST: u32 = 10;

/// Unified error type for all skiff operations.
///
/// Errors fall into three scopes:
///
/// - **Transport fatal** (`Protocol`, `Security`): the connection is torn down
///   with a DISCONNECT carrying [`SkiffError::disconnect_reason`].
/// - **Channel scoped** (`Channel`, `Rejected`, `Resource`): only the affected
///   channel or request fails; the transport keeps running.
/// - **Operational** (`Io`, `Disconnected`, `Config`): surfaced to the caller.
///   Timeouts are reported as `Io` with [`std::io::ErrorKind::TimedOut`].
#[derive(Debug)]
pub enum SkiffError {
    /// I/O error, including timeouts
    Io(std::io::Error),

    /// Configuration error
    Config(String),

    /// Protocol violation by the peer, or malformed wire data
    Protocol(String),

    /// Integrity or cryptographic failure (MAC/tag mismatch, bad signature)
    Security(String),

    /// Channel-scoped failure that does not affect the transport
    Channel(String),

    /// Typed refusal from the peer (e.g. channel open failure)
    Rejected {
        /// Reason code sent by the peer
        code: u32,
        /// Human readable description sent by the peer
        message: String,
    },

    /// A bounded resource (channel ids, queue space) is exhausted
    Resource(String),

    /// The transport has been torn down
    Disconnected(String),

    /// Other error
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl SkiffError {
    /// Builds an I/O timeout error with the given description.
    pub fn timeout(what: impl Into<String>) -> Self {
        SkiffError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            what.into(),
        ))
    }

    /// Returns true if this error must terminate the transport.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SkiffError::Protocol(_) | SkiffError::Security(_))
    }

    /// Returns true if this error is an I/O timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SkiffError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut)
    }

    /// Disconnect reason code to send when this error ends the connection.
    pub fn disconnect_reason(&self) -> u32 {
        match self {
            SkiffError::Security(_) => DISCONNECT_MAC_ERROR,
            SkiffError::Io(_) | SkiffError::Disconnected(_) => DISCONNECT_CONNECTION_LOST,
            _ => DISCONNECT_PROTOCOL_ERROR,
        }
    }
}

impl fmt::Display for SkiffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkiffError::Io(e) => write!(f, "IO error: {}", e),
            SkiffError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SkiffError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            SkiffError::Security(msg) => write!(f, "Security error: {}", msg),
            SkiffError::Channel(msg) => write!(f, "Channel error: {}", msg),
            SkiffError::Rejected { code, message } => {
                write!(f, "Rejected by peer ({}): {}", code, message)
            }
            SkiffError::Resource(msg) => write!(f, "Resource exhausted: {}", msg),
            SkiffError::Disconnected(msg) => write!(f, "Disconnected: {}", msg),
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

/// Result type for skiff operations
pub type SkiffResult<T> = Result<T, SkiffError>;
