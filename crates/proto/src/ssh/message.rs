//! SSH protocol message numbers and transport-generic messages (RFC 4253).
//!
//! # Message Categories
//!
//! - **Transport Layer Generic** (1-19): Disconnect, ignore, debug
//! - **Algorithm Negotiation** (20-29): Key exchange initialization
//! - **Key Exchange Method** (30-49): Method-specific messages
//! - **User Authentication** (50-79): Passed through to the auth layer
//! - **Connection Protocol** (80-127): Channel management
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::message::MessageType;
//!
//! let msg_type = MessageType::KexInit;
//! assert_eq!(msg_type as u8, 20);
//! assert!(MessageType::is_kex_message(31));
//! ```

use super::wire::{read_string, read_u32, read_u8, write_string};
use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};

/// SSH message types as defined in RFC 4253 Section 12 and RFC 4254 Section 9.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    // Transport layer generic (1-19)
    /// Disconnect message - terminates the connection.
    Disconnect = 1,
    /// Ignore message - can be used for padding or keep-alive.
    Ignore = 2,
    /// Unimplemented message - response to unknown message type.
    Unimplemented = 3,
    /// Debug message - debugging information.
    Debug = 4,
    /// Service request - request a service (e.g., "ssh-userauth").
    ServiceRequest = 5,
    /// Service accept - service request accepted.
    ServiceAccept = 6,

    // Algorithm negotiation (20-29)
    /// Key exchange init - algorithm negotiation.
    KexInit = 20,
    /// New keys - signals transition to new keys.
    NewKeys = 21,

    // Key exchange method specific (30-49)
    /// ECDH key exchange init.
    KexEcdhInit = 30,
    /// ECDH key exchange reply.
    KexEcdhReply = 31,

    // Connection protocol generic (80-127)
    /// Global request.
    GlobalRequest = 80,
    /// Request success.
    RequestSuccess = 81,
    /// Request failure.
    RequestFailure = 82,
    /// Channel open.
    ChannelOpen = 90,
    /// Channel open confirmation.
    ChannelOpenConfirmation = 91,
    /// Channel open failure.
    ChannelOpenFailure = 92,
    /// Channel window adjust.
    ChannelWindowAdjust = 93,
    /// Channel data.
    ChannelData = 94,
    /// Channel extended data (stderr).
    ChannelExtendedData = 95,
    /// Channel EOF.
    ChannelEof = 96,
    /// Channel close.
    ChannelClose = 97,
    /// Channel request.
    ChannelRequest = 98,
    /// Channel success.
    ChannelSuccess = 99,
    /// Channel failure.
    ChannelFailure = 100,
}

impl MessageType {
    /// Converts a byte to a message type.
    ///
    /// Authentication messages (50-79) are not modelled here and yield `None`.
    ///
    /// ```rust
    /// use skiff_proto::ssh::message::MessageType;
    ///
    /// assert_eq!(MessageType::from_u8(20), Some(MessageType::KexInit));
    /// assert_eq!(MessageType::from_u8(255), None);
    /// ```
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
            30 => Some(MessageType::KexEcdhInit),
            31 => Some(MessageType::KexEcdhReply),
            80 => Some(MessageType::GlobalRequest),
            81 => Some(MessageType::RequestSuccess),
            82 => Some(MessageType::RequestFailure),
            90 => Some(MessageType::ChannelOpen),
            91 => Some(MessageType::ChannelOpenConfirmation),
            92 => Some(MessageType::ChannelOpenFailure),
            93 => Some(MessageType::ChannelWindowAdjust),
            94 => Some(MessageType::ChannelData),
            95 => Some(MessageType::ChannelExtendedData),
            96 => Some(MessageType::ChannelEof),
            97 => Some(MessageType::ChannelClose),
            98 => Some(MessageType::ChannelRequest),
            99 => Some(MessageType::ChannelSuccess),
            100 => Some(MessageType::ChannelFailure),
            _ => None,
        }
    }

    /// Returns the message type name.
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
            MessageType::KexEcdhInit => "SSH_MSG_KEX_ECDH_INIT",
            MessageType::KexEcdhReply => "SSH_MSG_KEX_ECDH_REPLY",
            MessageType::GlobalRequest => "SSH_MSG_GLOBAL_REQUEST",
            MessageType::RequestSuccess => "SSH_MSG_REQUEST_SUCCESS",
            MessageType::RequestFailure => "SSH_MSG_REQUEST_FAILURE",
            MessageType::ChannelOpen => "SSH_MSG_CHANNEL_OPEN",
            MessageType::ChannelOpenConfirmation => "SSH_MSG_CHANNEL_OPEN_CONFIRMATION",
            MessageType::ChannelOpenFailure => "SSH_MSG_CHANNEL_OPEN_FAILURE",
            MessageType::ChannelWindowAdjust => "SSH_MSG_CHANNEL_WINDOW_ADJUST",
            MessageType::ChannelData => "SSH_MSG_CHANNEL_DATA",
            MessageType::ChannelExtendedData => "SSH_MSG_CHANNEL_EXTENDED_DATA",
            MessageType::ChannelEof => "SSH_MSG_CHANNEL_EOF",
            MessageType::ChannelClose => "SSH_MSG_CHANNEL_CLOSE",
            MessageType::ChannelRequest => "SSH_MSG_CHANNEL_REQUEST",
            MessageType::ChannelSuccess => "SSH_MSG_CHANNEL_SUCCESS",
            MessageType::ChannelFailure => "SSH_MSG_CHANNEL_FAILURE",
        }
    }

    /// True for transport-generic messages (1-4) that may flow at any time.
    pub fn is_transport_generic(byte: u8) -> bool {
        (1..=4).contains(&byte)
    }

    /// True for key exchange messages (20-49).
    pub fn is_kex_message(byte: u8) -> bool {
        (20..=49).contains(&byte)
    }

    /// True for kex-method-specific messages (30-49).
    pub fn is_kex_method_message(byte: u8) -> bool {
        (30..=49).contains(&byte)
    }

    /// True for connection-protocol messages (80-127).
    pub fn is_connection_message(byte: u8) -> bool {
        (80..=127).contains(&byte)
    }

    /// True for messages that require an established session: anything that
    /// is neither transport-generic nor key exchange.
    pub fn is_application_message(byte: u8) -> bool {
        !Self::is_transport_generic(byte) && !Self::is_kex_message(byte)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name(), *self as u8)
    }
}

/// Disconnect reason codes (RFC 4253 Section 11.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DisconnectReason {
    /// SSH_DISCONNECT_HOST_NOT_ALLOWED_TO_CONNECT
    HostNotAllowedToConnect = 1,
    /// SSH_DISCONNECT_PROTOCOL_ERROR
    ProtocolError = 2,
    /// SSH_DISCONNECT_KEY_EXCHANGE_FAILED
    KeyExchangeFailed = 3,
    /// SSH_DISCONNECT_RESERVED
    Reserved = 4,
    /// SSH_DISCONNECT_MAC_ERROR
    MacError = 5,
    /// SSH_DISCONNECT_COMPRESSION_ERROR
    CompressionError = 6,
    /// SSH_DISCONNECT_SERVICE_NOT_AVAILABLE
    ServiceNotAvailable = 7,
    /// SSH_DISCONNECT_PROTOCOL_VERSION_NOT_SUPPORTED
    ProtocolVersionNotSupported = 8,
    /// SSH_DISCONNECT_HOST_KEY_NOT_VERIFIABLE
    HostKeyNotVerifiable = 9,
    /// SSH_DISCONNECT_CONNECTION_LOST
    ConnectionLost = 10,
    /// SSH_DISCONNECT_BY_APPLICATION
    ByApplication = 11,
    /// SSH_DISCONNECT_TOO_MANY_CONNECTIONS
    TooManyConnections = 12,
    /// SSH_DISCONNECT_AUTH_CANCELLED_BY_USER
    AuthCancelledByUser = 13,
    /// SSH_DISCONNECT_NO_MORE_AUTH_METHODS_AVAILABLE
    NoMoreAuthMethodsAvailable = 14,
    /// SSH_DISCONNECT_ILLEGAL_USER_NAME
    IllegalUserName = 15,
}

impl DisconnectReason {
    /// Converts a wire code to a reason. Unknown codes yield `None`.
    pub fn from_u32(code: u32) -> Option<Self> {
        use DisconnectReason::*;
        Some(match code {
            1 => HostNotAllowedToConnect,
            2 => ProtocolError,
            3 => KeyExchangeFailed,
            4 => Reserved,
            5 => MacError,
            6 => CompressionError,
            7 => ServiceNotAvailable,
            8 => ProtocolVersionNotSupported,
            9 => HostKeyNotVerifiable,
            10 => ConnectionLost,
            11 => ByApplication,
            12 => TooManyConnections,
            13 => AuthCancelledByUser,
            14 => NoMoreAuthMethodsAvailable,
            15 => IllegalUserName,
            _ => return None,
        })
    }
}

/// SSH_MSG_DISCONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason code (see [`DisconnectReason`])
    pub reason_code: u32,
    /// Human readable description
    pub description: String,
    /// Language tag
    pub language: String,
}

impl Disconnect {
    /// Creates a disconnect message.
    pub fn new(reason: DisconnectReason, description: impl Into<String>) -> Self {
        Self {
            reason_code: reason as u32,
            description: description.into(),
            language: String::new(),
        }
    }

    /// Serializes to payload bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Disconnect as u8);
        buf.put_u32(self.reason_code);
        write_string(&mut buf, &self.description);
        write_string(&mut buf, &self.language);
        buf.to_vec()
    }

    /// Parses from payload bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::Disconnect)?;
        let reason_code = read_u32(data, &mut offset)?;
        let description = read_string(data, &mut offset)?;
        // Some peers omit the language tag.
        let language = read_string(data, &mut offset).unwrap_or_default();
        Ok(Self {
            reason_code,
            description,
            language,
        })
    }
}

/// SSH_MSG_UNIMPLEMENTED, carrying the rejected packet's sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unimplemented {
    /// Sequence number of the packet that was not understood
    pub sequence_number: u32,
}

impl Unimplemented {
    /// Serializes to payload bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(MessageType::Unimplemented as u8);
        buf.put_u32(self.sequence_number);
        buf.to_vec()
    }

    /// Parses from payload bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::Unimplemented)?;
        Ok(Self {
            sequence_number: read_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_DEBUG.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebugMessage {
    /// Whether the peer asked for the message to be shown
    pub always_display: bool,
    /// Message text
    pub message: String,
}

impl DebugMessage {
    /// Parses from payload bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::Debug)?;
        let always_display = read_u8(data, &mut offset)? != 0;
        let message = read_string(data, &mut offset)?;
        Ok(Self {
            always_display,
            message,
        })
    }
}

/// Consumes the message number byte and checks it.
pub(crate) fn expect_type(
    data: &[u8],
    offset: &mut usize,
    expected: MessageType,
) -> SkiffResult<()> {
    let msg_type = read_u8(data, offset)?;
    if msg_type != expected as u8 {
        return Err(SkiffError::Protocol(format!(
            "Expected {}, got message type {}",
            expected, msg_type
        )));
    }
    Ok(())
}
