//! SSH connection protocol messages (RFC 4254).
//!
//! Wire formats for channel and global-request messages:
//! - Channel open / confirmation / failure
//! - Window adjust, data, extended data, EOF, close
//! - Channel requests and their replies
//! - Global requests and their replies
//!
//! [`ConnectionMessage::parse`] decodes any payload in the 80-100 range so
//! the multiplexer can dispatch on a single enum.
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::connection::{ChannelKind, ChannelOpen};
//!
//! let open = ChannelOpen::new(ChannelKind::Session, 0, 1048576, 32768);
//! let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
//! assert_eq!(parsed, open);
//! ```

use super::message::{expect_type, MessageType};
use super::wire::{
    read_bool, read_bytes, read_rest, read_string, read_u32, read_u8, write_bool, write_bytes,
    write_string,
};
use bytes::{BufMut, BytesMut};
use skiff_platform::{SkiffError, SkiffResult};

/// Smallest packet size or window a peer may announce for a channel.
pub const MIN_CHANNEL_PACKET_SIZE: u32 = 4096;

/// Channel kind (RFC 4254 Sections 6.1, 6.3.2 and 7.2).
///
/// Kinds this crate does not know arrive as [`ChannelKind::Unknown`] so
/// they can be refused with UNKNOWN_CHANNEL_TYPE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// Session channel (shell, exec, subsystem).
    Session,
    /// Direct TCP/IP channel (local port forwarding).
    DirectTcpip {
        /// Host to connect to
        host: String,
        /// Port to connect to
        port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// Forwarded TCP/IP channel (remote port forwarding).
    ForwardedTcpip {
        /// Connected address
        connected_address: String,
        /// Connected port
        connected_port: u32,
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// X11 channel.
    X11 {
        /// Originator IP address
        originator_address: String,
        /// Originator port
        originator_port: u32,
    },
    /// A kind this crate cannot open.
    Unknown {
        /// Type name as sent by the peer
        name: String,
    },
}

impl ChannelKind {
    /// Returns the channel type name.
    pub fn name(&self) -> &str {
        match self {
            ChannelKind::Session => "session",
            ChannelKind::DirectTcpip { .. } => "direct-tcpip",
            ChannelKind::ForwardedTcpip { .. } => "forwarded-tcpip",
            ChannelKind::X11 { .. } => "x11",
            ChannelKind::Unknown { name } => name,
        }
    }

    fn write_data(&self, buf: &mut BytesMut) {
        match self {
            ChannelKind::Session | ChannelKind::Unknown { .. } => {}
            ChannelKind::DirectTcpip {
                host,
                port,
                originator_address,
                originator_port,
            } => {
                write_string(buf, host);
                buf.put_u32(*port);
                write_string(buf, originator_address);
                buf.put_u32(*originator_port);
            }
            ChannelKind::ForwardedTcpip {
                connected_address,
                connected_port,
                originator_address,
                originator_port,
            } => {
                write_string(buf, connected_address);
                buf.put_u32(*connected_port);
                write_string(buf, originator_address);
                buf.put_u32(*originator_port);
            }
            ChannelKind::X11 {
                originator_address,
                originator_port,
            } => {
                write_string(buf, originator_address);
                buf.put_u32(*originator_port);
            }
        }
    }

    fn read_data(name: String, data: &[u8], offset: &mut usize) -> SkiffResult<Self> {
        Ok(match name.as_str() {
            "session" => ChannelKind::Session,
            "direct-tcpip" => ChannelKind::DirectTcpip {
                host: read_string(data, offset)?,
                port: read_u32(data, offset)?,
                originator_address: read_string(data, offset)?,
                originator_port: read_u32(data, offset)?,
            },
            "forwarded-tcpip" => ChannelKind::ForwardedTcpip {
                connected_address: read_string(data, offset)?,
                connected_port: read_u32(data, offset)?,
                originator_address: read_string(data, offset)?,
                originator_port: read_u32(data, offset)?,
            },
            "x11" => ChannelKind::X11 {
                originator_address: read_string(data, offset)?,
                originator_port: read_u32(data, offset)?,
            },
            _ => ChannelKind::Unknown { name },
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpen {
    /// Channel kind and its type-specific data
    pub kind: ChannelKind,
    /// Sender channel number
    pub sender_channel: u32,
    /// Initial window size
    pub initial_window_size: u32,
    /// Maximum packet size
    pub maximum_packet_size: u32,
}

impl ChannelOpen {
    /// Creates a new channel open message.
    pub fn new(
        kind: ChannelKind,
        sender_channel: u32,
        initial_window_size: u32,
        maximum_packet_size: u32,
    ) -> Self {
        Self {
            kind,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        }
    }

    /// Serializes to bytes.
    ///
    /// Format (RFC 4254 Section 5.1):
    /// ```text
    /// byte      SSH_MSG_CHANNEL_OPEN (90)
    /// string    channel type
    /// uint32    sender channel
    /// uint32    initial window size
    /// uint32    maximum packet size
    /// ....      channel type specific data
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpen as u8);
        write_string(&mut buf, self.kind.name());
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        self.kind.write_data(&mut buf);
        buf.to_vec()
    }

    /// Parses from bytes. Unknown channel types parse successfully.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::ChannelOpen)?;

        let type_name = read_string(data, &mut offset)?;
        let sender_channel = read_u32(data, &mut offset)?;
        let initial_window_size = read_u32(data, &mut offset)?;
        let maximum_packet_size = read_u32(data, &mut offset)?;
        let kind = ChannelKind::read_data(type_name, data, &mut offset)?;

        Ok(Self {
            kind,
            sender_channel,
            initial_window_size,
            maximum_packet_size,
        })
    }
}

/// SSH_MSG_CHANNEL_OPEN_CONFIRMATION message (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOpenConfirmation {
    /// Recipient channel number (the opener's id)
    pub recipient_channel: u32,
    /// Sender channel number (our id)
    pub sender_channel: u32,
    /// Initial window size
    pub initial_window_size: u32,
    /// Maximum packet size
    pub maximum_packet_size: u32,
}

impl ChannelOpenConfirmation {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(17);
        buf.put_u8(MessageType::ChannelOpenConfirmation as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.sender_channel);
        buf.put_u32(self.initial_window_size);
        buf.put_u32(self.maximum_packet_size);
        buf.to_vec()
    }

    /// Parses from bytes. Type-specific trailing data is ignored.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::ChannelOpenConfirmation)?;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            sender_channel: read_u32(data, &mut offset)?,
            initial_window_size: read_u32(data, &mut offset)?,
            maximum_packet_size: read_u32(data, &mut offset)?,
        })
    }
}

/// Channel open failure reason codes (RFC 4254 Section 5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChannelOpenFailureReason {
    /// Administratively prohibited
    AdministrativelyProhibited = 1,
    /// Connect failed
    ConnectFailed = 2,
    /// Unknown channel type
    UnknownChannelType = 3,
    /// Resource shortage
    ResourceShortage = 4,
}

impl ChannelOpenFailureReason {
    /// Converts from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::AdministrativelyProhibited),
            2 => Some(Self::ConnectFailed),
            3 => Some(Self::UnknownChannelType),
            4 => Some(Self::ResourceShortage),
            _ => None,
        }
    }

    /// Returns the reason as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdministrativelyProhibited => "Administratively prohibited",
            Self::ConnectFailed => "Connect failed",
            Self::UnknownChannelType => "Unknown channel type",
            Self::ResourceShortage => "Resource shortage",
        }
    }
}

/// SSH_MSG_CHANNEL_OPEN_FAILURE message (RFC 4254 Section 5.1).
///
/// The reason code is kept as sent; codes outside 1-4 are legal on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenFailure {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Reason code
    pub reason_code: u32,
    /// Description
    pub description: String,
    /// Language tag
    pub language_tag: String,
}

impl ChannelOpenFailure {
    /// Creates a failure with the reason's standard description.
    pub fn new(recipient_channel: u32, reason: ChannelOpenFailureReason) -> Self {
        Self::with_description(recipient_channel, reason, reason.as_str())
    }

    /// Creates a failure with a custom description.
    pub fn with_description(
        recipient_channel: u32,
        reason: ChannelOpenFailureReason,
        description: impl Into<String>,
    ) -> Self {
        Self {
            recipient_channel,
            reason_code: reason as u32,
            description: description.into(),
            language_tag: String::new(),
        }
    }

    /// The reason, if it is one of the standard codes.
    pub fn reason(&self) -> Option<ChannelOpenFailureReason> {
        ChannelOpenFailureReason::from_u32(self.reason_code)
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelOpenFailure as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.reason_code);
        write_string(&mut buf, &self.description);
        write_string(&mut buf, &self.language_tag);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::ChannelOpenFailure)?;
        let recipient_channel = read_u32(data, &mut offset)?;
        let reason_code = read_u32(data, &mut offset)?;
        let description = read_string(data, &mut offset)?;
        let language_tag = read_string(data, &mut offset).unwrap_or_default();
        Ok(Self {
            recipient_channel,
            reason_code,
            description,
            language_tag,
        })
    }
}

/// SSH_MSG_CHANNEL_WINDOW_ADJUST message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelWindowAdjust {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Bytes to add to window
    pub bytes_to_add: u32,
}

impl ChannelWindowAdjust {
    /// Creates a new window adjust message.
    pub fn new(recipient_channel: u32, bytes_to_add: u32) -> Self {
        Self {
            recipient_channel,
            bytes_to_add,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9);
        buf.put_u8(MessageType::ChannelWindowAdjust as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.bytes_to_add);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::ChannelWindowAdjust)?;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            bytes_to_add: read_u32(data, &mut offset)?,
        })
    }
}

/// SSH_MSG_CHANNEL_DATA message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Data
    pub data: Vec<u8>,
}

impl ChannelData {
    /// Creates a new data message.
    pub fn new(recipient_channel: u32, data: Vec<u8>) -> Self {
        Self {
            recipient_channel,
            data,
        }
    }

    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(9 + self.data.len());
        buf.put_u8(MessageType::ChannelData as u8);
        buf.put_u32(self.recipient_channel);
        write_bytes(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::ChannelData)?;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            data: read_bytes(data, &mut offset)?,
        })
    }
}

/// Extended data type code for stderr.
pub const EXTENDED_DATA_STDERR: u32 = 1;

/// SSH_MSG_CHANNEL_EXTENDED_DATA message (RFC 4254 Section 5.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelExtendedData {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Data type code (1 = stderr)
    pub data_type_code: u32,
    /// Data
    pub data: Vec<u8>,
}

impl ChannelExtendedData {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(13 + self.data.len());
        buf.put_u8(MessageType::ChannelExtendedData as u8);
        buf.put_u32(self.recipient_channel);
        buf.put_u32(self.data_type_code);
        write_bytes(&mut buf, &self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::ChannelExtendedData)?;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            data_type_code: read_u32(data, &mut offset)?,
            data: read_bytes(data, &mut offset)?,
        })
    }
}

fn channel_only(msg_type: MessageType, recipient_channel: u32) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(msg_type as u8);
    buf.put_u32(recipient_channel);
    buf.to_vec()
}

fn parse_channel_only(data: &[u8], msg_type: MessageType) -> SkiffResult<u32> {
    let mut offset = 0;
    expect_type(data, &mut offset, msg_type)?;
    read_u32(data, &mut offset)
}

/// SSH_MSG_CHANNEL_EOF message (RFC 4254 Section 5.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelEof {
    /// Recipient channel number
    pub recipient_channel: u32,
}

impl ChannelEof {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        channel_only(MessageType::ChannelEof, self.recipient_channel)
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        Ok(Self {
            recipient_channel: parse_channel_only(data, MessageType::ChannelEof)?,
        })
    }
}

/// SSH_MSG_CHANNEL_CLOSE message (RFC 4254 Section 5.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClose {
    /// Recipient channel number
    pub recipient_channel: u32,
}

impl ChannelClose {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        channel_only(MessageType::ChannelClose, self.recipient_channel)
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        Ok(Self {
            recipient_channel: parse_channel_only(data, MessageType::ChannelClose)?,
        })
    }
}

/// SSH_MSG_CHANNEL_REQUEST message (RFC 4254 Section 5.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// Request name
    pub name: String,
    /// Want reply flag
    pub want_reply: bool,
    /// Request-specific data
    pub data: Vec<u8>,
}

impl ChannelRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::ChannelRequest as u8);
        buf.put_u32(self.recipient_channel);
        write_string(&mut buf, &self.name);
        write_bool(&mut buf, self.want_reply);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::ChannelRequest)?;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            name: read_string(data, &mut offset)?,
            want_reply: read_bool(data, &mut offset)?,
            data: read_rest(data, &mut offset),
        })
    }
}

/// SSH_MSG_CHANNEL_SUCCESS (99) or SSH_MSG_CHANNEL_FAILURE (100).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelReply {
    /// Recipient channel number
    pub recipient_channel: u32,
    /// True for SUCCESS
    pub success: bool,
}

impl ChannelReply {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let msg_type = if self.success {
            MessageType::ChannelSuccess
        } else {
            MessageType::ChannelFailure
        };
        channel_only(msg_type, self.recipient_channel)
    }

    /// Parses either reply.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let success = match data.first() {
            Some(&b) if b == MessageType::ChannelSuccess as u8 => true,
            Some(&b) if b == MessageType::ChannelFailure as u8 => false,
            _ => {
                return Err(SkiffError::Protocol(
                    "Expected SSH_MSG_CHANNEL_SUCCESS or SSH_MSG_CHANNEL_FAILURE".to_string(),
                ))
            }
        };
        let mut offset = 1;
        Ok(Self {
            recipient_channel: read_u32(data, &mut offset)?,
            success,
        })
    }
}

/// SSH_MSG_GLOBAL_REQUEST message (RFC 4254 Section 4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalRequest {
    /// Request name
    pub name: String,
    /// Want reply flag
    pub want_reply: bool,
    /// Request-specific data
    pub data: Vec<u8>,
}

impl GlobalRequest {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::GlobalRequest as u8);
        write_string(&mut buf, &self.name);
        write_bool(&mut buf, self.want_reply);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    /// Parses from bytes.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        expect_type(data, &mut offset, MessageType::GlobalRequest)?;
        Ok(Self {
            name: read_string(data, &mut offset)?,
            want_reply: read_bool(data, &mut offset)?,
            data: read_rest(data, &mut offset),
        })
    }
}

/// SSH_MSG_REQUEST_SUCCESS (81) or SSH_MSG_REQUEST_FAILURE (82).
///
/// A success may carry response data (e.g. the bound port of a
/// `tcpip-forward` with port 0).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalReply {
    /// True for SUCCESS
    pub success: bool,
    /// Response-specific data
    pub data: Vec<u8>,
}

impl GlobalReply {
    /// Serializes to bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(1 + self.data.len());
        if self.success {
            buf.put_u8(MessageType::RequestSuccess as u8);
            buf.put_slice(&self.data);
        } else {
            buf.put_u8(MessageType::RequestFailure as u8);
        }
        buf.to_vec()
    }

    /// Parses either reply.
    pub fn from_bytes(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        let msg_type = read_u8(data, &mut offset)?;
        if msg_type == MessageType::RequestSuccess as u8 {
            Ok(Self {
                success: true,
                data: read_rest(data, &mut offset),
            })
        } else if msg_type == MessageType::RequestFailure as u8 {
            Ok(Self {
                success: false,
                data: Vec::new(),
            })
        } else {
            Err(SkiffError::Protocol(format!(
                "Expected SSH_MSG_REQUEST_SUCCESS or SSH_MSG_REQUEST_FAILURE, got {}",
                msg_type
            )))
        }
    }
}

/// `tcpip-forward` / `cancel-tcpip-forward` request data (RFC 4254 Section 7.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpipForward {
    /// Address to bind
    pub address: String,
    /// Port to bind (0 = let the server choose)
    pub port: u32,
}

impl TcpipForward {
    /// Encodes the request data.
    pub fn to_data(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        write_string(&mut buf, &self.address);
        buf.put_u32(self.port);
        buf.to_vec()
    }

    /// Decodes the request data.
    pub fn from_data(data: &[u8]) -> SkiffResult<Self> {
        let mut offset = 0;
        Ok(Self {
            address: read_string(data, &mut offset)?,
            port: read_u32(data, &mut offset)?,
        })
    }
}

/// Any connection-layer message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMessage {
    /// 80
    GlobalRequest(GlobalRequest),
    /// 81 / 82
    GlobalReply(GlobalReply),
    /// 90
    Open(ChannelOpen),
    /// 91
    OpenConfirmation(ChannelOpenConfirmation),
    /// 92
    OpenFailure(ChannelOpenFailure),
    /// 93
    WindowAdjust(ChannelWindowAdjust),
    /// 94
    Data(ChannelData),
    /// 95
    ExtendedData(ChannelExtendedData),
    /// 96
    Eof(ChannelEof),
    /// 97
    Close(ChannelClose),
    /// 98
    Request(ChannelRequest),
    /// 99 / 100
    Reply(ChannelReply),
}

impl ConnectionMessage {
    /// Decodes a payload; `Ok(None)` for message numbers outside 80-100.
    pub fn parse(payload: &[u8]) -> SkiffResult<Option<Self>> {
        let msg_type = match payload.first().copied().and_then(MessageType::from_u8) {
            Some(t) => t,
            None => return Ok(None),
        };
        Ok(Some(match msg_type {
            MessageType::GlobalRequest => Self::GlobalRequest(GlobalRequest::from_bytes(payload)?),
            MessageType::RequestSuccess | MessageType::RequestFailure => {
                Self::GlobalReply(GlobalReply::from_bytes(payload)?)
            }
            MessageType::ChannelOpen => Self::Open(ChannelOpen::from_bytes(payload)?),
            MessageType::ChannelOpenConfirmation => {
                Self::OpenConfirmation(ChannelOpenConfirmation::from_bytes(payload)?)
            }
            MessageType::ChannelOpenFailure => {
                Self::OpenFailure(ChannelOpenFailure::from_bytes(payload)?)
            }
            MessageType::ChannelWindowAdjust => {
                Self::WindowAdjust(ChannelWindowAdjust::from_bytes(payload)?)
            }
            MessageType::ChannelData => Self::Data(ChannelData::from_bytes(payload)?),
            MessageType::ChannelExtendedData => {
                Self::ExtendedData(ChannelExtendedData::from_bytes(payload)?)
            }
            MessageType::ChannelEof => Self::Eof(ChannelEof::from_bytes(payload)?),
            MessageType::ChannelClose => Self::Close(ChannelClose::from_bytes(payload)?),
            MessageType::ChannelRequest => Self::Request(ChannelRequest::from_bytes(payload)?),
            MessageType::ChannelSuccess | MessageType::ChannelFailure => {
                Self::Reply(ChannelReply::from_bytes(payload)?)
            }
            _ => return Ok(None),
        }))
    }

    /// The local channel id the message is addressed to, if any.
    pub fn recipient_channel(&self) -> Option<u32> {
        match self {
            Self::OpenConfirmation(m) => Some(m.recipient_channel),
            Self::OpenFailure(m) => Some(m.recipient_channel),
            Self::WindowAdjust(m) => Some(m.recipient_channel),
            Self::Data(m) => Some(m.recipient_channel),
            Self::ExtendedData(m) => Some(m.recipient_channel),
            Self::Eof(m) => Some(m.recipient_channel),
            Self::Close(m) => Some(m.recipient_channel),
            Self::Request(m) => Some(m.recipient_channel),
            Self::Reply(m) => Some(m.recipient_channel),
            Self::GlobalRequest(_) | Self::GlobalReply(_) | Self::Open(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_open_kinds() {
        for kind in [
            ChannelKind::Session,
            ChannelKind::DirectTcpip {
                host: "localhost".to_string(),
                port: 80,
                originator_address: "127.0.0.1".to_string(),
                originator_port: 12345,
            },
            ChannelKind::X11 {
                originator_address: "10.0.0.2".to_string(),
                originator_port: 6010,
            },
        ] {
            let open = ChannelOpen::new(kind, 3, 2 * 1024 * 1024, 32768);
            assert_eq!(ChannelOpen::from_bytes(&open.to_bytes()).unwrap(), open);
        }
    }

    #[test]
    fn test_channel_open_unknown_kind_parses() {
        let mut buf = BytesMut::new();
        buf.put_u8(90);
        write_string(&mut buf, "auth-agent@openssh.com");
        buf.put_u32(7);
        buf.put_u32(65536);
        buf.put_u32(16384);

        let open = ChannelOpen::from_bytes(&buf).unwrap();
        assert_eq!(open.sender_channel, 7);
        assert_eq!(
            open.kind,
            ChannelKind::Unknown {
                name: "auth-agent@openssh.com".to_string()
            }
        );
    }

    #[test]
    fn test_open_failure_keeps_reason_code() {
        let failure = ChannelOpenFailure::new(4, ChannelOpenFailureReason::ResourceShortage);
        let parsed = ChannelOpenFailure::from_bytes(&failure.to_bytes()).unwrap();
        assert_eq!(parsed.reason(), Some(ChannelOpenFailureReason::ResourceShortage));
        assert_eq!(parsed.description, "Resource shortage");
    }

    #[test]
    fn test_channel_data_wire_format() {
        let bytes = ChannelData::new(2, b"hi".to_vec()).to_bytes();
        assert_eq!(bytes, vec![94, 0, 0, 0, 2, 0, 0, 0, 2, b'h', b'i']);
    }

    #[test]
    fn test_channel_request_other_is_opaque() {
        let request = ChannelRequest {
            recipient_channel: 0,
            name: "keepalive@openssh.com".to_string(),
            want_reply: true,
            data: vec![],
        };
        let parsed = ChannelRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(parsed, request);

        let exec = ChannelRequest {
            recipient_channel: 1,
            name: "exec".to_string(),
            want_reply: false,
            data: vec![0, 0, 0, 2, b'l', b's'],
        };
        let parsed = ChannelRequest::from_bytes(&exec.to_bytes()).unwrap();
        assert_eq!(parsed.data, exec.data);
    }

    #[test]
    fn test_global_reply_carries_data_on_success_only() {
        let success = GlobalReply {
            success: true,
            data: vec![0, 0, 0x1f, 0x90],
        };
        assert_eq!(GlobalReply::from_bytes(&success.to_bytes()).unwrap(), success);

        let failure = GlobalReply {
            success: false,
            data: vec![1, 2, 3],
        };
        assert_eq!(failure.to_bytes(), vec![82]);
    }

    #[test]
    fn test_tcpip_forward_data() {
        let forward = TcpipForward {
            address: "0.0.0.0".to_string(),
            port: 8080,
        };
        let request = GlobalRequest {
            name: "tcpip-forward".to_string(),
            want_reply: true,
            data: forward.to_data(),
        };
        let parsed = GlobalRequest::from_bytes(&request.to_bytes()).unwrap();
        assert_eq!(TcpipForward::from_data(&parsed.data).unwrap(), forward);
    }

    #[test]
    fn test_connection_message_dispatch() {
        let adjust = ChannelWindowAdjust::new(5, 1000).to_bytes();
        match ConnectionMessage::parse(&adjust).unwrap() {
            Some(ConnectionMessage::WindowAdjust(m)) => assert_eq!(m.bytes_to_add, 1000),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            ConnectionMessage::parse(&ChannelClose { recipient_channel: 9 }.to_bytes())
                .unwrap()
                .and_then(|m| m.recipient_channel()),
            Some(9)
        );
        assert_eq!(ConnectionMessage::parse(&[50, 0]).unwrap(), None);
        assert!(ConnectionMessage::parse(&[94, 0, 0]).is_err());
    }
}
