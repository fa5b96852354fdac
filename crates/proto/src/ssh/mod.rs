//! SSH (Secure Shell) transport and connection layers.
//!
//! # Architecture
//!
//! The implementation is layered:
//!
//! 1. **Wire encoding** ([`wire`], [`message`], [`version`]) - RFC 4251 data types,
//!    transport messages and the identification line
//! 2. **Packet layer** ([`packet`]) - binary packet protocol with original,
//!    encrypt-then-MAC and AEAD framing (RFC 4253 Section 6)
//! 3. **Transport layer** ([`transport`], [`kex`], [`kex_ecdh`]) - key exchange,
//!    rekeying and the sans-IO [`TransportCodec`]
//! 4. **Connection layer** ([`connection`], [`multiplexer`], [`channel`]) - channels,
//!    flow-control windows and global requests (RFC 4254)
//! 5. **Session** ([`session`]) - drives a codec and multiplexer over any
//!    `AsyncRead + AsyncWrite` stream
//!
//! Algorithms are pluggable through the factories in [`algorithm`]; the
//! built-in set lives in [`crypto`], [`kex_ecdh`] and [`hostkey`].
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::ssh::{ChannelConfig, ChannelKind, ChannelOpen};
//!
//! let config = ChannelConfig::default();
//! let open = ChannelOpen::new(
//!     ChannelKind::Session,
//!     0,
//!     config.window_maximum,
//!     config.max_packet_size,
//! );
//! let parsed = ChannelOpen::from_bytes(&open.to_bytes()).unwrap();
//! assert_eq!(parsed.kind.name(), "session");
//! ```
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

pub mod algorithm;
pub mod cache;
pub mod channel;
pub mod config;
pub mod connection;
pub mod crypto;
pub mod hostkey;
pub mod kex;
pub mod kex_ecdh;
pub mod logging;
pub mod message;
pub mod multiplexer;
pub mod packet;
pub mod session;
mod sync;
pub mod transport;
pub mod version;
pub mod window;
pub mod wire;

// Re-export main types
pub use algorithm::{AlgorithmRegistry, HostKeySigner, HostKeyVerifier};
pub use cache::ReceiveCache;
pub use channel::{ChannelHandle, ChannelListener, ChannelState};
pub use config::{ChannelConfig, MultiplexerConfig};
pub use connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelKind, ChannelOpen,
    ChannelOpenConfirmation, ChannelOpenFailure, ChannelOpenFailureReason, ChannelReply,
    ChannelRequest, ChannelWindowAdjust, ConnectionMessage, GlobalReply,
    GlobalRequest, TcpipForward, EXTENDED_DATA_STDERR, MIN_CHANNEL_PACKET_SIZE,
};
pub use hostkey::{Ed25519HostKey, Ed25519Verifier};
pub use message::{DisconnectReason, MessageType};
pub use multiplexer::{
    AcceptedChannel, ChannelFactory, GlobalRequestHandler, Multiplexer, OpenRefusal,
    PortForwarding, KEEPALIVE_REQUEST,
};
pub use packet::{Framing, InboundPacket, PacketDecoder, PacketEncoder};
pub use session::{Session, SessionBuilder};
pub use transport::{
    Role, TransportCodec, TransportConfig, TransportEvent, TransportState, TransportStats,
    WireWrite,
};
pub use version::Version;
pub use window::WindowLedger;
