//! SSH protocol core for the skiff crates.
//!
//! This crate implements the transport and connection layers of SSH2:
//!
//! - **Transport** - identification exchange, Curve25519 key exchange,
//!   packet protection with pluggable ciphers, MACs and compression, rekeying
//! - **Connection** - channel multiplexing with flow-control windows, channel
//!   and global requests, keep-alive
//!
//! User authentication, terminals, SFTP and socket setup are left to the
//! caller; a [`ssh::Session`] runs over any connected byte stream.
//!
//! # Features
//!
//! - `ssh` (default) - SSH transport and connection layers
//! - `serde` - `Serialize`/`Deserialize` for the configuration types
//!
//! # Example
//!
//! ```rust,ignore
//! use skiff_proto::ssh::{ChannelConfig, ChannelKind, SessionBuilder, TransportConfig};
//!
//! let session = SessionBuilder::new(TransportConfig::client())
//!     .start(tcp_stream)
//!     .await?;
//! let channel = session
//!     .open_channel(ChannelKind::Session, ChannelConfig::default())
//!     .await?;
//! channel.send(b"ping").await?;
//! let reply = channel.receive().await?;
//! ```
//!
//! # Security
//!
//! - All cryptographic primitives come from vetted crates (`ring`, RustCrypto, `dalek`)
//! - MAC and tag checks are constant-time
//! - Key material is zeroized on drop with `zeroize`
//! - Packet lengths are bounded before any allocation
//!
//! # References
//!
//! - [RFC 4251](https://datatracker.ietf.org/doc/html/rfc4251) - SSH Protocol Architecture
//! - [RFC 4253](https://datatracker.ietf.org/doc/html/rfc4253) - SSH Transport Layer Protocol
//! - [RFC 4254](https://datatracker.ietf.org/doc/html/rfc4254) - SSH Connection Protocol

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "ssh")]
pub mod ssh;
