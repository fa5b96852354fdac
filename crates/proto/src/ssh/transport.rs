//! SSH Transport Layer (RFC 4253).
//!
//! [`TransportCodec`] turns bytes from the peer into connection-layer
//! messages and connection-layer messages into bytes for the peer. It owns
//! the identification exchange, the packet codec and the key exchange
//! state machine; it never touches a socket. Encoded output is handed, in
//! order, to a [`WireWrite`] queue that the reactor drains.
//!
//! # Transport States
//!
//! 1. **NegotiatingIdentification** - Waiting for the peer's "SSH-2.0-" line
//! 2. **KeyExchange** - KEXINIT sent by either side, NEWKEYS not yet both ways
//! 3. **Established** - Application messages flow
//! 4. **Disconnected** - Terminal
//!
//! Established returns to KeyExchange on every rekey. While a key exchange
//! is running, application messages handed to [`TransportCodec::send`] are
//! queued and released in order once NEWKEYS has been both sent and
//! received.
//!
//! # Rekeying
//!
//! A rekey starts when either direction exceeds the configured byte or
//! packet count since the last exchange, when the optional time limit
//! expires, or on an explicit [`TransportCodec::rekey`]. The session
//! identifier of the first exchange is kept for the life of the connection.
//!
//! # Locking
//!
//! Inbound decoding, outbound encoding and key exchange state sit behind
//! three separate locks, always taken in the order inbound, kex, outbound.
//! Keys are swapped inside the encoder or decoder together with the NEWKEYS
//! packet of that direction.

use super::algorithm::{AlgorithmRegistry, HostKeySigner, KeyExchange};
use super::kex::{
    derive_session_keys, exchange_hash, guess_is_correct, ExchangeHashInput, KexEcdhInit,
    KexEcdhReply, KexInit, KeyMaterial, Negotiated, NewKeys,
};
use super::logging;
use super::message::{DebugMessage, Disconnect, DisconnectReason, MessageType, Unimplemented};
use super::packet::{InboundPacket, PacketCounters, PacketDecoder, PacketEncoder, MAX_PACKET_SIZE};
use super::sync::lock;
use super::version::{Identification, IdentificationReader, Version};
use skiff_platform::{SkiffError, SkiffResult};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Role {
    /// Initiates the connection and verifies the host key
    Client,
    /// Accepts the connection and signs with a host key
    Server,
}

impl Role {
    /// Lowercase name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }
}

/// SSH transport layer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Identification lines are being exchanged.
    NegotiatingIdentification,

    /// A key exchange is running (first handshake or rekey).
    KeyExchange,

    /// Keys are installed in both directions and no exchange is running.
    Established,

    /// The connection is gone. Terminal.
    Disconnected,
}

impl TransportState {
    /// Name for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportState::NegotiatingIdentification => "NegotiatingIdentification",
            TransportState::KeyExchange => "KeyExchange",
            TransportState::Established => "Established",
            TransportState::Disconnected => "Disconnected",
        }
    }
}

/// Transport layer configuration.
///
/// # Example
///
/// ```rust
/// use skiff_proto::ssh::transport::TransportConfig;
/// use std::time::Duration;
///
/// let config = TransportConfig::client()
///     .with_rekey_bytes_limit(512 * 1024 * 1024)
///     .with_rekey_time_limit(Some(Duration::from_secs(1800)));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone)]
pub struct TransportConfig {
    /// Our identification line.
    pub version: Version,

    /// Client or server.
    pub role: Role,

    /// Algorithms we offer, in preference order.
    pub registry: Arc<AlgorithmRegistry>,

    /// Host keys a server signs with. Unused by clients.
    pub host_keys: Vec<Arc<dyn HostKeySigner>>,

    /// Bytes in either direction before an automatic rekey (default: 1 GiB).
    pub rekey_bytes_limit: u64,

    /// Packets in either direction before an automatic rekey (default: 2^31).
    pub rekey_packets_limit: u64,

    /// Time before an automatic rekey (default: 1 hour).
    pub rekey_time_limit: Option<Duration>,

    /// Largest inbound packet accepted, length field included.
    pub max_packet_length: usize,
}

impl std::fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportConfig")
            .field("version", &self.version.to_string())
            .field("role", &self.role)
            .field("registry", &self.registry)
            .field(
                "host_keys",
                &self
                    .host_keys
                    .iter()
                    .map(|k| k.algorithm())
                    .collect::<Vec<_>>(),
            )
            .field("rekey_bytes_limit", &self.rekey_bytes_limit)
            .field("rekey_packets_limit", &self.rekey_packets_limit)
            .field("rekey_time_limit", &self.rekey_time_limit)
            .field("max_packet_length", &self.max_packet_length)
            .finish()
    }
}

impl TransportConfig {
    /// Creates a configuration with the built-in algorithms.
    pub fn new(role: Role) -> Self {
        Self {
            version: Version::default_skiff(),
            role,
            registry: Arc::new(AlgorithmRegistry::with_defaults()),
            host_keys: Vec::new(),
            rekey_bytes_limit: 1 << 30,
            rekey_packets_limit: 1 << 31,
            rekey_time_limit: Some(Duration::from_secs(3600)),
            max_packet_length: MAX_PACKET_SIZE,
        }
    }

    /// Client configuration.
    pub fn client() -> Self {
        Self::new(Role::Client)
    }

    /// Server configuration signing with `host_key`.
    pub fn server(host_key: Arc<dyn HostKeySigner>) -> Self {
        Self::new(Role::Server).with_host_key(host_key)
    }

    /// Sets the identification line.
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Replaces the algorithm registry.
    pub fn with_registry(mut self, registry: AlgorithmRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Adds a host key.
    pub fn with_host_key(mut self, host_key: Arc<dyn HostKeySigner>) -> Self {
        self.host_keys.push(host_key);
        self
    }

    /// Sets the byte limit for automatic rekeying.
    pub fn with_rekey_bytes_limit(mut self, limit: u64) -> Self {
        self.rekey_bytes_limit = limit;
        self
    }

    /// Sets the packet limit for automatic rekeying.
    pub fn with_rekey_packets_limit(mut self, limit: u64) -> Self {
        self.rekey_packets_limit = limit;
        self
    }

    /// Sets (or disables) the time limit for automatic rekeying.
    pub fn with_rekey_time_limit(mut self, limit: Option<Duration>) -> Self {
        self.rekey_time_limit = limit;
        self
    }

    /// Sets the largest inbound packet accepted.
    pub fn with_max_packet_length(mut self, length: usize) -> Self {
        self.max_packet_length = length;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SkiffResult<()> {
        if self.rekey_bytes_limit == 0 || self.rekey_packets_limit == 0 {
            return Err(SkiffError::Config(
                "Rekey limits must be greater than zero".to_string(),
            ));
        }
        if self.rekey_time_limit == Some(Duration::ZERO) {
            return Err(SkiffError::Config(
                "Rekey time limit must be greater than zero".to_string(),
            ));
        }
        // RFC 4253 Section 6.1: 35000 byte packets must always be accepted.
        if self.max_packet_length < MAX_PACKET_SIZE {
            return Err(SkiffError::Config(format!(
                "max_packet_length must be at least {}",
                MAX_PACKET_SIZE
            )));
        }
        if self.registry.kex_names().is_empty() || self.registry.cipher_names().is_empty() {
            return Err(SkiffError::Config(
                "Algorithm registry has no key exchange method or cipher".to_string(),
            ));
        }
        match self.role {
            Role::Server if self.host_keys.is_empty() => Err(SkiffError::Config(
                "A server needs at least one host key".to_string(),
            )),
            Role::Client if self.registry.host_key_names().is_empty() => Err(SkiffError::Config(
                "A client needs at least one host key verifier".to_string(),
            )),
            _ => Ok(()),
        }
    }

    fn host_key_algorithms(&self) -> Vec<String> {
        match self.role {
            Role::Client => self.registry.host_key_names(),
            Role::Server => self
                .host_keys
                .iter()
                .map(|k| k.algorithm().to_string())
                .collect(),
        }
    }
}

/// One unit of work for the socket writer.
#[derive(Debug)]
pub enum WireWrite {
    /// Bytes to write; `receipt` fires once they have been written.
    Bytes {
        /// Encoded bytes
        data: Vec<u8>,
        /// Write confirmation
        receipt: Option<oneshot::Sender<()>>,
    },
    /// Flush and shut the write half down.
    Close,
}

/// Something the codec produced while reading.
#[derive(Debug)]
pub enum TransportEvent {
    /// A message for the layers above (service, auth or connection).
    Message(InboundPacket),
    /// A key exchange finished.
    KexComplete {
        /// False for the first exchange
        rekey: bool,
    },
    /// The peer sent DISCONNECT.
    Disconnected {
        /// Reason code
        reason_code: u32,
        /// Peer's description
        description: String,
    },
}

/// Totals over the life of the connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Packets written
    pub packets_sent: u64,
    /// Bytes written (identification excluded)
    pub bytes_sent: u64,
    /// Packets read
    pub packets_received: u64,
    /// Bytes read
    pub bytes_received: u64,
    /// Completed key exchanges, the first included
    pub key_exchanges: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    key_exchanges: AtomicU64,
}

struct Inbound {
    identification: IdentificationReader,
    decoder: PacketDecoder,
}

type Pending = (Vec<u8>, Option<oneshot::Sender<()>>);

struct Outbound {
    encoder: PacketEncoder,
    /// Application messages are held while true
    holding: bool,
    queued: VecDeque<Pending>,
    closed: bool,
    keyed_at: Instant,
}

struct LocalKexInit {
    message: KexInit,
    payload: Vec<u8>,
}

struct KexState {
    local_id: Vec<u8>,
    peer_id: Option<Identification>,
    session_id: Option<Vec<u8>>,
    local_kexinit: Option<LocalKexInit>,
    peer_kexinit: Option<Vec<u8>>,
    negotiated: Option<Negotiated>,
    exchange: Option<Box<dyn KeyExchange>>,
    ignore_next: bool,
    /// Between the peer's KEXINIT and the peer's NEWKEYS
    peer_in_kex: bool,
    newkeys_sent: bool,
    newkeys_received: bool,
    started_at: Instant,
}

impl KexState {
    fn in_progress(&self) -> bool {
        self.local_kexinit.is_some()
    }
}

fn closed_error() -> SkiffError {
    SkiffError::Disconnected("Transport is closed".to_string())
}

/// Sans-IO SSH transport.
///
/// Shared between the reactor (which calls [`receive`](Self::receive)) and
/// any number of senders.
pub struct TransportCodec {
    config: TransportConfig,
    state: Mutex<TransportState>,
    inbound: Mutex<Inbound>,
    outbound: Mutex<Outbound>,
    kex: Mutex<KexState>,
    writer: mpsc::UnboundedSender<WireWrite>,
    stats: StatsCounters,
    last_negotiated: Mutex<Option<Negotiated>>,
}

impl std::fmt::Debug for TransportCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportCodec")
            .field("role", &self.config.role)
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl TransportCodec {
    /// Creates a codec and the queue its output goes to.
    pub fn new(
        config: TransportConfig,
    ) -> SkiffResult<(Self, mpsc::UnboundedReceiver<WireWrite>)> {
        config.validate()?;

        let mut local_id = config.version.to_wire_format();
        local_id.truncate(local_id.len().saturating_sub(2));

        let (writer, output) = mpsc::unbounded_channel();
        let now = Instant::now();
        let codec = Self {
            inbound: Mutex::new(Inbound {
                identification: IdentificationReader::new(),
                decoder: PacketDecoder::new(config.max_packet_length),
            }),
            outbound: Mutex::new(Outbound {
                encoder: PacketEncoder::new(),
                holding: true,
                queued: VecDeque::new(),
                closed: false,
                keyed_at: now,
            }),
            kex: Mutex::new(KexState {
                local_id,
                peer_id: None,
                session_id: None,
                local_kexinit: None,
                peer_kexinit: None,
                negotiated: None,
                exchange: None,
                ignore_next: false,
                peer_in_kex: false,
                newkeys_sent: false,
                newkeys_received: false,
                started_at: now,
            }),
            state: Mutex::new(TransportState::NegotiatingIdentification),
            writer,
            stats: StatsCounters::default(),
            last_negotiated: Mutex::new(None),
            config,
        };
        Ok((codec, output))
    }

    /// Our role.
    pub fn role(&self) -> Role {
        self.config.role
    }

    /// Current state.
    pub fn state(&self) -> TransportState {
        *lock(&self.state)
    }

    /// Whether application messages currently flow without queueing.
    pub fn is_established(&self) -> bool {
        self.state() == TransportState::Established
    }

    /// Session identifier, once the first exchange has completed.
    pub fn session_id(&self) -> Option<Vec<u8>> {
        lock(&self.kex).session_id.clone()
    }

    /// The peer's identification, once received.
    pub fn peer_identification(&self) -> Option<Identification> {
        lock(&self.kex).peer_id.clone()
    }

    /// Algorithms of the most recent completed exchange.
    pub fn negotiated(&self) -> Option<Negotiated> {
        lock(&self.last_negotiated).clone()
    }

    /// Connection totals.
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            packets_sent: self.stats.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            packets_received: self.stats.packets_received.load(Ordering::Relaxed),
            bytes_received: self.stats.bytes_received.load(Ordering::Relaxed),
            key_exchanges: self.stats.key_exchanges.load(Ordering::Relaxed),
        }
    }

    /// Queues our identification line. Call once, before anything else.
    pub fn start(&self) -> SkiffResult<()> {
        let out = lock(&self.outbound);
        if out.closed {
            return Err(closed_error());
        }
        self.writer
            .send(WireWrite::Bytes {
                data: self.config.version.to_wire_format(),
                receipt: None,
            })
            .map_err(|_| closed_error())
    }

    /// Processes bytes read from the peer.
    ///
    /// Fatal errors send DISCONNECT and close the transport before being
    /// returned.
    pub fn receive(&self, data: &[u8]) -> SkiffResult<Vec<TransportEvent>> {
        if self.state() == TransportState::Disconnected {
            return Err(closed_error());
        }
        self.stats
            .bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);

        let mut events = Vec::new();
        match self.receive_inner(data, &mut events) {
            Ok(()) => Ok(events),
            Err(e) => {
                if e.is_fatal() {
                    self.fail(&e);
                }
                Err(e)
            }
        }
    }

    /// Sends an application message, queueing it during key exchange.
    pub fn send(&self, payload: Vec<u8>) -> SkiffResult<()> {
        self.submit(payload, None)
    }

    /// Like [`send`](Self::send), returning a receipt that fires once the
    /// encoded packet has been written to the socket.
    pub fn send_confirmed(&self, payload: Vec<u8>) -> SkiffResult<oneshot::Receiver<()>> {
        let (tx, rx) = oneshot::channel();
        self.submit(payload, Some(tx))?;
        Ok(rx)
    }

    /// Answers a packet we do not understand.
    pub fn send_unimplemented(&self, sequence_number: u32) -> SkiffResult<()> {
        let payload = Unimplemented { sequence_number }.to_bytes();
        let mut out = lock(&self.outbound);
        self.write_locked(&mut out, &payload, None)
    }

    /// Starts a key exchange now, unless one is already running.
    pub fn rekey(&self) -> SkiffResult<()> {
        if self.state() == TransportState::Disconnected {
            return Err(closed_error());
        }
        let counters = lock(&self.outbound).encoder.counters();
        self.start_rekey("requested", counters)
    }

    /// Turns on zlib@openssh.com compression in both directions.
    ///
    /// Called by the authentication layer once the user is authenticated.
    pub fn enable_delayed_compression(&self) {
        let mut inbound = lock(&self.inbound);
        let mut out = lock(&self.outbound);
        inbound.decoder.enable_delayed_compression();
        out.encoder.enable_delayed_compression();
    }

    /// Sends DISCONNECT and closes the transport. Idempotent.
    pub fn disconnect(&self, reason: DisconnectReason, description: &str) {
        {
            let mut out = lock(&self.outbound);
            if !out.closed {
                let payload = Disconnect::new(reason, description).to_bytes();
                if let Err(e) = self.write_locked(&mut out, &payload, None) {
                    debug!(error = %e, "Could not send DISCONNECT");
                }
                self.close_locked(&mut out);
            }
        }
        self.set_state(TransportState::Disconnected);
    }

    /// Disconnects with the reason code matching `error`.
    pub fn fail(&self, error: &SkiffError) {
        let code = error.disconnect_reason();
        logging::log_protocol_error(code, &error.to_string());
        let reason = DisconnectReason::from_u32(code).unwrap_or(DisconnectReason::ProtocolError);
        self.disconnect(reason, &error.to_string());
    }

    /// Marks the transport closed without telling the peer (socket gone).
    pub fn shutdown(&self) {
        {
            let mut out = lock(&self.outbound);
            if !out.closed {
                self.close_locked(&mut out);
            }
        }
        self.set_state(TransportState::Disconnected);
    }

    fn close_locked(&self, out: &mut Outbound) {
        out.closed = true;
        // dropping the receipts wakes whoever waits on them
        out.queued.clear();
        let _ = self.writer.send(WireWrite::Close);
    }

    fn set_state(&self, new_state: TransportState) {
        let mut state = lock(&self.state);
        if *state == new_state || *state == TransportState::Disconnected {
            return;
        }
        logging::log_state_transition(self.config.role.as_str(), state.as_str(), new_state.as_str());
        *state = new_state;
    }

    fn submit(&self, payload: Vec<u8>, receipt: Option<oneshot::Sender<()>>) -> SkiffResult<()> {
        if payload.is_empty() {
            return Err(SkiffError::Protocol("Empty payload".to_string()));
        }
        let due = {
            let mut out = lock(&self.outbound);
            if out.closed {
                return Err(closed_error());
            }
            if out.holding {
                out.queued.push_back((payload, receipt));
                return Ok(());
            }
            self.write_locked(&mut out, &payload, receipt)?;
            let counters = out.encoder.counters();
            self.rekey_reason(counters, out.keyed_at).map(|r| (r, counters))
        };
        if let Some((reason, counters)) = due {
            self.start_rekey(reason, counters)?;
        }
        Ok(())
    }

    fn write_locked(
        &self,
        out: &mut Outbound,
        payload: &[u8],
        receipt: Option<oneshot::Sender<()>>,
    ) -> SkiffResult<()> {
        if out.closed {
            return Err(closed_error());
        }
        let sequence = out.encoder.sequence();
        let data = out.encoder.encode(payload)?;
        logging::log_packet("out", payload[0], sequence, payload.len());
        self.stats.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_sent
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        self.writer
            .send(WireWrite::Bytes { data, receipt })
            .map_err(|_| closed_error())
    }

    fn rekey_reason(&self, counters: PacketCounters, keyed_at: Instant) -> Option<&'static str> {
        if counters.bytes >= self.config.rekey_bytes_limit {
            Some("bytes")
        } else if counters.packets >= self.config.rekey_packets_limit {
            Some("packets")
        } else if self
            .config
            .rekey_time_limit
            .is_some_and(|limit| keyed_at.elapsed() >= limit)
        {
            Some("time")
        } else {
            None
        }
    }

    fn start_rekey(&self, reason: &str, counters: PacketCounters) -> SkiffResult<()> {
        let mut kex = lock(&self.kex);
        if kex.in_progress() || kex.session_id.is_none() {
            return Ok(());
        }
        logging::log_rekey_triggered(reason, counters.bytes, counters.packets);
        self.begin_kex_locked(&mut kex)
    }

    /// Sends our KEXINIT unless this exchange already has one.
    fn begin_kex_locked(&self, kex: &mut KexState) -> SkiffResult<()> {
        if kex.in_progress() {
            return Ok(());
        }
        let message = KexInit::from_registry(
            &self.config.registry,
            self.config.host_key_algorithms(),
        );
        let payload = message.to_bytes();

        kex.started_at = Instant::now();
        kex.newkeys_sent = false;
        kex.newkeys_received = false;
        kex.negotiated = None;
        kex.exchange = None;

        {
            let mut out = lock(&self.outbound);
            out.holding = true;
            self.write_locked(&mut out, &payload, None)?;
        }
        kex.local_kexinit = Some(LocalKexInit { message, payload });
        self.set_state(TransportState::KeyExchange);
        Ok(())
    }

    fn receive_inner(&self, data: &[u8], events: &mut Vec<TransportEvent>) -> SkiffResult<()> {
        let mut inbound = lock(&self.inbound);

        if inbound.identification.is_done() {
            inbound.decoder.feed(data);
        } else {
            match inbound.identification.feed(data)? {
                Some(identification) => {
                    let rest = inbound.identification.take_remaining();
                    self.on_identification(identification)?;
                    inbound.decoder.feed(&rest);
                }
                None => return Ok(()),
            }
        }

        while let Some(packet) = inbound.decoder.next_packet()? {
            self.stats.packets_received.fetch_add(1, Ordering::Relaxed);
            if self.handle_packet(&mut inbound, packet, events)? {
                return Ok(());
            }

            let counters = inbound.decoder.counters();
            let keyed_at = lock(&self.outbound).keyed_at;
            if let Some(reason) = self.rekey_reason(counters, keyed_at) {
                self.start_rekey(reason, counters)?;
            }
        }
        Ok(())
    }

    fn on_identification(&self, identification: Identification) -> SkiffResult<()> {
        logging::log_peer_identification(self.config.role.as_str(), identification.software());
        let mut kex = lock(&self.kex);
        kex.peer_id = Some(identification);
        self.begin_kex_locked(&mut kex)
    }

    /// Returns true when the peer disconnected.
    fn handle_packet(
        &self,
        inbound: &mut Inbound,
        packet: InboundPacket,
        events: &mut Vec<TransportEvent>,
    ) -> SkiffResult<bool> {
        let msg_type = packet.message_type();
        logging::log_packet("in", msg_type, packet.sequence, packet.payload.len());

        match MessageType::from_u8(msg_type) {
            Some(MessageType::Disconnect) => {
                let disconnect = Disconnect::from_bytes(&packet.payload)?;
                logging::log_peer_disconnect(disconnect.reason_code, &disconnect.description);
                self.shutdown();
                events.push(TransportEvent::Disconnected {
                    reason_code: disconnect.reason_code,
                    description: disconnect.description,
                });
                return Ok(true);
            }
            Some(MessageType::Ignore) => {}
            Some(MessageType::Debug) => {
                if let Ok(message) = DebugMessage::from_bytes(&packet.payload) {
                    debug!(
                        always_display = message.always_display,
                        message = %message.message,
                        "SSH_MSG_DEBUG from peer"
                    );
                }
            }
            Some(MessageType::Unimplemented) => {
                let unimplemented = Unimplemented::from_bytes(&packet.payload)?;
                warn!(
                    seq_num = unimplemented.sequence_number,
                    "Peer did not understand one of our packets"
                );
            }
            Some(MessageType::KexInit) => self.on_kexinit(&packet.payload)?,
            Some(MessageType::NewKeys) => self.on_newkeys(events)?,
            _ if MessageType::is_kex_method_message(msg_type) => {
                self.on_kex_method(inbound, &packet.payload)?
            }
            _ if MessageType::is_kex_message(msg_type) => {
                self.send_unimplemented(packet.sequence)?
            }
            _ => {
                {
                    let kex = lock(&self.kex);
                    if kex.session_id.is_none() {
                        return Err(SkiffError::Protocol(format!(
                            "Message {} received before key exchange",
                            msg_type
                        )));
                    }
                    if kex.peer_in_kex {
                        return Err(SkiffError::Protocol(format!(
                            "Message {} received during key exchange",
                            msg_type
                        )));
                    }
                }
                events.push(TransportEvent::Message(packet));
            }
        }
        Ok(false)
    }

    fn on_kexinit(&self, payload: &[u8]) -> SkiffResult<()> {
        let peer = KexInit::from_bytes(payload)?;
        let mut kex = lock(&self.kex);
        if kex.peer_kexinit.is_some() {
            return Err(SkiffError::Protocol(
                "Second KEXINIT during one key exchange".to_string(),
            ));
        }
        kex.peer_in_kex = true;
        self.begin_kex_locked(&mut kex)?;

        let local = match &kex.local_kexinit {
            Some(local) => local.message.clone(),
            None => return Err(SkiffError::Protocol("KEXINIT not sent".to_string())),
        };
        let (client, server) = match self.config.role {
            Role::Client => (&local, &peer),
            Role::Server => (&peer, &local),
        };
        let negotiated = Negotiated::negotiate(client, server, &self.config.registry)?;
        let (cipher_out, cipher_in) = match self.config.role {
            Role::Client => (
                &negotiated.cipher_client_to_server,
                &negotiated.cipher_server_to_client,
            ),
            Role::Server => (
                &negotiated.cipher_server_to_client,
                &negotiated.cipher_client_to_server,
            ),
        };
        logging::log_algorithms_negotiated(
            &negotiated.kex,
            &negotiated.host_key,
            cipher_out,
            cipher_in,
        );

        if peer.first_kex_packet_follows() && !guess_is_correct(client, server) {
            debug!("Peer guessed the key exchange wrong, ignoring its next kex packet");
            kex.ignore_next = true;
        }
        kex.peer_kexinit = Some(payload.to_vec());

        if self.config.role == Role::Client {
            let factory = self.config.registry.kex(&negotiated.kex).ok_or_else(|| {
                SkiffError::Protocol(format!("Key exchange {} is not registered", negotiated.kex))
            })?;
            let exchange = factory.start()?;
            let init = KexEcdhInit {
                client_public: exchange.public_key().to_vec(),
            };
            let mut out = lock(&self.outbound);
            self.write_locked(&mut out, &init.to_bytes(), None)?;
            drop(out);
            kex.exchange = Some(exchange);
        }
        kex.negotiated = Some(negotiated);
        Ok(())
    }

    fn on_kex_method(&self, inbound: &mut Inbound, payload: &[u8]) -> SkiffResult<()> {
        let mut kex = lock(&self.kex);
        if kex.ignore_next {
            kex.ignore_next = false;
            debug!(msg_type = payload[0], "Ignoring wrongly guessed kex packet");
            return Ok(());
        }
        let negotiated = kex.negotiated.clone().ok_or_else(|| {
            SkiffError::Protocol("Key exchange message before KEXINIT".to_string())
        })?;
        let local_kexinit = kex
            .local_kexinit
            .as_ref()
            .map(|l| l.payload.clone())
            .unwrap_or_default();
        let peer_kexinit = kex.peer_kexinit.clone().unwrap_or_default();
        let peer_id = kex
            .peer_id
            .as_ref()
            .map(|id| id.raw().to_vec())
            .unwrap_or_default();
        let local_id = kex.local_id.clone();

        let msg_type = payload[0];
        let (hash, shared, h, outbound_message) = match (self.config.role, MessageType::from_u8(msg_type)) {
            (Role::Server, Some(MessageType::KexEcdhInit)) => {
                let init = KexEcdhInit::from_bytes(payload)?;
                let factory = self.config.registry.kex(&negotiated.kex).ok_or_else(|| {
                    SkiffError::Protocol(format!(
                        "Key exchange {} is not registered",
                        negotiated.kex
                    ))
                })?;
                let mut exchange = factory.start()?;
                let shared = Zeroizing::new(exchange.agree(&init.client_public)?);

                let signer = self
                    .config
                    .host_keys
                    .iter()
                    .find(|k| k.algorithm() == negotiated.host_key)
                    .ok_or_else(|| {
                        SkiffError::Protocol(format!("No {} host key", negotiated.host_key))
                    })?;
                let host_key = signer.public_key_blob();
                let server_public = exchange.public_key().to_vec();

                let h = exchange_hash(
                    exchange.hash(),
                    &ExchangeHashInput {
                        client_id: &peer_id,
                        server_id: &local_id,
                        client_kexinit: &peer_kexinit,
                        server_kexinit: &local_kexinit,
                        host_key: &host_key,
                        client_public: &init.client_public,
                        server_public: &server_public,
                        shared_secret: &shared,
                    },
                );
                let signature = signer.sign(&h)?;
                let reply = KexEcdhReply {
                    host_key,
                    server_public,
                    signature,
                };
                (exchange.hash(), shared, h, Some(reply.to_bytes()))
            }
            (Role::Client, Some(MessageType::KexEcdhReply)) => {
                let reply = KexEcdhReply::from_bytes(payload)?;
                let mut exchange = kex.exchange.take().ok_or_else(|| {
                    SkiffError::Protocol("Unexpected KEX_ECDH_REPLY".to_string())
                })?;
                let client_public = exchange.public_key().to_vec();
                let shared = Zeroizing::new(exchange.agree(&reply.server_public)?);

                let h = exchange_hash(
                    exchange.hash(),
                    &ExchangeHashInput {
                        client_id: &local_id,
                        server_id: &peer_id,
                        client_kexinit: &local_kexinit,
                        server_kexinit: &peer_kexinit,
                        host_key: &reply.host_key,
                        client_public: &client_public,
                        server_public: &reply.server_public,
                        shared_secret: &shared,
                    },
                );
                let verifier = self
                    .config
                    .registry
                    .host_key_verifier(&negotiated.host_key)
                    .ok_or_else(|| {
                        SkiffError::Security(format!(
                            "No verifier for host key type {}",
                            negotiated.host_key
                        ))
                    })?;
                verifier.verify(&reply.host_key, &h, &reply.signature)?;
                (exchange.hash(), shared, h, None)
            }
            _ => {
                return Err(SkiffError::Protocol(format!(
                    "Unexpected key exchange message {} for {}",
                    msg_type,
                    self.config.role.as_str()
                )))
            }
        };

        let session_id = kex.session_id.get_or_insert_with(|| h.clone()).clone();
        let keys = derive_session_keys(
            &self.config.registry,
            &negotiated,
            &KeyMaterial {
                hash,
                shared_secret: &shared,
                exchange_hash: &h,
                session_id: &session_id,
            },
            self.config.role == Role::Client,
        )?;

        inbound.decoder.stage(keys.inbound);
        {
            let mut out = lock(&self.outbound);
            if let Some(message) = outbound_message {
                self.write_locked(&mut out, &message, None)?;
            }
            out.encoder.stage(keys.outbound);
            self.write_locked(&mut out, &NewKeys::new().to_bytes(), None)?;
        }
        kex.newkeys_sent = true;
        Ok(())
    }

    fn on_newkeys(&self, events: &mut Vec<TransportEvent>) -> SkiffResult<()> {
        let mut kex = lock(&self.kex);
        if !kex.newkeys_sent {
            return Err(SkiffError::Protocol(
                "NEWKEYS received before key exchange finished".to_string(),
            ));
        }
        kex.newkeys_received = true;
        kex.peer_in_kex = false;
        self.finish_kex_locked(&mut kex, events)
    }

    fn finish_kex_locked(
        &self,
        kex: &mut KexState,
        events: &mut Vec<TransportEvent>,
    ) -> SkiffResult<()> {
        let rekey = self.stats.key_exchanges.fetch_add(1, Ordering::Relaxed) > 0;
        *lock(&self.last_negotiated) = kex.negotiated.take();
        kex.local_kexinit = None;
        kex.peer_kexinit = None;
        kex.exchange = None;
        kex.newkeys_sent = false;
        kex.newkeys_received = false;

        logging::log_kex_complete(
            kex.session_id.as_deref().unwrap_or_default(),
            rekey,
            kex.started_at.elapsed().as_millis() as u64,
        );
        self.set_state(TransportState::Established);

        let mut out = lock(&self.outbound);
        out.holding = false;
        out.keyed_at = Instant::now();
        while let Some((payload, receipt)) = out.queued.pop_front() {
            self.write_locked(&mut out, &payload, receipt)?;
        }
        events.push(TransportEvent::KexComplete { rekey });
        Ok(())
    }
}

/// In-memory plumbing for unit tests of the layers above the codec.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::ssh::hostkey::Ed25519HostKey;

    pub(crate) type Output = mpsc::UnboundedReceiver<WireWrite>;

    pub(crate) fn server_config() -> TransportConfig {
        TransportConfig::server(Arc::new(Ed25519HostKey::from_bytes(&[5u8; 32]).unwrap()))
    }

    pub(crate) fn drain(output: &mut Output) -> Vec<u8> {
        let mut bytes = Vec::new();
        while let Ok(write) = output.try_recv() {
            if let WireWrite::Bytes { data, receipt } = write {
                bytes.extend_from_slice(&data);
                if let Some(receipt) = receipt {
                    let _ = receipt.send(());
                }
            }
        }
        bytes
    }

    /// Moves bytes both ways until neither side produces anything.
    pub(crate) fn pump(
        client: &TransportCodec,
        client_out: &mut Output,
        server: &TransportCodec,
        server_out: &mut Output,
    ) -> SkiffResult<(Vec<TransportEvent>, Vec<TransportEvent>)> {
        let mut client_events = Vec::new();
        let mut server_events = Vec::new();
        loop {
            let to_server = drain(client_out);
            let to_client = drain(server_out);
            if to_server.is_empty() && to_client.is_empty() {
                return Ok((client_events, server_events));
            }
            if !to_server.is_empty() {
                server_events.extend(server.receive(&to_server)?);
            }
            if !to_client.is_empty() {
                client_events.extend(client.receive(&to_client)?);
            }
        }
    }

    pub(crate) fn connected(
        client_config: TransportConfig,
        server_config: TransportConfig,
    ) -> (TransportCodec, Output, TransportCodec, Output) {
        let (client, mut client_out) = TransportCodec::new(client_config).unwrap();
        let (server, mut server_out) = TransportCodec::new(server_config).unwrap();
        client.start().unwrap();
        server.start().unwrap();
        pump(&client, &mut client_out, &server, &mut server_out).unwrap();
        (client, client_out, server, server_out)
    }
}
