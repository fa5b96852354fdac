//! Channel multiplexing over one transport (RFC 4254).
//!
//! The multiplexer owns the channel table and routes every connection-layer
//! message:
//!
//! - CHANNEL_OPEN is checked, handed to the [`ChannelFactory`] and answered
//! - OPEN_CONFIRMATION / OPEN_FAILURE resolve a pending [`open_channel`](Multiplexer::open_channel)
//! - DATA, EXTENDED_DATA, EOF, CLOSE and REQUEST go to the channel's ordered task
//! - WINDOW_ADJUST and CHANNEL_SUCCESS / FAILURE are applied inline
//! - GLOBAL_REQUEST is answered inline, replies are matched FIFO
//!
//! Channel ids come from a fixed-size pool and are reused oldest-first.

use super::channel::{
    ChannelHandle, ChannelListener, ChannelParams, ChannelShared, ChannelState, ChannelTask,
    ChannelTiming, RemoteEnd,
};
use super::config::{ChannelConfig, MultiplexerConfig};
use super::connection::{
    ChannelClose, ChannelKind, ChannelOpen, ChannelOpenConfirmation, ChannelOpenFailure,
    ChannelOpenFailureReason, ConnectionMessage, GlobalReply, GlobalRequest, TcpipForward,
    MIN_CHANNEL_PACKET_SIZE,
};
use super::logging;
use super::sync::lock;
use super::transport::TransportCodec;
use async_trait::async_trait;
use bytes::Bytes;
use skiff_platform::{SkiffError, SkiffResult};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Global request name used for keep-alive probes.
pub const KEEPALIVE_REQUEST: &str = "keepalive@openssh.com";

/// A channel accepted by a [`ChannelFactory`].
#[derive(Clone, Default)]
pub struct AcceptedChannel {
    /// Local settings for the new channel
    pub config: ChannelConfig,
    /// Receives the channel's traffic; `None` buffers it for `receive()`
    pub listener: Option<Arc<dyn ChannelListener>>,
}

/// A typed refusal from a [`ChannelFactory`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenRefusal {
    /// Reason sent to the peer
    pub reason: ChannelOpenFailureReason,
    /// Description sent to the peer
    pub description: String,
}

impl OpenRefusal {
    /// Refusal with the reason's standard description.
    pub fn new(reason: ChannelOpenFailureReason) -> Self {
        Self {
            reason,
            description: reason.as_str().to_string(),
        }
    }
}

/// Decides whether to accept channels opened by the peer.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Accepts or refuses a channel of the given kind.
    async fn open(&self, kind: &ChannelKind) -> Result<AcceptedChannel, OpenRefusal>;
}

/// Handles a named global request.
#[async_trait]
pub trait GlobalRequestHandler: Send + Sync {
    /// Returns response data on success, `None` to refuse.
    async fn handle(&self, request: &GlobalRequest) -> Option<Vec<u8>>;
}

/// Binds and releases listeners for remote port forwarding.
#[async_trait]
pub trait PortForwarding: Send + Sync {
    /// Starts listening; returns the bound port.
    async fn forward(&self, address: &str, port: u32) -> SkiffResult<u32>;

    /// Stops listening.
    async fn cancel(&self, address: &str, port: u32) -> SkiffResult<()>;
}

enum Slot {
    Free,
    Reserved,
    Active(Arc<ChannelShared>),
}

/// Channel records keyed by local id, plus the pool of free ids.
pub(crate) struct ChannelTable {
    slots: Vec<Slot>,
    free: VecDeque<u32>,
}

impl ChannelTable {
    fn new(capacity: u32) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::Free).collect(),
            free: (0..capacity).collect(),
        }
    }

    fn reserve(&mut self) -> Option<u32> {
        let id = self.free.pop_front()?;
        self.slots[id as usize] = Slot::Reserved;
        Some(id)
    }

    fn activate(&mut self, id: u32, channel: Arc<ChannelShared>) {
        if let Some(slot) = self.slots.get_mut(id as usize) {
            *slot = Slot::Active(channel);
        }
    }

    fn cancel(&mut self, id: u32) {
        if let Some(slot) = self.slots.get_mut(id as usize) {
            if matches!(slot, Slot::Reserved) {
                *slot = Slot::Free;
                self.free.push_back(id);
            }
        }
    }

    /// Frees the channel's id, unless it already belongs to someone else.
    pub(crate) fn release(&mut self, channel: &Arc<ChannelShared>) {
        let id = channel.local_id();
        if let Some(slot) = self.slots.get_mut(id as usize) {
            if matches!(slot, Slot::Active(c) if Arc::ptr_eq(c, channel)) {
                *slot = Slot::Free;
                self.free.push_back(id);
            }
        }
    }

    fn get(&self, id: u32) -> Option<Arc<ChannelShared>> {
        match self.slots.get(id as usize) {
            Some(Slot::Active(channel)) => Some(channel.clone()),
            _ => None,
        }
    }

    fn active(&self) -> Vec<Arc<ChannelShared>> {
        self.slots
            .iter()
            .filter_map(|slot| match slot {
                Slot::Active(channel) => Some(channel.clone()),
                _ => None,
            })
            .collect()
    }

    fn in_use(&self) -> usize {
        self.slots.len() - self.free.len()
    }
}

/// Connection-layer state for one transport.
pub struct Multiplexer {
    config: MultiplexerConfig,
    transport: Arc<TransportCodec>,
    table: Arc<Mutex<ChannelTable>>,
    factory: Option<Arc<dyn ChannelFactory>>,
    forwarding: Option<Arc<dyn PortForwarding>>,
    handlers: HashMap<String, Arc<dyn GlobalRequestHandler>>,
    pending_globals: Mutex<VecDeque<oneshot::Sender<GlobalReply>>>,
    accepted_tx: Mutex<Option<mpsc::UnboundedSender<ChannelHandle>>>,
    accepted_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ChannelHandle>>,
    disconnected: AtomicBool,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("channels", &self.channel_count())
            .field("disconnected", &self.is_disconnected())
            .finish_non_exhaustive()
    }
}

impl Multiplexer {
    /// Creates a multiplexer over `transport`.
    pub fn new(transport: Arc<TransportCodec>, config: MultiplexerConfig) -> SkiffResult<Self> {
        config.validate()?;
        let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
        Ok(Self {
            table: Arc::new(Mutex::new(ChannelTable::new(config.max_channels))),
            config,
            transport,
            factory: None,
            forwarding: None,
            handlers: HashMap::new(),
            pending_globals: Mutex::new(VecDeque::new()),
            accepted_tx: Mutex::new(Some(accepted_tx)),
            accepted_rx: tokio::sync::Mutex::new(accepted_rx),
            disconnected: AtomicBool::new(false),
        })
    }

    /// Accepts inbound channels through `factory`. Without one, every
    /// inbound open is refused.
    pub fn with_channel_factory(mut self, factory: Arc<dyn ChannelFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Answers `tcpip-forward` / `cancel-tcpip-forward` through `forwarding`.
    pub fn with_port_forwarding(mut self, forwarding: Arc<dyn PortForwarding>) -> Self {
        self.forwarding = Some(forwarding);
        self
    }

    /// Registers a handler for global requests named `name`.
    pub fn with_global_handler(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn GlobalRequestHandler>,
    ) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<TransportCodec> {
        &self.transport
    }

    /// Number of channel ids in use.
    pub fn channel_count(&self) -> usize {
        lock(&self.table).in_use()
    }

    /// Looks up an open channel by local id.
    pub fn channel(&self, local_id: u32) -> Option<ChannelHandle> {
        lock(&self.table)
            .get(local_id)
            .filter(|c| c.state() == ChannelState::Open)
            .map(ChannelHandle::from_shared)
    }

    /// True once [`on_disconnect`](Self::on_disconnect) has run.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn check_connected(&self) -> SkiffResult<()> {
        if self.is_disconnected() {
            return Err(SkiffError::Disconnected(
                "transport disconnected".to_string(),
            ));
        }
        Ok(())
    }

    fn spawn_channel(
        &self,
        local_id: u32,
        kind: ChannelKind,
        config: ChannelConfig,
        listener: Option<Arc<dyn ChannelListener>>,
        remote: Option<RemoteEnd>,
    ) -> ChannelHandle {
        ChannelHandle::spawn(ChannelParams {
            local_id,
            kind,
            config,
            timing: ChannelTiming::from(&self.config),
            transport: self.transport.clone(),
            listener,
            table: Arc::downgrade(&self.table),
            remote,
        })
    }

    /// Opens a channel and waits for the peer's answer.
    ///
    /// A refusal surfaces as [`SkiffError::Rejected`] with the peer's reason
    /// code; an exhausted id pool as [`SkiffError::Resource`].
    pub async fn open_channel(
        &self,
        kind: ChannelKind,
        config: ChannelConfig,
        listener: Option<Arc<dyn ChannelListener>>,
    ) -> SkiffResult<ChannelHandle> {
        config.validate()?;
        if let ChannelKind::Unknown { name } = &kind {
            return Err(SkiffError::Config(format!(
                "cannot open channel of unknown type {}",
                name
            )));
        }
        self.check_connected()?;

        let open = ChannelOpen::new(kind.clone(), 0, config.window_maximum, config.max_packet_size);
        let handle = {
            let mut table = lock(&self.table);
            let id = table
                .reserve()
                .ok_or_else(|| SkiffError::Resource("no free channel id".to_string()))?;
            let handle = self.spawn_channel(id, kind, config, listener, None);
            table.activate(id, handle.shared().clone());
            handle
        };
        let local_id = handle.local_id();
        let open = ChannelOpen {
            sender_channel: local_id,
            ..open
        };

        let result = match self.transport.send(open.to_bytes()) {
            Ok(()) => handle.shared().wait_open(self.config.open_timeout).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                logging::log_channel_opened(local_id, handle.remote_id(), open.kind.name(), false);
                Ok(handle)
            }
            Err(e) => {
                if handle.state() == ChannelState::Uninitialized {
                    handle.shared().abandon_open();
                }
                lock(&self.table).release(handle.shared());
                if let SkiffError::Rejected { code, message } = &e {
                    logging::log_channel_open_failed(open.kind.name(), *code, message);
                }
                Err(e)
            }
        }
    }

    /// Waits for the next channel opened by the peer.
    ///
    /// Returns `None` once the transport is gone.
    pub async fn accept(&self) -> Option<ChannelHandle> {
        self.accepted_rx.lock().await.recv().await
    }

    /// Sends a global request; with `want_reply`, waits for the answer.
    pub async fn send_global_request(
        &self,
        name: &str,
        data: Vec<u8>,
        want_reply: bool,
    ) -> SkiffResult<Option<GlobalReply>> {
        self.global_request(name, data, want_reply, self.config.global_request_timeout)
            .await
    }

    /// Sends a keep-alive probe and waits for any answer.
    pub async fn ping(&self) -> SkiffResult<()> {
        let reply = self
            .global_request(KEEPALIVE_REQUEST, Vec::new(), true, self.config.keepalive_timeout)
            .await;
        logging::log_keepalive(reply.is_ok());
        reply.map(|_| ())
    }

    async fn global_request(
        &self,
        name: &str,
        data: Vec<u8>,
        want_reply: bool,
        timeout: Duration,
    ) -> SkiffResult<Option<GlobalReply>> {
        self.check_connected()?;
        let payload = GlobalRequest {
            name: name.to_string(),
            want_reply,
            data,
        }
        .to_bytes();

        let waiter = {
            // held across the send so replies match the wire order
            let mut pending = lock(&self.pending_globals);
            self.transport.send(payload)?;
            want_reply.then(|| {
                let (tx, rx) = oneshot::channel();
                pending.push_back(tx);
                rx
            })
        };
        logging::log_global_request(name, false, None);

        let Some(waiter) = waiter else {
            return Ok(None);
        };
        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(reply)) => {
                logging::log_global_request(name, false, Some(reply.success));
                Ok(Some(reply))
            }
            Ok(Err(_)) => Err(SkiffError::Disconnected(
                "transport disconnected before the reply".to_string(),
            )),
            Err(_) => Err(SkiffError::timeout(format!(
                "global request {} timed out",
                name
            ))),
        }
    }

    /// Routes one inbound message.
    ///
    /// Returns `Ok(false)` for messages outside the connection layer.
    /// Errors are fatal to the transport; channel-scoped problems are
    /// handled here.
    pub async fn handle_message(&self, payload: &[u8]) -> SkiffResult<bool> {
        let message = match ConnectionMessage::parse(payload)? {
            Some(message) => message,
            None => return Ok(false),
        };

        let channel = match message.recipient_channel() {
            Some(id) => match lock(&self.table).get(id) {
                Some(channel) => Some(channel),
                None => {
                    if let ConnectionMessage::OpenConfirmation(confirm) = &message {
                        // the open timed out; the peer's end would stay open forever
                        debug!(local_id = id, "Closing late-confirmed channel");
                        self.transport.send(
                            ChannelClose {
                                recipient_channel: confirm.sender_channel,
                            }
                            .to_bytes(),
                        )?;
                    } else {
                        // a forced close frees the id before the peer's CLOSE arrives
                        debug!(local_id = id, "Message for unknown channel");
                    }
                    return Ok(true);
                }
            },
            None => None,
        };

        match (message, channel) {
            (ConnectionMessage::Open(open), _) => self.on_open(open).await?,
            (ConnectionMessage::GlobalRequest(request), _) => {
                self.on_global_request(request).await?
            }
            (ConnectionMessage::GlobalReply(reply), _) => self.on_global_reply(reply),
            (ConnectionMessage::OpenConfirmation(confirm), Some(channel)) => {
                let remote = RemoteEnd {
                    id: confirm.sender_channel,
                    window: confirm.initial_window_size,
                    max_packet_size: confirm.maximum_packet_size,
                };
                if !channel.confirm_open(remote) {
                    warn!(local_id = channel.local_id(), "Unexpected OPEN_CONFIRMATION");
                    self.transport.send(
                        ChannelClose {
                            recipient_channel: confirm.sender_channel,
                        }
                        .to_bytes(),
                    )?;
                }
            }
            (ConnectionMessage::OpenFailure(failure), Some(channel)) => {
                if channel.fail_open(failure.reason_code, failure.description) {
                    lock(&self.table).release(&channel);
                } else {
                    warn!(local_id = channel.local_id(), "Unexpected OPEN_FAILURE");
                }
            }
            (ConnectionMessage::WindowAdjust(adjust), Some(channel)) => {
                if let Err(e) = channel.credit(adjust.bytes_to_add) {
                    logging::log_channel_violation(channel.local_id(), &e.to_string());
                    channel.force_close();
                }
            }
            (ConnectionMessage::Reply(reply), Some(channel)) => {
                if let Err(e) = channel.request_reply(reply.success) {
                    logging::log_channel_violation(channel.local_id(), &e.to_string());
                }
            }
            (ConnectionMessage::Data(data), Some(channel)) => {
                channel.enqueue(ChannelTask::Data(Bytes::from(data.data)))
            }
            (ConnectionMessage::ExtendedData(data), Some(channel)) => channel.enqueue(
                ChannelTask::ExtendedData(data.data_type_code, Bytes::from(data.data)),
            ),
            (ConnectionMessage::Eof(_), Some(channel)) => channel.enqueue(ChannelTask::Eof),
            (ConnectionMessage::Close(_), Some(channel)) => channel.enqueue(ChannelTask::Close),
            (ConnectionMessage::Request(request), Some(channel)) => {
                channel.enqueue(ChannelTask::Request(request))
            }
            (message, None) => {
                return Err(SkiffError::Protocol(format!(
                    "connection message without a channel: {:?}",
                    message
                )))
            }
        }
        Ok(true)
    }

    async fn on_open(&self, open: ChannelOpen) -> SkiffResult<()> {
        let kind_name = open.kind.name().to_string();
        let refuse = |refusal: OpenRefusal| -> SkiffResult<()> {
            logging::log_channel_open_failed(&kind_name, refusal.reason as u32, &refusal.description);
            let failure = ChannelOpenFailure::with_description(
                open.sender_channel,
                refusal.reason,
                refusal.description,
            );
            self.transport.send(failure.to_bytes())
        };

        if open.maximum_packet_size < MIN_CHANNEL_PACKET_SIZE
            || open.initial_window_size < MIN_CHANNEL_PACKET_SIZE
        {
            return refuse(OpenRefusal {
                reason: ChannelOpenFailureReason::AdministrativelyProhibited,
                description: format!(
                    "packet size {} or window {} below {}",
                    open.maximum_packet_size, open.initial_window_size, MIN_CHANNEL_PACKET_SIZE
                ),
            });
        }
        if matches!(open.kind, ChannelKind::Unknown { .. }) {
            return refuse(OpenRefusal::new(ChannelOpenFailureReason::UnknownChannelType));
        }
        let factory = match &self.factory {
            Some(factory) => factory.clone(),
            None => {
                return refuse(OpenRefusal {
                    reason: ChannelOpenFailureReason::AdministrativelyProhibited,
                    description: "channels are not accepted".to_string(),
                })
            }
        };
        let local_id = match lock(&self.table).reserve() {
            Some(id) => id,
            None => return refuse(OpenRefusal::new(ChannelOpenFailureReason::ResourceShortage)),
        };

        let accepted = match factory.open(&open.kind).await {
            Ok(accepted) => accepted,
            Err(refusal) => {
                lock(&self.table).cancel(local_id);
                return refuse(refusal);
            }
        };
        if let Err(e) = accepted.config.validate() {
            lock(&self.table).cancel(local_id);
            return refuse(OpenRefusal {
                reason: ChannelOpenFailureReason::ConnectFailed,
                description: e.to_string(),
            });
        }
        if self.is_disconnected() {
            lock(&self.table).cancel(local_id);
            return Ok(());
        }

        let config = accepted.config;
        let confirmation = ChannelOpenConfirmation {
            recipient_channel: open.sender_channel,
            sender_channel: local_id,
            initial_window_size: config.window_maximum,
            maximum_packet_size: config.max_packet_size,
        };
        let handle = self.spawn_channel(
            local_id,
            open.kind.clone(),
            config,
            accepted.listener,
            Some(RemoteEnd {
                id: open.sender_channel,
                window: open.initial_window_size,
                max_packet_size: open.maximum_packet_size,
            }),
        );
        lock(&self.table).activate(local_id, handle.shared().clone());

        self.transport.send(confirmation.to_bytes())?;
        logging::log_channel_opened(local_id, open.sender_channel, &kind_name, true);
        if let Some(tx) = lock(&self.accepted_tx).as_ref() {
            let _ = tx.send(handle);
        }
        Ok(())
    }

    async fn on_global_request(&self, request: GlobalRequest) -> SkiffResult<()> {
        let response = match request.name.as_str() {
            "tcpip-forward" => match &self.forwarding {
                Some(forwarding) => {
                    let target = TcpipForward::from_data(&request.data)?;
                    match forwarding.forward(&target.address, target.port).await {
                        // only a request for port 0 gets the bound port back
                        Ok(bound) if target.port == 0 => Some(bound.to_be_bytes().to_vec()),
                        Ok(_) => Some(Vec::new()),
                        Err(e) => {
                            debug!(error = %e, "tcpip-forward refused");
                            None
                        }
                    }
                }
                None => None,
            },
            "cancel-tcpip-forward" => match &self.forwarding {
                Some(forwarding) => {
                    let target = TcpipForward::from_data(&request.data)?;
                    match forwarding.cancel(&target.address, target.port).await {
                        Ok(()) => Some(Vec::new()),
                        Err(e) => {
                            debug!(error = %e, "cancel-tcpip-forward refused");
                            None
                        }
                    }
                }
                None => None,
            },
            KEEPALIVE_REQUEST => Some(Vec::new()),
            name => match self.handlers.get(name) {
                Some(handler) => handler.handle(&request).await,
                None => None,
            },
        };

        logging::log_global_request(&request.name, true, Some(response.is_some()));
        if request.want_reply {
            let reply = GlobalReply {
                success: response.is_some(),
                data: response.unwrap_or_default(),
            };
            self.transport.send(reply.to_bytes())?;
        }
        Ok(())
    }

    fn on_global_reply(&self, reply: GlobalReply) {
        let waiter = lock(&self.pending_globals).pop_front();
        match waiter {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => warn!(success = reply.success, "Global reply without a pending request"),
        }
    }

    /// Force-closes channels idle longer than their configured timeout.
    ///
    /// Returns how many were closed.
    pub fn sweep_idle(&self) -> usize {
        let channels = lock(&self.table).active();
        let mut closed = 0;
        for channel in channels {
            if let (Some(limit), Some(idle)) = (channel.idle_timeout(), channel.idle_for()) {
                if idle >= limit {
                    logging::log_channel_idle(channel.local_id(), idle.as_millis() as u64);
                    channel.force_close();
                    closed += 1;
                }
            }
        }
        closed
    }

    /// Tears everything down after the transport ended.
    ///
    /// Fails pending opens and global requests, wakes every waiter and
    /// force-closes all channels. Idempotent.
    pub fn on_disconnect(&self) {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return;
        }
        lock(&self.pending_globals).clear();
        lock(&self.accepted_tx).take();
        let channels = lock(&self.table).active();
        debug!(channels = channels.len(), "Tearing down channels");
        for channel in channels {
            channel.disconnect();
        }
    }
}
