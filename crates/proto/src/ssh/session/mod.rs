//! SSH session: a transport, its multiplexer and the task driving the socket.
//!
//! [`SessionBuilder::start`] takes any connected byte stream, spawns the
//! reactor and returns once the first key exchange has completed. Channels
//! are then opened and accepted through the [`Session`].
//!
//! # Example
//!
//! ```rust,ignore
//! let session = SessionBuilder::new(TransportConfig::client())
//!     .with_multiplexer_config(MultiplexerConfig::default().with_keepalive(
//!         Duration::from_secs(30),
//!         Duration::from_secs(10),
//!     ))
//!     .start(stream)
//!     .await?;
//!
//! let channel = session
//!     .open_channel(ChannelKind::Session, ChannelConfig::default())
//!     .await?;
//! channel.send(b"hello").await?;
//! ```

pub mod keepalive;
mod reactor;

pub use keepalive::KeepaliveTask;

use super::channel::{ChannelHandle, ChannelListener};
use super::config::{ChannelConfig, MultiplexerConfig};
use super::connection::{ChannelKind, GlobalReply};
use super::message::DisconnectReason;
use super::multiplexer::{ChannelFactory, GlobalRequestHandler, Multiplexer, PortForwarding};
use super::transport::{TransportCodec, TransportConfig, TransportState, TransportStats};
use reactor::Reactor;
use skiff_platform::{SkiffError, SkiffResult};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Default bound on the initial handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Assembles a [`Session`].
pub struct SessionBuilder {
    transport_config: TransportConfig,
    multiplexer_config: MultiplexerConfig,
    factory: Option<Arc<dyn ChannelFactory>>,
    forwarding: Option<Arc<dyn PortForwarding>>,
    handlers: Vec<(String, Arc<dyn GlobalRequestHandler>)>,
    handshake_timeout: Duration,
}

impl SessionBuilder {
    /// Starts from a transport configuration and multiplexer defaults.
    pub fn new(transport_config: TransportConfig) -> Self {
        Self {
            transport_config,
            multiplexer_config: MultiplexerConfig::default(),
            factory: None,
            forwarding: None,
            handlers: Vec::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Connection-layer settings.
    pub fn with_multiplexer_config(mut self, config: MultiplexerConfig) -> Self {
        self.multiplexer_config = config;
        self
    }

    /// Decides on channels opened by the peer.
    pub fn with_channel_factory(mut self, factory: Arc<dyn ChannelFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Backs `tcpip-forward` requests from the peer.
    pub fn with_port_forwarding(mut self, forwarding: Arc<dyn PortForwarding>) -> Self {
        self.forwarding = Some(forwarding);
        self
    }

    /// Answers global requests named `name`.
    pub fn with_global_handler(
        mut self,
        name: impl Into<String>,
        handler: Arc<dyn GlobalRequestHandler>,
    ) -> Self {
        self.handlers.push((name.into(), handler));
        self
    }

    /// Bounds identification exchange plus the first key exchange.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Runs the protocol over `stream`.
    ///
    /// Returns once keys are in place. On a handshake failure or timeout
    /// the connection is torn down and the error returned.
    pub async fn start<S>(self, stream: S) -> SkiffResult<Session>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        if self.handshake_timeout.is_zero() {
            return Err(SkiffError::Config(
                "handshake timeout must be positive".to_string(),
            ));
        }
        let role = self.transport_config.role;
        let (codec, output) = TransportCodec::new(self.transport_config)?;
        let transport = Arc::new(codec);

        let mut multiplexer = Multiplexer::new(transport.clone(), self.multiplexer_config)?;
        if let Some(factory) = self.factory {
            multiplexer = multiplexer.with_channel_factory(factory);
        }
        if let Some(forwarding) = self.forwarding {
            multiplexer = multiplexer.with_port_forwarding(forwarding);
        }
        for (name, handler) in self.handlers {
            multiplexer = multiplexer.with_global_handler(name, handler);
        }
        let multiplexer = Arc::new(multiplexer);

        let (ready_tx, ready_rx) = oneshot::channel();
        let (done_tx, done_rx) = watch::channel(false);
        let reactor = Reactor {
            stream,
            transport: transport.clone(),
            multiplexer: multiplexer.clone(),
            output,
            ready: Some(ready_tx),
        };
        let reactor = tokio::spawn(async move {
            let result = reactor.run().await;
            let _ = done_tx.send(true);
            result
        });

        let mut session = Session {
            transport,
            multiplexer,
            reactor,
            done: done_rx,
            keepalive: None,
            sweeper: None,
        };

        match tokio::time::timeout(self.handshake_timeout, ready_rx).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => return Err(e),
            Ok(Err(_)) => {
                return Err(SkiffError::Disconnected(
                    "connection ended during handshake".to_string(),
                ))
            }
            Err(_) => {
                session.disconnect(DisconnectReason::ByApplication, "handshake timed out");
                return Err(SkiffError::timeout("SSH handshake timed out"));
            }
        }

        info!(role = role.as_str(), "SSH session established");
        session.spawn_background();
        Ok(session)
    }
}

/// An established SSH connection.
///
/// Dropping the session disconnects it.
pub struct Session {
    transport: Arc<TransportCodec>,
    multiplexer: Arc<Multiplexer>,
    reactor: JoinHandle<SkiffResult<()>>,
    done: watch::Receiver<bool>,
    keepalive: Option<KeepaliveTask>,
    sweeper: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("transport", &self.transport)
            .field("multiplexer", &self.multiplexer)
            .finish_non_exhaustive()
    }
}

impl Session {
    fn spawn_background(&mut self) {
        let config = self.multiplexer.config().clone();

        if let Some(interval) = config.keepalive_interval {
            let mut task = KeepaliveTask::new(interval);
            let probe_mux = Arc::downgrade(&self.multiplexer);
            let multiplexer = self.multiplexer.clone();
            task.start(
                move || {
                    let mux = probe_mux.clone();
                    async move {
                        match mux.upgrade() {
                            Some(mux) => mux.ping().await,
                            None => Err(SkiffError::Disconnected("session dropped".to_string())),
                        }
                    }
                },
                move |_| {
                    if multiplexer.is_disconnected() {
                        return;
                    }
                    multiplexer
                        .transport()
                        .disconnect(DisconnectReason::ConnectionLost, "keep-alive timeout");
                    multiplexer.on_disconnect();
                },
            );
            self.keepalive = Some(task);
        }

        let multiplexer: Weak<Multiplexer> = Arc::downgrade(&self.multiplexer);
        let period = config.idle_sweep_interval;
        self.sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(mux) = multiplexer.upgrade() else {
                    break;
                };
                if mux.is_disconnected() {
                    break;
                }
                let closed = mux.sweep_idle();
                if closed > 0 {
                    debug!(closed, "Idle channels closed");
                }
            }
        }));
    }

    /// Opens a channel whose traffic is buffered for `receive()`.
    pub async fn open_channel(
        &self,
        kind: ChannelKind,
        config: ChannelConfig,
    ) -> SkiffResult<ChannelHandle> {
        self.multiplexer.open_channel(kind, config, None).await
    }

    /// Opens a channel whose traffic goes to `listener`.
    pub async fn open_channel_with_listener(
        &self,
        kind: ChannelKind,
        config: ChannelConfig,
        listener: Arc<dyn ChannelListener>,
    ) -> SkiffResult<ChannelHandle> {
        self.multiplexer
            .open_channel(kind, config, Some(listener))
            .await
    }

    /// Waits for the next channel the peer opened and the factory accepted.
    pub async fn accept(&self) -> Option<ChannelHandle> {
        self.multiplexer.accept().await
    }

    /// Sends a global request; with `want_reply`, waits for the answer.
    pub async fn send_global_request(
        &self,
        name: &str,
        data: Vec<u8>,
        want_reply: bool,
    ) -> SkiffResult<Option<GlobalReply>> {
        self.multiplexer
            .send_global_request(name, data, want_reply)
            .await
    }

    /// Sends DISCONNECT and fails everything outstanding. Idempotent.
    pub fn disconnect(&self, reason: DisconnectReason, description: &str) {
        self.transport.disconnect(reason, description);
        self.multiplexer.on_disconnect();
    }

    /// Waits until the reactor has stopped.
    pub async fn closed(&self) {
        let mut done = self.done.clone();
        while !*done.borrow_and_update() {
            if done.changed().await.is_err() {
                break;
            }
        }
    }

    /// True while the reactor runs and the transport is up.
    pub fn is_connected(&self) -> bool {
        !self.reactor.is_finished() && self.transport.state() != TransportState::Disconnected
    }

    /// Starts a key re-exchange.
    pub fn rekey(&self) -> SkiffResult<()> {
        self.transport.rekey()
    }

    /// Exchange hash of the first key exchange.
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.transport.session_id()
    }

    /// Transport counters.
    pub fn stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// The transport codec.
    pub fn transport(&self) -> &Arc<TransportCodec> {
        &self.transport
    }

    /// The channel multiplexer.
    pub fn multiplexer(&self) -> &Arc<Multiplexer> {
        &self.multiplexer
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(mut task) = self.keepalive.take() {
            task.stop();
        }
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        self.disconnect(DisconnectReason::ByApplication, "session closed");
    }
}
