//! SSH channels (RFC 4254 Section 5).
//!
//! A channel is owned by the multiplexer's table and reached through a
//! cloneable [`ChannelHandle`]. Inbound traffic for a channel (data, EOF,
//! CLOSE and requests) runs on one spawned task per channel, in arrival
//! order. WINDOW_ADJUST and request replies are applied inline by the
//! multiplexer.
//!
//! Received data goes either to a [`ChannelListener`] supplied when the
//! channel was opened, or to a pair of [`ReceiveCache`]s read through
//! [`ChannelHandle::receive`] and [`ChannelHandle::receive_extended`].

use super::cache::ReceiveCache;
use super::config::{ChannelConfig, MultiplexerConfig};
use super::connection::{
    ChannelClose, ChannelData, ChannelEof, ChannelExtendedData, ChannelKind, ChannelReply,
    ChannelRequest, ChannelWindowAdjust, EXTENDED_DATA_STDERR,
};
use super::logging;
use super::multiplexer::ChannelTable;
use super::sync::{in_reactor, lock, wait_until};
use super::transport::TransportCodec;
use super::window::WindowLedger;
use async_trait::async_trait;
use bytes::Bytes;
use skiff_platform::{SkiffError, SkiffResult};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, warn};

/// Channel lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Open requested, no answer yet
    Uninitialized,
    /// Confirmed by both sides
    Open,
    /// Closed; terminal
    Closed,
}

/// Receives a channel's inbound traffic instead of the receive caches.
///
/// Callbacks run on the channel's ordered task, so they may send on the
/// channel but should not block for long.
#[async_trait]
pub trait ChannelListener: Send + Sync {
    /// Channel data arrived.
    async fn on_data(&self, channel: &ChannelHandle, data: Bytes);

    /// Extended data (e.g. stderr) arrived.
    async fn on_extended_data(&self, _channel: &ChannelHandle, _data_type: u32, _data: Bytes) {}

    /// The peer will send no more data.
    async fn on_eof(&self, _channel: &ChannelHandle) {}

    /// The channel is closed and its id released.
    async fn on_close(&self, _channel: &ChannelHandle) {}

    /// Answers a channel request. The default refuses everything.
    async fn on_request(&self, _channel: &ChannelHandle, _request: &ChannelRequest) -> bool {
        false
    }

    /// Whether a non-forced [`close`](ChannelHandle::close) may send CLOSE now.
    fn can_close(&self, _channel: &ChannelHandle) -> bool {
        true
    }
}

/// Timeouts a channel inherits from the multiplexer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ChannelTiming {
    pub(crate) poll_interval: Duration,
    pub(crate) window_timeout: Duration,
    pub(crate) write_timeout: Duration,
    pub(crate) request_timeout: Duration,
    pub(crate) close_timeout: Duration,
}

impl From<&MultiplexerConfig> for ChannelTiming {
    fn from(config: &MultiplexerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            window_timeout: config.window_timeout,
            write_timeout: config.write_timeout,
            request_timeout: config.global_request_timeout,
            close_timeout: config.close_timeout,
        }
    }
}

/// Work for a channel's ordered task.
#[derive(Debug)]
pub(crate) enum ChannelTask {
    Data(Bytes),
    ExtendedData(u32, Bytes),
    Eof,
    Close,
    Request(ChannelRequest),
    Complete { forced: bool },
}

/// The peer's side of an open channel.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RemoteEnd {
    pub(crate) id: u32,
    pub(crate) window: u32,
    pub(crate) max_packet_size: u32,
}

#[derive(Debug)]
struct ChannelInner {
    state: ChannelState,
    remote_id: u32,
    remote: WindowLedger,
    local: WindowLedger,
    local_eof: bool,
    remote_eof: bool,
    sent_close: bool,
    received_close: bool,
    completed_close: bool,
    halted: bool,
    disconnected: bool,
    open_failure: Option<(u32, String)>,
    last_activity: Instant,
    pending_requests: VecDeque<oneshot::Sender<bool>>,
}

impl ChannelInner {
    fn check_writable(&self) -> SkiffResult<()> {
        if self.disconnected {
            return Err(SkiffError::Disconnected(
                "transport disconnected".to_string(),
            ));
        }
        if self.state != ChannelState::Open || self.sent_close || self.received_close {
            return Err(SkiffError::Channel("channel is closed".to_string()));
        }
        if self.local_eof {
            return Err(SkiffError::Channel("EOF already sent".to_string()));
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

pub(crate) struct ChannelShared {
    local_id: u32,
    kind: ChannelKind,
    config: ChannelConfig,
    timing: ChannelTiming,
    transport: Arc<TransportCodec>,
    inner: Mutex<ChannelInner>,
    window_ready: Notify,
    state_changed: Notify,
    send_lock: tokio::sync::Mutex<()>,
    cache: Option<ReceiveCache>,
    extended_cache: Option<ReceiveCache>,
    listener: Option<Arc<dyn ChannelListener>>,
    queue: mpsc::UnboundedSender<ChannelTask>,
    table: Weak<Mutex<ChannelTable>>,
}

/// Cloneable handle to one channel.
#[derive(Clone)]
pub struct ChannelHandle {
    shared: Arc<ChannelShared>,
}

impl std::fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("local_id", &self.shared.local_id)
            .field("kind", &self.shared.kind.name())
            .field("state", &self.state())
            .finish()
    }
}

/// Everything needed to create a channel record.
pub(crate) struct ChannelParams {
    pub(crate) local_id: u32,
    pub(crate) kind: ChannelKind,
    pub(crate) config: ChannelConfig,
    pub(crate) timing: ChannelTiming,
    pub(crate) transport: Arc<TransportCodec>,
    pub(crate) listener: Option<Arc<dyn ChannelListener>>,
    pub(crate) table: Weak<Mutex<ChannelTable>>,
    /// Known for inbound opens; outbound ones learn it from the confirmation.
    pub(crate) remote: Option<RemoteEnd>,
}

impl ChannelHandle {
    /// Creates the channel record and spawns its ordered task.
    pub(crate) fn spawn(params: ChannelParams) -> Self {
        let (queue, tasks) = mpsc::unbounded_channel();
        let config = params.config;
        let caches = params.listener.is_none();
        let (state, remote_id, remote) = match params.remote {
            Some(end) => (
                ChannelState::Open,
                end.id,
                WindowLedger::new(end.window, 0, end.max_packet_size),
            ),
            None => (ChannelState::Uninitialized, 0, WindowLedger::new(0, 0, 0)),
        };

        let shared = Arc::new(ChannelShared {
            local_id: params.local_id,
            kind: params.kind,
            timing: params.timing,
            transport: params.transport,
            inner: Mutex::new(ChannelInner {
                state,
                remote_id,
                remote,
                local: WindowLedger::new(
                    config.window_maximum,
                    config.window_minimum,
                    config.max_packet_size,
                ),
                local_eof: false,
                remote_eof: false,
                sent_close: false,
                received_close: false,
                completed_close: false,
                halted: false,
                disconnected: false,
                open_failure: None,
                last_activity: Instant::now(),
                pending_requests: VecDeque::new(),
            }),
            window_ready: Notify::new(),
            state_changed: Notify::new(),
            send_lock: tokio::sync::Mutex::new(()),
            cache: caches.then(|| ReceiveCache::new(config.cache_capacity, params.timing.poll_interval)),
            extended_cache: caches
                .then(|| ReceiveCache::new(config.cache_capacity, params.timing.poll_interval)),
            listener: params.listener,
            queue,
            table: params.table,
            config,
        });

        let handle = Self { shared };
        tokio::spawn(handle.clone().run_ordered(tasks));
        handle
    }

    /// Local channel id.
    pub fn local_id(&self) -> u32 {
        self.shared.local_id
    }

    /// Peer's channel id (zero until the open is confirmed).
    pub fn remote_id(&self) -> u32 {
        lock(&self.shared.inner).remote_id
    }

    /// Channel kind.
    pub fn kind(&self) -> &ChannelKind {
        &self.shared.kind
    }

    /// Local configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    /// Lifecycle state.
    pub fn state(&self) -> ChannelState {
        lock(&self.shared.inner).state
    }

    /// True while the channel is open.
    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// True once the peer sent EOF.
    pub fn is_eof(&self) -> bool {
        lock(&self.shared.inner).remote_eof
    }

    /// Credit the peer has granted us.
    pub fn remote_window(&self) -> u32 {
        lock(&self.shared.inner).remote.space()
    }

    /// Credit we have granted the peer.
    pub fn local_window(&self) -> u32 {
        lock(&self.shared.inner).local.space()
    }

    /// Sends data, waiting for window credit as needed.
    ///
    /// Returns once the reactor has written the final chunk. Concurrent
    /// sends on one channel are serialized.
    pub async fn send(&self, data: &[u8]) -> SkiffResult<()> {
        self.send_stream(None, data).await
    }

    /// Sends extended data of type `data_type` (1 = stderr).
    pub async fn send_extended(&self, data_type: u32, data: &[u8]) -> SkiffResult<()> {
        self.send_stream(Some(data_type), data).await
    }

    /// Sends stderr data.
    pub async fn send_stderr(&self, data: &[u8]) -> SkiffResult<()> {
        self.send_extended(EXTENDED_DATA_STDERR, data).await
    }

    async fn send_stream(&self, data_type: Option<u32>, data: &[u8]) -> SkiffResult<()> {
        if in_reactor() {
            return Err(SkiffError::Channel(
                "channel send called from the reactor task".to_string(),
            ));
        }
        let shared = &self.shared;
        let _serial = shared.send_lock.lock().await;
        lock(&shared.inner).check_writable()?;

        let mut offset = 0;
        let mut receipt = None;
        while offset < data.len() {
            let deadline = tokio::time::Instant::now() + shared.timing.window_timeout;
            let remaining = data.len() - offset;
            let (n, remote_id) = wait_until(
                &shared.window_ready,
                shared.timing.poll_interval,
                Some(deadline),
                || {
                    let mut inner = lock(&shared.inner);
                    if let Err(e) = inner.check_writable() {
                        return Some(Err(e));
                    }
                    let n = inner.remote.next_chunk(remaining);
                    if n == 0 {
                        return None;
                    }
                    if let Err(e) = inner.remote.consume(n as u32) {
                        return Some(Err(e));
                    }
                    inner.touch();
                    Some(Ok((n, inner.remote_id)))
                },
            )
            .await
            .ok_or_else(|| SkiffError::timeout("timed out waiting for window space"))??;

            let chunk = data[offset..offset + n].to_vec();
            let payload = match data_type {
                None => ChannelData::new(remote_id, chunk).to_bytes(),
                Some(data_type_code) => ChannelExtendedData {
                    recipient_channel: remote_id,
                    data_type_code,
                    data: chunk,
                }
                .to_bytes(),
            };
            offset += n;
            if offset == data.len() {
                receipt = Some(shared.transport.send_confirmed(payload)?);
            } else {
                shared.transport.send(payload)?;
            }
        }

        match receipt {
            Some(receipt) => match tokio::time::timeout(shared.timing.write_timeout, receipt).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(SkiffError::Disconnected(
                    "transport closed before the write completed".to_string(),
                )),
                Err(_) => Err(SkiffError::timeout("write confirmation timed out")),
            },
            None => Ok(()),
        }
    }

    /// Reads buffered data, waiting until some arrives.
    ///
    /// Returns `Ok(None)` at end-of-stream. Fails for channels delivering to
    /// a listener.
    pub async fn receive(&self) -> SkiffResult<Option<Bytes>> {
        self.cache(false)?.get(usize::MAX).await
    }

    /// Like [`receive`](Self::receive) but gives up after `timeout`.
    pub async fn receive_timeout(&self, timeout: Duration) -> SkiffResult<Option<Bytes>> {
        self.cache(false)?.get_timeout(usize::MAX, timeout).await
    }

    /// Reads buffered extended data.
    pub async fn receive_extended(&self) -> SkiffResult<Option<Bytes>> {
        self.cache(true)?.get(usize::MAX).await
    }

    fn cache(&self, extended: bool) -> SkiffResult<&ReceiveCache> {
        let cache = if extended {
            self.shared.extended_cache.as_ref()
        } else {
            self.shared.cache.as_ref()
        };
        cache.ok_or_else(|| {
            SkiffError::Channel("channel delivers to a listener".to_string())
        })
    }

    /// Sends EOF. Later calls do nothing.
    pub fn send_eof(&self) -> SkiffResult<()> {
        let remote_id = {
            let mut inner = lock(&self.shared.inner);
            if inner.local_eof {
                return Ok(());
            }
            inner.check_writable()?;
            inner.local_eof = true;
            inner.remote_id
        };
        self.shared.transport.send(
            ChannelEof {
                recipient_channel: remote_id,
            }
            .to_bytes(),
        )
    }

    /// Closes the channel and waits for the close to complete.
    ///
    /// A graceful close sends CLOSE only when the listener's
    /// [`can_close`](ChannelListener::can_close) agrees, then waits for the
    /// peer's CLOSE; if none arrives in time the close is forced. A forced
    /// close sends CLOSE (if not yet sent) and completes without waiting for
    /// the peer.
    pub async fn close(&self, force: bool) -> SkiffResult<()> {
        let allowed = force
            || self
                .shared
                .listener
                .as_ref()
                .map_or(true, |listener| listener.can_close(self));

        {
            let inner = lock(&self.shared.inner);
            if inner.completed_close {
                return Ok(());
            }
            if !allowed && !inner.sent_close {
                debug!(local_id = self.shared.local_id, "Close deferred by listener");
                return Ok(());
            }
        }

        self.send_close();
        if force {
            self.shared.enqueue(ChannelTask::Complete { forced: true });
        }

        let shared = &self.shared;
        let deadline = tokio::time::Instant::now() + shared.timing.close_timeout;
        let done = wait_until(&shared.state_changed, shared.timing.poll_interval, Some(deadline), || {
            lock(&shared.inner).completed_close.then_some(())
        })
        .await;

        if done.is_none() {
            if force {
                return Err(SkiffError::timeout("channel close timed out"));
            }
            warn!(local_id = shared.local_id, "Peer did not answer CLOSE, forcing");
            shared.enqueue(ChannelTask::Complete { forced: true });
            let deadline = tokio::time::Instant::now() + shared.timing.close_timeout;
            wait_until(&shared.state_changed, shared.timing.poll_interval, Some(deadline), || {
                lock(&shared.inner).completed_close.then_some(())
            })
            .await
            .ok_or_else(|| SkiffError::timeout("channel close timed out"))?;
        }
        Ok(())
    }

    /// Waits until the channel has fully closed.
    pub async fn closed(&self) {
        let shared = &self.shared;
        let _ = wait_until(&shared.state_changed, shared.timing.poll_interval, None, || {
            lock(&shared.inner).completed_close.then_some(())
        })
        .await;
    }

    /// Stops replenishing the local window.
    pub fn halt(&self) {
        lock(&self.shared.inner).halted = true;
    }

    /// Restarts window replenishment, sending an adjust if one is due.
    pub fn resume(&self) {
        lock(&self.shared.inner).halted = false;
        self.shared.replenish();
    }

    /// Sends a channel request and, if `want_reply`, waits for the answer.
    ///
    /// Replies are matched to requests in the order they were sent.
    pub async fn request(&self, name: &str, data: Vec<u8>, want_reply: bool) -> SkiffResult<bool> {
        let request = |recipient_channel| ChannelRequest {
            recipient_channel,
            name: name.to_string(),
            want_reply,
            data,
        };

        let reply = {
            let mut inner = lock(&self.shared.inner);
            inner.check_writable().or_else(|e| match e {
                // requests such as exit-status follow our EOF
                SkiffError::Channel(_) if inner.local_eof && !inner.sent_close => Ok(()),
                e => Err(e),
            })?;
            let payload = request(inner.remote_id).to_bytes();
            // sent under the lock so wire order matches the reply queue
            let reply = if want_reply {
                let (tx, rx) = oneshot::channel();
                inner.pending_requests.push_back(tx);
                Some(rx)
            } else {
                None
            };
            self.shared.transport.send(payload)?;
            reply
        };

        match reply {
            Some(rx) => match tokio::time::timeout(self.shared.timing.request_timeout, rx).await {
                Ok(Ok(success)) => Ok(success),
                Ok(Err(_)) => Err(SkiffError::Channel(
                    "channel closed before the request was answered".to_string(),
                )),
                Err(_) => Err(SkiffError::timeout("channel request timed out")),
            },
            None => Ok(true),
        }
    }

    fn send_close(&self) {
        let remote_id = {
            let mut inner = lock(&self.shared.inner);
            if inner.sent_close || inner.disconnected || inner.state != ChannelState::Open {
                return;
            }
            inner.sent_close = true;
            inner.remote_id
        };
        let payload = ChannelClose {
            recipient_channel: remote_id,
        }
        .to_bytes();
        if let Err(e) = self.shared.transport.send(payload) {
            debug!(local_id = self.shared.local_id, error = %e, "Could not send CLOSE");
        }
        self.shared.window_ready.notify_waiters();
    }

    async fn run_ordered(self, mut tasks: mpsc::UnboundedReceiver<ChannelTask>) {
        while let Some(task) = tasks.recv().await {
            match task {
                ChannelTask::Data(data) => self.on_data(None, data).await,
                ChannelTask::ExtendedData(code, data) => self.on_data(Some(code), data).await,
                ChannelTask::Eof => self.on_eof().await,
                ChannelTask::Close => {
                    lock(&self.shared.inner).received_close = true;
                    self.send_close();
                    self.complete(false).await;
                }
                ChannelTask::Request(request) => self.on_request(request).await,
                ChannelTask::Complete { forced } => self.complete(forced).await,
            }
            if lock(&self.shared.inner).completed_close {
                break;
            }
        }
    }

    async fn on_data(&self, data_type: Option<u32>, data: Bytes) {
        let accepted = {
            let mut inner = lock(&self.shared.inner);
            if inner.completed_close || inner.received_close {
                return;
            }
            if inner.remote_eof {
                Err(SkiffError::Channel("data after EOF".to_string()))
            } else {
                inner.touch();
                inner.local.consume(data.len() as u32)
            }
        };
        if let Err(e) = accepted {
            logging::log_channel_violation(self.shared.local_id, &e.to_string());
            self.send_close();
            self.complete(true).await;
            return;
        }

        match (&self.shared.listener, data_type) {
            (Some(listener), None) => listener.on_data(self, data).await,
            (Some(listener), Some(code)) => listener.on_extended_data(self, code, data).await,
            (None, data_type) => {
                let cache = if data_type.is_some() {
                    &self.shared.extended_cache
                } else {
                    &self.shared.cache
                };
                if let Some(cache) = cache {
                    if let Err(e) = cache.put(&data).await {
                        debug!(local_id = self.shared.local_id, error = %e, "Dropped data");
                    }
                }
            }
        }

        self.shared.replenish();
    }

    async fn on_eof(&self) {
        {
            let mut inner = lock(&self.shared.inner);
            if inner.remote_eof || inner.completed_close {
                return;
            }
            inner.remote_eof = true;
        }
        self.shared.close_caches();
        if let Some(listener) = &self.shared.listener {
            listener.on_eof(self).await;
        }
    }

    async fn on_request(&self, request: ChannelRequest) {
        debug!(
            local_id = self.shared.local_id,
            request = %request.name,
            want_reply = request.want_reply,
            "Channel request"
        );
        let success = match &self.shared.listener {
            Some(listener) => listener.on_request(self, &request).await,
            None => false,
        };
        if request.want_reply {
            let remote_id = {
                let inner = lock(&self.shared.inner);
                if inner.sent_close || inner.disconnected {
                    return;
                }
                inner.remote_id
            };
            let reply = ChannelReply {
                recipient_channel: remote_id,
                success,
            };
            if let Err(e) = self.shared.transport.send(reply.to_bytes()) {
                debug!(local_id = self.shared.local_id, error = %e, "Could not answer request");
            }
        }
    }

    async fn complete(&self, forced: bool) {
        {
            let mut inner = lock(&self.shared.inner);
            if inner.completed_close {
                return;
            }
            inner.completed_close = true;
            inner.state = ChannelState::Closed;
            // dropping the senders fails outstanding requests
            inner.pending_requests.clear();
        }
        self.shared.close_caches();
        self.shared.window_ready.notify_waiters();
        self.shared.state_changed.notify_waiters();

        if let Some(listener) = &self.shared.listener {
            listener.on_close(self).await;
        }
        if let Some(table) = self.shared.table.upgrade() {
            lock(&table).release(&self.shared);
        }
        logging::log_channel_closed(self.shared.local_id, forced);
    }

    pub(crate) fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }

    pub(crate) fn from_shared(shared: Arc<ChannelShared>) -> Self {
        Self { shared }
    }
}

impl ChannelShared {
    pub(crate) fn local_id(&self) -> u32 {
        self.local_id
    }

    pub(crate) fn state(&self) -> ChannelState {
        lock(&self.inner).state
    }

    pub(crate) fn idle_timeout(&self) -> Option<Duration> {
        self.config.idle_timeout
    }

    pub(crate) fn enqueue(&self, task: ChannelTask) {
        if self.queue.send(task).is_err() {
            debug!(local_id = self.local_id, "Channel task queue closed");
        }
    }

    /// Applies an OPEN_CONFIRMATION. False if the channel was not waiting for one.
    pub(crate) fn confirm_open(&self, remote: RemoteEnd) -> bool {
        {
            let mut inner = lock(&self.inner);
            if inner.state != ChannelState::Uninitialized {
                return false;
            }
            inner.state = ChannelState::Open;
            inner.remote_id = remote.id;
            inner.remote = WindowLedger::new(remote.window, 0, remote.max_packet_size);
            inner.touch();
        }
        self.state_changed.notify_waiters();
        true
    }

    /// Applies an OPEN_FAILURE. False if the channel was not waiting for one.
    ///
    /// The caller releases the id.
    pub(crate) fn fail_open(&self, code: u32, description: String) -> bool {
        {
            let mut inner = lock(&self.inner);
            if inner.state != ChannelState::Uninitialized {
                return false;
            }
            inner.state = ChannelState::Closed;
            inner.completed_close = true;
            inner.open_failure = Some((code, description));
        }
        self.close_caches();
        self.state_changed.notify_waiters();
        // lets the ordered task exit
        self.enqueue(ChannelTask::Complete { forced: true });
        true
    }

    /// Waits for the open to be answered.
    pub(crate) async fn wait_open(&self, timeout: Duration) -> SkiffResult<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        let outcome = wait_until(&self.state_changed, self.timing.poll_interval, Some(deadline), || {
            let inner = lock(&self.inner);
            if inner.disconnected {
                return Some(Err(SkiffError::Disconnected(
                    "transport disconnected".to_string(),
                )));
            }
            match inner.state {
                ChannelState::Uninitialized => None,
                ChannelState::Open => Some(Ok(())),
                ChannelState::Closed => {
                    let (code, message) = inner
                        .open_failure
                        .clone()
                        .unwrap_or((0, "channel closed".to_string()));
                    Some(Err(SkiffError::Rejected { code, message }))
                }
            }
        })
        .await;
        outcome.unwrap_or_else(|| Err(SkiffError::timeout("channel open timed out")))
    }

    /// Abandons an open that was never answered. The caller releases the id.
    pub(crate) fn abandon_open(&self) {
        {
            let mut inner = lock(&self.inner);
            inner.state = ChannelState::Closed;
            inner.completed_close = true;
        }
        self.close_caches();
        self.enqueue(ChannelTask::Complete { forced: true });
    }

    /// Applies a WINDOW_ADJUST from the peer.
    pub(crate) fn credit(&self, amount: u32) -> SkiffResult<()> {
        let space = {
            let mut inner = lock(&self.inner);
            inner.remote.adjust(amount)?;
            inner.remote.space()
        };
        logging::log_window_adjust(self.local_id, "out", amount, space);
        self.window_ready.notify_waiters();
        Ok(())
    }

    /// Hands a CHANNEL_SUCCESS / FAILURE to the oldest outstanding request.
    pub(crate) fn request_reply(&self, success: bool) -> SkiffResult<()> {
        let waiter = lock(&self.inner).pending_requests.pop_front();
        match waiter {
            Some(tx) => {
                let _ = tx.send(success);
                Ok(())
            }
            None => Err(SkiffError::Channel(
                "reply without an outstanding request".to_string(),
            )),
        }
    }

    /// Time since the last data in either direction.
    pub(crate) fn idle_for(&self) -> Option<Duration> {
        let inner = lock(&self.inner);
        if inner.state != ChannelState::Open {
            return None;
        }
        Some(inner.last_activity.elapsed())
    }

    /// Force-closes without waiting (idle sweep, peer violations).
    pub(crate) fn force_close(self: &Arc<Self>) {
        ChannelHandle {
            shared: self.clone(),
        }
        .send_close();
        self.enqueue(ChannelTask::Complete { forced: true });
    }

    /// Tears the channel down after the transport is gone.
    ///
    /// Buffered receive data stays readable.
    pub(crate) fn disconnect(&self) {
        {
            let mut inner = lock(&self.inner);
            inner.disconnected = true;
            inner.pending_requests.clear();
        }
        self.close_caches();
        self.window_ready.notify_waiters();
        self.state_changed.notify_waiters();
        self.enqueue(ChannelTask::Complete { forced: true });
    }

    fn close_caches(&self) {
        if let Some(cache) = &self.cache {
            cache.close();
        }
        if let Some(cache) = &self.extended_cache {
            cache.close();
        }
    }

    /// Sends one WINDOW_ADJUST if the local window fell below its low watermark.
    fn replenish(&self) {
        let adjust = {
            let mut inner = lock(&self.inner);
            if inner.halted
                || inner.state != ChannelState::Open
                || inner.sent_close
                || inner.disconnected
                || !inner.local.is_low_watermark()
            {
                return;
            }
            let amount = inner.local.replenish_amount();
            if inner.local.adjust(amount).is_err() {
                return;
            }
            (inner.remote_id, amount, inner.local.space())
        };
        let (remote_id, amount, space) = adjust;
        logging::log_window_adjust(self.local_id, "in", amount, space);
        if let Err(e) = self
            .transport
            .send(ChannelWindowAdjust::new(remote_id, amount).to_bytes())
        {
            debug!(local_id = self.local_id, error = %e, "Could not send WINDOW_ADJUST");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::connection::ConnectionMessage;
    use crate::ssh::transport::testing::{connected, drain, server_config, Output};
    use crate::ssh::transport::{TransportConfig, TransportEvent};

    struct Pair {
        client: Arc<TransportCodec>,
        client_out: Output,
        server: Arc<TransportCodec>,
        _server_out: Output,
    }

    fn pair() -> Pair {
        let (client, client_out, server, server_out) =
            connected(TransportConfig::client(), server_config());
        Pair {
            client: Arc::new(client),
            client_out,
            server: Arc::new(server),
            _server_out: server_out,
        }
    }

    fn timing() -> ChannelTiming {
        ChannelTiming::from(
            &MultiplexerConfig::new()
                .with_poll_interval(Duration::from_millis(20))
                .with_write_timeout(Duration::from_secs(5))
                .with_close_timeout(Duration::from_millis(200)),
        )
    }

    fn channel(
        transport: Arc<TransportCodec>,
        config: ChannelConfig,
        remote: RemoteEnd,
        listener: Option<Arc<dyn ChannelListener>>,
    ) -> ChannelHandle {
        ChannelHandle::spawn(ChannelParams {
            local_id: 0,
            kind: ChannelKind::Session,
            config,
            timing: timing(),
            transport,
            listener,
            table: Weak::new(),
            remote: Some(remote),
        })
    }

    /// Writes the client's output into the server and returns the connection messages.
    fn deliver(pair: &mut Pair) -> Vec<ConnectionMessage> {
        let bytes = drain(&mut pair.client_out);
        if bytes.is_empty() {
            return Vec::new();
        }
        pair.server
            .receive(&bytes)
            .unwrap()
            .into_iter()
            .filter_map(|event| match event {
                TransportEvent::Message(packet) => ConnectionMessage::parse(&packet.payload).unwrap(),
                _ => None,
            })
            .collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_send_splits_by_packet_size_and_window() {
        let mut pair = pair();
        let handle = channel(
            pair.client.clone(),
            ChannelConfig::default(),
            RemoteEnd {
                id: 9,
                window: 4096,
                max_packet_size: 2048,
            },
            None,
        );

        let sender = handle.clone();
        let send = tokio::spawn(async move { sender.send(&[0x5a; 5000]).await });
        settle().await;

        let sizes: Vec<usize> = deliver(&mut pair)
            .into_iter()
            .map(|m| match m {
                ConnectionMessage::Data(d) => {
                    assert_eq!(d.recipient_channel, 9);
                    d.data.len()
                }
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(sizes, vec![2048, 2048]);
        assert_eq!(handle.remote_window(), 0);
        assert!(!send.is_finished());

        handle.shared().credit(4096).unwrap();
        settle().await;
        let sizes: Vec<usize> = deliver(&mut pair)
            .into_iter()
            .map(|m| match m {
                ConnectionMessage::Data(d) => d.data.len(),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(sizes, vec![904]);

        send.await.unwrap().unwrap();
        assert_eq!(handle.remote_window(), 4096 - 904);
    }

    #[tokio::test]
    async fn test_write_confirmation_timeout_is_io_error() {
        let pair = pair();
        let handle = ChannelHandle::spawn(ChannelParams {
            local_id: 0,
            kind: ChannelKind::Session,
            config: ChannelConfig::default(),
            timing: ChannelTiming {
                write_timeout: Duration::from_millis(50),
                ..timing()
            },
            transport: pair.client.clone(),
            listener: None,
            table: Weak::new(),
            remote: Some(RemoteEnd {
                id: 1,
                window: 65536,
                max_packet_size: 32768,
            }),
        });

        // nobody drains the writer queue
        let err = handle.send(b"stuck").await.unwrap_err();
        assert!(err.is_timeout());
        drop(pair);
    }

    #[tokio::test]
    async fn test_receive_replenishes_once_below_minimum() {
        let mut pair = pair();
        let config = ChannelConfig::default()
            .with_window(8192, 4096)
            .with_max_packet_size(4096)
            .with_cache_capacity(8192);
        let handle = channel(
            pair.client.clone(),
            config,
            RemoteEnd {
                id: 3,
                window: 65536,
                max_packet_size: 32768,
            },
            None,
        );

        handle.shared().enqueue(ChannelTask::Data(Bytes::from(vec![1u8; 4000])));
        settle().await;
        assert!(deliver(&mut pair).is_empty());
        assert_eq!(handle.local_window(), 4192);

        handle.shared().enqueue(ChannelTask::Data(Bytes::from(vec![2u8; 200])));
        settle().await;
        let adjusts = deliver(&mut pair);
        assert_eq!(adjusts.len(), 1);
        match &adjusts[0] {
            ConnectionMessage::WindowAdjust(adjust) => {
                assert_eq!(adjust.recipient_channel, 3);
                assert_eq!(adjust.bytes_to_add, 4200);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(handle.local_window(), 8192);

        let data = handle.receive().await.unwrap().unwrap();
        assert_eq!(data.len(), 4200);
    }

    #[tokio::test]
    async fn test_halt_defers_window_adjust() {
        let mut pair = pair();
        let config = ChannelConfig::default()
            .with_window(8192, 4096)
            .with_max_packet_size(8192)
            .with_cache_capacity(8192);
        let handle = channel(
            pair.client.clone(),
            config,
            RemoteEnd {
                id: 3,
                window: 65536,
                max_packet_size: 32768,
            },
            None,
        );

        handle.halt();
        handle.shared().enqueue(ChannelTask::Data(Bytes::from(vec![0u8; 6000])));
        settle().await;
        assert!(deliver(&mut pair).is_empty());

        handle.resume();
        let messages = deliver(&mut pair);
        assert!(matches!(
            messages.as_slice(),
            [ConnectionMessage::WindowAdjust(a)] if a.bytes_to_add == 6000
        ));
    }

    #[tokio::test]
    async fn test_window_overflow_closes_channel() {
        let mut pair = pair();
        let config = ChannelConfig::default()
            .with_window(4096, 1024)
            .with_max_packet_size(4096)
            .with_cache_capacity(4096);
        let handle = channel(
            pair.client.clone(),
            config,
            RemoteEnd {
                id: 5,
                window: 65536,
                max_packet_size: 32768,
            },
            None,
        );

        handle.shared().enqueue(ChannelTask::Data(Bytes::from(vec![0u8; 5000])));
        handle.closed().await;
        assert_eq!(handle.state(), ChannelState::Closed);
        assert!(deliver(&mut pair)
            .iter()
            .any(|m| matches!(m, ConnectionMessage::Close(c) if c.recipient_channel == 5)));
        assert!(pair.client.state() != crate::ssh::transport::TransportState::Disconnected);
    }

    #[tokio::test]
    async fn test_eof_after_data_drains_cache() {
        let pair = pair();
        let handle = channel(
            pair.client.clone(),
            ChannelConfig::default(),
            RemoteEnd {
                id: 1,
                window: 65536,
                max_packet_size: 32768,
            },
            None,
        );

        handle.shared().enqueue(ChannelTask::Data(Bytes::from_static(b"abc")));
        handle.shared().enqueue(ChannelTask::Eof);
        settle().await;

        assert!(handle.is_eof());
        assert_eq!(&handle.receive().await.unwrap().unwrap()[..], b"abc");
        assert_eq!(handle.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_eof_once_then_send_fails() {
        let mut pair = pair();
        let handle = channel(
            pair.client.clone(),
            ChannelConfig::default(),
            RemoteEnd {
                id: 2,
                window: 65536,
                max_packet_size: 32768,
            },
            None,
        );

        handle.send_eof().unwrap();
        handle.send_eof().unwrap();
        let eofs = deliver(&mut pair)
            .into_iter()
            .filter(|m| matches!(m, ConnectionMessage::Eof(_)))
            .count();
        assert_eq!(eofs, 1);
        assert!(matches!(
            handle.send(b"late").await,
            Err(SkiffError::Channel(_))
        ));
    }

    #[tokio::test]
    async fn test_peer_close_is_answered_and_completes() {
        let mut pair = pair();
        let handle = channel(
            pair.client.clone(),
            ChannelConfig::default(),
            RemoteEnd {
                id: 4,
                window: 65536,
                max_packet_size: 32768,
            },
            None,
        );

        handle.shared().enqueue(ChannelTask::Close);
        handle.closed().await;
        let closes = deliver(&mut pair)
            .into_iter()
            .filter(|m| matches!(m, ConnectionMessage::Close(c) if c.recipient_channel == 4))
            .count();
        assert_eq!(closes, 1);
        assert_eq!(handle.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_graceful_close_times_out_into_forced() {
        let pair = pair();
        let handle = channel(
            pair.client.clone(),
            ChannelConfig::default(),
            RemoteEnd {
                id: 4,
                window: 65536,
                max_packet_size: 32768,
            },
            None,
        );
        handle.close(false).await.unwrap();
        assert_eq!(handle.state(), ChannelState::Closed);
    }

    struct Recorder {
        seen: Mutex<Vec<String>>,
        allow_close: bool,
    }

    #[async_trait]
    impl ChannelListener for Recorder {
        async fn on_data(&self, _channel: &ChannelHandle, data: Bytes) {
            lock(&self.seen).push(format!("data:{}", data.len()));
        }

        async fn on_eof(&self, _channel: &ChannelHandle) {
            lock(&self.seen).push("eof".to_string());
        }

        async fn on_close(&self, _channel: &ChannelHandle) {
            lock(&self.seen).push("close".to_string());
        }

        async fn on_request(&self, _channel: &ChannelHandle, request: &ChannelRequest) -> bool {
            lock(&self.seen).push(format!("request:{}", request.name));
            request.name == "shell"
        }

        fn can_close(&self, _channel: &ChannelHandle) -> bool {
            self.allow_close
        }
    }

    #[tokio::test]
    async fn test_listener_sees_events_in_order() {
        let mut pair = pair();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            allow_close: true,
        });
        let handle = channel(
            pair.client.clone(),
            ChannelConfig::default(),
            RemoteEnd {
                id: 6,
                window: 65536,
                max_packet_size: 32768,
            },
            Some(recorder.clone()),
        );

        let shared = handle.shared();
        shared.enqueue(ChannelTask::Data(Bytes::from_static(b"12345")));
        shared.enqueue(ChannelTask::Request(ChannelRequest {
            recipient_channel: 0,
            name: "shell".to_string(),
            want_reply: true,
            data: vec![],
        }));
        shared.enqueue(ChannelTask::Eof);
        shared.enqueue(ChannelTask::Close);
        handle.closed().await;

        assert_eq!(
            *lock(&recorder.seen),
            vec!["data:5", "request:shell", "eof", "close"]
        );
        let messages = deliver(&mut pair);
        assert!(matches!(
            messages.first(),
            Some(ConnectionMessage::Reply(r)) if r.success && r.recipient_channel == 6
        ));
        assert!(matches!(handle.receive().await, Err(SkiffError::Channel(_))));
    }

    #[tokio::test]
    async fn test_close_deferred_by_listener() {
        let mut pair = pair();
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            allow_close: false,
        });
        let handle = channel(
            pair.client.clone(),
            ChannelConfig::default(),
            RemoteEnd {
                id: 6,
                window: 65536,
                max_packet_size: 32768,
            },
            Some(recorder),
        );

        handle.close(false).await.unwrap();
        assert!(handle.is_open());
        assert!(deliver(&mut pair).is_empty());

        handle.close(true).await.unwrap();
        assert_eq!(handle.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_request_replies_match_in_order() {
        let mut pair = pair();
        let handle = channel(
            pair.client.clone(),
            ChannelConfig::default(),
            RemoteEnd {
                id: 8,
                window: 65536,
                max_packet_size: 32768,
            },
            None,
        );

        let (a, b) = (handle.clone(), handle.clone());
        let first = tokio::spawn(async move { a.request("env", vec![], true).await });
        settle().await;
        let second = tokio::spawn(async move { b.request("exec", vec![], true).await });
        settle().await;

        let names: Vec<String> = deliver(&mut pair)
            .into_iter()
            .filter_map(|m| match m {
                ConnectionMessage::Request(r) => Some(r.name),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["env", "exec"]);

        handle.shared().request_reply(true).unwrap();
        handle.shared().request_reply(false).unwrap();
        assert!(first.await.unwrap().unwrap());
        assert!(!second.await.unwrap().unwrap());
        assert!(handle.shared().request_reply(true).is_err());
    }

    #[tokio::test]
    async fn test_send_from_reactor_task_is_rejected() {
        let pair = pair();
        let handle = channel(
            pair.client.clone(),
            ChannelConfig::default(),
            RemoteEnd {
                id: 1,
                window: 65536,
                max_packet_size: 32768,
            },
            None,
        );
        let result = crate::ssh::sync::REACTOR_TASK
            .scope((), async { handle.send(b"x").await })
            .await;
        assert!(matches!(result, Err(SkiffError::Channel(_))));
    }

    #[tokio::test]
    async fn test_disconnect_fails_sends_but_keeps_buffered_data() {
        let pair = pair();
        let handle = channel(
            pair.client.clone(),
            ChannelConfig::default(),
            RemoteEnd {
                id: 1,
                window: 0,
                max_packet_size: 32768,
            },
            None,
        );
        handle.shared().enqueue(ChannelTask::Data(Bytes::from_static(b"kept")));
        settle().await;

        let sender = handle.clone();
        let send = tokio::spawn(async move { sender.send(b"blocked").await });
        settle().await;
        handle.shared().disconnect();

        assert!(matches!(
            send.await.unwrap(),
            Err(SkiffError::Disconnected(_))
        ));
        assert_eq!(&handle.receive().await.unwrap().unwrap()[..], b"kept");
        assert_eq!(handle.receive().await.unwrap(), None);
    }
}
