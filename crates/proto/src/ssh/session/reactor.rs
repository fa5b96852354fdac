//! Socket driver.
//!
//! The reactor is the only code touching the stream. Its write half runs in
//! a task of its own, draining whatever the codec queues and confirming each
//! write, so a peer that is slow to read never stops inbound traffic. The
//! read half feeds every read to the codec and hands connection-layer
//! messages to the multiplexer. Reading runs inside the reactor task-local,
//! so channel sends issued from it fail fast instead of deadlocking on
//! window credit it would have to read itself.

use crate::ssh::multiplexer::Multiplexer;
use crate::ssh::sync::REACTOR_TASK;
use crate::ssh::transport::{TransportCodec, TransportEvent, WireWrite};
use skiff_platform::{SkiffError, SkiffResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const READ_BUFFER_SIZE: usize = 32 * 1024;

/// How long the writer may take to flush a final DISCONNECT.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct Reactor<S> {
    pub(crate) stream: S,
    pub(crate) transport: Arc<TransportCodec>,
    pub(crate) multiplexer: Arc<Multiplexer>,
    pub(crate) output: mpsc::UnboundedReceiver<WireWrite>,
    /// Resolved when the first key exchange completes or the connection ends.
    pub(crate) ready: Option<oneshot::Sender<SkiffResult<()>>>,
}

/// Which half stopped first.
enum Stopped {
    Reader(SkiffResult<()>),
    Writer(SkiffResult<()>),
}

impl<S> Reactor<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Drives the connection to its end.
    pub(crate) async fn run(self) -> SkiffResult<()> {
        REACTOR_TASK.scope((), self.drive()).await
    }

    async fn drive(self) -> SkiffResult<()> {
        let Reactor {
            stream,
            transport,
            multiplexer,
            output,
            mut ready,
        } = self;

        let (mut reader, writer) = tokio::io::split(stream);
        let mut writer = tokio::spawn(write_loop(writer, output));

        let stopped = match transport.start() {
            Ok(()) => {
                Self::read_loop(&mut reader, &transport, &multiplexer, &mut ready, &mut writer)
                    .await
            }
            Err(e) => Stopped::Reader(Err(e)),
        };

        // queues Close unless the codec already did; the writer flushes up to it
        transport.shutdown();
        let result = match stopped {
            Stopped::Writer(result) => result,
            Stopped::Reader(result) => {
                if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
                    debug!("Writer did not drain in time");
                    writer.abort();
                }
                result
            }
        };
        multiplexer.on_disconnect();

        let outcome = match &result {
            Ok(()) => Err(SkiffError::Disconnected("connection closed".to_string())),
            Err(e) => Err(SkiffError::Disconnected(e.to_string())),
        };
        if let Some(ready) = ready.take() {
            let _ = ready.send(outcome);
        }
        match &result {
            Ok(()) => info!("SSH connection closed"),
            Err(e) => info!(error = %e, "SSH connection ended"),
        }
        result
    }

    async fn read_loop(
        reader: &mut ReadHalf<S>,
        transport: &TransportCodec,
        multiplexer: &Multiplexer,
        ready: &mut Option<oneshot::Sender<SkiffResult<()>>>,
        writer: &mut JoinHandle<SkiffResult<()>>,
    ) -> Stopped {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                joined = &mut *writer => {
                    return Stopped::Writer(
                        joined.unwrap_or_else(|e| Err(SkiffError::Other(e.into()))),
                    );
                }
                read = reader.read(&mut buffer) => {
                    let n = match read {
                        Ok(n) => n,
                        Err(e) => return Stopped::Reader(Err(e.into())),
                    };
                    if n == 0 {
                        debug!("Peer closed the stream");
                        return Stopped::Reader(Err(SkiffError::Disconnected(
                            "connection closed by peer".to_string(),
                        )));
                    }
                    if let Err(e) = Self::feed(transport, multiplexer, ready, &buffer[..n]).await {
                        return Stopped::Reader(Err(e));
                    }
                }
            }
        }
    }

    async fn feed(
        transport: &TransportCodec,
        multiplexer: &Multiplexer,
        ready: &mut Option<oneshot::Sender<SkiffResult<()>>>,
        data: &[u8],
    ) -> SkiffResult<()> {
        for event in transport.receive(data)? {
            Self::dispatch(transport, multiplexer, ready, event).await?;
        }
        Ok(())
    }

    async fn dispatch(
        transport: &TransportCodec,
        multiplexer: &Multiplexer,
        ready: &mut Option<oneshot::Sender<SkiffResult<()>>>,
        event: TransportEvent,
    ) -> SkiffResult<()> {
        match event {
            TransportEvent::Message(packet) => {
                match multiplexer.handle_message(&packet.payload).await {
                    Ok(true) => Ok(()),
                    Ok(false) => {
                        debug!(
                            msg_type = packet.payload.first().copied().unwrap_or_default(),
                            "Message outside the connection layer"
                        );
                        transport.send_unimplemented(packet.sequence)
                    }
                    Err(e) => {
                        transport.fail(&e);
                        Err(e)
                    }
                }
            }
            TransportEvent::KexComplete { rekey } => {
                if !rekey {
                    if let Some(ready) = ready.take() {
                        let _ = ready.send(Ok(()));
                    }
                }
                Ok(())
            }
            TransportEvent::Disconnected {
                reason_code,
                description,
            } => Err(SkiffError::Disconnected(format!(
                "peer disconnected ({}): {}",
                reason_code, description
            ))),
        }
    }
}

/// Writes queued packets in order until the codec closes.
async fn write_loop<S>(
    mut writer: WriteHalf<S>,
    mut output: mpsc::UnboundedReceiver<WireWrite>,
) -> SkiffResult<()>
where
    S: AsyncWrite,
{
    while let Some(write) = output.recv().await {
        match write {
            WireWrite::Bytes { data, receipt } => {
                writer.write_all(&data).await?;
                writer.flush().await?;
                if let Some(receipt) = receipt {
                    let _ = receipt.send(());
                }
            }
            WireWrite::Close => break,
        }
    }
    let _ = writer.shutdown().await;
    Ok(())
}
