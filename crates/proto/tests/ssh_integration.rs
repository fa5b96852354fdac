//! Integration tests for two SSH sessions talking over an in-memory stream.
//!
//! These tests validate the complete protocol flow:
//! - Identification and key exchange
//! - Channel open, data transfer under flow control, EOF and close
//! - Global requests and keep-alive
//! - Rekeying and disconnect

use async_trait::async_trait;
use bytes::Bytes;
use skiff_platform::{SkiffError, SkiffResult};
use skiff_proto::ssh::{
    AcceptedChannel, ChannelConfig, ChannelFactory, ChannelHandle, ChannelKind, ChannelListener,
    ChannelOpenFailureReason, DisconnectReason, Ed25519HostKey, GlobalRequest,
    GlobalRequestHandler, MultiplexerConfig, OpenRefusal, Session, SessionBuilder,
    TransportCodec, TransportConfig, WireWrite,
};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::{timeout, Duration};

const WAIT: Duration = Duration::from_secs(5);

/// Echoes everything it receives back on the same channel.
struct Echo;

#[async_trait]
impl ChannelListener for Echo {
    async fn on_data(&self, channel: &ChannelHandle, data: Bytes) {
        let _ = channel.send(&data).await;
    }

    async fn on_eof(&self, channel: &ChannelHandle) {
        let _ = channel.send_eof();
    }
}

/// Accepts session channels, echoing them or buffering for `accept()`.
struct Factory {
    echo: bool,
    config: ChannelConfig,
}

#[async_trait]
impl ChannelFactory for Factory {
    async fn open(&self, kind: &ChannelKind) -> Result<AcceptedChannel, OpenRefusal> {
        if !matches!(kind, ChannelKind::Session) {
            return Err(OpenRefusal::new(ChannelOpenFailureReason::UnknownChannelType));
        }
        let listener: Option<Arc<dyn ChannelListener>> = if self.echo {
            Some(Arc::new(Echo))
        } else {
            None
        };
        Ok(AcceptedChannel {
            config: self.config.clone(),
            listener,
        })
    }
}

struct Version;

#[async_trait]
impl GlobalRequestHandler for Version {
    async fn handle(&self, _request: &GlobalRequest) -> Option<Vec<u8>> {
        Some(b"skiff".to_vec())
    }
}

fn echo_server() -> SessionBuilder {
    server_builder().with_channel_factory(Arc::new(Factory {
        echo: true,
        config: ChannelConfig::default(),
    }))
}

fn server_builder() -> SessionBuilder {
    let host_key = Ed25519HostKey::generate();
    SessionBuilder::new(TransportConfig::server(Arc::new(host_key)))
}

/// Routes logs to the test harness; `RUST_LOG=skiff_proto=debug` shows them.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn connect(client: SessionBuilder, server: SessionBuilder) -> SkiffResult<(Session, Session)> {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client, server) = tokio::join!(client.start(client_io), server.start(server_io));
    Ok((client?, server?))
}

/// Completes the handshake as a server, then ignores every message.
async fn silent_server(stream: DuplexStream) -> SkiffResult<()> {
    let host_key = Ed25519HostKey::generate();
    let (codec, mut output) = TransportCodec::new(TransportConfig::server(Arc::new(host_key)))?;
    let (mut reader, mut writer) = tokio::io::split(stream);
    tokio::spawn(async move {
        while let Some(WireWrite::Bytes { data, .. }) = output.recv().await {
            if writer.write_all(&data).await.is_err() {
                break;
            }
        }
    });

    codec.start()?;
    let mut buffer = vec![0u8; 32 * 1024];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            return Ok(());
        }
        codec.receive(&buffer[..n])?;
    }
}

async fn read_exactly(channel: &ChannelHandle, len: usize) -> SkiffResult<Vec<u8>> {
    let mut received = Vec::with_capacity(len);
    while received.len() < len {
        match channel.receive_timeout(WAIT).await? {
            Some(chunk) => received.extend_from_slice(&chunk),
            None => break,
        }
    }
    Ok(received)
}

/// Test that both ends agree on the session after the handshake.
#[tokio::test]
async fn test_handshake() -> SkiffResult<()> {
    let (client, server) = connect(SessionBuilder::new(TransportConfig::client()), server_builder()).await?;

    assert!(client.is_connected());
    assert!(server.is_connected());
    assert!(client.session_id().is_some());
    assert_eq!(client.session_id(), server.session_id());
    assert_eq!(client.stats().key_exchanges, 1);
    assert_eq!(server.stats().key_exchanges, 1);
    Ok(())
}

/// Test a round trip through an echoing server channel.
#[tokio::test]
async fn test_channel_echo() -> SkiffResult<()> {
    let (client, _server) = connect(SessionBuilder::new(TransportConfig::client()), echo_server()).await?;

    let channel = client
        .open_channel(ChannelKind::Session, ChannelConfig::default())
        .await?;
    assert!(channel.is_open());

    channel.send(b"hello skiff").await?;
    let echoed = read_exactly(&channel, 11).await?;
    assert_eq!(echoed, b"hello skiff");

    channel.send_eof()?;
    assert_eq!(channel.receive_timeout(WAIT).await?, None);

    channel.close(false).await?;
    assert!(!channel.is_open());
    Ok(())
}

/// Test that a transfer larger than the peer's window completes through
/// window adjustments.
#[tokio::test]
async fn test_transfer_beyond_window() -> SkiffResult<()> {
    let server = server_builder().with_channel_factory(Arc::new(Factory {
        echo: true,
        config: ChannelConfig::default().with_window(8192, 4096),
    }));
    let (client, _server) = connect(SessionBuilder::new(TransportConfig::client()), server).await?;

    let channel = client
        .open_channel(ChannelKind::Session, ChannelConfig::default())
        .await?;
    assert_eq!(channel.remote_window(), 8192);

    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let sender = channel.clone();
    let data = payload.clone();
    let send = tokio::spawn(async move { sender.send(&data).await });

    let echoed = read_exactly(&channel, payload.len()).await?;
    send.await.map_err(|e| SkiffError::Other(e.into()))??;
    assert_eq!(echoed, payload);
    Ok(())
}

/// Test that bulk traffic in both directions does not stall on a pipe far
/// smaller than the channel window.
#[tokio::test]
async fn test_bulk_echo_over_small_pipe() -> SkiffResult<()> {
    let (client, _server) = connect(SessionBuilder::new(TransportConfig::client()), echo_server()).await?;

    let channel = client
        .open_channel(ChannelKind::Session, ChannelConfig::default())
        .await?;

    let payload: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 253) as u8).collect();
    let sender = channel.clone();
    let data = payload.clone();
    let send = tokio::spawn(async move { sender.send(&data).await });

    let echoed = read_exactly(&channel, payload.len()).await?;
    assert_eq!(echoed.len(), payload.len());
    assert!(echoed == payload, "echoed bytes differ");
    timeout(WAIT, send)
        .await
        .map_err(|_| SkiffError::timeout("send"))?
        .map_err(|e| SkiffError::Other(e.into()))??;
    Ok(())
}

/// Test buffered delivery on the accepting side.
#[tokio::test]
async fn test_accept_and_receive() -> SkiffResult<()> {
    let server = server_builder().with_channel_factory(Arc::new(Factory {
        echo: false,
        config: ChannelConfig::default(),
    }));
    let (client, server) = connect(SessionBuilder::new(TransportConfig::client()), server).await?;

    let channel = client
        .open_channel(ChannelKind::Session, ChannelConfig::default())
        .await?;
    let accepted = timeout(WAIT, server.accept())
        .await
        .map_err(|_| SkiffError::timeout("accept"))?
        .ok_or_else(|| SkiffError::Other("no channel accepted".into()))?;
    assert_eq!(accepted.remote_id(), channel.local_id());
    assert_eq!(accepted.local_id(), channel.remote_id());

    channel.send(b"request").await?;
    channel.send_eof()?;
    assert_eq!(read_exactly(&accepted, 7).await?, b"request");
    assert_eq!(accepted.receive_timeout(WAIT).await?, None);

    accepted.send(b"response").await?;
    accepted.send_stderr(b"warning").await?;
    accepted.close(false).await?;

    assert_eq!(read_exactly(&channel, 8).await?, b"response");
    let stderr = timeout(WAIT, channel.receive_extended())
        .await
        .map_err(|_| SkiffError::timeout("stderr"))??;
    assert_eq!(stderr.as_deref(), Some(&b"warning"[..]));

    timeout(WAIT, channel.closed())
        .await
        .map_err(|_| SkiffError::timeout("close"))?;
    assert!(!channel.is_open());
    Ok(())
}

/// Test that a peer without a channel factory refuses opens.
#[tokio::test]
async fn test_open_refused() -> SkiffResult<()> {
    let (client, _server) = connect(SessionBuilder::new(TransportConfig::client()), server_builder()).await?;

    let err = client
        .open_channel(ChannelKind::Session, ChannelConfig::default())
        .await
        .unwrap_err();
    match err {
        SkiffError::Rejected { code, .. } => {
            assert_eq!(code, ChannelOpenFailureReason::AdministrativelyProhibited as u32)
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(client.multiplexer().channel_count(), 0);
    Ok(())
}

/// Test global requests with and without a registered handler.
#[tokio::test]
async fn test_global_requests() -> SkiffResult<()> {
    let server = server_builder().with_global_handler("version@skiff", Arc::new(Version));
    let (client, _server) = connect(SessionBuilder::new(TransportConfig::client()), server).await?;

    let reply = client
        .send_global_request("version@skiff", Vec::new(), true)
        .await?
        .ok_or_else(|| SkiffError::Other("missing reply".into()))?;
    assert!(reply.success);
    assert_eq!(reply.data, b"skiff");

    let reply = client
        .send_global_request("unknown@skiff", Vec::new(), true)
        .await?
        .ok_or_else(|| SkiffError::Other("missing reply".into()))?;
    assert!(!reply.success);

    assert!(client
        .send_global_request("unknown@skiff", Vec::new(), false)
        .await?
        .is_none());
    Ok(())
}

/// Test that answered keep-alives keep the session up.
#[tokio::test]
async fn test_keepalive() -> SkiffResult<()> {
    let config = MultiplexerConfig::default()
        .with_keepalive(Duration::from_millis(50), Duration::from_secs(2));
    let client = SessionBuilder::new(TransportConfig::client()).with_multiplexer_config(config);
    let (client, _server) = connect(client, server_builder()).await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(client.is_connected());
    client.multiplexer().ping().await?;
    Ok(())
}

/// Test that a keep-alive nobody answers tears the session down and fails
/// outstanding work.
#[tokio::test]
async fn test_keepalive_unanswered() -> SkiffResult<()> {
    init_tracing();
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let _peer = tokio::spawn(silent_server(server_io));

    let config = MultiplexerConfig::default()
        .with_keepalive(Duration::from_millis(50), Duration::from_millis(200));
    let client = SessionBuilder::new(TransportConfig::client())
        .with_multiplexer_config(config)
        .start(client_io)
        .await?;
    assert!(client.is_connected());

    let mux = client.multiplexer().clone();
    let request =
        tokio::spawn(async move { mux.send_global_request("never@skiff", Vec::new(), true).await });
    let mux = client.multiplexer().clone();
    let open = tokio::spawn(async move {
        mux.open_channel(ChannelKind::Session, ChannelConfig::default(), None)
            .await
    });

    timeout(WAIT, client.closed())
        .await
        .map_err(|_| SkiffError::timeout("keep-alive teardown"))?;
    assert!(!client.is_connected());
    assert!(client.multiplexer().is_disconnected());

    let request = request.await.map_err(|e| SkiffError::Other(e.into()))?;
    assert!(matches!(request, Err(SkiffError::Disconnected(_))));
    let open = open.await.map_err(|e| SkiffError::Other(e.into()))?;
    assert!(matches!(open, Err(SkiffError::Disconnected(_))));
    assert_eq!(client.multiplexer().channel_count(), 0);
    Ok(())
}

/// Test that channels keep working across a rekey.
#[tokio::test]
async fn test_rekey() -> SkiffResult<()> {
    let (client, server) = connect(SessionBuilder::new(TransportConfig::client()), echo_server()).await?;
    let session_id = client.session_id();

    let channel = client
        .open_channel(ChannelKind::Session, ChannelConfig::default())
        .await?;
    client.rekey()?;
    channel.send(b"across rekey").await?;
    assert_eq!(read_exactly(&channel, 12).await?, b"across rekey");

    timeout(WAIT, async {
        while client.stats().key_exchanges < 2 || server.stats().key_exchanges < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| SkiffError::timeout("rekey"))?;
    assert_eq!(client.session_id(), session_id);
    Ok(())
}

/// Test that a disconnect ends both sessions and fails later work.
#[tokio::test]
async fn test_disconnect() -> SkiffResult<()> {
    let (client, server) = connect(SessionBuilder::new(TransportConfig::client()), echo_server()).await?;
    let channel = client
        .open_channel(ChannelKind::Session, ChannelConfig::default())
        .await?;

    client.disconnect(DisconnectReason::ByApplication, "bye");
    timeout(WAIT, server.closed())
        .await
        .map_err(|_| SkiffError::timeout("server close"))?;
    timeout(WAIT, client.closed())
        .await
        .map_err(|_| SkiffError::timeout("client close"))?;

    timeout(WAIT, channel.closed())
        .await
        .map_err(|_| SkiffError::timeout("channel teardown"))?;

    assert!(!client.is_connected());
    assert!(!server.is_connected());
    assert!(!channel.is_open());
    assert!(channel.send(b"late").await.is_err());
    assert!(client
        .open_channel(ChannelKind::Session, ChannelConfig::default())
        .await
        .is_err());
    Ok(())
}

/// Test that a silent peer fails the handshake with a timeout.
#[tokio::test]
async fn test_handshake_timeout() {
    let (client_io, _silent) = tokio::io::duplex(64 * 1024);
    let err = SessionBuilder::new(TransportConfig::client())
        .with_handshake_timeout(Duration::from_millis(100))
        .start(client_io)
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}
