//! SSH Echo Server Example
//!
//! This example demonstrates how to:
//! - Run a server session with an Ed25519 host key over TCP
//! - Accept session channels through a `ChannelFactory`
//! - Echo channel data back through a `ChannelListener`
//!
//! Usage:
//!   cargo run --example echo_server [bind_address]
//!
//! Then connect with:
//!   cargo run --example echo_client 127.0.0.1:2222 "hello"

use async_trait::async_trait;
use bytes::Bytes;
use skiff_platform::SkiffResult;
use skiff_proto::ssh::{
    AcceptedChannel, ChannelFactory, ChannelHandle, ChannelKind, ChannelListener,
    ChannelOpenFailureReason, Ed25519HostKey, OpenRefusal, SessionBuilder, TransportConfig,
};
use std::env;
use std::sync::Arc;
use tokio::net::TcpListener;

struct Echo;

#[async_trait]
impl ChannelListener for Echo {
    async fn on_data(&self, channel: &ChannelHandle, data: Bytes) {
        println!("  channel {}: {} bytes", channel.local_id(), data.len());
        if let Err(e) = channel.send(&data).await {
            eprintln!("  echo failed: {}", e);
        }
    }

    async fn on_eof(&self, channel: &ChannelHandle) {
        let _ = channel.send_eof();
    }

    async fn on_close(&self, channel: &ChannelHandle) {
        println!("  channel {} closed", channel.local_id());
    }
}

struct EchoFactory;

#[async_trait]
impl ChannelFactory for EchoFactory {
    async fn open(&self, kind: &ChannelKind) -> Result<AcceptedChannel, OpenRefusal> {
        match kind {
            ChannelKind::Session => Ok(AcceptedChannel {
                listener: Some(Arc::new(Echo)),
                ..AcceptedChannel::default()
            }),
            _ => Err(OpenRefusal::new(
                ChannelOpenFailureReason::AdministrativelyProhibited,
            )),
        }
    }
}

#[tokio::main]
async fn main() -> SkiffResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addr = env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:2222".to_string());
    let host_key = Arc::new(Ed25519HostKey::generate());
    let listener = TcpListener::bind(&addr).await?;
    println!("Echo server listening on {}", addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        println!("Connection from {}", peer);
        let host_key = host_key.clone();

        tokio::spawn(async move {
            let session = SessionBuilder::new(TransportConfig::server(host_key))
                .with_channel_factory(Arc::new(EchoFactory))
                .start(stream)
                .await;
            match session {
                Ok(session) => {
                    session.closed().await;
                    println!("Connection from {} closed", peer);
                }
                Err(e) => eprintln!("Handshake with {} failed: {}", peer, e),
            }
        });
    }
}
