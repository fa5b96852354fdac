//! SSH Echo Client Example
//!
//! Opens a session channel, sends a message and prints the echo.
//!
//! Usage:
//!   cargo run --example echo_client [address] [message]

use skiff_platform::SkiffResult;
use skiff_proto::ssh::{
    ChannelConfig, ChannelKind, DisconnectReason, MultiplexerConfig, SessionBuilder,
    TransportConfig,
};
use std::env;
use std::time::Duration;
use tokio::net::TcpStream;

#[tokio::main]
async fn main() -> SkiffResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    let addr = args.get(1).map(String::as_str).unwrap_or("127.0.0.1:2222");
    let message = args.get(2).map(String::as_str).unwrap_or("hello");

    let stream = TcpStream::connect(addr).await?;
    let session = SessionBuilder::new(TransportConfig::client())
        .with_multiplexer_config(
            MultiplexerConfig::default()
                .with_keepalive(Duration::from_secs(30), Duration::from_secs(10)),
        )
        .start(stream)
        .await?;
    println!(
        "Connected, session id {}",
        hex::encode(session.session_id().unwrap_or_default())
    );

    let channel = session
        .open_channel(ChannelKind::Session, ChannelConfig::default())
        .await?;
    channel.send(message.as_bytes()).await?;
    channel.send_eof()?;

    let mut echoed = Vec::new();
    while let Some(chunk) = channel.receive_timeout(Duration::from_secs(10)).await? {
        echoed.extend_from_slice(&chunk);
    }
    println!("Echo: {}", String::from_utf8_lossy(&echoed));

    channel.close(false).await?;
    session.disconnect(DisconnectReason::ByApplication, "done");
    Ok(())
}
