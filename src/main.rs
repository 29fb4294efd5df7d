//! rpcwire - loopback self-check
//!
//! Connects two channels over the in-process memory pipe and exercises ping,
//! an API call, a pushed message, and a binary stream transfer before closing
//! both sides gracefully.

use rpcwire_channel::pipe::pipe;
use rpcwire_channel::{
    ApiCall, Channel, ChannelBuilder, Config, PushMessage, Responder, StreamManager, StreamPolicy,
};
use rpcwire_protocol::{ErrorKind, Payload};
use tracing_subscriber::EnvFilter;

fn handle_call(call: ApiCall, responder: Responder) {
    match call.name.as_str() {
        "echo" => responder.ok(call.body),
        "len" => responder.ok(call.body.len().to_string().into_bytes()),
        _ => responder.err(ErrorKind::ApiNotFound),
    }
}

fn handle_push(message: PushMessage) {
    tracing::info!(
        "push #{}: {} bytes",
        message.sequence,
        message.body.len()
    );
}

async fn self_check(client: &Channel, server: &Channel) -> Result<(), Box<dyn std::error::Error>> {
    let echo = client.ping(Some(Payload::from("rpcwire"))).await?;
    tracing::info!("  ping: {} bytes echoed", echo.len());

    let body = client.api_call("echo", "hello").await?;
    tracing::info!("  api_call echo: {:?}", String::from_utf8_lossy(&body.to_bytes()));

    match client.api_call("missing", "").await {
        Err(e) if e.is(ErrorKind::ApiNotFound) => tracing::info!("  api_call missing: {}", e),
        Err(e) => return Err(e.into()),
        Ok(_) => return Err("unknown procedure was answered".into()),
    }

    client.send_message("note").await?;
    tracing::info!("  push message acknowledged");

    let reader = server.streams().create()?;
    let stream_id = reader.id();
    let mut sender = client.stream_sender(stream_id);
    for part in ["stream ", "of ", "chunks"] {
        sender.send(part).await?;
    }
    sender.finish().await?;
    let data = reader.read_to_end().await?;
    tracing::info!("  stream {:#010x}: {} bytes received", stream_id, data.len());

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if RPCWIRE_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("RPCWIRE_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            if std::env::var("RPCWIRE_CONFIG").is_ok() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting rpcwire self-check");
    match config.channel.timeout() {
        Some(timeout) => tracing::info!("  Request timeout: {:?}", timeout),
        None => tracing::info!("  Request timeout: disabled"),
    }
    tracing::info!(
        "  Streams: {:?} (shared: {})",
        config.streams.capacity(),
        config.streams.shared
    );

    let shared = config
        .streams
        .shared
        .then(|| StreamManager::new(&config.streams));
    let policy = match &shared {
        Some(manager) => StreamPolicy::Shared(manager.clone()),
        None => StreamPolicy::PerChannel(config.streams.clone()),
    };

    let ((client_transport, client_events), (server_transport, server_events)) = pipe();
    let client = ChannelBuilder::from_config(&config)
        .with_stream_policy(policy.clone())
        .spawn(client_transport, client_events);
    let server = ChannelBuilder::from_config(&config)
        .with_stream_policy(policy)
        .with_api_handler(handle_call)
        .with_push_handler(handle_push)
        .spawn(server_transport, server_events);

    let result = self_check(&client, &server).await;

    client.close().await?;
    client.closed().await;
    server.closed().await;
    if let Some(manager) = shared {
        manager.close();
    }

    match result {
        Ok(()) => {
            tracing::info!("Self-check passed");
            Ok(())
        }
        Err(e) => {
            tracing::error!("Self-check failed: {}", e);
            Err(e)
        }
    }
}
