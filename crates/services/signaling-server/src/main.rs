//! Signaling relay binary entry point
//!
//! # Usage
//!
//! ```bash
//! # Listen on the default address (0.0.0.0:8080)
//! cargo run -p meshcall-signaling-server
//!
//! # Custom address, JSON logs, larger rooms
//! cargo run -p meshcall-signaling-server -- \
//!   --bind 127.0.0.1:9000 \
//!   --log-format json \
//!   --max-room-size 32
//! ```

use anyhow::Context;
use clap::Parser;
use meshcall_signaling_server::{ServerConfig, SignalingServer};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// meshcall signaling relay
///
/// Tracks room membership and relays offers, answers and ICE candidates
/// between the members of a room.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:8080", env = "MESHCALL_BIND")]
    bind: SocketAddr,

    /// Log output format
    #[arg(long, value_enum, default_value = "text", env = "MESHCALL_LOG_FORMAT")]
    log_format: LogFormat,

    /// Maximum members per room
    #[arg(long, default_value_t = 16, env = "MESHCALL_MAX_ROOM_SIZE")]
    max_room_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum LogFormat {
    /// Human-readable lines
    Text,
    /// One JSON object per line
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        bind = %args.bind,
        max_room_size = args.max_room_size,
        "meshcall signaling server starting"
    );

    let config = ServerConfig {
        bind: args.bind,
        max_room_size: args.max_room_size,
        ..Default::default()
    };
    let server = SignalingServer::new(config).context("invalid server configuration")?;
    let handle = server
        .start()
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;
    info!("Ctrl+C received, shutting down");

    handle.shutdown().await;
    Ok(())
}

/// Initialize tracing subscriber for logging
fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}
