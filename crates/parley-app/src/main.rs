//! Parley watch binary.
//!
//! Connects one session, loads both stores and prints every realtime event
//! as JSON until interrupted.
//!
//! # Usage
//!
//! ```bash
//! PARLEY_TOKEN=eyJ... parley-watch --user-id 42 \
//!     --endpoint wss://example.com/ws --api https://example.com/api
//! ```

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use parley_app::{
    DEFAULT_API_BASE, DEFAULT_ENDPOINT, ParleyConfig, Runtime, StaticIdentity, SystemEnv,
};
use parley_client::{RealtimeEvent, api::HttpApi, socket::WsConnector};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Parley realtime watcher
#[derive(Parser, Debug)]
#[command(name = "parley-watch")]
#[command(about = "Follow notifications and chat for one session")]
#[command(version)]
struct Args {
    /// STOMP-over-WebSocket endpoint
    #[arg(short, long, default_value = DEFAULT_ENDPOINT)]
    endpoint: String,

    /// REST base URL
    #[arg(short, long, default_value = DEFAULT_API_BASE)]
    api: String,

    /// Bearer token
    #[arg(long, env = "PARLEY_TOKEN")]
    token: String,

    /// Account id of the token's user
    #[arg(long, env = "PARLEY_USER_ID")]
    user_id: String,

    /// Durable cache file (in-memory when omitted)
    #[arg(long)]
    cache_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!("parley watch starting");
    tracing::info!("endpoint {}, api {}", args.endpoint, args.api);

    let config = ParleyConfig {
        endpoint: args.endpoint,
        api_base: args.api,
        cache_path: args.cache_path,
        ..Default::default()
    };
    let cache = config.open_cache()?;
    let api = HttpApi::new(config.api_base.clone())?;
    let identity = Arc::new(StaticIdentity::new(args.token, args.user_id));

    let (runtime, handle) =
        Runtime::new(SystemEnv::new(), api, WsConnector::new(), identity, &cache, config);
    let mut events = handle.subscribe_events();
    let task = tokio::spawn(runtime.run());

    handle.start().await?;
    tracing::info!("session started");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event listener fell behind");
                },
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            },
        }
    }

    handle.logout().await?;
    handle.shutdown().await;
    task.await?;
    Ok(())
}

fn print_event(event: &RealtimeEvent) {
    match serde_json::to_string(event) {
        Ok(json) => tracing::info!(event = event.name(), "{json}"),
        Err(err) => tracing::warn!(event = event.name(), error = %err, "unprintable event"),
    }
}
