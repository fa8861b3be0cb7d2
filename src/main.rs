use clap::Parser;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;

use accordclient::config::{parse_shards, Config};
use accordclient::gateway::{GatewayEvent, ShardSpec};
use accordclient::Client;

/// Connect a bot to the gateway and log what it receives.
#[derive(Parser, Debug)]
#[command(name = "accord-gateway", version)]
struct Args {
    /// Shards to run: `auto` or a comma separated list of ids.
    #[arg(long)]
    shards: Option<String>,

    /// Publish every decoded payload as a raw event.
    #[arg(long)]
    raw: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "accordclient=debug,accord_gateway=info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(shards) = args.shards.as_deref() {
        config.gateway.shards = parse_shards(shards);
    }
    if args.raw {
        config.gateway.emit_raw = true;
    }
    print_banner(&config);

    for name in &config.unknown_intents {
        tracing::warn!("ignoring unknown intent '{name}'");
    }

    let client = Client::from_config(config).expect("failed to build HTTP client");
    let mut events = client.subscribe();

    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("event log fell behind, skipped {missed} events")
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        result = client.connect() => {
            if let Err(e) = result {
                tracing::error!("failed to connect: {e}");
                return;
            }
            shutdown_signal().await;
        }
        _ = shutdown_signal() => {}
    }

    tracing::info!("shutting down");
    client.destroy();
}

fn log_event(event: &GatewayEvent) {
    match event {
        GatewayEvent::Ready => tracing::info!("gateway ready"),
        GatewayEvent::ShardReady {
            shard_id,
            unavailable_guilds,
        } if !unavailable_guilds.is_empty() => tracing::warn!(
            shard = shard_id,
            "ready with {} unavailable guilds",
            unavailable_guilds.len()
        ),
        GatewayEvent::Invalidated => tracing::error!("token was invalidated"),
        GatewayEvent::Dispatch(dispatch) => tracing::debug!(
            shard = dispatch.shard_id,
            "{} {}",
            dispatch.name,
            dispatch.data
        ),
        GatewayEvent::Raw { shard_id, payload } => {
            tracing::trace!(shard = shard_id, "raw op {}", payload.op)
        }
        other => tracing::debug!("{other:?}"),
    }
}

fn print_banner(config: &Config) {
    let version = env!("CARGO_PKG_VERSION");
    let git_sha = env!("GIT_SHA");
    let shards = match &config.gateway.shards {
        ShardSpec::Auto => "auto".to_string(),
        ShardSpec::List(ids) => format!("{ids:?}"),
    };

    eprintln!();
    eprintln!("  \x1b[1;36maccord gateway\x1b[0m \x1b[2mv{version} ({git_sha})\x1b[0m");
    eprintln!();
    eprintln!("  \x1b[2mapi\x1b[0m          {}/v{}", config.rest.api_url, config.rest.version);
    eprintln!("  \x1b[2mgateway\x1b[0m      v{}", config.gateway.version);
    eprintln!("  \x1b[2mshards\x1b[0m       {shards}");
    eprintln!("  \x1b[2mintents\x1b[0m      {}", config.gateway.intents.bits());

    if config.rest.token.is_none() {
        eprintln!();
        eprintln!("  \x1b[33m! no token set (ACCORD_TOKEN)\x1b[0m");
    }
    if config.gateway.emit_raw {
        eprintln!("  \x1b[33m! raw events enabled\x1b[0m");
    }

    eprintln!();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
