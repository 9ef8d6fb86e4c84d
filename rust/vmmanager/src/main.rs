//! VM lifecycle controller - main entry point.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vmmanager::cloud::{CloudDriver, MockCloud};
use vmmanager::config::AppConfig;
use vmmanager::dispatcher::Dispatcher;
use vmmanager::logging::OpTimer;
use vmmanager::store::{RedisStore, Store};

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "vmmanager")]
#[command(about = "VM lifecycle controller for lab environments")]
#[command(version)]
struct Args {
    /// Redis connection string (falls back to REDIS_CONNECTION_STRING).
    #[arg(long, env = "REDIS_CONNECTION_STRING")]
    redis: Option<String>,

    /// Cloud driver to use. Provider adapters register here; `mock` runs
    /// against the in-memory scripted driver.
    #[arg(long, env = "VMMANAGER_DRIVER", default_value = "mock")]
    driver: String,

    /// Log level.
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env before arg parsing so env-backed flags see it
    let _ = dotenvy::dotenv();

    let args = Args::parse();
    init_tracing(&args.log_level);

    tracing::info!("starting vmmanager v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load()?;
    if let Some(redis) = args.redis {
        config.redis.url = Some(redis);
    }
    let redis_url = config
        .redis
        .connection_url()
        .ok_or_else(|| anyhow::anyhow!("--redis or REDIS_CONNECTION_STRING is required"))?;

    let timer = OpTimer::new("store", "connect");
    let store = RedisStore::connect(&redis_url).await;
    timer.finish_with_result(store.as_ref());
    let store: Arc<dyn Store> = Arc::new(store?);

    let cloud: Arc<dyn CloudDriver> = match args.driver.as_str() {
        "mock" => {
            tracing::warn!("using the in-memory mock cloud driver; no real VMs will be created");
            Arc::new(MockCloud::new())
        }
        other => anyhow::bail!("unknown cloud driver {other:?}"),
    };

    let dispatcher = Dispatcher::from_config(store, cloud, &config.controller);
    let cancel = CancellationToken::new();

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received, stopping gracefully");
            cancel.cancel();
        }
    });

    tracing::info!("connected to redis, processing intents");
    dispatcher.run(cancel).await;
    tracing::info!("controller shut down gracefully");
    Ok(())
}

/// Initialize tracing/logging.
fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Resolves on the first interrupt signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
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
