// platen server binary
//
// Starts the pool registry and serves the render gateway over HTTP/WebSocket.
// Ctrl-c drains every shard before exit so engine processes never outlive
// the service.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use platen::gateway::{GatewayState, SessionManager, app};
use platen::pool::PoolRegistry;
use platen::router::Router;
use platen::{ChromiumLauncher, ServiceConfig};

#[derive(Debug, Parser)]
#[command(name = "platen", about = "Warm-pool HTML rendering service")]
struct Args {
    /// Path to a JSON configuration file
    #[arg(long, env = "PLATEN_CONFIG")]
    config: Option<PathBuf>,

    /// Socket address to bind, overrides the config file
    #[arg(long, env = "PLATEN_BIND")]
    bind: Option<String>,

    /// Number of pool shards, overrides the config file
    #[arg(long, env = "PLATEN_SHARDS")]
    shards: Option<usize>,

    /// Warm engine instances per shard, overrides the config file
    #[arg(long, env = "PLATEN_MAX_INSTANCES")]
    max_instances: Option<usize>,

    /// Run engine processes with a visible window (debugging)
    #[arg(long, env = "PLATEN_HEADFUL")]
    headful: bool,
}

fn load_config(args: &Args) -> Result<ServiceConfig> {
    let base = match &args.config {
        Some(path) => ServiceConfig::from_file(path)?,
        None => ServiceConfig::builder().build()?,
    };
    let mut builder = ServiceConfig::builder()
        .bind_addr(args.bind.clone().unwrap_or_else(|| base.bind_addr().to_string()))
        .shards(args.shards.unwrap_or_else(|| base.shards()))
        .max_instances(args.max_instances.unwrap_or_else(|| base.pool().max_instances()))
        .warm_instances(base.pool().warm_instances())
        .acquire_deadline_ms(base.pool().acquire_deadline().as_millis() as u64)
        .wait_queue_limit(base.pool().wait_queue_limit())
        .max_renders_per_instance(base.pool().max_renders_per_instance())
        .max_instance_age_secs(base.pool().max_instance_age().as_secs())
        .idle_timeout_secs(base.pool().idle_timeout().as_secs())
        .sweep_interval_secs(base.pool().sweep_interval().as_secs())
        .retry_after_hint_ms(base.pool().retry_after_hint().as_millis() as u64)
        .heartbeat_interval_secs(base.heartbeat_interval().as_secs())
        .max_document_bytes(base.max_document_bytes())
        .max_batch_calls(base.max_batch_calls())
        .headless(base.headless() && !args.headful);
    if let Some(path) = base.chrome_executable() {
        builder = builder.chrome_executable(path);
    }
    builder.build()
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Arc::new(load_config(&args)?);

    let launcher = Arc::new(ChromiumLauncher::new(
        config.headless(),
        config.chrome_executable().map(PathBuf::from),
    ));
    let registry = PoolRegistry::start(&config, launcher.clone());
    let router = Router::new(Arc::clone(&registry), launcher);
    let sessions = SessionManager::new();

    let state = GatewayState {
        config: Arc::clone(&config),
        router,
        sessions,
    };

    let listener = tokio::net::TcpListener::bind(config.bind_addr())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr()))?;
    info!(
        addr = config.bind_addr(),
        shards = config.shards(),
        max_instances = config.pool().max_instances(),
        "platen listening"
    );

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await
        .context("server error")?;

    registry.shutdown().await;
    Ok(())
}
