//! `devbridge-host`: the native stand-in for the browser extension. Drives
//! an in-memory [`FakeBackend`] and maintains the single outbound
//! connection to the relay.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use devbridge::bridge::{BridgeHost, FakeBackend};
use devbridge::config;
use devbridge::error::AppError;

#[derive(Parser)]
#[command(
    name = "devbridge-host",
    version,
    about = "Native stand-in for the browser extension half of the CDP relay"
)]
struct Cli {
    /// Path to a config file, overriding the normal search order.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Relay host to connect to.
    #[arg(long, default_value = "127.0.0.1")]
    relay_host: String,

    /// Relay HTTP port, used for the liveness probe before connecting.
    #[arg(long)]
    relay_port: Option<u16>,

    /// Path to the session-to-tab-group registry store.
    #[arg(long)]
    registry_store: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let (config_path, config_file) = config::load_config(cli.config.as_deref());
    let resolved = config::resolve_config(&config_file, config_path);

    let log_level = cli.log_level.as_deref().unwrap_or(&resolved.logging.level);
    init_tracing(log_level, &resolved.logging.format);

    let relay_port = cli.relay_port.unwrap_or(resolved.relay.port);
    let relay_ws_url = format!(
        "ws://{}:{}{}",
        cli.relay_host, relay_port, resolved.relay.bridge_path
    );

    if let Err(e) = run(&cli, relay_port, relay_ws_url).await {
        e.print_json_stderr();
        #[allow(clippy::cast_possible_truncation)]
        std::process::exit(e.code as i32);
    }
}

fn init_tracing(level: &str, format: &str) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

async fn run(cli: &Cli, relay_port: u16, relay_ws_url: String) -> Result<(), AppError> {
    let backend = Arc::new(FakeBackend::new());
    let host = Arc::new(BridgeHost::new(
        backend,
        cli.registry_store.clone(),
        cli.relay_host.clone(),
        relay_port,
        relay_ws_url,
    ));

    host.start().await;
    tracing::info!("devbridge-host started");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| AppError::new(format!("failed to listen for shutdown signal: {e}"), devbridge::error::ExitCode::GeneralError))?;
    tracing::info!("shutting down");
    Ok(())
}
