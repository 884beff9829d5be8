//! `devbridge-relay`: the process automation clients and the bridge host
//! both connect to.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use devbridge::config::{self, ResolvedConfig};
use devbridge::error::{AppError, ExitCode};
use devbridge::relay::{self, RelayOptions};

#[derive(Parser)]
#[command(
    name = "devbridge-relay",
    version,
    about = "CDP relay multiplexing automation clients through one bridge-host connection"
)]
struct Cli {
    /// Path to a config file, overriding the normal search order.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind address for the HTTP and WebSocket surface.
    #[arg(long)]
    host: Option<String>,

    /// Bind port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the persisted page-mapping file path.
    #[arg(long)]
    persistence_path: Option<PathBuf>,

    /// Max tabs per agent session before `POST /pages` returns 429.
    #[arg(long)]
    tab_limit: Option<u32>,

    /// Tab count at which `POST /pages` starts returning a `warning` field.
    #[arg(long)]
    warn_threshold: Option<u32>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (config_path, config_file) = config::load_config(cli.config.as_deref());
    let mut resolved = config::resolve_config(&config_file, config_path);
    apply_overrides(&mut resolved, &cli);

    init_tracing(&resolved.logging.level, &resolved.logging.format);

    if let Err(e) = run(resolved).await {
        e.print_json_stderr();
        #[allow(clippy::cast_possible_truncation)]
        std::process::exit(e.code as i32);
    }
}

fn apply_overrides(resolved: &mut ResolvedConfig, cli: &Cli) {
    if let Some(host) = &cli.host {
        resolved.relay.host = host.clone();
    }
    if let Some(port) = cli.port {
        resolved.relay.port = port;
    }
    if let Some(path) = &cli.persistence_path {
        resolved.persistence.path = Some(path.clone());
    }
    if let Some(limit) = cli.tab_limit {
        resolved.limits.tab_limit = limit;
    }
    if let Some(threshold) = cli.warn_threshold {
        resolved.limits.warn_threshold = threshold;
    }
    if let Some(level) = &cli.log_level {
        resolved.logging.level = level.clone();
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

async fn run(resolved: ResolvedConfig) -> Result<(), AppError> {
    let persistence_path = match resolved.persistence.path {
        Some(p) => Some(p),
        None => Some(
            resolved
                .persistence
                .resolved_path()
                .map_err(AppError::from)?,
        ),
    };

    let app = relay::build(RelayOptions {
        persistence_path,
        max_age_days: resolved.persistence.max_age_days,
        debounce: Duration::from_millis(resolved.persistence.debounce_ms),
        tab_limit: resolved.limits.tab_limit as usize,
        warn_threshold: resolved.limits.warn_threshold as usize,
        command_timeout: Duration::from_millis(resolved.relay.command_timeout_ms),
        grace_period: Duration::from_millis(resolved.relay.grace_period_ms),
        target_wait_timeout: Duration::from_millis(resolved.relay.target_wait_timeout_ms),
    });

    let addr = format!("{}:{}", resolved.relay.host, resolved.relay.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| AppError::new(format!("failed to bind {addr}: {e}"), ExitCode::ConnectionError))?;

    tracing::info!(%addr, "devbridge-relay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| AppError::new(format!("relay server error: {e}"), ExitCode::GeneralError))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}
