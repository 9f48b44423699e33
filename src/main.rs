use capture_proxy::config::ProxyConfig;
use capture_proxy::logging::{ProbeLogFilter, SharedLogger};
use capture_proxy::persist::{self, WriterOptions};
use capture_proxy::server::{build_router, AppState};
use capture_proxy::store::Database;

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    fn as_filter(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Parser)]
#[command(
    name = "capture-proxy",
    about = "Capture-and-forward reverse proxy for LLM APIs",
    version
)]
struct Cli {
    /// Port to listen on
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Log verbosity
    #[arg(long, value_enum, default_value = "info", ignore_case = true)]
    log_level: LogLevel,

    /// Path to config file (JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Structured log file path
    #[arg(long, default_value = "capture-proxy.log")]
    log_file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("capture_proxy={},tower_http=info", cli.log_level.as_filter()).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ProxyConfig::load_or_default(cli.config.as_deref())?;

    let probe_filter = ProbeLogFilter::from_config(&config.probe_filter);
    let logger = SharedLogger::with_filter(&cli.log_file, probe_filter)?;

    let client = reqwest::Client::builder()
        .user_agent(concat!("capture-proxy/", env!("CARGO_PKG_VERSION")))
        .timeout(Duration::from_secs(900))
        .connect_timeout(Duration::from_secs(60))
        .read_timeout(Duration::from_secs(900))
        .tcp_keepalive(Duration::from_secs(30))
        .pool_max_idle_per_host(30)
        .build()?;

    let db = Database::new(&config.database_path);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (queue, writer) = persist::spawn_writer(
        db,
        logger.clone(),
        WriterOptions::default(),
        shutdown_rx,
    );

    info!("capture-proxy v{}", env!("CARGO_PKG_VERSION"));
    info!("  Port:       {}", cli.port);
    info!("  Domains:    {} allow-listed", config.allowed_domains.len());
    info!("  Default:    {}", config.default_upstream);
    info!("  Store:      {}", config.database_path);
    info!("  Log file:   {}", cli.log_file.display());

    logger.info(
        "startup",
        format!(
            "Starting capture-proxy port={} domains={} store={}",
            cli.port,
            config.allowed_domains.len(),
            config.database_path
        ),
    );

    let state = Arc::new(AppState::new(config, client, logger.clone(), queue));
    let app = build_router(state);

    let bind_addr = format!("0.0.0.0:{}", cli.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on http://{bind_addr}");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Stop the writer and drain whatever is still queued
    let _ = shutdown_tx.send(true);
    if let Err(e) = writer.await {
        tracing::error!("Batch writer task failed: {e}");
    }

    logger.info("shutdown", "Proxy stopped");
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C, shutting down..."); },
        () = terminate => { info!("Received SIGTERM, shutting down..."); },
    }
}
