use clap::Parser;
use log::info;
use sofadb_core::{Pool, PoolConfig};
use sofadb_server::router::{app, AppState};
use sofadb_server::ServerConfig;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listening host
    #[arg(long)]
    host: Option<String>,

    /// Listening port
    #[arg(short, long)]
    port: Option<u16>,

    /// PostgreSQL connection URL
    #[arg(long)]
    pg_url: Option<String>,

    /// Maximum number of PostgreSQL connections
    #[arg(long)]
    max_connections: Option<usize>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Environment variables first, command line arguments override
    let args = Args::parse();
    let mut config = ServerConfig::from_env();
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(pg_url) = args.pg_url {
        config.pg_url = pg_url;
    }
    if let Some(max_connections) = args.max_connections {
        config.max_connections = max_connections;
    }

    let pool = Pool::new(&PoolConfig {
        pg_url: config.pg_url.clone(),
        max_connections: config.max_connections,
    })?;

    let router = app(AppState { pool });
    let listen_addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!("Start HTTP server on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(err) => {
            log::error!("cannot install the SIGTERM handler: {err}");
            return std::future::pending().await;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
        _ = sigterm.recv() => info!("Received SIGTERM"),
    }
}
