//! hooktail server binary: open the log, start the watcher, serve.

use clap::Parser;
use hooktail::broadcast::Broadcaster;
use hooktail::log::EventWriter;
use hooktail::server::{self, AppState};
use hooktail::watcher::spawn_watcher;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Local telemetry pipeline for developer-agent activity.
#[derive(Parser, Debug)]
#[command(name = "hooktail")]
#[command(about = "Append-only event log with live tailing and WebSocket fan-out")]
struct Args {
    /// Directory holding the append log.
    #[arg(long, env = "HOOKTAIL_DATA_DIR", default_value = ".hooktail")]
    data_dir: PathBuf,

    /// Address to bind.
    #[arg(long, env = "HOOKTAIL_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to bind.
    #[arg(short, long, env = "HOOKTAIL_PORT", default_value_t = 4618)]
    port: u16,
}

#[tokio::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hooktail=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    // Opening the writer creates the log file, so the watcher finds it
    // immediately and tails from EOF.
    let writer = EventWriter::open(&args.data_dir)?;
    let reader = writer.reader();
    let log_path = writer.log_path().to_path_buf();

    let broadcaster = Broadcaster::new();
    let watcher = spawn_watcher(log_path, broadcaster.clone())?;

    let state = AppState {
        writer: Arc::new(Mutex::new(writer)),
        reader,
        broadcaster: broadcaster.clone(),
        watcher_status: watcher.status_cell(),
    };

    let addr: SocketAddr = format!("{}:{}", args.host, args.port)
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("bad bind address: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(
        %addr,
        data_dir = %args.data_dir.display(),
        "hooktail listening"
    );

    axum::serve(listener, server::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // No drain on shutdown: close sessions, stop the watcher, exit.
    broadcaster.shutdown();
    watcher.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
