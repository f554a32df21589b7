mod server;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use server::{Server, ServerOpts};

/// Bluetooth audio transport daemon.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// `bluer` adapter name to bind to (e.g. "hci0"). Defaults to the
    /// first adapter bluer reports.
    #[arg(long)]
    adapter: Option<String>,

    /// Emit structured JSON log lines instead of the default
    /// human-readable format.
    #[arg(long)]
    log_json: bool,
}

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);
    let shutdown = btd_shared::shutdown::Shutdown::new(shutdown_tx, shutdown_complete_tx);

    let _server = Server::run(
        ServerOpts {
            adapter: cli.adapter,
        },
        shutdown.clone(),
    )
    .await?;
    tracing::info!(target = "server", "daemon started");

    tokio::signal::ctrl_c().await?;
    tracing::info!(target = "server", "received interrupt, shutting down");

    // Dropping the receiver half closes `shutdown_tx` everywhere it has
    // been cloned, unblocking every task awaiting `recv_shutdown`.
    drop(shutdown_rx);
    drop(shutdown);
    // Wait for every outstanding `drop_guard()` clone to be released.
    let _ = shutdown_complete_rx.recv().await;

    Ok(())
}
