use clap::Parser;
use page_analyzer::{setup_logging, Cli, CliRunner};
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let args = Cli::parse();

    // Setup logging
    setup_logging(args.verbose)?;

    info!("Starting page-analyzer v{}", env!("CARGO_PKG_VERSION"));

    let cli_runner = match CliRunner::new(&args).await {
        Ok(runner) => runner,
        Err(e) => {
            error!("Startup failed: {:#}", e);
            std::process::exit(1);
        }
    };

    // Setup graceful shutdown
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    let result = cli_runner.run(args.command, shutdown_rx).await;

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }

    info!("page-analyzer stopped");
    Ok(())
}

fn setup_shutdown_handler(shutdown_tx: tokio::sync::broadcast::Sender<()>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("Failed to create SIGTERM handler: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(());
    })
}
