use std::process::ExitCode;

use clap::Parser;
use codebox::config::Cli;
use codebox::logging::init_logging;
use codebox::router::{build_router, with_http_logging, AppState};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format);
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "codebox exited with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = cli.agent_config();
    if let Err(err) = config.check_credentials() {
        tracing::warn!(error = %err, "agent requests will fail until configured");
    }
    let state = AppState::from_config(config)?;
    let mut app = build_router(state);
    if !cli.no_http_log {
        app = with_http_logging(app);
    }

    let listener = tokio::net::TcpListener::bind((cli.host.as_str(), cli.port)).await?;
    info!(addr = %listener.local_addr()?, "codebox listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        error!("failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}
