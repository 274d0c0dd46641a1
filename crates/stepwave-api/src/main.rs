//! Stepwave CLI and REST API entry point.
//!
//! Binary name: `stepwave`
//!
//! Parses CLI arguments, initializes tracing and the engine, then dispatches
//! to the appropriate command handler or starts the REST API server.

mod cli;
mod http;
mod state;

use std::time::Duration;

use clap::Parser;
use clap_complete::generate;
use tokio_util::sync::CancellationToken;

use cli::{Cli, Commands};
use state::AppState;
use stepwave_observe::tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut options = TracingOptions::default().with_verbosity(cli.verbose);
    if cli.quiet {
        options.default_filter = "error".to_string();
    }
    options.json = cli.log_json;
    options.otel = cli.otel;
    init_tracing(&options).map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "stepwave", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;

    let result = match cli.command {
        Commands::Serve { port, host } => serve(state, &host, port).await,
        Commands::Definition { action } => {
            cli::definition::handle_definition_command(action, &state, cli.json).await
        }
        Commands::Instance { action } => {
            cli::instance::handle_instance_command(action, &state, cli.json).await
        }
        Commands::Recover => cli::maintenance::handle_recover(&state, cli.json).await,
        Commands::Health => cli::maintenance::handle_health(&state, cli.json).await,
        Commands::Completions { .. } => Ok(()),
    };

    shutdown_tracing();
    result
}

/// Run the REST API until Ctrl+C or SIGTERM.
///
/// Re-adopts running instances first, then scans heartbeats on a timer
/// while the server is up.
async fn serve(state: AppState, host: &str, port: u16) -> anyhow::Result<()> {
    let report = state.engine.recover_running_instances().await?;
    if report.instances > 0 {
        tracing::info!(
            instances = report.instances,
            steps_reset = report.steps_reset,
            retries_requeued = report.retries_requeued,
            "re-adopted running instances"
        );
    }

    let cancel = CancellationToken::new();
    let scan_interval = state.config.engine.health_scan_interval_ms;
    let scanner = if scan_interval > 0 {
        Some(tokio::spawn(run_health_scans(
            state.clone(),
            Duration::from_millis(scan_interval),
            cancel.clone(),
        )))
    } else {
        None
    };

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    println!();
    println!(
        "  {} Stepwave API listening on {}",
        console::style(">").cyan().bold(),
        console::style(format!("http://{addr}")).cyan()
    );
    println!();

    let router = http::router::build_router(state.clone());
    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    cancel.cancel();
    if let Some(scanner) = scanner {
        let _ = scanner.await;
    }
    state.engine.graceful_shutdown();
    tracing::info!("server stopped");

    served?;
    Ok(())
}

async fn run_health_scans(state: AppState, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    // The first tick fires immediately; recovery just covered that.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match state.engine.check_heartbeat_health().await {
                    Ok(report) if report.steps_reset > 0 || report.instances_revived > 0 => {
                        tracing::info!(
                            steps_reset = report.steps_reset,
                            instances_revived = report.instances_revived,
                            rescheduled = report.rescheduled.len(),
                            "health scan repaired stale work"
                        );
                    }
                    Ok(_) => tracing::debug!("health scan found nothing stale"),
                    Err(e) => tracing::warn!(error = %e, "health scan failed"),
                }
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
