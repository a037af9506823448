//! LBCF Kubernetes Operator
//!
//! Main entry point for the operator. Sets up the Kubernetes client, starts
//! the metrics server and runs the controllers until a shutdown signal.

use clap::Parser;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lbcf_operator::{config::OperatorConfig, controllers, metrics};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    init_tracing();

    let config = OperatorConfig::parse();
    config.validate()?;
    info!(?config, "Starting LBCF Operator");

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let shutdown = CancellationToken::new();

    // Start metrics server
    let mut metrics_handle = tokio::spawn(metrics::serve(config.metrics_port, shutdown.clone()));
    info!("Metrics server starting on port {}", config.metrics_port);

    let operator = controllers::run(client, &config, shutdown.clone());
    tokio::pin!(operator);

    tokio::select! {
        result = &mut operator => {
            match result {
                Ok(()) => error!("Controllers exited unexpectedly"),
                Err(e) => error!(error = %e, "Controllers failed"),
            }
            shutdown.cancel();
            return Ok(());
        }
        result = &mut metrics_handle => {
            error!(?result, "Metrics server exited unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping operator");
        }
    }

    // Drain the work queues before exiting
    shutdown.cancel();
    operator.await?;

    info!("LBCF Operator stopped");
    Ok(())
}

/// Initialize tracing subscriber
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for CTRL+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
