use anyhow::Context;

use forgegen_infra::Config;
use forgegen_worker::{Adapters, WorkerApp};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    forgegen_observability::init();

    let config = Config::from_env().context("invalid configuration")?;
    tracing::info!(
        code_generation_queue = %config.code_generation_queue,
        deployment_queue = %config.deployment_queue,
        "starting forgegen worker"
    );

    let adapters = Adapters::from_config(&config).await?;
    let app = WorkerApp::start(adapters, config.worker.clone());

    shutdown_signal().await;
    tracing::info!("shutdown requested; waiting for in-flight jobs");

    let stats = app.shutdown().await;
    tracing::info!(
        code_generation = ?stats.code_generation,
        deployment = ?stats.deployment,
        "worker stopped"
    );
    Ok(())
}

/// Resolves on Ctrl+C, or SIGTERM on unix.
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
                tracing::error!(error = %e, "failed to listen for SIGTERM");
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
