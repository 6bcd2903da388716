use anyhow::Context;

use neuroscreen_infra::PipelineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    neuroscreen_observability::init();

    let config = PipelineConfig::from_env().context("invalid configuration")?;
    tracing::info!(
        model_path = %config.model_path.display(),
        durable = config.data_dir.is_some(),
        workers = config.workers,
        "starting neuroscreen api"
    );

    let app = neuroscreen_api::app::build_app(&config).context("failed to build application")?;

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app.router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // In-flight jobs finish before the process exits.
    let workers = app.workers;
    tokio::task::spawn_blocking(move || workers.shutdown())
        .await
        .context("worker shutdown panicked")?;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
