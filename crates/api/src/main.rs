use anyhow::Context;

use shoptrack_core::Settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("invalid configuration")?;
    shoptrack_observability::init(settings.log_format);

    let bind_addr = settings.bind_addr.clone();
    let services = shoptrack_api::app::services::build_services(settings).await?;
    let app = shoptrack_api::app::build_app(services.clone());

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    // Joins worker threads; keep it off the runtime workers.
    tokio::task::spawn_blocking(move || services.shutdown()).await?;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
