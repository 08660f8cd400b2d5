use anyhow::Context;
use clap::Parser;

use larder_api::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    larder_observability::init();

    let config = Config::parse();
    tracing::info!(?config, "starting larder-api");

    let app = larder_api::app::build_app(&config)
        .await
        .context("failed to initialise application")?;

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app.router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    app.sweeper.shutdown().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
