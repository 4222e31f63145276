use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use uploadflow_api::app::{self, services};
use uploadflow_api::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    uploadflow_observability::init();

    let config = AppConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(
        services::build_services(&config)
            .await
            .context("failed to set up the broker transport")?,
    );

    let app = app::build_app(services.clone(), &config.jwt_secret);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    info!(
        addr = %listener.local_addr()?,
        service = %config.service_name,
        broker = config.broker.scheme(),
        "listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    services.shutdown().await;
    info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
}
