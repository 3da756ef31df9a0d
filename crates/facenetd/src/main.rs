use anyhow::Result;
use facenet_core::{ModelCache, OnnxModels};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod http;
#[cfg(test)]
mod testing;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env();
    tracing::info!(
        bind = %config.bind,
        model_dir = %config.model_dir.display(),
        max_image_side = config.max_image_side,
        queue_depth = config.queue_depth,
        preload = config.preload_models,
        "facenetd starting"
    );

    let cache = ModelCache::new(OnnxModels::new(&config.model_dir, config.intra_threads));
    let engine = engine::spawn_engine(
        cache,
        config.max_image_side,
        config.queue_depth,
        config.preload_models,
    )?;

    let app = http::router(engine, config.max_upload_bytes);
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "facenetd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("facenetd shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
