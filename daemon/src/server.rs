use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use zimage_core::Config;
use zimage_runtime_diffusion::{select_device, DiffusionRuntime, ZImageLoader};

use crate::api;
use crate::state::AppState;

/// Select the device, load the model, then serve. A failed load returns
/// before the listener is bound.
pub async fn run_server(addr: SocketAddr, config: Config) -> Result<()> {
    let profile = select_device();
    let runtime = Arc::new(DiffusionRuntime::new(
        config.models.model_id.clone(),
        profile,
        config.daemon.max_pending,
    ));

    runtime
        .load(Arc::new(ZImageLoader::from_config(&config.models)))
        .await?;
    tracing::info!(
        "Engine {} ready on {}",
        runtime.engine_name().unwrap_or("unknown"),
        runtime.profile()
    );

    let state = Arc::new(AppState::from_config(runtime, &config));
    serve(addr, state).await
}

pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = api::routes(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Starting daemon on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down; in-flight generations run to completion");
}
