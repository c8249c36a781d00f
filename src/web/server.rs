use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::config::WebConfig;

use super::api::{
    fetch_all, fetch_source, health_check, list_clients, list_sources, list_summaries, query,
    refresh_clients, stats, summary, AppState,
};

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/sources", get(list_sources))
        .route("/api/fetch", post(fetch_all))
        .route("/api/fetch/:source_id", post(fetch_source))
        .route("/api/query", post(query))
        .route("/api/summaries", get(list_summaries))
        .route("/api/summaries/:name", post(summary))
        .route("/api/clients", get(list_clients))
        .route("/api/clients/refresh", post(refresh_clients))
        .route("/api/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the REST API until `shutdown_rx` flips to true
pub async fn run_server(
    state: Arc<AppState>,
    web_config: &WebConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&web_config.listen).await?;
    tracing::info!("Web server listening on {}", web_config.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|&v| v).await;
            tracing::info!("Web server shutting down gracefully");
        })
        .await
}
