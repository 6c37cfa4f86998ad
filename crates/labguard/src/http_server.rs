//! HTTP server for the Prometheus metrics endpoint.

use crate::metrics::MetricsRegistry;
use crate::status_store::StatusStore;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[derive(Clone)]
struct AppState {
    registry: Arc<MetricsRegistry>,
    store: StatusStore,
}

/// HTTP server for metrics endpoint
pub struct MetricsServer {
    registry: Arc<MetricsRegistry>,
    store: StatusStore,
    listen_addr: String,
}

impl MetricsServer {
    pub fn new(registry: Arc<MetricsRegistry>, store: StatusStore, listen_addr: String) -> Self {
        Self {
            registry,
            store,
            listen_addr,
        }
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(AppState {
                registry: self.registry.clone(),
                store: self.store.clone(),
            })
    }

    /// Bind the listen address. Split from [`serve`](Self::serve) so a bad
    /// address fails startup instead of a background task.
    pub async fn bind(&self) -> common::Result<TcpListener> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!(listen_addr = %self.listen_addr, "Metrics server listening");
        Ok(listener)
    }

    /// Serve on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> common::Result<()> {
        axum::serve(listener, self.router()).await?;
        Ok(())
    }
}

/// Handler for /metrics endpoint
async fn metrics_handler(State(state): State<AppState>) -> Response {
    state.registry.update_phase_counts(&state.store.phase_counts());

    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &state.registry.registry) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
        .into_response()
}

/// Liveness plus per-phase device counts.
async fn healthz_handler(State(state): State<AppState>) -> Response {
    (StatusCode::OK, Json(state.store.phase_counts())).into_response()
}
