//! Prometheus metrics HTTP endpoint
//!
//! Provides /metrics endpoint for Prometheus scraping.

use std::net::SocketAddr;

use axum::{http::header::CONTENT_TYPE, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use tokio::sync::broadcast;
use tracing::{info, warn};

use super::metrics::REGISTRY;

/// Prometheus metrics endpoint
async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
}

/// Build the API router (metrics only)
pub fn build_api_router() -> Router {
    Router::new().route("/metrics", get(get_metrics))
}

/// Start the metrics server
pub async fn start_api_server(addr: SocketAddr, mut shutdown_rx: broadcast::Receiver<()>) {
    let app = build_api_router();

    info!("Prometheus metrics on http://{}/metrics", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!("Failed to bind metrics server to {}: {}", addr, e);
            return;
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("Metrics server shutting down");
        })
        .await
        .unwrap_or_else(|e| {
            warn!("Metrics server error: {}", e);
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::metrics::init_metrics;

    #[tokio::test]
    async fn test_metrics_endpoint_renders() {
        init_metrics();
        crate::app::metrics::TCP_CONNECTIONS_ACTIVE.set(0);

        let encoder = TextEncoder::new();
        let families = REGISTRY.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer).unwrap();

        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("shadowmux_tcp_connections_active"));
    }
}
