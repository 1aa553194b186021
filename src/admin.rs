//! Admin listener: Prometheus text exposition and a liveness check.

use std::net::SocketAddr;

use axum::Router;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use prometheus::{Registry, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Routes served on the admin listener.
pub fn router(registry: Registry) -> Router {
    Router::new()
        .route("/metrics", get(metrics))
        .route("/healthz", get(healthz))
        .with_state(registry)
}

/// Serve the admin routes until `shutdown` fires.
///
/// # Errors
///
/// Returns an I/O error if the listener cannot be bound or fails.
pub async fn serve(addr: SocketAddr, registry: Registry, shutdown: CancellationToken) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "admin listener started");
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn metrics(State(registry): State<Registry>) -> Response {
    let mut body = String::new();
    match TextEncoder::new().encode_utf8(&registry.gather(), &mut body) {
        Ok(()) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::AuthzStats;

    #[tokio::test]
    async fn test_metrics_and_health() {
        let registry = Registry::new();
        let stats = AuthzStats::register("admin_test.", &registry).unwrap();
        stats.denied.inc();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(registry)).await.unwrap();
        });

        let client = reqwest::Client::new();
        let metrics = client
            .get(format!("http://{addr}/metrics"))
            .send()
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(metrics.contains("admin_test_ext_authz_denied 1"));

        let health = client
            .get(format!("http://{addr}/healthz"))
            .send()
            .await
            .unwrap();
        assert_eq!(health.status(), reqwest::StatusCode::OK);
    }
}
