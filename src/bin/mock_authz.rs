//! Mock authorization service for local testing.
//!
//! Answers raw HTTP checks on any path: `authorization: Bearer allow` is
//! allowed (with an `x-auth-user` header for the upstream), anything else
//! gets a 403 with a JSON body.

use axum::{
    Router,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let app = Router::new().fallback(check);

    let addr = SocketAddr::from(([0, 0, 0, 0], 9002));
    tracing::info!("AuthGate mock authorization service listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!("Failed to bind to {}: {}", addr, e);
        e
    })?;

    axum::serve(listener, app).await.map_err(|e| {
        tracing::error!("Server error: {}", e);
        e
    })?;

    Ok(())
}

async fn check(headers: HeaderMap) -> Response {
    let allowed = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "Bearer allow");

    if allowed {
        tracing::info!("check allowed");
        return (StatusCode::OK, [("x-auth-user", "mock-user")]).into_response();
    }

    tracing::info!("check denied");
    let body = serde_json::json!({ "error": "forbidden", "reason": "missing or invalid token" });
    (
        StatusCode::FORBIDDEN,
        [("content-type", "application/json")],
        body.to_string(),
    )
        .into_response()
}
