// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Prometheus `/metrics` endpoint for the embedding process.

use std::net::SocketAddr;

use axum::{http::StatusCode, routing::get, Router};
use prometheus::TextEncoder;

async fn handler_metrics() -> (StatusCode, String) {
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&prometheus::gather()) {
        Ok(body) => (StatusCode::OK, body),
        Err(err) => {
            tracing::error!(error = %err, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

/// Serve `/metrics` on the given port until the enclosing task stops.
pub async fn serve(port: u16) -> anyhow::Result<()> {
    let app = Router::new().route("/metrics", get(handler_metrics));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Metrics server listening");
    axum::serve(listener, app).await?;
    Ok(())
}
