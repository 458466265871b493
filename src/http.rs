//! Operator HTTP endpoint of an instance.
//!
//! Serves Prometheus metrics on `/metrics` and a liveness document naming the
//! instance on `/health`. Runs on its own tokio task.

use axum::extract::State;
use axum::{Json, Router, routing::get};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;

async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

async fn health_handler(State(instance_id): State<Arc<str>>) -> Json<Value> {
    Json(json!({ "status": "ok", "instance": &*instance_id }))
}

/// Routes served for `instance_id`.
pub fn router(instance_id: &str) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::from(instance_id))
}

/// Serve [`router`] on `0.0.0.0:port` until the task is dropped.
pub async fn run_http_server(port: u16, instance_id: String) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(%addr, instance = %instance_id, error = %e, "Failed to bind operator HTTP endpoint");
            return;
        }
    };
    tracing::info!(%addr, instance = %instance_id, "Operator HTTP endpoint listening");

    if let Err(e) = axum::serve(listener, router(&instance_id)).await {
        tracing::error!(instance = %instance_id, error = %e, "Operator HTTP endpoint failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn get_path(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn health_names_the_instance() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router("instance-7")).await.unwrap();
        });

        let response = get_path(addr, "/health").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        let body = response.split("\r\n\r\n").nth(1).unwrap();
        let doc: Value = serde_json::from_str(body).unwrap();
        assert_eq!(doc, json!({ "status": "ok", "instance": "instance-7" }));

        let response = get_path(addr, "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        let response = get_path(addr, "/nope").await;
        assert!(response.starts_with("HTTP/1.1 404"), "{response}");
    }
}
