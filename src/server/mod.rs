//! Push gateway HTTP API server.
//!
//! Routes `POST /_matrix/push/v1/notify` into the dispatcher and serves the
//! `/health` and `/metrics` endpoints.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::config::HttpConfig;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::push::{NotificationDispatcher, NotifyRequest};

/// Maximum accepted request body size.
const MAX_REQUEST_SIZE: usize = 512 * 1024;

/// Reply to a successfully handled notify request.
#[derive(Debug, Serialize)]
struct NotifyResponse {
    rejected: Vec<String>,
}

/// Matrix-style error body.
#[derive(Debug, Serialize)]
struct MatrixError {
    errcode: &'static str,
    error: String,
}

/// Shared state for request handlers.
struct AppState {
    dispatcher: Arc<NotificationDispatcher>,
    metrics: Option<Metrics>,
}

/// The push gateway API server.
pub struct GatewayServer {
    config: HttpConfig,
    dispatcher: Arc<NotificationDispatcher>,
    metrics: Option<Metrics>,
}

impl GatewayServer {
    /// Create a new server.
    pub fn new(
        config: HttpConfig,
        dispatcher: Arc<NotificationDispatcher>,
        metrics: Option<Metrics>,
    ) -> Self {
        Self {
            config,
            dispatcher,
            metrics,
        }
    }

    /// Build the route tree.
    fn router(&self) -> Router {
        let state = Arc::new(AppState {
            dispatcher: self.dispatcher.clone(),
            metrics: self.metrics.clone(),
        });

        Router::new()
            .route("/_matrix/push/v1/notify", post(notify_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(DefaultBodyLimit::max(MAX_REQUEST_SIZE))
            .with_state(state)
    }

    /// Run listeners on every configured address until shutdown is signaled.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut listeners = Vec::new();
        for address in &self.config.bind_addresses {
            let listener = TcpListener::bind((address.as_str(), self.config.port))
                .await
                .map_err(|e| {
                    std::io::Error::new(
                        e.kind(),
                        format!(
                            "Failed to bind to '{}:{}': {}",
                            address, self.config.port, e
                        ),
                    )
                })?;
            info!(address = %address, port = self.config.port, "Listening");
            listeners.push(listener);
        }

        let mut tasks = Vec::new();
        for listener in listeners {
            let app = self.router();
            let mut shutdown = shutdown.clone();
            tasks.push(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = shutdown.changed().await;
                    })
                    .await
            }));
        }

        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Listener failed");
                    return Err(e.into());
                }
                Err(e) => {
                    error!(error = %e, "Listener task panicked");
                }
            }
        }

        Ok(())
    }
}

/// `POST /_matrix/push/v1/notify`
async fn notify_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let start = Instant::now();
    let request_id = Uuid::new_v4().to_string();

    let response = handle_notify(&state, &body)
        .instrument(info_span!("notify", %request_id))
        .await;

    if let Some(metrics) = &state.metrics {
        metrics.record_notify_response(response.status().as_u16(), start.elapsed().as_secs_f64());
    }
    response
}

async fn handle_notify(state: &AppState, body: &[u8]) -> Response {
    let request: NotifyRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Rejecting malformed notification");
            return error_response(
                StatusCode::BAD_REQUEST,
                format!("Invalid notification: {e}"),
            );
        }
    };
    let notification = request.notification;

    if notification.devices.is_empty() {
        warn!("Rejecting notification with no devices");
        return error_response(
            StatusCode::BAD_REQUEST,
            "No devices in notification".to_string(),
        );
    }

    if let Some(metrics) = &state.metrics {
        metrics.record_notification_received(notification.devices.len());
    }

    match state.dispatcher.dispatch(&notification).await {
        Ok(rejected) => {
            if !rejected.is_empty() {
                info!(
                    rejected = rejected.len(),
                    "Delivered notification with rejected pushkeys"
                );
            }
            (StatusCode::OK, Json(NotifyResponse { rejected })).into_response()
        }
        Err(failure) => {
            warn!(error = %failure, "Failed to dispatch notification");
            error_response(StatusCode::BAD_GATEWAY, failure.to_string())
        }
    }
}

/// `GET /health`: a blank 200 for liveness probes.
async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// `GET /metrics`: Prometheus text exposition.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(metrics) = &state.metrics else {
        return (StatusCode::NOT_FOUND, "Metrics disabled".to_string()).into_response();
    };

    let metric_families = metrics.gather();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics".to_string(),
        )
            .into_response();
    }

    match String::from_utf8(buffer) {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to convert metrics buffer to string");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to convert metrics to string".to_string(),
            )
                .into_response()
        }
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(MatrixError {
            errcode: "M_UNKNOWN",
            error: message,
        }),
    )
        .into_response()
}
