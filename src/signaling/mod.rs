#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod handlers;
pub mod protocol;

pub use handlers::{SessionBinding, SignalingContext};

use crate::metrics::ServerMetrics;
use crate::recording::Recorder;
use crate::room::RoomRegistry;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    ctx: SignalingContext,
    metrics: ServerMetrics,
    connection_semaphore: Arc<Semaphore>,
    idle_timeout: Duration,
}

impl SignalingServer {
    /// Creates a new signaling server
    pub fn new(
        registry: Arc<RoomRegistry>,
        recorder: Recorder,
        metrics: ServerMetrics,
        max_connections: usize,
        idle_timeout: Duration,
    ) -> Self {
        info!("Max connections: {}", max_connections);
        Self {
            ctx: SignalingContext { registry, recorder },
            metrics,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            idle_timeout,
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/", get(ws_handler))
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = TcpListener::bind(&addr).await?;
        self.serve_on(listener).await
    }

    /// Serves on an already bound listener
    pub async fn serve_on(self, listener: TcpListener) -> anyhow::Result<()> {
        let app = self.router();
        axum::serve(listener, app).await?;
        Ok(())
    }
}

/// Health check handler
async fn health_handler(
    State(server): State<SignalingServer>,
) -> Json<serde_json::Value> {
    let rooms = server.ctx.registry.room_count();
    let peers = server.ctx.registry.total_peer_count().await;
    let recordings = server.ctx.recorder.active_count();
    Json(serde_json::json!({
        "status": "ok",
        "rooms": rooms,
        "peers": peers,
        "recordings": recordings,
    }))
}

/// Metrics handler, Prometheus text exposition format
async fn metrics_handler(
    State(server): State<SignalingServer>,
) -> Response {
    let rooms = server.ctx.registry.room_count();
    let peers = server.ctx.registry.total_peer_count().await;
    let recordings = server.ctx.recorder.active_count();
    let body = server.metrics.render_prometheus(rooms, peers, recordings);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    ).into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<SignalingServer>,
) -> Response {
    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(
                socket,
                server.ctx,
                server.metrics,
                server.idle_timeout,
                permit,
            )
        })
}
