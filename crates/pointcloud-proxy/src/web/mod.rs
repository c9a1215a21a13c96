//! Web layer module
//!
//! This module provides the HTTP interface of the point-cloud proxy. Handlers
//! are thin and delegate to the [`JobOrchestrator`].
//!
//! # Routes
//!
//! - `POST /api/v1/jobs`, `GET /api/v1/jobs/{job_id}`: submission and status
//! - `GET /api/v1/sessions/{session_id}/events`: live progress (SSE)
//! - `GET /api/v1/tiles/availability`, `GET /api/v1/tiles/bbox`: tile lookup
//! - `GET /tiles/{tile_id}/...`: converted artifacts, once the descriptor exists
//! - `GET /health`, `GET /api/v1/cache/stats`, `GET /api/openapi.json`

use anyhow::Result;
use axum::{Router, routing::get, routing::post};
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::Config;
use crate::services::JobOrchestrator;

pub mod handlers;
pub mod middleware;
pub mod openapi;
pub mod responses;

pub use responses::{ApiResponse, handle_error, handle_result};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<JobOrchestrator>,
    pub config: Config,
    pub start_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(orchestrator: Arc<JobOrchestrator>, config: Config) -> Self {
        Self {
            orchestrator,
            config,
            start_time: Utc::now(),
        }
    }
}

/// Web server configuration and setup
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(state: AppState) -> Result<Self> {
        let addr: SocketAddr =
            format!("{}:{}", state.config.web.host, state.config.web.port).parse()?;
        Ok(Self {
            app: create_router(state),
            addr,
        })
    }

    /// Serve until the token is cancelled, then drain open connections.
    ///
    /// `ready_signal` reports whether the listener could be bound.
    pub async fn serve_with_cancellation(
        self,
        ready_signal: tokio::sync::oneshot::Sender<Result<()>>,
        cancellation_token: CancellationToken,
    ) -> Result<()> {
        match tokio::net::TcpListener::bind(&self.addr).await {
            Ok(listener) => {
                let _ = ready_signal.send(Ok(()));
                info!("Web server listening on {}", self.addr);

                let shutdown_signal = async move {
                    cancellation_token.cancelled().await;
                    info!("Web server received cancellation signal, shutting down gracefully");
                };
                axum::serve(listener, self.app)
                    .with_graceful_shutdown(shutdown_signal)
                    .await?;
                Ok(())
            }
            Err(bind_error) => {
                let bind_err_msg = format!("Failed to bind to {}: {}", self.addr, bind_error);
                let _ = ready_signal.send(Err(anyhow::anyhow!("{}", bind_err_msg)));
                Err(anyhow::anyhow!("{}", bind_err_msg))
            }
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Create the router with all routes and middleware
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/api/openapi.json", get(openapi::openapi_json))
        .nest("/api/v1", api_v1_routes())
        .route("/tiles/{tile_id}/", get(handlers::tiles::serve_tile_root))
        .route(
            "/tiles/{tile_id}/{*path}",
            get(handlers::tiles::serve_tile_file),
        )
        // Middleware (applied in reverse order)
        .layer(CorsLayer::permissive())
        .layer(axum::middleware::from_fn(
            middleware::request_logging_middleware,
        ))
        .with_state(state)
}

fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(handlers::jobs::submit_job))
        .route("/jobs/{job_id}", get(handlers::jobs::get_job_status))
        .route(
            "/sessions/{session_id}/events",
            get(handlers::events::session_events),
        )
        .route(
            "/tiles/availability",
            get(handlers::tiles::tile_availability),
        )
        .route("/tiles/bbox", get(handlers::tiles::tiles_in_bbox))
        .route("/cache/stats", get(handlers::health::cache_stats))
}
