//! Health and Metrics Endpoint
//!
//! Small axum server reporting the ingester's view of the exchange
//! connection and the fetch budget, plus the Prometheus scrape.
//!
//! | route      | answer                                                |
//! |------------|-------------------------------------------------------|
//! | `/health`  | JSON report, 503 when the ingester cannot do its job  |
//! | `/healthz` | liveness, always `OK`                                 |
//! | `/readyz`  | 200 only while the exchange socket is connected       |
//! | `/metrics` | Prometheus text exposition                            |

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{AdmissionControl, RunMode};
use crate::infrastructure::exchange::{ConnectionHandle, ConnectionState};
use crate::infrastructure::metrics::get_metrics_handle;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Errors from the health server.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// The listener could not be bound.
    #[error("cannot bind health port {port}: {source}")]
    Bind {
        /// Requested port.
        port: u16,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The server stopped with an error.
    #[error("health server failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// Verdict reported by `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Connected, or a backfill that finished its work.
    Healthy,
    /// Between sessions; fetches resume after reconnecting.
    Degraded,
    /// The connection stopped before the work was done.
    Unhealthy,
}

/// JSON body of `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall verdict.
    pub status: HealthStatus,
    /// Crate version.
    pub version: String,
    /// `backfill` or `runtime`.
    pub mode: &'static str,
    /// Seconds since the server state was created.
    pub uptime_secs: u64,
    /// Wall clock at the time of the report.
    pub current_time: DateTime<Utc>,
    /// Exchange socket.
    pub connection: ConnectionReport,
    /// Fetch budget.
    pub admission: AdmissionReport,
}

/// Exchange socket section of the report.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionReport {
    /// Current state.
    pub state: ConnectionState,
    /// Sessions opened so far.
    pub sessions: u64,
    /// Sessions opened after the first.
    pub reconnects: u64,
    /// Messages dispatched to the pipeline.
    pub messages_received: u64,
    /// Frames written to the socket.
    pub frames_sent: u64,
}

/// Fetch budget section of the report.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionReport {
    /// Configured limit of outstanding fetches.
    pub capacity: usize,
    /// Permits free right now.
    pub available: usize,
    /// Fetches awaiting their response.
    pub in_flight: usize,
    /// No further fetches will be admitted.
    pub closed: bool,
}

/// What the health routes read from.
pub struct HealthServerState {
    version: String,
    mode: RunMode,
    started_at: Instant,
    connection: ConnectionHandle,
    admission: Arc<AdmissionControl>,
}

impl HealthServerState {
    /// Observe `connection` and `admission` for a process running `mode`.
    #[must_use]
    pub fn new(
        version: String,
        mode: RunMode,
        connection: ConnectionHandle,
        admission: Arc<AdmissionControl>,
    ) -> Self {
        Self {
            version,
            mode,
            started_at: Instant::now(),
            connection,
            admission,
        }
    }

    fn report(&self) -> HealthReport {
        let state = self.connection.state();
        let stats = self.connection.stats();
        let closed = self.admission.is_closed();

        HealthReport {
            status: classify(self.mode, state, closed),
            version: self.version.clone(),
            mode: self.mode.as_str(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            current_time: Utc::now(),
            connection: ConnectionReport {
                state,
                sessions: stats.sessions(),
                reconnects: stats.reconnects(),
                messages_received: stats.messages(),
                frames_sent: stats.frames_sent(),
            },
            admission: AdmissionReport {
                capacity: self.admission.capacity(),
                available: self.admission.available(),
                in_flight: self.admission.in_flight(),
                closed,
            },
        }
    }
}

/// A stopped connection is only expected at the end of a backfill, which
/// closes admission before stopping.
const fn classify(mode: RunMode, state: ConnectionState, admission_closed: bool) -> HealthStatus {
    match (state, mode) {
        (ConnectionState::Connected, _) => HealthStatus::Healthy,
        (ConnectionState::Connecting | ConnectionState::Disconnected, _) => HealthStatus::Degraded,
        (ConnectionState::Stopped, RunMode::Backfill) if admission_closed => HealthStatus::Healthy,
        (ConnectionState::Stopped, _) => HealthStatus::Unhealthy,
    }
}

/// HTTP server for the health routes.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Serve `state` on `port` until `cancel` fires.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Bind and serve.
    ///
    /// # Errors
    ///
    /// Returns [`HealthServerError::Bind`] if the port is taken and
    /// [`HealthServerError::Serve`] if the server fails while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], self.port)))
            .await
            .map_err(|source| HealthServerError::Bind {
                port: self.port,
                source,
            })?;
        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, router(self.state))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(HealthServerError::Serve)?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(|| async { "OK" }))
        .route("/readyz", get(ready))
        .route("/metrics", get(prometheus))
        .with_state(state)
}

async fn health(State(state): State<Arc<HealthServerState>>) -> Response {
    let report = state.report();
    let code = if report.status == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(report)).into_response()
}

async fn ready(State(state): State<Arc<HealthServerState>>) -> Response {
    match state.connection.state() {
        ConnectionState::Connected => (StatusCode::OK, "READY").into_response(),
        other => (StatusCode::SERVICE_UNAVAILABLE, other.as_str()).into_response(),
    }
}

async fn prometheus() -> Response {
    let Some(handle) = get_metrics_handle() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response();
    };
    (
        [(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)],
        handle.render(),
    )
        .into_response()
}
