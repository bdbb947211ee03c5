//! HTTP liveness and readiness endpoints.
//!
//! - `GET /live`: always `200 {"status":"ok"}` while the process serves requests
//! - `GET /ready`: JSON map of target name to `{healthy, data}`; the status
//!   code follows [`ReadinessPolicy`]

use std::{net::SocketAddr, sync::Arc};

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Instrument};

use crate::{config::ReadinessPolicy, core::readiness::HealthAggregator};

#[derive(Clone)]
struct AppState {
    aggregator: HealthAggregator,
    policy: ReadinessPolicy,
}

pub fn router(aggregator: HealthAggregator, policy: ReadinessPolicy) -> Router {
    Router::new()
        .route("/live", get(live_handler))
        .route("/ready", get(ready_handler))
        .with_state(Arc::new(AppState { aggregator, policy }))
}

async fn live_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let report = state.aggregator.probe().await;
    debug!(%report, "Readiness probed");

    let code = match state.policy {
        ReadinessPolicy::FailOnUnhealthy if !report.is_healthy() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (code, Json(report))
}

/// A running listener serving a router until shut down.
pub struct HttpServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: Option<JoinHandle<Result<(), std::io::Error>>>,
}

impl HttpServer {
    pub async fn bind(addr: SocketAddr, router: Router) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let signal = shutdown.clone();
        let task = tokio::spawn(
            async move {
                axum::serve(listener, router)
                    .with_graceful_shutdown(async move { signal.cancelled().await })
                    .await
            }
            .in_current_span(),
        );
        info!(address = %local_addr, "HTTP server listening");

        Ok(Self {
            local_addr,
            shutdown,
            task: Some(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolves if the listener stops on its own, with the reason.
    pub async fn stopped(&mut self) -> String {
        let Some(task) = self.task.as_mut() else {
            return std::future::pending().await;
        };
        let reason = match task.await {
            Ok(Ok(())) => "listener exited".to_string(),
            Ok(Err(e)) => format!("listener failed: {e}"),
            Err(e) => format!("listener task failed: {e}"),
        };
        self.task = None;
        reason
    }

    /// Stops accepting connections and waits for in-flight requests.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            match task.await {
                Ok(Ok(())) => debug!("HTTP server stopped"),
                Ok(Err(e)) => error!(error = %e, "HTTP server failed"),
                Err(e) => error!(error = %e, "HTTP server task failed"),
            }
        }
    }
}
