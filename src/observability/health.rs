//! Health check HTTP server for container orchestration
//!
//! Endpoints for operators and probes:
//!
//! - `GET /health` - overall status with per-check detail (200 or 503)
//! - `GET /ready` - 200 while the bridge is forwarding
//! - `GET /live` - always 200 while the process serves HTTP
//! - `GET /metrics` - [`MetricsSnapshot`](super::metrics::MetricsSnapshot) as JSON
//! - `GET /` - endpoint listing

use crate::bridge::{BridgeProbe, BridgeState};
use crate::observability::metrics::metrics;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use warp::http::StatusCode;
use warp::Filter;

/// Environment variable overriding the configured port
pub const HEALTH_PORT_ENV: &str = "HEALTH_PORT";

/// HTTP health check server
pub struct HealthServer {
    port: u16,
    probe: Arc<dyn BridgeProbe>,
}

impl HealthServer {
    pub fn new(port: u16, probe: Arc<dyn BridgeProbe>) -> Self {
        Self { port, probe }
    }

    /// Configured port unless `HEALTH_PORT` holds a valid one
    pub fn port_from_env(configured: u16) -> u16 {
        std::env::var(HEALTH_PORT_ENV)
            .ok()
            .and_then(|value| value.trim().parse().ok())
            .unwrap_or(configured)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Current health report
    pub fn health_status(&self) -> HealthStatus {
        let state = self.probe.state();
        let mut checks = BTreeMap::new();
        checks.insert("bridge".to_string(), check_bridge(state));

        match self.probe.connection_status() {
            Some(status) => {
                checks.insert(
                    "source_broker".to_string(),
                    check_connection(status.source, "source"),
                );
                checks.insert(
                    "target_broker".to_string(),
                    check_connection(status.target, "target"),
                );
            }
            None if state.is_forwarding() => {
                checks.insert(
                    "brokers".to_string(),
                    HealthCheck::healthy("Activation in progress"),
                );
            }
            None => {}
        }

        let healthy = checks.values().all(|check| check.status == CheckStatus::Healthy);
        HealthStatus {
            status: if healthy { "healthy" } else { "degraded" },
            state,
            timestamp: current_timestamp(),
            uptime_seconds: metrics().get_metrics().bridge.uptime_seconds,
            checks,
        }
    }

    pub fn routes(
        self: &Arc<Self>,
    ) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone + Send + Sync + 'static
    {
        let health_server = self.clone();
        let ready_server = self.clone();

        let health_route = warp::path("health").and(warp::get()).map(move || {
            let status = health_server.health_status();
            let code = if status.status == "healthy" {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            warp::reply::with_status(warp::reply::json(&status), code)
        });

        let metrics_route = warp::path("metrics")
            .and(warp::get())
            .map(|| warp::reply::json(&metrics().get_metrics()));

        let ready_route = warp::path("ready").and(warp::get()).map(move || {
            let state = ready_server.probe.state();
            let ready = state.is_forwarding();
            let response = ReadinessResponse {
                ready,
                state,
                timestamp: current_timestamp(),
            };
            let code = if ready {
                StatusCode::OK
            } else {
                StatusCode::SERVICE_UNAVAILABLE
            };
            warp::reply::with_status(warp::reply::json(&response), code)
        });

        let live_route = warp::path("live").and(warp::get()).map(|| {
            warp::reply::json(&LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            })
        });

        let root_route = warp::path::end().and(warp::get()).map(|| {
            let endpoints = BTreeMap::from([
                ("/health", "Overall health status with detailed checks"),
                ("/metrics", "Message and bridge counters"),
                ("/ready", "Readiness probe: bridge is forwarding"),
                ("/live", "Liveness probe"),
            ]);
            warp::reply::json(&ApiDocumentationResponse { endpoints })
        });

        health_route
            .or(metrics_route)
            .or(ready_route)
            .or(live_route)
            .or(root_route)
            .with(warp::cors().allow_any_origin())
    }

    /// Bind and serve until `shutdown` resolves
    pub fn serve(
        self: Arc<Self>,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(SocketAddr, impl Future<Output = ()>), warp::Error> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let (bound, server) =
            warp::serve(self.routes()).try_bind_with_graceful_shutdown(addr, shutdown)?;
        tracing::info!("Starting health server on {}", bound);
        Ok((bound, server))
    }
}

fn check_bridge(state: BridgeState) -> HealthCheck {
    match state {
        BridgeState::Unconfigured => HealthCheck::healthy("Waiting for configuration"),
        BridgeState::Active { generation } => {
            HealthCheck::healthy(format!("Forwarding with configuration {generation}"))
        }
        BridgeState::Reconfiguring { from, to } => {
            HealthCheck::healthy(format!("Switching configuration {from} -> {to}"))
        }
        BridgeState::Terminated => HealthCheck::unhealthy("Bridge terminated"),
    }
}

fn check_connection(connected: bool, role: &str) -> HealthCheck {
    if connected {
        HealthCheck::healthy(format!("{role} broker connected"))
    } else {
        HealthCheck::unhealthy(format!("{role} broker disconnected or reconnecting"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: CheckStatus,
    pub message: Option<String>,
    pub last_check: u64,
}

impl HealthCheck {
    fn healthy(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Healthy,
            message: Some(message.into()),
            last_check: current_timestamp(),
        }
    }

    fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Unhealthy,
            message: Some(message.into()),
            last_check: current_timestamp(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub state: BridgeState,
    pub timestamp: u64,
    pub uptime_seconds: u64,
    pub checks: BTreeMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    state: BridgeState,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct ApiDocumentationResponse {
    endpoints: BTreeMap<&'static str, &'static str>,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
