//! HTTP configuration endpoint
//!
//! `POST /` accepts the gateway provisioning body and (re)activates the
//! bridge; `GET /status` reports what is currently active.
//!
//! ```text
//! POST / {"added_broker": "tcp://127.0.0.1:1883",
//!         "broker_ip_h_ns": "tcp://ns.example.com:1883",
//!         "gwid_token": "0102030405060708"}
//! ```

use crate::bridge::{ActiveConfiguration, BridgeController, BridgeProbe, BridgeState, ConnectionStatus};
use crate::config::ForwardingConfig;
use crate::error::BridgeError;
use crate::transport::MessageBroker;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::Filter;

/// Largest accepted configuration body
const MAX_BODY_BYTES: u64 = 16 * 1024;

/// Provisioning request body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigRequest {
    /// Source broker the gateway publishes to
    pub added_broker: String,
    /// Network server broker
    pub broker_ip_h_ns: String,
    /// Hex gateway identity
    pub gwid_token: String,
    /// Target namespace; the identity token when absent
    #[serde(default)]
    pub topic_namespace: Option<String>,
}

impl From<ConfigRequest> for ForwardingConfig {
    fn from(request: ConfigRequest) -> Self {
        let topic_namespace = request
            .topic_namespace
            .filter(|namespace| !namespace.trim().is_empty())
            .unwrap_or_else(|| request.gwid_token.clone());
        ForwardingConfig {
            source_broker: request.added_broker,
            target_broker: request.broker_ip_h_ns,
            gateway_id: request.gwid_token,
            topic_namespace,
        }
    }
}

#[derive(Debug, Serialize)]
struct AppliedResponse {
    status: &'static str,
    generation: u64,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    status: &'static str,
    kind: &'static str,
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    bridge: BridgeState,
    configuration: Option<ActiveConfiguration>,
    connections: Option<ConnectionStatus>,
}

fn error_reply(status: StatusCode, kind: &'static str, error: impl ToString) -> WithStatus<Json> {
    warp::reply::with_status(
        warp::reply::json(&ErrorResponse {
            status: "error",
            kind,
            error: error.to_string(),
        }),
        status,
    )
}

/// HTTP status for a failed apply
pub fn status_for(error: &BridgeError) -> StatusCode {
    match error {
        BridgeError::Config(_) => StatusCode::UNPROCESSABLE_ENTITY,
        BridgeError::Connection(_) => StatusCode::BAD_GATEWAY,
        BridgeError::Superseded { .. } => StatusCode::CONFLICT,
        BridgeError::Terminated => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn handle_apply<B: MessageBroker>(
    body: Bytes,
    controller: Arc<BridgeController<B>>,
) -> Result<WithStatus<Json>, Infallible> {
    let request: ConfigRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Rejected malformed configuration request");
            return Ok(error_reply(StatusCode::BAD_REQUEST, "request", e));
        }
    };

    info!(
        source = %request.added_broker,
        target = %request.broker_ip_h_ns,
        gateway_id = %request.gwid_token,
        "Configuration request received"
    );

    match controller.apply_configuration(request.into()).await {
        Ok(generation) => Ok(warp::reply::with_status(
            warp::reply::json(&AppliedResponse {
                status: "ok",
                generation,
            }),
            StatusCode::OK,
        )),
        Err(e) => {
            warn!(error = %e, "Configuration request failed");
            Ok(error_reply(status_for(&e), e.kind(), e))
        }
    }
}

async fn handle_status<B: MessageBroker>(
    controller: Arc<BridgeController<B>>,
) -> Result<WithStatus<Json>, Infallible> {
    let response = StatusResponse {
        bridge: controller.state(),
        configuration: controller
            .current_configuration()
            .map(|config| config.as_ref().clone()),
        connections: controller.connection_status(),
    };
    Ok(warp::reply::with_status(
        warp::reply::json(&response),
        StatusCode::OK,
    ))
}

/// All endpoint routes, usable directly with `warp::test`
pub fn routes<B: MessageBroker>(
    controller: Arc<BridgeController<B>>,
) -> impl Filter<Extract = (WithStatus<Json>,), Error = warp::Rejection> + Clone + Send + Sync + 'static
{
    let with_controller = warp::any().map(move || controller.clone());

    let apply = warp::path::end()
        .and(warp::post())
        .and(warp::body::content_length_limit(MAX_BODY_BYTES))
        .and(warp::body::bytes())
        .and(with_controller.clone())
        .and_then(handle_apply::<B>);

    let status = warp::path("status")
        .and(warp::path::end())
        .and(warp::get())
        .and(with_controller)
        .and_then(handle_status::<B>);

    // Anything else sent to `/` (other methods, oversized bodies)
    let rejected = warp::path::end().and(warp::method()).map(|method| {
        error_reply(
            StatusCode::BAD_REQUEST,
            "request",
            format!("{method} not supported, POST a configuration"),
        )
    });

    apply.or(status).unify().or(rejected).unify()
}

/// Bind the endpoint; the returned future serves until `shutdown` resolves
pub fn serve<B: MessageBroker>(
    controller: Arc<BridgeController<B>>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(SocketAddr, impl Future<Output = ()>), warp::Error> {
    let (bound, server) =
        warp::serve(routes(controller)).try_bind_with_graceful_shutdown(addr, shutdown)?;
    info!(address = %bound, "Configuration endpoint listening");
    Ok((bound, server))
}
