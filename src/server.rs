//! Control HTTP server.
//!
//! Small JSON-over-HTTP surface every pod exposes on its control port. All
//! `/control/*` verbs funnel into the lifecycle actor's queue; the server
//! itself holds no pod state beyond read-only handles. Status codes are part
//! of the contract: 406 flags a hook rejection, 408 a hook deadline, and 410
//! a pod idling in its terminal state (sweeps treat it as a no-op).

use crate::lifecycle::{ControlRequest, ControlVerb};
use crate::logbuf::LogBuffer;
use crate::types::{PodDescriptor, ProcessState};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

/// Outer deadline on a queued control request. Hook-level deadlines are
/// enforced by the lifecycle actor; this only catches a wedged queue.
const CONTROL_DEADLINE: Duration = Duration::from_secs(600);

/// Shared handler state.
#[derive(Clone)]
pub struct ServerState {
    pub control: mpsc::Sender<ControlRequest>,
    pub info: watch::Receiver<PodDescriptor>,
    pub depends_on: Vec<String>,
    pub logs: LogBuffer,
    pub reset: mpsc::Sender<()>,
    /// Leader probe outcome, empty while unset or following.
    pub status: watch::Receiver<String>,
    /// Metrics returned by the last sanity check.
    pub metrics: watch::Receiver<Value>,
}

/// Build the control router.
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/info", post(info))
        .route("/log", post(log))
        .route("/reset", post(reset))
        .route("/control/on", post(control_on))
        .route("/control/off", post(control_off))
        .route("/control/check", post(control_check))
        .route("/control/kill", post(control_kill))
        .route("/control/signal", post(control_signal))
        .with_state(state)
}

/// Serve until the listener is torn down with the agent.
pub async fn serve(listener: TcpListener, state: ServerState) -> crate::error::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "control server listening");
    axum::serve(listener, router(state))
        .await
        .map_err(|err| crate::error::AgentError::Network(err.to_string()))
}

async fn info(State(state): State<ServerState>) -> Response {
    debug!("http in -> /info");
    let descriptor = state.info.borrow().clone();
    if descriptor.process == ProcessState::Dead {
        return (StatusCode::GONE, Json(json!({}))).into_response();
    }
    let mut body = serde_json::to_value(&descriptor).unwrap_or_else(|_| json!({}));
    body["dependencies"] = json!(state.depends_on);
    body["status"] = json!(state.status.borrow().clone());
    body["metrics"] = state.metrics.borrow().clone();
    (StatusCode::OK, Json(body)).into_response()
}

async fn log(State(state): State<ServerState>) -> Response {
    debug!("http in -> /log");
    (StatusCode::OK, Json(json!({"lines": state.logs.lines()}))).into_response()
}

async fn reset(State(state): State<ServerState>) -> Response {
    debug!("http in -> /reset");
    let _ = state.reset.send(()).await;
    (StatusCode::OK, Json(json!({"ok": true}))).into_response()
}

async fn control_on(state: State<ServerState>, body: String) -> Response {
    control(state, ControlVerb::On, body).await
}

async fn control_off(state: State<ServerState>, body: String) -> Response {
    control(state, ControlVerb::Off, body).await
}

async fn control_check(state: State<ServerState>, body: String) -> Response {
    control(state, ControlVerb::Check, body).await
}

async fn control_kill(state: State<ServerState>, body: String) -> Response {
    control(state, ControlVerb::Kill, body).await
}

async fn control_signal(state: State<ServerState>, body: String) -> Response {
    control(state, ControlVerb::Signal, body).await
}

async fn control(
    State(state): State<ServerState>,
    verb: ControlVerb,
    body: String,
) -> Response {
    debug!(verb = ?verb, "http in -> /control");
    // A missing or malformed payload is treated as empty, not an error.
    let body: Option<Value> = serde_json::from_str(&body).ok();

    let (reply, outcome) = oneshot::channel();
    let request = ControlRequest { verb, body, reply };
    if state.control.send(request).await.is_err() {
        return (StatusCode::GONE, Json(json!({}))).into_response();
    }

    match tokio::time::timeout(CONTROL_DEADLINE, outcome).await {
        Ok(Ok(response)) => {
            let status =
                StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(response.body)).into_response()
        }
        Ok(Err(_)) => (StatusCode::GONE, Json(json!({}))).into_response(),
        Err(_) => (StatusCode::REQUEST_TIMEOUT, Json(json!({}))).into_response(),
    }
}

/// Bind the control listener, resolving port 0 to a concrete port.
pub async fn bind(port: u16) -> crate::error::Result<(TcpListener, u16)> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    let bound = listener.local_addr()?.port();
    Ok((listener, bound))
}
