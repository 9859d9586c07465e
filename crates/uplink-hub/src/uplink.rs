//! WebSocket uplink acceptor.
//!
//! Agents connect with a GET upgrade on `/ws`, presenting their name in the
//! `X-Hub-Meta-Name` header. A successful handshake stacks framed channel →
//! multiplexer session (hub side dials) → registered agent; the session's
//! close signal is the one and only trigger for unregistration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::{info, warn};

use uplink_control::{Agent, AgentRegistry, Feed};
use uplink_ws::{socket_config, FramedConfig, FramedSocket};

use crate::middleware;
use crate::services::format_duration;

/// Header carrying the agent name on an uplink request.
pub const META_NAME_HEADER: &str = "x-hub-meta-name";

/// State shared by the HTTP handlers.
pub struct HubState {
    pub registry: Arc<AgentRegistry>,
    pub feed: Feed,
    pub started: Instant,
    pub healthy: Arc<AtomicBool>,
}

/// Build the uplink router with its middleware stack.
pub fn router(state: Arc<HubState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", any(serve_uplink))
        .layer(axum::middleware::from_fn(middleware::log_requests))
        .layer(axum::middleware::from_fn(middleware::assign_request_id))
        .with_state(state)
}

/// Liveness endpoint: uptime while serving, 503 once shutdown has begun.
async fn health(State(state): State<Arc<HubState>>) -> Response {
    if state.healthy.load(Ordering::SeqCst) {
        let uptime = chrono::Duration::from_std(state.started.elapsed())
            .map(format_duration)
            .unwrap_or_else(|_| "unknown".to_string());
        format!("uptime: {uptime}\n").into_response()
    } else {
        StatusCode::SERVICE_UNAVAILABLE.into_response()
    }
}

/// `/ws`: validate the upgrade, answer 101, then run the uplink on the
/// upgraded connection.
async fn serve_uplink(State(state): State<Arc<HubState>>, mut req: Request) -> Response {
    let name = req
        .headers()
        .get(META_NAME_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    if !header_has_token(&req, header::CONNECTION, "upgrade")
        || !header_has_token(&req, header::UPGRADE, "websocket")
    {
        return (StatusCode::BAD_REQUEST, "expected a websocket upgrade").into_response();
    }
    let Some(key) = req.headers().get(header::SEC_WEBSOCKET_KEY).cloned() else {
        return (StatusCode::BAD_REQUEST, "missing sec-websocket-key").into_response();
    };
    let Some(on_upgrade) = req.extensions_mut().remove::<OnUpgrade>() else {
        return (StatusCode::BAD_REQUEST, "connection is not upgradable").into_response();
    };

    let accept = derive_accept_key(key.as_bytes());
    tokio::spawn(run_uplink(state, on_upgrade, name));

    let mut res = Response::new(Body::empty());
    *res.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    res.headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    res.headers_mut()
        .insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    if let Ok(value) = HeaderValue::from_str(&accept) {
        res.headers_mut().insert(header::SEC_WEBSOCKET_ACCEPT, value);
    }
    res
}

fn header_has_token(req: &Request, name: header::HeaderName, token: &str) -> bool {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
        .unwrap_or(false)
}

async fn run_uplink(state: Arc<HubState>, on_upgrade: OnUpgrade, name: String) {
    let upgraded = match on_upgrade.await {
        Ok(upgraded) => upgraded,
        Err(e) => {
            warn!("uplink upgrade failed: {e}");
            return;
        }
    };

    let socket = WebSocketStream::from_raw_socket(
        TokioIo::new(upgraded),
        Role::Server,
        Some(socket_config()),
    )
    .await;

    let framed = FramedSocket::new(socket, FramedConfig::default());
    let control = framed.control();

    let agent = match Agent::new(name.clone(), framed) {
        Ok(agent) => Arc::new(agent),
        Err(e) => {
            warn!("rejecting uplink: {e}");
            info!("have you set the {META_NAME_HEADER} header?");
            control.close_with_reason(&e.to_string()).await;
            return;
        }
    };

    if let Err(e) = state.registry.register(agent.clone()) {
        warn!("rejecting uplink: {e}");
        control.close_with_reason(&e.to_string()).await;
        agent.session().close();
        return;
    }
    info!(name = %name, "agent uplink established");
    if let Err(e) = state.feed.publish(format!("agent {name} connected")) {
        tracing::debug!("activity feed publish skipped: {e}");
    }

    // Per-agent supervisor: the session close signal is authoritative and is
    // the only path that unregisters.
    let registry = state.registry.clone();
    let feed = state.feed.clone();
    tokio::spawn(async move {
        agent.session().closed().await;
        info!(name = %name, "agent uplink closed");
        if let Err(e) = registry.unregister(&name) {
            tracing::debug!("unregister after close: {e}");
        }
        if let Err(e) = feed.publish(format!("agent {name} disconnected")) {
            tracing::debug!("activity feed publish skipped: {e}");
        }
    });
}
