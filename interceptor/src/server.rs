//! HTTP surface of the Interceptor.
//!
//! Pages connect over a WebSocket per connection; decision surfaces are a
//! small REST API over the [`DecisionBoard`](crate::board::DecisionBoard).
//! Only the wallet's own origin may reach the decision API from a browser,
//! and a bearer token guards it when one is configured.

use crate::app::AppState;
use crate::config::Config;
use crate::board::OpenDecision;
use crate::collaborators::SurfaceHandle;
use crate::decision::{DecisionKind, RequestId};
use crate::error::{RequestError, TransportError};
use crate::page::{PageEnvelope, RawPageRequest};
use crate::polling::RpcConnectionStatus;
use crate::socket::WebsiteSocket;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Request, State,
    },
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

// ── Response Types ──────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub rpc: RpcConnectionStatus,
    pub latest_block: Option<u64>,
    pub connections: usize,
    pub stack_depth: usize,
    pub pending_decisions: usize,
    pub subscriptions: usize,
}

#[derive(Debug, Deserialize)]
pub struct AnswerBody {
    pub approve: bool,
}

// ── Handlers ────────────────────────────────────────────────────

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let rpc = state.poller.status();
    Json(HealthResponse {
        status: if rpc.retrying { "degraded" } else { "ok" },
        latest_block: state.poller.latest_block(),
        rpc,
        connections: state.sockets.connection_count(),
        stack_depth: state.simulation.snapshot().simulated_transactions.len(),
        pending_decisions: state.router.pending_decisions(),
        subscriptions: state.subscriptions.subscription_count(),
    })
}

/// GET /decisions
async fn list_decisions(State(state): State<Arc<AppState>>) -> Json<Vec<OpenDecision>> {
    Json(state.board.list())
}

/// POST /decisions/:kind/:id
async fn answer_decision(
    Path((kind, id)): Path<(DecisionKind, RequestId)>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<AnswerBody>,
) -> StatusCode {
    if state.router.answer(kind, id, body.approve) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// DELETE /decisions/:kind/:id: the surface was closed without an answer.
async fn close_decision(
    Path((kind, id)): Path<(DecisionKind, RequestId)>,
    State(state): State<Arc<AppState>>,
) -> StatusCode {
    if state.router.surface_closed(SurfaceHandle { kind, id }) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

/// POST /decisions/focus
async fn focus(State(state): State<Arc<AppState>>) -> StatusCode {
    state.board.focus();
    StatusCode::NO_CONTENT
}

/// Runs in front of every decision route.
async fn decision_guard(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(origin) = request.headers().get(header::ORIGIN) {
        let allowed = state
            .config
            .decision_origin
            .as_deref()
            .is_some_and(|allowed| origin.as_bytes() == allowed.as_bytes());
        if !allowed {
            warn!(origin = ?origin, path = %request.uri().path(), "Refusing decision API call from foreign origin");
            return Err(StatusCode::FORBIDDEN);
        }
    }
    if let Some(expected) = state.config.decision_token.as_deref() {
        if request.method() == Method::OPTIONS {
            return Ok(next.run(request).await);
        }
        let presented = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim);
        if presented != Some(expected) {
            warn!(path = %request.uri().path(), "Rejecting unauthenticated decision API call");
            return Err(StatusCode::UNAUTHORIZED);
        }
    }
    Ok(next.run(request).await)
}

/// GET /connect/:tab_id/:connection_name
async fn connect(
    Path((tab_id, connection_name)): Path<(i64, String)>,
    State(state): State<Arc<AppState>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let socket = WebsiteSocket::new(tab_id, connection_name);
    upgrade.on_upgrade(move |ws| serve_page(state, socket, ws))
}

// ── Page connections ────────────────────────────────────────────

fn parse_frame(text: &str) -> Result<RawPageRequest, RequestError> {
    let envelope: PageEnvelope = serde_json::from_str(text)
        .map_err(|e| RequestError::InvalidParams(format!("envelope: {e}")))?;
    serde_json::from_value(envelope.data)
        .map_err(|e| RequestError::InvalidParams(format!("request: {e}")))
}

/// Drive one page connection until it closes. Requests from the page are
/// handled strictly one at a time; replies and pushes share a bounded queue.
async fn serve_page(state: Arc<AppState>, socket: WebsiteSocket, ws: WebSocket) {
    let (mut sink, mut stream) = ws.split();

    let (outbound, mut queue) = mpsc::channel::<serde_json::Value>(state.config.socket_queue.max(1));
    state.router.register_connection(&socket, Arc::new(outbound));
    info!(socket = %socket, "Page connected");

    let writer_socket = socket.clone();
    let writer = tokio::spawn(async move {
        while let Some(data) = queue.recv().await {
            let frame = match serde_json::to_string(&PageEnvelope { data }) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(socket = %writer_socket, error = %e, "Failed to encode page message");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(frame)).await {
                let e = TransportError::classify(&e.to_string());
                if !e.is_gone() {
                    warn!(socket = %writer_socket, error = %e, "Page write failed");
                }
                break;
            }
        }
    });

    // A full queue stops reading the page, which pushes back on it.
    let (requests, mut inbox) = request_queue(&state.config);
    let router = state.router.clone();
    let worker_socket = socket.clone();
    let worker = tokio::spawn(async move {
        while let Some(raw) = inbox.recv().await {
            if let Err(e) = router.dispatch(&worker_socket, raw).await {
                warn!(socket = %worker_socket, error = %e, "Failed to deliver reply");
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(socket = %socket, error = %e, "Page stream error");
                break;
            }
        };
        match parse_frame(&text) {
            Ok(raw) => {
                if requests.send(raw).await.is_err() {
                    break;
                }
            }
            Err(e) => warn!(socket = %socket, error = %e, "Dropping unreadable page frame"),
        }
    }

    // Dropping the in-flight request closes its decision surface and
    // withdraws anything it put in the stack.
    worker.abort();
    state.router.on_disconnect(&socket);
    writer.abort();
}

fn request_queue(
    config: &Config,
) -> (mpsc::Sender<RawPageRequest>, mpsc::Receiver<RawPageRequest>) {
    mpsc::channel(config.socket_queue.max(1))
}

// ── Router ──────────────────────────────────────────────────────

/// Build the axum router with request tracing. Health is readable from any
/// origin; the decision API answers only its configured origin.
pub fn build_router(state: Arc<AppState>) -> Router {
    let health_cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET]);

    let mut decisions = Router::new()
        .route("/decisions", get(list_decisions))
        .route("/decisions/focus", post(focus))
        .route(
            "/decisions/:kind/:id",
            post(answer_decision).delete(close_decision),
        );
    if let Some(origin) = state.config.decision_origin.as_deref() {
        match HeaderValue::from_str(origin) {
            Ok(origin) => {
                decisions = decisions.layer(
                    CorsLayer::new()
                        .allow_origin(origin)
                        .allow_methods([Method::GET, Method::POST, Method::DELETE])
                        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]),
                );
            }
            Err(e) => warn!(origin, error = %e, "Ignoring unusable decision origin"),
        }
    }
    let decisions = decisions.layer(middleware::from_fn_with_state(state.clone(), decision_guard));

    Router::new()
        .route("/health", get(health).layer(health_cors))
        .route("/connect/:tab_id/:connection_name", get(connect))
        .merge(decisions)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: Arc<AppState>) -> Result<()> {
    let addr = format!("{}:{}", state.config.host, state.config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(%addr, "Interceptor listening");
    axum::serve(listener, build_router(state))
        .await
        .context("HTTP server failed")
}

// ── Tests ───────────────────────────────────────────────────────
