// src/server.rs
//
// HTTP surface of the signaling server. Two transports carry the same
// JSON-RPC service:
//
//   /ws   -- WebSocket upgrade; one long-lived session per connection.
//           Every request frame is dispatched on its own task so a parked
//           Pull never blocks other calls on the same socket; a writer
//           task serializes the (possibly out-of-order) replies.
//   POST / -- one-shot: a single request frame in the body, its reply in
//           the response. Any other method on `/` gets the canonical 405.
//
// Plus two plain handlers: `/stun` (verbatim STUN host list from the
// environment) and `/health` (liveness summary).

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::jsonrpc::{self, RequestFrame, ResponseFrame};
use crate::service::Signaling;

// ─── AppState ───────────────────────────────────────────────────────────────

pub struct AppState {
    pub signaling: Arc<Signaling>,
    pub config: Config,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        Arc::new(Self {
            signaling: Signaling::new(),
            config,
        })
    }
}

// ─── Router ─────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(&state.config.allowed_origins);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/stun", get(stun_handler))
        .route("/health", get(health_handler))
        .route("/", post(http_rpc).fallback(post_only))
        .layer(cors)
        .with_state(state)
}

// ─── CORS ───────────────────────────────────────────────────────────────────

fn build_cors_layer(allowed_origins: &str) -> CorsLayer {
    if allowed_origins == "*" {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.parse::<HeaderValue>().expect("invalid origin header value"))
            .collect();

        info!("CORS: restricted to {} origin(s)", origins.len());

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([HeaderName::from_static("content-type")])
    }
}

// ─── Plain handlers ─────────────────────────────────────────────────────────

async fn stun_handler(State(state): State<Arc<AppState>>) -> String {
    state.config.stun.clone()
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "rooms_active": state.signaling.room_count(),
    }))
}

// ─── One-shot HTTP transport ────────────────────────────────────────────────

async fn http_rpc(State(state): State<Arc<AppState>>, body: String) -> Response {
    let frame: RequestFrame = match serde_json::from_str(body.trim()) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "rejecting malformed rpc body");
            let reply = ResponseFrame::err(Value::Null, format!("invalid request: {e}"));
            return Json(reply).into_response();
        }
    };
    let reply = jsonrpc::dispatch(&state.signaling, frame).await;
    Json(reply).into_response()
}

async fn post_only() -> Response {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        "405 POST only\n",
    )
        .into_response()
}

// ─── WebSocket transport ────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

async fn handle_session(socket: WebSocket, state: Arc<AppState>) {
    info!("signaling session connected");
    let (mut sink, mut stream) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<ResponseFrame>();

    let writer = tokio::spawn(async move {
        while let Some(reply) = reply_rx.recv().await {
            let text = match serde_json::to_string(&reply) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to encode reply frame");
                    continue;
                }
            };
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "session read failed");
                break;
            }
        };
        match message {
            WsMessage::Text(text) => {
                let frame: RequestFrame = match serde_json::from_str(text.trim()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "dropping malformed request frame");
                        continue;
                    }
                };
                // Each call runs on its own task: a parked Pull must not
                // block a concurrent Send on the same socket.
                let service = state.signaling.clone();
                let reply_tx = reply_tx.clone();
                tokio::spawn(async move {
                    let reply = jsonrpc::dispatch(&service, frame).await;
                    let _ = reply_tx.send(reply);
                });
            }
            WsMessage::Close(_) => break,
            // Pings are answered by axum; binary frames are not part of
            // the protocol.
            _ => {}
        }
    }

    drop(reply_tx);
    let _ = writer.await;
    info!("signaling session disconnected");
}

// ─── Tests ──────────────────────────────────────────────────────────────────
