// src/client.rs
//
// WebSocket RPC client for the signaling service.
//
// The connection is dialed lazily on the first call and re-dialed on the
// next call after a failure; a failed call itself is always surfaced to
// the caller -- retry policy belongs to whoever drives the client. Calls
// are multiplexed over one socket by sequence id, so a parked Pull and a
// Send can be in flight together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::error::SignalingError;
use crate::event::Event;
use crate::jsonrpc::{encode_frame, RequestFrame, ResponseFrame};
use crate::schema::{Members, Message, Request, SetLockedArgs};

/// Public rendezvous endpoint used when the config names none.
pub const DEFAULT_SIGNALING_URL: &str = "wss://signaling.arukascloud.io/ws";

// ─── ClientConfig ───────────────────────────────────────────────────────────

/// Connection settings plus the auth context sent with every call.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub request: Request,
    /// Signaling server URL (`ws://` or `wss://`).
    pub url: String,
    /// Origin header; derived from `url` when empty.
    pub origin: String,
}

impl ClientConfig {
    /// Fill the blanks: default URL, generated user id, derived origin
    /// (`wss → https`, `ws → http`, path stripped).
    pub fn normalize(mut self) -> Result<Self, SignalingError> {
        if self.url.is_empty() {
            self.url = DEFAULT_SIGNALING_URL.to_string();
        }
        if self.request.user_id.is_empty() {
            self.request.user_id = Uuid::new_v4().to_string();
        }
        if self.origin.is_empty() {
            let url = Url::parse(&self.url).map_err(SignalingError::transport)?;
            let scheme = match url.scheme() {
                "wss" => "https",
                "ws" => "http",
                other => {
                    return Err(SignalingError::Transport(format!(
                        "unsupported scheme: {other}"
                    )))
                }
            };
            let host = url
                .host_str()
                .ok_or_else(|| SignalingError::Transport("url has no host".into()))?;
            self.origin = match url.port() {
                Some(port) => format!("{scheme}://{host}:{port}"),
                None => format!("{scheme}://{host}"),
            };
        }
        Ok(self)
    }
}

// ─── Client ─────────────────────────────────────────────────────────────────

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<ResponseFrame>>>>;

struct Connection {
    frame_tx: mpsc::UnboundedSender<String>,
    pending: PendingMap,
}

/// Re-dialable JSON-RPC client.
pub struct Client {
    config: ClientConfig,
    seq: AtomicU64,
    conn: tokio::sync::Mutex<Option<Connection>>,
}

impl Client {
    /// The config must already be [normalized](ClientConfig::normalize).
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            seq: AtomicU64::new(0),
            conn: tokio::sync::Mutex::new(None),
        }
    }

    pub fn request(&self) -> &Request {
        &self.config.request
    }

    /// Issue one call, dialing first if no connection is open.
    pub async fn call(&self, method: &str, arg: Value) -> Result<Value, SignalingError> {
        let reply_rx = {
            let mut conn = self.conn.lock().await;
            if conn.is_none() {
                *conn = Some(self.dial().await?);
            }
            let open = conn.as_ref().unwrap();

            let id = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
            let (reply_tx, reply_rx) = oneshot::channel();
            open.pending.lock().unwrap().insert(id, reply_tx);

            let frame = RequestFrame {
                method: method.to_string(),
                params: vec![arg],
                id: Value::from(id),
            };
            if open.frame_tx.send(encode_frame(&frame)).is_err() {
                open.pending.lock().unwrap().remove(&id);
                *conn = None;
                return Err(SignalingError::Transport("connection closed".into()));
            }
            reply_rx
        };

        match reply_rx.await {
            Ok(reply) => match reply.error {
                Some(error) => Err(SignalingError::Remote(error)),
                None => Ok(reply.result),
            },
            Err(_) => {
                // The reader dropped our slot: the socket died mid-call.
                *self.conn.lock().await = None;
                Err(SignalingError::Transport("connection lost".into()))
            }
        }
    }

    /// Drop the current connection, if any. The next call re-dials.
    pub async fn close(&self) {
        *self.conn.lock().await = None;
    }

    async fn dial(&self) -> Result<Connection, SignalingError> {
        let mut ws_request = self
            .config
            .url
            .as_str()
            .into_client_request()
            .map_err(SignalingError::transport)?;
        ws_request.headers_mut().insert(
            header::ORIGIN,
            HeaderValue::from_str(&self.config.origin).map_err(SignalingError::transport)?,
        );

        let (socket, _) = connect_async(ws_request)
            .await
            .map_err(SignalingError::transport)?;
        debug!(url = %self.config.url, "signaling connection established");

        let (mut sink, mut stream) = socket.split();
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            while let Some(text) = frame_rx.recv().await {
                if sink.send(WsMessage::text(text)).await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        tokio::spawn(async move {
            while let Some(Ok(message)) = stream.next().await {
                let text = match message {
                    WsMessage::Text(text) => text,
                    WsMessage::Close(_) => break,
                    _ => continue,
                };
                let reply: ResponseFrame = match serde_json::from_str(text.as_str().trim()) {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!(error = %e, "dropping malformed reply frame");
                        continue;
                    }
                };
                let Some(id) = reply.id.as_u64() else {
                    warn!("dropping reply frame without numeric id");
                    continue;
                };
                let slot = reader_pending.lock().unwrap().remove(&id);
                match slot {
                    Some(reply_tx) => {
                        let _ = reply_tx.send(reply);
                    }
                    None => debug!(id, "reply for unknown call"),
                }
            }
            // Socket gone: dropping the slots fails every outstanding call.
            reader_pending.lock().unwrap().clear();
        });

        Ok(Connection { frame_tx, pending })
    }

    // ── Typed wrappers ──────────────────────────────────────────────────

    pub async fn create_room(&self, req: &Request) -> Result<(), SignalingError> {
        self.call_unit("Signaling.CreateRoom", req).await
    }

    pub async fn destroy_room(&self, req: &Request) -> Result<(), SignalingError> {
        self.call_unit("Signaling.DestroyRoom", req).await
    }

    pub async fn join(&self, req: &Request) -> Result<(), SignalingError> {
        self.call_unit("Signaling.Join", req).await
    }

    pub async fn leave(&self, req: &Request) -> Result<(), SignalingError> {
        self.call_unit("Signaling.Leave", req).await
    }

    pub async fn send(&self, msg: &Message) -> Result<(), SignalingError> {
        self.call_unit("Signaling.Send", msg).await
    }

    pub async fn pull(&self, req: &Request) -> Result<Vec<Event>, SignalingError> {
        let result = self.call("Signaling.Pull", to_arg(req)?).await?;
        if result.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(result).map_err(SignalingError::transport)
    }

    pub async fn members(&self, req: &Request) -> Result<Members, SignalingError> {
        let result = self.call("Signaling.Members", to_arg(req)?).await?;
        serde_json::from_value(result).map_err(SignalingError::transport)
    }

    pub async fn locked(&self, req: &Request) -> Result<bool, SignalingError> {
        let result = self.call("Signaling.Locked", to_arg(req)?).await?;
        result
            .as_bool()
            .ok_or_else(|| SignalingError::Transport("non-bool Locked reply".into()))
    }

    pub async fn set_locked(&self, args: &SetLockedArgs) -> Result<(), SignalingError> {
        self.call_unit("Signaling.SetLocked", args).await
    }

    async fn call_unit<T: serde::Serialize>(
        &self,
        method: &str,
        arg: &T,
    ) -> Result<(), SignalingError> {
        self.call(method, to_arg(arg)?).await.map(|_| ())
    }
}

fn to_arg<T: serde::Serialize>(arg: &T) -> Result<Value, SignalingError> {
    serde_json::to_value(arg).map_err(SignalingError::transport)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
