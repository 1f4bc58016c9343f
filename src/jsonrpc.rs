// src/jsonrpc.rs
//
// JSON-RPC 1.0 framing and method dispatch for the `Signaling` service.
//
// One request frame is `{"method": "Signaling.X", "params": [arg], "id": n}`;
// the reply is `{"result": ..., "error": null, "id": n}` with exactly one of
// `result`/`error` non-null. Both transports (WebSocket session, single-shot
// HTTP POST) funnel into `dispatch`, so the method table exists once.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::schema::{Message, Request, SetLockedArgs};
use crate::service::Signaling;

// ─── Frames ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestFrame {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub id: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseFrame {
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub id: Value,
}

impl ResponseFrame {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            result,
            error: None,
            id,
        }
    }

    pub fn err(id: Value, error: impl Into<String>) -> Self {
        Self {
            result: Value::Null,
            error: Some(error.into()),
            id,
        }
    }
}

/// Encode a frame for a byte-stream transport (newline-delimited).
pub fn encode_frame<T: Serialize>(frame: &T) -> String {
    let mut line = serde_json::to_string(frame).unwrap_or_else(|_| "null".into());
    line.push('\n');
    line
}

// ─── Dispatch ───────────────────────────────────────────────────────────────

/// Run one request frame against the service and produce its reply frame.
pub async fn dispatch(service: &Arc<Signaling>, frame: RequestFrame) -> ResponseFrame {
    let id = frame.id.clone();
    match call(service, frame).await {
        Ok(result) => ResponseFrame::ok(id, result),
        Err(error) => ResponseFrame::err(id, error),
    }
}

async fn call(service: &Arc<Signaling>, frame: RequestFrame) -> Result<Value, String> {
    let arg = frame.params.into_iter().next().unwrap_or(Value::Null);
    match frame.method.as_str() {
        "Signaling.CreateRoom" => {
            let req: Request = decode_arg(&frame.method, arg)?;
            service.create_room(&req).map_err(|e| e.to_string())?;
            Ok(Value::Null)
        }
        "Signaling.DestroyRoom" => {
            let req: Request = decode_arg(&frame.method, arg)?;
            service.destroy_room(&req).map_err(|e| e.to_string())?;
            Ok(Value::Null)
        }
        "Signaling.Join" => {
            let req: Request = decode_arg(&frame.method, arg)?;
            service.join(&req).map_err(|e| e.to_string())?;
            Ok(Value::Null)
        }
        "Signaling.Leave" => {
            let req: Request = decode_arg(&frame.method, arg)?;
            service.leave(&req).map_err(|e| e.to_string())?;
            Ok(Value::Null)
        }
        "Signaling.Send" => {
            let msg: Message = decode_arg(&frame.method, arg)?;
            service.send(&msg).map_err(|e| e.to_string())?;
            Ok(Value::Null)
        }
        "Signaling.Pull" => {
            let req: Request = decode_arg(&frame.method, arg)?;
            let events = service.pull(&req).await.map_err(|e| e.to_string())?;
            serde_json::to_value(events).map_err(|e| e.to_string())
        }
        "Signaling.Members" => {
            let req: Request = decode_arg(&frame.method, arg)?;
            let members = service.members(&req).map_err(|e| e.to_string())?;
            serde_json::to_value(members).map_err(|e| e.to_string())
        }
        "Signaling.Locked" => {
            let req: Request = decode_arg(&frame.method, arg)?;
            let locked = service.locked(&req).map_err(|e| e.to_string())?;
            Ok(Value::Bool(locked))
        }
        "Signaling.SetLocked" => {
            let args: SetLockedArgs = decode_arg(&frame.method, arg)?;
            service.set_locked(&args).map_err(|e| e.to_string())?;
            Ok(Value::Null)
        }
        method => Err(format!("rpc: can't find method {method}")),
    }
}

fn decode_arg<T: DeserializeOwned>(method: &str, arg: Value) -> Result<T, String> {
    serde_json::from_value(arg).map_err(|e| format!("invalid params for {method}: {e}"))
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(method: &str, arg: Value, id: u64) -> RequestFrame {
        RequestFrame {
            method: method.into(),
            params: vec![arg],
            id: json!(id),
        }
    }

    fn request_arg(room: &str, user: &str, secret: &str) -> Value {
        json!({ "RoomID": room, "UserID": user, "Preshared": secret })
    }

    #[tokio::test]
    async fn create_then_members_roundtrip() {
        let sig = Signaling::new();

        let reply = dispatch(&sig, frame("Signaling.CreateRoom", request_arg("r", "alice", "p"), 1)).await;
        assert!(reply.error.is_none(), "unexpected error: {:?}", reply.error);
        assert_eq!(reply.id, json!(1));

        let reply = dispatch(&sig, frame("Signaling.Members", request_arg("r", "alice", "p"), 2)).await;
        assert!(reply.error.is_none());
        assert_eq!(reply.result["Owner"], "alice");
        assert_eq!(reply.result["Member"], json!([]));
    }

    #[tokio::test]
    async fn errors_cross_as_strings() {
        let sig = Signaling::new();
        let reply = dispatch(&sig, frame("Signaling.Join", request_arg("nowhere", "bob", ""), 7)).await;
        assert_eq!(reply.result, Value::Null);
        assert_eq!(reply.error.as_deref(), Some("room not found: nowhere"));
        assert_eq!(reply.id, json!(7));
    }

    #[tokio::test]
    async fn unknown_method_is_reported() {
        let sig = Signaling::new();
        let reply = dispatch(&sig, frame("Signaling.Explode", Value::Null, 3)).await;
        assert_eq!(
            reply.error.as_deref(),
            Some("rpc: can't find method Signaling.Explode")
        );
    }

    #[tokio::test]
    async fn malformed_params_are_reported() {
        let sig = Signaling::new();
        let reply = dispatch(&sig, frame("Signaling.Join", json!(42), 4)).await;
        let err = reply.error.expect("error expected");
        assert!(err.starts_with("invalid params for Signaling.Join"), "{err}");
    }

    #[tokio::test]
    async fn locked_returns_bool_result() {
        let sig = Signaling::new();
        dispatch(&sig, frame("Signaling.CreateRoom", request_arg("r", "alice", ""), 1)).await;

        let set = json!({ "RoomID": "r", "UserID": "alice", "Preshared": "", "Locked": true });
        let reply = dispatch(&sig, frame("Signaling.SetLocked", set, 2)).await;
        assert!(reply.error.is_none());

        let reply = dispatch(&sig, frame("Signaling.Locked", request_arg("r", "alice", ""), 3)).await;
        assert_eq!(reply.result, Value::Bool(true));
    }

    #[test]
    fn response_wire_shape_keeps_null_halves() {
        let ok = ResponseFrame::ok(json!(1), json!({ "Owner": "a" }));
        let text = serde_json::to_string(&ok).unwrap();
        assert!(text.contains("\"error\":null"), "{text}");

        let err = ResponseFrame::err(json!(2), "boom");
        let text = serde_json::to_string(&err).unwrap();
        assert!(text.contains("\"result\":null"), "{text}");
        assert!(text.contains("\"error\":\"boom\""), "{text}");
    }

    #[test]
    fn encode_frame_is_newline_delimited() {
        let line = encode_frame(&ResponseFrame::ok(json!(1), Value::Null));
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }
}
