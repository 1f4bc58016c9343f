// src/schema.rs
//
// Request/response shapes shared by the server surface and the client
// driver. Field names are capitalized on the wire; the event envelope
// inside a `Message` keeps its own lowercase keys.

use serde::{Deserialize, Serialize};

use crate::error::SignalingError;
use crate::event::Event;

/// Auth context every operation carries: which room, who is calling, and
/// the room secret. `Preshared` may be empty -- it then matches only rooms
/// created with an empty secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    #[serde(rename = "RoomID")]
    pub room_id: String,
    #[serde(rename = "UserID")]
    pub user_id: String,
    #[serde(rename = "Preshared", default)]
    pub preshared: String,
}

impl Request {
    pub fn new(
        room_id: impl Into<String>,
        user_id: impl Into<String>,
        preshared: impl Into<String>,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            user_id: user_id.into(),
            preshared: preshared.into(),
        }
    }

    /// Reject requests missing the mandatory identifiers.
    pub fn validate(&self) -> Result<(), SignalingError> {
        if self.room_id.is_empty() {
            return Err(SignalingError::InvalidRequest("RoomID"));
        }
        if self.user_id.is_empty() {
            return Err(SignalingError::InvalidRequest("UserID"));
        }
        Ok(())
    }
}

/// A `Send` envelope: auth context plus the event to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(flatten)]
    pub request: Request,
    #[serde(rename = "Event")]
    pub event: Event,
}

/// Snapshot returned by `Signaling.Members`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Members {
    #[serde(rename = "Owner")]
    pub owner: String,
    #[serde(rename = "Member", default)]
    pub member: Vec<String>,
}

/// Argument of `Signaling.SetLocked`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetLockedArgs {
    #[serde(flatten)]
    pub request: Request,
    #[serde(rename = "Locked")]
    pub locked: bool,
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Join, Kinded};

    #[test]
    fn validate_requires_room_and_user() {
        assert_eq!(
            Request::new("", "alice", "").validate(),
            Err(SignalingError::InvalidRequest("RoomID"))
        );
        assert_eq!(
            Request::new("lobby", "", "").validate(),
            Err(SignalingError::InvalidRequest("UserID"))
        );
        assert!(Request::new("lobby", "alice", "").validate().is_ok());
    }

    #[test]
    fn message_flattens_request() {
        let msg = Message {
            request: Request::new("lobby", "alice", "p"),
            event: Event {
                from: "alice".into(),
                to: "bob".into(),
                kind: Join::KIND.into(),
                value: serde_json::json!({ "Member": "alice" }),
            },
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["RoomID"], "lobby");
        assert_eq!(json["UserID"], "alice");
        assert_eq!(json["Preshared"], "p");
        assert_eq!(json["Event"]["from"], "alice");
        assert_eq!(json["Event"]["kind"], "join");
    }

    #[test]
    fn set_locked_wire_shape() {
        let args = SetLockedArgs {
            request: Request::new("lobby", "alice", ""),
            locked: true,
        };
        let json = serde_json::to_value(&args).unwrap();
        assert_eq!(json["RoomID"], "lobby");
        assert_eq!(json["Locked"], true);

        let back: SetLockedArgs = serde_json::from_value(json).unwrap();
        assert_eq!(back, args);
    }
}
