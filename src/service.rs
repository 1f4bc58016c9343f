// src/service.rs
//
// The `Signaling` service: the room registry plus the nine operations the
// remote-call surface exposes.
//
// Lock discipline (two layers): the registry lock guards only the
// name → room map -- writers are CreateRoom, DestroyRoom, and the
// empty-owner hook. Every other operation resolves the room under the read
// lock, clones the `Arc<Room>`, and releases the registry before touching
// the room, whose own lock guards per-room state. The hook can therefore
// re-enter the registry with the write lock without deadlocking, and Pull
// never holds any lock while parked on a member queue.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use subtle::ConstantTimeEq;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::SignalingError;
use crate::event::Event;
use crate::member::Member;
use crate::room::Room;
use crate::schema::{Members, Message, Request, SetLockedArgs};

/// How long `Pull` waits for the first event before replying `[]`.
pub const PULL_DEADLINE: Duration = Duration::from_secs(3);

fn preshared_matches(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

/// Room registry and operation surface. One instance per server process.
pub struct Signaling {
    rooms: RwLock<HashMap<String, Arc<Room>>>,
}

impl Signaling {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: RwLock::new(HashMap::new()),
        })
    }

    /// Create a room owned by the caller.
    ///
    /// Re-creating an existing room is idempotent when the caller is its
    /// owner and the secret matches (the owner just re-joins); anything
    /// else is a duplicate-name error.
    pub fn create_room(self: &Arc<Self>, req: &Request) -> Result<(), SignalingError> {
        req.validate()?;
        let mut rooms = self.rooms.write().unwrap();
        if let Some(existing) = rooms.get(&req.room_id) {
            if existing.owner() == req.user_id
                && preshared_matches(existing.preshared(), &req.preshared)
            {
                return existing.join(&req.user_id);
            }
            return Err(SignalingError::DuplicateRoom(req.room_id.clone()));
        }

        let room = Room::new(&req.room_id, &req.user_id, &req.preshared);
        let registry = Arc::downgrade(self);
        let name = req.room_id.clone();
        room.set_empty_owner_hook(move || {
            if let Some(registry) = registry.upgrade() {
                registry.remove_room(&name);
            }
        });
        rooms.insert(req.room_id.clone(), room);
        info!(room = %req.room_id, owner = %req.user_id, "room created");
        Ok(())
    }

    /// Remove and close a room. Owner-only, preshared-gated.
    pub fn destroy_room(&self, req: &Request) -> Result<(), SignalingError> {
        let room = self.resolve(req)?;
        if room.owner() != req.user_id {
            return Err(SignalingError::PermissionDenied(req.user_id.clone()));
        }
        self.remove_room(&req.room_id);
        Ok(())
    }

    /// Join the caller into the room (broadcasts `join` on new membership).
    pub fn join(&self, req: &Request) -> Result<(), SignalingError> {
        let room = self.resolve(req)?;
        room.join(&req.user_id)
    }

    /// Leave the caller from the room (broadcasts `leave`).
    pub fn leave(&self, req: &Request) -> Result<(), SignalingError> {
        let room = self.resolve(req)?;
        room.leave(&req.user_id)
    }

    /// Deliver one event, directed or broadcast.
    pub fn send(&self, msg: &Message) -> Result<(), SignalingError> {
        let room = self.resolve(&msg.request)?;
        room.send(msg)
    }

    /// Long-poll the caller's queue: wait up to [`PULL_DEADLINE`] for the
    /// first event, then drain whatever else is already buffered. Replies
    /// `[]` on timeout or once the member's queue is closed.
    pub async fn pull(&self, req: &Request) -> Result<Vec<Event>, SignalingError> {
        let member = self.resolve_member(req)?;
        member.reset();

        let mut events = Vec::new();
        match timeout(PULL_DEADLINE, member.pop()).await {
            Ok(Some(first)) => {
                events.push(first);
                while let Some(event) = member.try_pop() {
                    events.push(event);
                }
            }
            // Queue closed or deadline hit: empty batch.
            Ok(None) | Err(_) => {}
        }
        debug!(room = %req.room_id, user = %req.user_id, count = events.len(), "pull served");
        Ok(events)
    }

    /// Membership snapshot; caller must be a member.
    pub fn members(&self, req: &Request) -> Result<Members, SignalingError> {
        let room = self.resolve_room_for_member(req)?;
        Ok(room.members())
    }

    /// Query the lock flag; caller must be a member.
    pub fn locked(&self, req: &Request) -> Result<bool, SignalingError> {
        let room = self.resolve_room_for_member(req)?;
        Ok(room.locked())
    }

    /// Set the lock flag; caller must be a member.
    pub fn set_locked(&self, args: &SetLockedArgs) -> Result<(), SignalingError> {
        let room = self.resolve_room_for_member(&args.request)?;
        room.set_locked(args.locked);
        info!(room = %args.request.room_id, locked = args.locked, "lock flag changed");
        Ok(())
    }

    /// Rooms currently registered (liveness reporting).
    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap().len()
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Validate the request, look the room up under the registry read
    /// lock, release it, then check the secret in constant time.
    fn resolve(&self, req: &Request) -> Result<Arc<Room>, SignalingError> {
        req.validate()?;
        let room = {
            let rooms = self.rooms.read().unwrap();
            rooms
                .get(&req.room_id)
                .cloned()
                .ok_or_else(|| SignalingError::RoomNotFound(req.room_id.clone()))?
        };
        if !preshared_matches(room.preshared(), &req.preshared) {
            return Err(SignalingError::PresharedMismatch);
        }
        Ok(room)
    }

    fn resolve_member(&self, req: &Request) -> Result<Arc<Member>, SignalingError> {
        let room = self.resolve(req)?;
        room.get(&req.user_id)
            .ok_or_else(|| SignalingError::NotAMember(req.user_id.clone()))
    }

    fn resolve_room_for_member(&self, req: &Request) -> Result<Arc<Room>, SignalingError> {
        let room = self.resolve(req)?;
        if room.get(&req.user_id).is_none() {
            return Err(SignalingError::NotAMember(req.user_id.clone()));
        }
        Ok(room)
    }

    fn remove_room(&self, name: &str) {
        let removed = self.rooms.write().unwrap().remove(name);
        if let Some(room) = removed {
            room.close();
            info!(room = %name, "room destroyed");
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Join, Kinded};

    fn req(room: &str, user: &str, secret: &str) -> Request {
        Request::new(room, user, secret)
    }

    fn text(from: &str, to: &str, body: &str) -> Event {
        Event {
            from: from.into(),
            to: to.into(),
            kind: "text".into(),
            value: serde_json::json!({ "Message": body }),
        }
    }

    #[tokio::test]
    async fn create_requires_room_and_user() {
        let sig = Signaling::new();
        assert_eq!(
            sig.create_room(&req("", "alice", "")),
            Err(SignalingError::InvalidRequest("RoomID"))
        );
        assert_eq!(
            sig.create_room(&req("lobby", "", "")),
            Err(SignalingError::InvalidRequest("UserID"))
        );
    }

    #[tokio::test]
    async fn duplicate_room_rules() {
        let sig = Signaling::new();
        sig.create_room(&req("lobby", "alice", "p")).unwrap();

        // Same owner, same secret: idempotent.
        sig.create_room(&req("lobby", "alice", "p")).unwrap();

        // Different owner or different secret: duplicate.
        assert_eq!(
            sig.create_room(&req("lobby", "bob", "p")),
            Err(SignalingError::DuplicateRoom("lobby".into()))
        );
        assert_eq!(
            sig.create_room(&req("lobby", "alice", "other")),
            Err(SignalingError::DuplicateRoom("lobby".into()))
        );
    }

    #[tokio::test]
    async fn every_op_checks_preshared() {
        let sig = Signaling::new();
        sig.create_room(&req("lobby", "alice", "secret")).unwrap();

        let bad = req("lobby", "alice", "wrong");
        assert_eq!(sig.join(&bad), Err(SignalingError::PresharedMismatch));
        assert_eq!(sig.leave(&bad), Err(SignalingError::PresharedMismatch));
        assert_eq!(sig.members(&bad), Err(SignalingError::PresharedMismatch));
        assert_eq!(sig.locked(&bad), Err(SignalingError::PresharedMismatch));
        assert_eq!(
            sig.pull(&bad).await,
            Err(SignalingError::PresharedMismatch)
        );
        assert_eq!(
            sig.destroy_room(&bad),
            Err(SignalingError::PresharedMismatch)
        );
    }

    #[tokio::test]
    async fn empty_preshared_matches_only_empty() {
        let sig = Signaling::new();
        sig.create_room(&req("open", "alice", "")).unwrap();
        assert!(sig.join(&req("open", "bob", "")).is_ok());
        assert_eq!(
            sig.join(&req("open", "carol", "p")),
            Err(SignalingError::PresharedMismatch)
        );
    }

    #[tokio::test]
    async fn membership_lifecycle() {
        let sig = Signaling::new();
        sig.create_room(&req("lobby", "alice", "")).unwrap();
        sig.join(&req("lobby", "bob", "")).unwrap();

        let members = sig.members(&req("lobby", "bob", "")).unwrap();
        assert_eq!(members.owner, "alice");
        assert_eq!(members.member, vec!["bob".to_string()]);

        sig.leave(&req("lobby", "bob", "")).unwrap();
        let members = sig.members(&req("lobby", "alice", "")).unwrap();
        assert!(members.member.is_empty());
    }

    #[tokio::test]
    async fn members_requires_membership() {
        let sig = Signaling::new();
        sig.create_room(&req("lobby", "alice", "")).unwrap();
        assert_eq!(
            sig.members(&req("lobby", "spy", "")),
            Err(SignalingError::NotAMember("spy".into()))
        );
    }

    #[tokio::test]
    async fn destroy_is_owner_only() {
        let sig = Signaling::new();
        sig.create_room(&req("lobby", "alice", "")).unwrap();
        sig.join(&req("lobby", "bob", "")).unwrap();

        assert_eq!(
            sig.destroy_room(&req("lobby", "bob", "")),
            Err(SignalingError::PermissionDenied("bob".into()))
        );
        sig.destroy_room(&req("lobby", "alice", "")).unwrap();
        assert_eq!(
            sig.join(&req("lobby", "bob", "")),
            Err(SignalingError::RoomNotFound("lobby".into()))
        );
    }

    #[tokio::test]
    async fn owner_leave_tears_down_room() {
        let sig = Signaling::new();
        sig.create_room(&req("lobby", "alice", "")).unwrap();
        sig.join(&req("lobby", "bob", "")).unwrap();

        sig.leave(&req("lobby", "alice", "")).unwrap();
        assert_eq!(sig.room_count(), 0);
        assert_eq!(
            sig.send(&Message {
                request: req("lobby", "bob", ""),
                event: text("bob", "", "anyone?"),
            }),
            Err(SignalingError::RoomNotFound("lobby".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn pull_times_out_empty() {
        let sig = Signaling::new();
        sig.create_room(&req("lobby", "alice", "")).unwrap();

        let started = tokio::time::Instant::now();
        let events = sig.pull(&req("lobby", "alice", "")).await.unwrap();
        assert!(events.is_empty());
        assert!(started.elapsed() >= PULL_DEADLINE);
    }

    #[tokio::test]
    async fn pull_returns_batch_in_order() {
        let sig = Signaling::new();
        sig.create_room(&req("lobby", "alice", "")).unwrap();
        sig.join(&req("lobby", "bob", "")).unwrap();

        // Drain bob's join broadcast from alice's queue first.
        let _ = sig.pull(&req("lobby", "alice", "")).await.unwrap();

        for n in 0..3 {
            sig.send(&Message {
                request: req("lobby", "bob", ""),
                event: text("bob", "alice", &format!("m{n}")),
            })
            .unwrap();
        }

        let events = sig.pull(&req("lobby", "alice", "")).await.unwrap();
        let bodies: Vec<_> = events.iter().map(|e| e.value["Message"].clone()).collect();
        assert_eq!(bodies, vec!["m0", "m1", "m2"]);
    }

    #[tokio::test]
    async fn join_broadcast_carries_member_name() {
        let sig = Signaling::new();
        sig.create_room(&req("lobby", "alice", "")).unwrap();
        sig.join(&req("lobby", "bob", "")).unwrap();

        let events = sig.pull(&req("lobby", "alice", "")).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, Join::KIND);
        assert_eq!(events[0].value["Member"], "bob");
    }

    #[tokio::test]
    async fn lock_flow() {
        let sig = Signaling::new();
        sig.create_room(&req("lobby", "alice", "")).unwrap();

        sig.set_locked(&SetLockedArgs {
            request: req("lobby", "alice", ""),
            locked: true,
        })
        .unwrap();
        assert!(sig.locked(&req("lobby", "alice", "")).unwrap());

        assert_eq!(
            sig.join(&req("lobby", "carol", "")),
            Err(SignalingError::RoomLocked("lobby".into()))
        );

        sig.set_locked(&SetLockedArgs {
            request: req("lobby", "alice", ""),
            locked: false,
        })
        .unwrap();
        sig.join(&req("lobby", "carol", "")).unwrap();
    }
}
