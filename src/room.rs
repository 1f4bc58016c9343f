// src/room.rs
//
// A room: the set of members sharing one preshared secret, keyed by user
// id. The room routes events (directed or broadcast), tracks its owner,
// and tears itself down through the empty-owner hook once the owner is no
// longer a member.
//
// Lock discipline: one reader-writer lock guards the member map and the
// lock flag together. Broadcasts happen after that lock is released where
// the write lock was held; pushing into member queues never blocks, so
// fanning out under the read lock is safe.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock, Weak};

use tracing::{debug, info};

use crate::error::SignalingError;
use crate::event::{Event, Join, Leave};
use crate::member::Member;
use crate::schema::{Members, Message};

type EmptyOwnerHook = Box<dyn FnOnce() + Send>;

struct RoomState {
    members: HashMap<String, Arc<Member>>,
    locked: bool,
}

/// Named rendezvous group. Created with its owner as the first member;
/// destroyed by the registry when the owner departs or on explicit request.
pub struct Room {
    name: String,
    owner: String,
    preshared: String,
    state: RwLock<RoomState>,
    empty_owner_hook: Mutex<Option<EmptyOwnerHook>>,
}

impl Room {
    /// Create a room and join `owner` as its first member.
    pub fn new(
        name: impl Into<String>,
        owner: impl Into<String>,
        preshared: impl Into<String>,
    ) -> Arc<Self> {
        let room = Arc::new(Self {
            name: name.into(),
            owner: owner.into(),
            preshared: preshared.into(),
            state: RwLock::new(RoomState {
                members: HashMap::new(),
                locked: false,
            }),
            empty_owner_hook: Mutex::new(None),
        });
        // A fresh, unlocked room cannot refuse its owner.
        let _ = room.join(&room.owner);
        room
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn preshared(&self) -> &str {
        &self.preshared
    }

    /// Install the callback fired exactly once when the owner ceases to be
    /// a member. The registry uses this to remove and close the room.
    pub fn set_empty_owner_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self.empty_owner_hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn locked(&self) -> bool {
        self.state.read().unwrap().locked
    }

    /// While locked, new members cannot join; existing members keep their
    /// slot.
    pub fn set_locked(&self, locked: bool) {
        self.state.write().unwrap().locked = locked;
    }

    /// Add `user` to the room.
    ///
    /// Re-joining an existing member only restarts its inactivity deadline.
    /// A new member gets a fresh queue, a watcher task enforcing eviction,
    /// and a broadcast `join` event to the rest of the room (sent after the
    /// write lock is released).
    pub fn join(self: &Arc<Self>, user: &str) -> Result<(), SignalingError> {
        let member = {
            let mut state = self.state.write().unwrap();
            if let Some(existing) = state.members.get(user) {
                existing.reset();
                return Ok(());
            }
            if state.locked {
                return Err(SignalingError::RoomLocked(self.name.clone()));
            }
            let member = Arc::new(Member::new(user));
            state.members.insert(user.to_string(), member.clone());
            member
        };
        debug!(room = %self.name, user, "member joined");
        self.spawn_inactivity_watcher(member);
        self.broadcast(user, Event::new(user, "", &Join { member: user.to_string() }));
        Ok(())
    }

    /// Remove `user`, close its queue, broadcast `leave` to the remaining
    /// members, then fire the empty-owner hook if the owner is gone.
    pub fn leave(&self, user: &str) -> Result<(), SignalingError> {
        let member = {
            let mut state = self.state.write().unwrap();
            match state.members.remove(user) {
                Some(member) => member,
                None => return Err(SignalingError::NotAMember(user.to_string())),
            }
        };
        member.close();
        debug!(room = %self.name, user, "member left");
        self.broadcast(user, Event::new(user, "", &Leave { member: user.to_string() }));

        let owner_present = self.state.read().unwrap().members.contains_key(&self.owner);
        if !owner_present {
            if let Some(hook) = self.empty_owner_hook.lock().unwrap().take() {
                info!(room = %self.name, "owner departed, tearing room down");
                hook();
            }
        }
        Ok(())
    }

    pub fn get(&self, user: &str) -> Option<Arc<Member>> {
        self.state.read().unwrap().members.get(user).cloned()
    }

    /// Visit every member under the read lock.
    pub fn iter(&self, mut visit: impl FnMut(&Member)) {
        let state = self.state.read().unwrap();
        for member in state.members.values() {
            visit(member);
        }
    }

    /// Owner plus the remaining member ids.
    pub fn members(&self) -> Members {
        let mut snapshot = Members::default();
        self.iter(|member| {
            if member.user_id == self.owner {
                snapshot.owner = member.user_id.clone();
            } else {
                snapshot.member.push(member.user_id.clone());
            }
        });
        snapshot
    }

    /// Route `msg.event`: directed when `to` names a current member,
    /// broadcast to everyone but the sender when `to` is empty. A directed
    /// event to an unknown address is dropped without error. The sender
    /// must be a member; a successful send restarts its deadline.
    pub fn send(&self, msg: &Message) -> Result<(), SignalingError> {
        let state = self.state.read().unwrap();
        let sender = state
            .members
            .get(&msg.request.user_id)
            .ok_or_else(|| SignalingError::NotAMember(msg.request.user_id.clone()))?;
        sender.reset();

        if !msg.event.to.is_empty() {
            match state.members.get(&msg.event.to) {
                Some(target) => target.push(msg.event.clone()),
                None => {
                    debug!(room = %self.name, to = %msg.event.to, "dropping event for unknown recipient");
                }
            }
        } else {
            for (user_id, member) in &state.members {
                if user_id != &msg.request.user_id {
                    member.push(msg.event.clone());
                }
            }
        }
        Ok(())
    }

    /// Close every member queue and empty the room.
    pub fn close(&self) {
        let members = {
            let mut state = self.state.write().unwrap();
            std::mem::take(&mut state.members)
        };
        for member in members.values() {
            member.close();
        }
    }

    fn broadcast(&self, from: &str, event: Event) {
        let state = self.state.read().unwrap();
        for (user_id, member) in &state.members {
            if user_id != from {
                member.push(event.clone());
            }
        }
    }

    /// Evict `member` as if by `leave` once its inactivity deadline lapses.
    /// The task holds only a weak room reference and ends as soon as the
    /// member is closed by any other path.
    fn spawn_inactivity_watcher(self: &Arc<Self>, member: Arc<Member>) {
        let room: Weak<Room> = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = member.expired() => {
                    if let Some(room) = room.upgrade() {
                        info!(room = %room.name, user = %member.user_id, "evicting inactive member");
                        // Already-gone is fine: eviction raced an explicit leave.
                        let _ = room.leave(&member.user_id);
                    }
                }
                _ = member.wait_closed() => {}
            }
        });
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
