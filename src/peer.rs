// src/peer.rs
//
// Peer-connection choreography on top of the signaling node.
//
// The WebRTC engine itself stays behind the `PeerConnection`/`PeerFactory`
// traits -- this module only moves session descriptions and ICE candidates
// through the room. Roles are kept in two split registries:
//
//   servers -- connections we requested by sending `connect`; we answer the
//             offer that comes back.
//   clients -- connections we created because a `connect` arrived; we make
//             the offer.
//
// Candidates are buffered per link and applied in one batch when the
// remote side reports `*-completed`; `*-failed` discards the pending link
// from whichever side owns it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::client::ClientConfig;
use crate::error::SignalingError;
use crate::event::{Event, Join, Kinded, KindRegistry, KindRegistryBuilder, Leave};
use crate::node::{Dispatcher, Node};
use crate::schema::{Members, Message};

// ─── Wire payloads ──────────────────────────────────────────────────────────

/// SDP blob in the W3C dictionary shape. Opaque to the signaling layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: String,
    pub sdp: String,
}

/// One ICE candidate in the W3C dictionary shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

macro_rules! marker_kind {
    ($name:ident, $kind:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct $name {}

        impl Kinded for $name {
            const KIND: &'static str = $kind;
        }
    };
}

macro_rules! wrapper_kind {
    ($name:ident, $inner:ident, $kind:literal, $doc:literal) => {
        #[doc = $doc]
        #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl Kinded for $name {
            const KIND: &'static str = $kind;
        }
    };
}

marker_kind!(Connect, "connect", "Request that the remote side open a connection toward us.");
wrapper_kind!(Offer, SessionDescription, "offer", "Session description offered by the caller.");
wrapper_kind!(Answer, SessionDescription, "answer", "Session description answering an offer.");
wrapper_kind!(OfferCandidate, IceCandidate, "offer-candidate", "ICE candidate gathered on the offer side.");
marker_kind!(OfferCompleted, "offer-completed", "Offer-side ICE gathering finished.");
marker_kind!(OfferFailed, "offer-failed", "Offer-side ICE gathering failed.");
wrapper_kind!(AnswerCandidate, IceCandidate, "answer-candidate", "ICE candidate gathered on the answer side.");
marker_kind!(AnswerCompleted, "answer-completed", "Answer-side ICE gathering finished.");
marker_kind!(AnswerFailed, "answer-failed", "Answer-side ICE gathering failed.");

/// Add the nine peer-connection kinds to a registry under construction.
pub fn register_peer_kinds(builder: KindRegistryBuilder) -> KindRegistryBuilder {
    builder
        .register::<Connect>()
        .register::<Offer>()
        .register::<Answer>()
        .register::<OfferCandidate>()
        .register::<OfferCompleted>()
        .register::<OfferFailed>()
        .register::<AnswerCandidate>()
        .register::<AnswerCompleted>()
        .register::<AnswerFailed>()
}

/// Membership kinds plus the peer-connection kinds: everything a
/// [`PeerNode`] dispatches on.
pub fn peer_registry() -> KindRegistry {
    register_peer_kinds(
        KindRegistry::builder().register::<Join>().register::<Leave>(),
    )
    .build()
}

// ─── Engine abstraction ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("peer connection: {0}")]
pub struct PeerError(pub String);

/// Callbacks the engine invokes as local ICE gathering progresses. The
/// node wires these to `*-candidate` / `*-completed` / `*-failed` sends
/// for whichever role the link plays.
pub struct IceHandlers {
    pub on_candidate: Box<dyn Fn(IceCandidate) + Send + Sync>,
    pub on_gathering_complete: Box<dyn Fn() + Send + Sync>,
    pub on_error: Box<dyn Fn() + Send + Sync>,
}

/// Minimal surface the signaling choreography needs from a WebRTC engine.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    async fn close(&self);
}

/// Creates engine connections; injected so the choreography is testable
/// without a real WebRTC stack.
pub trait PeerFactory: Send + Sync {
    fn create(
        &self,
        remote: &str,
        handlers: IceHandlers,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

// ─── PeerLink ───────────────────────────────────────────────────────────────

/// One tracked connection to a remote user, with its candidate buffer.
pub struct PeerLink {
    peer: String,
    conn: Arc<dyn PeerConnection>,
    candidates: Mutex<Vec<IceCandidate>>,
}

impl PeerLink {
    pub fn new(peer: impl Into<String>, conn: Arc<dyn PeerConnection>) -> Self {
        Self {
            peer: peer.into(),
            conn,
            candidates: Mutex::new(Vec::new()),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn conn(&self) -> &Arc<dyn PeerConnection> {
        &self.conn
    }

    pub fn buffer_candidate(&self, candidate: IceCandidate) {
        self.candidates.lock().unwrap().push(candidate);
    }

    /// Apply every buffered candidate in arrival order, draining the
    /// buffer. Stops at the first engine error.
    pub async fn apply_candidates(&self) -> Result<(), PeerError> {
        let pending = std::mem::take(&mut *self.candidates.lock().unwrap());
        for candidate in pending {
            self.conn.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.candidates.lock().unwrap().len()
    }
}

// ─── Connections ────────────────────────────────────────────────────────────

/// Live links keyed by remote user id. Replacing or removing a link
/// closes the engine connection it held.
#[derive(Default)]
pub struct Connections {
    inner: RwLock<HashMap<String, Arc<PeerLink>>>,
}

impl Connections {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, user: &str, link: Arc<PeerLink>) {
        let old = self.inner.write().unwrap().insert(user.to_string(), link);
        if let Some(old) = old {
            old.conn().close().await;
        }
    }

    pub async fn del(&self, user: &str) {
        let old = self.inner.write().unwrap().remove(user);
        if let Some(old) = old {
            old.conn().close().await;
        }
    }

    pub fn get(&self, user: &str) -> Option<Arc<PeerLink>> {
        self.inner.read().unwrap().get(user).cloned()
    }

    pub fn iter(&self, mut visit: impl FnMut(&str, &Arc<PeerLink>)) {
        for (user, link) in self.inner.read().unwrap().iter() {
            visit(user, link);
        }
    }

    pub async fn close_all(&self) {
        let drained = std::mem::take(&mut *self.inner.write().unwrap());
        for link in drained.values() {
            link.conn().close().await;
        }
    }
}

// ─── PeerNode ───────────────────────────────────────────────────────────────

enum Role {
    Offer,
    Answer,
}

type MemberHook = Box<dyn Fn(&str) + Send + Sync>;
type PeerHook = Box<dyn Fn(&str, &Arc<PeerLink>) -> Result<(), PeerError> + Send + Sync>;

/// Signaling node that speaks the peer-connection kinds.
pub struct PeerNode {
    node: Node,
    registry: KindRegistry,
    factory: Arc<dyn PeerFactory>,
    /// Links we answered a `connect` with (we sent the offer).
    pub clients: Connections,
    /// Links we initiated with `connect` (we send the answer).
    pub servers: Connections,
    on_join: Mutex<MemberHook>,
    on_leave: Mutex<MemberHook>,
    on_peer: Mutex<PeerHook>,
}

impl PeerNode {
    pub fn new(
        config: ClientConfig,
        factory: Arc<dyn PeerFactory>,
    ) -> Result<Arc<Self>, SignalingError> {
        Ok(Arc::new(Self {
            node: Node::new(config)?,
            registry: peer_registry(),
            factory,
            clients: Connections::new(),
            servers: Connections::new(),
            on_join: Mutex::new(Box::new(|_| {})),
            on_leave: Mutex::new(Box::new(|_| {})),
            on_peer: Mutex::new(Box::new(|_, _| Ok(()))),
        }))
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn room(&self) -> &str {
        self.node.room()
    }

    pub fn user(&self) -> &str {
        self.node.user()
    }

    /// Called with the member name on every `join` broadcast.
    pub fn set_on_join(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_join.lock().unwrap() = Box::new(hook);
    }

    /// Called with the member name on every `leave` broadcast.
    pub fn set_on_leave(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        *self.on_leave.lock().unwrap() = Box::new(hook);
    }

    /// Called with each inbound link before the offer is created; an error
    /// abandons the link.
    pub fn set_on_peer(
        &self,
        hook: impl Fn(&str, &Arc<PeerLink>) -> Result<(), PeerError> + Send + Sync + 'static,
    ) {
        *self.on_peer.lock().unwrap() = Box::new(hook);
    }

    /// Start the underlying node; this peer node is its dispatcher.
    pub async fn start(self: &Arc<Self>, owner: bool) -> Result<(), SignalingError> {
        let dispatcher: Arc<dyn Dispatcher> = self.clone();
        self.node.start(owner, vec![dispatcher]).await
    }

    pub async fn stop(&self) -> Result<(), SignalingError> {
        self.node.stop().await
    }

    /// Stop the pull loop and close every tracked connection.
    pub async fn close(&self) -> Result<(), SignalingError> {
        let result = self.node.stop().await;
        self.servers.close_all().await;
        self.clients.close_all().await;
        result
    }

    pub async fn members(&self) -> Result<Members, SignalingError> {
        self.node.members().await
    }

    /// Ask `peer` to establish a connection toward us. The returned link is
    /// the answer side and is tracked under `servers`.
    pub async fn connect(&self, peer: &str) -> Result<Arc<PeerLink>, PeerError> {
        let link = self.open_link(peer, Role::Answer)?;
        self.node
            .send(peer, &Connect::default())
            .await
            .map_err(|e| PeerError(e.to_string()))?;
        self.servers.set(peer, link.clone()).await;
        Ok(link)
    }

    // ── Event handling ──────────────────────────────────────────────────

    async fn handle_event(&self, event: &Event) {
        let Some(payload) = self.registry.decode(event) else {
            warn!(kind = %event.kind, from = %event.from, "dropping event of unknown kind");
            return;
        };
        let from = event.from.as_str();

        if let Some(join) = payload.downcast_ref::<Join>() {
            (*self.on_join.lock().unwrap())(&join.member);
        } else if let Some(leave) = payload.downcast_ref::<Leave>() {
            (*self.on_leave.lock().unwrap())(&leave.member);
        } else if payload.downcast_ref::<Connect>().is_some() {
            if let Err(e) = self.handle_connect(from).await {
                warn!(peer = from, error = %e, "connect handling failed");
            }
        } else if let Some(offer) = payload.downcast_ref::<Offer>() {
            if let Err(e) = self.handle_offer(from, &offer.0).await {
                warn!(peer = from, error = %e, "offer handling failed");
            }
        } else if let Some(candidate) = payload.downcast_ref::<OfferCandidate>() {
            if let Some(link) = self.servers.get(from) {
                link.buffer_candidate(candidate.0.clone());
            }
        } else if payload.downcast_ref::<OfferCompleted>().is_some() {
            if let Some(link) = self.servers.get(from) {
                if let Err(e) = link.apply_candidates().await {
                    warn!(peer = from, error = %e, "applying offer candidates failed");
                }
            }
        } else if payload.downcast_ref::<OfferFailed>().is_some() {
            self.servers.del(from).await;
        } else if let Some(answer) = payload.downcast_ref::<Answer>() {
            if let Some(link) = self.clients.get(from) {
                if let Err(e) = link.conn().set_remote_description(answer.0.clone()).await {
                    warn!(peer = from, error = %e, "applying answer failed");
                }
            }
        } else if let Some(candidate) = payload.downcast_ref::<AnswerCandidate>() {
            if let Some(link) = self.clients.get(from) {
                link.buffer_candidate(candidate.0.clone());
            }
        } else if payload.downcast_ref::<AnswerCompleted>().is_some() {
            if let Some(link) = self.clients.get(from) {
                if let Err(e) = link.apply_candidates().await {
                    warn!(peer = from, error = %e, "applying answer candidates failed");
                }
            }
        } else if payload.downcast_ref::<AnswerFailed>().is_some() {
            self.clients.del(from).await;
        }
    }

    /// A remote asked us to connect: open an offer-side link, run the peer
    /// hook, send the offer, and track the link under `clients`.
    async fn handle_connect(&self, from: &str) -> Result<(), PeerError> {
        let link = self.open_link(from, Role::Offer)?;
        (*self.on_peer.lock().unwrap())(from, &link)?;

        let offer = link.conn().create_offer().await?;
        link.conn().set_local_description(offer.clone()).await?;
        self.node
            .send(from, &Offer(offer))
            .await
            .map_err(|e| PeerError(e.to_string()))?;
        self.clients.set(from, link).await;
        debug!(peer = from, "offer sent");
        Ok(())
    }

    /// Our `connect` was answered with an offer: answer it on the tracked
    /// server-side link.
    async fn handle_offer(&self, from: &str, offer: &SessionDescription) -> Result<(), PeerError> {
        let Some(link) = self.servers.get(from) else {
            debug!(peer = from, "offer for unknown link ignored");
            return Ok(());
        };
        link.conn().set_remote_description(offer.clone()).await?;
        let answer = link.conn().create_answer().await?;
        link.conn().set_local_description(answer.clone()).await?;
        self.node
            .send(from, &Answer(answer))
            .await
            .map_err(|e| PeerError(e.to_string()))?;
        debug!(peer = from, "answer sent");
        Ok(())
    }

    /// Create an engine connection whose ICE callbacks send the right kind
    /// triplet for `role` back to `peer`.
    ///
    /// All three callbacks feed one queue drained by a single task, so a
    /// candidate can never arrive after the completion that follows it.
    fn open_link(&self, peer: &str, role: Role) -> Result<Arc<PeerLink>, PeerError> {
        let client = self.node.client().clone();
        let me = self.user().to_string();
        let peer_id = peer.to_string();

        let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                let request = client.request().clone();
                if let Err(e) = client.send(&Message { request, event }).await {
                    warn!(error = %e, "ice signaling send failed");
                }
            }
        });

        let handlers = match role {
            Role::Offer => IceHandlers {
                on_candidate: {
                    let tx = event_tx.clone();
                    let (me, peer_id) = (me.clone(), peer_id.clone());
                    Box::new(move |c| {
                        let _ = tx.send(Event::new(&me, &peer_id, &OfferCandidate(c)));
                    })
                },
                on_gathering_complete: {
                    let tx = event_tx.clone();
                    let (me, peer_id) = (me.clone(), peer_id.clone());
                    Box::new(move || {
                        let _ = tx.send(Event::new(&me, &peer_id, &OfferCompleted::default()));
                    })
                },
                on_error: Box::new(move || {
                    let _ = event_tx.send(Event::new(&me, &peer_id, &OfferFailed::default()));
                }),
            },
            Role::Answer => IceHandlers {
                on_candidate: {
                    let tx = event_tx.clone();
                    let (me, peer_id) = (me.clone(), peer_id.clone());
                    Box::new(move |c| {
                        let _ = tx.send(Event::new(&me, &peer_id, &AnswerCandidate(c)));
                    })
                },
                on_gathering_complete: {
                    let tx = event_tx.clone();
                    let (me, peer_id) = (me.clone(), peer_id.clone());
                    Box::new(move || {
                        let _ = tx.send(Event::new(&me, &peer_id, &AnswerCompleted::default()));
                    })
                },
                on_error: Box::new(move || {
                    let _ = event_tx.send(Event::new(&me, &peer_id, &AnswerFailed::default()));
                }),
            },
        };

        let conn = self.factory.create(peer, handlers)?;
        Ok(Arc::new(PeerLink::new(peer, conn)))
    }
}

#[async_trait]
impl Dispatcher for PeerNode {
    async fn dispatch(&self, events: &[Event]) {
        for event in events {
            self.handle_event(event).await;
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    pub struct MockConnection {
        pub calls: Mutex<Vec<String>>,
        pub closed: std::sync::atomic::AtomicBool,
    }

    impl MockConnection {
        fn record(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    #[async_trait]
    impl PeerConnection for MockConnection {
        async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
            self.record("create_offer");
            Ok(SessionDescription {
                sdp_type: "offer".into(),
                sdp: "v=0 offer".into(),
            })
        }

        async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
            self.record("create_answer");
            Ok(SessionDescription {
                sdp_type: "answer".into(),
                sdp: "v=0 answer".into(),
            })
        }

        async fn set_local_description(
            &self,
            desc: SessionDescription,
        ) -> Result<(), PeerError> {
            self.record(format!("set_local:{}", desc.sdp_type));
            Ok(())
        }

        async fn set_remote_description(
            &self,
            desc: SessionDescription,
        ) -> Result<(), PeerError> {
            self.record(format!("set_remote:{}", desc.sdp_type));
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
            self.record(format!("candidate:{}", candidate.candidate));
            Ok(())
        }

        async fn close(&self) {
            self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate-{n}"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[test]
    fn peer_registry_knows_all_kinds() {
        let registry = peer_registry();
        for kind in [
            "join",
            "leave",
            "connect",
            "offer",
            "answer",
            "offer-candidate",
            "offer-completed",
            "offer-failed",
            "answer-candidate",
            "answer-completed",
            "answer-failed",
        ] {
            assert!(registry.contains(kind), "missing {kind}");
        }
    }

    #[test]
    fn wrapper_kinds_serialize_transparently() {
        let offer = Offer(SessionDescription {
            sdp_type: "offer".into(),
            sdp: "v=0".into(),
        });
        let ev = Event::new("a", "b", &offer);
        assert_eq!(ev.kind, "offer");
        assert_eq!(ev.value["type"], "offer");
        assert_eq!(ev.value["sdp"], "v=0");

        let registry = peer_registry();
        let decoded = registry.decode(&ev).unwrap();
        assert_eq!(decoded.downcast_ref::<Offer>(), Some(&offer));
    }

    #[tokio::test]
    async fn candidates_apply_in_arrival_order_and_drain() {
        let conn = Arc::new(MockConnection::default());
        let link = PeerLink::new("peer", conn.clone() as Arc<dyn PeerConnection>);

        for n in 0..3 {
            link.buffer_candidate(candidate(n));
        }
        assert_eq!(link.buffered(), 3);

        link.apply_candidates().await.unwrap();
        assert_eq!(link.buffered(), 0);
        assert_eq!(
            *conn.calls.lock().unwrap(),
            vec!["candidate:candidate-0", "candidate:candidate-1", "candidate:candidate-2"]
        );
    }

    #[tokio::test]
    async fn unknown_kind_is_skipped_but_batch_still_dispatches() {
        struct NoFactory;
        impl PeerFactory for NoFactory {
            fn create(
                &self,
                _remote: &str,
                _handlers: IceHandlers,
            ) -> Result<Arc<dyn PeerConnection>, PeerError> {
                Err(PeerError("no engine in this test".into()))
            }
        }

        let node = PeerNode::new(
            ClientConfig {
                request: crate::schema::Request::new("lobby", "me", ""),
                url: "ws://127.0.0.1:9/ws".into(),
                ..Default::default()
            },
            Arc::new(NoFactory),
        )
        .unwrap();

        let joined = Arc::new(Mutex::new(Vec::<String>::new()));
        {
            let joined = joined.clone();
            node.set_on_join(move |member| joined.lock().unwrap().push(member.to_string()));
        }

        let batch = vec![
            Event {
                from: "x".into(),
                to: "".into(),
                kind: "mystery".into(),
                value: serde_json::json!({ "Huh": 1 }),
            },
            Event::new("bob", "", &Join { member: "bob".into() }),
        ];
        node.dispatch(&batch).await;

        // The unknown kind is dropped; the join after it still lands.
        assert_eq!(*joined.lock().unwrap(), vec!["bob".to_string()]);
    }

    #[tokio::test]
    async fn replacing_a_link_closes_the_old_connection() {
        let connections = Connections::new();
        let first = Arc::new(MockConnection::default());
        let second = Arc::new(MockConnection::default());

        connections
            .set("bob", Arc::new(PeerLink::new("bob", first.clone() as Arc<dyn PeerConnection>)))
            .await;
        connections
            .set("bob", Arc::new(PeerLink::new("bob", second.clone() as Arc<dyn PeerConnection>)))
            .await;

        assert!(first.closed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!second.closed.load(std::sync::atomic::Ordering::SeqCst));

        connections.del("bob").await;
        assert!(second.closed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(connections.get("bob").is_none());
    }
}
