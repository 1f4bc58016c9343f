//! SignalHub -- rendezvous signaling for P2P session establishment.
//!
//! Peers meet in a named room guarded by a preshared secret and exchange
//! opaque typed events (session descriptions, ICE candidates, anything
//! JSON) either directed at one member or broadcast to the rest of the
//! room. The crate ships both halves:
//!
//! * the server -- room/member registry, long-poll delivery, and a JSON-RPC
//!   1.0 surface reachable over WebSocket or single-shot HTTP POST;
//! * the client -- a re-dialable RPC client, the pull-loop driver
//!   ([`node::Node`]), and the peer-connection choreography
//!   ([`peer::PeerNode`]) with the WebRTC engine abstracted behind a trait.

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod jsonrpc;
pub mod member;
pub mod node;
pub mod peer;
pub mod room;
pub mod schema;
pub mod server;
pub mod service;
