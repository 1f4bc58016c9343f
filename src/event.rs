// src/event.rs
//
// The on-wire event envelope and the kind registry.
//
// Every message peers exchange travels as an `Event`: a `from`/`to` address
// pair, a `kind` tag, and an opaque JSON `value` whose shape is defined by
// the kind. The registry maps kind tags to decoders so receivers can turn
// the opaque blob back into a typed payload; unknown kinds decode to `None`
// and are dropped by the dispatcher, never failing the surrounding batch.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

// ─── Kinded payloads ────────────────────────────────────────────────────────

/// A payload type carried inside an [`Event`], identified by a kind tag.
///
/// The tag is a compile-time constant so `Event::new` cannot disagree with
/// the registry about which string a type serializes under.
pub trait Kinded:
    Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static
{
    const KIND: &'static str;
}

// ─── Event envelope ─────────────────────────────────────────────────────────

/// Tagged message routed through a room.
///
/// `to == ""` broadcasts to every member except `from`. The `value` field is
/// a self-describing JSON document so new kinds can be added without touching
/// the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub from: String,
    pub to: String,
    pub kind: String,
    pub value: Value,
}

impl Event {
    /// Wrap `payload` in an envelope addressed from `from` to `to`.
    pub fn new<T: Kinded>(from: &str, to: &str, payload: &T) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            kind: T::KIND.to_string(),
            // Struct payloads cannot fail to serialize; a pathological one
            // degrades to `null` and is dropped at decode time.
            value: serde_json::to_value(payload).unwrap_or(Value::Null),
        }
    }

    /// `true` when the envelope is addressed to the whole room.
    pub fn is_broadcast(&self) -> bool {
        self.to.is_empty()
    }
}

// ─── Kind registry ──────────────────────────────────────────────────────────

/// A decoded payload, downcast by the dispatcher to its concrete type.
pub type DecodedPayload = Box<dyn Any + Send + Sync>;

type DecodeFn = fn(Value) -> Option<DecodedPayload>;

fn decode_into<T: Kinded>(value: Value) -> Option<DecodedPayload> {
    serde_json::from_value::<T>(value)
        .ok()
        .map(|payload| Box::new(payload) as DecodedPayload)
}

/// Builder for a [`KindRegistry`]. Registrations for the same kind overwrite
/// earlier ones; the finished registry is immutable.
#[derive(Default)]
pub struct KindRegistryBuilder {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl KindRegistryBuilder {
    /// Install the decoder for `T` under `T::KIND`.
    pub fn register<T: Kinded>(mut self) -> Self {
        debug!(kind = T::KIND, "event kind registered");
        self.decoders.insert(T::KIND, decode_into::<T>);
        self
    }

    pub fn build(self) -> KindRegistry {
        KindRegistry {
            decoders: Arc::new(self.decoders),
        }
    }
}

/// Immutable table from kind tag to decoder, built once at startup and
/// handed to whoever dispatches events. Cheap to clone (interior `Arc`).
#[derive(Clone)]
pub struct KindRegistry {
    decoders: Arc<HashMap<&'static str, DecodeFn>>,
}

impl KindRegistry {
    pub fn builder() -> KindRegistryBuilder {
        KindRegistryBuilder::default()
    }

    /// Registry with the built-in membership kinds (`join`, `leave`).
    pub fn standard() -> Self {
        Self::builder().register::<Join>().register::<Leave>().build()
    }

    /// Decode the envelope's value into its registered payload type.
    ///
    /// Returns `None` when the kind is unknown or the value does not match
    /// the kind's schema; the caller logs and drops the event.
    pub fn decode(&self, event: &Event) -> Option<DecodedPayload> {
        let decode = self.decoders.get(event.kind.as_str())?;
        decode(event.value.clone())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.decoders.contains_key(kind)
    }
}

// ─── Built-in kinds ─────────────────────────────────────────────────────────

/// Broadcast when a member enters the room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Join {
    #[serde(rename = "Member")]
    pub member: String,
}

impl Kinded for Join {
    const KIND: &'static str = "join";
}

/// Broadcast when a member leaves the room (explicitly or by eviction).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leave {
    #[serde(rename = "Member")]
    pub member: String,
}

impl Kinded for Leave {
    const KIND: &'static str = "leave";
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Text {
        #[serde(rename = "Message")]
        message: String,
    }

    impl Kinded for Text {
        const KIND: &'static str = "text";
    }

    #[test]
    fn envelope_wire_shape() {
        let ev = Event::new("alice", "", &Join { member: "alice".into() });
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["from"], "alice");
        assert_eq!(json["to"], "");
        assert_eq!(json["kind"], "join");
        assert_eq!(json["value"]["Member"], "alice");
    }

    #[test]
    fn roundtrip_every_registered_kind() {
        let registry = KindRegistry::standard();

        let join = Join { member: "bob".into() };
        let decoded = registry.decode(&Event::new("a", "", &join)).unwrap();
        assert_eq!(decoded.downcast_ref::<Join>(), Some(&join));

        let leave = Leave { member: "bob".into() };
        let decoded = registry.decode(&Event::new("a", "", &leave)).unwrap();
        assert_eq!(decoded.downcast_ref::<Leave>(), Some(&leave));
    }

    #[test]
    fn unknown_kind_decodes_to_none() {
        let registry = KindRegistry::standard();
        let ev = Event::new("a", "b", &Text { message: "hi".into() });
        assert!(registry.decode(&ev).is_none());
    }

    #[test]
    fn malformed_value_decodes_to_none() {
        let registry = KindRegistry::standard();
        let ev = Event {
            from: "a".into(),
            to: "".into(),
            kind: "join".into(),
            value: serde_json::json!(["not", "an", "object"]),
        };
        assert!(registry.decode(&ev).is_none());
    }

    #[test]
    fn later_registration_overwrites() {
        #[derive(Debug, Serialize, Deserialize)]
        struct JoinV2 {
            #[serde(rename = "Member")]
            member: String,
            #[serde(rename = "Seq", default)]
            seq: u64,
        }
        impl Kinded for JoinV2 {
            const KIND: &'static str = "join";
        }

        let registry = KindRegistry::builder()
            .register::<Join>()
            .register::<JoinV2>()
            .build();

        let ev = Event::new("a", "", &Join { member: "x".into() });
        let decoded = registry.decode(&ev).unwrap();
        assert!(decoded.downcast_ref::<JoinV2>().is_some());
        assert!(decoded.downcast_ref::<Join>().is_none());
    }

    #[test]
    fn broadcast_detection() {
        let ev = Event::new("a", "", &Join { member: "a".into() });
        assert!(ev.is_broadcast());
        let ev = Event::new("a", "b", &Join { member: "a".into() });
        assert!(!ev.is_broadcast());
    }
}
