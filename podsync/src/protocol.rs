//! Binary protocol for pod state synchronization.
//!
//! Wire format (bincode-encoded, one frame per WebSocket binary message):
//! ```text
//! client → server                      server → client
//! ┌─────────────────────────┐          ┌──────────────────────────────┐
//! │ RequestEnvelope         │          │ ServerMessage                │
//! │  request_id   8 bytes   │          │  Reply { request_id, result }│
//! │  session     16 bytes   │          │  Event { origin, event }     │
//! │  op          tagged     │          │  Pong                        │
//! └─────────────────────────┘          └──────────────────────────────┘
//! ```
//!
//! Events carry the **full updated entity**, never a delta, so applying one
//! twice (direct response + broadcast) leaves state unchanged. The event set
//! is closed: unknown kinds fail decode rather than half-apply.
//!
//! Performance target: encode < 1µs for a typical item event.
//! Reference: Kleppmann, Chapter 4 — Encoding and Evolution

use crate::model::{Item, Member, MemberProfile, Pod};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Change events
// ───────────────────────────────────────────────────────────────────

/// State change notification fanned out to every session attached to a pod.
///
/// `PodCreated` and `InviteShared` are advisory: they inform, but merge to
/// a no-op. Pod deletion deliberately has no event; survivors converge via
/// re-fetch after their channel closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ChangeEvent {
    PodCreated { pod_id: Uuid, name: String },
    MemberJoined { pod_id: Uuid, member: Member },
    ItemAdded { pod_id: Uuid, item: Item },
    ItemUpdated { pod_id: Uuid, item: Item },
    ItemRemoved { pod_id: Uuid, item_id: Uuid },
    InviteShared { pod_id: Uuid, invite_code: String, shared_by: Uuid },
}

impl ChangeEvent {
    /// Pod this event belongs to.
    pub fn pod_id(&self) -> Uuid {
        match self {
            Self::PodCreated { pod_id, .. }
            | Self::MemberJoined { pod_id, .. }
            | Self::ItemAdded { pod_id, .. }
            | Self::ItemUpdated { pod_id, .. }
            | Self::ItemRemoved { pod_id, .. }
            | Self::InviteShared { pod_id, .. } => *pod_id,
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PodCreated { .. } => "pod_created",
            Self::MemberJoined { .. } => "member_joined",
            Self::ItemAdded { .. } => "item_added",
            Self::ItemUpdated { .. } => "item_updated",
            Self::ItemRemoved { .. } => "item_removed",
            Self::InviteShared { .. } => "invite_shared",
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Requests
// ───────────────────────────────────────────────────────────────────

/// Commands a client can issue. Item ids are resolved server-side; clients
/// never mint entity ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Switch this session's live subscription to `pod_id`.
    Attach { member_id: Uuid, pod_id: Uuid },
    CreatePod { name: String, owner: MemberProfile },
    JoinPod { invite_code: String, member: MemberProfile },
    AddItem {
        pod_id: Uuid,
        product_id: String,
        name: String,
        price: f64,
        added_by: MemberProfile,
    },
    /// `new_quantity` ≤ 0 is the delete signal, hence signed.
    SetItemQuantity { item_id: Uuid, new_quantity: i32 },
    RemoveItem { item_id: Uuid },
    DeletePod { pod_id: Uuid, requester_id: Uuid },
    ListPods { member_id: Uuid },
    FetchPod { pod_id: Uuid },
    ShareInvite { pod_id: Uuid, shared_by: Uuid },
    /// Heartbeat; answered with `ServerMessage::Pong`.
    Ping,
}

impl Operation {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Attach { .. } => "attach",
            Self::CreatePod { .. } => "create_pod",
            Self::JoinPod { .. } => "join_pod",
            Self::AddItem { .. } => "add_item",
            Self::SetItemQuantity { .. } => "set_item_quantity",
            Self::RemoveItem { .. } => "remove_item",
            Self::DeletePod { .. } => "delete_pod",
            Self::ListPods { .. } => "list_pods",
            Self::FetchPod { .. } => "fetch_pod",
            Self::ShareInvite { .. } => "share_invite",
            Self::Ping => "ping",
        }
    }
}

/// One client request. `request_id` is a per-connection counter used to
/// correlate the reply; `session` identifies the connection (client-minted
/// v4 UUID, carried as the origin on resulting events).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub request_id: u64,
    pub session: Uuid,
    pub op: Operation,
}

impl RequestEnvelope {
    pub fn new(request_id: u64, session: Uuid, op: Operation) -> Self {
        Self { request_id, session, op }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (req, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(req)
    }
}

// ───────────────────────────────────────────────────────────────────
// Responses
// ───────────────────────────────────────────────────────────────────

/// Canonical result of a successful operation. Write replies carry the full
/// post-commit entity, so the client merges the reply exactly like the
/// broadcast event for the same write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Pod(Pod),
    Pods(Vec<Pod>),
    Item { pod_id: Uuid, item: Item },
    Removed { pod_id: Uuid, item_id: Uuid },
    /// Attach acknowledgement with the subscribed pod's current snapshot.
    Attached { pod: Pod },
    Ack,
}

/// Operation failure, as carried on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WireError {
    Validation(String),
    NotFound(String),
    Permission(String),
    Internal(String),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "Validation error: {msg}"),
            Self::NotFound(msg) => write!(f, "Not found: {msg}"),
            Self::Permission(msg) => write!(f, "Permission denied: {msg}"),
            Self::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for WireError {}

/// Top-level server → client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Direct answer to one `RequestEnvelope`.
    Reply {
        request_id: u64,
        result: Result<Reply, WireError>,
    },
    /// Broadcast change, `origin` = session that caused it (nil when the
    /// write came from outside any session). Receivers skip their own origin;
    /// merging anyway would still be safe.
    Event { origin: Uuid, event: ChangeEvent },
    Pong,
}

impl ServerMessage {
    pub fn reply(request_id: u64, result: Result<Reply, WireError>) -> Self {
        Self::Reply { request_id, result }
    }

    pub fn event(origin: Uuid, event: ChangeEvent) -> Self {
        Self::Event { origin, event }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MemberRef;

    fn profile(name: &str) -> MemberProfile {
        MemberProfile::new(Uuid::new_v4(), name.to_string(), format!("{name}.png"))
    }

    fn sample_item(by: &MemberProfile) -> Item {
        Item::new(
            "sku-7".to_string(),
            "Bread".to_string(),
            3.25,
            MemberRef::from_profile(by),
        )
    }

    #[test]
    fn test_add_item_request_roundtrip() {
        let session = Uuid::new_v4();
        let pod = Uuid::new_v4();
        let req = RequestEnvelope::new(
            9,
            session,
            Operation::AddItem {
                pod_id: pod,
                product_id: "sku-7".to_string(),
                name: "Bread".to_string(),
                price: 3.25,
                added_by: profile("ava"),
            },
        );

        let bytes = req.encode().unwrap();
        let decoded = RequestEnvelope::decode(&bytes).unwrap();

        assert_eq!(decoded.request_id, 9);
        assert_eq!(decoded.session, session);
        assert_eq!(decoded, req);
        assert_eq!(decoded.op.kind(), "add_item");
    }

    #[test]
    fn test_set_quantity_keeps_sign() {
        let req = RequestEnvelope::new(
            1,
            Uuid::new_v4(),
            Operation::SetItemQuantity {
                item_id: Uuid::new_v4(),
                new_quantity: -3,
            },
        );

        let decoded = RequestEnvelope::decode(&req.encode().unwrap()).unwrap();
        match decoded.op {
            Operation::SetItemQuantity { new_quantity, .. } => assert_eq!(new_quantity, -3),
            other => panic!("wrong op: {other:?}"),
        }
    }

    #[test]
    fn test_attach_roundtrip() {
        let req = RequestEnvelope::new(
            2,
            Uuid::new_v4(),
            Operation::Attach {
                member_id: Uuid::new_v4(),
                pod_id: Uuid::new_v4(),
            },
        );
        let decoded = RequestEnvelope::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_reply_pod_roundtrip() {
        let owner = profile("ben");
        let pod = Pod::new("Groceries".to_string(), &owner, "AB12CD".to_string());
        let msg = ServerMessage::reply(4, Ok(Reply::Pod(pod.clone())));

        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            ServerMessage::Reply { request_id, result } => {
                assert_eq!(request_id, 4);
                assert_eq!(result, Ok(Reply::Pod(pod)));
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn test_reply_error_roundtrip() {
        let msg = ServerMessage::reply(8, Err(WireError::NotFound("pod".to_string())));
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            ServerMessage::Reply { result, .. } => {
                assert_eq!(result, Err(WireError::NotFound("pod".to_string())));
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn test_item_added_event_roundtrip() {
        let by = profile("cal");
        let item = sample_item(&by);
        let pod_id = Uuid::new_v4();
        let origin = Uuid::new_v4();

        let msg = ServerMessage::event(origin, ChangeEvent::ItemAdded { pod_id, item: item.clone() });
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();

        match decoded {
            ServerMessage::Event { origin: o, event } => {
                assert_eq!(o, origin);
                assert_eq!(event.pod_id(), pod_id);
                assert_eq!(event, ChangeEvent::ItemAdded { pod_id, item });
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn test_member_joined_event_roundtrip() {
        let member = Member::from_profile(&profile("dee"), false);
        let pod_id = Uuid::new_v4();
        let msg = ServerMessage::event(
            Uuid::nil(),
            ChangeEvent::MemberJoined { pod_id, member: member.clone() },
        );

        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        match decoded {
            ServerMessage::Event { origin, event } => {
                assert_eq!(origin, Uuid::nil());
                assert_eq!(event, ChangeEvent::MemberJoined { pod_id, member });
            }
            other => panic!("wrong frame: {other:?}"),
        }
    }

    #[test]
    fn test_event_pod_id_accessor() {
        let pod_id = Uuid::new_v4();
        let events = [
            ChangeEvent::PodCreated { pod_id, name: "x".to_string() },
            ChangeEvent::ItemRemoved { pod_id, item_id: Uuid::new_v4() },
            ChangeEvent::InviteShared {
                pod_id,
                invite_code: "AB12CD".to_string(),
                shared_by: Uuid::new_v4(),
            },
        ];
        for ev in events {
            assert_eq!(ev.pod_id(), pod_id);
        }
    }

    #[test]
    fn test_ping_pong_roundtrip() {
        let req = RequestEnvelope::new(0, Uuid::new_v4(), Operation::Ping);
        let decoded = RequestEnvelope::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded.op, Operation::Ping);

        let pong = ServerMessage::Pong;
        let decoded = ServerMessage::decode(&pong.encode().unwrap()).unwrap();
        assert_eq!(decoded, ServerMessage::Pong);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(RequestEnvelope::decode(&garbage).is_err());
        assert!(ServerMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_event_size_efficient() {
        let by = profile("eli");
        let msg = ServerMessage::event(
            Uuid::new_v4(),
            ChangeEvent::ItemAdded {
                pod_id: Uuid::new_v4(),
                item: sample_item(&by),
            },
        );
        let bytes = msg.encode().unwrap();
        // Tag + origin (16) + pod (16) + item (~90 with strings): must stay
        // comfortably inside one network read.
        assert!(bytes.len() < 300, "Encoded size {} too large", bytes.len());
    }

    #[test]
    fn test_wire_error_display() {
        let err = WireError::Permission("only the owner can delete".to_string());
        assert_eq!(err.to_string(), "Permission denied: only the owner can delete");
    }
}
