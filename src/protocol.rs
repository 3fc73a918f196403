//! JSON wire protocol for the collaboration service.
//!
//! Every frame is a text envelope:
//! ```text
//! { "type": "...", "payload": { ... }, "timestamp": 1733776000000 }
//! ```
//!
//! | type (client → server) | payload                                   |
//! |------------------------|-------------------------------------------|
//! | `auth`                 | `{ token, documentId }`                   |
//! | `sync`                 | `{ update: [u8...] }`                     |
//! | `awareness`            | `{ update: [u8...], states: [[key, s]] }` |
//!
//! | type (server → client) | payload                                   |
//! |------------------------|-------------------------------------------|
//! | `auth_success`         | `{ documentId, permissionLevel, user, initialState }` |
//! | `sync_update`          | bare `[u8...]` update bytes               |
//! | `awareness_update`     | bare `[[key, state], ...]` entries        |
//! | `permission_revoked`   | `{ message }`, followed by a forced close |
//! | `error`                | `{ code, message }`                       |
//!
//! Document updates travel as JSON number arrays; the service never
//! interprets them beyond handing them to the CRDT merge primitives.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::SystemTime;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::auth::UserInfo;
use crate::error::{CollabError, ErrorCode};
use crate::permissions::PermissionLevel;

/// Close codes, distinct per cause so clients can branch behavior
/// (redirect on revocation, back off on rate limit, retry on load failure).
pub mod close_code {
    /// Token invalid, expired, or auth payload unusable
    pub const UNAUTHORIZED: u16 = 4401;
    /// Authentication deadline elapsed without a successful `auth`
    pub const AUTH_TIMEOUT: u16 = 4402;
    /// Authenticated but no read access to the document
    pub const FORBIDDEN: u16 = 4403;
    /// Persisted document state could not be loaded
    pub const LOAD_FAILED: u16 = 4404;
    /// Per-user concurrent connection cap exceeded
    pub const RATE_LIMITED: u16 = 4408;
    /// Access revoked mid-session
    pub const PERMISSION_REVOKED: u16 = 4410;
}

/// Message discriminator. Unrecognized strings decode to [`MessageKind::Unknown`]
/// so the handler can answer with a protocol error instead of dropping the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Auth,
    AuthSuccess,
    Sync,
    SyncUpdate,
    Awareness,
    AwarenessUpdate,
    PermissionRevoked,
    Error,
    Unknown,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Auth => "auth",
            MessageKind::AuthSuccess => "auth_success",
            MessageKind::Sync => "sync",
            MessageKind::SyncUpdate => "sync_update",
            MessageKind::Awareness => "awareness",
            MessageKind::AwarenessUpdate => "awareness_update",
            MessageKind::PermissionRevoked => "permission_revoked",
            MessageKind::Error => "error",
            MessageKind::Unknown => "unknown",
        }
    }

    fn from_wire(s: &str) -> Self {
        match s {
            "auth" => MessageKind::Auth,
            "auth_success" => MessageKind::AuthSuccess,
            "sync" => MessageKind::Sync,
            "sync_update" => MessageKind::SyncUpdate,
            "awareness" => MessageKind::Awareness,
            "awareness_update" => MessageKind::AwarenessUpdate,
            "permission_revoked" => MessageKind::PermissionRevoked,
            "error" => MessageKind::Error,
            _ => MessageKind::Unknown,
        }
    }
}

impl Serialize for MessageKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(MessageKind::from_wire(&raw))
    }
}

/// Top-level wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: u64,
}

/// `auth` payload (client → server).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub token: String,
    pub document_id: String,
}

/// `auth_success` payload (server → client).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSuccessPayload {
    pub document_id: String,
    pub permission_level: PermissionLevel,
    pub user: UserInfo,
    pub initial_state: Vec<u8>,
}

/// `sync` payload (client → server).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncPayload {
    pub update: Vec<u8>,
}

/// `awareness` payload (client → server).
///
/// `update` carries the client's opaque awareness bytes and is not
/// interpreted; `states` carries the changed presence records. The key a
/// client claims for itself is ignored — the server always files the state
/// under the connection's own ephemeral key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwarenessPayload {
    #[serde(default)]
    pub update: Vec<u8>,
    #[serde(default)]
    pub states: Vec<(u32, Value)>,
}

/// `error` payload (server → client).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

/// `permission_revoked` payload (server → client).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokedPayload {
    pub message: String,
}

/// Milliseconds since the Unix epoch, the envelope timestamp unit.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl Envelope {
    fn new(kind: MessageKind, payload: Value) -> Self {
        Self { kind, payload, timestamp: now_millis() }
    }

    /// Create an `auth` request (client side; used by tests and embedders).
    pub fn auth(token: impl Into<String>, document_id: impl Into<String>) -> Self {
        let payload = AuthPayload { token: token.into(), document_id: document_id.into() };
        Self::new(MessageKind::Auth, serde_json::to_value(payload).unwrap_or(Value::Null))
    }

    /// Create an `auth_success` reply carrying the full encoded document state.
    pub fn auth_success(
        document_id: impl Into<String>,
        permission_level: PermissionLevel,
        user: &UserInfo,
        initial_state: Vec<u8>,
    ) -> Self {
        let payload = AuthSuccessPayload {
            document_id: document_id.into(),
            permission_level,
            user: user.clone(),
            initial_state,
        };
        Self::new(MessageKind::AuthSuccess, serde_json::to_value(payload).unwrap_or(Value::Null))
    }

    /// Create a `sync` request (client side).
    pub fn sync(update: Vec<u8>) -> Self {
        let payload = SyncPayload { update };
        Self::new(MessageKind::Sync, serde_json::to_value(payload).unwrap_or(Value::Null))
    }

    /// Create a `sync_update` fan-out frame. The payload is the bare byte array.
    pub fn sync_update(update: &[u8]) -> Self {
        Self::new(MessageKind::SyncUpdate, serde_json::to_value(update).unwrap_or(Value::Null))
    }

    /// Create an `awareness` request (client side).
    pub fn awareness(update: Vec<u8>, states: Vec<(u32, Value)>) -> Self {
        let payload = AwarenessPayload { update, states };
        Self::new(MessageKind::Awareness, serde_json::to_value(payload).unwrap_or(Value::Null))
    }

    /// Create an `awareness_update` fan-out frame with the changed-entries set.
    /// A `null` state means the entry was removed (its connection went away).
    pub fn awareness_update(entries: &[(u32, Value)]) -> Self {
        Self::new(
            MessageKind::AwarenessUpdate,
            serde_json::to_value(entries).unwrap_or(Value::Null),
        )
    }

    /// Create a `permission_revoked` notice, sent before the forced close.
    pub fn permission_revoked(message: impl Into<String>) -> Self {
        let payload = RevokedPayload { message: message.into() };
        Self::new(MessageKind::PermissionRevoked, serde_json::to_value(payload).unwrap_or(Value::Null))
    }

    /// Create an `error` frame from a service error.
    pub fn error(err: &CollabError) -> Self {
        let payload = ErrorPayload { code: err.code, message: err.message.clone() };
        Self::new(MessageKind::Error, serde_json::to_value(payload).unwrap_or(Value::Null))
    }

    /// Serialize to the JSON wire text.
    pub fn encode(&self) -> Result<String, CollabError> {
        serde_json::to_string(self)
            .map_err(|e| CollabError::server_error(format!("failed to encode message: {e}")))
    }

    /// Deserialize from JSON wire text.
    pub fn decode(text: &str) -> Result<Self, CollabError> {
        serde_json::from_str(text)
            .map_err(|e| CollabError::server_error(format!("malformed message: {e}")))
    }

    /// Extract the payload as a typed structure.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, CollabError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| CollabError::server_error(format!("invalid payload: {e}")))
    }

    /// Serialize into a WebSocket text frame.
    pub fn to_message(&self) -> Result<Message, CollabError> {
        Ok(Message::Text(self.encode()?.into()))
    }
}

/// Build a close frame with one of the [`close_code`] constants.
pub fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_owned().into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_roundtrip() {
        let env = Envelope::auth("secret-token-123", "doc-1");
        let text = env.encode().unwrap();
        let decoded = Envelope::decode(&text).unwrap();
        assert_eq!(decoded.kind, MessageKind::Auth);
        let payload: AuthPayload = decoded.payload_as().unwrap();
        assert_eq!(payload.token, "secret-token-123");
        assert_eq!(payload.document_id, "doc-1");
    }

    #[test]
    fn test_auth_payload_wire_field_names() {
        let env = Envelope::auth("t0ken-abcdef", "doc-1");
        let text = env.encode().unwrap();
        assert!(text.contains("\"documentId\""), "camelCase field expected: {text}");
        assert!(text.contains("\"type\":\"auth\""), "snake_case type expected: {text}");
    }

    #[test]
    fn test_sync_update_payload_is_bare_array() {
        let env = Envelope::sync_update(&[1, 2, 3]);
        let text = env.encode().unwrap();
        let raw: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(raw["payload"], serde_json::json!([1, 2, 3]));
    }

    #[test]
    fn test_awareness_update_entries() {
        let entries = vec![
            (7u32, serde_json::json!({"user": {"name": "Alice"}})),
            (9u32, Value::Null),
        ];
        let env = Envelope::awareness_update(&entries);
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        let back: Vec<(u32, Value)> = serde_json::from_value(decoded.payload).unwrap();
        assert_eq!(back.len(), 2);
        assert_eq!(back[0].0, 7);
        assert!(back[1].1.is_null());
    }

    #[test]
    fn test_error_roundtrip() {
        let err = CollabError::forbidden("Viewers cannot edit documents");
        let env = Envelope::error(&err);
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded.kind, MessageKind::Error);
        let payload: ErrorPayload = decoded.payload_as().unwrap();
        assert_eq!(payload.code, ErrorCode::Forbidden);
        assert_eq!(payload.message, "Viewers cannot edit documents");
    }

    #[test]
    fn test_message_kind_wire_roundtrip() {
        for kind in [
            MessageKind::Auth,
            MessageKind::AuthSuccess,
            MessageKind::Sync,
            MessageKind::SyncUpdate,
            MessageKind::Awareness,
            MessageKind::AwarenessUpdate,
            MessageKind::PermissionRevoked,
            MessageKind::Error,
        ] {
            assert_eq!(MessageKind::from_wire(kind.as_str()), kind);
        }
    }

    #[test]
    fn test_unknown_type_decodes() {
        let decoded = Envelope::decode(r#"{"type":"subscribe","payload":{},"timestamp":0}"#).unwrap();
        assert_eq!(decoded.kind, MessageKind::Unknown);
    }

    #[test]
    fn test_missing_payload_defaults_to_null() {
        let decoded = Envelope::decode(r#"{"type":"sync"}"#).unwrap();
        assert_eq!(decoded.kind, MessageKind::Sync);
        assert!(decoded.payload.is_null());
        assert!(decoded.payload_as::<SyncPayload>().is_err());
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode(r#"{"payload":{}}"#).is_err());
    }

    #[test]
    fn test_sync_payload_rejects_out_of_range_bytes() {
        let decoded =
            Envelope::decode(r#"{"type":"sync","payload":{"update":[1,999]},"timestamp":0}"#)
                .unwrap();
        assert!(decoded.payload_as::<SyncPayload>().is_err());
    }

    #[test]
    fn test_close_codes_are_distinct() {
        let codes = [
            close_code::UNAUTHORIZED,
            close_code::AUTH_TIMEOUT,
            close_code::FORBIDDEN,
            close_code::LOAD_FAILED,
            close_code::RATE_LIMITED,
            close_code::PERMISSION_REVOKED,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in codes.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_close_message_carries_code() {
        let msg = close_message(close_code::RATE_LIMITED, "Rate limited");
        match msg {
            Message::Close(Some(frame)) => {
                assert_eq!(u16::from(frame.code), close_code::RATE_LIMITED);
                assert_eq!(frame.reason.as_str(), "Rate limited");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[test]
    fn test_timestamp_set_on_construction() {
        let env = Envelope::sync(vec![1]);
        assert!(env.timestamp > 0);
    }
}
