use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identifier of one running hub instance (a "pod")
///
/// Generated once per hub, never persisted. Tags every relayed envelope so
/// an instance can recognise its own messages coming back from the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub const fn from_string(id: String) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one registered connection, unique for the hub's lifetime
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Sender id used for messages the server itself originates
    #[must_use]
    pub fn system() -> Self {
        Self("system".to_string())
    }

    #[must_use]
    pub const fn from_string(id: String) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Session directory key for this session
    #[must_use]
    pub fn directory_key(&self) -> String {
        format!("session:{}", self.0)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unit of relayed data
///
/// Wire format on the broker channel:
/// `{"pod_id": "...", "data": "<base64>", "timestamp": "<RFC3339>", "session_id": "..."}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub pod_id: InstanceId,
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
    pub timestamp: DateTime<Utc>,
    pub session_id: SessionId,
}

impl Envelope {
    /// Create an envelope stamped with the current time
    pub fn new(pod_id: InstanceId, session_id: SessionId, data: impl Into<Bytes>) -> Self {
        Self {
            pod_id,
            data: data.into(),
            timestamp: Utc::now(),
            session_id,
        }
    }

    /// Whether this envelope originated on the given instance
    #[must_use]
    pub fn is_from(&self, instance: &InstanceId) -> bool {
        self.pod_id == *instance
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(payload: &str) -> Result<Self> {
        Ok(serde_json::from_str(payload)?)
    }
}

/// Payload bytes travel as standard base64 inside the JSON envelope
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

/// Server-originated notifications pushed by collaborators (e.g. when an
/// invitation is created). Delivered to clients as tagged JSON text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// A user was invited to join a group
    GroupInvite {
        invitee_id: u64,
        inviter: String,
        group_name: String,
        invite_id: u64,
        timestamp: DateTime<Utc>,
    },

    /// Free-form system notice
    System {
        message: String,
        level: NotificationLevel,
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

impl Notification {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::GroupInvite { .. } => "group_invite",
            Self::System { .. } => "system",
        }
    }

    /// JSON text sent to the client
    pub fn to_payload(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_format() {
        let envelope = Envelope::new(
            InstanceId::from_string("pod-a".to_string()),
            SessionId::from_string("sess-1".to_string()),
            Bytes::from_static(b"hello"),
        );

        let json = envelope.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["pod_id"], "pod-a");
        assert_eq!(value["session_id"], "sess-1");
        // "hello" in standard base64
        assert_eq!(value["data"], "aGVsbG8=");
        let timestamp = value["timestamp"].as_str().unwrap();
        assert!(DateTime::parse_from_rfc3339(timestamp).is_ok());

        let decoded = Envelope::from_json(&json).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_envelope_accepts_foreign_payload() {
        let json = r#"{"pod_id":"other","data":"eyJ4IjoxfQ==","timestamp":"2024-05-01T12:30:00.123456789+02:00","session_id":"abc"}"#;
        let envelope = Envelope::from_json(json).unwrap();

        assert_eq!(envelope.pod_id.as_str(), "other");
        assert_eq!(&envelope.data[..], br#"{"x":1}"#);
        assert_eq!(envelope.session_id.as_str(), "abc");
    }

    #[test]
    fn test_malformed_envelopes_are_rejected() {
        assert!(Envelope::from_json("not json").is_err());
        assert!(Envelope::from_json(r#"{"pod_id":"a"}"#).is_err());
        let bad_base64 = r#"{"pod_id":"a","data":"***","timestamp":"2024-05-01T12:30:00Z","session_id":"s"}"#;
        assert!(Envelope::from_json(bad_base64).is_err());
    }

    #[test]
    fn test_is_from() {
        let me = InstanceId::new();
        let envelope = Envelope::new(me.clone(), SessionId::new(), "x");
        assert!(envelope.is_from(&me));
        assert!(!envelope.is_from(&InstanceId::new()));
    }

    #[test]
    fn test_session_directory_key() {
        let session = SessionId::from_string("42".to_string());
        assert_eq!(session.directory_key(), "session:42");
    }

    #[test]
    fn test_notification_payload() {
        let notification = Notification::GroupInvite {
            invitee_id: 7,
            inviter: "alice".to_string(),
            group_name: "chess club".to_string(),
            invite_id: 99,
            timestamp: Utc::now(),
        };

        assert_eq!(notification.event_type(), "group_invite");
        let payload = notification.to_payload().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["type"], "group_invite");
        assert_eq!(value["inviter"], "alice");
        assert_eq!(value["invite_id"], 99);
    }
}
