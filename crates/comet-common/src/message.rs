// Push message model shared by channels, the offline store and transports.
use crate::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Delivery scope of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageGroup {
    /// Addressed to one subscriber; persisted by the offline store.
    #[default]
    Private,
    /// Broadcast-style; ids are caller supplied and never persisted per key.
    Public,
}

impl MessageGroup {
    pub fn code(self) -> u8 {
        match self {
            MessageGroup::Private => 0,
            MessageGroup::Public => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(MessageGroup::Private),
            1 => Some(MessageGroup::Public),
            _ => None,
        }
    }
}

/// Immutable push message.
///
/// `expire` is an absolute deadline in unix nanoseconds.
///
/// ```
/// use bytes::Bytes;
/// use comet_common::{Message, MessageGroup};
///
/// let message = Message::new(7, Bytes::from_static(b"hi"), MessageGroup::Private, i64::MAX);
/// assert!(!message.is_expired(0));
/// let payload = message.encode_push().expect("encode");
/// let decoded = comet_common::message::PushPayload::decode(&payload).expect("decode");
/// assert_eq!(decoded.mid, 7);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    #[serde(with = "base64_bytes")]
    pub body: Bytes,
    #[serde(default)]
    pub group: MessageGroup,
    pub expire: i64,
}

impl Message {
    pub fn new(id: i64, body: Bytes, group: MessageGroup, expire: i64) -> Self {
        Self {
            id,
            body,
            group,
            expire,
        }
    }

    pub fn is_expired(&self, now_nanos: i64) -> bool {
        self.expire <= now_nanos
    }

    /// Copy of this message carrying a different id.
    pub fn with_id(&self, id: i64) -> Self {
        Self {
            id,
            ..self.clone()
        }
    }

    /// Client-facing JSON payload, encoded once per push and shared by all connections.
    pub fn encode_push(&self) -> Result<Bytes> {
        let payload = PushPayload {
            msg: self.body.clone(),
            mid: self.id,
            gid: self.group.code(),
        };
        serde_json::to_vec(&payload)
            .map(Bytes::from)
            .map_err(Error::Encode)
    }
}

/// Wire shape of a pushed message as seen by clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(with = "base64_bytes")]
    pub msg: Bytes,
    pub mid: i64,
    pub gid: u8,
}

impl PushPayload {
    pub fn decode(input: &[u8]) -> Result<Self> {
        serde_json::from_slice(input).map_err(Error::Decode)
    }
}

pub mod base64_bytes {
    use base64::Engine;
    use bytes::Bytes;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    // Encode Bytes as base64 string for JSON payloads.
    pub fn serialize<S>(value: &Bytes, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        serializer.serialize_str(&encoded)
    }

    // Decode base64 string into Bytes.
    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<Bytes, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_is_inclusive_of_deadline() {
        let message = Message::new(1, Bytes::from_static(b"x"), MessageGroup::Private, 100);
        assert!(!message.is_expired(99));
        assert!(message.is_expired(100));
        assert!(message.is_expired(101));
    }

    #[test]
    fn push_payload_carries_id_and_group() {
        let message = Message::new(42, Bytes::from_static(b"hello"), MessageGroup::Public, 0);
        let encoded = message.encode_push().expect("encode");
        let text = std::str::from_utf8(&encoded).expect("utf8");
        assert!(text.contains("\"mid\":42"));
        assert!(text.contains("\"gid\":1"));
        let decoded = PushPayload::decode(&encoded).expect("decode");
        assert_eq!(decoded.msg, Bytes::from_static(b"hello"));
    }

    #[test]
    fn with_id_keeps_body_and_expiry() {
        let message = Message::new(1, Bytes::from_static(b"b"), MessageGroup::Private, 9);
        let renumbered = message.with_id(5);
        assert_eq!(renumbered.id, 5);
        assert_eq!(renumbered.body, message.body);
        assert_eq!(renumbered.expire, 9);
    }

    #[test]
    fn group_defaults_to_private_when_missing() {
        let decoded: Message =
            serde_json::from_str(r#"{"id":3,"body":"aGk=","expire":10}"#).expect("decode");
        assert_eq!(decoded.group, MessageGroup::Private);
        assert_eq!(decoded.body, Bytes::from_static(b"hi"));
    }

    #[test]
    fn group_codes_round_trip() {
        assert_eq!(MessageGroup::from_code(0), Some(MessageGroup::Private));
        assert_eq!(MessageGroup::from_code(1), Some(MessageGroup::Public));
        assert_eq!(MessageGroup::from_code(2), None);
    }
}
