//! Chat message record and its wire encoding.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Largest payload that fits in a single IPv4 UDP datagram.
pub const MAX_DATAGRAM_BYTES: usize = 65_507;

/// A chat message. Immutable once created; relays never rewrite any field.
///
/// The wire form is a JSON object with the fields `content`, `nickname`,
/// `timestamp` and `originId`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    /// Message text.
    pub content: String,
    /// Display name of the author.
    pub nickname: String,
    /// Seconds since the Unix epoch, assigned by the author.
    pub timestamp: i64,
    /// Unique per (authoring node, message); used for deduplication.
    pub origin_id: String,
}

impl ChatMessage {
    /// Create a message from its parts.
    pub fn new(
        content: impl Into<String>,
        nickname: impl Into<String>,
        timestamp: i64,
        origin_id: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            nickname: nickname.into(),
            timestamp,
            origin_id: origin_id.into(),
        }
    }

    /// The key messages are ordered by: timestamp, then origin id.
    pub fn order_key(&self) -> (i64, &str) {
        (self.timestamp, self.origin_id.as_str())
    }

    /// Compare two messages by delivery order.
    pub fn cmp_order(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }

    /// The author timestamp as a UTC datetime, if it is in range.
    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.timestamp, 0)
    }

    /// Serialize to the wire payload.
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Deserialize a wire payload.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() > MAX_DATAGRAM_BYTES {
            return Err(DecodeError::Oversized(bytes.len()));
        }
        let message: Self = serde_json::from_slice(bytes)?;
        if message.origin_id.trim().is_empty() {
            return Err(DecodeError::InvalidField {
                field: "originId",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(message)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChatMessage {
        ChatMessage::new("hello", "alice", 1_700_000_000, "node-a-000000000001")
    }

    #[test]
    fn test_wire_field_names() {
        let value: serde_json::Value = serde_json::from_slice(&sample().encode()).unwrap();
        assert_eq!(value["content"], "hello");
        assert_eq!(value["nickname"], "alice");
        assert_eq!(value["timestamp"], 1_700_000_000);
        assert_eq!(value["originId"], "node-a-000000000001");
    }

    #[test]
    fn test_encode_decode_is_exact() {
        let message = ChatMessage::new("  spaced \u{1F980} ", "bob", -5, "x-1");
        let decoded = ChatMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = ChatMessage::decode(b"\xff\x00garbage").unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_decode_rejects_missing_field() {
        let err = ChatMessage::decode(br#"{"content":"hi","nickname":"a","timestamp":1}"#)
            .unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn test_decode_rejects_blank_origin_id() {
        let raw = br#"{"content":"hi","nickname":"a","timestamp":1,"originId":"  "}"#;
        let err = ChatMessage::decode(raw).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidField { field: "originId", .. }));
    }

    #[test]
    fn test_decode_rejects_oversized() {
        let raw = vec![b' '; MAX_DATAGRAM_BYTES + 1];
        let err = ChatMessage::decode(&raw).unwrap_err();
        assert!(matches!(err, DecodeError::Oversized(n) if n == MAX_DATAGRAM_BYTES + 1));
    }

    #[test]
    fn test_order_uses_origin_id_as_tie_break() {
        let a = ChatMessage::new("x", "a", 10, "aaa");
        let b = ChatMessage::new("y", "b", 10, "bbb");
        let c = ChatMessage::new("z", "c", 9, "zzz");
        assert_eq!(a.cmp_order(&b), Ordering::Less);
        assert_eq!(c.cmp_order(&a), Ordering::Less);
        assert_eq!(a.cmp_order(&a.clone()), Ordering::Equal);
    }

    #[test]
    fn test_sent_at() {
        let at = sample().sent_at().unwrap();
        assert_eq!(at.timestamp(), 1_700_000_000);
    }
}
