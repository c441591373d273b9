use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One archived chat-room message, already validated by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Room (archive) id; selects the shard
    pub room_id: u64,
    /// Archive message id, unique within the room
    pub message_id: i64,
    /// Bare JID of the sender
    pub sender_jid: String,
    /// Occupant nickname in the room
    pub nick_name: String,
    /// Encoded message packet
    #[serde(with = "base64_serde")]
    pub payload: Vec<u8>,
    /// Time the message was archived
    pub timestamp: DateTime<Utc>,
    /// Client-assigned `origin-id`, the handle later retractions refer to
    #[serde(default)]
    pub origin_id: Option<String>,
    /// Origin id of an earlier message this one retracts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retraction: Option<Retraction>,
}

/// Marker for a retraction (XEP-0424) carried by an archived message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Retraction {
    /// `origin-id` of the message being retracted
    pub origin_id: String,
}

impl WriteRequest {
    /// Owner key used by the shard router
    pub fn owner_key(&self) -> u64 {
        self.room_id
    }

    pub fn is_retraction(&self) -> bool {
        self.retraction.is_some()
    }
}

/// Base64 serialization helper
mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
pub(crate) fn test_request(room_id: u64, message_id: i64) -> WriteRequest {
    WriteRequest {
        room_id,
        message_id,
        sender_jid: "alice@example.com".to_string(),
        nick_name: "alice".to_string(),
        payload: format!("<message id='{}'/>", message_id).into_bytes(),
        timestamp: Utc::now(),
        origin_id: Some(format!("origin-{}", message_id)),
        retraction: None,
    }
}
