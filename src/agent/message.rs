//! Message envelope and well-known sentinel identities.

use std::collections::BTreeMap;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::types::now_iso;

/// The daemon itself, as a message endpoint.
pub const SYSTEM: Uuid = Uuid::from_u128(0);
/// The human operator behind the CLI.
pub const USER: Uuid = Uuid::from_u128(1);

/// True for the SYSTEM and USER pseudo-identities. Sentinels bypass one-hop
/// routing but never appear in the agent tree.
pub fn is_sentinel(agent_id: Uuid) -> bool {
    agent_id == SYSTEM || agent_id == USER
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    Multicast,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Notification => "notification",
            MessageKind::Multicast => "multicast",
        }
    }

    pub fn parse(s: &str) -> Option<MessageKind> {
        match s {
            "request" => Some(MessageKind::Request),
            "response" => Some(MessageKind::Response),
            "notification" => Some(MessageKind::Notification),
            "multicast" => Some(MessageKind::Multicast),
            _ => None,
        }
    }
}

/// Wire format for inter-agent messages.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    pub id: Uuid,
    pub timestamp: String,
    pub sender: Uuid,
    pub recipient: Option<Uuid>,
    pub reply_to: Option<Uuid>,
    pub kind: MessageKind,
    pub payload: String,
    pub metadata: BTreeMap<String, String>,
}

impl MessageEnvelope {
    /// Every message has an origin; everything else is builder-set.
    pub fn new(sender: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: now_iso(),
            sender,
            recipient: None,
            reply_to: None,
            kind: MessageKind::Request,
            payload: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_recipient(mut self, recipient: Uuid) -> Self {
        self.recipient = Some(recipient);
        self
    }

    pub fn with_reply_to(mut self, reply_to: Uuid) -> Self {
        self.reply_to = Some(reply_to);
        self
    }

    pub fn with_kind(mut self, kind: MessageKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Payload of a `message.enqueued` event, written to the recipient's log
    /// before delivery.
    pub fn to_event_data(&self) -> Value {
        json!({
            "message_id": self.id.simple().to_string(),
            "sender": self.sender.simple().to_string(),
            "recipient": self.recipient.map(|r| r.simple().to_string()),
            "kind": self.kind.as_str(),
            "payload": self.payload,
            "timestamp": self.timestamp,
            "reply_to": self.reply_to.map(|r| r.simple().to_string()),
            "metadata": self.metadata,
        })
    }

    /// Rebuild an envelope from a `message.enqueued` event payload (inbox
    /// reconstruction on recovery). Returns None if essential fields are
    /// missing or unparseable.
    pub fn from_event_data(data: &Value) -> Option<Self> {
        let id = Uuid::parse_str(data.get("message_id")?.as_str()?).ok()?;
        let sender = Uuid::parse_str(data.get("sender")?.as_str()?).ok()?;
        let recipient = match data.get("recipient") {
            Some(Value::String(s)) => Some(Uuid::parse_str(s).ok()?),
            _ => None,
        };
        let reply_to = match data.get("reply_to") {
            Some(Value::String(s)) => Some(Uuid::parse_str(s).ok()?),
            _ => None,
        };
        let kind = MessageKind::parse(data.get("kind")?.as_str()?)?;
        let mut metadata = BTreeMap::new();
        if let Some(map) = data.get("metadata").and_then(Value::as_object) {
            for (k, v) in map {
                if let Some(s) = v.as_str() {
                    metadata.insert(k.clone(), s.to_string());
                }
            }
        }
        Some(Self {
            id,
            timestamp: data
                .get("timestamp")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            sender,
            recipient,
            reply_to,
            kind,
            payload: data
                .get("payload")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_fixed_uuids() {
        assert_eq!(SYSTEM, Uuid::nil());
        assert_eq!(USER.as_u128(), 1);
        assert!(is_sentinel(SYSTEM));
        assert!(is_sentinel(USER));
        assert!(!is_sentinel(Uuid::new_v4()));
    }

    #[test]
    fn kind_string_roundtrip() {
        for kind in [
            MessageKind::Request,
            MessageKind::Response,
            MessageKind::Notification,
            MessageKind::Multicast,
        ] {
            assert_eq!(MessageKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageKind::parse("bogus"), None);
    }

    #[test]
    fn envelope_builder() {
        let sender = Uuid::new_v4();
        let recipient = Uuid::new_v4();
        let env = MessageEnvelope::new(sender)
            .with_recipient(recipient)
            .with_kind(MessageKind::Multicast)
            .with_payload("status?")
            .with_metadata("sync", "false");

        assert_eq!(env.sender, sender);
        assert_eq!(env.recipient, Some(recipient));
        assert_eq!(env.kind, MessageKind::Multicast);
        assert_eq!(env.payload, "status?");
        assert_eq!(env.metadata.get("sync").map(String::as_str), Some("false"));
        assert!(env.reply_to.is_none());
    }

    #[test]
    fn event_data_roundtrip() {
        let env = MessageEnvelope::new(Uuid::new_v4())
            .with_recipient(Uuid::new_v4())
            .with_reply_to(Uuid::new_v4())
            .with_kind(MessageKind::Response)
            .with_payload("done")
            .with_metadata("sync", "true");

        let data = env.to_event_data();
        assert_eq!(data["message_id"].as_str().unwrap().len(), 32);

        let back = MessageEnvelope::from_event_data(&data).unwrap();
        assert_eq!(back.id, env.id);
        assert_eq!(back.sender, env.sender);
        assert_eq!(back.recipient, env.recipient);
        assert_eq!(back.reply_to, env.reply_to);
        assert_eq!(back.kind, env.kind);
        assert_eq!(back.payload, env.payload);
        assert_eq!(back.metadata, env.metadata);
        assert_eq!(back.timestamp, env.timestamp);
    }

    #[test]
    fn event_data_missing_fields_is_none() {
        assert!(MessageEnvelope::from_event_data(&json!({})).is_none());
        assert!(MessageEnvelope::from_event_data(&json!({"message_id": "zzz"})).is_none());
    }
}
