//! Mailbox message types

use crate::utils::generate_id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Sender id used for messages produced by the mesh itself
pub const SYSTEM_SENDER: &str = "system";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Request,
    Response,
    Notification,
    Update,
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::Request => write!(f, "request"),
            MessageType::Response => write!(f, "response"),
            MessageType::Notification => write!(f, "notification"),
            MessageType::Update => write!(f, "update"),
        }
    }
}

impl std::str::FromStr for MessageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "request" => Ok(MessageType::Request),
            "response" => Ok(MessageType::Response),
            "notification" => Ok(MessageType::Notification),
            "update" => Ok(MessageType::Update),
            other => Err(format!("unknown message type '{}'", other)),
        }
    }
}

/// A delivered message. Immutable once written; read state lives elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub subject: String,
    #[serde(default)]
    pub content: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// A message before it has been stamped with an id and timestamp
#[derive(Debug, Clone)]
pub struct MessageDraft {
    pub from: String,
    pub to: String,
    pub message_type: MessageType,
    pub subject: String,
    pub content: Value,
    pub reply_to: Option<String>,
}

impl MessageDraft {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        message_type: MessageType,
        subject: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            message_type,
            subject: subject.into(),
            content: Value::Null,
            reply_to: None,
        }
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }

    pub fn in_reply_to(mut self, message_id: impl Into<String>) -> Self {
        self.reply_to = Some(message_id.into());
        self
    }

    pub(crate) fn into_message(self) -> Message {
        Message {
            id: generate_id("msg"),
            from: self.from,
            to: self.to,
            message_type: self.message_type,
            subject: self.subject,
            content: self.content,
            timestamp: Utc::now(),
            reply_to: self.reply_to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let message = MessageDraft::new("a", "b", MessageType::Response, "Re: hi")
            .with_content(serde_json::json!({ "ok": true }))
            .in_reply_to("msg_1")
            .into_message();

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "response");
        assert_eq!(json["replyTo"], "msg_1");
        assert!(json["id"].as_str().unwrap().starts_with("msg_"));

        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_parse_message_type() {
        assert_eq!("Update".parse::<MessageType>().unwrap(), MessageType::Update);
        assert!("memo".parse::<MessageType>().is_err());
    }
}
