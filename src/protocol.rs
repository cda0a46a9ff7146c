//! Wire protocol for the messaging channel
//!
//! Every frame is a JSON object of the form `{"type": ..., "payload": ...}`.
//! `ClientEvent` covers outbound intents, `ServerEvent` inbound events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Message, MessageContent, PresenceStatus, Reaction, ReceiptKind, TypingIndicator};

// ============================================================================
// Outbound frames
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    Authenticate {
        token: String,
    },
    JoinRoom {
        conversation_id: String,
    },
    LeaveRoom {
        conversation_id: String,
    },
    SendMessage {
        recipient_id: String,
        content: MessageContent,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply_to: Option<String>,
        /// Client-side send reference, lets the server dedupe retried sends.
        client_ref: String,
    },
    TypingStart {
        conversation_id: String,
    },
    TypingStop {
        conversation_id: String,
    },
    UpdateStatus {
        status: PresenceStatus,
    },
    AddReaction {
        message_id: String,
        emoji: String,
        conversation_id: String,
    },
    RemoveReaction {
        message_id: String,
        emoji: String,
        conversation_id: String,
    },
    MarkRead {
        conversation_id: String,
    },
}

// ============================================================================
// Inbound frames
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    Authenticated {
        user_id: String,
    },
    Unauthorized {
        reason: String,
    },
    Message(Message),
    Typing(TypingIndicator),
    Presence {
        user_id: String,
        status: PresenceStatus,
    },
    /// Authoritative reaction list for a message; replaces local state.
    Reaction {
        message_id: String,
        conversation_id: String,
        reactions: Vec<Reaction>,
    },
    Receipt {
        message_id: String,
        conversation_id: String,
        kind: ReceiptKind,
        at: DateTime<Utc>,
    },
    MessageEdited {
        message_id: String,
        conversation_id: String,
        body: String,
        edited_at: DateTime<Utc>,
    },
    MessageDeleted {
        message_id: String,
        conversation_id: String,
        deleted_at: DateTime<Utc>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_frame_shape() {
        let frame = ClientEvent::JoinRoom {
            conversation_id: "c1".to_string(),
        };
        let json: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "join_room");
        assert_eq!(json["payload"]["conversation_id"], "c1");
    }

    #[test]
    fn test_inbound_receipt_parses() {
        let text = r#"{
            "type": "receipt",
            "payload": {
                "message_id": "m1",
                "conversation_id": "c1",
                "kind": "read",
                "at": "2026-08-20T10:00:00Z"
            }
        }"#;
        let event: ServerEvent = serde_json::from_str(text).unwrap();
        match event {
            ServerEvent::Receipt { message_id, kind, .. } => {
                assert_eq!(message_id, "m1");
                assert_eq!(kind, ReceiptKind::Read);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
