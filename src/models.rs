//! Data models for AgriLink messaging

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Participants
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    Farmer,
    Adopter,
    Expert,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: String,
    pub display_name: String,
    pub role: UserRole,
    /// Role-specific payload (farm name, expertise area, ...), opaque here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

// ============================================================================
// Conversations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    Active,
    Archived,
    Blocked,
}

impl Default for ConversationStatus {
    fn default() -> Self {
        Self::Active
    }
}

/// Compact projection of the newest message, kept on the conversation row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub message_id: String,
    pub sender_id: String,
    pub preview: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub conversation_id: String,
    pub participant: Participant,
    pub last_message: Option<MessageSummary>,
    pub unread_count: u32,
    #[serde(default)]
    pub status: ConversationStatus,
    pub last_activity: DateTime<Utc>,
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        body: String,
    },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Video {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    File {
        url: String,
        file_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size_bytes: Option<i64>,
    },
    Location {
        latitude: f64,
        longitude: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    /// One-line rendering for conversation summaries.
    pub fn preview(&self) -> String {
        match self {
            Self::Text { body } => body.clone(),
            Self::Image { .. } => "[image]".to_string(),
            Self::Video { .. } => "[video]".to_string(),
            Self::File { file_name, .. } => format!("[file] {}", file_name),
            Self::Location { label, .. } => label
                .clone()
                .map(|l| format!("[location] {}", l))
                .unwrap_or_else(|| "[location]".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: String,
    pub emoji: String,
    pub reacted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageEdit {
    pub body: String,
    pub edited_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub conversation_id: String,
    pub sender: Participant,
    pub recipient: Participant,
    pub content: MessageContent,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_delivered: bool,
    #[serde(default)]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub edit_history: Vec<MessageEdit>,
}

impl Message {
    pub fn summary(&self) -> MessageSummary {
        MessageSummary {
            message_id: self.message_id.clone(),
            sender_id: self.sender.user_id.clone(),
            preview: self.content.preview(),
            created_at: self.created_at,
        }
    }
}

// ============================================================================
// Presence & typing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Busy,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingIndicator {
    pub user_id: String,
    pub user_name: String,
    pub conversation_id: String,
    pub is_typing: bool,
}

// ============================================================================
// Receipts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptKind {
    Delivered,
    Read,
}
