//! Message synchronizer: reconciles inbound events with the shared cache
//!
//! Every inbound message event goes through an idempotent merge: applying
//! the same event any number of times leaves the cache exactly as applying
//! it once. Receipts for messages not yet cached are dropped; the next
//! hydration refetch repairs any gap.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

use crate::cache::ChatCache;
use crate::models::{Conversation, ConversationStatus, Message, MessageContent, MessageEdit, Reaction, ReceiptKind};
use crate::protocol::ServerEvent;

pub struct MessageSynchronizer {
    cache: Arc<ChatCache>,
    local_user_id: Mutex<Option<String>>,
}

impl MessageSynchronizer {
    pub fn new(cache: Arc<ChatCache>) -> Self {
        Self {
            cache,
            local_user_id: Mutex::new(None),
        }
    }

    /// Learned from the `authenticated` payload; needed to tell inbound
    /// messages (which bump unread) from echoes of our own sends.
    pub fn set_local_user(&self, user_id: &str) {
        *self.local_user_id.lock() = Some(user_id.to_string());
    }

    pub fn local_user(&self) -> Option<String> {
        self.local_user_id.lock().clone()
    }

    /// Route one inbound event into the cache.
    pub fn apply(&self, event: &ServerEvent) {
        match event {
            ServerEvent::Authenticated { user_id } => self.set_local_user(user_id),
            ServerEvent::Message(message) => self.apply_message(message),
            ServerEvent::Receipt {
                message_id,
                conversation_id,
                kind,
                at,
            } => self.apply_receipt(conversation_id, message_id, *kind, *at),
            ServerEvent::Reaction {
                message_id,
                conversation_id,
                reactions,
            } => self.apply_reactions(conversation_id, message_id, reactions),
            ServerEvent::MessageEdited {
                message_id,
                conversation_id,
                body,
                edited_at,
            } => self.apply_edit(conversation_id, message_id, body, *edited_at),
            ServerEvent::MessageDeleted {
                message_id,
                conversation_id,
                deleted_at,
            } => self.apply_delete(conversation_id, message_id, *deleted_at),
            // Typing, presence and auth failures are not cache state.
            _ => {}
        }
    }

    // ============= Hydration =============

    pub fn hydrate_conversations(&self, conversations: Vec<Conversation>) {
        for conversation in conversations {
            self.cache.upsert_conversation(conversation);
        }
    }

    pub fn hydrate_messages(&self, conversation_id: &str, history: Vec<Message>) {
        self.cache.merge_history(conversation_id, history);
    }

    // ============= Event application =============

    fn apply_message(&self, message: &Message) {
        if !self.cache.insert_message(message.clone()) {
            tracing::debug!("duplicate message {} dropped", message.message_id);
            return;
        }

        let local = self.local_user_id.lock().clone();
        let inbound = local.as_deref() != Some(message.sender.user_id.as_str());
        let summary = message.summary();

        let refreshed = {
            let summary = summary.clone();
            self.cache
                .with_conversation_mut(&message.conversation_id, |conversation| {
                    conversation.last_message = Some(summary);
                    conversation.last_activity = message.created_at;
                    if inbound {
                        conversation.unread_count += 1;
                    }
                })
        };

        if !refreshed {
            // First event for this thread: build the row from the message's
            // participants so the list view is consistent immediately.
            let counterparty = if inbound {
                message.sender.clone()
            } else {
                message.recipient.clone()
            };
            self.cache.upsert_conversation(Conversation {
                conversation_id: message.conversation_id.clone(),
                participant: counterparty,
                last_message: Some(summary),
                unread_count: if inbound { 1 } else { 0 },
                status: ConversationStatus::Active,
                last_activity: message.created_at,
            });
        }
    }

    fn apply_receipt(
        &self,
        conversation_id: &str,
        message_id: &str,
        kind: ReceiptKind,
        at: chrono::DateTime<chrono::Utc>,
    ) {
        let found = self
            .cache
            .update_message(conversation_id, message_id, |message| match kind {
                ReceiptKind::Delivered => {
                    message.is_delivered = true;
                    message.delivered_at = Some(at);
                }
                ReceiptKind::Read => {
                    // A read receipt implies the message was delivered.
                    message.is_delivered = true;
                    message.delivered_at.get_or_insert(at);
                    message.is_read = true;
                    message.read_at = Some(at);
                }
            });
        if !found {
            tracing::debug!(
                "receipt for unknown message {} in {} dropped",
                message_id,
                conversation_id
            );
        }
    }

    fn apply_reactions(&self, conversation_id: &str, message_id: &str, reactions: &[Reaction]) {
        // The echoed list is authoritative: replace, never merge, keeping at
        // most one entry per (user, emoji).
        let next = dedupe_reactions(reactions);
        let found = self.cache.update_message(conversation_id, message_id, |message| {
            message.reactions = next;
        });
        if !found {
            tracing::debug!(
                "reaction update for unknown message {} in {} dropped",
                message_id,
                conversation_id
            );
        }
    }

    fn apply_edit(
        &self,
        conversation_id: &str,
        message_id: &str,
        body: &str,
        edited_at: chrono::DateTime<chrono::Utc>,
    ) {
        self.cache.update_message(conversation_id, message_id, |message| {
            // Only text bodies are editable; other variants keep their content.
            if !matches!(message.content, MessageContent::Text { .. }) {
                tracing::debug!("edit for non-text message {} ignored", message.message_id);
                return;
            }
            // Redelivered edit events must merge away like every other event.
            let duplicate = message
                .edit_history
                .last()
                .map(|edit| edit.body == body && edit.edited_at == edited_at)
                .unwrap_or(false);
            if duplicate {
                return;
            }
            message.edit_history.push(MessageEdit {
                body: body.to_string(),
                edited_at,
            });
            message.content = MessageContent::text(body);
        });
    }

    fn apply_delete(
        &self,
        conversation_id: &str,
        message_id: &str,
        deleted_at: chrono::DateTime<chrono::Utc>,
    ) {
        self.cache.update_message(conversation_id, message_id, |message| {
            message.is_deleted = true;
            message.deleted_at = Some(deleted_at);
        });
    }
}

fn dedupe_reactions(reactions: &[Reaction]) -> Vec<Reaction> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(reactions.len());
    for reaction in reactions {
        if seen.insert((reaction.user_id.clone(), reaction.emoji.clone())) {
            out.push(reaction.clone());
        }
    }
    out
}
