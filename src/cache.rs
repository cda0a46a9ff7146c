//! Shared conversation/message cache
//!
//! The cache is the single source of truth the UI reads from. Reads and
//! update subscriptions are public; every write path is crate-private so
//! state is only ever mutated through synchronizer-mediated events, which is
//! what keeps the idempotent-merge invariant intact.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::bus::{EventBus, Subscription};
use crate::models::{Conversation, Message};

/// Published after every cache mutation, keyed by conversation so UI state
/// layers can refresh just the affected thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheUpdate {
    pub conversation_id: String,
}

#[derive(Default)]
struct CacheState {
    conversations: HashMap<String, Conversation>,
    /// conversation_id -> messages in delivery order.
    messages: HashMap<String, Vec<Message>>,
}

pub struct ChatCache {
    state: RwLock<CacheState>,
    updates: EventBus<CacheUpdate>,
}

impl Default for ChatCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ChatCache {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            updates: EventBus::new(),
        }
    }

    // ============= Reads =============

    /// All cached conversations, most recently active first.
    pub fn conversations(&self) -> Vec<Conversation> {
        let state = self.state.read();
        let mut list: Vec<Conversation> = state.conversations.values().cloned().collect();
        list.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        list
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.state.read().conversations.get(conversation_id).cloned()
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.state
            .read()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn message(&self, conversation_id: &str, message_id: &str) -> Option<Message> {
        self.state
            .read()
            .messages
            .get(conversation_id)
            .and_then(|msgs| msgs.iter().find(|m| m.message_id == message_id))
            .cloned()
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription<CacheUpdate>
    where
        F: Fn(&CacheUpdate) + Send + Sync + 'static,
    {
        self.updates.subscribe(callback)
    }

    // ============= Writes (synchronizer-mediated only) =============

    /// Append a message in delivery order. Returns false when the id is
    /// already present, making duplicate delivery a no-op.
    pub(crate) fn insert_message(&self, message: Message) -> bool {
        let conversation_id = message.conversation_id.clone();
        let inserted = {
            let mut state = self.state.write();
            let sequence = state.messages.entry(conversation_id.clone()).or_default();
            if sequence.iter().any(|m| m.message_id == message.message_id) {
                false
            } else {
                sequence.push(message);
                true
            }
        };
        if inserted {
            self.notify(&conversation_id);
        }
        inserted
    }

    /// Merge a hydration page: missing messages are inserted and the
    /// sequence re-sorted by creation time (stable, so delivery order among
    /// equal timestamps survives).
    pub(crate) fn merge_history(&self, conversation_id: &str, history: Vec<Message>) {
        {
            let mut state = self.state.write();
            let sequence = state.messages.entry(conversation_id.to_string()).or_default();
            for message in history {
                if !sequence.iter().any(|m| m.message_id == message.message_id) {
                    sequence.push(message);
                }
            }
            sequence.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        }
        self.notify(conversation_id);
    }

    pub(crate) fn upsert_conversation(&self, conversation: Conversation) {
        let conversation_id = conversation.conversation_id.clone();
        self.state
            .write()
            .conversations
            .insert(conversation_id.clone(), conversation);
        self.notify(&conversation_id);
    }

    /// Mutate a conversation row in place. Returns false when unknown.
    pub(crate) fn with_conversation_mut<F>(&self, conversation_id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut Conversation),
    {
        let found = {
            let mut state = self.state.write();
            match state.conversations.get_mut(conversation_id) {
                Some(conversation) => {
                    mutate(conversation);
                    true
                }
                None => false,
            }
        };
        if found {
            self.notify(conversation_id);
        }
        found
    }

    /// Mutate a message in place. Returns false when the message is not
    /// cached (e.g. a receipt raced ahead of its message).
    pub(crate) fn update_message<F>(
        &self,
        conversation_id: &str,
        message_id: &str,
        mutate: F,
    ) -> bool
    where
        F: FnOnce(&mut Message),
    {
        let found = {
            let mut state = self.state.write();
            state
                .messages
                .get_mut(conversation_id)
                .and_then(|msgs| msgs.iter_mut().find(|m| m.message_id == message_id))
                .map(mutate)
                .is_some()
        };
        if found {
            self.notify(conversation_id);
        }
        found
    }

    pub(crate) fn clear_unread(&self, conversation_id: &str) {
        self.with_conversation_mut(conversation_id, |c| c.unread_count = 0);
    }

    fn notify(&self, conversation_id: &str) {
        // Published outside the write lock so subscribers may read back.
        self.updates.publish(&CacheUpdate {
            conversation_id: conversation_id.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MessageContent, Participant, UserRole};
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn participant(id: &str, role: UserRole) -> Participant {
        Participant {
            user_id: id.to_string(),
            display_name: id.to_string(),
            role,
            metadata: None,
        }
    }

    fn message(id: &str, conversation_id: &str, minute: u32) -> Message {
        Message {
            message_id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender: participant("farmer-1", UserRole::Farmer),
            recipient: participant("adopter-1", UserRole::Adopter),
            content: MessageContent::text("hi"),
            created_at: Utc.with_ymd_and_hms(2026, 8, 20, 10, minute, 0).unwrap(),
            is_delivered: false,
            delivered_at: None,
            is_read: false,
            read_at: None,
            is_deleted: false,
            deleted_at: None,
            reactions: Vec::new(),
            reply_to: None,
            edit_history: Vec::new(),
        }
    }

    #[test]
    fn test_insert_rejects_duplicate_ids() {
        let cache = ChatCache::new();
        assert!(cache.insert_message(message("m1", "c1", 0)));
        assert!(!cache.insert_message(message("m1", "c1", 0)));
        assert_eq!(cache.messages("c1").len(), 1);
    }

    #[test]
    fn test_merge_history_orders_by_creation_time() {
        let cache = ChatCache::new();
        // Live message arrives first, then an older page is hydrated.
        cache.insert_message(message("m3", "c1", 30));
        cache.merge_history(
            "c1",
            vec![message("m1", "c1", 10), message("m2", "c1", 20), message("m3", "c1", 30)],
        );

        let ids: Vec<String> = cache
            .messages("c1")
            .into_iter()
            .map(|m| m.message_id)
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_updates_keyed_by_conversation() {
        let cache = ChatCache::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let _sub = cache.subscribe(move |u| seen_cb.lock().push(u.conversation_id.clone()));

        cache.insert_message(message("m1", "c1", 0));
        cache.insert_message(message("m2", "c2", 1));
        // Duplicate insert must not notify.
        cache.insert_message(message("m1", "c1", 0));

        assert_eq!(*seen.lock(), vec!["c1", "c2"]);
    }
}
