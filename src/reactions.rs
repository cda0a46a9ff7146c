//! Reaction intents
//!
//! Local intents are fire-and-forget; the authoritative reaction list is
//! whatever the server echoes back, which the synchronizer replaces into the
//! cache. No optimistic local update, so ghost duplicates cannot appear.

use std::sync::Arc;

use crate::protocol::ClientEvent;
use crate::rooms::RoomManager;
use crate::session::Session;

pub struct ReactionCoordinator {
    session: Arc<Session>,
    rooms: Arc<RoomManager>,
}

impl ReactionCoordinator {
    pub fn new(session: Arc<Session>, rooms: Arc<RoomManager>) -> Self {
        Self { session, rooms }
    }

    pub fn add_reaction(&self, message_id: &str, emoji: &str, conversation_id: &str) {
        self.emit(message_id, emoji, conversation_id, true);
    }

    pub fn remove_reaction(&self, message_id: &str, emoji: &str, conversation_id: &str) {
        self.emit(message_id, emoji, conversation_id, false);
    }

    fn emit(&self, message_id: &str, emoji: &str, conversation_id: &str, add: bool) {
        if !self.session.is_connected() || !self.rooms.is_joined(conversation_id) {
            tracing::debug!(
                "reaction intent for {} dropped (disconnected or room not joined)",
                message_id
            );
            return;
        }
        let message_id = message_id.to_string();
        let emoji = emoji.to_string();
        let conversation_id = conversation_id.to_string();
        self.session.emit(if add {
            ClientEvent::AddReaction {
                message_id,
                emoji,
                conversation_id,
            }
        } else {
            ClientEvent::RemoveReaction {
                message_id,
                emoji,
                conversation_id,
            }
        });
    }
}
