//! Room membership: which conversation rooms this session is joined to
//!
//! Server-side room state does not survive a reconnect, so memberships are
//! recorded here and re-emitted on every successful handshake.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

use crate::protocol::ClientEvent;
use crate::session::Session;

pub struct RoomManager {
    session: Arc<Session>,
    joined: Mutex<HashSet<String>>,
}

impl RoomManager {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            joined: Mutex::new(HashSet::new()),
        }
    }

    /// Join a conversation room. No-op when disconnected or already joined.
    pub fn join_conversation(&self, conversation_id: &str) {
        if !self.session.is_connected() {
            tracing::debug!("join {} dropped while disconnected", conversation_id);
            return;
        }
        if !self.joined.lock().insert(conversation_id.to_string()) {
            return;
        }
        self.session.emit(ClientEvent::JoinRoom {
            conversation_id: conversation_id.to_string(),
        });
    }

    /// Leave a conversation room. Safe to call for rooms never joined.
    pub fn leave_conversation(&self, conversation_id: &str) {
        self.joined.lock().remove(conversation_id);
        if self.session.is_connected() {
            self.session.emit(ClientEvent::LeaveRoom {
                conversation_id: conversation_id.to_string(),
            });
        }
    }

    pub fn is_joined(&self, conversation_id: &str) -> bool {
        self.joined.lock().contains(conversation_id)
    }

    pub fn joined_rooms(&self) -> Vec<String> {
        self.joined.lock().iter().cloned().collect()
    }

    /// Forget every recorded membership. Used on explicit sign-out so a
    /// later session for a different identity cannot rejoin the previous
    /// identity's rooms.
    pub fn clear(&self) {
        self.joined.lock().clear();
    }

    /// Re-emit joins for every recorded membership. Invoked on each
    /// `authenticated` event, which the read loop dispatches before any
    /// later inbound event for those rooms.
    pub fn rejoin_all(&self) {
        let rooms = self.joined_rooms();
        if !rooms.is_empty() {
            tracing::info!("re-establishing {} room membership(s)", rooms.len());
        }
        for conversation_id in rooms {
            self.session.emit(ClientEvent::JoinRoom { conversation_id });
        }
    }
}
