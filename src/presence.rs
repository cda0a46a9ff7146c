//! Presence broadcast and per-conversation typing state
//!
//! Typing entries expire 3 seconds after the last event for that user. Each
//! new event replaces the deadline and bumps a generation counter; the
//! expiry task only removes an entry whose generation is still current, so
//! rapid re-typing never accumulates timers or expires early. Reads filter
//! by deadline as well, making expiry exact even before the task fires.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::models::{PresenceStatus, TypingIndicator};
use crate::protocol::ClientEvent;
use crate::session::Session;

const TYPING_TTL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingUser {
    pub user_id: String,
    pub user_name: String,
}

struct TypingEntry {
    user_name: String,
    expires_at: Instant,
    generation: u64,
}

struct TypingState {
    /// Conversation the UI currently has open; events for any other
    /// conversation are ignored here (consumers wanting badge counts can
    /// subscribe to the session bus directly).
    active: Mutex<Option<String>>,
    typists: Mutex<HashMap<String, TypingEntry>>,
    next_generation: AtomicU64,
}

pub struct PresenceTracker {
    session: Arc<Session>,
    state: Arc<TypingState>,
}

impl PresenceTracker {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            state: Arc::new(TypingState {
                active: Mutex::new(None),
                typists: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Switch the typing scope to another conversation; stale typists from
    /// the previous thread are discarded.
    pub fn set_active_conversation(&self, conversation_id: Option<&str>) {
        *self.state.active.lock() = conversation_id.map(|id| id.to_string());
        self.state.typists.lock().clear();
    }

    pub fn active_conversation(&self) -> Option<String> {
        self.state.active.lock().clone()
    }

    // ============= Outbound =============

    pub fn start_typing(&self, conversation_id: &str) {
        self.emit_typing(conversation_id, true);
    }

    pub fn stop_typing(&self, conversation_id: &str) {
        self.emit_typing(conversation_id, false);
    }

    fn emit_typing(&self, conversation_id: &str, start: bool) {
        if conversation_id.is_empty() || !self.session.is_connected() {
            tracing::debug!("typing intent dropped (no connection or conversation)");
            return;
        }
        let conversation_id = conversation_id.to_string();
        self.session.emit(if start {
            ClientEvent::TypingStart { conversation_id }
        } else {
            ClientEvent::TypingStop { conversation_id }
        });
    }

    /// Broadcast the local user's availability.
    pub fn update_status(&self, status: PresenceStatus) {
        if !self.session.is_connected() {
            tracing::debug!("status update dropped while disconnected");
            return;
        }
        self.session.emit(ClientEvent::UpdateStatus { status });
    }

    // ============= Inbound =============

    /// Fold an inbound typing event into the typist map. Must run inside the
    /// tokio runtime (the expiry sweep is a spawned task).
    pub fn observe(&self, indicator: &TypingIndicator) {
        let scoped = self
            .state
            .active
            .lock()
            .as_deref()
            .map(|active| active == indicator.conversation_id)
            .unwrap_or(false);
        if !scoped {
            tracing::trace!(
                "typing event for inactive conversation {} ignored",
                indicator.conversation_id
            );
            return;
        }

        if !indicator.is_typing {
            self.state.typists.lock().remove(&indicator.user_id);
            return;
        }

        let generation = self.state.next_generation.fetch_add(1, Ordering::Relaxed);
        let expires_at = Instant::now() + TYPING_TTL;
        self.state.typists.lock().insert(
            indicator.user_id.clone(),
            TypingEntry {
                user_name: indicator.user_name.clone(),
                expires_at,
                generation,
            },
        );

        // Replace-on-refresh sweep: an older task waking up finds a newer
        // generation and leaves the entry alone.
        let state = self.state.clone();
        let user_id = indicator.user_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(expires_at).await;
            let mut typists = state.typists.lock();
            if typists
                .get(&user_id)
                .map(|entry| entry.generation == generation)
                .unwrap_or(false)
            {
                typists.remove(&user_id);
            }
        });
    }

    /// Users currently typing in the active conversation.
    pub fn typists(&self) -> Vec<TypingUser> {
        let now = Instant::now();
        self.state
            .typists
            .lock()
            .iter()
            .filter(|(_, entry)| entry.expires_at > now)
            .map(|(user_id, entry)| TypingUser {
                user_id: user_id.clone(),
                user_name: entry.user_name.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::session::ConnectionState;
    use tokio::sync::mpsc;

    fn tracker() -> PresenceTracker {
        let session = Session::new(ClientConfig::new("localhost", 9999, false));
        PresenceTracker::new(session)
    }

    fn typing(user_id: &str, conversation_id: &str, is_typing: bool) -> TypingIndicator {
        TypingIndicator {
            user_id: user_id.to_string(),
            user_name: format!("{} name", user_id),
            conversation_id: conversation_id.to_string(),
            is_typing,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_typing_expires_after_ttl() {
        let tracker = tracker();
        tracker.set_active_conversation(Some("c1"));

        tracker.observe(&typing("adopter-1", "c1", true));
        assert_eq!(tracker.typists().len(), 1);

        tokio::time::advance(Duration::from_millis(2900)).await;
        assert_eq!(tracker.typists().len(), 1);

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(tracker.typists().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_resets_deadline() {
        let tracker = tracker();
        tracker.set_active_conversation(Some("c1"));

        tracker.observe(&typing("adopter-1", "c1", true));
        tokio::time::advance(Duration::from_secs(2)).await;

        // Re-typing replaces the deadline; the first timer must not fire.
        tracker.observe(&typing("adopter-1", "c1", true));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(tracker.typists().len(), 1);

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(tracker.typists().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_event_removes_immediately() {
        let tracker = tracker();
        tracker.set_active_conversation(Some("c1"));

        tracker.observe(&typing("adopter-1", "c1", true));
        tracker.observe(&typing("adopter-1", "c1", false));
        assert!(tracker.typists().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_conversations_ignored() {
        let tracker = tracker();
        tracker.set_active_conversation(Some("c1"));

        tracker.observe(&typing("adopter-1", "c2", true));
        assert!(tracker.typists().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_conversation_clears_typists() {
        let tracker = tracker();
        tracker.set_active_conversation(Some("c1"));
        tracker.observe(&typing("adopter-1", "c1", true));
        assert_eq!(tracker.typists().len(), 1);

        tracker.set_active_conversation(Some("c2"));
        assert!(tracker.typists().is_empty());
    }

    #[test]
    fn test_outbound_requires_connection() {
        let session = Session::new(ClientConfig::new("localhost", 9999, false));
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.install_outbound(tx);
        let tracker = PresenceTracker::new(session.clone());

        tracker.start_typing("c1");
        tracker.update_status(PresenceStatus::Online);
        assert!(rx.try_recv().is_err());

        session.set_state(ConnectionState::Connected);
        tracker.start_typing("c1");
        tracker.start_typing(""); // empty conversation id stays a no-op
        assert_eq!(
            rx.try_recv().unwrap(),
            ClientEvent::TypingStart {
                conversation_id: "c1".to_string()
            }
        );
        assert!(rx.try_recv().is_err());
    }
}
