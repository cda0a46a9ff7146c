//! AgriLink Messaging Core
//!
//! Client-side real-time messaging for the AgriLink marketplace: one
//! transport session per process, room membership, typing presence,
//! reactions, and a shared conversation/message cache kept consistent under
//! duplicate delivery.
//!
//! The host application constructs a single [`MessagingClient`] and passes
//! it by reference to every consumer; UI layers read from [`ChatCache`] and
//! subscribe to its updates, never mutating it directly.

pub mod api;
pub mod bus;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod presence;
pub mod protocol;
pub mod reactions;
pub mod rooms;
pub mod session;
pub mod sync;

use parking_lot::Mutex;
use std::sync::Arc;

pub use api::{ApiClient, Page};
pub use bus::{EventBus, Subscription};
pub use cache::{CacheUpdate, ChatCache};
pub use config::ClientConfig;
pub use error::{Error, Result};
pub use models::*;
pub use presence::{PresenceTracker, TypingUser};
pub use protocol::{ClientEvent, ServerEvent};
pub use reactions::ReactionCoordinator;
pub use rooms::RoomManager;
pub use session::{ConnectionState, Session, SessionEvent};
pub use sync::MessageSynchronizer;

const HYDRATION_PAGE_SIZE: u32 = 50;

/// Process-scoped messaging client wiring the transport session, cache, and
/// trackers together.
pub struct MessagingClient {
    session: Arc<Session>,
    rooms: Arc<RoomManager>,
    presence: Arc<PresenceTracker>,
    synchronizer: Arc<MessageSynchronizer>,
    reactions: Arc<ReactionCoordinator>,
    cache: Arc<ChatCache>,
    api: Arc<ApiClient>,
    wiring: Mutex<Vec<Subscription<SessionEvent>>>,
}

impl MessagingClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        let api = Arc::new(ApiClient::new(&config)?);
        let session = Session::new(config);
        let cache = Arc::new(ChatCache::new());
        let rooms = Arc::new(RoomManager::new(session.clone()));
        let presence = Arc::new(PresenceTracker::new(session.clone()));
        let synchronizer = Arc::new(MessageSynchronizer::new(cache.clone()));
        let reactions = Arc::new(ReactionCoordinator::new(session.clone(), rooms.clone()));

        Ok(Self {
            session,
            rooms,
            presence,
            synchronizer,
            reactions,
            cache,
            api,
            wiring: Mutex::new(Vec::new()),
        })
    }

    // ============= Lifecycle =============

    /// Connect with an identity token. Idempotent for the same token;
    /// requires an ambient tokio runtime.
    pub fn connect(&self, token: &str) {
        self.api.set_token(token);
        self.wire();
        self.session.connect(token);
    }

    /// Tear down the transport and all listeners. Intents after this call
    /// are dropped until the next `connect`. Memberships recorded for the
    /// signed-out identity are forgotten so they never replay into a session
    /// opened with a different token; cached conversations stay readable
    /// until the next hydration.
    pub fn disconnect(&self) {
        self.session.disconnect();
        self.api.clear_token();
        self.rooms.clear();
        for sub in self.wiring.lock().drain(..) {
            sub.cancel();
        }
        self.presence.set_active_conversation(None);
    }

    /// Route inbound session events to the components. Re-run on every
    /// connect because an explicit disconnect clears the session bus.
    fn wire(&self) {
        let mut wiring = self.wiring.lock();
        for sub in wiring.drain(..) {
            sub.cancel();
        }

        let rooms = self.rooms.clone();
        let presence = self.presence.clone();
        let synchronizer = self.synchronizer.clone();
        let sub = self.session.events().subscribe(move |event| {
            if let SessionEvent::Server(server_event) = event {
                match server_event {
                    ServerEvent::Authenticated { .. } => {
                        synchronizer.apply(server_event);
                        // Server-side room state did not survive the
                        // reconnect; joins go out before any later inbound
                        // event is dispatched.
                        rooms.rejoin_all();
                    }
                    ServerEvent::Typing(indicator) => presence.observe(indicator),
                    other => synchronizer.apply(other),
                }
            }
        });
        wiring.push(sub);
    }

    // ============= Conversations =============

    /// Hydrate a conversation's history, join its room, and scope typing
    /// indicators to it.
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<()> {
        let page = self
            .api
            .fetch_messages(conversation_id, 1, HYDRATION_PAGE_SIZE)
            .await?;
        self.synchronizer.hydrate_messages(conversation_id, page.items);
        self.rooms.join_conversation(conversation_id);
        self.presence.set_active_conversation(Some(conversation_id));
        Ok(())
    }

    pub fn close_conversation(&self, conversation_id: &str) {
        self.rooms.leave_conversation(conversation_id);
        self.presence.set_active_conversation(None);
    }

    /// Refresh the full conversation list from the HTTP API.
    pub async fn refresh_conversations(&self) -> Result<()> {
        let mut page_number = 1;
        loop {
            let page = self
                .api
                .fetch_conversations(page_number, HYDRATION_PAGE_SIZE)
                .await?;
            let more = page.has_more();
            self.synchronizer.hydrate_conversations(page.items);
            if !more {
                return Ok(());
            }
            page_number += 1;
        }
    }

    pub fn mark_conversation_read(&self, conversation_id: &str) {
        self.cache.clear_unread(conversation_id);
        self.session.emit(ClientEvent::MarkRead {
            conversation_id: conversation_id.to_string(),
        });
    }

    // ============= Messaging =============

    pub fn send_text(&self, recipient_id: &str, body: &str) {
        self.send_message(recipient_id, MessageContent::text(body), None);
    }

    /// Fire-and-forget send; the cache picks the message up when the server
    /// echoes it back with its assigned id.
    pub fn send_message(
        &self,
        recipient_id: &str,
        content: MessageContent,
        reply_to: Option<String>,
    ) {
        self.session.emit(ClientEvent::SendMessage {
            recipient_id: recipient_id.to_string(),
            content,
            reply_to,
            client_ref: uuid::Uuid::new_v4().to_string(),
        });
    }

    // ============= Presence & reactions =============

    pub fn start_typing(&self, conversation_id: &str) {
        self.presence.start_typing(conversation_id);
    }

    pub fn stop_typing(&self, conversation_id: &str) {
        self.presence.stop_typing(conversation_id);
    }

    pub fn update_status(&self, status: PresenceStatus) {
        self.presence.update_status(status);
    }

    pub fn typists(&self) -> Vec<TypingUser> {
        self.presence.typists()
    }

    pub fn add_reaction(&self, message_id: &str, emoji: &str, conversation_id: &str) {
        self.reactions.add_reaction(message_id, emoji, conversation_id);
    }

    pub fn remove_reaction(&self, message_id: &str, emoji: &str, conversation_id: &str) {
        self.reactions.remove_reaction(message_id, emoji, conversation_id);
    }

    // ============= Observation =============

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    pub fn on_connection_change<F>(&self, callback: F) -> Subscription<SessionEvent>
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.session.on_connection_change(callback)
    }

    pub fn events(&self) -> &EventBus<SessionEvent> {
        self.session.events()
    }

    pub fn cache(&self) -> &Arc<ChatCache> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tokio::sync::mpsc;

    fn client() -> MessagingClient {
        MessagingClient::new(ClientConfig::new("localhost", 9999, false)).unwrap()
    }

    fn participant(id: &str, role: UserRole) -> Participant {
        Participant {
            user_id: id.to_string(),
            display_name: id.to_string(),
            role,
            metadata: None,
        }
    }

    fn inbound_message(id: &str, conversation_id: &str) -> Message {
        Message {
            message_id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender: participant("adopter-1", UserRole::Adopter),
            recipient: participant("farmer-1", UserRole::Farmer),
            content: MessageContent::text("hi"),
            created_at: Utc.with_ymd_and_hms(2026, 8, 20, 10, 0, 0).unwrap(),
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

    #[tokio::test]
    async fn test_inbound_events_flow_into_cache() {
        let client = client();
        client.wire();

        let (tx, _rx) = mpsc::unbounded_channel();
        client.session.install_outbound(tx);
        client.session.set_state(ConnectionState::Connected);
        client.session.handle_event(ServerEvent::Authenticated {
            user_id: "farmer-1".to_string(),
        });

        client
            .session
            .handle_event(ServerEvent::Message(inbound_message("m1", "c1")));
        client
            .session
            .handle_event(ServerEvent::Message(inbound_message("m1", "c1")));

        let messages = client.cache().messages("c1");
        assert_eq!(messages.len(), 1);
        let conversation = client.cache().conversation("c1").unwrap();
        assert_eq!(conversation.unread_count, 1);
        assert_eq!(
            conversation.last_message.as_ref().unwrap().message_id,
            "m1"
        );
    }

    #[tokio::test]
    async fn test_memberships_reestablished_on_authenticated() {
        let client = client();
        client.wire();

        let (tx, mut rx) = mpsc::unbounded_channel();
        client.session.install_outbound(tx);
        client.session.set_state(ConnectionState::Connected);
        client.rooms.join_conversation("c1");
        while rx.try_recv().is_ok() {}

        // Simulated transport drop and reconnect.
        client.session.clear_outbound();
        client.session.set_state(ConnectionState::Disconnected);
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.session.install_outbound(tx);
        client.session.set_state(ConnectionState::Connected);
        client.session.handle_event(ServerEvent::Authenticated {
            user_id: "farmer-1".to_string(),
        });

        assert_eq!(
            rx.try_recv().unwrap(),
            ClientEvent::JoinRoom {
                conversation_id: "c1".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_sign_out_does_not_replay_memberships() {
        let client = client();
        client.wire();

        // First identity joins a room.
        let (tx, _rx) = mpsc::unbounded_channel();
        client.session.install_outbound(tx);
        client.session.set_state(ConnectionState::Connected);
        client.rooms.join_conversation("c1");
        assert!(client.rooms.is_joined("c1"));

        client.disconnect();
        assert!(!client.rooms.is_joined("c1"));

        // Second identity signs in; authenticating must not emit joins for
        // the previous identity's conversations.
        client.wire();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.session.install_outbound(tx);
        client.session.set_state(ConnectionState::Connected);
        client.session.handle_event(ServerEvent::Authenticated {
            user_id: "adopter-9".to_string(),
        });

        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(event, ClientEvent::JoinRoom { .. }),
                "stale membership replayed: {:?}",
                event
            );
        }
    }

    #[tokio::test]
    async fn test_typing_events_reach_tracker() {
        let client = client();
        client.wire();
        client.presence.set_active_conversation(Some("c1"));

        client.session.handle_event(ServerEvent::Typing(TypingIndicator {
            user_id: "adopter-1".to_string(),
            user_name: "Alex".to_string(),
            conversation_id: "c1".to_string(),
            is_typing: true,
        }));

        let typists = client.typists();
        assert_eq!(typists.len(), 1);
        assert_eq!(typists[0].user_id, "adopter-1");
    }

    #[tokio::test]
    async fn test_mark_read_clears_unread() {
        let client = client();
        client.wire();
        client.session.handle_event(ServerEvent::Authenticated {
            user_id: "farmer-1".to_string(),
        });
        client
            .session
            .handle_event(ServerEvent::Message(inbound_message("m1", "c1")));
        assert_eq!(client.cache().conversation("c1").unwrap().unread_count, 1);

        client.mark_conversation_read("c1");
        assert_eq!(client.cache().conversation("c1").unwrap().unread_count, 0);
    }
}
