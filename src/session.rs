//! Transport session: one physical WebSocket connection per client process
//!
//! The session owns the connection lifecycle: handshake, reconnection with
//! exponential backoff, and dispatch of inbound frames onto the typed event
//! bus. Inbound frames are dispatched sequentially from the read loop, so
//! subscribers never observe events for one connection out of order.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::bus::{EventBus, Subscription};
use crate::config::ClientConfig;
use crate::protocol::{ClientEvent, ServerEvent};

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Unauthorized,
}

impl ConnectionState {
    fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Authenticated)
    }
}

/// Everything observable about the session: transport transitions, dial
/// failures, and inbound server events.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    ConnectError { reason: String },
    Server(ServerEvent),
}

pub struct Session {
    config: ClientConfig,
    state: Mutex<ConnectionState>,
    token: Mutex<Option<String>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientEvent>>>,
    events: EventBus<SessionEvent>,
    /// Bumped on explicit disconnect (and fatal auth rejection) so a stale
    /// supervisor task stops retrying.
    generation: AtomicU64,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            token: Mutex::new(None),
            outbound: Mutex::new(None),
            events: EventBus::new(),
            generation: AtomicU64::new(0),
            supervisor: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn events(&self) -> &EventBus<SessionEvent> {
        &self.events
    }

    /// Boolean connection indicator for UI consumers. Fires on every
    /// transition into or out of the connected states.
    pub fn on_connection_change<F>(&self, callback: F) -> Subscription<SessionEvent>
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.events.subscribe(move |event| match event {
            SessionEvent::Connected => callback(true),
            SessionEvent::Disconnected => callback(false),
            _ => {}
        })
    }

    /// Start (or restart) the transport. Idempotent while a connection
    /// attempt for the same token is already underway or established.
    pub fn connect(self: &Arc<Self>, token: &str) {
        {
            let state = *self.state.lock();
            let same_token = self.token.lock().as_deref() == Some(token);
            if same_token
                && matches!(
                    state,
                    ConnectionState::Connecting
                        | ConnectionState::Connected
                        | ConnectionState::Authenticated
                )
            {
                tracing::debug!("connect ignored, transport already active for this token");
                return;
            }
        }

        self.shutdown_transport();
        *self.token.lock() = Some(token.to_string());

        let generation = self.generation.load(Ordering::SeqCst);
        let handle = tokio::spawn(Self::run(self.clone(), token.to_string(), generation));
        *self.supervisor.lock() = Some(handle);
    }

    /// Tear down the transport and clear every registered listener. Room
    /// memberships are released implicitly when the channel closes.
    pub fn disconnect(&self) {
        self.shutdown_transport();
        self.set_state(ConnectionState::Disconnected);
        self.events.clear();
        tracing::info!("session disconnected");
    }

    /// Fire-and-forget send. Intents while disconnected are dropped, never
    /// queued, so nothing stale replays after a reconnect.
    pub fn emit(&self, event: ClientEvent) {
        if !self.is_connected() {
            tracing::debug!(?event, "emit dropped while disconnected");
            return;
        }
        if let Some(tx) = self.outbound.lock().as_ref() {
            let _ = tx.send(event);
        }
    }

    fn shutdown_transport(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
        self.clear_outbound();
    }

    pub(crate) fn install_outbound(&self, tx: mpsc::UnboundedSender<ClientEvent>) {
        *self.outbound.lock() = Some(tx);
    }

    pub(crate) fn clear_outbound(&self) {
        *self.outbound.lock() = None;
    }

    pub(crate) fn set_state(&self, next: ConnectionState) {
        let prev = std::mem::replace(&mut *self.state.lock(), next);
        if !prev.is_connected() && next.is_connected() {
            self.events.publish(&SessionEvent::Connected);
        } else if prev.is_connected() && !next.is_connected() {
            self.events.publish(&SessionEvent::Disconnected);
        }
    }

    /// Dispatch one inbound frame. Returns false when the connection must be
    /// abandoned (fatal auth rejection).
    pub(crate) fn handle_event(&self, event: ServerEvent) -> bool {
        let keep_open = match &event {
            ServerEvent::Authenticated { user_id } => {
                tracing::info!("session authenticated as {}", user_id);
                self.set_state(ConnectionState::Authenticated);
                true
            }
            ServerEvent::Unauthorized { reason } => {
                tracing::warn!("server rejected session: {}", reason);
                self.generation.fetch_add(1, Ordering::SeqCst);
                self.clear_outbound();
                self.set_state(ConnectionState::Unauthorized);
                false
            }
            _ => true,
        };
        self.events.publish(&SessionEvent::Server(event));
        keep_open
    }

    async fn run(session: Arc<Session>, token: String, generation: u64) {
        let url = session.config.ws_url();

        // The handshake is identical for every attempt; encode it once so a
        // failure cannot strand the state machine mid-connect.
        let handshake = match serde_json::to_string(&ClientEvent::Authenticate { token }) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("failed to encode handshake: {}", e);
                session.set_state(ConnectionState::Disconnected);
                return;
            }
        };

        let mut backoff = INITIAL_BACKOFF;

        loop {
            if session.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            session.set_state(ConnectionState::Connecting);

            match connect_async(url.as_str()).await {
                Ok((stream, _)) => {
                    backoff = INITIAL_BACKOFF;
                    let (mut write, mut read) = stream.split();

                    // Handshake goes out before anything else on this channel.
                    if write.send(WsMessage::Text(handshake.clone())).await.is_err() {
                        session.events.publish(&SessionEvent::ConnectError {
                            reason: "handshake write failed".to_string(),
                        });
                    } else {
                        let (tx, mut rx) = mpsc::unbounded_channel::<ClientEvent>();
                        session.install_outbound(tx);
                        session.set_state(ConnectionState::Connected);
                        tracing::info!("transport connected to {}", url);

                        let writer = tokio::spawn(async move {
                            while let Some(event) = rx.recv().await {
                                match serde_json::to_string(&event) {
                                    Ok(text) => {
                                        if write.send(WsMessage::Text(text)).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!("failed to encode outbound frame: {}", e)
                                    }
                                }
                            }
                        });

                        while let Some(frame) = read.next().await {
                            match frame {
                                Ok(WsMessage::Text(text)) => {
                                    match serde_json::from_str::<ServerEvent>(&text) {
                                        Ok(event) => {
                                            if !session.handle_event(event) {
                                                break;
                                            }
                                        }
                                        Err(e) => {
                                            tracing::warn!("unparseable inbound frame: {}", e)
                                        }
                                    }
                                }
                                Ok(WsMessage::Close(_)) => break,
                                Err(e) => {
                                    tracing::warn!("transport error: {}", e);
                                    break;
                                }
                                _ => {}
                            }
                        }

                        session.clear_outbound();
                        writer.abort();

                        if session.generation.load(Ordering::SeqCst) != generation {
                            // Explicit disconnect or fatal rejection already
                            // set the terminal state.
                            return;
                        }
                        session.set_state(ConnectionState::Disconnected);
                        tracing::info!("transport dropped, retrying in {:?}", backoff);
                    }
                }
                Err(e) => {
                    tracing::warn!("connect failed: {}", e);
                    session.set_state(ConnectionState::Disconnected);
                    session.events.publish(&SessionEvent::ConnectError {
                        reason: e.to_string(),
                    });
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Arc<Session> {
        Session::new(ClientConfig::new("localhost", 9999, false))
    }

    #[test]
    fn test_emit_dropped_while_disconnected() {
        let session = session();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.install_outbound(tx);

        session.emit(ClientEvent::TypingStart {
            conversation_id: "c1".to_string(),
        });
        assert!(rx.try_recv().is_err());

        session.set_state(ConnectionState::Connected);
        session.emit(ClientEvent::TypingStart {
            conversation_id: "c1".to_string(),
        });
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_unauthorized_is_fatal() {
        let session = session();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.install_outbound(tx);
        session.set_state(ConnectionState::Connected);

        let keep_open = session.handle_event(ServerEvent::Unauthorized {
            reason: "token expired".to_string(),
        });
        assert!(!keep_open);
        assert_eq!(session.state(), ConnectionState::Unauthorized);
        assert!(!session.is_connected());

        // No further emits until a fresh connect.
        session.emit(ClientEvent::MarkRead {
            conversation_id: "c1".to_string(),
        });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_connection_change_callbacks() {
        let session = session();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_cb = seen.clone();
        let sub = session.on_connection_change(move |up| seen_cb.lock().push(up));

        session.set_state(ConnectionState::Connected);
        // Promotion stays within the connected states, no transition fires.
        session.set_state(ConnectionState::Authenticated);
        session.set_state(ConnectionState::Disconnected);
        assert_eq!(*seen.lock(), vec![true, false]);

        sub.cancel();
        session.set_state(ConnectionState::Connected);
        assert_eq!(*seen.lock(), vec![true, false]);
    }

    #[test]
    fn test_handshake_frame_encodes() {
        // The supervisor bails out to Disconnected if this ever fails.
        let text = serde_json::to_string(&ClientEvent::Authenticate {
            token: "token-123".to_string(),
        })
        .unwrap();
        let json: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(json["type"], "authenticate");
        assert_eq!(json["payload"]["token"], "token-123");
    }

    #[test]
    fn test_authenticated_promotes_state() {
        let session = session();
        session.set_state(ConnectionState::Connected);
        let keep_open = session.handle_event(ServerEvent::Authenticated {
            user_id: "farmer-1".to_string(),
        });
        assert!(keep_open);
        assert_eq!(session.state(), ConnectionState::Authenticated);
    }
}
