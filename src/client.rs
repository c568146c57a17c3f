//! Protocol-level chat client.
//!
//! Thin client over the envelope protocol: connect, join, send, rotate,
//! leave, and a channel of decoded server events. The integration tests are
//! built on it; it performs no encryption itself — callers hand it opaque
//! content strings.
//!
//! There is no reconnect logic on purpose: a dropped session is discarded
//! and a new client connection performs a fresh join.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{
    ClientEnvelope, ProtocolError, RosterEntry, ServerEnvelope, WireMessage,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Decoded server pushes, in arrival order.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Connection established
    Connected,
    /// Connection lost (server close, eviction, or network error)
    Disconnected,
    /// A relayed message (live or history replay)
    Message(WireMessage),
    /// A peer joined the room
    UserJoined { user_id: Uuid, display_name: String },
    /// A peer left the room
    UserLeft { user_id: Uuid, display_name: String },
    /// Fresh membership roster
    Roster(Vec<RosterEntry>),
    /// History was purged — drop local cache
    HistoryCleared,
    /// Evicted by a passphrase rotation; rejoin with the new passphrase
    PassphraseChanged,
    /// Error report from the server
    ServerError { message: String, fatal: bool },
}

/// The chat client.
pub struct ChatClient {
    user_id: Uuid,
    display_name: String,
    server_url: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<ClientEnvelope>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl ChatClient {
    /// Create a client with a fresh client-generated identity.
    pub fn new(display_name: impl Into<String>, server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user_id: Uuid::new_v4(),
            display_name: display_name.into(),
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Connect and spawn the reader/writer tasks.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.server_url)
            .await
            .map_err(|e| {
                log::debug!("connect to {} failed: {e}", self.server_url);
                ProtocolError::ConnectionClosed
            })?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<ClientEnvelope>(64);
        self.outgoing_tx = Some(out_tx);

        // Writer: envelopes → text frames.
        tokio::spawn(async move {
            while let Some(envelope) = out_rx.recv().await {
                let json = match envelope.encode() {
                    Ok(json) => json,
                    Err(e) => {
                        log::error!("failed to encode envelope: {e}");
                        continue;
                    }
                };
                if ws_writer.send(Message::text(json)).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        // Reader: frames → events. WebSocket pings are answered by the
        // stream itself.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => match ServerEnvelope::decode(text.as_str()) {
                        Ok(envelope) => {
                            let _ = event_tx.send(to_event(envelope)).await;
                        }
                        Err(e) => log::warn!("undecodable server frame: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;
        Ok(())
    }

    /// Join a room with this client's identity.
    pub async fn join(
        &self,
        room_id: Uuid,
        passphrase: impl Into<String>,
        is_admin: bool,
    ) -> Result<(), ProtocolError> {
        self.send(ClientEnvelope::JoinRoom {
            room_id,
            display_name: self.display_name.clone(),
            passphrase: passphrase.into(),
            user_id: self.user_id,
            is_admin,
        })
        .await
    }

    /// Send an opaque message to the room.
    pub async fn send_chat(
        &self,
        room_id: Uuid,
        content: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        self.send(ClientEnvelope::SendMessage {
            room_id,
            user_id: self.user_id,
            content: content.into(),
        })
        .await
    }

    /// Rotate the room passphrase (admin sessions only).
    pub async fn change_passphrase(
        &self,
        room_id: Uuid,
        new_passphrase: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        self.send(ClientEnvelope::ChangePassphrase {
            room_id,
            user_id: self.user_id,
            new_passphrase: new_passphrase.into(),
        })
        .await
    }

    /// Leave the room. The server tears the session down and closes the
    /// connection.
    pub async fn leave(&self, room_id: Uuid) -> Result<(), ProtocolError> {
        self.send(ClientEnvelope::LeaveRoom {
            room_id,
            user_id: self.user_id,
        })
        .await
    }

    async fn send(&self, envelope: ClientEnvelope) -> Result<(), ProtocolError> {
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(envelope)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }
}

fn to_event(envelope: ServerEnvelope) -> ClientEvent {
    match envelope {
        ServerEnvelope::MessageBroadcast(message) => ClientEvent::Message(message),
        ServerEnvelope::UserJoined {
            user_id,
            display_name,
        } => ClientEvent::UserJoined {
            user_id,
            display_name,
        },
        ServerEnvelope::UserLeft {
            user_id,
            display_name,
        } => ClientEvent::UserLeft {
            user_id,
            display_name,
        },
        ServerEnvelope::UserListUpdate { users } => ClientEvent::Roster(users),
        ServerEnvelope::ClearHistory => ClientEvent::HistoryCleared,
        ServerEnvelope::PassphraseChanged => ClientEvent::PassphraseChanged,
        ServerEnvelope::Error { message, fatal } => ClientEvent::ServerError { message, fatal },
    }
}
