//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                       ┌── RoomStore ── argon2 verifier
//!            ├── reader task ──► SessionEngine ── MembershipStore
//! Client B ──┘        │              └── MessageLog
//!                     │
//!              ConnectionRegistry ── per-connection outbound queue
//!                     │
//!              writer task per connection ──► WebSocket
//! ```
//!
//! One reader task and one writer task per connection. The reader decodes
//! envelopes and drives the session state machine; everything outbound goes
//! through the connection's bounded queue so the engine can enqueue frames
//! for many connections without ever awaiting a slow socket. A liveness
//! sweep pings all connections and reaps the silent ones.
//!
//! A panic while handling one connection is confined to that connection's
//! task — the accept loop and every other session keep running.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::api::RoomApi;
use crate::liveness::spawn_liveness_monitor;
use crate::protocol::{ClientEnvelope, ServerEnvelope};
use crate::registry::{ConnectionRegistry, Outbound};
use crate::session::{SessionEngine, SessionError, SessionState};
use crate::store::{MembershipStore, MessageLog, RoomStore};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frames buffered per connection before drops kick in
    pub outbound_capacity: usize,
    /// Liveness sweep interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Delay between notifying an evicted member and closing its socket
    pub rotation_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_capacity: 256,
            heartbeat_interval_secs: 30,
            rotation_grace_ms: 200,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_received: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub active_rooms: usize,
}

/// The relay server. Cloning shares the engine, stores and stats.
#[derive(Clone)]
pub struct ChatServer {
    config: ServerConfig,
    engine: Arc<SessionEngine>,
    api: RoomApi,
    stats: Arc<RwLock<ServerStats>>,
}

impl ChatServer {
    pub fn new(config: ServerConfig) -> Self {
        let rooms = RoomStore::new();
        let engine = Arc::new(SessionEngine::new(
            rooms.clone(),
            MembershipStore::new(),
            MessageLog::new(),
            ConnectionRegistry::new(),
            Duration::from_millis(config.rotation_grace_ms),
        ));
        let api = RoomApi::new(rooms);
        Self {
            config,
            engine,
            api,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// The room creation/verification boundary.
    pub fn api(&self) -> &RoomApi {
        &self.api
    }

    pub fn engine(&self) -> &Arc<SessionEngine> {
        &self.engine
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Snapshot of server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        let registry = self.engine.registry().stats().await;
        stats.frames_sent = registry.frames_sent;
        stats.frames_dropped = registry.frames_dropped;
        stats.active_rooms = self.engine.rooms().count().await;
        stats
    }

    /// Accept connections until the task is dropped. Also starts the
    /// liveness monitor.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);

        let _monitor = spawn_liveness_monitor(
            self.engine.clone(),
            Duration::from_secs(self.config.heartbeat_interval_secs),
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("new TCP connection from {addr}");

            let engine = self.engine.clone();
            let stats = self.stats.clone();
            let capacity = self.config.outbound_capacity;

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, engine, stats, capacity).await {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }
}

/// Drive one connection from accept to teardown.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    engine: Arc<SessionEngine>,
    stats: Arc<RwLock<ServerStats>>,
    outbound_capacity: usize,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (ws_writer, mut ws_reader) = ws_stream.split();
    log::debug!("WebSocket connection established from {addr}");

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let (out_tx, out_rx) = mpsc::channel::<Outbound>(outbound_capacity);
    let writer_task = tokio::spawn(write_loop(ws_writer, out_rx));

    let mut session = SessionState::Unauthenticated;

    while let Some(frame) = ws_reader.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                {
                    stats.write().await.frames_received += 1;
                }
                if dispatch_frame(&engine, &mut session, &out_tx, text.as_str()).await {
                    break;
                }
            }
            Ok(Message::Pong(_)) => {
                if let SessionState::Active { user_id, .. } = session {
                    engine.mark_alive(user_id).await;
                }
            }
            Ok(Message::Ping(data)) => {
                let _ = out_tx.try_send(Outbound::Pong(data.to_vec()));
            }
            Ok(Message::Close(_)) => {
                log::debug!("connection closed by {addr}");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                log::debug!("WebSocket error from {addr}: {e}");
                break;
            }
        }
    }

    // Transport gone (or session over): same teardown as an explicit leave.
    if let SessionState::Active { user_id, .. } = session {
        engine.teardown(user_id).await;
    }

    // All sender clones are released by teardown; dropping ours lets the
    // writer drain what is queued and exit.
    drop(out_tx);
    let _ = writer_task.await;

    stats.write().await.active_connections -= 1;
    log::debug!("connection from {addr} finished");
    Ok(())
}

/// Process one decoded-or-not text frame. Returns `true` when the
/// connection should stop reading (session over).
async fn dispatch_frame(
    engine: &SessionEngine,
    session: &mut SessionState,
    out_tx: &mpsc::Sender<Outbound>,
    raw: &str,
) -> bool {
    let envelope = match ClientEnvelope::decode(raw) {
        Ok(env) => env,
        Err(e) => {
            log::debug!("rejected frame: {e}");
            return report(
                out_tx,
                session,
                SessionError::Protocol("Unknown or malformed message type".into()),
            );
        }
    };

    match (envelope, *session) {
        (
            ClientEnvelope::JoinRoom {
                room_id,
                display_name,
                passphrase,
                user_id,
                is_admin,
            },
            SessionState::Unauthenticated,
        ) => {
            match engine
                .join(out_tx.clone(), room_id, display_name, &passphrase, user_id, is_admin)
                .await
            {
                Ok(user) => {
                    *session = SessionState::Active {
                        user_id: user.id,
                        room_id,
                    };
                    false
                }
                Err(err) => report(out_tx, session, err),
            }
        }
        (ClientEnvelope::JoinRoom { .. }, _) => report(
            out_tx,
            session,
            SessionError::Protocol("Already joined a room on this connection".into()),
        ),

        (
            ClientEnvelope::SendMessage {
                room_id,
                user_id,
                content,
            },
            SessionState::Active {
                user_id: session_user,
                ..
            },
        ) => match engine.send_chat(session_user, room_id, user_id, content).await {
            Ok(()) => false,
            Err(err) => report(out_tx, session, err),
        },

        (
            ClientEnvelope::ChangePassphrase {
                room_id,
                user_id,
                new_passphrase,
            },
            SessionState::Active {
                user_id: session_user,
                ..
            },
        ) => match engine
            .rotate_passphrase(session_user, room_id, user_id, &new_passphrase)
            .await
        {
            Ok(()) => false,
            Err(err) => report(out_tx, session, err),
        },

        (
            ClientEnvelope::LeaveRoom { room_id, user_id },
            SessionState::Active {
                user_id: session_user,
                room_id: session_room,
            },
        ) => {
            if user_id != session_user || room_id != session_room {
                return report(out_tx, session, SessionError::Unauthorized("Unauthorized"));
            }
            engine.teardown(session_user).await;
            *session = SessionState::Closed;
            let _ = out_tx.try_send(Outbound::Close);
            true
        }

        (_, SessionState::Unauthenticated) => report(
            out_tx,
            session,
            SessionError::Protocol("Join a room first".into()),
        ),
        (_, SessionState::Closed) => true,
    }
}

/// Report an engine error to the client; fatal errors end the session.
fn report(
    out_tx: &mpsc::Sender<Outbound>,
    session: &mut SessionState,
    err: SessionError,
) -> bool {
    if matches!(err, SessionError::Internal) {
        log::error!("internal error while processing envelope: {err}");
    }
    let fatal = err.is_fatal();
    send_error(out_tx, &err.to_string(), fatal);
    if fatal {
        *session = SessionState::Closed;
        let _ = out_tx.try_send(Outbound::Close);
    }
    fatal
}

fn send_error(out_tx: &mpsc::Sender<Outbound>, message: &str, fatal: bool) {
    if let Ok(frame) = ServerEnvelope::error(message, fatal).encode() {
        let _ = out_tx.try_send(Outbound::Frame(Arc::new(frame)));
    }
}

/// Forward the connection's outbound queue to its socket.
async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::Receiver<Outbound>,
) {
    while let Some(out) = rx.recv().await {
        let result = match out {
            Outbound::Frame(json) => sink.send(Message::text(String::from(json.as_str()))).await,
            Outbound::Ping => sink.send(Message::Ping(Vec::new().into())).await,
            Outbound::Pong(data) => sink.send(Message::Pong(data.into())).await,
            Outbound::Close => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        };
        if result.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.outbound_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.rotation_grace_ms, 200);
    }

    #[test]
    fn test_server_creation() {
        let server = ChatServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = ChatServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.frames_received, 0);
        assert_eq!(stats.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_api_and_engine_share_rooms() {
        let server = ChatServer::with_defaults();
        let created = server
            .api()
            .create(crate::api::CreateRoomRequest {
                room_name: "R1".into(),
                passphrase: "sesame1".into(),
                created_by: uuid::Uuid::new_v4(),
            })
            .await
            .unwrap();

        assert!(server.engine().rooms().get(created.room_id).await.is_some());
        assert_eq!(server.stats().await.active_rooms, 1);
    }
}
