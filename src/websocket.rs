//! WebSocket handler for realtime coordination.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{sink::SinkExt, stream::StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth;
use crate::chats::ChatCoordinator;
use crate::config::ServerConfig;
use crate::events::{ClientMessage, ConnId, RoomId, ServerEvent, UserId};
use crate::presence::PresenceRegistry;
use crate::rooms::RoomRouter;
use crate::signaling::CallRelay;
use sqlx::{Pool, Sqlite};

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

/// Simple token-bucket rate limiter (not shared across threads)
struct RateLimiter {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: std::time::Instant,
}

impl RateLimiter {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate,
            last_refill: std::time::Instant::now(),
        }
    }

    /// Try to consume one token. Returns false if rate limit exceeded.
    fn try_consume(&mut self) -> bool {
        let now = std::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Per-connection state
// ---------------------------------------------------------------------------

struct Connection {
    id: ConnId,
    /// Attached after a successful setup.
    user: Option<UserId>,
    tx: mpsc::Sender<Vec<u8>>,
    /// General message rate limiter (30 burst, 10/s refill); typing traffic
    /// is exempt as the hot path.
    rate_limiter: RateLimiter,
}

// ---------------------------------------------------------------------------
// Server state
// ---------------------------------------------------------------------------

/// Server state shared across connections
pub struct ServerState {
    pub db_pool: Pool<Sqlite>,
    pub config: ServerConfig,
    pub presence: Arc<PresenceRegistry>,
    pub rooms: Arc<RoomRouter>,
    pub coordinator: ChatCoordinator,
    pub relay: CallRelay,
    /// Current total connection count (for enforcing max_connections)
    connection_count: AtomicUsize,
    /// Per-IP connection counts (for enforcing max_connections_per_ip)
    ip_connections: dashmap::DashMap<std::net::IpAddr, AtomicUsize>,
}

impl ServerState {
    pub fn new(db_pool: Pool<Sqlite>, config: ServerConfig) -> Self {
        let presence = Arc::new(PresenceRegistry::new());
        let rooms = Arc::new(RoomRouter::new());
        let coordinator = ChatCoordinator::new(
            db_pool.clone(),
            presence.clone(),
            rooms.clone(),
            rooms.clone(),
        );
        let relay = CallRelay::new(presence.clone(), rooms.clone());
        Self {
            db_pool,
            config,
            presence,
            rooms,
            coordinator,
            relay,
            connection_count: AtomicUsize::new(0),
            ip_connections: dashmap::DashMap::new(),
        }
    }

    /// Try to acquire a connection slot. Returns false if limits are exceeded.
    fn try_acquire_connection(&self, ip: std::net::IpAddr) -> bool {
        let max_global = self.config.max_connections;
        let max_per_ip = self.config.max_connections_per_ip;

        // Check global limit (0 = unlimited)
        if max_global > 0 && self.connection_count.load(Ordering::Relaxed) >= max_global {
            return false;
        }

        // Check per-IP limit (0 = unlimited)
        if max_per_ip > 0 {
            let entry = self.ip_connections.entry(ip).or_insert_with(|| AtomicUsize::new(0));
            if entry.value().load(Ordering::Relaxed) >= max_per_ip {
                return false;
            }
            entry.value().fetch_add(1, Ordering::Relaxed);
        }

        self.connection_count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Release a connection slot.
    fn release_connection(&self, ip: std::net::IpAddr) {
        self.connection_count.fetch_sub(1, Ordering::Relaxed);
        if let Some(entry) = self.ip_connections.get(&ip) {
            let prev = entry.value().fetch_sub(1, Ordering::Relaxed);
            if prev <= 1 {
                drop(entry);
                self.ip_connections.remove(&ip);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket upgrade handler
// ---------------------------------------------------------------------------

/// Handle WebSocket upgrade — enforces connection limits before accepting
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    let ip = addr.ip();

    if !state.try_acquire_connection(ip) {
        warn!("Connection rejected for {}: limit exceeded", ip);
        return axum::http::StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
        .into_response()
}

// ---------------------------------------------------------------------------
// Socket lifecycle
// ---------------------------------------------------------------------------

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>, addr: SocketAddr) {
    let ip = addr.ip();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(64);

    let mut conn = Connection {
        id: Uuid::new_v4(),
        user: None,
        tx: tx.clone(),
        rate_limiter: RateLimiter::new(30.0, 10.0),
    };
    state.rooms.register_connection(conn.id, tx.clone());

    info!("New WebSocket connection {} from {}", conn.id, addr);

    // Forward outbound frames + send periodic pings
    let ping_interval_secs = state.config.ws_ping_interval;
    let forward_task = tokio::spawn(async move {
        let mut ping_ticker =
            tokio::time::interval(std::time::Duration::from_secs(ping_interval_secs));
        ping_ticker.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(data) => {
                            if ws_sender.send(Message::Binary(data)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_ticker.tick() => {
                    if ws_sender.send(Message::Ping(vec![])).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Setup deadline — a socket that never attaches an identity is dropped
    let setup_timeout = std::time::Duration::from_secs(state.config.setup_timeout_seconds);
    let setup_deadline = tokio::time::Instant::now() + setup_timeout;

    // Main receive loop
    loop {
        let next_msg = if conn.user.is_none() {
            match tokio::time::timeout_at(setup_deadline, ws_receiver.next()).await {
                Ok(msg) => msg,
                Err(_) => {
                    warn!("Setup timeout for {} — dropping connection", addr);
                    break;
                }
            }
        } else {
            ws_receiver.next().await
        };

        match next_msg {
            Some(Ok(msg)) => match msg {
                Message::Binary(data) => {
                    if let Err(e) = handle_frame(&data, &mut conn, &state).await {
                        // Log the full error for server-side debugging but
                        // send a generic message to the client to avoid
                        // leaking internal details.
                        error!("Error handling message from {}: {}", addr, e);
                        let frame = ServerEvent::Error { message: "Request failed".into() }.encode();
                        let _ = tx.send(frame).await;
                    }
                }
                Message::Text(_) => { /* ignore text frames */ }
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => { /* axum auto-responds to pings */ }
            },
            Some(Err(e)) => {
                debug!("WebSocket error from {}: {}", addr, e);
                break;
            }
            None => break,
        }
    }

    // Cleanup runs before any further event could target this connection:
    // room memberships first, then presence, then the announcement.
    state.rooms.unregister_connection(conn.id);
    if let Some(ref user) = conn.user {
        state.presence.unregister(conn.id);
        state
            .rooms
            .broadcast_all(&ServerEvent::OnlineIdentities {
                users: state.presence.online_users(),
            })
            .await;
        info!("User {} disconnected ({})", user, addr);
    }

    state.release_connection(ip);
    forward_task.abort();
}

// ---------------------------------------------------------------------------
// Inbound dispatch
// ---------------------------------------------------------------------------

async fn handle_frame(
    data: &[u8],
    conn: &mut Connection,
    state: &Arc<ServerState>,
) -> anyhow::Result<()> {
    if data.len() > state.config.max_message_size {
        anyhow::bail!("Message too large");
    }

    let msg: ClientMessage = rmp_serde::from_slice(data)?;

    // Rate limit everything except the typing hot path
    if !matches!(msg, ClientMessage::Typing { .. } | ClientMessage::StopTyping { .. })
        && !conn.rate_limiter.try_consume()
    {
        anyhow::bail!("Rate limit exceeded — slow down");
    }

    match msg {
        ClientMessage::Setup { token } => handle_setup(&token, conn, state).await,
        ClientMessage::JoinRoom { room_id } => handle_join_room(&room_id, conn, state).await,
        ClientMessage::Typing { room_id } => {
            let user = require_setup(conn)?;
            let room = RoomId::chat(&room_id);
            if state.rooms.is_member(conn.id, &room) {
                debug!("{} typing in {}", user, room_id);
                state
                    .rooms
                    .broadcast(&room, &ServerEvent::Typing { room_id }, Some(conn.id))
                    .await;
            }
            Ok(())
        }
        ClientMessage::StopTyping { room_id } => {
            require_setup(conn)?;
            let room = RoomId::chat(&room_id);
            if state.rooms.is_member(conn.id, &room) {
                state
                    .rooms
                    .broadcast(&room, &ServerEvent::StopTyping { room_id }, Some(conn.id))
                    .await;
            }
            Ok(())
        }
        ClientMessage::CallInitiate { target, signal, caller_name, call_type } => {
            let user = require_setup(conn)?.clone();
            state.relay.call_initiate(&user, &target, signal, caller_name, call_type).await;
            Ok(())
        }
        ClientMessage::CallAccept { target, signal } => {
            let user = require_setup(conn)?.clone();
            state.relay.call_accept(&user, &target, signal).await;
            Ok(())
        }
        ClientMessage::Signal { target, signal } => {
            let user = require_setup(conn)?.clone();
            state.relay.signal(&user, &target, signal).await;
            Ok(())
        }
        ClientMessage::CallEnd { target } => {
            let user = require_setup(conn)?.clone();
            state.relay.call_end(&user, &target).await;
            Ok(())
        }
    }
}

/// Require the connection to have completed setup, returning the identity.
fn require_setup(conn: &Connection) -> anyhow::Result<&UserId> {
    conn.user.as_ref().ok_or_else(|| anyhow::anyhow!("Setup not completed"))
}

/// Attach an identity: resolve the bearer credential, register presence,
/// join the personal room, ack, then announce the new online list.
async fn handle_setup(
    token: &str,
    conn: &mut Connection,
    state: &Arc<ServerState>,
) -> anyhow::Result<()> {
    let user = match auth::resolve_token(&state.db_pool, token).await? {
        Some(user) => user,
        None => {
            let frame = ServerEvent::Error { message: "Authentication failed".into() }.encode();
            let _ = conn.tx.send(frame).await;
            return Ok(());
        }
    };

    // Re-setup under a different identity: detach from the previous
    // personal room so this connection stops hearing that user's
    // notifications. Presence moves the connection on register.
    if let Some(previous) = conn.user.take() {
        if previous != user {
            state.rooms.leave(conn.id, &RoomId::user(&previous));
        }
    }

    conn.user = Some(user.clone());
    state.presence.register(&user, conn.id);
    state.rooms.join(conn.id, RoomId::user(&user));

    let ack = ServerEvent::Connected { user_id: user.clone() }.encode();
    conn.tx.send(ack).await?;

    state
        .rooms
        .broadcast_all(&ServerEvent::OnlineIdentities {
            users: state.presence.online_users(),
        })
        .await;

    info!("User {} authenticated on connection {}", user, conn.id);
    Ok(())
}

/// Join a conversation room, after re-checking persisted membership so a
/// connection cannot listen in on a conversation it does not belong to.
async fn handle_join_room(
    room_id: &str,
    conn: &Connection,
    state: &Arc<ServerState>,
) -> anyhow::Result<()> {
    let user = require_setup(conn)?;

    if !state.coordinator.is_chat_member(user, room_id).await? {
        anyhow::bail!("Not a member of this conversation");
    }

    state.rooms.join(conn.id, RoomId::chat(room_id));
    debug!("Connection {} joined room {}", conn.id, room_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database;

    fn test_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            database_url: ":memory:".to_string(),
            max_message_size: 65536,
            ws_ping_interval: 30,
            setup_timeout_seconds: 10,
            max_connections: 0,
            max_connections_per_ip: 0,
            cors_origins: None,
            admin_token: None,
        }
    }

    async fn test_state() -> Arc<ServerState> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect(":memory:")
            .await
            .expect("Failed to create test database");
        database::run_migrations(&pool).await.unwrap();
        Arc::new(ServerState::new(pool, test_config()))
    }

    #[tokio::test]
    async fn re_setup_detaches_the_previous_personal_room() {
        let state = test_state().await;
        database::upsert_user(&state.db_pool, "alice", "Alice").await.unwrap();
        database::upsert_user(&state.db_pool, "bob", "Bob").await.unwrap();
        database::create_session(&state.db_pool, "tok-a", "alice").await.unwrap();
        database::create_session(&state.db_pool, "tok-b", "bob").await.unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        let mut conn = Connection {
            id: Uuid::new_v4(),
            user: None,
            tx,
            rate_limiter: RateLimiter::new(30.0, 10.0),
        };
        state.rooms.register_connection(conn.id, conn.tx.clone());

        handle_setup("tok-a", &mut conn, &state).await.unwrap();
        assert!(state.rooms.is_member(conn.id, &RoomId::user("alice")));

        handle_setup("tok-b", &mut conn, &state).await.unwrap();
        assert_eq!(conn.user.as_deref(), Some("bob"));
        assert!(!state.rooms.is_member(conn.id, &RoomId::user("alice")));
        assert!(state.rooms.is_member(conn.id, &RoomId::user("bob")));
        assert!(!state.presence.is_online(&"alice".to_string()));
        assert!(state.presence.is_online(&"bob".to_string()));

        // Notifications aimed at the previous identity no longer arrive.
        while rx.try_recv().is_ok() {}
        state
            .rooms
            .broadcast(
                &RoomId::user("alice"),
                &ServerEvent::CallEnded { from: "carol".into() },
                None,
            )
            .await;
        assert!(rx.try_recv().is_err());
    }
}
