//! WebSocket sync server with board-based room routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── Room (board_id) ── BoardDocument ── broadcast fan-out
//! Client B ──┘         │
//!                      ├── PresenceTable (ephemeral awareness)
//!                      │
//!                      └── SnapshotStore (RocksDB)
//!                              └── Snapshots (LZ4, retained per policy)
//! ```
//!
//! Connections arrive on `ws://host/board:<board_id>` and are verified
//! before the WebSocket upgrade completes: a bad token or unknown board is
//! rejected with a plain HTTP status (401/403/404) and never touches a
//! room. After the upgrade the client announces itself with `PeerJoined`,
//! receives the full board state, the current roster, and everyone's
//! awareness, and from then on exchanges live deltas. Deltas merge into
//! the room's authoritative replica before fan-out, so the room can apply
//! its snapshot triggers and late joiners always catch up from one place.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{MessageType, PeerInfo, SyncMessage};
use crate::room::{Room, RoomRegistry, SnapshotPolicy};
use crate::store::{Snapshot, SnapshotStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum peers per room
    pub max_peers_per_room: usize,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Heartbeat interval in seconds (clients ping on this cadence)
    pub heartbeat_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// When boards are snapshotted and how many snapshots are kept
    pub snapshot_policy: SnapshotPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
            snapshot_policy: SnapshotPolicy::default(),
        }
    }
}

impl ServerConfig {
    /// Config for tests: OS-assigned port, aggressive snapshot policy.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            max_peers_per_room: 8,
            broadcast_capacity: 64,
            heartbeat_interval_secs: 5,
            storage_path: None,
            snapshot_policy: SnapshotPolicy::for_testing(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
    pub snapshots_saved: u64,
}

// ─── Connection verification ────────────────────────────────────────

/// What the verifier sees about an incoming connection, before the
/// WebSocket upgrade completes.
#[derive(Debug)]
pub struct ConnectRequest<'a> {
    pub board_id: Uuid,
    /// `token` query parameter, if the client sent one
    pub token: Option<&'a str>,
    pub path: &'a str,
}

/// Identity attached to a verified connection.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub display_name: String,
}

/// Why a connection was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    /// No usable credentials → 401
    Unauthenticated,
    /// Credentials valid but not allowed on this board → 403
    Forbidden,
    /// The board does not exist for this caller → 404
    NotFound,
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden => StatusCode::FORBIDDEN,
            AuthError::NotFound => StatusCode::NOT_FOUND,
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Unauthenticated => write!(f, "Unauthenticated"),
            AuthError::Forbidden => write!(f, "Forbidden"),
            AuthError::NotFound => write!(f, "Board not found"),
        }
    }
}

impl std::error::Error for AuthError {}

/// Hook for deployments to plug their own access control in. Runs inside
/// the HTTP upgrade, so it must not block.
pub trait ConnectionVerifier: Send + Sync {
    fn verify(&self, request: &ConnectRequest<'_>) -> Result<AuthContext, AuthError>;
}

/// Verifier that lets everyone in as an anonymous user. The default for
/// local development and tests.
pub struct AllowAll;

impl ConnectionVerifier for AllowAll {
    fn verify(&self, _request: &ConnectRequest<'_>) -> Result<AuthContext, AuthError> {
        Ok(AuthContext {
            user_id: "anonymous".to_string(),
            display_name: "Anonymous".to_string(),
        })
    }
}

// ─── Server ─────────────────────────────────────────────────────────

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    /// Live rooms: board_id → authoritative replica + fan-out
    registry: Arc<RoomRegistry>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
    /// Persistent snapshot store (optional)
    store: Option<Arc<SnapshotStore>>,
    /// Access control at the upgrade boundary
    verifier: Arc<dyn ConnectionVerifier>,
    /// Periodic snapshot task, stopped on shutdown
    timer: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SyncServer {
    /// Create a new sync server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_verifier(config, Arc::new(AllowAll))
    }

    /// Create a sync server with a custom connection verifier.
    pub fn with_verifier(config: ServerConfig, verifier: Arc<dyn ConnectionVerifier>) -> Self {
        // Open persistent storage if configured
        let store = config.storage_path.as_ref().map(|path| {
            let store_config = StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            };
            Arc::new(SnapshotStore::open(store_config).expect("Failed to open snapshot store"))
        });

        let registry = Arc::new(RoomRegistry::new(
            config.broadcast_capacity,
            config.snapshot_policy.clone(),
            store.clone(),
        ));

        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            store,
            verifier,
            timer: Mutex::new(None),
        }
    }

    /// Create with default configuration (in-memory, no persistence).
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let config = ServerConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..ServerConfig::default()
        };
        Self::new(config)
    }

    /// Pre-open a room for every persisted board.
    ///
    /// Boards restore lazily on first connect either way; recovery just
    /// warms them up front so the first join after a restart is instant.
    pub async fn recover(&self) -> Result<usize, Box<dyn std::error::Error>> {
        let store = match &self.store {
            Some(s) => s,
            None => return Ok(0),
        };

        let board_ids = store.list_boards()?;
        let mut recovered = 0;
        for board_id in &board_ids {
            match self.registry.open_room(*board_id).await {
                Ok(_) => {
                    recovered += 1;
                    log::info!("Recovered board {board_id} from storage");
                }
                Err(e) => log::error!("Failed to recover board {board_id}: {e}"),
            }
        }

        log::info!("Recovery complete: {recovered}/{} boards restored", board_ids.len());
        Ok(recovered)
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the accept loop and the snapshot timer. Call from an
    /// async runtime; it only returns on a listener error.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        // Periodic snapshot pass over every live room
        let timer_registry = self.registry.clone();
        let timer_stats = self.stats.clone();
        let timer_interval = self.config.snapshot_policy.timer_interval;
        let timer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(timer_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let saved = timer_registry.snapshot_pass().await;
                if saved > 0 {
                    timer_stats.write().await.snapshots_saved += saved as u64;
                    log::debug!("Snapshot timer persisted {saved} boards");
                }
            }
        });
        if let Some(old) = self.timer.lock().await.replace(timer) {
            old.abort();
        }

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            let verifier = self.verifier.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, registry, stats, config, verifier).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
        verifier: Arc<dyn ConnectionVerifier>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Route and verify during the HTTP upgrade; rejections go out as
        // plain status codes before any sync state exists
        let mut route: Option<(Uuid, AuthContext)> = None;
        let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            let path = req.uri().path();
            let Some(board_id) = parse_board_path(path) else {
                log::warn!("Rejected {addr}: unrecognized path {path:?}");
                return Err(reject(StatusCode::NOT_FOUND, "unknown board path"));
            };
            let token = extract_token(req);
            match verifier.verify(&ConnectRequest { board_id, token, path }) {
                Ok(auth) => {
                    route = Some((board_id, auth));
                    Ok(resp)
                }
                Err(e) => {
                    log::warn!("Rejected {addr} for board {board_id}: {e}");
                    Err(reject(e.status(), &e.to_string()))
                }
            }
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            // Rejection response already sent and logged
            Err(tokio_tungstenite::tungstenite::Error::Http(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let (board_id, auth) = route.ok_or("upgrade completed without a route")?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr} for board {board_id}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // State for this connection. The relay runs in its own block so
        // the cleanup below sees it even when a send fails mid-session.
        let mut peer_id: Option<Uuid> = None;
        let mut room: Option<Arc<Room>> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        let session: Result<(), Box<dyn std::error::Error + Send + Sync>> = async {
            loop {
                tokio::select! {
                    // Incoming WebSocket message
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                let sync_msg = match SyncMessage::decode(&bytes) {
                                    Ok(m) => m,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        continue;
                                    }
                                };

                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }

                                match sync_msg.msg_type {
                                    MessageType::PeerJoined => {
                                        if room.is_some() {
                                            log::debug!("Duplicate join from {addr} ignored");
                                            continue;
                                        }

                                        let info = sync_msg.peer_info().unwrap_or_else(|_| {
                                            PeerInfo::with_id(
                                                sync_msg.peer_id,
                                                auth.user_id.clone(),
                                                auth.display_name.clone(),
                                            )
                                        });
                                        peer_id = Some(info.peer_id);

                                        // A room can close between lookup and join;
                                        // reopening yields its replacement
                                        let joined = loop {
                                            let candidate = registry.open_room(board_id).await?;
                                            if candidate.peer_count().await >= config.max_peers_per_room {
                                                log::warn!(
                                                    "Board {board_id} full ({} peers); refusing {addr}",
                                                    config.max_peers_per_room
                                                );
                                                break None;
                                            }
                                            if let Some(rx) = candidate.join(info.clone()).await {
                                                break Some((candidate, rx));
                                            }
                                        };
                                        let Some((joined_room, rx)) = joined else {
                                            let _ = ws_sender.send(Message::Close(None)).await;
                                            break;
                                        };

                                        // Newcomer handshake: full state first, so every
                                        // later live delta applies on top of it
                                        let state = joined_room.full_state().await;
                                        let state_msg =
                                            SyncMessage::sync_step2(Uuid::nil(), board_id, state);
                                        ws_sender.send(Message::Binary(state_msg.encode()?.into())).await?;

                                        // Tell the room, then seed the newcomer with the
                                        // roster and everyone's awareness
                                        let join_msg =
                                            SyncMessage::peer_joined(info.peer_id, board_id, &info);
                                        let _ = joined_room.broadcast(&join_msg);

                                        for other in joined_room.peers().await {
                                            if other.peer_id == info.peer_id {
                                                continue;
                                            }
                                            let msg =
                                                SyncMessage::peer_joined(other.peer_id, board_id, &other);
                                            ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
                                        }
                                        for (pid, state) in joined_room.awareness_states().await {
                                            let msg = SyncMessage::awareness(pid, board_id, 0, &state);
                                            ws_sender.send(Message::Binary(msg.encode()?.into())).await?;
                                        }

                                        {
                                            let mut s = stats.write().await;
                                            s.active_rooms = registry.room_count().await;
                                        }

                                        log::info!(
                                            "Peer {} ({}) joined board {board_id}",
                                            info.name,
                                            info.peer_id
                                        );
                                        broadcast_rx = Some(rx);
                                        room = Some(joined_room);
                                    }

                                    MessageType::Delta => {
                                        // Merge into the authoritative replica, then fan out
                                        let Some(ref joined_room) = room else {
                                            log::debug!("Delta from {addr} before join; ignored");
                                            continue;
                                        };
                                        match joined_room.merge_delta(&sync_msg.payload).await {
                                            Ok(()) => {
                                                joined_room.broadcast_raw(Arc::new(bytes));
                                                if let Some(store) = registry.store() {
                                                    match joined_room
                                                        .snapshot_if_due(store, registry.policy())
                                                        .await
                                                    {
                                                        Ok(true) => {
                                                            stats.write().await.snapshots_saved += 1;
                                                        }
                                                        Ok(false) => {}
                                                        Err(e) => log::error!(
                                                            "Snapshot failed for board {board_id}: {e}"
                                                        ),
                                                    }
                                                }
                                            }
                                            Err(e) => {
                                                log::warn!(
                                                    "Dropped malformed delta from {} on board {board_id}: {e}",
                                                    sync_msg.peer_id
                                                );
                                            }
                                        }
                                    }

                                    MessageType::SyncStep1 => {
                                        // Client requesting a diff against its state vector
                                        let Some(ref joined_room) = room else { continue };
                                        match joined_room.encode_diff(&sync_msg.payload).await {
                                            Ok(diff) => {
                                                let response =
                                                    SyncMessage::sync_step2(Uuid::nil(), board_id, diff);
                                                ws_sender
                                                    .send(Message::Binary(response.encode()?.into()))
                                                    .await?;
                                            }
                                            Err(e) => {
                                                log::warn!("Bad state vector from {addr}: {e}");
                                            }
                                        }
                                    }

                                    MessageType::Awareness => {
                                        let Some(ref joined_room) = room else { continue };
                                        match sync_msg.awareness_state() {
                                            Ok(state) => {
                                                joined_room
                                                    .apply_awareness(sync_msg.peer_id, state)
                                                    .await;
                                                joined_room.broadcast_raw(Arc::new(bytes));
                                            }
                                            Err(e) => {
                                                log::warn!("Bad awareness payload from {addr}: {e}");
                                            }
                                        }
                                    }

                                    MessageType::Ping => {
                                        if let Some(pid) = peer_id {
                                            let pong = SyncMessage::pong(pid);
                                            ws_sender
                                                .send(Message::Binary(pong.encode()?.into()))
                                                .await?;
                                        }
                                    }

                                    _ => {
                                        log::debug!("Unhandled message type: {:?}", sync_msg.msg_type);
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Outgoing broadcast message
                    msg = async {
                        match broadcast_rx {
                            Some(ref mut rx) => rx.recv().await,
                            // Not joined yet — wait forever
                            None => std::future::pending().await,
                        }
                    } => {
                        match msg {
                            Ok(data) => {
                                // Don't echo back to sender
                                if let Ok(sync_msg) = SyncMessage::decode(&data) {
                                    if Some(sync_msg.peer_id) == peer_id {
                                        continue;
                                    }
                                }
                                ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                log::warn!("Peer {peer_id:?} lagged by {n} messages");
                            }
                            Err(_) => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        // Cleanup: departure broadcast, then room teardown if empty
        if let (Some(pid), Some(joined_room)) = (peer_id, room) {
            joined_room.leave(pid).await;
            let leave_msg = SyncMessage::peer_left(pid, board_id);
            let _ = joined_room.broadcast(&leave_msg);
            log::info!("Peer {pid} left board {board_id}");

            if joined_room.peer_count().await == 0 {
                // Final snapshot is written inside close and awaited here
                if let Err(e) = registry.close_if_empty(board_id).await {
                    log::error!("Failed to close room for board {board_id}: {e}");
                }
            }
        }

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = registry.room_count().await;
        }

        session
    }

    /// Persist every dirty room and flush the store. Await this before
    /// process exit so no acknowledged edit is lost.
    pub async fn shutdown(&self) -> Result<usize, crate::room::RoomError> {
        if let Some(timer) = self.timer.lock().await.take() {
            timer.abort();
            let _ = timer.await;
        }
        let saved = self.registry.shutdown().await?;
        if saved > 0 {
            log::info!("Shutdown persisted {saved} boards");
        }
        Ok(saved)
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.registry.room_count().await;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the room registry.
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Get the persistent store (if configured).
    pub fn store(&self) -> Option<&Arc<SnapshotStore>> {
        self.store.as_ref()
    }

    /// Latest persisted snapshot for a board, if any.
    pub fn latest_snapshot(&self, board_id: Uuid) -> Result<Option<Snapshot>, StoreError> {
        match &self.store {
            Some(store) => store.get_latest_snapshot(board_id),
            None => Ok(None),
        }
    }

    /// Current full state of a board: the live room if one is active,
    /// otherwise the latest persisted snapshot.
    pub async fn board_state(&self, board_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(room) = self.registry.get(board_id).await {
            return Ok(Some(room.full_state().await));
        }
        Ok(self.latest_snapshot(board_id)?.map(|s| s.state))
    }
}

// ─── Routing helpers ────────────────────────────────────────────────

/// Parse `/board:<uuid>` into the board id.
fn parse_board_path(path: &str) -> Option<Uuid> {
    let rest = path.strip_prefix('/')?;
    let id = rest.strip_prefix("board:")?;
    Uuid::parse_str(id).ok()
}

/// Pull credentials off the upgrade request. Native clients send an
/// `Authorization: Bearer` header; browsers cannot set headers on a
/// WebSocket, so a `token` query parameter and a `session` cookie are
/// accepted too, in that order.
fn extract_token(req: &Request) -> Option<&str> {
    if let Some(value) = req.headers().get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(token) = value.strip_prefix("Bearer ").filter(|t| !t.is_empty()) {
            return Some(token);
        }
    }

    if let Some(token) = req
        .uri()
        .query()
        .and_then(|q| q.split('&').find_map(|pair| pair.strip_prefix("token=")))
        .filter(|t| !t.is_empty())
    {
        return Some(token);
    }

    req.headers()
        .get("cookie")
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| {
            cookies
                .split(';')
                .map(str::trim)
                .find_map(|c| c.strip_prefix("session="))
        })
        .filter(|t| !t.is_empty())
}

fn reject(status: StatusCode, message: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(message.to_string()));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{BoardDocument, BoardOp, StickyNote};

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_peers_per_room, 100);
        assert_eq!(config.broadcast_capacity, 256);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert!(config.storage_path.is_none());
        assert_eq!(config.snapshot_policy.update_threshold, 500);
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert!(server.store.is_none());
    }

    #[test]
    fn test_parse_board_path() {
        let id = Uuid::new_v4();
        assert_eq!(parse_board_path(&format!("/board:{id}")), Some(id));

        assert!(parse_board_path("/").is_none());
        assert!(parse_board_path("/board:").is_none());
        assert!(parse_board_path("/board:not-a-uuid").is_none());
        assert!(parse_board_path(&format!("/room:{id}")).is_none());
        assert!(parse_board_path(&format!("board:{id}")).is_none());
    }

    fn upgrade_request(uri: &str, headers: &[(&str, &str)]) -> Request {
        let mut builder = Request::builder().uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_extract_token_bearer_header() {
        let req = upgrade_request("/board:x", &[("authorization", "Bearer tok-1")]);
        assert_eq!(extract_token(&req), Some("tok-1"));

        let req = upgrade_request("/board:x", &[("authorization", "Basic dXNlcg==")]);
        assert_eq!(extract_token(&req), None);
    }

    #[test]
    fn test_extract_token_query_param() {
        let req = upgrade_request("/board:x?token=abc123", &[]);
        assert_eq!(extract_token(&req), Some("abc123"));

        let req = upgrade_request("/board:x?user=1&token=t&y=z", &[]);
        assert_eq!(extract_token(&req), Some("t"));

        let req = upgrade_request("/board:x?token=", &[]);
        assert_eq!(extract_token(&req), None);

        let req = upgrade_request("/board:x?other=1", &[]);
        assert_eq!(extract_token(&req), None);
    }

    #[test]
    fn test_extract_token_session_cookie() {
        let req = upgrade_request("/board:x", &[("cookie", "theme=dark; session=sess-9")]);
        assert_eq!(extract_token(&req), Some("sess-9"));
    }

    #[test]
    fn test_extract_token_header_wins_over_query() {
        let req = upgrade_request(
            "/board:x?token=from-query",
            &[("authorization", "Bearer from-header")],
        );
        assert_eq!(extract_token(&req), Some("from-header"));
    }

    #[test]
    fn test_allow_all_verifier() {
        let verifier = AllowAll;
        let board_id = Uuid::new_v4();
        let request = ConnectRequest {
            board_id,
            token: None,
            path: "/board:whatever",
        };
        let auth = verifier.verify(&request).unwrap();
        assert_eq!(auth.user_id, "anonymous");
        assert_eq!(auth.display_name, "Anonymous");
    }

    #[test]
    fn test_auth_error_status_codes() {
        assert_eq!(AuthError::Unauthenticated.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::Forbidden.status(), StatusCode::FORBIDDEN);
        assert_eq!(AuthError::NotFound.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let server = SyncServer::with_storage("127.0.0.1:0", dir.path().join("db"));
        assert!(server.store.is_some());
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.total_bytes, 0);
        assert_eq!(stats.active_rooms, 0);
        assert_eq!(stats.snapshots_saved, 0);
    }

    #[tokio::test]
    async fn test_server_recovery_empty() {
        let server = SyncServer::with_defaults();
        let recovered = server.recover().await.unwrap();
        assert_eq!(recovered, 0);
    }

    #[tokio::test]
    async fn test_server_recovery_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("db");
        let board_id = Uuid::new_v4();

        // Persist a board directly through the store
        {
            let store_config = StoreConfig {
                path: db_path.clone(),
                ..StoreConfig::default()
            };
            let store = SnapshotStore::open(store_config).unwrap();

            let mut doc = BoardDocument::new(board_id);
            doc.init_meta("Recovered board").unwrap();
            let mut sticky = StickyNote::new("u-1");
            sticky.text = "hello, recovery".into();
            doc.apply_op(&BoardOp::CreateSticky(sticky)).unwrap();
            store.save_snapshot(board_id, &doc.encode_full_state()).unwrap();
        }

        // Server pointing at the same storage warms the room back up
        let server = SyncServer::with_storage("127.0.0.1:0", &db_path);
        let recovered = server.recover().await.unwrap();
        assert_eq!(recovered, 1);

        let room = server.registry().get(board_id).await.unwrap();
        let doc = room.doc().await;
        assert_eq!(doc.stickies().len(), 1);
        assert_eq!(doc.meta().unwrap().title, "Recovered board");
    }

    #[tokio::test]
    async fn test_board_state_prefers_live_room() {
        let server = SyncServer::with_defaults();
        let board_id = Uuid::new_v4();

        // No room, no store: nothing to serve
        assert!(server.board_state(board_id).await.unwrap().is_none());

        let room = server.registry().open_room(board_id).await.unwrap();
        {
            let mut doc = room.doc().await;
            doc.apply_op(&BoardOp::CreateSticky(StickyNote::new("u-1"))).unwrap();
        }

        let state = server.board_state(board_id).await.unwrap().unwrap();
        let restored = BoardDocument::from_full_state(board_id, &state).unwrap();
        assert_eq!(restored.stickies().len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_without_store_is_noop() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.shutdown().await.unwrap(), 0);
    }
}
