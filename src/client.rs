//! Client-side board provider: a local replica, a durable cache, and one
//! sync connection.
//!
//! ```text
//! UI ──apply(op)──> BoardDocument (local replica) ──delta──> outgoing queue
//!                        │                                        │
//!                        │ offline?                               ▼
//!                        │   └──> OfflineQueue (replayed     WebSocket ──> server
//!                        │        in order on reconnect)
//!                        ▼
//!                   SnapshotStore (client-local cache,
//!                   seeds the replica before first connect)
//! ```
//!
//! The provider keeps editing available with no connection: ops apply to the
//! local replica immediately, deltas queue while offline, and the replica is
//! cached on disk so a restart reopens the board where it left off. On
//! reconnect the server's full-state catch-up merges into the replica
//! (union, never replace — offline edits survive) and the queue drains in
//! order; duplicate delivery is absorbed by idempotent merge. Undo tracks
//! local-origin operations only, as inverse operations that replicate like
//! any other edit, so undo never reverts another user's concurrent work.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::awareness::{AwarenessState, LocalAwareness};
use crate::board::{
    BoardDocument, BoardError, BoardMeta, BoardOp, MetaPatch, Shape, ShapePatch, StickyNote,
    StickyPatch,
};
use crate::protocol::{MessageType, PeerInfo, ProtocolError, SyncMessage};
use crate::store::{SnapshotStore, StoreConfig, StoreError};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted to the application.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Connection established
    Connected,
    /// Connection lost
    Disconnected,
    /// A remote peer's delta was merged into the local replica
    RemoteDelta {
        peer_id: Uuid,
        clock: u64,
        update: Vec<u8>,
    },
    /// A remote peer moved its cursor or changed its selection
    RemoteAwareness {
        peer_id: Uuid,
        state: AwarenessState,
    },
    /// A peer joined the board
    PeerJoined(PeerInfo),
    /// A peer left the board
    PeerLeft(Uuid),
    /// A full-state catch-up was merged (initial sync or SyncStep1 reply)
    StateSynced(Vec<u8>),
}

/// Provider errors.
#[derive(Debug)]
pub enum ProviderError {
    Document(BoardError),
    Protocol(ProtocolError),
    Cache(StoreError),
}

impl From<BoardError> for ProviderError {
    fn from(e: BoardError) -> Self {
        ProviderError::Document(e)
    }
}

impl From<ProtocolError> for ProviderError {
    fn from(e: ProtocolError) -> Self {
        ProviderError::Protocol(e)
    }
}

impl From<StoreError> for ProviderError {
    fn from(e: StoreError) -> Self {
        ProviderError::Cache(e)
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderError::Document(e) => write!(f, "Document error: {e}"),
            ProviderError::Protocol(e) => write!(f, "Protocol error: {e}"),
            ProviderError::Cache(e) => write!(f, "Cache error: {e}"),
        }
    }
}

impl std::error::Error for ProviderError {}

// ─── Offline queue ──────────────────────────────────────────────────

/// Bounded queue of deltas produced while disconnected, replayed in order
/// on reconnect.
///
/// When the bound is hit the queue stops accepting and flips an overflow
/// flag; the replay path then pushes the replica's full state instead (a
/// full-state encoding is itself a mergeable update), which supersedes
/// everything the queue would have carried.
pub struct OfflineQueue {
    queue: VecDeque<QueuedDelta>,
    max_size: usize,
    overflowed: bool,
}

#[derive(Debug, Clone)]
struct QueuedDelta {
    clock: u64,
    payload: Vec<u8>,
}

impl OfflineQueue {
    /// Create a new offline queue with max capacity.
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
            overflowed: false,
        }
    }

    /// Queue a delta for later replay. Returns false (and marks the queue
    /// overflowed) when full.
    pub fn enqueue(&mut self, clock: u64, payload: Vec<u8>) -> bool {
        if self.queue.len() >= self.max_size {
            self.overflowed = true;
            return false;
        }
        self.queue.push_back(QueuedDelta { clock, payload });
        true
    }

    /// Drain all queued deltas in order.
    pub fn drain(&mut self) -> Vec<(u64, Vec<u8>)> {
        self.queue.drain(..).map(|d| (d.clock, d.payload)).collect()
    }

    /// Whether the bound was hit since the last clear.
    pub fn is_overflowed(&self) -> bool {
        self.overflowed
    }

    /// Number of queued deltas.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Drop all queued deltas and reset the overflow flag.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.overflowed = false;
    }

    /// Total bytes queued.
    pub fn total_bytes(&self) -> usize {
        self.queue.iter().map(|d| d.payload.len()).sum()
    }
}

// ─── Reconnect backoff ──────────────────────────────────────────────

/// Capped exponential backoff between reconnect attempts.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}

struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.policy.base.saturating_mul(factor).min(self.policy.cap)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }
}

// ─── Undo stack ─────────────────────────────────────────────────────

/// Bounded two-stack undo history of local-origin operations.
///
/// Entries are sequences of inverse ops (a z-order restore can take
/// several steps). Remote deltas never enter the history, so undo can only
/// revert this replica's own edits.
struct UndoStack {
    undo: VecDeque<Vec<BoardOp>>,
    redo: VecDeque<Vec<BoardOp>>,
    depth: usize,
}

impl UndoStack {
    fn new(depth: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: VecDeque::new(),
            depth: depth.max(1),
        }
    }

    /// Record a fresh local edit: pushes its inverse and invalidates redo.
    fn record(&mut self, entry: Vec<BoardOp>) {
        self.push_undo(entry);
        self.redo.clear();
    }

    fn push_undo(&mut self, entry: Vec<BoardOp>) {
        self.undo.push_back(entry);
        while self.undo.len() > self.depth {
            self.undo.pop_front();
        }
    }

    fn push_redo(&mut self, entry: Vec<BoardOp>) {
        self.redo.push_back(entry);
        while self.redo.len() > self.depth {
            self.redo.pop_front();
        }
    }

    fn pop_undo(&mut self) -> Option<Vec<BoardOp>> {
        self.undo.pop_back()
    }

    fn pop_redo(&mut self) -> Option<Vec<BoardOp>> {
        self.redo.pop_back()
    }

    fn can_undo(&self) -> bool {
        !self.undo.is_empty()
    }

    fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }
}

// ─── Provider ───────────────────────────────────────────────────────

/// Provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Directory for the client-local snapshot cache (None = memory only)
    pub cache_path: Option<PathBuf>,
    /// Credentials forwarded as the `token` query parameter
    pub token: Option<String>,
    /// Bound on deltas held while disconnected
    pub offline_queue_limit: usize,
    /// Undo history depth
    pub undo_depth: usize,
    /// Reconnect backoff
    pub reconnect: ReconnectPolicy,
    /// Protocol-level ping cadence
    pub heartbeat_interval: Duration,
    /// Cache snapshots kept per board
    pub cache_retention: usize,
    /// Minimum gap between cache writes (forced writes ignore it)
    pub cache_debounce: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            cache_path: None,
            token: None,
            offline_queue_limit: 10_000,
            undo_depth: 100,
            reconnect: ReconnectPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
            cache_retention: 2,
            cache_debounce: Duration::from_millis(500),
        }
    }
}

impl ProviderConfig {
    /// Config for tests: instant cache writes, fast reconnect.
    pub fn for_testing() -> Self {
        Self {
            reconnect: ReconnectPolicy {
                base: Duration::from_millis(10),
                cap: Duration::from_millis(100),
            },
            cache_debounce: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Everything a connection session needs, cloned out of the provider so
/// the session task and the provider share state.
#[derive(Clone)]
struct SessionShared {
    url: String,
    board_id: Uuid,
    peer_info: PeerInfo,
    doc: Arc<Mutex<BoardDocument>>,
    state: Arc<RwLock<ConnectionState>>,
    clock: Arc<RwLock<u64>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    outgoing: Arc<RwLock<Option<mpsc::Sender<Vec<u8>>>>>,
    event_tx: mpsc::Sender<SyncEvent>,
    cache: Option<Arc<SnapshotStore>>,
    cache_retention: usize,
    cache_debounce: Duration,
    last_cache_save: Arc<Mutex<Option<tokio::time::Instant>>>,
    closed: Arc<AtomicBool>,
    reconnect: ReconnectPolicy,
    heartbeat: Duration,
}

/// The board provider.
///
/// Owns the local replica, the offline queue, the undo history, and the
/// connection lifecycle. All methods take `&self`; internal state is
/// behind async locks so the provider can be shared with `Arc`.
pub struct BoardProvider {
    peer_info: PeerInfo,
    board_id: Uuid,
    server_url: String,
    connect_url: String,
    config: ProviderConfig,
    doc: Arc<Mutex<BoardDocument>>,
    state: Arc<RwLock<ConnectionState>>,
    /// Lamport clock stamped on outgoing deltas
    clock: Arc<RwLock<u64>>,
    offline_queue: Arc<Mutex<OfflineQueue>>,
    /// Sender into the live session's writer, absent while disconnected
    outgoing: Arc<RwLock<Option<mpsc::Sender<Vec<u8>>>>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    cache: Option<Arc<SnapshotStore>>,
    last_cache_save: Arc<Mutex<Option<tokio::time::Instant>>>,
    undo: Mutex<UndoStack>,
    awareness: Mutex<LocalAwareness>,
    closed: Arc<AtomicBool>,
    session: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BoardProvider {
    /// Create a provider for one board.
    ///
    /// If a cache path is configured, the replica is seeded from the
    /// newest cached snapshot so the board renders before (or without)
    /// any connection.
    pub fn new(
        server_url: impl Into<String>,
        board_id: Uuid,
        peer_info: PeerInfo,
        config: ProviderConfig,
    ) -> Result<Self, ProviderError> {
        let server_url = server_url.into();

        let cache = match &config.cache_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    // The server owns real durability; the cache favors
                    // write latency
                    sync_writes: false,
                    ..StoreConfig::default()
                };
                Some(Arc::new(SnapshotStore::open(store_config)?))
            }
            None => None,
        };

        let doc = match &cache {
            Some(store) => match store.get_latest_snapshot(board_id)? {
                Some(snapshot) => {
                    log::info!(
                        "Board {board_id} loaded from local cache ({} bytes)",
                        snapshot.state.len()
                    );
                    BoardDocument::from_full_state(board_id, &snapshot.state)?
                }
                None => BoardDocument::new(board_id),
            },
            None => BoardDocument::new(board_id),
        };

        let mut connect_url = format!(
            "{}/board:{board_id}",
            server_url.trim_end_matches('/')
        );
        if let Some(token) = &config.token {
            connect_url.push_str(&format!("?token={token}"));
        }

        let (event_tx, event_rx) = mpsc::channel(256);
        let awareness = LocalAwareness::new(&peer_info.user_id, &peer_info.name);

        Ok(Self {
            peer_info,
            board_id,
            server_url,
            connect_url,
            doc: Arc::new(Mutex::new(doc)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            clock: Arc::new(RwLock::new(0)),
            offline_queue: Arc::new(Mutex::new(OfflineQueue::new(config.offline_queue_limit))),
            outgoing: Arc::new(RwLock::new(None)),
            event_tx,
            event_rx: Some(event_rx),
            cache,
            last_cache_save: Arc::new(Mutex::new(None)),
            undo: Mutex::new(UndoStack::new(config.undo_depth)),
            awareness: Mutex::new(awareness),
            closed: Arc::new(AtomicBool::new(false)),
            session: Mutex::new(None),
            config,
        })
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Start the connection loop.
    ///
    /// Returns immediately; the loop keeps attempting with capped
    /// exponential backoff until [`BoardProvider::close`] is called.
    /// Progress is reported via [`SyncEvent`] and
    /// [`BoardProvider::connection_state`]. Editing works throughout —
    /// deltas queue while the connection is down.
    pub async fn connect(&self) {
        let mut session = self.session.lock().await;
        if session.is_some() {
            return;
        }
        self.closed.store(false, Ordering::SeqCst);
        *self.state.write().await = ConnectionState::Connecting;

        let shared = SessionShared {
            url: self.connect_url.clone(),
            board_id: self.board_id,
            peer_info: self.peer_info.clone(),
            doc: self.doc.clone(),
            state: self.state.clone(),
            clock: self.clock.clone(),
            offline_queue: self.offline_queue.clone(),
            outgoing: self.outgoing.clone(),
            event_tx: self.event_tx.clone(),
            cache: self.cache.clone(),
            cache_retention: self.config.cache_retention,
            cache_debounce: self.config.cache_debounce,
            last_cache_save: self.last_cache_save.clone(),
            closed: self.closed.clone(),
            reconnect: self.config.reconnect.clone(),
            heartbeat: self.config.heartbeat_interval,
        };
        *session = Some(tokio::spawn(run_connection(shared)));
    }

    /// Stop the connection loop and persist the replica to the cache.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(handle) = self.session.lock().await.take() {
            handle.abort();
        }
        *self.outgoing.write().await = None;

        let was_connected = *self.state.read().await == ConnectionState::Connected;
        *self.state.write().await = ConnectionState::Disconnected;
        self.save_cache(true).await;
        if was_connected {
            let _ = self.event_tx.send(SyncEvent::Disconnected).await;
        }
    }

    // ─── Editing ────────────────────────────────────────────────────

    /// Apply a local operation: mutates the replica, records the inverse
    /// in the undo history, and sends (or queues) the resulting delta.
    ///
    /// Operations that turn out to be no-ops (duplicate create, missing
    /// target) produce no delta, no history entry, and no traffic.
    pub async fn apply(&self, op: &BoardOp) -> Result<(), ProviderError> {
        let (delta, inverse) = {
            let mut doc = self.doc.lock().await;
            let inverse = invert_op(&doc, op);
            let delta = doc.apply_op(op)?;
            (delta, inverse)
        };
        if delta.is_empty() {
            return Ok(());
        }
        if let Some(entry) = inverse {
            self.undo.lock().await.record(entry);
        }
        self.save_cache(false).await;
        self.send_delta(delta).await
    }

    /// Revert this replica's most recent operation.
    ///
    /// The inverse applies as a new local operation and replicates
    /// normally. If the target was deleted remotely in the meantime the
    /// inverse degrades to the document's no-op semantics. Returns false
    /// when there is nothing to undo.
    pub async fn undo(&self) -> Result<bool, ProviderError> {
        let Some(entry) = self.undo.lock().await.pop_undo() else {
            return Ok(false);
        };
        let reverse = self.apply_entry(&entry).await?;
        if !reverse.is_empty() {
            self.undo.lock().await.push_redo(reverse);
        }
        Ok(true)
    }

    /// Re-apply the most recently undone operation.
    pub async fn redo(&self) -> Result<bool, ProviderError> {
        let Some(entry) = self.undo.lock().await.pop_redo() else {
            return Ok(false);
        };
        let reverse = self.apply_entry(&entry).await?;
        if !reverse.is_empty() {
            self.undo.lock().await.push_undo(reverse);
        }
        Ok(true)
    }

    pub async fn can_undo(&self) -> bool {
        self.undo.lock().await.can_undo()
    }

    pub async fn can_redo(&self) -> bool {
        self.undo.lock().await.can_redo()
    }

    /// Apply a sequence of ops as one history entry; returns the inverse
    /// sequence for the opposite stack.
    async fn apply_entry(&self, ops: &[BoardOp]) -> Result<Vec<BoardOp>, ProviderError> {
        let mut inverses = Vec::new();
        let mut deltas = Vec::new();
        {
            let mut doc = self.doc.lock().await;
            for op in ops {
                let inverse = invert_op(&doc, op);
                let delta = doc.apply_op(op)?;
                if delta.is_empty() {
                    continue;
                }
                if let Some(mut inv) = inverse {
                    // Inverse of [a, b] is [inv(b), inv(a)]
                    inv.extend(inverses);
                    inverses = inv;
                }
                deltas.push(delta);
            }
        }
        if !deltas.is_empty() {
            self.save_cache(false).await;
        }
        for delta in deltas {
            self.send_delta(delta).await?;
        }
        Ok(inverses)
    }

    /// Stamp and send a delta, or queue it while disconnected.
    async fn send_delta(&self, update: Vec<u8>) -> Result<(), ProviderError> {
        let clock = {
            let mut clock = self.clock.write().await;
            *clock += 1;
            *clock
        };

        if *self.state.read().await != ConnectionState::Connected {
            self.queue_delta(clock, update).await;
            return Ok(());
        }

        let msg = SyncMessage::delta(self.peer_info.peer_id, self.board_id, clock, update);
        let encoded = msg.encode()?;
        let sender = self.outgoing.read().await.clone();
        match sender {
            Some(tx) => {
                if tx.send(encoded).await.is_err() {
                    // Session died under us; keep the delta for replay
                    self.queue_delta(clock, msg.payload).await;
                }
            }
            None => self.queue_delta(clock, msg.payload).await,
        }
        Ok(())
    }

    async fn queue_delta(&self, clock: u64, update: Vec<u8>) {
        let mut queue = self.offline_queue.lock().await;
        if !queue.enqueue(clock, update) {
            log::warn!(
                "Offline queue full for board {}; full state will be pushed on reconnect",
                self.board_id
            );
        }
    }

    // ─── Awareness ──────────────────────────────────────────────────

    /// Report the local cursor position. Updates are coalesced to one per
    /// 33 ms; the latest position always wins.
    pub async fn set_cursor(&self, x: f64, y: f64) -> Result<(), ProviderError> {
        let state = self.awareness.lock().await.set_cursor(x, y);
        if let Some(state) = state {
            self.send_awareness(&state).await?;
        }
        Ok(())
    }

    /// Send the most recent cursor position regardless of the rate limit.
    pub async fn flush_cursor(&self) -> Result<(), ProviderError> {
        let state = self.awareness.lock().await.flush();
        self.send_awareness(&state).await
    }

    /// Replace the local selection.
    pub async fn set_selection(&self, ids: Vec<String>) -> Result<(), ProviderError> {
        let state = self.awareness.lock().await.set_selection(ids);
        self.send_awareness(&state).await
    }

    /// Drop the local cursor and selection (e.g. the window lost focus).
    pub async fn clear_awareness(&self) -> Result<(), ProviderError> {
        let state = {
            let mut awareness = self.awareness.lock().await;
            awareness.clear_cursor();
            awareness.set_selection(Vec::new())
        };
        self.send_awareness(&state).await
    }

    /// Awareness is ephemeral: silently dropped while offline.
    async fn send_awareness(&self, state: &AwarenessState) -> Result<(), ProviderError> {
        if *self.state.read().await != ConnectionState::Connected {
            return Ok(());
        }
        let clock = *self.clock.read().await;
        let msg = SyncMessage::awareness(self.peer_info.peer_id, self.board_id, clock, state);
        let encoded = msg.encode()?;
        if let Some(tx) = self.outgoing.read().await.clone() {
            let _ = tx.send(encoded).await;
        }
        Ok(())
    }

    // ─── Cache ──────────────────────────────────────────────────────

    async fn save_cache(&self, force: bool) {
        persist_cache(
            &self.cache,
            &self.doc,
            self.board_id,
            self.config.cache_retention,
            self.config.cache_debounce,
            &self.last_cache_save,
            force,
        )
        .await;
    }

    // ─── Accessors ──────────────────────────────────────────────────

    /// Lock the local replica for reading board content.
    pub async fn doc(&self) -> tokio::sync::MutexGuard<'_, BoardDocument> {
        self.doc.lock().await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        *self.state.read().await == ConnectionState::Connected
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn board_id(&self) -> Uuid {
        self.board_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub async fn clock(&self) -> u64 {
        *self.clock.read().await
    }

    pub async fn offline_queue_len(&self) -> usize {
        self.offline_queue.lock().await.len()
    }
}

// ─── Connection loop ────────────────────────────────────────────────

/// Reconnecting connection driver: one session per established socket,
/// capped exponential backoff between attempts.
async fn run_connection(shared: SessionShared) {
    let mut backoff = Backoff::new(shared.reconnect.clone());

    loop {
        if shared.closed.load(Ordering::SeqCst) {
            break;
        }

        match tokio_tungstenite::connect_async(&shared.url).await {
            Ok((ws_stream, _)) => {
                backoff.reset();
                let was_connected = run_session(&shared, ws_stream).await;

                *shared.outgoing.write().await = None;
                persist_cache(
                    &shared.cache,
                    &shared.doc,
                    shared.board_id,
                    shared.cache_retention,
                    shared.cache_debounce,
                    &shared.last_cache_save,
                    true,
                )
                .await;
                if was_connected {
                    let _ = shared.event_tx.send(SyncEvent::Disconnected).await;
                }
            }
            Err(e) => {
                log::warn!("Connection to {} failed: {e}", shared.url);
            }
        }

        if shared.closed.load(Ordering::SeqCst) {
            break;
        }
        *shared.state.write().await = ConnectionState::Reconnecting;
        let delay = backoff.next_delay();
        log::info!(
            "Reconnecting to board {} in {delay:?}",
            shared.board_id
        );
        tokio::time::sleep(delay).await;
    }

    *shared.state.write().await = ConnectionState::Disconnected;
}

/// Drive one established WebSocket until it drops. Returns whether the
/// session got as far as Connected.
async fn run_session(
    shared: &SessionShared,
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> bool {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Announce ourselves before anything else; the server replies with
    // the full-state catch-up
    let join_msg = SyncMessage::peer_joined(
        shared.peer_info.peer_id,
        shared.board_id,
        &shared.peer_info,
    );
    let encoded = match join_msg.encode() {
        Ok(e) => e,
        Err(e) => {
            log::error!("Failed to encode join message: {e}");
            return false;
        }
    };
    if ws_sender.send(Message::Binary(encoded.into())).await.is_err() {
        return false;
    }

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
    *shared.outgoing.write().await = Some(out_tx);
    *shared.state.write().await = ConnectionState::Connected;
    let _ = shared.event_tx.send(SyncEvent::Connected).await;
    log::info!("Connected to board {}", shared.board_id);

    let mut synced = false;
    let mut heartbeat = tokio::time::interval(shared.heartbeat);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            outgoing = out_rx.recv() => {
                match outgoing {
                    Some(data) => {
                        if ws_sender.send(Message::Binary(data.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = heartbeat.tick() => {
                let ping = SyncMessage::ping(shared.peer_info.peer_id);
                match ping.encode() {
                    Ok(encoded) => {
                        if ws_sender.send(Message::Binary(encoded.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => log::error!("Failed to encode ping: {e}"),
                }
            }

            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        handle_incoming(shared, bytes, &mut synced).await;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Server closed connection for board {}", shared.board_id);
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error on board {}: {e}", shared.board_id);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    true
}

/// Merge/route one incoming frame.
async fn handle_incoming(shared: &SessionShared, bytes: Vec<u8>, synced: &mut bool) {
    let sync_msg = match SyncMessage::decode(&bytes) {
        Ok(m) => m,
        Err(e) => {
            log::warn!("Failed to decode incoming message: {e}");
            return;
        }
    };

    // The server suppresses echoes, but a relay race can still return our
    // own frames
    if sync_msg.peer_id == shared.peer_info.peer_id {
        return;
    }

    match sync_msg.msg_type {
        MessageType::SyncStep2 => {
            let merged = shared
                .doc
                .lock()
                .await
                .merge_remote_delta(&sync_msg.payload);
            match merged {
                Ok(()) => {
                    persist_cache(
                        &shared.cache,
                        &shared.doc,
                        shared.board_id,
                        shared.cache_retention,
                        shared.cache_debounce,
                        &shared.last_cache_save,
                        true,
                    )
                    .await;
                    let _ = shared
                        .event_tx
                        .send(SyncEvent::StateSynced(sync_msg.payload))
                        .await;
                    if !*synced {
                        *synced = true;
                        // Replay runs in its own task: pushing through the
                        // outgoing channel from here would deadlock once
                        // the queue outgrows the channel capacity
                        tokio::spawn(replay_offline(shared.clone()));
                    }
                }
                Err(e) => {
                    // Local replica stays the source of truth
                    log::error!(
                        "Discarding undecodable catch-up for board {}: {e}",
                        shared.board_id
                    );
                }
            }
        }

        MessageType::Delta => {
            let merged = shared
                .doc
                .lock()
                .await
                .merge_remote_delta(&sync_msg.payload);
            match merged {
                Ok(()) => {
                    persist_cache(
                        &shared.cache,
                        &shared.doc,
                        shared.board_id,
                        shared.cache_retention,
                        shared.cache_debounce,
                        &shared.last_cache_save,
                        false,
                    )
                    .await;
                    let _ = shared
                        .event_tx
                        .send(SyncEvent::RemoteDelta {
                            peer_id: sync_msg.peer_id,
                            clock: sync_msg.clock,
                            update: sync_msg.payload,
                        })
                        .await;
                }
                Err(e) => {
                    log::warn!("Dropped malformed remote delta: {e}");
                }
            }
        }

        MessageType::Awareness => match sync_msg.awareness_state() {
            Ok(state) => {
                let _ = shared
                    .event_tx
                    .send(SyncEvent::RemoteAwareness {
                        peer_id: sync_msg.peer_id,
                        state,
                    })
                    .await;
            }
            Err(e) => log::warn!("Dropped malformed awareness update: {e}"),
        },

        MessageType::PeerJoined => {
            if let Ok(info) = sync_msg.peer_info() {
                let _ = shared.event_tx.send(SyncEvent::PeerJoined(info)).await;
            }
        }

        MessageType::PeerLeft => {
            let _ = shared
                .event_tx
                .send(SyncEvent::PeerLeft(sync_msg.peer_id))
                .await;
        }

        MessageType::Pong => {}

        _ => {
            log::debug!("Unhandled message type: {:?}", sync_msg.msg_type);
        }
    }
}

/// Push everything produced while offline.
///
/// In-order replay of the queue in the common case; if the queue
/// overflowed, one full-state update supersedes the lost entries.
async fn replay_offline(shared: SessionShared) {
    let (queued, overflowed) = {
        let mut queue = shared.offline_queue.lock().await;
        let overflowed = queue.is_overflowed();
        let queued = queue.drain();
        queue.clear();
        (queued, overflowed)
    };

    let Some(tx) = shared.outgoing.read().await.clone() else {
        return;
    };

    if overflowed {
        let state = shared.doc.lock().await.encode_full_state();
        let clock = {
            let mut clock = shared.clock.write().await;
            *clock += 1;
            *clock
        };
        log::info!(
            "Offline queue overflowed; pushing full state for board {} ({} bytes)",
            shared.board_id,
            state.len()
        );
        let msg = SyncMessage::delta(shared.peer_info.peer_id, shared.board_id, clock, state);
        if let Ok(encoded) = msg.encode() {
            let _ = tx.send(encoded).await;
        }
        return;
    }

    if queued.is_empty() {
        return;
    }
    log::info!(
        "Replaying {} offline deltas for board {}",
        queued.len(),
        shared.board_id
    );
    for (clock, payload) in queued {
        let msg = SyncMessage::delta(shared.peer_info.peer_id, shared.board_id, clock, payload);
        match msg.encode() {
            Ok(encoded) => {
                if tx.send(encoded).await.is_err() {
                    return;
                }
            }
            Err(e) => log::error!("Failed to encode queued delta: {e}"),
        }
    }
}

/// Write the replica to the local cache, best-effort.
async fn persist_cache(
    cache: &Option<Arc<SnapshotStore>>,
    doc: &Arc<Mutex<BoardDocument>>,
    board_id: Uuid,
    retention: usize,
    debounce: Duration,
    last_save: &Arc<Mutex<Option<tokio::time::Instant>>>,
    force: bool,
) {
    let Some(store) = cache else {
        return;
    };

    {
        let last = last_save.lock().await;
        if !force {
            if let Some(at) = *last {
                if at.elapsed() < debounce {
                    return;
                }
            }
        }
    }

    let state = doc.lock().await.encode_full_state();
    if let Err(e) = store.save_snapshot(board_id, &state) {
        log::warn!("Local cache write failed for board {board_id}: {e}");
        return;
    }
    if let Err(e) = store.cleanup_old_snapshots(board_id, retention) {
        log::warn!("Local cache cleanup failed for board {board_id}: {e}");
    }
    *last_save.lock().await = Some(tokio::time::Instant::now());
}

// ─── Inverse operations ─────────────────────────────────────────────

/// Compute the ops that revert `op`, reading prior state from the replica
/// before the op applies. `None` means the op is not invertible from the
/// current state (missing target, or nothing to restore); such ops leave
/// no history entry.
fn invert_op(doc: &BoardDocument, op: &BoardOp) -> Option<Vec<BoardOp>> {
    match op {
        BoardOp::CreateSticky(sticky) => Some(vec![BoardOp::DeleteSticky {
            id: sticky.id.clone(),
        }]),
        BoardOp::UpdateSticky { id, patch } => {
            let prior = doc.sticky(id)?;
            Some(vec![BoardOp::UpdateSticky {
                id: id.clone(),
                patch: sticky_patch_inverse(patch, &prior),
            }])
        }
        BoardOp::SetStickyText { id, .. } => {
            let prior = doc.sticky_text(id)?;
            Some(vec![BoardOp::SetStickyText {
                id: id.clone(),
                text: prior,
            }])
        }
        BoardOp::InsertStickyText { id, pos, text } => Some(vec![BoardOp::DeleteStickyText {
            id: id.clone(),
            pos: *pos,
            len: text.len() as u32,
        }]),
        BoardOp::DeleteStickyText { id, pos, len } => {
            let text = doc.sticky_text(id)?;
            let start = *pos as usize;
            let end = start.checked_add(*len as usize)?;
            // Positions are byte offsets; a slice off a char boundary
            // cannot be restored as text
            let removed = text.get(start..end)?;
            Some(vec![BoardOp::InsertStickyText {
                id: id.clone(),
                pos: *pos,
                text: removed.to_string(),
            }])
        }
        BoardOp::DeleteSticky { id } => {
            let sticky = doc.sticky(id)?;
            Some(vec![BoardOp::CreateSticky(sticky)])
        }
        BoardOp::CreateShape(shape) => Some(vec![BoardOp::DeleteShape {
            id: shape.id().to_string(),
        }]),
        BoardOp::UpdateShape { id, patch } => {
            let prior = doc.shape(id)?;
            Some(vec![BoardOp::UpdateShape {
                id: id.clone(),
                patch: shape_patch_inverse(patch, &prior),
            }])
        }
        BoardOp::DeleteShape { id } => {
            let shape = doc.shape(id)?;
            Some(vec![BoardOp::CreateShape(shape)])
        }
        BoardOp::MoveToFront { id }
        | BoardOp::MoveToBack { id }
        | BoardOp::MoveForward { id }
        | BoardOp::MoveBackward { id } => reorder_inverse(&doc.layer_order(), id, op),
        BoardOp::SetMeta(patch) => {
            // Before the first meta write there is no prior state to
            // restore
            let prior = doc.meta()?;
            Some(vec![BoardOp::SetMeta(meta_patch_inverse(patch, &prior))])
        }
    }
}

fn sticky_patch_inverse(patch: &StickyPatch, prior: &StickyNote) -> StickyPatch {
    StickyPatch {
        color: patch.color.is_some().then(|| prior.color.clone()),
        x: patch.x.is_some().then_some(prior.x),
        y: patch.y.is_some().then_some(prior.y),
        width: patch.width.is_some().then_some(prior.width),
        height: patch.height.is_some().then_some(prior.height),
        rotation: patch.rotation.is_some().then_some(prior.rotation),
        z_index: patch.z_index.is_some().then_some(prior.z_index),
    }
}

fn shape_patch_inverse(patch: &ShapePatch, prior: &Shape) -> ShapePatch {
    let base = prior.base();
    let mut inverse = ShapePatch {
        x: patch.x.is_some().then_some(base.x),
        y: patch.y.is_some().then_some(base.y),
        width: patch.width.is_some().then_some(base.width),
        height: patch.height.is_some().then_some(base.height),
        rotation: patch.rotation.is_some().then_some(base.rotation),
        z_index: patch.z_index.is_some().then_some(base.z_index),
        ..ShapePatch::default()
    };
    // Style fields only invert within the target's variant; the forward
    // op ignored the rest
    match prior {
        Shape::Rectangle {
            fill,
            stroke,
            stroke_width,
            ..
        }
        | Shape::Circle {
            fill,
            stroke,
            stroke_width,
            ..
        } => {
            inverse.fill = patch.fill.is_some().then(|| fill.clone());
            inverse.stroke = patch.stroke.is_some().then(|| stroke.clone());
            inverse.stroke_width = patch.stroke_width.is_some().then_some(*stroke_width);
        }
        Shape::Text {
            text,
            font_size,
            font_family,
            fill,
            ..
        } => {
            inverse.text = patch.text.is_some().then(|| text.clone());
            inverse.font_size = patch.font_size.is_some().then_some(*font_size);
            inverse.font_family = patch.font_family.is_some().then(|| font_family.clone());
            inverse.fill = patch.fill.is_some().then(|| fill.clone());
        }
    }
    inverse
}

fn meta_patch_inverse(patch: &MetaPatch, prior: &BoardMeta) -> MetaPatch {
    MetaPatch {
        title: patch.title.is_some().then(|| prior.title.clone()),
        background: patch.background.is_some().then(|| prior.background.clone()),
        grid: patch.grid.is_some().then(|| prior.grid.clone()),
        zoom: patch.zoom.is_some().then(|| prior.zoom.clone()),
        pan: patch.pan.is_some().then_some(prior.pan),
    }
}

/// Ops that put `id` back at its pre-reorder position.
fn reorder_inverse(order: &[String], id: &str, op: &BoardOp) -> Option<Vec<BoardOp>> {
    let from = order.iter().position(|entry| entry == id)?;
    let last = order.len().saturating_sub(1);
    let to = match op {
        BoardOp::MoveToFront { .. } => last,
        BoardOp::MoveToBack { .. } => 0,
        BoardOp::MoveForward { .. } => (from + 1).min(last),
        BoardOp::MoveBackward { .. } => from.saturating_sub(1),
        _ => return None,
    };
    if to == from {
        // The op itself will be a no-op
        return None;
    }

    let id = id.to_string();
    if from == 0 {
        return Some(vec![BoardOp::MoveToBack { id }]);
    }
    if from == last {
        return Some(vec![BoardOp::MoveToFront { id }]);
    }
    // Step back one position at a time; `to` is where the op is about to
    // put it, `from` is where it has to return to
    let steps = if to < from {
        vec![BoardOp::MoveForward { id }; from - to]
    } else {
        vec![BoardOp::MoveBackward { id }; to - from]
    };
    Some(steps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::GridConfig;

    fn test_provider() -> BoardProvider {
        let info = PeerInfo::new("u-1", "Alice");
        BoardProvider::new(
            "ws://localhost:9090",
            Uuid::new_v4(),
            info,
            ProviderConfig::for_testing(),
        )
        .unwrap()
    }

    fn cached_provider(path: &std::path::Path) -> BoardProvider {
        let info = PeerInfo::new("u-1", "Alice");
        let config = ProviderConfig {
            cache_path: Some(path.to_path_buf()),
            ..ProviderConfig::for_testing()
        };
        BoardProvider::new("ws://localhost:9090", cache_board_id(), info, config).unwrap()
    }

    // One fixed board id so cache tests can reopen the same board
    fn cache_board_id() -> Uuid {
        Uuid::from_u128(0x1234_5678_9abc_def0_1234_5678_9abc_def0)
    }

    #[test]
    fn test_provider_creation() {
        let info = PeerInfo::new("u-1", "Alice");
        let board_id = Uuid::new_v4();
        let provider = BoardProvider::new(
            "ws://localhost:9090",
            board_id,
            info,
            ProviderConfig::default(),
        )
        .unwrap();

        assert_eq!(provider.board_id(), board_id);
        assert_eq!(provider.peer_info().name, "Alice");
        assert_eq!(provider.server_url(), "ws://localhost:9090");
        assert_eq!(provider.connect_url, format!("ws://localhost:9090/board:{board_id}"));
    }

    #[test]
    fn test_connect_url_with_token() {
        let info = PeerInfo::new("u-1", "Alice");
        let board_id = Uuid::new_v4();
        let config = ProviderConfig {
            token: Some("secret".into()),
            ..ProviderConfig::default()
        };
        let provider =
            BoardProvider::new("ws://localhost:9090/", board_id, info, config).unwrap();
        assert_eq!(
            provider.connect_url,
            format!("ws://localhost:9090/board:{board_id}?token=secret")
        );
    }

    #[tokio::test]
    async fn test_initial_state() {
        let provider = test_provider();
        assert_eq!(provider.connection_state().await, ConnectionState::Disconnected);
        assert!(!provider.is_connected().await);
        assert_eq!(provider.clock().await, 0);
        assert_eq!(provider.offline_queue_len().await, 0);
        assert!(!provider.can_undo().await);
        assert!(!provider.can_redo().await);
    }

    #[tokio::test]
    async fn test_offline_apply_queues_and_mutates() {
        let provider = test_provider();
        let sticky = StickyNote::new("u-1");
        let id = sticky.id.clone();

        provider.apply(&BoardOp::CreateSticky(sticky)).await.unwrap();

        assert_eq!(provider.offline_queue_len().await, 1);
        assert_eq!(provider.clock().await, 1);
        assert!(provider.doc().await.sticky(&id).is_some());
    }

    #[tokio::test]
    async fn test_noop_produces_no_traffic_or_history() {
        let provider = test_provider();
        // Update of a sticky that does not exist
        let op = BoardOp::UpdateSticky {
            id: "ghost".into(),
            patch: StickyPatch {
                color: Some("#111111".into()),
                ..StickyPatch::default()
            },
        };
        provider.apply(&op).await.unwrap();

        assert_eq!(provider.offline_queue_len().await, 0);
        assert_eq!(provider.clock().await, 0);
        assert!(!provider.can_undo().await);
    }

    #[tokio::test]
    async fn test_undo_redo_create() {
        let provider = test_provider();
        let sticky = StickyNote::new("u-1");
        let id = sticky.id.clone();

        provider.apply(&BoardOp::CreateSticky(sticky)).await.unwrap();
        assert!(provider.can_undo().await);

        assert!(provider.undo().await.unwrap());
        assert!(provider.doc().await.sticky(&id).is_none());
        assert!(provider.can_redo().await);

        assert!(provider.redo().await.unwrap());
        assert!(provider.doc().await.sticky(&id).is_some());
    }

    #[tokio::test]
    async fn test_undo_restores_prior_field_values() {
        let provider = test_provider();
        let mut sticky = StickyNote::new("u-1");
        sticky.color = "#ff6b6b".into();
        let id = sticky.id.clone();
        provider.apply(&BoardOp::CreateSticky(sticky)).await.unwrap();

        provider
            .apply(&BoardOp::UpdateSticky {
                id: id.clone(),
                patch: StickyPatch {
                    color: Some("#54a0ff".into()),
                    x: Some(40.0),
                    ..StickyPatch::default()
                },
            })
            .await
            .unwrap();

        provider.undo().await.unwrap();
        let restored = provider.doc().await.sticky(&id).unwrap();
        assert_eq!(restored.color, "#ff6b6b");
        assert_eq!(restored.x, 0.0);

        provider.redo().await.unwrap();
        let redone = provider.doc().await.sticky(&id).unwrap();
        assert_eq!(redone.color, "#54a0ff");
        assert_eq!(redone.x, 40.0);
    }

    #[tokio::test]
    async fn test_undo_text_edits() {
        let provider = test_provider();
        let sticky = StickyNote::new("u-1");
        let id = sticky.id.clone();
        provider.apply(&BoardOp::CreateSticky(sticky)).await.unwrap();

        provider
            .apply(&BoardOp::SetStickyText {
                id: id.clone(),
                text: "hello".into(),
            })
            .await
            .unwrap();
        provider
            .apply(&BoardOp::InsertStickyText {
                id: id.clone(),
                pos: 5,
                text: " world".into(),
            })
            .await
            .unwrap();
        assert_eq!(provider.doc().await.sticky_text(&id).unwrap(), "hello world");

        provider.undo().await.unwrap();
        assert_eq!(provider.doc().await.sticky_text(&id).unwrap(), "hello");

        provider.undo().await.unwrap();
        assert_eq!(provider.doc().await.sticky_text(&id).unwrap(), "");
    }

    #[tokio::test]
    async fn test_undo_delete_restores_content() {
        let provider = test_provider();
        let mut sticky = StickyNote::new("u-1");
        sticky.text = "do not lose me".into();
        sticky.x = 17.0;
        let id = sticky.id.clone();
        provider.apply(&BoardOp::CreateSticky(sticky)).await.unwrap();

        provider
            .apply(&BoardOp::DeleteSticky { id: id.clone() })
            .await
            .unwrap();
        assert!(provider.doc().await.sticky(&id).is_none());

        provider.undo().await.unwrap();
        let restored = provider.doc().await.sticky(&id).unwrap();
        assert_eq!(restored.text, "do not lose me");
        assert_eq!(restored.x, 17.0);
    }

    #[tokio::test]
    async fn test_undo_reorder_restores_position() {
        let provider = test_provider();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let sticky = StickyNote::new("u-1");
            ids.push(sticky.id.clone());
            provider.apply(&BoardOp::CreateSticky(sticky)).await.unwrap();
        }
        assert_eq!(provider.doc().await.layer_order(), ids);

        provider
            .apply(&BoardOp::MoveToFront { id: ids[0].clone() })
            .await
            .unwrap();
        assert_eq!(
            provider.doc().await.layer_order(),
            vec![ids[1].clone(), ids[2].clone(), ids[0].clone()]
        );

        provider.undo().await.unwrap();
        assert_eq!(provider.doc().await.layer_order(), ids);
    }

    #[tokio::test]
    async fn test_undo_mid_stack_reorder() {
        let provider = test_provider();
        let mut ids = Vec::new();
        for _ in 0..4 {
            let sticky = StickyNote::new("u-1");
            ids.push(sticky.id.clone());
            provider.apply(&BoardOp::CreateSticky(sticky)).await.unwrap();
        }

        provider
            .apply(&BoardOp::MoveForward { id: ids[1].clone() })
            .await
            .unwrap();
        assert_eq!(
            provider.doc().await.layer_order(),
            vec![ids[0].clone(), ids[2].clone(), ids[1].clone(), ids[3].clone()]
        );

        provider.undo().await.unwrap();
        assert_eq!(provider.doc().await.layer_order(), ids);
    }

    #[tokio::test]
    async fn test_undo_meta_patch() {
        let provider = test_provider();
        // First meta write has no prior state and is not undoable
        provider
            .apply(&BoardOp::SetMeta(MetaPatch {
                title: Some("Sprint board".into()),
                ..MetaPatch::default()
            }))
            .await
            .unwrap();
        assert!(!provider.can_undo().await);

        provider
            .apply(&BoardOp::SetMeta(MetaPatch {
                grid: Some(GridConfig {
                    enabled: false,
                    size: 40.0,
                    color: "#cccccc".into(),
                }),
                ..MetaPatch::default()
            }))
            .await
            .unwrap();
        assert!(provider.can_undo().await);

        provider.undo().await.unwrap();
        let meta = provider.doc().await.meta().unwrap();
        assert_eq!(meta.title, "Sprint board");
        assert!(meta.grid.enabled);
        assert_eq!(meta.grid.size, 20.0);
    }

    #[tokio::test]
    async fn test_undo_depth_bounded() {
        let info = PeerInfo::new("u-1", "Alice");
        let config = ProviderConfig {
            undo_depth: 3,
            ..ProviderConfig::for_testing()
        };
        let provider =
            BoardProvider::new("ws://localhost:9090", Uuid::new_v4(), info, config).unwrap();

        for _ in 0..5 {
            provider
                .apply(&BoardOp::CreateSticky(StickyNote::new("u-1")))
                .await
                .unwrap();
        }

        let mut undone = 0;
        while provider.undo().await.unwrap() {
            undone += 1;
        }
        assert_eq!(undone, 3);
        assert_eq!(provider.doc().await.stickies().len(), 2);
    }

    #[tokio::test]
    async fn test_new_op_clears_redo() {
        let provider = test_provider();
        provider
            .apply(&BoardOp::CreateSticky(StickyNote::new("u-1")))
            .await
            .unwrap();
        provider.undo().await.unwrap();
        assert!(provider.can_redo().await);

        provider
            .apply(&BoardOp::CreateSticky(StickyNote::new("u-1")))
            .await
            .unwrap();
        assert!(!provider.can_redo().await);
    }

    #[tokio::test]
    async fn test_remote_deltas_not_undoable() {
        let provider = test_provider();

        // A delta authored elsewhere
        let remote = {
            let mut doc = BoardDocument::new(provider.board_id());
            doc.apply_op(&BoardOp::CreateSticky(StickyNote::new("u-2")))
                .unwrap()
        };
        provider.doc().await.merge_remote_delta(&remote).unwrap();

        assert_eq!(provider.doc().await.stickies().len(), 1);
        assert!(!provider.can_undo().await);
    }

    #[tokio::test]
    async fn test_cache_seeds_replica() {
        let dir = tempfile::tempdir().unwrap();
        let cache_path = dir.path().join("cache");
        let id;

        {
            let provider = cached_provider(&cache_path);
            let sticky = StickyNote::new("u-1");
            id = sticky.id.clone();
            provider.apply(&BoardOp::CreateSticky(sticky)).await.unwrap();
            provider
                .apply(&BoardOp::SetStickyText {
                    id: id.clone(),
                    text: "offline note".into(),
                })
                .await
                .unwrap();
            provider.close().await;
        }

        // A fresh provider on the same cache renders the board offline
        let provider = cached_provider(&cache_path);
        assert_eq!(
            provider.doc().await.sticky_text(&id).unwrap(),
            "offline note"
        );
        assert!(!provider.is_connected().await);
    }

    #[tokio::test]
    async fn test_awareness_offline_is_silent() {
        let provider = test_provider();
        provider.set_cursor(10.0, 20.0).await.unwrap();
        provider.set_selection(vec!["a".into()]).await.unwrap();
        provider.clear_awareness().await.unwrap();
    }

    #[test]
    fn test_offline_queue() {
        let mut queue = OfflineQueue::new(100);
        assert!(queue.is_empty());

        queue.enqueue(1, vec![1, 2, 3]);
        queue.enqueue(2, vec![4, 5, 6, 7]);

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.total_bytes(), 7);

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0], (1, vec![1, 2, 3]));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_offline_queue_overflow() {
        let mut queue = OfflineQueue::new(2);
        assert!(queue.enqueue(1, vec![1]));
        assert!(queue.enqueue(2, vec![2]));
        assert!(!queue.enqueue(3, vec![3]));

        assert_eq!(queue.len(), 2);
        assert!(queue.is_overflowed());

        queue.clear();
        assert!(!queue.is_overflowed());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_backoff_progression() {
        let mut backoff = Backoff::new(ReconnectPolicy {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        });

        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));

        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(30));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_reorder_inverse_shapes() {
        let order: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();

        // Front from index 0: single MoveToBack restores it
        let inv = reorder_inverse(&order, "a", &BoardOp::MoveToFront { id: "a".into() }).unwrap();
        assert_eq!(inv, vec![BoardOp::MoveToBack { id: "a".into() }]);

        // Forward from the middle: one step back
        let inv = reorder_inverse(&order, "b", &BoardOp::MoveForward { id: "b".into() }).unwrap();
        assert_eq!(inv, vec![BoardOp::MoveBackward { id: "b".into() }]);

        // Back from the end: single MoveToFront restores it
        let inv = reorder_inverse(&order, "d", &BoardOp::MoveToBack { id: "d".into() }).unwrap();
        assert_eq!(inv, vec![BoardOp::MoveToFront { id: "d".into() }]);

        // Already at the front: the op is a no-op, no inverse
        assert!(reorder_inverse(&order, "d", &BoardOp::MoveToFront { id: "d".into() }).is_none());

        // Unknown id: nothing to invert
        assert!(reorder_inverse(&order, "x", &BoardOp::MoveToFront { id: "x".into() }).is_none());
    }

    #[test]
    fn test_provider_config_defaults() {
        let config = ProviderConfig::default();
        assert_eq!(config.offline_queue_limit, 10_000);
        assert_eq!(config.undo_depth, 100);
        assert_eq!(config.reconnect.base, Duration::from_millis(500));
        assert_eq!(config.reconnect.cap, Duration::from_secs(30));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert!(config.cache_path.is_none());
    }
}
