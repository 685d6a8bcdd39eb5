//! Board rooms: one live session per open board.
//!
//! A [`Room`] owns the authoritative [`BoardDocument`] replica, a broadcast
//! channel for fan-out to connected peers, the presence table, and the
//! snapshot dirtiness tracking. The [`RoomRegistry`] owns the rooms and
//! drives their lifecycle:
//!
//! ```text
//!           open_room(board_id)                 last peer leaves
//!   ┌────────┐ ───────────────────▶ ┌────────┐ ────────────────▶ snapshot
//!   │ absent │                      │ active │                   awaited,
//!   └────────┘ ◀─────────────────── └────────┘                   room freed
//!                close_if_empty
//! ```
//!
//! Reopening a closed board builds a fresh room seeded from the latest
//! snapshot. All merges for a room serialize through one async mutex, so
//! per-room effects apply in arrival order.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;
use uuid::Uuid;

use crate::awareness::{AwarenessState, PresenceTable};
use crate::board::{BoardDocument, BoardError};
use crate::protocol::{PeerInfo, SyncMessage};
use crate::store::{BoardRecord, SnapshotStore, StoreError};

/// Title a board gets if nobody ever set one.
const DEFAULT_BOARD_TITLE: &str = "Untitled board";

/// When and how aggressively boards are persisted.
#[derive(Debug, Clone)]
pub struct SnapshotPolicy {
    /// Save once this many merged updates have accumulated
    pub update_threshold: u64,
    /// Save once this much time has passed with pending updates
    pub period: Duration,
    /// Snapshots kept per board; older ones are deleted after each save
    pub retention: usize,
    /// How often the background timer re-checks every room
    pub timer_interval: Duration,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            update_threshold: 500,
            period: Duration::from_secs(300),
            retention: 5,
            timer_interval: Duration::from_secs(30),
        }
    }
}

impl SnapshotPolicy {
    /// Aggressive policy for tests: tiny threshold, short period.
    pub fn for_testing() -> Self {
        Self {
            update_threshold: 3,
            period: Duration::from_secs(1),
            retention: 2,
            timer_interval: Duration::from_millis(100),
        }
    }
}

/// Per-room counters.
#[derive(Debug, Clone, Default)]
pub struct RoomStats {
    pub deltas_merged: u64,
    pub deltas_dropped: u64,
    pub messages_sent: u64,
    pub snapshots_saved: u64,
}

/// Lock-free counters behind `RoomStats` snapshots.
struct AtomicRoomStats {
    deltas_merged: AtomicU64,
    deltas_dropped: AtomicU64,
    messages_sent: AtomicU64,
    snapshots_saved: AtomicU64,
}

impl AtomicRoomStats {
    fn new() -> Self {
        Self {
            deltas_merged: AtomicU64::new(0),
            deltas_dropped: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            snapshots_saved: AtomicU64::new(0),
        }
    }
}

/// Room-level errors: a room touches both the document and the store.
#[derive(Debug)]
pub enum RoomError {
    Document(BoardError),
    Storage(StoreError),
}

impl From<BoardError> for RoomError {
    fn from(e: BoardError) -> Self {
        RoomError::Document(e)
    }
}

impl From<StoreError> for RoomError {
    fn from(e: StoreError) -> Self {
        RoomError::Storage(e)
    }
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomError::Document(e) => write!(f, "Document error: {e}"),
            RoomError::Storage(e) => write!(f, "Storage error: {e}"),
        }
    }
}

impl std::error::Error for RoomError {}

/// One live board session.
///
/// Everything mutable is interior: rooms are shared as `Arc<Room>` between
/// every connection task on the board.
pub struct Room {
    board_id: Uuid,
    /// Authoritative replica; merges serialize through this lock
    doc: Mutex<BoardDocument>,
    /// Fan-out channel; each peer task holds a receiver
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    /// Connected peers
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
    /// Ephemeral presence, last write wins per peer
    presence: RwLock<PresenceTable>,
    /// Merged updates not yet covered by a snapshot
    pending_updates: AtomicU64,
    /// When the last snapshot was taken
    last_snapshot: Mutex<Instant>,
    /// Set while the registry tears the room down; joins bounce off
    closed: AtomicBool,
    capacity: usize,
    stats: AtomicRoomStats,
}

impl Room {
    /// Create a room around an existing document replica.
    pub fn new(doc: BoardDocument, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            board_id: doc.board_id(),
            doc: Mutex::new(doc),
            sender,
            peers: RwLock::new(HashMap::new()),
            presence: RwLock::new(PresenceTable::new()),
            pending_updates: AtomicU64::new(0),
            last_snapshot: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
            capacity,
            stats: AtomicRoomStats::new(),
        }
    }

    pub fn board_id(&self) -> Uuid {
        self.board_id
    }

    /// Lock the authoritative document.
    pub async fn doc(&self) -> tokio::sync::MutexGuard<'_, BoardDocument> {
        self.doc.lock().await
    }

    // ─── Peers ───────────────────────────────────────────────────

    /// Register a peer and hand it a broadcast receiver.
    ///
    /// Returns `None` if the registry is tearing the room down; the caller
    /// should re-open the board and get a fresh room.
    pub async fn join(&self, info: PeerInfo) -> Option<broadcast::Receiver<Arc<Vec<u8>>>> {
        let mut peers = self.peers.write().await;
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        peers.insert(info.peer_id, info);
        Some(self.sender.subscribe())
    }

    /// Remove a peer and its presence entry.
    pub async fn leave(&self, peer_id: Uuid) -> Option<PeerInfo> {
        let info = self.peers.write().await.remove(&peer_id);
        if info.is_some() {
            self.presence.write().await.remove(peer_id);
        }
        info
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, peer_id: Uuid) -> bool {
        self.peers.read().await.contains_key(&peer_id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ─── Document ────────────────────────────────────────────────

    /// Merge one peer delta into the authoritative replica.
    ///
    /// A malformed delta is an error for the caller to log; the room keeps
    /// running and the delta is counted as dropped.
    pub async fn merge_delta(&self, payload: &[u8]) -> Result<(), BoardError> {
        let mut doc = self.doc.lock().await;
        match doc.merge_remote_delta(payload) {
            Ok(()) => {
                self.pending_updates.fetch_add(1, Ordering::Relaxed);
                self.stats.deltas_merged.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.deltas_dropped.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    /// Full state for a newcomer's catch-up.
    pub async fn full_state(&self) -> Vec<u8> {
        self.doc.lock().await.encode_full_state()
    }

    /// Diff against a peer's state vector.
    pub async fn encode_diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, BoardError> {
        self.doc.lock().await.encode_diff(state_vector)
    }

    // ─── Presence ────────────────────────────────────────────────

    /// Apply a peer's awareness state (wholesale replace).
    pub async fn apply_awareness(&self, peer_id: Uuid, state: AwarenessState) {
        self.presence.write().await.apply(peer_id, state);
    }

    /// Drop a peer's awareness state. True if it existed.
    pub async fn clear_awareness(&self, peer_id: Uuid) -> bool {
        self.presence.write().await.remove(peer_id)
    }

    /// Everyone's current awareness, for seeding a newcomer.
    pub async fn awareness_states(&self) -> Vec<(Uuid, AwarenessState)> {
        self.presence.read().await.states()
    }

    // ─── Fan-out ─────────────────────────────────────────────────

    /// Broadcast a message to every subscribed peer. Receivers see their
    /// own messages too; echo suppression is the connection task's job.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, crate::protocol::ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes (no re-serialization).
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Subscribe without registering as a peer (monitoring, tests).
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // ─── Snapshots ───────────────────────────────────────────────

    /// Merged updates not yet covered by a snapshot.
    pub fn pending_updates(&self) -> u64 {
        self.pending_updates.load(Ordering::Relaxed)
    }

    /// Save a snapshot if either trigger fires: enough updates since the
    /// last save, or enough time with at least one pending update.
    pub async fn snapshot_if_due(
        &self,
        store: &SnapshotStore,
        policy: &SnapshotPolicy,
    ) -> Result<bool, StoreError> {
        let pending = self.pending_updates.load(Ordering::Relaxed);
        if pending == 0 {
            return Ok(false);
        }
        let elapsed = self.last_snapshot.lock().await.elapsed();
        if pending < policy.update_threshold && elapsed < policy.period {
            return Ok(false);
        }
        self.snapshot_now(store, policy).await?;
        Ok(true)
    }

    /// Save a snapshot unconditionally and enforce retention.
    pub async fn snapshot_now(
        &self,
        store: &SnapshotStore,
        policy: &SnapshotPolicy,
    ) -> Result<BoardRecord, StoreError> {
        let state = self.doc.lock().await.encode_full_state();
        let record = store.save_snapshot(self.board_id, &state)?;
        let removed = store.cleanup_old_snapshots(self.board_id, policy.retention)?;
        self.pending_updates.store(0, Ordering::Relaxed);
        *self.last_snapshot.lock().await = Instant::now();
        self.stats.snapshots_saved.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Snapshot saved for board {} ({} bytes compressed, {removed} expired)",
            self.board_id,
            record.compressed_size
        );
        Ok(record)
    }

    /// Get room statistics.
    pub fn stats(&self) -> RoomStats {
        RoomStats {
            deltas_merged: self.stats.deltas_merged.load(Ordering::Relaxed),
            deltas_dropped: self.stats.deltas_dropped.load(Ordering::Relaxed),
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            snapshots_saved: self.stats.snapshots_saved.load(Ordering::Relaxed),
        }
    }
}

/// Registry of live rooms: board_id → room, with explicit open/close.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    capacity: usize,
    policy: SnapshotPolicy,
    store: Option<Arc<SnapshotStore>>,
}

impl RoomRegistry {
    pub fn new(capacity: usize, policy: SnapshotPolicy, store: Option<Arc<SnapshotStore>>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            capacity,
            policy,
            store,
        }
    }

    pub fn policy(&self) -> &SnapshotPolicy {
        &self.policy
    }

    pub fn store(&self) -> Option<&Arc<SnapshotStore>> {
        self.store.as_ref()
    }

    /// Get the live room for a board, creating it if absent.
    ///
    /// A fresh room is seeded from the latest persisted snapshot when one
    /// exists; otherwise the board starts empty with default settings.
    pub async fn open_room(&self, board_id: Uuid) -> Result<Arc<Room>, RoomError> {
        // Fast path: read lock
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&board_id) {
                if !room.is_closed() {
                    return Ok(room.clone());
                }
            }
        }

        // Slow path: write lock to create
        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(room) = rooms.get(&board_id) {
            if !room.is_closed() {
                return Ok(room.clone());
            }
        }

        let mut doc = match self.load_persisted(board_id)? {
            Some(doc) => {
                log::info!("Board {board_id} restored from snapshot");
                doc
            }
            None => BoardDocument::new(board_id),
        };
        // First opener after a cold start seeds the default settings; an
        // already-titled board keeps its replicated title
        doc.init_meta(DEFAULT_BOARD_TITLE)?;

        let room = Arc::new(Room::new(doc, self.capacity));
        rooms.insert(board_id, room.clone());
        log::info!("Room opened for board {board_id}");
        Ok(room)
    }

    fn load_persisted(&self, board_id: Uuid) -> Result<Option<BoardDocument>, RoomError> {
        let Some(store) = &self.store else {
            return Ok(None);
        };
        match store.get_latest_snapshot(board_id)? {
            Some(snapshot) => Ok(Some(BoardDocument::from_full_state(
                board_id,
                &snapshot.state,
            )?)),
            None => Ok(None),
        }
    }

    /// Get a live room without creating one.
    pub async fn get(&self, board_id: Uuid) -> Option<Arc<Room>> {
        let rooms = self.rooms.read().await;
        rooms.get(&board_id).filter(|r| !r.is_closed()).cloned()
    }

    /// Tear down a room if its last peer has left. The final snapshot is
    /// written and awaited before the room disappears, so no acknowledged
    /// edit is lost to the teardown itself.
    pub async fn close_if_empty(&self, board_id: Uuid) -> Result<bool, RoomError> {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(&board_id).cloned() else {
            return Ok(false);
        };

        {
            // Closing races against joins: both sides take the peers write
            // lock, and `closed` flips inside it, so a join either lands
            // before the emptiness check or bounces off the closed flag
            let peers = room.peers.write().await;
            if !peers.is_empty() {
                return Ok(false);
            }
            room.closed.store(true, Ordering::SeqCst);
        }

        if let Some(store) = &self.store {
            if room.pending_updates() > 0 {
                room.snapshot_now(store, &self.policy).await?;
            }
        }

        rooms.remove(&board_id);
        log::info!("Room closed for board {board_id} (empty)");
        Ok(true)
    }

    /// Run the snapshot triggers across every live room. Returns how many
    /// rooms were persisted. Called from the server's background timer.
    pub async fn snapshot_pass(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let rooms: Vec<Arc<Room>> = {
            let rooms = self.rooms.read().await;
            rooms.values().cloned().collect()
        };

        let mut saved = 0;
        for room in rooms {
            match room.snapshot_if_due(store, &self.policy).await {
                Ok(true) => saved += 1,
                Ok(false) => {}
                Err(e) => {
                    log::error!("Snapshot failed for board {}: {e}", room.board_id());
                }
            }
        }
        saved
    }

    /// Persist every dirty room and flush the store. Called on shutdown.
    pub async fn shutdown(&self) -> Result<usize, RoomError> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let rooms: Vec<Arc<Room>> = {
            let rooms = self.rooms.read().await;
            rooms.values().cloned().collect()
        };

        let mut saved = 0;
        for room in rooms {
            if room.pending_updates() > 0 {
                room.snapshot_now(store, &self.policy).await?;
                saved += 1;
            }
        }
        store.sync()?;
        Ok(saved)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_boards(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
