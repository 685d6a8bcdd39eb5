//! Ephemeral presence ("awareness") for board rooms.
//!
//! Awareness travels out-of-band from document deltas: each peer owns one
//! [`AwarenessState`] that it re-publishes in full on every change, and
//! receivers replace their copy wholesale (last write wins per peer). Nothing
//! here is ever persisted or snapshotted; a peer's entry exists exactly as
//! long as its connection does.
//!
//! ```text
//! local cursor move
//!       │
//!       ▼
//! LocalAwareness::set_cursor()   (throttled to 30 Hz)
//!       │
//!       ▼
//! SyncMessage::Awareness ── broadcast ──► PresenceTable::apply()
//!                                          (LWW replace per peer)
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Minimum interval between cursor broadcasts (30 Hz).
pub const CURSOR_BROADCAST_INTERVAL: Duration = Duration::from_millis(33);

/// Cursor position in board (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPos {
    pub x: f64,
    pub y: f64,
}

/// One peer's complete presence state.
///
/// Replaced wholesale on every update; fields are never merged
/// individually.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub user_id: String,
    pub display_name: String,
    /// CSS color, stable per user (see [`color_for_user`])
    pub color: String,
    /// Absent while the pointer is outside the board
    pub cursor: Option<CursorPos>,
    /// Ids of currently selected stickies/shapes
    pub selection: Vec<String>,
}

impl AwarenessState {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let color = color_for_user(&user_id);
        Self {
            user_id,
            display_name: display_name.into(),
            color,
            cursor: None,
            selection: Vec::new(),
        }
    }
}

/// Stable CSS color for a user id.
///
/// Hashes the id string and picks a hue; saturation/lightness are fixed so
/// every user gets a vivid, readable cursor color. The same user gets the
/// same color on every device.
pub fn color_for_user(user_id: &str) -> String {
    let mut hash: i32 = 0;
    for c in user_id.chars() {
        hash = (c as i32).wrapping_add(hash.wrapping_shl(5).wrapping_sub(hash));
    }
    let hue = hash.unsigned_abs() % 360;
    format!("hsl({hue}, 70%, 45%)")
}

// ───────────────────────────────────────────────────────────────────
// Presence table — one per room (server) or per provider (client)
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PeerPresence {
    state: AwarenessState,
    last_seen: Instant,
}

/// Tracks the awareness state of every peer in a room.
///
/// Server-side there is one table per room; client-side one per provider
/// (holding the remote peers). Entries are replaced on update and removed
/// on disconnect. [`PresenceTable::cleanup_idle`] catches peers whose
/// connection died without a clean leave.
pub struct PresenceTable {
    peers: HashMap<Uuid, PeerPresence>,
    idle_timeout: Duration,
}

impl PresenceTable {
    pub fn new() -> Self {
        Self {
            peers: HashMap::new(),
            idle_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_idle_timeout(idle_timeout: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            idle_timeout,
        }
    }

    /// Replace (or create) a peer's state. Last write wins.
    pub fn apply(&mut self, peer_id: Uuid, state: AwarenessState) {
        self.peers.insert(
            peer_id,
            PeerPresence {
                state,
                last_seen: Instant::now(),
            },
        );
    }

    /// Drop a peer's entry. Returns true if the peer was present.
    pub fn remove(&mut self, peer_id: Uuid) -> bool {
        self.peers.remove(&peer_id).is_some()
    }

    pub fn get(&self, peer_id: Uuid) -> Option<&AwarenessState> {
        self.peers.get(&peer_id).map(|p| &p.state)
    }

    /// Snapshot of all current states, for handing to a newly joined peer.
    pub fn states(&self) -> Vec<(Uuid, AwarenessState)> {
        self.peers
            .iter()
            .map(|(id, p)| (*id, p.state.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }

    /// Remove peers not heard from within the idle timeout.
    ///
    /// Returns the removed peer ids so callers can broadcast their
    /// departure.
    pub fn cleanup_idle(&mut self) -> Vec<Uuid> {
        let timeout = self.idle_timeout;
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|(_, p)| p.last_seen.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }
}

impl Default for PresenceTable {
    fn default() -> Self {
        Self::new()
    }
}

// ───────────────────────────────────────────────────────────────────
// Local awareness — the state this peer publishes
// ───────────────────────────────────────────────────────────────────

/// The local peer's own awareness state plus broadcast throttling.
///
/// Cursor moves arrive at pointer-event rate; publishing each one would
/// flood the room, so cursor changes are coalesced to one broadcast per
/// [`CURSOR_BROADCAST_INTERVAL`] (the final position always wins on the
/// next flush). Selection changes and clears publish immediately.
pub struct LocalAwareness {
    state: AwarenessState,
    last_cursor_broadcast: Instant,
    cursor_interval: Duration,
}

impl LocalAwareness {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            state: AwarenessState::new(user_id, display_name),
            // allow the first cursor broadcast immediately
            last_cursor_broadcast: Instant::now() - Duration::from_secs(1),
            cursor_interval: CURSOR_BROADCAST_INTERVAL,
        }
    }

    /// Custom throttle interval, for tests.
    pub fn with_cursor_interval(mut self, interval: Duration) -> Self {
        self.cursor_interval = interval;
        self
    }

    /// Move the cursor. Returns the state to broadcast, or `None` while
    /// throttled (the position is still recorded and goes out with the
    /// next flush).
    pub fn set_cursor(&mut self, x: f64, y: f64) -> Option<AwarenessState> {
        self.state.cursor = Some(CursorPos { x, y });
        if self.last_cursor_broadcast.elapsed() < self.cursor_interval {
            return None;
        }
        self.last_cursor_broadcast = Instant::now();
        Some(self.state.clone())
    }

    /// Publish the current state regardless of throttling.
    pub fn flush(&mut self) -> AwarenessState {
        self.last_cursor_broadcast = Instant::now();
        self.state.clone()
    }

    /// Replace the selection. Always broadcasts.
    pub fn set_selection(&mut self, ids: Vec<String>) -> AwarenessState {
        self.state.selection = ids;
        self.state.clone()
    }

    /// Pointer left the board. Always broadcasts.
    pub fn clear_cursor(&mut self) -> AwarenessState {
        self.state.cursor = None;
        self.state.clone()
    }

    pub fn state(&self) -> &AwarenessState {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn color_is_stable_and_valid() {
        let a = color_for_user("user-42");
        let b = color_for_user("user-42");
        assert_eq!(a, b);
        assert!(a.starts_with("hsl("));
        assert!(a.ends_with(", 70%, 45%)"));
    }

    #[test]
    fn color_differs_across_users() {
        // Not guaranteed for all pairs, but these hash apart
        assert_ne!(color_for_user("alice"), color_for_user("bob"));
    }

    #[test]
    fn state_roundtrip() {
        let mut state = AwarenessState::new("u-1", "Alice");
        state.cursor = Some(CursorPos { x: 10.0, y: 20.0 });
        state.selection = vec!["note-a".into()];

        let bytes =
            bincode::serde::encode_to_vec(&state, bincode::config::standard()).unwrap();
        let (decoded, _): (AwarenessState, _) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn table_apply_replaces_wholesale() {
        let mut table = PresenceTable::new();
        let peer = Uuid::new_v4();

        let mut first = AwarenessState::new("u-1", "Alice");
        first.cursor = Some(CursorPos { x: 1.0, y: 2.0 });
        first.selection = vec!["a".into(), "b".into()];
        table.apply(peer, first);

        // Second state has no cursor and no selection; both must vanish
        let second = AwarenessState::new("u-1", "Alice");
        table.apply(peer, second.clone());

        assert_eq!(table.len(), 1);
        assert_eq!(table.get(peer), Some(&second));
        assert!(table.get(peer).unwrap().cursor.is_none());
    }

    #[test]
    fn table_remove() {
        let mut table = PresenceTable::new();
        let peer = Uuid::new_v4();
        table.apply(peer, AwarenessState::new("u-1", "Alice"));

        assert!(table.remove(peer));
        assert!(!table.remove(peer));
        assert!(table.is_empty());
    }

    #[test]
    fn table_states_snapshot() {
        let mut table = PresenceTable::new();
        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        table.apply(p1, AwarenessState::new("u-1", "Alice"));
        table.apply(p2, AwarenessState::new("u-2", "Bob"));

        let states = table.states();
        assert_eq!(states.len(), 2);
        assert!(states.iter().any(|(id, s)| *id == p1 && s.user_id == "u-1"));
        assert!(states.iter().any(|(id, s)| *id == p2 && s.user_id == "u-2"));
    }

    #[test]
    fn table_idle_cleanup() {
        let mut table = PresenceTable::with_idle_timeout(Duration::from_millis(5));
        let fresh = Uuid::new_v4();
        let stale = Uuid::new_v4();

        table.apply(stale, AwarenessState::new("u-old", "Old"));
        thread::sleep(Duration::from_millis(10));
        table.apply(fresh, AwarenessState::new("u-new", "New"));

        let removed = table.cleanup_idle();
        assert_eq!(removed, vec![stale]);
        assert!(table.get(fresh).is_some());
        assert!(table.get(stale).is_none());
    }

    #[test]
    fn cursor_broadcast_throttled() {
        let mut local = LocalAwareness::new("u-1", "Alice")
            .with_cursor_interval(Duration::from_millis(33));

        // First broadcast goes out immediately
        assert!(local.set_cursor(10.0, 20.0).is_some());
        // Immediate follow-up is coalesced
        assert!(local.set_cursor(11.0, 21.0).is_none());
        // ...but the position is retained for the next flush
        let flushed = local.flush();
        assert_eq!(flushed.cursor, Some(CursorPos { x: 11.0, y: 21.0 }));
    }

    #[test]
    fn cursor_broadcast_after_interval() {
        let mut local =
            LocalAwareness::new("u-1", "Alice").with_cursor_interval(Duration::from_millis(5));

        let _ = local.set_cursor(1.0, 1.0);
        thread::sleep(Duration::from_millis(10));
        assert!(local.set_cursor(2.0, 2.0).is_some());
    }

    #[test]
    fn selection_always_broadcasts() {
        let mut local = LocalAwareness::new("u-1", "Alice");
        let _ = local.set_cursor(1.0, 1.0);

        let state = local.set_selection(vec!["note-1".into()]);
        assert_eq!(state.selection, vec!["note-1".to_string()]);

        // And again immediately — no throttle on selection
        let state = local.set_selection(vec![]);
        assert!(state.selection.is_empty());
    }

    #[test]
    fn clear_cursor_drops_position() {
        let mut local = LocalAwareness::new("u-1", "Alice");
        let _ = local.set_cursor(5.0, 5.0);

        let state = local.clear_cursor();
        assert!(state.cursor.is_none());
        assert!(local.state().cursor.is_none());
    }
}
