//! Presence: who is in the room, where their cursor is, what they selected.
//!
//! Presence rides the relay as `Awareness` frames and is never persisted.
//!
//! ```text
//! local pointer move
//!       │
//!       ▼
//! PresenceRoom::update_local_cursor()   (throttled: 30Hz)
//!       │
//!       ▼
//! AwarenessMessage::Cursor ──Awareness frame──▸ relay ──▸ peers
//!                                                          │
//!                                                          ▼
//!                                            PresenceRoom::handle_message()
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::ProtocolError;

/// Minimum interval between two cursor broadcasts (30Hz).
pub const CURSOR_INTERVAL: Duration = Duration::from_millis(33);

/// Peers silent for this long are dropped.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Position in diagram coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// RGBA cursor color.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorColor {
    pub r: f32,
    pub g: f32,
    pub b: f32,
    pub a: f32,
}

impl CursorColor {
    /// Stable, saturated color derived from a peer id.
    pub fn from_uuid(id: Uuid) -> Self {
        let hue = (id.as_u128() % 360) as f32 / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
        Self { r, g, b, a: 1.0 }
    }

    pub fn to_array(&self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a]
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        Self { r: 0.26, g: 0.52, b: 0.96, a: 1.0 }
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_channel(p, q, h + 1.0 / 3.0),
        hue_to_channel(p, q, h),
        hue_to_channel(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_channel(p: f32, q: f32, t: f32) -> f32 {
    let t = t.rem_euclid(1.0);
    if t < 1.0 / 6.0 {
        p + (q - p) * 6.0 * t
    } else if t < 0.5 {
        q
    } else if t < 2.0 / 3.0 {
        p + (q - p) * (2.0 / 3.0 - t) * 6.0
    } else {
        p
    }
}

// ───────────────────────────────────────────────────────────────────
// Wire messages
// ───────────────────────────────────────────────────────────────────

/// Payload of an `Awareness` frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum AwarenessMessage {
    Join {
        user_id: Uuid,
        user_name: String,
        user_color: CursorColor,
    },

    Leave {
        user_id: Uuid,
    },

    /// High frequency, throttled by the sender.
    Cursor {
        user_id: Uuid,
        position: Point,
        /// Sender-local counter; older values are ignored.
        timestamp: u64,
    },

    Selection {
        user_id: Uuid,
        node_ids: Vec<String>,
        edge_ids: Vec<String>,
    },
}

impl AwarenessMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    pub fn user_id(&self) -> Uuid {
        match self {
            AwarenessMessage::Join { user_id, .. }
            | AwarenessMessage::Leave { user_id }
            | AwarenessMessage::Cursor { user_id, .. }
            | AwarenessMessage::Selection { user_id, .. } => *user_id,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Remote peers
// ───────────────────────────────────────────────────────────────────

/// What we know about one remote peer.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePeer {
    pub user_id: Uuid,
    pub user_name: String,
    pub color: CursorColor,
    pub cursor: Option<Point>,
    pub selected_nodes: Vec<String>,
    pub selected_edges: Vec<String>,
    last_seen: Instant,
    last_timestamp: u64,
}

impl RemotePeer {
    fn new(user_id: Uuid, user_name: String, color: CursorColor, now: Instant) -> Self {
        Self {
            user_id,
            user_name,
            color,
            cursor: None,
            selected_nodes: Vec::new(),
            selected_edges: Vec::new(),
            last_seen: now,
            last_timestamp: 0,
        }
    }

    /// Placeholder for a peer whose `Join` we missed.
    fn unnamed(user_id: Uuid, now: Instant) -> Self {
        let short = user_id.simple().to_string();
        Self::new(
            user_id,
            format!("Peer-{}", &short[..8]),
            CursorColor::from_uuid(user_id),
            now,
        )
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

// ───────────────────────────────────────────────────────────────────
// Presence room
// ───────────────────────────────────────────────────────────────────

/// Presence state of one document, as seen by the local peer.
pub struct PresenceRoom {
    local_user_id: Uuid,
    peers: HashMap<Uuid, RemotePeer>,
    cursor_interval: Duration,
    idle_timeout: Duration,
    last_cursor_broadcast: Option<Instant>,
    /// Latest local position held back by the throttle.
    pending_cursor: Option<Point>,
    timestamp_counter: u64,
}

impl PresenceRoom {
    pub fn new(local_user_id: Uuid) -> Self {
        Self::with_intervals(local_user_id, CURSOR_INTERVAL, IDLE_TIMEOUT)
    }

    pub fn with_intervals(local_user_id: Uuid, cursor_interval: Duration, idle_timeout: Duration) -> Self {
        Self {
            local_user_id,
            peers: HashMap::new(),
            cursor_interval,
            idle_timeout,
            last_cursor_broadcast: None,
            pending_cursor: None,
            timestamp_counter: 0,
        }
    }

    pub fn local_user_id(&self) -> Uuid {
        self.local_user_id
    }

    /// Apply a message from the network. Returns whether anything changed.
    ///
    /// Our own messages and cursor updates older than the last one seen are
    /// ignored.
    pub fn handle_message(&mut self, msg: &AwarenessMessage, now: Instant) -> bool {
        if msg.user_id() == self.local_user_id {
            return false;
        }

        match msg {
            AwarenessMessage::Join { user_id, user_name, user_color } => {
                let peer = self
                    .peers
                    .entry(*user_id)
                    .or_insert_with(|| RemotePeer::new(*user_id, user_name.clone(), *user_color, now));
                peer.user_name = user_name.clone();
                peer.color = *user_color;
                peer.last_seen = now;
                true
            }

            AwarenessMessage::Leave { user_id } => self.peers.remove(user_id).is_some(),

            AwarenessMessage::Cursor { user_id, position, timestamp } => {
                let peer = self
                    .peers
                    .entry(*user_id)
                    .or_insert_with(|| RemotePeer::unnamed(*user_id, now));
                if *timestamp <= peer.last_timestamp {
                    log::trace!("Ignoring stale cursor from {user_id}");
                    return false;
                }
                peer.cursor = Some(*position);
                peer.last_timestamp = *timestamp;
                peer.last_seen = now;
                true
            }

            AwarenessMessage::Selection { user_id, node_ids, edge_ids } => {
                let peer = self
                    .peers
                    .entry(*user_id)
                    .or_insert_with(|| RemotePeer::unnamed(*user_id, now));
                peer.selected_nodes = node_ids.clone();
                peer.selected_edges = edge_ids.clone();
                peer.last_seen = now;
                true
            }
        }
    }

    /// Record the local cursor. Returns a message to broadcast unless the
    /// throttle holds it back; a held-back position is sent by
    /// [`flush_cursor`](Self::flush_cursor).
    pub fn update_local_cursor(&mut self, position: Point, now: Instant) -> Option<AwarenessMessage> {
        self.pending_cursor = Some(position);
        self.flush_cursor(now)
    }

    /// Emit the held-back cursor position once the throttle allows it.
    pub fn flush_cursor(&mut self, now: Instant) -> Option<AwarenessMessage> {
        let throttled = self
            .last_cursor_broadcast
            .is_some_and(|last| now.saturating_duration_since(last) < self.cursor_interval);
        if throttled {
            return None;
        }

        let position = self.pending_cursor.take()?;
        self.timestamp_counter += 1;
        self.last_cursor_broadcast = Some(now);
        Some(AwarenessMessage::Cursor {
            user_id: self.local_user_id,
            position,
            timestamp: self.timestamp_counter,
        })
    }

    pub fn update_local_selection(&self, node_ids: Vec<String>, edge_ids: Vec<String>) -> AwarenessMessage {
        AwarenessMessage::Selection {
            user_id: self.local_user_id,
            node_ids,
            edge_ids,
        }
    }

    pub fn join_message(&self, user_name: impl Into<String>) -> AwarenessMessage {
        AwarenessMessage::Join {
            user_id: self.local_user_id,
            user_name: user_name.into(),
            user_color: CursorColor::from_uuid(self.local_user_id),
        }
    }

    pub fn leave_message(&self) -> AwarenessMessage {
        AwarenessMessage::Leave {
            user_id: self.local_user_id,
        }
    }

    /// Forget a peer, e.g. when the relay reports it left.
    pub fn remove_peer(&mut self, user_id: &Uuid) -> bool {
        self.peers.remove(user_id).is_some()
    }

    pub fn peer(&self, user_id: &Uuid) -> Option<&RemotePeer> {
        self.peers.get(user_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &RemotePeer> {
        self.peers.values()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Drop peers not heard from within the idle timeout.
    pub fn cleanup_idle_peers(&mut self, now: Instant) -> Vec<Uuid> {
        let timeout = self.idle_timeout;
        let stale: Vec<Uuid> = self
            .peers
            .values()
            .filter(|p| p.is_idle(now, timeout))
            .map(|p| p.user_id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }
}
