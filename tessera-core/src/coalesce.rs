//! Drag coalescing.
//!
//! Continuous moves hit the local store on every pointer event, but the
//! replica only sees one commit per window. Only node ids are tracked here;
//! the bridge reads the final geometry from the store when the window closes.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Coalescing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalesceConfig {
    /// Minimum time between two commits of in-flight drags (default 16ms, one 60Hz frame).
    pub window: Duration,
}

impl Default for CoalesceConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_millis(16),
        }
    }
}

impl CoalesceConfig {
    /// Commit on every flush.
    pub fn for_testing() -> Self {
        Self {
            window: Duration::ZERO,
        }
    }
}

/// Tracks which nodes are mid-drag and when their window closes.
#[derive(Debug, Default)]
pub struct DragCoalescer {
    config: CoalesceConfig,
    pending: BTreeSet<String>,
    window_start: Option<Instant>,
}

impl DragCoalescer {
    pub fn new(config: CoalesceConfig) -> Self {
        Self {
            config,
            pending: BTreeSet::new(),
            window_start: None,
        }
    }

    pub fn config(&self) -> CoalesceConfig {
        self.config
    }

    /// Note a drag step for `node_id`. The window opens on the first step.
    pub fn record(&mut self, node_id: &str, now: Instant) {
        if !self.pending.contains(node_id) {
            self.pending.insert(node_id.to_owned());
        }
        self.window_start.get_or_insert(now);
    }

    pub fn is_pending(&self, node_id: &str) -> bool {
        self.pending.contains(node_id)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Whether the current window has elapsed at `now`.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.window_start {
            Some(start) => now.saturating_duration_since(start) >= self.config.window,
            None => false,
        }
    }

    /// Drain every pending node if the window has elapsed.
    pub fn take_due(&mut self, now: Instant) -> Vec<String> {
        if !self.is_due(now) {
            return Vec::new();
        }
        self.window_start = None;
        std::mem::take(&mut self.pending).into_iter().collect()
    }

    /// Remove `node_id` ahead of its window. Returns whether it was pending.
    pub fn take(&mut self, node_id: &str) -> bool {
        let removed = self.pending.remove(node_id);
        if self.pending.is_empty() {
            self.window_start = None;
        }
        removed
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.window_start = None;
    }
}
