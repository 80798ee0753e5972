//! Local store: the plain, directly editable copy of a diagram the view
//! renders from.
//!
//! The store is an explicit object with a lifecycle:
//!
//! ```text
//!  new ──▸ subscribe ──▸ mutate* ──▸ dispose
//! ```
//!
//! Every mutation carries a [`MutationOrigin`]. View mutations are written to
//! a journal the [`Bridge`](crate::bridge::Bridge) drains into replica
//! operations; replica mutations only notify subscribers.

use serde_json::Value;

use crate::collab::Collection;
use crate::model::{Edge, Geometry, Node, Snapshot};

// ─── Types ────────────────────────────────────────────────────────────────

/// Who performed a store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOrigin {
    /// The user, through the view.
    View,
    /// The bridge, mirroring a merged replica change.
    Replica,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Added(String),
    Updated(String),
    Removed(String),
}

impl StoreChange {
    pub fn id(&self) -> &str {
        match self {
            StoreChange::Added(id) | StoreChange::Updated(id) | StoreChange::Removed(id) => id,
        }
    }
}

/// Notification for one changed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    pub origin: MutationOrigin,
    pub collection: Collection,
    pub change: StoreChange,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MutationError {
    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Unknown edge: {0}")]
    UnknownEdge(String),

    #[error("Parenting '{node}' under '{parent}' would create a containment cycle")]
    ContainmentCycle { node: String, parent: String },

    #[error("Store has been disposed")]
    Disposed,
}

/// A view mutation awaiting translation into replica operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JournalEntry {
    Node(String),
    Edge(String),
    Meta(String),
    /// A coalesced move; committed when the drag window closes.
    Drag(String),
    EndDrag(String),
}

pub type SubscriptionId = u64;

type Subscriber = Box<dyn FnMut(&StoreEvent) + Send>;

// ─── Store ────────────────────────────────────────────────────────────────

pub struct LocalStore {
    data: Snapshot,
    journal: Vec<JournalEntry>,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_subscriber: SubscriptionId,
    disposed: bool,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore {
    pub fn new() -> Self {
        Self {
            data: Snapshot::default(),
            journal: Vec::new(),
            subscribers: Vec::new(),
            next_subscriber: 0,
            disposed: false,
        }
    }

    /// Register a callback fired for every record change, whatever its origin.
    pub fn subscribe<F>(&mut self, subscriber: F) -> SubscriptionId
    where
        F: FnMut(&StoreEvent) + Send + 'static,
    {
        let id = self.next_subscriber;
        self.next_subscriber += 1;
        self.subscribers.push((id, Box::new(subscriber)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    /// Drop subscribers and the pending journal. Idempotent.
    pub fn dispose(&mut self) {
        self.subscribers.clear();
        self.journal.clear();
        self.disposed = true;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    // ─── Reads ────────────────────────────────────────────────────────────

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.data.nodes.get(id)
    }

    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.data.edges.get(id)
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.data.metadata.get(key).map(String::as_str)
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.data
    }

    /// Whether view mutations are waiting for the bridge.
    pub fn has_unflushed(&self) -> bool {
        !self.journal.is_empty()
    }

    // ─── View mutations ───────────────────────────────────────────────────

    /// Insert or replace a node.
    pub fn upsert_node(&mut self, node: Node) -> Result<(), MutationError> {
        self.ensure_live()?;
        if let Some(parent) = node.geometry.parent_id.as_deref() {
            self.check_parent(&node.id, parent)?;
        }
        let id = node.id.clone();
        self.put_node(node, MutationOrigin::View);
        self.journal.push(JournalEntry::Node(id));
        Ok(())
    }

    /// Returns whether the node existed. Edges touching it are left to
    /// reconciliation.
    pub fn remove_node(&mut self, id: &str) -> Result<bool, MutationError> {
        self.ensure_live()?;
        let removed = self.drop_node(id, MutationOrigin::View);
        if removed {
            self.journal.push(JournalEntry::Node(id.to_owned()));
        }
        Ok(removed)
    }

    /// Discrete move, committed on the next flush.
    pub fn move_node(&mut self, id: &str, x: f64, y: f64) -> Result<(), MutationError> {
        self.edit_node(id, JournalEntry::Node(id.to_owned()), |g| {
            g.x = x;
            g.y = y;
        })
    }

    /// One step of a continuous move. The store updates at once; the
    /// replica sees the final position once per coalescing window.
    pub fn drag_node(&mut self, id: &str, x: f64, y: f64) -> Result<(), MutationError> {
        self.edit_node(id, JournalEntry::Drag(id.to_owned()), |g| {
            g.x = x;
            g.y = y;
        })
    }

    /// Finish a drag; the final position commits on the next flush.
    pub fn end_drag(&mut self, id: &str) -> Result<(), MutationError> {
        self.ensure_live()?;
        if !self.data.nodes.contains_key(id) {
            return Err(MutationError::UnknownNode(id.to_owned()));
        }
        self.journal.push(JournalEntry::EndDrag(id.to_owned()));
        Ok(())
    }

    pub fn resize_node(&mut self, id: &str, width: f64, height: f64) -> Result<(), MutationError> {
        self.edit_node(id, JournalEntry::Node(id.to_owned()), |g| {
            g.width = width;
            g.height = height;
        })
    }

    /// Refuses a parent that would close a containment loop.
    pub fn set_parent(&mut self, id: &str, parent: Option<&str>) -> Result<(), MutationError> {
        self.ensure_live()?;
        if let Some(parent) = parent {
            self.check_parent(id, parent)?;
        }
        let parent = parent.map(str::to_owned);
        self.edit_node(id, JournalEntry::Node(id.to_owned()), move |g| g.parent_id = parent)
    }

    pub fn set_node_data(&mut self, id: &str, data: Value) -> Result<(), MutationError> {
        self.ensure_live()?;
        let mut node = self
            .data
            .nodes
            .get(id)
            .cloned()
            .ok_or_else(|| MutationError::UnknownNode(id.to_owned()))?;
        node.data = data;
        self.put_node(node, MutationOrigin::View);
        self.journal.push(JournalEntry::Node(id.to_owned()));
        Ok(())
    }

    /// Insert or replace an edge. Endpoints are not checked: edges may
    /// briefly reference nodes that have not arrived yet.
    pub fn upsert_edge(&mut self, edge: Edge) -> Result<(), MutationError> {
        self.ensure_live()?;
        let id = edge.id.clone();
        self.put_edge(edge, MutationOrigin::View);
        self.journal.push(JournalEntry::Edge(id));
        Ok(())
    }

    pub fn set_edge_data(&mut self, id: &str, data: Value) -> Result<(), MutationError> {
        self.ensure_live()?;
        let mut edge = self
            .data
            .edges
            .get(id)
            .cloned()
            .ok_or_else(|| MutationError::UnknownEdge(id.to_owned()))?;
        edge.data = data;
        self.put_edge(edge, MutationOrigin::View);
        self.journal.push(JournalEntry::Edge(id.to_owned()));
        Ok(())
    }

    pub fn remove_edge(&mut self, id: &str) -> Result<bool, MutationError> {
        self.ensure_live()?;
        let removed = self.drop_edge(id, MutationOrigin::View);
        if removed {
            self.journal.push(JournalEntry::Edge(id.to_owned()));
        }
        Ok(removed)
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<String>) -> Result<(), MutationError> {
        self.ensure_live()?;
        self.put_meta(key, value.into(), MutationOrigin::View);
        self.journal.push(JournalEntry::Meta(key.to_owned()));
        Ok(())
    }

    pub fn remove_meta(&mut self, key: &str) -> Result<bool, MutationError> {
        self.ensure_live()?;
        let removed = self.drop_meta(key, MutationOrigin::View);
        if removed {
            self.journal.push(JournalEntry::Meta(key.to_owned()));
        }
        Ok(removed)
    }

    // ─── Replica mutations (bridge only, never journaled) ─────────────────

    pub(crate) fn apply_replica_node(&mut self, id: &str, node: Option<Node>) {
        if self.disposed {
            return;
        }
        match node {
            Some(node) => self.put_node(node, MutationOrigin::Replica),
            None => {
                self.drop_node(id, MutationOrigin::Replica);
            }
        }
    }

    pub(crate) fn apply_replica_edge(&mut self, id: &str, edge: Option<Edge>) {
        if self.disposed {
            return;
        }
        match edge {
            Some(edge) => self.put_edge(edge, MutationOrigin::Replica),
            None => {
                self.drop_edge(id, MutationOrigin::Replica);
            }
        }
    }

    pub(crate) fn apply_replica_meta(&mut self, key: &str, value: Option<String>) {
        if self.disposed {
            return;
        }
        match value {
            Some(value) => self.put_meta(key, value, MutationOrigin::Replica),
            None => {
                self.drop_meta(key, MutationOrigin::Replica);
            }
        }
    }

    pub(crate) fn take_journal(&mut self) -> Vec<JournalEntry> {
        std::mem::take(&mut self.journal)
    }

    // ─── Internals ────────────────────────────────────────────────────────

    fn ensure_live(&self) -> Result<(), MutationError> {
        if self.disposed {
            Err(MutationError::Disposed)
        } else {
            Ok(())
        }
    }

    fn check_parent(&self, id: &str, parent: &str) -> Result<(), MutationError> {
        if self.data.would_create_cycle(id, Some(parent)) {
            return Err(MutationError::ContainmentCycle {
                node: id.to_owned(),
                parent: parent.to_owned(),
            });
        }
        Ok(())
    }

    fn edit_node<F>(&mut self, id: &str, entry: JournalEntry, edit: F) -> Result<(), MutationError>
    where
        F: FnOnce(&mut Geometry),
    {
        self.ensure_live()?;
        let node = self
            .data
            .nodes
            .get_mut(id)
            .ok_or_else(|| MutationError::UnknownNode(id.to_owned()))?;
        edit(&mut node.geometry);
        self.journal.push(entry);
        self.emit(MutationOrigin::View, Collection::Nodes, StoreChange::Updated(id.to_owned()));
        Ok(())
    }

    fn put_node(&mut self, node: Node, origin: MutationOrigin) {
        let id = node.id.clone();
        let change = match self.data.nodes.insert(id.clone(), node) {
            Some(_) => StoreChange::Updated(id),
            None => StoreChange::Added(id),
        };
        self.emit(origin, Collection::Nodes, change);
    }

    fn drop_node(&mut self, id: &str, origin: MutationOrigin) -> bool {
        let removed = self.data.nodes.remove(id).is_some();
        if removed {
            self.emit(origin, Collection::Nodes, StoreChange::Removed(id.to_owned()));
        }
        removed
    }

    fn put_edge(&mut self, edge: Edge, origin: MutationOrigin) {
        let id = edge.id.clone();
        let change = match self.data.edges.insert(id.clone(), edge) {
            Some(_) => StoreChange::Updated(id),
            None => StoreChange::Added(id),
        };
        self.emit(origin, Collection::Edges, change);
    }

    fn drop_edge(&mut self, id: &str, origin: MutationOrigin) -> bool {
        let removed = self.data.edges.remove(id).is_some();
        if removed {
            self.emit(origin, Collection::Edges, StoreChange::Removed(id.to_owned()));
        }
        removed
    }

    fn put_meta(&mut self, key: &str, value: String, origin: MutationOrigin) {
        let change = match self.data.metadata.insert(key.to_owned(), value) {
            Some(_) => StoreChange::Updated(key.to_owned()),
            None => StoreChange::Added(key.to_owned()),
        };
        self.emit(origin, Collection::Metadata, change);
    }

    fn drop_meta(&mut self, key: &str, origin: MutationOrigin) -> bool {
        let removed = self.data.metadata.remove(key).is_some();
        if removed {
            self.emit(origin, Collection::Metadata, StoreChange::Removed(key.to_owned()));
        }
        removed
    }

    fn emit(&mut self, origin: MutationOrigin, collection: Collection, change: StoreChange) {
        let event = StoreEvent {
            origin,
            collection,
            change,
        };
        for (_, subscriber) in self.subscribers.iter_mut() {
            subscriber(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn node(id: &str) -> Node {
        Node::with_id(id, "box", Geometry::new(0.0, 0.0, 10.0, 10.0))
    }

    fn recording(store: &mut LocalStore) -> Arc<Mutex<Vec<StoreEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        store.subscribe(move |e| sink.lock().unwrap().push(e.clone()));
        events
    }

    #[test]
    fn test_view_mutations_are_journaled() {
        let mut store = LocalStore::new();
        store.upsert_node(node("n1")).unwrap();
        store.move_node("n1", 5.0, 6.0).unwrap();
        store.set_meta("name", "Orders").unwrap();

        assert_eq!(
            store.take_journal(),
            vec![
                JournalEntry::Node("n1".into()),
                JournalEntry::Node("n1".into()),
                JournalEntry::Meta("name".into()),
            ]
        );
        assert!(!store.has_unflushed());
        assert_eq!(store.node("n1").unwrap().geometry.x, 5.0);
    }

    #[test]
    fn test_replica_mutations_are_not_journaled() {
        let mut store = LocalStore::new();
        let events = recording(&mut store);

        store.apply_replica_node("n1", Some(node("n1")));
        store.apply_replica_node("n1", None);

        assert!(store.take_journal().is_empty());
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.origin == MutationOrigin::Replica));
        assert_eq!(events[1].change, StoreChange::Removed("n1".into()));
    }

    #[test]
    fn test_subscriber_sees_added_then_updated() {
        let mut store = LocalStore::new();
        let events = recording(&mut store);

        store.upsert_node(node("n1")).unwrap();
        store.upsert_node(node("n1")).unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events[0].change, StoreChange::Added("n1".into()));
        assert_eq!(events[1].change, StoreChange::Updated("n1".into()));
        assert_eq!(events[1].origin, MutationOrigin::View);
    }

    #[test]
    fn test_unknown_node_rejected() {
        let mut store = LocalStore::new();
        assert_eq!(
            store.move_node("ghost", 1.0, 1.0),
            Err(MutationError::UnknownNode("ghost".into()))
        );
        assert!(store.take_journal().is_empty());
    }

    #[test]
    fn test_set_parent_refuses_cycle() {
        let mut store = LocalStore::new();
        store.upsert_node(node("a")).unwrap();
        store.upsert_node(node("b")).unwrap();
        store.set_parent("b", Some("a")).unwrap();

        let err = store.set_parent("a", Some("b")).unwrap_err();
        assert!(matches!(err, MutationError::ContainmentCycle { .. }));
        assert_eq!(store.node("a").unwrap().geometry.parent_id, None);
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let mut store = LocalStore::new();
        assert!(!store.remove_node("n1").unwrap());
        assert!(!store.remove_edge("e1").unwrap());
        assert!(store.take_journal().is_empty());
    }

    #[test]
    fn test_dispose() {
        let mut store = LocalStore::new();
        let events = recording(&mut store);
        store.dispose();
        store.dispose();

        assert_eq!(store.upsert_node(node("n1")), Err(MutationError::Disposed));
        store.apply_replica_node("n1", Some(node("n1")));
        assert!(events.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unsubscribe() {
        let mut store = LocalStore::new();
        let count = Arc::new(Mutex::new(0));
        let sink = count.clone();
        let id = store.subscribe(move |_| *sink.lock().unwrap() += 1);

        store.set_meta("name", "a").unwrap();
        assert!(store.unsubscribe(id));
        store.set_meta("name", "b").unwrap();
        assert_eq!(*count.lock().unwrap(), 1);
    }
}
