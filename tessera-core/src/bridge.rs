//! Store ⇄ Replica Bridge
//!
//! Keeps a [`LocalStore`] and a [`DiagramDoc`] in step, in both directions.
//! Fully synchronous; the transport only ever sees the outbox.
//!
//! # Architecture
//!
//! ```text
//!  LocalStore ──journal──▸ Bridge::flush ──ops──▸ DiagramDoc ──Update──▸ outbox
//!       ▲                       │
//!       │                  DragCoalescer
//!       │
//!       └──Replica writes── Bridge::apply_remote ◂──Update── transport
//! ```
//!
//! Echo suppression rests on origins: replica writes into the store are
//! tagged [`MutationOrigin::Replica`](crate::store::MutationOrigin) and never
//! journaled, and local-origin replica changes are never mirrored back.

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use crate::coalesce::{CoalesceConfig, DragCoalescer};
use crate::collab::{
    ChangeEvent, ChangeOrigin, Collection, DiagramDoc, DocError, ListenerId, Operation,
    ReconcileScope,
};
use crate::collab::codec::{Update, VersionVector};
use crate::model::Snapshot;
use crate::store::{JournalEntry, LocalStore};

// ─── Error types ──────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Replica error: {0}")]
    Doc(#[from] DocError),

    #[error("Bridge has been disposed")]
    Disposed,
}

/// Counters over the lifetime of a bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Local transactions committed to the replica.
    pub local_commits: u64,
    /// Remote updates that changed the replica.
    pub remote_applied: u64,
    /// Remote updates dropped because they did not decode.
    pub dropped_updates: u64,
    /// Dangling edges removed by reconciliation.
    pub reconciled_edges: u64,
}

type RemoteListener = Box<dyn FnMut(&ChangeEvent) + Send>;

// ─── Bridge ───────────────────────────────────────────────────────────────

pub struct Bridge {
    doc: DiagramDoc,
    store: LocalStore,
    coalescer: DragCoalescer,
    /// Updates waiting for the transport, oldest first.
    outbox: VecDeque<Update>,
    remote_listeners: Vec<(ListenerId, RemoteListener)>,
    next_listener: ListenerId,
    stats: BridgeStats,
    disposed: bool,
}

impl Bridge {
    /// Bind `store` to a fresh replica.
    pub fn new(store: LocalStore, config: CoalesceConfig) -> Self {
        Self::with_doc(DiagramDoc::new(), store, config)
    }

    pub fn with_doc(doc: DiagramDoc, store: LocalStore, config: CoalesceConfig) -> Self {
        Self {
            doc,
            store,
            coalescer: DragCoalescer::new(config),
            outbox: VecDeque::new(),
            remote_listeners: Vec::new(),
            next_listener: 0,
            stats: BridgeStats::default(),
            disposed: false,
        }
    }

    #[inline]
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    #[inline]
    pub fn store_mut(&mut self) -> &mut LocalStore {
        &mut self.store
    }

    #[inline]
    pub fn doc(&self) -> &DiagramDoc {
        &self.doc
    }

    #[inline]
    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    pub fn has_pending_drags(&self) -> bool {
        self.coalescer.has_pending()
    }

    // ─── Local → replica ──────────────────────────────────────────────────

    /// Translate the store's journal into one replica transaction.
    ///
    /// Drag steps are held back until their coalescing window has elapsed at
    /// `now`. Returns the updates this flush produced; they are also queued
    /// in the outbox.
    pub fn flush(&mut self, now: Instant) -> Result<Vec<Update>, BridgeError> {
        self.ensure_live()?;

        let mut produced = Vec::new();
        if let Some(update) = self.commit_journal(now, true)? {
            produced.push(update);
        }
        if let Some(update) = self.reconcile(ReconcileScope::KnownDeleted)? {
            produced.push(update);
        }
        Ok(produced)
    }

    /// Commit the journal as one replica transaction and queue it in the
    /// outbox. Drags whose window has elapsed are included when `take_due`.
    fn commit_journal(&mut self, now: Instant, take_due: bool) -> Result<Option<Update>, BridgeError> {
        let mut touched: Vec<(Collection, String)> = Vec::new();
        let mut seen: HashSet<(Collection, String)> = HashSet::new();
        let mut touch = |collection: Collection, id: String| {
            if seen.insert((collection, id.clone())) {
                touched.push((collection, id));
            }
        };

        for entry in self.store.take_journal() {
            match entry {
                JournalEntry::Node(id) | JournalEntry::EndDrag(id) => {
                    self.coalescer.take(&id);
                    touch(Collection::Nodes, id);
                }
                JournalEntry::Drag(id) => self.coalescer.record(&id, now),
                JournalEntry::Edge(id) => touch(Collection::Edges, id),
                JournalEntry::Meta(key) => touch(Collection::Metadata, key),
            }
        }
        if take_due {
            for id in self.coalescer.take_due(now) {
                touch(Collection::Nodes, id);
            }
        }

        if touched.is_empty() {
            return Ok(None);
        }
        let ops: Vec<Operation> = touched
            .into_iter()
            .map(|(collection, id)| self.operation_for(collection, id))
            .collect();
        log::trace!("Committing {} local operations", ops.len());

        let update = self.doc.apply_local_batch(ops)?;
        self.stats.local_commits += 1;
        self.outbox.push_back(update.clone());
        Ok(Some(update))
    }

    /// The operation that makes the replica match the store for one record.
    fn operation_for(&self, collection: Collection, id: String) -> Operation {
        match collection {
            Collection::Nodes => match self.store.node(&id) {
                Some(node) => Operation::PutNode(node.clone()),
                None => Operation::DeleteNode { id },
            },
            Collection::Edges => match self.store.edge(&id) {
                Some(edge) => Operation::PutEdge(edge.clone()),
                None => Operation::DeleteEdge { id },
            },
            Collection::Metadata => match self.store.meta(&id) {
                Some(value) => Operation::SetMeta {
                    value: value.to_owned(),
                    key: id,
                },
                None => Operation::DeleteMeta { key: id },
            },
        }
    }

    // ─── Remote → store ───────────────────────────────────────────────────

    /// Merge an update from another replica and mirror it into the store.
    ///
    /// Undecodable updates are logged and dropped; the replica and store
    /// stay untouched and `Ok(None)` is returned.
    pub fn apply_remote(&mut self, update: &Update) -> Result<Option<ChangeEvent>, BridgeError> {
        self.ensure_live()?;
        // Unflushed view edits must reach the replica before `mirror` runs.
        // Drags stay with the coalescer.
        if self.store.has_unflushed() {
            self.commit_journal(Instant::now(), false)?;
        }

        let event = match self.doc.apply_remote_update(update) {
            Ok(Some(event)) => event,
            Ok(None) => return Ok(None),
            Err(DocError::Decode(e)) => {
                log::warn!("Dropping malformed remote update ({} bytes): {e}", update.len());
                self.stats.dropped_updates += 1;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        self.stats.remote_applied += 1;
        self.mirror(&event);
        self.notify(&event);
        self.reconcile(ReconcileScope::KnownDeleted)?;
        Ok(Some(event))
    }

    /// Prune every dangling edge. Only meaningful once the replica holds the
    /// full shared state, e.g. right after a bootstrap.
    pub fn reconcile_all(&mut self) -> Result<Option<Update>, BridgeError> {
        self.ensure_live()?;
        self.reconcile(ReconcileScope::All)
    }

    fn reconcile(&mut self, scope: ReconcileScope) -> Result<Option<Update>, BridgeError> {
        let Some(rec) = self.doc.reconcile(scope)? else {
            return Ok(None);
        };
        self.stats.reconciled_edges += rec.event.edges.removed.len() as u64;
        self.mirror(&rec.event);
        self.notify(&rec.event);
        self.outbox.push_back(rec.update.clone());
        Ok(Some(rec.update))
    }

    /// Write a non-local replica change into the store.
    fn mirror(&mut self, event: &ChangeEvent) {
        if event.origin == ChangeOrigin::Local {
            return;
        }

        for id in &event.nodes.removed {
            self.coalescer.take(id);
            self.store.apply_replica_node(id, None);
        }
        for id in event.nodes.upserted() {
            let Some(mut node) = self.doc.node(id) else {
                continue;
            };
            // A drag in flight wins locally until its window commits.
            if self.coalescer.is_pending(id) {
                if let Some(local) = self.store.node(id) {
                    node.geometry.x = local.geometry.x;
                    node.geometry.y = local.geometry.y;
                }
            }
            self.store.apply_replica_node(id, Some(node));
        }

        for id in &event.edges.removed {
            self.store.apply_replica_edge(id, None);
        }
        for id in event.edges.upserted() {
            if let Some(edge) = self.doc.edge(id) {
                self.store.apply_replica_edge(id, Some(edge));
            }
        }

        for key in &event.metadata.removed {
            self.store.apply_replica_meta(key, None);
        }
        for key in event.metadata.upserted() {
            if let Some(value) = self.doc.meta(key) {
                self.store.apply_replica_meta(key, Some(value));
            }
        }
    }

    fn notify(&mut self, event: &ChangeEvent) {
        if event.origin == ChangeOrigin::Local {
            return;
        }
        for (_, listener) in self.remote_listeners.iter_mut() {
            listener(event);
        }
    }

    /// Register a listener for remote and reconcile changes.
    pub fn on_remote_change<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&ChangeEvent) + Send + 'static,
    {
        let id = self.next_listener;
        self.next_listener += 1;
        self.remote_listeners.push((id, Box::new(listener)));
        id
    }

    pub fn remove_remote_listener(&mut self, id: ListenerId) -> bool {
        let before = self.remote_listeners.len();
        self.remote_listeners.retain(|(lid, _)| *lid != id);
        self.remote_listeners.len() != before
    }

    // ─── Transport side ───────────────────────────────────────────────────

    /// Drain every update waiting to be sent, oldest first.
    pub fn take_outbox(&mut self) -> Vec<Update> {
        self.outbox.drain(..).collect()
    }

    pub fn outbox_len(&self) -> usize {
        self.outbox.len()
    }

    pub fn encode_state(&self) -> Update {
        self.doc.encode_state()
    }

    pub fn encode_since(&self, since: &VersionVector) -> Update {
        self.doc.encode_since(since)
    }

    pub fn version_vector(&self) -> VersionVector {
        self.doc.version_vector()
    }

    /// Replica contents. Matches the store once the journal is flushed and
    /// no drag is in flight.
    pub fn snapshot(&self) -> Snapshot {
        self.doc.snapshot()
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────

    /// Tear down replica, store and listeners. Idempotent.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.doc.dispose();
        self.store.dispose();
        self.coalescer.clear();
        self.outbox.clear();
        self.remote_listeners.clear();
        self.disposed = true;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn ensure_live(&self) -> Result<(), BridgeError> {
        if self.disposed {
            Err(BridgeError::Disposed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Edge, Geometry, Node};
    use crate::store::MutationOrigin;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn bridge() -> Bridge {
        Bridge::new(LocalStore::new(), CoalesceConfig::default())
    }

    fn node(id: &str, x: f64, y: f64) -> Node {
        Node::with_id(id, "box", Geometry::new(x, y, 100.0, 50.0))
    }

    /// Deliver everything in `from`'s outbox to `to`.
    fn pump(from: &mut Bridge, to: &mut Bridge) -> usize {
        let updates = from.take_outbox();
        for u in &updates {
            to.apply_remote(u).unwrap();
        }
        updates.len()
    }

    fn settle(a: &mut Bridge, b: &mut Bridge) {
        while pump(a, b) + pump(b, a) > 0 {}
    }

    #[test]
    fn test_local_edit_reaches_remote_store() {
        let mut a = bridge();
        let mut b = bridge();
        let now = Instant::now();

        a.store_mut().upsert_node(node("n1", 0.0, 0.0)).unwrap();
        a.store_mut().set_meta("name", "Orders").unwrap();
        let produced = a.flush(now).unwrap();
        assert_eq!(produced.len(), 1);

        let origins = Arc::new(Mutex::new(Vec::new()));
        let sink = origins.clone();
        b.store_mut().subscribe(move |e| sink.lock().unwrap().push(e.origin));

        pump(&mut a, &mut b);
        assert_eq!(b.store().node("n1"), Some(&node("n1", 0.0, 0.0)));
        assert_eq!(b.store().meta("name"), Some("Orders"));
        assert!(origins.lock().unwrap().iter().all(|o| *o == MutationOrigin::Replica));

        // Mirrored writes are not journaled, so nothing echoes back.
        assert!(b.flush(now).unwrap().is_empty());
        assert_eq!(b.outbox_len(), 0);
    }

    #[test]
    fn test_own_update_does_not_double_apply() {
        let mut a = bridge();
        a.store_mut().upsert_node(node("n1", 0.0, 0.0)).unwrap();
        let produced = a.flush(Instant::now()).unwrap();

        let events = Arc::new(Mutex::new(0));
        let sink = events.clone();
        a.store_mut().subscribe(move |_| *sink.lock().unwrap() += 1);

        assert!(a.apply_remote(&produced[0]).unwrap().is_none());
        assert_eq!(*events.lock().unwrap(), 0);
    }

    #[test]
    fn test_concurrent_creates_converge() {
        let mut a = bridge();
        let mut b = bridge();
        let now = Instant::now();

        a.store_mut().upsert_node(node("n1", 0.0, 0.0)).unwrap();
        b.store_mut().upsert_node(node("n2", 10.0, 10.0)).unwrap();
        a.flush(now).unwrap();
        b.flush(now).unwrap();
        settle(&mut a, &mut b);

        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(a.store().snapshot(), &a.snapshot());
        assert_eq!(b.store().snapshot().nodes.len(), 2);
    }

    #[test]
    fn test_drag_coalesced_into_one_update() {
        let mut a = bridge();
        let mut b = bridge();
        let t0 = Instant::now();

        a.store_mut().upsert_node(node("n1", 0.0, 0.0)).unwrap();
        a.flush(t0).unwrap();
        pump(&mut a, &mut b);

        for i in 1..=100 {
            let at = t0 + Duration::from_micros(150 * i);
            a.store_mut().drag_node("n1", i as f64, i as f64 * 2.0).unwrap();
            assert!(a.flush(at).unwrap().is_empty());
        }
        assert!(a.has_pending_drags());
        assert_eq!(a.store().node("n1").unwrap().geometry.x, 100.0);

        let produced = a.flush(t0 + Duration::from_micros(150) + Duration::from_millis(16)).unwrap();
        assert_eq!(produced.len(), 1);
        assert!(!a.has_pending_drags());

        pump(&mut a, &mut b);
        let g = &b.store().node("n1").unwrap().geometry;
        assert_eq!((g.x, g.y), (100.0, 200.0));
    }

    #[test]
    fn test_end_drag_commits_immediately() {
        let mut a = bridge();
        let t0 = Instant::now();
        a.store_mut().upsert_node(node("n1", 0.0, 0.0)).unwrap();
        a.flush(t0).unwrap();

        a.store_mut().drag_node("n1", 5.0, 5.0).unwrap();
        assert!(a.flush(t0).unwrap().is_empty());
        a.store_mut().drag_node("n1", 7.0, 7.0).unwrap();
        a.store_mut().end_drag("n1").unwrap();

        assert_eq!(a.flush(t0 + Duration::from_millis(1)).unwrap().len(), 1);
        assert_eq!(a.doc().node("n1").unwrap().geometry.x, 7.0);
        assert!(!a.has_pending_drags());
    }

    #[test]
    fn test_remote_move_keeps_local_drag() {
        let mut a = bridge();
        let mut b = bridge();
        let t0 = Instant::now();
        a.store_mut().upsert_node(node("n1", 0.0, 0.0)).unwrap();
        a.flush(t0).unwrap();
        pump(&mut a, &mut b);

        b.store_mut().drag_node("n1", 50.0, 50.0).unwrap();
        b.flush(t0).unwrap();

        a.store_mut()
            .set_node_data("n1", json!({ "label": "Customer" }))
            .unwrap();
        a.flush(t0).unwrap();
        pump(&mut a, &mut b);

        let local = b.store().node("n1").unwrap();
        assert_eq!(local.geometry.x, 50.0);
        assert_eq!(local.data["label"], "Customer");
    }

    #[test]
    fn test_unflushed_edit_survives_remote_change() {
        let mut a = bridge();
        let mut b = bridge();
        let mut c = bridge();
        let now = Instant::now();

        a.store_mut().upsert_node(node("n1", 0.0, 0.0)).unwrap();
        a.store_mut().upsert_node(node("n2", 0.0, 0.0)).unwrap();
        let initial = a.flush(now).unwrap();
        pump(&mut a, &mut b);
        c.apply_remote(&initial[0]).unwrap();

        // Bob relabels n1 and hears about Alice's moves before flushing.
        b.store_mut()
            .set_node_data("n1", json!({ "label": "Bob" }))
            .unwrap();
        a.store_mut().move_node("n1", 40.0, 0.0).unwrap();
        a.store_mut().move_node("n2", 80.0, 0.0).unwrap();
        a.flush(now).unwrap();
        pump(&mut a, &mut b);

        assert!(!b.store().has_unflushed());
        assert_eq!(b.stats().local_commits, 1);
        assert_eq!(b.store().node("n2").unwrap().geometry.x, 80.0);

        let sent = b.take_outbox();
        assert_eq!(sent.len(), 1);
        c.apply_remote(&sent[0]).unwrap();
        assert_eq!(c.store().node("n1").unwrap().data["label"], "Bob");

        for update in &sent {
            a.apply_remote(update).unwrap();
        }
        settle(&mut a, &mut b);
        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(a.store().snapshot(), &a.snapshot());
        assert_eq!(b.store().snapshot(), &b.snapshot());
    }

    #[test]
    fn test_unflushed_delete_sent_before_remote_merge() {
        let mut a = bridge();
        let mut b = bridge();
        let mut c = bridge();
        let now = Instant::now();

        a.store_mut().upsert_node(node("n1", 0.0, 0.0)).unwrap();
        let initial = a.flush(now).unwrap();
        pump(&mut a, &mut b);
        c.apply_remote(&initial[0]).unwrap();

        assert!(b.store_mut().remove_node("n1").unwrap());
        a.store_mut().move_node("n1", 40.0, 0.0).unwrap();
        a.flush(now).unwrap();
        pump(&mut a, &mut b);

        // A later flush has nothing left to recreate n1 from.
        assert!(b.flush(now).unwrap().is_empty());

        let sent = b.take_outbox();
        assert!(!sent.is_empty());
        for update in &sent {
            c.apply_remote(update).unwrap();
            a.apply_remote(update).unwrap();
        }
        assert!(c.store().node("n1").is_none());

        settle(&mut a, &mut b);
        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(a.store().snapshot(), &a.snapshot());
        assert_eq!(b.store().snapshot(), &b.snapshot());
    }

    #[test]
    fn test_malformed_remote_update_dropped() {
        let mut a = bridge();
        a.store_mut().upsert_node(node("n1", 0.0, 0.0)).unwrap();
        a.flush(Instant::now()).unwrap();
        let before = a.snapshot();

        let result = a.apply_remote(&Update::from_bytes(vec![0xFF, 0x00, 0x13]));
        assert!(matches!(result, Ok(None)));
        assert_eq!(a.stats().dropped_updates, 1);
        assert_eq!(a.snapshot(), before);
    }

    #[test]
    fn test_delete_versus_edge_edit() {
        let mut a = bridge();
        let mut b = bridge();
        let now = Instant::now();

        a.store_mut().upsert_node(node("n1", 0.0, 0.0)).unwrap();
        a.store_mut().upsert_node(node("n2", 200.0, 0.0)).unwrap();
        a.store_mut()
            .upsert_edge(Edge::with_id("e1", "assoc", "n1", "n2"))
            .unwrap();
        a.flush(now).unwrap();
        settle(&mut a, &mut b);

        a.store_mut().remove_node("n1").unwrap();
        let produced = a.flush(now).unwrap();
        assert_eq!(produced.len(), 2, "delete plus reconciliation");
        assert!(a.store().edge("e1").is_none());

        b.store_mut()
            .set_edge_data("e1", json!({ "label": "owns" }))
            .unwrap();
        b.flush(now).unwrap();

        settle(&mut a, &mut b);

        for side in [&a, &b] {
            let snapshot = side.snapshot();
            assert!(!snapshot.nodes.contains_key("n1"));
            assert!(!snapshot.edges.contains_key("e1"));
            assert_eq!(side.store().snapshot(), &snapshot);
        }
        assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn test_reconcile_all_after_bootstrap() {
        let mut source = DiagramDoc::new();
        source
            .apply_local_operation(Operation::PutEdge(Edge::with_id("e1", "assoc", "gone", "also-gone")))
            .unwrap();

        let mut b = bridge();
        b.apply_remote(&source.encode_state()).unwrap();
        assert!(b.store().edge("e1").is_some());

        assert!(b.reconcile_all().unwrap().is_some());
        assert!(b.store().edge("e1").is_none());
        assert_eq!(b.stats().reconciled_edges, 1);
    }

    #[test]
    fn test_remote_listener_fires_for_remote_only() {
        let mut a = bridge();
        let mut b = bridge();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        b.on_remote_change(move |e| sink.lock().unwrap().push(e.origin));

        b.store_mut().upsert_node(node("local", 0.0, 0.0)).unwrap();
        b.flush(Instant::now()).unwrap();
        a.store_mut().upsert_node(node("n1", 0.0, 0.0)).unwrap();
        a.flush(Instant::now()).unwrap();
        pump(&mut a, &mut b);

        assert_eq!(*seen.lock().unwrap(), vec![ChangeOrigin::Remote]);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let mut a = bridge();
        a.dispose();
        a.dispose();
        assert!(a.is_disposed());
        assert!(matches!(a.flush(Instant::now()), Err(BridgeError::Disposed)));
        assert!(matches!(a.apply_remote(&Update::empty()), Err(BridgeError::Disposed)));
    }
}
