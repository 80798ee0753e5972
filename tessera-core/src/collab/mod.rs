//! Shared document model: the CRDT replica of one diagram.
//!
//! A [`DiagramDoc`] owns a `yrs` document with three root maps:
//!
//! ```text
//! "nodes"    : node id  -> JSON node record
//! "edges"    : edge id  -> JSON edge record
//! "metadata" : key      -> string
//! ```
//!
//! Every mutation runs inside one transaction tagged with an origin. Map
//! observers collect the touched keys while the transaction commits; the
//! collected set is then handed to listeners as one [`ChangeEvent`], so a
//! merge that touches fifty nodes fires exactly one notification.

pub mod codec;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use yrs::types::map::MapEvent;
use yrs::types::EntryChange;
use yrs::{Doc, Map, MapRef, Observable, Origin, Out, ReadTxn, StateVector, Subscription, Transact, TransactionMut};

use crate::model::{Edge, Node, Snapshot};

pub use codec::{DecodeError, Update, VersionVector};

const NODES: &str = "nodes";
const EDGES: &str = "edges";
const METADATA: &str = "metadata";

const ORIGIN_LOCAL: &str = "tessera:local";
const ORIGIN_REMOTE: &str = "tessera:remote";
const ORIGIN_RECONCILE: &str = "tessera:reconcile";

/// Replica errors.
#[derive(Debug, thiserror::Error)]
pub enum DocError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("record serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("document has been disposed")]
    Disposed,
}

/// A single structural mutation of the diagram.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    PutNode(Node),
    DeleteNode { id: String },
    PutEdge(Edge),
    DeleteEdge { id: String },
    SetMeta { key: String, value: String },
    DeleteMeta { key: String },
}

/// The three collections of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Nodes,
    Edges,
    Metadata,
}

/// Who caused a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// This replica's own edit.
    Local,
    /// An update received from another replica.
    Remote,
    /// Dangling-reference cleanup performed by this replica.
    Reconcile,
}

impl ChangeOrigin {
    fn from_txn(origin: Option<&Origin>) -> Self {
        match origin {
            Some(o) if *o == Origin::from(ORIGIN_LOCAL) => ChangeOrigin::Local,
            Some(o) if *o == Origin::from(ORIGIN_RECONCILE) => ChangeOrigin::Reconcile,
            _ => ChangeOrigin::Remote,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            ChangeOrigin::Local => ORIGIN_LOCAL,
            ChangeOrigin::Remote => ORIGIN_REMOTE,
            ChangeOrigin::Reconcile => ORIGIN_RECONCILE,
        }
    }
}

/// Ids touched in one collection by one transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionDelta {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub removed: Vec<String>,
}

impl CollectionDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Added and updated ids together.
    pub fn upserted(&self) -> impl Iterator<Item = &String> {
        self.added.iter().chain(self.updated.iter())
    }

    fn normalize(&mut self) {
        for ids in [&mut self.added, &mut self.updated, &mut self.removed] {
            ids.sort();
            ids.dedup();
        }
    }
}

/// Batched notification for one committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub origin: ChangeOrigin,
    pub nodes: CollectionDelta,
    pub edges: CollectionDelta,
    pub metadata: CollectionDelta,
}

impl ChangeEvent {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty() && self.metadata.is_empty()
    }

    pub fn delta(&self, collection: Collection) -> &CollectionDelta {
        match collection {
            Collection::Nodes => &self.nodes,
            Collection::Edges => &self.edges,
            Collection::Metadata => &self.metadata,
        }
    }
}

/// Which dangling edges a reconciliation pass may delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileScope {
    /// Only edges pointing at nodes this replica has seen deleted. Edges
    /// whose endpoint simply has not arrived yet are left alone.
    KnownDeleted,
    /// Every edge with a missing endpoint. Only safe when the replica holds
    /// the full shared state, i.e. right after a bootstrap.
    All,
}

/// Result of a reconciliation pass that deleted something.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub update: Update,
    pub event: ChangeEvent,
}

pub type ListenerId = u64;

type Listener = Box<dyn FnMut(&ChangeEvent) + Send>;

#[derive(Default)]
struct PendingChanges {
    origin: Option<ChangeOrigin>,
    nodes: CollectionDelta,
    edges: CollectionDelta,
    metadata: CollectionDelta,
}

impl PendingChanges {
    fn delta_mut(&mut self, collection: Collection) -> &mut CollectionDelta {
        match collection {
            Collection::Nodes => &mut self.nodes,
            Collection::Edges => &mut self.edges,
            Collection::Metadata => &mut self.metadata,
        }
    }
}

fn lock(pending: &Mutex<PendingChanges>) -> MutexGuard<'_, PendingChanges> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A mutation with its record already serialized, so a transaction never
/// fails half way through a batch.
enum Prepared {
    Insert(Collection, String, String),
    Remove(Collection, String),
}

/// One replica of a shared diagram.
pub struct DiagramDoc {
    doc: Doc,
    nodes: MapRef,
    edges: MapRef,
    metadata: MapRef,
    pending: Arc<Mutex<PendingChanges>>,
    subscriptions: Vec<Subscription>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: ListenerId,
    removed_nodes: HashSet<String>,
    disposed: bool,
}

impl DiagramDoc {
    pub fn new() -> Self {
        let doc = Doc::new();
        let nodes = doc.get_or_insert_map(NODES);
        let edges = doc.get_or_insert_map(EDGES);
        let metadata = doc.get_or_insert_map(METADATA);
        let pending = Arc::new(Mutex::new(PendingChanges::default()));

        let subscriptions = vec![
            Self::observe(&nodes, Collection::Nodes, pending.clone()),
            Self::observe(&edges, Collection::Edges, pending.clone()),
            Self::observe(&metadata, Collection::Metadata, pending.clone()),
        ];

        Self {
            doc,
            nodes,
            edges,
            metadata,
            pending,
            subscriptions,
            listeners: Vec::new(),
            next_listener: 0,
            removed_nodes: HashSet::new(),
            disposed: false,
        }
    }

    fn observe(map: &MapRef, collection: Collection, pending: Arc<Mutex<PendingChanges>>) -> Subscription {
        map.observe(move |txn: &TransactionMut, event: &MapEvent| {
            let origin = ChangeOrigin::from_txn(txn.origin());
            let mut pending = lock(&pending);
            pending.origin.get_or_insert(origin);
            let delta = pending.delta_mut(collection);
            for (key, change) in event.keys(txn).iter() {
                let key = key.to_string();
                match change {
                    EntryChange::Inserted(_) => delta.added.push(key),
                    EntryChange::Updated(_, _) => delta.updated.push(key),
                    EntryChange::Removed(_) => delta.removed.push(key),
                }
            }
        })
    }

    // ─── Mutation ─────────────────────────────────────────────────────

    /// Apply one local operation and return the update to broadcast.
    pub fn apply_local_operation(&mut self, op: Operation) -> Result<Update, DocError> {
        self.apply_local_batch([op])
    }

    /// Apply several local operations in a single transaction.
    ///
    /// All records are serialized before the transaction opens; on error
    /// nothing is applied.
    pub fn apply_local_batch<I>(&mut self, ops: I) -> Result<Update, DocError>
    where
        I: IntoIterator<Item = Operation>,
    {
        self.ensure_live()?;
        let prepared = ops
            .into_iter()
            .map(Self::prepare)
            .collect::<Result<Vec<_>, _>>()?;

        let update = self.commit(ChangeOrigin::Local, prepared);
        self.dispatch_pending();
        Ok(update)
    }

    /// Merge an update received from another replica.
    ///
    /// Idempotent and commutative. Returns the batched change, or `None`
    /// when the update carried nothing new. Undecodable bytes leave the
    /// replica untouched.
    pub fn apply_remote_update(&mut self, update: &Update) -> Result<Option<ChangeEvent>, DocError> {
        self.ensure_live()?;
        let decoded = update.decode()?;

        let applied = {
            let mut txn = self.doc.transact_mut_with(ORIGIN_REMOTE);
            txn.apply_update(decoded)
        };
        let event = self.dispatch_pending();
        applied.map_err(|e| DecodeError::Integrate(e.to_string()))?;
        Ok(event)
    }

    /// Delete edges that point at missing nodes.
    ///
    /// The deletions are ordinary CRDT operations tagged with the reconcile
    /// origin, so the returned update must be broadcast like any other.
    pub fn reconcile(&mut self, scope: ReconcileScope) -> Result<Option<Reconciliation>, DocError> {
        self.ensure_live()?;
        let doomed = {
            let txn = self.doc.transact();
            let present: HashSet<String> = self.nodes.keys(&txn).map(str::to_owned).collect();
            self.edges
                .iter(&txn)
                .filter_map(|(id, out)| {
                    let edge: Edge = decode_record(id, out)?;
                    let dangling = [&edge.source, &edge.target].into_iter().any(|end| {
                        !present.contains(end)
                            && (scope == ReconcileScope::All || self.removed_nodes.contains(end))
                    });
                    dangling.then(|| id.to_string())
                })
                .collect::<Vec<_>>()
        };

        if doomed.is_empty() {
            return Ok(None);
        }

        log::debug!("Reconcile ({scope:?}) removing {} dangling edges", doomed.len());
        let prepared = doomed
            .into_iter()
            .map(|id| Prepared::Remove(Collection::Edges, id))
            .collect();
        let update = self.commit(ChangeOrigin::Reconcile, prepared);
        Ok(self
            .dispatch_pending()
            .map(|event| Reconciliation { update, event }))
    }

    fn prepare(op: Operation) -> Result<Prepared, DocError> {
        let prepared = match op {
            Operation::PutNode(node) => {
                require_id("node", &node.id)?;
                let json = serde_json::to_string(&node)?;
                Prepared::Insert(Collection::Nodes, node.id, json)
            }
            Operation::DeleteNode { id } => Prepared::Remove(Collection::Nodes, id),
            Operation::PutEdge(edge) => {
                require_id("edge", &edge.id)?;
                let json = serde_json::to_string(&edge)?;
                Prepared::Insert(Collection::Edges, edge.id, json)
            }
            Operation::DeleteEdge { id } => Prepared::Remove(Collection::Edges, id),
            Operation::SetMeta { key, value } => {
                require_id("metadata key", &key)?;
                Prepared::Insert(Collection::Metadata, key, value)
            }
            Operation::DeleteMeta { key } => Prepared::Remove(Collection::Metadata, key),
        };
        Ok(prepared)
    }

    fn commit(&self, origin: ChangeOrigin, prepared: Vec<Prepared>) -> Update {
        let mut txn = self.doc.transact_mut_with(origin.tag());
        for mutation in prepared {
            match mutation {
                Prepared::Insert(collection, key, value) => {
                    self.map(collection).insert(&mut txn, key, value);
                }
                Prepared::Remove(collection, key) => {
                    self.map(collection).remove(&mut txn, &key);
                }
            }
        }
        Update::from_bytes(txn.encode_update_v1())
    }

    fn dispatch_pending(&mut self) -> Option<ChangeEvent> {
        let pending = std::mem::take(&mut *lock(&self.pending));
        let origin = pending.origin?;

        let mut event = ChangeEvent {
            origin,
            nodes: pending.nodes,
            edges: pending.edges,
            metadata: pending.metadata,
        };
        event.nodes.normalize();
        event.edges.normalize();
        event.metadata.normalize();
        if event.is_empty() {
            return None;
        }

        for id in &event.nodes.removed {
            self.removed_nodes.insert(id.clone());
        }
        for id in &event.nodes.added {
            self.removed_nodes.remove(id);
        }

        for (_, listener) in self.listeners.iter_mut() {
            listener(&event);
        }
        Some(event)
    }

    // ─── Encoding ─────────────────────────────────────────────────────

    /// Full state, enough to bootstrap an empty replica.
    pub fn encode_state(&self) -> Update {
        let txn = self.doc.transact();
        Update::from_bytes(txn.encode_state_as_update_v1(&StateVector::default()))
    }

    /// Only what a replica at `since` is missing.
    pub fn encode_since(&self, since: &VersionVector) -> Update {
        let txn = self.doc.transact();
        Update::from_bytes(txn.encode_diff_v1(since.as_state_vector()))
    }

    pub fn version_vector(&self) -> VersionVector {
        let txn = self.doc.transact();
        VersionVector::from_state_vector(txn.state_vector())
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn node(&self, id: &str) -> Option<Node> {
        let txn = self.doc.transact();
        self.nodes.get(&txn, id).and_then(|out| decode_record(id, out))
    }

    pub fn edge(&self, id: &str) -> Option<Edge> {
        let txn = self.doc.transact();
        self.edges.get(&txn, id).and_then(|out| decode_record(id, out))
    }

    pub fn meta(&self, key: &str) -> Option<String> {
        let txn = self.doc.transact();
        self.metadata.get(&txn, key).and_then(out_string)
    }

    pub fn snapshot(&self) -> Snapshot {
        let txn = self.doc.transact();
        let mut snapshot = Snapshot::default();
        for (id, out) in self.nodes.iter(&txn) {
            if let Some(node) = decode_record::<Node>(id, out) {
                snapshot.nodes.insert(id.to_string(), node);
            }
        }
        for (id, out) in self.edges.iter(&txn) {
            if let Some(edge) = decode_record::<Edge>(id, out) {
                snapshot.edges.insert(id.to_string(), edge);
            }
        }
        for (key, out) in self.metadata.iter(&txn) {
            if let Some(value) = out_string(out) {
                snapshot.metadata.insert(key.to_string(), value);
            }
        }
        snapshot
    }

    // ─── Listeners & lifecycle ────────────────────────────────────────

    /// Register a listener fired once per committed change.
    pub fn on_change<F>(&mut self, listener: F) -> ListenerId
    where
        F: FnMut(&ChangeEvent) + Send + 'static,
    {
        let id = self.next_listener;
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    /// Detach observers and listeners. Further mutations fail with
    /// [`DocError::Disposed`]; reads keep working.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.subscriptions.clear();
        self.listeners.clear();
        self.disposed = true;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn ensure_live(&self) -> Result<(), DocError> {
        if self.disposed {
            Err(DocError::Disposed)
        } else {
            Ok(())
        }
    }

    fn map(&self, collection: Collection) -> &MapRef {
        match collection {
            Collection::Nodes => &self.nodes,
            Collection::Edges => &self.edges,
            Collection::Metadata => &self.metadata,
        }
    }
}

impl Default for DiagramDoc {
    fn default() -> Self {
        Self::new()
    }
}

fn require_id(what: &str, id: &str) -> Result<(), DocError> {
    if id.is_empty() {
        return Err(DocError::InvalidOperation(format!("{what} id must not be empty")));
    }
    Ok(())
}

fn out_string(out: Out) -> Option<String> {
    match out {
        Out::Any(yrs::Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

fn decode_record<T: serde::de::DeserializeOwned>(id: &str, out: Out) -> Option<T> {
    let json = out_string(out)?;
    match serde_json::from_str(&json) {
        Ok(record) => Some(record),
        Err(e) => {
            log::warn!("Skipping unreadable record {id}: {e}");
            None
        }
    }
}
