//! Plain diagram records shared by the replica, the local store and the view.
//!
//! Records are stored inside the CRDT as JSON strings keyed by id, so every
//! type here round-trips through `serde_json`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Well-known metadata key: human readable diagram name.
pub const META_NAME: &str = "name";
/// Well-known metadata key: diagram flavour (class, sequence, flow, ...).
pub const META_DIAGRAM_TYPE: &str = "diagram_type";
/// Well-known metadata key: version of the record schema.
pub const META_SCHEMA_VERSION: &str = "schema_version";

/// Position and size of a node, plus its optional container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Geometry {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl Geometry {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
            parent_id: None,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

/// A diagram node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub geometry: Geometry,
    #[serde(default)]
    pub data: Value,
}

impl Node {
    /// Create a node with a fresh random id.
    pub fn new(kind: impl Into<String>, geometry: Geometry) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind, geometry)
    }

    pub fn with_id(id: impl Into<String>, kind: impl Into<String>, geometry: Geometry) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            geometry,
            data: Value::Null,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// A directed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub source: String,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Edge {
    /// Create an edge with a fresh random id.
    pub fn new(kind: impl Into<String>, source: impl Into<String>, target: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), kind, source, target)
    }

    pub fn with_id(
        id: impl Into<String>,
        kind: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
            data: Value::Null,
        }
    }

    pub fn with_handles(mut self, source: Option<String>, target: Option<String>) -> Self {
        self.source_handle = source;
        self.target_handle = target;
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Whether either endpoint is `node_id`.
    pub fn touches(&self, node_id: &str) -> bool {
        self.source == node_id || self.target == node_id
    }
}

/// Plain, ordered copy of a document's three collections.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub nodes: BTreeMap<String, Node>,
    pub edges: BTreeMap<String, Edge>,
    pub metadata: BTreeMap<String, String>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.edges.is_empty() && self.metadata.is_empty()
    }

    /// Ids of edges with at least one endpoint missing from `nodes`.
    pub fn dangling_edges(&self) -> Vec<String> {
        self.edges
            .values()
            .filter(|e| !self.nodes.contains_key(&e.source) || !self.nodes.contains_key(&e.target))
            .map(|e| e.id.clone())
            .collect()
    }

    /// Whether giving `node_id` the parent `new_parent` would close a containment loop.
    pub fn would_create_cycle(&self, node_id: &str, new_parent: Option<&str>) -> bool {
        let mut cursor = new_parent.map(str::to_owned);
        let mut seen = HashSet::new();
        while let Some(current) = cursor {
            if current == node_id {
                return true;
            }
            if !seen.insert(current.clone()) {
                // Pre-existing loop above us that does not include node_id.
                return false;
            }
            cursor = self
                .nodes
                .get(&current)
                .and_then(|n| n.geometry.parent_id.clone());
        }
        false
    }

    /// Ids of nodes that sit on a parent cycle. Concurrent re-parenting can
    /// produce these after a merge; the model does not repair them.
    pub fn containment_cycles(&self) -> Vec<String> {
        let limit = self.nodes.len();
        self.nodes
            .values()
            .filter(|node| {
                let mut cursor = node.geometry.parent_id.as_deref();
                for _ in 0..limit {
                    match cursor {
                        Some(id) if id == node.id => return true,
                        Some(id) => {
                            cursor = self
                                .nodes
                                .get(id)
                                .and_then(|n| n.geometry.parent_id.as_deref());
                        }
                        None => return false,
                    }
                }
                false
            })
            .map(|n| n.id.clone())
            .collect()
    }
}
