//! # tessera-core: Replicated diagram model for Tessera
//!
//! Everything a client needs to edit a shared diagram, with no I/O.
//!
//! ## Architecture
//!
//! ```text
//!   view ──mutate──► ┌────────────┐  journal   ┌────────────┐  Update  ┌──────────┐
//!                    │ LocalStore │ ─────────► │   Bridge   │ ───────► │  outbox  │
//!   view ◄─events─── │  (plain)   │ ◄───────── │ + coalesce │ ◄─────── │ (relay)  │
//!                    └────────────┘  replica   └─────┬──────┘  remote  └──────────┘
//!                                                    │
//!                                                    ▼
//!                                              ┌────────────┐
//!                                              │ DiagramDoc │
//!                                              │   (CRDT)   │
//!                                              └────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: Node, edge and snapshot records
//! - [`collab`]: CRDT replica and the update codec
//! - [`store`]: Plain editable store the view renders from
//! - [`coalesce`]: Drag coalescing window
//! - [`bridge`]: Two-way binding between store and replica

pub mod bridge;
pub mod coalesce;
pub mod collab;
pub mod model;
pub mod store;

// Re-exports for convenience
pub use bridge::{Bridge, BridgeError, BridgeStats};
pub use coalesce::{CoalesceConfig, DragCoalescer};
pub use collab::codec::{self, DecodeError, Update, VersionVector};
pub use collab::{
    ChangeEvent, ChangeOrigin, Collection, CollectionDelta, DiagramDoc, DocError, ListenerId,
    Operation, ReconcileScope, Reconciliation,
};
pub use model::{Edge, Geometry, Node, Snapshot};
pub use store::{LocalStore, MutationError, MutationOrigin, StoreChange, StoreEvent};
