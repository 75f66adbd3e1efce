//! Overlay structure protocol.
//!
//! Nodes form a self-organizing routing tree. Every node carries two roles
//! that may be active at once: a leaf role ([`ResourceNode`]) that joins
//! the tree and reports its zone upward, and an interior role
//! ([`StructureNode`]) that owns a set of child zones, routes insertions,
//! and splits, merges or leaves as its fanout drifts out of bounds.
//!
//! Structural changes run as two-phase-commit transactions: the driver
//! stages its effect in the pending side of each touched [`ZoneCell`],
//! collects acknowledgements from the affected neighborhood, and broadcasts
//! the outcome. A failed transaction leaves every endpoint exactly as it
//! was. Messages that cannot be served while a transaction is open are
//! delayed and replayed when it settles.
//!
//! Endpoints are single-threaded and never block: all effects go through
//! the [`Network`] abstraction, and observers subscribe through the
//! [`EventBroker`].
mod addr;
mod cell;
mod checkpoint;
mod event;
mod msg;
mod net;
mod resource;
mod structure;
pub mod tx;
mod zone;

pub use addr::*;
pub use cell::*;
pub use checkpoint::*;
pub use event::*;
pub use msg::*;
pub use net::*;
pub use resource::*;
pub use structure::*;
pub use tx::NULL_TRANSACTION;
pub use tx::Transaction;
pub use tx::TransactionId;
pub use zone::*;
