//! Compile-unit tree and transactional graph builder for cadence.
//!
//! `unit` tracks which deployable modules are stale and swaps them into
//! the JIT; `transaction` is the batched graph-description API the host
//! uses to reshape the running instrument.

mod transaction;
mod unit;

pub use transaction::{
    GraphLookup, GroupDef, NodeDef, NodeKind, NodeRef, RootRef, SocketDef, SurfaceDef,
    SurfaceRef, Transaction, ValueGroupSource,
};
pub use unit::{UnitId, UnitTree};
