//! Durable engine state
//!
//! The registry is snapshotted to JSON after every mutating cycle. The
//! snapshot records which account and strategy tag it belongs to, so a
//! restart against a different account starts fresh instead of adopting
//! foreign batches.

pub mod snapshot;
pub mod store;

pub use snapshot::Snapshot;
pub use store::{SnapshotSource, SnapshotStore};
