//! Estate index crate - spatial index, cluster store, deduplication and queries.
//!
//! Provides a sharded geographic grid index, an in-memory cluster store,
//! the deduplicator that folds listings into clusters under per-cell locks,
//! a query engine for region + attribute searches, and the `Inventory`
//! facade tying them together.

pub mod dedup;
pub mod inventory;
pub mod locks;
pub mod query;
pub mod similarity;
pub mod snapshot;
pub mod spatial;
pub mod store;

#[cfg(test)]
mod test_support;

pub use dedup::{Deduplicator, IngestKind, IngestOutcome};
pub use inventory::{Inventory, InventoryStats};
pub use query::{Deadline, Filters, PageRequest, Query, QueryEngine, QueryPage, Region, SortKey};
pub use snapshot::Snapshot;
pub use spatial::SpatialIndex;
pub use store::ClusterStore;
