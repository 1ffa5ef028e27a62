//! Pod storage: authoritative in-memory table + durable RocksDB layer.
//!
//! ```text
//! WriteCoordinator
//!       │ closure-based read-modify-write (per-record lock)
//!       ▼
//! PodTable (memory.rs)  ◄── authority, linearization point
//!       │ write-through after commit
//!       ▼
//! PodStore (rocks.rs)   ◄── durability, startup recovery
//! ```
//!
//! The table is the authority: every write commits there first, under the
//! record's own lock, with no cross-pod mutual exclusion. The RocksDB layer
//! trails it for durability and seeds it again on startup.

pub mod memory;
pub mod rocks;

pub use memory::PodTable;
pub use rocks::{PodStore, StoreConfig, StoreError, StoreStats};
