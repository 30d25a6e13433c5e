//! Message Store Adapter for Parlor.
//!
//! The engine is agnostic to where messages actually live; it talks to a
//! [`MessageStore`] — a persistent, queryable message log with push
//! notifications for inserts, updates, and deletes.  [`MemoryStore`] is
//! the in-process reference implementation used by embedders without a
//! backend and by the test suites.

pub mod memory;
pub mod traits;

pub use memory::MemoryStore;
pub use traits::{MessageStore, MessageUpdate, StoreEvent, Subscription};
