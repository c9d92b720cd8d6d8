//! Entry storage for tributary.
//!
//! [`EntryStore`] is the abstract interface; [`InMemoryEntryStore`] is the
//! default backend. The `persistent` feature adds a durable, WAL-backed one.

mod index;
mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::InMemoryEntryStore;
pub use traits::{
    CommitOutcome, Committed, EntryStore, KeyFilter, StateGuard, StateWrite, StorageError,
    StoredState, WriteBatch,
};
