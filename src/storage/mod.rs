//! Key-value engines the object storage persists into.
//!
//! The index treats the engine as a black box with single-key atomic
//! operations. Tables are addressed by name; an engine creates a table on
//! first write and treats a missing table as empty.

mod durable;
mod memory;

pub use durable::RedbEngine;
pub use memory::MemoryEngine;

use crate::error::Error;

/// A durable byte-oriented key-value store.
pub trait KvEngine: Send + Sync {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;

    /// Write `value` under `key`, replacing anything there.
    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<(), Error>;

    /// Write `value` under `key` only if the key is vacant. Returns true if
    /// this call wrote it. Must be atomic with respect to concurrent callers.
    fn insert_if_absent(&self, table: &str, key: &[u8], value: &[u8]) -> Result<bool, Error>;

    /// Remove `key`, returning true if it was present.
    fn delete(&self, table: &str, key: &[u8]) -> Result<bool, Error>;

    /// Visit entries in ascending key order until `visit` returns false.
    fn for_each(&self, table: &str, visit: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> Result<(), Error>;
}
