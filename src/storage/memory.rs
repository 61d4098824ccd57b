use std::collections::BTreeMap;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::KvEngine;
use crate::error::Error;

type Table = BTreeMap<Vec<u8>, Vec<u8>>;

/// An in-memory engine for tests and ephemeral ledgers.
#[derive(Debug, Default)]
pub struct MemoryEngine {
    tables: RwLock<FxHashMap<String, Table>>,
}

impl MemoryEngine {
    pub fn new() -> MemoryEngine {
        return MemoryEngine {
            tables: RwLock::new(FxHashMap::default()),
        };
    }

    /// Number of entries in `table`.
    pub fn len(&self, table: &str) -> usize {
        return self.tables.read().get(table).map_or(0, |entries| entries.len());
    }
}

impl KvEngine for MemoryEngine {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let tables = self.tables.read();
        return Ok(tables.get(table).and_then(|entries| entries.get(key)).cloned());
    }

    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<(), Error> {
        let mut tables = self.tables.write();
        tables
            .entry(table.to_string())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        return Ok(());
    }

    fn insert_if_absent(&self, table: &str, key: &[u8], value: &[u8]) -> Result<bool, Error> {
        let mut tables = self.tables.write();
        let entries = tables.entry(table.to_string()).or_default();
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_vec(), value.to_vec());
        return Ok(true);
    }

    fn delete(&self, table: &str, key: &[u8]) -> Result<bool, Error> {
        let mut tables = self.tables.write();
        let removed = tables
            .get_mut(table)
            .and_then(|entries| entries.remove(key))
            .is_some();
        return Ok(removed);
    }

    fn for_each(&self, table: &str, visit: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> Result<(), Error> {
        // Snapshot first so `visit` may call back into the engine.
        let snapshot: Vec<(Vec<u8>, Vec<u8>)> = match self.tables.read().get(table) {
            Some(entries) => entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            None => return Ok(()),
        };
        for (key, value) in &snapshot {
            if !visit(key, value) {
                break;
            }
        }
        return Ok(());
    }
}
