use std::path::Path;

use redb::Database;
use redb::ReadableTable;
use redb::TableDefinition;

use super::KvEngine;
use crate::error::Error;
use crate::error::StorageError;

fn definition(name: &str) -> TableDefinition<'_, &'static [u8], &'static [u8]> {
    return TableDefinition::new(name);
}

/// A `redb`-backed engine with one byte table per name.
///
/// redb allows a single write transaction at a time, so a read and a
/// write inside one transaction form an atomic compare-and-swap.
pub struct RedbEngine {
    db: Database,
}

impl RedbEngine {
    /// Open or create the database file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<RedbEngine, Error> {
        let db = Database::create(path.as_ref()).map_err(StorageError::from)?;
        tracing::debug!(path = %path.as_ref().display(), "opened redb engine");
        return Ok(RedbEngine { db });
    }

    /// A database that lives only in memory.
    pub fn in_memory() -> Result<RedbEngine, Error> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(StorageError::from)?;
        return Ok(RedbEngine { db });
    }

    fn get_inner(&self, name: &str, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(definition(name)) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let value = table.get(key)?.map(|guard| guard.value().to_vec());
        return Ok(value);
    }

    fn put_inner(&self, name: &str, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(definition(name))?;
            table.insert(key, value)?;
        }
        txn.commit()?;
        return Ok(());
    }

    fn insert_if_absent_inner(&self, name: &str, key: &[u8], value: &[u8]) -> Result<bool, StorageError> {
        let txn = self.db.begin_write()?;
        let inserted = {
            let mut table = txn.open_table(definition(name))?;
            let present = table.get(key)?.is_some();
            if !present {
                table.insert(key, value)?;
            }
            !present
        };
        txn.commit()?;
        return Ok(inserted);
    }

    fn delete_inner(&self, name: &str, key: &[u8]) -> Result<bool, StorageError> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(definition(name))?;
            let removed = table.remove(key)?.is_some();
            removed
        };
        txn.commit()?;
        return Ok(removed);
    }

    fn for_each_inner(&self, name: &str, visit: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> Result<(), StorageError> {
        let txn = self.db.begin_read()?;
        let table = match txn.open_table(definition(name)) {
            Ok(table) => table,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for entry in table.iter()? {
            let (key, value) = entry?;
            if !visit(key.value(), value.value()) {
                break;
            }
        }
        return Ok(());
    }
}

impl KvEngine for RedbEngine {
    fn get(&self, table: &str, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        return Ok(self.get_inner(table, key)?);
    }

    fn put(&self, table: &str, key: &[u8], value: &[u8]) -> Result<(), Error> {
        return Ok(self.put_inner(table, key, value)?);
    }

    fn insert_if_absent(&self, table: &str, key: &[u8], value: &[u8]) -> Result<bool, Error> {
        return Ok(self.insert_if_absent_inner(table, key, value)?);
    }

    fn delete(&self, table: &str, key: &[u8]) -> Result<bool, Error> {
        return Ok(self.delete_inner(table, key)?);
    }

    fn for_each(&self, table: &str, visit: &mut dyn FnMut(&[u8], &[u8]) -> bool) -> Result<(), Error> {
        return Ok(self.for_each_inner(table, visit)?);
    }
}
