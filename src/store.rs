//! The persisted sequence index: sequences plus their alias mappings.

use std::sync::Arc;
use std::time::Duration;

use crate::alias::SequenceAliasMapping;
use crate::cache::CachedHandle;
use crate::cache::ObjectStorage;
use crate::error::Error;
use crate::id::Index;
use crate::id::SequenceAlias;
use crate::id::SequenceId;
use crate::id::SequenceIdAllocator;
use crate::markers::Markers;
use crate::sequence::Sequence;
use crate::storage::KvEngine;
use crate::storage::MemoryEngine;

/// Table names and locking behavior of a `SequenceStore`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreConfig {
    pub sequence_table: String,
    pub alias_table: String,
    /// How long a write waits for a key's lock before failing with
    /// `Error::Unavailable`. `None` waits indefinitely.
    pub lock_timeout: Option<Duration>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        return StoreConfig {
            sequence_table: "sequences".to_string(),
            alias_table: "sequence_aliases".to_string(),
            lock_timeout: None,
        };
    }
}

/// Cached, persisted storage for sequences and alias mappings.
#[derive(Clone)]
pub struct SequenceStore {
    sequences: ObjectStorage<Sequence>,
    aliases: ObjectStorage<SequenceAliasMapping>,
}

impl SequenceStore {
    pub fn new(engine: Arc<dyn KvEngine>, config: StoreConfig) -> SequenceStore {
        return SequenceStore {
            sequences: ObjectStorage::new(engine.clone(), config.sequence_table, config.lock_timeout),
            aliases: ObjectStorage::new(engine, config.alias_table, config.lock_timeout),
        };
    }

    /// A store over a fresh `MemoryEngine` with default tables.
    pub fn in_memory() -> SequenceStore {
        return SequenceStore::new(Arc::new(MemoryEngine::new()), StoreConfig::default());
    }

    pub fn sequences(&self) -> &ObjectStorage<Sequence> {
        return &self.sequences;
    }

    pub fn aliases(&self) -> &ObjectStorage<SequenceAliasMapping> {
        return &self.aliases;
    }

    /// Load a sequence. The handle is empty if it is not stored.
    pub fn sequence(&self, id: SequenceId) -> Result<CachedHandle<Sequence>, Error> {
        return self.sequences.load(&id.to_be_bytes());
    }

    /// Persist a new sequence. Fails with `Error::IntegrityViolation` if a
    /// sequence with the same id already exists.
    pub fn store_sequence(&self, sequence: Sequence) -> Result<CachedHandle<Sequence>, Error> {
        return self.sequences.store(sequence);
    }

    /// The generic update path. Sequences are write-once, so this fails
    /// with `Error::IntegrityViolation` whenever the sequence exists.
    pub fn update_sequence(&self, sequence: &Sequence) -> Result<bool, Error> {
        return self.sequences.update(sequence);
    }

    pub fn alias_mapping(&self, alias: &SequenceAlias) -> Result<CachedHandle<SequenceAliasMapping>, Error> {
        return self.aliases.load(alias.as_bytes());
    }

    /// Insert a mapping unless the alias is already mapped. Returns the
    /// mapping stored afterwards and whether this call won.
    pub fn store_alias_mapping(
        &self,
        mapping: SequenceAliasMapping,
    ) -> Result<(CachedHandle<SequenceAliasMapping>, bool), Error> {
        let (handle, inserted) = self.aliases.store_if_absent(mapping)?;
        tracing::debug!(alias = %mapping.sequence_alias(), inserted, "alias mapping insert");
        return Ok((handle, inserted));
    }

    /// The generic update path for alias mappings, which are write-once.
    pub fn update_alias_mapping(&self, mapping: &SequenceAliasMapping) -> Result<bool, Error> {
        return self.aliases.update(mapping);
    }

    /// Find or create the sequence for the parent set of `referenced`.
    ///
    /// If a sequence with the same parent set is already mapped, it is
    /// returned and no id is drawn. Otherwise a fresh id is drawn from
    /// `allocator`, the rank is derived from the stored parents, and the
    /// sequence is persisted before its alias is claimed. If another
    /// writer claims the alias first, that writer's sequence is returned
    /// and ours stays unreferenced. Returns whether this call created it.
    ///
    /// Fails with `Error::InvalidConstruction`, without drawing an id, if
    /// the parent set is mapped to a sequence that is no longer stored.
    pub fn create_sequence(
        &self,
        allocator: &SequenceIdAllocator,
        referenced: &Markers,
    ) -> Result<(CachedHandle<Sequence>, bool), Error> {
        let parents = referenced.sequence_ids();
        let alias = parents.alias();

        if let Some(existing) = self.alias_mapping(&alias)?.get() {
            return Ok((self.mapped_sequence(&existing)?, false));
        }

        let mut parent_ranks = Vec::with_capacity(parents.len());
        for parent in &parents {
            let Some(sequence) = self.sequence(*parent)?.get() else {
                return Err(Error::InvalidConstruction(format!("parent {parent} is not stored")));
            };
            parent_ranks.push(sequence.rank());
        }

        let id = allocator.next_id();
        let sequence = Sequence::new(id, referenced, Sequence::rank_from_parents(parent_ranks))?;
        let handle = self.store_sequence(sequence)?;
        let (mapping, inserted) = self.store_alias_mapping(SequenceAliasMapping::new(alias, id))?;
        if inserted {
            tracing::debug!(sequence = %id, alias = %alias, "created sequence");
            return Ok((handle, true));
        }

        match mapping.get() {
            Some(winner) => {
                tracing::debug!(sequence = %id, winner = %winner.sequence_id(), "lost alias race");
                return Ok((self.mapped_sequence(&winner)?, false));
            }
            None => return Ok((handle, true)),
        }
    }

    /// The sequence an alias mapping points at. A mapping to a sequence
    /// that is not stored means the index lost a write-once record.
    fn mapped_sequence(&self, mapping: &SequenceAliasMapping) -> Result<CachedHandle<Sequence>, Error> {
        let handle = self.sequence(mapping.sequence_id())?;
        if !handle.exists() {
            tracing::error!(alias = %mapping.sequence_alias(), sequence = %mapping.sequence_id(), "alias maps to a missing sequence");
            return Err(Error::InvalidConstruction(format!(
                "{} maps to {}, which is not stored",
                mapping.sequence_alias(),
                mapping.sequence_id()
            )));
        }
        return Ok(handle);
    }

    /// Raise the highest index of a stored sequence under its write lock.
    ///
    /// Returns the highest index after the call, which is unchanged if
    /// `index` was not above it, or `None` if the sequence is not stored.
    pub fn increase_highest_index(&self, id: SequenceId, index: Index) -> Result<Option<Index>, Error> {
        let handle = self.sequence(id)?;
        let reader = handle.retain();
        let mut increased = false;
        if !handle.consume(|sequence| increased = sequence.increase_highest_index(index))? {
            return Ok(None);
        }
        let highest = reader.get().map(|sequence| sequence.highest_index());
        if increased {
            tracing::trace!(sequence = %id, highest = ?highest, "increased highest index");
        }
        return Ok(highest);
    }

    /// Visit every stored sequence in id order until `visit` returns false.
    pub fn for_each_sequence<F: FnMut(Sequence) -> bool>(&self, visit: F) -> Result<(), Error> {
        return self.sequences.for_each_stored(visit);
    }
}
