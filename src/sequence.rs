//! Marker sequences.
//!
//! A sequence is a chain of messages sharing a lineage. It records which
//! parent sequences it grew out of (as `ParentReferences`), its rank in
//! the sequence DAG, and the highest index handed out so far.
//!
//! Everything but `highest_index` is fixed once the sequence is built.
//! The highest index only grows, and only through
//! `SequenceStore::increase_highest_index`.
//!
//! Layout:
//! ```text
//! SequenceID (8) | ParentReferences | rank u64 (8) | highest Index (8)
//! ```
//! The first 8 bytes are the storage key, the rest the storage value.

use std::fmt;

use crate::cache::Storable;
use crate::cache::integrity_violation;
use crate::codec::Decode;
use crate::codec::Encode;
use crate::codec::Reader;
use crate::codec::Writer;
use crate::error::DecodeContext;
use crate::error::DecodeError;
use crate::error::Error;
use crate::id::Index;
use crate::id::SequenceAlias;
use crate::id::SequenceId;
use crate::id::SequenceIds;
use crate::markers::Markers;
use crate::markers::UniqueMarkers;
use crate::parent_refs::ParentReferences;

/// A marker sequence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sequence {
    id: SequenceId,
    parent_references: ParentReferences,
    rank: u64,
    highest_index: Index,
}

impl Sequence {
    /// Build a sequence from the markers its first message referenced.
    ///
    /// The highest index starts one past the highest referenced index, or
    /// at 1 when nothing is referenced.
    ///
    /// Besides structurally invalid markers, this also rejects references
    /// to itself and a rank of 0 for a sequence with parents, since rank 0
    /// is reserved for roots. Use `rank_from_parents` to derive the rank.
    pub fn new(id: SequenceId, referenced_markers: &Markers, rank: u64) -> Result<Sequence, Error> {
        let unique = referenced_markers.to_unique_markers()?;
        if unique.get(&id).is_some() {
            return Err(Error::InvalidConstruction(format!("{id} cannot reference itself")));
        }
        if !unique.is_empty() && rank == 0 {
            return Err(Error::InvalidConstruction(format!(
                "{id} references parents but has root rank 0"
            )));
        }
        let highest_index = referenced_markers
            .highest_index()
            .unwrap_or(Index::ZERO)
            .checked_next()
            .ok_or_else(|| Error::InvalidConstruction(format!("{id} highest index overflows")))?;

        return Ok(Sequence {
            id,
            parent_references: ParentReferences::new(&unique),
            rank,
            highest_index,
        });
    }

    /// Rank for a sequence whose parents have the given ranks: one more
    /// than the highest parent, or 0 for a root.
    pub fn rank_from_parents<I: IntoIterator<Item = u64>>(parent_ranks: I) -> u64 {
        return match parent_ranks.into_iter().max() {
            Some(highest) => highest.saturating_add(1),
            None => 0,
        };
    }

    #[inline]
    pub fn id(&self) -> SequenceId {
        return self.id;
    }

    #[inline]
    pub fn rank(&self) -> u64 {
        return self.rank;
    }

    #[inline]
    pub fn highest_index(&self) -> Index {
        return self.highest_index;
    }

    /// Ids of the parent sequences.
    pub fn parent_sequences(&self) -> SequenceIds {
        return self.parent_references.sequence_ids();
    }

    /// The alias of this sequence's parent set.
    pub fn alias(&self) -> SequenceAlias {
        return self.parent_sequences().alias();
    }

    /// Highest index of each parent known as of `index` in this sequence.
    pub fn highest_referenced_parent_markers(&self, index: Index) -> UniqueMarkers {
        return self.parent_references.highest_referenced_markers(index);
    }

    pub fn parent_references(&self) -> &ParentReferences {
        return &self.parent_references;
    }

    /// Raise the highest index. Returns false if `index` is not above the
    /// current value.
    pub(crate) fn increase_highest_index(&mut self, index: Index) -> bool {
        if index <= self.highest_index {
            return false;
        }
        self.highest_index = index;
        return true;
    }

    fn encode_value(&self, writer: &mut Writer) {
        writer
            .write(&self.parent_references)
            .write_u64(self.rank)
            .write(&self.highest_index);
    }
}

impl Encode for Sequence {
    fn encode(&self, writer: &mut Writer) {
        writer.write(&self.id);
        self.encode_value(writer);
    }
}

impl Decode for Sequence {
    fn decode(reader: &mut Reader<'_>) -> Result<Sequence, DecodeError> {
        let id = SequenceId::decode(reader).field("SequenceID")?;
        let parent_references = ParentReferences::decode(reader).field("ParentReferences")?;
        let rank = reader.read_u64().field("rank")?;
        let highest_index = Index::decode(reader).field("highest Index")?;
        return Ok(Sequence {
            id,
            parent_references,
            rank,
            highest_index,
        });
    }
}

impl Storable for Sequence {
    const KIND: &'static str = "Sequence";

    fn storage_key(&self) -> Vec<u8> {
        return self.id.to_be_bytes().to_vec();
    }

    fn storage_value(&self) -> Vec<u8> {
        let mut writer = Writer::new();
        self.encode_value(&mut writer);
        return writer.into_bytes();
    }

    fn from_storage(key: &[u8], value: &[u8]) -> Result<Sequence, DecodeError> {
        let bytes = [key, value].concat();
        let mut reader = Reader::new(&bytes);
        let sequence = Sequence::decode(&mut reader).field("Sequence")?;
        reader.finish().field("Sequence")?;
        return Ok(sequence);
    }

    fn display_key(&self) -> String {
        return self.id.to_string();
    }

    /// Lineage is fixed and the highest index never regresses.
    fn validate_transition(&self, next: &Sequence) -> Result<(), Error> {
        let lineage_changed = next.id != self.id
            || next.rank != self.rank
            || next.parent_references != self.parent_references;
        if lineage_changed || next.highest_index < self.highest_index {
            return Err(integrity_violation(self));
        }
        return Ok(());
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sequence {{ id: {}, parents: [", self.id)?;
        for (i, parent) in self.parent_sequences().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", parent.0)?;
        }
        return write!(f, "], rank: {}, highest_index: {} }}", self.rank, self.highest_index);
    }
}
