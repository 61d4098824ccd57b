//! Markers: positions of messages within sequences.
//!
//! A `Markers` collection maps each sequence to the set of indexes a
//! message references through it. `UniqueMarkers` keeps only the highest
//! index per sequence and is the compact form the parent summaries store.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

use crate::error::Error;
use crate::id::Index;
use crate::id::SequenceId;
use crate::id::SequenceIds;

/// A single message position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Marker {
    pub sequence_id: SequenceId,
    pub index: Index,
}

impl Marker {
    pub fn new(sequence_id: SequenceId, index: Index) -> Marker {
        return Marker { sequence_id, index };
    }
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "Marker({}, {})", self.sequence_id, self.index);
    }
}

/// Indexes reachable through each sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Markers {
    entries: BTreeMap<SequenceId, BTreeSet<Index>>,
}

impl Markers {
    pub fn new() -> Markers {
        return Markers {
            entries: BTreeMap::new(),
        };
    }

    /// Wrap a raw mapping as-is. Empty index sets are kept so that
    /// validation can reject them where it matters.
    pub fn from_map(entries: BTreeMap<SequenceId, BTreeSet<Index>>) -> Markers {
        return Markers { entries };
    }

    /// Add a marker, returning true if it was not already present.
    pub fn insert(&mut self, marker: Marker) -> bool {
        return self
            .entries
            .entry(marker.sequence_id)
            .or_default()
            .insert(marker.index);
    }

    pub fn indexes(&self, sequence_id: &SequenceId) -> Option<&BTreeSet<Index>> {
        return self.entries.get(sequence_id);
    }

    pub fn sequence_ids(&self) -> SequenceIds {
        return SequenceIds::new(self.entries.keys().copied());
    }

    /// The highest index across every sequence, or `None` if no index is present.
    pub fn highest_index(&self) -> Option<Index> {
        return self
            .entries
            .values()
            .filter_map(|indexes| indexes.last())
            .max()
            .copied();
    }

    /// Reduce to the highest index per sequence.
    ///
    /// Fails if any sequence is listed without indexes, since there is no
    /// highest index to record for it.
    pub fn to_unique_markers(&self) -> Result<UniqueMarkers, Error> {
        let mut unique = UniqueMarkers::new();
        for (sequence_id, indexes) in &self.entries {
            let Some(highest) = indexes.last() else {
                return Err(Error::InvalidConstruction(format!(
                    "{sequence_id} is referenced without any index"
                )));
            };
            unique.insert(*sequence_id, *highest);
        }
        return Ok(unique);
    }

    /// Number of sequences referenced.
    pub fn len(&self) -> usize {
        return self.entries.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.entries.is_empty();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SequenceId, &BTreeSet<Index>)> {
        return self.entries.iter();
    }
}

impl FromIterator<Marker> for Markers {
    fn from_iter<I: IntoIterator<Item = Marker>>(iter: I) -> Markers {
        let mut markers = Markers::new();
        for marker in iter {
            markers.insert(marker);
        }
        return markers;
    }
}

/// Highest index known through each sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UniqueMarkers {
    entries: BTreeMap<SequenceId, Index>,
}

impl UniqueMarkers {
    pub fn new() -> UniqueMarkers {
        return UniqueMarkers {
            entries: BTreeMap::new(),
        };
    }

    /// Record `index` for `sequence_id`, keeping the larger of the old and
    /// new value. Returns true if the stored value changed.
    pub fn insert(&mut self, sequence_id: SequenceId, index: Index) -> bool {
        match self.entries.get_mut(&sequence_id) {
            Some(current) if *current >= index => return false,
            Some(current) => {
                *current = index;
                return true;
            }
            None => {
                self.entries.insert(sequence_id, index);
                return true;
            }
        }
    }

    pub fn get(&self, sequence_id: &SequenceId) -> Option<Index> {
        return self.entries.get(sequence_id).copied();
    }

    pub fn sequence_ids(&self) -> SequenceIds {
        return SequenceIds::new(self.entries.keys().copied());
    }

    pub fn highest_index(&self) -> Option<Index> {
        return self.entries.values().max().copied();
    }

    pub fn len(&self) -> usize {
        return self.entries.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.entries.is_empty();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&SequenceId, &Index)> {
        return self.entries.iter();
    }

    pub fn markers(&self) -> impl Iterator<Item = Marker> + '_ {
        return self
            .entries
            .iter()
            .map(|(sequence_id, index)| Marker::new(*sequence_id, *index));
    }
}

impl FromIterator<(SequenceId, Index)> for UniqueMarkers {
    fn from_iter<I: IntoIterator<Item = (SequenceId, Index)>>(iter: I) -> UniqueMarkers {
        let mut unique = UniqueMarkers::new();
        for (sequence_id, index) in iter {
            unique.insert(sequence_id, index);
        }
        return unique;
    }
}

impl fmt::Display for UniqueMarkers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UniqueMarkers {{")?;
        for (i, (sequence_id, index)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, " {}: {}", sequence_id.0, index)?;
        }
        return write!(f, " }}");
    }
}
