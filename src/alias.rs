//! Persistent alias → sequence id mappings.
//!
//! When a new sequence is about to be created for a set of parents, the
//! alias of that parent set is looked up first. A hit means a sequence with
//! identical lineage already exists and should be reused.
//!
//! Layout:
//! ```text
//! SequenceAlias (32, storage key) | SequenceID (8, storage value)
//! ```

use crate::cache::Storable;
use crate::cache::integrity_violation;
use crate::codec::Decode;
use crate::codec::Encode;
use crate::codec::Reader;
use crate::codec::Writer;
use crate::error::DecodeContext;
use crate::error::DecodeError;
use crate::error::Error;
use crate::id::SequenceAlias;
use crate::id::SequenceId;

/// Records which sequence owns a parent-set alias. Written once, never changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SequenceAliasMapping {
    sequence_alias: SequenceAlias,
    sequence_id: SequenceId,
}

impl SequenceAliasMapping {
    pub fn new(sequence_alias: SequenceAlias, sequence_id: SequenceId) -> SequenceAliasMapping {
        return SequenceAliasMapping {
            sequence_alias,
            sequence_id,
        };
    }

    pub fn sequence_alias(&self) -> SequenceAlias {
        return self.sequence_alias;
    }

    pub fn sequence_id(&self) -> SequenceId {
        return self.sequence_id;
    }
}

impl Encode for SequenceAliasMapping {
    fn encode(&self, writer: &mut Writer) {
        writer.write(&self.sequence_alias).write(&self.sequence_id);
    }
}

impl Decode for SequenceAliasMapping {
    fn decode(reader: &mut Reader<'_>) -> Result<SequenceAliasMapping, DecodeError> {
        let sequence_alias = SequenceAlias::decode(reader).field("SequenceAlias")?;
        let sequence_id = SequenceId::decode(reader).field("SequenceID")?;
        return Ok(SequenceAliasMapping {
            sequence_alias,
            sequence_id,
        });
    }
}

impl Storable for SequenceAliasMapping {
    const KIND: &'static str = "SequenceAliasMapping";

    fn storage_key(&self) -> Vec<u8> {
        return self.sequence_alias.as_bytes().to_vec();
    }

    fn storage_value(&self) -> Vec<u8> {
        return self.sequence_id.to_be_bytes().to_vec();
    }

    /// The alias comes from the key; the value holds only the id.
    fn from_storage(key: &[u8], value: &[u8]) -> Result<SequenceAliasMapping, DecodeError> {
        let sequence_alias = SequenceAlias::from_slice(key).field("SequenceAlias")?;
        let mut reader = Reader::new(value);
        let sequence_id = SequenceId::decode(&mut reader).field("SequenceID")?;
        reader.finish().field("SequenceID")?;
        return Ok(SequenceAliasMapping {
            sequence_alias,
            sequence_id,
        });
    }

    fn display_key(&self) -> String {
        return self.sequence_alias.to_string();
    }

    fn validate_transition(&self, next: &SequenceAliasMapping) -> Result<(), Error> {
        if next != self {
            return Err(integrity_violation(self));
        }
        return Ok(());
    }
}
