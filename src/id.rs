//! Identity types for marker sequences.
//!
//! - `SequenceId`: dense 64-bit handle handed out by an allocator
//! - `Index`: position of a message within a sequence
//! - `SequenceIds`: sorted, deduplicated set of sequence ids
//! - `SequenceAlias`: blake3 digest of a parent set, used to find an
//!   existing sequence with identical lineage instead of creating another

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::codec::Decode;
use crate::codec::Encode;
use crate::codec::Reader;
use crate::codec::Writer;
use crate::codec::U64_SIZE;
use crate::codec::bounded_capacity;
use crate::error::DecodeContext;
use crate::error::DecodeError;

/// Encoded width of a `SequenceId`.
pub const SEQUENCE_ID_LENGTH: usize = U64_SIZE;

/// Encoded width of an `Index`.
pub const INDEX_LENGTH: usize = U64_SIZE;

/// Encoded width of a `SequenceAlias`.
pub const SEQUENCE_ALIAS_LENGTH: usize = 32;

/// Identifies a marker sequence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceId(pub u64);

impl SequenceId {
    pub const fn new(value: u64) -> SequenceId {
        return SequenceId(value);
    }

    #[inline]
    pub fn value(&self) -> u64 {
        return self.0;
    }

    /// The 8-byte big-endian encoding, also used as the storage key.
    pub fn to_be_bytes(&self) -> [u8; SEQUENCE_ID_LENGTH] {
        return self.0.to_be_bytes();
    }
}

impl Encode for SequenceId {
    fn encode(&self, writer: &mut Writer) {
        writer.write_u64(self.0);
    }
}

impl Decode for SequenceId {
    fn decode(reader: &mut Reader<'_>) -> Result<SequenceId, DecodeError> {
        return Ok(SequenceId(reader.read_u64()?));
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "SequenceID({})", self.0);
    }
}

impl FromStr for SequenceId {
    type Err = DecodeError;

    /// Accepts both the bare decimal form and the `SequenceID(n)` rendering.
    fn from_str(s: &str) -> Result<SequenceId, DecodeError> {
        let inner = s
            .strip_prefix("SequenceID(")
            .and_then(|rest| rest.strip_suffix(')'))
            .unwrap_or(s);
        return inner
            .parse::<u64>()
            .map(SequenceId)
            .map_err(|err| DecodeError::Invalid(format!("invalid SequenceID {s:?}: {err}")));
    }
}

/// Position of a message within its sequence.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Index(pub u64);

impl Index {
    pub const ZERO: Index = Index(0);

    pub const fn new(value: u64) -> Index {
        return Index(value);
    }

    #[inline]
    pub fn value(&self) -> u64 {
        return self.0;
    }

    /// The following index, or `None` on overflow.
    pub fn checked_next(&self) -> Option<Index> {
        return self.0.checked_add(1).map(Index);
    }
}

impl Encode for Index {
    fn encode(&self, writer: &mut Writer) {
        writer.write_u64(self.0);
    }
}

impl Decode for Index {
    fn decode(reader: &mut Reader<'_>) -> Result<Index, DecodeError> {
        return Ok(Index(reader.read_u64()?));
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "{}", self.0);
    }
}

/// A sorted, deduplicated set of sequence ids.
///
/// Sorting on construction is what makes the alias of a parent set
/// independent of the order the parents were discovered in.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SequenceIds(Vec<SequenceId>);

impl SequenceIds {
    pub fn new<I: IntoIterator<Item = SequenceId>>(ids: I) -> SequenceIds {
        let mut ids: Vec<SequenceId> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        return SequenceIds(ids);
    }

    pub fn len(&self) -> usize {
        return self.0.len();
    }

    pub fn is_empty(&self) -> bool {
        return self.0.is_empty();
    }

    pub fn contains(&self, id: &SequenceId) -> bool {
        return self.0.binary_search(id).is_ok();
    }

    pub fn iter(&self) -> impl Iterator<Item = &SequenceId> {
        return self.0.iter();
    }

    pub fn as_slice(&self) -> &[SequenceId] {
        return &self.0;
    }

    /// The alias identifying this exact parent set.
    pub fn alias(&self) -> SequenceAlias {
        let mut hasher = blake3::Hasher::new();
        for id in &self.0 {
            hasher.update(&id.to_be_bytes());
        }
        return SequenceAlias(*hasher.finalize().as_bytes());
    }
}

impl FromIterator<SequenceId> for SequenceIds {
    fn from_iter<I: IntoIterator<Item = SequenceId>>(iter: I) -> SequenceIds {
        return SequenceIds::new(iter);
    }
}

impl<'a> IntoIterator for &'a SequenceIds {
    type Item = &'a SequenceId;
    type IntoIter = std::slice::Iter<'a, SequenceId>;

    fn into_iter(self) -> Self::IntoIter {
        return self.0.iter();
    }
}

impl Encode for SequenceIds {
    fn encode(&self, writer: &mut Writer) {
        writer.write_count(self.0.len());
        for id in &self.0 {
            id.encode(writer);
        }
    }
}

impl Decode for SequenceIds {
    /// Rejects lists that are not strictly ascending, since no encoder
    /// produces them.
    fn decode(reader: &mut Reader<'_>) -> Result<SequenceIds, DecodeError> {
        let count = reader.read_u32().field("SequenceIds count")?;
        let mut ids = Vec::with_capacity(bounded_capacity(count, reader, SEQUENCE_ID_LENGTH));
        for _ in 0..count {
            let id = SequenceId::decode(reader).field("SequenceID")?;
            if let Some(last) = ids.last() {
                if *last >= id {
                    return Err(DecodeError::Invalid(format!(
                        "SequenceIds not strictly ascending: {id} after {last}"
                    )));
                }
            }
            ids.push(id);
        }
        return Ok(SequenceIds(ids));
    }
}

/// Hash the parent set of a sequence into its alias.
///
/// Ids are sorted and deduplicated first, then each is hashed as 8
/// big-endian bytes.
pub fn new_sequence_alias<I: IntoIterator<Item = SequenceId>>(parent_ids: I) -> SequenceAlias {
    return SequenceIds::new(parent_ids).alias();
}

/// Content hash of a sorted parent-sequence set.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SequenceAlias(pub [u8; SEQUENCE_ALIAS_LENGTH]);

impl SequenceAlias {
    pub fn as_bytes(&self) -> &[u8; SEQUENCE_ALIAS_LENGTH] {
        return &self.0;
    }

    pub fn base58(&self) -> String {
        return bs58::encode(&self.0).into_string();
    }

    pub fn from_base58(encoded: &str) -> Result<SequenceAlias, DecodeError> {
        let bytes = bs58::decode(encoded).into_vec()?;
        return SequenceAlias::from_slice(&bytes);
    }

    /// Interpret exactly 32 bytes as an alias.
    pub fn from_slice(bytes: &[u8]) -> Result<SequenceAlias, DecodeError> {
        let array: [u8; SEQUENCE_ALIAS_LENGTH] = bytes.try_into().map_err(|_| {
            DecodeError::Invalid(format!(
                "SequenceAlias must be {SEQUENCE_ALIAS_LENGTH} bytes, got {}",
                bytes.len()
            ))
        })?;
        return Ok(SequenceAlias(array));
    }
}

impl Encode for SequenceAlias {
    fn encode(&self, writer: &mut Writer) {
        writer.write_bytes(&self.0);
    }
}

impl Decode for SequenceAlias {
    fn decode(reader: &mut Reader<'_>) -> Result<SequenceAlias, DecodeError> {
        return Ok(SequenceAlias(reader.read_array()?));
    }
}

impl FromStr for SequenceAlias {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<SequenceAlias, DecodeError> {
        let inner = s
            .strip_prefix("SequenceAlias(")
            .and_then(|rest| rest.strip_suffix(')'))
            .unwrap_or(s);
        return SequenceAlias::from_base58(inner);
    }
}

impl fmt::Display for SequenceAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "SequenceAlias({})", self.base58());
    }
}

impl fmt::Debug for SequenceAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "SequenceAlias({})", self.base58());
    }
}

/// Hands out fresh sequence ids.
///
/// Owned by whoever allocates markers and passed by reference into
/// `SequenceStore::create_sequence`. Ids are never reused, even when the
/// sequence they were drawn for is never persisted.
#[derive(Debug)]
pub struct SequenceIdAllocator {
    next: AtomicU64,
}

impl SequenceIdAllocator {
    /// Start allocating at `first`.
    pub fn starting_at(first: SequenceId) -> SequenceIdAllocator {
        return SequenceIdAllocator {
            next: AtomicU64::new(first.0),
        };
    }

    /// Draw the next id.
    pub fn next_id(&self) -> SequenceId {
        return SequenceId(self.next.fetch_add(1, Ordering::SeqCst));
    }

    /// The id the next call to `next_id` will return.
    pub fn peek(&self) -> SequenceId {
        return SequenceId(self.next.load(Ordering::SeqCst));
    }
}

impl Default for SequenceIdAllocator {
    fn default() -> Self {
        return SequenceIdAllocator::starting_at(SequenceId(0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_id_encoding_is_big_endian() {
        let id = SequenceId(0x0102);
        assert_eq!(id.to_bytes(), vec![0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(id.to_be_bytes().to_vec(), id.to_bytes());
    }

    #[test]
    fn sequence_id_reports_consumed_bytes() {
        let bytes = [0, 0, 0, 0, 0, 0, 0, 9, 0xff];
        let (id, consumed) = SequenceId::from_bytes(&bytes).unwrap();
        assert_eq!(id, SequenceId(9));
        assert_eq!(consumed, 8);
    }

    #[test]
    fn sequence_id_short_read_is_malformed() {
        let err = SequenceId::from_bytes(&[0, 1, 2]).unwrap_err();
        assert!(matches!(err, DecodeError::ShortRead { needed: 8, remaining: 3, .. }));
    }

    #[test]
    fn sequence_id_display_and_parse() {
        let id = SequenceId(42);
        assert_eq!(id.to_string(), "SequenceID(42)");
        assert_eq!("SequenceID(42)".parse::<SequenceId>().unwrap(), id);
        assert_eq!("42".parse::<SequenceId>().unwrap(), id);
        assert!("SequenceID(x)".parse::<SequenceId>().is_err());
    }

    #[test]
    fn sequence_ids_sort_and_dedup() {
        let ids = SequenceIds::new([SequenceId(3), SequenceId(1), SequenceId(3), SequenceId(2)]);
        assert_eq!(ids.as_slice(), &[SequenceId(1), SequenceId(2), SequenceId(3)]);
        assert!(ids.contains(&SequenceId(2)));
        assert!(!ids.contains(&SequenceId(4)));
    }

    #[test]
    fn sequence_ids_layout() {
        let ids = SequenceIds::new([SequenceId(2), SequenceId(1)]);
        let bytes = ids.to_bytes();
        assert_eq!(bytes.len(), 4 + 2 * 8);
        assert_eq!(&bytes[..4], &[0, 0, 0, 2]);
        let (decoded, consumed) = SequenceIds::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, ids);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn sequence_ids_reject_unsorted_input() {
        let mut writer = Writer::new();
        writer.write_u32(2).write_u64(5).write_u64(4);
        let err = SequenceIds::from_bytes(&writer.into_bytes()).unwrap_err();
        assert!(matches!(err, DecodeError::Invalid(_)));
    }

    #[test]
    fn sequence_ids_truncated_names_field() {
        let mut writer = Writer::new();
        writer.write_u32(2).write_u64(5);
        let err = SequenceIds::from_bytes(&writer.into_bytes()).unwrap_err();
        assert_eq!(err.path(), vec!["SequenceID"]);
    }

    #[test]
    fn alias_is_order_independent() {
        let a = new_sequence_alias([SequenceId(1), SequenceId(2)]);
        let b = new_sequence_alias([SequenceId(2), SequenceId(1)]);
        let c = new_sequence_alias([SequenceId(2), SequenceId(1), SequenceId(2)]);
        assert_eq!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn alias_differs_for_different_sets() {
        let a = new_sequence_alias([SequenceId(1), SequenceId(2)]);
        let b = new_sequence_alias([SequenceId(1), SequenceId(3)]);
        let empty = new_sequence_alias([]);
        assert_ne!(a, b);
        assert_ne!(a, empty);
    }

    #[test]
    fn alias_hashes_big_endian_ids() {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&1u64.to_be_bytes());
        hasher.update(&7u64.to_be_bytes());
        let expected = SequenceAlias(*hasher.finalize().as_bytes());
        assert_eq!(new_sequence_alias([SequenceId(7), SequenceId(1)]), expected);
    }

    #[test]
    fn alias_base58_roundtrip() {
        let alias = new_sequence_alias([SequenceId(10)]);
        let encoded = alias.base58();
        assert_eq!(SequenceAlias::from_base58(&encoded).unwrap(), alias);
        assert_eq!(alias.to_string(), format!("SequenceAlias({encoded})"));
        assert_eq!(alias.to_string().parse::<SequenceAlias>().unwrap(), alias);
    }

    #[test]
    fn alias_rejects_wrong_length() {
        let encoded = bs58::encode([1u8; 31]).into_string();
        let err = SequenceAlias::from_base58(&encoded).unwrap_err();
        assert!(matches!(err, DecodeError::Invalid(_)));
    }

    #[test]
    fn alias_rejects_bad_base58() {
        let err = SequenceAlias::from_base58("0OIl").unwrap_err();
        assert!(matches!(err, DecodeError::Base58(_)));
    }

    #[test]
    fn allocator_is_monotonic() {
        let allocator = SequenceIdAllocator::starting_at(SequenceId(5));
        assert_eq!(allocator.peek(), SequenceId(5));
        assert_eq!(allocator.next_id(), SequenceId(5));
        assert_eq!(allocator.next_id(), SequenceId(6));
        assert_eq!(allocator.peek(), SequenceId(7));
    }
}
