//! Marker sequences - a persistent index of message sequences and their lineage.
//!
//! A message is identified by a `Marker`: the sequence it belongs to and
//! its index within that sequence. A new sequence starts whenever a message
//! references a set of parent sequences, and records for each parent which
//! parent index it had seen at each of its own indexes.
//!
//! # Quick Start
//!
//! ```
//! use marker_sequences::id::Index;
//! use marker_sequences::id::SequenceId;
//! use marker_sequences::id::SequenceIdAllocator;
//! use marker_sequences::markers::Marker;
//! use marker_sequences::markers::Markers;
//! use marker_sequences::store::SequenceStore;
//!
//! let store = SequenceStore::in_memory();
//! let allocator = SequenceIdAllocator::starting_at(SequenceId(1));
//!
//! // A root sequence references nothing.
//! let (root, created) = store.create_sequence(&allocator, &Markers::new()).unwrap();
//! assert!(created);
//! let root_id = root.get().unwrap().id();
//!
//! // A child sequence grows out of message 4 of the root.
//! let referenced: Markers = [Marker::new(root_id, Index(4))].into_iter().collect();
//! let (child, _) = store.create_sequence(&allocator, &referenced).unwrap();
//! let child = child.get().unwrap();
//! assert_eq!(child.rank(), 1);
//! assert_eq!(child.highest_index(), Index(5));
//! assert_eq!(child.highest_referenced_parent_markers(Index(0)).get(&root_id), Some(Index(4)));
//! ```
//!
//! # Layout
//!
//! - `id`, `markers`: identifiers and marker sets
//! - `parent_refs`, `sequence`, `alias`: the persisted entities and their encodings
//! - `codec`: big-endian binary reader and writer
//! - `storage`: the key-value engines (`MemoryEngine`, `RedbEngine`)
//! - `cache`: reference-counted, write-once object cache
//! - `store`: `SequenceStore`, the entry point

pub mod alias;
pub mod cache;
pub mod codec;
pub mod error;
pub mod id;
pub mod markers;
pub mod parent_refs;
pub mod sequence;
pub mod storage;
pub mod store;

pub use error::DecodeError;
pub use error::Error;
pub use error::Result;
pub use error::StorageError;
pub use id::Index;
pub use id::SequenceAlias;
pub use id::SequenceId;
pub use id::SequenceIds;
pub use markers::Marker;
pub use markers::Markers;
pub use markers::UniqueMarkers;
pub use sequence::Sequence;
pub use store::SequenceStore;
pub use store::StoreConfig;
