//! End-to-end tests of the sequence store over both engines.

use std::sync::Arc;
use std::sync::Barrier;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use marker_sequences::alias::SequenceAliasMapping;
use marker_sequences::cache::Storable;
use marker_sequences::id::new_sequence_alias;
use marker_sequences::storage::KvEngine;
use marker_sequences::storage::MemoryEngine;
use marker_sequences::storage::RedbEngine;
use marker_sequences::{Error, Index, Marker, Markers, Sequence, SequenceId, SequenceStore, StorageError, StoreConfig};

// =============================================================================
// Test helpers
// =============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn markers(pairs: &[(u64, u64)]) -> Markers {
    return pairs
        .iter()
        .map(|(s, i)| Marker::new(SequenceId(*s), Index(*i)))
        .collect();
}

fn memory_store() -> (Arc<MemoryEngine>, SequenceStore) {
    init_tracing();
    let engine = Arc::new(MemoryEngine::new());
    let store = SequenceStore::new(engine.clone(), StoreConfig::default());
    return (engine, store);
}

// =============================================================================
// Sequences
// =============================================================================

#[test]
fn root_and_child_sequences() {
    let (_, store) = memory_store();

    let a = Sequence::new(SequenceId(1), &Markers::new(), 0).unwrap();
    store.store_sequence(a).unwrap().release().unwrap();
    let b = Sequence::new(SequenceId(2), &markers(&[(1, 4)]), 1).unwrap();
    store.store_sequence(b).unwrap().release().unwrap();

    let a = store.sequence(SequenceId(1)).unwrap().get().unwrap();
    assert_eq!(a.rank(), 0);
    assert_eq!(a.highest_index(), Index(1));
    assert!(a.parent_sequences().is_empty());

    let b = store.sequence(SequenceId(2)).unwrap().get().unwrap();
    assert_eq!(b.rank(), 1);
    assert_eq!(b.highest_index(), Index(5));
    assert_eq!(b.parent_sequences().as_slice(), &[SequenceId(1)]);
    assert_eq!(b.highest_referenced_parent_markers(Index(0)).get(&SequenceId(1)), Some(Index(4)));
}

#[test]
fn write_once_leaves_stored_bytes_unchanged() {
    let (engine, store) = memory_store();
    let original = Sequence::new(SequenceId(2), &markers(&[(1, 4)]), 1).unwrap();
    let _held = store.store_sequence(original.clone()).unwrap();
    let before = engine.get("sequences", &original.storage_key()).unwrap();

    let replacement = Sequence::new(SequenceId(2), &markers(&[(1, 9)]), 1).unwrap();
    let err = store.update_sequence(&replacement).unwrap_err();
    assert!(matches!(err, Error::IntegrityViolation { entity: "Sequence", .. }));
    let err = store.store_sequence(replacement).unwrap_err();
    assert!(err.is_fatal());

    assert_eq!(engine.get("sequences", &original.storage_key()).unwrap(), before);
    assert_eq!(*store.sequence(SequenceId(2)).unwrap().get().unwrap(), original);
}

#[test]
fn highest_index_only_grows() {
    let (engine, store) = memory_store();
    let allocator = marker_sequences::id::SequenceIdAllocator::starting_at(SequenceId(1));
    let (root, _) = store.create_sequence(&allocator, &Markers::new()).unwrap();
    let id = root.get().unwrap().id();

    assert_eq!(store.increase_highest_index(id, Index(7)).unwrap(), Some(Index(7)));
    assert_eq!(store.increase_highest_index(id, Index(3)).unwrap(), Some(Index(7)));
    assert_eq!(root.get().unwrap().highest_index(), Index(7));

    // The cached handle and the engine agree.
    drop(root);
    let stored = engine.get("sequences", &id.to_be_bytes()).unwrap().unwrap();
    let reloaded = Sequence::from_storage(&id.to_be_bytes(), &stored).unwrap();
    assert_eq!(reloaded.highest_index(), Index(7));
}

// =============================================================================
// Alias mappings
// =============================================================================

#[test]
fn alias_lookup_finds_existing_lineage() {
    let (_, store) = memory_store();
    let allocator = marker_sequences::id::SequenceIdAllocator::starting_at(SequenceId(1));
    store.create_sequence(&allocator, &Markers::new()).unwrap();
    store.create_sequence(&allocator, &Markers::new()).unwrap();

    // A root was created once; the second call reused it.
    assert_eq!(allocator.peek(), SequenceId(2));

    let (a, _) = store.create_sequence(&allocator, &markers(&[(1, 2)])).unwrap();
    let alias = new_sequence_alias([SequenceId(1)]);
    let mapping = store.alias_mapping(&alias).unwrap().get().unwrap();
    assert_eq!(mapping.sequence_id(), a.get().unwrap().id());
    assert_eq!(a.get().unwrap().alias(), alias);
}

#[test]
fn concurrent_alias_inserts_have_one_winner() {
    let (_, store) = memory_store();
    let alias = new_sequence_alias([SequenceId(1), SequenceId(2)]);
    let threads = 8;
    let barrier = Barrier::new(threads);

    let results: Vec<(bool, SequenceId)> = thread::scope(|scope| {
        let workers: Vec<_> = (0..threads)
            .map(|i| {
                let store = &store;
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    let mapping = SequenceAliasMapping::new(alias, SequenceId(100 + i as u64));
                    let (handle, inserted) = store.store_alias_mapping(mapping).unwrap();
                    return (inserted, handle.get().unwrap().sequence_id());
                })
            })
            .collect();
        return workers.into_iter().map(|worker| worker.join().unwrap()).collect();
    });

    let winners: Vec<_> = results.iter().filter(|(inserted, _)| *inserted).collect();
    assert_eq!(winners.len(), 1);
    let winning_id = winners[0].1;
    assert!(results.iter().all(|(_, id)| *id == winning_id));
    let stored = store.alias_mapping(&alias).unwrap().get().unwrap();
    assert_eq!(stored.sequence_id(), winning_id);
}

#[test]
fn concurrent_create_sequence_converges() {
    let (_, store) = memory_store();
    let allocator = marker_sequences::id::SequenceIdAllocator::starting_at(SequenceId(1));
    store.create_sequence(&allocator, &Markers::new()).unwrap();
    let referenced = markers(&[(1, 3)]);
    let threads = 6;
    let barrier = Barrier::new(threads);

    let ids: Vec<SequenceId> = thread::scope(|scope| {
        let workers: Vec<_> = (0..threads)
            .map(|_| {
                let (store, allocator, referenced, barrier) = (&store, &allocator, &referenced, &barrier);
                scope.spawn(move || {
                    barrier.wait();
                    let (handle, _) = store.create_sequence(allocator, referenced).unwrap();
                    return handle.get().unwrap().id();
                })
            })
            .collect();
        return workers.into_iter().map(|worker| worker.join().unwrap()).collect();
    });

    assert!(ids.iter().all(|id| *id == ids[0]));
    let mapped = store.alias_mapping(&new_sequence_alias([SequenceId(1)])).unwrap().get().unwrap();
    assert_eq!(mapped.sequence_id(), ids[0]);
}

// =============================================================================
// Cache behavior
// =============================================================================

#[test]
fn retained_handle_outlives_delete() {
    let (engine, store) = memory_store();
    let a = Sequence::new(SequenceId(1), &Markers::new(), 0).unwrap();
    let handle = store.store_sequence(a.clone()).unwrap();
    let key = a.storage_key();

    assert!(store.sequences().delete(&key).unwrap());
    assert_eq!(*handle.get().unwrap(), a);
    assert!(!store.sequence(SequenceId(1)).unwrap().exists());
    assert_eq!(engine.len("sequences"), 1);

    handle.release().unwrap();
    assert_eq!(engine.len("sequences"), 0);
    assert_eq!(store.sequences().cached_len(), 0);
}

#[test]
fn concurrent_readers_see_whole_values() {
    let (_, store) = memory_store();
    let a = Sequence::new(SequenceId(1), &Markers::new(), 0).unwrap();
    let handle = store.store_sequence(a).unwrap();

    thread::scope(|scope| {
        scope.spawn(|| {
            for index in 2..200u64 {
                store.increase_highest_index(SequenceId(1), Index(index)).unwrap();
            }
        });
        for _ in 0..4 {
            scope.spawn(|| {
                let mut last = Index(0);
                for _ in 0..200 {
                    let seen = handle.get().unwrap();
                    assert_eq!(seen.id(), SequenceId(1));
                    assert!(seen.highest_index() >= last);
                    last = seen.highest_index();
                }
            });
        }
    });
    assert_eq!(handle.get().unwrap().highest_index(), Index(199));
}

#[test]
fn delete_alongside_a_consume_that_reads_the_store() {
    let (_, store) = memory_store();
    for id in [1u64, 2] {
        let sequence = Sequence::new(SequenceId(id), &Markers::new(), 0).unwrap();
        store.store_sequence(sequence).unwrap().release().unwrap();
    }
    let holder = store.sequence(SequenceId(1)).unwrap();
    let locked = Arc::new(Barrier::new(2));
    let (done, finished) = mpsc::channel();

    let writer = {
        let (store, locked, done) = (store.clone(), locked.clone(), done.clone());
        thread::spawn(move || {
            let consumed = holder.consume(|_| {
                locked.wait();
                thread::sleep(Duration::from_millis(100));
                let sibling = store.sequence(SequenceId(2)).unwrap();
                assert!(sibling.exists());
            });
            done.send(("consume", consumed.is_ok())).unwrap();
        })
    };
    let deleter = {
        let store = store.clone();
        thread::spawn(move || {
            locked.wait();
            let deleted = store.sequences().delete(&SequenceId(1).to_be_bytes());
            done.send(("delete", deleted.is_ok())).unwrap();
        })
    };

    for _ in 0..2 {
        let (call, ok) = finished.recv_timeout(Duration::from_secs(5)).expect("both calls finish");
        assert!(ok, "{call} failed");
    }
    writer.join().unwrap();
    deleter.join().unwrap();
    assert!(!store.sequence(SequenceId(1)).unwrap().exists());
    assert!(store.sequence(SequenceId(2)).unwrap().exists());
}

#[test]
fn slow_write_does_not_stall_other_keys() {
    let (_, store) = memory_store();
    for id in [1u64, 2] {
        let sequence = Sequence::new(SequenceId(id), &Markers::new(), 0).unwrap();
        store.store_sequence(sequence).unwrap().release().unwrap();
    }
    let holder = store.sequence(SequenceId(1)).unwrap();
    let locked = Barrier::new(2);

    thread::scope(|scope| {
        let locked = &locked;
        scope.spawn(move || {
            holder
                .consume(|_| {
                    locked.wait();
                    thread::sleep(Duration::from_millis(600));
                })
                .unwrap();
        });

        locked.wait();
        let started = Instant::now();
        assert!(store.sequences().delete(&SequenceId(1).to_be_bytes()).unwrap());
        let other = store.sequence(SequenceId(2)).unwrap();
        assert!(other.exists());
        assert!(started.elapsed() < Duration::from_millis(300), "took {:?}", started.elapsed());
    });
}

#[test]
fn configured_lock_timeout_fails_fast() {
    init_tracing();
    let config = StoreConfig {
        lock_timeout: Some(Duration::from_millis(20)),
        ..StoreConfig::default()
    };
    let store = SequenceStore::new(Arc::new(MemoryEngine::new()), config);
    let a = Sequence::new(SequenceId(1), &Markers::new(), 0).unwrap();
    let handle = store.store_sequence(a).unwrap();
    let locked = Barrier::new(2);

    thread::scope(|scope| {
        let holder = handle.retain();
        let locked = &locked;
        scope.spawn(move || {
            holder
                .consume_within(Duration::from_secs(5), |_| {
                    locked.wait();
                    thread::sleep(Duration::from_millis(300));
                })
                .unwrap();
        });

        locked.wait();
        let err = store.increase_highest_index(SequenceId(1), Index(9)).unwrap_err();
        assert!(matches!(err, Error::Unavailable(StorageError::Timeout(_))));
    });
    assert_eq!(handle.get().unwrap().highest_index(), Index(1));
}

// =============================================================================
// Durability
// =============================================================================

#[test]
fn redb_store_survives_reopen() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sequences.redb");
    let allocator = marker_sequences::id::SequenceIdAllocator::starting_at(SequenceId(1));

    let child_id = {
        let engine = Arc::new(RedbEngine::open(&path).unwrap());
        let store = SequenceStore::new(engine, StoreConfig::default());
        store.create_sequence(&allocator, &Markers::new()).unwrap();
        let (child, created) = store.create_sequence(&allocator, &markers(&[(1, 4)])).unwrap();
        assert!(created);
        let child_id = child.get().unwrap().id();
        drop(child);
        store.increase_highest_index(child_id, Index(12)).unwrap();
        child_id
    };

    let engine = Arc::new(RedbEngine::open(&path).unwrap());
    let store = SequenceStore::new(engine, StoreConfig::default());
    let child = store.sequence(child_id).unwrap().get().unwrap();
    assert_eq!(child.rank(), 1);
    assert_eq!(child.highest_index(), Index(12));
    assert_eq!(child.highest_referenced_parent_markers(Index(0)).get(&SequenceId(1)), Some(Index(4)));

    // The alias survived too, so the lineage is not recreated.
    let (again, created) = store.create_sequence(&allocator, &markers(&[(1, 8)])).unwrap();
    assert!(!created);
    assert_eq!(again.get().unwrap().id(), child_id);

    let mut count = 0;
    store
        .for_each_sequence(|_| {
            count += 1;
            return true;
        })
        .unwrap();
    assert_eq!(count, 2);
}

#[test]
fn corrupt_engine_value_is_malformed_input() {
    let (engine, store) = memory_store();
    engine.put("sequences", &SequenceId(3).to_be_bytes(), &[0, 0, 0, 1]).unwrap();
    let err = store.sequence(SequenceId(3)).unwrap_err();
    assert!(matches!(err, Error::MalformedInput(_)));
    assert!(!err.is_fatal());
}
