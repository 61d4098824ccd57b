//! Reference-counted cache over a key-value engine.
//!
//! `ObjectStorage<T>` keeps one in-memory `CachedObject` per key that at
//! least one `CachedHandle<T>` is holding. Handles are cheap to clone
//! (`retain`), and the entry leaves the cache when the last one is dropped.
//!
//! # Reads and writes
//!
//! The entity lives in an `Arc<T>` behind a read-write lock. `get` clones
//! the `Arc`, so readers always see a complete value. `consume` takes the
//! per-key write mutex, applies the caller's closure to a copy, persists
//! it if its stored bytes changed, and swaps the new `Arc` in. At most one
//! write per key is in flight at a time.
//!
//! # Write-once entities
//!
//! Replacing a stored entity goes through `Storable::update`, which
//! rejects the attempt with `Error::IntegrityViolation` unless the type
//! opts in. Every mutation made through `consume` is checked with
//! `Storable::validate_transition` before it is persisted.
//!
//! # Deletion
//!
//! Deleting a key while handles are outstanding is deferred: existing
//! handles keep reading the entity, new lookups treat it as absent, and
//! the engine delete runs when the last handle is released.
//!
//! # Locking
//!
//! The table-wide map mutex only guards lookups and inserts of cached
//! objects. Engine calls and per-key write locks are never taken under it,
//! so a slow write to one key does not stall reads of another. Misses read
//! the engine unlocked and are retried if the map's epoch moved meanwhile.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use parking_lot::Mutex;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use rustc_hash::FxHashSet;

use crate::error::DecodeError;
use crate::error::Error;
use crate::error::StorageError;
use crate::storage::KvEngine;

/// An entity that can be persisted through `ObjectStorage`.
pub trait Storable: Clone + Send + Sync + 'static {
    /// Entity name used in errors and logs.
    const KIND: &'static str;

    fn storage_key(&self) -> Vec<u8>;

    fn storage_value(&self) -> Vec<u8>;

    /// Rebuild the entity from a stored key and value.
    fn from_storage(key: &[u8], value: &[u8]) -> Result<Self, DecodeError>;

    /// Human-readable key for diagnostics.
    fn display_key(&self) -> String {
        return bs58::encode(self.storage_key()).into_string();
    }

    /// Replace this entity's state with `other`. Forbidden unless overridden.
    fn update(&mut self, other: &Self) -> Result<(), Error> {
        let _ = other;
        return Err(integrity_violation(self));
    }

    /// Check that moving from `self` to `next` is a permitted mutation.
    fn validate_transition(&self, next: &Self) -> Result<(), Error> {
        let _ = next;
        return Ok(());
    }
}

/// The error for an attempted mutation of a write-once entity.
pub fn integrity_violation<T: Storable>(entity: &T) -> Error {
    return Error::IntegrityViolation {
        entity: T::KIND,
        key: entity.display_key(),
    };
}

struct CachedObject<T> {
    key: Vec<u8>,
    value: RwLock<Arc<T>>,
    write_lock: Mutex<()>,
    /// Outstanding handles. Only decremented with the cache map locked.
    handles: AtomicUsize,
    /// Only set with the cache map locked.
    delete_pending: AtomicBool,
}

/// The in-memory side of a table. Guarded by one mutex that is never held
/// across engine calls or while waiting for a key's write lock.
struct CacheMap<T> {
    objects: FxHashMap<Vec<u8>, Arc<CachedObject<T>>>,
    /// Keys whose engine delete is in flight. They read as absent.
    deleting: FxHashSet<Vec<u8>>,
    /// Bumped whenever an object leaves the map or an engine delete starts.
    /// A miss that read the engine under an older epoch may be stale.
    epoch: u64,
}

impl<T> CacheMap<T> {
    fn new() -> CacheMap<T> {
        return CacheMap {
            objects: FxHashMap::default(),
            deleting: FxHashSet::default(),
            epoch: 0,
        };
    }
}

struct Inner<T> {
    engine: Arc<dyn KvEngine>,
    table: String,
    lock_timeout: Option<Duration>,
    cache: Mutex<CacheMap<T>>,
}

/// What the cache map says about a key.
enum Lookup<T: Storable> {
    /// Cached and live, already checked out.
    Hit(CachedHandle<T>),
    /// Cached but pending deletion, or being deleted.
    Absent,
    /// Not cached; the engine must be consulted. Carries the epoch seen.
    Miss(u64),
}

/// Cache-through storage for one entity type in one table.
pub struct ObjectStorage<T: Storable> {
    inner: Arc<Inner<T>>,
}

impl<T: Storable> Clone for ObjectStorage<T> {
    fn clone(&self) -> Self {
        return ObjectStorage {
            inner: self.inner.clone(),
        };
    }
}

impl<T: Storable> ObjectStorage<T> {
    /// Create a storage over `table` of `engine`. `lock_timeout` bounds how
    /// long `consume` waits for a key's write lock.
    pub fn new(engine: Arc<dyn KvEngine>, table: impl Into<String>, lock_timeout: Option<Duration>) -> ObjectStorage<T> {
        return ObjectStorage {
            inner: Arc::new(Inner {
                engine,
                table: table.into(),
                lock_timeout,
                cache: Mutex::new(CacheMap::new()),
            }),
        };
    }

    pub fn table(&self) -> &str {
        return &self.inner.table;
    }

    /// Number of keys currently held in memory.
    pub fn cached_len(&self) -> usize {
        return self.inner.cache.lock().objects.len();
    }

    fn empty_handle(&self) -> CachedHandle<T> {
        return CachedHandle {
            inner: self.inner.clone(),
            object: None,
        };
    }

    /// Check out an object that is in the map. Must be called with the
    /// cache map locked.
    fn checkout(&self, object: &Arc<CachedObject<T>>) -> CachedHandle<T> {
        object.handles.fetch_add(1, Ordering::AcqRel);
        return CachedHandle {
            inner: self.inner.clone(),
            object: Some(object.clone()),
        };
    }

    fn lookup(&self, cache: &CacheMap<T>, key: &[u8]) -> Lookup<T> {
        if let Some(object) = cache.objects.get(key) {
            if object.delete_pending.load(Ordering::Acquire) {
                return Lookup::Absent;
            }
            return Lookup::Hit(self.checkout(object));
        }
        if cache.deleting.contains(key) {
            return Lookup::Absent;
        }
        return Lookup::Miss(cache.epoch);
    }

    fn cache_entity(&self, cache: &mut CacheMap<T>, key: Vec<u8>, entity: T) -> CachedHandle<T> {
        let object = Arc::new(CachedObject {
            key: key.clone(),
            value: RwLock::new(Arc::new(entity)),
            write_lock: Mutex::new(()),
            handles: AtomicUsize::new(0),
            delete_pending: AtomicBool::new(false),
        });
        let handle = self.checkout(&object);
        cache.objects.insert(key, object);
        return handle;
    }

    /// Load the entity stored under `key`. The returned handle is empty if
    /// there is none. Misses are not cached.
    ///
    /// The engine is read without the cache map locked. If an object left
    /// the map meanwhile, what was read may predate its last write, so the
    /// read is retried.
    pub fn load(&self, key: &[u8]) -> Result<CachedHandle<T>, Error> {
        loop {
            let epoch = match self.lookup(&self.inner.cache.lock(), key) {
                Lookup::Hit(handle) => {
                    tracing::trace!(kind = T::KIND, "cache hit");
                    return Ok(handle);
                }
                Lookup::Absent => return Ok(self.empty_handle()),
                Lookup::Miss(epoch) => epoch,
            };

            let entity = match self.inner.engine.get(&self.inner.table, key)? {
                Some(value) => Some(T::from_storage(key, &value)?),
                None => None,
            };

            let mut cache = self.inner.cache.lock();
            match self.lookup(&cache, key) {
                Lookup::Hit(handle) => return Ok(handle),
                Lookup::Absent => return Ok(self.empty_handle()),
                Lookup::Miss(current) if current != epoch => {
                    tracing::trace!(kind = T::KIND, "cache changed during miss, reloading");
                    continue;
                }
                Lookup::Miss(_) => {}
            }
            let Some(entity) = entity else {
                tracing::trace!(kind = T::KIND, "cache miss, not stored");
                return Ok(self.empty_handle());
            };
            tracing::trace!(kind = T::KIND, "cache miss, loaded from engine");
            return Ok(self.cache_entity(&mut cache, key.to_vec(), entity));
        }
    }

    /// Return true if an entity is stored under `key` and not pending deletion.
    pub fn contains(&self, key: &[u8]) -> Result<bool, Error> {
        // Bound first so a hit is released after the map guard is gone.
        let lookup = self.lookup(&self.inner.cache.lock(), key);
        match lookup {
            Lookup::Hit(_) => return Ok(true),
            Lookup::Absent => return Ok(false),
            Lookup::Miss(_) => {}
        }
        return Ok(self.inner.engine.get(&self.inner.table, key)?.is_some());
    }

    /// Insert `entity` unless its key is already taken.
    ///
    /// Returns a handle to whatever is stored under the key afterwards and
    /// whether this call inserted it. The check and insert are a single
    /// compare-and-swap in the engine.
    pub fn store_if_absent(&self, entity: T) -> Result<(CachedHandle<T>, bool), Error> {
        let key = entity.storage_key();
        let epoch = match self.lookup(&self.inner.cache.lock(), &key) {
            Lookup::Hit(handle) => return Ok((handle, false)),
            Lookup::Absent => return Ok((self.empty_handle(), false)),
            Lookup::Miss(epoch) => epoch,
        };

        let value = entity.storage_value();
        if !self.inner.engine.insert_if_absent(&self.inner.table, &key, &value)? {
            tracing::debug!(kind = T::KIND, key = %entity.display_key(), "already stored");
            return Ok((self.load(&key)?, false));
        }
        tracing::debug!(kind = T::KIND, key = %entity.display_key(), "stored");

        let mut cache = self.inner.cache.lock();
        match self.lookup(&cache, &key) {
            Lookup::Hit(handle) => return Ok((handle, true)),
            Lookup::Miss(current) if current == epoch => {
                return Ok((self.cache_entity(&mut cache, key, entity), true));
            }
            Lookup::Absent | Lookup::Miss(_) => {}
        }
        drop(cache);
        return Ok((self.load(&key)?, true));
    }

    /// Persist a new entity. If the key is already taken this is an update
    /// of the stored entity, which write-once types reject.
    pub fn store(&self, entity: T) -> Result<CachedHandle<T>, Error> {
        let (handle, inserted) = self.store_if_absent(entity.clone())?;
        if inserted {
            return Ok(handle);
        }
        if !handle.exists() {
            return Err(Error::InvalidConstruction(format!(
                "{} {} is pending deletion",
                T::KIND,
                entity.display_key()
            )));
        }
        handle.retain().apply(None, |current| current.update(&entity))?;
        return Ok(handle);
    }

    /// Route `entity` through the generic update path of the entity stored
    /// under the same key. Returns false if nothing is stored there.
    pub fn update(&self, entity: &T) -> Result<bool, Error> {
        let handle = self.load(&entity.storage_key())?;
        return handle.apply(None, |current| current.update(entity));
    }

    /// Delete the entity under `key`, deferring while handles are out.
    /// Returns false if nothing was stored.
    ///
    /// Never waits for a key's write lock; a deferred delete only marks the
    /// cached object.
    pub fn delete(&self, key: &[u8]) -> Result<bool, Error> {
        {
            let mut cache = self.inner.cache.lock();
            if let Some(object) = cache.objects.get(key) {
                let already = object.delete_pending.swap(true, Ordering::AcqRel);
                tracing::debug!(kind = T::KIND, "delete deferred until release");
                return Ok(!already);
            }
            if !cache.deleting.insert(key.to_vec()) {
                return Ok(false);
            }
            cache.epoch += 1;
        }
        let removed = self.inner.engine.delete(&self.inner.table, key);
        self.inner.cache.lock().deleting.remove(key);
        return Ok(removed?);
    }

    /// Visit every stored entity in key order until `visit` returns false.
    /// Entities pending deletion are still visited until released.
    pub fn for_each_stored<F: FnMut(T) -> bool>(&self, mut visit: F) -> Result<(), Error> {
        let mut failure: Option<DecodeError> = None;
        let mut visit_raw = |key: &[u8], value: &[u8]| -> bool {
            match T::from_storage(key, value) {
                Ok(entity) => return visit(entity),
                Err(err) => {
                    failure = Some(err);
                    return false;
                }
            }
        };
        self.inner.engine.for_each(&self.inner.table, &mut visit_raw)?;
        if let Some(err) = failure {
            return Err(err.into());
        }
        return Ok(());
    }
}

/// A checked-out reference to a cached entity.
///
/// Cloning a handle retains the entity; dropping one releases it.
pub struct CachedHandle<T: Storable> {
    inner: Arc<Inner<T>>,
    object: Option<Arc<CachedObject<T>>>,
}

impl<T: Storable> CachedHandle<T> {
    /// Return true if this handle refers to an entity.
    pub fn exists(&self) -> bool {
        return self.object.is_some();
    }

    pub fn key(&self) -> Option<&[u8]> {
        return self.object.as_ref().map(|object| object.key.as_slice());
    }

    /// Another handle to the same entity, keeping it cached.
    pub fn retain(&self) -> CachedHandle<T> {
        if let Some(object) = &self.object {
            // We already hold a count, so this cannot race with eviction.
            object.handles.fetch_add(1, Ordering::AcqRel);
        }
        return CachedHandle {
            inner: self.inner.clone(),
            object: self.object.clone(),
        };
    }

    /// The current entity, or `None` for an empty handle.
    pub fn get(&self) -> Option<Arc<T>> {
        return self.object.as_ref().map(|object| object.value.read().clone());
    }

    /// Apply `mutate` to the entity under its write lock, persist the
    /// result if it changed, and release this handle. Returns whether an
    /// entity was present.
    pub fn consume<F: FnOnce(&mut T)>(self, mutate: F) -> Result<bool, Error> {
        let timeout = self.inner.lock_timeout;
        return self.apply(timeout, |entity| {
            mutate(entity);
            return Ok(());
        });
    }

    /// `consume` with an explicit deadline for acquiring the write lock.
    /// Expiry fails with `Error::Unavailable` and changes nothing.
    pub fn consume_within<F: FnOnce(&mut T)>(self, timeout: Duration, mutate: F) -> Result<bool, Error> {
        return self.apply(Some(timeout), |entity| {
            mutate(entity);
            return Ok(());
        });
    }

    fn apply<F>(self, timeout: Option<Duration>, mutate: F) -> Result<bool, Error>
    where
        F: FnOnce(&mut T) -> Result<(), Error>,
    {
        let Some(object) = self.object.clone() else {
            return Ok(false);
        };

        {
            let _write = match timeout {
                Some(timeout) => object
                    .write_lock
                    .try_lock_for(timeout)
                    .ok_or(StorageError::Timeout(timeout))?,
                None => object.write_lock.lock(),
            };

            let current = object.value.read().clone();
            let mut next = T::clone(&current);
            let checked = mutate(&mut next)
                .and_then(|_| current.validate_transition(&next))
                .and_then(|_| {
                    if next.storage_key() != object.key {
                        return Err(integrity_violation(&*current));
                    }
                    return Ok(());
                });
            if let Err(err) = checked {
                if err.is_fatal() {
                    tracing::error!(kind = T::KIND, key = %current.display_key(), error = %err, "rejected mutation of immutable entity");
                }
                return Err(err);
            }

            let value = next.storage_value();
            if value != current.storage_value() {
                self.inner.engine.put(&self.inner.table, &object.key, &value)?;
                *object.value.write() = Arc::new(next);
                tracing::debug!(kind = T::KIND, key = %current.display_key(), "persisted mutation");
            }
        }

        self.release()?;
        return Ok(true);
    }

    /// Release this handle, running a deferred delete if it was the last one.
    pub fn release(mut self) -> Result<(), Error> {
        return self.release_inner();
    }

    fn release_inner(&mut self) -> Result<(), Error> {
        let Some(object) = self.object.take() else {
            return Ok(());
        };
        {
            let mut cache = self.inner.cache.lock();
            if object.handles.fetch_sub(1, Ordering::AcqRel) != 1 {
                return Ok(());
            }
            let cached_here = cache
                .objects
                .get(&object.key)
                .is_some_and(|cached| Arc::ptr_eq(cached, &object));
            if cached_here {
                cache.objects.remove(&object.key);
            }
            cache.epoch += 1;
            tracing::trace!(kind = T::KIND, "evicted after last release");
            if !object.delete_pending.load(Ordering::Acquire) {
                return Ok(());
            }
            cache.deleting.insert(object.key.clone());
        }

        let removed = self.inner.engine.delete(&self.inner.table, &object.key);
        self.inner.cache.lock().deleting.remove(&object.key);
        removed?;
        tracing::debug!(kind = T::KIND, "deferred delete applied");
        return Ok(());
    }
}

impl<T: Storable> Clone for CachedHandle<T> {
    fn clone(&self) -> Self {
        return self.retain();
    }
}

impl<T: Storable> Drop for CachedHandle<T> {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            tracing::error!(kind = T::KIND, error = %err, "release failed; call release() to observe this error");
        }
    }
}

impl<T: Storable + std::fmt::Debug> std::fmt::Debug for CachedHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        return match self.get() {
            Some(entity) => write!(f, "CachedHandle({entity:?})"),
            None => write!(f, "CachedHandle(empty)"),
        };
    }
}
