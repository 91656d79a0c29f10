use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info};
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::DatabaseConfig;
use crate::engine::buffer::{self, PooledBuffer};
use crate::engine::events::{ChangeEvent, ChangeFeed};
use crate::engine::filter::{CustomFilter, TypeFilter};
use crate::engine::map::{KeyComparer, StoreMap};
use crate::engine::{CipherCache, Serializer};
use crate::{Error, Result};

struct PendingWrite {
    key: String,
    value: Vec<u8>,
}

/// An open store: the in-memory map plus everything needed to persist it.
///
/// Writes are pushed onto a pending queue and merged into the map by a drain that
/// holds the write lock. Every write drains before it returns, so a completed
/// [`upsert`](Self::upsert) is visible to any later read. Writes that pile up while
/// another drain holds the lock are merged by that drain and persisted with a
/// single snapshot.
///
/// A store opened leniently over a file it could not decrypt keeps working in memory,
/// but every attempt to persist fails until a [`rollback`](Self::rollback) loads the
/// file successfully.
pub struct Database {
    config: DatabaseConfig,
    comparer: KeyComparer,
    map: RwLock<StoreMap>,
    queue: Mutex<Vec<PendingWrite>>,
    estimated_size: AtomicUsize,
    update_count: AtomicU64,
    serialization_count: AtomicU64,
    serializer: Serializer,
    ciphers: Arc<CipherCache>,
    key_locks: DashMap<String, Arc<KeyLock>>,
    feed: ChangeFeed,
    closed: AtomicBool,
}

impl Database {
    /// Opens the store described by `config`, loading its file if one exists.
    pub fn create_or_load(config: DatabaseConfig) -> Result<Self> {
        Self::create_or_load_with(config, Arc::new(CipherCache::new()))
    }

    /// Like [`create_or_load`](Self::create_or_load), sharing per-value cipher providers
    /// through `ciphers`.
    pub fn create_or_load_with(config: DatabaseConfig, ciphers: Arc<CipherCache>) -> Result<Self> {
        let serializer = Serializer::from_config(&config)?;
        let estimated = file_len(serializer.path());
        let map = serializer.deserialize(estimated, config.ignore_case)?;
        Ok(Self::assemble(config, serializer, map, estimated, ciphers))
    }

    pub async fn create_or_load_async(config: DatabaseConfig) -> Result<Self> {
        Self::create_or_load_async_with(config, Arc::new(CipherCache::new())).await
    }

    pub async fn create_or_load_async_with(
        config: DatabaseConfig,
        ciphers: Arc<CipherCache>,
    ) -> Result<Self> {
        let serializer = Serializer::from_config(&config)?;
        let estimated = file_len_async(serializer.path()).await;
        let map = serializer
            .deserialize_async(estimated, config.ignore_case, std::future::pending())
            .await?;
        Ok(Self::assemble(config, serializer, map, estimated, ciphers))
    }

    /// A fresh ordinal store that never touches the disk.
    pub fn in_memory() -> Self {
        Self::assemble(
            DatabaseConfig::in_memory(),
            Serializer::Disabled,
            StoreMap::new(KeyComparer::Ordinal),
            0,
            Arc::new(CipherCache::new()),
        )
    }

    fn assemble(
        config: DatabaseConfig,
        serializer: Serializer,
        map: StoreMap,
        estimated: usize,
        ciphers: Arc<CipherCache>,
    ) -> Self {
        match serializer.path() {
            Some(path) => info!("Opened database {:?} with {} entries", path, map.len()),
            None => debug!("Opened in-memory database"),
        }
        Self {
            comparer: map.comparer(),
            config,
            map: RwLock::new(map),
            queue: Mutex::new(Vec::new()),
            estimated_size: AtomicUsize::new(estimated),
            update_count: AtomicU64::new(0),
            serialization_count: AtomicU64::new(0),
            serializer,
            ciphers,
            key_locks: DashMap::new(),
            feed: ChangeFeed::default(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn path(&self) -> Option<&Path> {
        self.serializer.path()
    }

    pub fn comparer(&self) -> KeyComparer {
        self.comparer
    }

    /// True when the file could not be decrypted at load and writes to it are refused.
    pub fn is_degraded(&self) -> bool {
        self.serializer.is_degraded()
    }

    // ---- reads ----

    pub fn contains_key(&self, key: &str) -> bool {
        self.map.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    /// A snapshot of every key, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.map.read().keys().map(str::to_owned).collect()
    }

    /// The stored bytes for `key`, decrypted with `value_key` if one is given.
    ///
    /// A missing key is `None`. A value that cannot be decrypted under `value_key`
    /// comes back empty rather than as an error, as does a value persisted as absent.
    pub fn try_get(&self, key: &str, value_key: Option<&str>) -> Option<Vec<u8>> {
        let map = self.map.read();
        let stored = map.get(key)?.value().unwrap_or_default();
        match active_key(value_key) {
            None => Some(stored.to_vec()),
            Some(passphrase) => Some(self.decrypt_value(stored, passphrase)),
        }
    }

    /// Copies the value for `key` into a pooled buffer with `extra_capacity` spare
    /// elements after it, for callers that only need the bytes transiently.
    pub fn try_get_pooled(
        &self,
        key: &str,
        value_key: Option<&str>,
        extra_capacity: usize,
    ) -> Option<PooledBuffer<'static, u8>> {
        let map = self.map.read();
        let stored = map.get(key)?.value().unwrap_or_default();
        let mut buf = buffer::bytes().rent(stored.len() + extra_capacity);
        match active_key(value_key) {
            None => buf.write(stored),
            Some(passphrase) => {
                let written = self
                    .ciphers
                    .get_or_create(passphrase)
                    .and_then(|cipher| cipher.decrypt_into(stored, buf.tail_mut()));
                if let Err(e) = written.and_then(|n| buf.advance(n)) {
                    debug!("Value for key '{}' could not be decrypted: {}", key, e);
                    buf.reset();
                }
            }
        }
        Some(buf)
    }

    /// Decodes the value for `key` as a `T`. Missing keys and undecodable values are `None`.
    pub fn try_get_as<T: DeserializeOwned>(&self, key: &str, value_key: Option<&str>) -> Option<T> {
        let bytes = self.try_get(key, value_key)?;
        decode_typed(key, &bytes)
    }

    /// Decodes the value for `key` as a sequence of `T`.
    pub fn try_get_many<T: DeserializeOwned>(
        &self,
        key: &str,
        value_key: Option<&str>,
    ) -> Option<Vec<T>> {
        let bytes = self.try_get(key, value_key)?;
        decode_typed(key, &bytes)
    }

    // ---- writes ----

    /// Stores `value` under `key`, encrypting it with `value_key` if one is given.
    pub fn upsert(&self, key: &str, value: &[u8], value_key: Option<&str>) -> Result<()> {
        self.ensure_open()?;
        let stored = match active_key(value_key) {
            None => value.to_vec(),
            Some(passphrase) => self.ciphers.get_or_create(passphrase)?.encrypt(value)?,
        };
        self.queue.lock().push(PendingWrite {
            key: key.to_string(),
            value: stored,
        });
        if self.config.trigger_update_events {
            self.feed.publish(ChangeEvent::upsert(key, value.to_vec()));
        }
        self.empty_queue()?;
        Ok(())
    }

    /// Encodes `value` with bincode and stores it.
    pub fn upsert_as<T: Serialize>(&self, key: &str, value: &T, value_key: Option<&str>) -> Result<bool> {
        let bytes = bincode::serialize(value)?;
        self.upsert(key, &bytes, value_key)?;
        Ok(true)
    }

    /// Stores `value` unless a current value exists and `condition` rejects it.
    ///
    /// The check and the write are not one atomic step; use
    /// [`atomic_upsert`](Self::atomic_upsert) when that matters.
    pub fn upsert_as_if<T, F>(
        &self,
        key: &str,
        value: &T,
        value_key: Option<&str>,
        condition: F,
    ) -> Result<bool>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&T) -> bool,
    {
        if let Some(existing) = self.try_get_as::<T>(key, value_key) {
            if !condition(&existing) {
                debug!("Update condition rejected write to '{}'", key);
                return Ok(false);
            }
        }
        self.upsert_as(key, value, value_key)
    }

    /// Encodes `values` as one sequence and stores it under `key`.
    pub fn upsert_many<T: Serialize>(
        &self,
        key: &str,
        values: &[T],
        value_key: Option<&str>,
    ) -> Result<bool> {
        let bytes = bincode::serialize(values)?;
        self.upsert(key, &bytes, value_key)?;
        Ok(true)
    }

    pub fn upsert_many_if<T, F>(
        &self,
        key: &str,
        values: &[T],
        value_key: Option<&str>,
        condition: F,
    ) -> Result<bool>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&[T]) -> bool,
    {
        if let Some(existing) = self.try_get_many::<T>(key, value_key) {
            if !condition(&existing) {
                debug!("Update condition rejected write to '{}'", key);
                return Ok(false);
            }
        }
        self.upsert_many(key, values, value_key)
    }

    /// Replaces the value of `key` with `transform(current)` while holding a section
    /// exclusive to that key. A missing key starts from an empty payload.
    ///
    /// Callers on different keys never wait for each other. If `transform` fails,
    /// nothing is written and its error is returned; the section is released either way,
    /// including when `transform` panics.
    pub fn atomic_upsert<F>(&self, key: &str, value_key: Option<&str>, transform: F) -> Result<Vec<u8>>
    where
        F: FnOnce(Vec<u8>) -> Result<Vec<u8>>,
    {
        self.ensure_open()?;
        let _section = self.lock_key(key);
        let current = self.try_get(key, value_key).unwrap_or_default();
        let updated = transform(current)?;
        self.upsert(key, &updated, value_key)?;
        Ok(updated)
    }

    /// Returns the value of `key`, first storing `factory(key)` if it has none.
    ///
    /// Only exclusive with other per-key sections (`atomic_upsert`, `get_or_add`).
    pub fn get_or_add<F>(&self, key: &str, value_key: Option<&str>, factory: F) -> Result<Vec<u8>>
    where
        F: FnOnce(&str) -> Vec<u8>,
    {
        if let Some(existing) = self.try_get(key, value_key) {
            return Ok(existing);
        }
        self.ensure_open()?;
        let _section = self.lock_key(key);
        if let Some(existing) = self.try_get(key, value_key) {
            return Ok(existing);
        }
        let value = factory(key);
        self.upsert(key, &value, value_key)?;
        Ok(value)
    }

    /// Merges every pending write into the map, then persists once if anything was merged
    /// and `serialize_on_update` is set. Returns the number of writes merged.
    pub fn empty_queue(&self) -> Result<usize> {
        let mut map = self.map.write();
        let pending = std::mem::take(&mut *self.queue.lock());
        let applied = pending.len();
        for PendingWrite { key, value } in pending {
            let size = self.entry_size(&key, value.len());
            map.insert(key, Some(value));
            self.estimated_size.fetch_add(size, Ordering::Relaxed);
            self.update_count.fetch_add(1, Ordering::Relaxed);
        }
        if applied == 0 {
            return Ok(0);
        }
        debug!("Merged {} pending writes", applied);
        if self.config.serialize_on_update {
            self.persist(RwLockWriteGuard::downgrade(map))?;
        }
        Ok(applied)
    }

    // ---- removal ----

    /// Removes `key`. Returns `false`, with no side effects, if it was not present.
    pub fn remove(&self, key: &str) -> Result<bool> {
        self.ensure_open()?;
        let mut map = self.map.write();
        let Some(entry) = map.remove(key) else {
            return Ok(false);
        };
        let (key, value) = entry.into_parts();
        self.shrink_estimate(self.entry_size(&key, value.as_ref().map_or(0, Vec::len)));
        self.update_count.fetch_add(1, Ordering::Relaxed);

        if self.config.serialize_on_update {
            self.persist(RwLockWriteGuard::downgrade(map))?;
        } else {
            drop(map);
        }
        if self.config.trigger_update_events {
            self.feed.publish(ChangeEvent::remove(key, value));
        }
        Ok(true)
    }

    /// Removes every key whose name satisfies `predicate` and returns how many went.
    ///
    /// With `key_prefix`, only keys starting with it are candidates and `predicate` sees
    /// the remainder after the prefix.
    pub fn remove_where<P>(&self, mut predicate: P, key_prefix: Option<&str>) -> Result<usize>
    where
        P: FnMut(&str) -> bool,
    {
        self.ensure_open()?;
        let mut map = self.map.write();
        let comparer = map.comparer();
        let doomed: Vec<String> = map
            .keys()
            .filter_map(|key| {
                let candidate = match key_prefix {
                    Some(prefix) => comparer.strip_prefix(key, prefix)?,
                    None => key,
                };
                predicate(candidate).then(|| key.to_owned())
            })
            .collect();

        let mut removed = Vec::with_capacity(doomed.len());
        for key in &doomed {
            if let Some(entry) = map.remove(key) {
                let value_len = entry.value().map_or(0, <[u8]>::len);
                self.shrink_estimate(self.entry_size(entry.key(), value_len));
                self.update_count.fetch_add(1, Ordering::Relaxed);
                removed.push(entry);
            }
        }
        let count = removed.len();
        if count == 0 {
            return Ok(0);
        }
        debug!("Removed {} entries by predicate", count);

        if self.config.serialize_on_update {
            self.persist(RwLockWriteGuard::downgrade(map))?;
        } else {
            drop(map);
        }
        if self.config.trigger_update_events {
            for entry in removed {
                let (key, value) = entry.into_parts();
                self.feed.publish(ChangeEvent::remove(key, value));
            }
        }
        Ok(count)
    }

    /// Empties the store and resets the size estimate.
    pub fn clear(&self) -> Result<()> {
        self.ensure_open()?;
        let mut map = self.map.write();
        map.clear();
        self.estimated_size.store(0, Ordering::Relaxed);
        self.update_count.fetch_add(1, Ordering::Relaxed);

        if self.config.serialize_on_update {
            self.persist(RwLockWriteGuard::downgrade(map))?;
        } else {
            drop(map);
        }
        if self.config.trigger_update_events {
            self.feed.publish(ChangeEvent::clear_all());
        }
        Ok(())
    }

    // ---- persistence ----

    /// Writes a snapshot of the whole map. A no-op for in-memory stores.
    pub fn serialize(&self) -> Result<()> {
        self.persist(self.map.read())
    }

    pub async fn serialize_async(&self) -> Result<()> {
        self.serialize_async_until(std::future::pending()).await
    }

    /// Like [`serialize_async`](Self::serialize_async); resolving `cancel` aborts the
    /// file write and keeps the previous file.
    pub async fn serialize_async_until<C>(&self, cancel: C) -> Result<()>
    where
        C: Future<Output = ()>,
    {
        let snapshot = {
            let map = self.map.read();
            self.serializer.render(&map, self.estimated_size())?
        };
        if let Some(snapshot) = snapshot {
            self.serializer.write_async(snapshot, cancel).await?;
            self.serialization_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Discards in-memory changes by reloading the file. An in-memory store ends up empty.
    pub fn rollback(&self) -> Result<()> {
        let mut map = self.map.write();
        let estimated = file_len(self.serializer.path());
        *map = self.serializer.deserialize(estimated, self.config.ignore_case)?;
        self.estimated_size.store(estimated, Ordering::Relaxed);
        self.update_count.fetch_add(1, Ordering::Relaxed);
        debug!("Rolled back to {} persisted entries", map.len());
        Ok(())
    }

    pub async fn rollback_async(&self) -> Result<()> {
        let estimated = file_len_async(self.serializer.path()).await;
        let loaded = self
            .serializer
            .deserialize_async(estimated, self.config.ignore_case, std::future::pending())
            .await?;
        let mut map = self.map.write();
        *map = loaded;
        self.estimated_size.store(estimated, Ordering::Relaxed);
        self.update_count.fetch_add(1, Ordering::Relaxed);
        debug!("Rolled back to {} persisted entries", map.len());
        Ok(())
    }

    fn persist(&self, map: RwLockReadGuard<'_, StoreMap>) -> Result<()> {
        let snapshot = self.serializer.render(&map, self.estimated_size())?;
        drop(map);
        if let Some(snapshot) = snapshot {
            self.serializer.write(snapshot)?;
            self.serialization_count.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    // ---- lifecycle, events, counters ----

    /// Receives a [`ChangeEvent`] for every mutation while `trigger_update_events` is set.
    pub fn subscribe(&self) -> Receiver<ChangeEvent> {
        self.feed.subscribe()
    }

    /// Merges outstanding writes and rejects further writes. Calling it again does nothing.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let merged = self.empty_queue()?;
        if merged == 0 && self.config.serialize_on_update {
            self.serialize()?;
        }
        debug!("Closed database {:?}", self.path());
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Running size estimate used to pre-size snapshot buffers. Never exact.
    pub fn estimated_size(&self) -> usize {
        self.estimated_size.load(Ordering::Relaxed)
    }

    /// Number of mutations applied since the store was opened.
    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::Relaxed)
    }

    /// Number of snapshots written since the store was opened.
    pub fn serialization_count(&self) -> u64 {
        self.serialization_count.load(Ordering::Relaxed)
    }

    // ---- typed tables ----

    /// A logical table of `T` values stored under `"<TypeName>:"` keys.
    pub fn filter<T>(&self) -> TypeFilter<'_, T>
    where
        T: Serialize + DeserializeOwned,
    {
        TypeFilter::new(self)
    }

    /// Like [`filter`](Self::filter), with `T` supplying its own byte codec.
    pub fn custom_filter<T>(&self) -> CustomFilter<'_, T>
    where
        T: crate::ValueSerializer,
    {
        CustomFilter::new(self)
    }

    /// The key a filter of `T` stores `key` under.
    pub fn typed_key<T: ?Sized>(key: &str) -> String {
        format!("{}{}", crate::engine::filter::type_prefix::<T>(), key)
    }

    // ---- internals ----

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn entry_size(&self, key: &str, value_len: usize) -> usize {
        key.len() * self.config.string_encoding.unit_size() + value_len
    }

    fn shrink_estimate(&self, size: usize) {
        let _ = self
            .estimated_size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(size))
            });
    }

    fn decrypt_value(&self, stored: &[u8], passphrase: &str) -> Vec<u8> {
        match self.ciphers.get_or_create(passphrase) {
            Ok(cipher) => cipher.decrypt(stored),
            Err(e) => {
                debug!("No cipher for value key: {}", e);
                Vec::new()
            }
        }
    }

    fn lock_key(&self, key: &str) -> KeySection<'_> {
        let normalized = self.comparer.normalize(key).into_owned();
        let lock = self
            .key_locks
            .entry(normalized.clone())
            .or_default()
            .value()
            .clone();
        {
            let mut held = lock.held.lock();
            while *held {
                lock.released.wait(&mut held);
            }
            *held = true;
        }
        KeySection {
            locks: &self.key_locks,
            key: normalized,
            lock: Some(lock),
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path())
            .field("comparer", &self.comparer)
            .field("encrypted", &self.serializer.is_encrypted())
            .field("entries", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Default)]
struct KeyLock {
    held: Mutex<bool>,
    released: Condvar,
}

/// Exclusive section for one key; released on drop.
struct KeySection<'a> {
    locks: &'a DashMap<String, Arc<KeyLock>>,
    key: String,
    lock: Option<Arc<KeyLock>>,
}

impl Drop for KeySection<'_> {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            *lock.held.lock() = false;
            lock.released.notify_one();
        }
        // Only the map's own reference left means nobody holds or waits on it.
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn active_key(value_key: Option<&str>) -> Option<&str> {
    value_key.filter(|k| !k.is_empty())
}

fn decode_typed<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Option<T> {
    match bincode::deserialize(bytes) {
        Ok(value) => Some(value),
        Err(e) => {
            debug!("Value for key '{}' could not be decoded: {}", key, e);
            None
        }
    }
}

fn file_len(path: Option<&Path>) -> usize {
    path.and_then(|p| std::fs::metadata(p).ok())
        .map_or(0, |m| m.len() as usize)
}

async fn file_len_async(path: Option<&Path>) -> usize {
    match path {
        Some(p) => tokio::fs::metadata(p)
            .await
            .map_or(0, |m| m.len() as usize),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ChangeType;
    use serde::Deserialize;
    use std::thread;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Counter {
        name: String,
        hits: u32,
    }

    #[test]
    fn test_upsert_get_remove() {
        let db = Database::in_memory();
        db.upsert("k1", b"v1", None).unwrap();
        assert!(db.contains_key("k1"));
        assert_eq!(db.try_get("k1", None).unwrap(), b"v1");
        assert_eq!(db.len(), 1);

        assert!(db.remove("k1").unwrap());
        assert!(db.try_get("k1", None).is_none());
        assert!(db.is_empty());
    }

    #[test]
    fn test_missing_key_is_none() {
        let db = Database::in_memory();
        assert!(db.try_get("nope", None).is_none());
        assert!(db.try_get_as::<Counter>("nope", None).is_none());
        assert!(db.try_get_pooled("nope", None, 16).is_none());
    }

    #[test]
    fn test_remove_missing_has_no_effect() {
        let db = Database::create_or_load(DatabaseConfig::in_memory().with_update_events(true)).unwrap();
        let events = db.subscribe();
        let before = db.update_count();
        assert!(!db.remove("ghost").unwrap());
        assert_eq!(db.update_count(), before);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_case_policy() {
        let sensitive = Database::in_memory();
        sensitive.upsert("Key", b"v", None).unwrap();
        assert!(!sensitive.contains_key("key"));

        let insensitive =
            Database::create_or_load(DatabaseConfig::in_memory().with_ignore_case(true)).unwrap();
        insensitive.upsert("Key", b"v", None).unwrap();
        assert!(insensitive.contains_key("key"));
        assert!(insensitive.remove("KEY").unwrap());
    }

    #[test]
    fn test_upsert_is_visible_on_return() {
        let db = Database::in_memory();
        thread::scope(|s| {
            for t in 0..4 {
                let db = &db;
                s.spawn(move || {
                    for i in 0..50 {
                        let key = format!("{}-{}", t, i);
                        db.upsert(&key, &[t as u8, i as u8], None).unwrap();
                        assert_eq!(db.try_get(&key, None).unwrap(), vec![t as u8, i as u8]);
                    }
                });
            }
        });
        assert_eq!(db.len(), 200);
        assert_eq!(db.update_count(), 200);
    }

    #[test]
    fn test_per_value_encryption() {
        let db = Database::in_memory();
        db.upsert("secret", b"plain", Some("value-key")).unwrap();

        let raw = db.try_get("secret", None).unwrap();
        assert_ne!(raw, b"plain");
        assert_eq!(db.try_get("secret", Some("value-key")).unwrap(), b"plain");
        assert_ne!(db.try_get("secret", Some("other-key")).unwrap(), b"plain");
        // Empty value key means no encryption.
        assert_eq!(db.try_get("secret", Some("")).unwrap(), raw);
    }

    #[test]
    fn test_pooled_read_with_extra_capacity() {
        let db = Database::in_memory();
        db.upsert("k", b"abc", None).unwrap();
        db.upsert("enc", b"hidden", Some("pk")).unwrap();

        let mut buf = db.try_get_pooled("k", None, 100).unwrap();
        assert_eq!(buf.written(), b"abc");
        assert!(buf.remaining() >= 100);
        buf.write(b"def");
        assert_eq!(buf.written(), b"abcdef");

        let dec = db.try_get_pooled("enc", Some("pk"), 0).unwrap();
        assert_eq!(dec.written(), b"hidden");
        let wrong = db.try_get_pooled("enc", Some("nope"), 0).unwrap();
        assert_ne!(wrong.written(), b"hidden");
    }

    #[test]
    fn test_typed_roundtrip_and_condition() {
        let db = Database::in_memory();
        let c = Counter { name: "a".into(), hits: 1 };
        assert!(db.upsert_as("c", &c, None).unwrap());
        assert_eq!(db.try_get_as::<Counter>("c", None).unwrap(), c);

        let newer = Counter { name: "a".into(), hits: 5 };
        let older = Counter { name: "a".into(), hits: 0 };
        assert!(db.upsert_as_if("c", &newer, None, |cur: &Counter| cur.hits < 5).unwrap());
        assert!(!db.upsert_as_if("c", &older, None, |cur: &Counter| cur.hits < 5).unwrap());
        assert_eq!(db.try_get_as::<Counter>("c", None).unwrap().hits, 5);

        // Garbage decodes to None rather than an error.
        db.upsert("junk", &[0xff], None).unwrap();
        assert!(db.try_get_as::<Counter>("junk", None).is_none());
    }

    #[test]
    fn test_typed_many() {
        let db = Database::in_memory();
        let values = vec![1u64, 2, 3];
        db.upsert_many("nums", &values, Some("k")).unwrap();
        assert_eq!(db.try_get_many::<u64>("nums", Some("k")).unwrap(), values);

        let rejected = db
            .upsert_many_if("nums", &[9u64], Some("k"), |cur: &[u64]| cur.is_empty())
            .unwrap();
        assert!(!rejected);
        assert_eq!(db.try_get_many::<u64>("nums", Some("k")).unwrap(), values);
    }

    #[test]
    fn test_atomic_upsert_serializes_same_key() {
        let db = Database::in_memory();
        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..100 {
                        db.atomic_upsert("counter", None, |current| {
                            let n = match current.as_slice() {
                                [] => 0,
                                bytes => u32::from_le_bytes(bytes.try_into().map_err(|_| {
                                    Error::Aborted("counter is not 4 bytes".to_string())
                                })?),
                            };
                            Ok((n + 1).to_le_bytes().to_vec())
                        })
                        .unwrap();
                    }
                });
            }
        });
        let raw = db.try_get("counter", None).unwrap();
        assert_eq!(u32::from_le_bytes(raw.try_into().unwrap()), 800);
        assert!(db.key_locks.is_empty());
    }

    #[test]
    fn test_atomic_upsert_failure_writes_nothing_and_releases() {
        let db = Database::in_memory();
        let err = db
            .atomic_upsert("k", None, |_| Err(Error::Aborted("no".to_string())))
            .unwrap_err();
        assert!(matches!(err, Error::Aborted(_)));
        assert!(!db.contains_key("k"));

        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = db.atomic_upsert("k", None, |_| panic!("transform blew up"));
        }));
        assert!(panicked.is_err());
        // The section was released by the panic, so this does not deadlock.
        let v = db.atomic_upsert("k", None, |_| Ok(vec![1])).unwrap();
        assert_eq!(v, vec![1]);
    }

    #[test]
    fn test_get_or_add() {
        let db = Database::in_memory();
        let first = db.get_or_add("k", None, |key| key.as_bytes().to_vec()).unwrap();
        assert_eq!(first, b"k");
        let second = db.get_or_add("k", None, |_| b"other".to_vec()).unwrap();
        assert_eq!(second, b"k");
    }

    #[test]
    fn test_remove_where_with_prefix() {
        let db = Database::in_memory();
        for key in ["T:a1", "T:a2", "T:b1", "a3"] {
            db.upsert(key, b"x", None).unwrap();
        }
        let removed = db.remove_where(|rest| rest.starts_with('a'), Some("T:")).unwrap();
        assert_eq!(removed, 2);
        let mut keys = db.keys();
        keys.sort();
        assert_eq!(keys, vec!["T:b1".to_string(), "a3".to_string()]);

        assert_eq!(db.remove_where(|_| true, None).unwrap(), 2);
        assert!(db.is_empty());
    }

    #[test]
    fn test_events() {
        let db = Database::create_or_load(DatabaseConfig::in_memory().with_update_events(true)).unwrap();
        let events = db.subscribe();

        db.upsert("k", b"plain", Some("pk")).unwrap();
        let up = events.try_recv().unwrap();
        assert_eq!(up.change_type, ChangeType::Upsert);
        assert_eq!(up.value.as_deref(), Some(&b"plain"[..]));

        db.remove("k").unwrap();
        let rm = events.try_recv().unwrap();
        assert_eq!(rm.change_type, ChangeType::Remove);
        assert_eq!(rm.key, "k");

        db.upsert("a", b"1", None).unwrap();
        db.upsert("b", b"2", None).unwrap();
        let _ = events.try_iter().count();
        db.clear().unwrap();
        let all = events.try_recv().unwrap();
        assert!(all.is_clear_all());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_estimate_tracks_writes_and_clear() {
        let db = Database::in_memory();
        db.upsert("abc", &[0u8; 10], None).unwrap();
        assert_eq!(db.estimated_size(), 13);
        db.remove("abc").unwrap();
        assert_eq!(db.estimated_size(), 0);

        db.upsert("abc", &[0u8; 10], None).unwrap();
        db.clear().unwrap();
        assert_eq!(db.estimated_size(), 0);
        assert!(db.is_empty());
    }

    #[test]
    fn test_close_rejects_writes() {
        let db = Database::in_memory();
        db.upsert("k", b"v", None).unwrap();
        db.close().unwrap();
        db.close().unwrap();
        assert!(matches!(db.upsert("k2", b"v", None), Err(Error::Closed)));
        assert!(matches!(db.remove("k"), Err(Error::Closed)));
        assert_eq!(db.try_get("k", None).unwrap(), b"v");
    }

    #[test]
    fn test_close_writes_one_final_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig::file(dir.path().join("close.db")).with_serialize_on_update(true);

        let idle = Database::create_or_load(config.clone()).unwrap();
        idle.close().unwrap();
        assert_eq!(idle.serialization_count(), 1);
        drop(idle);

        let db = Database::create_or_load(config.clone()).unwrap();
        db.queue.lock().push(PendingWrite {
            key: "late".to_string(),
            value: vec![1],
        });
        db.close().unwrap();
        assert_eq!(db.serialization_count(), 1);
        assert!(Database::create_or_load(config).unwrap().contains_key("late"));
    }

    #[test]
    fn test_in_memory_serialize_is_noop_and_rollback_empties() {
        let db = Database::in_memory();
        db.upsert("k", b"v", None).unwrap();
        db.serialize().unwrap();
        assert_eq!(db.serialization_count(), 0);
        db.rollback().unwrap();
        assert!(db.is_empty());
    }

    #[test]
    fn test_typed_key() {
        assert_eq!(Database::typed_key::<Counter>("x"), "Counter:x");
    }
}
