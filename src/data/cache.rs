//! In-memory caches
//!
//! These caches are volatile and cleared on restart.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use super::locks::{DEFAULT_GC_FREQUENCY, KeyLockTable};
use super::models::Status;
use crate::error::{AppError, Result};
use crate::metrics::{CACHE_HITS_TOTAL, CACHE_MISSES_TOTAL, CACHE_SIZE};

const KEY_SEPARATOR: char = '\u{1f}';

// =============================================================================
// Keys
// =============================================================================

/// A named lookup plus its ordered key parts, e.g. `("URI", [uri])`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    lookup: &'static str,
    parts: Vec<String>,
}

impl CacheKey {
    pub fn new<I, S>(lookup: &'static str, parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lookup,
            parts: parts.into_iter().map(Into::into).collect(),
        }
    }

    pub fn lookup(&self) -> &'static str {
        self.lookup
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    fn encode(&self) -> String {
        let mut encoded = String::from(self.lookup);
        for part in &self.parts {
            encoded.push(KEY_SEPARATOR);
            encoded.push_str(part);
        }
        encoded
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.lookup, self.parts.join(", "))
    }
}

/// A value that can live in an `EntityCache`.
pub trait Cacheable: Clone + Send + Sync + 'static {
    /// Unique aliases of this value. The first one is the primary key,
    /// which `store` locks on.
    fn cache_keys(&self) -> Vec<CacheKey>;

    /// Non-unique aliases that may point at an older value and must be
    /// dropped when this one is stored.
    fn stale_keys(&self) -> Vec<CacheKey> {
        Vec::new()
    }
}

/// Called with every value leaving the cache through `store` or
/// `invalidate`, outside of the cache's own locks.
pub type InvalidateHook<T> = Arc<dyn Fn(&T) + Send + Sync>;

// =============================================================================
// Index
// =============================================================================

struct Entry<T> {
    value: T,
    keys: Vec<String>,
}

struct Index<T> {
    entries: HashMap<u64, Entry<T>>,
    keys: HashMap<String, u64>,
    next_entry: u64,
    /// Bumped by every store and invalidation
    generation: u64,
    /// In-flight loads: key -> generation at start
    loading: HashMap<String, u64>,
    /// Aliases written or invalidated since the oldest in-flight load began
    touched: HashMap<String, u64>,
}

impl<T: Cacheable> Index<T> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            keys: HashMap::new(),
            next_entry: 0,
            generation: 0,
            loading: HashMap::new(),
            touched: HashMap::new(),
        }
    }

    fn get(&self, key: &str) -> Option<T> {
        let entry = self.keys.get(key)?;
        self.entries.get(entry).map(|entry| entry.value.clone())
    }

    fn remove_entry(&mut self, entry: u64) -> Option<Entry<T>> {
        let entry = self.entries.remove(&entry)?;
        for key in &entry.keys {
            self.keys.remove(key);
        }
        Some(entry)
    }

    fn remove(&mut self, key: &str) -> Option<Entry<T>> {
        let entry = *self.keys.get(key)?;
        self.remove_entry(entry)
    }

    /// Drop a single alias, leaving the entry reachable by its others.
    fn unlink(&mut self, key: &str) {
        if let Some(entry) = self.keys.remove(key) {
            if let Some(entry) = self.entries.get_mut(&entry) {
                entry.keys.retain(|k| k != key);
            }
        }
    }

    /// Start a new generation and mark `keys` as changed in it.
    fn touch<'a>(&mut self, keys: impl IntoIterator<Item = &'a String>) {
        self.generation += 1;
        if self.loading.is_empty() {
            return;
        }
        for key in keys {
            self.touched.insert(key.clone(), self.generation);
        }
    }

    fn begin_load(&mut self, key: &str) {
        self.loading.insert(key.to_string(), self.generation);
    }

    /// End the load of `key`. Returns whether `value` may be cached: none
    /// of its aliases, nor `key` itself, changed after the load began.
    fn finish_load(&mut self, key: &str, value: Option<&T>) -> bool {
        let Some(started) = self.loading.remove(key) else {
            return false;
        };

        let changed = |alias: &str| self.touched.get(alias).is_some_and(|g| *g > started);
        let fresh = match value {
            Some(value) => {
                !changed(key)
                    && !value
                        .cache_keys()
                        .iter()
                        .map(CacheKey::encode)
                        .any(|alias| changed(alias.as_str()))
            }
            None => false,
        };

        match self.loading.values().min().copied() {
            Some(oldest) => self.touched.retain(|_, generation| *generation > oldest),
            None => self.touched.clear(),
        }

        fresh
    }

    /// Insert `value` under its aliases plus `lookup`, evicting whatever
    /// those aliases pointed at. Returns the evicted values.
    fn insert(&mut self, value: &T, lookup: Option<String>) -> Vec<T> {
        let mut keys: Vec<String> = value.cache_keys().iter().map(CacheKey::encode).collect();
        if let Some(lookup) = lookup {
            if !keys.contains(&lookup) {
                keys.push(lookup);
            }
        }

        let mut evicted = Vec::new();
        for key in &keys {
            if let Some(old) = self.remove(key) {
                evicted.push(old.value);
            }
        }

        self.next_entry += 1;
        let entry = self.next_entry;
        for key in &keys {
            self.keys.insert(key.clone(), entry);
        }
        self.entries.insert(
            entry,
            Entry {
                value: value.clone(),
                keys,
            },
        );

        evicted
    }
}

// =============================================================================
// Entity Cache
// =============================================================================

/// Single-flight, multi-alias cache
pub struct EntityCache<T> {
    name: &'static str,
    index: Mutex<Index<T>>,
    locks: KeyLockTable,
    on_invalidate: Option<InvalidateHook<T>>,
}

impl<T: Cacheable> EntityCache<T> {
    /// Create new cache
    ///
    /// # Arguments
    /// * `name` - Label used in logs and metrics
    pub fn new(name: &'static str) -> Self {
        Self::with_gc_frequency(name, DEFAULT_GC_FREQUENCY)
    }

    pub fn with_gc_frequency(name: &'static str, gc_frequency: u32) -> Self {
        Self {
            name,
            index: Mutex::new(Index::new()),
            locks: KeyLockTable::with_gc_frequency(gc_frequency),
            on_invalidate: None,
        }
    }

    /// Run `hook` for every value evicted by `store` or `invalidate`,
    /// and for every newly stored value.
    pub fn with_invalidate_hook(mut self, hook: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.on_invalidate = Some(Arc::new(hook));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Cached value under `key`, without loading.
    pub fn get(&self, key: &CacheKey) -> Option<T> {
        self.index.lock().get(&key.encode())
    }

    /// Number of cached values.
    pub fn len(&self) -> usize {
        self.index.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fetch the value under `key`, running `compute` on a miss.
    ///
    /// Concurrent misses on the same key run `compute` once; the others
    /// wait and receive the cached result. Errors are not cached.
    pub async fn load<F, Fut>(&self, key: CacheKey, compute: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let encoded = key.encode();

        if let Some(value) = self.index.lock().get(&encoded) {
            self.record_hit(&key);
            return Ok(value);
        }

        let _guard = self.locks.lock(encoded.clone()).await;

        // Someone else may have loaded it while we waited.
        {
            let mut index = self.index.lock();
            if let Some(value) = index.get(&encoded) {
                drop(index);
                self.record_hit(&key);
                return Ok(value);
            }
            index.begin_load(&encoded);
        }
        let mut pending = PendingLoad {
            index: &self.index,
            key: &encoded,
            armed: true,
        };

        CACHE_MISSES_TOTAL.with_label_values(&[self.name]).inc();
        tracing::debug!(cache = self.name, key = %key, "Cache miss");

        let value = compute().await?;
        pending.armed = false;

        let mut index = self.index.lock();
        if index.finish_load(&encoded, Some(&value)) {
            // Displaced values are other copies of the same aliases, so the
            // hook is not run.
            index.insert(&value, Some(encoded.clone()));
            self.record_size(&index);
        } else {
            tracing::debug!(
                cache = self.name,
                key = %key,
                "Entity changed during load; result not cached"
            );
        }

        Ok(value)
    }

    /// Persist `value` with `persist`, then cache it.
    ///
    /// Only the value's primary-key lock is held while `persist` runs, so
    /// `persist` may itself load or store other keys. Nothing is cached if
    /// `persist` fails.
    pub async fn store<F, Fut>(&self, value: T, persist: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let primary = value.cache_keys().into_iter().next().ok_or_else(|| {
            AppError::Internal(anyhow::anyhow!("{} value has no cache key", self.name))
        })?;

        let _guard = self.locks.lock(primary.encode()).await;

        persist().await?;

        let evicted = {
            let mut index = self.index.lock();
            let stale: Vec<String> = value.stale_keys().iter().map(CacheKey::encode).collect();
            for key in &stale {
                index.unlink(key);
            }
            let evicted = index.insert(&value, None);

            let mut touched: Vec<String> = value
                .cache_keys()
                .iter()
                .map(CacheKey::encode)
                .chain(stale)
                .collect();
            for old in &evicted {
                touched.extend(old.cache_keys().iter().map(CacheKey::encode));
            }
            index.touch(&touched);

            self.record_size(&index);
            evicted
        };

        tracing::debug!(cache = self.name, key = %primary, "Cache store");

        if let Some(hook) = &self.on_invalidate {
            for old in &evicted {
                hook(old);
            }
            hook(&value);
        }

        Ok(())
    }

    /// Remove the value under `key` along with all its other aliases.
    pub fn invalidate(&self, key: &CacheKey) {
        let removed = {
            let mut index = self.index.lock();
            let encoded = key.encode();
            let removed = index.remove(&encoded);

            let mut touched = vec![encoded];
            if let Some(entry) = &removed {
                touched.extend(entry.keys.iter().cloned());
            }
            index.touch(&touched);

            self.record_size(&index);
            removed.map(|entry| entry.value)
        };

        tracing::debug!(
            cache = self.name,
            key = %key,
            found = removed.is_some(),
            "Cache invalidate"
        );

        if let (Some(hook), Some(value)) = (&self.on_invalidate, &removed) {
            hook(value);
        }
    }

    fn record_hit(&self, key: &CacheKey) {
        CACHE_HITS_TOTAL.with_label_values(&[self.name]).inc();
        tracing::trace!(cache = self.name, key = %key, "Cache hit");
    }

    fn record_size(&self, index: &Index<T>) {
        CACHE_SIZE
            .with_label_values(&[self.name])
            .set(index.entries.len() as i64);
    }
}

/// Ends a load abandoned by an error or cancellation.
struct PendingLoad<'a, T: Cacheable> {
    index: &'a Mutex<Index<T>>,
    key: &'a str,
    armed: bool,
}

impl<T: Cacheable> Drop for PendingLoad<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.index.lock().finish_load(self.key, None);
        }
    }
}

// =============================================================================
// ID list cache
// =============================================================================

/// Ordered ID list keyed by a target ID (e.g. replies of a status)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdList {
    pub target: String,
    pub ids: Vec<String>,
}

const TARGET_LOOKUP: &str = "Target";

impl Cacheable for IdList {
    fn cache_keys(&self) -> Vec<CacheKey> {
        vec![CacheKey::new(TARGET_LOOKUP, [self.target.as_str()])]
    }
}

/// Secondary cache mapping a target ID to an ordered list of IDs
pub struct IdListCache {
    inner: EntityCache<IdList>,
}

impl IdListCache {
    pub fn new(name: &'static str) -> Self {
        Self::with_gc_frequency(name, DEFAULT_GC_FREQUENCY)
    }

    pub fn with_gc_frequency(name: &'static str, gc_frequency: u32) -> Self {
        Self {
            inner: EntityCache::with_gc_frequency(name, gc_frequency),
        }
    }

    /// IDs for `target`, running `compute` once on a miss.
    pub async fn load<F, Fut>(&self, target: &str, compute: F) -> Result<Vec<String>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<String>>>,
    {
        let list = self
            .inner
            .load(CacheKey::new(TARGET_LOOKUP, [target]), || async {
                Ok(IdList {
                    target: target.to_string(),
                    ids: compute().await?,
                })
            })
            .await?;
        Ok(list.ids)
    }

    pub fn get(&self, target: &str) -> Option<Vec<String>> {
        self.inner
            .get(&CacheKey::new(TARGET_LOOKUP, [target]))
            .map(|list| list.ids)
    }

    pub fn invalidate(&self, target: &str) {
        self.inner
            .invalidate(&CacheKey::new(TARGET_LOOKUP, [target]));
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

// =============================================================================
// Status caches
// =============================================================================

/// Lookup names a status is cached under
pub mod lookup {
    pub const ID: &str = "ID";
    pub const URI: &str = "URI";
    pub const URL: &str = "URL";
    pub const POLL_ID: &str = "PollID";
    /// Not unique: an account may boost the same status more than once.
    pub const BOOST: &str = "BoostOfID+AccountID";
}

impl Cacheable for Status {
    fn cache_keys(&self) -> Vec<CacheKey> {
        let mut keys = vec![
            CacheKey::new(lookup::ID, [self.id.as_str()]),
            CacheKey::new(lookup::URI, [self.uri.as_str()]),
        ];
        if let Some(url) = &self.url {
            keys.push(CacheKey::new(lookup::URL, [url.as_str()]));
        }
        if let Some(poll_id) = &self.poll_id {
            keys.push(CacheKey::new(lookup::POLL_ID, [poll_id.as_str()]));
        }
        keys
    }

    fn stale_keys(&self) -> Vec<CacheKey> {
        match &self.boost_of_id {
            Some(boost_of_id) => vec![CacheKey::new(
                lookup::BOOST,
                [boost_of_id.as_str(), self.account_id.as_str()],
            )],
            None => Vec::new(),
        }
    }
}

/// Every cache the status store uses, built once per process
pub struct Caches {
    pub status: EntityCache<Status>,
    /// Parent ID -> reply IDs, newest first
    pub in_reply_to_ids: Arc<IdListCache>,
    /// Boosted status ID -> boost IDs, newest first
    pub boost_of_ids: Arc<IdListCache>,
}

impl Caches {
    pub fn new(lock_gc_frequency: u32) -> Self {
        let in_reply_to_ids = Arc::new(IdListCache::with_gc_frequency(
            "in_reply_to_ids",
            lock_gc_frequency,
        ));
        let boost_of_ids = Arc::new(IdListCache::with_gc_frequency(
            "boost_of_ids",
            lock_gc_frequency,
        ));

        let replies = Arc::clone(&in_reply_to_ids);
        let boosts = Arc::clone(&boost_of_ids);
        let status = EntityCache::with_gc_frequency("status", lock_gc_frequency)
            .with_invalidate_hook(move |status: &Status| {
                if let Some(parent_id) = &status.in_reply_to_id {
                    replies.invalidate(parent_id);
                }
                if let Some(boost_of_id) = &status.boost_of_id {
                    boosts.invalidate(boost_of_id);
                }
                replies.invalidate(&status.id);
                boosts.invalidate(&status.id);
            });

        Self {
            status,
            in_reply_to_ids,
            boost_of_ids,
        }
    }
}

impl Default for Caches {
    fn default() -> Self {
        Self::new(DEFAULT_GC_FREQUENCY)
    }
}
