//! Content-addressed context cache
//!
//! Building a provider context (a color transform, a device link) is
//! expensive. The cache maps the SHA-256 hash of a canonical key text to the
//! built [`ContextHandle`] so identical requests share one context.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CMMError, Result};

use super::handle::ContextHandle;
use super::DEFAULT_MAX_ENTRIES;

/// Configuration for the context cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries before least recently used ones are purged
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl CacheConfig {
    /// Set max entries (at least one)
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max.max(1);
        self
    }
}

/// Fixed-length content hash of a cache key text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Hash key text
    pub fn of(text: &str) -> Self {
        let digest = Sha256::digest(text.as_bytes());
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// One entry. The cell is locked while its builder runs, so concurrent
/// lookups of the same key wait for a single build.
struct CacheSlot {
    key_text: String,
    cell: Mutex<Option<ContextHandle>>,
    last_used: AtomicU64,
    hits: AtomicU64,
}

impl CacheSlot {
    fn new(key_text: &str) -> Self {
        Self {
            key_text: key_text.to_string(),
            cell: Mutex::new(None),
            last_used: AtomicU64::new(0),
            hits: AtomicU64::new(0),
        }
    }

    fn handle(&self) -> Option<ContextHandle> {
        self.cell.try_lock().ok().and_then(|cell| cell.clone())
    }
}

/// Snapshot of one cache entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntryInfo {
    /// Hex content hash
    pub hash: String,
    pub key_text: String,
    /// Live references including the cache's own
    pub refs: usize,
    pub hits: u64,
    pub origin: String,
    pub resource_kind: String,
    pub size: usize,
}

/// Cache statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    /// Current number of entries
    pub entries: usize,
    /// Maximum entries allowed
    pub max_entries: usize,
    /// Lookups answered without building
    pub hits: u64,
    /// Lookups that ran a builder
    pub misses: u64,
    /// Entries purged by the LRU policy
    pub evictions: u64,
    /// Builder runs that returned an error
    pub build_failures: u64,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
}

/// Context cache
///
/// Every entry retains one reference to its context, so a context outlives
/// the callers that requested it until the entry is purged through LRU
/// eviction, [`invalidate`](Self::invalidate), [`clear`](Self::clear) or
/// [`purge_unused`](Self::purge_unused).
pub struct ContextCache {
    slots: Mutex<HashMap<ContentHash, Arc<CacheSlot>>>,
    config: CacheConfig,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    build_failures: AtomicU64,
}

impl ContextCache {
    /// Create a new cache with default config
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    /// Create with custom config
    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            config,
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            build_failures: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Return the context for `key_text`, building it on a miss.
    ///
    /// `builder` runs at most once per entry; a failed build is not cached
    /// and its error is returned unchanged. A builder must not request its
    /// own key.
    pub fn get_or_create<F>(&self, key_text: &str, builder: F) -> Result<ContextHandle>
    where
        F: FnOnce() -> Result<ContextHandle>,
    {
        let hash = ContentHash::of(key_text);
        let slot = {
            let mut slots = self.slots.lock().map_err(|_| CMMError::StorageLocked)?;
            slots
                .entry(hash)
                .or_insert_with(|| Arc::new(CacheSlot::new(key_text)))
                .clone()
        };
        slot.last_used.store(self.tick(), Ordering::Relaxed);

        let mut cell = slot.cell.lock().map_err(|_| CMMError::StorageLocked)?;
        if let Some(handle) = cell.as_ref() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            slot.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Context cache hit {} ({})", hash, key_text);
            return Ok(handle.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Context cache miss {} ({})", hash, key_text);

        match builder() {
            Ok(handle) => {
                *cell = Some(handle.clone());
                drop(cell);
                self.enforce_capacity(&hash)?;
                Ok(handle)
            }
            Err(err) => {
                self.build_failures.fetch_add(1, Ordering::Relaxed);
                drop(cell);
                self.discard_failed(&hash, &slot)?;
                Err(err)
            }
        }
    }

    /// Look up without building
    pub fn get(&self, key_text: &str) -> Option<ContextHandle> {
        let hash = ContentHash::of(key_text);
        let slot = self.slots.lock().ok()?.get(&hash).cloned();

        match slot.and_then(|slot| {
            slot.last_used.store(self.tick(), Ordering::Relaxed);
            slot.hits.fetch_add(1, Ordering::Relaxed);
            slot.handle()
        }) {
            Some(handle) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(handle)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Whether a built context exists for `key_text`
    pub fn contains(&self, key_text: &str) -> bool {
        let hash = ContentHash::of(key_text);
        self.slots
            .lock()
            .ok()
            .and_then(|slots| slots.get(&hash).and_then(|slot| slot.handle()))
            .is_some()
    }

    /// Drop the entry for `key_text`, returning whether one existed
    pub fn invalidate(&self, key_text: &str) -> Result<bool> {
        let hash = ContentHash::of(key_text);
        let removed = self
            .slots
            .lock()
            .map_err(|_| CMMError::StorageLocked)?
            .remove(&hash);
        Ok(removed.is_some())
    }

    /// Drop all entries
    pub fn clear(&self) -> Result<()> {
        let drained: Vec<_> = {
            let mut slots = self.slots.lock().map_err(|_| CMMError::StorageLocked)?;
            slots.drain().collect()
        };
        drop(drained);
        Ok(())
    }

    /// Drop entries whose context nobody but the cache references
    pub fn purge_unused(&self) -> Result<usize> {
        let purged: Vec<_> = {
            let mut slots = self.slots.lock().map_err(|_| CMMError::StorageLocked)?;
            let unused: Vec<ContentHash> = slots
                .iter()
                .filter(|(_, slot)| {
                    Arc::strong_count(slot) == 1
                        && slot.handle().map(|h| h.ref_count() == 2).unwrap_or(false)
                })
                .map(|(hash, _)| *hash)
                .collect();
            unused.iter().filter_map(|hash| slots.remove(hash)).collect()
        };
        let count = purged.len();
        drop(purged);
        if count > 0 {
            tracing::debug!("Purged {} unused context(s)", count);
        }
        Ok(count)
    }

    /// Remove a slot whose build failed, unless another caller is waiting on it
    fn discard_failed(&self, hash: &ContentHash, slot: &Arc<CacheSlot>) -> Result<()> {
        let mut slots = self.slots.lock().map_err(|_| CMMError::StorageLocked)?;
        let is_ours = slots.get(hash).map(|s| Arc::ptr_eq(s, slot)).unwrap_or(false);
        if is_ours && Arc::strong_count(slot) == 2 {
            slots.remove(hash);
        }
        Ok(())
    }

    /// Purge least recently used entries beyond `max_entries`
    fn enforce_capacity(&self, keep: &ContentHash) -> Result<()> {
        let evicted: Vec<Arc<CacheSlot>> = {
            let mut slots = self.slots.lock().map_err(|_| CMMError::StorageLocked)?;
            let mut evicted = Vec::new();
            while slots.len() > self.config.max_entries {
                let oldest = slots
                    .iter()
                    .filter(|(hash, slot)| *hash != keep && Arc::strong_count(slot) == 1)
                    .min_by_key(|(_, slot)| slot.last_used.load(Ordering::Relaxed))
                    .map(|(hash, _)| *hash);
                match oldest.and_then(|hash| slots.remove(&hash)) {
                    Some(slot) => evicted.push(slot),
                    None => break,
                }
            }
            evicted
        };

        for slot in &evicted {
            tracing::debug!("Evicting context {}", slot.key_text);
        }
        self.evictions
            .fetch_add(evicted.len() as u64, Ordering::Relaxed);
        // released outside the map lock: release hooks may use the cache
        drop(evicted);
        Ok(())
    }

    /// Snapshot of all built entries, most recently used first
    pub fn entries(&self) -> Vec<CacheEntryInfo> {
        let slots: Vec<(ContentHash, Arc<CacheSlot>)> = match self.slots.lock() {
            Ok(slots) => slots.iter().map(|(h, s)| (*h, s.clone())).collect(),
            Err(_) => return Vec::new(),
        };

        let mut ordered: Vec<_> = slots
            .into_iter()
            .filter_map(|(hash, slot)| {
                let handle = slot.handle()?;
                let info = CacheEntryInfo {
                    hash: hash.to_hex(),
                    key_text: slot.key_text.clone(),
                    // minus the clone taken for this snapshot
                    refs: handle.ref_count() - 1,
                    hits: slot.hits.load(Ordering::Relaxed),
                    origin: handle.origin().to_string(),
                    resource_kind: handle.resource_kind().to_string(),
                    size: handle.size(),
                };
                Some((slot.last_used.load(Ordering::Relaxed), info))
            })
            .collect();
        ordered.sort_by(|a, b| b.0.cmp(&a.0));
        ordered.into_iter().map(|(_, info)| info).collect()
    }

    /// Text dump of the cache, one line per entry
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let stats = self.stats();
        out.push_str(&format!(
            "context cache: {}/{} entries, {} hits, {} misses, {} evictions\n",
            stats.entries, stats.max_entries, stats.hits, stats.misses, stats.evictions
        ));
        for entry in self.entries() {
            out.push_str(&format!(
                "  refs: {:>3} hash: {} {} [{} {} bytes] {}\n",
                entry.refs,
                &entry.hash[..16],
                entry.resource_kind,
                entry.origin,
                entry.size,
                entry.key_text
            ));
        }
        out
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);

        CacheStats {
            entries: self.len(),
            max_entries: self.config.max_entries,
            hits,
            misses,
            evictions: self.evictions.load(Ordering::Relaxed),
            build_failures: self.build_failures.load(Ordering::Relaxed),
            hit_rate: if hits + misses > 0 {
                hits as f64 / (hits + misses) as f64
            } else {
                0.0
            },
        }
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ContextCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContextCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextCache")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
