//! Response cache: LRU + TTL + memory bound.
//!
//! Entries are keyed by a canonical SHA-256 signature of the request
//! (method, URL, sorted query parameters, and a small allow-list of
//! cache-relevant headers — everything else, including authorization, is
//! ignored for keying). Recency is an explicit doubly-linked list threaded
//! through an arena of slots, with a hash-to-slot lookup table: a hit moves
//! its node to the most-recently-used end in constant time, and eviction
//! runs expired entries first, then pops the least-recently-used end until
//! both the entry count and the byte budget fit.
//!
//! Persistence is optional and best-effort: the full non-expired entry set
//! is serialized to a single JSON file on writes and reloaded on startup.
//! Persistence failures are logged and absorbed; the in-memory cache keeps
//! working.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

/// Headers that participate in the canonical key. All others are excluded —
/// a cache-correctness rule, not a security filter.
pub const CACHE_RELEVANT_HEADERS: &[&str] = &["accept", "accept-encoding", "accept-language"];

/// Persistence failures. Logged and absorbed by the cache itself; exposed
/// for callers that persist explicitly.
#[derive(Debug, Error)]
pub enum CacheIoError {
    /// Reading or writing the artifact failed.
    #[error("cache persistence I/O failed: {0}")]
    Io(#[from] std::io::Error),
    /// The artifact could not be (de)serialized.
    #[error("cache artifact serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Canonical identity of a cacheable request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
    /// Hex-encoded SHA-256 over the canonical request signature.
    pub hash: String,
    /// Human-readable `METHOD url` form, kept for pattern invalidation
    /// and diagnostics.
    pub origin: String,
}

/// Build the canonical key for a request.
///
/// The method is upper-cased, query parameters are sorted so ordering does
/// not fragment the cache, and only [`CACHE_RELEVANT_HEADERS`] contribute.
pub fn canonical_key(method: &str, url: &Url, headers: &[(String, String)]) -> CacheKey {
    let method = method.to_ascii_uppercase();

    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(b"\n");

    hasher.update(url.scheme().as_bytes());
    hasher.update(b"://");
    if let Some(host) = url.host_str() {
        hasher.update(host.to_ascii_lowercase().as_bytes());
    }
    if let Some(port) = url.port() {
        hasher.update(b":");
        hasher.update(port.to_string().as_bytes());
    }
    hasher.update(url.path().as_bytes());
    hasher.update(b"\n");

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    for (k, v) in &pairs {
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
        hasher.update(b"\n");
    }

    for relevant in CACHE_RELEVANT_HEADERS {
        let mut values: Vec<&str> = headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case(relevant))
            .map(|(_, value)| value.as_str())
            .collect();
        values.sort_unstable();
        for value in values {
            hasher.update(relevant.as_bytes());
            hasher.update(b":");
            hasher.update(value.as_bytes());
            hasher.update(b"\n");
        }
    }

    let hash = hasher
        .finalize()
        .iter()
        .fold(String::with_capacity(64), |mut acc, byte| {
            use std::fmt::Write;
            let _ = write!(acc, "{byte:02x}");
            acc
        });

    CacheKey {
        hash,
        origin: format!("{method} {url}"),
    }
}

/// One cached response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Canonical key hash.
    pub key: String,
    /// `METHOD url` the entry was stored under.
    pub origin: String,
    /// Opaque cached value.
    pub value: serde_json::Value,
    /// Wall-clock creation time (wall clock so persistence survives restarts).
    pub created_at: DateTime<Utc>,
    /// Time-to-live in seconds.
    pub ttl_secs: u64,
    /// Number of cache hits served from this entry.
    pub hit_count: u64,
    /// Estimated serialized size in bytes.
    pub size_bytes: usize,
}

impl CacheEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let ttl = TimeDelta::seconds(i64::try_from(self.ttl_secs).unwrap_or(i64::MAX));
        now.signed_duration_since(self.created_at) > ttl
    }
}

/// Cumulative cache statistics. Reset only by [`ResponseCache::clear`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that found nothing (or only an expired entry).
    pub misses: u64,
    /// Entries removed by expiry or LRU/byte-budget pressure.
    pub evictions: u64,
    /// Estimated bytes currently held.
    pub total_bytes: usize,
    /// Live entries currently held.
    pub entry_count: usize,
}

impl CacheStats {
    /// Fraction of lookups served from the cache; 0 with no accesses.
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let accesses = self.hits.saturating_add(self.misses);
        if accesses == 0 {
            0.0
        } else {
            self.hits as f64 / accesses as f64
        }
    }
}

/// One slot in the recency list: the entry plus its neighbor links.
#[derive(Debug)]
struct Node {
    entry: CacheEntry,
    prev: Option<usize>,
    next: Option<usize>,
}

/// LRU + TTL + memory-bounded response store.
///
/// The recency order is a doubly-linked list threaded through `nodes`;
/// `index` maps a key hash to its slot, and vacated slots are recycled via
/// a free list. Hits and evictions relink in constant time.
///
/// All operations are synchronous and in-memory; callers share the cache
/// behind a mutex and hold it only for the duration of one operation.
#[derive(Debug)]
pub struct ResponseCache {
    index: HashMap<String, usize>,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    /// Least-recently-used end of the list.
    head: Option<usize>,
    /// Most-recently-used end of the list.
    tail: Option<usize>,
    max_entries: usize,
    max_bytes: usize,
    default_ttl: Duration,
    total_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    persist_path: Option<PathBuf>,
}

impl ResponseCache {
    /// Create an in-memory cache with the given bounds.
    pub fn new(max_entries: usize, max_bytes: usize, default_ttl: Duration) -> Self {
        Self {
            index: HashMap::new(),
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            max_entries,
            max_bytes,
            default_ttl,
            total_bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            persist_path: None,
        }
    }

    /// Enable single-file persistence, reloading any prior artifact.
    ///
    /// Entries that expired since they were written are discarded on load,
    /// and the configured bounds are enforced immediately, so an artifact
    /// written under a larger configuration cannot start the cache over
    /// budget. A missing or unreadable artifact is logged and ignored.
    pub fn with_persistence(mut self, path: PathBuf) -> Self {
        self.persist_path = Some(path);
        if let Err(e) = self.load() {
            warn!(error = %e, "cache artifact could not be loaded, starting empty");
        }
        self
    }

    /// Look up a value. Expired entries are purged lazily here.
    ///
    /// On hit the entry moves to the most-recently-used position and its
    /// hit count increments.
    pub fn get(&mut self, hash: &str) -> Option<serde_json::Value> {
        let now = Utc::now();

        let Some(&slot) = self.index.get(hash) else {
            self.misses = self.misses.saturating_add(1);
            return None;
        };

        let expired = self
            .nodes
            .get(slot)
            .and_then(Option::as_ref)
            .is_some_and(|node| node.entry.is_expired(now));
        if expired {
            self.remove_entry(hash);
            self.evictions = self.evictions.saturating_add(1);
            self.misses = self.misses.saturating_add(1);
            return None;
        }

        let value = match self.nodes.get_mut(slot).and_then(Option::as_mut) {
            Some(node) => {
                node.entry.hit_count = node.entry.hit_count.saturating_add(1);
                node.entry.value.clone()
            }
            None => {
                self.misses = self.misses.saturating_add(1);
                return None;
            }
        };

        self.touch(slot);
        self.hits = self.hits.saturating_add(1);
        Some(value)
    }

    /// Insert or overwrite a value under `key`.
    ///
    /// Builds the entry fully, makes room (expired first, then LRU until
    /// both bounds fit), then inserts at the most-recently-used position.
    /// A value too large for the byte budget on its own is not cached.
    pub fn set(&mut self, key: &CacheKey, value: serde_json::Value, ttl: Option<Duration>) {
        let size_bytes = match serde_json::to_vec(&value) {
            Ok(bytes) => bytes.len(),
            Err(_) => value.to_string().len(),
        };

        if size_bytes > self.max_bytes {
            debug!(
                origin = %key.origin,
                size_bytes,
                max_bytes = self.max_bytes,
                "value exceeds the cache byte budget, not cached"
            );
            return;
        }

        let entry = CacheEntry {
            key: key.hash.clone(),
            origin: key.origin.clone(),
            value,
            created_at: Utc::now(),
            ttl_secs: ttl.unwrap_or(self.default_ttl).as_secs(),
            hit_count: 0,
            size_bytes,
        };

        // Overwrite: drop the old entry's accounting first.
        self.remove_entry(&key.hash);

        self.purge_expired();
        while self.head.is_some()
            && (self.index.len() >= self.max_entries
                || self.total_bytes.saturating_add(size_bytes) > self.max_bytes)
        {
            if !self.evict_lru() {
                break;
            }
        }

        self.total_bytes = self.total_bytes.saturating_add(size_bytes);
        let slot = self.allocate(Node {
            entry,
            prev: None,
            next: None,
        });
        self.index.insert(key.hash.clone(), slot);
        self.push_back(slot);

        self.persist_best_effort();
    }

    /// Remove one entry. A no-op (returning false) if the key is absent.
    pub fn invalidate(&mut self, hash: &str) -> bool {
        let removed = self.remove_entry(hash);
        if removed {
            self.persist_best_effort();
        }
        removed
    }

    /// Remove every entry whose origin (`METHOD url`) matches `pattern`
    /// as a regex. Returns how many were removed; an invalid pattern
    /// removes nothing.
    pub fn invalidate_pattern(&mut self, pattern: &str) -> usize {
        let re = match Regex::new(pattern) {
            Ok(re) => re,
            Err(e) => {
                warn!(pattern, error = %e, "invalid invalidation pattern");
                return 0;
            }
        };

        let matching: Vec<String> = self
            .nodes
            .iter()
            .filter_map(Option::as_ref)
            .filter(|node| re.is_match(&node.entry.origin))
            .map(|node| node.entry.key.clone())
            .collect();

        for hash in &matching {
            self.remove_entry(hash);
        }
        if !matching.is_empty() {
            self.persist_best_effort();
        }
        matching.len()
    }

    /// Drop everything and reset the statistics.
    pub fn clear(&mut self) {
        self.index.clear();
        self.nodes.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.total_bytes = 0;
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
        self.persist_best_effort();
    }

    /// Snapshot the cumulative statistics.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            total_bytes: self.total_bytes,
            entry_count: self.index.len(),
        }
    }

    /// Serialize the non-expired entry set to the configured artifact.
    ///
    /// # Errors
    ///
    /// Returns [`CacheIoError`] if serialization or the file write fails.
    /// A cache without persistence configured succeeds trivially.
    pub fn persist(&self) -> Result<(), CacheIoError> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };

        let now = Utc::now();
        // Persist in recency order so the artifact reloads with the same
        // LRU ordering.
        let mut live: Vec<&CacheEntry> = Vec::with_capacity(self.index.len());
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let Some(node) = self.nodes.get(slot).and_then(Option::as_ref) else {
                break;
            };
            if !node.entry.is_expired(now) {
                live.push(&node.entry);
            }
            cursor = node.next;
        }

        let serialized = serde_json::to_vec(&live)?;
        std::fs::write(path, serialized)?;
        Ok(())
    }

    fn persist_best_effort(&self) {
        if let Err(e) = self.persist() {
            warn!(error = %e, "cache persistence failed, continuing in memory");
        }
    }

    fn load(&mut self) -> Result<(), CacheIoError> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }

        let raw = std::fs::read(path)?;
        let stored: Vec<CacheEntry> = serde_json::from_slice(&raw)?;

        let now = Utc::now();
        for entry in stored {
            if entry.is_expired(now) {
                continue;
            }
            self.total_bytes = self.total_bytes.saturating_add(entry.size_bytes);
            let hash = entry.key.clone();
            let slot = self.allocate(Node {
                entry,
                prev: None,
                next: None,
            });
            self.index.insert(hash, slot);
            self.push_back(slot);
        }

        // The artifact may have been written under larger bounds than this
        // cache is configured with; enforce them before serving anything.
        while self.head.is_some()
            && (self.index.len() > self.max_entries || self.total_bytes > self.max_bytes)
        {
            if !self.evict_lru() {
                break;
            }
        }

        debug!(entries = self.index.len(), "cache artifact reloaded");
        Ok(())
    }

    /// Remove expired entries, counting them as evictions.
    fn purge_expired(&mut self) {
        let now = Utc::now();
        let expired: Vec<String> = self
            .nodes
            .iter()
            .filter_map(Option::as_ref)
            .filter(|node| node.entry.is_expired(now))
            .map(|node| node.entry.key.clone())
            .collect();
        for hash in expired {
            self.remove_entry(&hash);
            self.evictions = self.evictions.saturating_add(1);
        }
    }

    /// Drop the least-recently-used entry, counting it as an eviction.
    /// Returns false when the list is empty or inconsistent.
    fn evict_lru(&mut self) -> bool {
        let Some(slot) = self.head else {
            return false;
        };
        let Some(hash) = self
            .nodes
            .get(slot)
            .and_then(Option::as_ref)
            .map(|node| node.entry.key.clone())
        else {
            return false;
        };
        let removed = self.remove_entry(&hash);
        if removed {
            self.evictions = self.evictions.saturating_add(1);
        }
        removed
    }

    /// Remove an entry: unlink its node, recycle the slot, and fix the
    /// byte accounting.
    fn remove_entry(&mut self, hash: &str) -> bool {
        let Some(slot) = self.index.remove(hash) else {
            return false;
        };
        self.unlink(slot);
        let Some(node) = self.nodes.get_mut(slot).and_then(Option::take) else {
            return false;
        };
        self.free.push(slot);
        self.total_bytes = self.total_bytes.saturating_sub(node.entry.size_bytes);
        true
    }

    /// Move a live node to the most-recently-used end.
    fn touch(&mut self, slot: usize) {
        if self.tail == Some(slot) {
            return;
        }
        self.unlink(slot);
        self.push_back(slot);
    }

    /// Detach a node from the list, repairing its neighbors and the ends.
    fn unlink(&mut self, slot: usize) {
        let Some((prev, next)) = self
            .nodes
            .get(slot)
            .and_then(Option::as_ref)
            .map(|node| (node.prev, node.next))
        else {
            return;
        };

        match prev {
            Some(p) => {
                if let Some(node) = self.nodes.get_mut(p).and_then(Option::as_mut) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.nodes.get_mut(n).and_then(Option::as_mut) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(node) = self.nodes.get_mut(slot).and_then(Option::as_mut) {
            node.prev = None;
            node.next = None;
        }
    }

    /// Attach a detached node at the most-recently-used end.
    fn push_back(&mut self, slot: usize) {
        let tail = self.tail;
        if let Some(node) = self.nodes.get_mut(slot).and_then(Option::as_mut) {
            node.prev = tail;
            node.next = None;
        }
        match tail {
            Some(t) => {
                if let Some(node) = self.nodes.get_mut(t).and_then(Option::as_mut) {
                    node.next = Some(slot);
                }
            }
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
    }

    /// Place a node into a recycled slot, or grow the arena.
    fn allocate(&mut self, node: Node) -> usize {
        match self.free.pop() {
            Some(slot) => {
                if let Some(cell) = self.nodes.get_mut(slot) {
                    *cell = Some(node);
                }
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len().saturating_sub(1)
            }
        }
    }

    #[cfg(test)]
    fn entry(&self, hash: &str) -> Option<&CacheEntry> {
        let slot = *self.index.get(hash)?;
        self.nodes
            .get(slot)
            .and_then(Option::as_ref)
            .map(|node| &node.entry)
    }

    #[cfg(test)]
    fn entry_mut(&mut self, hash: &str) -> Option<&mut CacheEntry> {
        let slot = *self.index.get(hash)?;
        self.nodes
            .get_mut(slot)
            .and_then(Option::as_mut)
            .map(|node| &mut node.entry)
    }
}
