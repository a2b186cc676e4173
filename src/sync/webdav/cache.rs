//! Connection validation cache
//!
//! Remembers successful reachability probes per (url, username, password) so
//! repeated operations skip the handshake. Entries expire after a TTL and the
//! map is garbage collected opportunistically on writes:
//! - at 80% of capacity expired entries are purged
//! - if still above 70%, least recently accessed entries are evicted

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use crate::clock::{Clock, SystemClock};
use crate::types::{ProbeResult, WebDavSettings};

/// Configuration for the validation cache
#[derive(Debug, Clone)]
pub struct ValidationCacheConfig {
    /// Time-to-live for entries in milliseconds (default: 30 minutes)
    pub ttl_ms: i64,
    /// Maximum number of entries (default: 100)
    pub capacity: usize,
    /// Fill ratio at which a write triggers garbage collection
    pub gc_trigger_ratio: f64,
    /// Fill ratio LRU eviction brings the cache back down to
    pub gc_target_ratio: f64,
}

impl Default for ValidationCacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30 * 60 * 1000,
            capacity: 100,
            gc_trigger_ratio: 0.8,
            gc_target_ratio: 0.7,
        }
    }
}

/// A cached probe outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationCacheEntry {
    pub result: ProbeResult,
    /// When the probe ran (epoch ms)
    pub timestamp: i64,
    /// When the entry was last read or written (epoch ms)
    pub last_accessed: i64,
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValidationCacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, ValidationCacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// TTL + LRU cache of connection validation results.
///
/// Construct once per process and share it with every client.
pub struct ValidationCache {
    state: Mutex<CacheState>,
    config: ValidationCacheConfig,
    clock: Arc<dyn Clock>,
}

impl Default for ValidationCache {
    fn default() -> Self {
        Self::new(ValidationCacheConfig::default(), Arc::new(SystemClock))
    }
}

impl ValidationCache {
    pub fn new(config: ValidationCacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            config,
            clock,
        }
    }

    /// Cache key for a connection config; credentials never stored in clear
    pub fn key_for(config: &WebDavSettings) -> String {
        let mut hasher = Sha256::new();
        hasher.update(config.url.trim().as_bytes());
        hasher.update([0u8]);
        hasher.update(config.username.as_bytes());
        hasher.update([0u8]);
        hasher.update(config.password.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Look up a live entry, refreshing its access time
    pub fn get(&self, key: &str) -> Option<ProbeResult> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();

        let ttl = self.config.ttl_ms;
        match state.entries.get(key).map(|entry| now - entry.timestamp > ttl) {
            None => {
                state.misses += 1;
                return None;
            }
            Some(true) => {
                state.entries.remove(key);
                state.misses += 1;
                return None;
            }
            Some(false) => {}
        }

        state.hits += 1;
        let entry = state.entries.get_mut(key)?;
        entry.last_accessed = now;
        Some(entry.result.clone())
    }

    /// Store a probe result and run garbage collection if needed
    pub fn put(&self, key: String, result: ProbeResult) {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        state.entries.insert(
            key,
            ValidationCacheEntry {
                result,
                timestamp: now,
                last_accessed: now,
            },
        );
        self.collect_garbage(&mut state, now);
    }

    /// Record the outcome of a writability probe on an existing entry
    pub fn set_can_write(&self, key: &str, can_write: bool) {
        let now = self.clock.now_ms();
        if let Some(entry) = self.state.lock().entries.get_mut(key) {
            entry.result.can_write = Some(can_write);
            entry.last_accessed = now;
        }
    }

    pub fn invalidate(&self, key: &str) {
        self.state.lock().entries.remove(key);
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> ValidationCacheStats {
        let state = self.state.lock();
        ValidationCacheStats {
            entries: state.entries.len(),
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
        }
    }

    fn collect_garbage(&self, state: &mut CacheState, now: i64) {
        let capacity = self.config.capacity as f64;
        let trigger = (capacity * self.config.gc_trigger_ratio).ceil() as usize;
        let target = (capacity * self.config.gc_target_ratio).floor() as usize;

        if state.entries.len() < trigger {
            return;
        }

        let ttl = self.config.ttl_ms;
        let before = state.entries.len();
        state.entries.retain(|_, entry| now - entry.timestamp <= ttl);
        let mut evicted = (before - state.entries.len()) as u64;

        if state.entries.len() > target {
            let mut by_access: Vec<(String, i64)> = state
                .entries
                .iter()
                .map(|(k, e)| (k.clone(), e.last_accessed))
                .collect();
            by_access.sort_by_key(|(_, accessed)| *accessed);

            let surplus = state.entries.len() - target;
            for (key, _) in by_access.into_iter().take(surplus) {
                state.entries.remove(&key);
                evicted += 1;
            }
        }

        if evicted > 0 {
            tracing::debug!(
                evicted,
                remaining = state.entries.len(),
                "Validation cache garbage collected"
            );
        }
        state.evictions += evicted;
    }
}
