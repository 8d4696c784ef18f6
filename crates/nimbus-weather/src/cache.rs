//! In-memory snapshot cache.
//!
//! Entries are never evicted by age. Age only decides whether a lookup counts
//! as fresh; stale entries stay available as a fallback for connectivity
//! failures until they are overwritten or the cache is cleared.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;

use crate::types::{GeoCoordinate, WeatherSnapshot};

/// Source of wall-clock time in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Cache key for a coordinate lookup. Six decimals is roughly 0.1 m.
pub fn coordinate_key(coord: &GeoCoordinate) -> String {
    // `+ 0.0` folds -0.0 into 0.0 so both render identically
    format!(
        "coord:{:.6}:{:.6}",
        coord.latitude + 0.0,
        coord.longitude + 0.0
    )
}

/// Cache key for a city lookup: trimmed, lowercased, inner whitespace collapsed.
pub fn city_key(name: &str) -> String {
    let normalized = name
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    format!("city:{}", normalized)
}

/// One cached snapshot. Replaced wholesale on every successful fetch.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub snapshot: Arc<WeatherSnapshot>,
    /// Insertion time, epoch milliseconds
    pub stored_at: i64,
}

impl CacheEntry {
    pub fn age_millis(&self, now: i64) -> i64 {
        now.saturating_sub(self.stored_at)
    }
}

pub struct WeatherCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for WeatherCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeatherCache")
            .field("entries", &self.entries.read().len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl WeatherCache {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Any entry for `key`, regardless of age.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.entries.read().get(key).cloned()
    }

    /// The entry for `key` only if it is younger than the TTL.
    pub fn get_fresh(&self, key: &str) -> Option<CacheEntry> {
        let entry = self.get(key)?;
        self.is_fresh(&entry).then_some(entry)
    }

    pub fn is_fresh(&self, entry: &CacheEntry) -> bool {
        let ttl_millis = i64::try_from(self.ttl.as_millis()).unwrap_or(i64::MAX);
        entry.age_millis(self.clock.now_millis()) < ttl_millis
    }

    /// Replace the entry for `key` with `snapshot`, stamped with the current time.
    pub fn put(&self, key: &str, snapshot: WeatherSnapshot) -> Arc<WeatherSnapshot> {
        let snapshot = Arc::new(snapshot);
        let entry = CacheEntry {
            key: key.to_string(),
            snapshot: Arc::clone(&snapshot),
            stored_at: self.clock.now_millis(),
        };
        self.entries.write().insert(key.to_string(), entry);
        snapshot
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write();
        tracing::debug!("Clearing {} cached weather entries", entries.len());
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Clock that only moves when told to.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ManualClock(std::sync::atomic::AtomicI64);

#[cfg(test)]
impl ManualClock {
    pub(crate) fn advance(&self, by: Duration) {
        self.0.fetch_add(
            by.as_millis() as i64,
            std::sync::atomic::Ordering::SeqCst,
        );
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}
