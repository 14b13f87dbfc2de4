//! Dual-tier TTL cache with stale reads
//!
//! The volatile tier is an in-process [`DashMap`]; every mutation is mirrored
//! best-effort into an optional [`DurableTier`]. A failing durable tier only
//! degrades the cache to volatile-only operation.
//!
//! Freshness is `now - stored_at < ttl`. Expired entries stay readable through
//! [`CacheStore::get_allow_stale`] until a sweep removes them, and never for
//! longer than the maximum durable age.

use crate::clock::{elapsed_between, Clock};
use crate::config::EngineConfig;
use crate::durable::DurableTier;
use crate::events::{EngineEvent, EventBus};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Key prefix for records written to the durable tier
pub const DURABLE_KEY_PREFIX: &str = "bulwark-cache:";

/// A cached value with its freshness bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry<V> {
    /// Cached value
    pub value: V,
    /// When the value was stored
    pub stored_at: DateTime<Utc>,
    /// Time-to-live from `stored_at`
    #[serde(rename = "ttlMs", with = "duration_ms")]
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    /// Create an entry stored at `now`
    pub fn new(value: V, stored_at: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            value,
            stored_at,
            ttl,
        }
    }

    /// Age of the entry at `now`
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        elapsed_between(self.stored_at, now)
    }

    /// Whether the entry is still within its TTL at `now`
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.age(now) < self.ttl
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// Cache settings
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied when `set` is called without one
    pub default_ttl: Duration,
    /// Absolute ceiling on how old a stale read may be
    pub max_durable_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            max_durable_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl From<&EngineConfig> for CacheConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            default_ttl: config.cache_ttl(),
            max_durable_age: config.max_durable_age(),
        }
    }
}

/// Point-in-time cache counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    /// Entries held by the volatile tier
    pub entries: usize,
    /// Volatile entries past their TTL but not yet swept
    pub expired: usize,
    /// Fresh reads
    pub hits: u64,
    /// Reads that found nothing fresh
    pub misses: u64,
    /// Reads served from an expired entry
    pub stale_hits: u64,
    /// Whether the last durable operation succeeded
    pub durable_available: bool,
    /// Durable operations that failed since start
    pub durable_failures: u64,
}

/// Dual-tier TTL cache
#[derive(Debug)]
pub struct CacheStore<V> {
    config: CacheConfig,
    volatile: DashMap<String, CacheEntry<V>>,
    durable: Option<Arc<dyn DurableTier>>,
    durable_available: AtomicBool,
    durable_failures: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
    clock: Arc<dyn Clock>,
    events: EventBus,
}

impl<V> CacheStore<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Create a volatile-only cache
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>, events: EventBus) -> Self {
        Self {
            config,
            volatile: DashMap::new(),
            durable: None,
            durable_available: AtomicBool::new(true),
            durable_failures: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stale_hits: AtomicU64::new(0),
            clock,
            events,
        }
    }

    /// Mirror writes into `tier`
    pub fn with_durable(mut self, tier: Arc<dyn DurableTier>) -> Self {
        self.durable = Some(tier);
        self
    }

    /// Whether a durable tier is attached
    pub fn has_durable(&self) -> bool {
        self.durable.is_some()
    }

    /// Cache settings
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Repopulate the volatile tier from the durable tier
    ///
    /// Records older than the maximum durable age are deleted, whatever their
    /// own TTL. Corrupt records are deleted individually. Returns the number
    /// of entries restored.
    pub async fn restore(&self) -> usize {
        let Some(tier) = self.durable.as_ref() else {
            return 0;
        };

        let keys = match tier.list_keys_with_prefix(DURABLE_KEY_PREFIX).await {
            Ok(keys) => {
                self.mark_durable_ok();
                keys
            }
            Err(e) => {
                self.mark_durable_failure("list", &e);
                return 0;
            }
        };

        let now = self.clock.now();
        let mut restored = 0;

        for durable_key in keys {
            let Some(key) = durable_key.strip_prefix(DURABLE_KEY_PREFIX) else {
                continue;
            };
            match self.read_durable(tier.as_ref(), key).await {
                Some(entry) if entry.age(now) < self.config.max_durable_age => {
                    self.volatile.insert(key.to_string(), entry);
                    restored += 1;
                }
                Some(_) => {
                    tracing::debug!(key = %key, "Discarding durable entry past maximum age");
                    self.mirror_delete(key).await;
                }
                None => {}
            }
        }

        tracing::info!(restored, "Cache restored from durable tier");
        restored
    }

    /// Store `value` under `key`; `ttl` defaults to the configured TTL
    pub async fn set(&self, key: &str, value: V, ttl: Option<Duration>) {
        let entry = CacheEntry::new(
            value,
            self.clock.now(),
            ttl.unwrap_or(self.config.default_ttl),
        );
        self.volatile.insert(key.to_string(), entry.clone());
        self.mirror_write(key, &entry).await;
    }

    /// Fresh value for `key`
    ///
    /// An expired entry is evicted from the volatile tier and reported as a
    /// miss. The durable record is left for stale reads and the next sweep.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();

        if let Some(entry) = self.volatile.get(key) {
            if entry.is_fresh(now) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
        }

        self.volatile.remove_if(key, |_, entry| !entry.is_fresh(now));
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Fresh value for `key`, leaving an expired entry in place
    ///
    /// Counts hits and misses like [`get`](Self::get). The request pipeline
    /// reads through this so a volatile-only cache can still serve the
    /// expired entry as a stale fallback.
    pub fn peek(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let fresh = self
            .volatile
            .get(key)
            .filter(|entry| entry.is_fresh(now))
            .map(|entry| entry.value.clone());

        match fresh {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        fresh
    }

    /// Value for `key` regardless of freshness
    ///
    /// Falls back to the durable tier when the volatile tier no longer holds
    /// the key. Never counts as a hit or miss and never changes what `get`
    /// will return.
    pub async fn get_allow_stale(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        let ceiling = self.config.max_durable_age;

        let volatile = self.volatile.get(key).map(|e| e.value().clone());
        let entry = match volatile {
            Some(entry) => Some(entry),
            None => match self.durable.as_ref() {
                Some(tier) => self.read_durable(tier.as_ref(), key).await,
                None => None,
            },
        }?;

        if entry.age(now) >= ceiling {
            return None;
        }
        if !entry.is_fresh(now) {
            self.stale_hits.fetch_add(1, Ordering::Relaxed);
        }
        Some(entry.value)
    }

    /// Remove `key` from both tiers
    pub async fn delete(&self, key: &str) {
        self.volatile.remove(key);
        self.mirror_delete(key).await;
    }

    /// Sweep expired entries from both tiers
    ///
    /// Returns the number of distinct keys evicted.
    pub async fn cleanup(&self) -> usize {
        let now = self.clock.now();
        let mut evicted: HashSet<String> = HashSet::new();

        self.volatile.retain(|key, entry| {
            let fresh = entry.is_fresh(now);
            if !fresh {
                evicted.insert(key.clone());
            }
            fresh
        });

        if let Some(tier) = self.durable.as_ref() {
            match tier.list_keys_with_prefix(DURABLE_KEY_PREFIX).await {
                Ok(keys) => {
                    self.mark_durable_ok();
                    for durable_key in keys {
                        let Some(key) = durable_key.strip_prefix(DURABLE_KEY_PREFIX) else {
                            continue;
                        };
                        let expired = match self.read_durable(tier.as_ref(), key).await {
                            Some(entry) => !entry.is_fresh(now),
                            // unreadable records were already deleted
                            None => false,
                        };
                        if expired {
                            self.mirror_delete(key).await;
                            evicted.insert(key.to_string());
                        }
                    }
                }
                Err(e) => self.mark_durable_failure("list", &e),
            }
        }

        let count = evicted.len();
        if count > 0 {
            tracing::debug!(count, "Evicted expired cache entries");
            self.events.emit(EngineEvent::CacheEvicted { count });
        }
        count
    }

    /// Remove every entry from both tiers
    pub async fn clear(&self) {
        self.volatile.clear();

        let Some(tier) = self.durable.as_ref() else {
            return;
        };
        match tier.list_keys_with_prefix(DURABLE_KEY_PREFIX).await {
            Ok(keys) => {
                for durable_key in keys {
                    if let Err(e) = tier.delete(&durable_key).await {
                        self.mark_durable_failure("delete", &e);
                    }
                }
            }
            Err(e) => self.mark_durable_failure("list", &e),
        }
    }

    /// Number of entries in the volatile tier
    pub fn len(&self) -> usize {
        self.volatile.len()
    }

    /// True when the volatile tier is empty
    pub fn is_empty(&self) -> bool {
        self.volatile.is_empty()
    }

    /// Whether the last durable operation succeeded
    pub fn durable_available(&self) -> bool {
        self.durable_available.load(Ordering::SeqCst)
    }

    /// Current counters
    pub fn stats(&self) -> CacheStats {
        let now = self.clock.now();
        let expired = self
            .volatile
            .iter()
            .filter(|e| !e.value().is_fresh(now))
            .count();

        CacheStats {
            entries: self.volatile.len(),
            expired,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            durable_available: self.durable_available(),
            durable_failures: self.durable_failures.load(Ordering::Relaxed),
        }
    }

    async fn read_durable(&self, tier: &dyn DurableTier, key: &str) -> Option<CacheEntry<V>> {
        let durable_key = durable_key(key);
        let raw = match tier.read(&durable_key).await {
            Ok(Some(raw)) => {
                self.mark_durable_ok();
                raw
            }
            Ok(None) => {
                self.mark_durable_ok();
                return None;
            }
            Err(e) => {
                self.mark_durable_failure("read", &e);
                return None;
            }
        };

        match decode_record::<V>(key, &raw) {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::warn!(key = %key, code = ?err.code(), error = %err, "Dropping corrupt durable cache record");
                if let Err(e) = tier.delete(&durable_key).await {
                    self.mark_durable_failure("delete", &e);
                }
                None
            }
        }
    }

    async fn mirror_write(&self, key: &str, entry: &CacheEntry<V>) {
        let Some(tier) = self.durable.as_ref() else {
            return;
        };
        let serialized = match serde_json::to_string(entry) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Cache value not serializable, kept volatile only");
                return;
            }
        };
        match tier.write(&durable_key(key), serialized).await {
            Ok(()) => self.mark_durable_ok(),
            Err(e) => self.mark_durable_failure("write", &e),
        }
    }

    async fn mirror_delete(&self, key: &str) {
        let Some(tier) = self.durable.as_ref() else {
            return;
        };
        match tier.delete(&durable_key(key)).await {
            Ok(()) => self.mark_durable_ok(),
            Err(e) => self.mark_durable_failure("delete", &e),
        }
    }

    fn mark_durable_ok(&self) {
        if !self.durable_available.swap(true, Ordering::SeqCst) {
            tracing::info!("Durable cache tier available again");
        }
    }

    fn mark_durable_failure(&self, op: &'static str, err: &bulwark_error::BulwarkError) {
        self.durable_failures.fetch_add(1, Ordering::Relaxed);
        if self.durable_available.swap(false, Ordering::SeqCst) {
            tracing::warn!(op, error = %err, "Durable cache tier unavailable, continuing volatile-only");
        } else {
            tracing::debug!(op, error = %err, "Durable cache tier still unavailable");
        }
    }
}

fn durable_key(key: &str) -> String {
    format!("{DURABLE_KEY_PREFIX}{key}")
}

fn decode_record<V: DeserializeOwned>(key: &str, raw: &str) -> bulwark_error::Result<CacheEntry<V>> {
    serde_json::from_str(raw).map_err(|e| bulwark_error::BulwarkError::CorruptRecord {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::durable::MemoryDurableTier;

    fn store(clock: Arc<ManualClock>) -> (CacheStore<String>, Arc<MemoryDurableTier>) {
        let tier = Arc::new(MemoryDurableTier::new());
        let cache = CacheStore::new(CacheConfig::default(), clock, EventBus::default())
            .with_durable(tier.clone());
        (cache, tier)
    }

    #[tokio::test]
    async fn test_fresh_then_expired() {
        let clock = Arc::new(ManualClock::starting_now());
        let (cache, _) = store(clock.clone());

        cache.set("k", "v".into(), Some(Duration::from_millis(1000))).await;
        clock.advance(Duration::from_millis(999));
        assert_eq!(cache.get("k"), Some("v".to_string()));

        clock.advance(Duration::from_millis(1));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_stale_read_survives_get_eviction() {
        let clock = Arc::new(ManualClock::starting_now());
        let (cache, _) = store(clock.clone());

        cache.set("k", "v".into(), Some(Duration::from_secs(1))).await;
        clock.advance(Duration::from_secs(2));

        assert_eq!(cache.get_allow_stale("k").await, Some("v".to_string()));
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.get_allow_stale("k").await, Some("v".to_string()));
        assert_eq!(cache.stats().stale_hits, 2);
    }

    #[tokio::test]
    async fn test_peek_keeps_expired_entry() {
        let clock = Arc::new(ManualClock::starting_now());
        let cache: CacheStore<String> =
            CacheStore::new(CacheConfig::default(), clock.clone(), EventBus::default());

        cache.set("k", "v".into(), Some(Duration::from_secs(1))).await;
        assert_eq!(cache.peek("k"), Some("v".to_string()));
        clock.advance(Duration::from_secs(2));

        assert_eq!(cache.peek("k"), None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_allow_stale("k").await, Some("v".to_string()));
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_stale_read_bounded_by_max_age() {
        let clock = Arc::new(ManualClock::starting_now());
        let (cache, _) = store(clock.clone());

        cache.set("k", "v".into(), Some(Duration::from_secs(1))).await;
        clock.advance(Duration::from_secs(24 * 60 * 60));
        assert_eq!(cache.get_allow_stale("k").await, None);
    }

    #[tokio::test]
    async fn test_stale_read_does_not_refresh() {
        let clock = Arc::new(ManualClock::starting_now());
        let (cache, _) = store(clock.clone());

        cache.set("k", "v".into(), Some(Duration::from_secs(1))).await;
        clock.advance(Duration::from_secs(5));
        let _ = cache.get_allow_stale("k").await;

        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.expired, 1);
    }

    #[tokio::test]
    async fn test_cleanup_counts_both_tiers() {
        let clock = Arc::new(ManualClock::starting_now());
        let (cache, tier) = store(clock.clone());
        let mut events = cache.events.subscribe();

        cache.set("a", "1".into(), Some(Duration::from_secs(1))).await;
        cache.set("b", "2".into(), Some(Duration::from_secs(1))).await;
        cache.set("c", "3".into(), Some(Duration::from_secs(60))).await;
        clock.advance(Duration::from_secs(2));
        // evicted from the volatile tier only
        assert_eq!(cache.get("a"), None);

        assert_eq!(cache.cleanup().await, 2);
        assert_eq!(tier.len(), 1);
        assert!(matches!(
            events.recv().await.unwrap(),
            EngineEvent::CacheEvicted { count: 2 }
        ));
        assert_eq!(cache.cleanup().await, 0);
    }

    #[tokio::test]
    async fn test_durable_outage_is_non_fatal() {
        let clock = Arc::new(ManualClock::starting_now());
        let (cache, tier) = store(clock.clone());

        tier.set_available(false);
        cache.set("k", "v".into(), None).await;
        assert_eq!(cache.get("k"), Some("v".to_string()));

        let stats = cache.stats();
        assert!(!stats.durable_available);
        assert_eq!(stats.durable_failures, 1);

        tier.set_available(true);
        cache.set("k2", "v2".into(), None).await;
        assert!(cache.durable_available());
    }

    #[tokio::test]
    async fn test_restore_discards_old_and_corrupt() {
        let clock = Arc::new(ManualClock::starting_now());
        let (cache, tier) = store(clock.clone());

        cache.set("recent", "r".into(), Some(Duration::from_secs(1))).await;
        clock.advance(Duration::from_secs(60));
        cache.set("fresh", "f".into(), None).await;
        tier.insert_raw(durable_key("broken"), "{not json");

        let ancient = CacheEntry::new(
            "old".to_string(),
            clock.now() - chrono::Duration::hours(25),
            Duration::from_secs(60 * 60 * 48),
        );
        tier.insert_raw(
            durable_key("ancient"),
            serde_json::to_string(&ancient).unwrap(),
        );

        let restarted =
            CacheStore::<String>::new(CacheConfig::default(), clock.clone(), EventBus::default())
                .with_durable(tier.clone());
        assert_eq!(restarted.restore().await, 2);

        assert_eq!(restarted.get("fresh"), Some("f".to_string()));
        assert_eq!(restarted.get("recent"), None);
        assert_eq!(restarted.get_allow_stale("recent").await, Some("r".to_string()));
        assert!(tier.raw(&durable_key("broken")).is_none());
        assert!(tier.raw(&durable_key("ancient")).is_none());
    }

    #[test]
    fn test_undecodable_record_is_corrupt() {
        let err = decode_record::<String>("broken", "{not json").unwrap_err();
        assert_eq!(err.code(), bulwark_error::ErrorCode::CorruptRecord);
        assert!(err.to_string().contains("broken"));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_clear_and_delete() {
        let clock = Arc::new(ManualClock::starting_now());
        let (cache, tier) = store(clock);
        tier.insert_raw("foreign", "kept");

        cache.set("a", "1".into(), None).await;
        cache.set("b", "2".into(), None).await;
        cache.delete("a").await;
        assert_eq!(cache.get("a"), None);
        assert_eq!(tier.len(), 2);

        cache.clear().await;
        assert!(cache.is_empty());
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_entry_wire_format() {
        let stored_at = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let entry = CacheEntry::new(42u32, stored_at, Duration::from_millis(1500));
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["value"], 42);
        assert_eq!(json["ttlMs"], 1500);
        assert!(json["storedAt"].is_string());
    }
}
