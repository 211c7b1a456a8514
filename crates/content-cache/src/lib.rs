//! Tiered content cache for browser-fetched payloads.
//!
//! Three independent LRU tiers: `dom` and `api` at the configured capacity,
//! `screenshot` at half of it (screenshots are large and rarely reused).
//! TTL is enforced on read; an entry whose age has reached the TTL is evicted
//! and counted as a miss. Payloads above the compression threshold are stored
//! deflated.

use std::num::NonZeroUsize;

use chrono::{DateTime, Duration, Utc};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to compress payload: {0}")]
    Compress(std::io::Error),
    #[error("failed to decompress payload: {0}")]
    Decompress(std::io::Error),
    #[error("cached payload is not valid utf-8")]
    Encoding,
}

/// Cache tier a payload belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentTier {
    Dom,
    Screenshot,
    Api,
}

/// Cache behavior knobs, taken from the session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CachePolicy {
    pub enabled: bool,
    pub max_size: usize,
    pub ttl_ms: u64,
    pub compression_enabled: bool,
    pub compression_threshold: usize,
    pub warming_enabled: bool,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 50,
            ttl_ms: 300_000,
            compression_enabled: true,
            compression_threshold: 10_240,
            warming_enabled: false,
        }
    }
}

/// Aggregate statistics, refreshed after every cache operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total_size: usize,
    pub hit_rate: f64,
}

#[derive(Debug)]
struct CacheEntry {
    payload: Vec<u8>,
    compressed: bool,
    stored_at: DateTime<Utc>,
    hits: u64,
    byte_size: usize,
}

/// Three-tier LRU+TTL cache owned by one session.
pub struct ContentCache {
    policy: CachePolicy,
    dom: LruCache<String, CacheEntry>,
    screenshot: LruCache<String, CacheEntry>,
    api: LruCache<String, CacheEntry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl ContentCache {
    pub fn new(policy: CachePolicy) -> Self {
        let full = NonZeroUsize::new(policy.max_size.max(1)).expect("capacity is at least one");
        let half =
            NonZeroUsize::new((policy.max_size / 2).max(1)).expect("capacity is at least one");
        Self {
            dom: LruCache::new(full),
            screenshot: LruCache::new(half),
            api: LruCache::new(full),
            policy,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Store a payload, compressing it when it crosses the threshold.
    pub fn insert(&mut self, tier: ContentTier, key: &str, payload: &str) -> Result<(), CacheError> {
        if !self.policy.enabled {
            return Ok(());
        }
        let compress_this = self.policy.compression_enabled
            && payload.len() > self.policy.compression_threshold;
        let bytes = if compress_this {
            compress(payload.as_bytes())?
        } else {
            payload.as_bytes().to_vec()
        };
        let entry = CacheEntry {
            byte_size: bytes.len(),
            payload: bytes,
            compressed: compress_this,
            stored_at: Utc::now(),
            hits: 0,
        };
        let cache = self.tier_mut(tier);
        let evicts = cache.len() == cache.cap().get() && !cache.contains(key);
        cache.put(key.to_string(), entry);
        if evicts {
            self.evictions += 1;
        }
        Ok(())
    }

    /// Fetch a payload. An entry whose age has reached the TTL is dropped and
    /// counted as a miss.
    pub fn get(&mut self, tier: ContentTier, key: &str) -> Result<Option<String>, CacheError> {
        self.get_at(tier, key, Utc::now())
    }

    fn get_at(
        &mut self,
        tier: ContentTier,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<String>, CacheError> {
        if !self.policy.enabled {
            return Ok(None);
        }
        let ttl = Duration::milliseconds(self.policy.ttl_ms as i64);

        enum Lookup {
            Fresh { payload: Vec<u8>, compressed: bool },
            Expired,
            Absent,
        }

        let lookup = match self.tier_mut(tier).get_mut(key) {
            Some(entry) if now - entry.stored_at < ttl => {
                entry.hits += 1;
                Lookup::Fresh {
                    payload: entry.payload.clone(),
                    compressed: entry.compressed,
                }
            }
            Some(_) => Lookup::Expired,
            None => Lookup::Absent,
        };

        match lookup {
            Lookup::Fresh {
                payload,
                compressed,
            } => {
                self.hits += 1;
                let raw = if compressed {
                    decompress(&payload)?
                } else {
                    payload
                };
                let text = String::from_utf8(raw).map_err(|_| CacheError::Encoding)?;
                Ok(Some(text))
            }
            Lookup::Expired => {
                self.tier_mut(tier).pop(key);
                self.evictions += 1;
                self.misses += 1;
                Ok(None)
            }
            Lookup::Absent => {
                self.misses += 1;
                Ok(None)
            }
        }
    }

    /// Apply the navigation invalidation rule for a URL change.
    ///
    /// Same hostname keeps `api` and `screenshot`; a cross-host move (or an
    /// unparseable URL) clears everything. The first navigation of a session
    /// clears `dom` only.
    pub fn invalidate_for_navigation(&mut self, old_url: Option<&str>, new_url: &str) {
        let same_host = match old_url {
            None => true,
            Some(old) => hosts_match(old, new_url),
        };
        if same_host {
            self.clear_tier(ContentTier::Dom);
        } else {
            self.clear_tier(ContentTier::Dom);
            self.clear_tier(ContentTier::Screenshot);
            self.clear_tier(ContentTier::Api);
        }
    }

    pub fn clear_tier(&mut self, tier: ContentTier) {
        let cleared = self.tier_mut(tier).len() as u64;
        self.evictions += cleared;
        self.tier_mut(tier).clear();
    }

    pub fn len(&self, tier: ContentTier) -> usize {
        match tier {
            ContentTier::Dom => self.dom.len(),
            ContentTier::Screenshot => self.screenshot.len(),
            ContentTier::Api => self.api.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.dom.is_empty() && self.screenshot.is_empty() && self.api.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let total_size = self
            .dom
            .iter()
            .chain(self.screenshot.iter())
            .chain(self.api.iter())
            .map(|(_, entry)| entry.byte_size)
            .sum();
        let lookups = self.hits + self.misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        };
        CacheStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            total_size,
            hit_rate,
        }
    }

    fn tier_mut(&mut self, tier: ContentTier) -> &mut LruCache<String, CacheEntry> {
        match tier {
            ContentTier::Dom => &mut self.dom,
            ContentTier::Screenshot => &mut self.screenshot,
            ContentTier::Api => &mut self.api,
        }
    }
}

fn hosts_match(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(left), Ok(right)) => match (left.host_str(), right.host_str()) {
            (Some(lh), Some(rh)) => lh.eq_ignore_ascii_case(rh),
            _ => false,
        },
        _ => false,
    }
}

/// Deflate-compress a payload.
pub fn compress(raw: &[u8]) -> Result<Vec<u8>, CacheError> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(raw).map_err(CacheError::Compress)?;
    encoder.finish().map_err(CacheError::Compress)
}

/// Inverse of [`compress`].
pub fn decompress(compressed: &[u8]) -> Result<Vec<u8>, CacheError> {
    let mut decoder = DeflateDecoder::new(compressed);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(CacheError::Decompress)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_size: usize, ttl_ms: u64) -> CachePolicy {
        CachePolicy {
            enabled: true,
            max_size,
            ttl_ms,
            compression_enabled: true,
            compression_threshold: 64,
            warming_enabled: false,
        }
    }

    #[test]
    fn insert_then_get_hits() {
        let mut cache = ContentCache::new(policy(4, 60_000));
        cache
            .insert(ContentTier::Dom, "https://a.com/page", "<html>hi</html>")
            .unwrap();
        let value = cache.get(ContentTier::Dom, "https://a.com/page").unwrap();
        assert_eq!(value.as_deref(), Some("<html>hi</html>"));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert!((stats.hit_rate - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn missing_key_counts_as_miss() {
        let mut cache = ContentCache::new(policy(4, 60_000));
        assert!(cache.get(ContentTier::Api, "nothing").unwrap().is_none());
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hit_rate, 0.0);
    }

    #[test]
    fn large_payload_round_trips_through_compression() {
        let mut cache = ContentCache::new(policy(4, 60_000));
        let big = "lorem ipsum dolor sit amet ".repeat(64);
        cache.insert(ContentTier::Dom, "key", &big).unwrap();
        assert_eq!(cache.get(ContentTier::Dom, "key").unwrap().as_deref(), Some(big.as_str()));
        // Stored size is the deflated size, well under the raw length.
        assert!(cache.stats().total_size < big.len());
    }

    #[test]
    fn compression_is_reversible() {
        for payload in ["", "a", "abcabcabcabc", "\u{1F980} unicode \n\n mixed"] {
            let packed = compress(payload.as_bytes()).unwrap();
            assert_eq!(decompress(&packed).unwrap(), payload.as_bytes());
        }
    }

    #[test]
    fn entry_at_exactly_ttl_is_expired() {
        let mut cache = ContentCache::new(policy(4, 1_000));
        cache.insert(ContentTier::Dom, "key", "value").unwrap();
        let stored_at = cache.dom.peek("key").unwrap().stored_at;

        let just_before = stored_at + Duration::milliseconds(999);
        assert!(cache
            .get_at(ContentTier::Dom, "key", just_before)
            .unwrap()
            .is_some());

        let exactly = stored_at + Duration::milliseconds(1_000);
        assert!(cache.get_at(ContentTier::Dom, "key", exactly).unwrap().is_none());
        assert_eq!(cache.len(ContentTier::Dom), 0);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn lru_eviction_counts() {
        let mut cache = ContentCache::new(policy(2, 60_000));
        cache.insert(ContentTier::Api, "a", "1").unwrap();
        cache.insert(ContentTier::Api, "b", "2").unwrap();
        cache.insert(ContentTier::Api, "c", "3").unwrap();
        assert_eq!(cache.len(ContentTier::Api), 2);
        assert_eq!(cache.stats().evictions, 1);
        assert!(cache.get(ContentTier::Api, "a").unwrap().is_none());
    }

    #[test]
    fn screenshot_tier_is_half_capacity() {
        let cache = ContentCache::new(policy(8, 60_000));
        assert_eq!(cache.dom.cap().get(), 8);
        assert_eq!(cache.screenshot.cap().get(), 4);
        assert_eq!(cache.api.cap().get(), 8);
    }

    #[test]
    fn cross_host_navigation_clears_all_tiers() {
        let mut cache = ContentCache::new(policy(4, 60_000));
        cache
            .insert(ContentTier::Dom, "https://a.com/page1", "dom")
            .unwrap();
        cache
            .insert(ContentTier::Api, "https://a.com/feed", "api")
            .unwrap();
        cache
            .insert(ContentTier::Screenshot, "https://a.com/page1", "shot")
            .unwrap();
        cache.invalidate_for_navigation(Some("https://a.com/page1"), "https://b.com/home");
        assert_eq!(cache.len(ContentTier::Dom), 0);
        assert_eq!(cache.len(ContentTier::Screenshot), 0);
        assert_eq!(cache.len(ContentTier::Api), 0);
    }

    #[test]
    fn same_host_navigation_clears_dom_only() {
        let mut cache = ContentCache::new(policy(4, 60_000));
        cache
            .insert(ContentTier::Dom, "https://b.com/home", "dom")
            .unwrap();
        cache
            .insert(ContentTier::Api, "https://b.com/feed", "api")
            .unwrap();
        cache.invalidate_for_navigation(Some("https://b.com/home"), "https://b.com/page2");
        assert_eq!(cache.len(ContentTier::Dom), 0);
        assert_eq!(cache.len(ContentTier::Api), 1);
    }

    #[test]
    fn first_navigation_clears_dom_only() {
        let mut cache = ContentCache::new(policy(4, 60_000));
        cache.insert(ContentTier::Dom, "seed", "dom").unwrap();
        cache.insert(ContentTier::Api, "seed", "api").unwrap();
        cache.invalidate_for_navigation(None, "https://a.com/");
        assert_eq!(cache.len(ContentTier::Dom), 0);
        assert_eq!(cache.len(ContentTier::Api), 1);
    }

    #[test]
    fn disabled_cache_stores_nothing() {
        let mut cache = ContentCache::new(CachePolicy {
            enabled: false,
            ..CachePolicy::default()
        });
        cache.insert(ContentTier::Dom, "key", "value").unwrap();
        assert!(cache.get(ContentTier::Dom, "key").unwrap().is_none());
        assert_eq!(cache.stats().misses, 0);
    }
}
