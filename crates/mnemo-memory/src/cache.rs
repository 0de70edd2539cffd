//! Short-term (working) memory cache.
//!
//! A small, bounded, in-process store of recently attended items.  When full,
//! inserting a new key evicts the item with the lowest retention score:
//!
//! ```text
//! score = importance − age_hours
//! ```
//!
//! so unimportant items go first and, among equally important ones, the
//! oldest.  Exact ties are broken by insertion order (earliest evicted).
//!
//! # Example
//!
//! ```rust
//! use mnemo_memory::cache::ShortTermCache;
//! use serde_json::json;
//!
//! let mut cache = ShortTermCache::new(2);
//! cache.store("k1", json!("first"), 0.5);
//! cache.store("k2", json!("second"), 0.7);
//! cache.store("k3", json!("third"), 0.9);
//!
//! assert!(cache.retrieve("k1").is_none());
//! assert_eq!(cache.retrieve("k3"), Some(json!("third")));
//! ```

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use mnemo_types::clamp_unit;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// CacheItem
// ─────────────────────────────────────────────────────────────────────────────

/// One item held by the [`ShortTermCache`].
#[derive(Debug, Clone)]
pub struct CacheItem {
    pub content: Value,
    pub created_at: DateTime<Utc>,
    /// In `[0.0, 1.0]`.
    pub importance: f64,
    pub access_count: u64,
    pub last_access_at: DateTime<Utc>,
    seq: u64,
}

impl CacheItem {
    fn touch(&mut self) {
        self.access_count += 1;
        self.last_access_at = Utc::now();
    }

    fn age_seconds(&self, now: DateTime<Utc>) -> f64 {
        (now - self.created_at).num_milliseconds().max(0) as f64 / 1000.0
    }

    fn retention_score(&self, now: DateTime<Utc>) -> f64 {
        self.importance - self.age_seconds(now) / 3600.0
    }
}

/// A ranked search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheHit {
    pub key: String,
    pub content: Value,
    pub relevance: f64,
    pub importance: f64,
    pub age_seconds: f64,
}

/// One entry of [`ShortTermCache::snapshot`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntryView {
    pub key: String,
    pub content: Value,
    pub importance: f64,
    pub age_seconds: f64,
}

/// Aggregate figures for observability.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub utilization: f64,
    pub avg_importance: f64,
    pub avg_age_seconds: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// ShortTermCache
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded working-memory store keyed by string.
///
/// Not internally synchronised; the coordinator owns it behind a mutex.
#[derive(Debug)]
pub struct ShortTermCache {
    capacity: usize,
    /// Keys in insertion order (oldest first).
    order: VecDeque<String>,
    items: HashMap<String, CacheItem>,
    next_seq: u64,
}

impl ShortTermCache {
    /// Create an empty cache.  A `capacity` of zero is treated as one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            items: HashMap::with_capacity(capacity),
            next_seq: 0,
        }
    }

    /// Insert or update `key`.
    ///
    /// Updating an existing key replaces its content and importance, counts
    /// as an access, and never evicts.  Inserting a new key into a full cache
    /// evicts exactly one item first.
    pub fn store(&mut self, key: impl Into<String>, content: Value, importance: f64) {
        let key = key.into();
        let importance = clamp_unit(importance);

        if let Some(item) = self.items.get_mut(&key) {
            item.content = content;
            item.importance = importance;
            item.touch();
            return;
        }

        if self.items.len() >= self.capacity {
            self.evict_one();
        }

        let now = Utc::now();
        let item = CacheItem {
            content,
            created_at: now,
            importance,
            access_count: 0,
            last_access_at: now,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.order.push_back(key.clone());
        self.items.insert(key, item);
    }

    /// Return a copy of the content stored under `key`, counting the access.
    pub fn retrieve(&mut self, key: &str) -> Option<Value> {
        let item = self.items.get_mut(key)?;
        item.touch();
        Some(item.content.clone())
    }

    /// Rank items against `query` (case-insensitive).
    ///
    /// Relevance is `1.0` for an exact key match, `0.8` when the query is a
    /// substring of the key, otherwise `0.2` per occurrence in the content
    /// text capped at `0.7`.  Zero-relevance items are excluded; ties keep
    /// insertion order.
    pub fn search(&self, query: &str, limit: usize) -> Vec<CacheHit> {
        let query = query.to_lowercase();
        if query.is_empty() {
            return Vec::new();
        }
        let now = Utc::now();

        let mut hits: Vec<CacheHit> = self
            .order
            .iter()
            .filter_map(|key| {
                let item = self.items.get(key)?;
                let relevance = relevance(&query, key, &item.content);
                (relevance > 0.0).then(|| CacheHit {
                    key: key.clone(),
                    content: item.content.clone(),
                    relevance,
                    importance: item.importance,
                    age_seconds: item.age_seconds(now),
                })
            })
            .collect();

        // Stable sort keeps insertion order among equal relevance.
        hits.sort_by(|a, b| b.relevance.total_cmp(&a.relevance));
        hits.truncate(limit);
        hits
    }

    /// All items in insertion order, oldest first.
    pub fn snapshot(&self) -> Vec<CacheEntryView> {
        let now = Utc::now();
        self.order
            .iter()
            .filter_map(|key| {
                let item = self.items.get(key)?;
                Some(CacheEntryView {
                    key: key.clone(),
                    content: item.content.clone(),
                    importance: item.importance,
                    age_seconds: item.age_seconds(now),
                })
            })
            .collect()
    }

    /// Borrow the raw item for `key` without counting an access.
    pub fn peek(&self, key: &str) -> Option<&CacheItem> {
        self.items.get(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every item.
    pub fn clear(&mut self) {
        self.order.clear();
        self.items.clear();
    }

    pub fn stats(&self) -> CacheStats {
        if self.items.is_empty() {
            return CacheStats {
                capacity: self.capacity,
                ..Default::default()
            };
        }
        let now = Utc::now();
        let n = self.items.len() as f64;
        CacheStats {
            size: self.items.len(),
            capacity: self.capacity,
            utilization: n / self.capacity as f64,
            avg_importance: self.items.values().map(|i| i.importance).sum::<f64>() / n,
            avg_age_seconds: self.items.values().map(|i| i.age_seconds(now)).sum::<f64>() / n,
        }
    }

    fn evict_one(&mut self) {
        let now = Utc::now();
        let victim = self
            .items
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.retention_score(now)
                    .total_cmp(&b.retention_score(now))
                    .then(a.seq.cmp(&b.seq))
            })
            .map(|(key, _)| key.clone());

        if let Some(key) = victim {
            self.items.remove(&key);
            self.order.retain(|k| k != &key);
            debug!(key = %key, "evicted working-memory item");
        }
    }
}

fn relevance(query_lower: &str, key: &str, content: &Value) -> f64 {
    let key_lower = key.to_lowercase();
    if key_lower == query_lower {
        return 1.0;
    }
    if key_lower.contains(query_lower) {
        return 0.8;
    }
    let text = stringify(content).to_lowercase();
    let occurrences = text.matches(query_lower).count();
    (occurrences as f64 * 0.2).min(0.7)
}

/// Text used for content matching: strings as-is, anything else as compact
/// JSON.
fn stringify(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── store / retrieve ─────────────────────────────────────────────────────

    #[test]
    fn eviction_drops_least_important() {
        let mut cache = ShortTermCache::new(2);
        cache.store("k1", json!("c1"), 0.5);
        cache.store("k2", json!("c2"), 0.7);
        cache.store("k3", json!("c3"), 0.9);

        assert_eq!(cache.retrieve("k1"), None);
        assert_eq!(cache.retrieve("k2"), Some(json!("c2")));
        assert_eq!(cache.retrieve("k3"), Some(json!("c3")));
    }

    #[test]
    fn equal_importance_evicts_oldest_insertion() {
        let mut cache = ShortTermCache::new(3);
        cache.store("a", json!(1), 0.5);
        cache.store("b", json!(2), 0.5);
        cache.store("c", json!(3), 0.5);
        cache.store("d", json!(4), 0.5);

        let keys: Vec<_> = cache.snapshot().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["b", "c", "d"]);
    }

    #[test]
    fn upsert_replaces_without_eviction() {
        let mut cache = ShortTermCache::new(2);
        cache.store("a", json!("old"), 0.1);
        cache.store("b", json!("b"), 0.9);
        cache.store("a", json!("new"), 0.95);

        assert_eq!(cache.len(), 2);
        let item = cache.peek("a").unwrap();
        assert_eq!(item.content, json!("new"));
        assert!((item.importance - 0.95).abs() < 1e-12);
        assert_eq!(item.access_count, 1);
        // Position is kept: "a" is still the oldest entry.
        assert_eq!(cache.snapshot()[0].key, "a");
    }

    #[test]
    fn capacity_never_exceeded() {
        let mut cache = ShortTermCache::new(4);
        for i in 0..50 {
            cache.store(format!("k{i}"), json!(i), (i % 10) as f64 / 10.0);
            assert!(cache.len() <= cache.capacity());
        }
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn retrieve_bumps_access_stats() {
        let mut cache = ShortTermCache::new(3);
        cache.store("a", json!("x"), 0.5);
        cache.retrieve("a");
        cache.retrieve("a");
        assert_eq!(cache.peek("a").unwrap().access_count, 2);
        assert!(cache.retrieve("missing").is_none());
    }

    #[test]
    fn importance_is_clamped() {
        let mut cache = ShortTermCache::new(3);
        cache.store("hi", json!(null), 7.0);
        cache.store("lo", json!(null), -1.0);
        assert_eq!(cache.peek("hi").unwrap().importance, 1.0);
        assert_eq!(cache.peek("lo").unwrap().importance, 0.0);
    }

    // ── search ───────────────────────────────────────────────────────────────

    #[test]
    fn search_scores_key_and_content_matches() {
        let mut cache = ShortTermCache::new(5);
        cache.store("weather", json!("sunny"), 0.5);
        cache.store("weather_report", json!("cloudy"), 0.5);
        cache.store("note", json!("Weather is nice, weather is warm"), 0.5);
        cache.store("other", json!("nothing here"), 0.5);

        let hits = cache.search("Weather", 10);
        let scored: Vec<_> = hits.iter().map(|h| (h.key.as_str(), h.relevance)).collect();
        assert_eq!(scored.len(), 3);
        assert_eq!(scored[0], ("weather", 1.0));
        assert_eq!(scored[1], ("weather_report", 0.8));
        assert_eq!(scored[2].0, "note");
        assert!((scored[2].1 - 0.4).abs() < 1e-12);
    }

    #[test]
    fn search_content_relevance_capped() {
        let mut cache = ShortTermCache::new(2);
        cache.store("spam", json!("ha ha ha ha ha ha ha ha"), 0.5);
        let hits = cache.search("ha", 5);
        assert!((hits[0].relevance - 0.7).abs() < 1e-12);
    }

    #[test]
    fn search_ties_keep_insertion_order_and_limit() {
        let mut cache = ShortTermCache::new(5);
        cache.store("x1", json!("apple"), 0.1);
        cache.store("x2", json!("apple"), 0.9);
        cache.store("x3", json!("apple"), 0.5);
        let hits = cache.search("apple", 2);
        let keys: Vec<_> = hits.iter().map(|h| h.key.as_str()).collect();
        assert_eq!(keys, vec!["x1", "x2"]);
    }

    #[test]
    fn search_matches_inside_structured_content() {
        let mut cache = ShortTermCache::new(2);
        cache.store("concept:dog", json!({"name": "dog", "category": "entity"}), 0.8);
        let hits = cache.search("entity", 3);
        assert_eq!(hits.len(), 1);
        assert!((hits[0].relevance - 0.2).abs() < 1e-12);
    }

    // ── snapshot / stats ─────────────────────────────────────────────────────

    #[test]
    fn snapshot_in_insertion_order() {
        let mut cache = ShortTermCache::new(3);
        cache.store("first", json!(1), 0.2);
        cache.store("second", json!(2), 0.9);
        let snap = cache.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].key, "first");
        assert_eq!(snap[1].key, "second");
        assert!(snap[0].age_seconds >= 0.0);
    }

    #[test]
    fn stats_and_clear() {
        let mut cache = ShortTermCache::new(4);
        assert_eq!(cache.stats().size, 0);
        cache.store("a", json!(1), 0.2);
        cache.store("b", json!(2), 0.6);
        let stats = cache.stats();
        assert_eq!(stats.size, 2);
        assert!((stats.utilization - 0.5).abs() < 1e-12);
        assert!((stats.avg_importance - 0.4).abs() < 1e-12);

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.snapshot().is_empty());
    }
}
