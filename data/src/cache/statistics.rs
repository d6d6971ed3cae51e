//! Cache usage counters.

use async_std::sync::{Arc, RwLock};
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// A snapshot of the counters of one cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheStatistics {
    pub cache_name: String,
    pub puts: u64,
    pub gets: u64,
    pub hits: u64,
    pub misses: u64,
    pub deletes: u64,
    /// Gets which have neither hit nor missed yet.
    pub pending: u64,
    /// When this snapshot was taken.
    pub time: DateTime<Utc>,
    /// When counting started for this cache.
    pub since: DateTime<Utc>,
    /// When the counters were last reset.
    pub last_reset: DateTime<Utc>,
}

#[derive(Clone, Debug)]
struct Counters {
    puts: u64,
    gets: u64,
    hits: u64,
    misses: u64,
    deletes: u64,
    since: DateTime<Utc>,
    last_reset: DateTime<Utc>,
}

impl Counters {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            puts: 0,
            gets: 0,
            hits: 0,
            misses: 0,
            deletes: 0,
            since: now,
            last_reset: now,
        }
    }

    fn reset(&mut self) {
        *self = Self {
            since: self.since,
            ..Self::new()
        };
    }

    fn snapshot(&self, cache_name: &str) -> CacheStatistics {
        CacheStatistics {
            cache_name: cache_name.into(),
            puts: self.puts,
            gets: self.gets,
            hits: self.hits,
            misses: self.misses,
            deletes: self.deletes,
            pending: self.gets.saturating_sub(self.hits + self.misses),
            time: Utc::now(),
            since: self.since,
            last_reset: self.last_reset,
        }
    }
}

/// Collects [`CacheStatistics`] for any number of caches.
///
/// A collector created with [`none`](Self::none) counts nothing and always reports zeros. Clones
/// of a collector created with [`create`](Self::create) share their counters.
#[derive(Clone, Debug, Default)]
pub struct StatisticsCollector(Option<Arc<RwLock<HashMap<String, Counters>>>>);

impl StatisticsCollector {
    /// A collector which does not count.
    pub fn none() -> Self {
        Self(None)
    }

    /// A collector which counts.
    pub fn create() -> Self {
        Self(Some(Default::default()))
    }

    pub fn is_enabled(&self) -> bool {
        self.0.is_some()
    }

    async fn record(&self, cache_name: &str, f: impl FnOnce(&mut Counters)) {
        if let Some(stats) = &self.0 {
            let mut stats = stats.write().await;
            f(stats
                .entry(cache_name.to_string())
                .or_insert_with(Counters::new));
        }
    }

    pub async fn inc_puts(&self, cache_name: &str) {
        self.record(cache_name, |c| c.puts += 1).await
    }

    pub async fn inc_gets(&self, cache_name: &str) {
        self.record(cache_name, |c| c.gets += 1).await
    }

    pub async fn inc_hits(&self, cache_name: &str) {
        self.record(cache_name, |c| c.hits += 1).await
    }

    pub async fn inc_misses(&self, cache_name: &str) {
        self.record(cache_name, |c| c.misses += 1).await
    }

    pub async fn inc_deletes_by(&self, cache_name: &str, n: u64) {
        self.record(cache_name, |c| c.deletes += n).await
    }

    /// Zero the counters of `cache_name`.
    pub async fn reset(&self, cache_name: &str) {
        self.record(cache_name, Counters::reset).await
    }

    /// The current counters of `cache_name`.
    pub async fn statistics(&self, cache_name: &str) -> CacheStatistics {
        let counters = match &self.0 {
            Some(stats) => stats.read().await.get(cache_name).cloned(),
            None => None,
        };
        counters
            .unwrap_or_else(Counters::new)
            .snapshot(cache_name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[async_std::test]
    async fn test_counters() {
        let stats = StatisticsCollector::create();
        stats.inc_gets("books").await;
        stats.inc_gets("books").await;
        stats.inc_gets("books").await;
        stats.inc_hits("books").await;
        stats.inc_misses("books").await;
        stats.inc_puts("books").await;
        stats.inc_deletes_by("books", 2).await;
        stats.inc_puts("authors").await;

        let snapshot = stats.statistics("books").await;
        assert_eq!(snapshot.cache_name, "books");
        assert_eq!(
            (
                snapshot.gets,
                snapshot.hits,
                snapshot.misses,
                snapshot.pending,
                snapshot.puts,
                snapshot.deletes
            ),
            (3, 1, 1, 1, 1, 2)
        );
        assert_eq!(stats.statistics("authors").await.puts, 1);

        stats.reset("books").await;
        let reset = stats.statistics("books").await;
        assert_eq!((reset.gets, reset.puts, reset.deletes), (0, 0, 0));
        assert_eq!(reset.since, snapshot.since);
        assert!(reset.last_reset >= snapshot.last_reset);
    }

    #[async_std::test]
    async fn test_disabled() {
        let stats = StatisticsCollector::none();
        assert!(!stats.is_enabled());
        stats.inc_puts("books").await;
        assert_eq!(stats.statistics("books").await.puts, 0);
    }
}
