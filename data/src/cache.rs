//! A cache stored in Tarantool spaces.
//!
//! Each named [`Cache`] keeps its entries in a space of its own, managed by a [`CacheWriter`]. Keys
//! and values are arbitrary serde types, serialized as MessagePack. Entries may expire after a
//! configured time to live; expired entries are removed lazily, when they are next read.
//!
//! Caches are usually obtained from a [`CacheManager`], which creates them on demand:
//!
//! ```
//! # use tarantool_data::cache::{CacheConfiguration, CacheManager};
//! # use tarantool_data::client::Client;
//! # use std::time::Duration;
//! # async fn example(client: impl Client) -> tarantool_data::error::Result<()> {
//! let manager = CacheManager::builder_for(client)
//!     .cache_defaults(CacheConfiguration::default().entry_ttl(Duration::from_secs(60)))
//!     .enable_statistics()
//!     .build();
//! let cache = manager.cache("sessions").await?.unwrap();
//! cache.put(&"alice", &42u32).await?;
//! assert_eq!(cache.get::<_, u32>(&"alice").await?, Some(42));
//! # Ok(())
//! # }
//! ```

use crate::client::Client;
use crate::error::{Error, Result};
use async_std::sync::{Arc, RwLock};
use derivative::Derivative;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;

pub mod statistics;
pub mod writer;

pub use statistics::{CacheStatistics, StatisticsCollector};
pub use writer::{CacheWriter, DefaultCacheWriter};

/// MessagePack encoding of `nil`.
const NIL: &[u8] = &[0xc0];

/// Settings of a [`Cache`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheConfiguration {
    /// Time to live of entries. Zero means entries never expire.
    pub ttl: Duration,
    /// Whether `nil` values may be stored.
    pub cache_null_values: bool,
    /// Prefix of the names of cache spaces.
    pub prefix: Option<String>,
}

impl Default for CacheConfiguration {
    fn default() -> Self {
        Self {
            ttl: Duration::ZERO,
            cache_null_values: true,
            prefix: None,
        }
    }
}

impl CacheConfiguration {
    pub fn entry_ttl(self, ttl: Duration) -> Self {
        Self { ttl, ..self }
    }

    pub fn disable_caching_null_values(self) -> Self {
        Self {
            cache_null_values: false,
            ..self
        }
    }

    pub fn prefix_cache_name_with(self, prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..self
        }
    }

    /// The name of the space storing the cache `name`.
    ///
    /// Characters which are not valid in a space name are replaced by `_`.
    pub fn space_name(&self, name: &str) -> String {
        let name = format!("{}{name}", self.prefix.as_deref().unwrap_or_default());
        name.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect()
    }
}

fn serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    rmp_serde::to_vec_named(value).map_err(Error::cache)
}

fn deserialize<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    rmp_serde::from_slice(bytes).map_err(Error::cache)
}

/// A named cache.
#[derive(Derivative)]
#[derivative(Clone(bound = ""), Debug(bound = "W: std::fmt::Debug"))]
pub struct Cache<W> {
    name: String,
    space: String,
    config: CacheConfiguration,
    writer: Arc<W>,
}

impl<W: CacheWriter> Cache<W> {
    pub fn new(name: impl Into<String>, config: CacheConfiguration, writer: Arc<W>) -> Self {
        let name = name.into();
        Self {
            space: config.space_name(&name),
            name,
            config,
            writer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The name of the space storing this cache.
    pub fn space(&self) -> &str {
        &self.space
    }

    pub fn configuration(&self) -> &CacheConfiguration {
        &self.config
    }

    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// The value cached under `key`.
    pub async fn get<K, V>(&self, key: &K) -> Result<Option<V>>
    where
        K: Serialize + ?Sized,
        V: DeserializeOwned,
    {
        let key = serialize(key)?;
        match self.writer.get(&self.space, &key).await? {
            Some(bytes) => Ok(Some(deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The value cached under `key`, or the value returned by `load`, which is then cached.
    pub async fn get_or_insert_with<K, V, F, Fut>(&self, key: &K, load: F) -> Result<V>
    where
        K: Serialize + ?Sized,
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }
        let value = load().await?;
        self.put(key, &value).await?;
        Ok(value)
    }

    /// Cache `value` under `key`.
    pub async fn put<K, V>(&self, key: &K, value: &V) -> Result<()>
    where
        K: Serialize + ?Sized,
        V: Serialize + ?Sized,
    {
        let value = self.serialize_value(value)?;
        self.writer
            .put(&self.space, &serialize(key)?, &value, self.config.ttl)
            .await
    }

    /// Cache `value` under `key` unless a value is already cached, in which case that value is
    /// returned.
    pub async fn put_if_absent<K, V>(&self, key: &K, value: &V) -> Result<Option<V>>
    where
        K: Serialize + ?Sized,
        V: Serialize + DeserializeOwned,
    {
        let bytes = self.serialize_value(value)?;
        match self
            .writer
            .put_if_absent(&self.space, &serialize(key)?, &bytes, self.config.ttl)
            .await?
        {
            Some(existing) => Ok(Some(deserialize(&existing)?)),
            None => Ok(None),
        }
    }

    /// Remove the value cached under `key`.
    pub async fn evict<K: Serialize + ?Sized>(&self, key: &K) -> Result<()> {
        self.writer.remove(&self.space, &serialize(key)?).await
    }

    /// Remove all cached values.
    pub async fn clear(&self) -> Result<()> {
        self.writer.clear(&self.space).await
    }

    pub async fn statistics(&self) -> CacheStatistics {
        self.writer.statistics(&self.space).await
    }

    pub async fn clear_statistics(&self) {
        self.writer.clear_statistics(&self.space).await
    }

    fn serialize_value<V: Serialize + ?Sized>(&self, value: &V) -> Result<Vec<u8>> {
        let bytes = serialize(value)?;
        if bytes == NIL && !self.config.cache_null_values {
            return Err(Error::invalid_usage(format!(
                "Cache '{}' does not allow 'null' values; avoid storing null via the cache \
                 configuration",
                self.name
            )));
        }
        Ok(bytes)
    }
}

/// Creates and keeps track of named caches.
#[derive(Derivative)]
#[derivative(Debug(bound = "W: std::fmt::Debug"))]
pub struct CacheManager<W> {
    writer: Arc<W>,
    defaults: CacheConfiguration,
    allow_in_flight_creation: bool,
    caches: RwLock<HashMap<String, Cache<W>>>,
}

impl<W: CacheWriter> CacheManager<W> {
    /// A manager creating caches with the default configuration on demand.
    pub fn new(writer: W, defaults: CacheConfiguration) -> Self {
        Self {
            writer: Arc::new(writer),
            defaults,
            allow_in_flight_creation: true,
            caches: Default::default(),
        }
    }

    pub fn builder(writer: W) -> CacheManagerBuilder<W> {
        CacheManagerBuilder::new(writer)
    }

    pub fn defaults(&self) -> &CacheConfiguration {
        &self.defaults
    }

    /// The cache called `name`.
    ///
    /// A cache which has not been configured is created with the default configuration, unless
    /// creation of missing caches is disabled, in which case this returns [`None`].
    pub async fn cache(&self, name: &str) -> Result<Option<Cache<W>>> {
        if let Some(cache) = self.caches.read().await.get(name) {
            return Ok(Some(cache.clone()));
        }
        if !self.allow_in_flight_creation {
            return Ok(None);
        }
        let mut caches = self.caches.write().await;
        let cache = caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name, self.defaults.clone(), self.writer.clone()));
        Ok(Some(cache.clone()))
    }

    /// The names of the caches created so far.
    pub async fn cache_names(&self) -> Vec<String> {
        let mut names = self
            .caches
            .read()
            .await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }
}

impl<C: Client> CacheManager<DefaultCacheWriter<C>> {
    /// A manager storing caches through `client`, with the default configuration.
    pub fn create(client: C) -> Self {
        Self::new(DefaultCacheWriter::new(client), Default::default())
    }

    /// A builder for a manager storing caches through `client`.
    pub fn builder_for(client: C) -> CacheManagerBuilder<DefaultCacheWriter<C>> {
        CacheManagerBuilder::new(DefaultCacheWriter::new(client))
    }
}

/// Builder for a [`CacheManager`].
#[derive(Debug)]
pub struct CacheManagerBuilder<W> {
    writer: W,
    statistics: StatisticsCollector,
    defaults: CacheConfiguration,
    initial: BTreeMap<String, CacheConfiguration>,
    allow_in_flight_creation: bool,
}

impl<W: CacheWriter> CacheManagerBuilder<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            statistics: StatisticsCollector::none(),
            defaults: Default::default(),
            initial: Default::default(),
            allow_in_flight_creation: true,
        }
    }

    /// Configuration of caches which are not configured individually.
    pub fn cache_defaults(mut self, defaults: CacheConfiguration) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn cache_writer(mut self, writer: W) -> Self {
        self.writer = writer;
        self
    }

    /// Create the caches `names` up front, with the default configuration.
    pub fn initial_cache_names<I>(mut self, names: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        for name in names {
            self.initial.insert(name.into(), self.defaults.clone());
        }
        self
    }

    pub fn with_cache_configuration(
        mut self,
        name: impl Into<String>,
        config: CacheConfiguration,
    ) -> Self {
        self.initial.insert(name.into(), config);
        self
    }

    pub fn with_initial_cache_configurations(
        mut self,
        configs: impl IntoIterator<Item = (String, CacheConfiguration)>,
    ) -> Self {
        self.initial.extend(configs);
        self
    }

    /// Do not create caches which have not been configured.
    pub fn disable_create_on_missing_cache(mut self) -> Self {
        self.allow_in_flight_creation = false;
        self
    }

    /// Count cache usage.
    pub fn enable_statistics(mut self) -> Self {
        self.statistics = StatisticsCollector::create();
        self
    }

    /// The names of the caches configured so far.
    pub fn configured_caches(&self) -> impl Iterator<Item = &str> {
        self.initial.keys().map(String::as_str)
    }

    pub fn cache_configuration_for(&self, name: &str) -> Option<&CacheConfiguration> {
        self.initial.get(name)
    }

    pub fn build(self) -> CacheManager<W> {
        let writer = if self.statistics.is_enabled() {
            self.writer.with_statistics_collector(self.statistics)
        } else {
            self.writer
        };
        let writer = Arc::new(writer);
        let caches = self
            .initial
            .into_iter()
            .map(|(name, config)| {
                let cache = Cache::new(name.clone(), config, writer.clone());
                (name, cache)
            })
            .collect();
        CacheManager {
            writer,
            defaults: self.defaults,
            allow_in_flight_creation: self.allow_in_flight_creation,
            caches: RwLock::new(caches),
        }
    }
}
