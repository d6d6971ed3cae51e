//! Byte-level access to cache spaces.

use super::statistics::{CacheStatistics, StatisticsCollector};
use crate::client::{Client, Tuple};
use crate::error::{Error, Result};
use crate::query::Conditions;
use async_std::sync::{Arc, RwLock};
use async_trait::async_trait;
use chrono::Utc;
use derivative::Derivative;
use rmpv::Value;
use std::collections::HashSet;
use std::time::Duration;

/// Expiry time of entries which never expire.
pub const NEVER_EXPIRES: u64 = i64::MAX as u64;

/// Reads and writes the raw entries of caches.
///
/// Caches are identified by the name of the space storing them.
#[async_trait]
pub trait CacheWriter: Send + Sync {
    /// The value stored under `key`, unless it has expired.
    async fn get(&self, name: &str, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`. A zero `ttl` means the entry never expires.
    async fn put(&self, name: &str, key: &[u8], value: &[u8], ttl: Duration) -> Result<()>;

    /// Store `value` under `key` unless a live entry exists, which is returned instead.
    async fn put_if_absent(
        &self,
        name: &str,
        key: &[u8],
        value: &[u8],
        ttl: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let existing = self.get(name, key).await?;
        if existing.is_none() {
            self.put(name, key, value, ttl).await?;
        }
        Ok(existing)
    }

    /// Remove the entry stored under `key`.
    async fn remove(&self, name: &str, key: &[u8]) -> Result<()>;

    /// Remove all entries.
    async fn clear(&self, name: &str) -> Result<()>;

    async fn statistics(&self, name: &str) -> CacheStatistics;

    async fn clear_statistics(&self, name: &str);

    /// This writer, counting into `collector`.
    fn with_statistics_collector(self, collector: StatisticsCollector) -> Self
    where
        Self: Sized;
}

/// A [`CacheWriter`] storing each cache in its own space.
///
/// Spaces are created the first time a cache is used, with the format `key varbinary, value
/// varbinary, expiry_time unsigned`, a primary index on `key` and a non-unique index on
/// `expiry_time`.
#[derive(Derivative)]
#[derivative(Clone(bound = "C: Clone"), Debug(bound = "C: std::fmt::Debug"))]
pub struct DefaultCacheWriter<C> {
    client: C,
    statistics: StatisticsCollector,
    #[derivative(Debug = "ignore")]
    spaces: Arc<RwLock<HashSet<String>>>,
}

impl<C: Client> DefaultCacheWriter<C> {
    pub fn new(client: C) -> Self {
        Self {
            client,
            statistics: StatisticsCollector::none(),
            spaces: Default::default(),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Make sure the space `name` exists, creating it if necessary.
    async fn space(&self, name: &str) -> Result<()> {
        if self.spaces.read().await.contains(name) {
            return Ok(());
        }
        let mut spaces = self.spaces.write().await;
        if spaces.contains(name) {
            return Ok(());
        }
        if self.client.space(name).await.map_err(Error::cache)?.is_some() {
            tracing::debug!("Space {name} for caching was created earlier");
        } else {
            tracing::debug!("Create space {name} for caching");
            self.client
                .eval(&format!("box.schema.space.create('{name}')"), vec![])
                .await
                .map_err(Error::cache)?;
            if let Err(err) = self.format_space(name).await {
                tracing::error!("Error while formatting space {name}, drop space: {err}");
                if let Err(err) = self
                    .client
                    .eval(&format!("box.space.{name}:drop()"), vec![])
                    .await
                {
                    tracing::warn!("failed to drop space {name}: {err}");
                }
                return Err(err);
            }
        }
        spaces.insert(name.to_string());
        Ok(())
    }

    async fn format_space(&self, name: &str) -> Result<()> {
        let field = |name: &str, ty: &str| {
            Value::Map(vec![
                (Value::from("name"), Value::from(name)),
                (Value::from("type"), Value::from(ty)),
            ])
        };
        let format = Value::Array(vec![
            field("key", "varbinary"),
            field("value", "varbinary"),
            field("expiry_time", "unsigned"),
        ]);
        self.client
            .call(&format!("box.space.{name}:format"), vec![format])
            .await
            .map_err(Error::cache)?;

        let index = |index: &str, unique: bool| {
            vec![
                Value::from(index),
                Value::Map(vec![
                    (
                        Value::from("parts"),
                        Value::Array(vec![Value::from(index_field(index))]),
                    ),
                    (Value::from("unique"), Value::from(unique)),
                ]),
            ]
        };
        for (index_name, unique) in [("primary", true), ("expiry_time", false)] {
            self.client
                .call(&format!("box.space.{name}:create_index"), index(index_name, unique))
                .await
                .map_err(Error::cache)?;
        }
        self.client.refresh_metadata().await.map_err(Error::cache)
    }

    async fn delete(&self, name: &str, key: &[u8]) -> Result<()> {
        self.client
            .delete(name, vec![Value::Binary(key.to_vec())])
            .await
            .map_err(Error::cache)?;
        self.statistics.inc_deletes_by(name, 1).await;
        Ok(())
    }
}

fn index_field(index: &str) -> &str {
    match index {
        "primary" => "key",
        other => other,
    }
}

fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}

/// The expiry time of an entry stored now with time to live `ttl`.
fn expiry_time(ttl: Duration) -> u64 {
    if ttl.is_zero() {
        NEVER_EXPIRES
    } else {
        now_millis()
            .saturating_add(ttl.as_secs().saturating_mul(1000))
            .min(NEVER_EXPIRES)
    }
}

/// The value and expiry time of a stored entry.
fn read_entry(tuple: &Tuple) -> Result<(Vec<u8>, u64)> {
    match (tuple.get(1), tuple.get(2).and_then(Value::as_u64)) {
        (Some(Value::Binary(value)), Some(expiry)) => Ok((value.clone(), expiry)),
        _ => Err(Error::cache(format!("malformed cache entry {tuple:?}"))),
    }
}

#[async_trait]
impl<C: Client> CacheWriter for DefaultCacheWriter<C> {
    async fn get(&self, name: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.space(name).await?;
        let tuples = self
            .client
            .select(
                name,
                &Conditions::primary_key(vec![Value::Binary(key.to_vec())]),
            )
            .await
            .map_err(Error::cache)?;
        let value = match tuples.first() {
            Some(tuple) => {
                let (value, expiry) = read_entry(tuple)?;
                if expiry > now_millis() {
                    Some(value)
                } else {
                    self.delete(name, key).await?;
                    None
                }
            }
            None => None,
        };

        self.statistics.inc_gets(name).await;
        if value.is_some() {
            self.statistics.inc_hits(name).await;
        } else {
            self.statistics.inc_misses(name).await;
        }
        Ok(value)
    }

    async fn put(&self, name: &str, key: &[u8], value: &[u8], ttl: Duration) -> Result<()> {
        self.space(name).await?;
        let tuple = vec![
            Value::Binary(key.to_vec()),
            Value::Binary(value.to_vec()),
            Value::from(expiry_time(ttl)),
        ];
        self.client
            .replace(name, tuple)
            .await
            .map_err(Error::cache)?;
        self.statistics.inc_puts(name).await;
        Ok(())
    }

    async fn remove(&self, name: &str, key: &[u8]) -> Result<()> {
        self.space(name).await?;
        self.delete(name, key).await
    }

    async fn clear(&self, name: &str) -> Result<()> {
        self.space(name).await?;
        self.client.truncate(name).await.map_err(Error::cache)
    }

    async fn statistics(&self, name: &str) -> CacheStatistics {
        self.statistics.statistics(name).await
    }

    async fn clear_statistics(&self, name: &str) {
        self.statistics.reset(name).await
    }

    fn with_statistics_collector(self, statistics: StatisticsCollector) -> Self {
        Self { statistics, ..self }
    }
}
