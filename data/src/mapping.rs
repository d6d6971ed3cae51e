//! Mapping of Rust types onto spaces.
//!
//! An [`Entity`] is a serde type stored as one tuple per value in a Tarantool space. The trait
//! provides the metadata needed to do that which serde does not know about: the name of the space,
//! which fields make up the primary key, and how to tell a new entity from one which has already
//! been stored. It is normally implemented with `#[derive(Entity)]`:
//!
//! * `#[entity(space = "name")]` on the struct sets the space name. By default the space is named
//!   after the type, in lowercase.
//! * `#[entity(id)]` on a field marks it as part of the primary key. If several fields are marked,
//!   the id is a tuple of their values in declaration order.
//! * `#[entity(id, key = "a, b")]` marks a field holding an embedded key struct, usually combined
//!   with `#[serde(flatten)]`. The key struct's fields `a` and `b` form the primary key.
//! * `#[entity(version)]` marks a version field, which takes precedence over the id when
//!   determining whether an entity is new.
//!
//! Field names follow serde: `#[serde(rename)]` and `#[serde(rename_all)]` are honored, and
//! `#[serde(skip)]` fields are not stored.

use crate::convert::to_writable;
use crate::error::{Error, Result};
use rmpv::Value;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display, Formatter};

/// A type stored in a Tarantool space.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// The type of the primary key of this entity.
    type Id: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static;

    /// The name of the space storing entities of this type.
    fn space() -> &'static str;

    /// The names of the fields making up the primary key, in index order.
    fn id_fields() -> &'static [&'static str];

    /// The names of all stored fields.
    fn fields() -> &'static [&'static str];

    /// The primary key of this entity.
    fn id(&self) -> Self::Id;

    /// The value of the version field, if this entity has one.
    fn version(&self) -> Option<Value> {
        None
    }

    /// Whether this entity has not been stored yet.
    ///
    /// If the entity has a version field, it is new when the version is `nil` or zero. Otherwise it
    /// is new when its id is `nil`, zero or an empty composite key.
    fn is_new(&self) -> bool {
        match self.version() {
            Some(version) => is_new_value(&version),
            None => to_writable(&self.id())
                .map(|id| is_new_value(&id))
                .unwrap_or(true),
        }
    }
}

/// Whether a value of an id or version field indicates a new entity.
pub fn is_new_value(value: &Value) -> bool {
    match value {
        Value::Nil => true,
        Value::Integer(n) => n.as_u64() == Some(0) || n.as_i64() == Some(0),
        Value::F32(x) => *x == 0.0,
        Value::F64(x) => *x == 0.0,
        Value::Array(items) => items.is_empty(),
        Value::Map(entries) => entries.is_empty(),
        _ => false,
    }
}

/// Get the primary key values of the entity of type `T` with id `id`.
///
/// # Errors
///
/// This function fails if `T` declares no id fields, or if `id` does not have a value for each of
/// them.
pub fn key_of<T: Entity>(id: &T::Id) -> Result<Vec<Value>> {
    let fields = T::id_fields();
    if fields.is_empty() {
        return Err(Error::mapping(format!(
            "Can't retrieve id fields from entity {}",
            T::space()
        )));
    }
    let value = to_writable(id)?;
    match value {
        Value::Array(items) if fields.len() > 1 => {
            if items.len() != fields.len() {
                return Err(Error::mapping(format!(
                    "id of {} has {} parts, expected {}",
                    T::space(),
                    items.len(),
                    fields.len()
                )));
            }
            Ok(items)
        }
        Value::Map(entries) => fields
            .iter()
            .map(|field| {
                entries
                    .iter()
                    .find(|(k, _)| k.as_str() == Some(field))
                    .map(|(_, v)| v.clone())
                    .ok_or_else(|| {
                        Error::mapping(format!(
                            "Can't retrieve id field {field} from id of entity {}",
                            T::space()
                        ))
                    })
            })
            .collect(),
        value if fields.len() == 1 => Ok(vec![value]),
        value => Err(Error::mapping(format!(
            "id {value} of {} does not have the {} parts of a composite key",
            T::space(),
            fields.len()
        ))),
    }
}

/// The primary key values of `entity`.
pub fn entity_key<T: Entity>(entity: &T) -> Result<Vec<Value>> {
    key_of::<T>(&entity.id())
}

/// An identifier made of named values.
///
/// A `MapId` can serve as the id of an entity with a composite primary key when the key does not
/// have a dedicated type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MapId(BTreeMap<String, Value>);

impl MapId {
    /// An empty id.
    pub fn new() -> Self {
        Self::default()
    }

    /// An id with a single value.
    pub fn of(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new().with(name, value)
    }

    /// Add a value to this id.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Get the value called `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// The number of values in this id.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether this id has no values.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the named values of this id.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for MapId {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl Display for MapId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{{ ")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{k} : {v}")?;
        }
        write!(f, " }}")
    }
}
