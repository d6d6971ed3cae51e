//! Conversion between entities and tuples.
//!
//! Entities are converted with serde, by way of a MessagePack [`Value`]: an entity serializes (with
//! `rmp-serde`, using named fields) to a map from field names to values, and the format of the
//! target space determines where in the tuple each value goes. Reading reverses the process. Nested
//! structs become `map` fields and sequences become `array` fields.
//!
//! The [`time`] module has serde adapters for storing date and time types the way Tarantool
//! applications usually expect them.

use crate::client::{SpaceMetadata, Tuple, UpdateOperation};
use crate::error::{Error, Result};
use rmpv::Value;
use serde::{de::DeserializeOwned, Serialize};

pub mod time;

/// Convert `entity` into a tuple for `space`.
///
/// Each serialized field is placed at the position of the field with the same name in the space
/// format. Fields of the format which the entity does not provide are `nil`.
///
/// # Errors
///
/// This function fails if `entity` does not serialize to a map, or if it has a field which is not
/// part of the space format.
pub fn to_tuple<T: Serialize>(entity: &T, space: &SpaceMetadata) -> Result<Tuple> {
    let value = to_writable(entity)?;
    let Value::Map(entries) = value else {
        return Err(Error::mapping(format!(
            "cannot store {value} in space {}: expected a map of fields",
            space.name
        )));
    };
    let mut tuple = vec![Value::Nil; space.format.len()];
    for (name, value) in entries {
        let name = name.as_str().ok_or_else(|| {
            Error::mapping(format!("field name {name} is not a string"))
        })?;
        let pos = space.field_position(name).ok_or_else(|| {
            Error::mapping(format!(
                "field {name} is not present in the format of space {}",
                space.name
            ))
        })?;
        tuple[pos] = value;
    }
    Ok(tuple)
}

/// Convert a tuple read from `space` into an entity.
///
/// Values beyond the end of the space format are ignored.
pub fn from_tuple<T: DeserializeOwned>(tuple: Tuple, space: &SpaceMetadata) -> Result<T> {
    let entries = space
        .field_names()
        .zip(tuple)
        .map(|(name, value)| (Value::from(name), value))
        .collect();
    from_readable(&Value::Map(entries)).map_err(|err| {
        Error::mapping(format!(
            "cannot read tuple from space {}: {err}",
            space.name
        ))
    })
}

/// Convert a value returned by a stored function into an entity.
///
/// Arrays are treated as tuples of `space`; anything else is deserialized directly.
pub fn from_result<T: DeserializeOwned>(value: Value, space: Option<&SpaceMetadata>) -> Result<T> {
    match (value, space) {
        (Value::Array(tuple), Some(space)) => from_tuple(tuple, space),
        (value, _) => from_readable(&value),
    }
}

/// Operations assigning each non-`nil` field of `tuple`.
pub fn update_operations(tuple: &[Value]) -> Vec<UpdateOperation> {
    tuple
        .iter()
        .enumerate()
        .filter(|(_, value)| !value.is_nil())
        .map(|(i, value)| UpdateOperation::set(i, value.clone()))
        .collect()
}

/// Convert any serializable value into a MessagePack value.
///
/// Structs become maps keyed by field name.
pub fn to_writable<T: Serialize + ?Sized>(value: &T) -> Result<Value> {
    let bytes = rmp_serde::to_vec_named(value).map_err(Error::mapping)?;
    rmpv::decode::read_value(&mut bytes.as_slice()).map_err(Error::mapping)
}

/// Convert a MessagePack value into any deserializable type.
pub fn from_readable<T: DeserializeOwned>(value: &Value) -> Result<T> {
    let mut bytes = vec![];
    rmpv::encode::write_value(&mut bytes, value).map_err(Error::mapping)?;
    rmp_serde::from_slice(&bytes).map_err(Error::mapping)
}
