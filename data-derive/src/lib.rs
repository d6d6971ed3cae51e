//! Derive macros for the `tarantool-data` crate.

use proc_macro::TokenStream;
use syn::parse_macro_input;

mod entity;

/// Derive an implementation of `Entity` for a struct.
///
/// The struct must also implement `serde::Serialize` and `serde::Deserialize`; the field names
/// reported by the generated `Entity` implementation are the names serde uses, so
/// `#[serde(rename = "...")]`, `#[serde(rename_all = "...")]` and `#[serde(skip)]` are taken into
/// account.
///
/// # Struct attributes
///
/// * `#[entity(space = "name")]`: the space storing the entity. Defaults to the lowercase name of
///   the struct.
///
/// # Field attributes
///
/// * `#[entity(id)]`: the field is part of the primary key. At least one field must be marked. If
///   more than one field is marked, the id type is a tuple of their types, in declaration order.
/// * `#[entity(id, key = "a, b")]`: the field holds an embedded key whose fields `a` and `b` form the
///   primary key. Usually combined with `#[serde(flatten)]`, so that the key's fields are stored as
///   fields of the tuple.
/// * `#[entity(version)]`: the field holds a version number, used instead of the id to decide
///   whether the entity is new.
///
/// # Examples
///
/// ```
/// # mod example {
/// use serde::{Deserialize, Serialize};
/// use tarantool_data::Entity;
///
/// #[derive(Serialize, Deserialize, Entity)]
/// #[entity(space = "articles")]
/// struct Article {
///     #[entity(id)]
///     id: u64,
///     #[serde(rename = "name")]
///     title: String,
/// }
/// # }
/// ```
#[proc_macro_derive(Entity, attributes(entity))]
pub fn derive_entity(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input);
    entity::derive(input).into()
}
