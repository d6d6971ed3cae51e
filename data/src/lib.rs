//! Data access for Tarantool.
//!
//! This crate maps Rust types onto Tarantool spaces and provides the operations needed to work with
//! them: a low-level [`Client`](client::Client) abstraction over the database, a
//! [`Template`](template::Template) implementing entity-level operations on top of a client,
//! [`Repository`](repository::Repository) objects with queries derived from method names, and a
//! [`cache`] stored in Tarantool spaces.
//!
//! Entities are plain serde types which additionally implement [`Entity`], usually via the derive
//! macro:
//!
//! ```
//! use serde::{Deserialize, Serialize};
//! use tarantool_data::Entity;
//!
//! #[derive(Clone, Debug, Serialize, Deserialize, Entity)]
//! #[entity(space = "users")]
//! struct User {
//!     #[entity(id)]
//!     id: u64,
//!     name: String,
//! }
//! ```

extern crate self as tarantool_data;

pub use rmpv::Value;
pub use tarantool_data_derive::Entity;

pub mod cache;
pub mod client;
pub mod convert;
pub mod error;
pub mod event;
pub mod logging;
pub mod mapping;
pub mod options;
pub mod query;
pub mod repository;
pub mod template;

pub use error::Error;
pub use logging::init_logging;
pub use mapping::{Entity, MapId};
pub use query::{Conditions, Operator, Query, Sort};
pub use repository::Repository;
pub use template::Template;

/// Items referenced by code generated by [`derive@Entity`].
#[doc(hidden)]
pub mod private {
    pub use crate::convert::to_writable;
}
