//! Abstract interface to a Tarantool instance.
//!
//! The [`Client`] trait is the narrow waist of this crate: everything above it (templates,
//! repositories, caches) is written against the trait, and everything below it is an instantiation
//! for a particular way of reaching the data. There are three instantiations:
//! * [`iproto`], which speaks the Tarantool binary protocol directly to one or more instances,
//! * [`proxy`], which wraps another client and routes data operations through the `crud`
//!   functions of a Cartridge cluster,
//! * [`mock`], an in-memory database for testing.

use crate::query::Conditions;
use async_trait::async_trait;
use derive_more::Display;
use rmpv::Value;
use std::fmt::Display;

pub mod iproto;
pub mod mock;
pub mod proxy;
pub mod schema;

pub use schema::{FieldMetadata, IndexMetadata, SpaceMetadata};

/// A row in a space.
pub type Tuple = Vec<Value>;

/// The class of an error returned by a [`Client`].
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The connection to the server could not be established or was lost.
    #[display(fmt = "connection")]
    Connection,
    /// A request did not complete in time.
    #[display(fmt = "timeout")]
    Timeout,
    /// The user is not allowed to perform the operation.
    #[display(fmt = "access denied")]
    AccessDenied,
    /// A space does not exist.
    #[display(fmt = "no such space")]
    NoSuchSpace,
    /// An index does not exist.
    #[display(fmt = "no such index")]
    NoSuchIndex,
    /// A field does not exist in the format of a space.
    #[display(fmt = "no such field")]
    NoSuchField,
    /// A stored procedure does not exist.
    #[display(fmt = "no such procedure")]
    NoSuchProcedure,
    /// A stored procedure raised an error.
    #[display(fmt = "function")]
    Function,
    /// A data operation was rejected by the server.
    #[display(fmt = "space operation")]
    SpaceOperation,
    /// A tuple could not be converted.
    #[display(fmt = "tuple conversion")]
    TupleConversion,
    /// Schema metadata could not be loaded.
    #[display(fmt = "metadata")]
    Metadata,
    /// The server or client is in an unexpected state.
    #[display(fmt = "internal")]
    Internal,
    /// Anything else.
    #[display(fmt = "other")]
    Other,
}

/// Errors returned by a client.
pub trait Error: Sized + Send + Sync + std::error::Error + 'static {
    /// Create an error of the given kind.
    fn new(kind: ErrorKind, msg: impl Display) -> Self;

    /// The class of this error.
    fn kind(&self) -> ErrorKind;

    /// Wrap a custom message into this error type.
    fn custom(msg: impl Display) -> Self {
        Self::new(ErrorKind::Other, msg)
    }

    /// An error indicating that `space` does not exist.
    fn no_such_space(space: &str) -> Self {
        Self::new(ErrorKind::NoSuchSpace, format!("space {space} not found"))
    }

    /// An error indicating that a request returned more than the `expected` number of tuples.
    fn too_many_rows(expected: usize) -> Self {
        Self::new(
            ErrorKind::Internal,
            format!("result has more tuples than the expected {expected}"),
        )
    }

    /// An error indicating that a request which was expected to return some tuples did not.
    fn empty_rows() -> Self {
        Self::new(ErrorKind::Internal, "result is empty")
    }
}

/// A single operation in an `update` or `upsert` request.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateOperation {
    /// The operator, as understood by Tarantool (`=`, `+`, `-`, ...).
    pub op: String,
    /// Zero-based position of the field to update.
    pub field: usize,
    /// Argument of the operator.
    pub value: Value,
}

impl UpdateOperation {
    /// Assign `value` to the field at position `field`.
    pub fn set(field: usize, value: Value) -> Self {
        Self {
            op: "=".into(),
            field,
            value,
        }
    }

    /// Encode this operation the way Tarantool expects it on the wire.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::from(self.op.as_str()),
            Value::from(self.field as u64),
            self.value.clone(),
        ])
    }
}

/// A connection to Tarantool.
#[async_trait]
pub trait Client: Send + Sync {
    /// Errors returned from requests.
    type Error: Error;

    /// Get the metadata for `space`.
    ///
    /// Returns [`None`] if the space does not exist.
    async fn space(&self, space: &str) -> Result<Option<SpaceMetadata>, Self::Error>;

    /// Reload the schema from the server.
    async fn refresh_metadata(&self) -> Result<(), Self::Error>;

    /// Get the tuples in `space` matching `conditions`.
    ///
    /// Tuples are returned in primary key order, or in reverse primary key order if `conditions`
    /// asks for descending order.
    async fn select(
        &self,
        space: &str,
        conditions: &Conditions,
    ) -> Result<Vec<Tuple>, Self::Error>;

    /// Insert a tuple.
    ///
    /// # Errors
    ///
    /// This method will fail if a tuple with the same primary key already exists.
    async fn insert(&self, space: &str, tuple: Tuple) -> Result<Vec<Tuple>, Self::Error>;

    /// Insert a tuple, replacing any existing tuple with the same primary key.
    async fn replace(&self, space: &str, tuple: Tuple) -> Result<Vec<Tuple>, Self::Error>;

    /// Apply `ops` to the tuple with primary key `key`.
    async fn update(
        &self,
        space: &str,
        key: Tuple,
        ops: Vec<UpdateOperation>,
    ) -> Result<Vec<Tuple>, Self::Error>;

    /// Insert `tuple`, or apply `ops` to the existing tuple with the same primary key.
    async fn upsert(
        &self,
        space: &str,
        tuple: Tuple,
        ops: Vec<UpdateOperation>,
    ) -> Result<(), Self::Error>;

    /// Delete the tuple with primary key `key`, returning it if it existed.
    async fn delete(&self, space: &str, key: Tuple) -> Result<Vec<Tuple>, Self::Error>;

    /// Delete all tuples in `space`.
    async fn truncate(&self, space: &str) -> Result<(), Self::Error>;

    /// Call a stored function.
    async fn call(&self, function: &str, args: Vec<Value>) -> Result<Vec<Value>, Self::Error>;

    /// Evaluate a Lua expression.
    async fn eval(&self, expression: &str, args: Vec<Value>) -> Result<Vec<Value>, Self::Error>;

    /// Whether data operations are routed through cluster proxy functions.
    fn is_proxy(&self) -> bool {
        false
    }

    /// Get the metadata for `space`, failing if it does not exist.
    async fn required_space(&self, space: &str) -> Result<SpaceMetadata, Self::Error> {
        self.space(space)
            .await?
            .ok_or_else(|| Self::Error::no_such_space(space))
    }
}
