//! Errors reported by the data access layer.
//!
//! Every client instantiation has its own error type. Above the client layer those errors are
//! translated into the categories of [`Error`] by [`Error::translate`], so that application code
//! can react to, say, a lost connection without knowing which client it is using.

use crate::client::{self, ErrorKind};
use snafu::Snafu;
use std::fmt::Display;

/// Errors reported by the data access layer.
#[derive(Clone, Debug, Snafu, PartialEq, Eq)]
pub enum Error {
    /// The server could not be reached.
    #[snafu(display("failed to communicate with Tarantool: {message}"))]
    ServerConnection { message: String },
    /// A data operation was rejected.
    #[snafu(display("data access error: {message}"))]
    DataAccess { message: String },
    /// Data could not be retrieved.
    #[snafu(display("data retrieval error: {message}"))]
    DataRetrieval { message: String },
    /// A space or its format is missing or does not match the entity.
    #[snafu(display("space metadata error: {message}"))]
    SpaceMetadata { message: String },
    /// An entity could not be converted to or from a tuple.
    #[snafu(display("mapping error: {message}"))]
    Mapping { message: String },
    /// An operation was used incorrectly.
    #[snafu(display("invalid API usage: {message}"))]
    InvalidApiUsage { message: String },
    /// A cache operation failed.
    #[snafu(display("cache access error: {message}"))]
    CacheAccess { message: String },
    /// Any other error.
    #[snafu(display("{message}"))]
    Uncategorized { message: String },
}

impl Error {
    /// Translate an error returned by a client into a data access error.
    pub fn translate<E: client::Error>(err: E) -> Self {
        let message = err.to_string();
        match err.kind() {
            ErrorKind::Connection | ErrorKind::Timeout => Self::ServerConnection { message },
            ErrorKind::NoSuchField
            | ErrorKind::Metadata
            | ErrorKind::SpaceOperation
            | ErrorKind::TupleConversion
            | ErrorKind::AccessDenied => Self::DataAccess { message },
            ErrorKind::Internal
            | ErrorKind::Function
            | ErrorKind::NoSuchIndex
            | ErrorKind::NoSuchProcedure => Self::DataRetrieval { message },
            ErrorKind::NoSuchSpace => Self::SpaceMetadata { message },
            ErrorKind::Other => Self::Uncategorized { message },
        }
    }

    /// A mapping error with the given message.
    pub fn mapping(msg: impl Display) -> Self {
        Self::Mapping {
            message: msg.to_string(),
        }
    }

    /// An invalid API usage error with the given message.
    pub fn invalid_usage(msg: impl Display) -> Self {
        Self::InvalidApiUsage {
            message: msg.to_string(),
        }
    }

    /// A cache access error with the given message.
    pub fn cache(msg: impl Display) -> Self {
        Self::CacheAccess {
            message: msg.to_string(),
        }
    }

    /// The error reported when the metadata for a space cannot be found.
    pub fn missing_space(space: &str) -> Self {
        Self::Mapping {
            message: format!("Space metadata not found for space {space}"),
        }
    }
}

/// Convenience alias for results in this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod test {
    use super::*;
    use crate::client::{mock, Error as _};

    #[test]
    fn test_translate() {
        let cases = [
            (ErrorKind::Connection, "ServerConnection"),
            (ErrorKind::Timeout, "ServerConnection"),
            (ErrorKind::AccessDenied, "DataAccess"),
            (ErrorKind::SpaceOperation, "DataAccess"),
            (ErrorKind::NoSuchProcedure, "DataRetrieval"),
            (ErrorKind::NoSuchIndex, "DataRetrieval"),
            (ErrorKind::NoSuchSpace, "SpaceMetadata"),
            (ErrorKind::Other, "Uncategorized"),
        ];
        for (kind, category) in cases {
            let err = Error::translate(mock::Error::new(kind, "boom"));
            assert!(
                format!("{err:?}").starts_with(category),
                "{kind} translated to {err:?}"
            );
        }
    }

    #[test]
    fn test_message_preserved() {
        let err = Error::translate(mock::Error::no_such_space("users"));
        assert_eq!(
            err.to_string(),
            "space metadata error: mock DB error (no such space): space users not found"
        );
    }
}
