//! Error types for decoding, construction, storage, and integrity failures.
//!
//! Decode failures nest: every composite decoder wraps the error of the
//! field it was reading in [`DecodeError::Field`], so the rendered message
//! walks from the outermost entity down to the byte that was missing.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A decode operation ran out of bytes or found a structurally invalid value.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unexpected end of input at offset {offset}: needed {needed} bytes, {remaining} remaining")]
    ShortRead {
        needed: usize,
        remaining: usize,
        offset: usize,
    },
    #[error("{0}")]
    Invalid(String),
    #[error("invalid base58: {0}")]
    Base58(#[from] bs58::decode::Error),
    #[error("failed to parse {field}: {source}")]
    Field {
        field: &'static str,
        #[source]
        source: Box<DecodeError>,
    },
}

impl DecodeError {
    /// The chain of field names from the outermost entity to the failure.
    pub fn path(&self) -> Vec<&'static str> {
        let mut path = Vec::new();
        let mut current = self;
        while let DecodeError::Field { field, source } = current {
            path.push(*field);
            current = &**source;
        }
        return path;
    }

    /// The innermost error, with all field wrappers stripped.
    pub fn root_cause(&self) -> &DecodeError {
        let mut current = self;
        while let DecodeError::Field { source, .. } = current {
            current = &**source;
        }
        return current;
    }
}

/// Names the field a decode result belongs to.
pub trait DecodeContext<T> {
    fn field(self, field: &'static str) -> Result<T, DecodeError>;
}

impl<T> DecodeContext<T> for Result<T, DecodeError> {
    fn field(self, field: &'static str) -> Result<T, DecodeError> {
        return self.map_err(|source| DecodeError::Field {
            field,
            source: Box::new(source),
        });
    }
}

/// The durable backend failed to service a read or write.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("timed out after {0:?} waiting for write lock")]
    Timeout(Duration),
}

/// Top-level error returned by every fallible operation of the index.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed input: {0}")]
    MalformedInput(#[from] DecodeError),
    #[error("invalid construction: {0}")]
    InvalidConstruction(String),
    #[error("integrity violation: attempted to mutate immutable {entity} {key}")]
    IntegrityViolation { entity: &'static str, key: String },
    #[error("storage unavailable: {0}")]
    Unavailable(#[from] StorageError),
}

impl Error {
    /// Integrity violations signal a caller bug and must never be retried.
    pub fn is_fatal(&self) -> bool {
        return matches!(self, Error::IntegrityViolation { .. });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short() -> DecodeError {
        return DecodeError::ShortRead {
            needed: 8,
            remaining: 3,
            offset: 12,
        };
    }

    #[test]
    fn field_context_builds_path() {
        let result: Result<u64, DecodeError> = Err(short());
        let err = result.field("rank").field("Sequence").unwrap_err();
        assert_eq!(err.path(), vec!["Sequence", "rank"]);
        assert!(matches!(err.root_cause(), DecodeError::ShortRead { needed: 8, .. }));
    }

    #[test]
    fn rendered_chain_names_every_field() {
        let result: Result<u64, DecodeError> = Err(short());
        let err = result.field("rank").field("Sequence").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("Sequence"));
        assert!(message.contains("rank"));
        assert!(message.contains("offset 12"));
    }

    #[test]
    fn only_integrity_violations_are_fatal() {
        let violation = Error::IntegrityViolation {
            entity: "Sequence",
            key: "SequenceID(1)".to_string(),
        };
        assert!(violation.is_fatal());
        assert!(!Error::InvalidConstruction("empty".to_string()).is_fatal());
        assert!(!Error::from(short()).is_fatal());
        assert!(!Error::from(StorageError::Timeout(Duration::from_millis(5))).is_fatal());
    }
}
