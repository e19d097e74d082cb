//! Error types for `dbcrypt` operations.
//!
//! Every variant carries only identifiers (table, attribute, record id) and
//! never a plaintext or ciphertext value, so errors are safe to log.

use std::fmt;

/// Convenience alias used across the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for `dbcrypt` operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No base encryption key is configured
    #[error("encryption key is not configured")]
    MissingKey,

    /// A plaintext or envelope argument was absent
    #[error("value to encrypt or decrypt cannot be null")]
    NullInput,

    /// The envelope is not valid base64
    #[error("envelope is not valid base64")]
    InvalidEncoding,

    /// The underlying cipher rejected the operation
    #[error("cipher operation failed: {0}")]
    CipherFailure(&'static str),

    /// A declared encrypted attribute collides with a real column
    #[error(
        "cannot encrypt attribute '{attribute}' because it already exists as a column in table '{table}'"
    )]
    SchemaConflict {
        /// Declared attribute name
        attribute: String,
        /// Host table that already owns a column of that name
        table: String,
    },

    /// The named attribute is not in the model's declared encrypted set
    #[error("attribute '{0}' is not declared as an encrypted attribute")]
    UndefinedAttribute(String),

    /// An operation was attempted before a model was bound
    #[error("no model is bound; call set_model first")]
    ModelNotBound,

    /// The bound model has no primary key yet
    #[error("model in table '{table}' has no primary key")]
    MissingObjectId {
        /// Host table of the model
        table: String,
    },

    /// Attribute store operation failed
    #[error("attribute store error: {0}")]
    Store(#[from] StoreError),
}

impl Error {
    /// Returns the payload-free kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingKey => ErrorKind::MissingKey,
            Self::NullInput => ErrorKind::NullInput,
            Self::InvalidEncoding => ErrorKind::InvalidEncoding,
            Self::CipherFailure(_) => ErrorKind::CipherFailure,
            Self::SchemaConflict { .. } => ErrorKind::SchemaConflict,
            Self::UndefinedAttribute(_) => ErrorKind::UndefinedAttribute,
            Self::ModelNotBound => ErrorKind::ModelNotBound,
            Self::MissingObjectId { .. } => ErrorKind::MissingObjectId,
            Self::Store(_) => ErrorKind::Store,
        }
    }
}

/// Discriminant of [`Error`], recorded by batch jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MissingKey,
    NullInput,
    InvalidEncoding,
    CipherFailure,
    SchemaConflict,
    UndefinedAttribute,
    ModelNotBound,
    MissingObjectId,
    Store,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::MissingKey => "missing_key",
            Self::NullInput => "null_input",
            Self::InvalidEncoding => "invalid_encoding",
            Self::CipherFailure => "cipher_failure",
            Self::SchemaConflict => "schema_conflict",
            Self::UndefinedAttribute => "undefined_attribute",
            Self::ModelNotBound => "model_not_bound",
            Self::MissingObjectId => "missing_object_id",
            Self::Store => "store",
        };
        f.write_str(name)
    }
}

/// Errors raised by attribute store backends and host collaborators.
#[derive(Debug)]
pub enum StoreError {
    /// The backend failed (I/O, SQL, poisoned lock)
    Backend(String),

    /// An object id did not match the configured primary key format
    KeyFormatMismatch {
        /// Format the store was configured with
        expected: &'static str,
        /// Format of the rejected id
        actual: &'static str,
    },

    /// An object id could not be parsed or stored
    InvalidObjectId(String),

    /// A table, attribute or column identifier was rejected
    InvalidIdentifier(String),

    /// A value exceeded its column limit
    ValueTooLong {
        /// Column that overflowed
        column: &'static str,
        /// Maximum length in bytes
        max: usize,
    },

    /// A record addressed by surrogate id does not exist
    NotFound(i64),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend(msg) => write!(f, "backend failure: {msg}"),
            Self::KeyFormatMismatch { expected, actual } => {
                write!(f, "object id format mismatch: expected {expected}, got {actual}")
            }
            Self::InvalidObjectId(msg) => write!(f, "invalid object id: {msg}"),
            Self::InvalidIdentifier(name) => write!(f, "invalid identifier: {name}"),
            Self::ValueTooLong { column, max } => {
                write!(f, "value for column {column} exceeds {max} bytes")
            }
            Self::NotFound(id) => write!(f, "attribute record {id} not found"),
        }
    }
}

impl std::error::Error for StoreError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        assert_eq!(Error::MissingKey.kind(), ErrorKind::MissingKey);
        assert_eq!(Error::UndefinedAttribute("ssn".into()).kind(), ErrorKind::UndefinedAttribute);
        assert_eq!(
            Error::from(StoreError::Backend("disk full".into())).kind(),
            ErrorKind::Store
        );
    }

    #[test]
    fn test_schema_conflict_message_names_column() {
        let err = Error::SchemaConflict { attribute: "name".into(), table: "users".into() };
        let msg = err.to_string();
        assert!(msg.contains("'name'"));
        assert!(msg.contains("'users'"));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::CipherFailure.to_string(), "cipher_failure");
    }
}
