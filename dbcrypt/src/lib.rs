//! # `dbcrypt`
//!
//! Field-level encryption at rest for relational entities.
//!
//! Sensitive attributes of a host entity are kept out of its primary table and
//! stored, encrypted, in a single side table keyed by
//! `(object_type, object_id, attribute)`. Each record also carries a SHA-256
//! hash of the plaintext so equality search works without decrypting.
//!
//! ## Features
//!
//! - AES-256-CBC envelopes with a fresh random IV per write
//! - Hash index for equality search (`where_encrypted`)
//! - Transparent lifecycle hooks for load, save and delete
//! - Batch re-encryption and key rotation
//! - Orphan pruning for records whose host row is gone
//! - Integer or 36-character string (uuid) primary keys
//!
//! ## Example
//!
//! ```rust,ignore
//! use dbcrypt::prelude::*;
//! use dbcrypt_sqlite::SqliteStore;
//!
//! let config = Config::from_env();
//! let cipher = CipherEngine::from_config(&config);
//! let store = SqliteStore::open("app.db", config.primary_key_format)?;
//!
//! let hooks = EncryptionHooks::new(&cipher, &store, &store);
//! let pending = hooks.before_save(&mut user);
//! // write the host row
//! hooks.after_save(&mut user, pending)?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cipher;
pub mod config;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod progress;
pub mod prune;
pub mod record;
pub mod rotation;
pub mod store;

pub use error::{Error, Result};

#[cfg(feature = "derive")]
pub use dbcrypt_derive::EncryptedModel;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::cipher::CipherEngine;
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorKind, StoreError};
    pub use crate::model::{EncryptedModel, RowLookup, SchemaInspector};
    pub use crate::orchestrator::{EncryptionHooks, EncryptionOrchestrator, LifecycleHooks};
    pub use crate::progress::{Progress, Silent};
    pub use crate::prune::OrphanPruner;
    pub use crate::record::{AttributeKey, AttributeRecord, ObjectId, PrimaryKeyFormat};
    pub use crate::rotation::KeyRotation;
    pub use crate::store::{AttributeStore, ScanFilter};
}
