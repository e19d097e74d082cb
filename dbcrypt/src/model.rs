//! Capabilities the host persistence layer provides.
//!
//! A host entity type implements [`EncryptedModel`], usually through
//! `#[derive(EncryptedModel)]` from `dbcrypt-derive`. The host database
//! provides a [`SchemaInspector`] for the bind-time column check and a
//! [`RowLookup`] for orphan pruning.

use crate::error::StoreError;
use crate::record::ObjectId;

/// A host entity with a statically declared set of encrypted attributes.
///
/// # Example
///
/// ```
/// use dbcrypt::model::EncryptedModel;
/// use dbcrypt::record::ObjectId;
///
/// struct User {
///     id: u64,
///     ssn: Option<String>,
/// }
///
/// impl EncryptedModel for User {
///     const TABLE: &'static str = "users";
///     const ENCRYPTED_ATTRIBUTES: &'static [&'static str] = &["ssn"];
///
///     fn object_id(&self) -> Option<ObjectId> {
///         Some(ObjectId::Int(self.id))
///     }
///
///     fn get_attribute(&self, name: &str) -> Option<&str> {
///         match name {
///             "ssn" => self.ssn.as_deref(),
///             _ => None,
///         }
///     }
///
///     fn set_attribute(&mut self, name: &str, value: Option<String>) {
///         if name == "ssn" {
///             self.ssn = value;
///         }
///     }
/// }
/// ```
pub trait EncryptedModel {
    /// Host collection (table) name, used as `object_type`.
    const TABLE: &'static str;

    /// Names of the attributes stored in the side table.
    const ENCRYPTED_ATTRIBUTES: &'static [&'static str];

    /// Primary key, or `None` if the row has not been persisted.
    fn object_id(&self) -> Option<ObjectId>;

    /// Returns the in-memory value of an attribute.
    fn get_attribute(&self, name: &str) -> Option<&str>;

    /// Assigns an in-memory attribute value.
    fn set_attribute(&mut self, name: &str, value: Option<String>);

    /// Returns true if the attribute is present in the raw attribute set.
    ///
    /// Struct-backed models always carry their fields, so the default treats
    /// every declared attribute as present. Map-backed models override this
    /// to distinguish "never assigned" from "assigned empty".
    fn has_attribute(&self, name: &str) -> bool {
        Self::ENCRYPTED_ATTRIBUTES.contains(&name)
    }

    /// Removes an attribute from the raw attribute set, returning its value.
    ///
    /// Called before the primary row is written so plaintext never reaches
    /// the host columns.
    fn take_attribute(&mut self, name: &str) -> Option<String> {
        let value = self.get_attribute(name).map(str::to_string);
        self.set_attribute(name, None);
        value
    }
}

/// Host schema introspection.
pub trait SchemaInspector {
    /// Returns true if `column` exists in `table`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the schema cannot be read.
    fn has_column(&self, table: &str, column: &str) -> Result<bool, StoreError>;
}

/// Existence check against an arbitrary host collection.
pub trait RowLookup {
    /// Returns true if `table` holds a row with primary key `id`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the lookup itself fails, for example because
    /// the table does not exist.
    fn row_exists(&self, table: &str, id: &ObjectId) -> Result<bool, StoreError>;
}

/// Schema inspector for hosts without introspection; reports no columns.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSchema;

impl SchemaInspector for NoSchema {
    fn has_column(&self, _table: &str, _column: &str) -> Result<bool, StoreError> {
        Ok(false)
    }
}
