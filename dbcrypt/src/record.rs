//! The side-table row and the identifiers that address it.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Surrogate identifier assigned by the store.
pub type RecordId = i64;

/// Maximum length of `object_type` and `attribute`.
pub const MAX_NAME_LEN: usize = 64;
/// Length of a hex `hash_index`.
pub const HASH_INDEX_LEN: usize = 64;
/// Maximum length of an `encrypted_value` (TEXT column).
pub const MAX_ENCRYPTED_VALUE_LEN: usize = 65_535;
/// Length in characters of a string object id.
pub const TEXT_ID_LEN: usize = 36;

/// Format of host primary keys. One format applies to the whole side table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrimaryKeyFormat {
    /// Unsigned auto-increment integers.
    #[default]
    Int,
    /// 36-character identifier strings, usually uuids.
    Uuid,
}

impl PrimaryKeyFormat {
    /// Returns the configuration spelling of the format.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Int => "int",
            Self::Uuid => "uuid",
        }
    }

    /// Parses a raw stored id according to this format.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidObjectId` if `raw` is not a valid id.
    pub fn parse_id(self, raw: &str) -> Result<ObjectId, StoreError> {
        match self {
            Self::Int => raw.trim().parse::<u64>().map(ObjectId::Int).map_err(|_| {
                StoreError::InvalidObjectId(format!("'{}' is not an integer", raw.trim()))
            }),
            Self::Uuid => ObjectId::text(raw),
        }
    }
}

impl FromStr for PrimaryKeyFormat {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "int" => Ok(Self::Int),
            "uuid" => Ok(Self::Uuid),
            other => Err(StoreError::InvalidIdentifier(format!("primary key format '{other}'"))),
        }
    }
}

impl fmt::Display for PrimaryKeyFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary key of a host row.
///
/// String keys are kept exactly as the host spells them; only their length
/// is checked.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectId {
    /// Integer key.
    Int(u64),
    /// 36-character string key.
    Text(String),
}

impl ObjectId {
    /// Creates a string id, keeping `raw` verbatim.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidObjectId` unless `raw` is exactly
    /// 36 characters long.
    pub fn text(raw: impl Into<String>) -> Result<Self, StoreError> {
        let raw = raw.into();
        let len = raw.chars().count();
        if len != TEXT_ID_LEN {
            return Err(StoreError::InvalidObjectId(format!(
                "string id must be {TEXT_ID_LEN} characters, got {len}"
            )));
        }
        Ok(Self::Text(raw))
    }

    /// Returns the format this id belongs to.
    #[must_use]
    pub const fn format(&self) -> PrimaryKeyFormat {
        match self {
            Self::Int(_) => PrimaryKeyFormat::Int,
            Self::Text(_) => PrimaryKeyFormat::Uuid,
        }
    }

    /// Checks this id against the configured format.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::KeyFormatMismatch` when the formats differ.
    pub fn expect_format(&self, expected: PrimaryKeyFormat) -> Result<(), StoreError> {
        if self.format() == expected {
            Ok(())
        } else {
            Err(StoreError::KeyFormatMismatch {
                expected: expected.as_str(),
                actual: self.format().as_str(),
            })
        }
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(id) => write!(f, "{id}"),
            Self::Text(id) => f.write_str(id),
        }
    }
}

impl From<u64> for ObjectId {
    fn from(id: u64) -> Self {
        Self::Int(id)
    }
}

impl From<Uuid> for ObjectId {
    fn from(id: Uuid) -> Self {
        Self::Text(id.hyphenated().to_string())
    }
}

/// Conversion from a host primary key field into an [`ObjectId`].
///
/// Implemented for the key types hosts commonly use. `Option` keys map to
/// `None` while the row has not been persisted yet.
pub trait ToObjectId {
    /// Returns the object id, or `None` if the key is unset or unrepresentable.
    fn to_object_id(&self) -> Option<ObjectId>;
}

impl ToObjectId for u64 {
    fn to_object_id(&self) -> Option<ObjectId> {
        Some(ObjectId::Int(*self))
    }
}

impl ToObjectId for u32 {
    fn to_object_id(&self) -> Option<ObjectId> {
        Some(ObjectId::Int(u64::from(*self)))
    }
}

impl ToObjectId for i64 {
    fn to_object_id(&self) -> Option<ObjectId> {
        u64::try_from(*self).ok().map(ObjectId::Int)
    }
}

impl ToObjectId for Uuid {
    fn to_object_id(&self) -> Option<ObjectId> {
        Some(ObjectId::from(*self))
    }
}

impl ToObjectId for String {
    fn to_object_id(&self) -> Option<ObjectId> {
        ObjectId::text(self.as_str()).ok()
    }
}

impl ToObjectId for ObjectId {
    fn to_object_id(&self) -> Option<ObjectId> {
        Some(self.clone())
    }
}

impl<T: ToObjectId> ToObjectId for Option<T> {
    fn to_object_id(&self) -> Option<ObjectId> {
        self.as_ref().and_then(ToObjectId::to_object_id)
    }
}

/// Natural key of an attribute slot: `(object_type, object_id, attribute)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttributeKey {
    object_type: String,
    object_id: ObjectId,
    attribute: String,
}

impl AttributeKey {
    /// Creates a new natural key.
    #[must_use]
    pub fn new(
        object_type: impl Into<String>,
        object_id: ObjectId,
        attribute: impl Into<String>,
    ) -> Self {
        Self { object_type: object_type.into(), object_id, attribute: attribute.into() }
    }

    /// Returns the host collection name.
    #[must_use]
    pub fn object_type(&self) -> &str {
        &self.object_type
    }

    /// Returns the host primary key.
    #[must_use]
    pub const fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    /// Returns the attribute name.
    #[must_use]
    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    /// Validates column limits before a write.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ValueTooLong`, `StoreError::InvalidIdentifier`
    /// or `StoreError::InvalidObjectId`.
    pub fn validate(&self) -> Result<(), StoreError> {
        validate_name("object_type", &self.object_type)?;
        validate_name("attribute", &self.attribute)?;
        if let ObjectId::Text(raw) = &self.object_id {
            ObjectId::text(raw.as_str())?;
        }
        Ok(())
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}.{}", self.object_type, self.object_id, self.attribute)
    }
}

fn validate_name(column: &'static str, value: &str) -> Result<(), StoreError> {
    if value.is_empty() {
        return Err(StoreError::InvalidIdentifier(format!("{column} cannot be empty")));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(StoreError::ValueTooLong { column, max: MAX_NAME_LEN });
    }
    Ok(())
}

/// Validates the encrypted payload of a write.
///
/// # Errors
///
/// Returns `StoreError` if the hash is not 64 hex characters or the envelope
/// exceeds the column size.
pub fn validate_payload(hash_index: &str, encrypted_value: &str) -> Result<(), StoreError> {
    if hash_index.len() != HASH_INDEX_LEN || !hash_index.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(StoreError::InvalidIdentifier("hash_index must be 64 hex characters".into()));
    }
    if encrypted_value.len() > MAX_ENCRYPTED_VALUE_LEN {
        return Err(StoreError::ValueTooLong {
            column: "encrypted_value",
            max: MAX_ENCRYPTED_VALUE_LEN,
        });
    }
    Ok(())
}

/// One row of the side table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeRecord {
    /// Store-assigned surrogate id.
    pub id: RecordId,
    /// Host collection name.
    pub object_type: String,
    /// Host primary key.
    pub object_id: ObjectId,
    /// Logical attribute name.
    pub attribute: String,
    /// Lowercase hex digest of the trimmed plaintext, for equality search.
    pub hash_index: Option<String>,
    /// Base64 envelope of `IV || ciphertext`.
    pub encrypted_value: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last write timestamp.
    pub updated_at: DateTime<Utc>,
}

impl AttributeRecord {
    /// Returns the natural key of this record.
    #[must_use]
    pub fn key(&self) -> AttributeKey {
        AttributeKey::new(self.object_type.clone(), self.object_id.clone(), self.attribute.clone())
    }
}
