//! Binds a host model's encrypted attributes to the cipher and the store.
//!
//! [`EncryptionOrchestrator`] works on one bound model at a time: `decrypt`
//! loads side-table records into the model, `encrypt` writes the model's
//! values back as envelopes. [`EncryptionHooks`] wraps it into the load/save
//! lifecycle a host repository drives:
//!
//! 1. `after_load` right after the primary row is read
//! 2. `before_save` strips encrypted attributes before the primary write
//! 3. `after_save` restores and encrypts them once the row is durable
//! 4. `after_delete` removes every record of a deleted row

use crate::cipher::CipherEngine;
use crate::error::{Error, Result};
use crate::model::{EncryptedModel, SchemaInspector};
use crate::record::{AttributeKey, ObjectId};
use crate::store::AttributeStore;
use tracing::debug;
use zeroize::Zeroizing;

struct Bound<'a, M> {
    model: &'a mut M,
    object_type: String,
    object_id: ObjectId,
}

/// Encrypts and decrypts the declared attributes of one bound model.
///
/// # Example
///
/// ```
/// use dbcrypt::cipher::CipherEngine;
/// use dbcrypt::model::{EncryptedModel, NoSchema};
/// use dbcrypt::orchestrator::EncryptionOrchestrator;
/// use dbcrypt::record::{ObjectId, PrimaryKeyFormat};
/// use dbcrypt::store::MemoryStore;
///
/// struct User { id: u64, ssn: Option<String> }
///
/// impl EncryptedModel for User {
///     const TABLE: &'static str = "users";
///     const ENCRYPTED_ATTRIBUTES: &'static [&'static str] = &["ssn"];
///     fn object_id(&self) -> Option<ObjectId> { Some(ObjectId::Int(self.id)) }
///     fn get_attribute(&self, name: &str) -> Option<&str> {
///         (name == "ssn").then(|| self.ssn.as_deref()).flatten()
///     }
///     fn set_attribute(&mut self, name: &str, value: Option<String>) {
///         if name == "ssn" { self.ssn = value; }
///     }
/// }
///
/// # fn main() -> Result<(), dbcrypt::error::Error> {
/// let cipher = CipherEngine::new("base-key");
/// let store = MemoryStore::new(PrimaryKeyFormat::Int);
///
/// let mut user = User { id: 1, ssn: Some("123-45-6789".into()) };
/// let mut orchestrator = EncryptionOrchestrator::new(&cipher, &store);
/// orchestrator.set_model(&mut user, &NoSchema)?.encrypt_all()?;
/// # Ok(())
/// # }
/// ```
pub struct EncryptionOrchestrator<'a, S: AttributeStore + ?Sized, M: EncryptedModel> {
    cipher: &'a CipherEngine,
    store: &'a S,
    bound: Option<Bound<'a, M>>,
}

impl<'a, S: AttributeStore + ?Sized, M: EncryptedModel> EncryptionOrchestrator<'a, S, M> {
    /// Creates an unbound orchestrator.
    #[must_use]
    pub const fn new(cipher: &'a CipherEngine, store: &'a S) -> Self {
        Self { cipher, store, bound: None }
    }

    /// Binds a model.
    ///
    /// # Errors
    ///
    /// - `Error::SchemaConflict` if a declared attribute is a real column of
    ///   the model's table; nothing is written in that case
    /// - `Error::MissingObjectId` if the model has no primary key
    /// - `Error::Store` if the schema cannot be inspected or the key does not
    ///   match the store's primary key format
    pub fn set_model(
        &mut self,
        model: &'a mut M,
        schema: &dyn SchemaInspector,
    ) -> Result<&mut Self> {
        let object_type = M::TABLE.to_string();

        for attribute in M::ENCRYPTED_ATTRIBUTES {
            if schema.has_column(&object_type, attribute)? {
                return Err(Error::SchemaConflict {
                    attribute: (*attribute).to_string(),
                    table: object_type,
                });
            }
        }

        let object_id =
            model.object_id().ok_or_else(|| Error::MissingObjectId { table: object_type.clone() })?;
        object_id.expect_format(self.store.primary_key_format())?;

        debug!(
            table = %object_type,
            %object_id,
            attributes = ?M::ENCRYPTED_ATTRIBUTES,
            "model bound"
        );
        self.bound = Some(Bound { model, object_type, object_id });
        Ok(self)
    }

    /// Returns true once a model is bound.
    #[must_use]
    pub const fn is_model_defined(&self) -> bool {
        self.bound.is_some()
    }

    /// Returns the bound model.
    #[must_use]
    pub fn model(&self) -> Option<&M> {
        self.bound.as_ref().map(|b| &*b.model)
    }

    /// Releases the bound model, returning the orchestrator to unbound.
    pub fn take_model(&mut self) -> Option<&'a mut M> {
        self.bound.take().map(|b| b.model)
    }

    /// Encrypts every declared attribute.
    ///
    /// # Errors
    ///
    /// See [`encrypt`](Self::encrypt).
    pub fn encrypt_all(&mut self) -> Result<()> {
        self.encrypt(None)
    }

    /// Encrypts one declared attribute.
    ///
    /// # Errors
    ///
    /// See [`encrypt`](Self::encrypt).
    pub fn encrypt_attribute(&mut self, attribute: &str) -> Result<()> {
        self.encrypt(Some(attribute))
    }

    /// Decrypts every declared attribute.
    ///
    /// # Errors
    ///
    /// See [`decrypt`](Self::decrypt).
    pub fn decrypt_all(&mut self) -> Result<()> {
        self.decrypt(None)
    }

    /// Decrypts one declared attribute.
    ///
    /// # Errors
    ///
    /// See [`decrypt`](Self::decrypt).
    pub fn decrypt_attribute(&mut self, attribute: &str) -> Result<()> {
        self.decrypt(Some(attribute))
    }

    fn applicable(attribute: Option<&str>) -> Result<Vec<&'static str>> {
        match attribute {
            None => Ok(M::ENCRYPTED_ATTRIBUTES.to_vec()),
            Some(name) => M::ENCRYPTED_ATTRIBUTES
                .iter()
                .find(|declared| **declared == name)
                .map(|declared| vec![*declared])
                .ok_or_else(|| Error::UndefinedAttribute(name.to_string())),
        }
    }

    /// Writes the model's current values to the store.
    ///
    /// Attributes absent from the model's raw attribute set are skipped. An
    /// empty or `None` value hard-deletes the stored record; anything else is
    /// upserted as `{hash_index, encrypted_value}`. The model is not mutated.
    ///
    /// # Errors
    ///
    /// - `Error::UndefinedAttribute` if `attribute` is not declared
    /// - `Error::ModelNotBound` if no model is bound
    /// - cipher and store errors, unchanged
    pub fn encrypt(&mut self, attribute: Option<&str>) -> Result<()> {
        let attributes = Self::applicable(attribute)?;
        let bound = self.bound.as_ref().ok_or(Error::ModelNotBound)?;

        for name in attributes {
            if !bound.model.has_attribute(name) {
                continue;
            }
            let key = AttributeKey::new(bound.object_type.as_str(), bound.object_id.clone(), name);

            match bound.model.get_attribute(name) {
                Some(value) if !value.is_empty() => {
                    let envelope = self.cipher.encrypt(Some(value), None)?;
                    self.store.upsert(&key, &CipherEngine::hash(value), &envelope)?;
                    debug!(table = %bound.object_type, attribute = name, "attribute encrypted");
                }
                _ => {
                    let removed = self.store.delete(&key)?;
                    debug!(
                        table = %bound.object_type,
                        attribute = name,
                        removed,
                        "attribute cleared"
                    );
                }
            }
        }
        Ok(())
    }

    /// Loads stored values into the model.
    ///
    /// A missing record assigns `None`, clearing stale in-memory state. The
    /// store is never written.
    ///
    /// # Errors
    ///
    /// - `Error::UndefinedAttribute` if `attribute` is not declared
    /// - `Error::ModelNotBound` if no model is bound
    /// - cipher and store errors, unchanged
    pub fn decrypt(&mut self, attribute: Option<&str>) -> Result<()> {
        let attributes = Self::applicable(attribute)?;
        let bound = self.bound.as_mut().ok_or(Error::ModelNotBound)?;

        for name in attributes {
            let key = AttributeKey::new(bound.object_type.as_str(), bound.object_id.clone(), name);
            let record = self.store.find(&key)?;

            match record.and_then(|r| r.encrypted_value).filter(|v| !v.is_empty()) {
                Some(envelope) => {
                    let plaintext = self.cipher.decrypt(Some(&envelope), None)?;
                    bound.model.set_attribute(name, Some(plaintext));
                    debug!(table = %bound.object_type, attribute = name, "attribute decrypted");
                }
                None => {
                    bound.model.set_attribute(name, None);
                    debug!(table = %bound.object_type, attribute = name, "attribute not stored");
                }
            }
        }
        Ok(())
    }
}

/// Plaintext held between `before_save` and `after_save`.
///
/// Values are zeroized when dropped.
#[derive(Default)]
pub struct PendingAttributes {
    values: Vec<(&'static str, Option<Zeroizing<String>>)>,
}

impl PendingAttributes {
    /// Returns true if no attribute was extracted.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns the number of extracted attributes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns the extracted attribute names.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.values.iter().map(|(name, _)| *name)
    }
}

impl std::fmt::Debug for PendingAttributes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Lifecycle hook points a host repository invokes around its own I/O.
pub trait LifecycleHooks<M: EncryptedModel> {
    /// Runs after the primary row has been loaded.
    ///
    /// # Errors
    ///
    /// Propagates orchestrator errors.
    fn after_load(&self, model: &mut M) -> Result<()>;

    /// Runs before the primary row is written; strips encrypted attributes.
    fn before_save(&self, model: &mut M) -> PendingAttributes;

    /// Runs after the primary row is durably written.
    ///
    /// # Errors
    ///
    /// Propagates orchestrator errors.
    fn after_save(&self, model: &mut M, pending: PendingAttributes) -> Result<()>;

    /// Runs after the primary row has been deleted.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    fn after_delete(&self, model: &M) -> Result<usize>;
}

/// Default lifecycle implementation over a cipher, a store and the host
/// schema.
pub struct EncryptionHooks<'a, S: AttributeStore + ?Sized> {
    cipher: &'a CipherEngine,
    store: &'a S,
    schema: &'a dyn SchemaInspector,
}

impl<'a, S: AttributeStore + ?Sized> EncryptionHooks<'a, S> {
    /// Creates the hooks.
    #[must_use]
    pub fn new(cipher: &'a CipherEngine, store: &'a S, schema: &'a dyn SchemaInspector) -> Self {
        Self { cipher, store, schema }
    }

    /// Returns the ids of `M` rows whose `attribute` equals `plaintext`.
    ///
    /// Exact match on the hash index only; nothing is decrypted.
    ///
    /// # Errors
    ///
    /// - `Error::UndefinedAttribute` if `M` does not declare `attribute`
    /// - `Error::Store` on backend failure
    pub fn where_encrypted<M: EncryptedModel>(
        &self,
        attribute: &str,
        plaintext: &str,
    ) -> Result<Vec<ObjectId>> {
        if !M::ENCRYPTED_ATTRIBUTES.contains(&attribute) {
            return Err(Error::UndefinedAttribute(attribute.to_string()));
        }
        let hash = CipherEngine::hash(plaintext);
        Ok(self.store.object_ids_by_hash(M::TABLE, attribute, &hash)?)
    }

    /// Returns the id of the first `M` row whose `attribute` equals
    /// `plaintext`.
    ///
    /// # Errors
    ///
    /// See [`where_encrypted`](Self::where_encrypted).
    pub fn find_encrypted<M: EncryptedModel>(
        &self,
        attribute: &str,
        plaintext: &str,
    ) -> Result<Option<ObjectId>> {
        if !M::ENCRYPTED_ATTRIBUTES.contains(&attribute) {
            return Err(Error::UndefinedAttribute(attribute.to_string()));
        }
        let hash = CipherEngine::hash(plaintext);
        Ok(self.store.find_by_hash(M::TABLE, attribute, &hash)?.map(|r| r.object_id))
    }
}

impl<S: AttributeStore + ?Sized, M: EncryptedModel> LifecycleHooks<M> for EncryptionHooks<'_, S> {
    fn after_load(&self, model: &mut M) -> Result<()> {
        if M::ENCRYPTED_ATTRIBUTES.is_empty() {
            return Ok(());
        }
        let mut orchestrator = EncryptionOrchestrator::new(self.cipher, self.store);
        orchestrator.set_model(model, self.schema)?.decrypt_all()
    }

    fn before_save(&self, model: &mut M) -> PendingAttributes {
        let mut pending = PendingAttributes::default();
        for name in M::ENCRYPTED_ATTRIBUTES {
            if model.has_attribute(name) {
                pending.values.push((*name, model.take_attribute(name).map(Zeroizing::new)));
            }
        }
        pending
    }

    fn after_save(&self, model: &mut M, pending: PendingAttributes) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        // every value is back on the model before anything can fail
        for (name, value) in &pending.values {
            model.set_attribute(name, value.as_ref().map(|v| v.as_str().to_owned()));
        }

        let mut orchestrator = EncryptionOrchestrator::new(self.cipher, self.store);
        let orchestrator = orchestrator.set_model(model, self.schema)?;
        for name in pending.names() {
            orchestrator.encrypt_attribute(name)?;
        }
        Ok(())
    }

    fn after_delete(&self, model: &M) -> Result<usize> {
        if M::ENCRYPTED_ATTRIBUTES.is_empty() {
            return Ok(0);
        }
        let table = M::TABLE;
        let object_id =
            model.object_id().ok_or_else(|| Error::MissingObjectId { table: table.to_string() })?;
        let removed = self.store.delete_object(table, &object_id)?;
        debug!(table, %object_id, removed, "attribute records removed with row");
        Ok(removed)
    }
}
