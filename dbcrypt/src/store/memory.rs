//! In-memory attribute store for embedding and tests.

use super::{AttributeStore, ScanFilter};
use crate::error::StoreError;
use crate::record::{
    validate_payload, AttributeKey, AttributeRecord, ObjectId, PrimaryKeyFormat, RecordId,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

struct Inner {
    next_id: RecordId,
    records: BTreeMap<RecordId, AttributeRecord>,
}

/// Attribute store kept in a `Mutex`-guarded ordered map.
pub struct MemoryStore {
    format: PrimaryKeyFormat,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates an empty store for the given primary key format.
    #[must_use]
    pub fn new(format: PrimaryKeyFormat) -> Self {
        Self { format, inner: Mutex::new(Inner { next_id: 1, records: BTreeMap::new() }) }
    }

    /// Returns the number of stored records.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the lock is poisoned.
    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.records.len())
    }

    /// Returns true if the store holds no records.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the lock is poisoned.
    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.lock()?.records.is_empty())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner.lock().map_err(|e| StoreError::Backend(e.to_string()))
    }
}

fn same_slot(record: &AttributeRecord, key: &AttributeKey) -> bool {
    record.object_type == key.object_type()
        && &record.object_id == key.object_id()
        && record.attribute == key.attribute()
}

fn same_hash(record: &AttributeRecord, object_type: &str, attribute: &str, hash: &str) -> bool {
    record.object_type == object_type
        && record.attribute == attribute
        && record.hash_index.as_deref() == Some(hash)
}

impl AttributeStore for MemoryStore {
    fn primary_key_format(&self) -> PrimaryKeyFormat {
        self.format
    }

    fn find(&self, key: &AttributeKey) -> Result<Option<AttributeRecord>, StoreError> {
        let inner = self.lock()?;
        Ok(inner.records.values().find(|r| same_slot(r, key)).cloned())
    }

    fn find_by_hash(
        &self,
        object_type: &str,
        attribute: &str,
        hash_index: &str,
    ) -> Result<Option<AttributeRecord>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .records
            .values()
            .find(|r| same_hash(r, object_type, attribute, hash_index))
            .cloned())
    }

    fn object_ids_by_hash(
        &self,
        object_type: &str,
        attribute: &str,
        hash_index: &str,
    ) -> Result<Vec<ObjectId>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .records
            .values()
            .filter(|r| same_hash(r, object_type, attribute, hash_index))
            .map(|r| r.object_id.clone())
            .collect())
    }

    fn upsert(
        &self,
        key: &AttributeKey,
        hash_index: &str,
        encrypted_value: &str,
    ) -> Result<AttributeRecord, StoreError> {
        key.validate()?;
        key.object_id().expect_format(self.format)?;
        validate_payload(hash_index, encrypted_value)?;

        let mut inner = self.lock()?;
        let now = Utc::now();

        if let Some(record) = inner.records.values_mut().find(|r| same_slot(r, key)) {
            record.hash_index = Some(hash_index.to_string());
            record.encrypted_value = Some(encrypted_value.to_string());
            record.updated_at = now;
            return Ok(record.clone());
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let record = AttributeRecord {
            id,
            object_type: key.object_type().to_string(),
            object_id: key.object_id().clone(),
            attribute: key.attribute().to_string(),
            hash_index: Some(hash_index.to_string()),
            encrypted_value: Some(encrypted_value.to_string()),
            created_at: now,
            updated_at: now,
        };
        inner.records.insert(id, record.clone());
        Ok(record)
    }

    fn update_payload(
        &self,
        id: RecordId,
        hash_index: &str,
        encrypted_value: &str,
    ) -> Result<(), StoreError> {
        validate_payload(hash_index, encrypted_value)?;
        let mut inner = self.lock()?;
        let record = inner.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.hash_index = Some(hash_index.to_string());
        record.encrypted_value = Some(encrypted_value.to_string());
        record.updated_at = Utc::now();
        Ok(())
    }

    fn delete(&self, key: &AttributeKey) -> Result<bool, StoreError> {
        let mut inner = self.lock()?;
        let before = inner.records.len();
        inner.records.retain(|_, r| !same_slot(r, key));
        Ok(inner.records.len() < before)
    }

    fn delete_object(&self, object_type: &str, object_id: &ObjectId) -> Result<usize, StoreError> {
        let mut inner = self.lock()?;
        let before = inner.records.len();
        inner.records.retain(|_, r| !(r.object_type == object_type && &r.object_id == object_id));
        Ok(before - inner.records.len())
    }

    fn delete_ids(&self, ids: &[RecordId]) -> Result<usize, StoreError> {
        let mut inner = self.lock()?;
        Ok(ids.iter().filter(|id| inner.records.remove(*id).is_some()).count())
    }

    fn count(&self, filter: &ScanFilter) -> Result<u64, StoreError> {
        let inner = self.lock()?;
        Ok(inner.records.values().filter(|r| filter.matches(r)).count() as u64)
    }

    fn page(
        &self,
        filter: &ScanFilter,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<AttributeRecord>, StoreError> {
        let inner = self.lock()?;
        let start = after.map_or(RecordId::MIN, |id| id.saturating_add(1));
        Ok(inner
            .records
            .range(start..)
            .map(|(_, r)| r)
            .filter(|r| filter.matches(r))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn hash(c: char) -> String {
        c.to_string().repeat(64)
    }

    fn slot(id: u64, attribute: &str) -> AttributeKey {
        AttributeKey::new("users", ObjectId::Int(id), attribute)
    }

    #[test]
    fn test_upsert_keeps_one_record_per_slot() {
        let store = MemoryStore::new(PrimaryKeyFormat::Int);
        let key = AttributeKey::new("users", ObjectId::Int(1), "ssn");

        let first = store.upsert(&key, &hash('a'), "one").unwrap();
        let second = store.upsert(&key, &hash('b'), "two").unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.len().unwrap(), 1);
        let found = store.find(&key).unwrap().unwrap();
        assert_eq!(found.encrypted_value.as_deref(), Some("two"));
        assert_eq!(found.hash_index, Some(hash('b')));
        assert!(found.updated_at >= found.created_at);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let store = MemoryStore::new(PrimaryKeyFormat::Int);
        let key = AttributeKey::new("users", ObjectId::Int(1), "ssn");
        store.upsert(&key, &hash('a'), "one").unwrap();

        assert!(store.delete(&key).unwrap());
        assert!(!store.delete(&key).unwrap());
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn test_find_by_hash_returns_first_match() {
        let store = MemoryStore::new(PrimaryKeyFormat::Int);
        store.upsert(&slot(1, "ssn"), &hash('a'), "x").unwrap();
        store.upsert(&slot(2, "ssn"), &hash('a'), "y").unwrap();
        store.upsert(&slot(3, "ssn"), &hash('b'), "z").unwrap();

        let found = store.find_by_hash("users", "ssn", &hash('a')).unwrap().unwrap();
        assert_eq!(found.object_id, ObjectId::Int(1));
        assert_eq!(
            store.object_ids_by_hash("users", "ssn", &hash('a')).unwrap(),
            vec![ObjectId::Int(1), ObjectId::Int(2)]
        );
        assert!(store.find_by_hash("users", "email", &hash('a')).unwrap().is_none());
    }

    #[test]
    fn test_rejects_wrong_key_format() {
        let store = MemoryStore::new(PrimaryKeyFormat::Int);
        let key = AttributeKey::new("users", ObjectId::from(Uuid::new_v4()), "ssn");
        assert!(matches!(
            store.upsert(&key, &hash('a'), "x"),
            Err(StoreError::KeyFormatMismatch { .. })
        ));
    }

    #[test]
    fn test_update_payload_missing_record() {
        let store = MemoryStore::new(PrimaryKeyFormat::Int);
        assert!(matches!(store.update_payload(9, &hash('a'), "x"), Err(StoreError::NotFound(9))));
    }

    #[test]
    fn test_delete_object_and_ids() {
        let store = MemoryStore::new(PrimaryKeyFormat::Int);
        let a = store.upsert(&slot(1, "ssn"), &hash('a'), "x");
        store.upsert(&slot(1, "card"), &hash('a'), "x").unwrap();
        store.upsert(&slot(2, "ssn"), &hash('a'), "x").unwrap();

        assert_eq!(store.delete_object("users", &ObjectId::Int(1)).unwrap(), 2);
        assert_eq!(store.delete_ids(&[a.unwrap().id, 3, 99]).unwrap(), 1);
        assert!(store.is_empty().unwrap());
    }
}
