//! Attribute store abstraction.
//!
//! The store is the only component allowed to read or write side-table rows.
//! Backends implement [`AttributeStore`]; batch jobs read through
//! [`AttributeStore::scan`], which pages by surrogate id so records are
//! visited in insertion order and in-place updates never shift a page.

mod memory;

pub use memory::MemoryStore;

use crate::error::StoreError;
use crate::record::{AttributeKey, AttributeRecord, ObjectId, PrimaryKeyFormat, RecordId};

/// Default number of records fetched per page.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Optional restriction of a scan to one collection and/or attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanFilter {
    /// Only records of this host collection.
    pub object_type: Option<String>,
    /// Only records of this attribute.
    pub attribute: Option<String>,
}

impl ScanFilter {
    /// Matches every record.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Restricts the filter to one host collection.
    #[must_use]
    pub fn object_type(mut self, object_type: impl Into<String>) -> Self {
        self.object_type = Some(object_type.into());
        self
    }

    /// Restricts the filter to one attribute.
    #[must_use]
    pub fn attribute(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }

    /// Returns true if `record` passes the filter.
    #[must_use]
    pub fn matches(&self, record: &AttributeRecord) -> bool {
        self.object_type.as_deref().map_or(true, |t| t == record.object_type)
            && self.attribute.as_deref().map_or(true, |a| a == record.attribute)
    }
}

/// Persistence operations over attribute records.
///
/// Implementations must be thread-safe (`Send + Sync`). Concurrent writers to
/// the same natural key resolve as last-writer-wins; each single upsert or
/// delete is atomic.
pub trait AttributeStore: Send + Sync {
    /// Returns the primary key format the side table was created with.
    fn primary_key_format(&self) -> PrimaryKeyFormat;

    /// Looks up a record by natural key.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    fn find(&self, key: &AttributeKey) -> Result<Option<AttributeRecord>, StoreError>;

    /// Returns the first record (lowest id) whose hash index matches.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    fn find_by_hash(
        &self,
        object_type: &str,
        attribute: &str,
        hash_index: &str,
    ) -> Result<Option<AttributeRecord>, StoreError>;

    /// Returns the object ids of every record whose hash index matches, in
    /// insertion order.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    fn object_ids_by_hash(
        &self,
        object_type: &str,
        attribute: &str,
        hash_index: &str,
    ) -> Result<Vec<ObjectId>, StoreError>;

    /// Creates or overwrites the record for `key`. Never creates duplicates.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if validation or the backend fails.
    fn upsert(
        &self,
        key: &AttributeKey,
        hash_index: &str,
        encrypted_value: &str,
    ) -> Result<AttributeRecord, StoreError>;

    /// Overwrites the payload of an existing record addressed by id.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if no such record exists.
    fn update_payload(
        &self,
        id: RecordId,
        hash_index: &str,
        encrypted_value: &str,
    ) -> Result<(), StoreError>;

    /// Deletes the record for `key`. Returns whether a record was removed;
    /// deleting an absent slot is not an error.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    fn delete(&self, key: &AttributeKey) -> Result<bool, StoreError>;

    /// Deletes every record of one host row. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    fn delete_object(&self, object_type: &str, object_id: &ObjectId) -> Result<usize, StoreError>;

    /// Deletes records by surrogate id. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    fn delete_ids(&self, ids: &[RecordId]) -> Result<usize, StoreError>;

    /// Counts records matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    fn count(&self, filter: &ScanFilter) -> Result<u64, StoreError>;

    /// Returns up to `limit` matching records with id greater than `after`,
    /// ordered by id.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the backend fails.
    fn page(
        &self,
        filter: &ScanFilter,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<AttributeRecord>, StoreError>;

    /// Lazily iterates matching records in batches of `batch_size`.
    fn scan<'a>(&'a self, filter: &ScanFilter, batch_size: usize) -> Scan<'a, Self>
    where
        Self: Sized,
    {
        Scan::new(self, filter.clone(), batch_size)
    }
}

/// Lazy, finite iterator over store pages.
///
/// Each item is one batch. A backend failure is yielded once and ends the
/// iteration. Starting a new scan restarts from the first record.
pub struct Scan<'a, S: AttributeStore + ?Sized> {
    store: &'a S,
    filter: ScanFilter,
    batch_size: usize,
    cursor: Option<RecordId>,
    done: bool,
}

impl<'a, S: AttributeStore + ?Sized> Scan<'a, S> {
    /// Creates a scan over `store`. A zero batch size is raised to one.
    pub fn new(store: &'a S, filter: ScanFilter, batch_size: usize) -> Self {
        Self { store, filter, batch_size: batch_size.max(1), cursor: None, done: false }
    }

    /// Flattens the batches into individual records.
    pub fn records(self) -> impl Iterator<Item = Result<AttributeRecord, StoreError>> + 'a
    where
        S: 'a,
    {
        self.flat_map(|batch| match batch {
            Ok(records) => records.into_iter().map(Ok).collect::<Vec<_>>(),
            Err(err) => vec![Err(err)],
        })
    }
}

impl<S: AttributeStore + ?Sized> Iterator for Scan<'_, S> {
    type Item = Result<Vec<AttributeRecord>, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.store.page(&self.filter, self.cursor, self.batch_size) {
            Ok(records) if records.is_empty() => {
                self.done = true;
                None
            }
            Ok(records) => {
                if records.len() < self.batch_size {
                    self.done = true;
                }
                self.cursor = records.last().map(|r| r.id);
                Some(Ok(records))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
