//! SQLite attribute store for `dbcrypt`.
//!
//! [`SqliteStore`] keeps the side table in an SQLite database shared with the
//! host application. The connection sits behind an `Arc<Mutex<_>>` so the
//! host can issue its own queries on the same database, and the store also
//! serves as the [`SchemaInspector`] and [`RowLookup`] for that database.
//!
//! ```rust,ignore
//! use dbcrypt::record::PrimaryKeyFormat;
//! use dbcrypt_sqlite::SqliteStore;
//!
//! let store = SqliteStore::open("app.db", PrimaryKeyFormat::Int)?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]

mod schema;

pub use schema::TABLE;

use chrono::{DateTime, SecondsFormat, Utc};
use dbcrypt::error::StoreError;
use dbcrypt::model::{RowLookup, SchemaInspector};
use dbcrypt::record::{
    validate_payload, AttributeKey, AttributeRecord, ObjectId, PrimaryKeyFormat, RecordId,
};
use dbcrypt::store::{AttributeStore, ScanFilter};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

const COLUMNS: &str =
    "id, object_type, object_id, attribute, hash_index, encrypted_value, created_at, updated_at";

/// Ids per `DELETE ... IN (...)` statement, below SQLite's parameter limit.
const DELETE_CHUNK: usize = 500;

fn backend(err: rusqlite::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

/// Attribute store backed by an SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    format: PrimaryKeyFormat,
    primary_key_column: String,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("format", &self.format)
            .field("primary_key_column", &self.primary_key_column)
            .finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and migrates the
    /// side table.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the database cannot be opened, or
    /// `StoreError::KeyFormatMismatch` if the existing side table was created
    /// for a different key format.
    pub fn open(path: impl AsRef<Path>, format: PrimaryKeyFormat) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(backend)?;
        conn.busy_timeout(Duration::from_secs(5)).map_err(backend)?;
        debug!(path = %path.display(), format = %format, "opened attribute store");
        Self::with_connection(Arc::new(Mutex::new(conn)), format)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if SQLite fails.
    pub fn open_in_memory(format: PrimaryKeyFormat) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(backend)?;
        Self::with_connection(Arc::new(Mutex::new(conn)), format)
    }

    /// Wraps a connection shared with the host application.
    ///
    /// # Errors
    ///
    /// Returns the migration errors of [`SqliteStore::open`].
    pub fn with_connection(
        conn: Arc<Mutex<Connection>>,
        format: PrimaryKeyFormat,
    ) -> Result<Self, StoreError> {
        let store = Self { conn, format, primary_key_column: "id".to_string() };
        schema::migrate(&*store.lock()?, format)?;
        Ok(store)
    }

    /// Sets the primary key column looked up in host tables (default `id`).
    ///
    /// # Errors
    ///
    /// Returns `StoreError::InvalidIdentifier` for an unsafe column name.
    pub fn primary_key_column(mut self, column: impl Into<String>) -> Result<Self, StoreError> {
        let column = column.into();
        schema::validate_identifier(&column)?;
        self.primary_key_column = column;
        Ok(self)
    }

    /// Returns the shared connection.
    #[must_use]
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|e| StoreError::Backend(e.to_string()))
    }

    fn query_records(
        &self,
        sql: &str,
        params: &[Value],
    ) -> Result<Vec<AttributeRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(sql).map_err(backend)?;
        let rows = stmt
            .query_map(params_from_iter(params.iter()), RawRecord::read)
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;
        rows.into_iter().map(|raw| raw.into_record(self.format)).collect()
    }
}

struct RawRecord {
    id: RecordId,
    object_type: String,
    object_id: Value,
    attribute: String,
    hash_index: Option<String>,
    encrypted_value: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRecord {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            object_type: row.get(1)?,
            object_id: row.get(2)?,
            attribute: row.get(3)?,
            hash_index: row.get(4)?,
            encrypted_value: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_record(self, format: PrimaryKeyFormat) -> Result<AttributeRecord, StoreError> {
        Ok(AttributeRecord {
            id: self.id,
            object_type: self.object_type,
            object_id: decode_object_id(self.object_id, format)?,
            attribute: self.attribute,
            hash_index: self.hash_index,
            encrypted_value: self.encrypted_value,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn encode_object_id(id: &ObjectId) -> Result<Value, StoreError> {
    match id {
        ObjectId::Int(n) => i64::try_from(*n)
            .map(Value::Integer)
            .map_err(|_| {
                StoreError::InvalidObjectId(format!("{n} exceeds the integer column range"))
            }),
        ObjectId::Text(raw) => Ok(Value::Text(raw.clone())),
    }
}

fn decode_object_id(value: Value, format: PrimaryKeyFormat) -> Result<ObjectId, StoreError> {
    match value {
        Value::Integer(n) => format.parse_id(&n.to_string()),
        Value::Text(raw) => format.parse_id(&raw),
        other => Err(StoreError::InvalidObjectId(format!(
            "unexpected column type {}",
            other.data_type()
        ))),
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("invalid timestamp '{raw}': {e}")))
}

/// Appends `AND` conditions for `filter`, pushing their parameters.
fn filter_clause(filter: &ScanFilter, params: &mut Vec<Value>) -> String {
    let mut clause = String::new();
    if let Some(object_type) = &filter.object_type {
        params.push(Value::Text(object_type.clone()));
        clause.push_str(&format!(" AND object_type = ?{}", params.len()));
    }
    if let Some(attribute) = &filter.attribute {
        params.push(Value::Text(attribute.clone()));
        clause.push_str(&format!(" AND attribute = ?{}", params.len()));
    }
    clause
}

impl AttributeStore for SqliteStore {
    fn primary_key_format(&self) -> PrimaryKeyFormat {
        self.format
    }

    fn find(&self, key: &AttributeKey) -> Result<Option<AttributeRecord>, StoreError> {
        let params = [
            Value::Text(key.object_type().to_string()),
            encode_object_id(key.object_id())?,
            Value::Text(key.attribute().to_string()),
        ];
        let mut records = self.query_records(
            &format!(
                "SELECT {COLUMNS} FROM {TABLE}
                 WHERE object_type = ?1 AND object_id = ?2 AND attribute = ?3"
            ),
            &params,
        )?;
        Ok(records.pop())
    }

    fn find_by_hash(
        &self,
        object_type: &str,
        attribute: &str,
        hash_index: &str,
    ) -> Result<Option<AttributeRecord>, StoreError> {
        let params = [
            Value::Text(object_type.to_string()),
            Value::Text(attribute.to_string()),
            Value::Text(hash_index.to_string()),
        ];
        let mut records = self.query_records(
            &format!(
                "SELECT {COLUMNS} FROM {TABLE}
                 WHERE object_type = ?1 AND attribute = ?2 AND hash_index = ?3
                 ORDER BY id LIMIT 1"
            ),
            &params,
        )?;
        Ok(records.pop())
    }

    fn object_ids_by_hash(
        &self,
        object_type: &str,
        attribute: &str,
        hash_index: &str,
    ) -> Result<Vec<ObjectId>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT object_id FROM {TABLE}
                 WHERE object_type = ?1 AND attribute = ?2 AND hash_index = ?3
                 ORDER BY id"
            ))
            .map_err(backend)?;
        let values = stmt
            .query_map(params![object_type, attribute, hash_index], |row| row.get::<_, Value>(0))
            .map_err(backend)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(backend)?;
        values.into_iter().map(|v| decode_object_id(v, self.format)).collect()
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

        let object_id = encode_object_id(key.object_id())?;
        let now = timestamp(Utc::now());
        let raw = {
            let conn = self.lock()?;
            conn.query_row(
                &format!(
                    "INSERT INTO {TABLE}
                        (object_type, object_id, attribute, hash_index, encrypted_value, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                     ON CONFLICT (object_type, object_id, attribute) DO UPDATE SET
                        hash_index = excluded.hash_index,
                        encrypted_value = excluded.encrypted_value,
                        updated_at = excluded.updated_at
                     RETURNING {COLUMNS}"
                ),
                params![
                    key.object_type(),
                    object_id,
                    key.attribute(),
                    hash_index,
                    encrypted_value,
                    now
                ],
                RawRecord::read,
            )
            .map_err(backend)?
        };
        raw.into_record(self.format)
    }

    fn update_payload(
        &self,
        id: RecordId,
        hash_index: &str,
        encrypted_value: &str,
    ) -> Result<(), StoreError> {
        validate_payload(hash_index, encrypted_value)?;
        let conn = self.lock()?;
        let changed = conn
            .execute(
                &format!(
                    "UPDATE {TABLE} SET hash_index = ?1, encrypted_value = ?2, updated_at = ?3
                     WHERE id = ?4"
                ),
                params![hash_index, encrypted_value, timestamp(Utc::now()), id],
            )
            .map_err(backend)?;
        if changed == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    fn delete(&self, key: &AttributeKey) -> Result<bool, StoreError> {
        let object_id = encode_object_id(key.object_id())?;
        let conn = self.lock()?;
        let removed = conn
            .execute(
                &format!(
                    "DELETE FROM {TABLE} WHERE object_type = ?1 AND object_id = ?2 AND attribute = ?3"
                ),
                params![key.object_type(), object_id, key.attribute()],
            )
            .map_err(backend)?;
        Ok(removed > 0)
    }

    fn delete_object(&self, object_type: &str, object_id: &ObjectId) -> Result<usize, StoreError> {
        let object_id = encode_object_id(object_id)?;
        let conn = self.lock()?;
        conn.execute(
            &format!("DELETE FROM {TABLE} WHERE object_type = ?1 AND object_id = ?2"),
            params![object_type, object_id],
        )
        .map_err(backend)
    }

    fn delete_ids(&self, ids: &[RecordId]) -> Result<usize, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(backend)?;
        let mut removed = 0;
        for chunk in ids.chunks(DELETE_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            removed += tx
                .execute(
                    &format!("DELETE FROM {TABLE} WHERE id IN ({placeholders})"),
                    params_from_iter(chunk.iter()),
                )
                .map_err(backend)?;
        }
        tx.commit().map_err(backend)?;
        Ok(removed)
    }

    fn count(&self, filter: &ScanFilter) -> Result<u64, StoreError> {
        let mut params = Vec::new();
        let clause = filter_clause(filter, &mut params);
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {TABLE} WHERE 1 = 1{clause}"),
                params_from_iter(params.iter()),
                |row| row.get(0),
            )
            .map_err(backend)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    fn page(
        &self,
        filter: &ScanFilter,
        after: Option<RecordId>,
        limit: usize,
    ) -> Result<Vec<AttributeRecord>, StoreError> {
        let mut params = vec![Value::Integer(after.unwrap_or(0))];
        let clause = filter_clause(filter, &mut params);
        params.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
        self.query_records(
            &format!(
                "SELECT {COLUMNS} FROM {TABLE} WHERE id > ?1{clause} ORDER BY id LIMIT ?{}",
                params.len()
            ),
            &params,
        )
    }
}

impl SchemaInspector for SqliteStore {
    fn has_column(&self, table: &str, column: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info(?1) WHERE name = ?2",
                params![table, column],
                |row| row.get(0),
            )
            .map_err(backend)?;
        Ok(count > 0)
    }
}

impl RowLookup for SqliteStore {
    fn row_exists(&self, table: &str, id: &ObjectId) -> Result<bool, StoreError> {
        schema::validate_identifier(table)?;
        let id = encode_object_id(id)?;
        let conn = self.lock()?;
        conn.query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM \"{table}\" WHERE \"{pk}\" = ?1)",
                pk = self.primary_key_column
            ),
            [id],
            |row| row.get::<_, bool>(0),
        )
        .map_err(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbcrypt::record::MAX_NAME_LEN;
    use uuid::Uuid;

    fn hash(c: char) -> String {
        c.to_string().repeat(64)
    }

    fn int_store() -> SqliteStore {
        SqliteStore::open_in_memory(PrimaryKeyFormat::Int).unwrap()
    }

    #[test]
    fn test_upsert_and_find() {
        let store = int_store();
        let key = AttributeKey::new("users", ObjectId::Int(7), "ssn");

        let first = store.upsert(&key, &hash('a'), "one").unwrap();
        let second = store.upsert(&key, &hash('b'), "two").unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        let found = store.find(&key).unwrap().unwrap();
        assert_eq!(found.encrypted_value.as_deref(), Some("two"));
        assert_eq!(found.object_id, ObjectId::Int(7));
        assert_eq!(store.count(&ScanFilter::all()).unwrap(), 1);
    }

    #[test]
    fn test_uuid_keys() {
        let store = SqliteStore::open_in_memory(PrimaryKeyFormat::Uuid).unwrap();
        let id = Uuid::new_v4();
        let key = AttributeKey::new("users", ObjectId::from(id), "ssn");
        store.upsert(&key, &hash('a'), "x").unwrap();

        let found = store.find(&key).unwrap().unwrap();
        assert_eq!(found.object_id, ObjectId::from(id));
        assert!(matches!(
            store.upsert(&AttributeKey::new("users", ObjectId::Int(1), "ssn"), &hash('a'), "x"),
            Err(StoreError::KeyFormatMismatch { .. })
        ));
    }

    #[test]
    fn test_rejects_long_names_and_bad_hash() {
        let store = int_store();
        let long = "x".repeat(MAX_NAME_LEN + 1);
        assert!(matches!(
            store.upsert(&AttributeKey::new(long, ObjectId::Int(1), "ssn"), &hash('a'), "x"),
            Err(StoreError::ValueTooLong { .. })
        ));
        let key = AttributeKey::new("users", ObjectId::Int(1), "ssn");
        assert!(store.upsert(&key, "abc", "x").is_err());
    }

    #[test]
    fn test_hash_lookup_order() {
        let store = int_store();
        for id in [3, 1, 2] {
            let key = AttributeKey::new("users", ObjectId::Int(id), "ssn");
            store.upsert(&key, &hash('a'), "x").unwrap();
        }
        let first = store.find_by_hash("users", "ssn", &hash('a')).unwrap().unwrap();
        assert_eq!(first.object_id, ObjectId::Int(3));
        assert_eq!(
            store.object_ids_by_hash("users", "ssn", &hash('a')).unwrap(),
            vec![ObjectId::Int(3), ObjectId::Int(1), ObjectId::Int(2)]
        );
        assert!(store.find_by_hash("users", "ssn", &hash('b')).unwrap().is_none());
    }

    #[test]
    fn test_page_and_count_with_filter() {
        let store = int_store();
        for id in 1..=5 {
            let table = if id % 2 == 0 { "users" } else { "orders" };
            let key = AttributeKey::new(table, ObjectId::Int(id), "ssn");
            store.upsert(&key, &hash('a'), "x").unwrap();
        }
        let filter = ScanFilter::all().object_type("orders");
        assert_eq!(store.count(&filter).unwrap(), 3);

        let first = store.page(&filter, None, 2).unwrap();
        assert_eq!(first.len(), 2);
        let rest = store.page(&filter, first.last().map(|r| r.id), 2).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].object_id, ObjectId::Int(5));

        let all: Vec<_> =
            store.scan(&ScanFilter::all(), 2).records().collect::<Result<_, _>>().unwrap();
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn test_deletes() {
        let store = int_store();
        let slot = |id, attribute| AttributeKey::new("users", ObjectId::Int(id), attribute);
        let a = store.upsert(&slot(1, "ssn"), &hash('a'), "x").unwrap();
        store.upsert(&slot(1, "card"), &hash('a'), "x").unwrap();
        let c = store.upsert(&slot(2, "ssn"), &hash('a'), "x").unwrap();

        assert!(store.delete(&a.key()).unwrap());
        assert!(!store.delete(&a.key()).unwrap());
        assert_eq!(store.delete_object("users", &ObjectId::Int(1)).unwrap(), 1);
        assert_eq!(store.delete_ids(&[c.id, 999]).unwrap(), 1);
        assert_eq!(store.delete_ids(&[]).unwrap(), 0);
        assert_eq!(store.count(&ScanFilter::all()).unwrap(), 0);
    }

    #[test]
    fn test_delete_ids_across_chunks() {
        let store = int_store();
        let ids: Vec<_> = (1..=(DELETE_CHUNK as u64 + 20))
            .map(|id| {
                store
                    .upsert(&AttributeKey::new("users", ObjectId::Int(id), "ssn"), &hash('a'), "x")
                    .unwrap()
                    .id
            })
            .collect();
        assert_eq!(store.delete_ids(&ids).unwrap(), ids.len());
    }

    #[test]
    fn test_update_payload() {
        let store = int_store();
        let record = store
            .upsert(&AttributeKey::new("users", ObjectId::Int(1), "ssn"), &hash('a'), "x")
            .unwrap();
        store.update_payload(record.id, &hash('b'), "y").unwrap();
        let found = store.find(&record.key()).unwrap().unwrap();
        assert_eq!(found.hash_index, Some(hash('b')));
        assert!(matches!(
            store.update_payload(404, &hash('b'), "y"),
            Err(StoreError::NotFound(404))
        ));
    }

    #[test]
    fn test_schema_inspector_and_row_lookup() {
        let store = int_store();
        store
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
                 INSERT INTO users (id, name) VALUES (1, 'a');",
            )
            .unwrap();

        assert!(store.has_column("users", "name").unwrap());
        assert!(!store.has_column("users", "ssn").unwrap());
        assert!(!store.has_column("missing", "ssn").unwrap());

        assert!(store.row_exists("users", &ObjectId::Int(1)).unwrap());
        assert!(!store.row_exists("users", &ObjectId::Int(2)).unwrap());
        assert!(matches!(
            store.row_exists("missing", &ObjectId::Int(1)),
            Err(StoreError::Backend(_))
        ));
        assert!(matches!(
            store.row_exists("users\" --", &ObjectId::Int(1)),
            Err(StoreError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_custom_primary_key_column() {
        let store = int_store().primary_key_column("user_id").unwrap();
        store
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TABLE members (user_id INTEGER PRIMARY KEY);
                 INSERT INTO members VALUES (5);",
            )
            .unwrap();
        assert!(store.row_exists("members", &ObjectId::Int(5)).unwrap());
        assert!(int_store().primary_key_column("bad column").is_err());
    }

    #[test]
    fn test_string_keys_matched_verbatim() {
        let store = SqliteStore::open_in_memory(PrimaryKeyFormat::Uuid).unwrap();
        let upper = Uuid::new_v4().hyphenated().to_string().to_uppercase();
        let custom = "order-0000-0000-0000-0000-0000000001";
        store
            .lock()
            .unwrap()
            .execute("CREATE TABLE documents (id CHAR(36) PRIMARY KEY)", [])
            .unwrap();
        for id in [upper.as_str(), custom] {
            store.lock().unwrap().execute("INSERT INTO documents VALUES (?1)", [id]).unwrap();
        }

        for id in [upper.as_str(), custom] {
            let object_id = ObjectId::text(id).unwrap();
            assert!(store.row_exists("documents", &object_id).unwrap());

            let key = AttributeKey::new("documents", object_id.clone(), "body");
            store.upsert(&key, &hash('a'), "x").unwrap();
            assert_eq!(store.find(&key).unwrap().unwrap().object_id, object_id);
        }
        let lower = ObjectId::text(upper.to_lowercase()).unwrap();
        assert!(!store.row_exists("documents", &lower).unwrap());
        assert!(store.find(&AttributeKey::new("documents", lower, "body")).unwrap().is_none());
    }

    #[test]
    fn test_reopen_file_with_other_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        SqliteStore::open(&path, PrimaryKeyFormat::Int).unwrap();
        assert!(matches!(
            SqliteStore::open(&path, PrimaryKeyFormat::Uuid),
            Err(StoreError::KeyFormatMismatch { .. })
        ));
    }
}
