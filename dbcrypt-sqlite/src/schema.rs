//! Side-table DDL and schema checks.

use dbcrypt::error::StoreError;
use dbcrypt::record::PrimaryKeyFormat;
use rusqlite::Connection;

/// Name of the side table.
pub const TABLE: &str = "encrypted_attributes";

fn object_id_column(format: PrimaryKeyFormat) -> &'static str {
    match format {
        PrimaryKeyFormat::Int => "INTEGER NOT NULL CHECK (object_id >= 0)",
        PrimaryKeyFormat::Uuid => "CHAR(36) NOT NULL",
    }
}

/// Creates the side table and its indexes if missing, then checks that an
/// existing table was created for the same key format.
pub fn migrate(conn: &Connection, format: PrimaryKeyFormat) -> Result<(), StoreError> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {TABLE} (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            object_type VARCHAR(64) NOT NULL,
            object_id {object_id},
            attribute VARCHAR(64) NOT NULL,
            hash_index CHAR(64),
            encrypted_value TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (object_type, object_id, attribute)
        );
        CREATE INDEX IF NOT EXISTS {TABLE}_search
            ON {TABLE} (object_type, attribute, hash_index);",
        object_id = object_id_column(format),
    ))
    .map_err(|e| StoreError::Backend(e.to_string()))?;

    let declared: String = conn
        .query_row(
            &format!("SELECT type FROM pragma_table_info('{TABLE}') WHERE name = 'object_id'"),
            [],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Backend(e.to_string()))?;

    let existing = if declared.eq_ignore_ascii_case("INTEGER") {
        PrimaryKeyFormat::Int
    } else {
        PrimaryKeyFormat::Uuid
    };
    if existing == format {
        Ok(())
    } else {
        Err(StoreError::KeyFormatMismatch { expected: format.as_str(), actual: existing.as_str() })
    }
}

/// Rejects anything but ASCII letters, digits and underscores.
pub fn validate_identifier(name: &str) -> Result<(), StoreError> {
    let valid = !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidIdentifier(name.to_string()))
    }
}
