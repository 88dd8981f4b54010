//! Database schema definitions

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use tracing::info;

use super::diesel_schema::schema_version;
use crate::error::StorageError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &mut SqliteConnection) -> Result<(), StorageError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new ledger schema v{}", SCHEMA_VERSION);
        conn.batch_execute(LEDGER_SCHEMA)
            .map_err(|e| StorageError::Internal(format!("Failed to create ledger tables: {}", e)))?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating ledger schema from v{} to v{}", current_version, SCHEMA_VERSION);
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else {
        info!("Ledger schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &mut SqliteConnection) -> Result<i32, StorageError> {
    conn.batch_execute("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY NOT NULL)")
        .map_err(|e| StorageError::Internal(format!("Failed to create schema_version table: {}", e)))?;

    let version: Option<i32> = schema_version::table
        .select(schema_version::version)
        .first(conn)
        .optional()
        .map_err(StorageError::from_diesel)?;

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &mut SqliteConnection, version: i32) -> Result<(), StorageError> {
    diesel::delete(schema_version::table)
        .execute(conn)
        .map_err(StorageError::from_diesel)?;
    diesel::insert_into(schema_version::table)
        .values(schema_version::version.eq(version))
        .execute(conn)
        .map_err(StorageError::from_diesel)?;
    Ok(())
}

/// Row and list tables shared by every logical table
const LEDGER_SCHEMA: &str = r#"
-- Upserted rows: one row per (keyspace, table, partition, clustering)
CREATE TABLE IF NOT EXISTS ledger_rows (
    keyspace TEXT NOT NULL,
    table_name TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    clustering_key TEXT NOT NULL,
    payload TEXT NOT NULL,
    written_at TEXT NOT NULL,
    PRIMARY KEY (keyspace, table_name, partition_key, clustering_key)
);

-- Appended list cells: never updated, never de-duplicated
CREATE TABLE IF NOT EXISTS ledger_lists (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    keyspace TEXT NOT NULL,
    table_name TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    clustering_key TEXT NOT NULL,
    cell TEXT NOT NULL,
    written_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ledger_lists_key
    ON ledger_lists(keyspace, table_name, partition_key, clustering_key, seq);
"#;
