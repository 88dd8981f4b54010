//! Diesel model definitions for the physical tables
//!
//! - Queryable structs: for SELECT queries (reading data)
//! - Insertable structs: for INSERT/REPLACE queries (writing data)

use diesel::prelude::*;

use super::diesel_schema::*;

/// Get current UTC timestamp as ISO 8601 string for SQLite TEXT columns
pub fn current_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Upserted row from SELECT query
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = ledger_rows)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct LedgerRow {
    pub keyspace: String,
    pub table_name: String,
    pub partition_key: String,
    pub clustering_key: String,
    pub payload: String,
    pub written_at: String,
}

/// Row for INSERT OR REPLACE
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = ledger_rows)]
pub struct NewLedgerRow<'a> {
    pub keyspace: &'a str,
    pub table_name: &'a str,
    pub partition_key: &'a str,
    pub clustering_key: &'a str,
    pub payload: &'a str,
    pub written_at: &'a str,
}

/// Appended list cell from SELECT query
#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = ledger_lists)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ListCell {
    pub seq: i32,
    pub keyspace: String,
    pub table_name: String,
    pub partition_key: String,
    pub clustering_key: String,
    pub cell: String,
    pub written_at: String,
}

/// New list cell for INSERT (seq assigned by SQLite)
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = ledger_lists)]
pub struct NewListCell<'a> {
    pub keyspace: &'a str,
    pub table_name: &'a str,
    pub partition_key: &'a str,
    pub clustering_key: &'a str,
    pub cell: &'a str,
    pub written_at: &'a str,
}
