//! SQLite-backed row store using Diesel with an r2d2 pool
//!
//! SQLite is a single node, so every consistency level is trivially met;
//! the level is still logged per statement so traces match a replicated
//! deployment. Blocking Diesel calls run on the tokio blocking pool.

use std::path::Path;

use async_trait::async_trait;
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use tracing::{debug, info, trace};

use super::context::TenantContext;
use super::diesel_schema::{ledger_lists, ledger_rows};
use super::rows::{current_timestamp, LedgerRow, ListCell, NewLedgerRow, NewListCell};
use super::schema;
use super::{Clustering, Mutation, Order, Query, Row, RowKey, RowStore, Statement};
use crate::error::StorageError;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type PooledConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Per-connection PRAGMAs applied when the pool hands out a connection
#[derive(Debug)]
struct ConnectionPragmas {
    wal: bool,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionPragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        let pragmas = if self.wal {
            // WAL for concurrent readers alongside the writer
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA busy_timeout=5000;"
        } else {
            "PRAGMA busy_timeout=5000;"
        };
        conn.batch_execute(pragmas)
            .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Row store over a pooled SQLite database
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    /// Open or create the ledger database at `path`
    pub fn open(path: &Path, pool_size: u32) -> Result<Self, StorageError> {
        info!("Opening ledger database at {:?}", path);

        let manager = ConnectionManager::<SqliteConnection>::new(path.to_string_lossy());
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .connection_customizer(Box::new(ConnectionPragmas { wal: true }))
            .build(manager)
            .map_err(|e| StorageError::Internal(format!("Failed to open SQLite pool: {}", e)))?;

        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    ///
    /// Each SQLite connection to `:memory:` is its own database, so the pool
    /// holds exactly one connection that never expires.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        debug!("Opening in-memory ledger database");

        let manager = ConnectionManager::<SqliteConnection>::new(":memory:");
        let pool = Pool::builder()
            .max_size(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connection_customizer(Box::new(ConnectionPragmas { wal: false }))
            .build(manager)
            .map_err(|e| StorageError::Internal(format!("Failed to open in-memory SQLite: {}", e)))?;

        let store = Self { pool };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        let mut conn = self.conn()?;
        schema::init_schema(&mut conn)
    }

    /// Get a connection from the pool
    fn conn(&self) -> Result<PooledConn, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Transient(format!("Failed to get connection: {}", e)))
    }

    /// Run a blocking closure against a pooled connection
    async fn run<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| StorageError::Transient(format!("Failed to get connection: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StorageError::Internal(format!("Blocking task failed: {}", e)))?
    }

    /// Get database statistics
    pub async fn stats(&self) -> Result<DbStats, StorageError> {
        self.run(|conn| {
            let row_count: i64 = ledger_rows::table
                .count()
                .get_result(conn)
                .map_err(StorageError::from_diesel)?;
            let cell_count: i64 = ledger_lists::table
                .count()
                .get_result(conn)
                .map_err(StorageError::from_diesel)?;

            Ok(DbStats {
                row_count: row_count as u64,
                cell_count: cell_count as u64,
            })
        })
        .await
    }
}

/// Database statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct DbStats {
    pub row_count: u64,
    pub cell_count: u64,
}

#[async_trait]
impl RowStore for SqliteStore {
    async fn execute(&self, ctx: &TenantContext, statement: Statement) -> Result<(), StorageError> {
        statement.validate()?;
        trace!(
            table = %statement.table,
            partition = %statement.key.partition,
            consistency = %statement.consistency,
            idempotency = ?statement.idempotency(),
            "Executing statement"
        );

        let keyspace = ctx.keyspace.clone();
        self.run(move |conn| {
            let now = current_timestamp();
            let table_name = statement.table.name();
            match &statement.mutation {
                Mutation::Upsert(payload) => {
                    let payload = serde_json::to_string(payload)?;
                    diesel::replace_into(ledger_rows::table)
                        .values(&NewLedgerRow {
                            keyspace: &keyspace,
                            table_name,
                            partition_key: &statement.key.partition,
                            clustering_key: &statement.key.clustering,
                            payload: &payload,
                            written_at: &now,
                        })
                        .execute(conn)
                        .map_err(StorageError::from_diesel)?;
                }
                Mutation::Append(cell) => {
                    let cell = serde_json::to_string(cell)?;
                    diesel::insert_into(ledger_lists::table)
                        .values(&NewListCell {
                            keyspace: &keyspace,
                            table_name,
                            partition_key: &statement.key.partition,
                            clustering_key: &statement.key.clustering,
                            cell: &cell,
                            written_at: &now,
                        })
                        .execute(conn)
                        .map_err(StorageError::from_diesel)?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn insert_if_absent(&self, ctx: &TenantContext, statement: Statement) -> Result<bool, StorageError> {
        statement.validate()?;
        let payload = serde_json::to_string(statement.upsert_payload()?)?;
        trace!(
            table = %statement.table,
            partition = %statement.key.partition,
            consistency = %statement.consistency,
            "Executing conditional insert"
        );

        let keyspace = ctx.keyspace.clone();
        self.run(move |conn| {
            let now = current_timestamp();
            let inserted = diesel::insert_or_ignore_into(ledger_rows::table)
                .values(&NewLedgerRow {
                    keyspace: &keyspace,
                    table_name: statement.table.name(),
                    partition_key: &statement.key.partition,
                    clustering_key: &statement.key.clustering,
                    payload: &payload,
                    written_at: &now,
                })
                .execute(conn)
                .map_err(StorageError::from_diesel)?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn query(&self, ctx: &TenantContext, query: Query) -> Result<Vec<Row>, StorageError> {
        trace!(
            table = %query.table,
            partition = %query.partition,
            consistency = %query.consistency,
            "Executing query"
        );

        let keyspace = ctx.keyspace.clone();
        self.run(move |conn| match query.table.write_kind() {
            crate::consistency::WriteKind::Upsert => query_rows(conn, &keyspace, &query),
            crate::consistency::WriteKind::ListAppend => query_cells(conn, &keyspace, &query),
        })
        .await
    }
}

fn query_rows(
    conn: &mut SqliteConnection,
    keyspace: &str,
    query: &Query,
) -> Result<Vec<Row>, StorageError> {
    let mut base_query = ledger_rows::table
        .filter(ledger_rows::keyspace.eq(keyspace))
        .filter(ledger_rows::table_name.eq(query.table.name()))
        .filter(ledger_rows::partition_key.eq(&query.partition))
        .into_boxed();

    if let Clustering::Exact(ref clustering) = query.clustering {
        base_query = base_query.filter(ledger_rows::clustering_key.eq(clustering));
    }

    base_query = match query.order {
        Order::Asc => base_query.order(ledger_rows::clustering_key.asc()),
        Order::Desc => base_query.order(ledger_rows::clustering_key.desc()),
    };

    if let Some(limit) = query.limit {
        base_query = base_query.limit(limit as i64);
    }

    let rows: Vec<LedgerRow> = base_query.load(conn).map_err(StorageError::from_diesel)?;

    rows.into_iter()
        .map(|row| {
            Ok(Row {
                payload: serde_json::from_str(&row.payload)?,
                key: RowKey::new(row.partition_key, row.clustering_key),
            })
        })
        .collect()
}

fn query_cells(
    conn: &mut SqliteConnection,
    keyspace: &str,
    query: &Query,
) -> Result<Vec<Row>, StorageError> {
    let mut base_query = ledger_lists::table
        .filter(ledger_lists::keyspace.eq(keyspace))
        .filter(ledger_lists::table_name.eq(query.table.name()))
        .filter(ledger_lists::partition_key.eq(&query.partition))
        .into_boxed();

    if let Clustering::Exact(ref clustering) = query.clustering {
        base_query = base_query.filter(ledger_lists::clustering_key.eq(clustering));
    }

    // Cells keep append order within a list; the requested order applies to lists
    base_query = match query.order {
        Order::Asc => base_query.order((ledger_lists::clustering_key.asc(), ledger_lists::seq.asc())),
        Order::Desc => base_query.order((ledger_lists::clustering_key.desc(), ledger_lists::seq.asc())),
    };

    if let Some(limit) = query.limit {
        base_query = base_query.limit(limit as i64);
    }

    let cells: Vec<ListCell> = base_query.load(conn).map_err(StorageError::from_diesel)?;

    cells
        .into_iter()
        .map(|cell| {
            Ok(Row {
                payload: serde_json::from_str(&cell.cell)?,
                key: RowKey::new(cell.partition_key, cell.clustering_key),
            })
        })
        .collect()
}
