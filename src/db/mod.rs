//! Storage layer
//!
//! The ledger talks to its store through one seam, [`RowStore`], which
//! models a wide-column store: rows live in partitions, are ordered by a
//! clustering key, and carry a JSON payload. There are no multi-row
//! transactions; each statement stands alone.
//!
//! ## Architecture
//!
//! ```text
//! Services (version chain, tree mirror, attempts, progress, scopes)
//!     ↓
//! Repository (typed tables, consistency stamping)
//!     ↓
//! RetryingStore (retries idempotent statements only)
//!     ↓
//! SqliteStore | MemoryStore
//! ```
//!
//! ## Physical tables (SQLite backend)
//!
//! - `ledger_rows` - upserted rows, primary key (keyspace, table, partition, clustering)
//! - `ledger_lists` - appended list cells, ordered by an autoincrement sequence

pub mod context;
pub mod diesel_schema;
pub mod memory_store;
pub mod repository;
pub mod retry;
pub mod rows;
pub mod schema;
pub mod sqlite_store;
pub mod tables;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::consistency::{Consistency, Idempotency, Table, WriteKind};
use crate::error::StorageError;

pub use context::TenantContext;
pub use memory_store::MemoryStore;
pub use repository::{KeyShape, Repository, TypedList, TypedTable};
pub use retry::{RetryConfig, RetryingStore};
pub use sqlite_store::{DbPool, PooledConn, SqliteStore};

/// Address of a row: partition plus clustering key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
    pub partition: String,
    pub clustering: String,
}

impl RowKey {
    pub fn new(partition: impl Into<String>, clustering: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            clustering: clustering.into(),
        }
    }

    /// Key for tables with a single row per partition
    pub fn partition_only(partition: impl Into<String>) -> Self {
        Self::new(partition, "")
    }
}

/// What a statement does to its row
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Upsert(Value),
    Append(Value),
}

/// One write sent to the store
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub table: Table,
    pub key: RowKey,
    pub mutation: Mutation,
    pub consistency: Consistency,
}

impl Statement {
    pub fn upsert(table: Table, key: RowKey, payload: Value) -> Self {
        Self {
            table,
            key,
            mutation: Mutation::Upsert(payload),
            consistency: Consistency::default(),
        }
    }

    pub fn append(table: Table, key: RowKey, cell: Value) -> Self {
        Self {
            table,
            key,
            mutation: Mutation::Append(cell),
            consistency: Consistency::default(),
        }
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    /// Flag handed to the retry layer
    pub fn idempotency(&self) -> Idempotency {
        match self.mutation {
            Mutation::Upsert(_) => Idempotency::Idempotent,
            Mutation::Append(_) => Idempotency::NonIdempotent,
        }
    }

    /// Payload of an upsert; appends cannot be conditional
    pub fn upsert_payload(&self) -> Result<&Value, StorageError> {
        match &self.mutation {
            Mutation::Upsert(payload) => Ok(payload),
            Mutation::Append(_) => Err(StorageError::InvalidInput(format!(
                "conditional insert needs an upsert, got an append on {}",
                self.table
            ))),
        }
    }

    /// Reject mutations that do not match the table's write shape
    pub fn validate(&self) -> Result<(), StorageError> {
        let kind = match self.mutation {
            Mutation::Upsert(_) => WriteKind::Upsert,
            Mutation::Append(_) => WriteKind::ListAppend,
        };
        if kind != self.table.write_kind() {
            return Err(StorageError::InvalidInput(format!(
                "{:?} is not allowed on table {} ({:?})",
                kind,
                self.table,
                self.table.write_kind()
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Order {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Clustering {
    #[default]
    Any,
    Exact(String),
}

/// One read sent to the store
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: Table,
    pub partition: String,
    pub clustering: Clustering,
    pub order: Order,
    pub limit: Option<usize>,
    pub consistency: Consistency,
}

impl Query {
    pub fn partition(table: Table, partition: impl Into<String>) -> Self {
        Self {
            table,
            partition: partition.into(),
            clustering: Clustering::Any,
            order: Order::Asc,
            limit: None,
            consistency: Consistency::default(),
        }
    }

    pub fn key(table: Table, key: &RowKey) -> Self {
        Self::partition(table, key.partition.clone()).exact(key.clustering.clone())
    }

    pub fn exact(mut self, clustering: impl Into<String>) -> Self {
        self.clustering = Clustering::Exact(clustering.into());
        self
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }
}

/// A row (or list cell) returned by a query
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub key: RowKey,
    pub payload: Value,
}

/// Statement-execution interface of the backing store
///
/// For list tables a query returns one [`Row`] per appended cell, in append
/// order within each clustering key. Redelivered appends show up as
/// duplicate cells; consumers de-duplicate.
#[async_trait]
pub trait RowStore: Send + Sync {
    async fn execute(&self, ctx: &TenantContext, statement: Statement) -> Result<(), StorageError>;

    /// Write an upsert only if its row does not exist yet
    ///
    /// Returns `true` when this call created the row. Lightweight
    /// transaction semantics: concurrent callers on one key see exactly one
    /// `true`.
    async fn insert_if_absent(&self, ctx: &TenantContext, statement: Statement) -> Result<bool, StorageError>;

    async fn query(&self, ctx: &TenantContext, query: Query) -> Result<Vec<Row>, StorageError>;
}

#[async_trait]
impl<T: RowStore + ?Sized> RowStore for Arc<T> {
    async fn execute(&self, ctx: &TenantContext, statement: Statement) -> Result<(), StorageError> {
        (**self).execute(ctx, statement).await
    }

    async fn insert_if_absent(&self, ctx: &TenantContext, statement: Statement) -> Result<bool, StorageError> {
        (**self).insert_if_absent(ctx, statement).await
    }

    async fn query(&self, ctx: &TenantContext, query: Query) -> Result<Vec<Row>, StorageError> {
        (**self).query(ctx, query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_statement_idempotency_follows_mutation() {
        let key = RowKey::new("p", "c");
        let upsert = Statement::upsert(Table::Progress, key.clone(), json!({}));
        let append = Statement::append(Table::ChildrenByParent, key, json!({}));
        assert!(upsert.idempotency().is_retryable());
        assert!(!append.idempotency().is_retryable());
    }

    #[test]
    fn test_validate_rejects_mismatched_write_kind() {
        let key = RowKey::new("p", "c");
        assert!(Statement::append(Table::Progress, key.clone(), json!({})).validate().is_err());
        assert!(Statement::upsert(Table::ChildrenByParent, key.clone(), json!({})).validate().is_err());
        assert!(Statement::upsert(Table::Attempt, key, json!({})).validate().is_ok());
    }

    #[test]
    fn test_query_builder() {
        let query = Query::partition(Table::Deployment, "d1")
            .order(Order::Desc)
            .limit(1)
            .with_consistency(Consistency::All);
        assert_eq!(query.clustering, Clustering::Any);
        assert_eq!(query.limit, Some(1));
        assert_eq!(query.consistency, Consistency::All);

        let point = Query::key(Table::Attempt, &RowKey::partition_only("a1"));
        assert_eq!(point.clustering, Clustering::Exact(String::new()));
    }
}
