//! Generic repository over the row store
//!
//! Every logical table is described once by a typed handle
//! ([`TypedTable`] for upserted rows, [`TypedList`] for append-only lists)
//! parameterized by its key shape and entity type. The repository encodes
//! entities as JSON payloads and stamps the configured consistency level on
//! every statement it sends.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use super::context::TenantContext;
use super::{Order, Query, Row, RowKey, RowStore, Statement};
use crate::consistency::{Consistency, Table};
use crate::error::StorageError;

/// Maps a natural key onto partition and clustering strings
pub trait KeyShape {
    fn partition_key(&self) -> String;

    /// Empty for tables holding one row per partition
    fn clustering_key(&self) -> String {
        String::new()
    }

    fn row_key(&self) -> RowKey {
        RowKey::new(self.partition_key(), self.clustering_key())
    }
}

/// Handle for an upsert table holding `E` rows keyed by `K`
pub struct TypedTable<K, E> {
    table: Table,
    _marker: PhantomData<fn(&K) -> E>,
}

impl<K, E> TypedTable<K, E> {
    pub const fn new(table: Table) -> Self {
        Self {
            table,
            _marker: PhantomData,
        }
    }

    pub fn table(&self) -> Table {
        self.table
    }
}

impl<K, E> Clone for TypedTable<K, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, E> Copy for TypedTable<K, E> {}

impl<K, E> fmt::Debug for TypedTable<K, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypedTable({})", self.table)
    }
}

/// Handle for an append-only list table whose cells are `E`
pub struct TypedList<K, E> {
    table: Table,
    _marker: PhantomData<fn(&K) -> E>,
}

impl<K, E> TypedList<K, E> {
    pub const fn new(table: Table) -> Self {
        Self {
            table,
            _marker: PhantomData,
        }
    }

    pub fn table(&self) -> Table {
        self.table
    }
}

impl<K, E> Clone for TypedList<K, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K, E> Copy for TypedList<K, E> {}

impl<K, E> fmt::Debug for TypedList<K, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypedList({})", self.table)
    }
}

/// Typed access to a tenant's tables
#[derive(Clone)]
pub struct Repository {
    store: Arc<dyn RowStore>,
    ctx: TenantContext,
    consistency: Consistency,
}

impl Repository {
    pub fn new(store: Arc<dyn RowStore>, ctx: TenantContext, consistency: Consistency) -> Self {
        Self {
            store,
            ctx,
            consistency,
        }
    }

    pub fn context(&self) -> &TenantContext {
        &self.ctx
    }

    pub fn consistency(&self) -> Consistency {
        self.consistency
    }

    /// Upsert one row (idempotent)
    pub async fn put<K, E>(&self, table: TypedTable<K, E>, key: &K, entity: &E) -> Result<(), StorageError>
    where
        K: KeyShape,
        E: Serialize,
    {
        let payload = serde_json::to_value(entity)?;
        let statement = Statement::upsert(table.table, key.row_key(), payload).with_consistency(self.consistency);
        trace!(table = %table.table, partition = %statement.key.partition, "put");
        self.store.execute(&self.ctx, statement).await
    }

    /// Insert one row unless its key is taken; `true` if this call wrote it
    pub async fn insert_if_absent<K, E>(&self, table: TypedTable<K, E>, key: &K, entity: &E) -> Result<bool, StorageError>
    where
        K: KeyShape,
        E: Serialize,
    {
        let payload = serde_json::to_value(entity)?;
        let statement = Statement::upsert(table.table, key.row_key(), payload).with_consistency(self.consistency);
        trace!(table = %table.table, partition = %statement.key.partition, "insert_if_absent");
        self.store.insert_if_absent(&self.ctx, statement).await
    }

    /// Point lookup
    pub async fn get<K, E>(&self, table: TypedTable<K, E>, key: &K) -> Result<Option<E>, StorageError>
    where
        K: KeyShape,
        E: DeserializeOwned,
    {
        let query = Query::key(table.table, &key.row_key())
            .limit(1)
            .with_consistency(self.consistency);
        let rows = self.store.query(&self.ctx, query).await?;
        rows.into_iter().next().map(decode).transpose()
    }

    /// Row with the greatest clustering key in a partition
    pub async fn latest<K, E>(
        &self,
        table: TypedTable<K, E>,
        partition: impl Into<String>,
    ) -> Result<Option<E>, StorageError>
    where
        E: DeserializeOwned,
    {
        let rows = self.scan(table, partition, Order::Desc, Some(1)).await?;
        Ok(rows.into_iter().next())
    }

    /// All rows of a partition in clustering order
    pub async fn scan<K, E>(
        &self,
        table: TypedTable<K, E>,
        partition: impl Into<String>,
        order: Order,
        limit: Option<usize>,
    ) -> Result<Vec<E>, StorageError>
    where
        E: DeserializeOwned,
    {
        let mut query = Query::partition(table.table, partition)
            .order(order)
            .with_consistency(self.consistency);
        if let Some(limit) = limit {
            query = query.limit(limit);
        }
        let rows = self.store.query(&self.ctx, query).await?;
        rows.into_iter().map(decode).collect()
    }

    /// Append one cell (not idempotent, never retried)
    pub async fn append<K, E>(&self, list: TypedList<K, E>, key: &K, cell: &E) -> Result<(), StorageError>
    where
        K: KeyShape,
        E: Serialize,
    {
        let payload = serde_json::to_value(cell)?;
        let statement = Statement::append(list.table, key.row_key(), payload).with_consistency(self.consistency);
        trace!(table = %list.table, partition = %statement.key.partition, "append");
        self.store.execute(&self.ctx, statement).await
    }

    /// Raw cells of one list in append order, duplicates included
    pub async fn cells<K, E>(&self, list: TypedList<K, E>, key: &K) -> Result<Vec<E>, StorageError>
    where
        K: KeyShape,
        E: DeserializeOwned,
    {
        let query = Query::key(list.table, &key.row_key()).with_consistency(self.consistency);
        let rows = self.store.query(&self.ctx, query).await?;
        rows.into_iter().map(decode).collect()
    }
}

fn decode<E: DeserializeOwned>(row: Row) -> Result<E, StorageError> {
    Ok(serde_json::from_value(row.payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        text: String,
    }

    struct NoteKey {
        owner: &'static str,
        seq: u32,
    }

    impl KeyShape for NoteKey {
        fn partition_key(&self) -> String {
            self.owner.to_string()
        }

        fn clustering_key(&self) -> String {
            format!("{:05}", self.seq)
        }
    }

    const NOTES: TypedTable<NoteKey, Note> = TypedTable::new(Table::StudentScopeEntry);
    const NOTE_LIST: TypedList<NoteKey, Note> = TypedList::new(Table::ChildrenByParent);

    fn note(text: &str) -> Note {
        Note { text: text.into() }
    }

    fn repository(store: Arc<MemoryStore>) -> Repository {
        Repository::new(store, TenantContext::default(), Consistency::All)
    }

    #[tokio::test]
    async fn test_put_get_latest_scan() {
        let store = Arc::new(MemoryStore::new());
        let repo = repository(store.clone());

        for (seq, text) in [(2, "second"), (1, "first"), (3, "third")] {
            repo.put(NOTES, &NoteKey { owner: "o", seq }, &note(text)).await.unwrap();
        }

        let got = repo.get(NOTES, &NoteKey { owner: "o", seq: 1 }).await.unwrap();
        assert_eq!(got, Some(note("first")));
        assert!(repo.get(NOTES, &NoteKey { owner: "o", seq: 9 }).await.unwrap().is_none());

        let latest = repo.latest(NOTES, "o").await.unwrap();
        assert_eq!(latest, Some(note("third")));

        let all = repo.scan(NOTES, "o", Order::Asc, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0], note("first"));
    }

    #[tokio::test]
    async fn test_consistency_is_stamped_on_every_statement() {
        let store = Arc::new(MemoryStore::new());
        let repo = repository(store.clone());
        let key = NoteKey { owner: "o", seq: 1 };

        repo.put(NOTES, &key, &note("a")).await.unwrap();
        repo.append(NOTE_LIST, &key, &note("b")).await.unwrap();

        let log = store.statement_log();
        assert_eq!(log.len(), 2);
        assert!(log.iter().all(|r| r.consistency == Consistency::All));
        assert!(!log[1].idempotency.is_retryable());
    }

    #[tokio::test]
    async fn test_cells_keep_append_order() {
        let store = Arc::new(MemoryStore::new());
        let repo = repository(store);
        let key = NoteKey { owner: "o", seq: 1 };

        for text in ["x", "y", "x"] {
            repo.append(NOTE_LIST, &key, &note(text)).await.unwrap();
        }
        let cells = repo.cells(NOTE_LIST, &key).await.unwrap();
        assert_eq!(cells, vec![note("x"), note("y"), note("x")]);
    }
}
