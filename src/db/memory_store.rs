//! In-process row store with fault injection
//!
//! Used by tests to simulate the failure modes of a replicated store:
//! writes that fail part-way through a sequence, and list appends that are
//! delivered more than once.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use super::context::TenantContext;
use super::{Clustering, Mutation, Order, Query, Row, RowKey, RowStore, Statement};
use crate::consistency::{Consistency, Idempotency, Table, WriteKind};
use crate::error::StorageError;

type PartitionId = (String, Table, String);

/// Record of a statement the store accepted or rejected
#[derive(Debug, Clone, PartialEq)]
pub struct StatementRecord {
    pub table: Table,
    pub key: RowKey,
    pub idempotency: Idempotency,
    pub consistency: Consistency,
    pub failed: bool,
}

#[derive(Debug, Default)]
struct FaultPlan {
    /// Zero-based write indexes that fail with a transient error
    fail_writes: HashSet<usize>,
    /// Remaining transient failures per table
    fail_tables: HashMap<Table, usize>,
    /// Apply every append twice (at-least-once redelivery)
    duplicate_appends: bool,
}

/// Row store kept in memory
#[derive(Default)]
pub struct MemoryStore {
    rows: DashMap<PartitionId, BTreeMap<String, Value>>,
    lists: DashMap<PartitionId, BTreeMap<String, Vec<Value>>>,
    writes: AtomicUsize,
    faults: Mutex<FaultPlan>,
    log: Mutex<Vec<StatementRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the write with this zero-based index
    pub fn fail_write(&self, index: usize) {
        self.with_faults(|plan| {
            plan.fail_writes.insert(index);
        });
    }

    /// Fail the next `times` writes to `table`
    pub fn fail_table(&self, table: Table, times: usize) {
        self.with_faults(|plan| {
            plan.fail_tables.insert(table, times);
        });
    }

    pub fn duplicate_appends(&self, enabled: bool) {
        self.with_faults(|plan| plan.duplicate_appends = enabled);
    }

    /// Drop all injected faults
    pub fn heal(&self) {
        self.with_faults(|plan| *plan = FaultPlan::default());
    }

    /// Writes attempted so far, failed ones included
    pub fn write_count(&self) -> usize {
        self.writes.load(AtomicOrdering::SeqCst)
    }

    pub fn statement_log(&self) -> Vec<StatementRecord> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    fn with_faults<T>(&self, f: impl FnOnce(&mut FaultPlan) -> T) -> T {
        let mut plan = self.faults.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut plan)
    }

    /// Decide whether the write with `index` to `table` fails, and whether
    /// an append is redelivered
    fn plan_write(&self, index: usize, table: Table) -> (bool, bool) {
        self.with_faults(|plan| {
            let mut fail = plan.fail_writes.remove(&index);
            if let Some(remaining) = plan.fail_tables.get_mut(&table) {
                if *remaining > 0 {
                    *remaining -= 1;
                    fail = true;
                }
            }
            (fail, plan.duplicate_appends)
        })
    }

    /// Count and log a write, failing it if a fault is planned
    ///
    /// Returns whether an append should be redelivered.
    fn admit(&self, statement: &Statement) -> Result<bool, StorageError> {
        statement.validate()?;

        let index = self.writes.fetch_add(1, AtomicOrdering::SeqCst);
        let (fail, duplicate) = self.plan_write(index, statement.table);
        self.record(statement, fail);

        if fail {
            debug!(index, table = %statement.table, "Injected write failure");
            return Err(StorageError::Transient(format!(
                "injected failure on write {} to {}",
                index, statement.table
            )));
        }
        Ok(duplicate)
    }

    fn record(&self, statement: &Statement, failed: bool) {
        if let Ok(mut log) = self.log.lock() {
            log.push(StatementRecord {
                table: statement.table,
                key: statement.key.clone(),
                idempotency: statement.idempotency(),
                consistency: statement.consistency,
                failed,
            });
        }
    }
}

#[async_trait]
impl RowStore for MemoryStore {
    async fn execute(&self, ctx: &TenantContext, statement: Statement) -> Result<(), StorageError> {
        let duplicate = self.admit(&statement)?;
        let partition = partition_of(ctx, &statement);
        match statement.mutation {
            Mutation::Upsert(payload) => {
                self.rows
                    .entry(partition)
                    .or_default()
                    .insert(statement.key.clustering, payload);
            }
            Mutation::Append(cell) => {
                let mut lists = self.lists.entry(partition).or_default();
                let list = lists.entry(statement.key.clustering).or_default();
                if duplicate {
                    list.push(cell.clone());
                }
                list.push(cell);
            }
        }
        Ok(())
    }

    async fn insert_if_absent(&self, ctx: &TenantContext, statement: Statement) -> Result<bool, StorageError> {
        let payload = statement.upsert_payload()?.clone();
        self.admit(&statement)?;
        let partition = partition_of(ctx, &statement);
        let mut rows = self.rows.entry(partition).or_default();
        match rows.entry(statement.key.clustering) {
            Entry::Vacant(slot) => {
                slot.insert(payload);
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
        }
    }

    async fn query(&self, ctx: &TenantContext, query: Query) -> Result<Vec<Row>, StorageError> {
        let partition: PartitionId = (ctx.keyspace.clone(), query.table, query.partition.clone());
        let partition_key = &query.partition;

        let mut rows: Vec<Row> = match query.table.write_kind() {
            WriteKind::Upsert => self
                .rows
                .get(&partition)
                .map(|rows| {
                    rows.iter()
                        .filter(|(clustering, _)| matches_clustering(&query.clustering, clustering))
                        .map(|(clustering, payload)| Row {
                            key: RowKey::new(partition_key.clone(), clustering.clone()),
                            payload: payload.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
            WriteKind::ListAppend => self
                .lists
                .get(&partition)
                .map(|lists| {
                    lists
                        .iter()
                        .filter(|(clustering, _)| matches_clustering(&query.clustering, clustering))
                        .flat_map(|(clustering, cells)| {
                            cells.iter().map(move |cell| Row {
                                key: RowKey::new(partition_key.clone(), clustering.clone()),
                                payload: cell.clone(),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default(),
        };

        if query.order == Order::Desc {
            // Stable sort keeps append order inside each list
            rows.sort_by(|a, b| b.key.clustering.cmp(&a.key.clustering));
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }
}

fn partition_of(ctx: &TenantContext, statement: &Statement) -> PartitionId {
    (ctx.keyspace.clone(), statement.table, statement.key.partition.clone())
}

fn matches_clustering(filter: &Clustering, clustering: &str) -> bool {
    match filter {
        Clustering::Any => true,
        Clustering::Exact(expected) => expected == clustering,
    }
}
