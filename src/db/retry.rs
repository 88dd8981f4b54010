//! Retry layer above the storage client
//!
//! Reads and idempotent writes are retried on transient failures with a
//! linear delay. Non-idempotent writes (list appends) are executed exactly
//! once; their failures go straight back to the caller.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::context::TenantContext;
use super::{Query, Row, RowStore, Statement};
use crate::error::StorageError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total tries per statement, first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the n-th retry is `base_delay_ms * n`
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    50
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryConfig {
    fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.base_delay_ms.saturating_mul(attempt as u64))
    }
}

/// Store decorator that honours each statement's idempotency flag
pub struct RetryingStore<S> {
    inner: S,
    config: RetryConfig,
}

impl<S: RowStore> RetryingStore<S> {
    pub fn new(inner: S, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl<S: RowStore> RowStore for RetryingStore<S> {
    async fn execute(&self, ctx: &TenantContext, statement: Statement) -> Result<(), StorageError> {
        if !statement.idempotency().is_retryable() {
            return self.inner.execute(ctx, statement).await;
        }

        let mut attempt = 1;
        loop {
            match self.inner.execute(ctx, statement.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    warn!(
                        table = %statement.table,
                        attempt,
                        error = %e,
                        "Transient write failure, retrying"
                    );
                    tokio::time::sleep(self.config.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Retried like an upsert; a retry whose first try landed reports
    /// `false`, so callers compare the stored row with their own
    async fn insert_if_absent(&self, ctx: &TenantContext, statement: Statement) -> Result<bool, StorageError> {
        let mut attempt = 1;
        loop {
            match self.inner.insert_if_absent(ctx, statement.clone()).await {
                Ok(applied) => return Ok(applied),
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    warn!(
                        table = %statement.table,
                        attempt,
                        error = %e,
                        "Transient conditional write failure, retrying"
                    );
                    tokio::time::sleep(self.config.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn query(&self, ctx: &TenantContext, query: Query) -> Result<Vec<Row>, StorageError> {
        let mut attempt = 1;
        loop {
            match self.inner.query(ctx, query.clone()).await {
                Ok(rows) => return Ok(rows),
                Err(e) if e.is_transient() && attempt < self.config.max_attempts => {
                    warn!(table = %query.table, attempt, error = %e, "Transient read failure, retrying");
                    tokio::time::sleep(self.config.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
