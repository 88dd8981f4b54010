//! Student scope store
//!
//! A scope is a per-(deployment, student) namespace of variables keyed by
//! source. Each write lands twice: in the append-only history, versioned by
//! the entry id, and in the latest projection. History goes first; the
//! projection is only moved forward, never back to an older version.
//!
//! An entry carries its version from the moment it is prepared, so
//! retrying [`ScopeStore::write_entry`] with the same entry is a no-op.

use std::sync::Arc;

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use super::events::{EventBus, LedgerEvent};
use crate::change_id::ChangeId;
use crate::db::tables::{
    LatestEntryKey, ScopeEntryKey, ScopeKey, TraceKey, LATEST_SCOPE_ENTRIES, SCOPE_ENTRIES, SCOPE_TRACES,
    STUDENT_SCOPES,
};
use crate::db::{Order, Repository};
use crate::error::StorageError;
use crate::models::{derived_id, StudentScope, StudentScopeEntry, StudentScopeTrace};

#[derive(Clone)]
pub struct ScopeStore {
    repo: Repository,
    events: Arc<EventBus>,
}

impl ScopeStore {
    pub fn new(repo: Repository, events: Arc<EventBus>) -> Self {
        Self { repo, events }
    }

    /// Scope of a student for one urn, created on first use
    pub async fn find_or_create_scope(
        &self,
        deployment_id: Uuid,
        student_id: Uuid,
        scope_urn: Uuid,
    ) -> Result<StudentScope, StorageError> {
        let key = ScopeKey {
            deployment_id,
            student_id,
            scope_urn,
        };
        if let Some(scope) = self.repo.get(STUDENT_SCOPES, &key).await? {
            return Ok(scope);
        }

        // Derived id: two racing creators write the same row
        let scope = StudentScope {
            id: derived_id(&[
                "scope",
                &deployment_id.to_string(),
                &student_id.to_string(),
                &scope_urn.to_string(),
            ]),
            deployment_id,
            student_id,
            scope_urn,
        };
        self.repo.put(STUDENT_SCOPES, &key, &scope).await?;
        debug!(scope_id = %scope.id, student_id = %student_id, "Created student scope");
        Ok(scope)
    }

    /// New entry for (scope, source), versioned now
    pub fn prepare_entry(&self, scope_id: Uuid, source_id: Uuid, student_id: Uuid, data: Value) -> StudentScopeEntry {
        StudentScopeEntry {
            id: ChangeId::new(),
            scope_id,
            source_id,
            student_id,
            data,
        }
    }

    /// Prepare and write an entry in one call
    pub async fn write(
        &self,
        scope_id: Uuid,
        source_id: Uuid,
        student_id: Uuid,
        data: Value,
    ) -> Result<StudentScopeEntry, StorageError> {
        let entry = self.prepare_entry(scope_id, source_id, student_id, data);
        self.write_entry(&entry).await?;
        Ok(entry)
    }

    /// Write history, then move the latest projection forward
    ///
    /// Only retry this as a whole.
    pub async fn write_entry(&self, entry: &StudentScopeEntry) -> Result<(), StorageError> {
        self.repo
            .put(
                SCOPE_ENTRIES,
                &ScopeEntryKey {
                    scope_id: entry.scope_id,
                    source_id: entry.source_id,
                    version: entry.id,
                },
                entry,
            )
            .await?;

        let latest_key = LatestEntryKey {
            scope_id: entry.scope_id,
            source_id: entry.source_id,
        };
        let current: Option<StudentScopeEntry> = self.repo.get(LATEST_SCOPE_ENTRIES, &latest_key).await?;
        match current {
            Some(current) if current.id > entry.id => {
                debug!(
                    scope_id = %entry.scope_id,
                    source_id = %entry.source_id,
                    version = %entry.id,
                    newer = %current.id,
                    "Latest projection already holds a newer entry"
                );
            }
            _ => {
                self.repo.put(LATEST_SCOPE_ENTRIES, &latest_key, entry).await?;
            }
        }

        self.events.emit(LedgerEvent::ScopeEntryWritten {
            scope_id: entry.scope_id,
            source_id: entry.source_id,
            version: entry.id,
        });
        Ok(())
    }

    /// Current value of every source in a scope
    pub async fn read_latest(&self, scope_id: Uuid) -> Result<Vec<StudentScopeEntry>, StorageError> {
        self.repo
            .scan(LATEST_SCOPE_ENTRIES, LatestEntryKey::partition(&scope_id), Order::Asc, None)
            .await
    }

    /// Newest history entry of one source
    pub async fn read_history(&self, scope_id: Uuid, source_id: Uuid) -> Result<Option<StudentScopeEntry>, StorageError> {
        self.repo
            .latest(SCOPE_ENTRIES, ScopeEntryKey::partition(&scope_id, &source_id))
            .await
    }

    /// Every history entry of one source, newest first
    pub async fn read_history_versions(
        &self,
        scope_id: Uuid,
        source_id: Uuid,
    ) -> Result<Vec<StudentScopeEntry>, StorageError> {
        self.repo
            .scan(
                SCOPE_ENTRIES,
                ScopeEntryKey::partition(&scope_id, &source_id),
                Order::Desc,
                None,
            )
            .await
    }

    /// Remember which scope was in effect when an element was evaluated
    pub async fn record_trace(&self, trace: &StudentScopeTrace) -> Result<(), StorageError> {
        self.repo
            .put(
                SCOPE_TRACES,
                &TraceKey {
                    deployment_id: trace.deployment_id,
                    student_id: trace.student_id,
                    element_id: trace.element_id,
                },
                trace,
            )
            .await
    }

    pub async fn find_trace(
        &self,
        deployment_id: Uuid,
        student_id: Uuid,
        element_id: Uuid,
    ) -> Result<Option<StudentScopeTrace>, StorageError> {
        self.repo
            .get(
                SCOPE_TRACES,
                &TraceKey {
                    deployment_id,
                    student_id,
                    element_id,
                },
            )
            .await
    }
}
