//! Back-reference table migration
//!
//! Child→parent back-references used to live in one table per child kind
//! (`parent_by_component`, `parent_pathway_by_activity`, ...). They are
//! moving to a single `parent_by_child` table. [`ParentIndex`] is the only
//! code that touches either shape: during the transition it writes both and
//! reads the unified table first, falling back to the legacy one.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::change_id::ChangeId;
use crate::consistency::Table;
use crate::db::tables::{legacy_parent_table, SnapshotKey, PARENT_BY_CHILD};
use crate::db::Repository;
use crate::error::StorageError;
use crate::models::{ElementType, ParentRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    /// Only the per-kind tables exist
    LegacyOnly,
    /// Write both shapes, read unified with legacy fallback
    #[default]
    DualWrite,
    /// Legacy tables are no longer written or read
    UnifiedOnly,
}

impl MigrationPhase {
    pub fn writes_legacy(&self) -> bool {
        matches!(self, MigrationPhase::LegacyOnly | MigrationPhase::DualWrite)
    }

    pub fn writes_unified(&self) -> bool {
        matches!(self, MigrationPhase::DualWrite | MigrationPhase::UnifiedOnly)
    }

    pub fn reads_legacy_fallback(&self) -> bool {
        self.writes_legacy()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationPhase::LegacyOnly => "legacy_only",
            MigrationPhase::DualWrite => "dual_write",
            MigrationPhase::UnifiedOnly => "unified_only",
        }
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationPhase {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy_only" => Ok(MigrationPhase::LegacyOnly),
            "dual_write" => Ok(MigrationPhase::DualWrite),
            "unified_only" => Ok(MigrationPhase::UnifiedOnly),
            other => Err(StorageError::Config(format!("unknown edge migration phase: {}", other))),
        }
    }
}

/// Legacy per-kind back-reference table for a child type
///
/// Scenarios never had one; their back-references only exist in the
/// unified table whatever the phase.
pub fn legacy_table_for(child_type: ElementType) -> Option<Table> {
    match child_type {
        ElementType::Component => Some(Table::ParentByComponent),
        ElementType::Feedback => Some(Table::ParentByFeedback),
        ElementType::Interactive => Some(Table::ParentPathwayByInteractive),
        ElementType::Activity => Some(Table::ParentPathwayByActivity),
        ElementType::Pathway => Some(Table::ParentActivityByPathway),
        ElementType::Scenario => None,
    }
}

const LEGACY_TABLES: [Table; 5] = [
    Table::ParentByComponent,
    Table::ParentByFeedback,
    Table::ParentPathwayByInteractive,
    Table::ParentPathwayByActivity,
    Table::ParentActivityByPathway,
];

/// Versioned adapter over both back-reference shapes
#[derive(Clone)]
pub struct ParentIndex {
    repo: Repository,
    phase: MigrationPhase,
}

impl ParentIndex {
    pub fn new(repo: Repository, phase: MigrationPhase) -> Self {
        Self { repo, phase }
    }

    pub fn phase(&self) -> MigrationPhase {
        self.phase
    }

    /// Write the back-reference in every shape the phase requires
    pub async fn write(&self, deployment_id: Uuid, change_id: ChangeId, edge: &ParentRef) -> Result<(), StorageError> {
        let key = SnapshotKey::new(edge.child_id, deployment_id, change_id);
        let legacy = legacy_table_for(edge.child_type);

        if self.phase.writes_unified() || legacy.is_none() {
            self.repo.put(PARENT_BY_CHILD, &key, edge).await?;
        }
        if let (true, Some(table)) = (self.phase.writes_legacy(), legacy) {
            self.repo.put(legacy_parent_table(table), &key, edge).await?;
        }
        Ok(())
    }

    /// Back-reference of a child at one change
    ///
    /// When the child type is unknown every legacy table is tried.
    pub async fn read(
        &self,
        child_id: Uuid,
        child_type: Option<ElementType>,
        deployment_id: Uuid,
        change_id: ChangeId,
    ) -> Result<Option<ParentRef>, StorageError> {
        let key = SnapshotKey::new(child_id, deployment_id, change_id);

        if let Some(edge) = self.repo.get(PARENT_BY_CHILD, &key).await? {
            return Ok(Some(edge));
        }
        if !self.phase.reads_legacy_fallback() {
            return Ok(None);
        }

        for table in self.legacy_candidates(child_type) {
            if let Some(edge) = self.repo.get(legacy_parent_table(table), &key).await? {
                debug!(child_id = %child_id, table = %table, "Back-reference served from legacy table");
                return Ok(Some(edge));
            }
        }
        Ok(None)
    }

    fn legacy_candidates(&self, child_type: Option<ElementType>) -> Vec<Table> {
        match child_type {
            Some(child_type) => legacy_table_for(child_type).into_iter().collect(),
            None => LEGACY_TABLES.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consistency::Consistency;
    use crate::db::{MemoryStore, TenantContext};
    use std::sync::Arc;

    fn edge(child_type: ElementType) -> ParentRef {
        ParentRef {
            parent_id: Uuid::new_v4(),
            parent_type: ElementType::Interactive,
            child_id: Uuid::new_v4(),
            child_type,
        }
    }

    fn index(store: Arc<MemoryStore>, phase: MigrationPhase) -> ParentIndex {
        let repo = Repository::new(store, TenantContext::default(), Consistency::Quorum);
        ParentIndex::new(repo, phase)
    }

    fn tables_written(store: &MemoryStore) -> Vec<Table> {
        store.statement_log().into_iter().map(|r| r.table).collect()
    }

    #[tokio::test]
    async fn test_dual_write_writes_both_shapes() {
        let store = Arc::new(MemoryStore::new());
        let index = index(store.clone(), MigrationPhase::DualWrite);
        let edge = edge(ElementType::Feedback);

        index.write(Uuid::nil(), ChangeId::new(), &edge).await.unwrap();
        assert_eq!(tables_written(&store), vec![Table::ParentByChild, Table::ParentByFeedback]);
    }

    #[tokio::test]
    async fn test_unified_only_skips_legacy() {
        let store = Arc::new(MemoryStore::new());
        let index = index(store.clone(), MigrationPhase::UnifiedOnly);

        index.write(Uuid::nil(), ChangeId::new(), &edge(ElementType::Component)).await.unwrap();
        assert_eq!(tables_written(&store), vec![Table::ParentByChild]);
    }

    #[tokio::test]
    async fn test_scenario_always_uses_unified() {
        let store = Arc::new(MemoryStore::new());
        let index = index(store.clone(), MigrationPhase::LegacyOnly);

        index.write(Uuid::nil(), ChangeId::new(), &edge(ElementType::Scenario)).await.unwrap();
        assert_eq!(tables_written(&store), vec![Table::ParentByChild]);
    }

    #[tokio::test]
    async fn test_reads_fall_back_to_legacy_rows() {
        let store = Arc::new(MemoryStore::new());
        let change_id = ChangeId::new();
        let edge = edge(ElementType::Component);

        // Rows written before the migration started
        index(store.clone(), MigrationPhase::LegacyOnly)
            .write(Uuid::nil(), change_id, &edge)
            .await
            .unwrap();

        let dual = index(store.clone(), MigrationPhase::DualWrite);
        let found = dual.read(edge.child_id, None, Uuid::nil(), change_id).await.unwrap();
        assert_eq!(found, Some(edge));
        let typed = dual
            .read(edge.child_id, Some(ElementType::Component), Uuid::nil(), change_id)
            .await
            .unwrap();
        assert_eq!(typed, Some(edge));

        let unified = index(store, MigrationPhase::UnifiedOnly);
        assert!(unified.read(edge.child_id, None, Uuid::nil(), change_id).await.unwrap().is_none());
    }

    #[test]
    fn test_phase_parse() {
        assert_eq!("dual_write".parse::<MigrationPhase>().unwrap(), MigrationPhase::DualWrite);
        assert!("both".parse::<MigrationPhase>().is_err());
        assert_eq!(MigrationPhase::default(), MigrationPhase::DualWrite);
    }
}
