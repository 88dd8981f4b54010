//! Key shapes and typed handles for every logical table

use uuid::Uuid;

use super::repository::{KeyShape, TypedList, TypedTable};
use crate::change_id::ChangeId;
use crate::consistency::Table;
use crate::models::{
    Attempt, ChildRef, CohortDeployment, CompletedWalkable, DeployedActivity, LearnerElement, ParentRef, Progress,
    StudentScope, StudentScopeEntry, StudentScopeTrace,
};

fn join(parts: &[&Uuid]) -> String {
    parts.iter().map(|p| p.to_string()).collect::<Vec<_>>().join("/")
}

// ============================================================================
// Deployments
// ============================================================================

/// One deployment row per change, newest last in clustering order
#[derive(Debug, Clone, Copy)]
pub struct DeploymentKey {
    pub deployment_id: Uuid,
    pub change_id: ChangeId,
}

impl DeploymentKey {
    pub fn partition(deployment_id: &Uuid) -> String {
        deployment_id.to_string()
    }
}

impl KeyShape for DeploymentKey {
    fn partition_key(&self) -> String {
        Self::partition(&self.deployment_id)
    }

    fn clustering_key(&self) -> String {
        self.change_id.sort_key()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CohortKey {
    pub cohort_id: Uuid,
    pub deployment_id: Uuid,
}

impl CohortKey {
    pub fn partition(cohort_id: &Uuid) -> String {
        cohort_id.to_string()
    }
}

impl KeyShape for CohortKey {
    fn partition_key(&self) -> String {
        Self::partition(&self.cohort_id)
    }

    fn clustering_key(&self) -> String {
        self.deployment_id.to_string()
    }
}

// ============================================================================
// Snapshot-scoped rows: elements and edges
// ============================================================================

/// `(id, deployment)` partition with the change as clustering key
///
/// `id` is an element id for element rows and child lists, and the child id
/// for back-references.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotKey {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub change_id: ChangeId,
}

impl SnapshotKey {
    pub fn new(id: Uuid, deployment_id: Uuid, change_id: ChangeId) -> Self {
        Self {
            id,
            deployment_id,
            change_id,
        }
    }

    pub fn partition(id: &Uuid, deployment_id: &Uuid) -> String {
        join(&[id, deployment_id])
    }
}

impl KeyShape for SnapshotKey {
    fn partition_key(&self) -> String {
        Self::partition(&self.id, &self.deployment_id)
    }

    fn clustering_key(&self) -> String {
        self.change_id.sort_key()
    }
}

/// Every element of one snapshot, keyed by element id
#[derive(Debug, Clone, Copy)]
pub struct SnapshotMemberKey {
    pub deployment_id: Uuid,
    pub change_id: ChangeId,
    pub element_id: Uuid,
}

impl SnapshotMemberKey {
    pub fn partition(deployment_id: &Uuid, change_id: &ChangeId) -> String {
        format!("{}/{}", deployment_id, change_id.sort_key())
    }
}

impl KeyShape for SnapshotMemberKey {
    fn partition_key(&self) -> String {
        Self::partition(&self.deployment_id, &self.change_id)
    }

    fn clustering_key(&self) -> String {
        self.element_id.to_string()
    }
}

// ============================================================================
// Attempts
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct AttemptKey {
    pub attempt_id: Uuid,
}

impl KeyShape for AttemptKey {
    fn partition_key(&self) -> String {
        self.attempt_id.to_string()
    }
}

/// Attempts of one student on one element, ordered by ordinal
#[derive(Debug, Clone, Copy)]
pub struct StudentElementKey {
    pub student_id: Uuid,
    pub element_id: Uuid,
    pub ordinal: u32,
}

impl StudentElementKey {
    pub fn partition(student_id: &Uuid, element_id: &Uuid) -> String {
        join(&[student_id, element_id])
    }
}

impl KeyShape for StudentElementKey {
    fn partition_key(&self) -> String {
        Self::partition(&self.student_id, &self.element_id)
    }

    fn clustering_key(&self) -> String {
        format!("{:020}", self.ordinal)
    }
}

// ============================================================================
// Progress and completion
// ============================================================================

/// One progress row per (element, attempt)
#[derive(Debug, Clone, Copy)]
pub struct ProgressKey {
    pub element_id: Uuid,
    pub attempt_id: Uuid,
}

impl KeyShape for ProgressKey {
    fn partition_key(&self) -> String {
        join(&[&self.element_id, &self.attempt_id])
    }
}

/// Progress rows of one student within a deployment
#[derive(Debug, Clone, Copy)]
pub struct StudentProgressKey {
    pub deployment_id: Uuid,
    pub student_id: Uuid,
    pub element_id: Uuid,
    pub attempt_id: Uuid,
}

impl StudentProgressKey {
    pub fn partition(deployment_id: &Uuid, student_id: &Uuid) -> String {
        join(&[deployment_id, student_id])
    }
}

impl KeyShape for StudentProgressKey {
    fn partition_key(&self) -> String {
        Self::partition(&self.deployment_id, &self.student_id)
    }

    fn clustering_key(&self) -> String {
        join(&[&self.element_id, &self.attempt_id])
    }
}

/// At most one completion per (student, element, element attempt)
#[derive(Debug, Clone, Copy)]
pub struct CompletionKey {
    pub student_id: Uuid,
    pub element_id: Uuid,
    pub element_attempt_id: Uuid,
}

impl CompletionKey {
    pub fn partition(student_id: &Uuid, element_id: &Uuid) -> String {
        join(&[student_id, element_id])
    }
}

impl KeyShape for CompletionKey {
    fn partition_key(&self) -> String {
        Self::partition(&self.student_id, &self.element_id)
    }

    fn clustering_key(&self) -> String {
        self.element_attempt_id.to_string()
    }
}

/// Completions of a parent's children under one parent attempt
#[derive(Debug, Clone, Copy)]
pub struct CompletionByParentKey {
    pub student_id: Uuid,
    pub parent_element_id: Uuid,
    pub parent_attempt_id: Uuid,
    pub element_id: Uuid,
    pub element_attempt_id: Uuid,
}

impl CompletionByParentKey {
    pub fn partition(student_id: &Uuid, parent_element_id: &Uuid, parent_attempt_id: &Uuid) -> String {
        join(&[student_id, parent_element_id, parent_attempt_id])
    }
}

impl KeyShape for CompletionByParentKey {
    fn partition_key(&self) -> String {
        Self::partition(&self.student_id, &self.parent_element_id, &self.parent_attempt_id)
    }

    fn clustering_key(&self) -> String {
        join(&[&self.element_id, &self.element_attempt_id])
    }
}

// ============================================================================
// Student scope
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct ScopeKey {
    pub deployment_id: Uuid,
    pub student_id: Uuid,
    pub scope_urn: Uuid,
}

impl KeyShape for ScopeKey {
    fn partition_key(&self) -> String {
        join(&[&self.deployment_id, &self.student_id, &self.scope_urn])
    }
}

/// History of one (scope, source) key, ordered by entry version
#[derive(Debug, Clone, Copy)]
pub struct ScopeEntryKey {
    pub scope_id: Uuid,
    pub source_id: Uuid,
    pub version: ChangeId,
}

impl ScopeEntryKey {
    pub fn partition(scope_id: &Uuid, source_id: &Uuid) -> String {
        join(&[scope_id, source_id])
    }
}

impl KeyShape for ScopeEntryKey {
    fn partition_key(&self) -> String {
        Self::partition(&self.scope_id, &self.source_id)
    }

    fn clustering_key(&self) -> String {
        self.version.sort_key()
    }
}

/// Latest projection: one row per (scope, source)
#[derive(Debug, Clone, Copy)]
pub struct LatestEntryKey {
    pub scope_id: Uuid,
    pub source_id: Uuid,
}

impl LatestEntryKey {
    pub fn partition(scope_id: &Uuid) -> String {
        scope_id.to_string()
    }
}

impl KeyShape for LatestEntryKey {
    fn partition_key(&self) -> String {
        Self::partition(&self.scope_id)
    }

    fn clustering_key(&self) -> String {
        self.source_id.to_string()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TraceKey {
    pub deployment_id: Uuid,
    pub student_id: Uuid,
    pub element_id: Uuid,
}

impl KeyShape for TraceKey {
    fn partition_key(&self) -> String {
        join(&[&self.deployment_id, &self.student_id, &self.element_id])
    }
}

// ============================================================================
// Handles
// ============================================================================

pub const DEPLOYMENTS: TypedTable<DeploymentKey, DeployedActivity> = TypedTable::new(Table::Deployment);
pub const DEPLOYMENTS_BY_COHORT: TypedTable<CohortKey, CohortDeployment> = TypedTable::new(Table::DeploymentByCohort);

pub const ELEMENTS: TypedTable<SnapshotKey, LearnerElement> = TypedTable::new(Table::Element);
pub const ELEMENTS_BY_SNAPSHOT: TypedTable<SnapshotMemberKey, ChildRef> = TypedTable::new(Table::ElementBySnapshot);
pub const CHILDREN_BY_PARENT: TypedList<SnapshotKey, ChildRef> = TypedList::new(Table::ChildrenByParent);
pub const PARENT_BY_CHILD: TypedTable<SnapshotKey, ParentRef> = TypedTable::new(Table::ParentByChild);

pub const ATTEMPTS: TypedTable<AttemptKey, Attempt> = TypedTable::new(Table::Attempt);
pub const ATTEMPTS_BY_ELEMENT: TypedTable<StudentElementKey, Attempt> = TypedTable::new(Table::AttemptByElement);

pub const PROGRESS: TypedTable<ProgressKey, Progress> = TypedTable::new(Table::Progress);
pub const PROGRESS_BY_STUDENT: TypedTable<StudentProgressKey, Progress> = TypedTable::new(Table::ProgressByStudent);

pub const COMPLETED_WALKABLES: TypedTable<CompletionKey, CompletedWalkable> = TypedTable::new(Table::CompletedWalkable);
pub const COMPLETED_WALKABLES_BY_PARENT: TypedTable<CompletionByParentKey, CompletedWalkable> =
    TypedTable::new(Table::CompletedWalkableByParent);

pub const STUDENT_SCOPES: TypedTable<ScopeKey, StudentScope> = TypedTable::new(Table::StudentScope);
pub const SCOPE_ENTRIES: TypedTable<ScopeEntryKey, StudentScopeEntry> = TypedTable::new(Table::StudentScopeEntry);
pub const LATEST_SCOPE_ENTRIES: TypedTable<LatestEntryKey, StudentScopeEntry> =
    TypedTable::new(Table::LatestStudentScopeEntry);
pub const SCOPE_TRACES: TypedTable<TraceKey, StudentScopeTrace> = TypedTable::new(Table::StudentScopeTrace);

/// Back-reference handle for a per-kind legacy table
pub const fn legacy_parent_table(table: Table) -> TypedTable<SnapshotKey, ParentRef> {
    TypedTable::new(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deployment_clustering_sorts_by_change_time() {
        let deployment_id = Uuid::new_v4();
        let older = DeploymentKey {
            deployment_id,
            change_id: ChangeId::from_unix(1_700_000_000, 5, 0),
        };
        let newer = DeploymentKey {
            deployment_id,
            change_id: ChangeId::from_unix(1_700_000_001, 0, 0),
        };
        assert_eq!(older.partition_key(), newer.partition_key());
        assert!(older.clustering_key() < newer.clustering_key());
    }

    #[test]
    fn test_attempt_ordinals_sort_numerically() {
        let student_id = Uuid::new_v4();
        let element_id = Uuid::new_v4();
        let key = |ordinal| StudentElementKey {
            student_id,
            element_id,
            ordinal,
        };
        assert!(key(9).clustering_key() < key(10).clustering_key());
    }

    #[test]
    fn test_single_row_tables_have_empty_clustering() {
        let key = ProgressKey {
            element_id: Uuid::nil(),
            attempt_id: Uuid::nil(),
        };
        assert_eq!(key.clustering_key(), "");
        assert_eq!(key.row_key().partition, format!("{}/{}", Uuid::nil(), Uuid::nil()));
    }
}
