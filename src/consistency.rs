//! Write consistency policy
//!
//! Every logical table declares how it is written. Pure column upserts are
//! idempotent and may be retried blindly; list appends are not, because a
//! redelivered append duplicates the cell. One consistency level is applied
//! to every read and write a [`crate::db::Repository`] issues.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Replica acknowledgement level requested for a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Consistency {
    One,
    LocalQuorum,
    #[default]
    Quorum,
    All,
}

impl Consistency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Consistency::One => "one",
            Consistency::LocalQuorum => "local_quorum",
            Consistency::Quorum => "quorum",
            Consistency::All => "all",
        }
    }
}

impl fmt::Display for Consistency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Consistency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "one" => Ok(Consistency::One),
            "local_quorum" => Ok(Consistency::LocalQuorum),
            "quorum" => Ok(Consistency::Quorum),
            "all" => Ok(Consistency::All),
            other => Err(format!("unknown consistency level: {}", other)),
        }
    }
}

/// Whether executing a statement twice has the same effect as once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Idempotency {
    Idempotent,
    NonIdempotent,
}

impl Idempotency {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Idempotency::Idempotent)
    }
}

/// Physical write shape of a table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    /// Overwrite the row at its key
    Upsert,
    /// Append a cell to the list at its key
    ListAppend,
}

impl WriteKind {
    pub fn idempotency(&self) -> Idempotency {
        match self {
            WriteKind::Upsert => Idempotency::Idempotent,
            WriteKind::ListAppend => Idempotency::NonIdempotent,
        }
    }
}

/// Logical tables of the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    // Version chain
    Deployment,
    DeploymentByCohort,

    // Tree mirror
    Element,
    ElementBySnapshot,
    ChildrenByParent,
    ParentByChild,
    ParentByComponent,
    ParentByFeedback,
    ParentPathwayByInteractive,
    ParentPathwayByActivity,
    ParentActivityByPathway,

    // Attempt ledger
    Attempt,
    AttemptByElement,

    // Progress
    Progress,
    ProgressByStudent,
    CompletedWalkable,
    CompletedWalkableByParent,

    // Student scope
    StudentScope,
    StudentScopeEntry,
    LatestStudentScopeEntry,
    StudentScopeTrace,
}

impl Table {
    pub const ALL: [Table; 21] = [
        Table::Deployment,
        Table::DeploymentByCohort,
        Table::Element,
        Table::ElementBySnapshot,
        Table::ChildrenByParent,
        Table::ParentByChild,
        Table::ParentByComponent,
        Table::ParentByFeedback,
        Table::ParentPathwayByInteractive,
        Table::ParentPathwayByActivity,
        Table::ParentActivityByPathway,
        Table::Attempt,
        Table::AttemptByElement,
        Table::Progress,
        Table::ProgressByStudent,
        Table::CompletedWalkable,
        Table::CompletedWalkableByParent,
        Table::StudentScope,
        Table::StudentScopeEntry,
        Table::LatestStudentScopeEntry,
        Table::StudentScopeTrace,
    ];

    /// Storage name of the table
    pub fn name(&self) -> &'static str {
        match self {
            Table::Deployment => "deployment",
            Table::DeploymentByCohort => "deployment_by_cohort",
            Table::Element => "learner_element",
            Table::ElementBySnapshot => "element_by_snapshot",
            Table::ChildrenByParent => "children_by_parent",
            Table::ParentByChild => "parent_by_child",
            Table::ParentByComponent => "parent_by_component",
            Table::ParentByFeedback => "parent_by_feedback",
            Table::ParentPathwayByInteractive => "parent_pathway_by_interactive",
            Table::ParentPathwayByActivity => "parent_pathway_by_activity",
            Table::ParentActivityByPathway => "parent_activity_by_pathway",
            Table::Attempt => "attempt",
            Table::AttemptByElement => "attempt_by_element",
            Table::Progress => "progress",
            Table::ProgressByStudent => "progress_by_student",
            Table::CompletedWalkable => "completed_walkable",
            Table::CompletedWalkableByParent => "completed_walkable_by_parent",
            Table::StudentScope => "student_scope",
            Table::StudentScopeEntry => "student_scope_entry",
            Table::LatestStudentScopeEntry => "latest_student_scope_entry",
            Table::StudentScopeTrace => "student_scope_trace",
        }
    }

    /// How the table is written; the only list-append table is the child edge list
    pub fn write_kind(&self) -> WriteKind {
        match self {
            Table::ChildrenByParent => WriteKind::ListAppend,
            _ => WriteKind::Upsert,
        }
    }

    pub fn idempotency(&self) -> Idempotency {
        self.write_kind().idempotency()
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_quorum() {
        assert_eq!(Consistency::default(), Consistency::Quorum);
        assert_eq!("LOCAL_QUORUM".parse::<Consistency>().unwrap(), Consistency::LocalQuorum);
        assert!("eventual".parse::<Consistency>().is_err());
    }

    #[test]
    fn test_only_edge_lists_are_non_idempotent() {
        for table in Table::ALL {
            let expected = if table == Table::ChildrenByParent {
                Idempotency::NonIdempotent
            } else {
                Idempotency::Idempotent
            };
            assert_eq!(table.idempotency(), expected, "{}", table);
        }
    }
}
