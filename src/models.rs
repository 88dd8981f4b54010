//! Domain model for published courseware and learner state
//!
//! Rows are plain serde structs; the repository layer serializes them as
//! JSON payloads keyed by the shapes in `db::tables`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::change_id::ChangeId;

/// Namespace for ids derived from natural keys
const LEDGER_NAMESPACE: Uuid = Uuid::from_u128(0x6b1f_4a52_93de_4c1b_8a0e_2f6d_c0a1_e7b3);

/// Deterministic id for a natural key, so repeated upserts land on one row
pub fn derived_id(parts: &[&str]) -> Uuid {
    Uuid::new_v5(&LEDGER_NAMESPACE, parts.join("/").as_bytes())
}

// ============================================================================
// Courseware Elements
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ElementType {
    Activity,
    Pathway,
    Interactive,
    Component,
    Feedback,
    Scenario,
}

impl ElementType {
    /// Activities and interactives can be attempted by a student
    pub fn is_walkable(&self) -> bool {
        matches!(self, ElementType::Activity | ElementType::Interactive)
    }

    /// Elements whose progress is an aggregate of their children
    pub fn is_container(&self) -> bool {
        matches!(self, ElementType::Activity | ElementType::Pathway)
    }

    /// Elements that carry a progress row at all
    pub fn tracks_progress(&self) -> bool {
        self.is_walkable() || self.is_container()
    }

    /// Child types a parent of this type may hold in a published tree
    pub fn allowed_children(&self) -> &'static [ElementType] {
        match self {
            ElementType::Activity => &[ElementType::Pathway, ElementType::Component, ElementType::Scenario],
            ElementType::Pathway => &[ElementType::Activity, ElementType::Interactive],
            ElementType::Interactive => &[ElementType::Feedback, ElementType::Component, ElementType::Scenario],
            ElementType::Component | ElementType::Feedback | ElementType::Scenario => &[],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::Activity => "ACTIVITY",
            ElementType::Pathway => "PATHWAY",
            ElementType::Interactive => "INTERACTIVE",
            ElementType::Component => "COMPONENT",
            ElementType::Feedback => "FEEDBACK",
            ElementType::Scenario => "SCENARIO",
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node of a published snapshot, keyed by (element, deployment, change)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LearnerElement {
    pub element_id: Uuid,
    pub deployment_id: Uuid,
    pub change_id: ChangeId,
    pub element_type: ElementType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_id: Option<Uuid>,
}

/// Forward edge cell stored in a parent's child list
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildRef {
    pub element_id: Uuid,
    pub element_type: ElementType,
}

/// Back-reference row from a child to its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParentRef {
    pub parent_id: Uuid,
    pub parent_type: ElementType,
    pub child_id: Uuid,
    pub child_type: ElementType,
}

/// Something a student can attempt
///
/// Both variants share the same capabilities; the tag only records which
/// kind of walkable the element is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "walkableType", content = "element", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Walkable {
    Activity(LearnerElement),
    Interactive(LearnerElement),
}

impl Walkable {
    pub fn from_element(element: LearnerElement) -> Option<Self> {
        match element.element_type {
            ElementType::Activity => Some(Walkable::Activity(element)),
            ElementType::Interactive => Some(Walkable::Interactive(element)),
            _ => None,
        }
    }

    pub fn element(&self) -> &LearnerElement {
        match self {
            Walkable::Activity(e) | Walkable::Interactive(e) => e,
        }
    }

    pub fn id(&self) -> Uuid {
        self.element().element_id
    }

    pub fn element_type(&self) -> ElementType {
        self.element().element_type
    }

    pub fn config(&self) -> Option<&str> {
        self.element().config.as_deref()
    }

    pub fn theme(&self) -> Option<&str> {
        self.element().theme.as_deref()
    }

    pub fn creator_id(&self) -> Option<Uuid> {
        self.element().creator_id
    }
}

// ============================================================================
// Deployments
// ============================================================================

/// One frozen publish of a courseware tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: Uuid,
    pub change_id: ChangeId,
    pub cohort_id: Uuid,
}

/// Deployment plus the root activity of its tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployedActivity {
    #[serde(flatten)]
    pub deployment: Deployment,
    pub activity_id: Uuid,
}

impl DeployedActivity {
    pub fn id(&self) -> Uuid {
        self.deployment.id
    }

    pub fn change_id(&self) -> ChangeId {
        self.deployment.change_id
    }
}

/// Cohort index row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CohortDeployment {
    pub cohort_id: Uuid,
    pub deployment_id: Uuid,
}

// ============================================================================
// Attempts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attempt {
    pub id: Uuid,
    /// Attempt of the enclosing walkable; never changes once written
    pub parent_id: Option<Uuid>,
    pub deployment_id: Uuid,
    pub element_id: Uuid,
    pub element_type: ElementType,
    pub student_id: Uuid,
    /// Ordinal, strictly increasing per (student, element)
    pub value: u32,
}

// ============================================================================
// Scores and Progress
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScoreReason {
    Scored,
    Unscored,
    InstructorScored,
    InstructorUnscored,
    IncompleteAttempt,
    NotAttempted,
}

impl ScoreReason {
    /// Reasons whose value counts towards a rolled-up score
    pub fn is_scored(&self) -> bool {
        matches!(self, ScoreReason::Scored | ScoreReason::InstructorScored)
    }
}

/// A numeric result whose reason distinguishes "zero" from "not applicable"
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Score {
    pub value: Option<f64>,
    pub reason: ScoreReason,
}

impl Score {
    pub fn scored(value: f64) -> Self {
        Self { value: Some(value), reason: ScoreReason::Scored }
    }

    pub fn not_attempted() -> Self {
        Self { value: None, reason: ScoreReason::NotAttempted }
    }

    /// Certainty of a completion estimate carried by this score
    pub fn completion_confidence(&self) -> f64 {
        match (self.value, self.reason) {
            (None, _) | (_, ScoreReason::NotAttempted) => 0.0,
            _ => 1.0,
        }
    }
}

/// Progress of one element under one attempt; the latest write wins
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub change_id: ChangeId,
    pub element_id: Uuid,
    pub element_type: ElementType,
    pub student_id: Uuid,
    pub attempt_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluation_id: Option<Uuid>,
    /// `None` when no child carries any weight
    pub completion_value: Option<f64>,
    pub completion_confidence: f64,
    /// Parallel to the element's progress-bearing children; containers only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_completion_values: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_completion_confidences: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<Score>,
}

impl Progress {
    pub fn is_complete(&self) -> bool {
        self.completion_value.map(|v| v >= 1.0).unwrap_or(false)
    }
}

/// Immutable fact that a walkable was completed under an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedWalkable {
    pub deployment_id: Uuid,
    pub change_id: ChangeId,
    pub student_id: Uuid,
    pub element_id: Uuid,
    pub element_attempt_id: Uuid,
    pub parent_element_id: Option<Uuid>,
    pub parent_element_attempt_id: Option<Uuid>,
    pub evaluation_id: Option<Uuid>,
    pub element_type: ElementType,
    pub parent_element_type: Option<ElementType>,
}

// ============================================================================
// Student Scope
// ============================================================================

/// Keyed variable namespace of one student within a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentScope {
    pub id: Uuid,
    pub deployment_id: Uuid,
    pub student_id: Uuid,
    pub scope_urn: Uuid,
}

/// One written value for a (scope, source) key; `id` doubles as its version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentScopeEntry {
    pub id: ChangeId,
    pub scope_id: Uuid,
    pub source_id: Uuid,
    pub student_id: Uuid,
    pub data: serde_json::Value,
}

/// Which scope was in effect when an element was evaluated for a student
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentScopeTrace {
    pub deployment_id: Uuid,
    pub student_id: Uuid,
    pub element_id: Uuid,
    pub element_type: ElementType,
    pub scope_id: Uuid,
    pub scope_urn: Uuid,
}
