//! Progress and score aggregation
//!
//! Leaf walkables get their completion straight from the evaluation
//! pipeline. Containers (activities and pathways) aggregate the progress
//! of their progress-bearing children, in tree order, under one attempt
//! scope:
//!
//! - an activity's progress is keyed by its own attempt,
//! - a pathway has no attempts of its own; its progress is keyed by the
//!   attempt of the activity that holds it,
//! - a walkable child of a pathway contributes the progress of its newest
//!   attempt made inside that activity attempt.
//!
//! Every row is an idempotent upsert keyed by (element, attempt).

use std::sync::Arc;

use futures_util::future::try_join_all;
use tracing::{debug, info};
use uuid::Uuid;

use super::attempt_ledger::AttemptLedger;
use super::events::{EventBus, LedgerEvent};
use super::tree_mirror::TreeMirror;
use super::version_chain::PinnedDeployment;
use crate::db::tables::{
    CompletionByParentKey, CompletionKey, ProgressKey, StudentProgressKey, COMPLETED_WALKABLES,
    COMPLETED_WALKABLES_BY_PARENT, PROGRESS, PROGRESS_BY_STUDENT,
};
use crate::db::{Order, Repository};
use crate::error::StorageError;
use crate::models::{derived_id, Attempt, ChildRef, CompletedWalkable, ElementType, Progress, Score};
use crate::scoring::{aggregate, rollup_score, Completion};

/// Input of one progress write
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub pin: PinnedDeployment,
    pub element_id: Uuid,
    pub element_type: ElementType,
    pub student_id: Uuid,
    pub attempt_id: Uuid,
    pub evaluation_id: Option<Uuid>,
    pub completion: Score,
    /// Child completions in tree order; `None` for leaf walkables
    pub children: Option<Vec<Completion>>,
}

/// Everything written while handling one evaluated interaction
#[derive(Debug, Clone, PartialEq)]
pub struct InteractionOutcome {
    pub leaf: Progress,
    /// Container rows rewritten on the way up, nearest first
    pub rollups: Vec<Progress>,
    pub completed: Vec<CompletedWalkable>,
}

#[derive(Clone)]
pub struct ProgressAggregator {
    repo: Repository,
    mirror: TreeMirror,
    attempts: AttemptLedger,
    events: Arc<EventBus>,
}

impl ProgressAggregator {
    pub fn new(repo: Repository, mirror: TreeMirror, attempts: AttemptLedger, events: Arc<EventBus>) -> Self {
        Self {
            repo,
            mirror,
            attempts,
            events,
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Upsert the progress row of (element, attempt)
    pub async fn record_progress(&self, update: ProgressUpdate) -> Result<Progress, StorageError> {
        let score_finite = update.completion.value.map_or(true, f64::is_finite);
        let children_finite = update
            .children
            .iter()
            .flatten()
            .all(|c| c.value.is_finite() && c.confidence.is_finite());
        if !score_finite || !children_finite {
            return Err(StorageError::InvalidInput(format!(
                "non-finite completion for element {} under attempt {}",
                update.element_id, update.attempt_id
            )));
        }

        let (completion_value, completion_confidence, child_values, child_confidences) = match &update.children {
            Some(children) => {
                let rolled = aggregate(children);
                (
                    rolled.value,
                    rolled.confidence,
                    Some(rolled.child_values),
                    Some(rolled.child_confidences),
                )
            }
            None => {
                let leaf = Completion::from_score(&update.completion);
                (Some(leaf.value), leaf.confidence, None, None)
            }
        };

        let progress = Progress {
            id: derived_id(&[
                "progress",
                &update.element_id.to_string(),
                &update.attempt_id.to_string(),
            ]),
            deployment_id: update.pin.deployment_id,
            change_id: update.pin.change_id,
            element_id: update.element_id,
            element_type: update.element_type,
            student_id: update.student_id,
            attempt_id: update.attempt_id,
            evaluation_id: update.evaluation_id,
            completion_value,
            completion_confidence,
            child_completion_values: child_values,
            child_completion_confidences: child_confidences,
            score: Some(update.completion),
        };

        self.repo
            .put(
                PROGRESS,
                &ProgressKey {
                    element_id: progress.element_id,
                    attempt_id: progress.attempt_id,
                },
                &progress,
            )
            .await?;
        self.repo
            .put(
                PROGRESS_BY_STUDENT,
                &StudentProgressKey {
                    deployment_id: progress.deployment_id,
                    student_id: progress.student_id,
                    element_id: progress.element_id,
                    attempt_id: progress.attempt_id,
                },
                &progress,
            )
            .await?;

        debug!(
            element_id = %progress.element_id,
            attempt_id = %progress.attempt_id,
            completion = ?progress.completion_value,
            confidence = progress.completion_confidence,
            "Progress recorded"
        );
        self.events.emit(LedgerEvent::ProgressRecorded {
            deployment_id: progress.deployment_id,
            student_id: progress.student_id,
            element_id: progress.element_id,
            element_type: progress.element_type,
            attempt_id: progress.attempt_id,
            completion_value: progress.completion_value,
        });
        Ok(progress)
    }

    /// Progress of a leaf walkable, straight from its evaluation score
    pub async fn record_leaf_progress(
        &self,
        pin: PinnedDeployment,
        attempt: &Attempt,
        evaluation_id: Option<Uuid>,
        score: Score,
    ) -> Result<Progress, StorageError> {
        self.record_progress(ProgressUpdate {
            pin,
            element_id: attempt.element_id,
            element_type: attempt.element_type,
            student_id: attempt.student_id,
            attempt_id: attempt.id,
            evaluation_id,
            completion: score,
            children: None,
        })
        .await
    }

    /// Re-aggregate a container from its children's stored progress
    ///
    /// `scope_attempt_id` is the activity attempt the container's progress
    /// is keyed under. Children without progress count as not attempted.
    pub async fn record_container_progress(
        &self,
        pin: PinnedDeployment,
        element_id: Uuid,
        student_id: Uuid,
        scope_attempt_id: Uuid,
        evaluation_id: Option<Uuid>,
    ) -> Result<Progress, StorageError> {
        let element = self
            .mirror
            .find_element(pin, element_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("element {} in {}", element_id, pin)))?;
        if !element.element_type.is_container() {
            return Err(StorageError::InvalidInput(format!(
                "{} {} does not aggregate children",
                element.element_type, element_id
            )));
        }

        let children = self.mirror.find_children(pin, element_id).await?.progress_bearing();
        let child_progress = try_join_all(
            children
                .iter()
                .map(|child| self.child_progress(*child, student_id, scope_attempt_id)),
        )
        .await?;

        let completions: Vec<Completion> = child_progress
            .iter()
            .map(|p| p.as_ref().map(completion_of).unwrap_or(Completion::NOT_ATTEMPTED))
            .collect();
        let scores: Vec<Option<Score>> = child_progress.iter().map(|p| p.as_ref().and_then(|p| p.score)).collect();

        self.record_progress(ProgressUpdate {
            pin,
            element_id,
            element_type: element.element_type,
            student_id,
            attempt_id: scope_attempt_id,
            evaluation_id,
            completion: rollup_score(&scores),
            children: Some(completions),
        })
        .await
    }

    /// Record that a walkable was completed under an attempt
    ///
    /// Keyed by (student, element, attempt): completing twice under the same
    /// attempt rewrites the same row.
    pub async fn complete_walkable(&self, fact: &CompletedWalkable) -> Result<(), StorageError> {
        if !fact.element_type.is_walkable() {
            return Err(StorageError::InvalidInput(format!(
                "{} {} is not walkable",
                fact.element_type, fact.element_id
            )));
        }

        self.repo
            .put(
                COMPLETED_WALKABLES,
                &CompletionKey {
                    student_id: fact.student_id,
                    element_id: fact.element_id,
                    element_attempt_id: fact.element_attempt_id,
                },
                fact,
            )
            .await?;
        if let (Some(parent_element_id), Some(parent_attempt_id)) =
            (fact.parent_element_id, fact.parent_element_attempt_id)
        {
            self.repo
                .put(
                    COMPLETED_WALKABLES_BY_PARENT,
                    &CompletionByParentKey {
                        student_id: fact.student_id,
                        parent_element_id,
                        parent_attempt_id,
                        element_id: fact.element_id,
                        element_attempt_id: fact.element_attempt_id,
                    },
                    fact,
                )
                .await?;
        }

        self.events.emit(LedgerEvent::WalkableCompleted {
            deployment_id: fact.deployment_id,
            student_id: fact.student_id,
            element_id: fact.element_id,
            element_attempt_id: fact.element_attempt_id,
        });
        Ok(())
    }

    /// Handle one evaluated interaction end to end
    ///
    /// Records the leaf's progress, marks it complete at full completion,
    /// then re-aggregates every container up to the root.
    pub async fn evaluate_interaction(
        &self,
        pin: PinnedDeployment,
        attempt_id: Uuid,
        evaluation_id: Option<Uuid>,
        score: Score,
    ) -> Result<InteractionOutcome, StorageError> {
        let attempt = self.require_attempt(attempt_id).await?;
        if attempt.element_type.is_container() {
            return Err(StorageError::InvalidInput(format!(
                "{} {} is aggregated from its children, not evaluated",
                attempt.element_type, attempt.element_id
            )));
        }
        if self.mirror.find_walkable(pin, attempt.element_id).await?.is_none() {
            return Err(StorageError::NotFound(format!(
                "walkable {} in {}",
                attempt.element_id, pin
            )));
        }

        let leaf = self.record_leaf_progress(pin, &attempt, evaluation_id, score).await?;
        let mut completed = Vec::new();
        if leaf.is_complete() {
            completed.push(self.complete(pin, &attempt, evaluation_id).await?);
        }

        let mut rollups = Vec::new();
        let mut scope = attempt.parent_id;
        for edge in self.mirror.ancestry(pin, attempt.element_id).await? {
            let Some(scope_attempt_id) = scope else {
                break;
            };
            match edge.parent_type {
                ElementType::Pathway => {
                    let progress = self
                        .record_container_progress(pin, edge.parent_id, attempt.student_id, scope_attempt_id, evaluation_id)
                        .await?;
                    rollups.push(progress);
                }
                ElementType::Activity => {
                    let activity_attempt = self.require_attempt(scope_attempt_id).await?;
                    let progress = self
                        .record_container_progress(pin, edge.parent_id, attempt.student_id, scope_attempt_id, evaluation_id)
                        .await?;
                    if progress.is_complete() {
                        completed.push(self.complete(pin, &activity_attempt, evaluation_id).await?);
                    }
                    rollups.push(progress);
                    scope = activity_attempt.parent_id;
                }
                _ => break,
            }
        }

        info!(
            attempt_id = %attempt_id,
            element_id = %attempt.element_id,
            rollups = rollups.len(),
            completed = completed.len(),
            "Interaction evaluated"
        );
        Ok(InteractionOutcome {
            leaf,
            rollups,
            completed,
        })
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn find_progress(&self, element_id: Uuid, attempt_id: Uuid) -> Result<Option<Progress>, StorageError> {
        self.repo
            .get(PROGRESS, &ProgressKey { element_id, attempt_id })
            .await
    }

    /// Progress under the student's newest attempt on a walkable
    ///
    /// Pathways have no attempts; read them with [`Self::find_progress`]
    /// and the enclosing activity's attempt.
    pub async fn find_latest_progress(&self, student_id: Uuid, element_id: Uuid) -> Result<Option<Progress>, StorageError> {
        match self.attempts.find_latest_attempt(student_id, element_id).await? {
            Some(attempt) => self.find_progress(element_id, attempt.id).await,
            None => Ok(None),
        }
    }

    /// Every progress row of a student in a deployment
    pub async fn find_student_progress(&self, deployment_id: Uuid, student_id: Uuid) -> Result<Vec<Progress>, StorageError> {
        self.repo
            .scan(
                PROGRESS_BY_STUDENT,
                StudentProgressKey::partition(&deployment_id, &student_id),
                Order::Asc,
                None,
            )
            .await
    }

    pub async fn find_completed_by_element(
        &self,
        student_id: Uuid,
        element_id: Uuid,
    ) -> Result<Vec<CompletedWalkable>, StorageError> {
        self.repo
            .scan(
                COMPLETED_WALKABLES,
                CompletionKey::partition(&student_id, &element_id),
                Order::Asc,
                None,
            )
            .await
    }

    pub async fn find_completed_by_parent(
        &self,
        student_id: Uuid,
        parent_element_id: Uuid,
        parent_attempt_id: Uuid,
    ) -> Result<Vec<CompletedWalkable>, StorageError> {
        self.repo
            .scan(
                COMPLETED_WALKABLES_BY_PARENT,
                CompletionByParentKey::partition(&student_id, &parent_element_id, &parent_attempt_id),
                Order::Asc,
                None,
            )
            .await
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn child_progress(
        &self,
        child: ChildRef,
        student_id: Uuid,
        scope_attempt_id: Uuid,
    ) -> Result<Option<Progress>, StorageError> {
        if !child.element_type.is_walkable() {
            return self.find_progress(child.element_id, scope_attempt_id).await;
        }
        match self
            .attempts
            .find_latest_attempt_within(student_id, child.element_id, scope_attempt_id)
            .await?
        {
            Some(attempt) => self.find_progress(child.element_id, attempt.id).await,
            None => Ok(None),
        }
    }

    async fn complete(
        &self,
        pin: PinnedDeployment,
        attempt: &Attempt,
        evaluation_id: Option<Uuid>,
    ) -> Result<CompletedWalkable, StorageError> {
        let parent = match attempt.parent_id {
            Some(parent_id) => self.attempts.get_attempt(parent_id).await?,
            None => None,
        };
        let fact = CompletedWalkable {
            deployment_id: pin.deployment_id,
            change_id: pin.change_id,
            student_id: attempt.student_id,
            element_id: attempt.element_id,
            element_attempt_id: attempt.id,
            parent_element_id: parent.map(|p| p.element_id),
            parent_element_attempt_id: parent.map(|p| p.id),
            evaluation_id,
            element_type: attempt.element_type,
            parent_element_type: parent.map(|p| p.element_type),
        };
        self.complete_walkable(&fact).await?;
        Ok(fact)
    }

    async fn require_attempt(&self, attempt_id: Uuid) -> Result<Attempt, StorageError> {
        self.attempts
            .get_attempt(attempt_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("attempt {}", attempt_id)))
    }
}

fn completion_of(progress: &Progress) -> Completion {
    Completion {
        value: progress.completion_value.unwrap_or(0.0),
        confidence: progress.completion_confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change_id::ChangeId;
    use crate::consistency::Consistency;
    use crate::db::{MemoryStore, TenantContext};
    use crate::migration::{MigrationPhase, ParentIndex};
    use crate::models::ScoreReason;
    use crate::services::attempt_ledger::{AttemptRequest, StoreOrdinalSource};
    use crate::services::tree_mirror::{CoursewareNode, PublishRequest};
    use crate::services::version_chain::VersionChain;

    struct Fixture {
        aggregator: ProgressAggregator,
        mirror: TreeMirror,
        attempts: AttemptLedger,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let repo = Repository::new(store, TenantContext::default(), Consistency::Quorum);
        let events = Arc::new(EventBus::new());
        let chain = VersionChain::new(repo.clone());
        let parents = ParentIndex::new(repo.clone(), MigrationPhase::DualWrite);
        let mirror = TreeMirror::new(repo.clone(), parents, chain, events.clone());
        let ordinals = Arc::new(StoreOrdinalSource::new(repo.clone()));
        let attempts = AttemptLedger::new(repo.clone(), mirror.clone(), ordinals, events.clone());
        let aggregator = ProgressAggregator::new(repo, mirror.clone(), attempts.clone(), events);
        Fixture {
            aggregator,
            mirror,
            attempts,
        }
    }

    fn pin() -> PinnedDeployment {
        PinnedDeployment::new(Uuid::new_v4(), ChangeId::from_unix(1_700_000_000, 0, 0))
    }

    fn leaf_update(pin: PinnedDeployment, attempt_id: Uuid, score: Score) -> ProgressUpdate {
        ProgressUpdate {
            pin,
            element_id: Uuid::nil(),
            element_type: ElementType::Interactive,
            student_id: Uuid::nil(),
            attempt_id,
            evaluation_id: None,
            completion: score,
            children: None,
        }
    }

    #[tokio::test]
    async fn test_record_progress_is_idempotent() {
        let f = fixture();
        let update = leaf_update(pin(), Uuid::new_v4(), Score::scored(0.333333333));

        let first = f.aggregator.record_progress(update.clone()).await.unwrap();
        let second = f.aggregator.record_progress(update.clone()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.completion_value, Some(0.33333));

        let stored = f.aggregator.find_progress(Uuid::nil(), update.attempt_id).await.unwrap();
        assert_eq!(stored, Some(first));
        assert_eq!(
            f.aggregator
                .find_student_progress(update.pin.deployment_id, Uuid::nil())
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_record_progress_rejects_non_finite_score() {
        let f = fixture();
        let pin = pin();
        for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let update = leaf_update(pin, Uuid::new_v4(), Score::scored(value));
            let err = f.aggregator.record_progress(update.clone()).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidInput(_)), "{:?}", err);
            assert_eq!(f.aggregator.find_progress(Uuid::nil(), update.attempt_id).await.unwrap(), None);
        }

        let mut container = leaf_update(pin, Uuid::new_v4(), Score::not_attempted());
        container.element_type = ElementType::Pathway;
        container.children = Some(vec![Completion { value: f64::NAN, confidence: 1.0 }]);
        assert!(matches!(
            f.aggregator.record_progress(container).await,
            Err(StorageError::InvalidInput(_))
        ));
        assert!(f
            .aggregator
            .find_student_progress(pin.deployment_id, Uuid::nil())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_container_record_keeps_parallel_child_arrays() {
        let f = fixture();
        let mut update = leaf_update(pin(), Uuid::new_v4(), Score::not_attempted());
        update.element_type = ElementType::Pathway;
        update.children = Some(vec![
            Completion { value: 0.5, confidence: 1.0 },
            Completion { value: 1.0, confidence: 0.0 },
        ]);

        let progress = f.aggregator.record_progress(update).await.unwrap();
        assert_eq!(progress.completion_value, Some(0.5));
        assert_eq!(progress.completion_confidence, 0.5);
        assert_eq!(progress.child_completion_values, Some(vec![0.5, 1.0]));
        assert_eq!(progress.child_completion_confidences, Some(vec![1.0, 0.0]));
    }

    #[tokio::test]
    async fn test_unattempted_children_leave_completion_undefined() {
        let f = fixture();
        let interactive = CoursewareNode::new(Uuid::new_v4(), ElementType::Interactive);
        let pathway = CoursewareNode::new(Uuid::new_v4(), ElementType::Pathway).with_child(interactive);
        let request = PublishRequest {
            deployment_id: Uuid::new_v4(),
            cohort_id: Uuid::nil(),
            change_id: ChangeId::new(),
            root: CoursewareNode::new(Uuid::new_v4(), ElementType::Activity).with_child(pathway.clone()),
        };
        f.mirror.publish_tree(&request).await.unwrap();

        let activity_attempt = f
            .attempts
            .new_attempt(AttemptRequest {
                deployment_id: request.deployment_id,
                student_id: Uuid::nil(),
                element_id: request.root.element_id,
                element_type: ElementType::Activity,
                parent_attempt_id: None,
            })
            .await
            .unwrap();

        let progress = f
            .aggregator
            .record_container_progress(request.pin(), pathway.element_id, Uuid::nil(), activity_attempt.id, None)
            .await
            .unwrap();
        assert_eq!(progress.completion_value, None);
        assert_eq!(progress.completion_confidence, 0.0);
        assert_eq!(progress.score.map(|s| s.reason), Some(ScoreReason::NotAttempted));
        assert_eq!(progress.child_completion_values, Some(vec![0.0]));
    }

    #[tokio::test]
    async fn test_complete_walkable_twice_is_one_fact() {
        let f = fixture();
        let fact = CompletedWalkable {
            deployment_id: Uuid::nil(),
            change_id: ChangeId::from_unix(1_700_000_000, 0, 0),
            student_id: Uuid::new_v4(),
            element_id: Uuid::new_v4(),
            element_attempt_id: Uuid::new_v4(),
            parent_element_id: Some(Uuid::new_v4()),
            parent_element_attempt_id: Some(Uuid::new_v4()),
            evaluation_id: None,
            element_type: ElementType::Interactive,
            parent_element_type: Some(ElementType::Activity),
        };

        f.aggregator.complete_walkable(&fact).await.unwrap();
        f.aggregator.complete_walkable(&fact).await.unwrap();

        let by_element = f
            .aggregator
            .find_completed_by_element(fact.student_id, fact.element_id)
            .await
            .unwrap();
        assert_eq!(by_element, vec![fact]);

        let by_parent = f
            .aggregator
            .find_completed_by_parent(
                fact.student_id,
                fact.parent_element_id.unwrap(),
                fact.parent_element_attempt_id.unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(by_parent, vec![fact]);
    }

    #[tokio::test]
    async fn test_complete_walkable_rejects_pathway() {
        let f = fixture();
        let fact = CompletedWalkable {
            deployment_id: Uuid::nil(),
            change_id: ChangeId::from_unix(1_700_000_000, 0, 0),
            student_id: Uuid::nil(),
            element_id: Uuid::nil(),
            element_attempt_id: Uuid::nil(),
            parent_element_id: None,
            parent_element_attempt_id: None,
            evaluation_id: None,
            element_type: ElementType::Pathway,
            parent_element_type: None,
        };
        assert!(matches!(
            f.aggregator.complete_walkable(&fact).await,
            Err(StorageError::InvalidInput(_))
        ));
    }
}
