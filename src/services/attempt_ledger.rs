//! Attempt ledger
//!
//! Attempts are numbered per (student, element) and linked to the attempt
//! of the enclosing walkable. An ordinal is taken by a conditional insert
//! into the by-element index; a caller that loses the race moves on to the
//! next ordinal. Ids are derived from the ordinal and the parent attempt,
//! so a retried `new_attempt` that already claimed its ordinal finds its
//! own row instead of minting a second attempt.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use super::events::{EventBus, LedgerEvent};
use super::tree_mirror::TreeMirror;
use crate::db::tables::{AttemptKey, StudentElementKey, ATTEMPTS, ATTEMPTS_BY_ELEMENT};
use crate::db::{Order, Repository};
use crate::error::StorageError;
use crate::models::{derived_id, Attempt, ElementType};

/// Ordinals tried past the first before giving up on a contended element
const MAX_CLAIMS: u32 = 16;

/// Supplies the next attempt ordinal for (student, element)
#[async_trait]
pub trait OrdinalSource: Send + Sync {
    async fn next_ordinal(&self, student_id: Uuid, element_id: Uuid) -> Result<u32, StorageError>;
}

/// Ordinal one past the newest stored attempt
pub struct StoreOrdinalSource {
    repo: Repository,
}

impl StoreOrdinalSource {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl OrdinalSource for StoreOrdinalSource {
    async fn next_ordinal(&self, student_id: Uuid, element_id: Uuid) -> Result<u32, StorageError> {
        let latest: Option<Attempt> = self
            .repo
            .latest(ATTEMPTS_BY_ELEMENT, StudentElementKey::partition(&student_id, &element_id))
            .await?;
        Ok(latest.map(|a| a.value.saturating_add(1)).unwrap_or(1))
    }
}

/// What a new attempt is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptRequest {
    pub deployment_id: Uuid,
    pub student_id: Uuid,
    pub element_id: Uuid,
    pub element_type: ElementType,
    pub parent_attempt_id: Option<Uuid>,
}

impl AttemptRequest {
    /// Id of the attempt this request creates at `ordinal`
    pub fn attempt_id(&self, ordinal: u32) -> Uuid {
        let parent = self
            .parent_attempt_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "root".to_string());
        derived_id(&[
            "attempt",
            &self.student_id.to_string(),
            &self.element_id.to_string(),
            &ordinal.to_string(),
            &parent,
        ])
    }

    fn attempt(&self, ordinal: u32) -> Attempt {
        Attempt {
            id: self.attempt_id(ordinal),
            parent_id: self.parent_attempt_id,
            deployment_id: self.deployment_id,
            element_id: self.element_id,
            element_type: self.element_type,
            student_id: self.student_id,
            value: ordinal,
        }
    }
}

#[derive(Clone)]
pub struct AttemptLedger {
    repo: Repository,
    mirror: TreeMirror,
    ordinals: Arc<dyn OrdinalSource>,
    events: Arc<EventBus>,
}

impl AttemptLedger {
    pub fn new(repo: Repository, mirror: TreeMirror, ordinals: Arc<dyn OrdinalSource>, events: Arc<EventBus>) -> Self {
        Self {
            repo,
            mirror,
            ordinals,
            events,
        }
    }

    /// Start the next attempt of a student on an element
    pub async fn new_attempt(&self, request: AttemptRequest) -> Result<Attempt, StorageError> {
        if let Some(parent_id) = request.parent_attempt_id {
            self.check_parent(&request, parent_id).await?;
        }

        let latest = self.find_latest_attempt(request.student_id, request.element_id).await?;
        let mut ordinal = self
            .ordinals
            .next_ordinal(request.student_id, request.element_id)
            .await?;
        if let Some(latest) = latest {
            if ordinal <= latest.value {
                return Err(StorageError::InvalidInput(format!(
                    "ordinal {} does not follow {} for element {}",
                    ordinal, latest.value, request.element_id
                )));
            }
        }

        for _ in 0..=MAX_CLAIMS {
            let attempt = request.attempt(ordinal);
            let key = StudentElementKey {
                student_id: attempt.student_id,
                element_id: attempt.element_id,
                ordinal,
            };

            // The attempt row goes first so a claimed ordinal always resolves
            self.repo.put(ATTEMPTS, &AttemptKey { attempt_id: attempt.id }, &attempt).await?;
            let claimed = self.repo.insert_if_absent(ATTEMPTS_BY_ELEMENT, &key, &attempt).await?;
            if !claimed {
                let holder = self.repo.get(ATTEMPTS_BY_ELEMENT, &key).await?;
                if holder.map(|h| h.id) != Some(attempt.id) {
                    debug!(element_id = %attempt.element_id, ordinal, "Ordinal taken, trying the next one");
                    ordinal = ordinal.checked_add(1).ok_or_else(|| {
                        StorageError::InvalidInput(format!("ordinals exhausted for element {}", request.element_id))
                    })?;
                    continue;
                }
            }

            debug!(attempt_id = %attempt.id, element_id = %attempt.element_id, ordinal, "New attempt");
            self.events.emit(LedgerEvent::AttemptStarted {
                attempt_id: attempt.id,
                student_id: attempt.student_id,
                element_id: attempt.element_id,
                ordinal,
            });
            return Ok(attempt);
        }

        warn!(
            student_id = %request.student_id,
            element_id = %request.element_id,
            "Gave up claiming an attempt ordinal"
        );
        Err(StorageError::Transient(format!(
            "attempt ordinals for element {} are contended",
            request.element_id
        )))
    }

    /// The parent must be the same student's attempt on the nearest walkable
    /// enclosing the element in the latest published tree
    async fn check_parent(&self, request: &AttemptRequest, parent_id: Uuid) -> Result<(), StorageError> {
        let parent = self
            .get_attempt(parent_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("parent attempt {}", parent_id)))?;
        if parent.student_id != request.student_id || parent.deployment_id != request.deployment_id {
            return Err(StorageError::InvalidInput(format!(
                "parent attempt {} belongs to another student or deployment",
                parent_id
            )));
        }

        let pin = self.mirror.versions().require_pin(request.deployment_id).await?;
        let enclosing = self.mirror.enclosing_walkable(pin, request.element_id).await?;
        if enclosing.map(|edge| edge.parent_id) != Some(parent.element_id) {
            return Err(StorageError::InvalidInput(format!(
                "parent attempt {} is on element {}, which does not enclose {}",
                parent_id, parent.element_id, request.element_id
            )));
        }
        Ok(())
    }

    pub async fn get_attempt(&self, attempt_id: Uuid) -> Result<Option<Attempt>, StorageError> {
        self.repo.get(ATTEMPTS, &AttemptKey { attempt_id }).await
    }

    pub async fn find_latest_attempt(&self, student_id: Uuid, element_id: Uuid) -> Result<Option<Attempt>, StorageError> {
        self.repo
            .latest(ATTEMPTS_BY_ELEMENT, StudentElementKey::partition(&student_id, &element_id))
            .await
    }

    /// All attempts of a student on an element, oldest first
    pub async fn find_attempts(&self, student_id: Uuid, element_id: Uuid) -> Result<Vec<Attempt>, StorageError> {
        self.repo
            .scan(
                ATTEMPTS_BY_ELEMENT,
                StudentElementKey::partition(&student_id, &element_id),
                Order::Asc,
                None,
            )
            .await
    }

    /// Newest attempt on an element made inside the given parent attempt
    pub async fn find_latest_attempt_within(
        &self,
        student_id: Uuid,
        element_id: Uuid,
        parent_attempt_id: Uuid,
    ) -> Result<Option<Attempt>, StorageError> {
        let attempts = self
            .repo
            .scan(
                ATTEMPTS_BY_ELEMENT,
                StudentElementKey::partition(&student_id, &element_id),
                Order::Desc,
                None,
            )
            .await?;
        Ok(attempts.into_iter().find(|a| a.parent_id == Some(parent_attempt_id)))
    }

    /// The attempt followed by its ancestors up to the root attempt
    pub async fn attempt_chain(&self, attempt_id: Uuid) -> Result<Vec<Attempt>, StorageError> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Some(attempt_id);

        while let Some(id) = next {
            if !seen.insert(id) {
                return Err(StorageError::Internal(format!("attempt chain loops at {}", id)));
            }
            let attempt = self
                .get_attempt(id)
                .await?
                .ok_or_else(|| StorageError::NotFound(format!("attempt {}", id)))?;
            next = attempt.parent_id;
            chain.push(attempt);
        }
        Ok(chain)
    }
}
