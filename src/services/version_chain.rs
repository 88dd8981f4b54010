//! Version chain: which change of a deployment is current
//!
//! A deployment is republished by writing a new row under a new change id;
//! old rows are kept for replaying historical evaluations. "Latest" is the
//! row with the greatest change id, read as a single descending `LIMIT 1`.

use futures_util::future::try_join_all;
use uuid::Uuid;

use crate::change_id::ChangeId;
use crate::db::tables::{CohortKey, DeploymentKey, DEPLOYMENTS, DEPLOYMENTS_BY_COHORT};
use crate::db::{Order, Repository};
use crate::error::StorageError;
use crate::models::{CohortDeployment, DeployedActivity};

/// A deployment resolved to one change for the length of a read sequence
///
/// Multi-step reads (element, then children, then progress) go through a
/// pin so a concurrent republish cannot mix two snapshots in one answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PinnedDeployment {
    pub deployment_id: Uuid,
    pub change_id: ChangeId,
}

impl PinnedDeployment {
    pub fn new(deployment_id: Uuid, change_id: ChangeId) -> Self {
        Self {
            deployment_id,
            change_id,
        }
    }
}

impl std::fmt::Display for PinnedDeployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.deployment_id, self.change_id)
    }
}

#[derive(Clone)]
pub struct VersionChain {
    repo: Repository,
}

impl VersionChain {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Make a published snapshot visible
    ///
    /// The deployment row is written last: once it exists the change is
    /// the latest one, so everything it points to must already be stored.
    pub async fn record(&self, deployed: &DeployedActivity) -> Result<(), StorageError> {
        let deployment = deployed.deployment;
        self.repo
            .put(
                DEPLOYMENTS_BY_COHORT,
                &CohortKey {
                    cohort_id: deployment.cohort_id,
                    deployment_id: deployment.id,
                },
                &CohortDeployment {
                    cohort_id: deployment.cohort_id,
                    deployment_id: deployment.id,
                },
            )
            .await?;
        self.repo
            .put(
                DEPLOYMENTS,
                &DeploymentKey {
                    deployment_id: deployment.id,
                    change_id: deployment.change_id,
                },
                deployed,
            )
            .await
    }

    /// Greatest change id of a deployment; `None` means never published
    pub async fn latest_change_id(&self, deployment_id: Uuid) -> Result<Option<ChangeId>, StorageError> {
        Ok(self.find_latest(deployment_id).await?.map(|d| d.change_id()))
    }

    pub async fn find_latest(&self, deployment_id: Uuid) -> Result<Option<DeployedActivity>, StorageError> {
        self.repo
            .latest(DEPLOYMENTS, DeploymentKey::partition(&deployment_id))
            .await
    }

    pub async fn find(&self, deployment_id: Uuid, change_id: ChangeId) -> Result<Option<DeployedActivity>, StorageError> {
        self.repo
            .get(
                DEPLOYMENTS,
                &DeploymentKey {
                    deployment_id,
                    change_id,
                },
            )
            .await
    }

    /// All published changes, newest first
    pub async fn list_changes(&self, deployment_id: Uuid) -> Result<Vec<ChangeId>, StorageError> {
        let rows = self
            .repo
            .scan(DEPLOYMENTS, DeploymentKey::partition(&deployment_id), Order::Desc, None)
            .await?;
        Ok(rows.into_iter().map(|d| d.change_id()).collect())
    }

    /// Published deployments of a cohort
    ///
    /// The cohort row is written before the deployment row, so a publish cut
    /// off between the two leaves a cohort row with nothing behind it. Only
    /// deployments with a latest change are listed.
    pub async fn find_by_cohort(&self, cohort_id: Uuid) -> Result<Vec<CohortDeployment>, StorageError> {
        let rows: Vec<CohortDeployment> = self
            .repo
            .scan(DEPLOYMENTS_BY_COHORT, CohortKey::partition(&cohort_id), Order::Asc, None)
            .await?;
        let latest = try_join_all(rows.iter().map(|row| self.latest_change_id(row.deployment_id))).await?;
        Ok(rows
            .into_iter()
            .zip(latest)
            .filter_map(|(row, change)| change.map(|_| row))
            .collect())
    }

    /// Resolve latest once for a read sequence
    pub async fn pin(&self, deployment_id: Uuid) -> Result<Option<PinnedDeployment>, StorageError> {
        Ok(self
            .latest_change_id(deployment_id)
            .await?
            .map(|change_id| PinnedDeployment::new(deployment_id, change_id)))
    }

    /// Like [`VersionChain::pin`] for callers that need the content to exist
    pub async fn require_pin(&self, deployment_id: Uuid) -> Result<PinnedDeployment, StorageError> {
        self.pin(deployment_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("content not yet available: deployment {}", deployment_id)))
    }
}
