//! Service layer for courseware-ledger
//!
//! Services hold the ledger's rules on top of the typed repository:
//! - Version chain (which change of a deployment is current)
//! - Tree mirror (published tree as parent/child indexes)
//! - Attempt ledger, progress aggregation, student scopes
//! - Event emission for downstream collaborators
//!
//! ## Architecture
//!
//! ```text
//! Evaluation / publish pipelines
//!     ↓
//! Service Layer (this module)
//!     ↓
//! Repository (db/repository.rs)
//!     ↓
//! RowStore (SQLite or in-memory)
//! ```

pub mod attempt_ledger;
pub mod events;
pub mod progress;
pub mod scope_store;
pub mod tree_mirror;
pub mod version_chain;

// Re-exports
pub use attempt_ledger::{AttemptLedger, AttemptRequest, OrdinalSource, StoreOrdinalSource};
pub use events::{EventBus, EventListener, LedgerEvent};
pub use progress::{InteractionOutcome, ProgressAggregator, ProgressUpdate};
pub use scope_store::ScopeStore;
pub use tree_mirror::{ChildSet, CoursewareNode, EdgeFault, EdgeReport, PublishRequest, TreeMirror};
pub use version_chain::{PinnedDeployment, VersionChain};

use std::sync::Arc;

use tracing::info;

use crate::change_id::ChangeId;
use crate::config::Config;
use crate::db::{Repository, RetryingStore, RowStore, SqliteStore, TenantContext};
use crate::error::StorageError;
use crate::migration::{MigrationPhase, ParentIndex};

/// Service container for dependency injection
///
/// All services share one repository and one event bus.
#[derive(Clone)]
pub struct Services {
    pub versions: VersionChain,
    pub tree: TreeMirror,
    pub attempts: AttemptLedger,
    pub progress: ProgressAggregator,
    pub scopes: ScopeStore,
    pub events: Arc<EventBus>,
}

impl Services {
    /// Wire every service over one repository
    pub fn new(repo: Repository, edge_migration: MigrationPhase, events: Arc<EventBus>) -> Self {
        let versions = VersionChain::new(repo.clone());
        let parents = ParentIndex::new(repo.clone(), edge_migration);
        let tree = TreeMirror::new(repo.clone(), parents, versions.clone(), events.clone());
        let ordinals = Arc::new(StoreOrdinalSource::new(repo.clone()));
        let attempts = AttemptLedger::new(repo.clone(), tree.clone(), ordinals, events.clone());
        let progress = ProgressAggregator::new(repo.clone(), tree.clone(), attempts.clone(), events.clone());
        let scopes = ScopeStore::new(repo, events.clone());

        Self {
            versions,
            tree,
            attempts,
            progress,
            scopes,
            events,
        }
    }

    /// Services over any store, configured from `config`
    ///
    /// Idempotent statements are retried per `config.retry`.
    pub fn with_store<S>(store: S, config: &Config) -> Self
    where
        S: RowStore + 'static,
    {
        let store: Arc<dyn RowStore> = Arc::new(RetryingStore::new(store, config.retry.clone()));
        let repo = Repository::new(store, TenantContext::new(config.keyspace.clone()), config.consistency);
        Self::new(
            repo,
            config.edge_migration,
            Arc::new(EventBus::with_capacity(config.event_capacity)),
        )
    }

    /// Open the on-disk ledger described by `config`
    pub fn open(config: &Config) -> Result<Self, StorageError> {
        config.validate()?;
        std::fs::create_dir_all(&config.storage_dir)?;
        let path = config.database_path();
        let store = SqliteStore::open(&path, config.pool_size)?;

        info!(
            path = %path.display(),
            keyspace = %config.keyspace,
            consistency = %config.consistency,
            edge_migration = %config.edge_migration,
            "Ledger opened"
        );
        Ok(Self::with_store(store, config))
    }

    /// Publish a tree and return its change id
    pub async fn publish(&self, request: &PublishRequest) -> Result<ChangeId, StorageError> {
        Ok(self.tree.publish_tree(request).await?.change_id())
    }
}
