//! Courseware Ledger - deployment versioning and learner progress
//!
//! Freezes authored courseware trees into immutable, versioned deployment
//! snapshots and tracks students' attempts, progress and scores against
//! them, on top of a wide-column style store with no multi-row
//! transactions.
//!
//! ## Architecture
//!
//! - **Version chain**: which change of a deployment is current
//! - **Tree mirror**: parent/child indexes of each published snapshot
//! - **Attempt ledger**: parent-linked attempts per student and element
//! - **Progress aggregator**: weighted completion rolled up the tree
//! - **Scope store**: per-student variables with history and latest views
//!
//! ## Consistency
//!
//! Every statement carries one configured consistency level and an
//! idempotency flag. Upserts are retried on transient failures; list
//! appends (child edges) never are, and readers de-duplicate them.
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/courseware-ledger/
//! ├── ledger.db      # SQLite: ledger_rows, ledger_lists
//! └── config.toml    # Configuration
//! ```

pub mod change_id;
pub mod config;
pub mod consistency;
pub mod db;
pub mod error;
pub mod migration;
pub mod models;
pub mod scoring;
pub mod services;

// Re-exports
pub use change_id::ChangeId;
pub use config::Config;
pub use consistency::{Consistency, Idempotency, Table, WriteKind};
pub use db::{MemoryStore, Repository, RetryingStore, RowStore, SqliteStore, TenantContext};
pub use error::StorageError;
pub use migration::{MigrationPhase, ParentIndex};
pub use models::{
    Attempt, ChildRef, CompletedWalkable, DeployedActivity, Deployment, ElementType, LearnerElement, ParentRef,
    Progress, Score, ScoreReason, StudentScope, StudentScopeEntry, StudentScopeTrace, Walkable,
};
pub use scoring::{clamp_fold, format_precision, weighted_completion, Completion};
pub use services::{
    AttemptLedger, AttemptRequest, ChildSet, CoursewareNode, EdgeReport, EventBus, LedgerEvent, PinnedDeployment,
    ProgressAggregator, PublishRequest, ScopeStore, Services, TreeMirror, VersionChain,
};
