//! Error types for courseware-ledger
//!
//! Absence of a row is not an error: lookups return `Option` or an empty
//! collection. The variants here cover the remaining failure classes.

use thiserror::Error;
use uuid::Uuid;

use crate::change_id::ChangeId;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// Store unavailable, busy, or timed out. Idempotent statements may be retried.
    #[error("Transient storage failure: {0}")]
    Transient(String),

    /// A non-idempotent edge write (or a write after it) failed mid-publish.
    /// The snapshot is not visible as latest until the publish is retried in full.
    #[error("Publish incomplete for deployment {deployment_id} at change {change_id}, retry: {reason}")]
    PublishIncomplete {
        deployment_id: Uuid,
        change_id: ChangeId,
        reason: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Whether the failure may clear up on its own (retry candidates)
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }

    /// Map a diesel error, treating busy/locked SQLite as transient
    pub fn from_diesel(e: diesel::result::Error) -> Self {
        use diesel::result::Error as DieselError;

        match &e {
            DieselError::DatabaseError(_, info) => {
                let message = info.message().to_ascii_lowercase();
                if message.contains("locked") || message.contains("busy") {
                    StorageError::Transient(info.message().to_string())
                } else {
                    StorageError::Database(e)
                }
            }
            _ => StorageError::Database(e),
        }
    }
}
