//! Time-ordered change identifiers
//!
//! A `ChangeId` names one publish snapshot of a deployment. It wraps a
//! UUID v1 and orders by the timestamp embedded in it, so "latest" is the
//! maximum change id ever written for a deployment.
//!
//! The store has no native timeuuid ordering, so every change id also has a
//! sort key whose lexicographic order equals its time order:
//!
//! ```text
//! 000001700000000123456789-6f1c2a9e-7a5b-11ee-8000-63776c656467
//! └ seconds ─┘└ nanos ─┘ └──────────── uuid ────────────────┘
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::{Context, Timestamp, Uuid};

use crate::error::StorageError;

/// Node id stamped into locally minted change ids
const NODE_ID: [u8; 6] = *b"cwledg";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Uuid", into = "Uuid")]
pub struct ChangeId(Uuid);

impl ChangeId {
    /// Mint a change id for "now"
    pub fn new() -> Self {
        Self(Uuid::now_v1(&NODE_ID))
    }

    /// Build a change id at an explicit instant (replays, tests)
    pub fn from_unix(seconds: u64, nanos: u32, counter: u16) -> Self {
        let context = Context::new(counter);
        let ts = Timestamp::from_unix(&context, seconds, nanos);
        Self(Uuid::new_v1(ts, &NODE_ID))
    }

    /// Wrap an existing UUID; only time-based UUIDs are accepted
    pub fn from_uuid(uuid: Uuid) -> Result<Self, StorageError> {
        match uuid.get_timestamp() {
            Some(_) => Ok(Self(uuid)),
            None => Err(StorageError::InvalidInput(format!(
                "change id {} is not time-ordered (version {})",
                uuid,
                uuid.get_version_num()
            ))),
        }
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Embedded instant as (seconds, nanos) since the unix epoch
    pub fn unix_parts(&self) -> (u64, u32) {
        self.0
            .get_timestamp()
            .map(|ts| ts.to_unix())
            .unwrap_or((0, 0))
    }

    /// Lexicographically sortable storage key
    pub fn sort_key(&self) -> String {
        let (seconds, nanos) = self.unix_parts();
        format!("{:015}{:09}-{}", seconds, nanos, self.0)
    }

    /// Parse a key produced by [`ChangeId::sort_key`]
    pub fn from_sort_key(key: &str) -> Result<Self, StorageError> {
        let (_, uuid) = key
            .split_once('-')
            .ok_or_else(|| StorageError::InvalidInput(format!("malformed change key: {}", key)))?;
        let uuid = Uuid::parse_str(uuid)
            .map_err(|e| StorageError::InvalidInput(format!("malformed change key {}: {}", key, e)))?;
        Self::from_uuid(uuid)
    }
}

impl Default for ChangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl Ord for ChangeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.unix_parts()
            .cmp(&other.unix_parts())
            .then_with(|| self.0.as_bytes().cmp(other.0.as_bytes()))
    }
}

impl PartialOrd for ChangeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ChangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ChangeId {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(s)
            .map_err(|e| StorageError::InvalidInput(format!("invalid change id {}: {}", s, e)))?;
        Self::from_uuid(uuid)
    }
}

impl TryFrom<Uuid> for ChangeId {
    type Error = StorageError;

    fn try_from(uuid: Uuid) -> Result<Self, Self::Error> {
        Self::from_uuid(uuid)
    }
}

impl From<ChangeId> for Uuid {
    fn from(id: ChangeId) -> Self {
        id.0
    }
}
