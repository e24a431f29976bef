use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, FixedOffset};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod model;
pub mod mutation;
pub mod protocol;
pub mod status;

pub use model::{
    Device, FavoriteGroup, Group, Message, PinnedMessage, Record, RecordStatus, UserStatus,
};
pub use mutation::{
    AddFavorite, CreateGroup, Mutation, MutationKind, MutationPayload, PushBatch, RemoveFavorite,
    UpdateGroup, UpdateNickname, UpdateStatus,
};
pub use protocol::{
    DeletionSignal, Envelope, EnvelopeKind, PullDocument, PullRequest, PullResponse,
    PushRecord, PushRequest,
};
pub use status::{DomainCounts, StatusInputs, SyncState, SyncStatus, aggregate};

pub type EntityId = String;
pub type DeviceId = String;
pub type MutationId = String;

pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Jitter is applied symmetrically as a fraction of the computed delay.
pub const BACKOFF_JITTER_RATIO: f64 = 0.1;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("unknown collection {0:?}")]
    UnknownCollection(String),
    #[error("collection {0} is not replicated")]
    NotReplicated(Collection),
    #[error("invalid checkpoint {0:?}")]
    InvalidCheckpoint(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("document for {collection} is missing an id")]
    MissingId { collection: Collection },
}

/// Every table the engine knows about. Only the replicated subset is valid
/// in a pull request; `devices` is push-only.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Messages,
    Groups,
    FavoriteGroups,
    PinnedMessages,
    UserStatus,
    Devices,
}

impl Collection {
    pub const REPLICATED: [Collection; 5] = [
        Collection::Messages,
        Collection::Groups,
        Collection::FavoriteGroups,
        Collection::PinnedMessages,
        Collection::UserStatus,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Collection::Messages => "messages",
            Collection::Groups => "groups",
            Collection::FavoriteGroups => "favorite_groups",
            Collection::PinnedMessages => "pinned_messages",
            Collection::UserStatus => "user_status",
            Collection::Devices => "devices",
        }
    }

    pub fn is_replicated(self) -> bool {
        !matches!(self, Collection::Devices)
    }

    /// Collections whose entities can have queued local mutations. A server
    /// deletion in one of these also drops the queued mutations.
    pub fn supports_mutations(self) -> bool {
        matches!(
            self,
            Collection::Groups | Collection::FavoriteGroups | Collection::UserStatus
        )
    }

    pub fn parse_replicated(value: &str) -> Result<Collection, CoreError> {
        let collection = value.parse::<Collection>()?;
        if !collection.is_replicated() {
            return Err(CoreError::NotReplicated(collection));
        }
        Ok(collection)
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = CoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "messages" => Ok(Collection::Messages),
            "groups" => Ok(Collection::Groups),
            "favorite_groups" => Ok(Collection::FavoriteGroups),
            "pinned_messages" => Ok(Collection::PinnedMessages),
            "user_status" => Ok(Collection::UserStatus),
            "devices" => Ok(Collection::Devices),
            other => Err(CoreError::UnknownCollection(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    pub collection: Collection,
    pub last_synced_at: String,
}

pub fn parse_checkpoint(value: &str) -> Result<DateTime<FixedOffset>, CoreError> {
    DateTime::parse_from_rfc3339(value).map_err(|_| CoreError::InvalidCheckpoint(value.to_owned()))
}

/// Returns true when `incoming` is strictly newer than `current`.
///
/// Timestamps are compared as instants when both parse as RFC 3339, which
/// keeps `+00:00` and `Z` spellings of the same moment equal. Anything else
/// falls back to byte order so opaque server cursors still never regress.
pub fn checkpoint_advances(current: Option<&str>, incoming: &str) -> bool {
    let Some(current) = current else {
        return true;
    };
    match (parse_checkpoint(current), parse_checkpoint(incoming)) {
        (Ok(current), Ok(incoming)) => incoming > current,
        _ => incoming > current,
    }
}

/// Exponential delay for a zero-based attempt number, capped.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(cap)
}

/// `backoff_delay` with symmetric jitter, still bounded by `cap`.
pub fn backoff_with_jitter(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let delay = backoff_delay(attempt, base, cap);
    let spread = rand::rng().random_range(-BACKOFF_JITTER_RATIO..=BACKOFF_JITTER_RATIO);
    delay.mul_f64(1.0 + spread).min(cap)
}

pub fn new_entity_id() -> EntityId {
    uuid::Uuid::new_v4().to_string()
}
