use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Collection, DeviceId, EntityId, MutationId, RecordStatus, new_entity_id};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CreateGroup {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    pub creator_device_id: DeviceId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UpdateGroup {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddFavorite {
    pub group_id: EntityId,
    pub device_id: DeviceId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoveFavorite {
    pub group_id: EntityId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateStatus {
    pub device_id: DeviceId,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UpdateNickname {
    pub nickname: String,
}

/// One variant per mutation type; routing to a push batch is exhaustive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum MutationPayload {
    CreateGroup(CreateGroup),
    UpdateGroup(UpdateGroup),
    AddFavorite(AddFavorite),
    RemoveFavorite(RemoveFavorite),
    UpdateStatus(UpdateStatus),
    UpdateNickname(UpdateNickname),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    CreateGroup,
    UpdateGroup,
    AddFavorite,
    RemoveFavorite,
    UpdateStatus,
    UpdateNickname,
}

/// Protocol-level grouping used when building a push request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PushBatch {
    Groups,
    Favorites,
    Status,
    Devices,
}

impl MutationPayload {
    pub fn kind(&self) -> MutationKind {
        match self {
            MutationPayload::CreateGroup(_) => MutationKind::CreateGroup,
            MutationPayload::UpdateGroup(_) => MutationKind::UpdateGroup,
            MutationPayload::AddFavorite(_) => MutationKind::AddFavorite,
            MutationPayload::RemoveFavorite(_) => MutationKind::RemoveFavorite,
            MutationPayload::UpdateStatus(_) => MutationKind::UpdateStatus,
            MutationPayload::UpdateNickname(_) => MutationKind::UpdateNickname,
        }
    }

    pub fn target_collection(&self) -> Collection {
        match self {
            MutationPayload::CreateGroup(_) | MutationPayload::UpdateGroup(_) => Collection::Groups,
            MutationPayload::AddFavorite(_) | MutationPayload::RemoveFavorite(_) => {
                Collection::FavoriteGroups
            }
            MutationPayload::UpdateStatus(_) => Collection::UserStatus,
            MutationPayload::UpdateNickname(_) => Collection::Devices,
        }
    }

    pub fn batch(&self) -> PushBatch {
        match self {
            MutationPayload::CreateGroup(_) | MutationPayload::UpdateGroup(_) => PushBatch::Groups,
            MutationPayload::AddFavorite(_) | MutationPayload::RemoveFavorite(_) => {
                PushBatch::Favorites
            }
            MutationPayload::UpdateStatus(_) => PushBatch::Status,
            MutationPayload::UpdateNickname(_) => PushBatch::Devices,
        }
    }
}

impl MutationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationKind::CreateGroup => "create_group",
            MutationKind::UpdateGroup => "update_group",
            MutationKind::AddFavorite => "add_favorite",
            MutationKind::RemoveFavorite => "remove_favorite",
            MutationKind::UpdateStatus => "update_status",
            MutationKind::UpdateNickname => "update_nickname",
        }
    }
}

impl std::fmt::Display for MutationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A not-yet-acknowledged local write.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mutation {
    pub id: MutationId,
    pub payload: MutationPayload,
    pub target_collection: Collection,
    pub entity_id: EntityId,
    pub sync_status: RecordStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

impl Mutation {
    pub fn new(payload: MutationPayload, entity_id: EntityId, created_at: DateTime<Utc>) -> Self {
        Self {
            id: new_entity_id(),
            target_collection: payload.target_collection(),
            payload,
            entity_id,
            sync_status: RecordStatus::Pending,
            created_at,
            synced_at: None,
            error_message: None,
            retry_count: 0,
        }
    }

    pub fn kind(&self) -> MutationKind {
        self.payload.kind()
    }

    pub fn targets(&self, collection: crate::Collection, entity_id: &str) -> bool {
        self.target_collection == collection && self.entity_id == entity_id
    }
}
