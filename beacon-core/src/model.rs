use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Collection, DeviceId, EntityId};

/// Lifecycle of a locally authored write, shared by queued mutations and
/// pending messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Syncing,
    #[default]
    Synced,
    Failed,
}

impl RecordStatus {
    /// Entries eligible for the next push.
    pub fn is_outstanding(self) -> bool {
        matches!(self, RecordStatus::Pending | RecordStatus::Failed)
    }
}

/// A synchronizable entity stored in one of the engine's tables.
pub trait Record: Clone {
    const COLLECTION: Collection;

    fn id(&self) -> &str;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub creator_device_id: Option<DeviceId>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    /// Set once a server document for this id has been applied locally.
    /// Optimistic groups stay unconfirmed until then.
    #[serde(default)]
    pub confirmed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FavoriteGroup {
    pub id: EntityId,
    pub group_id: EntityId,
    pub device_id: DeviceId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: EntityId,
    pub group_id: EntityId,
    pub sender_device_id: DeviceId,
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub sync_status: RecordStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PinnedMessage {
    pub id: EntityId,
    pub group_id: EntityId,
    pub message_id: EntityId,
    pub pinned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserStatus {
    pub id: EntityId,
    pub device_id: DeviceId,
    pub status: String,
    #[serde(default)]
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

macro_rules! impl_record {
    ($($ty:ty => $collection:expr),* $(,)?) => {
        $(
            impl Record for $ty {
                const COLLECTION: Collection = $collection;

                fn id(&self) -> &str {
                    &self.id
                }
            }
        )*
    };
}

impl_record! {
    Device => Collection::Devices,
    Group => Collection::Groups,
    FavoriteGroup => Collection::FavoriteGroups,
    Message => Collection::Messages,
    PinnedMessage => Collection::PinnedMessages,
    UserStatus => Collection::UserStatus,
}
