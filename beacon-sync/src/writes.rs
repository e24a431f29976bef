//! Optimistic local writes. Each helper updates the local tables and queues
//! the matching mutation inside one store batch, so the UI sees the change
//! immediately and the push engine picks it up on the next cycle.

use std::sync::Arc;

use beacon_core::{
    AddFavorite, Collection, CreateGroup, Device, DeviceId, EntityId, FavoriteGroup, Group,
    Message, MutationPayload, RecordStatus, RemoveFavorite, UpdateGroup, UpdateNickname,
    UpdateStatus, UserStatus, new_entity_id,
};
use chrono::Utc;

use crate::{error::SyncError, store::LocalStore};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewGroup {
    pub name: String,
    pub description: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct LocalWriter {
    store: Arc<LocalStore>,
    device_id: DeviceId,
}

impl LocalWriter {
    pub fn new(store: Arc<LocalStore>, device_id: impl Into<DeviceId>) -> Self {
        Self {
            store,
            device_id: device_id.into(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// The group stays unconfirmed until the server's copy is pulled.
    pub fn create_group(&self, new: NewGroup) -> Result<Group, SyncError> {
        let group = Group {
            id: new_entity_id(),
            name: new.name,
            description: new.description,
            creator_device_id: Some(self.device_id.clone()),
            latitude: new.latitude,
            longitude: new.longitude,
            created_at: Utc::now(),
            updated_at: None,
            confirmed: false,
        };
        let payload = MutationPayload::CreateGroup(CreateGroup {
            name: group.name.clone(),
            description: group.description.clone(),
            latitude: group.latitude,
            longitude: group.longitude,
            creator_device_id: self.device_id.clone(),
        });
        self.store.batch(|tx| {
            tx.upsert(group.clone());
            tx.enqueue(payload, group.id.clone());
        })?;
        Ok(group)
    }

    pub fn update_group(&self, group_id: &str, change: UpdateGroup) -> Result<Group, SyncError> {
        self.store.batch(|tx| -> Result<Group, SyncError> {
            let mut group = tx
                .get::<Group>(group_id)
                .cloned()
                .ok_or_else(|| SyncError::missing(Collection::Groups, group_id))?;
            if let Some(name) = &change.name {
                group.name = name.clone();
            }
            if let Some(description) = &change.description {
                group.description = Some(description.clone());
            }
            group.updated_at = Some(Utc::now());
            tx.upsert(group.clone());
            tx.enqueue(MutationPayload::UpdateGroup(change), group_id);
            Ok(group)
        })?
    }

    pub fn add_favorite(&self, group_id: &str) -> Result<FavoriteGroup, SyncError> {
        let favorite = FavoriteGroup {
            id: new_entity_id(),
            group_id: group_id.to_owned(),
            device_id: self.device_id.clone(),
            created_at: Utc::now(),
        };
        let payload = MutationPayload::AddFavorite(AddFavorite {
            group_id: group_id.to_owned(),
            device_id: self.device_id.clone(),
        });
        self.store.batch(|tx| {
            if tx.get::<Group>(group_id).is_none() {
                return Err(SyncError::missing(Collection::Groups, group_id));
            }
            tx.upsert(favorite.clone());
            tx.enqueue(payload, favorite.id.clone());
            Ok(())
        })??;
        Ok(favorite)
    }

    /// Removes this device's favorite for the group. Returns the removed
    /// favorite ids.
    pub fn remove_favorite(&self, group_id: &str) -> Result<Vec<EntityId>, SyncError> {
        self.store.batch(|tx| {
            let favorites =
                tx.query(|f: &FavoriteGroup| f.group_id == group_id && f.device_id == self.device_id);
            if favorites.is_empty() {
                return Err(SyncError::missing(Collection::FavoriteGroups, group_id));
            }
            let mut removed = Vec::with_capacity(favorites.len());
            for favorite in favorites {
                tx.delete::<FavoriteGroup>(&favorite.id);
                tx.enqueue(
                    MutationPayload::RemoveFavorite(RemoveFavorite {
                        group_id: group_id.to_owned(),
                    }),
                    favorite.id.clone(),
                );
                removed.push(favorite.id);
            }
            Ok(removed)
        })?
    }

    /// One status record per device; reused when it already exists.
    pub fn update_status(
        &self,
        status: impl Into<String>,
        message: Option<String>,
    ) -> Result<UserStatus, SyncError> {
        let status = status.into();
        let payload = MutationPayload::UpdateStatus(UpdateStatus {
            device_id: self.device_id.clone(),
            status: status.clone(),
            message: message.clone(),
        });
        let record = self.store.batch(|tx| {
            let id = tx
                .query(|s: &UserStatus| s.device_id == self.device_id)
                .into_iter()
                .next()
                .map_or_else(new_entity_id, |existing| existing.id);
            let record = UserStatus {
                id,
                device_id: self.device_id.clone(),
                status,
                message,
                updated_at: Utc::now(),
            };
            tx.upsert(record.clone());
            tx.enqueue(payload, record.id.clone());
            record
        })?;
        Ok(record)
    }

    pub fn update_nickname(&self, nickname: impl Into<String>) -> Result<Device, SyncError> {
        let nickname = nickname.into();
        let device = self.store.batch(|tx| {
            let mut device = tx.get::<Device>(&self.device_id).cloned().unwrap_or(Device {
                id: self.device_id.clone(),
                nickname: None,
                platform: None,
                updated_at: None,
            });
            device.nickname = Some(nickname.clone());
            device.updated_at = Some(Utc::now());
            tx.upsert(device.clone());
            tx.enqueue(
                MutationPayload::UpdateNickname(UpdateNickname { nickname }),
                self.device_id.clone(),
            );
            device
        })?;
        Ok(device)
    }

    /// Stores a pending message. Messages are not queued as mutations; the
    /// push engine picks up pending messages directly.
    pub fn compose_message(
        &self,
        group_id: &str,
        body: impl Into<String>,
    ) -> Result<Message, SyncError> {
        let message = Message {
            id: new_entity_id(),
            group_id: group_id.to_owned(),
            sender_device_id: self.device_id.clone(),
            body: body.into(),
            created_at: Utc::now(),
            sync_status: RecordStatus::Pending,
        };
        self.store.batch(|tx| {
            if tx.get::<Group>(group_id).is_none() {
                return Err(SyncError::missing(Collection::Groups, group_id));
            }
            tx.upsert(message.clone());
            Ok(())
        })??;
        Ok(message)
    }
}
