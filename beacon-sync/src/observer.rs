use std::sync::{Arc, PoisonError, RwLock};

use beacon_core::{Collection, EntityId, SyncStatus};
use serde::Serialize;

use crate::channel::ChannelState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Upserted,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityChange {
    pub collection: Collection,
    pub id: EntityId,
    pub kind: ChangeKind,
}

/// Hook for UI or application code. All methods default to no-ops and are
/// invoked outside of any engine lock.
pub trait SyncObserver: Send + Sync {
    fn on_status_change(&self, _status: &SyncStatus) {}

    fn on_entity_change(&self, _change: &EntityChange) {}

    fn on_channel_state(&self, _state: ChannelState) {}
}

#[derive(Clone, Default)]
pub struct Observers {
    inner: Arc<RwLock<Vec<Arc<dyn SyncObserver>>>>,
}

impl Observers {
    pub fn register(&self, observer: Arc<dyn SyncObserver>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    fn snapshot(&self) -> Vec<Arc<dyn SyncObserver>> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn status_changed(&self, status: &SyncStatus) {
        for observer in self.snapshot() {
            observer.on_status_change(status);
        }
    }

    pub fn entities_changed(&self, changes: &[EntityChange]) {
        if changes.is_empty() {
            return;
        }
        let observers = self.snapshot();
        for change in changes {
            for observer in &observers {
                observer.on_entity_change(change);
            }
        }
    }

    pub fn channel_state(&self, state: ChannelState) {
        for observer in self.snapshot() {
            observer.on_channel_state(state);
        }
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.snapshot().len())
            .finish()
    }
}
