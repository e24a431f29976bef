//! Durable journal of local writes the server has not acknowledged yet.

use std::sync::Arc;

use beacon_core::{Collection, Mutation, MutationId, MutationKind, MutationPayload, RecordStatus};
use chrono::{Duration as ChronoDuration, Utc};
use tracing::debug;

use crate::{
    error::StoreError,
    store::{LocalStore, StoreTx},
};

fn outstanding<'a>(mutations: impl Iterator<Item = &'a Mutation>) -> Vec<Mutation> {
    let mut pending: Vec<Mutation> = mutations
        .filter(|m| m.sync_status.is_outstanding())
        .cloned()
        .collect();
    pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    pending
}

impl StoreTx<'_> {
    /// Appends a pending mutation. `created_at` doubles as the FIFO key, so
    /// it is kept strictly increasing even when the clock does not move.
    pub fn enqueue(&mut self, payload: MutationPayload, entity_id: impl Into<String>) -> MutationId {
        let mut created_at = Utc::now();
        if let Some(latest) = self.tables.mutations.values().map(|m| m.created_at).max()
            && created_at <= latest
        {
            created_at = latest + ChronoDuration::microseconds(1);
        }

        let mutation = Mutation::new(payload, entity_id.into(), created_at);
        let id = mutation.id.clone();
        debug!(
            mutation_id = %id,
            kind = %mutation.kind(),
            entity_id = %mutation.entity_id,
            "mutation enqueued"
        );
        self.tables.mutations.insert(id.clone(), mutation);
        self.touch_queue();
        id
    }

    pub fn pending_mutations(&self) -> Vec<Mutation> {
        outstanding(self.tables.mutations.values())
    }

    pub fn mutations_for(&self, collection: Collection, entity_id: &str) -> Vec<&Mutation> {
        self.tables
            .mutations
            .values()
            .filter(|m| m.targets(collection, entity_id))
            .collect()
    }

    pub fn mark_mutation(
        &mut self,
        id: &str,
        status: RecordStatus,
        error: Option<String>,
    ) -> bool {
        let Some(mutation) = self.tables.mutations.get_mut(id) else {
            return false;
        };
        match status {
            RecordStatus::Syncing => {
                if mutation.sync_status == RecordStatus::Failed {
                    mutation.retry_count += 1;
                }
            }
            RecordStatus::Synced => {
                mutation.synced_at = Some(Utc::now());
                mutation.error_message = None;
            }
            RecordStatus::Failed => mutation.error_message = error,
            RecordStatus::Pending => {}
        }
        mutation.sync_status = status;
        self.touch_queue();
        true
    }

    pub fn remove_mutation(&mut self, id: &str) -> Option<Mutation> {
        let removed = self.tables.mutations.remove(id);
        if removed.is_some() {
            self.touch_queue();
        }
        removed
    }

    /// Drops every queued mutation aimed at the entity. Used when the server
    /// has deleted it: the server wins over a pending local edit.
    pub fn discard_mutations_for(&mut self, collection: Collection, entity_id: &str) -> usize {
        self.discard_where(|m| m.targets(collection, entity_id))
    }

    /// Like [`discard_mutations_for`](Self::discard_mutations_for) but only
    /// for one mutation kind.
    pub fn discard_kind_for(
        &mut self,
        kind: MutationKind,
        collection: Collection,
        entity_id: &str,
    ) -> usize {
        self.discard_where(|m| m.kind() == kind && m.targets(collection, entity_id))
    }

    fn discard_where(&mut self, matches: impl Fn(&Mutation) -> bool) -> usize {
        let before = self.tables.mutations.len();
        self.tables.mutations.retain(|_, m| !matches(m));
        let discarded = before - self.tables.mutations.len();
        if discarded > 0 {
            self.touch_queue();
        }
        discarded
    }

    /// Points queued mutations for `from` at `to` after an id was replaced.
    pub fn retarget_mutations(&mut self, collection: Collection, from: &str, to: &str) -> usize {
        let mut moved = 0;
        for mutation in self.tables.mutations.values_mut() {
            if mutation.targets(collection, from) {
                mutation.entity_id = to.to_owned();
                moved += 1;
            }
            if let MutationPayload::AddFavorite(favorite) = &mut mutation.payload
                && collection == Collection::Groups
                && favorite.group_id == from
            {
                favorite.group_id = to.to_owned();
                moved += 1;
            }
        }
        if moved > 0 {
            self.touch_queue();
        }
        moved
    }
}

/// Facade over the queue table in the [`LocalStore`].
#[derive(Debug, Clone)]
pub struct MutationQueue {
    store: Arc<LocalStore>,
}

impl MutationQueue {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }

    /// Records the mutation locally; never touches the network.
    pub fn enqueue(
        &self,
        payload: MutationPayload,
        entity_id: impl Into<String>,
    ) -> Result<MutationId, StoreError> {
        let entity_id = entity_id.into();
        self.store.batch(|tx| tx.enqueue(payload, entity_id))
    }

    /// Pending and failed entries, oldest first.
    pub fn list_pending(&self) -> Vec<Mutation> {
        self.store
            .read(|tables| outstanding(tables.mutations.values()))
    }

    pub fn get(&self, id: &str) -> Option<Mutation> {
        self.store.read(|tables| tables.mutations.get(id).cloned())
    }

    pub fn len(&self) -> usize {
        self.store.read(|tables| tables.mutations.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mark_status(
        &self,
        id: &str,
        status: RecordStatus,
        error: Option<String>,
    ) -> Result<bool, StoreError> {
        self.store.batch(|tx| tx.mark_mutation(id, status, error))
    }

    pub fn remove(&self, id: &str) -> Result<Option<Mutation>, StoreError> {
        self.store.batch(|tx| tx.remove_mutation(id))
    }

    pub fn discard_for_entity(
        &self,
        collection: Collection,
        entity_id: &str,
    ) -> Result<usize, StoreError> {
        self.store
            .batch(|tx| tx.discard_mutations_for(collection, entity_id))
    }
}
