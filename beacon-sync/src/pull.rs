//! Incremental replication from the server into the local store.
//!
//! Each pulled document is dispatched to the [`CollectionProcessor`]
//! registered for its collection. A whole response is applied inside one
//! store batch and checkpoints only move once every document and deletion
//! has been handled.

use std::{
    collections::{BTreeMap, HashMap},
    marker::PhantomData,
    sync::{Arc, PoisonError, RwLock},
};

use beacon_core::{
    Collection, EntityId, FavoriteGroup, Group, Message, MutationKind, PinnedMessage,
    PullRequest, PullResponse, RecordStatus, UserStatus, checkpoint_advances,
};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::{
    error::{StoreError, SyncError},
    retry::RetryPolicy,
    store::{LocalStore, StoreTx, Table},
    transport::SyncTransport,
};

/// Applies server documents and deletions for one collection.
pub trait CollectionProcessor: Send + Sync {
    fn collection(&self) -> Collection;

    fn apply(&self, tx: &mut StoreTx<'_>, document: Value) -> Result<(), SyncError>;

    /// Returns whether a local record was removed.
    fn apply_deletion(&self, tx: &mut StoreTx<'_>, id: &str) -> bool;
}

fn decode<T: DeserializeOwned>(collection: Collection, document: Value) -> Result<T, SyncError> {
    serde_json::from_value(document)
        .map_err(|err| SyncError::InvalidDocument(format!("{collection}: {err}")))
}

/// Plain "server wins" upsert.
pub struct UpsertProcessor<T> {
    _table: PhantomData<fn() -> T>,
}

impl<T> Default for UpsertProcessor<T> {
    fn default() -> Self {
        Self {
            _table: PhantomData,
        }
    }
}

impl<T: Table> CollectionProcessor for UpsertProcessor<T> {
    fn collection(&self) -> Collection {
        T::COLLECTION
    }

    fn apply(&self, tx: &mut StoreTx<'_>, document: Value) -> Result<(), SyncError> {
        let record: T = decode(T::COLLECTION, document)?;
        tx.upsert(record);
        Ok(())
    }

    fn apply_deletion(&self, tx: &mut StoreTx<'_>, id: &str) -> bool {
        tx.delete::<T>(id).is_some()
    }
}

/// Anything the server hands back has, by definition, been synced.
#[derive(Debug, Default)]
pub struct MessageProcessor;

impl CollectionProcessor for MessageProcessor {
    fn collection(&self) -> Collection {
        Collection::Messages
    }

    fn apply(&self, tx: &mut StoreTx<'_>, document: Value) -> Result<(), SyncError> {
        let message: Message = decode(Collection::Messages, document)?;
        tx.upsert(Message {
            sync_status: RecordStatus::Synced,
            ..message
        });
        Ok(())
    }

    fn apply_deletion(&self, tx: &mut StoreTx<'_>, id: &str) -> bool {
        tx.delete::<Message>(id).is_some()
    }
}

/// Confirms groups and folds optimistic local groups into the server's
/// canonical record.
#[derive(Debug, Default)]
pub struct GroupProcessor;

impl GroupProcessor {
    /// The unconfirmed local group from the same creator that `incoming`
    /// supersedes. A name match wins; otherwise only an unambiguous single
    /// candidate is taken.
    fn optimistic_counterpart(tx: &StoreTx<'_>, incoming: &Group) -> Option<EntityId> {
        let creator = incoming.creator_device_id.as_deref()?;
        let candidates = tx.query(|g: &Group| {
            !g.confirmed && g.id != incoming.id && g.creator_device_id.as_deref() == Some(creator)
        });

        let named: Vec<&Group> = candidates
            .iter()
            .filter(|g| g.name == incoming.name)
            .collect();
        match (named.as_slice(), candidates.as_slice()) {
            ([only], _) => Some(only.id.clone()),
            ([], [only]) => Some(only.id.clone()),
            ([], []) => None,
            _ => {
                warn!(
                    group_id = %incoming.id,
                    candidates = candidates.len(),
                    "ambiguous optimistic group, skipping reconciliation"
                );
                None
            }
        }
    }

    fn reconcile(tx: &mut StoreTx<'_>, from: &str, to: &str) {
        let messages = tx.query(|m: &Message| m.group_id == from);
        for message in &messages {
            tx.update::<Message>(&message.id, |m| m.group_id = to.to_owned());
        }
        let favorites = tx.query(|f: &FavoriteGroup| f.group_id == from);
        for favorite in &favorites {
            tx.update::<FavoriteGroup>(&favorite.id, |f| f.group_id = to.to_owned());
        }
        let pinned = tx.query(|p: &PinnedMessage| p.group_id == from);
        for pin in &pinned {
            tx.update::<PinnedMessage>(&pin.id, |p| p.group_id = to.to_owned());
        }

        // The server already holds the group; a leftover create would
        // duplicate it.
        let dropped = tx.discard_kind_for(MutationKind::CreateGroup, Collection::Groups, from);
        let retargeted = tx.retarget_mutations(Collection::Groups, from, to);
        tx.delete::<Group>(from);

        info!(
            from,
            to,
            messages = messages.len(),
            favorites = favorites.len(),
            pinned = pinned.len(),
            dropped,
            retargeted,
            "reconciled optimistic group"
        );
    }
}

impl CollectionProcessor for GroupProcessor {
    fn collection(&self) -> Collection {
        Collection::Groups
    }

    fn apply(&self, tx: &mut StoreTx<'_>, document: Value) -> Result<(), SyncError> {
        let incoming: Group = decode(Collection::Groups, document)?;
        let incoming = Group {
            confirmed: true,
            ..incoming
        };
        if let Some(optimistic) = Self::optimistic_counterpart(tx, &incoming) {
            Self::reconcile(tx, &optimistic, &incoming.id);
        }
        tx.upsert(incoming);
        Ok(())
    }

    fn apply_deletion(&self, tx: &mut StoreTx<'_>, id: &str) -> bool {
        tx.delete::<Group>(id).is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GeoScope {
    pub latitude: f64,
    pub longitude: f64,
    pub radius: f64,
}

/// Optional narrowing of a pull: explicit group ids for messages, a
/// center and radius for groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PullScope {
    pub group_ids: Option<Vec<EntityId>>,
    pub geo: Option<GeoScope>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PullOutcome {
    pub applied: usize,
    pub deleted: usize,
    pub discarded_mutations: usize,
    pub skipped: usize,
    pub advanced: Vec<Collection>,
    pub has_more: bool,
}

pub struct PullEngine {
    store: Arc<LocalStore>,
    transport: Arc<dyn SyncTransport>,
    processors: HashMap<Collection, Box<dyn CollectionProcessor>>,
    scope: RwLock<PullScope>,
}

impl PullEngine {
    pub fn new(store: Arc<LocalStore>, transport: Arc<dyn SyncTransport>) -> Self {
        let mut engine = Self {
            store,
            transport,
            processors: HashMap::new(),
            scope: RwLock::new(PullScope::default()),
        };
        engine.register(MessageProcessor);
        engine.register(GroupProcessor);
        engine.register(UpsertProcessor::<FavoriteGroup>::default());
        engine.register(UpsertProcessor::<PinnedMessage>::default());
        engine.register(UpsertProcessor::<UserStatus>::default());
        engine
    }

    /// Replaces the processor for its collection.
    pub fn register(&mut self, processor: impl CollectionProcessor + 'static) {
        self.processors
            .insert(processor.collection(), Box::new(processor));
    }

    /// Replicated collections with a registered processor, in wire order.
    pub fn collections(&self) -> Vec<Collection> {
        Collection::REPLICATED
            .into_iter()
            .filter(|c| self.processors.contains_key(c))
            .collect()
    }

    pub fn set_scope(&self, scope: PullScope) {
        *self.scope.write().unwrap_or_else(PoisonError::into_inner) = scope;
    }

    pub fn scope(&self) -> PullScope {
        self.scope
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Collections without a stored checkpoint are left out of the map,
    /// which asks the server for a full sync of them.
    pub fn build_request(&self, collections: &[Collection]) -> PullRequest {
        let stored = self.store.checkpoints();
        let checkpoint: BTreeMap<String, String> = collections
            .iter()
            .filter_map(|c| stored.get(c).map(|v| (c.as_str().to_owned(), v.clone())))
            .collect();
        let scope = self.scope();

        PullRequest {
            checkpoint: (!checkpoint.is_empty()).then_some(checkpoint),
            group_ids: scope.group_ids,
            latitude: scope.geo.map(|g| g.latitude),
            longitude: scope.geo.map(|g| g.longitude),
            radius: scope.geo.map(|g| g.radius),
            ..PullRequest::for_collections(collections)
        }
    }

    /// One page. `has_more` on the outcome tells the caller to go again.
    pub async fn pull(
        &self,
        collections: &[Collection],
        retry: &RetryPolicy,
        is_online: impl Fn() -> bool,
    ) -> Result<PullOutcome, SyncError> {
        let request = self.build_request(collections);
        debug!(
            collections = ?request.collections,
            checkpoints = ?request.checkpoint,
            "pulling"
        );
        let response = retry
            .run("pull", &is_online, || self.transport.pull(&request))
            .await?;
        let outcome = self.apply_response(collections, &response)?;
        info!(
            applied = outcome.applied,
            deleted = outcome.deleted,
            skipped = outcome.skipped,
            has_more = outcome.has_more,
            "pull applied"
        );
        Ok(outcome)
    }

    pub fn apply_response(
        &self,
        requested: &[Collection],
        response: &PullResponse,
    ) -> Result<PullOutcome, StoreError> {
        self.store.batch(|tx| {
            let mut outcome = PullOutcome {
                has_more: response.has_more,
                ..PullOutcome::default()
            };

            for document in &response.documents {
                let Some(processor) = self.processor_for(&document.collection) else {
                    outcome.skipped += 1;
                    continue;
                };
                match processor.apply(tx, document.document.clone()) {
                    Ok(()) => outcome.applied += 1,
                    Err(err) => {
                        warn!(collection = %document.collection, "skipping document: {err}");
                        outcome.skipped += 1;
                    }
                }
            }

            // After documents, so a tombstone in the same page wins.
            for deletion in &response.deletions {
                let Some(processor) = self.processor_for(&deletion.collection) else {
                    outcome.skipped += 1;
                    continue;
                };
                let collection = processor.collection();
                if processor.apply_deletion(tx, &deletion.id) {
                    outcome.deleted += 1;
                }
                if collection.supports_mutations() {
                    let discarded = tx.discard_mutations_for(collection, &deletion.id);
                    if discarded > 0 {
                        debug!(
                            %collection,
                            id = %deletion.id,
                            discarded,
                            "server deletion discarded queued mutations"
                        );
                    }
                    outcome.discarded_mutations += discarded;
                }
            }

            outcome.advanced = advance_checkpoints(tx, requested, response);
            outcome
        })
    }

    fn processor_for(&self, name: &str) -> Option<&dyn CollectionProcessor> {
        let collection = match Collection::parse_replicated(name) {
            Ok(collection) => collection,
            Err(err) => {
                warn!("skipping entry: {err}");
                return None;
            }
        };
        let processor = self.processors.get(&collection).map(Box::as_ref);
        if processor.is_none() {
            warn!(%collection, "no processor registered");
        }
        processor
    }
}

/// The per-collection map wins; a legacy scalar applies to every requested
/// collection. Stored checkpoints never move backwards.
fn advance_checkpoints(
    tx: &mut StoreTx<'_>,
    requested: &[Collection],
    response: &PullResponse,
) -> Vec<Collection> {
    let incoming: Vec<(Collection, &str)> = match response
        .checkpoints
        .as_ref()
        .filter(|map| !map.is_empty())
    {
        Some(map) => map
            .iter()
            .filter_map(|(name, value)| match Collection::parse_replicated(name) {
                Ok(collection) => Some((collection, value.as_str())),
                Err(err) => {
                    warn!("ignoring checkpoint: {err}");
                    None
                }
            })
            .collect(),
        None => match response.checkpoint.as_deref() {
            Some(value) => requested.iter().map(|c| (*c, value)).collect(),
            None => Vec::new(),
        },
    };

    let mut advanced = Vec::new();
    for (collection, value) in incoming {
        if checkpoint_advances(tx.checkpoint(collection), value) {
            tx.set_checkpoint(collection, value.to_owned());
            advanced.push(collection);
        } else {
            debug!(%collection, value, "checkpoint not newer, keeping stored value");
        }
    }
    advanced
}
