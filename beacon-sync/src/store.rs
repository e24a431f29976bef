//! Durable local tables for synchronizable entities, the mutation queue and
//! replication checkpoints.
//!
//! All writes go through [`LocalStore::batch`]: the closure mutates the
//! in-memory tables and the batch is stamped with a revision. Once the
//! table lock is released the snapshot is persisted, observers hear about
//! the changed entities, and the status counts taken at that revision are
//! published.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use beacon_core::{
    Collection, Device, DomainCounts, EntityId, FavoriteGroup, Group, Message, Mutation,
    MutationId, PinnedMessage, Record, RecordStatus, UserStatus,
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, warn};

use crate::{
    error::StoreError,
    observer::{ChangeKind, EntityChange, Observers},
    status::StatusTracker,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    #[serde(default)]
    pub devices: BTreeMap<EntityId, Device>,
    #[serde(default)]
    pub groups: BTreeMap<EntityId, Group>,
    #[serde(default)]
    pub favorite_groups: BTreeMap<EntityId, FavoriteGroup>,
    #[serde(default)]
    pub messages: BTreeMap<EntityId, Message>,
    #[serde(default)]
    pub pinned_messages: BTreeMap<EntityId, PinnedMessage>,
    #[serde(default)]
    pub user_status: BTreeMap<EntityId, UserStatus>,
    #[serde(default)]
    pub mutations: BTreeMap<MutationId, Mutation>,
    #[serde(default)]
    pub checkpoints: BTreeMap<Collection, String>,
}

/// Maps an entity type to its table.
pub trait Table: Record + Serialize + DeserializeOwned + Send + Sync + 'static {
    fn table(tables: &Tables) -> &BTreeMap<EntityId, Self>;

    fn table_mut(tables: &mut Tables) -> &mut BTreeMap<EntityId, Self>;
}

macro_rules! impl_table {
    ($($ty:ty => $field:ident),* $(,)?) => {
        $(
            impl Table for $ty {
                fn table(tables: &Tables) -> &BTreeMap<EntityId, Self> {
                    &tables.$field
                }

                fn table_mut(tables: &mut Tables) -> &mut BTreeMap<EntityId, Self> {
                    &mut tables.$field
                }
            }
        )*
    };
}

impl_table! {
    Device => devices,
    Group => groups,
    FavoriteGroup => favorite_groups,
    Message => messages,
    PinnedMessage => pinned_messages,
    UserStatus => user_status,
}

impl Tables {
    pub fn mutation_counts(&self) -> DomainCounts {
        count_statuses(self.mutations.values().map(|m| m.sync_status))
    }

    pub fn message_counts(&self) -> DomainCounts {
        count_statuses(self.messages.values().map(|m| m.sync_status))
    }
}

fn count_statuses(statuses: impl Iterator<Item = RecordStatus>) -> DomainCounts {
    let mut counts = DomainCounts::default();
    for status in statuses {
        match status {
            RecordStatus::Pending => counts.pending += 1,
            RecordStatus::Syncing => counts.syncing += 1,
            RecordStatus::Failed => counts.failed += 1,
            RecordStatus::Synced => {}
        }
    }
    counts
}

/// Mutable view over the tables for the duration of one batch.
pub struct StoreTx<'a> {
    pub(crate) tables: &'a mut Tables,
    pub(crate) changes: Vec<EntityChange>,
    pub(crate) dirty: bool,
    pub(crate) status_touched: bool,
}

impl StoreTx<'_> {
    pub fn get<T: Table>(&self, id: &str) -> Option<&T> {
        T::table(self.tables).get(id)
    }

    pub fn query<T: Table>(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        T::table(self.tables)
            .values()
            .filter(|record| predicate(record))
            .cloned()
            .collect()
    }

    pub fn upsert<T: Table>(&mut self, record: T) {
        let id = record.id().to_owned();
        T::table_mut(self.tables).insert(id.clone(), record);
        self.record_change(T::COLLECTION, id, ChangeKind::Upserted);
    }

    pub fn delete<T: Table>(&mut self, id: &str) -> Option<T> {
        let removed = T::table_mut(self.tables).remove(id);
        if removed.is_some() {
            self.record_change(T::COLLECTION, id.to_owned(), ChangeKind::Removed);
        }
        removed
    }

    /// In-place edit; records a change only when the record exists.
    pub fn update<T: Table>(&mut self, id: &str, edit: impl FnOnce(&mut T)) -> bool {
        let Some(record) = T::table_mut(self.tables).get_mut(id) else {
            return false;
        };
        edit(record);
        self.record_change(T::COLLECTION, id.to_owned(), ChangeKind::Upserted);
        true
    }

    pub fn checkpoint(&self, collection: Collection) -> Option<&str> {
        self.tables.checkpoints.get(&collection).map(String::as_str)
    }

    pub fn set_checkpoint(&mut self, collection: Collection, value: String) {
        self.tables.checkpoints.insert(collection, value);
        self.dirty = true;
    }

    pub(crate) fn touch_queue(&mut self) {
        self.dirty = true;
        self.status_touched = true;
    }

    fn record_change(&mut self, collection: Collection, id: EntityId, kind: ChangeKind) {
        self.dirty = true;
        if collection == Collection::Messages {
            self.status_touched = true;
        }
        self.changes.push(EntityChange {
            collection,
            id,
            kind,
        });
    }
}

pub struct LocalStore {
    tables: Mutex<Tables>,
    revision: AtomicU64,
    /// Revision of the snapshot last written to disk.
    persisted: Mutex<u64>,
    path: Option<PathBuf>,
    observers: Observers,
    status: Arc<StatusTracker>,
}

/// A serialized snapshot waiting to be written.
struct Snapshot {
    revision: u64,
    payload: Vec<u8>,
}

impl LocalStore {
    pub fn in_memory(observers: Observers, status: Arc<StatusTracker>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            revision: AtomicU64::new(0),
            persisted: Mutex::new(0),
            path: None,
            observers,
            status,
        }
    }

    /// Opens (or creates) a store persisted at `path`. Records left in
    /// `syncing` by an interrupted process are returned to `pending`.
    pub fn open(
        path: impl Into<PathBuf>,
        observers: Observers,
        status: Arc<StatusTracker>,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let mut tables = if path.exists() {
            load_tables(&path)?
        } else {
            Tables::default()
        };
        let recovered = recover_in_flight(&mut tables);
        if recovered > 0 {
            warn!(recovered, path = %path.display(), "reset interrupted in-flight records");
        }
        status.publish_counts(0, tables.mutation_counts(), tables.message_counts());
        Ok(Self {
            tables: Mutex::new(tables),
            revision: AtomicU64::new(0),
            persisted: Mutex::new(0),
            path: Some(path),
            observers,
            status,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn batch<R>(&self, apply: impl FnOnce(&mut StoreTx<'_>) -> R) -> Result<R, StoreError> {
        let (result, changes, counts, snapshot) = {
            let mut tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
            let mut tx = StoreTx {
                tables: &mut *tables,
                changes: Vec::new(),
                dirty: false,
                status_touched: false,
            };
            let result = apply(&mut tx);
            let StoreTx {
                changes,
                dirty,
                status_touched,
                ..
            } = tx;
            // Taken under the table lock, so revisions follow write order.
            let revision = self.revision.fetch_add(1, Ordering::Relaxed) + 1;
            let counts = status_touched
                .then(|| (revision, tables.mutation_counts(), tables.message_counts()));
            let snapshot = match self.path {
                Some(_) if dirty => Some(
                    serde_json::to_vec(&*tables)
                        .map(|payload| Snapshot { revision, payload })
                        .map_err(StoreError::Serialize),
                ),
                _ => None,
            };
            (result, changes, counts, snapshot)
        };

        let persist = snapshot.map(|snapshot| snapshot.and_then(|s| self.persist(s)));
        self.observers.entities_changed(&changes);
        if let Some((revision, mutations, messages)) = counts {
            self.status.publish_counts(revision, mutations, messages);
        }
        if let Some(Err(err)) = persist {
            return Err(err);
        }
        Ok(result)
    }

    /// Writes a snapshot unless a newer one already reached the disk.
    fn persist(&self, snapshot: Snapshot) -> Result<(), StoreError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(());
        };
        let mut persisted = self.persisted.lock().unwrap_or_else(PoisonError::into_inner);
        if snapshot.revision <= *persisted {
            debug!(revision = snapshot.revision, "newer snapshot already on disk");
            return Ok(());
        }
        save_snapshot(path, &snapshot.payload)?;
        *persisted = snapshot.revision;
        Ok(())
    }

    pub fn read<R>(&self, view: impl FnOnce(&Tables) -> R) -> R {
        let tables = self.tables.lock().unwrap_or_else(PoisonError::into_inner);
        view(&tables)
    }

    pub fn get<T: Table>(&self, id: &str) -> Option<T> {
        self.read(|tables| T::table(tables).get(id).cloned())
    }

    pub fn query<T: Table>(&self, predicate: impl Fn(&T) -> bool) -> Vec<T> {
        self.read(|tables| {
            T::table(tables)
                .values()
                .filter(|record| predicate(record))
                .cloned()
                .collect()
        })
    }

    pub fn all<T: Table>(&self) -> Vec<T> {
        self.query(|_: &T| true)
    }

    pub fn upsert<T: Table>(&self, record: T) -> Result<(), StoreError> {
        self.batch(|tx| tx.upsert(record))
    }

    pub fn delete<T: Table>(&self, id: &str) -> Result<Option<T>, StoreError> {
        self.batch(|tx| tx.delete::<T>(id))
    }

    pub fn checkpoint(&self, collection: Collection) -> Option<String> {
        self.read(|tables| tables.checkpoints.get(&collection).cloned())
    }

    pub fn checkpoints(&self) -> BTreeMap<Collection, String> {
        self.read(|tables| tables.checkpoints.clone())
    }
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn recover_in_flight(tables: &mut Tables) -> usize {
    let mut recovered = 0;
    for mutation in tables.mutations.values_mut() {
        if mutation.sync_status == RecordStatus::Syncing {
            mutation.sync_status = RecordStatus::Pending;
            recovered += 1;
        }
    }
    for message in tables.messages.values_mut() {
        if message.sync_status == RecordStatus::Syncing {
            message.sync_status = RecordStatus::Pending;
            recovered += 1;
        }
    }
    recovered
}

fn load_tables(path: &Path) -> Result<Tables, StoreError> {
    let data = fs::read_to_string(path).map_err(|source| StoreError::Read {
        path: path.to_owned(),
        source,
    })?;
    serde_json::from_str(&data).map_err(|source| StoreError::Parse {
        path: path.to_owned(),
        source,
    })
}

fn save_snapshot(path: &Path, payload: &[u8]) -> Result<(), StoreError> {
    const MAX_ATTEMPTS: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 20;

    let tmp_path = path.with_extension("json.tmp");

    let mut attempt = 1;
    loop {
        let result = fs::write(&tmp_path, payload).and_then(|()| fs::rename(&tmp_path, path));
        match result {
            Ok(()) => return Ok(()),
            Err(source) if attempt >= MAX_ATTEMPTS => {
                return Err(StoreError::Write {
                    path: path.to_owned(),
                    source,
                });
            }
            Err(err) => {
                debug!(attempt, path = %path.display(), "store write failed, retrying: {err}");
                let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
                std::thread::sleep(Duration::from_millis(backoff_ms));
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{Mutex as StdMutex, OnceLock, atomic::AtomicBool};

    use beacon_core::SyncState;
    use chrono::Utc;

    use super::*;
    use crate::observer::SyncObserver;

    pub(crate) fn memory_store() -> Arc<LocalStore> {
        let observers = Observers::default();
        let status = Arc::new(StatusTracker::new(observers.clone(), true));
        Arc::new(LocalStore::in_memory(observers, status))
    }

    pub(crate) fn group(id: &str, creator: Option<&str>, confirmed: bool) -> Group {
        Group {
            id: id.to_owned(),
            name: format!("group {id}"),
            description: None,
            creator_device_id: creator.map(str::to_owned),
            latitude: None,
            longitude: None,
            created_at: Utc::now(),
            updated_at: None,
            confirmed,
        }
    }

    pub(crate) fn message(id: &str, group_id: &str, sender: &str, status: RecordStatus) -> Message {
        Message {
            id: id.to_owned(),
            group_id: group_id.to_owned(),
            sender_device_id: sender.to_owned(),
            body: format!("body of {id}"),
            created_at: Utc::now(),
            sync_status: status,
        }
    }

    #[derive(Default)]
    struct ChangeLog(StdMutex<Vec<EntityChange>>);

    impl SyncObserver for ChangeLog {
        fn on_entity_change(&self, change: &EntityChange) {
            self.0.lock().unwrap().push(change.clone());
        }
    }

    #[test]
    fn query_filters_by_predicate() {
        let store = memory_store();
        store.upsert(group("g-1", Some("dev-a"), true)).unwrap();
        store.upsert(group("g-2", Some("dev-b"), true)).unwrap();
        store.upsert(group("g-3", Some("dev-a"), false)).unwrap();

        let mut from_a: Vec<String> = store
            .query(|g: &Group| g.creator_device_id.as_deref() == Some("dev-a"))
            .into_iter()
            .map(|g| g.id)
            .collect();
        from_a.sort();
        assert_eq!(from_a, vec!["g-1", "g-3"]);
        assert!(store.get::<Group>("g-2").is_some());
        assert!(store.get::<Group>("missing").is_none());
    }

    #[test]
    fn observers_see_upserts_and_removals() {
        let observers = Observers::default();
        let log = Arc::new(ChangeLog::default());
        observers.register(log.clone());
        let status = Arc::new(StatusTracker::new(observers.clone(), true));
        let store = LocalStore::in_memory(observers, status);

        store.upsert(group("g-1", None, true)).unwrap();
        store.delete::<Group>("g-1").unwrap();
        store.delete::<Group>("g-1").unwrap();

        let kinds: Vec<ChangeKind> = log.0.lock().unwrap().iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::Upserted, ChangeKind::Removed]);
    }

    #[test]
    fn message_writes_refresh_status_counts() {
        let observers = Observers::default();
        let status = Arc::new(StatusTracker::new(observers.clone(), true));
        let store = LocalStore::in_memory(observers, status.clone());

        store
            .upsert(message("m-1", "g-1", "dev-a", RecordStatus::Pending))
            .unwrap();
        assert_eq!(status.current().messages, SyncState::Pending);

        store
            .batch(|tx| tx.update::<Message>("m-1", |m| m.sync_status = RecordStatus::Synced))
            .unwrap();
        assert_eq!(status.current().overall, SyncState::Synced);
    }

    /// Reacts to the first message change by marking it synced, which nests
    /// a second batch inside the first batch's observer fan-out.
    #[derive(Default)]
    struct MarkSyncedOnce {
        store: OnceLock<Arc<LocalStore>>,
        fired: AtomicBool,
    }

    impl SyncObserver for MarkSyncedOnce {
        fn on_entity_change(&self, change: &EntityChange) {
            if change.collection != Collection::Messages || self.fired.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(store) = self.store.get() {
                store
                    .batch(|tx| {
                        tx.update::<Message>(&change.id, |m| m.sync_status = RecordStatus::Synced)
                    })
                    .unwrap();
            }
        }
    }

    #[test]
    fn nested_batch_counts_are_not_overwritten_by_the_outer_batch() {
        let observers = Observers::default();
        let marker = Arc::new(MarkSyncedOnce::default());
        observers.register(marker.clone());
        let status = Arc::new(StatusTracker::new(observers.clone(), true));
        let store = Arc::new(LocalStore::in_memory(observers, status.clone()));
        let _ = marker.store.set(store.clone());

        store
            .upsert(message("m-1", "g-1", "dev-a", RecordStatus::Pending))
            .unwrap();

        assert_eq!(
            store.get::<Message>("m-1").unwrap().sync_status,
            RecordStatus::Synced
        );
        assert_eq!(store.read(|t| t.message_counts()), DomainCounts::default());
        assert_eq!(status.current().messages, SyncState::Synced);
        assert_eq!(status.current().overall, SyncState::Synced);
    }

    #[test]
    fn older_snapshot_never_overwrites_a_newer_one() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let path = dir.path().join("store.json");
        let observers = Observers::default();
        let status = Arc::new(StatusTracker::new(observers.clone(), true));
        let store = LocalStore::open(&path, observers, status).unwrap();

        store.upsert(group("g-1", Some("dev-a"), false)).unwrap();
        store.upsert(group("g-2", Some("dev-a"), false)).unwrap();
        store
            .persist(Snapshot {
                revision: 1,
                payload: serde_json::to_vec(&Tables::default()).unwrap(),
            })
            .unwrap();

        let on_disk = load_tables(&path).unwrap();
        assert_eq!(on_disk.groups.len(), 2);
        assert_eq!(*store.persisted.lock().unwrap(), 2);
    }

    #[test]
    fn reopening_restores_tables_and_resets_in_flight_records() {
        let dir = tempfile::tempdir().expect("create tempdir");
        let path = dir.path().join("store.json");

        {
            let observers = Observers::default();
            let status = Arc::new(StatusTracker::new(observers.clone(), true));
            let store = LocalStore::open(&path, observers, status).unwrap();
            store
                .batch(|tx| {
                    tx.upsert(group("g-1", Some("dev-a"), false));
                    tx.upsert(message("m-1", "g-1", "dev-a", RecordStatus::Syncing));
                    tx.set_checkpoint(Collection::Messages, "2024-01-01T00:00:00Z".to_owned());
                })
                .unwrap();
        }

        let observers = Observers::default();
        let status = Arc::new(StatusTracker::new(observers.clone(), true));
        let reopened = LocalStore::open(&path, observers, status).unwrap();
        assert!(reopened.get::<Group>("g-1").is_some());
        assert_eq!(
            reopened.get::<Message>("m-1").unwrap().sync_status,
            RecordStatus::Pending
        );
        assert_eq!(
            reopened.checkpoint(Collection::Messages).as_deref(),
            Some("2024-01-01T00:00:00Z")
        );
    }
}
