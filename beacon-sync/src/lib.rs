//! Offline-first sync engine: durable local tables and mutation queue,
//! checkpointed push/pull replication, and a reconnecting realtime channel.

use std::sync::Arc;

use beacon_core::{EntityId, Message, SyncStatus};
use tokio::task::JoinHandle;
use tracing::debug;

pub mod channel;
pub mod config;
pub mod error;
pub mod logging;
pub mod observer;
pub mod orchestrator;
pub mod pull;
pub mod push;
pub mod queue;
pub mod retry;
pub mod status;
pub mod store;
pub mod transport;
pub mod writes;

pub use channel::{ChannelConfig, ChannelState, RealtimeChannel};
pub use config::{ConfigError, EngineConfig, default_config_path, load_config, save_config};
pub use error::{ChannelError, StoreError, SyncError, TransportError};
pub use observer::{ChangeKind, EntityChange, Observers, SyncObserver};
pub use orchestrator::{
    CycleOutcome, CycleReport, OrchestratorSettings, SkipReason, SyncOrchestrator, SyncTrigger,
};
pub use pull::{CollectionProcessor, GeoScope, PullEngine, PullOutcome, PullScope};
pub use push::{MessagePushReport, PushEngine};
pub use queue::MutationQueue;
pub use retry::RetryPolicy;
pub use status::StatusTracker;
pub use store::{LocalStore, StoreTx, Tables};
pub use transport::{HttpTransport, SyncTransport};
pub use writes::{LocalWriter, NewGroup};

/// Composition root: one engine per device session, owning every component.
pub struct SyncEngine {
    config: EngineConfig,
    observers: Observers,
    status: Arc<StatusTracker>,
    store: Arc<LocalStore>,
    queue: MutationQueue,
    writer: LocalWriter,
    orchestrator: Arc<SyncOrchestrator>,
    channel: RealtimeChannel,
}

impl SyncEngine {
    pub fn new(config: EngineConfig, transport: Arc<dyn SyncTransport>) -> Result<Self, SyncError> {
        config.validate()?;
        let observers = Observers::default();
        let status = Arc::new(StatusTracker::new(observers.clone(), true));
        let store = Arc::new(match &config.store_path {
            Some(path) => LocalStore::open(path, observers.clone(), status.clone())?,
            None => LocalStore::in_memory(observers.clone(), status.clone()),
        });

        let push = PushEngine::new(store.clone(), transport.clone(), config.device_id.clone());
        let pull = PullEngine::new(store.clone(), transport);
        let settings = OrchestratorSettings {
            retry: config.retry_policy(),
            max_pull_pages: config.max_pull_pages,
            visibility_debounce: config.visibility_debounce(),
            online_settle: config.online_settle(),
        };
        let orchestrator = Arc::new(SyncOrchestrator::new(push, pull, status.clone(), settings));
        let channel = RealtimeChannel::new(config.channel_config(), store.clone(), observers.clone());

        Ok(Self {
            queue: MutationQueue::new(store.clone()),
            writer: LocalWriter::new(store.clone(), config.device_id.clone()),
            config,
            observers,
            status,
            store,
            orchestrator,
            channel,
        })
    }

    /// Engine talking to the configured server over HTTP.
    pub fn open_http(config: EngineConfig) -> Result<Self, SyncError> {
        let transport =
            HttpTransport::new(&config.server_url, &config.token, config.request_timeout())?;
        Self::new(config, Arc::new(transport))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn register_observer(&self, observer: Arc<dyn SyncObserver>) {
        self.observers.register(observer);
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn writer(&self) -> &LocalWriter {
        &self.writer
    }

    pub fn orchestrator(&self) -> &Arc<SyncOrchestrator> {
        &self.orchestrator
    }

    pub fn channel(&self) -> &RealtimeChannel {
        &self.channel
    }

    pub fn status(&self) -> SyncStatus {
        self.status.current()
    }

    pub async fn sync_now(&self) -> CycleOutcome {
        self.orchestrator.request_sync().await
    }

    pub fn set_online(&self, online: bool) -> Option<JoinHandle<Option<CycleOutcome>>> {
        self.orchestrator.set_online(online)
    }

    pub fn notify_visibility(&self, visible: bool) -> Option<JoinHandle<Option<CycleOutcome>>> {
        self.orchestrator.notify_visibility(visible)
    }

    pub fn start_realtime(&self) {
        self.channel.connect();
    }

    pub async fn stop_realtime(&self) {
        self.channel.disconnect().await;
    }

    pub fn set_active_groups(&self, group_ids: impl IntoIterator<Item = EntityId>) {
        self.channel.set_active_groups(group_ids);
    }

    /// Composes a pending message and, when the channel is up and the group
    /// already exists server-side, also sends it over the socket. Anything
    /// not delivered there goes out with the next push.
    pub fn send_message(&self, group_id: &str, body: impl Into<String>) -> Result<Message, SyncError> {
        let message = self.writer.compose_message(group_id, body)?;
        let deliverable = self
            .store
            .batch(|tx| push::withhold_reason(tx, group_id).is_none())?;
        if deliverable
            && self.channel.is_connected()
            && let Err(err) = self.channel.send_message(&message)
        {
            debug!(message_id = %message.id, "realtime send failed, leaving for push: {err}");
        }
        Ok(message)
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("device_id", &self.config.device_id)
            .field("store", &self.store)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
