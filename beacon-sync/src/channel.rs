//! Persistent realtime socket: authenticates, keeps group subscriptions in
//! step with the active set, routes inbound message envelopes into the
//! store and reconnects with backoff after unexpected closes.

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, PoisonError, RwLock},
    time::Duration,
};

use beacon_core::{
    EntityId, Envelope, EnvelopeKind, Message, RecordStatus, backoff_with_jitter,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde::Serialize;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, timeout},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message as WsMessage,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{error::ChannelError, observer::Observers, store::LocalStore};

pub const NORMAL_CLOSE: u16 = 1000;
/// Close frame without a status code.
pub const NO_STATUS_CLOSE: u16 = 1005;
/// The peer vanished without a close frame.
pub const ABNORMAL_CLOSE: u16 = 1006;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "code", rename_all = "snake_case")]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
    Closed(u16),
    Error,
    /// Reconnect attempts exhausted; only an explicit `connect` revives it.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub url: String,
    pub token: String,
    pub device_id: String,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    pub max_reconnect_attempts: u32,
    pub ping_interval: Duration,
    pub connect_timeout: Duration,
}

impl ChannelConfig {
    /// Socket URL with the token appended as a query parameter.
    pub fn authenticated_url(&self) -> Result<Url, url::ParseError> {
        let mut url = Url::parse(&self.url)?;
        url.query_pairs_mut().append_pair("token", &self.token);
        Ok(url)
    }
}

pub type EnvelopeCallback = Arc<dyn Fn(&Envelope) + Send + Sync>;

enum SessionEnd {
    ClientClosed,
    Closed(u16),
    Error,
}

struct ChannelInner {
    config: ChannelConfig,
    store: Arc<LocalStore>,
    observers: Observers,
    state_tx: watch::Sender<ChannelState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    groups_tx: watch::Sender<BTreeSet<EntityId>>,
    callback: RwLock<Option<EnvelopeCallback>>,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct RealtimeChannel {
    inner: Arc<ChannelInner>,
}

impl RealtimeChannel {
    pub fn new(config: ChannelConfig, store: Arc<LocalStore>, observers: Observers) -> Self {
        let (state_tx, _) = watch::channel(ChannelState::Disconnected);
        let (groups_tx, _) = watch::channel(BTreeSet::new());
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ChannelInner {
                config,
                store,
                observers,
                state_tx,
                outbound: Mutex::new(None),
                groups_tx,
                callback: RwLock::new(None),
                shutdown_tx,
                task: Mutex::new(None),
            }),
        }
    }

    /// Every parsed inbound envelope is handed to `callback` after the
    /// store has been updated.
    pub fn on_envelope(&self, callback: impl Fn(&Envelope) + Send + Sync + 'static) {
        *self
            .inner
            .callback
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Starts the connection supervisor. No-op while one is already running.
    pub fn connect(&self) {
        let mut task = self.inner.task.lock().unwrap_or_else(PoisonError::into_inner);
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        self.inner.shutdown_tx.send_replace(false);
        *task = Some(tokio::spawn(supervise(self.inner.clone())));
    }

    /// Client-initiated close: sends code 1000, cancels any pending
    /// reconnect timer and waits for the supervisor to stop.
    pub async fn disconnect(&self) {
        self.inner.shutdown_tx.send_replace(true);
        let handle = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut handle) = handle
            && timeout(self.inner.config.connect_timeout, &mut handle)
                .await
                .is_err()
        {
            warn!("channel supervisor did not stop in time, aborting");
            handle.abort();
        }
        self.inner.set_outbound(None);
        self.inner.set_state(ChannelState::Disconnected);
    }

    /// Fails immediately unless connected; nothing is queued.
    pub fn send(&self, envelope: Envelope) -> Result<(), ChannelError> {
        match self.state() {
            ChannelState::Connected => {}
            ChannelState::Failed => return Err(ChannelError::Closed),
            _ => return Err(ChannelError::NotConnected),
        }
        let outbound = self
            .inner
            .outbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match outbound.as_ref() {
            Some(tx) => tx.send(envelope).map_err(|_| ChannelError::NotConnected),
            None => Err(ChannelError::NotConnected),
        }
    }

    pub fn send_message(&self, message: &Message) -> Result<(), ChannelError> {
        self.send(Envelope::send_message(message)?)
    }

    /// Replaces the active group set; a live session resubscribes when it
    /// actually changed.
    pub fn set_active_groups(&self, group_ids: impl IntoIterator<Item = EntityId>) {
        let next: BTreeSet<EntityId> = group_ids.into_iter().collect();
        self.inner.groups_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    pub fn active_groups(&self) -> BTreeSet<EntityId> {
        self.inner.groups_tx.borrow().clone()
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    pub fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.inner.state_tx.subscribe()
    }

    #[cfg(test)]
    fn handle_inbound(&self, text: &str) {
        self.inner.handle_inbound(text);
    }
}

impl std::fmt::Debug for RealtimeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeChannel")
            .field("url", &self.inner.config.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ChannelInner {
    fn set_state(&self, state: ChannelState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            debug!(?state, "channel state changed");
            self.observers.channel_state(state);
        }
    }

    fn set_outbound(&self, tx: Option<mpsc::UnboundedSender<Envelope>>) {
        *self.outbound.lock().unwrap_or_else(PoisonError::into_inner) = tx;
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn handle_inbound(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!("dropping malformed envelope: {err}");
                return;
            }
        };

        match envelope.kind {
            EnvelopeKind::NewMessage => {
                match serde_json::from_value::<Message>(envelope.payload.clone()) {
                    Ok(message) => {
                        let message = Message {
                            sync_status: RecordStatus::Synced,
                            ..message
                        };
                        if let Err(err) = self.store.upsert(message) {
                            error!("failed to store inbound message: {err}");
                        }
                    }
                    Err(err) => warn!("dropping new_message with bad payload: {err}"),
                }
            }
            EnvelopeKind::MessageSent => self.mark_message(&envelope, RecordStatus::Synced),
            EnvelopeKind::MessageError => {
                warn!(payload = %envelope.payload, "server rejected message");
                self.mark_message(&envelope, RecordStatus::Failed);
            }
            EnvelopeKind::Subscribed | EnvelopeKind::Unsubscribed => {
                debug!(kind = ?envelope.kind, groups = ?envelope.group_ids(), "subscription acknowledged");
            }
            EnvelopeKind::Pong => debug!("pong"),
            EnvelopeKind::Error => warn!(payload = %envelope.payload, "server reported an error"),
            kind => debug!(?kind, "ignoring client-bound envelope kind"),
        }

        let callback = self
            .callback
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(&envelope);
        }
    }

    fn mark_message(&self, envelope: &Envelope, status: RecordStatus) {
        let Some(id) = referenced_message(envelope) else {
            warn!(kind = ?envelope.kind, "envelope does not reference a message");
            return;
        };
        match self
            .store
            .batch(|tx| tx.update::<Message>(&id, |m| m.sync_status = status))
        {
            Ok(true) => {}
            Ok(false) => debug!(message_id = %id, "acknowledged message is not stored locally"),
            Err(err) => error!(message_id = %id, "failed to update message status: {err}"),
        }
    }
}

fn referenced_message(envelope: &Envelope) -> Option<String> {
    envelope.message_id.clone().or_else(|| {
        ["message_id", "id"]
            .iter()
            .find_map(|key| envelope.payload.get(*key).and_then(|v| v.as_str()))
            .map(str::to_owned)
    })
}

async fn supervise(inner: Arc<ChannelInner>) {
    let config = inner.config.clone();
    let mut shutdown = inner.shutdown_tx.subscribe();
    let url = match config.authenticated_url() {
        Ok(url) => url,
        Err(err) => {
            error!(url = %config.url, "invalid socket url: {err}");
            inner.set_state(ChannelState::Failed);
            return;
        }
    };

    let mut attempt: u32 = 0;
    loop {
        if inner.shutdown_requested() {
            break;
        }
        inner.set_state(ChannelState::Connecting);
        info!(attempt, url = %config.url, "connecting realtime channel");

        let connected = tokio::select! {
            result = timeout(config.connect_timeout, connect_async(url.as_str())) => result,
            _ = shutdown.changed() => break,
        };

        match connected {
            Ok(Ok((socket, _))) => {
                attempt = 0;
                info!("realtime channel connected");
                match run_session(&inner, socket, &mut shutdown).await {
                    SessionEnd::ClientClosed => break,
                    // Only a client-initiated 1000 ends the supervisor.
                    SessionEnd::Closed(code) => {
                        if code == NORMAL_CLOSE {
                            info!("server closed the realtime channel");
                        } else {
                            warn!(code, "realtime channel closed unexpectedly");
                        }
                        inner.set_state(ChannelState::Closed(code));
                    }
                    SessionEnd::Error => inner.set_state(ChannelState::Error),
                }
            }
            Ok(Err(err)) => {
                warn!(attempt, "connect failed: {err}");
                inner.set_state(ChannelState::Error);
            }
            Err(_) => {
                warn!(attempt, timeout = ?config.connect_timeout, "connect timed out");
                inner.set_state(ChannelState::Error);
            }
        }

        inner.set_state(ChannelState::Disconnected);
        if attempt >= config.max_reconnect_attempts {
            error!(
                attempts = attempt,
                "giving up on realtime channel after repeated failures"
            );
            inner.set_state(ChannelState::Failed);
            return;
        }

        let delay = backoff_with_jitter(attempt, config.reconnect_base, config.reconnect_cap);
        attempt += 1;
        debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    inner.set_state(ChannelState::Disconnected);
}

async fn run_session(
    inner: &ChannelInner,
    socket: Socket,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut write, mut read) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
    let mut groups = inner.groups_tx.subscribe();

    let active: Vec<EntityId> = groups.borrow_and_update().iter().cloned().collect();
    if write_envelope(&mut write, &Envelope::connect(&inner.config.device_id))
        .await
        .is_err()
        || write_envelope(&mut write, &Envelope::subscribe(&active))
            .await
            .is_err()
    {
        return SessionEnd::Error;
    }

    inner.set_outbound(Some(outbound_tx));
    inner.set_state(ChannelState::Connected);

    let period = inner.config.ping_interval;
    let mut ping = tokio::time::interval_at(Instant::now() + period, period);

    let end = loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = write
                    .send(WsMessage::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: "client disconnect".into(),
                    })))
                    .await;
                break SessionEnd::ClientClosed;
            }
            Some(envelope) = outbound_rx.recv() => {
                if let Err(err) = write_envelope(&mut write, &envelope).await {
                    warn!("socket write failed: {err}");
                    break SessionEnd::Error;
                }
            }
            _ = ping.tick() => {
                if write_envelope(&mut write, &Envelope::ping()).await.is_err() {
                    break SessionEnd::Error;
                }
            }
            Ok(()) = groups.changed() => {
                let active: Vec<EntityId> = groups.borrow_and_update().iter().cloned().collect();
                debug!(groups = active.len(), "resubscribing");
                if write_envelope(&mut write, &Envelope::subscribe(&active)).await.is_err() {
                    break SessionEnd::Error;
                }
            }
            frame = read.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => inner.handle_inbound(text.as_str()),
                Some(Ok(WsMessage::Close(frame))) => {
                    break SessionEnd::Closed(frame.map_or(NO_STATUS_CLOSE, |f| u16::from(f.code)));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!("socket read failed: {err}");
                    break SessionEnd::Error;
                }
                None => break SessionEnd::Closed(ABNORMAL_CLOSE),
            },
        }
    };

    inner.set_outbound(None);
    end
}

async fn write_envelope(
    write: &mut SplitSink<Socket, WsMessage>,
    envelope: &Envelope,
) -> Result<(), ChannelError> {
    let text = envelope.encode()?;
    write
        .send(WsMessage::Text(text.into()))
        .await
        .map_err(|_| ChannelError::NotConnected)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use tokio::net::TcpListener;

    use super::*;
    use crate::{
        observer::SyncObserver,
        store::tests::{memory_store, message},
    };

    #[derive(Default)]
    struct StateLog(StdMutex<Vec<ChannelState>>);

    impl SyncObserver for StateLog {
        fn on_channel_state(&self, state: ChannelState) {
            self.0.lock().unwrap().push(state);
        }
    }

    fn config(url: &str) -> ChannelConfig {
        ChannelConfig {
            url: url.to_owned(),
            token: "secret".to_owned(),
            device_id: "dev-a".to_owned(),
            reconnect_base: Duration::from_millis(10),
            reconnect_cap: Duration::from_millis(40),
            max_reconnect_attempts: 2,
            ping_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(2),
        }
    }

    fn channel() -> (RealtimeChannel, Arc<LocalStore>) {
        let store = memory_store();
        let channel = RealtimeChannel::new(
            config("ws://127.0.0.1:9/ws"),
            store.clone(),
            Observers::default(),
        );
        (channel, store)
    }

    #[test]
    fn token_travels_as_query_parameter() {
        let url = config("wss://sync.example.org/ws").authenticated_url().unwrap();
        assert_eq!(url.as_str(), "wss://sync.example.org/ws?token=secret");
    }

    #[test]
    fn send_fails_fast_when_not_connected() {
        let (channel, store) = channel();
        let msg = message("m-1", "g-1", "dev-a", RecordStatus::Pending);
        store.upsert(msg.clone()).unwrap();

        assert!(matches!(
            channel.send_message(&msg),
            Err(ChannelError::NotConnected)
        ));
        assert_eq!(
            store.get::<Message>("m-1").unwrap().sync_status,
            RecordStatus::Pending
        );
    }

    #[test]
    fn inbound_new_message_is_stored_as_synced() {
        let (channel, store) = channel();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        channel.on_envelope(move |envelope| sink.lock().unwrap().push(envelope.kind));

        let incoming = message("m-9", "g-1", "dev-b", RecordStatus::Pending);
        let envelope = Envelope::new(
            EnvelopeKind::NewMessage,
            serde_json::to_value(&incoming).unwrap(),
        );
        channel.handle_inbound(&envelope.encode().unwrap());

        assert_eq!(
            store.get::<Message>("m-9").unwrap().sync_status,
            RecordStatus::Synced
        );
        assert_eq!(*seen.lock().unwrap(), vec![EnvelopeKind::NewMessage]);
    }

    #[test]
    fn acknowledgements_update_local_message_status() {
        let (channel, store) = channel();
        store
            .batch(|tx| {
                tx.upsert(message("m-1", "g-1", "dev-a", RecordStatus::Pending));
                tx.upsert(message("m-2", "g-1", "dev-a", RecordStatus::Pending));
            })
            .unwrap();

        let sent = Envelope::new(EnvelopeKind::MessageSent, serde_json::Value::Null)
            .with_message_id("m-1");
        let rejected = Envelope::new(
            EnvelopeKind::MessageError,
            serde_json::json!({ "id": "m-2", "error": "group not found" }),
        );
        channel.handle_inbound(&sent.encode().unwrap());
        channel.handle_inbound(&rejected.encode().unwrap());

        let status = |id: &str| store.get::<Message>(id).unwrap().sync_status;
        assert_eq!(status("m-1"), RecordStatus::Synced);
        assert_eq!(status("m-2"), RecordStatus::Failed);
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let (channel, store) = channel();
        let calls = Arc::new(StdMutex::new(0));
        let counter = calls.clone();
        channel.on_envelope(move |_| *counter.lock().unwrap() += 1);

        channel.handle_inbound("{not json");
        channel.handle_inbound(r#"{"type":"new_message","payload":{"id":3}}"#);

        assert!(store.all::<Message>().is_empty());
        // The second frame is a valid envelope with a bad payload.
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn active_groups_only_change_on_difference() {
        let (channel, _) = channel();
        let mut rx = channel.inner.groups_tx.subscribe();
        channel.set_active_groups(vec!["g-2".to_owned(), "g-1".to_owned()]);
        assert!(rx.has_changed().unwrap());
        let _ = rx.borrow_and_update();
        channel.set_active_groups(vec!["g-1".to_owned(), "g-2".to_owned()]);
        assert!(!rx.has_changed().unwrap());
        assert_eq!(channel.active_groups().len(), 2);
    }

    #[tokio::test]
    async fn exhausted_reconnects_end_in_failed_state() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let store = memory_store();
        let channel = RealtimeChannel::new(
            config(&format!("ws://{addr}/ws")),
            store,
            Observers::default(),
        );
        let mut states = channel.state_changes();
        channel.connect();

        let failed = timeout(Duration::from_secs(5), async {
            loop {
                if *states.borrow_and_update() == ChannelState::Failed {
                    return;
                }
                if states.changed().await.is_err() {
                    return;
                }
            }
        })
        .await;
        assert!(failed.is_ok(), "channel never reached failed");
        assert_eq!(channel.state(), ChannelState::Failed);
        assert!(matches!(
            channel.send(Envelope::ping()),
            Err(ChannelError::Closed)
        ));
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_reconnect() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut cfg = config(&format!("ws://{addr}/ws"));
        cfg.reconnect_base = Duration::from_secs(60);
        cfg.reconnect_cap = Duration::from_secs(60);
        cfg.max_reconnect_attempts = 10;
        let observers = Observers::default();
        let log = Arc::new(StateLog::default());
        observers.register(log.clone());
        let channel = RealtimeChannel::new(cfg, memory_store(), observers);
        channel.connect();

        // Wait for the first failure; the supervisor is now sleeping.
        timeout(Duration::from_secs(5), async {
            while !log.0.lock().unwrap().contains(&ChannelState::Error) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        timeout(Duration::from_secs(1), channel.disconnect())
            .await
            .expect("disconnect should not wait for the backoff timer");
        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(channel.inner.task.lock().unwrap().is_none());
    }

    /// Accepts sockets in order and forwards every decoded frame tagged with
    /// the connection index. Connection 0 vanishes after its third frame,
    /// 1 sends a normal close and 2 vanishes, each after connect and
    /// subscribe. Later connections stay up.
    async fn flaky_server(
        listener: TcpListener,
        frames: mpsc::UnboundedSender<(usize, Envelope)>,
    ) {
        let mut index = 0;
        while let Ok((stream, _)) = listener.accept().await {
            let conn = index;
            index += 1;
            let frames = frames.clone();
            tokio::spawn(async move {
                let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                let limit = match conn {
                    0 => 3,
                    1 | 2 => 2,
                    _ => usize::MAX,
                };
                let mut seen = 0;
                while seen < limit {
                    match socket.next().await {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Ok(envelope) = Envelope::decode(text.as_str()) {
                                let _ = frames.send((conn, envelope));
                            }
                            seen += 1;
                        }
                        Some(Ok(_)) => {}
                        _ => return,
                    }
                }
                if conn == 1 {
                    let _ = socket
                        .close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "server restart".into(),
                        }))
                        .await;
                }
            });
        }
    }

    async fn next_frame(
        frames: &mut mpsc::UnboundedReceiver<(usize, Envelope)>,
    ) -> (usize, Envelope) {
        timeout(Duration::from_secs(5), frames.recv())
            .await
            .expect("frame within deadline")
            .expect("server still running")
    }

    #[tokio::test]
    async fn dropped_socket_reconnects_and_resubscribes_with_the_active_set() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frames_tx, mut frames) = mpsc::unbounded_channel();
        tokio::spawn(flaky_server(listener, frames_tx));

        // Three drops in a row against two allowed attempts only succeed
        // if the counter resets after each connect.
        let channel = RealtimeChannel::new(
            config(&format!("ws://{addr}/ws")),
            memory_store(),
            Observers::default(),
        );
        channel.set_active_groups(vec!["g-1".to_owned()]);
        channel.connect();

        let (conn, hello) = next_frame(&mut frames).await;
        assert_eq!((conn, hello.kind), (0, EnvelopeKind::Connect));
        assert_eq!(hello.payload["device_id"], "dev-a");
        let (conn, first) = next_frame(&mut frames).await;
        assert_eq!((conn, first.kind), (0, EnvelopeKind::Subscribe));
        assert_eq!(first.group_ids(), vec!["g-1".to_owned()]);

        timeout(Duration::from_secs(5), async {
            while !channel.is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("channel connected");
        channel.set_active_groups(vec!["g-2".to_owned(), "g-1".to_owned()]);

        let (conn, changed) = next_frame(&mut frames).await;
        assert_eq!((conn, changed.kind), (0, EnvelopeKind::Subscribe));
        let active = vec!["g-1".to_owned(), "g-2".to_owned()];
        assert_eq!(changed.group_ids(), active);

        for expected in 1..=3 {
            let (conn, hello) = next_frame(&mut frames).await;
            assert_eq!((conn, hello.kind), (expected, EnvelopeKind::Connect));
            let (conn, subscribe) = next_frame(&mut frames).await;
            assert_eq!((conn, subscribe.kind), (expected, EnvelopeKind::Subscribe));
            assert_eq!(subscribe.group_ids(), active);
        }

        timeout(Duration::from_secs(5), async {
            while !channel.is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("channel connected after the last reconnect");
        channel.disconnect().await;
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }
}
