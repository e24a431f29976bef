//! In-memory replication server speaking the `/replicate` HTTP protocol and
//! the realtime socket protocol. Used for local development and as the peer
//! in integration tests.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use axum::{
    Json, Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message as WsMessage, WebSocket},
    },
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use beacon_core::{
    Collection, CoreError, DeletionSignal, Device, EntityId, Envelope, EnvelopeKind,
    FavoriteGroup, Group, Message, MutationId, MutationPayload, PullDocument, PullRequest,
    PullResponse, PushRecord, PushRequest, RecordStatus, UserStatus, new_entity_id,
    parse_checkpoint,
};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc},
};
use tracing::{debug, error, info, warn};

pub const DEFAULT_PAGE_LIMIT: usize = 500;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// When set, clients must present exactly this token. Otherwise any
    /// non-empty token is accepted.
    pub token: Option<String>,
    /// Give created groups a fresh server id instead of the client's id.
    pub reassign_group_ids: bool,
    /// Maximum changes returned per collection in one pull.
    pub page_limit: usize,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            token: None,
            reassign_group_ids: false,
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid token")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

/// Body returned by `/replicate/push`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushSummary {
    pub applied: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
struct StoredDocument {
    changed_at: DateTime<Utc>,
    body: Value,
}

#[derive(Debug, Clone)]
struct Tombstone {
    id: EntityId,
    deleted_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Table {
    documents: HashMap<EntityId, StoredDocument>,
    tombstones: Vec<Tombstone>,
}

#[derive(Debug)]
struct Connection {
    device_id: Option<String>,
    groups: HashSet<EntityId>,
    tx: mpsc::UnboundedSender<WsMessage>,
}

enum Change<'a> {
    Document(&'a Value),
    Deletion(&'a EntityId),
}

#[derive(Debug, Default)]
struct RelayState {
    tables: HashMap<Collection, Table>,
    applied_mutations: HashSet<MutationId>,
    /// Client group id to the id this server assigned on create.
    group_aliases: HashMap<EntityId, EntityId>,
    connections: HashMap<u64, Connection>,
    next_connection_id: u64,
    last_stamp: Option<DateTime<Utc>>,
}

impl RelayState {
    /// Strictly increasing change time at microsecond precision, so a
    /// formatted checkpoint never lands between two changes.
    fn stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now().trunc_subsecs(6);
        let stamp = match self.last_stamp {
            Some(last) if now <= last => last + chrono::Duration::microseconds(1),
            _ => now,
        };
        self.last_stamp = Some(stamp);
        stamp
    }

    fn resolve_group(&self, id: &str) -> EntityId {
        self.group_aliases
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_owned())
    }

    fn document<T: DeserializeOwned>(&self, collection: Collection, id: &str) -> Option<T> {
        let stored = self.tables.get(&collection)?.documents.get(id)?;
        serde_json::from_value(stored.body.clone()).ok()
    }

    fn put(&mut self, collection: Collection, id: EntityId, changed_at: DateTime<Utc>, body: Value) {
        let table = self.tables.entry(collection).or_default();
        table.tombstones.retain(|tombstone| tombstone.id != id);
        table
            .documents
            .insert(id, StoredDocument { changed_at, body });
    }

    fn put_record<T: Serialize>(
        &mut self,
        collection: Collection,
        id: EntityId,
        changed_at: DateTime<Utc>,
        record: &T,
    ) -> Result<(), String> {
        let body = serde_json::to_value(record).map_err(|err| err.to_string())?;
        self.put(collection, id, changed_at, body);
        Ok(())
    }

    fn remove(&mut self, collection: Collection, id: &str) -> bool {
        let exists = self
            .tables
            .get(&collection)
            .is_some_and(|table| table.documents.contains_key(id));
        if !exists {
            return false;
        }
        let deleted_at = self.stamp();
        let table = self.tables.entry(collection).or_default();
        table.documents.remove(id);
        table.tombstones.push(Tombstone {
            id: id.to_owned(),
            deleted_at,
        });
        true
    }

    fn apply_push(&mut self, request: &PushRequest, options: &RelayOptions) -> PushSummary {
        let mut summary = PushSummary::default();
        for record in request.records() {
            if self.applied_mutations.contains(&record.mutation_id) {
                debug!(mutation_id = %record.mutation_id, "mutation already applied");
                summary.applied += 1;
                continue;
            }
            match self.apply_record(record, options) {
                Ok(()) => {
                    self.applied_mutations.insert(record.mutation_id.clone());
                    summary.applied += 1;
                }
                Err(reason) => {
                    warn!(
                        mutation_id = %record.mutation_id,
                        kind = %record.change.kind(),
                        "skipping mutation: {reason}"
                    );
                    summary.skipped += 1;
                }
            }
        }
        for message in &request.messages {
            match self.store_message(message.clone()) {
                Ok(_) => summary.applied += 1,
                Err(reason) => {
                    warn!(message_id = %message.id, "skipping message: {reason}");
                    summary.skipped += 1;
                }
            }
        }
        summary
    }

    fn apply_record(&mut self, record: &PushRecord, options: &RelayOptions) -> Result<(), String> {
        let now = self.stamp();
        match &record.change {
            MutationPayload::CreateGroup(create) => {
                let id = if options.reassign_group_ids {
                    let id = new_entity_id();
                    self.group_aliases
                        .insert(record.entity_id.clone(), id.clone());
                    id
                } else {
                    record.entity_id.clone()
                };
                let group = Group {
                    id: id.clone(),
                    name: create.name.clone(),
                    description: create.description.clone(),
                    creator_device_id: Some(create.creator_device_id.clone()),
                    latitude: create.latitude,
                    longitude: create.longitude,
                    created_at: record.created_at,
                    updated_at: Some(now),
                    confirmed: false,
                };
                info!(client_id = %record.entity_id, server_id = %id, "group created");
                self.put_record(Collection::Groups, id, now, &group)
            }
            MutationPayload::UpdateGroup(update) => {
                let id = self.resolve_group(&record.entity_id);
                let mut group: Group = self
                    .document(Collection::Groups, &id)
                    .ok_or_else(|| format!("unknown group {}", record.entity_id))?;
                if let Some(name) = &update.name {
                    group.name = name.clone();
                }
                if let Some(description) = &update.description {
                    group.description = Some(description.clone());
                }
                group.updated_at = Some(now);
                self.put_record(Collection::Groups, id, now, &group)
            }
            MutationPayload::AddFavorite(add) => {
                let group_id = self.resolve_group(&add.group_id);
                if self
                    .document::<Group>(Collection::Groups, &group_id)
                    .is_none()
                {
                    return Err(format!("unknown group {}", add.group_id));
                }
                let favorite = FavoriteGroup {
                    id: record.entity_id.clone(),
                    group_id,
                    device_id: add.device_id.clone(),
                    created_at: record.created_at,
                };
                self.put_record(Collection::FavoriteGroups, favorite.id.clone(), now, &favorite)
            }
            MutationPayload::RemoveFavorite(_) => {
                self.remove(Collection::FavoriteGroups, &record.entity_id);
                Ok(())
            }
            MutationPayload::UpdateStatus(update) => {
                let status = UserStatus {
                    id: record.entity_id.clone(),
                    device_id: update.device_id.clone(),
                    status: update.status.clone(),
                    message: update.message.clone(),
                    updated_at: now,
                };
                self.put_record(Collection::UserStatus, status.id.clone(), now, &status)
            }
            MutationPayload::UpdateNickname(update) => {
                let mut device: Device = self
                    .document(Collection::Devices, &record.entity_id)
                    .unwrap_or(Device {
                        id: record.entity_id.clone(),
                        nickname: None,
                        platform: None,
                        updated_at: None,
                    });
                device.nickname = Some(update.nickname.clone());
                device.updated_at = Some(now);
                self.put_record(Collection::Devices, device.id.clone(), now, &device)
            }
        }
    }

    /// Stores a message once; a repeated id returns the stored copy. A
    /// client group id is rewritten to the server's id for that group.
    fn store_message(&mut self, message: Message) -> Result<Message, String> {
        if let Some(existing) = self.document::<Message>(Collection::Messages, &message.id) {
            return Ok(existing);
        }
        let message = Message {
            group_id: self.resolve_group(&message.group_id),
            ..message
        };
        if self
            .document::<Group>(Collection::Groups, &message.group_id)
            .is_none()
        {
            return Err(format!("unknown group {}", message.group_id));
        }
        let message = Message {
            sync_status: RecordStatus::Synced,
            ..message
        };
        let now = self.stamp();
        self.put_record(Collection::Messages, message.id.clone(), now, &message)?;
        Ok(message)
    }

    fn pull(&self, request: &PullRequest, page_limit: usize) -> Result<PullResponse, ApiError> {
        let collections = request.requested()?;
        let mut response = PullResponse::default();
        let mut checkpoints = BTreeMap::new();
        let mut latest: Option<DateTime<Utc>> = None;

        for collection in collections {
            let since = request
                .checkpoint_for(collection)
                .map(parse_checkpoint)
                .transpose()?
                .map(|at| at.with_timezone(&Utc));
            let Some(table) = self.tables.get(&collection) else {
                continue;
            };
            let newer = |at: &DateTime<Utc>| since.is_none_or(|since| *at > since);

            let mut changes: Vec<(DateTime<Utc>, Change<'_>)> = table
                .documents
                .values()
                .filter(|stored| newer(&stored.changed_at))
                .filter(|stored| in_scope(collection, &stored.body, request))
                .map(|stored| (stored.changed_at, Change::Document(&stored.body)))
                .chain(
                    table
                        .tombstones
                        .iter()
                        .filter(|tombstone| newer(&tombstone.deleted_at))
                        .map(|tombstone| (tombstone.deleted_at, Change::Deletion(&tombstone.id))),
                )
                .collect();
            changes.sort_by_key(|(at, _)| *at);
            if changes.len() > page_limit {
                changes.truncate(page_limit);
                response.has_more = true;
            }

            if let Some((last, _)) = changes.last() {
                checkpoints.insert(collection.as_str().to_owned(), format_stamp(*last));
                latest = latest.max(Some(*last));
            }
            for (at, change) in changes {
                match change {
                    Change::Document(body) => response.documents.push(PullDocument {
                        collection: collection.as_str().to_owned(),
                        document: body.clone(),
                    }),
                    Change::Deletion(id) => response.deletions.push(DeletionSignal {
                        collection: collection.as_str().to_owned(),
                        id: id.clone(),
                        deleted_at: format_stamp(at),
                    }),
                }
            }
        }

        response.checkpoint = latest.map(format_stamp);
        response.checkpoints = (!checkpoints.is_empty()).then_some(checkpoints);
        Ok(response)
    }
}

fn format_stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Messages and pins follow the requested group ids; groups follow the
/// requested circle (radius in kilometres).
fn in_scope(collection: Collection, body: &Value, request: &PullRequest) -> bool {
    match collection {
        Collection::Messages | Collection::PinnedMessages => match &request.group_ids {
            Some(ids) => body
                .get("group_id")
                .and_then(Value::as_str)
                .is_some_and(|group_id| ids.iter().any(|id| id == group_id)),
            None => true,
        },
        Collection::Groups => match (request.latitude, request.longitude, request.radius) {
            (Some(latitude), Some(longitude), Some(radius)) => {
                let position = (
                    body.get("latitude").and_then(Value::as_f64),
                    body.get("longitude").and_then(Value::as_f64),
                );
                match position {
                    (Some(lat), Some(lon)) => {
                        distance_km((latitude, longitude), (lat, lon)) <= radius
                    }
                    _ => false,
                }
            }
            _ => true,
        },
        _ => true,
    }
}

fn distance_km(from: (f64, f64), to: (f64, f64)) -> f64 {
    let (lat1, lon1) = (from.0.to_radians(), from.1.to_radians());
    let (lat2, lon2) = (to.0.to_radians(), to.1.to_radians());
    let a = ((lat2 - lat1) / 2.0).sin().powi(2)
        + lat1.cos() * lat2.cos() * ((lon2 - lon1) / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RwLock<RelayState>>,
    options: Arc<RelayOptions>,
}

impl AppState {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(RelayOptions::default())
    }

    #[must_use]
    pub fn with_options(options: RelayOptions) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RelayState::default())),
            options: Arc::new(options),
        }
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    fn authorize(&self, token: Option<&str>) -> Result<(), ApiError> {
        let Some(token) = token.filter(|token| !token.is_empty()) else {
            return Err(ApiError::Unauthorized);
        };
        match &self.options.token {
            Some(expected) if expected != token => Err(ApiError::Unauthorized),
            _ => Ok(()),
        }
    }

    /// Inserts or replaces a server document, as if another client had
    /// written it. The document must carry a string `id`.
    pub async fn insert_document(&self, collection: Collection, document: Value) -> Result<(), String> {
        let id = document
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("{collection} document has no id"))?
            .to_owned();
        let mut state = self.inner.write().await;
        let now = state.stamp();
        state.put(collection, id, now, document);
        Ok(())
    }

    /// Deletes a server document, leaving a tombstone for pulling clients.
    pub async fn delete_document(&self, collection: Collection, id: &str) -> bool {
        self.inner.write().await.remove(collection, id)
    }

    pub async fn document(&self, collection: Collection, id: &str) -> Option<Value> {
        let state = self.inner.read().await;
        let stored = state.tables.get(&collection)?.documents.get(id)?;
        Some(stored.body.clone())
    }

    pub async fn documents(&self, collection: Collection) -> Vec<Value> {
        let state = self.inner.read().await;
        let Some(table) = state.tables.get(&collection) else {
            return Vec::new();
        };
        let mut stored: Vec<&StoredDocument> = table.documents.values().collect();
        stored.sort_by_key(|stored| stored.changed_at);
        stored.into_iter().map(|stored| stored.body.clone()).collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.read().await.connections.len()
    }

    async fn register(&self, tx: mpsc::UnboundedSender<WsMessage>) -> u64 {
        let mut state = self.inner.write().await;
        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state.connections.insert(
            id,
            Connection {
                device_id: None,
                groups: HashSet::new(),
                tx,
            },
        );
        id
    }

    async fn unregister(&self, connection_id: u64) -> Option<String> {
        let mut state = self.inner.write().await;
        state
            .connections
            .remove(&connection_id)
            .and_then(|connection| connection.device_id)
    }

    /// Handles one inbound frame and returns the reply for the sender.
    async fn handle_envelope(&self, connection_id: u64, text: &str) -> Option<Envelope> {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(connection_id, "malformed frame: {err}");
                return Some(Envelope::error(format!("malformed frame: {err}")));
            }
        };

        let mut state = self.inner.write().await;
        match envelope.kind {
            EnvelopeKind::Connect => {
                let device_id = envelope
                    .payload
                    .get("device_id")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                info!(connection_id, device_id = ?device_id, "device connected");
                let connection = state.connections.get_mut(&connection_id)?;
                connection.device_id = device_id;
                None
            }
            EnvelopeKind::Subscribe => {
                let group_ids = envelope.group_ids();
                let connection = state.connections.get_mut(&connection_id)?;
                connection.groups = group_ids.iter().cloned().collect();
                debug!(connection_id, groups = ?group_ids, "subscribed");
                Some(Envelope::new(
                    EnvelopeKind::Subscribed,
                    serde_json::json!({ "group_ids": group_ids }),
                ))
            }
            EnvelopeKind::Unsubscribe => {
                let group_ids = envelope.group_ids();
                let connection = state.connections.get_mut(&connection_id)?;
                for id in &group_ids {
                    connection.groups.remove(id);
                }
                Some(Envelope::new(
                    EnvelopeKind::Unsubscribed,
                    serde_json::json!({ "group_ids": group_ids }),
                ))
            }
            EnvelopeKind::SendMessage => Some(state.accept_message(connection_id, envelope)),
            EnvelopeKind::Ping => Some(Envelope::new(EnvelopeKind::Pong, Value::Null)),
            kind => Some(Envelope::error(format!("unexpected {kind:?} frame"))),
        }
    }
}

impl RelayState {
    /// Stores a socket-sent message, fans it out to the other subscribers of
    /// its group and returns the acknowledgement for the sender.
    fn accept_message(&mut self, connection_id: u64, envelope: Envelope) -> Envelope {
        let reference = envelope.message_id.clone().or_else(|| {
            envelope
                .payload
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_owned)
        });
        let rejected = |reason: String| {
            let reply = Envelope::new(
                EnvelopeKind::MessageError,
                serde_json::json!({ "id": reference, "error": reason }),
            );
            match &reference {
                Some(id) => reply.with_message_id(id.clone()),
                None => reply,
            }
        };

        let message = match serde_json::from_value::<Message>(envelope.payload) {
            Ok(message) => message,
            Err(err) => return rejected(format!("invalid message payload: {err}")),
        };
        let stored = match self.store_message(message) {
            Ok(stored) => stored,
            Err(reason) => return rejected(reason),
        };

        match serde_json::to_value(&stored) {
            Ok(payload) => {
                let fan_out = Envelope::new(EnvelopeKind::NewMessage, payload);
                let mut delivered = 0;
                for (id, connection) in &self.connections {
                    if *id != connection_id && connection.groups.contains(&stored.group_id) {
                        send_envelope(&connection.tx, &fan_out);
                        delivered += 1;
                    }
                }
                debug!(message_id = %stored.id, delivered, "message fanned out");
            }
            Err(err) => error!("failed to encode message {}: {err}", stored.id),
        }

        Envelope::new(
            EnvelopeKind::MessageSent,
            serde_json::json!({ "id": stored.id }),
        )
        .with_message_id(stored.id)
    }
}

fn send_envelope(tx: &mpsc::UnboundedSender<WsMessage>, envelope: &Envelope) {
    match envelope.encode() {
        Ok(text) => {
            let _ = tx.send(WsMessage::Text(text.into()));
        }
        Err(err) => error!("failed to encode envelope: {err}"),
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/replicate/push", post(push_handler))
        .route("/replicate/pull", post(pull_handler))
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "relay listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn healthz_handler() -> impl IntoResponse {
    Json(serde_json::json!({"ok": true}))
}

async fn push_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushSummary>, ApiError> {
    state.authorize(bearer_token(&headers))?;
    let summary = state
        .inner
        .write()
        .await
        .apply_push(&request, &state.options);
    info!(applied = summary.applied, skipped = summary.skipped, "push handled");
    Ok(Json(summary))
}

async fn pull_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PullRequest>,
) -> Result<Json<PullResponse>, ApiError> {
    state.authorize(bearer_token(&headers))?;
    let response = state
        .inner
        .read()
        .await
        .pull(&request, state.options.page_limit)?;
    debug!(
        documents = response.documents.len(),
        deletions = response.deletions.len(),
        has_more = response.has_more,
        "pull handled"
    );
    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct SocketParams {
    token: Option<String>,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<SocketParams>,
    State(state): State<AppState>,
) -> Response {
    if let Err(err) = state.authorize(params.token.as_deref()) {
        return err.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();

    let send_task = tokio::spawn(async move {
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.tick().await;

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = keepalive.tick() => {
                    if ws_sender.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let connection_id = state.register(outbound_tx.clone()).await;
    debug!(connection_id, "socket opened");

    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!(connection_id, "websocket receive error: {err}");
                break;
            }
        };

        match message {
            WsMessage::Text(text) => {
                if let Some(reply) = state.handle_envelope(connection_id, text.as_str()).await {
                    send_envelope(&outbound_tx, &reply);
                }
            }
            WsMessage::Binary(_) => {
                send_envelope(&outbound_tx, &Envelope::error("binary frames are not supported"));
            }
            WsMessage::Close(_) => break,
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
        }
    }

    let device_id = state.unregister(connection_id).await;
    send_task.abort();
    info!(connection_id, device_id = ?device_id, "socket closed");
}

#[cfg(test)]
mod tests {
    use beacon_core::{AddFavorite, CreateGroup, UpdateGroup};

    use super::*;

    fn record(mutation_id: &str, entity_id: &str, change: MutationPayload) -> PushRecord {
        PushRecord {
            mutation_id: mutation_id.to_owned(),
            entity_id: entity_id.to_owned(),
            created_at: Utc::now(),
            change,
        }
    }

    fn create_group(mutation_id: &str, entity_id: &str, name: &str) -> PushRecord {
        record(
            mutation_id,
            entity_id,
            MutationPayload::CreateGroup(CreateGroup {
                name: name.to_owned(),
                description: None,
                latitude: Some(52.37),
                longitude: Some(4.89),
                creator_device_id: "dev-a".to_owned(),
            }),
        )
    }

    fn push(state: &mut RelayState, records: Vec<PushRecord>, options: &RelayOptions) -> PushSummary {
        let mut request = PushRequest::default();
        for record in records {
            request.add(record);
        }
        state.apply_push(&request, options)
    }

    #[test]
    fn stamps_strictly_increase() {
        let mut state = RelayState::default();
        let first = state.stamp();
        let second = state.stamp();
        assert!(second > first);
        assert!(format_stamp(second) > format_stamp(first));
    }

    #[test]
    fn repeated_mutation_is_applied_once() {
        let mut state = RelayState::default();
        let options = RelayOptions {
            reassign_group_ids: true,
            ..RelayOptions::default()
        };
        push(&mut state, vec![create_group("mut-1", "g-local", "Dock")], &options);
        push(&mut state, vec![create_group("mut-1", "g-local", "Dock")], &options);

        assert_eq!(state.tables[&Collection::Groups].documents.len(), 1);
        assert!(state.document::<Group>(Collection::Groups, "g-local").is_none());
    }

    #[test]
    fn client_group_id_resolves_after_reassignment() {
        let mut state = RelayState::default();
        let options = RelayOptions {
            reassign_group_ids: true,
            ..RelayOptions::default()
        };
        let mut request = PushRequest::default();
        request.add(create_group("mut-1", "g-local", "Dock"));
        request.add(record(
            "mut-2",
            "g-local",
            MutationPayload::UpdateGroup(UpdateGroup {
                name: Some("Dock east".to_owned()),
                description: None,
            }),
        ));
        request.add(record(
            "mut-3",
            "fav-1",
            MutationPayload::AddFavorite(AddFavorite {
                group_id: "g-local".to_owned(),
                device_id: "dev-a".to_owned(),
            }),
        ));
        request.messages.push(Message {
            id: "m-1".to_owned(),
            group_id: "g-local".to_owned(),
            sender_device_id: "dev-a".to_owned(),
            body: "tide is out".to_owned(),
            created_at: Utc::now(),
            sync_status: RecordStatus::Pending,
        });

        let summary = state.apply_push(&request, &options);
        assert_eq!(summary, PushSummary { applied: 4, skipped: 0 });

        let server_id = state.tables[&Collection::Groups]
            .documents
            .keys()
            .next()
            .cloned()
            .unwrap();
        assert_ne!(server_id, "g-local");
        let group: Group = state.document(Collection::Groups, &server_id).unwrap();
        assert_eq!(group.name, "Dock east");
        let favorite: FavoriteGroup = state.document(Collection::FavoriteGroups, "fav-1").unwrap();
        assert_eq!(favorite.group_id, server_id);
        let message: Message = state.document(Collection::Messages, "m-1").unwrap();
        assert_eq!(message.group_id, server_id);
    }

    #[test]
    fn update_for_unknown_group_is_skipped() {
        let mut state = RelayState::default();
        let summary = push(
            &mut state,
            vec![
                create_group("mut-1", "g-1", "Dock"),
                record(
                    "mut-2",
                    "g-missing",
                    MutationPayload::UpdateGroup(UpdateGroup {
                        name: Some("x".to_owned()),
                        description: None,
                    }),
                ),
            ],
            &RelayOptions::default(),
        );
        assert_eq!(summary, PushSummary { applied: 1, skipped: 1 });
    }

    #[test]
    fn pull_pages_by_change_time() {
        let mut state = RelayState::default();
        let records = (0..5)
            .map(|i| create_group(&format!("mut-{i}"), &format!("g-{i}"), "Dock"))
            .collect();
        push(&mut state, records, &RelayOptions::default());

        let mut request = PullRequest::for_collections(&[Collection::Groups]);
        let first = state.pull(&request, 3).unwrap();
        assert_eq!(first.documents.len(), 3);
        assert!(first.has_more);

        request.checkpoint = first.checkpoints.clone();
        let second = state.pull(&request, 3).unwrap();
        assert_eq!(second.documents.len(), 2);
        assert!(!second.has_more);
        let ids: Vec<&str> = first
            .documents
            .iter()
            .chain(second.documents.iter())
            .filter_map(|doc| doc.document["id"].as_str())
            .collect();
        assert_eq!(ids, vec!["g-0", "g-1", "g-2", "g-3", "g-4"]);
    }

    #[test]
    fn removed_favorite_becomes_a_tombstone() {
        let mut state = RelayState::default();
        push(
            &mut state,
            vec![
                create_group("mut-1", "g-1", "Dock"),
                record(
                    "mut-2",
                    "fav-1",
                    MutationPayload::AddFavorite(AddFavorite {
                        group_id: "g-1".to_owned(),
                        device_id: "dev-a".to_owned(),
                    }),
                ),
            ],
            &RelayOptions::default(),
        );
        let request = PullRequest::for_collections(&[Collection::FavoriteGroups]);
        let before = state.pull(&request, 10).unwrap();
        assert_eq!(before.documents.len(), 1);

        assert!(state.remove(Collection::FavoriteGroups, "fav-1"));
        let mut request = request;
        request.checkpoint = before.checkpoints;
        let after = state.pull(&request, 10).unwrap();
        assert!(after.documents.is_empty());
        assert_eq!(after.deletions.len(), 1);
        assert_eq!(after.deletions[0].id, "fav-1");
    }

    #[test]
    fn pull_rejects_unknown_collection() {
        let state = RelayState::default();
        let request = PullRequest {
            collections: vec!["accounts".to_owned()],
            ..PullRequest::default()
        };
        assert!(matches!(state.pull(&request, 10), Err(ApiError::BadRequest(_))));
    }

    #[test]
    fn geo_scope_filters_groups() {
        let mut state = RelayState::default();
        push(&mut state, vec![create_group("mut-1", "g-1", "Dock")], &RelayOptions::default());
        let mut request = PullRequest::for_collections(&[Collection::Groups]);
        request.latitude = Some(52.38);
        request.longitude = Some(4.90);
        request.radius = Some(5.0);
        assert_eq!(state.pull(&request, 10).unwrap().documents.len(), 1);

        request.latitude = Some(48.85);
        request.longitude = Some(2.35);
        assert!(state.pull(&request, 10).unwrap().documents.is_empty());
    }

    #[test]
    fn token_must_match_when_configured() {
        let open = AppState::new();
        assert!(open.authorize(Some("anything")).is_ok());
        assert!(open.authorize(Some("")).is_err());
        assert!(open.authorize(None).is_err());

        let locked = AppState::with_options(RelayOptions {
            token: Some("secret".to_owned()),
            ..RelayOptions::default()
        });
        assert!(locked.authorize(Some("secret")).is_ok());
        assert!(locked.authorize(Some("guess")).is_err());
    }
}
