//! Wire shapes for `/replicate/push`, `/replicate/pull` and the realtime
//! socket. Collection names stay strings on the wire and are validated
//! against [`Collection`] at the edges.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    Collection, CoreError, EntityId, Message, MutationId, MutationPayload, PushBatch,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PushRecord {
    pub mutation_id: MutationId,
    pub entity_id: EntityId,
    pub created_at: DateTime<Utc>,
    pub change: MutationPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PushRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<PushRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub favorites: Vec<PushRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status: Vec<PushRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<PushRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
}

impl PushRequest {
    pub fn add(&mut self, record: PushRecord) {
        let batch = match record.change.batch() {
            PushBatch::Groups => &mut self.groups,
            PushBatch::Favorites => &mut self.favorites,
            PushBatch::Status => &mut self.status,
            PushBatch::Devices => &mut self.devices,
        };
        batch.push(record);
    }

    pub fn records(&self) -> impl Iterator<Item = &PushRecord> {
        self.groups
            .iter()
            .chain(self.favorites.iter())
            .chain(self.status.iter())
            .chain(self.devices.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.records().next().is_none() && self.messages.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PullRequest {
    pub collections: Vec<String>,
    /// Absent entries mean "full sync" for that collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_ids: Option<Vec<EntityId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius: Option<f64>,
}

impl PullRequest {
    pub fn for_collections(collections: &[Collection]) -> Self {
        Self {
            collections: collections.iter().map(|c| c.as_str().to_owned()).collect(),
            ..Self::default()
        }
    }

    /// Parses the requested names against the closed replicated set.
    pub fn requested(&self) -> Result<Vec<Collection>, CoreError> {
        self.collections
            .iter()
            .map(|name| Collection::parse_replicated(name))
            .collect()
    }

    pub fn checkpoint_for(&self, collection: Collection) -> Option<&str> {
        self.checkpoint
            .as_ref()
            .and_then(|map| map.get(collection.as_str()))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PullDocument {
    pub collection: String,
    pub document: Value,
}

/// Server notice that an entity was removed. Applied, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletionSignal {
    pub collection: String,
    pub id: EntityId,
    pub deleted_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PullResponse {
    #[serde(default)]
    pub documents: Vec<PullDocument>,
    #[serde(default)]
    pub deletions: Vec<DeletionSignal>,
    /// Legacy single cursor applied to every requested collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoints: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Connect,
    Subscribe,
    Unsubscribe,
    SendMessage,
    NewMessage,
    MessageSent,
    MessageError,
    Subscribed,
    Unsubscribed,
    Ping,
    Pong,
    Error,
}

/// JSON text frame exchanged over the realtime socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            timestamp: Some(Utc::now().to_rfc3339()),
            message_id: None,
        }
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn connect(device_id: &str) -> Self {
        Self::new(
            EnvelopeKind::Connect,
            serde_json::json!({ "device_id": device_id }),
        )
    }

    pub fn subscribe<'a>(group_ids: impl IntoIterator<Item = &'a EntityId>) -> Self {
        let ids: Vec<&EntityId> = group_ids.into_iter().collect();
        Self::new(EnvelopeKind::Subscribe, serde_json::json!({ "group_ids": ids }))
    }

    pub fn ping() -> Self {
        Self::new(EnvelopeKind::Ping, Value::Null)
    }

    pub fn send_message(message: &Message) -> Result<Self, CoreError> {
        let payload =
            serde_json::to_value(message).map_err(|err| CoreError::Serialization(err.to_string()))?;
        Ok(Self::new(EnvelopeKind::SendMessage, payload).with_message_id(message.id.clone()))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(
            EnvelopeKind::Error,
            serde_json::json!({ "message": message.into() }),
        )
    }

    pub fn encode(&self) -> Result<String, CoreError> {
        serde_json::to_string(self).map_err(|err| CoreError::Serialization(err.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, CoreError> {
        serde_json::from_str(text).map_err(|err| CoreError::Serialization(err.to_string()))
    }

    /// Group ids carried by a `subscribe`/`unsubscribe` payload.
    pub fn group_ids(&self) -> Vec<EntityId> {
        self.payload
            .get("group_ids")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }
}
