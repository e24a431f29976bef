//! Drains the mutation queue and locally authored messages to the server.

use std::sync::Arc;

use beacon_core::{
    Collection, DeviceId, Group, Message, MutationKind, PushRecord, PushRequest, RecordStatus,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    error::SyncError,
    retry::RetryPolicy,
    store::{LocalStore, StoreTx},
    transport::SyncTransport,
};

/// Why a locally authored message was held back this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WithholdReason {
    GroupMissing,
    /// The group's `create_group` is still queued.
    GroupNotCreated,
    /// The server already holds this group under another id.
    StaleGroupId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MessagePushReport {
    pub sent: usize,
    pub withheld: usize,
}

pub struct PushEngine {
    store: Arc<LocalStore>,
    transport: Arc<dyn SyncTransport>,
    device_id: DeviceId,
}

impl PushEngine {
    pub fn new(
        store: Arc<LocalStore>,
        transport: Arc<dyn SyncTransport>,
        device_id: impl Into<DeviceId>,
    ) -> Self {
        Self {
            store,
            transport,
            device_id: device_id.into(),
        }
    }

    /// Pushes every pending or failed mutation in one request. Returns how
    /// many were acknowledged.
    pub async fn push_mutations(
        &self,
        retry: &RetryPolicy,
        is_online: impl Fn() -> bool,
    ) -> Result<usize, SyncError> {
        if !is_online() {
            return Err(SyncError::Offline);
        }

        // Flip to syncing before any network call so a concurrent drain
        // cannot pick the same entries up again.
        let in_flight = self.store.batch(|tx| {
            let pending = tx.pending_mutations();
            for mutation in &pending {
                tx.mark_mutation(&mutation.id, RecordStatus::Syncing, None);
            }
            pending
        })?;
        if in_flight.is_empty() {
            return Ok(0);
        }

        let mut request = PushRequest::default();
        for mutation in &in_flight {
            request.add(PushRecord {
                mutation_id: mutation.id.clone(),
                entity_id: mutation.entity_id.clone(),
                created_at: mutation.created_at,
                change: mutation.payload.clone(),
            });
        }
        debug!(
            groups = request.groups.len(),
            favorites = request.favorites.len(),
            status = request.status.len(),
            devices = request.devices.len(),
            "pushing mutations"
        );

        let result = retry
            .run("push_mutations", &is_online, || self.transport.push(&request))
            .await;

        match result {
            Ok(()) => {
                self.store.batch(|tx| {
                    for mutation in &in_flight {
                        tx.mark_mutation(&mutation.id, RecordStatus::Synced, None);
                        tx.remove_mutation(&mutation.id);
                    }
                })?;
                info!(count = in_flight.len(), "mutations pushed");
                Ok(in_flight.len())
            }
            Err(err) => {
                let message = err.to_string();
                self.store.batch(|tx| {
                    for mutation in &in_flight {
                        tx.mark_mutation(
                            &mutation.id,
                            RecordStatus::Failed,
                            Some(message.clone()),
                        );
                    }
                })?;
                Err(err)
            }
        }
    }

    /// Pushes this device's pending or failed messages whose group the
    /// server is known to have. Everything else waits for a later cycle.
    pub async fn push_messages(
        &self,
        retry: &RetryPolicy,
        is_online: impl Fn() -> bool,
    ) -> Result<MessagePushReport, SyncError> {
        if !is_online() {
            return Err(SyncError::Offline);
        }

        let (outgoing, withheld) = self.store.batch(|tx| {
            let mut candidates = tx.query(|m: &Message| {
                m.sender_device_id == self.device_id && m.sync_status.is_outstanding()
            });
            candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at));

            let mut outgoing = Vec::new();
            let mut withheld = 0;
            for message in candidates {
                if let Some(reason) = withhold_reason(tx, &message.group_id) {
                    debug!(
                        message_id = %message.id,
                        group_id = %message.group_id,
                        ?reason,
                        "withholding message"
                    );
                    withheld += 1;
                    continue;
                }
                tx.update::<Message>(&message.id, |m| m.sync_status = RecordStatus::Syncing);
                outgoing.push(Message {
                    sync_status: RecordStatus::Syncing,
                    ..message
                });
            }
            (outgoing, withheld)
        })?;

        if outgoing.is_empty() {
            return Ok(MessagePushReport { sent: 0, withheld });
        }

        let request = PushRequest {
            messages: outgoing,
            ..PushRequest::default()
        };
        let result = retry
            .run("push_messages", &is_online, || self.transport.push(&request))
            .await;

        let outcome = if result.is_ok() {
            RecordStatus::Synced
        } else {
            RecordStatus::Failed
        };
        self.store.batch(|tx| {
            for message in &request.messages {
                tx.update::<Message>(&message.id, |m| m.sync_status = outcome);
            }
        })?;

        match result {
            Ok(()) => {
                info!(count = request.messages.len(), withheld, "messages pushed");
                Ok(MessagePushReport {
                    sent: request.messages.len(),
                    withheld,
                })
            }
            Err(err) => {
                warn!(count = request.messages.len(), "message push failed: {err}");
                Err(err)
            }
        }
    }
}

/// A message may only go out once its group exists on the server under the
/// id the message carries.
pub(crate) fn withhold_reason(tx: &StoreTx<'_>, group_id: &str) -> Option<WithholdReason> {
    let Some(group) = tx.get::<Group>(group_id) else {
        return Some(WithholdReason::GroupMissing);
    };
    if group.confirmed {
        return None;
    }
    let create_queued = tx
        .mutations_for(Collection::Groups, group_id)
        .iter()
        .any(|m| m.kind() == MutationKind::CreateGroup);
    if create_queued {
        return Some(WithholdReason::GroupNotCreated);
    }
    let superseded = !tx
        .query(|g: &Group| {
            g.confirmed
                && g.id != group.id
                && g.name == group.name
                && g.creator_device_id.is_some()
                && g.creator_device_id == group.creator_device_id
        })
        .is_empty();
    superseded.then_some(WithholdReason::StaleGroupId)
}
