use serde::{Deserialize, Serialize};

/// Status of one domain or of the whole engine. Variants are declared in
/// ascending precedence so `max` picks the one to surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Synced,
    Pending,
    Syncing,
    Failed,
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DomainCounts {
    pub pending: usize,
    pub syncing: usize,
    pub failed: usize,
}

impl DomainCounts {
    pub fn state(&self) -> SyncState {
        if self.failed > 0 {
            SyncState::Failed
        } else if self.syncing > 0 {
            SyncState::Syncing
        } else if self.pending > 0 {
            SyncState::Pending
        } else {
            SyncState::Synced
        }
    }

    pub fn outstanding(&self) -> usize {
        self.pending + self.syncing + self.failed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusInputs {
    pub mutations: DomainCounts,
    pub messages: DomainCounts,
    pub online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub mutations: SyncState,
    pub messages: SyncState,
    pub overall: SyncState,
    pub inputs: StatusInputs,
}

pub fn aggregate(inputs: &StatusInputs) -> SyncStatus {
    let mutations = inputs.mutations.state();
    let messages = inputs.messages.state();
    let overall = if inputs.online {
        mutations.max(messages)
    } else {
        SyncState::Offline
    };
    SyncStatus {
        mutations,
        messages,
        overall,
        inputs: *inputs,
    }
}
