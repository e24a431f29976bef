use std::sync::{Mutex, PoisonError};

use beacon_core::{DomainCounts, StatusInputs, SyncStatus, aggregate};

use crate::observer::Observers;

#[derive(Debug)]
struct TrackerState {
    inputs: StatusInputs,
    last: SyncStatus,
    counts_revision: u64,
}

/// Holds the aggregator inputs and republishes the derived status whenever
/// it actually changes. Also the engine's source of truth for connectivity.
#[derive(Debug)]
pub struct StatusTracker {
    state: Mutex<TrackerState>,
    observers: Observers,
}

impl StatusTracker {
    pub fn new(observers: Observers, online: bool) -> Self {
        let inputs = StatusInputs {
            online,
            ..StatusInputs::default()
        };
        Self {
            state: Mutex::new(TrackerState {
                inputs,
                last: aggregate(&inputs),
                counts_revision: 0,
            }),
            observers,
        }
    }

    pub fn current(&self) -> SyncStatus {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).last
    }

    pub fn is_online(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .inputs
            .online
    }

    /// Returns the previous connectivity value.
    pub fn set_online(&self, online: bool) -> bool {
        let mut previous = online;
        self.update(|state| {
            previous = state.inputs.online;
            state.inputs.online = online;
        });
        previous
    }

    /// Counts are tagged with the store revision they were taken at. A
    /// snapshot older than the last one applied is dropped.
    pub fn publish_counts(&self, revision: u64, mutations: DomainCounts, messages: DomainCounts) {
        self.update(|state| {
            if revision < state.counts_revision {
                return;
            }
            state.counts_revision = revision;
            state.inputs.mutations = mutations;
            state.inputs.messages = messages;
        });
    }

    fn update(&self, apply: impl FnOnce(&mut TrackerState)) {
        let changed = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            apply(&mut state);
            let next = aggregate(&state.inputs);
            if next == state.last {
                None
            } else {
                state.last = next;
                Some(next)
            }
        };
        if let Some(status) = changed {
            self.observers.status_changed(&status);
        }
    }
}
