//! Sequences push and pull into single-flight sync cycles and reacts to
//! connectivity and visibility transitions.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    error::SyncError,
    pull::{PullEngine, PullScope},
    push::PushEngine,
    retry::RetryPolicy,
    status::StatusTracker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Manual,
    Online,
    Visibility,
    Periodic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
    InFlight,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub mutations_pushed: usize,
    pub messages_pushed: usize,
    pub messages_withheld: usize,
    pub documents_applied: usize,
    pub deletions_applied: usize,
    pub mutations_discarded: usize,
    pub entries_skipped: usize,
    pub pages: u32,
}

#[derive(Debug)]
pub enum CycleOutcome {
    Completed(CycleReport),
    Skipped(SkipReason),
    Failed { report: CycleReport, error: SyncError },
}

impl CycleOutcome {
    pub fn report(&self) -> Option<&CycleReport> {
        match self {
            CycleOutcome::Completed(report) | CycleOutcome::Failed { report, .. } => Some(report),
            CycleOutcome::Skipped(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub retry: RetryPolicy,
    pub max_pull_pages: u32,
    pub visibility_debounce: Duration,
    pub online_settle: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_pull_pages: 10,
            visibility_debounce: Duration::from_secs(1),
            online_settle: Duration::from_millis(500),
        }
    }
}

/// Released on drop, whatever way the cycle ends.
struct FlightGuard<'a>(&'a AtomicBool);

impl<'a> FlightGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncOrchestrator {
    push: PushEngine,
    pull: PullEngine,
    status: Arc<StatusTracker>,
    settings: OrchestratorSettings,
    running: AtomicBool,
    visibility_generation: AtomicU64,
}

impl SyncOrchestrator {
    pub fn new(
        push: PushEngine,
        pull: PullEngine,
        status: Arc<StatusTracker>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            push,
            pull,
            status,
            settings,
            running: AtomicBool::new(false),
            visibility_generation: AtomicU64::new(0),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn set_pull_scope(&self, scope: PullScope) {
        self.pull.set_scope(scope);
    }

    pub async fn request_sync(&self) -> CycleOutcome {
        self.run_cycle(SyncTrigger::Manual).await
    }

    /// Records connectivity. Coming back online schedules a cycle after a
    /// short settle delay; the handle resolves to `None` if the device went
    /// offline again in the meantime.
    pub fn set_online(self: &Arc<Self>, online: bool) -> Option<JoinHandle<Option<CycleOutcome>>> {
        let was_online = self.status.set_online(online);
        if online == was_online {
            return None;
        }
        info!(online, "connectivity changed");
        if !online {
            return None;
        }

        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            tokio::time::sleep(this.settings.online_settle).await;
            if !this.status.is_online() {
                return None;
            }
            Some(this.run_cycle(SyncTrigger::Online).await)
        }))
    }

    /// Foreground transitions are debounced: only the last call inside the
    /// window runs a cycle, earlier handles resolve to `None`.
    pub fn notify_visibility(
        self: &Arc<Self>,
        visible: bool,
    ) -> Option<JoinHandle<Option<CycleOutcome>>> {
        if !visible {
            return None;
        }
        let generation = self.visibility_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            tokio::time::sleep(this.settings.visibility_debounce).await;
            if this.visibility_generation.load(Ordering::Acquire) != generation {
                return None;
            }
            Some(this.run_cycle(SyncTrigger::Visibility).await)
        }))
    }

    /// Runs a cycle every `period` until the handle is aborted.
    pub fn spawn_periodic(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                this.run_cycle(SyncTrigger::Periodic).await;
            }
        })
    }

    pub async fn run_cycle(&self, trigger: SyncTrigger) -> CycleOutcome {
        if !self.status.is_online() {
            debug!(?trigger, "offline, sync skipped");
            return CycleOutcome::Skipped(SkipReason::Offline);
        }
        let Some(_guard) = FlightGuard::acquire(&self.running) else {
            debug!(?trigger, "sync already in flight");
            return CycleOutcome::Skipped(SkipReason::InFlight);
        };

        debug!(?trigger, "sync cycle started");
        let retry = &self.settings.retry;
        let online = || self.status.is_online();
        let mut report = CycleReport::default();
        let mut failure: Option<SyncError> = None;

        // Messages may reference groups created in this same cycle.
        match self.push.push_mutations(retry, online).await {
            Ok(count) => report.mutations_pushed = count,
            Err(SyncError::Offline) => return self.abandon(report),
            Err(err) => {
                self.log_failure("push mutations", &err);
                failure.get_or_insert(err);
            }
        }

        match self.push.push_messages(retry, online).await {
            Ok(pushed) => {
                report.messages_pushed = pushed.sent;
                report.messages_withheld = pushed.withheld;
            }
            Err(SyncError::Offline) => return self.abandon(report),
            Err(err) => {
                self.log_failure("push messages", &err);
                failure.get_or_insert(err);
            }
        }

        let collections = self.pull.collections();
        let mut has_more = false;
        while report.pages < self.settings.max_pull_pages {
            match self.pull.pull(&collections, retry, online).await {
                Ok(outcome) => {
                    report.pages += 1;
                    report.documents_applied += outcome.applied;
                    report.deletions_applied += outcome.deleted;
                    report.mutations_discarded += outcome.discarded_mutations;
                    report.entries_skipped += outcome.skipped;
                    has_more = outcome.has_more;
                    if !has_more {
                        break;
                    }
                }
                Err(SyncError::Offline) => return self.abandon(report),
                Err(err) => {
                    self.log_failure("pull", &err);
                    failure.get_or_insert(err);
                    break;
                }
            }
        }
        if has_more {
            debug!(pages = report.pages, "pull page limit reached, resuming next cycle");
        }

        match failure {
            Some(error) => CycleOutcome::Failed { report, error },
            None => {
                info!(
                    ?trigger,
                    mutations = report.mutations_pushed,
                    messages = report.messages_pushed,
                    withheld = report.messages_withheld,
                    documents = report.documents_applied,
                    deletions = report.deletions_applied,
                    "sync cycle completed"
                );
                CycleOutcome::Completed(report)
            }
        }
    }

    fn abandon(&self, report: CycleReport) -> CycleOutcome {
        debug!("went offline mid-cycle, abandoning");
        CycleOutcome::Failed {
            report,
            error: SyncError::Offline,
        }
    }

    /// Loud only while online; offline failures are expected.
    fn log_failure(&self, stage: &str, err: &SyncError) {
        if self.status.is_online() {
            warn!(stage, "sync cycle error: {err}");
        } else {
            debug!(stage, "sync cycle error while offline: {err}");
        }
    }
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("settings", &self.settings)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use beacon_core::{
        CreateGroup, Message, MutationPayload, PullRequest, PullResponse, PushRequest,
        RecordStatus, UpdateNickname,
    };
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        error::TransportError,
        observer::Observers,
        push::tests::ScriptedTransport,
        queue::MutationQueue,
        store::{
            LocalStore,
            tests::{group, message},
        },
        transport::SyncTransport,
    };

    struct Harness {
        orchestrator: Arc<SyncOrchestrator>,
        store: Arc<LocalStore>,
        status: Arc<StatusTracker>,
    }

    fn harness(transport: Arc<dyn SyncTransport>, settings: OrchestratorSettings) -> Harness {
        let observers = Observers::default();
        let status = Arc::new(StatusTracker::new(observers.clone(), true));
        let store = Arc::new(LocalStore::in_memory(observers, status.clone()));
        let push = PushEngine::new(store.clone(), transport.clone(), "dev-a");
        let pull = PullEngine::new(store.clone(), transport);
        Harness {
            orchestrator: Arc::new(SyncOrchestrator::new(push, pull, status.clone(), settings)),
            store,
            status,
        }
    }

    fn nickname(store: &Arc<LocalStore>) {
        MutationQueue::new(store.clone())
            .enqueue(
                MutationPayload::UpdateNickname(UpdateNickname {
                    nickname: "kitchen".to_owned(),
                }),
                "dev-a",
            )
            .unwrap();
    }

    #[tokio::test]
    async fn offline_cycle_is_a_no_op() {
        let transport = Arc::new(ScriptedTransport::default());
        let h = harness(transport.clone(), OrchestratorSettings::default());
        nickname(&h.store);
        h.status.set_online(false);

        let outcome = h.orchestrator.request_sync().await;
        assert!(matches!(outcome, CycleOutcome::Skipped(SkipReason::Offline)));
        assert!(transport.pushes.lock().unwrap().is_empty());
        assert!(transport.pulls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn entity_mutations_push_before_messages_then_pull() {
        let transport = Arc::new(ScriptedTransport::default());
        let h = harness(transport.clone(), OrchestratorSettings::default());
        nickname(&h.store);
        h.store
            .batch(|tx| {
                tx.upsert(group("g-1", Some("dev-a"), true));
                tx.upsert(message("m-1", "g-1", "dev-a", RecordStatus::Pending));
            })
            .unwrap();

        let outcome = h.orchestrator.request_sync().await;
        let CycleOutcome::Completed(report) = outcome else {
            panic!("unexpected outcome {outcome:?}");
        };
        assert_eq!(report.mutations_pushed, 1);
        assert_eq!(report.messages_pushed, 1);
        assert_eq!(report.pages, 1);

        let pushes = transport.pushes.lock().unwrap();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[0].devices.len(), 1);
        assert!(pushes[0].messages.is_empty());
        assert_eq!(pushes[1].messages.len(), 1);
        assert_eq!(transport.pulls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn new_group_and_its_first_message_go_out_in_one_cycle() {
        let transport = Arc::new(ScriptedTransport::default());
        let h = harness(transport.clone(), OrchestratorSettings::default());
        h.store.upsert(group("local-1", Some("dev-a"), false)).unwrap();
        MutationQueue::new(h.store.clone())
            .enqueue(
                MutationPayload::CreateGroup(CreateGroup {
                    name: "group local-1".to_owned(),
                    description: None,
                    latitude: None,
                    longitude: None,
                    creator_device_id: "dev-a".to_owned(),
                }),
                "local-1",
            )
            .unwrap();
        h.store
            .upsert(message("m-1", "local-1", "dev-a", RecordStatus::Pending))
            .unwrap();

        let outcome = h.orchestrator.request_sync().await;
        let report = outcome.report().expect("cycle completed");
        assert_eq!(report.mutations_pushed, 1);
        assert_eq!(report.messages_pushed, 1);
        assert_eq!(report.messages_withheld, 0);
        assert_eq!(
            h.store.get::<Message>("m-1").unwrap().sync_status,
            RecordStatus::Synced
        );

        let pushes = transport.pushes.lock().unwrap();
        assert_eq!(pushes[0].groups.len(), 1);
        assert_eq!(pushes[1].messages[0].group_id, "local-1");
    }

    #[tokio::test]
    async fn pull_pages_until_has_more_clears_or_limit() {
        let transport = Arc::new(ScriptedTransport::default());
        for _ in 0..3 {
            transport.pull_results.lock().unwrap().push(Ok(PullResponse {
                has_more: true,
                ..PullResponse::default()
            }));
        }
        let settings = OrchestratorSettings {
            max_pull_pages: 2,
            ..OrchestratorSettings::default()
        };
        let h = harness(transport.clone(), settings);

        let outcome = h.orchestrator.request_sync().await;
        assert_eq!(outcome.report().unwrap().pages, 2);
        assert_eq!(transport.pulls.lock().unwrap().len(), 2);

        // One scripted page left with has_more, then the default empty page.
        let outcome = h.orchestrator.request_sync().await;
        assert_eq!(outcome.report().unwrap().pages, 2);
        assert_eq!(transport.pulls.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn push_failure_still_pulls_and_releases_the_lock() {
        let transport = Arc::new(ScriptedTransport::default());
        transport.push_results.lock().unwrap().push(Err(TransportError::Status {
            status: 500,
            body: "{\"error\":\"boom\"}".to_owned(),
        }));
        let h = harness(transport.clone(), OrchestratorSettings::default());
        nickname(&h.store);

        let outcome = h.orchestrator.request_sync().await;
        assert!(matches!(
            outcome,
            CycleOutcome::Failed {
                error: SyncError::Transport(TransportError::Status { status: 500, .. }),
                ..
            }
        ));
        assert_eq!(transport.pulls.lock().unwrap().len(), 1);
        assert!(!h.orchestrator.is_running());

        let retried = h.orchestrator.request_sync().await;
        assert!(matches!(retried, CycleOutcome::Completed(_)));
    }

    /// Holds every push until released.
    #[derive(Default)]
    struct GatedTransport {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl SyncTransport for GatedTransport {
        async fn push(&self, _request: &PushRequest) -> Result<(), TransportError> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(())
        }

        async fn pull(&self, _request: &PullRequest) -> Result<PullResponse, TransportError> {
            Ok(PullResponse::default())
        }
    }

    #[tokio::test]
    async fn only_one_cycle_runs_at_a_time() {
        let transport = Arc::new(GatedTransport::default());
        let h = harness(transport.clone(), OrchestratorSettings::default());
        nickname(&h.store);

        let orchestrator = h.orchestrator.clone();
        let first = tokio::spawn(async move { orchestrator.request_sync().await });
        transport.entered.notified().await;

        let second = h.orchestrator.request_sync().await;
        assert!(matches!(second, CycleOutcome::Skipped(SkipReason::InFlight)));

        transport.release.notify_one();
        let first = first.await.unwrap();
        assert!(matches!(first, CycleOutcome::Completed(_)));
        assert!(!h.orchestrator.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn visibility_changes_are_debounced() {
        let transport = Arc::new(ScriptedTransport::default());
        let h = harness(transport.clone(), OrchestratorSettings::default());

        let handles: Vec<_> = (0..3)
            .filter_map(|_| h.orchestrator.notify_visibility(true))
            .collect();
        assert!(h.orchestrator.notify_visibility(false).is_none());

        let mut ran = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                ran += 1;
            }
        }
        assert_eq!(ran, 1);
        assert_eq!(transport.pulls.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn coming_online_triggers_a_cycle_after_settling() {
        let transport = Arc::new(ScriptedTransport::default());
        let h = harness(transport.clone(), OrchestratorSettings::default());

        assert!(h.orchestrator.set_online(false).is_none());
        assert!(h.orchestrator.set_online(false).is_none());
        let handle = h.orchestrator.set_online(true).expect("online transition");
        assert!(h.orchestrator.set_online(true).is_none());

        let outcome = handle.await.unwrap().expect("cycle should run");
        assert!(matches!(outcome, CycleOutcome::Completed(_)));
        assert_eq!(transport.pulls.lock().unwrap().len(), 1);
    }
}
