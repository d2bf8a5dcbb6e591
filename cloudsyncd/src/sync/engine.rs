//! Per-partition orchestrator: journal, lanes, router and pipeline.
//!
//! All mutable scheduling state sits behind one mutex, so lane assignment,
//! draining and result handling never interleave. Network I/O happens in the
//! pipeline's own tasks; the loop in [`SyncCore::run`] only reacts to their
//! completion signals, wake-ups and the poll timer.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cloudsync_core::{Event, Transport};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use url::Url;

use super::backoff::RetryPolicy;
use super::issue::{Issue, IssueChoice, IssueRecord};
use super::item_list::ItemListReconciler;
use super::lanes::{LaneScheduler, RecordStatus, SyncLane};
use super::pipeline::{DEFAULT_PIPELINE_ID, Pipeline, PipelineError, PipelineSignal};
use super::queue::{CancelOutcome, SyncQueue};
use super::record::{ActionPayload, RecordId, RecordState, SyncRecord};
use super::router::{ActionContext, ActionRegistry, Dispatch, Outcome, Router};
use super::store::{StoreError, TaskStore};
use super::unix_now_ms;
use super::wait::{ResolutionOptions, Verdict, WaitCondition, WaitConditionKind, WaitError, evaluate};

#[derive(Debug, Clone, Copy)]
pub struct CoreConfig {
    /// Lanes that may have work on the network at the same time.
    pub max_running_lanes: usize,
    pub retry: RetryPolicy,
    /// How often wait conditions are re-checked without another trigger.
    pub wait_poll_interval: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_running_lanes: 4,
            retry: RetryPolicy::default(),
            wait_poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("pipeline suspended: {0}")]
    Suspended(String),
    #[error("sync core has not been started")]
    NotStarted,
    #[error("scheduler loop is already running")]
    AlreadyRunning,
    #[error("unknown record {0}")]
    UnknownRecord(RecordId),
    #[error("unknown issue {0}")]
    UnknownIssue(i64),
    #[error("issue {0} was already answered")]
    IssueAlreadyAnswered(i64),
    #[error("issue {issue_id} does not offer {choice:?}")]
    ChoiceNotOffered { issue_id: i64, choice: IssueChoice },
}

struct CoreState {
    lanes: LaneScheduler,
    records: BTreeMap<RecordId, SyncRecord>,
    started: bool,
}

pub struct SyncCore<T> {
    partition_id: String,
    base_url: Url,
    config: CoreConfig,
    queue: SyncQueue,
    router: Router,
    pipeline: Pipeline<T>,
    signals: Mutex<Option<mpsc::UnboundedReceiver<PipelineSignal>>>,
    refresher: Option<ItemListReconciler>,
    state: Mutex<CoreState>,
    wake: Arc<Notify>,
    poll_requested: Arc<AtomicBool>,
}

impl<T: Transport> SyncCore<T> {
    pub fn new(
        partition_id: impl Into<String>,
        base_url: Url,
        store: TaskStore,
        transport: T,
        config: CoreConfig,
    ) -> Self {
        let partition_id = partition_id.into();
        let (pipeline, signals) =
            Pipeline::new(DEFAULT_PIPELINE_ID, partition_id.clone(), store.clone(), transport);
        Self {
            queue: SyncQueue::new(store, partition_id.clone()),
            router: Router::new(ActionRegistry::standard(), config.retry),
            pipeline,
            signals: Mutex::new(Some(signals)),
            refresher: None,
            state: Mutex::new(CoreState {
                lanes: LaneScheduler::new(config.max_running_lanes),
                records: BTreeMap::new(),
                started: false,
            }),
            wake: Arc::new(Notify::new()),
            poll_requested: Arc::new(AtomicBool::new(true)),
            partition_id,
            base_url,
            config,
        }
    }

    pub fn with_registry(mut self, registry: ActionRegistry) -> Self {
        self.router = Router::new(registry, self.config.retry);
        self
    }

    /// Directory refreshes requested by metadata-refresh waits go here.
    pub fn with_refresher(mut self, refresher: ItemListReconciler) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn partition_id(&self) -> &str {
        &self.partition_id
    }

    pub fn pipeline(&self) -> &Pipeline<T> {
        &self.pipeline
    }

    /// Reconciles the pipeline with the transport and restores the journal.
    /// Submissions are refused until this has run.
    #[tracing::instrument(skip(self), fields(partition = %self.partition_id))]
    pub async fn start(&self) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        if state.started {
            return Ok(());
        }
        self.pipeline.reconcile_with_live_transport().await?;

        let records = self.queue.load_active().await?;
        let tasks = self.pipeline.tasks().await;
        let next_lane = records
            .iter()
            .filter_map(|record| record.lane_id)
            .max()
            .map_or(1, |lane| lane + 1);
        state.lanes = LaneScheduler::starting_at(self.config.max_running_lanes, next_lane);

        for mut record in records {
            let known: HashSet<String> = record
                .wait_conditions
                .iter()
                .filter_map(|condition| condition.request_id().map(str::to_string))
                .collect();
            // A crash between submitting and saving the record leaves tasks
            // the record does not know about yet.
            for task in tasks
                .iter()
                .filter(|task| task.record_id == Some(record.record_id))
                .filter(|task| !known.contains(&task.request_id))
            {
                record
                    .wait_conditions
                    .push(WaitCondition::pending_request(&task.request_id, task.task_id));
                record.state = RecordState::Running;
            }
            if record.state.is_active() && record.pending_request_ids().is_empty() {
                record.state = RecordState::Pending;
            }

            let lane_id = state.lanes.assign(record.record_id, &record.tags());
            if record.state == RecordState::Failed {
                state.lanes.halt(lane_id);
            }
            self.persist(&mut state, record).await?;
        }

        state.started = true;
        info!(records = state.records.len(), "sync core started");
        self.request_poll();
        Ok(())
    }

    /// Journals a new intent and wakes the scheduler.
    #[tracing::instrument(skip(self, payload), fields(action = payload.kind().as_str()))]
    pub async fn submit_sync_action(&self, payload: ActionPayload) -> Result<RecordId, CoreError> {
        let mut state = self.state.lock().await;
        if !state.started {
            return Err(CoreError::NotStarted);
        }
        let record = self.queue.enqueue(&payload).await?;
        let record_id = record.record_id;
        let lane_id = state.lanes.assign(record_id, &record.tags());
        self.persist(&mut state, record).await?;
        info!(record_id, lane_id, path = %payload.item_path(), "sync action submitted");
        self.wake.notify_one();
        Ok(record_id)
    }

    /// Cancels a record now, or after its in-flight request completes.
    pub async fn cancel(&self, record_id: RecordId) -> Result<CancelOutcome, CoreError> {
        let mut state = self.state.lock().await;
        let Some(mut record) = state.records.get(&record_id).cloned() else {
            return Err(CoreError::UnknownRecord(record_id));
        };
        let outcome = self.queue.cancel(&mut record).await?;
        match outcome {
            CancelOutcome::Removed => {
                forget(&mut state, record_id);
                self.wake.notify_one();
            }
            CancelOutcome::Deferred => {
                state.records.insert(record_id, record);
            }
        }
        info!(record_id, ?outcome, "cancel requested");
        Ok(outcome)
    }

    /// Records the user's answer and lets the waiting record react to it.
    #[tracing::instrument(skip(self))]
    pub async fn respond_to_issue(&self, issue_id: i64, choice: IssueChoice) -> Result<(), CoreError> {
        let store = self.queue.store();
        let issue = store
            .get_issue(issue_id)
            .await?
            .ok_or(CoreError::UnknownIssue(issue_id))?;
        if issue.issue.needs_answer() && !issue.issue.choices.contains(&choice) {
            return Err(CoreError::ChoiceNotOffered { issue_id, choice });
        }
        if !store.answer_issue(issue_id, choice).await? {
            return Err(CoreError::IssueAlreadyAnswered(issue_id));
        }
        info!(issue_id, ?choice, record_id = ?issue.record_id, "issue answered");
        self.poll_wait_conditions().await?;
        self.wake.notify_one();
        Ok(())
    }

    /// Starts the head of every eligible lane.
    pub async fn schedule_pass(&self) -> Result<usize, CoreError> {
        let mut state = self.state.lock().await;
        if !state.started {
            return Ok(0);
        }
        let eligible = {
            let CoreState { lanes, records, .. } = &*state;
            lanes.eligible(|record_id| status_of(records.get(&record_id)))
        };
        if eligible.is_empty() {
            return Ok(0);
        }

        let anchors = self.queue.store().listing_anchors(&self.partition_id).await?;
        let mut started = 0;
        for record_id in eligible {
            let Some(record) = state.records.get(&record_id).cloned() else {
                continue;
            };
            let ctx = ActionContext::new(&self.base_url, unix_now_ms(), &anchors);
            let dispatch = self.router.dispatch_schedule(&record, ctx);
            self.apply(&mut state, record, dispatch, None).await?;
            started += 1;
        }
        Ok(started)
    }

    /// Routes one pipeline signal to its record.
    pub async fn handle_signal(&self, signal: PipelineSignal) -> Result<(), CoreError> {
        let (task_id, record_id, request_id, event) = match signal {
            PipelineSignal::Completed {
                task_id,
                record_id,
                request_id,
                event,
            } => (task_id, record_id, request_id, event),
            PipelineSignal::Suspended { reason } => return Err(CoreError::Suspended(reason)),
        };

        let mut state = self.state.lock().await;
        let record = record_id.and_then(|id| state.records.get(&id).cloned());
        match record {
            Some(record) => self.deliver(&mut state, record, &request_id, &event).await?,
            None => debug!(task_id, request_id = %request_id, "event for a record that is gone"),
        }
        self.pipeline.acknowledge(task_id).await?;
        drop(state);

        self.request_poll();
        Ok(())
    }

    /// Re-checks every blocked record against current state.
    pub async fn poll_wait_conditions(&self) -> Result<(), CoreError> {
        let mut state = self.state.lock().await;
        if !state.started {
            return Ok(());
        }
        let store = self.queue.store();
        let options = ResolutionOptions {
            now: unix_now_ms(),
            tracked_requests: self.pipeline.tracked_request_ids().await,
            issue_answers: store
                .list_issues(&self.partition_id)
                .await?
                .into_iter()
                .filter_map(|issue| issue.answer.map(|answer| (issue.issue_id, answer)))
                .collect(),
            path_anchors: store.listing_anchors(&self.partition_id).await?,
            path_refreshes: store.refresh_counts(&self.partition_id).await?,
        };

        let blocked: Vec<RecordId> = state
            .records
            .values()
            .filter(|record| record.has_unresolved_conditions())
            .map(|record| record.record_id)
            .collect();
        for record_id in blocked {
            let Some(mut record) = state.records.get(&record_id).cloned() else {
                continue;
            };
            let before = record.wait_conditions.clone();
            match evaluate(&mut record.wait_conditions, &options) {
                Verdict::Blocked => {
                    if record.wait_conditions != before {
                        self.persist(&mut state, record).await?;
                    }
                }
                Verdict::Failed(WaitError::Cancelled) => {
                    info!(record_id, "record cancelled from its issue");
                    self.remove(&mut state, record_id).await?;
                }
                Verdict::Failed(error) => {
                    let issue = Issue::error(
                        format!("{} failed", record.action.as_str()),
                        format!("{}: {error}", record.payload.item_path()),
                    );
                    self.fail(&mut state, record, issue).await?;
                }
                Verdict::Clear if record.state == RecordState::Failed => {
                    let answer = answer_for(&record, &options.issue_answers);
                    self.resume(&mut state, record, answer).await?;
                }
                Verdict::Clear if record.state == RecordState::Waiting => {
                    prune(&mut record.wait_conditions, None);
                    record.state = RecordState::Pending;
                    debug!(record_id, "wait conditions cleared");
                    self.persist(&mut state, record).await?;
                }
                Verdict::Clear => {
                    self.persist(&mut state, record).await?;
                }
            }
        }
        drop(state);
        self.wake.notify_one();
        Ok(())
    }

    /// Drives the partition until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), CoreError>
    where
        F: Future<Output = ()>,
    {
        let mut signals = self
            .signals
            .lock()
            .await
            .take()
            .ok_or(CoreError::AlreadyRunning)?;
        let mut ticker = tokio::time::interval(self.config.wait_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        info!(partition = %self.partition_id, "scheduler loop running");

        loop {
            if self.poll_requested.swap(false, Ordering::SeqCst) {
                self.poll_wait_conditions().await?;
            }
            self.schedule_pass().await?;

            tokio::select! {
                _ = &mut shutdown => break,
                signal = signals.recv() => match signal {
                    Some(signal) => self.handle_signal(signal).await?,
                    None => break,
                },
                _ = self.wake.notified() => {}
                _ = ticker.tick() => self.poll_requested.store(true, Ordering::SeqCst),
            }
        }

        *self.signals.lock().await = Some(signals);
        info!(partition = %self.partition_id, "scheduler loop stopped");
        Ok(())
    }

    pub async fn records(&self) -> Vec<SyncRecord> {
        self.state.lock().await.records.values().cloned().collect()
    }

    pub async fn lanes(&self) -> Vec<SyncLane> {
        self.state.lock().await.lanes.lanes().cloned().collect()
    }

    pub async fn issues(&self) -> Result<Vec<IssueRecord>, CoreError> {
        Ok(self.queue.store().list_issues(&self.partition_id).await?)
    }

    fn request_poll(&self) {
        self.poll_requested.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    async fn deliver(
        &self,
        state: &mut CoreState,
        mut record: SyncRecord,
        request_id: &str,
        event: &Event,
    ) -> Result<(), CoreError> {
        let record_id = record.record_id;
        let Some(condition) = record
            .wait_conditions
            .iter_mut()
            .find(|condition| condition.is_unresolved() && condition.request_id() == Some(request_id))
        else {
            debug!(record_id, request_id, "event already handled");
            return Ok(());
        };
        condition.resolve();

        if record.cancel_requested {
            if record.pending_request_ids().is_empty() {
                info!(record_id, "deferred cancel applied");
                return self.remove(state, record_id).await;
            }
            return self.persist(state, record).await;
        }

        let anchors = self.queue.store().listing_anchors(&self.partition_id).await?;
        let ctx = ActionContext::new(&self.base_url, unix_now_ms(), &anchors);
        let dispatch = self.router.dispatch_result(&record, event, ctx);
        self.apply(state, record, dispatch, Some(request_id)).await
    }

    /// Carries out a router decision. `handled` is the request whose event
    /// produced it; its condition stays until the task is acknowledged.
    async fn apply(
        &self,
        state: &mut CoreState,
        mut record: SyncRecord,
        dispatch: Dispatch,
        handled: Option<&str>,
    ) -> Result<(), CoreError> {
        let record_id = record.record_id;
        for notice in &dispatch.notices {
            self.queue
                .store()
                .insert_issue(&self.partition_id, None, notice)
                .await?;
        }
        if let Some(payload) = dispatch.payload_update {
            record.payload = payload;
            record.user_choice = None;
        }

        match dispatch.outcome {
            Outcome::Resolved if record.pending_request_ids().is_empty() => {
                info!(record_id, action = record.action.as_str(), "record completed");
                self.remove(state, record_id).await
            }
            Outcome::Resolved => {
                record.state = RecordState::Running;
                self.persist(state, record).await
            }
            Outcome::Submitted(requests) => {
                prune(&mut record.wait_conditions, handled);
                for request in requests {
                    let request_id = request.request_id.clone();
                    let task_id = self.pipeline.submit(request, Some(record_id)).await?;
                    debug!(record_id, task_id, request_id = %request_id, "request submitted");
                    record
                        .wait_conditions
                        .push(WaitCondition::pending_request(request_id, task_id));
                }
                record.state = RecordState::Running;
                self.persist(state, record).await
            }
            Outcome::Retry { at, attempt } => {
                prune(&mut record.wait_conditions, handled);
                record.attempt = attempt;
                record.wait_conditions.push(WaitCondition::backoff(at));
                record.state = RecordState::Waiting;
                info!(record_id, attempt, retry_in_ms = at - unix_now_ms(), "retry scheduled");
                self.persist(state, record).await
            }
            Outcome::Waiting(mut conditions) => {
                prune(&mut record.wait_conditions, handled);
                for condition in &mut conditions {
                    if let WaitConditionKind::MetadataRefresh {
                        path, min_refresh, ..
                    } = &mut condition.kind
                    {
                        if self.refresher.is_some() {
                            let done = self
                                .queue
                                .store()
                                .refresh_count(&self.partition_id, path)
                                .await?;
                            *min_refresh = done + 1;
                        }
                        self.refresh(path).await;
                    }
                }
                record.wait_conditions.extend(conditions);
                record.state = RecordState::Waiting;
                debug!(record_id, "record waiting");
                self.persist(state, record).await
            }
            Outcome::Failed(issue) => self.fail(state, record, issue).await,
        }
    }

    async fn fail(
        &self,
        state: &mut CoreState,
        mut record: SyncRecord,
        issue: Issue,
    ) -> Result<(), CoreError> {
        let record_id = record.record_id;
        if record.cancel_requested {
            return self.remove(state, record_id).await;
        }
        let issue = if issue.needs_answer() {
            issue
        } else {
            issue.with_choices(&[IssueChoice::Retry, IssueChoice::Cancel])
        };
        let stored = self
            .queue
            .store()
            .insert_issue(&self.partition_id, Some(record_id), &issue)
            .await?;
        warn!(record_id, issue_id = stored.issue_id, title = %issue.title, "record failed");

        record.state = RecordState::Failed;
        record.wait_conditions = vec![WaitCondition::user_interaction(stored.issue_id)];
        if let Some(lane_id) = state.lanes.lane_of(record_id) {
            state.lanes.halt(lane_id);
        }
        self.persist(state, record).await
    }

    async fn resume(
        &self,
        state: &mut CoreState,
        mut record: SyncRecord,
        answer: Option<IssueChoice>,
    ) -> Result<(), CoreError> {
        record.wait_conditions.clear();
        record.state = RecordState::Pending;
        record.attempt = 0;
        record.user_choice = answer.filter(|choice| *choice != IssueChoice::Retry);
        if let Some(lane_id) = state.lanes.lane_of(record.record_id) {
            state.lanes.resume(lane_id);
        }
        info!(record_id = record.record_id, choice = ?answer, "failed record resumed");
        self.persist(state, record).await
    }

    async fn remove(&self, state: &mut CoreState, record_id: RecordId) -> Result<(), CoreError> {
        self.queue.remove(record_id).await?;
        forget(state, record_id);
        self.wake.notify_one();
        Ok(())
    }

    async fn persist(&self, state: &mut CoreState, mut record: SyncRecord) -> Result<(), CoreError> {
        record.lane_id = state.lanes.lane_of(record.record_id);
        self.queue.update(&record).await?;
        state.records.insert(record.record_id, record);
        Ok(())
    }

    async fn refresh(&self, path: &str) {
        let Some(refresher) = &self.refresher else {
            debug!(path, "no directory refresher configured");
            return;
        };
        let (job_id, done) = refresher.request_update(path).await;
        let wake = Arc::clone(&self.wake);
        let poll_requested = Arc::clone(&self.poll_requested);
        tokio::spawn(async move {
            if let Ok(Err(err)) = done.await {
                warn!(job_id, error = %err, "refresh for a waiting record failed");
            }
            poll_requested.store(true, Ordering::SeqCst);
            wake.notify_one();
        });
    }
}

/// Drops a record from memory. Its lane resumes unless another failed
/// record still holds it.
fn forget(state: &mut CoreState, record_id: RecordId) {
    state.records.remove(&record_id);
    let Some(lane_id) = state.lanes.remove_record(record_id) else {
        return;
    };
    let still_failed = state.lanes.lane(lane_id).is_some_and(|lane| {
        lane.records.iter().any(|id| {
            state
                .records
                .get(id)
                .is_some_and(|record| record.state == RecordState::Failed)
        })
    });
    if !still_failed {
        state.lanes.resume(lane_id);
    }
}

fn status_of(record: Option<&SyncRecord>) -> RecordStatus {
    match record {
        Some(record) if record.state.is_active() => RecordStatus::Busy,
        Some(record)
            if record.state == RecordState::Pending && !record.has_unresolved_conditions() =>
        {
            RecordStatus::Ready
        }
        _ => RecordStatus::Blocked,
    }
}

/// Drops finished backoffs and answered requests. Finished listing refreshes
/// stay so a repeated precondition failure turns into an issue.
fn prune(conditions: &mut Vec<WaitCondition>, keep_request: Option<&str>) {
    conditions.retain(|condition| {
        if condition.is_unresolved() {
            return true;
        }
        match &condition.kind {
            WaitConditionKind::MetadataRefresh { .. } => true,
            WaitConditionKind::PendingRequest { request_id, .. } => {
                keep_request == Some(request_id.as_str())
            }
            WaitConditionKind::Backoff { .. } | WaitConditionKind::PendingUserInteraction { .. } => {
                false
            }
        }
    });
}

fn answer_for(record: &SyncRecord, answers: &HashMap<i64, IssueChoice>) -> Option<IssueChoice> {
    record
        .wait_conditions
        .iter()
        .find_map(|condition| match condition.kind {
            WaitConditionKind::PendingUserInteraction { issue_id } => answers.get(&issue_id).copied(),
            _ => None,
        })
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
