//! Durable HTTP pipeline.
//!
//! Every request is written to the task store as `queued`, flipped to
//! `running` before the transport sees it, and stored as `completed` with
//! its event before anyone is told. After a crash the store therefore knows
//! about every request that may have reached the server, and
//! [`Pipeline::reconcile_with_live_transport`] decides per task whether to
//! re-attach, re-send, probe or re-deliver.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cloudsync_core::{Event, FailureKind, Request, Transport};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use super::record::RecordId;
use super::store::{PipelineTask, StoreError, TaskState, TaskStore};

pub const DEFAULT_PIPELINE_ID: &str = "sync";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("pipeline has not been reconciled with the transport yet")]
    NotReconciled,
    #[error("pipeline is suspended after a storage failure")]
    Suspended,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineSignal {
    Completed {
        task_id: i64,
        record_id: Option<RecordId>,
        request_id: String,
        event: Event,
    },
    /// The task store failed; nothing more is accepted for this partition.
    Suspended { reason: String },
}

#[derive(Default)]
struct PipelineState {
    tasks: HashMap<i64, PipelineTask>,
    busy_keys: HashSet<String>,
    in_flight: HashSet<i64>,
    delivered: HashSet<i64>,
    reconciled: bool,
    suspended: bool,
}

enum Exchange {
    Perform(Request),
    Reattach(Request),
    Recover(Request),
}

struct Inner<T> {
    pipeline_id: String,
    partition_id: String,
    store: TaskStore,
    transport: T,
    signals: mpsc::UnboundedSender<PipelineSignal>,
    state: Mutex<PipelineState>,
}

pub struct Pipeline<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Pipeline<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Pipeline<T> {
    pub fn new(
        pipeline_id: impl Into<String>,
        partition_id: impl Into<String>,
        store: TaskStore,
        transport: T,
    ) -> (Self, mpsc::UnboundedReceiver<PipelineSignal>) {
        let (signals, receiver) = mpsc::unbounded_channel();
        let inner = Inner {
            pipeline_id: pipeline_id.into(),
            partition_id: partition_id.into(),
            store,
            transport,
            signals,
            state: Mutex::new(PipelineState::default()),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Persists `request` and starts it unless its resource is busy.
    #[tracing::instrument(skip(self, request), fields(request_id = %request.request_id))]
    pub async fn submit(
        &self,
        request: Request,
        record_id: Option<RecordId>,
    ) -> Result<i64, PipelineError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.suspended {
            return Err(PipelineError::Suspended);
        }
        if !state.reconciled {
            return Err(PipelineError::NotReconciled);
        }

        let task = match inner
            .store
            .insert_task(&inner.pipeline_id, &inner.partition_id, record_id, &request)
            .await
        {
            Ok(task) => task,
            Err(err) => return Err(inner.suspend(&mut state, err)),
        };
        let task_id = task.task_id;
        state.tasks.insert(task_id, task);
        if let Err(err) = inner.start(&mut state, task_id).await {
            return Err(inner.suspend(&mut state, err));
        }
        debug!(task_id, "task submitted");
        Ok(task_id)
    }

    /// Removes a task whose event has been consumed.
    pub async fn acknowledge(&self, task_id: i64) -> Result<(), PipelineError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if let Err(err) = inner.store.delete_task(task_id).await {
            return Err(inner.suspend(&mut state, err));
        }
        state.tasks.remove(&task_id);
        state.delivered.remove(&task_id);
        Ok(())
    }

    /// Drops a task that has not started yet. Returns `false` when it is
    /// already running or done.
    pub async fn cancel_queued(&self, task_id: i64) -> Result<bool, PipelineError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        let queued = state
            .tasks
            .get(&task_id)
            .is_some_and(|task| task.state == TaskState::Queued && !state.in_flight.contains(&task_id));
        if !queued {
            return Ok(false);
        }
        let dropped = async {
            inner
                .store
                .set_task_state(task_id, TaskState::Dropped, None)
                .await?;
            inner.store.delete_task(task_id).await
        };
        if let Err(err) = dropped.await {
            return Err(inner.suspend(&mut state, err));
        }
        state.tasks.remove(&task_id);
        debug!(task_id, "queued task dropped");
        Ok(true)
    }

    /// Brings stored tasks back in line with the transport after a start.
    /// Must run once before `submit`; later calls do nothing.
    #[tracing::instrument(skip(self), fields(partition = %self.inner.partition_id))]
    pub async fn reconcile_with_live_transport(&self) -> Result<(), PipelineError> {
        let inner = &self.inner;
        let mut state = inner.state.lock().await;
        if state.reconciled {
            return Ok(());
        }
        if state.suspended {
            return Err(PipelineError::Suspended);
        }

        let tasks = match inner
            .store
            .list_tasks(&inner.pipeline_id, &inner.partition_id)
            .await
        {
            Ok(tasks) => tasks,
            Err(err) => return Err(inner.suspend(&mut state, err)),
        };
        let live: HashSet<String> = inner.transport.live_request_ids().await.into_iter().collect();

        let mut queued = Vec::new();
        for task in tasks {
            let task_id = task.task_id;
            match (task.state, task.event.clone()) {
                (TaskState::Dropped, _) => {
                    if let Err(err) = inner.store.delete_task(task_id).await {
                        return Err(inner.suspend(&mut state, err));
                    }
                }
                (TaskState::Completed, Some(event)) => {
                    let (record_id, request_id) = (task.record_id, task.request_id.clone());
                    state.tasks.insert(task_id, task);
                    inner.publish(&mut state, task_id, record_id, request_id, event);
                }
                (TaskState::Running, _) => {
                    let request = task.request.clone();
                    let exchange = if live.contains(&task.request_id) {
                        Exchange::Reattach(request)
                    } else if request.idempotent {
                        Exchange::Perform(request)
                    } else {
                        Exchange::Recover(request)
                    };
                    if let Some(key) = &task.resource_key {
                        state.busy_keys.insert(key.clone());
                    }
                    state.in_flight.insert(task_id);
                    state.tasks.insert(task_id, task);
                    info!(task_id, "resuming interrupted task");
                    inner.spawn_exchange(task_id, exchange);
                }
                (TaskState::Queued, _) | (TaskState::Completed, None) => {
                    let mut task = task;
                    task.state = TaskState::Queued;
                    state.tasks.insert(task_id, task);
                    queued.push(task_id);
                }
            }
        }

        for task_id in queued {
            if let Err(err) = inner.start(&mut state, task_id).await {
                return Err(inner.suspend(&mut state, err));
            }
        }
        state.reconciled = true;
        info!(tasks = state.tasks.len(), "pipeline reconciled");
        Ok(())
    }

    /// Request ids of every task still held, in any state.
    pub async fn tracked_request_ids(&self) -> HashSet<String> {
        let state = self.inner.state.lock().await;
        state
            .tasks
            .values()
            .map(|task| task.request_id.clone())
            .collect()
    }

    pub async fn task(&self, task_id: i64) -> Option<PipelineTask> {
        self.inner.state.lock().await.tasks.get(&task_id).cloned()
    }

    pub async fn tasks(&self) -> Vec<PipelineTask> {
        let state = self.inner.state.lock().await;
        let mut tasks: Vec<_> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|task| task.task_id);
        tasks
    }

    pub async fn is_suspended(&self) -> bool {
        self.inner.state.lock().await.suspended
    }
}

impl<T: Transport> Inner<T> {
    async fn start(self: &Arc<Self>, state: &mut PipelineState, task_id: i64) -> Result<(), StoreError> {
        let Some(task) = state.tasks.get(&task_id) else {
            return Ok(());
        };
        if task.state != TaskState::Queued || state.in_flight.contains(&task_id) {
            return Ok(());
        }
        if let Some(key) = &task.resource_key
            && state.busy_keys.contains(key)
        {
            debug!(task_id, resource_key = %key, "task deferred behind busy resource");
            return Ok(());
        }
        let request = task.request.clone();
        let key = task.resource_key.clone();

        self.store
            .set_task_state(task_id, TaskState::Running, None)
            .await?;
        if let Some(task) = state.tasks.get_mut(&task_id) {
            task.state = TaskState::Running;
        }
        if let Some(key) = key {
            state.busy_keys.insert(key);
        }
        state.in_flight.insert(task_id);
        self.spawn_exchange(task_id, Exchange::Perform(request));
        Ok(())
    }

    fn spawn_exchange(self: &Arc<Self>, task_id: i64, exchange: Exchange) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let event = match exchange {
                Exchange::Perform(request) => inner.transport.perform(request).await,
                Exchange::Reattach(request) => inner.reattach(request).await,
                Exchange::Recover(request) => inner.recover(request).await,
            };
            inner.finish(task_id, event).await;
        });
    }

    async fn finish(self: &Arc<Self>, task_id: i64, event: Event) {
        let mut state = self.state.lock().await;
        state.in_flight.remove(&task_id);
        if let Err(err) = self
            .store
            .set_task_state(task_id, TaskState::Completed, Some(&event))
            .await
        {
            self.suspend(&mut state, err);
            return;
        }
        let Some(task) = state.tasks.get_mut(&task_id) else {
            return;
        };
        task.state = TaskState::Completed;
        task.event = Some(event.clone());
        let (record_id, request_id, key) =
            (task.record_id, task.request_id.clone(), task.resource_key.clone());
        if let Some(key) = &key {
            state.busy_keys.remove(key);
        }
        debug!(task_id, request_id = %request_id, status = ?event.status, "task completed");
        self.publish(&mut state, task_id, record_id, request_id, event);

        if let Some(key) = key {
            let next = state
                .tasks
                .values()
                .filter(|task| {
                    task.state == TaskState::Queued && task.resource_key.as_deref() == Some(key.as_str())
                })
                .map(|task| task.task_id)
                .min();
            if let Some(next) = next
                && let Err(err) = self.start(&mut state, next).await
            {
                self.suspend(&mut state, err);
            }
        }
    }

    async fn reattach(&self, request: Request) -> Event {
        if let Some(event) = self.transport.await_live(request.request_id.clone()).await {
            return event;
        }
        if request.idempotent {
            self.transport.perform(request).await
        } else {
            self.recover(request).await
        }
    }

    /// Decides whether a lost non-idempotent request was applied.
    async fn recover(&self, request: Request) -> Event {
        let (Some(probe), Some(probe_request)) = (request.probe.clone(), request.probe_request())
        else {
            return ambiguous(&request, "no completion probe for a non-idempotent request");
        };
        let answer = self.transport.perform(probe_request).await;

        if answer.is_success() {
            let matches = match (&probe.header, &probe.expected_value) {
                (Some(header), Some(expected)) => answer.header(header) == Some(expected.as_str()),
                (Some(header), None) => answer.header(header).is_some(),
                (None, _) => true,
            };
            if !matches {
                return ambiguous(&request, "target exists but does not match the request");
            }
            info!(request_id = %request.request_id, "lost request was applied");
            let mut event = Event::response(&request.request_id, answer.status.unwrap_or(200));
            event.headers = answer.headers;
            event.recovered = true;
            return event;
        }
        if answer.error.is_none() && answer.status == Some(404) {
            info!(request_id = %request.request_id, "lost request never applied, resubmitting");
            return self.transport.perform(request).await;
        }
        ambiguous(&request, &answer.describe())
    }

    fn publish(
        &self,
        state: &mut PipelineState,
        task_id: i64,
        record_id: Option<RecordId>,
        request_id: String,
        event: Event,
    ) {
        if !state.delivered.insert(task_id) {
            return;
        }
        let signal = PipelineSignal::Completed {
            task_id,
            record_id,
            request_id,
            event,
        };
        if self.signals.send(signal).is_err() {
            debug!(task_id, "no listener for pipeline signals");
        }
    }

    fn suspend(&self, state: &mut PipelineState, err: StoreError) -> PipelineError {
        state.suspended = true;
        error!(partition = %self.partition_id, error = %err, "task store failed, suspending pipeline");
        let _ = self.signals.send(PipelineSignal::Suspended {
            reason: err.to_string(),
        });
        PipelineError::Store(err)
    }
}

fn ambiguous(request: &Request, reason: &str) -> Event {
    warn!(request_id = %request.request_id, reason, "cannot tell whether lost request was applied");
    Event::failure(&request.request_id, FailureKind::RecoveryAmbiguous, reason)
}

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;
