//! Static action registry and the outcome mapping around it.
//!
//! Handlers are plain functions that only describe what should happen by
//! filling an [`ActionContext`]. The [`Router`] is the single place that turns
//! that description into an [`Outcome`], including when a lane must halt.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use cloudsync_core::{Event, EventClass, Request};
use tracing::{debug, warn};
use url::Url;

use super::actions;
use super::backoff::RetryPolicy;
use super::issue::{Issue, IssueChoice};
use super::record::{ActionKind, ActionPayload, SyncRecord};
use super::wait::WaitCondition;

pub type ScheduleFn = fn(&SyncRecord, &mut ActionContext<'_>) -> bool;
pub type ResultFn = fn(&SyncRecord, &Event, &mut ActionContext<'_>) -> bool;

#[derive(Clone, Copy)]
pub struct ActionHandlers {
    pub schedule: ScheduleFn,
    pub handle_result: ResultFn,
}

/// Scratch space a handler fills in; read back by the router.
#[derive(Debug)]
pub struct ActionContext<'a> {
    pub base_url: &'a Url,
    /// Unix milliseconds.
    pub now: i64,
    /// Merged listing anchors per path.
    pub path_anchors: &'a HashMap<String, i64>,
    requests: Vec<Request>,
    pub error: Option<String>,
    pub issue: Option<Issue>,
    pub retry: bool,
    pub retry_after: Option<Duration>,
    pub wait_conditions: Vec<WaitCondition>,
    pub notices: Vec<Issue>,
    pub payload_update: Option<ActionPayload>,
}

impl<'a> ActionContext<'a> {
    pub fn new(base_url: &'a Url, now: i64, path_anchors: &'a HashMap<String, i64>) -> Self {
        Self {
            base_url,
            now,
            path_anchors,
            requests: Vec::new(),
            error: None,
            issue: None,
            retry: false,
            retry_after: None,
            wait_conditions: Vec::new(),
            notices: Vec::new(),
            payload_update: None,
        }
    }

    pub fn submit(&mut self, request: Request) {
        self.requests.push(request);
    }

    pub fn take_requests(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.requests)
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        self.error = Some(error.into());
        false
    }

    /// Maps an unsuccessful event onto retry or an issue.
    pub fn reject(&mut self, title: &str, event: &Event, conflict_choices: &[IssueChoice]) -> bool {
        let description = event.describe();
        match event.classification() {
            EventClass::Success => return true,
            EventClass::RateLimit | EventClass::Transient => {
                self.retry = true;
                self.retry_after = event.retry_after_secs().map(Duration::from_secs);
            }
            EventClass::Conflict | EventClass::PreconditionFailed => {
                self.issue = Some(
                    Issue::error(format!("{title}: conflicting change on the server"), description.clone())
                        .with_choices(conflict_choices),
                );
            }
            EventClass::Quota => {
                self.issue = Some(Issue::error(
                    format!("{title}: not enough space"),
                    description.clone(),
                ));
            }
            EventClass::Auth => {
                self.issue = Some(Issue::error(
                    format!("{title}: permission denied"),
                    description.clone(),
                ));
            }
            EventClass::Ambiguous => {
                self.issue = Some(Issue::error(
                    format!("{title}: outcome unknown after restart"),
                    description.clone(),
                ));
            }
            EventClass::NotFound | EventClass::Permanent => {
                self.issue = Some(Issue::error(title.to_string(), description.clone()));
            }
        }
        self.error = Some(description);
        false
    }
}

pub struct ActionRegistry {
    handlers: HashMap<ActionKind, ActionHandlers>,
}

impl ActionRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(ActionKind::Upload, actions::upload::HANDLERS);
        registry.register(ActionKind::Download, actions::download::HANDLERS);
        registry.register(ActionKind::CreateFolder, actions::create_folder::HANDLERS);
        registry.register(ActionKind::Delete, actions::delete::HANDLERS);
        registry.register(ActionKind::Move, actions::transfer::MOVE_HANDLERS);
        registry.register(ActionKind::Copy, actions::transfer::COPY_HANDLERS);
        registry.register(ActionKind::UpdateMetadata, actions::metadata::HANDLERS);
        registry
    }

    pub fn register(&mut self, kind: ActionKind, handlers: ActionHandlers) {
        self.handlers.insert(kind, handlers);
    }

    pub fn get(&self, kind: ActionKind) -> Option<ActionHandlers> {
        self.handlers.get(&kind).copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Resolved,
    Submitted(Vec<Request>),
    /// Retry at unix milliseconds `at`; `attempt` is the new attempt count.
    Retry { at: i64, attempt: u32 },
    Waiting(Vec<WaitCondition>),
    Failed(Issue),
}

impl Outcome {
    pub fn halts_lane(&self) -> bool {
        matches!(self, Outcome::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    pub outcome: Outcome,
    pub notices: Vec<Issue>,
    pub payload_update: Option<ActionPayload>,
}

pub struct Router {
    registry: ActionRegistry,
    retry: RetryPolicy,
}

impl Router {
    pub fn new(registry: ActionRegistry, retry: RetryPolicy) -> Self {
        Self { registry, retry }
    }

    pub fn dispatch_schedule(&self, record: &SyncRecord, mut ctx: ActionContext<'_>) -> Dispatch {
        let Some(handlers) = self.registry.get(record.action) else {
            return missing_handler(record);
        };
        let accepted = catch_unwind(AssertUnwindSafe(|| (handlers.schedule)(record, &mut ctx)));
        let outcome = match accepted {
            Err(_) => Outcome::Failed(handler_panicked(record)),
            Ok(true) if ctx.requests.is_empty() => Outcome::Resolved,
            Ok(true) => Outcome::Submitted(ctx.take_requests()),
            Ok(false) if !ctx.wait_conditions.is_empty() => {
                Outcome::Waiting(std::mem::take(&mut ctx.wait_conditions))
            }
            Ok(false) => Outcome::Failed(ctx.issue.take().unwrap_or_else(|| {
                Issue::error(
                    format!("Could not start {}", record.action.as_str()),
                    ctx.error.clone().unwrap_or_default(),
                )
            })),
        };
        debug!(record_id = record.record_id, ?outcome, "schedule dispatched");
        Dispatch {
            outcome,
            notices: ctx.notices,
            payload_update: ctx.payload_update,
        }
    }

    pub fn dispatch_result(
        &self,
        record: &SyncRecord,
        event: &Event,
        mut ctx: ActionContext<'_>,
    ) -> Dispatch {
        let Some(handlers) = self.registry.get(record.action) else {
            return missing_handler(record);
        };
        let resolved = catch_unwind(AssertUnwindSafe(|| {
            (handlers.handle_result)(record, event, &mut ctx)
        }));
        let outcome = match resolved {
            Err(_) => Outcome::Failed(handler_panicked(record)),
            Ok(true) if ctx.requests.is_empty() => Outcome::Resolved,
            Ok(true) => Outcome::Submitted(ctx.take_requests()),
            Ok(false) if ctx.retry => self.retry_outcome(record, &ctx),
            Ok(false) if !ctx.wait_conditions.is_empty() => {
                Outcome::Waiting(std::mem::take(&mut ctx.wait_conditions))
            }
            Ok(false) if !ctx.requests.is_empty() => {
                Outcome::Submitted(ctx.take_requests())
            }
            Ok(false) => Outcome::Failed(ctx.issue.take().unwrap_or_else(|| {
                Issue::error(
                    format!("{} failed", record.action.as_str()),
                    ctx.error.clone().unwrap_or_else(|| event.describe()),
                )
            })),
        };
        debug!(
            record_id = record.record_id,
            request_id = %event.request_id,
            ?outcome,
            "result dispatched"
        );
        Dispatch {
            outcome,
            notices: ctx.notices,
            payload_update: ctx.payload_update,
        }
    }

    fn retry_outcome(&self, record: &SyncRecord, ctx: &ActionContext<'_>) -> Outcome {
        let attempt = record.attempt.saturating_add(1);
        match self.retry.next_delay(attempt, ctx.retry_after) {
            Some(delay) => Outcome::Retry {
                at: ctx.now + i64::try_from(delay.as_millis()).unwrap_or(i64::MAX / 2),
                attempt,
            },
            None => {
                warn!(record_id = record.record_id, attempt, "retry budget exhausted");
                Outcome::Failed(Issue::error(
                    format!(
                        "{} failed after {} attempts",
                        record.action.as_str(),
                        attempt
                    ),
                    ctx.error.clone().unwrap_or_default(),
                ))
            }
        }
    }
}

fn missing_handler(record: &SyncRecord) -> Dispatch {
    Dispatch {
        outcome: Outcome::Failed(Issue::error(
            "Unsupported action",
            format!("no handler registered for {}", record.action.as_str()),
        )),
        notices: Vec::new(),
        payload_update: None,
    }
}

fn handler_panicked(record: &SyncRecord) -> Issue {
    warn!(record_id = record.record_id, "action handler panicked");
    Issue::error(
        format!("{} failed", record.action.as_str()),
        "internal error while handling the action",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::record::{ActionPayload, RecordState};
    use cloudsync_core::FailureKind;

    fn record(attempt: u32) -> SyncRecord {
        let payload = ActionPayload::CreateFolder {
            path: "/Docs".into(),
        };
        SyncRecord {
            record_id: 1,
            partition_id: "p".into(),
            action: payload.kind(),
            state: RecordState::Running,
            lane_id: Some(1),
            local_item_id: Some("/Docs".into()),
            target_parent_id: None,
            payload,
            wait_conditions: Vec::new(),
            attempt,
            cancel_requested: false,
            user_choice: None,
            timestamp: 0,
        }
    }

    fn router(max_attempts: u32) -> Router {
        Router::new(
            ActionRegistry::standard(),
            RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(40), max_attempts),
        )
    }

    fn base() -> Url {
        Url::parse("https://dav.example/files/").unwrap()
    }

    #[test]
    fn schedule_produces_a_request() {
        let base = base();
        let anchors = HashMap::new();
        let dispatch = router(3).dispatch_schedule(&record(0), ActionContext::new(&base, 0, &anchors));
        let Outcome::Submitted(requests) = dispatch.outcome else {
            panic!("expected submission");
        };
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url.as_str(), "https://dav.example/files/Docs");
    }

    #[test]
    fn transient_failures_retry_until_budget_is_spent() {
        let base = base();
        let anchors = HashMap::new();
        let event = Event::failure("r", FailureKind::Connection, "reset");

        let dispatch =
            router(2).dispatch_result(&record(0), &event, ActionContext::new(&base, 1_000, &anchors));
        let Outcome::Retry { at, attempt } = dispatch.outcome else {
            panic!("expected retry");
        };
        assert_eq!(attempt, 1);
        assert!((1_005..=1_010).contains(&at));

        let dispatch =
            router(2).dispatch_result(&record(2), &event, ActionContext::new(&base, 1_000, &anchors));
        assert!(dispatch.outcome.halts_lane());
    }

    #[test]
    fn retry_after_is_honored() {
        let base = base();
        let anchors = HashMap::new();
        let event = Event::response("r", 429).with_header("Retry-After", "3");
        let dispatch =
            router(3).dispatch_result(&record(0), &event, ActionContext::new(&base, 0, &anchors));
        assert_eq!(dispatch.outcome, Outcome::Retry { at: 3_000, attempt: 1 });
    }

    #[test]
    fn permission_errors_become_issues() {
        let base = base();
        let anchors = HashMap::new();
        let event = Event::response("r", 403);
        let dispatch =
            router(3).dispatch_result(&record(0), &event, ActionContext::new(&base, 0, &anchors));
        let Outcome::Failed(issue) = dispatch.outcome else {
            panic!("expected failure");
        };
        assert!(issue.title.contains("permission denied"));
        assert!(issue.needs_answer());
    }

    #[test]
    fn panicking_handler_is_contained() {
        fn explode(_: &SyncRecord, _: &Event, _: &mut ActionContext<'_>) -> bool {
            panic!("boom");
        }
        let mut registry = ActionRegistry::standard();
        registry.register(
            ActionKind::CreateFolder,
            ActionHandlers {
                schedule: actions::create_folder::HANDLERS.schedule,
                handle_result: explode,
            },
        );
        let router = Router::new(registry, RetryPolicy::default());
        let base = base();
        let anchors = HashMap::new();
        let dispatch = router.dispatch_result(
            &record(0),
            &Event::response("r", 201),
            ActionContext::new(&base, 0, &anchors),
        );
        assert!(matches!(dispatch.outcome, Outcome::Failed(_)));
    }

    #[test]
    fn missing_handler_fails_the_record() {
        let router = Router::new(ActionRegistry::empty(), RetryPolicy::default());
        let base = base();
        let anchors = HashMap::new();
        let dispatch = router.dispatch_schedule(&record(0), ActionContext::new(&base, 0, &anchors));
        assert!(dispatch.outcome.halts_lane());
    }
}
