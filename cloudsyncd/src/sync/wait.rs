//! Wait conditions: named, polled preconditions that keep a record from
//! being scheduled.
//!
//! Each condition moves `unresolved -> resolved | resolved-with-error` once
//! and never back. A record resumes only when every condition is resolved
//! without error; the first error terminates the record.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::issue::IssueChoice;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum WaitError {
    #[error("wait condition expired")]
    Timeout,
    #[error("cancelled by the user")]
    Cancelled,
    #[error("pipeline no longer tracks request {0}")]
    RequestDropped(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WaitConditionKind {
    PendingRequest { request_id: String, task_id: i64 },
    PendingUserInteraction { issue_id: i64 },
    /// Resolves once `path` has a merged anchor of at least
    /// `min_sync_anchor`, or once it has finished `min_refresh` refreshes
    /// when that is set. A refresh that finds an unchanged server still
    /// counts.
    MetadataRefresh {
        path: String,
        min_sync_anchor: i64,
        #[serde(default)]
        min_refresh: i64,
    },
    Backoff { until: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ResolutionState {
    Unresolved,
    Resolved,
    ResolvedWithError { error: WaitError },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitCondition {
    pub kind: WaitConditionKind,
    pub resolution: ResolutionState,
    /// Unix milliseconds after which the condition resolves with a timeout.
    #[serde(default)]
    pub expiration: Option<i64>,
}

/// Snapshot of everything conditions may be resolved against.
#[derive(Debug, Clone, Default)]
pub struct ResolutionOptions {
    /// Unix milliseconds.
    pub now: i64,
    /// Request ids the pipeline still tracks in any state.
    pub tracked_requests: HashSet<String>,
    pub issue_answers: HashMap<i64, IssueChoice>,
    /// Highest merged sync anchor per listed path.
    pub path_anchors: HashMap<String, i64>,
    /// Finished refreshes per path.
    pub path_refreshes: HashMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub resolved: bool,
    pub error: Option<WaitError>,
}

impl WaitCondition {
    pub fn new(kind: WaitConditionKind) -> Self {
        Self {
            kind,
            resolution: ResolutionState::Unresolved,
            expiration: None,
        }
    }

    pub fn pending_request(request_id: impl Into<String>, task_id: i64) -> Self {
        Self::new(WaitConditionKind::PendingRequest {
            request_id: request_id.into(),
            task_id,
        })
    }

    /// Waits for an issue answer. Never expires.
    pub fn user_interaction(issue_id: i64) -> Self {
        Self::new(WaitConditionKind::PendingUserInteraction { issue_id })
    }

    pub fn metadata_refresh(path: impl Into<String>, min_sync_anchor: i64, expiration: i64) -> Self {
        Self::new(WaitConditionKind::MetadataRefresh {
            path: path.into(),
            min_sync_anchor,
            min_refresh: 0,
        })
        .expires_at(expiration)
    }

    pub fn backoff(until: i64) -> Self {
        Self::new(WaitConditionKind::Backoff { until })
    }

    pub fn expires_at(mut self, expiration: i64) -> Self {
        self.expiration = Some(expiration);
        self
    }

    pub fn is_unresolved(&self) -> bool {
        self.resolution == ResolutionState::Unresolved
    }

    pub fn resolve(&mut self) {
        if self.is_unresolved() {
            self.resolution = ResolutionState::Resolved;
        }
    }

    pub fn resolve_with_error(&mut self, error: WaitError) {
        if self.is_unresolved() {
            self.resolution = ResolutionState::ResolvedWithError { error };
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        match &self.kind {
            WaitConditionKind::PendingRequest { request_id, .. } => Some(request_id),
            _ => None,
        }
    }

    pub fn try_resolution(&mut self, options: &ResolutionOptions) -> Resolution {
        if self.is_unresolved() {
            self.poll(options);
        }
        match &self.resolution {
            ResolutionState::Unresolved => Resolution {
                resolved: false,
                error: None,
            },
            ResolutionState::Resolved => Resolution {
                resolved: true,
                error: None,
            },
            ResolutionState::ResolvedWithError { error } => Resolution {
                resolved: true,
                error: Some(error.clone()),
            },
        }
    }

    fn poll(&mut self, options: &ResolutionOptions) {
        match &self.kind {
            WaitConditionKind::PendingRequest { request_id, .. } => {
                // Completion is delivered as an event; polling only notices
                // a request that disappeared without one.
                if !options.tracked_requests.contains(request_id) {
                    let error = WaitError::RequestDropped(request_id.clone());
                    self.resolve_with_error(error);
                    return;
                }
            }
            WaitConditionKind::PendingUserInteraction { issue_id } => {
                match options.issue_answers.get(issue_id) {
                    Some(IssueChoice::Cancel) => self.resolve_with_error(WaitError::Cancelled),
                    Some(_) => self.resolve(),
                    None => {}
                }
                return;
            }
            WaitConditionKind::MetadataRefresh {
                path,
                min_sync_anchor,
                min_refresh,
            } => {
                let anchored = options
                    .path_anchors
                    .get(path)
                    .is_some_and(|anchor| anchor >= min_sync_anchor);
                let refreshed = *min_refresh > 0
                    && options
                        .path_refreshes
                        .get(path)
                        .is_some_and(|count| count >= min_refresh);
                if anchored || refreshed {
                    self.resolve();
                    return;
                }
            }
            WaitConditionKind::Backoff { until } => {
                if options.now >= *until {
                    self.resolve();
                    return;
                }
            }
        }
        if self.expiration.is_some_and(|expiration| options.now >= expiration) {
            self.resolve_with_error(WaitError::Timeout);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Clear,
    Blocked,
    Failed(WaitError),
}

/// Polls every unresolved condition and folds the results.
pub fn evaluate(conditions: &mut [WaitCondition], options: &ResolutionOptions) -> Verdict {
    let mut blocked = false;
    for condition in conditions.iter_mut() {
        let resolution = condition.try_resolution(options);
        if let Some(error) = resolution.error {
            return Verdict::Failed(error);
        }
        if !resolution.resolved {
            blocked = true;
        }
    }
    if blocked { Verdict::Blocked } else { Verdict::Clear }
}
