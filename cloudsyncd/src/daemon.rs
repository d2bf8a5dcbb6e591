use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cloudsync_core::{
    DEFAULT_MAX_CONCURRENT_REQUESTS, HttpTransport, ListingClient, TransportConfig,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};
use url::Url;

use crate::sync::backoff::RetryPolicy;
use crate::sync::engine::{CoreConfig, SyncCore};
use crate::sync::issue::{IssueChoice, IssueRecord};
use crate::sync::item_list::ItemListReconciler;
use crate::sync::local_watcher::{LocalEvent, payload_for, start_notify_watcher};
use crate::sync::pipeline::DEFAULT_PIPELINE_ID;
use crate::sync::record::SyncRecord;
use crate::sync::store::{TaskStore, default_db_path};

const DEFAULT_SYNC_DIR_NAME: &str = "CloudSync";
const DEFAULT_PARTITION: &str = "default";
const DEFAULT_MAX_LANES: u64 = 4;
const DEFAULT_MAX_RETRIES: u64 = 5;
const DEFAULT_BACKOFF_BASE_MS: u64 = 500;
const DEFAULT_BACKOFF_MAX_MS: u64 = 60_000;
const DEFAULT_WAIT_POLL_MS: u64 = 1_000;

#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub base_url: Url,
    pub token: Option<String>,
    pub partition_id: String,
    pub sync_root: PathBuf,
    pub db_path: PathBuf,
    pub core: CoreConfig,
    pub request_concurrency: usize,
    pub enable_local_watcher: bool,
}

impl DaemonConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let base_url = std::env::var("CLOUDSYNC_BASE_URL").context("CLOUDSYNC_BASE_URL is not set")?;
        let base_url = parse_base_url(&base_url)?;
        let token = std::env::var("CLOUDSYNC_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty());
        let sync_root = std::env::var("CLOUDSYNC_SYNC_DIR")
            .ok()
            .map(|value| expand_with_home(&value, &home))
            .unwrap_or_else(|| home.join(DEFAULT_SYNC_DIR_NAME));
        let location = StoreLocation::from_env()?;

        let core = CoreConfig {
            max_running_lanes: read_u64_env("CLOUDSYNC_MAX_LANES", DEFAULT_MAX_LANES) as usize,
            retry: RetryPolicy::new(
                Duration::from_millis(read_u64_env(
                    "CLOUDSYNC_BACKOFF_BASE_MS",
                    DEFAULT_BACKOFF_BASE_MS,
                )),
                Duration::from_millis(read_u64_env("CLOUDSYNC_BACKOFF_MAX_MS", DEFAULT_BACKOFF_MAX_MS)),
                read_u64_env("CLOUDSYNC_MAX_RETRIES", DEFAULT_MAX_RETRIES) as u32,
            ),
            wait_poll_interval: Duration::from_millis(read_u64_env(
                "CLOUDSYNC_WAIT_POLL_MS",
                DEFAULT_WAIT_POLL_MS,
            )),
        };
        let request_concurrency = read_u64_env(
            "CLOUDSYNC_REQUEST_CONCURRENCY",
            DEFAULT_MAX_CONCURRENT_REQUESTS as u64,
        ) as usize;
        let enable_local_watcher = read_bool_env("CLOUDSYNC_ENABLE_LOCAL_WATCHER", true);

        Ok(Self {
            base_url,
            token,
            partition_id: location.partition_id,
            sync_root,
            db_path: location.db_path,
            core,
            request_concurrency,
            enable_local_watcher,
        })
    }
}

/// Where a partition keeps its database. Enough to inspect the journal
/// without a server configured.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreLocation {
    pub partition_id: String,
    pub db_path: PathBuf,
}

impl StoreLocation {
    pub fn from_env() -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("home directory is unavailable")?;
        let partition_id = std::env::var("CLOUDSYNC_PARTITION")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PARTITION.to_string());
        let db_path = match std::env::var("CLOUDSYNC_DB_PATH") {
            Ok(value) => expand_with_home(&value, &home),
            Err(_) => default_db_path(&partition_id).context("failed to resolve database path")?,
        };
        Ok(Self {
            partition_id,
            db_path,
        })
    }
}

pub struct DaemonRuntime {
    config: DaemonConfig,
    store: TaskStore,
    core: Arc<SyncCore<HttpTransport>>,
}

impl DaemonRuntime {
    pub async fn bootstrap(config: DaemonConfig) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&config.sync_root)
            .await
            .with_context(|| format!("failed to create sync root at {:?}", config.sync_root))?;
        let store = open_store(&config.db_path).await?;

        let transport = HttpTransport::with_config(
            config.token.clone(),
            TransportConfig {
                max_concurrent_requests: config.request_concurrency,
            },
        );
        let lister = ListingClient::with_base_url(config.base_url.as_str(), config.token.clone())
            .context("invalid listing endpoint")?;
        let refresher =
            ItemListReconciler::new(config.partition_id.clone(), store.clone(), Arc::new(lister));
        let core = SyncCore::new(
            config.partition_id.clone(),
            config.base_url.clone(),
            store.clone(),
            transport,
            config.core,
        )
        .with_refresher(refresher);
        core.start()
            .await
            .context("failed to restore the sync journal")?;

        Ok(Self {
            config,
            store,
            core: Arc::new(core),
        })
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            partition = %self.config.partition_id,
            sync_root = %self.config.sync_root.display(),
            base_url = %self.config.base_url,
            local_watcher = self.config.enable_local_watcher,
            "daemon started"
        );

        let (watcher, local_rx): (
            Option<notify::RecommendedWatcher>,
            Option<mpsc::UnboundedReceiver<LocalEvent>>,
        ) = if self.config.enable_local_watcher {
            match start_notify_watcher(&self.config.sync_root) {
                Ok((watcher, rx)) => (Some(watcher), Some(rx)),
                Err(err) => {
                    warn!(error = %err, "failed to start local watcher");
                    (None, None)
                }
            }
        } else {
            (None, None)
        };

        let local_handle = local_rx.map(|mut rx| {
            let core = Arc::clone(&self.core);
            let sync_root = self.config.sync_root.clone();
            tokio::spawn(async move {
                let mut seen_uploads: HashMap<String, (u64, u128)> = HashMap::new();
                while let Some(event) = rx.recv().await {
                    match &event {
                        LocalEvent::Upload { path } => {
                            let Some(fp) = upload_fingerprint(&sync_root, path).await else {
                                continue;
                            };
                            if !should_process_upload_event(&mut seen_uploads, path, fp) {
                                continue;
                            }
                        }
                        LocalEvent::Delete { path } => {
                            seen_uploads.remove(path);
                        }
                        LocalEvent::Move { from, to } => {
                            if let Some(fp) = seen_uploads.remove(from) {
                                seen_uploads.insert(to.clone(), fp);
                            }
                        }
                        LocalEvent::Mkdir { .. } => {}
                    }
                    debug!(?event, "local event");
                    let payload = match payload_for(&sync_root, event).await {
                        Ok(Some(payload)) => payload,
                        Ok(None) => continue,
                        Err(err) => {
                            warn!(error = %err, "failed to inspect local change");
                            continue;
                        }
                    };
                    if let Err(err) = core.submit_sync_action(payload).await {
                        warn!(error = %err, "failed to queue local change");
                    }
                }
            })
        });

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let scheduler_core = Arc::clone(&self.core);
        let mut scheduler = tokio::spawn(async move {
            scheduler_core
                .run(async {
                    let _ = stop_rx.await;
                })
                .await
        });

        let stopped_early = tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("failed waiting for shutdown signal")?;
                None
            }
            res = &mut scheduler => Some(res),
        };
        let result = match stopped_early {
            Some(result) => result,
            None => {
                info!("shutdown requested");
                let _ = stop_tx.send(());
                scheduler.await
            }
        };

        drop(watcher);
        if let Some(handle) = local_handle {
            handle.abort();
        }
        result
            .context("scheduler task panicked")?
            .context("scheduler loop failed")?;
        self.store.close().await;
        info!("daemon stopped");
        Ok(())
    }
}

/// Journal and issue counts for one partition, read straight from its
/// database.
#[derive(Debug, Clone)]
pub struct StatusReport {
    pub partition_id: String,
    pub records: Vec<SyncRecord>,
    pub issues: Vec<IssueRecord>,
    pub pipeline_tasks: usize,
}

impl StatusReport {
    pub async fn load(location: &StoreLocation) -> anyhow::Result<Self> {
        let store = open_store(&location.db_path).await?;
        let partition_id = location.partition_id.clone();
        let records = store
            .list_records(&partition_id)
            .await
            .context("failed to read sync journal")?;
        let issues = store
            .list_issues(&partition_id)
            .await
            .context("failed to read issues")?;
        let pipeline_tasks = store
            .list_tasks(DEFAULT_PIPELINE_ID, &partition_id)
            .await
            .context("failed to read pipeline tasks")?
            .len();
        store.close().await;
        Ok(Self {
            partition_id,
            records,
            issues,
            pipeline_tasks,
        })
    }

    pub fn render(&self) -> String {
        let open_issues = self.issues.iter().filter(|issue| issue.answer.is_none()).count();
        let mut out = format!(
            "partition {}: {} queued, {} open issues, {} pipeline tasks\n",
            self.partition_id,
            self.records.len(),
            open_issues,
            self.pipeline_tasks
        );
        for record in &self.records {
            let _ = writeln!(
                out,
                "  #{} {} {} [{}]{}",
                record.record_id,
                record.action.as_str(),
                record.payload.item_path(),
                record.state.as_str(),
                record
                    .lane_id
                    .map(|lane| format!(" lane {lane}"))
                    .unwrap_or_default()
            );
        }
        for issue in &self.issues {
            let choices: Vec<String> = issue
                .issue
                .choices
                .iter()
                .map(|choice| format!("{choice:?}").to_lowercase())
                .collect();
            let _ = writeln!(
                out,
                "  issue {} ({}) {}: {}{}",
                issue.issue_id,
                issue.issue.level.as_str(),
                issue.issue.title,
                issue.issue.description,
                if choices.is_empty() {
                    String::new()
                } else {
                    format!(" [{}]", choices.join("/"))
                }
            );
        }
        out
    }
}

/// Answers an open issue from outside the running daemon. The daemon picks
/// the answer up on its next wait poll.
pub async fn answer_issue(
    location: &StoreLocation,
    issue_id: i64,
    choice: &str,
) -> anyhow::Result<IssueRecord> {
    let choice = IssueChoice::parse(choice.trim()).map_err(|_| {
        anyhow::anyhow!("unknown choice {choice:?}, expected one of retry/cancel/overwrite/keep_both")
    })?;
    let store = open_store(&location.db_path).await?;
    let result = record_answer(&store, &location.partition_id, issue_id, choice).await;
    store.close().await;
    result
}

async fn record_answer(
    store: &TaskStore,
    partition_id: &str,
    issue_id: i64,
    choice: IssueChoice,
) -> anyhow::Result<IssueRecord> {
    let mut issue = store
        .get_issue(issue_id)
        .await
        .context("failed to read issue")?
        .with_context(|| format!("no issue {issue_id}"))?;
    anyhow::ensure!(
        issue.partition_id == partition_id,
        "issue {issue_id} belongs to partition {}",
        issue.partition_id
    );
    anyhow::ensure!(
        !issue.issue.needs_answer() || issue.issue.choices.contains(&choice),
        "issue {issue_id} does not offer {}",
        choice.as_str()
    );
    let answered = store
        .answer_issue(issue_id, choice)
        .await
        .context("failed to store answer")?;
    anyhow::ensure!(answered, "issue {issue_id} is already answered");
    info!(issue_id, ?choice, "issue answered");
    issue.answer = Some(choice);
    Ok(issue)
}

include!("daemon_helpers.rs");

#[cfg(test)]
#[path = "daemon_tests.rs"]
mod tests;
