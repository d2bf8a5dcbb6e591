//! Directory listing refresh and merge into the item cache.
//!
//! Refreshes are deduplicated per path: while a retrieval for a path has not
//! finished, further requests for it fold into the running job and share its
//! result. A retrieved listing is merged only if its sync anchor is higher
//! than the one already merged for the path. Every finished retrieval,
//! merged or superseded, bumps the path's refresh count.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cloudsync_core::{Listing, ListingClient, ListingError, ResourceType};
use futures_util::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};

use super::paths::{normalize_remote, parent_path};
use super::store::{CacheChanges, ItemEntry, ItemType, SYNC_ANCHOR_COUNTER, StoreError, TaskStore};

const LISTING_PAGE_SIZE: u32 = 200;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ItemListError {
    #[error("listing {path} failed: {message}")]
    Listing { path: String, message: String },
    #[error("item cache error: {0}")]
    Store(String),
}

impl From<StoreError> for ItemListError {
    fn from(err: StoreError) -> Self {
        ItemListError::Store(err.to_string())
    }
}

/// Source of server-side directory listings.
pub trait DirectoryLister: Send + Sync {
    fn list<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Listing, ListingError>>;
}

impl DirectoryLister for ListingClient {
    fn list<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Listing, ListingError>> {
        Box::pin(self.list_all(path, LISTING_PAGE_SIZE))
    }
}

/// A listing as retrieved, with the anchor it is merged under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievedListing {
    pub items: Vec<ItemEntry>,
    pub sync_anchor: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemListDiff {
    pub added: Vec<ItemEntry>,
    pub removed: Vec<String>,
    pub updated: Vec<ItemEntry>,
    pub sync_anchor: i64,
}

impl ItemListDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }

    fn changes(&self) -> CacheChanges {
        CacheChanges {
            upserts: self.added.iter().chain(&self.updated).cloned().collect(),
            removals: self.removed.clone(),
        }
    }
}

/// Compares cached children with a retrieved listing by path. An entry is
/// updated when its ETag, file id or type changed.
pub fn diff(cached: &[ItemEntry], retrieved: &RetrievedListing) -> ItemListDiff {
    let known: HashMap<&str, &ItemEntry> =
        cached.iter().map(|item| (item.path.as_str(), item)).collect();
    let present: HashSet<&str> = retrieved.items.iter().map(|item| item.path.as_str()).collect();

    let mut out = ItemListDiff {
        sync_anchor: retrieved.sync_anchor,
        ..ItemListDiff::default()
    };
    for item in &retrieved.items {
        match known.get(item.path.as_str()) {
            None => out.added.push(item.clone()),
            Some(old)
                if old.etag != item.etag
                    || old.file_id != item.file_id
                    || old.item_type != item.item_type =>
            {
                out.updated.push(item.clone())
            }
            Some(_) => {}
        }
    }
    out.removed = cached
        .iter()
        .filter(|item| !present.contains(item.path.as_str()))
        .map(|item| item.path.clone())
        .collect();
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListTaskState {
    New,
    Started,
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    Waiting,
    Merged,
    /// A listing with an equal or higher anchor was merged first.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryUpdateJob {
    pub job_id: u64,
    pub path: String,
    /// Every request served by this job, the first one included.
    pub represented_job_ids: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemListTask {
    pub job: DirectoryUpdateJob,
    pub state: ListTaskState,
    pub merge: MergeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemListUpdate {
    pub job: DirectoryUpdateJob,
    pub merge: MergeStatus,
    pub diff: ItemListDiff,
}

pub type UpdateReceiver = oneshot::Receiver<Result<ItemListUpdate, ItemListError>>;

struct Running {
    task: ItemListTask,
    waiters: Vec<oneshot::Sender<Result<ItemListUpdate, ItemListError>>>,
}

#[derive(Default)]
struct ReconcilerState {
    next_job_id: u64,
    running: HashMap<String, Running>,
}

struct Inner {
    partition_id: String,
    store: TaskStore,
    lister: Arc<dyn DirectoryLister>,
    state: Mutex<ReconcilerState>,
}

#[derive(Clone)]
pub struct ItemListReconciler {
    inner: Arc<Inner>,
}

impl ItemListReconciler {
    pub fn new(
        partition_id: impl Into<String>,
        store: TaskStore,
        lister: Arc<dyn DirectoryLister>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                partition_id: partition_id.into(),
                store,
                lister,
                state: Mutex::new(ReconcilerState::default()),
            }),
        }
    }

    /// Schedules a refresh of `path`, joining one that has not finished yet.
    #[tracing::instrument(skip(self))]
    pub async fn request_update(&self, path: &str) -> (u64, UpdateReceiver) {
        let path = normalize_remote(path);
        let (sender, receiver) = oneshot::channel();
        let mut state = self.inner.state.lock().await;
        state.next_job_id += 1;
        let job_id = state.next_job_id;

        if let Some(running) = state.running.get_mut(&path) {
            running.task.job.represented_job_ids.push(job_id);
            running.waiters.push(sender);
            debug!(job_id, primary = running.task.job.job_id, "refresh folded into running job");
            return (job_id, receiver);
        }

        state.running.insert(
            path.clone(),
            Running {
                task: ItemListTask {
                    job: DirectoryUpdateJob {
                        job_id,
                        path: path.clone(),
                        represented_job_ids: vec![job_id],
                    },
                    state: ListTaskState::New,
                    merge: MergeStatus::Waiting,
                },
                waiters: vec![sender],
            },
        );
        drop(state);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.retrieve(path).await });
        (job_id, receiver)
    }

    /// The unfinished task for `path`, if any.
    pub async fn task(&self, path: &str) -> Option<ItemListTask> {
        let state = self.inner.state.lock().await;
        state
            .running
            .get(&normalize_remote(path))
            .map(|running| running.task.clone())
    }
}

impl Inner {
    async fn retrieve(&self, path: String) {
        self.set_state(&path, ListTaskState::Started).await;
        let result = self.fetch_and_merge(&path).await;

        let Some(mut running) = self.state.lock().await.running.remove(&path) else {
            return;
        };
        let outcome = match result {
            Ok((merge, diff)) => {
                running.task.state = ListTaskState::Success;
                running.task.merge = merge;
                Ok(ItemListUpdate {
                    job: running.task.job.clone(),
                    merge,
                    diff,
                })
            }
            Err(err) => {
                warn!(path = %path, error = %err, "directory refresh failed");
                running.task.state = ListTaskState::Failed;
                Err(err)
            }
        };
        debug!(task = ?running.task, waiters = running.waiters.len(), "directory refresh finished");
        for waiter in running.waiters {
            let _ = waiter.send(outcome.clone());
        }
    }

    async fn fetch_and_merge(&self, path: &str) -> Result<(MergeStatus, ItemListDiff), ItemListError> {
        // Allocated before the request so a later retrieval always ranks higher.
        let started_anchor = self
            .store
            .next_counter(&self.partition_id, SYNC_ANCHOR_COUNTER)
            .await?;
        let listing = self
            .lister
            .list(path)
            .await
            .map_err(|err| ItemListError::Listing {
                path: path.to_string(),
                message: err.to_string(),
            })?;
        let retrieved = RetrievedListing {
            items: entries_below(path, listing.items),
            sync_anchor: listing.sync_anchor.unwrap_or(started_anchor),
        };

        let cached = self.store.list_children(&self.partition_id, path).await?;
        let diff = diff(&cached, &retrieved);
        let merged = self
            .store
            .merge_listing(&self.partition_id, path, diff.sync_anchor, &diff.changes())
            .await?;
        // Waiters need to learn the path was re-read even when the anchor
        // did not move.
        self.store.mark_refreshed(&self.partition_id, path).await?;
        let merge = if merged {
            info!(
                path,
                anchor = diff.sync_anchor,
                added = diff.added.len(),
                removed = diff.removed.len(),
                updated = diff.updated.len(),
                "listing merged"
            );
            MergeStatus::Merged
        } else {
            debug!(path, anchor = diff.sync_anchor, "listing superseded");
            MergeStatus::Superseded
        };
        Ok((merge, diff))
    }

    async fn set_state(&self, path: &str, next: ListTaskState) {
        if let Some(running) = self.state.lock().await.running.get_mut(path) {
            running.task.state = next;
        }
    }
}

/// Direct children of `dir` from a listing; anything else is dropped.
fn entries_below(dir: &str, items: Vec<cloudsync_core::ListedResource>) -> Vec<ItemEntry> {
    items
        .into_iter()
        .filter_map(|item| {
            let path = normalize_remote(&item.path);
            (parent_path(&path).as_deref() == Some(dir)).then(|| ItemEntry {
                path,
                item_type: match item.resource_type {
                    ResourceType::File => ItemType::File,
                    ResourceType::Dir => ItemType::Dir,
                },
                size: item.size.and_then(|size| i64::try_from(size).ok()),
                etag: item.etag,
                file_id: item.file_id,
            })
        })
        .collect()
}
