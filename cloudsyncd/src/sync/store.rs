use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use cloudsync_core::{Event, Request};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use thiserror::Error;

use super::issue::{Issue, IssueChoice, IssueLevel, IssueRecord};
use super::paths::parent_path;
use super::record::{ActionKind, ActionPayload, LaneId, RecordId, RecordState, SyncRecord};
use super::unix_now;
use super::wait::WaitCondition;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Partition-wide anchor counter.
pub const SYNC_ANCHOR_COUNTER: &str = "sync_anchor";
const LISTING_COUNTER_PREFIX: &str = "listing:";
const REFRESH_COUNTER_PREFIX: &str = "refreshed:";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("invalid action kind: {0}")]
    InvalidActionKind(String),
    #[error("{0} not found after insert")]
    MissingRow(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    Completed,
    Dropped,
}

impl TaskState {
    fn as_str(&self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Dropped => "dropped",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "queued" => Ok(TaskState::Queued),
            "running" => Ok(TaskState::Running),
            "completed" => Ok(TaskState::Completed),
            "dropped" => Ok(TaskState::Dropped),
            other => Err(StoreError::InvalidState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineTask {
    pub task_id: i64,
    pub pipeline_id: String,
    pub partition_id: String,
    pub record_id: Option<RecordId>,
    pub request_id: String,
    pub resource_key: Option<String>,
    pub request: Request,
    pub state: TaskState,
    pub event: Option<Event>,
    pub created: i64,
    pub updated: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    File,
    Dir,
}

impl ItemType {
    fn as_str(&self) -> &'static str {
        match self {
            ItemType::File => "file",
            ItemType::Dir => "dir",
        }
    }

    fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "file" => Ok(ItemType::File),
            "dir" => Ok(ItemType::Dir),
            other => Err(StoreError::InvalidState(other.to_string())),
        }
    }
}

/// One entry of a directory listing, cached or freshly retrieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemEntry {
    pub path: String,
    pub item_type: ItemType,
    pub size: Option<i64>,
    pub etag: Option<String>,
    pub file_id: Option<String>,
}

/// Changes to apply to the cached children of one directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheChanges {
    pub upserts: Vec<ItemEntry>,
    pub removals: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // Sync journal.

    pub async fn insert_record(
        &self,
        partition_id: &str,
        payload: &ActionPayload,
    ) -> Result<SyncRecord, StoreError> {
        let payload_json = serde_json::to_string(payload)?;
        let result = sqlx::query(
            "INSERT INTO sync_journal (
                partition_id, action, state, local_item_id, target_parent_id, payload, timestamp
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(partition_id)
        .bind(payload.kind().as_str())
        .bind(RecordState::Pending.as_str())
        .bind(payload.item_path())
        .bind(payload.target_parent())
        .bind(payload_json)
        .bind(unix_now())
        .execute(&self.pool)
        .await?;

        self.get_record(result.last_insert_rowid())
            .await?
            .ok_or(StoreError::MissingRow("sync record"))
    }

    pub async fn get_record(&self, record_id: RecordId) -> Result<Option<SyncRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT record_id, partition_id, action, state, lane_id, local_item_id,
                    target_parent_id, payload, wait_conditions, attempt, cancel_requested,
                    user_choice, timestamp
             FROM sync_journal WHERE record_id = ?1",
        )
        .bind(record_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(record_from_row).transpose()
    }

    pub async fn list_records(&self, partition_id: &str) -> Result<Vec<SyncRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT record_id, partition_id, action, state, lane_id, local_item_id,
                    target_parent_id, payload, wait_conditions, attempt, cancel_requested,
                    user_choice, timestamp
             FROM sync_journal WHERE partition_id = ?1
             ORDER BY record_id ASC",
        )
        .bind(partition_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(record_from_row).collect()
    }

    /// Persists every mutable column of `record`.
    pub async fn update_record(&self, record: &SyncRecord) -> Result<(), StoreError> {
        let conditions = serde_json::to_string(&record.wait_conditions)?;
        let payload = serde_json::to_string(&record.payload)?;
        sqlx::query(
            "UPDATE sync_journal SET
                state = ?2,
                lane_id = ?3,
                payload = ?4,
                wait_conditions = ?5,
                attempt = ?6,
                cancel_requested = ?7,
                user_choice = ?8
             WHERE record_id = ?1",
        )
        .bind(record.record_id)
        .bind(record.state.as_str())
        .bind(record.lane_id.map(|lane| lane as i64))
        .bind(payload)
        .bind(conditions)
        .bind(i64::from(record.attempt))
        .bind(record.cancel_requested)
        .bind(record.user_choice.map(|choice| choice.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_record(&self, record_id: RecordId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sync_journal WHERE record_id = ?1")
            .bind(record_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // Pipeline tasks.

    pub async fn insert_task(
        &self,
        pipeline_id: &str,
        partition_id: &str,
        record_id: Option<RecordId>,
        request: &Request,
    ) -> Result<PipelineTask, StoreError> {
        let now = unix_now();
        let request_json = serde_json::to_string(request)?;
        let result = sqlx::query(
            "INSERT INTO pipeline_tasks (
                pipeline_id, partition_id, record_id, request_id, resource_key,
                request, state, created, updated
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        )
        .bind(pipeline_id)
        .bind(partition_id)
        .bind(record_id)
        .bind(&request.request_id)
        .bind(&request.resource_key)
        .bind(request_json)
        .bind(TaskState::Queued.as_str())
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_task(result.last_insert_rowid())
            .await?
            .ok_or(StoreError::MissingRow("pipeline task"))
    }

    pub async fn get_task(&self, task_id: i64) -> Result<Option<PipelineTask>, StoreError> {
        let row = sqlx::query(
            "SELECT task_id, pipeline_id, partition_id, record_id, request_id, resource_key,
                    request, state, event, created, updated
             FROM pipeline_tasks WHERE task_id = ?1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(task_from_row).transpose()
    }

    pub async fn list_tasks(
        &self,
        pipeline_id: &str,
        partition_id: &str,
    ) -> Result<Vec<PipelineTask>, StoreError> {
        let rows = sqlx::query(
            "SELECT task_id, pipeline_id, partition_id, record_id, request_id, resource_key,
                    request, state, event, created, updated
             FROM pipeline_tasks
             WHERE pipeline_id = ?1 AND partition_id = ?2
             ORDER BY task_id ASC",
        )
        .bind(pipeline_id)
        .bind(partition_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    pub async fn set_task_state(
        &self,
        task_id: i64,
        state: TaskState,
        event: Option<&Event>,
    ) -> Result<(), StoreError> {
        let event_json = event.map(serde_json::to_string).transpose()?;
        sqlx::query(
            "UPDATE pipeline_tasks SET state = ?2, event = COALESCE(?3, event), updated = ?4
             WHERE task_id = ?1",
        )
        .bind(task_id)
        .bind(state.as_str())
        .bind(event_json)
        .bind(unix_now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_task(&self, task_id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pipeline_tasks WHERE task_id = ?1")
            .bind(task_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // Counters.

    /// Increments and returns the named counter, starting at 1.
    pub async fn next_counter(&self, partition_id: &str, name: &str) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "INSERT INTO counters (partition_id, name, value) VALUES (?1, ?2, 1)
             ON CONFLICT(partition_id, name) DO UPDATE SET value = value + 1
             RETURNING value",
        )
        .bind(partition_id)
        .bind(name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("value")?)
    }

    pub async fn get_counter(
        &self,
        partition_id: &str,
        name: &str,
    ) -> Result<Option<i64>, StoreError> {
        let row = sqlx::query("SELECT value FROM counters WHERE partition_id = ?1 AND name = ?2")
            .bind(partition_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| row.try_get("value"))
            .transpose()
            .map_err(StoreError::from)
    }

    pub async fn raise_counter(
        &self,
        partition_id: &str,
        name: &str,
        value: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO counters (partition_id, name, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(partition_id, name) DO UPDATE SET value = MAX(value, excluded.value)",
        )
        .bind(partition_id)
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn listing_anchor(
        &self,
        partition_id: &str,
        path: &str,
    ) -> Result<Option<i64>, StoreError> {
        self.get_counter(partition_id, &listing_counter(path)).await
    }

    /// Merged anchors of every listed path.
    pub async fn listing_anchors(
        &self,
        partition_id: &str,
    ) -> Result<HashMap<String, i64>, StoreError> {
        self.counters_by_path(partition_id, LISTING_COUNTER_PREFIX)
            .await
    }

    /// Counts one finished refresh of `path`, merged or superseded.
    pub async fn mark_refreshed(&self, partition_id: &str, path: &str) -> Result<i64, StoreError> {
        self.next_counter(partition_id, &refresh_counter(path)).await
    }

    pub async fn refresh_count(&self, partition_id: &str, path: &str) -> Result<i64, StoreError> {
        Ok(self
            .get_counter(partition_id, &refresh_counter(path))
            .await?
            .unwrap_or(0))
    }

    /// Finished refreshes of every refreshed path.
    pub async fn refresh_counts(
        &self,
        partition_id: &str,
    ) -> Result<HashMap<String, i64>, StoreError> {
        self.counters_by_path(partition_id, REFRESH_COUNTER_PREFIX)
            .await
    }

    async fn counters_by_path(
        &self,
        partition_id: &str,
        prefix: &str,
    ) -> Result<HashMap<String, i64>, StoreError> {
        let rows = sqlx::query(
            "SELECT name, value FROM counters
             WHERE partition_id = ?1 AND substr(name, 1, length(?2)) = ?2",
        )
        .bind(partition_id)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            if let Some(path) = name.strip_prefix(prefix) {
                out.insert(path.to_string(), row.try_get("value")?);
            }
        }
        Ok(out)
    }

    // Issues.

    pub async fn insert_issue(
        &self,
        partition_id: &str,
        record_id: Option<RecordId>,
        issue: &Issue,
    ) -> Result<IssueRecord, StoreError> {
        let choices: Vec<&str> = issue.choices.iter().map(IssueChoice::as_str).collect();
        let result = sqlx::query(
            "INSERT INTO issues (partition_id, record_id, level, title, description, choices, created)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(partition_id)
        .bind(record_id)
        .bind(issue.level.as_str())
        .bind(&issue.title)
        .bind(&issue.description)
        .bind(serde_json::to_string(&choices)?)
        .bind(unix_now())
        .execute(&self.pool)
        .await?;

        self.get_issue(result.last_insert_rowid())
            .await?
            .ok_or(StoreError::MissingRow("issue"))
    }

    pub async fn get_issue(&self, issue_id: i64) -> Result<Option<IssueRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT issue_id, partition_id, record_id, level, title, description, choices,
                    answer, created
             FROM issues WHERE issue_id = ?1",
        )
        .bind(issue_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(issue_from_row).transpose()
    }

    pub async fn list_issues(&self, partition_id: &str) -> Result<Vec<IssueRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT issue_id, partition_id, record_id, level, title, description, choices,
                    answer, created
             FROM issues WHERE partition_id = ?1
             ORDER BY issue_id ASC",
        )
        .bind(partition_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(issue_from_row).collect()
    }

    /// Records the first answer only; returns whether this call set it.
    pub async fn answer_issue(&self, issue_id: i64, choice: IssueChoice) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE issues SET answer = ?2 WHERE issue_id = ?1 AND answer IS NULL",
        )
        .bind(issue_id)
        .bind(choice.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn delete_issues_for_record(&self, record_id: RecordId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM issues WHERE record_id = ?1")
            .bind(record_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // Item cache.

    pub async fn list_children(
        &self,
        partition_id: &str,
        parent: &str,
    ) -> Result<Vec<ItemEntry>, StoreError> {
        let rows = sqlx::query(
            "SELECT path, item_type, size, etag, file_id FROM item_cache
             WHERE partition_id = ?1 AND parent_path = ?2
             ORDER BY path ASC",
        )
        .bind(partition_id)
        .bind(parent)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let item_type: String = row.try_get("item_type")?;
            out.push(ItemEntry {
                path: row.try_get("path")?,
                item_type: ItemType::parse(&item_type)?,
                size: row.try_get("size")?,
                etag: row.try_get("etag")?,
                file_id: row.try_get("file_id")?,
            });
        }
        Ok(out)
    }

    /// Applies `changes` to the children of `path` and records `anchor` as
    /// the path's merged anchor, atomically. Returns `false` without touching
    /// the cache when an equal or newer anchor is already merged.
    pub async fn merge_listing(
        &self,
        partition_id: &str,
        path: &str,
        anchor: i64,
        changes: &CacheChanges,
    ) -> Result<bool, StoreError> {
        let counter = listing_counter(path);
        let mut tx = self.pool.begin().await?;

        let current: Option<i64> =
            sqlx::query("SELECT value FROM counters WHERE partition_id = ?1 AND name = ?2")
                .bind(partition_id)
                .bind(&counter)
                .fetch_optional(&mut *tx)
                .await?
                .map(|row| row.try_get("value"))
                .transpose()?;
        if current.is_some_and(|current| current >= anchor) {
            tx.rollback().await?;
            return Ok(false);
        }

        for removed in &changes.removals {
            // Removing a directory drops everything cached below it. Paths
            // may contain `_` and `%`, so match the prefix literally.
            let prefix = format!("{}/", removed.trim_end_matches('/'));
            sqlx::query(
                "DELETE FROM item_cache WHERE partition_id = ?1
                 AND (path = ?2 OR substr(path, 1, length(?3)) = ?3)",
            )
            .bind(partition_id)
            .bind(removed)
            .bind(prefix)
            .execute(&mut *tx)
            .await?;
        }

        for item in &changes.upserts {
            let parent = parent_path(&item.path).unwrap_or_else(|| "/".to_string());
            sqlx::query(
                "INSERT INTO item_cache (partition_id, path, parent_path, item_type, size, etag, file_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(partition_id, path) DO UPDATE SET
                    parent_path = excluded.parent_path,
                    item_type = excluded.item_type,
                    size = excluded.size,
                    etag = excluded.etag,
                    file_id = excluded.file_id",
            )
            .bind(partition_id)
            .bind(&item.path)
            .bind(parent)
            .bind(item.item_type.as_str())
            .bind(item.size)
            .bind(&item.etag)
            .bind(&item.file_id)
            .execute(&mut *tx)
            .await?;
        }

        for name in [counter.as_str(), SYNC_ANCHOR_COUNTER] {
            sqlx::query(
                "INSERT INTO counters (partition_id, name, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(partition_id, name) DO UPDATE SET value = MAX(value, excluded.value)",
            )
            .bind(partition_id)
            .bind(name)
            .bind(anchor)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}

fn listing_counter(path: &str) -> String {
    format!("{LISTING_COUNTER_PREFIX}{path}")
}

fn refresh_counter(path: &str) -> String {
    format!("{REFRESH_COUNTER_PREFIX}{path}")
}

fn record_from_row(row: &SqliteRow) -> Result<SyncRecord, StoreError> {
    let action: String = row.try_get("action")?;
    let state: String = row.try_get("state")?;
    let payload: String = row.try_get("payload")?;
    let conditions: String = row.try_get("wait_conditions")?;
    let lane_id: Option<i64> = row.try_get("lane_id")?;
    let attempt: i64 = row.try_get("attempt")?;
    let user_choice: Option<String> = row.try_get("user_choice")?;
    let wait_conditions: Vec<WaitCondition> = serde_json::from_str(&conditions)?;

    Ok(SyncRecord {
        record_id: row.try_get("record_id")?,
        partition_id: row.try_get("partition_id")?,
        action: ActionKind::parse(&action)?,
        state: RecordState::parse(&state)?,
        lane_id: lane_id.map(|lane| lane as LaneId),
        local_item_id: row.try_get("local_item_id")?,
        target_parent_id: row.try_get("target_parent_id")?,
        payload: serde_json::from_str(&payload)?,
        wait_conditions,
        attempt: u32::try_from(attempt).unwrap_or(u32::MAX),
        cancel_requested: row.try_get("cancel_requested")?,
        user_choice: user_choice.as_deref().map(IssueChoice::parse).transpose()?,
        timestamp: row.try_get("timestamp")?,
    })
}

fn task_from_row(row: &SqliteRow) -> Result<PipelineTask, StoreError> {
    let request: String = row.try_get("request")?;
    let state: String = row.try_get("state")?;
    let event: Option<String> = row.try_get("event")?;

    Ok(PipelineTask {
        task_id: row.try_get("task_id")?,
        pipeline_id: row.try_get("pipeline_id")?,
        partition_id: row.try_get("partition_id")?,
        record_id: row.try_get("record_id")?,
        request_id: row.try_get("request_id")?,
        resource_key: row.try_get("resource_key")?,
        request: serde_json::from_str(&request)?,
        state: TaskState::parse(&state)?,
        event: event.as_deref().map(serde_json::from_str).transpose()?,
        created: row.try_get("created")?,
        updated: row.try_get("updated")?,
    })
}

fn issue_from_row(row: &SqliteRow) -> Result<IssueRecord, StoreError> {
    let level: String = row.try_get("level")?;
    let choices: String = row.try_get("choices")?;
    let answer: Option<String> = row.try_get("answer")?;
    let choices: Vec<String> = serde_json::from_str(&choices)?;

    Ok(IssueRecord {
        issue_id: row.try_get("issue_id")?,
        partition_id: row.try_get("partition_id")?,
        record_id: row.try_get("record_id")?,
        issue: Issue {
            level: IssueLevel::parse(&level)?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            choices: choices
                .iter()
                .map(|choice| IssueChoice::parse(choice))
                .collect::<Result<_, _>>()?,
        },
        answer: answer.as_deref().map(IssueChoice::parse).transpose()?,
        created: row.try_get("created")?,
    })
}

/// `$XDG_DATA_HOME/cloudsync/<partition>/sync.db`
pub fn default_db_path(partition_id: &str) -> Result<PathBuf, StoreError> {
    let base = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    Ok(base.join("cloudsync").join(partition_id).join("sync.db"))
}

/// Fresh migrated in-memory store. Every in-memory connection is its own
/// database, so the pool holds exactly one.
#[cfg(test)]
pub(crate) async fn memory_store() -> TaskStore {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = TaskStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
