use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::issue::IssueChoice;
use super::paths::{normalize_remote, parent_path};
use super::store::StoreError;
use super::wait::WaitCondition;

pub type RecordId = i64;
pub type LaneId = u64;
/// A normalized remote path used to detect conflicting records.
pub type Tag = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Copy,
    Move,
    CreateFolder,
    Upload,
    Download,
    Delete,
    UpdateMetadata,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Copy => "copy",
            ActionKind::Move => "move",
            ActionKind::CreateFolder => "create_folder",
            ActionKind::Upload => "upload",
            ActionKind::Download => "download",
            ActionKind::Delete => "delete",
            ActionKind::UpdateMetadata => "update_metadata",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "copy" => Ok(ActionKind::Copy),
            "move" => Ok(ActionKind::Move),
            "create_folder" => Ok(ActionKind::CreateFolder),
            "upload" => Ok(ActionKind::Upload),
            "download" => Ok(ActionKind::Download),
            "delete" => Ok(ActionKind::Delete),
            "update_metadata" => Ok(ActionKind::UpdateMetadata),
            other => Err(StoreError::InvalidActionKind(other.to_string())),
        }
    }
}

/// What a record asks the server to do. Remote paths are `/`-rooted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionPayload {
    Copy {
        source: String,
        destination: String,
        #[serde(default)]
        overwrite: bool,
    },
    Move {
        source: String,
        destination: String,
        #[serde(default)]
        overwrite: bool,
        #[serde(default)]
        expected_etag: Option<String>,
    },
    CreateFolder {
        path: String,
    },
    Upload {
        local_file: PathBuf,
        target: String,
        /// Hex MD5 of the local file, sent as `OC-Checksum`.
        #[serde(default)]
        checksum: Option<String>,
        #[serde(default)]
        expected_etag: Option<String>,
    },
    Download {
        source: String,
        local_file: PathBuf,
        #[serde(default)]
        expected_checksum: Option<String>,
    },
    Delete {
        path: String,
        #[serde(default)]
        expected_etag: Option<String>,
    },
    UpdateMetadata {
        path: String,
        properties: BTreeMap<String, String>,
    },
}

impl ActionPayload {
    pub fn kind(&self) -> ActionKind {
        match self {
            ActionPayload::Copy { .. } => ActionKind::Copy,
            ActionPayload::Move { .. } => ActionKind::Move,
            ActionPayload::CreateFolder { .. } => ActionKind::CreateFolder,
            ActionPayload::Upload { .. } => ActionKind::Upload,
            ActionPayload::Download { .. } => ActionKind::Download,
            ActionPayload::Delete { .. } => ActionKind::Delete,
            ActionPayload::UpdateMetadata { .. } => ActionKind::UpdateMetadata,
        }
    }

    /// The remote item the action is about.
    pub fn item_path(&self) -> String {
        let path = match self {
            ActionPayload::Copy { source, .. } | ActionPayload::Move { source, .. } => source,
            ActionPayload::CreateFolder { path }
            | ActionPayload::Delete { path, .. }
            | ActionPayload::UpdateMetadata { path, .. } => path,
            ActionPayload::Upload { target, .. } => target,
            ActionPayload::Download { source, .. } => source,
        };
        normalize_remote(path)
    }

    pub fn destination(&self) -> Option<String> {
        match self {
            ActionPayload::Copy { destination, .. } | ActionPayload::Move { destination, .. } => {
                Some(normalize_remote(destination))
            }
            _ => None,
        }
    }

    /// Parent directory an action creates an entry in. The root is never
    /// returned since it can be neither created nor removed.
    pub fn target_parent(&self) -> Option<String> {
        let created = match self {
            ActionPayload::Copy { .. } | ActionPayload::Move { .. } => self.destination(),
            ActionPayload::CreateFolder { .. } | ActionPayload::Upload { .. } => {
                Some(self.item_path())
            }
            _ => None,
        }?;
        parent_path(&created).filter(|parent| parent != "/")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Pending,
    Scheduled,
    Running,
    Waiting,
    Completed,
    Failed,
}

impl RecordState {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            RecordState::Pending => "pending",
            RecordState::Scheduled => "scheduled",
            RecordState::Running => "running",
            RecordState::Waiting => "waiting",
            RecordState::Completed => "completed",
            RecordState::Failed => "failed",
        }
    }

    pub(crate) fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "pending" => Ok(RecordState::Pending),
            "scheduled" => Ok(RecordState::Scheduled),
            "running" => Ok(RecordState::Running),
            "waiting" => Ok(RecordState::Waiting),
            "completed" => Ok(RecordState::Completed),
            "failed" => Ok(RecordState::Failed),
            other => Err(StoreError::InvalidState(other.to_string())),
        }
    }

    /// Work for this record is out on the network.
    pub fn is_active(&self) -> bool {
        matches!(self, RecordState::Scheduled | RecordState::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRecord {
    pub record_id: RecordId,
    pub partition_id: String,
    pub action: ActionKind,
    pub state: RecordState,
    pub lane_id: Option<LaneId>,
    pub local_item_id: Option<String>,
    pub target_parent_id: Option<String>,
    pub payload: ActionPayload,
    pub wait_conditions: Vec<WaitCondition>,
    pub attempt: u32,
    pub cancel_requested: bool,
    pub user_choice: Option<IssueChoice>,
    pub timestamp: i64,
}

impl SyncRecord {
    pub fn tags(&self) -> BTreeSet<Tag> {
        let mut tags = BTreeSet::new();
        tags.extend(self.local_item_id.clone());
        tags.extend(self.target_parent_id.clone());
        if let Some(destination) = self.payload.destination() {
            if let Some(parent) = parent_path(&destination).filter(|parent| parent != "/") {
                tags.insert(parent);
            }
            tags.insert(destination);
        }
        tags
    }

    pub fn has_unresolved_conditions(&self) -> bool {
        self.wait_conditions.iter().any(WaitCondition::is_unresolved)
    }

    /// Request ids this record still waits on.
    pub fn pending_request_ids(&self) -> Vec<String> {
        self.wait_conditions
            .iter()
            .filter(|condition| condition.is_unresolved())
            .filter_map(|condition| condition.request_id().map(str::to_string))
            .collect()
    }
}
