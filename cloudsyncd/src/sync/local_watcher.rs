use std::path::Path;

use notify::event::{CreateKind, ModifyKind};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::debug;

use super::paths::{local_path_for, remote_path_for};
use super::record::ActionPayload;

/// A change under the sync root, already in remote path form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Upload { path: String },
    Mkdir { path: String },
    Delete { path: String },
    Move { from: String, to: String },
}

pub fn start_notify_watcher(
    root: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<LocalEvent>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let root = root.to_path_buf();
    let watch_root = root.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
        if let Ok(event) = res {
            for local in map_event(&watch_root, event) {
                let _ = tx.send(local);
            }
        }
    })?;
    watcher.watch(root.as_path(), RecursiveMode::Recursive)?;
    Ok((watcher, rx))
}

fn map_event(root: &Path, event: Event) -> Vec<LocalEvent> {
    match event.kind {
        EventKind::Modify(ModifyKind::Name(_)) => {
            if event.paths.len() >= 2
                && let (Some(from), Some(to)) = (
                    to_remote_path(root, &event.paths[0]),
                    to_remote_path(root, &event.paths[1]),
                )
            {
                return vec![LocalEvent::Move { from, to }];
            }
            Vec::new()
        }
        EventKind::Create(CreateKind::Folder) => event
            .paths
            .into_iter()
            .filter_map(|path| to_remote_path(root, &path))
            .map(|path| LocalEvent::Mkdir { path })
            .collect(),
        EventKind::Create(_) | EventKind::Modify(_) => event
            .paths
            .into_iter()
            .filter_map(|path| to_remote_path(root, &path))
            .map(|path| LocalEvent::Upload { path })
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .into_iter()
            .filter_map(|path| to_remote_path(root, &path))
            .map(|path| LocalEvent::Delete { path })
            .collect(),
        _ => Vec::new(),
    }
}

fn to_remote_path(root: &Path, path: &Path) -> Option<String> {
    remote_path_for(root, path)
        .ok()
        .filter(|remote| remote != "/")
}

/// Turns a local event into the sync action that mirrors it.
///
/// Uploads are resolved against the file system at call time: a directory
/// becomes a folder creation, a vanished file yields `None`.
pub async fn payload_for(sync_root: &Path, event: LocalEvent) -> std::io::Result<Option<ActionPayload>> {
    let payload = match event {
        LocalEvent::Mkdir { path } => ActionPayload::CreateFolder { path },
        LocalEvent::Delete { path } => ActionPayload::Delete {
            path,
            expected_etag: None,
        },
        LocalEvent::Move { from, to } => ActionPayload::Move {
            source: from,
            destination: to,
            overwrite: false,
            expected_etag: None,
        },
        LocalEvent::Upload { path } => {
            let Ok(local_file) = local_path_for(sync_root, &path) else {
                return Ok(None);
            };
            let metadata = match tokio::fs::metadata(&local_file).await {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path, "file vanished before it could be queued");
                    return Ok(None);
                }
                Err(err) => return Err(err),
            };
            if metadata.is_dir() {
                ActionPayload::CreateFolder { path }
            } else {
                let checksum = file_md5(&local_file).await?;
                ActionPayload::Upload {
                    local_file,
                    target: path,
                    checksum: Some(checksum),
                    expected_etag: None,
                }
            }
        }
    };
    Ok(Some(payload))
}

async fn file_md5(path: &Path) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        context.consume(&buf[..read]);
    }
    Ok(format!("{:x}", context.compute()))
}
