async fn open_store(db_path: &Path) -> anyhow::Result<TaskStore> {
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create database directory {parent:?}"))?;
    }
    TaskStore::open(db_path)
        .await
        .with_context(|| format!("failed to open sync database at {db_path:?}"))
}

/// The WebDAV root must end in `/` or joining item paths drops its last
/// segment.
fn parse_base_url(value: &str) -> anyhow::Result<Url> {
    let trimmed = value.trim();
    let with_slash = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    let url = Url::parse(&with_slash).with_context(|| format!("invalid base url {value:?}"))?;
    anyhow::ensure!(
        matches!(url.scheme(), "http" | "https"),
        "base url must be http or https: {value}"
    );
    Ok(url)
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64_env(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool_env(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}

/// Size and mtime of a local file, or `None` once it is gone.
async fn upload_fingerprint(sync_root: &Path, remote_path: &str) -> Option<(u64, u128)> {
    let local = crate::sync::paths::local_path_for(sync_root, remote_path).ok()?;
    let metadata = tokio::fs::metadata(&local).await.ok()?;
    if metadata.is_dir() {
        return Some((0, 0));
    }
    let modified = metadata
        .modified()
        .ok()?
        .duration_since(std::time::UNIX_EPOCH)
        .ok()?
        .as_nanos();
    Some((metadata.len(), modified))
}

/// Editors fire several modify events per save; only a changed fingerprint
/// is a new upload.
fn should_process_upload_event(
    seen: &mut HashMap<String, (u64, u128)>,
    path: &str,
    fingerprint: (u64, u128),
) -> bool {
    if seen.get(path) == Some(&fingerprint) {
        return false;
    }
    seen.insert(path.to_string(), fingerprint);
    true
}
