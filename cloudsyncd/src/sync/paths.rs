use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("remote path contains unsupported component")]
    UnsupportedComponent,
    #[error("local path {0} is outside the sync root")]
    OutsideRoot(PathBuf),
}

pub fn local_path_for(sync_root: &Path, remote_path: &str) -> Result<PathBuf, PathError> {
    if remote_path.is_empty() {
        return Err(PathError::Empty);
    }

    // Remote paths are POSIX-like ("/Docs/A.txt"); map them under sync_root.
    let mut out = sync_root.to_path_buf();
    for component in Path::new(remote_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir => continue,
            Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

pub fn remote_path_for(sync_root: &Path, local: &Path) -> Result<String, PathError> {
    let relative = local
        .strip_prefix(sync_root)
        .map_err(|_| PathError::OutsideRoot(local.to_path_buf()))?;
    let remote = PathBuf::from("/").join(relative);
    Ok(normalize_remote(&remote.to_string_lossy().replace('\\', "/")))
}

/// Canonical remote form: leading slash, no trailing slash, no empty parts.
pub fn normalize_remote(path: &str) -> String {
    let parts: Vec<&str> = path
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect();
    format!("/{}", parts.join("/"))
}

pub fn parent_path(path: &str) -> Option<String> {
    let normalized = normalize_remote(path);
    if normalized == "/" {
        return None;
    }
    match normalized.rsplit_once('/') {
        Some(("", _)) => Some("/".to_string()),
        Some((parent, _)) => Some(parent.to_string()),
        None => None,
    }
}

pub fn file_name(path: &str) -> String {
    let normalized = normalize_remote(path);
    normalized
        .rsplit('/')
        .next()
        .unwrap_or(normalized.as_str())
        .to_string()
}

/// True when `ancestor` names a directory strictly above `path`.
pub fn is_ancestor(ancestor: &str, path: &str) -> bool {
    let ancestor = normalize_remote(ancestor);
    let path = normalize_remote(path);
    if ancestor == path {
        return false;
    }
    if ancestor == "/" {
        return true;
    }
    path.strip_prefix(ancestor.as_str())
        .is_some_and(|rest| rest.starts_with('/'))
}

/// `Docs/A.txt` -> `Docs/A (conflict 1700000000).txt`
pub fn conflict_path(path: &str, stamp: i64) -> String {
    let normalized = normalize_remote(path);
    let (dir, name) = match normalized.rsplit_once('/') {
        Some((dir, name)) => (format!("{dir}/"), name),
        None => (String::new(), normalized.as_str()),
    };

    if let Some((stem, ext)) = name.rsplit_once('.')
        && !stem.is_empty()
    {
        return format!("{dir}{stem} (conflict {stamp}).{ext}");
    }

    format!("{dir}{name} (conflict {stamp})")
}
