//! WebDAV request mapping for every action kind.

pub mod create_folder;
pub mod delete;
pub mod download;
pub mod metadata;
pub mod transfer;
pub mod upload;

use cloudsync_core::join_remote_path;
use url::Url;

use super::record::SyncRecord;
use super::router::ActionContext;
use super::wait::{WaitCondition, WaitConditionKind};

/// How long a record waits for a directory listing before giving up.
pub const REFRESH_TIMEOUT_MS: i64 = 60_000;

fn remote_url(ctx: &mut ActionContext<'_>, path: &str) -> Option<Url> {
    match join_remote_path(ctx.base_url, path) {
        Ok(url) => Some(url),
        Err(err) => {
            ctx.fail(format!("cannot address {path}: {err}"));
            None
        }
    }
}

/// Asks for a fresh listing of `dir` the first time the server rejects a
/// precondition, so the conflict is raised against current state. Returns
/// `false` once the record has already waited for one.
fn await_refresh(record: &SyncRecord, ctx: &mut ActionContext<'_>, dir: &str) -> bool {
    let refreshed = record
        .wait_conditions
        .iter()
        .any(|condition| matches!(condition.kind, WaitConditionKind::MetadataRefresh { .. }));
    if refreshed {
        return false;
    }
    let anchor = ctx.path_anchors.get(dir).copied().unwrap_or(0);
    ctx.wait_conditions.push(WaitCondition::metadata_refresh(
        dir,
        anchor + 1,
        ctx.now + REFRESH_TIMEOUT_MS,
    ));
    true
}

fn mismatched_payload(ctx: &mut ActionContext<'_>) -> bool {
    ctx.fail("payload does not match the action kind")
}

/// Seconds for user-visible conflict names.
fn stamp(ctx: &ActionContext<'_>) -> i64 {
    ctx.now / 1000
}
