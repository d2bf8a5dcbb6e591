use cloudsync_core::{Event, Method, Request};

use super::{mismatched_payload, remote_url};
use crate::sync::issue::{Issue, IssueChoice};
use crate::sync::record::{ActionPayload, SyncRecord};
use crate::sync::router::{ActionContext, ActionHandlers};

pub const HANDLERS: ActionHandlers = ActionHandlers {
    schedule,
    handle_result,
};

fn schedule(record: &SyncRecord, ctx: &mut ActionContext<'_>) -> bool {
    let ActionPayload::CreateFolder { path } = &record.payload else {
        return mismatched_payload(ctx);
    };
    let Some(url) = remote_url(ctx, path) else {
        return false;
    };
    ctx.submit(Request::new(Method::Mkcol, url).resource_key(record.payload.item_path()));
    true
}

fn handle_result(_record: &SyncRecord, event: &Event, ctx: &mut ActionContext<'_>) -> bool {
    // 405: the collection already exists, which is what we wanted.
    if event.is_success() || (event.error.is_none() && event.status == Some(405)) {
        return true;
    }
    if event.status == Some(409) {
        ctx.issue = Some(Issue::error(
            "Create folder failed: parent folder is missing",
            event.describe(),
        ));
        return false;
    }
    ctx.reject("Create folder failed", event, &[IssueChoice::Retry, IssueChoice::Cancel])
}
