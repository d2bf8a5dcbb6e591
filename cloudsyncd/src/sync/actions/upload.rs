use cloudsync_core::{CompletionProbe, Event, EventClass, Method, Request, RequestBody};

use super::{await_refresh, mismatched_payload, remote_url, stamp};
use crate::sync::issue::{Issue, IssueChoice};
use crate::sync::paths::{conflict_path, parent_path};
use crate::sync::record::{ActionPayload, SyncRecord};
use crate::sync::router::{ActionContext, ActionHandlers};

pub const HANDLERS: ActionHandlers = ActionHandlers {
    schedule,
    handle_result,
};

const CHECKSUM_HEADER: &str = "OC-Checksum";

fn schedule(record: &SyncRecord, ctx: &mut ActionContext<'_>) -> bool {
    let ActionPayload::Upload {
        local_file,
        target,
        checksum,
        expected_etag,
    } = &record.payload
    else {
        return mismatched_payload(ctx);
    };

    if !local_file.is_file() {
        return ctx.fail(format!("{} no longer exists", local_file.display()));
    }

    let mut target = target.clone();
    let mut expected_etag = expected_etag.clone();
    match record.user_choice {
        Some(IssueChoice::Overwrite) => expected_etag = None,
        Some(IssueChoice::KeepBoth) => {
            target = conflict_path(&target, stamp(ctx));
            expected_etag = None;
        }
        _ => {}
    }
    if matches!(
        record.user_choice,
        Some(IssueChoice::Overwrite | IssueChoice::KeepBoth)
    ) {
        ctx.payload_update = Some(ActionPayload::Upload {
            local_file: local_file.clone(),
            target: target.clone(),
            checksum: checksum.clone(),
            expected_etag: expected_etag.clone(),
        });
    }

    let Some(url) = remote_url(ctx, &target) else {
        return false;
    };
    let mut request = Request::new(Method::Put, url.clone())
        .body(RequestBody::File {
            path: local_file.clone(),
        })
        .resource_key(target.clone());
    if let Some(etag) = &expected_etag {
        request = request.header("If-Match", etag.clone());
    }
    if let Some(checksum) = checksum {
        let value = format!("MD5:{checksum}");
        request = request
            .header(CHECKSUM_HEADER, value.clone())
            .probe(CompletionProbe {
                url,
                header: Some(CHECKSUM_HEADER.to_ascii_lowercase()),
                expected_value: Some(value),
            });
    }
    ctx.submit(request);
    true
}

fn handle_result(record: &SyncRecord, event: &Event, ctx: &mut ActionContext<'_>) -> bool {
    if event.is_success() {
        return true;
    }
    let parent = parent_path(&record.payload.item_path()).unwrap_or_else(|| "/".to_string());
    if event.status == Some(409) {
        // WebDAV answers PUT with 409 when an intermediate folder is missing.
        ctx.issue = Some(Issue::error(
            "Upload failed: parent folder is missing",
            event.describe(),
        ));
        return false;
    }
    if event.classification() == EventClass::PreconditionFailed
        && await_refresh(record, ctx, &parent)
    {
        return false;
    }
    ctx.reject(
        "Upload failed",
        event,
        &[IssueChoice::Overwrite, IssueChoice::KeepBoth, IssueChoice::Cancel],
    )
}
