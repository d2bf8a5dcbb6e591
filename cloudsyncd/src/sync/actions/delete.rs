use cloudsync_core::{Event, EventClass, Method, Request};

use super::{await_refresh, mismatched_payload, remote_url};
use crate::sync::issue::IssueChoice;
use crate::sync::paths::parent_path;
use crate::sync::record::{ActionPayload, SyncRecord};
use crate::sync::router::{ActionContext, ActionHandlers};

pub const HANDLERS: ActionHandlers = ActionHandlers {
    schedule,
    handle_result,
};

fn schedule(record: &SyncRecord, ctx: &mut ActionContext<'_>) -> bool {
    let ActionPayload::Delete {
        path,
        expected_etag,
    } = &record.payload
    else {
        return mismatched_payload(ctx);
    };

    if record.user_choice == Some(IssueChoice::Overwrite) && expected_etag.is_some() {
        ctx.payload_update = Some(ActionPayload::Delete {
            path: path.clone(),
            expected_etag: None,
        });
    }
    let Some(url) = remote_url(ctx, path) else {
        return false;
    };
    let mut request = Request::new(Method::Delete, url).resource_key(record.payload.item_path());
    if let Some(etag) = expected_etag
        && record.user_choice != Some(IssueChoice::Overwrite)
    {
        request = request.header("If-Match", etag.clone());
    }
    ctx.submit(request);
    true
}

fn handle_result(record: &SyncRecord, event: &Event, ctx: &mut ActionContext<'_>) -> bool {
    match event.classification() {
        EventClass::Success | EventClass::NotFound => true,
        EventClass::PreconditionFailed => {
            let parent =
                parent_path(&record.payload.item_path()).unwrap_or_else(|| "/".to_string());
            if await_refresh(record, ctx, &parent) {
                return false;
            }
            ctx.reject(
                "Delete failed",
                event,
                &[IssueChoice::Overwrite, IssueChoice::Cancel],
            )
        }
        _ => ctx.reject("Delete failed", event, &[IssueChoice::Cancel]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::actions::test_support::{base, no_anchors, record};

    #[test]
    fn already_deleted_is_resolved() {
        let base = base();
        let anchors = no_anchors();
        let record = record(ActionPayload::Delete {
            path: "/Docs/A.txt".into(),
            expected_etag: None,
        });
        let mut ctx = ActionContext::new(&base, 0, &anchors);
        assert!(handle_result(&record, &Event::response("r", 404), &mut ctx));
    }

    #[test]
    fn overwrite_choice_drops_the_precondition() {
        let base = base();
        let anchors = no_anchors();
        let mut record = record(ActionPayload::Delete {
            path: "/Docs/A.txt".into(),
            expected_etag: Some("\"e\"".into()),
        });
        record.user_choice = Some(IssueChoice::Overwrite);
        let mut ctx = ActionContext::new(&base, 0, &anchors);

        assert!(schedule(&record, &mut ctx));
        let request = ctx.take_requests().pop().unwrap();
        assert!(request.headers.get("if-match").is_none());
        assert!(request.idempotent);
        assert!(matches!(
            ctx.payload_update,
            Some(ActionPayload::Delete {
                expected_etag: None,
                ..
            })
        ));
    }
}
