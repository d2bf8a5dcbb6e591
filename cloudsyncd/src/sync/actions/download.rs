use cloudsync_core::{DownloadTarget, Event, Method, Request};

use super::{mismatched_payload, remote_url};
use crate::sync::issue::IssueChoice;
use crate::sync::record::{ActionPayload, SyncRecord};
use crate::sync::router::{ActionContext, ActionHandlers};

pub const HANDLERS: ActionHandlers = ActionHandlers {
    schedule,
    handle_result,
};

fn schedule(record: &SyncRecord, ctx: &mut ActionContext<'_>) -> bool {
    let ActionPayload::Download {
        source,
        local_file,
        expected_checksum,
    } = &record.payload
    else {
        return mismatched_payload(ctx);
    };
    let Some(url) = remote_url(ctx, source) else {
        return false;
    };
    ctx.submit(
        Request::new(Method::Get, url)
            .download_to(DownloadTarget {
                path: local_file.clone(),
                expected_md5: expected_checksum.clone(),
            })
            .resource_key(record.payload.item_path()),
    );
    true
}

fn handle_result(_record: &SyncRecord, event: &Event, ctx: &mut ActionContext<'_>) -> bool {
    if event.is_success() {
        return true;
    }
    ctx.reject("Download failed", event, &[IssueChoice::Retry, IssueChoice::Cancel])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::actions::test_support::{base, no_anchors, record};
    use cloudsync_core::FailureKind;

    fn payload() -> ActionPayload {
        ActionPayload::Download {
            source: "/Docs/A.txt".into(),
            local_file: "/sync/Docs/A.txt".into(),
            expected_checksum: Some("abc".into()),
        }
    }

    #[test]
    fn download_targets_the_local_file() {
        let base = base();
        let anchors = no_anchors();
        let mut ctx = ActionContext::new(&base, 0, &anchors);
        assert!(schedule(&record(payload()), &mut ctx));
        let request = ctx.take_requests().pop().unwrap();
        assert_eq!(request.method, Method::Get);
        assert!(request.idempotent);
        let target = request.download.unwrap();
        assert_eq!(target.path, std::path::PathBuf::from("/sync/Docs/A.txt"));
        assert_eq!(target.expected_md5.as_deref(), Some("abc"));
    }

    #[test]
    fn integrity_failures_are_retried() {
        let base = base();
        let anchors = no_anchors();
        let mut ctx = ActionContext::new(&base, 0, &anchors);
        let event = Event::failure("r", FailureKind::Integrity, "md5 mismatch");
        assert!(!handle_result(&record(payload()), &event, &mut ctx));
        assert!(ctx.retry);
    }
}
