//! Server-side `MOVE` and `COPY`.

use cloudsync_core::{CompletionProbe, Event, EventClass, Method, Request};

use super::{await_refresh, mismatched_payload, remote_url, stamp};
use crate::sync::issue::IssueChoice;
use crate::sync::paths::{conflict_path, parent_path};
use crate::sync::record::{ActionPayload, SyncRecord};
use crate::sync::router::{ActionContext, ActionHandlers};

pub const MOVE_HANDLERS: ActionHandlers = ActionHandlers {
    schedule: schedule_move,
    handle_result: handle_move,
};

pub const COPY_HANDLERS: ActionHandlers = ActionHandlers {
    schedule: schedule_copy,
    handle_result: handle_copy,
};

const CONFLICT_CHOICES: [IssueChoice; 3] =
    [IssueChoice::Overwrite, IssueChoice::KeepBoth, IssueChoice::Cancel];

struct Transfer {
    source: String,
    destination: String,
    overwrite: bool,
    expected_etag: Option<String>,
}

/// Applies a pending user choice; returns whether the payload changed.
fn apply_choice(record: &SyncRecord, transfer: &mut Transfer, ctx: &ActionContext<'_>) -> bool {
    match record.user_choice {
        Some(IssueChoice::Overwrite) => {
            transfer.overwrite = true;
            transfer.expected_etag = None;
            true
        }
        Some(IssueChoice::KeepBoth) => {
            transfer.destination = conflict_path(&transfer.destination, stamp(ctx));
            transfer.expected_etag = None;
            true
        }
        _ => false,
    }
}

fn build(method: Method, transfer: &Transfer, ctx: &mut ActionContext<'_>) -> Option<Request> {
    let source = remote_url(ctx, &transfer.source)?;
    let destination = remote_url(ctx, &transfer.destination)?;
    let mut request = Request::new(method, source)
        .header("Destination", destination.as_str())
        .header("Overwrite", if transfer.overwrite { "T" } else { "F" })
        .resource_key(transfer.source.clone());
    if let Some(etag) = &transfer.expected_etag {
        request = request.header("If-Match", etag.clone());
    }
    if transfer.overwrite {
        // The destination may have existed before, so finding it proves nothing.
        return Some(request);
    }
    // Without Overwrite the destination was absent, so finding it proves a
    // lost MOVE went through.
    Some(request.probe(CompletionProbe {
        url: destination,
        header: None,
        expected_value: None,
    }))
}

fn schedule_move(record: &SyncRecord, ctx: &mut ActionContext<'_>) -> bool {
    let ActionPayload::Move {
        source,
        destination,
        overwrite,
        expected_etag,
    } = &record.payload
    else {
        return mismatched_payload(ctx);
    };
    let mut transfer = Transfer {
        source: source.clone(),
        destination: destination.clone(),
        overwrite: *overwrite,
        expected_etag: expected_etag.clone(),
    };
    if apply_choice(record, &mut transfer, ctx) {
        ctx.payload_update = Some(ActionPayload::Move {
            source: transfer.source.clone(),
            destination: transfer.destination.clone(),
            overwrite: transfer.overwrite,
            expected_etag: transfer.expected_etag.clone(),
        });
    }
    let Some(request) = build(Method::Move, &transfer, ctx) else {
        return false;
    };
    ctx.submit(request);
    true
}

fn schedule_copy(record: &SyncRecord, ctx: &mut ActionContext<'_>) -> bool {
    let ActionPayload::Copy {
        source,
        destination,
        overwrite,
    } = &record.payload
    else {
        return mismatched_payload(ctx);
    };
    let mut transfer = Transfer {
        source: source.clone(),
        destination: destination.clone(),
        overwrite: *overwrite,
        expected_etag: None,
    };
    if apply_choice(record, &mut transfer, ctx) {
        ctx.payload_update = Some(ActionPayload::Copy {
            source: transfer.source.clone(),
            destination: transfer.destination.clone(),
            overwrite: transfer.overwrite,
        });
    }
    let Some(request) = build(Method::Copy, &transfer, ctx) else {
        return false;
    };
    ctx.submit(request);
    true
}

fn handle_transfer(
    title: &str,
    record: &SyncRecord,
    event: &Event,
    ctx: &mut ActionContext<'_>,
) -> bool {
    if event.is_success() {
        return true;
    }
    if event.classification() == EventClass::PreconditionFailed {
        let destination = record.payload.destination().unwrap_or_default();
        let parent = parent_path(&destination).unwrap_or_else(|| "/".to_string());
        if await_refresh(record, ctx, &parent) {
            return false;
        }
    }
    ctx.reject(title, event, &CONFLICT_CHOICES)
}

fn handle_move(record: &SyncRecord, event: &Event, ctx: &mut ActionContext<'_>) -> bool {
    handle_transfer("Move failed", record, event, ctx)
}

fn handle_copy(record: &SyncRecord, event: &Event, ctx: &mut ActionContext<'_>) -> bool {
    handle_transfer("Copy failed", record, event, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::actions::test_support::{base, no_anchors, record};

    fn move_payload() -> ActionPayload {
        ActionPayload::Move {
            source: "/Docs/A.txt".into(),
            destination: "/Archive/A.txt".into(),
            overwrite: false,
            expected_etag: None,
        }
    }

    #[test]
    fn move_sends_destination_and_probe() {
        let base = base();
        let anchors = no_anchors();
        let mut ctx = ActionContext::new(&base, 0, &anchors);
        assert!(schedule_move(&record(move_payload()), &mut ctx));

        let request = ctx.take_requests().pop().unwrap();
        assert_eq!(request.method, Method::Move);
        assert!(!request.idempotent);
        assert_eq!(
            request.headers.get("destination").map(String::as_str),
            Some("https://dav.example/files/Archive/A.txt")
        );
        assert_eq!(request.headers.get("overwrite").map(String::as_str), Some("F"));
        assert_eq!(
            request.probe.unwrap().url.as_str(),
            "https://dav.example/files/Archive/A.txt"
        );
    }

    #[test]
    fn overwrite_choice_sets_the_header() {
        let base = base();
        let anchors = no_anchors();
        let mut record = record(move_payload());
        record.user_choice = Some(IssueChoice::Overwrite);
        let mut ctx = ActionContext::new(&base, 0, &anchors);
        assert!(schedule_move(&record, &mut ctx));

        let request = ctx.take_requests().pop().unwrap();
        assert_eq!(request.headers.get("overwrite").map(String::as_str), Some("T"));
        assert!(request.probe.is_none());
        assert!(matches!(
            ctx.payload_update,
            Some(ActionPayload::Move {
                overwrite: true,
                ..
            })
        ));
    }

    #[test]
    fn overwriting_move_carries_no_completion_check() {
        let base = base();
        let anchors = no_anchors();
        let record = record(ActionPayload::Move {
            source: "/Docs/A.txt".into(),
            destination: "/Archive/A.txt".into(),
            overwrite: true,
            expected_etag: None,
        });
        let mut ctx = ActionContext::new(&base, 0, &anchors);
        assert!(schedule_move(&record, &mut ctx));

        let request = ctx.take_requests().pop().unwrap();
        assert_eq!(request.headers.get("overwrite").map(String::as_str), Some("T"));
        assert!(request.probe.is_none());
    }

    #[test]
    fn copy_conflict_offers_keep_both() {
        let base = base();
        let anchors = no_anchors();
        let record = record(ActionPayload::Copy {
            source: "/A".into(),
            destination: "/B".into(),
            overwrite: false,
        });
        let mut ctx = ActionContext::new(&base, 0, &anchors);
        assert!(!handle_copy(&record, &Event::response("r", 409), &mut ctx));
        assert!(ctx.issue.unwrap().choices.contains(&IssueChoice::KeepBoth));
    }
}
