use std::collections::BTreeMap;

use cloudsync_core::{Event, Method, Request, RequestBody};

use super::{mismatched_payload, remote_url};
use crate::sync::issue::{Issue, IssueChoice};
use crate::sync::record::{ActionPayload, SyncRecord};
use crate::sync::router::{ActionContext, ActionHandlers};

pub const HANDLERS: ActionHandlers = ActionHandlers {
    schedule,
    handle_result,
};

const PROPERTY_NAMESPACE: &str = "urn:cloudsync:properties";

fn schedule(record: &SyncRecord, ctx: &mut ActionContext<'_>) -> bool {
    let ActionPayload::UpdateMetadata { path, properties } = &record.payload else {
        return mismatched_payload(ctx);
    };
    if let Some(name) = properties.keys().find(|name| !is_xml_name(name)) {
        return ctx.fail(format!("invalid property name {name:?}"));
    }
    let Some(url) = remote_url(ctx, path) else {
        return false;
    };
    ctx.submit(
        Request::new(Method::Proppatch, url)
            .header("Content-Type", "application/xml; charset=utf-8")
            .body(RequestBody::Bytes {
                data: propertyupdate(properties).into_bytes(),
            })
            .resource_key(record.payload.item_path()),
    );
    true
}

fn handle_result(record: &SyncRecord, event: &Event, ctx: &mut ActionContext<'_>) -> bool {
    if !event.is_success() {
        return ctx.reject(
            "Updating properties failed",
            event,
            &[IssueChoice::Retry, IssueChoice::Cancel],
        );
    }
    // A 207 can still carry per-property failures; they are not worth a retry.
    let body = String::from_utf8_lossy(&event.body);
    if event.status == Some(207) && body.contains("HTTP/1.1 4") {
        ctx.notices.push(Issue::warning(
            "Some properties were not updated",
            format!("the server rejected part of the update for {}", record.payload.item_path()),
        ));
    }
    true
}

fn propertyupdate(properties: &BTreeMap<String, String>) -> String {
    let mut xml = format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\
         <d:propertyupdate xmlns:d=\"DAV:\" xmlns:p=\"{PROPERTY_NAMESPACE}\"><d:set><d:prop>"
    );
    for (name, value) in properties {
        xml.push_str(&format!("<p:{name}>{}</p:{name}>", escape(value)));
    }
    xml.push_str("</d:prop></d:set></d:propertyupdate>");
    xml
}

fn is_xml_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars
        .next()
        .is_some_and(|first| first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}
