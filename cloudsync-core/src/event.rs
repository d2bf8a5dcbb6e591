use std::collections::BTreeMap;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Connection,
    Io,
    Integrity,
    /// A non-idempotent request was lost across a restart and could not be
    /// proven applied or unapplied.
    RecoveryAmbiguous,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// Completion of one request: a server answer, or the reason there is none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub request_id: String,
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Vec<u8>,
    #[serde(default)]
    pub error: Option<TransportFailure>,
    /// Produced by recovery instead of a live exchange.
    #[serde(default)]
    pub recovered: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClass {
    Success,
    NotFound,
    Auth,
    RateLimit,
    Transient,
    Conflict,
    PreconditionFailed,
    Quota,
    Permanent,
    Ambiguous,
}

impl EventClass {
    pub fn is_retryable(&self) -> bool {
        matches!(self, EventClass::RateLimit | EventClass::Transient)
    }
}

impl Event {
    pub fn response(request_id: impl Into<String>, status: u16) -> Self {
        Self {
            request_id: request_id.into(),
            status: Some(status),
            headers: BTreeMap::new(),
            body: Vec::new(),
            error: None,
            recovered: false,
        }
    }

    pub fn failure(request_id: impl Into<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            status: None,
            headers: BTreeMap::new(),
            body: Vec::new(),
            error: Some(TransportFailure {
                kind,
                message: message.into(),
            }),
            recovered: false,
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status.is_some_and(|status| (200..300).contains(&status))
    }

    pub fn classification(&self) -> EventClass {
        if let Some(error) = &self.error {
            return match error.kind {
                FailureKind::RecoveryAmbiguous => EventClass::Ambiguous,
                _ => EventClass::Transient,
            };
        }
        match self.status {
            Some(status) => classify_status(status),
            None => EventClass::Transient,
        }
    }

    /// Seconds to wait as requested by a `Retry-After` header, either as a
    /// delay or as an HTTP date.
    pub fn retry_after_secs(&self) -> Option<u64> {
        let value = self.header("retry-after")?.trim();
        if let Ok(seconds) = value.parse::<u64>() {
            return Some(seconds);
        }
        let at = httpdate::parse_http_date(value).ok()?;
        Some(
            at.duration_since(SystemTime::now())
                .map(|delay| delay.as_secs())
                .unwrap_or(0),
        )
    }

    pub fn describe(&self) -> String {
        match (&self.error, self.status) {
            (Some(error), _) => format!("{:?}: {}", error.kind, error.message),
            (None, Some(status)) => {
                let body = String::from_utf8_lossy(&self.body);
                let body = body.trim();
                if body.is_empty() {
                    format!("server returned {status}")
                } else {
                    format!("server returned {status}: {}", truncate(body, 200))
                }
            }
            (None, None) => "no response".to_string(),
        }
    }
}

fn classify_status(status: u16) -> EventClass {
    match status {
        200..=299 => EventClass::Success,
        401 | 403 => EventClass::Auth,
        404 => EventClass::NotFound,
        409 => EventClass::Conflict,
        412 => EventClass::PreconditionFailed,
        413 | 507 => EventClass::Quota,
        429 => EventClass::RateLimit,
        408 | 425 => EventClass::Transient,
        500..=599 => EventClass::Transient,
        _ => EventClass::Permanent,
    }
}

fn truncate(value: &str, max: usize) -> &str {
    match value.char_indices().nth(max) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_status_codes() {
        assert_eq!(Event::response("r", 201).classification(), EventClass::Success);
        assert_eq!(Event::response("r", 503).classification(), EventClass::Transient);
        assert_eq!(Event::response("r", 429).classification(), EventClass::RateLimit);
        assert_eq!(Event::response("r", 412).classification(), EventClass::PreconditionFailed);
        assert_eq!(Event::response("r", 507).classification(), EventClass::Quota);
        assert_eq!(Event::response("r", 403).classification(), EventClass::Auth);
        assert_eq!(Event::response("r", 400).classification(), EventClass::Permanent);
    }

    #[test]
    fn transport_failures_are_transient_except_ambiguous_recovery() {
        let timeout = Event::failure("r", FailureKind::Timeout, "timed out");
        assert!(timeout.classification().is_retryable());
        let lost = Event::failure("r", FailureKind::RecoveryAmbiguous, "lost");
        assert_eq!(lost.classification(), EventClass::Ambiguous);
        assert!(!lost.is_success());
    }

    #[test]
    fn retry_after_accepts_seconds() {
        let event = Event::response("r", 429).with_header("Retry-After", "7");
        assert_eq!(event.retry_after_secs(), Some(7));
    }

    #[test]
    fn retry_after_in_the_past_is_zero() {
        let event =
            Event::response("r", 503).with_header("Retry-After", "Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(event.retry_after_secs(), Some(0));
    }

    #[test]
    fn headers_are_case_insensitive() {
        let event = Event::response("r", 200).with_header("ETag", "\"abc\"");
        assert_eq!(event.header("etag"), Some("\"abc\""));
        assert_eq!(event.header("ETAG"), Some("\"abc\""));
    }
}
