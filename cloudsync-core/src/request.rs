use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Head,
    Put,
    Post,
    Delete,
    Mkcol,
    Move,
    Copy,
    Propfind,
    Proppatch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Post => "POST",
            Method::Delete => "DELETE",
            Method::Mkcol => "MKCOL",
            Method::Move => "MOVE",
            Method::Copy => "COPY",
            Method::Propfind => "PROPFIND",
            Method::Proppatch => "PROPPATCH",
        }
    }

    pub fn parse(value: &str) -> Result<Self, RequestError> {
        match value.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "PUT" => Ok(Method::Put),
            "POST" => Ok(Method::Post),
            "DELETE" => Ok(Method::Delete),
            "MKCOL" => Ok(Method::Mkcol),
            "MOVE" => Ok(Method::Move),
            "COPY" => Ok(Method::Copy),
            "PROPFIND" => Ok(Method::Propfind),
            "PROPPATCH" => Ok(Method::Proppatch),
            other => Err(RequestError::UnsupportedMethod(other.to_string())),
        }
    }

    /// Default replay safety. Uploads count as unsafe: replaying one can
    /// clobber a version written by another client in between.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Method::Post | Method::Move | Method::Put)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes { data: Vec<u8> },
    /// Streamed from disk when the request is performed, so a re-submitted
    /// request always reads the file again.
    File { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadTarget {
    pub path: PathBuf,
    #[serde(default)]
    pub expected_md5: Option<String>,
}

/// Recovery check for a non-idempotent request whose outcome was lost.
///
/// The probe is a `HEAD` of `url`. A 2xx answer whose `header` equals
/// `expected_value` means the original request was applied; a 404 means it
/// never reached the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionProbe {
    pub url: Url,
    #[serde(default)]
    pub header: Option<String>,
    #[serde(default)]
    pub expected_value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub request_id: String,
    pub method: Method,
    pub url: Url,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: RequestBody,
    #[serde(default)]
    pub download: Option<DownloadTarget>,
    pub idempotent: bool,
    /// Requests sharing a resource key never run at the same time.
    #[serde(default)]
    pub resource_key: Option<String>,
    #[serde(default)]
    pub probe: Option<CompletionProbe>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            method,
            url,
            headers: BTreeMap::new(),
            body: RequestBody::Empty,
            download: None,
            idempotent: method.is_idempotent(),
            resource_key: None,
            probe: None,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    pub fn download_to(mut self, target: DownloadTarget) -> Self {
        self.download = Some(target);
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn resource_key(mut self, key: impl Into<String>) -> Self {
        self.resource_key = Some(key.into());
        self
    }

    pub fn probe(mut self, probe: CompletionProbe) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn probe_request(&self) -> Option<Request> {
        let probe = self.probe.as_ref()?;
        let mut request = Request::new(Method::Head, probe.url.clone());
        request.request_id = format!("{}.probe", self.request_id);
        request.headers = self
            .headers
            .iter()
            .filter(|(name, _)| name.as_str() == "authorization")
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Some(request)
    }
}

/// Resolves a remote path (`/Docs/A.txt`) against a WebDAV-style root URL.
pub fn join_remote_path(base: &Url, remote_path: &str) -> Result<Url, RequestError> {
    let mut url = base.clone();
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| RequestError::Url(url::ParseError::RelativeUrlWithCannotBeABaseBase))?;
        segments.pop_if_empty();
        for part in remote_path.split('/').filter(|part| !part.is_empty()) {
            segments.push(part);
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_round_trips_through_strings() {
        for method in [Method::Mkcol, Method::Proppatch, Method::Move] {
            assert_eq!(Method::parse(method.as_str()).unwrap(), method);
        }
        assert!(Method::parse("BREW").is_err());
    }

    #[test]
    fn new_requests_get_distinct_ids() {
        let url = Url::parse("https://dav.example/files").unwrap();
        let a = Request::new(Method::Get, url.clone());
        let b = Request::new(Method::Get, url);
        assert_ne!(a.request_id, b.request_id);
        assert!(a.idempotent);
    }

    #[test]
    fn put_and_move_are_not_idempotent_by_default() {
        let url = Url::parse("https://dav.example/files/a").unwrap();
        assert!(!Request::new(Method::Put, url.clone()).idempotent);
        assert!(!Request::new(Method::Move, url).idempotent);
    }

    #[test]
    fn joins_remote_paths_with_escaping() {
        let base = Url::parse("https://dav.example/remote.php/dav/files/alice/").unwrap();
        let url = join_remote_path(&base, "/Docs/Hello World.txt").unwrap();
        assert_eq!(
            url.as_str(),
            "https://dav.example/remote.php/dav/files/alice/Docs/Hello%20World.txt"
        );
    }

    #[test]
    fn probe_request_keeps_auth_only() {
        let url = Url::parse("https://dav.example/files/a").unwrap();
        let request = Request::new(Method::Put, url.clone())
            .header("Authorization", "Bearer t")
            .header("OC-Checksum", "MD5:abc")
            .probe(CompletionProbe {
                url,
                header: Some("oc-checksum".into()),
                expected_value: Some("MD5:abc".into()),
            });
        let probe = request.probe_request().unwrap();
        assert_eq!(probe.method, Method::Head);
        assert_eq!(probe.headers.len(), 1);
        assert!(probe.request_id.starts_with(&request.request_id));
    }
}
