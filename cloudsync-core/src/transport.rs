use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::io;

use futures_util::StreamExt;
use md5::Context;
use reqwest::Client;
use reqwest::header::CONTENT_LENGTH;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::io::ReaderStream;

use crate::event::{Event, FailureKind};
use crate::request::{DownloadTarget, REQUEST_ID_HEADER, Request, RequestBody};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("method {0} is not accepted by the http client")]
    UnsupportedMethod(String),
    #[error("concurrency limiter is closed")]
    ConcurrencyClosed,
    #[error("download integrity check failed: expected {expected_md5}, got {actual_md5}")]
    IntegrityMismatch {
        expected_md5: String,
        actual_md5: String,
    },
}

impl TransportError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            TransportError::Request(err) if err.is_timeout() => FailureKind::Timeout,
            TransportError::Request(err) if err.is_connect() || err.is_body() => {
                FailureKind::Connection
            }
            TransportError::Io(_) => FailureKind::Io,
            TransportError::IntegrityMismatch { .. } => FailureKind::Integrity,
            _ => FailureKind::Other,
        }
    }
}

/// Executes requests and reports their completion as [`Event`]s.
///
/// Implementations never fail: every outcome, including connection loss,
/// is folded into the returned event.
pub trait Transport: Send + Sync + 'static {
    fn perform(&self, request: Request) -> impl Future<Output = Event> + Send;

    /// Requests the transport is still executing, by request id.
    fn live_request_ids(&self) -> impl Future<Output = Vec<String>> + Send;

    /// Waits for a live request started before the caller attached to it.
    /// Returns `None` when the transport has no such request.
    fn await_live(&self, request_id: String) -> impl Future<Output = Option<Event>> + Send;
}

pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 4;

/// Transport limits. Callers that read the environment pass the result in
/// here; the default never consults it.
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub max_concurrent_requests: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
        }
    }
}

#[derive(Clone)]
pub struct HttpTransport {
    http: Client,
    token: Option<String>,
    limit: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl HttpTransport {
    pub fn new(token: Option<String>) -> Self {
        Self::with_config(token, TransportConfig::default())
    }

    pub fn with_config(token: Option<String>, config: TransportConfig) -> Self {
        Self::with_http(Client::new(), token, config)
    }

    pub fn with_http(http: Client, token: Option<String>, config: TransportConfig) -> Self {
        Self {
            http,
            token,
            limit: Arc::new(Semaphore::new(config.max_concurrent_requests.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    async fn execute(&self, request: &Request) -> Result<Event, TransportError> {
        let _permit = self
            .limit
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| TransportError::ConcurrencyClosed)?;
        let method = reqwest::Method::from_bytes(request.method.as_str().as_bytes())
            .map_err(|_| TransportError::UnsupportedMethod(request.method.as_str().to_string()))?;

        let mut builder = self
            .http
            .request(method, request.url.clone())
            .header(REQUEST_ID_HEADER, &request.request_id);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Bytes { data } => builder.body(data.clone()),
            RequestBody::File { path } => {
                let file = tokio::fs::File::open(path).await?;
                let len = file.metadata().await?.len();
                builder
                    .header(CONTENT_LENGTH, len)
                    .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            }
        };

        let response = builder.send().await?;
        let status = response.status();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();

        let body = match &request.download {
            Some(target) if status.is_success() => {
                download_to_target(response, target).await?;
                Vec::new()
            }
            _ => response.bytes().await?.to_vec(),
        };

        Ok(Event {
            request_id: request.request_id.clone(),
            status: Some(status.as_u16()),
            headers,
            body,
            error: None,
            recovered: false,
        })
    }
}

impl Transport for HttpTransport {
    async fn perform(&self, request: Request) -> Event {
        self.in_flight
            .lock()
            .await
            .insert(request.request_id.clone());
        let result = self.execute(&request).await;
        self.in_flight.lock().await.remove(&request.request_id);
        match result {
            Ok(event) => event,
            Err(err) => {
                tracing::debug!(request_id = %request.request_id, error = %err, "request failed");
                Event::failure(request.request_id, err.failure_kind(), err.to_string())
            }
        }
    }

    async fn live_request_ids(&self) -> Vec<String> {
        self.in_flight.lock().await.iter().cloned().collect()
    }

    async fn await_live(&self, _request_id: String) -> Option<Event> {
        // Exchanges do not outlive the process that started them.
        None
    }
}

async fn download_to_target(
    response: reqwest::Response,
    target: &DownloadTarget,
) -> Result<(), TransportError> {
    if let Some(parent) = target.path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let partial = partial_path(&target.path);
    let mut file = tokio::fs::File::create(&partial).await?;
    let mut stream = response.bytes_stream();
    let mut md5 = target.expected_md5.as_ref().map(|_| Context::new());

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        if let Some(ctx) = md5.as_mut() {
            ctx.consume(&chunk);
        }
    }

    file.flush().await?;
    file.sync_all().await?;

    if let (Some(expected_md5), Some(ctx)) = (&target.expected_md5, md5) {
        let actual_md5 = format!("{:x}", ctx.compute());
        if actual_md5 != expected_md5.to_ascii_lowercase() {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(TransportError::IntegrityMismatch {
                expected_md5: expected_md5.to_ascii_lowercase(),
                actual_md5,
            });
        }
    }

    tokio::fs::rename(partial, &target.path).await?;
    Ok(())
}

fn partial_path(target: &Path) -> PathBuf {
    target.with_extension(format!(
        "{}partial",
        target
            .extension()
            .map(|ext| format!("{}.", ext.to_string_lossy()))
            .unwrap_or_default()
    ))
}
