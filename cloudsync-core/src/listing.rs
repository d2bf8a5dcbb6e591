use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ListingError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("listing api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("listing response missing embedded items")]
    MissingEmbedded,
}

impl ListingError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ListingError::Request(_) => true,
            ListingError::Api { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }
}

/// Client for the JSON directory listing endpoint (`/v1/listing`).
#[derive(Clone)]
pub struct ListingClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
}

impl ListingClient {
    pub fn with_base_url(base_url: &str, token: Option<String>) -> Result<Self, ListingError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token,
        })
    }

    pub async fn list_page(
        &self,
        path: &str,
        limit: u32,
        offset: u32,
    ) -> Result<ListingPage, ListingError> {
        let mut url = self.base_url.join("/v1/listing")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("limit", &limit.to_string())
            .append_pair("offset", &offset.to_string());
        let mut request = self.http.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let payload: ListingResponse = Self::handle_response(response).await?;
        payload.embedded.ok_or(ListingError::MissingEmbedded)
    }

    /// Fetches every page of `path`. The sync anchor of the first page is
    /// kept, so a listing that straddles a server change reports the older
    /// anchor and a later listing supersedes it.
    pub async fn list_all(&self, path: &str, page_size: u32) -> Result<Listing, ListingError> {
        let page_size = page_size.max(1);
        let mut offset = 0u32;
        let mut items = Vec::new();
        let mut sync_anchor = None;
        loop {
            let page = self.list_page(path, page_size, offset).await?;
            if offset == 0 {
                sync_anchor = page.sync_anchor;
            }
            let received = page.items.len() as u32;
            offset = offset.saturating_add(received);
            let total = page.total;
            items.extend(page.items);
            if offset >= total || received == 0 {
                break;
            }
        }
        Ok(Listing { items, sync_anchor })
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ListingError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ListingError::Api { status, body })
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ListedResource {
    pub path: String,
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub file_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    File,
    Dir,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ListingPage {
    pub items: Vec<ListedResource>,
    pub limit: u32,
    pub offset: u32,
    pub total: u32,
    #[serde(default)]
    pub sync_anchor: Option<i64>,
}

#[derive(Debug, Deserialize, Serialize)]
struct ListingResponse {
    #[serde(rename = "_embedded")]
    embedded: Option<ListingPage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub items: Vec<ListedResource>,
    pub sync_anchor: Option<i64>,
}
