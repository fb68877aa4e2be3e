//! Zotero Web API v3 client.
//!
//! Every request carries the API key and version headers. Writes are
//! conditional on the item version via `If-Unmodified-Since-Version`; a 412
//! answer becomes [`LibraryError::VersionConflict`]. A fixed pause follows
//! every call.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sync_core::library::{CreateResult, Result};
use sync_core::{FieldUpdate, Item, ItemData, Library, LibraryError};
use tracing::debug;

use crate::config::ZoteroConfig;

/// Largest page the API serves.
const PAGE_SIZE: usize = 100;

pub struct ZoteroClient {
    client: Client,
    /// `{api_url}/users/{id}` or `{api_url}/groups/{id}`
    base_url: String,
    api_key: String,
    api_delay: Duration,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WriteResponse {
    success: BTreeMap<String, String>,
    failed: BTreeMap<String, WriteFailure>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WriteFailure {
    code: u16,
    message: String,
}

impl ZoteroClient {
    pub fn new(config: &ZoteroConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| LibraryError::Transient(format!("failed to create HTTP client: {e}")))?;
        let base_url = format!(
            "{}/{}/{}",
            config.api_url.trim_end_matches('/'),
            config.library_kind.path_segment(),
            config.library_id
        );
        debug!("Zotero library at {}", base_url);

        Ok(Self {
            client,
            base_url,
            api_key: config.api_key.clone(),
            api_delay: config.api_delay,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("Zotero-API-Key", &self.api_key)
            .header("Zotero-API-Version", "3")
    }

    /// Send, pause, and turn error statuses into [`LibraryError`]s.
    async fn send(&self, request: RequestBuilder, key: Option<(&str, u64)>) -> Result<Response> {
        let result = request.send().await;
        if !self.api_delay.is_zero() {
            tokio::time::sleep(self.api_delay).await;
        }
        let response = result.map_err(|e| LibraryError::Transient(format!("request failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let detail = format!("{status}: {}", body.trim());
        Err(match status {
            StatusCode::PRECONDITION_FAILED => match key {
                Some((key, expected)) => LibraryError::VersionConflict {
                    key: key.to_string(),
                    expected,
                },
                None => LibraryError::Malformed(detail),
            },
            StatusCode::FORBIDDEN | StatusCode::UNAUTHORIZED => LibraryError::Auth(detail),
            StatusCode::NOT_FOUND => LibraryError::NotFound(key.map(|(k, _)| k.to_string()).unwrap_or(detail)),
            StatusCode::TOO_MANY_REQUESTS => LibraryError::Transient(detail),
            s if s.is_server_error() => LibraryError::Transient(detail),
            _ => LibraryError::Malformed(detail),
        })
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T> {
        response
            .json()
            .await
            .map_err(|e| LibraryError::Malformed(format!("failed to parse response: {e}")))
    }

    /// GET a list endpoint page by page.
    async fn get_all(&self, path: &str, query: &[(&str, String)]) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        loop {
            let mut params = query.to_vec();
            params.push(("format", "json".to_string()));
            params.push(("limit", PAGE_SIZE.to_string()));
            params.push(("start", items.len().to_string()));

            let response = self
                .send(self.request(reqwest::Method::GET, path).query(&params), None)
                .await?;
            let total = total_results(response.headers());
            let page: Vec<Item> = Self::json(response).await?;
            let page_len = page.len();
            items.extend(page);

            let done = match total {
                Some(total) => items.len() >= total,
                None => page_len < PAGE_SIZE,
            };
            if done || page_len == 0 {
                return Ok(items);
            }
        }
    }
}

fn total_results(headers: &HeaderMap) -> Option<usize> {
    headers.get("Total-Results")?.to_str().ok()?.parse().ok()
}

fn last_modified_version(headers: &HeaderMap) -> Option<u64> {
    headers.get("Last-Modified-Version")?.to_str().ok()?.parse().ok()
}

#[async_trait]
impl Library for ZoteroClient {
    async fn items_since(&self, since: u64) -> Result<Vec<Item>> {
        let items = self
            .get_all("/items/top", &[("since", since.to_string())])
            .await?;
        debug!("Fetched {} item(s) changed since version {}", items.len(), since);
        Ok(items)
    }

    async fn library_version(&self) -> Result<u64> {
        let request = self
            .request(reqwest::Method::GET, "/items/top")
            .query(&[("limit", "1"), ("format", "keys")]);
        let response = self.send(request, None).await?;
        last_modified_version(response.headers())
            .ok_or_else(|| LibraryError::Malformed("missing Last-Modified-Version header".to_string()))
    }

    async fn item(&self, key: &str) -> Result<Item> {
        let response = self
            .send(self.request(reqwest::Method::GET, &format!("/items/{key}")), Some((key, 0)))
            .await?;
        Self::json(response).await
    }

    async fn children(&self, key: &str) -> Result<Vec<Item>> {
        self.get_all(&format!("/items/{key}/children"), &[]).await
    }

    async fn update_item(&self, key: &str, version: u64, update: &FieldUpdate) -> Result<u64> {
        let request = self
            .request(reqwest::Method::PATCH, &format!("/items/{key}"))
            .header("If-Unmodified-Since-Version", version.to_string())
            .json(&update.to_json());
        let response = self.send(request, Some((key, version))).await?;
        Ok(last_modified_version(response.headers()).unwrap_or(version + 1))
    }

    async fn create_items(&self, items: &[ItemData]) -> Result<CreateResult> {
        let response = self
            .send(self.request(reqwest::Method::POST, "/items").json(items), None)
            .await?;
        let body: WriteResponse = Self::json(response).await?;

        let index = |k: &str| {
            k.parse::<usize>()
                .map_err(|_| LibraryError::Malformed(format!("unexpected batch index {k:?}")))
        };
        let mut result = CreateResult::default();
        for (idx, key) in body.success {
            result.created.insert(index(&idx)?, key);
        }
        for (idx, failure) in body.failed {
            result
                .failed
                .insert(index(&idx)?, format!("{} {}", failure.code, failure.message));
        }
        Ok(result)
    }

    async fn delete_item(&self, key: &str, version: u64) -> Result<()> {
        let request = self
            .request(reqwest::Method::DELETE, &format!("/items/{key}"))
            .header("If-Unmodified-Since-Version", version.to_string());
        self.send(request, Some((key, version))).await?;
        Ok(())
    }
}

