//! CrossRef `/works` lookups for the enrich command.

use async_trait::async_trait;
use literature_notes::Biblio;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use sync_core::{MetadataError, MetadataSource};
use tracing::debug;

use crate::config::CrossrefConfig;

const TIMEOUT_SECS: u64 = 15;

pub struct CrossrefClient {
    client: Client,
    api_url: String,
    user_agent: String,
}

#[derive(Debug, Deserialize)]
struct WorkEnvelope {
    message: Work,
}

#[derive(Debug, Deserialize)]
struct SearchEnvelope {
    message: SearchMessage,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SearchMessage {
    items: Vec<Work>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Work {
    title: Vec<String>,
    volume: String,
    issue: String,
    page: String,
    #[serde(rename = "ISSN")]
    issn: Vec<String>,
    publisher: String,
    #[serde(rename = "URL")]
    url: String,
    resource: Option<Resource>,
    language: String,
    #[serde(rename = "DOI")]
    doi: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Resource {
    primary: Option<PrimaryResource>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PrimaryResource {
    #[serde(rename = "URL")]
    url: String,
}

impl Work {
    fn into_biblio(self) -> Biblio {
        let url = if self.url.is_empty() {
            self.resource
                .and_then(|r| r.primary)
                .map(|p| p.url)
                .unwrap_or_default()
        } else {
            self.url
        };
        Biblio {
            title: self.title.into_iter().next().unwrap_or_default(),
            volume: self.volume,
            issue: self.issue,
            pages: self.page,
            issn: self.issn.into_iter().next().unwrap_or_default(),
            publisher: self.publisher,
            url,
            language: self.language,
            doi: self.doi,
            ..Default::default()
        }
    }
}

impl CrossrefClient {
    pub fn new(config: &CrossrefConfig) -> Result<Self, MetadataError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(TIMEOUT_SECS))
            .build()
            .map_err(|e| MetadataError::Transient(format!("failed to create HTTP client: {e}")))?;
        let user_agent = match &config.mailto {
            Some(mailto) => format!("papersync/{} (mailto:{mailto})", env!("CARGO_PKG_VERSION")),
            None => format!("papersync/{}", env!("CARGO_PKG_VERSION")),
        };
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            user_agent,
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client
            .get(format!("{}{}", self.api_url, path))
            .header("User-Agent", &self.user_agent)
    }
}

async fn parse<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T, MetadataError> {
    response
        .json()
        .await
        .map_err(|e| MetadataError::Malformed(format!("failed to parse CrossRef response: {e}")))
}

fn status_error(status: StatusCode) -> MetadataError {
    MetadataError::Transient(format!("CrossRef returned {status}"))
}

#[async_trait]
impl MetadataSource for CrossrefClient {
    async fn by_doi(&self, doi: &str) -> Result<Option<Biblio>, MetadataError> {
        let response = self
            .get(&format!("/works/{doi}"))
            .send()
            .await
            .map_err(|e| MetadataError::Transient(format!("CrossRef request failed: {e}")))?;
        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!("CrossRef has no record for {}", doi);
                Ok(None)
            }
            s if s.is_success() => {
                let envelope: WorkEnvelope = parse(response).await?;
                Ok(Some(envelope.message.into_biblio()))
            }
            s => Err(status_error(s)),
        }
    }

    async fn search(&self, title: &str, author: &str) -> Result<Option<Biblio>, MetadataError> {
        let mut params = vec![("rows", "1".to_string())];
        if !title.trim().is_empty() {
            params.push(("query.title", title.trim().to_string()));
        }
        if !author.trim().is_empty() {
            params.push(("query.author", author.trim().to_string()));
        }
        if params.len() == 1 {
            return Ok(None);
        }

        let response = self
            .get("/works")
            .query(&params)
            .send()
            .await
            .map_err(|e| MetadataError::Transient(format!("CrossRef request failed: {e}")))?;
        if !response.status().is_success() {
            return Err(status_error(response.status()));
        }
        let envelope: SearchEnvelope = parse(response).await?;
        Ok(envelope.message.items.into_iter().next().map(Work::into_biblio))
    }
}
