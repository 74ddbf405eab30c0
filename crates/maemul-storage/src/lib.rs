//! Matcher-service HTTP client + inventory store for maemul.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use maemul_core::{ProfileRow, PropertyRecord, SourceTag};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub mod inventory;

pub use inventory::{
    InventoryFile, InventoryStore, MemoryInventory, PgInventory, ProfileScope, PropertyQuery,
    StoreError,
};

pub const CRATE_NAME: &str = "maemul-storage";

/// Response status reported inside the envelope body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeStatus {
    Ok,
    Error,
    Exception,
}

/// `{status, data, message?}` wrapper used by every matcher-service response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub status: EnvelopeStatus,
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(data: Vec<T>) -> Self {
        Self {
            status: EnvelopeStatus::Ok,
            data,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: EnvelopeStatus::Error,
            data: Vec::new(),
            message: Some(message.into()),
        }
    }

    pub fn exception(message: impl Into<String>) -> Self {
        Self {
            status: EnvelopeStatus::Exception,
            data: Vec::new(),
            message: Some(message.into()),
        }
    }

    pub fn into_result(self) -> Result<Vec<T>, FetchError> {
        match self.status {
            EnvelopeStatus::Ok => Ok(self.data),
            status => Err(FetchError::Service {
                status,
                message: self.message.unwrap_or_default(),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out after {timeout:?} calling {url}")]
    Timeout { url: String, timeout: Duration },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("service reported {status:?}: {message}")]
    Service {
        status: EnvelopeStatus,
        message: String,
    },
    #[error("undecodable response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid url {0}")]
    Url(String),
    #[error("client worker pool is closed")]
    Closed,
}

/// Flag handed to callers next to a (possibly empty) row set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchStatus {
    Ok,
    TimedOut,
    ServiceError,
    Failed,
}

impl FetchError {
    pub fn status(&self) -> FetchStatus {
        match self {
            FetchError::Timeout { .. } => FetchStatus::TimedOut,
            FetchError::Service { .. } => FetchStatus::ServiceError,
            _ => FetchStatus::Failed,
        }
    }
}

/// Always well-formed result of a remote call: failures degrade to no rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchOutcome<T> {
    pub rows: Vec<T>,
    pub status: FetchStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T> FetchOutcome<T> {
    pub fn ok(rows: Vec<T>) -> Self {
        Self {
            rows,
            status: FetchStatus::Ok,
            message: None,
        }
    }

    pub fn failed(status: FetchStatus, message: impl Into<String>) -> Self {
        Self {
            rows: Vec::new(),
            status,
            message: Some(message.into()),
        }
    }

    pub fn from_result(result: Result<Vec<T>, FetchError>) -> Self {
        match result {
            Ok(rows) => Self::ok(rows),
            Err(err) => {
                warn!(error = %err, "remote fetch failed, returning no rows");
                Self::failed(err.status(), err.to_string())
            }
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == FetchStatus::Ok
    }
}

/// Which timeout a call gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallWeight {
    Light,
    Heavy,
}

#[derive(Debug, Clone)]
pub struct ServiceClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub light_timeout: Duration,
    pub user_agent: Option<String>,
    pub concurrency: usize,
}

impl Default for ServiceClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8000".to_string(),
            timeout: Duration::from_secs(20),
            light_timeout: Duration::from_secs(5),
            user_agent: None,
            concurrency: 4,
        }
    }
}

/// Match request for `POST /match` and its manager-scoped variant.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchRequest {
    pub addresses: Vec<String>,
    pub full_scope: bool,
    pub manager: Option<String>,
    pub start_from: Option<NaiveDate>,
    pub start_to: Option<NaiveDate>,
}

/// Query-string form of [`MatchRequest`]; `addresses` is a JSON array.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MatchQuery {
    pub addresses: Option<String>,
    pub full_scope: Option<bool>,
    pub start_from: Option<NaiveDate>,
    pub start_to: Option<NaiveDate>,
}

impl MatchRequest {
    pub fn to_query(&self) -> Result<Vec<(&'static str, String)>, FetchError> {
        let mut query = Vec::new();
        if !self.addresses.is_empty() {
            query.push(("addresses", serde_json::to_string(&self.addresses)?));
        }
        if self.full_scope {
            query.push(("full_scope", "true".to_string()));
        }
        if let Some(from) = self.start_from {
            query.push(("start_from", from.format("%Y-%m-%d").to_string()));
        }
        if let Some(to) = self.start_to {
            query.push(("start_to", to.format("%Y-%m-%d").to_string()));
        }
        Ok(query)
    }

    pub fn from_query(query: MatchQuery, manager: Option<String>) -> Result<Self, serde_json::Error> {
        let addresses = match query.addresses.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => serde_json::from_str::<Vec<String>>(text)?,
            _ => Vec::new(),
        };
        Ok(Self {
            addresses,
            full_scope: query.full_scope.unwrap_or(false),
            manager,
            start_from: query.start_from,
            start_to: query.start_to,
        })
    }

    fn path_segments(&self) -> Vec<&str> {
        match &self.manager {
            Some(manager) => vec!["match", "manager", manager.as_str()],
            None => vec!["match"],
        }
    }
}

#[derive(Debug)]
pub struct ServiceClient {
    client: reqwest::Client,
    base_url: reqwest::Url,
    limit: Arc<Semaphore>,
    timeout: Duration,
    light_timeout: Duration,
}

impl ServiceClient {
    pub fn new(config: ServiceClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        let mut base = config.base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url = reqwest::Url::parse(&base)
            .with_context(|| format!("parsing service url {}", config.base_url))?;

        Ok(Self {
            client,
            base_url,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            timeout: config.timeout,
            light_timeout: config.light_timeout,
        })
    }

    pub fn timeout_for(&self, weight: CallWeight) -> Duration {
        match weight {
            CallWeight::Light => self.light_timeout,
            CallWeight::Heavy => self.timeout,
        }
    }

    /// Appends percent-encoded segments to the base path.
    fn url(&self, segments: &[&str]) -> Result<reqwest::Url, FetchError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FetchError::Url(format!("{} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub(crate) fn match_url(&self, request: &MatchRequest) -> Result<reqwest::Url, FetchError> {
        self.url(&request.path_segments())
    }

    /// One bounded call; a timeout is reported, never retried.
    async fn call<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        url: &reqwest::Url,
        weight: CallWeight,
    ) -> Result<Vec<T>, FetchError> {
        let _permit = self.limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let timeout = self.timeout_for(weight);
        let request_id = Uuid::new_v4();
        let span = info_span!("service_call", %request_id, url = %url);

        async move {
            let resp = request.timeout(timeout).send().await.map_err(|err| {
                if err.is_timeout() {
                    FetchError::Timeout {
                        url: url.to_string(),
                        timeout,
                    }
                } else {
                    FetchError::Request(err)
                }
            })?;

            let status = resp.status();
            let final_url = resp.url().to_string();
            let body = resp.bytes().await.map_err(|err| {
                if err.is_timeout() {
                    FetchError::Timeout {
                        url: url.to_string(),
                        timeout,
                    }
                } else {
                    FetchError::Request(err)
                }
            })?;
            if !status.is_success() {
                // Error responses still carry an envelope when the service produced them.
                return match serde_json::from_slice::<Envelope<JsonValue>>(&body) {
                    Ok(envelope) if envelope.status != EnvelopeStatus::Ok => Err(FetchError::Service {
                        status: envelope.status,
                        message: envelope.message.unwrap_or_default(),
                    }),
                    _ => Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    }),
                };
            }
            let envelope: Envelope<T> = serde_json::from_slice(&body)?;
            envelope.into_result()
        }
        .instrument(span)
        .await
    }

    pub async fn match_properties(&self, request: &MatchRequest) -> Result<Vec<PropertyRecord>, FetchError> {
        let url = self.match_url(request)?;
        let builder = self.client.post(url.clone()).query(&request.to_query()?);
        self.call(builder, &url, CallWeight::Heavy).await
    }

    pub async fn fetch_profiles(&self, manager: Option<&str>) -> Result<Vec<ProfileRow>, FetchError> {
        let url = self.url(&["profiles"])?;
        let mut builder = self.client.get(url.clone());
        if let Some(manager) = manager {
            builder = builder.query(&[("manager", manager)]);
        }
        self.call(builder, &url, CallWeight::Light).await
    }

    /// Raw batch of one feed; shape depends on the feed.
    pub async fn fetch_feed(&self, source: SourceTag) -> Result<Vec<JsonValue>, FetchError> {
        let url = self.url(&["feeds", source.as_str()])?;
        let builder = self.client.get(url.clone());
        self.call(builder, &url, CallWeight::Heavy).await
    }
}
