//! Source adapter contracts and per-feed adapters.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use maemul_core::{SourceTag, UnifiedRow};
use maemul_storage::{FetchError, FetchStatus, InventoryStore, MemoryInventory, ServiceClient, StoreError};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub mod normalize;
pub mod records;

pub use normalize::{decide_status, normalize, ListingNumberStyle, NormalizeOptions};
pub use records::{
    CompletedDealRecord, ConfirmationRecord, PersonalListRecord, RecommendationRecord, SourceRecord,
    StudioRecord,
};

pub const CRATE_NAME: &str = "maemul-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{source_tag} row {index}: {error}")]
    Decode {
        source_tag: SourceTag,
        index: usize,
        #[source]
        error: serde_json::Error,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    pub fn status(&self) -> FetchStatus {
        match self {
            AdapterError::Fetch(err) => err.status(),
            _ => FetchStatus::Failed,
        }
    }
}

/// Where a feed's raw batch comes from.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn feed(&self, source: SourceTag) -> Result<Vec<JsonValue>, AdapterError>;
}

#[async_trait]
impl FeedTransport for ServiceClient {
    async fn feed(&self, source: SourceTag) -> Result<Vec<JsonValue>, AdapterError> {
        Ok(self.fetch_feed(source).await?)
    }
}

#[async_trait]
impl FeedTransport for MemoryInventory {
    async fn feed(&self, source: SourceTag) -> Result<Vec<JsonValue>, AdapterError> {
        Ok(self.feed_batch(source).await?)
    }
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> SourceTag;

    async fn fetch(&self, transport: &dyn FeedTransport) -> Result<Vec<JsonValue>, AdapterError> {
        transport.feed(self.source()).await
    }

    fn parse_one(&self, index: usize, raw: &JsonValue) -> Result<SourceRecord, AdapterError>;

    /// Malformed rows are logged and skipped; the rest of the batch survives.
    fn parse(&self, raw: &[JsonValue]) -> Vec<SourceRecord> {
        raw.iter()
            .enumerate()
            .filter_map(|(index, value)| match self.parse_one(index, value) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(source = %self.source(), index, error = %err, "skipping malformed feed row");
                    None
                }
            })
            .collect()
    }

    /// Fetch, parse and normalize one feed.
    async fn load(
        &self,
        transport: &dyn FeedTransport,
        opts: &NormalizeOptions,
    ) -> Result<Vec<UnifiedRow>, AdapterError> {
        let raw = self.fetch(transport).await?;
        Ok(self.parse(&raw).iter().map(|r| normalize(r, opts)).collect())
    }
}

#[derive(Debug, Clone, Copy)]
struct JsonFeedAdapter {
    source: SourceTag,
}

#[async_trait]
impl SourceAdapter for JsonFeedAdapter {
    fn source(&self) -> SourceTag {
        self.source
    }

    fn parse_one(&self, index: usize, raw: &JsonValue) -> Result<SourceRecord, AdapterError> {
        let decoded = SourceRecord::from_json(self.source, raw.clone()).map_err(|error| AdapterError::Decode {
            source_tag: self.source,
            index,
            error,
        })?;
        decoded.ok_or_else(|| AdapterError::Message(format!("no record shape for source {}", self.source)))
    }
}

pub fn live_shop_adapter() -> impl SourceAdapter {
    JsonFeedAdapter {
        source: SourceTag::LiveShop,
    }
}

pub fn live_studio_adapter() -> impl SourceAdapter {
    JsonFeedAdapter {
        source: SourceTag::LiveStudio,
    }
}

pub fn confirmation_desk_adapter() -> impl SourceAdapter {
    JsonFeedAdapter {
        source: SourceTag::ConfirmationDesk,
    }
}

pub fn recommendation_adapter() -> impl SourceAdapter {
    JsonFeedAdapter {
        source: SourceTag::Recommendation,
    }
}

pub fn personal_list_adapter() -> impl SourceAdapter {
    JsonFeedAdapter {
        source: SourceTag::PersonalList,
    }
}

pub fn completed_deal_adapter() -> impl SourceAdapter {
    JsonFeedAdapter {
        source: SourceTag::CompletedDeal,
    }
}

pub fn adapter_for_source(source: SourceTag) -> Option<Box<dyn SourceAdapter>> {
    match source {
        SourceTag::LiveShop => Some(Box::new(live_shop_adapter())),
        SourceTag::LiveStudio => Some(Box::new(live_studio_adapter())),
        SourceTag::ConfirmationDesk => Some(Box::new(confirmation_desk_adapter())),
        SourceTag::Recommendation => Some(Box::new(recommendation_adapter())),
        SourceTag::PersonalList => Some(Box::new(personal_list_adapter())),
        SourceTag::CompletedDeal => Some(Box::new(completed_deal_adapter())),
        SourceTag::Other => None,
    }
}

/// Reads a raw feed batch (a JSON array) captured to disk.
pub fn load_feed_fixture(path: impl AsRef<Path>) -> Result<Vec<JsonValue>> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
