//! Fetch → normalize → compose for the unified view.

use std::sync::Arc;

use maemul_adapters::{adapter_for_source, FeedTransport, NormalizeOptions};
use maemul_core::{SourceTag, UnifiedRow};
use maemul_storage::FetchStatus;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::compose::{CompositionMode, CompositionOrderer};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailedSource {
    pub source: SourceTag,
    pub status: FetchStatus,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UnifiedView {
    pub rows: Vec<UnifiedRow>,
    pub failed_sources: Vec<FailedSource>,
}

pub struct UnifiedViewPipeline {
    transport: Arc<dyn FeedTransport>,
    sources: Vec<SourceTag>,
    options: NormalizeOptions,
    pool: Arc<Semaphore>,
    orderer: CompositionOrderer,
}

impl UnifiedViewPipeline {
    pub fn new(transport: Arc<dyn FeedTransport>, options: NormalizeOptions, concurrency: usize) -> Self {
        Self {
            transport,
            sources: SourceTag::FEEDS.to_vec(),
            options,
            pool: Arc::new(Semaphore::new(concurrency.max(1))),
            orderer: CompositionOrderer::new(),
        }
    }

    pub fn with_sources(mut self, sources: Vec<SourceTag>) -> Self {
        self.sources = sources;
        self
    }

    /// Every enabled feed is fetched concurrently; a failed feed contributes no rows.
    pub async fn run(&self, mode: &CompositionMode) -> UnifiedView {
        let run_id = Uuid::new_v4();
        let span = info_span!("unified_view", %run_id, sources = self.sources.len());
        async {
            let mut tasks = JoinSet::new();
            for (slot, &source) in self.sources.iter().enumerate() {
                let Some(adapter) = adapter_for_source(source) else {
                    warn!(%source, "no adapter registered");
                    continue;
                };
                let transport = Arc::clone(&self.transport);
                let pool = Arc::clone(&self.pool);
                let options = self.options;
                tasks.spawn(
                    async move {
                        let loaded = match pool.acquire_owned().await {
                            Ok(_permit) => adapter.load(transport.as_ref(), &options).await,
                            Err(_) => Err(maemul_adapters::AdapterError::Message("worker pool closed".into())),
                        };
                        (slot, source, loaded)
                    }
                    .in_current_span(),
                );
            }

            let mut per_source: Vec<(usize, Vec<UnifiedRow>)> = Vec::with_capacity(self.sources.len());
            let mut failed_sources = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((slot, _, Ok(rows))) => per_source.push((slot, rows)),
                    Ok((_, source, Err(err))) => {
                        warn!(%source, error = %err, "feed failed, continuing without it");
                        failed_sources.push(FailedSource {
                            source,
                            status: err.status(),
                            message: err.to_string(),
                        });
                    }
                    Err(err) => warn!(error = %err, "feed task aborted"),
                }
            }

            // Arrival order follows the configured source order, not completion order.
            per_source.sort_by_key(|(slot, _)| *slot);
            failed_sources.sort_by_key(|f| f.source);
            let rows: Vec<UnifiedRow> = per_source.into_iter().flat_map(|(_, rows)| rows).collect();
            let fetched = rows.len();
            let rows = self.orderer.compose(rows, mode);
            info!(fetched, composed = rows.len(), failed = failed_sources.len(), "unified view ready");
            UnifiedView { rows, failed_sources }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use maemul_adapters::AdapterError;
    use maemul_storage::{InventoryFile, MemoryInventory};
    use serde_json::{json, Value as JsonValue};
    use std::collections::BTreeMap;

    fn options() -> NormalizeOptions {
        NormalizeOptions::new(NaiveDate::from_ymd_opt(2024, 6, 10).unwrap())
    }

    fn inventory() -> MemoryInventory {
        MemoryInventory::new(InventoryFile {
            feeds: BTreeMap::from([
                (
                    SourceTag::LiveShop,
                    vec![
                        json!({"id": 1, "region": "역삼동", "parcel": "1", "deposit": 1000, "ad_end_date": "2024-01-10"}),
                        json!({"id": 2, "region": "역삼동", "parcel": "1", "deposit": 1000, "ad_end_date": "2024-02-01"}),
                    ],
                ),
                (
                    SourceTag::Recommendation,
                    vec![json!({"region": "논현동", "parcel": "2", "ad_end_date": "2024-06-30"})],
                ),
                (
                    SourceTag::CompletedDeal,
                    vec![json!({"region": "도곡동", "parcel": "3", "closed_on": "2024-05-01"})],
                ),
            ]),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn default_view_orders_by_precedence_and_dedupes_live() {
        let pipeline = UnifiedViewPipeline::new(Arc::new(inventory()), options(), 2);
        let view = pipeline.run(&CompositionMode::Default).await;
        assert!(view.failed_sources.is_empty());
        let sources: Vec<SourceTag> = view.rows.iter().map(|r| r.source).collect();
        assert_eq!(
            sources,
            vec![SourceTag::CompletedDeal, SourceTag::Recommendation, SourceTag::LiveShop]
        );
        assert_eq!(view.rows[2].ad_end_date, "2024-02-01");
    }

    struct FlakyTransport {
        inner: MemoryInventory,
    }

    #[async_trait]
    impl FeedTransport for FlakyTransport {
        async fn feed(&self, source: SourceTag) -> Result<Vec<JsonValue>, AdapterError> {
            if source == SourceTag::Recommendation {
                return Err(AdapterError::Message("recommendation desk offline".into()));
            }
            self.inner.feed(source).await
        }
    }

    #[tokio::test]
    async fn failed_feed_is_reported_and_skipped() {
        let transport = Arc::new(FlakyTransport { inner: inventory() });
        let pipeline = UnifiedViewPipeline::new(transport, options(), 4);
        let view = pipeline.run(&CompositionMode::Default).await;
        assert_eq!(view.failed_sources.len(), 1);
        assert_eq!(view.failed_sources[0].source, SourceTag::Recommendation);
        assert_eq!(view.failed_sources[0].status, FetchStatus::Failed);
        assert_eq!(view.rows.len(), 2);
    }

    #[tokio::test]
    async fn selection_mode_drops_unselected_addresses() {
        let pipeline = UnifiedViewPipeline::new(Arc::new(inventory()), options(), 1)
            .with_sources(vec![SourceTag::LiveShop, SourceTag::CompletedDeal, SourceTag::Recommendation]);
        let mode = CompositionMode::MultiSelection(vec!["역삼동 1".into()]);
        let view = pipeline.run(&mode).await;
        let addresses: Vec<&str> = view.rows.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(addresses, vec!["논현동 2", "역삼동 1"]);
    }
}
