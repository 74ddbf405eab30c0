//! Matching, deduplication, composition and caching on top of the adapters.

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use maemul_adapters::{ListingNumberStyle, NormalizeOptions};
use maemul_core::ZeroRangePolicy;
use maemul_storage::ServiceClientConfig;
use tracing::warn;

pub mod cache;
pub mod compose;
pub mod dedupe;
pub mod matcher;
pub mod pipeline;
pub mod session;

pub use cache::{
    BatchSource, CacheResponse, FilterCacheEntry, ListingFilter, LocalFilterCache, RefetchReason, Served,
};
pub use compose::{CompositionMode, CompositionOrderer};
pub use dedupe::{dedupe, sort_by_end_date_desc, Deduplicator};
pub use matcher::{apply_start_date_window, attach_tags, AggregatedTags, CustomerPropertyMatcher, StartDateWindow};
pub use pipeline::{FailedSource, UnifiedView, UnifiedViewPipeline};
pub use session::{Delivery, ScopeSession, ScopedFilterCache, SessionError};

pub const CRATE_NAME: &str = "maemul-sync";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub service_url: String,
    pub http_timeout_secs: u64,
    pub light_timeout_secs: u64,
    pub worker_concurrency: usize,
    pub cache_staleness_days: u64,
    pub ending_soon_days: u64,
    pub zero_range: ZeroRangePolicy,
    pub user_agent: String,
    pub database_url: Option<String>,
    pub inventory_path: PathBuf,
    pub web_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_url: "http://127.0.0.1:8000".to_string(),
            http_timeout_secs: 20,
            light_timeout_secs: 5,
            worker_concurrency: 4,
            cache_staleness_days: 31,
            ending_soon_days: 6,
            zero_range: ZeroRangePolicy::Exact,
            user_agent: "maemul/0.1".to_string(),
            database_url: None,
            inventory_path: PathBuf::from("./inventory.json"),
            web_port: 8000,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key lookup; unset or unparsable keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let num = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let zero_range = match lookup("MAEMUL_ZERO_RANGE") {
            Some(raw) => ZeroRangePolicy::parse(&raw).unwrap_or_else(|| {
                warn!(value = %raw, "unknown MAEMUL_ZERO_RANGE, using exact");
                ZeroRangePolicy::Exact
            }),
            None => d.zero_range,
        };
        Self {
            service_url: lookup("MAEMUL_SERVICE_URL").unwrap_or(d.service_url),
            http_timeout_secs: num("MAEMUL_HTTP_TIMEOUT_SECS", d.http_timeout_secs),
            light_timeout_secs: num("MAEMUL_LIGHT_TIMEOUT_SECS", d.light_timeout_secs),
            worker_concurrency: num("MAEMUL_WORKER_CONCURRENCY", d.worker_concurrency as u64).max(1) as usize,
            cache_staleness_days: num("MAEMUL_CACHE_STALENESS_DAYS", d.cache_staleness_days),
            ending_soon_days: num("MAEMUL_ENDING_SOON_DAYS", d.ending_soon_days),
            zero_range,
            user_agent: lookup("MAEMUL_USER_AGENT").unwrap_or(d.user_agent),
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            inventory_path: lookup("MAEMUL_INVENTORY_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.inventory_path),
            web_port: lookup("MAEMUL_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(d.web_port),
        }
    }

    pub fn service_client_config(&self) -> ServiceClientConfig {
        ServiceClientConfig {
            base_url: self.service_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs),
            light_timeout: Duration::from_secs(self.light_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            concurrency: self.worker_concurrency,
        }
    }

    pub fn normalize_options(&self, today: NaiveDate, style: ListingNumberStyle) -> NormalizeOptions {
        NormalizeOptions::new(today)
            .with_style(style)
            .with_ending_soon_days(self.ending_soon_days)
    }

    pub fn matcher(&self) -> CustomerPropertyMatcher {
        CustomerPropertyMatcher::new(self.zero_range)
    }
}
