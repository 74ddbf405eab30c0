//! Per-scope cache of the last matcher batch, filtered locally when it covers the request.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Days, Local, NaiveDate, Utc};
use maemul_core::{try_parse_date, CustomerProfile, PropertyRecord, RangeGeoMatcher, ZeroRangePolicy};
use maemul_storage::{FetchOutcome, FetchStatus, MatchRequest, ServiceClient};
use serde::Serialize;
use tracing::{debug, info};

/// Remote side of the cache: returns the full batch for a scope request.
#[async_trait]
pub trait BatchSource: Send + Sync {
    async fn fetch_batch(&self, request: &MatchRequest) -> FetchOutcome<PropertyRecord>;
}

#[async_trait]
impl BatchSource for ServiceClient {
    async fn fetch_batch(&self, request: &MatchRequest) -> FetchOutcome<PropertyRecord> {
        FetchOutcome::from_result(self.match_properties(request).await)
    }
}

/// What a caller asks the cache for.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListingFilter {
    pub profile: CustomerProfile,
    /// Earliest advertisement start date of interest.
    pub window_start: Option<NaiveDate>,
}

impl ListingFilter {
    pub fn new(profile: CustomerProfile) -> Self {
        Self {
            profile,
            window_start: None,
        }
    }

    pub fn starting(mut self, window_start: NaiveDate) -> Self {
        self.window_start = Some(window_start);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterCacheEntry {
    pub scope_key: String,
    pub fetched_at: DateTime<Utc>,
    pub window_start: Option<NaiveDate>,
    pub rows: Vec<PropertyRecord>,
    pub covered_regions: BTreeSet<String>,
    pub covered_business_types: BTreeSet<String>,
}

impl FilterCacheEntry {
    pub fn new(
        scope_key: impl Into<String>,
        window_start: Option<NaiveDate>,
        rows: Vec<PropertyRecord>,
    ) -> Self {
        let covered_regions = rows
            .iter()
            .map(|r| r.region.trim().to_string())
            .filter(|r| !r.is_empty())
            .collect();
        let covered_business_types = rows
            .iter()
            .flat_map(|r| r.matched.iter().map(|t| t.business.trim().to_string()))
            .filter(|b| !b.is_empty())
            .collect();
        Self {
            scope_key: scope_key.into(),
            fetched_at: Utc::now(),
            window_start,
            rows,
            covered_regions,
            covered_business_types,
        }
    }

    /// Region or business value referenced by `filter` that this batch never saw.
    fn uncovered(&self, filter: &ListingFilter) -> Option<String> {
        let profile = &filter.profile;
        profile
            .regions
            .iter()
            .find(|r| !self.covered_regions.contains(r.trim()))
            .or_else(|| {
                profile
                    .business_types
                    .iter()
                    .find(|b| !self.covered_business_types.contains(b.trim()))
            })
            .cloned()
    }

    fn covers_window(&self, window_start: Option<NaiveDate>) -> bool {
        match (self.window_start, window_start) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(cached), Some(requested)) => requested >= cached,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "reason", content = "detail")]
pub enum RefetchReason {
    Empty,
    CoverageMiss(String),
    Refresh,
    StaleWindow,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Served {
    Local,
    Remote(RefetchReason),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheResponse {
    pub rows: Vec<PropertyRecord>,
    pub served: Served,
    pub status: FetchStatus,
    pub message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LocalFilterCache {
    scope_key: String,
    request: MatchRequest,
    gate: RangeGeoMatcher,
    staleness_days: u64,
    entry: Option<FilterCacheEntry>,
}

impl LocalFilterCache {
    /// `request` is the scope's base matcher request; its start window is set per fetch.
    pub fn new(scope_key: impl Into<String>, request: MatchRequest) -> Self {
        Self {
            scope_key: scope_key.into(),
            request,
            gate: RangeGeoMatcher::default(),
            staleness_days: 31,
            entry: None,
        }
    }

    pub fn with_zero_range(mut self, policy: ZeroRangePolicy) -> Self {
        self.gate = RangeGeoMatcher::new(policy);
        self
    }

    pub fn with_staleness_days(mut self, days: u64) -> Self {
        self.staleness_days = days;
        self
    }

    pub fn scope_key(&self) -> &str {
        &self.scope_key
    }

    pub fn entry(&self) -> Option<&FilterCacheEntry> {
        self.entry.as_ref()
    }

    /// Replaces the whole batch.
    pub fn populate(&mut self, window_start: Option<NaiveDate>, rows: Vec<PropertyRecord>) {
        let entry = FilterCacheEntry::new(self.scope_key.clone(), window_start, rows);
        debug!(
            scope = %self.scope_key,
            rows = entry.rows.len(),
            regions = entry.covered_regions.len(),
            business_types = entry.covered_business_types.len(),
            "cache populated"
        );
        self.entry = Some(entry);
    }

    pub fn invalidate(&mut self) {
        debug!(scope = %self.scope_key, "cache invalidated");
        self.entry = None;
    }

    pub async fn request(&mut self, source: &dyn BatchSource, filter: &ListingFilter) -> CacheResponse {
        self.request_on(source, filter, Local::now().date_naive()).await
    }

    pub async fn request_on(
        &mut self,
        source: &dyn BatchSource,
        filter: &ListingFilter,
        today: NaiveDate,
    ) -> CacheResponse {
        match self.refetch_reason(filter, today) {
            None => {
                let rows = self.apply_local(filter);
                debug!(scope = %self.scope_key, rows = rows.len(), "served from cache");
                CacheResponse {
                    rows,
                    served: Served::Local,
                    status: FetchStatus::Ok,
                    message: None,
                }
            }
            Some(reason) => self.refetch(source, filter, reason).await,
        }
    }

    /// Explicit user refresh: always goes remote.
    pub async fn refresh(&mut self, source: &dyn BatchSource, filter: &ListingFilter) -> CacheResponse {
        self.refetch(source, filter, RefetchReason::Refresh).await
    }

    fn refetch_reason(&self, filter: &ListingFilter, today: NaiveDate) -> Option<RefetchReason> {
        let Some(entry) = &self.entry else {
            return Some(RefetchReason::Empty);
        };
        // Only a changed window can trip the staleness threshold.
        if let Some(start) = filter.window_start.filter(|s| entry.window_start != Some(*s)) {
            let threshold = today
                .checked_sub_days(Days::new(self.staleness_days))
                .unwrap_or(NaiveDate::MIN);
            if start < threshold {
                return Some(RefetchReason::StaleWindow);
            }
        }
        if !entry.covers_window(filter.window_start) {
            return Some(RefetchReason::StaleWindow);
        }
        entry.uncovered(filter).map(RefetchReason::CoverageMiss)
    }

    async fn refetch(
        &mut self,
        source: &dyn BatchSource,
        filter: &ListingFilter,
        reason: RefetchReason,
    ) -> CacheResponse {
        let mut request = self.request.clone();
        request.start_from = filter.window_start;
        info!(scope = %self.scope_key, ?reason, "refetching batch");

        let outcome = source.fetch_batch(&request).await;
        if !outcome.is_ok() {
            // The previous batch stays in place.
            return CacheResponse {
                rows: Vec::new(),
                served: Served::Remote(reason),
                status: outcome.status,
                message: outcome.message,
            };
        }
        self.populate(filter.window_start, outcome.rows);
        CacheResponse {
            rows: self.apply_local(filter),
            served: Served::Remote(reason),
            status: FetchStatus::Ok,
            message: None,
        }
    }

    fn apply_local(&self, filter: &ListingFilter) -> Vec<PropertyRecord> {
        let Some(entry) = &self.entry else {
            return Vec::new();
        };
        entry
            .rows
            .iter()
            .filter(|row| self.admits(row, filter))
            .cloned()
            .collect()
    }

    fn admits(&self, row: &PropertyRecord, filter: &ListingFilter) -> bool {
        if !self.gate.matches(row, &filter.profile) {
            return false;
        }
        let business = &filter.profile.business_types;
        if !business.is_empty() && !business.iter().any(|b| row.has_business(b.trim())) {
            return false;
        }
        match filter.window_start {
            None => true,
            Some(start) => row
                .ad_start_date
                .as_deref()
                .and_then(try_parse_date)
                .is_some_and(|dt| dt.date() >= start),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maemul_core::{MatchTag, NumericRange};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedSource {
        batch: Mutex<Vec<PropertyRecord>>,
        calls: AtomicUsize,
        fail: Mutex<bool>,
    }

    impl ScriptedSource {
        fn new(batch: Vec<PropertyRecord>) -> Self {
            Self {
                batch: Mutex::new(batch),
                calls: AtomicUsize::new(0),
                fail: Mutex::new(false),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BatchSource for ScriptedSource {
        async fn fetch_batch(&self, _request: &MatchRequest) -> FetchOutcome<PropertyRecord> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if *self.fail.lock().unwrap() {
                return FetchOutcome::failed(FetchStatus::TimedOut, "timed out");
            }
            FetchOutcome::ok(self.batch.lock().unwrap().clone())
        }
    }

    fn row(id: i64, region: &str, deposit: i64, biz: &str, start: &str) -> PropertyRecord {
        PropertyRecord {
            id,
            region: region.into(),
            deposit: Some(deposit),
            ad_start_date: Some(start.into()),
            matched: vec![MatchTag::new(biz, "kim")],
            ..Default::default()
        }
    }

    fn batch() -> Vec<PropertyRecord> {
        vec![
            row(1, "역삼동", 1000, "카페", "2024-06-01"),
            row(2, "역삼동", 4000, "음식점", "2024-06-05"),
            row(3, "논현동", 2000, "카페", "2024-05-20"),
        ]
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 10).unwrap()
    }

    fn filter(regions: &[&str], business: &[&str], max_deposit: i64) -> ListingFilter {
        ListingFilter::new(CustomerProfile {
            deposit: NumericRange::new(None, Some(max_deposit)),
            regions: regions.iter().map(|s| s.to_string()).collect(),
            business_types: business.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        })
    }

    fn ids(rows: &[PropertyRecord]) -> Vec<i64> {
        rows.iter().map(|r| r.id).collect()
    }

    #[tokio::test]
    async fn first_request_fetches_then_covered_requests_stay_local() {
        let source = ScriptedSource::new(batch());
        let mut cache = LocalFilterCache::new("manager:kim", MatchRequest::default());

        let first = cache.request_on(&source, &filter(&[], &[], 5000), today()).await;
        assert_eq!(first.served, Served::Remote(RefetchReason::Empty));
        assert_eq!(ids(&first.rows), vec![1, 2, 3]);

        let second = cache
            .request_on(&source, &filter(&["역삼동"], &["카페"], 5000), today())
            .await;
        assert_eq!(second.served, Served::Local);
        assert_eq!(ids(&second.rows), vec![1]);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn local_result_equals_fresh_remote_result() {
        let source = ScriptedSource::new(batch());
        let f = filter(&["역삼동", "논현동"], &["카페"], 2500).starting(NaiveDate::from_ymd_opt(2024, 5, 15).unwrap());

        let mut warm = LocalFilterCache::new("s", MatchRequest::default());
        warm.request_on(&source, &filter(&[], &[], 9999), today()).await;
        let local = warm.request_on(&source, &f, today()).await;
        assert_eq!(local.served, Served::Local);

        let mut cold = LocalFilterCache::new("s", MatchRequest::default());
        let remote = cold.request_on(&source, &f, today()).await;
        assert!(matches!(remote.served, Served::Remote(_)));
        assert_eq!(local.rows, remote.rows);
        assert_eq!(ids(&local.rows), vec![1, 3]);
    }

    #[tokio::test]
    async fn unseen_region_or_business_forces_refetch() {
        let source = ScriptedSource::new(batch());
        let mut cache = LocalFilterCache::new("s", MatchRequest::default());
        cache.request_on(&source, &filter(&[], &[], 5000), today()).await;

        let resp = cache.request_on(&source, &filter(&["신사동"], &[], 5000), today()).await;
        assert_eq!(resp.served, Served::Remote(RefetchReason::CoverageMiss("신사동".into())));

        let resp = cache.request_on(&source, &filter(&[], &["학원"], 5000), today()).await;
        assert_eq!(resp.served, Served::Remote(RefetchReason::CoverageMiss("학원".into())));
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test]
    async fn old_or_wider_windows_reload() {
        let source = ScriptedSource::new(batch());
        let mut cache = LocalFilterCache::new("s", MatchRequest::default());
        let june = filter(&[], &[], 5000).starting(NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        cache.request_on(&source, &june, today()).await;

        let may = filter(&[], &[], 5000).starting(NaiveDate::from_ymd_opt(2024, 5, 20).unwrap());
        let resp = cache.request_on(&source, &may, today()).await;
        assert_eq!(resp.served, Served::Remote(RefetchReason::StaleWindow));

        let april = filter(&[], &[], 5000).starting(NaiveDate::from_ymd_opt(2024, 4, 1).unwrap());
        let resp = cache.request_on(&source, &april, today()).await;
        assert_eq!(resp.served, Served::Remote(RefetchReason::StaleWindow));

        // Moving to a different window older than 31 days reloads even though April covers it.
        let mid_april = filter(&[], &[], 5000).starting(NaiveDate::from_ymd_opt(2024, 4, 15).unwrap());
        let resp = cache.request_on(&source, &mid_april, today()).await;
        assert_eq!(resp.served, Served::Remote(RefetchReason::StaleWindow), "older than 31 days");
        assert_eq!(source.calls(), 4);
    }

    #[tokio::test]
    async fn repeating_an_old_window_stays_local() {
        let source = ScriptedSource::new(batch());
        let mut cache = LocalFilterCache::new("s", MatchRequest::default());
        let april = filter(&[], &[], 5000).starting(NaiveDate::from_ymd_opt(2024, 4, 1).unwrap());

        let first = cache.request_on(&source, &april, today()).await;
        assert_eq!(first.served, Served::Remote(RefetchReason::Empty));
        for _ in 0..3 {
            let again = cache.request_on(&source, &april, today()).await;
            assert_eq!(again.served, Served::Local);
            assert_eq!(ids(&again.rows), vec![1, 2, 3]);
        }
        assert_eq!(source.calls(), 1);

        let narrowed = filter(&["역삼동"], &[], 5000).starting(NaiveDate::from_ymd_opt(2024, 4, 1).unwrap());
        let resp = cache.request_on(&source, &narrowed, today()).await;
        assert_eq!(resp.served, Served::Local);
        assert_eq!(ids(&resp.rows), vec![1, 2]);
    }

    #[tokio::test]
    async fn refresh_replaces_the_whole_batch() {
        let source = ScriptedSource::new(batch());
        let mut cache = LocalFilterCache::new("s", MatchRequest::default());
        cache.request_on(&source, &filter(&[], &[], 5000), today()).await;

        *source.batch.lock().unwrap() = vec![row(9, "역삼동", 100, "카페", "2024-06-09")];
        let resp = cache.refresh(&source, &filter(&[], &[], 5000)).await;
        assert_eq!(resp.served, Served::Remote(RefetchReason::Refresh));
        assert_eq!(ids(&resp.rows), vec![9]);
        let entry = cache.entry().unwrap();
        assert_eq!(ids(&entry.rows), vec![9]);
        assert!(!entry.covered_regions.contains("논현동"));
    }

    #[tokio::test]
    async fn failed_refetch_keeps_previous_entry() {
        let source = ScriptedSource::new(batch());
        let mut cache = LocalFilterCache::new("s", MatchRequest::default());
        cache.request_on(&source, &filter(&[], &[], 5000), today()).await;

        *source.fail.lock().unwrap() = true;
        let resp = cache.refresh(&source, &filter(&[], &[], 5000)).await;
        assert!(resp.rows.is_empty());
        assert_eq!(resp.status, FetchStatus::TimedOut);
        assert_eq!(cache.entry().unwrap().rows.len(), 3);

        cache.invalidate();
        assert!(cache.entry().is_none());
    }
}
