//! Customer profile × property matching with per-property tag aggregation.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use maemul_core::{
    try_parse_date, CustomerProfile, MatchTag, ProfileRow, PropertyRecord, RangeGeoMatcher,
    ZeroRangePolicy,
};
use maemul_storage::{InventoryStore, PropertyQuery};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Matching tags per property id, in profile iteration order.
pub type AggregatedTags = BTreeMap<i64, Vec<MatchTag>>;

/// Inclusive advertisement start-date window. Either side may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartDateWindow {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
}

impl StartDateWindow {
    pub fn new(from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        Self { from, to }
    }

    pub fn is_active(&self) -> bool {
        self.from.is_some() || self.to.is_some()
    }

    /// Rows without a readable start date never pass an active window.
    pub fn admits(&self, ad_start_date: Option<&str>) -> bool {
        if !self.is_active() {
            return true;
        }
        let Some(start) = ad_start_date.and_then(try_parse_date).map(|dt| dt.date()) else {
            return false;
        };
        self.from.map_or(true, |from| start >= from) && self.to.map_or(true, |to| start <= to)
    }
}

pub fn apply_start_date_window(rows: Vec<PropertyRecord>, window: &StartDateWindow) -> Vec<PropertyRecord> {
    if !window.is_active() {
        return rows;
    }
    rows.into_iter()
        .filter(|row| window.admits(row.ad_start_date.as_deref()))
        .collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CustomerPropertyMatcher {
    gate: RangeGeoMatcher,
}

impl CustomerPropertyMatcher {
    pub fn new(zero_range: ZeroRangePolicy) -> Self {
        Self {
            gate: RangeGeoMatcher::new(zero_range),
        }
    }

    pub fn zero_range(&self) -> ZeroRangePolicy {
        self.gate.zero_range
    }

    /// Runs every profile against every property.
    pub fn match_all(&self, properties: &[PropertyRecord], profiles: &[ProfileRow]) -> AggregatedTags {
        let mut tags = AggregatedTags::new();
        for row in profiles {
            let Some(profile) = parse_profile(row) else {
                continue;
            };
            let hits = properties.iter().filter(|p| self.gate.matches(p, &profile));
            for property in hits {
                append_tags(&mut tags, property.id, &profile);
            }
        }
        tags
    }

    /// Pushes each profile's ranges into the store, then re-validates with the gate.
    ///
    /// Returns the matched properties (ordered by id) with their tags attached.
    pub async fn match_from_store(
        &self,
        store: &dyn InventoryStore,
        profiles: &[ProfileRow],
        window: &StartDateWindow,
    ) -> Vec<PropertyRecord> {
        let mut tags = AggregatedTags::new();
        let mut found: BTreeMap<i64, PropertyRecord> = BTreeMap::new();

        for row in profiles {
            let Some(profile) = parse_profile(row) else {
                continue;
            };
            let query = PropertyQuery::from_profile(&profile, self.gate.zero_range);
            let candidates = match store.query_properties(&query).await {
                Ok(candidates) => candidates,
                Err(err) => {
                    warn!(profile_id = profile.id, error = %err, "property query failed; no matches for profile");
                    continue;
                }
            };
            let before = candidates.len();
            let mut matched = 0usize;
            for property in candidates {
                if !self.gate.matches(&property, &profile) {
                    continue;
                }
                matched += 1;
                append_tags(&mut tags, property.id, &profile);
                found.entry(property.id).or_insert(property);
            }
            debug!(profile_id = profile.id, candidates = before, matched, "profile matched");
        }

        let rows = attach_tags(found.into_values().collect(), &tags);
        let rows = apply_start_date_window(rows, window);
        info!(profiles = profiles.len(), matched = rows.len(), "matching pass finished");
        rows
    }
}

/// Writes aggregated tags onto the matching properties, dropping the rest.
pub fn attach_tags(properties: Vec<PropertyRecord>, tags: &AggregatedTags) -> Vec<PropertyRecord> {
    properties
        .into_iter()
        .filter_map(|mut property| {
            let matched = tags.get(&property.id)?;
            property.matched = matched.clone();
            Some(property)
        })
        .collect()
}

fn parse_profile(row: &ProfileRow) -> Option<CustomerProfile> {
    match CustomerProfile::from_row(row) {
        Ok(profile) => Some(profile),
        Err(err) => {
            warn!(profile_id = row.id, error = %err, "skipping profile with unreadable geography");
            None
        }
    }
}

/// One tag per business type; a profile without business types still tags its matches.
fn append_tags(tags: &mut AggregatedTags, property_id: i64, profile: &CustomerProfile) {
    let entry = tags.entry(property_id).or_default();
    if profile.business_types.is_empty() {
        entry.push(MatchTag::new("", profile.manager.clone()));
        return;
    }
    entry.extend(
        profile
            .business_types
            .iter()
            .map(|biz| MatchTag::new(biz.clone(), profile.manager.clone())),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use maemul_core::SourceTag;
    use maemul_storage::{InventoryFile, MemoryInventory, ProfileScope, StoreError};
    use serde_json::Value as JsonValue;

    fn property(id: i64, region: &str, deposit: i64) -> PropertyRecord {
        PropertyRecord {
            id,
            region: region.into(),
            deposit: Some(deposit),
            monthly_rent: Some(100),
            area_sqm: Some(33.0),
            current_floor: Some(2),
            total_floor: Some(2),
            ..Default::default()
        }
    }

    fn profile_row(id: i64, manager: &str, biz: &str, dong: &str) -> ProfileRow {
        ProfileRow {
            id,
            manager: manager.into(),
            deposit_min: Some(0),
            deposit_max: Some(5000),
            biz_type: biz.into(),
            dong: dong.into(),
            ..Default::default()
        }
    }

    #[test]
    fn tags_aggregate_additively_across_profiles() {
        let properties = vec![property(1, "역삼동", 3000), property(2, "논현동", 3000), property(3, "역삼동", 9000)];
        let profiles = vec![
            profile_row(10, "kim", "카페|음식점", "역삼동"),
            profile_row(11, "lee", "카페", ""),
            profile_row(12, "kim", "카페", "역삼동"),
        ];
        let tags = CustomerPropertyMatcher::default().match_all(&properties, &profiles);
        assert_eq!(
            MatchTag::summarize(&tags[&1]),
            "카페(kim), 음식점(kim), 카페(lee), 카페(kim)"
        );
        assert_eq!(MatchTag::summarize(&tags[&2]), "카페(lee)");
        assert!(!tags.contains_key(&3));
    }

    #[test]
    fn bad_geography_skips_only_that_profile() {
        let properties = vec![property(1, "역삼동", 3000)];
        let mut broken = profile_row(10, "kim", "카페", "");
        broken.rectangles = "[[1,2,3]]".into();
        let profiles = vec![broken, profile_row(11, "lee", "음식점", "")];
        let tags = CustomerPropertyMatcher::default().match_all(&properties, &profiles);
        assert_eq!(tags[&1], vec![MatchTag::new("음식점", "lee")]);
    }

    #[test]
    fn start_date_window_is_inclusive_and_excludes_missing() {
        let window = StartDateWindow::new(NaiveDate::from_ymd_opt(2024, 6, 1), NaiveDate::from_ymd_opt(2024, 6, 30));
        assert!(window.admits(Some("2024-06-01")));
        assert!(window.admits(Some("2024. 06. 30")));
        assert!(!window.admits(Some("2024-07-01")));
        assert!(!window.admits(None));
        assert!(!window.admits(Some("soon")));
        assert!(StartDateWindow::default().admits(None));
    }

    #[tokio::test]
    async fn store_prefilter_then_gate_revalidates_top_floor() {
        let mut lower = property(2, "역삼동", 3000);
        lower.current_floor = Some(1);
        let store = MemoryInventory::new(InventoryFile {
            properties: vec![property(1, "역삼동", 3000), lower, property(3, "논현동", 3000)],
            ..Default::default()
        });
        let mut row = profile_row(10, "kim", "카페", "역삼동");
        row.is_top_floor = true;
        let rows = CustomerPropertyMatcher::default()
            .match_from_store(&store, &[row], &StartDateWindow::default())
            .await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 1);
        assert_eq!(rows[0].matched, vec![MatchTag::new("카페", "kim")]);
    }

    struct FailingStore;

    #[async_trait]
    impl InventoryStore for FailingStore {
        async fn query_properties(&self, _query: &PropertyQuery) -> Result<Vec<PropertyRecord>, StoreError> {
            Err(StoreError::Json(serde_json::from_str::<JsonValue>("{").unwrap_err()))
        }

        async fn load_profiles(&self, _scope: &ProfileScope) -> Result<Vec<ProfileRow>, StoreError> {
            Ok(Vec::new())
        }

        async fn feed_batch(&self, _source: SourceTag) -> Result<Vec<JsonValue>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn store_failure_counts_as_no_matches() {
        let rows = CustomerPropertyMatcher::default()
            .match_from_store(&FailingStore, &[profile_row(1, "kim", "카페", "")], &StartDateWindow::default())
            .await;
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn store_and_in_memory_paths_agree() {
        let properties: Vec<PropertyRecord> = (0..30)
            .map(|i| {
                let mut p = property(i, if i % 2 == 0 { "역삼동" } else { "논현동" }, i * 300);
                p.area_sqm = Some(10.0 + i as f64 * 2.0);
                p
            })
            .collect();
        let mut wide = profile_row(1, "kim", "카페", "역삼동");
        wide.area_min = Some(5.0);
        wide.area_max = Some(15.0);
        let profiles = vec![wide, profile_row(2, "lee", "", "")];

        let matcher = CustomerPropertyMatcher::default();
        let tags = matcher.match_all(&properties, &profiles);
        let expected = attach_tags(properties.clone(), &tags);

        let store = MemoryInventory::new(InventoryFile {
            properties,
            ..Default::default()
        });
        let from_store = matcher
            .match_from_store(&store, &profiles, &StartDateWindow::default())
            .await;
        assert_eq!(from_store, expected);
    }
}
