//! Core listing model shared by the matcher, normalizer and cache.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod dates;
pub mod geo;

pub use dates::{parse_date, sentinel_date, try_parse_date, ComparableDate};
pub use geo::{
    parse_rectangles, AreaUnit, CustomerProfile, GeoParseError, NumericRange, ProfileError,
    ProfileRow, RangeGeoMatcher, Rect, ZeroRangePolicy,
};

pub const CRATE_NAME: &str = "maemul-core";

/// Feed a record was drawn from. The wire names are consumed by the presentation layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceTag {
    LiveShop,
    LiveStudio,
    ConfirmationDesk,
    Recommendation,
    PersonalList,
    CompletedDeal,
    #[default]
    #[serde(other)]
    Other,
}

impl SourceTag {
    /// Every real feed, in fetch order.
    pub const FEEDS: [SourceTag; 6] = [
        SourceTag::LiveShop,
        SourceTag::LiveStudio,
        SourceTag::ConfirmationDesk,
        SourceTag::Recommendation,
        SourceTag::PersonalList,
        SourceTag::CompletedDeal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SourceTag::LiveShop => "live-shop",
            SourceTag::LiveStudio => "live-studio",
            SourceTag::ConfirmationDesk => "confirmation-desk",
            SourceTag::Recommendation => "recommendation",
            SourceTag::PersonalList => "personal-list",
            SourceTag::CompletedDeal => "completed-deal",
            SourceTag::Other => "other",
        }
    }

    pub fn parse(value: &str) -> SourceTag {
        SourceTag::FEEDS
            .into_iter()
            .find(|tag| tag.as_str() == value.trim())
            .unwrap_or(SourceTag::Other)
    }

    /// Display label used on screen.
    pub fn label(self) -> &'static str {
        match self {
            SourceTag::LiveShop => "상가",
            SourceTag::LiveStudio => "원룸",
            SourceTag::ConfirmationDesk => "확인",
            SourceTag::Recommendation => "추천",
            SourceTag::PersonalList => "개인",
            SourceTag::CompletedDeal => "완료",
            SourceTag::Other => "기타",
        }
    }

    /// Both live feeds are deduplicated against each other.
    pub fn is_live_inventory(self) -> bool {
        matches!(self, SourceTag::LiveShop | SourceTag::LiveStudio)
    }

    /// Position in the default composition order; lower comes first.
    pub fn precedence(self) -> u8 {
        match self {
            SourceTag::CompletedDeal => 0,
            SourceTag::PersonalList => 1,
            SourceTag::ConfirmationDesk => 2,
            SourceTag::Recommendation => 3,
            SourceTag::LiveShop | SourceTag::LiveStudio => 4,
            SourceTag::Other => 5,
        }
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListingStatus {
    Completed,
    Ended,
    EndingSoon,
    InService,
    #[default]
    NeedsReview,
    NewAd,
}

impl ListingStatus {
    pub fn label(self) -> &'static str {
        match self {
            ListingStatus::Completed => "완료",
            ListingStatus::Ended => "종료",
            ListingStatus::EndingSoon => "종료임박",
            ListingStatus::InService => "진행중",
            ListingStatus::NeedsReview => "확인필요",
            ListingStatus::NewAd => "신규",
        }
    }
}

/// One (business type, manager) pair contributed by a matching profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchTag {
    pub business: String,
    pub manager: String,
}

impl MatchTag {
    pub fn new(business: impl Into<String>, manager: impl Into<String>) -> Self {
        Self {
            business: business.into(),
            manager: manager.into(),
        }
    }

    /// Renders `"biz(manager), biz(manager)"` in arrival order, repeats included.
    pub fn summarize(tags: &[MatchTag]) -> String {
        tags.iter()
            .map(|t| format!("{}({})", t.business, t.manager))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Live inventory entry as served by the matcher service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyRecord {
    pub id: i64,
    pub region: String,
    pub parcel: String,
    pub unit: String,
    pub current_floor: Option<i32>,
    pub total_floor: Option<i32>,
    pub deposit: Option<i64>,
    pub monthly_rent: Option<i64>,
    pub management_fee: String,
    pub premium: String,
    pub current_use: String,
    /// Stored in square meters.
    pub area_sqm: Option<f64>,
    pub contact: String,
    pub listing_no_primary: Option<String>,
    pub listing_no_secondary: Option<String>,
    pub memo: String,
    pub manager: String,
    pub ad_start_date: Option<String>,
    pub ad_end_date: Option<String>,
    pub photo_path: String,
    pub owner_name: String,
    pub owner_relation: String,
    pub status_code: Option<i32>,
    pub lng: Option<f64>,
    pub lat: Option<f64>,
    /// Filled in by the matcher for search-derived rows.
    pub matched: Vec<MatchTag>,
}

impl PropertyRecord {
    pub fn address(&self) -> String {
        join_address(&self.region, &self.parcel)
    }

    pub fn is_top_floor(&self) -> bool {
        matches!((self.current_floor, self.total_floor), (Some(cur), Some(total)) if cur == total)
    }

    pub fn has_business(&self, business: &str) -> bool {
        self.matched.iter().any(|t| t.business == business)
    }
}

/// Region + parcel as one trimmed address string.
pub fn join_address(region: &str, parcel: &str) -> String {
    format!("{} {}", region.trim(), parcel.trim()).trim().to_string()
}

/// The common row shape every feed is normalized into.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UnifiedRow {
    pub source: SourceTag,
    pub address: String,
    pub unit: String,
    pub floor_current: String,
    pub floor_total: String,
    /// `"{cur}/{total}"`
    pub floor: String,
    pub deposit: Option<i64>,
    pub monthly_rent: Option<i64>,
    /// `"{deposit}/{rent}"`
    pub price: String,
    pub management_fee: String,
    pub premium: String,
    pub current_use: String,
    pub area_sqm: Option<f64>,
    /// `"{rooms}/{baths}"`
    pub rooms_baths: String,
    pub contact: String,
    pub listing_no_primary: Option<String>,
    pub listing_no_secondary: Option<String>,
    pub listing_number: String,
    pub memo: String,
    pub manager: String,
    pub ad_start_date: String,
    pub ad_end_date: String,
    pub photo_path: String,
    pub owner_name: String,
    pub owner_relation: String,
    pub status: ListingStatus,
    pub matched_pairs: Vec<MatchTag>,
}

impl UnifiedRow {
    pub fn identity_key(&self) -> IdentityKey {
        IdentityKey::of(self)
    }
}

/// Structural identity of a physical listing across re-advertisements.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    address: String,
    unit: String,
    floor_current: String,
    floor_total: String,
    deposit: Option<i64>,
    monthly_rent: Option<i64>,
    management_fee: String,
    premium: String,
    current_use: String,
    /// Hundredths of a square meter.
    area_centi_sqm: Option<i64>,
    contact: String,
    listing_no_primary: Option<String>,
    listing_no_secondary: Option<String>,
}

impl IdentityKey {
    pub fn of(row: &UnifiedRow) -> Self {
        Self {
            address: collapse_ws(&row.address),
            unit: collapse_ws(&row.unit),
            floor_current: collapse_ws(&row.floor_current),
            floor_total: collapse_ws(&row.floor_total),
            deposit: row.deposit,
            monthly_rent: row.monthly_rent,
            management_fee: collapse_ws(&row.management_fee),
            premium: collapse_ws(&row.premium),
            current_use: collapse_ws(&row.current_use),
            area_centi_sqm: row.area_sqm.map(|a| (a * 100.0).round() as i64),
            contact: collapse_ws(&row.contact),
            listing_no_primary: row.listing_no_primary.as_deref().map(collapse_ws),
            listing_no_secondary: row.listing_no_secondary.as_deref().map(collapse_ws),
        }
    }
}

fn collapse_ws(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(address: &str) -> UnifiedRow {
        UnifiedRow {
            source: SourceTag::LiveShop,
            address: address.to_string(),
            unit: "101".into(),
            deposit: Some(3000),
            monthly_rent: Some(50),
            area_sqm: Some(33.06),
            ..Default::default()
        }
    }

    #[test]
    fn identity_key_ignores_whitespace_noise_and_display_fields() {
        let a = row("역삼동  123-4");
        let mut b = row(" 역삼동 123-4 ");
        b.price = "3000 / 50".into();
        b.memo = "different memo".into();
        assert_eq!(a.identity_key(), b.identity_key());
    }

    #[test]
    fn identity_key_distinguishes_price() {
        let a = row("역삼동 123-4");
        let mut b = row("역삼동 123-4");
        b.monthly_rent = Some(55);
        assert_ne!(a.identity_key(), b.identity_key());
    }

    #[test]
    fn source_tag_round_trips_wire_names_and_unknowns() {
        let tag: SourceTag = serde_json::from_str("\"completed-deal\"").unwrap();
        assert_eq!(tag, SourceTag::CompletedDeal);
        let unknown: SourceTag = serde_json::from_str("\"legacy-feed\"").unwrap();
        assert_eq!(unknown, SourceTag::Other);
        assert_eq!(SourceTag::parse("recommendation"), SourceTag::Recommendation);
        assert_eq!(SourceTag::Recommendation.label(), "추천");
    }

    #[test]
    fn summarize_keeps_repeats_in_order() {
        let tags = vec![
            MatchTag::new("카페", "kim"),
            MatchTag::new("음식점", "lee"),
            MatchTag::new("카페", "kim"),
        ];
        assert_eq!(MatchTag::summarize(&tags), "카페(kim), 음식점(lee), 카페(kim)");
    }

    #[test]
    fn property_address_joins_region_and_parcel() {
        let record = PropertyRecord {
            region: " 역삼동".into(),
            parcel: "123-4 ".into(),
            ..Default::default()
        };
        assert_eq!(record.address(), "역삼동 123-4");
        let no_parcel = PropertyRecord {
            region: "역삼동".into(),
            ..Default::default()
        };
        assert_eq!(no_parcel.address(), "역삼동");
    }
}
