//! Raw record shapes, one per feed.
//!
//! Each feed is maintained by a different desk and carries its own field
//! names and encodings; they are kept apart here and only meet in
//! [`crate::normalize`].

use maemul_core::{MatchTag, PropertyRecord, SourceTag};
use serde::{Deserialize, Deserializer, Serialize};

/// Live studio entries are property records plus a room/bath count.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StudioRecord {
    #[serde(flatten)]
    pub property: PropertyRecord,
    #[serde(default)]
    pub rooms: Option<i32>,
    #[serde(default)]
    pub baths: Option<i32>,
}

/// Confirmation-desk entries: address already joined, floor typed as `"cur/total"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationRecord {
    pub address: String,
    pub unit: String,
    pub floor: String,
    #[serde(deserialize_with = "lenient_amount")]
    pub deposit: Option<i64>,
    #[serde(deserialize_with = "lenient_amount")]
    pub rent: Option<i64>,
    pub management_fee: String,
    pub premium: String,
    pub current_use: String,
    pub area_sqm: Option<f64>,
    pub contact: String,
    pub listing_no: Option<String>,
    pub memo: String,
    pub manager: String,
    pub confirmed_on: Option<String>,
    pub ad_end_date: Option<String>,
    pub owner_name: String,
    pub owner_relation: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendationRecord {
    pub region: String,
    pub parcel: String,
    pub unit: String,
    pub floor_current: Option<i32>,
    pub floor_total: Option<i32>,
    pub deposit: Option<i64>,
    pub monthly_rent: Option<i64>,
    pub management_fee: String,
    pub premium: String,
    pub current_use: String,
    pub area_sqm: Option<f64>,
    pub contact: String,
    pub listing_no_primary: Option<String>,
    pub listing_no_secondary: Option<String>,
    pub memo: String,
    pub manager: String,
    pub ad_start_date: Option<String>,
    pub ad_end_date: Option<String>,
    pub status_code: Option<i32>,
    pub photo_path: String,
    /// Customer address the recommendation was made for.
    pub customer_address: String,
    pub matched: Vec<MatchTag>,
}

/// An agent's own list. Area is typed in 평.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonalListRecord {
    pub address: String,
    pub unit: String,
    pub floor_current: String,
    pub floor_total: String,
    #[serde(deserialize_with = "lenient_amount")]
    pub deposit: Option<i64>,
    #[serde(deserialize_with = "lenient_amount")]
    pub rent: Option<i64>,
    pub management_fee: String,
    pub premium: String,
    pub current_use: String,
    pub area_pyeong: Option<f64>,
    pub contact: String,
    pub memo: String,
    pub manager: String,
    pub registered_on: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletedDealRecord {
    pub region: String,
    pub parcel: String,
    pub unit: String,
    pub floor_current: Option<i32>,
    pub floor_total: Option<i32>,
    pub deposit: Option<i64>,
    pub monthly_rent: Option<i64>,
    pub premium: String,
    pub current_use: String,
    pub area_sqm: Option<f64>,
    pub contact: String,
    pub listing_no_primary: Option<String>,
    pub listing_no_secondary: Option<String>,
    pub manager: String,
    pub contracted_on: Option<String>,
    pub closed_on: Option<String>,
    pub owner_name: String,
}

/// One raw record, tagged by the feed it came from.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceRecord {
    LiveShop(PropertyRecord),
    LiveStudio(StudioRecord),
    ConfirmationDesk(ConfirmationRecord),
    Recommendation(RecommendationRecord),
    PersonalList(PersonalListRecord),
    CompletedDeal(CompletedDealRecord),
}

impl SourceRecord {
    /// Decodes a raw JSON row as the shape `source` publishes.
    pub fn from_json(source: SourceTag, value: serde_json::Value) -> Result<Option<Self>, serde_json::Error> {
        Ok(Some(match source {
            SourceTag::LiveShop => SourceRecord::LiveShop(serde_json::from_value(value)?),
            SourceTag::LiveStudio => SourceRecord::LiveStudio(serde_json::from_value(value)?),
            SourceTag::ConfirmationDesk => SourceRecord::ConfirmationDesk(serde_json::from_value(value)?),
            SourceTag::Recommendation => SourceRecord::Recommendation(serde_json::from_value(value)?),
            SourceTag::PersonalList => SourceRecord::PersonalList(serde_json::from_value(value)?),
            SourceTag::CompletedDeal => SourceRecord::CompletedDeal(serde_json::from_value(value)?),
            SourceTag::Other => return Ok(None),
        }))
    }

    pub fn source(&self) -> SourceTag {
        match self {
            SourceRecord::LiveShop(_) => SourceTag::LiveShop,
            SourceRecord::LiveStudio(_) => SourceTag::LiveStudio,
            SourceRecord::ConfirmationDesk(_) => SourceTag::ConfirmationDesk,
            SourceRecord::Recommendation(_) => SourceTag::Recommendation,
            SourceRecord::PersonalList(_) => SourceTag::PersonalList,
            SourceRecord::CompletedDeal(_) => SourceTag::CompletedDeal,
        }
    }
}

/// Accepts `3000`, `"3000"`, `"3,000"` or blank.
fn lenient_amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<i64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Amount {
        Int(i64),
        Float(f64),
        Text(String),
    }
    Ok(match Option::<Amount>::deserialize(deserializer)? {
        Some(Amount::Int(v)) => Some(v),
        Some(Amount::Float(v)) if v.is_finite() => Some(v.round() as i64),
        Some(Amount::Float(_)) => None,
        Some(Amount::Text(s)) => {
            let digits: String = s.chars().filter(|c| !matches!(c, ',' | ' ')).collect();
            digits.parse().ok()
        }
        None => None,
    })
}
