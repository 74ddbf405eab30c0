//! Customer profiles and the range/geography gate.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::PropertyRecord;

/// Square meters per pyeong (평).
pub const SQM_PER_PYEONG: f64 = 3.305785;

#[derive(Debug, Error)]
pub enum GeoParseError {
    #[error("rectangles payload is not a JSON array of [lng, lat, lng, lat]: {0}")]
    Json(#[from] serde_json::Error),
    #[error("rectangle {index} has {len} coordinates, expected 4")]
    Arity { index: usize, len: usize },
    #[error("rectangle {index} contains a non-finite coordinate")]
    NonFinite { index: usize },
}

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile {id}: {source}")]
    Geography {
        id: i64,
        #[source]
        source: GeoParseError,
    },
}

/// How a legacy `0..=0` range is read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ZeroRangePolicy {
    /// Compare literally: `0..=0` admits only zero.
    #[default]
    Exact,
    /// A `0..=0` pair means "no filter on this range".
    ///
    /// Widening away from `0..=0` is not monotonic here: `0..=0` admits every
    /// value, while `0..=100` admits only values up to 100.
    Unbounded,
}

impl ZeroRangePolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "exact" => Some(Self::Exact),
            "unbounded" => Some(Self::Unbounded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AreaUnit {
    #[default]
    Pyeong,
    Sqm,
}

impl AreaUnit {
    pub fn from_sqm(self, sqm: f64) -> f64 {
        match self {
            AreaUnit::Pyeong => sqm / SQM_PER_PYEONG,
            AreaUnit::Sqm => sqm,
        }
    }

    pub fn to_sqm(self, value: f64) -> f64 {
        match self {
            AreaUnit::Pyeong => value * SQM_PER_PYEONG,
            AreaUnit::Sqm => value,
        }
    }
}

/// Inclusive range; a missing side is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NumericRange<T> {
    pub min: Option<T>,
    pub max: Option<T>,
}

impl<T: PartialOrd + Copy + Default> NumericRange<T> {
    pub fn new(min: Option<T>, max: Option<T>) -> Self {
        Self { min, max }
    }

    pub fn unbounded() -> Self {
        Self { min: None, max: None }
    }

    /// True when this range does not filter anything under `policy`.
    pub fn is_open(&self, policy: ZeroRangePolicy) -> bool {
        match (self.min, self.max) {
            (None, None) => true,
            (Some(min), Some(max)) => {
                policy == ZeroRangePolicy::Unbounded && min == T::default() && max == T::default()
            }
            _ => false,
        }
    }

    pub fn contains(&self, value: T, policy: ZeroRangePolicy) -> bool {
        if self.is_open(policy) {
            return true;
        }
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }

    /// A missing property value only passes an open range.
    pub fn admits(&self, value: Option<T>, policy: ZeroRangePolicy) -> bool {
        match value {
            Some(value) => self.contains(value, policy),
            None => self.is_open(policy),
        }
    }
}

/// Axis-aligned search rectangle, normalized so `min <= max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub min_lng: f64,
    pub min_lat: f64,
    pub max_lng: f64,
    pub max_lat: f64,
}

impl Rect {
    pub fn from_corners(lng1: f64, lat1: f64, lng2: f64, lat2: f64) -> Self {
        Self {
            min_lng: lng1.min(lng2),
            min_lat: lat1.min(lat2),
            max_lng: lng1.max(lng2),
            max_lat: lat1.max(lat2),
        }
    }

    pub fn contains(&self, lng: f64, lat: f64) -> bool {
        lng >= self.min_lng && lng <= self.max_lng && lat >= self.min_lat && lat <= self.max_lat
    }
}

/// Parses `"[[lng,lat,lng,lat],...]"`. Blank input means no rectangles.
pub fn parse_rectangles(text: &str) -> Result<Vec<Rect>, GeoParseError> {
    let text = text.trim();
    if text.is_empty() || text == "null" {
        return Ok(Vec::new());
    }
    let raw: Vec<Vec<f64>> = serde_json::from_str(text)?;
    raw.into_iter()
        .enumerate()
        .map(|(index, coords)| match coords.as_slice() {
            [lng1, lat1, lng2, lat2] => {
                if coords.iter().all(|c| c.is_finite()) {
                    Ok(Rect::from_corners(*lng1, *lat1, *lng2, *lat2))
                } else {
                    Err(GeoParseError::NonFinite { index })
                }
            }
            _ => Err(GeoParseError::Arity {
                index,
                len: coords.len(),
            }),
        })
        .collect()
}

/// Customer profile row as stored by the profile collaborator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfileRow {
    pub id: i64,
    /// Customer address the profile belongs to; used for scoping.
    pub address: String,
    pub manager: String,
    pub deposit_min: Option<i64>,
    pub deposit_max: Option<i64>,
    pub monthly_min: Option<i64>,
    pub monthly_max: Option<i64>,
    pub area_min: Option<f64>,
    pub area_max: Option<f64>,
    pub area_unit: AreaUnit,
    pub floor_min: Option<i32>,
    pub floor_max: Option<i32>,
    #[serde(deserialize_with = "bool_or_int")]
    pub is_top_floor: bool,
    /// Comma separated region names.
    pub dong: String,
    /// JSON text, `[[lng,lat,lng,lat],...]`.
    pub rectangles: String,
    /// Pipe separated business types.
    pub biz_type: String,
}

fn bool_or_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
        Text(String),
    }
    Ok(match Option::<Flag>::deserialize(deserializer)? {
        Some(Flag::Bool(b)) => b,
        Some(Flag::Int(i)) => i != 0,
        Some(Flag::Text(s)) => matches!(s.trim(), "1" | "true" | "TRUE" | "True" | "Y" | "y"),
        None => false,
    })
}

/// A parsed saved search.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CustomerProfile {
    pub id: i64,
    pub address: String,
    pub manager: String,
    pub deposit: NumericRange<i64>,
    pub rent: NumericRange<i64>,
    /// Expressed in `area_unit`.
    pub area: NumericRange<f64>,
    pub area_unit: AreaUnit,
    pub floor: NumericRange<i32>,
    pub top_floor_only: bool,
    pub regions: Vec<String>,
    pub rectangles: Vec<Rect>,
    pub business_types: Vec<String>,
}

impl CustomerProfile {
    /// Strict conversion: a malformed rectangles payload is an error.
    pub fn from_row(row: &ProfileRow) -> Result<Self, ProfileError> {
        let rectangles = parse_rectangles(&row.rectangles).map_err(|source| ProfileError::Geography {
            id: row.id,
            source,
        })?;
        Ok(Self::with_rectangles(row, rectangles))
    }

    /// Lenient conversion: a malformed rectangles payload becomes "no rectangles".
    pub fn from_row_lenient(row: &ProfileRow) -> Self {
        let rectangles = parse_rectangles(&row.rectangles).unwrap_or_else(|err| {
            warn!(profile_id = row.id, error = %err, "ignoring malformed rectangles");
            Vec::new()
        });
        Self::with_rectangles(row, rectangles)
    }

    fn with_rectangles(row: &ProfileRow, rectangles: Vec<Rect>) -> Self {
        Self {
            id: row.id,
            address: row.address.trim().to_string(),
            manager: row.manager.trim().to_string(),
            deposit: NumericRange::new(row.deposit_min, row.deposit_max),
            rent: NumericRange::new(row.monthly_min, row.monthly_max),
            area: NumericRange::new(row.area_min, row.area_max),
            area_unit: row.area_unit,
            floor: NumericRange::new(row.floor_min, row.floor_max),
            top_floor_only: row.is_top_floor,
            regions: split_list(&row.dong, ','),
            rectangles,
            business_types: split_list(&row.biz_type, '|'),
        }
    }

    pub fn has_geography(&self) -> bool {
        !self.regions.is_empty() || !self.rectangles.is_empty()
    }
}

fn split_list(text: &str, sep: char) -> Vec<String> {
    text.split(sep)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Pure boolean gate: does a property satisfy a profile's ranges and geography?
#[derive(Debug, Clone, Copy, Default)]
pub struct RangeGeoMatcher {
    pub zero_range: ZeroRangePolicy,
}

impl RangeGeoMatcher {
    pub fn new(zero_range: ZeroRangePolicy) -> Self {
        Self { zero_range }
    }

    pub fn matches(&self, property: &PropertyRecord, profile: &CustomerProfile) -> bool {
        let policy = self.zero_range;
        if !profile.deposit.admits(property.deposit, policy) {
            return false;
        }
        if !profile.rent.admits(property.monthly_rent, policy) {
            return false;
        }
        let area = property.area_sqm.map(|sqm| profile.area_unit.from_sqm(sqm));
        if !profile.area.admits(area, policy) {
            return false;
        }
        if !profile.floor.admits(property.current_floor, policy) {
            return false;
        }
        if profile.top_floor_only && !property.is_top_floor() {
            return false;
        }
        self.matches_geography(property, profile)
    }

    /// Named-region membership OR inside any rectangle; vacuous when the profile has neither.
    pub fn matches_geography(&self, property: &PropertyRecord, profile: &CustomerProfile) -> bool {
        if !profile.has_geography() {
            return true;
        }
        let region = property.region.trim();
        if profile.regions.iter().any(|r| r == region) {
            return true;
        }
        match (property.lng, property.lat) {
            (Some(lng), Some(lat)) => profile.rectangles.iter().any(|rect| rect.contains(lng, lat)),
            _ => false,
        }
    }
}
