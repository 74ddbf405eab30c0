//! Storage-layer property queries and the inventory collaborator.
//!
//! The matcher pushes numeric ranges and a geography OR-clause down into the
//! store so the boolean gate only re-validates what storage cannot express
//! (top-floor, the zero-range policy).

use std::collections::BTreeMap;
use std::path::Path;

use async_trait::async_trait;
use maemul_core::{
    AreaUnit, CustomerProfile, NumericRange, ProfileRow, PropertyRecord, Rect, SourceTag,
    ZeroRangePolicy,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgRow, Postgres};
use sqlx::{Encode, QueryBuilder, Row, Type};
use thiserror::Error;
use tracing::debug;

/// Area bounds are widened by this many m² so unit conversion never drops an edge case.
const AREA_SLACK_SQM: f64 = 1e-6;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("reading inventory {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing inventory: {0}")]
    Json(#[from] serde_json::Error),
}

/// Filter pushed into the property store for one profile.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyQuery {
    pub deposit: NumericRange<i64>,
    pub rent: NumericRange<i64>,
    pub area_sqm: NumericRange<f64>,
    pub floor: NumericRange<i32>,
    pub regions: Vec<String>,
    pub rectangles: Vec<Rect>,
}

impl PropertyQuery {
    pub fn from_profile(profile: &CustomerProfile, policy: ZeroRangePolicy) -> Self {
        fn resolve<T: PartialOrd + Copy + Default>(
            range: &NumericRange<T>,
            policy: ZeroRangePolicy,
        ) -> NumericRange<T> {
            if range.is_open(policy) {
                NumericRange::unbounded()
            } else {
                *range
            }
        }

        let area = resolve(&profile.area, policy);
        let unit: AreaUnit = profile.area_unit;
        Self {
            deposit: resolve(&profile.deposit, policy),
            rent: resolve(&profile.rent, policy),
            area_sqm: NumericRange::new(
                area.min.map(|v| unit.to_sqm(v) - AREA_SLACK_SQM),
                area.max.map(|v| unit.to_sqm(v) + AREA_SLACK_SQM),
            ),
            floor: resolve(&profile.floor, policy),
            regions: profile.regions.clone(),
            rectangles: profile.rectangles.clone(),
        }
    }

    /// In-memory evaluation with the same semantics as the SQL rendering.
    pub fn matches(&self, record: &PropertyRecord) -> bool {
        // Ranges here are already resolved, so the policy no longer matters.
        let policy = ZeroRangePolicy::Exact;
        if !self.deposit.admits(record.deposit, policy)
            || !self.rent.admits(record.monthly_rent, policy)
            || !self.area_sqm.admits(record.area_sqm, policy)
            || !self.floor.admits(record.current_floor, policy)
        {
            return false;
        }
        if self.regions.is_empty() && self.rectangles.is_empty() {
            return true;
        }
        let region = record.region.trim();
        self.regions.iter().any(|r| r == region)
            || match (record.lng, record.lat) {
                (Some(lng), Some(lat)) => self.rectangles.iter().any(|r| r.contains(lng, lat)),
                _ => false,
            }
    }

    pub fn push_filters<'a>(&self, qb: &mut QueryBuilder<'a, Postgres>) {
        push_bounds(qb, "deposit", &self.deposit);
        push_bounds(qb, "monthly_rent", &self.rent);
        push_bounds(qb, "area_sqm", &self.area_sqm);
        push_bounds(qb, "current_floor", &self.floor);

        if self.regions.is_empty() && self.rectangles.is_empty() {
            return;
        }
        qb.push(" AND (FALSE");
        if !self.regions.is_empty() {
            qb.push(" OR region = ANY(");
            qb.push_bind(self.regions.clone());
            qb.push(")");
        }
        for rect in &self.rectangles {
            qb.push(" OR (lng BETWEEN ");
            qb.push_bind(rect.min_lng);
            qb.push(" AND ");
            qb.push_bind(rect.max_lng);
            qb.push(" AND lat BETWEEN ");
            qb.push_bind(rect.min_lat);
            qb.push(" AND ");
            qb.push_bind(rect.max_lat);
            qb.push(")");
        }
        qb.push(")");
    }
}

fn push_bounds<'a, T>(qb: &mut QueryBuilder<'a, Postgres>, column: &str, range: &NumericRange<T>)
where
    T: 'a + Encode<'a, Postgres> + Type<Postgres> + Copy + Send,
{
    if let Some(min) = range.min {
        qb.push(format!(" AND {column} >= "));
        qb.push_bind(min);
    }
    if let Some(max) = range.max {
        qb.push(format!(" AND {column} <= "));
        qb.push_bind(max);
    }
}

/// Which customer profiles a matching pass covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileScope {
    All,
    Addresses(Vec<String>),
    Manager(String),
}

impl ProfileScope {
    pub fn includes(&self, row: &ProfileRow) -> bool {
        match self {
            ProfileScope::All => true,
            ProfileScope::Addresses(addresses) => addresses.iter().any(|a| a.trim() == row.address.trim()),
            ProfileScope::Manager(manager) => row.manager.trim() == manager.trim(),
        }
    }
}

#[async_trait]
pub trait InventoryStore: Send + Sync {
    async fn query_properties(&self, query: &PropertyQuery) -> Result<Vec<PropertyRecord>, StoreError>;

    async fn load_profiles(&self, scope: &ProfileScope) -> Result<Vec<ProfileRow>, StoreError>;

    async fn feed_batch(&self, source: SourceTag) -> Result<Vec<JsonValue>, StoreError>;
}

/// On-disk JSON inventory, the fallback when no database is configured.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryFile {
    pub properties: Vec<PropertyRecord>,
    pub profiles: Vec<ProfileRow>,
    pub feeds: BTreeMap<SourceTag, Vec<JsonValue>>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryInventory {
    data: InventoryFile,
}

impl MemoryInventory {
    pub fn new(data: InventoryFile) -> Self {
        Self { data }
    }

    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.display().to_string(),
                source,
            })?;
        Ok(Self::new(serde_json::from_str(&text)?))
    }
}

#[async_trait]
impl InventoryStore for MemoryInventory {
    async fn query_properties(&self, query: &PropertyQuery) -> Result<Vec<PropertyRecord>, StoreError> {
        Ok(self
            .data
            .properties
            .iter()
            .filter(|p| query.matches(p))
            .cloned()
            .collect())
    }

    async fn load_profiles(&self, scope: &ProfileScope) -> Result<Vec<ProfileRow>, StoreError> {
        Ok(self
            .data
            .profiles
            .iter()
            .filter(|row| scope.includes(row))
            .cloned()
            .collect())
    }

    async fn feed_batch(&self, source: SourceTag) -> Result<Vec<JsonValue>, StoreError> {
        Ok(self.data.feeds.get(&source).cloned().unwrap_or_default())
    }
}

const PROPERTY_COLUMNS: &str = "id, region, parcel, unit, current_floor, total_floor, deposit, \
     monthly_rent, management_fee, premium, current_use, area_sqm, contact, listing_no_primary, \
     listing_no_secondary, memo, manager, ad_start_date, ad_end_date, photo_path, owner_name, \
     owner_relation, status_code, lng, lat";

const PROFILE_COLUMNS: &str = "id, address, manager, deposit_min, deposit_max, monthly_min, \
     monthly_max, area_min, area_max, area_unit, floor_min, floor_max, is_top_floor, dong, \
     rectangles, biz_type";

#[derive(Debug, Clone)]
pub struct PgInventory {
    pool: PgPool,
}

impl PgInventory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        Ok(Self::new(PgPool::connect(database_url).await?))
    }

    pub(crate) fn property_select(query: &PropertyQuery) -> QueryBuilder<'static, Postgres> {
        let mut qb = QueryBuilder::new(format!("SELECT {PROPERTY_COLUMNS} FROM properties WHERE TRUE"));
        query.push_filters(&mut qb);
        qb.push(" ORDER BY id");
        qb
    }

    pub(crate) fn profile_select(scope: &ProfileScope) -> QueryBuilder<'static, Postgres> {
        let mut qb = QueryBuilder::new(format!("SELECT {PROFILE_COLUMNS} FROM customer_profiles WHERE TRUE"));
        match scope {
            ProfileScope::All => {}
            ProfileScope::Addresses(addresses) => {
                qb.push(" AND address = ANY(");
                qb.push_bind(addresses.clone());
                qb.push(")");
            }
            ProfileScope::Manager(manager) => {
                qb.push(" AND manager = ");
                qb.push_bind(manager.clone());
            }
        }
        qb.push(" ORDER BY id");
        qb
    }
}

fn property_from_row(row: &PgRow) -> Result<PropertyRecord, sqlx::Error> {
    let text = |name: &str| -> Result<String, sqlx::Error> {
        Ok(row.try_get::<Option<String>, _>(name)?.unwrap_or_default())
    };
    Ok(PropertyRecord {
        id: row.try_get("id")?,
        region: text("region")?,
        parcel: text("parcel")?,
        unit: text("unit")?,
        current_floor: row.try_get("current_floor")?,
        total_floor: row.try_get("total_floor")?,
        deposit: row.try_get("deposit")?,
        monthly_rent: row.try_get("monthly_rent")?,
        management_fee: text("management_fee")?,
        premium: text("premium")?,
        current_use: text("current_use")?,
        area_sqm: row.try_get("area_sqm")?,
        contact: text("contact")?,
        listing_no_primary: row.try_get("listing_no_primary")?,
        listing_no_secondary: row.try_get("listing_no_secondary")?,
        memo: text("memo")?,
        manager: text("manager")?,
        ad_start_date: row.try_get("ad_start_date")?,
        ad_end_date: row.try_get("ad_end_date")?,
        photo_path: text("photo_path")?,
        owner_name: text("owner_name")?,
        owner_relation: text("owner_relation")?,
        status_code: row.try_get("status_code")?,
        lng: row.try_get("lng")?,
        lat: row.try_get("lat")?,
        matched: Vec::new(),
    })
}

fn profile_from_row(row: &PgRow) -> Result<ProfileRow, sqlx::Error> {
    let text = |name: &str| -> Result<String, sqlx::Error> {
        Ok(row.try_get::<Option<String>, _>(name)?.unwrap_or_default())
    };
    let area_unit = match text("area_unit")?.trim() {
        "sqm" => AreaUnit::Sqm,
        _ => AreaUnit::Pyeong,
    };
    Ok(ProfileRow {
        id: row.try_get("id")?,
        address: text("address")?,
        manager: text("manager")?,
        deposit_min: row.try_get("deposit_min")?,
        deposit_max: row.try_get("deposit_max")?,
        monthly_min: row.try_get("monthly_min")?,
        monthly_max: row.try_get("monthly_max")?,
        area_min: row.try_get("area_min")?,
        area_max: row.try_get("area_max")?,
        area_unit,
        floor_min: row.try_get("floor_min")?,
        floor_max: row.try_get("floor_max")?,
        is_top_floor: row.try_get::<Option<bool>, _>("is_top_floor")?.unwrap_or(false),
        dong: text("dong")?,
        rectangles: text("rectangles")?,
        biz_type: text("biz_type")?,
    })
}

#[async_trait]
impl InventoryStore for PgInventory {
    async fn query_properties(&self, query: &PropertyQuery) -> Result<Vec<PropertyRecord>, StoreError> {
        let mut qb = Self::property_select(query);
        debug!(sql = qb.sql(), "querying properties");
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(property_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn load_profiles(&self, scope: &ProfileScope) -> Result<Vec<ProfileRow>, StoreError> {
        let mut qb = Self::profile_select(scope);
        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(profile_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)
    }

    async fn feed_batch(&self, source: SourceTag) -> Result<Vec<JsonValue>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT payload
              FROM feed_records
             WHERE source = $1
             ORDER BY id
            "#,
        )
        .bind(source.as_str())
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(row.try_get::<JsonValue, _>("payload")?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: i64, region: &str, deposit: i64, area_sqm: f64) -> PropertyRecord {
        PropertyRecord {
            id,
            region: region.into(),
            deposit: Some(deposit),
            monthly_rent: Some(100),
            area_sqm: Some(area_sqm),
            current_floor: Some(2),
            total_floor: Some(5),
            ..Default::default()
        }
    }

    fn profile() -> CustomerProfile {
        CustomerProfile {
            deposit: NumericRange::new(Some(1000), Some(5000)),
            area: NumericRange::new(Some(10.0), Some(20.0)),
            regions: vec!["역삼동".into()],
            rectangles: vec![Rect::from_corners(127.0, 37.0, 127.1, 37.1)],
            ..Default::default()
        }
    }

    #[test]
    fn query_converts_profile_area_to_square_meters() {
        let q = PropertyQuery::from_profile(&profile(), ZeroRangePolicy::Exact);
        let min = q.area_sqm.min.unwrap();
        assert!((min - 33.05785).abs() < 1e-3);
        // 10 평 exactly passes the prefilter.
        assert!(q.matches(&record(1, "역삼동", 2000, 33.05785)));
    }

    #[test]
    fn query_geography_is_region_or_rectangle() {
        let q = PropertyQuery::from_profile(&profile(), ZeroRangePolicy::Exact);
        assert!(q.matches(&record(1, "역삼동", 2000, 50.0)));
        assert!(!q.matches(&record(2, "논현동", 2000, 50.0)));
        let mut inside = record(3, "논현동", 2000, 50.0);
        inside.lng = Some(127.05);
        inside.lat = Some(37.05);
        assert!(q.matches(&inside));
    }

    #[test]
    fn open_zero_ranges_are_dropped_from_the_query() {
        let mut p = profile();
        p.rent = NumericRange::new(Some(0), Some(0));
        let q = PropertyQuery::from_profile(&p, ZeroRangePolicy::Unbounded);
        assert_eq!(q.rent, NumericRange::unbounded());
        let q = PropertyQuery::from_profile(&p, ZeroRangePolicy::Exact);
        assert_eq!(q.rent, NumericRange::new(Some(0), Some(0)));
    }

    #[test]
    fn sql_rendering_binds_ranges_and_or_clause() {
        let q = PropertyQuery::from_profile(&profile(), ZeroRangePolicy::Exact);
        let qb = PgInventory::property_select(&q);
        let sql = qb.sql();
        assert!(sql.starts_with("SELECT id, region"));
        assert!(sql.contains(" AND deposit >= $1 AND deposit <= $2"));
        assert!(sql.contains(" AND area_sqm >= $3 AND area_sqm <= $4"));
        assert!(sql.contains(" AND (FALSE OR region = ANY($5) OR (lng BETWEEN $6 AND $7 AND lat BETWEEN $8 AND $9))"));
        assert!(!sql.contains("monthly_rent >="));
        assert!(sql.ends_with(" ORDER BY id"));
    }

    #[test]
    fn profile_scope_sql_and_memory_agree() {
        let qb = PgInventory::profile_select(&ProfileScope::Manager("kim".into()));
        assert!(qb.sql().contains(" AND manager = $1"));

        let row = ProfileRow {
            address: "역삼동 1".into(),
            manager: "kim".into(),
            ..Default::default()
        };
        assert!(ProfileScope::All.includes(&row));
        assert!(ProfileScope::Manager("kim".into()).includes(&row));
        assert!(ProfileScope::Addresses(vec![" 역삼동 1".into()]).includes(&row));
        assert!(!ProfileScope::Addresses(vec!["논현동".into()]).includes(&row));
    }

    #[tokio::test]
    async fn memory_inventory_loads_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("inventory.json");
        let file = InventoryFile {
            properties: vec![record(1, "역삼동", 2000, 40.0), record(2, "논현동", 9000, 40.0)],
            profiles: vec![ProfileRow {
                id: 1,
                manager: "kim".into(),
                ..Default::default()
            }],
            feeds: BTreeMap::from([(SourceTag::LiveShop, vec![serde_json::json!({"dong": "역삼동"})])]),
        };
        tokio::fs::write(&path, serde_json::to_vec(&file).unwrap())
            .await
            .unwrap();

        let store = MemoryInventory::from_path(&path).await.unwrap();
        let q = PropertyQuery::from_profile(&profile(), ZeroRangePolicy::Exact);
        let hits = store.query_properties(&q).await.unwrap();
        assert_eq!(hits.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1]);
        assert_eq!(store.load_profiles(&ProfileScope::All).await.unwrap().len(), 1);
        assert_eq!(store.feed_batch(SourceTag::LiveShop).await.unwrap().len(), 1);
        assert!(store.feed_batch(SourceTag::LiveStudio).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_inventory_file_is_an_io_error() {
        let err = MemoryInventory::from_path("/definitely/not/here.json").await.unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
    }
}
