//! Maps every raw record shape into a [`UnifiedRow`].

use chrono::{Days, NaiveDate};
use maemul_core::{
    join_address, try_parse_date, AreaUnit, ListingStatus, PropertyRecord, SourceTag, UnifiedRow,
};
use serde::{Deserialize, Serialize};

use crate::records::{
    CompletedDealRecord, ConfirmationRecord, PersonalListRecord, RecommendationRecord, SourceRecord,
    StudioRecord,
};

/// How two listing numbers are joined for display.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingNumberStyle {
    /// `"a,b"`
    #[default]
    Comma,
    /// `"a/b"`
    Slash,
}

impl ListingNumberStyle {
    pub fn join(self, primary: Option<&str>, secondary: Option<&str>) -> String {
        let primary = primary.map(str::trim).filter(|s| !s.is_empty());
        let secondary = secondary.map(str::trim).filter(|s| !s.is_empty());
        match (primary, secondary) {
            (Some(a), Some(b)) => match self {
                ListingNumberStyle::Comma => format!("{a},{b}"),
                ListingNumberStyle::Slash => format!("{a}/{b}"),
            },
            (Some(one), None) | (None, Some(one)) => one.to_string(),
            (None, None) => String::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizeOptions {
    pub today: NaiveDate,
    pub listing_number_style: ListingNumberStyle,
    /// Rows produced by the matcher service may be marked ending-soon.
    pub server_produced: bool,
    pub ending_soon_days: u64,
}

impl NormalizeOptions {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today,
            listing_number_style: ListingNumberStyle::default(),
            server_produced: false,
            ending_soon_days: 6,
        }
    }

    pub fn server_produced(mut self, yes: bool) -> Self {
        self.server_produced = yes;
        self
    }

    pub fn with_style(mut self, style: ListingNumberStyle) -> Self {
        self.listing_number_style = style;
        self
    }

    pub fn with_ending_soon_days(mut self, days: u64) -> Self {
        self.ending_soon_days = days;
        self
    }
}

/// Status decision table shared by every feed without a fixed status.
pub fn decide_status(
    source: SourceTag,
    status_code: Option<i32>,
    ad_end_date: Option<&str>,
    opts: &NormalizeOptions,
) -> ListingStatus {
    match status_code {
        Some(4) => return ListingStatus::Completed,
        Some(3) => return ListingStatus::Ended,
        _ => {}
    }
    match ad_end_date.and_then(try_parse_date).map(|dt| dt.date()) {
        Some(end) if end < opts.today => ListingStatus::Ended,
        Some(end) => {
            let horizon = opts
                .today
                .checked_add_days(Days::new(opts.ending_soon_days))
                .unwrap_or(NaiveDate::MAX);
            if end <= horizon && opts.server_produced {
                ListingStatus::EndingSoon
            } else {
                ListingStatus::InService
            }
        }
        None if source.is_live_inventory() || source == SourceTag::Recommendation => ListingStatus::Ended,
        None => ListingStatus::NeedsReview,
    }
}

pub fn normalize(record: &SourceRecord, opts: &NormalizeOptions) -> UnifiedRow {
    match record {
        SourceRecord::LiveShop(p) => from_property(SourceTag::LiveShop, p, opts),
        SourceRecord::LiveStudio(s) => from_studio(s, opts),
        SourceRecord::ConfirmationDesk(c) => from_confirmation(c, opts),
        SourceRecord::Recommendation(r) => from_recommendation(r, opts),
        SourceRecord::PersonalList(p) => from_personal(p),
        SourceRecord::CompletedDeal(c) => from_completed(c, opts),
    }
}

fn from_property(source: SourceTag, p: &PropertyRecord, opts: &NormalizeOptions) -> UnifiedRow {
    let floor_current = opt_to_string(p.current_floor);
    let floor_total = opt_to_string(p.total_floor);
    UnifiedRow {
        source,
        address: p.address(),
        unit: p.unit.trim().to_string(),
        floor: slash_pair(&floor_current, &floor_total),
        floor_current,
        floor_total,
        deposit: p.deposit,
        monthly_rent: p.monthly_rent,
        price: slash_pair(&opt_to_string(p.deposit), &opt_to_string(p.monthly_rent)),
        management_fee: p.management_fee.trim().to_string(),
        premium: p.premium.trim().to_string(),
        current_use: p.current_use.trim().to_string(),
        area_sqm: p.area_sqm,
        rooms_baths: String::new(),
        contact: p.contact.trim().to_string(),
        listing_no_primary: p.listing_no_primary.clone(),
        listing_no_secondary: p.listing_no_secondary.clone(),
        listing_number: opts
            .listing_number_style
            .join(p.listing_no_primary.as_deref(), p.listing_no_secondary.as_deref()),
        memo: p.memo.clone(),
        manager: p.manager.trim().to_string(),
        ad_start_date: p.ad_start_date.clone().unwrap_or_default(),
        ad_end_date: p.ad_end_date.clone().unwrap_or_default(),
        photo_path: p.photo_path.clone(),
        owner_name: p.owner_name.clone(),
        owner_relation: p.owner_relation.clone(),
        status: decide_status(source, p.status_code, p.ad_end_date.as_deref(), opts),
        matched_pairs: p.matched.clone(),
    }
}

fn from_studio(s: &StudioRecord, opts: &NormalizeOptions) -> UnifiedRow {
    let mut row = from_property(SourceTag::LiveStudio, &s.property, opts);
    row.rooms_baths = slash_pair(&opt_to_string(s.rooms), &opt_to_string(s.baths));
    row
}

fn from_confirmation(c: &ConfirmationRecord, opts: &NormalizeOptions) -> UnifiedRow {
    let (floor_current, floor_total) = match c.floor.split_once('/') {
        Some((cur, total)) => (cur.trim().to_string(), total.trim().to_string()),
        None => (c.floor.trim().to_string(), String::new()),
    };
    UnifiedRow {
        source: SourceTag::ConfirmationDesk,
        address: c.address.trim().to_string(),
        unit: c.unit.trim().to_string(),
        floor: slash_pair(&floor_current, &floor_total),
        floor_current,
        floor_total,
        deposit: c.deposit,
        monthly_rent: c.rent,
        price: slash_pair(&opt_to_string(c.deposit), &opt_to_string(c.rent)),
        management_fee: c.management_fee.trim().to_string(),
        premium: c.premium.trim().to_string(),
        current_use: c.current_use.trim().to_string(),
        area_sqm: c.area_sqm,
        contact: c.contact.trim().to_string(),
        listing_no_primary: c.listing_no.clone(),
        listing_number: opts.listing_number_style.join(c.listing_no.as_deref(), None),
        memo: c.memo.clone(),
        manager: c.manager.trim().to_string(),
        ad_start_date: c.confirmed_on.clone().unwrap_or_default(),
        ad_end_date: c.ad_end_date.clone().unwrap_or_default(),
        owner_name: c.owner_name.clone(),
        owner_relation: c.owner_relation.clone(),
        status: decide_status(SourceTag::ConfirmationDesk, None, c.ad_end_date.as_deref(), opts),
        ..Default::default()
    }
}

fn from_recommendation(r: &RecommendationRecord, opts: &NormalizeOptions) -> UnifiedRow {
    let floor_current = opt_to_string(r.floor_current);
    let floor_total = opt_to_string(r.floor_total);
    UnifiedRow {
        source: SourceTag::Recommendation,
        address: join_address(&r.region, &r.parcel),
        unit: r.unit.trim().to_string(),
        floor: slash_pair(&floor_current, &floor_total),
        floor_current,
        floor_total,
        deposit: r.deposit,
        monthly_rent: r.monthly_rent,
        price: slash_pair(&opt_to_string(r.deposit), &opt_to_string(r.monthly_rent)),
        management_fee: r.management_fee.trim().to_string(),
        premium: r.premium.trim().to_string(),
        current_use: r.current_use.trim().to_string(),
        area_sqm: r.area_sqm,
        contact: r.contact.trim().to_string(),
        listing_no_primary: r.listing_no_primary.clone(),
        listing_no_secondary: r.listing_no_secondary.clone(),
        listing_number: opts
            .listing_number_style
            .join(r.listing_no_primary.as_deref(), r.listing_no_secondary.as_deref()),
        memo: r.memo.clone(),
        manager: r.manager.trim().to_string(),
        ad_start_date: r.ad_start_date.clone().unwrap_or_default(),
        ad_end_date: r.ad_end_date.clone().unwrap_or_default(),
        photo_path: r.photo_path.clone(),
        status: decide_status(
            SourceTag::Recommendation,
            r.status_code,
            r.ad_end_date.as_deref(),
            opts,
        ),
        matched_pairs: r.matched.clone(),
        ..Default::default()
    }
}

fn from_personal(p: &PersonalListRecord) -> UnifiedRow {
    let floor_current = p.floor_current.trim().to_string();
    let floor_total = p.floor_total.trim().to_string();
    UnifiedRow {
        source: SourceTag::PersonalList,
        address: p.address.trim().to_string(),
        unit: p.unit.trim().to_string(),
        floor: slash_pair(&floor_current, &floor_total),
        floor_current,
        floor_total,
        deposit: p.deposit,
        monthly_rent: p.rent,
        price: slash_pair(&opt_to_string(p.deposit), &opt_to_string(p.rent)),
        management_fee: p.management_fee.trim().to_string(),
        premium: p.premium.trim().to_string(),
        current_use: p.current_use.trim().to_string(),
        area_sqm: p.area_pyeong.map(|v| AreaUnit::Pyeong.to_sqm(v)),
        contact: p.contact.trim().to_string(),
        memo: p.memo.clone(),
        manager: p.manager.trim().to_string(),
        ad_start_date: p.registered_on.clone().unwrap_or_default(),
        status: ListingStatus::NewAd,
        ..Default::default()
    }
}

fn from_completed(c: &CompletedDealRecord, opts: &NormalizeOptions) -> UnifiedRow {
    let floor_current = opt_to_string(c.floor_current);
    let floor_total = opt_to_string(c.floor_total);
    UnifiedRow {
        source: SourceTag::CompletedDeal,
        address: join_address(&c.region, &c.parcel),
        unit: c.unit.trim().to_string(),
        floor: slash_pair(&floor_current, &floor_total),
        floor_current,
        floor_total,
        deposit: c.deposit,
        monthly_rent: c.monthly_rent,
        price: slash_pair(&opt_to_string(c.deposit), &opt_to_string(c.monthly_rent)),
        premium: c.premium.trim().to_string(),
        current_use: c.current_use.trim().to_string(),
        area_sqm: c.area_sqm,
        contact: c.contact.trim().to_string(),
        listing_no_primary: c.listing_no_primary.clone(),
        listing_no_secondary: c.listing_no_secondary.clone(),
        listing_number: opts
            .listing_number_style
            .join(c.listing_no_primary.as_deref(), c.listing_no_secondary.as_deref()),
        manager: c.manager.trim().to_string(),
        ad_start_date: c.contracted_on.clone().unwrap_or_default(),
        ad_end_date: c.closed_on.clone().unwrap_or_default(),
        owner_name: c.owner_name.clone(),
        status: ListingStatus::Completed,
        ..Default::default()
    }
}

fn opt_to_string<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// `"a/b"`, or empty when both halves are empty.
fn slash_pair(a: &str, b: &str) -> String {
    if a.is_empty() && b.is_empty() {
        String::new()
    } else {
        format!("{a}/{b}")
    }
}
