//! Collapses re-advertised live listings down to the freshest copy.

use std::cmp::Reverse;
use std::collections::HashSet;

use maemul_core::{parse_date, ComparableDate, UnifiedRow};
use tracing::debug;

/// Stable sort, most recent advertisement end date first.
pub fn sort_by_end_date_desc(rows: Vec<UnifiedRow>) -> Vec<UnifiedRow> {
    let mut decorated: Vec<(ComparableDate, UnifiedRow)> = rows
        .into_iter()
        .map(|row| (parse_date(&row.ad_end_date), row))
        .collect();
    decorated.sort_by_key(|(end, _)| Reverse(*end));
    decorated.into_iter().map(|(_, row)| row).collect()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Deduplicator;

impl Deduplicator {
    /// Keeps the first row per identity key after sorting newest first.
    ///
    /// Output is ordered by descending end date and applying it twice
    /// changes nothing.
    pub fn apply(&self, rows: Vec<UnifiedRow>) -> Vec<UnifiedRow> {
        let before = rows.len();
        let mut seen = HashSet::with_capacity(before);
        let kept: Vec<UnifiedRow> = sort_by_end_date_desc(rows)
            .into_iter()
            .filter(|row| seen.insert(row.identity_key()))
            .collect();
        debug!(before, after = kept.len(), "deduplicated live inventory");
        kept
    }
}

pub fn dedupe(rows: Vec<UnifiedRow>) -> Vec<UnifiedRow> {
    Deduplicator.apply(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use maemul_core::SourceTag;

    fn mk_row(address: &str, end: &str) -> UnifiedRow {
        UnifiedRow {
            source: SourceTag::LiveShop,
            address: address.to_string(),
            unit: "101".into(),
            deposit: Some(3000),
            monthly_rent: Some(100),
            ad_end_date: end.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn keeps_the_freshest_copy() {
        let rows = vec![mk_row("X", "2024-01-10"), mk_row("X", "2024-02-01")];
        let out = dedupe(rows);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ad_end_date, "2024-02-01");
    }

    #[test]
    fn mixed_date_formats_compare_correctly() {
        let mut studio = mk_row("X", "2024. 03. 05");
        studio.source = SourceTag::LiveStudio;
        let out = dedupe(vec![mk_row("X", "2024-03-01"), studio]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].source, SourceTag::LiveStudio);
    }

    #[test]
    fn equal_dates_keep_arrival_order() {
        let mut first = mk_row("X", "2024-01-10");
        first.memo = "first".into();
        let mut second = mk_row("X", "2024-01-10");
        second.memo = "second".into();
        let out = dedupe(vec![first, second, mk_row("Y", "2024-01-10")]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].memo, "first");
        assert_eq!(out[1].address, "Y");
    }

    #[test]
    fn unparsable_dates_sort_last_and_lose() {
        let out = dedupe(vec![mk_row("X", "미정"), mk_row("X", "2020-01-01"), mk_row("Z", "")]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].ad_end_date, "2020-01-01");
        assert_eq!(out[1].address, "Z");
    }

    #[test]
    fn idempotent_and_ordered() {
        let rows = vec![
            mk_row("A", "2024-01-01"),
            mk_row("B", "2024-03-01"),
            mk_row("A", "2024-02-01"),
            mk_row("C", "garbage"),
            mk_row("B", "2024/03/01"),
            mk_row("D", "2024년 01월 15일"),
        ];
        let once = dedupe(rows);
        let twice = dedupe(once.clone());
        assert_eq!(once, twice);

        let dates: Vec<_> = once.iter().map(|r| parse_date(&r.ad_end_date)).collect();
        assert!(dates.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn survivor_is_never_older_than_a_dropped_duplicate() {
        let rows = vec![
            mk_row("A", "2023-12-31"),
            mk_row("A", "2024-05-05"),
            mk_row("A", "2024-01-01"),
        ];
        let out = dedupe(rows.clone());
        let survivor = parse_date(&out[0].ad_end_date);
        assert!(rows.iter().all(|r| parse_date(&r.ad_end_date) <= survivor));
    }
}
