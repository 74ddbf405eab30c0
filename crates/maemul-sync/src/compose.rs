//! Orders unified rows for presentation.

use std::collections::{HashMap, HashSet};

use maemul_core::{SourceTag, UnifiedRow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::dedupe::{sort_by_end_date_desc, Deduplicator};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "mode", content = "addresses")]
pub enum CompositionMode {
    /// Fixed source precedence.
    #[default]
    Default,
    /// Recommendations first, then address groups in the caller's order.
    MultiSelection(Vec<String>),
}

#[derive(Debug, Clone, Default)]
pub struct CompositionOrderer {
    dedup: Deduplicator,
}

impl CompositionOrderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compose(&self, rows: Vec<UnifiedRow>, mode: &CompositionMode) -> Vec<UnifiedRow> {
        match mode {
            CompositionMode::Default => self.compose_default(rows),
            CompositionMode::MultiSelection(addresses) => self.compose_selection(rows, addresses),
        }
    }

    fn split_live(&self, rows: Vec<UnifiedRow>) -> (Vec<UnifiedRow>, Vec<UnifiedRow>) {
        let (live, rest): (Vec<_>, Vec<_>) = rows.into_iter().partition(|r| r.source.is_live_inventory());
        (self.dedup.apply(live), rest)
    }

    fn compose_default(&self, rows: Vec<UnifiedRow>) -> Vec<UnifiedRow> {
        let (live, mut rest) = self.split_live(rows);
        rest.sort_by_key(|r| r.source.precedence());

        let live_rank = SourceTag::LiveShop.precedence();
        let split = rest.partition_point(|r| r.source.precedence() < live_rank);
        let tail = rest.split_off(split);

        let mut out = rest;
        out.reserve(live.len() + tail.len());
        out.extend(live);
        out.extend(tail);
        out
    }

    fn compose_selection(&self, rows: Vec<UnifiedRow>, addresses: &[String]) -> Vec<UnifiedRow> {
        let (live, rest) = self.split_live(rows);
        let (recommended, others): (Vec<_>, Vec<_>) = rest
            .into_iter()
            .chain(live)
            .partition(|r| r.source == SourceTag::Recommendation);

        let mut groups: HashMap<String, Vec<UnifiedRow>> = HashMap::new();
        for row in others {
            groups.entry(address_key(&row.address)).or_default().push(row);
        }

        let mut out = sort_by_end_date_desc(recommended);
        let mut emitted = HashSet::new();
        for address in addresses {
            let key = address_key(address);
            if !emitted.insert(key.clone()) {
                continue;
            }
            if let Some(group) = groups.remove(&key) {
                out.extend(sort_by_end_date_desc(group));
            }
        }
        let dropped: usize = groups.values().map(Vec::len).sum();
        if dropped > 0 {
            debug!(dropped, "rows outside the selected addresses were dropped");
        }
        out
    }
}

fn address_key(address: &str) -> String {
    address.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_row(source: SourceTag, address: &str, end: &str) -> UnifiedRow {
        UnifiedRow {
            source,
            address: address.to_string(),
            ad_end_date: end.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn completed_precedes_recommendation() {
        let rows = vec![
            mk_row(SourceTag::Recommendation, "A", "2024-01-01"),
            mk_row(SourceTag::CompletedDeal, "B", "2023-01-01"),
        ];
        let out = CompositionOrderer::new().compose(rows, &CompositionMode::Default);
        assert_eq!(out[0].source, SourceTag::CompletedDeal);
        assert_eq!(out[1].source, SourceTag::Recommendation);
    }

    #[test]
    fn default_mode_follows_fixed_precedence() {
        let rows = vec![
            mk_row(SourceTag::Other, "o", ""),
            mk_row(SourceTag::LiveShop, "s1", "2024-01-01"),
            mk_row(SourceTag::Recommendation, "r1", ""),
            mk_row(SourceTag::LiveStudio, "s2", "2024-03-01"),
            mk_row(SourceTag::ConfirmationDesk, "c1", ""),
            mk_row(SourceTag::PersonalList, "p1", ""),
            mk_row(SourceTag::Recommendation, "r2", ""),
            mk_row(SourceTag::CompletedDeal, "d1", ""),
        ];
        let out = CompositionOrderer::new().compose(rows, &CompositionMode::Default);
        let order: Vec<&str> = out.iter().map(|r| r.address.as_str()).collect();
        assert_eq!(order, vec!["d1", "p1", "c1", "r1", "r2", "s2", "s1", "o"]);

        let ranks: Vec<u8> = out.iter().map(|r| r.source.precedence()).collect();
        assert!(ranks.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn default_mode_dedupes_across_both_live_feeds() {
        let shop = mk_row(SourceTag::LiveShop, "X", "2024-01-10");
        let studio = mk_row(SourceTag::LiveStudio, "X", "2024-02-01");
        let out = CompositionOrderer::new().compose(vec![shop, studio], &CompositionMode::Default);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].source, SourceTag::LiveStudio);
    }

    #[test]
    fn selection_mode_uses_caller_address_order() {
        let rows = vec![
            mk_row(SourceTag::ConfirmationDesk, "A", "2024-01-01"),
            mk_row(SourceTag::PersonalList, "B", "2024-01-01"),
            mk_row(SourceTag::ConfirmationDesk, "A", "2024-05-01"),
            mk_row(SourceTag::Recommendation, "R", "2024-01-01"),
            mk_row(SourceTag::Recommendation, "R2", "2024-04-01"),
            mk_row(SourceTag::ConfirmationDesk, "C", "2024-01-01"),
        ];
        let mode = CompositionMode::MultiSelection(vec!["B".into(), "A".into(), "missing".into(), "B".into()]);
        let out = CompositionOrderer::new().compose(rows, &mode);
        let order: Vec<(&str, &str)> = out
            .iter()
            .map(|r| (r.address.as_str(), r.ad_end_date.as_str()))
            .collect();
        assert_eq!(
            order,
            vec![
                ("R2", "2024-04-01"),
                ("R", "2024-01-01"),
                ("B", "2024-01-01"),
                ("A", "2024-05-01"),
                ("A", "2024-01-01"),
            ]
        );
    }

    #[test]
    fn selection_mode_dedupes_live_rows_first() {
        let rows = vec![
            mk_row(SourceTag::LiveShop, "A", "2024-01-01"),
            mk_row(SourceTag::LiveShop, "A", "2024-02-01"),
        ];
        let mode = CompositionMode::MultiSelection(vec!["A".into()]);
        let out = CompositionOrderer::new().compose(rows, &mode);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].ad_end_date, "2024-02-01");
    }

    #[test]
    fn mode_serializes_with_tag() {
        let mode: CompositionMode =
            serde_json::from_str(r#"{"mode":"multi-selection","addresses":["B","A"]}"#).unwrap();
        assert_eq!(mode, CompositionMode::MultiSelection(vec!["B".into(), "A".into()]));
        let default: CompositionMode = serde_json::from_str(r#"{"mode":"default"}"#).unwrap();
        assert_eq!(default, CompositionMode::Default);
    }
}
