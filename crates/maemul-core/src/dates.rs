//! Loose date parsing for advertisement start/end dates.
//!
//! Feeds write dates in whatever shape their operators typed. Parsing never
//! fails: anything unreadable becomes the 1970-01-01 sentinel, which sorts
//! behind every real date.

use chrono::{NaiveDate, NaiveDateTime};
use tracing::{debug, warn};

pub type ComparableDate = NaiveDateTime;

#[derive(Debug, Clone, Copy)]
enum Pattern {
    /// Reads a date prefix and ignores whatever follows.
    DateOnly(&'static str),
    DateTime(&'static str),
}

impl Pattern {
    fn format(self) -> &'static str {
        match self {
            Pattern::DateOnly(f) | Pattern::DateTime(f) => f,
        }
    }
}

const PATTERNS: [Pattern; 6] = [
    Pattern::DateOnly("%Y-%m-%d"),
    Pattern::DateTime("%Y-%m-%d %H:%M:%S"),
    Pattern::DateOnly("%Y/%m/%d"),
    Pattern::DateOnly("%Y. %m. %d"),
    Pattern::DateOnly("%Y.%m.%d"),
    Pattern::DateOnly("%Y년 %m월 %d일"),
];

/// 1970-01-01T00:00:00.
pub fn sentinel_date() -> ComparableDate {
    NaiveDateTime::default()
}

/// Tries every known format in order. Date-only formats map to midnight.
pub fn try_parse_date(text: &str) -> Option<ComparableDate> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    PATTERNS.iter().find_map(|pattern| match *pattern {
        Pattern::DateOnly(fmt) => NaiveDate::parse_and_remainder(text, fmt)
            .ok()
            .and_then(|(date, _rest)| date.and_hms_opt(0, 0, 0)),
        Pattern::DateTime(fmt) => NaiveDateTime::parse_from_str(text, fmt).ok(),
    })
}

/// Total variant of [`try_parse_date`]: failures log and yield [`sentinel_date`].
pub fn parse_date(text: &str) -> ComparableDate {
    if text.trim().is_empty() {
        debug!("empty date text, using sentinel");
        return sentinel_date();
    }
    match try_parse_date(text) {
        Some(date) => date,
        None => {
            let attempted = PATTERNS.iter().map(|p| p.format()).collect::<Vec<_>>();
            warn!(input = text, ?attempted, "unparseable date, using sentinel");
            sentinel_date()
        }
    }
}
