//! Core domain model for stayscout: raw capture shapes, normalized
//! snapshots, persisted listing records, and availability windows.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "stayscout-core";

/// One raw listing observation as handed over by the fetcher.
///
/// Every field except the URL is optional: source page layouts vary and
/// numeric-looking values arrive as either JSON numbers or strings, so
/// they are kept loosely typed until normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub url: String,
    #[serde(default)]
    pub rating: Option<JsonValue>,
    #[serde(default)]
    pub review_count: Option<JsonValue>,
    #[serde(default)]
    pub review_text: Option<String>,
    #[serde(default)]
    pub capacity_line: Option<String>,
    #[serde(default)]
    pub price_text: Option<String>,
    #[serde(default)]
    pub date_range_text: Option<String>,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
}

/// All raw snapshots captured from one search source page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSourceCapture {
    pub source_url: String,
    #[serde(default)]
    pub source_label: Option<String>,
    #[serde(default)]
    pub results: Vec<RawSnapshot>,
}

/// The full payload of one extraction run across all sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRunPayload {
    pub sources: Vec<RawSourceCapture>,
    #[serde(default)]
    pub captured_at: Option<DateTime<Utc>>,
}

/// Per-source context applied while normalizing its raw snapshots.
///
/// `captured_at` is the fallback capture time for snapshots that did not
/// record their own.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureContext {
    pub origin_url: Option<String>,
    pub origin_label: Option<String>,
    pub captured_at: DateTime<Utc>,
}

/// A normalized listing observation with every field coerced to its
/// semantic type or explicitly absent. The capture timestamp is the one
/// field that is always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingSnapshot {
    pub source_url: String,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
    pub guests: Option<i64>,
    pub bedrooms: Option<i64>,
    pub beds: Option<i64>,
    pub bathrooms: Option<f64>,
    pub total_price: Option<i64>,
    pub nights: Option<i64>,
    pub price_per_night: Option<f64>,
    pub date_range_text: Option<String>,
    pub origin_url: Option<String>,
    pub origin_label: Option<String>,
    pub captured_at: DateTime<Utc>,
}

/// Stable deduplication key for a listing across scrapes: the room-id
/// segment of its URL, shared by every query-string and locale variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingIdentity(String);

impl ListingIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Canonical listing URL all variants collapse to.
    pub fn canonical_url(&self) -> String {
        format!("https://www.airbnb.com/rooms/{}", self.0)
    }
}

impl fmt::Display for ListingIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted listing row: one per identity, carrying the latest known
/// attribute values. Records are never deleted, only retired by
/// clearing `active` when a run no longer observes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub identity: ListingIdentity,
    pub listing_url: String,
    pub origin_url: Option<String>,
    pub origin_label: Option<String>,
    pub rating: Option<f64>,
    pub review_count: Option<i64>,
    pub guests: Option<i64>,
    pub bedrooms: Option<i64>,
    pub beds: Option<i64>,
    pub bathrooms: Option<f64>,
    pub total_price: Option<i64>,
    pub nights: Option<i64>,
    pub price_per_night: Option<f64>,
    pub date_range_text: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub active: bool,
}

/// One raw calendar day as scraped: the date arrives in whatever shape
/// the page exposed (ISO, `MM/DD/YYYY`, or a `calendar-day-*` testid),
/// the blocked flag as a bool or the strings `"true"`/`"false"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDayEntry {
    pub date: String,
    #[serde(default)]
    pub blocked: JsonValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayAvailability {
    pub date: NaiveDate,
    pub blocked: bool,
}

/// Ordered per-date blocked flags for one listing, unique by date.
/// When the same date is observed more than once the last observation
/// wins.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    days: Vec<DayAvailability>,
}

impl AvailabilityWindow {
    pub fn from_days(observations: impl IntoIterator<Item = DayAvailability>) -> Self {
        let mut by_date = BTreeMap::new();
        for day in observations {
            by_date.insert(day.date, day.blocked);
        }
        Self {
            days: by_date
                .into_iter()
                .map(|(date, blocked)| DayAvailability { date, blocked })
                .collect(),
        }
    }

    pub fn days(&self) -> &[DayAvailability] {
        &self.days
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    /// Days falling within `[start, end]` inclusive, in date order.
    pub fn restricted(&self, start: NaiveDate, end: NaiveDate) -> Vec<DayAvailability> {
        self.days
            .iter()
            .copied()
            .filter(|day| day.date >= start && day.date <= end)
            .collect()
    }
}

/// Computed occupancy projection for one listing over a caller-chosen
/// horizon. Percentages are absent (not zero) when the restricted
/// window captured no days: zero data is not zero occupancy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccupancyStats {
    pub horizon_start: NaiveDate,
    pub horizon_end: NaiveDate,
    pub forward_days: i64,
    pub days_booked: i64,
    pub days_not_booked: i64,
    pub vacancy_pct: Option<f64>,
    pub occupancy_pct: Option<f64>,
    pub booked_ranges: Vec<String>,
    pub available_ranges: Vec<String>,
}

impl OccupancyStats {
    pub fn is_applicable(&self) -> bool {
        self.forward_days > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(iso: &str, blocked: bool) -> DayAvailability {
        DayAvailability {
            date: iso.parse().expect("iso date"),
            blocked,
        }
    }

    #[test]
    fn window_dedupes_by_date_with_last_observation_winning() {
        let window = AvailabilityWindow::from_days([
            day("2026-03-02", true),
            day("2026-03-01", false),
            day("2026-03-02", false),
        ]);
        assert_eq!(
            window.days(),
            &[day("2026-03-01", false), day("2026-03-02", false)]
        );
    }

    #[test]
    fn window_restriction_is_inclusive_on_both_ends() {
        let window = AvailabilityWindow::from_days([
            day("2026-02-28", true),
            day("2026-03-01", true),
            day("2026-03-31", false),
            day("2026-04-01", false),
        ]);
        let restricted = window.restricted(
            "2026-03-01".parse().unwrap(),
            "2026-03-31".parse().unwrap(),
        );
        assert_eq!(restricted, vec![day("2026-03-01", true), day("2026-03-31", false)]);
    }

    #[test]
    fn identity_produces_canonical_url() {
        let identity = ListingIdentity::new("1056059527213736624");
        assert_eq!(
            identity.canonical_url(),
            "https://www.airbnb.com/rooms/1056059527213736624"
        );
    }
}
