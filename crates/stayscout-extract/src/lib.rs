//! Pure extraction layer: listing-card normalization, identity
//! resolution, and calendar-day window construction.
//!
//! Everything here is a deterministic transform over already-fetched
//! text. A field that fails coercion becomes absent; only a snapshot
//! with no recognizable listing identifier is an error, and callers are
//! expected to skip-and-log those rather than abort a batch.

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value as JsonValue;
use stayscout_core::{
    AvailabilityWindow, CaptureContext, DayAvailability, ListingIdentity, ListingSnapshot,
    RawDayEntry, RawSnapshot,
};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "stayscout-extract";

lazy_static! {
    /// Room-id segment of a listing URL.
    static ref ROOM_ID_RE: Regex = Regex::new(r"/rooms/(\d+)").unwrap();

    /// Compact card rating: `4.87 (123)`.
    static ref RATING_PAREN_RE: Regex = Regex::new(r"(\d(?:\.\d+)?)\s*\((\d[\d,]*)\)").unwrap();

    /// Accessible-text rating: `4.87 out of 5 average rating, 123 reviews`.
    static ref RATING_VERBOSE_RE: Regex =
        Regex::new(r"(?i)(\d(?:\.\d+)?) out of 5 average rating,\s*(\d[\d,]*) reviews").unwrap();

    /// Combined price line: `$1,350 for 3 nights`.
    static ref PRICE_FOR_NIGHTS_RE: Regex =
        Regex::new(r"(?i)\$([\d,]+)\s*for\s*(\d+)\s*nights?").unwrap();

    static ref PRICE_LINE_RE: Regex = Regex::new(r"\$([\d,]+)").unwrap();
    static ref NIGHTS_LINE_RE: Regex = Regex::new(r"(?i)for\s*(\d+)\s*nights?").unwrap();

    /// Capacity summary: `4 guests · 2 bedrooms · 2 beds · 1.5 baths`.
    static ref CAPACITY_RE: Regex = Regex::new(
        r"(?i)(\d+)\s+guests?\s*·\s*(\d+)\s+bedrooms?\s*·\s*(\d+)\s+beds?\s*·\s*([\d.]+)\s+baths?"
    )
    .unwrap();

    /// Capacity summary without the beds segment.
    static ref CAPACITY_NO_BEDS_RE: Regex =
        Regex::new(r"(?i)(\d+)\s+guests?\s*·\s*(\d+)\s+bedrooms?\s*·\s*([\d.]+)\s+baths?").unwrap();

    /// US-style date inside a `calendar-day-*` testid.
    static ref CAL_DAY_RE: Regex = Regex::new(r"(\d{2}/\d{2}/\d{4})").unwrap();
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("no listing identifier in source url `{url}`")]
    MalformedSource { url: String },
}

/// Derives the stable identity for a listing URL.
///
/// Query strings, locale path prefixes, and trailing slashes never
/// change the result: only the digits after the `/rooms/` marker count.
pub fn resolve_identity(url: &str) -> Result<ListingIdentity, ExtractError> {
    ROOM_ID_RE
        .captures(url)
        .map(|caps| ListingIdentity::new(&caps[1]))
        .ok_or_else(|| ExtractError::MalformedSource {
            url: url.to_string(),
        })
}

/// Human-readable label for a search source URL: the `query` parameter
/// when present, the `/s/<place>/` path segment otherwise, the host as
/// a last resort.
pub fn origin_label_from_url(url: &str) -> String {
    if let Some(query) = query_param(url, "query") {
        return query;
    }
    let path = url_path(url);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() >= 2 && segments[0] == "s" {
        return percent_decode(segments[1]).replace("--", " ");
    }
    url_host(url).to_string()
}

/// Midpoint of the `ne_lat/ne_lng/sw_lat/sw_lng` viewport parameters a
/// map-bounded search URL carries, when all four parse.
pub fn origin_center_from_url(url: &str) -> Option<(f64, f64)> {
    let ne_lat: f64 = query_param(url, "ne_lat")?.parse().ok()?;
    let ne_lng: f64 = query_param(url, "ne_lng")?.parse().ok()?;
    let sw_lat: f64 = query_param(url, "sw_lat")?.parse().ok()?;
    let sw_lng: f64 = query_param(url, "sw_lng")?.parse().ok()?;
    Some(((ne_lat + sw_lat) / 2.0, (ne_lng + sw_lng) / 2.0))
}

/// Normalizes one raw snapshot into typed fields. Pure and infallible:
/// a field that cannot be coerced is absent in the output, never an
/// error.
pub fn normalize(raw: &RawSnapshot, ctx: &CaptureContext) -> ListingSnapshot {
    let (text_rating, text_reviews) = rating_from_text(raw.review_text.as_deref());

    let rating = raw
        .rating
        .as_ref()
        .and_then(|value| coerce_f64("rating", value))
        .or(text_rating);
    let review_count = raw
        .review_count
        .as_ref()
        .and_then(|value| coerce_i64("review_count", value))
        .or(text_reviews);

    let (guests, bedrooms, beds, bathrooms) = capacity_from_line(raw.capacity_line.as_deref());
    let (total_price, nights, price_per_night) = price_from_text(raw.price_text.as_deref());

    ListingSnapshot {
        source_url: raw.url.clone(),
        rating,
        review_count,
        guests,
        bedrooms,
        beds,
        bathrooms,
        total_price,
        nights,
        price_per_night,
        date_range_text: raw.date_range_text.as_deref().and_then(text_or_none),
        origin_url: ctx.origin_url.clone(),
        origin_label: ctx.origin_label.clone(),
        captured_at: raw.captured_at.unwrap_or(ctx.captured_at),
    }
}

/// Builds an availability window from raw calendar day entries.
/// Unparseable dates are skipped per entry; duplicate dates keep the
/// last observation.
pub fn parse_day_entries(entries: &[RawDayEntry]) -> AvailabilityWindow {
    AvailabilityWindow::from_days(entries.iter().filter_map(|entry| {
        let Some(date) = parse_day_date(&entry.date) else {
            debug!(raw = %entry.date, "skipping calendar entry with unparseable date");
            return None;
        };
        Some(DayAvailability {
            date,
            blocked: coerce_blocked(&entry.blocked),
        })
    }))
}

fn parse_day_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date);
    }
    let caps = CAL_DAY_RE.captures(trimmed)?;
    NaiveDate::parse_from_str(&caps[1], "%m/%d/%Y").ok()
}

fn coerce_blocked(value: &JsonValue) -> bool {
    match value {
        JsonValue::Bool(flag) => *flag,
        JsonValue::String(text) => text.trim().eq_ignore_ascii_case("true"),
        _ => false,
    }
}

fn rating_from_text(text: Option<&str>) -> (Option<f64>, Option<i64>) {
    let Some(text) = text else {
        return (None, None);
    };
    let caps = RATING_PAREN_RE
        .captures(text)
        .or_else(|| RATING_VERBOSE_RE.captures(text));
    match caps {
        Some(caps) => (parse_f64(&caps[1]), parse_grouped_int(&caps[2])),
        None => (None, None),
    }
}

fn capacity_from_line(
    line: Option<&str>,
) -> (Option<i64>, Option<i64>, Option<i64>, Option<f64>) {
    let Some(line) = line else {
        return (None, None, None, None);
    };
    if let Some(caps) = CAPACITY_RE.captures(line) {
        return (
            parse_grouped_int(&caps[1]),
            parse_grouped_int(&caps[2]),
            parse_grouped_int(&caps[3]),
            parse_f64(&caps[4]),
        );
    }
    if let Some(caps) = CAPACITY_NO_BEDS_RE.captures(line) {
        // Beds stays absent when the summary omits it.
        return (
            parse_grouped_int(&caps[1]),
            parse_grouped_int(&caps[2]),
            None,
            parse_f64(&caps[3]),
        );
    }
    debug!(line, "capacity line did not match any known shape");
    (None, None, None, None)
}

fn price_from_text(text: Option<&str>) -> (Option<i64>, Option<i64>, Option<f64>) {
    let Some(text) = text else {
        return (None, None, None);
    };
    let (total_price, nights) = match PRICE_FOR_NIGHTS_RE.captures(text) {
        Some(caps) => (parse_grouped_int(&caps[1]), parse_grouped_int(&caps[2])),
        None => (
            PRICE_LINE_RE
                .captures(text)
                .and_then(|caps| parse_grouped_int(&caps[1])),
            NIGHTS_LINE_RE
                .captures(text)
                .and_then(|caps| parse_grouped_int(&caps[1])),
        ),
    };
    let price_per_night = match (total_price, nights) {
        (Some(total), Some(nights)) if nights > 0 => {
            Some(round2(total as f64 / nights as f64))
        }
        _ => None,
    };
    (total_price, nights, price_per_night)
}

fn coerce_f64(field: &str, value: &JsonValue) -> Option<f64> {
    let coerced = match value {
        JsonValue::Number(num) => num.as_f64(),
        JsonValue::String(text) => text.trim().parse().ok(),
        _ => None,
    };
    if coerced.is_none() && !value.is_null() {
        debug!(field, %value, "field not coercible to a number, treating as absent");
    }
    coerced
}

fn coerce_i64(field: &str, value: &JsonValue) -> Option<i64> {
    let coerced = match value {
        JsonValue::Number(num) => num.as_i64(),
        JsonValue::String(text) => parse_grouped_int(text),
        _ => None,
    };
    if coerced.is_none() && !value.is_null() {
        debug!(field, %value, "field not coercible to a count, treating as absent");
    }
    coerced
}

/// Parses an integer that may use comma grouping (`1,234`).
fn parse_grouped_int(text: &str) -> Option<i64> {
    let cleaned = text.trim().replace(',', "");
    cleaned.parse().ok()
}

fn parse_f64(text: &str) -> Option<f64> {
    text.trim().parse().ok()
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn text_or_none(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn url_path(url: &str) -> &str {
    let without_scheme = match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => url,
    };
    let without_query = without_scheme
        .split_once('?')
        .map(|(head, _)| head)
        .unwrap_or(without_scheme);
    match without_query.find('/') {
        Some(idx) => &without_query[idx..],
        None => "",
    }
}

fn url_host(url: &str) -> &str {
    let without_scheme = match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => url,
    };
    without_scheme
        .split(['/', '?'])
        .next()
        .unwrap_or(without_scheme)
}

fn query_param(url: &str, key: &str) -> Option<String> {
    let (_, query) = url.split_once('?')?;
    for pair in query.split('&') {
        let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
        if name == key && !value.is_empty() {
            return Some(percent_decode(value));
        }
    }
    None
}

fn percent_decode(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(if bytes[i] == b'+' { b' ' } else { bytes[i] });
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
