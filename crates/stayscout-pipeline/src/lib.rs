//! Ingest-run orchestration and forward-window occupancy aggregation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use stayscout_core::{
    AvailabilityWindow, CaptureContext, ListingIdentity, OccupancyStats, RawDayEntry,
    RawRunPayload,
};
use stayscout_store::{IdentityLocks, ListingStore, PayloadArchive, SqliteListingStore};
use tracing::{info, info_span, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "stayscout-pipeline";

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub db_path: PathBuf,
    pub archive_dir: PathBuf,
    pub registry_path: PathBuf,
    pub horizon_days: u64,
}

impl RunConfig {
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("STAYSCOUT_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/stayscout.db")),
            archive_dir: std::env::var("STAYSCOUT_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/archive")),
            registry_path: std::env::var("STAYSCOUT_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("sources.yaml")),
            horizon_days: std::env::var("STAYSCOUT_HORIZON_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }

    /// Horizon of `horizon_days` days beginning at `start`.
    pub fn horizon_from(&self, start: NaiveDate) -> (NaiveDate, NaiveDate) {
        let end = start
            .checked_add_days(Days::new(self.horizon_days.saturating_sub(1)))
            .unwrap_or(start);
        (start, end)
    }

    /// Default occupancy horizon: the first day of the month after
    /// `today`, spanning `horizon_days` days.
    pub fn default_horizon(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        self.horizon_from(first_of_next_month(today))
    }
}

fn first_of_next_month(today: NaiveDate) -> NaiveDate {
    let (year, month) = if today.month() == 12 {
        (today.year() + 1, 1)
    } else {
        (today.year(), today.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).unwrap_or(today)
}

/// Declares the search sources a deployment watches. Sources present in
/// a payload but disabled here are skipped; unlisted sources pass
/// through untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub origin_url: String,
    pub display_name: String,
    pub enabled: bool,
}

impl SourceRegistry {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn is_enabled(&self, origin_url: &str) -> bool {
        self.sources
            .iter()
            .find(|source| source.origin_url == origin_url)
            .map(|source| source.enabled)
            .unwrap_or(true)
    }

    pub fn display_name(&self, origin_url: &str) -> Option<&str> {
        self.sources
            .iter()
            .find(|source| source.origin_url == origin_url)
            .map(|source| source.display_name.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources_processed: usize,
    pub sources_skipped: usize,
    pub snapshots_received: usize,
    pub snapshots_skipped: usize,
    pub listings_upserted: usize,
    pub listings_retired: u64,
    pub archived_payload: Option<String>,
}

/// Drives one extraction run end to end: archive the raw payload,
/// normalize and resolve every snapshot, upsert under per-identity
/// locks, and only after the whole batch succeeded retire the records
/// this run did not see.
pub struct IngestPipeline<S> {
    store: S,
    locks: IdentityLocks,
    archive: Option<PayloadArchive>,
    registry: Option<SourceRegistry>,
}

impl<S: ListingStore> IngestPipeline<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            locks: IdentityLocks::new(),
            archive: None,
            registry: None,
        }
    }

    pub fn with_archive(mut self, archive: PayloadArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn with_registry(mut self, registry: SourceRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn run(&self, payload: &RawRunPayload) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let span = info_span!("ingest_run", %run_id);
        let _guard = span.enter();

        let archived_payload = match &self.archive {
            Some(archive) => {
                let bytes = serde_json::to_vec(payload).context("serializing run payload")?;
                let archived = archive
                    .archive(started_at, &bytes)
                    .await
                    .context("archiving run payload")?;
                Some(archived.path.display().to_string())
            }
            None => None,
        };

        let mut seen: HashSet<ListingIdentity> = HashSet::new();
        let mut sources_processed = 0usize;
        let mut sources_skipped = 0usize;
        let mut snapshots_received = 0usize;
        let mut snapshots_skipped = 0usize;
        let mut listings_upserted = 0usize;

        for capture in &payload.sources {
            let enabled = self
                .registry
                .as_ref()
                .map(|registry| registry.is_enabled(&capture.source_url))
                .unwrap_or(true);
            if !enabled {
                info!(origin = %capture.source_url, "skipping disabled source");
                sources_skipped += 1;
                continue;
            }

            let ctx = CaptureContext {
                origin_url: Some(capture.source_url.clone()),
                origin_label: capture
                    .source_label
                    .clone()
                    .or_else(|| Some(stayscout_extract::origin_label_from_url(&capture.source_url))),
                captured_at: payload.captured_at.unwrap_or(started_at),
            };

            for raw in &capture.results {
                snapshots_received += 1;
                let snapshot = stayscout_extract::normalize(raw, &ctx);
                let identity = match stayscout_extract::resolve_identity(&snapshot.source_url) {
                    Ok(identity) => identity,
                    Err(err) => {
                        warn!(url = %snapshot.source_url, %err, "skipping snapshot");
                        snapshots_skipped += 1;
                        continue;
                    }
                };

                let _write_guard = self.locks.acquire(&identity).await;
                self.store
                    .upsert(&identity, &snapshot, started_at)
                    .await
                    .with_context(|| format!("upserting listing {identity}"))?;
                seen.insert(identity);
                listings_upserted += 1;
            }
            sources_processed += 1;
        }

        // Retirement only runs once every snapshot of the batch has been
        // applied; an aborted run must not mark still-listed records
        // inactive.
        let listings_retired = self
            .store
            .mark_inactive(&seen)
            .await
            .context("retiring listings absent from this run")?;

        let finished_at = Utc::now();
        info!(
            sources = sources_processed,
            upserted = listings_upserted,
            retired = listings_retired,
            skipped = snapshots_skipped,
            "ingest run finished"
        );

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at,
            sources_processed,
            sources_skipped,
            snapshots_received,
            snapshots_skipped,
            listings_upserted,
            listings_retired,
            archived_payload,
        })
    }
}

/// Restricts `window` to `[horizon_start, horizon_end]` inclusive and
/// projects booked/vacant counts and percentages. Zero captured days
/// yield absent percentages: no data is not the same as no occupancy.
pub fn compute_occupancy(
    window: &AvailabilityWindow,
    horizon_start: NaiveDate,
    horizon_end: NaiveDate,
) -> OccupancyStats {
    let days = window.restricted(horizon_start, horizon_end);
    let booked: Vec<NaiveDate> = days.iter().filter(|d| d.blocked).map(|d| d.date).collect();
    let available: Vec<NaiveDate> = days.iter().filter(|d| !d.blocked).map(|d| d.date).collect();
    let total = days.len() as i64;

    OccupancyStats {
        horizon_start,
        horizon_end,
        forward_days: total,
        days_booked: booked.len() as i64,
        days_not_booked: available.len() as i64,
        vacancy_pct: percentage(available.len(), total),
        occupancy_pct: percentage(booked.len(), total),
        booked_ranges: compress_ranges(&booked),
        available_ranges: compress_ranges(&available),
    }
}

fn percentage(part: usize, total: i64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    Some((part as f64 / total as f64 * 1000.0).round() / 10.0)
}

/// Collapses sorted dates into `start to end` strings, single dates
/// standing alone: `["2026-03-01 to 2026-03-03", "2026-03-07"]`.
pub fn compress_ranges(dates: &[NaiveDate]) -> Vec<String> {
    let mut out = Vec::new();
    let mut dates = dates.iter().copied();
    let Some(first) = dates.next() else {
        return out;
    };

    let mut start = first;
    let mut prev = first;
    for date in dates {
        if date.signed_duration_since(prev).num_days() == 1 {
            prev = date;
            continue;
        }
        out.push(format_range(start, prev));
        start = date;
        prev = date;
    }
    out.push(format_range(start, prev));
    out
}

fn format_range(start: NaiveDate, end: NaiveDate) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start} to {end}")
    }
}

/// One listing's raw forward-calendar capture.
#[derive(Debug, Clone, Deserialize)]
pub struct CalendarCapture {
    pub url: String,
    #[serde(default)]
    pub days: Vec<RawDayEntry>,
}

pub fn load_run_payload(path: impl AsRef<Path>) -> Result<RawRunPayload> {
    read_json_file(path)
}

pub fn load_calendar_captures(path: impl AsRef<Path>) -> Result<Vec<CalendarCapture>> {
    read_json_file(path)
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Computes and persists occupancy stats for a batch of calendar
/// captures. Captures whose URL carries no listing identifier are
/// skipped with a warning, mirroring the ingest path.
pub async fn refresh_occupancy(
    store: &SqliteListingStore,
    captures: &[CalendarCapture],
    horizon_start: NaiveDate,
    horizon_end: NaiveDate,
) -> Result<Vec<(ListingIdentity, OccupancyStats)>> {
    let mut out = Vec::with_capacity(captures.len());
    for capture in captures {
        let identity = match stayscout_extract::resolve_identity(&capture.url) {
            Ok(identity) => identity,
            Err(err) => {
                warn!(url = %capture.url, %err, "skipping calendar capture");
                continue;
            }
        };
        let window = stayscout_extract::parse_day_entries(&capture.days);
        let stats = compute_occupancy(&window, horizon_start, horizon_end);
        store
            .upsert_occupancy(&identity, &stats, Utc::now())
            .await
            .with_context(|| format!("storing occupancy for listing {identity}"))?;
        out.push((identity, stats));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stayscout_core::DayAvailability;

    fn date(iso: &str) -> NaiveDate {
        iso.parse().expect("iso date")
    }

    fn window(days: &[(&str, bool)]) -> AvailabilityWindow {
        AvailabilityWindow::from_days(days.iter().map(|(iso, blocked)| DayAvailability {
            date: date(iso),
            blocked: *blocked,
        }))
    }

    #[test]
    fn empty_horizon_yields_absent_percentages_not_zero() {
        let stats = compute_occupancy(
            &window(&[("2026-02-15", true)]),
            date("2026-03-01"),
            date("2026-03-31"),
        );
        assert_eq!(stats.forward_days, 0);
        assert_eq!(stats.days_booked, 0);
        assert_eq!(stats.days_not_booked, 0);
        assert_eq!(stats.vacancy_pct, None);
        assert_eq!(stats.occupancy_pct, None);
        assert!(!stats.is_applicable());
    }

    #[test]
    fn two_day_split_window_is_fifty_fifty() {
        let stats = compute_occupancy(
            &window(&[("2026-03-01", false), ("2026-03-02", true)]),
            date("2026-03-01"),
            date("2026-03-02"),
        );
        assert_eq!(stats.days_booked, 1);
        assert_eq!(stats.days_not_booked, 1);
        assert_eq!(stats.vacancy_pct, Some(50.0));
        assert_eq!(stats.occupancy_pct, Some(50.0));
        assert_eq!(stats.booked_ranges, vec!["2026-03-02".to_string()]);
        assert_eq!(stats.available_ranges, vec!["2026-03-01".to_string()]);
    }

    #[test]
    fn horizon_restriction_ignores_out_of_range_days() {
        let stats = compute_occupancy(
            &window(&[
                ("2026-02-28", true),
                ("2026-03-01", true),
                ("2026-03-02", true),
                ("2026-03-03", false),
                ("2026-04-01", false),
            ]),
            date("2026-03-01"),
            date("2026-03-31"),
        );
        assert_eq!(stats.forward_days, 3);
        assert_eq!(stats.days_booked, 2);
        assert_eq!(stats.days_not_booked, 1);
        assert_eq!(stats.occupancy_pct, Some(66.7));
        assert_eq!(stats.vacancy_pct, Some(33.3));
    }

    #[test]
    fn ranges_collapse_consecutive_days() {
        let dates = [
            date("2026-03-01"),
            date("2026-03-02"),
            date("2026-03-03"),
            date("2026-03-07"),
            date("2026-03-09"),
            date("2026-03-10"),
        ];
        assert_eq!(
            compress_ranges(&dates),
            vec![
                "2026-03-01 to 2026-03-03".to_string(),
                "2026-03-07".to_string(),
                "2026-03-09 to 2026-03-10".to_string(),
            ]
        );
        assert!(compress_ranges(&[]).is_empty());
    }

    #[test]
    fn registry_disables_only_listed_sources() {
        let registry = SourceRegistry {
            sources: vec![
                SourceConfig {
                    origin_url: "https://www.airbnb.com/s/Lisbon--Portugal/homes".to_string(),
                    display_name: "Lisbon".to_string(),
                    enabled: false,
                },
                SourceConfig {
                    origin_url: "https://www.airbnb.com/s/Porto--Portugal/homes".to_string(),
                    display_name: "Porto".to_string(),
                    enabled: true,
                },
            ],
        };
        assert!(!registry.is_enabled("https://www.airbnb.com/s/Lisbon--Portugal/homes"));
        assert!(registry.is_enabled("https://www.airbnb.com/s/Porto--Portugal/homes"));
        assert!(registry.is_enabled("https://www.airbnb.com/s/Unlisted/homes"));
        assert_eq!(
            registry.display_name("https://www.airbnb.com/s/Porto--Portugal/homes"),
            Some("Porto")
        );
    }

    #[test]
    fn default_horizon_starts_on_the_first_of_next_month() {
        let config = RunConfig {
            db_path: PathBuf::from("data/stayscout.db"),
            archive_dir: PathBuf::from("data/archive"),
            registry_path: PathBuf::from("sources.yaml"),
            horizon_days: 31,
        };
        let (start, end) = config.default_horizon(date("2026-03-15"));
        assert_eq!(start, date("2026-04-01"));
        assert_eq!(end, date("2026-05-01"));

        let (start, end) = config.default_horizon(date("2026-12-20"));
        assert_eq!(start, date("2027-01-01"));
        assert_eq!(end, date("2027-01-31"));
    }
}
