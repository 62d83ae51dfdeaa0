//! SQLite-backed listing store, per-identity write serialization, and
//! the immutable raw-payload archive.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, SqlitePool};
use stayscout_core::{ListingIdentity, ListingRecord, ListingSnapshot, OccupancyStats};
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "stayscout-store";

const LISTINGS_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS listings (
    identity TEXT PRIMARY KEY,
    listing_url TEXT NOT NULL,
    origin_url TEXT,
    origin_label TEXT,
    rating REAL,
    review_count INTEGER,
    guests INTEGER,
    bedrooms INTEGER,
    beds INTEGER,
    bathrooms REAL,
    total_price INTEGER,
    nights INTEGER,
    price_per_night REAL,
    date_range_text TEXT,
    first_seen_at TEXT NOT NULL,
    last_seen_at TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1
);
";

const OCCUPANCY_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS listing_occupancy (
    identity TEXT PRIMARY KEY,
    horizon_start TEXT NOT NULL,
    horizon_end TEXT NOT NULL,
    forward_days INTEGER NOT NULL,
    days_booked INTEGER NOT NULL,
    days_not_booked INTEGER NOT NULL,
    vacancy_pct REAL,
    occupancy_pct REAL,
    booked_ranges TEXT NOT NULL,
    available_ranges TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("listing store unavailable: {0}")]
    Unavailable(#[from] sqlx::Error),
    #[error("stored value encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Keyed persistence seam for listing records. The production
/// implementation is [`SqliteListingStore`]; tests inject their own.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn get(&self, identity: &ListingIdentity) -> Result<Option<ListingRecord>, StoreError>;

    /// Insert-or-update keyed on identity. A new identity gets
    /// first-seen == last-seen == `run_ts` and is active; an existing
    /// record keeps every stored attribute the incoming snapshot left
    /// absent, advances last-seen, and is re-activated.
    async fn upsert(
        &self,
        identity: &ListingIdentity,
        snapshot: &ListingSnapshot,
        run_ts: DateTime<Utc>,
    ) -> Result<ListingRecord, StoreError>;

    /// Retires every stored record whose identity is not in `seen`.
    /// Records are never deleted. Returns how many were retired.
    async fn mark_inactive(&self, seen: &HashSet<ListingIdentity>) -> Result<u64, StoreError>;

    async fn list_active(&self) -> Result<Vec<ListingRecord>, StoreError>;

    async fn list_all(&self) -> Result<Vec<ListingRecord>, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqliteListingStore {
    pool: SqlitePool,
}

impl SqliteListingStore {
    /// Opens (creating if needed) the single-file results database and
    /// bootstraps the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        let store = Self { pool };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(LISTINGS_SCHEMA_SQL).execute(&self.pool).await?;
        sqlx::query(OCCUPANCY_SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Replaces the stored occupancy projection for a listing. Unlike
    /// listing upserts this overwrite is total: stats rows are whole
    /// recomputations, not partial observations.
    pub async fn upsert_occupancy(
        &self,
        identity: &ListingIdentity,
        stats: &OccupancyStats,
        updated_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "
            INSERT INTO listing_occupancy (
                identity, horizon_start, horizon_end, forward_days, days_booked,
                days_not_booked, vacancy_pct, occupancy_pct, booked_ranges,
                available_ranges, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(identity) DO UPDATE SET
                horizon_start = excluded.horizon_start,
                horizon_end = excluded.horizon_end,
                forward_days = excluded.forward_days,
                days_booked = excluded.days_booked,
                days_not_booked = excluded.days_not_booked,
                vacancy_pct = excluded.vacancy_pct,
                occupancy_pct = excluded.occupancy_pct,
                booked_ranges = excluded.booked_ranges,
                available_ranges = excluded.available_ranges,
                updated_at = excluded.updated_at
            ",
        )
        .bind(identity.as_str())
        .bind(stats.horizon_start)
        .bind(stats.horizon_end)
        .bind(stats.forward_days)
        .bind(stats.days_booked)
        .bind(stats.days_not_booked)
        .bind(stats.vacancy_pct)
        .bind(stats.occupancy_pct)
        .bind(serde_json::to_string(&stats.booked_ranges)?)
        .bind(serde_json::to_string(&stats.available_ranges)?)
        .bind(updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_occupancy(
        &self,
        identity: &ListingIdentity,
    ) -> Result<Option<OccupancyStats>, StoreError> {
        let row = sqlx::query("SELECT * FROM listing_occupancy WHERE identity = ?1")
            .bind(identity.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| occupancy_from_row(&row)).transpose()
    }
}

#[async_trait]
impl ListingStore for SqliteListingStore {
    async fn get(&self, identity: &ListingIdentity) -> Result<Option<ListingRecord>, StoreError> {
        let row = sqlx::query("SELECT * FROM listings WHERE identity = ?1")
            .bind(identity.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| record_from_row(&row)).transpose()?)
    }

    async fn upsert(
        &self,
        identity: &ListingIdentity,
        snapshot: &ListingSnapshot,
        run_ts: DateTime<Utc>,
    ) -> Result<ListingRecord, StoreError> {
        let row = sqlx::query(
            "
            INSERT INTO listings (
                identity, listing_url, origin_url, origin_label, rating, review_count,
                guests, bedrooms, beds, bathrooms, total_price, nights, price_per_night,
                date_range_text, first_seen_at, last_seen_at, active
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15, 1)
            ON CONFLICT(identity) DO UPDATE SET
                origin_url = COALESCE(excluded.origin_url, listings.origin_url),
                origin_label = COALESCE(excluded.origin_label, listings.origin_label),
                rating = COALESCE(excluded.rating, listings.rating),
                review_count = COALESCE(excluded.review_count, listings.review_count),
                guests = COALESCE(excluded.guests, listings.guests),
                bedrooms = COALESCE(excluded.bedrooms, listings.bedrooms),
                beds = COALESCE(excluded.beds, listings.beds),
                bathrooms = COALESCE(excluded.bathrooms, listings.bathrooms),
                total_price = COALESCE(excluded.total_price, listings.total_price),
                nights = COALESCE(excluded.nights, listings.nights),
                price_per_night = COALESCE(excluded.price_per_night, listings.price_per_night),
                date_range_text = COALESCE(excluded.date_range_text, listings.date_range_text),
                last_seen_at = excluded.last_seen_at,
                active = 1
            RETURNING *
            ",
        )
        .bind(identity.as_str())
        .bind(identity.canonical_url())
        .bind(&snapshot.origin_url)
        .bind(&snapshot.origin_label)
        .bind(snapshot.rating)
        .bind(snapshot.review_count)
        .bind(snapshot.guests)
        .bind(snapshot.bedrooms)
        .bind(snapshot.beds)
        .bind(snapshot.bathrooms)
        .bind(snapshot.total_price)
        .bind(snapshot.nights)
        .bind(snapshot.price_per_night)
        .bind(&snapshot.date_range_text)
        .bind(run_ts)
        .fetch_one(&self.pool)
        .await?;
        Ok(record_from_row(&row)?)
    }

    async fn mark_inactive(&self, seen: &HashSet<ListingIdentity>) -> Result<u64, StoreError> {
        if seen.is_empty() {
            let result = sqlx::query("UPDATE listings SET active = 0 WHERE active = 1")
                .execute(&self.pool)
                .await?;
            return Ok(result.rows_affected());
        }

        let mut builder =
            QueryBuilder::new("UPDATE listings SET active = 0 WHERE active = 1 AND identity NOT IN (");
        let mut identities = builder.separated(", ");
        for identity in seen {
            identities.push_bind(identity.as_str());
        }
        identities.push_unseparated(")");
        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn list_active(&self) -> Result<Vec<ListingRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM listings WHERE active = 1 ORDER BY CAST(identity AS INTEGER)",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect::<Result<_, _>>().map_err(StoreError::from)
    }

    async fn list_all(&self) -> Result<Vec<ListingRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM listings ORDER BY CAST(identity AS INTEGER)")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(record_from_row).collect::<Result<_, _>>().map_err(StoreError::from)
    }
}

fn record_from_row(row: &SqliteRow) -> Result<ListingRecord, sqlx::Error> {
    Ok(ListingRecord {
        identity: ListingIdentity::new(row.try_get::<String, _>("identity")?),
        listing_url: row.try_get("listing_url")?,
        origin_url: row.try_get("origin_url")?,
        origin_label: row.try_get("origin_label")?,
        rating: row.try_get("rating")?,
        review_count: row.try_get("review_count")?,
        guests: row.try_get("guests")?,
        bedrooms: row.try_get("bedrooms")?,
        beds: row.try_get("beds")?,
        bathrooms: row.try_get("bathrooms")?,
        total_price: row.try_get("total_price")?,
        nights: row.try_get("nights")?,
        price_per_night: row.try_get("price_per_night")?,
        date_range_text: row.try_get("date_range_text")?,
        first_seen_at: row.try_get("first_seen_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
        active: row.try_get("active")?,
    })
}

fn occupancy_from_row(row: &SqliteRow) -> Result<OccupancyStats, StoreError> {
    let booked_ranges: Vec<String> =
        serde_json::from_str(&row.try_get::<String, _>("booked_ranges")?)?;
    let available_ranges: Vec<String> =
        serde_json::from_str(&row.try_get::<String, _>("available_ranges")?)?;
    Ok(OccupancyStats {
        horizon_start: row.try_get("horizon_start")?,
        horizon_end: row.try_get("horizon_end")?,
        forward_days: row.try_get("forward_days")?,
        days_booked: row.try_get("days_booked")?,
        days_not_booked: row.try_get("days_not_booked")?,
        vacancy_pct: row.try_get("vacancy_pct")?,
        occupancy_pct: row.try_get("occupancy_pct")?,
        booked_ranges,
        available_ranges,
    })
}

/// Serializes writes per listing identity. Distinct identities acquire
/// independent locks and never contend; repeat observations of one
/// identity within a run take the same lock and apply in order.
#[derive(Debug, Default)]
pub struct IdentityLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, identity: &ListingIdentity) -> tokio::sync::OwnedMutexGuard<()> {
        let slot = {
            let mut map = self.inner.lock().await;
            map.entry(identity.as_str().to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }
}

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable archive for raw run payloads: date-partitioned,
/// content-hash-named, written via temp file + atomic rename. Archiving
/// the same bytes twice is detected as a dedup rather than an error.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub async fn archive(
        &self,
        captured_at: DateTime<Utc>,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let dir = self.root.join(captured_at.format("%Y/%m/%d").to_string());
        let path = dir.join(format!("payload-{}.json", &content_hash[..16]));

        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        if fs::try_exists(&path)
            .await
            .with_context(|| format!("checking archive path {}", path.display()))?
        {
            debug!(path = %path.display(), "payload already archived");
            return Ok(ArchivedPayload {
                content_hash,
                path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = dir.join(format!(".{}.tmp", Uuid::new_v4()));
        fs::write(&temp_path, bytes)
            .await
            .with_context(|| format!("writing temp payload {}", temp_path.display()))?;

        match fs::rename(&temp_path, &path).await {
            Ok(()) => Ok(ArchivedPayload {
                content_hash,
                path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(ArchivedPayload {
                    content_hash,
                    path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!("renaming temp payload into place at {}", path.display())
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use tempfile::tempdir;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn snapshot(rating: Option<f64>, review_count: Option<i64>) -> ListingSnapshot {
        ListingSnapshot {
            source_url: "https://www.airbnb.com/rooms/42".to_string(),
            rating,
            review_count,
            guests: Some(4),
            bedrooms: Some(2),
            beds: None,
            bathrooms: Some(1.5),
            total_price: Some(1350),
            nights: Some(3),
            price_per_night: Some(450.0),
            date_range_text: Some("Mar 3–6".to_string()),
            origin_url: Some("https://www.airbnb.com/s/Lisbon--Portugal/homes".to_string()),
            origin_label: Some("Lisbon Portugal".to_string()),
            captured_at: ts(8),
        }
    }

    async fn open_store(dir: &tempfile::TempDir) -> SqliteListingStore {
        SqliteListingStore::open(dir.path().join("stayscout.db"))
            .await
            .expect("open store")
    }

    #[tokio::test]
    async fn first_upsert_creates_active_record_with_matching_seen_stamps() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let identity = ListingIdentity::new("42");

        let record = store
            .upsert(&identity, &snapshot(Some(4.8), Some(120)), ts(9))
            .await
            .expect("upsert");

        assert_eq!(record.identity, identity);
        assert_eq!(record.listing_url, "https://www.airbnb.com/rooms/42");
        assert_eq!(record.first_seen_at, ts(9));
        assert_eq!(record.last_seen_at, ts(9));
        assert!(record.active);
        assert_eq!(record.rating, Some(4.8));
        assert_eq!(record.beds, None);
    }

    #[tokio::test]
    async fn merge_never_erases_previously_known_values() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let identity = ListingIdentity::new("42");

        store
            .upsert(&identity, &snapshot(Some(4.8), Some(120)), ts(9))
            .await
            .expect("first upsert");

        let mut partial = snapshot(None, Some(121));
        partial.guests = None;
        let record = store
            .upsert(&identity, &partial, ts(10))
            .await
            .expect("second upsert");

        assert_eq!(record.rating, Some(4.8), "absent rating must not erase stored one");
        assert_eq!(record.review_count, Some(121), "present value replaces stored one");
        assert_eq!(record.guests, Some(4));
        assert_eq!(record.first_seen_at, ts(9));
        assert_eq!(record.last_seen_at, ts(10));

        let fetched = store.get(&identity).await.expect("get").expect("record present");
        assert_eq!(fetched, record);
        assert_eq!(store.get(&ListingIdentity::new("999")).await.expect("get"), None);
    }

    #[tokio::test]
    async fn repeated_identical_upsert_only_advances_last_seen() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let identity = ListingIdentity::new("42");

        let first = store
            .upsert(&identity, &snapshot(Some(4.8), Some(120)), ts(9))
            .await
            .expect("first upsert");
        let second = store
            .upsert(&identity, &snapshot(Some(4.8), Some(120)), ts(11))
            .await
            .expect("second upsert");

        assert_eq!(second.last_seen_at, ts(11));
        assert_eq!(
            ListingRecord {
                last_seen_at: first.last_seen_at,
                ..second
            },
            first
        );
    }

    #[tokio::test]
    async fn mark_inactive_retires_exactly_the_absentees() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let kept = ListingIdentity::new("42");
        let dropped = ListingIdentity::new("43");

        for identity in [&kept, &dropped] {
            store
                .upsert(identity, &snapshot(None, None), ts(9))
                .await
                .expect("seed upsert");
        }

        let all: HashSet<_> = [kept.clone(), dropped.clone()].into_iter().collect();
        assert_eq!(store.mark_inactive(&all).await.expect("none retired"), 0);

        let seen: HashSet<_> = [kept.clone()].into_iter().collect();
        assert_eq!(store.mark_inactive(&seen).await.expect("one retired"), 1);
        let active = store.list_active().await.expect("list active");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].identity, kept);

        assert_eq!(
            store.mark_inactive(&HashSet::new()).await.expect("all retired"),
            1,
            "empty seen set retires every remaining active record"
        );
        assert!(store.list_active().await.expect("list active").is_empty());
        assert_eq!(store.list_all().await.expect("list all").len(), 2);
    }

    #[tokio::test]
    async fn retired_record_reactivates_when_seen_again() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let identity = ListingIdentity::new("42");

        store
            .upsert(&identity, &snapshot(Some(4.8), None), ts(9))
            .await
            .expect("seed upsert");
        store.mark_inactive(&HashSet::new()).await.expect("retire");

        let record = store
            .upsert(&identity, &snapshot(None, None), ts(12))
            .await
            .expect("re-upsert");
        assert!(record.active);
        assert_eq!(record.rating, Some(4.8));
    }

    #[tokio::test]
    async fn occupancy_rows_roundtrip_including_absent_percentages() {
        let dir = tempdir().expect("tempdir");
        let store = open_store(&dir).await;
        let identity = ListingIdentity::new("42");
        let start: NaiveDate = "2026-03-01".parse().unwrap();
        let end: NaiveDate = "2026-03-31".parse().unwrap();

        let empty = OccupancyStats {
            horizon_start: start,
            horizon_end: end,
            forward_days: 0,
            days_booked: 0,
            days_not_booked: 0,
            vacancy_pct: None,
            occupancy_pct: None,
            booked_ranges: vec![],
            available_ranges: vec![],
        };
        store
            .upsert_occupancy(&identity, &empty, ts(9))
            .await
            .expect("store empty stats");
        let loaded = store
            .get_occupancy(&identity)
            .await
            .expect("load stats")
            .expect("stats present");
        assert_eq!(loaded, empty);
        assert!(!loaded.is_applicable());

        let filled = OccupancyStats {
            forward_days: 2,
            days_booked: 1,
            days_not_booked: 1,
            vacancy_pct: Some(50.0),
            occupancy_pct: Some(50.0),
            booked_ranges: vec!["2026-03-02".to_string()],
            available_ranges: vec!["2026-03-01".to_string()],
            ..empty
        };
        store
            .upsert_occupancy(&identity, &filled, ts(10))
            .await
            .expect("overwrite stats");
        assert_eq!(
            store.get_occupancy(&identity).await.expect("reload").expect("present"),
            filled
        );
    }

    #[tokio::test]
    async fn archive_dedupes_identical_payload_bytes() {
        let dir = tempdir().expect("tempdir");
        let archive = PayloadArchive::new(dir.path());

        let first = archive
            .archive(ts(9), b"{\"sources\":[]}")
            .await
            .expect("first archive");
        let second = archive
            .archive(ts(9), b"{\"sources\":[]}")
            .await
            .expect("second archive");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.path, second.path);
        assert!(first.path.exists());
    }

    #[tokio::test]
    async fn identity_locks_hand_out_one_guard_per_identity_at_a_time() {
        let locks = IdentityLocks::new();
        let identity = ListingIdentity::new("42");
        let other = ListingIdentity::new("43");

        let guard = locks.acquire(&identity).await;
        // A different identity is not blocked by the held guard.
        let _other_guard = locks.acquire(&other).await;
        drop(guard);
        let _reacquired = locks.acquire(&identity).await;
    }
}
