//! HTTP fetch primitive + SQLite-backed run/listing stores for koopwatch.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use koopwatch_core::{
    City, CityId, Listing, ListingId, ListingRecord, NewListing, Run, RunId, StatusDict,
};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "koopwatch-storage";

static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            FetchError::HttpStatus { status, .. } => Some(*status),
        }
    }
}

/// Anything that can hand back the HTML of a results page.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, url: &str) -> Result<FetchedResponse, FetchError>;
}

/// Single-attempt HTTP client. Callers decide what a failed fetch means.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();

            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }

            let body = resp.text().await?;
            debug!(status = status.as_u16(), bytes = body.len(), "fetched page");
            Ok(FetchedResponse {
                status: status.as_u16(),
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl PageSource for HttpFetcher {
    async fn fetch_page(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_text(url).await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("run {0} does not exist or is already closed")]
    RunNotOpen(RunId),
}

#[async_trait]
pub trait CityDirectory: Send + Sync {
    /// Enabled cities, ordered by id.
    async fn list_enabled_cities(&self) -> Result<Vec<City>, StoreError>;
}

#[async_trait]
pub trait StatusDirectory: Send + Sync {
    async fn list_status_codes(&self) -> Result<StatusDict, StoreError>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn open_run(
        &self,
        city_id: CityId,
        max_page: i64,
        start_time: DateTime<Utc>,
    ) -> Result<RunId, StoreError>;

    async fn close_run(&self, run_id: RunId, end_time: DateTime<Utc>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    /// All-or-nothing insert of one page worth of listings.
    async fn bulk_append(&self, records: &[NewListing]) -> Result<usize, StoreError>;
}

/// Run row joined with its city name and stored listing count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOverview {
    pub run: Run,
    pub city_name: String,
    pub listing_count: i64,
}

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true)
            .foreign_keys(true);

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating database directory {}", parent.display()))?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        Ok(Self { pool })
    }

    /// Private in-memory database; one connection so every query sees the same data.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory database url")?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("opening in-memory database")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn list_cities(&self) -> Result<Vec<City>, StoreError> {
        let rows = sqlx::query("SELECT id, name, is_enabled FROM city ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(city_from_row).collect::<Result<Vec<_>, _>>()?)
    }

    pub async fn add_city(&self, name: &str) -> Result<CityId, StoreError> {
        let result = sqlx::query("INSERT INTO city (name, is_enabled) VALUES (?, 0)")
            .bind(name.trim())
            .execute(&self.pool)
            .await?;
        Ok(CityId(result.last_insert_rowid()))
    }

    /// Disables every city, then enables exactly `ids`. Returns how many were enabled.
    pub async fn set_enabled_cities(&self, ids: &[CityId]) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("UPDATE city SET is_enabled = 0")
            .execute(&mut *tx)
            .await?;
        let mut enabled = 0;
        for id in ids {
            enabled += sqlx::query("UPDATE city SET is_enabled = 1 WHERE id = ?")
                .bind(id.0)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(enabled)
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query(
            "SELECT id, city_id, max_page, start_time, end_time FROM scrape_run WHERE id = ?",
        )
        .bind(run_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(run_from_row).transpose()?)
    }

    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<RunOverview>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT r.id, r.city_id, r.max_page, r.start_time, r.end_time,
                   c.name AS city_name,
                   (SELECT COUNT(*) FROM listing l WHERE l.run_id = r.id) AS listing_count
              FROM scrape_run r
              JOIN city c ON c.id = r.city_id
             ORDER BY r.id DESC
             LIMIT ?
            "#,
        )
        .bind(limit.max(1))
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(RunOverview {
                run: run_from_row(row)?,
                city_name: row.try_get("city_name")?,
                listing_count: row.try_get("listing_count")?,
            });
        }
        Ok(out)
    }

    pub async fn listings_for_run(&self, run_id: RunId) -> Result<Vec<Listing>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, run_id, city_id, status_code, address, postcode, neighborhood,
                   asking_price_minor_units, size_sqm, room_count, construction_year,
                   broker_name, source_link, map_query_link, scraped_at
              FROM listing
             WHERE run_id = ?
             ORDER BY id
            "#,
        )
        .bind(run_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(listing_from_row).collect::<Result<Vec<_>, _>>()?)
    }
}

fn city_from_row(row: &SqliteRow) -> Result<City, sqlx::Error> {
    Ok(City {
        id: CityId(row.try_get("id")?),
        name: row.try_get("name")?,
        enabled: row.try_get("is_enabled")?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<Run, sqlx::Error> {
    Ok(Run {
        id: RunId(row.try_get("id")?),
        city_id: CityId(row.try_get("city_id")?),
        max_page: row.try_get("max_page")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
    })
}

fn listing_from_row(row: &SqliteRow) -> Result<Listing, sqlx::Error> {
    Ok(Listing {
        id: ListingId(row.try_get("id")?),
        run_id: RunId(row.try_get("run_id")?),
        city_id: CityId(row.try_get("city_id")?),
        scraped_at: row.try_get("scraped_at")?,
        record: ListingRecord {
            status_code: row.try_get("status_code")?,
            address: row.try_get("address")?,
            postcode: row.try_get("postcode")?,
            neighborhood: row.try_get("neighborhood")?,
            asking_price_minor_units: row.try_get("asking_price_minor_units")?,
            size_sqm: row.try_get("size_sqm")?,
            room_count: row.try_get("room_count")?,
            construction_year: row.try_get("construction_year")?,
            broker_name: row.try_get("broker_name")?,
            source_link: row.try_get("source_link")?,
            map_query_link: row.try_get("map_query_link")?,
        },
    })
}

#[async_trait]
impl CityDirectory for SqliteStore {
    async fn list_enabled_cities(&self) -> Result<Vec<City>, StoreError> {
        let rows =
            sqlx::query("SELECT id, name, is_enabled FROM city WHERE is_enabled = 1 ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.iter().map(city_from_row).collect::<Result<Vec<_>, _>>()?)
    }
}

#[async_trait]
impl StatusDirectory for SqliteStore {
    async fn list_status_codes(&self) -> Result<StatusDict, StoreError> {
        let rows = sqlx::query("SELECT code, label FROM listing_status")
            .fetch_all(&self.pool)
            .await?;
        let mut entries = Vec::with_capacity(rows.len());
        for row in &rows {
            let label: String = row.try_get("label")?;
            let code: i32 = row.try_get("code")?;
            entries.push((label, code));
        }
        Ok(StatusDict::new(entries))
    }
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn open_run(
        &self,
        city_id: CityId,
        max_page: i64,
        start_time: DateTime<Utc>,
    ) -> Result<RunId, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO scrape_run (city_id, max_page, start_time, end_time)
            VALUES (?, ?, ?, NULL)
            "#,
        )
        .bind(city_id.0)
        .bind(max_page)
        .bind(start_time)
        .execute(&self.pool)
        .await?;
        Ok(RunId(result.last_insert_rowid()))
    }

    async fn close_run(&self, run_id: RunId, end_time: DateTime<Utc>) -> Result<(), StoreError> {
        let affected =
            sqlx::query("UPDATE scrape_run SET end_time = ? WHERE id = ? AND end_time IS NULL")
                .bind(end_time)
                .bind(run_id.0)
                .execute(&self.pool)
                .await?
                .rows_affected();
        if affected == 0 {
            return Err(StoreError::RunNotOpen(run_id));
        }
        Ok(())
    }
}

#[async_trait]
impl ListingStore for SqliteStore {
    async fn bulk_append(&self, records: &[NewListing]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for listing in records {
            let r = &listing.record;
            sqlx::query(
                r#"
                INSERT INTO listing (
                    run_id, city_id, status_code, address, postcode, neighborhood,
                    asking_price_minor_units, size_sqm, room_count, construction_year,
                    broker_name, source_link, map_query_link, scraped_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(listing.run_id.0)
            .bind(listing.city_id.0)
            .bind(r.status_code)
            .bind(&r.address)
            .bind(&r.postcode)
            .bind(&r.neighborhood)
            .bind(r.asking_price_minor_units)
            .bind(r.size_sqm)
            .bind(r.room_count)
            .bind(r.construction_year)
            .bind(&r.broker_name)
            .bind(&r.source_link)
            .bind(&r.map_query_link)
            .bind(listing.scraped_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(records.len())
    }
}
