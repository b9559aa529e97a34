//! One crawl pass: per-city page planning, the paced page loop and run bookkeeping.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use koopwatch_adapters::{
    search_page_url, AdapterError, DiscoveryFailure, ListingExtractor, PageDiscovery,
    DEFAULT_ORIGIN,
};
use koopwatch_core::{City, CityId, NewListing, RunId, StatusDict, MAX_PAGE_UNKNOWN};
use koopwatch_storage::{
    CityDirectory, HttpClientConfig, HttpFetcher, ListingStore, PageSource, RunStore,
    SqliteStore, StatusDirectory,
};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "koopwatch-sync";

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub base_url: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub page_delay_secs: u64,
    pub single_page_fallback: bool,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://data/pararius_scrape.db?mode=rwc".to_string()),
            base_url: std::env::var("KOOPWATCH_BASE_URL")
                .unwrap_or_else(|_| DEFAULT_ORIGIN.to_string()),
            user_agent: std::env::var("KOOPWATCH_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: std::env::var("KOOPWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            page_delay_secs: std::env::var("KOOPWATCH_PAGE_DELAY_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            single_page_fallback: std::env::var("KOOPWATCH_SINGLE_PAGE_FALLBACK")
                .ok()
                .and_then(|v| parse_flag(&v))
                .unwrap_or(true),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_secs(self.page_delay_secs)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "True" | "yes" => Some(true),
        "0" | "false" | "FALSE" | "False" | "no" => Some(false),
        _ => None,
    }
}

/// Everything one city's page loop needs, decided before the first page is fetched.
#[derive(Debug, Clone)]
pub struct CrawlSession {
    pub city: City,
    pub run_id: RunId,
    pub max_page: u32,
    pub statuses: StatusDict,
    /// Page 1 body already fetched while planning; crawled without a second request.
    pub first_page: Option<String>,
}

/// Result of planning a city: how many pages to walk, plus the first one.
#[derive(Debug, Clone)]
pub struct PagePlan {
    pub max_page: u32,
    pub first_page: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CrawlReport {
    pub pages_fetched: usize,
    pub pages_failed: usize,
    pub listings_stored: usize,
    pub projects_skipped: usize,
    pub listings_dropped: usize,
}

impl CrawlReport {
    fn absorb(&mut self, other: &CrawlReport) {
        self.pages_fetched += other.pages_fetched;
        self.pages_failed += other.pages_failed;
        self.listings_stored += other.listings_stored;
        self.projects_skipped += other.projects_skipped;
        self.listings_dropped += other.listings_dropped;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlOutcome {
    Completed(CrawlReport),
    Failed { reason: String },
}

/// Walks a city's result pages in order and appends what it extracts, one write per page.
pub struct CityCrawler {
    source: Arc<dyn PageSource>,
    listings: Arc<dyn ListingStore>,
    extractor: ListingExtractor,
    discovery: PageDiscovery,
    page_delay: Duration,
    single_page_fallback: bool,
}

impl CityCrawler {
    pub fn new(
        source: Arc<dyn PageSource>,
        listings: Arc<dyn ListingStore>,
        origin: impl Into<String>,
    ) -> Result<Self, AdapterError> {
        Ok(Self {
            source,
            listings,
            extractor: ListingExtractor::new(origin)?,
            discovery: PageDiscovery::new()?,
            page_delay: Duration::from_secs(2),
            single_page_fallback: true,
        })
    }

    pub fn with_page_delay(mut self, page_delay: Duration) -> Self {
        self.page_delay = page_delay;
        self
    }

    pub fn with_single_page_fallback(mut self, enabled: bool) -> Self {
        self.single_page_fallback = enabled;
        self
    }

    pub fn first_page_url(&self, city: &City) -> String {
        search_page_url(self.extractor.origin(), city, 1)
    }

    /// Fetches page 1 once and reads the page count from it. A first page without
    /// pagination is a one-page city when the fallback is enabled.
    pub async fn plan(&self, city: &City) -> Result<PagePlan, DiscoveryFailure> {
        let url = self.first_page_url(city);
        let first_page = self.source.fetch_page(&url).await?.body;
        let max_page = match self.discovery.max_page_from_html(&first_page) {
            Ok(max_page) => max_page,
            Err(DiscoveryFailure::NoPagination) if self.single_page_fallback => {
                info!(city = %city.name, "no pagination on first page, crawling a single page");
                1
            }
            Err(failure) => return Err(failure),
        };
        debug!(city = %city.name, max_page, "planned crawl");
        Ok(PagePlan {
            max_page,
            first_page,
        })
    }

    pub async fn run(&self, city: &City, run_id: RunId, statuses: &StatusDict) -> CrawlOutcome {
        match self.plan(city).await {
            Ok(plan) => {
                let session = CrawlSession {
                    city: city.clone(),
                    run_id,
                    max_page: plan.max_page,
                    statuses: statuses.clone(),
                    first_page: Some(plan.first_page),
                };
                self.crawl(&session).await
            }
            Err(failure) => {
                warn!(city = %city.name, %run_id, error = %failure, "page discovery failed");
                CrawlOutcome::Failed {
                    reason: failure.to_string(),
                }
            }
        }
    }

    pub async fn crawl(&self, session: &CrawlSession) -> CrawlOutcome {
        if session.max_page == 0 {
            return CrawlOutcome::Failed {
                reason: "empty page plan".to_string(),
            };
        }
        let span = info_span!(
            "city_crawl",
            city = %session.city.name,
            run_id = %session.run_id,
            max_page = session.max_page
        );
        let report = self.crawl_pages(session).instrument(span).await;
        CrawlOutcome::Completed(report)
    }

    async fn crawl_pages(&self, session: &CrawlSession) -> CrawlReport {
        let mut report = CrawlReport::default();

        for page in 1..=session.max_page {
            if page > 1 {
                tokio::time::sleep(self.page_delay).await;
            }

            let body = match (page, session.first_page.as_deref()) {
                (1, Some(body)) => Cow::Borrowed(body),
                _ => {
                    let url = search_page_url(self.extractor.origin(), &session.city, page);
                    match self.source.fetch_page(&url).await {
                        Ok(response) => Cow::Owned(response.body),
                        Err(err) => {
                            warn!(page, %url, error = %err, "skipping unreachable page");
                            report.pages_failed += 1;
                            continue;
                        }
                    }
                }
            };

            let extraction = self.extractor.extract_page(&body, &session.statuses);
            report.projects_skipped += extraction.projects_skipped;
            report.listings_dropped += extraction.dropped.len();

            let scraped_at = Utc::now();
            let rows = extraction
                .records
                .into_iter()
                .map(|record| NewListing {
                    run_id: session.run_id,
                    city_id: session.city.id,
                    scraped_at,
                    record,
                })
                .collect::<Vec<_>>();

            match self.listings.bulk_append(&rows).await {
                Ok(stored) => {
                    report.pages_fetched += 1;
                    report.listings_stored += stored;
                    info!(page, stored, "page stored");
                }
                Err(err) => {
                    warn!(page, listings = rows.len(), error = %err, "failed to store page");
                    report.pages_failed += 1;
                }
            }
        }

        report
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CityDisposition {
    /// Crawl completed and the run was closed.
    Closed,
    /// A run was opened but never closed.
    LeftOpen,
    /// No run could be opened.
    NotOpened,
}

#[derive(Debug, Clone, Serialize)]
pub struct CitySyncResult {
    pub city_id: CityId,
    pub city_name: String,
    pub run_id: Option<RunId>,
    pub max_page: i64,
    pub disposition: CityDisposition,
    pub report: Option<CrawlReport>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub enabled_cities: usize,
    pub runs_closed: usize,
    pub runs_left_open: usize,
    pub cities_not_opened: usize,
    pub totals: CrawlReport,
    pub cities: Vec<CitySyncResult>,
}

pub struct RunOrchestrator {
    cities: Arc<dyn CityDirectory>,
    statuses: Arc<dyn StatusDirectory>,
    runs: Arc<dyn RunStore>,
    crawler: CityCrawler,
}

impl RunOrchestrator {
    pub fn new(
        cities: Arc<dyn CityDirectory>,
        statuses: Arc<dyn StatusDirectory>,
        runs: Arc<dyn RunStore>,
        crawler: CityCrawler,
    ) -> Self {
        Self {
            cities,
            statuses,
            runs,
            crawler,
        }
    }

    /// Wires every store role to the same SQLite database.
    pub fn with_sqlite(
        store: Arc<SqliteStore>,
        source: Arc<dyn PageSource>,
        config: &SyncConfig,
    ) -> Result<Self> {
        let listings: Arc<dyn ListingStore> = store.clone();
        let crawler = CityCrawler::new(source, listings, config.base_url.clone())?
            .with_page_delay(config.page_delay())
            .with_single_page_fallback(config.single_page_fallback);
        Ok(Self::new(store.clone(), store.clone(), store, crawler))
    }

    /// One pass over every enabled city. Only a failure to list the cities is an error.
    pub async fn run(&self) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let cities = self
            .cities
            .list_enabled_cities()
            .await
            .context("listing enabled cities")?;
        info!(count = cities.len(), "starting sync pass");

        let mut results = Vec::with_capacity(cities.len());
        for city in &cities {
            results.push(self.sync_city(city).await);
        }

        let mut totals = CrawlReport::default();
        for report in results.iter().filter_map(|r| r.report.as_ref()) {
            totals.absorb(report);
        }
        let count = |d: CityDisposition| results.iter().filter(|r| r.disposition == d).count();

        let summary = SyncRunSummary {
            started_at,
            finished_at: Utc::now(),
            enabled_cities: cities.len(),
            runs_closed: count(CityDisposition::Closed),
            runs_left_open: count(CityDisposition::LeftOpen),
            cities_not_opened: count(CityDisposition::NotOpened),
            totals,
            cities: results,
        };
        info!(
            closed = summary.runs_closed,
            left_open = summary.runs_left_open,
            not_opened = summary.cities_not_opened,
            stored = summary.totals.listings_stored,
            "sync pass finished"
        );
        Ok(summary)
    }

    async fn sync_city(&self, city: &City) -> CitySyncResult {
        let start_time = Utc::now();
        let plan = self.crawler.plan(city).await;
        let max_page = plan
            .as_ref()
            .map_or(MAX_PAGE_UNKNOWN, |p| i64::from(p.max_page));

        let mut result = CitySyncResult {
            city_id: city.id,
            city_name: city.name.clone(),
            run_id: None,
            max_page,
            disposition: CityDisposition::NotOpened,
            report: None,
            reason: None,
        };

        let run_id = match self.runs.open_run(city.id, max_page, start_time).await {
            Ok(run_id) => run_id,
            Err(err) => {
                warn!(city = %city.name, error = %err, "could not open run, skipping city");
                result.reason = Some(err.to_string());
                return result;
            }
        };
        info!(city = %city.name, %run_id, max_page, "run opened");
        result.run_id = Some(run_id);
        result.disposition = CityDisposition::LeftOpen;

        let plan = match plan {
            Ok(plan) => plan,
            Err(failure) => {
                warn!(
                    city = %city.name,
                    %run_id,
                    error = %failure,
                    "discovery failed, run left open",
                );
                result.reason = Some(failure.to_string());
                return result;
            }
        };

        let statuses = match self.statuses.list_status_codes().await {
            Ok(statuses) => statuses,
            Err(err) => {
                warn!(
                    city = %city.name,
                    %run_id,
                    error = %err,
                    "statuses unavailable, run left open",
                );
                result.reason = Some(err.to_string());
                return result;
            }
        };

        let session = CrawlSession {
            city: city.clone(),
            run_id,
            max_page: plan.max_page,
            statuses,
            first_page: Some(plan.first_page),
        };
        match self.crawler.crawl(&session).await {
            CrawlOutcome::Completed(report) => {
                result.report = Some(report);
                match self.runs.close_run(run_id, Utc::now()).await {
                    Ok(()) => {
                        let stored = report.listings_stored;
                        info!(city = %city.name, %run_id, stored, "run closed");
                        result.disposition = CityDisposition::Closed;
                    }
                    Err(err) => {
                        warn!(
                            city = %city.name,
                            %run_id,
                            error = %err,
                            "close failed, run left open",
                        );
                        result.reason = Some(err.to_string());
                    }
                }
            }
            CrawlOutcome::Failed { reason } => {
                warn!(city = %city.name, %run_id, %reason, "crawl failed, run left open");
                result.reason = Some(reason);
            }
        }
        result
    }
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let store = Arc::new(SqliteStore::connect(&config.database_url).await?);
    store.migrate().await.context("applying migrations")?;
    let fetcher = Arc::new(HttpFetcher::new(config.http_client_config())?);
    let orchestrator = RunOrchestrator::with_sqlite(store, fetcher, &config)?;
    orchestrator.run().await
}
