//! Core domain model for koopwatch: cities, run logs, listings and their sentinels.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "koopwatch-core";

/// Asking price stored for listings marked "prijs op aanvraag".
pub const PRICE_ON_REQUEST: i64 = -1;

/// Status code for a listing that carries no label at all.
pub const STATUS_NO_LABEL: i32 = 0;

/// Status code for a label whose text is not in the status dictionary.
pub const STATUS_UNKNOWN: i32 = -1;

/// `max_page` recorded on a run whose page-count discovery failed.
pub const MAX_PAGE_UNKNOWN: i64 = -1;

macro_rules! row_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(CityId);
row_id!(RunId);
row_id!(ListingId);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct City {
    pub id: CityId,
    pub name: String,
    pub enabled: bool,
}

impl City {
    /// Path segment used by the search site, e.g. "Den Haag" -> "den-haag".
    pub fn slug(&self) -> String {
        self.name
            .split_whitespace()
            .collect::<Vec<_>>()
            .join("-")
            .to_lowercase()
    }
}

/// Immutable snapshot of listing label text -> status code.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusDict {
    codes: HashMap<String, i32>,
}

impl StatusDict {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, i32)>,
        S: Into<String>,
    {
        Self {
            codes: entries
                .into_iter()
                .map(|(label, code)| (label.into().trim().to_string(), code))
                .collect(),
        }
    }

    pub fn code_for(&self, label: Option<&str>) -> i32 {
        match label {
            None => STATUS_NO_LABEL,
            Some(text) => self
                .codes
                .get(text.trim())
                .copied()
                .unwrap_or(STATUS_UNKNOWN),
        }
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Open,
    Closed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunState::Open => f.write_str("OPEN"),
            RunState::Closed => f.write_str("CLOSED"),
        }
    }
}

/// One city's crawl attempt. A run that never gets an `end_time` is the failure record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub city_id: CityId,
    pub max_page: i64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Run {
    pub fn state(&self) -> RunState {
        if self.end_time.is_some() {
            RunState::Closed
        } else {
            RunState::Open
        }
    }
}

/// Fields extracted from a single listing node, before it is attached to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub status_code: i32,
    pub address: String,
    pub postcode: String,
    pub neighborhood: String,
    /// Euro cents, or [`PRICE_ON_REQUEST`].
    pub asking_price_minor_units: i64,
    pub size_sqm: i64,
    pub room_count: i64,
    pub construction_year: i64,
    pub broker_name: String,
    pub source_link: String,
    pub map_query_link: String,
}

impl ListingRecord {
    pub fn is_price_on_request(&self) -> bool {
        self.asking_price_minor_units == PRICE_ON_REQUEST
    }
}

/// Insert contract handed to the listing store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewListing {
    pub run_id: RunId,
    pub city_id: CityId,
    pub scraped_at: DateTime<Utc>,
    pub record: ListingRecord,
}

/// Persisted listing row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub run_id: RunId,
    pub city_id: CityId,
    pub scraped_at: DateTime<Utc>,
    pub record: ListingRecord,
}
