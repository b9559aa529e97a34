use std::path::PathBuf;

use async_trait::async_trait;
use koopwatch_adapters::{
    DiscoveryFailure, ExtractError, ListingExtractor, PageDiscovery, DEFAULT_ORIGIN,
};
use koopwatch_core::{StatusDict, PRICE_ON_REQUEST, STATUS_UNKNOWN};
use koopwatch_storage::{FetchError, FetchedResponse, PageSource};

fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn fixture(name: &str) -> String {
    std::fs::read_to_string(workspace_root().join("fixtures/pararius").join(name))
        .unwrap_or_else(|e| panic!("fixture {name}: {e}"))
}

fn seeded_statuses() -> StatusDict {
    StatusDict::new([
        ("Nieuw", 1),
        ("Onder bod", 2),
        ("Verkocht onder voorbehoud", 3),
        ("Verkocht", 4),
    ])
}

#[test]
fn paginated_first_page_reports_highest_page() {
    let discovery = PageDiscovery::new().unwrap();
    let max = discovery
        .max_page_from_html(&fixture("search_page_paginated.html"))
        .unwrap();
    assert_eq!(max, 7);
}

#[test]
fn single_page_city_has_no_pagination() {
    let discovery = PageDiscovery::new().unwrap();
    let result = discovery.max_page_from_html(&fixture("search_page_single.html"));
    assert!(matches!(result, Err(DiscoveryFailure::NoPagination)));
}

#[test]
fn paginated_first_page_listing_is_extracted() {
    let extractor = ListingExtractor::new(DEFAULT_ORIGIN).unwrap();
    let page = extractor.extract_page(&fixture("search_page_paginated.html"), &seeded_statuses());

    assert_eq!(page.records.len(), 1);
    let record = &page.records[0];
    assert_eq!(record.status_code, 1);
    assert_eq!(record.address, "Oudegracht 112");
    assert_eq!(record.postcode, "3511 AX");
    assert_eq!(record.neighborhood, "Binnenstad");
    assert_eq!(record.asking_price_minor_units, 67_500_000);
    assert_eq!(record.broker_name, "Domstad Makelaars");
    assert_eq!(
        record.source_link,
        "https://www.pararius.nl/huis-te-koop/utrecht/1a2b3c4d/oudegracht"
    );
    assert_eq!(
        record.map_query_link,
        "https://www.google.com/maps/place/Oudegracht+112"
    );
}

#[test]
fn mixed_page_keeps_good_listings_and_accounts_for_the_rest() {
    let extractor = ListingExtractor::new(DEFAULT_ORIGIN).unwrap();
    let page = extractor.extract_page(&fixture("results_page_mixed.html"), &seeded_statuses());

    assert_eq!(page.records.len(), 2);
    assert_eq!(page.projects_skipped, 1);
    assert_eq!(page.dropped.len(), 1);
    assert!(matches!(page.dropped[0], ExtractError::MissingPostcode(_)));

    let pijp = &page.records[0];
    assert_eq!(pijp.status_code, 2);
    assert_eq!(pijp.address, "Van Woustraat 41 2");
    assert_eq!(pijp.postcode, "1074 AB");
    assert_eq!(pijp.neighborhood, "Oude Pijp");
    assert_eq!(pijp.asking_price_minor_units, 125_000_000);
    assert_eq!(
        (pijp.size_sqm, pijp.room_count, pijp.construction_year),
        (118, 5, 1898)
    );
    assert_eq!(pijp.broker_name, "De Pijp Wonen");

    let gracht = &page.records[1];
    assert_eq!(gracht.status_code, STATUS_UNKNOWN);
    assert_eq!(gracht.neighborhood, "Grachtengordel-West");
    assert_eq!(gracht.asking_price_minor_units, PRICE_ON_REQUEST);
    assert_eq!(gracht.construction_year, 1635);
}

struct StaticSource {
    status: u16,
    body: String,
}

#[async_trait]
impl PageSource for StaticSource {
    async fn fetch_page(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        if self.status >= 400 {
            return Err(FetchError::HttpStatus {
                status: self.status,
                url: url.to_string(),
            });
        }
        Ok(FetchedResponse {
            status: self.status,
            final_url: url.to_string(),
            body: self.body.clone(),
        })
    }
}

#[tokio::test]
async fn discover_reads_the_fetched_first_page() {
    let discovery = PageDiscovery::new().unwrap();
    let source = StaticSource {
        status: 200,
        body: fixture("search_page_paginated.html"),
    };
    let max = discovery
        .discover_max_page(&source, "https://www.pararius.nl/koopwoningen/utrecht/page-1")
        .await
        .unwrap();
    assert_eq!(max, 7);
}

#[tokio::test]
async fn discover_surfaces_fetch_failures() {
    let discovery = PageDiscovery::new().unwrap();
    let source = StaticSource {
        status: 503,
        body: String::new(),
    };
    let err = discovery
        .discover_max_page(&source, "https://www.pararius.nl/koopwoningen/utrecht/page-1")
        .await
        .unwrap_err();
    match err {
        DiscoveryFailure::Fetch(fetch) => assert_eq!(fetch.status(), Some(503)),
        other => panic!("unexpected failure: {other}"),
    }
}
