//! Pararius markup knowledge: search URLs, page-count discovery and listing extraction.

use koopwatch_core::{City, ListingRecord, StatusDict, PRICE_ON_REQUEST};
use koopwatch_storage::{FetchError, PageSource};
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "koopwatch-adapters";

pub const DEFAULT_ORIGIN: &str = "https://www.pararius.nl";

pub const MAP_SEARCH_BASE: &str = "https://www.google.com/maps/place/";

/// Title prefix the site uses for new-build projects grouping several units.
pub const PROJECT_MARKER: &str = "Project:";

/// Surface, rooms, construction year, in that order.
const FEATURE_COUNT: usize = 3;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector {selector:?}: {message}")]
    Selector {
        selector: &'static str,
        message: String,
    },
    #[error("invalid pattern {pattern:?}: {source}")]
    Pattern {
        pattern: &'static str,
        #[source]
        source: regex::Error,
    },
}

fn selector(css: &'static str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector {
        selector: css,
        message: e.to_string(),
    })
}

fn pattern(re: &'static str) -> Result<Regex, AdapterError> {
    Regex::new(re).map_err(|source| AdapterError::Pattern {
        pattern: re,
        source,
    })
}

fn clean_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn search_page_url(origin: &str, city: &City, page: u32) -> String {
    format!(
        "{}/koopwoningen/{}/page-{}",
        origin.trim_end_matches('/'),
        city.slug(),
        page
    )
}

pub fn detail_link(origin: &str, href: &str) -> String {
    if href.starts_with("http://") || href.starts_with("https://") {
        return href.to_string();
    }
    format!("{}{}", origin.trim_end_matches('/'), href)
}

pub fn map_query_link(address: &str) -> String {
    let query = address
        .split_whitespace()
        .map(|word| urlencoding::encode(word).into_owned())
        .collect::<Vec<_>>()
        .join("+");
    format!("{MAP_SEARCH_BASE}{query}")
}

#[derive(Debug, Error)]
pub enum DiscoveryFailure {
    #[error("first results page could not be fetched: {0}")]
    Fetch(#[from] FetchError),
    #[error("no pagination markers on the first results page")]
    NoPagination,
    #[error("pagination markers carry no page numbers")]
    NoPageNumbers,
}

/// Reads the highest page number out of a city's first results page.
#[derive(Debug)]
pub struct PageDiscovery {
    marker: Selector,
    number: Regex,
}

impl PageDiscovery {
    pub fn new() -> Result<Self, AdapterError> {
        Ok(Self {
            marker: selector("li.pagination__item")?,
            number: pattern(r"\d+")?,
        })
    }

    pub fn max_page_from_html(&self, html: &str) -> Result<u32, DiscoveryFailure> {
        let document = Html::parse_document(html);
        let mut saw_marker = false;
        let mut max_page: Option<u32> = None;

        for item in document.select(&self.marker) {
            saw_marker = true;
            let text = item.text().collect::<String>();
            let page = self
                .number
                .find(&text)
                .and_then(|m| m.as_str().parse::<u32>().ok())
                .filter(|n| *n >= 1);
            if let Some(page) = page {
                max_page = Some(max_page.map_or(page, |cur| cur.max(page)));
            }
        }

        match (saw_marker, max_page) {
            (false, _) => Err(DiscoveryFailure::NoPagination),
            (true, None) => Err(DiscoveryFailure::NoPageNumbers),
            (true, Some(page)) => Ok(page),
        }
    }

    /// Single attempt; fetch errors come back as [`DiscoveryFailure::Fetch`].
    pub async fn discover_max_page(
        &self,
        source: &dyn PageSource,
        first_page_url: &str,
    ) -> Result<u32, DiscoveryFailure> {
        let page = source.fetch_page(first_page_url).await?;
        let max_page = self.max_page_from_html(&page.body)?;
        debug!(url = first_page_url, max_page, "discovered page count");
        Ok(max_page)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingExtraction {
    Listing(ListingRecord),
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtractError {
    #[error("listing has no {0}")]
    MissingElement(&'static str),
    #[error("no postcode in {0:?}")]
    MissingPostcode(String),
    #[error("no neighborhood in {0:?}")]
    MissingNeighborhood(String),
    #[error("asking price {0:?} does not fit")]
    MalformedPrice(String),
    #[error("expected {expected} illustrated features, found {found}")]
    MissingFeatures { expected: usize, found: usize },
    #[error("illustrated feature {index} has no number: {text:?}")]
    MalformedFeature { index: usize, text: String },
}

/// Everything one results page yielded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageExtraction {
    pub records: Vec<ListingRecord>,
    pub projects_skipped: usize,
    pub dropped: Vec<ExtractError>,
}

#[derive(Debug)]
pub struct ListingExtractor {
    origin: String,
    listing: Selector,
    label: Selector,
    title_link: Selector,
    sub_title: Selector,
    price: Selector,
    features: Selector,
    feature_item: Selector,
    info: Selector,
    postcode: Regex,
    neighborhood: Regex,
    price_digits: Regex,
    integer: Regex,
}

impl ListingExtractor {
    pub fn new(origin: impl Into<String>) -> Result<Self, AdapterError> {
        Ok(Self {
            origin: origin.into(),
            listing: selector("li.search-list__item.search-list__item--listing")?,
            label: selector("div.listing-search-item__label")?,
            title_link: selector("h2 a")?,
            sub_title: selector("div.listing-search-item__sub-title")?,
            price: selector("div.listing-search-item__price")?,
            features: selector("ul.illustrated-features.illustrated-features--compact")?,
            feature_item: selector("li")?,
            info: selector("div.listing-search-item__info")?,
            postcode: pattern(r"\d{4}\s?[A-Z]{2}\b")?,
            neighborhood: pattern(r"\(([^)]+)\)")?,
            price_digits: pattern(r"\d+(?:\.\d+)*")?,
            integer: pattern(r"\d+")?,
        })
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Extracts every listing node on a results page. Bad listings are dropped, not fatal.
    pub fn extract_page(&self, html: &str, statuses: &StatusDict) -> PageExtraction {
        let document = Html::parse_document(html);
        let mut out = PageExtraction::default();

        for node in document.select(&self.listing) {
            match self.extract_listing(node, statuses) {
                Ok(ListingExtraction::Listing(record)) => out.records.push(record),
                Ok(ListingExtraction::Skipped) => out.projects_skipped += 1,
                Err(err) => {
                    warn!(error = %err, "dropping listing");
                    out.dropped.push(err);
                }
            }
        }
        out
    }

    pub fn extract_listing(
        &self,
        node: ElementRef<'_>,
        statuses: &StatusDict,
    ) -> Result<ListingExtraction, ExtractError> {
        let title = node
            .select(&self.title_link)
            .next()
            .ok_or(ExtractError::MissingElement("title link"))?;
        let address = clean_text(title);
        if address.contains(PROJECT_MARKER) {
            debug!(title = %address, "skipping project");
            return Ok(ListingExtraction::Skipped);
        }
        if address.is_empty() {
            return Err(ExtractError::MissingElement("address"));
        }
        let href = title
            .value()
            .attr("href")
            .ok_or(ExtractError::MissingElement("title href"))?;

        let label = node.select(&self.label).next().map(clean_text);
        let status_code = statuses.code_for(label.as_deref());

        let sub_title = node
            .select(&self.sub_title)
            .next()
            .map(clean_text)
            .ok_or(ExtractError::MissingElement("sub-title"))?;
        let postcode = self
            .postcode
            .find(&sub_title)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| ExtractError::MissingPostcode(sub_title.clone()))?;
        let neighborhood = self
            .neighborhood
            .captures(&sub_title)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or_else(|| ExtractError::MissingNeighborhood(sub_title.clone()))?;

        let price_text = node
            .select(&self.price)
            .next()
            .map(clean_text)
            .ok_or(ExtractError::MissingElement("price block"))?;
        let asking_price_minor_units = self.parse_asking_price(&price_text)?;

        let [size_sqm, room_count, construction_year] = self.parse_features(node)?;

        let broker_name = node
            .select(&self.info)
            .next()
            .map(clean_text)
            .filter(|text| !text.is_empty())
            .ok_or(ExtractError::MissingElement("broker info"))?;

        Ok(ListingExtraction::Listing(ListingRecord {
            status_code,
            source_link: detail_link(&self.origin, href),
            map_query_link: map_query_link(&address),
            address,
            postcode,
            neighborhood,
            asking_price_minor_units,
            size_sqm,
            room_count,
            construction_year,
            broker_name,
        }))
    }

    /// Dot-grouped euros to cents; no digits at all means "prijs op aanvraag".
    fn parse_asking_price(&self, text: &str) -> Result<i64, ExtractError> {
        let Some(found) = self.price_digits.find(text) else {
            return Ok(PRICE_ON_REQUEST);
        };
        found
            .as_str()
            .replace('.', "")
            .parse::<i64>()
            .ok()
            .and_then(|euros| euros.checked_mul(100))
            .ok_or_else(|| ExtractError::MalformedPrice(found.as_str().to_string()))
    }

    fn parse_features(&self, node: ElementRef<'_>) -> Result<[i64; FEATURE_COUNT], ExtractError> {
        let container = node
            .select(&self.features)
            .next()
            .ok_or(ExtractError::MissingElement("illustrated features"))?;
        let items = container
            .select(&self.feature_item)
            .map(clean_text)
            .collect::<Vec<_>>();
        if items.len() < FEATURE_COUNT {
            return Err(ExtractError::MissingFeatures {
                expected: FEATURE_COUNT,
                found: items.len(),
            });
        }

        let mut values = [0i64; FEATURE_COUNT];
        for (index, text) in items.iter().take(FEATURE_COUNT).enumerate() {
            values[index] = self
                .integer
                .find(text)
                .and_then(|m| m.as_str().parse::<i64>().ok())
                .ok_or_else(|| ExtractError::MalformedFeature {
                    index,
                    text: text.clone(),
                })?;
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use koopwatch_core::{CityId, STATUS_NO_LABEL, STATUS_UNKNOWN};

    fn statuses() -> StatusDict {
        StatusDict::new([("Nieuw", 1), ("Onder bod", 2), ("Verkocht", 4)])
    }

    fn extractor() -> ListingExtractor {
        ListingExtractor::new(DEFAULT_ORIGIN).unwrap()
    }

    fn listing_html(
        label: Option<&str>,
        title: &str,
        sub_title: &str,
        price: &str,
        features: &[&str],
    ) -> String {
        let label = label
            .map(|l| {
                format!(r#"<div class="listing-search-item__label"><span>{l}</span></div>"#)
            })
            .unwrap_or_default();
        let features = features
            .iter()
            .map(|f| format!("<li>{f}</li>"))
            .collect::<String>();
        format!(
            r#"<ul><li class="search-list__item search-list__item--listing">
                {label}
                <h2><a href="/huis-te-koop/haarlem/0f0f0f0f/kruisweg">{title}</a></h2>
                <div class="listing-search-item__sub-title">{sub_title}</div>
                <div class="listing-search-item__price">{price}</div>
                <ul class="illustrated-features illustrated-features--compact">{features}</ul>
                <div class="listing-search-item__info"> Kennemer   Makelaars </div>
            </li></ul>"#
        )
    }

    fn page(listings: &[String]) -> String {
        format!("<html><body>{}</body></html>", listings.concat())
    }

    #[test]
    fn extracts_every_field_of_a_regular_listing() {
        let html = page(&[listing_html(
            Some("Nieuw"),
            "Kruisweg 58 A",
            "2011 LD Haarlem (Stationsbuurt)",
            "€ 425.000 k.k.",
            &["85 m²", "4 kamers", "1911"],
        )]);
        let result = extractor().extract_page(&html, &statuses());

        assert!(result.dropped.is_empty());
        assert_eq!(result.records.len(), 1);
        let record = &result.records[0];
        assert_eq!(record.status_code, 1);
        assert_eq!(record.address, "Kruisweg 58 A");
        assert_eq!(record.postcode, "2011 LD");
        assert_eq!(record.neighborhood, "Stationsbuurt");
        assert_eq!(record.asking_price_minor_units, 42_500_000);
        assert_eq!(
            (record.size_sqm, record.room_count, record.construction_year),
            (85, 4, 1911)
        );
        assert_eq!(record.broker_name, "Kennemer Makelaars");
        assert_eq!(
            record.source_link,
            "https://www.pararius.nl/huis-te-koop/haarlem/0f0f0f0f/kruisweg"
        );
        assert_eq!(
            record.map_query_link,
            "https://www.google.com/maps/place/Kruisweg+58+A"
        );
    }

    #[test]
    fn project_titles_are_skipped_before_other_fields_are_read() {
        let html = page(&[listing_html(
            None,
            "Project: Nieuw Zuid Fase 2",
            "no postcode here",
            "",
            &[],
        )]);
        let result = extractor().extract_page(&html, &statuses());
        assert_eq!(result.projects_skipped, 1);
        assert!(result.records.is_empty());
        assert!(result.dropped.is_empty());
    }

    #[test]
    fn price_without_digits_is_price_on_request() {
        let html = page(&[listing_html(
            None,
            "Kruisweg 60",
            "2011 LD Haarlem (Stationsbuurt)",
            "Prijs op aanvraag",
            &["120 m²", "5 kamers", "1930"],
        )]);
        let result = extractor().extract_page(&html, &statuses());
        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].asking_price_minor_units, PRICE_ON_REQUEST);
        assert!(result.records[0].is_price_on_request());
    }

    #[test]
    fn status_falls_back_to_sentinels() {
        let sub = "2011 LD Haarlem (Stationsbuurt)";
        let features = ["85 m²", "4 kamers", "1911"];
        let html = page(&[
            listing_html(Some("Exclusief"), "Kruisweg 1", sub, "€ 1", &features),
            listing_html(None, "Kruisweg 2", sub, "€ 2", &features),
            listing_html(Some("  "), "Kruisweg 3", sub, "€ 3", &features),
        ]);
        let result = extractor().extract_page(&html, &statuses());
        let codes = result.records.iter().map(|r| r.status_code).collect::<Vec<_>>();
        // a label node with no text is present, so it is looked up and misses
        assert_eq!(codes, vec![STATUS_UNKNOWN, STATUS_NO_LABEL, STATUS_UNKNOWN]);
    }

    #[test]
    fn missing_postcode_or_neighborhood_drops_only_that_listing() {
        let features = ["85 m²", "4 kamers", "1911"];
        let html = page(&[
            listing_html(None, "Kruisweg 1", "Haarlem (Stationsbuurt)", "€ 1", &features),
            listing_html(None, "Kruisweg 2", "2011 LD Haarlem", "€ 2", &features),
            listing_html(None, "Kruisweg 3", "2011 LD Haarlem (Centrum)", "€ 3", &features),
        ]);
        let result = extractor().extract_page(&html, &statuses());

        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].address, "Kruisweg 3");
        assert!(matches!(result.dropped[0], ExtractError::MissingPostcode(_)));
        assert!(matches!(result.dropped[1], ExtractError::MissingNeighborhood(_)));
    }

    #[test]
    fn postcode_needs_two_capital_letters() {
        let features = ["85 m²", "4 kamers", "1911"];
        let html = page(&[
            listing_html(None, "Kavel 6", "1019 Amsterdam (Zeeburgereiland)", "€ 1", &features),
            listing_html(None, "Kavel 7", "2011 10 Haarlem (Centrum)", "€ 2", &features),
            listing_html(None, "Kavel 8", "1019LM Amsterdam (Zeeburgereiland)", "€ 3", &features),
        ]);
        let result = extractor().extract_page(&html, &statuses());

        assert_eq!(result.records.len(), 1);
        assert_eq!(result.records[0].postcode, "1019LM");
        assert_eq!(
            result.dropped,
            vec![
                ExtractError::MissingPostcode("1019 Amsterdam (Zeeburgereiland)".into()),
                ExtractError::MissingPostcode("2011 10 Haarlem (Centrum)".into()),
            ]
        );
    }

    #[test]
    fn feature_list_must_hold_three_numbers() {
        let sub = "2011 LD Haarlem (Stationsbuurt)";
        let html = page(&[
            listing_html(None, "Kruisweg 1", sub, "€ 1", &["85 m²", "4 kamers"]),
            listing_html(None, "Kruisweg 2", sub, "€ 2", &["85 m²", "kamers onbekend", "1911"]),
        ]);
        let result = extractor().extract_page(&html, &statuses());
        assert!(result.records.is_empty());
        assert_eq!(
            result.dropped[0],
            ExtractError::MissingFeatures { expected: 3, found: 2 }
        );
        assert!(matches!(
            result.dropped[1],
            ExtractError::MalformedFeature { index: 1, .. }
        ));
    }

    #[test]
    fn pagination_max_is_taken_over_all_markers() {
        let discovery = PageDiscovery::new().unwrap();
        let html = r#"<ul>
            <li class="pagination__item">1</li>
            <li class="pagination__item"><a>2</a></li>
            <li class="pagination__item">3</li>
            <li class="pagination__item">7</li>
            <li class="pagination__item">Volgende</li>
        </ul>"#;
        assert_eq!(discovery.max_page_from_html(html).unwrap(), 7);
    }

    #[test]
    fn pagination_without_markers_or_numbers_is_not_found() {
        let discovery = PageDiscovery::new().unwrap();
        assert!(matches!(
            discovery.max_page_from_html("<html><body><p>1</p></body></html>"),
            Err(DiscoveryFailure::NoPagination)
        ));
        assert!(matches!(
            discovery.max_page_from_html(r#"<li class="pagination__item">Volgende</li>"#),
            Err(DiscoveryFailure::NoPageNumbers)
        ));
    }

    #[test]
    fn search_urls_use_the_city_slug() {
        let city = City {
            id: CityId(2),
            name: "Den Haag".into(),
            enabled: true,
        };
        assert_eq!(
            search_page_url("https://www.pararius.nl/", &city, 3),
            "https://www.pararius.nl/koopwoningen/den-haag/page-3"
        );
    }

    #[test]
    fn links_are_pure_string_transforms() {
        assert_eq!(
            detail_link("https://www.pararius.nl", "/huis-te-koop/a/b"),
            "https://www.pararius.nl/huis-te-koop/a/b"
        );
        assert_eq!(
            detail_link("https://www.pararius.nl", "https://elders.nl/x"),
            "https://elders.nl/x"
        );
        assert_eq!(
            map_query_link("Laan van Meerdervoort 5/7"),
            "https://www.google.com/maps/place/Laan+van+Meerdervoort+5%2F7"
        );
    }
}
