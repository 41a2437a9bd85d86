//! One pass over one site: fetch, extract, filter against the seen-set,
//! enrich new listings from their detail pages.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use wm_adapters::{extractor_for, ExtractError, Extractor};
use wm_core::{ExtractorKind, Fingerprint, Listing, SeenSet, SiteConfig};
use wm_storage::PageFetcher;

/// Resolves a site's extractor kind. Defaults to [`extractor_for`].
pub type ExtractorLookup = fn(ExtractorKind) -> &'static dyn Extractor;

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("extraction failed for {site}: {source}")]
    Extraction {
        site: String,
        #[source]
        source: ExtractError,
    },
}

#[derive(Debug, Clone)]
pub struct CrawlOptions {
    pub enable_detail_scraping: bool,
    pub max_concurrent_details: usize,
    pub detail_page_delay: Duration,
}

impl Default for CrawlOptions {
    fn default() -> Self {
        Self {
            enable_detail_scraping: true,
            max_concurrent_details: 5,
            detail_page_delay: Duration::from_millis(1500),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CrawlReport {
    /// Listings extracted from the page, including already seen ones.
    pub found: usize,
    /// New listings in extraction order.
    pub new_listings: Vec<Listing>,
    /// Fingerprints inserted into the seen-set by this crawl.
    pub added: Vec<Fingerprint>,
}

impl CrawlReport {
    pub fn empty() -> Self {
        Self::default()
    }
}

#[derive(Clone)]
pub struct CrawlSession {
    fetcher: Arc<dyn PageFetcher>,
    extractors: ExtractorLookup,
    options: CrawlOptions,
}

impl CrawlSession {
    pub fn new(fetcher: Arc<dyn PageFetcher>, options: CrawlOptions) -> Self {
        Self {
            fetcher,
            extractors: extractor_for,
            options,
        }
    }

    pub fn with_extractors(mut self, extractors: ExtractorLookup) -> Self {
        self.extractors = extractors;
        self
    }

    /// Crawl `site`, inserting the fingerprints of new listings into `seen`.
    ///
    /// An unreachable listing page is not an error: it yields an empty
    /// report. A page that cannot be parsed is.
    pub async fn crawl(&self, site: &SiteConfig, seen: &mut SeenSet) -> Result<CrawlReport, CrawlError> {
        let span = info_span!("crawl_site", site = %site.key);
        self.crawl_inner(site, seen).instrument(span).await
    }

    async fn crawl_inner(&self, site: &SiteConfig, seen: &mut SeenSet) -> Result<CrawlReport, CrawlError> {
        let Some(html) = self.fetcher.fetch(&site.url).await else {
            error!(site = %site.key, url = %site.url, "listing page unavailable");
            return Ok(CrawlReport::empty());
        };

        let extractor = (self.extractors)(site.extractor);
        let listings = extractor
            .extract(site, &html)
            .map_err(|source| CrawlError::Extraction {
                site: site.key.clone(),
                source,
            })?;

        let found = listings.len();
        let mut report = CrawlReport {
            found,
            ..CrawlReport::default()
        };
        for listing in listings {
            let fingerprint = listing.fingerprint();
            if seen.insert(fingerprint.clone()) {
                debug!(site = %site.key, fingerprint = %fingerprint.short(), title = %listing.title, "new listing");
                report.added.push(fingerprint);
                report.new_listings.push(listing);
            }
        }

        if self.options.enable_detail_scraping && !report.new_listings.is_empty() {
            self.enrich(site, extractor, &mut report.new_listings).await;
        }

        info!(site = %site.key, found, new = report.new_listings.len(), "site crawled");
        Ok(report)
    }

    /// Detail pages are fetched concurrently; a failure leaves that listing
    /// as extracted.
    async fn enrich(&self, site: &SiteConfig, extractor: &'static dyn Extractor, listings: &mut [Listing]) {
        let fetcher = &self.fetcher;
        let delay = self.options.detail_page_delay;
        let limit = self.options.max_concurrent_details.max(1);

        futures::stream::iter(listings.iter_mut())
            .for_each_concurrent(limit, |listing| async move {
                match fetcher.fetch(&listing.url).await {
                    Some(html) => match extractor.extract_details(site, listing, &html) {
                        Ok(()) => listing.detail_scraped = true,
                        Err(err) => {
                            warn!(site = %site.key, url = %listing.url, error = %err, "detail extraction failed")
                        }
                    },
                    None => warn!(site = %site.key, url = %listing.url, "detail page unavailable"),
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            })
            .await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;

    /// Serves canned pages by URL; unknown URLs are "unreachable".
    #[derive(Default)]
    pub(crate) struct FakeFetcher {
        pages: Mutex<BTreeMap<String, String>>,
        pub(crate) requests: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        pub(crate) fn with_page(self, url: &str, html: &str) -> Self {
            self.set_page(url, html);
            self
        }

        pub(crate) fn set_page(&self, url: &str, html: &str) {
            self.pages
                .lock()
                .unwrap()
                .insert(url.to_string(), html.to_string());
        }
    }

    #[async_trait]
    impl PageFetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> Option<String> {
            self.requests.lock().unwrap().push(url.to_string());
            self.pages.lock().unwrap().get(url).cloned()
        }
    }

    pub(crate) fn card_site(key: &str) -> SiteConfig {
        let mut site = SiteConfig::named(key, key, &format!("https://{key}.example.com/watches"));
        site.selectors.container = "div.card".into();
        site.selectors.link = "a".into();
        site.selectors.title = "h3".into();
        site.selectors.price = "span.price".into();
        site.detail.description = "div.description".into();
        site
    }

    pub(crate) fn cards_page(items: &[(&str, &str, &str)]) -> String {
        let cards: String = items
            .iter()
            .map(|(href, title, price)| {
                format!(r#"<div class="card"><a href="{href}"><h3>{title}</h3></a><span class="price">{price}</span></div>"#)
            })
            .collect();
        format!("<html><body>{cards}</body></html>")
    }

    pub(crate) fn no_delay() -> CrawlOptions {
        CrawlOptions {
            detail_page_delay: Duration::ZERO,
            ..CrawlOptions::default()
        }
    }

    #[tokio::test]
    async fn unreachable_listing_page_is_an_empty_report() {
        let session = CrawlSession::new(Arc::new(FakeFetcher::default()), no_delay());
        let mut seen = SeenSet::new();

        let report = session.crawl(&card_site("a"), &mut seen).await.unwrap();
        assert_eq!(report.found, 0);
        assert!(report.new_listings.is_empty());
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn invalid_selector_is_an_extraction_error() {
        let mut site = card_site("broken");
        site.selectors.container = "div[".into();
        let fetcher = FakeFetcher::default().with_page(&site.url, "<div></div>");
        let session = CrawlSession::new(Arc::new(fetcher), no_delay());

        let err = session.crawl(&site, &mut SeenSet::new()).await.unwrap_err();
        assert!(matches!(err, CrawlError::Extraction { ref site, .. } if site == "broken"));
    }

    #[tokio::test]
    async fn only_unseen_listings_are_new_and_page_duplicates_collapse() {
        let site = card_site("shop");
        let page = cards_page(&[
            ("/w/1", "Omega Speedmaster 3570.50", "€4.200"),
            ("/w/2", "Tudor Black Bay 79230N", "€2.950"),
            ("/w/1", "Omega Speedmaster 3570.50", "€4.200"),
        ]);
        let fetcher = FakeFetcher::default().with_page(&site.url, &page);
        let mut session = CrawlSession::new(Arc::new(fetcher), no_delay());
        session.options.enable_detail_scraping = false;

        let mut seen = SeenSet::new();
        let first = session.crawl(&site, &mut seen).await.unwrap();
        assert_eq!(first.found, 3);
        assert_eq!(first.new_listings.len(), 2);
        assert_eq!(first.added.len(), 2);
        assert_eq!(first.new_listings[0].url, "https://shop.example.com/w/1");

        let second = session.crawl(&site, &mut seen).await.unwrap();
        assert_eq!(second.found, 3);
        assert!(second.new_listings.is_empty());
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn new_listings_are_enriched_without_changing_their_fingerprint() {
        let site = card_site("shop");
        let fetcher = FakeFetcher::default()
            .with_page(&site.url, &cards_page(&[("/w/1", "Rolex Explorer", "€7.900")]))
            .with_page(
                "https://shop.example.com/w/1",
                r#"<div class="description">Baujahr 2015, mit Box und Papieren</div>"#,
            );
        let session = CrawlSession::new(Arc::new(fetcher), no_delay());

        let mut seen = SeenSet::new();
        let report = session.crawl(&site, &mut seen).await.unwrap();
        let listing = &report.new_listings[0];
        assert!(listing.detail_scraped);
        assert_eq!(listing.year.as_deref(), Some("2015"));
        assert_eq!(listing.has_box, Some(true));
        assert!(seen.contains(&report.added[0]));
    }

    fn structured_data_only(_: ExtractorKind) -> &'static dyn Extractor {
        extractor_for(ExtractorKind::JsonLd)
    }

    #[tokio::test]
    async fn extractor_lookup_can_be_replaced() {
        let site = card_site("shop");
        let page = r#"<script type="application/ld+json">
            {"@type": "Product", "name": "IWC Mark XV", "url": "/w/15", "offers": {"price": "3200"}}
        </script>"#;
        let fetcher = FakeFetcher::default().with_page(&site.url, page);
        let mut options = no_delay();
        options.enable_detail_scraping = false;
        let session = CrawlSession::new(Arc::new(fetcher), options).with_extractors(structured_data_only);

        let report = session.crawl(&site, &mut SeenSet::new()).await.unwrap();
        assert_eq!(report.found, 1);
        assert_eq!(report.new_listings[0].url, "https://shop.example.com/w/15");
    }

    #[tokio::test]
    async fn missing_detail_page_keeps_listing() {
        let site = card_site("shop");
        let fetcher = Arc::new(
            FakeFetcher::default().with_page(&site.url, &cards_page(&[("/w/9", "Heuer Carrera", "€5.500")])),
        );
        let session = CrawlSession::new(fetcher.clone(), no_delay());

        let report = session.crawl(&site, &mut SeenSet::new()).await.unwrap();
        assert_eq!(report.new_listings.len(), 1);
        assert!(!report.new_listings[0].detail_scraped);
        assert_eq!(
            *fetcher.requests.lock().unwrap(),
            vec![site.url.clone(), "https://shop.example.com/w/9".to_string()]
        );
    }
}
