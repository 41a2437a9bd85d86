//! Core domain model for the watch monitor: listings, identities, seen-sets
//! and cycle records.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod identity;
pub mod price;
pub mod seen;
pub mod site;

pub use identity::{fingerprint, Fingerprint};
pub use price::Price;
pub use seen::{SeenMap, SeenSet};
pub use site::{DetailField, DetailSelectors, ExtractorKind, KnownBrand, ListingSelectors, SiteConfig, SiteStyle};

pub const CRATE_NAME: &str = "wm-core";

/// Collapse whitespace runs and trim.
pub fn clean_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// One scraped item. Transient: only its fingerprint and the cycle counters
/// outlive a crawl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub title: String,
    pub url: String,
    pub site_key: String,
    pub site_name: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub reference: Option<String>,
    pub year: Option<String>,
    pub price: Option<Price>,
    pub price_display: Option<String>,
    pub image_url: Option<String>,
    pub condition: Option<String>,
    pub has_papers: Option<bool>,
    pub has_box: Option<bool>,
    pub case_material: Option<String>,
    pub diameter: Option<String>,
    pub scraped_at: DateTime<Utc>,
    pub detail_scraped: bool,
}

impl Listing {
    pub fn new(site: &SiteConfig, title: &str, url: &str) -> Self {
        Self {
            title: clean_text(title),
            url: url.trim().to_string(),
            site_key: site.key.clone(),
            site_name: site.name.clone(),
            brand: None,
            model: None,
            reference: None,
            year: None,
            price: None,
            price_display: None,
            image_url: None,
            condition: None,
            has_papers: None,
            has_box: None,
            case_material: None,
            diameter: None,
            scraped_at: Utc::now(),
            detail_scraped: false,
        }
    }

    /// Set the price and derive the display string from it.
    pub fn set_price(&mut self, price: Price) {
        self.price_display = Some(price.display());
        self.price = Some(price);
    }

    pub fn fingerprint(&self) -> Fingerprint {
        identity::fingerprint(self)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteStats {
    pub total_found: usize,
    pub new_found: usize,
    pub notifications_sent: usize,
    pub errors: usize,
}

/// Aggregate counters for one monitoring cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleSession {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub sites_scraped: usize,
    #[serde(default)]
    pub total_watches_found: usize,
    #[serde(default)]
    pub total_new_watches: usize,
    #[serde(default)]
    pub notifications_sent: usize,
    #[serde(default)]
    pub errors_encountered: usize,
    #[serde(default)]
    pub memory_usage_start_mb: Option<f64>,
    #[serde(default)]
    pub memory_usage_end_mb: Option<f64>,
    #[serde(default)]
    pub memory_delta_mb: Option<f64>,
    #[serde(default)]
    pub site_stats: BTreeMap<String, SiteStats>,
}

impl CycleSession {
    pub fn start() -> Self {
        Self::start_at(Utc::now())
    }

    pub fn start_at(started_at: DateTime<Utc>) -> Self {
        Self {
            session_id: started_at.format("%Y%m%d_%H%M%S").to_string(),
            started_at,
            ended_at: None,
            duration_seconds: None,
            sites_scraped: 0,
            total_watches_found: 0,
            total_new_watches: 0,
            notifications_sent: 0,
            errors_encountered: 0,
            memory_usage_start_mb: None,
            memory_usage_end_mb: None,
            memory_delta_mb: None,
            site_stats: BTreeMap::new(),
        }
    }

    pub fn add_site_result(&mut self, site_key: &str, stats: SiteStats) {
        self.sites_scraped += 1;
        self.total_watches_found += stats.total_found;
        self.total_new_watches += stats.new_found;
        self.notifications_sent += stats.notifications_sent;
        self.errors_encountered += stats.errors;
        self.site_stats.insert(site_key.to_string(), stats);
    }

    pub fn record_memory(&mut self, start_mb: Option<f64>, end_mb: Option<f64>) {
        self.memory_usage_start_mb = start_mb;
        self.memory_usage_end_mb = end_mb;
        self.memory_delta_mb = match (start_mb, end_mb) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        };
    }

    pub fn finalize(&mut self) {
        self.finalize_at(Utc::now());
    }

    pub fn finalize_at(&mut self, ended_at: DateTime<Utc>) {
        let elapsed = ended_at - self.started_at;
        self.ended_at = Some(ended_at);
        self.duration_seconds = Some(elapsed.num_milliseconds() as f64 / 1000.0);
    }

    pub fn is_successful(&self) -> bool {
        self.errors_encountered == 0
    }
}
