//! Per-site configuration, loaded once from the site registry.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorKind {
    /// Product cards located with CSS selectors.
    Cards,
    /// schema.org `Product` / `ItemList` blocks in `application/ld+json`.
    JsonLd,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListingSelectors {
    pub container: String,
    pub link: String,
    pub title: String,
    /// Optional element inside the title naming the brand.
    pub brand: String,
    pub price: String,
    pub image: String,
}

/// Which listing attribute a detail-table row fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailField {
    Reference,
    Year,
    Condition,
    CaseMaterial,
    Diameter,
    BoxPapers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetailSelectors {
    /// Scope for the rest of the selectors; whole document when empty.
    pub container: String,
    pub rows: String,
    /// Lowercased header substring -> field.
    pub headers: BTreeMap<String, DetailField>,
    /// Free text scanned for year, condition and box/papers hints.
    pub description: String,
}

impl Default for DetailSelectors {
    fn default() -> Self {
        Self {
            container: String::new(),
            rows: "tr".to_string(),
            headers: BTreeMap::new(),
            description: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownBrand {
    /// Lowercased title prefix.
    pub prefix: String,
    pub name: String,
}

/// Presentation of a site's notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteStyle {
    pub name: String,
    pub color: u32,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteConfig {
    pub key: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub color: u32,
    #[serde(default)]
    pub webhook_env_var: String,
    /// Used instead of `webhook_env_var` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default = "default_currency")]
    pub currency: String,
    pub extractor: ExtractorKind,
    #[serde(default)]
    pub selectors: ListingSelectors,
    #[serde(default)]
    pub detail: DetailSelectors,
    /// Checked in order; put longer prefixes first.
    #[serde(default)]
    pub known_brands: Vec<KnownBrand>,
    #[serde(default)]
    pub condition_mappings: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

fn default_currency() -> String {
    "EUR".to_string()
}

impl SiteConfig {
    /// Minimal card-based site, mostly for tests and scaffolding.
    pub fn named(key: &str, name: &str, url: &str) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            url: url.to_string(),
            base_url: url.to_string(),
            enabled: true,
            color: 0,
            webhook_env_var: String::new(),
            webhook_url: None,
            currency: default_currency(),
            extractor: ExtractorKind::Cards,
            selectors: ListingSelectors::default(),
            detail: DetailSelectors::default(),
            known_brands: Vec::new(),
            condition_mappings: BTreeMap::new(),
        }
    }

    pub fn webhook_url(&self) -> Option<String> {
        if let Some(url) = self.webhook_url.as_ref().filter(|v| !v.trim().is_empty()) {
            return Some(url.clone());
        }
        if self.webhook_env_var.is_empty() {
            return None;
        }
        std::env::var(&self.webhook_env_var)
            .ok()
            .filter(|v| !v.trim().is_empty())
    }

    pub fn style(&self) -> SiteStyle {
        SiteStyle {
            name: self.name.clone(),
            color: self.color,
            webhook_url: self.webhook_url(),
        }
    }

    /// Resolve a possibly relative link against `base_url` (or `url`). An
    /// unparsable base or href is returned as written.
    pub fn absolute_url(&self, href: &str) -> String {
        let href = href.trim();
        if href.is_empty() {
            return String::new();
        }
        let base = if self.base_url.is_empty() { &self.url } else { &self.base_url };
        Url::parse(base)
            .and_then(|base| base.join(href))
            .map(String::from)
            .unwrap_or_else(|_| href.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_url_resolution() {
        let site = SiteConfig::named("t", "T", "https://shop.example.de/uhren");
        assert_eq!(site.absolute_url("/de/uhr-1"), "https://shop.example.de/de/uhr-1");
        assert_eq!(site.absolute_url("uhr-2"), "https://shop.example.de/uhr-2");
        assert_eq!(site.absolute_url("https://cdn.x/i.jpg"), "https://cdn.x/i.jpg");
        assert_eq!(site.absolute_url("//cdn.x/i.jpg"), "https://cdn.x/i.jpg");
        assert_eq!(site.absolute_url(""), "");
    }

    #[test]
    fn absolute_url_follows_directory_and_query_rules() {
        let paged = SiteConfig::named("t", "T", "https://shop.example.de/uhren?page=1");
        assert_eq!(paged.absolute_url("?page=2"), "https://shop.example.de/uhren?page=2");

        let nested = SiteConfig::named("t", "T", "https://shop.example.de/de/uhren/index.html");
        assert_eq!(nested.absolute_url("../uhr-1"), "https://shop.example.de/de/uhr-1");
        assert_eq!(nested.absolute_url("uhr-2"), "https://shop.example.de/de/uhren/uhr-2");
        assert_eq!(nested.absolute_url("//media.example.de/x.jpg"), "https://media.example.de/x.jpg");
    }

    #[test]
    fn absolute_url_keeps_href_when_base_is_unparsable() {
        let mut site = SiteConfig::named("t", "T", "not a url");
        site.base_url = String::new();
        assert_eq!(site.absolute_url("/uhr-1"), "/uhr-1");
    }

    #[test]
    fn webhook_missing_when_env_var_unset() {
        let mut site = SiteConfig::named("t", "T", "https://shop.example.de");
        assert_eq!(site.webhook_url(), None);
        site.webhook_env_var = "WM_TEST_WEBHOOK_THAT_IS_NEVER_SET".to_string();
        assert_eq!(site.webhook_url(), None);
    }

    #[test]
    fn inline_webhook_takes_precedence_over_env_var() {
        let mut site = SiteConfig::named("t", "T", "https://shop.example.de");
        site.webhook_env_var = "WM_TEST_WEBHOOK_THAT_IS_NEVER_SET".to_string();
        site.webhook_url = Some("https://discord.example/api/webhooks/1".to_string());
        assert_eq!(site.webhook_url().as_deref(), Some("https://discord.example/api/webhooks/1"));
        assert_eq!(site.style().webhook_url, site.webhook_url());

        site.webhook_url = Some("  ".to_string());
        assert_eq!(site.webhook_url(), None);
    }
}
