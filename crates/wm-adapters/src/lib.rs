//! Listing extractors: turn retailer HTML into [`Listing`]s, driven entirely
//! by per-site configuration.

use scraper::{ElementRef, Selector};
use thiserror::Error;
use wm_core::{clean_text, ExtractorKind, Listing, SiteConfig};

pub mod cards;
pub mod json_ld;
pub mod parse;

pub use cards::CardsExtractor;
pub use json_ld::JsonLdExtractor;
pub use parse::{clean_reference, parse_box_papers, parse_condition, parse_year, split_brand_model};

pub const CRATE_NAME: &str = "wm-adapters";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector `{selector}`: {message}")]
    Selector { selector: String, message: String },
    #[error("site {site} has no {what} selector")]
    MissingSelector { site: String, what: &'static str },
    #[error("no parsable structured data on page: {0}")]
    StructuredData(#[from] serde_json::Error),
}

/// Capability to pull listings out of a page. Implementations never fail on
/// a single malformed item; they skip it and keep going.
pub trait Extractor: Send + Sync {
    fn kind(&self) -> ExtractorKind;

    fn extract(&self, site: &SiteConfig, html: &str) -> Result<Vec<Listing>, ExtractError>;

    /// Enrich `listing` in place from its detail page.
    fn extract_details(
        &self,
        site: &SiteConfig,
        listing: &mut Listing,
        html: &str,
    ) -> Result<(), ExtractError>;
}

static CARDS: CardsExtractor = CardsExtractor;
static JSON_LD: JsonLdExtractor = JsonLdExtractor;

pub fn extractor_for(kind: ExtractorKind) -> &'static dyn Extractor {
    match kind {
        ExtractorKind::Cards => &CARDS,
        ExtractorKind::JsonLd => &JSON_LD,
    }
}

/// Compile every selector the site configures, reporting the first bad one.
pub fn validate_site(site: &SiteConfig) -> Result<(), ExtractError> {
    if site.extractor == ExtractorKind::Cards && site.selectors.container.trim().is_empty() {
        return Err(ExtractError::MissingSelector {
            site: site.key.clone(),
            what: "container",
        });
    }
    let s = &site.selectors;
    let d = &site.detail;
    for selector in [
        &s.container,
        &s.link,
        &s.title,
        &s.brand,
        &s.price,
        &s.image,
        &d.container,
        &d.rows,
        &d.description,
    ] {
        compile_optional(selector)?;
    }
    Ok(())
}

pub(crate) fn compile(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|e| ExtractError::Selector {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

/// `None` for an empty selector string.
pub(crate) fn compile_optional(selector: &str) -> Result<Option<Selector>, ExtractError> {
    let selector = selector.trim();
    if selector.is_empty() {
        Ok(None)
    } else {
        compile(selector).map(Some)
    }
}

pub(crate) fn element_text(element: ElementRef<'_>) -> String {
    clean_text(&element.text().collect::<Vec<_>>().join(" "))
}

pub(crate) fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub(crate) fn first_text(scope: ElementRef<'_>, selector: Option<&Selector>) -> Option<String> {
    let selector = selector?;
    scope
        .select(selector)
        .next()
        .and_then(|el| text_or_none(element_text(el)))
}

/// Fill description-derived fields that are still unknown.
pub(crate) fn apply_description(site: &SiteConfig, listing: &mut Listing, text: &str) {
    if text.is_empty() {
        return;
    }
    if listing.year.is_none() {
        listing.year = parse_year(text, "");
    }
    if listing.condition.is_none() {
        listing.condition = parse_condition(text, &site.condition_mappings);
    }
    let (papers, has_box) = parse_box_papers(text);
    if listing.has_papers.is_none() {
        listing.has_papers = papers;
    }
    if listing.has_box.is_none() {
        listing.has_box = has_box;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_covers_every_kind() {
        assert_eq!(extractor_for(ExtractorKind::Cards).kind(), ExtractorKind::Cards);
        assert_eq!(extractor_for(ExtractorKind::JsonLd).kind(), ExtractorKind::JsonLd);
    }

    #[test]
    fn validation_rejects_missing_container_and_bad_selectors() {
        let mut site = SiteConfig::named("t", "T", "https://shop.example");
        assert!(matches!(validate_site(&site), Err(ExtractError::MissingSelector { .. })));

        site.selectors.container = "article.watch".into();
        assert!(validate_site(&site).is_ok());

        site.selectors.price = "p[[".into();
        assert!(matches!(validate_site(&site), Err(ExtractError::Selector { .. })));
    }

    #[test]
    fn json_ld_sites_need_no_card_selectors() {
        let mut site = SiteConfig::named("t", "T", "https://shop.example");
        site.extractor = ExtractorKind::JsonLd;
        assert!(validate_site(&site).is_ok());
    }
}
