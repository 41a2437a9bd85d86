//! schema.org `Product` / `ItemList` extraction from
//! `<script type="application/ld+json">` blocks.

use std::sync::LazyLock;

use scraper::{Html, Selector};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use wm_core::{clean_text, ExtractorKind, Listing, Price, SiteConfig};

use crate::cards::apply_detail_page;
use crate::parse::{clean_reference, parse_year, split_brand_model};
use crate::{apply_description, ExtractError, Extractor};

static LD_SCRIPTS: LazyLock<Selector> = LazyLock::new(|| {
    Selector::parse(r#"script[type="application/ld+json"]"#).expect("valid ld+json selector")
});

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonLdExtractor;

impl Extractor for JsonLdExtractor {
    fn kind(&self) -> ExtractorKind {
        ExtractorKind::JsonLd
    }

    fn extract(&self, site: &SiteConfig, html: &str) -> Result<Vec<Listing>, ExtractError> {
        let blocks = structured_blocks(html)?;
        let mut products = Vec::new();
        for block in &blocks {
            collect_products(block, &mut products);
        }

        let listings: Vec<Listing> = products
            .into_iter()
            .enumerate()
            .filter_map(|(index, product)| {
                let listing = product_to_listing(site, product);
                if listing.is_none() {
                    debug!(site = %site.key, index, "skipping product without name or url");
                }
                listing
            })
            .collect();

        if listings.is_empty() {
            warn!(site = %site.key, blocks = blocks.len(), "no products in structured data");
        }
        Ok(listings)
    }

    fn extract_details(
        &self,
        site: &SiteConfig,
        listing: &mut Listing,
        html: &str,
    ) -> Result<(), ExtractError> {
        let document = Html::parse_document(html);
        let blocks = parse_blocks(&document).unwrap_or_default();
        let mut products = Vec::new();
        for block in &blocks {
            collect_products(block, &mut products);
        }

        if let Some(product) = products.first() {
            if listing.reference.is_none() {
                listing.reference = reference_of(product);
            }
            if listing.model.is_none() {
                listing.model = str_field(product, "model");
            }
            if listing.image_url.is_none() {
                listing.image_url = image_of(product).map(|src| site.absolute_url(&src));
            }
            if let Some(description) = str_field(product, "description") {
                apply_description(site, listing, &description);
            }
        }

        apply_detail_page(site, listing, &document)
    }
}

/// All ld+json blocks on the page. Unparsable blocks are skipped; if every
/// block is unparsable the last error is returned.
fn structured_blocks(html: &str) -> Result<Vec<JsonValue>, ExtractError> {
    let document = Html::parse_document(html);
    parse_blocks(&document)
}

fn parse_blocks(document: &Html) -> Result<Vec<JsonValue>, ExtractError> {
    let mut blocks = Vec::new();
    let mut last_error = None;
    for script in document.select(&LD_SCRIPTS) {
        let raw = script.text().collect::<String>();
        match serde_json::from_str::<JsonValue>(raw.trim()) {
            Ok(value) => blocks.push(value),
            Err(err) => {
                debug!(error = %err, "skipping malformed ld+json block");
                last_error = Some(err);
            }
        }
    }
    match (blocks.is_empty(), last_error) {
        (true, Some(err)) => Err(ExtractError::StructuredData(err)),
        _ => Ok(blocks),
    }
}

fn has_type(value: &JsonValue, wanted: &str) -> bool {
    match value.get("@type") {
        Some(JsonValue::String(t)) => t == wanted,
        Some(JsonValue::Array(types)) => types.iter().any(|t| t.as_str() == Some(wanted)),
        _ => false,
    }
}

/// Walk arrays, `@graph` containers and item lists, collecting products in
/// document order.
fn collect_products<'a>(value: &'a JsonValue, out: &mut Vec<&'a JsonValue>) {
    match value {
        JsonValue::Array(items) => {
            for item in items {
                collect_products(item, out);
            }
        }
        JsonValue::Object(map) => {
            if let Some(graph) = map.get("@graph") {
                collect_products(graph, out);
            }
            if has_type(value, "Product") {
                out.push(value);
            } else if has_type(value, "ItemList") {
                if let Some(JsonValue::Array(elements)) = map.get("itemListElement") {
                    for element in elements {
                        match element.get("item") {
                            Some(item) if item.is_object() => collect_products(item, out),
                            _ if element.get("url").is_some() && element.get("name").is_some() => {
                                out.push(element)
                            }
                            _ => {}
                        }
                    }
                }
            }
        }
        _ => {}
    }
}

fn str_field(value: &JsonValue, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(JsonValue::as_str)
        .map(clean_text)
        .filter(|s| !s.is_empty())
}

/// `brand` may be a plain string or a `Brand` object.
fn brand_of(product: &JsonValue) -> Option<String> {
    match product.get("brand")? {
        JsonValue::String(s) => Some(clean_text(s)),
        brand => str_field(brand, "name"),
    }
    .filter(|s| !s.is_empty())
}

fn reference_of(product: &JsonValue) -> Option<String> {
    ["mpn", "sku", "productID"]
        .iter()
        .find_map(|key| str_field(product, key))
        .and_then(|raw| clean_reference(&raw))
}

fn image_of(product: &JsonValue) -> Option<String> {
    match product.get("image")? {
        JsonValue::String(s) => Some(s.trim().to_string()),
        JsonValue::Array(items) => items.first().and_then(|first| match first {
            JsonValue::String(s) => Some(s.trim().to_string()),
            other => str_field(other, "url"),
        }),
        other => str_field(other, "url"),
    }
    .filter(|s| !s.is_empty())
}

fn first_offer(product: &JsonValue) -> Option<&JsonValue> {
    match product.get("offers")? {
        JsonValue::Array(offers) => offers.first(),
        offer => Some(offer),
    }
}

fn price_of(offer: &JsonValue, default_currency: &str) -> Option<Price> {
    let currency = offer
        .get("priceCurrency")
        .and_then(JsonValue::as_str)
        .map(|c| c.trim().to_uppercase())
        .filter(|c| !c.is_empty())
        .unwrap_or_else(|| default_currency.to_string());
    let price = offer.get("price").or_else(|| offer.get("lowPrice"))?;
    match price {
        JsonValue::Number(n) => {
            let minor = (n.as_f64()? * 100.0).round();
            minor.is_finite().then(|| Price::new(minor as i64, currency))
        }
        JsonValue::String(s) => wm_core::price::parse_price(s).map(|minor| Price::new(minor, currency)),
        _ => None,
    }
}

fn product_to_listing(site: &SiteConfig, product: &JsonValue) -> Option<Listing> {
    let title = str_field(product, "name")?;
    let offer = first_offer(product);
    let url = str_field(product, "url").or_else(|| offer.and_then(|o| str_field(o, "url")))?;

    let mut listing = Listing::new(site, &title, &site.absolute_url(&url));

    let (split_brand, split_model) = split_brand_model(&title, &site.known_brands);
    match brand_of(product) {
        Some(brand) => {
            listing.model = str_field(product, "model").or_else(|| {
                let lower = title.to_lowercase();
                let rest = lower
                    .starts_with(&brand.to_lowercase())
                    .then(|| title.get(brand.len()..))
                    .flatten()
                    .map(str::trim)
                    .unwrap_or(title.as_str());
                (!rest.is_empty()).then(|| rest.to_string())
            });
            listing.brand = Some(brand);
        }
        None => {
            listing.brand = split_brand;
            listing.model = str_field(product, "model").or(split_model);
        }
    }

    listing.reference = reference_of(product);
    listing.year = parse_year("", &title);
    if let Some(price) = offer.and_then(|o| price_of(o, &site.currency)) {
        listing.set_price(price);
    }
    listing.image_url = image_of(product).map(|src| site.absolute_url(&src));
    Some(listing)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ITEM_LIST_HTML: &str = r#"
        <html><head>
        <script type="application/ld+json">{ this is not json }</script>
        <script type="application/ld+json">
        {
          "@context": "https://schema.org",
          "@type": "ItemList",
          "itemListElement": [
            {"@type": "ListItem", "position": 1, "item": {
              "@type": "Product",
              "name": "Omega Speedmaster Professional",
              "url": "/watches/omega-speedmaster",
              "brand": {"@type": "Brand", "name": "Omega"},
              "sku": "Ref. 3570.50",
              "image": ["https://cdn.example.com/omega.jpg"],
              "offers": {"@type": "Offer", "price": "4200.00", "priceCurrency": "usd"}
            }},
            {"@type": "ListItem", "position": 2, "item": {
              "@type": "Product",
              "name": "Heuer Autavia 1968",
              "offers": [{"url": "https://shop.example.com/heuer", "price": 12500}]
            }},
            {"@type": "ListItem", "position": 3, "item": {"@type": "Product", "name": "No url anywhere"}}
          ]
        }
        </script>
        </head><body></body></html>"#;

    fn site() -> SiteConfig {
        let mut site = SiteConfig::named("tropicalwatch", "Tropical Watch", "https://shop.example.com/watches");
        site.extractor = ExtractorKind::JsonLd;
        site.currency = "USD".into();
        site
    }

    #[test]
    fn extracts_products_from_item_list() {
        let listings = JsonLdExtractor.extract(&site(), ITEM_LIST_HTML).unwrap();
        assert_eq!(listings.len(), 2);

        let omega = &listings[0];
        assert_eq!(omega.url, "https://shop.example.com/watches/omega-speedmaster");
        assert_eq!(omega.brand.as_deref(), Some("Omega"));
        assert_eq!(omega.model.as_deref(), Some("Speedmaster Professional"));
        assert_eq!(omega.reference.as_deref(), Some("3570.50"));
        assert_eq!(omega.price, Some(Price::new(420_000, "USD")));
        assert_eq!(omega.image_url.as_deref(), Some("https://cdn.example.com/omega.jpg"));

        let heuer = &listings[1];
        assert_eq!(heuer.url, "https://shop.example.com/heuer");
        assert_eq!(heuer.brand.as_deref(), Some("Heuer"));
        assert_eq!(heuer.year.as_deref(), Some("1968"));
        assert_eq!(heuer.price, Some(Price::new(1_250_000, "USD")));
    }

    #[test]
    fn only_malformed_blocks_is_an_error() {
        let html = r#"<script type="application/ld+json">{"broken": </script>"#;
        assert!(matches!(
            JsonLdExtractor.extract(&site(), html),
            Err(ExtractError::StructuredData(_))
        ));
    }

    #[test]
    fn page_without_structured_data_yields_nothing() {
        assert!(JsonLdExtractor.extract(&site(), "<p>hello</p>").unwrap().is_empty());
    }

    #[test]
    fn graph_products_and_detail_description() {
        let html = r#"<script type="application/ld+json">
            {"@graph": [{"@type": ["Product", "Thing"], "name": "Rolex GMT-Master", "url": "/w/1",
              "mpn": "16700", "description": "Full set from 1995, very good condition"}]}
        </script>"#;
        let site = site();
        let listings = JsonLdExtractor.extract(&site, html).unwrap();
        assert_eq!(listings.len(), 1);

        let mut listing = Listing::new(&site, "Rolex GMT-Master", "https://shop.example.com/w/1");
        JsonLdExtractor.extract_details(&site, &mut listing, html).unwrap();
        assert_eq!(listing.reference.as_deref(), Some("16700"));
        assert_eq!(listing.year.as_deref(), Some("1995"));
        assert_eq!(listing.condition.as_deref(), Some("★★★★☆"));
        assert_eq!((listing.has_papers, listing.has_box), (Some(true), Some(true)));
    }
}
