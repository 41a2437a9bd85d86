//! Selector-driven extraction of product cards and detail tables.

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use tracing::{debug, warn};
use wm_core::{clean_text, DetailField, ExtractorKind, Listing, Price, SiteConfig};

use crate::parse::{clean_reference, parse_box_papers, parse_condition, parse_year, split_brand_model};
use crate::{
    apply_description, compile, compile_optional, element_text, first_text, text_or_none,
    ExtractError, Extractor,
};

static ANCHOR: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("a[href]").expect("valid anchor selector"));
static CELLS: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("th, td").expect("valid cell selector"));

const IMAGE_ATTRS: &[&str] = &["data-src", "data-lazy-src", "src"];
const PRICE_ATTRS: &[&str] = &["data-price", "content", "value"];

#[derive(Debug, Clone, Copy, Default)]
pub struct CardsExtractor;

struct CardSelectors {
    link: Option<Selector>,
    title: Option<Selector>,
    brand: Option<Selector>,
    price: Option<Selector>,
    image: Option<Selector>,
}

impl CardSelectors {
    fn compile(site: &SiteConfig) -> Result<Self, ExtractError> {
        let s = &site.selectors;
        Ok(Self {
            link: compile_optional(&s.link)?,
            title: compile_optional(&s.title)?,
            brand: compile_optional(&s.brand)?,
            price: compile_optional(&s.price)?,
            image: compile_optional(&s.image)?,
        })
    }
}

impl Extractor for CardsExtractor {
    fn kind(&self) -> ExtractorKind {
        ExtractorKind::Cards
    }

    fn extract(&self, site: &SiteConfig, html: &str) -> Result<Vec<Listing>, ExtractError> {
        let container = compile_optional(&site.selectors.container)?.ok_or_else(|| {
            ExtractError::MissingSelector {
                site: site.key.clone(),
                what: "container",
            }
        })?;
        let selectors = CardSelectors::compile(site)?;
        let document = Html::parse_document(html);

        let mut listings = Vec::new();
        for (index, card) in document.select(&container).enumerate() {
            match parse_card(site, &selectors, card) {
                Some(listing) => listings.push(listing),
                None => debug!(site = %site.key, index, "skipping card without title or link"),
            }
        }

        if listings.is_empty() {
            warn!(site = %site.key, selector = %site.selectors.container, "no listings matched");
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
        apply_detail_page(site, listing, &document)
    }
}

fn parse_card(site: &SiteConfig, selectors: &CardSelectors, card: ElementRef<'_>) -> Option<Listing> {
    let link = match &selectors.link {
        Some(sel) => card.select(sel).next(),
        None if card.value().name() == "a" => Some(card),
        None => card.select(&ANCHOR).next(),
    }?;
    let href = link.value().attr("href").and_then(|h| text_or_none(h.to_string()))?;

    let title_element = selectors
        .title
        .as_ref()
        .and_then(|sel| card.select(sel).next());
    let title = title_element
        .map(element_text)
        .and_then(text_or_none)
        .or_else(|| link.value().attr("title").map(clean_text))
        .or_else(|| text_or_none(element_text(link)))?;

    let mut listing = Listing::new(site, &title, &site.absolute_url(&href));

    let tagged_brand = title_element.and_then(|el| first_text(el, selectors.brand.as_ref()));
    let (brand, model) = match tagged_brand {
        Some(brand) => {
            let model = strip_prefix_ignore_case(&title, &brand)
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(ToString::to_string);
            (Some(brand), model)
        }
        None => split_brand_model(&title, &site.known_brands),
    };
    listing.brand = brand;
    listing.model = model;
    listing.year = parse_year("", &title);

    if let Some(price_text) = selectors
        .price
        .as_ref()
        .and_then(|sel| card.select(sel).next())
        .and_then(read_price_text)
    {
        if let Some(price) = Price::parse(&price_text, &site.currency) {
            listing.set_price(price);
        } else {
            listing.price_display = Some(price_text);
        }
    }

    listing.image_url = selectors
        .image
        .as_ref()
        .and_then(|sel| card.select(sel).next())
        .and_then(|img| IMAGE_ATTRS.iter().find_map(|attr| img.value().attr(attr)))
        .and_then(|src| text_or_none(src.to_string()))
        .map(|src| site.absolute_url(&src));

    Some(listing)
}

fn read_price_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element_text(element)).or_else(|| {
        PRICE_ATTRS
            .iter()
            .find_map(|attr| element.value().attr(attr))
            .and_then(|v| text_or_none(v.to_string()))
    })
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &text[prefix.len()..])
}

/// Apply the site's detail table and description selectors to `listing`.
pub(crate) fn apply_detail_page(
    site: &SiteConfig,
    listing: &mut Listing,
    document: &Html,
) -> Result<(), ExtractError> {
    let detail = &site.detail;
    let scope = match compile_optional(&detail.container)? {
        Some(sel) => document
            .select(&sel)
            .next()
            .unwrap_or_else(|| document.root_element()),
        None => document.root_element(),
    };

    if !detail.headers.is_empty() {
        let rows = compile(if detail.rows.trim().is_empty() { "tr" } else { detail.rows.as_str() })?;
        for row in scope.select(&rows) {
            let mut cells = row.select(&CELLS);
            let (Some(header), Some(value)) = (cells.next(), cells.next()) else {
                continue;
            };
            let header = element_text(header).to_lowercase().replace(':', "");
            let value = element_text(value);
            if value.is_empty() {
                continue;
            }
            let field = detail
                .headers
                .iter()
                .find(|(key, _)| header.contains(&key.to_lowercase()))
                .map(|(_, field)| *field);
            if let Some(field) = field {
                apply_field(site, listing, field, &value);
            }
        }
    }

    if let Some(description) = compile_optional(&detail.description)? {
        let text = scope
            .select(&description)
            .map(element_text)
            .collect::<Vec<_>>()
            .join(" ");
        apply_description(site, listing, &text);
    }
    Ok(())
}

fn apply_field(site: &SiteConfig, listing: &mut Listing, field: DetailField, value: &str) {
    match field {
        DetailField::Reference => {
            if let Some(reference) = clean_reference(value) {
                listing.reference = Some(reference);
            }
        }
        DetailField::Year => {
            if let Some(year) = parse_year(value, "") {
                listing.year = Some(year);
            }
        }
        DetailField::Condition => {
            listing.condition = parse_condition(value, &site.condition_mappings)
                .or_else(|| Some(value.to_string()));
        }
        DetailField::CaseMaterial => listing.case_material = Some(value.to_string()),
        DetailField::Diameter => listing.diameter = Some(value.to_string()),
        DetailField::BoxPapers => {
            let (papers, has_box) = parse_box_papers(value);
            listing.has_papers = papers.or(listing.has_papers);
            listing.has_box = has_box.or(listing.has_box);
        }
    }
}
