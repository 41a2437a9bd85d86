//! Stable listing identities used for deduplication across re-scrapes.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::Listing;

/// Joins key components. Control characters are stripped from normalized
/// text, so this can never occur inside a component.
const KEY_SEPARATOR: char = '\u{1f}';

/// Opaque, fixed-length identity of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short prefix for log lines.
    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn fingerprint(listing: &Listing) -> Fingerprint {
    Fingerprint(sha256_hex(identity_key(listing).as_bytes()))
}

/// The pre-hash key. Attribute-based when at least two of brand, model,
/// reference and price are known, otherwise title + price + url.
pub fn identity_key(listing: &Listing) -> String {
    let brand = normalize(listing.brand.as_deref());
    let model = normalize(listing.model.as_deref());
    let reference = normalize_reference(listing.reference.as_deref());
    let price = listing
        .price
        .as_ref()
        .map(|p| p.minor_units.to_string())
        .unwrap_or_default();
    let year = normalize(listing.year.as_deref());
    let material = normalize(listing.case_material.as_deref());

    let essential = [&brand, &model, &reference, &price]
        .iter()
        .filter(|c| !c.is_empty())
        .count();

    if essential < 2 {
        let title = normalize(Some(&listing.title));
        let url = normalize(Some(&listing.url));
        return join_present([title, price, url]);
    }

    join_present([brand, model, reference, price, year, material])
}

fn normalize(value: Option<&str>) -> String {
    value
        .unwrap_or_default()
        .split_whitespace()
        .map(|word| word.chars().filter(|c| !c.is_control()).collect::<String>())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn normalize_reference(value: Option<&str>) -> String {
    value
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect::<String>()
        .to_lowercase()
}

fn join_present<const N: usize>(parts: [String; N]) -> String {
    let mut key = String::new();
    for part in parts.iter().filter(|p| !p.is_empty()) {
        if !key.is_empty() {
            key.push(KEY_SEPARATOR);
        }
        key.push_str(part);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Price, SiteConfig};
    use chrono::{TimeZone, Utc};

    fn site() -> SiteConfig {
        SiteConfig::named("grimmeissen", "Grimmeissen", "https://www.grimmeissen.de/de/uhren")
    }

    fn listing(title: &str, url: &str) -> Listing {
        Listing::new(&site(), title, url)
    }

    fn described(brand: &str, model: &str, reference: &str, price: i64) -> Listing {
        let mut l = listing("Rolex Submariner", "https://www.grimmeissen.de/de/uhren/1");
        l.brand = Some(brand.to_string());
        l.model = Some(model.to_string());
        l.reference = Some(reference.to_string());
        l.set_price(Price::new(price, "EUR"));
        l.year = Some("1998".to_string());
        l.case_material = Some("Stahl".to_string());
        l
    }

    #[test]
    fn fingerprint_is_fixed_width_hex() {
        let fp = fingerprint(&described("Rolex", "Submariner", "16610", 850_000));
        assert_eq!(fp.as_str().len(), 64);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(fp.short().len(), 12);
    }

    #[test]
    fn fingerprint_ignores_url_image_and_capture_time() {
        let a = described("Rolex", "Submariner", "16610", 850_000);
        let mut b = described("Rolex", "Submariner", "16610", 850_000);
        b.url = "https://www.grimmeissen.de/de/uhren/other".to_string();
        b.image_url = Some("https://cdn.example/img.jpg".to_string());
        b.scraped_at = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).single().unwrap();
        b.title = "Completely different title".to_string();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_ignores_case_and_whitespace_variation() {
        let a = described("Rolex", "Submariner  Date", "16 610", 850_000);
        let b = described(" ROLEX ", "submariner date", "16610", 850_000);
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_changes_with_price() {
        let a = described("Rolex", "Submariner", "16610", 850_000);
        let b = described("Rolex", "Submariner", "16610", 849_900);
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn fingerprint_ignores_price_formatting() {
        let mut a = described("Rolex", "Submariner", "16610", 0);
        let mut b = described("Rolex", "Submariner", "16610", 0);
        a.set_price(Price::parse("€8.500,00", "EUR").unwrap());
        b.set_price(Price::parse("8500 EUR", "EUR").unwrap());
        assert_eq!(a.price, b.price);
        assert_eq!(a.price_display, b.price_display);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn sparse_listing_falls_back_to_title_price_url() {
        let a = listing("Vintage Chronograph", "https://example.com/w/1");
        let b = listing("Vintage Diver", "https://example.com/w/1");
        assert_eq!(
            identity_key(&a),
            format!("vintage chronograph{KEY_SEPARATOR}https://example.com/w/1")
        );
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn single_essential_attribute_still_uses_fallback() {
        let mut a = listing("Omega Speedmaster", "https://example.com/w/2");
        a.brand = Some("Omega".to_string());
        a.year = Some("1969".to_string());
        let key = identity_key(&a);
        assert!(key.starts_with("omega speedmaster"));
        assert!(key.ends_with("https://example.com/w/2"));
    }

    #[test]
    fn brand_and_price_are_enough_for_attribute_key() {
        let mut a = listing("Omega", "https://example.com/w/3");
        a.brand = Some("Omega".to_string());
        a.set_price(Price::new(420_000, "EUR"));
        assert_eq!(identity_key(&a), format!("omega{KEY_SEPARATOR}420000"));
    }
}
