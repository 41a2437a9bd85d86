//! Price normalization. Prices are carried as integer minor units so they
//! hash identically across runs.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static ON_REQUEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)price.*on.*request|preis.*auf.*anfrage").expect("valid on-request regex")
});

static CURRENCY_TOKENS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)eur|usd|gbp|chf|[€$£¥₹\s]").expect("valid currency regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Price {
    pub minor_units: i64,
    pub currency: String,
}

impl Price {
    pub fn new(minor_units: i64, currency: impl Into<String>) -> Self {
        Self {
            minor_units,
            currency: currency.into(),
        }
    }

    /// Parse `text`, inferring the currency from it and falling back to
    /// `default_currency`.
    pub fn parse(text: &str, default_currency: &str) -> Option<Self> {
        let minor_units = parse_price(text)?;
        let currency = detect_currency(text).unwrap_or(default_currency);
        Some(Self::new(minor_units, currency))
    }

    pub fn display(&self) -> String {
        format_price_display(self.minor_units, &self.currency)
    }

    pub fn major_units(&self) -> f64 {
        self.minor_units as f64 / 100.0
    }
}

/// Parse retailer price text into minor units (cents).
///
/// Handles European (`8.500,00`) and US (`8,500.00`) separators, bare
/// thousands groups (`8.500`), trailing `,-`, and currency symbols or codes.
/// "Price on request" style text yields `None`.
pub fn parse_price(text: &str) -> Option<i64> {
    if text.trim().is_empty() || ON_REQUEST.is_match(text) {
        return None;
    }

    let mut cleaned = CURRENCY_TOKENS.replace_all(text, "").into_owned();
    for suffix in [",-", ",--", "-"] {
        if let Some(stripped) = cleaned.strip_suffix(suffix) {
            cleaned = stripped.to_string();
            break;
        }
    }
    if cleaned.is_empty() || !cleaned.chars().all(|c| c.is_ascii_digit() || c == '.' || c == ',') {
        return None;
    }

    let (integer, fraction) = split_decimal(&cleaned)?;
    to_minor_units(&integer, &fraction)
}

/// Returns (integer digits, fraction digits).
fn split_decimal(cleaned: &str) -> Option<(String, String)> {
    let last_dot = cleaned.rfind('.');
    let last_comma = cleaned.rfind(',');

    let (thousands, decimal) = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) if dot < comma => (Some('.'), Some(',')),
        (Some(_), Some(_)) => (Some(','), Some('.')),
        (None, Some(_)) => {
            if is_thousands_grouped(cleaned, ',') {
                (Some(','), None)
            } else {
                (None, Some(','))
            }
        }
        (Some(_), None) => {
            if is_thousands_grouped(cleaned, '.') {
                (Some('.'), None)
            } else {
                (None, Some('.'))
            }
        }
        (None, None) => (None, None),
    };

    let without_thousands: String = match thousands {
        Some(sep) => cleaned.chars().filter(|c| *c != sep).collect(),
        None => cleaned.to_string(),
    };

    match decimal {
        Some(sep) => {
            let mut parts = without_thousands.split(sep);
            let integer = parts.next().unwrap_or_default().to_string();
            let fraction = parts.next().unwrap_or_default().to_string();
            if parts.next().is_some() {
                return None;
            }
            Some((integer, fraction))
        }
        None => Some((without_thousands, String::new())),
    }
}

/// `1.234` or `12.345.678`: every group after the first has three digits.
fn is_thousands_grouped(cleaned: &str, sep: char) -> bool {
    let mut groups = cleaned.split(sep);
    let first = groups.next().unwrap_or_default();
    if first.is_empty() || first.len() > 3 {
        return false;
    }
    let rest: Vec<&str> = groups.collect();
    !rest.is_empty() && rest.iter().all(|g| g.len() == 3 && g.chars().all(|c| c.is_ascii_digit()))
}

fn to_minor_units(integer: &str, fraction: &str) -> Option<i64> {
    if integer.is_empty() && fraction.is_empty() {
        return None;
    }
    if !integer.chars().chain(fraction.chars()).all(|c| c.is_ascii_digit()) {
        return None;
    }
    let major: i64 = if integer.is_empty() { 0 } else { integer.parse().ok()? };
    let cents: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().ok()? * 10,
        _ => fraction[..2].parse().ok()?,
    };
    major.checked_mul(100)?.checked_add(cents)
}

/// ISO code for a currency symbol or code found in `text`.
pub fn detect_currency(text: &str) -> Option<&'static str> {
    let upper = text.to_uppercase();
    if text.contains('€') || upper.contains("EUR") {
        Some("EUR")
    } else if text.contains('$') || upper.contains("USD") {
        Some("USD")
    } else if text.contains('£') || upper.contains("GBP") {
        Some("GBP")
    } else if upper.contains("CHF") {
        Some("CHF")
    } else {
        None
    }
}

/// `€8.500`, `$12.000`, `9.900 CHF`: whole units, dot-grouped.
pub fn format_price_display(minor_units: i64, currency: &str) -> String {
    let whole = (minor_units + 50).div_euclid(100);
    let grouped = group_thousands(whole);
    match currency {
        "EUR" => format!("€{grouped}"),
        "USD" => format!("${grouped}"),
        "GBP" => format!("£{grouped}"),
        other => format!("{grouped} {other}"),
    }
}

fn group_thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push('.');
        }
        out.push(ch);
    }
    if value < 0 {
        out.insert(0, '-');
    }
    out
}
