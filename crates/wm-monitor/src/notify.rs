//! Discord webhook notifications for new listings.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::HeaderMap;
use reqwest::{StatusCode, Url};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, error, info, warn};
use wm_core::{Listing, Price, SiteStyle};

use crate::rates::RateCache;

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);
const MAX_TITLE_CHARS: usize = 250;
const CHRONO24_SEARCH: &str = "https://www.chrono24.de/search/index.htm";

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver one listing. `false` on any failure; never errors.
    async fn send(&self, listing: &Listing, style: &SiteStyle) -> bool;

    /// Post a test message to `webhook_url`.
    async fn test_webhook(&self, webhook_url: &str) -> bool;
}

/// Send `listings` in order with `delay` between consecutive sends. Returns
/// the number delivered.
pub async fn notify_all(
    notifier: &dyn Notifier,
    listings: &[Listing],
    style: &SiteStyle,
    delay: Duration,
) -> usize {
    if listings.is_empty() {
        return 0;
    }
    if style.webhook_url.is_none() {
        warn!(site = %style.name, "no webhook configured; skipping notifications");
        return 0;
    }

    let mut sent = 0;
    for (i, listing) in listings.iter().enumerate() {
        if notifier.send(listing, style).await {
            sent += 1;
        }
        if i + 1 < listings.len() && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
    info!(site = %style.name, sent, total = listings.len(), "notifications sent");
    sent
}

pub struct DiscordNotifier {
    client: reqwest::Client,
    rates: Option<Arc<RateCache>>,
}

impl DiscordNotifier {
    pub fn new(client: reqwest::Client, rates: Option<Arc<RateCache>>) -> Self {
        Self { client, rates }
    }

    async fn post(&self, webhook_url: &str, payload: &JsonValue, label: &str) -> bool {
        let response = match self.client.post(webhook_url).json(payload).send().await {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, label, "webhook request failed");
                return false;
            }
        };
        if is_delivered(response.status()) {
            debug!(label, "notification delivered");
            return true;
        }

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            let wait = retry_after(&headers, &body);
            warn!(label, wait_secs = wait.as_secs_f64(), "discord rate limit hit; retrying once");
            tokio::time::sleep(wait).await;
            return match self.client.post(webhook_url).json(payload).send().await {
                Ok(retry) if is_delivered(retry.status()) => true,
                Ok(retry) => {
                    error!(label, status = %retry.status(), "webhook retry rejected");
                    false
                }
                Err(err) => {
                    error!(error = %err, label, "webhook retry failed");
                    false
                }
            };
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        error!(label, %status, body = %body, "webhook rejected notification");
        false
    }
}

#[async_trait]
impl Notifier for DiscordNotifier {
    async fn send(&self, listing: &Listing, style: &SiteStyle) -> bool {
        let Some(webhook_url) = style.webhook_url.as_deref() else {
            return false;
        };
        let approx_eur = match (&self.rates, &listing.price) {
            (Some(rates), Some(price)) => rates.convert_to_eur(price).await,
            _ => None,
        };
        let payload = json!({ "embeds": [listing_embed(listing, style.color, approx_eur.as_ref())] });
        self.post(webhook_url, &payload, &listing.title).await
    }

    async fn test_webhook(&self, webhook_url: &str) -> bool {
        let payload = json!({ "embeds": [test_embed()] });
        self.post(webhook_url, &payload, "webhook test").await
    }
}

fn is_delivered(status: StatusCode) -> bool {
    status == StatusCode::NO_CONTENT || status.is_success()
}

/// Wait requested by a 429: the `X-RateLimit-Reset-After` header, else the
/// body's `retry_after` (seconds), else five seconds.
pub fn retry_after(headers: &HeaderMap, body: &str) -> Duration {
    let from_header = headers
        .get("x-ratelimit-reset-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok());
    let from_body = || {
        serde_json::from_str::<JsonValue>(body)
            .ok()
            .and_then(|v| v.get("retry_after").and_then(JsonValue::as_f64))
    };
    from_header
        .or_else(from_body)
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(DEFAULT_RETRY_AFTER)
}

/// Brand and model (without a repeated brand), then `| reference` when the
/// reference is not already part of it. Falls back to the listing title.
pub fn embed_title(listing: &Listing) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if let Some(brand) = listing.brand.as_deref() {
        parts.push(brand);
    }
    if let Some(model) = listing.model.as_deref() {
        parts.push(model_without_brand(model, listing.brand.as_deref()));
    }
    parts.retain(|p| !p.is_empty());

    let mut title = if parts.is_empty() {
        listing.title.clone()
    } else {
        parts.join(" ")
    };
    if let Some(reference) = listing.reference.as_deref() {
        if !title.contains(reference) {
            title = format!("{title} | {reference}");
        }
    }
    if title.chars().count() > MAX_TITLE_CHARS {
        title = title.chars().take(MAX_TITLE_CHARS).collect::<String>() + "...";
    }
    if title.is_empty() {
        "Unknown Watch".to_string()
    } else {
        title
    }
}

fn model_without_brand<'a>(model: &'a str, brand: Option<&str>) -> &'a str {
    match brand {
        Some(brand)
            if model.len() >= brand.len()
                && model.is_char_boundary(brand.len())
                && model[..brand.len()].eq_ignore_ascii_case(brand) =>
        {
            model[brand.len()..].trim()
        }
        _ => model,
    }
}

pub fn chrono24_search_url(listing: &Listing) -> String {
    let mut terms: Vec<&str> = Vec::new();
    if let Some(brand) = listing.brand.as_deref() {
        terms.push(brand);
    }
    if let Some(model) = listing.model.as_deref() {
        terms.push(model_without_brand(model, listing.brand.as_deref()));
    }
    if let Some(reference) = listing.reference.as_deref() {
        terms.push(reference);
    }
    terms.retain(|t| !t.is_empty());
    let query = if terms.is_empty() { listing.title.clone() } else { terms.join(" ") };

    Url::parse_with_params(
        CHRONO24_SEARCH,
        &[("dosearch", "true"), ("query", query.as_str()), ("sortorder", "1")],
    )
    .map(String::from)
    .unwrap_or_else(|_| CHRONO24_SEARCH.to_string())
}

fn field(name: &str, value: String, inline: bool) -> JsonValue {
    json!({ "name": name, "value": value, "inline": inline })
}

fn yes_no(value: bool) -> String {
    let mark = if value { "✅" } else { "❌" };
    format!("**{mark}**")
}

pub fn listing_embed(listing: &Listing, color: u32, approx_eur: Option<&Price>) -> JsonValue {
    let title = embed_title(listing);
    let mut price = listing.price_display.clone().unwrap_or_else(|| "❓".to_string());
    if let Some(eur) = approx_eur {
        price = format!("{price} (≈ {})", eur.display());
    }

    let mut fields = vec![field("💰 Price:", format!("**{price}**"), false)];
    if let Some(reference) = listing.reference.as_deref() {
        if !title.contains(reference) {
            fields.push(field("#️⃣ Reference:", format!("**{reference}**"), false));
        }
    }
    fields.push(field(
        "🔍 Chrono24 Search:",
        format!("[**Search similar**]({})", chrono24_search_url(listing)),
        false,
    ));
    fields.push(field("\u{200B}", "\u{200B}".to_string(), false));

    if let Some(year) = listing.year.as_deref() {
        fields.push(field("🗓️ Year:", format!("**{year}**"), true));
    }
    if let Some(condition) = listing.condition.as_deref() {
        fields.push(field("⭐ Condition:", format!("**{condition}**"), true));
    }
    if let Some(has_box) = listing.has_box {
        fields.push(field("📦 Box:", yes_no(has_box), true));
    }
    if let Some(has_papers) = listing.has_papers {
        fields.push(field("📄 Papers:", yes_no(has_papers), true));
    }
    if let Some(material) = listing.case_material.as_deref() {
        fields.push(field("🔩 Case Material:", format!("**{material}**"), true));
    }
    if let Some(diameter) = listing.diameter.as_deref() {
        fields.push(field("📏 Diameter:", format!("**{diameter}**"), true));
    }

    let mut embed = json!({
        "title": title,
        "url": listing.url,
        "color": color,
        "fields": fields,
        "footer": {
            "text": format!(
                "{} - Detected: {}",
                listing.site_name,
                listing.scraped_at.format("%Y-%m-%d %H:%M:%S")
            )
        },
    });
    if let Some(image) = listing.image_url.as_deref() {
        embed["image"] = json!({ "url": image });
    }
    embed
}

fn test_embed() -> JsonValue {
    json!({
        "title": "🔔 Watch Monitor Test",
        "description": "This is a test notification from the watch monitor.",
        "color": 0x00FF00,
        "fields": [{ "name": "Status", "value": "✅ Webhook is working correctly!", "inline": false }],
        "footer": { "text": format!("Test performed at {}", Utc::now().format("%Y-%m-%d %H:%M:%S")) },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use wm_core::SiteConfig;

    fn listing() -> Listing {
        let site = SiteConfig::named("grimmeissen", "Grimmeissen", "https://www.grimmeissen.de/de/uhren");
        let mut listing = Listing::new(&site, "Rolex Submariner Date 16610", "https://www.grimmeissen.de/de/uhr-1");
        listing.brand = Some("Rolex".into());
        listing.model = Some("Rolex Submariner Date".into());
        listing.reference = Some("16610".into());
        listing.year = Some("1998".into());
        listing.has_box = Some(false);
        listing.image_url = Some("https://www.grimmeissen.de/media/1.jpg".into());
        listing.set_price(Price::new(850_000, "EUR"));
        listing
    }

    #[test]
    fn retry_after_prefers_header_then_body() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers, ""), Duration::from_secs(5));
        assert_eq!(
            retry_after(&headers, r#"{"message":"rate limited","retry_after":0.75}"#),
            Duration::from_millis(750)
        );
        headers.insert("X-RateLimit-Reset-After", HeaderValue::from_static("2"));
        assert_eq!(retry_after(&headers, r#"{"retry_after":9}"#), Duration::from_secs(2));
    }

    #[test]
    fn retry_after_ignores_garbage() {
        let mut headers = HeaderMap::new();
        headers.insert("X-RateLimit-Reset-After", HeaderValue::from_static("soon"));
        assert_eq!(retry_after(&headers, "not json"), Duration::from_secs(5));
    }

    #[test]
    fn title_dedups_brand_and_appends_reference() {
        assert_eq!(embed_title(&listing()), "Rolex Submariner Date | 16610");

        let mut bare = listing();
        bare.brand = None;
        bare.model = None;
        bare.reference = None;
        assert_eq!(embed_title(&bare), "Rolex Submariner Date 16610");

        let mut long = bare.clone();
        long.title = "x".repeat(300);
        assert_eq!(embed_title(&long).chars().count(), 253);
    }

    #[test]
    fn embed_carries_price_approximation_and_optional_fields() {
        let mut usd = listing();
        usd.set_price(Price::new(1_000_000, "USD"));
        let embed = listing_embed(&usd, 0xDAA520, Some(&Price::new(920_000, "EUR")));

        assert_eq!(embed["url"], "https://www.grimmeissen.de/de/uhr-1");
        assert_eq!(embed["color"], 0xDAA520);
        assert_eq!(embed["image"]["url"], "https://www.grimmeissen.de/media/1.jpg");
        assert!(embed["footer"]["text"].as_str().unwrap().starts_with("Grimmeissen - Detected: "));

        let fields = embed["fields"].as_array().unwrap();
        assert_eq!(fields[0]["value"], "**$10.000 (≈ €9.200)**");
        let names: Vec<&str> = fields.iter().filter_map(|f| f["name"].as_str()).collect();
        assert!(names.contains(&"🗓️ Year:"));
        assert!(names.contains(&"📦 Box:"));
        assert!(!names.contains(&"📄 Papers:"));
        assert!(!names.contains(&"#️⃣ Reference:"), "reference already in title");
    }

    #[test]
    fn search_url_is_encoded() {
        let url = chrono24_search_url(&listing());
        assert!(url.starts_with("https://www.chrono24.de/search/index.htm?dosearch=true&query="));
        assert!(url.contains("query=Rolex+Submariner+Date+16610"));
    }
}
