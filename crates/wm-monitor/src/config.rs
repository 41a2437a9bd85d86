//! Environment-driven runtime settings and the YAML site registry.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use wm_adapters::validate_site;
use wm_core::SiteConfig;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/108.0.0.0 Safari/537.36";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub seen_file: PathBuf,
    pub history_file: PathBuf,
    pub sites_file: PathBuf,
    pub check_interval: Duration,
    pub max_concurrent_sites: usize,
    pub max_concurrent_details: usize,
    pub user_agent: String,
    pub request_timeout: Duration,
    pub detail_page_delay: Duration,
    pub notification_delay: Duration,
    pub max_retries: usize,
    pub exchange_rate_api_url: String,
    pub exchange_rate_cache_duration: Duration,
    pub max_seen_items_per_site: usize,
    pub history_retention_days: u32,
    pub max_history_entries: usize,
    pub maintenance_every_cycles: u64,
    pub memory_high_water_mb: u64,
    pub enable_notifications: bool,
    pub enable_detail_scraping: bool,
    pub enable_exchange_rate_conversion: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            seen_file: PathBuf::from("seen_watches.json"),
            history_file: PathBuf::from("session_history.json"),
            sites_file: PathBuf::from("sites.yaml"),
            check_interval: Duration::from_secs(300),
            max_concurrent_sites: 2,
            max_concurrent_details: 5,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            request_timeout: Duration::from_secs(15),
            detail_page_delay: Duration::from_millis(1500),
            notification_delay: Duration::from_secs(1),
            max_retries: 3,
            exchange_rate_api_url: "https://api.exchangerate-api.com/v4/latest/USD".to_string(),
            exchange_rate_cache_duration: Duration::from_secs(3600),
            max_seen_items_per_site: wm_core::seen::DEFAULT_MAX_ITEMS_PER_SITE,
            history_retention_days: wm_storage::history::DEFAULT_RETENTION_DAYS,
            max_history_entries: wm_storage::history::DEFAULT_MAX_ENTRIES,
            maintenance_every_cycles: 12,
            memory_high_water_mb: 512,
            enable_notifications: true,
            enable_detail_scraping: true,
            enable_exchange_rate_conversion: true,
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes"))
}

fn env_secs_f64(key: &str) -> Option<Duration> {
    env_parse::<f64>(key)
        .filter(|v| v.is_finite() && *v >= 0.0)
        .map(Duration::from_secs_f64)
}

impl MonitorConfig {
    /// Defaults overridden by environment variables; unparsable values fall
    /// back to the default.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            seen_file: std::env::var("SEEN_WATCHES_FILE").map(PathBuf::from).unwrap_or(d.seen_file),
            history_file: std::env::var("SESSION_HISTORY_FILE")
                .map(PathBuf::from)
                .unwrap_or(d.history_file),
            sites_file: std::env::var("SITES_FILE").map(PathBuf::from).unwrap_or(d.sites_file),
            check_interval: env_parse("CHECK_INTERVAL_SECONDS")
                .map(Duration::from_secs)
                .unwrap_or(d.check_interval),
            max_concurrent_sites: env_parse("MAX_CONCURRENT_SCRAPERS").unwrap_or(d.max_concurrent_sites),
            max_concurrent_details: env_parse("MAX_CONCURRENT_DETAILS").unwrap_or(d.max_concurrent_details),
            user_agent: std::env::var("USER_AGENT").unwrap_or(d.user_agent),
            request_timeout: env_parse("REQUEST_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(d.request_timeout),
            detail_page_delay: env_secs_f64("DETAIL_PAGE_DELAY").unwrap_or(d.detail_page_delay),
            notification_delay: env_secs_f64("NOTIFICATION_DELAY").unwrap_or(d.notification_delay),
            max_retries: env_parse("MAX_RETRIES").unwrap_or(d.max_retries),
            exchange_rate_api_url: std::env::var("EXCHANGE_RATE_API_URL").unwrap_or(d.exchange_rate_api_url),
            exchange_rate_cache_duration: env_parse("EXCHANGE_RATE_CACHE_DURATION")
                .map(Duration::from_secs)
                .unwrap_or(d.exchange_rate_cache_duration),
            max_seen_items_per_site: env_parse("MAX_SEEN_ITEMS_PER_SITE").unwrap_or(d.max_seen_items_per_site),
            history_retention_days: env_parse("SESSION_HISTORY_RETENTION_DAYS")
                .unwrap_or(d.history_retention_days),
            max_history_entries: env_parse("MAX_SESSION_HISTORY_ENTRIES").unwrap_or(d.max_history_entries),
            maintenance_every_cycles: env_parse("MAINTENANCE_EVERY_CYCLES")
                .unwrap_or(d.maintenance_every_cycles),
            memory_high_water_mb: env_parse("MEMORY_HIGH_WATER_MB").unwrap_or(d.memory_high_water_mb),
            enable_notifications: env_flag("ENABLE_NOTIFICATIONS").unwrap_or(d.enable_notifications),
            enable_detail_scraping: env_flag("ENABLE_DETAIL_SCRAPING").unwrap_or(d.enable_detail_scraping),
            enable_exchange_rate_conversion: env_flag("ENABLE_EXCHANGE_RATE_CONVERSION")
                .unwrap_or(d.enable_exchange_rate_conversion),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub site: String,
    pub severity: Severity,
    pub message: String,
}

impl ValidationIssue {
    fn error(site: &str, message: impl Into<String>) -> Self {
        Self {
            site: site.to_string(),
            severity: Severity::Error,
            message: message.into(),
        }
    }

    fn warning(site: &str, message: impl Into<String>) -> Self {
        Self {
            site: site.to_string(),
            severity: Severity::Warning,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteRegistry {
    pub sites: Vec<SiteConfig>,
}

impl SiteRegistry {
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).await.map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text, path)
    }

    pub fn from_yaml(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.display().to_string(),
            source,
        })
    }

    pub fn enabled(&self) -> Vec<SiteConfig> {
        self.sites.iter().filter(|s| s.enabled).cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<&SiteConfig> {
        self.sites.iter().find(|s| s.key == key)
    }

    /// Structural problems with the registry. Missing webhooks are warnings;
    /// everything else prevents the site from being crawled.
    pub fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();
        let mut keys = BTreeSet::new();

        for site in &self.sites {
            if site.key.trim().is_empty() {
                issues.push(ValidationIssue::error(&site.name, "site key is empty"));
            } else if !keys.insert(site.key.as_str()) {
                issues.push(ValidationIssue::error(&site.key, "duplicate site key"));
            }
            if !site.url.starts_with("http://") && !site.url.starts_with("https://") {
                issues.push(ValidationIssue::error(
                    &site.key,
                    format!("listing url `{}` is not absolute", site.url),
                ));
            }
            if let Err(err) = validate_site(site) {
                issues.push(ValidationIssue::error(&site.key, err.to_string()));
            }
            if site.enabled && site.webhook_url().is_none() {
                let hint = if site.webhook_env_var.is_empty() {
                    "no webhook_env_var configured".to_string()
                } else {
                    format!("set environment variable {}", site.webhook_env_var)
                };
                issues.push(ValidationIssue::warning(
                    &site.key,
                    format!("no webhook configured; {hint}"),
                ));
            }
        }
        issues
    }
}
