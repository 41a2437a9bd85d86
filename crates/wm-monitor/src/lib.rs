//! Monitoring loop: per-site crawls, notifications, persisted state.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use wm_core::CycleSession;
use wm_storage::{BackoffPolicy, HttpClientConfig, HttpFetcher};

pub mod config;
pub mod crawl;
pub mod memory;
pub mod monitor;
pub mod notify;
pub mod rates;

pub use config::{ConfigError, MonitorConfig, Severity, SiteRegistry, ValidationIssue};
pub use crawl::{CrawlError, CrawlOptions, CrawlReport, CrawlSession};
pub use memory::{MemoryProbe, ProcMemoryProbe};
pub use monitor::{Monitor, MonitorState};
pub use notify::{notify_all, DiscordNotifier, Notifier};
pub use rates::{HttpRateProvider, RateCache, RateProvider};

pub const CRATE_NAME: &str = "wm-monitor";

pub fn http_fetcher(config: &MonitorConfig) -> Result<HttpFetcher> {
    HttpFetcher::new(HttpClientConfig {
        timeout: config.request_timeout,
        user_agent: Some(config.user_agent.clone()),
        backoff: BackoffPolicy {
            max_retries: config.max_retries,
            ..BackoffPolicy::default()
        },
        ..HttpClientConfig::default()
    })
}

/// Discord notifier sharing `client`, with EUR approximations when rate
/// conversion is enabled.
pub fn discord_notifier(config: &MonitorConfig, client: reqwest::Client) -> DiscordNotifier {
    let rates = config.enable_exchange_rate_conversion.then(|| {
        let provider = HttpRateProvider::new(client.clone(), config.exchange_rate_api_url.clone());
        Arc::new(RateCache::new(Arc::new(provider), config.exchange_rate_cache_duration))
    });
    DiscordNotifier::new(client, rates)
}

/// Load the registry, drop sites that fail validation, wire the HTTP
/// services and restore the seen-sets.
pub async fn build_monitor(config: MonitorConfig) -> Result<Monitor> {
    let registry = SiteRegistry::load(&config.sites_file)
        .await
        .with_context(|| format!("loading site registry {}", config.sites_file.display()))?;

    let mut rejected = BTreeSet::new();
    for issue in registry.validate() {
        match issue.severity {
            Severity::Error => {
                error!(site = %issue.site, "{}", issue.message);
                rejected.insert(issue.site);
            }
            Severity::Warning => warn!(site = %issue.site, "{}", issue.message),
        }
    }
    let sites: Vec<_> = registry
        .enabled()
        .into_iter()
        .filter(|site| !rejected.contains(&site.key))
        .collect();
    if sites.is_empty() {
        anyhow::bail!("no enabled sites in {}", config.sites_file.display());
    }

    let fetcher = http_fetcher(&config)?;
    let notifier: Arc<dyn Notifier> = Arc::new(discord_notifier(&config, fetcher.client().clone()));
    let crawler = CrawlSession::new(
        Arc::new(fetcher),
        CrawlOptions {
            enable_detail_scraping: config.enable_detail_scraping,
            max_concurrent_details: config.max_concurrent_details,
            detail_page_delay: config.detail_page_delay,
        },
    );

    info!(
        sites = sites.len(),
        seen_file = %config.seen_file.display(),
        history_file = %config.history_file.display(),
        "monitor configured"
    );
    let mut monitor = Monitor::new(config, sites, crawler, Some(notifier));
    monitor.load_state().await;
    Ok(monitor)
}

pub async fn run_once_from_env() -> Result<CycleSession> {
    let mut monitor = build_monitor(MonitorConfig::from_env()).await?;
    monitor.run_cycle().await.context("recording cycle in session history")
}
