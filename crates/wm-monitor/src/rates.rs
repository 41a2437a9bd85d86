//! Exchange rates for the approximate EUR price shown in notifications.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use wm_core::Price;

/// Currency code -> units per one unit of the provider's base currency.
pub type RateTable = BTreeMap<String, f64>;

#[derive(Debug, Error)]
pub enum RateError {
    #[error("rate request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("rate provider returned HTTP {0}")]
    HttpStatus(reqwest::StatusCode),
    #[error("rate table is empty")]
    Empty,
}

#[async_trait]
pub trait RateProvider: Send + Sync {
    async fn fetch_rates(&self) -> Result<RateTable, RateError>;
}

#[derive(Debug, Deserialize)]
struct RatesResponse {
    #[serde(default)]
    rates: RateTable,
}

/// `{"rates": {"EUR": 0.92, ...}}` style endpoints such as exchangerate-api.
#[derive(Debug, Clone)]
pub struct HttpRateProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpRateProvider {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl RateProvider for HttpRateProvider {
    async fn fetch_rates(&self) -> Result<RateTable, RateError> {
        let response = self.client.get(&self.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RateError::HttpStatus(status));
        }
        let body: RatesResponse = response.json().await?;
        if body.rates.is_empty() {
            return Err(RateError::Empty);
        }
        Ok(body.rates)
    }
}

#[derive(Default)]
struct CacheState {
    rates: Option<RateTable>,
    fetched_at: Option<Instant>,
}

/// TTL cache in front of a [`RateProvider`]. A stale entry triggers one
/// refresh; if that fails the last known table is served.
pub struct RateCache {
    provider: Arc<dyn RateProvider>,
    ttl: Duration,
    state: Mutex<CacheState>,
}

impl RateCache {
    pub fn new(provider: Arc<dyn RateProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            ttl,
            state: Mutex::new(CacheState::default()),
        }
    }

    pub async fn rates(&self) -> Option<RateTable> {
        let mut state = self.state.lock().await;
        let fresh = state
            .fetched_at
            .is_some_and(|at| at.elapsed() < self.ttl);
        if fresh {
            return state.rates.clone();
        }

        match self.provider.fetch_rates().await {
            Ok(rates) => {
                debug!(currencies = rates.len(), "exchange rates refreshed");
                state.rates = Some(rates);
                state.fetched_at = Some(Instant::now());
            }
            Err(err) => {
                warn!(error = %err, cached = state.rates.is_some(), "exchange rate refresh failed");
            }
        }
        state.rates.clone()
    }

    /// Forget the cached table; the next lookup hits the provider.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        *state = CacheState::default();
    }

    /// Price converted to EUR, `None` when already EUR or no usable rate.
    pub async fn convert_to_eur(&self, price: &Price) -> Option<Price> {
        if price.currency.eq_ignore_ascii_case("EUR") {
            return None;
        }
        let rates = self.rates().await?;
        convert(&rates, price, "EUR")
    }
}

/// Convert through the table's base currency.
pub fn convert(rates: &RateTable, price: &Price, target: &str) -> Option<Price> {
    let from = rates.get(&price.currency.to_uppercase()).copied()?;
    let to = rates.get(&target.to_uppercase()).copied()?;
    if from <= 0.0 || to <= 0.0 {
        return None;
    }
    let minor = (price.minor_units as f64 / from * to).round();
    minor.is_finite().then(|| Price::new(minor as i64, target.to_uppercase()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProvider {
        calls: AtomicUsize,
        fail_after: usize,
    }

    impl ScriptedProvider {
        fn new(fail_after: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_after,
            }
        }
    }

    #[async_trait]
    impl RateProvider for ScriptedProvider {
        async fn fetch_rates(&self) -> Result<RateTable, RateError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call >= self.fail_after {
                return Err(RateError::Empty);
            }
            Ok(RateTable::from([
                ("USD".to_string(), 1.0),
                ("EUR".to_string(), 0.5 + call as f64 * 0.1),
            ]))
        }
    }

    #[test]
    fn converts_through_base_currency() {
        let rates = RateTable::from([
            ("USD".to_string(), 1.0),
            ("EUR".to_string(), 0.9),
            ("CHF".to_string(), 0.8),
        ]);
        let usd = Price::new(1_000_000, "USD");
        assert_eq!(convert(&rates, &usd, "EUR"), Some(Price::new(900_000, "EUR")));
        let chf = Price::new(800_000, "chf");
        assert_eq!(convert(&rates, &chf, "EUR"), Some(Price::new(900_000, "EUR")));
        assert_eq!(convert(&rates, &Price::new(100, "JPY"), "EUR"), None);
    }

    #[tokio::test]
    async fn fresh_cache_does_not_refetch() {
        let provider = Arc::new(ScriptedProvider::new(usize::MAX));
        let cache = RateCache::new(provider.clone(), Duration::from_secs(3600));

        let first = cache.rates().await.unwrap();
        let second = cache.rates().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_cache_refreshes_and_falls_back_to_last_known() {
        let provider = Arc::new(ScriptedProvider::new(1));
        let cache = RateCache::new(provider.clone(), Duration::ZERO);

        let first = cache.rates().await.unwrap();
        assert_eq!(first["EUR"], 0.5);

        // Expired; the refresh fails so the last table is served.
        let fallback = cache.rates().await.unwrap();
        assert_eq!(fallback, first);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clear_forces_refetch_and_drops_fallback() {
        let provider = Arc::new(ScriptedProvider::new(1));
        let cache = RateCache::new(provider.clone(), Duration::from_secs(3600));

        assert!(cache.rates().await.is_some());
        cache.clear().await;
        assert_eq!(cache.rates().await, None);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn eur_prices_are_not_converted() {
        let cache = RateCache::new(Arc::new(ScriptedProvider::new(usize::MAX)), Duration::from_secs(60));
        assert_eq!(cache.convert_to_eur(&Price::new(100, "EUR")).await, None);
        assert_eq!(
            cache.convert_to_eur(&Price::new(1_000, "USD")).await,
            Some(Price::new(500, "EUR"))
        );
    }
}
