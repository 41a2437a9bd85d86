//! Cycle orchestration: crawl every enabled site, notify, persist.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wm_core::{CycleSession, SeenMap, SeenSet, SiteConfig, SiteStats};
use wm_storage::seen_store::trim_in_place;
use wm_storage::{HistoryStore, SeenStore, StoreError};

use crate::config::MonitorConfig;
use crate::crawl::CrawlSession;
use crate::memory::{MemoryProbe, ProcMemoryProbe};
use crate::notify::{notify_all, Notifier};

/// Pause after a cycle that failed to persist its history entry.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Running,
    Aggregating,
    Persisting,
    ShuttingDown,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MonitorState::Idle => "idle",
            MonitorState::Running => "running",
            MonitorState::Aggregating => "aggregating",
            MonitorState::Persisting => "persisting",
            MonitorState::ShuttingDown => "shutting_down",
        };
        f.write_str(name)
    }
}

pub struct Monitor {
    config: MonitorConfig,
    sites: Vec<SiteConfig>,
    crawler: CrawlSession,
    notifier: Option<Arc<dyn Notifier>>,
    seen_store: SeenStore,
    history: HistoryStore,
    memory: Arc<dyn MemoryProbe>,
    seen: SeenMap,
    state: MonitorState,
    cycles: u64,
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        sites: Vec<SiteConfig>,
        crawler: CrawlSession,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        let seen_store = SeenStore::new(&config.seen_file, config.max_seen_items_per_site);
        let history = HistoryStore::new(
            &config.history_file,
            config.history_retention_days,
            config.max_history_entries,
        );
        Self {
            config,
            sites,
            crawler,
            notifier,
            seen_store,
            history,
            memory: Arc::new(ProcMemoryProbe),
            seen: SeenMap::new(),
            state: MonitorState::Idle,
            cycles: 0,
        }
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.memory = probe;
        self
    }

    /// Load the persisted seen-sets. A missing or corrupt file starts empty.
    pub async fn load_state(&mut self) {
        self.seen = self.seen_store.load().await;
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn seen(&self) -> &SeenMap {
        &self.seen
    }

    pub fn sites(&self) -> &[SiteConfig] {
        &self.sites
    }

    pub fn history(&self) -> &HistoryStore {
        &self.history
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles
    }

    fn set_state(&mut self, state: MonitorState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "monitor state");
            self.state = state;
        }
    }

    /// One full cycle. A site's failure is recorded in its stats and never
    /// aborts the others; the only error is failing to append the session
    /// to the history file.
    pub async fn run_cycle(&mut self) -> Result<CycleSession, StoreError> {
        self.set_state(MonitorState::Running);
        let mut session = CycleSession::start();
        let memory_start = self.memory.rss_mb();
        info!(session_id = %session.session_id, sites = self.sites.len(), "cycle started");

        let notifier = if self.config.enable_notifications {
            self.notifier.clone()
        } else {
            info!("notifications disabled");
            None
        };
        let crawler = self.crawler.clone();
        let delay = self.config.notification_delay;
        let cap = self.seen_store.max_items_per_site();
        let jobs: Vec<(SiteConfig, SeenSet)> = self
            .sites
            .iter()
            .map(|site| (site.clone(), self.seen.get(&site.key).cloned().unwrap_or_default()))
            .collect();

        let mut results = futures::stream::iter(jobs)
            .map(|(site, mut seen)| {
                let crawler = crawler.clone();
                let notifier = notifier.clone();
                async move {
                    let outcome = crawler.crawl(&site, &mut seen).await;
                    let sent = match (&outcome, &notifier) {
                        (Ok(report), Some(notifier)) => {
                            notify_all(notifier.as_ref(), &report.new_listings, &site.style(), delay).await
                        }
                        _ => 0,
                    };
                    (site, outcome, sent)
                }
            })
            .buffer_unordered(self.config.max_concurrent_sites.max(1));

        while let Some((site, outcome, sent)) = results.next().await {
            let stats = match outcome {
                Ok(report) => {
                    let set = self.seen.entry(site.key.clone()).or_default();
                    set.extend(report.added);
                    set.trim_to(cap);
                    SiteStats {
                        total_found: report.found,
                        new_found: report.new_listings.len(),
                        notifications_sent: sent,
                        errors: 0,
                    }
                }
                Err(err) => {
                    error!(site = %site.key, error = %err, "site crawl failed");
                    SiteStats {
                        errors: 1,
                        ..SiteStats::default()
                    }
                }
            };
            session.add_site_result(&site.key, stats);

            if let Err(err) = self.seen_store.save(&self.seen).await {
                error!(site = %site.key, error = %err, "failed to save seen listings");
            }
        }

        self.set_state(MonitorState::Aggregating);
        session.record_memory(memory_start, self.memory.rss_mb());
        session.finalize();
        info!(
            session_id = %session.session_id,
            sites = session.sites_scraped,
            found = session.total_watches_found,
            new = session.total_new_watches,
            notifications = session.notifications_sent,
            errors = session.errors_encountered,
            duration_secs = session.duration_seconds.unwrap_or_default(),
            "cycle finished"
        );

        self.set_state(MonitorState::Persisting);
        let appended = self.history.append(&session).await;
        self.cycles += 1;
        if self.maintenance_due(session.memory_usage_end_mb) {
            self.run_maintenance().await;
        }
        self.set_state(MonitorState::Idle);

        appended.map(|()| session)
    }

    fn maintenance_due(&self, rss_mb: Option<f64>) -> bool {
        let every = self.config.maintenance_every_cycles;
        let scheduled = every > 0 && self.cycles % every == 0;
        let pressure = rss_mb.is_some_and(|mb| mb > self.config.memory_high_water_mb as f64);
        if pressure {
            warn!(rss_mb, high_water_mb = self.config.memory_high_water_mb, "memory above high-water mark");
        }
        scheduled || pressure
    }

    /// Halve the seen-sets and history, release spare capacity, persist.
    pub async fn run_maintenance(&mut self) {
        let seen_cap = (self.seen_store.max_items_per_site() / 2).max(1);
        let evicted = trim_in_place(&mut self.seen, seen_cap);
        for set in self.seen.values_mut() {
            set.shrink_to_fit();
        }
        if let Err(err) = self.seen_store.save(&self.seen).await {
            error!(error = %err, "failed to save seen listings during maintenance");
        }

        let history_cap = (self.history.max_entries() / 2).max(1);
        let dropped = match self.history.compact(history_cap).await {
            Ok(dropped) => dropped,
            Err(err) => {
                error!(error = %err, "failed to compact session history");
                0
            }
        };
        info!(evicted, dropped, cycles = self.cycles, "maintenance complete");
    }

    /// Run cycles until `shutdown` is cancelled. A cycle in progress always
    /// completes; cancellation only cuts the wait between cycles. A failed
    /// final save is logged, not returned.
    pub async fn run_continuous(&mut self, shutdown: CancellationToken) {
        info!(
            sites = self.sites.len(),
            interval_secs = self.config.check_interval.as_secs(),
            "continuous monitoring started"
        );
        while !shutdown.is_cancelled() {
            let wait = match self.run_cycle().await {
                Ok(_) => self.config.check_interval,
                Err(err) => {
                    error!(error = %err, backoff_secs = ERROR_BACKOFF.as_secs(), "cycle failed");
                    ERROR_BACKOFF
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
        }

        self.set_state(MonitorState::ShuttingDown);
        if let Err(err) = self.seen_store.save(&self.seen).await {
            error!(error = %err, "failed to save seen listings on shutdown");
        }
        info!(cycles = self.cycles, "monitor stopped");
    }
}
