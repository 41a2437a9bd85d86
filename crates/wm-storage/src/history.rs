//! Bounded history of completed monitoring cycles.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use wm_core::CycleSession;

use crate::{read_state_file, write_json_atomic, StoreError};

pub const DEFAULT_RETENTION_DAYS: u32 = 30;
pub const DEFAULT_MAX_ENTRIES: usize = 1_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteAggregate {
    pub sessions: usize,
    pub total_watches_found: usize,
    pub total_new_watches: usize,
    pub total_errors: usize,
    /// Percentage of this site's sessions without errors.
    pub success_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStatistics {
    pub total_sessions: usize,
    pub total_watches_found: usize,
    pub total_new_watches: usize,
    pub total_notifications: usize,
    pub total_errors: usize,
    /// Percentage (0..=100) of sessions with zero errors.
    pub success_rate: f64,
    /// Mean seconds over sessions that recorded a duration.
    pub average_duration: f64,
    pub period_days: u32,
    pub sites: BTreeMap<String, SiteAggregate>,
}

fn percentage(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

/// Sessions started strictly after `now - days`.
pub fn sessions_within(
    history: &[CycleSession],
    days: u32,
    now: DateTime<Utc>,
) -> Vec<CycleSession> {
    let cutoff = now - Duration::days(i64::from(days));
    history
        .iter()
        .filter(|s| s.started_at > cutoff)
        .cloned()
        .collect()
}

pub fn compute_statistics(
    history: &[CycleSession],
    days: u32,
    now: DateTime<Utc>,
) -> SessionStatistics {
    let recent = sessions_within(history, days, now);
    let mut stats = SessionStatistics {
        period_days: days,
        ..Default::default()
    };
    if recent.is_empty() {
        return stats;
    }

    let mut successful = 0;
    let mut durations = Vec::new();
    let mut site_successes: BTreeMap<String, usize> = BTreeMap::new();

    for session in &recent {
        stats.total_sessions += 1;
        stats.total_watches_found += session.total_watches_found;
        stats.total_new_watches += session.total_new_watches;
        stats.total_notifications += session.notifications_sent;
        stats.total_errors += session.errors_encountered;
        if session.is_successful() {
            successful += 1;
        }
        if let Some(d) = session.duration_seconds.filter(|d| *d > 0.0) {
            durations.push(d);
        }

        for (site, site_stats) in &session.site_stats {
            let agg = stats.sites.entry(site.clone()).or_default();
            agg.sessions += 1;
            agg.total_watches_found += site_stats.total_found;
            agg.total_new_watches += site_stats.new_found;
            agg.total_errors += site_stats.errors;
            if site_stats.errors == 0 {
                *site_successes.entry(site.clone()).or_default() += 1;
            }
        }
    }

    stats.success_rate = percentage(successful, stats.total_sessions);
    if !durations.is_empty() {
        stats.average_duration = durations.iter().sum::<f64>() / durations.len() as f64;
    }
    for (site, agg) in stats.sites.iter_mut() {
        let ok = site_successes.get(site).copied().unwrap_or(0);
        agg.success_rate = percentage(ok, agg.sessions);
    }
    stats
}

#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
    retention_days: u32,
    max_entries: usize,
}

impl HistoryStore {
    pub fn new(path: impl Into<PathBuf>, retention_days: u32, max_entries: usize) -> Self {
        Self {
            path: path.into(),
            retention_days,
            max_entries,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub async fn load_checked(&self) -> Result<Vec<CycleSession>, StoreError> {
        let text = read_state_file(&self.path).await?;
        serde_json::from_str(&text).map_err(|source| StoreError::Malformed {
            path: self.path.display().to_string(),
            source,
        })
    }

    /// Every stored session, oldest first. Unreadable history is treated as
    /// empty.
    pub async fn load_all(&self) -> Vec<CycleSession> {
        match self.load_checked().await {
            Ok(history) => history,
            Err(StoreError::NotFound { .. }) | Err(StoreError::Empty { .. }) => Vec::new(),
            Err(err) => {
                warn!(error = %err, "discarding unreadable session history");
                Vec::new()
            }
        }
    }

    /// Sessions from the last `days` days.
    pub async fn load(&self, days: u32) -> Vec<CycleSession> {
        sessions_within(&self.load_all().await, days, Utc::now())
    }

    /// Apply the retention window (when non-zero) and then the entry cap,
    /// keeping the most recent sessions.
    pub fn trim(&self, history: Vec<CycleSession>, now: DateTime<Utc>) -> Vec<CycleSession> {
        let original = history.len();
        let mut history = if self.retention_days > 0 {
            sessions_within(&history, self.retention_days, now)
        } else {
            history
        };

        if history.len() > self.max_entries {
            let excess = history.len() - self.max_entries;
            history.drain(..excess);
            warn!(max_entries = self.max_entries, "session history exceeded limit");
        }

        if history.len() < original {
            info!(before = original, after = history.len(), "trimmed session history");
        }
        history
    }

    pub async fn append(&self, session: &CycleSession) -> Result<(), StoreError> {
        let mut history = self.load_all().await;
        history.push(session.clone());
        let history = self.trim(history, Utc::now());
        write_json_atomic(&self.path, &history).await?;
        info!(session_id = %session.session_id, "saved session to history");
        Ok(())
    }

    /// Keep at most `max_entries` of the most recent sessions on disk.
    /// Returns how many were dropped.
    pub async fn compact(&self, max_entries: usize) -> Result<usize, StoreError> {
        let mut history = self.load_all().await;
        let excess = history.len().saturating_sub(max_entries);
        if excess == 0 {
            return Ok(0);
        }
        history.drain(..excess);
        history.shrink_to_fit();
        write_json_atomic(&self.path, &history).await?;
        Ok(excess)
    }

    pub async fn statistics(&self, days: u32) -> SessionStatistics {
        compute_statistics(&self.load_all().await, days, Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;
    use wm_core::SiteStats;

    fn session_at(started: DateTime<Utc>, errors: usize, duration: f64) -> CycleSession {
        let mut session = CycleSession::start_at(started);
        session.add_site_result(
            "grimmeissen",
            SiteStats { total_found: 10, new_found: 2, notifications_sent: 2, errors },
        );
        session.finalize_at(started + Duration::milliseconds((duration * 1000.0) as i64));
        session
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 20, 12, 0, 0).single().unwrap()
    }

    #[test]
    fn statistics_with_no_history_are_zero() {
        let stats = compute_statistics(&[], 7, now());
        assert_eq!(stats.total_sessions, 0);
        assert_eq!(stats.total_watches_found, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.average_duration, 0.0);
        assert!(stats.sites.is_empty());
    }

    #[test]
    fn statistics_aggregate_recent_sessions() {
        let history = vec![
            session_at(now() - Duration::days(10), 0, 99.0),
            session_at(now() - Duration::hours(5), 0, 30.0),
            session_at(now() - Duration::hours(1), 1, 50.0),
        ];
        let stats = compute_statistics(&history, 7, now());

        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.total_watches_found, 20);
        assert_eq!(stats.total_new_watches, 4);
        assert_eq!(stats.total_notifications, 4);
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.success_rate, 50.0);
        assert_eq!(stats.average_duration, 40.0);
        assert_eq!(stats.period_days, 7);

        let site = &stats.sites["grimmeissen"];
        assert_eq!(site.sessions, 2);
        assert_eq!(site.success_rate, 50.0);
    }

    #[test]
    fn trim_applies_age_then_count() {
        let store = HistoryStore::new("unused.json", 30, 3);
        let mut history = vec![session_at(now() - Duration::days(45), 0, 1.0)];
        for h in (1..=5).rev() {
            history.push(session_at(now() - Duration::hours(h), 0, 1.0));
        }

        let trimmed = store.trim(history, now());
        assert_eq!(trimmed.len(), 3);
        assert_eq!(trimmed[0].started_at, now() - Duration::hours(3));
        assert_eq!(trimmed[2].started_at, now() - Duration::hours(1));
    }

    #[test]
    fn zero_retention_disables_age_window() {
        let store = HistoryStore::new("unused.json", 0, 10);
        let history = vec![session_at(now() - Duration::days(400), 0, 1.0)];
        assert_eq!(store.trim(history, now()).len(), 1);
    }

    #[tokio::test]
    async fn append_is_bounded_and_compact_halves() {
        let dir = tempdir().expect("tempdir");
        let store = HistoryStore::new(dir.path().join("history.json"), 30, 4);

        for i in 0..6 {
            let started = Utc::now() - Duration::minutes(10 - i);
            store.append(&session_at(started, 0, 2.0)).await.expect("append");
        }
        assert_eq!(store.load_all().await.len(), 4);
        assert_eq!(store.load(1).await.len(), 4);

        assert_eq!(store.compact(2).await.expect("compact"), 2);
        assert_eq!(store.load_all().await.len(), 2);
        assert_eq!(store.statistics(7).await.total_sessions, 2);
    }

    #[tokio::test]
    async fn corrupt_history_reads_as_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("history.json");
        std::fs::write(&path, "[{\"session_id\":").unwrap();
        let store = HistoryStore::new(&path, 30, 10);

        assert!(store.load_all().await.is_empty());
        assert_eq!(store.statistics(7).await, SessionStatistics { period_days: 7, ..Default::default() });
    }
}
