use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use wm_core::CycleSession;
use wm_monitor::{
    build_monitor, discord_notifier, http_fetcher, MonitorConfig, Notifier, Severity, SiteRegistry,
};
use wm_storage::{HistoryStore, SeenStore, SessionStatistics, StoreError};

const DEFAULT_FILTER: &str = "watch_monitor=info,wm_=info";

#[derive(Debug, Parser)]
#[command(name = "watch-monitor")]
#[command(about = "Poll watch retailers and announce new listings on Discord")]
struct Cli {
    /// Log filter, e.g. `debug` or `wm_monitor=debug`. Overrides RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Also write logs to daily-rotated files with this path prefix.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Monitor continuously until interrupted.
    Run,
    /// Run a single cycle and exit.
    Once,
    /// Check the site registry and webhook configuration.
    Validate {
        /// Post a test message to every configured webhook.
        #[arg(long)]
        test_webhooks: bool,
    },
    /// Summarize recorded cycles.
    Stats {
        #[arg(long, default_value_t = 7)]
        days: u32,
        #[arg(long)]
        json: bool,
    },
    /// Forget seen listings for the given sites, or all sites.
    ResetSeen { sites: Vec<String> },
    /// Forget seen listings, then run one cycle so current listings are
    /// announced again.
    TestNotifications { sites: Vec<String> },
    /// Check the registry, the state files, and that a listing page loads.
    HealthCheck,
}

fn init_tracing(log_level: Option<&str>, log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = match log_level {
        Some(level) => EnvFilter::try_new(level).with_context(|| format!("invalid log level `{level}`"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
    };

    let Some(log_file) = log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    };

    let dir = log_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let prefix = log_file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("watch-monitor");
    std::fs::create_dir_all(dir).with_context(|| format!("creating log directory {}", dir.display()))?;

    let appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .build(dir)
        .context("creating log appender")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = match init_tracing(cli.log_level.as_deref(), cli.log_file.as_deref()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("error: {err:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(cli.command.unwrap_or(Commands::Run)).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

/// `Ok(false)` for a clean run that should still exit non-zero.
async fn run(command: Commands) -> Result<bool> {
    let config = MonitorConfig::from_env();

    match command {
        Commands::Run => {
            let mut monitor = build_monitor(config).await?;
            let shutdown = CancellationToken::new();
            let trigger = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("interrupt received; finishing current cycle");
                    trigger.cancel();
                }
            });
            monitor.run_continuous(shutdown).await;
            Ok(true)
        }
        Commands::Once => {
            let mut monitor = build_monitor(config).await?;
            let session = monitor.run_cycle().await.context("recording cycle in session history")?;
            print_cycle(&session);
            Ok(true)
        }
        Commands::Validate { test_webhooks } => validate(&config, test_webhooks).await,
        Commands::Stats { days, json } => {
            let history = HistoryStore::new(
                &config.history_file,
                config.history_retention_days,
                config.max_history_entries,
            );
            let stats = history.statistics(days).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                print_stats(&stats);
            }
            Ok(true)
        }
        Commands::ResetSeen { sites } => {
            let store = SeenStore::new(&config.seen_file, config.max_seen_items_per_site);
            let dropped = store.reset(&sites).await.context("resetting seen listings")?;
            if sites.is_empty() {
                println!("forgot {dropped} seen listings across all sites");
            } else {
                println!("forgot {dropped} seen listings for {}", sites.join(", "));
            }
            Ok(true)
        }
        Commands::TestNotifications { sites } => {
            let store = SeenStore::new(&config.seen_file, config.max_seen_items_per_site);
            let dropped = store.reset(&sites).await.context("resetting seen listings")?;
            info!(dropped, "seen listings cleared for notification test");
            let mut monitor = build_monitor(config).await?;
            let session = monitor.run_cycle().await.context("recording cycle in session history")?;
            print_cycle(&session);
            Ok(session.notifications_sent > 0 || session.total_new_watches == 0)
        }
        Commands::HealthCheck => health_check(&config).await,
    }
}

fn print_cycle(session: &CycleSession) {
    println!(
        "cycle complete: session={} sites={} found={} new={} notifications={} errors={}",
        session.session_id,
        session.sites_scraped,
        session.total_watches_found,
        session.total_new_watches,
        session.notifications_sent,
        session.errors_encountered
    );
}

async fn health_check(config: &MonitorConfig) -> Result<bool> {
    let mut ok = true;

    let registry = match SiteRegistry::load(&config.sites_file).await {
        Ok(registry) => registry,
        Err(err) => {
            println!("ERROR   registry: {err}");
            return Ok(false);
        }
    };
    let errors = registry
        .validate()
        .into_iter()
        .filter(|issue| issue.severity == Severity::Error)
        .count();
    if errors > 0 {
        ok = false;
        println!("ERROR   registry: {errors} site errors; run `validate` for details");
    } else {
        println!("OK      registry: {} sites enabled", registry.enabled().len());
    }

    let seen = SeenStore::new(&config.seen_file, config.max_seen_items_per_site);
    match seen.load_checked().await {
        Ok(map) => println!(
            "OK      seen file: {} listings across {} sites",
            map.values().map(|set| set.len()).sum::<usize>(),
            map.len()
        ),
        Err(StoreError::NotFound { .. }) | Err(StoreError::Empty { .. }) => {
            println!("OK      seen file: not written yet")
        }
        Err(err) => {
            ok = false;
            println!("ERROR   seen file: {err}");
        }
    }

    let history = HistoryStore::new(
        &config.history_file,
        config.history_retention_days,
        config.max_history_entries,
    );
    match history.load_checked().await {
        Ok(sessions) => println!("OK      history file: {} sessions", sessions.len()),
        Err(StoreError::NotFound { .. }) | Err(StoreError::Empty { .. }) => {
            println!("OK      history file: not written yet")
        }
        Err(err) => {
            ok = false;
            println!("ERROR   history file: {err}");
        }
    }

    let enabled = registry.enabled();
    if let Some(site) = enabled.first() {
        let fetcher = http_fetcher(config)?;
        match fetcher.fetch_text(&site.url).await {
            Ok(html) => println!("OK      {}: listing page loaded ({} bytes)", site.key, html.len()),
            Err(err) => {
                ok = false;
                warn!(site = %site.key, error = %err, "listing page unavailable");
                println!("ERROR   {}: {err}", site.key);
            }
        }
    }

    println!("health check {}", if ok { "passed" } else { "failed" });
    Ok(ok)
}

async fn validate(config: &MonitorConfig, test_webhooks: bool) -> Result<bool> {
    let registry = SiteRegistry::load(&config.sites_file).await?;
    let issues = registry.validate();
    let mut ok = true;

    for issue in &issues {
        match issue.severity {
            Severity::Error => {
                ok = false;
                println!("ERROR   {}: {}", issue.site, issue.message);
            }
            Severity::Warning => println!("WARNING {}: {}", issue.site, issue.message),
        }
    }

    if test_webhooks {
        let fetcher = http_fetcher(config)?;
        let notifier = discord_notifier(config, fetcher.client().clone());
        for site in registry.enabled() {
            let Some(url) = site.webhook_url() else { continue };
            if notifier.test_webhook(&url).await {
                println!("OK      {}: webhook delivered test message", site.key);
            } else {
                ok = false;
                warn!(site = %site.key, "webhook test failed");
                println!("ERROR   {}: webhook test failed", site.key);
            }
        }
    }

    let enabled = registry.enabled().len();
    println!(
        "{} sites configured, {enabled} enabled: {}",
        registry.sites.len(),
        if ok { "valid" } else { "invalid" }
    );
    Ok(ok)
}

fn print_stats(stats: &SessionStatistics) {
    println!("Statistics for the last {} days", stats.period_days);
    println!("  sessions:        {}", stats.total_sessions);
    println!("  watches found:   {}", stats.total_watches_found);
    println!("  new watches:     {}", stats.total_new_watches);
    println!("  notifications:   {}", stats.total_notifications);
    println!("  errors:          {}", stats.total_errors);
    println!("  success rate:    {:.1}%", stats.success_rate);
    println!("  avg duration:    {:.1}s", stats.average_duration);
    for (site, agg) in &stats.sites {
        println!(
            "  {site:<20} sessions={} found={} new={} errors={} success={:.1}%",
            agg.sessions, agg.total_watches_found, agg.total_new_watches, agg.total_errors, agg.success_rate
        );
    }
}
