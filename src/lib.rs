pub mod clients;
pub mod config;
pub mod db;
pub mod domain;
pub mod entities;
pub mod models;
pub mod parser;
pub mod resilience;
pub mod services;
pub mod state;

use anyhow::Context;
use chrono::{Days, Utc};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

pub use config::Config;
use db::Store;
use domain::{ReleaseId, WorkId};
use services::{NotifyReport, RunReport, SourceOutcome};
use state::SharedState;

pub async fn run() -> anyhow::Result<()> {
    let config = Config::load()?;
    config.validate()?;

    init_tracing(&config)?;
    let prometheus_handle = install_metrics(&config)?;

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    let result = match args[1].as_str() {
        "collect" | "c" => {
            let state = SharedState::build(config).await?;
            let cancel = cancel_on_ctrl_c();
            let report = state.pipeline.run(&cancel).await?;
            print_run_report(&report);
            Ok(())
        }

        "notify" | "n" => {
            let state = SharedState::build(config).await?;
            let cancel = cancel_on_ctrl_c();
            let report = state.scheduler.run_once(Utc::now(), &cancel).await?;
            print_notify_report(&report);
            Ok(())
        }

        "run" | "r" => {
            let state = SharedState::build(config).await?;
            let cancel = cancel_on_ctrl_c();
            let report = state.pipeline.run(&cancel).await?;
            print_run_report(&report);
            if report.cancelled {
                return Ok(());
            }
            let report = state.scheduler.run_once(Utc::now(), &cancel).await?;
            print_notify_report(&report);
            Ok(())
        }

        "archive" => cmd_archive(&config).await,

        "review" => match args.get(2).map(String::as_str) {
            None | Some("list" | "ls") => cmd_review_list(&config).await,
            Some("requeue") => {
                let Some(id) = args.get(3).and_then(|s| s.parse::<i32>().ok()) else {
                    println!("Usage: shinkan review requeue <release_id>");
                    return Ok(());
                };
                cmd_review_requeue(&config, ReleaseId::new(id)).await
            }
            Some(other) => {
                println!("Unknown review subcommand: {other}");
                println!("Use: list, requeue");
                Ok(())
            }
        },

        "works" | "w" => match args.get(2).map(String::as_str) {
            None | Some("list" | "ls") => cmd_works_list(&config).await,
            Some("show") => {
                let Some(id) = args.get(3).and_then(|s| s.parse::<i32>().ok()) else {
                    println!("Usage: shinkan works show <work_id>");
                    return Ok(());
                };
                cmd_works_show(&config, WorkId::new(id)).await
            }
            Some("delete" | "rm") => {
                let Some(id) = args.get(3).and_then(|s| s.parse::<i32>().ok()) else {
                    println!("Usage: shinkan works delete <work_id>");
                    return Ok(());
                };
                cmd_works_delete(&config, WorkId::new(id)).await
            }
            Some(other) => {
                println!("Unknown works subcommand: {other}");
                println!("Use: list, show, delete");
                Ok(())
            }
        },

        "init" | "--init" => {
            if Config::create_default_if_missing()? {
                println!("✓ Config file created. Edit config.toml and run again.");
            } else {
                println!("config.toml already exists.");
            }
            Ok(())
        }

        "help" | "-h" | "--help" => {
            print_help();
            Ok(())
        }

        _ => {
            println!("Unknown command: {}", args[1]);
            println!();
            print_help();
            Ok(())
        }
    };

    if let Some(handle) = prometheus_handle {
        debug!(metrics = %handle.render(), "Metrics at exit");
    }

    result
}

/// Installs the global subscriber. Runs before anything else logs.
fn init_tracing(config: &Config) -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.general.log_level));

    let fmt_layer = tracing_subscriber::fmt::layer();

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    if config.observability.loki_enabled {
        let url = url::Url::parse(&config.observability.loki_url).context("Invalid Loki URL")?;

        let mut builder = tracing_loki::builder();
        for (key, value) in &config.observability.loki_labels {
            builder = builder.label(key.as_str(), value.as_str())?;
        }
        let (layer, task) = builder
            .extra_field("version", env!("CARGO_PKG_VERSION"))?
            .build_url(url)?;

        tokio::spawn(task);

        registry.with(layer).init();
        info!(
            "Loki logging initialized at {}",
            config.observability.loki_url
        );
    } else {
        registry.init();
    }

    Ok(())
}

fn install_metrics(config: &Config) -> anyhow::Result<Option<PrometheusHandle>> {
    if !config.observability.metrics_enabled {
        return Ok(None);
    }

    if let Some(port) = config.observability.metrics_port {
        PrometheusBuilder::new()
            .with_http_listener(([0, 0, 0, 0], port))
            .install()
            .context("Failed to install Prometheus exporter")?;
        info!("Prometheus metrics exporter listening on port {}", port);
        return Ok(None);
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    info!("Prometheus metrics recorder initialized");
    Ok(Some(handle))
}

/// A token that is cancelled on the first Ctrl+C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => {
                warn!("Shutdown signal received, finishing current item");
                token.cancel();
            }
            Err(e) => error!("Error listening for shutdown: {}", e),
        }
    });
    cancel
}

async fn open_store(config: &Config) -> anyhow::Result<Store> {
    Store::with_pool_options(
        &config.general.database_path,
        config.general.max_db_connections,
        config.general.min_db_connections,
        std::time::Duration::from_millis(config.general.busy_timeout_ms),
    )
    .await
}

fn print_help() {
    println!("Shinkan - release announcement aggregator");
    println!("Collects episode and volume announcements and notifies about them once");
    println!();
    println!("USAGE:");
    println!("  shinkan <COMMAND> [OPTIONS]");
    println!();
    println!("COMMANDS:");
    println!("  collect              Fetch all sources and update the catalog");
    println!("  notify               Send due notification batches");
    println!("  run                  collect, then notify");
    println!("  archive              Archive notified releases past retention");
    println!("  review [list]        Show releases that exceeded delivery attempts");
    println!("  review requeue <id>  Put a reviewed release back into the pending set");
    println!("  works [list]         List catalog works");
    println!("  works show <id>      Show a work and its releases");
    println!("  works delete <id>    Soft-delete a work");
    println!("  init                 Create default config file");
    println!("  help                 Show this help message");
    println!();
    println!("CONFIG:");
    println!("  config.toml, ~/.config/shinkan/config.toml or SHINKAN_CONFIG");
}

fn print_run_report(report: &RunReport) {
    println!("Run {}", report.run_id);
    println!("{:-<60}", "");
    for source in &report.sources {
        match &source.outcome {
            SourceOutcome::Succeeded { count } => println!(
                "  ✓ {:<20} {:>5} records  {:>6}ms",
                source.source_id,
                count,
                source.duration.as_millis()
            ),
            SourceOutcome::Failed { error } => {
                println!("  ✗ {:<20} {}", source.source_id, error);
            }
        }
    }
    println!();
    println!("  Records:            {}", report.records);
    println!("  Discarded:          {}", report.discarded);
    println!("  Excluded:           {}", report.excluded);
    println!("  Works created:      {}", report.works_created);
    for (tier, count) in &report.works_matched {
        println!("  Matched ({tier:<10}) {count}");
    }
    println!("  Releases created:   {}", report.releases_created);
    println!("  Releases duplicate: {}", report.releases_duplicate);
    if report.skipped_deleted > 0 {
        println!("  Skipped (deleted):  {}", report.skipped_deleted);
    }
    if report.cancelled {
        println!();
        println!("Run was cancelled; source markers were not advanced.");
    }
}

fn print_notify_report(report: &NotifyReport) {
    println!(
        "Notifications: {} pending, {}/{} batches sent",
        report.pending, report.batches_sent, report.batches_planned
    );
    println!("  Notified:   {}", report.notified);
    println!("  Failed:     {}", report.failed);
    println!("  For review: {}", report.flagged_for_review);
    println!("  Not due:    {}", report.not_due);
    println!("  Deferred:   {}", report.deferred);
    println!("  Sent today: {}", report.sent_earlier);
}

async fn cmd_archive(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let today = Utc::now().date_naive();
    let cutoff = today
        .checked_sub_days(Days::new(u64::from(config.notifications.retention_days)))
        .unwrap_or(today);

    let archived = store.archive_notified(cutoff).await?;
    println!("✓ Archived {archived} notified releases dated before {cutoff}");
    Ok(())
}

async fn cmd_review_list(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let queue = store.review_queue().await?;

    if queue.is_empty() {
        println!("Review queue is empty.");
        return Ok(());
    }

    println!("Releases needing review ({} total)", queue.len());
    println!("{:-<70}", "");
    for release in queue {
        println!("[{}] {}", release.id, release.headline());
        println!(
            "  Attempts: {} | Last error: {}",
            release.attempt_count,
            release.last_error.as_deref().unwrap_or("-")
        );
    }
    println!();
    println!("Requeue with: shinkan review requeue <id>");
    Ok(())
}

async fn cmd_review_requeue(config: &Config, id: ReleaseId) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    if store.requeue_release(id).await? {
        println!("✓ Release {id} is pending again");
    } else {
        println!("Release {id} is not in the review queue.");
    }
    Ok(())
}

async fn cmd_works_list(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let works = store.list_works().await?;

    if works.is_empty() {
        println!("Catalog is empty. Run 'shinkan collect' first.");
        return Ok(());
    }

    println!("Works ({} total)", works.len());
    println!("{:-<70}", "");
    for work in works {
        println!(
            "[{}] {} ({}, {}, {} sources)",
            work.id, work.canonical_title, work.media_kind, work.status, work.provenance_count
        );
    }
    Ok(())
}

async fn cmd_works_show(config: &Config, id: WorkId) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    let Some(work) = store.get_work(id).await? else {
        println!("Work {id} not found.");
        return Ok(());
    };

    println!("{}", work.canonical_title);
    println!("{:-<70}", "");
    println!("  ID:      {}", work.id);
    println!("  Kind:    {}", work.media_kind);
    println!("  Status:  {}", work.status);
    println!("  Sources: {}", work.provenance_count);
    if !work.alternate_titles.is_empty() {
        println!("  Also:    {}", work.alternate_titles.join(" / "));
    }
    for url in &work.external_urls {
        println!("  Link:    {url}");
    }
    if work.is_deleted() {
        println!("  Deleted: {}", work.deleted_at.as_deref().unwrap_or("-"));
    }

    let releases = store.releases_for_work(id).await?;
    if !releases.is_empty() {
        println!();
        println!("Releases:");
        for release in releases {
            let state = if release.notified {
                "✓"
            } else if release.needs_review {
                "!"
            } else {
                "•"
            };
            println!("  {} [{}] {}", state, release.id, release.headline());
        }
    }
    Ok(())
}

async fn cmd_works_delete(config: &Config, id: WorkId) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    if store.soft_delete_work(id).await? {
        println!("✓ Work {id} deleted; later sightings will be ignored");
    } else {
        println!("Work {id} not found or already deleted.");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_metrics_install_is_logged() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let mut config = Config::default();
        config.observability.metrics_enabled = true;
        config.observability.metrics_port = None;

        let handle = tracing::subscriber::with_default(subscriber, || install_metrics(&config))
            .unwrap();
        assert!(handle.is_some());

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Prometheus metrics recorder initialized"));
    }

    #[test]
    fn test_metrics_disabled_installs_nothing() {
        let mut config = Config::default();
        config.observability.metrics_enabled = false;
        assert!(install_metrics(&config).unwrap().is_none());
    }
}
