use std::path::Path;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch};
use tracing_subscriber::EnvFilter;

use trustwatch::config::Config;
use trustwatch::core::pipeline::{read_events, run_pipeline};
use trustwatch::detection::jobs::{spawn_rule_refresh, spawn_trust_recovery};
use trustwatch::detection::{Engine, EngineSettings};
use trustwatch::notifications::{DesktopNotifier, WebhookNotifier};
use trustwatch::store::SqliteStore;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(
                "trustwatch=info"
                    .parse()
                    .unwrap_or_else(|_| tracing_subscriber::filter::LevelFilter::INFO.into()),
            ),
        )
        .init();

    tracing::info!("TrustWatch starting...");

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "trustwatch.toml".into());
    let config = Config::load(&config_path);
    tracing::info!("Config: {:?}", config);

    if let Err(e) = run(config).await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let db_path = Path::new(&config.database.path);
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(SqliteStore::open(db_path)?);
    tracing::info!("Detection database opened at {}", config.database.path);

    let settings = EngineSettings {
        store_timeout: config.engine.store_timeout(),
        trust: config.trust.clone(),
    };
    let mut engine = Engine::new(store.clone(), store.clone(), store.clone(), store.clone(), settings);
    if config.notifications.desktop {
        engine = engine.with_notifier(Arc::new(DesktopNotifier::new(&config.notifications)));
    }
    if let Some(webhook) = WebhookNotifier::from_config(&config.notifications) {
        tracing::info!("Webhook notifications enabled");
        engine = engine.with_notifier(Arc::new(webhook));
    }
    let engine = Arc::new(engine);
    let active = engine.refresh_rules().await?;
    tracing::info!("{active} detection rule(s) enabled");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let recovery = spawn_trust_recovery(
        engine.scorer().clone(),
        config.engine.recovery_interval(),
        shutdown_rx.clone(),
    );
    let refresh = spawn_rule_refresh(engine.clone(), config.engine.rule_refresh_interval(), shutdown_rx);

    let cutoff = chrono::Utc::now() - config.engine.history_retention();
    match store.prune_events(cutoff).await {
        Ok(0) => {}
        Ok(n) => tracing::info!("Pruned {n} session events older than {cutoff}"),
        Err(e) => tracing::warn!("Failed to prune session history: {e}"),
    }

    // stdin → pipeline channel
    let (event_tx, event_rx) = mpsc::channel(1024);
    let pipeline = tokio::spawn(run_pipeline(event_rx, engine.clone(), store.clone()));

    let mut reader = tokio::spawn(read_events(BufReader::new(tokio::io::stdin()), event_tx));
    tracing::info!("Reading session events from stdin (newline-delimited JSON)");

    tokio::select! {
        res = &mut reader => {
            match res {
                Ok(Ok(malformed)) if malformed > 0 => tracing::warn!("{malformed} malformed event line(s) skipped"),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::error!("Failed to read events: {e}"),
                Err(e) => tracing::error!("Reader task failed: {e}"),
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
            reader.abort();
        }
    }

    // The pipeline drains whatever is queued once every sender is gone.
    let summary = pipeline.await?;
    tracing::info!(
        "Processed {} events, {} alerts, {} persistence errors",
        summary.events,
        summary.alerts,
        summary.persistence_errors
    );

    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(recovery, refresh);

    let metrics = engine.metrics();
    tracing::info!(
        "Engine: {} events evaluated, avg latency {:.2} ms, {} rule errors, {} rule timeouts",
        metrics.events_evaluated,
        metrics.avg_latency_ms,
        metrics.rule_errors,
        metrics.rule_timeouts
    );
    for (rule, m) in metrics.by_rule.iter().filter(|(_, m)| m.checks + m.errors + m.timeouts > 0) {
        tracing::debug!(
            %rule,
            checks = m.checks,
            errors = m.errors,
            timeouts = m.timeouts,
            "avg {:.3} ms per check",
            m.avg_latency_ms
        );
    }
    Ok(())
}
