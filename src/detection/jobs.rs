use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::Engine;
use super::score::TrustScorer;

/// Periodically restore trust to users below 100 until `shutdown` flips to true.
///
/// The first tick is skipped so a restart does not grant an immediate bonus.
pub fn spawn_trust_recovery(
    scorer: TrustScorer,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        info!("Trust recovery started, every {interval:?}");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match scorer.recover().await {
                        Ok(0) => debug!("Trust recovery: nothing to recover"),
                        Ok(n) => info!("Trust recovery raised {n} user score(s)"),
                        Err(e) => warn!("Trust recovery failed: {e}"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Trust recovery stopped");
    })
}

/// Periodically reload the engine's rule cache from the rule store.
pub fn spawn_rule_refresh(
    engine: Arc<Engine>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = engine.refresh_rules().await {
                        warn!("Rule refresh failed, keeping previous rules: {e}");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Rule refresh stopped");
    })
}
