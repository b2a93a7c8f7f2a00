pub mod agent;
pub mod jobs;
pub mod metrics;
pub mod rules;
pub mod score;
pub mod stats;
pub mod travel;

use chrono::Utc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::TrustConfig;
use crate::core::{Alert, DetectionEvent, Rule, RuleType, Severity, TrustScore};
use crate::notifications::Notifier;
use crate::store::{AlertStore, RuleStore, SessionHistory, StoreError, StoreResult, TrustStore};
use metrics::{EngineMetrics, MetricsRecorder};
use rules::{RuleConfig, Violation};
use score::TrustScorer;

pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// A side effect of a violation that could not be persisted.
#[derive(Debug, Error)]
pub enum SideEffectFailure {
    #[error("saving {rule_type} alert for user {user_id} failed: {source}")]
    AlertSave {
        rule_type: RuleType,
        user_id: i64,
        source: StoreError,
    },

    #[error("trust penalty ({severity}) for user {user_id} failed: {source}")]
    TrustUpdate {
        severity: Severity,
        user_id: i64,
        source: StoreError,
    },
}

#[derive(Debug, Error)]
pub enum EngineError {
    /// Some alerts or trust updates were not persisted. `alerts` holds every
    /// alert generated for the event; unsaved ones keep id 0.
    #[error("{} persistence failure(s) while handling event", .failures.len())]
    Persistence {
        alerts: Vec<Alert>,
        failures: Vec<SideEffectFailure>,
    },

    #[error("rule store error: {0}")]
    Store(#[from] StoreError),
}

/// Why a single rule was skipped for an event.
#[derive(Debug, Error)]
enum RuleError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A rule loaded from the rule store, with its config already decoded.
#[derive(Debug, Clone)]
struct LoadedRule {
    rule_type: RuleType,
    config: Result<RuleConfig, String>,
}

/// Snapshot of the enabled rules, swapped atomically on refresh.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<LoadedRule>,
}

impl RuleSet {
    fn from_rules(rules: &[Rule]) -> Self {
        Self {
            rules: rules
                .iter()
                .filter(|r| r.enabled)
                .map(|r| LoadedRule {
                    rule_type: r.rule_type,
                    config: RuleConfig::from_rule(r),
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rule_types(&self) -> Vec<RuleType> {
        self.rules.iter().map(|r| r.rule_type).collect()
    }
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub store_timeout: Duration,
    pub trust: TrustConfig,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            store_timeout: DEFAULT_STORE_TIMEOUT,
            trust: TrustConfig::default(),
        }
    }
}

/// Evaluates session events against the enabled rules.
///
/// Stateless per user: all history comes from [`SessionHistory`] and trust
/// updates are atomic in the [`TrustStore`]. Safe to share behind an `Arc`
/// and call from any number of tasks at once.
pub struct Engine {
    alerts: Arc<dyn AlertStore>,
    rule_store: Arc<dyn RuleStore>,
    history: Arc<dyn SessionHistory>,
    scorer: TrustScorer,
    notifiers: Vec<Arc<dyn Notifier>>,
    store_timeout: Duration,
    rule_set: RwLock<Arc<RuleSet>>,
    enabled: AtomicBool,
    metrics: MetricsRecorder,
}

impl Engine {
    pub fn new(
        alerts: Arc<dyn AlertStore>,
        rule_store: Arc<dyn RuleStore>,
        trust: Arc<dyn TrustStore>,
        history: Arc<dyn SessionHistory>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            alerts,
            rule_store,
            history,
            scorer: TrustScorer::new(trust, settings.trust),
            notifiers: Vec::new(),
            store_timeout: settings.store_timeout,
            rule_set: RwLock::new(Arc::new(RuleSet::default())),
            enabled: AtomicBool::new(true),
            metrics: MetricsRecorder::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn scorer(&self) -> &TrustScorer {
        &self.scorer
    }

    /// Master switch. A disabled engine evaluates nothing.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
        info!(enabled, "Detection engine toggled");
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> EngineMetrics {
        self.metrics.snapshot()
    }

    pub fn rules(&self) -> Arc<RuleSet> {
        match self.rule_set.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Reload the enabled rules from the rule store. Returns how many are active.
    pub async fn refresh_rules(&self) -> Result<usize, EngineError> {
        let rules = self.bounded(self.rule_store.list_rules()).await?;
        let set = Arc::new(RuleSet::from_rules(&rules));
        for rule in &set.rules {
            if let Err(ref e) = rule.config {
                warn!(rule = %rule.rule_type, "Rule has invalid config, it will be skipped: {e}");
            }
        }
        let active = set.len();
        match self.rule_set.write() {
            Ok(mut guard) => *guard = set,
            Err(poisoned) => *poisoned.into_inner() = set,
        }
        debug!(active, "Rule cache refreshed");
        Ok(active)
    }

    /// Toggle a rule in the store and refresh the cache.
    pub async fn set_rule_enabled(&self, rule_type: RuleType, enabled: bool) -> Result<(), EngineError> {
        self.bounded(self.rule_store.set_rule_enabled(rule_type, enabled)).await?;
        self.refresh_rules().await?;
        info!(rule = %rule_type, enabled, "Rule toggled");
        Ok(())
    }

    /// Save a rule in the store and refresh the cache.
    pub async fn save_rule(&self, rule: &Rule) -> Result<(), EngineError> {
        self.bounded(self.rule_store.save_rule(rule)).await?;
        self.refresh_rules().await?;
        info!(rule = %rule.rule_type, "Rule updated");
        Ok(())
    }

    /// Run every enabled rule against the event, persist the resulting
    /// alerts and apply trust penalties.
    ///
    /// A rule that fails or times out is skipped. Only persistence failures
    /// are reported, and only after every side effect has been attempted.
    pub async fn evaluate(&self, event: &DetectionEvent) -> Result<Vec<Alert>, EngineError> {
        if !self.is_enabled() || !rules::applies_to(event.state) {
            return Ok(Vec::new());
        }
        let started = Instant::now();
        let rule_set = self.rules();

        let mut violations = Vec::new();
        for rule in &rule_set.rules {
            let checked = Instant::now();
            match self.run_rule(rule, event).await {
                Ok(found) => {
                    self.metrics.record_rule_check(rule.rule_type, checked.elapsed());
                    violations.extend(found);
                }
                Err(RuleError::Store(StoreError::Timeout(after))) => {
                    self.metrics.record_rule_timeout(rule.rule_type);
                    warn!(rule = %rule.rule_type, user_id = event.user_id, "Rule context timed out after {after:?}, skipping");
                }
                Err(e) => {
                    self.metrics.record_rule_error(rule.rule_type);
                    warn!(rule = %rule.rule_type, user_id = event.user_id, "Rule failed, skipping: {e}");
                }
            }
        }

        let mut alerts = Vec::with_capacity(violations.len());
        let mut failures = Vec::new();
        for violation in violations {
            let mut alert = build_alert(event, violation);

            match self.bounded(self.alerts.save_alert(&alert)).await {
                Ok(id) => {
                    alert.id = id;
                    self.metrics.record_alert(alert.rule_type);
                    info!(
                        alert_id = id,
                        rule = %alert.rule_type,
                        user_id = alert.user_id,
                        "{} {}",
                        alert.severity.emoji(),
                        alert.title
                    );
                    self.dispatch_notifications(&alert);
                }
                Err(source) => {
                    self.metrics.record_persistence_failure();
                    warn!(rule = %alert.rule_type, user_id = alert.user_id, "Failed to save alert: {source}");
                    failures.push(SideEffectFailure::AlertSave {
                        rule_type: alert.rule_type,
                        user_id: alert.user_id,
                        source,
                    });
                }
            }

            // Attempted regardless of whether the alert was saved.
            if let Err(source) = self.penalize(&alert).await {
                self.metrics.record_persistence_failure();
                warn!(user_id = alert.user_id, "Failed to apply trust penalty: {source}");
                failures.push(SideEffectFailure::TrustUpdate {
                    severity: alert.severity,
                    user_id: alert.user_id,
                    source,
                });
            }
            alerts.push(alert);
        }

        self.metrics.record_evaluation(started.elapsed(), Utc::now());

        if failures.is_empty() {
            Ok(alerts)
        } else {
            Err(EngineError::Persistence { alerts, failures })
        }
    }

    async fn penalize(&self, alert: &Alert) -> StoreResult<TrustScore> {
        let score = self
            .bounded(self.scorer.penalize(alert.user_id, &alert.username, alert.severity))
            .await?;
        if score.restricted {
            warn!(user_id = score.user_id, score = score.score, "User trust score below restriction threshold");
        }
        Ok(score)
    }

    /// Fetch the rule's context and run its check.
    async fn run_rule(&self, rule: &LoadedRule, event: &DetectionEvent) -> Result<Option<Violation>, RuleError> {
        let config = rule.config.as_ref().map_err(|e| RuleError::InvalidConfig(e.clone()))?;
        let user = event.user_id;
        let out_of_range = |minutes: i64| RuleError::InvalidConfig(format!("window of {minutes} minutes is out of range"));

        let violation = match config {
            RuleConfig::ImpossibleTravel(c) => {
                if event.known_location().is_none() {
                    return Ok(None);
                }
                let prior = self
                    .bounded(self.history.last_located_session(user, event.timestamp, &event.session_key))
                    .await?;
                travel::check_impossible_travel(event, c, prior.as_ref())
            }
            RuleConfig::ConcurrentStreams(c) => {
                let active = self.bounded(self.history.active_sessions(user)).await?;
                rules::check_concurrent_streams(event, c, &active)
            }
            RuleConfig::DeviceVelocity(c) => {
                let since = rules::device_window_start(event, c).ok_or_else(|| out_of_range(c.window_minutes))?;
                let devices = self.bounded(self.history.distinct_devices(user, since)).await?;
                rules::check_device_velocity(event, c, &devices)
            }
            RuleConfig::SimultaneousLocations(c) => {
                if event.known_location().is_none() {
                    return Ok(None);
                }
                let since =
                    travel::simultaneous_window_start(event, c).ok_or_else(|| out_of_range(c.window_minutes))?;
                let others = self
                    .bounded(self.history.concurrent_located_sessions(user, since))
                    .await?;
                travel::check_simultaneous_locations(event, c, &others)
            }
            RuleConfig::GeoRestriction(c) => rules::check_geo_restriction(event, c),
            RuleConfig::UserAgentAnomaly(c) => {
                if !agent::has_agent(event) {
                    return Ok(None);
                }
                if let Some(v) = agent::check_suspicious_agent(event, c) {
                    return Ok(Some(v));
                }
                let prior = self
                    .bounded(self.history.last_session(user, event.timestamp, &event.session_key))
                    .await?;
                agent::check_user_agent_anomaly(event, c, prior.as_ref())
            }
        };
        Ok(violation)
    }

    fn dispatch_notifications(&self, alert: &Alert) {
        for notifier in &self.notifiers {
            let notifier = notifier.clone();
            let alert = alert.clone();
            tokio::spawn(async move {
                match notifier.notify(&alert).await {
                    Ok(true) => debug!(notifier = notifier.name(), alert_id = alert.id, "Notification sent"),
                    Ok(false) => {}
                    Err(e) => warn!(notifier = notifier.name(), alert_id = alert.id, "Notification failed: {e}"),
                }
            });
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.store_timeout)),
        }
    }
}

fn build_alert(event: &DetectionEvent, violation: Violation) -> Alert {
    Alert {
        id: 0,
        rule_type: violation.rule_type,
        user_id: event.user_id,
        username: event.username.clone(),
        server_id: event.server_id.clone(),
        device_id: event.device_id.clone(),
        ip_address: event.ip_address.clone(),
        severity: violation.severity,
        title: violation.title,
        description: violation.description,
        evidence: violation.evidence,
        created_at: Utc::now(),
        acknowledged: false,
        acknowledged_by: None,
        acknowledged_at: None,
    }
}
