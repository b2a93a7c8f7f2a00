use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, RwLock};

use super::{
    AlertQuery, AlertStore, Penalty, RuleStore, SessionHistory, SessionRecorder, StoreError, StoreResult,
    TrustStore,
};
use crate::core::{Alert, DetectionEvent, Rule, RuleType, TrustScore, clamp_score};
use crate::detection::rules::default_rules;

/// Events kept for history lookups before the oldest are dropped.
const MAX_HISTORY_EVENTS: usize = 50_000;

fn lock<T>(m: &Mutex<T>) -> StoreResult<MutexGuard<'_, T>> {
    m.lock().map_err(|_| StoreError::Query("memory store lock poisoned".into()))
}

/// In-process implementation of every store trait plus [`SessionHistory`].
///
/// Each collection sits behind its own lock; trust penalties run entirely
/// under the trust-map lock, which makes them atomic per user.
#[derive(Default)]
pub struct MemoryStore {
    alerts: Mutex<Vec<Alert>>,
    next_alert_id: Mutex<i64>,
    rules: RwLock<BTreeMap<RuleType, Rule>>,
    trust: Mutex<HashMap<i64, TrustScore>>,
    events: Mutex<VecDeque<DetectionEvent>>,
    sessions: Mutex<HashMap<String, DetectionEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store seeded with the default configuration for every rule type.
    pub fn with_default_rules() -> Self {
        let store = Self::new();
        if let Ok(mut rules) = store.rules.write() {
            for rule in default_rules() {
                rules.insert(rule.rule_type, rule);
            }
        }
        store
    }

    /// Record a session event so later lookups can see it.
    pub fn record_event(&self, event: &DetectionEvent) -> StoreResult<()> {
        {
            let mut events = lock(&self.events)?;
            events.push_back(event.clone());
            while events.len() > MAX_HISTORY_EVENTS {
                events.pop_front();
            }
        }
        let mut sessions = lock(&self.sessions)?;
        if event.state.is_active() {
            sessions.insert(event.session_key.clone(), event.clone());
        } else {
            sessions.remove(&event.session_key);
        }
        Ok(())
    }

    /// Latest matching event of the user at or before `until`; on equal
    /// timestamps the one recorded last wins.
    fn latest_event<F>(
        &self,
        user_id: i64,
        until: DateTime<Utc>,
        exclude_session: &str,
        keep: F,
    ) -> StoreResult<Option<DetectionEvent>>
    where
        F: Fn(&DetectionEvent) -> bool,
    {
        Ok(lock(&self.events)?
            .iter()
            .filter(|e| e.user_id == user_id && e.timestamp <= until && e.session_key != exclude_session)
            .filter(|e| keep(*e))
            .max_by_key(|e| e.timestamp)
            .cloned())
    }

    /// Insert a trust row directly, bypassing penalties.
    pub fn put_trust_score(&self, score: TrustScore) -> StoreResult<()> {
        lock(&self.trust)?.insert(score.user_id, score);
        Ok(())
    }
}

#[async_trait]
impl AlertStore for MemoryStore {
    async fn save_alert(&self, alert: &Alert) -> StoreResult<i64> {
        let id = {
            let mut next = lock(&self.next_alert_id)?;
            *next += 1;
            *next
        };
        let mut stored = alert.clone();
        stored.id = id;
        lock(&self.alerts)?.push(stored);
        Ok(id)
    }

    async fn get_alert(&self, id: i64) -> StoreResult<Option<Alert>> {
        Ok(lock(&self.alerts)?.iter().find(|a| a.id == id).cloned())
    }

    async fn list_alerts(&self, query: &AlertQuery) -> StoreResult<Vec<Alert>> {
        let mut matched: Vec<Alert> = lock(&self.alerts)?
            .iter()
            .filter(|a| query.matches(a))
            .cloned()
            .collect();
        matched.sort_by(|a, b| query.compare(a, b));
        Ok(matched
            .into_iter()
            .skip(query.offset)
            .take(query.effective_limit())
            .collect())
    }

    async fn acknowledge_alert(&self, id: i64, acknowledged_by: &str) -> StoreResult<Alert> {
        let mut alerts = lock(&self.alerts)?;
        let alert = alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("alert {id}")))?;
        if !alert.acknowledged {
            alert.acknowledged = true;
            alert.acknowledged_by = Some(acknowledged_by.to_string());
            alert.acknowledged_at = Some(Utc::now());
        }
        Ok(alert.clone())
    }

    async fn get_alert_count(&self, query: &AlertQuery) -> StoreResult<usize> {
        Ok(lock(&self.alerts)?.iter().filter(|a| query.matches(a)).count())
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn get_rule(&self, rule_type: RuleType) -> StoreResult<Option<Rule>> {
        let rules = self
            .rules
            .read()
            .map_err(|_| StoreError::Query("rule lock poisoned".into()))?;
        Ok(rules.get(&rule_type).cloned())
    }

    async fn list_rules(&self) -> StoreResult<Vec<Rule>> {
        let rules = self
            .rules
            .read()
            .map_err(|_| StoreError::Query("rule lock poisoned".into()))?;
        Ok(rules.values().cloned().collect())
    }

    async fn save_rule(&self, rule: &Rule) -> StoreResult<()> {
        let mut rules = self
            .rules
            .write()
            .map_err(|_| StoreError::Query("rule lock poisoned".into()))?;
        let mut stored = rule.clone();
        if let Some(existing) = rules.get(&rule.rule_type) {
            stored.created_at = existing.created_at;
        }
        stored.updated_at = Utc::now();
        rules.insert(rule.rule_type, stored);
        Ok(())
    }

    async fn set_rule_enabled(&self, rule_type: RuleType, enabled: bool) -> StoreResult<()> {
        let mut rules = self
            .rules
            .write()
            .map_err(|_| StoreError::Query("rule lock poisoned".into()))?;
        let rule = rules
            .get_mut(&rule_type)
            .ok_or_else(|| StoreError::NotFound(format!("rule {rule_type}")))?;
        rule.enabled = enabled;
        rule.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl TrustStore for MemoryStore {
    async fn get_trust_score(&self, user_id: i64) -> StoreResult<TrustScore> {
        Ok(lock(&self.trust)?
            .get(&user_id)
            .cloned()
            .unwrap_or_else(|| TrustScore::new_default(user_id)))
    }

    async fn apply_penalty(&self, penalty: &Penalty) -> StoreResult<TrustScore> {
        let mut trust = lock(&self.trust)?;
        let now = Utc::now();
        let entry = trust
            .entry(penalty.user_id)
            .or_insert_with(|| TrustScore::new_default(penalty.user_id));
        entry.score = clamp_score(entry.score as i64 - penalty.amount as i64);
        entry.violations_count += 1;
        entry.last_violation_at = Some(now);
        entry.restricted = entry.score < penalty.restrict_below;
        entry.updated_at = now;
        if !penalty.username.is_empty() {
            entry.username = penalty.username.clone();
        }
        Ok(entry.clone())
    }

    async fn recover_trust_scores(&self, amount: i32, restrict_below: i32) -> StoreResult<usize> {
        let mut trust = lock(&self.trust)?;
        let now = Utc::now();
        let mut changed = 0;
        for entry in trust.values_mut().filter(|t| t.score < 100) {
            entry.score = clamp_score(entry.score as i64 + amount as i64);
            entry.restricted = entry.score < restrict_below;
            entry.updated_at = now;
            changed += 1;
        }
        Ok(changed)
    }

    async fn list_low_trust_users(&self, threshold: i32) -> StoreResult<Vec<TrustScore>> {
        let mut low: Vec<TrustScore> = lock(&self.trust)?
            .values()
            .filter(|t| t.score < threshold)
            .cloned()
            .collect();
        low.sort_by(|a, b| a.score.cmp(&b.score).then(a.user_id.cmp(&b.user_id)));
        Ok(low)
    }
}

#[async_trait]
impl SessionHistory for MemoryStore {
    async fn last_located_session(
        &self,
        user_id: i64,
        until: DateTime<Utc>,
        exclude_session: &str,
    ) -> StoreResult<Option<DetectionEvent>> {
        self.latest_event(user_id, until, exclude_session, |e| e.known_location().is_some())
    }

    async fn last_session(
        &self,
        user_id: i64,
        until: DateTime<Utc>,
        exclude_session: &str,
    ) -> StoreResult<Option<DetectionEvent>> {
        self.latest_event(user_id, until, exclude_session, |_| true)
    }

    async fn active_sessions(&self, user_id: i64) -> StoreResult<Vec<String>> {
        let mut keys: Vec<String> = lock(&self.sessions)?
            .values()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.session_key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn distinct_devices(&self, user_id: i64, since: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let devices: BTreeSet<String> = lock(&self.events)?
            .iter()
            .filter(|e| e.user_id == user_id && e.timestamp >= since)
            .filter_map(|e| e.device_id.clone())
            .collect();
        Ok(devices.into_iter().collect())
    }

    async fn concurrent_located_sessions(
        &self,
        user_id: i64,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<DetectionEvent>> {
        let mut located: Vec<DetectionEvent> = lock(&self.sessions)?
            .values()
            .filter(|e| e.user_id == user_id && e.timestamp >= since && e.known_location().is_some())
            .cloned()
            .collect();
        located.sort_by(|a, b| a.session_key.cmp(&b.session_key));
        Ok(located)
    }
}

#[async_trait]
impl SessionRecorder for MemoryStore {
    async fn record_event(&self, event: &DetectionEvent) -> StoreResult<()> {
        MemoryStore::record_event(self, event)
    }
}
