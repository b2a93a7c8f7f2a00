//! Transport-agnostic command/query surface for dashboards and admin tools.
//!
//! Parameters arrive as raw strings, the way an HTTP layer would hand them
//! over, and are validated here. Reads go straight to the stores; only
//! metrics and rule changes touch the engine.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::core::{Alert, Rule, RuleType, Severity, TrustScore};
use crate::detection::metrics::EngineMetrics;
use crate::detection::rules::RuleConfig;
use crate::detection::stats::{AlertStats, collect_alert_stats};
use crate::detection::{DEFAULT_STORE_TIMEOUT, Engine, EngineError};
use crate::store::{
    AlertOrder, AlertQuery, AlertStore, MAX_ALERT_LIMIT, OrderDirection, RuleStore, StoreError, TrustStore,
};

pub const DEFAULT_TRUST_THRESHOLD: i32 = 50;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("detection engine unavailable")]
    EngineUnavailable,
}

impl ApiError {
    pub fn status_code(&self) -> u16 {
        match self {
            ApiError::Validation(_) => 400,
            ApiError::NotFound(_) => 404,
            ApiError::Store(_) => 500,
            ApiError::EngineUnavailable => 503,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => ApiError::NotFound(what),
            other => {
                tracing::error!("Store failure in API call: {other}");
                ApiError::Store(other.to_string())
            }
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Store(inner) => inner.into(),
            other => ApiError::Store(other.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// One page of alerts plus the total matching the filters.
#[derive(Debug, Clone, Serialize)]
pub struct AlertPage {
    pub alerts: Vec<Alert>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> ApiResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ApiError::Validation(format!("{name} must be a number, got {value:?}")))
}

fn parse_bool(name: &str, value: &str) -> ApiResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ApiError::Validation(format!("{name} must be true or false, got {value:?}"))),
    }
}

fn parse_time(name: &str, value: &str) -> ApiResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| ApiError::Validation(format!("{name} must be an RFC 3339 timestamp: {e}")))
}

/// Parse a comma separated list of enum names.
fn parse_list<T>(value: &str) -> ApiResult<Vec<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.parse::<T>().map_err(|e| ApiError::Validation(e.to_string())))
        .collect()
}

/// Build an alert query from raw key/value pairs. Unknown keys are ignored.
pub fn parse_alert_query<K, V>(params: &[(K, V)]) -> ApiResult<AlertQuery>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut query = AlertQuery::default();
    for (key, value) in params {
        let (key, value) = (key.as_ref(), value.as_ref());
        match key {
            "limit" => {
                let limit: usize = parse_number(key, value)?;
                if limit == 0 || limit > MAX_ALERT_LIMIT {
                    return Err(ApiError::Validation(format!(
                        "limit must be between 1 and {MAX_ALERT_LIMIT}, got {limit}"
                    )));
                }
                query.limit = limit;
            }
            "offset" => {
                let offset: usize = parse_number(key, value)?;
                if i64::try_from(offset).is_err() {
                    return Err(ApiError::Validation(format!("offset out of range: {offset}")));
                }
                query.offset = offset;
            }
            "user_id" => query.user_id = Some(parse_number(key, value)?),
            "server_id" => query.server_id = Some(value.trim().to_string()),
            "severity" => query.severities.extend(parse_list::<Severity>(value)?),
            "rule_type" => query.rule_types.extend(parse_list::<RuleType>(value)?),
            "acknowledged" => query.acknowledged = Some(parse_bool(key, value)?),
            "start" | "start_date" => query.start = Some(parse_time(key, value)?),
            "end" | "end_date" => query.end = Some(parse_time(key, value)?),
            "order_by" => {
                query.order_by =
                    AlertOrder::from_str(value).map_err(|e| ApiError::Validation(e.to_string()))?
            }
            "order_direction" | "order" => {
                query.order_direction =
                    OrderDirection::from_str(value).map_err(|e| ApiError::Validation(e.to_string()))?
            }
            _ => {}
        }
    }
    if let (Some(start), Some(end)) = (query.start, query.end) {
        if start > end {
            return Err(ApiError::Validation("start must not be after end".into()));
        }
    }
    Ok(query)
}

/// Parse the low-trust threshold: absent means the default, otherwise 0..=100.
pub fn parse_threshold(raw: Option<&str>) -> ApiResult<i32> {
    let Some(raw) = raw.filter(|s| !s.trim().is_empty()) else {
        return Ok(DEFAULT_TRUST_THRESHOLD);
    };
    let threshold: i32 = parse_number("threshold", raw)?;
    if !(0..=100).contains(&threshold) {
        return Err(ApiError::Validation(format!(
            "threshold must be between 0 and 100, got {threshold}"
        )));
    }
    Ok(threshold)
}

fn parse_id(raw: &str) -> ApiResult<i64> {
    let id: i64 = parse_number("id", raw)?;
    if id <= 0 {
        return Err(ApiError::Validation(format!("id must be positive, got {id}")));
    }
    Ok(id)
}

fn parse_rule_type(raw: &str) -> ApiResult<RuleType> {
    raw.parse().map_err(|e: crate::core::ParseEnumError| ApiError::Validation(e.to_string()))
}

pub struct DetectionApi {
    alerts: Arc<dyn AlertStore>,
    rules: Arc<dyn RuleStore>,
    trust: Arc<dyn TrustStore>,
    engine: Option<Arc<Engine>>,
    stats_timeout: Duration,
}

impl DetectionApi {
    pub fn new(
        alerts: Arc<dyn AlertStore>,
        rules: Arc<dyn RuleStore>,
        trust: Arc<dyn TrustStore>,
        engine: Option<Arc<Engine>>,
    ) -> Self {
        Self {
            alerts,
            rules,
            trust,
            engine,
            stats_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    fn engine(&self) -> ApiResult<&Arc<Engine>> {
        self.engine.as_ref().ok_or(ApiError::EngineUnavailable)
    }

    pub async fn list_alerts<K, V>(&self, params: &[(K, V)]) -> ApiResult<AlertPage>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let query = parse_alert_query(params)?;
        let alerts = self.alerts.list_alerts(&query).await?;
        let total = self.alerts.get_alert_count(&query).await?;
        Ok(AlertPage {
            alerts,
            total,
            limit: query.effective_limit(),
            offset: query.offset,
        })
    }

    pub async fn get_alert(&self, id: &str) -> ApiResult<Alert> {
        let id = parse_id(id)?;
        self.alerts
            .get_alert(id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("alert {id}")))
    }

    /// Acknowledge an alert. Repeating it is a no-op that returns the
    /// alert as first acknowledged.
    pub async fn acknowledge_alert(&self, id: &str, acknowledged_by: &str) -> ApiResult<Alert> {
        let id = parse_id(id)?;
        let by = acknowledged_by.trim();
        if by.is_empty() {
            return Err(ApiError::Validation("acknowledged_by is required".into()));
        }
        let alert = self.alerts.acknowledge_alert(id, by).await?;
        tracing::info!(alert_id = id, by, "Alert acknowledged");
        Ok(alert)
    }

    pub async fn list_rules(&self) -> ApiResult<Vec<Rule>> {
        Ok(self.rules.list_rules().await?)
    }

    pub async fn get_rule(&self, rule_type: &str) -> ApiResult<Rule> {
        let rule_type = parse_rule_type(rule_type)?;
        self.rules
            .get_rule(rule_type)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("rule {rule_type}")))
    }

    /// Replace a rule's configuration, keeping its enabled flag unless one is given.
    pub async fn update_rule(
        &self,
        rule_type: &str,
        config: serde_json::Value,
        enabled: Option<bool>,
    ) -> ApiResult<Rule> {
        let rule_type = parse_rule_type(rule_type)?;
        let parsed = RuleConfig::parse(rule_type, &config).map_err(ApiError::Validation)?;

        let existing = self.rules.get_rule(rule_type).await?;
        let now = Utc::now();
        let rule = Rule {
            rule_type,
            name: existing
                .as_ref()
                .map(|r| r.name.clone())
                .unwrap_or_else(|| rule_type.display_name().to_string()),
            enabled: enabled.or(existing.as_ref().map(|r| r.enabled)).unwrap_or(true),
            config: parsed.to_value(),
            created_at: existing.as_ref().map(|r| r.created_at).unwrap_or(now),
            updated_at: now,
        };

        match self.engine {
            Some(ref engine) => engine.save_rule(&rule).await?,
            None => self.rules.save_rule(&rule).await?,
        }
        self.get_rule(rule_type.as_str()).await
    }

    pub async fn set_rule_enabled(&self, rule_type: &str, enabled: bool) -> ApiResult<Rule> {
        let rule_type = parse_rule_type(rule_type)?;
        match self.engine {
            Some(ref engine) => engine.set_rule_enabled(rule_type, enabled).await?,
            None => self.rules.set_rule_enabled(rule_type, enabled).await?,
        }
        self.get_rule(rule_type.as_str()).await
    }

    pub async fn get_trust_score(&self, user_id: &str) -> ApiResult<TrustScore> {
        let user_id = parse_id(user_id)?;
        Ok(self.trust.get_trust_score(user_id).await?)
    }

    pub async fn list_low_trust_users(&self, threshold: Option<&str>) -> ApiResult<Vec<TrustScore>> {
        let threshold = parse_threshold(threshold)?;
        Ok(self.trust.list_low_trust_users(threshold).await?)
    }

    pub fn engine_metrics(&self) -> ApiResult<EngineMetrics> {
        Ok(self.engine()?.metrics())
    }

    /// Best-effort alert statistics; never fails, check `degraded`.
    pub async fn alert_stats(&self) -> AlertStats {
        collect_alert_stats(self.alerts.as_ref(), self.stats_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::tests::ready_engine;
    use crate::store::MemoryStore;
    use crate::store::test_support::make_alert;
    use serde_json::json;

    fn api_without_engine(store: Arc<MemoryStore>) -> DetectionApi {
        DetectionApi::new(store.clone(), store.clone(), store, None)
    }

    fn pairs(raw: &[(&'static str, &'static str)]) -> Vec<(&'static str, &'static str)> {
        raw.to_vec()
    }

    #[test]
    fn status_codes() {
        assert_eq!(ApiError::Validation("x".into()).status_code(), 400);
        assert_eq!(ApiError::NotFound("x".into()).status_code(), 404);
        assert_eq!(ApiError::Store("x".into()).status_code(), 500);
        assert_eq!(ApiError::EngineUnavailable.status_code(), 503);
    }

    #[test]
    fn query_parsing() {
        let q = parse_alert_query(&pairs(&[
            ("limit", "25"),
            ("offset", "50"),
            ("rule_type", "impossible_travel,device_velocity"),
            ("severity", "critical"),
            ("acknowledged", "false"),
            ("order_by", "severity"),
            ("order_direction", "asc"),
            ("start", "2026-01-01T00:00:00Z"),
            ("ignored", "whatever"),
        ]))
        .unwrap();
        assert_eq!(q.limit, 25);
        assert_eq!(q.offset, 50);
        assert_eq!(q.rule_types, vec![RuleType::ImpossibleTravel, RuleType::DeviceVelocity]);
        assert_eq!(q.severities, vec![Severity::Critical]);
        assert_eq!(q.acknowledged, Some(false));
        assert_eq!(q.order_by, AlertOrder::Severity);
        assert_eq!(q.order_direction, OrderDirection::Asc);
        assert!(q.start.is_some());
    }

    #[test]
    fn query_validation_errors() {
        for bad in [
            [("limit", "ten")],
            [("limit", "0")],
            [("limit", "5000")],
            [("user_id", "abc")],
            [("severity", "apocalyptic")],
            [("order_by", "password; DROP TABLE")],
            [("acknowledged", "maybe")],
            [("start", "yesterday")],
            [("offset", "-1")],
            [("offset", "18446744073709551615")],
        ] {
            let err = parse_alert_query(&bad).unwrap_err();
            assert_eq!(err.status_code(), 400, "{bad:?}");
        }
        let err = parse_alert_query(&[("start", "2026-02-01T00:00:00Z"), ("end", "2026-01-01T00:00:00Z")])
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn threshold_parsing() {
        assert_eq!(parse_threshold(None).unwrap(), 50);
        assert_eq!(parse_threshold(Some("")).unwrap(), 50);
        assert_eq!(parse_threshold(Some("75")).unwrap(), 75);
        assert_eq!(parse_threshold(Some("0")).unwrap(), 0);
        assert!(matches!(parse_threshold(Some("101")), Err(ApiError::Validation(_))));
        assert!(matches!(parse_threshold(Some("-1")), Err(ApiError::Validation(_))));
        assert!(matches!(parse_threshold(Some("fifty")), Err(ApiError::Validation(_))));
    }

    #[tokio::test]
    async fn metrics_without_engine_is_unavailable() {
        let api = api_without_engine(Arc::new(MemoryStore::new()));
        let err = api.engine_metrics().unwrap_err();
        assert!(matches!(err, ApiError::EngineUnavailable));
        assert_eq!(err.status_code(), 503);
    }

    #[tokio::test]
    async fn metrics_with_engine() {
        let store = Arc::new(MemoryStore::with_default_rules());
        let engine = Arc::new(ready_engine(store.clone()).await);
        let api = DetectionApi::new(store.clone(), store.clone(), store, Some(engine));
        assert_eq!(api.engine_metrics().unwrap().events_evaluated, 0);
    }

    #[tokio::test]
    async fn alert_lookup_and_acknowledge() {
        let store = Arc::new(MemoryStore::new());
        store.save_alert(&make_alert(RuleType::DeviceVelocity, Severity::Warning, 1, 0)).await.unwrap();
        let api = api_without_engine(store);

        assert!(matches!(api.get_alert("abc").await, Err(ApiError::Validation(_))));
        assert!(matches!(api.get_alert("99").await, Err(ApiError::NotFound(_))));
        assert_eq!(api.get_alert("1").await.unwrap().id, 1);

        assert!(matches!(api.acknowledge_alert("1", "  ").await, Err(ApiError::Validation(_))));
        assert!(matches!(api.acknowledge_alert("99", "admin").await, Err(ApiError::NotFound(_))));
        let acked = api.acknowledge_alert("1", "admin").await.unwrap();
        assert!(acked.acknowledged);
        let again = api.acknowledge_alert("1", "other").await.unwrap();
        assert_eq!(again.acknowledged_by.as_deref(), Some("admin"));
    }

    #[tokio::test]
    async fn list_alerts_pages_with_total() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..5 {
            let rule = if i < 3 { RuleType::ImpossibleTravel } else { RuleType::ConcurrentStreams };
            store.save_alert(&make_alert(rule, Severity::Warning, 1, i)).await.unwrap();
        }
        let api = api_without_engine(store);
        let page = api
            .list_alerts(&[("rule_type", "impossible_travel"), ("limit", "2"), ("order", "asc")])
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.alerts.iter().map(|a| a.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(page.limit, 2);
    }

    #[tokio::test]
    async fn huge_rule_window_is_rejected() {
        let store = Arc::new(MemoryStore::with_default_rules());
        let engine = Arc::new(ready_engine(store.clone()).await);
        let api = DetectionApi::new(store.clone(), store.clone(), store.clone(), Some(engine.clone()));

        for rule_type in ["device_velocity", "simultaneous_locations", "user_agent_anomaly"] {
            let err = api
                .update_rule(rule_type, json!({"window_minutes": 1_000_000_000_000i64}), None)
                .await
                .unwrap_err();
            assert_eq!(err.status_code(), 400, "{rule_type}");
        }
        let stored = store.get_rule(RuleType::DeviceVelocity).await.unwrap().unwrap();
        assert_eq!(stored.config["window_minutes"], 60);
    }

    #[tokio::test]
    async fn rule_updates() {
        let store = Arc::new(MemoryStore::with_default_rules());
        let engine = Arc::new(ready_engine(store.clone()).await);
        let api = DetectionApi::new(store.clone(), store.clone(), store, Some(engine.clone()));

        assert!(matches!(api.get_rule("teleport").await, Err(ApiError::Validation(_))));

        let rule = api
            .update_rule("impossible_travel", json!({"max_speed_kmh": 500}), None)
            .await
            .unwrap();
        assert_eq!(rule.config["max_speed_kmh"], 500.0);
        assert_eq!(rule.config["min_distance_km"], 100.0);
        assert!(rule.enabled);

        let err = api
            .update_rule("impossible_travel", json!({"max_speed_kmh": "fast"}), None)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        let disabled = api.set_rule_enabled("concurrent_streams", false).await.unwrap();
        assert!(!disabled.enabled);
        assert!(!engine.rules().rule_types().contains(&RuleType::ConcurrentStreams));
    }

    #[tokio::test]
    async fn set_rule_enabled_unknown_row_is_not_found() {
        let api = api_without_engine(Arc::new(MemoryStore::new()));
        let err = api.set_rule_enabled("geo_restriction", true).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn trust_endpoints() {
        let store = Arc::new(MemoryStore::new());
        for (user, score) in [(1, 30), (2, 45), (3, 60)] {
            let mut row = TrustScore::new_default(user);
            row.score = score;
            store.put_trust_score(row).unwrap();
        }
        let api = api_without_engine(store);
        assert_eq!(api.get_trust_score("404").await.unwrap().score, 100);
        assert!(matches!(api.get_trust_score("x").await, Err(ApiError::Validation(_))));

        let low = api.list_low_trust_users(None).await.unwrap();
        assert_eq!(low.iter().map(|t| t.score).collect::<Vec<_>>(), vec![30, 45]);
        assert_eq!(api.list_low_trust_users(Some("100")).await.unwrap().len(), 3);
        assert_eq!(api.list_low_trust_users(Some("500")).await.unwrap_err().status_code(), 400);
    }

    #[tokio::test]
    async fn stats_through_api() {
        let store = Arc::new(MemoryStore::new());
        store.save_alert(&make_alert(RuleType::GeoRestriction, Severity::Info, 1, 0)).await.unwrap();
        let api = api_without_engine(store);
        let stats = api.alert_stats().await;
        assert!(!stats.degraded);
        assert_eq!(stats.total, Some(1));
        assert_eq!(stats.by_rule_type[&RuleType::GeoRestriction], Some(1));
    }
}
