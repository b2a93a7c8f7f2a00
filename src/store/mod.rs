pub mod memory;
pub mod schema;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::core::{Alert, DetectionEvent, ParseEnumError, Rule, RuleType, Severity, TrustScore};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Page size used when a query does not ask for one.
pub const DEFAULT_ALERT_LIMIT: usize = 100;
/// Largest page a single alert query may return.
pub const MAX_ALERT_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("store query failed: {0}")]
    Query(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound("no rows".into()),
            other => StoreError::Query(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ParseEnumError> for StoreError {
    fn from(e: ParseEnumError) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Column an alert listing is sorted by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlertOrder {
    Id,
    #[default]
    CreatedAt,
    Severity,
    RuleType,
    UserId,
    Acknowledged,
}

impl AlertOrder {
    /// Whitelisted SQL column for this ordering.
    pub fn column(&self) -> &'static str {
        match self {
            AlertOrder::Id => "id",
            AlertOrder::CreatedAt => "created_at",
            AlertOrder::Severity => "severity",
            AlertOrder::RuleType => "rule_type",
            AlertOrder::UserId => "user_id",
            AlertOrder::Acknowledged => "acknowledged",
        }
    }
}

impl FromStr for AlertOrder {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "id" => Ok(AlertOrder::Id),
            "created_at" => Ok(AlertOrder::CreatedAt),
            "severity" => Ok(AlertOrder::Severity),
            "rule_type" => Ok(AlertOrder::RuleType),
            "user_id" => Ok(AlertOrder::UserId),
            "acknowledged" => Ok(AlertOrder::Acknowledged),
            _ => Err(ParseEnumError {
                kind: "order column",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrderDirection {
    Asc,
    #[default]
    Desc,
}

impl OrderDirection {
    pub fn keyword(&self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }
}

impl FromStr for OrderDirection {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "asc" => Ok(OrderDirection::Asc),
            "desc" => Ok(OrderDirection::Desc),
            _ => Err(ParseEnumError {
                kind: "order direction",
                value: s.to_string(),
            }),
        }
    }
}

/// Filter, ordering and pagination for alert queries.
///
/// Empty `rule_types`/`severities` match everything. Ordering is total:
/// ties on the chosen column are broken by `id` in the same direction, so
/// consecutive pages never overlap.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertQuery {
    pub rule_types: Vec<RuleType>,
    pub severities: Vec<Severity>,
    pub user_id: Option<i64>,
    pub server_id: Option<String>,
    pub acknowledged: Option<bool>,
    /// Inclusive lower bound on `created_at`.
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`.
    pub end: Option<DateTime<Utc>>,
    pub limit: usize,
    pub offset: usize,
    pub order_by: AlertOrder,
    pub order_direction: OrderDirection,
}

impl Default for AlertQuery {
    fn default() -> Self {
        Self {
            rule_types: Vec::new(),
            severities: Vec::new(),
            user_id: None,
            server_id: None,
            acknowledged: None,
            start: None,
            end: None,
            limit: DEFAULT_ALERT_LIMIT,
            offset: 0,
            order_by: AlertOrder::default(),
            order_direction: OrderDirection::default(),
        }
    }
}

impl AlertQuery {
    pub fn with_rule_type(rule_type: RuleType) -> Self {
        Self {
            rule_types: vec![rule_type],
            ..Default::default()
        }
    }

    pub fn with_severity(severity: Severity) -> Self {
        Self {
            severities: vec![severity],
            ..Default::default()
        }
    }

    /// Check whether an alert passes every active filter.
    pub fn matches(&self, alert: &Alert) -> bool {
        if !self.rule_types.is_empty() && !self.rule_types.contains(&alert.rule_type) {
            return false;
        }
        if !self.severities.is_empty() && !self.severities.contains(&alert.severity) {
            return false;
        }
        if let Some(user_id) = self.user_id {
            if alert.user_id != user_id {
                return false;
            }
        }
        if let Some(ref server_id) = self.server_id {
            if alert.server_id.as_deref() != Some(server_id.as_str()) {
                return false;
            }
        }
        if let Some(ack) = self.acknowledged {
            if alert.acknowledged != ack {
                return false;
            }
        }
        if let Some(start) = self.start {
            if alert.created_at < start {
                return false;
            }
        }
        if let Some(end) = self.end {
            if alert.created_at > end {
                return false;
            }
        }
        true
    }

    /// Ordering of two alerts under this query, including the id tiebreak.
    pub fn compare(&self, a: &Alert, b: &Alert) -> Ordering {
        let primary = match self.order_by {
            AlertOrder::Id => Ordering::Equal,
            AlertOrder::CreatedAt => a.created_at.cmp(&b.created_at),
            AlertOrder::Severity => a.severity.cmp(&b.severity),
            AlertOrder::RuleType => a.rule_type.as_str().cmp(b.rule_type.as_str()),
            AlertOrder::UserId => a.user_id.cmp(&b.user_id),
            AlertOrder::Acknowledged => a.acknowledged.cmp(&b.acknowledged),
        };
        let ord = primary.then(a.id.cmp(&b.id));
        match self.order_direction {
            OrderDirection::Asc => ord,
            OrderDirection::Desc => ord.reverse(),
        }
    }

    /// Page size actually applied: zero means the default, capped at the max.
    pub fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            DEFAULT_ALERT_LIMIT
        } else {
            self.limit.min(MAX_ALERT_LIMIT)
        }
    }
}

/// Persistence for detection alerts.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Persist a new alert and return the id assigned to it.
    async fn save_alert(&self, alert: &Alert) -> StoreResult<i64>;

    async fn get_alert(&self, id: i64) -> StoreResult<Option<Alert>>;

    async fn list_alerts(&self, query: &AlertQuery) -> StoreResult<Vec<Alert>>;

    /// Move an alert to the acknowledged state and return it.
    ///
    /// Acknowledging twice is a successful no-op: the first acknowledger and
    /// timestamp are kept. Unknown ids yield [`StoreError::NotFound`].
    async fn acknowledge_alert(&self, id: i64, acknowledged_by: &str) -> StoreResult<Alert>;

    /// Number of alerts matching the query filters (pagination ignored).
    async fn get_alert_count(&self, query: &AlertQuery) -> StoreResult<usize>;
}

/// Persistence for rule configuration, one row per rule type.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn get_rule(&self, rule_type: RuleType) -> StoreResult<Option<Rule>>;

    /// All rules, in [`RuleType::ALL`] order.
    async fn list_rules(&self) -> StoreResult<Vec<Rule>>;

    /// Insert or replace the configuration for `rule.rule_type`.
    async fn save_rule(&self, rule: &Rule) -> StoreResult<()>;

    async fn set_rule_enabled(&self, rule_type: RuleType, enabled: bool) -> StoreResult<()>;
}

/// A trust penalty to apply atomically to one user.
#[derive(Debug, Clone, PartialEq)]
pub struct Penalty {
    pub user_id: i64,
    pub username: String,
    pub amount: i32,
    /// Scores strictly below this are flagged `restricted`.
    pub restrict_below: i32,
}

/// Persistence for per-user trust scores.
///
/// Implementations perform `apply_penalty` as one atomic read-modify-write,
/// so concurrent penalties for the same user never lose an update.
#[async_trait]
pub trait TrustStore: Send + Sync {
    /// Stored score, or a default of 100 for users never penalised.
    async fn get_trust_score(&self, user_id: i64) -> StoreResult<TrustScore>;

    /// Subtract `penalty.amount` (clamped to 0..=100) and return the new row.
    async fn apply_penalty(&self, penalty: &Penalty) -> StoreResult<TrustScore>;

    /// Raise every score below 100 by `amount`, returning how many rows changed.
    async fn recover_trust_scores(&self, amount: i32, restrict_below: i32) -> StoreResult<usize>;

    /// Users with score strictly below `threshold`, lowest score first.
    async fn list_low_trust_users(&self, threshold: i32) -> StoreResult<Vec<TrustScore>>;
}

/// Historical session context the rules need, provided by the session tracker.
#[async_trait]
pub trait SessionHistory: Send + Sync {
    /// The user's most recent event at or before `until` that carries a
    /// resolvable location, ignoring events of session `exclude_session`.
    async fn last_located_session(
        &self,
        user_id: i64,
        until: DateTime<Utc>,
        exclude_session: &str,
    ) -> StoreResult<Option<DetectionEvent>>;

    /// The user's most recent event at or before `until` from any session
    /// other than `exclude_session`.
    async fn last_session(
        &self,
        user_id: i64,
        until: DateTime<Utc>,
        exclude_session: &str,
    ) -> StoreResult<Option<DetectionEvent>>;

    /// Session keys of the user's currently active streams.
    async fn active_sessions(&self, user_id: i64) -> StoreResult<Vec<String>>;

    /// Distinct device fingerprints the user has used at or after `since`.
    async fn distinct_devices(&self, user_id: i64, since: DateTime<Utc>) -> StoreResult<Vec<String>>;

    /// Latest event of each active session of the user seen at or after
    /// `since` that carries a resolvable location.
    async fn concurrent_located_sessions(
        &self,
        user_id: i64,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<DetectionEvent>>;
}

/// Write side of the session tracker: records events after evaluation so
/// later lookups through [`SessionHistory`] can see them.
#[async_trait]
pub trait SessionRecorder: Send + Sync {
    async fn record_event(&self, event: &DetectionEvent) -> StoreResult<()>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::TimeZone;

    pub fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    pub fn make_alert(rule_type: RuleType, severity: Severity, user_id: i64, created_secs: i64) -> Alert {
        Alert {
            id: 0,
            rule_type,
            user_id,
            username: format!("user{user_id}"),
            server_id: None,
            device_id: None,
            ip_address: None,
            severity,
            title: "test alert".to_string(),
            description: "test".to_string(),
            evidence: serde_json::json!({}),
            created_at: at(created_secs),
            acknowledged: false,
            acknowledged_by: None,
            acknowledged_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn empty_query_matches_everything() {
        let q = AlertQuery::default();
        assert!(q.matches(&make_alert(RuleType::DeviceVelocity, Severity::Info, 1, 0)));
    }

    #[test]
    fn rule_type_filter() {
        let q = AlertQuery::with_rule_type(RuleType::ImpossibleTravel);
        assert!(q.matches(&make_alert(RuleType::ImpossibleTravel, Severity::Critical, 1, 0)));
        assert!(!q.matches(&make_alert(RuleType::ConcurrentStreams, Severity::Critical, 1, 0)));
    }

    #[test]
    fn time_range_is_inclusive() {
        let q = AlertQuery {
            start: Some(at(10)),
            end: Some(at(20)),
            ..Default::default()
        };
        assert!(q.matches(&make_alert(RuleType::DeviceVelocity, Severity::Info, 1, 10)));
        assert!(q.matches(&make_alert(RuleType::DeviceVelocity, Severity::Info, 1, 20)));
        assert!(!q.matches(&make_alert(RuleType::DeviceVelocity, Severity::Info, 1, 21)));
        assert!(!q.matches(&make_alert(RuleType::DeviceVelocity, Severity::Info, 1, 9)));
    }

    #[test]
    fn acknowledged_and_user_filters() {
        let mut alert = make_alert(RuleType::DeviceVelocity, Severity::Info, 7, 0);
        alert.acknowledged = true;
        let q = AlertQuery {
            acknowledged: Some(false),
            ..Default::default()
        };
        assert!(!q.matches(&alert));
        let q = AlertQuery {
            user_id: Some(8),
            ..Default::default()
        };
        assert!(!q.matches(&alert));
    }

    #[test]
    fn compare_breaks_ties_by_id() {
        let mut a = make_alert(RuleType::DeviceVelocity, Severity::Warning, 1, 0);
        let mut b = make_alert(RuleType::DeviceVelocity, Severity::Warning, 1, 0);
        a.id = 1;
        b.id = 2;
        let q = AlertQuery {
            order_by: AlertOrder::Severity,
            order_direction: OrderDirection::Asc,
            ..Default::default()
        };
        assert_eq!(q.compare(&a, &b), Ordering::Less);
        let q = AlertQuery {
            order_direction: OrderDirection::Desc,
            ..q
        };
        assert_eq!(q.compare(&a, &b), Ordering::Greater);
    }

    #[test]
    fn order_parsing() {
        assert_eq!("SEVERITY".parse::<AlertOrder>(), Ok(AlertOrder::Severity));
        assert!("password".parse::<AlertOrder>().is_err());
        assert_eq!("Asc".parse::<OrderDirection>(), Ok(OrderDirection::Asc));
        assert!("sideways".parse::<OrderDirection>().is_err());
    }

    #[test]
    fn effective_limit_defaults_and_caps() {
        let mut q = AlertQuery {
            limit: 0,
            ..Default::default()
        };
        assert_eq!(q.effective_limit(), DEFAULT_ALERT_LIMIT);
        q.limit = 5_000;
        assert_eq!(q.effective_limit(), MAX_ALERT_LIMIT);
        q.limit = 10;
        assert_eq!(q.effective_limit(), 10);
    }
}
