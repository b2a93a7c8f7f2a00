use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use std::path::Path;
use std::sync::{Arc, Mutex};

use super::{
    AlertQuery, AlertStore, Penalty, RuleStore, SessionHistory, SessionRecorder, StoreError, StoreResult,
    TrustStore, schema,
};
use crate::core::{Alert, DetectionEvent, Rule, RuleType, Severity, TrustScore};

const ALERT_COLUMNS: &str = "id, rule_type, user_id, username, server_id, device_id, ip_address, severity, \
     title, description, evidence, created_at, acknowledged, acknowledged_by, acknowledged_at";

const TRUST_COLUMNS: &str =
    "user_id, username, score, violations_count, last_violation_at, restricted, updated_at";

const RULE_COLUMNS: &str = "rule_type, name, enabled, config, created_at, updated_at";

/// SQLite-backed store. Thread-safe and cheap to clone.
///
/// Every call runs on the blocking pool against a single serialized
/// connection, so each statement is atomic with respect to the others.
#[derive(Clone)]
pub struct SqliteStore {
    inner: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> StoreResult<Self> {
        schema::migrate(&conn)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = inner
                .lock()
                .map_err(|_| StoreError::Query("sqlite connection lock poisoned".into()))?;
            f(&mut *conn)
        })
        .await
        .map_err(|e| StoreError::Query(format!("blocking store task failed: {e}")))?
    }

    /// Record a session event for later history lookups and maintain the
    /// active-session table.
    pub async fn record_event(&self, event: &DetectionEvent) -> StoreResult<()> {
        let event = event.clone();
        let payload = serde_json::to_string(&event)?;
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let ts = event.timestamp.timestamp_millis();
            let located = event.known_location().is_some();
            tx.execute(
                "INSERT INTO session_events (session_key, user_id, timestamp, device_id, has_location, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![event.session_key, event.user_id, ts, event.device_id, located, payload],
            )?;
            if event.state.is_active() {
                tx.execute(
                    "INSERT OR REPLACE INTO active_sessions (session_key, user_id, timestamp, has_location, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![event.session_key, event.user_id, ts, located, payload],
                )?;
            } else {
                tx.execute(
                    "DELETE FROM active_sessions WHERE session_key = ?1",
                    params![event.session_key],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn latest_event(
        &self,
        user_id: i64,
        until: DateTime<Utc>,
        exclude_session: &str,
        located_only: bool,
    ) -> StoreResult<Option<DetectionEvent>> {
        let until = until.timestamp_millis();
        let exclude = exclude_session.to_string();
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT payload FROM session_events
                     WHERE user_id = ?1 AND timestamp <= ?2 AND session_key <> ?3
                       AND (?4 = 0 OR has_location = 1)
                     ORDER BY timestamp DESC, id DESC LIMIT 1",
                    params![user_id, until, exclude, located_only],
                    row_to_event,
                )
                .optional()?)
        })
        .await
    }

    /// Drop recorded session events older than `before`. Returns rows removed.
    pub async fn prune_events(&self, before: DateTime<Utc>) -> StoreResult<usize> {
        let cutoff = before.timestamp_millis();
        self.run(move |conn| {
            Ok(conn.execute(
                "DELETE FROM session_events WHERE timestamp < ?1",
                params![cutoff],
            )?)
        })
        .await
    }
}

fn conversion_error<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn millis_to_utc(idx: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn row_to_alert(row: &Row) -> rusqlite::Result<Alert> {
    let rule_type: String = row.get(1)?;
    let severity: i64 = row.get(7)?;
    let evidence: String = row.get(10)?;
    let acknowledged_at: Option<i64> = row.get(14)?;
    Ok(Alert {
        id: row.get(0)?,
        rule_type: rule_type.parse().map_err(|e| conversion_error(1, e))?,
        user_id: row.get(2)?,
        username: row.get(3)?,
        server_id: row.get(4)?,
        device_id: row.get(5)?,
        ip_address: row.get(6)?,
        severity: Severity::from_rank(severity)
            .ok_or(rusqlite::Error::IntegralValueOutOfRange(7, severity))?,
        title: row.get(8)?,
        description: row.get(9)?,
        evidence: serde_json::from_str(&evidence).map_err(|e| conversion_error(10, e))?,
        created_at: millis_to_utc(11, row.get(11)?)?,
        acknowledged: row.get(12)?,
        acknowledged_by: row.get(13)?,
        acknowledged_at: acknowledged_at.map(|ms| millis_to_utc(14, ms)).transpose()?,
    })
}

fn row_to_trust(row: &Row) -> rusqlite::Result<TrustScore> {
    let last_violation: Option<i64> = row.get(4)?;
    Ok(TrustScore {
        user_id: row.get(0)?,
        username: row.get(1)?,
        score: row.get(2)?,
        violations_count: row.get(3)?,
        last_violation_at: last_violation.map(|ms| millis_to_utc(4, ms)).transpose()?,
        restricted: row.get(5)?,
        updated_at: millis_to_utc(6, row.get(6)?)?,
    })
}

fn row_to_rule(row: &Row) -> rusqlite::Result<Rule> {
    let rule_type: String = row.get(0)?;
    let config: String = row.get(3)?;
    Ok(Rule {
        rule_type: rule_type.parse().map_err(|e| conversion_error(0, e))?,
        name: row.get(1)?,
        enabled: row.get(2)?,
        config: serde_json::from_str(&config).map_err(|e| conversion_error(3, e))?,
        created_at: millis_to_utc(4, row.get(4)?)?,
        updated_at: millis_to_utc(5, row.get(5)?)?,
    })
}

fn row_to_event(row: &Row) -> rusqlite::Result<DetectionEvent> {
    let payload: String = row.get(0)?;
    serde_json::from_str(&payload).map_err(|e| conversion_error(0, e))
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(", ")
}

/// WHERE clause and bound values for the filters of an alert query.
fn alert_filters(query: &AlertQuery) -> (String, Vec<Value>) {
    let mut sql = String::from(" WHERE 1=1");
    let mut args: Vec<Value> = Vec::new();

    if !query.rule_types.is_empty() {
        sql.push_str(&format!(" AND rule_type IN ({})", placeholders(query.rule_types.len())));
        args.extend(query.rule_types.iter().map(|rt| Value::Text(rt.as_str().to_string())));
    }
    if !query.severities.is_empty() {
        sql.push_str(&format!(" AND severity IN ({})", placeholders(query.severities.len())));
        args.extend(query.severities.iter().map(|s| Value::Integer(s.rank())));
    }
    if let Some(user_id) = query.user_id {
        sql.push_str(" AND user_id = ?");
        args.push(Value::Integer(user_id));
    }
    if let Some(ref server_id) = query.server_id {
        sql.push_str(" AND server_id = ?");
        args.push(Value::Text(server_id.clone()));
    }
    if let Some(ack) = query.acknowledged {
        sql.push_str(" AND acknowledged = ?");
        args.push(Value::Integer(ack as i64));
    }
    if let Some(start) = query.start {
        sql.push_str(" AND created_at >= ?");
        args.push(Value::Integer(start.timestamp_millis()));
    }
    if let Some(end) = query.end {
        sql.push_str(" AND created_at <= ?");
        args.push(Value::Integer(end.timestamp_millis()));
    }
    (sql, args)
}

fn select_alert(conn: &Connection, id: i64) -> rusqlite::Result<Option<Alert>> {
    conn.query_row(
        &format!("SELECT {ALERT_COLUMNS} FROM detection_alerts WHERE id = ?1"),
        params![id],
        row_to_alert,
    )
    .optional()
}

#[async_trait]
impl AlertStore for SqliteStore {
    async fn save_alert(&self, alert: &Alert) -> StoreResult<i64> {
        let alert = alert.clone();
        let evidence = serde_json::to_string(&alert.evidence)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO detection_alerts
                 (rule_type, user_id, username, server_id, device_id, ip_address, severity, title, description, evidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    alert.rule_type.as_str(),
                    alert.user_id,
                    alert.username,
                    alert.server_id,
                    alert.device_id,
                    alert.ip_address,
                    alert.severity.rank(),
                    alert.title,
                    alert.description,
                    evidence,
                    alert.created_at.timestamp_millis(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn get_alert(&self, id: i64) -> StoreResult<Option<Alert>> {
        self.run(move |conn| Ok(select_alert(conn, id)?)).await
    }

    async fn list_alerts(&self, query: &AlertQuery) -> StoreResult<Vec<Alert>> {
        let (filters, mut args) = alert_filters(query);
        let dir = query.order_direction.keyword();
        let sql = format!(
            "SELECT {ALERT_COLUMNS} FROM detection_alerts{filters} ORDER BY {col} {dir}, id {dir} LIMIT ? OFFSET ?",
            col = query.order_by.column(),
        );
        args.push(Value::Integer(query.effective_limit() as i64));
        args.push(Value::Integer(i64::try_from(query.offset).unwrap_or(i64::MAX)));
        self.run(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), row_to_alert)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn acknowledge_alert(&self, id: i64, acknowledged_by: &str) -> StoreResult<Alert> {
        let by = acknowledged_by.to_string();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE detection_alerts SET acknowledged = 1, acknowledged_by = ?1, acknowledged_at = ?2
                 WHERE id = ?3 AND acknowledged = 0",
                params![by, Utc::now().timestamp_millis(), id],
            )?;
            let alert = select_alert(&tx, id)?
                .ok_or_else(|| StoreError::NotFound(format!("alert {id}")))?;
            tx.commit()?;
            Ok(alert)
        })
        .await
    }

    async fn get_alert_count(&self, query: &AlertQuery) -> StoreResult<usize> {
        let (filters, args) = alert_filters(query);
        let sql = format!("SELECT COUNT(*) FROM detection_alerts{filters}");
        self.run(move |conn| {
            let count: i64 = conn.query_row(&sql, params_from_iter(args.iter()), |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }
}

#[async_trait]
impl RuleStore for SqliteStore {
    async fn get_rule(&self, rule_type: RuleType) -> StoreResult<Option<Rule>> {
        self.run(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {RULE_COLUMNS} FROM detection_rules WHERE rule_type = ?1"),
                    params![rule_type.as_str()],
                    row_to_rule,
                )
                .optional()?)
        })
        .await
    }

    async fn list_rules(&self) -> StoreResult<Vec<Rule>> {
        self.run(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {RULE_COLUMNS} FROM detection_rules ORDER BY position"))?;
            let rows = stmt.query_map([], row_to_rule)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn save_rule(&self, rule: &Rule) -> StoreResult<()> {
        let rule = rule.clone();
        let config = serde_json::to_string(&rule.config)?;
        self.run(move |conn| {
            let now = Utc::now().timestamp_millis();
            conn.execute(
                "INSERT INTO detection_rules (rule_type, position, name, enabled, config, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                 ON CONFLICT(rule_type) DO UPDATE SET
                    name = excluded.name,
                    enabled = excluded.enabled,
                    config = excluded.config,
                    updated_at = excluded.updated_at",
                params![
                    rule.rule_type.as_str(),
                    rule.rule_type.index() as i64,
                    rule.name,
                    rule.enabled,
                    config,
                    now,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn set_rule_enabled(&self, rule_type: RuleType, enabled: bool) -> StoreResult<()> {
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE detection_rules SET enabled = ?1, updated_at = ?2 WHERE rule_type = ?3",
                params![enabled, Utc::now().timestamp_millis(), rule_type.as_str()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("rule {rule_type}")));
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl TrustStore for SqliteStore {
    async fn get_trust_score(&self, user_id: i64) -> StoreResult<TrustScore> {
        self.run(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {TRUST_COLUMNS} FROM user_trust_scores WHERE user_id = ?1"),
                    params![user_id],
                    row_to_trust,
                )
                .optional()?;
            Ok(row.unwrap_or_else(|| TrustScore::new_default(user_id)))
        })
        .await
    }

    async fn apply_penalty(&self, penalty: &Penalty) -> StoreResult<TrustScore> {
        let penalty = penalty.clone();
        self.run(move |conn| {
            // SET expressions see the pre-update row, so the clamp and the
            // restricted flag are computed from the same old score.
            let sql = format!(
                "INSERT INTO user_trust_scores ({TRUST_COLUMNS})
                 VALUES (?1, ?2, MAX(0, MIN(100, 100 - ?3)), 1, ?4, MAX(0, MIN(100, 100 - ?3)) < ?5, ?4)
                 ON CONFLICT(user_id) DO UPDATE SET
                    username = CASE WHEN excluded.username = '' THEN user_trust_scores.username ELSE excluded.username END,
                    score = MAX(0, MIN(100, user_trust_scores.score - ?3)),
                    violations_count = user_trust_scores.violations_count + 1,
                    last_violation_at = ?4,
                    restricted = MAX(0, MIN(100, user_trust_scores.score - ?3)) < ?5,
                    updated_at = ?4
                 RETURNING {TRUST_COLUMNS}"
            );
            Ok(conn.query_row(
                &sql,
                params![
                    penalty.user_id,
                    penalty.username,
                    penalty.amount,
                    Utc::now().timestamp_millis(),
                    penalty.restrict_below,
                ],
                row_to_trust,
            )?)
        })
        .await
    }

    async fn recover_trust_scores(&self, amount: i32, restrict_below: i32) -> StoreResult<usize> {
        self.run(move |conn| {
            Ok(conn.execute(
                "UPDATE user_trust_scores
                 SET score = MAX(0, MIN(100, score + ?1)),
                     restricted = MAX(0, MIN(100, score + ?1)) < ?2,
                     updated_at = ?3
                 WHERE score < 100",
                params![amount, restrict_below, Utc::now().timestamp_millis()],
            )?)
        })
        .await
    }

    async fn list_low_trust_users(&self, threshold: i32) -> StoreResult<Vec<TrustScore>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TRUST_COLUMNS} FROM user_trust_scores WHERE score < ?1 ORDER BY score ASC, user_id ASC"
            ))?;
            let rows = stmt.query_map(params![threshold], row_to_trust)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

#[async_trait]
impl SessionHistory for SqliteStore {
    async fn last_located_session(
        &self,
        user_id: i64,
        until: DateTime<Utc>,
        exclude_session: &str,
    ) -> StoreResult<Option<DetectionEvent>> {
        self.latest_event(user_id, until, exclude_session, true).await
    }

    async fn last_session(
        &self,
        user_id: i64,
        until: DateTime<Utc>,
        exclude_session: &str,
    ) -> StoreResult<Option<DetectionEvent>> {
        self.latest_event(user_id, until, exclude_session, false).await
    }

    async fn active_sessions(&self, user_id: i64) -> StoreResult<Vec<String>> {
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT session_key FROM active_sessions WHERE user_id = ?1 ORDER BY session_key",
            )?;
            let rows = stmt.query_map(params![user_id], |row| row.get(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
        })
        .await
    }

    async fn distinct_devices(&self, user_id: i64, since: DateTime<Utc>) -> StoreResult<Vec<String>> {
        let since = since.timestamp_millis();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT device_id FROM session_events
                 WHERE user_id = ?1 AND timestamp >= ?2 AND device_id IS NOT NULL
                 ORDER BY device_id",
            )?;
            let rows = stmt.query_map(params![user_id, since], |row| row.get(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
        })
        .await
    }

    async fn concurrent_located_sessions(
        &self,
        user_id: i64,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<DetectionEvent>> {
        let since = since.timestamp_millis();
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT payload FROM active_sessions
                 WHERE user_id = ?1 AND timestamp >= ?2 AND has_location = 1
                 ORDER BY session_key",
            )?;
            let rows = stmt.query_map(params![user_id, since], row_to_event)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }
}

#[async_trait]
impl SessionRecorder for SqliteStore {
    async fn record_event(&self, event: &DetectionEvent) -> StoreResult<()> {
        SqliteStore::record_event(self, event).await
    }
}
