use chrono::Utc;
use rusqlite::Connection;

use crate::detection::rules::default_rules;

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS detection_rules (
            rule_type   TEXT PRIMARY KEY,
            position    INTEGER NOT NULL,
            name        TEXT NOT NULL,
            enabled     INTEGER NOT NULL DEFAULT 1,
            config      TEXT NOT NULL, -- JSON
            created_at  INTEGER NOT NULL,
            updated_at  INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS detection_alerts (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            rule_type       TEXT NOT NULL,
            user_id         INTEGER NOT NULL,
            username        TEXT NOT NULL DEFAULT '',
            server_id       TEXT,
            device_id       TEXT,
            ip_address      TEXT,
            severity        INTEGER NOT NULL, -- 0 info, 1 warning, 2 critical
            title           TEXT NOT NULL,
            description     TEXT NOT NULL,
            evidence        TEXT NOT NULL, -- JSON
            created_at      INTEGER NOT NULL, -- unix millis
            acknowledged    INTEGER NOT NULL DEFAULT 0,
            acknowledged_by TEXT,
            acknowledged_at INTEGER
        );

        CREATE TABLE IF NOT EXISTS user_trust_scores (
            user_id           INTEGER PRIMARY KEY,
            username          TEXT NOT NULL DEFAULT '',
            score             INTEGER NOT NULL DEFAULT 100 CHECK (score BETWEEN 0 AND 100),
            violations_count  INTEGER NOT NULL DEFAULT 0,
            last_violation_at INTEGER,
            restricted        INTEGER NOT NULL DEFAULT 0,
            updated_at        INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS session_events (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            session_key  TEXT NOT NULL,
            user_id      INTEGER NOT NULL,
            timestamp    INTEGER NOT NULL,
            device_id    TEXT,
            has_location INTEGER NOT NULL,
            payload      TEXT NOT NULL -- JSON DetectionEvent
        );

        CREATE TABLE IF NOT EXISTS active_sessions (
            session_key  TEXT PRIMARY KEY,
            user_id      INTEGER NOT NULL,
            timestamp    INTEGER NOT NULL,
            has_location INTEGER NOT NULL,
            payload      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_alerts_user_id ON detection_alerts(user_id);
        CREATE INDEX IF NOT EXISTS idx_alerts_rule_type ON detection_alerts(rule_type);
        CREATE INDEX IF NOT EXISTS idx_alerts_created ON detection_alerts(created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_alerts_acknowledged ON detection_alerts(acknowledged);
        CREATE INDEX IF NOT EXISTS idx_trust_score ON user_trust_scores(score);
        CREATE INDEX IF NOT EXISTS idx_session_events_user ON session_events(user_id, timestamp DESC);
        CREATE INDEX IF NOT EXISTS idx_active_sessions_user ON active_sessions(user_id);
        ",
    )?;
    seed_default_rules(conn)
}

/// Insert the default configuration for any rule type without a row.
fn seed_default_rules(conn: &Connection) -> Result<(), rusqlite::Error> {
    let now = Utc::now().timestamp_millis();
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO detection_rules (rule_type, position, name, enabled, config, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
    )?;
    for rule in default_rules() {
        stmt.execute(rusqlite::params![
            rule.rule_type.as_str(),
            rule.rule_type.index() as i64,
            rule.name,
            rule.enabled,
            rule.config.to_string(),
            now,
        ])?;
    }
    Ok(())
}
