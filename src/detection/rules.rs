use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashMap};

use crate::core::{DetectionEvent, Rule, RuleType, SessionState, Severity};

/// A rule match, before it is turned into a persisted alert.
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub rule_type: RuleType,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub evidence: Value,
}

/// Longest sliding window any rule accepts: one year.
pub const MAX_WINDOW_MINUTES: i64 = 525_600;

/// Start of a window of `minutes` ending at `end`, or `None` when it would
/// fall outside the representable time range.
pub fn window_start(end: DateTime<Utc>, minutes: i64) -> Option<DateTime<Utc>> {
    TimeDelta::try_minutes(minutes).and_then(|window| end.checked_sub_signed(window))
}

/// Severity for a count-based rule that is `over` units past its limit.
pub fn escalate(over: u32) -> Severity {
    if over >= 3 {
        Severity::Critical
    } else {
        Severity::Warning
    }
}

/// Rules only look at events that open or continue playback.
pub fn applies_to(state: SessionState) -> bool {
    matches!(state, SessionState::Start | SessionState::Resume)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpossibleTravelConfig {
    pub max_speed_kmh: f64,
    pub min_distance_km: f64,
}

impl Default for ImpossibleTravelConfig {
    fn default() -> Self {
        Self {
            max_speed_kmh: 900.0,
            min_distance_km: 100.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrentStreamsConfig {
    pub default_limit: u32,
    /// Per-user overrides of `default_limit`.
    pub user_limits: HashMap<i64, u32>,
}

impl Default for ConcurrentStreamsConfig {
    fn default() -> Self {
        Self {
            default_limit: 3,
            user_limits: HashMap::new(),
        }
    }
}

impl ConcurrentStreamsConfig {
    pub fn limit_for(&self, user_id: i64) -> u32 {
        self.user_limits.get(&user_id).copied().unwrap_or(self.default_limit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceVelocityConfig {
    pub window_minutes: i64,
    pub max_devices_per_window: u32,
}

impl Default for DeviceVelocityConfig {
    fn default() -> Self {
        Self {
            window_minutes: 60,
            max_devices_per_window: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimultaneousLocationsConfig {
    pub window_minutes: i64,
    pub min_distance_km: f64,
    pub severity: Severity,
}

impl Default for SimultaneousLocationsConfig {
    fn default() -> Self {
        Self {
            window_minutes: 30,
            min_distance_km: 50.0,
            severity: Severity::Critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoRestrictionConfig {
    /// ISO country codes that always violate.
    pub blocked_countries: Vec<String>,
    /// When non-empty, any country outside this list violates.
    pub allowed_countries: Vec<String>,
    pub severity: Severity,
}

impl Default for GeoRestrictionConfig {
    fn default() -> Self {
        Self {
            blocked_countries: Vec::new(),
            allowed_countries: Vec::new(),
            severity: Severity::Warning,
        }
    }
}

/// Client strings that point at scripted or headless playback.
const SUSPICIOUS_AGENT_PATTERNS: [&str; 10] = [
    "curl", "wget", "python", "bot", "crawler", "spider", "headless", "phantom", "selenium", "puppeteer",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserAgentAnomalyConfig {
    /// Changes against the previous session older than this are ignored.
    pub window_minutes: i64,
    pub alert_on_new_agent: bool,
    pub alert_on_platform_switch: bool,
    /// Case-insensitive substrings matched against platform, player and device.
    pub suspicious_patterns: Vec<String>,
    /// Severity of platform switches. Suspicious clients are always
    /// Critical and new clients always Info.
    pub severity: Severity,
}

impl Default for UserAgentAnomalyConfig {
    fn default() -> Self {
        Self {
            window_minutes: 30,
            alert_on_new_agent: true,
            alert_on_platform_switch: true,
            suspicious_patterns: SUSPICIOUS_AGENT_PATTERNS.iter().map(|p| p.to_string()).collect(),
            severity: Severity::Warning,
        }
    }
}

/// Typed configuration for one rule. One variant per [`RuleType`].
#[derive(Debug, Clone, PartialEq)]
pub enum RuleConfig {
    ImpossibleTravel(ImpossibleTravelConfig),
    ConcurrentStreams(ConcurrentStreamsConfig),
    DeviceVelocity(DeviceVelocityConfig),
    SimultaneousLocations(SimultaneousLocationsConfig),
    GeoRestriction(GeoRestrictionConfig),
    UserAgentAnomaly(UserAgentAnomalyConfig),
}

impl RuleConfig {
    pub fn default_for(rule_type: RuleType) -> Self {
        match rule_type {
            RuleType::ImpossibleTravel => RuleConfig::ImpossibleTravel(Default::default()),
            RuleType::ConcurrentStreams => RuleConfig::ConcurrentStreams(Default::default()),
            RuleType::DeviceVelocity => RuleConfig::DeviceVelocity(Default::default()),
            RuleType::SimultaneousLocations => RuleConfig::SimultaneousLocations(Default::default()),
            RuleType::GeoRestriction => RuleConfig::GeoRestriction(Default::default()),
            RuleType::UserAgentAnomaly => RuleConfig::UserAgentAnomaly(Default::default()),
        }
    }

    pub fn rule_type(&self) -> RuleType {
        match self {
            RuleConfig::ImpossibleTravel(_) => RuleType::ImpossibleTravel,
            RuleConfig::ConcurrentStreams(_) => RuleType::ConcurrentStreams,
            RuleConfig::DeviceVelocity(_) => RuleType::DeviceVelocity,
            RuleConfig::SimultaneousLocations(_) => RuleType::SimultaneousLocations,
            RuleConfig::GeoRestriction(_) => RuleType::GeoRestriction,
            RuleConfig::UserAgentAnomaly(_) => RuleType::UserAgentAnomaly,
        }
    }

    /// Decode and validate the raw config stored for `rule_type`.
    /// A JSON `null` yields the defaults; missing fields take their defaults.
    pub fn parse(rule_type: RuleType, raw: &Value) -> Result<Self, String> {
        let raw = if raw.is_null() { json!({}) } else { raw.clone() };
        let config = match rule_type {
            RuleType::ImpossibleTravel => serde_json::from_value(raw).map(RuleConfig::ImpossibleTravel),
            RuleType::ConcurrentStreams => serde_json::from_value(raw).map(RuleConfig::ConcurrentStreams),
            RuleType::DeviceVelocity => serde_json::from_value(raw).map(RuleConfig::DeviceVelocity),
            RuleType::SimultaneousLocations => {
                serde_json::from_value(raw).map(RuleConfig::SimultaneousLocations)
            }
            RuleType::GeoRestriction => serde_json::from_value(raw).map(RuleConfig::GeoRestriction),
            RuleType::UserAgentAnomaly => serde_json::from_value(raw).map(RuleConfig::UserAgentAnomaly),
        }
        .map_err(|e| format!("invalid {rule_type} config: {e}"))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_rule(rule: &Rule) -> Result<Self, String> {
        Self::parse(rule.rule_type, &rule.config)
    }

    pub fn validate(&self) -> Result<(), String> {
        let positive = |name: &str, v: f64| {
            if v.is_finite() && v > 0.0 {
                Ok(())
            } else {
                Err(format!("{name} must be a positive number, got {v}"))
            }
        };
        let window = |v: i64| {
            if (1..=MAX_WINDOW_MINUTES).contains(&v) {
                Ok(())
            } else {
                Err(format!("window_minutes must be between 1 and {MAX_WINDOW_MINUTES}, got {v}"))
            }
        };
        match self {
            RuleConfig::ImpossibleTravel(c) => {
                positive("max_speed_kmh", c.max_speed_kmh)?;
                if !c.min_distance_km.is_finite() || c.min_distance_km < 0.0 {
                    return Err(format!("min_distance_km must be >= 0, got {}", c.min_distance_km));
                }
                Ok(())
            }
            RuleConfig::ConcurrentStreams(c) => {
                if c.default_limit == 0 {
                    return Err("default_limit must be at least 1".into());
                }
                Ok(())
            }
            RuleConfig::DeviceVelocity(c) => {
                window(c.window_minutes)?;
                if c.max_devices_per_window == 0 {
                    return Err("max_devices_per_window must be at least 1".into());
                }
                Ok(())
            }
            RuleConfig::SimultaneousLocations(c) => {
                window(c.window_minutes)?;
                positive("min_distance_km", c.min_distance_km)
            }
            RuleConfig::GeoRestriction(_) => Ok(()),
            RuleConfig::UserAgentAnomaly(c) => {
                window(c.window_minutes)?;
                if c.suspicious_patterns.iter().any(|p| p.trim().is_empty()) {
                    return Err("suspicious_patterns must not contain blank entries".into());
                }
                Ok(())
            }
        }
    }

    pub fn to_value(&self) -> Value {
        let value = match self {
            RuleConfig::ImpossibleTravel(c) => serde_json::to_value(c),
            RuleConfig::ConcurrentStreams(c) => serde_json::to_value(c),
            RuleConfig::DeviceVelocity(c) => serde_json::to_value(c),
            RuleConfig::SimultaneousLocations(c) => serde_json::to_value(c),
            RuleConfig::GeoRestriction(c) => serde_json::to_value(c),
            RuleConfig::UserAgentAnomaly(c) => serde_json::to_value(c),
        };
        value.unwrap_or(Value::Null)
    }
}

/// Default rule rows, in [`RuleType::ALL`] order. Geo restriction ships
/// disabled since it has no countries configured.
pub fn default_rules() -> Vec<Rule> {
    let now = Utc::now();
    RuleType::ALL
        .into_iter()
        .map(|rule_type| Rule {
            rule_type,
            name: rule_type.display_name().to_string(),
            enabled: rule_type != RuleType::GeoRestriction,
            config: RuleConfig::default_for(rule_type).to_value(),
            created_at: now,
            updated_at: now,
        })
        .collect()
}

/// Flag a user holding more active streams than allowed. `active` holds the
/// session keys the tracker currently considers live; the event's own
/// session is counted whether or not the tracker has seen it yet.
pub fn check_concurrent_streams(
    event: &DetectionEvent,
    config: &ConcurrentStreamsConfig,
    active: &[String],
) -> Option<Violation> {
    let mut sessions: BTreeSet<&str> = active.iter().map(String::as_str).collect();
    sessions.insert(event.session_key.as_str());
    let count = sessions.len() as u32;
    let limit = config.limit_for(event.user_id);
    if count <= limit {
        return None;
    }

    Some(Violation {
        rule_type: RuleType::ConcurrentStreams,
        severity: escalate(count - limit),
        title: "Concurrent stream limit exceeded".to_string(),
        description: format!(
            "User {} has {count} active streams (limit {limit})",
            display_user(event)
        ),
        evidence: json!({
            "active_streams": count,
            "limit": limit,
            "session_keys": sessions,
        }),
    })
}

/// Flag a user switching between too many devices inside the window.
/// `recent_devices` are the distinct devices seen since the window start.
pub fn check_device_velocity(
    event: &DetectionEvent,
    config: &DeviceVelocityConfig,
    recent_devices: &[String],
) -> Option<Violation> {
    let mut devices: BTreeSet<&str> = recent_devices.iter().map(String::as_str).collect();
    if let Some(ref device) = event.device_id {
        devices.insert(device.as_str());
    }
    let count = devices.len() as u32;
    let max = config.max_devices_per_window;
    if count <= max {
        return None;
    }

    Some(Violation {
        rule_type: RuleType::DeviceVelocity,
        severity: escalate(count - max),
        title: "Rapid device switching".to_string(),
        description: format!(
            "User {} used {count} devices within {} minutes (max {max})",
            display_user(event),
            config.window_minutes
        ),
        evidence: json!({
            "device_count": count,
            "max_devices": max,
            "window_minutes": config.window_minutes,
            "devices": devices,
        }),
    })
}

/// Start of the device velocity window that ends at the event time.
pub fn device_window_start(event: &DetectionEvent, config: &DeviceVelocityConfig) -> Option<DateTime<Utc>> {
    window_start(event.timestamp, config.window_minutes)
}

/// Flag playback from a blocked country, or from outside the allow list.
pub fn check_geo_restriction(event: &DetectionEvent, config: &GeoRestrictionConfig) -> Option<Violation> {
    let country = event.country.as_deref().map(str::trim).filter(|c| !c.is_empty())?;
    let listed = |list: &[String]| list.iter().any(|c| c.trim().eq_ignore_ascii_case(country));

    let reason = if listed(config.blocked_countries.as_slice()) {
        "blocked"
    } else if !config.allowed_countries.is_empty() && !listed(config.allowed_countries.as_slice()) {
        "not_allowed"
    } else {
        return None;
    };

    Some(Violation {
        rule_type: RuleType::GeoRestriction,
        severity: config.severity,
        title: "Streaming from restricted country".to_string(),
        description: format!(
            "User {} is streaming from {} ({})",
            display_user(event),
            country.to_ascii_uppercase(),
            reason.replace('_', " ")
        ),
        evidence: json!({
            "country": country.to_ascii_uppercase(),
            "city": event.city,
            "reason": reason,
            "ip_address": event.ip_address,
        }),
    })
}

pub(crate) fn display_user(event: &DetectionEvent) -> String {
    if event.username.is_empty() {
        format!("#{}", event.user_id)
    } else {
        event.username.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::tests::session;

    fn keys(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("other-{i}")).collect()
    }

    #[test]
    fn escalation_steps() {
        assert_eq!(escalate(1), Severity::Warning);
        assert_eq!(escalate(2), Severity::Warning);
        assert_eq!(escalate(3), Severity::Critical);
        assert_eq!(escalate(10), Severity::Critical);
    }

    #[test]
    fn only_start_and_resume_are_checked() {
        assert!(applies_to(SessionState::Start));
        assert!(applies_to(SessionState::Resume));
        assert!(!applies_to(SessionState::Pause));
        assert!(!applies_to(SessionState::Stop));
    }

    #[test]
    fn concurrent_streams_at_limit_is_clean() {
        let event = session(1, "s", 0, SessionState::Start);
        let config = ConcurrentStreamsConfig::default();
        // Two others plus the current session: exactly at the limit of 3.
        assert!(check_concurrent_streams(&event, &config, &keys(2)).is_none());
    }

    #[test]
    fn concurrent_streams_iff_over_limit() {
        let event = session(1, "s", 0, SessionState::Start);
        for limit in 1..6u32 {
            let config = ConcurrentStreamsConfig {
                default_limit: limit,
                ..Default::default()
            };
            for others in 0..8usize {
                let n = others as u32 + 1;
                let v = check_concurrent_streams(&event, &config, &keys(others));
                assert_eq!(v.is_some(), n > limit, "n={n} limit={limit}");
                if let Some(v) = v {
                    assert_eq!(v.severity, escalate(n - limit));
                }
            }
        }
    }

    #[test]
    fn concurrent_streams_counts_current_session_once() {
        let event = session(1, "s", 0, SessionState::Start);
        let config = ConcurrentStreamsConfig {
            default_limit: 1,
            ..Default::default()
        };
        assert!(check_concurrent_streams(&event, &config, &["s".to_string()]).is_none());
    }

    #[test]
    fn concurrent_streams_user_override() {
        let event = session(7, "s", 0, SessionState::Start);
        let mut config = ConcurrentStreamsConfig::default();
        config.user_limits.insert(7, 10);
        assert!(check_concurrent_streams(&event, &config, &keys(5)).is_none());
        let v = check_concurrent_streams(&session(8, "s", 0, SessionState::Start), &config, &keys(5)).unwrap();
        assert_eq!(v.severity, Severity::Critical);
        assert_eq!(v.evidence["active_streams"], 6);
    }

    #[test]
    fn device_velocity_counts_current_device() {
        let mut event = session(1, "s", 0, SessionState::Start);
        event.device_id = Some("laptop".into());
        let config = DeviceVelocityConfig::default();
        let seen = vec!["tv".to_string(), "phone".to_string(), "tablet".to_string()];
        let v = check_device_velocity(&event, &config, &seen).unwrap();
        assert_eq!(v.severity, Severity::Warning);
        assert_eq!(v.evidence["device_count"], 4);

        event.device_id = Some("tv".into());
        assert!(check_device_velocity(&event, &config, &seen).is_none());
    }

    #[test]
    fn device_velocity_critical_far_over() {
        let event = session(1, "s", 0, SessionState::Start);
        let config = DeviceVelocityConfig {
            max_devices_per_window: 2,
            ..Default::default()
        };
        let seen: Vec<String> = (0..5).map(|i| format!("d{i}")).collect();
        assert_eq!(check_device_velocity(&event, &config, &seen).unwrap().severity, Severity::Critical);
    }

    #[test]
    fn geo_restriction_blocked_and_allowed() {
        let mut event = session(1, "s", 0, SessionState::Start);
        event.country = Some("ru".into());
        let blocked = GeoRestrictionConfig {
            blocked_countries: vec!["RU".into()],
            ..Default::default()
        };
        let v = check_geo_restriction(&event, &blocked).unwrap();
        assert_eq!(v.evidence["reason"], "blocked");
        assert_eq!(v.severity, Severity::Warning);

        let allow = GeoRestrictionConfig {
            allowed_countries: vec!["US".into(), "CA".into()],
            ..Default::default()
        };
        assert_eq!(check_geo_restriction(&event, &allow).unwrap().evidence["reason"], "not_allowed");
        event.country = Some("us".into());
        assert!(check_geo_restriction(&event, &allow).is_none());
    }

    #[test]
    fn geo_restriction_unknown_country_is_clean() {
        let event = session(1, "s", 0, SessionState::Start);
        let config = GeoRestrictionConfig {
            allowed_countries: vec!["US".into()],
            ..Default::default()
        };
        assert!(check_geo_restriction(&event, &config).is_none());
    }

    #[test]
    fn parse_null_gives_defaults() {
        for rule_type in RuleType::ALL {
            let config = RuleConfig::parse(rule_type, &Value::Null).unwrap();
            assert_eq!(config, RuleConfig::default_for(rule_type));
            assert_eq!(config.rule_type(), rule_type);
        }
    }

    #[test]
    fn parse_partial_and_invalid() {
        let config = RuleConfig::parse(RuleType::ImpossibleTravel, &json!({"max_speed_kmh": 800})).unwrap();
        assert_eq!(
            config,
            RuleConfig::ImpossibleTravel(ImpossibleTravelConfig {
                max_speed_kmh: 800.0,
                min_distance_km: 100.0,
            })
        );
        assert!(RuleConfig::parse(RuleType::ImpossibleTravel, &json!({"max_speed_kmh": -1})).is_err());
        assert!(RuleConfig::parse(RuleType::DeviceVelocity, &json!({"window_minutes": "soon"})).is_err());
        assert!(RuleConfig::parse(RuleType::ConcurrentStreams, &json!({"default_limit": 0})).is_err());
    }

    #[test]
    fn window_bounds() {
        for rule_type in [RuleType::DeviceVelocity, RuleType::SimultaneousLocations, RuleType::UserAgentAnomaly] {
            assert!(RuleConfig::parse(rule_type, &json!({"window_minutes": MAX_WINDOW_MINUTES})).is_ok());
            for bad in [0, -5, MAX_WINDOW_MINUTES + 1, 1_000_000_000_000i64, i64::MAX] {
                assert!(
                    RuleConfig::parse(rule_type, &json!({"window_minutes": bad})).is_err(),
                    "{rule_type} accepted {bad}"
                );
            }
        }
    }

    #[test]
    fn window_start_never_overflows() {
        let event = session(1, "s", 0, SessionState::Start);
        let huge = DeviceVelocityConfig {
            window_minutes: 1_000_000_000_000,
            ..Default::default()
        };
        assert!(device_window_start(&event, &huge).is_none());
        assert!(window_start(event.timestamp, i64::MAX).is_none());
        assert_eq!(
            device_window_start(&event, &DeviceVelocityConfig::default()),
            Some(event.timestamp - TimeDelta::minutes(60))
        );
    }

    #[test]
    fn blank_agent_pattern_is_rejected() {
        let raw = json!({"suspicious_patterns": ["curl", "  "]});
        assert!(RuleConfig::parse(RuleType::UserAgentAnomaly, &raw).is_err());
    }

    #[test]
    fn user_limits_roundtrip_through_json() {
        let raw = json!({"default_limit": 2, "user_limits": {"42": 5}});
        let config = RuleConfig::parse(RuleType::ConcurrentStreams, &raw).unwrap();
        let RuleConfig::ConcurrentStreams(ref c) = config else {
            panic!("wrong variant");
        };
        assert_eq!(c.limit_for(42), 5);
        assert_eq!(c.limit_for(1), 2);
        assert_eq!(RuleConfig::parse(RuleType::ConcurrentStreams, &config.to_value()).unwrap(), config);
    }

    #[test]
    fn default_rules_cover_every_type() {
        let rules = default_rules();
        assert_eq!(rules.len(), RuleType::ALL.len());
        for rule in &rules {
            assert!(RuleConfig::from_rule(rule).is_ok());
            assert_eq!(rule.enabled, rule.rule_type != RuleType::GeoRestriction);
        }
    }
}
