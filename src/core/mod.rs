pub mod geo;
pub mod pipeline;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use geo::GeoPoint;

/// Default trust score for a user with no recorded violations.
pub const MAX_TRUST_SCORE: i32 = 100;

/// Lifecycle stage of a playback session carried by a detection event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Start,
    Resume,
    Pause,
    Stop,
}

impl SessionState {
    /// Whether the session still holds a stream slot after this event.
    pub fn is_active(&self) -> bool {
        !matches!(self, SessionState::Stop)
    }
}

/// A playback/session event as handed to the detection engine.
///
/// Geolocation is resolved by the caller; `location` is `None` when the IP
/// could not be resolved (private and reserved ranges never resolve).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub session_key: String,
    pub state: SessionState,
    pub timestamp: DateTime<Utc>,
    pub user_id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub server_id: Option<String>,
    /// Device fingerprint (machine identifier reported by the player).
    #[serde(default)]
    pub device_id: Option<String>,
    /// Client OS family as reported by the player, e.g. "iOS" or "Windows".
    #[serde(default)]
    pub platform: Option<String>,
    /// Player application name, e.g. "Plex for iOS".
    #[serde(default)]
    pub player: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub city: Option<String>,
    /// ISO 3166-1 alpha-2 country code.
    #[serde(default)]
    pub country: Option<String>,
}

impl DetectionEvent {
    /// The event location, if it resolved to real coordinates.
    pub fn known_location(&self) -> Option<GeoPoint> {
        self.location.filter(GeoPoint::is_known)
    }
}

/// Identifies one detection rule. Closed set: every match over it is exhaustive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    ImpossibleTravel,
    ConcurrentStreams,
    DeviceVelocity,
    SimultaneousLocations,
    GeoRestriction,
    UserAgentAnomaly,
}

impl RuleType {
    pub const ALL: [RuleType; 6] = [
        RuleType::ImpossibleTravel,
        RuleType::ConcurrentStreams,
        RuleType::DeviceVelocity,
        RuleType::SimultaneousLocations,
        RuleType::GeoRestriction,
        RuleType::UserAgentAnomaly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleType::ImpossibleTravel => "impossible_travel",
            RuleType::ConcurrentStreams => "concurrent_streams",
            RuleType::DeviceVelocity => "device_velocity",
            RuleType::SimultaneousLocations => "simultaneous_locations",
            RuleType::GeoRestriction => "geo_restriction",
            RuleType::UserAgentAnomaly => "user_agent_anomaly",
        }
    }

    /// Stable position in [`RuleType::ALL`], used to index per-rule counters.
    pub fn index(&self) -> usize {
        match self {
            RuleType::ImpossibleTravel => 0,
            RuleType::ConcurrentStreams => 1,
            RuleType::DeviceVelocity => 2,
            RuleType::SimultaneousLocations => 3,
            RuleType::GeoRestriction => 4,
            RuleType::UserAgentAnomaly => 5,
        }
    }

    /// Human readable name used when seeding rule rows.
    pub fn display_name(&self) -> &'static str {
        match self {
            RuleType::ImpossibleTravel => "Impossible Travel Detection",
            RuleType::ConcurrentStreams => "Concurrent Stream Limits",
            RuleType::DeviceVelocity => "Device Velocity",
            RuleType::SimultaneousLocations => "Simultaneous Locations",
            RuleType::GeoRestriction => "Geographic Restrictions",
            RuleType::UserAgentAnomaly => "User Agent Anomaly",
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown rule type or severity name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl FromStr for RuleType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RuleType::ALL
            .into_iter()
            .find(|rt| rt.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseEnumError {
                kind: "rule type",
                value: s.to_string(),
            })
    }
}

/// Ordered classification of a violation: `Info < Warning < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 3] = [Severity::Info, Severity::Warning, Severity::Critical];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }

    /// Numeric rank, used for ordering in storage.
    pub fn rank(&self) -> i64 {
        match self {
            Severity::Info => 0,
            Severity::Warning => 1,
            Severity::Critical => 2,
        }
    }

    pub fn from_rank(rank: i64) -> Option<Self> {
        match rank {
            0 => Some(Severity::Info),
            1 => Some(Severity::Warning),
            2 => Some(Severity::Critical),
            _ => None,
        }
    }

    pub fn emoji(&self) -> &'static str {
        match self {
            Severity::Critical => "🔴",
            Severity::Warning => "🟠",
            Severity::Info => "⚪",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Severity::ALL
            .into_iter()
            .find(|sev| sev.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseEnumError {
                kind: "severity",
                value: s.to_string(),
            })
    }
}

/// A persisted detection alert. Only the acknowledgement fields ever change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Assigned by the alert store; 0 until saved.
    pub id: i64,
    pub rule_type: RuleType,
    pub user_id: i64,
    pub username: String,
    pub server_id: Option<String>,
    pub device_id: Option<String>,
    pub ip_address: Option<String>,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    /// Rule-specific details explaining why the alert fired.
    pub evidence: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
}

/// Stored configuration for one rule type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub rule_type: RuleType,
    pub name: String,
    pub enabled: bool,
    /// Rule-specific parameters, see `detection::rules::RuleConfig`.
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-user reputation, always within `0..=100`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustScore {
    pub user_id: i64,
    pub username: String,
    pub score: i32,
    pub violations_count: u32,
    pub last_violation_at: Option<DateTime<Utc>>,
    /// Score fell below the restriction threshold on its last update.
    pub restricted: bool,
    pub updated_at: DateTime<Utc>,
}

impl TrustScore {
    /// The score a user has before any violation.
    pub fn new_default(user_id: i64) -> Self {
        Self {
            user_id,
            username: String::new(),
            score: MAX_TRUST_SCORE,
            violations_count: 0,
            last_violation_at: None,
            restricted: false,
            updated_at: Utc::now(),
        }
    }
}

/// Clamp a raw score into the valid trust range.
pub fn clamp_score(score: i64) -> i32 {
    score.clamp(0, MAX_TRUST_SCORE as i64) as i32
}
