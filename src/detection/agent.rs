use chrono::TimeDelta;
use serde_json::json;

use super::rules::{UserAgentAnomalyConfig, Violation, display_user};
use crate::core::{DetectionEvent, RuleType, Severity};

/// Group a reported platform into its OS family, so "iPhone" and "iOS"
/// compare equal. Unrecognised platforms are returned unchanged.
pub fn platform_family(platform: &str) -> String {
    let p = platform.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| p.contains(n));

    let family = if has(&["ios", "iphone", "ipad"]) {
        "iOS"
    } else if has(&["android"]) {
        "Android"
    } else if has(&["macos", "osx", "mac os"]) {
        "macOS"
    } else if has(&["windows"]) {
        "Windows"
    } else if has(&["linux", "ubuntu", "debian", "fedora", "centos"]) {
        "Linux"
    } else if has(&["chrome", "firefox", "safari", "edge", "web"]) {
        "Web"
    } else if has(&["tv", "roku", "fire", "tizen"]) {
        "SmartTV"
    } else if has(&["xbox", "playstation", "ps4", "ps5"]) {
        "Console"
    } else {
        return platform.trim().to_string();
    };
    family.to_string()
}

fn field(value: &Option<String>) -> &str {
    value.as_deref().map(str::trim).unwrap_or("")
}

/// Whether the event reports a platform or player at all.
pub fn has_agent(event: &DetectionEvent) -> bool {
    !field(&event.platform).is_empty() || !field(&event.player).is_empty()
}

fn agent_json(event: &DetectionEvent) -> serde_json::Value {
    json!({
        "platform": event.platform,
        "player": event.player,
        "device_id": event.device_id,
        "timestamp": event.timestamp,
    })
}

/// Flag clients whose platform, player or device matches a suspicious pattern.
pub fn check_suspicious_agent(event: &DetectionEvent, config: &UserAgentAnomalyConfig) -> Option<Violation> {
    let agent = format!(
        "{} {} {}",
        field(&event.platform),
        field(&event.player),
        field(&event.device_id)
    )
    .to_ascii_lowercase();
    let pattern = config
        .suspicious_patterns
        .iter()
        .map(|p| p.trim())
        .find(|p| !p.is_empty() && agent.contains(&p.to_ascii_lowercase()))?;

    Some(Violation {
        rule_type: RuleType::UserAgentAnomaly,
        severity: Severity::Critical,
        title: "Suspicious client detected".to_string(),
        description: format!(
            "User {} is using a client matching '{pattern}': {}/{}",
            display_user(event),
            field(&event.platform),
            field(&event.player)
        ),
        evidence: json!({
            "anomaly": "suspicious_pattern",
            "matched_pattern": pattern,
            "current": agent_json(event),
        }),
    })
}

/// Compare the event's client with the user's previous session.
///
/// Suspicious clients are flagged regardless of history. Otherwise, within
/// `window_minutes` of the previous session, a change of platform family is
/// a platform switch and any other change of platform, player or device is
/// a new client.
pub fn check_user_agent_anomaly(
    event: &DetectionEvent,
    config: &UserAgentAnomalyConfig,
    prior: Option<&DetectionEvent>,
) -> Option<Violation> {
    if !has_agent(event) {
        return None;
    }
    if let Some(v) = check_suspicious_agent(event, config) {
        return Some(v);
    }

    let prior = prior.filter(|p| has_agent(p))?;
    let elapsed = (event.timestamp - prior.timestamp).abs();
    if !TimeDelta::try_minutes(config.window_minutes).is_some_and(|window| elapsed <= window) {
        return None;
    }
    let evidence = |anomaly: &str| {
        json!({
            "anomaly": anomaly,
            "current": agent_json(event),
            "previous": agent_json(prior),
            "minutes_since_previous": elapsed.num_seconds() as f64 / 60.0,
        })
    };

    let (current, previous) = (field(&event.platform), field(&prior.platform));
    if config.alert_on_platform_switch && !current.is_empty() && !previous.is_empty() {
        let (to, from) = (platform_family(current), platform_family(previous));
        if to != from {
            return Some(Violation {
                rule_type: RuleType::UserAgentAnomaly,
                severity: config.severity,
                title: "Rapid platform switch".to_string(),
                description: format!(
                    "User {} switched from {from} to {to} in {} minutes",
                    display_user(event),
                    elapsed.num_minutes()
                ),
                evidence: evidence("platform_switch"),
            });
        }
    }

    let combo = |e: &DetectionEvent| (field(&e.platform).to_string(), field(&e.player).to_string(), field(&e.device_id).to_string());
    if config.alert_on_new_agent && combo(event) != combo(prior) {
        return Some(Violation {
            rule_type: RuleType::UserAgentAnomaly,
            severity: Severity::Info,
            title: "New client detected".to_string(),
            description: format!(
                "User {} started using {}/{} within {} minutes of {}/{}",
                display_user(event),
                field(&event.platform),
                field(&event.player),
                elapsed.num_minutes(),
                field(&prior.platform),
                field(&prior.player)
            ),
            evidence: evidence("new_agent"),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SessionState;
    use crate::store::memory::tests::session;

    fn client(key: &str, secs: i64, platform: &str, player: &str) -> DetectionEvent {
        let mut e = session(1, key, secs, SessionState::Start);
        e.platform = Some(platform.to_string());
        e.player = Some(player.to_string());
        e
    }

    #[test]
    fn platform_families() {
        assert_eq!(platform_family("iPhone"), "iOS");
        assert_eq!(platform_family("iOS"), "iOS");
        assert_eq!(platform_family("Android TV"), "Android");
        assert_eq!(platform_family("Windows 11"), "Windows");
        assert_eq!(platform_family("Roku"), "SmartTV");
        assert_eq!(platform_family("Amiga"), "Amiga");
    }

    #[test]
    fn suspicious_client_is_critical_without_history() {
        let event = client("s", 0, "Linux", "python-requests/2.31");
        let v = check_user_agent_anomaly(&event, &UserAgentAnomalyConfig::default(), None).unwrap();
        assert_eq!(v.severity, Severity::Critical);
        assert_eq!(v.evidence["anomaly"], "suspicious_pattern");
        assert_eq!(v.evidence["matched_pattern"], "python");
    }

    #[test]
    fn platform_switch_within_window() {
        let prior = client("a", 0, "iPhone", "Plex for iOS");
        let event = client("b", 300, "Android", "Plex for Android");
        let v = check_user_agent_anomaly(&event, &UserAgentAnomalyConfig::default(), Some(&prior)).unwrap();
        assert_eq!(v.severity, Severity::Warning);
        assert_eq!(v.evidence["anomaly"], "platform_switch");
        assert_eq!(v.evidence["minutes_since_previous"], 5.0);
    }

    #[test]
    fn same_family_new_player_is_info() {
        let prior = client("a", 0, "iPhone", "Plex for iOS");
        let event = client("b", 60, "iPad", "Infuse");
        let v = check_user_agent_anomaly(&event, &UserAgentAnomalyConfig::default(), Some(&prior)).unwrap();
        assert_eq!(v.severity, Severity::Info);
        assert_eq!(v.evidence["anomaly"], "new_agent");
    }

    #[test]
    fn outside_window_or_unchanged_is_clean() {
        let config = UserAgentAnomalyConfig::default();
        let prior = client("a", 0, "iPhone", "Plex for iOS");
        assert!(check_user_agent_anomaly(&client("b", 31 * 60, "Android", "Plex"), &config, Some(&prior)).is_none());
        assert!(check_user_agent_anomaly(&client("b", 60, "iPhone", "Plex for iOS"), &config, Some(&prior)).is_none());
        assert!(check_user_agent_anomaly(&client("b", 60, "Android", "Plex"), &config, None).is_none());
    }

    #[test]
    fn switches_can_be_turned_off() {
        let config = UserAgentAnomalyConfig {
            alert_on_new_agent: false,
            alert_on_platform_switch: false,
            ..Default::default()
        };
        let prior = client("a", 0, "iPhone", "Plex for iOS");
        assert!(check_user_agent_anomaly(&client("b", 60, "Android", "Plex"), &config, Some(&prior)).is_none());
    }

    #[test]
    fn events_without_client_info_are_skipped() {
        let bare = session(1, "s", 0, SessionState::Start);
        assert!(!has_agent(&bare));
        let prior = client("a", 0, "iPhone", "Plex for iOS");
        assert!(check_user_agent_anomaly(&bare, &UserAgentAnomalyConfig::default(), Some(&prior)).is_none());

        // A prior session without client info is not a baseline.
        let event = client("b", 60, "Android", "Plex");
        assert!(check_user_agent_anomaly(&event, &UserAgentAnomalyConfig::default(), Some(&bare)).is_none());
    }
}
