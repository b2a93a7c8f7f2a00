use chrono::{DateTime, Utc};
use serde_json::json;

use super::rules::{ImpossibleTravelConfig, SimultaneousLocationsConfig, Violation, display_user, window_start};
use crate::core::{DetectionEvent, GeoPoint, RuleType, Severity};

/// Required average speed to cover `distance_km` in `elapsed_hours`.
/// Zero elapsed time over a non-zero distance is infinitely fast.
pub fn required_speed_kmh(distance_km: f64, elapsed_hours: f64) -> f64 {
    if elapsed_hours <= 0.0 {
        if distance_km > 0.0 { f64::INFINITY } else { 0.0 }
    } else {
        distance_km / elapsed_hours
    }
}

/// Severity for a speed over the limit: up to twice the limit is a warning.
pub fn travel_severity(speed_kmh: f64, max_speed_kmh: f64) -> Severity {
    if speed_kmh / max_speed_kmh > 2.0 {
        Severity::Critical
    } else {
        Severity::Warning
    }
}

fn location_json(event: &DetectionEvent, point: GeoPoint) -> serde_json::Value {
    json!({
        "lat": point.lat,
        "lon": point.lon,
        "city": event.city,
        "country": event.country,
        "ip_address": event.ip_address,
        "timestamp": event.timestamp,
    })
}

/// Compare the event against the user's last located session and flag
/// travel faster than `max_speed_kmh`.
pub fn check_impossible_travel(
    event: &DetectionEvent,
    config: &ImpossibleTravelConfig,
    prior: Option<&DetectionEvent>,
) -> Option<Violation> {
    let prior = prior?;
    let to = event.known_location()?;
    let from = prior.known_location()?;

    let distance = from.distance_km(&to);
    if distance < config.min_distance_km {
        return None;
    }

    let elapsed = (event.timestamp - prior.timestamp).abs();
    let elapsed_hours = elapsed.num_milliseconds() as f64 / 3_600_000.0;
    let speed = required_speed_kmh(distance, elapsed_hours);
    if speed <= config.max_speed_kmh {
        return None;
    }

    let severity = travel_severity(speed, config.max_speed_kmh);
    let speed_evidence = if speed.is_finite() {
        json!(speed.round())
    } else {
        serde_json::Value::Null
    };
    let place = |e: &DetectionEvent| {
        e.city
            .clone()
            .or_else(|| e.country.clone())
            .unwrap_or_else(|| "an unknown place".to_string())
    };

    Some(Violation {
        rule_type: RuleType::ImpossibleTravel,
        severity,
        title: "Impossible travel detected".to_string(),
        description: format!(
            "User {} moved {:.0} km from {} to {} in {} minutes",
            display_user(event),
            distance,
            place(prior),
            place(event),
            elapsed.num_minutes()
        ),
        evidence: json!({
            "from": location_json(prior, from),
            "to": location_json(event, to),
            "distance_km": (distance * 10.0).round() / 10.0,
            "elapsed_minutes": elapsed.num_minutes(),
            "speed_kmh": speed_evidence,
            "instantaneous": !speed.is_finite(),
            "max_speed_kmh": config.max_speed_kmh,
        }),
    })
}

/// Start of the window in which other sessions count as simultaneous.
pub fn simultaneous_window_start(
    event: &DetectionEvent,
    config: &SimultaneousLocationsConfig,
) -> Option<DateTime<Utc>> {
    window_start(event.timestamp, config.window_minutes)
}

/// Flag other live sessions of the same user that are far away from this one.
pub fn check_simultaneous_locations(
    event: &DetectionEvent,
    config: &SimultaneousLocationsConfig,
    others: &[DetectionEvent],
) -> Option<Violation> {
    let here = event.known_location()?;

    let mut far: Vec<(f64, &DetectionEvent, GeoPoint)> = others
        .iter()
        .filter(|o| o.user_id == event.user_id && o.session_key != event.session_key)
        .filter_map(|o| o.known_location().map(|p| (here.distance_km(&p), o, p)))
        .filter(|(d, _, _)| *d >= config.min_distance_km)
        .collect();
    if far.is_empty() {
        return None;
    }
    far.sort_by(|a, b| b.0.total_cmp(&a.0));

    let max_distance = far[0].0;
    let sessions: Vec<serde_json::Value> = far
        .iter()
        .map(|(d, o, p)| {
            json!({
                "session_key": o.session_key,
                "distance_km": (d * 10.0).round() / 10.0,
                "location": location_json(o, *p),
            })
        })
        .collect();

    Some(Violation {
        rule_type: RuleType::SimultaneousLocations,
        severity: config.severity,
        title: "Simultaneous streams from distant locations".to_string(),
        description: format!(
            "User {} is streaming from {} locations at once, up to {:.0} km apart",
            display_user(event),
            far.len() + 1,
            max_distance
        ),
        evidence: json!({
            "location": location_json(event, here),
            "other_sessions": sessions,
            "max_distance_km": (max_distance * 10.0).round() / 10.0,
            "window_minutes": config.window_minutes,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SessionState;
    use crate::store::memory::tests::session;

    const NYC: GeoPoint = GeoPoint { lat: 40.7128, lon: -74.0060 };
    const LONDON: GeoPoint = GeoPoint { lat: 51.5074, lon: -0.1278 };

    fn located(key: &str, secs: i64, point: GeoPoint) -> DetectionEvent {
        let mut e = session(1, key, secs, SessionState::Start);
        e.location = Some(point);
        e
    }

    fn config(max_speed_kmh: f64) -> ImpossibleTravelConfig {
        ImpossibleTravelConfig {
            max_speed_kmh,
            min_distance_km: 100.0,
        }
    }

    #[test]
    fn nyc_to_london_in_an_hour_is_critical() {
        let prior = located("a", 0, NYC);
        let event = located("b", 3600, LONDON);
        let v = check_impossible_travel(&event, &config(800.0), Some(&prior)).unwrap();
        assert_eq!(v.severity, Severity::Critical);
        let speed = v.evidence["speed_kmh"].as_f64().unwrap();
        assert!((speed - 5570.0).abs() < 20.0, "speed {speed}");
        assert_eq!(v.evidence["elapsed_minutes"], 60);
    }

    #[test]
    fn alert_iff_speed_over_limit() {
        let prior = located("a", 0, NYC);
        let distance = NYC.distance_km(&LONDON);
        let max = 900.0;
        // Pick elapsed times giving ratios on both sides of 1 and 2.
        for ratio in [0.5, 0.99, 1.01, 1.5, 1.99, 2.01, 3.0, 7.0] {
            let hours = distance / (max * ratio);
            let secs = (hours * 3600.0).round() as i64;
            let event = located("b", secs, LONDON);
            let v = check_impossible_travel(&event, &config(max), Some(&prior));
            let actual = distance / (secs as f64 / 3600.0);
            assert_eq!(v.is_some(), actual > max, "ratio {ratio}");
            if let Some(v) = v {
                let expected = if actual > 2.0 * max { Severity::Critical } else { Severity::Warning };
                assert_eq!(v.severity, expected, "ratio {ratio}");
            }
        }
    }

    #[test]
    fn short_hops_are_ignored() {
        let prior = located("a", 0, GeoPoint::new(40.7128, -74.0060));
        // Newark, about 15 km away, one second later.
        let event = located("b", 1, GeoPoint::new(40.7357, -74.1724));
        assert!(check_impossible_travel(&event, &config(900.0), Some(&prior)).is_none());
    }

    #[test]
    fn missing_data_is_not_a_violation() {
        let prior = located("a", 0, NYC);
        let mut unresolved = located("b", 60, LONDON);
        unresolved.location = None;
        assert!(check_impossible_travel(&unresolved, &config(900.0), Some(&prior)).is_none());

        let sentinel = located("b", 60, GeoPoint::new(0.0, 0.0));
        assert!(check_impossible_travel(&sentinel, &config(900.0), Some(&prior)).is_none());

        assert!(check_impossible_travel(&located("b", 60, LONDON), &config(900.0), None).is_none());
    }

    #[test]
    fn zero_elapsed_is_critical() {
        let prior = located("a", 0, NYC);
        let event = located("b", 0, LONDON);
        let v = check_impossible_travel(&event, &config(900.0), Some(&prior)).unwrap();
        assert_eq!(v.severity, Severity::Critical);
        assert!(v.evidence["speed_kmh"].is_null());
        assert_eq!(v.evidence["instantaneous"], true);
    }

    #[test]
    fn out_of_order_events_use_absolute_time() {
        let prior = located("a", 3600, NYC);
        let event = located("b", 0, LONDON);
        let v = check_impossible_travel(&event, &config(800.0), Some(&prior)).unwrap();
        assert_eq!(v.evidence["elapsed_minutes"], 60);
    }

    #[test]
    fn required_speed_edges() {
        assert_eq!(required_speed_kmh(0.0, 0.0), 0.0);
        assert!(required_speed_kmh(10.0, 0.0).is_infinite());
        assert_eq!(required_speed_kmh(100.0, 2.0), 50.0);
    }

    #[test]
    fn simultaneous_far_sessions() {
        let event = located("here", 100, NYC);
        let others = vec![
            located("here", 50, LONDON),
            located("near", 50, GeoPoint::new(40.73, -73.99)),
            located("far", 60, LONDON),
        ];
        let v = check_simultaneous_locations(&event, &SimultaneousLocationsConfig::default(), &others).unwrap();
        assert_eq!(v.severity, Severity::Critical);
        let sessions = v.evidence["other_sessions"].as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["session_key"], "far");
    }

    #[test]
    fn simultaneous_nearby_only_is_clean() {
        let event = located("here", 100, NYC);
        let others = vec![located("near", 50, GeoPoint::new(40.73, -73.99))];
        assert!(check_simultaneous_locations(&event, &SimultaneousLocationsConfig::default(), &others).is_none());

        let mut unlocated = event.clone();
        unlocated.location = None;
        assert!(
            check_simultaneous_locations(&unlocated, &SimultaneousLocationsConfig::default(), &[located("far", 60, LONDON)])
                .is_none()
        );
    }
}
