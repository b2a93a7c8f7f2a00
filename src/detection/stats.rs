use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::core::{RuleType, Severity};
use crate::store::{AlertQuery, AlertStore, StoreError, StoreResult};

/// Aggregate alert counts for dashboards.
///
/// Every bucket is queried independently. A bucket whose query fails is
/// `None` and the whole report is marked `degraded`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertStats {
    pub total: Option<usize>,
    pub unacknowledged: Option<usize>,
    pub by_severity: BTreeMap<Severity, Option<usize>>,
    pub by_rule_type: BTreeMap<RuleType, Option<usize>>,
    pub degraded: bool,
}

async fn bounded<F>(timeout: Duration, bucket: &str, fut: F) -> Option<usize>
where
    F: Future<Output = StoreResult<usize>>,
{
    let result = match tokio::time::timeout(timeout, fut).await {
        Ok(r) => r,
        Err(_) => Err(StoreError::Timeout(timeout)),
    };
    match result {
        Ok(count) => Some(count),
        Err(e) => {
            warn!(bucket, "Alert count failed: {e}");
            None
        }
    }
}

pub async fn collect_alert_stats(store: &dyn AlertStore, timeout: Duration) -> AlertStats {
    let total = bounded(timeout, "total", store.get_alert_count(&AlertQuery::default())).await;

    let unacked = AlertQuery {
        acknowledged: Some(false),
        ..Default::default()
    };
    let unacknowledged = bounded(timeout, "unacknowledged", store.get_alert_count(&unacked)).await;

    let mut by_severity = BTreeMap::new();
    for severity in Severity::ALL {
        let q = AlertQuery::with_severity(severity);
        by_severity.insert(severity, bounded(timeout, severity.as_str(), store.get_alert_count(&q)).await);
    }

    let mut by_rule_type = BTreeMap::new();
    for rule_type in RuleType::ALL {
        let q = AlertQuery::with_rule_type(rule_type);
        by_rule_type.insert(rule_type, bounded(timeout, rule_type.as_str(), store.get_alert_count(&q)).await);
    }

    let degraded = total.is_none()
        || unacknowledged.is_none()
        || by_severity.values().any(Option::is_none)
        || by_rule_type.values().any(Option::is_none);

    AlertStats {
        total,
        unacknowledged,
        by_severity,
        by_rule_type,
        degraded,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::Alert;
    use crate::store::MemoryStore;
    use crate::store::test_support::make_alert;
    use async_trait::async_trait;

    /// Alert store whose count fails for one severity bucket.
    pub struct FlakyCounts {
        pub inner: MemoryStore,
        pub failing: Severity,
    }

    #[async_trait]
    impl AlertStore for FlakyCounts {
        async fn save_alert(&self, alert: &Alert) -> StoreResult<i64> {
            self.inner.save_alert(alert).await
        }
        async fn get_alert(&self, id: i64) -> StoreResult<Option<Alert>> {
            self.inner.get_alert(id).await
        }
        async fn list_alerts(&self, query: &AlertQuery) -> StoreResult<Vec<Alert>> {
            self.inner.list_alerts(query).await
        }
        async fn acknowledge_alert(&self, id: i64, by: &str) -> StoreResult<Alert> {
            self.inner.acknowledge_alert(id, by).await
        }
        async fn get_alert_count(&self, query: &AlertQuery) -> StoreResult<usize> {
            if query.severities == [self.failing] {
                return Err(StoreError::Query("disk on fire".into()));
            }
            self.inner.get_alert_count(query).await
        }
    }

    async fn seed(store: &dyn AlertStore) {
        store.save_alert(&make_alert(RuleType::ImpossibleTravel, Severity::Critical, 1, 0)).await.unwrap();
        store.save_alert(&make_alert(RuleType::ConcurrentStreams, Severity::Warning, 1, 1)).await.unwrap();
        store.save_alert(&make_alert(RuleType::ConcurrentStreams, Severity::Warning, 2, 2)).await.unwrap();
        store.acknowledge_alert(1, "admin").await.unwrap();
    }

    #[tokio::test]
    async fn counts_every_bucket() {
        let store = MemoryStore::new();
        seed(&store).await;
        let stats = collect_alert_stats(&store, Duration::from_secs(1)).await;
        assert!(!stats.degraded);
        assert_eq!(stats.total, Some(3));
        assert_eq!(stats.unacknowledged, Some(2));
        assert_eq!(stats.by_severity[&Severity::Warning], Some(2));
        assert_eq!(stats.by_severity[&Severity::Info], Some(0));
        assert_eq!(stats.by_rule_type[&RuleType::ConcurrentStreams], Some(2));
        assert_eq!(stats.by_rule_type[&RuleType::GeoRestriction], Some(0));
    }

    #[tokio::test]
    async fn failing_bucket_degrades_without_failing() {
        let store = FlakyCounts {
            inner: MemoryStore::new(),
            failing: Severity::Critical,
        };
        seed(&store).await;
        let stats = collect_alert_stats(&store, Duration::from_secs(1)).await;
        assert!(stats.degraded);
        assert_eq!(stats.by_severity[&Severity::Critical], None);
        assert_eq!(stats.by_severity[&Severity::Warning], Some(2));
        assert_eq!(stats.total, Some(3));

        let json = serde_json::to_value(&stats).unwrap();
        assert!(json["by_severity"]["critical"].is_null());
        assert_eq!(json["by_rule_type"]["impossible_travel"], 1);
    }
}
