use std::sync::Arc;

use crate::config::TrustConfig;
use crate::core::{Severity, TrustScore, clamp_score};
use crate::store::{Penalty, StoreResult, TrustStore};

/// Apply a penalty to a score, clamped to the valid range.
pub fn penalized(score: i32, penalty: i32) -> i32 {
    clamp_score(score as i64 - penalty as i64)
}

/// Turns violation severities into trust penalties and persists them.
///
/// The read-modify-write happens inside [`TrustStore::apply_penalty`], so a
/// scorer holds no per-user state and can be shared freely.
#[derive(Clone)]
pub struct TrustScorer {
    store: Arc<dyn TrustStore>,
    config: TrustConfig,
}

impl TrustScorer {
    pub fn new(store: Arc<dyn TrustStore>, config: TrustConfig) -> Self {
        Self { store, config }
    }

    pub fn penalty_for(&self, severity: Severity) -> i32 {
        let penalty = match severity {
            Severity::Info => self.config.info_penalty,
            Severity::Warning => self.config.warning_penalty,
            Severity::Critical => self.config.critical_penalty,
        };
        penalty.max(0)
    }

    /// Lower the user's score by the penalty for `severity`. Never raises it.
    pub async fn penalize(&self, user_id: i64, username: &str, severity: Severity) -> StoreResult<TrustScore> {
        let penalty = Penalty {
            user_id,
            username: username.to_string(),
            amount: self.penalty_for(severity),
            restrict_below: self.config.restrict_below,
        };
        self.store.apply_penalty(&penalty).await
    }

    pub async fn get_score(&self, user_id: i64) -> StoreResult<TrustScore> {
        self.store.get_trust_score(user_id).await
    }

    pub async fn list_low_trust(&self, threshold: i32) -> StoreResult<Vec<TrustScore>> {
        self.store.list_low_trust_users(threshold).await
    }

    /// One recovery tick: raise every score below 100 by the configured amount.
    pub async fn recover(&self) -> StoreResult<usize> {
        self.store
            .recover_trust_scores(self.config.recovery_amount.max(0), self.config.restrict_below)
            .await
    }
}
