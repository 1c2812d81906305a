//! Quota threshold evaluation

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::models::{AlertType, MonitoredTarget};

use super::dispatcher::{Alert, AlertDispatcher, DispatchSummary};
use super::guard::target_lock_key;
use super::message::{quota_exceeded_message, quota_warning_message, warning_dedup_key};

/// Result of evaluating one target
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QuotaCheck {
    /// Usage percentage, `None` for unlimited targets
    pub percent: Option<f64>,
    /// Warning rules that fired
    pub warnings_fired: usize,
    /// Whether this check flipped `quota_exceeded`
    pub exceeded: bool,
    /// Aggregate delivery outcome
    pub summary: DispatchSummary,
}

/// Evaluates quota_exceeded and quota_warning conditions
pub struct QuotaEvaluator {
    dispatcher: Arc<AlertDispatcher>,
}

impl QuotaEvaluator {
    /// Create an evaluator that dispatches through `dispatcher`
    pub fn new(dispatcher: Arc<AlertDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Evaluate warning thresholds and the exceeded transition for a target
    pub async fn check_quota(&self, target: &MonitoredTarget) -> QuotaCheck {
        let Some(percent) = target.usage_percent() else {
            return QuotaCheck::default();
        };

        let mut check = QuotaCheck {
            percent: Some(percent),
            ..QuotaCheck::default()
        };

        self.check_warnings(target, &mut check).await;

        if target.quota_reached() && !target.quota_exceeded {
            self.check_exceeded(target, &mut check).await;
        }

        check
    }

    async fn check_warnings(&self, target: &MonitoredTarget, check: &mut QuotaCheck) {
        let store = self.dispatcher.store();

        let rules = match store.find_enabled_by_type(AlertType::QuotaWarning).await {
            Ok(rules) => rules,
            Err(e) => {
                error!(target_kind = %target.kind, target_id = target.id, error = %e, "Failed to load warning rules");
                return;
            }
        };

        if rules.is_empty() {
            return;
        }

        // Held until the log rows are written so a concurrent pass over the
        // same target sees them in its dedup lookup.
        let _target_lock = self
            .dispatcher
            .locks()
            .lock(&target_lock_key(target.kind, target.id, AlertType::QuotaWarning))
            .await;

        // The caller's copy may predate a reset that ran after it was listed.
        let current = match store.get_target(target.kind, target.id).await {
            Ok(Some(current)) => current,
            Ok(None) => return,
            Err(e) => {
                error!(target_kind = %target.kind, target_id = target.id, error = %e, "Failed to re-read target");
                return;
            }
        };
        let Some(percent) = current.usage_percent() else {
            return;
        };
        let target = &current;

        let now = Utc::now();

        for rule in rules {
            let threshold = match rule.condition() {
                Ok(condition) => condition.warning_threshold(),
                Err(e) => {
                    warn!(rule_id = rule.id, error = %e, "Invalid rule condition");
                    continue;
                }
            };

            if percent < threshold as f64 {
                continue;
            }

            let key = warning_dedup_key(target.kind, target.id, threshold);

            let verdict = match self
                .dispatcher
                .guard()
                .check(store.as_ref(), &rule, Some(&key), now)
                .await
            {
                Ok(verdict) => verdict,
                Err(e) => {
                    error!(rule_id = rule.id, error = %e, "Dedup lookup failed");
                    continue;
                }
            };

            if !verdict.is_allowed() {
                debug!(rule_id = rule.id, key = %key, verdict = ?verdict, "Quota warning suppressed");
                self.dispatcher
                    .metrics()
                    .suppressed(AlertType::QuotaWarning, verdict.reason());
                continue;
            }

            let alert = Alert::new(
                AlertType::QuotaWarning,
                target,
                quota_warning_message(target, percent),
            )
            .with_dedup_key(key);

            let summary = self.dispatcher.dispatch_to_rule(rule.id, &alert).await;
            check.warnings_fired += summary.rules_fired;
            check.summary.merge(summary);
        }
    }

    async fn check_exceeded(&self, target: &MonitoredTarget, check: &mut QuotaCheck) {
        let transitioned = match self
            .dispatcher
            .store()
            .mark_quota_exceeded(target.kind, target.id)
            .await
        {
            Ok(transitioned) => transitioned,
            Err(e) => {
                error!(target_kind = %target.kind, target_id = target.id, error = %e, "Failed to flag quota exceeded");
                return;
            }
        };

        if !transitioned {
            debug!(target_kind = %target.kind, target_id = target.id, "Quota already flagged as exceeded");
            return;
        }

        info!(
            target_kind = %target.kind,
            target_id = target.id,
            used = target.quota_used,
            quota = target.traffic_quota,
            "Quota exceeded"
        );

        check.exceeded = true;
        let alert = Alert::new(
            AlertType::QuotaExceeded,
            target,
            quota_exceeded_message(target),
        );
        check.summary.merge(self.dispatcher.trigger_alert(&alert).await);
    }
}
