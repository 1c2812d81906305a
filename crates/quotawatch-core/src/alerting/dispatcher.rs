//! Alert dispatch: rule lookup, cooldown, channel fan-out and bookkeeping

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::models::{AlertType, DeliveryStatus, MonitoredTarget, NewAlertLog, TargetKind};

use super::factory::NotifierFactory;
use super::guard::{rule_lock_key, CooldownGuard, KeyedLocks};
use super::message::{alert_title, with_dedup_marker};
use super::metrics::{AlertMetrics, NoopMetrics};
use super::repository::AlertStore;

const TEST_TITLE: &str = "Test Notification";
const TEST_MESSAGE: &str = "This is a test notification from Quota Watch.\n\
If you received it, the channel is configured correctly.";

/// An alert about one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    /// Alert type, selects the rules
    pub alert_type: AlertType,
    /// Kind of the target
    pub target_kind: TargetKind,
    /// Target id
    pub target_id: i64,
    /// Target name used in the title
    pub target_name: String,
    /// Rendered message body
    pub message: String,
    /// Key written into the log for later suppression
    pub dedup_key: Option<String>,
}

impl Alert {
    /// Create an alert about `target`
    pub fn new(alert_type: AlertType, target: &MonitoredTarget, message: impl Into<String>) -> Self {
        Self {
            alert_type,
            target_kind: target.kind,
            target_id: target.id,
            target_name: target.name.clone(),
            message: message.into(),
            dedup_key: None,
        }
    }

    /// Attach a dedup key
    pub fn with_dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Message as persisted in the log
    pub fn logged_message(&self) -> String {
        match &self.dedup_key {
            Some(key) => with_dedup_marker(&self.message, key),
            None => self.message.clone(),
        }
    }
}

/// What one dispatch did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    /// Rules that completed a channel pass
    pub rules_fired: usize,
    /// Rules skipped by the guard
    pub rules_suppressed: usize,
    /// Channels that accepted the message
    pub sent: usize,
    /// Channels that reported an error
    pub failed: usize,
    /// Channels missing, disabled or misconfigured
    pub skipped_channels: usize,
}

impl DispatchSummary {
    pub(crate) fn merge(&mut self, other: DispatchSummary) {
        self.rules_fired += other.rules_fired;
        self.rules_suppressed += other.rules_suppressed;
        self.sent += other.sent;
        self.failed += other.failed;
        self.skipped_channels += other.skipped_channels;
    }
}

/// Fans alerts out to the channels of every matching rule
pub struct AlertDispatcher {
    store: Arc<dyn AlertStore>,
    factory: NotifierFactory,
    guard: CooldownGuard,
    locks: KeyedLocks,
    metrics: Arc<dyn AlertMetrics>,
}

impl AlertDispatcher {
    /// Create a dispatcher with no-op metrics
    pub fn new(store: Arc<dyn AlertStore>, factory: NotifierFactory, guard: CooldownGuard) -> Self {
        Self {
            store,
            factory,
            guard,
            locks: KeyedLocks::new(),
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Use the given metrics sink
    pub fn with_metrics(mut self, metrics: Arc<dyn AlertMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Share a lock table with other components
    pub fn with_locks(mut self, locks: KeyedLocks) -> Self {
        self.locks = locks;
        self
    }

    /// Backing store
    pub fn store(&self) -> &Arc<dyn AlertStore> {
        &self.store
    }

    /// Cooldown and dedup guard
    pub fn guard(&self) -> &CooldownGuard {
        &self.guard
    }

    /// Lock table
    pub fn locks(&self) -> &KeyedLocks {
        &self.locks
    }

    /// Metrics sink
    pub fn metrics(&self) -> &Arc<dyn AlertMetrics> {
        &self.metrics
    }

    /// Deliver an alert through every enabled rule of its type.
    ///
    /// Never fails: storage and channel errors are logged and recorded as
    /// failed deliveries.
    pub async fn trigger_alert(&self, alert: &Alert) -> DispatchSummary {
        let mut summary = DispatchSummary::default();

        let rules = match self.store.find_enabled_by_type(alert.alert_type).await {
            Ok(rules) => rules,
            Err(e) => {
                error!(alert_type = %alert.alert_type, error = %e, "Failed to load alert rules");
                return summary;
            }
        };

        if rules.is_empty() {
            debug!(alert_type = %alert.alert_type, "No enabled rules for alert");
        }

        for rule in &rules {
            summary.merge(self.dispatch_to_rule(rule.id, alert).await);
        }

        summary
    }

    /// Deliver an alert through a single rule.
    ///
    /// Firings of one rule are serialized and the rule is re-read under the
    /// lock, so two concurrent callers cannot both pass its cooldown.
    pub async fn dispatch_to_rule(&self, rule_id: i64, alert: &Alert) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        let _rule_lock = self.locks.lock(&rule_lock_key(rule_id)).await;

        let rule = match self.store.get_rule(rule_id).await {
            Ok(Some(rule)) => rule,
            Ok(None) => {
                debug!(rule_id, "Rule disappeared before dispatch");
                return summary;
            }
            Err(e) => {
                error!(rule_id, error = %e, "Failed to load alert rule");
                return summary;
            }
        };

        if rule.alert_type != alert.alert_type {
            warn!(
                rule_id,
                rule_type = %rule.alert_type,
                alert_type = %alert.alert_type,
                "Rule type does not match alert"
            );
            return summary;
        }

        let verdict = self.guard.decide(&rule, None, Utc::now());
        if !verdict.is_allowed() {
            debug!(rule_id, verdict = ?verdict, "Rule suppressed");
            self.metrics.suppressed(alert.alert_type, verdict.reason());
            summary.rules_suppressed = 1;
            return summary;
        }

        let title = alert_title(alert.alert_type, &alert.target_name);
        let logged_message = alert.logged_message();

        for channel_id in rule.channel_ids() {
            let channel = match self.store.get_channel(channel_id).await {
                Ok(Some(channel)) => channel,
                Ok(None) => {
                    warn!(rule_id, channel_id, "Notify channel not found");
                    summary.skipped_channels += 1;
                    continue;
                }
                Err(e) => {
                    error!(rule_id, channel_id, error = %e, "Failed to load notify channel");
                    summary.skipped_channels += 1;
                    continue;
                }
            };

            if !channel.enabled {
                debug!(rule_id, channel_id, "Notify channel disabled");
                summary.skipped_channels += 1;
                continue;
            }

            let notifier = match self.factory.create(&channel) {
                Ok(notifier) => notifier,
                Err(e) => {
                    warn!(rule_id, channel_id, error = %e, "Cannot build notifier");
                    summary.skipped_channels += 1;
                    continue;
                }
            };

            let status = match notifier.send(&title, &alert.message).await {
                Ok(()) => {
                    summary.sent += 1;
                    DeliveryStatus::Sent
                }
                Err(e) => {
                    warn!(
                        rule_id,
                        channel_id,
                        channel_type = notifier.channel_type(),
                        error = %e,
                        "Notification failed"
                    );
                    summary.failed += 1;
                    DeliveryStatus::Failed
                }
            };
            self.metrics
                .notification(alert.alert_type, notifier.channel_type(), status);

            let log = NewAlertLog {
                rule_id: rule.id,
                rule_name: rule.name.clone(),
                alert_type: alert.alert_type,
                message: logged_message.clone(),
                target_kind: alert.target_kind,
                target_id: alert.target_id,
                target_name: alert.target_name.clone(),
                channel_id,
                status,
                dedup_key: alert.dedup_key.clone(),
                created_at: Utc::now(),
            };

            if let Err(e) = self.store.append_log(&log).await {
                error!(rule_id, channel_id, error = %e, "Failed to record alert log");
            }
        }

        if let Err(e) = self.store.update_last_alert_at(rule.id, Utc::now()).await {
            error!(rule_id, error = %e, "Failed to update rule last alert time");
        }

        info!(
            rule_id,
            alert_type = %alert.alert_type,
            target_kind = %alert.target_kind,
            target_id = alert.target_id,
            sent = summary.sent,
            failed = summary.failed,
            "Alert dispatched"
        );

        summary.rules_fired = 1;
        summary
    }

    /// Send a fixed test message through one channel, reporting any error
    pub async fn test_channel(&self, channel_id: i64) -> Result<()> {
        let channel = self
            .store
            .get_channel(channel_id)
            .await?
            .ok_or_else(|| Error::not_found("notify channel", channel_id))?;

        let notifier = self.factory.create(&channel)?;
        notifier.send(TEST_TITLE, TEST_MESSAGE).await?;

        info!(channel_id, channel_type = notifier.channel_type(), "Test notification sent");
        Ok(())
    }
}
