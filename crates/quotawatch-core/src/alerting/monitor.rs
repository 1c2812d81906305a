//! Offline detection, periodic scans and housekeeping
//!
//! [`QuotaMonitor`] is the entry point the rest of the panel talks to. Inbound
//! events (traffic counters written, status changed) call into it directly;
//! [`QuotaMonitor::run`] drives the periodic passes until cancelled.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Utc};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AlertingConfig;
use crate::error::{Error, Result};
use crate::models::{AlertRuleInput, AlertType, LivenessStatus, MonitoredTarget, TargetKind};

use super::dispatcher::{Alert, AlertDispatcher, DispatchSummary};
use super::evaluator::{QuotaCheck, QuotaEvaluator};
use super::message::{heartbeat_timeout_message, node_offline_message};
use super::repository::AlertStore;

/// Minimum age of the previous reset before a target is reset again
pub const RESET_GUARD_DAYS: i64 = 28;

/// Outcome of a full quota scan
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScanReport {
    /// Metered targets evaluated
    pub evaluated: usize,
    /// Warning rules fired
    pub warnings: usize,
    /// Targets newly flagged as exceeded
    pub exceeded: usize,
    /// Aggregate delivery outcome
    pub summary: DispatchSummary,
}

/// Targets reset by one reset pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetReport {
    /// Node ids
    pub nodes: Vec<i64>,
    /// Client ids
    pub clients: Vec<i64>,
}

impl ResetReport {
    /// Total number of targets reset
    pub fn total(&self) -> usize {
        self.nodes.len() + self.clients.len()
    }
}

/// Quota and liveness monitor
pub struct QuotaMonitor {
    dispatcher: Arc<AlertDispatcher>,
    evaluator: QuotaEvaluator,
    config: AlertingConfig,
}

impl QuotaMonitor {
    /// Create a monitor around a dispatcher
    pub fn new(dispatcher: Arc<AlertDispatcher>, config: AlertingConfig) -> Self {
        Self {
            evaluator: QuotaEvaluator::new(dispatcher.clone()),
            dispatcher,
            config,
        }
    }

    /// The dispatcher alerts go through
    pub fn dispatcher(&self) -> &Arc<AlertDispatcher> {
        &self.dispatcher
    }

    fn store(&self) -> &Arc<dyn AlertStore> {
        self.dispatcher.store()
    }

    /// Re-evaluate one target after its usage counters changed
    pub async fn on_traffic_update(&self, kind: TargetKind, id: i64) -> Result<QuotaCheck> {
        let target = self
            .store()
            .get_target(kind, id)
            .await?
            .ok_or_else(|| Error::not_found(kind.as_str(), id))?;

        Ok(self.evaluator.check_quota(&target).await)
    }

    /// React to a status change reported by the heartbeat handler.
    ///
    /// Only an online to offline transition fires. The stored status is set
    /// to offline as well, so the heartbeat sweep does not alert again.
    pub async fn on_status_change(
        &self,
        target: &MonitoredTarget,
        previous: LivenessStatus,
    ) -> Result<DispatchSummary> {
        if previous != LivenessStatus::Online || target.status != LivenessStatus::Offline {
            return Ok(DispatchSummary::default());
        }

        // The reported transition always alerts. The stored status may
        // already be offline when the caller persisted it first.
        self.store().mark_offline(target.kind, target.id).await?;

        info!(target_kind = %target.kind, target_id = target.id, "Target went offline");
        let alert = Alert::new(AlertType::NodeOffline, target, node_offline_message(target));
        Ok(self.dispatcher.trigger_alert(&alert).await)
    }

    /// Flip online nodes with stale heartbeats to offline and alert for each
    pub async fn sweep_offline(&self) -> Result<usize> {
        let cutoff = Duration::from_std(self.config.heartbeat_timeout)
            .ok()
            .and_then(|timeout| Utc::now().checked_sub_signed(timeout))
            .ok_or_else(|| Error::config("heartbeat_timeout out of range"))?;

        let stale = self
            .store()
            .list_stale_online(TargetKind::Node, cutoff)
            .await?;

        let mut flipped = 0;
        for node in stale {
            match self.store().mark_offline(node.kind, node.id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    error!(target_id = node.id, error = %e, "Failed to mark node offline");
                    continue;
                }
            }

            flipped += 1;
            warn!(target_id = node.id, name = %node.name, "Node heartbeat timed out");

            let alert = Alert::new(
                AlertType::NodeOffline,
                &node,
                heartbeat_timeout_message(&node),
            );
            self.dispatcher.trigger_alert(&alert).await;
        }

        if flipped > 0 {
            self.dispatcher.metrics().targets_offline(flipped);
            info!(count = flipped, "Heartbeat sweep marked nodes offline");
        }

        Ok(flipped)
    }

    /// Evaluate every metered target of both kinds
    pub async fn scan_quotas(&self) -> Result<ScanReport> {
        let mut report = ScanReport::default();

        for kind in TargetKind::ALL {
            let targets = match self.store().list_metered(kind).await {
                Ok(targets) => targets,
                Err(e) => {
                    error!(target_kind = %kind, error = %e, "Failed to list metered targets");
                    continue;
                }
            };

            for target in &targets {
                let check = self.evaluator.check_quota(target).await;
                report.evaluated += 1;
                report.warnings += check.warnings_fired;
                report.exceeded += usize::from(check.exceeded);
                report.summary.merge(check.summary);
            }
        }

        debug!(
            evaluated = report.evaluated,
            warnings = report.warnings,
            exceeded = report.exceeded,
            "Quota scan finished"
        );
        Ok(report)
    }

    /// Reset usage of targets whose reset day is today
    pub async fn reset_quotas(&self, now: DateTime<Utc>) -> Result<ResetReport> {
        let day = i32::try_from(now.day()).unwrap_or_default();
        let reset_before = now - Duration::days(RESET_GUARD_DAYS);

        let mut report = ResetReport::default();
        for kind in TargetKind::ALL {
            let ids = match self
                .store()
                .reset_due_quotas(kind, day, reset_before, now)
                .await
            {
                Ok(ids) => ids,
                Err(e) => {
                    error!(target_kind = %kind, error = %e, "Quota reset failed");
                    continue;
                }
            };

            if !ids.is_empty() {
                info!(target_kind = %kind, count = ids.len(), day, "Quota usage reset");
                self.dispatcher.metrics().quota_reset(kind, ids.len());
            }

            match kind {
                TargetKind::Node => report.nodes = ids,
                TargetKind::Client => report.clients = ids,
            }
        }

        Ok(report)
    }

    /// Delete alert logs past the retention period and drop idle locks
    pub async fn prune_logs(&self) -> Result<u64> {
        let cutoff = Duration::try_days(self.config.log_retention_days.max(0))
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
            .ok_or_else(|| Error::config("log_retention_days out of range"))?;
        let deleted = self.store().delete_older_than(cutoff).await?;
        let locks = self.dispatcher.locks().prune();

        info!(
            deleted,
            retention_days = self.config.log_retention_days,
            idle_locks = locks,
            "Alert log retention sweep"
        );
        Ok(deleted)
    }

    /// Create the default rules when no rule exists yet
    pub async fn seed_default_rules(&self) -> Result<usize> {
        if self.store().count_rules().await? > 0 {
            return Ok(0);
        }

        let defaults = AlertRuleInput::defaults();
        for input in &defaults {
            let rule = self.store().create_rule(input).await?;
            debug!(rule_id = rule.id, name = %rule.name, "Seeded alert rule");
        }

        info!(count = defaults.len(), "Seeded default alert rules");
        Ok(defaults.len())
    }

    /// Run the periodic passes until `shutdown` is cancelled
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut quota_tick = interval(self.config.quota_scan_interval);
        let mut offline_tick = interval(self.config.offline_scan_interval);
        let mut reset_tick = interval(self.config.reset_check_interval);
        let mut retention_tick = interval(self.config.retention_scan_interval);
        for tick in [
            &mut quota_tick,
            &mut offline_tick,
            &mut reset_tick,
            &mut retention_tick,
        ] {
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }

        info!(
            quota_scan = %humantime::format_duration(self.config.quota_scan_interval),
            offline_scan = %humantime::format_duration(self.config.offline_scan_interval),
            heartbeat_timeout = %humantime::format_duration(self.config.heartbeat_timeout),
            reset_check = %humantime::format_duration(self.config.reset_check_interval),
            "Quota monitor started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Quota monitor stopped");
                    break;
                }

                _ = quota_tick.tick() => {
                    if let Err(e) = self.scan_quotas().await {
                        error!(error = %e, "Quota scan failed");
                    }
                }

                _ = offline_tick.tick() => {
                    if let Err(e) = self.sweep_offline().await {
                        error!(error = %e, "Heartbeat sweep failed");
                    }
                }

                _ = reset_tick.tick() => {
                    if let Err(e) = self.reset_quotas(Utc::now()).await {
                        error!(error = %e, "Quota reset pass failed");
                    }
                }

                _ = retention_tick.tick() => {
                    if let Err(e) = self.prune_logs().await {
                        error!(error = %e, "Alert log retention failed");
                    }
                }
            }
        }
    }
}
