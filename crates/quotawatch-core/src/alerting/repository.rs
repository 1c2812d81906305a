//! Storage seams used by the alerting engine
//!
//! The engine never caches rules or channels; every evaluation re-reads
//! current state through these traits. Implementations live in [`crate::db`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    AlertLog, AlertRule, AlertRuleInput, AlertType, MonitoredTarget, NewAlertLog, NotifyChannel,
    TargetKind,
};

/// Alert rules
#[async_trait]
pub trait RuleRepository: Send + Sync {
    /// Enabled rules of one alert type, ordered by id
    async fn find_enabled_by_type(&self, alert_type: AlertType) -> Result<Vec<AlertRule>>;

    /// A single rule
    async fn get_rule(&self, id: i64) -> Result<Option<AlertRule>>;

    /// Record the time of the last evaluation pass that fired
    async fn update_last_alert_at(&self, id: i64, at: DateTime<Utc>) -> Result<()>;

    /// Number of rules, enabled or not
    async fn count_rules(&self) -> Result<i64>;

    /// Create a rule
    async fn create_rule(&self, input: &AlertRuleInput) -> Result<AlertRule>;
}

/// Notify channels
#[async_trait]
pub trait ChannelRepository: Send + Sync {
    /// A single channel
    async fn get_channel(&self, id: i64) -> Result<Option<NotifyChannel>>;
}

/// Append-only alert history
#[async_trait]
pub trait AlertLogRepository: Send + Sync {
    /// Append a log row
    async fn append_log(&self, log: &NewAlertLog) -> Result<AlertLog>;

    /// Logs of `alert_type` carrying `dedup_key` created after `since`
    async fn count_matching_since(
        &self,
        alert_type: AlertType,
        dedup_key: &str,
        since: DateTime<Utc>,
    ) -> Result<i64>;

    /// Delete logs created before `cutoff`, returning how many were removed
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Newest-first page of logs and the total count
    async fn list_recent(&self, limit: i64, offset: i64) -> Result<(Vec<AlertLog>, i64)>;
}

/// Nodes and clients
#[async_trait]
pub trait TargetRepository: Send + Sync {
    /// A single target
    async fn get_target(&self, kind: TargetKind, id: i64) -> Result<Option<MonitoredTarget>>;

    /// Targets with a quota configured
    async fn list_metered(&self, kind: TargetKind) -> Result<Vec<MonitoredTarget>>;

    /// Set `quota_exceeded` only if it is currently false and the stored
    /// usage has reached the quota.
    ///
    /// Returns `true` when this call performed the transition.
    async fn mark_quota_exceeded(&self, kind: TargetKind, id: i64) -> Result<bool>;

    /// Set status to offline only if it is currently online.
    ///
    /// Returns `true` when this call performed the transition.
    async fn mark_offline(&self, kind: TargetKind, id: i64) -> Result<bool>;

    /// Online targets whose last heartbeat is older than `cutoff`
    async fn list_stale_online(
        &self,
        kind: TargetKind,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<MonitoredTarget>>;

    /// Reset usage for targets whose reset day is `day` and whose last reset
    /// is missing or before `reset_before`. Returns the ids that were reset.
    async fn reset_due_quotas(
        &self,
        kind: TargetKind,
        day: i32,
        reset_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>>;
}

/// Everything the alerting engine reads and writes
pub trait AlertStore:
    RuleRepository + ChannelRepository + AlertLogRepository + TargetRepository
{
}

impl<T> AlertStore for T where
    T: RuleRepository + ChannelRepository + AlertLogRepository + TargetRepository
{
}
