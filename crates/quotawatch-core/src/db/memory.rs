//! In-process store
//!
//! Same conditional-update semantics as the Postgres store, all state behind
//! one mutex. Used by tests and for dry runs without a database.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::alerting::message::dedup_marker;
use crate::alerting::{AlertLogRepository, ChannelRepository, RuleRepository, TargetRepository};
use crate::error::{Error, Result};
use crate::models::{
    AlertLog, AlertRule, AlertRuleInput, AlertType, LivenessStatus, MonitoredTarget, NewAlertLog,
    NotifyChannel, TargetKind,
};

#[derive(Debug, Default)]
struct State {
    targets: BTreeMap<(TargetKind, i64), MonitoredTarget>,
    rules: BTreeMap<i64, AlertRule>,
    channels: BTreeMap<i64, NotifyChannel>,
    logs: Vec<AlertLog>,
    next_rule_id: i64,
    next_channel_id: i64,
    next_log_id: i64,
}

/// Store backed by process memory
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a target
    pub fn upsert_target(&self, target: MonitoredTarget) {
        self.state
            .lock()
            .targets
            .insert((target.kind, target.id), target);
    }

    /// Current copy of a target
    pub fn target(&self, kind: TargetKind, id: i64) -> Option<MonitoredTarget> {
        self.state.lock().targets.get(&(kind, id)).cloned()
    }

    /// Add a channel and return its id
    pub fn add_channel(
        &self,
        name: impl Into<String>,
        channel_type: impl Into<String>,
        config: impl Into<String>,
        enabled: bool,
    ) -> i64 {
        let mut state = self.state.lock();
        state.next_channel_id += 1;
        let id = state.next_channel_id;
        let now = Utc::now();
        state.channels.insert(
            id,
            NotifyChannel {
                id,
                name: name.into(),
                channel_type: channel_type.into(),
                config: config.into(),
                enabled,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    /// Current copy of a rule
    pub fn rule(&self, id: i64) -> Option<AlertRule> {
        self.state.lock().rules.get(&id).cloned()
    }

    /// Overwrite a rule's last firing time
    pub fn set_rule_last_alert_at(&self, id: i64, at: Option<DateTime<Utc>>) {
        if let Some(rule) = self.state.lock().rules.get_mut(&id) {
            rule.last_alert_at = at;
        }
    }

    /// All logs, oldest first
    pub fn logs(&self) -> Vec<AlertLog> {
        self.state.lock().logs.clone()
    }

    /// Move every log `by` into the past
    pub fn backdate_logs(&self, by: Duration) {
        for log in &mut self.state.lock().logs {
            log.created_at -= by;
        }
    }
}

#[async_trait]
impl RuleRepository for MemoryStore {
    async fn find_enabled_by_type(&self, alert_type: AlertType) -> Result<Vec<AlertRule>> {
        Ok(self
            .state
            .lock()
            .rules
            .values()
            .filter(|r| r.enabled && r.alert_type == alert_type)
            .cloned()
            .collect())
    }

    async fn get_rule(&self, id: i64) -> Result<Option<AlertRule>> {
        Ok(self.state.lock().rules.get(&id).cloned())
    }

    async fn update_last_alert_at(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock();
        let rule = state
            .rules
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("alert rule", id))?;
        rule.last_alert_at = Some(at);
        rule.updated_at = at;
        Ok(())
    }

    async fn count_rules(&self) -> Result<i64> {
        Ok(self.state.lock().rules.len() as i64)
    }

    async fn create_rule(&self, input: &AlertRuleInput) -> Result<AlertRule> {
        let mut state = self.state.lock();
        state.next_rule_id += 1;
        let now = Utc::now();
        let rule = AlertRule {
            id: state.next_rule_id,
            name: input.name.clone(),
            alert_type: input.alert_type,
            condition: input.condition.clone(),
            enabled: input.enabled,
            cooldown_minutes: input.cooldown_minutes,
            channel_ids: input.channel_ids.clone(),
            last_alert_at: None,
            created_at: now,
            updated_at: now,
        };
        state.rules.insert(rule.id, rule.clone());
        Ok(rule)
    }
}

#[async_trait]
impl ChannelRepository for MemoryStore {
    async fn get_channel(&self, id: i64) -> Result<Option<NotifyChannel>> {
        Ok(self.state.lock().channels.get(&id).cloned())
    }
}

#[async_trait]
impl AlertLogRepository for MemoryStore {
    async fn append_log(&self, log: &NewAlertLog) -> Result<AlertLog> {
        let mut state = self.state.lock();
        state.next_log_id += 1;
        let row = AlertLog {
            id: state.next_log_id,
            rule_id: log.rule_id,
            rule_name: log.rule_name.clone(),
            alert_type: log.alert_type,
            message: log.message.clone(),
            target_kind: log.target_kind,
            target_id: log.target_id,
            target_name: log.target_name.clone(),
            channel_id: log.channel_id,
            status: log.status,
            dedup_key: log.dedup_key.clone(),
            created_at: log.created_at,
        };
        state.logs.push(row.clone());
        Ok(row)
    }

    async fn count_matching_since(
        &self,
        alert_type: AlertType,
        dedup_key: &str,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        let marker = dedup_marker(dedup_key);
        let count = self
            .state
            .lock()
            .logs
            .iter()
            .filter(|l| l.alert_type == alert_type && l.created_at > since)
            .filter(|l| l.dedup_key.as_deref() == Some(dedup_key) || l.message.contains(&marker))
            .count();
        Ok(count as i64)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock();
        let before = state.logs.len();
        state.logs.retain(|l| l.created_at >= cutoff);
        Ok((before - state.logs.len()) as u64)
    }

    async fn list_recent(&self, limit: i64, offset: i64) -> Result<(Vec<AlertLog>, i64)> {
        let state = self.state.lock();
        let total = state.logs.len() as i64;
        let page = state
            .logs
            .iter()
            .rev()
            .skip(usize::try_from(offset.max(0)).unwrap_or_default())
            .take(usize::try_from(limit.max(0)).unwrap_or_default())
            .cloned()
            .collect();
        Ok((page, total))
    }
}

#[async_trait]
impl TargetRepository for MemoryStore {
    async fn get_target(&self, kind: TargetKind, id: i64) -> Result<Option<MonitoredTarget>> {
        Ok(self.target(kind, id))
    }

    async fn list_metered(&self, kind: TargetKind) -> Result<Vec<MonitoredTarget>> {
        Ok(self
            .state
            .lock()
            .targets
            .values()
            .filter(|t| t.kind == kind && t.is_metered())
            .cloned()
            .collect())
    }

    async fn mark_quota_exceeded(&self, kind: TargetKind, id: i64) -> Result<bool> {
        let mut state = self.state.lock();
        match state.targets.get_mut(&(kind, id)) {
            Some(target) if !target.quota_exceeded && target.quota_reached() => {
                target.quota_exceeded = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_offline(&self, kind: TargetKind, id: i64) -> Result<bool> {
        let mut state = self.state.lock();
        match state.targets.get_mut(&(kind, id)) {
            Some(target) if target.status == LivenessStatus::Online => {
                target.status = LivenessStatus::Offline;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_stale_online(
        &self,
        kind: TargetKind,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<MonitoredTarget>> {
        Ok(self
            .state
            .lock()
            .targets
            .values()
            .filter(|t| t.kind == kind && t.status == LivenessStatus::Online)
            .filter(|t| t.last_seen.map_or(true, |seen| seen < cutoff))
            .cloned()
            .collect())
    }

    async fn reset_due_quotas(
        &self,
        kind: TargetKind,
        day: i32,
        reset_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let mut state = self.state.lock();
        let mut reset = Vec::new();
        for target in state.targets.values_mut() {
            let due = target.kind == kind
                && target.quota_reset_day > 0
                && target.quota_reset_day == day
                && target.quota_reset_at.map_or(true, |at| at < reset_before);
            if due {
                target.quota_used = 0;
                target.quota_exceeded = false;
                target.quota_reset_at = Some(now);
                reset.push(target.id);
            }
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeliveryStatus;
    use pretty_assertions::assert_eq;

    fn log(key: Option<&str>, message: &str) -> NewAlertLog {
        NewAlertLog {
            rule_id: 1,
            rule_name: "warn".to_string(),
            alert_type: AlertType::QuotaWarning,
            message: message.to_string(),
            target_kind: TargetKind::Node,
            target_id: 1,
            target_name: "edge-1".to_string(),
            channel_id: 1,
            status: DeliveryStatus::Sent,
            dedup_key: key.map(str::to_string),
            created_at: Utc::now(),
        }
    }

    async fn count(store: &MemoryStore, key: &str, since: DateTime<Utc>) -> i64 {
        store
            .count_matching_since(AlertType::QuotaWarning, key, since)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_dedup_matches_column_or_marker() {
        let store = MemoryStore::new();
        let since = Utc::now() - Duration::hours(1);

        store
            .append_log(&log(Some("quota_warning_node_1_80"), "usage"))
            .await
            .unwrap();
        store
            .append_log(&log(None, "usage\n<!-- quota_warning_node_1_90 -->"))
            .await
            .unwrap();

        assert_eq!(count(&store, "quota_warning_node_1_80", since).await, 1);
        assert_eq!(count(&store, "quota_warning_node_1_90", since).await, 1);
        // Prefix of a longer key must not match
        assert_eq!(count(&store, "quota_warning_node_1_9", since).await, 0);
        assert_eq!(
            store
                .count_matching_since(AlertType::QuotaExceeded, "quota_warning_node_1_80", since)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_conditional_updates_fire_once() {
        let store = MemoryStore::new();
        let mut alice = MonitoredTarget::new(TargetKind::Client, 3, "alice");
        alice.traffic_quota = 100;
        alice.quota_used = 100;
        store.upsert_target(alice);

        assert!(store.mark_quota_exceeded(TargetKind::Client, 3).await.unwrap());
        assert!(!store.mark_quota_exceeded(TargetKind::Client, 3).await.unwrap());
        assert!(store.mark_offline(TargetKind::Client, 3).await.unwrap());
        assert!(!store.mark_offline(TargetKind::Client, 3).await.unwrap());
        // Unknown targets never transition
        assert!(!store.mark_offline(TargetKind::Node, 3).await.unwrap());
    }

    #[tokio::test]
    async fn test_exceeded_flag_requires_stored_usage() {
        let store = MemoryStore::new();
        let mut bob = MonitoredTarget::new(TargetKind::Client, 4, "bob");
        bob.traffic_quota = 100;
        bob.quota_used = 99;
        store.upsert_target(bob);
        store.upsert_target(MonitoredTarget::new(TargetKind::Client, 5, "unmetered"));

        assert!(!store.mark_quota_exceeded(TargetKind::Client, 4).await.unwrap());
        assert!(!store.mark_quota_exceeded(TargetKind::Client, 5).await.unwrap());
        assert!(!store.target(TargetKind::Client, 4).unwrap().quota_exceeded);
    }

    #[tokio::test]
    async fn test_list_recent_is_newest_first() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store.append_log(&log(None, &format!("m{i}"))).await.unwrap();
        }

        let (page, total) = store.list_recent(2, 1).await.unwrap();
        assert_eq!(total, 5);
        let messages: Vec<_> = page.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["m3", "m2"]);
    }
}
