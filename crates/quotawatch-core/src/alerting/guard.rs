//! Cooldown and deduplication checks
//!
//! The decision itself is pure. Callers that need check-then-act atomicity
//! hold a [`KeyedLocks`] guard from the check until the log rows are written.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::Result;
use crate::models::{AlertRule, AlertType, TargetKind};

use super::repository::AlertLogRepository;

/// Outcome of a guard check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The alert may be sent now
    Allow,
    /// The rule is disabled
    Disabled,
    /// The rule fired less than its cooldown ago
    CoolingDown {
        /// Time left until the rule may fire again
        remaining: Duration,
    },
    /// The same dedup key was logged inside the window
    Duplicate,
}

impl Verdict {
    /// Whether the alert may proceed
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }

    /// Short label used in logs and metrics
    pub fn reason(&self) -> &'static str {
        match self {
            Verdict::Allow => "allowed",
            Verdict::Disabled => "disabled",
            Verdict::CoolingDown { .. } => "cooldown",
            Verdict::Duplicate => "duplicate",
        }
    }
}

/// Decides whether an alert attempt may proceed
#[derive(Debug, Clone, Copy)]
pub struct CooldownGuard {
    dedup_window: Duration,
}

impl Default for CooldownGuard {
    fn default() -> Self {
        Self::new(Duration::hours(24))
    }
}

impl CooldownGuard {
    /// Create a guard with the given dedup window
    pub fn new(dedup_window: Duration) -> Self {
        Self { dedup_window }
    }

    /// Trailing window for dedup lookups
    pub fn dedup_window(&self) -> Duration {
        self.dedup_window
    }

    /// Time left in a rule's cooldown, `None` when it may fire
    pub fn cooldown_remaining(rule: &AlertRule, now: DateTime<Utc>) -> Option<Duration> {
        let last = rule.last_alert_at?;
        // Values past chrono's range saturate instead of panicking.
        let cooldown = Duration::try_minutes(rule.cooldown_minutes.max(0)).unwrap_or(Duration::MAX);
        let elapsed = now - last;
        if elapsed >= cooldown {
            None
        } else {
            Some(cooldown.checked_sub(&elapsed).unwrap_or(Duration::MAX))
        }
    }

    /// Combine the cooldown check with an already counted dedup lookup.
    ///
    /// `duplicates` is `None` when no dedup key applies.
    pub fn decide(
        &self,
        rule: &AlertRule,
        duplicates: Option<i64>,
        now: DateTime<Utc>,
    ) -> Verdict {
        if !rule.enabled {
            return Verdict::Disabled;
        }
        if let Some(remaining) = Self::cooldown_remaining(rule, now) {
            return Verdict::CoolingDown { remaining };
        }
        if duplicates.is_some_and(|n| n > 0) {
            return Verdict::Duplicate;
        }
        Verdict::Allow
    }

    /// Run both checks, querying the log only when the cooldown passed
    pub async fn check<L>(
        &self,
        logs: &L,
        rule: &AlertRule,
        dedup_key: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Verdict>
    where
        L: AlertLogRepository + ?Sized,
    {
        let verdict = self.decide(rule, None, now);
        if !verdict.is_allowed() {
            return Ok(verdict);
        }

        let Some(key) = dedup_key else {
            return Ok(verdict);
        };

        let since = now
            .checked_sub_signed(self.dedup_window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let duplicates = logs
            .count_matching_since(rule.alert_type, key, since)
            .await?;

        Ok(self.decide(rule, Some(duplicates), now))
    }
}

/// Lock key serializing quota evaluations of one target and alert type
pub fn target_lock_key(kind: TargetKind, target_id: i64, alert_type: AlertType) -> String {
    format!("target:{}:{}:{}", kind.as_str(), target_id, alert_type.as_str())
}

/// Lock key serializing firings of one rule
pub fn rule_lock_key(rule_id: i64) -> String {
    format!("rule:{rule_id}")
}

/// Async mutexes created on demand per string key
#[derive(Debug, Clone, Default)]
pub struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and hold the lock of `key`
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        // Clone the Arc out so the map shard is not held across the await.
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }

    /// Drop locks nobody holds or waits for
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
        before - self.locks.len()
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no keys are tracked
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(cooldown_minutes: i64, last_alert_at: Option<DateTime<Utc>>) -> AlertRule {
        AlertRule {
            id: 1,
            name: "warn".to_string(),
            alert_type: AlertType::QuotaWarning,
            condition: "{}".to_string(),
            enabled: true,
            cooldown_minutes,
            channel_ids: String::new(),
            last_alert_at,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_never_fired_rule_is_allowed() {
        let guard = CooldownGuard::default();
        assert_eq!(guard.decide(&rule(60, None), None, Utc::now()), Verdict::Allow);
    }

    #[test]
    fn test_cooldown_boundary() {
        let guard = CooldownGuard::default();
        let now = Utc::now();

        let inside = rule(60, Some(now - Duration::minutes(59)));
        assert_eq!(
            guard.decide(&inside, None, now),
            Verdict::CoolingDown {
                remaining: Duration::minutes(1)
            }
        );

        let exact = rule(60, Some(now - Duration::minutes(60)));
        assert!(guard.decide(&exact, None, now).is_allowed());

        let zero = rule(0, Some(now));
        assert!(guard.decide(&zero, None, now).is_allowed());
    }

    #[test]
    fn test_oversized_cooldown_saturates() {
        let guard = CooldownGuard::default();
        let now = Utc::now();

        let huge = rule(200_000_000_000_000, Some(now));
        assert_eq!(
            guard.decide(&huge, None, now),
            Verdict::CoolingDown {
                remaining: Duration::MAX
            }
        );

        let max = rule(i64::MAX, Some(now + Duration::minutes(5)));
        assert!(matches!(
            guard.decide(&max, None, now),
            Verdict::CoolingDown { .. }
        ));
    }

    #[test]
    fn test_dedup_and_disabled() {
        let guard = CooldownGuard::default();
        let now = Utc::now();

        assert_eq!(guard.decide(&rule(0, None), Some(1), now), Verdict::Duplicate);
        assert!(guard.decide(&rule(0, None), Some(0), now).is_allowed());

        let mut disabled = rule(0, None);
        disabled.enabled = false;
        assert_eq!(guard.decide(&disabled, None, now), Verdict::Disabled);
    }

    #[test]
    fn test_lock_keys() {
        assert_eq!(
            target_lock_key(TargetKind::Client, 9, AlertType::QuotaWarning),
            "target:client:9:quota_warning"
        );
        assert_eq!(rule_lock_key(4), "rule:4");
    }

    #[tokio::test]
    async fn test_keyed_locks_serialize_same_key() {
        let locks = KeyedLocks::new();

        let held = locks.lock("a").await;
        // A different key is independent
        let _other = locks.lock("b").await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("a").await;
            })
        };

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(held);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn test_prune_keeps_held_locks() {
        let locks = KeyedLocks::new();
        let held = locks.lock("busy").await;
        drop(locks.lock("idle").await);

        assert_eq!(locks.prune(), 1);
        assert_eq!(locks.len(), 1);

        drop(held);
        assert_eq!(locks.prune(), 1);
        assert!(locks.is_empty());
    }
}
