//! Alert data models

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::target::TargetKind;

/// Threshold used by quota warnings whose condition does not set one
pub const DEFAULT_WARNING_THRESHOLD: i64 = 80;

/// Type of alert a rule reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// Usage reached the quota
    QuotaExceeded,
    /// Usage crossed a warning threshold
    QuotaWarning,
    /// A node stopped reporting
    NodeOffline,
    /// Abnormal traffic volume
    TrafficSpike,
    /// Agent version change
    AgentUpdate,
}

impl AlertType {
    /// Stable identifier used in storage
    pub fn as_str(self) -> &'static str {
        match self {
            AlertType::QuotaExceeded => "quota_exceeded",
            AlertType::QuotaWarning => "quota_warning",
            AlertType::NodeOffline => "node_offline",
            AlertType::TrafficSpike => "traffic_spike",
            AlertType::AgentUpdate => "agent_update",
        }
    }

    /// Name shown in notification titles
    pub fn title(self) -> &'static str {
        match self {
            AlertType::QuotaExceeded => "Quota Exceeded",
            AlertType::QuotaWarning => "Quota Warning",
            AlertType::NodeOffline => "Node Offline",
            AlertType::TrafficSpike => "Traffic Anomaly",
            AlertType::AgentUpdate => "Agent Update",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quota_exceeded" => Ok(AlertType::QuotaExceeded),
            "quota_warning" => Ok(AlertType::QuotaWarning),
            "node_offline" => Ok(AlertType::NodeOffline),
            "traffic_spike" => Ok(AlertType::TrafficSpike),
            "agent_update" => Ok(AlertType::AgentUpdate),
            other => Err(format!("unknown alert type: {other}")),
        }
    }
}

/// Condition payload of a rule
///
/// Stored as JSON, e.g. `{"threshold": 90, "duration": 5}`. Missing fields
/// are zero. `duration` is reserved and not read by any evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleCondition {
    /// Threshold percentage
    pub threshold: i64,
    /// Duration in minutes
    pub duration: i64,
}

impl RuleCondition {
    /// Parse a condition payload; empty and `{}` yield the zero condition
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        let raw = raw.trim();
        if raw.is_empty() || raw == "{}" {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
    }

    /// Warning threshold, falling back to the default when unset
    pub fn warning_threshold(&self) -> i64 {
        if self.threshold <= 0 {
            DEFAULT_WARNING_THRESHOLD
        } else {
            self.threshold
        }
    }
}

/// An alert rule definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    /// Unique identifier
    pub id: i64,

    /// Human-readable name
    pub name: String,

    /// Alert type this rule reacts to
    pub alert_type: AlertType,

    /// Raw condition payload
    pub condition: String,

    /// Whether the rule is enabled
    pub enabled: bool,

    /// Minimum minutes between two firings
    pub cooldown_minutes: i64,

    /// Comma-separated notify channel ids
    pub channel_ids: String,

    /// Last time this rule fired
    pub last_alert_at: Option<DateTime<Utc>>,

    /// When the rule was created
    pub created_at: DateTime<Utc>,

    /// When the rule was last updated
    pub updated_at: DateTime<Utc>,
}

impl AlertRule {
    /// Parsed condition payload
    pub fn condition(&self) -> Result<RuleCondition, serde_json::Error> {
        RuleCondition::parse(&self.condition)
    }

    /// Channel ids in configured order; blank and non-numeric entries are skipped
    pub fn channel_ids(&self) -> Vec<i64> {
        parse_channel_ids(&self.channel_ids)
    }
}

/// Parse a comma-separated channel id list
pub fn parse_channel_ids(raw: &str) -> Vec<i64> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

/// Input for creating a new alert rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRuleInput {
    /// Display name
    pub name: String,
    /// Alert type the rule matches
    pub alert_type: AlertType,
    /// Condition JSON, e.g. `{"threshold": 80}`
    pub condition: String,
    /// Whether the rule may fire
    pub enabled: bool,
    /// Minimum minutes between two firings
    pub cooldown_minutes: i64,
    /// Comma-separated channel ids
    pub channel_ids: String,
}

impl AlertRuleInput {
    /// Rules created when the rule table is empty
    pub fn defaults() -> Vec<AlertRuleInput> {
        let rule = |name: &str, alert_type, condition: &str, cooldown_minutes| AlertRuleInput {
            name: name.to_string(),
            alert_type,
            condition: condition.to_string(),
            enabled: true,
            cooldown_minutes,
            channel_ids: String::new(),
        };

        vec![
            rule("Node offline", AlertType::NodeOffline, "{}", 30),
            rule("Quota exceeded", AlertType::QuotaExceeded, "{}", 60),
            rule("Quota warning (80%)", AlertType::QuotaWarning, r#"{"threshold": 80}"#, 60),
            rule("Quota warning (90%)", AlertType::QuotaWarning, r#"{"threshold": 90}"#, 30),
        ]
    }
}

/// A configured notification channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyChannel {
    /// Unique identifier
    pub id: i64,

    /// Human-readable name
    pub name: String,

    /// Declared type (telegram, webhook, smtp)
    pub channel_type: String,

    /// Opaque per-type configuration payload (JSON)
    pub config: String,

    /// Whether the channel is enabled
    pub enabled: bool,

    /// When the channel was created
    pub created_at: DateTime<Utc>,

    /// When the channel was last updated
    pub updated_at: DateTime<Utc>,
}

/// Delivery outcome recorded for one channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// The notifier accepted the message
    Sent,
    /// The notifier reported an error
    Failed,
}

impl DeliveryStatus {
    /// Stable identifier used in storage
    pub fn as_str(self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }

    /// Parse a stored status; anything unrecognized counts as failed
    pub fn parse(s: &str) -> Self {
        if s == "sent" {
            DeliveryStatus::Sent
        } else {
            DeliveryStatus::Failed
        }
    }
}

/// One delivery attempt of an alert through one channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertLog {
    /// Unique identifier
    pub id: i64,

    /// Rule that fired
    pub rule_id: i64,

    /// Rule name at the time of firing
    pub rule_name: String,

    /// Alert type
    pub alert_type: AlertType,

    /// Rendered message, including the dedup marker when present
    pub message: String,

    /// Kind of the target
    pub target_kind: TargetKind,

    /// Target id
    pub target_id: i64,

    /// Target name at the time of firing
    pub target_name: String,

    /// Channel the attempt went through
    pub channel_id: i64,

    /// Delivery outcome
    pub status: DeliveryStatus,

    /// Dedup key for suppressible alerts
    pub dedup_key: Option<String>,

    /// When the attempt was recorded
    pub created_at: DateTime<Utc>,
}

/// Input for appending an alert log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAlertLog {
    /// Rule that fired
    pub rule_id: i64,
    /// Rule name at firing time
    pub rule_name: String,
    /// Alert type
    pub alert_type: AlertType,
    /// Stored message, with the dedup marker when keyed
    pub message: String,
    /// Node or client
    pub target_kind: TargetKind,
    /// Target id
    pub target_id: i64,
    /// Target name at firing time
    pub target_name: String,
    /// Channel the message went through
    pub channel_id: i64,
    /// Delivery outcome
    pub status: DeliveryStatus,
    /// Warning dedup key
    pub dedup_key: Option<String>,
    /// When the row was written
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("", 0, 80)]
    #[case("{}", 0, 80)]
    #[case(r#"{"threshold": 90}"#, 90, 90)]
    #[case(r#"{"threshold": -5, "duration": 10}"#, -5, 80)]
    fn test_condition_threshold(#[case] raw: &str, #[case] parsed: i64, #[case] effective: i64) {
        let condition = RuleCondition::parse(raw).unwrap();
        assert_eq!(condition.threshold, parsed);
        assert_eq!(condition.warning_threshold(), effective);
    }

    #[test]
    fn test_condition_rejects_malformed_payload() {
        assert!(RuleCondition::parse("{threshold: 80").is_err());
        assert!(RuleCondition::parse(r#"{"threshold": "high"}"#).is_err());
    }

    #[test]
    fn test_channel_id_list() {
        assert_eq!(parse_channel_ids(" 3, 1 ,,abc, 7 "), vec![3, 1, 7]);
        assert!(parse_channel_ids("").is_empty());
    }

    #[test]
    fn test_default_rules() {
        let rules = AlertRuleInput::defaults();
        assert_eq!(rules.len(), 4);

        let warnings: Vec<i64> = rules
            .iter()
            .filter(|r| r.alert_type == AlertType::QuotaWarning)
            .map(|r| RuleCondition::parse(&r.condition).unwrap().threshold)
            .collect();
        assert_eq!(warnings, vec![80, 90]);
    }

    #[test]
    fn test_alert_type_names() {
        for alert_type in [
            AlertType::QuotaExceeded,
            AlertType::QuotaWarning,
            AlertType::NodeOffline,
            AlertType::TrafficSpike,
            AlertType::AgentUpdate,
        ] {
            assert_eq!(alert_type.as_str().parse::<AlertType>().unwrap(), alert_type);
        }
    }
}
