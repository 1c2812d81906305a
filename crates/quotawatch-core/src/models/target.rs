//! Monitored target data model

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of monitored target
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// A proxy node
    Node,
    /// A client attached to a node
    Client,
}

impl TargetKind {
    /// All target kinds, in evaluation order
    pub const ALL: [TargetKind; 2] = [TargetKind::Node, TargetKind::Client];

    /// Stable identifier used in storage and dedup keys
    pub fn as_str(self) -> &'static str {
        match self {
            TargetKind::Node => "node",
            TargetKind::Client => "client",
        }
    }

    /// Name shown to operators in alert messages
    pub fn display_name(self) -> &'static str {
        match self {
            TargetKind::Node => "Node",
            TargetKind::Client => "Client",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "node" => Ok(TargetKind::Node),
            "client" => Ok(TargetKind::Client),
            other => Err(format!("unknown target kind: {other}")),
        }
    }
}

/// Liveness status of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LivenessStatus {
    /// Heartbeats are arriving
    Online,
    /// No recent heartbeat
    #[default]
    Offline,
}

impl LivenessStatus {
    /// Stable identifier used in storage
    pub fn as_str(self) -> &'static str {
        match self {
            LivenessStatus::Online => "online",
            LivenessStatus::Offline => "offline",
        }
    }

    /// Parse a stored status; anything unrecognized counts as offline
    pub fn parse(s: &str) -> Self {
        if s == "online" {
            LivenessStatus::Online
        } else {
            LivenessStatus::Offline
        }
    }
}

/// A node or client whose traffic and liveness are monitored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoredTarget {
    /// Node or client
    pub kind: TargetKind,

    /// Identifier, unique per kind
    pub id: i64,

    /// Human-readable name
    pub name: String,

    /// Traffic ceiling in bytes (0 = unlimited)
    pub traffic_quota: i64,

    /// Bytes used in the current quota cycle
    pub quota_used: i64,

    /// Set once usage reached the quota; cleared by a reset
    pub quota_exceeded: bool,

    /// Day of month on which the quota resets (0 = never)
    pub quota_reset_day: i32,

    /// When the quota was last reset
    pub quota_reset_at: Option<DateTime<Utc>>,

    /// Liveness status
    pub status: LivenessStatus,

    /// Last heartbeat
    pub last_seen: Option<DateTime<Utc>>,
}

impl MonitoredTarget {
    /// Create an online, unlimited target
    pub fn new(kind: TargetKind, id: i64, name: impl Into<String>) -> Self {
        Self {
            kind,
            id,
            name: name.into(),
            traffic_quota: 0,
            quota_used: 0,
            quota_exceeded: false,
            quota_reset_day: 0,
            quota_reset_at: None,
            status: LivenessStatus::Online,
            last_seen: Some(Utc::now()),
        }
    }

    /// Whether a quota is configured
    pub fn is_metered(&self) -> bool {
        self.traffic_quota > 0
    }

    /// Usage as a percentage of the quota, `None` when unlimited
    pub fn usage_percent(&self) -> Option<f64> {
        if !self.is_metered() {
            return None;
        }
        Some(self.quota_used as f64 / self.traffic_quota as f64 * 100.0)
    }

    /// Whether usage reached the quota
    pub fn quota_reached(&self) -> bool {
        self.is_metered() && self.quota_used >= self.traffic_quota
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_percent() {
        let mut target = MonitoredTarget::new(TargetKind::Node, 1, "edge-1");
        assert_eq!(target.usage_percent(), None);
        assert!(!target.quota_reached());

        target.traffic_quota = 1000;
        target.quota_used = 850;
        let percent = target.usage_percent().unwrap();
        assert!((percent - 85.0).abs() < f64::EPSILON);
        assert!(!target.quota_reached());

        target.quota_used = 1000;
        assert!(target.quota_reached());
    }

    #[test]
    fn test_kind_round_trip_names() {
        assert_eq!("client".parse::<TargetKind>().unwrap(), TargetKind::Client);
        assert!("gateway".parse::<TargetKind>().is_err());
        assert_eq!(LivenessStatus::parse("online"), LivenessStatus::Online);
        assert_eq!(LivenessStatus::parse("unknown"), LivenessStatus::Offline);
    }
}
