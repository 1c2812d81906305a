//! Alert titles, message bodies and dedup markers

use chrono::{DateTime, Utc};

use crate::models::{AlertType, MonitoredTarget, TargetKind};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Notification title, e.g. `[Quota Warning] edge-1`
pub fn alert_title(alert_type: AlertType, target_name: &str) -> String {
    format!("[{}] {}", alert_type.title(), target_name)
}

/// Dedup key of a quota warning for one target and threshold
pub fn warning_dedup_key(kind: TargetKind, target_id: i64, threshold: i64) -> String {
    format!("quota_warning_{}_{}_{}", kind.as_str(), target_id, threshold)
}

/// Marker embedded in logged messages so the log itself carries the key
pub fn dedup_marker(key: &str) -> String {
    format!("<!-- {key} -->")
}

/// Append the dedup marker as a trailing line
pub fn with_dedup_marker(message: &str, key: &str) -> String {
    format!("{message}\n{}", dedup_marker(key))
}

/// Message for a target whose usage reached its quota
pub fn quota_exceeded_message(target: &MonitoredTarget) -> String {
    format!(
        "{} {} has exceeded its traffic quota\nUsed: {} / Quota: {}",
        target.kind.display_name(),
        target.name,
        format_bytes(target.quota_used),
        format_bytes(target.traffic_quota),
    )
}

/// Message for a target crossing a warning threshold
pub fn quota_warning_message(target: &MonitoredTarget, percent: f64) -> String {
    format!(
        "{} {} traffic usage reached {:.1}%\nUsed: {} / Quota: {}\nPlease keep an eye on traffic usage",
        target.kind.display_name(),
        target.name,
        percent,
        format_bytes(target.quota_used),
        format_bytes(target.traffic_quota),
    )
}

/// Message for an explicit online to offline transition
pub fn node_offline_message(target: &MonitoredTarget) -> String {
    format!(
        "{} {} went offline\nLast seen: {}",
        target.kind.display_name(),
        target.name,
        format_timestamp(target.last_seen),
    )
}

/// Message for a node whose heartbeat timed out
pub fn heartbeat_timeout_message(target: &MonitoredTarget) -> String {
    format!(
        "{} {} heartbeat timed out and was marked offline\nLast heartbeat: {}",
        target.kind.display_name(),
        target.name,
        format_timestamp(target.last_seen),
    )
}

fn format_timestamp(at: Option<DateTime<Utc>>) -> String {
    at.map_or_else(|| "never".to_string(), |t| t.format(TIMESTAMP_FORMAT).to_string())
}

/// Format a byte count with binary units
pub fn format_bytes(bytes: i64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    const TB: f64 = GB * 1024.0;

    let value = bytes as f64;
    if value >= TB {
        format!("{:.2} TB", value / TB)
    } else if value >= GB {
        format!("{:.2} GB", value / GB)
    } else if value >= MB {
        format!("{:.2} MB", value / MB)
    } else if value >= KB {
        format!("{:.2} KB", value / KB)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case(0, "0 B")]
    #[case(1023, "1023 B")]
    #[case(1024, "1.00 KB")]
    #[case(1536, "1.50 KB")]
    #[case(5 * 1024 * 1024, "5.00 MB")]
    #[case(3 * 1024 * 1024 * 1024, "3.00 GB")]
    #[case(2 * 1024 * 1024 * 1024 * 1024, "2.00 TB")]
    fn test_format_bytes(#[case] bytes: i64, #[case] expected: &str) {
        assert_eq!(format_bytes(bytes), expected);
    }

    #[test]
    fn test_dedup_marker() {
        let key = warning_dedup_key(TargetKind::Node, 7, 80);
        assert_eq!(key, "quota_warning_node_7_80");
        assert_eq!(
            with_dedup_marker("usage high", &key),
            "usage high\n<!-- quota_warning_node_7_80 -->"
        );
    }

    #[test]
    fn test_messages() {
        let mut target = MonitoredTarget::new(TargetKind::Client, 3, "alice");
        target.traffic_quota = 1024 * 1024;
        target.quota_used = 1024 * 1024;
        target.last_seen = Some(Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap());

        assert_eq!(alert_title(AlertType::QuotaExceeded, "alice"), "[Quota Exceeded] alice");
        assert_eq!(
            quota_exceeded_message(&target),
            "Client alice has exceeded its traffic quota\nUsed: 1.00 MB / Quota: 1.00 MB"
        );
        assert!(quota_warning_message(&target, 85.04).contains("reached 85.0%"));
        assert!(node_offline_message(&target).ends_with("Last seen: 2024-05-01 08:30:00"));

        target.last_seen = None;
        assert!(heartbeat_timeout_message(&target).ends_with("Last heartbeat: never"));
    }
}
