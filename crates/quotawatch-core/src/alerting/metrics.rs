//! Metrics sink injected into the alerting engine

#[cfg(test)]
use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::{AlertType, DeliveryStatus, TargetKind};

/// Receives counters from the dispatcher and monitor
pub trait AlertMetrics: Send + Sync {
    /// One delivery attempt through one channel
    fn notification(&self, alert_type: AlertType, channel_type: &str, status: DeliveryStatus);

    /// A rule or warning was suppressed
    fn suppressed(&self, alert_type: AlertType, reason: &'static str);

    /// Targets whose quota was reset
    fn quota_reset(&self, kind: TargetKind, count: usize);

    /// Nodes flipped offline by the heartbeat sweep
    fn targets_offline(&self, count: usize);
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl AlertMetrics for NoopMetrics {
    fn notification(&self, _: AlertType, _: &str, _: DeliveryStatus) {}
    fn suppressed(&self, _: AlertType, _: &'static str) {}
    fn quota_reset(&self, _: TargetKind, _: usize) {}
    fn targets_offline(&self, _: usize) {}
}

/// Records through the `metrics` facade for the Prometheus exporter
#[derive(Debug, Clone, Copy, Default)]
pub struct PrometheusMetrics;

impl AlertMetrics for PrometheusMetrics {
    fn notification(&self, alert_type: AlertType, channel_type: &str, status: DeliveryStatus) {
        metrics::counter!(
            "quotawatch_notifications_total",
            "alert_type" => alert_type.as_str(),
            "channel_type" => channel_type.to_string(),
            "status" => status.as_str()
        )
        .increment(1);
    }

    fn suppressed(&self, alert_type: AlertType, reason: &'static str) {
        metrics::counter!(
            "quotawatch_alerts_suppressed_total",
            "alert_type" => alert_type.as_str(),
            "reason" => reason
        )
        .increment(1);
    }

    fn quota_reset(&self, kind: TargetKind, count: usize) {
        metrics::counter!("quotawatch_quota_resets_total", "kind" => kind.as_str())
            .increment(count as u64);
    }

    fn targets_offline(&self, count: usize) {
        metrics::counter!("quotawatch_targets_offline_total").increment(count as u64);
    }
}

/// In-process counters for assertions
#[cfg(test)]
#[derive(Debug, Default)]
pub struct CountingMetrics {
    /// Successful deliveries
    pub sent: AtomicU64,
    /// Failed deliveries
    pub failed: AtomicU64,
    /// Suppressed alerts
    pub suppressed: AtomicU64,
    /// Reset targets
    pub resets: AtomicU64,
    /// Nodes marked offline
    pub offline: AtomicU64,
}

#[cfg(test)]
impl CountingMetrics {
    /// Read a counter
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
impl AlertMetrics for CountingMetrics {
    fn notification(&self, _: AlertType, _: &str, status: DeliveryStatus) {
        match status {
            DeliveryStatus::Sent => self.sent.fetch_add(1, Ordering::Relaxed),
            DeliveryStatus::Failed => self.failed.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn suppressed(&self, _: AlertType, _: &'static str) {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
    }

    fn quota_reset(&self, _: TargetKind, count: usize) {
        self.resets.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn targets_offline(&self, count: usize) {
        self.offline.fetch_add(count as u64, Ordering::Relaxed);
    }
}
