//! Alerting engine for QuotaWatch
//!
//! Evaluates traffic quotas and node liveness, applies rule cooldowns and
//! warning deduplication, and delivers alerts through Telegram, webhook and
//! SMTP channels.

mod dispatcher;
mod evaluator;
mod factory;
mod guard;
pub mod message;
mod metrics;
mod monitor;
mod notifier;
mod repository;


pub use dispatcher::{Alert, AlertDispatcher, DispatchSummary};
pub use evaluator::{QuotaCheck, QuotaEvaluator};
pub use factory::NotifierFactory;
pub use guard::{rule_lock_key, target_lock_key, CooldownGuard, KeyedLocks, Verdict};
pub use self::metrics::{AlertMetrics, NoopMetrics, PrometheusMetrics};
#[cfg(test)]
pub(crate) use self::metrics::CountingMetrics;
pub use monitor::{QuotaMonitor, ResetReport, ScanReport, RESET_GUARD_DAYS};
pub use notifier::{
    escape_markdown_v2, ChatId, Notifier, NotifyError, SmtpConfig, SmtpNotifier, TelegramConfig,
    TelegramNotifier, WebhookConfig, WebhookNotifier,
};
pub use repository::{
    AlertLogRepository, AlertStore, ChannelRepository, RuleRepository, TargetRepository,
};
