//! # QuotaWatch
//!
//! Quota monitoring and alert dispatch for a proxy management panel.
//!
//! QuotaWatch watches traffic quotas and heartbeats of proxy nodes and their
//! clients, and notifies operators through Telegram, webhooks and email.
//!
//! ## Architecture
//!
//! - **Evaluator**: quota_exceeded and per-threshold quota_warning checks
//! - **Monitor**: offline detection, heartbeat sweep, monthly reset, log retention
//! - **Dispatcher**: rule cooldowns, channel fan-out and the alert log
//! - **Storage**: PostgreSQL, or an in-memory store for dry runs
//!
//! ## Quick Start
//!
//! ```bash
//! # Run the scheduler
//! quotawatch serve
//!
//! # Send a test message through channel 3
//! quotawatch channels test 3
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]

pub mod alerting;
pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use self::config::Config;
pub use error::{Error, Result};

/// Re-exports for convenience
pub mod prelude {
    pub use crate::alerting::{AlertDispatcher, AlertStore, NotifierFactory, QuotaMonitor};
    pub use crate::config::Config;
    pub use crate::db::{Database, MemoryStore, PgAlertStore};
    pub use crate::error::{Error, Result};
    pub use crate::models::*;
}
