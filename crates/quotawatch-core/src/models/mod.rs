//! Data models for QuotaWatch

mod alert;
mod target;

pub use alert::*;
pub use target::*;
