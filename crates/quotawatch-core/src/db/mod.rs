//! Database layer for QuotaWatch
//!
//! Provides the PostgreSQL pool and store, plus an in-memory store with the
//! same semantics.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{PgAlertStore, PostgresPool};

use crate::config::Config;
use crate::error::Result;

/// Database connections bundle
#[derive(Clone)]
pub struct Database {
    /// PostgreSQL connection pool
    pub postgres: PostgresPool,
}

impl Database {
    /// Connect, applying migrations when configured to
    pub async fn new(config: &Config) -> Result<Self> {
        let postgres = PostgresPool::new(&config.database).await?;
        let db = Self { postgres };

        if config.database.run_migrations {
            db.migrate().await?;
        }
        Ok(db)
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        self.postgres.migrate().await
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<()> {
        self.postgres.health_check().await
    }

    /// Alert store over this database
    pub fn alert_store(&self) -> PgAlertStore {
        PgAlertStore::new(&self.postgres)
    }
}
