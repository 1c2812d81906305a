//! PostgreSQL connection and queries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::alerting::message::dedup_marker;
use crate::alerting::{AlertLogRepository, ChannelRepository, RuleRepository, TargetRepository};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};
use crate::models::{
    AlertLog, AlertRule, AlertRuleInput, AlertType, DeliveryStatus, LivenessStatus,
    MonitoredTarget, NewAlertLog, NotifyChannel, TargetKind,
};

/// PostgreSQL connection pool
#[derive(Clone)]
pub struct PostgresPool {
    pool: PgPool,
}

impl PostgresPool {
    /// Create a new PostgreSQL connection pool
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Alert store over the panel's tables
#[derive(Clone)]
pub struct PgAlertStore {
    pool: PgPool,
}

impl PgAlertStore {
    /// Create a store sharing the given pool
    pub fn new(pool: &PostgresPool) -> Self {
        Self {
            pool: pool.pool.clone(),
        }
    }
}

fn table(kind: TargetKind) -> &'static str {
    match kind {
        TargetKind::Node => "nodes",
        TargetKind::Client => "clients",
    }
}

const TARGET_COLUMNS: &str = "id, name, traffic_quota, quota_used, quota_exceeded, \
     quota_reset_day, quota_reset_at, status, last_seen";

#[async_trait]
impl RuleRepository for PgAlertStore {
    async fn find_enabled_by_type(&self, alert_type: AlertType) -> Result<Vec<AlertRule>> {
        let rows = sqlx::query_as::<_, AlertRuleRow>(
            r#"
            SELECT * FROM alert_rules
            WHERE enabled = true AND alert_type = $1
            ORDER BY id
            "#,
        )
        .bind(alert_type.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(AlertRule::try_from).collect()
    }

    async fn get_rule(&self, id: i64) -> Result<Option<AlertRule>> {
        let row = sqlx::query_as::<_, AlertRuleRow>("SELECT * FROM alert_rules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(AlertRule::try_from).transpose()
    }

    async fn update_last_alert_at(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE alert_rules SET last_alert_at = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::not_found("alert rule", id));
        }
        Ok(())
    }

    async fn count_rules(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alert_rules")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn create_rule(&self, input: &AlertRuleInput) -> Result<AlertRule> {
        let row = sqlx::query_as::<_, AlertRuleRow>(
            r#"
            INSERT INTO alert_rules (name, alert_type, condition, enabled, cooldown_minutes, channel_ids)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(&input.name)
        .bind(input.alert_type.as_str())
        .bind(&input.condition)
        .bind(input.enabled)
        .bind(input.cooldown_minutes)
        .bind(&input.channel_ids)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }
}

#[async_trait]
impl ChannelRepository for PgAlertStore {
    async fn get_channel(&self, id: i64) -> Result<Option<NotifyChannel>> {
        let row =
            sqlx::query_as::<_, NotifyChannelRow>("SELECT * FROM notify_channels WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(Into::into))
    }
}

#[async_trait]
impl AlertLogRepository for PgAlertStore {
    async fn append_log(&self, log: &NewAlertLog) -> Result<AlertLog> {
        let row = sqlx::query_as::<_, AlertLogRow>(
            r#"
            INSERT INTO alert_logs (
                rule_id, rule_name, alert_type, message, target_kind, target_id,
                target_name, channel_id, status, dedup_key, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(log.rule_id)
        .bind(&log.rule_name)
        .bind(log.alert_type.as_str())
        .bind(&log.message)
        .bind(log.target_kind.as_str())
        .bind(log.target_id)
        .bind(&log.target_name)
        .bind(log.channel_id)
        .bind(log.status.as_str())
        .bind(&log.dedup_key)
        .bind(log.created_at)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn count_matching_since(
        &self,
        alert_type: AlertType,
        dedup_key: &str,
        since: DateTime<Utc>,
    ) -> Result<i64> {
        // strpos instead of LIKE: keys contain '_'
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM alert_logs
            WHERE alert_type = $1
              AND created_at > $2
              AND (dedup_key = $3 OR strpos(message, $4) > 0)
            "#,
        )
        .bind(alert_type.as_str())
        .bind(since)
        .bind(dedup_key)
        .bind(dedup_marker(dedup_key))
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM alert_logs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn list_recent(&self, limit: i64, offset: i64) -> Result<(Vec<AlertLog>, i64)> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alert_logs")
            .fetch_one(&self.pool)
            .await?;

        let rows = sqlx::query_as::<_, AlertLogRow>(
            r#"
            SELECT * FROM alert_logs
            ORDER BY created_at DESC, id DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;

        let logs = rows
            .into_iter()
            .map(AlertLog::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok((logs, total))
    }
}

#[async_trait]
impl TargetRepository for PgAlertStore {
    async fn get_target(&self, kind: TargetKind, id: i64) -> Result<Option<MonitoredTarget>> {
        let sql = format!("SELECT {TARGET_COLUMNS} FROM {} WHERE id = $1", table(kind));
        let row = sqlx::query_as::<_, TargetRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.into_target(kind)))
    }

    async fn list_metered(&self, kind: TargetKind) -> Result<Vec<MonitoredTarget>> {
        let sql = format!(
            "SELECT {TARGET_COLUMNS} FROM {} WHERE traffic_quota > 0 ORDER BY id",
            table(kind)
        );
        let rows = sqlx::query_as::<_, TargetRow>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|r| r.into_target(kind)).collect())
    }

    async fn mark_quota_exceeded(&self, kind: TargetKind, id: i64) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET quota_exceeded = true, updated_at = NOW() \
             WHERE id = $1 AND quota_exceeded = false \
               AND traffic_quota > 0 AND quota_used >= traffic_quota",
            table(kind)
        );
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_offline(&self, kind: TargetKind, id: i64) -> Result<bool> {
        let sql = format!(
            "UPDATE {} SET status = 'offline', updated_at = NOW() \
             WHERE id = $1 AND status = 'online'",
            table(kind)
        );
        let result = sqlx::query(&sql).bind(id).execute(&self.pool).await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_stale_online(
        &self,
        kind: TargetKind,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<MonitoredTarget>> {
        let sql = format!(
            "SELECT {TARGET_COLUMNS} FROM {} \
             WHERE status = 'online' AND (last_seen IS NULL OR last_seen < $1) \
             ORDER BY id",
            table(kind)
        );
        let rows = sqlx::query_as::<_, TargetRow>(&sql)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(|r| r.into_target(kind)).collect())
    }

    async fn reset_due_quotas(
        &self,
        kind: TargetKind,
        day: i32,
        reset_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>> {
        let sql = format!(
            "UPDATE {} SET quota_used = 0, quota_exceeded = false, quota_reset_at = $3, \
             updated_at = NOW() \
             WHERE quota_reset_day > 0 AND quota_reset_day = $1 \
               AND (quota_reset_at IS NULL OR quota_reset_at < $2) \
             RETURNING id",
            table(kind)
        );
        let ids: Vec<i64> = sqlx::query_scalar(&sql)
            .bind(day)
            .bind(reset_before)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;

        Ok(ids)
    }
}

// Row types for database queries

#[derive(sqlx::FromRow)]
struct TargetRow {
    id: i64,
    name: String,
    traffic_quota: i64,
    quota_used: i64,
    quota_exceeded: bool,
    quota_reset_day: i32,
    quota_reset_at: Option<DateTime<Utc>>,
    status: String,
    last_seen: Option<DateTime<Utc>>,
}

impl TargetRow {
    fn into_target(self, kind: TargetKind) -> MonitoredTarget {
        MonitoredTarget {
            kind,
            id: self.id,
            name: self.name,
            traffic_quota: self.traffic_quota,
            quota_used: self.quota_used,
            quota_exceeded: self.quota_exceeded,
            quota_reset_day: self.quota_reset_day,
            quota_reset_at: self.quota_reset_at,
            status: LivenessStatus::parse(&self.status),
            last_seen: self.last_seen,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AlertRuleRow {
    id: i64,
    name: String,
    alert_type: String,
    condition: String,
    enabled: bool,
    cooldown_minutes: i64,
    channel_ids: String,
    last_alert_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AlertRuleRow> for AlertRule {
    type Error = Error;

    fn try_from(row: AlertRuleRow) -> Result<Self> {
        Ok(AlertRule {
            id: row.id,
            name: row.name,
            alert_type: row.alert_type.parse().map_err(Error::internal)?,
            condition: row.condition,
            enabled: row.enabled,
            cooldown_minutes: row.cooldown_minutes,
            channel_ids: row.channel_ids,
            last_alert_at: row.last_alert_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct NotifyChannelRow {
    id: i64,
    name: String,
    channel_type: String,
    config: String,
    enabled: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<NotifyChannelRow> for NotifyChannel {
    fn from(row: NotifyChannelRow) -> Self {
        NotifyChannel {
            id: row.id,
            name: row.name,
            channel_type: row.channel_type,
            config: row.config,
            enabled: row.enabled,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AlertLogRow {
    id: i64,
    rule_id: i64,
    rule_name: String,
    alert_type: String,
    message: String,
    target_kind: String,
    target_id: i64,
    target_name: String,
    channel_id: i64,
    status: String,
    dedup_key: Option<String>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AlertLogRow> for AlertLog {
    type Error = Error;

    fn try_from(row: AlertLogRow) -> Result<Self> {
        Ok(AlertLog {
            id: row.id,
            rule_id: row.rule_id,
            rule_name: row.rule_name,
            alert_type: row.alert_type.parse().map_err(Error::internal)?,
            message: row.message,
            target_kind: row.target_kind.parse().map_err(Error::internal)?,
            target_id: row.target_id,
            target_name: row.target_name,
            channel_id: row.channel_id,
            status: DeliveryStatus::parse(&row.status),
            dedup_key: row.dedup_key,
            created_at: row.created_at,
        })
    }
}
