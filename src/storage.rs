use crate::{error::UsageError, provider::Provider};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow},
};
use std::{
    convert::TryFrom,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

/// Whose records a query selects. Organization scope spans every user in the
/// organization; user scope is the caller's own records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    User(String),
    Organization(String),
}

/// One logged AI call. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub id: i64,
    pub user_id: String,
    pub organization_id: String,
    pub provider: Provider,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub cost: f64,
    pub latency_ms: u64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUsageRecord {
    pub user_id: String,
    pub organization_id: String,
    pub provider: Provider,
    pub model: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub cost: f64,
    pub latency_ms: u64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Storage {
    pool: Arc<SqlitePool>,
    path: PathBuf,
}

impl Storage {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path_buf = path.as_ref().to_path_buf();
        let options = SqliteConnectOptions::new()
            .filename(&path_buf)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| "failed to connect to sqlite database")?;

        Ok(Self {
            pool: Arc::new(pool),
            path: path_buf,
        })
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS usage_records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                organization_id TEXT NOT NULL,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                total_tokens INTEGER NOT NULL DEFAULT 0,
                input_cost REAL NOT NULL DEFAULT 0.0,
                output_cost REAL NOT NULL DEFAULT 0.0,
                cost REAL NOT NULL DEFAULT 0.0,
                latency_ms INTEGER NOT NULL DEFAULT 0,
                success INTEGER NOT NULL DEFAULT 1,
                timestamp TEXT NOT NULL
            );
            "#,
        )
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to ensure usage_records schema")?;

        // Backfill cost-split columns for databases written before the split
        // was persisted.
        let _ = sqlx::query(
            r#"ALTER TABLE usage_records ADD COLUMN input_cost REAL NOT NULL DEFAULT 0.0;"#,
        )
        .execute(&*self.pool)
        .await;
        let _ = sqlx::query(
            r#"ALTER TABLE usage_records ADD COLUMN output_cost REAL NOT NULL DEFAULT 0.0;"#,
        )
        .execute(&*self.pool)
        .await;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_usage_records_user_timestamp
            ON usage_records(user_id, timestamp);
            "#,
        )
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to ensure usage_records user index")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_usage_records_org_timestamp
            ON usage_records(organization_id, timestamp);
            "#,
        )
        .execute(&*self.pool)
        .await
        .with_context(|| "failed to ensure usage_records organization index")?;

        Ok(())
    }

    pub async fn insert_record(&self, record: NewUsageRecord) -> Result<UsageRecord, UsageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO usage_records (
                user_id, organization_id, provider, model,
                input_tokens, output_tokens, total_tokens,
                input_cost, output_cost, cost,
                latency_ms, success, timestamp
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
            "#,
        )
        .bind(&record.user_id)
        .bind(&record.organization_id)
        .bind(record.provider.as_str())
        .bind(&record.model)
        .bind(i64::try_from(record.input_tokens).unwrap_or(i64::MAX))
        .bind(i64::try_from(record.output_tokens).unwrap_or(i64::MAX))
        .bind(i64::try_from(record.total_tokens).unwrap_or(i64::MAX))
        .bind(record.input_cost)
        .bind(record.output_cost)
        .bind(record.cost)
        .bind(i64::try_from(record.latency_ms).unwrap_or(i64::MAX))
        .bind(record.success)
        .bind(record.timestamp.to_rfc3339())
        .execute(&*self.pool)
        .await?;

        Ok(UsageRecord {
            id: result.last_insert_rowid(),
            user_id: record.user_id,
            organization_id: record.organization_id,
            provider: record.provider,
            model: record.model,
            input_tokens: record.input_tokens,
            output_tokens: record.output_tokens,
            total_tokens: record.total_tokens,
            input_cost: record.input_cost,
            output_cost: record.output_cost,
            cost: record.cost,
            latency_ms: record.latency_ms,
            success: record.success,
            timestamp: record.timestamp,
        })
    }

    /// Records for a scope inside [start, end], optionally narrowed to one
    /// provider. Row order is unspecified; callers sort or bucket themselves.
    pub async fn find_records(
        &self,
        scope: &Scope,
        provider: Option<Provider>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<UsageRecord>, UsageError> {
        let sql = match scope {
            Scope::User(_) => {
                r#"
                SELECT id, user_id, organization_id, provider, model,
                       input_tokens, output_tokens, total_tokens,
                       input_cost, output_cost, cost,
                       latency_ms, success, timestamp
                FROM usage_records
                WHERE user_id = ?1
                  AND timestamp BETWEEN ?2 AND ?3
                  AND (?4 = '' OR LOWER(provider) = ?4)
                "#
            }
            Scope::Organization(_) => {
                r#"
                SELECT id, user_id, organization_id, provider, model,
                       input_tokens, output_tokens, total_tokens,
                       input_cost, output_cost, cost,
                       latency_ms, success, timestamp
                FROM usage_records
                WHERE organization_id = ?1
                  AND timestamp BETWEEN ?2 AND ?3
                  AND (?4 = '' OR LOWER(provider) = ?4)
                "#
            }
        };

        let rows = sqlx::query(sql)
            .bind(scope_id(scope))
            .bind(start.to_rfc3339())
            .bind(end.to_rfc3339())
            .bind(provider.map(Provider::as_str).unwrap_or(""))
            .fetch_all(&*self.pool)
            .await?;

        Ok(map_records(rows))
    }

    /// Most recent records for a scope, newest first.
    pub async fn recent_records(
        &self,
        scope: &Scope,
        provider: Option<Provider>,
        limit: usize,
    ) -> Result<Vec<UsageRecord>, UsageError> {
        let sql = match scope {
            Scope::User(_) => {
                r#"
                SELECT id, user_id, organization_id, provider, model,
                       input_tokens, output_tokens, total_tokens,
                       input_cost, output_cost, cost,
                       latency_ms, success, timestamp
                FROM usage_records
                WHERE user_id = ?1
                  AND (?2 = '' OR LOWER(provider) = ?2)
                ORDER BY timestamp DESC, id DESC
                LIMIT ?3
                "#
            }
            Scope::Organization(_) => {
                r#"
                SELECT id, user_id, organization_id, provider, model,
                       input_tokens, output_tokens, total_tokens,
                       input_cost, output_cost, cost,
                       latency_ms, success, timestamp
                FROM usage_records
                WHERE organization_id = ?1
                  AND (?2 = '' OR LOWER(provider) = ?2)
                ORDER BY timestamp DESC, id DESC
                LIMIT ?3
                "#
            }
        };

        let rows = sqlx::query(sql)
            .bind(scope_id(scope))
            .bind(provider.map(Provider::as_str).unwrap_or(""))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await?;

        Ok(map_records(rows))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn scope_id(scope: &Scope) -> &str {
    match scope {
        Scope::User(id) => id,
        Scope::Organization(id) => id,
    }
}

fn map_records(rows: Vec<SqliteRow>) -> Vec<UsageRecord> {
    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(record) = map_record(&row) {
            records.push(record);
        }
    }
    records
}

/// Rows that fail to parse are skipped with a warning rather than failing the
/// whole query; the provider column predates the closed enum in old databases.
fn map_record(row: &SqliteRow) -> Option<UsageRecord> {
    let provider_raw = row.try_get::<String, _>("provider").unwrap_or_default();
    let provider = match Provider::from_str(&provider_raw) {
        Ok(provider) => provider,
        Err(err) => {
            tracing::warn!(error = %err, "skipping usage record with unrecognized provider");
            return None;
        }
    };

    let timestamp_raw = row.try_get::<String, _>("timestamp").unwrap_or_default();
    let timestamp = match DateTime::parse_from_rfc3339(&timestamp_raw) {
        Ok(parsed) => parsed.with_timezone(&Utc),
        Err(err) => {
            tracing::warn!(error = %err, timestamp = %timestamp_raw, "skipping usage record with invalid timestamp");
            return None;
        }
    };

    Some(UsageRecord {
        id: row.try_get::<i64, _>("id").unwrap_or(0),
        user_id: row.try_get::<String, _>("user_id").unwrap_or_default(),
        organization_id: row
            .try_get::<String, _>("organization_id")
            .unwrap_or_default(),
        provider,
        model: row.try_get::<String, _>("model").unwrap_or_default(),
        input_tokens: row.try_get::<i64, _>("input_tokens").unwrap_or(0) as u64,
        output_tokens: row.try_get::<i64, _>("output_tokens").unwrap_or(0) as u64,
        total_tokens: row.try_get::<i64, _>("total_tokens").unwrap_or(0) as u64,
        input_cost: row.try_get::<f64, _>("input_cost").unwrap_or(0.0),
        output_cost: row.try_get::<f64, _>("output_cost").unwrap_or(0.0),
        cost: row.try_get::<f64, _>("cost").unwrap_or(0.0),
        latency_ms: row.try_get::<i64, _>("latency_ms").unwrap_or(0) as u64,
        success: row.try_get::<bool, _>("success").unwrap_or(true),
        timestamp,
    })
}
