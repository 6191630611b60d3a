// src/store.rs
//! SQLite persistence: the raw observation store and the daily roll-up
//! recompute, plus the report queries built on top of them.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::model::{DailyRollup, RawObservation};

/// Storage seam the consumer worker drives. Failures here are transient from
/// the worker's point of view and go through its retry ladder.
#[async_trait]
pub trait ObservationStore: Send + Sync {
    async fn insert_observation(&self, obs: &RawObservation) -> Result<()>;

    /// Recompute the roll-up for `date` from *every* raw observation whose
    /// date matches, and upsert the single roll-up row. Idempotent: re-running
    /// with no new observations yields an identical row (modulo the
    /// updated-at timestamp).
    async fn recompute_rollup(&self, date: NaiveDate) -> Result<DailyRollup>;
}

/// Grand totals across all roll-ups.
#[derive(Debug, Clone, PartialEq)]
pub struct OverviewReport {
    pub total_users: i64,
    pub total_sessions: i64,
    pub total_views: i64,
    pub average_performance: f64,
    pub date_range: Option<(NaiveDate, NaiveDate)>,
}

/// Per-page totals over raw observations.
#[derive(Debug, Clone, PartialEq)]
pub struct PageStats {
    pub page: String,
    pub total_users: i64,
    pub total_sessions: i64,
    pub total_views: i64,
    pub average_performance: f64,
    pub average_lcp_ms: f64,
}

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database file and ensure the schema.
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .with_context(|| format!("opening database {}", db_path.display()))?;

        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA busy_timeout = 5000").execute(&pool).await?;

        init_schema(&pool).await?;
        info!(path = %db_path.display(), "database ready");
        Ok(Self { pool })
    }

    /// In-memory database for tests. Single connection, or each checkout
    /// would see a different empty database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .context("opening in-memory database")?;
        init_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn rollup_for_date(&self, date: NaiveDate) -> Result<Option<DailyRollup>> {
        let row = sqlx::query(
            "SELECT date, total_users, total_sessions, total_views, avg_performance, \
             last_updated_at FROM daily_rollups WHERE date = ?",
        )
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(DailyRollup {
                date: r.try_get("date")?,
                total_users: r.try_get("total_users")?,
                total_sessions: r.try_get("total_sessions")?,
                total_views: r.try_get("total_views")?,
                avg_performance: r.try_get("avg_performance")?,
                last_updated_at: r.try_get::<DateTime<Utc>, _>("last_updated_at")?,
            })
        })
        .transpose()
    }

    pub async fn overview(&self) -> Result<OverviewReport> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(total_users), 0) AS users, \
                    COALESCE(SUM(total_sessions), 0) AS sessions, \
                    COALESCE(SUM(total_views), 0) AS views, \
                    COALESCE(AVG(avg_performance), 0.0) AS perf, \
                    MIN(date) AS from_date, MAX(date) AS to_date \
             FROM daily_rollups",
        )
        .fetch_one(&self.pool)
        .await?;

        let from: Option<NaiveDate> = row.try_get("from_date")?;
        let to: Option<NaiveDate> = row.try_get("to_date")?;
        Ok(OverviewReport {
            total_users: row.try_get("users")?,
            total_sessions: row.try_get("sessions")?,
            total_views: row.try_get("views")?,
            average_performance: row.try_get("perf")?,
            date_range: from.zip(to),
        })
    }

    pub async fn page_stats(&self) -> Result<Vec<PageStats>> {
        let rows = sqlx::query(
            "SELECT page, \
                    SUM(users) AS users, SUM(sessions) AS sessions, SUM(views) AS views, \
                    COALESCE(AVG(performance_score), 0.0) AS perf, \
                    COALESCE(AVG(lcp_ms), 0.0) AS lcp \
             FROM raw_observations GROUP BY page ORDER BY page",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|r| {
                Ok(PageStats {
                    page: r.try_get("page")?,
                    total_users: r.try_get("users")?,
                    total_sessions: r.try_get("sessions")?,
                    total_views: r.try_get("views")?,
                    average_performance: r.try_get("perf")?,
                    average_lcp_ms: r.try_get("lcp")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl ObservationStore for SqliteStore {
    async fn insert_observation(&self, obs: &RawObservation) -> Result<()> {
        sqlx::query(
            "INSERT INTO raw_observations \
             (date, page, users, sessions, views, performance_score, lcp_ms, received_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(obs.date)
        .bind(&obs.page)
        .bind(obs.users)
        .bind(obs.sessions)
        .bind(obs.views)
        .bind(obs.performance_score)
        .bind(obs.lcp_ms)
        .bind(obs.received_at)
        .execute(&self.pool)
        .await
        .context("inserting raw observation")?;

        debug!(page = %obs.page, date = %obs.date, "saved raw observation");
        Ok(())
    }

    async fn recompute_rollup(&self, date: NaiveDate) -> Result<DailyRollup> {
        // Full recompute over the date's observations. AVG skips NULL scores;
        // COALESCE pins the no-scored-observations case to 0.0.
        let row = sqlx::query(
            "SELECT COALESCE(SUM(users), 0) AS users, \
                    COALESCE(SUM(sessions), 0) AS sessions, \
                    COALESCE(SUM(views), 0) AS views, \
                    COALESCE(AVG(performance_score), 0.0) AS perf \
             FROM raw_observations WHERE date = ?",
        )
        .bind(date)
        .fetch_one(&self.pool)
        .await
        .context("summing raw observations")?;

        let rollup = DailyRollup {
            date,
            total_users: row.try_get("users")?,
            total_sessions: row.try_get("sessions")?,
            total_views: row.try_get("views")?,
            avg_performance: row.try_get("perf")?,
            last_updated_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO daily_rollups \
             (date, total_users, total_sessions, total_views, avg_performance, last_updated_at) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(date) DO UPDATE SET \
                total_users = excluded.total_users, \
                total_sessions = excluded.total_sessions, \
                total_views = excluded.total_views, \
                avg_performance = excluded.avg_performance, \
                last_updated_at = excluded.last_updated_at",
        )
        .bind(rollup.date)
        .bind(rollup.total_users)
        .bind(rollup.total_sessions)
        .bind(rollup.total_views)
        .bind(rollup.avg_performance)
        .bind(rollup.last_updated_at)
        .execute(&self.pool)
        .await
        .context("upserting daily rollup")?;

        debug!(date = %date, "recomputed daily rollup");
        Ok(rollup)
    }
}

/// Idempotent schema setup, safe to run on every startup.
async fn init_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS raw_observations ( \
            id INTEGER PRIMARY KEY AUTOINCREMENT, \
            date TEXT NOT NULL, \
            page TEXT NOT NULL, \
            users INTEGER NOT NULL, \
            sessions INTEGER NOT NULL, \
            views INTEGER NOT NULL, \
            performance_score REAL, \
            lcp_ms INTEGER, \
            received_at TEXT NOT NULL \
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_raw_observations_date_page \
         ON raw_observations (date, page)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS daily_rollups ( \
            date TEXT PRIMARY KEY, \
            total_users INTEGER NOT NULL, \
            total_sessions INTEGER NOT NULL, \
            total_views INTEGER NOT NULL, \
            avg_performance REAL NOT NULL, \
            last_updated_at TEXT NOT NULL \
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}
