//! SQLite ledger for optimizer invocations. Mirrors the teacher's
//! `optimization_history`/`performance_snapshots` schema style, repointed at
//! walk-forward segments and bad-combo memory instead of per-strategy grid
//! cells.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

#[derive(Clone)]
pub struct OptimizerDb {
    pool: SqlitePool,
}

#[derive(Debug, Clone)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub deployed: bool,
    pub baseline_oos_sharpe: f64,
    pub candidate_oos_sharpe: f64,
}

#[derive(Debug, Clone)]
pub struct SegmentResultRecord {
    pub run_id: Uuid,
    pub segment_index: i64,
    pub train_sharpe: f64,
    pub oos_sharpe: f64,
    pub oos_max_drawdown: f64,
}

#[derive(Debug, Clone)]
pub struct BadComboRecord {
    pub parameter_hash: String,
    pub score_percentile: f64,
}

impl OptimizerDb {
    pub async fn connect(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent)
                .await
                .context("failed to create optimizer database directory")?;
        }

        let url = format!("sqlite://{}", path.display());
        let options = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("failed to connect to optimizer database")?;

        let db = Self { pool };
        db.init().await?;
        Ok(db)
    }

    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS optimizer_runs (
                run_id TEXT PRIMARY KEY,
                started_at TEXT NOT NULL,
                finished_at TEXT NOT NULL,
                deployed BOOLEAN NOT NULL,
                baseline_oos_sharpe REAL NOT NULL,
                candidate_oos_sharpe REAL NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create optimizer_runs table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS segment_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                run_id TEXT NOT NULL,
                segment_index INTEGER NOT NULL,
                train_sharpe REAL NOT NULL,
                oos_sharpe REAL NOT NULL,
                oos_max_drawdown REAL NOT NULL,
                FOREIGN KEY (run_id) REFERENCES optimizer_runs(run_id)
            );
            CREATE INDEX IF NOT EXISTS idx_segment_results_run ON segment_results (run_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create segment_results table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS bad_combos (
                parameter_hash TEXT PRIMARY KEY,
                score_percentile REAL NOT NULL,
                first_seen TEXT NOT NULL,
                last_seen TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to create bad_combos table")?;

        info!("optimizer database schema initialized");
        Ok(())
    }

    pub async fn record_run(&self, run: &RunRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO optimizer_runs (run_id, started_at, finished_at, deployed, baseline_oos_sharpe, candidate_oos_sharpe)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(run.run_id.to_string())
        .bind(run.started_at.to_rfc3339())
        .bind(run.finished_at.to_rfc3339())
        .bind(run.deployed)
        .bind(run.baseline_oos_sharpe)
        .bind(run.candidate_oos_sharpe)
        .execute(&self.pool)
        .await
        .context("failed to insert optimizer run record")?;
        Ok(())
    }

    pub async fn record_segment(&self, segment: &SegmentResultRecord) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO segment_results (run_id, segment_index, train_sharpe, oos_sharpe, oos_max_drawdown)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(segment.run_id.to_string())
        .bind(segment.segment_index)
        .bind(segment.train_sharpe)
        .bind(segment.oos_sharpe)
        .bind(segment.oos_max_drawdown)
        .execute(&self.pool)
        .await
        .context("failed to insert segment result")?;
        Ok(())
    }

    pub async fn record_bad_combo(&self, combo: &BadComboRecord, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO bad_combos (parameter_hash, score_percentile, first_seen, last_seen)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(parameter_hash) DO UPDATE SET score_percentile = excluded.score_percentile, last_seen = excluded.last_seen"#,
        )
        .bind(&combo.parameter_hash)
        .bind(combo.score_percentile)
        .bind(now.to_rfc3339())
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to upsert bad combo")?;
        Ok(())
    }

    pub async fn is_bad_combo(&self, parameter_hash: &str) -> Result<bool> {
        let row: Option<(String,)> = sqlx::query_as("SELECT parameter_hash FROM bad_combos WHERE parameter_hash = ?")
            .bind(parameter_hash)
            .fetch_optional(&self.pool)
            .await
            .context("failed to query bad combo")?;
        Ok(row.is_some())
    }

    /// Loads every remembered bad-combo hash so a search loop can filter
    /// candidates synchronously instead of awaiting a query per candidate.
    pub async fn list_bad_combo_hashes(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT parameter_hash FROM bad_combos")
            .fetch_all(&self.pool)
            .await
            .context("failed to list bad combos")?;
        Ok(rows.into_iter().map(|(hash,)| hash).collect())
    }

    pub async fn list_runs(&self, limit: i64) -> Result<Vec<RunRecord>> {
        let rows: Vec<(String, String, String, bool, f64, f64)> = sqlx::query_as(
            r#"SELECT run_id, started_at, finished_at, deployed, baseline_oos_sharpe, candidate_oos_sharpe
               FROM optimizer_runs ORDER BY finished_at DESC LIMIT ?"#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list optimizer runs")?;

        Ok(rows
            .into_iter()
            .filter_map(|(run_id, started_at, finished_at, deployed, baseline, candidate)| {
                Some(RunRecord {
                    run_id: Uuid::parse_str(&run_id).ok()?,
                    started_at: DateTime::parse_from_rfc3339(&started_at).ok()?.with_timezone(&Utc),
                    finished_at: DateTime::parse_from_rfc3339(&finished_at).ok()?.with_timezone(&Utc),
                    deployed,
                    baseline_oos_sharpe: baseline,
                    candidate_oos_sharpe: candidate,
                })
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrips_run_and_bad_combo() {
        let path = std::env::temp_dir().join(format!("xsmom_optdb_{}.sqlite", Uuid::new_v4()));
        let db = OptimizerDb::connect(&path).await.expect("connect");

        let run = RunRecord {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            deployed: true,
            baseline_oos_sharpe: 1.0,
            candidate_oos_sharpe: 1.4,
        };
        db.record_run(&run).await.expect("record run");

        db.record_bad_combo(
            &BadComboRecord {
                parameter_hash: "abc123".to_string(),
                score_percentile: 0.02,
            },
            Utc::now(),
        )
        .await
        .expect("record bad combo");

        assert!(db.is_bad_combo("abc123").await.expect("query"));
        assert!(!db.is_bad_combo("nonexistent").await.expect("query"));

        let runs = db.list_runs(10).await.expect("list");
        assert_eq!(runs.len(), 1);
        assert!(runs[0].deployed);

        let _ = std::fs::remove_file(&path);
    }
}
