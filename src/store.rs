//! Durable Store (spec §4.1): atomic persistence and the sole arbiter of
//! task state transitions, backed by a single SQLite database file.
//!
//! Every mutating operation either commits in full or leaves the database
//! unchanged — `sqlx::Transaction` rolls back on drop unless `commit()` is
//! called. The pool is deliberately capped at one connection so that
//! `acquire_tasks`'s `BEGIN IMMEDIATE` transaction serializes against every
//! other writer in the process (spec §4.1 "Failure semantics").

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::error::StoreError;
use crate::types::{
    Asset, AssetVersion, Exception, ExceptionStatus, Run, RunStatus, Task, TaskStatus,
    TaskStatusCounts, TaskType,
};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    completed_at TEXT,
    label TEXT
);

CREATE TABLE IF NOT EXISTS crawl_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL,
    url TEXT NOT NULL,
    depth INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'pending',
    priority INTEGER NOT NULL DEFAULT 0,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    lease_owner TEXT,
    lease_expires_at TEXT,
    next_run_at TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    task_type TEXT NOT NULL DEFAULT 'page',
    UNIQUE(run_id, url),
    FOREIGN KEY(run_id) REFERENCES runs(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS assets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL,
    source_url TEXT NOT NULL,
    asset_key TEXT NOT NULL,
    asset_type TEXT NOT NULL,
    status TEXT NOT NULL,
    checksum TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(run_id, asset_key),
    FOREIGN KEY(run_id) REFERENCES runs(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS asset_versions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    asset_id INTEGER NOT NULL,
    version INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    created_at TEXT NOT NULL,
    raw_path TEXT,
    normalized_path TEXT,
    metadata_json TEXT,
    UNIQUE(asset_id, version),
    FOREIGN KEY(asset_id) REFERENCES assets(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS exceptions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id INTEGER NOT NULL,
    stage TEXT NOT NULL,
    url TEXT,
    asset_key TEXT,
    message TEXT NOT NULL,
    context_json TEXT,
    status TEXT NOT NULL DEFAULT 'open',
    created_at TEXT NOT NULL,
    resolved_at TEXT,
    FOREIGN KEY(run_id) REFERENCES runs(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_crawl_tasks_status ON crawl_tasks(status);
CREATE INDEX IF NOT EXISTS idx_assets_type ON assets(asset_type);
CREATE INDEX IF NOT EXISTS idx_assets_run_id ON assets(run_id);
CREATE INDEX IF NOT EXISTS idx_exceptions_status ON exceptions(status);
"#;

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if needed) the SQLite file at `path` and runs
    /// migrations. Use `":memory:"` for ephemeral/test stores.
    pub async fn connect(path: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(path)
            .unwrap_or_else(|_| SqliteConnectOptions::new().filename(path))
            .create_if_missing(true)
            .foreign_keys(true);
        // A single writer connection makes `BEGIN IMMEDIATE` transactions
        // serialize against every other caller in this process (spec §4.1).
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Idempotent schema creation, plus the `task_type` backfill migration
    /// for databases created before it existed (spec §6).
    async fn migrate(&self) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await?;
        for statement in SCHEMA_SQL.split(';') {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            sqlx::query(statement).execute(&mut *conn).await?;
        }

        let columns = sqlx::query("PRAGMA table_info(crawl_tasks)")
            .fetch_all(&mut *conn)
            .await?;
        let has_task_type = columns
            .iter()
            .any(|row| row.get::<String, _>("name") == "task_type");
        if !has_task_type {
            log::info!(target: "sitesync::store", "backfilling crawl_tasks.task_type on pre-existing schema");
            sqlx::query(
                "ALTER TABLE crawl_tasks ADD COLUMN task_type TEXT NOT NULL DEFAULT 'page'",
            )
            .execute(&mut *conn)
            .await?;
        }
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_crawl_tasks_task_type ON crawl_tasks(task_type)")
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    // ---- Runs ----------------------------------------------------------

    pub async fn start_run(&self, source: &str, label: Option<&str>) -> Result<Run, StoreError> {
        let started_at = Utc::now();
        let id = sqlx::query(
            "INSERT INTO runs (source, status, started_at, label) VALUES (?, ?, ?, ?)",
        )
        .bind(source)
        .bind(RunStatus::Initialized.as_str())
        .bind(started_at)
        .bind(label)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        Ok(Run {
            id,
            source: source.to_string(),
            status: RunStatus::Initialized,
            started_at,
            completed_at: None,
            label: label.map(str::to_string),
        })
    }

    pub async fn resume_run(&self, source: &str) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query(
            "SELECT id, source, status, started_at, completed_at, label FROM runs \
             WHERE source = ? AND status IN ('initialized', 'running', 'stopped') \
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_run(&r)).transpose()
    }

    pub async fn mark_run_status(
        &self,
        run_id: i64,
        status: RunStatus,
        completed: bool,
    ) -> Result<(), StoreError> {
        if completed {
            sqlx::query("UPDATE runs SET status = ?, completed_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(Utc::now())
                .bind(run_id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("UPDATE runs SET status = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(run_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn get_run(&self, run_id: i64) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query(
            "SELECT id, source, status, started_at, completed_at, label FROM runs WHERE id = ?",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| row_to_run(&r)).transpose()
    }

    // ---- Tasks -----------------------------------------------------------

    /// Insert-or-ignore seeds by `(run_id, url)`. Returns the count of rows
    /// actually inserted (spec §8 "Seed idempotence").
    pub async fn enqueue_seed_tasks(
        &self,
        run_id: i64,
        seeds: &[(String, i64)],
        task_type: TaskType,
    ) -> Result<u64, StoreError> {
        if seeds.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let mut inserted = 0u64;
        for (url, depth) in seeds {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO crawl_tasks \
                 (run_id, url, depth, status, priority, attempt_count, next_run_at, \
                  created_at, updated_at, task_type) \
                 VALUES (?, ?, ?, 'pending', 0, 0, ?, ?, ?, ?)",
            )
            .bind(run_id)
            .bind(url)
            .bind(depth)
            .bind(now)
            .bind(now)
            .bind(now)
            .bind(task_type.as_str())
            .execute(&mut *tx)
            .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// The queue's heart (spec §4.1). Runs lease-reclaim, selection, and
    /// claim in a single `BEGIN IMMEDIATE` transaction.
    pub async fn acquire_tasks(
        &self,
        run_id: i64,
        limit: i64,
        lease_owner: &str,
        lease_seconds: f64,
        max_retries: u32,
        backoff_seconds: f64,
    ) -> Result<Vec<Task>, StoreError> {
        let max_retries = max_retries as i64;
        let now = Utc::now();
        let next_run_after_backoff = now + chrono::Duration::milliseconds((backoff_seconds * 1000.0) as i64);
        let lease_expires_at = now + chrono::Duration::milliseconds((lease_seconds * 1000.0) as i64);

        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let reclaim_result: Result<Vec<Task>, StoreError> = async {
            // Leases past expiry with no retries left: straight to error.
            sqlx::query(
                "UPDATE crawl_tasks SET status = 'error', attempt_count = attempt_count + 1, \
                 lease_owner = NULL, lease_expires_at = NULL, next_run_at = ?, \
                 last_error = 'lease expired', updated_at = ? \
                 WHERE run_id = ? AND status = 'in_progress' AND lease_expires_at IS NOT NULL \
                 AND lease_expires_at <= ? AND attempt_count + 1 > ?",
            )
            .bind(now)
            .bind(now)
            .bind(run_id)
            .bind(now)
            .bind(max_retries)
            .execute(&mut *conn)
            .await?;

            // Leases past expiry with retries remaining: back to pending.
            sqlx::query(
                "UPDATE crawl_tasks SET status = 'pending', attempt_count = attempt_count + 1, \
                 lease_owner = NULL, lease_expires_at = NULL, next_run_at = ?, \
                 last_error = 'lease expired', updated_at = ? \
                 WHERE run_id = ? AND status = 'in_progress' AND lease_expires_at IS NOT NULL \
                 AND lease_expires_at <= ? AND attempt_count + 1 <= ?",
            )
            .bind(next_run_after_backoff)
            .bind(now)
            .bind(run_id)
            .bind(now)
            .bind(max_retries)
            .execute(&mut *conn)
            .await?;

            let rows = sqlx::query(
                "SELECT id, run_id, url, depth, status, attempt_count, last_error, \
                 lease_owner, lease_expires_at, next_run_at, task_type, priority, \
                 created_at, updated_at \
                 FROM crawl_tasks WHERE run_id = ? AND status = 'pending' AND next_run_at <= ? \
                 ORDER BY priority DESC, id ASC LIMIT ?",
            )
            .bind(run_id)
            .bind(now)
            .bind(limit)
            .fetch_all(&mut *conn)
            .await?;

            let ids: Vec<i64> = rows
                .iter()
                .map(|r| r.try_get::<i64, _>("id"))
                .collect::<Result<_, _>>()?;

            for id in &ids {
                sqlx::query(
                    "UPDATE crawl_tasks SET status = 'in_progress', lease_owner = ?, \
                     lease_expires_at = ?, updated_at = ? WHERE id = ?",
                )
                .bind(lease_owner)
                .bind(lease_expires_at)
                .bind(now)
                .bind(id)
                .execute(&mut *conn)
                .await?;
            }

            if ids.is_empty() {
                return Ok(Vec::new());
            }

            let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!(
                "SELECT id, run_id, url, depth, status, attempt_count, last_error, \
                 lease_owner, lease_expires_at, next_run_at, task_type, priority, \
                 created_at, updated_at FROM crawl_tasks WHERE id IN ({placeholders}) \
                 ORDER BY priority DESC, id ASC"
            );
            let mut query = sqlx::query(&sql);
            for id in &ids {
                query = query.bind(id);
            }
            let updated_rows = query.fetch_all(&mut *conn).await?;
            updated_rows.iter().map(row_to_task).collect()
        }
        .await;

        match reclaim_result {
            Ok(tasks) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(tasks)
            }
            Err(err) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Err(err)
            }
        }
    }

    pub async fn complete_task(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE crawl_tasks SET status = 'finished', lease_owner = NULL, \
             lease_expires_at = NULL, updated_at = ? WHERE id = ? AND status = 'in_progress'",
        )
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `attempt_count + 1 >= max_retries` ⇒ `error`; else `pending` with a
    /// single backoff quantum (spec §4.1).
    pub async fn fail_task(
        &self,
        id: i64,
        error: &str,
        backoff_seconds: f64,
        max_retries: u32,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let task = self.get_task(id).await?;
        let Some(task) = task else {
            return Ok(());
        };
        let exhausted = task.attempt_count + 1 >= max_retries as i64;
        if exhausted {
            sqlx::query(
                "UPDATE crawl_tasks SET status = 'error', attempt_count = attempt_count + 1, \
                 lease_owner = NULL, lease_expires_at = NULL, last_error = ?, updated_at = ? \
                 WHERE id = ?",
            )
            .bind(error)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        } else {
            let next_run_at = now + chrono::Duration::milliseconds((backoff_seconds * 1000.0) as i64);
            sqlx::query(
                "UPDATE crawl_tasks SET status = 'pending', attempt_count = attempt_count + 1, \
                 lease_owner = NULL, lease_expires_at = NULL, last_error = ?, next_run_at = ?, \
                 updated_at = ? WHERE id = ?",
            )
            .bind(error)
            .bind(next_run_at)
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    pub async fn mark_task_error(&self, id: i64, error: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE crawl_tasks SET status = 'error', attempt_count = attempt_count + 1, \
             lease_owner = NULL, lease_expires_at = NULL, last_error = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `in_progress → pending` without incrementing `attempt_count` (spec
    /// §4.1); used by graceful shutdown.
    pub async fn release_task(&self, id: i64, reason: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE crawl_tasks SET status = 'pending', lease_owner = NULL, \
             lease_expires_at = NULL, last_error = ?, updated_at = ? \
             WHERE id = ? AND status = 'in_progress'",
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn release_in_progress_tasks(
        &self,
        run_id: i64,
        reason: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE crawl_tasks SET status = 'pending', lease_owner = NULL, \
             lease_expires_at = NULL, last_error = ?, updated_at = ? \
             WHERE run_id = ? AND status = 'in_progress'",
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn get_task(&self, id: i64) -> Result<Option<Task>, StoreError> {
        let row = sqlx::query(
            "SELECT id, run_id, url, depth, status, attempt_count, last_error, \
             lease_owner, lease_expires_at, next_run_at, task_type, priority, \
             created_at, updated_at FROM crawl_tasks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(row_to_task).transpose()
    }

    pub async fn get_task_status_counts(&self, run_id: i64) -> Result<TaskStatusCounts, StoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) as n FROM crawl_tasks WHERE run_id = ? GROUP BY status",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        let mut counts = TaskStatusCounts::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n: i64 = row.try_get("n")?;
            match status.as_str() {
                "pending" => counts.pending = n,
                "in_progress" => counts.in_progress = n,
                "finished" => counts.finished = n,
                "error" => counts.error = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    pub async fn count_active_tasks(&self, run_id: i64) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) as n FROM crawl_tasks \
             WHERE run_id = ? AND status IN ('pending', 'in_progress')",
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }

    // ---- Assets ------------------------------------------------------

    /// Upserts the asset row on `(run_id, asset_key)` and appends an
    /// `AssetVersion` whose version is `max(prior) + 1`, in one transaction
    /// (spec §4.1).
    #[allow(clippy::too_many_arguments)]
    pub async fn record_asset(
        &self,
        run_id: i64,
        source_url: &str,
        asset_key: &str,
        asset_type: &str,
        checksum: &str,
        raw_path: Option<&str>,
        normalized_path: Option<&str>,
        metadata_json: Option<&str>,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        let existing = sqlx::query("SELECT id FROM assets WHERE run_id = ? AND asset_key = ?")
            .bind(run_id)
            .bind(asset_key)
            .fetch_optional(&mut *tx)
            .await?;

        let asset_id = if let Some(row) = existing {
            let asset_id: i64 = row.try_get("id")?;
            sqlx::query(
                "UPDATE assets SET asset_type = ?, checksum = ?, status = 'updated', \
                 updated_at = ? WHERE id = ?",
            )
            .bind(asset_type)
            .bind(checksum)
            .bind(now)
            .bind(asset_id)
            .execute(&mut *tx)
            .await?;
            asset_id
        } else {
            sqlx::query(
                "INSERT INTO assets (run_id, source_url, asset_key, asset_type, status, \
                 checksum, created_at, updated_at) VALUES (?, ?, ?, ?, 'created', ?, ?, ?)",
            )
            .bind(run_id)
            .bind(source_url)
            .bind(asset_key)
            .bind(asset_type)
            .bind(checksum)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid()
        };

        let max_version: Option<i64> =
            sqlx::query("SELECT MAX(version) as v FROM asset_versions WHERE asset_id = ?")
                .bind(asset_id)
                .fetch_one(&mut *tx)
                .await?
                .try_get("v")?;
        let next_version = max_version.unwrap_or(0) + 1;

        sqlx::query(
            "INSERT INTO asset_versions (asset_id, version, checksum, created_at, raw_path, \
             normalized_path, metadata_json) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(asset_id)
        .bind(next_version)
        .bind(checksum)
        .bind(now)
        .bind(raw_path)
        .bind(normalized_path)
        .bind(metadata_json)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(next_version)
    }

    pub async fn list_assets(&self, run_id: i64) -> Result<Vec<Asset>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, run_id, asset_key, asset_type, checksum, status, created_at, updated_at \
             FROM assets WHERE run_id = ? ORDER BY id ASC",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_asset).collect()
    }

    pub async fn list_asset_versions(&self, asset_id: i64) -> Result<Vec<AssetVersion>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, asset_id, version, checksum, raw_path, normalized_path, metadata_json, \
             created_at FROM asset_versions WHERE asset_id = ? ORDER BY version ASC",
        )
        .bind(asset_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_asset_version).collect()
    }

    // ---- Exceptions ----------------------------------------------------

    pub async fn record_exception(
        &self,
        run_id: i64,
        stage: &str,
        url: Option<&str>,
        asset_key: Option<&str>,
        message: &str,
        context_json: Option<&str>,
    ) -> Result<i64, StoreError> {
        let id = sqlx::query(
            "INSERT INTO exceptions (run_id, stage, url, asset_key, message, context_json, \
             status, created_at) VALUES (?, ?, ?, ?, ?, ?, 'open', ?)",
        )
        .bind(run_id)
        .bind(stage)
        .bind(url)
        .bind(asset_key)
        .bind(message)
        .bind(context_json)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn resolve_exception(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE exceptions SET status = 'resolved', resolved_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_open_exceptions(&self, run_id: i64) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) as n FROM exceptions WHERE run_id = ? AND status = 'open'",
        )
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }
}

fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> Result<Run, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Run {
        id: row.try_get("id")?,
        source: row.try_get("source")?,
        status: RunStatus::from_str(&status).map_err(StoreError::InvalidState)?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        label: row.try_get("label")?,
    })
}

fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<Task, StoreError> {
    let status: String = row.try_get("status")?;
    let task_type: String = row.try_get("task_type")?;
    Ok(Task {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        url: row.try_get("url")?,
        depth: row.try_get("depth")?,
        status: TaskStatus::from_str(&status).map_err(StoreError::InvalidState)?,
        attempt_count: row.try_get("attempt_count")?,
        last_error: row.try_get("last_error")?,
        lease_owner: row.try_get("lease_owner")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        next_run_at: row.try_get("next_run_at")?,
        task_type: TaskType::from_str(&task_type).map_err(StoreError::InvalidState)?,
        priority: row.try_get("priority")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_asset(row: &sqlx::sqlite::SqliteRow) -> Result<Asset, StoreError> {
    Ok(Asset {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        asset_key: row.try_get("asset_key")?,
        asset_type: row.try_get("asset_type")?,
        checksum: row.try_get("checksum")?,
        status: row.try_get("status")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_asset_version(row: &sqlx::sqlite::SqliteRow) -> Result<AssetVersion, StoreError> {
    Ok(AssetVersion {
        id: row.try_get("id")?,
        asset_id: row.try_get("asset_id")?,
        version: row.try_get("version")?,
        checksum: row.try_get("checksum")?,
        raw_path: row.try_get("raw_path")?,
        normalized_path: row.try_get("normalized_path")?,
        metadata_json: row.try_get("metadata_json")?,
        created_at: row.try_get("created_at")?,
    })
}

#[allow(dead_code)]
fn row_to_exception(row: &sqlx::sqlite::SqliteRow) -> Result<Exception, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Exception {
        id: row.try_get("id")?,
        run_id: row.try_get("run_id")?,
        stage: row.try_get("stage")?,
        url: row.try_get("url")?,
        asset_key: row.try_get("asset_key")?,
        message: row.try_get("message")?,
        context_json: row.try_get("context_json")?,
        status: if status == "resolved" {
            ExceptionStatus::Resolved
        } else {
            ExceptionStatus::Open
        },
        created_at: row.try_get("created_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskType;

    async fn test_store() -> Store {
        Store::connect(":memory:").await.expect("open store")
    }

    #[tokio::test]
    async fn start_and_resume_run() {
        let store = test_store().await;
        let run = store.start_run("acme", None).await.unwrap();
        assert_eq!(run.status, RunStatus::Initialized);

        store
            .mark_run_status(run.id, RunStatus::Running, false)
            .await
            .unwrap();
        let resumed = store.resume_run("acme").await.unwrap().unwrap();
        assert_eq!(resumed.id, run.id);
        assert_eq!(resumed.status, RunStatus::Running);

        store
            .mark_run_status(run.id, RunStatus::Completed, true)
            .await
            .unwrap();
        assert!(store.resume_run("acme").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn seed_idempotence() {
        let store = test_store().await;
        let run = store.start_run("acme", None).await.unwrap();
        let seeds = vec![("https://example.com/a".to_string(), 1)];
        let first = store
            .enqueue_seed_tasks(run.id, &seeds, TaskType::Page)
            .await
            .unwrap();
        let second = store
            .enqueue_seed_tasks(run.id, &seeds, TaskType::Page)
            .await
            .unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn acquire_tasks_claims_in_priority_then_id_order() {
        let store = test_store().await;
        let run = store.start_run("acme", None).await.unwrap();
        store
            .enqueue_seed_tasks(
                run.id,
                &[
                    ("https://example.com/a".to_string(), 1),
                    ("https://example.com/b".to_string(), 1),
                ],
                TaskType::Page,
            )
            .await
            .unwrap();

        let claimed = store
            .acquire_tasks(run.id, 10, "worker-1", 30.0, 3, 1.0)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed.iter().all(|t| t.status == TaskStatus::InProgress));
        assert!(claimed[0].id < claimed[1].id);

        let second_claim = store
            .acquire_tasks(run.id, 10, "worker-2", 30.0, 3, 1.0)
            .await
            .unwrap();
        assert!(second_claim.is_empty(), "tasks already leased are not re-claimable");
    }

    #[tokio::test]
    async fn lease_reclaim_respects_retry_budget() {
        let store = test_store().await;
        let run = store.start_run("acme", None).await.unwrap();
        store
            .enqueue_seed_tasks(run.id, &[("https://example.com/a".to_string(), 1)], TaskType::Page)
            .await
            .unwrap();

        // Lease expires almost immediately.
        let claimed = store
            .acquire_tasks(run.id, 10, "worker-1", 0.0, 3, 0.0)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        // Retries remain (max_retries=3): task comes back as pending, then
        // reclaimable.
        let reclaimed = store
            .acquire_tasks(run.id, 10, "worker-2", 30.0, 3, 0.0)
            .await
            .unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].status, TaskStatus::InProgress);

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        // Exhaust retries: acquire with max_retries=1 so attempt_count+1 > 1.
        let exhausted = store
            .acquire_tasks(run.id, 10, "worker-3", 0.0, 1, 0.0)
            .await
            .unwrap();
        assert!(exhausted.is_empty());
        let task = store.get_task(reclaimed[0].id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn release_task_does_not_increment_attempt_count() {
        let store = test_store().await;
        let run = store.start_run("acme", None).await.unwrap();
        store
            .enqueue_seed_tasks(run.id, &[("https://example.com/a".to_string(), 1)], TaskType::Page)
            .await
            .unwrap();
        let claimed = store
            .acquire_tasks(run.id, 10, "worker-1", 30.0, 3, 1.0)
            .await
            .unwrap();
        let before = claimed[0].attempt_count;
        store.release_task(claimed[0].id, "stopped").await.unwrap();
        let task = store.get_task(claimed[0].id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, before);
        assert!(task.lease_owner.is_none());
    }

    #[tokio::test]
    async fn max_retries_zero_errors_on_first_failure() {
        let store = test_store().await;
        let run = store.start_run("acme", None).await.unwrap();
        store
            .enqueue_seed_tasks(run.id, &[("https://example.com/a".to_string(), 1)], TaskType::Page)
            .await
            .unwrap();
        let claimed = store
            .acquire_tasks(run.id, 10, "worker-1", 30.0, 0, 1.0)
            .await
            .unwrap();
        store
            .fail_task(claimed[0].id, "boom", 1.0, 0)
            .await
            .unwrap();
        let task = store.get_task(claimed[0].id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Error);
    }

    #[tokio::test]
    async fn record_asset_versions_are_monotonic() {
        let store = test_store().await;
        let run = store.start_run("acme", None).await.unwrap();
        let v1 = store
            .record_asset(run.id, "https://example.com/a", "https://example.com/a", "page", "aaa", None, None, None)
            .await
            .unwrap();
        let v2 = store
            .record_asset(run.id, "https://example.com/a", "https://example.com/a", "page", "bbb", None, None, None)
            .await
            .unwrap();
        assert_eq!(v1, 1);
        assert_eq!(v2, 2);

        let assets = store.list_assets(run.id).await.unwrap();
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].checksum.as_deref(), Some("bbb"));

        let versions = store.list_asset_versions(assets[0].id).await.unwrap();
        let numbers: Vec<i64> = versions.iter().map(|v| v.version).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[tokio::test]
    async fn record_asset_called_twice_same_inputs_appends_two_versions() {
        let store = test_store().await;
        let run = store.start_run("acme", None).await.unwrap();
        store
            .record_asset(run.id, "https://example.com/a", "https://example.com/a", "page", "aaa", None, None, None)
            .await
            .unwrap();
        store
            .record_asset(run.id, "https://example.com/a", "https://example.com/a", "page", "aaa", None, None, None)
            .await
            .unwrap();
        let assets = store.list_assets(run.id).await.unwrap();
        let versions = store.list_asset_versions(assets[0].id).await.unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(assets[0].checksum.as_deref(), Some("aaa"));
    }

    #[tokio::test]
    async fn finished_task_is_terminal() {
        let store = test_store().await;
        let run = store.start_run("acme", None).await.unwrap();
        store
            .enqueue_seed_tasks(run.id, &[("https://example.com/a".to_string(), 1)], TaskType::Page)
            .await
            .unwrap();
        let claimed = store
            .acquire_tasks(run.id, 10, "worker-1", 30.0, 3, 1.0)
            .await
            .unwrap();
        store.complete_task(claimed[0].id).await.unwrap();
        // complete_task again is a no-op because the WHERE clause requires
        // status = 'in_progress'.
        store.complete_task(claimed[0].id).await.unwrap();
        let task = store.get_task(claimed[0].id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Finished);
    }
}
