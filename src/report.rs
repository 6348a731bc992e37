//! Run metadata artifact (spec §6 "Run metadata artifact").
//!
//! `RunReport::collect` gathers the data; writing it to
//! `outputs.metadata_subdir/run-<id>.json` is a thin caller-invoked
//! serialize-to-path step so the core stays testable without touching the
//! filesystem by default.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{CrawlerConfig, OutputsConfig, SourceSettings};
use crate::error::StoreError;
use crate::store::Store;
use crate::types::{Run, TaskStatusCounts};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentInfo {
    pub hostname: String,
    pub crate_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run: Run,
    pub source: SourceSettings,
    pub crawler: CrawlerConfig,
    pub outputs: OutputsConfig,
    pub task_status_counts: TaskStatusCounts,
    pub open_exceptions: i64,
    pub environment: EnvironmentInfo,
}

impl RunReport {
    /// Gathers everything needed for the `run-<id>.json` artifact. Does not
    /// write anything; the caller decides the path and serialization step.
    pub async fn collect(
        store: &Store,
        run_id: i64,
        source: &SourceSettings,
        crawler: &CrawlerConfig,
        outputs: &OutputsConfig,
        started_at: DateTime<Utc>,
    ) -> Result<Self, StoreError> {
        let run = store
            .get_run(run_id)
            .await?
            .ok_or_else(|| StoreError::InvalidState(format!("run {run_id} not found")))?;
        let task_status_counts = store.get_task_status_counts(run_id).await?;
        let open_exceptions = store.count_open_exceptions(run_id).await?;

        Ok(RunReport {
            run,
            source: source.clone(),
            crawler: crawler.clone(),
            outputs: outputs.clone(),
            task_status_counts,
            open_exceptions,
            environment: EnvironmentInfo {
                hostname: hostname(),
                crate_version: env!("CARGO_PKG_VERSION").to_string(),
                started_at,
                finished_at: Utc::now(),
            },
        })
    }

    /// Suggested artifact filename for this report, per spec §6.
    pub fn artifact_name(&self) -> String {
        format!("run-{}.json", self.run.id)
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}
