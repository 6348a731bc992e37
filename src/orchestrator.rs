//! Orchestrator: starts or resumes a run and seeds the queue (spec §4.7).
//!
//! Driving the Dispatcher and Worker Pool to completion is the caller's
//! responsibility; the Orchestrator only prepares the run and hands back a
//! summary of what was queued.

use std::sync::Arc;

use crate::config::{CrawlerConfig, EffectiveRunSettings, SourceSettings};
use crate::error::StoreError;
use crate::store::Store;
use crate::types::{Run, RunStatus, TaskType};

/// What the Orchestrator queued, for the caller to report or log.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run: Run,
    pub seeds_queued: u64,
    pub depth: u32,
    pub parallel_agents: u32,
    pub pages_per_agent: u32,
}

pub struct Orchestrator {
    store: Arc<Store>,
}

impl Orchestrator {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Resumes the most recent non-terminal run for `source.name`, or
    /// starts a fresh one; either way seeds the queue and marks the run
    /// `running`.
    pub async fn resume_or_start(
        &self,
        crawler: &CrawlerConfig,
        source: &SourceSettings,
        depth_override: Option<u32>,
        parallel_override: Option<u32>,
        label: Option<&str>,
    ) -> Result<RunSummary, StoreError> {
        let settings = EffectiveRunSettings::resolve(crawler, source, depth_override, parallel_override);

        let run = match self.store.resume_run(&source.name).await? {
            Some(run) => {
                log::info!(target: "sitesync::orchestrator", "resuming run {} for {}", run.id, source.name);
                run
            }
            None => {
                let run = self.store.start_run(&source.name, label).await?;
                log::info!(target: "sitesync::orchestrator", "started run {} for {}", run.id, source.name);
                run
            }
        };

        let seeds: Vec<(String, i64)> = source
            .start_urls
            .iter()
            .map(|url| (url.clone(), settings.depth as i64))
            .collect();
        let seeds_queued = self.store.enqueue_seed_tasks(run.id, &seeds, TaskType::Page).await?;

        if run.status != RunStatus::Running {
            self.store.mark_run_status(run.id, RunStatus::Running, false).await?;
        }

        Ok(RunSummary {
            run,
            seeds_queued,
            depth: settings.depth,
            parallel_agents: settings.parallel_agents,
            pages_per_agent: settings.pages_per_agent,
        })
    }

    /// Marks the run terminal. `graceful` distinguishes a clean drain
    /// (`completed`) from a cancellation (`stopped`).
    pub async fn finish_run(&self, run_id: i64, graceful: bool) -> Result<(), StoreError> {
        let status = if graceful { RunStatus::Completed } else { RunStatus::Stopped };
        self.store.mark_run_status(run_id, status, true).await
    }
}
