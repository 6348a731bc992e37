//! Worker Pool (consumers): fetch, persist, discover (spec §4.5).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::OutputsConfig;
use crate::dispatcher::WorkItem;
use crate::discover::{detect_auth_redirect, discover_links};
use crate::error::StoreError;
use crate::fetcher::{FetchResult, Fetcher};
use crate::filter::UrlFilter;
use crate::plugin::{default_asset_record, AssetRecord, PluginRegistry};
use crate::retry::{run_with_retry, RetryPolicy};
use crate::store::Store;
use crate::types::{Task, TaskType};

/// Per-worker point-in-time state, polled by an external dashboard (spec
/// §4.5 "Per-agent metrics"). The core never renders this itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum WorkerState {
    #[default]
    Idle,
    Fetching,
    Persisting,
    Discovering,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerMetrics {
    pub fetches: u64,
    pub retries: u64,
    pub assets_produced: u64,
    pub state: WorkerState,
    pub current_url: Option<String>,
    pub last_status: Option<String>,
}

#[derive(Default)]
pub struct MetricsRegistry {
    inner: Mutex<HashMap<String, WorkerMetrics>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, worker_name: &str, f: impl FnOnce(&mut WorkerMetrics)) {
        let mut guard = self.inner.lock().expect("metrics lock poisoned");
        let entry = guard.entry(worker_name.to_string()).or_default();
        f(entry);
    }

    pub fn snapshot(&self) -> HashMap<String, WorkerMetrics> {
        self.inner.lock().expect("metrics lock poisoned").clone()
    }
}

pub struct Worker {
    pub name: String,
    pub run_id: i64,
    pub store: Arc<Store>,
    pub filter: Arc<UrlFilter>,
    pub page_fetcher: Arc<dyn Fetcher>,
    pub media_fetcher: Arc<dyn Fetcher>,
    pub plugins: Arc<PluginRegistry>,
    pub retry_policy: RetryPolicy,
    pub outputs: Arc<OutputsConfig>,
    pub fetch_timeout: Option<Duration>,
    pub metrics: Arc<MetricsRegistry>,
    /// Used only for the `fail_task` path on a permanent fetch failure
    /// (spec §4.3 item 2, §4.5 step 5); in-worker transient retries never
    /// touch the Store until exhaustion.
    pub backoff_seconds: f64,
    pub max_retries: u32,
}

impl Worker {
    /// Drains `receiver` until a [`WorkItem::Sentinel`] arrives or `cancel`
    /// fires. Errors only propagate for Store I/O failure (spec §7 "Fatal
    /// internal"); fetch/plugin failures are recorded, not raised.
    /// `receiver` is shared across the whole pool — `mpsc::Receiver` has a
    /// single owner, so multiple workers pull from the same queue through
    /// one `tokio::sync::Mutex`-guarded handle.
    pub async fn run(
        mut self,
        receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
        cancel: CancellationToken,
    ) -> Result<(), StoreError> {
        loop {
            let item = {
                let mut guard = receiver.lock().await;
                guard.recv().await
            };
            let Some(item) = item else { break };
            let task = match item {
                WorkItem::Sentinel => break,
                WorkItem::Task(task) => task,
            };

            if cancel.is_cancelled() {
                self.store.release_task(task.id, "stopped").await?;
                break;
            }

            self.metrics.update(&self.name, |m| {
                m.state = WorkerState::Fetching;
                m.current_url = Some(task.url.clone());
            });

            self.process_task(task, &cancel).await?;
        }
        Ok(())
    }

    async fn process_task(&mut self, task: Task, cancel: &CancellationToken) -> Result<(), StoreError> {
        let fetcher = if task.task_type == TaskType::Media {
            self.media_fetcher.clone()
        } else {
            self.page_fetcher.clone()
        };
        let timeout = self.fetch_timeout;
        let metrics = self.metrics.clone();
        let name = self.name.clone();

        let result = run_with_retry(&self.retry_policy, |attempt| {
            let fetcher = fetcher.clone();
            let task = task.clone();
            let metrics = metrics.clone();
            let name = name.clone();
            async move {
                if attempt > 1 {
                    metrics.update(&name, |m| m.retries += 1);
                }
                metrics.update(&name, |m| m.fetches += 1);
                match timeout {
                    Some(d) => match tokio::time::timeout(d, fetcher.fetch(&task)).await {
                        Ok(inner) => inner,
                        Err(_) => Err(crate::error::FetchFailure::Transient(
                            "fetch timed out".to_string(),
                        )),
                    },
                    None => fetcher.fetch(&task).await,
                }
            }
        })
        .await;

        match result {
            Ok(fetch_result) => self.on_success(&task, fetch_result, cancel).await,
            Err(exhausted) => {
                self.metrics.update(&self.name, |m| {
                    m.state = WorkerState::Idle;
                    m.last_status = Some(format!("error: {}", exhausted.last_error));
                });
                if exhausted.permanent {
                    // Permanent fetch failure (spec §4.5 step 5 / §7): goes
                    // through the queue-level retry primitive rather than
                    // straight to `error`, same as any other unclassified
                    // queue failure.
                    self.store
                        .fail_task(
                            task.id,
                            &exhausted.last_error,
                            self.backoff_seconds,
                            self.max_retries,
                        )
                        .await
                } else {
                    // Transient retries were already exhausted in-process
                    // (spec §4.5 step 4): no further backoff, straight to
                    // `error`.
                    self.store
                        .mark_task_error(task.id, &exhausted.last_error)
                        .await
                }
            }
        }
    }

    async fn on_success(
        &mut self,
        task: &Task,
        fetch_result: FetchResult,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        self.store.complete_task(task.id).await?;

        self.metrics.update(&self.name, |m| {
            m.state = WorkerState::Persisting;
            m.last_status = Some("finished".to_string());
        });
        let assets_written = self.persist_assets(task, &fetch_result).await?;
        self.metrics
            .update(&self.name, |m| m.assets_produced += assets_written as u64);

        let final_url = fetch_result
            .metadata_json
            .as_deref()
            .and_then(extract_metadata_url)
            .unwrap_or_else(|| task.url.clone());
        let redirect = detect_auth_redirect(&final_url, &self.filter);

        if !redirect.redirected
            && task.depth > 1
            && task.task_type == TaskType::Page
            && !cancel.is_cancelled()
        {
            self.metrics
                .update(&self.name, |m| m.state = WorkerState::Discovering);
            self.run_discovery(task, &fetch_result).await?;
        }

        self.metrics.update(&self.name, |m| m.state = WorkerState::Idle);
        Ok(())
    }

    async fn persist_assets(
        &self,
        task: &Task,
        fetch_result: &FetchResult,
    ) -> Result<usize, StoreError> {
        let plugins = self.plugins.find(&fetch_result.asset_type);
        let normalized_dir = self
            .outputs
            .base_path
            .join(&self.outputs.normalized_subdir);

        let mut records: Vec<AssetRecord> = Vec::new();
        for plugin in &plugins {
            match plugin
                .normalize(
                    &task.url,
                    fetch_result.raw_payload_path.as_deref().unwrap_or_default(),
                    fetch_result.metadata_json.as_deref(),
                    &normalized_dir,
                )
                .await
            {
                Ok(produced) => records.extend(produced),
                Err(err) => {
                    log::warn!(target: "sitesync::worker", "plugin normalization failed for {}: {err}", task.url);
                }
            }
        }

        if records.is_empty() {
            records.push(default_asset_record(
                &task.url,
                &fetch_result.asset_type,
                fetch_result.checksum.as_deref().unwrap_or_default(),
                fetch_result.normalized_payload_path.as_deref(),
            ));
        }

        let count = records.len();
        for record in records {
            let metadata_json = record.metadata.as_ref().map(|v| v.to_string());
            self.store
                .record_asset(
                    task.run_id,
                    &task.url,
                    &record.identifier,
                    &record.asset_type,
                    &record.checksum,
                    fetch_result.raw_payload_path.as_deref(),
                    Some(record.normalized_path.as_str()),
                    metadata_json.as_deref(),
                )
                .await?;
        }
        Ok(count)
    }

    async fn run_discovery(&self, task: &Task, fetch_result: &FetchResult) -> Result<(), StoreError> {
        let Some(raw_path) = fetch_result.raw_payload_path.clone() else {
            return Ok(());
        };
        let base_url = fetch_result
            .metadata_json
            .as_deref()
            .and_then(extract_metadata_url)
            .or_else(|| Some(task.url.clone()))
            .and_then(|u| Url::parse(&u).ok());
        let Some(base_url) = base_url else {
            return Ok(());
        };

        let html = match tokio::task::spawn_blocking(move || std::fs::read_to_string(PathBuf::from(raw_path)))
            .await
        {
            Ok(Ok(html)) => html,
            Ok(Err(err)) => {
                log::warn!(target: "sitesync::worker", "failed to read raw payload for {}: {err}", task.url);
                return Ok(());
            }
            Err(err) => {
                log::warn!(target: "sitesync::worker", "blocking read join error for {}: {err}", task.url);
                return Ok(());
            }
        };

        let links = discover_links(&html, &base_url, task.depth, &self.filter);
        if links.is_empty() {
            return Ok(());
        }
        let (page_seeds, media_seeds): (Vec<_>, Vec<_>) = links
            .into_iter()
            .partition(|l| l.task_type == TaskType::Page);
        let page_seeds: Vec<(String, i64)> = page_seeds.into_iter().map(|l| (l.url, l.depth)).collect();
        let media_seeds: Vec<(String, i64)> = media_seeds.into_iter().map(|l| (l.url, l.depth)).collect();

        if !page_seeds.is_empty() {
            self.store
                .enqueue_seed_tasks(task.run_id, &page_seeds, TaskType::Page)
                .await?;
        }
        if !media_seeds.is_empty() {
            self.store
                .enqueue_seed_tasks(task.run_id, &media_seeds, TaskType::Media)
                .await?;
        }
        Ok(())
    }
}

fn extract_metadata_url(metadata_json: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(metadata_json).ok()?;
    value.get("url")?.as_str().map(str::to_string)
}
