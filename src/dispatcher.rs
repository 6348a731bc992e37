//! Task Dispatcher (producer): bridges the Store's queue to the in-memory
//! worker channel (spec §4.4).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::StoreError;
use crate::filter::UrlFilter;
use crate::store::Store;
use crate::types::{Task, TaskType};

pub const DISPATCHER_LEASE_OWNER: &str = "dispatcher";

/// Item placed on the worker channel: a claimed task, or the end-of-queue
/// sentinel (exactly one per worker, spec §4.4).
#[derive(Debug)]
pub enum WorkItem {
    Task(Task),
    Sentinel,
}

pub struct Dispatcher {
    store: Arc<Store>,
    filter: Arc<UrlFilter>,
    run_id: i64,
    worker_count: u32,
    pages_per_agent: u32,
    lease_seconds: f64,
    max_retries: u32,
    backoff_seconds: f64,
    poll_interval: Duration,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Store>,
        filter: Arc<UrlFilter>,
        run_id: i64,
        worker_count: u32,
        pages_per_agent: u32,
        lease_seconds: f64,
        max_retries: u32,
        backoff_seconds: f64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            store,
            filter,
            run_id,
            worker_count,
            pages_per_agent,
            lease_seconds,
            max_retries,
            backoff_seconds,
            poll_interval,
        }
    }

    pub fn channel_capacity(&self) -> usize {
        (self.pages_per_agent as usize * self.worker_count as usize * 2).max(1)
    }

    /// Drives the queue until it drains or `cancel` fires, then sends one
    /// [`WorkItem::Sentinel`] per worker and returns.
    pub async fn run(
        self,
        sender: mpsc::Sender<WorkItem>,
        cancel: CancellationToken,
    ) -> Result<(), StoreError> {
        let capacity = self.channel_capacity();
        loop {
            if cancel.is_cancelled() {
                break;
            }

            // Backpressure: don't acquire more leases than the channel can
            // currently hold.
            if sender.capacity() < (self.pages_per_agent as usize).min(capacity).max(1) {
                sleep(Duration::from_millis(50)).await;
                continue;
            }

            let batch = self
                .store
                .acquire_tasks(
                    self.run_id,
                    self.pages_per_agent as i64,
                    DISPATCHER_LEASE_OWNER,
                    self.lease_seconds,
                    self.max_retries,
                    self.backoff_seconds,
                )
                .await?;

            if batch.is_empty() {
                let active = self.store.count_active_tasks(self.run_id).await?;
                if active == 0 {
                    log::info!(target: "sitesync::dispatcher", "run {} queue drained", self.run_id);
                    break;
                }
                sleep(self.poll_interval).await;
                continue;
            }

            for task in batch {
                match validate_task(&task, &self.filter) {
                    Ok(()) => {
                        if sender.send(WorkItem::Task(task)).await.is_err() {
                            // Receivers gone; nothing more to do.
                            return Ok(());
                        }
                    }
                    Err(reason) => {
                        log::debug!(target: "sitesync::dispatcher", "filtered {}: {reason}", task.url);
                        self.store.mark_task_error(task.id, &reason).await?;
                    }
                }
            }
        }

        for _ in 0..self.worker_count {
            let _ = sender.send(WorkItem::Sentinel).await;
        }
        Ok(())
    }
}

/// URL-validity and URL Filter checks (spec §4.4 steps 4-5). Media tasks
/// bypass the URL Filter but scheme validity still applies.
fn validate_task(task: &Task, filter: &UrlFilter) -> Result<(), String> {
    let parsed = Url::parse(&task.url).map_err(|e| format!("invalid url: {e}"))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(format!("unsupported scheme: {}", parsed.scheme()));
    }
    let Some(host) = parsed.host_str() else {
        return Err("missing host".to_string());
    };
    if task.task_type == TaskType::Media {
        return Ok(());
    }
    if !filter.is_admissible(host, parsed.path()) {
        return Err(format!("blocked by url filter: {host}{}", parsed.path()));
    }
    Ok(())
}
