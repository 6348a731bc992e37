//! Fetcher capability consumed by the Worker Pool (spec §6).
//!
//! Concrete implementations (HTTP streaming for media, headless-browser for
//! HTML) are external collaborators; this module defines only the trait and
//! a `NullFetcher` used by the crate's own tests.

use async_trait::async_trait;

use crate::error::FetchFailure;
use crate::types::Task;

/// Result of a single successful fetch.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub assets_created: u32,
    pub raw_payload_path: Option<String>,
    pub normalized_payload_path: Option<String>,
    pub checksum: Option<String>,
    pub asset_type: String,
    pub metadata_json: Option<String>,
}

impl FetchResult {
    pub fn new() -> Self {
        Self {
            asset_type: "page".to_string(),
            ..Default::default()
        }
    }
}

/// Capability invoked once per attempt by the Worker Pool under the Retry
/// Policy. Implementations distinguish `task.task_type` themselves or are
/// wrapped by a dispatching fetcher that picks the page vs. media flavor.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, task: &Task) -> Result<FetchResult, FetchFailure>;
}

/// A scripted fetcher for tests: returns queued results/failures in order,
/// falling back to the last entry once exhausted.
#[cfg(any(test, feature = "test-support"))]
pub mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    pub struct ScriptedFetcher {
        script: Mutex<Vec<Result<FetchResult, FetchFailure>>>,
        calls: AtomicUsize,
    }

    impl ScriptedFetcher {
        pub fn new(script: Vec<Result<FetchResult, FetchFailure>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetcher for ScriptedFetcher {
        async fn fetch(&self, _task: &Task) -> Result<FetchResult, FetchFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().expect("scripted fetcher lock poisoned");
            if script.len() > 1 {
                script.remove(0)
            } else {
                script
                    .first()
                    .cloned()
                    .unwrap_or_else(|| Err(FetchFailure::Permanent("no script entries".into())))
            }
        }
    }
}
