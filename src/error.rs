//! Error taxonomy for the crawl core (see spec §7).

use thiserror::Error;

/// Failure surfaced by a [`crate::fetcher::Fetcher`] implementation.
///
/// `Transient` failures are retried under the [`crate::retry::RetryPolicy`];
/// `Permanent` failures go straight to `error` without further attempts.
#[derive(Debug, Error, Clone)]
pub enum FetchFailure {
    #[error("transient fetch failure: {0}")]
    Transient(String),
    #[error("permanent fetch failure: {0}")]
    Permanent(String),
}

impl FetchFailure {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchFailure::Transient(_))
    }

    pub fn message(&self) -> &str {
        match self {
            FetchFailure::Transient(m) | FetchFailure::Permanent(m) => m,
        }
    }
}

/// Raised by the in-worker retry loop once `max_retries` attempts are
/// exhausted, or immediately on a [`FetchFailure::Permanent`].
///
/// `permanent` distinguishes the two causes so the caller can route them
/// to the right Store transition (spec §4.5 step 4 vs. step 5): a
/// transient exhaustion goes to `mark_task_error`, a permanent failure
/// goes to `fail_task`.
#[derive(Debug, Error, Clone)]
#[error("retry exhausted after {attempts} attempt(s): {last_error}")]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: String,
    pub permanent: bool,
}

/// Errors from the [`crate::plugin`] normalization path.
#[derive(Debug, Error)]
pub enum AssetPluginError {
    #[error("plugin normalization failed: {0}")]
    Normalize(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal errors from the Durable Store (spec §7: "Fatal internal").
///
/// Any variant here aborts the run — the store guarantees on-disk state is
/// left consistent because every mutating operation runs inside one
/// transaction.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Top-level error type returned by the Orchestrator and worker pool.
#[derive(Debug, Error)]
pub enum SitesyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("configuration error: {0}")]
    Config(String),
}
