//! Keeps [`MemoryCache`] eventually consistent with the backend.
use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use tokio::sync::watch;

use crate::{
    cache::MemoryCache,
    transport::{FetchRequest, Transport},
    Error, Result,
};

/// Retry behavior for campaign fetches.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failure. Doubles after every further failure.
    pub initial_delay: Duration,
    /// Upper bound on a single delay.
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Default value for [`RetryConfig::max_attempts`].
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    /// Default value for [`RetryConfig::initial_delay`].
    pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);
    /// Default value for [`RetryConfig::max_delay`].
    pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
}

impl Default for RetryConfig {
    fn default() -> RetryConfig {
        RetryConfig {
            max_attempts: RetryConfig::DEFAULT_MAX_ATTEMPTS,
            initial_delay: RetryConfig::DEFAULT_INITIAL_DELAY,
            max_delay: RetryConfig::DEFAULT_MAX_DELAY,
        }
    }
}

/// Run `operation` until it succeeds, sleeping with exponential backoff between attempts.
///
/// Gives up after [`RetryConfig::max_attempts`] or on the first error that is not
/// [retryable](Error::is_retryable), returning the last error.
pub async fn fetch_with_retry<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut delay = config.initial_delay;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    log::info!(target: "nudge", operation_name, attempt; "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !err.is_retryable() || attempt >= max_attempts => {
                log::warn!(target: "nudge", operation_name, attempt; "giving up: {err}");
                return Err(err);
            }
            Err(err) => {
                log::warn!(target: "nudge",
                           operation_name,
                           attempt,
                           max_attempts;
                           "operation failed: {err}. Retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2).min(config.max_delay);
            }
        }
    }
}

/// Result of [`SyncScheduler::refresh_now`].
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// The cache was replaced with `count` campaigns.
    Updated {
        #[allow(missing_docs)]
        count: usize,
    },
    /// The backend returned no campaigns while the cache was non-empty. The existing cache was
    /// kept.
    KeptExisting,
    /// Another refresh was already running. Nothing was fetched.
    AlreadyInFlight,
    /// All attempts failed. The existing cache remains authoritative.
    Failed(Error),
    /// The engine shut down while the refresh was running.
    Cancelled,
}

impl RefreshOutcome {
    /// Whether the cache now reflects the backend.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            RefreshOutcome::Updated { .. } | RefreshOutcome::KeptExisting
        )
    }
}

/// Clears the flag when dropped, whether the guarded operation finished, failed or was cancelled.
pub(crate) struct SingleFlight<'a>(&'a AtomicBool);

impl<'a> SingleFlight<'a> {
    /// Returns `None` if the flag is already set.
    pub(crate) fn acquire(flag: &'a AtomicBool) -> Option<SingleFlight<'a>> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SingleFlight(flag))
    }
}

impl Drop for SingleFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Resolves once `shutdown` flips to `true`. Never resolves if the sender is gone.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stopped| *stopped).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Orchestrates fetch-from-network and cache replacement.
///
/// At most one refresh is in flight at any time.
pub struct SyncScheduler {
    cache: Arc<MemoryCache>,
    transport: Arc<dyn Transport>,
    retry: RetryConfig,
    in_flight: AtomicBool,
    shutdown: watch::Receiver<bool>,
}

impl SyncScheduler {
    /// `shutdown` cancels in-flight refreshes when it becomes `true`.
    pub fn new(
        cache: Arc<MemoryCache>,
        transport: Arc<dyn Transport>,
        retry: RetryConfig,
        shutdown: watch::Receiver<bool>,
    ) -> SyncScheduler {
        SyncScheduler {
            cache,
            transport,
            retry,
            in_flight: AtomicBool::new(false),
            shutdown,
        }
    }

    /// Cache this scheduler refreshes.
    pub fn cache(&self) -> &Arc<MemoryCache> {
        &self.cache
    }

    /// Whether a refresh is currently running.
    pub fn is_refreshing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Fetch campaigns and replace the cache. No-op if a refresh is already in flight.
    ///
    /// Failures never propagate: the existing cache is left untouched and the outcome is reported.
    pub async fn refresh_now(&self, request: FetchRequest) -> RefreshOutcome {
        let Some(_guard) = SingleFlight::acquire(&self.in_flight) else {
            log::debug!(target: "nudge", "refresh already in flight");
            return RefreshOutcome::AlreadyInFlight;
        };

        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return RefreshOutcome::Cancelled;
        }

        tokio::select! {
            outcome = self.refresh_inner(&request) => outcome,
            _ = shutdown_requested(&mut shutdown) => {
                log::debug!(target: "nudge", "refresh cancelled by shutdown");
                RefreshOutcome::Cancelled
            }
        }
    }

    async fn refresh_inner(&self, request: &FetchRequest) -> RefreshOutcome {
        log::debug!(target: "nudge", "fetching new campaigns");
        let fetch = || self.transport.fetch_campaigns(request);
        let response = match fetch_with_retry("fetch campaigns", &self.retry, fetch).await {
            Ok(response) => response,
            Err(err) => {
                log::warn!(target: "nudge", "campaign refresh failed, keeping existing cache: {err}");
                return RefreshOutcome::Failed(err);
            }
        };

        let campaigns = response.into_campaigns();
        if campaigns.is_empty() && !self.cache.snapshot().campaigns.is_empty() {
            log::warn!(target: "nudge", "backend returned no campaigns, keeping existing cache");
            return RefreshOutcome::KeptExisting;
        }

        if let Err(err) = self.cache.replace(campaigns, Utc::now()).await {
            // Memory is already updated, only persistence failed.
            log::warn!(target: "nudge", "failed to persist campaign cache: {err}");
        }

        let count = self.cache.snapshot().campaigns.len();
        log::info!(target: "nudge", count; "campaign cache refreshed");
        RefreshOutcome::Updated { count }
    }
}
