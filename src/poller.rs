//! Cancelable recurring campaign refresh.
use std::{future::Future, time::Duration};

use rand::{thread_rng, Rng};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    sync::{shutdown_requested, RefreshOutcome},
    Error, Result,
};

/// Configuration for [`PeriodicRefresh`].
#[derive(Debug, Clone, PartialEq)]
pub struct PeriodicRefreshConfig {
    /// Interval to wait between refreshes.
    pub interval: Duration,
    /// Jitter applies a randomized duration to wait between refreshes. This helps to avoid
    /// multiple devices synchronizing their requests.
    pub jitter: Duration,
}

impl PeriodicRefreshConfig {
    /// Default value for [`PeriodicRefreshConfig::interval`].
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);
    /// Default value for [`PeriodicRefreshConfig::jitter`].
    pub const DEFAULT_JITTER: Duration = Duration::from_secs(30);
}

impl Default for PeriodicRefreshConfig {
    fn default() -> PeriodicRefreshConfig {
        PeriodicRefreshConfig {
            interval: PeriodicRefreshConfig::DEFAULT_INTERVAL,
            jitter: PeriodicRefreshConfig::DEFAULT_JITTER,
        }
    }
}

/// A background task refreshing campaigns every interval.
///
/// Use [`Engine::start_periodic_refresh`](crate::Engine::start_periodic_refresh) to get an
/// instance of it.
pub struct PeriodicRefresh {
    join_handle: JoinHandle<()>,

    /// Used to send a stop command to the task.
    stop_sender: watch::Sender<bool>,

    /// Holds `None` until the first refresh completes.
    first_outcome: watch::Receiver<Option<RefreshOutcome>>,
}

impl PeriodicRefresh {
    /// Spawn the refresh loop on the current tokio runtime.
    ///
    /// If `run_immediately` is `false`, the first refresh happens after one interval.
    pub(crate) fn start<F, Fut>(
        config: PeriodicRefreshConfig,
        run_immediately: bool,
        refresh: F,
    ) -> Result<PeriodicRefresh>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = RefreshOutcome> + Send + 'static,
    {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let (stop_sender, mut stop) = watch::channel(false);
        let (first_sender, first_outcome) = watch::channel(None);

        let join_handle = runtime.spawn(async move {
            let mut skip_refresh = !run_immediately;
            loop {
                if !skip_refresh {
                    let outcome = tokio::select! {
                        outcome = refresh() => outcome,
                        _ = shutdown_requested(&mut stop) => {
                            log::debug!(target: "nudge", "periodic refresh received stop command");
                            return;
                        }
                    };
                    if !matches!(outcome, RefreshOutcome::AlreadyInFlight) {
                        first_sender.send_if_modified(|first| {
                            let unset = first.is_none();
                            if unset {
                                *first = Some(outcome);
                            }
                            unset
                        });
                    }
                }
                skip_refresh = false;

                let timeout = jitter(config.interval, config.jitter);
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {
                        // Timed out. Loop back to refresh.
                    }
                    _ = shutdown_requested(&mut stop) => {
                        log::debug!(target: "nudge", "periodic refresh received stop command");
                        return;
                    }
                }
            }
        });

        Ok(PeriodicRefresh {
            join_handle,
            stop_sender,
            first_outcome,
        })
    }

    /// Wait for the first refresh to complete and return its outcome.
    ///
    /// Returns `None` if the task was stopped before any refresh finished.
    pub async fn wait_for_first_refresh(&self) -> Option<RefreshOutcome> {
        wait_for_outcome(self.first_outcome()).await
    }

    pub(crate) fn first_outcome(&self) -> watch::Receiver<Option<RefreshOutcome>> {
        self.first_outcome.clone()
    }

    /// Stop the task.
    ///
    /// This function does not wait for the task to actually stop.
    pub fn stop(&self) {
        // Sending fails only if the task has already exited.
        let _ = self.stop_sender.send(true);
    }

    /// Stop the task and wait for it to exit.
    ///
    /// If you don't need to wait for the task to exit, use [`PeriodicRefresh::stop`] instead.
    ///
    /// # Errors
    ///
    /// - [`Error::PollerPanicked`] if the task has panicked.
    pub async fn shutdown(self) -> Result<()> {
        self.stop();
        match self.join_handle.await {
            Ok(()) => Ok(()),
            Err(err) if err.is_cancelled() => Ok(()),
            Err(_) => Err(Error::PollerPanicked),
        }
    }
}

pub(crate) async fn wait_for_outcome(
    mut first_outcome: watch::Receiver<Option<RefreshOutcome>>,
) -> Option<RefreshOutcome> {
    let result = first_outcome.wait_for(Option::is_some).await;
    result.ok().and_then(|outcome| outcome.clone())
}

/// Apply randomized `jitter` to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    Duration::saturating_sub(interval, thread_rng().gen_range(Duration::ZERO..=jitter))
}
