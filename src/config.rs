use std::{sync::Arc, time::Duration};

use crate::{
    cache::{MemoryCacheConfig, CACHE_SCHEMA_VERSION},
    event_queue::EventQueueConfig,
    poller::PeriodicRefreshConfig,
    renderer::{NoopRenderer, Renderer},
    store::PersistentStore,
    sync::RetryConfig,
    transport::Transport,
    Engine,
};

/// Configuration for [`Engine`].
pub struct EngineConfig {
    pub(crate) cache_ttl: Duration,
    pub(crate) refresh_interval: Duration,
    pub(crate) refresh_jitter: Duration,
    pub(crate) max_cached_campaigns: usize,
    pub(crate) max_fetch_attempts: u32,
    pub(crate) initial_retry_delay: Duration,
    pub(crate) navigation_token_tolerance: Duration,
    pub(crate) flush_delay: Duration,
    pub(crate) max_queued_events: usize,
    pub(crate) user_id: Option<String>,
    pub(crate) renderer: Box<dyn Renderer + Send + Sync>,
}

impl EngineConfig {
    /// Default value for [`EngineConfig::cache_ttl`].
    pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(60 * 60);
    /// Default value for [`EngineConfig::refresh_interval`].
    pub const DEFAULT_REFRESH_INTERVAL: Duration = PeriodicRefreshConfig::DEFAULT_INTERVAL;
    /// Default value for [`EngineConfig::refresh_jitter`].
    pub const DEFAULT_REFRESH_JITTER: Duration = PeriodicRefreshConfig::DEFAULT_JITTER;
    /// Default value for [`EngineConfig::max_cached_campaigns`].
    pub const DEFAULT_MAX_CACHED_CAMPAIGNS: usize = 50;
    /// Default value for [`EngineConfig::max_fetch_attempts`].
    pub const DEFAULT_MAX_FETCH_ATTEMPTS: u32 = RetryConfig::DEFAULT_MAX_ATTEMPTS;
    /// Default value for [`EngineConfig::initial_retry_delay`].
    pub const DEFAULT_INITIAL_RETRY_DELAY: Duration = RetryConfig::DEFAULT_INITIAL_DELAY;
    /// Default value for [`EngineConfig::navigation_token_tolerance`].
    pub const DEFAULT_NAVIGATION_TOKEN_TOLERANCE: Duration = Duration::from_millis(1000);
    /// Default value for [`EngineConfig::flush_delay`].
    pub const DEFAULT_FLUSH_DELAY: Duration = EventQueueConfig::DEFAULT_FLUSH_DELAY;
    /// Default value for [`EngineConfig::max_queued_events`].
    pub const DEFAULT_MAX_QUEUED_EVENTS: usize = EventQueueConfig::DEFAULT_MAX_EVENTS;

    /// Create a configuration with default settings and a renderer that declines every campaign.
    ///
    /// ```
    /// # use nudge::EngineConfig;
    /// let config = EngineConfig::new();
    /// ```
    pub fn new() -> EngineConfig {
        EngineConfig::default()
    }

    /// How long cached campaigns are considered fresh.
    pub fn cache_ttl(mut self, ttl: Duration) -> EngineConfig {
        self.cache_ttl = ttl;
        self
    }

    /// Interval between periodic refreshes.
    pub fn refresh_interval(mut self, interval: Duration) -> EngineConfig {
        self.refresh_interval = interval;
        self
    }

    /// Upper bound of the random duration subtracted from every refresh interval.
    pub fn refresh_jitter(mut self, jitter: Duration) -> EngineConfig {
        self.refresh_jitter = jitter;
        self
    }

    /// Maximum number of campaigns kept in the cache. Lowest priority campaigns are dropped first.
    pub fn max_cached_campaigns(mut self, max: usize) -> EngineConfig {
        self.max_cached_campaigns = max;
        self
    }

    /// Total number of fetch attempts per refresh.
    pub fn max_fetch_attempts(mut self, attempts: u32) -> EngineConfig {
        self.max_fetch_attempts = attempts;
        self
    }

    /// Delay after the first failed fetch. Doubles after every further failure.
    pub fn initial_retry_delay(mut self, delay: Duration) -> EngineConfig {
        self.initial_retry_delay = delay;
        self
    }

    /// Screen changes closer together than this do not suppress a pending display.
    pub fn navigation_token_tolerance(mut self, tolerance: Duration) -> EngineConfig {
        self.navigation_token_tolerance = tolerance;
        self
    }

    /// Pause between two queued events during a flush.
    pub fn flush_delay(mut self, delay: Duration) -> EngineConfig {
        self.flush_delay = delay;
        self
    }

    /// Maximum number of failed writes kept for replay. The oldest is dropped when full.
    pub fn max_queued_events(mut self, max: usize) -> EngineConfig {
        self.max_queued_events = max;
        self
    }

    /// Identify the user from the start.
    pub fn user_id(mut self, user_id: impl Into<String>) -> EngineConfig {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the renderer that draws selected campaigns.
    ///
    /// ```
    /// # use std::sync::Arc;
    /// # use nudge::{Campaign, DisplayHandle, EngineConfig};
    /// let config = EngineConfig::new().renderer(|campaign: Arc<Campaign>, _handle: DisplayHandle| {
    ///     println!("showing {}", campaign.title);
    ///     true
    /// });
    /// ```
    pub fn renderer(mut self, renderer: impl Renderer + Send + Sync + 'static) -> EngineConfig {
        self.renderer = Box::new(renderer);
        self
    }

    /// Create a new [`Engine`] using this configuration.
    pub fn to_engine(
        self,
        transport: Arc<dyn Transport>,
        store: Arc<dyn PersistentStore>,
    ) -> Engine {
        Engine::new(self, transport, store)
    }

    pub(crate) fn cache_config(&self) -> MemoryCacheConfig {
        MemoryCacheConfig {
            ttl: self.cache_ttl,
            max_campaigns: self.max_cached_campaigns,
            schema_version: CACHE_SCHEMA_VERSION,
        }
    }

    pub(crate) fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_fetch_attempts,
            initial_delay: self.initial_retry_delay,
            ..RetryConfig::default()
        }
    }

    pub(crate) fn queue_config(&self) -> EventQueueConfig {
        EventQueueConfig {
            flush_delay: self.flush_delay,
            max_events: self.max_queued_events,
        }
    }

    pub(crate) fn refresh_config(&self) -> PeriodicRefreshConfig {
        PeriodicRefreshConfig {
            interval: self.refresh_interval,
            jitter: self.refresh_jitter,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            cache_ttl: EngineConfig::DEFAULT_CACHE_TTL,
            refresh_interval: EngineConfig::DEFAULT_REFRESH_INTERVAL,
            refresh_jitter: EngineConfig::DEFAULT_REFRESH_JITTER,
            max_cached_campaigns: EngineConfig::DEFAULT_MAX_CACHED_CAMPAIGNS,
            max_fetch_attempts: EngineConfig::DEFAULT_MAX_FETCH_ATTEMPTS,
            initial_retry_delay: EngineConfig::DEFAULT_INITIAL_RETRY_DELAY,
            navigation_token_tolerance: EngineConfig::DEFAULT_NAVIGATION_TOKEN_TOLERANCE,
            flush_delay: EngineConfig::DEFAULT_FLUSH_DELAY,
            max_queued_events: EngineConfig::DEFAULT_MAX_QUEUED_EVENTS,
            user_id: None,
            renderer: Box::new(NoopRenderer),
        }
    }
}
