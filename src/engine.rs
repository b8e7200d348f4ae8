use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use tokio::sync::watch;

use crate::{
    cache::{LoadedCache, MemoryCache},
    campaign::{Campaign, Timestamp},
    event_queue::{Delivery, EventQueue, FlushReport, OutboundEvent, QueuedEvent},
    events::{
        EngineEvent, IdentifyPayload, Observer, ObserverId, Observers, Properties, SuppressReason,
        TrackPayload,
    },
    matching::match_campaigns,
    poller::{wait_for_outcome, PeriodicRefresh, PeriodicRefreshConfig},
    renderer::{DisplayHandle, Renderer},
    selection::{DisplayDecision, Selection, SelectionCoordinator},
    session::{NavigationToken, Session},
    store::PersistentStore,
    sync::{RefreshOutcome, SyncScheduler},
    transport::Transport,
    EngineConfig, Error, Result,
};

/// The campaign engine.
///
/// One instance owns the campaign cache, the session, the selection state and the event queue.
/// Create it with [`EngineConfig::to_engine`], then call [`Engine::initialize`] before use.
///
/// # Examples
/// ```
/// # use std::sync::Arc;
/// # use nudge::{EngineConfig, HttpTransport, HttpTransportConfig, MemoryStore};
/// # async fn run() -> nudge::Result<()> {
/// let transport = HttpTransport::new(HttpTransportConfig::from_api_key("api-key"))?;
/// let engine = EngineConfig::new().to_engine(Arc::new(transport), Arc::new(MemoryStore::new()));
/// engine.initialize().await?;
/// engine.set_screen("home");
/// let shown = engine.track("app_open", Default::default()).await?;
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    cache: Arc<MemoryCache>,
    refresher: Refresher,
    session: Arc<Session>,
    selection: SelectionCoordinator,
    queue: Arc<EventQueue>,
    observers: Arc<Observers>,
    renderer: Box<dyn Renderer + Send + Sync>,
    refresh_config: PeriodicRefreshConfig,
    initialized: AtomicBool,
    /// Cancels in-flight refreshes when set to `true`.
    shutdown: watch::Sender<bool>,
    periodic: Mutex<Option<PeriodicRefresh>>,
    /// Serializes suppression check, render and display record.
    display: Mutex<()>,
}

impl Engine {
    /// Create a new `Engine` using the specified configuration.
    pub fn new(
        config: EngineConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn PersistentStore>,
    ) -> Engine {
        let cache = Arc::new(MemoryCache::new(store.clone(), config.cache_config()));
        let (shutdown, shutdown_receiver) = watch::channel(false);
        let scheduler = Arc::new(SyncScheduler::new(
            cache.clone(),
            transport.clone(),
            config.retry_config(),
            shutdown_receiver,
        ));
        let session = Arc::new(Session::new(config.user_id.clone(), Instant::now()));
        let observers = Arc::new(Observers::new());

        Engine {
            cache,
            refresher: Refresher {
                scheduler,
                session: session.clone(),
                observers: observers.clone(),
            },
            session,
            selection: SelectionCoordinator::new(config.navigation_token_tolerance),
            queue: Arc::new(EventQueue::new(store, transport, config.queue_config())),
            observers,
            refresh_config: config.refresh_config(),
            renderer: config.renderer,
            initialized: AtomicBool::new(false),
            shutdown,
            periodic: Mutex::new(None),
            display: Mutex::new(()),
        }
    }

    /// Load the persisted campaign cache and event queue.
    ///
    /// A corrupted or outdated cache is discarded and the engine starts cold. Stale data is served
    /// until the next refresh.
    ///
    /// # Errors
    ///
    /// Fails only if the persistent store itself fails.
    pub async fn initialize(&self) -> Result<LoadedCache> {
        self.shutdown.send_replace(false);

        let loaded = self.cache.load_from_persistent_store(Utc::now()).await?;
        let pending_events = self.queue.load().await?;

        self.initialized.store(true, Ordering::Release);
        log::info!(target: "nudge",
                   campaigns = loaded.count,
                   stale = loaded.stale,
                   pending_events;
                   "engine initialized");
        Ok(loaded)
    }

    /// Whether [`Engine::initialize`] completed and [`Engine::dispose`] was not called since.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Shut the engine down.
    ///
    /// Stops periodic refresh, cancels any in-flight refresh, forgets the selection state and the
    /// active screen. Cached campaigns and queued events stay persisted. The engine must be
    /// initialized again before further use.
    pub async fn dispose(&self) {
        self.initialized.store(false, Ordering::Release);
        self.shutdown.send_replace(true);

        let periodic = self.periodic_lock().take();
        if let Some(periodic) = periodic {
            if let Err(err) = periodic.shutdown().await {
                log::warn!(target: "nudge", "error while stopping periodic refresh: {err}");
            }
        }

        self.selection.reset();
        self.session.reset_navigation(Instant::now());
        log::debug!(target: "nudge", "engine disposed");
    }

    /// Make `screen` the active screen. Switching to a different screen issues a new navigation
    /// token.
    pub fn set_screen(&self, screen: impl Into<String>) -> NavigationToken {
        self.session.set_screen(screen, Instant::now())
    }

    /// Currently active screen.
    pub fn current_screen(&self) -> Option<String> {
        self.session.current_screen()
    }

    /// Identified user, if any.
    pub fn user_id(&self) -> Option<String> {
        self.session.user_id()
    }

    /// Match `event_name` against the cached campaigns and select one for display.
    ///
    /// The result is tagged with the current navigation token. Pass it to [`Engine::present`]
    /// right before drawing.
    pub fn evaluate(&self, event_name: &str, properties: &Properties) -> Result<Option<Selection>> {
        self.ensure_initialized(event_name)?;

        let snapshot = self.cache.snapshot();
        let (screen, token) = self.session.screen_and_token();
        let matches = match_campaigns(
            event_name,
            properties,
            screen.as_deref(),
            &snapshot.campaigns,
        );

        Ok(self
            .selection
            .select(event_name, screen.as_deref(), &matches, token))
    }

    /// Render `selection` unless it must be suppressed. Returns `true` if it was displayed.
    ///
    /// The renderer is called synchronously and must not call back into `present`.
    pub fn present(&self, selection: &Selection) -> Result<bool> {
        self.ensure_initialized(&selection.event_name)?;

        let campaign_id = selection.campaign.id.clone();
        match self.display(selection) {
            Ok(()) => {
                log::debug!(target: "nudge", campaign_id = campaign_id.as_str(); "campaign shown");
                self.observers
                    .notify(EngineEvent::CampaignShown { campaign_id });
                Ok(true)
            }
            Err(reason) => {
                log::debug!(target: "nudge",
                            campaign_id = campaign_id.as_str();
                            "campaign suppressed: {reason:?}");
                self.observers.notify(EngineEvent::CampaignSuppressed {
                    campaign_id,
                    reason,
                });
                Ok(false)
            }
        }
    }

    /// Report an application event.
    ///
    /// The event is matched and a campaign presented before this returns control to the network.
    /// The event is then sent to the backend, queued for replay if that fails. Returns the
    /// campaign that was displayed, if any.
    pub async fn track(
        &self,
        event_name: &str,
        properties: Properties,
    ) -> Result<Option<Arc<Campaign>>> {
        let displayed = match self.evaluate(event_name, &properties)? {
            Some(selection) if self.present(&selection)? => Some(selection.campaign),
            _ => None,
        };

        let payload = TrackPayload::new(self.session.user_id(), event_name, properties);
        self.deliver(payload).await;

        Ok(displayed)
    }

    /// Identify the current user and send `traits` to the backend.
    ///
    /// Subsequent fetches and events carry `user_id`.
    pub async fn identify(
        &self,
        user_id: impl Into<String>,
        traits: Properties,
    ) -> Result<Delivery> {
        self.ensure_initialized("identify")?;

        let user_id = user_id.into();
        self.session.set_user_id(user_id.clone());
        let payload = IdentifyPayload {
            user_id,
            traits,
            timestamp: Utc::now(),
        };
        Ok(self.deliver(payload).await)
    }

    /// Fetch campaigns now. Does nothing if a refresh is already in flight.
    pub async fn refresh_now(&self) -> Result<RefreshOutcome> {
        self.ensure_initialized("refresh")?;
        Ok(self.refresher.run().await)
    }

    /// Start refreshing campaigns in the background every refresh interval.
    ///
    /// The first refresh runs immediately if the cache is empty or stale. Calling this while
    /// periodic refresh is running has no effect.
    ///
    /// # Errors
    ///
    /// - [`Error::NotInitialized`]
    /// - [`Error::NoRuntime`] when called outside a tokio runtime.
    pub fn start_periodic_refresh(&self) -> Result<()> {
        self.ensure_initialized("start_periodic_refresh")?;

        let mut periodic = self.periodic_lock();
        if periodic.is_some() {
            log::debug!(target: "nudge", "periodic refresh already running");
            return Ok(());
        }

        let run_immediately = self.cache.needs_refresh(Utc::now());
        let refresher = self.refresher.clone();
        *periodic = Some(PeriodicRefresh::start(
            self.refresh_config.clone(),
            run_immediately,
            move || {
                let refresher = refresher.clone();
                async move { refresher.run().await }
            },
        )?);
        Ok(())
    }

    /// Stop periodic refresh. Does not wait for the background task to exit.
    pub fn stop_periodic_refresh(&self) {
        if let Some(periodic) = self.periodic_lock().take() {
            periodic.stop();
        }
    }

    /// Wait for the first periodic refresh to complete.
    ///
    /// Returns `None` if periodic refresh is not running or was stopped before refreshing.
    pub async fn wait_for_first_refresh(&self) -> Option<RefreshOutcome> {
        let first_outcome = self.periodic_lock().as_ref()?.first_outcome();
        wait_for_outcome(first_outcome).await
    }

    /// Replay queued events in order.
    pub async fn flush_events(&self) -> Result<FlushReport> {
        self.ensure_initialized("flush_events")?;
        Ok(self.queue.flush().await)
    }

    /// Drop cached campaigns from memory and from the persistent store.
    pub async fn clear_cache(&self) -> Result<()> {
        self.cache.clear().await
    }

    /// Campaigns currently in the cache, in server order.
    pub fn cached_campaigns(&self) -> Vec<Arc<Campaign>> {
        self.cache.snapshot().campaigns.clone()
    }

    /// Age of the cached campaigns. `None` if nothing was fetched or loaded yet.
    pub fn cache_age(&self) -> Option<Duration> {
        self.cache.snapshot().age(Utc::now())
    }

    /// When the campaign was last displayed in this session.
    pub fn last_shown(&self, campaign_id: &str) -> Option<Timestamp> {
        self.selection.last_shown(campaign_id)
    }

    /// Events waiting for replay, in replay order.
    pub async fn queued_events(&self) -> Vec<QueuedEvent> {
        self.queue.snapshot().await
    }

    /// Register an observer for [`EngineEvent`]s.
    pub fn subscribe(&self, observer: impl Observer + Send + Sync + 'static) -> ObserverId {
        self.observers.subscribe(observer)
    }

    /// Returns `false` if `id` was not subscribed.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        self.observers.unsubscribe(id)
    }

    fn ensure_initialized(&self, operation: &str) -> Result<()> {
        if self.is_initialized() {
            Ok(())
        } else {
            log::error!(target: "nudge", operation; "engine used before initialization");
            Err(Error::NotInitialized)
        }
    }

    fn display(&self, selection: &Selection) -> std::result::Result<(), SuppressReason> {
        let _display = self
            .display
            .lock()
            .expect("thread holding display lock should not panic");

        let current = self.session.navigation_token();
        if let DisplayDecision::Suppress(reason) =
            self.selection.check_display(selection, &current)
        {
            return Err(reason);
        }

        let handle = DisplayHandle::new(
            selection.campaign.id.clone(),
            self.queue.clone(),
            self.observers.clone(),
            self.session.clone(),
        );
        if !self.renderer.render(selection.campaign.clone(), handle) {
            return Err(SuppressReason::RendererDeclined);
        }

        self.selection
            .record_display(&selection.campaign.id, Utc::now());
        Ok(())
    }

    async fn deliver(&self, event: impl Into<OutboundEvent>) -> Delivery {
        let event = event.into();
        let action = event.action().to_owned();
        let delivery = self.queue.deliver(event).await;
        if delivery == Delivery::Queued {
            self.observers.notify(EngineEvent::EventQueued { action });
        }
        delivery
    }

    fn periodic_lock(&self) -> MutexGuard<'_, Option<PeriodicRefresh>> {
        self.periodic
            .lock()
            .expect("thread holding periodic refresh lock should not panic")
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        if let Ok(periodic) = self.periodic.get_mut() {
            if let Some(periodic) = periodic.take() {
                periodic.stop();
            }
        }
    }
}

/// Shared by [`Engine::refresh_now`] and the periodic refresh task.
#[derive(Clone)]
struct Refresher {
    scheduler: Arc<SyncScheduler>,
    session: Arc<Session>,
    observers: Arc<Observers>,
}

impl Refresher {
    async fn run(&self) -> RefreshOutcome {
        let request = self.session.fetch_request();
        let outcome = self.scheduler.refresh_now(request).await;
        if let RefreshOutcome::Updated { count } = outcome {
            self.observers
                .notify(EngineEvent::CampaignsRefreshed { count });
        }
        outcome
    }
}
