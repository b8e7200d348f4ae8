//! Campaign cache, matching and selection engine for in-app nudges.
//!
//! # Overview
//!
//! The crate revolves around an [`Engine`] that receives application events (`track`), matches
//! them against a locally cached set of [`Campaign`]s and hands at most one campaign per event to a
//! host-provided [`Renderer`]. Campaign matching never waits on the network: the cache is refreshed
//! in the background and every event is evaluated against whatever snapshot is current.
//!
//! The engine talks to the outside world through two seams:
//! - a [`Transport`] for fetching campaigns and sending track/identify writes. [`HttpTransport`] is
//!   the default implementation.
//! - a [`PersistentStore`] for keeping the campaign cache and the queue of failed writes across
//!   restarts. [`MemoryStore`] and [`FileStore`] are provided.
//!
//! # Error Handling
//!
//! Errors are represented by the [`Error`] enum.
//!
//! Network failures are never surfaced as crashes: fetches are retried with exponential backoff and
//! failed writes are queued for replay. The one error callers must not ignore is
//! [`Error::NotInitialized`], returned when the engine is used before [`Engine::initialize`].
//!
//! # Logging
//!
//! The package uses the [`log`](https://docs.rs/log/latest/log/) crate for logging messages, with
//! target `nudge` and structured key-values. Consider integrating a `log`-compatible logger
//! implementation for better visibility into engine operations.
//!
//! # Examples
//!
//! Examples can be found in the `demos` directory of the `nudge` crate repository.

#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]

mod cache;
mod campaign;
mod config;
mod engine;
mod error;
mod event_queue;
mod events;
mod matching;
mod poller;
mod renderer;
mod selection;
mod session;
mod store;
mod sync;
mod transport;

#[cfg(test)]
mod testing;

pub use cache::{
    CacheEnvelope, CacheSnapshot, LoadedCache, MemoryCache, MemoryCacheConfig, CACHE_SCHEMA_VERSION,
};
pub use campaign::{
    Campaign, CampaignStatus, CampaignsResponse, DisplayRules, Frequency, InteractionLimit,
    Operator, RuleKind, TargetingRule, Timestamp, TriggerRef, TryParse,
};
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{Error, Result};
pub use event_queue::{
    Delivery, EventQueue, EventQueueConfig, FlushReport, OutboundEvent, QueuedEvent,
};
pub use events::{
    EngineEvent, IdentifyPayload, Observer, ObserverId, Observers, Properties, SuppressReason,
    TrackPayload,
};
pub use matching::match_campaigns;
pub use poller::{PeriodicRefresh, PeriodicRefreshConfig};
pub use renderer::{DisplayHandle, Renderer};
pub use selection::{DisplayDecision, Selection, SelectionCoordinator};
pub use session::{NavigationToken, Session};
pub use store::{FileStore, MemoryStore, PersistentStore, StoreError};
pub use sync::{fetch_with_retry, RefreshOutcome, RetryConfig, SyncScheduler};
pub use transport::{FetchRequest, HttpTransport, HttpTransportConfig, Transport};
