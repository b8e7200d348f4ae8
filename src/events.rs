//! Outbound analytics payloads and engine notifications.
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use chrono::Utc;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use serde::{Deserialize, Serialize};

use crate::campaign::Timestamp;

/// Free-form key-value data attached to events and identities.
pub type Properties = HashMap<String, serde_json::Value>;

/// Body of `POST /track`.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPayload {
    pub event_id: String,
    pub timestamp: Timestamp,
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
    pub action: String,
    #[serde(default)]
    pub metadata: Properties,
}

impl TrackPayload {
    pub(crate) fn new(user_id: Option<String>, action: &str, metadata: Properties) -> Self {
        TrackPayload {
            event_id: new_event_id(),
            timestamp: Utc::now(),
            user_id,
            action: action.to_owned(),
            metadata,
        }
    }
}

/// Body of `POST /identify`.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifyPayload {
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(default)]
    pub traits: Properties,
    pub timestamp: Timestamp,
}

fn new_event_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

/// Why a selected campaign was not displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    /// The user navigated away between selection and display.
    NavigatedAway,
    /// The campaign was already shown this session and is not repeatable.
    AlreadyShown,
    /// The renderer declined to draw the campaign.
    RendererDeclined,
}

/// Notifications emitted by the engine to registered observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum EngineEvent {
    CampaignsRefreshed { count: usize },
    CampaignShown { campaign_id: String },
    CampaignSuppressed {
        campaign_id: String,
        reason: SuppressReason,
    },
    Impression { campaign_id: String },
    Dismissed { campaign_id: String },
    /// A call-to-action was activated. Hosts handle `url` redirects.
    CtaClicked {
        campaign_id: String,
        action: String,
        url: Option<String>,
    },
    /// An outbound write failed and was queued for replay.
    EventQueued { action: String },
}

/// Receives [`EngineEvent`]s.
pub trait Observer {
    #[allow(missing_docs)]
    fn on_event(&self, event: &EngineEvent);
}

impl<T: Fn(&EngineEvent)> Observer for T {
    fn on_event(&self, event: &EngineEvent) {
        self(event);
    }
}

/// Handle returned by [`Observers::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type SharedObserver = Arc<dyn Observer + Send + Sync>;

/// Registry of subscribed observers.
#[derive(Default)]
pub struct Observers {
    next_id: AtomicU64,
    observers: Mutex<Vec<(ObserverId, SharedObserver)>>,
}

impl Observers {
    #[allow(missing_docs)]
    pub fn new() -> Self {
        Observers::default()
    }

    #[allow(missing_docs)]
    pub fn subscribe(&self, observer: impl Observer + Send + Sync + 'static) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.lock().push((id, Arc::new(observer)));
        id
    }

    /// Returns `false` if `id` was not subscribed.
    pub fn unsubscribe(&self, id: ObserverId) -> bool {
        let mut observers = self.lock();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Deliver `event` to every observer.
    ///
    /// The registry lock is released before calling out, so observers may subscribe or
    /// unsubscribe from inside the callback.
    pub fn notify(&self, event: EngineEvent) {
        let observers: Vec<SharedObserver> = self
            .lock()
            .iter()
            .map(|(_, observer)| observer.clone())
            .collect();
        for observer in observers {
            observer.on_event(&event);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(ObserverId, SharedObserver)>> {
        self.observers
            .lock()
            .expect("thread holding observers lock should not panic")
    }
}
