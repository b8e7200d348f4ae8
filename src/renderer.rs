//! Seam between the engine and whatever draws campaigns on screen.
use std::sync::Arc;

use crate::{
    campaign::Campaign,
    event_queue::{Delivery, EventQueue},
    events::{EngineEvent, Observers, Properties, TrackPayload},
    session::Session,
};

/// Draws a campaign. The engine never knows how.
///
/// Returns `true` if the campaign was displayed. Returning `false` leaves the campaign eligible for
/// a later display.
///
/// Any `Fn(Arc<Campaign>, DisplayHandle) -> bool` closure is a renderer.
pub trait Renderer {
    #[allow(missing_docs)]
    fn render(&self, campaign: Arc<Campaign>, handle: DisplayHandle) -> bool;
}

/// Renderer for headless hosts. Declines every campaign.
pub(crate) struct NoopRenderer;
impl Renderer for NoopRenderer {
    fn render(&self, _campaign: Arc<Campaign>, _handle: DisplayHandle) -> bool {
        false
    }
}

impl<T: Fn(Arc<Campaign>, DisplayHandle) -> bool> Renderer for T {
    fn render(&self, campaign: Arc<Campaign>, handle: DisplayHandle) -> bool {
        self(campaign, handle)
    }
}

pub(crate) const IMPRESSION_ACTION: &str = "campaign_impression";
pub(crate) const DISMISS_ACTION: &str = "campaign_dismiss";
pub(crate) const CTA_ACTION: &str = "campaign_cta";

/// Callbacks a renderer reports user interaction through.
///
/// Each callback sends a track write (queued for replay if it fails) and notifies observers. The
/// handle is cheap to clone and may outlive the `render` call.
#[derive(Clone)]
pub struct DisplayHandle {
    campaign_id: String,
    queue: Arc<EventQueue>,
    observers: Arc<Observers>,
    session: Arc<Session>,
}

impl DisplayHandle {
    pub(crate) fn new(
        campaign_id: String,
        queue: Arc<EventQueue>,
        observers: Arc<Observers>,
        session: Arc<Session>,
    ) -> DisplayHandle {
        DisplayHandle {
            campaign_id,
            queue,
            observers,
            session,
        }
    }

    /// Id of the displayed campaign.
    pub fn campaign_id(&self) -> &str {
        &self.campaign_id
    }

    /// The campaign became visible.
    pub async fn impression(&self) -> Delivery {
        let delivery = self.send(IMPRESSION_ACTION, self.metadata()).await;
        self.observers.notify(EngineEvent::Impression {
            campaign_id: self.campaign_id.clone(),
        });
        delivery
    }

    /// The user closed the campaign.
    pub async fn dismiss(&self) -> Delivery {
        let delivery = self.send(DISMISS_ACTION, self.metadata()).await;
        self.observers.notify(EngineEvent::Dismissed {
            campaign_id: self.campaign_id.clone(),
        });
        delivery
    }

    /// The user activated a call-to-action. Observers receive `url` to perform the redirect.
    pub async fn cta(&self, action: &str, url: Option<&str>) -> Delivery {
        let mut metadata = self.metadata();
        metadata.insert("cta".to_owned(), action.into());
        if let Some(url) = url {
            metadata.insert("url".to_owned(), url.into());
        }

        let delivery = self.send(CTA_ACTION, metadata).await;
        self.observers.notify(EngineEvent::CtaClicked {
            campaign_id: self.campaign_id.clone(),
            action: action.to_owned(),
            url: url.map(str::to_owned),
        });
        delivery
    }

    fn metadata(&self) -> Properties {
        let campaign_id = serde_json::Value::from(self.campaign_id.as_str());
        Properties::from([("campaign_id".to_owned(), campaign_id)])
    }

    async fn send(&self, action: &str, metadata: Properties) -> Delivery {
        let payload = TrackPayload::new(self.session.user_id(), action, metadata);
        let delivery = self.queue.deliver(payload).await;
        if delivery == Delivery::Queued {
            self.observers.notify(EngineEvent::EventQueued {
                action: action.to_owned(),
            });
        }
        delivery
    }
}
