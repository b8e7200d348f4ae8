//! Test doubles shared by unit tests.
use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    campaign::{Campaign, CampaignsResponse},
    events::{IdentifyPayload, TrackPayload},
    transport::{FetchRequest, Transport},
    Error, Result,
};

pub(crate) fn active_campaign(id: &str, trigger: &str) -> Campaign {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "title": id,
        "trigger": trigger,
        "status": "active",
    }))
    .unwrap()
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    campaigns: Mutex<Vec<Campaign>>,
    fail_fetches: AtomicBool,
    fetch_delay: Mutex<Duration>,
    fetches: AtomicUsize,
    concurrent: AtomicUsize,
    max_concurrent: AtomicUsize,
    failing_actions: Mutex<Vec<String>>,
    fail_identify: AtomicBool,
    tracked: Mutex<Vec<TrackPayload>>,
    identified: Mutex<Vec<IdentifyPayload>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        FakeTransport::default()
    }

    pub(crate) fn set_campaigns(&self, campaigns: Vec<Campaign>) {
        *self.campaigns.lock().unwrap() = campaigns;
    }

    pub(crate) fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock().unwrap() = delay;
    }

    pub(crate) fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub(crate) fn max_concurrent_fetches(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    /// Make `/track` fail for the given actions.
    pub(crate) fn fail_actions(&self, actions: &[&str]) {
        *self.failing_actions.lock().unwrap() = actions.iter().map(|a| a.to_string()).collect();
    }

    pub(crate) fn fail_identify(&self, fail: bool) {
        self.fail_identify.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn tracked_actions(&self) -> Vec<String> {
        self.tracked
            .lock()
            .unwrap()
            .iter()
            .map(|payload| payload.action.clone())
            .collect()
    }

    pub(crate) fn identified(&self) -> Vec<IdentifyPayload> {
        self.identified.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn fetch_campaigns(&self, _request: &FetchRequest) -> Result<CampaignsResponse> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);

        let delay = *self.fetch_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.concurrent.fetch_sub(1, Ordering::SeqCst);

        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(Error::HttpStatus(503));
        }
        Ok(self.campaigns.lock().unwrap().clone().into())
    }

    async fn track(&self, payload: &TrackPayload) -> Result<()> {
        let failing_actions = self.failing_actions.lock().unwrap().clone();
        if failing_actions.contains(&payload.action) {
            return Err(Error::HttpStatus(500));
        }
        self.tracked.lock().unwrap().push(payload.clone());
        Ok(())
    }

    async fn identify(&self, payload: &IdentifyPayload) -> Result<()> {
        if self.fail_identify.load(Ordering::SeqCst) {
            return Err(Error::HttpStatus(500));
        }
        self.identified.lock().unwrap().push(payload.clone());
        Ok(())
    }
}
