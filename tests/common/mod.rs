#![allow(dead_code)]

use std::{
    fs::File,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use nudge::{
    Campaign, CampaignsResponse, DisplayHandle, EngineConfig, Error, FetchRequest, IdentifyPayload,
    Result, TrackPayload, Transport,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Raw body of the campaigns fixture.
pub fn fixture_response() -> serde_json::Value {
    let f = File::open("tests/data/campaigns-v1.json")
        .expect("Failed to open tests/data/campaigns-v1.json");
    serde_json::from_reader(f).unwrap()
}

/// In-memory backend.
#[derive(Default)]
pub struct TestBackend {
    response: Mutex<serde_json::Value>,
    fail_fetches: AtomicBool,
    fetches: AtomicUsize,
    fetch_requests: Mutex<Vec<FetchRequest>>,
    offline_writes: AtomicBool,
    tracked: Mutex<Vec<TrackPayload>>,
    identified: Mutex<Vec<IdentifyPayload>>,
}

impl TestBackend {
    pub fn with_response(response: serde_json::Value) -> Arc<TestBackend> {
        let backend = TestBackend::default();
        *backend.response.lock().unwrap() = response;
        Arc::new(backend)
    }

    pub fn set_response(&self, response: serde_json::Value) {
        *self.response.lock().unwrap() = response;
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.fail_fetches.store(fail, Ordering::SeqCst);
    }

    pub fn set_offline_writes(&self, offline: bool) {
        self.offline_writes.store(offline, Ordering::SeqCst);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn fetch_requests(&self) -> Vec<FetchRequest> {
        self.fetch_requests.lock().unwrap().clone()
    }

    pub fn tracked_actions(&self) -> Vec<String> {
        self.tracked
            .lock()
            .unwrap()
            .iter()
            .map(|payload| payload.action.clone())
            .collect()
    }

    pub fn tracked(&self) -> Vec<TrackPayload> {
        self.tracked.lock().unwrap().clone()
    }

    pub fn identified(&self) -> Vec<IdentifyPayload> {
        self.identified.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for TestBackend {
    async fn fetch_campaigns(&self, request: &FetchRequest) -> Result<CampaignsResponse> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.fetch_requests.lock().unwrap().push(request.clone());
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(Error::HttpStatus(503));
        }
        let response = self.response.lock().unwrap().clone();
        Ok(serde_json::from_value(response)?)
    }

    async fn track(&self, payload: &TrackPayload) -> Result<()> {
        if self.offline_writes.load(Ordering::SeqCst) {
            return Err(Error::Transport("offline".into()));
        }
        self.tracked.lock().unwrap().push(payload.clone());
        Ok(())
    }

    async fn identify(&self, payload: &IdentifyPayload) -> Result<()> {
        if self.offline_writes.load(Ordering::SeqCst) {
            return Err(Error::Transport("offline".into()));
        }
        self.identified.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

/// Renderer recording campaign ids and handing out the display handles.
#[derive(Clone, Default)]
pub struct RecordingRenderer {
    pub shown: Arc<Mutex<Vec<String>>>,
    pub handles: Arc<Mutex<Vec<DisplayHandle>>>,
}

impl RecordingRenderer {
    pub fn install(&self, config: EngineConfig) -> EngineConfig {
        let renderer = self.clone();
        config.renderer(move |campaign: Arc<Campaign>, handle: DisplayHandle| {
            renderer.shown.lock().unwrap().push(campaign.id.clone());
            renderer.handles.lock().unwrap().push(handle);
            true
        })
    }

    pub fn shown(&self) -> Vec<String> {
        self.shown.lock().unwrap().clone()
    }

    pub fn last_handle(&self) -> DisplayHandle {
        self.handles.lock().unwrap().last().cloned().unwrap()
    }
}
