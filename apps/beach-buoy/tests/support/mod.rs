#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use beach_buoy::call::{CallManager, CallSettings};
use beach_buoy::candidate::TranslatedCandidate;
use beach_buoy::credentials::IceServerConfig;
use beach_buoy::engine::{
    ConnectivityState, EngineError, EngineEvent, EngineEvents, EngineHandle, NegotiationEngine,
};
use beach_buoy::media::{MediaAttachment, MediaError, MediaSource, MediaTrack, NoMedia};
use beach_buoy::protocol::{ClientMessage, SessionDescription, Signal};
use beach_buoy::transport::SignalSender;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;

pub const OFFER_SDP: &str = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=mid:0\r\n";

pub fn offer() -> SessionDescription {
    SessionDescription::offer(OFFER_SDP)
}

/// Engine that records every call and lets tests drive its events.
#[derive(Default)]
pub struct FakeEngine {
    handles: Mutex<Vec<Arc<FakeHandle>>>,
    pub fail_create: AtomicBool,
    pub fail_remote_description: AtomicBool,
    gate: Mutex<Option<Arc<Semaphore>>>,
    ice_servers_seen: Mutex<Vec<Vec<IceServerConfig>>>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes every new handle block in `set_remote_description` until the
    /// returned semaphore receives a permit.
    pub fn hold_negotiation(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    pub fn handles(&self) -> Vec<Arc<FakeHandle>> {
        self.handles.lock().clone()
    }

    pub fn handle(&self, index: usize) -> Arc<FakeHandle> {
        Arc::clone(&self.handles.lock()[index])
    }

    pub fn ice_servers_seen(&self) -> Vec<Vec<IceServerConfig>> {
        self.ice_servers_seen.lock().clone()
    }

    /// Handle creations and closes across every handle, in the order they happened.
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }
}

#[async_trait]
impl NegotiationEngine for FakeEngine {
    async fn create_handle(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> Result<(Arc<dyn EngineHandle>, EngineEvents), EngineError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(EngineError::Setup("scripted failure".into()));
        }
        self.ice_servers_seen.lock().push(ice_servers.to_vec());
        let (tx, rx) = mpsc::unbounded_channel();
        let mut handles = self.handles.lock();
        self.journal.lock().push(format!("create:{}", handles.len()));
        let handle = Arc::new(FakeHandle {
            id: handles.len(),
            journal: Arc::clone(&self.journal),
            events: tx,
            calls: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            fail_remote_description: self.fail_remote_description.load(Ordering::SeqCst),
            gate: self.gate.lock().clone(),
        });
        handles.push(Arc::clone(&handle));
        let handle: Arc<dyn EngineHandle> = handle;
        Ok((handle, rx))
    }
}

pub struct FakeHandle {
    pub id: usize,
    journal: Arc<Mutex<Vec<String>>>,
    events: mpsc::UnboundedSender<EngineEvent>,
    calls: Mutex<Vec<String>>,
    closes: AtomicUsize,
    fail_remote_description: bool,
    gate: Option<Arc<Semaphore>>,
}

impl FakeHandle {
    pub fn emit(&self, state: ConnectivityState) {
        let _ = self.events.send(EngineEvent::Connectivity(state));
    }

    pub fn emit_local_candidate(&self, candidate: RTCIceCandidate) {
        let _ = self.events.send(EngineEvent::LocalCandidate(candidate));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }
}

#[async_trait]
impl EngineHandle for FakeHandle {
    async fn attach_media(&self, tracks: &[MediaTrack]) -> Result<(), EngineError> {
        self.record(format!("attach_media:{}", tracks.len()));
        Ok(())
    }

    async fn set_remote_description(&self, sdp: &SessionDescription) -> Result<(), EngineError> {
        if let Some(gate) = &self.gate {
            let permit = gate.acquire().await.map_err(|_| EngineError::Closed)?;
            permit.forget();
        }
        self.record("set_remote_description");
        if self.fail_remote_description || sdp.sdp.is_empty() {
            return Err(EngineError::Description("scripted rejection".into()));
        }
        Ok(())
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.record("create_answer");
        Ok(SessionDescription::answer(format!(
            "v=0\r\no=fake {} 1 IN IP4 127.0.0.1\r\na=mid:0\r\n",
            self.id
        )))
    }

    async fn set_local_description(&self, _sdp: &SessionDescription) -> Result<(), EngineError> {
        self.record("set_local_description");
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: &TranslatedCandidate) -> Result<(), EngineError> {
        self.record(format!("candidate:{}", candidate.candidate.foundation));
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.journal.lock().push(format!("close:{}", self.id));
        self.record("close");
        Ok(())
    }
}

/// Hands every session a silent video track so media attachment is exercised.
pub struct SilentVideo;

impl MediaSource for SilentVideo {
    fn open(&self, _base: &Path) -> Result<Option<MediaAttachment>, MediaError> {
        Ok(Some(MediaAttachment::silent(vec![MediaTrack::video()])))
    }
}

pub struct Harness {
    pub manager: CallManager,
    pub engine: Arc<FakeEngine>,
    pub outbound: SignalSender,
    pub rx: mpsc::UnboundedReceiver<ClientMessage>,
}

impl Harness {
    pub fn new(settings: CallSettings) -> Self {
        Self::with_media(settings, Arc::new(NoMedia))
    }

    pub fn with_media(settings: CallSettings, media: Arc<dyn MediaSource>) -> Self {
        beach_buoy::telemetry::init_test_tracing();
        let engine = FakeEngine::new();
        let manager = CallManager::new(engine.clone(), media, settings);
        let (outbound, rx) = SignalSender::channel();
        manager.bind(outbound.clone(), Vec::new());
        Self {
            manager,
            engine,
            outbound,
            rx,
        }
    }

    pub async fn next_message(&mut self) -> ClientMessage {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("timed out waiting for outbound message")
            .expect("outbound channel closed")
    }

    pub fn try_next_message(&mut self) -> Option<ClientMessage> {
        self.rx.try_recv().ok()
    }

    /// Waits for the next outbound `answer` addressed to `peer`.
    pub async fn expect_answer(&mut self, peer: &str) -> SessionDescription {
        loop {
            match self.next_message().await {
                ClientMessage::Signal {
                    target,
                    payload: Signal::Answer { sdp, .. },
                } if target == peer => return sdp,
                ClientMessage::Signal {
                    payload: Signal::IceCandidate { .. },
                    ..
                } => continue,
                other => panic!("expected answer for {peer}, got {other:?}"),
            }
        }
    }
}

/// Polls `condition` until it holds, yielding to other tasks in between.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}
