use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::track::track_local::TrackLocal;

use super::{
    ConnectivityState, EngineError, EngineEvent, EngineEvents, EngineHandle, NegotiationEngine,
};
use crate::candidate::TranslatedCandidate;
use crate::credentials::IceServerConfig;
use crate::media::MediaTrack;
use crate::protocol::{SdpType, SessionDescription};

fn build_api(setting: SettingEngine) -> Result<API, EngineError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

fn to_setup_error<E: std::fmt::Display>(err: E) -> EngineError {
    EngineError::Setup(err.to_string())
}

fn to_description_error<E: std::fmt::Display>(err: E) -> EngineError {
    EngineError::Description(err.to_string())
}

impl From<RTCIceConnectionState> for ConnectivityState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => {
                ConnectivityState::New
            }
            RTCIceConnectionState::Checking => ConnectivityState::Checking,
            RTCIceConnectionState::Connected => ConnectivityState::Connected,
            RTCIceConnectionState::Completed => ConnectivityState::Completed,
            RTCIceConnectionState::Disconnected => ConnectivityState::Disconnected,
            RTCIceConnectionState::Failed => ConnectivityState::Failed,
            RTCIceConnectionState::Closed => ConnectivityState::Closed,
        }
    }
}

/// webrtc-rs backed engine. One `API` instance is shared by every handle.
pub struct RtcEngine {
    api: Arc<API>,
}

impl RtcEngine {
    pub fn new() -> Result<Self, EngineError> {
        Ok(Self {
            api: Arc::new(build_api(SettingEngine::default())?),
        })
    }
}

#[async_trait]
impl NegotiationEngine for RtcEngine {
    async fn create_handle(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> Result<(Arc<dyn EngineHandle>, EngineEvents), EngineError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers.iter().map(RTCIceServer::from).collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(to_setup_error)?,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let state_tx = events_tx.clone();
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            let state_tx = state_tx.clone();
            Box::pin(async move {
                tracing::debug!(target = "buoy.engine", ?state, "ice connection state changed");
                let _ = state_tx.send(EngineEvent::Connectivity(state.into()));
            })
        }));

        let candidate_tx = events_tx;
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    let _ = candidate_tx.send(EngineEvent::LocalCandidate(candidate));
                }
            })
        }));

        let handle: Arc<dyn EngineHandle> = Arc::new(RtcHandle {
            pc,
            rtcp_tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        Ok((handle, events_rx))
    }
}

struct RtcHandle {
    pc: Arc<RTCPeerConnection>,
    rtcp_tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RtcHandle {
    fn ensure_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl EngineHandle for RtcHandle {
    async fn attach_media(&self, tracks: &[MediaTrack]) -> Result<(), EngineError> {
        self.ensure_open()?;
        for track in tracks {
            let sender = self
                .pc
                .add_track(track.track() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|err| EngineError::Media(format!("add {} track: {err}", track.kind())))?;
            // Incoming RTCP must be read for interceptors (NACK, reports) to run.
            let drain = tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
            self.rtcp_tasks.lock().push(drain);
        }
        Ok(())
    }

    async fn set_remote_description(&self, sdp: &SessionDescription) -> Result<(), EngineError> {
        self.ensure_open()?;
        let description = match sdp.kind {
            SdpType::Offer => RTCSessionDescription::offer(sdp.sdp.clone()),
            SdpType::Answer => RTCSessionDescription::answer(sdp.sdp.clone()),
            SdpType::Pranswer => RTCSessionDescription::pranswer(sdp.sdp.clone()),
            SdpType::Rollback => {
                return Err(EngineError::Description(
                    "rollback is not a remote description".into(),
                ));
            }
        }
        .map_err(to_description_error)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_description_error)
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.ensure_open()?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(to_description_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(&self, sdp: &SessionDescription) -> Result<(), EngineError> {
        self.ensure_open()?;
        let description =
            RTCSessionDescription::answer(sdp.sdp.clone()).map_err(to_description_error)?;
        self.pc
            .set_local_description(description)
            .await
            .map_err(to_description_error)
    }

    async fn add_remote_candidate(&self, candidate: &TranslatedCandidate) -> Result<(), EngineError> {
        self.ensure_open()?;
        self.pc
            .add_ice_candidate(candidate.to_init())
            .await
            .map_err(|err| EngineError::Candidate(err.to_string()))
    }

    async fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pc
            .on_ice_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
        for task in self.rtcp_tasks.lock().drain(..) {
            task.abort();
        }
        self.pc.close().await.map_err(to_setup_error)
    }
}
