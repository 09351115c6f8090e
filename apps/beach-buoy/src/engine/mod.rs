//! Narrow contract over the negotiation engine.
//!
//! A call session only ever talks to an [`EngineHandle`]; the handle's two
//! event streams (connectivity changes and locally discovered candidates) are
//! multiplexed onto one [`EngineEvents`] receiver that the session owns.

pub mod rtc;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;

use crate::candidate::TranslatedCandidate;
use crate::credentials::IceServerConfig;
use crate::media::MediaTrack;
use crate::protocol::SessionDescription;

pub use rtc::RtcEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectivityState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectivityState {
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectivityState::Connected | ConnectivityState::Completed)
    }

    pub fn is_failed(self) -> bool {
        matches!(self, ConnectivityState::Failed | ConnectivityState::Closed)
    }

    pub fn is_disconnected(self) -> bool {
        self == ConnectivityState::Disconnected
    }
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    Connectivity(ConnectivityState),
    LocalCandidate(RTCIceCandidate),
}

pub type EngineEvents = mpsc::UnboundedReceiver<EngineEvent>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine setup failed: {0}")]
    Setup(String),
    #[error("description rejected: {0}")]
    Description(String),
    #[error("candidate rejected: {0}")]
    Candidate(String),
    #[error("media attach failed: {0}")]
    Media(String),
    #[error("engine handle closed")]
    Closed,
}

#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    async fn create_handle(
        &self,
        ice_servers: &[IceServerConfig],
    ) -> Result<(Arc<dyn EngineHandle>, EngineEvents), EngineError>;
}

#[async_trait]
pub trait EngineHandle: Send + Sync {
    async fn attach_media(&self, tracks: &[MediaTrack]) -> Result<(), EngineError>;
    async fn set_remote_description(&self, sdp: &SessionDescription) -> Result<(), EngineError>;
    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;
    async fn set_local_description(&self, sdp: &SessionDescription) -> Result<(), EngineError>;
    async fn add_remote_candidate(&self, candidate: &TranslatedCandidate) -> Result<(), EngineError>;
    /// Stops event delivery and releases the underlying connection.
    async fn close(&self) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::ConnectivityState::*;

    #[test]
    fn connectivity_classes() {
        assert!(Connected.is_connected());
        assert!(Completed.is_connected());
        assert!(!Checking.is_connected());
        assert!(Failed.is_failed());
        assert!(Closed.is_failed());
        assert!(!Disconnected.is_failed());
        assert!(Disconnected.is_disconnected());
    }
}
