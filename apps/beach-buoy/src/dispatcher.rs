//! Routes inbound room traffic, one envelope at a time, in arrival order.

use crate::call::CallManager;
use crate::protocol::{ClientMessage, InboundMessage, Signal};
use crate::transport::{SignalSender, TransportError};

pub struct SignalingDispatcher {
    manager: CallManager,
    outbound: SignalSender,
    self_id: Option<String>,
}

impl SignalingDispatcher {
    pub fn new(manager: CallManager, outbound: SignalSender) -> Self {
        Self {
            manager,
            outbound,
            self_id: None,
        }
    }

    /// Identifier the endpoint assigned to us, once `connected` has arrived.
    pub fn self_id(&self) -> Option<&str> {
        self.self_id.as_deref()
    }

    /// Parses and handles one text frame. Malformed envelopes are logged and
    /// dropped; only a closed outbound channel is reported.
    pub async fn handle_text(&mut self, text: &str) -> Result<(), TransportError> {
        match InboundMessage::parse(text) {
            Ok(message) => self.handle(message).await,
            Err(err) => {
                tracing::warn!(target = "buoy.signaling", error = %err, "dropping malformed envelope");
                Ok(())
            }
        }
    }

    pub async fn handle(&mut self, message: InboundMessage) -> Result<(), TransportError> {
        tracing::trace!(target = "buoy.signaling", kind = message.kind(), "envelope received");
        match message {
            InboundMessage::Ping => {
                self.outbound.send(ClientMessage::Pong)?;
            }
            InboundMessage::Pong | InboundMessage::Join => {}
            InboundMessage::Connected { user_id } => {
                tracing::info!(target = "buoy.signaling", self_id = %user_id, "joined room");
                self.self_id = Some(user_id);
            }
            InboundMessage::UserJoined { peer_id } => match self.self_id.clone() {
                Some(uuid) => {
                    tracing::debug!(target = "buoy.signaling", peer_id = %peer_id, "announcing identity to new peer");
                    self.outbound.signal(&peer_id, Signal::MyUuid { uuid })?;
                }
                None => {
                    tracing::debug!(target = "buoy.signaling", peer_id = %peer_id, "peer joined before our identity was assigned");
                }
            },
            InboundMessage::UserLeft { peer_id } => {
                if self.manager.handle_user_left(&peer_id).await {
                    tracing::info!(target = "buoy.signaling", peer_id = %peer_id, "peer left; session closed");
                }
            }
            InboundMessage::Signal { sender, signal } => self.route_signal(sender, signal).await,
        }
        Ok(())
    }

    async fn route_signal(&self, sender: String, signal: Signal) {
        match signal {
            Signal::Offer { sdp } => {
                tracing::info!(target = "buoy.signaling", peer_id = %sender, "incoming offer");
                self.manager.handle_offer(&sender, sdp).await;
            }
            Signal::IceCandidate { candidate } => {
                self.manager.handle_candidate(&sender, candidate).await;
            }
            Signal::Hangup {} => {
                if !self.manager.handle_hangup(&sender).await {
                    tracing::debug!(target = "buoy.signaling", peer_id = %sender, "hangup for unknown peer");
                }
            }
            other => {
                tracing::debug!(target = "buoy.signaling", peer_id = %sender, kind = other.kind(), "ignoring signal");
            }
        }
    }
}
