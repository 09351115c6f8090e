//! Process-level connection loop: connect, join, dispatch until the
//! connection drops, tear every call down, wait, repeat.

use crate::call::CallManager;
use crate::config::BuoyConfig;
use crate::credentials::CredentialClient;
use crate::dispatcher::SignalingDispatcher;
use crate::protocol::ClientMessage;
use crate::transport::{SignalingSocket, TransportError};

pub struct Buoy {
    config: BuoyConfig,
    manager: CallManager,
    credentials: CredentialClient,
}

impl Buoy {
    pub fn new(config: BuoyConfig, manager: CallManager) -> Self {
        let credentials = CredentialClient::new(
            &config.credentials_url,
            &config.credentials_user,
            config.insecure_tls,
        );
        Self {
            config,
            manager,
            credentials,
        }
    }

    /// Runs one connection until it fails. Relay credentials are refreshed
    /// before every connect.
    pub async fn run_once(&self) -> Result<(), TransportError> {
        let url = self
            .config
            .room_url()
            .map_err(|err| TransportError::Setup(err.to_string()))?;
        let ice_servers = self.credentials.fetch_ice_servers().await;

        tracing::info!(target = "buoy.runner", url = %url, "connecting to signaling");
        let mut socket = SignalingSocket::connect(&url, self.config.insecure_tls).await?;
        let outbound = socket.sender();
        self.manager.bind(outbound.clone(), ice_servers);
        outbound.send(ClientMessage::Join)?;
        tracing::info!(target = "buoy.runner", room = %self.config.room_id, "join sent");

        let mut dispatcher = SignalingDispatcher::new(self.manager.clone(), outbound);
        loop {
            let text = socket.next_text().await?;
            dispatcher.handle_text(&text).await?;
        }
    }

    /// Reconnects forever with a fixed delay. Every live call is torn down
    /// before the next connection attempt.
    pub async fn run_forever(&self) {
        loop {
            if let Err(err) = self.run_once().await {
                tracing::warn!(
                    target = "buoy.runner",
                    error = %err,
                    delay = ?self.config.reconnect_delay,
                    "signaling connection lost"
                );
            }
            let closed = self.manager.teardown_all().await;
            if closed > 0 {
                tracing::info!(target = "buoy.runner", closed, "calls closed after signaling loss");
            }
            tokio::time::sleep(self.config.reconnect_delay).await;
        }
    }
}
