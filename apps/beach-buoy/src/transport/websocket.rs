use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};
use url::Url;

use super::{SignalSender, TransportError};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One live connection to the room endpoint.
///
/// Outbound messages go through [`SignalSender`] clones into a writer task;
/// inbound text is pulled with [`SignalingSocket::next_text`]. Websocket ping
/// frames are answered by tungstenite while reading.
pub struct SignalingSocket {
    reader: SplitStream<WsStream>,
    outbound: SignalSender,
    writer: JoinHandle<()>,
}

impl SignalingSocket {
    pub async fn connect(url: &Url, insecure_tls: bool) -> Result<Self, TransportError> {
        let connector = if insecure_tls {
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|err| TransportError::Setup(format!("tls connector: {err}")))?;
            Some(Connector::NativeTls(tls))
        } else {
            None
        };

        let (ws_stream, _) = connect_async_tls_with_config(url.as_str(), None, false, connector)
            .await
            .map_err(|err| TransportError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "buoy.transport", url = %url, "signaling websocket connected");

        let (mut ws_write, reader) = ws_stream.split();
        let (outbound, mut send_rx) = SignalSender::channel();

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target = "buoy.transport", error = %err, "dropping unencodable message");
                        continue;
                    }
                };
                tracing::trace!(target = "buoy.transport", event = "ws_out", len = text.len());
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        Ok(Self {
            reader,
            outbound,
            writer,
        })
    }

    pub fn sender(&self) -> SignalSender {
        self.outbound.clone()
    }

    /// Waits for the next text payload. Any end of the stream is an error.
    pub async fn next_text(&mut self) -> Result<String, TransportError> {
        while let Some(frame) = self.reader.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    tracing::trace!(target = "buoy.transport", event = "ws_in", kind = "text", len = text.len());
                    return Ok(text);
                }
                Ok(Message::Binary(data)) => match String::from_utf8(data) {
                    Ok(text) => return Ok(text),
                    Err(_) => {
                        tracing::debug!(target = "buoy.transport", "ignoring non-utf8 binary frame");
                    }
                },
                Ok(Message::Ping(_)) => {
                    tracing::trace!(target = "buoy.transport", event = "ws_in", kind = "ping");
                }
                Ok(Message::Close(frame)) => {
                    tracing::debug!(target = "buoy.transport", ?frame, "signaling websocket closed by peer");
                    return Err(TransportError::Closed);
                }
                Ok(_) => {}
                Err(err) => {
                    return match &err {
                        WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                            tracing::debug!(target = "buoy.transport", "signaling websocket closed: {err}");
                            Err(TransportError::Closed)
                        }
                        _ => {
                            tracing::warn!(target = "buoy.transport", "signaling websocket error: {err}");
                            Err(TransportError::Connection(err.to_string()))
                        }
                    };
                }
            }
        }
        Err(TransportError::Closed)
    }
}

impl Drop for SignalingSocket {
    fn drop(&mut self) {
        self.writer.abort();
    }
}
