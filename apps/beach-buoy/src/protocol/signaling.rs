//! JSON envelopes exchanged with the room signaling endpoint.
//!
//! Inbound traffic is parsed leniently: the envelope is first read as a loose
//! [`Envelope`] and then classified into an [`InboundMessage`], so a missing
//! field drops one message instead of tearing down the connection. Outbound
//! traffic is strongly typed through [`ClientMessage`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Loose wire shape of every envelope the endpoint sends.
#[derive(Debug, Clone, Default, Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    sender: Option<String>,
    #[serde(rename = "senderId", default)]
    sender_id: Option<String>,
    #[serde(default)]
    payload: Value,
}

impl Envelope {
    /// Peer named by a presence envelope: `payload.userId`, then `senderId`, then `sender`.
    fn presence_peer(&self) -> Option<String> {
        self.payload
            .get("userId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| self.sender_id.clone())
            .or_else(|| self.sender.clone())
            .filter(|id| !id.is_empty())
    }

    fn signal_sender(&self) -> Option<String> {
        self.sender
            .clone()
            .or_else(|| self.sender_id.clone())
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("envelope missing type")]
    MissingType,
    #[error("{kind} envelope missing {field}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
    #[error("unknown envelope type {0:?}")]
    UnknownType(String),
    #[error("malformed signal payload: {0}")]
    Signal(serde_json::Error),
}

/// A classified inbound envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Ping,
    Pong,
    Join,
    Connected { user_id: String },
    UserJoined { peer_id: String },
    UserLeft { peer_id: String },
    Signal { sender: String, signal: Signal },
}

impl InboundMessage {
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let envelope: Envelope = serde_json::from_str(text)?;
        let kind = envelope.kind.clone().ok_or(ParseError::MissingType)?;
        match kind.as_str() {
            "ping" => Ok(InboundMessage::Ping),
            "pong" => Ok(InboundMessage::Pong),
            "join" => Ok(InboundMessage::Join),
            "connected" => {
                let user_id = envelope
                    .payload
                    .get("userId")
                    .and_then(Value::as_str)
                    .filter(|id| !id.is_empty())
                    .ok_or(ParseError::MissingField {
                        kind: "connected",
                        field: "payload.userId",
                    })?;
                Ok(InboundMessage::Connected {
                    user_id: user_id.to_string(),
                })
            }
            "user-joined" => envelope
                .presence_peer()
                .map(|peer_id| InboundMessage::UserJoined { peer_id })
                .ok_or(ParseError::MissingField {
                    kind: "user-joined",
                    field: "userId",
                }),
            "user-left" => envelope
                .presence_peer()
                .map(|peer_id| InboundMessage::UserLeft { peer_id })
                .ok_or(ParseError::MissingField {
                    kind: "user-left",
                    field: "userId",
                }),
            "signal" => {
                let sender = envelope.signal_sender().ok_or(ParseError::MissingField {
                    kind: "signal",
                    field: "sender",
                })?;
                let signal = serde_json::from_value::<Signal>(envelope.payload)
                    .map_err(ParseError::Signal)?;
                Ok(InboundMessage::Signal { sender, signal })
            }
            _ => Err(ParseError::UnknownType(kind)),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Ping => "ping",
            InboundMessage::Pong => "pong",
            InboundMessage::Join => "join",
            InboundMessage::Connected { .. } => "connected",
            InboundMessage::UserJoined { .. } => "user-joined",
            InboundMessage::UserLeft { .. } => "user-left",
            InboundMessage::Signal { .. } => "signal",
        }
    }
}

/// Messages this peer emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    Join,
    Pong,
    Signal { target: String, payload: Signal },
}

impl ClientMessage {
    pub fn signal(target: impl Into<String>, payload: Signal) -> Self {
        ClientMessage::Signal {
            target: target.into(),
            payload,
        }
    }
}

/// Peer-to-peer payload carried inside a `signal` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Signal {
    Offer {
        sdp: SessionDescription,
    },
    Answer {
        sdp: SessionDescription,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        identity: Option<AnswerIdentity>,
    },
    IceCandidate {
        #[serde(default)]
        candidate: Option<WireCandidate>,
    },
    Hangup {},
    MyUuid {
        uuid: String,
    },
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::IceCandidate { .. } => "ice-candidate",
            Signal::Hangup {} => "hangup",
            Signal::MyUuid { .. } => "my-uuid",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// First `a=mid:` value in the description, if any.
    pub fn first_mid(&self) -> Option<String> {
        self.sdp
            .lines()
            .find_map(|line| line.trim().strip_prefix("a=mid:"))
            .map(|mid| mid.trim().to_string())
            .filter(|mid| !mid.is_empty())
    }
}

/// Presentation details attached to every answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerIdentity {
    pub username: String,
    #[serde(default)]
    pub picture: String,
}

impl AnswerIdentity {
    pub fn named(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            picture: String::new(),
        }
    }
}

/// Component as sent by browsers (`"rtp"`/`"rtcp"`) or by native stacks (`1`/`2`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ComponentField {
    Id(u16),
    Name(String),
}

impl ComponentField {
    pub fn id(&self) -> Option<u16> {
        match self {
            ComponentField::Id(id) => Some(*id),
            ComponentField::Name(name) => match name.to_ascii_lowercase().as_str() {
                "rtp" => Some(1),
                "rtcp" => Some(2),
                other => other.parse().ok(),
            },
        }
    }
}

/// Wire form of a connectivity candidate. Only `candidate` is mandatory; the
/// structured fields are present when the remote serialized a full candidate
/// object rather than `RTCIceCandidate.toJSON()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCandidate {
    #[serde(default)]
    pub candidate: Option<String>,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foundation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<ComponentField>,
    #[serde(default, alias = "ip", skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

impl WireCandidate {
    pub fn from_line(candidate: impl Into<String>) -> Self {
        Self {
            candidate: Some(candidate.into()),
            ..Default::default()
        }
    }
}
