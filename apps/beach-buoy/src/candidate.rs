//! Conversion between wire connectivity descriptors and webrtc-rs candidates.

use thiserror::Error;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_protocol::RTCIceProtocol;

use crate::protocol::WireCandidate;

/// Media-line identifier used when the descriptor carries neither `sdpMid` nor `sdpMLineIndex`.
pub const DEFAULT_SDP_MID: &str = "0";
/// Media-line index used when the descriptor carries neither `sdpMid` nor `sdpMLineIndex`.
pub const DEFAULT_SDP_MLINE_INDEX: u16 = 0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CandidateError {
    #[error("descriptor has no candidate line")]
    MissingLine,
    #[error("end-of-candidates marker")]
    EndOfCandidates,
    #[error("descriptor has neither foundation nor address")]
    MissingIdentity,
    #[error("malformed candidate line: {0}")]
    Malformed(String),
    #[error("unsupported transport protocol {0:?}")]
    Protocol(String),
    #[error("unsupported candidate type {0:?}")]
    CandidateType(String),
}

/// A candidate ready to be handed to the negotiation engine.
#[derive(Debug, Clone, PartialEq)]
pub struct TranslatedCandidate {
    pub candidate: RTCIceCandidate,
    pub line: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
    pub username_fragment: Option<String>,
}

impl TranslatedCandidate {
    pub fn to_init(&self) -> RTCIceCandidateInit {
        RTCIceCandidateInit {
            candidate: self.line.clone(),
            sdp_mid: self.sdp_mid.clone(),
            sdp_mline_index: self.sdp_mline_index,
            username_fragment: self.username_fragment.clone(),
        }
    }
}

/// Translates a wire descriptor into the engine's candidate type.
///
/// Structured fields are used when all of them are present; otherwise the
/// raw line is parsed. The media-line placeholders are applied only when the
/// descriptor names no media line at all.
pub fn translate(wire: &WireCandidate) -> Result<TranslatedCandidate, CandidateError> {
    let raw = match wire.candidate.as_deref().map(str::trim) {
        Some("") => return Err(CandidateError::EndOfCandidates),
        Some(raw) => raw,
        None if wire.foundation.is_none() && wire.address.is_none() => {
            return Err(CandidateError::MissingIdentity);
        }
        None => return Err(CandidateError::MissingLine),
    };

    let candidate = match from_structured(wire)? {
        Some(candidate) => candidate,
        None => parse_line(raw)?,
    };

    let (sdp_mid, sdp_mline_index) = match (&wire.sdp_mid, wire.sdp_mline_index) {
        (None, None) => (
            Some(DEFAULT_SDP_MID.to_string()),
            Some(DEFAULT_SDP_MLINE_INDEX),
        ),
        (mid, index) => (mid.clone(), index),
    };

    Ok(TranslatedCandidate {
        line: to_candidate_line(&candidate),
        candidate,
        sdp_mid,
        sdp_mline_index,
        username_fragment: wire.username_fragment.clone(),
    })
}

fn from_structured(wire: &WireCandidate) -> Result<Option<RTCIceCandidate>, CandidateError> {
    let (
        Some(foundation),
        Some(component),
        Some(address),
        Some(port),
        Some(priority),
        Some(protocol),
        Some(typ),
    ) = (
        wire.foundation.as_deref(),
        wire.component.as_ref().and_then(|c| c.id()),
        wire.address.as_deref(),
        wire.port,
        wire.priority,
        wire.protocol.as_deref(),
        wire.typ.as_deref(),
    )
    else {
        return Ok(None);
    };

    Ok(Some(RTCIceCandidate {
        foundation: foundation.to_string(),
        component,
        address: address.to_string(),
        port,
        priority,
        protocol: parse_protocol(protocol)?,
        typ: parse_type(typ)?,
        related_address: wire.related_address.clone().unwrap_or_default(),
        related_port: wire.related_port.unwrap_or_default(),
        tcp_type: wire.tcp_type.clone().unwrap_or_default(),
        ..Default::default()
    }))
}

/// Parses `[a=]candidate:<foundation> <component> <proto> <priority> <addr> <port> typ <type> ...`.
pub fn parse_line(line: &str) -> Result<RTCIceCandidate, CandidateError> {
    let body = line.trim();
    let body = body.strip_prefix("a=").unwrap_or(body);
    let body = body.strip_prefix("candidate:").unwrap_or(body);
    let tokens: Vec<&str> = body.split_whitespace().collect();
    if tokens.len() < 8 {
        return Err(CandidateError::Malformed(format!(
            "expected at least 8 fields, found {}",
            tokens.len()
        )));
    }
    if !tokens[6].eq_ignore_ascii_case("typ") {
        return Err(CandidateError::Malformed(format!(
            "expected `typ`, found {:?}",
            tokens[6]
        )));
    }

    let component = tokens[1]
        .parse::<u16>()
        .map_err(|_| CandidateError::Malformed(format!("bad component {:?}", tokens[1])))?;
    let priority = tokens[3]
        .parse::<u32>()
        .map_err(|_| CandidateError::Malformed(format!("bad priority {:?}", tokens[3])))?;
    let port = tokens[5]
        .parse::<u16>()
        .map_err(|_| CandidateError::Malformed(format!("bad port {:?}", tokens[5])))?;

    let mut candidate = RTCIceCandidate {
        foundation: tokens[0].to_string(),
        component,
        protocol: parse_protocol(tokens[2])?,
        priority,
        address: tokens[4].to_string(),
        port,
        typ: parse_type(tokens[7])?,
        ..Default::default()
    };

    let mut rest = tokens[8..].iter();
    while let (Some(key), Some(value)) = (rest.next(), rest.next()) {
        match *key {
            "raddr" => candidate.related_address = value.to_string(),
            "rport" => {
                candidate.related_port = value
                    .parse()
                    .map_err(|_| CandidateError::Malformed(format!("bad rport {value:?}")))?;
            }
            "tcptype" => candidate.tcp_type = value.to_string(),
            // generation, ufrag, network-id, network-cost
            _ => {}
        }
    }

    Ok(candidate)
}

fn parse_protocol(value: &str) -> Result<RTCIceProtocol, CandidateError> {
    match RTCIceProtocol::from(value.to_ascii_lowercase().as_str()) {
        RTCIceProtocol::Unspecified => Err(CandidateError::Protocol(value.to_string())),
        protocol => Ok(protocol),
    }
}

fn parse_type(value: &str) -> Result<RTCIceCandidateType, CandidateError> {
    match RTCIceCandidateType::from(value.to_ascii_lowercase().as_str()) {
        RTCIceCandidateType::Unspecified => Err(CandidateError::CandidateType(value.to_string())),
        typ => Ok(typ),
    }
}

/// Renders a candidate as an SDP attribute value (`candidate:...`).
pub fn to_candidate_line(candidate: &RTCIceCandidate) -> String {
    let mut line = format!(
        "candidate:{} {} {} {} {} {} typ {}",
        candidate.foundation,
        candidate.component,
        candidate.protocol,
        candidate.priority,
        candidate.address,
        candidate.port,
        candidate.typ,
    );
    if !candidate.related_address.is_empty() {
        line.push_str(&format!(
            " raddr {} rport {}",
            candidate.related_address, candidate.related_port
        ));
    }
    if !candidate.tcp_type.is_empty() {
        line.push_str(&format!(" tcptype {}", candidate.tcp_type));
    }
    line
}

/// Wire form of a locally discovered candidate, addressed to the given media line.
pub fn to_wire(candidate: &RTCIceCandidate, sdp_mid: Option<String>, sdp_mline_index: u16) -> WireCandidate {
    WireCandidate {
        candidate: Some(to_candidate_line(candidate)),
        sdp_mid: sdp_mid.or_else(|| Some(DEFAULT_SDP_MID.to_string())),
        sdp_mline_index: Some(sdp_mline_index),
        ..Default::default()
    }
}
