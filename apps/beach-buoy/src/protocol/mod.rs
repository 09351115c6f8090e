pub mod signaling;

pub use signaling::{
    AnswerIdentity, ClientMessage, InboundMessage, ParseError, SdpType, SessionDescription,
    Signal, WireCandidate,
};
