use crate::error::PeerError;
use crate::events::Event;
use crate::peer::media::RemoteStream;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::track::track_remote::TrackRemote;

/// Кто создаёт offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Responder,
}

/// ICE кандидат в формате сигнализации
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CandidateInit {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for CandidateInit {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<CandidateInit> for RTCIceCandidateInit {
    fn from(c: CandidateInit) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

/// Сообщения, которые понимает `PeerLink::signal`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: CandidateInit },
}

/// Результат разбора сырого JSON-сигнала
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedSignal {
    Signal(SignalMessage),
    /// известный тип `candidate`, но тело не разобрать
    MalformedCandidate(String),
    Unsupported,
}

impl SignalMessage {
    pub fn parse_value(value: &Value) -> ParsedSignal {
        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            return ParsedSignal::Unsupported;
        };

        match kind {
            "offer" | "answer" => match serde_json::from_value::<SignalMessage>(value.clone()) {
                Ok(msg) => ParsedSignal::Signal(msg),
                Err(_) => ParsedSignal::Unsupported,
            },
            "candidate" => match serde_json::from_value::<SignalMessage>(value.clone()) {
                Ok(msg) => ParsedSignal::Signal(msg),
                Err(e) => ParsedSignal::MalformedCandidate(e.to_string()),
            },
            _ => ParsedSignal::Unsupported,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Candidate { .. } => "candidate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerEventKind {
    Signal,
    Connect,
    Data,
    Track,
    Stream,
    Error,
    Close,
}

/// События PeerLink
#[derive(Clone)]
pub enum PeerEvent {
    Signal(SignalMessage),
    Connect,
    Data(Bytes),
    Track {
        track: Arc<TrackRemote>,
        stream: RemoteStream,
    },
    Stream(RemoteStream),
    Error(PeerError),
    Close,
}

impl Event for PeerEvent {
    type Kind = PeerEventKind;

    fn kind(&self) -> PeerEventKind {
        match self {
            PeerEvent::Signal(_) => PeerEventKind::Signal,
            PeerEvent::Connect => PeerEventKind::Connect,
            PeerEvent::Data(_) => PeerEventKind::Data,
            PeerEvent::Track { .. } => PeerEventKind::Track,
            PeerEvent::Stream(_) => PeerEventKind::Stream,
            PeerEvent::Error(_) => PeerEventKind::Error,
            PeerEvent::Close => PeerEventKind::Close,
        }
    }
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::Signal(msg) => f.debug_tuple("Signal").field(msg).finish(),
            PeerEvent::Connect => f.write_str("Connect"),
            PeerEvent::Data(data) => f.debug_tuple("Data").field(&data.len()).finish(),
            PeerEvent::Track { track, .. } => f.debug_tuple("Track").field(&track.id()).finish(),
            PeerEvent::Stream(stream) => f.debug_tuple("Stream").field(&stream.id()).finish(),
            PeerEvent::Error(e) => f.debug_tuple("Error").field(e).finish(),
            PeerEvent::Close => f.write_str("Close"),
        }
    }
}
