//! JSON-протокол канала сигнализации

use crate::peer::{CandidateInit, SignalMessage};
use serde::{Deserialize, Serialize};

/// Кто мы для relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub participant_id: String,
    pub session_id: String,
}

impl Identity {
    pub fn new(participant_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            session_id: session_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingPayload {
    pub timestamp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time: Option<i64>,
}

/// Сообщения между клиентом и relay. `from`/`to` опускаются, если не заданы.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ChannelMessage {
    JoinLecture {
        participant_id: String,
        session_id: String,
    },
    Offer {
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
    Answer {
        sdp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
    Candidate {
        candidate: CandidateInit,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
    Ping {
        payload: PingPayload,
    },
    Pong {
        payload: PongPayload,
    },
    PeersInLecture {
        peers: Vec<String>,
    },
    PeerJoined {
        participant_id: String,
    },
    PeerLeft {
        participant_id: String,
    },
    Error {
        message: String,
    },
}

/// Вид сообщения, ключ подписки
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    JoinLecture,
    Offer,
    Answer,
    Candidate,
    Ping,
    Pong,
    PeersInLecture,
    PeerJoined,
    PeerLeft,
    Error,
}

impl ChannelMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            ChannelMessage::JoinLecture { .. } => MessageKind::JoinLecture,
            ChannelMessage::Offer { .. } => MessageKind::Offer,
            ChannelMessage::Answer { .. } => MessageKind::Answer,
            ChannelMessage::Candidate { .. } => MessageKind::Candidate,
            ChannelMessage::Ping { .. } => MessageKind::Ping,
            ChannelMessage::Pong { .. } => MessageKind::Pong,
            ChannelMessage::PeersInLecture { .. } => MessageKind::PeersInLecture,
            ChannelMessage::PeerJoined { .. } => MessageKind::PeerJoined,
            ChannelMessage::PeerLeft { .. } => MessageKind::PeerLeft,
            ChannelMessage::Error { .. } => MessageKind::Error,
        }
    }

    pub fn join(identity: &Identity) -> Self {
        ChannelMessage::JoinLecture {
            participant_id: identity.participant_id.clone(),
            session_id: identity.session_id.clone(),
        }
    }

    pub fn ping(timestamp: i64) -> Self {
        ChannelMessage::Ping {
            payload: PingPayload { timestamp },
        }
    }

    /// Сигнал PeerLink, адресованный участнику `to`
    pub fn routed(signal: SignalMessage, from: &str, to: &str) -> Self {
        let from = Some(from.to_owned());
        let to = Some(to.to_owned());
        match signal {
            SignalMessage::Offer { sdp } => ChannelMessage::Offer { sdp, from, to },
            SignalMessage::Answer { sdp } => ChannelMessage::Answer { sdp, from, to },
            SignalMessage::Candidate { candidate } => ChannelMessage::Candidate { candidate, from, to },
        }
    }

    /// Отправитель и сигнал для PeerLink, если это offer/answer/candidate
    pub fn into_signal(self) -> Option<(Option<String>, SignalMessage)> {
        match self {
            ChannelMessage::Offer { sdp, from, .. } => Some((from, SignalMessage::Offer { sdp })),
            ChannelMessage::Answer { sdp, from, .. } => Some((from, SignalMessage::Answer { sdp })),
            ChannelMessage::Candidate { candidate, from, .. } => {
                Some((from, SignalMessage::Candidate { candidate }))
            }
            _ => None,
        }
    }
}
