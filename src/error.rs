//! Ошибки peer-соединений, канала сигнализации и конфигурации

use thiserror::Error;

/// Ошибки PeerLink. `Clone`, потому что ошибка уходит подписчикам в событии `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    #[error("unexpected offer")]
    UnexpectedOffer,

    #[error("unexpected answer")]
    UnexpectedAnswer,

    #[error("unsupported signal type")]
    UnsupportedSignal,

    #[error("cannot send when not connected")]
    NotConnected,

    #[error("no sender for track")]
    NoSenderForTrack,

    #[error("track {0} has already been added to that stream")]
    TrackAlreadyAdded(String),

    #[error("ice connection failed")]
    IceConnectionFailed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("negotiation failed: {0}")]
    Negotiation(String),

    #[error("failed to add ice candidate: {0}")]
    Candidate(String),

    #[error("data channel error: {0}")]
    DataChannel(String),

    #[error("media track error: {0}")]
    Media(String),
}

impl PeerError {
    /// Нарушение протокола сигнализации (в отличие от сбоя транспорта)
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            PeerError::UnexpectedOffer | PeerError::UnexpectedAnswer | PeerError::UnsupportedSignal
        )
    }
}

/// Ошибки SignalingClient
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("signaling channel is closed")]
    ChannelClosed,

    #[error("invalid signaling url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SignalingError {
    fn from(e: serde_json::Error) -> Self {
        SignalingError::Serialization(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_violations_are_classified() {
        assert!(PeerError::UnexpectedOffer.is_protocol_violation());
        assert!(PeerError::UnsupportedSignal.is_protocol_violation());
        assert!(!PeerError::IceConnectionFailed.is_protocol_violation());
        assert!(!PeerError::NotConnected.is_protocol_violation());
    }

    #[test]
    fn messages_match_wire_contract() {
        assert_eq!(
            PeerError::NotConnected.to_string(),
            "cannot send when not connected"
        );
        assert_eq!(PeerError::NoSenderForTrack.to_string(), "no sender for track");
    }
}
