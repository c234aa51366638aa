pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::{ClientConfig, IceServerConfig, IceServerKind, LinkConfig, SignalingConfig};
pub use error::{ConfigError, PeerError, SignalingError};
pub use events::{Dispatch, Event, EventBus, HandlerResult, ListenerId};
pub use peer::{
    CandidateInit, LinkState, LocalStream, PeerEvent, PeerEventKind, PeerLink, RemoteStream, Role,
    SignalMessage,
};
pub use session::{LectureSession, SessionEvent, SessionEventKind};
pub use signaling::{
    ChannelMessage, ChannelState, ClientEvent, ClientEventKind, Identity, MessageKind,
    SignalingClient,
};
