mod backoff;
mod client;
mod heartbeat;
mod protocol;
mod transport;

pub use backoff::Backoff;
pub use client::{derive_websocket_url, ChannelState, ClientEvent, ClientEventKind, SignalingClient};
pub use heartbeat::Heartbeat;
pub use protocol::{ChannelMessage, Identity, MessageKind, PingPayload, PongPayload};
pub use transport::{
    Connection, Connector, FrameSink, FrameStream, MemoryConnector, MemoryListener, MemoryServerEnd,
    WebSocketConnector,
};
