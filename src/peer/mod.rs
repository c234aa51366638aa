mod connection;
mod data_channel;
mod ice;
mod link;
mod media;
mod state;
mod types;

pub use link::{PeerLink, PeerLinkBuilder};
pub use media::{LocalStream, LocalTrackRef, RemoteStream};
pub use state::{ConnectionTracker, LinkState};
pub use types::{CandidateInit, ParsedSignal, PeerEvent, PeerEventKind, Role, SignalMessage};
