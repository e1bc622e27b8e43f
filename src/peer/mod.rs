//! Local media and the negotiated peer transport for the single live call.

pub mod connection;
pub mod ice;
pub mod manager;
pub mod media;
pub mod types;

pub use connection::{PeerEventSink, PeerLink, PeerLinkFactory, RtcPeerLinkFactory};
pub use ice::{analyze_candidates, probe_ice_server, CandidateSummary, PendingIceQueue};
pub use manager::{IceDisposition, PeerConnectionManager, TeardownReport};
pub use media::{LocalStream, LocalTrack, MediaKind, MediaSource, TrackMediaSource};
pub use types::{
    IceCandidate, IceServerKind, LinkState, PeerEvent, PeerEventKind, SdpKind, ServerConfig,
    SessionDescription,
};
