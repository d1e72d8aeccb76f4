//! Peer-to-peer overlay engine for cove communities.
//!
//! A community is a named set of peers sharing a secret. Peers meet through a
//! signaling rendezvous (`cove-buoy`), negotiate direct WebRTC transports, and
//! end up with a mesh of named, reliable, ordered duplex byte streams.
//!
//! The entry point is [`PeerAdapter`]: construct it with the rendezvous
//! endpoint, the community's pre-shared envelope key, and the set of channel
//! names to open per peer, then consume [`PeerAdapter::accept`].

pub mod adapter;
pub mod envelope;
pub mod ice;
pub mod protocol;
pub mod signaling;
pub mod stream;

mod error;

pub use adapter::{AcceptedChannel, AdapterConfig, PeerAdapter};
pub use error::MeshError;
pub use signaling::SignalingConfig;
pub use stream::ChannelStream;
