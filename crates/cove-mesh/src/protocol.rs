//! Signaling message schema exchanged between peers through the rendezvous.
//!
//! The rendezvous is an untrusted reflector: it broadcasts every frame to all
//! other community members without looking inside. Addressing and trust live
//! entirely in these messages, which travel sealed (see [`crate::envelope`]).

use serde::{Deserialize, Serialize};

/// A peer-to-peer signaling message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Announce presence to the community. Broadcast by a peer when it joins
    /// (or reconnects to) the rendezvous, and by a responder greeting a
    /// newcomer it has no session with yet.
    Introduction { from: String },
    /// Directed negotiation traffic for one channel of one peer pair.
    /// Receivers ignore exchanges whose `to` is not their own identity.
    Exchange {
        from: String,
        to: String,
        channel: String,
        payload: ExchangePayload,
    },
}

/// The negotiation payload carried by an [`SignalingMessage::Exchange`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExchangePayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u16>,
    },
}

/// Deterministic role selection for a peer pair.
///
/// For any two distinct identities exactly one side is the initiator, and both
/// sides agree on which: the lexicographically smaller identity offers.
pub fn is_initiator(local: &str, remote: &str) -> bool {
    local < remote
}
