use thiserror::Error;

/// Errors surfaced by the signaling client and peer adapter.
///
/// Only failures the caller can act on are returned; per-peer and per-message
/// failures terminate their own scope and are logged instead.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("invalid signaling url: {0}")]
    InvalidUrl(String),

    #[error("signaling connect failed: {0}")]
    Connect(String),

    #[error("signaling link closed")]
    SignalingClosed,

    #[error("invalid ice server: {0}")]
    InvalidIceServer(String),

    #[error("envelope key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("webrtc setup failed: {0}")]
    Setup(String),

    #[error("adapter already opened")]
    AlreadyOpen,

    #[error("adapter closed")]
    Closed,
}
