//! ICE server configuration and candidate filtering.
//!
//! Server strings follow the CLI format: `stun:host:port` for STUN, and
//! `username:credential@turn:host:port[?transport=tcp]` for TURN.

use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::MeshError;

/// Parse the CLI ICE server list into WebRTC server entries.
pub fn parse_ice_servers(specs: &[String]) -> Result<Vec<RTCIceServer>, MeshError> {
    specs.iter().map(|spec| parse_ice_server(spec)).collect()
}

fn parse_ice_server(spec: &str) -> Result<RTCIceServer, MeshError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(MeshError::InvalidIceServer("empty server entry".into()));
    }

    match spec.split_once('@') {
        Some((credentials, url)) => {
            let (username, credential) = credentials.split_once(':').ok_or_else(|| {
                MeshError::InvalidIceServer(format!(
                    "expected username:credential before '@' in {spec}"
                ))
            })?;
            if username.is_empty() || credential.is_empty() || url.is_empty() {
                return Err(MeshError::InvalidIceServer(spec.to_string()));
            }
            Ok(RTCIceServer {
                urls: vec![url.to_string()],
                username: username.to_string(),
                credential: credential.to_string(),
                ..Default::default()
            })
        }
        None => Ok(RTCIceServer {
            urls: vec![spec.to_string()],
            ..Default::default()
        }),
    }
}

/// Returns `true` if the candidate attribute describes a relayed (TURN)
/// candidate.
///
/// ICE candidate attribute format (RFC 8445 §5.1):
///   candidate:<foundation> <component> <transport> <priority> <address> <port> typ <type> ...
///
/// The candidate type follows the `typ` token. Malformed candidates are not
/// relay candidates.
pub fn is_relay_candidate(candidate: &str) -> bool {
    let mut tokens = candidate.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "typ" {
            return tokens.next() == Some("relay");
        }
    }
    false
}
