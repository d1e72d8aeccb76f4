//! Authenticated encryption for signaling messages.
//!
//! The rendezvous reflects frames to every community member without inspecting
//! them, so only holders of the community's pre-shared key may forge or read
//! signaling. Each message is sealed with ChaCha20-Poly1305 under a key
//! stretched from the pre-shared key (Argon2id) and expanded with HKDF-SHA256.
//!
//! Decryption and parse failures are indistinguishable to the caller: both
//! yield `None`, and the frame is dropped without a response.

use argon2::{Algorithm, Argon2, Params, Version};
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::MeshError;
use crate::protocol::SignalingMessage;

pub const ENVELOPE_VERSION: u32 = 1;

const STRETCH_SALT: &[u8] = b"cove:signaling:psk:v1";
const HKDF_INFO_AEAD: &[u8] = b"cove:signaling:aead:v1";

/// A symmetric key derived once per adapter from the community secret.
#[derive(Clone)]
pub struct EnvelopeKey([u8; 32]);

/// The sealed wire form: what actually crosses the rendezvous.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedEnvelope {
    version: u32,
    nonce: String,
    ciphertext: String,
}

impl EnvelopeKey {
    /// Stretch the community pre-shared key into an AEAD key.
    ///
    /// The Argon2id cost is kept low enough that adapter startup stays fast;
    /// the key is derived once and reused for every envelope.
    pub fn derive(pre_shared_key: &str) -> Result<Self, MeshError> {
        let params = Params::new(32 * 1024, 1, 1, Some(32))
            .map_err(|err| MeshError::KeyDerivation(err.to_string()))?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut stretched = [0u8; 32];
        argon
            .hash_password_into(pre_shared_key.as_bytes(), STRETCH_SALT, &mut stretched)
            .map_err(|err| MeshError::KeyDerivation(err.to_string()))?;

        let hkdf = Hkdf::<Sha256>::new(Some(STRETCH_SALT), &stretched);
        let mut key = [0u8; 32];
        hkdf.expand(HKDF_INFO_AEAD, &mut key)
            .map_err(|err| MeshError::KeyDerivation(err.to_string()))?;
        Ok(EnvelopeKey(key))
    }

    /// Seal a signaling message into its wire form.
    pub fn seal(&self, message: &SignalingMessage) -> Result<Vec<u8>, MeshError> {
        let plaintext =
            serde_json::to_vec(message).map_err(|err| MeshError::Setup(err.to_string()))?;

        let mut nonce_bytes = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|err| MeshError::Setup(err.to_string()))?;
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|err| MeshError::Setup(err.to_string()))?;

        let envelope = SealedEnvelope {
            version: ENVELOPE_VERSION,
            nonce: BASE64_STANDARD.encode(nonce_bytes),
            ciphertext: BASE64_STANDARD.encode(ciphertext),
        };
        serde_json::to_vec(&envelope).map_err(|err| MeshError::Setup(err.to_string()))
    }

    /// Open a frame received from the rendezvous.
    ///
    /// Returns `None` for anything that is not a valid envelope sealed under
    /// this key: wrong version, bad encoding, tampered ciphertext, or a
    /// plaintext that is not a signaling message. No validity information
    /// leaks to the sender.
    pub fn open(&self, frame: &[u8]) -> Option<SignalingMessage> {
        let envelope: SealedEnvelope = serde_json::from_slice(frame).ok()?;
        if envelope.version != ENVELOPE_VERSION {
            return None;
        }
        let nonce_bytes = BASE64_STANDARD.decode(envelope.nonce.as_bytes()).ok()?;
        if nonce_bytes.len() != 12 {
            return None;
        }
        let ciphertext = BASE64_STANDARD.decode(envelope.ciphertext.as_bytes()).ok()?;
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0).ok()?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .ok()?;
        serde_json::from_slice(&plaintext).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ExchangePayload;

    fn sample() -> SignalingMessage {
        SignalingMessage::Exchange {
            from: "aaaa".to_string(),
            to: "bbbb".to_string(),
            channel: "x".to_string(),
            payload: ExchangePayload::Answer {
                sdp: "v=0\r\n".to_string(),
            },
        }
    }

    #[test]
    fn seal_open_roundtrip() {
        let key = EnvelopeKey::derive("community secret").unwrap();
        let sealed = key.seal(&sample()).unwrap();
        assert_eq!(key.open(&sealed), Some(sample()));
    }

    #[test]
    fn wrong_key_is_silent() {
        let key = EnvelopeKey::derive("community secret").unwrap();
        let other = EnvelopeKey::derive("different secret").unwrap();
        let sealed = key.seal(&sample()).unwrap();
        assert_eq!(other.open(&sealed), None);
    }

    #[test]
    fn tampered_ciphertext_is_silent() {
        let key = EnvelopeKey::derive("community secret").unwrap();
        let sealed = key.seal(&sample()).unwrap();
        let mut envelope: SealedEnvelope = serde_json::from_slice(&sealed).unwrap();
        let mut raw = BASE64_STANDARD.decode(envelope.ciphertext.as_bytes()).unwrap();
        raw[0] ^= 0xff;
        envelope.ciphertext = BASE64_STANDARD.encode(raw);
        let tampered = serde_json::to_vec(&envelope).unwrap();
        assert_eq!(key.open(&tampered), None);
    }

    #[test]
    fn garbage_is_silent() {
        let key = EnvelopeKey::derive("community secret").unwrap();
        assert_eq!(key.open(b"not an envelope"), None);
        assert_eq!(key.open(b"{}"), None);
        assert_eq!(key.open(b""), None);
    }

    #[test]
    fn unknown_version_is_silent() {
        let key = EnvelopeKey::derive("community secret").unwrap();
        let sealed = key.seal(&sample()).unwrap();
        let mut envelope: SealedEnvelope = serde_json::from_slice(&sealed).unwrap();
        envelope.version = 2;
        let reframed = serde_json::to_vec(&envelope).unwrap();
        assert_eq!(key.open(&reframed), None);
    }

    #[test]
    fn nonces_are_unique_per_seal() {
        let key = EnvelopeKey::derive("community secret").unwrap();
        let a: SealedEnvelope = serde_json::from_slice(&key.seal(&sample()).unwrap()).unwrap();
        let b: SealedEnvelope = serde_json::from_slice(&key.seal(&sample()).unwrap()).unwrap();
        assert_ne!(a.nonce, b.nonce);
    }
}
