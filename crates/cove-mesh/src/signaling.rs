//! Websocket client for the signaling rendezvous.
//!
//! The rendezvous address is `ws(s)://host:port`; the community id becomes the
//! final path segment and the password travels as a query parameter. Frames
//! are opaque to this layer — sealing and interpretation happen in the
//! adapter.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use crate::error::MeshError;

/// Where and how to join the rendezvous.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Rendezvous base address, e.g. `wss://buoy.example.org:1337`.
    pub url: String,
    pub community: String,
    pub password: String,
}

/// One live connection to the rendezvous.
///
/// Incoming frames surface through [`SignalingClient::recv`] until the first
/// I/O error or server close, after which `recv` yields `None`. Sends are
/// queued and flushed by a background task. Cancelling the token passed to
/// [`SignalingClient::connect`] unblocks both directions promptly.
pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Build the websocket endpoint for a community join.
pub fn derive_endpoint(
    base: &str,
    community: &str,
    password: &str,
) -> Result<Url, MeshError> {
    let mut url = Url::parse(base).map_err(|err| MeshError::InvalidUrl(err.to_string()))?;
    match url.scheme() {
        "ws" | "wss" => {}
        "http" => url
            .set_scheme("ws")
            .map_err(|_| MeshError::InvalidUrl(base.to_string()))?,
        "https" => url
            .set_scheme("wss")
            .map_err(|_| MeshError::InvalidUrl(base.to_string()))?,
        other => {
            return Err(MeshError::InvalidUrl(format!(
                "unsupported scheme {other} in {base}"
            )))
        }
    }
    url.path_segments_mut()
        .map_err(|_| MeshError::InvalidUrl(base.to_string()))?
        .pop_if_empty()
        .push(community);
    url.set_query(None);
    url.query_pairs_mut().append_pair("password", password);
    Ok(url)
}

impl SignalingClient {
    /// Connect and spawn the reader/writer tasks.
    ///
    /// Pings from the server are answered by the websocket library's default
    /// pong handling; nothing here needs to see them.
    pub async fn connect(
        config: &SignalingConfig,
        cancel: CancellationToken,
    ) -> Result<Self, MeshError> {
        let endpoint = derive_endpoint(&config.url, &config.community, &config.password)?;
        let (ws_stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|err| MeshError::Connect(err.to_string()))?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (inbound_tx, inbound) = mpsc::unbounded_channel::<Vec<u8>>();

        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    maybe = outbound_rx.recv() => {
                        let Some(frame) = maybe else { break };
                        if let Err(err) = ws_write.send(Message::Binary(frame)).await {
                            warn!(error = %err, "signaling write failed");
                            writer_cancel.cancel();
                            break;
                        }
                    }
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_cancel = cancel;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    maybe = ws_read.next() => {
                        match maybe {
                            Some(Ok(Message::Binary(frame))) => {
                                if inbound_tx.send(frame).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Text(text))) => {
                                if inbound_tx.send(text.into_bytes()).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                debug!("signaling link closed by server");
                                break;
                            }
                            Some(Ok(_)) => {}
                            Some(Err(err)) => {
                                warn!(error = %err, "signaling read failed");
                                break;
                            }
                        }
                    }
                }
            }
            // Dropping inbound_tx turns recv() into the terminal None.
            reader_cancel.cancel();
        });

        Ok(SignalingClient { outbound, inbound })
    }

    /// A cloneable handle for queueing frames from other tasks.
    pub fn sender(&self) -> mpsc::UnboundedSender<Vec<u8>> {
        self.outbound.clone()
    }

    /// Queue one frame for the rendezvous.
    pub fn send(&self, frame: Vec<u8>) -> Result<(), MeshError> {
        self.outbound
            .send(frame)
            .map_err(|_| MeshError::SignalingClosed)
    }

    /// Next frame from the rendezvous, or `None` once the link is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.inbound.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_appends_community_and_password() {
        let url = derive_endpoint("ws://127.0.0.1:1337", "net", "pw").unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:1337/net?password=pw");
    }

    #[test]
    fn endpoint_maps_http_schemes() {
        let url = derive_endpoint("https://buoy.example.org", "net", "pw").unwrap();
        assert_eq!(url.scheme(), "wss");
        let url = derive_endpoint("http://buoy.example.org", "net", "pw").unwrap();
        assert_eq!(url.scheme(), "ws");
    }

    #[test]
    fn endpoint_keeps_existing_path_prefix() {
        let url = derive_endpoint("wss://example.org/signal/", "net", "pw").unwrap();
        assert_eq!(url.path(), "/signal/net");
    }

    #[test]
    fn endpoint_rejects_other_schemes() {
        assert!(derive_endpoint("ftp://example.org", "net", "pw").is_err());
        assert!(derive_endpoint("not a url", "net", "pw").is_err());
    }

    #[test]
    fn password_is_percent_encoded() {
        let url = derive_endpoint("ws://127.0.0.1:1337", "net", "p w&x").unwrap();
        assert_eq!(url.query(), Some("password=p+w%26x"));
    }
}
