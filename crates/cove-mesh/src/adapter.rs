//! The peer adapter: one engine per community membership.
//!
//! The adapter keeps a signaling connection alive (reconnecting with bounded
//! backoff), announces itself, and drives WebRTC offer/answer/ICE negotiation
//! against every other peer for every registered channel name. Each peer pair
//! converges on a single transport per channel: the peer with the
//! lexicographically smaller identity is the initiator, the other answers.
//!
//! Successful negotiations surface through [`PeerAdapter::accept`] as
//! [`AcceptedChannel`]s carrying a duplex byte stream.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::ice_transport_policy::RTCIceTransportPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::envelope::EnvelopeKey;
use crate::error::MeshError;
use crate::ice::{is_relay_candidate, parse_ice_servers};
use crate::protocol::{is_initiator, ExchangePayload, SignalingMessage};
use crate::signaling::{SignalingClient, SignalingConfig};
use crate::stream::{self, ChannelStream, StreamEnds};

const INITIAL_BACKOFF: Duration = Duration::from_millis(250);

/// Adapter tuning. `channels` is the fixed set of channel names negotiated
/// with every peer in the community.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Local peer identity. Generated (UUIDv4) when empty.
    pub id: Option<String>,
    pub channels: Vec<String>,
    /// ICE servers in CLI form: `stun:host:port` or
    /// `username:credential@turn:host:port`.
    pub ice_servers: Vec<String>,
    /// Negotiation deadline and transport-failure detection bound.
    pub timeout: Duration,
    /// Restrict ICE to relayed (TURN) candidates only.
    pub force_relay: bool,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            id: None,
            channels: Vec::new(),
            ice_servers: Vec::new(),
            timeout: Duration::from_secs(10),
            force_relay: false,
        }
    }
}

/// A negotiated channel to one remote peer.
#[derive(Debug)]
pub struct AcceptedChannel {
    pub peer_id: String,
    pub channel: String,
    pub stream: ChannelStream,
}

type RecordKey = (String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordState {
    WaitAnswer,
    Answering,
    Connected,
}

struct PeerRecord {
    /// Distinguishes this record from earlier ones for the same key, so stale
    /// transport callbacks cannot tear down a replacement.
    epoch: u64,
    role: Role,
    state: RecordState,
    pc: Arc<RTCPeerConnection>,
    remote_set: bool,
    /// Candidates received before the remote description was applied.
    pending_candidates: Vec<RTCIceCandidateInit>,
}

struct Inner {
    local_id: String,
    channels: Vec<String>,
    timeout: Duration,
    force_relay: bool,
    ice_servers: Vec<RTCIceServer>,
    signaling: SignalingConfig,
    key: EnvelopeKey,
    cancel: CancellationToken,
    records: Mutex<HashMap<RecordKey, PeerRecord>>,
    /// Sender for the current signaling connection; cleared between connects.
    signal_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    accept_tx: mpsc::UnboundedSender<AcceptedChannel>,
    epochs: AtomicU64,
}

/// Peer-side engine for one community membership.
pub struct PeerAdapter {
    inner: Arc<Inner>,
    accept_rx: Option<mpsc::UnboundedReceiver<AcceptedChannel>>,
    main: Option<JoinHandle<()>>,
}

impl PeerAdapter {
    pub fn new(
        signaling: SignalingConfig,
        pre_shared_key: &str,
        config: AdapterConfig,
    ) -> Result<Self, MeshError> {
        let key = EnvelopeKey::derive(pre_shared_key)?;
        let ice_servers = parse_ice_servers(&config.ice_servers)?;
        let local_id = config
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            local_id,
            channels: config.channels,
            timeout: config.timeout,
            force_relay: config.force_relay,
            ice_servers,
            signaling,
            key,
            cancel: CancellationToken::new(),
            records: Mutex::new(HashMap::new()),
            signal_tx: Mutex::new(None),
            accept_tx,
            epochs: AtomicU64::new(0),
        });

        Ok(Self {
            inner,
            accept_rx: Some(accept_rx),
            main: None,
        })
    }

    /// The identity announced to remote peers.
    pub fn local_id(&self) -> &str {
        &self.inner.local_id
    }

    /// Start the adapter. The returned stream yields the local identity once
    /// per successful signaling connection (so, again after each reconnect).
    pub fn open(&mut self) -> Result<mpsc::UnboundedReceiver<String>, MeshError> {
        if self.main.is_some() {
            return Err(MeshError::AlreadyOpen);
        }
        if self.inner.cancel.is_cancelled() {
            return Err(MeshError::Closed);
        }
        let (ids_tx, ids_rx) = mpsc::unbounded_channel();
        let inner = Arc::clone(&self.inner);
        self.main = Some(tokio::spawn(run(inner, ids_tx)));
        Ok(ids_rx)
    }

    /// Stream of negotiated channels. Yields each (peer, channel) pair at most
    /// once per live transport; a re-negotiated pair EOFs its old stream
    /// before the replacement appears here. Can be taken once.
    pub fn accept(&mut self) -> Option<mpsc::UnboundedReceiver<AcceptedChannel>> {
        self.accept_rx.take()
    }

    /// Run until the adapter is closed.
    pub async fn wait(&mut self) -> Result<(), MeshError> {
        let handle = self.main.take().ok_or(MeshError::Closed)?;
        handle
            .await
            .map_err(|err| MeshError::Setup(format!("adapter task failed: {err}")))
    }

    /// Cancel all tasks, close all transports, release the signaling link.
    pub async fn close(&mut self) {
        self.inner.cancel.cancel();
        if let Some(handle) = self.main.take() {
            let _ = handle.await;
        }
        self.inner.signal_tx.lock().unwrap().take();
        self.inner.teardown_all();
    }
}

/// Signaling lifecycle: connect, announce, dispatch, reconnect with backoff.
async fn run(inner: Arc<Inner>, ids_tx: mpsc::UnboundedSender<String>) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if inner.cancel.is_cancelled() {
            return;
        }
        let conn_cancel = inner.cancel.child_token();
        match SignalingClient::connect(&inner.signaling, conn_cancel.clone()).await {
            Ok(mut client) => {
                backoff = INITIAL_BACKOFF;
                *inner.signal_tx.lock().unwrap() = Some(client.sender());
                info!(id = %inner.local_id, "connected to signaler");
                let _ = ids_tx.send(inner.local_id.clone());
                inner.send_message(&SignalingMessage::Introduction {
                    from: inner.local_id.clone(),
                });

                loop {
                    tokio::select! {
                        _ = inner.cancel.cancelled() => {
                            conn_cancel.cancel();
                            inner.signal_tx.lock().unwrap().take();
                            inner.teardown_all();
                            return;
                        }
                        frame = client.recv() => {
                            match frame {
                                Some(frame) => handle_frame(&inner, frame).await,
                                None => break,
                            }
                        }
                    }
                }

                warn!("signaling link lost");
                conn_cancel.cancel();
                inner.signal_tx.lock().unwrap().take();
                inner.teardown_all();
            }
            Err(err) => {
                warn!(error = %err, "signaling connect failed");
            }
        }

        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(inner.timeout);
    }
}

async fn handle_frame(inner: &Arc<Inner>, frame: Vec<u8>) {
    // Anything that does not open under the community key is not ours.
    let Some(message) = inner.key.open(&frame) else {
        return;
    };
    match message {
        SignalingMessage::Introduction { from } => handle_introduction(inner, from).await,
        SignalingMessage::Exchange {
            from,
            to,
            channel,
            payload,
        } => handle_exchange(inner, from, to, channel, payload).await,
    }
}

async fn handle_introduction(inner: &Arc<Inner>, from: String) {
    if from == inner.local_id {
        return;
    }
    if is_initiator(&inner.local_id, &from) {
        debug!(peer = %from, "introduction received, initiating");
        for channel in inner.channels.clone() {
            let key = (from.clone(), channel.clone());
            let existing = {
                let records = inner.records.lock().unwrap();
                records.get(&key).map(|r| r.state)
            };
            match existing {
                // Negotiation already in flight: the watchdog owns its fate,
                // and a second offer would only cross the first.
                Some(state) if state != RecordState::Connected => continue,
                // A connected peer announcing again has restarted; its old
                // session is stale by definition.
                Some(_) => inner.close_record(&key, None),
                None => {}
            }
            if let Err(err) = start_offer(inner, &from, &channel).await {
                warn!(peer = %from, channel = %channel, error = %err, "offer failed");
            }
        }
    } else {
        // The responder announces itself so a newcomer with the smaller
        // identity learns who to offer to. While a negotiation is in flight
        // the newcomer already knows us, and greeting would trigger a
        // needless renegotiation on its side.
        let should_greet = {
            let records = inner.records.lock().unwrap();
            records
                .iter()
                .filter(|(key, _)| key.0 == from)
                .all(|(_, record)| record.state == RecordState::Connected)
        };
        if should_greet {
            debug!(peer = %from, "introduction received, awaiting offer");
            inner.send_message(&SignalingMessage::Introduction {
                from: inner.local_id.clone(),
            });
        } else {
            debug!(peer = %from, "introduction received, negotiation already in flight");
        }
    }
}

async fn handle_exchange(
    inner: &Arc<Inner>,
    from: String,
    to: String,
    channel: String,
    payload: ExchangePayload,
) {
    if to != inner.local_id || from == inner.local_id {
        return;
    }
    if !inner.channels.iter().any(|c| c == &channel) {
        return;
    }
    match payload {
        ExchangePayload::Offer { sdp } => {
            // Only the smaller identity may offer; an offer violating the
            // role rule is dropped and our own offer stands.
            if !is_initiator(&from, &inner.local_id) {
                debug!(peer = %from, channel = %channel, "dropping offer from non-initiator");
                return;
            }
            let key = (from.clone(), channel.clone());
            inner.close_record(&key, None);
            if let Err(err) = start_answer(inner, &from, &channel, sdp).await {
                warn!(peer = %from, channel = %channel, error = %err, "answer failed");
            }
        }
        ExchangePayload::Answer { sdp } => {
            inner.apply_answer(&from, &channel, sdp).await;
        }
        ExchangePayload::Candidate {
            candidate,
            sdp_mid,
            sdp_mline_index,
        } => {
            if inner.force_relay && !is_relay_candidate(&candidate) {
                debug!(peer = %from, "dropping non-relay remote candidate");
                return;
            }
            let init = RTCIceCandidateInit {
                candidate,
                sdp_mid,
                sdp_mline_index,
                username_fragment: None,
            };
            inner.apply_candidate(&from, &channel, init).await;
        }
    }
}

/// Initiator path: create the transport and send an offer.
async fn start_offer(inner: &Arc<Inner>, peer: &str, channel: &str) -> Result<(), MeshError> {
    let epoch = inner.epochs.fetch_add(1, Ordering::Relaxed);
    let key: RecordKey = (peer.to_string(), channel.to_string());
    let pc = inner.new_peer_connection().await?;
    wire_connection(inner, &pc, &key, epoch);

    let dc = pc
        .create_data_channel(
            channel,
            Some(RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            }),
        )
        .await
        .map_err(setup_error)?;
    wire_channel(inner, &dc, &key, epoch);

    let offer = pc.create_offer(None).await.map_err(setup_error)?;
    let sdp = offer.sdp.clone();
    pc.set_local_description(offer).await.map_err(setup_error)?;

    inner.send_message(&SignalingMessage::Exchange {
        from: inner.local_id.clone(),
        to: peer.to_string(),
        channel: channel.to_string(),
        payload: ExchangePayload::Offer { sdp },
    });

    inner.records.lock().unwrap().insert(
        key.clone(),
        PeerRecord {
            epoch,
            role: Role::Initiator,
            state: RecordState::WaitAnswer,
            pc,
            remote_set: false,
            pending_candidates: Vec::new(),
        },
    );
    spawn_watchdog(inner, key, epoch);
    Ok(())
}

/// Responder path: apply the received offer and send an answer.
async fn start_answer(
    inner: &Arc<Inner>,
    peer: &str,
    channel: &str,
    sdp: String,
) -> Result<(), MeshError> {
    let Ok(offer) = RTCSessionDescription::offer(sdp) else {
        debug!(peer = %peer, channel = %channel, "dropping malformed offer");
        return Ok(());
    };

    let epoch = inner.epochs.fetch_add(1, Ordering::Relaxed);
    let key: RecordKey = (peer.to_string(), channel.to_string());
    let pc = inner.new_peer_connection().await?;
    wire_connection(inner, &pc, &key, epoch);

    let dc_inner = Arc::clone(inner);
    let dc_key = key.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let inner = Arc::clone(&dc_inner);
        let key = dc_key.clone();
        Box::pin(async move {
            if dc.label() == key.1 {
                wire_channel(&inner, &dc, &key, epoch);
            } else {
                debug!(label = %dc.label(), "ignoring unexpected data channel");
            }
        })
    }));

    pc.set_remote_description(offer).await.map_err(setup_error)?;
    let answer = pc.create_answer(None).await.map_err(setup_error)?;
    let sdp = answer.sdp.clone();
    pc.set_local_description(answer).await.map_err(setup_error)?;

    inner.send_message(&SignalingMessage::Exchange {
        from: inner.local_id.clone(),
        to: peer.to_string(),
        channel: channel.to_string(),
        payload: ExchangePayload::Answer { sdp },
    });

    inner.records.lock().unwrap().insert(
        key.clone(),
        PeerRecord {
            epoch,
            role: Role::Responder,
            state: RecordState::Answering,
            pc,
            remote_set: true,
            pending_candidates: Vec::new(),
        },
    );
    spawn_watchdog(inner, key, epoch);
    Ok(())
}

/// Trickle local candidates out and tear the record down on transport
/// failure.
fn wire_connection(inner: &Arc<Inner>, pc: &Arc<RTCPeerConnection>, key: &RecordKey, epoch: u64) {
    let candidate_inner = Arc::clone(inner);
    let candidate_key = key.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let inner = Arc::clone(&candidate_inner);
        let key = candidate_key.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(json) => {
                    if inner.force_relay && !is_relay_candidate(&json.candidate) {
                        debug!(peer = %key.0, "filtering non-relay local candidate");
                        return;
                    }
                    inner.send_message(&SignalingMessage::Exchange {
                        from: inner.local_id.clone(),
                        to: key.0.clone(),
                        channel: key.1.clone(),
                        payload: ExchangePayload::Candidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                        },
                    });
                }
                Err(err) => debug!(error = %err, "local candidate serialization failed"),
            }
        })
    }));

    let state_inner = Arc::clone(inner);
    let state_key = key.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let inner = Arc::clone(&state_inner);
        let key = state_key.clone();
        Box::pin(async move {
            debug!(peer = %key.0, channel = %key.1, ?state, "transport state changed");
            if matches!(
                state,
                RTCPeerConnectionState::Disconnected
                    | RTCPeerConnectionState::Failed
                    | RTCPeerConnectionState::Closed
            ) {
                inner.close_record(&key, Some(epoch));
            }
        })
    }));
}

/// Attach the byte-stream surface to a data channel. On open, the stream is
/// handed to `accept()` and an outbound pump task starts.
fn wire_channel(inner: &Arc<Inner>, dc: &Arc<RTCDataChannel>, key: &RecordKey, epoch: u64) {
    let (stream, ends) = stream::pair();
    let StreamEnds {
        inbound_tx,
        outbound_rx,
    } = ends;
    let stream_slot = Arc::new(Mutex::new(Some(stream)));
    let outbound_slot = Arc::new(Mutex::new(Some(outbound_rx)));
    let inbound_slot = Arc::new(Mutex::new(Some(inbound_tx)));

    let inbound_for_msg = Arc::clone(&inbound_slot);
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let sender = inbound_for_msg.lock().unwrap().clone();
        Box::pin(async move {
            if let Some(tx) = sender {
                let _ = tx.send(msg.data);
            }
        })
    }));

    let open_inner = Arc::clone(inner);
    let open_key = key.clone();
    let dc_for_open = Arc::clone(dc);
    dc.on_open(Box::new(move || {
        let inner = Arc::clone(&open_inner);
        let key = open_key.clone();
        let dc = Arc::clone(&dc_for_open);
        let stream_slot = Arc::clone(&stream_slot);
        let outbound_slot = Arc::clone(&outbound_slot);
        Box::pin(async move {
            let stream = stream_slot.lock().unwrap().take();
            let outbound_rx = outbound_slot.lock().unwrap().take();
            let (Some(stream), Some(mut outbound_rx)) = (stream, outbound_rx) else {
                return;
            };
            {
                let mut records = inner.records.lock().unwrap();
                match records.get_mut(&key) {
                    Some(r) if r.epoch == epoch => r.state = RecordState::Connected,
                    // Record replaced while the channel was opening.
                    _ => return,
                }
            }
            info!(peer = %key.0, channel = %key.1, "peer channel connected");

            let pump_inner = Arc::clone(&inner);
            let pump_key = key.clone();
            let send_deadline = inner.timeout;
            tokio::spawn(async move {
                while let Some(chunk) = outbound_rx.recv().await {
                    match tokio::time::timeout(send_deadline, dc.send(&chunk)).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(err)) => {
                            debug!(peer = %pump_key.0, error = %err, "channel send failed");
                            break;
                        }
                        Err(_) => {
                            debug!(peer = %pump_key.0, "channel send timed out");
                            break;
                        }
                    }
                }
                let _ = dc.close().await;
                pump_inner.close_record(&pump_key, Some(epoch));
            });

            let _ = inner.accept_tx.send(AcceptedChannel {
                peer_id: key.0.clone(),
                channel: key.1.clone(),
                stream,
            });
        })
    }));

    let close_inner = Arc::clone(inner);
    let close_key = key.clone();
    dc.on_close(Box::new(move || {
        let inner = Arc::clone(&close_inner);
        let key = close_key.clone();
        let inbound_slot = Arc::clone(&inbound_slot);
        Box::pin(async move {
            // Dropping the inbound sender EOFs the caller's stream.
            inbound_slot.lock().unwrap().take();
            inner.close_record(&key, Some(epoch));
        })
    }));
}

/// Bound the time to reach `Connected`. Initiators retry after a timeout;
/// responders wait for a fresh offer.
fn spawn_watchdog(inner: &Arc<Inner>, key: RecordKey, epoch: u64) {
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            _ = sleep(inner.timeout) => {}
        }
        let role = {
            let records = inner.records.lock().unwrap();
            match records.get(&key) {
                Some(r) if r.epoch == epoch && r.state != RecordState::Connected => Some(r.role),
                _ => None,
            }
        };
        let Some(role) = role else { return };
        warn!(peer = %key.0, channel = %key.1, "negotiation timed out");
        inner.close_record(&key, Some(epoch));
        if role == Role::Initiator && !inner.cancel.is_cancelled() && inner.signal_connected() {
            if let Err(err) = start_offer(&inner, &key.0, &key.1).await {
                debug!(peer = %key.0, channel = %key.1, error = %err, "retry offer failed");
            }
        }
    });
}

impl Inner {
    fn send_message(&self, message: &SignalingMessage) {
        let frame = match self.key.seal(message) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to seal signaling message");
                return;
            }
        };
        let sent = {
            let guard = self.signal_tx.lock().unwrap();
            guard.as_ref().map(|tx| tx.send(frame).is_ok())
        };
        if sent != Some(true) {
            debug!("signaling message dropped: link not connected");
        }
    }

    fn signal_connected(&self) -> bool {
        self.signal_tx.lock().unwrap().is_some()
    }

    async fn apply_answer(&self, peer: &str, channel: &str, sdp: String) {
        let key: RecordKey = (peer.to_string(), channel.to_string());
        let (pc, epoch) = {
            let records = self.records.lock().unwrap();
            match records.get(&key) {
                Some(r)
                    if r.role == Role::Initiator
                        && r.state == RecordState::WaitAnswer
                        && !r.remote_set =>
                {
                    (Arc::clone(&r.pc), r.epoch)
                }
                _ => {
                    debug!(peer = %peer, channel = %channel, "dropping unexpected answer");
                    return;
                }
            }
        };
        let Ok(answer) = RTCSessionDescription::answer(sdp) else {
            debug!(peer = %peer, channel = %channel, "dropping malformed answer");
            return;
        };
        if let Err(err) = pc.set_remote_description(answer).await {
            warn!(peer = %peer, channel = %channel, error = %err, "applying answer failed");
            self.close_record(&key, Some(epoch));
            return;
        }
        let buffered = {
            let mut records = self.records.lock().unwrap();
            match records.get_mut(&key) {
                Some(r) if r.epoch == epoch => {
                    r.remote_set = true;
                    std::mem::take(&mut r.pending_candidates)
                }
                _ => return,
            }
        };
        for candidate in buffered {
            if let Err(err) = pc.add_ice_candidate(candidate).await {
                debug!(peer = %peer, error = %err, "buffered candidate rejected");
            }
        }
    }

    async fn apply_candidate(&self, peer: &str, channel: &str, init: RTCIceCandidateInit) {
        let key: RecordKey = (peer.to_string(), channel.to_string());
        let pc = {
            let mut records = self.records.lock().unwrap();
            match records.get_mut(&key) {
                Some(r) if r.remote_set => Arc::clone(&r.pc),
                Some(r) => {
                    // Candidates never apply before the remote description.
                    r.pending_candidates.push(init);
                    return;
                }
                None => {
                    debug!(peer = %peer, channel = %channel, "dropping candidate without session");
                    return;
                }
            }
        };
        if let Err(err) = pc.add_ice_candidate(init).await {
            debug!(peer = %peer, error = %err, "remote candidate rejected");
        }
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, MeshError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(self.timeout / 2),
            Some(self.timeout),
            Some(Duration::from_millis(500)),
        );
        // Peers on the same host can only pair over loopback.
        setting.set_include_loopback_candidate(true);
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(setup_error)?;
        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(setup_error)?;
        let api = APIBuilder::new()
            .with_setting_engine(setting)
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ice_transport_policy: if self.force_relay {
                RTCIceTransportPolicy::Relay
            } else {
                RTCIceTransportPolicy::All
            },
            ..Default::default()
        };
        Ok(Arc::new(
            api.new_peer_connection(config).await.map_err(setup_error)?,
        ))
    }

    /// Remove a record and close its transport. `epoch` guards against
    /// tearing down a newer record under the same key.
    fn close_record(&self, key: &RecordKey, epoch: Option<u64>) {
        let removed = {
            let mut records = self.records.lock().unwrap();
            match records.get(key) {
                Some(r) if epoch.map_or(true, |e| r.epoch == e) => records.remove(key),
                _ => None,
            }
        };
        if let Some(record) = removed {
            debug!(peer = %key.0, channel = %key.1, "closing peer record");
            let pc = record.pc;
            tokio::spawn(async move {
                let _ = pc.close().await;
            });
        }
    }

    fn teardown_all(&self) {
        let drained: Vec<(RecordKey, PeerRecord)> = {
            let mut records = self.records.lock().unwrap();
            records.drain().collect()
        };
        for (key, record) in drained {
            debug!(peer = %key.0, channel = %key.1, "tearing down peer record");
            let pc = record.pc;
            tokio::spawn(async move {
                let _ = pc.close().await;
            });
        }
    }
}

fn setup_error<E: std::fmt::Display>(err: E) -> MeshError {
    MeshError::Setup(err.to_string())
}
