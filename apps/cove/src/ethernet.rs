//! Layer 2 bridge between a local TAP device and the overlay.
//!
//! Every peer in the community gets one `cove.ethernet` channel; frames cross
//! it with a 16-bit length prefix since the channel is a byte stream. Source
//! MACs seen on inbound frames are learned per peer, so unicast traffic goes
//! to the owning peer only; broadcast, multicast, and unlearned destinations
//! flood to everyone.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use cove_mesh::{AcceptedChannel, PeerAdapter};

use crate::tap::TapDevice;

pub const CHANNEL: &str = "cove.ethernet";

/// Per-read frame buffer: a full MTU frame plus headers, with headroom.
const FRAME_BUF_LEN: usize = 2048;

pub struct EthernetConfig {
    pub device: Option<String>,
    pub mac: Option<String>,
    /// Number of frame decode workers.
    pub parallel: usize,
}

type PeerRegistry = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Bytes>>>>;
type MacTable = Arc<Mutex<HashMap<[u8; 6], String>>>;

pub async fn run(mut adapter: PeerAdapter, config: EthernetConfig) -> Result<()> {
    let mac = config.mac.as_deref().map(parse_mac).transpose()?;
    let tap = Arc::new(
        TapDevice::open(config.device.as_deref(), mac).context("failed to open TAP device")?,
    );
    info!(device = %tap.name(), "tap device ready");

    let registry: PeerRegistry = Arc::new(Mutex::new(HashMap::new()));
    let macs: MacTable = Arc::new(Mutex::new(HashMap::new()));

    let mut accept = adapter.accept().context("adapter accept stream taken")?;
    let mut ids = adapter.open()?;

    // Decode workers: frames read from the device are parsed and routed off
    // the reader task, `parallel` at a time.
    let workers: Vec<mpsc::UnboundedSender<Bytes>> = (0..config.parallel.max(1))
        .map(|_| {
            let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
            let registry = Arc::clone(&registry);
            let macs = Arc::clone(&macs);
            tokio::spawn(async move {
                while let Some(frame) = rx.recv().await {
                    route_frame(&registry, &macs, frame);
                }
            });
            tx
        })
        .collect();

    let tap_reader = Arc::clone(&tap);
    tokio::spawn(async move {
        let mut buf = vec![0u8; FRAME_BUF_LEN];
        let mut turn = 0usize;
        loop {
            match tap_reader.recv(&mut buf).await {
                Ok(n) => {
                    let frame = Bytes::copy_from_slice(&buf[..n]);
                    let _ = workers[turn % workers.len()].send(frame);
                    turn += 1;
                }
                Err(err) => {
                    error!(error = %err, "tap read failed");
                    break;
                }
            }
        }
    });

    // Frames from peers funnel through one queue onto the device.
    let (tap_tx, mut tap_rx) = mpsc::unbounded_channel::<Bytes>();
    let tap_writer = Arc::clone(&tap);
    tokio::spawn(async move {
        while let Some(frame) = tap_rx.recv().await {
            if let Err(err) = tap_writer.send(&frame).await {
                error!(error = %err, "tap write failed");
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            id = ids.recv() => {
                match id {
                    Some(id) => info!(%id, "connected to signaler"),
                    None => break,
                }
            }
            accepted = accept.recv() => {
                let Some(accepted) = accepted else { break };
                if accepted.channel == CHANNEL {
                    bridge_peer(accepted, &registry, &macs, &tap_tx);
                }
            }
        }
    }

    adapter.close().await;
    Ok(())
}

/// Wire one accepted peer channel into the bridge.
fn bridge_peer(
    accepted: AcceptedChannel,
    registry: &PeerRegistry,
    macs: &MacTable,
    tap_tx: &mpsc::UnboundedSender<Bytes>,
) {
    let peer_id = accepted.peer_id;
    info!(peer = %peer_id, "connected to peer");

    let (mut read_half, mut write_half) = tokio::io::split(accepted.stream);
    let (peer_tx, mut peer_rx) = mpsc::unbounded_channel::<Bytes>();
    registry
        .lock()
        .unwrap()
        .insert(peer_id.clone(), peer_tx.clone());

    let writer_peer = peer_id.clone();
    tokio::spawn(async move {
        while let Some(frame) = peer_rx.recv().await {
            if let Err(err) = write_frame(&mut write_half, &frame).await {
                debug!(peer = %writer_peer, error = %err, "peer write ended");
                break;
            }
        }
    });

    let registry = Arc::clone(registry);
    let macs = Arc::clone(macs);
    let tap_tx = tap_tx.clone();
    tokio::spawn(async move {
        loop {
            match read_frame(&mut read_half).await {
                Ok(frame) => {
                    if let Some(src) = source_mac(&frame) {
                        macs.lock().unwrap().insert(src, peer_id.clone());
                    }
                    if tap_tx.send(Bytes::from(frame)).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    debug!(peer = %peer_id, error = %err, "peer stream ended");
                    break;
                }
            }
        }
        {
            // A reconnected peer may already have replaced our entry.
            let mut registry = registry.lock().unwrap();
            if registry
                .get(&peer_id)
                .is_some_and(|tx| tx.same_channel(&peer_tx))
            {
                registry.remove(&peer_id);
            }
        }
        macs.lock().unwrap().retain(|_, owner| owner != &peer_id);
        info!(peer = %peer_id, "disconnected from peer");
    });
}

fn route_frame(registry: &PeerRegistry, macs: &MacTable, frame: Bytes) {
    let Some(dst) = destination_mac(&frame) else {
        debug!(len = frame.len(), "dropping short frame");
        return;
    };
    if is_unicast(&dst) {
        let target = macs.lock().unwrap().get(&dst).cloned();
        if let Some(peer_id) = target {
            let tx = registry.lock().unwrap().get(&peer_id).cloned();
            if let Some(tx) = tx {
                let _ = tx.send(frame);
                return;
            }
        }
    }
    // Broadcast, multicast, and unlearned destinations flood.
    let members: Vec<_> = registry.lock().unwrap().values().cloned().collect();
    for tx in members {
        let _ = tx.send(frame.clone());
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    let len = u16::try_from(frame.len()).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "frame exceeds length prefix")
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(frame).await
}

async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut header = [0u8; 2];
    reader.read_exact(&mut header).await?;
    let mut frame = vec![0u8; u16::from_be_bytes(header) as usize];
    reader.read_exact(&mut frame).await?;
    Ok(frame)
}

fn destination_mac(frame: &[u8]) -> Option<[u8; 6]> {
    frame.get(0..6)?.try_into().ok()
}

fn source_mac(frame: &[u8]) -> Option<[u8; 6]> {
    frame.get(6..12)?.try_into().ok()
}

fn is_unicast(mac: &[u8; 6]) -> bool {
    mac[0] & 0x01 == 0
}

fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let octets: Vec<u8> = mac
        .split(':')
        .map(|part| u8::from_str_radix(part, 16))
        .collect::<Result<_, _>>()
        .with_context(|| format!("invalid MAC address {mac}"))?;
    match octets.try_into() {
        Ok(mac) => Ok(mac),
        Err(_) => bail!("invalid MAC address {mac}: expected 6 octets"),
    }
}
