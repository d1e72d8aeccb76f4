//! Throughput driver: saturates one channel per peer and measures it.
//!
//! The server writes `packet_count` packets of `packet_length` random bytes,
//! then blocks on a short acknowledgement; the receiver reads the batch and
//! acknowledges. Speeds print per batch, with a total on SIGINT.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use cove_mesh::{AcceptedChannel, PeerAdapter};

pub const CHANNEL: &str = "cove.throughput";

const ACK_LEN: usize = 100;

pub struct ThroughputConfig {
    pub server: bool,
    pub packet_length: usize,
    pub packet_count: usize,
}

#[derive(Default)]
struct Totals {
    transferred: usize,
    started: Option<Instant>,
    min: Option<f64>,
    max: Option<f64>,
}

impl Totals {
    fn record(&mut self, bytes: usize, elapsed: Duration) {
        self.started.get_or_insert_with(Instant::now);
        self.transferred += bytes;
        let speed = mb_per_second(bytes, elapsed);
        self.min = Some(self.min.map_or(speed, |m| m.min(speed)));
        self.max = Some(self.max.map_or(speed, |m| m.max(speed)));
    }

    fn summary(&self) -> Option<String> {
        let started = self.started?;
        let elapsed = started.elapsed();
        let speed = mb_per_second(self.transferred, elapsed);
        Some(format!(
            "Average: {:.3} MB/s ({:.3} Mb/s) ({} MB in {:.1?}) Min: {:.3} MB/s Max: {:.3} MB/s",
            speed,
            speed * 8.0,
            self.transferred / 1_000_000,
            elapsed,
            self.min.unwrap_or(0.0),
            self.max.unwrap_or(0.0),
        ))
    }
}

fn mb_per_second(bytes: usize, elapsed: Duration) -> f64 {
    if elapsed.is_zero() {
        return 0.0;
    }
    (bytes as f64 / elapsed.as_secs_f64()) / 1_000_000.0
}

pub async fn run(mut adapter: PeerAdapter, config: ThroughputConfig) -> Result<()> {
    let mut accept = adapter.accept().context("adapter accept stream taken")?;
    let mut ids = adapter.open()?;
    let totals = Arc::new(Mutex::new(Totals::default()));
    let config = Arc::new(config);

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
                info!(peer = %accepted.peer_id, channel = %accepted.channel, "connected to peer");
                let config = Arc::clone(&config);
                let totals = Arc::clone(&totals);
                tokio::spawn(async move {
                    let peer = accepted.peer_id.clone();
                    if let Err(err) = drive(accepted, &config, &totals).await {
                        debug!(peer = %peer, error = %err, "measurement ended");
                    }
                    info!(peer = %peer, "disconnected from peer");
                });
            }
        }
    }

    if let Some(summary) = totals.lock().unwrap().summary() {
        println!("{summary}");
    }
    adapter.close().await;
    Ok(())
}

async fn drive(
    accepted: AcceptedChannel,
    config: &ThroughputConfig,
    totals: &Arc<Mutex<Totals>>,
) -> std::io::Result<()> {
    let mut stream = accepted.stream;
    let mut packet = vec![0u8; config.packet_length];
    let mut ack = [0u8; ACK_LEN];

    loop {
        let start = Instant::now();
        let mut moved = 0usize;

        if config.server {
            for _ in 0..config.packet_count {
                rand::thread_rng().fill_bytes(&mut packet);
                stream.write_all(&packet).await?;
                moved += packet.len();
            }
            stream.read_exact(&mut ack).await?;
        } else {
            for _ in 0..config.packet_count {
                stream.read_exact(&mut packet).await?;
                moved += packet.len();
            }
            stream.write_all(&[0u8; ACK_LEN]).await?;
        }

        let elapsed = start.elapsed();
        let speed = mb_per_second(moved, elapsed);
        println!(
            "{:.3} MB/s ({:.3} Mb/s) ({} MB in {:.1?})",
            speed,
            speed * 8.0,
            moved / 1_000_000,
            elapsed
        );
        totals.lock().unwrap().record(moved, elapsed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_track_min_max_and_sum() {
        let mut totals = Totals::default();
        totals.record(1_000_000, Duration::from_secs(1));
        totals.record(4_000_000, Duration::from_secs(1));
        totals.record(2_000_000, Duration::from_secs(1));

        assert_eq!(totals.transferred, 7_000_000);
        assert_eq!(totals.min, Some(1.0));
        assert_eq!(totals.max, Some(4.0));
        assert!(totals.summary().is_some());
    }

    #[test]
    fn no_summary_before_first_batch() {
        let totals = Totals::default();
        assert!(totals.summary().is_none());
    }

    #[test]
    fn speed_math() {
        assert_eq!(mb_per_second(2_000_000, Duration::from_secs(2)), 1.0);
        assert_eq!(mb_per_second(0, Duration::ZERO), 0.0);
    }
}
