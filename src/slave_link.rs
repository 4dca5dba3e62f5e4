// src/slave_link.rs - Slave side of the encrypted master channel
//
// Accepted shares are not forwarded one by one: they accumulate per wallet
// and are flushed as one aggregate message every few seconds, which keeps
// the AEAD/framing cost flat under high miner counts.
use crate::constants::{BLOCK_FOUND_DELAY, SHARE_FLUSH_INTERVAL};
use crate::rate_limit::RateLimiter;
use crate::transport::framed_pair;
use crate::wire::{MasterMessage, SlaveMessage};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

#[derive(Default, Clone, Copy)]
struct ShareCache {
    count: u32,
    total_diff: u64,
}

/// Handle to the master link. Cheap to clone through an `Arc`; the
/// connection itself lives in a background task that reconnects forever.
pub struct SlaveLink {
    shares: Mutex<HashMap<String, ShareCache>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl SlaveLink {
    /// Start the link tasks and return the shared handle
    pub fn start(master_address: String, key: [u8; 32], limiter: Arc<RateLimiter>) -> Arc<Self> {
        let (outbound, rx) = mpsc::unbounded_channel();

        let link = Arc::new(SlaveLink {
            shares: Mutex::new(HashMap::new()),
            outbound,
        });

        tokio::spawn(run_link(master_address, key, limiter, rx));

        let flusher = Arc::clone(&link);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(SHARE_FLUSH_INTERVAL));
            loop {
                ticker.tick().await;
                flusher.flush_shares();
            }
        });

        link
    }

    /// Accumulate one accepted share for `wallet`
    pub fn record_share(&self, wallet: &str, diff: u64) {
        let mut shares = self.shares.lock();
        let entry = shares.entry(wallet.to_string()).or_default();
        entry.count += 1;
        entry.total_diff += diff;
    }

    /// Announce a found block. Delayed a few seconds so the daemon has
    /// seen the block before the master asks it for the reward.
    pub fn send_block_found(&self, hash: [u8; 32]) {
        let outbound = self.outbound.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(BLOCK_FOUND_DELAY)).await;
            let _ = outbound.send(SlaveMessage::BlockFound { hash }.encode());
        });
    }

    /// Report the current worker count
    pub fn send_stats(&self, workers: u32) {
        self.send(SlaveMessage::Stats { workers });
    }

    /// Propagate a local ban so the master can fan it out
    pub fn send_ban(&self, ip: &str, ban_end: u64) {
        self.send(SlaveMessage::Ban {
            ip: ip.to_string(),
            ban_end,
        });
    }

    fn send(&self, msg: SlaveMessage) {
        // messages queued while the link is down are dropped by the task
        let _ = self.outbound.send(msg.encode());
    }

    fn flush_shares(&self) {
        let drained: Vec<(String, ShareCache)> = {
            let mut shares = self.shares.lock();
            shares.drain().collect()
        };

        for (wallet, cache) in drained {
            debug!(
                "flushing {} cached shares for {} (total diff {})",
                cache.count, wallet, cache.total_diff
            );
            self.send(SlaveMessage::Shares {
                count: cache.count,
                wallet,
                total_diff: cache.total_diff,
            });
        }
    }
}

/// Connection task: dial the master, pump queued messages out and bans in;
/// reconnect one second after any failure.
async fn run_link(
    master_address: String,
    key: [u8; 32],
    limiter: Arc<RateLimiter>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    loop {
        info!("connecting to master server: {}", master_address);

        let stream = match TcpStream::connect(&master_address).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("master connection failed: {}", err);
                drain_queue(&mut rx);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        let (mut reader, mut writer) = framed_pair(stream, &key);
        info!("master link established");

        loop {
            tokio::select! {
                queued = rx.recv() => {
                    let Some(payload) = queued else { return };
                    if let Err(err) = writer.send(&payload).await {
                        warn!("master link send failed: {}", err);
                        break;
                    }
                }
                inbound = reader.recv() => {
                    match inbound {
                        Ok(payload) => handle_master_message(&payload, &limiter),
                        Err(err) => {
                            warn!("master link read failed: {}", err);
                            break;
                        }
                    }
                }
            }
        }

        drain_queue(&mut rx);
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

/// Messages queued while disconnected are dropped, not replayed
fn drain_queue(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) {
    while rx.try_recv().is_ok() {}
}

fn handle_master_message(payload: &[u8], limiter: &RateLimiter) {
    match MasterMessage::decode(payload) {
        Ok(Some(MasterMessage::Ban { ip, ban_end })) => {
            info!("received ban from master, ip: {} ends: {}", ip, ban_end);
            limiter.ban(&ip, ban_end);
        }
        Ok(None) => debug!("unknown master message tag, dropping"),
        Err(err) => warn!("bad master message: {}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_share_cache_accumulates_per_wallet() {
        let (outbound, mut rx) = mpsc::unbounded_channel();
        let link = SlaveLink {
            shares: Mutex::new(HashMap::new()),
            outbound,
        };

        link.record_share("wallet_a", 1_000);
        link.record_share("wallet_a", 2_000);
        link.record_share("wallet_b", 500);

        link.flush_shares();
        assert!(link.shares.lock().is_empty());

        let mut flushed = Vec::new();
        while let Ok(payload) = rx.try_recv() {
            flushed.push(SlaveMessage::decode(&payload).unwrap().unwrap());
        }
        flushed.sort_by_key(|m| match m {
            SlaveMessage::Shares { wallet, .. } => wallet.clone(),
            _ => String::new(),
        });

        assert_eq!(
            flushed,
            vec![
                SlaveMessage::Shares {
                    count: 2,
                    wallet: "wallet_a".to_string(),
                    total_diff: 3_000,
                },
                SlaveMessage::Shares {
                    count: 1,
                    wallet: "wallet_b".to_string(),
                    total_diff: 500,
                },
            ]
        );

        // a second flush with nothing cached sends nothing
        link.flush_shares();
        assert!(rx.try_recv().is_err());
    }
}
