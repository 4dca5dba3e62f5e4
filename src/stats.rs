// src/stats.rs - In-memory pool statistics on the master
//
// The whole structure is snapshotted to stats.json on every rollup so a
// restart keeps the charts; the statistics API consumes the same file.
use crate::constants::{HASHRATE_EMA_K, NUM_CHART_DATA, OFFLINE_AFTER, STATS_INTERVAL_MINUTES};
use crate::rpc::TransferOut;
use crate::util;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const STATS_FILE: &str = "stats.json";

/// Chart sample
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct HrPoint {
    #[serde(rename = "t")]
    pub time: i64,
    #[serde(rename = "h")]
    pub hashrate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LastBlock {
    pub height: u64,
    pub timestamp: i64,
    pub reward: u64,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundInfo {
    pub height: u64,
    pub hash: String,
    /// 1.0 = 100% effort
    pub effort: f32,
    pub time: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdrawal {
    pub txid: String,
    #[serde(rename = "time")]
    pub timestamp: u64,
    pub destinations: Vec<TransferOut>,
}

/// Per-address live hashrate, smoothed over share arrivals
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct KnownAddress {
    #[serde(rename = "t")]
    pub last_share: f64,
    #[serde(rename = "h")]
    pub avg_hashrate: f64,
}

impl KnownAddress {
    /// Current EMA hashrate; an address idle past the cutoff reads zero
    pub fn hashrate(&mut self) -> f64 {
        if self.last_share + OFFLINE_AFTER < util::now_precise() {
            self.avg_hashrate = 0.0;
            self.last_share = util::now_precise();
        }
        self.avg_hashrate
    }

    /// Fold one share of weight `diff` observed at `time` into the EMA
    pub fn add_share(&mut self, diff: f64, time: f64) {
        if self.last_share == 0.0 {
            self.avg_hashrate = 0.0;
            self.last_share = time;
            return;
        }

        // clamp the interval so a burst cannot divide by ~zero
        if self.last_share > time - 1.0 {
            self.last_share = time - 1.0;
        }

        let hr = diff / (time - self.last_share);
        self.avg_hashrate = ((self.avg_hashrate * (HASHRATE_EMA_K - 1.0)) + hr) / HASHRATE_EMA_K;
        self.avg_hashrate = self.avg_hashrate.round();
        self.last_share = time;
    }
}

/// Master-side statistics; one instance behind a single RwLock
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Statistics {
    pub last_update: i64,

    pub pool_hashrate: f64,
    pub pool_hashrate_chart: Vec<HrPoint>,
    pub hashrate_charts: HashMap<String, Vec<HrPoint>>,

    /// Share-weighted hashes since the last found block (effort counter)
    pub hashes: f64,

    pub last_block: LastBlock,
    pub blocks_found: Vec<FoundInfo>,
    pub num_found: i32,

    pub net_hashrate: f64,
    pub difficulty: f64,

    pub known_addresses: HashMap<String, KnownAddress>,
    pub recent_withdrawals: Vec<Withdrawal>,

    /// Live miner connections, summed over slaves
    pub workers: u32,
    pub workers_chart: Vec<u32>,
    pub addresses_chart: Vec<u32>,

    /// Worker count per connected slave; not part of the snapshot
    #[serde(skip)]
    pub slave_workers: HashMap<u64, u32>,
}

impl Statistics {
    /// Reload the last snapshot, or start fresh
    pub fn load() -> Self {
        match std::fs::read_to_string(STATS_FILE) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(stats) => stats,
                Err(err) => {
                    warn!("could not parse {}: {}", STATS_FILE, err);
                    Statistics::default()
                }
            },
            Err(_) => Statistics::default(),
        }
    }

    /// Record one aggregated share burst for `wallet`
    pub fn add_share(&mut self, wallet: &str, diff: f64) {
        let entry = self.known_addresses.entry(wallet.to_string()).or_default();
        entry.add_share(diff, util::now_precise());
        self.hashes += diff;
    }

    pub fn hashrate(&mut self, wallet: &str) -> f64 {
        self.known_addresses
            .get_mut(wallet)
            .map(|addr| addr.hashrate())
            .unwrap_or(0.0)
    }

    /// Recompute the per-slave worker sum
    pub fn recount_workers(&mut self) {
        self.workers = self.slave_workers.values().sum();
    }

    /// Prune idle addresses, refresh the pool hashrate and persist the
    /// snapshot
    pub fn cleanup(&mut self) {
        let cutoff = util::now_precise() - 3600.0 * 24.0;
        let mut total_hr = 0.0;

        self.known_addresses.retain(|_, addr| addr.last_share > cutoff);
        for addr in self.known_addresses.values_mut() {
            total_hr += addr.hashrate();
        }
        self.pool_hashrate = total_hr.round();

        self.blocks_found.truncate(50);
        self.recent_withdrawals.truncate(50);

        self.save();
    }

    fn save(&self) {
        match serde_json::to_string(self) {
            Ok(data) => {
                if let Err(err) = std::fs::write(STATS_FILE, data) {
                    warn!("could not write {}: {}", STATS_FILE, err);
                }
            }
            Err(err) => warn!("could not serialize statistics: {}", err),
        }
    }

    /// Append the 15-minute chart samples and drop aged ones
    pub fn rollup(&mut self) {
        info!("updating statistics");

        self.last_update += STATS_INTERVAL_MINUTES * 60;

        let mut total_hr = 0.0;
        let addresses: Vec<String> = self.known_addresses.keys().cloned().collect();

        for address in addresses {
            let hr = self
                .known_addresses
                .get_mut(&address)
                .map(|a| a.hashrate())
                .unwrap_or(0.0);
            total_hr += hr;

            let chart = self.hashrate_charts.entry(address.clone()).or_default();
            chart.push(HrPoint {
                time: self.last_update,
                hashrate: hr.round(),
            });
            while chart.len() > NUM_CHART_DATA {
                chart.remove(0);
            }

            // an address whose whole chart is flat zero is gone
            if chart.iter().all(|point| point.hashrate == 0.0) {
                self.known_addresses.remove(&address);
                self.hashrate_charts.remove(&address);
            }
        }

        self.workers_chart.push(self.workers);
        self.addresses_chart
            .push(self.known_addresses.len() as u32);
        self.pool_hashrate_chart.push(HrPoint {
            time: self.last_update,
            hashrate: total_hr.round(),
        });
        while self.pool_hashrate_chart.len() > NUM_CHART_DATA {
            self.pool_hashrate_chart.remove(0);
        }
        while self.workers_chart.len() > NUM_CHART_DATA {
            self.workers_chart.remove(0);
        }
        while self.addresses_chart.len() > NUM_CHART_DATA {
            self.addresses_chart.remove(0);
        }

        self.cleanup();
    }

    /// Whether a rollup is due; also resynchronizes after long downtime
    pub fn rollup_due(&mut self) -> bool {
        let now = util::now() as i64;
        let interval = STATS_INTERVAL_MINUTES * 60;

        if now - self.last_update < interval {
            return false;
        }
        if now - self.last_update > interval * 10 {
            debug!("statistics clock far behind, resynchronizing");
            self.last_update = now - interval;
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_address_ema_smoothing() {
        let mut addr = KnownAddress::default();
        let t0 = util::now_precise();

        // the very first share only arms the tracker
        addr.add_share(1_000.0, t0);
        assert_eq!(addr.avg_hashrate, 0.0);

        // 1000 diff every 10 seconds = 100 H/s, smoothed by K
        addr.add_share(1_000.0, t0 + 10.0);
        let expected = 100.0 / HASHRATE_EMA_K;
        assert!((addr.avg_hashrate - expected.round()).abs() <= 1.0);

        // converges towards 100 with more shares
        for i in 2..200 {
            addr.add_share(1_000.0, t0 + 10.0 * i as f64);
        }
        assert!((addr.avg_hashrate - 100.0).abs() < 5.0);
    }

    #[test]
    fn test_idle_address_reads_zero() {
        let mut addr = KnownAddress {
            last_share: util::now_precise() - OFFLINE_AFTER - 10.0,
            avg_hashrate: 5_000.0,
        };
        assert_eq!(addr.hashrate(), 0.0);
    }

    #[test]
    fn test_add_share_updates_effort_counter() {
        let mut stats = Statistics::default();
        stats.add_share("xel1a", 2_000.0);
        stats.add_share("xel1b", 1_000.0);
        assert_eq!(stats.hashes, 3_000.0);
        assert_eq!(stats.known_addresses.len(), 2);
    }

    #[test]
    fn test_worker_recount() {
        let mut stats = Statistics::default();
        stats.slave_workers.insert(1, 10);
        stats.slave_workers.insert(2, 32);
        stats.recount_workers();
        assert_eq!(stats.workers, 42);

        stats.slave_workers.remove(&1);
        stats.recount_workers();
        assert_eq!(stats.workers, 32);
    }
}
