// src/master.rs - Shared state of the master process
use crate::config::PoolConfig;
use crate::db::Store;
use crate::error::Result;
use crate::rpc::{DaemonRpc, WalletRpc};
use crate::stats::Statistics;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Chain-tip data polled from the daemon
#[derive(Debug, Clone, Copy, Default)]
pub struct MasterInfo {
    pub block_reward: u64,
    pub height: u64,
}

/// Process-wide master state. Lock order: `info` before `stats`; the KV
/// store stages its own batches and is never held across either.
pub struct MasterContext {
    pub config: PoolConfig,
    pub store: Store,
    pub stats: parking_lot::RwLock<Statistics>,
    pub info: parking_lot::RwLock<MasterInfo>,
    pub daemon: DaemonRpc,
    pub wallet: WalletRpc,
    /// Outbound frame queue per connected slave
    pub slaves: tokio::sync::RwLock<HashMap<u64, mpsc::UnboundedSender<Vec<u8>>>>,
}

impl MasterContext {
    pub fn new(config: PoolConfig, db_path: &str) -> Result<Arc<Self>> {
        let daemon = DaemonRpc::new(&config.master.daemon_rpc);
        let wallet = WalletRpc::new(
            &config.master.wallet_rpc,
            &config.master.wallet_rpc_user,
            &config.master.wallet_rpc_pass,
        );

        Ok(Arc::new(MasterContext {
            store: Store::open(db_path)?,
            stats: parking_lot::RwLock::new(Statistics::load()),
            info: parking_lot::RwLock::new(MasterInfo::default()),
            daemon,
            wallet,
            slaves: tokio::sync::RwLock::new(HashMap::new()),
            config,
        }))
    }

    /// Queue a frame to every connected slave
    pub async fn broadcast_to_slaves(&self, payload: Vec<u8>) {
        for sender in self.slaves.read().await.values() {
            let _ = sender.send(payload.clone());
        }
    }
}
