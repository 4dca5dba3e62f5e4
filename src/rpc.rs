// src/rpc.rs - JSON-RPC clients for the daemon and the wallet
use crate::error::{PoolError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: DeserializeOwned"))]
struct RpcEnvelope<T> {
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

async fn call<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    auth: Option<(&str, &str)>,
    method: &str,
    params: serde_json::Value,
) -> Result<T> {
    let body = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": method,
        "params": params,
    });

    let mut request = client.post(url).json(&body);
    if let Some((user, pass)) = auth {
        request = request.basic_auth(user, Some(pass));
    }

    let response = request
        .send()
        .await
        .map_err(|e| PoolError::upstream(format!("{} request failed: {}", method, e)))?;

    let envelope: RpcEnvelope<T> = response
        .json()
        .await
        .map_err(|e| PoolError::upstream(format!("{} returned bad JSON: {}", method, e)))?;

    if let Some(err) = envelope.error {
        return Err(PoolError::upstream(format!(
            "{} failed: {} (code {})",
            method, err.message, err.code
        )));
    }
    envelope
        .result
        .ok_or_else(|| PoolError::upstream(format!("{} returned no result", method)))
}

// daemon ------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct NodeInfo {
    pub topoheight: u64,
    /// Network difficulty, decimal string
    pub difficulty: String,
}

#[derive(Debug, Deserialize)]
pub struct BlockInfo {
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub height: u64,
    #[serde(default)]
    pub block_type: String,
    #[serde(default)]
    pub miner_reward: Option<u64>,
}

#[derive(Clone)]
pub struct DaemonRpc {
    client: reqwest::Client,
    url: String,
}

impl DaemonRpc {
    pub fn new(endpoint: &str) -> Self {
        DaemonRpc {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client"),
            url: format!("http://{}/json_rpc", endpoint),
        }
    }

    pub async fn get_info(&self) -> Result<NodeInfo> {
        call(&self.client, &self.url, None, "get_info", json!({})).await
    }

    pub async fn get_top_block(&self) -> Result<BlockInfo> {
        call(
            &self.client,
            &self.url,
            None,
            "get_top_block",
            json!({ "include_txs": false }),
        )
        .await
    }

    pub async fn get_block_by_hash(&self, hash: &str) -> Result<BlockInfo> {
        call(
            &self.client,
            &self.url,
            None,
            "get_block_by_hash",
            json!({ "hash": hash, "include_txs": false }),
        )
        .await
    }
}

// wallet ------------------------------------------------------------------

/// One payout destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferOut {
    pub amount: u64,
    pub asset: String,
    pub destination: String,
}

#[derive(Debug, Deserialize)]
pub struct CoinbaseEntry {
    pub reward: u64,
}

/// A wallet-side transaction record; only coinbase entries matter here
#[derive(Debug, Deserialize)]
pub struct TransactionEntry {
    pub hash: String,
    pub topoheight: u64,
    #[serde(default)]
    pub coinbase: Option<CoinbaseEntry>,
}

#[derive(Debug, Deserialize)]
pub struct BuiltTransaction {
    pub hash: String,
    #[serde(default)]
    pub fee: u64,
}

#[derive(Debug, Deserialize)]
pub struct WalletBalance {
    pub balance: u64,
}

#[derive(Clone)]
pub struct WalletRpc {
    client: reqwest::Client,
    url: String,
    user: String,
    pass: String,
}

impl WalletRpc {
    pub fn new(endpoint: &str, user: &str, pass: &str) -> Self {
        WalletRpc {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("reqwest client"),
            url: format!("http://{}/json_rpc", endpoint),
            user: user.to_string(),
            pass: pass.to_string(),
        }
    }

    fn auth(&self) -> Option<(&str, &str)> {
        if self.user.is_empty() {
            None
        } else {
            Some((&self.user, &self.pass))
        }
    }

    /// Coinbase transfers to `address` with topoheight >= `min_topoheight`
    pub async fn list_coinbase_transfers(
        &self,
        address: &str,
        min_topoheight: u64,
    ) -> Result<Vec<TransactionEntry>> {
        call(
            &self.client,
            &self.url,
            self.auth(),
            "list_transactions",
            json!({
                "accept_coinbase": true,
                "accept_burn": false,
                "accept_incoming": false,
                "accept_outgoing": false,
                "min_topoheight": min_topoheight,
                "address": address,
            }),
        )
        .await
    }

    /// Current spendable wallet balance of the native asset
    pub async fn get_balance(&self, asset: &str) -> Result<u64> {
        let balance: WalletBalance = call(
            &self.client,
            &self.url,
            self.auth(),
            "get_balance",
            json!({ "asset": asset }),
        )
        .await?;
        Ok(balance.balance)
    }

    /// Build and broadcast a multi-destination payout transaction
    pub async fn build_transaction(&self, transfers: &[TransferOut]) -> Result<BuiltTransaction> {
        call(
            &self.client,
            &self.url,
            self.auth(),
            "build_transaction",
            json!({
                "transfers": transfers,
                "broadcast": true,
            }),
        )
        .await
    }
}
