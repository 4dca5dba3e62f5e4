// src/config.rs - Configuration management for XEPool
use crate::error::{PoolError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;

/// Main configuration, loaded from `config.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Log level (error, warn, info, debug, trace)
    pub log_level: String,

    /// Shared secret of the slave<->master link; hashed into the link key
    pub master_pass: String,

    /// Atomic-unit exponent of the chain (1 coin = 10^atomic_units units)
    pub atomic_units: u32,

    /// Human-readable prefix of valid wallet addresses
    pub address_prefix: String,

    /// Address the daemon mines coinbase rewards to
    pub pool_address: String,

    /// Address collecting pool fees and rounding remainders
    pub fee_address: String,

    /// Network block target time in seconds
    pub block_time: u64,

    /// Slave (miner-facing) settings
    pub slave: SlaveConfig,

    /// Master (accounting) settings
    pub master: MasterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaveConfig {
    /// host:port of the master's slave listener
    pub master_address: String,

    /// Difficulty assigned to a connection before vardiff has data
    pub initial_difficulty: u64,

    /// Difficulty floor for every job
    pub min_difficulty: u64,

    /// Desired seconds between shares per connection (vardiff target)
    pub share_target: f64,

    /// Listen port of the Xatum (TLS) server
    pub xatum_port: u16,

    /// Listen port of the getwork (WebSocket) server
    pub getwork_port: u16,

    /// Listen port of the Stratum server
    pub stratum_port: u16,

    /// Shares accepted on trust below this score are always re-verified
    pub trust_score: i32,

    /// Percent chance that a trusted share is re-verified anyway
    pub trusted_check_chance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Listen port of the slave-facing channel
    pub port: u16,

    /// Pool fee in percent of each block reward
    pub fee_percent: f64,

    /// Minimum confirmed balance (whole coins) before an address is paid
    pub min_withdrawal: f64,

    /// Flat fee (whole coins) charged per payout destination
    pub withdrawal_fee: f64,

    /// Blocks before a coinbase reward is considered final
    pub min_confirmations: u64,

    /// host:port of the wallet RPC
    pub wallet_rpc: String,

    /// Wallet RPC credentials
    pub wallet_rpc_user: String,
    pub wallet_rpc_pass: String,

    /// host:port of the daemon RPC
    pub daemon_rpc: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            log_level: "info".to_string(),
            master_pass: String::new(),
            atomic_units: 8,
            address_prefix: "xel".to_string(),
            pool_address: String::new(),
            fee_address: String::new(),
            block_time: 15,
            slave: SlaveConfig::default(),
            master: MasterConfig::default(),
        }
    }
}

impl Default for SlaveConfig {
    fn default() -> Self {
        SlaveConfig {
            master_address: "127.0.0.1:7711".to_string(),
            initial_difficulty: 20_000,
            min_difficulty: 1_000,
            share_target: 10.0,
            xatum_port: 5555,
            getwork_port: 5556,
            stratum_port: 5557,
            trust_score: 20,
            trusted_check_chance: 10.0,
        }
    }
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            port: 7711,
            fee_percent: 1.0,
            min_withdrawal: 1.0,
            withdrawal_fee: 0.005,
            min_confirmations: 10,
            wallet_rpc: "127.0.0.1:8081".to_string(),
            wallet_rpc_user: String::new(),
            wallet_rpc_pass: String::new(),
            daemon_rpc: "127.0.0.1:8080".to_string(),
        }
    }
}

impl PoolConfig {
    /// Load configuration from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| PoolError::config(format!("failed to read config file: {}", e)))?;

        let config: PoolConfig = serde_json::from_str(&content)
            .map_err(|e| PoolError::config(format!("failed to parse config file: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Load `config.json` from the working directory or its parent.
    /// When neither exists, a blank config is written out for the operator
    /// to fill in, and an error is returned.
    pub fn load_default() -> Result<Self> {
        for path in ["config.json", "../config.json"] {
            if Path::new(path).exists() {
                return Self::load_from_file(path);
            }
        }

        let blank = serde_json::to_string_pretty(&PoolConfig::default())?;
        fs::write("config.json", blank)?;
        Err(PoolError::Fatal(
            "no config.json found; a blank configuration was created".to_string(),
        ))
    }

    /// Sanity-check the loaded values
    pub fn validate(&self) -> Result<()> {
        if self.master_pass.is_empty() {
            return Err(PoolError::config("master_pass must not be empty"));
        }
        if self.block_time == 0 {
            return Err(PoolError::config("block_time must be non-zero"));
        }
        if self.slave.min_difficulty == 0 {
            return Err(PoolError::config("slave.min_difficulty must be non-zero"));
        }
        if self.slave.min_difficulty > crate::constants::MAX_FIXED_DIFFICULTY {
            return Err(PoolError::config("slave.min_difficulty is absurdly high"));
        }
        if self.slave.share_target <= 0.0 {
            return Err(PoolError::config("slave.share_target must be positive"));
        }
        if !(0.0..=100.0).contains(&self.master.fee_percent) {
            return Err(PoolError::config("master.fee_percent must be in 0..=100"));
        }
        Ok(())
    }

    /// Symmetric key of the slave<->master link: SHA-256 of the shared
    /// password, making it fixed-length regardless of the configured value
    pub fn link_key(&self) -> [u8; 32] {
        let digest = Sha256::digest(self.master_pass.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        key
    }

    /// Atomic units per whole coin
    pub fn coin(&self) -> f64 {
        10f64.powi(self.atomic_units as i32)
    }

    /// Parse the configured log level
    pub fn log_filter(&self) -> log::LevelFilter {
        match self.log_level.to_lowercase().as_str() {
            "error" => log::LevelFilter::Error,
            "warn" => log::LevelFilter::Warn,
            "debug" => log::LevelFilter::Debug,
            "trace" => log::LevelFilter::Trace,
            _ => log::LevelFilter::Info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> PoolConfig {
        PoolConfig {
            master_pass: "hunter2".to_string(),
            ..PoolConfig::default()
        }
    }

    #[test]
    fn test_validate_rejects_blank_password() {
        let config = PoolConfig::default();
        assert!(config.validate().is_err());
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_link_key_is_password_hash() {
        let a = valid_config();
        let mut b = valid_config();
        assert_eq!(a.link_key(), b.link_key());

        b.master_pass = "different".to_string();
        assert_ne!(a.link_key(), b.link_key());
        assert_eq!(a.link_key().len(), 32);
    }

    #[test]
    fn test_coin_units() {
        let config = valid_config();
        assert_eq!(config.coin(), 100_000_000.0);
    }

    #[test]
    fn test_roundtrip_json() {
        let config = valid_config();
        let json = serde_json::to_string(&config).unwrap();
        let back: PoolConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.master_pass, config.master_pass);
        assert_eq!(back.slave.xatum_port, config.slave.xatum_port);
    }
}
