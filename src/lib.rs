// src/lib.rs - XEPool library
//! # XEPool
//!
//! A two-tier PPLNS mining pool for XELIS-style proof-of-work networks:
//! - Slave servers speak Xatum (TLS), getwork (WebSocket) and Stratum to
//!   miners, with per-connection vardiff and trust-scored PoW checks
//! - An authenticated-encrypted TCP channel aggregates shares to a master
//! - The master accounts rewards over a PPLNS window, gates them on
//!   confirmation depth and pays miners through the wallet RPC

pub mod accounting;
pub mod address;
pub mod blockminer;
pub mod config;
pub mod constants;
pub mod db;
pub mod difficulty;
pub mod dispatch;
pub mod error;
pub mod getwork;
pub mod job;
pub mod master;
pub mod payout;
pub mod pow;
pub mod rate_limit;
pub mod rpc;
pub mod shares;
pub mod slave;
pub mod slave_link;
pub mod stats;
pub mod stratum;
pub mod transport;
pub mod upstream;
pub mod util;
pub mod wire;
pub mod xatum;

// Re-export the types nearly every consumer touches
pub use blockminer::BlockMiner;
pub use config::PoolConfig;
pub use error::{PoolError, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialize logging at the configured level
pub fn init_logging(level: log::LevelFilter) {
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}
