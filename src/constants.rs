// src/constants.rs - Protocol and policy constants shared by both tiers

/// Full mining header length in bytes
pub const BLOCKMINER_LENGTH: usize = 112;

/// Template blob length (work hash + extra nonce + public key)
pub const BLOB_LENGTH: usize = 96;

/// Read deadline before the first packet (seconds)
pub const HANDSHAKE_TIMEOUT: u64 = 5;

/// Read deadline for an established miner connection (seconds)
pub const MINER_TIMEOUT: u64 = 30;

/// Keepalive pings are sent this many seconds before the read deadline fires
pub const PING_MARGIN: u64 = 5;

/// A miner that produced no share for this long is kicked on the next
/// job broadcast (seconds)
pub const IDLE_SHARE_TIMEOUT: u64 = 10 * 60;

/// Submitted header timestamps may run at most this far ahead of the
/// slave clock (seconds)
pub const TIMESTAMP_FUTURE_LIMIT: u64 = 10;

/// Per-connection job history depth; a share referencing anything older
/// is stale
pub const MAX_PAST_JOBS: usize = 6;

/// Longest accepted line on the newline-framed protocols (bytes)
pub const MAX_REQUEST_SIZE: usize = 5 * 1024;

/// Simultaneous open connections allowed per IP
pub const MAX_CONNECTIONS_PER_IP: u32 = 100;

/// Cap for miner-chosen fixed difficulty (`wallet+diff` logins)
pub const MAX_FIXED_DIFFICULTY: u64 = 10_000_000;

/// Absolute difficulty ceiling ever handed to a miner (10G)
pub const MAX_DIFFICULTY: u64 = 10_000_000_000;

/// Aggregated shares are flushed to the master at this interval (seconds)
pub const SHARE_FLUSH_INTERVAL: u64 = 5;

/// Worker-count reports are sent to the master at this interval (seconds)
pub const STATS_SEND_INTERVAL: u64 = 10;

/// Delay before announcing a found block to the master, giving the
/// daemon time to process it first (seconds)
pub const BLOCK_FOUND_DELAY: u64 = 5;

/// Delay before the master looks a found block up on the daemon (seconds)
pub const BLOCK_LOOKUP_DELAY: u64 = 10;

/// Block submission is retried once after this delay (seconds)
pub const SUBMIT_RETRY_DELAY: u64 = 5;

/// Bind address of the master's slave-facing listener
pub const MASTER_SERVER_HOST: &str = "0.0.0.0";

/// Payout engine wakes up once per interval (seconds)
pub const WITHDRAW_INTERVAL: u64 = 8 * 60 * 60;

/// Maximum payout passes per wakeup
pub const MAX_WITHDRAW_ATTEMPTS: u32 = 10;

/// A payout pass is aborted below this many destinations
pub const MIN_WITHDRAW_DESTINATIONS: usize = 1;

/// A payout pass collects at most this many destinations
pub const MAX_WITHDRAW_DESTINATIONS: usize = 25;

/// Asset identifier used for payouts (the chain's native asset)
pub const ASSET: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Rescans for coinbase transfers start this many blocks below the last
/// processed height
pub const SAFETY_MARGIN: u64 = 5;

/// A pending block unretrievable this many blocks past its unlock height
/// is accounted as orphaned
pub const ORPHAN_GRACE_BLOCKS: u64 = 10;

/// Debt thresholds (whole coins) that scale the confirmation multiplier
pub const DEBT_COMPENSATE_ABOVE: f64 = 50.0;
pub const DEBT_RECOVER_BELOW: f64 = -10.0;

/// Statistics rollup interval (minutes) and chart depth (24 hours)
pub const STATS_INTERVAL_MINUTES: i64 = 15;
pub const NUM_CHART_DATA: usize = (60 * 24 / STATS_INTERVAL_MINUTES) as usize;

/// A miner address with no share for this long reports zero hashrate
/// (seconds)
pub const OFFLINE_AFTER: f64 = 6.0 * 60.0;

/// Smoothing coefficient of the per-address hashrate EMA
pub const HASHRATE_EMA_K: f64 = 30.0;

/// Addresses excluded from rewards and rewritten to the fee address on
/// payout. Empty by default; operators add known-abusive wallets here.
pub const BANNED_ADDRESSES: &[&str] = &[];
