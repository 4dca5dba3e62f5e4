// src/slave.rs - Shared state of one slave process
use crate::config::PoolConfig;
use crate::job::LastTemplate;
use crate::rate_limit::RateLimiter;
use crate::slave_link::SlaveLink;
use crate::upstream::BlockSubmitter;
use log::info;
use rand::RngCore;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};

/// Process-wide slave state, built once at startup and handed to every
/// server and task. Tests construct it explicitly.
pub struct SlaveContext {
    pub config: PoolConfig,

    /// Random per-process value stamped into every outgoing job; a
    /// submitted header carrying any other value was never ours
    pub pool_nonce: [u8; 8],

    pub limiter: Arc<RateLimiter>,

    /// The template most recently received from the daemon
    pub template: RwLock<Option<LastTemplate>>,

    /// Channel to the master server
    pub link: Arc<SlaveLink>,

    /// Block submission over the daemon getwork session
    pub submitter: BlockSubmitter,

    /// Bounds concurrent PoW verification so CPU work cannot starve the
    /// I/O tasks
    pub pow_checks: Semaphore,
}

impl SlaveContext {
    pub fn new(
        config: PoolConfig,
        limiter: Arc<RateLimiter>,
        link: Arc<SlaveLink>,
        submitter: BlockSubmitter,
    ) -> Arc<Self> {
        let mut pool_nonce = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut pool_nonce);
        info!("pool nonce: {}", hex::encode(pool_nonce));

        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);

        Arc::new(SlaveContext {
            config,
            pool_nonce,
            limiter,
            template: RwLock::new(None),
            link,
            submitter,
            pow_checks: Semaphore::new(workers),
        })
    }
}
