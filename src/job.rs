// src/job.rs - Per-connection job state and variable difficulty
use crate::blockminer::BlockMiner;
use crate::constants::{MAX_DIFFICULTY, MAX_PAST_JOBS};
use crate::pow::Algorithm;
use crate::util;
use rand::RngCore;
use std::collections::{HashSet, VecDeque};
use std::time::Instant;

/// A job handed to one connection, kept until it ages out of the ring
#[derive(Debug, Clone)]
pub struct ConnJob {
    /// Difficulty assigned to the miner
    pub diff: u64,
    /// Difficulty required to actually mine a block
    pub chain_diff: u64,
    /// The header as it was sent out
    pub block_miner: BlockMiner,
    /// Nonces already submitted against this job
    pub submitted_nonces: HashSet<u64>,
}

/// Connection state shared by all three front-end protocols
#[derive(Debug)]
pub struct ConnData {
    pub wallet: String,
    /// Recent jobs, newest last; capped at MAX_PAST_JOBS
    pub jobs: VecDeque<ConnJob>,
    pub last_share: Instant,
    /// Trust score; negative values force PoW verification
    pub score: i32,
    /// Difficulty the vardiff loop wants for the next job
    pub next_diff: f64,
}

impl ConnData {
    pub fn new(initial_diff: u64) -> Self {
        ConnData {
            wallet: String::new(),
            jobs: VecDeque::with_capacity(MAX_PAST_JOBS),
            last_share: Instant::now(),
            score: 0,
            next_diff: initial_diff as f64,
        }
    }

    pub fn last_job(&self) -> Option<&ConnJob> {
        self.jobs.back()
    }

    pub fn find_job_mut(&mut self, job_id: [u8; 16]) -> Option<&mut ConnJob> {
        self.jobs
            .iter_mut()
            .find(|job| job.block_miner.job_id() == job_id)
    }

    /// Difficulty for the next job, decayed by idle time so that a slow or
    /// returning miner quickly gets solvable work again: after the first
    /// second of silence the value roughly halves every 40 seconds.
    pub fn effective_difficulty(&self, min_difficulty: u64) -> f64 {
        let mut d = self.next_diff;

        let idle = self.last_share.elapsed().as_secs_f64();
        if idle > 1.0 {
            d /= 1.0 + (idle - 1.0) / 40.0;
        }

        if d < min_difficulty as f64 {
            min_difficulty as f64
        } else {
            d
        }
    }

    /// Append a job, evicting the oldest past the ring capacity
    pub fn push_job(&mut self, job: ConnJob) {
        self.jobs.push_back(job);
        while self.jobs.len() > MAX_PAST_JOBS {
            self.jobs.pop_front();
        }
    }

    /// Fold an accepted share into the vardiff EMA. Young connections use
    /// a smaller smoothing constant so their difficulty converges fast.
    pub fn register_accepted_share(&mut self, job_diff: u64, share_target: f64, min_difficulty: u64) {
        self.score += 1;

        let delta = self.last_share.elapsed().as_secs_f64().max(1e-3);
        let hashrate = job_diff as f64 / delta;
        self.last_share = Instant::now();

        let mut wanted = hashrate * share_target;
        if wanted < min_difficulty as f64 {
            wanted = min_difficulty as f64;
        }

        let k: f64 = if (0..5).contains(&self.score) {
            5.0
        } else if self.score < 15 {
            12.0
        } else {
            20.0
        };

        self.next_diff = (self.next_diff * (k - 1.0) + wanted) / k;
    }
}

/// The template most recently received from the daemon
#[derive(Debug, Clone)]
pub struct LastTemplate {
    pub block_miner: BlockMiner,
    pub diff: u64,
    pub height: u64,
    pub algorithm: Algorithm,
}

/// Generate the 32-byte extra nonce of an outgoing job:
/// 16 random job-id bytes, the slave's pool nonce, 8 reserved bytes.
pub fn gen_extra_nonce(pool_nonce: [u8; 8]) -> [u8; 32] {
    let mut extra = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut extra[0..16]);
    extra[16..24].copy_from_slice(&pool_nonce);
    extra
}

/// Stamp a fresh job for one connection and record it in the ring.
/// Returns the assigned difficulty and the header to put on the wire.
pub fn prepare_job(
    cdata: &mut ConnData,
    template: &BlockMiner,
    chain_diff: u64,
    pool_nonce: [u8; 8],
    min_difficulty: u64,
) -> (u64, BlockMiner) {
    let mut diff = cdata.effective_difficulty(min_difficulty) as u64;
    diff = diff.clamp(min_difficulty, MAX_DIFFICULTY).min(chain_diff.max(1));

    let mut block_miner = *template;
    block_miner.set_extra_nonce(gen_extra_nonce(pool_nonce));
    block_miner.set_timestamp(util::now_millis());

    cdata.push_job(ConnJob {
        diff,
        chain_diff,
        block_miner,
        submitted_nonces: HashSet::with_capacity(8),
    });

    (diff, block_miner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn template() -> BlockMiner {
        BlockMiner::new([1u8; 32], [0u8; 32], [2u8; 32])
    }

    #[test]
    fn test_job_ring_eviction() {
        let mut cdata = ConnData::new(1_000);

        let mut first_id = None;
        for i in 0..=MAX_PAST_JOBS {
            let (_, bm) = prepare_job(&mut cdata, &template(), 500_000, [3u8; 8], 1_000);
            if i == 0 {
                first_id = Some(bm.job_id());
            }
        }

        assert_eq!(cdata.jobs.len(), MAX_PAST_JOBS);
        // the very first job aged out of the ring
        assert!(cdata.find_job_mut(first_id.unwrap()).is_none());
    }

    #[test]
    fn test_job_ids_unique_and_pool_nonce_stable() {
        let mut cdata = ConnData::new(1_000);
        let pool_nonce = [0xaa; 8];

        let mut seen = HashSet::new();
        for _ in 0..MAX_PAST_JOBS {
            let (_, bm) = prepare_job(&mut cdata, &template(), 500_000, pool_nonce, 1_000);
            assert_eq!(bm.pool_nonce(), pool_nonce);
            assert!(seen.insert(bm.job_id()), "duplicate job id");
        }
    }

    #[test]
    fn test_assigned_diff_clamped_to_chain() {
        let mut cdata = ConnData::new(1_000_000);
        let (diff, _) = prepare_job(&mut cdata, &template(), 500, [0u8; 8], 100);
        assert_eq!(diff, 500);
    }

    #[test]
    fn test_effective_difficulty_decays_when_idle() {
        let mut cdata = ConnData::new(100_000);
        cdata.next_diff = 100_000.0;

        // fresh connection: no decay yet
        assert_eq!(cdata.effective_difficulty(10) as u64, 100_000);

        cdata.last_share = Instant::now() - Duration::from_secs(40);
        let decayed = cdata.effective_difficulty(10);
        assert!(decayed < 51_000.0 && decayed > 45_000.0, "decayed = {}", decayed);

        // the floor always holds
        cdata.last_share = Instant::now() - Duration::from_secs(100_000);
        assert_eq!(cdata.effective_difficulty(5_000) as u64, 5_000);
    }

    #[test]
    fn test_vardiff_moves_toward_hashrate_target() {
        let mut cdata = ConnData::new(1_000);
        cdata.last_share = Instant::now() - Duration::from_secs(2);

        let before = cdata.next_diff;
        // ~500 H/s with a 10-second share target wants diff ~5000
        cdata.register_accepted_share(1_000, 10.0, 100);
        assert!(cdata.next_diff > before);
        assert_eq!(cdata.score, 1);
    }

    #[test]
    fn test_vardiff_floors_at_min_difficulty() {
        let mut cdata = ConnData::new(1_000);
        cdata.next_diff = 1_000.0;
        cdata.last_share = Instant::now() - Duration::from_secs(3_000);

        for _ in 0..50 {
            cdata.register_accepted_share(1, 0.001, 1_000);
            cdata.last_share = Instant::now() - Duration::from_secs(3_000);
        }
        assert!(cdata.next_diff >= 1_000.0);
    }
}
