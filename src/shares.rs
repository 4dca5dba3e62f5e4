// src/shares.rs - Share validation shared by all three miner protocols
//
// Validation order matters: cheap structural checks first, the CPU-heavy
// PoW verification last, and only when the trust score demands it.
use crate::blockminer::BlockMiner;
use crate::constants::{SUBMIT_RETRY_DELAY, TIMESTAMP_FUTURE_LIMIT};
use crate::difficulty::check_diff;
use crate::job::ConnData;
use crate::pow::Algorithm;
use crate::rate_limit::action;
use crate::slave::SlaveContext;
use crate::util;
use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::RwLock;

/// `print` severity levels of the miner-facing protocols
pub const LVL_VERBOSE: u8 = 0;
pub const LVL_INFO: u8 = 1;
pub const LVL_WARN: u8 = 2;
pub const LVL_ERROR: u8 = 3;

/// Reply rendered by each protocol in its own framing
#[derive(Debug, Clone, PartialEq)]
pub struct ShareReply {
    pub msg: String,
    pub lvl: u8,
}

impl ShareReply {
    pub fn accepted() -> Self {
        ShareReply {
            msg: "share accepted".to_string(),
            lvl: LVL_INFO,
        }
    }

    pub fn error(msg: &str) -> Self {
        ShareReply {
            msg: msg.to_string(),
            lvl: LVL_ERROR,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.lvl == LVL_INFO
    }
}

/// Result of one submission
#[derive(Debug)]
pub struct SubmitOutcome {
    pub reply: ShareReply,
    /// Close the connection after replying
    pub kick: bool,
    /// The vardiff target drifted far from the live job; push a fresh one
    pub resend_job: bool,
}

impl SubmitOutcome {
    fn reject(msg: &str, kick: bool) -> Self {
        SubmitOutcome {
            reply: ShareReply::error(msg),
            kick,
            resend_job: false,
        }
    }
}

/// Validate one submitted header and run every side effect of acceptance:
/// trust/vardiff updates, upstream share aggregation and block submission.
///
/// `claimed_hash` is the PoW hash the miner reported, if any; `miner_id`
/// is the Stratum per-connection id written back into the job-id field
/// before the header goes to the daemon.
pub async fn process_submit(
    ctx: &SlaveContext,
    cdata: &RwLock<ConnData>,
    ip: &str,
    mut bm: BlockMiner,
    claimed_hash: Option<[u8; 32]>,
    miner_id: Option<[u8; 16]>,
) -> SubmitOutcome {
    if !ctx.limiter.can_do_action(ip, action::SHARE_SUBMIT) {
        return SubmitOutcome::reject("too many submit packets", true);
    }

    if bm.pool_nonce() != ctx.pool_nonce {
        warn!(
            "{}: invalid pool nonce, expected {}, got {}",
            ip,
            hex::encode(ctx.pool_nonce),
            hex::encode(bm.pool_nonce())
        );
        return SubmitOutcome::reject("invalid pool nonce", true);
    }

    if bm.job_id() == [0u8; 16] {
        warn!("{}: blank job id in extra nonce", ip);
        return SubmitOutcome::reject("blank extra nonce", true);
    }

    // resolve the job and run the structural checks under the writer
    let (job_diff, chain_diff) = {
        let mut data = cdata.write().await;

        let position = data
            .jobs
            .iter()
            .position(|job| job.block_miner.job_id() == bm.job_id());
        let Some(position) = position else {
            debug!("{}: stale share, job id {}", ip, hex::encode(bm.job_id()));
            data.last_share = std::time::Instant::now();
            return SubmitOutcome::reject("stale share", false);
        };
        let job = &mut data.jobs[position];

        if bm.work_hash() != job.block_miner.work_hash()
            || bm.public_key() != job.block_miner.public_key()
        {
            warn!("{}: submitted header binds to the wrong template", ip);
            return SubmitOutcome::reject("invalid work hash or public key", false);
        }

        if !job.submitted_nonces.insert(bm.nonce()) {
            return SubmitOutcome::reject("duplicate nonce", false);
        }

        let now_ms = util::now_millis();
        if bm.timestamp() < job.block_miner.timestamp()
            || bm.timestamp() > now_ms + TIMESTAMP_FUTURE_LIMIT * 1000
        {
            warn!(
                "{}: timestamp {} out of window (now {})",
                ip,
                bm.timestamp(),
                now_ms
            );
            return SubmitOutcome::reject(
                "timestamp is too far in the past or future, check that your clock is synchronized",
                true,
            );
        }

        (job.diff, job.chain_diff)
    };

    // from here the header may reach the daemon: restore the id the
    // daemon-side job was issued under
    if let Some(id) = miner_id {
        bm.set_job_id(id);
    }

    let algorithm = ctx
        .template
        .read()
        .await
        .as_ref()
        .map(|t| t.algorithm)
        .unwrap_or(Algorithm::V2);

    // trust-scored PoW verification
    let force_check = claimed_hash.is_none();
    let mut pow = [0u8; 32];

    if let Some(claimed) = claimed_hash {
        pow = claimed;
    } else {
        debug!("no claimed pow hash, forcing verification");
        match verify_pow(ctx, bm, algorithm, true).await {
            Some(computed) => pow = computed,
            None => return SubmitOutcome::reject("verification unavailable", false),
        }
    }

    if pow == [0u8; 32] {
        return SubmitOutcome::reject("blank pow hash", false);
    }

    if !check_diff(&pow, job_diff) {
        warn!("{}: hash does not meet target (forced: {})", ip, force_check);
        if force_check {
            let mut data = cdata.write().await;
            data.score = -ctx.config.slave.trust_score;
            drop(data);
            ctx.limiter.can_do_action(ip, action::INVALID_POW);
            return SubmitOutcome::reject("share does not meet difficulty", false);
        }
        // the miner claimed a hash we did not verify; treat like the
        // original does and swallow the share without penalty
        return SubmitOutcome {
            reply: ShareReply::accepted(),
            kick: false,
            resend_job: false,
        };
    }

    let finds_block = check_diff(&pow, chain_diff);

    if !force_check {
        let score = cdata.read().await.score;
        let mandatory = finds_block || score < ctx.config.slave.trust_score;
        let sampled = util::random_float() * 100.0 < ctx.config.slave.trusted_check_chance;

        if mandatory || sampled {
            if let Some(computed) = verify_pow(ctx, bm, algorithm, mandatory).await {
                if computed != pow {
                    warn!(
                        "{}: invalid pow hash {}, expected {}",
                        ip,
                        hex::encode(pow),
                        hex::encode(computed)
                    );
                    let mut data = cdata.write().await;
                    data.score = -ctx.config.slave.trust_score;
                    drop(data);
                    ctx.limiter.can_do_action(ip, action::INVALID_POW);
                    return SubmitOutcome::reject("invalid pow hash", false);
                }
            }
        } else {
            debug!("skipping pow check (trust score {})", score);
        }
    }

    // share is valid
    let (wallet, resend_job) = {
        let mut data = cdata.write().await;
        data.register_accepted_share(
            job_diff,
            ctx.config.slave.share_target,
            ctx.config.slave.min_difficulty,
        );

        let resend = match data.last_job() {
            Some(last) => {
                data.next_diff > last.diff as f64 * 4.0 || data.next_diff < last.diff as f64 * 0.5
            }
            None => false,
        };
        (data.wallet.clone(), resend)
    };

    ctx.link.record_share(&wallet, job_diff);

    if finds_block {
        submit_found_block(ctx, bm).await;
    }

    SubmitOutcome {
        reply: ShareReply::accepted(),
        kick: false,
        resend_job,
    }
}

/// Run the PoW hash on the bounded blocking pool. A mandatory check waits
/// for a slot; the sampled trust recheck is skipped when the pool is
/// saturated so it never backs up the I/O tasks.
async fn verify_pow(
    ctx: &SlaveContext,
    bm: BlockMiner,
    algorithm: Algorithm,
    mandatory: bool,
) -> Option<[u8; 32]> {
    let _permit = if mandatory {
        ctx.pow_checks.acquire().await.ok()?
    } else {
        match ctx.pow_checks.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                debug!("pow pool saturated, skipping sampled recheck");
                return None;
            }
        }
    };

    let started = std::time::Instant::now();
    let hash = tokio::task::spawn_blocking(move || bm.pow_hash(algorithm))
        .await
        .ok()?;
    debug!("pow verified in {:?}", started.elapsed());
    Some(hash)
}

/// Submit a block-winning header to the daemon, retrying once, and tell
/// the master about it
async fn submit_found_block(ctx: &SlaveContext, bm: BlockMiner) {
    let block_hex = hex::encode(bm.as_bytes());
    info!("BLOCK FOUND");
    info!("found block {}", hex::encode(bm.hash()));

    if let Err(err) = ctx.submitter.submit_block(block_hex.clone()).await {
        warn!("failed to submit block: {}", err);

        let submitter = ctx.submitter.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(SUBMIT_RETRY_DELAY)).await;
            match submitter.submit_block(block_hex).await {
                Ok(()) => info!("block resubmission succeeded"),
                Err(err) => warn!("block resubmission failed: {}", err),
            }
        });
        return;
    }

    ctx.link.send_block_found(bm.hash());
}
