// tests/share_flow_test.rs - End-to-end share validation scenarios
use std::sync::Arc;
use tokio::sync::RwLock;
use xepool::blockminer::BlockMiner;
use xepool::config::PoolConfig;
use xepool::difficulty::check_diff;
use xepool::job::{prepare_job, ConnData, LastTemplate};
use xepool::pow::Algorithm;
use xepool::rate_limit::RateLimiter;
use xepool::shares::{process_submit, LVL_ERROR};
use xepool::slave::SlaveContext;
use xepool::slave_link::SlaveLink;
use xepool::upstream::BlockSubmitter;

const ALGO: Algorithm = Algorithm::V2;

fn test_config() -> PoolConfig {
    let mut config = PoolConfig::default();
    config.master_pass = "test-secret".to_string();
    config.slave.min_difficulty = 1;
    config.slave.initial_difficulty = 1;
    config.slave.share_target = 10.0;
    config.slave.trust_score = 20;
    // keep verification deterministic in tests
    config.slave.trusted_check_chance = 0.0;
    config
}

/// Build a context plus a channel that answers every block submission
async fn make_ctx() -> (
    Arc<SlaveContext>,
    tokio::sync::mpsc::UnboundedReceiver<String>,
) {
    let config = test_config();
    let limiter = Arc::new(RateLimiter::new());
    // the link dials a dead port; queued messages are simply dropped
    let link = SlaveLink::start(
        "127.0.0.1:1".to_string(),
        config.link_key(),
        Arc::clone(&limiter),
    );

    let (submitter, mut submit_rx) = BlockSubmitter::channel();
    let (found_tx, found_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Some(request) = submit_rx.recv().await {
            let _ = found_tx.send(request.block_hex);
            let _ = request.done.send(Ok(()));
        }
    });

    let ctx = SlaveContext::new(config, limiter, link, submitter);
    (ctx, found_rx)
}

async fn install_template(ctx: &SlaveContext, chain_diff: u64) -> LastTemplate {
    let template = LastTemplate {
        block_miner: BlockMiner::new([7u8; 32], [0u8; 32], [9u8; 32]),
        diff: chain_diff,
        height: 100,
        algorithm: ALGO,
    };
    *ctx.template.write().await = Some(template.clone());
    template
}

/// Grind nonces until the header satisfies `diff`
fn mine(bm: &mut BlockMiner, diff: u64) -> [u8; 32] {
    for nonce in 0u64..1_000_000 {
        bm.set_nonce(nonce);
        let hash = bm.pow_hash(ALGO);
        if check_diff(&hash, diff) {
            return hash;
        }
    }
    panic!("could not find a share at difficulty {}", diff);
}

#[tokio::test]
async fn test_happy_share_moves_vardiff() {
    let (ctx, _) = make_ctx().await;
    let template = install_template(&ctx, 1_000_000_000).await;

    let cdata = RwLock::new(ConnData::new(1));
    cdata.write().await.wallet = "xel1miner".to_string();

    let (diff, job_bm) = {
        let mut data = cdata.write().await;
        prepare_job(&mut data, &template.block_miner, template.diff, ctx.pool_nonce, 1)
    };
    assert_eq!(diff, 1);

    let mut share = job_bm;
    let hash = mine(&mut share, diff);

    let outcome = process_submit(&ctx, &cdata, "10.0.0.1", share, Some(hash), None).await;
    assert!(outcome.reply.is_accepted(), "reply: {:?}", outcome.reply);
    assert!(!outcome.kick);

    let data = cdata.read().await;
    assert_eq!(data.score, 1);
    assert_eq!(data.jobs.back().unwrap().submitted_nonces.len(), 1);
}

#[tokio::test]
async fn test_block_find_submits_to_daemon() {
    let (ctx, mut found_rx) = make_ctx().await;
    // chain difficulty low enough to find a real block in the test
    let template = install_template(&ctx, 3).await;

    let cdata = RwLock::new(ConnData::new(1));
    cdata.write().await.wallet = "xel1miner".to_string();

    let (_, job_bm) = {
        let mut data = cdata.write().await;
        prepare_job(&mut data, &template.block_miner, template.diff, ctx.pool_nonce, 1)
    };

    let mut share = job_bm;
    let hash = mine(&mut share, 3);

    let outcome = process_submit(&ctx, &cdata, "10.0.0.1", share, Some(hash), None).await;
    assert!(outcome.reply.is_accepted());

    let submitted = found_rx.recv().await.expect("a block must be submitted");
    assert_eq!(submitted, hex::encode(share.as_bytes()));
}

#[tokio::test]
async fn test_stale_share_after_eviction() {
    let (ctx, _) = make_ctx().await;
    let template = install_template(&ctx, 1_000_000_000).await;

    let cdata = RwLock::new(ConnData::new(1));
    cdata.write().await.wallet = "xel1miner".to_string();

    // seven jobs: the first one ages out of the six-slot ring
    let mut first_job = None;
    for i in 0..7 {
        let mut data = cdata.write().await;
        let (_, bm) =
            prepare_job(&mut data, &template.block_miner, template.diff, ctx.pool_nonce, 1);
        if i == 0 {
            first_job = Some(bm);
        }
    }

    let mut share = first_job.unwrap();
    let hash = mine(&mut share, 1);

    let outcome = process_submit(&ctx, &cdata, "10.0.0.1", share, Some(hash), None).await;
    assert_eq!(outcome.reply.msg, "stale share");
    assert_eq!(outcome.reply.lvl, LVL_ERROR);
    assert!(!outcome.kick, "stale shares must not kick the connection");
}

#[tokio::test]
async fn test_duplicate_nonce_rejected() {
    let (ctx, _) = make_ctx().await;
    let template = install_template(&ctx, 1_000_000_000).await;

    let cdata = RwLock::new(ConnData::new(1));
    cdata.write().await.wallet = "xel1miner".to_string();

    let (diff, job_bm) = {
        let mut data = cdata.write().await;
        prepare_job(&mut data, &template.block_miner, template.diff, ctx.pool_nonce, 1)
    };

    let mut share = job_bm;
    let hash = mine(&mut share, diff);

    let first = process_submit(&ctx, &cdata, "10.0.0.1", share, Some(hash), None).await;
    assert!(first.reply.is_accepted());

    let second = process_submit(&ctx, &cdata, "10.0.0.1", share, Some(hash), None).await;
    assert_eq!(second.reply.msg, "duplicate nonce");
    assert!(!second.kick);
}

#[tokio::test]
async fn test_wrong_pool_nonce_kicks() {
    let (ctx, _) = make_ctx().await;
    let template = install_template(&ctx, 1_000_000_000).await;

    let cdata = RwLock::new(ConnData::new(1));
    let (_, job_bm) = {
        let mut data = cdata.write().await;
        prepare_job(&mut data, &template.block_miner, template.diff, ctx.pool_nonce, 1)
    };

    let mut share = job_bm;
    let mut wrong = ctx.pool_nonce;
    wrong[0] ^= 0xff;
    share.set_pool_nonce(wrong);

    let outcome = process_submit(&ctx, &cdata, "10.0.0.1", share, None, None).await;
    assert_eq!(outcome.reply.msg, "invalid pool nonce");
    assert!(outcome.kick, "a foreign pool nonce must kick");
}

#[tokio::test]
async fn test_rewound_timestamp_kicks() {
    let (ctx, _) = make_ctx().await;
    let template = install_template(&ctx, 1_000_000_000).await;

    let cdata = RwLock::new(ConnData::new(1));
    let (_, job_bm) = {
        let mut data = cdata.write().await;
        prepare_job(&mut data, &template.block_miner, template.diff, ctx.pool_nonce, 1)
    };

    let mut share = job_bm;
    share.set_timestamp(job_bm.timestamp() - 10_000);

    let outcome = process_submit(&ctx, &cdata, "10.0.0.1", share, None, None).await;
    assert!(outcome.kick, "a rewound timestamp must kick");
    assert_eq!(outcome.reply.lvl, LVL_ERROR);
}

#[tokio::test]
async fn test_claimed_hash_mismatch_resets_trust() {
    let (ctx, _) = make_ctx().await;
    let template = install_template(&ctx, 1_000_000_000).await;

    let cdata = RwLock::new(ConnData::new(1));
    cdata.write().await.wallet = "xel1miner".to_string();

    let (_, job_bm) = {
        let mut data = cdata.write().await;
        prepare_job(&mut data, &template.block_miner, template.diff, ctx.pool_nonce, 1)
    };

    // a tiny claimed hash passes any target but cannot match the recompute
    let mut forged = [0u8; 32];
    forged[31] = 1;

    let outcome = process_submit(&ctx, &cdata, "10.0.0.1", job_bm, Some(forged), None).await;
    assert_eq!(outcome.reply.msg, "invalid pow hash");
    assert!(!outcome.kick);

    let data = cdata.read().await;
    assert_eq!(data.score, -ctx.config.slave.trust_score);
}
