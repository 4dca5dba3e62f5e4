// src/accounting.rs - PPLNS share ledger, pending balances and confirmation
use crate::address::is_address_valid;
use crate::constants::{
    ASSET, BANNED_ADDRESSES, DEBT_COMPENSATE_ABOVE, DEBT_RECOVER_BELOW, ORPHAN_GRACE_BLOCKS,
    SAFETY_MARGIN,
};
use crate::db::{PendingTx, StoredShare};
use crate::error::{PoolError, Result};
use crate::master::MasterContext;
use crate::stats::{FoundInfo, LastBlock};
use crate::util;
use log::{debug, error, info, warn};
use rocksdb::WriteBatch;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Current PPLNS window in seconds: the expected block-finding interval of
/// the pool, clamped between twice the block time and one hour. A pool
/// with no measurable hashrate keeps shares for two days.
pub fn pplns_window(net_hashrate: f64, pool_hashrate: f64, block_time: u64) -> u64 {
    if pool_hashrate <= 0.0 || net_hashrate <= 0.0 {
        return 2 * 24 * 3600;
    }

    let interval = net_hashrate / pool_hashrate * block_time as f64;
    let min = (block_time * 2) as f64;

    interval.clamp(min, 3600.0) as u64
}

fn current_window(ctx: &MasterContext) -> u64 {
    let stats = ctx.stats.read();
    pplns_window(stats.net_hashrate, stats.pool_hashrate, ctx.config.block_time)
}

/// Startup sweep of the share ledger
pub fn database_cleanup(ctx: &MasterContext) {
    info!("starting database cleanup");
    let window = current_window(ctx);
    match ctx.store.cleanup_shares(window, util::now()) {
        Ok((removed, kept)) => info!(
            "database cleanup OK, {} outdated shares removed, {} kept",
            removed, kept
        ),
        Err(err) => error!("database cleanup failed: {}", err),
    }
}

/// An aggregated share report arrived from a slave: update the live
/// statistics and append to the PPLNS ledger.
pub fn on_share_found(ctx: &MasterContext, slave: &str, wallet: &str, total_diff: u64, count: u32) {
    let mut wallet = wallet;
    if !is_address_valid(wallet, &ctx.config.address_prefix) {
        warn!(
            "wallet {} is not valid, crediting the fee address instead",
            wallet
        );
        wallet = &ctx.config.fee_address;
    }
    if BANNED_ADDRESSES.contains(&wallet) {
        warn!("slave {}: wallet {} is banned, dropping the share", slave, wallet);
        return;
    }

    {
        let mut stats = ctx.stats.write();
        stats.add_share(wallet, total_diff as f64);
        debug!(
            "slave {}: wallet {} found {} shares with total diff {} (hashrate {})",
            slave,
            wallet,
            count,
            total_diff,
            stats.hashrate(wallet)
        );
    }

    let share = StoredShare {
        wallet: wallet.to_string(),
        diff: total_diff,
        time: util::now(),
    };
    if let Err(err) = ctx.store.append_share(&share) {
        error!("could not persist share: {}", err);
    }
}

/// A slave reported a block: fetch the reward and update the found-block
/// statistics
pub async fn on_block_found(ctx: &MasterContext, hash: &str) {
    let block = match ctx.daemon.get_block_by_hash(hash).await {
        Ok(block) => block,
        Err(err) => {
            error!("could not look up found block {}: {}", hash, err);
            return;
        }
    };
    let reward = block.miner_reward.unwrap_or_else(|| {
        warn!("miner reward is missing on block {}", hash);
        0
    });

    let mut stats = ctx.stats.write();
    stats.last_block = LastBlock {
        height: block.height,
        timestamp: util::now() as i64,
        reward,
        hash: hash.to_string(),
    };

    let effort = if stats.difficulty > 0.0 {
        (stats.hashes / stats.difficulty) as f32
    } else {
        0.0
    };
    stats.blocks_found.insert(
        0,
        FoundInfo {
            height: block.height,
            hash: hash.to_string(),
            effort,
            time: util::now(),
        },
    );
    stats.num_found += 1;
    stats.hashes = 0.0;
    stats.cleanup();
}

/// Scan the wallet for fresh coinbase transfers and turn each into a
/// PendingTx plus per-address pending balances. The ledger scan, balance
/// rewrites and queue update commit in one batch.
pub async fn update_pending_balances(ctx: &MasterContext) -> Result<()> {
    debug!("updating pending balances");

    let mut pending = ctx.store.pending_state()?;

    let min_height = if pending.last_height > SAFETY_MARGIN {
        pending.last_height - SAFETY_MARGIN
    } else {
        let height = ctx.info.read().height;
        height.saturating_sub(SAFETY_MARGIN)
    };

    let mut transfers = ctx
        .wallet
        .list_coinbase_transfers(&ctx.config.pool_address, min_height)
        .await?;
    transfers.sort_by_key(|t| t.topoheight);

    let window = current_window(ctx);
    let now = util::now();
    let current_height = ctx.info.read().height;
    let fee_percent = ctx.config.master.fee_percent;

    let mut batch = WriteBatch::default();
    let mut total_pendings: HashMap<String, u64> = HashMap::new();
    let mut next_height = pending.last_height;
    let mut processed_any = false;

    for transfer in &transfers {
        if transfer.topoheight <= pending.last_height {
            debug!(
                "transfer at height {} already processed (last height {})",
                transfer.topoheight, pending.last_height
            );
            continue;
        }
        let Some(coinbase) = &transfer.coinbase else {
            continue;
        };

        let reward_raw = coinbase.reward;
        let reward_miner = reward_raw as f64 * (100.0 - fee_percent) / 100.0;
        debug!(
            "new coinbase at height {}: reward {} ({} after fee)",
            transfer.topoheight, reward_raw, reward_miner
        );

        // weigh every share inside the PPLNS window, dropping the expired
        let mut total_hashes = 0.0f64;
        let mut per_wallet: HashMap<String, f64> = HashMap::new();

        for (seq, share) in ctx.store.all_shares()? {
            let Some(share) = share else {
                warn!("unreadable share {} removed", seq);
                ctx.store.stage_delete_share(&mut batch, seq)?;
                continue;
            };
            if share.time + window < now {
                ctx.store.stage_delete_share(&mut batch, seq)?;
                continue;
            }
            total_hashes += share.diff as f64;
            *per_wallet.entry(share.wallet).or_insert(0.0) += share.diff as f64;
        }

        let hash_bytes = hex::decode(&transfer.hash)?;
        let block_hash: [u8; 32] = hash_bytes
            .try_into()
            .map_err(|_| PoolError::Upstream("transaction hash is not 32 bytes".to_string()))?;

        let amounts = split_reward(
            reward_raw,
            fee_percent,
            &per_wallet,
            total_hashes,
            &ctx.config.fee_address,
        );
        for (wallet, amount) in &amounts {
            *total_pendings.entry(wallet.clone()).or_insert(0) += amount;
        }

        pending.queue.push(PendingTx {
            unlock_height: transfer.topoheight + ctx.config.master.min_confirmations,
            block_hash,
            amounts,
        });
        processed_any = true;
        if transfer.topoheight > next_height {
            next_height = current_height.max(pending.last_height);
        }
    }

    if !processed_any {
        return Ok(());
    }

    pending.last_height = next_height;

    // pending balances are rewritten from this round's accumulator
    for (wallet, amount) in &total_pendings {
        let mut info = ctx.store.addr_info(wallet)?;
        info.balance_pending = *amount;
        ctx.store.stage_addr_info(&mut batch, wallet, &info)?;
    }

    ctx.store.stage_pending_state(&mut batch, &pending)?;
    ctx.store.write(batch)?;
    Ok(())
}

/// Split one block reward over the weighted wallets of the PPLNS window.
/// Every miner amount is floored; the fee address collects the configured
/// fee plus all rounding dust, so the amounts always sum to the raw
/// reward. With no shares in the window the fee address takes everything.
pub fn split_reward(
    reward_raw: u64,
    fee_percent: f64,
    per_wallet: &HashMap<String, f64>,
    total_hashes: f64,
    fee_address: &str,
) -> std::collections::BTreeMap<String, u64> {
    let reward_miner = reward_raw as f64 * (100.0 - fee_percent) / 100.0;

    let mut amounts = std::collections::BTreeMap::new();
    let mut total_rewarded = 0u64;

    if total_hashes > 0.0 {
        for (wallet, hashes) in per_wallet {
            let amount = (hashes * reward_miner / total_hashes) as u64;
            amounts.insert(wallet.clone(), amount);
            total_rewarded += amount;
        }
    }

    let fee_amount = reward_raw.saturating_sub(total_rewarded);
    *amounts.entry(fee_address.to_string()).or_insert(0) += fee_amount;
    amounts
}

/// Pool liabilities minus the wallet balance, in whole coins. Positive
/// debt means the pool owes miners more than the wallet holds.
async fn current_debt(ctx: &MasterContext) -> Result<f64> {
    let mut liabilities: u64 = 0;
    for (_, info) in ctx.store.all_addr_infos()? {
        liabilities = liabilities
            .saturating_add(info.balance)
            .saturating_add(info.balance_pending);
    }

    let wallet_balance = ctx.wallet.get_balance(ASSET).await?;
    Ok((liabilities as f64 - wallet_balance as f64) / ctx.config.coin())
}

/// Scale factor applied to a matured reward: never overpay a side block,
/// and lean against accumulated debt in either direction.
pub fn confirmation_multiplier(miner_reward: u64, pending_total: u64, debt: f64) -> f64 {
    let mut multiplier = if pending_total == 0 {
        1.0
    } else {
        (miner_reward as f64 / pending_total as f64).min(1.0)
    };

    if debt > DEBT_COMPENSATE_ABOVE {
        error!("pool has debt to miners ({:.2} coins), paying 2x to compensate", debt);
        multiplier *= 2.0;
    } else if debt < DEBT_RECOVER_BELOW {
        error!("miners have debt to the pool ({:.2} coins), paying 0.5x", debt);
        multiplier *= 0.5;
    }
    multiplier
}

/// Check the head of the pending queue against the chain and credit the
/// matured reward to confirmed balances. Returns true when balances moved.
pub async fn check_confirmations(ctx: &MasterContext) -> Result<bool> {
    let mut pending = ctx.store.pending_state()?;
    let Some(head) = pending.queue.first().cloned() else {
        return Ok(false);
    };

    let current_height = ctx.info.read().height;
    if current_height < head.unlock_height {
        debug!(
            "head of pending queue confirms in {} blocks",
            head.unlock_height - current_height
        );
        return Ok(false);
    }

    let hash = hex::encode(head.block_hash);
    let block = match ctx.daemon.get_block_by_hash(&hash).await {
        Ok(block) => Some(block),
        Err(err) => {
            warn!("could not fetch pending block {}: {}", hash, err);
            if head.unlock_height + ORPHAN_GRACE_BLOCKS < current_height {
                warn!("block is long overdue, accounting it as orphaned");
                None
            } else {
                // wait for the daemon to catch up
                return Ok(false);
            }
        }
    };

    let mut batch = WriteBatch::default();

    let credited = match block {
        None => false,
        Some(block) if block.block_type.eq_ignore_ascii_case("orphaned") => {
            warn!("block reward {} is orphaned, removing it", hash);
            false
        }
        Some(block) => {
            let miner_reward = block.miner_reward.ok_or_else(|| {
                PoolError::Upstream(format!("block {} has no miner reward", hash))
            })?;

            let debt = match current_debt(ctx).await {
                Ok(debt) => debt,
                Err(err) => {
                    warn!("could not compute debt, assuming none: {}", err);
                    0.0
                }
            };
            info!("pending block debt: {:.3}", debt);

            let multiplier = confirmation_multiplier(miner_reward, head.total_amount(), debt);
            info!("pending block multiplier: {:.4}", multiplier);

            for (address, amount) in &head.amounts {
                let mut info = ctx.store.addr_info(address)?;
                info.balance += (*amount as f64 * multiplier) as u64;

                if BANNED_ADDRESSES.contains(&address.as_str()) {
                    warn!("address {} is banned, zeroing its balances", address);
                    info.balance = 0;
                    info.balance_pending = 0;
                }
                ctx.store.stage_addr_info(&mut batch, address, &info)?;
            }
            true
        }
    };

    pending.queue.remove(0);
    ctx.store.stage_pending_state(&mut batch, &pending)?;
    ctx.store.write(batch)?;
    Ok(credited)
}

/// Poll the daemon for the chain tip every few seconds; each new height
/// refreshes the hashrate estimate and drives pending-balance accounting
/// and the confirmation sweep.
pub async fn run_updater(ctx: Arc<MasterContext>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(5));
    loop {
        ticker.tick().await;

        let node_info = match ctx.daemon.get_info().await {
            Ok(node_info) => node_info,
            Err(err) => {
                warn!("daemon get_info failed: {}", err);
                continue;
            }
        };

        let new_height = {
            let mut info = ctx.info.write();
            if node_info.topoheight == info.height {
                false
            } else {
                info!("new height {} -> {}", info.height, node_info.topoheight);
                info.height = node_info.topoheight;
                true
            }
        };

        if new_height {
            match node_info.difficulty.parse::<f64>() {
                Ok(difficulty) => {
                    let mut stats = ctx.stats.write();
                    if difficulty <= 0.0 {
                        stats.net_hashrate = 0.0;
                    } else {
                        // smooth the estimate, but track step changes at once
                        let next = difficulty / ctx.config.block_time as f64;
                        if next / 2.0 > stats.net_hashrate || next * 2.0 < stats.net_hashrate {
                            stats.net_hashrate = next;
                        } else {
                            stats.net_hashrate = (stats.net_hashrate * 4.0 + next) / 5.0;
                        }
                    }
                    if !stats.net_hashrate.is_finite() {
                        stats.net_hashrate = 0.0;
                    }
                    stats.difficulty = stats.net_hashrate * ctx.config.block_time as f64;
                }
                Err(err) => warn!("bad difficulty from daemon: {}", err),
            }

            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move {
                if let Err(err) = update_pending_balances(&ctx).await {
                    warn!("pending balance update failed: {}", err);
                }
                match check_confirmations(&ctx).await {
                    Ok(true) => info!("confirmation sweep updated balances"),
                    Ok(false) => debug!("confirmation sweep made no changes"),
                    Err(err) => warn!("confirmation sweep failed: {}", err),
                }
            });
        }

        // refresh the expected block reward
        match ctx.daemon.get_top_block().await {
            Ok(top) => {
                if let Some(reward) = top.miner_reward {
                    ctx.info.write().block_reward = reward;
                } else {
                    warn!("top block has no miner reward");
                }
            }
            Err(err) => debug!("get_top_block failed: {}", err),
        }
    }
}

/// Periodic statistics rollup
pub async fn run_stats_rollup(ctx: Arc<MasterContext>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        let mut stats = ctx.stats.write();
        if stats.rollup_due() {
            stats.rollup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pplns_window_clamps() {
        let block_time = 15;

        // pool finds blocks rarely: capped at one hour
        assert_eq!(pplns_window(1_000_000.0, 10.0, block_time), 3600);

        // pool dominates the network: floored at two block times
        assert_eq!(pplns_window(1_000.0, 1_000_000.0, block_time), 30);

        // in between, the window is the expected block interval
        let window = pplns_window(100_000.0, 1_000.0, block_time);
        assert_eq!(window, 1500);
    }

    #[test]
    fn test_pplns_window_degenerate_hashrate() {
        assert_eq!(pplns_window(1_000.0, 0.0, 15), 2 * 24 * 3600);
        assert_eq!(pplns_window(0.0, 1_000.0, 15), 2 * 24 * 3600);
    }

    #[test]
    fn test_confirmation_multiplier_caps_at_one() {
        // reward covers the pending amounts: no scaling
        assert_eq!(confirmation_multiplier(1_000, 500, 0.0), 1.0);
        // side block with a smaller reward scales down
        assert_eq!(confirmation_multiplier(500, 1_000, 0.0), 0.5);
    }

    #[test]
    fn test_confirmation_multiplier_debt_compensation() {
        // debt of 60 whole coins doubles the payout
        assert_eq!(confirmation_multiplier(1_000, 1_000, 60.0), 2.0);
        // debt of -20 halves it
        assert_eq!(confirmation_multiplier(1_000, 1_000, -20.0), 0.5);
        // small debt changes nothing
        assert_eq!(confirmation_multiplier(1_000, 1_000, 10.0), 1.0);
        assert_eq!(confirmation_multiplier(1_000, 1_000, -5.0), 1.0);
    }
}
