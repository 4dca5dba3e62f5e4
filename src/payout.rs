// src/payout.rs - Threshold-scanned, batched miner payouts
use crate::constants::{
    ASSET, BANNED_ADDRESSES, MAX_WITHDRAW_ATTEMPTS, MAX_WITHDRAW_DESTINATIONS,
    MIN_WITHDRAW_DESTINATIONS, WITHDRAW_INTERVAL,
};
use crate::db::AddrInfo;
use crate::error::Result;
use crate::master::MasterContext;
use crate::rpc::TransferOut;
use crate::stats::Withdrawal;
use crate::util;
use log::{debug, info, warn};
use rocksdb::WriteBatch;
use std::sync::Arc;
use std::time::Duration;

/// Wake up every payout interval and run passes until every payable
/// address was drained (bounded per wakeup)
pub async fn run_payout_loop(ctx: Arc<MasterContext>) {
    loop {
        info!("starting payout loop");
        for _ in 0..MAX_WITHDRAW_ATTEMPTS {
            match withdraw(&ctx).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(err) => {
                    warn!("payout pass failed: {}", err);
                    break;
                }
            }
        }
        info!("payout loop done");

        tokio::time::sleep(Duration::from_secs(WITHDRAW_INTERVAL)).await;
    }
}

/// One payout pass. Collects up to MAX_WITHDRAW_DESTINATIONS payable
/// addresses, asks the wallet to build and broadcast the transaction, and
/// only then commits the zeroed balances — a wallet refusal leaves every
/// balance untouched. Returns true when payable addresses remain.
pub async fn withdraw(ctx: &MasterContext) -> Result<bool> {
    debug!("payout pass");

    let coin = ctx.config.coin();
    let min_balance = (ctx.config.master.min_withdrawal * coin) as u64;
    let fee = (ctx.config.master.withdrawal_fee * coin) as u64;

    let mut destinations: Vec<TransferOut> = Vec::new();
    let mut staged: Vec<(String, AddrInfo)> = Vec::new();
    let mut fee_revenue: u64 = 0;
    let mut unpaid = false;

    for (address, mut info) in ctx.store.all_addr_infos()? {
        if destinations.len() >= MAX_WITHDRAW_DESTINATIONS {
            unpaid = true;
            break;
        }

        if info.balance <= min_balance {
            continue;
        }
        debug!(
            "address {} has payable balance {}",
            address,
            util::to_coins(info.balance, ctx.config.atomic_units)
        );

        // the pool's own rewards and banned wallets pay out to the fee
        // address instead
        let mut destination = address.clone();
        if destination == ctx.config.pool_address {
            warn!("payout destination is the pool address, redirecting to the fee address");
            destination = ctx.config.fee_address.clone();
        }
        if BANNED_ADDRESSES.contains(&destination.as_str()) {
            warn!("payout destination is banned, redirecting to the fee address");
            destination = ctx.config.fee_address.clone();
        }

        if destinations.iter().any(|d| d.destination == destination) {
            debug!("destination {} already in this batch, skipping", destination);
            continue;
        }

        destinations.push(TransferOut {
            amount: info.balance - fee,
            asset: ASSET.to_string(),
            destination,
        });
        fee_revenue += fee;

        info.paid += info.balance;
        info.balance = 0;
        staged.push((address, info));
    }

    if destinations.len() < MIN_WITHDRAW_DESTINATIONS {
        debug!("not enough destinations for a withdrawal");
        return Ok(false);
    }

    info!("transferring to {} destinations", destinations.len());

    // wallet first; balances stay untouched if it refuses
    let built = ctx.wallet.build_transaction(&destinations).await?;

    let network_fee = built.fee;
    info!(
        "payout tx {} network fee {} revenue fee {}",
        built.hash,
        util::to_coins(network_fee, ctx.config.atomic_units),
        util::to_coins(fee_revenue, ctx.config.atomic_units)
    );
    if network_fee >= fee_revenue {
        warn!("network fee exceeds the fee revenue, consider raising withdrawal_fee");
        fee_revenue = 0;
    } else {
        fee_revenue -= network_fee;
    }

    // commit the zeroed balances and the fee-address credit atomically
    let mut batch = WriteBatch::default();

    let fee_address = ctx.config.fee_address.clone();
    let mut fee_info = match staged.iter_mut().find(|(address, _)| *address == fee_address) {
        Some((_, info)) => {
            // the fee address itself was drained in this pass
            info.clone()
        }
        None => ctx.store.addr_info(&fee_address)?,
    };
    fee_info.balance += fee_revenue;

    for (address, info) in &staged {
        if *address != fee_address {
            ctx.store.stage_addr_info(&mut batch, address, info)?;
        }
    }
    ctx.store.stage_addr_info(&mut batch, &fee_address, &fee_info)?;
    ctx.store.write(batch)?;

    {
        let mut stats = ctx.stats.write();
        stats.recent_withdrawals.insert(
            0,
            Withdrawal {
                txid: built.hash,
                timestamp: util::now(),
                destinations,
            },
        );
        stats.recent_withdrawals.truncate(50);
    }

    Ok(unpaid)
}
