// src/bin/master.rs - Accounting and payout master
use anyhow::{bail, Context};
use log::{error, info};
use std::sync::Arc;
use xepool::accounting;
use xepool::address::is_address_valid;
use xepool::config::PoolConfig;
use xepool::dispatch;
use xepool::master::MasterContext;
use xepool::payout;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PoolConfig::load_default().context("loading configuration")?;
    xepool::init_logging(config.log_filter());

    info!("{} master v{} starting", xepool::NAME, xepool::VERSION);

    if !is_address_valid(&config.pool_address, &config.address_prefix) {
        bail!("pool address is not valid");
    }
    if !is_address_valid(&config.fee_address, &config.address_prefix) {
        bail!("fee address is not valid");
    }

    let ctx = MasterContext::new(config, "pool.db").context("opening the pool database")?;
    info!("using daemon RPC {}", ctx.config.master.daemon_rpc);

    accounting::database_cleanup(&ctx);

    tokio::spawn(accounting::run_updater(Arc::clone(&ctx)));
    tokio::spawn(accounting::run_stats_rollup(Arc::clone(&ctx)));
    tokio::spawn(payout::run_payout_loop(Arc::clone(&ctx)));

    let server = {
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(err) = dispatch::run_master_server(ctx).await {
                error!("master server failed: {}", err);
            }
        })
    };

    tokio::select! {
        _ = server => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
    Ok(())
}
