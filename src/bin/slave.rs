// src/bin/slave.rs - Miner-facing slave server
use anyhow::Context;
use log::{error, info};
use std::sync::Arc;
use std::time::Duration;
use xepool::config::PoolConfig;
use xepool::constants::STATS_SEND_INTERVAL;
use xepool::getwork::GetworkServer;
use xepool::rate_limit::RateLimiter;
use xepool::slave::SlaveContext;
use xepool::slave_link::SlaveLink;
use xepool::stratum::StratumServer;
use xepool::upstream::{self, BlockSubmitter};
use xepool::xatum::XatumServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = PoolConfig::load_default().context("loading configuration")?;
    xepool::init_logging(config.log_filter());

    info!("{} slave v{} starting", xepool::NAME, xepool::VERSION);

    let limiter = Arc::new(RateLimiter::new());
    Arc::clone(&limiter).start_reset_task();

    let link = SlaveLink::start(
        config.slave.master_address.clone(),
        config.link_key(),
        Arc::clone(&limiter),
    );

    let (submitter, submit_rx) = BlockSubmitter::channel();
    let ctx = SlaveContext::new(config, limiter, link, submitter);

    let xatum = XatumServer::new(Arc::clone(&ctx));
    let getwork = GetworkServer::new(Arc::clone(&ctx));
    let stratum = StratumServer::new(Arc::clone(&ctx));

    tokio::spawn(upstream::run_upstream(
        Arc::clone(&ctx),
        Arc::clone(&xatum),
        Arc::clone(&getwork),
        Arc::clone(&stratum),
        submit_rx,
    ));

    // periodic worker-count reports to the master
    {
        let ctx = Arc::clone(&ctx);
        let (xatum, getwork, stratum) = (
            Arc::clone(&xatum),
            Arc::clone(&getwork),
            Arc::clone(&stratum),
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(STATS_SEND_INTERVAL));
            loop {
                ticker.tick().await;
                let workers = xatum.connection_count().await
                    + getwork.connection_count().await
                    + stratum.connection_count().await;
                ctx.link.send_stats(workers as u32);
            }
        });
    }

    {
        let getwork = Arc::clone(&getwork);
        tokio::spawn(async move { getwork.run().await });
    }
    {
        let stratum = Arc::clone(&stratum);
        tokio::spawn(async move {
            if let Err(err) = stratum.run().await {
                error!("stratum server failed: {}", err);
            }
        });
    }

    let xatum_task = {
        let xatum = Arc::clone(&xatum);
        tokio::spawn(async move {
            if let Err(err) = xatum.run().await {
                error!("xatum server failed: {}", err);
            }
        })
    };

    tokio::select! {
        _ = xatum_task => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }
    Ok(())
}
