// src/dispatch.rs - Master side of the slave channel
use crate::accounting;
use crate::constants::{BLOCK_LOOKUP_DELAY, MASTER_SERVER_HOST};
use crate::error::Result;
use crate::master::MasterContext;
use crate::transport::framed_pair;
use crate::util;
use crate::wire::{MasterMessage, SlaveMessage};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// Accept slaves forever
pub async fn run_master_server(ctx: Arc<MasterContext>) -> Result<()> {
    let listener =
        TcpListener::bind((MASTER_SERVER_HOST, ctx.config.master.port)).await?;
    info!(
        "master server listening on {}:{}",
        MASTER_SERVER_HOST, ctx.config.master.port
    );

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!("slave accept failed: {}", err);
                continue;
            }
        };
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            handle_slave(ctx, stream, peer.to_string()).await;
        });
    }
}

/// One connected slave: frames in, queued frames out. Any framing or
/// decrypt failure tears the connection down and clears the slave's
/// worker count.
async fn handle_slave(ctx: Arc<MasterContext>, stream: TcpStream, peer: String) {
    let conn_id = util::random_u64();
    info!("slave {} connected (id {})", peer, conn_id);

    let key = ctx.config.link_key();
    let (mut reader, mut writer) = framed_pair(stream, &key);

    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    ctx.slaves.write().await.insert(conn_id, tx);

    let writer_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if let Err(err) = writer.send(&payload).await {
                debug!("slave write failed: {}", err);
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    loop {
        match reader.recv().await {
            Ok(payload) => on_message(&ctx, conn_id, &peer, &payload).await,
            Err(err) => {
                warn!("slave {} link failed: {}", peer, err);
                break;
            }
        }
    }

    writer_task.abort();
    ctx.slaves.write().await.remove(&conn_id);
    {
        let mut stats = ctx.stats.write();
        stats.slave_workers.remove(&conn_id);
        stats.recount_workers();
    }
    info!("slave {} disconnected", peer);
}

async fn on_message(ctx: &Arc<MasterContext>, conn_id: u64, peer: &str, payload: &[u8]) {
    let message = match SlaveMessage::decode(payload) {
        Ok(Some(message)) => message,
        Ok(None) => {
            debug!("unknown slave message tag from {}, dropping", peer);
            return;
        }
        Err(err) => {
            warn!("bad slave message from {}: {}", peer, err);
            return;
        }
    };

    match message {
        SlaveMessage::Shares {
            count,
            wallet,
            total_diff,
        } => {
            accounting::on_share_found(ctx, peer, &wallet, total_diff, count);
        }
        SlaveMessage::BlockFound { hash } => {
            let hash = hex::encode(hash);
            info!("found block with hash {}", hash);
            let ctx = Arc::clone(ctx);
            tokio::spawn(async move {
                // give the daemon time to process the block first
                tokio::time::sleep(Duration::from_secs(BLOCK_LOOKUP_DELAY)).await;
                accounting::on_block_found(&ctx, &hash).await;
            });
        }
        SlaveMessage::Stats { workers } => {
            let mut stats = ctx.stats.write();
            stats.slave_workers.insert(conn_id, workers);
            stats.recount_workers();
        }
        SlaveMessage::Ban { ip, ban_end } => {
            info!("relaying ban of {} (ends {}) to all slaves", ip, ban_end);
            let frame = MasterMessage::Ban { ip, ban_end }.encode();
            ctx.broadcast_to_slaves(frame).await;
        }
    }
}
