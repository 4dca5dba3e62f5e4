// src/upstream.rs - Persistent getwork session to the full node
use crate::blockminer::BlockMiner;
use crate::constants::BLOCKMINER_LENGTH;
use crate::error::{PoolError, Result};
use crate::getwork::GetworkServer;
use crate::job::LastTemplate;
use crate::pow::Algorithm;
use crate::slave::SlaveContext;
use crate::stratum::StratumServer;
use crate::xatum::XatumServer;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Block-template notification pushed by the daemon
#[derive(Debug, Deserialize)]
struct NewJob {
    difficulty: String,
    #[serde(default)]
    height: u64,
    #[serde(alias = "miner_work")]
    template: String,
    #[serde(default = "default_algorithm")]
    algorithm: String,
}

fn default_algorithm() -> String {
    "xel/v1".to_string()
}

#[derive(Debug, Deserialize)]
struct DaemonNotification {
    #[serde(default)]
    new_job: Option<NewJob>,
    #[serde(default)]
    block_rejected: Option<String>,
}

pub struct SubmitRequest {
    pub block_hex: String,
    pub done: oneshot::Sender<Result<()>>,
}

/// Handle used by the share path to submit found blocks over the
/// getwork session
#[derive(Clone)]
pub struct BlockSubmitter {
    tx: mpsc::Sender<SubmitRequest>,
}

impl BlockSubmitter {
    pub fn channel() -> (Self, mpsc::Receiver<SubmitRequest>) {
        let (tx, rx) = mpsc::channel(16);
        (BlockSubmitter { tx }, rx)
    }

    pub async fn submit_block(&self, block_hex: String) -> Result<()> {
        let (done, result) = oneshot::channel();
        self.tx
            .send(SubmitRequest { block_hex, done })
            .await
            .map_err(|_| PoolError::upstream("getwork session is down"))?;
        result
            .await
            .map_err(|_| PoolError::upstream("getwork session dropped the submission"))?
    }
}

/// Run the daemon session forever, reconnecting with a one-second delay.
/// Each new template is stored as the last known job and fanned out to
/// every live miner on all three front-end servers.
pub async fn run_upstream(
    ctx: Arc<SlaveContext>,
    xatum: Arc<XatumServer>,
    getwork: Arc<GetworkServer>,
    stratum: Arc<StratumServer>,
    mut submits: mpsc::Receiver<SubmitRequest>,
) {
    let url = format!(
        "ws://{}/getwork/{}/xepool",
        ctx.config.master.daemon_rpc, ctx.config.pool_address
    );

    loop {
        info!("connecting to daemon getwork: {}", url);

        let mut ws = match connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(err) => {
                warn!("daemon getwork connection failed: {}", err);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        info!("daemon getwork connected");

        loop {
            tokio::select! {
                incoming = ws.next() => {
                    let text = match incoming {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Ping(data))) => {
                            let _ = ws.send(Message::Pong(data)).await;
                            continue;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            warn!("daemon getwork read failed: {}", err);
                            break;
                        }
                        None => {
                            warn!("daemon getwork closed");
                            break;
                        }
                    };
                    handle_daemon_message(&ctx, &xatum, &getwork, &stratum, &text).await;
                }
                submit = submits.recv() => {
                    let Some(SubmitRequest { block_hex, done }) = submit else { return };
                    let msg = serde_json::json!({ "block_template": block_hex }).to_string();
                    let sent = ws
                        .send(Message::Text(msg))
                        .await
                        .map_err(|e| PoolError::upstream(format!("block submission failed: {}", e)));
                    let _ = done.send(sent);
                }
            }
        }

        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

async fn handle_daemon_message(
    ctx: &Arc<SlaveContext>,
    xatum: &Arc<XatumServer>,
    getwork: &Arc<GetworkServer>,
    stratum: &Arc<StratumServer>,
    text: &str,
) {
    if text.trim() == "\"block_accepted\"" {
        info!("daemon accepted our block");
        return;
    }

    let notification: DaemonNotification = match serde_json::from_str(text) {
        Ok(n) => n,
        Err(err) => {
            debug!("unparsed daemon message ({}): {}", err, text);
            return;
        }
    };

    if let Some(reason) = notification.block_rejected {
        error!("daemon rejected our block: {}", reason);
        return;
    }

    let Some(job) = notification.new_job else { return };

    let blob = match hex::decode(&job.template) {
        Ok(blob) => blob,
        Err(err) => {
            warn!("bad template hex from daemon: {}", err);
            return;
        }
    };
    if blob.len() != BLOCKMINER_LENGTH {
        warn!("template is not {} bytes long", BLOCKMINER_LENGTH);
        return;
    }
    let block_miner = match BlockMiner::from_bytes(&blob) {
        Ok(bm) => bm,
        Err(err) => {
            warn!("bad template from daemon: {}", err);
            return;
        }
    };

    let diff: u64 = match job.difficulty.parse() {
        Ok(diff) => diff,
        Err(err) => {
            warn!("bad difficulty from daemon: {}", err);
            return;
        }
    };

    let algorithm = match Algorithm::parse(&job.algorithm) {
        Ok(algo) => algo,
        Err(err) => {
            error!("daemon sent unknown algorithm ({}), keeping v2", err);
            Algorithm::V2
        }
    };

    info!(
        "new job: height {} diff {} algo {}",
        job.height,
        diff,
        algorithm.as_stratum()
    );

    let template = LastTemplate {
        block_miner,
        diff,
        height: job.height,
        algorithm,
    };

    *ctx.template.write().await = Some(template.clone());

    // fan out concurrently; each server walks its own connection list
    let (x, g, s) = (Arc::clone(xatum), Arc::clone(getwork), Arc::clone(stratum));
    let (t1, t2, t3) = (template.clone(), template.clone(), template);
    tokio::spawn(async move { x.broadcast_jobs(&t1).await });
    tokio::spawn(async move { g.broadcast_jobs(&t2).await });
    tokio::spawn(async move { s.broadcast_jobs(&t3).await });
}
