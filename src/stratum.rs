// src/stratum.rs - Stratum miner protocol: newline-framed JSON-RPC over TCP
use crate::address::{is_address_valid, parse_login};
use crate::blockminer::BlockMiner;
use crate::constants::{
    HANDSHAKE_TIMEOUT, IDLE_SHARE_TIMEOUT, MAX_REQUEST_SIZE, MINER_TIMEOUT, PING_MARGIN,
};
use crate::job::{prepare_job, ConnData, LastTemplate};
use crate::rate_limit::{action, BAN_DURATION};
use crate::shares;
use crate::slave::SlaveContext;
use crate::util;
use futures::StreamExt;
use log::{debug, info, warn};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_util::codec::{FramedRead, LinesCodec};

/// Stale-job and generic rejection codes of the protocol
const ERR_REJECTED: i32 = 20;
const ERR_STALE: i32 = 21;

#[derive(Debug, Deserialize)]
pub struct RequestIn {
    #[serde(default)]
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Serialize)]
pub struct RequestOut {
    pub id: u64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
pub struct StratumError {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ResponseOut {
    pub id: u64,
    pub result: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StratumError>,
}

pub struct StratumConn {
    pub id: u64,
    pub ip: String,
    /// Per-connection id reported as the extra nonce on subscribe and
    /// written back into submitted headers
    pub miner_id: [u8; 16],
    last_out_id: AtomicU64,
    writer: Mutex<OwnedWriteHalf>,
    pub data: RwLock<ConnData>,
}

impl StratumConn {
    async fn write_json<T: Serialize>(&self, value: &T) -> bool {
        let mut line = match serde_json::to_string(value) {
            Ok(line) => line,
            Err(err) => {
                warn!("stratum serialization failed: {}", err);
                return false;
            }
        };
        debug!("stratum >>> {}", line);
        line.push('\n');
        self.writer
            .lock()
            .await
            .write_all(line.as_bytes())
            .await
            .is_ok()
    }

    async fn respond(&self, id: u64, result: serde_json::Value) -> bool {
        self.write_json(&ResponseOut {
            id,
            result,
            error: None,
        })
        .await
    }

    async fn respond_error(&self, id: u64, code: i32, message: &str) -> bool {
        self.write_json(&ResponseOut {
            id,
            result: json!(false),
            error: Some(StratumError {
                code,
                message: message.to_string(),
            }),
        })
        .await
    }

    async fn request(&self, method: &'static str, params: Option<serde_json::Value>) -> bool {
        let id = self.last_out_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.write_json(&RequestOut { id, method, params }).await
    }

    /// Push a difficulty update and a fresh job
    pub async fn send_job(&self, template: &LastTemplate, pool_nonce: [u8; 8], min_diff: u64) {
        let (diff, bm) = {
            let mut data = self.data.write().await;
            prepare_job(
                &mut data,
                &template.block_miner,
                template.diff,
                pool_nonce,
                min_diff,
            )
        };

        self.request("mining.set_difficulty", Some(json!([diff]))).await;
        let sent = self
            .request(
                "mining.notify",
                Some(json!([
                    hex::encode(bm.job_id()),
                    format!("{:x}", bm.timestamp()),
                    hex::encode(bm.work_hash()),
                    "xel/0",
                    true,
                ])),
            )
            .await;
        if !sent {
            warn!("cannot send job to stratum miner {}", self.ip);
            self.shutdown().await;
        }
    }

    async fn shutdown(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}

pub struct StratumServer {
    ctx: Arc<SlaveContext>,
    conns: RwLock<HashMap<u64, Arc<StratumConn>>>,
}

impl StratumServer {
    pub fn new(ctx: Arc<SlaveContext>) -> Arc<Self> {
        Arc::new(StratumServer {
            ctx,
            conns: RwLock::new(HashMap::new()),
        })
    }

    pub async fn connection_count(&self) -> usize {
        self.conns.read().await.len()
    }

    pub async fn run(self: Arc<Self>) -> crate::error::Result<()> {
        let port = self.ctx.config.slave.stratum_port;
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("stratum server listening on port {}", port);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("stratum accept failed: {}", err);
                    continue;
                }
            };
            let ip = peer.ip().to_string();

            if !self.ctx.limiter.can_do_action(&ip, action::CONNECT) {
                debug!("stratum miner {} connect rate limited", ip);
                continue;
            }
            if !self.ctx.limiter.can_connect(&ip) {
                debug!("stratum miner {} has too many open connections", ip);
                continue;
            }

            let server = Arc::clone(&self);
            tokio::spawn(async move { server.handle_conn(stream, ip).await });
        }
    }

    async fn handle_conn(self: Arc<Self>, stream: TcpStream, ip: String) {
        let (read_half, write_half) = stream.into_split();

        let mut miner_id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut miner_id);

        let conn = Arc::new(StratumConn {
            id: util::random_u64(),
            ip: ip.clone(),
            miner_id,
            last_out_id: AtomicU64::new(0),
            writer: Mutex::new(write_half),
            data: RwLock::new(ConnData::new(self.ctx.config.slave.initial_difficulty)),
        });
        debug!("stratum miner {} has miner id {}", ip, hex::encode(miner_id));

        self.conns.write().await.insert(conn.id, Arc::clone(&conn));

        let pinger = spawn_pinger(Arc::clone(&conn));

        let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_REQUEST_SIZE));
        let mut messages: u64 = 0;

        loop {
            let deadline = if messages < 2 {
                Duration::from_secs(HANDSHAKE_TIMEOUT)
            } else {
                Duration::from_secs(MINER_TIMEOUT)
            };

            let line = match tokio::time::timeout(deadline, lines.next()).await {
                Ok(Some(Ok(line))) => line,
                Ok(Some(Err(err))) => {
                    debug!("stratum read error from {}: {}", ip, err);
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    debug!("stratum miner {} timed out", ip);
                    break;
                }
            };
            messages += 1;
            debug!("stratum <<< {}", line);

            let request: RequestIn = match serde_json::from_str(&line) {
                Ok(request) => request,
                Err(err) => {
                    warn!("bad stratum request from {}: {}", ip, err);
                    break;
                }
            };

            if self.handle_request(&conn, request).await {
                break;
            }
        }

        pinger.abort();
        self.remove(&conn).await;
    }

    /// Returns true when the connection must close
    async fn handle_request(&self, conn: &Arc<StratumConn>, request: RequestIn) -> bool {
        match request.method.as_str() {
            "mining.subscribe" => self.handle_subscribe(conn, request.id).await,
            "mining.authorize" => self.handle_authorize(conn, request).await,
            "mining.submit" => self.handle_submit(conn, request).await,
            "mining.ping" => !conn.respond(request.id, json!(true)).await,
            "mining.pong" => false,
            other => {
                debug!("unknown stratum method {} from {}", other, conn.ip);
                false
            }
        }
    }

    async fn handle_subscribe(&self, conn: &Arc<StratumConn>, id: u64) -> bool {
        // extra nonce as it will appear in this connection's jobs
        let mut extra_nonce = [0u8; 32];
        extra_nonce[0..16].copy_from_slice(&conn.miner_id);
        extra_nonce[16..24].copy_from_slice(&self.ctx.pool_nonce);

        let public_key = self
            .ctx
            .template
            .read()
            .await
            .as_ref()
            .map(|t| t.block_miner.public_key())
            .unwrap_or([0u8; 32]);

        !conn
            .respond(
                id,
                json!([
                    "",
                    hex::encode(extra_nonce),
                    32,
                    hex::encode(public_key),
                ]),
            )
            .await
    }

    async fn handle_authorize(&self, conn: &Arc<StratumConn>, request: RequestIn) -> bool {
        let params: Vec<String> = match serde_json::from_value(request.params) {
            Ok(params) => params,
            Err(err) => {
                warn!("bad authorize params from {}: {}", conn.ip, err);
                return true;
            }
        };
        if params.len() < 3 {
            warn!("authorize from {} has fewer than 3 params", conn.ip);
            return true;
        }

        let login = parse_login(&params[0], self.ctx.config.slave.min_difficulty);

        if !is_address_valid(&login.wallet, &self.ctx.config.address_prefix) {
            warn!("invalid wallet address {} from {}", login.wallet, conn.ip);
            conn.respond_error(request.id, -1, "invalid wallet address")
                .await;
            return true;
        }

        info!(
            "stratum miner with address {} IP {} connected (agent: {})",
            login.wallet, conn.ip, params[2]
        );

        {
            let mut data = conn.data.write().await;
            data.wallet = login.wallet;
            if let Some(fixed) = login.fixed_diff {
                data.next_diff = fixed as f64;
            }
        }

        if !conn.respond(request.id, json!(true)).await {
            warn!("failed to send authorize response to {}", conn.ip);
            return true;
        }

        if let Some(template) = self.ctx.template.read().await.clone() {
            conn.send_job(
                &template,
                self.ctx.pool_nonce,
                self.ctx.config.slave.min_difficulty,
            )
            .await;
        }
        false
    }

    async fn handle_submit(&self, conn: &Arc<StratumConn>, request: RequestIn) -> bool {
        let params: Vec<String> = match serde_json::from_value(request.params) {
            Ok(params) => params,
            Err(err) => {
                warn!("bad submit params from {}: {}", conn.ip, err);
                return true;
            }
        };
        if params.len() != 3 {
            warn!("submit from {} does not have 3 params", conn.ip);
            return true;
        }

        let (Ok(job_id_bytes), Ok(nonce_bytes)) = (hex::decode(&params[1]), hex::decode(&params[2]))
        else {
            warn!("submit from {} has invalid hex params", conn.ip);
            return true;
        };
        if job_id_bytes.len() != 16 || nonce_bytes.len() != 8 {
            warn!(
                "submit from {}: job id/nonce have unexpected lengths ({}, {})",
                conn.ip,
                job_id_bytes.len(),
                nonce_bytes.len()
            );
            return true;
        }
        let job_id: [u8; 16] = job_id_bytes.try_into().unwrap();
        // the header nonce field is big-endian, and so is the wire form
        let nonce = u64::from_be_bytes(nonce_bytes.try_into().unwrap());

        // rebuild the full header from the referenced job
        let bm = {
            let data = conn.data.read().await;
            data.jobs
                .iter()
                .find(|job| job.block_miner.job_id() == job_id)
                .map(|job| {
                    let mut bm = job.block_miner;
                    bm.set_nonce(nonce);
                    let mut extra_nonce = [0u8; 32];
                    extra_nonce[0..16].copy_from_slice(&job_id);
                    extra_nonce[16..24].copy_from_slice(&self.ctx.pool_nonce);
                    bm.set_extra_nonce(extra_nonce);
                    bm
                })
        };

        let Some(bm) = bm else {
            warn!("outdated stratum share, job id {}", hex::encode(job_id));
            conn.respond_error(request.id, ERR_STALE, "stale job").await;
            return false;
        };

        let outcome = shares::process_submit(
            &self.ctx,
            &conn.data,
            &conn.ip,
            bm,
            None,
            Some(conn.miner_id),
        )
        .await;

        if outcome.reply.is_accepted() {
            conn.respond(request.id, json!(true)).await;
        } else {
            conn.respond_error(request.id, ERR_REJECTED, &outcome.reply.msg)
                .await;
        }

        if outcome.resend_job {
            if let Some(template) = self.ctx.template.read().await.clone() {
                conn.send_job(
                    &template,
                    self.ctx.pool_nonce,
                    self.ctx.config.slave.min_difficulty,
                )
                .await;
            }
        }

        outcome.kick
    }

    /// Push the new template to every authorized miner
    pub async fn broadcast_jobs(&self, template: &LastTemplate) {
        let conns: Vec<Arc<StratumConn>> = self.conns.read().await.values().cloned().collect();
        if !conns.is_empty() {
            info!("sending job to {} stratum miners", conns.len());
        }

        for conn in conns {
            let ctx = Arc::clone(&self.ctx);
            let template = template.clone();
            tokio::spawn(async move {
                let (authorized, idle) = {
                    let data = conn.data.read().await;
                    (!data.wallet.is_empty(), data.last_share.elapsed())
                };

                if !authorized {
                    return;
                }

                if idle > Duration::from_secs(IDLE_SHARE_TIMEOUT) {
                    debug!("kicking stratum miner {} after {:?} idle", conn.ip, idle);
                    ctx.limiter.ban(&conn.ip, util::now() + BAN_DURATION);
                    conn.shutdown().await;
                    return;
                }

                conn.send_job(&template, ctx.pool_nonce, ctx.config.slave.min_difficulty)
                    .await;
            });
        }
    }

    async fn remove(&self, conn: &Arc<StratumConn>) {
        if self.conns.write().await.remove(&conn.id).is_some() {
            self.ctx.limiter.disconnect(&conn.ip);
            info!("stratum miner {} disconnected", conn.ip);
        }
        conn.shutdown().await;
    }
}

fn spawn_pinger(conn: Arc<StratumConn>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(MINER_TIMEOUT - PING_MARGIN));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !conn.request("mining.ping", None).await {
                conn.shutdown().await;
                return;
            }
        }
    })
}
