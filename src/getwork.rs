// src/getwork.rs - Getwork miner protocol over WebSocket
//
// Miners connect to /getwork/{wallet[+diff]}/{worker}; the server pushes
// `new_job` objects and answers each submitted header with
// `"block_accepted"` or `{"block_rejected":"<reason>"}`.
use crate::address::{is_address_valid, parse_login, MinerLogin};
use crate::blockminer::BlockMiner;
use crate::constants::{BLOCKMINER_LENGTH, IDLE_SHARE_TIMEOUT};
use crate::job::{prepare_job, ConnData, LastTemplate};
use crate::rate_limit::{action, BAN_DURATION};
use crate::shares;
use crate::slave::SlaveContext;
use crate::util;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket};
use warp::Filter;

#[derive(Debug, Deserialize)]
struct SubmittedWork {
    #[serde(default)]
    miner_work: Option<String>,
    #[serde(default)]
    block_template: Option<String>,
}

pub struct GetworkConn {
    pub id: u64,
    pub ip: String,
    writer: Mutex<SplitSink<WebSocket, Message>>,
    pub data: RwLock<ConnData>,
}

impl GetworkConn {
    async fn send_text(&self, text: String) -> bool {
        self.writer.lock().await.send(Message::text(text)).await.is_ok()
    }

    /// Stamp and push a fresh job. Returns false when the socket is gone.
    pub async fn send_job(
        &self,
        template: &LastTemplate,
        pool_nonce: [u8; 8],
        min_diff: u64,
    ) -> bool {
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

        let notice = serde_json::json!({
            "new_job": {
                "difficulty": diff.to_string(),
                "height": template.height,
                "topoheight": template.height,
                "miner_work": hex::encode(bm.as_bytes()),
                "algorithm": template.algorithm.as_getwork(),
            }
        });
        self.send_text(notice.to_string()).await
    }

    async fn close(&self) {
        let _ = self.writer.lock().await.send(Message::close()).await;
    }
}

pub struct GetworkServer {
    ctx: Arc<SlaveContext>,
    conns: RwLock<HashMap<u64, Arc<GetworkConn>>>,
}

impl GetworkServer {
    pub fn new(ctx: Arc<SlaveContext>) -> Arc<Self> {
        Arc::new(GetworkServer {
            ctx,
            conns: RwLock::new(HashMap::new()),
        })
    }

    pub async fn connection_count(&self) -> usize {
        self.conns.read().await.len()
    }

    /// Serve the websocket route forever
    pub async fn run(self: Arc<Self>) {
        let server = Arc::clone(&self);
        let with_server = warp::any().map(move || Arc::clone(&server));

        let with_worker = warp::path!("getwork" / String / String)
            .and(warp::addr::remote())
            .and(warp::ws())
            .and(with_server.clone())
            .map(
                |addr: String, worker: String, remote, ws, server: Arc<GetworkServer>| {
                    server.upgrade(addr, worker, remote, ws)
                },
            );

        let without_worker = warp::path!("getwork" / String)
            .and(warp::addr::remote())
            .and(warp::ws())
            .and(with_server)
            .map(|addr: String, remote, ws, server: Arc<GetworkServer>| {
                server.upgrade(addr, "x".to_string(), remote, ws)
            });

        let port = self.ctx.config.slave.getwork_port;
        info!("getwork server listening on port {}", port);
        warp::serve(with_worker.or(without_worker))
            .run(([0, 0, 0, 0], port))
            .await;
    }

    /// Gate the HTTP request, then upgrade it to a websocket session
    fn upgrade(
        self: Arc<Self>,
        addr: String,
        worker: String,
        remote: Option<SocketAddr>,
        ws: warp::ws::Ws,
    ) -> Box<dyn warp::Reply> {
        let ip = remote
            .map(|a| a.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        if !self.ctx.limiter.can_do_action(&ip, action::CONNECT) {
            warn!("IP {} rate limited on getwork server", ip);
            return Box::new(warp::reply::with_status(
                "429 too many requests",
                StatusCode::TOO_MANY_REQUESTS,
            ));
        }

        let login = parse_login(&addr, self.ctx.config.slave.min_difficulty);
        if !is_address_valid(&login.wallet, &self.ctx.config.address_prefix) {
            return Box::new(warp::reply::with_status(
                "400 invalid wallet address",
                StatusCode::BAD_REQUEST,
            ));
        }

        if !self.ctx.limiter.can_connect(&ip) {
            warn!("IP {} has too many getwork connections", ip);
            return Box::new(warp::reply::with_status(
                "429 too many open connections",
                StatusCode::TOO_MANY_REQUESTS,
            ));
        }

        info!(
            "new getwork miner with IP {} wallet {} worker {}",
            ip, login.wallet, worker
        );

        Box::new(ws.on_upgrade(move |socket| self.handle_ws(socket, ip, login)))
    }

    async fn handle_ws(self: Arc<Self>, socket: WebSocket, ip: String, login: MinerLogin) {
        let (sink, mut stream) = socket.split();

        let mut data = ConnData::new(self.ctx.config.slave.initial_difficulty);
        data.wallet = login.wallet;
        if let Some(fixed) = login.fixed_diff {
            data.next_diff = fixed as f64;
        }

        let conn = Arc::new(GetworkConn {
            id: util::random_u64(),
            ip: ip.clone(),
            writer: Mutex::new(sink),
            data: RwLock::new(data),
        });

        self.conns.write().await.insert(conn.id, Arc::clone(&conn));

        // first job, when a template is already known
        if let Some(template) = self.ctx.template.read().await.clone() {
            conn.send_job(
                &template,
                self.ctx.pool_nonce,
                self.ctx.config.slave.min_difficulty,
            )
            .await;
        } else {
            debug!("not sending first job: no template known yet");
        }

        while let Some(incoming) = stream.next().await {
            let message = match incoming {
                Ok(message) => message,
                Err(err) => {
                    debug!("getwork miner {} read error: {}", ip, err);
                    break;
                }
            };
            if message.is_close() {
                break;
            }
            let Ok(text) = message.to_str() else { continue };

            if self.handle_submit(&conn, text).await {
                break;
            }
        }

        self.remove(&conn).await;
    }

    /// Returns true when the connection should be closed
    async fn handle_submit(&self, conn: &Arc<GetworkConn>, text: &str) -> bool {
        debug!("getwork <<< {}", text);

        let submitted: SubmittedWork = match serde_json::from_str(text) {
            Ok(submitted) => submitted,
            Err(err) => {
                debug!("unparsed getwork message: {}", err);
                return false;
            }
        };

        let Some(work_hex) = submitted.miner_work.or(submitted.block_template) else {
            debug!("miner_work and block_template are both missing");
            return false;
        };

        let header = match hex::decode(&work_hex) {
            Ok(header) => header,
            Err(err) => {
                debug!("bad share hex: {}", err);
                return false;
            }
        };
        if header.len() != BLOCKMINER_LENGTH {
            debug!("share is not {} bytes", BLOCKMINER_LENGTH);
            return false;
        }
        let bm = match BlockMiner::from_bytes(&header) {
            Ok(bm) => bm,
            Err(_) => return false,
        };

        // getwork miners never claim a hash, so PoW is always verified
        let outcome =
            shares::process_submit(&self.ctx, &conn.data, &conn.ip, bm, None, None).await;

        let sent = if outcome.reply.is_accepted() {
            conn.send_text("\"block_accepted\"".to_string()).await
        } else {
            let rejection = serde_json::json!({ "block_rejected": outcome.reply.msg });
            conn.send_text(rejection.to_string()).await
        };

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

        outcome.kick || !sent
    }

    /// Push the new template to every live getwork miner
    pub async fn broadcast_jobs(&self, template: &LastTemplate) {
        let conns: Vec<Arc<GetworkConn>> = self.conns.read().await.values().cloned().collect();
        if !conns.is_empty() {
            info!("sending job to {} getwork miners", conns.len());
        }

        for conn in conns {
            let ctx = Arc::clone(&self.ctx);
            let template = template.clone();
            tokio::spawn(async move {
                let idle = conn.data.read().await.last_share.elapsed();
                if idle > Duration::from_secs(IDLE_SHARE_TIMEOUT) {
                    debug!("kicking getwork miner {} after {:?} idle", conn.ip, idle);
                    ctx.limiter.ban(&conn.ip, util::now() + BAN_DURATION);
                    conn.close().await;
                    return;
                }

                if !conn
                    .send_job(&template, ctx.pool_nonce, ctx.config.slave.min_difficulty)
                    .await
                {
                    warn!("cannot send job to getwork miner {}", conn.ip);
                    conn.close().await;
                }
            });
        }
    }

    async fn remove(&self, conn: &Arc<GetworkConn>) {
        if self.conns.write().await.remove(&conn.id).is_some() {
            self.ctx.limiter.disconnect(&conn.ip);
            info!("getwork miner {} disconnected", conn.ip);
        }
        conn.close().await;
    }
}
