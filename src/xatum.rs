// src/xatum.rs - Xatum miner protocol: TLS, newline-framed `name~json`
use crate::address::{is_address_valid, parse_login};
use crate::constants::{
    HANDSHAKE_TIMEOUT, IDLE_SHARE_TIMEOUT, MAX_REQUEST_SIZE, MINER_TIMEOUT, PING_MARGIN,
};
use crate::error::{PoolError, Result};
use crate::job::{prepare_job, ConnData, LastTemplate};
use crate::rate_limit::{action, BAN_DURATION};
use crate::shares::{self, ShareReply, LVL_ERROR};
use crate::slave::SlaveContext;
use crate::util;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures::StreamExt;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_rustls::rustls::{Certificate, PrivateKey, ServerConfig};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::{FramedRead, LinesCodec};

/// Packet names of the wire protocol
pub mod packet {
    pub const HANDSHAKE: &str = "shake";
    pub const JOB: &str = "job";
    pub const SUBMIT: &str = "submit";
    pub const PRINT: &str = "print";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
}

#[derive(Debug, Deserialize)]
pub struct Handshake {
    pub addr: String,
    #[serde(default)]
    pub work: String,
    #[serde(default)]
    pub agent: String,
    #[serde(default)]
    pub algos: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct JobNotice {
    pub diff: u64,
    /// 96-byte template blob, base64
    pub blob: String,
}

#[derive(Debug, Deserialize)]
pub struct Submit {
    /// full 112-byte header, base64
    pub data: String,
    /// claimed PoW hash, hex; optional
    #[serde(default)]
    pub hash: String,
}

#[derive(Debug, Serialize)]
struct Print<'a> {
    msg: &'a str,
    lvl: u8,
}

pub struct XatumConn {
    pub id: u64,
    pub ip: String,
    writer: Mutex<WriteHalf<TlsStream<TcpStream>>>,
    pub data: RwLock<ConnData>,
}

impl XatumConn {
    /// Serialize and send one `name~json` line
    pub async fn send_packet<T: Serialize>(&self, name: &str, payload: &T) -> Result<()> {
        let mut line = format!("{}~{}", name, serde_json::to_string(payload)?);
        debug!("xatum >>> {}", line);
        line.push('\n');

        let mut writer = self.writer.lock().await;
        tokio::time::timeout(Duration::from_secs(20), writer.write_all(line.as_bytes()))
            .await
            .map_err(|_| PoolError::transport("write timed out"))??;
        Ok(())
    }

    pub async fn send_print(&self, reply: &ShareReply) {
        let print = Print {
            msg: &reply.msg,
            lvl: reply.lvl,
        };
        if let Err(err) = self.send_packet(packet::PRINT, &print).await {
            debug!("failed to send print to {}: {}", self.ip, err);
        }
    }

    /// Stamp a fresh job for this connection and put it on the wire.
    /// The caller must not hold the data lock.
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

        let notice = JobNotice {
            diff,
            blob: BASE64.encode(bm.blob()),
        };
        if let Err(err) = self.send_packet(packet::JOB, &notice).await {
            warn!("cannot send job to {}: {}", self.ip, err);
            self.shutdown().await;
        }
    }

    async fn shutdown(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}

pub struct XatumServer {
    ctx: Arc<SlaveContext>,
    conns: RwLock<HashMap<u64, Arc<XatumConn>>>,
}

impl XatumServer {
    pub fn new(ctx: Arc<SlaveContext>) -> Arc<Self> {
        Arc::new(XatumServer {
            ctx,
            conns: RwLock::new(HashMap::new()),
        })
    }

    pub async fn connection_count(&self) -> usize {
        self.conns.read().await.len()
    }

    /// Accept loop. Never returns under normal operation.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let tls = TlsAcceptor::from(Arc::new(load_tls_config()?));
        let port = self.ctx.config.slave.xatum_port;
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("Xatum server listening on port {}", port);

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    warn!("xatum accept failed: {}", err);
                    continue;
                }
            };
            let ip = peer.ip().to_string();

            if !self.ctx.limiter.can_do_action(&ip, action::CONNECT) {
                debug!("xatum miner {} connect rate limited", ip);
                continue;
            }
            if !self.ctx.limiter.can_connect(&ip) {
                debug!("xatum miner {} reached the per-IP connection limit", ip);
                continue;
            }

            let server = Arc::clone(&self);
            let tls = tls.clone();
            tokio::spawn(async move {
                let tls_stream = match tls.accept(stream).await {
                    Ok(tls_stream) => tls_stream,
                    Err(err) => {
                        debug!("tls handshake with {} failed: {}", ip, err);
                        server.ctx.limiter.disconnect(&ip);
                        return;
                    }
                };
                server.handle_conn(tls_stream, ip).await;
            });
        }
    }

    async fn handle_conn(self: Arc<Self>, stream: TlsStream<TcpStream>, ip: String) {
        let (read_half, write_half) = tokio::io::split(stream);

        let conn = Arc::new(XatumConn {
            id: util::random_u64(),
            ip: ip.clone(),
            writer: Mutex::new(write_half),
            data: RwLock::new(ConnData::new(self.ctx.config.slave.initial_difficulty)),
        });

        self.conns.write().await.insert(conn.id, Arc::clone(&conn));
        info!("xatum miner with IP {} connected", ip);

        let pinger = spawn_pinger(Arc::clone(&conn));

        let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_REQUEST_SIZE));
        let mut packets_received: u64 = 0;

        loop {
            let deadline = if packets_received == 0 {
                Duration::from_secs(HANDSHAKE_TIMEOUT)
            } else {
                Duration::from_secs(MINER_TIMEOUT)
            };

            let line = match tokio::time::timeout(deadline, lines.next()).await {
                Ok(Some(Ok(line))) => line,
                Ok(Some(Err(err))) => {
                    debug!("xatum read error from {}: {}", ip, err);
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    debug!("xatum miner {} timed out", ip);
                    break;
                }
            };
            packets_received += 1;

            debug!("xatum <<< {}", line);

            let kick = self.handle_packet(&conn, &line, packets_received).await;
            if kick {
                break;
            }
        }

        pinger.abort();
        self.remove(&conn).await;
    }

    /// Dispatch one inbound line; returns true when the connection must go
    async fn handle_packet(&self, conn: &Arc<XatumConn>, line: &str, packets_received: u64) -> bool {
        let Some((name, body)) = line.split_once('~') else {
            conn.send_print(&ShareReply::error("malformed packet data")).await;
            return true;
        };

        if packets_received == 1 && name != packet::HANDSHAKE {
            conn.send_print(&ShareReply::error("first packet must be a handshake"))
                .await;
            return true;
        }

        match name {
            packet::HANDSHAKE => self.handle_handshake(conn, body, packets_received).await,
            packet::PONG => {
                debug!("received pong from {}", conn.ip);
                false
            }
            packet::SUBMIT => self.handle_submit(conn, body).await,
            other => {
                debug!("unknown xatum packet {} from {}", other, conn.ip);
                conn.send_print(&ShareReply {
                    msg: format!("unknown packet {}", other),
                    lvl: LVL_ERROR,
                })
                .await;
                false
            }
        }
    }

    async fn handle_handshake(&self, conn: &Arc<XatumConn>, body: &str, packets_received: u64) -> bool {
        if packets_received != 1 {
            conn.send_print(&ShareReply::error("more than one handshake received"))
                .await;
            return true;
        }

        let handshake: Handshake = match serde_json::from_str(body) {
            Ok(handshake) => handshake,
            Err(_) => {
                conn.send_print(&ShareReply::error("failed to parse data")).await;
                return true;
            }
        };

        let login = parse_login(&handshake.addr, self.ctx.config.slave.min_difficulty);

        if !is_address_valid(&login.wallet, &self.ctx.config.address_prefix) {
            warn!("IP {} sent invalid address {}", conn.ip, login.wallet);
            conn.send_print(&ShareReply::error("invalid address")).await;
            return true;
        }

        if !handshake
            .algos
            .iter()
            .any(|algo| algo == "xel/0" || algo == "xel/1")
        {
            conn.send_print(&ShareReply::error(
                "your miner does not support xel/0 or xel/1 algorithms",
            ))
            .await;
            return true;
        }

        info!(
            "new miner | address: {} {} agent: {} algos: {:?}",
            login.wallet, handshake.work, handshake.agent, handshake.algos
        );

        {
            let mut data = conn.data.write().await;
            data.wallet = login.wallet;
            if let Some(fixed) = login.fixed_diff {
                data.next_diff = fixed as f64;
            }
        }

        // first job
        let template = self.ctx.template.read().await.clone();
        match template {
            Some(template) => {
                conn.send_job(
                    &template,
                    self.ctx.pool_nonce,
                    self.ctx.config.slave.min_difficulty,
                )
                .await;
            }
            None => debug!("no template known yet, first job deferred"),
        }
        false
    }

    async fn handle_submit(&self, conn: &Arc<XatumConn>, body: &str) -> bool {
        let submit: Submit = match serde_json::from_str(body) {
            Ok(submit) => submit,
            Err(_) => {
                conn.send_print(&ShareReply::error("failed to parse data")).await;
                return true;
            }
        };

        let header = match BASE64.decode(&submit.data) {
            Ok(header) => header,
            Err(_) => {
                conn.send_print(&ShareReply::error("invalid share encoding")).await;
                return true;
            }
        };
        let bm = match crate::blockminer::BlockMiner::from_bytes(&header) {
            Ok(bm) => bm,
            Err(_) => {
                conn.send_print(&ShareReply::error("invalid header length")).await;
                return true;
            }
        };

        let claimed_hash = match hex::decode(&submit.hash) {
            Ok(bytes) if bytes.len() == 32 => Some(<[u8; 32]>::try_from(bytes.as_slice()).unwrap()),
            _ => None,
        };

        let outcome =
            shares::process_submit(&self.ctx, &conn.data, &conn.ip, bm, claimed_hash, None).await;

        conn.send_print(&outcome.reply).await;

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

    /// Push the new template to every live miner, kicking the silent ones
    pub async fn broadcast_jobs(&self, template: &LastTemplate) {
        let conns: Vec<Arc<XatumConn>> = self.conns.read().await.values().cloned().collect();
        if !conns.is_empty() {
            info!("sending job to {} xatum miners", conns.len());
        }

        for conn in conns {
            let ctx = Arc::clone(&self.ctx);
            let template = template.clone();
            tokio::spawn(async move {
                let (handshaken, idle) = {
                    let data = conn.data.read().await;
                    (
                        !data.jobs.is_empty() || !data.wallet.is_empty(),
                        data.last_share.elapsed(),
                    )
                };

                if !handshaken {
                    debug!("skipping job for {}: no handshake yet", conn.ip);
                    return;
                }

                if idle > Duration::from_secs(IDLE_SHARE_TIMEOUT) {
                    debug!("kicking {} after {:?} without a share", conn.ip, idle);
                    ctx.limiter.ban(&conn.ip, util::now() + BAN_DURATION);
                    conn.send_print(&ShareReply::error("no recent share received")).await;
                    conn.shutdown().await;
                    return;
                }

                conn.send_job(&template, ctx.pool_nonce, ctx.config.slave.min_difficulty)
                    .await;
            });
        }
    }

    /// Drop a connection from the registry; the per-IP slot is released by
    /// whichever path removes it first
    async fn remove(&self, conn: &Arc<XatumConn>) {
        if self.conns.write().await.remove(&conn.id).is_some() {
            self.ctx.limiter.disconnect(&conn.ip);
            info!("xatum miner {} disconnected", conn.ip);
        }
        conn.shutdown().await;
    }
}

fn spawn_pinger(conn: Arc<XatumConn>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(MINER_TIMEOUT - PING_MARGIN));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if conn
                .send_packet(packet::PING, &serde_json::json!({}))
                .await
                .is_err()
            {
                conn.shutdown().await;
                return;
            }
        }
    })
}

/// Load `cert.pem`/`key.pem`, generating a self-signed pair when absent
fn load_tls_config() -> Result<ServerConfig> {
    let (cert_pem, key_pem) = match (fs::read("cert.pem"), fs::read("key.pem")) {
        (Ok(cert), Ok(key)) => (cert, key),
        _ => {
            warn!("no TLS certificate found, generating a self-signed one");
            let generated = rcgen::generate_simple_self_signed(vec!["xepool".to_string()])
                .map_err(|e| PoolError::Fatal(format!("certificate generation failed: {}", e)))?;
            let cert_pem = generated
                .serialize_pem()
                .map_err(|e| PoolError::Fatal(format!("certificate serialization failed: {}", e)))?;
            let key_pem = generated.serialize_private_key_pem();
            let _ = fs::write("cert.pem", &cert_pem);
            let _ = fs::write("key.pem", &key_pem);
            (cert_pem.into_bytes(), key_pem.into_bytes())
        }
    };

    let certs: Vec<Certificate> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .map_err(|e| PoolError::Fatal(format!("invalid TLS certificate: {}", e)))?
        .into_iter()
        .map(Certificate)
        .collect();
    let key = rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_slice())
        .map_err(|e| PoolError::Fatal(format!("invalid TLS key: {}", e)))?
        .into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| PoolError::Fatal("no private key in key.pem".to_string()))?;

    ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| PoolError::Fatal(format!("TLS configuration failed: {}", e)))
}
