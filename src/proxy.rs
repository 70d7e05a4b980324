//! The proxy pipe (C6): two concurrent forwarders between a client and its
//! chosen target, a bounded outbound queue, and the write-path rewrite
//! hooks for packet types 106/108/115.
//!
//! Grounded on `Proxy.go`'s `ProxyConnection`: `packetChan` becomes a
//! bounded `mpsc` channel drained by a dedicated task, `closeChan`/
//! `sync.Once` become an `AtomicBool` guard plus `tokio::sync::Notify`,
//! and the goroutine pair (`forwardClientToTarget`/`forwardTargetToClient`)
//! becomes two spawned tasks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::codec::{read_packet, write_packet, BufferPool, Packet};
use crate::error::{ProxyError, Result};
use crate::protocol::constants::*;
use crate::protocol::packets;
use crate::registry::ConnectionData;
use crate::trace;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_QUEUE_CAPACITY: usize = 100;

pub struct ProxyPipe {
    player_name: String,
    target_write: Arc<AsyncMutex<OwnedWriteHalf>>,
    // Taken (dropped) on close so `drain_to_target`'s `rx.recv()` resolves to
    // `None` promptly even if it was already parked waiting for a packet at
    // close time — `close_notify.notify_waiters()` alone only wakes a task
    // that is *currently* inside `.notified()` and would otherwise miss a
    // task parked on the sibling `rx.recv()` branch of the same `select!`.
    outbound_tx: SyncMutex<Option<mpsc::Sender<Packet>>>,
    pool: Arc<BufferPool>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl ProxyPipe {
    /// Dials `conn`'s configured target and, on success, installs itself
    /// into `conn` and starts both forwarder tasks. Returns the existing
    /// proxy unchanged if one is already installed (idempotent per spec).
    pub async fn start(conn: Arc<ConnectionData>, player_name: String, pool: Arc<BufferPool>) -> Result<Arc<ProxyPipe>> {
        if let Some(existing) = conn.proxy() {
            return Ok(existing);
        }

        let (ip, port) = conn.target_addr();
        if ip.is_empty() || port == 0 {
            return Err(ProxyError::Dial {
                addr: format!("{ip}:{port}"),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "no target address set"),
            });
        }
        let addr = format!("{ip}:{port}");

        let stream = timeout(DIAL_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| ProxyError::DialTimeout { addr: addr.clone() })?
            .map_err(|source| ProxyError::Dial { addr: addr.clone(), source })?;
        info!(player = %player_name, target = %addr, "connected to target server");

        let (target_read, target_write) = stream.into_split();
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

        let pipe = Arc::new(ProxyPipe {
            player_name: player_name.clone(),
            target_write: Arc::new(AsyncMutex::new(target_write)),
            outbound_tx: SyncMutex::new(Some(tx)),
            pool: pool.clone(),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        });

        if !conn.install_proxy(pipe.clone()) {
            pipe.close().await;
            return Ok(conn.proxy().expect("just checked installed"));
        }

        tokio::spawn(drain_to_target(pipe.clone(), rx));
        tokio::spawn(forward_from_target(pipe.clone(), target_read, Arc::downgrade(&conn)));

        Ok(pipe)
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    /// Deep-copies `packet` and offers it to the outbound queue. Special
    /// cases (type 109 dropped, type 110 playerHex substitution) are
    /// applied by the caller before this is invoked; this method only
    /// implements the bounded-queue offer-or-drop policy.
    pub fn forward_packet(&self, packet: Packet) {
        let result = match self.outbound_tx.lock().as_ref() {
            Some(tx) => tx.try_send(packet),
            None => {
                self.pool.put(packet.body);
                return;
            }
        };
        match result {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(packet)) => {
                let err = ProxyError::QueueFull;
                warn!(player = %self.player_name, error = %err, "dropping packet");
                self.pool.put(packet.body);
            }
            Err(mpsc::error::TrySendError::Closed(packet)) => {
                self.pool.put(packet.body);
            }
        }
    }

    /// Writes `packet` directly to the target, bypassing the outbound
    /// queue. Used for the 108→109 ping shim, which answers the target
    /// out-of-band from ordinary client→target traffic.
    pub async fn send_packet_to_target(&self, packet: &Packet) -> Result<()> {
        let mut w = self.target_write.lock().await;
        write_packet(&mut *w, packet).await
    }

    /// Close-once: tears down the target socket and wakes both forwarder
    /// tasks. Safe to call multiple times or concurrently.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.outbound_tx.lock().take();
        self.close_notify.notify_waiters();
        let mut w = self.target_write.lock().await;
        let _ = w.shutdown().await;
        debug!(player = %self.player_name, "proxy pipe closed");
    }
}

async fn drain_to_target(pipe: Arc<ProxyPipe>, mut rx: mpsc::Receiver<Packet>) {
    loop {
        tokio::select! {
            _ = pipe.close_notify.notified() => break,
            maybe_packet = rx.recv() => {
                match maybe_packet {
                    Some(packet) => {
                        if !pipe.is_connected() {
                            pipe.pool.put(packet.body);
                            break;
                        }
                        if let Err(e) = pipe.send_packet_to_target(&packet).await {
                            warn!(player = %pipe.player_name, error = %e, "forwarding to target failed");
                            pipe.pool.put(packet.body);
                            break;
                        }
                        pipe.pool.put(packet.body);
                    }
                    None => break,
                }
            }
        }
    }
    pipe.close().await;
}

async fn forward_from_target(
    pipe: Arc<ProxyPipe>,
    mut target_read: tokio::net::tcp::OwnedReadHalf,
    conn: Weak<ConnectionData>,
) {
    loop {
        let packet = tokio::select! {
            _ = pipe.close_notify.notified() => break,
            result = read_packet(&mut target_read, &pipe.pool) => {
                match result {
                    Ok(packet) => packet,
                    Err(e) => {
                        debug!(player = %pipe.player_name, error = %e, "target read ended");
                        break;
                    }
                }
            }
        };

        let Some(conn) = conn.upgrade() else { break };

        match packet.kind {
            PKT_PING_REQUEST => {
                let send_time = packets::analyze_108(&packet);
                let reply = packets::build_109(send_time);
                if let Err(e) = pipe.send_packet_to_target(&reply).await {
                    warn!(player = %pipe.player_name, error = %e, "failed to answer target ping");
                }
                pipe.pool.put(packet.body);
            }
            PKT_MAP_INFO => {
                handle_map_info(&pipe, &conn, packet).await;
            }
            PKT_PLAYER_LIST => {
                let to_send = if conn.is_fog() {
                    match packets::rewrite_115_fog(&packet) {
                        Ok(rewritten) => {
                            pipe.pool.put(packet.body);
                            rewritten
                        }
                        Err(_) => packet,
                    }
                } else {
                    packet
                };
                forward_to_client(&pipe, &conn, to_send).await;
            }
            _ => {
                forward_to_client(&pipe, &conn, packet).await;
            }
        }
    }
    pipe.close().await;
}

async fn handle_map_info(pipe: &Arc<ProxyPipe>, conn: &Arc<ConnectionData>, packet: Packet) {
    let to_send = if conn.is_fog() {
        match packets::rewrite_106_fog(&packet) {
            Ok(rewritten) => {
                pipe.pool.put(packet.body);
                rewritten
            }
            Err(_) => packet,
        }
    } else {
        packet
    };
    forward_to_client(pipe, conn, to_send).await;

    if !conn.latch_first_map_info() {
        return;
    }

    let client_ip = conn.peer_addr.ip().to_string();
    conn.set_client_ip(client_ip.clone());
    info!(player = %pipe.player_name, %client_ip, "player client IP recorded");

    send_system_chat(conn, "欢迎使用 ShadowPlayer 代理服务器").await;

    let (old_hex, new_hex) = conn.player_hex_bookkeeping();
    if let (Some(old_hex), Some(new_hex)) = (old_hex, new_hex) {
        send_system_chat(conn, &format!("PlayerHex已更新\n原值: {old_hex}\n新值: {new_hex}")).await;
    }

    let conn_for_trace = conn.clone();
    let player_name = pipe.player_name.clone();
    tokio::spawn(async move {
        let external_ip = trace::fetch_external_ip().await.unwrap_or_default();
        if !external_ip.is_empty() {
            debug!(player = %player_name, %external_ip, "trace service returned external IP");
        }
        let msg = format!("网络信息\n客户端IP: {client_ip}\n外部IP: {external_ip}");
        send_system_chat(&conn_for_trace, &msg).await;
    });
}

async fn send_system_chat(conn: &Arc<ConnectionData>, msg: &str) {
    let packet = packets::build_141_system(msg);
    let mut w = conn.client_writer.lock().await;
    if let Err(e) = write_packet(&mut *w, &packet).await {
        warn!(error = %e, "failed to send system chat message to client");
    }
}

async fn forward_to_client(pipe: &Arc<ProxyPipe>, conn: &Arc<ConnectionData>, packet: Packet) {
    {
        let mut w = conn.client_writer.lock().await;
        if let Err(e) = write_packet(&mut *w, &packet).await {
            warn!(error = %e, "failed to forward packet to client");
        }
    }
    pipe.pool.put(packet.body);
}
