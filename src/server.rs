//! The listening server (C4 accept loop) and its periodic maintenance
//! tasks.
//!
//! Grounded on `Server.go`'s `Start`/`handleBinaryConnection` pair: the
//! semaphore-bounded `go func(conn)` per accept becomes a semaphore permit
//! held across a spawned task, and the deferred cleanup chain (close
//! proxy, deregister, close socket, release semaphore) becomes a `Drop`-free
//! explicit cleanup block run after the per-connection task's read loop
//! returns. `refreshTheTeam`/`RefreshPing` (spec §B) become two interval
//! loops spawned alongside the accept loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::codec::{read_packet, write_packet, BufferPool, Packet};
use crate::config::Config;
use crate::dialogue;
use crate::error::{peer_tag, Result};
use crate::protocol::packets;
use crate::registry::{ConnectionData, Registry};

const MAX_CONNECTIONS: usize = 1000;
const TEAM_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const PING_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
    accept_permits: Arc<Semaphore>,
    pool: Arc<BufferPool>,
}

impl Server {
    /// The address actually bound, useful when `config.port` is `0` and the
    /// OS picks an ephemeral port (tests, ad hoc local runs).
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn bind(config: &Config) -> Result<Self> {
        let addr = format!("0.0.0.0:{}", config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "listening");
        Ok(Self {
            listener,
            registry: Arc::new(Registry::new()),
            accept_permits: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
            pool: Arc::new(BufferPool::new()),
        })
    }

    /// Runs the accept loop and maintenance tasks until `shutdown` resolves.
    pub async fn serve(self, shutdown: impl std::future::Future<Output = ()>) {
        self.spawn_maintenance_tasks();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown signal received, no longer accepting connections");
                    break;
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((socket, peer)) => self.admit(socket, peer),
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
            }
        }
    }

    fn admit(&self, socket: tokio::net::TcpStream, peer: std::net::SocketAddr) {
        let Ok(permit) = self.accept_permits.clone().try_acquire_owned() else {
            warn!(%peer, "connection limit reached, rejecting");
            drop(socket);
            return;
        };

        let registry = self.registry.clone();
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let _permit = permit;
            handle_connection(socket, peer, registry, pool).await;
        });
    }

    fn spawn_maintenance_tasks(&self) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TEAM_REFRESH_INTERVAL);
            loop {
                interval.tick().await;
                refresh_team(&registry).await;
            }
        });

        let registry = self.registry.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_REFRESH_INTERVAL);
            loop {
                interval.tick().await;
                refresh_ping(&registry).await;
            }
        });
    }
}

async fn handle_connection(
    socket: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
    registry: Arc<Registry>,
    pool: Arc<BufferPool>,
) {
    let _ = socket.set_nodelay(true);
    let (read_half, write_half) = socket.into_split();
    let client_writer = Arc::new(tokio::sync::Mutex::new(write_half));
    let conn = Arc::new(ConnectionData::new(client_writer, peer));

    info!(peer = %peer_tag(Some(peer)), "connection accepted");
    read_loop(read_half, &conn, &registry, &pool).await;

    if let Some(proxy) = conn.take_proxy() {
        proxy.close().await;
    }
    registry.deregister(&conn);
    info!(peer = %peer_tag(Some(peer)), "connection closed");
}

async fn read_loop(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    conn: &Arc<ConnectionData>,
    registry: &Arc<Registry>,
    pool: &Arc<BufferPool>,
) {
    loop {
        let packet = match read_packet(&mut read_half, pool).await {
            Ok(packet) => packet,
            Err(e) => {
                warn!(peer = %peer_tag(Some(conn.peer_addr)), error = %e, "client read ended");
                return;
            }
        };

        if let Some(proxy) = conn.proxy() {
            if proxy.is_connected() {
                forward_client_packet(&proxy, conn, pool, packet);
                continue;
            }
        }

        if let Err(e) = dialogue::handle_packet(conn, registry, pool, packet).await {
            warn!(peer = %peer_tag(Some(conn.peer_addr)), error = %e, "dialogue step failed");
            return;
        }
    }
}

fn forward_client_packet(
    proxy: &Arc<crate::proxy::ProxyPipe>,
    conn: &Arc<ConnectionData>,
    pool: &Arc<BufferPool>,
    packet: Packet,
) {
    use crate::protocol::constants::{PKT_LOGIN, PKT_PING_REPLY};

    if packet.kind == PKT_PING_REPLY {
        pool.put(packet.body);
        return;
    }
    if packet.kind == PKT_LOGIN {
        let (rebuilt, old_hex, new_hex) = packets::substitute_player_hex(&packet);
        info!(old_hex = %old_hex, new_hex = %new_hex, "player hex substituted");
        conn.set_player_hex_bookkeeping(old_hex, new_hex);
        pool.put(packet.body);
        proxy.forward_packet(rebuilt);
        return;
    }
    proxy.forward_packet(packet);
}

async fn refresh_team(registry: &Registry) {
    let snapshot = registry.snapshot();
    let names: Vec<String> = snapshot.iter().map(|(name, _)| name.clone()).collect();
    for (name, conn) in &snapshot {
        let packet = match packets::build_115(&names, Some(name.as_str())) {
            Ok(packet) => packet,
            Err(e) => {
                warn!(error = %e, "failed to build player-list refresh");
                continue;
            }
        };
        let mut w = conn.client_writer.lock().await;
        if let Err(e) = write_packet(&mut *w, &packet).await {
            warn!(player = %name, error = %e, "failed to send player-list refresh");
        }
    }
}

async fn refresh_ping(registry: &Registry) {
    let packet = packets::build_108();
    for (name, conn) in registry.snapshot() {
        let mut w = conn.client_writer.lock().await;
        if let Err(e) = write_packet(&mut *w, &packet).await {
            warn!(player = %name, error = %e, "failed to send ping refresh");
        }
    }
}
