//! Per-connection state (C3 data model) and the process-wide player-name
//! registry (C4).
//!
//! Grounded on `Server.go`'s `ConnectionData`/`activeConnections` pair: a
//! `sync.Map` keyed by player name there becomes a `DashMap` here, and the
//! ad hoc `sync.RWMutex` per field becomes one `parking_lot::RwLock`
//! guarding the whole mutable half of `ConnectionData`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex as AsyncMutex;

use crate::codec::Packet;
use crate::proxy::ProxyPipe;

/// The client-facing half of a connection, shared between the dialogue
/// handler and (once installed) the target→client forwarder.
pub type ClientWriter = Arc<AsyncMutex<OwnedWriteHalf>>;

#[derive(Default)]
struct Mutable {
    target_ip: String,
    target_port: u16,
    is_fog: bool,
    proxy: Option<Arc<ProxyPipe>>,
    saved_identity_packet: Option<Packet>,
    client_ip: Option<String>,
    old_player_hex: Option<String>,
    new_player_hex: Option<String>,
}

/// Per-accepted-client state (spec §3 `ConnectionData`).
pub struct ConnectionData {
    pub client_writer: ClientWriter,
    pub peer_addr: SocketAddr,
    received_first_map_info: AtomicBool,
    state: RwLock<Mutable>,
}

impl ConnectionData {
    pub fn new(client_writer: ClientWriter, peer_addr: SocketAddr) -> Self {
        Self {
            client_writer,
            peer_addr,
            received_first_map_info: AtomicBool::new(false),
            state: RwLock::new(Mutable::default()),
        }
    }

    pub fn target_addr(&self) -> (String, u16) {
        let s = self.state.read();
        (s.target_ip.clone(), s.target_port)
    }

    pub fn set_target_addr(&self, ip: String, port: u16) {
        let mut s = self.state.write();
        s.target_ip = ip;
        s.target_port = port;
    }

    pub fn is_fog(&self) -> bool {
        self.state.read().is_fog
    }

    pub fn set_is_fog(&self, is_fog: bool) {
        self.state.write().is_fog = is_fog;
    }

    pub fn proxy(&self) -> Option<Arc<ProxyPipe>> {
        self.state.read().proxy.clone()
    }

    /// Installs `proxy` unless one is already installed (idempotent per
    /// spec §3's invariant). Returns `false` if a proxy was already set.
    pub fn install_proxy(&self, proxy: Arc<ProxyPipe>) -> bool {
        let mut s = self.state.write();
        if s.proxy.is_some() {
            return false;
        }
        s.proxy = Some(proxy);
        true
    }

    pub fn take_proxy(&self) -> Option<Arc<ProxyPipe>> {
        self.state.write().proxy.take()
    }

    pub fn saved_identity_packet(&self) -> Option<Packet> {
        self.state.read().saved_identity_packet.clone()
    }

    /// Sets the saved identity packet. The caller (dialogue state machine)
    /// only calls this once, at receipt of the first 160.
    pub fn set_saved_identity_packet(&self, packet: Packet) {
        self.state.write().saved_identity_packet = Some(packet);
    }

    pub fn client_ip(&self) -> Option<String> {
        self.state.read().client_ip.clone()
    }

    pub fn set_client_ip(&self, ip: String) {
        self.state.write().client_ip = Some(ip);
    }

    pub fn player_hex_bookkeeping(&self) -> (Option<String>, Option<String>) {
        let s = self.state.read();
        (s.old_player_hex.clone(), s.new_player_hex.clone())
    }

    pub fn set_player_hex_bookkeeping(&self, old_hex: String, new_hex: String) {
        let mut s = self.state.write();
        s.old_player_hex = Some(old_hex);
        s.new_player_hex = Some(new_hex);
    }

    /// One-shot latch: returns `true` the first time it's called, `false`
    /// on every call after.
    pub fn latch_first_map_info(&self) -> bool {
        self.received_first_map_info
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Process-wide player-name → connection mapping. Insertion of a name that
/// already exists first closes the prior owner's proxy and client socket.
#[derive(Default)]
pub struct Registry {
    by_name: DashMap<String, Arc<ConnectionData>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            by_name: DashMap::new(),
        }
    }

    /// Registers `conn` under `player_name`, evicting and closing any
    /// connection previously registered under that name (unless it's the
    /// same connection, which is a no-op).
    pub async fn register(&self, player_name: &str, conn: Arc<ConnectionData>) {
        let previous = self.by_name.insert(player_name.to_string(), conn.clone());
        if let Some(prev) = previous {
            if !Arc::ptr_eq(&prev, &conn) {
                if let Some(proxy) = prev.take_proxy() {
                    proxy.close().await;
                }
                let mut w = prev.client_writer.lock().await;
                let _ = tokio::io::AsyncWriteExt::shutdown(&mut *w).await;
            }
        }
    }

    /// Removes every entry pointing at `conn` (mirrors the Go original's
    /// linear scan-and-delete on connection teardown).
    pub fn deregister(&self, conn: &Arc<ConnectionData>) {
        self.by_name.retain(|_, v| !Arc::ptr_eq(v, conn));
    }

    pub fn get(&self, player_name: &str) -> Option<Arc<ConnectionData>> {
        self.by_name.get(player_name).map(|e| e.value().clone())
    }

    pub fn find_player_name(&self, conn: &Arc<ConnectionData>) -> Option<String> {
        self.by_name
            .iter()
            .find(|e| Arc::ptr_eq(e.value(), conn))
            .map(|e| e.key().clone())
    }

    /// Weakly-consistent snapshot of every registered connection, used by
    /// the periodic maintenance broadcasts.
    pub fn snapshot(&self) -> Vec<(String, Arc<ConnectionData>)> {
        self.by_name
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn dummy_connection() -> Arc<ConnectionData> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::net::TcpStream::connect(addr).await.unwrap();
        let (_srv, _) = listener.accept().await.unwrap();
        let (_r, w) = client.into_split();
        Arc::new(ConnectionData::new(Arc::new(AsyncMutex::new(w)), addr))
    }

    #[tokio::test]
    async fn latch_fires_once() {
        let conn = dummy_connection().await;
        assert!(conn.latch_first_map_info());
        assert!(!conn.latch_first_map_info());
    }

    #[tokio::test]
    async fn registering_same_name_evicts_prior_owner() {
        let registry = Registry::new();
        let a = dummy_connection().await;
        let b = dummy_connection().await;

        registry.register("Alice", a.clone()).await;
        assert!(registry.get("Alice").is_some());

        registry.register("Alice", b.clone()).await;
        let current = registry.get("Alice").unwrap();
        assert!(Arc::ptr_eq(&current, &b));
    }

    #[tokio::test]
    async fn deregister_removes_only_matching_entries() {
        let registry = Registry::new();
        let a = dummy_connection().await;
        registry.register("Alice", a.clone()).await;
        assert_eq!(registry.len(), 1);
        registry.deregister(&a);
        assert_eq!(registry.len(), 0);
    }
}
