//! Per-connection handshake state machine (C5), driven by packets received
//! before a proxy pipe is installed.
//!
//! Grounded on `Server.go`'s `processBinaryMessage` pre-proxy branch, with
//! one deliberate behavior change from the original: a `110` only produces
//! the address-prompt `117` once the connection has been identified by a
//! prior `160` (the Go original answers any `110` unconditionally). States
//! are not tracked by an explicit enum; they're derived the same way the
//! Go original effectively derives them, from the fields already on
//! `ConnectionData`:
//!
//! - INIT: `saved_identity_packet` unset.
//! - IDENTIFIED / AWAIT_ADDRESS: `saved_identity_packet` set, `target_ip` empty.
//! - AWAIT_FOG: `target_ip` set, `proxy` unset.
//! - PROXIED: `proxy` set (the caller stops routing packets here once true).

use std::sync::Arc;

use tracing::{info, warn};

use crate::codec::{write_packet, BufferPool, Packet};
use crate::error::Result;
use crate::protocol::constants::*;
use crate::protocol::packets;
use crate::proxy::ProxyPipe;
use crate::registry::{ConnectionData, Registry};

const DEFAULT_PORT: u16 = DEFAULT_RELAY_PORT;

const ADDRESS_PROMPT: &str = "欢迎使用 ShadowPlayer 代理服务器\n\n使用说明：\n1. 请输入需要代理的游戏服务器IP地址\n   格式：IP:端口 或 IP（默认端口5123）\n   例如：192.168.1.1:5123 或 192.168.1.1\n\n2. 然后选择是否需要去雾功能\n   输入 y/yes 启用去雾，输入其他内容禁用\n\n© RELAY-CN Team";

const INVALID_ADDRESS: &str = "IP地址格式无效，请重新输入\n\n正确格式：\nIP:端口（例如：192.168.1.1:5123）\n或仅输入IP（默认端口5123，例如：192.168.1.1）\n\n请重新输入服务器地址：";

const DIAL_FAILED: &str = "代理连接失败\n\n可能的原因：\n目标服务器地址错误\n目标服务器无法访问\n网络连接问题\n\n请检查服务器地址后重试";

/// Handles one pre-proxy packet for `conn`. No-op (per spec) for any type
/// other than 160/110/118.
pub async fn handle_packet(
    conn: &Arc<ConnectionData>,
    registry: &Registry,
    pool: &Arc<BufferPool>,
    packet: Packet,
) -> Result<()> {
    match packet.kind {
        PKT_CLIENT_HELLO => handle_hello(conn, registry, pool, packet).await,
        PKT_LOGIN => {
            let result = handle_login(conn).await;
            pool.put(packet.body);
            result
        }
        PKT_CLIENT_TEXT_INPUT => {
            let result = handle_text_input(conn, registry, pool, &packet).await;
            pool.put(packet.body);
            result
        }
        _ => Ok(()),
    }
}

/// Takes ownership of `packet` on success: it becomes the connection's
/// `saved_identity_packet`, replayed to the target once a proxy is
/// installed. Returned to the pool on the (empty player name) failure path.
async fn handle_hello(
    conn: &Arc<ConnectionData>,
    registry: &Registry,
    pool: &Arc<BufferPool>,
    packet: Packet,
) -> Result<()> {
    let hello = packets::analyze_160(&packet);
    if hello.player_name.is_empty() {
        pool.put(packet.body);
        return Ok(());
    }

    conn.set_saved_identity_packet(packet);
    registry.register(&hello.player_name, conn.clone()).await;
    info!(player = %hello.player_name, "client identified");

    send(conn, &packets::build_161()).await
}

async fn handle_login(conn: &Arc<ConnectionData>) -> Result<()> {
    if conn.saved_identity_packet().is_none() {
        return Ok(());
    }
    send(conn, &packets::build_117(ADDRESS_PROMPT)).await
}

async fn handle_text_input(
    conn: &Arc<ConnectionData>,
    registry: &Registry,
    pool: &Arc<BufferPool>,
    packet: &Packet,
) -> Result<()> {
    let Some(player_name) = registry.find_player_name(conn) else {
        return Ok(());
    };

    let input = packets::analyze_118(packet);
    let (current_ip, _) = conn.target_addr();

    if current_ip.is_empty() {
        return handle_address_input(conn, &player_name, &input).await;
    }

    handle_fog_choice(conn, pool, &player_name, &input).await
}

async fn handle_address_input(conn: &Arc<ConnectionData>, player_name: &str, input: &str) -> Result<()> {
    let (ip, port) = parse_ip_and_port(input);
    if ip.is_empty() {
        return send(conn, &packets::build_117(INVALID_ADDRESS)).await;
    }

    conn.set_target_addr(ip.clone(), port);
    info!(player = %player_name, %ip, port, "target address set");

    let msg = format!(
        "服务器地址设置成功\n\n目标服务器：{ip}:{port}\n\n是否需要启用去雾功能？\n输入 y 或 yes 启用去雾\n输入其他内容（如 n、no）禁用去雾"
    );
    send(conn, &packets::build_117(&msg)).await
}

async fn handle_fog_choice(
    conn: &Arc<ConnectionData>,
    pool: &Arc<BufferPool>,
    player_name: &str,
    input: &str,
) -> Result<()> {
    let lowered = input.trim().to_lowercase();
    let is_fog = lowered == "y" || lowered == "yes";
    conn.set_is_fog(is_fog);
    info!(player = %player_name, is_fog, "fog preference set");

    match ProxyPipe::start(conn.clone(), player_name.to_string(), pool.clone()).await {
        Ok(pipe) => {
            info!(player = %player_name, "proxy started");
            if let Some(saved) = conn.saved_identity_packet() {
                if let Err(e) = pipe.send_packet_to_target(&saved).await {
                    warn!(player = %player_name, error = %e, "failed to replay saved identity packet");
                }
            }
            Ok(())
        }
        Err(e) => {
            warn!(player = %player_name, error = %e, "failed to start proxy");
            send(conn, &packets::build_117(DIAL_FAILED)).await
        }
    }
}

async fn send(conn: &Arc<ConnectionData>, packet: &Packet) -> Result<()> {
    let mut w = conn.client_writer.lock().await;
    write_packet(&mut *w, packet).await
}

/// Splits `input` on the first `:` into `(ip, port)`. The whole string is
/// the host and the port defaults to 5123 when there's no `:`. A
/// non-numeric port also falls back to 5123. Empty input yields `("", 0)`.
fn parse_ip_and_port(input: &str) -> (String, u16) {
    let input = input.trim();
    if input.is_empty() {
        return (String::new(), 0);
    }

    match input.split_once(':') {
        Some((ip, port_str)) => {
            let ip = ip.trim().to_string();
            let port = match port_str.trim().parse::<u16>() {
                Ok(port) => port,
                Err(_) => {
                    warn!(port = %port_str, "failed to parse port, using default");
                    DEFAULT_PORT
                }
            };
            (ip, port)
        }
        None => (input.to_string(), DEFAULT_PORT),
    }
}
