//! End-to-end scenarios driven over real loopback sockets: a fake client,
//! the proxy server under test, and a fake target game server standing in
//! for the relay the proxy connects out to.

use std::io::Cursor;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use ironcore_proxy::codec::{read_packet, write_packet, BufferPool, GameReader, GameWriter, Packet};
use ironcore_proxy::config::Config;
use ironcore_proxy::protocol::constants::*;
use ironcore_proxy::protocol::packets;
use ironcore_proxy::server::Server;

async fn spawn_proxy() -> (SocketAddr, oneshot::Sender<()>) {
    let config = Config { port: 0 };
    let server = Server::bind(&config).await.expect("bind proxy");
    let addr = server.local_addr().expect("local addr");
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        server.serve(async { let _ = rx.await; }).await;
    });
    (addr, tx)
}

fn build_160(player_name: &str, query: Option<&str>) -> Packet {
    let mut w = GameWriter::new(Vec::new());
    w.write_string("client-version-string").unwrap();
    w.write_i32(3).unwrap(); // packet_version
    w.write_i32(1).unwrap(); // client_version
    w.write_bytes(&[0, 0, 0, 0]).unwrap(); // skipped per packet_version >= 1
    w.write_optional_string(query).unwrap();
    w.write_string(player_name).unwrap();
    Packet::new(PKT_CLIENT_HELLO, w.into_inner())
}

fn build_110_stub() -> Packet {
    Packet::new(PKT_LOGIN, Vec::new())
}

fn build_118(text: &str) -> Packet {
    let mut w = GameWriter::new(Vec::new());
    w.write_bytes(&[0, 0, 0, 0, 0]).unwrap(); // skipped header
    w.write_string(text).unwrap();
    Packet::new(PKT_CLIENT_TEXT_INPUT, w.into_inner())
}

fn read_117_message(packet: &Packet) -> String {
    assert_eq!(packet.kind, PKT_CHAT_SYSTEM_PROMPT);
    let mut r = GameReader::new(Cursor::new(packet.body.as_slice()));
    r.skip(5).unwrap();
    r.read_string().unwrap()
}

async fn recv(stream: &mut TcpStream, pool: &BufferPool) -> Packet {
    tokio::time::timeout(Duration::from_secs(5), read_packet(stream, pool))
        .await
        .expect("packet received within deadline")
        .expect("packet decoded")
}

/// Drives a full client through the handshake (hello, address, fog choice)
/// and hands back the live client socket plus the fake target's accepted
/// side of the proxy's outbound connection.
async fn handshake_to_proxied(
    proxy_addr: SocketAddr,
    target_listener: &TcpListener,
    player_name: &str,
    fog_choice: &str,
) -> (TcpStream, TcpStream) {
    let pool = BufferPool::new();
    let mut client = TcpStream::connect(proxy_addr).await.expect("connect to proxy");

    let hello = build_160(player_name, None);
    write_packet(&mut client, &hello).await.unwrap();
    let welcome = recv(&mut client, &pool).await;
    assert_eq!(welcome.kind, PKT_SERVER_HELLO_REPLY);

    write_packet(&mut client, &build_110_stub()).await.unwrap();
    let prompt = recv(&mut client, &pool).await;
    assert!(read_117_message(&prompt).contains("IP"));

    let target_addr = target_listener.local_addr().unwrap();
    let address_line = format!("{}:{}", target_addr.ip(), target_addr.port());
    write_packet(&mut client, &build_118(&address_line)).await.unwrap();
    let confirm = recv(&mut client, &pool).await;
    assert!(read_117_message(&confirm).contains("去雾"));

    write_packet(&mut client, &build_118(fog_choice)).await.unwrap();

    let (target_stream, _) = tokio::time::timeout(Duration::from_secs(5), target_listener.accept())
        .await
        .expect("target accepted connection within deadline")
        .expect("accept succeeded");

    (client, target_stream)
}

#[tokio::test]
async fn full_handshake_activates_proxy_and_replays_saved_hello() {
    let (proxy_addr, _shutdown) = spawn_proxy().await;
    let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let (_client, mut target_stream) =
        handshake_to_proxied(proxy_addr, &target_listener, "Alice", "n").await;

    let pool = BufferPool::new();
    let replayed = recv(&mut target_stream, &pool).await;
    assert_eq!(replayed.kind, PKT_CLIENT_HELLO);
    let hello = packets::analyze_160(&replayed);
    assert_eq!(hello.player_name, "Alice");
}

#[tokio::test]
async fn client_to_target_and_target_to_client_forwarding() {
    let (proxy_addr, _shutdown) = spawn_proxy().await;
    let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let (mut client, mut target_stream) =
        handshake_to_proxied(proxy_addr, &target_listener, "Bob", "n").await;
    let pool = BufferPool::new();
    let _saved_hello = recv(&mut target_stream, &pool).await;

    // Client -> target: an ordinary packet passes through untouched.
    let chat_out = packets::build_141("hi there", Some("Bob"), 0);
    write_packet(&mut client, &chat_out).await.unwrap();
    let forwarded = recv(&mut target_stream, &pool).await;
    assert_eq!(forwarded.kind, PKT_CHAT_BROADCAST);

    // Target -> client: same, in the other direction.
    let reply = packets::build_141("welcome", Some("SERVER"), 5);
    write_packet(&mut target_stream, &reply).await.unwrap();
    let received = recv(&mut client, &pool).await;
    assert_eq!(received.kind, PKT_CHAT_BROADCAST);
}

#[tokio::test]
async fn target_ping_request_is_answered_without_reaching_client() {
    let (proxy_addr, _shutdown) = spawn_proxy().await;
    let target_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let (mut client, mut target_stream) =
        handshake_to_proxied(proxy_addr, &target_listener, "Carol", "n").await;
    let pool = BufferPool::new();
    let _saved_hello = recv(&mut target_stream, &pool).await;

    write_packet(&mut target_stream, &packets::build_108()).await.unwrap();
    let reply = recv(&mut target_stream, &pool).await;
    assert_eq!(reply.kind, PKT_PING_REPLY);

    // Confirm no 108 ever reaches the client: a subsequent real message
    // should be the very next packet the client sees.
    write_packet(&mut target_stream, &packets::build_141("still alive", None, 0))
        .await
        .unwrap();
    let next = recv(&mut client, &pool).await;
    assert_eq!(next.kind, PKT_CHAT_BROADCAST);
}

#[tokio::test]
async fn login_before_hello_produces_no_address_prompt() {
    let (proxy_addr, _shutdown) = spawn_proxy().await;
    let pool = BufferPool::new();
    let mut client = TcpStream::connect(proxy_addr).await.expect("connect to proxy");

    // A 110 with no preceding 160 must not produce a 117 address prompt:
    // this is the documented divergence from the original unconditional
    // 110 handling (see dialogue.rs module docs).
    write_packet(&mut client, &build_110_stub()).await.unwrap();

    // Follow up with a packet the server *does* respond to, to prove the
    // connection is still alive and simply never answered the 110.
    let hello = build_160("Dana", None);
    write_packet(&mut client, &hello).await.unwrap();
    let reply = recv(&mut client, &pool).await;
    assert_eq!(reply.kind, PKT_SERVER_HELLO_REPLY);
}
