//! End-to-end relay scenarios over real TCP sockets.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use chatbridge_server::chat::{self, ChannelPost};
use chatbridge_server::config::ServerConfig;
use chatbridge_server::listener::StreamServer;
use chatbridge_server::server::RelayServer;

static STATE_SEQ: AtomicU32 = AtomicU32::new(0);

fn temp_state_path() -> PathBuf {
    std::env::temp_dir().join(format!(
        "chatbridge-scenario-{}-{}.toml",
        std::process::id(),
        STATE_SEQ.fetch_add(1, Ordering::Relaxed)
    ))
}

async fn start_hub() -> Result<(
    Arc<RelayServer>,
    StreamServer,
    SocketAddr,
    mpsc::Receiver<ChannelPost>,
)> {
    let (chat_tx, chat_rx) = chat::channel();
    let config = ServerConfig {
        bind: "127.0.0.1".into(),
        port: 0,
        state_path: temp_state_path(),
        surface_name: "Chat".into(),
    };
    let server = RelayServer::new(config, chat_tx)?;
    let streams = StreamServer::new();
    server.initialize(&streams).await;
    let addr = streams.listen("127.0.0.1", 0).await?;
    Ok((server, streams, addr, chat_rx))
}

async fn wait_for_clients(server: &RelayServer, expected: &[&str]) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let names = server.connected_clients().await;
        if names == expected {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("connected clients {names:?}, expected {expected:?}");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

async fn next_post(chat_rx: &mut mpsc::Receiver<ChannelPost>) -> Result<ChannelPost> {
    timeout(Duration::from_secs(5), chat_rx.recv())
        .await
        .context("timed out waiting for a channel post")?
        .context("chat surface channel closed")
}

#[tokio::test]
async fn client_chat_reaches_its_bound_channel() -> Result<()> {
    let (server, _streams, addr, mut chat_rx) = start_hub().await?;
    server.bind_client("Survival", "100").await?;

    let mut sock = TcpStream::connect(addr).await?;
    sock.write_all(b"HSHK::Survival\n").await?;
    sock.write_all(b"MSG::Survival::Alice::hello::\n").await?;

    // The connect notice flows through the same path as any other message.
    let notice = next_post(&mut chat_rx).await?;
    assert_eq!(notice.channel_id, "100");
    assert_eq!(notice.text, "Survival connected");

    let post = next_post(&mut chat_rx).await?;
    assert_eq!(post.channel_id, "100");
    assert_eq!(post.text, "[**Survival**] Alice: hello");
    Ok(())
}

#[tokio::test]
async fn sendable_lines_fan_out_to_peers_but_never_echo() -> Result<()> {
    let (server, _streams, addr, mut chat_rx) = start_hub().await?;

    let mut sock_a = TcpStream::connect(addr).await?;
    sock_a.write_all(b"HSHK::A\n").await?;
    let mut sock_b = TcpStream::connect(addr).await?;
    sock_b.write_all(b"HSHK::B\n").await?;
    wait_for_clients(&server, &["A", "B"]).await?;

    let line = "MSG::A::Alice::ping::\n";
    sock_a.write_all(line.as_bytes()).await?;

    // B receives the unmodified raw line.
    let mut reader_b = BufReader::new(sock_b);
    let mut received = String::new();
    timeout(Duration::from_secs(5), reader_b.read_line(&mut received)).await??;
    assert_eq!(received, line);

    // A gets no echo of its own message.
    let mut reader_a = BufReader::new(sock_a);
    let mut echoed = String::new();
    let echo = timeout(Duration::from_millis(300), reader_a.read_line(&mut echoed)).await;
    assert!(echo.is_err(), "unexpected echo to sender: {echoed:?}");

    // Neither client is bound to a channel, so nothing was posted.
    assert!(chat_rx.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn reconnect_replaces_the_stale_connection() -> Result<()> {
    let (server, _streams, addr, _chat_rx) = start_hub().await?;

    let mut first = TcpStream::connect(addr).await?;
    first.write_all(b"HSHK::A\n").await?;
    wait_for_clients(&server, &["A"]).await?;

    // Second socket presents the same name before the first exits.
    let mut second = TcpStream::connect(addr).await?;
    second.write_all(b"HSHK::A\n").await?;

    // The stale connection's workers are cancelled, closing its socket.
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), first.read(&mut buf)).await??;
    assert_eq!(n, 0, "stale socket should be closed");

    // Exactly one live entry remains for "A".
    wait_for_clients(&server, &["A"]).await?;
    Ok(())
}

#[tokio::test]
async fn degraded_handshake_falls_back_to_peer_address() -> Result<()> {
    let (server, _streams, addr, _chat_rx) = start_hub().await?;

    let mut sock = TcpStream::connect(addr).await?;
    let local = sock.local_addr()?;
    sock.write_all(b"hello there\n").await?;

    wait_for_clients(&server, &[local.to_string().as_str()]).await?;
    Ok(())
}

#[tokio::test]
async fn close_disconnects_clients_and_drops_new_sockets() -> Result<()> {
    let (server, streams, addr, _chat_rx) = start_hub().await?;

    let mut sock = TcpStream::connect(addr).await?;
    sock.write_all(b"HSHK::A\n").await?;
    wait_for_clients(&server, &["A"]).await?;

    server.close(&streams).await;

    // The live connection is torn down without flushing.
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(5), sock.read(&mut buf)).await??;
    assert_eq!(n, 0);
    wait_for_clients(&server, &[]).await?;

    // The listener stays up but drops sockets while no handler is
    // registered.
    let mut rejected = TcpStream::connect(addr).await?;
    let n = timeout(Duration::from_secs(5), rejected.read(&mut buf)).await??;
    assert_eq!(n, 0);
    Ok(())
}

#[tokio::test]
async fn operator_commands_persist_across_restart() -> Result<()> {
    let (chat_tx, _chat_rx) = chat::channel();
    let config = ServerConfig {
        bind: "127.0.0.1".into(),
        port: 0,
        state_path: temp_state_path(),
        surface_name: "Chat".into(),
    };
    let server = RelayServer::new(config.clone(), chat_tx)?;

    server.add_type("ALERT", "! {user}: {content}", true).await?;
    server.bind_client("Survival", "100").await?;
    server.restrict_channel("200", "ALERT", true).await?;
    assert!(server.remove_type("MSG").await.is_err());
    assert!(server.list_types().await.iter().any(|t| t.prefix == "ALERT"));

    // A fresh server loads the same state back, derivations recomputed.
    let (chat_tx2, _chat_rx2) = chat::channel();
    let server2 = RelayServer::new(config, chat_tx2)?;
    let status = server2.status().await;
    assert_eq!(
        status.bindings,
        vec![("Survival".to_string(), "100".to_string())]
    );
    assert_eq!(
        status.restrictions,
        vec![("200".to_string(), "ALERT".to_string(), true)]
    );

    server2.unrestrict_channel("200").await?;
    server2.unbind_client("Survival").await?;
    assert!(server2.status().await.bindings.is_empty());
    Ok(())
}

#[tokio::test]
async fn surface_messages_are_delivered_to_bound_clients() -> Result<()> {
    let (server, _streams, addr, _chat_rx) = start_hub().await?;
    server.bind_client("Survival", "100").await?;

    let mut sock = TcpStream::connect(addr).await?;
    sock.write_all(b"HSHK::Survival\n").await?;
    wait_for_clients(&server, &["Survival"]).await?;

    server.relay_from_channel("100", "Bob", "hi from chat").await;

    let mut reader = BufReader::new(sock);
    let mut line = String::new();
    timeout(Duration::from_secs(5), reader.read_line(&mut line)).await??;
    assert_eq!(line, "MSG::Chat::Bob::hi from chat::\n");
    Ok(())
}
