//! Full path over real sockets: HTTP upgrade on the acceptor, then reads
//! through epoll and io_uring into the message handler.
//!
//! Skipped when the kernel does not allow io_uring (some containers).

use bytes::BytesMut;
use crossbeam_channel::{unbounded, Receiver};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use wsring::acceptor::{serve, AcceptorSettings};
use wsring::config::ServerConfig;
use wsring::netio::ReadinessMode;
use wsring::worker::{self, Connection, EventLoopHandle, MessageHandler};
use wsring_proto::{encode_frame, Message, OpCode};

const REQUEST: &str = "GET /ticks HTTP/1.1\r\n\
    Host: localhost\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    Sec-WebSocket-Version: 13\r\n\r\n";

fn io_uring_available() -> bool {
    io_uring::IoUring::new(8).is_ok()
}

fn config(mode: ReadinessMode) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.netio.readiness_mode = mode;
    config.netio.uring_entries = 64;
    config.netio.buffer_pool.capacity = 8;
    config.netio.wait_timeout_ms = 20;
    config
}

fn start(config: &ServerConfig) -> (EventLoopHandle, Receiver<String>) {
    let (tx, rx) = unbounded();
    let handler = move |_conn: &Connection, message: Message| {
        if let Some(text) = message.as_text() {
            let _ = tx.send(text.to_string());
        }
    };
    let handle = worker::spawn(config, Arc::new(handler) as Arc<dyn MessageHandler>).unwrap();
    (handle, rx)
}

async fn upgraded_client(addr: std::net::SocketAddr) -> TcpStream {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(REQUEST.as_bytes()).await.unwrap();
    let mut head = Vec::new();
    while !head.ends_with(b"\r\n\r\n") {
        let mut byte = [0u8; 1];
        assert_eq!(client.read(&mut byte).await.unwrap(), 1);
        head.push(byte[0]);
    }
    assert!(head.starts_with(b"HTTP/1.1 101"));
    client
}

fn text_frame(payload: &str) -> Vec<u8> {
    let mut wire = BytesMut::new();
    encode_frame(&mut wire, true, OpCode::Text, payload.as_bytes(), Some([9, 8, 7, 6]));
    wire.to_vec()
}

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn run_session(mode: ReadinessMode) {
    let config = config(mode);
    let (handle, messages) = start(&config);
    let core = Arc::clone(handle.core());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Arc::new(Notify::new());
    let acceptor = tokio::spawn(serve(
        listener,
        Arc::clone(&core),
        AcceptorSettings::from_config(&config),
        Arc::clone(&shutdown),
    ));

    let mut client = upgraded_client(addr).await;
    client.write_all(&text_frame("first")).await.unwrap();
    let first = tokio::task::spawn_blocking({
        let messages = messages.clone();
        move || messages.recv_timeout(Duration::from_secs(2))
    })
    .await
    .unwrap();
    assert_eq!(first.unwrap(), "first");

    // A frame split across two writes is reassembled.
    let wire = text_frame("second message");
    client.write_all(&wire[..4]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    client.write_all(&wire[4..]).await.unwrap();
    let second = tokio::task::spawn_blocking(move || messages.recv_timeout(Duration::from_secs(2)))
        .await
        .unwrap();
    assert_eq!(second.unwrap(), "second message");
    assert_eq!(core.registry().len(), 1);

    // Peer close removes the connection.
    drop(client);
    assert!(wait_for(|| core.registry().is_empty()).await);
    assert_eq!(core.pool().available(), core.pool().capacity());

    shutdown.notify_one();
    acceptor.await.unwrap().unwrap();
    tokio::task::spawn_blocking(move || handle.shutdown())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_oneshot_session() {
    if !io_uring_available() {
        eprintln!("io_uring unavailable, skipping");
        return;
    }
    run_session(ReadinessMode::Oneshot).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_edge_session() {
    if !io_uring_available() {
        eprintln!("io_uring unavailable, skipping");
        return;
    }
    run_session(ReadinessMode::Edge).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ring_session() {
    if !io_uring_available() {
        eprintln!("io_uring unavailable, skipping");
        return;
    }
    run_session(ReadinessMode::Ring).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_open_connections() {
    if !io_uring_available() {
        eprintln!("io_uring unavailable, skipping");
        return;
    }
    let config = config(ReadinessMode::Oneshot);
    let (handle, _messages) = start(&config);
    let core = Arc::clone(handle.core());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = Arc::new(Notify::new());
    let acceptor = tokio::spawn(serve(
        listener,
        Arc::clone(&core),
        AcceptorSettings::from_config(&config),
        Arc::clone(&shutdown),
    ));

    let mut client = upgraded_client(addr).await;
    assert!(wait_for(|| core.registry().len() == 1).await);

    shutdown.notify_one();
    acceptor.await.unwrap().unwrap();
    let closed = tokio::task::spawn_blocking(move || handle.shutdown())
        .await
        .unwrap();
    assert_eq!(closed, 1);

    // The server side is gone: the client sees end of stream.
    let mut rest = Vec::new();
    let n = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap_or(0);
    assert_eq!(n, 0);
}
