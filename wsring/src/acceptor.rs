//! Upgrade acceptor.
//!
//! Runs on the tokio runtime: accepts TCP connections, completes the HTTP
//! upgrade on each one and then hands the raw stream to the event loop. From
//! that point the connection is served by the epoll and io_uring threads only.

use crate::config::ServerConfig;
use crate::netio::{prepare_upgraded, NetIoConfig, Readiness, Submitter};
use crate::upgrade::{build_rejection, build_response, parse_request, UpgradeRequest};
use crate::worker::{ConnectionId, EventLoop};
use anyhow::{bail, Context, Result};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Per-connection limits applied before the upgrade completes.
#[derive(Debug, Clone)]
pub struct AcceptorSettings {
    pub handshake_timeout: Duration,
    pub max_request_bytes: usize,
    pub netio: NetIoConfig,
}

impl AcceptorSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            handshake_timeout: Duration::from_millis(config.upgrade.handshake_timeout_ms),
            max_request_bytes: config.upgrade.max_request_bytes,
            netio: config.netio.clone(),
        }
    }
}

/// Accept and upgrade connections until `shutdown` is notified.
///
/// Use [`Notify::notify_one`] to stop the loop; the permit is kept if the
/// loop is not waiting at that moment.
pub async fn serve<R, S>(
    listener: TcpListener,
    core: Arc<EventLoop<R, S>>,
    settings: AcceptorSettings,
    shutdown: Arc<Notify>,
) -> Result<()>
where
    R: Readiness + 'static,
    S: Submitter + 'static,
{
    let settings = Arc::new(settings);
    info!(addr = ?listener.local_addr().ok(), "accepting WebSocket upgrades");

    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                info!("acceptor stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        // Usually EMFILE; give closing connections a moment.
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                };
                let core = Arc::clone(&core);
                let settings = Arc::clone(&settings);
                tokio::spawn(async move {
                    match accept_client(stream, peer, &core, &settings).await {
                        Ok(conn_id) => debug!(%peer, conn_id, "upgrade complete"),
                        Err(e) => debug!(%peer, error = %e, "upgrade failed"),
                    }
                });
            }
        }
    }
}

/// Upgrade one client and register it with the event loop.
pub async fn accept_client<R, S>(
    mut stream: TcpStream,
    peer: SocketAddr,
    core: &EventLoop<R, S>,
    settings: &AcceptorSettings,
) -> Result<ConnectionId>
where
    R: Readiness,
    S: Submitter,
{
    let request = tokio::time::timeout(
        settings.handshake_timeout,
        handshake(&mut stream, settings.max_request_bytes),
    )
    .await
    .context("handshake timed out")??;
    debug!(%peer, path = %request.path, origin = ?request.origin, "upgrade request accepted");

    let stream = stream.into_std().context("failed to detach stream from runtime")?;
    prepare_upgraded(&stream, &settings.netio)?;
    let conn_id = core
        .register(Box::new(stream))
        .context("event loop rejected connection")?;
    Ok(conn_id)
}

/// Read the request head and answer it.
///
/// Any bytes after the head are frames the client sent before seeing the
/// 101; the event loop would never see them, so such clients are rejected.
pub async fn handshake(stream: &mut TcpStream, max_request_bytes: usize) -> Result<UpgradeRequest> {
    let mut buf = BytesMut::with_capacity(max_request_bytes.min(1024));
    loop {
        let n = stream.read_buf(&mut buf).await?;
        if n == 0 {
            bail!("connection closed during handshake");
        }
        match parse_request(&buf, max_request_bytes) {
            Ok(Some((request, len))) => {
                if len < buf.len() {
                    let _ = stream
                        .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
                        .await;
                    bail!("{} bytes received before the upgrade response", buf.len() - len);
                }
                stream.write_all(&build_response(&request)).await?;
                return Ok(request);
            }
            Ok(None) => continue,
            Err(e) => {
                let _ = stream.write_all(&build_rejection(&e)).await;
                return Err(e.into());
            }
        }
    }
}
