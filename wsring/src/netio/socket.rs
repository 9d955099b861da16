//! Listener creation and the upgraded-socket boundary.
//!
//! The upgrade acceptor binds a TCP listener built with socket2, completes the
//! HTTP handshake, and hands the resulting stream to the event loop as an
//! [`UpgradedSocket`]. The core only ever sees the raw handle and the peer
//! address.

use crate::netio::config::NetIoConfig;
use anyhow::{Context, Result};
use socket2::{Domain, Protocol, SockRef, Socket as Socket2, Type};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};

/// A socket that completed the WebSocket upgrade.
///
/// Dropping the value closes the socket.
pub trait UpgradedSocket: Send + Sync {
    /// The OS handle the readiness multiplexer and the ring operate on.
    fn raw_handle(&self) -> RawFd;

    /// Remote address, when known. Used for logging only.
    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Shut down both directions so a read parked in the kernel completes.
    fn shutdown(&self) {}
}

impl UpgradedSocket for TcpStream {
    fn raw_handle(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }

    fn shutdown(&self) {
        let _ = TcpStream::shutdown(self, Shutdown::Both);
    }
}

/// Create a non-blocking TCP listener for the upgrade acceptor.
pub fn create_listener(bind_addr: SocketAddr, config: &NetIoConfig) -> Result<TcpListener> {
    let domain = match bind_addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };

    let socket =
        Socket2::new(domain, Type::STREAM, Some(Protocol::TCP)).context("creating TCP socket")?;

    socket
        .set_reuse_address(true)
        .context("setting SO_REUSEADDR")?;

    if let SocketAddr::V6(addr) = bind_addr {
        socket
            .set_only_v6(!addr.ip().is_unspecified())
            .context("setting IPV6_V6ONLY")?;
    }

    socket
        .bind(&bind_addr.into())
        .with_context(|| format!("binding TCP socket to {}", bind_addr))?;
    socket
        .listen(config.listen_backlog)
        .with_context(|| format!("listening on {}", bind_addr))?;
    socket
        .set_nonblocking(true)
        .context("setting listener non-blocking")?;

    Ok(socket.into())
}

/// Prepare an upgraded stream for the core.
///
/// The stream is switched back to blocking mode: io_uring returns `EAGAIN`
/// for reads on `O_NONBLOCK` sockets instead of parking them.
pub fn prepare_upgraded(stream: &TcpStream, config: &NetIoConfig) -> Result<()> {
    stream
        .set_nonblocking(false)
        .context("setting upgraded socket blocking")?;
    stream.set_nodelay(true).context("setting TCP_NODELAY")?;

    if let Some(size) = config.socket_recv_buffer_size {
        SockRef::from(stream)
            .set_recv_buffer_size(size)
            .with_context(|| format!("setting SO_RCVBUF to {}", size))?;
    }
    Ok(())
}
