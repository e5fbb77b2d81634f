//! Transport seam: how a client obtains a raw byte stream.
//!
//! The client only needs something it can read from, write to and drop.
//! [`TcpConnector`] is the default and opens a tokio `TcpStream` with the
//! configured socket options. Other connectors can be injected with
//! [`TcpClient::with_connector`](crate::TcpClient::with_connector).

use std::io;

use futures_util::future::BoxFuture;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream, lookup_host};

use crate::config::TcpSocketConfig;

/// Combined trait for async read + write.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// A connected, type-erased byte stream.
pub type BoxStream = Box<dyn AsyncReadWrite + Send + Unpin>;

/// Opens byte-stream connections to `host:port`.
///
/// Implementations only establish the stream; framing, timeouts and the
/// connection lifecycle stay with the client.
pub trait Connector: Send + Sync + 'static {
    /// Connect to the given endpoint.
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<BoxStream>>;
}

/// Default connector producing plain TCP streams.
#[derive(Clone, Debug, Default)]
pub struct TcpConnector {
    socket: TcpSocketConfig,
}

impl TcpConnector {
    /// Create a connector applying the given socket options.
    pub fn new(socket: TcpSocketConfig) -> Self {
        Self { socket }
    }

    async fn open(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let mut last_error = None;

        for addr in lookup_host((host, port)).await? {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_keepalive(self.socket.keep_alive)?;
            self.apply_options(&socket, addr.is_ipv4())?;

            match socket.connect(addr).await {
                Ok(stream) => {
                    stream.set_nodelay(self.socket.no_delay)?;
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("could not resolve '{host}:{port}'"),
            )
        }))
    }
}

impl TcpConnector {
    /// Apply the options tokio does not expose: keep-alive timings and TOS.
    fn apply_options(&self, socket: &TcpSocket, ipv4: bool) -> io::Result<()> {
        let sock = SockRef::from(socket);

        if self.socket.keep_alive
            && let Some(keepalive) = self.keepalive_params()
        {
            sock.set_tcp_keepalive(&keepalive)?;
        }

        #[cfg(not(any(
            target_os = "fuchsia",
            target_os = "redox",
            target_os = "solaris",
            target_os = "illumos"
        )))]
        if ipv4
            && let Some(tos) = self.socket.tos
            && let Err(e) = sock.set_tos(tos)
        {
            tracing::debug!("cannot set IP_TOS {tos:#04x}: {e}");
        }
        #[cfg(any(
            target_os = "fuchsia",
            target_os = "redox",
            target_os = "solaris",
            target_os = "illumos"
        ))]
        let _ = ipv4;

        Ok(())
    }

    fn keepalive_params(&self) -> Option<TcpKeepalive> {
        let config = &self.socket;
        if config.keep_alive_idle.is_none()
            && config.keep_alive_interval.is_none()
            && config.keep_alive_retries.is_none()
        {
            return None;
        }

        let mut params = TcpKeepalive::new();
        if let Some(idle) = config.keep_alive_idle {
            params = params.with_time(idle);
        }
        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd",
            windows
        ))]
        if let Some(interval) = config.keep_alive_interval {
            params = params.with_interval(interval);
        }
        #[cfg(any(
            target_os = "linux",
            target_os = "android",
            target_os = "macos",
            target_os = "ios",
            target_os = "freebsd",
            target_os = "netbsd"
        ))]
        if let Some(retries) = config.keep_alive_retries {
            params = params.with_retries(retries);
        }
        Some(params)
    }
}

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<BoxStream>> {
        Box::pin(async move {
            let stream = self.open(host, port).await?;
            Ok(Box::new(stream) as BoxStream)
        })
    }
}
