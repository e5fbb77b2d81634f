//! Configuration types for the socket client.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SocketError};

/// Minimize-delay type of service, the default for instrument links.
pub const IPTOS_LOWDELAY: u32 = 0x10;

/// Socket-level options applied by [`TcpConnector`](crate::TcpConnector).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpSocketConfig {
    /// Enable TCP_NODELAY (disable Nagle's algorithm).
    pub no_delay: bool,
    /// Enable SO_KEEPALIVE.
    pub keep_alive: bool,
    /// Idle time before the first keep-alive probe. Only used with `keep_alive`.
    pub keep_alive_idle: Option<Duration>,
    /// Time between keep-alive probes.
    pub keep_alive_interval: Option<Duration>,
    /// Unanswered probes before the connection is dropped. Ignored on Windows.
    pub keep_alive_retries: Option<u32>,
    /// IP type-of-service byte for IPv4 connections. `None` keeps the OS default.
    pub tos: Option<u32>,
    /// Maximum number of bytes pulled from the transport in a single read.
    pub read_buffer_size: usize,
}

impl Default for TcpSocketConfig {
    fn default() -> Self {
        Self {
            no_delay: true,
            keep_alive: false,
            keep_alive_idle: None,
            keep_alive_interval: None,
            keep_alive_retries: None,
            tos: Some(IPTOS_LOWDELAY),
            read_buffer_size: 16 * 1024,
        }
    }
}

impl TcpSocketConfig {
    /// Create a new socket configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable TCP_NODELAY.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = enabled;
        self
    }

    /// Enable or disable keep-alive probes.
    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.keep_alive = enabled;
        self
    }

    /// Set the keep-alive idle time. Also enables keep-alive.
    pub fn keep_alive_idle(mut self, idle: Duration) -> Self {
        self.keep_alive = true;
        self.keep_alive_idle = Some(idle);
        self
    }

    /// Set the keep-alive probe interval. Also enables keep-alive.
    pub fn keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive = true;
        self.keep_alive_interval = Some(interval);
        self
    }

    /// Set the keep-alive probe count. Also enables keep-alive.
    pub fn keep_alive_retries(mut self, retries: u32) -> Self {
        self.keep_alive = true;
        self.keep_alive_retries = Some(retries);
        self
    }

    /// Set the IPv4 type-of-service byte.
    pub fn tos(mut self, tos: u32) -> Self {
        self.tos = Some(tos);
        self
    }

    /// Leave the type-of-service byte at the OS default.
    pub fn no_tos(mut self) -> Self {
        self.tos = None;
        self
    }

    /// Set the transport read chunk size. Zero is clamped to one byte.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(1);
        self
    }
}

/// Configuration for a [`TcpClient`](crate::TcpClient).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpClientConfig {
    /// The host to connect to.
    pub host: String,
    /// The port to connect to.
    pub port: u16,
    /// Transparently reopen a dropped connection on the next operation.
    pub auto_reconnect: bool,
    /// Bound on connect attempts. `None` blocks until the transport gives up.
    pub connection_timeout: Option<Duration>,
    /// Default bound on read/write operations. `None` means no timeout.
    pub timeout: Option<Duration>,
    /// Socket-level options.
    pub socket: TcpSocketConfig,
}

impl TcpClientConfig {
    /// Create a new client configuration.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            auto_reconnect: true,
            connection_timeout: None,
            timeout: None,
            socket: TcpSocketConfig::default(),
        }
    }

    /// Enable or disable auto-reconnect.
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the connect timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// Disable the connect timeout.
    pub fn no_connection_timeout(mut self) -> Self {
        self.connection_timeout = None;
        self
    }

    /// Set the default timeout for read/write operations.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Disable the default operation timeout.
    pub fn no_timeout(mut self) -> Self {
        self.timeout = None;
        self
    }

    /// Set socket options.
    pub fn socket_config(mut self, config: TcpSocketConfig) -> Self {
        self.socket = config;
        self
    }

    /// Enable TCP_NODELAY.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.socket.no_delay = enabled;
        self
    }

    /// Enable keep-alive probes.
    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.socket.keep_alive = enabled;
        self
    }

    /// Get the address string (host:port).
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Parse a configuration from TOML text.
    ///
    /// ```toml
    /// host = "192.168.1.20"
    /// port = 5025
    /// connection_timeout = 1.5   # seconds
    /// timeout = 0.5
    ///
    /// [socket]
    /// no_delay = true
    /// tos = 16                   # 0 leaves the OS default
    /// keep_alive = true
    /// keep_alive_idle = 30       # seconds
    /// keep_alive_interval = 5
    /// keep_alive_retries = 3
    /// ```
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(text)?;
        file.try_into()
    }

    /// Load a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| SocketError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }
}

/// On-disk layout of a client configuration.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    host: String,
    port: u16,
    #[serde(default = "default_auto_reconnect")]
    auto_reconnect: bool,
    connection_timeout: Option<f64>,
    timeout: Option<f64>,
    #[serde(default)]
    socket: SocketSection,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct SocketSection {
    #[serde(default = "default_no_delay")]
    no_delay: bool,
    #[serde(default)]
    keep_alive: bool,
    keep_alive_idle: Option<f64>,
    keep_alive_interval: Option<f64>,
    keep_alive_retries: Option<u32>,
    tos: Option<u32>,
    read_buffer_size: Option<usize>,
}

impl Default for SocketSection {
    fn default() -> Self {
        Self {
            no_delay: default_no_delay(),
            keep_alive: false,
            keep_alive_idle: None,
            keep_alive_interval: None,
            keep_alive_retries: None,
            tos: None,
            read_buffer_size: None,
        }
    }
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_no_delay() -> bool {
    true
}

fn seconds(field: &str, value: Option<f64>) -> Result<Option<Duration>> {
    value
        .map(|secs| {
            Duration::try_from_secs_f64(secs)
                .map_err(|e| SocketError::Config(format!("invalid {field} {secs}: {e}")))
        })
        .transpose()
}

impl TryFrom<ConfigFile> for TcpClientConfig {
    type Error = SocketError;

    fn try_from(file: ConfigFile) -> Result<Self> {
        let mut socket = TcpSocketConfig::new()
            .no_delay(file.socket.no_delay)
            .keep_alive(file.socket.keep_alive);
        if let Some(size) = file.socket.read_buffer_size {
            socket = socket.read_buffer_size(size);
        }
        if let Some(idle) = seconds("keep_alive_idle", file.socket.keep_alive_idle)? {
            socket = socket.keep_alive_idle(idle);
        }
        if let Some(interval) = seconds("keep_alive_interval", file.socket.keep_alive_interval)? {
            socket = socket.keep_alive_interval(interval);
        }
        if let Some(retries) = file.socket.keep_alive_retries {
            socket = socket.keep_alive_retries(retries);
        }
        match file.socket.tos {
            Some(0) => socket = socket.no_tos(),
            Some(tos) => socket = socket.tos(tos),
            None => {}
        }

        Ok(Self {
            host: file.host,
            port: file.port,
            auto_reconnect: file.auto_reconnect,
            connection_timeout: seconds("connection_timeout", file.connection_timeout)?,
            timeout: seconds("timeout", file.timeout)?,
            socket,
        })
    }
}
