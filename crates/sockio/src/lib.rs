//! Resilient buffered TCP client for line-protocol devices.
//!
//! `sockio` talks to instruments and servers that speak a request/reply
//! protocol over a plain byte stream, typically newline-terminated text
//! (SCPI and friends):
//!
//! - **Auto-reconnect**: a dropped connection is reopened transparently on
//!   the next operation
//! - **Per-call timeouts**: every operation takes an optional deadline; a
//!   timed-out call leaves the connection and its buffered bytes intact
//! - **Framing**: lines, arbitrary delimiters and fixed-size blocks
//! - **Lifecycle hooks**: connection made, connection lost, EOF received
//!
//! # Quick Start
//!
//! ```ignore
//! use std::time::Duration;
//! use sockio::{TcpClient, TcpClientConfig};
//!
//! let client = TcpClient::new(
//!     TcpClientConfig::new("192.168.1.20", 5025).timeout(Duration::from_secs(1)),
//! );
//!
//! // The first operation opens the connection.
//! let idn = client.write_readline(b"*idn?\n", None).await?;
//!
//! // Several requests in one write, one reply line each.
//! let replies = client
//!     .writelines_readlines([&b"meas:volt?\n"[..], b"meas:curr?\n"], None, None)
//!     .await?;
//! ```
//!
//! ## Streaming
//!
//! ```ignore
//! use futures_util::StreamExt;
//!
//! let mut lines = client.lines();
//! while let Some(line) = lines.next().await {
//!     println!("{:?}", line?);
//! }
//! // The peer closed the connection.
//! ```
//!
//! ## Hooks
//!
//! ```ignore
//! use sockio::{Callbacks, Hook};
//!
//! let callbacks = Callbacks::new()
//!     .on_connection_made(Hook::immediate(|| {
//!         println!("connected");
//!         Ok(())
//!     }))
//!     .on_connection_lost(Hook::suspending(|| async {
//!         notify_operator().await;
//!         Ok(())
//!     }));
//! let client = TcpClient::with_callbacks(config, callbacks);
//! ```
//!
//! Synchronous code can use [`blocking::BlockingTcpClient`] instead.

pub mod blocking;
mod buffer;
mod callback;
mod client;
mod config;
mod error;
mod state;
mod stream;
mod transport;

pub use buffer::ReadBuffer;
pub use callback::{Callbacks, Hook, HookError, HookEvent, HookResult};
pub use client::TcpClient;
pub use config::{TcpClientConfig, TcpSocketConfig};
pub use error::{Result, SocketError};
pub use state::ConnectionState;
pub use stream::{BlockStream, LineStream};
pub use transport::{AsyncReadWrite, BoxStream, Connector, TcpConnector};
