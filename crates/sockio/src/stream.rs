//! Async iteration over incoming lines and blocks.
//!
//! Both streams end cleanly when the peer closes the connection: a
//! [`SocketError::ConnectionEof`] from the underlying read is the end of the
//! sequence, not an item. Any other failure is yielded once as `Err` and the
//! stream ends after it.
//!
//! The streams consume the client's receive buffer. Interleaving them with
//! other reads on the same client splits the data between both readers.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::Stream;

use crate::client::TcpClient;
use crate::error::{Result, SocketError};

type BoxedStream<'a> = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send + 'a>>;

/// Newline-terminated lines received on a [`TcpClient`].
pub struct LineStream<'a> {
    inner: BoxedStream<'a>,
}

impl<'a> LineStream<'a> {
    /// Stream lines using the client's default timeout for each read.
    pub fn new(client: &'a TcpClient) -> Self {
        Self::with_timeout(client, None)
    }

    /// Stream lines, bounding each individual read by `timeout`.
    pub fn with_timeout(client: &'a TcpClient, timeout: Option<Duration>) -> Self {
        let inner = async_stream::stream! {
            loop {
                match client.readline(timeout).await {
                    Ok(line) => yield Ok(line),
                    Err(SocketError::ConnectionEof) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        };
        Self {
            inner: Box::pin(inner),
        }
    }
}

impl Stream for LineStream<'_> {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

/// Fixed-size blocks received on a [`TcpClient`].
pub struct BlockStream<'a> {
    inner: BoxedStream<'a>,
}

impl<'a> BlockStream<'a> {
    /// Stream `size`-byte blocks using the client's default timeout.
    pub fn new(client: &'a TcpClient, size: usize) -> Self {
        Self::with_timeout(client, size, None)
    }

    /// Stream `size`-byte blocks, bounding each individual read by `timeout`.
    pub fn with_timeout(client: &'a TcpClient, size: usize, timeout: Option<Duration>) -> Self {
        let inner = async_stream::stream! {
            loop {
                match client.readexactly(size, timeout).await {
                    Ok(block) => yield Ok(block),
                    Err(SocketError::ConnectionEof) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        };
        Self {
            inner: Box::pin(inner),
        }
    }
}

impl Stream for BlockStream<'_> {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}
